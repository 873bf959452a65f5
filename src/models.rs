//! Persisted entities and the inputs/outputs of the core operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::lmsr_core::{self, Side};

pub type UserId = i32;
pub type MarketId = i32;
pub type TradeId = i64;

/// Resolved outcome of a market; a binary market resolves to one of its sides.
pub type Outcome = Side;

/// Parse a TEXT column holding one of our enum spellings.
pub(crate) fn parse_column<T: FromStr<Err = String>>(column: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|e| EngineError::Internal(format!("bad value in column {}: {}", column, e)))
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!("invalid {}: '{}'", stringify!($name), s)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
}
text_enum!(MarketStatus { Open => "OPEN", Closed => "CLOSED", Resolved => "RESOLVED" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeKind {
    Buy,
    Sell,
}
text_enum!(TradeKind { Buy => "BUY", Sell => "SELL" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AmountType {
    Credits,
    Shares,
}
text_enum!(AmountType { Credits => "CREDITS", Shares => "SHARES" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LedgerEntryType {
    Trade,
    Payout,
    Allowance,
}
text_enum!(LedgerEntryType { Trade => "TRADE", Payout => "PAYOUT", Allowance => "ALLOWANCE" });

/// Which side an involved user is barred from buying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeBan {
    #[default]
    None,
    Yes,
    No,
    All,
}
text_enum!(TradeBan { None => "NONE", Yes => "YES", No => "NO", All => "ALL" });

impl TradeBan {
    pub fn blocks(&self, side: Side) -> bool {
        match self {
            TradeBan::None => false,
            TradeBan::All => true,
            TradeBan::Yes => side == Side::Yes,
            TradeBan::No => side == Side::No,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SuggestionStatus {
    Pending,
    Used,
    Rejected,
}
text_enum!(SuggestionStatus { Pending => "PENDING", Used => "USED", Rejected => "REJECTED" });

/// Identity handed to the core once the outer layer has authenticated a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketRecord {
    pub id: MarketId,
    pub title: String,
    pub description: String,
    pub rules: String,
    pub closes_at: DateTime<Utc>,
    pub resolves_at: DateTime<Utc>,
    pub status: MarketStatus,
    pub outcome: Option<Outcome>,
    pub b: f64,
    pub q_yes: f64,
    pub q_no: f64,
    pub volume_cents: i64,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl MarketRecord {
    pub fn lmsr(&self) -> lmsr_core::Market {
        lmsr_core::Market::new(self.q_yes, self.q_no, self.b)
    }

    pub fn price_yes(&self) -> f64 {
        lmsr_core::price_yes(self.q_yes, self.q_no, self.b)
    }

    pub fn is_resolved(&self) -> bool {
        self.status == MarketStatus::Resolved || self.outcome.is_some()
    }

    /// Trading is allowed only while OPEN and strictly before `closes_at`.
    pub fn is_tradable(&self, now: DateTime<Utc>) -> bool {
        self.status == MarketStatus::Open && !self.is_resolved() && now < self.closes_at
    }

    pub fn ensure_tradable(&self, now: DateTime<Utc>) -> Result<()> {
        if self.is_resolved() {
            return Err(EngineError::InvalidState(format!(
                "market {} is already resolved",
                self.id
            )));
        }
        if self.status != MarketStatus::Open || now >= self.closes_at {
            return Err(EngineError::InvalidState(format!(
                "trading is closed for market {}",
                self.id
            )));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot {
            id: self.id,
            q_yes: self.q_yes,
            q_no: self.q_no,
            price_yes: self.price_yes(),
            volume_cents: self.volume_cents,
        }
    }
}

/// Market inventory after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub id: MarketId,
    pub q_yes: f64,
    pub q_no: f64,
    pub price_yes: f64,
    pub volume_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub user_id: UserId,
    pub market_id: MarketId,
    pub shares_yes: f64,
    pub shares_no: f64,
    pub cost_cents_yes: i64,
    pub cost_cents_no: i64,
}

impl Position {
    pub fn empty(user_id: UserId, market_id: MarketId) -> Self {
        Self {
            user_id,
            market_id,
            shares_yes: 0.0,
            shares_no: 0.0,
            cost_cents_yes: 0,
            cost_cents_no: 0,
        }
    }

    pub fn shares(&self, side: Side) -> f64 {
        match side {
            Side::Yes => self.shares_yes,
            Side::No => self.shares_no,
        }
    }

    /// Same additive update the store applies on upsert.
    pub fn apply(&mut self, side: Side, delta_shares: f64, cost_cents: i64) {
        match side {
            Side::Yes => {
                self.shares_yes += delta_shares;
                self.cost_cents_yes += cost_cents;
            }
            Side::No => {
                self.shares_no += delta_shares;
                self.cost_cents_no += cost_cents;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: UserId,
    pub username: String,
    pub is_admin: bool,
    pub balance_cents: i64,
    pub last_allowance_ym: Option<i32>,
    pub last_allowance_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.id,
            is_admin: self.is_admin,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub id: TradeId,
    pub user_id: UserId,
    pub market_id: MarketId,
    pub side: Side,
    /// positive = bought, negative = sold
    pub delta_shares: f64,
    /// positive = user paid, negative = user received
    pub cost_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: UserId,
    pub market_id: Option<MarketId>,
    pub entry_type: LedgerEntryType,
    pub amount_cents: i64,
    pub ref_trade_id: Option<TradeId>,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub market_id: MarketId,
    pub side: Side,
    pub kind: TradeKind,
    pub amount_type: AmountType,
    /// credits for `AmountType::Credits`, shares for `AmountType::Shares`
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeResult {
    pub trade: Trade,
    pub market: MarketSnapshot,
    pub balance_cents: i64,
    pub position: Position,
    pub allowance: crate::allowance::AllowanceResult,
}

/// Read-only pricing preview; computed without locks and may be stale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quote {
    pub market_id: MarketId,
    pub side: Side,
    pub delta_shares: f64,
    pub cost_cents: i64,
    pub price_yes_before: f64,
    pub price_yes_after: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvolvedUser {
    pub user_id: UserId,
    #[serde(default)]
    pub ban: TradeBan,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMarket {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub rules: String,
    pub closes_at: DateTime<Utc>,
    pub resolves_at: DateTime<Utc>,
    pub b: Option<f64>,
    pub initial_probability: Option<f64>,
    #[serde(default)]
    pub involved_users: Vec<InvolvedUser>,
    pub suggestion_id: Option<i32>,
}

/// Admin edit of a market; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketEdit {
    pub title: Option<String>,
    pub description: Option<String>,
    pub rules: Option<String>,
    pub closes_at: Option<DateTime<Utc>>,
    pub resolves_at: Option<DateTime<Utc>>,
    pub involved_users: Option<Vec<InvolvedUser>>,
}

impl MarketEdit {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.rules.is_none()
            && self.closes_at.is_none()
            && self.resolves_at.is_none()
            && self.involved_users.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionSummary {
    pub market_id: MarketId,
    pub outcome: Outcome,
    pub winners: usize,
    pub total_payout_cents: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LiquidationSummary {
    pub user_id: UserId,
    pub positions_unwound: usize,
    pub positions_skipped: usize,
    pub proceeds_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub id: i32,
    pub title: String,
    pub details: String,
    pub status: SuggestionStatus,
    pub created_by: UserId,
    pub market_id: Option<MarketId>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}
