//! Trade execution against the LMSR market maker.
//!
//! `plan_trade` decides everything about a trade from already-locked rows and
//! is pure; `execute_trade` takes the locks, plans, and writes the plan through
//! `DbAdapter::apply_trade`, the same write path liquidation uses.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument};

use crate::allowance::grant_allowance_tx;
use crate::config::Config;
use crate::db_adapter::{AppliedTrade, DbAdapter};
use crate::error::{EngineError, Result};
use crate::lmsr_core::Side;
use crate::models::{
    AmountType, MarketId, MarketRecord, Position, Quote, TradeBan, TradeKind, TradeRequest,
    TradeResult, UserId,
};
use crate::money::{credits_to_cents, format_credits};
use crate::trade_sizer::{cost_cents_for_delta, max_shares_for_budget};

/// Slack allowed when comparing a sell against the held quantity.
pub const SHARE_TOLERANCE: f64 = 1e-9;

/// A fully validated trade, ready to be written.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TradePlan {
    pub side: Side,
    pub kind: TradeKind,
    /// positive = buy, negative = sell
    pub delta_shares: f64,
    /// positive = user pays, negative = user receives
    pub cost_cents: i64,
}

/// Shape checks that need no state; run before any lock is taken.
pub fn validate_request(request: &TradeRequest) -> Result<()> {
    if !request.amount.is_finite() || request.amount <= 0.0 {
        return Err(EngineError::InvalidInput(
            "amount must be a positive number".to_string(),
        ));
    }
    if request.kind == TradeKind::Sell && request.amount_type != AmountType::Shares {
        return Err(EngineError::InvalidInput(
            "selling requires the SHARES amount type".to_string(),
        ));
    }
    Ok(())
}

/// Decide a trade from the locked market, position and balance.
pub fn plan_trade(
    market: &MarketRecord,
    position: &Position,
    balance_cents: i64,
    request: &TradeRequest,
    ban: TradeBan,
    now: DateTime<Utc>,
) -> Result<TradePlan> {
    validate_request(request)?;
    market.ensure_tradable(now)?;

    let side = request.side;
    if request.kind == TradeKind::Buy && ban.blocks(side) {
        return Err(EngineError::Forbidden(format!(
            "buying {} is not allowed for involved users of market {}",
            side, market.id
        )));
    }

    let lmsr = market.lmsr();
    let delta_shares = match (request.kind, request.amount_type) {
        (TradeKind::Buy, AmountType::Shares) => request.amount,
        (TradeKind::Buy, AmountType::Credits) => {
            let budget_cents = credits_to_cents(request.amount);
            if budget_cents <= 0 {
                return Err(EngineError::TradeTooSmall(
                    "budget rounds to zero cents".to_string(),
                ));
            }
            let shares = max_shares_for_budget(&lmsr, side, budget_cents);
            if shares <= 0.0 {
                return Err(EngineError::TradeTooSmall(format!(
                    "{} buys no shares",
                    format_credits(budget_cents)
                )));
            }
            shares
        }
        (TradeKind::Sell, _) => {
            let held = position.shares(side);
            if held + SHARE_TOLERANCE < request.amount {
                return Err(EngineError::InsufficientShares {
                    requested: request.amount,
                    held,
                });
            }
            -request.amount.min(held)
        }
    };

    let cost_cents = cost_cents_for_delta(&lmsr, side, delta_shares);
    match request.kind {
        TradeKind::Buy if cost_cents <= 0 => {
            return Err(EngineError::TradeTooSmall(
                "trade costs less than one cent".to_string(),
            ));
        }
        TradeKind::Sell if cost_cents >= 0 => {
            return Err(EngineError::TradeTooSmall("nothing to receive".to_string()));
        }
        _ => {}
    }

    if request.kind == TradeKind::Buy && balance_cents < cost_cents {
        return Err(EngineError::InsufficientFunds {
            required_cents: cost_cents,
            available_cents: balance_cents,
        });
    }

    debug!(
        market_id = market.id,
        side = %side,
        delta_shares,
        cost_cents,
        "planned trade"
    );
    Ok(TradePlan {
        side,
        kind: request.kind,
        delta_shares,
        cost_cents,
    })
}

/// Execute a buy or sell for `user_id` as one locked transaction.
///
/// Any allowance that has come due is granted first, under the same user lock.
#[instrument(skip(pool, config))]
pub async fn execute_trade(
    pool: &PgPool,
    config: &Config,
    user_id: UserId,
    request: TradeRequest,
) -> Result<TradeResult> {
    validate_request(&request)?;

    with_locked_tx!(pool, config, tx, {
        execute_trade_transaction(&mut tx, config, user_id, &request).await
    })
}

async fn execute_trade_transaction(
    tx: &mut Transaction<'_, Postgres>,
    config: &Config,
    user_id: UserId,
    request: &TradeRequest,
) -> Result<TradeResult> {
    let now = Utc::now();

    let account = DbAdapter::lock_user(tx, user_id).await?;
    let allowance = grant_allowance_tx(tx, &account, config, now).await?;
    let balance_cents = account.balance_cents + allowance.credited_cents();

    let market = DbAdapter::lock_market(tx, request.market_id).await?;
    let ban = DbAdapter::fetch_trade_ban(&mut **tx, market.id, user_id).await?;
    let position = DbAdapter::lock_position(tx, user_id, market.id).await?;

    let plan = plan_trade(&market, &position, balance_cents, request, ban, now)?;
    let applied = apply_plan(tx, user_id, &market, &plan).await?;

    info!(
        user_id,
        market_id = market.id,
        kind = %plan.kind,
        side = %plan.side,
        delta_shares = plan.delta_shares,
        cost = %format_credits(plan.cost_cents),
        price_yes = applied.market.price_yes(),
        "trade executed"
    );

    Ok(TradeResult {
        market: applied.market.snapshot(),
        trade: applied.trade,
        balance_cents: applied.balance_cents,
        position: applied.position,
        allowance,
    })
}

/// Write a plan. Caller holds the user, market and position locks.
pub(crate) async fn apply_plan(
    tx: &mut Transaction<'_, Postgres>,
    user_id: UserId,
    market: &MarketRecord,
    plan: &TradePlan,
) -> Result<AppliedTrade> {
    DbAdapter::apply_trade(
        tx,
        user_id,
        market,
        plan.side,
        plan.delta_shares,
        plan.cost_cents,
    )
    .await
}

/// Price a hypothetical trade without locking. The answer may be stale by the
/// time a trade is placed.
pub async fn quote(
    pool: &PgPool,
    market_id: MarketId,
    side: Side,
    delta_shares: f64,
) -> Result<Quote> {
    if !delta_shares.is_finite() || delta_shares == 0.0 {
        return Err(EngineError::InvalidInput(
            "delta_shares must be a non-zero number".to_string(),
        ));
    }

    let market = DbAdapter::fetch_market(pool, market_id)
        .await?
        .ok_or_else(|| EngineError::not_found("market", market_id))?;
    Ok(quote_market(&market, side, delta_shares))
}

pub fn quote_market(market: &MarketRecord, side: Side, delta_shares: f64) -> Quote {
    let lmsr = market.lmsr();
    Quote {
        market_id: market.id,
        side,
        delta_shares,
        cost_cents: cost_cents_for_delta(&lmsr, side, delta_shares),
        price_yes_before: lmsr.price_yes(),
        price_yes_after: lmsr.shifted(side, delta_shares).price_yes(),
    }
}
