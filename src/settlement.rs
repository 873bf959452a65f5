//! Market resolution, position liquidation and account deletion.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

use crate::accounts::require_admin;
use crate::config::Config;
use crate::db_adapter::{DbAdapter, LedgerPosting};
use crate::error::{EngineError, Result};
use crate::lmsr_core::Side;
use crate::models::{
    LedgerEntryType, LiquidationSummary, MarketId, MarketRecord, Outcome, Position, Principal,
    ResolutionSummary, TradeKind, UserId,
};
use crate::money::{credits_to_cents, format_credits};
use crate::trade_sizer::cost_cents_for_delta;
use crate::trading::{apply_plan, TradePlan};

pub const MAX_RESOLUTION_NOTE_LEN: usize = 2000;

/// Holdings below this are treated as empty.
pub const DUST_SHARES: f64 = 1e-9;

/// Payout in cents for `shares` winning shares; each pays one credit.
pub fn payout_cents(shares: f64) -> i64 {
    if shares > 0.0 {
        credits_to_cents(shares)
    } else {
        0
    }
}

/// Resolve a market and pay every holder of the winning side.
///
/// Without `force` the market must have passed `closes_at`. The status flip and
/// every payout commit together.
#[instrument(skip(pool, config, note))]
pub async fn resolve_market(
    pool: &PgPool,
    config: &Config,
    admin: Principal,
    market_id: MarketId,
    outcome: Outcome,
    force: bool,
    note: Option<String>,
) -> Result<ResolutionSummary> {
    let note = note.map(|n| n.trim().to_string()).unwrap_or_default();
    if note.chars().count() > MAX_RESOLUTION_NOTE_LEN {
        return Err(EngineError::InvalidInput(format!(
            "note must be at most {} characters",
            MAX_RESOLUTION_NOTE_LEN
        )));
    }

    with_locked_tx!(pool, config, tx, {
        resolve_market_transaction(&mut tx, &admin, market_id, outcome, force, &note).await
    })
}

async fn resolve_market_transaction(
    tx: &mut Transaction<'_, Postgres>,
    admin: &Principal,
    market_id: MarketId,
    outcome: Outcome,
    force: bool,
    note: &str,
) -> Result<ResolutionSummary> {
    require_admin(tx, admin).await?;
    let now = Utc::now();

    // Winners are credited, so their user rows must be locked before the market
    let candidates: Vec<UserId> = DbAdapter::fetch_market_positions(&mut **tx, market_id)
        .await?
        .iter()
        .filter(|p| p.shares(outcome) > 0.0)
        .map(|p| p.user_id)
        .collect();
    let locked: BTreeSet<UserId> = DbAdapter::lock_users(tx, &candidates)
        .await?
        .into_iter()
        .collect();

    let market = DbAdapter::lock_market(tx, market_id).await?;
    if market.is_resolved() {
        return Err(EngineError::InvalidState(format!(
            "market {} is already resolved",
            market_id
        )));
    }
    if !force && now < market.closes_at {
        return Err(EngineError::InvalidState(format!(
            "market {} must be closed before resolving",
            market_id
        )));
    }

    let positions = DbAdapter::lock_market_positions(tx, market_id).await?;
    let winners: Vec<&Position> = positions.iter().filter(|p| p.shares(outcome) > 0.0).collect();
    if let Some(late) = winners.iter().find(|p| !locked.contains(&p.user_id)) {
        return Err(EngineError::Conflict(format!(
            "user {} entered market {} while resolving",
            late.user_id, market_id
        )));
    }

    DbAdapter::mark_resolved(tx, market_id, outcome, now).await?;

    let mut total_payout_cents = 0;
    let mut paid = 0;
    for winner in &winners {
        let amount_cents = payout_cents(winner.shares(outcome));
        if amount_cents == 0 {
            continue;
        }
        DbAdapter::post_to_ledger(
            tx,
            LedgerPosting {
                user_id: winner.user_id,
                market_id: Some(market_id),
                entry_type: LedgerEntryType::Payout,
                amount_cents,
                ref_trade_id: None,
                note,
            },
        )
        .await?;
        total_payout_cents += amount_cents;
        paid += 1;
    }

    info!(
        market_id,
        outcome = %outcome,
        winners = paid,
        total = %format_credits(total_payout_cents),
        "market resolved"
    );
    Ok(ResolutionSummary {
        market_id,
        outcome,
        winners: paid,
        total_payout_cents,
    })
}

/// How one side of a position is unwound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Unwind {
    Nothing,
    /// Too small to be worth a cent; shares are cleared without moving money.
    Dust(TradePlan),
    Sell(TradePlan),
}

/// Plan selling the whole `held` quantity of `side` at the market's current state.
pub fn plan_unwind(market: &MarketRecord, side: Side, held: f64) -> Unwind {
    if held <= 0.0 {
        return Unwind::Nothing;
    }
    let delta_shares = -held;
    if held < DUST_SHARES {
        return Unwind::Dust(TradePlan {
            side,
            kind: TradeKind::Sell,
            delta_shares,
            cost_cents: 0,
        });
    }

    let cost_cents = cost_cents_for_delta(&market.lmsr(), side, delta_shares);
    let plan = TradePlan {
        side,
        kind: TradeKind::Sell,
        delta_shares,
        cost_cents: cost_cents.min(0),
    };
    if cost_cents < 0 {
        Unwind::Sell(plan)
    } else {
        Unwind::Dust(plan)
    }
}

/// Sell every live position the user holds, inside the caller's transaction.
///
/// Positions in resolved, closed or past-close markets are left as they are.
pub async fn liquidate_user_tx(
    tx: &mut Transaction<'_, Postgres>,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Result<LiquidationSummary> {
    DbAdapter::lock_user(tx, user_id).await?;

    let market_ids: Vec<MarketId> = DbAdapter::fetch_user_positions(&mut **tx, user_id)
        .await?
        .into_iter()
        .map(|p| p.market_id)
        .collect();

    let mut summary = LiquidationSummary {
        user_id,
        ..LiquidationSummary::default()
    };

    for market_id in market_ids {
        let mut market = DbAdapter::lock_market(tx, market_id).await?;
        let position = DbAdapter::lock_position(tx, user_id, market_id).await?;
        if position.shares_yes <= 0.0 && position.shares_no <= 0.0 {
            continue;
        }
        if !market.is_tradable(now) {
            debug!(user_id, market_id, "market not live, leaving position");
            summary.positions_skipped += 1;
            continue;
        }

        // The YES sale moves the price the NO sale is costed against
        for side in [Side::Yes, Side::No] {
            let plan = match plan_unwind(&market, side, position.shares(side)) {
                Unwind::Nothing => continue,
                Unwind::Dust(plan) => plan,
                Unwind::Sell(plan) => plan,
            };
            let applied = apply_plan(tx, user_id, &market, &plan).await?;
            summary.proceeds_cents -= plan.cost_cents;
            market = applied.market;
        }
        summary.positions_unwound += 1;
    }

    info!(
        user_id,
        unwound = summary.positions_unwound,
        skipped = summary.positions_skipped,
        proceeds = %format_credits(summary.proceeds_cents),
        "liquidated user"
    );
    Ok(summary)
}

/// Unwind all of a user's live positions at current prices.
#[instrument(skip(pool, config))]
pub async fn liquidate_user(
    pool: &PgPool,
    config: &Config,
    user_id: UserId,
) -> Result<LiquidationSummary> {
    with_locked_tx!(pool, config, tx, {
        liquidate_user_tx(&mut tx, user_id, Utc::now()).await
    })
}

/// Liquidate and then delete an account. Admins cannot delete themselves.
#[instrument(skip(pool, config))]
pub async fn delete_user(
    pool: &PgPool,
    config: &Config,
    admin: Principal,
    username: &str,
) -> Result<LiquidationSummary> {
    let username = username.trim();
    if username.is_empty() {
        return Err(EngineError::InvalidInput("username is required".to_string()));
    }

    with_locked_tx!(pool, config, tx, {
        delete_user_transaction(&mut tx, &admin, username).await
    })
}

async fn delete_user_transaction(
    tx: &mut Transaction<'_, Postgres>,
    admin: &Principal,
    username: &str,
) -> Result<LiquidationSummary> {
    require_admin(tx, admin).await?;

    let target = DbAdapter::lock_user_by_name(tx, username)
        .await?
        .ok_or_else(|| EngineError::not_found("user", username))?;
    if target.id == admin.user_id {
        return Err(EngineError::Forbidden(
            "cannot delete your own account".to_string(),
        ));
    }

    let summary = liquidate_user_tx(tx, target.id, Utc::now()).await?;

    sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(target.id)
        .execute(&mut **tx)
        .await?;

    warn!(
        user_id = target.id,
        username = %target.username,
        deleted_by = admin.user_id,
        "user deleted"
    );
    Ok(summary)
}
