//! Integration tests for the database-backed flows
//!
//! These tests verify the complete engine/database path including:
//! - buy, sell, resolve with payouts
//! - rejected trades leave no trace in the ledger
//! - liquidation and account deletion
//! - concurrent trades on one market serialize cleanly
//! - monthly allowance grants and rate changes
//!
//! Each test creates its own schema on `TEST_DATABASE_URL` and is skipped when
//! that variable is unset.

use crate::accounts;
use crate::allowance;
use crate::config::Config;
use crate::database;
use crate::error::EngineError;
use crate::lmsr_core::Side;
use crate::markets;
use crate::models::{
    Account, AmountType, InvolvedUser, MarketEdit, MarketRecord, NewMarket, Principal, TradeBan,
    TradeKind, TradeRequest, TradeResult,
};
use crate::settlement;
use crate::stress::verify_invariants;
use crate::suggestions::{self, SuggestionDecision};
use crate::trading;
use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::env;
use std::str::FromStr;

/// Monthly allowance used by every test: 1000 credits
const TEST_ALLOWANCE_CENTS: i64 = 100_000;

struct TestDb {
    pool: PgPool,
    admin_pool: PgPool,
    schema: String,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.market.monthly_allowance_credits = 1000.0;
    config.market.default_liquidity_b = 100.0;
    config.database.max_connections = 10;
    config
}

/// Fresh schema with the engine tables, or `None` without a test database
async fn setup_test_database(label: &str) -> Result<Option<TestDb>> {
    let url = match env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            println!("⏭️  TEST_DATABASE_URL not set, skipping {}", label);
            return Ok(None);
        }
    };

    println!("🔧 Setting up schema for {}...", label);
    let options = PgConnectOptions::from_str(&url)?;
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(options.clone())
        .await?;

    let schema = format!("cm_{}_{}", label, rand::random::<u32>());
    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&admin_pool)
        .await?;

    let config = test_config();
    let pool = database::connect_with(
        &config.database,
        options.options([("search_path", schema.as_str())]),
    )
    .await?;
    database::run_migrations(&pool).await?;

    println!("✅ Schema {} ready", schema);
    Ok(Some(TestDb {
        pool,
        admin_pool,
        schema,
    }))
}

async fn cleanup_test_database(db: TestDb) -> Result<()> {
    db.pool.close().await;
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", db.schema))
        .execute(&db.admin_pool)
        .await?;
    db.admin_pool.close().await;
    Ok(())
}

async fn create_admin(pool: &PgPool, config: &Config) -> Result<Principal> {
    let login = accounts::ensure_user(pool, config, "admin", true).await?;
    Ok(login.principal)
}

async fn create_trader(pool: &PgPool, config: &Config, name: &str) -> Result<Account> {
    let login = accounts::ensure_user(pool, config, name, false).await?;
    Ok(login.account)
}

async fn create_test_market(
    pool: &PgPool,
    config: &Config,
    admin: Principal,
    title: &str,
    involved_users: Vec<InvolvedUser>,
) -> Result<MarketRecord> {
    let now = Utc::now();
    let market = markets::create_market(
        pool,
        config,
        admin,
        NewMarket {
            title: title.to_string(),
            description: "Integration test market".to_string(),
            rules: "Resolved by the test".to_string(),
            closes_at: now + Duration::days(1),
            resolves_at: now + Duration::days(2),
            b: Some(100.0),
            initial_probability: None,
            involved_users,
            suggestion_id: None,
        },
    )
    .await?;
    Ok(market)
}

async fn buy_credits(
    pool: &PgPool,
    config: &Config,
    user_id: i32,
    market_id: i32,
    side: Side,
    credits: f64,
) -> crate::error::Result<TradeResult> {
    trading::execute_trade(
        pool,
        config,
        user_id,
        TradeRequest {
            market_id,
            side,
            kind: TradeKind::Buy,
            amount_type: AmountType::Credits,
            amount: credits,
        },
    )
    .await
}

async fn ledger_row_count(pool: &PgPool, user_id: i32) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

async fn assert_sound(pool: &PgPool) -> Result<()> {
    let report = verify_invariants(pool).await?;
    if !report.is_sound() {
        return Err(anyhow!("invariants violated: {:?}", report));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::payout_cents;

    #[tokio::test]
    async fn test_trade_and_resolution_cycle() -> Result<()> {
        let Some(db) = setup_test_database("cycle").await? else {
            return Ok(());
        };
        let pool = &db.pool;
        let config = test_config();

        let admin = create_admin(pool, &config).await?;
        let alice = create_trader(pool, &config, "alice").await?;
        let bob = create_trader(pool, &config, "bob").await?;
        assert_eq!(alice.balance_cents, TEST_ALLOWANCE_CENTS);

        let market = create_test_market(pool, &config, admin, "Will it snow in May", vec![]).await?;
        assert!((market.price_yes() - 0.5).abs() < 1e-12);

        println!("📈 alice buys YES, bob buys NO");
        let alice_buy = buy_credits(pool, &config, alice.id, market.id, Side::Yes, 100.0).await?;
        assert!(alice_buy.trade.cost_cents > 0 && alice_buy.trade.cost_cents <= 10_000);
        assert_eq!(
            alice_buy.balance_cents,
            TEST_ALLOWANCE_CENTS - alice_buy.trade.cost_cents
        );
        assert!(alice_buy.market.price_yes > 0.5);

        let bob_buy = buy_credits(pool, &config, bob.id, market.id, Side::No, 50.0).await?;
        assert!(bob_buy.market.price_yes < alice_buy.market.price_yes);

        println!("📉 alice sells a third of her YES shares");
        let sold = alice_buy.position.shares_yes / 3.0;
        let sell = trading::execute_trade(
            pool,
            &config,
            alice.id,
            TradeRequest {
                market_id: market.id,
                side: Side::Yes,
                kind: TradeKind::Sell,
                amount_type: AmountType::Shares,
                amount: sold,
            },
        )
        .await?;
        assert!(sell.trade.cost_cents < 0);
        assert!(sell.trade.delta_shares < 0.0);
        assert_eq!(
            sell.balance_cents,
            alice_buy.balance_cents - sell.trade.cost_cents
        );
        let alice_shares = sell.position.shares_yes;

        println!("⚖️  resolving YES");
        let early = settlement::resolve_market(pool, &config, admin, market.id, Side::Yes, false, None)
            .await;
        assert!(matches!(early, Err(EngineError::InvalidState(_))));

        let not_admin = Principal {
            user_id: bob.id,
            is_admin: true,
        };
        let forged = settlement::resolve_market(pool, &config, not_admin, market.id, Side::Yes, true, None)
            .await;
        assert!(matches!(forged, Err(EngineError::Forbidden(_))));

        let summary = settlement::resolve_market(
            pool,
            &config,
            admin,
            market.id,
            Side::Yes,
            true,
            Some("Snow observed".to_string()),
        )
        .await?;
        assert_eq!(summary.winners, 1);
        assert_eq!(summary.total_payout_cents, payout_cents(alice_shares));

        let alice_after = accounts::get_account(pool, alice.id).await?;
        assert_eq!(
            alice_after.balance_cents,
            sell.balance_cents + summary.total_payout_cents
        );
        let bob_after = accounts::get_account(pool, bob.id).await?;
        assert_eq!(bob_after.balance_cents, bob_buy.balance_cents);

        println!("🚫 no trading or second resolution after resolve");
        let late = buy_credits(pool, &config, bob.id, market.id, Side::Yes, 10.0).await;
        assert!(matches!(late, Err(EngineError::InvalidState(_))));
        let again = settlement::resolve_market(pool, &config, admin, market.id, Side::No, true, None)
            .await;
        assert!(matches!(again, Err(EngineError::InvalidState(_))));

        let view = markets::get_market(pool, market.id).await?;
        assert_eq!(view.market.outcome, Some(Side::Yes));
        assert!(view.market.resolved_at.is_some());

        assert_sound(pool).await?;
        cleanup_test_database(db).await
    }

    #[tokio::test]
    async fn test_rejected_trades_leave_no_trace() -> Result<()> {
        let Some(db) = setup_test_database("rejects").await? else {
            return Ok(());
        };
        let pool = &db.pool;
        let config = test_config();

        let admin = create_admin(pool, &config).await?;
        let carol = create_trader(pool, &config, "carol").await?;
        let market = create_test_market(
            pool,
            &config,
            admin,
            "Will the vote pass",
            vec![InvolvedUser {
                user_id: carol.id,
                ban: TradeBan::Yes,
            }],
        )
        .await?;
        let rows_before = ledger_row_count(pool, carol.id).await?;

        let sell_nothing = trading::execute_trade(
            pool,
            &config,
            carol.id,
            TradeRequest {
                market_id: market.id,
                side: Side::No,
                kind: TradeKind::Sell,
                amount_type: AmountType::Shares,
                amount: 5.0,
            },
        )
        .await;
        assert!(matches!(sell_nothing, Err(EngineError::InsufficientShares { .. })));

        let sell_credits = trading::execute_trade(
            pool,
            &config,
            carol.id,
            TradeRequest {
                market_id: market.id,
                side: Side::No,
                kind: TradeKind::Sell,
                amount_type: AmountType::Credits,
                amount: 5.0,
            },
        )
        .await;
        assert!(matches!(sell_credits, Err(EngineError::InvalidInput(_))));

        let too_big = trading::execute_trade(
            pool,
            &config,
            carol.id,
            TradeRequest {
                market_id: market.id,
                side: Side::No,
                kind: TradeKind::Buy,
                amount_type: AmountType::Shares,
                amount: 1_000_000.0,
            },
        )
        .await;
        assert!(matches!(too_big, Err(EngineError::InsufficientFunds { .. })));

        let dust = buy_credits(pool, &config, carol.id, market.id, Side::No, 0.001).await;
        assert!(matches!(dust, Err(EngineError::TradeTooSmall(_))));

        let banned = buy_credits(pool, &config, carol.id, market.id, Side::Yes, 10.0).await;
        assert!(matches!(banned, Err(EngineError::Forbidden(_))));

        let missing = buy_credits(pool, &config, carol.id, market.id + 999, Side::No, 10.0).await;
        assert!(matches!(missing, Err(EngineError::NotFound { .. })));

        let account = accounts::get_account(pool, carol.id).await?;
        assert_eq!(account.balance_cents, TEST_ALLOWANCE_CENTS);
        assert_eq!(ledger_row_count(pool, carol.id).await?, rows_before);
        let position = markets::get_position(pool, carol.id, market.id).await?;
        assert_eq!(position.shares_no, 0.0);

        println!("✅ banned side rejected, opposite side allowed");
        let allowed = buy_credits(pool, &config, carol.id, market.id, Side::No, 10.0).await?;
        assert!(allowed.position.shares_no > 0.0);

        let not_admin = markets::create_market(
            pool,
            &config,
            carol.principal(),
            NewMarket {
                title: "Sneaky market".to_string(),
                description: String::new(),
                rules: "None".to_string(),
                closes_at: Utc::now() + Duration::days(1),
                resolves_at: Utc::now() + Duration::days(2),
                b: None,
                initial_probability: None,
                involved_users: vec![],
                suggestion_id: None,
            },
        )
        .await;
        assert!(matches!(not_admin, Err(EngineError::Forbidden(_))));

        assert_sound(pool).await?;
        cleanup_test_database(db).await
    }

    #[tokio::test]
    async fn test_liquidation_and_deletion() -> Result<()> {
        let Some(db) = setup_test_database("liquidation").await? else {
            return Ok(());
        };
        let pool = &db.pool;
        let config = test_config();

        let admin = create_admin(pool, &config).await?;
        let dave = create_trader(pool, &config, "dave").await?;
        let live = create_test_market(pool, &config, admin, "Live market", vec![]).await?;
        let closing = create_test_market(pool, &config, admin, "Closing market", vec![]).await?;

        let live_buy = buy_credits(pool, &config, dave.id, live.id, Side::Yes, 40.0).await?;
        buy_credits(pool, &config, dave.id, live.id, Side::No, 15.0).await?;
        let closing_buy = buy_credits(pool, &config, dave.id, closing.id, Side::No, 25.0).await?;
        assert!(live_buy.trade.cost_cents > 0 && closing_buy.trade.cost_cents > 0);

        println!("🔒 closing the second market");
        let now = Utc::now();
        markets::update_market(
            pool,
            &config,
            admin,
            closing.id,
            MarketEdit {
                closes_at: Some(now - Duration::hours(1)),
                resolves_at: Some(now + Duration::days(1)),
                ..MarketEdit::default()
            },
        )
        .await?;
        let closed_trade = buy_credits(pool, &config, dave.id, closing.id, Side::No, 5.0).await;
        assert!(matches!(closed_trade, Err(EngineError::InvalidState(_))));

        let before = accounts::get_account(pool, dave.id).await?;
        let summary = settlement::liquidate_user(pool, &config, dave.id).await?;
        assert_eq!(summary.positions_unwound, 1);
        assert_eq!(summary.positions_skipped, 1);
        assert!(summary.proceeds_cents > 0);

        let after = accounts::get_account(pool, dave.id).await?;
        assert_eq!(after.balance_cents, before.balance_cents + summary.proceeds_cents);

        let live_position = markets::get_position(pool, dave.id, live.id).await?;
        assert_eq!(live_position.shares_yes, 0.0);
        assert_eq!(live_position.shares_no, 0.0);
        let closed_position = markets::get_position(pool, dave.id, closing.id).await?;
        assert_eq!(closed_position.shares_no, closing_buy.position.shares_no);

        // the live book is back where it opened
        let live_after = markets::get_market(pool, live.id).await?.market;
        assert!(live_after.q_yes.abs() < 1e-6 && live_after.q_no.abs() < 1e-6);
        assert_sound(pool).await?;

        println!("🗑️  deleting dave");
        let self_delete = settlement::delete_user(pool, &config, admin, "admin").await;
        assert!(matches!(self_delete, Err(EngineError::Forbidden(_))));

        let deleted = settlement::delete_user(pool, &config, admin, "dave").await?;
        assert_eq!(deleted.positions_unwound, 0);
        assert_eq!(deleted.positions_skipped, 1);
        assert!(matches!(
            accounts::get_account(pool, dave.id).await,
            Err(EngineError::NotFound { .. })
        ));
        let gone = settlement::delete_user(pool, &config, admin, "dave").await;
        assert!(matches!(gone, Err(EngineError::NotFound { .. })));

        assert_sound(pool).await?;
        cleanup_test_database(db).await
    }

    #[tokio::test]
    async fn test_concurrent_trades_serialize() -> Result<()> {
        let Some(db) = setup_test_database("concurrency").await? else {
            return Ok(());
        };
        let pool = &db.pool;
        let config = test_config();

        let admin = create_admin(pool, &config).await?;
        let market = create_test_market(pool, &config, admin, "Crowded market", vec![]).await?;

        let mut traders = Vec::new();
        for i in 0..8 {
            traders.push(create_trader(pool, &config, &format!("trader_{}", i)).await?);
        }

        println!("🏃 {} concurrent buys on one market", traders.len());
        let trades = traders.iter().enumerate().map(|(i, trader)| {
            let side = if i % 2 == 0 { Side::Yes } else { Side::No };
            buy_credits(pool, &config, trader.id, market.id, side, 20.0)
        });
        let results = futures_util::future::join_all(trades).await;

        let mut expected_yes = market.q_yes;
        let mut expected_no = market.q_no;
        let mut volume = 0i64;
        for result in results {
            let result = result?;
            match result.trade.side {
                Side::Yes => expected_yes += result.trade.delta_shares,
                Side::No => expected_no += result.trade.delta_shares,
            }
            volume += result.trade.cost_cents.abs();
        }

        let after = markets::get_market(pool, market.id).await?.market;
        assert!((after.q_yes - expected_yes).abs() < 1e-6);
        assert!((after.q_no - expected_no).abs() < 1e-6);
        assert_eq!(after.volume_cents, volume);

        assert_sound(pool).await?;
        cleanup_test_database(db).await
    }

    #[tokio::test]
    async fn test_allowance_once_per_month() -> Result<()> {
        let Some(db) = setup_test_database("allowance").await? else {
            return Ok(());
        };
        let pool = &db.pool;
        let mut config = test_config();

        let first = accounts::ensure_user(pool, &config, "erin", false).await?;
        assert!(first.created);
        assert_eq!(first.allowance.months_granted, 1);
        assert_eq!(first.account.balance_cents, TEST_ALLOWANCE_CENTS);
        let user_id = first.account.id;

        let second = accounts::ensure_user(pool, &config, "erin", false).await?;
        assert!(!second.created);
        assert_eq!(second.allowance.credited_cents(), 0);
        let again = allowance::grant_allowance_if_due(pool, &config, user_id).await?;
        assert_eq!(again.credited_cents(), 0);

        println!("📅 rewinding the allowance marker two months");
        sqlx::query("UPDATE users SET last_allowance_ym = last_allowance_ym - 2 WHERE id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
        let catch_up = allowance::grant_allowance_if_due(pool, &config, user_id).await?;
        assert_eq!(catch_up.months_granted, 2);
        assert_eq!(catch_up.allowance_cents, 2 * TEST_ALLOWANCE_CENTS);
        assert_eq!(
            accounts::get_account(pool, user_id).await?.balance_cents,
            3 * TEST_ALLOWANCE_CENTS
        );

        println!("💱 raising the rate mid-month");
        config.market.monthly_allowance_credits = 1500.0;
        let topped_up = allowance::grant_allowance_if_due(pool, &config, user_id).await?;
        assert_eq!(topped_up.months_granted, 0);
        assert_eq!(topped_up.adjustment_cents, 50_000);
        let settled = allowance::grant_allowance_if_due(pool, &config, user_id).await?;
        assert_eq!(settled.credited_cents(), 0);

        let ledger = accounts::list_ledger(pool, user_id).await?;
        assert_eq!(ledger.len(), 3);
        assert!(ledger[0].note.contains("adjustment"));

        assert_sound(pool).await?;
        cleanup_test_database(db).await
    }

    #[tokio::test]
    async fn test_allowance_rate_cut_never_overdraws() -> Result<()> {
        let Some(db) = setup_test_database("rate_cut").await? else {
            return Ok(());
        };
        let pool = &db.pool;
        let mut config = test_config();

        let admin = create_admin(pool, &config).await?;
        let gina = create_trader(pool, &config, "gina").await?;
        assert_eq!(gina.balance_cents, TEST_ALLOWANCE_CENTS);

        println!("✂️  cutting the rate with room to spare");
        config.market.monthly_allowance_credits = 600.0;
        let first_cut = allowance::grant_allowance_if_due(pool, &config, gina.id).await?;
        assert_eq!(first_cut.months_granted, 0);
        assert_eq!(first_cut.adjustment_cents, -40_000);
        let account = accounts::get_account(pool, gina.id).await?;
        assert_eq!(account.balance_cents, 60_000);
        assert_eq!(account.last_allowance_cents, Some(60_000));

        // spend most of it so the next cut is larger than the balance
        accounts::adjust_credits(pool, &config, admin, gina.id, -500.0, None).await?;
        assert_eq!(accounts::get_account(pool, gina.id).await?.balance_cents, 10_000);

        println!("✂️  cutting the rate below what the balance can absorb");
        config.market.monthly_allowance_credits = 100.0;
        let second_cut = allowance::grant_allowance_if_due(pool, &config, gina.id).await?;
        assert_eq!(second_cut.adjustment_cents, -10_000);
        let account = accounts::get_account(pool, gina.id).await?;
        assert_eq!(account.balance_cents, 0);
        assert_eq!(account.last_allowance_cents, Some(10_000));

        let ledger = accounts::list_ledger(pool, gina.id).await?;
        assert_eq!(ledger[0].amount_cents, -10_000);
        assert!(ledger[0].note.contains("adjustment"));

        let settled = allowance::grant_allowance_if_due(pool, &config, gina.id).await?;
        assert_eq!(settled.credited_cents(), 0);
        assert_eq!(accounts::get_account(pool, gina.id).await?.balance_cents, 0);

        assert_sound(pool).await?;
        cleanup_test_database(db).await
    }

    #[tokio::test]
    async fn test_admin_adjustments_and_suggestions() -> Result<()> {
        let Some(db) = setup_test_database("admin").await? else {
            return Ok(());
        };
        let pool = &db.pool;
        let config = test_config();

        let admin = create_admin(pool, &config).await?;
        let frank = create_trader(pool, &config, "frank").await?;

        let credited =
            accounts::adjust_credits(pool, &config, admin, frank.id, 5.0, Some("bonus".into()))
                .await?;
        assert_eq!(credited.balance_cents, TEST_ALLOWANCE_CENTS + 500);
        let overdrawn =
            accounts::adjust_credits(pool, &config, admin, frank.id, -5_000.0, None).await;
        assert!(matches!(overdrawn, Err(EngineError::InsufficientFunds { .. })));
        let by_user =
            accounts::adjust_credits(pool, &config, frank.principal(), frank.id, 5.0, None).await;
        assert!(matches!(by_user, Err(EngineError::Forbidden(_))));

        println!("💡 suggestion becomes a market");
        let suggestion =
            suggestions::create_suggestion(pool, frank.principal(), "Will the ferry run", "").await?;
        let now = Utc::now();
        let market = markets::create_market(
            pool,
            &config,
            admin,
            NewMarket {
                title: suggestion.title.clone(),
                description: String::new(),
                rules: "Ferry timetable".to_string(),
                closes_at: now + Duration::days(3),
                resolves_at: now + Duration::days(4),
                b: None,
                initial_probability: Some(0.8),
                involved_users: vec![],
                suggestion_id: Some(suggestion.id),
            },
        )
        .await?;
        assert!((market.price_yes() - 0.8).abs() < 1e-9);
        assert_eq!(market.b, config.market.default_liquidity_b);

        let mine = suggestions::list_suggestions(pool, frank.principal()).await?;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].market_id, Some(market.id));

        let redecide =
            suggestions::decide_suggestion(pool, &config, admin, suggestion.id, SuggestionDecision::Reject)
                .await;
        assert!(matches!(redecide, Err(EngineError::InvalidState(_))));

        let other =
            suggestions::create_suggestion(pool, frank.principal(), "Will the bakery reopen", "")
                .await?;
        let rejected =
            suggestions::decide_suggestion(pool, &config, admin, other.id, SuggestionDecision::Reject)
                .await?;
        assert_eq!(rejected.status, crate::models::SuggestionStatus::Rejected);

        assert_sound(pool).await?;
        cleanup_test_database(db).await
    }
}
