//! Concurrent trading simulation for the credit market engine
//!
//! This module checks:
//! 1. **Concurrency**: many users trading the same markets through locked transactions
//! 2. **Conservation**: every balance equals the sum of its ledger entries
//! 3. **Volume**: each market's volume covers the absolute cost of its recorded trades
//! 4. **Solvency**: no negative balances and no negative share holdings
//! 5. **Market Accuracy**: traders with better beliefs push prices toward the truth

use anyhow::{ensure, Result};
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use rand::prelude::*;
use serde::Serialize;
use sqlx::PgPool;
use std::env;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::accounts;
use crate::config::Config;
use crate::database;
use crate::error::EngineError;
use crate::lmsr_core::Side;
use crate::markets;
use crate::models::{AmountType, NewMarket, Principal, TradeKind, TradeRequest};
use crate::money::format_credits;
use crate::settlement;
use crate::trading;

// Simulation parameters (defaults; override via STRESS_* env vars)
const NUM_USERS: usize = 50;
const NUM_MARKETS: usize = 10;
const TRADES_PER_USER: usize = 100;
const LIQUIDITY_B: f64 = 500.0;
const BATCH_SIZE: usize = 25;
const SELL_PROBABILITY: f64 = 0.25;

#[derive(Debug, Clone)]
struct StressConfig {
    num_users: usize,
    num_markets: usize,
    trades_per_user: usize,
    liquidity_b: f64,
    batch_size: usize,
    sell_probability: f64,
}

impl StressConfig {
    fn from_env() -> Self {
        Self {
            num_users: env_usize("STRESS_NUM_USERS", NUM_USERS),
            num_markets: env_usize("STRESS_NUM_MARKETS", NUM_MARKETS),
            trades_per_user: env_usize("STRESS_TRADES_PER_USER", TRADES_PER_USER),
            liquidity_b: env_f64("STRESS_LIQUIDITY_B", LIQUIDITY_B),
            batch_size: env_usize("STRESS_BATCH_SIZE", BATCH_SIZE),
            sell_probability: env_f64("STRESS_SELL_PROBABILITY", SELL_PROBABILITY).clamp(0.0, 1.0),
        }
    }
}

fn stress_config() -> &'static StressConfig {
    static CONFIG: OnceLock<StressConfig> = OnceLock::new();
    CONFIG.get_or_init(StressConfig::from_env)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
        .unwrap_or(default)
}

/// A simulated trader
#[derive(Debug, Clone, Copy)]
struct TestUser {
    id: i32,
    skill: f64, // 0.0 = pure noise, 1.0 = knows the true probability
}

/// A market with a hidden "true" probability
#[derive(Debug, Clone, Copy)]
struct TestMarket {
    id: i32,
    true_prob: f64,
}

#[derive(Debug, Clone, Copy)]
enum TradeOutcome {
    Executed,
    Skipped,
}

/// Result of the ledger consistency checks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvariantReport {
    pub users_checked: i64,
    /// Users whose balance differs from the sum of their ledger entries
    pub ledger_mismatches: i64,
    /// Markets whose volume is below the sum of |trade cost| still on record;
    /// deleting a user removes their trades but not the volume they added
    pub volume_mismatches: i64,
    pub negative_balances: i64,
    pub negative_positions: i64,
    pub total_balance_cents: i64,
}

impl InvariantReport {
    pub fn is_sound(&self) -> bool {
        self.ledger_mismatches == 0
            && self.volume_mismatches == 0
            && self.negative_balances == 0
            && self.negative_positions == 0
    }
}

/// Drop every engine table and recreate the schema
pub async fn setup_test_database(pool: &PgPool) -> Result<()> {
    for table in [
        "suggestions",
        "ledger_entries",
        "trades",
        "positions",
        "market_involved_users",
        "markets",
        "users",
    ] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
            .execute(pool)
            .await?;
    }
    database::run_migrations(pool).await?;

    info!("✅ Test database schema created");
    Ok(())
}

/// Check conservation and solvency across the whole store
pub async fn verify_invariants(pool: &PgPool) -> Result<InvariantReport> {
    let users_checked: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;

    let ledger_mismatches: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM users u
        WHERE u.balance_cents <> COALESCE(
            (SELECT SUM(l.amount_cents) FROM ledger_entries l WHERE l.user_id = u.id), 0)
        "#,
    )
    .fetch_one(pool)
    .await?;

    let volume_mismatches: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM markets m
        WHERE m.volume_cents < COALESCE(
            (SELECT SUM(ABS(t.cost_cents)) FROM trades t WHERE t.market_id = m.id), 0)
        "#,
    )
    .fetch_one(pool)
    .await?;

    let negative_balances: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE balance_cents < 0")
            .fetch_one(pool)
            .await?;

    let negative_positions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM positions WHERE shares_yes < 0 OR shares_no < 0")
            .fetch_one(pool)
            .await?;

    let total_balance_cents: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(balance_cents), 0)::BIGINT FROM users")
            .fetch_one(pool)
            .await?;

    Ok(InvariantReport {
        users_checked,
        ledger_mismatches,
        volume_mismatches,
        negative_balances,
        negative_positions,
        total_balance_cents,
    })
}

/// Creates an admin plus traders; each login grants the first allowance
async fn create_test_users(pool: &PgPool, config: &Config) -> Result<(Principal, Vec<TestUser>)> {
    let stress = stress_config();
    let admin = accounts::ensure_user(pool, config, "stress_admin", true).await?;

    let mut users = Vec::with_capacity(stress.num_users);
    let mut rng = thread_rng();
    for i in 0..stress.num_users {
        let login = accounts::ensure_user(pool, config, &format!("trader_{}", i), false).await?;
        users.push(TestUser {
            id: login.account.id,
            skill: rng.gen(),
        });
    }

    info!("✅ Created {} traders with varying skill levels", users.len());
    Ok((admin.principal, users))
}

async fn create_test_markets(
    pool: &PgPool,
    config: &Config,
    admin: Principal,
) -> Result<Vec<TestMarket>> {
    let stress = stress_config();
    let mut markets = Vec::with_capacity(stress.num_markets);

    for i in 0..stress.num_markets {
        let true_prob = 0.2 + (i as f64 / stress.num_markets as f64) * 0.6; // 0.2 to 0.8
        let new = NewMarket {
            title: format!("Stress market #{}", i),
            description: String::new(),
            rules: "Resolved by the simulation".to_string(),
            closes_at: Utc::now() + ChronoDuration::days(30),
            resolves_at: Utc::now() + ChronoDuration::days(31),
            b: Some(stress.liquidity_b),
            initial_probability: None,
            involved_users: Vec::new(),
            suggestion_id: None,
        };
        let market = markets::create_market(pool, config, admin, new).await?;
        markets.push(TestMarket {
            id: market.id,
            true_prob,
        });
    }

    info!("✅ Created {} markets with hidden ground truths", markets.len());
    Ok(markets)
}

/// A trader's belief: skilled traders land near the truth
fn simulate_belief(skill: f64, true_prob: f64, noise_factor: f64) -> f64 {
    let noise = (noise_factor - 0.5) * (1.0 - skill);
    (true_prob + noise).clamp(0.01, 0.99)
}

async fn try_execute_trade(
    pool: &PgPool,
    config: &Config,
    user_id: i32,
    market_id: i32,
    belief: f64,
) -> Result<TradeOutcome, EngineError> {
    let stress = stress_config();
    let (should_sell, sell_fraction, stake_credits) = {
        let mut rng = thread_rng();
        (
            rng.gen::<f64>() < stress.sell_probability,
            rng.gen_range(0.1..0.6),
            rng.gen_range(1.0..20.0),
        )
    };

    let request = if should_sell {
        let position = markets::get_position(pool, user_id, market_id).await?;
        let side = if position.shares_yes >= position.shares_no {
            Side::Yes
        } else {
            Side::No
        };
        let held = position.shares(side);
        if held <= 0.0 {
            return Ok(TradeOutcome::Skipped);
        }
        TradeRequest {
            market_id,
            side,
            kind: TradeKind::Sell,
            amount_type: AmountType::Shares,
            amount: held * sell_fraction,
        }
    } else {
        let quote = trading::quote(pool, market_id, Side::Yes, 1e-6).await?;
        let side = if belief > quote.price_yes_before {
            Side::Yes
        } else {
            Side::No
        };
        TradeRequest {
            market_id,
            side,
            kind: TradeKind::Buy,
            amount_type: AmountType::Credits,
            amount: stake_credits,
        }
    };

    match trading::execute_trade(pool, config, user_id, request).await {
        Ok(_) => Ok(TradeOutcome::Executed),
        Err(
            EngineError::InsufficientFunds { .. }
            | EngineError::InsufficientShares { .. }
            | EngineError::TradeTooSmall(_),
        ) => Ok(TradeOutcome::Skipped),
        Err(err) => Err(err),
    }
}

/// Run the simulation, resolve every market, and verify the ledger
pub async fn run_stress_test(pool: &PgPool, config: &Config) -> Result<InvariantReport> {
    let stress = stress_config();
    let (admin, users) = create_test_users(pool, config).await?;
    let test_markets = create_test_markets(pool, config, admin).await?;
    let pool = Arc::new(pool.clone());
    let config = Arc::new(config.clone());
    let start_time = Instant::now();

    info!(
        "🚀 Target: {} trades ({} users × {} trades each)",
        stress.num_users * stress.trades_per_user,
        stress.num_users,
        stress.trades_per_user
    );

    let mut successful_trades = 0u64;
    let mut failed_trades = 0u64;
    let mut skipped_trades = 0u64;

    for batch in users.chunks(stress.batch_size) {
        let mut handles = Vec::with_capacity(batch.len());

        for user in batch.iter().copied() {
            let pool = Arc::clone(&pool);
            let config = Arc::clone(&config);
            let test_markets = test_markets.clone();

            handles.push(tokio::spawn(async move {
                let mut executed = 0u64;
                let mut failed = 0u64;
                let mut skipped = 0u64;

                for trade_num in 0..stress.trades_per_user {
                    let market = test_markets[(user.id as usize + trade_num) % test_markets.len()];
                    let belief =
                        simulate_belief(user.skill, market.true_prob, rand::random::<f64>());

                    match try_execute_trade(&pool, &config, user.id, market.id, belief).await {
                        Ok(TradeOutcome::Executed) => executed += 1,
                        Ok(TradeOutcome::Skipped) => skipped += 1,
                        Err(err) => {
                            warn!(user_id = user.id, market_id = market.id, error = %err, "trade failed");
                            failed += 1;
                        }
                    }
                }
                (executed, failed, skipped)
            }));
        }

        for joined in join_all(handles).await {
            match joined {
                Ok((s, f, k)) => {
                    successful_trades += s;
                    failed_trades += f;
                    skipped_trades += k;
                }
                Err(e) => {
                    error!("User task failed: {}", e);
                    failed_trades += stress.trades_per_user as u64;
                }
            }
        }

        let elapsed = start_time.elapsed().as_secs_f64();
        info!(
            "Progress: {} executed, {} failed, {} skipped | {:.0} TPS",
            successful_trades,
            failed_trades,
            skipped_trades,
            (successful_trades + failed_trades + skipped_trades) as f64 / elapsed.max(1e-9)
        );
    }

    let duration = start_time.elapsed();
    let total_trades = successful_trades + failed_trades + skipped_trades;
    info!("🏁 Simulation finished in {:.2?}", duration);
    info!(
        "   {} executed, {} skipped, {} failed ({:.2} TPS)",
        successful_trades,
        skipped_trades,
        failed_trades,
        total_trades as f64 / duration.as_secs_f64().max(1e-9)
    );

    info!("🔍 Verifying invariants after trading...");
    let report = verify_invariants(&pool).await?;
    ensure!(report.is_sound(), "invariants violated after trading: {:?}", report);

    let mut brier_scores = Vec::with_capacity(test_markets.len());
    for market in &test_markets {
        let view = markets::get_market(&pool, market.id).await?;
        let yes = thread_rng().gen_bool(market.true_prob);
        let outcome = if yes { Side::Yes } else { Side::No };

        settlement::resolve_market(&pool, &config, admin, market.id, outcome, true, None).await?;
        brier_scores.push((view.price_yes - if yes { 1.0 } else { 0.0 }).powi(2));
    }
    let avg_brier = brier_scores.iter().sum::<f64>() / brier_scores.len().max(1) as f64;

    let report = verify_invariants(&pool).await?;
    ensure!(report.is_sound(), "invariants violated after resolution: {:?}", report);

    info!("✅ Ledger invariants hold. System is sound.");
    info!("📊 Stress Test Summary:");
    info!("   - Users checked: {}", report.users_checked);
    info!("   - Total balances: {}", format_credits(report.total_balance_cents));
    info!("   - Market accuracy (Brier): {:.4}", avg_brier);
    Ok(report)
}
