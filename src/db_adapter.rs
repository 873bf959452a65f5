//! Database adapter layer: row extraction plus the only code that writes
//! balances, market inventory, positions, trades and ledger rows.
//!
//! Locking reads take `SELECT ... FOR UPDATE` row locks; callers must acquire
//! them in the order user -> market -> position.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Postgres, Row, Transaction};

use crate::error::{EngineError, Result};
use crate::lmsr_core::Side;
use crate::markets::MarketDraft;
use crate::models::{
    parse_column, Account, InvolvedUser, LedgerEntry, LedgerEntryType, MarketId, MarketRecord,
    Position, Suggestion, SuggestionStatus, Trade, TradeBan, TradeId, UserId,
};

const ACCOUNT_COLUMNS: &str =
    "id, username, is_admin, balance_cents, last_allowance_ym, last_allowance_cents, created_at";
const MARKET_COLUMNS: &str = "id, title, description, rules, closes_at, resolves_at, status, outcome, \
     b, q_yes, q_no, volume_cents, created_by, created_at, resolved_at";
const POSITION_COLUMNS: &str =
    "user_id, market_id, shares_yes, shares_no, cost_cents_yes, cost_cents_no";
const TRADE_COLUMNS: &str = "id, user_id, market_id, side, delta_shares, cost_cents, created_at";
const LEDGER_COLUMNS: &str =
    "id, user_id, market_id, type, amount_cents, ref_trade_id, note, created_at";
const SUGGESTION_COLUMNS: &str =
    "id, title, details, status, created_by, market_id, created_at, used_at";

/// Row extraction and single-writer primitives over the ledger tables
pub struct DbAdapter;

/// One balance-affecting event; always written together with the balance change.
#[derive(Debug, Clone)]
pub struct LedgerPosting<'a> {
    pub user_id: UserId,
    pub market_id: Option<MarketId>,
    pub entry_type: LedgerEntryType,
    pub amount_cents: i64,
    pub ref_trade_id: Option<TradeId>,
    pub note: &'a str,
}

/// Everything a committed trade changed.
#[derive(Debug, Clone)]
pub struct AppliedTrade {
    pub trade: Trade,
    pub market: MarketRecord,
    pub position: Position,
    pub balance_cents: i64,
}

impl DbAdapter {
    pub fn extract_account(row: &PgRow) -> Result<Account> {
        Ok(Account {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            is_admin: row.try_get("is_admin")?,
            balance_cents: row.try_get("balance_cents")?,
            last_allowance_ym: row.try_get("last_allowance_ym")?,
            last_allowance_cents: row.try_get("last_allowance_cents")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub fn extract_market(row: &PgRow) -> Result<MarketRecord> {
        let status: String = row.try_get("status")?;
        let outcome: Option<String> = row.try_get("outcome")?;
        Ok(MarketRecord {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            rules: row.try_get("rules")?,
            closes_at: row.try_get("closes_at")?,
            resolves_at: row.try_get("resolves_at")?,
            status: parse_column("status", &status)?,
            outcome: outcome
                .as_deref()
                .map(|o| parse_column("outcome", o))
                .transpose()?,
            b: row.try_get("b")?,
            q_yes: row.try_get("q_yes")?,
            q_no: row.try_get("q_no")?,
            volume_cents: row.try_get("volume_cents")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }

    pub fn extract_position(row: &PgRow) -> Result<Position> {
        Ok(Position {
            user_id: row.try_get("user_id")?,
            market_id: row.try_get("market_id")?,
            shares_yes: row.try_get("shares_yes")?,
            shares_no: row.try_get("shares_no")?,
            cost_cents_yes: row.try_get("cost_cents_yes")?,
            cost_cents_no: row.try_get("cost_cents_no")?,
        })
    }

    pub fn extract_trade(row: &PgRow) -> Result<Trade> {
        let side: String = row.try_get("side")?;
        Ok(Trade {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            market_id: row.try_get("market_id")?,
            side: parse_column("side", &side)?,
            delta_shares: row.try_get("delta_shares")?,
            cost_cents: row.try_get("cost_cents")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub fn extract_ledger_entry(row: &PgRow) -> Result<LedgerEntry> {
        let entry_type: String = row.try_get("type")?;
        Ok(LedgerEntry {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            market_id: row.try_get("market_id")?,
            entry_type: parse_column("type", &entry_type)?,
            amount_cents: row.try_get("amount_cents")?,
            ref_trade_id: row.try_get("ref_trade_id")?,
            note: row.try_get("note")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub fn extract_suggestion(row: &PgRow) -> Result<Suggestion> {
        let status: String = row.try_get("status")?;
        Ok(Suggestion {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            details: row.try_get("details")?,
            status: parse_column("status", &status)?,
            created_by: row.try_get("created_by")?,
            market_id: row.try_get("market_id")?,
            created_at: row.try_get("created_at")?,
            used_at: row.try_get("used_at")?,
        })
    }
}

/// Unlocked reads, usable with a pool or inside a transaction
impl DbAdapter {
    pub async fn fetch_account<'e, E: PgExecutor<'e>>(
        executor: E,
        user_id: UserId,
    ) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&sql).bind(user_id).fetch_optional(executor).await?;
        row.as_ref().map(Self::extract_account).transpose()
    }

    pub async fn fetch_market<'e, E: PgExecutor<'e>>(
        executor: E,
        market_id: MarketId,
    ) -> Result<Option<MarketRecord>> {
        let sql = format!("SELECT {MARKET_COLUMNS} FROM markets WHERE id = $1");
        let row = sqlx::query(&sql).bind(market_id).fetch_optional(executor).await?;
        row.as_ref().map(Self::extract_market).transpose()
    }

    pub async fn fetch_markets<'e, E: PgExecutor<'e>>(
        executor: E,
        limit: i64,
    ) -> Result<Vec<MarketRecord>> {
        let sql = format!("SELECT {MARKET_COLUMNS} FROM markets ORDER BY created_at DESC, id DESC LIMIT $1");
        let rows = sqlx::query(&sql).bind(limit).fetch_all(executor).await?;
        rows.iter().map(Self::extract_market).collect()
    }

    pub async fn fetch_position<'e, E: PgExecutor<'e>>(
        executor: E,
        user_id: UserId,
        market_id: MarketId,
    ) -> Result<Option<Position>> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = $1 AND market_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(market_id)
            .fetch_optional(executor)
            .await?;
        row.as_ref().map(Self::extract_position).transpose()
    }

    pub async fn fetch_user_positions<'e, E: PgExecutor<'e>>(
        executor: E,
        user_id: UserId,
    ) -> Result<Vec<Position>> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = $1 ORDER BY market_id"
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(executor).await?;
        rows.iter().map(Self::extract_position).collect()
    }

    pub async fn fetch_market_positions<'e, E: PgExecutor<'e>>(
        executor: E,
        market_id: MarketId,
    ) -> Result<Vec<Position>> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE market_id = $1 ORDER BY user_id"
        );
        let rows = sqlx::query(&sql).bind(market_id).fetch_all(executor).await?;
        rows.iter().map(Self::extract_position).collect()
    }

    pub async fn fetch_ledger<'e, E: PgExecutor<'e>>(
        executor: E,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(executor)
            .await?;
        rows.iter().map(Self::extract_ledger_entry).collect()
    }

    pub async fn fetch_trades<'e, E: PgExecutor<'e>>(
        executor: E,
        market_id: MarketId,
    ) -> Result<Vec<Trade>> {
        let sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE market_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql).bind(market_id).fetch_all(executor).await?;
        rows.iter().map(Self::extract_trade).collect()
    }

    pub async fn fetch_trade_ban<'e, E: PgExecutor<'e>>(
        executor: E,
        market_id: MarketId,
        user_id: UserId,
    ) -> Result<TradeBan> {
        let ban: Option<String> = sqlx::query_scalar(
            "SELECT ban FROM market_involved_users WHERE market_id = $1 AND user_id = $2",
        )
        .bind(market_id)
        .bind(user_id)
        .fetch_optional(executor)
        .await?;
        match ban {
            Some(raw) => parse_column("ban", &raw),
            None => Ok(TradeBan::None),
        }
    }

    pub async fn fetch_involved_users<'e, E: PgExecutor<'e>>(
        executor: E,
        market_id: MarketId,
    ) -> Result<Vec<InvolvedUser>> {
        let rows = sqlx::query(
            "SELECT user_id, ban FROM market_involved_users WHERE market_id = $1 ORDER BY user_id",
        )
        .bind(market_id)
        .fetch_all(executor)
        .await?;
        rows.iter()
            .map(|row| {
                let ban: String = row.try_get("ban")?;
                Ok(InvolvedUser {
                    user_id: row.try_get("user_id")?,
                    ban: parse_column("ban", &ban)?,
                })
            })
            .collect()
    }

    pub async fn fetch_suggestion<'e, E: PgExecutor<'e>>(
        executor: E,
        suggestion_id: i32,
    ) -> Result<Option<Suggestion>> {
        let sql = format!("SELECT {SUGGESTION_COLUMNS} FROM suggestions WHERE id = $1");
        let row = sqlx::query(&sql).bind(suggestion_id).fetch_optional(executor).await?;
        row.as_ref().map(Self::extract_suggestion).transpose()
    }

    pub async fn fetch_suggestions<'e, E: PgExecutor<'e>>(
        executor: E,
        created_by: Option<UserId>,
        limit: i64,
    ) -> Result<Vec<Suggestion>> {
        let sql = format!(
            "SELECT {SUGGESTION_COLUMNS} FROM suggestions \
             WHERE ($1::INTEGER IS NULL OR created_by = $1) \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(created_by)
            .bind(limit)
            .fetch_all(executor)
            .await?;
        rows.iter().map(Self::extract_suggestion).collect()
    }
}

/// Row locks
impl DbAdapter {
    pub async fn lock_user(
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
    ) -> Result<Account> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| EngineError::not_found("user", user_id))?;
        Self::extract_account(&row)
    }

    pub async fn lock_user_by_name(
        tx: &mut Transaction<'_, Postgres>,
        username: &str,
    ) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE username = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(username)
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(Self::extract_account).transpose()
    }

    /// Lock several users in ascending id order; returns the ids that exist.
    pub async fn lock_users(
        tx: &mut Transaction<'_, Postgres>,
        user_ids: &[UserId],
    ) -> Result<Vec<UserId>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let locked: Vec<UserId> = sqlx::query_scalar(
            "SELECT id FROM users WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(user_ids)
        .fetch_all(&mut **tx)
        .await?;
        Ok(locked)
    }

    pub async fn lock_market(
        tx: &mut Transaction<'_, Postgres>,
        market_id: MarketId,
    ) -> Result<MarketRecord> {
        let sql = format!("SELECT {MARKET_COLUMNS} FROM markets WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(market_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| EngineError::not_found("market", market_id))?;
        Self::extract_market(&row)
    }

    /// Lock the (user, market) position, creating an empty row on first touch.
    pub async fn lock_position(
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        market_id: MarketId,
    ) -> Result<Position> {
        sqlx::query(
            "INSERT INTO positions (user_id, market_id) VALUES ($1, $2)
             ON CONFLICT (user_id, market_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(market_id)
        .execute(&mut **tx)
        .await?;

        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = $1 AND market_id = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(market_id)
            .fetch_one(&mut **tx)
            .await?;
        Self::extract_position(&row)
    }

    /// Lock all of a market's positions in user order.
    pub async fn lock_market_positions(
        tx: &mut Transaction<'_, Postgres>,
        market_id: MarketId,
    ) -> Result<Vec<Position>> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE market_id = $1 ORDER BY user_id FOR UPDATE"
        );
        let rows = sqlx::query(&sql).bind(market_id).fetch_all(&mut **tx).await?;
        rows.iter().map(Self::extract_position).collect()
    }
}

/// Writes. Balances only ever change through `post_to_ledger`.
impl DbAdapter {
    /// Apply a signed balance change and append its ledger row atomically.
    /// Returns the new balance; refuses to take a balance below zero.
    pub async fn post_to_ledger(
        tx: &mut Transaction<'_, Postgres>,
        posting: LedgerPosting<'_>,
    ) -> Result<i64> {
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET balance_cents = balance_cents + $1
             WHERE id = $2 AND balance_cents + $1 >= 0
             RETURNING balance_cents",
        )
        .bind(posting.amount_cents)
        .bind(posting.user_id)
        .fetch_optional(&mut **tx)
        .await?;

        let balance = match balance {
            Some(balance) => balance,
            None => {
                let current = Self::fetch_account(&mut **tx, posting.user_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("user", posting.user_id))?;
                return Err(EngineError::InsufficientFunds {
                    required_cents: -posting.amount_cents,
                    available_cents: current.balance_cents,
                });
            }
        };

        sqlx::query(
            "INSERT INTO ledger_entries (user_id, market_id, type, amount_cents, ref_trade_id, note)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(posting.user_id)
        .bind(posting.market_id)
        .bind(posting.entry_type.as_str())
        .bind(posting.amount_cents)
        .bind(posting.ref_trade_id)
        .bind(posting.note)
        .execute(&mut **tx)
        .await?;

        Ok(balance)
    }

    /// Write one trade: inventory, volume, trade row, position, balance, ledger.
    ///
    /// Caller holds the user, market and position locks and has validated the
    /// trade against the locked rows.
    pub async fn apply_trade(
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        market: &MarketRecord,
        side: Side,
        delta_shares: f64,
        cost_cents: i64,
    ) -> Result<AppliedTrade> {
        let next = market.lmsr().shifted(side, delta_shares);

        let sql = format!(
            "UPDATE markets SET q_yes = $1, q_no = $2, volume_cents = volume_cents + $3
             WHERE id = $4 RETURNING {MARKET_COLUMNS}"
        );
        let market_row = sqlx::query(&sql)
            .bind(next.q_yes)
            .bind(next.q_no)
            .bind(cost_cents.abs())
            .bind(market.id)
            .fetch_one(&mut **tx)
            .await?;
        let updated_market = Self::extract_market(&market_row)?;

        let sql = format!(
            "INSERT INTO trades (user_id, market_id, side, delta_shares, cost_cents)
             VALUES ($1, $2, $3, $4, $5) RETURNING {TRADE_COLUMNS}"
        );
        let trade_row = sqlx::query(&sql)
            .bind(user_id)
            .bind(market.id)
            .bind(side.as_str())
            .bind(delta_shares)
            .bind(cost_cents)
            .fetch_one(&mut **tx)
            .await?;
        let trade = Self::extract_trade(&trade_row)?;

        let position_sql = match side {
            Side::Yes => format!(
                "UPDATE positions SET shares_yes = shares_yes + $3, cost_cents_yes = cost_cents_yes + $4,
                    updated_at = NOW()
                 WHERE user_id = $1 AND market_id = $2 RETURNING {POSITION_COLUMNS}"
            ),
            Side::No => format!(
                "UPDATE positions SET shares_no = shares_no + $3, cost_cents_no = cost_cents_no + $4,
                    updated_at = NOW()
                 WHERE user_id = $1 AND market_id = $2 RETURNING {POSITION_COLUMNS}"
            ),
        };
        let position_row = sqlx::query(&position_sql)
            .bind(user_id)
            .bind(market.id)
            .bind(delta_shares)
            .bind(cost_cents)
            .fetch_one(&mut **tx)
            .await?;
        let position = Self::extract_position(&position_row)?;

        // Zero-cost trades only clear dust holdings and move no money
        let balance_cents = if cost_cents == 0 {
            sqlx::query_scalar::<_, i64>("SELECT balance_cents FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await?
        } else {
            Self::post_to_ledger(
                tx,
                LedgerPosting {
                    user_id,
                    market_id: Some(market.id),
                    entry_type: LedgerEntryType::Trade,
                    amount_cents: -cost_cents,
                    ref_trade_id: Some(trade.id),
                    note: "",
                },
            )
            .await?
        };

        Ok(AppliedTrade {
            trade,
            market: updated_market,
            position,
            balance_cents,
        })
    }

    /// Record the month (and rate) of the last allowance applied to a user.
    pub async fn set_allowance_marker(
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        ym: i32,
        cents: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET last_allowance_ym = $1, last_allowance_cents = $2 WHERE id = $3",
        )
        .bind(ym)
        .bind(cents)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_resolved(
        tx: &mut Transaction<'_, Postgres>,
        market_id: MarketId,
        outcome: Side,
        resolved_at: DateTime<Utc>,
    ) -> Result<MarketRecord> {
        let sql = format!(
            "UPDATE markets SET status = 'RESOLVED', outcome = $1, resolved_at = $2
             WHERE id = $3 RETURNING {MARKET_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(outcome.as_str())
            .bind(resolved_at)
            .bind(market_id)
            .fetch_one(&mut **tx)
            .await?;
        Self::extract_market(&row)
    }

    /// Replace a market's involved-user list.
    pub async fn replace_involved_users(
        tx: &mut Transaction<'_, Postgres>,
        market_id: MarketId,
        involved: &[InvolvedUser],
    ) -> Result<()> {
        sqlx::query("DELETE FROM market_involved_users WHERE market_id = $1")
            .bind(market_id)
            .execute(&mut **tx)
            .await?;
        for user in involved {
            sqlx::query(
                "INSERT INTO market_involved_users (market_id, user_id, ban) VALUES ($1, $2, $3)
                 ON CONFLICT (market_id, user_id) DO UPDATE SET ban = EXCLUDED.ban",
            )
            .bind(market_id)
            .bind(user.user_id)
            .bind(user.ban.as_str())
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Insert a new user; false if the username was taken concurrently.
    pub async fn insert_user(
        tx: &mut Transaction<'_, Postgres>,
        username: &str,
        is_admin: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO users (username, is_admin) VALUES ($1, $2)
             ON CONFLICT (username) DO NOTHING",
        )
        .bind(username)
        .bind(is_admin)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_admin(tx: &mut Transaction<'_, Postgres>, user_id: UserId) -> Result<()> {
        sqlx::query("UPDATE users SET is_admin = TRUE WHERE id = $1")
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn insert_market(
        tx: &mut Transaction<'_, Postgres>,
        draft: &MarketDraft,
        created_by: UserId,
    ) -> Result<MarketRecord> {
        let sql = format!(
            "INSERT INTO markets (title, description, rules, closes_at, resolves_at, b, q_yes, q_no, created_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING {MARKET_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&draft.title)
            .bind(&draft.description)
            .bind(&draft.rules)
            .bind(draft.closes_at)
            .bind(draft.resolves_at)
            .bind(draft.b)
            .bind(draft.q_yes)
            .bind(draft.q_no)
            .bind(created_by)
            .fetch_one(&mut **tx)
            .await?;
        Self::extract_market(&row)
    }

    /// Persist the editable text and schedule fields of a market.
    pub async fn update_market_details(
        tx: &mut Transaction<'_, Postgres>,
        market: &MarketRecord,
    ) -> Result<MarketRecord> {
        let sql = format!(
            "UPDATE markets SET title = $1, description = $2, rules = $3, closes_at = $4, resolves_at = $5
             WHERE id = $6 RETURNING {MARKET_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&market.title)
            .bind(&market.description)
            .bind(&market.rules)
            .bind(market.closes_at)
            .bind(market.resolves_at)
            .bind(market.id)
            .fetch_one(&mut **tx)
            .await?;
        Self::extract_market(&row)
    }

    pub async fn count_users<'e, E: PgExecutor<'e>>(executor: E, user_ids: &[UserId]) -> Result<i64> {
        if user_ids.is_empty() {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = ANY($1)")
            .bind(user_ids)
            .fetch_one(executor)
            .await?;
        Ok(count)
    }

    pub async fn insert_suggestion<'e, E: PgExecutor<'e>>(
        executor: E,
        created_by: UserId,
        title: &str,
        details: &str,
    ) -> Result<Suggestion> {
        let sql = format!(
            "INSERT INTO suggestions (title, details, created_by) VALUES ($1, $2, $3)
             RETURNING {SUGGESTION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(title)
            .bind(details)
            .bind(created_by)
            .fetch_one(executor)
            .await?;
        Self::extract_suggestion(&row)
    }

    /// Move a PENDING suggestion to a terminal status; `None` if it was not pending.
    pub async fn set_suggestion_status(
        tx: &mut Transaction<'_, Postgres>,
        suggestion_id: i32,
        status: SuggestionStatus,
    ) -> Result<Option<Suggestion>> {
        let sql = format!(
            "UPDATE suggestions
             SET status = $2, used_at = CASE WHEN $2 = 'USED' THEN NOW() ELSE used_at END
             WHERE id = $1 AND status = 'PENDING'
             RETURNING {SUGGESTION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(suggestion_id)
            .bind(status.as_str())
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(Self::extract_suggestion).transpose()
    }

    /// Mark a pending suggestion as used by `market_id`.
    pub async fn consume_suggestion(
        tx: &mut Transaction<'_, Postgres>,
        suggestion_id: i32,
        market_id: MarketId,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE suggestions SET status = 'USED', market_id = $1, used_at = NOW()
             WHERE id = $2 AND status = 'PENDING'",
        )
        .bind(market_id)
        .bind(suggestion_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
