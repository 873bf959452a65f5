//! Account lifecycle: the login hook, admin credit adjustments and reads.

use chrono::Utc;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, instrument};

use crate::allowance::{grant_allowance_tx, AllowanceResult};
use crate::config::Config;
use crate::db_adapter::{DbAdapter, LedgerPosting};
use crate::error::{EngineError, Result};
use crate::models::{Account, LedgerEntry, LedgerEntryType, Principal, UserId};
use crate::money::{credits_to_cents, format_credits};

pub const USERNAME_MIN_LEN: usize = 2;
pub const USERNAME_MAX_LEN: usize = 20;
pub const NOTE_MAX_LEN: usize = 2000;
pub const LEDGER_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub principal: Principal,
    pub account: Account,
    pub created: bool,
    pub allowance: AllowanceResult,
}

/// Usernames are 2-20 characters of ASCII letters, digits and underscores.
pub fn validate_username(raw: &str) -> Result<&str> {
    let username = raw.trim();
    let valid_len = (USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&username.len());
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_len || !valid_chars {
        return Err(EngineError::InvalidInput(
            "username must be 2-20 letters, numbers or underscores".to_string(),
        ));
    }
    Ok(username)
}

/// Fail unless the principal is an admin according to the store, not the caller.
pub(crate) async fn require_admin(
    tx: &mut Transaction<'_, Postgres>,
    principal: &Principal,
) -> Result<Account> {
    let account = DbAdapter::fetch_account(&mut **tx, principal.user_id)
        .await?
        .ok_or_else(|| EngineError::not_found("user", principal.user_id))?;
    if !account.is_admin {
        return Err(EngineError::Forbidden("admin privileges required".to_string()));
    }
    Ok(account)
}

/// Resolve an authenticated login to an account, creating it on first sight.
///
/// `is_admin` comes from whichever credential the caller verified; it can
/// promote an account but never demotes one. Any due allowance is granted
/// under the same user lock.
#[instrument(skip(pool, config))]
pub async fn ensure_user(
    pool: &PgPool,
    config: &Config,
    username: &str,
    is_admin: bool,
) -> Result<LoginOutcome> {
    let username = validate_username(username)?;

    with_locked_tx!(pool, config, tx, {
        ensure_user_transaction(&mut tx, config, username, is_admin).await
    })
}

async fn ensure_user_transaction(
    tx: &mut Transaction<'_, Postgres>,
    config: &Config,
    username: &str,
    is_admin: bool,
) -> Result<LoginOutcome> {
    let mut created = false;
    let mut account = match DbAdapter::lock_user_by_name(tx, username).await? {
        Some(account) => account,
        None => {
            created = DbAdapter::insert_user(tx, username, is_admin).await?;
            DbAdapter::lock_user_by_name(tx, username)
                .await?
                .ok_or_else(|| EngineError::not_found("user", username))?
        }
    };

    if is_admin && !account.is_admin {
        DbAdapter::set_admin(tx, account.id).await?;
        info!(user_id = account.id, "promoted to admin");
    }

    let allowance = grant_allowance_tx(tx, &account, config, Utc::now()).await?;
    // Re-read so the returned row reflects the grant and any promotion
    account = DbAdapter::lock_user(tx, account.id).await?;

    if created {
        info!(user_id = account.id, username, "account created");
    }
    Ok(LoginOutcome {
        principal: account.principal(),
        account,
        created,
        allowance,
    })
}

/// Admin credit or debit of a user's balance, recorded as an ALLOWANCE entry.
#[instrument(skip(pool, config, note))]
pub async fn adjust_credits(
    pool: &PgPool,
    config: &Config,
    admin: Principal,
    user_id: UserId,
    delta_credits: f64,
    note: Option<String>,
) -> Result<Account> {
    if !delta_credits.is_finite() || delta_credits == 0.0 {
        return Err(EngineError::InvalidInput(
            "delta_credits must be a non-zero number".to_string(),
        ));
    }
    let delta_cents = credits_to_cents(delta_credits);
    if delta_cents == 0 {
        return Err(EngineError::TradeTooSmall(
            "adjustment rounds to zero cents".to_string(),
        ));
    }
    let note = note.map(|n| n.trim().to_string()).unwrap_or_default();
    if note.chars().count() > NOTE_MAX_LEN {
        return Err(EngineError::InvalidInput(format!(
            "note must be at most {} characters",
            NOTE_MAX_LEN
        )));
    }

    with_locked_tx!(pool, config, tx, {
        adjust_credits_transaction(&mut tx, &admin, user_id, delta_cents, &note).await
    })
}

async fn adjust_credits_transaction(
    tx: &mut Transaction<'_, Postgres>,
    admin: &Principal,
    user_id: UserId,
    delta_cents: i64,
    note: &str,
) -> Result<Account> {
    let admin_account = require_admin(tx, admin).await?;
    let mut account = DbAdapter::lock_user(tx, user_id).await?;

    if account.balance_cents + delta_cents < 0 {
        return Err(EngineError::InsufficientFunds {
            required_cents: -delta_cents,
            available_cents: account.balance_cents,
        });
    }

    let note = if note.is_empty() {
        format!("Admin adjustment by {}", admin_account.username)
    } else {
        format!("Admin adjustment by {}: {}", admin_account.username, note)
    };
    account.balance_cents = DbAdapter::post_to_ledger(
        tx,
        LedgerPosting {
            user_id,
            market_id: None,
            entry_type: LedgerEntryType::Allowance,
            amount_cents: delta_cents,
            ref_trade_id: None,
            note: &note,
        },
    )
    .await?;

    info!(
        user_id,
        admin_id = admin.user_id,
        delta = %format_credits(delta_cents),
        balance = %format_credits(account.balance_cents),
        "credits adjusted"
    );
    Ok(account)
}

pub async fn get_account(pool: &PgPool, user_id: UserId) -> Result<Account> {
    DbAdapter::fetch_account(pool, user_id)
        .await?
        .ok_or_else(|| EngineError::not_found("user", user_id))
}

/// Most recent ledger entries first.
pub async fn list_ledger(pool: &PgPool, user_id: UserId) -> Result<Vec<LedgerEntry>> {
    DbAdapter::fetch_ledger(pool, user_id, LEDGER_PAGE_LIMIT).await
}
