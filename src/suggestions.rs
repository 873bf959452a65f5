//! User-submitted market suggestions, reviewed by admins.

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, instrument};

use crate::accounts::require_admin;
use crate::config::Config;
use crate::db_adapter::DbAdapter;
use crate::error::{EngineError, Result};
use crate::models::{Principal, Suggestion, SuggestionStatus};

pub const TITLE_MIN_LEN: usize = 3;
pub const TITLE_MAX_LEN: usize = 120;
pub const DETAILS_MAX_LEN: usize = 4000;
pub const LIST_LIMIT: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SuggestionDecision {
    Accept,
    Reject,
}

impl SuggestionDecision {
    pub fn status(&self) -> SuggestionStatus {
        match self {
            SuggestionDecision::Accept => SuggestionStatus::Used,
            SuggestionDecision::Reject => SuggestionStatus::Rejected,
        }
    }
}

#[instrument(skip(pool, details))]
pub async fn create_suggestion(
    pool: &PgPool,
    author: Principal,
    title: &str,
    details: &str,
) -> Result<Suggestion> {
    let title = title.trim();
    let details = details.trim();
    let title_len = title.chars().count();
    if !(TITLE_MIN_LEN..=TITLE_MAX_LEN).contains(&title_len) {
        return Err(EngineError::InvalidInput(format!(
            "title must be {}-{} characters",
            TITLE_MIN_LEN, TITLE_MAX_LEN
        )));
    }
    if details.chars().count() > DETAILS_MAX_LEN {
        return Err(EngineError::InvalidInput(format!(
            "details must be at most {} characters",
            DETAILS_MAX_LEN
        )));
    }

    let suggestion = DbAdapter::insert_suggestion(pool, author.user_id, title, details).await?;
    info!(suggestion_id = suggestion.id, "suggestion submitted");
    Ok(suggestion)
}

/// Accept or reject a pending suggestion.
#[instrument(skip(pool, config))]
pub async fn decide_suggestion(
    pool: &PgPool,
    config: &Config,
    admin: Principal,
    suggestion_id: i32,
    decision: SuggestionDecision,
) -> Result<Suggestion> {
    with_locked_tx!(pool, config, tx, {
        decide_suggestion_transaction(&mut tx, &admin, suggestion_id, decision).await
    })
}

async fn decide_suggestion_transaction(
    tx: &mut Transaction<'_, Postgres>,
    admin: &Principal,
    suggestion_id: i32,
    decision: SuggestionDecision,
) -> Result<Suggestion> {
    require_admin(tx, admin).await?;

    match DbAdapter::set_suggestion_status(tx, suggestion_id, decision.status()).await? {
        Some(suggestion) => {
            info!(suggestion_id, status = %suggestion.status, "suggestion decided");
            Ok(suggestion)
        }
        None => match DbAdapter::fetch_suggestion(&mut **tx, suggestion_id).await? {
            Some(existing) => Err(EngineError::InvalidState(format!(
                "suggestion {} is already {}",
                suggestion_id, existing.status
            ))),
            None => Err(EngineError::not_found("suggestion", suggestion_id)),
        },
    }
}

/// Admins see every suggestion; everyone else sees their own.
pub async fn list_suggestions(pool: &PgPool, viewer: Principal) -> Result<Vec<Suggestion>> {
    let account = DbAdapter::fetch_account(pool, viewer.user_id)
        .await?
        .ok_or_else(|| EngineError::not_found("user", viewer.user_id))?;
    let author = if account.is_admin {
        None
    } else {
        Some(account.id)
    };
    DbAdapter::fetch_suggestions(pool, author, LIST_LIMIT).await
}
