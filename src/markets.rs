//! Market creation, editing and read models.

use chrono::Utc;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use tracing::{info, instrument};

use crate::accounts::require_admin;
use crate::config::Config;
use crate::db_adapter::DbAdapter;
use crate::error::{EngineError, Result};
use crate::lmsr_core::{initial_quantities, MAX_INITIAL_PROBABILITY, MIN_INITIAL_PROBABILITY};
use crate::models::{
    InvolvedUser, MarketEdit, MarketId, MarketRecord, NewMarket, Position, Principal, UserId,
};

pub const TITLE_MIN_LEN: usize = 3;
pub const TITLE_MAX_LEN: usize = 120;
pub const DESCRIPTION_MAX_LEN: usize = 1000;
pub const RULES_MAX_LEN: usize = 4000;
pub const MAX_INVOLVED_USERS: usize = 50;
pub const LIST_LIMIT: i64 = 100;
const DEFAULT_INITIAL_PROBABILITY: f64 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct MarketView {
    #[serde(flatten)]
    pub market: MarketRecord,
    pub price_yes: f64,
    pub involved_users: Vec<InvolvedUser>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketListing {
    #[serde(flatten)]
    pub market: MarketRecord,
    pub price_yes: f64,
}

/// A `NewMarket` that passed validation, with its opening inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketDraft {
    pub title: String,
    pub description: String,
    pub rules: String,
    pub closes_at: chrono::DateTime<Utc>,
    pub resolves_at: chrono::DateTime<Utc>,
    pub b: f64,
    pub q_yes: f64,
    pub q_no: f64,
    pub involved_users: Vec<InvolvedUser>,
    pub suggestion_id: Option<i32>,
}

fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(EngineError::InvalidInput(format!(
            "{} must be {}-{} characters",
            field, min, max
        )));
    }
    Ok(())
}

/// Deduplicate by user id (last entry wins) and enforce the list cap.
fn normalize_involved(users: &[InvolvedUser]) -> Result<Vec<InvolvedUser>> {
    if users.len() > MAX_INVOLVED_USERS {
        return Err(EngineError::InvalidInput(format!(
            "at most {} involved users",
            MAX_INVOLVED_USERS
        )));
    }
    let unique: BTreeMap<UserId, InvolvedUser> =
        users.iter().map(|u| (u.user_id, *u)).collect();
    Ok(unique.into_values().collect())
}

/// Validate a market request and compute `q_yes`/`q_no` for its opening price.
pub fn draft_market(new: &NewMarket, default_b: f64) -> Result<MarketDraft> {
    let title = new.title.trim();
    let description = new.description.trim();
    let rules = new.rules.trim();
    check_len("title", title, TITLE_MIN_LEN, TITLE_MAX_LEN)?;
    check_len("description", description, 0, DESCRIPTION_MAX_LEN)?;
    check_len("rules", rules, 1, RULES_MAX_LEN)?;

    if new.closes_at >= new.resolves_at {
        return Err(EngineError::InvalidInput(
            "resolves_at must be after closes_at".to_string(),
        ));
    }

    let b = new.b.unwrap_or(default_b);
    if !b.is_finite() || b <= 0.0 {
        return Err(EngineError::InvalidInput(
            "liquidity b must be positive".to_string(),
        ));
    }

    let p = new.initial_probability.unwrap_or(DEFAULT_INITIAL_PROBABILITY);
    if !(MIN_INITIAL_PROBABILITY..=MAX_INITIAL_PROBABILITY).contains(&p) {
        return Err(EngineError::InvalidInput(format!(
            "initial probability must be within [{}, {}]",
            MIN_INITIAL_PROBABILITY, MAX_INITIAL_PROBABILITY
        )));
    }
    let (q_yes, q_no) = initial_quantities(b, p);

    Ok(MarketDraft {
        title: title.to_string(),
        description: description.to_string(),
        rules: rules.to_string(),
        closes_at: new.closes_at,
        resolves_at: new.resolves_at,
        b,
        q_yes,
        q_no,
        involved_users: normalize_involved(&new.involved_users)?,
        suggestion_id: new.suggestion_id,
    })
}

async fn ensure_users_exist(
    tx: &mut Transaction<'_, Postgres>,
    involved: &[InvolvedUser],
) -> Result<()> {
    let ids: Vec<UserId> = involved.iter().map(|u| u.user_id).collect();
    let found = DbAdapter::count_users(&mut **tx, &ids).await?;
    if found != ids.len() as i64 {
        return Err(EngineError::InvalidInput(
            "one or more involved users were not found".to_string(),
        ));
    }
    Ok(())
}

/// Open a new market. Admin only; may consume a pending suggestion.
#[instrument(skip(pool, config, new), fields(title = %new.title))]
pub async fn create_market(
    pool: &PgPool,
    config: &Config,
    creator: Principal,
    new: NewMarket,
) -> Result<MarketRecord> {
    let draft = draft_market(&new, config.market.default_liquidity_b)?;

    with_locked_tx!(pool, config, tx, {
        create_market_transaction(&mut tx, &creator, &draft).await
    })
}

async fn create_market_transaction(
    tx: &mut Transaction<'_, Postgres>,
    creator: &Principal,
    draft: &MarketDraft,
) -> Result<MarketRecord> {
    require_admin(tx, creator).await?;
    ensure_users_exist(tx, &draft.involved_users).await?;

    let market = DbAdapter::insert_market(tx, draft, creator.user_id).await?;
    DbAdapter::replace_involved_users(tx, market.id, &draft.involved_users).await?;

    if let Some(suggestion_id) = draft.suggestion_id {
        if !DbAdapter::consume_suggestion(tx, suggestion_id, market.id).await? {
            return Err(EngineError::InvalidState(format!(
                "suggestion {} not found or already handled",
                suggestion_id
            )));
        }
    }

    info!(
        market_id = market.id,
        b = market.b,
        price_yes = market.price_yes(),
        "market created"
    );
    Ok(market)
}

/// Admin edit of a market's text, schedule or involved users.
#[instrument(skip(pool, config, edit))]
pub async fn update_market(
    pool: &PgPool,
    config: &Config,
    admin: Principal,
    market_id: MarketId,
    edit: MarketEdit,
) -> Result<MarketRecord> {
    if edit.is_empty() {
        return Err(EngineError::InvalidInput("no updates provided".to_string()));
    }

    with_locked_tx!(pool, config, tx, {
        update_market_transaction(&mut tx, &admin, market_id, &edit).await
    })
}

async fn update_market_transaction(
    tx: &mut Transaction<'_, Postgres>,
    admin: &Principal,
    market_id: MarketId,
    edit: &MarketEdit,
) -> Result<MarketRecord> {
    require_admin(tx, admin).await?;
    let mut market = DbAdapter::lock_market(tx, market_id).await?;
    apply_edit(&mut market, edit)?;

    let updated = DbAdapter::update_market_details(tx, &market).await?;

    if let Some(involved) = &edit.involved_users {
        let involved = normalize_involved(involved)?;
        ensure_users_exist(tx, &involved).await?;
        DbAdapter::replace_involved_users(tx, market_id, &involved).await?;
    }

    info!(market_id, "market updated");
    Ok(updated)
}

/// Apply an edit to an in-memory market, enforcing field rules.
pub fn apply_edit(market: &mut MarketRecord, edit: &MarketEdit) -> Result<()> {
    if market.is_resolved() && (edit.closes_at.is_some() || edit.resolves_at.is_some()) {
        return Err(EngineError::InvalidState(
            "cannot change close/resolve time after resolution".to_string(),
        ));
    }

    if let Some(title) = &edit.title {
        let title = title.trim();
        check_len("title", title, TITLE_MIN_LEN, TITLE_MAX_LEN)?;
        market.title = title.to_string();
    }
    if let Some(description) = &edit.description {
        let description = description.trim();
        check_len("description", description, 0, DESCRIPTION_MAX_LEN)?;
        market.description = description.to_string();
    }
    if let Some(rules) = &edit.rules {
        let rules = rules.trim();
        check_len("rules", rules, 1, RULES_MAX_LEN)?;
        market.rules = rules.to_string();
    }
    if let Some(closes_at) = edit.closes_at {
        market.closes_at = closes_at;
    }
    if let Some(resolves_at) = edit.resolves_at {
        market.resolves_at = resolves_at;
    }

    if market.closes_at >= market.resolves_at {
        return Err(EngineError::InvalidInput(
            "resolves_at must be after closes_at".to_string(),
        ));
    }
    Ok(())
}

pub async fn get_market(pool: &PgPool, market_id: MarketId) -> Result<MarketView> {
    let market = DbAdapter::fetch_market(pool, market_id)
        .await?
        .ok_or_else(|| EngineError::not_found("market", market_id))?;
    let involved_users = DbAdapter::fetch_involved_users(pool, market_id).await?;
    Ok(MarketView {
        price_yes: market.price_yes(),
        market,
        involved_users,
    })
}

/// Newest markets first.
pub async fn list_markets(pool: &PgPool) -> Result<Vec<MarketListing>> {
    let markets = DbAdapter::fetch_markets(pool, LIST_LIMIT).await?;
    Ok(markets
        .into_iter()
        .map(|market| MarketListing {
            price_yes: market.price_yes(),
            market,
        })
        .collect())
}

/// A user's holding in a market; empty if they never traded it.
pub async fn get_position(pool: &PgPool, user_id: UserId, market_id: MarketId) -> Result<Position> {
    if DbAdapter::fetch_market(pool, market_id).await?.is_none() {
        return Err(EngineError::not_found("market", market_id));
    }
    Ok(DbAdapter::fetch_position(pool, user_id, market_id)
        .await?
        .unwrap_or_else(|| Position::empty(user_id, market_id)))
}
