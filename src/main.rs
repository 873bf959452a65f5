//! HTTP surface over the credit market core.
//!
//! Authentication happens upstream: a trusted gateway verifies the session or
//! invite credential and forwards the resolved account id in `x-principal-id`.
//! `/accounts/login` is called by that gateway only and must not be exposed to clients.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use credit_market::lmsr_core::Side;
use credit_market::models::{MarketEdit, NewMarket, Principal, TradeRequest};
use credit_market::suggestions::SuggestionDecision;
use credit_market::{
    accounts, allowance, database, markets, settlement, suggestions, trading, Config, EngineError,
};

const PRINCIPAL_HEADER: &str = "x-principal-id";

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    config: Arc<Config>,
}

/// Failure rendered as a JSON response
#[derive(Debug)]
enum ApiError {
    /// No usable principal header; the gateway did not authenticate the request
    Unauthenticated,
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Engine(err) => match err {
                EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
                EngineError::InvalidInput(_)
                | EngineError::InsufficientFunds { .. }
                | EngineError::InsufficientShares { .. }
                | EngineError::TradeTooSmall(_) => StatusCode::BAD_REQUEST,
                EngineError::InvalidState(_) | EngineError::Conflict(_) => StatusCode::CONFLICT,
                EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
                EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn body(&self) -> Value {
        match self {
            ApiError::Unauthenticated => json!({
                "error": "authentication required",
                "code": "UNAUTHENTICATED",
                "retryable": false,
            }),
            ApiError::Engine(err) => {
                let message = match err {
                    EngineError::Internal(detail) => {
                        error!(detail = %detail, "internal error");
                        "Internal server error".to_string()
                    }
                    other => other.to_string(),
                };
                json!({
                    "error": message,
                    "code": err.code(),
                    "retryable": err.is_retryable(),
                })
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn caller(headers: &HeaderMap) -> Result<Principal, ApiError> {
    let user_id = headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .ok_or(ApiError::Unauthenticated)?;
    // Admin rights are always re-read from the store
    Ok(Principal {
        user_id,
        is_admin: false,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,credit_market=debug")),
        )
        .init();

    let config = Config::from_env();
    config.log_config();

    let pool = database::create_pool(&config.database).await?;
    database::run_migrations(&pool).await?;

    let addr: SocketAddr = config.server.bind_addr.parse()?;
    let state = AppState {
        pool,
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/accounts/login", post(login))
        .route("/me", get(me))
        .route("/me/ledger", get(my_ledger))
        .route("/me/allowance", post(claim_allowance))
        .route("/markets", get(list_markets).post(create_market))
        .route("/markets/:market_id", get(get_market).patch(update_market))
        .route("/markets/:market_id/quote", get(quote))
        .route("/markets/:market_id/trade", post(trade))
        .route("/markets/:market_id/position", get(position))
        .route("/markets/:market_id/resolve", post(resolve))
        .route("/admin/credits", post(adjust_credits))
        .route("/admin/delete-user", post(delete_user))
        .route("/suggestions", get(list_suggestions).post(create_suggestion))
        .route("/suggestions/:suggestion_id", axum::routing::patch(decide_suggestion))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(%addr, "credit market listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    Json(json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "service": "credit-market",
    }))
}

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    #[serde(default)]
    is_admin: bool,
}

/// Called by the gateway after it has verified a credential.
///
/// Trust boundary: `username` and `is_admin` are taken as already verified by
/// the gateway, so `is_admin: true` promotes the account. This route must only
/// be reachable from the gateway, never from clients.
async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> ApiResult<accounts::LoginOutcome> {
    let outcome =
        accounts::ensure_user(&state.pool, &state.config, &body.username, body.is_admin).await?;
    Ok(Json(outcome))
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Value> {
    let principal = caller(&headers)?;
    let account = accounts::get_account(&state.pool, principal.user_id).await?;
    Ok(Json(json!({ "user": account })))
}

async fn my_ledger(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Value> {
    let principal = caller(&headers)?;
    let entries = accounts::list_ledger(&state.pool, principal.user_id).await?;
    Ok(Json(json!({ "entries": entries })))
}

async fn claim_allowance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<allowance::AllowanceResult> {
    let principal = caller(&headers)?;
    let result =
        allowance::grant_allowance_if_due(&state.pool, &state.config, principal.user_id).await?;
    Ok(Json(result))
}

async fn list_markets(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Value> {
    caller(&headers)?;
    let markets = markets::list_markets(&state.pool).await?;
    Ok(Json(json!({ "markets": markets })))
}

async fn create_market(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewMarket>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let principal = caller(&headers)?;
    let market = markets::create_market(&state.pool, &state.config, principal, body).await?;
    Ok((StatusCode::CREATED, Json(json!({ "market": market }))))
}

async fn get_market(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(market_id): Path<i32>,
) -> ApiResult<markets::MarketView> {
    caller(&headers)?;
    Ok(Json(markets::get_market(&state.pool, market_id).await?))
}

async fn update_market(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(market_id): Path<i32>,
    Json(edit): Json<MarketEdit>,
) -> ApiResult<Value> {
    let principal = caller(&headers)?;
    let market =
        markets::update_market(&state.pool, &state.config, principal, market_id, edit).await?;
    Ok(Json(json!({ "market": market })))
}

#[derive(Deserialize)]
struct QuoteParams {
    side: Side,
    delta_shares: f64,
}

async fn quote(
    State(state): State<AppState>,
    Path(market_id): Path<i32>,
    Query(params): Query<QuoteParams>,
) -> ApiResult<credit_market::models::Quote> {
    let quote = trading::quote(&state.pool, market_id, params.side, params.delta_shares).await?;
    Ok(Json(quote))
}

#[derive(Deserialize)]
struct TradeBody {
    side: Side,
    kind: credit_market::models::TradeKind,
    amount_type: credit_market::models::AmountType,
    amount: f64,
}

async fn trade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(market_id): Path<i32>,
    Json(body): Json<TradeBody>,
) -> ApiResult<credit_market::models::TradeResult> {
    let principal = caller(&headers)?;
    let request = TradeRequest {
        market_id,
        side: body.side,
        kind: body.kind,
        amount_type: body.amount_type,
        amount: body.amount,
    };
    let result =
        trading::execute_trade(&state.pool, &state.config, principal.user_id, request).await?;
    Ok(Json(result))
}

async fn position(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(market_id): Path<i32>,
) -> ApiResult<credit_market::models::Position> {
    let principal = caller(&headers)?;
    let position = markets::get_position(&state.pool, principal.user_id, market_id).await?;
    Ok(Json(position))
}

#[derive(Deserialize)]
struct ResolveBody {
    outcome: Side,
    note: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn resolve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(market_id): Path<i32>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<credit_market::models::ResolutionSummary> {
    let principal = caller(&headers)?;
    let summary = settlement::resolve_market(
        &state.pool,
        &state.config,
        principal,
        market_id,
        body.outcome,
        body.force,
        body.note,
    )
    .await?;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct AdjustCreditsBody {
    user_id: i32,
    delta_credits: f64,
    note: Option<String>,
}

async fn adjust_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AdjustCreditsBody>,
) -> ApiResult<Value> {
    let principal = caller(&headers)?;
    let account = accounts::adjust_credits(
        &state.pool,
        &state.config,
        principal,
        body.user_id,
        body.delta_credits,
        body.note,
    )
    .await?;
    Ok(Json(json!({ "user": account })))
}

#[derive(Deserialize)]
struct DeleteUserBody {
    username: String,
}

async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DeleteUserBody>,
) -> ApiResult<credit_market::models::LiquidationSummary> {
    let principal = caller(&headers)?;
    let summary =
        settlement::delete_user(&state.pool, &state.config, principal, &body.username).await?;
    Ok(Json(summary))
}

async fn list_suggestions(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Value> {
    let principal = caller(&headers)?;
    let list = suggestions::list_suggestions(&state.pool, principal).await?;
    Ok(Json(json!({ "suggestions": list })))
}

#[derive(Deserialize)]
struct SuggestionBody {
    title: String,
    #[serde(default)]
    details: String,
}

async fn create_suggestion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SuggestionBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let principal = caller(&headers)?;
    let suggestion =
        suggestions::create_suggestion(&state.pool, principal, &body.title, &body.details).await?;
    Ok((StatusCode::CREATED, Json(json!({ "suggestion": suggestion }))))
}

#[derive(Deserialize)]
struct DecideBody {
    action: SuggestionDecision,
}

async fn decide_suggestion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(suggestion_id): Path<i32>,
    Json(body): Json<DecideBody>,
) -> ApiResult<Value> {
    let principal = caller(&headers)?;
    let suggestion = suggestions::decide_suggestion(
        &state.pool,
        &state.config,
        principal,
        suggestion_id,
        body.action,
    )
    .await?;
    Ok(Json(json!({ "suggestion": suggestion })))
}
