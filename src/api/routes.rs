//! HTTP surface for the web client.
//!
//! Amounts travel as decimal strings (18 implied decimals), prices as 8-decimal integers plus a
//! formatted string. Core calls are synchronous and run on the blocking pool.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::auth::admin_auth_middleware;
use crate::error::{ErrorClass, GameError};
use crate::game::PredictionGame;
use crate::models::{Address, Direction, PoolSnapshot, Round, RoundPhase, RoundStatus, Stake};
use crate::price::{DisplayPrice, PriceOrigin};
use crate::round::TransitionOutcome;
use crate::sync::RoundView;
use crate::units::{format_amount, format_price, parse_amount, PriceE8};

const DEFAULT_ROUNDS_LIMIT: usize = 20;
const MAX_ROUNDS_LIMIT: usize = 200;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub game: Arc<PredictionGame>,
    /// Views published by the keeper, when one is running.
    pub views: Option<watch::Receiver<Option<RoundView>>>,
    /// Bearer token guarding owner-only routes. `None` disables them.
    pub admin_token: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let owner_routes = Router::new()
        .route("/api/pool/withdraw", post(withdraw_from_pool))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/round", get(get_current_round))
        .route("/api/round/status", get(get_round_status))
        .route("/api/round/view", get(get_round_view))
        .route("/api/round/transition", post(trigger_transition))
        .route("/api/round/start", post(start_new_round))
        .route("/api/rounds", get(get_rounds))
        .route("/api/rounds/:id", get(get_round))
        .route("/api/rounds/:id/bets/:address", get(get_user_bets))
        .route("/api/bets", post(place_bet))
        .route("/api/price", get(get_latest_price))
        .route("/api/price/display", get(get_display_price))
        .route("/api/rewards/claim", post(claim_rewards))
        .route("/api/rewards/:address", get(get_pending_rewards))
        .route("/api/pool", get(get_pool))
        .route("/api/pool/deposit", post(deposit_to_pool))
        .merge(owner_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let current_round = state.game.current_round_id().ok();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        current_round,
    })
}

async fn get_current_round(State(state): State<AppState>) -> Result<Json<RoundDto>, ApiError> {
    let round = blocking(&state, |game| game.current_round()).await?;
    Ok(Json(RoundDto::from(&round)))
}

async fn get_round_status(State(state): State<AppState>) -> Result<Json<StatusDto>, ApiError> {
    let status = blocking(&state, |game| game.check_status()).await?;
    Ok(Json(StatusDto::from(&status)))
}

/// Latest keeper view, or a fresh one when no keeper is publishing.
async fn get_round_view(State(state): State<AppState>) -> Result<Json<RoundView>, ApiError> {
    if let Some(view) = state.views.as_ref().and_then(|rx| rx.borrow().clone()) {
        return Ok(Json(view));
    }
    let view = blocking(&state, RoundView::snapshot).await?;
    Ok(Json(view))
}

async fn trigger_transition(
    State(state): State<AppState>,
    body: Option<Json<TransitionRequest>>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let round_id = body.and_then(|Json(req)| req.round_id);
    let outcome = blocking(&state, move |game| match round_id {
        Some(id) => game.trigger_transition_for(id),
        None => game.trigger_transition(),
    })
    .await?;
    Ok(Json(TransitionResponse::from(&outcome)))
}

async fn start_new_round(State(state): State<AppState>) -> Result<Json<RoundDto>, ApiError> {
    let round = blocking(&state, |game| game.start_new_round()).await?;
    Ok(Json(RoundDto::from(&round)))
}

async fn get_rounds(
    State(state): State<AppState>,
    Query(params): Query<RoundsQuery>,
) -> Result<Json<RoundsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_ROUNDS_LIMIT).min(MAX_ROUNDS_LIMIT);
    let rounds = blocking(&state, move |game| Ok(game.rounds(limit))).await?;
    Ok(Json(RoundsResponse {
        count: rounds.len(),
        rounds: rounds.iter().map(RoundDto::from).collect(),
    }))
}

async fn get_round(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<RoundDto>, ApiError> {
    let round = blocking(&state, move |game| game.round(id)).await?;
    Ok(Json(RoundDto::from(&round)))
}

async fn get_user_bets(
    State(state): State<AppState>,
    Path((id, address)): Path<(u64, String)>,
) -> Result<Json<BetsResponse>, ApiError> {
    let bettor = parse_address(&address)?;
    let stakes = blocking(&state, move |game| Ok(game.user_bets(id, &bettor))).await?;
    Ok(Json(BetsResponse {
        round_id: id,
        wallet_address: address.trim().to_lowercase(),
        bets: stakes.iter().map(StakeDto::from).collect(),
    }))
}

async fn place_bet(
    State(state): State<AppState>,
    Json(req): Json<BetRequest>,
) -> Result<Json<StakeDto>, ApiError> {
    let bettor = parse_address(&req.wallet_address)?;
    let direction: Direction = req
        .direction
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;
    let amount = parse_amount_field(&req.amount)?;

    let stake = blocking(&state, move |game| game.place_bet(&bettor, direction, amount)).await?;
    Ok(Json(StakeDto::from(&stake)))
}

async fn get_latest_price(State(state): State<AppState>) -> Result<Json<PriceResponse>, ApiError> {
    let price = blocking(&state, |game| game.latest_price()).await?;
    Ok(Json(PriceResponse {
        price,
        display: format_price(price),
    }))
}

async fn get_display_price(
    State(state): State<AppState>,
) -> Result<Json<DisplayPriceResponse>, ApiError> {
    let price = blocking(&state, |game| Ok(game.display_price())).await?;
    Ok(Json(DisplayPriceResponse::from(price)))
}

async fn get_pending_rewards(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<RewardsResponse>, ApiError> {
    let bettor = parse_address(&address)?;
    let pending = blocking(&state, {
        let bettor = bettor.clone();
        move |game| Ok(game.pending_rewards(&bettor))
    })
    .await?;
    Ok(Json(RewardsResponse {
        wallet_address: bettor.to_string(),
        pending: format_amount(pending),
    }))
}

async fn claim_rewards(
    State(state): State<AppState>,
    Json(req): Json<WalletRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let bettor = parse_address(&req.wallet_address)?;
    let claimed = blocking(&state, {
        let bettor = bettor.clone();
        move |game| game.claim_rewards(&bettor)
    })
    .await?;
    Ok(Json(ClaimResponse {
        wallet_address: bettor.to_string(),
        claimed: format_amount(claimed),
    }))
}

async fn get_pool(State(state): State<AppState>) -> Result<Json<PoolResponse>, ApiError> {
    let pool = blocking(&state, |game| Ok(game.pool())).await?;
    Ok(Json(PoolResponse::from(&pool)))
}

async fn deposit_to_pool(
    State(state): State<AppState>,
    Json(req): Json<PoolRequest>,
) -> Result<Json<PoolResponse>, ApiError> {
    let (from, amount) = req.parse()?;
    let pool = blocking(&state, move |game| game.deposit_to_pool(&from, amount)).await?;
    Ok(Json(PoolResponse::from(&pool)))
}

/// Behind the admin token. Always pays out to the configured pool owner.
async fn withdraw_from_pool(
    State(state): State<AppState>,
    Json(req): Json<WithdrawRequest>,
) -> Result<Json<PoolResponse>, ApiError> {
    let amount = parse_amount_field(&req.amount)?;
    let pool = blocking(&state, move |game| {
        let owner = game.pool_owner().cloned().ok_or(GameError::NotPoolOwner)?;
        game.withdraw_from_pool(&owner, amount)
    })
    .await?;
    Ok(Json(PoolResponse::from(&pool)))
}

/// Run a synchronous game call on the blocking pool.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&PredictionGame) -> Result<T, GameError> + Send + 'static,
{
    let game = state.game.clone();
    tokio::task::spawn_blocking(move || f(&game))
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("worker task failed: {}", e)))?
        .map_err(ApiError::Game)
}

fn parse_address(raw: &str) -> Result<Address, ApiError> {
    Address::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("Invalid wallet address: {:?}", raw)))
}

fn parse_amount_field(raw: &str) -> Result<u128, ApiError> {
    parse_amount(raw).ok_or_else(|| ApiError::BadRequest(format!("Invalid amount: {}", raw)))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct RoundsQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct TransitionRequest {
    /// Round the caller observed as expired. Defaults to the current round.
    round_id: Option<u64>,
}

#[derive(Deserialize)]
struct BetRequest {
    wallet_address: String,
    /// "up" or "down"
    direction: String,
    /// Decimal string, e.g. "0.01"
    amount: String,
}

#[derive(Deserialize)]
struct WalletRequest {
    wallet_address: String,
}

#[derive(Deserialize)]
struct PoolRequest {
    wallet_address: String,
    amount: String,
}

impl PoolRequest {
    fn parse(&self) -> Result<(Address, u128), ApiError> {
        Ok((parse_address(&self.wallet_address)?, parse_amount_field(&self.amount)?))
    }
}

#[derive(Deserialize)]
struct WithdrawRequest {
    amount: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    current_round: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoundDto {
    pub id: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub start_price: PriceE8,
    pub start_price_display: String,
    pub end_price: Option<PriceE8>,
    pub end_price_display: Option<String>,
    pub outcome: Option<Direction>,
    pub outcome_is_up: Option<bool>,
    pub finalized: bool,
    pub finalized_at: Option<i64>,
}

impl From<&Round> for RoundDto {
    fn from(round: &Round) -> Self {
        Self {
            id: round.id,
            start_time: round.start_time,
            end_time: round.end_time,
            start_price: round.start_price,
            start_price_display: format_price(round.start_price),
            end_price: round.end_price,
            end_price_display: round.end_price.map(format_price),
            outcome: round.outcome,
            outcome_is_up: round.outcome_is_up(),
            finalized: round.finalized,
            finalized_at: round.finalized_at,
        }
    }
}

#[derive(Serialize)]
struct StatusDto {
    round: RoundDto,
    phase: RoundPhase,
    needs_transition: bool,
    time_left: i64,
    checked_at: i64,
}

impl From<&RoundStatus> for StatusDto {
    fn from(status: &RoundStatus) -> Self {
        Self {
            round: RoundDto::from(&status.round),
            phase: status.phase,
            needs_transition: status.needs_transition,
            time_left: status.time_left,
            checked_at: status.checked_at,
        }
    }
}

#[derive(Serialize)]
struct RoundsResponse {
    count: usize,
    rounds: Vec<RoundDto>,
}

#[derive(Serialize)]
struct TransitionResponse {
    finalized: RoundDto,
    next: RoundDto,
    winners: usize,
    paid: String,
    retained: String,
    refunded: bool,
}

impl From<&TransitionOutcome> for TransitionResponse {
    fn from(outcome: &TransitionOutcome) -> Self {
        Self {
            finalized: RoundDto::from(&outcome.finalized),
            next: RoundDto::from(&outcome.next),
            winners: outcome.settlement.credits.len(),
            paid: format_amount(outcome.settlement.paid_total()),
            retained: format_amount(outcome.settlement.retained()),
            refunded: outcome.settlement.refunded,
        }
    }
}

#[derive(Serialize)]
struct StakeDto {
    id: String,
    wallet_address: String,
    round_id: u64,
    direction: Direction,
    amount: String,
    placed_at: i64,
}

impl From<&Stake> for StakeDto {
    fn from(stake: &Stake) -> Self {
        Self {
            id: stake.id.to_string(),
            wallet_address: stake.bettor.to_string(),
            round_id: stake.round_id,
            direction: stake.direction,
            amount: format_amount(stake.amount),
            placed_at: stake.placed_at,
        }
    }
}

#[derive(Serialize)]
struct BetsResponse {
    round_id: u64,
    wallet_address: String,
    bets: Vec<StakeDto>,
}

#[derive(Serialize)]
struct PriceResponse {
    price: PriceE8,
    display: String,
}

#[derive(Serialize)]
struct DisplayPriceResponse {
    price: PriceE8,
    display: String,
    updated_at: Option<i64>,
    origin: PriceOrigin,
}

impl From<DisplayPrice> for DisplayPriceResponse {
    fn from(price: DisplayPrice) -> Self {
        Self {
            price: price.value,
            display: format_price(price.value),
            updated_at: price.updated_at,
            origin: price.origin,
        }
    }
}

#[derive(Serialize)]
struct RewardsResponse {
    wallet_address: String,
    pending: String,
}

#[derive(Serialize)]
struct ClaimResponse {
    wallet_address: String,
    claimed: String,
}

#[derive(Serialize)]
struct PoolResponse {
    balance: String,
    escrowed: String,
    pending_total: String,
    withdrawable: String,
}

impl From<&PoolSnapshot> for PoolResponse {
    fn from(pool: &PoolSnapshot) -> Self {
        Self {
            balance: format_amount(pool.balance),
            escrowed: format_amount(pool.escrowed),
            pending_total: format_amount(pool.pending_total),
            withdrawable: format_amount(pool.withdrawable()),
        }
    }
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Game(GameError),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<GameError> for ApiError {
    fn from(err: GameError) -> Self {
        ApiError::Game(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Game(err) => match err {
                GameError::RoundNotFound(_) | GameError::NoActiveRound => StatusCode::NOT_FOUND,
                GameError::NotPoolOwner => StatusCode::FORBIDDEN,
                GameError::NoRewardsAvailable => StatusCode::CONFLICT,
                _ => match err.class() {
                    ErrorClass::Input => StatusCode::BAD_REQUEST,
                    ErrorClass::Staleness => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorClass::Idempotency => StatusCode::CONFLICT,
                    ErrorClass::Consistency | ErrorClass::Internal => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                },
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Game(err) => {
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = %err, code = err.code(), "Request failed");
                }
                json!({
                    "error": err.to_string(),
                    "kind": err.class(),
                    "code": err.code(),
                })
            }
            ApiError::BadRequest(msg) => json!({
                "error": msg,
                "kind": ErrorClass::Input,
                "code": "bad_request",
            }),
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:#}", err);
                json!({
                    "error": "Internal server error",
                    "kind": ErrorClass::Internal,
                    "code": "internal",
                })
            }
        };

        (status, Json(body)).into_response()
    }
}
