//! Thin HTTP transport binary wiring the core behind axum.
//!
//! Router assembly (`Router::new().nest("/api/v1", ...)`,
//! `tracing_subscriber` init, `CorsLayer`/`TraceLayer`) with none of the
//! auth, rate-limiting, or request-schema-validation middleware those
//! concerns are left to an external collaborator. Handlers take an
//! already-authenticated `user_id` path/header value the way an inner
//! service layer would be invoked by such middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use predex_core::config::PredexConfig;
use predex_core::db::Database;
use predex_core::errors::AppError;
use predex_core::escrow::{Ledger, SqlxLedger};
use predex_core::eventbus::EventBus;
use predex_core::gateway::{OrderGateway, SharedOrderGateway};
use predex_core::market_actor::MarketActor;
use predex_core::models::market::Outcome;
use predex_core::models::order::PlaceOrderRequest;
use predex_core::recovery;
use predex_core::settlement::{MarketRepository, SettlementService, SqlxMarketRepository};

struct AppState {
    gateway: SharedOrderGateway,
    markets: DashMap<Uuid, Arc<MarketActor>>,
    ledger: Arc<dyn Ledger>,
    events: Arc<EventBus>,
    market_repo: Arc<dyn MarketRepository>,
    settlement: SettlementService,
    config: PredexConfig,
    db: Database,
}

impl AppState {
    async fn actor_for(&self, market_id: Uuid) -> Arc<MarketActor> {
        if let Some(actor) = self.markets.get(&market_id) {
            return actor.clone();
        }
        let actor = Arc::new(MarketActor::new(
            market_id,
            self.config.clone(),
            self.ledger.clone(),
            self.events.clone(),
            self.market_repo.clone(),
        ));
        self.markets.insert(market_id, actor.clone());
        actor
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "predex_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PredexConfig::load()?;
    tracing::info!("Starting PredEx core v{}", env!("CARGO_PKG_VERSION"));

    let db = Database::connect(&config.database_url).await?;
    tracing::info!("Database connected");

    let ledger: Arc<dyn Ledger> = Arc::new(SqlxLedger::new(db.pool.clone()));
    let market_repo: Arc<dyn MarketRepository> = Arc::new(SqlxMarketRepository::new(db.pool.clone()));
    let events = Arc::new(EventBus::new());

    let recovered = recovery::recover_market_actors(
        &db.pool,
        &config,
        ledger.clone(),
        events.clone(),
        market_repo.clone(),
    )
    .await
    .unwrap_or_else(|e| {
        tracing::error!("startup recovery failed: {e}; starting with empty books");
        Default::default()
    });
    let markets = DashMap::new();
    for (market_id, actor) in recovered {
        markets.insert(market_id, actor);
    }

    let settlement = SettlementService::new(market_repo.clone(), ledger.clone(), events.clone());
    let gateway = Arc::new(OrderGateway::new(config.clone()));

    let state = Arc::new(AppState {
        gateway,
        markets,
        ledger,
        events,
        market_repo,
        settlement,
        config: config.clone(),
        db,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/markets/:market_id/orders", post(place_order))
        .route("/orders/:order_id", delete(cancel_order))
        .route("/markets/:market_id/outcomes/:outcome/orderbook", get(orderbook_snapshot))
        .route("/markets/:market_id/trades", get(recent_trades))
        .route("/admin/markets/:market_id/resolve", post(resolve_market))
        .route("/admin/markets/:market_id/cancel", post(cancel_market))
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct PlaceOrderBody {
    user_id: Uuid,
    #[serde(flatten)]
    request: PlaceOrderRequest,
}

async fn place_order(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<Uuid>,
    Json(body): Json<PlaceOrderBody>,
) -> Result<Json<predex_core::market_actor::PlaceOrderOutcome>, AppError> {
    let mut request = body.request;
    request.market_id = market_id;

    state.gateway.validate(&request)?;

    if let Some(cached) = state.gateway.check_idempotency(body.user_id, &request) {
        return cached.map(Json);
    }

    let actor = state.actor_for(market_id).await;
    let result = actor.place_order(body.user_id, request.clone()).await;
    state.gateway.record_result(body.user_id, &request, result.clone());
    result.map(Json)
}

#[derive(Debug, Deserialize)]
struct CancelOrderQuery {
    user_id: Uuid,
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(query): Json<CancelOrderQuery>,
) -> Result<StatusCode, AppError> {
    let (market_id, outcome): (Uuid, Outcome) =
        sqlx::query_as("SELECT market_id, outcome FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&state.db.pool)
            .await
            .map_err(|e| AppError::new(predex_core::errors::ErrorCode::Internal, e.to_string()))?
            .ok_or_else(|| AppError::new(predex_core::errors::ErrorCode::NotFound, "order not found"))?;

    let actor = state.actor_for(market_id).await;
    actor.cancel_order(query.user_id, order_id, outcome).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn orderbook_snapshot(
    State(state): State<Arc<AppState>>,
    Path((market_id, outcome)): Path<(Uuid, Outcome)>,
) -> Json<predex_core::book::OrderbookSnapshot> {
    let actor = state.actor_for(market_id).await;
    Json(actor.snapshot(outcome).await)
}

#[derive(Debug, Deserialize)]
struct RecentTradesQuery {
    #[serde(default = "default_recent_trades_limit")]
    limit: i64,
}

fn default_recent_trades_limit() -> i64 {
    50
}

async fn recent_trades(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<Uuid>,
    Query(query): Query<RecentTradesQuery>,
) -> Result<Json<Vec<predex_core::models::trade::Trade>>, AppError> {
    let trades = state
        .ledger
        .recent_trades(market_id, query.limit.clamp(1, 500))
        .await?;
    Ok(Json(trades))
}

#[derive(Debug, Deserialize)]
struct ResolveMarketBody {
    outcome: Outcome,
}

async fn resolve_market(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<Uuid>,
    Json(body): Json<ResolveMarketBody>,
) -> Result<Json<predex_core::settlement::SettlementOutcome>, AppError> {
    state
        .settlement
        .resolve_market(market_id, body.outcome)
        .await
        .map(Json)
}

async fn cancel_market(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<Uuid>,
) -> Result<Json<predex_core::settlement::SettlementOutcome>, AppError> {
    state.settlement.cancel_market(market_id).await.map(Json)
}
