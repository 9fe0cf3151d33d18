//! Shapes Memory Server
//!
//! HTTP API over the memory store, used by the Discord message handler and
//! the admin commands.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shapes_memory::{
    config::Config,
    memory::{LedgerStats, MemoryEntry, MemoryMetadata, MemoryStore, MemoryTier},
    retention::spawn_sweeper,
    retrieval::{RankOptions, ScoredMemory},
    storage::SqliteStorage,
};

/// Application state shared across handlers
struct AppState {
    store: Arc<MemoryStore>,
    config: Config,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting Shapes Memory Server on port {}", config.server_port);
    tracing::info!(
        short_term_limit = config.short_term_limit,
        long_term_limit = config.long_term_limit,
        retention_days = config.retention_days,
        "Retention policy"
    );

    let store = Arc::new(MemoryStore::new(&config));

    let storage = if config.persistence_enabled {
        let storage = SqliteStorage::new(&config)?;
        let restored = store.restore_all(&storage)?;
        tracing::info!("Restored {} memories from {:?}", restored, config.sqlite_path());
        Some(storage)
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(store.clone(), config.sweep_interval(), cancel.clone());

    let state = Arc::new(AppState {
        store: store.clone(),
        config: config.clone(),
    });

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health))
        .route("/personalities", get(list_personalities))
        // Ledger access
        .route(
            "/memories/:personality_id",
            get(list_memories).post(add_memory).delete(clear_memories),
        )
        .route("/memories/:personality_id/exchange", post(record_exchange))
        .route("/memories/:personality_id/query", post(query_memories))
        .route("/memories/:personality_id/promote", post(promote_memory))
        .route("/memories/:personality_id/stats", get(ledger_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let port = config.server_port;
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    sweeper.await?;

    if let Some(storage) = storage {
        let saved = store.persist_all(&storage)?;
        tracing::info!("Saved {} memories before shutdown", saved);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

async fn list_personalities(State(state): State<SharedState>) -> Json<Vec<String>> {
    Json(state.store.personalities())
}

async fn list_memories(
    State(state): State<SharedState>,
    Path(personality_id): Path<String>,
) -> Json<Vec<MemoryEntry>> {
    Json(state.store.entries(&personality_id))
}

#[derive(Debug, Deserialize)]
struct AddMemoryRequest {
    content: String,
    tier: Option<String>,
    #[serde(default)]
    metadata: MemoryMetadata,
}

async fn add_memory(
    State(state): State<SharedState>,
    Path(personality_id): Path<String>,
    Json(req): Json<AddMemoryRequest>,
) -> Result<Json<MemoryEntry>, StatusCode> {
    let tier = parse_tier(req.tier.as_deref())?.unwrap_or(MemoryTier::ShortTerm);
    let entry = state
        .store
        .add_memory(&personality_id, req.content, tier, req.metadata);
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
struct ClearQuery {
    tier: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    removed: usize,
}

async fn clear_memories(
    State(state): State<SharedState>,
    Path(personality_id): Path<String>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<ClearResponse>, StatusCode> {
    let tier = parse_tier(query.tier.as_deref())?;
    let removed = state.store.clear(&personality_id, tier);
    Ok(Json(ClearResponse { removed }))
}

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    user_message: String,
    bot_reply: String,
    #[serde(default)]
    metadata: MemoryMetadata,
}

async fn record_exchange(
    State(state): State<SharedState>,
    Path(personality_id): Path<String>,
    Json(req): Json<ExchangeRequest>,
) -> Json<Vec<MemoryEntry>> {
    let (user, reply) =
        state
            .store
            .record_exchange(&personality_id, req.user_message, req.bot_reply, req.metadata);
    Json(vec![user, reply])
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    /// Taken here rather than in `options` so the configured default applies
    max_results: Option<usize>,
    #[serde(flatten)]
    options: RankOptions,
}

impl QueryRequest {
    fn rank_options(&self, default_max_results: usize) -> RankOptions {
        RankOptions {
            max_results: self.max_results.unwrap_or(default_max_results),
            ..self.options.clone()
        }
    }
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    memories: Vec<ScoredMemory>,
    context_text: String,
}

async fn query_memories(
    State(state): State<SharedState>,
    Path(personality_id): Path<String>,
    Json(req): Json<QueryRequest>,
) -> Json<QueryResponse> {
    let options = req.rank_options(state.config.default_max_results);
    let result = state.store.query(&personality_id, &req.query, &options);
    Json(QueryResponse {
        memories: result.entries,
        context_text: result.context_text,
    })
}

#[derive(Debug, Deserialize)]
struct PromoteRequest {
    content: String,
}

#[derive(Debug, Serialize)]
struct PromoteResponse {
    promoted: bool,
}

async fn promote_memory(
    State(state): State<SharedState>,
    Path(personality_id): Path<String>,
    Json(req): Json<PromoteRequest>,
) -> Json<PromoteResponse> {
    let promoted = state.store.promote(&personality_id, &req.content);
    Json(PromoteResponse { promoted })
}

async fn ledger_stats(
    State(state): State<SharedState>,
    Path(personality_id): Path<String>,
) -> Json<LedgerStats> {
    Json(state.store.stats(&personality_id))
}

fn parse_tier(tier: Option<&str>) -> Result<Option<MemoryTier>, StatusCode> {
    tier.map(str::parse::<MemoryTier>)
        .transpose()
        .map_err(|_| StatusCode::BAD_REQUEST)
}
