use crate::{
    config::AppConfig,
    db::ClickHouseHttp,
    error::Result,
    models::{
        KeyValueSuggestion, LogLine, LogRow, MetricsBuckets, QueryKey, TableRegistry, TraceRow,
    },
    pagination::Connection,
    query::{
        KeyValueSuggestionsRequest, KeyValuesRequest, KeysRequest, LogLinesRequest,
        MetricsRequest, ObjectsRequest, QueryEngine, Rewritten, TranslateRequest,
    },
    state::AppState,
};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let store = ClickHouseHttp::new(&config.clickhouse)?;
        let readonly = ClickHouseHttp::readonly(&config.clickhouse)?;
        let query = QueryEngine::new(
            Arc::new(store),
            Arc::new(readonly),
            TableRegistry::builtin(config.limits.sampling_rows),
            config.limits,
        );
        Ok(Self::with_engine(config, query))
    }

    /// Server over an already assembled engine.
    pub fn with_engine(config: AppConfig, query: QueryEngine) -> Self {
        let state = AppState::new(&config, query);
        Self {
            config: Arc::new(config),
            state,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/metrics", post(Self::metrics))
            .route("/api/objects/logs", post(Self::logs))
            .route("/api/objects/traces", post(Self::traces))
            .route("/api/sql/translate", post(Self::translate))
            .route("/api/keys", post(Self::keys))
            .route("/api/keys/values", post(Self::key_values))
            .route("/api/keys/suggestions", post(Self::key_value_suggestions))
            .route("/api/logs/lines", post(Self::log_lines))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "resql listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn metrics(
        State(state): State<AppState>,
        Json(request): Json<MetricsRequest>,
    ) -> Result<Json<MetricsBuckets>> {
        let buckets = state
            .run(|engine, ctx| async move { engine.read_metrics(&ctx, &request).await })
            .await?;
        Ok(Json(buckets))
    }

    async fn logs(
        State(state): State<AppState>,
        Json(request): Json<ObjectsRequest>,
    ) -> Result<Json<Connection<LogRow>>> {
        let page = state
            .run(|engine, ctx| async move { engine.read_logs(&ctx, &request).await })
            .await?;
        Ok(Json(page))
    }

    async fn traces(
        State(state): State<AppState>,
        Json(request): Json<ObjectsRequest>,
    ) -> Result<Json<Connection<TraceRow>>> {
        let page = state
            .run(|engine, ctx| async move { engine.read_traces(&ctx, &request).await })
            .await?;
        Ok(Json(page))
    }

    async fn translate(
        State(state): State<AppState>,
        Json(request): Json<TranslateRequest>,
    ) -> Result<Json<Rewritten>> {
        let response = state.engine().translate(&request)?;
        Ok(Json(response))
    }

    async fn keys(
        State(state): State<AppState>,
        Json(request): Json<KeysRequest>,
    ) -> Result<Json<Vec<QueryKey>>> {
        let keys = state
            .run(|engine, ctx| async move { engine.keys(&ctx, &request).await })
            .await?;
        Ok(Json(keys))
    }

    async fn key_values(
        State(state): State<AppState>,
        Json(request): Json<KeyValuesRequest>,
    ) -> Result<Json<Vec<String>>> {
        let values = state
            .run(|engine, ctx| async move { engine.key_values(&ctx, &request).await })
            .await?;
        Ok(Json(values))
    }

    async fn key_value_suggestions(
        State(state): State<AppState>,
        Json(request): Json<KeyValueSuggestionsRequest>,
    ) -> Result<Json<Vec<KeyValueSuggestion>>> {
        let suggestions = state
            .run(|engine, ctx| async move { engine.key_value_suggestions(&ctx, &request).await })
            .await?;
        Ok(Json(suggestions))
    }

    async fn log_lines(
        State(state): State<AppState>,
        Json(request): Json<LogLinesRequest>,
    ) -> Result<Json<Vec<LogLine>>> {
        let lines = state
            .run(|engine, ctx| async move { engine.log_lines(&ctx, &request).await })
            .await?;
        Ok(Json(lines))
    }
}
