use async_trait::async_trait;
use axum::{
    body::{self, Body},
    Router,
};
use http::{Request, StatusCode};
use resql::{
    config::{AppConfig, ClickHouseConfig, EngineLimits},
    db::{QueryContext, RowSet, Store},
    error::Result,
    models::TableRegistry,
    query::{BindParam, QueryEngine},
    server::Server,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, Once},
    time::Duration,
};
use tower::ServiceExt;

static TRACING_INIT: Once = Once::new();

/// A statement the engine sent to the store.
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub sql: String,
    pub params: Vec<BindParam>,
}

/// In-memory store: records every statement and replays scripted row sets in order.
#[derive(Default)]
pub struct FakeStore {
    responses: Mutex<VecDeque<RowSet>>,
    recorded: Mutex<Vec<RecordedQuery>>,
}

impl FakeStore {
    pub fn new(responses: Vec<RowSet>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded(&self) -> Vec<RecordedQuery> {
        self.recorded.lock().expect("store lock poisoned").clone()
    }

    fn record(&self, sql: &str, params: &[BindParam]) {
        self.recorded
            .lock()
            .expect("store lock poisoned")
            .push(RecordedQuery {
                sql: sql.to_string(),
                params: params.to_vec(),
            });
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn query(&self, _: &QueryContext, sql: &str, params: &[BindParam]) -> Result<RowSet> {
        self.record(sql, params);
        Ok(self
            .responses
            .lock()
            .expect("store lock poisoned")
            .pop_front()
            .unwrap_or_default())
    }

    async fn exec(&self, _: &QueryContext, sql: &str, params: &[BindParam]) -> Result<()> {
        self.record(sql, params);
        Ok(())
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        listen_addr: "127.0.0.1:0".parse().expect("valid listen addr"),
        clickhouse: ClickHouseConfig {
            url: "http://127.0.0.1:8123".to_string(),
            database: "default".to_string(),
            user: None,
            password: None,
            readonly_user: None,
            readonly_password: None,
            timeout: Duration::from_secs(5),
        },
        request_timeout: Duration::from_secs(5),
        limits: EngineLimits::default(),
    }
}

/// Runs a test closure against a router whose engine reads from a scripted [`FakeStore`].
pub async fn with_resql_harness<F, Fut>(responses: Vec<RowSet>, test: F)
where
    F: FnOnce(ResqlTestHarness) -> Fut,
    Fut: Future<Output = ()>,
{
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("resql=debug")
            .try_init();
    });

    let store = Arc::new(FakeStore::new(responses));
    let config = test_config();
    let engine = QueryEngine::new(
        store.clone(),
        store.clone(),
        TableRegistry::builtin(config.limits.sampling_rows),
        config.limits,
    );
    let router = Server::with_engine(config, engine).router();
    test(ResqlTestHarness { router, store }).await;
}

#[derive(Clone)]
pub struct ResqlTestHarness {
    router: Router,
    store: Arc<FakeStore>,
}

impl ResqlTestHarness {
    pub fn store(&self) -> &FakeStore {
        &self.store
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("failed to build harness request");
        self.send(request).await
    }

    pub async fn post<T>(&self, path: &str, payload: &T) -> http::Response<Body>
    where
        T: Serialize,
    {
        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("failed to build harness request");
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> http::Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
