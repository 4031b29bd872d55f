use crate::{
    config::AppConfig,
    db::QueryContext,
    error::{Result, ServiceError},
    query::QueryEngine,
};
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Handler state: the engine plus the deadline applied to every request.
#[derive(Clone)]
pub struct AppState {
    engine: QueryEngine,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(config: &AppConfig, engine: QueryEngine) -> Self {
        Self {
            engine,
            request_timeout: config.request_timeout,
        }
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// Runs `operation` with a request-scoped context whose token is cancelled once
    /// the request timeout elapses or the handler is dropped.
    pub async fn run<T, F, Fut>(self, operation: F) -> Result<T>
    where
        F: FnOnce(QueryEngine, QueryContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = CancellationToken::new();
        let _cancel_on_drop = token.clone().drop_guard();
        let ctx = QueryContext::new(token.clone());
        let timeout = self.request_timeout;

        match tokio::time::timeout(timeout, operation(self.engine, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                warn!(timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(ServiceError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineLimits,
        models::TableRegistry,
        query::tests::NullStore,
    };
    use std::sync::Arc;

    fn state(request_timeout: Duration) -> AppState {
        let store = Arc::new(NullStore);
        AppState {
            engine: QueryEngine::new(
                store.clone(),
                store,
                TableRegistry::default(),
                EngineLimits::default(),
            ),
            request_timeout,
        }
    }

    #[tokio::test]
    async fn deadline_cancels_the_context() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let result: Result<()> = state(Duration::from_millis(10))
            .run(|_, ctx| async move {
                let _ = tx.send(ctx.cancel.clone());
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Cancelled)));
        assert!(rx.await.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn fast_operations_complete() {
        let limits = state(Duration::from_secs(1))
            .run(|engine, ctx| async move {
                ctx.ensure_active()?;
                Ok(*engine.limits())
            })
            .await
            .unwrap();
        assert_eq!(limits, EngineLimits::default());
    }
}
