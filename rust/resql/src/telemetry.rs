use once_cell::sync::OnceCell;
use tracing::{info_span, Span};
use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

pub fn init_tracing() {
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_target(false).init();
    });
}

/// Span wrapped around a single ClickHouse round trip.
///
/// `table` is the logical table the statement reads (empty when unknown) and
/// `params` the rendered bind parameters. Closing the span never fails the request.
pub fn store_span(operation: &'static str, table: &str, sql: &str, params: &str) -> Span {
    info_span!(
        "clickhouse",
        otel.name = operation,
        db.system = "clickhouse",
        db.namespace = table,
        db.query.text = sql,
        db.operation.parameters = params,
    )
}
