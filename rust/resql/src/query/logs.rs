use super::{
    builder::{make_select_builder, Args, BaseRequest},
    decode::decode_rows,
    Backend,
};
use crate::{
    db::QueryContext,
    error::{Result, ServiceError},
    models::{LogLevel, LogLine, QueryInput, TableConfig},
    pagination::Pagination,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info_span, Instrument};

const LOG_LINES_LIMIT: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLinesRequest {
    pub project_id: i64,
    #[serde(default)]
    pub params: QueryInput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawLogLine {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

fn column_or_null(column: Option<&str>, alias: &str) -> String {
    format!("{} AS {alias}", column.unwrap_or("null"))
}

/// Raw log lines with their attributes merged and expanded into nested labels.
pub(super) async fn log_lines(
    backend: Backend<'_>,
    ctx: &QueryContext,
    config: &TableConfig,
    request: &LogLinesRequest,
) -> Result<Vec<LogLine>> {
    if config.attributes_table {
        return Err(ServiceError::invalid(format!(
            "log lines are not available for {}",
            config.resource.as_str()
        )));
    }

    let attributes = config
        .attributes_columns
        .iter()
        .map(|mapping| mapping.column.as_str())
        .collect::<Vec<_>>();
    let labels = if attributes.is_empty() {
        None
    } else {
        Some(format!("mapConcat({})", attributes.join(", ")))
    };
    let select_columns = vec![
        "Timestamp".to_string(),
        column_or_null(config.body_column.as_deref(), "Body"),
        column_or_null(config.severity_column.as_deref(), "Severity"),
        column_or_null(labels.as_deref(), "Labels"),
    ];

    let mut args = Args::new();
    let pagination = Pagination::count_only();
    let mut base = make_select_builder(
        BaseRequest {
            config,
            table_expr: &config.table_name,
            select_columns: &select_columns,
            project_ids: &[request.project_id],
            params: &request.params,
            pagination: &pagination,
        },
        backend.search,
        &mut args,
    )?;
    base.builder.limit(LOG_LINES_LIMIT);

    let ctx = ctx.for_table(&config.table_name);
    let rows = backend
        .store
        .query(&ctx, &base.builder.build(), args.params())
        .instrument(info_span!(
            "clickhouse.read_log_lines",
            db.namespace = %config.table_name
        ))
        .await?;
    let raw: Vec<RawLogLine> = decode_rows(&rows)?;
    debug!(lines = raw.len(), "read log lines");

    Ok(raw
        .into_iter()
        .map(|line| LogLine {
            timestamp: line.timestamp,
            body: line.body.unwrap_or_default(),
            severity: line
                .severity
                .as_deref()
                .filter(|severity| !severity.is_empty())
                .and_then(LogLevel::from_severity),
            labels: unflatten(&line.labels.unwrap_or_default()),
        })
        .collect())
}

/// Expands dotted keys into nested objects. Returns the flat map when a key is both a
/// value and a prefix of another key.
pub fn unflatten(flat: &BTreeMap<String, String>) -> Value {
    let mut root = Map::new();
    for (key, value) in flat {
        let segments = key.split('.').collect::<Vec<_>>();
        if !insert_path(&mut root, &segments, value) {
            return Value::Object(
                flat.iter()
                    .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                    .collect(),
            );
        }
    }
    Value::Object(root)
}

fn insert_path(node: &mut Map<String, Value>, segments: &[&str], value: &str) -> bool {
    match segments {
        [] => false,
        [last] => {
            if node.contains_key(*last) {
                return false;
            }
            node.insert(last.to_string(), Value::String(value.to_string()));
            true
        }
        [head, rest @ ..] => {
            let child = node
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match child {
                Value::Object(child) => insert_path(child, rest, value),
                _ => false,
            }
        }
    }
}
