pub mod attributes;
pub mod bucketing;
pub mod builder;
pub mod decode;
pub mod keys;
pub mod logs;
pub mod matcher;
pub mod metrics;
pub mod objects;
pub mod rewrite;

use crate::{
    config::EngineLimits,
    db::{QueryContext, SharedStore, Store},
    error::{Result, ServiceError},
    filter::SearchParser,
    models::{
        KeyValueSuggestion, LogLine, LogRow, MetricsBuckets, QueryKey, Resource, TableChoice,
        TableRegistry, TraceRow,
    },
    pagination::Connection,
    parser::DefaultSearchParser,
    time::DateRange,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use keys::{KeyValueSuggestionsRequest, KeyValuesRequest, KeysRequest};
pub use logs::LogLinesRequest;
pub use metrics::{MetricsRequest, PROJECT_ID_SETTING};
pub use objects::ObjectsRequest;
pub use rewrite::{get_tables, rewrite_sql, RewriteRequest, Rewritten};

const DEFAULT_RANGE_DAYS: i64 = 30;

/// Borrowed collaborators handed to each query operation.
#[derive(Clone, Copy)]
pub(crate) struct Backend<'a> {
    pub store: &'a dyn Store,
    /// Connection used for user-authored SQL.
    pub readonly: &'a dyn Store,
    pub search: &'a dyn SearchParser,
    pub limits: &'a EngineLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateRequest {
    pub sql: String,
    pub project_ids: Vec<i64>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub query: String,
}

#[derive(Clone)]
pub struct QueryEngine {
    store: SharedStore,
    readonly: SharedStore,
    registry: Arc<TableRegistry>,
    search: Arc<dyn SearchParser>,
    limits: EngineLimits,
}

impl QueryEngine {
    pub fn new(
        store: SharedStore,
        readonly: SharedStore,
        registry: TableRegistry,
        limits: EngineLimits,
    ) -> Self {
        Self {
            store,
            readonly,
            registry: Arc::new(registry),
            search: Arc::new(DefaultSearchParser),
            limits,
        }
    }

    pub fn with_search_parser(mut self, search: Arc<dyn SearchParser>) -> Self {
        self.search = search;
        self
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    fn backend(&self) -> Backend<'_> {
        Backend {
            store: self.store.as_ref(),
            readonly: self.readonly.as_ref(),
            search: self.search.as_ref(),
            limits: &self.limits,
        }
    }

    pub async fn read_metrics(
        &self,
        ctx: &QueryContext,
        request: &MetricsRequest,
    ) -> Result<MetricsBuckets> {
        let table = self.registry.get(request.resource)?;
        metrics::read_metrics(self.backend(), ctx, table, request, Utc::now()).await
    }

    pub async fn read_logs(
        &self,
        ctx: &QueryContext,
        request: &ObjectsRequest,
    ) -> Result<Connection<LogRow>> {
        let table = self.registry.get(Resource::Logs)?;
        objects::read_objects(self.backend(), ctx, table, request).await
    }

    pub async fn read_traces(
        &self,
        ctx: &QueryContext,
        request: &ObjectsRequest,
    ) -> Result<Connection<TraceRow>> {
        let table = self.registry.get(Resource::Traces)?;
        objects::read_objects(self.backend(), ctx, table, request).await
    }

    /// Keys of one resource, or the weighted ranking across resources when the request
    /// names none.
    pub async fn keys(&self, ctx: &QueryContext, request: &KeysRequest) -> Result<Vec<QueryKey>> {
        match request.resource {
            Some(resource) => {
                let config = &self.registry.get(resource)?.primary;
                keys::keys_aggregated(self.backend(), ctx, config, request).await
            }
            None => keys::all_keys(self.backend(), ctx, &self.registry, request).await,
        }
    }

    pub async fn key_values(
        &self,
        ctx: &QueryContext,
        request: &KeyValuesRequest,
    ) -> Result<Vec<String>> {
        match request.resource {
            Some(resource) => {
                let config = &self.registry.get(resource)?.primary;
                keys::key_values_aggregated(self.backend(), ctx, config, request).await
            }
            None => keys::all_key_values(self.backend(), ctx, &self.registry, request).await,
        }
    }

    pub async fn key_value_suggestions(
        &self,
        ctx: &QueryContext,
        request: &KeyValueSuggestionsRequest,
    ) -> Result<Vec<KeyValueSuggestion>> {
        let config = &self.registry.get(request.resource)?.primary;
        keys::key_value_suggestions(self.backend(), ctx, config, request).await
    }

    pub async fn log_lines(
        &self,
        ctx: &QueryContext,
        request: &LogLinesRequest,
    ) -> Result<Vec<LogLine>> {
        let config = &self.registry.get(Resource::Logs)?.primary;
        logs::log_lines(self.backend(), ctx, config, request).await
    }

    /// Rewrites user SQL without executing it.
    pub fn translate(&self, request: &TranslateRequest) -> Result<Rewritten> {
        let tables = get_tables(&request.sql)?;
        let Some(table) = tables.first() else {
            return Err(ServiceError::invalid("SQL must read from a resource table"));
        };
        let config = &self.registry.by_name(table)?.primary;
        let date_range = request
            .date_range
            .unwrap_or_else(|| DateRange::last_days(Utc::now(), DEFAULT_RANGE_DAYS));
        rewrite_sql(
            &request.sql,
            config,
            TableChoice::Primary,
            RewriteRequest {
                project_ids: &request.project_ids,
                date_range,
                search: &request.query,
            },
            self.search.as_ref(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum BindParam {
    Text(String),
    TextArray(Vec<String>),
    Int(i64),
    IntArray(Vec<i64>),
    UInt(u64),
    Float(f64),
    DateTime(DateTime<Utc>),
    Uuid(String),
}

impl BindParam {
    pub fn clickhouse_type(&self) -> &'static str {
        match self {
            BindParam::Text(_) => "String",
            BindParam::TextArray(_) => "Array(String)",
            BindParam::Int(_) => "Int64",
            BindParam::IntArray(_) => "Array(Int64)",
            BindParam::UInt(_) => "UInt64",
            BindParam::Float(_) => "Float64",
            BindParam::DateTime(_) => "DateTime64(9)",
            BindParam::Uuid(_) => "UUID",
        }
    }

    /// Value as sent in a `param_<name>` field of the HTTP interface.
    pub fn to_param_value(&self) -> String {
        match self {
            BindParam::Text(value) | BindParam::Uuid(value) => escape_param(value),
            BindParam::TextArray(values) => format!(
                "[{}]",
                values
                    .iter()
                    .map(|value| quote_literal(value))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            BindParam::Int(value) => value.to_string(),
            BindParam::IntArray(values) => format!(
                "[{}]",
                values
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            BindParam::UInt(value) => value.to_string(),
            BindParam::Float(value) => value.to_string(),
            BindParam::DateTime(value) => value.format("%Y-%m-%d %H:%M:%S%.9f").to_string(),
        }
    }

    /// Value rendered as an escaped SQL literal.
    pub fn to_literal(&self) -> String {
        match self {
            BindParam::Text(value) => quote_literal(value),
            BindParam::Uuid(value) => format!("toUUID({})", quote_literal(value)),
            BindParam::DateTime(_) => format!("toDateTime64('{}', 9)", self.to_param_value()),
            other => other.to_param_value(),
        }
    }
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn escape_param(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\n', "\\n")
}

impl From<&str> for BindParam {
    fn from(value: &str) -> Self {
        BindParam::Text(value.to_string())
    }
}

impl From<String> for BindParam {
    fn from(value: String) -> Self {
        BindParam::Text(value)
    }
}

impl From<i64> for BindParam {
    fn from(value: i64) -> Self {
        BindParam::Int(value)
    }
}

impl From<u64> for BindParam {
    fn from(value: u64) -> Self {
        BindParam::UInt(value)
    }
}

impl From<f64> for BindParam {
    fn from(value: f64) -> Self {
        BindParam::Float(value)
    }
}

impl From<DateTime<Utc>> for BindParam {
    fn from(value: DateTime<Utc>) -> Self {
        BindParam::DateTime(value)
    }
}

impl From<Vec<String>> for BindParam {
    fn from(value: Vec<String>) -> Self {
        BindParam::TextArray(value)
    }
}

impl From<Vec<i64>> for BindParam {
    fn from(value: Vec<i64>) -> Self {
        BindParam::IntArray(value)
    }
}
