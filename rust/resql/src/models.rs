//! Table configurations, the resource registry, and the request/result types shared by
//! the query modules.

use crate::{
    config::EngineLimits,
    error::{Result, ServiceError},
    time::DateRange,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

pub const TIMESTAMP_COLUMN: &str = "Timestamp";
pub const ID_COLUMN: &str = "UUID";
/// Attribute holding the key counted by [`MetricAggregator::CountDistinctKey`].
pub const DISTINCT_KEY_ATTRIBUTE: &str = "key";
pub const METRIC_HISTORY_TABLE: &str = "metric_history";
/// Legacy single-valued session fields table.
pub const FIELDS_TABLE: &str = "fields";
/// Top-N count meaning "do not limit groups".
pub const NO_LIMIT: u64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Sessions,
    Errors,
    Logs,
    Traces,
    Events,
    Metrics,
}

impl Resource {
    pub const ALL: [Resource; 6] = [
        Resource::Sessions,
        Resource::Errors,
        Resource::Logs,
        Resource::Traces,
        Resource::Events,
        Resource::Metrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Sessions => "sessions",
            Resource::Errors => "errors",
            Resource::Logs => "logs",
            Resource::Traces => "traces",
            Resource::Events => "events",
            Resource::Metrics => "metrics",
        }
    }

    /// Case-insensitive lookup of a logical table name as written in user SQL.
    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|resource| resource.as_str().eq_ignore_ascii_case(name))
    }
}

/// Maps key prefixes onto the attribute column that stores them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeColumn {
    pub prefix: String,
    pub column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum KeyType {
    String,
    Numeric,
    Boolean,
    Creatable,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::String => "String",
            KeyType::Numeric => "Numeric",
            KeyType::Boolean => "Boolean",
            KeyType::Creatable => "Creatable",
        }
    }

    /// Type stored in a key table. Unknown names read as strings.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Numeric" => KeyType::Numeric,
            "Boolean" => KeyType::Boolean,
            "Creatable" => KeyType::Creatable,
            _ => KeyType::String,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryKey {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
}

impl QueryKey {
    pub fn new(name: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            name: name.into(),
            key_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    pub resource: Resource,
    pub table_name: String,
    pub project_id_column: String,
    /// Logical field name to physical column. Physical columns map onto themselves.
    pub keys_to_columns: BTreeMap<String, String>,
    pub attributes_columns: Vec<AttributeColumn>,
    /// Attributes are stored as an array of `(key, value)` tuples instead of a map.
    pub attributes_table: bool,
    pub body_column: Option<String>,
    pub severity_column: Option<String>,
    /// Search query AND-ed into every query against the table.
    pub default_filter: Option<String>,
    pub metric_column: Option<String>,
    pub select_columns: Vec<String>,
    pub reserved_keys: Vec<QueryKey>,
    pub keys_table: Option<String>,
    pub key_values_table: Option<String>,
}

impl TableConfig {
    pub fn new(resource: Resource, table_name: impl Into<String>) -> Self {
        Self {
            resource,
            table_name: table_name.into(),
            project_id_column: "ProjectId".to_string(),
            keys_to_columns: BTreeMap::new(),
            attributes_columns: Vec::new(),
            attributes_table: false,
            body_column: None,
            severity_column: None,
            default_filter: None,
            metric_column: None,
            select_columns: Vec::new(),
            reserved_keys: Vec::new(),
            keys_table: None,
            key_values_table: None,
        }
    }

    pub fn project_id_column(mut self, column: &str) -> Self {
        self.project_id_column = column.to_string();
        self
    }

    /// Registers physical columns; each is reachable under its own name.
    pub fn physical_columns(mut self, columns: &[&str]) -> Self {
        for column in columns {
            self.keys_to_columns
                .insert((*column).to_string(), (*column).to_string());
            self.select_columns.push((*column).to_string());
        }
        self
    }

    pub fn key(mut self, key: &str, column: &str) -> Self {
        self.keys_to_columns
            .insert(key.to_string(), column.to_string());
        self
    }

    pub fn attributes(mut self, prefix: &str, column: &str) -> Self {
        self.attributes_columns.push(AttributeColumn {
            prefix: prefix.to_string(),
            column: column.to_string(),
        });
        self
    }

    pub fn body(mut self, column: &str) -> Self {
        self.body_column = Some(column.to_string());
        self
    }

    pub fn severity(mut self, column: &str) -> Self {
        self.severity_column = Some(column.to_string());
        self
    }

    pub fn default_filter(mut self, filter: &str) -> Self {
        self.default_filter = Some(filter.to_string());
        self
    }

    pub fn key_tables(mut self, keys: &str, values: &str) -> Self {
        self.keys_table = Some(keys.to_string());
        self.key_values_table = Some(values.to_string());
        self
    }

    pub fn reserved(mut self, keys: &[(&str, KeyType)]) -> Self {
        self.reserved_keys = keys
            .iter()
            .map(|(name, key_type)| QueryKey::new(*name, *key_type))
            .collect();
        self
    }

    pub fn column_for(&self, key: &str) -> Option<&str> {
        self.keys_to_columns.get(key).map(String::as_str)
    }

    pub fn is_body_key(&self, key: &str) -> bool {
        self.body_column.as_deref() == Some(key)
    }
}

/// A primary table plus the optional sampled companion used for large ranges.
#[derive(Debug, Clone)]
pub struct SampleableTableConfig {
    pub primary: TableConfig,
    pub sampling: Option<TableConfig>,
    /// Target row budget for sampled reads.
    pub sample_size_rows: u64,
}

impl SampleableTableConfig {
    pub fn unsampled(primary: TableConfig) -> Self {
        Self {
            primary,
            sampling: None,
            sample_size_rows: 0,
        }
    }

    pub fn resource(&self) -> Resource {
        self.primary.resource
    }

    /// The configuration a choice reads from.
    pub fn config_for(&self, choice: TableChoice) -> &TableConfig {
        match (choice, &self.sampling) {
            (TableChoice::Sampled(_), Some(sampling)) => sampling,
            _ => &self.primary,
        }
    }
}

/// Which physical table a request reads. Picked once per request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TableChoice {
    Primary,
    Sampled(f64),
}

impl TableChoice {
    /// Sampled read at `ratio`, capped at 1. Non-positive ratios read the primary table.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio > 0.0 {
            TableChoice::Sampled(ratio.min(1.0))
        } else {
            TableChoice::Primary
        }
    }

    pub fn is_sampled(&self) -> bool {
        matches!(self, TableChoice::Sampled(_))
    }

    /// Physical table expression, `<table> SAMPLE <ratio>` for sampled reads.
    pub fn table_expr(&self, config: &TableConfig) -> String {
        match self {
            TableChoice::Primary => config.table_name.clone(),
            TableChoice::Sampled(ratio) => format!("{} SAMPLE {}", config.table_name, ratio),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableRegistry {
    tables: HashMap<Resource, SampleableTableConfig>,
}

impl TableRegistry {
    pub fn empty() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    pub fn with_table(mut self, table: SampleableTableConfig) -> Self {
        self.tables.insert(table.resource(), table);
        self
    }

    pub fn get(&self, resource: Resource) -> Result<&SampleableTableConfig> {
        self.tables.get(&resource).ok_or_else(|| {
            ServiceError::invalid(format!("resource '{}' is not configured", resource.as_str()))
        })
    }

    pub fn by_name(&self, name: &str) -> Result<&SampleableTableConfig> {
        let resource = Resource::from_table_name(name)
            .ok_or_else(|| ServiceError::invalid(format!("unknown resource '{name}'")))?;
        self.get(resource)
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::builtin(EngineLimits::default().sampling_rows)
    }
}

impl TableRegistry {
    /// Built-in resource tables. Logs and traces read their sampled companion once a
    /// range is estimated to exceed `sampling_rows`.
    pub fn builtin(sampling_rows: u64) -> Self {
        builtin_registry(sampling_rows)
    }
}

fn builtin_registry(sampling_rows: u64) -> TableRegistry {
    let logs = TableConfig::new(Resource::Logs, "logs")
        .physical_columns(&[
            "Timestamp",
            "UUID",
            "ProjectId",
            "TraceId",
            "SpanId",
            "SecureSessionId",
            "Severity",
            "ServiceName",
            "ServiceVersion",
            "Environment",
            "Body",
            "Source",
        ])
        .key("timestamp", "Timestamp")
        .key("level", "Severity")
        .key("message", "Body")
        .key("trace_id", "TraceId")
        .key("span_id", "SpanId")
        .key("secure_session_id", "SecureSessionId")
        .key("service_name", "ServiceName")
        .key("service_version", "ServiceVersion")
        .key("environment", "Environment")
        .key("source", "Source")
        .attributes("", "LogAttributes")
        .body("Body")
        .severity("Severity")
        .key_tables("log_keys", "log_key_values")
        .reserved(&[
            ("level", KeyType::String),
            ("message", KeyType::String),
            ("trace_id", KeyType::String),
            ("span_id", KeyType::String),
            ("secure_session_id", KeyType::String),
            ("service_name", KeyType::String),
            ("service_version", KeyType::String),
            ("environment", KeyType::String),
            ("source", KeyType::String),
        ]);
    let mut logs_sampling = logs.clone();
    logs_sampling.table_name = "logs_sampling".to_string();

    let traces = TableConfig::new(Resource::Traces, "traces")
        .physical_columns(&[
            "Timestamp",
            "UUID",
            "ProjectId",
            "TraceId",
            "SpanId",
            "ParentSpanId",
            "SecureSessionId",
            "SpanName",
            "SpanKind",
            "Duration",
            "ServiceName",
            "ServiceVersion",
            "Environment",
            "HasErrors",
            "StatusCode",
            "StatusMessage",
        ])
        .key("timestamp", "Timestamp")
        .key("trace_id", "TraceId")
        .key("span_id", "SpanId")
        .key("parent_span_id", "ParentSpanId")
        .key("secure_session_id", "SecureSessionId")
        .key("span_name", "SpanName")
        .key("span_kind", "SpanKind")
        .key("duration", "Duration")
        .key("service_name", "ServiceName")
        .key("service_version", "ServiceVersion")
        .key("environment", "Environment")
        .key("has_errors", "HasErrors")
        .key("status_code", "StatusCode")
        .key("status_message", "StatusMessage")
        .attributes("", "TraceAttributes")
        .body("SpanName")
        .default_filter("span_name!=\"system.internal\"")
        .key_tables("trace_keys", "trace_key_values")
        .reserved(&[
            ("trace_id", KeyType::String),
            ("span_id", KeyType::String),
            ("parent_span_id", KeyType::String),
            ("secure_session_id", KeyType::String),
            ("span_name", KeyType::String),
            ("span_kind", KeyType::String),
            ("duration", KeyType::Numeric),
            ("service_name", KeyType::String),
            ("service_version", KeyType::String),
            ("environment", KeyType::String),
            ("has_errors", KeyType::Boolean),
        ]);
    let mut traces_sampling = traces.clone();
    traces_sampling.table_name = "traces_sampling".to_string();

    let sessions = TableConfig::new(Resource::Sessions, "sessions")
        .project_id_column("ProjectID")
        .physical_columns(&[
            "Timestamp",
            "ID",
            "ProjectID",
            "SecureID",
            "Identifier",
            "City",
            "Country",
            "OSName",
            "BrowserName",
            "ActiveLength",
            "Length",
            "HasErrors",
            "Processed",
        ])
        .key("created_at", "Timestamp")
        .key("secure_id", "SecureID")
        .key("identifier", "Identifier")
        .key("city", "City")
        .key("country", "Country")
        .key("os_name", "OSName")
        .key("browser_name", "BrowserName")
        .key("active_length", "ActiveLength")
        .key("length", "Length")
        .key("has_errors", "HasErrors")
        .key("processed", "Processed")
        .attributes("", "Fields")
        .key_tables("session_keys", FIELDS_TABLE)
        .reserved(&[
            ("identifier", KeyType::String),
            ("city", KeyType::String),
            ("country", KeyType::String),
            ("os_name", KeyType::String),
            ("browser_name", KeyType::String),
            ("active_length", KeyType::Numeric),
            ("length", KeyType::Numeric),
            ("has_errors", KeyType::Boolean),
        ]);
    let mut sessions = sessions;
    sessions.attributes_table = true;

    let errors = TableConfig::new(Resource::Errors, "error_objects")
        .project_id_column("ProjectID")
        .physical_columns(&[
            "Timestamp",
            "UUID",
            "ProjectID",
            "ErrorGroupID",
            "Event",
            "Type",
            "URL",
            "Environment",
            "ServiceName",
            "ServiceVersion",
            "Browser",
            "OS",
            "SecureSessionID",
            "TraceID",
        ])
        .key("timestamp", "Timestamp")
        .key("event", "Event")
        .key("type", "Type")
        .key("url", "URL")
        .key("environment", "Environment")
        .key("service_name", "ServiceName")
        .key("service_version", "ServiceVersion")
        .key("browser", "Browser")
        .key("os", "OS")
        .key("secure_session_id", "SecureSessionID")
        .key("trace_id", "TraceID")
        .body("Event")
        .reserved(&[
            ("event", KeyType::String),
            ("type", KeyType::String),
            ("url", KeyType::String),
            ("environment", KeyType::String),
            ("service_name", KeyType::String),
            ("browser", KeyType::String),
            ("os", KeyType::String),
        ]);

    let events = TableConfig::new(Resource::Events, "events")
        .physical_columns(&[
            "Timestamp",
            "UUID",
            "ProjectId",
            "SessionId",
            "SessionCreatedAt",
            "Name",
        ])
        .key("timestamp", "Timestamp")
        .key("event", "Name")
        .key("session_id", "SessionId")
        .attributes("", "Attributes")
        .key_tables("event_keys", "event_key_values")
        .reserved(&[("event", KeyType::String)]);

    let mut metrics = TableConfig::new(Resource::Metrics, "metrics")
        .physical_columns(&[
            "Timestamp",
            "UUID",
            "ProjectId",
            "MetricName",
            "MetricType",
            "ServiceName",
            "Value",
            "Count",
            "Sum",
            "Min",
            "Max",
        ])
        .key("timestamp", "Timestamp")
        .key("metric_name", "MetricName")
        .key("metric_type", "MetricType")
        .key("service_name", "ServiceName")
        .key("value", "Value")
        .attributes("", "Attributes")
        .reserved(&[
            ("metric_name", KeyType::String),
            ("service_name", KeyType::String),
            ("value", KeyType::Numeric),
        ]);
    metrics.metric_column = Some("Value".to_string());

    TableRegistry::empty()
        .with_table(SampleableTableConfig {
            primary: logs,
            sampling: Some(logs_sampling),
            sample_size_rows: sampling_rows,
        })
        .with_table(SampleableTableConfig {
            primary: traces,
            sampling: Some(traces_sampling),
            sample_size_rows: sampling_rows,
        })
        .with_table(SampleableTableConfig::unsampled(sessions))
        .with_table(SampleableTableConfig::unsampled(errors))
        .with_table(SampleableTableConfig::unsampled(events))
        .with_table(SampleableTableConfig::unsampled(metrics))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    pub fn reverse(&self) -> Self {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortInput {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Common query parameters: a date range, optional sort and free-form search text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryInput {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub sort: Option<SortInput>,
}

impl QueryInput {
    pub fn new(query: impl Into<String>, date_range: DateRange) -> Self {
        Self {
            query: query.into(),
            date_range: Some(date_range),
            sort: None,
        }
    }

    pub fn require_date_range(&self) -> Result<DateRange> {
        let range = self
            .date_range
            .ok_or_else(|| ServiceError::invalid("date range is required"))?;
        range.validate()?;
        Ok(range)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricAggregator {
    Count,
    CountDistinct,
    CountDistinctKey,
    Min,
    Avg,
    P50,
    P90,
    P95,
    P99,
    Max,
    Sum,
}

impl MetricAggregator {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricAggregator::Count => "Count",
            MetricAggregator::CountDistinct => "CountDistinct",
            MetricAggregator::CountDistinctKey => "CountDistinctKey",
            MetricAggregator::Min => "Min",
            MetricAggregator::Avg => "Avg",
            MetricAggregator::P50 => "P50",
            MetricAggregator::P90 => "P90",
            MetricAggregator::P95 => "P95",
            MetricAggregator::P99 => "P99",
            MetricAggregator::Max => "Max",
            MetricAggregator::Sum => "Sum",
        }
    }

    pub fn is_distinct(&self) -> bool {
        matches!(
            self,
            MetricAggregator::CountDistinct | MetricAggregator::CountDistinctKey
        )
    }

    pub(crate) fn quantile(&self) -> Option<&'static str> {
        match self {
            MetricAggregator::P50 => Some(".5"),
            MetricAggregator::P90 => Some(".9"),
            MetricAggregator::P95 => Some(".95"),
            MetricAggregator::P99 => Some(".99"),
            _ => None,
        }
    }

    /// History-table column holding this aggregator's state.
    pub fn state_column(&self) -> &'static str {
        match self {
            MetricAggregator::Count => "CountState",
            MetricAggregator::CountDistinct | MetricAggregator::CountDistinctKey => "UniqState",
            MetricAggregator::Min => "MinState",
            MetricAggregator::Avg => "AvgState",
            MetricAggregator::P50 => "P50State",
            MetricAggregator::P90 => "P90State",
            MetricAggregator::P95 => "P95State",
            MetricAggregator::P99 => "P99State",
            MetricAggregator::Max => "MaxState",
            MetricAggregator::Sum => "SumState",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricExpression {
    pub aggregator: MetricAggregator,
    #[serde(default)]
    pub column: String,
}

impl MetricExpression {
    pub fn new(aggregator: MetricAggregator, column: impl Into<String>) -> Self {
        Self {
            aggregator,
            column: column.into(),
        }
    }
}

/// Dimension the bucket index is computed over.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BucketBy {
    None,
    #[default]
    Timestamp,
    Field(String),
}

impl BucketBy {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "" | "Timestamp" | "timestamp" => BucketBy::Timestamp,
            "None" | "none" => BucketBy::None,
            other => BucketBy::Field(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BucketBy::None => "None",
            BucketBy::Timestamp => "Timestamp",
            BucketBy::Field(field) => field,
        }
    }

    /// Timestamp and none bucketing use the request bounds as static min/max.
    pub fn uses_static_bounds(&self) -> bool {
        matches!(self, BucketBy::None | BucketBy::Timestamp)
    }
}

impl Serialize for BucketBy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BucketBy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(BucketBy::parse(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockNumberInfo {
    pub partition: String,
    pub last_block_number: u64,
}

/// Incremental persistence target: aggregate state rows are written to the history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedMetricState {
    pub metric_id: String,
    #[serde(default)]
    pub block_number_infos: Vec<BlockNumberInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBucket {
    pub bucket_id: u64,
    pub bucket_value: Option<f64>,
    pub bucket_min: Option<f64>,
    pub bucket_max: Option<f64>,
    pub group: Vec<String>,
    pub metric_type: String,
    pub column: String,
    pub metric_value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsBuckets {
    pub buckets: Vec<MetricBucket>,
    pub sample_factor: f64,
    pub bucket_count: u64,
}

/// Estimated read volume of one table over a date range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingStats {
    pub database: String,
    pub table: String,
    pub parts: u64,
    pub rows: u64,
    pub marks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogRow {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub project_id: u32,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default)]
    pub secure_session_id: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub service_version: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub log_attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TraceRow {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub project_id: u32,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: String,
    #[serde(default)]
    pub secure_session_id: String,
    #[serde(default)]
    pub span_name: String,
    #[serde(default)]
    pub span_kind: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub service_version: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub has_errors: bool,
    #[serde(default)]
    pub status_code: String,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub trace_attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn from_severity(severity: &str) -> Option<Self> {
        match severity.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" | "information" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "fatal" | "critical" | "panic" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub severity: Option<LogLevel>,
    pub labels: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyValueSuggestion {
    pub key: String,
    pub values: Vec<ValueSuggestion>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueSuggestion {
    pub value: String,
    pub count: u64,
    pub rank: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_resources_case_insensitively() {
        assert_eq!(Resource::from_table_name("LOGS"), Some(Resource::Logs));
        assert_eq!(Resource::from_table_name("traces"), Some(Resource::Traces));
        assert_eq!(Resource::from_table_name("system.parts"), None);
    }

    #[test]
    fn default_registry_covers_every_resource() {
        let registry = TableRegistry::default();
        for resource in Resource::ALL {
            let table = registry.get(resource).expect("resource should be registered");
            assert_eq!(table.resource(), resource);
        }

        let sessions = registry.get(Resource::Sessions).unwrap();
        assert_eq!(sessions.primary.project_id_column, "ProjectID");
        assert!(sessions.primary.attributes_table);

        let logs = registry.get(Resource::Logs).unwrap();
        assert_eq!(logs.primary.column_for("Severity"), Some("Severity"));
        assert_eq!(logs.primary.column_for("level"), Some("Severity"));
        assert_eq!(logs.primary.project_id_column, "ProjectId");
    }

    #[test]
    fn tables_resolve_by_name_ignoring_case() {
        let registry = TableRegistry::default();
        assert_eq!(registry.by_name("LOGS").unwrap().resource(), Resource::Logs);
        assert!(matches!(
            registry.by_name("users"),
            Err(ServiceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn sampled_choice_renders_sample_clause() {
        let registry = TableRegistry::default();
        let logs = registry.get(Resource::Logs).unwrap();
        let choice = TableChoice::from_ratio(0.25);
        let config = logs.config_for(choice);
        assert_eq!(choice.table_expr(config), "logs_sampling SAMPLE 0.25");
        assert_eq!(TableChoice::from_ratio(0.0), TableChoice::Primary);
        assert_eq!(TableChoice::from_ratio(1.5), TableChoice::Sampled(1.0));
    }

    #[test]
    fn bucket_by_round_trips_through_strings() {
        let parsed: BucketBy = serde_json::from_str("\"Duration\"").unwrap();
        assert_eq!(parsed, BucketBy::Field("Duration".into()));
        assert_eq!(BucketBy::parse("None"), BucketBy::None);
        assert_eq!(BucketBy::parse(""), BucketBy::Timestamp);
    }
}
