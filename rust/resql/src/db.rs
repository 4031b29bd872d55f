use crate::{
    config::ClickHouseConfig,
    error::{Result, ServiceError},
    query::BindParam,
    telemetry,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

const OUTPUT_FORMAT: &str = "JSONCompactEachRowWithNamesAndTypes";

/// Request-scoped execution context: cancellation plus per-call server settings.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub cancel: CancellationToken,
    settings: BTreeMap<String, String>,
    table: String,
}

impl QueryContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Copy of the context carrying an extra server setting.
    pub fn with_setting(&self, name: &str, value: impl ToString) -> Self {
        let mut next = self.clone();
        next.settings.insert(name.to_string(), value.to_string());
        next
    }

    /// Copy of the context labelled with the table a statement reads, for tracing.
    pub fn for_table(&self, table: &str) -> Self {
        let mut next = self.clone();
        next.table = table.to_string();
        next
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Result of a query: column metadata plus untyped JSON cells in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Parses the `JSONCompactEachRowWithNamesAndTypes` output format.
    pub fn parse(body: &str) -> anyhow::Result<Self> {
        let mut lines = body.lines().filter(|line| !line.trim().is_empty());
        let Some(names) = lines.next() else {
            return Ok(Self::default());
        };
        let names: Vec<String> =
            serde_json::from_str(names).context("invalid column name header")?;
        let types: Vec<String> = lines
            .next()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()
            .context("invalid column type header")?
            .unwrap_or_default();
        if types.len() != names.len() {
            anyhow::bail!(
                "column header mismatch: {} names, {} types",
                names.len(),
                types.len()
            );
        }

        let columns = names
            .into_iter()
            .zip(types)
            .map(|(name, type_name)| Column { name, type_name })
            .collect::<Vec<_>>();
        let rows = lines
            .map(|line| {
                let row: Vec<Value> = serde_json::from_str(line).context("invalid row")?;
                if row.len() != columns.len() {
                    anyhow::bail!("row has {} cells, expected {}", row.len(), columns.len());
                }
                Ok(row)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { columns, rows })
    }
}

/// The analytical store consumed by the query engine.
#[async_trait]
pub trait Store: Send + Sync {
    async fn query(&self, ctx: &QueryContext, sql: &str, params: &[BindParam]) -> Result<RowSet>;

    async fn exec(&self, ctx: &QueryContext, sql: &str, params: &[BindParam]) -> Result<()>;
}

pub type SharedStore = Arc<dyn Store>;

/// ClickHouse over its HTTP interface.
#[derive(Clone)]
pub struct ClickHouseHttp {
    client: Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickHouseHttp {
    pub fn new(config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build ClickHouse HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    /// Connection for user-authored SQL, using the read-only credentials when set.
    pub fn readonly(config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let mut store = Self::new(config)?;
        if let Some(user) = &config.readonly_user {
            store.user = Some(user.clone());
            store.password = config.readonly_password.clone();
        }
        Ok(store)
    }

    fn url_params(&self, ctx: &QueryContext, params: &[BindParam]) -> Vec<(String, String)> {
        let mut query = vec![
            ("database".to_string(), self.database.clone()),
            ("query_id".to_string(), uuid::Uuid::new_v4().to_string()),
            ("date_time_output_format".to_string(), "iso".to_string()),
            (
                "output_format_json_quote_64bit_integers".to_string(),
                "0".to_string(),
            ),
        ];
        query.extend(
            ctx.settings()
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        query.extend(
            params
                .iter()
                .enumerate()
                .map(|(idx, param)| (format!("param_p{idx}"), param.to_param_value())),
        );
        query
    }

    async fn send(&self, ctx: &QueryContext, body: String, params: &[BindParam]) -> Result<String> {
        ctx.ensure_active()?;

        let mut request = self
            .client
            .post(format!("{}/", self.url))
            .query(&self.url_params(ctx, params))
            .body(body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let round_trip = async {
            let response = request.send().await?;
            let status = response.status();
            let text = response.text().await?;
            if status != StatusCode::OK {
                return Err(ServiceError::Store(
                    anyhow!(text.trim().to_string())
                        .context(format!("clickhouse returned {status}")),
                ));
            }
            Ok::<_, ServiceError>(text)
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ServiceError::Cancelled),
            result = round_trip => result,
        }
    }
}

fn render_params(params: &[BindParam]) -> String {
    serde_json::to_string(params).unwrap_or_default()
}

#[async_trait]
impl Store for ClickHouseHttp {
    async fn query(&self, ctx: &QueryContext, sql: &str, params: &[BindParam]) -> Result<RowSet> {
        let span =
            telemetry::store_span("clickhouse.query", ctx.table(), sql, &render_params(params));
        async {
            let body = self
                .send(ctx, format!("{sql}\nFORMAT {OUTPUT_FORMAT}"), params)
                .await?;
            let rows = RowSet::parse(&body).map_err(ServiceError::Store)?;
            debug!(rows = rows.len(), "clickhouse query finished");
            Ok::<_, ServiceError>(rows)
        }
        .instrument(span)
        .await
    }

    async fn exec(&self, ctx: &QueryContext, sql: &str, params: &[BindParam]) -> Result<()> {
        let span =
            telemetry::store_span("clickhouse.exec", ctx.table(), sql, &render_params(params));
        self.send(ctx, sql.to_string(), params)
            .instrument(span)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_names_types_and_rows() {
        let body = "[\"bucket\",\"value\"]\n[\"UInt64\",\"Nullable(Float64)\"]\n[0,1.5]\n[1,null]\n";
        let rows = RowSet::parse(body).unwrap();
        assert_eq!(
            rows.columns,
            vec![
                Column::new("bucket", "UInt64"),
                Column::new("value", "Nullable(Float64)")
            ]
        );
        assert_eq!(rows.rows, vec![vec![json!(0), json!(1.5)], vec![json!(1), Value::Null]]);
    }

    #[test]
    fn empty_body_is_empty_row_set() {
        assert!(RowSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn rejects_ragged_rows() {
        let body = "[\"a\"]\n[\"String\"]\n[\"x\",\"y\"]\n";
        assert!(RowSet::parse(body).is_err());
    }

    #[test]
    fn context_copies_keep_the_cancellation_token() {
        let token = CancellationToken::new();
        let ctx = QueryContext::new(token.clone())
            .with_setting("SQL_project_id", 7)
            .for_table("logs");
        assert_eq!(ctx.settings().get("SQL_project_id").map(String::as_str), Some("7"));
        assert_eq!(ctx.table(), "logs");
        assert!(ctx.ensure_active().is_ok());
        token.cancel();
        assert!(matches!(ctx.ensure_active(), Err(ServiceError::Cancelled)));
    }

    #[test]
    fn url_params_carry_settings_and_binds() {
        let store = ClickHouseHttp {
            client: Client::new(),
            url: "http://localhost:8123".into(),
            database: "default".into(),
            user: None,
            password: None,
        };
        let ctx = QueryContext::default().with_setting("max_rows_to_read", 10);
        let params = store.url_params(&ctx, &[BindParam::Int(7), BindParam::Text("a\tb".into())]);
        assert!(params.contains(&("max_rows_to_read".into(), "10".into())));
        assert!(params.contains(&("param_p0".into(), "7".into())));
        assert!(params.contains(&("param_p1".into(), "a\\tb".into())));
    }
}
