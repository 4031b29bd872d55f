use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub clickhouse: ClickHouseConfig,
    pub request_timeout: Duration,
    pub limits: EngineLimits,
}

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Credentials used for user-authored SQL. Falls back to the primary user.
    pub readonly_user: Option<String>,
    pub readonly_password: Option<String>,
    pub timeout: Duration,
}

/// Hard limits applied by the query engine. Passed explicitly into every entry point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineLimits {
    pub max_buckets: u64,
    pub default_bucket_count: u64,
    pub max_result_rows: u64,
    pub sampling_rows: u64,
    pub default_page_limit: usize,
    pub default_top_n: u64,
    pub keys_max_rows: u64,
    pub key_values_max_rows: u64,
    pub all_key_values_max_rows: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_buckets: default_max_buckets(),
            default_bucket_count: default_bucket_count(),
            max_result_rows: default_max_result_rows(),
            sampling_rows: default_sampling_rows(),
            default_page_limit: default_page_limit(),
            default_top_n: default_top_n(),
            keys_max_rows: default_keys_max_rows(),
            key_values_max_rows: default_keys_max_rows(),
            all_key_values_max_rows: default_all_key_values_max_rows(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    resql_listen_addr: Option<String>,
    #[serde(default)]
    resql_listen_host: Option<String>,
    #[serde(default)]
    resql_listen_port: Option<u16>,
    #[serde(default)]
    resql_clickhouse_url: Option<String>,
    #[serde(default)]
    clickhouse_url: Option<String>,
    #[serde(default = "default_database")]
    resql_clickhouse_database: String,
    #[serde(default)]
    resql_clickhouse_user: Option<String>,
    #[serde(default)]
    resql_clickhouse_password: Option<String>,
    #[serde(default)]
    resql_clickhouse_readonly_user: Option<String>,
    #[serde(default)]
    resql_clickhouse_readonly_password: Option<String>,
    #[serde(default = "default_clickhouse_timeout_secs")]
    resql_clickhouse_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    resql_request_timeout_secs: u64,
    #[serde(default = "default_max_buckets")]
    resql_max_buckets: u64,
    #[serde(default = "default_bucket_count")]
    resql_default_bucket_count: u64,
    #[serde(default = "default_max_result_rows")]
    resql_max_result_rows: u64,
    #[serde(default = "default_sampling_rows")]
    resql_sampling_rows: u64,
    #[serde(default = "default_page_limit")]
    resql_default_page_limit: usize,
    #[serde(default = "default_top_n")]
    resql_default_top_n: u64,
    #[serde(default = "default_keys_max_rows")]
    resql_keys_max_rows: u64,
    #[serde(default = "default_keys_max_rows")]
    resql_key_values_max_rows: u64,
    #[serde(default = "default_all_key_values_max_rows")]
    resql_all_key_values_max_rows: u64,
}

fn default_database() -> String {
    "default".to_string()
}

const fn default_clickhouse_timeout_secs() -> u64 {
    60
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_buckets() -> u64 {
    240
}

const fn default_bucket_count() -> u64 {
    48
}

const fn default_max_result_rows() -> u64 {
    10_000
}

const fn default_sampling_rows() -> u64 {
    20_000_000
}

const fn default_page_limit() -> usize {
    50
}

const fn default_top_n() -> u64 {
    10
}

const fn default_keys_max_rows() -> u64 {
    1_000_000
}

const fn default_all_key_values_max_rows() -> u64 {
    100_000_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse RESQL_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.resql_listen_addr,
            raw.resql_listen_host,
            raw.resql_listen_port,
        )?;

        let url = raw
            .resql_clickhouse_url
            .or(raw.clickhouse_url)
            .or_else(|| env::var("CLICKHOUSE_URL").ok())
            .context("RESQL_CLICKHOUSE_URL or CLICKHOUSE_URL must be set")?;

        let clickhouse = ClickHouseConfig {
            url: url.trim_end_matches('/').to_string(),
            database: raw.resql_clickhouse_database,
            user: non_empty(raw.resql_clickhouse_user),
            password: raw.resql_clickhouse_password,
            readonly_user: non_empty(raw.resql_clickhouse_readonly_user),
            readonly_password: raw.resql_clickhouse_readonly_password,
            timeout: Duration::from_secs(raw.resql_clickhouse_timeout_secs.max(1)),
        };

        let default_bucket_count = raw.resql_default_bucket_count.max(1);
        let limits = EngineLimits {
            max_buckets: raw.resql_max_buckets.max(default_bucket_count),
            default_bucket_count,
            max_result_rows: raw.resql_max_result_rows.max(1),
            sampling_rows: raw.resql_sampling_rows.max(1),
            default_page_limit: raw.resql_default_page_limit.max(1),
            default_top_n: raw.resql_default_top_n.max(1),
            keys_max_rows: raw.resql_keys_max_rows,
            key_values_max_rows: raw.resql_key_values_max_rows,
            all_key_values_max_rows: raw.resql_all_key_values_max_rows,
        };

        Ok(Self {
            listen_addr,
            clickhouse,
            request_timeout: Duration::from_secs(raw.resql_request_timeout_secs.max(1)),
            limits,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid RESQL_LISTEN_ADDR value")?
            .next()
            .context("RESQL_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8480);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
