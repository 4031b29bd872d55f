//! Key and key-value listings over the per-day key usage tables.

use super::{
    builder::{union_all, Args, SelectBuilder},
    decode::RowReader,
    Backend,
};
use crate::{
    db::QueryContext,
    error::{Result, ServiceError},
    models::{
        KeyType, KeyValueSuggestion, QueryKey, Resource, TableConfig, TableRegistry,
        ValueSuggestion, FIELDS_TABLE,
    },
    time::DateRange,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info_span, Instrument};

const KEYS_LIMIT: usize = 25;
const DEFAULT_VALUES_LIMIT: usize = 500;
const SUGGESTIONS_PER_KEY: u64 = 5;
const MAX_ROWS_SETTING: &str = "max_rows_to_read";
const KEY_PROJECT_COLUMN: &str = "ProjectId";

/// Resources whose key tables take part in cross-resource key listings.
const ALL_KEYS_RESOURCES: [Resource; 4] = [
    Resource::Events,
    Resource::Logs,
    Resource::Traces,
    Resource::Sessions,
];
const ALL_KEY_VALUES_RESOURCES: [Resource; 3] =
    [Resource::Events, Resource::Logs, Resource::Traces];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysRequest {
    /// Lists keys across every resource when absent.
    #[serde(default)]
    pub resource: Option<Resource>,
    pub project_id: i64,
    pub date_range: DateRange,
    #[serde(default)]
    pub query: String,
    #[serde(default, rename = "type")]
    pub key_type: Option<KeyType>,
    #[serde(default)]
    pub event: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValuesRequest {
    #[serde(default)]
    pub resource: Option<Resource>,
    pub project_id: i64,
    pub key: String,
    pub date_range: DateRange,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub event: Option<String>,
}

impl KeyValuesRequest {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_VALUES_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueSuggestionsRequest {
    pub resource: Resource,
    pub project_id: i64,
    pub date_range: DateRange,
    pub keys: Vec<String>,
}

fn contains_pattern(query: &str) -> String {
    format!("%{query}%")
}

/// `ProjectId`, day-window and optional event predicates shared by key table reads.
fn scope_key_table(
    sb: &mut SelectBuilder,
    project_id: i64,
    range: DateRange,
    event: Option<&str>,
    args: &mut Args,
) {
    sb.and_where(format!("{KEY_PROJECT_COLUMN} = {}", args.add(project_id)))
        .and_where(format!("Day >= toStartOfDay({})", args.add(range.start)))
        .and_where(format!("Day <= toStartOfDay({})", args.add(range.end)));
    if let Some(event) = event.filter(|event| !event.is_empty()) {
        sb.and_where(format!("(Event = {} OR Event = '')", args.add(event)));
    }
}

fn key_filters(sb: &mut SelectBuilder, query: &str, key_type: Option<KeyType>, args: &mut Args) {
    if !query.is_empty() {
        sb.and_where(format!("Key ILIKE {}", args.add(contains_pattern(query))));
    }
    if key_type == Some(KeyType::Numeric) {
        sb.and_where(format!("Type = {}", args.add(KeyType::Numeric.as_str())));
    }
}

fn keys_table(config: &TableConfig) -> Result<&str> {
    config.keys_table.as_deref().ok_or_else(|| {
        ServiceError::invalid(format!("{} has no key table", config.resource.as_str()))
    })
}

fn key_values_table(config: &TableConfig) -> Result<&str> {
    config.key_values_table.as_deref().ok_or_else(|| {
        ServiceError::invalid(format!(
            "{} has no key value table",
            config.resource.as_str()
        ))
    })
}

/// Top keys of one resource by summed usage.
pub(super) async fn keys_aggregated(
    backend: Backend<'_>,
    ctx: &QueryContext,
    config: &TableConfig,
    request: &KeysRequest,
) -> Result<Vec<QueryKey>> {
    let table = keys_table(config)?;
    let mut args = Args::new();
    let mut sb = SelectBuilder::new();
    sb.select(["Key", "Type", "sum(Count)"]).from(table);
    scope_key_table(
        &mut sb,
        request.project_id,
        request.date_range,
        request.event.as_deref(),
        &mut args,
    );
    key_filters(&mut sb, &request.query, request.key_type, &mut args);
    sb.group_by(["1, 2"])
        .order_by("3 DESC, 1")
        .limit(KEYS_LIMIT as u64);

    let ctx = ctx
        .with_setting(MAX_ROWS_SETTING, backend.limits.keys_max_rows)
        .for_table(table);
    let rows = backend
        .store
        .query(&ctx, &sb.build(), args.params())
        .instrument(info_span!("clickhouse.read_keys", db.namespace = table))
        .await?;

    rows.rows
        .iter()
        .map(|row| {
            let reader = RowReader::new(&rows.columns, row);
            Ok(QueryKey::new(
                reader.string(0)?,
                KeyType::parse(&reader.string(1)?),
            ))
        })
        .collect()
}

/// Top values of one key by summed usage.
pub(super) async fn key_values_aggregated(
    backend: Backend<'_>,
    ctx: &QueryContext,
    config: &TableConfig,
    request: &KeyValuesRequest,
) -> Result<Vec<String>> {
    let table = key_values_table(config)?;
    let mut args = Args::new();
    let sb = if table == FIELDS_TABLE {
        fields_values(config, request, "count()", &mut args)
    } else {
        let mut sb = SelectBuilder::new();
        sb.select(["Value", "sum(Count)"]).from(table);
        key_values_scope(&mut sb, request, &mut args);
        sb.group_by(["1"])
            .order_by("2 DESC, 1")
            .limit(request.limit() as u64);
        sb
    };

    let ctx = ctx
        .with_setting(MAX_ROWS_SETTING, backend.limits.key_values_max_rows)
        .for_table(table);
    let rows = backend
        .store
        .query(&ctx, &sb.build(), args.params())
        .instrument(info_span!("clickhouse.read_key_values", db.namespace = table))
        .await?;

    rows.rows
        .iter()
        .map(|row| RowReader::new(&rows.columns, row).string(0))
        .collect()
}

fn key_values_scope(sb: &mut SelectBuilder, request: &KeyValuesRequest, args: &mut Args) {
    sb.and_where(format!(
        "{KEY_PROJECT_COLUMN} = {}",
        args.add(request.project_id)
    ))
    .and_where(format!("Key = {}", args.add(request.key.as_str())))
    .and_where(format!(
        "Value ILIKE {}",
        args.add(contains_pattern(&request.query))
    ))
    .and_where(format!(
        "Day >= toStartOfDay({})",
        args.add(request.date_range.start)
    ))
    .and_where(format!(
        "Day <= toStartOfDay({})",
        args.add(request.date_range.end)
    ));
    if let Some(event) = request.event.as_deref().filter(|event| !event.is_empty()) {
        sb.and_where(format!("(Event = {} OR Event = '')", args.add(event)));
    }
}

/// Values of the legacy single-valued session `fields` table, counted with `count`.
fn fields_values(
    sessions: &TableConfig,
    request: &KeyValuesRequest,
    count: &str,
    args: &mut Args,
) -> SelectBuilder {
    let mut sb = SelectBuilder::new();
    sb.select(["Value".to_string(), count.to_string()])
        .from(FIELDS_TABLE)
        .and_where(format!(
            "{} = {}",
            sessions.project_id_column,
            args.add(request.project_id)
        ))
        .and_where(format!("Name = {}", args.add(request.key.as_str())))
        .and_where(format!(
            "Value ILIKE {}",
            args.add(contains_pattern(&request.query))
        ))
        .and_where(format!(
            "SessionCreatedAt >= {}",
            args.add(request.date_range.start)
        ))
        .and_where(format!(
            "SessionCreatedAt <= {}",
            args.add(request.date_range.end)
        ))
        .group_by(["1"])
        .order_by("2 DESC, 1")
        .limit(request.limit() as u64);
    sb
}

/// The five most used values of each requested key, in request key order.
pub(super) async fn key_value_suggestions(
    backend: Backend<'_>,
    ctx: &QueryContext,
    config: &TableConfig,
    request: &KeyValueSuggestionsRequest,
) -> Result<Vec<KeyValueSuggestion>> {
    let table = key_values_table(config)?;
    if table == FIELDS_TABLE {
        return Err(ServiceError::invalid(format!(
            "{} does not support value suggestions",
            config.resource.as_str()
        )));
    }

    let mut args = Args::new();
    let mut ranked = SelectBuilder::new();
    ranked
        .select([
            "Key",
            "Value",
            "sum(Count) OVER (PARTITION BY Key) AS KeyCount",
            "sum(Count) AS ValueCount",
            "row_number() OVER (PARTITION BY Key ORDER BY sum(Count) DESC) AS Rank",
        ])
        .from(table);
    scope_key_table(
        &mut ranked,
        request.project_id,
        request.date_range,
        None,
        &mut args,
    );
    ranked
        .and_where(format!("Key IN {}", args.add(request.keys.clone())))
        .group_by(["Key, Value, Count"]);

    let mut sb = SelectBuilder::new();
    sb.select(["*"])
        .from(format!("({}) AS ranked_keys", ranked.build()))
        .and_where(format!("Rank <= {SUGGESTIONS_PER_KEY}"))
        .order_by("Key, Rank");

    let ctx = ctx
        .with_setting(MAX_ROWS_SETTING, backend.limits.key_values_max_rows)
        .for_table(table);
    let rows = backend
        .store
        .query(&ctx, &sb.build(), args.params())
        .instrument(info_span!(
            "clickhouse.read_key_value_suggestions",
            db.namespace = table
        ))
        .await?;

    let mut by_key: HashMap<String, Vec<ValueSuggestion>> = HashMap::new();
    for row in &rows.rows {
        let reader = RowReader::new(&rows.columns, row);
        by_key
            .entry(reader.string(0)?)
            .or_default()
            .push(ValueSuggestion {
                value: reader.string(1)?,
                count: reader.u64(3)?,
                rank: reader.u64(4)?,
            });
    }

    Ok(request
        .keys
        .iter()
        .map(|key| KeyValueSuggestion {
            key: key.clone(),
            values: by_key.remove(key).unwrap_or_default(),
        })
        .collect())
}

/// Weighted key ranking across resources, with reserved keys folded in at weight 1.
pub(super) async fn all_keys(
    backend: Backend<'_>,
    ctx: &QueryContext,
    registry: &TableRegistry,
    request: &KeysRequest,
) -> Result<Vec<QueryKey>> {
    let mut args = Args::new();
    let mut selects = Vec::new();
    for resource in ALL_KEYS_RESOURCES {
        let config = &registry.get(resource)?.primary;
        let Some(table) = config.keys_table.as_deref() else {
            continue;
        };
        let mut sb = SelectBuilder::new();
        sb.select([
            "Key",
            "any(Type) AS Type",
            "sum(Count) / max(sum(Count)) OVER () AS PctCount",
        ])
        .from(table);
        scope_key_table(&mut sb, request.project_id, request.date_range, None, &mut args);
        key_filters(&mut sb, &request.query, request.key_type, &mut args);
        sb.group_by(["1"])
            .order_by("3 DESC, 1")
            .limit(KEYS_LIMIT as u64);
        selects.push(sb.build());
    }

    let mut sb = SelectBuilder::new();
    sb.select(["Key", "any(Type)", "sum(PctCount)"])
        .from(format!("({}) AS inner", union_all(&selects)))
        .group_by(["1"]);

    let ctx = ctx.with_setting(MAX_ROWS_SETTING, backend.limits.keys_max_rows);
    let rows = backend
        .store
        .query(&ctx, &sb.build(), args.params())
        .instrument(info_span!("clickhouse.read_all_keys"))
        .await?;

    let mut weighted = rows
        .rows
        .iter()
        .map(|row| {
            let reader = RowReader::new(&rows.columns, row);
            Ok((
                QueryKey::new(reader.string(0)?, KeyType::parse(&reader.string(1)?)),
                reader.f64(2)?.unwrap_or_default(),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let needle = request.query.to_lowercase();
    for resource in Resource::ALL {
        let Ok(table) = registry.get(resource) else {
            continue;
        };
        weighted.extend(
            table
                .primary
                .reserved_keys
                .iter()
                .filter(|key| key.name.to_lowercase().contains(&needle))
                .filter(|key| {
                    request.key_type != Some(KeyType::Numeric) || key.key_type == KeyType::Numeric
                })
                .map(|key| (key.clone(), 1.0)),
        );
    }

    let keys = rank_weighted(weighted, |key| key.name.clone(), KEYS_LIMIT);
    debug!(keys = keys.len(), "ranked keys across resources");
    Ok(keys)
}

/// Weighted value ranking across resources, including the legacy session fields table.
pub(super) async fn all_key_values(
    backend: Backend<'_>,
    ctx: &QueryContext,
    registry: &TableRegistry,
    request: &KeyValuesRequest,
) -> Result<Vec<String>> {
    let limit = request.limit();
    let mut args = Args::new();
    let mut selects = Vec::new();
    for resource in ALL_KEY_VALUES_RESOURCES {
        let config = &registry.get(resource)?.primary;
        let Some(table) = config.key_values_table.as_deref() else {
            continue;
        };
        let mut sb = SelectBuilder::new();
        sb.select(["Value", "sum(Count) / max(sum(Count)) OVER () AS PctCount"])
            .from(table);
        key_values_scope(&mut sb, request, &mut args);
        sb.group_by(["1"])
            .order_by("2 DESC, 1")
            .limit(limit as u64);
        selects.push(sb.build());
    }
    let sessions = &registry.get(Resource::Sessions)?.primary;
    selects.push(
        fields_values(
            sessions,
            request,
            "count() / max(count()) OVER () AS PctCount",
            &mut args,
        )
        .build(),
    );

    let mut sb = SelectBuilder::new();
    sb.select(["Value", "sum(PctCount)"])
        .from(format!("({}) AS inner", union_all(&selects)))
        .group_by(["1"])
        .order_by("2 DESC")
        .limit(limit as u64);

    let ctx = ctx
        .with_setting(MAX_ROWS_SETTING, backend.limits.all_key_values_max_rows)
        .for_table(FIELDS_TABLE);
    let rows = backend
        .store
        .query(&ctx, &sb.build(), args.params())
        .instrument(info_span!("clickhouse.read_all_key_values"))
        .await?;

    rows.rows
        .iter()
        .map(|row| RowReader::new(&rows.columns, row).string(0))
        .collect()
}

/// Sums weights per name, keeping the first item seen for each name, then orders by
/// total weight (ties by name) and keeps the top `limit`.
fn rank_weighted<T>(items: Vec<(T, f64)>, name: impl Fn(&T) -> String, limit: usize) -> Vec<T> {
    let mut order: Vec<(T, f64)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (item, weight) in items {
        match index.get(&name(&item)) {
            Some(&idx) => order[idx].1 += weight,
            None => {
                index.insert(name(&item), order.len());
                order.push((item, weight));
            }
        }
    }

    order.sort_by(|(a, wa), (b, wb)| wb.total_cmp(wa).then_with(|| name(a).cmp(&name(b))));
    order.truncate(limit);
    order.into_iter().map(|(item, _)| item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineLimits,
        db::{Column, RowSet},
        parser::DefaultSearchParser,
        query::{tests::ScriptedStore, BindParam},
    };
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn range() -> DateRange {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        DateRange::new(start, start + Duration::days(7)).unwrap()
    }

    fn backend<'a>(store: &'a ScriptedStore, limits: &'a EngineLimits) -> Backend<'a> {
        Backend {
            store,
            readonly: store,
            search: &DefaultSearchParser,
            limits,
        }
    }

    fn keys_request(query: &str) -> KeysRequest {
        KeysRequest {
            resource: Some(Resource::Logs),
            project_id: 1,
            date_range: range(),
            query: query.to_string(),
            key_type: None,
            event: None,
        }
    }

    #[tokio::test]
    async fn keys_query_scopes_filters_and_decodes_types() {
        let store = ScriptedStore::new(vec![RowSet::new(
            vec![
                Column::new("Key", "String"),
                Column::new("Type", "String"),
                Column::new("sum(Count)", "UInt64"),
            ],
            vec![
                vec![json!("http.route"), json!("String"), json!(40)],
                vec![json!("latency"), json!("Numeric"), json!(3)],
            ],
        )]);
        let limits = EngineLimits::default();
        let registry = TableRegistry::default();
        let logs = &registry.get(Resource::Logs).unwrap().primary;
        let mut request = keys_request("ro");
        request.key_type = Some(KeyType::Numeric);
        request.event = Some("click".into());

        let keys = keys_aggregated(
            backend(&store, &limits),
            &QueryContext::default(),
            logs,
            &request,
        )
        .await
        .unwrap();
        assert_eq!(
            keys,
            vec![
                QueryKey::new("http.route", KeyType::String),
                QueryKey::new("latency", KeyType::Numeric)
            ]
        );

        let call = store.last_call();
        assert_eq!(
            call.sql,
            "SELECT Key, Type, sum(Count) FROM log_keys WHERE ProjectId = {p0:Int64} \
             AND Day >= toStartOfDay({p1:DateTime64(9)}) AND Day <= toStartOfDay({p2:DateTime64(9)}) \
             AND (Event = {p3:String} OR Event = '') AND Key ILIKE {p4:String} AND Type = {p5:String} \
             GROUP BY 1, 2 ORDER BY 3 DESC, 1 LIMIT 25"
        );
        assert_eq!(call.params[4], BindParam::Text("%ro%".into()));
        assert_eq!(
            call.settings.get(MAX_ROWS_SETTING).map(String::as_str),
            Some(limits.keys_max_rows.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn session_values_read_the_fields_table() {
        let store = ScriptedStore::new(vec![RowSet::default()]);
        let limits = EngineLimits::default();
        let registry = TableRegistry::default();
        let sessions = &registry.get(Resource::Sessions).unwrap().primary;
        let request = KeyValuesRequest {
            resource: Some(Resource::Sessions),
            project_id: 3,
            key: "browser_name".into(),
            date_range: range(),
            query: String::new(),
            limit: Some(20),
            event: None,
        };

        let values = key_values_aggregated(
            backend(&store, &limits),
            &QueryContext::default(),
            sessions,
            &request,
        )
        .await
        .unwrap();
        assert!(values.is_empty());
        let sql = store.last_call().sql;
        assert!(
            sql.starts_with(
                "SELECT Value, count() FROM fields WHERE ProjectID = {p0:Int64} AND Name = {p1:String}"
            ),
            "{sql}"
        );
        assert!(sql.ends_with("GROUP BY 1 ORDER BY 2 DESC, 1 LIMIT 20"), "{sql}");
    }

    #[tokio::test]
    async fn suggestions_follow_request_key_order() {
        let store = ScriptedStore::new(vec![RowSet::new(
            vec![
                Column::new("Key", "String"),
                Column::new("Value", "String"),
                Column::new("KeyCount", "UInt64"),
                Column::new("ValueCount", "UInt64"),
                Column::new("Rank", "UInt64"),
            ],
            vec![
                vec![json!("env"), json!("prod"), json!(10), json!(7), json!(1)],
                vec![json!("env"), json!("dev"), json!(10), json!(3), json!(2)],
            ],
        )]);
        let limits = EngineLimits::default();
        let registry = TableRegistry::default();
        let traces = &registry.get(Resource::Traces).unwrap().primary;
        let request = KeyValueSuggestionsRequest {
            resource: Resource::Traces,
            project_id: 1,
            date_range: range(),
            keys: vec!["service".into(), "env".into()],
        };

        let suggestions = key_value_suggestions(
            backend(&store, &limits),
            &QueryContext::default(),
            traces,
            &request,
        )
        .await
        .unwrap();
        assert_eq!(suggestions[0].key, "service");
        assert!(suggestions[0].values.is_empty());
        assert_eq!(
            suggestions[1].values,
            vec![
                ValueSuggestion { value: "prod".into(), count: 7, rank: 1 },
                ValueSuggestion { value: "dev".into(), count: 3, rank: 2 },
            ]
        );
        let sql = store.last_call().sql;
        assert!(sql.contains("FROM trace_key_values WHERE"), "{sql}");
        assert!(sql.ends_with(") AS ranked_keys WHERE Rank <= 5 ORDER BY Key, Rank"), "{sql}");
    }

    #[tokio::test]
    async fn all_keys_fold_in_reserved_keys() {
        let store = ScriptedStore::new(vec![RowSet::new(
            vec![
                Column::new("Key", "String"),
                Column::new("any(Type)", "String"),
                Column::new("sum(PctCount)", "Float64"),
            ],
            vec![
                vec![json!("service_name"), json!("String"), json!(0.5)],
                vec![json!("custom.region"), json!("String"), json!(1.5)],
            ],
        )]);
        let limits = EngineLimits::default();
        let registry = TableRegistry::default();
        let request = KeysRequest {
            resource: None,
            ..keys_request("NAME")
        };

        let keys = all_keys(backend(&store, &limits), &QueryContext::default(), &registry, &request)
            .await
            .unwrap();
        let names = keys.iter().map(|key| key.name.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "service_name",
                "custom.region",
                "browser_name",
                "metric_name",
                "os_name",
                "span_name"
            ]
        );

        let sql = store.last_call().sql;
        for table in ["event_keys", "log_keys", "trace_keys", "session_keys"] {
            assert!(sql.contains(&format!("FROM {table} WHERE")), "{sql}");
        }
        assert_eq!(sql.matches("UNION ALL").count(), 3);
    }

    #[test]
    fn weighted_ranking_sums_duplicates() {
        let ranked = rank_weighted(
            vec![("b", 0.5), ("a", 0.5), ("b", 1.0), ("c", 2.0)],
            |name| name.to_string(),
            2,
        );
        assert_eq!(ranked, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn all_key_values_union_includes_the_fields_table() {
        let store = ScriptedStore::new(vec![RowSet::new(
            vec![
                Column::new("Value", "String"),
                Column::new("sum(PctCount)", "Float64"),
            ],
            vec![vec![json!("chrome"), json!(1.25)]],
        )]);
        let limits = EngineLimits::default();
        let registry = TableRegistry::default();
        let request = KeyValuesRequest {
            resource: None,
            project_id: 1,
            key: "browser".into(),
            date_range: range(),
            query: "chr".into(),
            limit: None,
            event: None,
        };

        let values = all_key_values(
            backend(&store, &limits),
            &QueryContext::default(),
            &registry,
            &request,
        )
        .await
        .unwrap();
        assert_eq!(values, vec!["chrome".to_string()]);

        let call = store.last_call();
        assert!(call.sql.contains("FROM fields WHERE ProjectID ="), "{}", call.sql);
        assert!(call.sql.ends_with("GROUP BY 1 ORDER BY 2 DESC LIMIT 500"), "{}", call.sql);
        assert_eq!(
            call.settings.get(MAX_ROWS_SETTING).map(String::as_str),
            Some(limits.all_key_values_max_rows.to_string().as_str())
        );
    }
}
