use super::{
    attributes::known_column,
    bucketing::{
        self, attribute_expr, float_attribute, group_alias, metric_input_alias,
        metric_value_alias, AggregateRow, BucketSpec, Interpolation, BUCKET_INDEX_ALIAS,
        LIMIT_METRIC_ALIAS, LIMIT_RANK_ALIAS, MAX_ALIAS, MAX_BLOCK_NUMBER_ALIAS, MIN_ALIAS,
        SAMPLE_FACTOR_ALIAS,
    },
    builder::{make_select_builder, or, union_all, Args, BaseRequest, SelectBuilder},
    decode::{decode_metric_rows, decode_rows, RowReader},
    rewrite::{rewrite_sql, RewriteRequest},
    Backend,
};
use crate::{
    db::{QueryContext, Store},
    error::{Result, ServiceError},
    models::{
        BucketBy, MetricAggregator, MetricExpression, MetricsBuckets, QueryInput, Resource,
        SampleableTableConfig, SamplingStats, SavedMetricState, TableChoice, TableConfig,
        DISTINCT_KEY_ATTRIBUTE, METRIC_HISTORY_TABLE, NO_LIMIT, TIMESTAMP_COLUMN,
    },
    pagination::Pagination,
    time::DateRange,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info_span, Instrument};

/// Custom server setting carrying the caller's project id for user-authored SQL.
pub const PROJECT_ID_SETTING: &str = "SQL_project_id";

const DEFAULT_RANGE_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRequest {
    pub resource: Resource,
    pub project_ids: Vec<i64>,
    #[serde(default)]
    pub params: QueryInput,
    /// User-authored SQL, decoded column by column instead of the structured path.
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub expressions: Vec<MetricExpression>,
    #[serde(default)]
    pub bucket_by: BucketBy,
    #[serde(default)]
    pub bucket_count: Option<u64>,
    #[serde(default)]
    pub bucket_window: Option<u64>,
    #[serde(default)]
    pub no_bucket_max: bool,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub limit_aggregator: Option<MetricAggregator>,
    #[serde(default)]
    pub limit_column: Option<String>,
    #[serde(default)]
    pub saved_metric_state: Option<SavedMetricState>,
}

impl MetricsRequest {
    pub fn new(resource: Resource, project_ids: Vec<i64>, params: QueryInput) -> Self {
        Self {
            resource,
            project_ids,
            params,
            sql: None,
            expressions: Vec::new(),
            bucket_by: BucketBy::Timestamp,
            bucket_count: None,
            bucket_window: None,
            no_bucket_max: false,
            group_by: Vec::new(),
            limit: None,
            limit_aggregator: None,
            limit_column: None,
            saved_metric_state: None,
        }
    }

    fn bucket_spec(&self) -> BucketSpec<'_> {
        BucketSpec {
            bucket_by: &self.bucket_by,
            bucket_count: self.bucket_count,
            bucket_window: self.bucket_window,
            no_bucket_max: self.no_bucket_max,
        }
    }
}

/// Computes metric buckets, or writes their aggregate state to the history table when
/// the request carries a saved metric state.
pub(super) async fn read_metrics(
    backend: Backend<'_>,
    ctx: &QueryContext,
    table: &SampleableTableConfig,
    request: &MetricsRequest,
    now: DateTime<Utc>,
) -> Result<MetricsBuckets> {
    let range = match request.params.date_range {
        Some(range) => {
            range.validate()?;
            range
        }
        None => DateRange::last_days(now, DEFAULT_RANGE_DAYS),
    };

    let choice = choose_table(backend.store, ctx, table, &request.project_ids, range).await?;

    if request.expressions.is_empty() {
        return Err(ServiceError::invalid("no expressions provided"));
    }

    let mut config = table.config_for(choice).clone();
    if request
        .expressions
        .iter()
        .any(|expr| expr.aggregator == MetricAggregator::CountDistinctKey)
    {
        config.default_filter = None;
    }

    let span = info_span!(
        "clickhouse.read_metrics",
        db.namespace = %config.table_name,
        sampled = choice.is_sampled(),
        raw_sql = request.sql.is_some(),
    );
    async {
        match &request.sql {
            Some(sql) => read_metrics_sql(backend, ctx, &config, choice, request, range, sql).await,
            None => read_metrics_structured(backend, ctx, &config, choice, request, range).await,
        }
    }
    .instrument(span)
    .await
}

/// Picks the sampled companion when the primary table's estimate exceeds the budget.
async fn choose_table(
    store: &dyn Store,
    ctx: &QueryContext,
    table: &SampleableTableConfig,
    project_ids: &[i64],
    range: DateRange,
) -> Result<TableChoice> {
    let Some(sampling) = &table.sampling else {
        return Ok(TableChoice::Primary);
    };
    if table.sample_size_rows == 0 {
        return Ok(TableChoice::Primary);
    }

    let primary = table.primary.table_name.as_str();
    let stats = sampling_stats(
        store,
        ctx,
        &[primary, sampling.table_name.as_str()],
        project_ids,
        range,
    )
    .await?;

    let estimated = |name: &str| stats.get(name).map_or(0, |stat| stat.rows);
    let primary_rows = estimated(primary);
    let sampling_rows = estimated(&sampling.table_name);
    if primary_rows <= table.sample_size_rows || sampling_rows == 0 {
        return Ok(TableChoice::Primary);
    }

    let ratio = table.sample_size_rows as f64 / sampling_rows as f64;
    debug!(primary_rows, sampling_rows, ratio, "sampling metrics read");
    Ok(TableChoice::from_ratio(ratio))
}

/// Estimated rows, parts and marks per table over `range`, keyed by table name.
pub async fn sampling_stats(
    store: &dyn Store,
    ctx: &QueryContext,
    tables: &[&str],
    project_ids: &[i64],
    range: DateRange,
) -> Result<HashMap<String, SamplingStats>> {
    let mut unique_tables: Vec<&str> = Vec::new();
    for table in tables {
        if !unique_tables.contains(table) {
            unique_tables.push(table);
        }
    }
    let mut unique_ids: Vec<i64> = Vec::new();
    for id in project_ids {
        if !unique_ids.contains(id) {
            unique_ids.push(*id);
        }
    }

    let mut args = Args::new();
    let selects = unique_tables
        .iter()
        .map(|table| {
            let mut sb = SelectBuilder::new();
            sb.select(["1"])
                .from(*table)
                .and_where(format!("ProjectId IN {}", args.add(unique_ids.clone())))
                .and_where(format!("{TIMESTAMP_COLUMN} >= {}", args.add(range.start)))
                .and_where(format!("{TIMESTAMP_COLUMN} <= {}", args.add(range.end)));
            sb.build()
        })
        .collect::<Vec<_>>();
    let sql = format!("EXPLAIN ESTIMATE {}", union_all(&selects));

    let rows = store.query(ctx, &sql, args.params()).await?;
    let stats: Vec<SamplingStats> = decode_rows(&rows)?;
    Ok(stats
        .into_iter()
        .map(|stat| (stat.table.clone(), stat))
        .collect())
}

async fn read_metrics_sql(
    backend: Backend<'_>,
    ctx: &QueryContext,
    config: &TableConfig,
    choice: TableChoice,
    request: &MetricsRequest,
    range: DateRange,
    sql: &str,
) -> Result<MetricsBuckets> {
    if sql.contains(PROJECT_ID_SETTING) {
        return Err(ServiceError::invalid(
            "SQL queries cannot reference the project id setting",
        ));
    }
    let rewritten = rewrite_sql(
        sql,
        config,
        choice,
        RewriteRequest {
            project_ids: &request.project_ids,
            date_range: range,
            search: &request.params.query,
        },
        backend.search,
    )?;
    let project_id = match request.project_ids.as_slice() {
        [id] => *id,
        ids => {
            return Err(ServiceError::invalid(format!(
                "SQL queries must use 1 project id, {} found",
                ids.len()
            )))
        }
    };

    let ctx = ctx
        .with_setting(PROJECT_ID_SETTING, project_id)
        .for_table(&config.table_name);
    let rows = backend.readonly.query(&ctx, &rewritten.sql, &[]).await?;
    decode_metric_rows(&rows)
}

/// The aggregate query of the structured path, before execution.
#[derive(Debug)]
pub(super) struct MetricsQuery {
    pub builder: SelectBuilder,
    pub args: Args,
    pub bucket_count: u64,
    pub date_range: DateRange,
}

async fn read_metrics_structured(
    backend: Backend<'_>,
    ctx: &QueryContext,
    config: &TableConfig,
    choice: TableChoice,
    request: &MetricsRequest,
    range: DateRange,
) -> Result<MetricsBuckets> {
    let query = build_metrics_query(backend, config, choice, request, range)?;
    let ctx = ctx.for_table(&config.table_name);

    if let Some(state) = &request.saved_metric_state {
        let bucket_count = query.bucket_count;
        save_metric_history(backend.store, &ctx, query, state, request).await?;
        return Ok(MetricsBuckets {
            bucket_count,
            ..MetricsBuckets::default()
        });
    }

    let sql = query.builder.build();
    let rows = backend.store.query(&ctx, &sql, query.args.params()).await?;

    let group_width = request.group_by.len();
    let expression_count = request.expressions.len();
    let decoded = rows
        .rows
        .iter()
        .map(|row| {
            let reader = RowReader::new(&rows.columns, row);
            let values = (0..expression_count)
                .map(|idx| reader.f64(4 + idx))
                .collect::<Result<Vec<_>>>()?;
            let group = (0..group_width)
                .map(|idx| reader.string(4 + expression_count + idx))
                .collect::<Result<Vec<_>>>()?;
            Ok(AggregateRow {
                bucket_id: reader.u64(0)?,
                sample_factor: reader.f64(1)?.unwrap_or_default(),
                min: reader.f64(2)?.unwrap_or_default(),
                max: reader.f64(3)?.unwrap_or_default(),
                values,
                group,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let empty_bounds = (request.bucket_by == BucketBy::Timestamp).then(|| {
        (
            query.date_range.start.timestamp() as f64,
            query.date_range.end.timestamp() as f64,
        )
    });
    Ok(bucketing::interpolate(
        decoded,
        Interpolation {
            expressions: &request.expressions,
            group_width,
            bucket_count: query.bucket_count,
            empty_bounds,
        },
    ))
}

/// Builds the bucketed aggregate query: a scoped inner query producing per-row metric
/// inputs, an aggregation by bucket and group, and an optional top-N ranking layer.
pub(super) fn build_metrics_query(
    backend: Backend<'_>,
    config: &TableConfig,
    choice: TableChoice,
    request: &MetricsRequest,
    range: DateRange,
) -> Result<MetricsQuery> {
    let limits = backend.limits;
    let mut args = Args::new();

    let info = bucketing::bucketing(config, request.bucket_spec(), range, limits, &mut args)?;
    let params = QueryInput {
        date_range: Some(info.date_range),
        ..request.params.clone()
    };
    let table_expr = choice.table_expr(config);
    let pagination = Pagination::count_only();
    let base = make_select_builder(
        BaseRequest {
            config,
            table_expr: &table_expr,
            select_columns: &[],
            project_ids: &request.project_ids,
            params: &params,
            pagination: &pagination,
        },
        backend.search,
        &mut args,
    )?;
    let mut inner = base.builder;
    if let Some(state) = &request.saved_metric_state {
        apply_block_filter(&mut inner, &config.table_name, state, &mut args);
    }

    let mut select = info.select_items;
    if request.saved_metric_state.is_some() {
        select.push(format!(
            "maxState(_block_number) OVER () AS {MAX_BLOCK_NUMBER_ALIAS}"
        ));
    }
    if choice.is_sampled() {
        select.push(SAMPLE_FACTOR_ALIAS.to_string());
    } else {
        select.push(format!("1.0 AS {SAMPLE_FACTOR_ALIAS}"));
    }

    for (idx, expression) in request.expressions.iter().enumerate() {
        let input = metric_input(config, expression, &mut args)?;
        select.push(format!("{input} AS {}", metric_input_alias(idx)));
    }

    let mut groups = Vec::with_capacity(request.group_by.len());
    for (idx, field) in request.group_by.iter().enumerate() {
        let expr = match config.column_for(field) {
            Some(column) => format!("toString({column})"),
            None => attribute_expr(config, field, Some("toString"), &mut args)?,
        };
        let alias = group_alias(idx);
        select.push(format!("{expr} AS {alias}"));
        inner.and_where(format!("{alias} != ''"));
        groups.push(alias);
    }

    let top_n = request.limit.unwrap_or(limits.default_top_n).max(1);
    let limit_aggregator = request
        .limit_aggregator
        .filter(|_| !groups.is_empty() && top_n != NO_LIMIT);
    if let Some(aggregator) = limit_aggregator {
        let column = match request.limit_column.as_deref().unwrap_or_default() {
            "" => "1.0".to_string(),
            field => match config.column_for(field) {
                Some(column) => column.to_string(),
                None => float_attribute(config, field, &mut args)?,
            },
        };
        select.push(format!(
            "{} OVER (PARTITION BY {}) AS {LIMIT_METRIC_ALIAS}",
            bucketing::limit_fn(aggregator, &column),
            groups.join(", ")
        ));
    }
    inner.select(select);
    inner.clear_order_by();

    let persist = request.saved_metric_state.is_some();
    let mut aggregate = SelectBuilder::new();
    aggregate
        .select([
            BUCKET_INDEX_ALIAS.to_string(),
            format!("any({SAMPLE_FACTOR_ALIAS}) AS sample_factor"),
            format!("any({MIN_ALIAS}) AS {MIN_ALIAS}"),
            format!("any({MAX_ALIAS}) AS {MAX_ALIAS}"),
        ])
        .from(format!("({}) AS inner", inner.build()));
    if persist {
        aggregate.select_more(format!(
            "any({MAX_BLOCK_NUMBER_ALIAS}) AS {MAX_BLOCK_NUMBER_ALIAS}"
        ));
    }
    for (idx, expression) in request.expressions.iter().enumerate() {
        let input = metric_input_alias(idx);
        let value = if persist {
            bucketing::state_fn(expression.aggregator, &input)
        } else {
            bucketing::final_fn(expression.aggregator, &input)
        };
        aggregate.select_more(format!("{value} AS {}", metric_value_alias(idx)));
    }
    for group in &groups {
        aggregate.select_more(group.clone());
    }
    aggregate.group_by([BUCKET_INDEX_ALIAS]);

    let mut order = vec![BUCKET_INDEX_ALIAS.to_string()];
    let mut outer = if limit_aggregator.is_some() {
        aggregate.select_more(format!(
            "dense_rank() OVER (ORDER BY {LIMIT_METRIC_ALIAS} DESC, {}) AS {LIMIT_RANK_ALIAS}",
            groups.join(", ")
        ));
        aggregate.group_by([LIMIT_METRIC_ALIAS]);

        let mut ranked = SelectBuilder::new();
        ranked.select([
            BUCKET_INDEX_ALIAS.to_string(),
            "sample_factor".to_string(),
            MIN_ALIAS.to_string(),
            MAX_ALIAS.to_string(),
        ]);
        if persist {
            ranked.select_more(MAX_BLOCK_NUMBER_ALIAS);
        }
        for idx in 0..request.expressions.len() {
            ranked.select_more(metric_value_alias(idx));
        }
        for group in &groups {
            ranked.select_more(group.clone());
        }
        order.push(LIMIT_RANK_ALIAS.to_string());
        aggregate.group_by(groups.iter().cloned());
        ranked
            .from(format!("({}) AS outer", aggregate.build()))
            .and_where(format!("{LIMIT_RANK_ALIAS} <= {top_n}"));
        ranked
    } else {
        aggregate.group_by(groups.iter().cloned());
        aggregate
    };

    order.extend(groups.iter().cloned());
    for column in order {
        outer.order_by(column);
    }
    outer.limit(limits.max_result_rows);

    Ok(MetricsQuery {
        builder: outer,
        args,
        bucket_count: info.bucket_count,
        date_range: info.date_range,
    })
}

/// Per-row input of one aggregator expression.
fn metric_input(
    config: &TableConfig,
    expression: &MetricExpression,
    args: &mut Args,
) -> Result<String> {
    let column = expression.column.as_str();
    if expression.aggregator == MetricAggregator::Count || column.is_empty() {
        return Ok("1.0".to_string());
    }
    if expression.aggregator == MetricAggregator::CountDistinctKey {
        return attribute_expr(config, DISTINCT_KEY_ATTRIBUTE, None, args);
    }

    let known = known_column(config, column);
    if expression.aggregator.is_distinct() {
        return match known {
            Some(known) => Ok(known.to_string()),
            None => attribute_expr(config, column, None, args),
        };
    }
    match (known, &config.metric_column) {
        (Some(known), _) => Ok(format!("toFloat64({known})")),
        (None, Some(metric_column)) => Ok(metric_column.clone()),
        (None, None) => float_attribute(config, column, args),
    }
}

/// Restricts an incremental read to parts and blocks past each partition's
/// high-water mark.
fn apply_block_filter(
    sb: &mut SelectBuilder,
    table: &str,
    state: &SavedMetricState,
    args: &mut Args,
) {
    if state.block_number_infos.is_empty() {
        return;
    }

    let table_param = args.add(table);
    let parts = state
        .block_number_infos
        .iter()
        .map(|info| {
            format!(
                "(partition = {} AND max_block_number > {})",
                args.add(info.partition.as_str()),
                args.add(info.last_block_number)
            )
        })
        .collect::<Vec<_>>();
    sb.and_where(format!(
        "_part IN (SELECT name FROM system.parts WHERE table = {table_param} AND active AND {})",
        or(&parts)
    ));

    let blocks = state
        .block_number_infos
        .iter()
        .map(|info| {
            format!(
                "(_partition_id = {} AND _block_number > {})",
                args.add(info.partition.replace('-', "")),
                args.add(info.last_block_number)
            )
        })
        .collect::<Vec<_>>();
    sb.and_where(or(&blocks));
}

/// Inserts one aggregate-state row per bucket and group into the history table.
async fn save_metric_history(
    store: &dyn Store,
    ctx: &QueryContext,
    query: MetricsQuery,
    state: &SavedMetricState,
    request: &MetricsRequest,
) -> Result<()> {
    let MetricsQuery {
        builder,
        mut args,
        bucket_count,
        ..
    } = query;
    let aggregator = request
        .expressions
        .first()
        .map_or(MetricAggregator::Count, |expr| expr.aggregator);

    let mut columns = vec![
        "MetricId",
        "Timestamp",
        "MaxBlockNumberState",
        aggregator.state_column(),
    ];
    let metric_id = args.add(state.metric_id.as_str());
    let mut select = vec![
        metric_id,
        format!(
            "fromUnixTimestamp(toInt64({BUCKET_INDEX_ALIAS}*({MAX_ALIAS}-{MIN_ALIAS})/{bucket_count} + {MIN_ALIAS}))"
        ),
        MAX_BLOCK_NUMBER_ALIAS.to_string(),
        metric_value_alias(0),
    ];
    if !request.group_by.is_empty() {
        columns.push("GroupByKey");
        select.push(group_alias(0));
    }

    let sql = format!(
        "INSERT INTO {METRIC_HISTORY_TABLE} ({}) SELECT {} FROM ({}) AS innerSelect",
        columns.join(", "),
        select.join(", "),
        builder.build()
    );

    ctx.ensure_active()?;
    store.exec(ctx, &sql, args.params()).await?;
    debug!(metric_id = %state.metric_id, "saved metric history");
    Ok(())
}
