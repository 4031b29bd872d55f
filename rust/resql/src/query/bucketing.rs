//! Bucket sizing, bucket-index expressions, aggregate forms and interpolation of
//! missing buckets.

use super::{
    attributes::{attribute_lookup, resolve_insensitive, Resolved},
    builder::Args,
};
use crate::{
    config::EngineLimits,
    error::{Result, ServiceError},
    models::{
        BucketBy, MetricAggregator, MetricBucket, MetricExpression, MetricsBuckets, TableConfig,
        TIMESTAMP_COLUMN,
    },
    time::DateRange,
};
use chrono::Duration;
use std::collections::{BTreeMap, HashMap};

pub const BUCKET_INDEX_ALIAS: &str = "__bucket_index";
pub const MIN_ALIAS: &str = "__min";
pub const MAX_ALIAS: &str = "__max";
pub const SAMPLE_FACTOR_ALIAS: &str = "_sample_factor";
pub const MAX_BLOCK_NUMBER_ALIAS: &str = "max_block_number";
pub const LIMIT_METRIC_ALIAS: &str = "limit_metric";
pub const LIMIT_RANK_ALIAS: &str = "limit_rank";

pub fn metric_input_alias(idx: usize) -> String {
    format!("metric_input{idx}")
}

pub fn metric_value_alias(idx: usize) -> String {
    format!("metric_value{idx}")
}

pub fn group_alias(idx: usize) -> String {
    format!("g{idx}")
}

/// How a request asks for its buckets.
#[derive(Debug, Clone, Copy)]
pub struct BucketSpec<'a> {
    pub bucket_by: &'a BucketBy,
    pub bucket_count: Option<u64>,
    /// Fixed bucket width in seconds. Takes precedence over `bucket_count`.
    pub bucket_window: Option<u64>,
    pub no_bucket_max: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketingInfo {
    /// `__bucket_index`, `__min` and `__max` select items.
    pub select_items: Vec<String>,
    pub bucket_count: u64,
    /// The request range, with the start pulled forward when a window was capped.
    pub date_range: DateRange,
}

/// Number of buckets for `spec` over `range`, and the range they cover.
pub fn bucket_count(
    spec: BucketSpec<'_>,
    range: DateRange,
    limits: &EngineLimits,
) -> Result<(u64, DateRange)> {
    if *spec.bucket_by == BucketBy::None {
        return Ok((1, range));
    }
    let capped = |count: u64| !spec.no_bucket_max && count > limits.max_buckets;

    let Some(window) = spec.bucket_window else {
        let mut count = spec.bucket_count.unwrap_or(limits.default_bucket_count);
        if capped(count) {
            count = limits.max_buckets;
        }
        return Ok((count.max(1), range));
    };

    if window == 0 {
        return Err(ServiceError::invalid("bucket window must be positive"));
    }
    let duration = u64::try_from(range.duration_secs()).unwrap_or_default();
    let count = duration / window;
    if capped(count) {
        let span = i64::try_from(limits.max_buckets.saturating_mul(window)).unwrap_or(i64::MAX);
        let start = Duration::try_seconds(span)
            .and_then(|span| range.end.checked_sub_signed(span))
            .ok_or_else(|| ServiceError::invalid("bucket window is too large"))?;
        return Ok((limits.max_buckets, DateRange::new(start, range.end)?));
    }
    Ok((count.max(1), range))
}

/// Computes bucket sizing and the bucket-index select items.
pub fn bucketing(
    config: &TableConfig,
    spec: BucketSpec<'_>,
    range: DateRange,
    limits: &EngineLimits,
    args: &mut Args,
) -> Result<BucketingInfo> {
    let (count, range) = bucket_count(spec, range, limits)?;

    let expr = match spec.bucket_by {
        BucketBy::None | BucketBy::Timestamp => format!("toFloat64({TIMESTAMP_COLUMN})"),
        BucketBy::Field(field) => {
            match resolve_insensitive(config, field, Some("toFloat64OrNull"), args)? {
                Resolved::Column(column) => format!("toFloat64({column})"),
                Resolved::Attribute(lookup) => lookup,
            }
        }
    };

    let (min, max) = if spec.bucket_by.uses_static_bounds() {
        (
            format!("{}.0", range.start.timestamp()),
            format!("{}.0", range.end.timestamp()),
        )
    } else {
        (format!("MIN({expr}) OVER ()"), format!("MAX({expr}) OVER ()"))
    };
    let index = format!("toUInt64(intDiv(({expr} - {min}) * {count}, ({max} - {min})))");

    Ok(BucketingInfo {
        select_items: vec![
            format!("{index} AS {BUCKET_INDEX_ALIAS}"),
            format!("{min} AS {MIN_ALIAS}"),
            format!("{max} AS {MAX_ALIAS}"),
        ],
        bucket_count: count,
        date_range: range,
    })
}

/// Attribute lookup of `field` cast with `toFloat64OrNull`.
pub fn float_attribute(config: &TableConfig, field: &str, args: &mut Args) -> Result<String> {
    attribute_expr(config, field, Some("toFloat64OrNull"), args)
}

pub fn attribute_expr(
    config: &TableConfig,
    field: &str,
    transform: Option<&str>,
    args: &mut Args,
) -> Result<String> {
    let key = args.add(field);
    attribute_lookup(config, field, &key, transform).ok_or_else(|| {
        ServiceError::invalid(format!(
            "unknown field '{field}' for {}",
            config.resource.as_str()
        ))
    })
}

/// Final aggregate over a per-row metric input. Counts and sums are scaled by the
/// sample factor column.
pub fn final_fn(aggregator: MetricAggregator, column: &str) -> String {
    match aggregator {
        MetricAggregator::Count => format!("round(count() * any({SAMPLE_FACTOR_ALIAS}))"),
        MetricAggregator::CountDistinct | MetricAggregator::CountDistinctKey => {
            format!("round(count(distinct {column}) * 1.0)")
        }
        MetricAggregator::Min => format!("toFloat64(min({column}))"),
        MetricAggregator::Avg => format!("avg({column})"),
        MetricAggregator::Max => format!("toFloat64(max({column}))"),
        MetricAggregator::Sum => format!("sum({column}) * any({SAMPLE_FACTOR_ALIAS})"),
        quantile => format!("quantile({})({column})", quantile_level(quantile)),
    }
}

/// Mergeable aggregate state, as stored in the history table.
pub fn state_fn(aggregator: MetricAggregator, column: &str) -> String {
    match aggregator {
        MetricAggregator::Count => "countState()".to_string(),
        MetricAggregator::CountDistinct | MetricAggregator::CountDistinctKey => {
            format!("uniqState(toString({column}))")
        }
        MetricAggregator::Min => format!("minState(toFloat64({column}))"),
        MetricAggregator::Avg => format!("avgState(toFloat64({column}))"),
        MetricAggregator::Max => format!("maxState(toFloat64({column}))"),
        MetricAggregator::Sum => format!("sumState(toFloat64({column}))"),
        quantile => format!(
            "quantileState({})(toFloat64({column}))",
            quantile_level(quantile)
        ),
    }
}

/// Plain aggregate used to rank groups for top-N limiting.
pub fn limit_fn(aggregator: MetricAggregator, column: &str) -> String {
    match aggregator {
        MetricAggregator::Count => "count()".to_string(),
        MetricAggregator::CountDistinct | MetricAggregator::CountDistinctKey => {
            format!("count(distinct {column})")
        }
        MetricAggregator::Min => format!("min({column})"),
        MetricAggregator::Avg => format!("avg({column})"),
        MetricAggregator::Max => format!("max({column})"),
        MetricAggregator::Sum => format!("sum({column})"),
        quantile => format!("quantile({})({column})", quantile_level(quantile)),
    }
}

fn quantile_level(aggregator: MetricAggregator) -> &'static str {
    aggregator.quantile().unwrap_or(".5")
}

/// One decoded row of the aggregate query.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub bucket_id: u64,
    pub sample_factor: f64,
    pub min: f64,
    pub max: f64,
    pub values: Vec<Option<f64>>,
    pub group: Vec<String>,
}

/// Shape of the interpolated output.
#[derive(Debug, Clone, Copy)]
pub struct Interpolation<'a> {
    pub expressions: &'a [MetricExpression],
    pub group_width: usize,
    pub bucket_count: u64,
    /// Bounds used when the query returned no rows.
    pub empty_bounds: Option<(f64, f64)>,
}

/// Expands aggregate rows into a contiguous `0..bucket_count` range per group.
///
/// Output is ordered by bucket, then by group in first-seen order, then by expression.
/// Buckets with no row carry no value.
pub fn interpolate(rows: Vec<AggregateRow>, shape: Interpolation<'_>) -> MetricsBuckets {
    let mut bounds = shape.empty_bounds.filter(|_| rows.is_empty()).unwrap_or((0.0, 0.0));
    let mut sample_factor = 0.0;
    let mut groups: Vec<(Vec<String>, BTreeMap<u64, Vec<Option<f64>>>)> = Vec::new();
    let mut group_index: HashMap<Vec<String>, usize> = HashMap::new();

    for row in rows {
        bounds = (row.min, row.max);
        sample_factor = row.sample_factor;
        // rows past the bucket count belong to a stale cap
        if row.bucket_id >= shape.bucket_count {
            continue;
        }
        let idx = *group_index.entry(row.group.clone()).or_insert_with(|| {
            groups.push((row.group, BTreeMap::new()));
            groups.len() - 1
        });
        groups[idx].1.insert(row.bucket_id, row.values);
    }
    if groups.is_empty() {
        groups.push((vec![String::new(); shape.group_width], BTreeMap::new()));
    }

    let (min, max) = bounds;
    let width = (max - min) / shape.bucket_count.max(1) as f64;
    let mut buckets = Vec::new();
    for bucket_id in 0..shape.bucket_count {
        for (group, values) in &groups {
            let row = values.get(&bucket_id);
            for (idx, expression) in shape.expressions.iter().enumerate() {
                buckets.push(MetricBucket {
                    bucket_id,
                    bucket_value: None,
                    bucket_min: Some(bucket_id as f64 * width + min),
                    bucket_max: Some((bucket_id + 1) as f64 * width + min),
                    group: group.clone(),
                    metric_type: expression.aggregator.as_str().to_string(),
                    column: expression.column.clone(),
                    metric_value: row.and_then(|values| values.get(idx).copied().flatten()),
                });
            }
        }
    }

    MetricsBuckets {
        buckets,
        sample_factor,
        bucket_count: shape.bucket_count,
    }
}
