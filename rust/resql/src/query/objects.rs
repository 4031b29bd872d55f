//! Paged object listings over logs and traces.

use super::{
    builder::{
        make_select_builder, project_scope, union_all, Args, BaseQuery, BaseRequest,
        SelectBuilder,
    },
    decode::decode_rows,
    matcher, Backend,
};
use crate::{
    db::QueryContext,
    error::Result,
    models::{QueryInput, SampleableTableConfig, TableConfig, ID_COLUMN, TIMESTAMP_COLUMN},
    pagination::{Connection, Keyset, PageCursor, Pagination},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectsRequest {
    pub project_id: i64,
    #[serde(default)]
    pub params: QueryInput,
    #[serde(default)]
    pub pagination: Pagination,
}

/// Non-timestamp sorts read their (Timestamp, UUID) window from the sampled companion.
fn inner_table<'a>(table: &'a SampleableTableConfig, params: &QueryInput) -> Option<&'a TableConfig> {
    let custom_sort = params
        .sort
        .as_ref()
        .is_some_and(|sort| !sort.column.eq_ignore_ascii_case("timestamp"));
    table.sampling.as_ref().filter(|_| custom_sort)
}

/// Reads one page of typed rows.
///
/// The inner query resolves the window of `(Timestamp, UUID)` keys with one extra row
/// per open side, and the outer query fetches the full rows for those keys in display
/// order.
pub(super) async fn read_objects<T>(
    backend: Backend<'_>,
    ctx: &QueryContext,
    table: &SampleableTableConfig,
    request: &ObjectsRequest,
) -> Result<Connection<T>>
where
    T: DeserializeOwned + Serialize + Keyset,
{
    let config = &table.primary;
    let limit = request
        .pagination
        .limit
        .unwrap_or(backend.limits.default_page_limit)
        .max(1);
    let sampled_inner = inner_table(table, &request.params);
    let inner_config = sampled_inner.unwrap_or(config);
    let key_columns = vec![TIMESTAMP_COLUMN.to_string(), ID_COLUMN.to_string()];
    let project_ids = [request.project_id];
    let cursor = request.pagination.cursor();

    let mut args = Args::new();
    let base = |pagination: &Pagination, args: &mut Args| -> Result<BaseQuery> {
        make_select_builder(
            BaseRequest {
                config: inner_config,
                table_expr: &inner_config.table_name,
                select_columns: &key_columns,
                project_ids: &project_ids,
                params: &request.params,
                pagination,
            },
            backend.search,
            args,
        )
    };

    let (inner_sql, orders, filters, outer_limit) = match &cursor {
        PageCursor::At(raw) => {
            let window = limit.div_ceil(2) as u64 + 1;
            let around = |after: Option<&str>, before: Option<&str>, at: Option<&str>| Pagination {
                after: after.map(str::to_string),
                before: before.map(str::to_string),
                at: at.map(str::to_string),
                direction: request.pagination.direction,
                limit: None,
                count_only: false,
            };

            let mut before = base(&around(None, Some(raw.as_str()), None), &mut args)?;
            before.builder.distinct().limit(window);
            let mut at = base(&around(None, None, Some(raw.as_str())), &mut args)?;
            at.builder.distinct();
            let mut after = base(&around(Some(raw.as_str()), None, None), &mut args)?;
            after.builder.distinct().limit(window);

            let sql = union_all(&[
                before.builder.build(),
                at.builder.build(),
                after.builder.build(),
            ]);
            (sql, at.orders, at.filters, None)
        }
        _ => {
            let mut page = base(&request.pagination, &mut args)?;
            page.builder.distinct().limit(limit as u64 + 1);
            (
                page.builder.build(),
                page.orders,
                page.filters,
                Some(limit as u64 + 1),
            )
        }
    };

    let mut outer = SelectBuilder::new();
    outer
        .select(config.select_columns.iter().cloned())
        .distinct()
        .from(config.table_name.as_str())
        .and_where(project_scope(config, &project_ids, &mut args))
        .and_where(format!(
            "({TIMESTAMP_COLUMN}, {ID_COLUMN}) IN ({inner_sql})"
        ))
        .order_by(orders.forward);
    if let Some(outer_limit) = outer_limit {
        outer.limit(outer_limit);
    }

    let ctx = ctx.for_table(&inner_config.table_name);
    let rows = backend
        .store
        .query(&ctx, &outer.build(), args.params())
        .instrument(info_span!(
            "clickhouse.read_objects",
            db.namespace = %inner_config.table_name,
            sampled = sampled_inner.is_some(),
        ))
        .await?;

    let mut objects: Vec<T> = decode_rows(&rows)?;
    if sampled_inner.is_some() {
        let fetched = objects.len();
        objects.retain(|row| matcher::matches_object(row, config, &filters));
        debug!(fetched, kept = objects.len(), "re-validated sampled window");
    }

    Ok(Connection::from_rows(objects, &cursor, limit))
}
