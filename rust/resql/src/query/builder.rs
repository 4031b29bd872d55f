//! String-level SELECT construction with typed ClickHouse parameters, plus the scoped
//! keyset-paginated base query shared by listings and metrics.

use super::{attributes, BindParam};
use crate::{
    error::{Result, ServiceError},
    filter::{assign_search_filters, Filters, SearchParser},
    models::{QueryInput, SortDirection, TableConfig, ID_COLUMN, TIMESTAMP_COLUMN},
    pagination::{Cursor, PageCursor, Pagination},
    time::DateRange,
};

/// Collects bind parameters and hands out their placeholders.
///
/// Parameters are named `p0..pN` in insertion order and rendered as `{pN:Type}`. An
/// inline collector renders escaped literals instead, for SQL that is executed without
/// bind support.
#[derive(Debug, Default)]
pub struct Args {
    params: Vec<BindParam>,
    inline: bool,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inline() -> Self {
        Self {
            params: Vec::new(),
            inline: true,
        }
    }

    pub fn add(&mut self, value: impl Into<BindParam>) -> String {
        let value = value.into();
        if self.inline {
            return value.to_literal();
        }
        let placeholder = format!("{{p{}:{}}}", self.params.len(), value.clickhouse_type());
        self.params.push(value);
        placeholder
    }

    pub fn params(&self) -> &[BindParam] {
        &self.params
    }

    pub fn into_params(self) -> Vec<BindParam> {
        self.params
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectBuilder {
    distinct: bool,
    columns: Vec<String>,
    from: String,
    wheres: Vec<String>,
    group_by: Vec<String>,
    order_by: Vec<String>,
    limit: Option<u64>,
}

impl SelectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<I, S>(&mut self, columns: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn select_more(&mut self, column: impl Into<String>) -> &mut Self {
        self.columns.push(column.into());
        self
    }

    pub fn distinct(&mut self) -> &mut Self {
        self.distinct = true;
        self
    }

    pub fn from(&mut self, table: impl Into<String>) -> &mut Self {
        self.from = table.into();
        self
    }

    pub fn and_where(&mut self, predicate: impl Into<String>) -> &mut Self {
        self.wheres.push(predicate.into());
        self
    }

    pub fn group_by<I, S>(&mut self, columns: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn order_by(&mut self, order: impl Into<String>) -> &mut Self {
        self.order_by.push(order.into());
        self
    }

    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn clear_order_by(&mut self) -> &mut Self {
        self.order_by.clear();
        self
    }

    pub fn wheres(&self) -> &[String] {
        &self.wheres
    }

    pub fn build(&self) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        if self.columns.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&self.columns.join(", "));
        }
        if !self.from.is_empty() {
            sql.push_str(" FROM ");
            sql.push_str(&self.from);
        }
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.wheres.join(" AND "));
        }
        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }
}

pub fn union_all(queries: &[String]) -> String {
    queries
        .iter()
        .map(|query| format!("({query})"))
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

pub fn or(predicates: &[String]) -> String {
    format!("({})", predicates.join(" OR "))
}

/// `col = x` for one project, `col IN x` for several.
pub fn project_scope(config: &TableConfig, project_ids: &[i64], args: &mut Args) -> String {
    let column = &config.project_id_column;
    match project_ids {
        [single] => format!("{column} = {}", args.add(*single)),
        many => format!("{column} IN {}", args.add(many.to_vec())),
    }
}

/// ORDER BY clauses for the forward and backward direction of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrders {
    pub forward: String,
    pub backward: String,
}

pub fn sort_orders(
    pagination_direction: SortDirection,
    config: &TableConfig,
    params: &QueryInput,
    args: &mut Args,
) -> SortOrders {
    let (sort_column, sort_direction) = match &params.sort {
        Some(sort) => (sort.column.as_str(), sort.direction),
        None => ("timestamp", SortDirection::Desc),
    };

    let column = match config.column_for(sort_column) {
        Some(column) => column.to_string(),
        None => attributes::attribute_lookup(config, sort_column, &args.add(sort_column), None)
            .unwrap_or_else(|| sort_column.to_string()),
    };

    let forward = if pagination_direction == SortDirection::Asc
        || sort_direction == SortDirection::Asc
    {
        SortDirection::Asc
    } else {
        SortDirection::Desc
    };
    let backward = forward.reverse();

    SortOrders {
        forward: format!(
            "{column} {dir}, {ID_COLUMN} {dir}",
            dir = forward.as_sql()
        ),
        backward: format!(
            "{column} {dir}, {ID_COLUMN} {dir}",
            dir = backward.as_sql()
        ),
    }
}

/// A scoped, windowed and filtered base query.
#[derive(Debug)]
pub struct BaseQuery {
    pub builder: SelectBuilder,
    pub filters: Filters,
    pub orders: SortOrders,
}

/// Inputs of the scoped base query.
#[derive(Debug, Clone, Copy)]
pub struct BaseRequest<'a> {
    pub config: &'a TableConfig,
    pub table_expr: &'a str,
    pub select_columns: &'a [String],
    pub project_ids: &'a [i64],
    pub params: &'a QueryInput,
    pub pagination: &'a Pagination,
}

/// Builds the project/time scoped SELECT with keyset windowing and search predicates.
pub fn make_select_builder(
    request: BaseRequest<'_>,
    search: &dyn SearchParser,
    args: &mut Args,
) -> Result<BaseQuery> {
    let BaseRequest {
        config,
        table_expr,
        select_columns,
        project_ids,
        params,
        pagination,
    } = request;
    if project_ids.is_empty() {
        return Err(ServiceError::invalid("at least one project id is required"));
    }
    let range = params.require_date_range()?;
    let cursor = pagination.cursor();
    let decoded = cursor.decode()?;

    let mut sb = SelectBuilder::new();
    sb.select(select_columns.iter().cloned()).from(table_expr);
    sb.and_where(project_scope(config, project_ids, args));

    let orders = sort_orders(pagination.direction, config, params, args);

    match (&cursor, decoded) {
        (PageCursor::After(_), Some(cursor)) => {
            let toward = keyset_toward(pagination.direction, true);
            apply_keyset(&mut sb, &range, toward, &cursor, args);
            sb.order_by(orders.forward.clone());
        }
        (PageCursor::Before(_), Some(cursor)) => {
            let toward = keyset_toward(pagination.direction, false);
            apply_keyset(&mut sb, &range, toward, &cursor, args);
            sb.order_by(orders.backward.clone());
        }
        (PageCursor::At(_), Some(cursor)) => {
            sb.and_where(format!(
                "{TIMESTAMP_COLUMN} = {}",
                args.add(cursor.timestamp)
            ));
            sb.and_where(format!(
                "{ID_COLUMN} = {}",
                args.add(BindParam::Uuid(cursor.id))
            ));
        }
        _ => {
            sb.and_where(format!(
                "{TIMESTAMP_COLUMN} >= {}",
                args.add(range.start)
            ));
            sb.and_where(format!("{TIMESTAMP_COLUMN} <= {}", args.add(range.end)));
            if !pagination.count_only {
                sb.order_by(orders.forward.clone());
            }
        }
    }

    let filters = assign_search_filters(search, &mut sb, &params.query, config, args)?;

    Ok(BaseQuery {
        builder: sb,
        filters,
        orders,
    })
}

/// Comparison direction of a keyset window: `Greater` scans towards newer rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Toward {
    Greater,
    Less,
}

fn keyset_toward(direction: SortDirection, after: bool) -> Toward {
    match (after, direction) {
        (true, SortDirection::Asc) | (false, SortDirection::Desc) => Toward::Greater,
        (true, SortDirection::Desc) | (false, SortDirection::Asc) => Toward::Less,
    }
}

fn apply_keyset(
    sb: &mut SelectBuilder,
    range: &DateRange,
    toward: Toward,
    cursor: &Cursor,
    args: &mut Args,
) {
    let ts = args.add(cursor.timestamp);
    let id = args.add(BindParam::Uuid(cursor.id.clone()));
    let (op, bound) = match toward {
        Toward::Greater => ((">=", "<=", ">"), range.end),
        Toward::Less => (("<=", ">=", "<"), range.start),
    };
    let (from_cursor, to_bound, strict) = op;
    sb.and_where(format!("{TIMESTAMP_COLUMN} {from_cursor} {ts}"));
    sb.and_where(format!("{TIMESTAMP_COLUMN} {to_bound} {}", args.add(bound)));
    sb.and_where(or(&[
        format!("{TIMESTAMP_COLUMN} {strict} {ts}"),
        format!("{ID_COLUMN} {strict} {id}"),
    ]));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{Resource, SortInput, TableRegistry},
        pagination::encode_cursor,
        parser::DefaultSearchParser,
    };
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    const CURSOR_ID: &str = "7f1c2b5e-8f6a-4d8c-9a54-0c7c3e1f9b10";

    fn logs() -> TableConfig {
        TableRegistry::default()
            .get(Resource::Logs)
            .unwrap()
            .primary
            .clone()
    }

    fn input(query: &str) -> QueryInput {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        QueryInput::new(query, DateRange::new(start, end).unwrap())
    }

    fn build(
        config: &TableConfig,
        project_ids: &[i64],
        params: &QueryInput,
        pagination: &Pagination,
    ) -> Result<(String, Vec<BindParam>)> {
        let columns = vec!["Timestamp".to_string(), "UUID".to_string()];
        let mut args = Args::new();
        let base = make_select_builder(
            BaseRequest {
                config,
                table_expr: &config.table_name,
                select_columns: &columns,
                project_ids,
                params,
                pagination,
            },
            &DefaultSearchParser,
            &mut args,
        )?;
        Ok((base.builder.build(), args.into_params()))
    }

    #[test]
    fn first_page_scopes_project_and_window() {
        let (sql, params) = build(&logs(), &[1], &input(""), &Pagination::default()).unwrap();
        assert_eq!(
            sql,
            "SELECT Timestamp, UUID FROM logs WHERE ProjectId = {p0:Int64} \
             AND Timestamp >= {p1:DateTime64(9)} AND Timestamp <= {p2:DateTime64(9)} \
             ORDER BY Timestamp DESC, UUID DESC"
        );
        assert_eq!(params.len(), 3);
        assert_eq!(params[0], BindParam::Int(1));
    }

    #[test]
    fn several_projects_use_membership() {
        let mut args = Args::new();
        let scope = project_scope(&logs(), &[1, 2], &mut args);
        assert_eq!(scope, "ProjectId IN {p0:Array(Int64)}");
        assert_eq!(args.params(), &[BindParam::IntArray(vec![1, 2])]);
    }

    #[test]
    fn after_cursor_walks_towards_older_rows() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let pagination = Pagination {
            after: Some(encode_cursor(ts, CURSOR_ID)),
            ..Pagination::default()
        };
        let (sql, params) = build(&logs(), &[1], &input(""), &pagination).unwrap();
        assert!(sql.contains("Timestamp <= {p1:DateTime64(9)}"), "{sql}");
        assert!(sql.contains("Timestamp >= {p3:DateTime64(9)}"), "{sql}");
        assert!(
            sql.contains("(Timestamp < {p1:DateTime64(9)} OR UUID < {p2:UUID})"),
            "{sql}"
        );
        assert!(sql.ends_with("ORDER BY Timestamp DESC, UUID DESC"), "{sql}");
        assert_eq!(params[1], BindParam::DateTime(ts));
        assert_eq!(params[2], BindParam::Uuid(CURSOR_ID.to_string()));
    }

    #[test]
    fn before_cursor_reverses_the_order() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let pagination = Pagination {
            before: Some(encode_cursor(ts, CURSOR_ID)),
            ..Pagination::default()
        };
        let (sql, _) = build(&logs(), &[1], &input(""), &pagination).unwrap();
        assert!(sql.contains("Timestamp >= {p1:DateTime64(9)}"), "{sql}");
        assert!(
            sql.contains("(Timestamp > {p1:DateTime64(9)} OR UUID > {p2:UUID})"),
            "{sql}"
        );
        assert!(sql.ends_with("ORDER BY Timestamp ASC, UUID ASC"), "{sql}");
    }

    #[test]
    fn at_cursor_pins_a_single_row() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let pagination = Pagination {
            at: Some(encode_cursor(ts, CURSOR_ID)),
            ..Pagination::default()
        };
        let (sql, _) = build(&logs(), &[1], &input(""), &pagination).unwrap();
        assert!(
            sql.ends_with("Timestamp = {p1:DateTime64(9)} AND UUID = {p2:UUID}"),
            "{sql}"
        );
    }

    #[test]
    fn attribute_sort_reads_the_bag() {
        let mut args = Args::new();
        let mut params = input("");
        params.sort = Some(SortInput {
            column: "http.method".to_string(),
            direction: SortDirection::Asc,
        });
        let orders = sort_orders(SortDirection::Desc, &logs(), &params, &mut args);
        assert_eq!(
            orders,
            SortOrders {
                forward: "LogAttributes[{p0:String}] ASC, UUID ASC".to_string(),
                backward: "LogAttributes[{p0:String}] DESC, UUID DESC".to_string(),
            }
        );
    }

    #[test]
    fn counts_skip_ordering() {
        let (sql, _) = build(&logs(), &[1], &input(""), &Pagination::count_only()).unwrap();
        assert!(!sql.contains("ORDER BY"), "{sql}");
    }

    #[test]
    fn rejects_missing_projects_and_cursors() {
        let err = build(&logs(), &[], &input(""), &Pagination::default()).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));

        let pagination = Pagination {
            after: Some("not-a-cursor".to_string()),
            ..Pagination::default()
        };
        let err = build(&logs(), &[1], &input(""), &pagination).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[test]
    fn union_wraps_each_query() {
        let sql = union_all(&["SELECT 1".to_string(), "SELECT 2".to_string()]);
        assert_eq!(sql, "(SELECT 1) UNION ALL (SELECT 2)");
    }
}
