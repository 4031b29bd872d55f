//! Rewriting of user-authored SQL over logical resource tables into scoped SQL over the
//! physical tables.
//!
//! Nested queries are rewritten innermost first: the rewriter runs when the visitor
//! leaves a query, and column rewriting of an outer query does not descend into nested
//! queries, so no subtree is rewritten twice.

use super::{
    attributes::attribute_lookup, bucketing::SAMPLE_FACTOR_ALIAS, builder::Args, quote_literal,
};
use crate::{
    error::{Result, ServiceError},
    filter::{filters_to_sql, parse_with_default, SearchParser},
    models::{Resource, TableChoice, TableConfig, TIMESTAMP_COLUMN},
    time::DateRange,
};
use serde::Serialize;
use sqlparser::{
    ast::{
        visit_expressions, visit_relations, BinaryOperator, Expr, Function, FunctionArg,
        FunctionArgExpr, FunctionArguments, Ident, ObjectName, Query, Select, SelectItem, SetExpr,
        Statement, TableFactor, TableWithJoins, Value, Visit, VisitMut, Visitor, VisitorMut,
    },
    dialect::ClickHouseDialect,
    parser::{Parser, ParserError},
    tokenizer::{Token, Tokenizer},
};
use std::{collections::HashSet, ops::ControlFlow};
use tracing::debug;

const TIME_INTERVAL_MACRO: &str = "$time_interval";
const TIME_INTERVAL_FUNCTION: &str = "__time_interval";

/// Scoping inputs of a rewrite.
#[derive(Debug, Clone, Copy)]
pub struct RewriteRequest<'a> {
    pub project_ids: &'a [i64],
    pub date_range: DateRange,
    /// Search query AND-ed into the scoped WHERE clause.
    pub search: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rewritten {
    pub sql: String,
    /// Attribute fields the statement referenced.
    pub fields: Vec<String>,
    /// Resource tables the statement referenced.
    pub tables: Vec<String>,
}

/// Rewrites `sql` against the table `config`, read through `choice`.
pub fn rewrite_sql(
    sql: &str,
    config: &TableConfig,
    choice: TableChoice,
    request: RewriteRequest<'_>,
    search: &dyn SearchParser,
) -> Result<Rewritten> {
    let mut statement = parse_statement(sql)?;
    let Statement::Query(_) = &statement else {
        return Err(ServiceError::invalid("only SELECT statements are supported"));
    };

    if let ControlFlow::Break(()) = statement.visit(&mut SettingsGuard) {
        return Err(ServiceError::invalid(
            "SQL statement cannot include a settings clause",
        ));
    }

    let tables = resource_tables(&statement);
    let filter_sql = if tables.is_empty() {
        None
    } else {
        let filters = parse_with_default(search, request.search, config)?;
        filters_to_sql(&filters, config, &mut Args::inline())?
    };

    let mut rewriter = Rewriter {
        config,
        choice,
        request,
        filter_sql,
        fields: Vec::new(),
    };
    if let ControlFlow::Break(err) = VisitMut::visit(&mut statement, &mut rewriter) {
        return Err(err);
    }

    let mut seen = HashSet::new();
    let fields = rewriter
        .fields
        .into_iter()
        .filter(|field| seen.insert(field.clone()))
        .collect();
    let sql = statement.to_string();
    debug!(%sql, resource = config.resource.as_str(), "rewrote user sql");

    Ok(Rewritten {
        sql,
        fields,
        tables: tables.iter().map(|r| r.as_str().to_string()).collect(),
    })
}

/// Resource tables referenced anywhere in `sql`, in order of first appearance.
pub fn get_tables(sql: &str) -> Result<Vec<String>> {
    let statement = parse_statement(sql)?;
    Ok(resource_tables(&statement)
        .iter()
        .map(|resource| resource.as_str().to_string())
        .collect())
}

fn parse_statement(sql: &str) -> Result<Statement> {
    let sql = expand_macros(sql)?;
    let mut statements = Parser::parse_sql(&ClickHouseDialect {}, &sql)?;
    if statements.len() != 1 {
        return Err(ServiceError::invalid(format!(
            "expected 1 SQL statement, found {}",
            statements.len()
        )));
    }
    Ok(statements.remove(0))
}

/// Renames `$time_interval` macro tokens to a function name the parser accepts. String
/// literals and comments mentioning the macro are separate tokens and stay as written.
fn expand_macros(sql: &str) -> Result<String> {
    let tokens = Tokenizer::new(&ClickHouseDialect {}, sql)
        .with_unescape(false)
        .tokenize()
        .map_err(ParserError::from)?;
    Ok(tokens
        .iter()
        .map(|token| match token {
            Token::Placeholder(name) if name == TIME_INTERVAL_MACRO => {
                TIME_INTERVAL_FUNCTION.to_string()
            }
            other => other.to_string(),
        })
        .collect())
}

fn parse_expr(sql: &str) -> Result<Expr> {
    Ok(Parser::new(&ClickHouseDialect {})
        .try_with_sql(sql)?
        .parse_expr()?)
}

fn resource_tables(statement: &Statement) -> Vec<Resource> {
    let mut tables = Vec::new();
    let _ = visit_relations(statement, |name| {
        if let Some(resource) = table_resource(name) {
            if !tables.contains(&resource) {
                tables.push(resource);
            }
        }
        ControlFlow::<()>::Continue(())
    });
    tables
}

fn table_resource(name: &ObjectName) -> Option<Resource> {
    name.0
        .last()
        .and_then(|ident| Resource::from_table_name(&ident.value))
}

fn direct_resource(factor: &TableFactor) -> Option<Resource> {
    match factor {
        TableFactor::Table { name, .. } => table_resource(name),
        _ => None,
    }
}

struct SettingsGuard;

impl Visitor for SettingsGuard {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if query.settings.is_some() {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}

struct Rewriter<'a> {
    config: &'a TableConfig,
    choice: TableChoice,
    request: RewriteRequest<'a>,
    filter_sql: Option<String>,
    fields: Vec<String>,
}

impl VisitorMut for Rewriter<'_> {
    type Break = ServiceError;

    fn post_visit_query(&mut self, query: &mut Query) -> ControlFlow<ServiceError> {
        match self.rewrite_query(query) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }
}

impl<'a> Rewriter<'a> {
    fn rewrite_query(&mut self, query: &mut Query) -> Result<()> {
        let single_select = matches!(*query.body, SetExpr::Select(_));
        let aliases = self.rewrite_set_expr(&mut query.body)?;

        // ORDER BY and LIMIT BY of a plain SELECT refer to its columns
        if let (true, Some(aliases)) = (single_select, aliases) {
            let mut columns = self.column_rewriter(&aliases);
            visit_mut(&mut query.order_by, &mut columns)?;
            visit_mut(&mut query.limit_by, &mut columns)?;
            self.fields.append(&mut columns.fields);
        }
        Ok(())
    }

    /// Rewrites resource-table SELECTs in `body`, returning the SELECT's aliases when
    /// `body` is one.
    fn rewrite_set_expr(&mut self, body: &mut SetExpr) -> Result<Option<HashSet<String>>> {
        match body {
            SetExpr::Select(select) => self.rewrite_select(select),
            SetExpr::SetOperation { left, right, .. } => {
                self.rewrite_set_expr(left)?;
                self.rewrite_set_expr(right)?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn rewrite_select(&mut self, select: &mut Select) -> Result<Option<HashSet<String>>> {
        let Some(resource) = select_resource(&select.from)? else {
            return Ok(None);
        };
        if resource != self.config.resource {
            return Err(ServiceError::invalid(format!(
                "query reads {} but the request targets {}",
                resource.as_str(),
                self.config.resource.as_str()
            )));
        }

        let aliases = select_aliases(select);

        let from = std::mem::take(&mut select.from);
        let mut columns = self.column_rewriter(&aliases);
        let visited = visit_mut(select, &mut columns);
        select.from = from;
        visited?;
        self.fields.append(&mut columns.fields);

        if let Some(TableFactor::Table { name, .. }) =
            select.from.first_mut().map(|from| &mut from.relation)
        {
            *name = ObjectName(vec![Ident::new(self.choice.table_expr(self.config))]);
        }

        self.scope(select)?;
        Ok(Some(aliases))
    }

    fn column_rewriter<'b>(&self, aliases: &'b HashSet<String>) -> ColumnRewriter<'b>
    where
        'a: 'b,
    {
        ColumnRewriter {
            config: self.config,
            sampled: self.choice.is_sampled(),
            aliases,
            depth: 0,
            fields: Vec::new(),
        }
    }

    /// ANDs project, time and search scoping into the SELECT's WHERE clause.
    fn scope(&self, select: &mut Select) -> Result<()> {
        let project_id = match self.request.project_ids {
            [id] => *id,
            ids => {
                return Err(ServiceError::invalid(format!(
                    "SQL queries must use 1 project id, {} found",
                    ids.len()
                )))
            }
        };

        let existing = select.selection.take();
        let project_predicate = format!("{} = {project_id}", self.config.project_id_column);

        let mut parts = Vec::new();
        let already_scoped = existing.as_ref().is_some_and(|selection| {
            conjuncts(selection)
                .iter()
                .any(|conjunct| conjunct.to_string() == project_predicate)
        });
        if !already_scoped {
            parts.push(project_predicate);
        }
        if !existing.as_ref().is_some_and(references_timestamp) {
            let range = self.request.date_range;
            parts.push(format!(
                "{TIMESTAMP_COLUMN} >= toDateTime({}) AND {TIMESTAMP_COLUMN} <= toDateTime({})",
                range.start.timestamp(),
                range.end.timestamp()
            ));
        }

        let mut scope = if parts.is_empty() {
            None
        } else {
            Some(parse_expr(&parts.join(" AND "))?)
        };
        if let Some(filter) = &self.filter_sql {
            let filter = Expr::Nested(Box::new(parse_expr(filter)?));
            scope = Some(match scope {
                Some(scope) => and(scope, filter),
                None => filter,
            });
        }

        select.selection = match (existing, scope) {
            (Some(existing @ Expr::Nested(_)), Some(scope)) => Some(and(existing, scope)),
            (Some(existing), Some(scope)) => Some(and(Expr::Nested(Box::new(existing)), scope)),
            (existing, scope) => existing.or(scope),
        };
        Ok(())
    }
}

/// The resource a FROM clause reads directly, rejecting resource tables inside joins.
fn select_resource(from: &[TableWithJoins]) -> Result<Option<Resource>> {
    match from {
        [] => Ok(None),
        [single] if single.joins.is_empty() => Ok(direct_resource(&single.relation)),
        many => {
            for item in many {
                ensure_join_free(item)?;
            }
            Ok(None)
        }
    }
}

fn ensure_join_free(item: &TableWithJoins) -> Result<()> {
    let factors = std::iter::once(&item.relation)
        .chain(item.joins.iter().map(|join| &join.relation));
    for factor in factors {
        if direct_resource(factor).is_some() {
            return Err(ServiceError::invalid(
                "resource tables cannot be used in a JOIN expression",
            ));
        }
        if let TableFactor::NestedJoin {
            table_with_joins, ..
        } = factor
        {
            ensure_join_free(table_with_joins)?;
        }
    }
    Ok(())
}

fn select_aliases(select: &Select) -> HashSet<String> {
    select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
            _ => None,
        })
        .collect()
}

fn visit_mut<T: VisitMut, V: VisitorMut<Break = ServiceError>>(
    node: &mut T,
    visitor: &mut V,
) -> Result<()> {
    match VisitMut::visit(node, visitor) {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(err) => Err(err),
    }
}

fn and(left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOperator::And,
        right: Box::new(right),
    }
}

/// Top-level AND-ed terms of `expr`, looking through parentheses.
fn conjuncts(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut terms = conjuncts(left);
            terms.extend(conjuncts(right));
            terms
        }
        Expr::Nested(inner) => conjuncts(inner),
        other => vec![other],
    }
}

fn references_timestamp(expr: &Expr) -> bool {
    visit_expressions(expr, |node| match node {
        Expr::Identifier(ident) if ident.value == TIMESTAMP_COLUMN => ControlFlow::Break(()),
        _ => ControlFlow::Continue(()),
    })
    .is_break()
}

/// Rewrites identifiers and macro functions of one query level.
struct ColumnRewriter<'a> {
    config: &'a TableConfig,
    sampled: bool,
    aliases: &'a HashSet<String>,
    depth: usize,
    fields: Vec<String>,
}

impl VisitorMut for ColumnRewriter<'_> {
    type Break = ServiceError;

    fn pre_visit_query(&mut self, _query: &mut Query) -> ControlFlow<ServiceError> {
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &mut Query) -> ControlFlow<ServiceError> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<ServiceError> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        match self.rewrite_expr(expr) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }
}

impl ColumnRewriter<'_> {
    fn rewrite_expr(&mut self, expr: &mut Expr) -> Result<()> {
        let replacement = match &*expr {
            Expr::Identifier(ident) => self.replace_identifier(ident),
            Expr::Function(function) if is_function(function, TIME_INTERVAL_FUNCTION) => {
                Some(time_interval(function)?)
            }
            Expr::Function(function) if self.sampled && is_compensated(function) => {
                let factor = parse_expr(&format!("any({SAMPLE_FACTOR_ALIAS})"))?;
                Some(Expr::Nested(Box::new(Expr::BinaryOp {
                    left: Box::new(factor),
                    op: BinaryOperator::Multiply,
                    right: Box::new(expr.clone()),
                })))
            }
            _ => None,
        };
        if let Some(replacement) = replacement {
            *expr = replacement;
        }
        Ok(())
    }

    fn replace_identifier(&mut self, ident: &Ident) -> Option<Expr> {
        let name = ident.value.as_str();
        if name == "*"
            || name == SAMPLE_FACTOR_ALIAS
            || self.aliases.contains(name)
            || self
                .config
                .attributes_columns
                .iter()
                .any(|mapping| mapping.column == name)
        {
            return None;
        }
        if let Some(column) = self.config.column_for(name) {
            return Some(Expr::Identifier(Ident::new(column)));
        }

        let lookup = attribute_lookup(self.config, name, &quote_literal(name), None)?;
        self.fields.push(name.to_string());
        Some(Expr::Identifier(Ident::new(lookup)))
    }
}

fn is_function(function: &Function, name: &str) -> bool {
    matches!(function.name.0.as_slice(), [ident] if ident.value.eq_ignore_ascii_case(name))
}

/// Aggregates scaled by the sample factor on sampled tables.
fn is_compensated(function: &Function) -> bool {
    let name = function.name.to_string().to_lowercase();
    name.contains("sum") || name.contains("count")
}

/// `$time_interval('5 minutes')` as `toStartOfInterval(Timestamp, toIntervalMinute(5))`.
fn time_interval(function: &Function) -> Result<Expr> {
    let malformed =
        || ServiceError::invalid("$time_interval expects a single string literal argument");
    let FunctionArguments::List(list) = &function.args else {
        return Err(malformed());
    };
    let [FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Value(Value::SingleQuotedString(
        interval,
    ))))] = list.args.as_slice()
    else {
        return Err(malformed());
    };

    let (count, unit) = parse_interval(interval)?;
    parse_expr(&format!(
        "toStartOfInterval({TIMESTAMP_COLUMN}, toInterval{unit}({count}))"
    ))
}

fn parse_interval(interval: &str) -> Result<(u64, &'static str)> {
    let invalid = || ServiceError::invalid(format!("invalid $time_interval '{interval}'"));
    let mut parts = interval.split_whitespace();
    let (count, unit) = match (parts.next(), parts.next(), parts.next()) {
        (Some(unit), None, None) => (1, unit),
        (Some(count), Some(unit), None) => (count.parse().map_err(|_| invalid())?, unit),
        _ => return Err(invalid()),
    };
    if count == 0 {
        return Err(invalid());
    }

    let unit = match unit.to_ascii_lowercase().trim_end_matches('s') {
        "second" => "Second",
        "minute" => "Minute",
        "hour" => "Hour",
        "day" => "Day",
        "week" => "Week",
        "month" => "Month",
        "quarter" => "Quarter",
        "year" => "Year",
        _ => return Err(invalid()),
    };
    Ok((count, unit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::TableRegistry, parser::DefaultSearchParser};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn range() -> DateRange {
        DateRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn request(project_ids: &[i64]) -> RewriteRequest<'_> {
        RewriteRequest {
            project_ids,
            date_range: range(),
            search: "",
        }
    }

    fn rewrite(sql: &str, resource: Resource, choice: TableChoice) -> Result<Rewritten> {
        let registry = TableRegistry::default();
        let table = registry.get(resource).unwrap();
        rewrite_sql(
            sql,
            table.config_for(choice),
            choice,
            request(&[7]),
            &DefaultSearchParser,
        )
    }

    #[test]
    fn scopes_resource_queries() {
        let rewritten = rewrite(
            "SELECT count(*) FROM logs WHERE Severity = 'error'",
            Resource::Logs,
            TableChoice::Primary,
        )
        .unwrap();
        assert_eq!(
            rewritten.sql,
            "SELECT count(*) FROM logs WHERE (Severity = 'error') AND ProjectId = 7 \
             AND Timestamp >= toDateTime(1704067200) AND Timestamp <= toDateTime(1704153600)"
        );
        assert_eq!(rewritten.tables, vec!["logs".to_string()]);
    }

    #[test]
    fn maps_logical_fields_and_attributes() {
        let rewritten = rewrite(
            "SELECT level, customer AS u, count() FROM logs GROUP BY level, u ORDER BY u",
            Resource::Logs,
            TableChoice::Primary,
        )
        .unwrap();
        assert!(
            rewritten.sql.starts_with(
                "SELECT Severity, LogAttributes['customer'] AS u, count() FROM logs WHERE ProjectId = 7"
            ),
            "{}",
            rewritten.sql
        );
        assert!(rewritten.sql.ends_with("GROUP BY Severity, u ORDER BY u"), "{}", rewritten.sql);
        assert_eq!(rewritten.fields, vec!["customer".to_string()]);
    }

    #[test]
    fn expands_time_interval_macro() {
        let rewritten = rewrite(
            "SELECT $time_interval('5 minutes') AS t, count() FROM traces GROUP BY t",
            Resource::Traces,
            TableChoice::Primary,
        )
        .unwrap();
        assert!(
            rewritten
                .sql
                .contains("toStartOfInterval(Timestamp, toIntervalMinute(5)) AS t"),
            "{}",
            rewritten.sql
        );
        // traces carry a default filter
        assert!(
            rewritten.sql.contains("(NOT (SpanName = 'system.internal'))"),
            "{}",
            rewritten.sql
        );
    }

    #[test]
    fn macro_text_inside_literals_is_kept() {
        let rewritten = rewrite(
            "SELECT count() FROM logs WHERE Body = '$time_interval(''1 minute'')' -- $time_interval(",
            Resource::Logs,
            TableChoice::Primary,
        )
        .unwrap();
        assert!(
            rewritten
                .sql
                .contains("WHERE (Body = '$time_interval(''1 minute'')') AND ProjectId = 7"),
            "{}",
            rewritten.sql
        );
        assert!(!rewritten.sql.contains(TIME_INTERVAL_FUNCTION), "{}", rewritten.sql);
    }

    #[test]
    fn search_filters_are_parsed_into_the_where_clause() {
        let registry = TableRegistry::default();
        let logs = &registry.get(Resource::Logs).unwrap().primary;
        let rewritten = rewrite_sql(
            "SELECT count() FROM logs",
            logs,
            TableChoice::Primary,
            RewriteRequest {
                search: "customer=acme",
                ..request(&[7])
            },
            &DefaultSearchParser,
        )
        .unwrap();
        let filter = "toDateTime(1704153600) AND (LogAttributes['customer'] = 'acme')";
        assert!(rewritten.sql.ends_with(filter), "{}", rewritten.sql);
        let Statement::Query(query) = parse_statement(&rewritten.sql).unwrap() else {
            panic!("expected a query");
        };
        let SetExpr::Select(select) = query.body.as_ref() else {
            panic!("expected a select");
        };
        let selection = select.selection.as_ref().unwrap();
        let terms = conjuncts(selection);
        assert!(
            matches!(
                terms.last(),
                Some(Expr::BinaryOp {
                    op: BinaryOperator::Eq,
                    ..
                })
            ),
            "{terms:?}"
        );
    }

    #[test]
    fn sampled_reads_scale_counts() {
        let rewritten = rewrite(
            "SELECT count() FROM logs",
            Resource::Logs,
            TableChoice::Sampled(0.5),
        )
        .unwrap();
        assert!(
            rewritten
                .sql
                .starts_with("SELECT (any(_sample_factor) * count()) FROM logs_sampling SAMPLE 0.5"),
            "{}",
            rewritten.sql
        );
    }

    #[test]
    fn scoping_is_not_repeated() {
        let first = rewrite(
            "SELECT count(*) FROM logs WHERE Severity = 'error'",
            Resource::Logs,
            TableChoice::Primary,
        )
        .unwrap();
        let second = rewrite(&first.sql, Resource::Logs, TableChoice::Primary).unwrap();
        assert_eq!(second.sql.matches("ProjectId = 7").count(), 1, "{}", second.sql);
        assert_eq!(second.sql.matches("toDateTime(").count(), 2, "{}", second.sql);
    }

    #[test]
    fn nested_queries_are_rewritten_once() {
        let rewritten = rewrite(
            "SELECT level FROM (SELECT level FROM logs) WHERE level IN (SELECT level FROM logs)",
            Resource::Logs,
            TableChoice::Primary,
        )
        .unwrap();
        assert_eq!(rewritten.sql.matches("ProjectId = 7").count(), 2, "{}", rewritten.sql);
        assert!(!rewritten.sql.contains("LogAttributes"), "{}", rewritten.sql);
    }

    #[test]
    fn leaves_non_resource_queries_alone() {
        let rewritten = rewrite(
            "SELECT name FROM system.tables",
            Resource::Logs,
            TableChoice::Primary,
        )
        .unwrap();
        assert_eq!(rewritten.sql, "SELECT name FROM system.tables");
        assert!(rewritten.tables.is_empty());
    }

    #[test]
    fn rejects_unsafe_statements() {
        for sql in [
            "SELECT 1; SELECT 2",
            "SELECT count() FROM logs SETTINGS max_threads = 1",
            "SELECT * FROM logs JOIN traces ON logs.TraceId = traces.TraceId",
            "SELECT * FROM other JOIN logs ON other.id = logs.UUID",
            "SELECT count() FROM traces",
            "INSERT INTO logs (Body) VALUES ('x')",
            "SELECT $time_interval(Timestamp) FROM logs",
        ] {
            let err = rewrite(sql, Resource::Logs, TableChoice::Primary).unwrap_err();
            assert!(err.is_user_error(), "{sql}: {err}");
        }
    }

    #[test]
    fn raw_sql_requires_one_project() {
        let registry = TableRegistry::default();
        let logs = &registry.get(Resource::Logs).unwrap().primary;
        let err = rewrite_sql(
            "SELECT count() FROM logs",
            logs,
            TableChoice::Primary,
            request(&[1, 2]),
            &DefaultSearchParser,
        )
        .unwrap_err();
        assert!(err.to_string().contains("1 project id"), "{err}");
    }

    #[test]
    fn lists_resource_tables_once() {
        let tables = get_tables(
            "SELECT * FROM logs WHERE TraceId IN (SELECT TraceId FROM traces) \
             UNION ALL SELECT * FROM logs",
        )
        .unwrap();
        assert_eq!(tables, vec!["logs".to_string(), "traces".to_string()]);
    }

    #[test]
    fn parses_interval_units() {
        assert_eq!(parse_interval("1 hour").unwrap(), (1, "Hour"));
        assert_eq!(parse_interval("15 Minutes").unwrap(), (15, "Minute"));
        assert_eq!(parse_interval("day").unwrap(), (1, "Day"));
        assert!(parse_interval("0 days").is_err());
        assert!(parse_interval("1 fortnight").is_err());
    }
}
