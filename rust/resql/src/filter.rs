//! Boolean filter trees produced by search-query parsing, and their SQL form.

use crate::{
    error::{Result, ServiceError},
    models::TableConfig,
    query::{
        attributes,
        builder::{Args, SelectBuilder},
    },
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl Operator {
    pub fn is_negated(&self) -> bool {
        matches!(self, Operator::NotEqual | Operator::NotRegex)
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, Operator::Regex | Operator::NotRegex)
    }
}

/// Leaf comparison. Values containing `%` are wildcard patterns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub key: String,
    pub operator: Operator,
    values: Vec<String>,
}

impl Comparison {
    pub fn new(key: impl Into<String>, operator: Operator, values: Vec<String>) -> Result<Self> {
        let key = key.into();
        if values.is_empty() {
            return Err(ServiceError::invalid(format!(
                "filter on '{key}' requires at least one value"
            )));
        }
        Ok(Self {
            key,
            operator,
            values,
        })
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Compare(Comparison),
}

impl FilterNode {
    pub fn compare(key: &str, operator: Operator, value: &str) -> Result<Self> {
        Comparison::new(key, operator, vec![value.to_string()]).map(FilterNode::Compare)
    }

    pub fn negate(node: FilterNode) -> Self {
        FilterNode::Not(Box::new(node))
    }
}

/// Top-level filters; multiple entries are AND-ed.
pub type Filters = Vec<FilterNode>;

/// Turns free-form search text into a filter tree.
pub trait SearchParser: Send + Sync {
    fn parse(&self, query: &str, config: &TableConfig) -> Result<Filters>;
}

pub fn is_wildcard(value: &str) -> bool {
    value.contains('%')
}

/// Parses the table's default filter together with `query`, adds the equivalent SQL
/// predicate to `sb`, and returns the tree for in-memory re-evaluation.
pub fn assign_search_filters(
    parser: &dyn SearchParser,
    sb: &mut SelectBuilder,
    query: &str,
    config: &TableConfig,
    args: &mut Args,
) -> Result<Filters> {
    let filters = parse_with_default(parser, query, config)?;
    if let Some(predicate) = filters_to_sql(&filters, config, args)? {
        sb.and_where(predicate);
    }
    Ok(filters)
}

pub fn parse_with_default(
    parser: &dyn SearchParser,
    query: &str,
    config: &TableConfig,
) -> Result<Filters> {
    let combined = match config.default_filter.as_deref() {
        Some(default) if !default.trim().is_empty() => {
            if query.trim().is_empty() {
                default.to_string()
            } else {
                format!("{default} ({query})")
            }
        }
        _ => query.to_string(),
    };
    parser.parse(&combined, config)
}

pub fn filters_to_sql(
    filters: &Filters,
    config: &TableConfig,
    args: &mut Args,
) -> Result<Option<String>> {
    match filters.as_slice() {
        [] => Ok(None),
        [single] => node_to_sql(single, config, args).map(Some),
        many => {
            let parts = many
                .iter()
                .map(|node| node_to_sql(node, config, args))
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(format!("({})", parts.join(" AND "))))
        }
    }
}

fn node_to_sql(node: &FilterNode, config: &TableConfig, args: &mut Args) -> Result<String> {
    match node {
        FilterNode::And(children) => join_children(children, " AND ", config, args),
        FilterNode::Or(children) => join_children(children, " OR ", config, args),
        FilterNode::Not(child) => Ok(format!("NOT ({})", node_to_sql(child, config, args)?)),
        FilterNode::Compare(comparison) => comparison_to_sql(comparison, config, args),
    }
}

fn join_children(
    children: &[FilterNode],
    separator: &str,
    config: &TableConfig,
    args: &mut Args,
) -> Result<String> {
    if children.is_empty() {
        return Ok("1".to_string());
    }
    let parts = children
        .iter()
        .map(|child| node_to_sql(child, config, args))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", parts.join(separator)))
}

fn comparison_to_sql(
    comparison: &Comparison,
    config: &TableConfig,
    args: &mut Args,
) -> Result<String> {
    let body = config.is_body_key(&comparison.key);
    let column = attributes::resolve(config, &comparison.key, None, args)?.into_expr();

    let predicates = comparison
        .values()
        .iter()
        .map(|value| {
            let positive = if comparison.operator.is_regex() {
                format!("match({column}, {})", args.add(value.as_str()))
            } else if is_wildcard(value) {
                format!("{column} ILIKE {}", args.add(value.as_str()))
            } else if body && is_token(value) {
                format!("hasTokenCaseInsensitive({column}, {})", args.add(value.as_str()))
            } else if body {
                format!("positionCaseInsensitive({column}, {}) > 0", args.add(value.as_str()))
            } else {
                format!("{column} = {}", args.add(value.as_str()))
            };
            if comparison.operator.is_negated() {
                format!("NOT ({positive})")
            } else {
                positive
            }
        })
        .collect::<Vec<_>>();

    Ok(match predicates.as_slice() {
        [single] => single.clone(),
        _ => format!("({})", predicates.join(" AND ")),
    })
}

fn is_token(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_alphanumeric() || ch == '_')
}
