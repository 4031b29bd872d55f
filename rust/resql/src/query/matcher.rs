//! In-memory re-evaluation of filter trees against rows that were already fetched.
//!
//! Rows are evaluated in their serialised JSON form, so field names are the physical
//! column names the row type serialises to.

use super::attributes::attributes_column;
use crate::{
    error::{Result, ServiceError},
    filter::{is_wildcard, Comparison, FilterNode, Filters, Operator},
    models::TableConfig,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

// ClickHouse token boundaries, keeping `:` and `*` inside tokens
static BODY_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w:*]").expect("body separator regex"));

static KEY_WRAPPER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"toString\((\w+)\)").expect("key wrapper regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parent {
    Top,
    And,
    Or,
    Not,
}

/// True when `row` satisfies every top-level filter.
pub fn matches(row: &Value, config: &TableConfig, filters: &Filters) -> bool {
    filters
        .iter()
        .all(|node| matches_node(row, config, node, Parent::Top))
}

/// Serialises `row` and evaluates `filters` against it. Rows that fail to serialise
/// are kept.
pub fn matches_object<T: Serialize>(row: &T, config: &TableConfig, filters: &Filters) -> bool {
    match serde_json::to_value(row) {
        Ok(value) => matches(&value, config, filters),
        Err(err) => {
            warn!(error = %err, "failed to serialise row for filter matching");
            true
        }
    }
}

fn matches_node(row: &Value, config: &TableConfig, node: &FilterNode, parent: Parent) -> bool {
    match node {
        FilterNode::And(children) => children
            .iter()
            .all(|child| matches_node(row, config, child, Parent::And)),
        FilterNode::Or(children) => children
            .iter()
            .any(|child| matches_node(row, config, child, Parent::Or)),
        FilterNode::Not(child) => !matches_node(row, config, child, Parent::Not),
        FilterNode::Compare(comparison) => match match_comparison(row, config, comparison) {
            Ok(matched) => matched,
            // unresolvable leaves only fail under OR
            Err(_) => parent != Parent::Or,
        },
    }
}

fn match_comparison(row: &Value, config: &TableConfig, comparison: &Comparison) -> Result<bool> {
    let key = KEY_WRAPPER
        .captures(&comparison.key)
        .and_then(|groups| groups.get(1))
        .map_or(comparison.key.as_str(), |group| group.as_str());

    let body_filter = config.is_body_key(key);
    if body_filter {
        let body = row.get(key).map(repr).unwrap_or_default();
        return match_body(&body, comparison);
    }

    let value = field_value(row, config, key)?;
    match_value(&value, comparison)
}

fn match_body(body: &str, comparison: &Comparison) -> Result<bool> {
    let terms: HashSet<&str> = BODY_SEPARATORS
        .split(body)
        .filter(|term| !term.is_empty())
        .collect();
    let negated = comparison.operator.is_negated();

    for value in comparison.values() {
        let matched = if comparison.operator.is_regex() {
            match Regex::new(value) {
                Ok(pattern) => pattern.is_match(body),
                Err(_) => continue,
            }
        } else if is_wildcard(value) {
            wildcard(value)?.is_match(body)
        } else {
            terms.contains(value.as_str())
        };
        if matched == negated {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_value(row_value: &str, comparison: &Comparison) -> Result<bool> {
    let negated = comparison.operator.is_negated();

    for value in comparison.values() {
        let matched = if comparison.operator.is_regex() {
            match Regex::new(value) {
                Ok(pattern) => pattern.is_match(row_value),
                Err(_) => continue,
            }
        } else if is_wildcard(value) {
            wildcard(value)?.is_match(row_value)
        } else if comparison.operator == Operator::NotEqual {
            row_value == value.strip_prefix('-').unwrap_or(value)
        } else {
            row_value == value
        };
        if matched == negated {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Escapes `value` and turns each `%` into a match of one or more characters.
fn wildcard(value: &str) -> Result<Regex> {
    let pattern = regex::escape(value).replace('%', ".+");
    Regex::new(&pattern)
        .map_err(|err| ServiceError::invalid(format!("invalid wildcard '{value}': {err}")))
}

/// Resolves a filter key to the row's string value: mapped column, direct field, dotted
/// path, then the attribute column.
fn field_value(row: &Value, config: &TableConfig, key: &str) -> Result<String> {
    if let Some(column) = config.column_for(key) {
        return Ok(child_value(row, column).unwrap_or_default());
    }
    if let Some(value) = row.get(key) {
        return Ok(repr(value));
    }
    if let Some(value) = child_value(row, key) {
        return Ok(value);
    }

    let column = attributes_column(config, "")
        .ok_or_else(|| ServiceError::invalid(format!("invalid filter {key}")))?;
    Ok(match row.get(column) {
        Some(Value::Object(map)) => map.get(key).map(repr).unwrap_or_default(),
        Some(Value::Array(entries)) => typed_entry_value(entries, key).unwrap_or_default(),
        _ => String::new(),
    })
}

/// Walks a dotted path through nested objects; `null` counts as absent.
fn child_value(row: &Value, path: &str) -> Option<String> {
    let mut current = row;
    for part in path.split('.') {
        current = current.get(part)?;
        if current.is_null() {
            return None;
        }
    }
    Some(repr(current))
}

/// Looks up a `type_name` key in a list of `{Type, Name, Value}` entries.
fn typed_entry_value(entries: &[Value], key: &str) -> Option<String> {
    let (field_type, name) = key.split_once('_')?;
    entries
        .iter()
        .find(|entry| {
            entry.get("Type").and_then(Value::as_str) == Some(field_type)
                && entry.get("Name").and_then(Value::as_str) == Some(name)
        })
        .and_then(|entry| entry.get("Value"))
        .map(repr)
}

fn repr(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Resource;
    use serde_json::json;

    fn logs() -> TableConfig {
        TableConfig::new(Resource::Logs, "logs")
            .physical_columns(&["Body", "Severity", "ServiceName"])
            .key("level", "Severity")
            .key("service.name", "Resource.Service")
            .attributes("", "LogAttributes")
            .body("Body")
    }

    fn row() -> Value {
        json!({
            "Body": "GET /api/users failed: connection reset by peer",
            "Severity": "error",
            "ServiceName": "api",
            "Resource": { "Service": "gateway", "Region": null },
            "Duration": 125,
            "LogAttributes": { "user": "bob", "code": "error_code" }
        })
    }

    fn leaf(key: &str, operator: Operator, value: &str) -> FilterNode {
        FilterNode::compare(key, operator, value).unwrap()
    }

    fn check(node: FilterNode) -> bool {
        matches(&row(), &logs(), &vec![node])
    }

    #[test]
    fn and_or_not_compose() {
        let a = leaf("level", Operator::Equal, "error");
        let b = leaf("user", Operator::Equal, "alice");
        assert!(check(a.clone()));
        assert!(!check(b.clone()));
        assert!(!check(FilterNode::And(vec![a.clone(), b.clone()])));
        assert!(check(FilterNode::Or(vec![a.clone(), b.clone()])));
        assert!(check(FilterNode::negate(b)));
        assert!(!check(FilterNode::negate(a)));
    }

    #[test]
    fn resolves_mapped_direct_dotted_and_attribute_fields() {
        assert!(check(leaf("service.name", Operator::Equal, "gateway")));
        assert!(check(leaf("ServiceName", Operator::Equal, "api")));
        assert!(check(leaf("Duration", Operator::Equal, "125")));
        assert!(check(leaf("Resource.Service", Operator::Equal, "gateway")));
        assert!(check(leaf("user", Operator::Equal, "bob")));
        assert!(check(leaf("toString(ServiceName)", Operator::Equal, "api")));
        assert!(check(leaf("missing", Operator::Equal, "")));
    }

    #[test]
    fn wildcards_need_characters_at_each_percent() {
        let config = logs();
        for (value, expected) in [("error", true), ("error_code", true), ("eror", false)] {
            let row = json!({ "Severity": value });
            let filters = vec![leaf("level", Operator::Equal, "er%or")];
            assert_eq!(matches(&row, &config, &filters), expected, "{value}");
        }
    }

    #[test]
    fn not_equal_strips_leading_dash() {
        assert!(!check(leaf("level", Operator::NotEqual, "-error")));
        assert!(check(leaf("level", Operator::NotEqual, "warn")));
    }

    #[test]
    fn body_terms_match_tokens_and_patterns() {
        assert!(check(leaf("Body", Operator::Equal, "reset")));
        assert!(check(leaf("Body", Operator::Equal, "failed:")));
        assert!(!check(leaf("Body", Operator::Equal, "rese")));
        assert!(check(leaf("Body", Operator::Equal, "connection%peer")));
        assert!(check(leaf("Body", Operator::Regex, "users? failed")));
        assert!(!check(leaf("Body", Operator::NotRegex, "users? failed")));
        assert!(check(leaf("Body", Operator::NotEqual, "timeout")));
    }

    #[test]
    fn invalid_regex_is_no_constraint() {
        assert!(check(leaf("level", Operator::Regex, "(unclosed")));
        assert!(check(leaf("Body", Operator::Regex, "(unclosed")));
    }

    #[test]
    fn unresolvable_fields_depend_on_parent() {
        let config = TableConfig::new(Resource::Metrics, "metrics");
        let row = json!({ "Value": 1.5 });
        let unknown = leaf("nope", Operator::Equal, "x");
        let never = leaf("Value", Operator::Equal, "2");

        assert!(matches(&row, &config, &vec![unknown.clone()]));
        assert!(!matches(&row, &config, &vec![FilterNode::negate(unknown.clone())]));
        assert!(!matches(
            &row,
            &config,
            &vec![FilterNode::Or(vec![unknown, never])]
        ));
    }

    #[test]
    fn typed_attribute_entries_split_on_underscore() {
        let mut config = TableConfig::new(Resource::Sessions, "sessions").attributes("", "Fields");
        config.attributes_table = true;
        let row = json!({
            "Fields": [
                { "Type": "session", "Name": "browser", "Value": "firefox" },
                { "Type": "user", "Name": "email", "Value": "a@b.c" }
            ]
        });
        let filters = vec![leaf("user_email", Operator::Equal, "a@b.c")];
        assert!(matches(&row, &config, &filters));
    }
}
