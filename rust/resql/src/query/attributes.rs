//! Field name to column or attribute-lookup resolution.

use super::builder::Args;
use crate::{
    error::{Result, ServiceError},
    models::TableConfig,
};

/// A resolved field: either a first-class column or an attribute bag lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Column(String),
    Attribute(String),
}

impl Resolved {
    pub fn expr(&self) -> &str {
        match self {
            Resolved::Column(expr) | Resolved::Attribute(expr) => expr,
        }
    }

    pub fn into_expr(self) -> String {
        match self {
            Resolved::Column(expr) | Resolved::Attribute(expr) => expr,
        }
    }
}

/// Attribute column holding `key`: the first non-empty prefix match, then the
/// catch-all mapping, then the first mapping.
pub fn attributes_column<'a>(config: &'a TableConfig, key: &str) -> Option<&'a str> {
    let columns = &config.attributes_columns;
    columns
        .iter()
        .find(|mapping| !mapping.prefix.is_empty() && key.starts_with(&mapping.prefix))
        .or_else(|| columns.iter().find(|mapping| mapping.prefix.is_empty()))
        .or_else(|| columns.first())
        .map(|mapping| mapping.column.as_str())
}

/// Lookup of `key` in the attribute bag, with `key_expr` as the already rendered key
/// (placeholder or literal) and an optional transform applied to the value.
pub fn attribute_lookup(
    config: &TableConfig,
    key: &str,
    key_expr: &str,
    transform: Option<&str>,
) -> Option<String> {
    let column = attributes_column(config, key)?;
    if config.attributes_table {
        let value = transform.map_or_else(|| "v".to_string(), |func| format!("{func}(v)"));
        return Some(format!(
            "(arrayMap((k, v) -> {value}, arrayFilter((k, v) -> k = {key_expr}, {column})))[1]"
        ));
    }
    let lookup = format!("{column}[{key_expr}]");
    Some(match transform {
        Some(func) => format!("{func}({lookup})"),
        None => lookup,
    })
}

/// Resolves a field exactly as named.
pub fn resolve(
    config: &TableConfig,
    field: &str,
    transform: Option<&str>,
    args: &mut Args,
) -> Result<Resolved> {
    if let Some(column) = config.column_for(field) {
        return Ok(Resolved::Column(column.to_string()));
    }
    lookup_or_err(config, field, transform, args)
}

/// Resolves a field, falling back to a lower-cased match against known fields.
pub fn resolve_insensitive(
    config: &TableConfig,
    field: &str,
    transform: Option<&str>,
    args: &mut Args,
) -> Result<Resolved> {
    if let Some(column) = known_column(config, field) {
        return Ok(Resolved::Column(column.to_string()));
    }
    lookup_or_err(config, field, transform, args)
}

/// Known column for `field`, retrying with the lower-cased name.
pub fn known_column<'a>(config: &'a TableConfig, field: &str) -> Option<&'a str> {
    config
        .column_for(field)
        .or_else(|| config.column_for(&field.to_lowercase()))
}

fn lookup_or_err(
    config: &TableConfig,
    field: &str,
    transform: Option<&str>,
    args: &mut Args,
) -> Result<Resolved> {
    if attributes_column(config, field).is_none() {
        return Err(ServiceError::invalid(format!(
            "unknown field '{field}' for {}",
            config.resource.as_str()
        )));
    }
    let key_expr = args.add(field);
    attribute_lookup(config, field, &key_expr, transform)
        .map(Resolved::Attribute)
        .ok_or_else(|| ServiceError::invalid(format!("unknown field '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Resource, TableConfig};

    fn logs() -> TableConfig {
        TableConfig::new(Resource::Logs, "logs")
            .physical_columns(&["Timestamp", "Body"])
            .key("message", "Body")
            .attributes("resource.", "ResourceAttributes")
            .attributes("", "LogAttributes")
    }

    #[test]
    fn known_fields_resolve_to_columns() {
        let mut args = Args::new();
        let resolved = resolve(&logs(), "message", Some("toString"), &mut args).unwrap();
        assert_eq!(resolved, Resolved::Column("Body".into()));
        assert!(args.params().is_empty());
    }

    #[test]
    fn unknown_fields_become_parameterized_map_lookups() {
        let mut args = Args::new();
        let resolved = resolve(&logs(), "user_id", Some("toFloat64OrNull"), &mut args).unwrap();
        assert_eq!(
            resolved.expr(),
            "toFloat64OrNull(LogAttributes[{p0:String}])"
        );
        assert_eq!(args.params().len(), 1);
    }

    #[test]
    fn prefixed_keys_pick_their_attribute_column() {
        let mut args = Args::inline();
        let resolved = resolve(&logs(), "resource.host", None, &mut args).unwrap();
        assert_eq!(resolved.expr(), "ResourceAttributes['resource.host']");
    }

    #[test]
    fn attribute_tables_filter_key_value_arrays() {
        let mut config = TableConfig::new(Resource::Sessions, "sessions").attributes("", "Fields");
        config.attributes_table = true;
        let mut args = Args::inline();
        let resolved = resolve(&config, "browser", Some("toString"), &mut args).unwrap();
        assert_eq!(
            resolved.expr(),
            "(arrayMap((k, v) -> toString(v), arrayFilter((k, v) -> k = 'browser', Fields)))[1]"
        );
    }

    #[test]
    fn insensitive_resolution_lowercases_before_attribute_fallback() {
        let mut args = Args::new();
        let resolved = resolve_insensitive(&logs(), "MESSAGE", None, &mut args).unwrap();
        assert_eq!(resolved, Resolved::Column("Body".to_string()));
    }

    #[test]
    fn tables_without_attributes_reject_unknown_fields() {
        let config = TableConfig::new(Resource::Metrics, "metrics").physical_columns(&["Value"]);
        let err = resolve(&config, "nope", None, &mut Args::new()).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }
}
