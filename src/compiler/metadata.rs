//! Metadata Properties
//!
//! `df.ctx['service']`-style expressions reference cluster metadata that is
//! not stored in the table itself. Each property declares which parent
//! ("key") columns it can be derived from and the conversion UDF that does
//! the derivation. The reserved `_attr_` prefix marks derived columns.

use crate::ir::{ExpressionKind, IrGraph, NodeId};
use crate::types::DataType;
use std::collections::HashMap;

/// Column-name prefix reserved for metadata-derived columns.
pub const METADATA_COLUMN_PREFIX: &str = "_attr_";

/// A single metadata property (`service`, `pod`, ...).
#[derive(Debug, Clone)]
pub struct MetadataProperty {
    pub name: String,
    pub column_type: DataType,
    /// Parent columns the property can be converted from, in preference
    /// order.
    pub key_columns: Vec<String>,
}

impl MetadataProperty {
    /// The materialized column name, e.g. `_attr_service`.
    pub fn column_repr(&self) -> String {
        format!("{}{}", METADATA_COLUMN_PREFIX, self.name)
    }

    /// Name of the conversion UDF keyed off the given parent column.
    pub fn udf_name(&self, key_column: &str) -> String {
        format!("{}_to_{}_name", key_column, self.name)
    }

    /// Whether a literal expression is shaped correctly for comparisons
    /// against this property.
    pub fn expr_fits_format(&self, graph: &IrGraph, expr: NodeId) -> bool {
        match graph.expression(expr).map(|e| &e.kind) {
            Ok(ExpressionKind::Str(s)) => !s.is_empty() && !s.contains(char::is_whitespace),
            _ => false,
        }
    }

    pub fn explain_format(&self) -> String {
        format!("a non-empty string naming a {}", self.name)
    }
}

/// The set of metadata properties the compiler understands.
#[derive(Debug, Clone)]
pub struct MetadataHandler {
    properties: HashMap<String, MetadataProperty>,
}

impl MetadataHandler {
    pub fn new() -> Self {
        MetadataHandler { properties: HashMap::new() }
    }

    /// The standard properties derived from the 128-bit process id.
    pub fn with_builtin_properties() -> Self {
        let mut handler = MetadataHandler::new();
        for name in ["service", "pod"] {
            handler.add_property(MetadataProperty {
                name: name.to_string(),
                column_type: DataType::String,
                key_columns: vec!["upid".to_string()],
            });
        }
        handler
    }

    pub fn add_property(&mut self, property: MetadataProperty) {
        self.properties.insert(property.name.clone(), property);
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn property(&self, name: &str) -> Option<&MetadataProperty> {
        self.properties.get(name)
    }
}

impl Default for MetadataHandler {
    fn default() -> Self {
        Self::with_builtin_properties()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_repr_uses_reserved_prefix() {
        let handler = MetadataHandler::with_builtin_properties();
        let prop = handler.property("service").unwrap();
        assert_eq!(prop.column_repr(), "_attr_service");
        assert_eq!(prop.udf_name("upid"), "upid_to_service_name");
    }

    #[test]
    fn test_expr_format_check() {
        let handler = MetadataHandler::with_builtin_properties();
        let prop = handler.property("service").unwrap();

        let mut g = IrGraph::new();
        let good = g.create_string("checkout");
        let spacey = g.create_string("not a service");
        let wrong_type = g.create_int(3);

        assert!(prop.expr_fits_format(&g, good));
        assert!(!prop.expr_fits_format(&g, spacey));
        assert!(!prop.expr_fits_format(&g, wrong_type));
    }

    #[test]
    fn test_unknown_property() {
        let handler = MetadataHandler::with_builtin_properties();
        assert!(!handler.has_property("container"));
        assert!(handler.has_property("pod"));
    }
}
