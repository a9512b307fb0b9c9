//! Attribute schema definitions, before and after resolution.
use serde::{Deserialize, Serialize};

use crate::{SchemaId, SymbolId, DEFAULT_APP_FOR_DATA_MODEL};

/// Value type carried by an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// UTF-8 text.
    Text,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Opaque bytes.
    Bytes,
    /// Reference to another cell.
    CellRef,
}

/// A named, typed attribute of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrSpec {
    /// Attribute name, unique within its schema.
    pub name: String,
    /// Value type.
    pub value_type: ValueType,
    /// Symbol for `name`, assigned during resolution.
    #[serde(default)]
    pub attr_id: SymbolId,
}

impl AttrSpec {
    /// Unresolved attribute with the given name and type.
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            attr_id: SymbolId::NIL,
        }
    }
}

/// Attribute schema definition.
///
/// Before registration only the descriptive fields are meaningful. After
/// `resolve_and_register` the symbol fields and `schema_id` are populated and
/// every inherited attribute is materialized in `attrs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrSchema {
    /// Assigned on registration.
    #[serde(default)]
    pub schema_id: SchemaId,
    /// Human readable schema name.
    #[serde(default)]
    pub schema_name: String,
    /// Data model this schema describes, e.g. `planet/doc`.
    pub data_model_uri: String,
    /// Explicit app binding. Empty (or the default sentinel) means route by data model.
    #[serde(default)]
    pub app_uri: String,
    /// Ordered attributes.
    #[serde(default)]
    pub attrs: Vec<AttrSpec>,
    /// Data model URIs of schemas this one inherits from.
    #[serde(default)]
    pub inherits_from: Vec<String>,
    /// Symbol for `data_model_uri`, assigned during resolution.
    #[serde(default)]
    pub data_model_id: SymbolId,
}

impl AttrSchema {
    /// New unresolved schema for a data model.
    pub fn new(data_model_uri: impl Into<String>) -> Self {
        Self {
            schema_id: SchemaId::NIL,
            schema_name: String::new(),
            data_model_uri: data_model_uri.into(),
            app_uri: String::new(),
            attrs: Vec::new(),
            inherits_from: Vec::new(),
            data_model_id: SymbolId::NIL,
        }
    }

    /// Builder: set the schema name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.schema_name = name.into();
        self
    }

    /// Builder: add an attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.attrs.push(AttrSpec::new(name, value_type));
        self
    }

    /// Builder: inherit from the schema registered for `data_model_uri`.
    pub fn inherits(mut self, data_model_uri: impl Into<String>) -> Self {
        self.inherits_from.push(data_model_uri.into());
        self
    }

    /// Builder: bind to an explicit app.
    pub fn for_app(mut self, app_uri: impl Into<String>) -> Self {
        self.app_uri = app_uri.into();
        self
    }

    /// Explicit app URI, if one is set and is not the default sentinel.
    pub fn explicit_app_uri(&self) -> Option<&str> {
        match self.app_uri.as_str() {
            "" | DEFAULT_APP_FOR_DATA_MODEL => None,
            uri => Some(uri),
        }
    }

    /// Find an attribute by name.
    pub fn attr(&self, name: &str) -> Option<&AttrSpec> {
        self.attrs.iter().find(|a| a.name == name)
    }

    /// True once the registry has assigned an ID.
    pub fn is_resolved(&self) -> bool {
        !self.schema_id.is_nil()
    }
}

/// A batch of schema definitions resolved and registered as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defs {
    /// Definitions, resolved in place on success.
    pub schemas: Vec<AttrSchema>,
}

impl Defs {
    /// Wrap a list of definitions.
    pub fn new(schemas: Vec<AttrSchema>) -> Self {
        Self { schemas }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sentinel_is_not_explicit() {
        let s = AttrSchema::new("planet/doc").for_app(DEFAULT_APP_FOR_DATA_MODEL);
        assert_eq!(s.explicit_app_uri(), None);
        let s = AttrSchema::new("planet/doc").for_app("acme/docs/v1.0.0");
        assert_eq!(s.explicit_app_uri(), Some("acme/docs/v1.0.0"));
    }

    #[test]
    fn defs_parse_with_defaults() {
        let json = r#"{"schemas":[{"data_model_uri":"planet/doc","attrs":[{"name":"title","value_type":"text"}]}]}"#;
        let defs: Defs = serde_json::from_str(json).unwrap();
        let s = &defs.schemas[0];
        assert!(!s.is_resolved());
        assert_eq!(s.attr("title").unwrap().value_type, ValueType::Text);
        assert!(s.inherits_from.is_empty());
    }
}
