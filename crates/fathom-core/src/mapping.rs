//! Field mapping definitions
//!
//! A [`FieldMapping`] is the resolved field-name to field-kind table supplied
//! by the schema layer. Field kinds are a tagged-variant model: one sum type
//! over the supported kinds, each variant holding only its own options, with
//! a single [`FieldMapping::resolve`] function building the engine schema.
//!
//! A facet field in the mapping is what makes an index carry the secondary
//! taxonomy namespace.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tantivy::schema::{
    FacetOptions, Field, Schema, SchemaBuilder, INDEXED, STORED, STRING, TEXT,
};

/// Reserved name of the document identity field
pub const ID_FIELD: &str = "_id";

/// Field data type.
///
/// Determines how a field is indexed and queried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Analyzed full-text field
    Text {
        /// Store the original value for retrieval
        #[serde(default)]
        stored: bool,
    },
    /// Exact-match field; the whole value is a single term
    Keyword {
        /// Store the original value for retrieval
        #[serde(default)]
        stored: bool,
    },
    /// 64-bit unsigned integer
    Unsigned,
    /// 64-bit signed integer
    Integer,
    /// 64-bit floating point
    Float,
    /// Hierarchical facet path; requires the taxonomy namespace
    Facet,
}

impl FieldKind {
    /// Analyzed text field, value stored
    pub fn text() -> Self {
        FieldKind::Text { stored: true }
    }

    /// Exact-match keyword field, value stored
    pub fn keyword() -> Self {
        FieldKind::Keyword { stored: true }
    }

    /// Unsigned numeric field
    pub fn unsigned() -> Self {
        FieldKind::Unsigned
    }

    /// Signed numeric field
    pub fn integer() -> Self {
        FieldKind::Integer
    }

    /// Floating-point field
    pub fn float() -> Self {
        FieldKind::Float
    }

    /// Hierarchical facet field
    pub fn facet() -> Self {
        FieldKind::Facet
    }
}

/// Ordered field-name to kind table for one index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field definitions in declaration order
    pub fields: Vec<(String, FieldKind)>,
}

impl FieldMapping {
    /// Empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field definition
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push((name.into(), kind));
        self
    }

    /// True when any field requires the taxonomy namespace
    pub fn requires_taxonomy(&self) -> bool {
        self.fields
            .iter()
            .any(|(_, kind)| matches!(kind, FieldKind::Facet))
    }

    /// Build the engine schema for this mapping.
    ///
    /// The reserved `_id` field is always present; redefining it is a
    /// configuration error.
    pub fn resolve(&self) -> Result<ResolvedMapping> {
        let mut builder: SchemaBuilder = Schema::builder();
        let id_field = builder.add_text_field(ID_FIELD, STRING | STORED);

        let mut fields = HashMap::with_capacity(self.fields.len());
        for (name, kind) in &self.fields {
            if name == ID_FIELD {
                return Err(Error::configuration(format!(
                    "field name '{ID_FIELD}' is reserved"
                )));
            }
            if fields.contains_key(name.as_str()) {
                return Err(Error::configuration(format!(
                    "duplicate field definition: {name}"
                )));
            }
            let field = match kind {
                FieldKind::Text { stored: true } => builder.add_text_field(name, TEXT | STORED),
                FieldKind::Text { stored: false } => builder.add_text_field(name, TEXT),
                FieldKind::Keyword { stored: true } => {
                    builder.add_text_field(name, STRING | STORED)
                }
                FieldKind::Keyword { stored: false } => builder.add_text_field(name, STRING),
                FieldKind::Unsigned => builder.add_u64_field(name, INDEXED | STORED),
                FieldKind::Integer => builder.add_i64_field(name, INDEXED | STORED),
                FieldKind::Float => builder.add_f64_field(name, INDEXED | STORED),
                FieldKind::Facet => builder.add_facet_field(name, FacetOptions::default()),
            };
            fields.insert(name.clone(), (field, *kind));
        }

        Ok(ResolvedMapping {
            schema: builder.build(),
            id_field,
            fields,
            has_facets: self.requires_taxonomy(),
        })
    }
}

/// A mapping resolved against the engine schema
#[derive(Debug, Clone)]
pub struct ResolvedMapping {
    /// The engine schema built from the mapping
    pub schema: Schema,
    /// Reserved identity field
    pub id_field: Field,
    /// Engine field handle and kind per mapped name
    fields: HashMap<String, (Field, FieldKind)>,
    has_facets: bool,
}

impl ResolvedMapping {
    /// Look up a mapped field by name
    pub fn field(&self, name: &str) -> Option<(Field, FieldKind)> {
        self.fields.get(name).copied()
    }

    /// Engine fields of all analyzed text fields, for query parsing defaults
    pub fn text_fields(&self) -> Vec<Field> {
        self.fields
            .values()
            .filter(|(_, kind)| matches!(kind, FieldKind::Text { .. }))
            .map(|(field, _)| *field)
            .collect()
    }

    /// True when the mapping carries a facet field
    pub fn requires_taxonomy(&self) -> bool {
        self.has_facets
    }
}
