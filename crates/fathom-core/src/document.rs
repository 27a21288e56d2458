//! Document model
//!
//! Documents are flat id + field-value records. Values are validated against
//! the index field mapping when translated into engine documents; facet
//! values additionally surface their paths so the taxonomy namespace can
//! register the labels.

use crate::mapping::{FieldKind, ResolvedMapping};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tantivy::TantivyDocument;

/// A single field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Text or keyword value
    Str(String),
    /// Unsigned numeric value
    U64(u64),
    /// Signed numeric value
    I64(i64),
    /// Floating-point value
    F64(f64),
}

/// A document to index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable document identity; add with an existing id replaces the
    /// previous version
    pub id: String,
    /// Field values in declaration order
    pub values: Vec<(String, FieldValue)>,
}

impl Document {
    /// New empty document with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: Vec::new(),
        }
    }

    /// Add a text, keyword, or facet-path value
    pub fn text(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.push((field.into(), FieldValue::Str(value.into())));
        self
    }

    /// Add an unsigned numeric value
    pub fn unsigned(mut self, field: impl Into<String>, value: u64) -> Self {
        self.values.push((field.into(), FieldValue::U64(value)));
        self
    }

    /// Add a signed numeric value
    pub fn integer(mut self, field: impl Into<String>, value: i64) -> Self {
        self.values.push((field.into(), FieldValue::I64(value)));
        self
    }

    /// Add a floating-point value
    pub fn float(mut self, field: impl Into<String>, value: f64) -> Self {
        self.values.push((field.into(), FieldValue::F64(value)));
        self
    }

    /// Translate into an engine document.
    ///
    /// Returns the engine document plus any facet paths it carries, so the
    /// caller can register the labels in the taxonomy namespace.
    pub fn to_engine(&self, mapping: &ResolvedMapping) -> Result<(TantivyDocument, Vec<String>)> {
        if self.id.is_empty() {
            return Err(Error::configuration("document id must not be empty"));
        }

        let mut doc = TantivyDocument::new();
        doc.add_text(mapping.id_field, &self.id);

        let mut facet_paths = Vec::new();
        for (name, value) in &self.values {
            let (field, kind) = mapping.field(name).ok_or_else(|| {
                Error::configuration(format!("unknown field in document: {name}"))
            })?;
            match (kind, value) {
                (FieldKind::Text { .. } | FieldKind::Keyword { .. }, FieldValue::Str(s)) => {
                    doc.add_text(field, s);
                }
                (FieldKind::Facet, FieldValue::Str(path)) => {
                    doc.add_facet(field, path.as_str());
                    facet_paths.push(path.clone());
                }
                (FieldKind::Unsigned, FieldValue::U64(v)) => doc.add_u64(field, *v),
                (FieldKind::Integer, FieldValue::I64(v)) => doc.add_i64(field, *v),
                (FieldKind::Float, FieldValue::F64(v)) => doc.add_f64(field, *v),
                (kind, value) => {
                    return Err(Error::configuration(format!(
                        "field '{name}' expects {kind:?}, got {value:?}"
                    )));
                }
            }
        }

        Ok((doc, facet_paths))
    }
}
