//! Query model
//!
//! One sum type over the supported query kinds with a single resolution
//! function dispatching on the tag into engine query objects. The full
//! query DSL lives in the service layer; this model carries what the index
//! core itself needs to serve.

use crate::mapping::{FieldKind, ResolvedMapping};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tantivy::query::{AllQuery, PhraseQuery, Query, QueryParser, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::{Index, Term};

/// One search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Document id, when the document carries one
    pub id: Option<String>,
    /// Relevance score
    pub score: f32,
}

/// Result page of a search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    /// Total number of matching documents
    pub total_hits: usize,
    /// Top hits, best first
    pub hits: Vec<SearchHit>,
}

/// A search query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchQuery {
    /// Matches every document
    All,
    /// Single-term match on a keyword or analyzed field
    Term {
        /// Field to match against
        field: String,
        /// Term value; analyzed fields expect an already-normalized token
        value: String,
    },
    /// Exact phrase on an analyzed field
    Phrase {
        /// Field to match against
        field: String,
        /// Phrase terms, at least two
        terms: Vec<String>,
    },
    /// Free-form query string parsed against the analyzed text fields
    QueryString {
        /// The query expression
        query: String,
    },
}

impl SearchQuery {
    /// Query-string shorthand
    pub fn parse(query: impl Into<String>) -> Self {
        SearchQuery::QueryString {
            query: query.into(),
        }
    }

    /// Term shorthand
    pub fn term(field: impl Into<String>, value: impl Into<String>) -> Self {
        SearchQuery::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Resolve into an engine query
    pub fn resolve(&self, mapping: &ResolvedMapping, index: &Index) -> Result<Box<dyn Query>> {
        match self {
            SearchQuery::All => Ok(Box::new(AllQuery)),

            SearchQuery::Term { field, value } => {
                let (engine_field, kind) = mapping
                    .field(field)
                    .ok_or_else(|| Error::query(format!("unknown field: {field}")))?;
                match kind {
                    FieldKind::Text { .. } | FieldKind::Keyword { .. } => Ok(Box::new(
                        TermQuery::new(
                            Term::from_field_text(engine_field, value),
                            IndexRecordOption::Basic,
                        ),
                    )),
                    other => Err(Error::query(format!(
                        "term query unsupported on {other:?} field '{field}'"
                    ))),
                }
            }

            SearchQuery::Phrase { field, terms } => {
                if terms.len() < 2 {
                    return Err(Error::query("phrase query requires at least two terms"));
                }
                let (engine_field, kind) = mapping
                    .field(field)
                    .ok_or_else(|| Error::query(format!("unknown field: {field}")))?;
                if !matches!(kind, FieldKind::Text { .. }) {
                    return Err(Error::query(format!(
                        "phrase query requires an analyzed field, '{field}' is {kind:?}"
                    )));
                }
                let terms = terms
                    .iter()
                    .map(|t| Term::from_field_text(engine_field, t))
                    .collect::<Vec<_>>();
                Ok(Box::new(PhraseQuery::new(terms)))
            }

            SearchQuery::QueryString { query } => {
                let default_fields = mapping.text_fields();
                if default_fields.is_empty() {
                    return Err(Error::query(
                        "query string requires at least one analyzed text field",
                    ));
                }
                let parser = QueryParser::for_index(index, default_fields);
                parser
                    .parse_query(query)
                    .map_err(|e| Error::query(e.to_string()))
            }
        }
    }
}
