//! `_all_docs` lookups by explicit key list.
//!
//! Each key becomes its own point query against the listing engine. The
//! queries run concurrently and the rows come back in key order, with a
//! `not_found` row for every key the engine does not know.

use futures_util::future::try_join_all;
use serde::Serialize;
use serde_json::Value;

use crate::storage::StoreError;

/// Options of a keys query.
#[derive(Debug, Clone, Default)]
pub struct AllDocsOptions {
    pub keys: Vec<String>,
    /// Reported back as `offset`; keys queries do not page.
    pub skip: usize,
    pub include_docs: bool,
    pub update_seq: bool,
}

/// A single-key request sent to the listing engine.
///
/// Deleted documents are always included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointQuery {
    pub key: String,
    pub include_docs: bool,
    pub update_seq: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowValue {
    pub rev: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AllDocsRow {
    Found {
        id: String,
        key: String,
        value: RowValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        doc: Option<Value>,
    },
    Missing {
        key: String,
        error: String,
    },
}

impl AllDocsRow {
    pub fn not_found(key: impl Into<String>) -> Self {
        AllDocsRow::Missing {
            key: key.into(),
            error: "not_found".into(),
        }
    }
}

/// What the listing engine returns for one point query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointResult {
    pub rows: Vec<AllDocsRow>,
    pub total_rows: u64,
    pub update_seq: Option<u64>,
}

/// Listing engine able to answer single-key queries.
#[allow(async_fn_in_trait)]
pub trait AllDocsSource {
    async fn point_query(&self, query: &PointQuery) -> Result<PointResult, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllDocsResponse {
    pub total_rows: u64,
    pub offset: usize,
    pub rows: Vec<AllDocsRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_seq: Option<u64>,
}

/// Answer a keys query with one concurrent point query per key.
pub async fn all_docs_keys<S: AllDocsSource>(
    source: &S,
    opts: &AllDocsOptions,
) -> Result<AllDocsResponse, StoreError> {
    let queries: Vec<PointQuery> = opts
        .keys
        .iter()
        .map(|key| PointQuery {
            key: key.clone(),
            include_docs: opts.include_docs,
            update_seq: opts.update_seq,
        })
        .collect();

    let answers = try_join_all(queries.iter().map(|q| source.point_query(q))).await?;

    let mut response = AllDocsResponse {
        total_rows: 0,
        offset: opts.skip,
        rows: Vec::with_capacity(answers.len()),
        update_seq: None,
    };
    for (query, answer) in queries.iter().zip(answers) {
        response.total_rows = answer.total_rows;
        if opts.update_seq && answer.update_seq.is_some() {
            response.update_seq = answer.update_seq;
        }
        let row = answer
            .rows
            .into_iter()
            .next()
            .unwrap_or_else(|| AllDocsRow::not_found(query.key.clone()));
        response.rows.push(row);
    }
    Ok(response)
}
