//! The local index a segment engine drives.
//!
//! A shard supports upsert and delete by unique id, flush and commit,
//! point-in-time readers over flushed (realtime) or committed state, and
//! ranked or sorted search with facet counting. [`memory`] provides the
//! in-process implementation.

pub mod memory;
mod searcher;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::NumericValue;
use crate::error::Result;
use crate::query::QueryWithFilters;
use crate::request::{CountRequest, Facet};
use crate::response::{ScoredResult, SortValue};

pub use memory::{MemoryShardFactory, MemoryShardIndex};

/// Field representations derived from one stored document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub unique_id: String,
    pub timestamp: i64,
    /// Indexed field to analyzed terms, in position order.
    pub terms: BTreeMap<String, Vec<String>>,
    /// Indexed field to typed values.
    pub numbers: BTreeMap<String, Vec<NumericValue>>,
    /// Sort field to key. Absent fields sort as [`SortValue::Missing`].
    pub sort_values: BTreeMap<String, SortValue>,
    pub facets: Vec<Facet>,
}

/// A resolved sort field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub field: String,
    /// Descending.
    pub reverse: bool,
}

/// Parameters of one top-K search.
#[derive(Debug)]
pub struct SearchSpec<'a> {
    pub query: &'a QueryWithFilters,
    pub top_n: usize,
    /// Only hits ranked strictly after this one are collected.
    pub after: Option<&'a ScoredResult>,
    /// Empty ranks by relevance.
    pub sort: &'a [SortField],
    pub count_requests: &'a [CountRequest],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreDoc {
    pub doc_id: u32,
    pub score: f32,
    pub unique_id: String,
    pub timestamp: i64,
    pub sort_values: Vec<SortValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopDocs {
    /// Every match, including those ranked before `after`.
    pub total_hits: u64,
    pub score_docs: Vec<ScoreDoc>,
    /// Children counts per count request, by descending count then label.
    pub facet_counts: Vec<Vec<(String, u64)>>,
}

/// A point-in-time view of a shard.
pub trait ShardReader: Send + Sync {
    fn num_docs(&self) -> u64;

    fn field_names(&self) -> BTreeSet<String>;

    /// Terms of `field` from the first term >= `start`, ascending, with doc frequency.
    fn terms(&self, field: &str, start: &str) -> Vec<(String, u64)>;

    fn search(&self, spec: &SearchSpec<'_>) -> Result<TopDocs>;
}

/// The write side of a shard.
pub trait ShardIndex: Send + Sync + std::fmt::Debug {
    /// False once closed, whether by this process or a background one.
    fn is_open(&self) -> bool;

    /// Replaces any document with the same unique id.
    fn update_document(&self, document: IndexedDocument) -> Result<()>;

    fn delete_document(&self, unique_id: &str) -> Result<()>;

    fn delete_all(&self) -> Result<()>;

    /// Makes pending changes visible to realtime readers.
    fn flush(&self, apply_deletes: bool) -> Result<()>;

    /// Makes pending changes durable and visible to all readers.
    fn commit(&self) -> Result<()>;

    fn force_merge(&self, max_segments: usize) -> Result<()>;

    fn reader(&self, real_time: bool) -> Result<Arc<dyn ShardReader>>;

    fn close(&self) -> Result<()>;
}

/// Opens shards by index name and segment number.
pub trait ShardIndexFactory: Send + Sync + std::fmt::Debug {
    fn open(&self, index_name: &str, segment_number: u32) -> Result<Arc<dyn ShardIndex>>;

    /// Removes every shard of the index, including stored state.
    fn delete_index(&self, index_name: &str) -> Result<()>;
}
