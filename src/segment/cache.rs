//! Per-segment LRU cache of query results.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;
use crate::request::{FacetRequest, FieldSort, Operator, QueryRequest};
use crate::response::{ScoredResult, ShardResult};

/// Identifies a segment query by everything that shapes its result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryCacheKey(String);

#[derive(Serialize)]
struct KeyParts<'a> {
    query: &'a str,
    query_fields: &'a [String],
    filter_queries: &'a [String],
    minimum_should_match: u32,
    default_operator: Operator,
    field_sorts: &'a [FieldSort],
    facet_request: &'a FacetRequest,
    amount: usize,
    after: Option<&'a ScoredResult>,
}

impl QueryCacheKey {
    pub fn new(
        request: &QueryRequest,
        segment_amount: usize,
        after: Option<&ScoredResult>,
    ) -> Result<Self> {
        let parts = KeyParts {
            query: &request.query,
            query_fields: &request.query_fields,
            filter_queries: &request.filter_queries,
            minimum_should_match: request.minimum_should_match,
            default_operator: request.default_operator,
            field_sorts: &request.field_sorts,
            facet_request: &request.facet_request,
            amount: segment_amount,
            after,
        };
        Ok(Self(serde_json::to_string(&parts)?))
    }
}

pub struct QueryResultCache {
    entries: Mutex<LruCache<QueryCacheKey, ShardResult>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryResultCache {
    /// `None` when `capacity` is zero.
    pub fn new(capacity: usize) -> Option<Self> {
        NonZeroUsize::new(capacity).map(|capacity| Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn get(&self, key: &QueryCacheKey) -> Option<ShardResult> {
        let found = self.entries.lock().get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn put(&self, key: QueryCacheKey, result: ShardResult) {
        self.entries.lock().put(key, result);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for QueryResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (hits, misses) = self.stats();
        f.debug_struct("QueryResultCache")
            .field("len", &self.len())
            .field("hits", &hits)
            .field("misses", &misses)
            .finish()
    }
}
