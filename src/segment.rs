//! One shard of one index, owned by exactly one member at a time.
//!
//! A [`SegmentEngine`] turns stored documents into indexed ones, applies
//! the commit and flush policy of its index, caches query results, and
//! answers the per-segment half of queries, term enumeration and counts.

pub mod cache;
pub mod document;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use regex::Regex;

use crate::analysis::PerFieldAnalyzer;
use crate::config::IndexConfig;
use crate::data::Document;
use crate::error::{ClusterError, Result};
use crate::query::QueryWithFilters;
use crate::request::{CountRequest, Direction, FieldSort, GetTermsRequest};
use crate::response::{
    FacetCount, FacetGroup, ScoredResult, SegmentCountResponse, ShardResult, Term,
};
use crate::shard::{SearchSpec, ShardIndex, ShardIndexFactory, SortField};

pub use cache::{QueryCacheKey, QueryResultCache};
pub use document::{TIMESTAMP_FIELD, build_indexed_document};

#[derive(Debug, Default)]
struct CommitClock {
    last_change: Option<Instant>,
    last_commit: Option<Instant>,
}

/// Parameters of one segment query.
#[derive(Debug)]
pub struct SegmentQuery<'a> {
    pub query: &'a QueryWithFilters,
    pub amount: usize,
    pub after: Option<&'a ScoredResult>,
    pub field_sorts: &'a [FieldSort],
    pub count_requests: &'a [CountRequest],
    pub real_time: bool,
}

pub struct SegmentEngine {
    index_name: String,
    segment_number: u32,
    config: Arc<IndexConfig>,
    analyzer: PerFieldAnalyzer,
    factory: Arc<dyn ShardIndexFactory>,
    writer: RwLock<Arc<dyn ShardIndex>>,
    counter: AtomicU64,
    clock: Mutex<CommitClock>,
    query_cache: Option<QueryResultCache>,
    realtime_cache: Option<QueryResultCache>,
}

impl SegmentEngine {
    pub fn open(
        config: Arc<IndexConfig>,
        segment_number: u32,
        factory: Arc<dyn ShardIndexFactory>,
    ) -> Result<Self> {
        let writer = factory.open(&config.index_name, segment_number)?;
        let settings = &config.settings;
        let query_cache = QueryResultCache::new(settings.segment_query_cache_size);
        let realtime_cache = QueryResultCache::new(settings.segment_query_cache_size);

        debug!(
            "Opened segment {} of index <{}>",
            segment_number, config.index_name
        );

        Ok(Self {
            index_name: config.index_name.clone(),
            segment_number,
            analyzer: config.per_field_analyzer(),
            config,
            factory,
            writer: RwLock::new(writer),
            counter: AtomicU64::new(0),
            clock: Mutex::new(CommitClock::default()),
            query_cache,
            realtime_cache,
        })
    }

    pub fn segment_number(&self) -> u32 {
        self.segment_number
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn config(&self) -> &Arc<IndexConfig> {
        &self.config
    }

    /// The open writer, reopened when the shard was closed underneath us.
    fn writer(&self) -> Result<Arc<dyn ShardIndex>> {
        {
            let writer = self.writer.read();
            if writer.is_open() {
                return Ok(writer.clone());
            }
        }

        let mut writer = self.writer.write();
        if !writer.is_open() {
            warn!(
                "Reopening closed writer for segment {} of index <{}>",
                self.segment_number, self.index_name
            );
            *writer = self.factory.open(&self.index_name, self.segment_number)?;
        }
        Ok(writer.clone())
    }

    /// Indexes or replaces the document with `unique_id`.
    pub fn index(&self, unique_id: &str, document: &Document, timestamp: i64) -> Result<()> {
        let indexed =
            build_indexed_document(&self.config, &self.analyzer, unique_id, document, timestamp)?;
        self.writer()?.update_document(indexed)?;
        self.possible_commit()
    }

    pub fn delete_document(&self, unique_id: &str) -> Result<()> {
        self.writer()?.delete_document(unique_id)?;
        self.possible_commit()
    }

    /// Commits every commit interval of mutations, otherwise flushes every flush interval.
    fn possible_commit(&self) -> Result<()> {
        self.clock.lock().last_change = Some(Instant::now());
        if let Some(cache) = &self.realtime_cache {
            cache.clear();
        }

        let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let settings = &self.config.settings;
        if count % settings.segment_commit_interval == 0 {
            self.force_commit()?;
        } else if count % settings.segment_flush_interval == 0 {
            self.writer()?.flush(settings.apply_uncommitted_deletes)?;
        }
        Ok(())
    }

    pub fn force_commit(&self) -> Result<()> {
        debug!(
            "Committing segment {} of index <{}>",
            self.segment_number, self.index_name
        );
        self.writer()?.commit()?;
        self.clock.lock().last_commit = Some(Instant::now());
        if let Some(cache) = &self.query_cache {
            cache.clear();
        }
        if let Some(cache) = &self.realtime_cache {
            cache.clear();
        }
        Ok(())
    }

    /// Commits when there are uncommitted changes older than the idle time.
    ///
    /// Returns whether a commit happened.
    pub fn do_commit(&self) -> Result<bool> {
        let idle = Duration::from_secs(self.config.settings.idle_time_without_commit);
        let due = {
            let clock = self.clock.lock();
            match clock.last_change {
                Some(changed) => {
                    let uncommitted = clock.last_commit.is_none_or(|c| c < changed);
                    uncommitted && changed.elapsed() >= idle
                }
                None => false,
            }
        };
        if due {
            info!(
                "Committing idle segment {} of index <{}>",
                self.segment_number, self.index_name
            );
            self.force_commit()?;
        }
        Ok(due)
    }

    /// Runs a query against this segment, collecting one extra hit as `next`.
    pub fn query_segment(
        &self,
        query: &SegmentQuery<'_>,
        cache_key: &QueryCacheKey,
    ) -> Result<ShardResult> {
        let cache = if query.real_time {
            self.realtime_cache.as_ref()
        } else {
            self.query_cache.as_ref()
        };
        let max_amount = self.config.settings.segment_query_cache_max_amount;
        let cache = cache.filter(|_| max_amount == 0 || query.amount <= max_amount);

        if let Some(cache) = cache {
            if let Some(cached) = cache.get(cache_key) {
                return Ok(cached);
            }
        }

        let result = self.search(query)?;
        if let Some(cache) = cache {
            cache.put(cache_key.clone(), result.clone());
        }
        Ok(result)
    }

    fn search(&self, query: &SegmentQuery<'_>) -> Result<ShardResult> {
        // 1. Resolve sort fields
        let sort = query
            .field_sorts
            .iter()
            .map(|fs| {
                if self.config.sort_type(&fs.sort_field).is_none() {
                    return Err(ClusterError::invalid_argument(format!(
                        "Field <{}> is not sortable for index <{}>",
                        fs.sort_field, self.index_name
                    )));
                }
                Ok(SortField {
                    field: fs.sort_field.clone(),
                    reverse: fs.direction == Direction::Descending,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // 2. Collect one hit past the page
        let reader = self.writer()?.reader(query.real_time)?;
        let spec = SearchSpec {
            query: query.query,
            top_n: query.amount.saturating_add(1),
            after: query.after,
            sort: &sort,
            count_requests: query.count_requests,
        };
        let top_docs = reader.search(&spec)?;

        // 3. Build results
        let mut results = Vec::with_capacity(top_docs.score_docs.len().min(query.amount));
        let mut next = None;
        for (i, score_doc) in top_docs.score_docs.into_iter().enumerate() {
            let result = ScoredResult {
                unique_id: score_doc.unique_id,
                score: score_doc.score,
                doc_id: score_doc.doc_id,
                timestamp: score_doc.timestamp,
                segment: self.segment_number,
                index_name: self.index_name.clone(),
                result_index: i as u32,
                sort_values: score_doc.sort_values,
            };
            if i < query.amount {
                results.push(result);
            } else {
                next = Some(result);
            }
        }

        let facet_groups = query
            .count_requests
            .iter()
            .zip(top_docs.facet_counts)
            .map(|(count_request, counts)| FacetGroup {
                count_request: count_request.clone(),
                facet_counts: counts
                    .into_iter()
                    .map(|(facet, count)| FacetCount { facet, count })
                    .collect(),
            })
            .collect();

        Ok(ShardResult {
            index_name: self.index_name.clone(),
            segment_number: self.segment_number,
            total_hits: top_docs.total_hits,
            results,
            next,
            facet_groups,
        })
    }

    pub fn optimize(&self) -> Result<()> {
        info!(
            "Optimizing segment {} of index <{}>",
            self.segment_number, self.index_name
        );
        self.writer()?.force_merge(1)?;
        self.force_commit()
    }

    pub fn get_field_names(&self) -> Result<BTreeSet<String>> {
        let mut names = self.writer()?.reader(true)?.field_names();
        names.insert(self.config.unique_id_field.clone());
        names.insert(TIMESTAMP_FIELD.to_string());
        Ok(names)
    }

    /// Terms of one field ascending from the starting term.
    ///
    /// `term_filter` excludes and `term_match` includes; both must match the
    /// whole term. Without a document frequency floor the list stops at the
    /// requested amount, since other segments cannot lift a term above it.
    pub fn get_terms(&self, request: &GetTermsRequest) -> Result<Vec<Term>> {
        let exclude = request.term_filter.as_deref().map(full_match).transpose()?;
        let include = request.term_match.as_deref().map(full_match).transpose()?;
        let start = request.starting_term.as_deref().unwrap_or("");
        let limit = if request.amount == 0 || request.min_doc_freq > 1 {
            usize::MAX
        } else {
            request.amount
        };

        let reader = self.writer()?.reader(request.real_time)?;
        Ok(reader
            .terms(&request.field_name, start)
            .into_iter()
            .filter(|(term, _)| !exclude.as_ref().is_some_and(|re| re.is_match(term)))
            .filter(|(term, _)| include.as_ref().is_none_or(|re| re.is_match(term)))
            .take(limit)
            .map(|(value, doc_freq)| Term { value, doc_freq })
            .collect())
    }

    pub fn get_number_of_docs(&self, real_time: bool) -> Result<SegmentCountResponse> {
        Ok(SegmentCountResponse {
            segment_number: self.segment_number,
            number_of_docs: self.writer()?.reader(real_time)?.num_docs(),
        })
    }

    pub fn clear(&self) -> Result<()> {
        info!(
            "Clearing segment {} of index <{}>",
            self.segment_number, self.index_name
        );
        self.writer()?.delete_all()?;
        self.force_commit()
    }

    /// Commits pending changes and closes the writer.
    pub fn close(&self) -> Result<()> {
        let writer = self.writer.read().clone();
        if !writer.is_open() {
            return Ok(());
        }
        writer.commit()?;
        writer.close()?;
        info!(
            "Closed segment {} of index <{}>",
            self.segment_number, self.index_name
        );
        Ok(())
    }
}

impl fmt::Debug for SegmentEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentEngine")
            .field("index_name", &self.index_name)
            .field("segment_number", &self.segment_number)
            .field("counter", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

fn full_match(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{})$", pattern))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalyzerKind;
    use crate::config::{FacetType, FieldConfig, SortType};
    use crate::query::Query;
    use crate::query::parser::QueryParser;
    use crate::request::{CountRequest, Facet, QueryRequest};
    use crate::shard::MemoryShardFactory;

    fn config(commit_interval: u64, flush_interval: u64) -> Arc<IndexConfig> {
        Arc::new(
            IndexConfig::builder("docs", 1, "id")
                .default_search_field("title")
                .add_field(
                    FieldConfig::builder("title")
                        .index_as(AnalyzerKind::Standard)
                        .build(),
                )
                .add_field(
                    FieldConfig::builder("rank")
                        .index_as(AnalyzerKind::NumericLong)
                        .sort_as(SortType::NumericLong)
                        .build(),
                )
                .add_field(
                    FieldConfig::builder("color")
                        .index_as(AnalyzerKind::LcKeyword)
                        .facet_as(FacetType::Standard)
                        .build(),
                )
                .segment_commit_interval(commit_interval)
                .segment_flush_interval(flush_interval)
                .build(),
        )
    }

    fn doc(title: &str, rank: i64, color: &str) -> Document {
        Document::new()
            .add_field("title", title)
            .add_field("rank", rank)
            .add_field("color", color)
    }

    fn engine(config: Arc<IndexConfig>) -> (Arc<MemoryShardFactory>, SegmentEngine) {
        let factory = Arc::new(MemoryShardFactory::new());
        let engine = SegmentEngine::open(config, 0, factory.clone()).unwrap();
        (factory, engine)
    }

    fn run(
        engine: &SegmentEngine,
        query: Query,
        amount: usize,
        real_time: bool,
        field_sorts: &[FieldSort],
        count_requests: &[CountRequest],
    ) -> Result<ShardResult> {
        let query = QueryWithFilters::new(query);
        let request = QueryRequest::builder("").amount(amount).build();
        let key = QueryCacheKey::new(&request, amount, None)?;
        engine.query_segment(
            &SegmentQuery {
                query: &query,
                amount,
                after: None,
                field_sorts,
                count_requests,
                real_time,
            },
            &key,
        )
    }

    #[test]
    fn test_commit_and_flush_intervals() {
        let (_factory, engine) = engine(config(4, 2));
        engine.index("a", &doc("alpha", 1, "red"), 0).unwrap();
        assert_eq!(engine.get_number_of_docs(true).unwrap().number_of_docs, 0);

        engine.index("b", &doc("beta", 2, "red"), 0).unwrap();
        assert_eq!(engine.get_number_of_docs(true).unwrap().number_of_docs, 2);
        assert_eq!(engine.get_number_of_docs(false).unwrap().number_of_docs, 0);

        engine.index("c", &doc("gamma", 3, "blue"), 0).unwrap();
        engine.index("d", &doc("delta", 4, "blue"), 0).unwrap();
        assert_eq!(engine.get_number_of_docs(false).unwrap().number_of_docs, 4);
    }

    #[test]
    fn test_query_collects_next_result() {
        let (_factory, engine) = engine(config(1, 1));
        for (id, rank) in [("a", 1), ("b", 3), ("c", 2)] {
            engine.index(id, &doc("same title", rank, "red"), 0).unwrap();
        }

        let sorts = [FieldSort::desc("rank")];
        let result = run(&engine, Query::MatchAll, 2, false, &sorts, &[]).unwrap();
        assert_eq!(result.total_hits, 3);
        let ids: Vec<&str> = result.results.iter().map(|r| r.unique_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(result.results[1].result_index, 1);
        assert_eq!(result.next.as_ref().unwrap().unique_id, "a");

        let result = run(&engine, Query::MatchAll, 3, false, &sorts, &[]).unwrap();
        assert!(result.next.is_none());
    }

    #[test]
    fn test_unknown_sort_field_is_rejected() {
        let (_factory, engine) = engine(config(1, 1));
        let sorts = [FieldSort::asc("title")];
        assert!(matches!(
            run(&engine, Query::MatchAll, 10, false, &sorts, &[]),
            Err(ClusterError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_facet_groups_follow_count_requests() {
        let (_factory, engine) = engine(config(1, 1));
        engine.index("a", &doc("one", 1, "red"), 0).unwrap();
        engine.index("b", &doc("two", 2, "red"), 0).unwrap();
        engine.index("c", &doc("three", 3, "blue"), 0).unwrap();

        let counts = [CountRequest::new(Facet::new("color"))];
        let result = run(&engine, Query::MatchAll, 10, false, &[], &counts).unwrap();
        assert_eq!(result.facet_groups.len(), 1);
        assert_eq!(result.facet_groups[0].count_for("red"), Some(2));
        assert_eq!(result.facet_groups[0].count_for("blue"), Some(1));
    }

    #[test]
    fn test_cache_is_invalidated_by_commit() {
        let (_factory, engine) = engine(config(2, 1));
        engine.index("a", &doc("rust", 1, "red"), 0).unwrap();
        engine.index("b", &doc("rust", 2, "red"), 0).unwrap();

        let query = Query::term("title", "rust");
        let first = run(&engine, query.clone(), 10, false, &[], &[]).unwrap();
        assert_eq!(first.total_hits, 2);
        let cache = engine.query_cache.as_ref().unwrap();
        assert_eq!(cache.len(), 1);
        run(&engine, query.clone(), 10, false, &[], &[]).unwrap();
        assert_eq!(cache.stats().0, 1);

        engine.delete_document("a").unwrap();
        engine.force_commit().unwrap();
        assert!(cache.is_empty());
        let after = run(&engine, query, 10, false, &[], &[]).unwrap();
        assert_eq!(after.total_hits, 1);
    }

    #[test]
    fn test_writer_is_reopened_after_close() {
        let (factory, engine) = engine(config(1, 1));
        engine.index("a", &doc("alpha", 1, "red"), 0).unwrap();
        factory.shard("docs", 0).unwrap().close().unwrap();

        engine.index("b", &doc("beta", 2, "red"), 0).unwrap();
        assert_eq!(engine.get_number_of_docs(false).unwrap().number_of_docs, 2);
    }

    #[test]
    fn test_get_terms_filters_and_start() {
        let (_factory, engine) = engine(config(1, 1));
        engine.index("a", &doc("apple banana", 1, "red"), 0).unwrap();
        engine.index("b", &doc("apricot cherry", 2, "red"), 0).unwrap();
        engine.index("c", &doc("banana date", 3, "red"), 0).unwrap();

        let values = |request: GetTermsRequest| -> Vec<(String, u64)> {
            engine
                .get_terms(&request)
                .unwrap()
                .into_iter()
                .map(|t| (t.value, t.doc_freq))
                .collect()
        };

        let all = values(GetTermsRequest::new("docs", "title", 10));
        assert_eq!(all[0], ("apple".to_string(), 1));
        assert_eq!(all[2], ("banana".to_string(), 2));

        let from_b = values(GetTermsRequest::new("docs", "title", 2).starting_term("b"));
        assert_eq!(from_b, vec![("banana".to_string(), 2), ("cherry".to_string(), 1)]);

        let matched = values(GetTermsRequest::new("docs", "title", 10).term_match("ap.*"));
        assert_eq!(matched.len(), 2);
        let filtered = values(GetTermsRequest::new("docs", "title", 10).term_filter("ap.*"));
        assert!(filtered.iter().all(|(t, _)| !t.starts_with("ap")));

        // partial matches do not count
        let partial = values(GetTermsRequest::new("docs", "title", 10).term_match("ban"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_idle_commit() {
        let config = Arc::new(
            IndexConfig::builder("docs", 1, "id")
                .segment_commit_interval(100)
                .segment_flush_interval(100)
                .idle_time_without_commit(0)
                .build(),
        );
        let (_factory, engine) = engine(config);
        assert!(!engine.do_commit().unwrap());

        engine.index("a", &Document::new(), 0).unwrap();
        assert!(engine.do_commit().unwrap());
        assert_eq!(engine.get_number_of_docs(false).unwrap().number_of_docs, 1);
        assert!(!engine.do_commit().unwrap());
    }

    #[test]
    fn test_clear_optimize_and_field_names() {
        let (_factory, engine) = engine(config(1, 1));
        engine.index("a", &doc("alpha", 1, "red"), 0).unwrap();
        engine.index("b", &doc("beta", 2, "red"), 0).unwrap();
        engine.delete_document("a").unwrap();
        engine.optimize().unwrap();

        let names = engine.get_field_names().unwrap();
        assert!(names.contains("title"));
        assert!(names.contains("id"));
        assert!(names.contains(TIMESTAMP_FIELD));

        engine.clear().unwrap();
        assert_eq!(engine.get_number_of_docs(false).unwrap().number_of_docs, 0);

        let analyzer = engine.config().per_field_analyzer();
        let parsed = QueryParser::new(&analyzer)
            .with_default_field("title")
            .parse("beta")
            .unwrap();
        let result = run(&engine, parsed, 10, true, &[], &[]).unwrap();
        assert_eq!(result.total_hits, 0);
    }
}
