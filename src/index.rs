//! One registered index as seen by one member.
//!
//! A [`ShardedIndex`] holds the index config, the segment ownership map and
//! the engines of the segments this member owns. It runs the local half of
//! every federated operation; the [`IndexManager`](crate::manager::IndexManager)
//! does the fan-out and merging.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::analysis::PerFieldAnalyzer;
use crate::catalog::IndexCatalog;
use crate::cluster::{MemberId, ShardOwnershipMap, segment_for_unique_id};
use crate::config::{IndexConfig, IndexSettings};
use crate::error::{ClusterError, Result};
use crate::query::QueryWithFilters;
use crate::query::parser::QueryParser;
use crate::request::{GetTermsRequest, QueryRequest, StoreRequest};
use crate::response::{
    GetNumberOfDocsResponse, GetTermsResponse, IndexMapping, IndexSegmentResponse, Term,
};
use crate::segment::{QueryCacheKey, SegmentEngine, SegmentQuery};
use crate::shard::ShardIndexFactory;

struct IndexState {
    config: Arc<IndexConfig>,
    analyzer: Arc<PerFieldAnalyzer>,
}

impl IndexState {
    fn new(config: IndexConfig) -> Self {
        Self {
            analyzer: Arc::new(config.per_field_analyzer()),
            config: Arc::new(config),
        }
    }
}

pub struct ShardedIndex {
    name: String,
    local: MemberId,
    state: RwLock<IndexState>,
    ownership: RwLock<ShardOwnershipMap>,
    segments: RwLock<BTreeMap<u32, Arc<SegmentEngine>>>,
    factory: Arc<dyn ShardIndexFactory>,
    catalog: Arc<dyn IndexCatalog>,
}

impl ShardedIndex {
    /// Registers a new index in the catalog. No segments are owned yet.
    pub fn create(
        config: IndexConfig,
        local: MemberId,
        factory: Arc<dyn ShardIndexFactory>,
        catalog: Arc<dyn IndexCatalog>,
    ) -> Result<Self> {
        config.validate()?;
        catalog.save(&config)?;
        info!(
            "Created index <{}> with {} segments",
            config.index_name, config.number_of_segments
        );
        Ok(Self::new(config, local, factory, catalog))
    }

    /// Loads an index from the catalog. No segments are owned yet.
    pub fn load(
        index_name: &str,
        local: MemberId,
        factory: Arc<dyn ShardIndexFactory>,
        catalog: Arc<dyn IndexCatalog>,
    ) -> Result<Self> {
        let config = catalog
            .load(index_name)?
            .ok_or_else(|| ClusterError::index_not_found(index_name))?;
        config.validate()?;
        info!("Loaded index <{}>", index_name);
        Ok(Self::new(config, local, factory, catalog))
    }

    fn new(
        config: IndexConfig,
        local: MemberId,
        factory: Arc<dyn ShardIndexFactory>,
        catalog: Arc<dyn IndexCatalog>,
    ) -> Self {
        Self {
            name: config.index_name.clone(),
            local,
            ownership: RwLock::new(ShardOwnershipMap::new(config.number_of_segments)),
            state: RwLock::new(IndexState::new(config)),
            segments: RwLock::new(BTreeMap::new()),
            factory,
            catalog,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> Arc<IndexConfig> {
        self.state.read().config.clone()
    }

    fn analyzer(&self) -> Arc<PerFieldAnalyzer> {
        self.state.read().analyzer.clone()
    }

    pub fn number_of_segments(&self) -> u32 {
        self.state.read().config.number_of_segments
    }

    pub fn ownership(&self) -> ShardOwnershipMap {
        self.ownership.read().clone()
    }

    /// Members owning at least one segment.
    pub fn members(&self) -> BTreeSet<MemberId> {
        self.ownership.read().members()
    }

    pub fn mapping(&self) -> IndexMapping {
        let ownership = self.ownership.read();
        IndexMapping {
            index_name: self.name.clone(),
            number_of_segments: ownership.number_of_segments(),
            segment_to_member: ownership.assignments().clone(),
        }
    }

    /// Segments open on this member.
    pub fn local_segments(&self) -> Vec<u32> {
        self.segments.read().keys().copied().collect()
    }

    fn engines(&self) -> Vec<Arc<SegmentEngine>> {
        self.segments.read().values().cloned().collect()
    }

    /// Owner of the segment a unique id routes to.
    pub fn find_member(&self, unique_id: &str) -> Result<MemberId> {
        let ownership = self.ownership.read();
        let segment = segment_for_unique_id(unique_id, ownership.number_of_segments());
        ownership
            .resolve_owner(segment)
            .cloned()
            .ok_or_else(|| ClusterError::segment_not_found(&self.name, segment))
    }

    /// The local engine of the segment a unique id routes to.
    pub fn find_segment(&self, unique_id: &str) -> Result<Arc<SegmentEngine>> {
        let segment = segment_for_unique_id(unique_id, self.number_of_segments());
        self.segments
            .read()
            .get(&segment)
            .cloned()
            .ok_or_else(|| ClusterError::segment_not_found(&self.name, segment))
    }

    /// Adopts a new ownership map, opening newly owned segments and closing released ones.
    pub fn update_segment_map(&self, map: &ShardOwnershipMap) -> Result<()> {
        let config = self.config();
        if map.number_of_segments() != config.number_of_segments {
            return Err(ClusterError::invalid_argument(format!(
                "Segment map for <{}> has {} segments, expected {}",
                self.name,
                map.number_of_segments(),
                config.number_of_segments
            )));
        }

        let owned = map.segments_for(&self.local);
        let mut segments = self.segments.write();

        let released: Vec<u32> = segments
            .keys()
            .filter(|s| !owned.contains(s))
            .copied()
            .collect();
        let mut first_error = None;
        for segment in released {
            if let Some(engine) = segments.remove(&segment) {
                info!("Unloading segment {} of index <{}>", segment, self.name);
                if let Err(e) = engine.close() {
                    error!(
                        "Failed to close segment {} of index <{}>: {}",
                        segment, self.name, e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        for segment in owned {
            if segments.contains_key(&segment) {
                continue;
            }
            info!("Loading segment {} of index <{}>", segment, self.name);
            let engine = SegmentEngine::open(config.clone(), segment, self.factory.clone())?;
            segments.insert(segment, Arc::new(engine));
        }

        *self.ownership.write() = map.clone();
        first_error.map_or(Ok(()), Err)
    }

    pub fn store_internal(&self, request: &StoreRequest) -> Result<()> {
        let timestamp = request
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        self.find_segment(&request.unique_id)?
            .index(&request.unique_id, &request.document, timestamp)
    }

    pub fn delete_internal(&self, unique_id: &str) -> Result<()> {
        self.find_segment(unique_id)?.delete_document(unique_id)
    }

    /// Parses the query text and filters with this index's analyzers.
    pub fn build_query(&self, request: &QueryRequest) -> Result<QueryWithFilters> {
        let config = self.config();
        let analyzer = self.analyzer();

        let mut parser = QueryParser::new(&analyzer)
            .with_default_operator(request.default_operator)
            .with_minimum_should_match(request.minimum_should_match);
        if !request.query_fields.is_empty() {
            parser = parser.with_default_fields(request.query_fields.clone());
        } else if let Some(field) = &config.settings.default_search_field {
            parser = parser.with_default_field(field.clone());
        }

        let query = parser.parse(&request.query)?;
        let filter_queries = request
            .filter_queries
            .iter()
            .map(|filter| parser.parse(filter))
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryWithFilters {
            query,
            filter_queries,
            drill_downs: request.facet_request.drill_downs.clone(),
        })
    }

    /// Queries every local segment.
    pub fn query_internal(&self, request: &QueryRequest) -> Result<IndexSegmentResponse> {
        let query = self.build_query(request)?;
        let amount = self
            .config()
            .segment_request_amount(request.amount, request.fetch_full);

        let segment_responses = self
            .engines()
            .par_iter()
            .map(|engine| {
                let after = request
                    .last_result
                    .as_ref()
                    .and_then(|cursor| cursor.for_segment(&self.name, engine.segment_number()));
                let cache_key = QueryCacheKey::new(request, amount, after)?;
                let segment_query = SegmentQuery {
                    query: &query,
                    amount,
                    after,
                    field_sorts: &request.field_sorts,
                    count_requests: &request.facet_request.count_requests,
                    real_time: request.real_time,
                };
                engine.query_segment(&segment_query, &cache_key)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(IndexSegmentResponse {
            index_name: self.name.clone(),
            segment_responses,
        })
    }

    pub fn get_number_of_docs(&self, real_time: bool) -> Result<GetNumberOfDocsResponse> {
        let segment_counts = self
            .engines()
            .iter()
            .map(|engine| engine.get_number_of_docs(real_time))
            .collect::<Result<Vec<_>>>()?;
        Ok(GetNumberOfDocsResponse {
            number_of_docs: segment_counts.iter().map(|c| c.number_of_docs).sum(),
            segment_counts,
        })
    }

    pub fn get_field_names(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for engine in self.engines() {
            names.extend(engine.get_field_names()?);
        }
        Ok(names)
    }

    /// Terms of the local segments with summed frequencies, ascending.
    pub fn get_terms(&self, request: &GetTermsRequest) -> Result<GetTermsResponse> {
        let mut merged: BTreeMap<String, u64> = BTreeMap::new();
        for engine in self.engines() {
            for term in engine.get_terms(request)? {
                *merged.entry(term.value).or_default() += term.doc_freq;
            }
        }
        Ok(GetTermsResponse {
            terms: merged
                .into_iter()
                .map(|(value, doc_freq)| Term { value, doc_freq })
                .collect(),
            last_term: None,
        })
    }

    pub fn clear(&self) -> Result<()> {
        for engine in self.engines() {
            engine.clear()?;
        }
        Ok(())
    }

    pub fn optimize(&self) -> Result<()> {
        for engine in self.engines() {
            engine.optimize()?;
        }
        Ok(())
    }

    /// Validates and persists new settings; local engines keep the old ones until reloaded.
    pub fn update_settings(&self, settings: IndexSettings) -> Result<()> {
        let config = self.config().with_settings(settings);
        config.validate()?;
        self.catalog.save(&config)?;
        *self.state.write() = IndexState::new(config);
        info!("Updated settings of index <{}>", self.name);
        Ok(())
    }

    /// Rereads the config from the catalog and rebuilds the local engines with it.
    pub fn reload_settings(&self) -> Result<()> {
        let config = self
            .catalog
            .load(&self.name)?
            .ok_or_else(|| ClusterError::index_not_found(&self.name))?;
        config.validate()?;
        if config.number_of_segments != self.number_of_segments() {
            return Err(ClusterError::invalid_config(format!(
                "Number of segments of <{}> cannot change",
                self.name
            )));
        }
        let config = Arc::new(config);
        *self.state.write() = IndexState {
            analyzer: Arc::new(config.per_field_analyzer()),
            config: config.clone(),
        };

        let mut segments = self.segments.write();
        for (segment, engine) in segments.iter_mut() {
            engine.close()?;
            *engine = Arc::new(SegmentEngine::open(
                config.clone(),
                *segment,
                self.factory.clone(),
            )?);
        }
        info!("Reloaded settings of index <{}>", self.name);
        Ok(())
    }

    /// Commits segments idle past their idle time. Returns how many committed.
    pub fn commit_idle(&self) -> usize {
        let mut committed = 0;
        for engine in self.engines() {
            match engine.do_commit() {
                Ok(true) => committed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Idle commit of segment {} of index <{}> failed: {}",
                    engine.segment_number(),
                    self.name,
                    e
                ),
            }
        }
        committed
    }

    /// Closes every local segment. Failures are logged; the first is returned.
    pub fn unload(&self) -> Result<()> {
        let mut first_error = None;
        let mut segments = self.segments.write();
        for (segment, engine) in std::mem::take(&mut *segments) {
            if let Err(e) = engine.close() {
                error!(
                    "Failed to unload segment {} of index <{}>: {}",
                    segment, self.name, e
                );
                first_error.get_or_insert(e);
            }
        }
        info!("Unloaded index <{}>", self.name);
        first_error.map_or(Ok(()), Err)
    }

    /// Removes stored shards and the catalog entry.
    pub fn delete_storage(&self) -> Result<()> {
        self.factory.delete_index(&self.name)?;
        self.catalog.delete(&self.name)?;
        info!("Deleted storage of index <{}>", self.name);
        Ok(())
    }
}

impl fmt::Debug for ShardedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedIndex")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("local_segments", &self.local_segments())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalyzerKind;
    use crate::catalog::MemoryCatalog;
    use crate::config::{FieldConfig, SortType};
    use crate::data::Document;
    use crate::request::FieldSort;
    use crate::shard::MemoryShardFactory;

    fn config() -> IndexConfig {
        IndexConfig::builder("docs", 2, "id")
            .default_search_field("title")
            .add_field(
                FieldConfig::builder("title")
                    .index_as(AnalyzerKind::Standard)
                    .build(),
            )
            .add_field(
                FieldConfig::builder("score_field")
                    .index_as(AnalyzerKind::NumericLong)
                    .sort_as(SortType::NumericLong)
                    .build(),
            )
            .segment_commit_interval(1)
            .segment_flush_interval(1)
            .build()
    }

    fn owned_by(member: &str, segments: u32) -> ShardOwnershipMap {
        let mut map = ShardOwnershipMap::new(segments);
        for s in 0..segments {
            map.assign(s, member.into());
        }
        map
    }

    fn index() -> ShardedIndex {
        let index = ShardedIndex::create(
            config(),
            "local".into(),
            Arc::new(MemoryShardFactory::new()),
            Arc::new(MemoryCatalog::new()),
        )
        .unwrap();
        index.update_segment_map(&owned_by("local", 2)).unwrap();
        index
    }

    #[test]
    fn test_segment_map_loads_and_releases_segments() {
        let index = index();
        assert_eq!(index.local_segments(), vec![0, 1]);

        let mut map = owned_by("local", 2);
        map.assign(1, "remote".into());
        index.update_segment_map(&map).unwrap();
        assert_eq!(index.local_segments(), vec![0]);
        assert_eq!(index.find_member("a").unwrap(), MemberId::from("remote"));
        assert!(matches!(
            index.find_segment("a"),
            Err(ClusterError::SegmentNotFound { .. })
        ));

        assert!(index.update_segment_map(&owned_by("local", 3)).is_err());
    }

    #[test]
    fn test_store_and_query_local_segments() {
        let index = index();
        for (id, score) in [("a", 5), ("b", 10)] {
            let document = Document::new()
                .add_field("id", id)
                .add_field("title", "hello world")
                .add_field("score_field", score);
            index
                .store_internal(&StoreRequest::new("docs", id, document))
                .unwrap();
        }

        let request = QueryRequest::builder("hello")
            .index("docs")
            .amount(1)
            .sort(FieldSort::desc("score_field"))
            .build();
        let response = index.query_internal(&request).unwrap();
        assert_eq!(response.segment_responses.len(), 2);
        let total: u64 = response.segment_responses.iter().map(|r| r.total_hits).sum();
        assert_eq!(total, 2);

        assert_eq!(index.get_number_of_docs(false).unwrap().number_of_docs, 2);
        let terms = index
            .get_terms(&GetTermsRequest::new("docs", "title", 10))
            .unwrap();
        assert_eq!(terms.terms[0], Term { value: "hello".into(), doc_freq: 2 });
    }

    #[test]
    fn test_bad_query_text_is_rejected() {
        let index = index();
        let request = QueryRequest::builder("title:(unclosed").index("docs").build();
        assert!(matches!(
            index.query_internal(&request),
            Err(ClusterError::QueryParse(_))
        ));
    }

    #[test]
    fn test_settings_update_and_reload() {
        let index = index();
        let mut settings = index.config().settings.clone();
        settings.segment_flush_interval = 0;
        assert!(matches!(
            index.update_settings(settings),
            Err(ClusterError::InvalidConfig(_))
        ));

        let mut settings = index.config().settings.clone();
        settings.segment_tolerance = 1.5;
        index.update_settings(settings).unwrap();
        index.reload_settings().unwrap();
        assert_eq!(index.config().settings.segment_tolerance, 1.5);
        assert_eq!(index.local_segments(), vec![0, 1]);
    }
}
