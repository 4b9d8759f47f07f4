//! Index and manager configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::{AnalyzerKind, PerFieldAnalyzer};
use crate::error::{ClusterError, Result};

pub use crate::data::NumericType;

/// Type a field is sorted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortType {
    NumericInt,
    NumericLong,
    NumericFloat,
    NumericDouble,
    Date,
    String,
}

impl SortType {
    pub fn numeric_type(&self) -> Option<NumericType> {
        match self {
            SortType::NumericInt => Some(NumericType::Int),
            SortType::NumericLong => Some(NumericType::Long),
            SortType::NumericFloat => Some(NumericType::Float),
            SortType::NumericDouble => Some(NumericType::Double),
            SortType::Date => Some(NumericType::Date),
            SortType::String => None,
        }
    }
}

/// How a stored value becomes a facet path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetType {
    /// The value's text is the single path component.
    Standard,
    /// A date as one `yyyyMMdd` component.
    DateYyyymmdd,
    /// A date as the hierarchy `yyyy / MM / dd`.
    DateYyyyMmDd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAs {
    pub index_field_name: String,
    pub analyzer: AnalyzerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetAs {
    pub facet_name: String,
    pub facet_type: FacetType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortAs {
    pub sort_field_name: String,
    pub sort_type: SortType,
}

/// Configuration for a single stored field.
///
/// One stored field may fan out to several indexed fields, a sort key and
/// facet entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Dotted path of the value inside the stored document.
    pub stored_field_name: String,
    #[serde(default)]
    pub index_as: Vec<IndexAs>,
    #[serde(default)]
    pub facet_as: Vec<FacetAs>,
    #[serde(default)]
    pub sort_as: Option<SortAs>,
}

impl FieldConfig {
    pub fn builder(stored_field_name: impl Into<String>) -> FieldConfigBuilder {
        FieldConfigBuilder::new(stored_field_name)
    }
}

pub struct FieldConfigBuilder {
    config: FieldConfig,
}

impl FieldConfigBuilder {
    pub fn new(stored_field_name: impl Into<String>) -> Self {
        Self {
            config: FieldConfig {
                stored_field_name: stored_field_name.into(),
                index_as: Vec::new(),
                facet_as: Vec::new(),
                sort_as: None,
            },
        }
    }

    /// Index under the stored field's own name.
    pub fn index_as(self, analyzer: AnalyzerKind) -> Self {
        let name = self.config.stored_field_name.clone();
        self.index_as_field(analyzer, name)
    }

    pub fn index_as_field(mut self, analyzer: AnalyzerKind, name: impl Into<String>) -> Self {
        self.config.index_as.push(IndexAs {
            index_field_name: name.into(),
            analyzer,
        });
        self
    }

    pub fn facet_as(self, facet_type: FacetType) -> Self {
        let name = self.config.stored_field_name.clone();
        self.facet_as_named(name, facet_type)
    }

    pub fn facet_as_named(mut self, name: impl Into<String>, facet_type: FacetType) -> Self {
        self.config.facet_as.push(FacetAs {
            facet_name: name.into(),
            facet_type,
        });
        self
    }

    pub fn sort_as(self, sort_type: SortType) -> Self {
        let name = self.config.stored_field_name.clone();
        self.sort_as_named(name, sort_type)
    }

    pub fn sort_as_named(mut self, name: impl Into<String>, sort_type: SortType) -> Self {
        self.config.sort_as = Some(SortAs {
            sort_field_name: name.into(),
            sort_type,
        });
        self
    }

    pub fn build(self) -> FieldConfig {
        self.config
    }
}

/// Mutable per-index settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Field searched by unfielded query clauses.
    pub default_search_field: Option<String>,
    pub field_configs: Vec<FieldConfig>,
    /// Every Nth mutation on a segment forces a commit.
    pub segment_commit_interval: u64,
    /// Every Mth mutation on a segment forces a flush.
    pub segment_flush_interval: u64,
    /// Seconds without changes before pending changes get committed.
    pub idle_time_without_commit: u64,
    /// Entries in each segment's result cache; 0 disables caching.
    pub segment_query_cache_size: usize,
    /// Largest amount that is cached; 0 means any amount.
    pub segment_query_cache_max_amount: usize,
    /// Score window in which a possibly stale merge is accepted.
    pub segment_tolerance: f64,
    /// Whether deletes become visible to realtime readers on flush.
    pub apply_uncommitted_deletes: bool,
    /// Over-fetch factor for the per-segment request size.
    pub request_factor: f64,
    /// Lower bound for the per-segment request size.
    pub min_segment_request: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            default_search_field: None,
            field_configs: Vec::new(),
            segment_commit_interval: 3200,
            segment_flush_interval: 1000,
            idle_time_without_commit: 30,
            segment_query_cache_size: 512,
            segment_query_cache_max_amount: 256,
            segment_tolerance: 0.05,
            apply_uncommitted_deletes: true,
            request_factor: 2.0,
            min_segment_request: 2,
        }
    }
}

/// Configuration of one sharded index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub index_name: String,
    /// Fixed at creation.
    pub number_of_segments: u32,
    pub unique_id_field: String,
    #[serde(default)]
    pub settings: IndexSettings,
}

impl IndexConfig {
    pub fn new(
        index_name: impl Into<String>,
        number_of_segments: u32,
        unique_id_field: impl Into<String>,
    ) -> Self {
        Self {
            index_name: index_name.into(),
            number_of_segments,
            unique_id_field: unique_id_field.into(),
            settings: IndexSettings::default(),
        }
    }

    pub fn builder(
        index_name: impl Into<String>,
        number_of_segments: u32,
        unique_id_field: impl Into<String>,
    ) -> IndexConfigBuilder {
        IndexConfigBuilder {
            config: IndexConfig::new(index_name, number_of_segments, unique_id_field),
        }
    }

    /// Returns a copy carrying new settings; name, segments and id field are fixed.
    pub fn with_settings(&self, settings: IndexSettings) -> Self {
        Self {
            settings,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;
        if self.index_name.trim().is_empty() {
            return Err(ClusterError::invalid_config("Index name must not be empty"));
        }
        if self.number_of_segments == 0 {
            return Err(ClusterError::invalid_config(format!(
                "Index <{}> must have at least one segment",
                self.index_name
            )));
        }
        if self.unique_id_field.trim().is_empty() {
            return Err(ClusterError::invalid_config(format!(
                "Index <{}> must define a unique id field",
                self.index_name
            )));
        }
        if s.segment_commit_interval == 0 || s.segment_flush_interval == 0 {
            return Err(ClusterError::invalid_config(
                "Segment commit and flush intervals must be positive",
            ));
        }
        if s.segment_flush_interval > s.segment_commit_interval {
            return Err(ClusterError::invalid_config(format!(
                "Segment flush interval {} exceeds commit interval {}",
                s.segment_flush_interval, s.segment_commit_interval
            )));
        }
        if !(s.segment_tolerance >= 0.0) {
            return Err(ClusterError::invalid_config(
                "Segment tolerance must be zero or positive",
            ));
        }
        if !(s.request_factor > 0.0) {
            return Err(ClusterError::invalid_config("Request factor must be positive"));
        }

        let mut sort_fields = HashMap::new();
        let mut indexed_fields: HashMap<&str, AnalyzerKind> = HashMap::new();
        for fc in &s.field_configs {
            if let Some(sort_as) = &fc.sort_as {
                if sort_fields
                    .insert(sort_as.sort_field_name.as_str(), sort_as.sort_type)
                    .is_some()
                {
                    return Err(ClusterError::invalid_config(format!(
                        "Sort field <{}> is defined more than once",
                        sort_as.sort_field_name
                    )));
                }
            }
            for index_as in &fc.index_as {
                if let Some(existing) =
                    indexed_fields.insert(index_as.index_field_name.as_str(), index_as.analyzer)
                {
                    if existing != index_as.analyzer {
                        return Err(ClusterError::invalid_config(format!(
                            "Indexed field <{}> has conflicting analyzers {:?} and {:?}",
                            index_as.index_field_name, existing, index_as.analyzer
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn field_config(&self, stored_field_name: &str) -> Option<&FieldConfig> {
        self.settings
            .field_configs
            .iter()
            .find(|fc| fc.stored_field_name == stored_field_name)
    }

    /// Analyzer assigned to an indexed field. The unique id is always a keyword.
    pub fn analyzer_kind(&self, index_field_name: &str) -> Option<AnalyzerKind> {
        if index_field_name == self.unique_id_field {
            return Some(AnalyzerKind::Keyword);
        }
        self.settings
            .field_configs
            .iter()
            .flat_map(|fc| fc.index_as.iter())
            .find(|ia| ia.index_field_name == index_field_name)
            .map(|ia| ia.analyzer)
    }

    pub fn sort_type(&self, sort_field_name: &str) -> Option<SortType> {
        self.settings
            .field_configs
            .iter()
            .filter_map(|fc| fc.sort_as.as_ref())
            .find(|sa| sa.sort_field_name == sort_field_name)
            .map(|sa| sa.sort_type)
    }

    pub fn per_field_analyzer(&self) -> PerFieldAnalyzer {
        let mut analyzer = PerFieldAnalyzer::default();
        for fc in &self.settings.field_configs {
            for index_as in &fc.index_as {
                analyzer.add(index_as.index_field_name.clone(), index_as.analyzer);
            }
        }
        analyzer.add(self.unique_id_field.clone(), AnalyzerKind::Keyword);
        analyzer
    }

    /// Number of results asked from each segment for a page of `amount`.
    pub fn segment_request_amount(&self, amount: usize, fetch_full: bool) -> usize {
        if fetch_full || self.number_of_segments <= 1 {
            return amount;
        }
        let share = (amount as f64 * self.settings.request_factor
            / self.number_of_segments as f64)
            .ceil() as usize;
        share.max(self.settings.min_segment_request).min(amount)
    }
}

pub struct IndexConfigBuilder {
    config: IndexConfig,
}

impl IndexConfigBuilder {
    pub fn default_search_field(mut self, field: impl Into<String>) -> Self {
        self.config.settings.default_search_field = Some(field.into());
        self
    }

    pub fn add_field(mut self, field: FieldConfig) -> Self {
        self.config.settings.field_configs.push(field);
        self
    }

    pub fn segment_commit_interval(mut self, interval: u64) -> Self {
        self.config.settings.segment_commit_interval = interval;
        self
    }

    pub fn segment_flush_interval(mut self, interval: u64) -> Self {
        self.config.settings.segment_flush_interval = interval;
        self
    }

    pub fn idle_time_without_commit(mut self, seconds: u64) -> Self {
        self.config.settings.idle_time_without_commit = seconds;
        self
    }

    pub fn query_cache(mut self, size: usize, max_amount: usize) -> Self {
        self.config.settings.segment_query_cache_size = size;
        self.config.settings.segment_query_cache_max_amount = max_amount;
        self
    }

    pub fn segment_tolerance(mut self, tolerance: f64) -> Self {
        self.config.settings.segment_tolerance = tolerance;
        self
    }

    pub fn apply_uncommitted_deletes(mut self, apply: bool) -> Self {
        self.config.settings.apply_uncommitted_deletes = apply;
        self
    }

    pub fn request_factor(mut self, factor: f64) -> Self {
        self.config.settings.request_factor = factor;
        self
    }

    pub fn min_segment_request(mut self, min: usize) -> Self {
        self.config.settings.min_segment_request = min;
        self
    }

    pub fn settings(mut self, settings: IndexSettings) -> Self {
        self.config.settings = settings;
        self
    }

    pub fn build(self) -> IndexConfig {
        self.config
    }
}

/// Node-level configuration for an [`IndexManager`](crate::IndexManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Threads in the federation pool.
    pub worker_threads: usize,
    /// Seconds shutdown waits for the global gate.
    pub shutdown_wait_secs: u64,
    /// Seconds between idle commit checks.
    pub idle_commit_period_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(2),
            shutdown_wait_secs: 10,
            idle_commit_period_secs: 5,
        }
    }
}

impl ManagerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }

    pub fn idle_commit_period(&self) -> Duration {
        Duration::from_secs(self.idle_commit_period_secs.max(1))
    }
}
