//! # Iris Cluster
//!
//! Sharded index coordination for Iris.
//!
//! ## Features
//!
//! - Indexes split into a fixed number of segments, hashed by unique id
//! - Segment ownership balanced across cluster members
//! - Requests federated to the owning members and merged into one result
//! - Cursor pagination, field sorting and facet counts across segments
//! - Commit, flush and idle-commit policies per segment

pub mod analysis;
pub mod catalog;
pub mod cluster;
pub mod combiner;
pub mod config;
mod data;
mod error;
pub mod index;
pub mod manager;
pub mod query;
pub mod request;
pub mod response;
pub mod segment;
pub mod shard;

// Re-exports for the public API
pub use analysis::{Analyzer, AnalyzerKind, PerFieldAnalyzer};
pub use catalog::{FileCatalog, IndexCatalog, MemoryCatalog};
pub use cluster::{
    BalancePolicy, EvenBalancePolicy, InProcessClient, InProcessCluster, InternalClient, MemberId,
    Membership, RequestFederator, ShardOwnershipMap, StaticMembership,
};
pub use combiner::ResultCombiner;
pub use config::{
    FacetType, FieldConfig, IndexConfig, IndexSettings, ManagerConfig, SortType,
};
pub use data::{DataValue, Document, NumericType, NumericValue};
pub use error::{ClusterError, Result};
pub use index::ShardedIndex;
pub use manager::{IndexManager, IndexManagerBuilder};
pub use request::{
    CountRequest, DeleteRequest, Direction, Facet, FieldSort, GetTermsRequest, Operator,
    QueryRequest, StoreRequest,
};
pub use response::{
    FacetGroup, GetMembersResponse, GetNumberOfDocsResponse, GetTermsResponse, MergedResult,
    PaginationCursor, ScoredResult, SortValue, Term,
};
pub use segment::SegmentEngine;
pub use shard::{MemoryShardFactory, ShardIndex, ShardIndexFactory};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
