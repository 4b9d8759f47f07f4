//! Per-segment, merged and administrative responses.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cluster::MemberId;
use crate::data::NumericValue;
use crate::request::CountRequest;

/// A typed sort key.
///
/// `Missing` is the explicit value for documents without a sort value; it
/// orders below every present value, so it comes first ascending and last
/// descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SortValue {
    Missing,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Date(i64),
    Term(String),
}

impl SortValue {
    fn kind_rank(&self) -> u8 {
        match self {
            SortValue::Missing => 0,
            SortValue::Int(_) => 1,
            SortValue::Long(_) => 2,
            SortValue::Float(_) => 3,
            SortValue::Double(_) => 4,
            SortValue::Date(_) => 5,
            SortValue::Term(_) => 6,
        }
    }

    /// Ascending order of two keys of the same sort field.
    pub fn compare(&self, other: &SortValue) -> Ordering {
        match (self, other) {
            (SortValue::Missing, SortValue::Missing) => Ordering::Equal,
            (SortValue::Missing, _) => Ordering::Less,
            (_, SortValue::Missing) => Ordering::Greater,
            (SortValue::Int(a), SortValue::Int(b)) => a.cmp(b),
            (SortValue::Long(a), SortValue::Long(b)) => a.cmp(b),
            (SortValue::Float(a), SortValue::Float(b)) => a.total_cmp(b),
            (SortValue::Double(a), SortValue::Double(b)) => a.total_cmp(b),
            (SortValue::Date(a), SortValue::Date(b)) => a.cmp(b),
            (SortValue::Term(a), SortValue::Term(b)) => a.cmp(b),
            (a, b) => a.kind_rank().cmp(&b.kind_rank()),
        }
    }
}

impl From<NumericValue> for SortValue {
    fn from(value: NumericValue) -> Self {
        match value {
            NumericValue::Int(v) => SortValue::Int(v),
            NumericValue::Long(v) => SortValue::Long(v),
            NumericValue::Float(v) => SortValue::Float(v),
            NumericValue::Double(v) => SortValue::Double(v),
            NumericValue::Date(v) => SortValue::Date(v),
        }
    }
}

/// One matching document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoredResult {
    pub unique_id: String,
    pub score: f32,
    pub doc_id: u32,
    pub timestamp: i64,
    pub segment: u32,
    pub index_name: String,
    /// Position within the segment's page.
    pub result_index: u32,
    /// One value per requested sort field, in request order.
    #[serde(default)]
    pub sort_values: Vec<SortValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub facet: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetGroup {
    pub count_request: CountRequest,
    pub facet_counts: Vec<FacetCount>,
}

impl FacetGroup {
    pub fn count_for(&self, facet: &str) -> Option<u64> {
        self.facet_counts
            .iter()
            .find(|fc| fc.facet == facet)
            .map(|fc| fc.count)
    }
}

/// One segment's contribution to a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardResult {
    pub index_name: String,
    pub segment_number: u32,
    pub total_hits: u64,
    pub results: Vec<ScoredResult>,
    /// The result after the last one, present iff more results exist.
    #[serde(default)]
    pub next: Option<ScoredResult>,
    #[serde(default)]
    pub facet_groups: Vec<FacetGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSegmentResponse {
    pub index_name: String,
    pub segment_responses: Vec<ShardResult>,
}

/// Everything one member returns for a federated query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalQueryResponse {
    pub index_segment_responses: Vec<IndexSegmentResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastIndexResult {
    pub index_name: String,
    pub last_for_segment: Vec<ScoredResult>,
}

/// Last returned result per index per segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaginationCursor {
    pub last_index_results: Vec<LastIndexResult>,
}

impl PaginationCursor {
    pub fn is_empty(&self) -> bool {
        self.last_index_results.is_empty()
    }

    pub fn for_segment(&self, index_name: &str, segment: u32) -> Option<&ScoredResult> {
        self.last_index_results
            .iter()
            .filter(|lir| lir.index_name == index_name)
            .flat_map(|lir| lir.last_for_segment.iter())
            .find(|sr| sr.segment == segment)
    }
}

/// Cluster-wide answer to a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub total_hits: u64,
    pub results: Vec<ScoredResult>,
    pub facet_groups: Vec<FacetGroup>,
    pub last_result: PaginationCursor,
}

impl MergedResult {
    pub fn unique_ids(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.unique_id.as_str()).collect()
    }

    pub fn facet_group(&self, label: &str) -> Option<&FacetGroup> {
        self.facet_groups
            .iter()
            .find(|g| g.count_request.facet.label == label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub value: String,
    pub doc_freq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTermsResponse {
    pub terms: Vec<Term>,
    /// Last term examined; pass it as the next starting term to continue.
    #[serde(default)]
    pub last_term: Option<Term>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCountResponse {
    pub segment_number: u32,
    pub number_of_docs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNumberOfDocsResponse {
    pub number_of_docs: u64,
    pub segment_counts: Vec<SegmentCountResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMapping {
    pub index_name: String,
    pub number_of_segments: u32,
    pub segment_to_member: BTreeMap<u32, MemberId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMembersResponse {
    pub members: Vec<MemberId>,
    pub index_mappings: Vec<IndexMapping>,
}
