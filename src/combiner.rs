//! Merges per-segment query responses into one page.
//!
//! [`ResultCombiner::combine`] validates that every segment of every
//! queried index answered exactly once, sums hits and facet counts, ranks
//! the concatenated results with [`ResultComparator`], and reports whether
//! a segment held back a result that should have made the page.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};

use crate::config::IndexConfig;
use crate::error::{ClusterError, Result};
use crate::request::{CountRequest, Direction, FieldSort, QueryRequest};
use crate::response::{
    FacetCount, FacetGroup, InternalQueryResponse, LastIndexResult, MergedResult,
    PaginationCursor, ScoredResult, ShardResult, SortValue,
};

/// Shard results by index, then by segment number.
pub type SegmentResponseMap = BTreeMap<String, BTreeMap<u32, ShardResult>>;

/// Rank order of results: `Less` when the left result ranks first.
///
/// Without field sorts results rank by descending score. With field sorts
/// the first field that differs decides, honoring its direction.
#[derive(Debug, Clone, Copy)]
pub struct ResultComparator<'a> {
    field_sorts: &'a [FieldSort],
}

impl<'a> ResultComparator<'a> {
    pub fn new(field_sorts: &'a [FieldSort]) -> Self {
        Self { field_sorts }
    }

    pub fn is_sorting(&self) -> bool {
        !self.field_sorts.is_empty()
    }

    pub fn compare(&self, a: &ScoredResult, b: &ScoredResult) -> Ordering {
        if self.field_sorts.is_empty() {
            return b.score.total_cmp(&a.score);
        }
        for (i, field_sort) in self.field_sorts.iter().enumerate() {
            let left = a.sort_values.get(i).unwrap_or(&SortValue::Missing);
            let right = b.sort_values.get(i).unwrap_or(&SortValue::Missing);
            let ordering = match field_sort.direction {
                Direction::Ascending => left.compare(right),
                Direction::Descending => right.compare(left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Checks that the responses cover every segment of every queried index exactly once.
pub fn validate(
    responses: Vec<InternalQueryResponse>,
    configs: &BTreeMap<String, Arc<IndexConfig>>,
) -> Result<SegmentResponseMap> {
    let mut by_index = SegmentResponseMap::new();
    for response in responses {
        for index_response in response.index_segment_responses {
            let index_name = index_response.index_name;
            let segments = by_index.entry(index_name.clone()).or_default();
            for shard_result in index_response.segment_responses {
                let segment_number = shard_result.segment_number;
                if segments.insert(segment_number, shard_result).is_some() {
                    return Err(ClusterError::inconsistent(format!(
                        "Segment <{}> is repeated for <{}>",
                        segment_number, index_name
                    )));
                }
            }
        }
    }

    for (index_name, config) in configs {
        let segments = by_index.get(index_name).ok_or_else(|| {
            ClusterError::inconsistent(format!("Missing index <{}> in response", index_name))
        })?;
        if segments.len() != config.number_of_segments as usize {
            return Err(ClusterError::inconsistent(format!(
                "Found <{}> segments for <{}>, expected <{}>",
                segments.len(),
                index_name,
                config.number_of_segments
            )));
        }
        for segment_number in 0..config.number_of_segments {
            if !segments.contains_key(&segment_number) {
                return Err(ClusterError::inconsistent(format!(
                    "Missing segment <{}> for <{}>",
                    segment_number, index_name
                )));
            }
        }
    }

    if let Some(extra) = by_index.keys().find(|name| !configs.contains_key(*name)) {
        return Err(ClusterError::inconsistent(format!(
            "Unexpected index <{}> in response",
            extra
        )));
    }
    Ok(by_index)
}

/// Combines the federated responses of one query.
pub struct ResultCombiner<'a> {
    request: &'a QueryRequest,
    configs: &'a BTreeMap<String, Arc<IndexConfig>>,
}

impl<'a> ResultCombiner<'a> {
    /// `configs` holds the config of every queried index.
    pub fn new(request: &'a QueryRequest, configs: &'a BTreeMap<String, Arc<IndexConfig>>) -> Self {
        Self { request, configs }
    }

    /// Returns the merged page and whether it may be short.
    pub fn combine(&self, responses: Vec<InternalQueryResponse>) -> Result<(MergedResult, bool)> {
        // 1. Validate completeness
        let by_index = validate(responses, self.configs)?;
        self.check_sort_types()?;
        let comparator = ResultComparator::new(&self.request.field_sorts);

        // 2. Merge facets
        let facet_groups = self.merge_facets(&by_index);

        // 3. Merge and rank documents
        let mut total_hits = 0;
        let mut merged = Vec::new();
        let mut next_by_index: BTreeMap<&str, Vec<&ScoredResult>> = BTreeMap::new();
        for (index_name, segments) in &by_index {
            let nexts = next_by_index.entry(index_name.as_str()).or_default();
            for shard_result in segments.values() {
                total_hits += shard_result.total_hits;
                merged.extend(shard_result.results.iter().cloned());
                if let Some(next) = &shard_result.next {
                    nexts.push(next);
                }
            }
        }
        merged.sort_by(|a, b| comparator.compare(a, b));
        merged.truncate(self.request.amount);

        // 4. Advance the cursor and look for held back results
        let mut last_by_index = self.seed_cursor()?;
        for result in &merged {
            if let Some(lasts) = last_by_index.get_mut(&result.index_name) {
                lasts.insert(result.segment, result.clone());
            }
        }

        // a page with room left while some segment still holds results is short
        let held_back = next_by_index.values().map(Vec::len).sum::<usize>();
        let mut is_short = merged.len() < self.request.amount && held_back > 0;
        if is_short {
            warn!(
                "Page of {} results for amount {} leaves {} segments with more results for <{}>",
                merged.len(),
                self.request.amount,
                held_back,
                self.request.query
            );
        }
        for (index_name, lasts) in &last_by_index {
            if is_short {
                break;
            }
            let Some(floor) = lasts
                .values()
                .max_by(|a, b| comparator.compare(a, b))
            else {
                continue;
            };
            let tolerance = self.configs[index_name].settings.segment_tolerance;
            let nexts = next_by_index.get(index_name.as_str()).map_or(&[][..], Vec::as_slice);
            if nexts
                .iter()
                .any(|next| self.is_held_back(&comparator, floor, next, tolerance))
            {
                is_short = true;
                break;
            }
        }

        // 5. Emit
        let last_result = PaginationCursor {
            last_index_results: last_by_index
                .into_iter()
                .filter(|(_, lasts)| !lasts.is_empty())
                .map(|(index_name, lasts)| LastIndexResult {
                    index_name,
                    last_for_segment: lasts.into_values().collect(),
                })
                .collect(),
        };

        debug!(
            "Combined {} results of {} total hits for <{}>",
            merged.len(),
            total_hits,
            self.request.query
        );

        Ok((
            MergedResult {
                total_hits,
                results: merged,
                facet_groups,
                last_result,
            },
            is_short,
        ))
    }

    /// A segment's next result that outranks the page floor means the page is incomplete.
    fn is_held_back(
        &self,
        comparator: &ResultComparator<'_>,
        floor: &ScoredResult,
        next: &ScoredResult,
        tolerance: f64,
    ) -> bool {
        if comparator.compare(floor, next) != Ordering::Greater {
            return false;
        }
        if comparator.is_sorting() {
            warn!(
                "Segment <{}> of <{}> held back sorted result <{}> ahead of <{}> from segment <{}>",
                next.segment, next.index_name, next.unique_id, floor.unique_id, floor.segment
            );
            return true;
        }
        let diff = (f64::from(floor.score) - f64::from(next.score)).abs();
        if diff > tolerance {
            warn!(
                "Segment <{}> of <{}> held back score <{}> above floor <{}> with tolerance <{}> for query <{}>",
                next.segment, next.index_name, next.score, floor.score, tolerance, self.request.query
            );
            return true;
        }
        false
    }

    /// Last result per segment from the request cursor.
    fn seed_cursor(&self) -> Result<BTreeMap<String, BTreeMap<u32, ScoredResult>>> {
        let mut last_by_index: BTreeMap<String, BTreeMap<u32, ScoredResult>> = self
            .configs
            .keys()
            .map(|name| (name.clone(), BTreeMap::new()))
            .collect();

        let Some(cursor) = &self.request.last_result else {
            return Ok(last_by_index);
        };
        for last_index_result in &cursor.last_index_results {
            let index_name = &last_index_result.index_name;
            let config = self.configs.get(index_name).ok_or_else(|| {
                ClusterError::invalid_argument(format!(
                    "Pagination cursor references index <{}> which is not queried",
                    index_name
                ))
            })?;
            let lasts = last_by_index.entry(index_name.clone()).or_default();
            for result in &last_index_result.last_for_segment {
                if result.segment >= config.number_of_segments {
                    return Err(ClusterError::invalid_argument(format!(
                        "Pagination cursor references segment <{}> of <{}> with <{}> segments",
                        result.segment, index_name, config.number_of_segments
                    )));
                }
                lasts.insert(result.segment, result.clone());
            }
        }
        Ok(last_by_index)
    }

    /// Sort fields must have one type across every queried index.
    fn check_sort_types(&self) -> Result<()> {
        for field_sort in &self.request.field_sorts {
            let mut types = self
                .configs
                .values()
                .map(|config| config.sort_type(&field_sort.sort_field));
            if let Some(first) = types.next() {
                if let Some(other) = types.find(|t| *t != first) {
                    return Err(ClusterError::invalid_argument(format!(
                        "Cannot sort on field <{}>: found type <{:?}> then type <{:?}>",
                        field_sort.sort_field, first, other
                    )));
                }
            }
        }
        Ok(())
    }

    fn merge_facets(&self, by_index: &SegmentResponseMap) -> Vec<FacetGroup> {
        let count_requests = &self.request.facet_request.count_requests;
        let mut groups = Vec::with_capacity(count_requests.len());
        for count_request in count_requests {
            let mut totals: AHashMap<&str, u64> = AHashMap::new();
            for shard_result in by_index.values().flat_map(|segments| segments.values()) {
                for group in shard_result
                    .facet_groups
                    .iter()
                    .filter(|g| &g.count_request == count_request)
                {
                    for facet_count in &group.facet_counts {
                        *totals.entry(facet_count.facet.as_str()).or_default() += facet_count.count;
                    }
                }
            }
            groups.push(Self::facet_group(count_request, totals));
        }
        groups
    }

    fn facet_group(count_request: &CountRequest, totals: AHashMap<&str, u64>) -> FacetGroup {
        let mut facet_counts: Vec<FacetCount> = totals
            .into_iter()
            .map(|(facet, count)| FacetCount {
                facet: facet.to_string(),
                count,
            })
            .collect();
        facet_counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.facet.cmp(&b.facet)));
        if count_request.max_facets > 0 {
            facet_counts.truncate(count_request.max_facets as usize);
        }
        FacetGroup {
            count_request: count_request.clone(),
            facet_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldConfig, SortType};
    use crate::request::Facet;
    use crate::response::IndexSegmentResponse;

    fn configs(segments: u32, tolerance: f64) -> BTreeMap<String, Arc<IndexConfig>> {
        let config = IndexConfig::builder("docs", segments, "id")
            .add_field(
                FieldConfig::builder("rank")
                    .sort_as(SortType::NumericLong)
                    .build(),
            )
            .segment_tolerance(tolerance)
            .build();
        BTreeMap::from([("docs".to_string(), Arc::new(config))])
    }

    fn hit(segment: u32, id: &str, score: f32) -> ScoredResult {
        ScoredResult {
            unique_id: id.to_string(),
            score,
            segment,
            index_name: "docs".to_string(),
            ..Default::default()
        }
    }

    fn sorted_hit(segment: u32, id: &str, rank: i64) -> ScoredResult {
        ScoredResult {
            sort_values: vec![SortValue::Long(rank)],
            ..hit(segment, id, 1.0)
        }
    }

    fn shard(segment: u32, results: Vec<ScoredResult>, next: Option<ScoredResult>) -> ShardResult {
        ShardResult {
            index_name: "docs".to_string(),
            segment_number: segment,
            total_hits: (results.len() + usize::from(next.is_some())) as u64,
            results,
            next,
            facet_groups: Vec::new(),
        }
    }

    fn response(shards: Vec<ShardResult>) -> InternalQueryResponse {
        InternalQueryResponse {
            index_segment_responses: vec![IndexSegmentResponse {
                index_name: "docs".to_string(),
                segment_responses: shards,
            }],
        }
    }

    fn request(amount: usize) -> QueryRequest {
        QueryRequest::builder("*:*").index("docs").amount(amount).build()
    }

    #[test]
    fn test_validation_errors() {
        let configs = configs(2, 0.05);
        let cases = vec![
            (
                vec![response(vec![shard(0, vec![], None)]), response(vec![shard(0, vec![], None)])],
                "repeated",
            ),
            (vec![response(vec![shard(0, vec![], None)])], "expected <2>"),
            (
                vec![response(vec![shard(0, vec![], None), shard(2, vec![], None)])],
                "Missing segment <1>",
            ),
            (vec![], "Missing index"),
        ];
        for (responses, expected) in cases {
            match validate(responses, &configs) {
                Err(ClusterError::InconsistentResponse(msg)) => {
                    assert!(msg.contains(expected), "{} does not mention {}", msg, expected)
                }
                other => panic!("expected inconsistent response, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_merge_equals_sorted_concatenation() {
        let configs = configs(3, 0.05);
        let segments = vec![
            vec![hit(0, "a", 9.0), hit(0, "b", 4.0), hit(0, "c", 1.0)],
            vec![hit(1, "d", 8.0), hit(1, "e", 7.5)],
            vec![hit(2, "f", 6.0), hit(2, "g", 5.0), hit(2, "h", 0.5)],
        ];
        let mut expected: Vec<ScoredResult> = segments.iter().flatten().cloned().collect();
        expected.sort_by(|a, b| b.score.total_cmp(&a.score));
        expected.truncate(4);

        let shards = segments
            .into_iter()
            .enumerate()
            .map(|(i, results)| shard(i as u32, results, None))
            .collect();
        let request = request(4);
        let (merged, is_short) = ResultCombiner::new(&request, &configs)
            .combine(vec![response(shards)])
            .unwrap();

        assert_eq!(merged.results, expected);
        assert_eq!(merged.total_hits, 8);
        assert!(!is_short);
        assert_eq!(merged.unique_ids(), vec!["a", "d", "e", "f"]);
    }

    #[test]
    fn test_sorted_merge_and_cursor() {
        let configs = configs(2, 0.05);
        let mut request = request(2);
        request.field_sorts = vec![FieldSort::desc("rank")];

        let shards = vec![
            shard(0, vec![sorted_hit(0, "a", 10), sorted_hit(0, "b", 3)], None),
            shard(1, vec![sorted_hit(1, "c", 7)], None),
        ];
        let (merged, is_short) = ResultCombiner::new(&request, &configs)
            .combine(vec![response(shards)])
            .unwrap();
        assert_eq!(merged.unique_ids(), vec!["a", "c"]);
        assert!(!is_short);
        assert_eq!(merged.last_result.for_segment("docs", 0).unwrap().unique_id, "a");
        assert_eq!(merged.last_result.for_segment("docs", 1).unwrap().unique_id, "c");
    }

    #[test]
    fn test_cursor_keeps_segments_without_new_results() {
        let configs = configs(2, 0.05);
        let cursor = PaginationCursor {
            last_index_results: vec![LastIndexResult {
                index_name: "docs".to_string(),
                last_for_segment: vec![hit(0, "a", 9.0), hit(1, "b", 8.0)],
            }],
        };
        let mut request = request(1);
        request.last_result = Some(cursor);

        let shards = vec![shard(0, vec![hit(0, "c", 7.0)], None), shard(1, vec![], None)];
        let (merged, _) = ResultCombiner::new(&request, &configs)
            .combine(vec![response(shards)])
            .unwrap();
        assert_eq!(merged.last_result.for_segment("docs", 0).unwrap().unique_id, "c");
        assert_eq!(merged.last_result.for_segment("docs", 1).unwrap().unique_id, "b");
    }

    #[test]
    fn test_cursor_for_unknown_index_is_rejected() {
        let configs = configs(1, 0.05);
        let mut request = request(1);
        request.last_result = Some(PaginationCursor {
            last_index_results: vec![LastIndexResult {
                index_name: "other".to_string(),
                last_for_segment: vec![],
            }],
        });
        let result = ResultCombiner::new(&request, &configs)
            .combine(vec![response(vec![shard(0, vec![], None)])]);
        assert!(matches!(result, Err(ClusterError::InvalidArgument(_))));
    }

    #[test]
    fn test_facets_are_summed_sorted_and_truncated() {
        let configs = configs(2, 0.05);
        let count_request = CountRequest::new(Facet::new("color")).max_facets(2);
        let mut request = request(10);
        request.facet_request.count_requests = vec![count_request.clone()];

        let group = |counts: &[(&str, u64)]| FacetGroup {
            count_request: count_request.clone(),
            facet_counts: counts
                .iter()
                .map(|(facet, count)| FacetCount {
                    facet: facet.to_string(),
                    count: *count,
                })
                .collect(),
        };
        let mut s0 = shard(0, vec![], None);
        s0.facet_groups = vec![group(&[("red", 3), ("blue", 1), ("green", 2)])];
        let mut s1 = shard(1, vec![], None);
        s1.facet_groups = vec![group(&[("blue", 2), ("green", 1)])];

        let (merged, _) = ResultCombiner::new(&request, &configs)
            .combine(vec![response(vec![s0, s1])])
            .unwrap();
        let facets: Vec<(&str, u64)> = merged.facet_groups[0]
            .facet_counts
            .iter()
            .map(|fc| (fc.facet.as_str(), fc.count))
            .collect();
        // blue and green tie at 3 with red; ties go by label
        assert_eq!(facets, vec![("blue", 3), ("green", 3)]);
    }

    #[test]
    fn test_held_back_score_beyond_tolerance_is_short() {
        let configs = configs(2, 0.5);
        let request = request(4);
        let shards = |next_score: f32| {
            vec![
                shard(0, vec![hit(0, "a", 10.0), hit(0, "b", 9.0), hit(0, "e", 3.0)], None),
                shard(1, vec![hit(1, "c", 8.0)], Some(hit(1, "d", next_score))),
            ]
        };

        let (merged, is_short) = ResultCombiner::new(&request, &configs)
            .combine(vec![response(shards(2.0))])
            .unwrap();
        assert_eq!(merged.unique_ids(), vec!["a", "b", "c", "e"]);
        assert!(!is_short, "below the floor");

        let (_, is_short) = ResultCombiner::new(&request, &configs)
            .combine(vec![response(shards(3.2))])
            .unwrap();
        assert!(!is_short, "within tolerance");

        let (_, is_short) = ResultCombiner::new(&request, &configs)
            .combine(vec![response(shards(5.0))])
            .unwrap();
        assert!(is_short, "beyond tolerance");
    }

    #[test]
    fn test_held_back_sorted_result_is_short() {
        let configs = configs(2, 100.0);
        let mut request = request(2);
        request.field_sorts = vec![FieldSort::desc("rank")];

        let shards = vec![
            shard(0, vec![sorted_hit(0, "a", 10), sorted_hit(0, "b", 2)], None),
            shard(1, vec![], Some(sorted_hit(1, "c", 5))),
        ];
        let (_, is_short) = ResultCombiner::new(&request, &configs)
            .combine(vec![response(shards)])
            .unwrap();
        assert!(is_short);
    }

    #[test]
    fn test_underfilled_page_with_held_back_results_is_short() {
        let configs = configs(2, 0.05);
        let mut request = request(4);
        request.field_sorts = vec![FieldSort::desc("rank")];

        // segment 0 is exhausted, segment 1 was cut off after two results
        let shards = vec![
            shard(0, vec![sorted_hit(0, "b", 100)], None),
            shard(
                1,
                vec![sorted_hit(1, "k", 6), sorted_hit(1, "i", 5)],
                Some(sorted_hit(1, "g", 4)),
            ),
        ];
        let (merged, is_short) = ResultCombiner::new(&request, &configs)
            .combine(vec![response(shards)])
            .unwrap();
        assert_eq!(merged.unique_ids(), vec!["b", "k", "i"]);
        assert!(is_short);

        // the same page with every segment exhausted is complete
        let shards = vec![
            shard(0, vec![sorted_hit(0, "b", 100)], None),
            shard(1, vec![sorted_hit(1, "k", 6), sorted_hit(1, "i", 5)], None),
        ];
        let (_, is_short) = ResultCombiner::new(&request, &configs)
            .combine(vec![response(shards)])
            .unwrap();
        assert!(!is_short);
    }

    #[test]
    fn test_mismatched_sort_types_are_rejected() {
        let mut configs = configs(1, 0.05);
        let other = IndexConfig::builder("other", 1, "id")
            .add_field(FieldConfig::builder("rank").sort_as(SortType::String).build())
            .build();
        configs.insert("other".to_string(), Arc::new(other));

        let mut request = request(1);
        request.field_sorts = vec![FieldSort::asc("rank")];
        let responses = vec![
            response(vec![shard(0, vec![], None)]),
            InternalQueryResponse {
                index_segment_responses: vec![IndexSegmentResponse {
                    index_name: "other".to_string(),
                    segment_responses: vec![ShardResult {
                        index_name: "other".to_string(),
                        ..Default::default()
                    }],
                }],
            },
        ];
        let result = ResultCombiner::new(&request, &configs).combine(responses);
        assert!(matches!(result, Err(ClusterError::InvalidArgument(_))));
    }
}
