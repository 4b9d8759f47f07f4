//! Query evaluation over a snapshot of stored documents.

use std::cmp::Ordering;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::data::NumericValue;
use crate::query::{Occur, Query};
use crate::request::Facet;
use crate::response::SortValue;
use crate::shard::memory::StoredDocument;
use crate::shard::{IndexedDocument, ScoreDoc, SearchSpec, SortField, TopDocs};

static MISSING: SortValue = SortValue::Missing;

pub(crate) struct Searcher<'a> {
    docs: &'a [Arc<StoredDocument>],
    doc_freqs: AHashMap<String, AHashMap<String, u64>>,
}

impl<'a> Searcher<'a> {
    pub(crate) fn new(docs: &'a [Arc<StoredDocument>], query: &Query) -> Self {
        let mut wanted: AHashSet<(String, String)> = AHashSet::new();
        query.for_each_scored_term(&mut |field, term| {
            wanted.insert((field.to_string(), term.to_string()));
        });

        let mut doc_freqs: AHashMap<String, AHashMap<String, u64>> = AHashMap::new();
        for (field, term) in wanted {
            let df = docs
                .iter()
                .filter(|d| {
                    d.doc
                        .terms
                        .get(&field)
                        .is_some_and(|tokens| tokens.iter().any(|t| *t == term))
                })
                .count() as u64;
            doc_freqs.entry(field).or_default().insert(term, df);
        }

        Self { docs, doc_freqs }
    }

    fn idf(&self, field: &str, term: &str) -> f32 {
        let df = self
            .doc_freqs
            .get(field)
            .and_then(|terms| terms.get(term))
            .copied()
            .unwrap_or(0) as f32;
        let n = self.docs.len() as f32;
        1.0 + ((n + 1.0) / (df + 1.0)).ln()
    }

    /// Score of a matching document, `None` when it does not match.
    fn score(&self, query: &Query, doc: &IndexedDocument) -> Option<f32> {
        match query {
            Query::MatchAll => Some(1.0),
            Query::Term { field, term } => {
                let tf = doc.terms.get(field)?.iter().filter(|t| *t == term).count();
                if tf == 0 {
                    None
                } else {
                    Some((tf as f32).sqrt() * self.idf(field, term))
                }
            }
            Query::Prefix { field, prefix } => doc
                .terms
                .get(field)?
                .iter()
                .any(|t| t.starts_with(prefix.as_str()))
                .then_some(1.0),
            Query::Phrase { field, terms } => {
                if terms.is_empty() {
                    return None;
                }
                let tokens = doc.terms.get(field)?;
                let freq = tokens
                    .windows(terms.len())
                    .filter(|window| window.iter().zip(terms).all(|(a, b)| a == b))
                    .count();
                if freq == 0 {
                    return None;
                }
                let idf: f32 = terms.iter().map(|t| self.idf(field, t)).sum();
                Some((freq as f32).sqrt() * idf)
            }
            Query::NumericRange {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
            } => doc
                .numbers
                .get(field)?
                .iter()
                .any(|v| {
                    in_range(v, lower.as_ref(), upper.as_ref(), *include_lower, *include_upper, |a, b| {
                        a.compare(b)
                    })
                })
                .then_some(1.0),
            Query::TermRange {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
            } => doc
                .terms
                .get(field)?
                .iter()
                .any(|t| {
                    in_range(
                        t.as_str(),
                        lower.as_deref(),
                        upper.as_deref(),
                        *include_lower,
                        *include_upper,
                        |a, b| a.cmp(b),
                    )
                })
                .then_some(1.0),
            Query::Boolean {
                clauses,
                minimum_should_match,
            } => {
                let mut score = 0.0;
                let mut required = false;
                let mut optional = 0usize;
                let mut optional_matched = 0usize;
                for clause in clauses {
                    match clause.occur {
                        Occur::Must => {
                            required = true;
                            score += self.score(&clause.query, doc)?;
                        }
                        Occur::MustNot => {
                            if self.score(&clause.query, doc).is_some() {
                                return None;
                            }
                        }
                        Occur::Should => {
                            optional += 1;
                            if let Some(s) = self.score(&clause.query, doc) {
                                optional_matched += 1;
                                score += s;
                            }
                        }
                    }
                }
                if !required && optional == 0 {
                    return None;
                }
                let minimum = if required {
                    *minimum_should_match as usize
                } else {
                    (*minimum_should_match as usize).max(1)
                };
                (optional_matched >= minimum).then_some(score)
            }
            Query::Boosted { query, boost } => self.score(query, doc).map(|s| s * boost),
        }
    }

    fn matches(&self, query: &Query, doc: &IndexedDocument) -> bool {
        self.score(query, doc).is_some()
    }

    pub(crate) fn search(&self, spec: &SearchSpec<'_>) -> TopDocs {
        let qwf = spec.query;
        let mut total_hits = 0u64;
        let mut hits: Vec<ScoreDoc> = Vec::new();
        let mut counts: Vec<AHashMap<String, u64>> =
            vec![AHashMap::new(); spec.count_requests.len()];

        for stored in self.docs {
            let doc = &stored.doc;
            let Some(score) = self.score(&qwf.query, doc) else {
                continue;
            };
            if !qwf.filter_queries.iter().all(|f| self.matches(f, doc)) {
                continue;
            }

            let drilled = matches_drill_downs(doc, &qwf.drill_downs, None);
            for (i, count_request) in spec.count_requests.iter().enumerate() {
                let counted = if count_request.drill_sideways {
                    matches_drill_downs(doc, &qwf.drill_downs, Some(&count_request.facet.label))
                } else {
                    drilled
                };
                if counted {
                    count_children(&mut counts[i], doc, &count_request.facet);
                }
            }
            if !drilled {
                continue;
            }

            total_hits += 1;
            let hit = ScoreDoc {
                doc_id: stored.doc_id,
                score,
                unique_id: doc.unique_id.clone(),
                timestamp: doc.timestamp,
                sort_values: spec
                    .sort
                    .iter()
                    .map(|sf| {
                        doc.sort_values
                            .get(&sf.field)
                            .cloned()
                            .unwrap_or(SortValue::Missing)
                    })
                    .collect(),
            };
            if let Some(after) = spec.after {
                let position = compare_ranked(
                    spec.sort,
                    (hit.score, &hit.sort_values, hit.doc_id),
                    (after.score, &after.sort_values, after.doc_id),
                );
                if position != Ordering::Greater {
                    continue;
                }
            }
            hits.push(hit);
        }

        hits.sort_by(|a, b| {
            compare_ranked(
                spec.sort,
                (a.score, &a.sort_values, a.doc_id),
                (b.score, &b.sort_values, b.doc_id),
            )
        });
        hits.truncate(spec.top_n);

        let facet_counts = counts
            .into_iter()
            .map(|children| {
                let mut children: Vec<(String, u64)> = children.into_iter().collect();
                children.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                children
            })
            .collect();

        TopDocs {
            total_hits,
            score_docs: hits,
            facet_counts,
        }
    }
}

/// Segment-local ranking: `Less` ranks first. Doc id breaks ties.
pub(crate) fn compare_ranked(
    sort: &[SortField],
    a: (f32, &[SortValue], u32),
    b: (f32, &[SortValue], u32),
) -> Ordering {
    if sort.is_empty() {
        return b.0.total_cmp(&a.0).then(a.2.cmp(&b.2));
    }
    for (i, sort_field) in sort.iter().enumerate() {
        let left = a.1.get(i).unwrap_or(&MISSING);
        let right = b.1.get(i).unwrap_or(&MISSING);
        let ordering = left.compare(right);
        let ordering = if sort_field.reverse {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.2.cmp(&b.2)
}

fn in_range<T: ?Sized, F>(
    value: &T,
    lower: Option<&T>,
    upper: Option<&T>,
    include_lower: bool,
    include_upper: bool,
    cmp: F,
) -> bool
where
    F: Fn(&T, &T) -> Ordering,
{
    if let Some(lower) = lower {
        match cmp(value, lower) {
            Ordering::Less => return false,
            Ordering::Equal if !include_lower => return false,
            _ => {}
        }
    }
    if let Some(upper) = upper {
        match cmp(value, upper) {
            Ordering::Greater => return false,
            Ordering::Equal if !include_upper => return false,
            _ => {}
        }
    }
    true
}

/// Drill-downs on one dimension are OR'd, dimensions are AND'd.
fn matches_drill_downs(doc: &IndexedDocument, drill_downs: &[Facet], skip_label: Option<&str>) -> bool {
    let mut labels: Vec<&str> = drill_downs.iter().map(|d| d.label.as_str()).collect();
    labels.sort_unstable();
    labels.dedup();

    labels
        .into_iter()
        .filter(|label| Some(*label) != skip_label)
        .all(|label| {
            drill_downs
                .iter()
                .filter(|d| d.label == label)
                .any(|d| has_facet(doc, d))
        })
}

fn has_facet(doc: &IndexedDocument, facet: &Facet) -> bool {
    doc.facets
        .iter()
        .any(|f| f.label == facet.label && f.path.starts_with(&facet.path))
}

fn count_children(counts: &mut AHashMap<String, u64>, doc: &IndexedDocument, parent: &Facet) {
    let depth = parent.path.len();
    let mut seen: AHashSet<&str> = AHashSet::new();
    for facet in &doc.facets {
        if facet.label == parent.label
            && facet.path.len() > depth
            && facet.path.starts_with(&parent.path)
        {
            let child = facet.path[depth].as_str();
            if seen.insert(child) {
                *counts.entry(child.to_string()).or_insert(0) += 1;
            }
        }
    }
}
