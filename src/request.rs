//! Requests accepted by the [`IndexManager`](crate::IndexManager).
//!
//! All request types are serde-serializable so they can cross member
//! boundaries unchanged.

use serde::{Deserialize, Serialize};

use crate::data::Document;
use crate::response::PaginationCursor;

/// Operator joining query clauses that carry no explicit connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Operator {
    #[default]
    Or,
    And,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSort {
    pub sort_field: String,
    pub direction: Direction,
}

impl FieldSort {
    pub fn asc(sort_field: impl Into<String>) -> Self {
        Self {
            sort_field: sort_field.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(sort_field: impl Into<String>) -> Self {
        Self {
            sort_field: sort_field.into(),
            direction: Direction::Descending,
        }
    }
}

/// A facet dimension and a path below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Facet {
    pub label: String,
    #[serde(default)]
    pub path: Vec<String>,
}

impl Facet {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            path: Vec::new(),
        }
    }

    pub fn with_path<I, S>(label: impl Into<String>, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

/// Counts the children of a facet path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CountRequest {
    pub facet: Facet,
    /// Children kept after merging; 0 keeps all.
    #[serde(default)]
    pub max_facets: u32,
    /// Count ignoring the drill-downs on this request's own dimension.
    #[serde(default)]
    pub drill_sideways: bool,
}

impl CountRequest {
    pub fn new(facet: Facet) -> Self {
        Self {
            facet,
            max_facets: 0,
            drill_sideways: false,
        }
    }

    pub fn max_facets(mut self, max_facets: u32) -> Self {
        self.max_facets = max_facets;
        self
    }

    pub fn drill_sideways(mut self, drill_sideways: bool) -> Self {
        self.drill_sideways = drill_sideways;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetRequest {
    #[serde(default)]
    pub drill_downs: Vec<Facet>,
    #[serde(default)]
    pub count_requests: Vec<CountRequest>,
}

/// A search over one or more indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub indexes: Vec<String>,
    pub query: String,
    /// Fields searched by unfielded clauses; empty uses each index's default field.
    #[serde(default)]
    pub query_fields: Vec<String>,
    pub amount: usize,
    #[serde(default)]
    pub real_time: bool,
    #[serde(default)]
    pub last_result: Option<PaginationCursor>,
    #[serde(default)]
    pub field_sorts: Vec<FieldSort>,
    #[serde(default)]
    pub facet_request: FacetRequest,
    #[serde(default)]
    pub minimum_should_match: u32,
    #[serde(default)]
    pub default_operator: Operator,
    #[serde(default)]
    pub filter_queries: Vec<String>,
    /// Ask every segment for the full amount.
    #[serde(default)]
    pub fetch_full: bool,
}

impl QueryRequest {
    pub fn builder(query: impl Into<String>) -> QueryRequestBuilder {
        QueryRequestBuilder::new(query)
    }

    pub fn is_sorted(&self) -> bool {
        !self.field_sorts.is_empty()
    }
}

pub struct QueryRequestBuilder {
    request: QueryRequest,
}

impl QueryRequestBuilder {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            request: QueryRequest {
                indexes: Vec::new(),
                query: query.into(),
                query_fields: Vec::new(),
                amount: 10,
                real_time: false,
                last_result: None,
                field_sorts: Vec::new(),
                facet_request: FacetRequest::default(),
                minimum_should_match: 0,
                default_operator: Operator::Or,
                filter_queries: Vec::new(),
                fetch_full: false,
            },
        }
    }

    pub fn index(mut self, index_name: impl Into<String>) -> Self {
        self.request.indexes.push(index_name.into());
        self
    }

    pub fn amount(mut self, amount: usize) -> Self {
        self.request.amount = amount;
        self
    }

    pub fn real_time(mut self, real_time: bool) -> Self {
        self.request.real_time = real_time;
        self
    }

    pub fn last_result(mut self, cursor: PaginationCursor) -> Self {
        self.request.last_result = Some(cursor);
        self
    }

    pub fn sort(mut self, field_sort: FieldSort) -> Self {
        self.request.field_sorts.push(field_sort);
        self
    }

    pub fn query_field(mut self, field: impl Into<String>) -> Self {
        self.request.query_fields.push(field.into());
        self
    }

    pub fn drill_down(mut self, facet: Facet) -> Self {
        self.request.facet_request.drill_downs.push(facet);
        self
    }

    pub fn count(mut self, count_request: CountRequest) -> Self {
        self.request.facet_request.count_requests.push(count_request);
        self
    }

    pub fn minimum_should_match(mut self, minimum: u32) -> Self {
        self.request.minimum_should_match = minimum;
        self
    }

    pub fn default_operator(mut self, operator: Operator) -> Self {
        self.request.default_operator = operator;
        self
    }

    pub fn filter_query(mut self, filter: impl Into<String>) -> Self {
        self.request.filter_queries.push(filter.into());
        self
    }

    pub fn fetch_full(mut self, fetch_full: bool) -> Self {
        self.request.fetch_full = fetch_full;
        self
    }

    pub fn build(self) -> QueryRequest {
        self.request
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub index_name: String,
    pub unique_id: String,
    pub document: Document,
    /// Epoch millis; the receiving member stamps the current time when absent.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl StoreRequest {
    pub fn new(
        index_name: impl Into<String>,
        unique_id: impl Into<String>,
        document: Document,
    ) -> Self {
        Self {
            index_name: index_name.into(),
            unique_id: unique_id.into(),
            document,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub index_name: String,
    pub unique_id: String,
}

impl DeleteRequest {
    pub fn new(index_name: impl Into<String>, unique_id: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            unique_id: unique_id.into(),
        }
    }
}

/// Sorted term enumeration over one indexed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTermsRequest {
    pub index_name: String,
    pub field_name: String,
    pub amount: usize,
    /// Enumeration starts at the first term >= this one.
    #[serde(default)]
    pub starting_term: Option<String>,
    /// Terms fully matching this regex are skipped.
    #[serde(default)]
    pub term_filter: Option<String>,
    /// When set, only terms fully matching this regex are kept.
    #[serde(default)]
    pub term_match: Option<String>,
    #[serde(default)]
    pub min_doc_freq: u64,
    #[serde(default)]
    pub real_time: bool,
}

impl GetTermsRequest {
    pub fn new(index_name: impl Into<String>, field_name: impl Into<String>, amount: usize) -> Self {
        Self {
            index_name: index_name.into(),
            field_name: field_name.into(),
            amount,
            starting_term: None,
            term_filter: None,
            term_match: None,
            min_doc_freq: 0,
            real_time: false,
        }
    }

    pub fn starting_term(mut self, term: impl Into<String>) -> Self {
        self.starting_term = Some(term.into());
        self
    }

    pub fn term_filter(mut self, regex: impl Into<String>) -> Self {
        self.term_filter = Some(regex.into());
        self
    }

    pub fn term_match(mut self, regex: impl Into<String>) -> Self {
        self.term_match = Some(regex.into());
        self
    }

    pub fn min_doc_freq(mut self, min_doc_freq: u64) -> Self {
        self.min_doc_freq = min_doc_freq;
        self
    }

    pub fn real_time(mut self, real_time: bool) -> Self {
        self.real_time = real_time;
        self
    }
}
