//! Query model evaluated by the local shards.

pub mod parser;

use crate::data::NumericValue;
use crate::request::Facet;

pub use parser::QueryParser;

/// Occurrence requirements for boolean clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    /// The clause must match (equivalent to AND).
    Must,
    /// The clause should match (equivalent to OR).
    Should,
    /// The clause must not match (equivalent to NOT).
    MustNot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BooleanClause {
    pub query: Query,
    pub occur: Occur,
}

impl BooleanClause {
    pub fn new(query: Query, occur: Occur) -> Self {
        Self { query, occur }
    }

    pub fn must(query: Query) -> Self {
        Self::new(query, Occur::Must)
    }

    pub fn should(query: Query) -> Self {
        Self::new(query, Occur::Should)
    }

    pub fn must_not(query: Query) -> Self {
        Self::new(query, Occur::MustNot)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    MatchAll,
    Term {
        field: String,
        term: String,
    },
    Prefix {
        field: String,
        prefix: String,
    },
    /// Terms at consecutive positions.
    Phrase {
        field: String,
        terms: Vec<String>,
    },
    NumericRange {
        field: String,
        lower: Option<NumericValue>,
        upper: Option<NumericValue>,
        include_lower: bool,
        include_upper: bool,
    },
    TermRange {
        field: String,
        lower: Option<String>,
        upper: Option<String>,
        include_lower: bool,
        include_upper: bool,
    },
    /// A boolean with no required or optional clause matches nothing.
    Boolean {
        clauses: Vec<BooleanClause>,
        minimum_should_match: u32,
    },
    Boosted {
        query: Box<Query>,
        boost: f32,
    },
}

impl Query {
    pub fn term(field: impl Into<String>, term: impl Into<String>) -> Self {
        Query::Term {
            field: field.into(),
            term: term.into(),
        }
    }

    pub fn numeric_exact(field: impl Into<String>, value: NumericValue) -> Self {
        Query::NumericRange {
            field: field.into(),
            lower: Some(value),
            upper: Some(value),
            include_lower: true,
            include_upper: true,
        }
    }

    pub fn boolean(clauses: Vec<BooleanClause>) -> Self {
        Query::Boolean {
            clauses,
            minimum_should_match: 0,
        }
    }

    pub fn match_none() -> Self {
        Query::boolean(Vec::new())
    }

    /// Visits every (field, term) pair that contributes to scoring.
    pub fn for_each_scored_term<F: FnMut(&str, &str)>(&self, f: &mut F) {
        match self {
            Query::Term { field, term } => f(field, term),
            Query::Phrase { field, terms } => {
                for term in terms {
                    f(field, term);
                }
            }
            Query::Boolean { clauses, .. } => {
                for clause in clauses {
                    if clause.occur != Occur::MustNot {
                        clause.query.for_each_scored_term(f);
                    }
                }
            }
            Query::Boosted { query, .. } => query.for_each_scored_term(f),
            _ => {}
        }
    }
}

/// Everything a segment needs to run one index's part of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryWithFilters {
    pub query: Query,
    /// Conjunctive, non-scoring.
    pub filter_queries: Vec<Query>,
    pub drill_downs: Vec<Facet>,
}

impl QueryWithFilters {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            filter_queries: Vec::new(),
            drill_downs: Vec::new(),
        }
    }
}
