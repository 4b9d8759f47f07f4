//! Parser for the classic query text syntax.

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::analysis::PerFieldAnalyzer;
use crate::data::NumericValue;
use crate::error::{ClusterError, Result};
use crate::query::{BooleanClause, Occur, Query};
use crate::request::Operator;

/// Pest grammar parser for query text.
#[derive(Parser)]
#[grammar = "query/parser.pest"]
struct QueryStringParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conjunction {
    None,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modifier {
    None,
    Required,
    Prohibited,
}

/// Turns query text into a [`Query`] using one index's field analyzers.
///
/// # Supported Syntax
///
/// - `rust`: term on the default field(s)
/// - `title:rust`, `title:"exact phrase"`, `title:ru*`
/// - `+must -not NOT not`, `a AND b`, `a OR b`, `(grouped OR clauses)`
/// - `price:[10 TO 20]`, `price:{* TO 5}`: ranges, typed for numeric fields
/// - `title:rust^2.5`: boost
/// - `*:*`: all documents
///
/// Terms on numeric and date fields become exact typed matches. An empty
/// query matches all documents.
///
/// # Example
///
/// ```ignore
/// let analyzer = config.per_field_analyzer();
/// let parser = QueryParser::new(&analyzer)
///     .with_default_field("title")
///     .with_default_operator(Operator::And);
/// let query = parser.parse("rust AND rating:[4 TO *]")?;
/// ```
pub struct QueryParser<'a> {
    analyzer: &'a PerFieldAnalyzer,
    default_fields: Vec<String>,
    default_operator: Operator,
    minimum_should_match: u32,
}

impl<'a> QueryParser<'a> {
    pub fn new(analyzer: &'a PerFieldAnalyzer) -> Self {
        Self {
            analyzer,
            default_fields: Vec::new(),
            default_operator: Operator::Or,
            minimum_should_match: 0,
        }
    }

    pub fn with_default_field(mut self, field: impl Into<String>) -> Self {
        self.default_fields = vec![field.into()];
        self
    }

    /// Unfielded clauses expand into a disjunction over these fields.
    pub fn with_default_fields(mut self, fields: Vec<String>) -> Self {
        self.default_fields = fields;
        self
    }

    pub fn with_default_operator(mut self, operator: Operator) -> Self {
        self.default_operator = operator;
        self
    }

    /// Applied to every boolean built from a clause list.
    pub fn with_minimum_should_match(mut self, minimum: u32) -> Self {
        self.minimum_should_match = minimum;
        self
    }

    pub fn parse(&self, text: &str) -> Result<Query> {
        if text.trim().is_empty() {
            return Ok(Query::MatchAll);
        }

        let pairs = QueryStringParser::parse(Rule::query, text)
            .map_err(|e| ClusterError::query_parse(format!("<{}>: {}", text, e)))?;

        for pair in pairs {
            if pair.as_rule() == Rule::query {
                for inner in pair.into_inner() {
                    if inner.as_rule() == Rule::clause_list {
                        return self.parse_clause_list(inner, None);
                    }
                }
            }
        }
        Ok(Query::MatchAll)
    }

    fn parse_clause_list(&self, pair: Pair<Rule>, field: Option<&str>) -> Result<Query> {
        let mut clauses: Vec<BooleanClause> = Vec::new();
        let mut conjunction = Conjunction::None;

        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::conjunction => {
                    conjunction = match inner.into_inner().next().map(|p| p.as_rule()) {
                        Some(Rule::and_op) => Conjunction::And,
                        Some(Rule::or_op) => Conjunction::Or,
                        _ => Conjunction::None,
                    };
                }
                Rule::clause => {
                    let (modifier, query) = self.parse_clause(inner, field)?;
                    self.add_clause(&mut clauses, conjunction, modifier, query);
                    conjunction = Conjunction::None;
                }
                _ => {}
            }
        }

        if clauses.len() == 1 && clauses[0].occur != Occur::MustNot {
            if let Some(clause) = clauses.pop() {
                return Ok(clause.query);
            }
        }
        Ok(Query::Boolean {
            clauses,
            minimum_should_match: self.minimum_should_match,
        })
    }

    /// Connector and modifier handling of the classic parser.
    fn add_clause(
        &self,
        clauses: &mut Vec<BooleanClause>,
        conjunction: Conjunction,
        modifier: Modifier,
        query: Query,
    ) {
        // A connector also rewrites the clause before it.
        if let Some(previous) = clauses.last_mut() {
            if previous.occur != Occur::MustNot {
                if conjunction == Conjunction::And {
                    previous.occur = Occur::Must;
                } else if conjunction == Conjunction::Or && self.default_operator == Operator::And
                {
                    previous.occur = Occur::Should;
                }
            }
        }

        let prohibited = modifier == Modifier::Prohibited;
        let required = match self.default_operator {
            Operator::Or => {
                modifier == Modifier::Required || (conjunction == Conjunction::And && !prohibited)
            }
            Operator::And => !prohibited && conjunction != Conjunction::Or,
        };

        let occur = if required {
            Occur::Must
        } else if prohibited {
            Occur::MustNot
        } else {
            Occur::Should
        };
        clauses.push(BooleanClause::new(query, occur));
    }

    fn parse_clause(&self, pair: Pair<Rule>, field_ctx: Option<&str>) -> Result<(Modifier, Query)> {
        let mut modifier = Modifier::None;
        let mut field = field_ctx.map(str::to_string);
        let mut query = None;
        let mut boost = None;

        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::modifier => {
                    modifier = match inner.into_inner().next().map(|p| p.as_rule()) {
                        Some(Rule::plus) => Modifier::Required,
                        Some(Rule::minus) | Some(Rule::not_op) => Modifier::Prohibited,
                        _ => Modifier::None,
                    };
                }
                Rule::field_prefix => {
                    for fp_inner in inner.into_inner() {
                        if fp_inner.as_rule() == Rule::field_name {
                            field = Some(fp_inner.as_str().to_string());
                        }
                    }
                }
                Rule::group => {
                    for group_inner in inner.into_inner() {
                        if group_inner.as_rule() == Rule::clause_list {
                            query = Some(self.parse_clause_list(group_inner, field.as_deref())?);
                        }
                    }
                }
                Rule::range => {
                    query = Some(self.parse_range(inner, field.as_deref())?);
                }
                Rule::phrase => {
                    let text = phrase_text(inner);
                    query = Some(self.on_fields(field.as_deref(), |f| self.phrase_query(f, &text))?);
                }
                Rule::term => {
                    let text = inner.as_str();
                    if field.as_deref() == Some("*") && text == "*" {
                        query = Some(Query::MatchAll);
                    } else {
                        query = Some(self.on_fields(field.as_deref(), |f| self.term_query(f, text))?);
                    }
                }
                Rule::boost => {
                    for b_inner in inner.into_inner() {
                        if b_inner.as_rule() == Rule::boost_value {
                            boost = Some(b_inner.as_str().parse::<f32>().map_err(|e| {
                                ClusterError::query_parse(format!(
                                    "Invalid boost <{}>: {}",
                                    b_inner.as_str(),
                                    e
                                ))
                            })?);
                        }
                    }
                }
                _ => {}
            }
        }

        let query = query.ok_or_else(|| ClusterError::query_parse("Clause without a query"))?;
        let query = match boost {
            Some(boost) => Query::Boosted {
                query: Box::new(query),
                boost,
            },
            None => query,
        };
        Ok((modifier, query))
    }

    /// Builds the clause against an explicit field or every default field.
    fn on_fields<F>(&self, field: Option<&str>, build: F) -> Result<Query>
    where
        F: Fn(&str) -> Result<Query>,
    {
        if let Some(field) = field {
            return build(field);
        }
        match self.default_fields.as_slice() {
            [] => Err(ClusterError::query_parse(
                "Clause has no field and no default field is configured",
            )),
            [single] => build(single),
            fields => {
                let clauses = fields
                    .iter()
                    .map(|f| build(f).map(BooleanClause::should))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Query::boolean(clauses))
            }
        }
    }

    fn numeric(&self, field: &str, text: &str) -> Result<Option<NumericValue>> {
        match self.analyzer.numeric_type(field) {
            Some(numeric_type) => NumericValue::parse(text, numeric_type)
                .map(Some)
                .ok_or_else(|| {
                    ClusterError::query_parse(format!(
                        "<{}> is not a valid {:?} value for field <{}>",
                        text, numeric_type, field
                    ))
                }),
            None => Ok(None),
        }
    }

    fn term_query(&self, field: &str, text: &str) -> Result<Query> {
        if let Some(value) = self.numeric(field, text)? {
            return Ok(Query::numeric_exact(field, value));
        }

        if let Some(prefix) = text.strip_suffix('*') {
            if !prefix.contains('*') {
                return Ok(Query::Prefix {
                    field: field.to_string(),
                    prefix: self.analyzer.analyzer(field).normalize(prefix),
                });
            }
        }

        let mut tokens = self.analyzer.analyze(field, text);
        match tokens.len() {
            0 => Ok(Query::match_none()),
            1 => Ok(Query::term(field, tokens.remove(0))),
            _ => {
                let occur = match self.default_operator {
                    Operator::And => Occur::Must,
                    Operator::Or => Occur::Should,
                };
                Ok(Query::boolean(
                    tokens
                        .into_iter()
                        .map(|t| BooleanClause::new(Query::term(field, t), occur))
                        .collect(),
                ))
            }
        }
    }

    fn phrase_query(&self, field: &str, text: &str) -> Result<Query> {
        if let Some(value) = self.numeric(field, text)? {
            return Ok(Query::numeric_exact(field, value));
        }

        let mut tokens = self.analyzer.analyze(field, text);
        match tokens.len() {
            0 => Ok(Query::match_none()),
            1 => Ok(Query::term(field, tokens.remove(0))),
            _ => Ok(Query::Phrase {
                field: field.to_string(),
                terms: tokens,
            }),
        }
    }

    fn parse_range(&self, pair: Pair<Rule>, field: Option<&str>) -> Result<Query> {
        let mut include_lower = true;
        let mut include_upper = true;
        let mut bounds: Vec<Option<String>> = Vec::with_capacity(2);

        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::range_open => include_lower = inner.as_str() == "[",
                Rule::range_close => include_upper = inner.as_str() == "]",
                Rule::range_value => bounds.push(range_bound(inner)),
                _ => {}
            }
        }

        let (lower, upper) = match (bounds.first(), bounds.get(1)) {
            (Some(lower), Some(upper)) => (lower.clone(), upper.clone()),
            _ => return Err(ClusterError::query_parse("Range needs two bounds")),
        };

        self.on_fields(field, |f| {
            if self.analyzer.numeric_type(f).is_some() {
                let lower = match &lower {
                    Some(text) => self.numeric(f, text)?,
                    None => None,
                };
                let upper = match &upper {
                    Some(text) => self.numeric(f, text)?,
                    None => None,
                };
                Ok(Query::NumericRange {
                    field: f.to_string(),
                    lower,
                    upper,
                    include_lower,
                    include_upper,
                })
            } else {
                let analyzer = self.analyzer.analyzer(f);
                Ok(Query::TermRange {
                    field: f.to_string(),
                    lower: lower.as_deref().map(|t| analyzer.normalize(t)),
                    upper: upper.as_deref().map(|t| analyzer.normalize(t)),
                    include_lower,
                    include_upper,
                })
            }
        })
    }
}

fn phrase_text(pair: Pair<Rule>) -> String {
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::phrase_text)
        .map(|p| p.as_str().to_string())
        .unwrap_or_default()
}

/// `None` for an open (`*`) bound.
fn range_bound(pair: Pair<Rule>) -> Option<String> {
    let inner = pair.into_inner().next()?;
    match inner.as_rule() {
        Rule::open_bound => None,
        Rule::phrase => Some(phrase_text(inner)),
        _ => Some(inner.as_str().to_string()),
    }
}
