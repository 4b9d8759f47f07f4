//! Per-field text analysis.
//!
//! Analysis is an opaque lookup from an indexed field to a text transform.
//! The analyzers here are intentionally small: keyword, whitespace and a
//! Unicode word splitter with optional ASCII folding and stop words.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;
use unicode_segmentation::UnicodeSegmentation;

use crate::data::NumericType;

/// English stop words removed by the standard analyzers.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

/// Turns field text into index terms.
pub trait Analyzer: Send + Sync + std::fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Splits and transforms text into terms, in order.
    fn analyze(&self, text: &str) -> Vec<String>;

    /// Normalizes a single term that bypasses tokenization (prefixes, range bounds).
    fn normalize(&self, term: &str) -> String {
        term.to_string()
    }
}

/// Analyzer (or typed indexing) assigned to an indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    Keyword,
    LcKeyword,
    Whitespace,
    LcWhitespace,
    Standard,
    StandardFolding,
    StandardNoStop,
    StandardFoldingNoStop,
    NumericInt,
    NumericLong,
    NumericFloat,
    NumericDouble,
    Date,
}

impl AnalyzerKind {
    /// Typed kinds index values rather than terms.
    pub fn numeric_type(&self) -> Option<NumericType> {
        match self {
            AnalyzerKind::NumericInt => Some(NumericType::Int),
            AnalyzerKind::NumericLong => Some(NumericType::Long),
            AnalyzerKind::NumericFloat => Some(NumericType::Float),
            AnalyzerKind::NumericDouble => Some(NumericType::Double),
            AnalyzerKind::Date => Some(NumericType::Date),
            _ => None,
        }
    }

    pub fn analyzer(&self) -> Arc<dyn Analyzer> {
        match self {
            AnalyzerKind::Keyword
            | AnalyzerKind::NumericInt
            | AnalyzerKind::NumericLong
            | AnalyzerKind::NumericFloat
            | AnalyzerKind::NumericDouble
            | AnalyzerKind::Date => Arc::new(KeywordAnalyzer { lowercase: false }),
            AnalyzerKind::LcKeyword => Arc::new(KeywordAnalyzer { lowercase: true }),
            AnalyzerKind::Whitespace => Arc::new(WhitespaceAnalyzer { lowercase: false }),
            AnalyzerKind::LcWhitespace => Arc::new(WhitespaceAnalyzer { lowercase: true }),
            AnalyzerKind::Standard => Arc::new(StandardAnalyzer::new(false, true)),
            AnalyzerKind::StandardFolding => Arc::new(StandardAnalyzer::new(true, true)),
            AnalyzerKind::StandardNoStop => Arc::new(StandardAnalyzer::new(false, false)),
            AnalyzerKind::StandardFoldingNoStop => Arc::new(StandardAnalyzer::new(true, false)),
        }
    }
}

/// Emits the whole input as one term.
#[derive(Debug, Clone)]
pub struct KeywordAnalyzer {
    lowercase: bool,
}

impl Analyzer for KeywordAnalyzer {
    fn name(&self) -> &'static str {
        if self.lowercase { "lc_keyword" } else { "keyword" }
    }

    fn analyze(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        vec![self.normalize(text)]
    }

    fn normalize(&self, term: &str) -> String {
        if self.lowercase {
            term.to_lowercase()
        } else {
            term.to_string()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WhitespaceAnalyzer {
    lowercase: bool,
}

impl Analyzer for WhitespaceAnalyzer {
    fn name(&self) -> &'static str {
        if self.lowercase {
            "lc_whitespace"
        } else {
            "whitespace"
        }
    }

    fn analyze(&self, text: &str) -> Vec<String> {
        text.split_whitespace().map(|t| self.normalize(t)).collect()
    }

    fn normalize(&self, term: &str) -> String {
        if self.lowercase {
            term.to_lowercase()
        } else {
            term.to_string()
        }
    }
}

/// Unicode word segmentation, lowercasing, optional folding and stop words.
#[derive(Debug, Clone)]
pub struct StandardAnalyzer {
    folding: bool,
    stop_words: bool,
}

impl StandardAnalyzer {
    pub fn new(folding: bool, stop_words: bool) -> Self {
        Self {
            folding,
            stop_words,
        }
    }
}

impl Analyzer for StandardAnalyzer {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn analyze(&self, text: &str) -> Vec<String> {
        text.unicode_words()
            .map(|w| self.normalize(w))
            .filter(|w| !(self.stop_words && STOP_WORDS.contains(&w.as_str())))
            .collect()
    }

    fn normalize(&self, term: &str) -> String {
        let lower = term.to_lowercase();
        if self.folding {
            lower.nfkd().filter(|c| !is_combining_mark(*c)).collect()
        } else {
            lower
        }
    }
}

/// Looks up the analyzer for each indexed field, with a fallback.
#[derive(Debug, Clone)]
pub struct PerFieldAnalyzer {
    default: Arc<dyn Analyzer>,
    fields: HashMap<String, (AnalyzerKind, Arc<dyn Analyzer>)>,
}

impl PerFieldAnalyzer {
    pub fn new(default: Arc<dyn Analyzer>) -> Self {
        Self {
            default,
            fields: HashMap::new(),
        }
    }

    pub fn add(&mut self, field: impl Into<String>, kind: AnalyzerKind) {
        self.fields.insert(field.into(), (kind, kind.analyzer()));
    }

    pub fn analyzer(&self, field: &str) -> &Arc<dyn Analyzer> {
        self.fields
            .get(field)
            .map(|(_, analyzer)| analyzer)
            .unwrap_or(&self.default)
    }

    pub fn kind(&self, field: &str) -> Option<AnalyzerKind> {
        self.fields.get(field).map(|(kind, _)| *kind)
    }

    pub fn numeric_type(&self, field: &str) -> Option<NumericType> {
        self.kind(field).and_then(|k| k.numeric_type())
    }

    pub fn analyze(&self, field: &str, text: &str) -> Vec<String> {
        self.analyzer(field).analyze(text)
    }
}

impl Default for PerFieldAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerKind::Standard.analyzer())
    }
}
