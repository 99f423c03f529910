//! Query parsing, search options and cache keys

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::search::SearchError;

/// Characters that mark a query as structured
pub const OPERATOR_CHARS: [char; 4] = [':', '@', '.', '-'];

/// Wildcards understood by the fuzzy strategy
pub const WILDCARD_CHARS: [char; 2] = ['*', '?'];

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;
pub const MAX_OFFSET: usize = 10_000;
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.7;

/// Operator prefix detected at the start of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOperator {
    /// `category:<name>`
    Category(String),
    /// `tag:<a>[,<b>...]`
    Tag(Vec<String>),
}

/// A parsed, normalized query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub raw: String,
    /// Lower-cased, whitespace-collapsed, punctuation stripped except
    /// operator and wildcard characters
    pub normalized: String,
    pub operator: Option<QueryOperator>,
    /// Free text, or the secondary filter following an operator
    pub text: String,
    pub tokens: Vec<String>,
}

/// Coarse shape of a query, reported to telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Fuzzy,
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Fuzzy => write!(f, "fuzzy"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// Lower-case, keep word, operator and wildcard characters, collapse
/// whitespace.
pub fn normalize(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_alphanumeric()
                || c == '_'
                || OPERATOR_CHARS.contains(&c)
                || WILDCARD_CHARS.contains(&c)
            {
                c
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl Query {
    pub fn parse(raw: &str) -> Self {
        let normalized = normalize(raw);
        let (operator, text) = parse_operator(raw, &normalized);
        let tokens = text.split_whitespace().map(str::to_string).collect();
        Self {
            raw: raw.to_string(),
            normalized,
            operator,
            text,
            tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }

    /// More than three tokens, or any operator character in the text
    pub fn is_complex(&self) -> bool {
        self.tokens.len() > 3 || self.text.contains(OPERATOR_CHARS)
    }

    /// A token shorter than three characters, or one with a wildcard
    pub fn has_fuzzy_terms(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| t.chars().count() < 3 || t.contains(WILDCARD_CHARS))
    }

    pub fn complexity(&self) -> Complexity {
        if self.is_complex() {
            Complexity::Complex
        } else if self.has_fuzzy_terms() {
            Complexity::Fuzzy
        } else {
            Complexity::Simple
        }
    }
}

/// Split a leading `category:`/`tag:` operator from the rest of the query.
/// Works on the raw text so tag lists keep their commas. `category: jcl`
/// (value after a space) is accepted too.
fn parse_operator(raw: &str, normalized: &str) -> (Option<QueryOperator>, String) {
    let lowered = raw.trim().to_lowercase();
    for prefix in ["category:", "tag:"] {
        let Some(rest) = lowered.strip_prefix(prefix) else {
            continue;
        };
        let rest = rest.trim_start();
        let (value, remainder) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let operator = if prefix == "tag:" {
            let tags: Vec<String> = value
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if tags.is_empty() {
                break;
            }
            QueryOperator::Tag(tags)
        } else {
            let category = value.trim().to_string();
            if category.is_empty() {
                break;
            }
            QueryOperator::Category(category)
        };
        return (Some(operator), normalize(remainder));
    }
    (None, normalized.to_string())
}

/// Result ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Relevance,
    Usage,
    SuccessRate,
    CreatedAt,
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SortBy::Relevance => "relevance",
            SortBy::Usage => "usage",
            SortBy::SuccessRate => "success_rate",
            SortBy::CreatedAt => "created_at",
        };
        f.write_str(s)
    }
}

impl FromStr for SortBy {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "relevance" => Ok(SortBy::Relevance),
            "usage" => Ok(SortBy::Usage),
            "success_rate" | "success-rate" => Ok(SortBy::SuccessRate),
            "created_at" | "created-at" | "recent" => Ok(SortBy::CreatedAt),
            other => Err(SearchError::InvalidQueryOptions(format!(
                "unknown sort order '{}', expected relevance, usage, success_rate or created_at",
                other
            ))),
        }
    }
}

/// Caller-supplied search options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub limit: usize,
    pub offset: usize,
    pub sort_by: SortBy,
    pub include_archived: bool,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub fuzzy_threshold: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
            sort_by: SortBy::Relevance,
            include_archived: false,
            category: None,
            tags: Vec::new(),
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
        }
    }
}

impl SearchOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_sort(mut self, sort_by: SortBy) -> Self {
        self.sort_by = sort_by;
        self
    }

    pub fn with_archived(mut self, include: bool) -> Self {
        self.include_archived = include;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fuzzy_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        let invalid = |msg: String| Err(SearchError::InvalidQueryOptions(msg));
        if self.limit == 0 || self.limit > MAX_LIMIT {
            return invalid(format!("limit must be between 1 and {MAX_LIMIT}, got {}", self.limit));
        }
        if self.offset > MAX_OFFSET {
            return invalid(format!("offset must be at most {MAX_OFFSET}, got {}", self.offset));
        }
        if !self.fuzzy_threshold.is_finite() || !(0.0..=1.0).contains(&self.fuzzy_threshold) {
            return invalid(format!(
                "fuzzy_threshold must be within [0, 1], got {}",
                self.fuzzy_threshold
            ));
        }
        if self.category.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return invalid("category must not be blank".to_string());
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return invalid("tags must not be blank".to_string());
        }
        Ok(())
    }

    /// Category from a `category:` operator, else from options, lower-cased
    pub fn effective_category(&self, query: &Query) -> Option<String> {
        match &query.operator {
            Some(QueryOperator::Category(c)) => Some(c.clone()),
            _ => self.category.as_deref().map(|c| c.trim().to_lowercase()),
        }
    }

    /// Tags from a `tag:` operator, else from options; sorted, deduplicated
    pub fn effective_tags(&self, query: &Query) -> Vec<String> {
        let mut tags: Vec<String> = match &query.operator {
            Some(QueryOperator::Tag(t)) => t.clone(),
            _ => self.tags.iter().map(|t| t.trim().to_lowercase()).collect(),
        };
        tags.retain(|t| !t.is_empty());
        tags.sort();
        tags.dedup();
        tags
    }
}

/// Deterministic key for a search request.
///
/// Identical logical requests (same normalized query and effective options)
/// always render to the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn search(query: &Query, options: &SearchOptions) -> Self {
        let category = options
            .effective_category(query)
            .unwrap_or_else(|| "all".to_string());
        let tags = options.effective_tags(query);
        Self(format!(
            "search|{}|{}|{}|{}|{}|{}|{}|{:.3}",
            query.normalized,
            sanitize(&category),
            options.sort_by,
            options.limit,
            options.offset,
            sanitize(&tags.join(",")),
            if options.include_archived { "archived" } else { "active" },
            options.fuzzy_threshold,
        ))
    }

    pub fn autocomplete(prefix: &str, limit: usize) -> Self {
        Self(format!("complete|{}|{}", normalize(prefix), limit))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize(part: &str) -> String {
    part.replace('|', " ")
}
