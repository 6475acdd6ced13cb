use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One prior turn of the conversation, passed through to the prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// A single user question handed to the pipeline. Immutable once created;
/// the request id travels with every outbound call for trace correlation.
#[derive(Debug, Clone)]
pub struct Query {
    pub request_id: String,
    pub text: String,
    pub history: Vec<ChatTurn>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            text: text.into(),
            history: Vec::new(),
        }
    }

    pub fn from_request(request: ChatRequest) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            text: request.text,
            history: request.history,
        }
    }
}

/// The retrieval strategy selected for a query. Derived per query, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Semantic,
    Structured,
    Hybrid,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Semantic => "semantic",
            Intent::Structured => "structured",
            Intent::Hybrid => "hybrid",
        }
    }
}

/// Structured constraints extracted from free text. All fields optional; an
/// empty predicate matches everything.
///
/// When both price bounds are present and inverted, `normalized` swaps them
/// rather than rejecting the query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub rating_min: Option<f64>,
    pub category: Option<String>,
}

impl FilterPredicate {
    pub fn is_empty(&self) -> bool {
        self.price_min.is_none()
            && self.price_max.is_none()
            && self.rating_min.is_none()
            && self.category.is_none()
    }

    /// Swap inverted price bounds so that `price_min <= price_max` holds.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if let (Some(lo), Some(hi)) = (self.price_min, self.price_max) {
            if lo > hi {
                self.price_min = Some(hi);
                self.price_max = Some(lo);
            }
        }
        self
    }

    /// Whether a retrieved item satisfies every bound that is set. Category
    /// matching is a case-insensitive substring match, mirroring the ILIKE
    /// match used in the candidate query.
    pub fn matches(&self, item: &RetrievedItem) -> bool {
        if let Some(lo) = self.price_min {
            if item.price.map_or(true, |p| p < lo) {
                return false;
            }
        }
        if let Some(hi) = self.price_max {
            if item.price.map_or(true, |p| p > hi) {
                return false;
            }
        }
        if let Some(min) = self.rating_min {
            if item.rating.map_or(true, |r| r < min) {
                return false;
            }
        }
        if let Some(ref wanted) = self.category {
            let wanted = wanted.to_lowercase();
            match item.category {
                Some(ref c) if c.to_lowercase().contains(&wanted) => {}
                _ => return false,
            }
        }
        true
    }
}

/// A bound SQL parameter or a value read back from a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(n) => Some(*n as f64),
            SqlValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "null"),
            SqlValue::Int(n) => write!(f, "{n}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A single validated read-only statement plus its bound parameters.
/// Generated per query, executed at most once, never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// A catalog item surfaced by one of the retrieval paths. `score` is the
/// cosine similarity for semantic hits and `None` for pure structured hits,
/// whose rank is their row order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub item_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: Option<f64>,
    pub rating: Option<f64>,
    pub category: Option<String>,
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalPath {
    Semantic,
    Structured,
}

/// How a result set was produced: which path(s) ran, what SQL executed, what
/// filter applied, and whether any step ran degraded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub paths: Vec<RetrievalPath>,
    pub executed_sql: Option<String>,
    pub filters: Option<FilterPredicate>,
    pub candidate_count: Option<usize>,
    pub degraded_classification: bool,
    pub degraded_retrieval: bool,
}

/// Ordered retrieval output plus provenance. Immutable; one per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub items: Vec<RetrievedItem>,
    pub provenance: Provenance,
}

impl RetrievalResult {
    pub fn empty(provenance: Provenance) -> Self {
        Self {
            items: Vec::new(),
            provenance,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The unit of response: final text grounded on a retrieval result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub intent: Intent,
    pub result: RetrievalResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub request_id: String,
    pub answer: String,
    pub intent: Intent,
    pub items: Vec<RetrievedItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters_applied: Option<FilterPredicate>,
}

impl ChatResponse {
    pub fn from_answer(request_id: String, answer: Answer) -> Self {
        let filters_applied = answer
            .result
            .provenance
            .filters
            .clone()
            .filter(|f| !f.is_empty());
        Self {
            request_id,
            answer: answer.text,
            intent: answer.intent,
            items: answer.result.items,
            filters_applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(price: Option<f64>, rating: Option<f64>, category: Option<&str>) -> RetrievedItem {
        RetrievedItem {
            item_id: "i1".to_string(),
            title: "item".to_string(),
            description: String::new(),
            price,
            rating,
            category: category.map(str::to_string),
            score: None,
        }
    }

    #[test]
    fn empty_predicate_matches_everything() {
        let predicate = FilterPredicate::default();
        assert!(predicate.is_empty());
        assert!(predicate.matches(&item(None, None, None)));
        assert!(predicate.matches(&item(Some(19.0), Some(4.2), Some("Electronics"))));
    }

    #[test]
    fn inverted_price_bounds_are_swapped() {
        let predicate = FilterPredicate {
            price_min: Some(100.0),
            price_max: Some(50.0),
            ..Default::default()
        }
        .normalized();
        assert_eq!(predicate.price_min, Some(50.0));
        assert_eq!(predicate.price_max, Some(100.0));
    }

    #[test]
    fn predicate_bounds_are_inclusive() {
        let predicate = FilterPredicate {
            price_max: Some(50.0),
            rating_min: Some(4.0),
            ..Default::default()
        };
        assert!(predicate.matches(&item(Some(50.0), Some(4.0), None)));
        assert!(!predicate.matches(&item(Some(50.01), Some(4.0), None)));
        assert!(!predicate.matches(&item(Some(50.0), Some(3.9), None)));
    }

    #[test]
    fn category_match_is_case_insensitive_substring() {
        let predicate = FilterPredicate {
            category: Some("headphones".to_string()),
            ..Default::default()
        };
        assert!(predicate.matches(&item(None, None, Some("Headphones & Audio"))));
        assert!(!predicate.matches(&item(None, None, Some("Kitchen"))));
        // An item without a category cannot satisfy a category bound.
        assert!(!predicate.matches(&item(None, None, None)));
    }

    #[test]
    fn intent_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Intent::Hybrid).unwrap(), "\"hybrid\"");
        assert_eq!(Intent::Structured.as_str(), "structured");
    }
}
