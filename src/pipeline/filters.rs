use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::warn;

use crate::llm::LanguageModel;
use crate::pipeline::strip_code_fences;
use crate::pipeline::types::{FilterPredicate, Query};

/// Extraction output: the structured predicate plus the conceptual half of
/// the query, used as the search text for the hybrid semantic phase.
#[derive(Debug, Clone)]
pub struct ExtractedFilters {
    pub predicate: FilterPredicate,
    pub semantic_query: String,
}

impl ExtractedFilters {
    fn empty(query: &Query) -> Self {
        Self {
            predicate: FilterPredicate::default(),
            semantic_query: query.text.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawFilters {
    #[serde(default)]
    price_min: Option<f64>,
    #[serde(default)]
    price_max: Option<f64>,
    #[serde(default)]
    rating_min: Option<f64>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    semantic_query: Option<String>,
}

fn extraction_prompt(text: &str) -> String {
    format!(
        "Extract filters from this product search query.\n\n\
        Query: {text}\n\n\
        Return a JSON object with these fields (use null if not mentioned):\n\
        {{\n\
            \"price_min\": number or null,\n\
            \"price_max\": number or null,\n\
            \"rating_min\": number or null,\n\
            \"category\": string or null,\n\
            \"semantic_query\": \"the conceptual, descriptive part of the query\"\n\
        }}\n\n\
        Examples:\n\
        - \"best headphones under $50\" -> {{\"price_max\": 50, \"category\": \"headphones\", \"semantic_query\": \"best headphones\"}}\n\
        - \"espresso machines between $80 and $200\" -> {{\"price_min\": 80, \"price_max\": 200, \"category\": \"espresso machines\", \"semantic_query\": \"espresso machines\"}}\n\n\
        Never invent numbers that are not in the query. Only return the JSON, no other text."
    )
}

/// Numeric literals present in the text, used to reject bounds the model
/// made up. "$50" and "4.5 stars" both count.
fn numbers_in(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() || (c == '.' && !current.is_empty()) {
            current.push(c);
        } else if !current.is_empty() {
            if let Ok(n) = current.trim_end_matches('.').parse() {
                out.push(n);
            }
            current.clear();
        }
    }
    if let Ok(n) = current.trim_end_matches('.').parse() {
        out.push(n);
    }
    out
}

fn grounded(bound: Option<f64>, literals: &[f64]) -> Option<f64> {
    bound.filter(|value| literals.iter().any(|n| (n - value).abs() < f64::EPSILON))
}

/// Parse a model reply into a predicate, dropping anything not grounded in
/// the query text. Pure so it can be tested without a model.
fn parse_reply(reply: &str, query_text: &str) -> Option<(FilterPredicate, Option<String>)> {
    let cleaned = strip_code_fences(reply);
    let raw: RawFilters = serde_json::from_str(cleaned.trim()).ok()?;

    // Ambiguity recovery is conservative widening: a bound whose number does
    // not occur in the text is dropped, never guessed.
    let literals = numbers_in(query_text);
    let predicate = FilterPredicate {
        price_min: grounded(raw.price_min, &literals),
        price_max: grounded(raw.price_max, &literals),
        rating_min: grounded(raw.rating_min, &literals),
        category: raw.category.filter(|c| !c.trim().is_empty()),
    }
    .normalized();

    Some((predicate, raw.semantic_query.filter(|s| !s.trim().is_empty())))
}

/// Turns free text into a structured predicate. Invoked only for STRUCTURED
/// and HYBRID intents; extraction failure yields an empty predicate rather
/// than blocking the pipeline.
pub struct FilterExtractor {
    model: Arc<dyn LanguageModel>,
    call_timeout: Duration,
}

impl FilterExtractor {
    pub fn new(model: Arc<dyn LanguageModel>, call_timeout: Duration) -> Self {
        Self {
            model,
            call_timeout,
        }
    }

    pub async fn extract(&self, query: &Query) -> ExtractedFilters {
        let outcome = match timeout(
            self.call_timeout,
            self.model
                .generate(&extraction_prompt(&query.text), &query.request_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!("filter extraction call timed out")),
        };

        let reply = match outcome {
            Ok(reply) => reply,
            Err(error) => {
                warn!(
                    request_id = %query.request_id,
                    %error,
                    "filter extraction call failed; using empty predicate"
                );
                return ExtractedFilters::empty(query);
            }
        };

        match parse_reply(&reply, &query.text) {
            Some((predicate, semantic_query)) => ExtractedFilters {
                predicate,
                semantic_query: semantic_query.unwrap_or_else(|| query.text.clone()),
            },
            None => {
                warn!(
                    request_id = %query.request_id,
                    "filter extraction reply was not valid JSON; using empty predicate"
                );
                ExtractedFilters::empty(query)
            }
        }
    }
}
