use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use regex::Regex;
use tokio::time::timeout;
use tracing::warn;

use crate::llm::LanguageModel;
use crate::pipeline::types::{Intent, Query};

/// Outcome of intent classification. `degraded` is set when the model call
/// failed or returned an unrecognized label and the pipeline fell back to
/// the least destructive path.
#[derive(Debug, Clone)]
pub struct Classification {
    pub intent: Intent,
    pub degraded: bool,
    pub rationale: String,
}

/// Lexical signals scanned from the query text. Aggregation/comparison words
/// and explicit amounts count as structured cues; qualitative language counts
/// as semantic cues.
#[derive(Debug, Clone, Copy)]
pub struct Cues {
    pub structured: bool,
    pub semantic: bool,
}

impl Cues {
    pub fn scan(text: &str) -> Self {
        static STRUCTURED: OnceLock<Regex> = OnceLock::new();
        static SEMANTIC: OnceLock<Regex> = OnceLock::new();

        let structured = STRUCTURED.get_or_init(|| {
            Regex::new(
                r"(?i)\b(how many|count|number of|average|avg|total|sum|more than|less than|fewer than|at least|at most|over|under|above|below|between|cheapest|most expensive|highest rated|top rated)\b|\$\s*\d|\d+(?:\.\d+)?\s*(?:dollars|bucks|stars)",
            )
            .expect("structured cue pattern")
        });
        let semantic = SEMANTIC.get_or_init(|| {
            Regex::new(
                r"(?i)\b(best|good|great|top|recommend|recommendations?|comfortable|durable|quality|similar|like|tell me about|describe|review|ideal|suitable|stylish|cozy)\b",
            )
            .expect("semantic cue pattern")
        });

        Self {
            structured: structured.is_match(text),
            semantic: semantic.is_match(text),
        }
    }
}

/// Deterministic routing where the text is unambiguous. Returns `None` when
/// neither cue class is present and the model has to decide.
fn heuristic_intent(cues: Cues) -> Option<(Intent, &'static str)> {
    match (cues.structured, cues.semantic) {
        // Tie-break: both signal classes present means hybrid.
        (true, true) => Some((
            Intent::Hybrid,
            "numeric constraints and descriptive language both present",
        )),
        (true, false) => Some((
            Intent::Structured,
            "aggregation or comparison cues without descriptive language",
        )),
        (false, true) => Some((
            Intent::Semantic,
            "descriptive language without numeric constraints",
        )),
        (false, false) => None,
    }
}

fn classification_prompt(text: &str) -> String {
    format!(
        "You are a query classifier for a product search system.\n\n\
        Classify the user query into one of these categories:\n\n\
        1. SEMANTIC - pure conceptual search: products by description, use case, or recommendation.\n\
        2. STRUCTURED - counting, aggregating, or listing by exact criteria with no conceptual part.\n\
        3. HYBRID - both numeric or categorical filters AND conceptual, descriptive terms.\n\n\
        User query: {text}\n\n\
        Respond with exactly one word: SEMANTIC, STRUCTURED, or HYBRID."
    )
}

fn parse_label(reply: &str) -> Option<Intent> {
    let label = reply
        .trim()
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_ascii_alphabetic())
        .to_ascii_uppercase();
    match label.as_str() {
        "SEMANTIC" => Some(Intent::Semantic),
        "STRUCTURED" => Some(Intent::Structured),
        "HYBRID" => Some(Intent::Hybrid),
        _ => None,
    }
}

/// Decides which retrieval path(s) a query needs. Unambiguous lexical cues
/// route deterministically; the model decides the remainder. Classification
/// never fails the query: model failure falls back to SEMANTIC with the
/// degraded flag set.
pub struct IntentClassifier {
    model: Arc<dyn LanguageModel>,
    call_timeout: Duration,
}

impl IntentClassifier {
    pub fn new(model: Arc<dyn LanguageModel>, call_timeout: Duration) -> Self {
        Self {
            model,
            call_timeout,
        }
    }

    pub async fn classify(&self, query: &Query) -> Classification {
        let cues = Cues::scan(&query.text);
        if let Some((intent, rationale)) = heuristic_intent(cues) {
            return Classification {
                intent,
                degraded: false,
                rationale: rationale.to_string(),
            };
        }

        let outcome = match timeout(
            self.call_timeout,
            self.model
                .generate(&classification_prompt(&query.text), &query.request_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!("classification call timed out")),
        };

        match outcome {
            Ok(reply) => match parse_label(&reply) {
                Some(intent) => Classification {
                    intent,
                    degraded: false,
                    rationale: format!("model label: {}", intent.as_str()),
                },
                None => {
                    warn!(
                        request_id = %query.request_id,
                        label = %reply.trim(),
                        "unrecognized intent label; falling back to semantic"
                    );
                    Classification {
                        intent: Intent::Semantic,
                        degraded: true,
                        rationale: "unrecognized model label; defaulted to semantic".to_string(),
                    }
                }
            },
            Err(error) => {
                warn!(
                    request_id = %query.request_id,
                    %error,
                    "intent classification call failed; falling back to semantic"
                );
                Classification {
                    intent: Intent::Semantic,
                    degraded: true,
                    rationale: "classification call failed; defaulted to semantic".to_string(),
                }
            }
        }
    }
}
