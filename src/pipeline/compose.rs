use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::llm::LanguageModel;
use crate::pipeline::types::{Answer, Intent, Query, RetrievalResult, RetrievedItem};

pub(crate) const EMPTY_RESULT_TEXT: &str =
    "No items in the catalog match that request. Try loosening the price or rating constraints.";

fn render_item(item: &RetrievedItem) -> String {
    let mut line = format!("[{}] {}", item.item_id, item.title);
    if let Some(price) = item.price {
        line.push_str(&format!(" | price: ${price:.2}"));
    }
    if let Some(rating) = item.rating {
        line.push_str(&format!(" | rating: {rating:.1}"));
    }
    if let Some(ref category) = item.category {
        line.push_str(&format!(" | category: {category}"));
    }
    if !item.description.is_empty() {
        line.push_str(&format!("\n    {}", item.description));
    }
    line
}

fn composition_prompt(query: &Query, items: &[RetrievedItem]) -> String {
    let context = items
        .iter()
        .map(render_item)
        .collect::<Vec<_>>()
        .join("\n");
    let history = if query.history.is_empty() {
        String::new()
    } else {
        let turns = query
            .history
            .iter()
            .map(|turn| format!("{}: {}", turn.role, turn.content))
            .collect::<Vec<_>>()
            .join("\n");
        format!("Conversation so far:\n{turns}\n\n")
    };
    format!(
        "You are a product assistant. Answer the user's question using ONLY the \
        catalog items below. Refer to items by the bracketed id, e.g. [B001]. \
        If the items do not answer the question, say so instead of inventing \
        products.\n\n\
        {history}\
        Catalog items:\n{context}\n\n\
        User question: {question}\n\n\
        Answer:",
        question = query.text,
    )
}

/// Every answer must cite at least one retrieved item so the reader can tell
/// which records back it. A reply with no id gets a trailing source line
/// instead of being discarded.
fn ensure_citations(text: String, items: &[RetrievedItem]) -> String {
    if items.iter().any(|item| text.contains(&item.item_id)) {
        return text;
    }
    let ids = items
        .iter()
        .map(|item| format!("[{}]", item.item_id))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{}\n\nSources: {ids}", text.trim_end())
}

/// Turns a retrieval result into grounded prose. Empty results skip the model
/// entirely and answer with a fixed message.
pub struct AnswerComposer {
    model: Arc<dyn LanguageModel>,
    max_context_items: usize,
    call_timeout: Duration,
}

impl AnswerComposer {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        max_context_items: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            model,
            max_context_items,
            call_timeout,
        }
    }

    pub async fn compose(
        &self,
        query: &Query,
        intent: Intent,
        result: RetrievalResult,
    ) -> Result<Answer, PipelineError> {
        if result.is_empty() {
            debug!(request_id = %query.request_id, "empty result; skipping generation");
            return Ok(Answer {
                text: EMPTY_RESULT_TEXT.to_string(),
                intent,
                result,
            });
        }

        let context: Vec<RetrievedItem> = result
            .items
            .iter()
            .take(self.max_context_items)
            .cloned()
            .collect();
        if context.len() < result.items.len() {
            debug!(
                request_id = %query.request_id,
                kept = context.len(),
                dropped = result.items.len() - context.len(),
                "truncated answer context"
            );
        }

        // Bounded but not retried; generation is not idempotent.
        let reply = match timeout(
            self.call_timeout,
            self.model
                .generate(&composition_prompt(query, &context), &query.request_id),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(source)) => {
                warn!(request_id = %query.request_id, %source, "answer generation failed");
                return Err(PipelineError::GenerationFailed { source });
            }
            Err(_) => {
                warn!(request_id = %query.request_id, "answer generation timed out");
                return Err(PipelineError::ExternalServiceTimeout {
                    service: "language model",
                    attempts: 1,
                });
            }
        };

        Ok(Answer {
            text: ensure_citations(reply.trim().to_string(), &context),
            intent,
            result,
        })
    }
}
