//! Query routing and hybrid retrieval. The pipeline classifies each question,
//! routes it to one of three retrieval paths, and composes an answer grounded
//! on whatever the chosen path returned.

pub mod compose;
pub mod events;
pub mod filters;
pub mod intent;
pub mod retrieval;
pub mod sql_generator;
pub mod sql_guard;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::database::CatalogStore;
use crate::error::PipelineError;
use crate::llm::LanguageModel;
use crate::vector_db::VectorStore;

use compose::AnswerComposer;
use events::{EventSink, Stage, TraceEvent};
use filters::FilterExtractor;
use intent::IntentClassifier;
use retrieval::{CallPolicy, HybridExecutor, SemanticExecutor, StructuredExecutor};
use sql_generator::SqlGenerator;
use sql_guard::GuardPolicy;
use types::{Answer, ChatRequest, ChatResponse, Intent, Query};

/// Strip a markdown code fence wrapper from a model reply, language tag
/// included. Replies without fences pass through untouched.
pub(crate) fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Nearest neighbors requested from the vector store.
    pub top_k: usize,
    /// Hard row cap enforced on every generated statement.
    pub row_cap: u64,
    /// Upper bound on the candidate id set collected by the hybrid path.
    pub candidate_limit: usize,
    /// Items handed to the composer; the rest still appear in the response.
    pub max_context_items: usize,
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub guard: GuardPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            row_cap: 50,
            candidate_limit: 100,
            max_context_items: 8,
            call_timeout: Duration::from_secs(30),
            max_retries: 2,
            guard: GuardPolicy::catalog(50),
        }
    }
}

/// The orchestrator. Owns one instance of each stage and drives a query
/// through classify, extract, retrieve, and compose, emitting a trace event
/// at every transition.
pub struct ChatPipeline {
    classifier: IntentClassifier,
    extractor: FilterExtractor,
    generator: SqlGenerator,
    semantic: SemanticExecutor,
    structured: StructuredExecutor,
    hybrid: HybridExecutor,
    composer: AnswerComposer,
    events: Arc<dyn EventSink>,
    guard_policy: GuardPolicy,
}

impl ChatPipeline {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        vectors: Arc<dyn VectorStore>,
        catalog: Arc<dyn CatalogStore>,
        events: Arc<dyn EventSink>,
        config: PipelineConfig,
    ) -> Self {
        let policy = CallPolicy {
            timeout: config.call_timeout,
            max_retries: config.max_retries,
        };
        Self {
            classifier: IntentClassifier::new(Arc::clone(&model), config.call_timeout),
            extractor: FilterExtractor::new(Arc::clone(&model), config.call_timeout),
            generator: SqlGenerator::new(Arc::clone(&model), config.row_cap, config.call_timeout),
            semantic: SemanticExecutor::new(
                Arc::clone(&model),
                Arc::clone(&vectors),
                Arc::clone(&catalog),
                config.top_k,
                policy,
            ),
            structured: StructuredExecutor::new(Arc::clone(&catalog), policy),
            hybrid: HybridExecutor::new(
                Arc::clone(&model),
                Arc::clone(&vectors),
                Arc::clone(&catalog),
                config.top_k,
                config.candidate_limit,
                policy,
            ),
            composer: AnswerComposer::new(model, config.max_context_items, config.call_timeout),
            events,
            guard_policy: config.guard,
        }
    }

    /// Answer one chat request end to end.
    pub async fn answer(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        let query = Query::from_request(request);
        let answer = self.run(&query).await?;
        self.emit(&query, Stage::Done, "answer returned".to_string());
        Ok(ChatResponse::from_answer(query.request_id, answer))
    }

    /// Drive one query through the pipeline. Exposed separately so callers
    /// that already hold a `Query` (and its request id) can reuse it.
    pub async fn run(&self, query: &Query) -> Result<Answer, PipelineError> {
        match self.run_inner(query).await {
            Ok(answer) => Ok(answer),
            Err(error) => {
                self.emit(query, Stage::Error, error.kind_id().to_string());
                Err(error)
            }
        }
    }

    async fn run_inner(&self, query: &Query) -> Result<Answer, PipelineError> {
        self.emit(
            query,
            Stage::Received,
            format!("query received ({} chars)", query.text.len()),
        );

        let classification = self.classifier.classify(query).await;
        let intent = classification.intent;
        self.emit(
            query,
            Stage::Classified,
            format!("intent {}: {}", intent.as_str(), classification.rationale),
        );

        let mut result = match intent {
            Intent::Semantic => self.semantic.execute(query, &query.text).await?,
            Intent::Structured => {
                let extracted = self.extractor.extract(query).await;
                self.emit(
                    query,
                    Stage::Filtered,
                    format!("filters: {:?}", extracted.predicate),
                );

                let raw_sql = self.generator.generate(query).await?;
                let statement = sql_guard::guard(&raw_sql, &self.guard_policy)?;
                self.emit(query, Stage::Queried, statement.sql.clone());

                let mut result = self.structured.execute(query, &statement).await?;
                if !extracted.predicate.is_empty() {
                    result.provenance.filters = Some(extracted.predicate);
                }
                result
            }
            Intent::Hybrid => {
                let extracted = self.extractor.extract(query).await;
                self.emit(
                    query,
                    Stage::Filtered,
                    format!("filters: {:?}", extracted.predicate),
                );
                self.hybrid.execute(query, &extracted).await?
            }
        };
        result.provenance.degraded_classification = classification.degraded;
        self.emit(
            query,
            Stage::Retrieved,
            format!("{} item(s) retrieved", result.items.len()),
        );

        let answer = self.composer.compose(query, intent, result).await?;
        self.emit(
            query,
            Stage::Composed,
            format!("answer composed ({} chars)", answer.text.len()),
        );
        info!(
            request_id = %query.request_id,
            intent = intent.as_str(),
            items = answer.result.items.len(),
            "query answered"
        );
        Ok(answer)
    }

    fn emit(&self, query: &Query, stage: Stage, detail: String) {
        self.events.emit(TraceEvent {
            request_id: query.request_id.clone(),
            stage,
            detail,
        });
    }
}
