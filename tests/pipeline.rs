//! End-to-end pipeline tests against a real in-memory catalog, a scripted
//! model, and an in-process vector store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catalog_chat::database::{CatalogItem, SqliteCatalog};
use catalog_chat::error::PipelineError;
use catalog_chat::llm::LanguageModel;
use catalog_chat::pipeline::events::TracingEventSink;
use catalog_chat::pipeline::types::{ChatRequest, Intent, Query, RetrievalPath};
use catalog_chat::pipeline::{ChatPipeline, PipelineConfig};
use catalog_chat::vector_db::{VectorHit, VectorStore};

/// Scripted model: each pipeline stage uses a distinctive prompt, so replies
/// are routed by prompt markers instead of call order.
#[derive(Default)]
struct ScriptedModel {
    intent_reply: Option<String>,
    filters_reply: Option<String>,
    sql_reply: Option<String>,
    answer_reply: String,
    fail_classification: bool,
    compose_calls: AtomicUsize,
}

impl ScriptedModel {
    fn new() -> Self {
        Self {
            answer_reply: "Here is what I found.".to_string(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, prompt: &str, _request_id: &str) -> anyhow::Result<String> {
        if prompt.contains("Respond with exactly one word") {
            if self.fail_classification {
                anyhow::bail!("model offline");
            }
            return Ok(self
                .intent_reply
                .clone()
                .unwrap_or_else(|| "SEMANTIC".to_string()));
        }
        if prompt.contains("Return a JSON object") {
            return Ok(self
                .filters_reply
                .clone()
                .unwrap_or_else(|| "{}".to_string()));
        }
        if prompt.contains("SQL Query:") {
            return self
                .sql_reply
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no scripted SQL reply"));
        }
        if prompt.contains("Catalog items:") {
            self.compose_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(self.answer_reply.clone());
        }
        anyhow::bail!("unexpected prompt: {prompt}")
    }

    async fn embed(&self, _text: &str, _request_id: &str) -> anyhow::Result<Vec<f32>> {
        Ok(vec![0.1, 0.2, 0.3])
    }
}

/// Returns its scripted hits, restricted to the candidate set when one is
/// passed, the way the real store applies a payload filter.
#[derive(Default)]
struct MockVectorStore {
    hits: Vec<VectorHit>,
    calls: AtomicUsize,
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn search(
        &self,
        _vector: Vec<f32>,
        k: usize,
        candidates: Option<&[String]>,
        _request_id: &str,
    ) -> anyhow::Result<Vec<VectorHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut hits = self.hits.clone();
        if let Some(ids) = candidates {
            hits.retain(|hit| ids.contains(&hit.item_id));
        }
        hits.truncate(k);
        Ok(hits)
    }
}

/// A generation backend that hangs forever; embeddings still resolve.
struct PendingModel;

#[async_trait]
impl LanguageModel for PendingModel {
    async fn generate(&self, _prompt: &str, _request_id: &str) -> anyhow::Result<String> {
        std::future::pending().await
    }

    async fn embed(&self, _text: &str, _request_id: &str) -> anyhow::Result<Vec<f32>> {
        Ok(vec![0.1, 0.2, 0.3])
    }
}

struct SlowVectorStore;

#[async_trait]
impl VectorStore for SlowVectorStore {
    async fn search(
        &self,
        _vector: Vec<f32>,
        _k: usize,
        _candidates: Option<&[String]>,
        _request_id: &str,
    ) -> anyhow::Result<Vec<VectorHit>> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(Vec::new())
    }
}

struct FailingVectorStore;

#[async_trait]
impl VectorStore for FailingVectorStore {
    async fn search(
        &self,
        _vector: Vec<f32>,
        _k: usize,
        _candidates: Option<&[String]>,
        _request_id: &str,
    ) -> anyhow::Result<Vec<VectorHit>> {
        anyhow::bail!("connection refused")
    }
}

fn seeded_catalog() -> Arc<SqliteCatalog> {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    catalog
        .insert_items(&[
            CatalogItem {
                item_id: "B001".to_string(),
                title: "Wireless Earbuds".to_string(),
                description: "Compact earbuds with a charging case".to_string(),
                price: Some(39.99),
                rating: Some(4.5),
                rating_count: Some(812),
                category: Some("Headphones".to_string()),
            },
            CatalogItem {
                item_id: "B002".to_string(),
                title: "Espresso Machine".to_string(),
                description: "15-bar pump espresso maker".to_string(),
                price: Some(129.0),
                rating: Some(4.6),
                rating_count: Some(245),
                category: Some("Kitchen".to_string()),
            },
            CatalogItem {
                item_id: "B003".to_string(),
                title: "Studio Headphones".to_string(),
                description: "Closed-back over-ear monitors".to_string(),
                price: Some(199.0),
                rating: Some(4.8),
                rating_count: Some(1533),
                category: Some("Headphones".to_string()),
            },
        ])
        .unwrap();
    Arc::new(catalog)
}

fn pipeline(
    model: Arc<dyn LanguageModel>,
    vectors: Arc<dyn VectorStore>,
    catalog: Arc<SqliteCatalog>,
    config: PipelineConfig,
) -> ChatPipeline {
    ChatPipeline::new(model, vectors, catalog, Arc::new(TracingEventSink), config)
}

#[tokio::test]
async fn semantic_query_returns_hydrated_cited_items() {
    let model = Arc::new(ScriptedModel {
        answer_reply: "The [B001] earbuds fit small ears best.".to_string(),
        ..ScriptedModel::new()
    });
    let vectors = Arc::new(MockVectorStore {
        hits: vec![
            VectorHit {
                item_id: "B001".to_string(),
                score: 0.91,
            },
            VectorHit {
                item_id: "B003".to_string(),
                score: 0.84,
            },
        ],
        ..Default::default()
    });

    let pipeline = pipeline(
        model,
        vectors,
        seeded_catalog(),
        PipelineConfig::default(),
    );
    let response = pipeline
        .answer(ChatRequest {
            text: "tell me about wireless earbuds".to_string(),
            history: Vec::new(),
        })
        .await
        .unwrap();

    assert_eq!(response.intent, Intent::Semantic);
    assert_eq!(response.items.len(), 2);
    // Hit order (descending similarity) is preserved through hydration.
    assert_eq!(response.items[0].item_id, "B001");
    assert_eq!(response.items[0].score, Some(0.91));
    assert_eq!(response.items[0].title, "Wireless Earbuds");
    assert!(response.answer.contains("[B001]"));
}

#[tokio::test]
async fn structured_count_runs_the_guarded_statement() {
    let model = Arc::new(ScriptedModel {
        sql_reply: Some(
            "SELECT COUNT(*) AS product_count FROM products WHERE price > 100".to_string(),
        ),
        answer_reply: "Two products cost more than $100.".to_string(),
        ..ScriptedModel::new()
    });
    let vectors = Arc::new(MockVectorStore::default());

    let pipeline = pipeline(
        model,
        vectors.clone(),
        seeded_catalog(),
        PipelineConfig::default(),
    );
    let answer = pipeline
        .run(&Query::new("how many products cost over $100"))
        .await
        .unwrap();

    assert_eq!(answer.intent, Intent::Structured);
    assert_eq!(answer.result.items.len(), 1);
    assert_eq!(answer.result.items[0].title, "product_count: 2");
    assert_eq!(answer.result.provenance.paths, vec![RetrievalPath::Structured]);
    // The guard appends the row cap to statements that lack a LIMIT.
    let sql = answer.result.provenance.executed_sql.as_deref().unwrap();
    assert!(sql.ends_with("LIMIT 50"), "{sql}");
    // The vector store is never involved in a structured query.
    assert_eq!(vectors.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn generated_write_statements_are_rejected_before_execution() {
    let model = Arc::new(ScriptedModel {
        sql_reply: Some("DROP TABLE products".to_string()),
        ..ScriptedModel::new()
    });

    let catalog = seeded_catalog();
    let pipeline = pipeline(
        model,
        Arc::new(MockVectorStore::default()),
        catalog.clone(),
        PipelineConfig::default(),
    );
    let error = pipeline
        .run(&Query::new("count products with missing ratings"))
        .await
        .unwrap_err();

    assert_eq!(error.kind_id(), "unsafe_query");
    // The rejection message never echoes the statement.
    assert!(!error.to_string().contains("DROP"));

    // The table survived.
    let check = catalog_chat::pipeline::types::StructuredQuery {
        sql: "SELECT COUNT(*) AS n FROM products".to_string(),
        params: vec![],
    };
    use catalog_chat::database::CatalogStore;
    let rows = catalog.execute_readonly(&check, "verify").await.unwrap();
    assert_eq!(rows[0].get_f64("n"), Some(3.0));
}

#[tokio::test]
async fn hybrid_results_satisfy_the_extracted_filters() {
    let model = Arc::new(ScriptedModel {
        filters_reply: Some(
            r#"{"price_max": 50, "category": "headphones", "semantic_query": "best headphones"}"#
                .to_string(),
        ),
        answer_reply: "The [B001] earbuds are the best pick under $50.".to_string(),
        ..ScriptedModel::new()
    });
    let vectors = Arc::new(MockVectorStore {
        hits: vec![
            // B003 scores higher but costs $199; the candidate filter must
            // keep it out before the vector search ranks anything.
            VectorHit {
                item_id: "B003".to_string(),
                score: 0.95,
            },
            VectorHit {
                item_id: "B001".to_string(),
                score: 0.88,
            },
        ],
        ..Default::default()
    });

    let pipeline = pipeline(
        model,
        vectors,
        seeded_catalog(),
        PipelineConfig::default(),
    );
    let answer = pipeline
        .run(&Query::new("best headphones under $50"))
        .await
        .unwrap();

    assert_eq!(answer.intent, Intent::Hybrid);
    assert_eq!(answer.result.items.len(), 1);
    assert_eq!(answer.result.items[0].item_id, "B001");

    let provenance = &answer.result.provenance;
    assert_eq!(
        provenance.paths,
        vec![RetrievalPath::Structured, RetrievalPath::Semantic]
    );
    assert_eq!(provenance.candidate_count, Some(1));
    let filters = provenance.filters.as_ref().unwrap();
    for item in &answer.result.items {
        assert!(filters.matches(item), "{item:?} violates {filters:?}");
    }
}

#[tokio::test]
async fn hybrid_with_no_candidates_short_circuits_to_an_empty_answer() {
    let model = Arc::new(ScriptedModel {
        filters_reply: Some(
            r#"{"price_max": 4, "category": "headphones", "semantic_query": "best headphones"}"#
                .to_string(),
        ),
        ..ScriptedModel::new()
    });
    let vectors = Arc::new(MockVectorStore {
        hits: vec![VectorHit {
            item_id: "B001".to_string(),
            score: 0.9,
        }],
        ..Default::default()
    });

    let pipeline = pipeline(
        model.clone(),
        vectors.clone(),
        seeded_catalog(),
        PipelineConfig::default(),
    );
    let answer = pipeline
        .run(&Query::new("best headphones under $4"))
        .await
        .unwrap();

    assert!(answer.result.items.is_empty());
    assert_eq!(answer.result.provenance.candidate_count, Some(0));
    assert!(answer.text.contains("No items"));
    // Neither the vector store nor the composer model ran.
    assert_eq!(vectors.calls.load(Ordering::SeqCst), 0);
    assert_eq!(model.compose_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn classifier_failure_degrades_to_semantic() {
    let model = Arc::new(ScriptedModel {
        fail_classification: true,
        ..ScriptedModel::new()
    });
    let vectors = Arc::new(MockVectorStore {
        hits: vec![VectorHit {
            item_id: "B002".to_string(),
            score: 0.7,
        }],
        ..Default::default()
    });

    let pipeline = pipeline(
        model,
        vectors,
        seeded_catalog(),
        PipelineConfig::default(),
    );
    let answer = pipeline
        .run(&Query::new("something to gift my father"))
        .await
        .unwrap();

    assert_eq!(answer.intent, Intent::Semantic);
    assert!(answer.result.provenance.degraded_classification);
    assert_eq!(answer.result.items[0].item_id, "B002");
}

#[tokio::test(start_paused = true)]
async fn vector_store_timeout_surfaces_after_all_retries() {
    let model = Arc::new(ScriptedModel::new());
    let config = PipelineConfig {
        call_timeout: Duration::from_secs(1),
        max_retries: 2,
        ..Default::default()
    };

    let pipeline = pipeline(model, Arc::new(SlowVectorStore), seeded_catalog(), config);
    let error = pipeline
        .run(&Query::new("tell me about espresso machines"))
        .await
        .unwrap_err();

    match error {
        PipelineError::ExternalServiceTimeout { service, attempts } => {
            assert_eq!(service, "vector store");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn hybrid_degrades_to_structured_candidates_when_the_vector_leg_fails() {
    let model = Arc::new(ScriptedModel {
        filters_reply: Some(
            r#"{"price_max": 200, "category": "headphones", "semantic_query": "best headphones"}"#
                .to_string(),
        ),
        ..ScriptedModel::new()
    });
    let config = PipelineConfig {
        call_timeout: Duration::from_secs(1),
        max_retries: 0,
        ..Default::default()
    };

    let pipeline = pipeline(model, Arc::new(FailingVectorStore), seeded_catalog(), config);
    let answer = pipeline
        .run(&Query::new("best headphones under $200"))
        .await
        .unwrap();

    let provenance = &answer.result.provenance;
    assert!(provenance.degraded_retrieval);
    assert_eq!(provenance.paths, vec![RetrievalPath::Structured]);
    assert_eq!(provenance.candidate_count, Some(2));

    let mut ids: Vec<&str> = answer
        .result
        .items
        .iter()
        .map(|item| item.item_id.as_str())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["B001", "B003"]);
}

#[tokio::test(start_paused = true)]
async fn hung_answer_generation_is_cut_off_by_the_call_timeout() {
    let config = PipelineConfig {
        call_timeout: Duration::from_secs(1),
        max_retries: 0,
        ..Default::default()
    };
    let vectors = Arc::new(MockVectorStore {
        hits: vec![VectorHit {
            item_id: "B001".to_string(),
            score: 0.9,
        }],
        ..Default::default()
    });

    let pipeline = pipeline(Arc::new(PendingModel), vectors, seeded_catalog(), config);
    let error = pipeline
        .run(&Query::new("tell me about wireless earbuds"))
        .await
        .unwrap_err();

    match error {
        PipelineError::ExternalServiceTimeout { service, attempts } => {
            assert_eq!(service, "language model");
            // Generation is never retried.
            assert_eq!(attempts, 1);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn hung_sql_generation_is_cut_off_by_the_call_timeout() {
    let config = PipelineConfig {
        call_timeout: Duration::from_secs(1),
        max_retries: 0,
        ..Default::default()
    };

    let pipeline = pipeline(
        Arc::new(PendingModel),
        Arc::new(MockVectorStore::default()),
        seeded_catalog(),
        config,
    );
    // Extraction times out first and degrades to an empty predicate; the
    // generator's own timeout then surfaces as the error.
    let error = pipeline
        .run(&Query::new("how many products cost over $100"))
        .await
        .unwrap_err();

    assert_eq!(error.kind_id(), "external_timeout");
    assert!(error.to_string().contains("language model"));
}

#[tokio::test]
async fn repeating_a_structured_query_yields_the_same_items() {
    let model = Arc::new(ScriptedModel {
        sql_reply: Some(
            "SELECT item_id, title, price FROM products WHERE price > 100 ORDER BY price LIMIT 10"
                .to_string(),
        ),
        ..ScriptedModel::new()
    });

    let pipeline = pipeline(
        model,
        Arc::new(MockVectorStore::default()),
        seeded_catalog(),
        PipelineConfig::default(),
    );
    let first = pipeline
        .run(&Query::new("how many products cost over $100"))
        .await
        .unwrap();
    let second = pipeline
        .run(&Query::new("how many products cost over $100"))
        .await
        .unwrap();

    assert_eq!(first.result.items, second.result.items);
    assert_eq!(first.result.items.len(), 2);
}
