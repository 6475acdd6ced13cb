//! The three retrieval executors. Each is idempotent and side-effect-free
//! beyond its external read calls; every external call is wrapped with a
//! timeout and retried a fixed number of times because the reads are
//! idempotent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::database::{CatalogRow, CatalogStore};
use crate::error::PipelineError;
use crate::llm::LanguageModel;
use crate::pipeline::filters::ExtractedFilters;
use crate::pipeline::types::{
    FilterPredicate, Provenance, Query, RetrievalPath, RetrievalResult, RetrievedItem, SqlValue,
    StructuredQuery,
};
use crate::vector_db::{VectorHit, VectorStore};

/// Timeout/retry policy applied to every external read call.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

pub(crate) async fn call_with_retry<T, F, Fut>(
    service: &'static str,
    policy: CallPolicy,
    mut call: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.max_retries + 1;
    let mut last_error: Option<anyhow::Error> = None;
    for attempt in 1..=attempts {
        match timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => {
                warn!(service, attempt, %error, "external call failed");
                last_error = Some(error);
            }
            Err(_) => {
                warn!(service, attempt, "external call timed out");
                last_error = None;
            }
        }
    }
    match last_error {
        Some(source) => Err(PipelineError::ServiceUnavailable { service, source }),
        None => Err(PipelineError::ExternalServiceTimeout { service, attempts }),
    }
}

/// Map one generic row to an item. Product rows carry the known columns;
/// aggregate rows (COUNT, AVG) fall back to a rendering of the row itself so
/// the composer can still ground on them.
fn item_from_row(row: &CatalogRow, rank: usize) -> RetrievedItem {
    let item_id = row
        .get_str("item_id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("row-{}", rank + 1));
    let title = row
        .get_str("title")
        .map(str::to_string)
        .unwrap_or_else(|| summarize_row(row));
    RetrievedItem {
        item_id,
        title,
        description: row.get_str("description").unwrap_or("").to_string(),
        price: row.get_f64("price"),
        rating: row.get_f64("rating"),
        category: row.get_str("category").map(str::to_string),
        score: None,
    }
}

fn summarize_row(row: &CatalogRow) -> String {
    row.columns
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn hydration_query(ids: &[String]) -> StructuredQuery {
    let placeholders = (1..=ids.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    StructuredQuery {
        sql: format!(
            "SELECT item_id, title, description, price, rating, category \
             FROM products WHERE item_id IN ({placeholders})"
        ),
        params: ids.iter().cloned().map(SqlValue::Text).collect(),
    }
}

/// Fetch full item records for a set of ids, keyed by id. Ids unknown to the
/// catalog are simply absent from the map.
async fn fetch_items(
    catalog: &Arc<dyn CatalogStore>,
    ids: &[String],
    policy: CallPolicy,
    request_id: &str,
) -> Result<HashMap<String, RetrievedItem>, PipelineError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let query = hydration_query(ids);
    let rows = call_with_retry("catalog store", policy, || {
        catalog.execute_readonly(&query, request_id)
    })
    .await?;
    Ok(rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let item = item_from_row(row, i);
            (item.item_id.clone(), item)
        })
        .collect())
}

/// Resolve hits to full items, preserving hit order (descending similarity)
/// and attaching the similarity score.
async fn hydrate_hits(
    catalog: &Arc<dyn CatalogStore>,
    hits: &[VectorHit],
    policy: CallPolicy,
    request_id: &str,
) -> Result<Vec<RetrievedItem>, PipelineError> {
    let ids: Vec<String> = hits.iter().map(|h| h.item_id.clone()).collect();
    let mut by_id = fetch_items(catalog, &ids, policy, request_id).await?;
    Ok(hits
        .iter()
        .filter_map(|hit| {
            let mut item = by_id.remove(&hit.item_id)?;
            item.score = Some(hit.score);
            Some(item)
        })
        .collect())
}

/// Semantic path: embed the query text, search top-k nearest neighbors,
/// resolve hits against the catalog.
pub struct SemanticExecutor {
    model: Arc<dyn LanguageModel>,
    vectors: Arc<dyn VectorStore>,
    catalog: Arc<dyn CatalogStore>,
    top_k: usize,
    policy: CallPolicy,
}

impl SemanticExecutor {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        vectors: Arc<dyn VectorStore>,
        catalog: Arc<dyn CatalogStore>,
        top_k: usize,
        policy: CallPolicy,
    ) -> Self {
        Self {
            model,
            vectors,
            catalog,
            top_k,
            policy,
        }
    }

    pub async fn execute(
        &self,
        query: &Query,
        search_text: &str,
    ) -> Result<RetrievalResult, PipelineError> {
        let vector = call_with_retry("embedding service", self.policy, || {
            self.model.embed(search_text, &query.request_id)
        })
        .await?;

        let hits = call_with_retry("vector store", self.policy, || {
            self.vectors
                .search(vector.clone(), self.top_k, None, &query.request_id)
        })
        .await?;

        let items = hydrate_hits(&self.catalog, &hits, self.policy, &query.request_id).await?;
        debug!(request_id = %query.request_id, items = items.len(), "semantic retrieval done");

        Ok(RetrievalResult {
            items,
            provenance: Provenance {
                paths: vec![RetrievalPath::Semantic],
                ..Default::default()
            },
        })
    }
}

/// Structured path: execute the guarded statement, map rows in row order.
pub struct StructuredExecutor {
    catalog: Arc<dyn CatalogStore>,
    policy: CallPolicy,
}

impl StructuredExecutor {
    pub fn new(catalog: Arc<dyn CatalogStore>, policy: CallPolicy) -> Self {
        Self { catalog, policy }
    }

    pub async fn execute(
        &self,
        query: &Query,
        structured: &StructuredQuery,
    ) -> Result<RetrievalResult, PipelineError> {
        let rows = call_with_retry("catalog store", self.policy, || {
            self.catalog.execute_readonly(structured, &query.request_id)
        })
        .await?;

        let items = rows
            .iter()
            .enumerate()
            .map(|(i, row)| item_from_row(row, i))
            .collect::<Vec<_>>();
        debug!(request_id = %query.request_id, items = items.len(), "structured retrieval done");

        Ok(RetrievalResult {
            items,
            provenance: Provenance {
                paths: vec![RetrievalPath::Structured],
                executed_sql: Some(structured.sql.clone()),
                ..Default::default()
            },
        })
    }
}

/// Build the parameterized candidate query for a predicate. Fixed template,
/// no model involvement, so it needs no guard pass.
fn candidate_query(predicate: &FilterPredicate, limit: usize) -> StructuredQuery {
    let mut conditions = Vec::new();
    let mut params = Vec::new();

    if let Some(lo) = predicate.price_min {
        params.push(SqlValue::Float(lo));
        conditions.push(format!("price >= ?{}", params.len()));
    }
    if let Some(hi) = predicate.price_max {
        params.push(SqlValue::Float(hi));
        conditions.push(format!("price <= ?{}", params.len()));
    }
    if let Some(min) = predicate.rating_min {
        params.push(SqlValue::Float(min));
        conditions.push(format!("rating >= ?{}", params.len()));
    }
    if let Some(ref category) = predicate.category {
        params.push(SqlValue::Text(format!("%{category}%")));
        conditions.push(format!("category LIKE ?{}", params.len()));
    }

    let where_clause = if conditions.is_empty() {
        "1 = 1".to_string()
    } else {
        conditions.join(" AND ")
    };

    StructuredQuery {
        sql: format!("SELECT item_id FROM products WHERE {where_clause} LIMIT {limit}"),
        params,
    }
}

/// Hybrid path, two phases run strictly in sequence: the structured phase
/// collects the candidate id set for the predicate, then the semantic search
/// runs constrained to those ids. Zero candidates short-circuits to an empty
/// result; the filters a user expressed are never dropped in favor of an
/// unconstrained search.
pub struct HybridExecutor {
    model: Arc<dyn LanguageModel>,
    vectors: Arc<dyn VectorStore>,
    catalog: Arc<dyn CatalogStore>,
    top_k: usize,
    candidate_limit: usize,
    policy: CallPolicy,
}

impl HybridExecutor {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        vectors: Arc<dyn VectorStore>,
        catalog: Arc<dyn CatalogStore>,
        top_k: usize,
        candidate_limit: usize,
        policy: CallPolicy,
    ) -> Self {
        Self {
            model,
            vectors,
            catalog,
            top_k,
            candidate_limit,
            policy,
        }
    }

    pub async fn execute(
        &self,
        query: &Query,
        extracted: &ExtractedFilters,
    ) -> Result<RetrievalResult, PipelineError> {
        let predicate = extracted.predicate.clone().normalized();
        let candidate_sql = candidate_query(&predicate, self.candidate_limit);

        let rows = call_with_retry("catalog store", self.policy, || {
            self.catalog.execute_readonly(&candidate_sql, &query.request_id)
        })
        .await?;
        let candidates: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get_str("item_id").map(str::to_string))
            .collect();

        let mut provenance = Provenance {
            paths: vec![RetrievalPath::Structured],
            executed_sql: Some(candidate_sql.sql.clone()),
            filters: Some(predicate.clone()),
            candidate_count: Some(candidates.len()),
            ..Default::default()
        };

        if candidates.is_empty() {
            debug!(
                request_id = %query.request_id,
                "no candidates satisfy the filter; short-circuiting to an empty result"
            );
            return Ok(RetrievalResult::empty(provenance));
        }

        match self
            .semantic_leg(query, &extracted.semantic_query, &candidates)
            .await
        {
            Ok(items) => {
                provenance.paths.push(RetrievalPath::Semantic);
                Ok(RetrievalResult { items, provenance })
            }
            // Vector leg down: degrade to the structured candidates instead
            // of aborting the whole query.
            Err(error) => {
                warn!(
                    request_id = %query.request_id,
                    %error,
                    "semantic leg failed; degrading to structured-only results"
                );
                provenance.degraded_retrieval = true;
                let ids: Vec<String> = candidates.into_iter().take(self.top_k).collect();
                let mut by_id =
                    fetch_items(&self.catalog, &ids, self.policy, &query.request_id).await?;
                let items = ids.iter().filter_map(|id| by_id.remove(id)).collect();
                Ok(RetrievalResult { items, provenance })
            }
        }
    }

    async fn semantic_leg(
        &self,
        query: &Query,
        search_text: &str,
        candidates: &[String],
    ) -> Result<Vec<RetrievedItem>, PipelineError> {
        let vector = call_with_retry("embedding service", self.policy, || {
            self.model.embed(search_text, &query.request_id)
        })
        .await?;

        let hits = call_with_retry("vector store", self.policy, || {
            self.vectors.search(
                vector.clone(),
                self.top_k,
                Some(candidates),
                &query.request_id,
            )
        })
        .await?;

        hydrate_hits(&self.catalog, &hits, self.policy, &query.request_id).await
    }
}
