use anyhow::Result;
use async_trait::async_trait;
use qdrant_client::{
    qdrant::{value::Kind, Condition, Filter, QueryPointsBuilder},
    Qdrant,
};
use tracing::debug;

/// One nearest-neighbor hit: a catalog item id plus its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub item_id: String,
    pub score: f32,
}

/// Nearest-neighbor search over item embeddings. When `candidates` is given,
/// the search is constrained to those item ids with a payload filter rather
/// than searched unconstrained and intersected afterwards.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn search(
        &self,
        vector: Vec<f32>,
        k: usize,
        candidates: Option<&[String]>,
        request_id: &str,
    ) -> Result<Vec<VectorHit>>;
}

/// Qdrant-backed store. Points are expected to carry the catalog item id in
/// an `item_id` payload field.
pub struct QdrantStore {
    client: Qdrant,
    collection: String,
}

impl QdrantStore {
    pub fn connect(url: &str, collection: &str) -> Result<Self> {
        let client = Qdrant::from_url(url).build()?;
        Ok(Self {
            client,
            collection: collection.to_string(),
        })
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn search(
        &self,
        vector: Vec<f32>,
        k: usize,
        candidates: Option<&[String]>,
        request_id: &str,
    ) -> Result<Vec<VectorHit>> {
        let mut request = QueryPointsBuilder::new(&self.collection)
            .query(vector)
            .limit(k as u64)
            .with_payload(true);

        if let Some(ids) = candidates {
            request = request.filter(Filter::must([Condition::matches(
                "item_id",
                ids.to_vec(),
            )]));
        }

        let response = self.client.query(request).await?;
        debug!(
            request_id,
            collection = %self.collection,
            hits = response.result.len(),
            "vector search completed"
        );

        let hits = response
            .result
            .into_iter()
            .filter_map(|point| {
                let item_id = point.payload.get("item_id").and_then(|value| {
                    match value.kind.as_ref() {
                        Some(Kind::StringValue(s)) => Some(s.clone()),
                        _ => None,
                    }
                })?;
                Some(VectorHit {
                    item_id,
                    score: point.score,
                })
            })
            .collect();

        Ok(hits)
    }
}
