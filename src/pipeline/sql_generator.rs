use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::error::PipelineError;
use crate::llm::LanguageModel;
use crate::pipeline::strip_code_fences;
use crate::pipeline::types::Query;

/// Catalog schema description handed to the model verbatim. The guard's
/// allow-list mirrors this; keep the two in sync.
const SCHEMA_DOC: &str = "\
Table: products
Columns:
  - item_id: TEXT PRIMARY KEY - catalog item identifier
  - title: TEXT - product title
  - description: TEXT - product description
  - price: REAL - price in USD
  - rating: REAL - average customer rating (1.0-5.0)
  - rating_count: INTEGER - number of customer ratings
  - category: TEXT - product category (e.g. 'Headphones')

Indexes available on: price, rating, category";

/// Translates an analytic question into a single SELECT against the catalog
/// schema. Output is raw model text; the guard validates it before anything
/// executes. The call is bounded by the configured timeout but never retried,
/// since generation is not idempotent.
pub struct SqlGenerator {
    model: Arc<dyn LanguageModel>,
    row_cap: u64,
    call_timeout: Duration,
}

impl SqlGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, row_cap: u64, call_timeout: Duration) -> Self {
        Self {
            model,
            row_cap,
            call_timeout,
        }
    }

    pub async fn generate(&self, query: &Query) -> Result<String, PipelineError> {
        let prompt = format!(
            "You are a SQL expert. Generate a SQLite query based on the user's question.\n\n\
            {SCHEMA_DOC}\n\n\
            Rules:\n\
            1. Only generate a single SELECT query (no INSERT, UPDATE, DELETE, DDL)\n\
            2. Always include a LIMIT clause (max {row_cap} rows)\n\
            3. Use LIKE for case-insensitive text matching\n\
            4. Always include item_id in the select list when returning product rows\n\
            5. Return ONLY the SQL query, no explanations\n\n\
            User question: {question}\n\n\
            SQL Query:",
            row_cap = self.row_cap,
            question = query.text,
        );

        let reply = match timeout(
            self.call_timeout,
            self.model.generate(&prompt, &query.request_id),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(source)) => {
                return Err(PipelineError::ServiceUnavailable {
                    service: "language model",
                    source,
                })
            }
            Err(_) => {
                return Err(PipelineError::ExternalServiceTimeout {
                    service: "language model",
                    attempts: 1,
                })
            }
        };

        let sql = strip_code_fences(&reply).trim().to_string();
        debug!(request_id = %query.request_id, sql, "generated catalog query");
        Ok(sql)
    }
}
