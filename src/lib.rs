pub mod database;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod settings;
pub mod vector_db;

pub use database::{CatalogItem, CatalogStore, SqliteCatalog};
pub use error::PipelineError;
pub use llm::{LanguageModel, OllamaModel};
pub use pipeline::types::{Answer, ChatRequest, ChatResponse, Intent, Query};
pub use pipeline::{ChatPipeline, PipelineConfig};
pub use settings::Settings;
pub use vector_db::{QdrantStore, VectorStore};
