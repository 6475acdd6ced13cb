// src/settings.rs

use std::path::Path;
use std::time::Duration;

use clap::Parser;
use config::{builder::DefaultState, ConfigBuilder, ConfigError, File};
use serde::{Deserialize, Serialize};

use crate::pipeline::sql_guard::GuardPolicy;
use crate::pipeline::PipelineConfig;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Args {
    /// Path to the local configuration TOML file.
    #[arg(short, value_name = "CONFIG_PATH")]
    pub config: std::path::PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LlmSettings {
    pub ollama_url: String,
    pub completion_model: String,
    pub embedding_model: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VectorDbSettings {
    pub qdrant_url: String,
    pub collection: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogSettings {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub row_cap: u64,
    pub candidate_limit: usize,
    pub max_context_items: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Settings {
    pub llm: LlmSettings,
    pub vector_db: VectorDbSettings,
    pub catalog: CatalogSettings,
    pub retrieval: RetrievalSettings,
}

impl Settings {
    /// Load settings from the given TOML file, with sane defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let builder = ConfigBuilder::<DefaultState>::default()
            .set_default("llm.ollama_url", "http://127.0.0.1:11434")?
            .set_default("llm.completion_model", "llama3.2")?
            .set_default("llm.embedding_model", "nomic-embed-text")?
            .set_default("vector_db.qdrant_url", "http://127.0.0.1:6334")?
            .set_default("vector_db.collection", "products")?
            .set_default("catalog.path", "catalog.db")?
            .set_default("retrieval.top_k", 10)?
            .set_default("retrieval.row_cap", 50)?
            .set_default("retrieval.candidate_limit", 100)?
            .set_default("retrieval.max_context_items", 8)?
            .set_default("retrieval.timeout_secs", 30)?
            .set_default("retrieval.max_retries", 2)?;

        let cfg = builder.add_source(File::from(path)).build()?;

        cfg.try_deserialize()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            top_k: self.retrieval.top_k,
            row_cap: self.retrieval.row_cap,
            candidate_limit: self.retrieval.candidate_limit,
            max_context_items: self.retrieval.max_context_items,
            call_timeout: Duration::from_secs(self.retrieval.timeout_secs),
            max_retries: self.retrieval.max_retries,
            guard: GuardPolicy::catalog(self.retrieval.row_cap),
        }
    }
}
