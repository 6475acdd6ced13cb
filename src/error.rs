use thiserror::Error;

/// Externally visible failure kinds. Each variant carries a stable string
/// identifier and a `Display` message that is safe to show to the caller;
/// upstream causes stay on the source chain for the logs.
///
/// Locally recovered conditions (degraded classification, ambiguous filter
/// extraction, empty result sets) are not errors. They flow through result
/// provenance or a valid "no matching items" answer instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The guard rejected a generated statement. The statement itself is
    /// logged at the rejection site and never echoed to the caller.
    #[error("the generated catalog query was rejected for safety reasons")]
    UnsafeQuery { reason: String },

    #[error("{service} did not respond in time after {attempts} attempt(s)")]
    ExternalServiceTimeout { service: &'static str, attempts: u32 },

    #[error("{service} is currently unavailable")]
    ServiceUnavailable {
        service: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("answer generation failed")]
    GenerationFailed {
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Stable identifier for API consumers and log correlation.
    pub fn kind_id(&self) -> &'static str {
        match self {
            PipelineError::UnsafeQuery { .. } => "unsafe_query",
            PipelineError::ExternalServiceTimeout { .. } => "external_timeout",
            PipelineError::ServiceUnavailable { .. } => "service_unavailable",
            PipelineError::GenerationFailed { .. } => "generation_failed",
        }
    }
}
