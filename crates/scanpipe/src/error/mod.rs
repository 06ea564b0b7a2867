use thiserror::Error;

/// Failures along the scan pipeline.
///
/// Everything up to and including result extraction is fatal to a job;
/// `FindingPersist` and the enrichment variants are logged and swallowed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to launch worker `{program}`: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited with code {code:?}: {stderr}")]
    WorkerExit { code: Option<i32>, stderr: String },

    #[error("worker timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    #[error("malformed worker output: {0}")]
    MalformedOutput(String),

    #[error("failed to persist finding `{finding_type}` from module `{module}`: {source}")]
    FindingPersist {
        module: String,
        finding_type: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("enrichment response has invalid shape: {0}")]
    InvalidEnrichmentShape(String),

    #[error("enrichment request failed: {0}")]
    EnrichmentTransport(String),

    #[error("scan queue is closed")]
    QueueClosed,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl PipelineError {
    /// Stable tag written into diagnostic payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ProcessLaunch { .. } => "process_launch_failure",
            PipelineError::WorkerExit { .. } => "worker_exit_failure",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::MalformedOutput(_) => "malformed_output",
            PipelineError::FindingPersist { .. } => "finding_persist_failure",
            PipelineError::InvalidEnrichmentShape(_) => "invalid_enrichment_shape",
            PipelineError::EnrichmentTransport(_) => "enrichment_transport",
            PipelineError::QueueClosed => "queue_closed",
            PipelineError::Store(_) => "store_failure",
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::EnrichmentTransport(e.to_string())
    }
}
