use thiserror::Error;

/// Failure kinds that callers need to tell apart. Most functions return
/// `anyhow::Result`; these mark the chain so the CLI (or an HTTP layer)
/// can classify a run-level failure without string matching.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Unknown repo, non-Git directory, archived repo. Maps to a 4xx.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Git command failed, timed out, or produced output we can't use.
    #[error("git failure: {0}")]
    Git(String),

    /// The embedding service errored or timed out. Fatal to the run;
    /// already-upserted files stay valid.
    #[error("embedding failure: {0}")]
    Embedding(String),

    /// The vector store rejected an operation. Same policy as embedding.
    #[error("vector store failure: {0}")]
    VectorStore(String),

    /// The progress consumer went away mid-run.
    #[error("indexing cancelled: {0}")]
    Cancelled(String),
}

impl IndexError {
    /// Walk an anyhow chain looking for a typed kind.
    pub fn find_in(err: &anyhow::Error) -> Option<&IndexError> {
        err.chain().find_map(|c| c.downcast_ref::<IndexError>())
    }
}
