//! Error types for the payment agent

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Data Validity (fatal per computation, never retried)
    // =============================

    #[error("Malformed bill {id}: {reason}")]
    MalformedBill { id: String, reason: String },

    // =============================
    // Recoverable Input (re-prompt, no state change)
    // =============================

    #[error("Unparsable date: {0}")]
    InvalidDate(String),

    #[error("Unknown bill id: {0}")]
    UnknownBill(String),

    // =============================
    // Collaborator Failures (state untouched, degraded response)
    // =============================

    #[error("Bill repository error: {0}")]
    Repository(String),

    #[error("Intent classifier error: {0}")]
    Classifier(String),

    #[error("Response renderer error: {0}")]
    Renderer(String),

    #[error("LLM error: {0}")]
    Llm(String),

    // =============================
    // Defensive (assert and reject, never silently mutate)
    // =============================

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Unknown session: {0}")]
    UnknownSession(uuid::Uuid),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Recoverable-input errors are answered with a re-prompt instead of
    /// aborting the turn.
    pub fn is_recoverable_input(&self) -> bool {
        matches!(self, AgentError::InvalidDate(_) | AgentError::UnknownBill(_))
    }
}
