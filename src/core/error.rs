use thiserror::Error;

/// Failure taxonomy shared by every stage of the pipeline.
///
/// Lanes and handlers match on the variant to decide between retrying,
/// dead-lettering and giving up.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Broker unreachable or channel closed. Retried with backoff.
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    /// Payload that cannot be parsed. Dead-lettered immediately.
    #[error("poison message: {0}")]
    PoisonMessage(String),

    /// Retry budget or death ceiling exhausted. Logged and archived.
    #[error("permanent failure: {0}")]
    PermanentFailure(String),

    /// A client queue did not accept a frame in time.
    #[error("client {client_id} delivery timed out")]
    ClientDeliveryTimeout { client_id: String },

    /// Resend target is not connected right now.
    #[error("client {client_id} is not connected")]
    ClientUnavailable { client_id: String },

    /// Admission control refused a push connection.
    #[error("client rejected: {0}")]
    ClientRejected(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientTransport(_)
                | PipelineError::ClientDeliveryTimeout { .. }
                | PipelineError::ClientUnavailable { .. }
        )
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::PoisonMessage(e.to_string())
    }
}
