use thiserror::Error;

/// Failures of the SystemInfo and trace event decoders.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A trace or SystemInfo payload is not JSON, or a trace payload has no
    /// `traceEvents` array.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),
    /// The SystemInfo payload does not describe a usable clock reference.
    #[error("invalid clock reference: {0}")]
    InvalidClock(String),
}
