use thiserror::Error;

/// Failure to interpret a change notification pushed by the backend.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed change payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Change payload is missing `{0}`")]
    MissingField(&'static str),

    #[error("Unsupported change event type: {0}")]
    UnknownEventType(String),
}
