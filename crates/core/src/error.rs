#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// Malformed workflow graph or override input.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Malformed binary payload (undecodable base64, empty buffer, ...).
    #[error("Invalid data: {0}")]
    Data(String),
}
