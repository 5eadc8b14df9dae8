use thiserror::Error;

/// Engine-level errors. Invariant violations inside the struct store panic
/// (they indicate a bug, not a recoverable condition); missing remote
/// dependencies are not errors at all - they are parked until resolvable.
#[derive(Debug, Error)]
pub enum Error {
    /// A binary payload (update, state vector or sync message) could not be
    /// decoded. The whole message is rejected; no partial state was applied.
    #[error("failed to decode binary payload: {0}")]
    Decoding(#[from] bin0::error::Error),
}
