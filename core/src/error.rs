use thiserror::Error;

/// Core error type.
///
/// Every public operation returns `Result<T, CoreError>`. Lower-level
/// failures (storage, codec, radio) are mapped into one of these kinds
/// before reaching a caller. Recoverable radio-side conditions
/// (`DutyCycleDenied`, `Timeout`) are normally handled inside the mesh
/// layer and only surface through events.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// Structural or semantic transaction/block failure. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Linkage, PoW, or merkle mismatch. The block is discarded.
    #[error("consensus rejection: {0}")]
    Consensus(String),

    /// Double-spend or missing input.
    #[error("utxo conflict: {0}")]
    UtxoConflict(String),

    /// Storage I/O failed. The mutation was aborted; in-memory state
    /// is unchanged.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Admission refused by the duty-cycle manager. `wait_ms` is the
    /// computed time until the window frees enough budget.
    #[error("duty cycle denied: retry in {wait_ms} ms")]
    DutyCycleDenied { wait_ms: u64 },

    /// Destination unreachable. The caller may trigger route discovery.
    #[error("no route to {0}")]
    NoRoute(String),

    /// Ack, reassembly, or discovery deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed frame, unknown version, unknown dictionary. Frame dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Incompatible genesis or out-of-range parameter. Initialization aborts.
    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<heed::Error> for CoreError {
    fn from(e: heed::Error) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

impl From<bincode::Error> for CoreError {
    fn from(e: bincode::Error) -> Self {
        CoreError::Protocol(format!("encoding: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_detail() {
        let e = CoreError::UtxoConflict("outpoint abc:0 already spent".into());
        assert!(e.to_string().contains("abc:0"));
    }

    #[test]
    fn test_duty_cycle_denied_wait_time() {
        let e = CoreError::DutyCycleDenied { wait_ms: 1500 };
        assert!(e.to_string().contains("1500"));
    }
}
