/// Typed error taxonomy for the processor (spec.md §7).
///
/// Grounded on `examples/nervana21-bitcoin-rpc-codegen/core`, the pack's
/// `thiserror` user, layered over the teacher's plain `MyError` for the
/// request-facing `{id, error}` shape (`crate::types::MyError`).
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Daemon temporarily unreachable or still warming up (JSON-RPC -28).
    /// Caller should pause and retry; never surfaced to a requester directly.
    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// Fatal daemon JSON-RPC error (-342, -343, -1). Propagated to the
    /// requester as an error response; does not crash the catch-up worker.
    #[error("daemon error: {0}")]
    DaemonFatal(String),

    /// Daemon rejected a broadcast (e.g. code -26). Translated to a
    /// human-readable rejection and returned as a normal (non-error) result.
    #[error("rejected by network rules: {0}")]
    DaemonRejected(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("uri parse error: {0}")]
    UriParse(String),

    /// Mempool refresh could not resolve a prevout (UTXO not yet imported).
    /// Refresh aborts cleanly; a later tick retries.
    #[error("mempool dependency missing: {0}")]
    MempoolDependencyMissing(String),

    /// A safety invariant was violated (duplicate session after single
    /// removal, non-empty undo map after revert). Fatal: caller should stop
    /// the service.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("batch too large: {0}")]
    BatchTooLarge(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Other(String),
}

/// Failure reading or writing the persistent index. The teacher never pulls
/// in `anyhow` for this, so it gets its own small `thiserror` type instead.
#[derive(Debug, Error)]
#[error("storage error: {0}")]
pub struct StorageError(pub String);

impl StorageError {
    pub fn new(msg: impl Into<String>) -> Self {
        StorageError(msg.into())
    }
}

impl ProcessorError {
    /// Classify a daemon JSON-RPC error code per spec.md §5/§7.
    pub fn from_rpc_error(code: i64, message: &str) -> Self {
        match code {
            -28 => ProcessorError::DaemonUnavailable(message.to_string()),
            -342 | -343 | -1 => ProcessorError::DaemonFatal(message.to_string()),
            -26 => ProcessorError::DaemonRejected(message.to_string()),
            _ => ProcessorError::DaemonFatal(format!("[{}] {}", code, message)),
        }
    }
}

pub type ProcResult<T> = Result<T, ProcessorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_warming_up_as_unavailable() {
        match ProcessorError::from_rpc_error(-28, "still warming up") {
            ProcessorError::DaemonUnavailable(_) => {}
            other => panic!("expected DaemonUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn classifies_missing_result_as_fatal() {
        for code in [-342, -343, -1] {
            match ProcessorError::from_rpc_error(code, "boom") {
                ProcessorError::DaemonFatal(_) => {}
                other => panic!("expected DaemonFatal for {}, got {:?}", code, other),
            }
        }
    }

    #[test]
    fn classifies_broadcast_rejection() {
        match ProcessorError::from_rpc_error(-26, "bad-txns-inputs-missingorspent") {
            ProcessorError::DaemonRejected(msg) => assert_eq!(msg, "bad-txns-inputs-missingorspent"),
            other => panic!("expected DaemonRejected, got {:?}", other),
        }
    }
}
