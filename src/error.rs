// Typed errors for the cache core.
//
// Recoverable kinds (Miss, NotFound, BudgetExceeded) are surfaced as values
// up to the nearest handler. Network and ProtocolState tear down the
// affected connection; Unsupported, Argument and MustNotHappen are caller
// errors and abort the operation loudly.

use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Lookup failed both locally and remotely. The operator runner
    /// recomputes and calls `put`.
    #[error("cache miss")]
    Miss,

    /// A key or ref points to an evicted or unknown entry.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// A `put` would exceed the byte budget beyond the 10% soft margin.
    #[error("cache budget exceeded: need {needed} bytes, {available} available")]
    BudgetExceeded { needed: u64, available: u64 },

    /// Socket error, framing violation, magic mismatch or timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Received a reply code that is not valid in the current state.
    #[error("protocol state error: {0}")]
    ProtocolState(String),

    /// Operation outside the result type's contract.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Input violates an invariant (e.g. x1 > x2).
    #[error("illegal argument: {0}")]
    Argument(String),

    /// Contract between core components violated. Programmer error.
    #[error("must not happen: {0}")]
    MustNotHappen(String),
}

impl CacheError {
    /// True for kinds a caller may handle by retrying or recomputing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CacheError::Miss | CacheError::NotFound(_) | CacheError::BudgetExceeded { .. }
        )
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Network(e.to_string())
    }
}

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::Network(format!("encoding: {e}"))
    }
}
