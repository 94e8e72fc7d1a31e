/*!
Error types for the scan engine
*/

use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// All error kinds the engine can surface.
///
/// Only `InvalidTarget`, registry validation failures and terminal scan
/// statuses ever reach the caller of a scan; everything else is absorbed by
/// the bus or converted into a terminal state by the controller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Target could not be parsed or canonicalised.
    #[error("invalid target '{value}': {reason}")]
    InvalidTarget { value: String, reason: String },

    /// A module attempted to emit an event of a type unknown to the registry.
    #[error("invalid event type '{0}'")]
    InvalidEventType(String),

    /// Event data was rejected by canonicalisation.
    #[error("invalid event data for type '{event_type}': {reason}")]
    InvalidEventData { event_type: String, reason: String },

    /// A module descriptor failed validation at registration.
    #[error("invalid module descriptor for '{module}': {reason}")]
    InvalidDescriptor { module: String, reason: String },

    /// Two modules registered under the same name.
    #[error("duplicate module name '{0}'")]
    DuplicateModule(String),

    /// An enable/disable list referenced a module that is not installed.
    #[error("unknown module '{0}'")]
    UnknownModule(String),

    /// A module handler returned an error.
    #[error("module '{module}' failed: {reason}")]
    ModuleHandlerFailure { module: String, reason: String },

    /// Store failure that is worth retrying (lock contention, busy database).
    #[error("transient store failure: {0}")]
    StoreTransient(String),

    /// Store failure that cannot be retried; terminates the scan.
    #[error("fatal store failure: {0}")]
    StoreFatal(String),

    /// Scan referenced by id does not exist.
    #[error("unknown scan '{0}'")]
    UnknownScan(String),

    /// The scan was cancelled by the operator. Terminal, not an error upstream.
    #[error("scan cancelled")]
    Cancelled,

    /// The scan hit its configured deadline. Terminal, not an error upstream.
    #[error("scan timed out")]
    TimedOut,

    /// Event wire-format round-trip failure.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether a store error should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::StoreTransient(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                EngineError::StoreTransient(err.to_string())
            }
            _ => EngineError::StoreFatal(err.to_string()),
        }
    }
}
