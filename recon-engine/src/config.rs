/*!
Engine configuration
*/

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Per-scan policy knobs, resolved once at scan start and frozen into the
/// scan's config snapshot.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deliveries for events deeper than this are dropped at dispatch time;
    /// the events themselves are still persisted.
    pub max_depth: u32,
    /// High-water mark of the bus queue; `emit` blocks above it.
    pub queue_capacity: usize,
    /// How long to wait for handlers after cancellation before tearing
    /// workers down.
    pub graceful_timeout_ms: u64,
    /// Overall scan deadline. `None` means no deadline.
    pub scan_timeout_ms: Option<u64>,
    /// Dispatch events marked out of scope instead of only persisting them.
    pub dispatch_out_of_scope: bool,
    /// Retry budget for transient store failures on append.
    pub store_retry_limit: u32,
    /// Base delay for exponential store retry backoff.
    pub store_retry_base_ms: u64,
    /// Per-module option overrides, merged over descriptor defaults.
    pub module_options: HashMap<String, HashMap<String, String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 16,
            queue_capacity: 1024,
            graceful_timeout_ms: 5_000,
            scan_timeout_ms: None,
            dispatch_out_of_scope: false,
            store_retry_limit: 4,
            store_retry_base_ms: 100,
            module_options: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.as_ref().display())))?;
        toml::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))
    }
}
