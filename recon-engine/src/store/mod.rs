/*!
Scan Store: durable, append-only event log and scan metadata
*/

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::event::Event;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Scan lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Created,
    Starting,
    Running,
    Finishing,
    Finished,
    Aborting,
    Aborted,
    TimedOut,
    Errored,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Created => "CREATED",
            ScanStatus::Starting => "STARTING",
            ScanStatus::Running => "RUNNING",
            ScanStatus::Finishing => "FINISHING",
            ScanStatus::Finished => "FINISHED",
            ScanStatus::Aborting => "ABORTING",
            ScanStatus::Aborted => "ABORTED",
            ScanStatus::TimedOut => "TIMED_OUT",
            ScanStatus::Errored => "ERRORED",
        }
    }

    pub fn parse(s: &str) -> Option<ScanStatus> {
        match s {
            "CREATED" => Some(ScanStatus::Created),
            "STARTING" => Some(ScanStatus::Starting),
            "RUNNING" => Some(ScanStatus::Running),
            "FINISHING" => Some(ScanStatus::Finishing),
            "FINISHED" => Some(ScanStatus::Finished),
            "ABORTING" => Some(ScanStatus::Aborting),
            "ABORTED" => Some(ScanStatus::Aborted),
            "TIMED_OUT" => Some(ScanStatus::TimedOut),
            "ERRORED" => Some(ScanStatus::Errored),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Finished | ScanStatus::Aborted | ScanStatus::TimedOut | ScanStatus::Errored
        )
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted scan metadata. Append-only after creation apart from `status`
/// and `ended_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: String,
    pub name: String,
    pub target_kind: String,
    pub target_value: String,
    pub created_at: i64,
    pub ended_at: Option<i64>,
    pub status: ScanStatus,
    /// Resolved option map (engine + per-module) frozen at start.
    pub config_json: String,
}

/// Outcome of an `append_event` call. `Duplicate` is not an error; it carries
/// the id of the already-persisted event with the same `(scan_id, hash)` so
/// the caller can still record the causal edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Duplicate { existing_id: String },
}

/// Query filter for the event log.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn by_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Self::default()
        }
    }
}

/// Append-only persistence interface for scans, events and configuration
/// snapshots. Implementations must enforce `UNIQUE(scan_id, hash)` on events
/// atomically; the scheduler treats the Inserted/Duplicate outcome as the
/// single source of truth for deduplication.
pub trait ScanStore: Send + Sync {
    fn create_scan(&self, scan: &ScanRecord) -> EngineResult<()>;

    fn get_scan(&self, scan_id: &str) -> EngineResult<Option<ScanRecord>>;

    fn list_scans(&self) -> EngineResult<Vec<ScanRecord>>;

    /// Atomic append; duplicate `(scan_id, hash)` submissions are dropped and
    /// reported, never treated as failures.
    fn append_event(&self, event: &Event) -> EngineResult<AppendOutcome>;

    /// Record a causal edge. Called even when the child was a duplicate.
    fn record_edge(&self, scan_id: &str, child_id: &str, parent_id: &str) -> EngineResult<()>;

    /// All recorded causal edges as `(child_id, parent_id)` pairs.
    fn edges(&self, scan_id: &str) -> EngineResult<Vec<(String, String)>>;

    fn set_status(
        &self,
        scan_id: &str,
        status: ScanStatus,
        ended_at: Option<i64>,
    ) -> EngineResult<()>;

    /// Events in persistence order (created_at, then insertion order).
    /// Restartable via the filter's offset.
    fn events(&self, scan_id: &str, filter: &EventFilter) -> EngineResult<Vec<Event>>;

    fn event_count(&self, scan_id: &str) -> EngineResult<u64>;

    fn counts_by_type(&self, scan_id: &str) -> EngineResult<BTreeMap<String, u64>>;

    /// Scan-scoped DNS resolution cache shared between modules.
    fn get_resolution(&self, scan_id: &str, name: &str) -> EngineResult<Option<Vec<String>>>;

    fn put_resolution(&self, scan_id: &str, name: &str, addresses: &[String]) -> EngineResult<()>;

    /// Per-scan operational log, separate from the event stream.
    fn append_log(
        &self,
        scan_id: &str,
        level: &str,
        component: &str,
        message: &str,
    ) -> EngineResult<()>;
}

const STREAM_PAGE_SIZE: usize = 256;

/// Lazy, restartable stream over a scan's events, paging through the store.
/// This is the "stream events" surface handed to external collaborators.
pub fn event_stream(
    store: Arc<dyn ScanStore>,
    scan_id: String,
    filter: EventFilter,
) -> impl Stream<Item = EngineResult<Event>> {
    async_stream::try_stream! {
        let mut offset = filter.offset;
        let mut remaining = filter.limit;
        loop {
            let page_limit = match remaining {
                Some(n) => n.min(STREAM_PAGE_SIZE),
                None => STREAM_PAGE_SIZE,
            };
            if page_limit == 0 {
                break;
            }
            let page = store.events(
                &scan_id,
                &EventFilter {
                    event_type: filter.event_type.clone(),
                    offset,
                    limit: Some(page_limit),
                },
            )?;
            let fetched = page.len();
            for event in page {
                yield event;
            }
            if fetched < page_limit {
                break;
            }
            offset += fetched;
            if let Some(n) = remaining.as_mut() {
                *n -= fetched;
            }
        }
    }
}

/// Ensure the referenced scan exists, mapping absence to `UnknownScan`.
pub(crate) fn require_scan(store: &dyn ScanStore, scan_id: &str) -> EngineResult<ScanRecord> {
    store
        .get_scan(scan_id)?
        .ok_or_else(|| EngineError::UnknownScan(scan_id.to_string()))
}
