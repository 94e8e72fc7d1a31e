/*!
In-memory Scan Store used by tests and short-lived scans
*/

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::event::Event;

use super::{AppendOutcome, EventFilter, ScanRecord, ScanStatus, ScanStore};

#[derive(Default)]
struct Inner {
    scans: BTreeMap<String, ScanRecord>,
    /// Events per scan in insertion order.
    events: HashMap<String, Vec<Event>>,
    /// (scan_id, hash) -> event id, mirroring the SQLite unique index.
    hashes: HashMap<(String, String), String>,
    edges: HashMap<String, Vec<(String, String)>>,
    edge_set: HashSet<(String, String, String)>,
    resolutions: HashMap<(String, String), Vec<String>>,
    logs: Vec<(String, String, String, String)>,
}

/// A `ScanStore` backed by process memory. Not durable; exists so scans and
/// tests can run without touching disk.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EngineResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::StoreFatal("memory store lock poisoned".to_string()))
    }
}

impl ScanStore for MemoryStore {
    fn create_scan(&self, scan: &ScanRecord) -> EngineResult<()> {
        let mut inner = self.lock()?;
        if inner.scans.contains_key(&scan.id) {
            return Err(EngineError::StoreFatal(format!(
                "scan '{}' already exists",
                scan.id
            )));
        }
        inner.scans.insert(scan.id.clone(), scan.clone());
        inner.events.insert(scan.id.clone(), Vec::new());
        Ok(())
    }

    fn get_scan(&self, scan_id: &str) -> EngineResult<Option<ScanRecord>> {
        Ok(self.lock()?.scans.get(scan_id).cloned())
    }

    fn list_scans(&self) -> EngineResult<Vec<ScanRecord>> {
        Ok(self.lock()?.scans.values().cloned().collect())
    }

    fn append_event(&self, event: &Event) -> EngineResult<AppendOutcome> {
        let mut inner = self.lock()?;
        if !inner.scans.contains_key(&event.scan_id) {
            return Err(EngineError::UnknownScan(event.scan_id.clone()));
        }
        let key = (event.scan_id.clone(), event.hash.clone());
        if let Some(existing_id) = inner.hashes.get(&key) {
            return Ok(AppendOutcome::Duplicate {
                existing_id: existing_id.clone(),
            });
        }
        inner.hashes.insert(key, event.id.clone());
        inner
            .events
            .entry(event.scan_id.clone())
            .or_default()
            .push(event.clone());
        Ok(AppendOutcome::Inserted)
    }

    fn record_edge(&self, scan_id: &str, child_id: &str, parent_id: &str) -> EngineResult<()> {
        let mut inner = self.lock()?;
        let key = (
            scan_id.to_string(),
            child_id.to_string(),
            parent_id.to_string(),
        );
        if inner.edge_set.insert(key) {
            inner
                .edges
                .entry(scan_id.to_string())
                .or_default()
                .push((child_id.to_string(), parent_id.to_string()));
        }
        Ok(())
    }

    fn edges(&self, scan_id: &str) -> EngineResult<Vec<(String, String)>> {
        Ok(self.lock()?.edges.get(scan_id).cloned().unwrap_or_default())
    }

    fn set_status(
        &self,
        scan_id: &str,
        status: ScanStatus,
        ended_at: Option<i64>,
    ) -> EngineResult<()> {
        let mut inner = self.lock()?;
        let scan = inner
            .scans
            .get_mut(scan_id)
            .ok_or_else(|| EngineError::UnknownScan(scan_id.to_string()))?;
        scan.status = status;
        if ended_at.is_some() {
            scan.ended_at = ended_at;
        }
        Ok(())
    }

    fn events(&self, scan_id: &str, filter: &EventFilter) -> EngineResult<Vec<Event>> {
        let inner = self.lock()?;
        let all = inner
            .events
            .get(scan_id)
            .ok_or_else(|| EngineError::UnknownScan(scan_id.to_string()))?;
        let mut matched: Vec<Event> = all
            .iter()
            .filter(|e| match &filter.event_type {
                Some(t) => &e.event_type == t,
                None => true,
            })
            .cloned()
            .collect();
        // Same total order as the SQLite store: created_at, then id. Ids are
        // unique, so offset-based paging restarts deterministically.
        matched.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let iter = matched.into_iter().skip(filter.offset);
        Ok(match filter.limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    fn event_count(&self, scan_id: &str) -> EngineResult<u64> {
        let inner = self.lock()?;
        Ok(inner
            .events
            .get(scan_id)
            .map(|v| v.len() as u64)
            .unwrap_or(0))
    }

    fn counts_by_type(&self, scan_id: &str) -> EngineResult<BTreeMap<String, u64>> {
        let inner = self.lock()?;
        let mut counts = BTreeMap::new();
        if let Some(events) = inner.events.get(scan_id) {
            for event in events {
                *counts.entry(event.event_type.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    fn get_resolution(&self, scan_id: &str, name: &str) -> EngineResult<Option<Vec<String>>> {
        Ok(self
            .lock()?
            .resolutions
            .get(&(scan_id.to_string(), name.to_string()))
            .cloned())
    }

    fn put_resolution(&self, scan_id: &str, name: &str, addresses: &[String]) -> EngineResult<()> {
        self.lock()?
            .resolutions
            .insert((scan_id.to_string(), name.to_string()), addresses.to_vec());
        Ok(())
    }

    fn append_log(
        &self,
        scan_id: &str,
        level: &str,
        component: &str,
        message: &str,
    ) -> EngineResult<()> {
        self.lock()?.logs.push((
            scan_id.to_string(),
            level.to_string(),
            component.to_string(),
            message.to_string(),
        ));
        Ok(())
    }
}
