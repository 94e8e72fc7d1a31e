/*!
Scan controller: lifecycle state machine wrapping one scan from CREATED
through a terminal status
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::{self, ActiveModule, BusHandle, SignalHandle};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::event::{EventFactory, ROOT_MODULE, now_ms};
use crate::registry::{ModuleDescriptor, ModuleRegistry, USE_CASE_ALL};
use crate::store::{ScanRecord, ScanStatus, ScanStore};
use crate::target::{Scope, Target, TargetKind};

/// Everything needed to launch one scan.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub name: String,
    /// Raw target value; kind is detected unless `target_kind` pins it.
    pub target: String,
    pub target_kind: Option<TargetKind>,
    pub use_case: String,
    /// Modules to run regardless of use case.
    pub enable: Vec<String>,
    /// Modules excluded even if the use case selects them.
    pub disable: Vec<String>,
    /// Reuse an existing scan id. Seeds are deduplicated against the
    /// persisted log, so relaunching an interrupted scan does not duplicate
    /// or reorder what it already recorded.
    pub scan_id: Option<String>,
    /// Per-module option overrides, applied over the engine config's.
    pub module_options: HashMap<String, HashMap<String, String>>,
}

impl ScanRequest {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            target_kind: None,
            use_case: USE_CASE_ALL.to_string(),
            enable: Vec::new(),
            disable: Vec::new(),
            scan_id: None,
            module_options: HashMap::new(),
        }
    }
}

/// Point-in-time scan counters for operator display.
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub status: ScanStatus,
    pub events_total: u64,
    pub events_by_type: std::collections::BTreeMap<String, u64>,
    pub in_flight: u64,
    pub elapsed_ms: u64,
}

/// Drives one scan: plans the module set, seeds the bus, supervises idle
/// detection and deadlines, and lands the scan on exactly one terminal
/// status (FINISHED, ABORTED, TIMED_OUT or ERRORED).
pub struct ScanController {
    scan_id: String,
    store: Arc<dyn ScanStore>,
    signal: SignalHandle,
    status_rx: watch::Receiver<ScanStatus>,
    pending: Arc<AtomicU64>,
    fatal: Arc<Mutex<Option<String>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl ScanController {
    /// Plan and launch a scan. Returns once the scan is RUNNING with its
    /// seed events enqueued; completion is observed through `wait`.
    pub async fn start(
        registry: &ModuleRegistry,
        store: Arc<dyn ScanStore>,
        config: EngineConfig,
        request: ScanRequest,
    ) -> EngineResult<ScanController> {
        let target = Target::parse(request.target_kind, &request.target)?;
        let selected = registry.select(
            &target,
            &request.use_case,
            &request.enable,
            &request.disable,
        )?;
        if selected.is_empty() {
            warn!(target = %target.value, "no modules reachable from target; scan will only record seeds");
        }

        let scan_id = match &request.scan_id {
            Some(id) => id.clone(),
            None => derive_scan_id(&request.name, &target.value),
        };

        let module_names: Vec<&str> = selected.iter().map(|d| d.name.as_str()).collect();
        info!(
            scan = %scan_id,
            target = %target.value,
            kind = target.kind.as_str(),
            modules = ?module_names,
            "starting scan"
        );

        let resolved_options = resolve_options(&selected, &config, &request);
        let snapshot = serde_json::to_string(&serde_json::json!({
            "engine": &config,
            "modules": &resolved_options,
        }))?;

        // Relaunching an existing id reuses its record; the event log's
        // dedup keeps the persisted prefix intact.
        match store.get_scan(&scan_id)? {
            Some(_) => store.set_status(&scan_id, ScanStatus::Starting, None)?,
            None => store.create_scan(&ScanRecord {
                id: scan_id.clone(),
                name: request.name.clone(),
                target_kind: target.kind.as_str().to_string(),
                target_value: target.value.clone(),
                created_at: now_ms(),
                ended_at: None,
                status: ScanStatus::Starting,
                config_json: snapshot,
            })?,
        }

        // From here the scan row exists; a launch failure must not strand it
        // in STARTING.
        match Self::launch(registry, &store, &config, &target, selected, resolved_options, &scan_id)
            .await
        {
            Ok(controller) => Ok(controller),
            Err(e) => {
                let _ = store.append_log(
                    &scan_id,
                    "ERROR",
                    "controller",
                    &format!("startup failed: {e}"),
                );
                if let Err(se) = store.set_status(&scan_id, ScanStatus::Errored, Some(now_ms())) {
                    error!(scan = %scan_id, "failed to persist ERRORED status: {se}");
                }
                Err(e)
            }
        }
    }

    async fn launch(
        registry: &ModuleRegistry,
        store: &Arc<dyn ScanStore>,
        config: &EngineConfig,
        target: &Target,
        selected: Vec<ModuleDescriptor>,
        mut resolved_options: HashMap<String, HashMap<String, String>>,
        scan_id: &str,
    ) -> EngineResult<ScanController> {
        let scan_id = scan_id.to_string();
        let store = store.clone();
        let catalog = Arc::new(registry.catalog());
        let factory = EventFactory::new(scan_id.clone(), catalog);
        let scope = Arc::new(Scope::new(target.clone(), scan_id.clone(), store.clone()));

        let mut modules = Vec::with_capacity(selected.len());
        for descriptor in selected {
            modules.push(ActiveModule {
                instance: registry.instantiate(&descriptor.name)?,
                options: resolved_options
                    .remove(&descriptor.name)
                    .unwrap_or_default(),
                descriptor,
            });
        }

        let (signal, _token) = SignalHandle::new();
        let bus = bus::start_bus(
            scan_id.clone(),
            store.clone(),
            factory.clone(),
            scope,
            config,
            &signal,
            modules,
        )
        .await?;

        // Seed: the synthetic root, then the target restated as a typed
        // event so modules subscribe to ordinary types rather than ROOT.
        let root = factory.root(&target.value);
        let seed = factory.make(target.kind.event_type(), &target.value, ROOT_MODULE, &root)?;
        for event in [root, seed] {
            bus.pending.fetch_add(1, Ordering::SeqCst);
            if bus.emit_tx.send(event).await.is_err() {
                bus.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::Cancelled);
            }
        }

        let (status_tx, status_rx) = watch::channel(ScanStatus::Running);
        store.set_status(&scan_id, ScanStatus::Running, None)?;

        let pending = bus.pending.clone();
        let fatal = bus.fatal.clone();
        let supervisor = tokio::spawn(supervise(
            scan_id.clone(),
            store.clone(),
            signal.clone(),
            bus,
            status_tx,
            config.scan_timeout_ms.map(Duration::from_millis),
            Duration::from_millis(config.graceful_timeout_ms),
        ));

        Ok(ScanController {
            scan_id,
            store,
            signal,
            status_rx,
            pending,
            fatal,
            supervisor: Mutex::new(Some(supervisor)),
            started_at: Instant::now(),
        })
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn status(&self) -> ScanStatus {
        *self.status_rx.borrow()
    }

    /// Request cancellation. Handlers get the graceful window to notice the
    /// token; the scan lands on ABORTED.
    pub fn cancel(&self) {
        info!(scan = %self.scan_id, "cancellation requested");
        self.signal.abort();
    }

    /// Await the terminal status.
    pub async fn wait(&self) -> EngineResult<ScanStatus> {
        let mut rx = self.status_rx.clone();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                self.reap().await;
                return Ok(status);
            }
            if rx.changed().await.is_err() {
                // Supervisor is gone; the persisted status is authoritative.
                let record = crate::store::require_scan(self.store.as_ref(), &self.scan_id)?;
                return Ok(record.status);
            }
        }
    }

    /// Current counters; callable while the scan runs.
    pub fn progress(&self) -> EngineResult<ScanProgress> {
        Ok(ScanProgress {
            status: self.status(),
            events_total: self.store.event_count(&self.scan_id)?,
            events_by_type: self.store.counts_by_type(&self.scan_id)?,
            in_flight: self.pending.load(Ordering::SeqCst),
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
        })
    }

    /// The store failure that killed the scan, if it ended ERRORED.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().ok().and_then(|slot| slot.clone())
    }

    async fn reap(&self) {
        let handle = match self.supervisor.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// How often the supervisor re-checks the pending counter even without an
/// idle notification.
const IDLE_POLL: Duration = Duration::from_millis(100);
/// Idle must hold across one confirmation pause before the scan finishes,
/// so a delivery that raced the zero observation is seen.
const IDLE_CONFIRM: Duration = Duration::from_millis(25);

enum Outcome {
    Drained,
    Aborted,
    DeadlineHit,
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    scan_id: String,
    store: Arc<dyn ScanStore>,
    signal: SignalHandle,
    bus: BusHandle,
    status_tx: watch::Sender<ScanStatus>,
    scan_timeout: Option<Duration>,
    graceful: Duration,
) {
    let deadline = scan_timeout.map(|t| Instant::now() + t);
    let mut abort_watch = signal.token();

    let outcome = loop {
        if bus.in_flight() == 0 {
            tokio::time::sleep(IDLE_CONFIRM).await;
            if bus.in_flight() == 0 {
                break Outcome::Drained;
            }
        }
        tokio::select! {
            _ = bus.idle.notified() => {}
            _ = tokio::time::sleep(IDLE_POLL) => {}
            _ = abort_watch.cancelled() => break Outcome::Aborted,
            _ = sleep_until_deadline(deadline) => break Outcome::DeadlineHit,
        }
    };

    let final_status = match outcome {
        Outcome::Drained => {
            set_status(&store, &status_tx, &scan_id, ScanStatus::Finishing, None);
            signal.finish();
            drain_tasks(bus.workers, bus.dispatcher, graceful).await;
            match bus.fatal.lock().ok().and_then(|slot| slot.clone()) {
                Some(reason) => {
                    error!(scan = %scan_id, "scan errored: {reason}");
                    ScanStatus::Errored
                }
                None => ScanStatus::Finished,
            }
        }
        Outcome::Aborted => {
            set_status(&store, &status_tx, &scan_id, ScanStatus::Aborting, None);
            drain_tasks(bus.workers, bus.dispatcher, graceful).await;
            // A dispatcher store failure also surfaces as an abort; the
            // fatal slot disambiguates it from operator cancellation.
            match bus.fatal.lock().ok().and_then(|slot| slot.clone()) {
                Some(reason) => {
                    error!(scan = %scan_id, "scan errored: {reason}");
                    ScanStatus::Errored
                }
                None => ScanStatus::Aborted,
            }
        }
        Outcome::DeadlineHit => {
            warn!(scan = %scan_id, "scan deadline reached");
            set_status(&store, &status_tx, &scan_id, ScanStatus::Aborting, None);
            signal.abort();
            drain_tasks(bus.workers, bus.dispatcher, graceful).await;
            ScanStatus::TimedOut
        }
    };

    set_status(&store, &status_tx, &scan_id, final_status, Some(now_ms()));
    info!(scan = %scan_id, status = %final_status, "scan ended");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Join workers then the dispatcher, hard-aborting whatever outlives the
/// graceful window.
async fn drain_tasks(workers: Vec<JoinHandle<()>>, dispatcher: JoinHandle<()>, graceful: Duration) {
    let deadline = Instant::now() + graceful;
    for handle in workers.into_iter().chain(std::iter::once(dispatcher)) {
        let abort = handle.abort_handle();
        if tokio::time::timeout_at(deadline, handle).await.is_err() {
            debug!("task outlived graceful window; aborting");
            abort.abort();
        }
    }
}

fn set_status(
    store: &Arc<dyn ScanStore>,
    status_tx: &watch::Sender<ScanStatus>,
    scan_id: &str,
    status: ScanStatus,
    ended_at: Option<i64>,
) {
    if let Err(e) = store.set_status(scan_id, status, ended_at) {
        // The in-memory state machine still advances; operators see the
        // authoritative status through the controller.
        error!(scan = %scan_id, "failed to persist status {status}: {e}");
    }
    let _ = status_tx.send(status);
}

/// Option resolution order: descriptor defaults, then engine config
/// overrides, then per-request overrides.
fn resolve_options(
    selected: &[ModuleDescriptor],
    config: &EngineConfig,
    request: &ScanRequest,
) -> HashMap<String, HashMap<String, String>> {
    let mut resolved = HashMap::new();
    for descriptor in selected {
        let mut options: HashMap<String, String> = descriptor
            .options
            .iter()
            .map(|(k, spec)| (k.clone(), spec.default.clone()))
            .collect();
        if let Some(overrides) = config.module_options.get(&descriptor.name) {
            options.extend(overrides.clone());
        }
        if let Some(overrides) = request.module_options.get(&descriptor.name) {
            options.extend(overrides.clone());
        }
        resolved.insert(descriptor.name.clone(), options);
    }
    resolved
}

fn derive_scan_id(name: &str, target: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(target.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(&now_ms().to_le_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_scan_ids_are_short_hex() {
        let id = derive_scan_id("scan", "example.com");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn option_resolution_order() {
        use crate::registry::OptionSpec;
        let descriptor = ModuleDescriptor::new("m", "1.0")
            .consumes(&["DOMAIN_NAME_TARGET"])
            .option("timeout", OptionSpec::new("30", "seconds"))
            .option("verify", OptionSpec::new("true", "check liveness"));
        let mut config = EngineConfig::default();
        config.module_options.insert(
            "m".to_string(),
            HashMap::from([("timeout".to_string(), "60".to_string())]),
        );
        let mut request = ScanRequest::new("t", "example.com");
        request.module_options.insert(
            "m".to_string(),
            HashMap::from([("verify".to_string(), "false".to_string())]),
        );

        let resolved = resolve_options(&[descriptor], &config, &request);
        let m = &resolved["m"];
        assert_eq!(m["timeout"], "60");
        assert_eq!(m["verify"], "false");
    }
}
