/*!
End-to-end scan behaviour over real bus, controller and store wiring
*/

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use recon_engine::store::{AppendOutcome, EventFilter, ScanRecord};
use recon_engine::{
    EngineConfig, EngineError, EngineResult, Event, MemoryStore, ModuleContext, ModuleDescriptor,
    ModuleRegistry, ScanController, ScanModule, ScanRequest, ScanStatus, ScanStore, SqliteStore,
};

/// Emits a fixed set of events for every delivery.
struct Emitter {
    descriptor: ModuleDescriptor,
    emissions: Vec<(&'static str, String)>,
}

#[async_trait]
impl ScanModule for Emitter {
    fn descriptor(&self) -> ModuleDescriptor {
        self.descriptor.clone()
    }

    async fn handle(&mut self, event: &Event, ctx: &ModuleContext) -> EngineResult<()> {
        for (event_type, data) in &self.emissions {
            ctx.emit(event_type, data, event).await?;
        }
        Ok(())
    }
}

fn emitter(
    descriptor: ModuleDescriptor,
    emissions: Vec<(&'static str, String)>,
) -> impl Fn() -> Box<dyn ScanModule> + Send + Sync + 'static {
    move || {
        Box::new(Emitter {
            descriptor: descriptor.clone(),
            emissions: emissions.clone(),
        })
    }
}

/// Records every delivered event into a shared vector.
struct Collector {
    descriptor: ModuleDescriptor,
    seen: Arc<Mutex<Vec<Event>>>,
}

#[async_trait]
impl ScanModule for Collector {
    fn descriptor(&self) -> ModuleDescriptor {
        self.descriptor.clone()
    }

    async fn handle(&mut self, event: &Event, _ctx: &ModuleContext) -> EngineResult<()> {
        self.seen.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn collector(
    descriptor: ModuleDescriptor,
    seen: Arc<Mutex<Vec<Event>>>,
) -> impl Fn() -> Box<dyn ScanModule> + Send + Sync + 'static {
    move || {
        Box::new(Collector {
            descriptor: descriptor.clone(),
            seen: seen.clone(),
        })
    }
}

/// Emits one event whose data encodes the next hop depth, driving a chain
/// between two such modules.
struct Chainer {
    descriptor: ModuleDescriptor,
    produce_type: &'static str,
}

#[async_trait]
impl ScanModule for Chainer {
    fn descriptor(&self) -> ModuleDescriptor {
        self.descriptor.clone()
    }

    async fn handle(&mut self, event: &Event, ctx: &ModuleContext) -> EngineResult<()> {
        let data = format!("hop{}.example.com", event.depth + 1);
        ctx.emit(self.produce_type, &data, event).await?;
        Ok(())
    }
}

/// Blocks inside the handler without watching the cancellation token.
struct Staller {
    descriptor: ModuleDescriptor,
}

#[async_trait]
impl ScanModule for Staller {
    fn descriptor(&self) -> ModuleDescriptor {
        self.descriptor.clone()
    }

    async fn handle(&mut self, _event: &Event, _ctx: &ModuleContext) -> EngineResult<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// Re-emits the name it was handed and hangs a mail host off that emission,
/// so the follow-up's parent is an event the store suppressed as a duplicate.
struct Rechainer {
    descriptor: ModuleDescriptor,
}

#[async_trait]
impl ScanModule for Rechainer {
    fn descriptor(&self) -> ModuleDescriptor {
        self.descriptor.clone()
    }

    async fn handle(&mut self, event: &Event, ctx: &ModuleContext) -> EngineResult<()> {
        let copy = ctx.emit("INTERNET_NAME", &event.data, event).await?;
        let mail = format!("mail.{}", event.data.trim_start_matches("www."));
        ctx.emit("INTERNET_NAME", &mail, &copy).await?;
        Ok(())
    }
}

/// Fails setup, as a module missing mandatory configuration would.
struct SetupFailer {
    descriptor: ModuleDescriptor,
}

#[async_trait]
impl ScanModule for SetupFailer {
    fn descriptor(&self) -> ModuleDescriptor {
        self.descriptor.clone()
    }

    async fn setup(&mut self, _ctx: &ModuleContext) -> EngineResult<()> {
        Err(EngineError::Config("credentials missing".to_string()))
    }

    async fn handle(&mut self, _event: &Event, _ctx: &ModuleContext) -> EngineResult<()> {
        Ok(())
    }
}

/// Emits a run of hostnames with a pause between each, leaving a partial log
/// behind when the scan is cancelled mid-run.
struct Trickler {
    descriptor: ModuleDescriptor,
    hosts: u32,
    pause: Duration,
}

#[async_trait]
impl ScanModule for Trickler {
    fn descriptor(&self) -> ModuleDescriptor {
        self.descriptor.clone()
    }

    async fn handle(&mut self, event: &Event, ctx: &ModuleContext) -> EngineResult<()> {
        for i in 0..self.hosts {
            if ctx.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(self.pause).await;
            ctx.emit("INTERNET_NAME", &format!("host{i}.example.com"), event)
                .await?;
        }
        Ok(())
    }
}

fn trickler_registry(hosts: u32, pause: Duration) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register(move || {
            Box::new(Trickler {
                descriptor: ModuleDescriptor::new("trickler", "1.0")
                    .consumes(&["DOMAIN_NAME_TARGET"])
                    .produces(&["INTERNET_NAME"]),
                hosts,
                pause,
            }) as Box<dyn ScanModule>
        })
        .unwrap();
    registry
}

/// Wraps a `MemoryStore` and fails the first `failures` appends with a
/// transient error, counting every attempt.
struct FlakyStore {
    inner: MemoryStore,
    remaining: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyStore {
    fn failing(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            remaining: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }
}

impl ScanStore for FlakyStore {
    fn create_scan(&self, scan: &ScanRecord) -> EngineResult<()> {
        self.inner.create_scan(scan)
    }

    fn get_scan(&self, scan_id: &str) -> EngineResult<Option<ScanRecord>> {
        self.inner.get_scan(scan_id)
    }

    fn list_scans(&self) -> EngineResult<Vec<ScanRecord>> {
        self.inner.list_scans()
    }

    fn append_event(&self, event: &Event) -> EngineResult<AppendOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::StoreTransient("synthetic busy".to_string()));
        }
        self.inner.append_event(event)
    }

    fn record_edge(&self, scan_id: &str, child_id: &str, parent_id: &str) -> EngineResult<()> {
        self.inner.record_edge(scan_id, child_id, parent_id)
    }

    fn edges(&self, scan_id: &str) -> EngineResult<Vec<(String, String)>> {
        self.inner.edges(scan_id)
    }

    fn set_status(
        &self,
        scan_id: &str,
        status: ScanStatus,
        ended_at: Option<i64>,
    ) -> EngineResult<()> {
        self.inner.set_status(scan_id, status, ended_at)
    }

    fn events(&self, scan_id: &str, filter: &EventFilter) -> EngineResult<Vec<Event>> {
        self.inner.events(scan_id, filter)
    }

    fn event_count(&self, scan_id: &str) -> EngineResult<u64> {
        self.inner.event_count(scan_id)
    }

    fn counts_by_type(&self, scan_id: &str) -> EngineResult<BTreeMap<String, u64>> {
        self.inner.counts_by_type(scan_id)
    }

    fn get_resolution(&self, scan_id: &str, name: &str) -> EngineResult<Option<Vec<String>>> {
        self.inner.get_resolution(scan_id, name)
    }

    fn put_resolution(&self, scan_id: &str, name: &str, addresses: &[String]) -> EngineResult<()> {
        self.inner.put_resolution(scan_id, name, addresses)
    }

    fn append_log(
        &self,
        scan_id: &str,
        level: &str,
        component: &str,
        message: &str,
    ) -> EngineResult<()> {
        self.inner.append_log(scan_id, level, component, message)
    }
}

async fn run_scan(
    registry: &ModuleRegistry,
    store: Arc<dyn ScanStore>,
    config: EngineConfig,
    request: ScanRequest,
) -> (ScanController, ScanStatus) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let controller = ScanController::start(registry, store, config, request)
        .await
        .unwrap();
    let status = controller.wait().await.unwrap();
    (controller, status)
}

#[tokio::test]
async fn fan_out_reaches_subscribers_and_records_ancestry() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(emitter(
            ModuleDescriptor::new("subfinder", "1.0")
                .consumes(&["DOMAIN_NAME_TARGET"])
                .produces(&["INTERNET_NAME"]),
            vec![
                ("INTERNET_NAME", "www.example.com".to_string()),
                ("INTERNET_NAME", "mail.example.com".to_string()),
            ],
        ))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    registry
        .register(collector(
            ModuleDescriptor::new("watcher", "1.0").consumes(&["INTERNET_NAME"]),
            seen.clone(),
        ))
        .unwrap();

    let store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let (controller, status) = run_scan(
        &registry,
        store.clone(),
        EngineConfig::default(),
        ScanRequest::new("fanout", "example.com"),
    )
    .await;

    assert_eq!(status, ScanStatus::Finished);
    // Root, typed seed, two discovered names.
    assert_eq!(store.event_count(controller.scan_id()).unwrap(), 4);

    let delivered = seen.lock().unwrap();
    let mut names: Vec<&str> = delivered.iter().map(|e| e.data.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["mail.example.com", "www.example.com"]);

    // Every discovered name points back at the typed seed event.
    let seed = store
        .events(controller.scan_id(), &EventFilter::by_type("DOMAIN_NAME_TARGET"))
        .unwrap()
        .remove(0);
    for event in delivered.iter() {
        assert_eq!(event.parent_id.as_deref(), Some(seed.id.as_str()));
        assert_eq!(event.depth, seed.depth + 1);
    }
}

#[tokio::test]
async fn duplicate_data_keeps_one_event_but_both_edges() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(emitter(
            ModuleDescriptor::new("subfinder", "1.0")
                .consumes(&["DOMAIN_NAME_TARGET"])
                .produces(&["INTERNET_NAME"]),
            vec![
                ("INTERNET_NAME", "a.example.com".to_string()),
                ("INTERNET_NAME", "b.example.com".to_string()),
            ],
        ))
        .unwrap();
    // Emits the same analytics id for every name it sees; the second
    // emission collides by hash.
    registry
        .register(emitter(
            ModuleDescriptor::new("tagger", "1.0")
                .consumes(&["INTERNET_NAME"])
                .produces(&["WEB_ANALYTICS_ID"]),
            vec![("WEB_ANALYTICS_ID", "ua-100".to_string())],
        ))
        .unwrap();

    let store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let (controller, status) = run_scan(
        &registry,
        store.clone(),
        EngineConfig::default(),
        ScanRequest::new("dedup", "example.com"),
    )
    .await;
    assert_eq!(status, ScanStatus::Finished);

    let scan_id = controller.scan_id();
    let counts = store.counts_by_type(scan_id).unwrap();
    assert_eq!(counts["INTERNET_NAME"], 2);
    assert_eq!(counts["WEB_ANALYTICS_ID"], 1);

    let analytics = store
        .events(scan_id, &EventFilter::by_type("WEB_ANALYTICS_ID"))
        .unwrap()
        .remove(0);
    let names = store
        .events(scan_id, &EventFilter::by_type("INTERNET_NAME"))
        .unwrap();

    // The surviving event carries a causal edge to each discovery path.
    let mut parents: Vec<String> = store
        .edges(scan_id)
        .unwrap()
        .into_iter()
        .filter(|(child, _)| child == &analytics.id)
        .map(|(_, parent)| parent)
        .collect();
    parents.sort();
    let mut expected: Vec<String> = names.iter().map(|e| e.id.clone()).collect();
    expected.sort();
    assert_eq!(parents, expected);
}

#[tokio::test]
async fn deep_events_persist_without_dispatch() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(|| {
            Box::new(Chainer {
                descriptor: ModuleDescriptor::new("alpha", "1.0")
                    .consumes(&["DOMAIN_NAME_TARGET", "INTERNET_NAME"])
                    .produces(&["AFFILIATE_INTERNET_NAME"]),
                produce_type: "AFFILIATE_INTERNET_NAME",
            }) as Box<dyn ScanModule>
        })
        .unwrap();
    registry
        .register(|| {
            Box::new(Chainer {
                descriptor: ModuleDescriptor::new("beta", "1.0")
                    .consumes(&["AFFILIATE_INTERNET_NAME"])
                    .produces(&["INTERNET_NAME"]),
                produce_type: "INTERNET_NAME",
            }) as Box<dyn ScanModule>
        })
        .unwrap();

    let config = EngineConfig {
        max_depth: 3,
        ..EngineConfig::default()
    };
    let store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let (controller, status) = run_scan(
        &registry,
        store.clone(),
        config,
        ScanRequest::new("depth", "example.com"),
    )
    .await;
    assert_eq!(status, ScanStatus::Finished);

    let events = store
        .events(controller.scan_id(), &EventFilter::default())
        .unwrap();
    let max_depth = events.iter().map(|e| e.depth).max().unwrap();
    // The first event past the limit is recorded but produces no children.
    assert_eq!(max_depth, 4);
    assert_eq!(events.len(), 5);
}

#[tokio::test]
async fn cancellation_lands_on_aborted_within_grace() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(|| {
            Box::new(Staller {
                descriptor: ModuleDescriptor::new("staller", "1.0")
                    .consumes(&["DOMAIN_NAME_TARGET"]),
            }) as Box<dyn ScanModule>
        })
        .unwrap();

    let config = EngineConfig {
        graceful_timeout_ms: 200,
        ..EngineConfig::default()
    };
    let store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let controller = ScanController::start(
        &registry,
        store.clone(),
        config,
        ScanRequest::new("cancel", "example.com"),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.cancel();
    let status = controller.wait().await.unwrap();
    assert_eq!(status, ScanStatus::Aborted);

    let record = store.get_scan(controller.scan_id()).unwrap().unwrap();
    assert_eq!(record.status, ScanStatus::Aborted);
    assert!(record.ended_at.is_some());
    // Only the seeds made it in; the stalled handler produced nothing.
    assert_eq!(store.event_count(controller.scan_id()).unwrap(), 2);
}

#[tokio::test]
async fn deadline_lands_on_timed_out() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(|| {
            Box::new(Staller {
                descriptor: ModuleDescriptor::new("staller", "1.0")
                    .consumes(&["DOMAIN_NAME_TARGET"]),
            }) as Box<dyn ScanModule>
        })
        .unwrap();

    let config = EngineConfig {
        scan_timeout_ms: Some(150),
        graceful_timeout_ms: 100,
        ..EngineConfig::default()
    };
    let store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let (controller, status) = run_scan(
        &registry,
        store.clone(),
        config,
        ScanRequest::new("deadline", "example.com"),
    )
    .await;
    assert_eq!(status, ScanStatus::TimedOut);
    let record = store.get_scan(controller.scan_id()).unwrap().unwrap();
    assert_eq!(record.status, ScanStatus::TimedOut);
}

#[tokio::test]
async fn out_of_scope_results_recorded_but_not_dispatched() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(emitter(
            ModuleDescriptor::new("leaky", "1.0")
                .consumes(&["DOMAIN_NAME_TARGET"])
                .produces(&["INTERNET_NAME"]),
            vec![("INTERNET_NAME", "cdn.unrelated.org".to_string())],
        ))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    registry
        .register(collector(
            ModuleDescriptor::new("watcher", "1.0").consumes(&["INTERNET_NAME"]),
            seen.clone(),
        ))
        .unwrap();

    let store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let (controller, status) = run_scan(
        &registry,
        store.clone(),
        EngineConfig::default(),
        ScanRequest::new("scope", "example.com"),
    )
    .await;
    assert_eq!(status, ScanStatus::Finished);

    // Persisted with zeroed visibility, never delivered.
    let stray = store
        .events(controller.scan_id(), &EventFilter::by_type("INTERNET_NAME"))
        .unwrap()
        .remove(0);
    assert_eq!(stray.visibility, 0);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn relaunch_with_same_id_changes_nothing() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(emitter(
            ModuleDescriptor::new("subfinder", "1.0")
                .consumes(&["DOMAIN_NAME_TARGET"])
                .produces(&["INTERNET_NAME"]),
            vec![
                ("INTERNET_NAME", "www.example.com".to_string()),
                ("INTERNET_NAME", "mail.example.com".to_string()),
            ],
        ))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ScanStore> =
        Arc::new(SqliteStore::open(dir.path().join("scans.db")).unwrap());

    let (first, status) = run_scan(
        &registry,
        store.clone(),
        EngineConfig::default(),
        ScanRequest::new("replay", "example.com"),
    )
    .await;
    assert_eq!(status, ScanStatus::Finished);
    let scan_id = first.scan_id().to_string();
    let mut before: Vec<String> = store
        .events(&scan_id, &EventFilter::default())
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    before.sort();

    // Relaunch under the same id: every seed and emission collides with
    // the persisted log, so the event set is byte-for-byte stable.
    let mut request = ScanRequest::new("replay", "example.com");
    request.scan_id = Some(scan_id.clone());
    let (_, status) = run_scan(&registry, store.clone(), EngineConfig::default(), request).await;
    assert_eq!(status, ScanStatus::Finished);

    let mut after: Vec<String> = store
        .events(&scan_id, &EventFilter::default())
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    after.sort();
    assert_eq!(before, after);
}

#[tokio::test]
async fn tiny_queue_capacity_does_not_deadlock() {
    let emissions: Vec<(&'static str, String)> = (0..50)
        .map(|i| ("INTERNET_NAME", format!("host{i}.example.com")))
        .collect();
    let mut registry = ModuleRegistry::new();
    registry
        .register(emitter(
            ModuleDescriptor::new("flood", "1.0")
                .consumes(&["DOMAIN_NAME_TARGET"])
                .produces(&["INTERNET_NAME"]),
            emissions,
        ))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    registry
        .register(collector(
            ModuleDescriptor::new("watcher", "1.0").consumes(&["INTERNET_NAME"]),
            seen.clone(),
        ))
        .unwrap();

    let config = EngineConfig {
        queue_capacity: 2,
        ..EngineConfig::default()
    };
    let store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let (controller, status) = tokio::time::timeout(
        Duration::from_secs(10),
        run_scan(
            &registry,
            store.clone(),
            config,
            ScanRequest::new("flood", "example.com"),
        ),
    )
    .await
    .unwrap();

    assert_eq!(status, ScanStatus::Finished);
    assert_eq!(store.event_count(controller.scan_id()).unwrap(), 52);
    assert_eq!(seen.lock().unwrap().len(), 50);
}

#[tokio::test]
async fn children_of_suppressed_duplicates_reference_the_survivor() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(emitter(
            ModuleDescriptor::new("subfinder", "1.0")
                .consumes(&["DOMAIN_NAME_TARGET"])
                .produces(&["INTERNET_NAME"]),
            vec![("INTERNET_NAME", "www.example.com".to_string())],
        ))
        .unwrap();
    registry
        .register(|| {
            Box::new(Rechainer {
                descriptor: ModuleDescriptor::new("rechainer", "1.0")
                    .consumes(&["INTERNET_NAME"])
                    .produces(&["INTERNET_NAME"]),
            }) as Box<dyn ScanModule>
        })
        .unwrap();

    let store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let (controller, status) = run_scan(
        &registry,
        store.clone(),
        EngineConfig::default(),
        ScanRequest::new("rehang", "example.com"),
    )
    .await;
    assert_eq!(status, ScanStatus::Finished);

    // Root, typed seed, www, mail; the re-emitted www was suppressed.
    let events = store
        .events(controller.scan_id(), &EventFilter::default())
        .unwrap();
    assert_eq!(events.len(), 4);

    // Every recorded parent is itself a persisted event.
    let ids: HashSet<&str> = events.iter().map(|e| e.id.as_str()).collect();
    for event in &events {
        if let Some(parent_id) = &event.parent_id {
            assert!(
                ids.contains(parent_id.as_str()),
                "event {} references unpersisted parent {parent_id}",
                event.id
            );
        }
    }

    // The mail host chained off the duplicate hangs on the surviving www.
    let www = events.iter().find(|e| e.data == "www.example.com").unwrap();
    let mail = events.iter().find(|e| e.data == "mail.example.com").unwrap();
    assert_eq!(mail.parent_id.as_deref(), Some(www.id.as_str()));
}

#[tokio::test]
async fn startup_failure_lands_on_errored() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(|| {
            Box::new(SetupFailer {
                descriptor: ModuleDescriptor::new("needs_key", "1.0")
                    .consumes(&["DOMAIN_NAME_TARGET"]),
            }) as Box<dyn ScanModule>
        })
        .unwrap();

    let store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let result = ScanController::start(
        &registry,
        store.clone(),
        EngineConfig::default(),
        ScanRequest::new("boot", "example.com"),
    )
    .await;
    assert!(result.is_err());

    // The persisted scan row reflects the failure rather than a stuck
    // STARTING state.
    let scans = store.list_scans().unwrap();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].status, ScanStatus::Errored);
    assert!(scans[0].ended_at.is_some());
}

#[tokio::test]
async fn interrupted_scan_reopens_as_a_prefix_of_the_baseline() {
    // Baseline: the same module set run to completion under the same scan id,
    // so content-addressed ids line up across stores.
    let baseline_store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let mut request = ScanRequest::new("prefix", "example.com");
    request.scan_id = Some("prefix-check".to_string());
    let (_, status) = run_scan(
        &trickler_registry(40, Duration::ZERO),
        baseline_store.clone(),
        EngineConfig::default(),
        request.clone(),
    )
    .await;
    assert_eq!(status, ScanStatus::Finished);
    let baseline: std::collections::HashMap<String, Event> = baseline_store
        .events("prefix-check", &EventFilter::default())
        .unwrap()
        .into_iter()
        .map(|e| (e.id.clone(), e))
        .collect();
    assert_eq!(baseline.len(), 42);

    // Interrupted run against disk, cancelled long before the module is done.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scans.db");
    {
        let store: Arc<dyn ScanStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let controller = ScanController::start(
            &trickler_registry(40, Duration::from_millis(25)),
            store,
            EngineConfig::default(),
            request,
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        controller.cancel();
        assert_eq!(controller.wait().await.unwrap(), ScanStatus::Aborted);
    }

    // What survived on disk is a prefix of the baseline DAG: same ids, same
    // parents, same payloads.
    let reopened = SqliteStore::open_existing(&path).unwrap();
    let recovered = reopened
        .events("prefix-check", &EventFilter::default())
        .unwrap();
    assert!(recovered.len() >= 2, "seeds should have been persisted");
    assert!(recovered.len() < 42, "cancellation should have cut the run short");
    for event in &recovered {
        let counterpart = baseline
            .get(&event.id)
            .unwrap_or_else(|| panic!("event {} not in the baseline run", event.id));
        assert_eq!(event.parent_id, counterpart.parent_id);
        assert_eq!(event.event_type, counterpart.event_type);
        assert_eq!(event.data, counterpart.data);
    }
}

#[tokio::test]
async fn transient_append_failures_are_retried() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(emitter(
            ModuleDescriptor::new("subfinder", "1.0")
                .consumes(&["DOMAIN_NAME_TARGET"])
                .produces(&["INTERNET_NAME"]),
            vec![
                ("INTERNET_NAME", "www.example.com".to_string()),
                ("INTERNET_NAME", "mail.example.com".to_string()),
            ],
        ))
        .unwrap();

    let store = Arc::new(FlakyStore::failing(2));
    let config = EngineConfig {
        store_retry_limit: 4,
        store_retry_base_ms: 5,
        ..EngineConfig::default()
    };
    let (controller, status) = run_scan(
        &registry,
        store.clone() as Arc<dyn ScanStore>,
        config,
        ScanRequest::new("flaky", "example.com"),
    )
    .await;

    assert_eq!(status, ScanStatus::Finished);
    assert_eq!(store.event_count(controller.scan_id()).unwrap(), 4);
    // Four successful appends plus the two rejected attempts.
    assert!(store.attempts.load(Ordering::SeqCst) >= 6);
}

#[tokio::test]
async fn persistent_store_failure_lands_on_errored() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(emitter(
            ModuleDescriptor::new("subfinder", "1.0")
                .consumes(&["DOMAIN_NAME_TARGET"])
                .produces(&["INTERNET_NAME"]),
            vec![("INTERNET_NAME", "www.example.com".to_string())],
        ))
        .unwrap();

    let store = Arc::new(FlakyStore::failing(u32::MAX));
    let config = EngineConfig {
        store_retry_limit: 2,
        store_retry_base_ms: 1,
        ..EngineConfig::default()
    };
    let controller = ScanController::start(
        &registry,
        store.clone() as Arc<dyn ScanStore>,
        config,
        ScanRequest::new("broken", "example.com"),
    )
    .await
    .unwrap();

    let status = controller.wait().await.unwrap();
    assert_eq!(status, ScanStatus::Errored);
    assert!(controller.fatal_error().unwrap().contains("synthetic busy"));
    let record = store.get_scan(controller.scan_id()).unwrap().unwrap();
    assert_eq!(record.status, ScanStatus::Errored);
}

#[tokio::test]
async fn rate_limited_types_are_smoothed() {
    let mut registry = ModuleRegistry::new();
    registry
        .register(emitter(
            ModuleDescriptor::new("subfinder", "1.0")
                .consumes(&["DOMAIN_NAME_TARGET"])
                .produces(&["INTERNET_NAME"]),
            (0..3)
                .map(|i| ("INTERNET_NAME", format!("host{i}.example.com")))
                .collect(),
        ))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    registry
        .register(collector(
            ModuleDescriptor::new("watcher", "1.0")
                .consumes(&["INTERNET_NAME"])
                .rate_limit("INTERNET_NAME", 20),
            seen.clone(),
        ))
        .unwrap();

    let store: Arc<dyn ScanStore> = Arc::new(MemoryStore::new());
    let started = std::time::Instant::now();
    let (_, status) = run_scan(
        &registry,
        store,
        EngineConfig::default(),
        ScanRequest::new("throttle", "example.com"),
    )
    .await;

    assert_eq!(status, ScanStatus::Finished);
    assert_eq!(seen.lock().unwrap().len(), 3);
    // 20 events/second means at least 50ms between the second and third
    // deliveries, so three deliveries span 100ms or more.
    assert!(started.elapsed() >= Duration::from_millis(100));
}
