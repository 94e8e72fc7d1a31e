/*!
Event bus and scheduler: delivery fan-out, deduplication, backpressure,
depth gating and race-free idle detection
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::event::{Event, EventFactory, VISIBILITY_OUT_OF_SCOPE};
use crate::module::{ModuleContext, ScanModule};
use crate::registry::ModuleDescriptor;
use crate::store::{AppendOutcome, ScanStore};
use crate::target::Scope;

/// Lifecycle signal broadcast to the dispatcher and every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSignal {
    /// Normal operation.
    Run,
    /// Queue has drained; stop after current work and run `on_finish`.
    Finish,
    /// Operator cancellation or deadline; stop as soon as possible.
    Abort,
}

/// Write side of the lifecycle signal, held by the controller.
#[derive(Clone)]
pub struct SignalHandle {
    tx: watch::Sender<ScanSignal>,
}

impl SignalHandle {
    pub fn new() -> (SignalHandle, CancelToken) {
        let (tx, rx) = watch::channel(ScanSignal::Run);
        (SignalHandle { tx }, CancelToken { rx })
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn finish(&self) {
        // Never downgrade an abort.
        self.tx.send_if_modified(|state| {
            if *state == ScanSignal::Run {
                *state = ScanSignal::Finish;
                true
            } else {
                false
            }
        });
    }

    pub fn abort(&self) {
        self.tx.send_if_modified(|state| {
            if *state != ScanSignal::Abort {
                *state = ScanSignal::Abort;
                true
            } else {
                false
            }
        });
    }
}

/// Cooperative cancellation token handed to module contexts and workers.
/// Handlers should poll `is_cancelled` at natural checkpoints.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<ScanSignal>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() == ScanSignal::Abort
    }

    pub fn is_stopping(&self) -> bool {
        *self.rx.borrow() != ScanSignal::Run
    }

    /// Resolves once the scan is aborted. Also resolves if the scan is torn
    /// down entirely.
    pub async fn cancelled(&mut self) {
        while *self.rx.borrow() != ScanSignal::Abort {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the scan leaves the Run state.
    pub async fn stopped(&mut self) {
        while *self.rx.borrow() == ScanSignal::Run {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A module selected for the scan, with its resolved options.
pub struct ActiveModule {
    pub descriptor: ModuleDescriptor,
    pub instance: Box<dyn ScanModule>,
    pub options: HashMap<String, String>,
}

/// Handle to a running bus, owned by the controller.
pub struct BusHandle {
    /// Seed injection point; counts against the same backpressure budget as
    /// module emits.
    pub emit_tx: mpsc::Sender<Event>,
    /// Queued deliveries plus raw events plus running handlers. Zero means
    /// the bus is idle.
    pub pending: Arc<AtomicU64>,
    /// Pinged whenever `pending` drops to zero.
    pub idle: Arc<Notify>,
    /// Set when a store failure forced the bus down; the scan is ERRORED.
    pub fatal: Arc<Mutex<Option<String>>>,
    pub dispatcher: JoinHandle<()>,
    pub workers: Vec<JoinHandle<()>>,
}

impl BusHandle {
    pub fn in_flight(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Build and launch the bus for one scan: one dispatcher task plus one worker
/// task per module, each with its own FIFO mailbox.
///
/// Per-module mailboxes give the two delivery guarantees for free: handlers
/// for one module are serialised in production order, and distinct modules
/// progress in parallel. The bounded central channel is the high-water mark;
/// `emit` suspends while it is full. Mailboxes themselves are unbounded so
/// the dispatcher never blocks on a worker that is itself blocked emitting;
/// total queued work is still limited by the central capacity plus what
/// handlers have already produced.
pub async fn start_bus(
    scan_id: String,
    store: Arc<dyn ScanStore>,
    factory: EventFactory,
    scope: Arc<Scope>,
    config: &EngineConfig,
    signal: &SignalHandle,
    modules: Vec<ActiveModule>,
) -> EngineResult<BusHandle> {
    let (emit_tx, emit_rx) = mpsc::channel::<Event>(config.queue_capacity);
    let pending = Arc::new(AtomicU64::new(0));
    let idle = Arc::new(Notify::new());
    let fatal = Arc::new(Mutex::new(None));

    let mut mailboxes: HashMap<String, mpsc::UnboundedSender<Event>> = HashMap::new();
    let mut subscriptions: HashMap<String, Vec<String>> = HashMap::new();
    let mut wildcard: Vec<String> = Vec::new();
    let mut workers = Vec::new();

    for module in modules {
        let name = module.descriptor.name.clone();
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel::<Event>();

        let ctx = ModuleContext::new(
            name.clone(),
            factory.clone(),
            emit_tx.clone(),
            pending.clone(),
            module.options,
            scope.clone(),
            store.clone(),
            signal.token(),
        );

        if module.descriptor.consumes_wildcard() {
            wildcard.push(name.clone());
        } else {
            for event_type in &module.descriptor.consumes {
                subscriptions
                    .entry(event_type.clone())
                    .or_default()
                    .push(name.clone());
            }
        }

        let mut worker = Worker {
            descriptor: module.descriptor,
            module: module.instance,
            ctx,
            mailbox: mailbox_rx,
            pending: pending.clone(),
            idle: idle.clone(),
            token: signal.token(),
            store: store.clone(),
            scan_id: scan_id.clone(),
            errored: false,
        };
        worker.module.setup(&worker.ctx).await?;

        mailboxes.insert(name, mailbox_tx);
        workers.push(tokio::spawn(async move { worker.run().await }));
    }

    info!(
        scan = %scan_id,
        modules = mailboxes.len(),
        "event bus started"
    );

    let dispatcher = Dispatcher {
        scan_id,
        store,
        emit_rx,
        mailboxes,
        subscriptions,
        wildcard,
        pending: pending.clone(),
        idle: idle.clone(),
        token: signal.token(),
        fatal: fatal.clone(),
        max_depth: config.max_depth,
        dispatch_out_of_scope: config.dispatch_out_of_scope,
        retry_limit: config.store_retry_limit,
        retry_base: Duration::from_millis(config.store_retry_base_ms),
        aliases: HashMap::new(),
    };
    let abort_on_fatal = signal.tx.clone();
    let dispatcher = tokio::spawn(async move {
        let mut dispatcher = dispatcher;
        if let Err(e) = dispatcher.run().await {
            error!("dispatcher stopped on fatal store failure: {e}");
            if let Ok(mut slot) = dispatcher.fatal.lock() {
                *slot = Some(e.to_string());
            }
            // Tear the scan down; the controller reports ERRORED.
            let _ = abort_on_fatal.send(ScanSignal::Abort);
        }
    });

    Ok(BusHandle {
        emit_tx,
        pending,
        idle,
        fatal,
        dispatcher,
        workers,
    })
}

struct Dispatcher {
    scan_id: String,
    store: Arc<dyn ScanStore>,
    emit_rx: mpsc::Receiver<Event>,
    mailboxes: HashMap<String, mpsc::UnboundedSender<Event>>,
    subscriptions: HashMap<String, Vec<String>>,
    wildcard: Vec<String>,
    pending: Arc<AtomicU64>,
    idle: Arc<Notify>,
    token: CancelToken,
    fatal: Arc<Mutex<Option<String>>>,
    max_depth: u32,
    dispatch_out_of_scope: bool,
    retry_limit: u32,
    retry_base: Duration,
    /// Suppressed event id -> surviving event id. A module that chains off a
    /// duplicate holds an id that was never persisted; children arriving with
    /// such a parent are re-hung on the survivor here.
    aliases: HashMap<String, String>,
}

impl Dispatcher {
    async fn run(&mut self) -> EngineResult<()> {
        let mut stop = self.token.clone();
        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                received = self.emit_rx.recv() => match received {
                    None => break,
                    Some(event) => {
                        let result = self.process(event).await;
                        self.settle_one();
                        result?;
                    }
                }
            }
        }
        // Discard whatever is still queued so the pending count settles.
        while let Ok(_event) = self.emit_rx.try_recv() {
            self.settle_one();
        }
        Ok(())
    }

    /// Persist one raw event and fan out deliveries. The caller's pending
    /// slot is released only after every delivery has been counted, so the
    /// idle check can never observe a half-dispatched event.
    async fn process(&mut self, mut event: Event) -> EngineResult<()> {
        // The parent may be an id whose append was suppressed as a duplicate;
        // re-hang the child on the survivor so every persisted parent_id
        // references a persisted row. Per-module FIFO guarantees the
        // duplicate was processed (and recorded in `aliases`) first.
        if let Some(parent_id) = &event.parent_id {
            if let Some(survivor) = self.resolve_survivor(parent_id) {
                let emitted_id = std::mem::replace(
                    &mut event.id,
                    Event::compute_id(
                        &event.scan_id,
                        &event.event_type,
                        &event.data,
                        Some(&survivor),
                    ),
                );
                event.parent_id = Some(survivor);
                // Grandchildren will still reference the id the module saw.
                self.aliases.insert(emitted_id, event.id.clone());
            }
        }

        let outcome = self.append_with_retry(&event).await?;

        match outcome {
            AppendOutcome::Inserted => {
                if let Some(parent_id) = &event.parent_id {
                    self.store.record_edge(&self.scan_id, &event.id, parent_id)?;
                }
                if event.depth > self.max_depth {
                    debug!(
                        event_type = %event.event_type,
                        depth = event.depth,
                        "event beyond max depth; persisted without dispatch"
                    );
                    return Ok(());
                }
                if event.visibility == VISIBILITY_OUT_OF_SCOPE && !self.dispatch_out_of_scope {
                    debug!(
                        event_type = %event.event_type,
                        "out-of-scope event persisted without dispatch"
                    );
                    return Ok(());
                }
                self.fan_out(event);
            }
            AppendOutcome::Duplicate { existing_id } => {
                // The duplicate is dropped but its causal edge survives.
                if let Some(parent_id) = &event.parent_id {
                    self.store
                        .record_edge(&self.scan_id, &existing_id, parent_id)?;
                }
                if existing_id != event.id {
                    self.aliases.insert(event.id.clone(), existing_id);
                }
                debug!(event_type = %event.event_type, "duplicate event suppressed");
            }
        }
        Ok(())
    }

    /// Follow the alias chain to the persisted event standing in for `id`,
    /// if `id` itself was never persisted.
    fn resolve_survivor(&self, id: &str) -> Option<String> {
        let mut current = self.aliases.get(id)?;
        while let Some(next) = self.aliases.get(current) {
            current = next;
        }
        Some(current.clone())
    }

    fn fan_out(&mut self, event: Event) {
        let mut recipients: Vec<String> = self
            .subscriptions
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        recipients.extend(self.wildcard.iter().cloned());

        let mut closed = Vec::new();
        for name in recipients {
            // No self-delivery.
            if name == event.module {
                continue;
            }
            let Some(mailbox) = self.mailboxes.get(&name) else {
                continue;
            };
            self.pending.fetch_add(1, Ordering::SeqCst);
            if mailbox.send(event.clone()).is_err() {
                // Worker unsubscribed itself (fatal_on_error) or is gone.
                self.settle_one();
                closed.push(name);
            }
        }
        for name in closed {
            self.mailboxes.remove(&name);
            warn!(module = %name, "module unsubscribed; dropping its deliveries");
        }
    }

    async fn append_with_retry(&self, event: &Event) -> EngineResult<AppendOutcome> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.append_event(event) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < self.retry_limit => {
                    let delay = self.retry_base * 2u32.saturating_pow(attempt);
                    warn!(
                        attempt,
                        "transient store failure on append, retrying in {delay:?}: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(match e {
                        EngineError::StoreTransient(msg) => EngineError::StoreFatal(msg),
                        other => other,
                    });
                }
            }
        }
    }

    fn settle_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct Worker {
    descriptor: ModuleDescriptor,
    module: Box<dyn ScanModule>,
    ctx: ModuleContext,
    mailbox: mpsc::UnboundedReceiver<Event>,
    pending: Arc<AtomicU64>,
    idle: Arc<Notify>,
    token: CancelToken,
    store: Arc<dyn ScanStore>,
    scan_id: String,
    errored: bool,
}

impl Worker {
    async fn run(&mut self) {
        let intervals: HashMap<String, Duration> = self
            .descriptor
            .rate_limits
            .iter()
            .filter(|(_, rate)| **rate > 0)
            .map(|(t, rate)| (t.clone(), Duration::from_secs_f64(1.0 / f64::from(*rate))))
            .collect();
        let mut next_allowed: HashMap<String, Instant> = HashMap::new();
        let mut stop = self.token.clone();

        loop {
            let event = tokio::select! {
                biased;
                _ = stop.stopped() => break,
                received = self.mailbox.recv() => match received {
                    None => break,
                    Some(event) => event,
                },
            };

            // Smooth dispatch per (module, event type) pair; other types
            // flow through unthrottled.
            if let Some(interval) = intervals.get(&event.event_type) {
                let gate = next_allowed
                    .entry(event.event_type.clone())
                    .or_insert_with(Instant::now);
                tokio::time::sleep_until(*gate).await;
                *gate = Instant::now() + *interval;
            }

            if let Err(e) = self.module.handle(&event, &self.ctx).await {
                self.record_failure(&event, &e);
                if self.descriptor.fatal_on_error && !self.token.is_stopping() {
                    self.settle_one();
                    warn!(
                        module = %self.descriptor.name,
                        "module is fatal_on_error; unsubscribing for remainder of scan"
                    );
                    break;
                }
            }
            self.settle_one();
        }

        // Pending deliveries for a stopped worker are discarded by contract.
        self.mailbox.close();
        while self.mailbox.try_recv().is_ok() {
            self.settle_one();
        }

        if !self.token.is_cancelled() {
            if let Err(e) = self.module.on_finish(&self.ctx).await {
                warn!(module = %self.descriptor.name, "on_finish failed: {e}");
            }
        }
        debug!(module = %self.descriptor.name, "worker stopped");
    }

    fn record_failure(&mut self, event: &Event, e: &EngineError) {
        // Cancellation surfacing through emit is teardown, not a module bug.
        if matches!(e, EngineError::Cancelled) && self.token.is_stopping() {
            return;
        }
        error!(
            module = %self.descriptor.name,
            event_type = %event.event_type,
            event_id = %event.id,
            "module handler failed: {e}"
        );
        if !self.errored {
            self.errored = true;
            let _ = self.store.append_log(
                &self.scan_id,
                "ERROR",
                &self.descriptor.name,
                &format!("handler failed on {}: {e}", event.event_type),
            );
        }
    }

    fn settle_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}
