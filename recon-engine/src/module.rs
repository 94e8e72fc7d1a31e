/*!
Module plug-in contract and the per-module scan context
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::event::{ERROR_MESSAGE_TYPE, Event, EventFactory, ROOT_TYPE, VISIBILITY_OUT_OF_SCOPE};
use crate::registry::ModuleDescriptor;
use crate::store::ScanStore;
use crate::target::Scope;

/// A pluggable unit of reconnaissance logic.
///
/// `handle` is never invoked concurrently for the same module instance;
/// distinct modules progress in parallel. Blocking on external I/O inside
/// `handle` is fine, but long handlers should poll the context's cancellation
/// token at natural checkpoints. Modules must be idempotent on duplicate
/// input: the bus may re-deliver logically identical events that differ only
/// in ancestry.
#[async_trait]
pub trait ScanModule: Send {
    /// Static description: name, consumed/produced types, options, tags.
    fn descriptor(&self) -> ModuleDescriptor;

    /// Called once before the scan starts dispatching.
    async fn setup(&mut self, _ctx: &ModuleContext) -> EngineResult<()> {
        Ok(())
    }

    /// Process one delivered event, emitting follow-ups via the context.
    async fn handle(&mut self, event: &Event, ctx: &ModuleContext) -> EngineResult<()>;

    /// Called during scan FINISHING, after the last delivery.
    async fn on_finish(&mut self, _ctx: &ModuleContext) -> EngineResult<()> {
        Ok(())
    }
}

/// The only sanctioned way for a module to observe and mutate scan state.
#[derive(Clone)]
pub struct ModuleContext {
    module_name: String,
    factory: EventFactory,
    emit_tx: mpsc::Sender<Event>,
    pending: Arc<AtomicU64>,
    options: HashMap<String, String>,
    scope: Arc<Scope>,
    store: Arc<dyn ScanStore>,
    cancel: CancelToken,
}

impl ModuleContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        module_name: String,
        factory: EventFactory,
        emit_tx: mpsc::Sender<Event>,
        pending: Arc<AtomicU64>,
        options: HashMap<String, String>,
        scope: Arc<Scope>,
        store: Arc<dyn ScanStore>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            module_name,
            factory,
            emit_tx,
            pending,
            options,
            scope,
            store,
            cancel,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn scan_id(&self) -> &str {
        self.factory.scan_id()
    }

    /// Emit an event caused by `parent`. Suspends under backpressure when the
    /// bus queue is at its high-water mark. Returns the emitted event so it
    /// can be used as a parent for follow-ups.
    pub async fn emit(&self, event_type: &str, data: &str, parent: &Event) -> EngineResult<Event> {
        let event = self
            .factory
            .make(event_type, data, &self.module_name, parent)?;
        self.emit_event(event).await
    }

    /// Emit with explicit confidence/visibility/risk scores.
    pub async fn emit_scored(
        &self,
        event_type: &str,
        data: &str,
        parent: &Event,
        confidence: u8,
        visibility: u8,
        risk: u8,
    ) -> EngineResult<Event> {
        let event = self.factory.make_scored(
            event_type,
            data,
            &self.module_name,
            parent,
            confidence,
            visibility,
            risk,
        )?;
        self.emit_event(event).await
    }

    async fn emit_event(&self, mut event: Event) -> EngineResult<Event> {
        // Out-of-scope observations are emitted for bookkeeping but marked so
        // the bus persists them without dispatching.
        if !matches!(event.event_type.as_str(), ROOT_TYPE | ERROR_MESSAGE_TYPE)
            && !self.scope.in_scope(&event.data)
        {
            event.visibility = VISIBILITY_OUT_OF_SCOPE;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.emit_tx.send(event.clone()).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::Cancelled);
        }
        debug!(
            module = %self.module_name,
            event_type = %event.event_type,
            "emitted event"
        );
        Ok(event)
    }

    /// Report a soft failure as an `ERROR_MESSAGE` event tied to `parent`.
    pub async fn report_error(&self, message: &str, parent: &Event) -> EngineResult<Event> {
        self.emit(ERROR_MESSAGE_TYPE, message, parent).await
    }

    /// Resolved option value (descriptor default merged with scan overrides).
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.option(key).and_then(|v| v.parse().ok())
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.option(key).and_then(|v| v.parse().ok())
    }

    /// The scan's scope predicate.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Cached addresses for `name` from the scan-scoped resolution cache.
    pub fn cached_resolution(&self, name: &str) -> EngineResult<Option<Vec<String>>> {
        self.store.get_resolution(self.scan_id(), name)
    }

    /// Record addresses for `name` so other modules skip duplicate DNS work.
    pub fn cache_resolution(&self, name: &str, addresses: &[String]) -> EngineResult<()> {
        self.store.put_resolution(self.scan_id(), name, addresses)
    }

    /// Cooperative cancellation token; poll at I/O boundaries.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
