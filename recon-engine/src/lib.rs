/*!
Core library for an event-driven reconnaissance scan engine.

A scan starts from a single seed target (domain, IP address, netblock,
email address and friends), fans work out to a set of pluggable modules
over a typed event bus, and lands every observation in an append-only
scan store. Modules never call each other; they communicate only by
emitting events, so capability grows by installing modules rather than
by wiring call graphs.

The pieces:
- [`event`]: the event model, canonicalisation and deterministic ids
- [`target`]: target parsing and the scan scope predicate
- [`module`]: the [`module::ScanModule`] plug-in trait and its context
- [`registry`]: installed-module catalogue and scan planning
- [`bus`]: dispatch, deduplication, backpressure and idle detection
- [`store`]: durable scan/event persistence (SQLite or in-memory)
- [`controller`]: the per-scan lifecycle state machine
*/

pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod module;
pub mod registry;
pub mod store;
pub mod target;

pub use config::EngineConfig;
pub use controller::{ScanController, ScanProgress, ScanRequest};
pub use error::{EngineError, EngineResult};
pub use event::Event;
pub use module::{ModuleContext, ScanModule};
pub use registry::{ModuleDescriptor, ModuleRegistry, OptionSpec};
pub use store::{MemoryStore, ScanStatus, ScanStore, SqliteStore};
pub use target::{Target, TargetKind};
