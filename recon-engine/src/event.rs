/*!
Event model: typed observations, deterministic ids and the wire format
*/

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::target::TargetKind;

/// Module name stamped on seed events.
pub const ROOT_MODULE: &str = "ROOT";

/// Event type of the synthetic scan seed.
pub const ROOT_TYPE: &str = "ROOT";

/// Event type modules use to report soft failures.
pub const ERROR_MESSAGE_TYPE: &str = "ERROR_MESSAGE";

/// Visibility value marking an event as outside the scan's scope.
pub const VISIBILITY_OUT_OF_SCOPE: u8 = 0;

/// Default confidence/visibility assigned by `EventFactory::make`.
pub const DEFAULT_CONFIDENCE: u8 = 100;
pub const DEFAULT_VISIBILITY: u8 = 100;
pub const DEFAULT_RISK: u8 = 0;

const FIELD_SEP: char = '\x1f';

/// An immutable typed observation produced by a module during a scan.
///
/// The `id` is content-addressed from `(scan_id, type, data, parent_id)` so
/// that replaying a scan after a crash reproduces identical ancestry. The
/// `hash` digests only `(type, canonical data)` and drives deduplication via
/// the store's `UNIQUE(scan_id, hash)` constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub scan_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: String,
    pub module: String,
    pub parent_id: Option<String>,
    /// Milliseconds since the Unix epoch at production time.
    pub created_at: i64,
    /// Ancestral distance from the root event (root = 0).
    pub depth: u32,
    /// 0-100.
    pub confidence: u8,
    /// 0-100; 0 means out of scope.
    pub visibility: u8,
    /// 0-100.
    pub risk: u8,
    pub hash: String,
}

impl Event {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Serialize to the JSON wire format. Round-trips every field.
    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Event> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub(crate) fn compute_id(
        scan_id: &str,
        event_type: &str,
        data: &str,
        parent_id: Option<&str>,
    ) -> String {
        let input = format!(
            "{scan_id}{FIELD_SEP}{event_type}{FIELD_SEP}{data}{FIELD_SEP}{}",
            parent_id.unwrap_or("-")
        );
        blake3::hash(input.as_bytes()).to_hex().to_string()
    }

    pub(crate) fn compute_hash(event_type: &str, data: &str) -> String {
        let input = format!("{event_type}{FIELD_SEP}{data}");
        blake3::hash(input.as_bytes()).to_hex().to_string()
    }
}

/// How a type's data is canonicalised before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalRule {
    /// Trim and collapse internal whitespace.
    Text,
    /// `Text`, then ASCII-lowercase. Used for names and addresses.
    CaseFold,
}

/// The declared universe of event types plus per-type canonicalisation rules.
///
/// Built by the registry from the seed vocabulary and every type any
/// installed module declares; the event factory rejects types outside it.
#[derive(Debug, Clone, Default)]
pub struct EventCatalog {
    types: HashSet<String>,
    rules: HashMap<String, CanonicalRule>,
}

impl EventCatalog {
    /// Catalog holding only the core seed vocabulary: `ROOT`, one `*_TARGET`
    /// type per target kind and `ERROR_MESSAGE`.
    pub fn seed() -> Self {
        let mut catalog = Self::default();
        catalog.declare(ROOT_TYPE, CanonicalRule::Text);
        catalog.declare(ERROR_MESSAGE_TYPE, CanonicalRule::Text);
        for kind in TargetKind::ALL {
            catalog.declare(kind.event_type(), kind.canonical_rule());
        }
        catalog
    }

    pub fn declare(&mut self, event_type: &str, rule: CanonicalRule) {
        self.types.insert(event_type.to_string());
        if rule != CanonicalRule::Text {
            self.rules.insert(event_type.to_string(), rule);
        }
    }

    /// Declare a type with the default rule unless one is already present.
    pub fn declare_default(&mut self, event_type: &str) {
        self.types.insert(event_type.to_string());
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.types.contains(event_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(String::as_str)
    }

    /// Canonicalise `data` for `event_type`: trim, collapse whitespace and
    /// apply the type-specific rule. Empty results are rejected.
    pub fn canonicalise(&self, event_type: &str, data: &str) -> EngineResult<String> {
        if !self.contains(event_type) {
            return Err(EngineError::InvalidEventType(event_type.to_string()));
        }
        let collapsed = data.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            return Err(EngineError::InvalidEventData {
                event_type: event_type.to_string(),
                reason: "empty data".to_string(),
            });
        }
        match self.rules.get(event_type) {
            Some(CanonicalRule::CaseFold) => Ok(collapsed.to_ascii_lowercase()),
            _ => Ok(collapsed),
        }
    }
}

/// Builds events for one scan, enforcing the catalog and stamping ids.
#[derive(Debug, Clone)]
pub struct EventFactory {
    scan_id: String,
    catalog: std::sync::Arc<EventCatalog>,
}

impl EventFactory {
    pub fn new(scan_id: impl Into<String>, catalog: std::sync::Arc<EventCatalog>) -> Self {
        Self {
            scan_id: scan_id.into(),
            catalog,
        }
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn catalog(&self) -> &EventCatalog {
        &self.catalog
    }

    /// The synthetic seed event carrying the target value.
    pub fn root(&self, target_value: &str) -> Event {
        let data = target_value.to_string();
        let hash = Event::compute_hash(ROOT_TYPE, &data);
        Event {
            id: Event::compute_id(&self.scan_id, ROOT_TYPE, &data, None),
            scan_id: self.scan_id.clone(),
            event_type: ROOT_TYPE.to_string(),
            data,
            module: ROOT_MODULE.to_string(),
            parent_id: None,
            created_at: now_ms(),
            depth: 0,
            confidence: DEFAULT_CONFIDENCE,
            visibility: DEFAULT_VISIBILITY,
            risk: DEFAULT_RISK,
            hash,
        }
    }

    /// Build an event caused by `parent` with default scores.
    pub fn make(
        &self,
        event_type: &str,
        data: &str,
        module: &str,
        parent: &Event,
    ) -> EngineResult<Event> {
        self.make_scored(
            event_type,
            data,
            module,
            parent,
            DEFAULT_CONFIDENCE,
            DEFAULT_VISIBILITY,
            DEFAULT_RISK,
        )
    }

    /// Build an event with explicit confidence/visibility/risk (each 0-100).
    pub fn make_scored(
        &self,
        event_type: &str,
        data: &str,
        module: &str,
        parent: &Event,
        confidence: u8,
        visibility: u8,
        risk: u8,
    ) -> EngineResult<Event> {
        let data = self.catalog.canonicalise(event_type, data)?;
        for (name, score) in [
            ("confidence", confidence),
            ("visibility", visibility),
            ("risk", risk),
        ] {
            if score > 100 {
                return Err(EngineError::InvalidEventData {
                    event_type: event_type.to_string(),
                    reason: format!("{name} is {score}; expected 0-100"),
                });
            }
        }
        let hash = Event::compute_hash(event_type, &data);
        Ok(Event {
            id: Event::compute_id(&self.scan_id, event_type, &data, Some(&parent.id)),
            scan_id: self.scan_id.clone(),
            event_type: event_type.to_string(),
            data,
            module: module.to_string(),
            parent_id: Some(parent.id.clone()),
            created_at: now_ms(),
            depth: parent.depth + 1,
            confidence,
            visibility,
            risk,
            hash,
        })
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn factory() -> EventFactory {
        EventFactory::new("scan1", Arc::new(EventCatalog::seed()))
    }

    #[test]
    fn root_event_shape() {
        let root = factory().root("example.com");
        assert_eq!(root.module, ROOT_MODULE);
        assert_eq!(root.event_type, ROOT_TYPE);
        assert!(root.parent_id.is_none());
        assert_eq!(root.depth, 0);
    }

    #[test]
    fn ids_are_deterministic() {
        let f = factory();
        let root = f.root("example.com");
        let a = f
            .make("DOMAIN_NAME_TARGET", "example.com", "m1", &root)
            .unwrap();
        let b = f
            .make("DOMAIN_NAME_TARGET", "example.com", "m1", &root)
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.depth, 1);
    }

    #[test]
    fn id_depends_on_parent() {
        let f = factory();
        let root = f.root("example.com");
        let child = f
            .make("DOMAIN_NAME_TARGET", "example.com", "m1", &root)
            .unwrap();
        let grandchild = f
            .make("DOMAIN_NAME_TARGET", "example.com", "m1", &child)
            .unwrap();
        // Same (type, data) so the dedup hash matches, but ancestry differs.
        assert_eq!(child.hash, grandchild.hash);
        assert_ne!(child.id, grandchild.id);
    }

    #[test]
    fn unknown_type_rejected() {
        let f = factory();
        let root = f.root("example.com");
        let err = f.make("NOT_A_TYPE", "x", "m1", &root).unwrap_err();
        assert!(matches!(err, EngineError::InvalidEventType(_)));
    }

    #[test]
    fn casefold_and_whitespace_canonicalisation() {
        let catalog = EventCatalog::seed();
        let canon = catalog
            .canonicalise("DOMAIN_NAME_TARGET", "  WWW.Example.COM  ")
            .unwrap();
        assert_eq!(canon, "www.example.com");
        assert!(catalog.canonicalise("DOMAIN_NAME_TARGET", "   ").is_err());
    }

    #[test]
    fn wire_round_trip() {
        let f = factory();
        let root = f.root("example.com");
        let event = f
            .make_scored("ERROR_MESSAGE", "lookup failed", "m1", &root, 50, 0, 10)
            .unwrap();
        let bytes = event.to_bytes().unwrap();
        let back = Event::from_bytes(&bytes).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn score_range_enforced() {
        let f = factory();
        let root = f.root("example.com");
        let err = f
            .make_scored("ERROR_MESSAGE", "x", "m1", &root, 101, 0, 0)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidEventData { .. }));
    }
}
