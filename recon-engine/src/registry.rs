/*!
Module registry: installed-module catalogue and scan planning queries
*/

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::event::{CanonicalRule, EventCatalog};
use crate::module::ScanModule;
use crate::target::Target;

/// Wildcard consumed-type entry meaning "every type".
pub const WILDCARD: &str = "*";

/// Use-case tags every deployment understands. Arbitrary user-defined tags
/// are also accepted.
pub const USE_CASE_ALL: &str = "ALL";
pub const USE_CASE_FOOTPRINT: &str = "FOOTPRINT";
pub const USE_CASE_INVESTIGATE: &str = "INVESTIGATE";
pub const USE_CASE_PASSIVE: &str = "PASSIVE";

static TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").unwrap());

/// A typed option a module exposes, with default and documentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub default: String,
    pub description: String,
}

impl OptionSpec {
    pub fn new(default: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            description: description.into(),
        }
    }
}

/// Static description of an installed module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: String,
    /// Event types this module wants delivered; may include `*`.
    pub consumes: Vec<String>,
    /// Event types this module can emit.
    pub produces: Vec<String>,
    /// Use-case tags (FOOTPRINT, INVESTIGATE, PASSIVE, ALL, custom).
    pub use_cases: Vec<String>,
    pub options: BTreeMap<String, OptionSpec>,
    /// Unsubscribe the module for the rest of the scan after its first
    /// handler failure.
    pub fatal_on_error: bool,
    /// Per-event-type delivery ceilings, in events per second. Types absent
    /// from the map are delivered unthrottled.
    pub rate_limits: BTreeMap<String, u32>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            consumes: Vec::new(),
            produces: Vec::new(),
            use_cases: vec![USE_CASE_ALL.to_string()],
            options: BTreeMap::new(),
            fatal_on_error: false,
            rate_limits: BTreeMap::new(),
        }
    }

    pub fn consumes(mut self, types: &[&str]) -> Self {
        self.consumes = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn produces(mut self, types: &[&str]) -> Self {
        self.produces = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn use_cases(mut self, tags: &[&str]) -> Self {
        self.use_cases = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn option(mut self, key: &str, spec: OptionSpec) -> Self {
        self.options.insert(key.to_string(), spec);
        self
    }

    pub fn fatal_on_error(mut self, fatal: bool) -> Self {
        self.fatal_on_error = fatal;
        self
    }

    /// Cap deliveries of `event_type` to this module at `per_second`.
    pub fn rate_limit(mut self, event_type: &str, per_second: u32) -> Self {
        self.rate_limits.insert(event_type.to_string(), per_second);
        self
    }

    pub fn consumes_wildcard(&self) -> bool {
        self.consumes.iter().any(|t| t == WILDCARD)
    }

    fn validate(&self) -> EngineResult<()> {
        let invalid = |reason: String| EngineError::InvalidDescriptor {
            module: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(EngineError::InvalidDescriptor {
                module: "<unnamed>".to_string(),
                reason: "empty module name".to_string(),
            });
        }
        if self.consumes.is_empty() {
            return Err(invalid("module consumes no event types".to_string()));
        }
        for t in &self.consumes {
            if t != WILDCARD && !TYPE_RE.is_match(t) {
                return Err(invalid(format!("invalid consumed event type '{t}'")));
            }
        }
        for t in &self.produces {
            if !TYPE_RE.is_match(t) {
                return Err(invalid(format!("invalid produced event type '{t}'")));
            }
        }
        if self.use_cases.is_empty() {
            return Err(invalid("module declares no use cases".to_string()));
        }
        Ok(())
    }
}

type ModuleFactory = Box<dyn Fn() -> Box<dyn ScanModule> + Send + Sync>;

struct RegistryEntry {
    descriptor: ModuleDescriptor,
    factory: ModuleFactory,
}

/// Catalogue of installed modules, populated at process start.
///
/// Circular consume/produce relationships between modules are expected; the
/// bus breaks cycles through deduplication, so no ordering is attempted here.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module via its factory. The factory is invoked once to
    /// obtain and validate the descriptor. Duplicate names are fatal.
    pub fn register<F>(&mut self, factory: F) -> EngineResult<()>
    where
        F: Fn() -> Box<dyn ScanModule> + Send + Sync + 'static,
    {
        let descriptor = factory().descriptor();
        descriptor.validate()?;
        if self.entries.contains_key(&descriptor.name) {
            return Err(EngineError::DuplicateModule(descriptor.name));
        }
        self.entries.insert(
            descriptor.name.clone(),
            RegistryEntry {
                descriptor,
                factory: Box::new(factory),
            },
        );
        Ok(())
    }

    pub fn all(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.entries.values().map(|e| &e.descriptor)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.entries.get(name).map(|e| &e.descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fresh instance of a registered module.
    pub fn instantiate(&self, name: &str) -> EngineResult<Box<dyn ScanModule>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| EngineError::UnknownModule(name.to_string()))?;
        Ok((entry.factory)())
    }

    /// Modules carrying `tag` (or tagged ALL). `ALL` matches every module.
    pub fn by_use_case(&self, tag: &str) -> Vec<&ModuleDescriptor> {
        let tag = tag.to_ascii_uppercase();
        self.all()
            .filter(|d| {
                tag == USE_CASE_ALL
                    || d.use_cases
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(&tag) || t == USE_CASE_ALL)
            })
            .collect()
    }

    /// Plan the module set for a scan: the use-case set plus `enable`, minus
    /// `disable`, reduced to modules reachable from the target's seed type.
    pub fn select(
        &self,
        target: &Target,
        use_case: &str,
        enable: &[String],
        disable: &[String],
    ) -> EngineResult<Vec<ModuleDescriptor>> {
        let mut names: HashSet<String> = self
            .by_use_case(use_case)
            .into_iter()
            .map(|d| d.name.clone())
            .collect();
        for name in enable {
            if self.get(name).is_none() {
                return Err(EngineError::UnknownModule(name.clone()));
            }
            names.insert(name.clone());
        }
        for name in disable {
            if self.get(name).is_none() {
                return Err(EngineError::UnknownModule(name.clone()));
            }
            names.remove(name);
        }
        let candidates: Vec<&ModuleDescriptor> = self
            .all()
            .filter(|d| names.contains(&d.name))
            .collect();
        let seed = vec![target.kind.event_type().to_string()];
        Ok(self.closure(&seed, &candidates))
    }

    /// Fixed-point reachability: keep any candidate at least one of whose
    /// consumed types appears in the growing produced-type frontier. The
    /// frontier starts at `seed_types` and absorbs each kept module's
    /// produced types. Terminates because the candidate set is finite.
    pub fn closure(
        &self,
        seed_types: &[String],
        candidates: &[&ModuleDescriptor],
    ) -> Vec<ModuleDescriptor> {
        let mut frontier: HashSet<String> = seed_types.iter().cloned().collect();
        let mut kept: BTreeMap<String, ModuleDescriptor> = BTreeMap::new();
        loop {
            let mut changed = false;
            for candidate in candidates {
                if kept.contains_key(&candidate.name) {
                    continue;
                }
                let reachable = candidate.consumes_wildcard()
                    || candidate.consumes.iter().any(|t| frontier.contains(t));
                if reachable {
                    for produced in &candidate.produces {
                        if frontier.insert(produced.clone()) {
                            changed = true;
                        }
                    }
                    kept.insert(candidate.name.clone(), (*candidate).clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        kept.into_values().collect()
    }

    /// The declared type universe plus the seed vocabulary, for the event
    /// factory. Name-shaped types are case-folded during canonicalisation.
    pub fn catalog(&self) -> EventCatalog {
        let mut catalog = EventCatalog::seed();
        for descriptor in self.all() {
            for t in descriptor.consumes.iter().chain(descriptor.produces.iter()) {
                if t == WILDCARD || catalog.contains(t) {
                    continue;
                }
                if is_casefold_type(t) {
                    catalog.declare(t, CanonicalRule::CaseFold);
                } else {
                    catalog.declare_default(t);
                }
            }
        }
        catalog
    }
}

fn is_casefold_type(event_type: &str) -> bool {
    matches!(
        event_type,
        "INTERNET_NAME" | "DOMAIN_NAME" | "EMAILADDR" | "AFFILIATE_INTERNET_NAME" | "CO_HOSTED_SITE"
    )
}
