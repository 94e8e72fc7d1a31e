/*!
Target parsing, canonicalisation and the scope predicate
*/

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::event::CanonicalRule;
use crate::store::ScanStore;

/// The closed set of target kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetKind {
    DomainName,
    Ipv4Address,
    Ipv6Address,
    Netblock,
    Email,
    HumanName,
    Username,
    PhoneNumber,
    BitcoinAddress,
    Asn,
}

impl TargetKind {
    /// Every kind, in the fixed auto-detection order.
    pub const ALL: [TargetKind; 10] = [
        TargetKind::Ipv4Address,
        TargetKind::Ipv6Address,
        TargetKind::Netblock,
        TargetKind::Email,
        TargetKind::DomainName,
        TargetKind::PhoneNumber,
        TargetKind::Asn,
        TargetKind::Username,
        TargetKind::HumanName,
        TargetKind::BitcoinAddress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::DomainName => "DOMAIN_NAME",
            TargetKind::Ipv4Address => "IPV4_ADDRESS",
            TargetKind::Ipv6Address => "IPV6_ADDRESS",
            TargetKind::Netblock => "NETBLOCK",
            TargetKind::Email => "EMAIL",
            TargetKind::HumanName => "HUMAN_NAME",
            TargetKind::Username => "USERNAME",
            TargetKind::PhoneNumber => "PHONE_NUMBER",
            TargetKind::BitcoinAddress => "BITCOIN_ADDRESS",
            TargetKind::Asn => "ASN",
        }
    }

    /// The seed event type emitted for a target of this kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            TargetKind::DomainName => "DOMAIN_NAME_TARGET",
            TargetKind::Ipv4Address => "IPV4_ADDRESS_TARGET",
            TargetKind::Ipv6Address => "IPV6_ADDRESS_TARGET",
            TargetKind::Netblock => "NETBLOCK_TARGET",
            TargetKind::Email => "EMAIL_TARGET",
            TargetKind::HumanName => "HUMAN_NAME_TARGET",
            TargetKind::Username => "USERNAME_TARGET",
            TargetKind::PhoneNumber => "PHONE_NUMBER_TARGET",
            TargetKind::BitcoinAddress => "BITCOIN_ADDRESS_TARGET",
            TargetKind::Asn => "ASN_TARGET",
        }
    }

    /// Canonicalisation rule for this kind's seed event type.
    pub fn canonical_rule(&self) -> CanonicalRule {
        match self {
            TargetKind::DomainName
            | TargetKind::Email
            | TargetKind::Username
            | TargetKind::Ipv6Address => CanonicalRule::CaseFold,
            _ => CanonicalRule::Text,
        }
    }
}

impl FromStr for TargetKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        TargetKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| EngineError::InvalidTarget {
                value: s.to_string(),
                reason: "unknown target kind".to_string(),
            })
    }
}

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s.]+(?:\.[^@\s.]+)+$").unwrap());
static DOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z]{2,}$").unwrap());
static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[0-9 ().-]{6,24}$").unwrap());
static ASN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?i)as[0-9]{1,10}$").unwrap());
static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_.-]{3,32}$").unwrap());
static HUMAN_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z'.-]*(?: [A-Za-z][A-Za-z'.-]*)+$").unwrap()
});
static BITCOIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[13][a-km-zA-HJ-NP-Z1-9]{25,34}|bc1[a-z0-9]{11,71})$").unwrap()
});

/// The canonicalised subject of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub value: String,
}

impl Target {
    /// Parse a raw target string. With no `kind_hint` the kind is detected in
    /// the fixed order IPV4 -> IPV6 -> NETBLOCK -> EMAIL -> DOMAIN_NAME ->
    /// PHONE_NUMBER -> ASN -> USERNAME -> HUMAN_NAME -> BITCOIN_ADDRESS;
    /// ambiguous strings take the first kind that matches.
    pub fn parse(kind_hint: Option<TargetKind>, raw: &str) -> EngineResult<Target> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EngineError::InvalidTarget {
                value: raw.to_string(),
                reason: "empty target".to_string(),
            });
        }
        let kind = match kind_hint {
            Some(kind) => kind,
            None => Self::detect(trimmed).ok_or_else(|| EngineError::InvalidTarget {
                value: raw.to_string(),
                reason: "could not detect target kind".to_string(),
            })?,
        };
        let value = Self::canonicalise(kind, trimmed)?;
        Ok(Target { kind, value })
    }

    fn detect(raw: &str) -> Option<TargetKind> {
        let lower = raw.to_ascii_lowercase();
        for kind in TargetKind::ALL {
            let matched = match kind {
                TargetKind::Ipv4Address => raw.parse::<Ipv4Addr>().is_ok(),
                TargetKind::Ipv6Address => raw.parse::<Ipv6Addr>().is_ok(),
                TargetKind::Netblock => raw.contains('/') && raw.parse::<IpNetwork>().is_ok(),
                TargetKind::Email => EMAIL_RE.is_match(&lower),
                TargetKind::DomainName => DOMAIN_RE.is_match(&lower),
                TargetKind::PhoneNumber => {
                    PHONE_RE.is_match(raw) && raw.chars().filter(char::is_ascii_digit).count() >= 7
                }
                TargetKind::Asn => ASN_RE.is_match(raw),
                TargetKind::Username => USERNAME_RE.is_match(raw),
                TargetKind::HumanName => HUMAN_NAME_RE.is_match(raw),
                TargetKind::BitcoinAddress => BITCOIN_RE.is_match(raw),
            };
            if matched {
                return Some(kind);
            }
        }
        None
    }

    fn canonicalise(kind: TargetKind, raw: &str) -> EngineResult<String> {
        let invalid = |reason: &str| EngineError::InvalidTarget {
            value: raw.to_string(),
            reason: reason.to_string(),
        };
        match kind {
            TargetKind::DomainName => {
                let lower = raw.to_ascii_lowercase();
                if !DOMAIN_RE.is_match(&lower) {
                    return Err(invalid("not a valid domain name"));
                }
                Ok(lower)
            }
            TargetKind::Ipv4Address => {
                let addr: Ipv4Addr = raw.parse().map_err(|_| invalid("not an IPv4 address"))?;
                Ok(addr.to_string())
            }
            TargetKind::Ipv6Address => {
                let addr: Ipv6Addr = raw.parse().map_err(|_| invalid("not an IPv6 address"))?;
                Ok(addr.to_string())
            }
            TargetKind::Netblock => {
                let net: IpNetwork = raw.parse().map_err(|_| invalid("not a CIDR netblock"))?;
                // Normalise to the network address.
                let canonical = IpNetwork::new(net.network(), net.prefix())
                    .map_err(|_| invalid("not a CIDR netblock"))?;
                Ok(canonical.to_string())
            }
            TargetKind::Email => {
                let lower = raw.to_ascii_lowercase();
                if !EMAIL_RE.is_match(&lower) {
                    return Err(invalid("not an email address"));
                }
                Ok(lower)
            }
            TargetKind::HumanName => {
                let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
                if !HUMAN_NAME_RE.is_match(&collapsed) {
                    return Err(invalid("not a person name"));
                }
                Ok(collapsed)
            }
            TargetKind::Username => {
                let lower = raw.to_ascii_lowercase();
                if !USERNAME_RE.is_match(&lower) {
                    return Err(invalid("not a username"));
                }
                Ok(lower)
            }
            TargetKind::PhoneNumber => {
                if !PHONE_RE.is_match(raw) {
                    return Err(invalid("not a phone number"));
                }
                let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
                if !(7..=15).contains(&digits.len()) {
                    return Err(invalid("phone number must have 7-15 digits"));
                }
                // E.164
                Ok(format!("+{digits}"))
            }
            TargetKind::BitcoinAddress => {
                let trimmed = raw.trim();
                if !BITCOIN_RE.is_match(trimmed) {
                    return Err(invalid("not a bitcoin address"));
                }
                Ok(trimmed.to_string())
            }
            TargetKind::Asn => {
                if !ASN_RE.is_match(raw) {
                    return Err(invalid("not an AS number"));
                }
                Ok(raw.to_ascii_uppercase())
            }
        }
    }
}

/// The policy predicate deciding which observed values belong to the scan.
///
/// Aliases (equivalent names and addresses registered by modules during the
/// scan) widen the scope, as does the store's scan-scoped resolution cache:
/// an address is in scope when a name already in scope resolves to it, and a
/// name is in scope for address-shaped targets when its cached addresses fall
/// inside the target. Scope is advisory; the bus persists out-of-scope events
/// but does not dispatch them by default.
pub struct Scope {
    target: Target,
    scan_id: String,
    store: Arc<dyn ScanStore>,
    names: Mutex<HashSet<String>>,
    addresses: Mutex<HashSet<String>>,
}

impl Scope {
    pub fn new(target: Target, scan_id: impl Into<String>, store: Arc<dyn ScanStore>) -> Self {
        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        match target.kind {
            TargetKind::DomainName => {
                names.insert(target.value.clone());
            }
            TargetKind::Email => {
                if let Some(domain) = target.value.split('@').nth(1) {
                    names.insert(domain.to_string());
                }
            }
            TargetKind::Ipv4Address | TargetKind::Ipv6Address => {
                addresses.insert(target.value.clone());
            }
            _ => {}
        }
        Self {
            target,
            scan_id: scan_id.into(),
            store,
            names: Mutex::new(names),
            addresses: Mutex::new(addresses),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Register an equivalent name for the target (e.g. a hostname a module
    /// proved belongs to the same organisation).
    pub fn add_name_alias(&self, name: &str) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.trim().to_ascii_lowercase());
    }

    /// Register an equivalent address for the target.
    pub fn add_address_alias(&self, address: &str) {
        self.addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.trim().to_ascii_lowercase());
    }

    /// Whether `data` is inside the investigation.
    pub fn in_scope(&self, data: &str) -> bool {
        let value = data.trim().to_ascii_lowercase();
        if value.is_empty() {
            return false;
        }

        // Nothing useful can be said about relatedness for these kinds.
        if matches!(
            self.target.kind,
            TargetKind::HumanName
                | TargetKind::PhoneNumber
                | TargetKind::Username
                | TargetKind::BitcoinAddress
        ) {
            return true;
        }

        if self.target.kind == TargetKind::Asn {
            return value == self.target.value.to_ascii_lowercase();
        }

        if let Ok(addr) = value.parse::<IpAddr>() {
            return self.address_in_scope(&addr);
        }

        // Names and emails share the host-membership rules.
        let host = value.rsplit('@').next().unwrap_or(&value).to_string();
        self.name_in_scope(&host)
    }

    fn address_in_scope(&self, addr: &IpAddr) -> bool {
        let canonical = addr.to_string();
        if self
            .addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&canonical)
        {
            return true;
        }
        if self.target.kind == TargetKind::Netblock {
            if let Ok(net) = self.target.value.parse::<IpNetwork>() {
                if net.contains(*addr) {
                    return true;
                }
            }
        }
        // An address a known in-scope name resolves to.
        let names: Vec<String> = self
            .names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        for name in names {
            if let Ok(Some(resolved)) = self.store.get_resolution(&self.scan_id, &name) {
                if resolved.iter().any(|a| a == &canonical) {
                    return true;
                }
            }
        }
        false
    }

    fn name_in_scope(&self, host: &str) -> bool {
        {
            let names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
            for name in names.iter() {
                if host == name || host.ends_with(&format!(".{name}")) {
                    return true;
                }
            }
        }
        // A name whose cached addresses land inside an address-shaped target.
        if matches!(
            self.target.kind,
            TargetKind::Netblock | TargetKind::Ipv4Address | TargetKind::Ipv6Address
        ) {
            if let Ok(Some(resolved)) = self.store.get_resolution(&self.scan_id, host) {
                for addr in resolved {
                    if let Ok(parsed) = addr.parse::<IpAddr>() {
                        if self.address_in_scope(&parsed) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }
}
