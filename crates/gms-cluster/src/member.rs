//! Cluster member identity

use crate::error::{MembershipError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{self, AtomicU64};
use std::time::{SystemTime, UNIX_EPOCH};

/// Last start time handed out by [`MemberIdentifier::new`] in this process
static LAST_START_TIME: AtomicU64 = AtomicU64::new(0);

/// Role a member plays, which decides whether it may coordinate a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Locator - preferred coordinator, answers join requests
    Locator,

    /// Cache server - may coordinate when no locator is present
    Server,

    /// Observer/admin process - never coordinates
    Observer,
}

impl MemberRole {
    /// Coordinator preference rank, lower wins. `None` means never eligible.
    pub fn coordinator_rank(&self) -> Option<u8> {
        match self {
            Self::Locator => Some(0),
            Self::Server => Some(1),
            Self::Observer => None,
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Locator => 0,
            Self::Server => 1,
            Self::Observer => 2,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Locator),
            1 => Ok(Self::Server),
            2 => Ok(Self::Observer),
            other => Err(MembershipError::malformed(format!("invalid member role {}", other))),
        }
    }
}

impl Default for MemberRole {
    fn default() -> Self {
        Self::Server
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locator => write!(f, "locator"),
            Self::Server => write!(f, "server"),
            Self::Observer => write!(f, "observer"),
        }
    }
}

impl FromStr for MemberRole {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "locator" => Ok(Self::Locator),
            "server" => Ok(Self::Server),
            "observer" => Ok(Self::Observer),
            other => Err(MembershipError::configuration(format!("Unknown member role: {}", other))),
        }
    }
}

/// Canonical identity of one cluster process.
///
/// Identity (equality, hashing, ordering) is `(address, port, start_time)`.
/// The role and name travel with the identifier but never distinguish two
/// identifiers, so a restarted process at the same address gets a new
/// identity only through its new start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberIdentifier {
    address: IpAddr,
    port: u16,
    start_time: u64,
    #[serde(default)]
    role: MemberRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl MemberIdentifier {
    /// Create an identifier for a process started now. Start times are
    /// strictly increasing within the process.
    pub fn new(address: SocketAddr) -> Self {
        Self::with_start_time(address, next_start_time())
    }

    /// Create an identifier with an explicit start time
    pub fn with_start_time(address: SocketAddr, start_time: u64) -> Self {
        Self {
            address: address.ip(),
            port: address.port(),
            start_time,
            role: MemberRole::default(),
            name: None,
        }
    }

    pub fn with_name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_role(mut self, role: MemberRole) -> Self {
        self.role = role;
        self
    }

    /// Identifier of the same process after a restart at the same address
    pub fn restarted(&self) -> Self {
        let mut next = self.clone();
        next.start_time = current_millis().max(self.start_time.saturating_add(1));
        next
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn role(&self) -> MemberRole {
        self.role
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn can_coordinate(&self) -> bool {
        self.role.coordinator_rank().is_some()
    }

    /// Field-by-field comparison including the transient name and role
    pub fn is_identical(&self, other: &Self) -> bool {
        self == other && self.role == other.role && self.name == other.name
    }

    fn identity(&self) -> (IpAddr, u16, u64) {
        (self.address, self.port, self.start_time)
    }
}

impl PartialEq for MemberIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for MemberIdentifier {}

impl Hash for MemberIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for MemberIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemberIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

/// `[name@]address:port#start_time[/role]`, role omitted for servers
impl fmt::Display for MemberIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{}@", name)?;
        }
        write!(f, "{}#{}", self.socket_addr(), self.start_time)?;
        if self.role != MemberRole::Server {
            write!(f, "/{}", self.role)?;
        }
        Ok(())
    }
}

impl FromStr for MemberIdentifier {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, rest) = match s.rsplit_once('@') {
            Some((name, rest)) if !name.is_empty() => (Some(name.to_string()), rest),
            Some(_) => return Err(MembershipError::configuration(format!("Empty member name in {}", s))),
            None => (None, s),
        };

        let (rest, role) = match rest.split_once('/') {
            Some((rest, role)) => (rest, role.parse()?),
            None => (rest, MemberRole::Server),
        };

        let (address, start_time) = rest
            .split_once('#')
            .ok_or_else(|| MembershipError::configuration(format!("Missing start time in member id {}", s)))?;

        let address: SocketAddr = address.parse()?;
        let start_time = start_time
            .parse::<u64>()
            .map_err(|e| MembershipError::configuration(format!("Invalid start time in {}: {}", s, e)))?;

        Ok(Self {
            address: address.ip(),
            port: address.port(),
            start_time,
            role,
            name,
        })
    }
}

/// Milliseconds since UNIX epoch
pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock start time, bumped past the last one issued
fn next_start_time() -> u64 {
    let now = current_millis();
    let previous = LAST_START_TIME
        .fetch_update(atomic::Ordering::AcqRel, atomic::Ordering::Acquire, |last| {
            Some(now.max(last.saturating_add(1)))
        })
        .unwrap_or_else(|last| last);
    now.max(previous.saturating_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn member(port: u16, start: u64) -> MemberIdentifier {
        MemberIdentifier::with_start_time(SocketAddr::from(([10, 0, 0, 1], port)), start)
    }

    #[test]
    fn test_format_and_parse() {
        let id = member(7001, 1_700_000_000_000).with_name("cache-1");
        assert_eq!(id.to_string(), "cache-1@10.0.0.1:7001#1700000000000");

        let parsed: MemberIdentifier = id.to_string().parse().unwrap();
        assert!(parsed.is_identical(&id));

        let locator = member(10334, 5).with_role(MemberRole::Locator);
        assert_eq!(locator.to_string(), "10.0.0.1:10334#5/locator");
        let parsed: MemberIdentifier = "10.0.0.1:10334#5/locator".parse().unwrap();
        assert!(parsed.is_identical(&locator));
    }

    #[test]
    fn test_ipv6_format() {
        let id = MemberIdentifier::with_start_time("[::1]:7001".parse().unwrap(), 42);
        assert_eq!(id.to_string(), "[::1]:7001#42");
        let parsed: MemberIdentifier = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_errors() {
        assert!("10.0.0.1:7001".parse::<MemberIdentifier>().is_err());
        assert!("10.0.0.1:7001#abc".parse::<MemberIdentifier>().is_err());
        assert!("@10.0.0.1:7001#1".parse::<MemberIdentifier>().is_err());
        assert!("10.0.0.1:7001#1/admin".parse::<MemberIdentifier>().is_err());
        assert!("not-an-address#1".parse::<MemberIdentifier>().is_err());
    }

    #[test]
    fn test_equality_ignores_transient_fields() {
        let a = member(7001, 100).with_name("a");
        let b = member(7001, 100).with_name("renamed").with_role(MemberRole::Observer);

        assert_eq!(a, b);
        assert!(!a.is_identical(&b));

        let mut map = HashMap::new();
        map.insert(a.clone(), 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn test_restarted_process_is_distinct() {
        let original = member(7001, 100);
        let restarted = original.restarted();

        assert_ne!(original, restarted);
        assert_eq!(original.socket_addr(), restarted.socket_addr());
        assert!(restarted.start_time() > original.start_time());

        let last = member(7001, u64::MAX).restarted();
        assert_eq!(last.start_time(), u64::MAX);
    }

    #[test]
    fn test_new_identifiers_never_collide() {
        let address = SocketAddr::from(([10, 0, 0, 1], 7001));
        let first = MemberIdentifier::new(address);
        let second = MemberIdentifier::new(address);

        assert_ne!(first, second);
        assert!(second.start_time() > first.start_time());
    }

    #[test]
    fn test_total_ordering() {
        let mut ids = vec![member(7002, 1), member(7001, 2), member(7001, 1)];
        ids.sort();
        assert_eq!(ids, vec![member(7001, 1), member(7001, 2), member(7002, 1)]);
    }

    #[test]
    fn test_coordinator_eligibility() {
        assert!(member(1, 1).can_coordinate());
        assert!(member(1, 1).with_role(MemberRole::Locator).can_coordinate());
        assert!(!member(1, 1).with_role(MemberRole::Observer).can_coordinate());
        assert!(MemberRole::Locator.coordinator_rank() < MemberRole::Server.coordinator_rank());
    }

    fn role_strategy() -> impl Strategy<Value = MemberRole> {
        prop_oneof![
            Just(MemberRole::Locator),
            Just(MemberRole::Server),
            Just(MemberRole::Observer),
        ]
    }

    proptest! {
        #[test]
        fn prop_display_parse_roundtrip(
            octets in any::<[u8; 4]>(),
            port in any::<u16>(),
            start in any::<u64>(),
            role in role_strategy(),
            name in proptest::option::of("[a-zA-Z0-9._-]{1,20}"),
        ) {
            let mut id = MemberIdentifier::with_start_time(SocketAddr::from((octets, port)), start)
                .with_role(role);
            if let Some(name) = name {
                id = id.with_name(name);
            }
            let parsed: MemberIdentifier = id.to_string().parse().unwrap();
            prop_assert!(parsed.is_identical(&id));
        }
    }
}
