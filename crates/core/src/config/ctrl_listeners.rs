//! Control-channel listener configuration of a router.
//!
//! The canonical form maps each listener address (`"tls:host:port"`) to a set of group
//! labels, where an empty set means the listener is ungrouped. The older flat list of
//! addresses is still accepted on input and normalized into the mapping form.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    net::Ipv6Addr,
    str::FromStr,
};

use serde::{
    de::{self, MapAccess, SeqAccess, Visitor},
    ser::{SerializeMap, SerializeSeq},
    Deserialize, Deserializer, Serialize, Serializer,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerConfigError {
    #[error("invalid listener address {address:?}: {reason}")]
    InvalidAddress {
        address: String,
        reason: &'static str,
    },
    #[error("duplicate listener address {0}")]
    DuplicateAddress(String),
    #[error("invalid group label {label:?} for listener {address}")]
    InvalidGroup { address: String, label: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerTransport {
    Tls,
    Tcp,
    Udp,
    Transwarp,
    Ws,
    Wss,
}

impl ListenerTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls => "tls",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Transwarp => "transwarp",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }
}

impl FromStr for ListenerTransport {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tls" => Ok(Self::Tls),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "transwarp" => Ok(Self::Transwarp),
            "ws" => Ok(Self::Ws),
            "wss" => Ok(Self::Wss),
            "" => Err("missing transport scheme"),
            _ => Err("unsupported transport scheme"),
        }
    }
}

/// A parsed `scheme:host:port` listener address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerAddress {
    pub transport: ListenerTransport,
    pub host: String,
    pub port: u16,
}

impl FromStr for ListenerAddress {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("address is empty");
        }
        let (scheme, rest) = s.split_once(':').ok_or("missing transport scheme")?;
        let transport = scheme.parse::<ListenerTransport>()?;

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, port) = bracketed
                .split_once("]:")
                .ok_or("unterminated IPv6 host")?;
            host.parse::<Ipv6Addr>().map_err(|_| "invalid IPv6 host")?;
            (host, port)
        } else {
            let (host, port) = rest.rsplit_once(':').ok_or("missing port")?;
            if host.is_empty() {
                return Err("missing host");
            }
            if !host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            {
                return Err("invalid host");
            }
            (host, port)
        };

        let port = port.parse::<u16>().map_err(|_| "invalid port")?;
        if port == 0 {
            return Err("port must be non-zero");
        }
        Ok(Self {
            transport,
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for ListenerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}:[{}]:{}", self.transport.as_str(), self.host, self.port)
        } else {
            write!(f, "{}:{}:{}", self.transport.as_str(), self.host, self.port)
        }
    }
}

/// Listener configuration as submitted, before validation.
///
/// Duplicated addresses are preserved so validation can reject them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawCtrlChanListeners {
    Grouped(Vec<(String, Vec<String>)>),
    /// Flat list of addresses without group labels.
    Legacy(Vec<String>),
}

impl Serialize for RawCtrlChanListeners {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Grouped(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (address, groups) in entries {
                    map.serialize_entry(address, groups)?;
                }
                map.end()
            }
            Self::Legacy(addresses) => {
                let mut seq = serializer.serialize_seq(Some(addresses.len()))?;
                for address in addresses {
                    seq.serialize_element(address)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for RawCtrlChanListeners {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawVisitor;

        impl<'de> Visitor<'de> for RawVisitor {
            type Value = RawCtrlChanListeners;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of listener addresses to group labels or a list of addresses")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((address, groups)) = map.next_entry::<String, Option<Vec<String>>>()? {
                    entries.push((address, groups.unwrap_or_default()));
                }
                Ok(RawCtrlChanListeners::Grouped(entries))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut addresses = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(address) = seq.next_element::<String>()? {
                    addresses.push(address);
                }
                Ok(RawCtrlChanListeners::Legacy(addresses))
            }
        }

        deserializer.deserialize_any(RawVisitor)
    }
}

impl From<&CtrlChanListeners> for RawCtrlChanListeners {
    fn from(listeners: &CtrlChanListeners) -> Self {
        Self::Grouped(
            listeners
                .0
                .iter()
                .map(|(address, groups)| (address.clone(), groups.iter().cloned().collect()))
                .collect(),
        )
    }
}

/// Validates a submitted listener configuration into its canonical form.
pub fn normalize(raw: RawCtrlChanListeners) -> Result<CtrlChanListeners, ListenerConfigError> {
    let entries = match raw {
        RawCtrlChanListeners::Grouped(entries) => entries,
        RawCtrlChanListeners::Legacy(addresses) => {
            addresses.into_iter().map(|a| (a, Vec::new())).collect()
        }
    };

    let mut seen = HashSet::with_capacity(entries.len());
    let mut listeners = BTreeMap::new();
    for (address, groups) in entries {
        if let Err(reason) = address.parse::<ListenerAddress>() {
            return Err(ListenerConfigError::InvalidAddress { address, reason });
        }
        if !seen.insert(address.clone()) {
            return Err(ListenerConfigError::DuplicateAddress(address));
        }
        let mut labels = BTreeSet::new();
        for label in groups {
            if label.trim().is_empty() {
                return Err(ListenerConfigError::InvalidGroup { address, label });
            }
            labels.insert(label);
        }
        listeners.insert(address, labels);
    }
    Ok(CtrlChanListeners(listeners))
}

/// Canonical listener configuration: address to group labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CtrlChanListeners(BTreeMap<String, BTreeSet<String>>);

impl<'de> Deserialize<'de> for CtrlChanListeners {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawCtrlChanListeners::deserialize(deserializer)?;
        normalize(raw).map_err(de::Error::custom)
    }
}

impl TryFrom<RawCtrlChanListeners> for CtrlChanListeners {
    type Error = ListenerConfigError;

    fn try_from(raw: RawCtrlChanListeners) -> Result<Self, Self::Error> {
        normalize(raw)
    }
}

impl CtrlChanListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0.contains_key(address)
    }

    pub fn groups(&self, address: &str) -> Option<&BTreeSet<String>> {
        self.0.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.0.iter().map(|(a, g)| (a.as_str(), g))
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Listeners tagged with `label`.
    pub fn in_group<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(_, groups)| groups.contains(label))
            .map(|(a, _)| a.as_str())
    }

    pub fn ungrouped(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, groups)| groups.is_empty())
            .map(|(a, _)| a.as_str())
    }

    pub fn parsed(&self) -> Vec<ListenerAddress> {
        self.0
            .keys()
            .filter_map(|a| a.parse().ok())
            .collect()
    }

    pub fn diff(&self, other: &CtrlChanListeners) -> ListenerDiff {
        let mut diff = ListenerDiff::default();
        for (address, groups) in &other.0 {
            match self.0.get(address) {
                None => diff.added.push(address.clone()),
                Some(current) if current != groups => diff.regrouped.push(address.clone()),
                Some(_) => {}
            }
        }
        diff.removed = self
            .0
            .keys()
            .filter(|a| !other.0.contains_key(*a))
            .cloned()
            .collect();
        diff
    }

    /// Applies an update: `None` leaves the configuration untouched, anything else
    /// replaces it entirely once it validates.
    pub fn apply_patch(
        &mut self,
        patch: Option<RawCtrlChanListeners>,
    ) -> Result<Option<ListenerDiff>, ListenerConfigError> {
        let Some(raw) = patch else {
            return Ok(None);
        };
        let updated = normalize(raw)?;
        let diff = self.diff(&updated);
        *self = updated;
        Ok(Some(diff))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub regrouped: Vec<String>,
}

impl ListenerDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.regrouped.is_empty()
    }
}
