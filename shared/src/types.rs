use std::fmt;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Serialize, Deserialize};

/// Address class of a lease. Pools are partitioned by zone and family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpFamily {
    #[serde(rename = "ipv4")]
    V4,
    #[serde(rename = "ipv6")]
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Prefix length of a single host address in this family.
    pub fn host_prefix_len(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IpFamily::V4 => "ipv4",
            IpFamily::V6 => "ipv6",
        }
    }

    fn key_suffix(self) -> &'static str {
        match self {
            IpFamily::V4 => "v4",
            IpFamily::V6 => "v6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefix cache key for a zone and family, e.g. "inet_v4".
pub fn zone_family_key(zone: &str, family: IpFamily) -> String {
    format!("{}_{}", zone, family.key_suffix())
}

/// Parses an address as given by a caller. A bare IP becomes a host prefix
/// ("10.0.0.5" -> "10.0.0.5/32").
pub fn parse_address(raw: &str) -> Option<IpNet> {
    let raw = raw.trim();
    if let Ok(net) = raw.parse::<IpNet>() {
        return Some(net);
    }
    let ip = raw.parse::<IpAddr>().ok()?;
    IpNet::new(ip, IpFamily::of(&ip).host_prefix_len()).ok()
}

/// Identity of a service binding. Unique within one address record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub service_name: String,
    pub namespace_id: String,
    pub cluster_id: String,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster_id, self.namespace_id, self.service_name)
    }
}

/// One consumer's claim on a leased address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub service_name: String,

    pub namespace_id: String,

    pub cluster_id: String,

    /// Days the binding survives after its consumer asks for expiration
    #[serde(default)]
    pub retention_period_days: u32,

    /// None while active. Once set, the cleanup sweep removes the binding
    /// after this instant.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Opts the binding out of the cleanup sweep's expiry pass
    #[serde(default)]
    pub deny_external_cleanup: bool,
}

impl ServiceBinding {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            service_name: self.service_name.clone(),
            namespace_id: self.namespace_id.clone(),
            cluster_id: self.cluster_id.clone(),
        }
    }

    pub fn has_key(&self, key: &ServiceKey) -> bool {
        self.service_name == key.service_name
            && self.namespace_id == key.namespace_id
            && self.cluster_id == key.cluster_id
    }
}

/// A persisted lease: one allocated address and the services bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    /// Store-assigned identifier
    pub id: i64,

    /// Deterministic ciphertext of the owner's shared secret
    pub secret: String,

    pub zone: String,

    pub ip_family: IpFamily,

    /// Allocated prefix, e.g. "10.0.0.5/32"
    pub address: String,

    /// Allocator-side object id, used to release the address
    pub pool_id: i64,

    pub services: Vec<ServiceBinding>,

    /// Bumped on every write; guards read-modify-write cycles
    pub revision: i64,

    /// Whether the allocator object carries this record's id
    pub stamped: bool,

    pub created_at: DateTime<Utc>,
}

impl AddressRecord {
    pub fn binding(&self, key: &ServiceKey) -> Option<&ServiceBinding> {
        self.services.iter().find(|s| s.has_key(key))
    }
}

/// An allocator-side block of addresses for one zone and family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolContainer {
    /// Allocator id of the container prefix
    pub id: i64,

    pub prefix: IpNet,

    pub zone: String,

    /// Routing domain new reservations are created in
    #[serde(default)]
    pub vrf_id: Option<i64>,

    #[serde(default)]
    pub tenant_id: Option<i64>,
}

impl PoolContainer {
    pub fn family(&self) -> IpFamily {
        match self.prefix {
            IpNet::V4(_) => IpFamily::V4,
            IpNet::V6(_) => IpFamily::V6,
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.prefix.contains(addr)
    }
}

/// Service descriptor supplied with a lease request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub service_name: String,
    pub namespace_id: String,
    pub cluster_id: String,
    #[serde(default)]
    pub retention_period_days: u32,
    #[serde(default)]
    pub deny_external_cleanup: bool,
}

impl ServiceSpec {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            service_name: self.service_name.clone(),
            namespace_id: self.namespace_id.clone(),
            cluster_id: self.cluster_id.clone(),
        }
    }

    /// Builds the binding stored for this service.
    pub fn to_binding(&self, expires_at: Option<DateTime<Utc>>) -> ServiceBinding {
        ServiceBinding {
            service_name: self.service_name.clone(),
            namespace_id: self.namespace_id.clone(),
            cluster_id: self.cluster_id.clone(),
            retention_period_days: self.retention_period_days,
            expires_at,
            deny_external_cleanup: self.deny_external_cleanup,
        }
    }
}

/// Register or expire request, after transport decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Plaintext shared secret; encrypted before it reaches the store
    pub secret: String,

    /// Replacement secret for a single-service lease. Only valid on an
    /// address the caller already holds.
    #[serde(default)]
    pub new_secret: Option<String>,

    pub zone: String,

    pub ip_family: IpFamily,

    /// Explicit address. None asks for the next free one.
    #[serde(default)]
    pub address: Option<String>,

    pub service: ServiceSpec,
}

impl LeaseRequest {
    /// The explicit address, if any. Blank counts as absent.
    pub fn requested_address(&self) -> Option<&str> {
        self.address.as_deref().map(str::trim).filter(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub message: String,
    pub address: String,
}
