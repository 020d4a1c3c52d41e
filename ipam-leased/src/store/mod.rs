//! Address document store.

pub mod db;
pub mod handle;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::types::{AddressRecord, IpFamily, ServiceBinding};

pub use db::AddressDb;
pub use handle::StoreHandle;

/// Equality filter over record fields; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressFilter {
    pub id: Option<i64>,
    pub secret: Option<String>,
    pub zone: Option<String>,
    pub ip_family: Option<IpFamily>,
    pub address: Option<String>,
}

impl AddressFilter {
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// Owner lookup used by the update and expiration paths.
    pub fn owned(secret: &str, zone: &str, ip_family: IpFamily, address: &str) -> Self {
        Self {
            secret: Some(secret.to_string()),
            zone: Some(zone.to_string()),
            ip_family: Some(ip_family),
            address: Some(address.to_string()),
            ..Default::default()
        }
    }

    /// All of an owner's records in one zone and family.
    pub fn owner(secret: &str, zone: &str, ip_family: IpFamily) -> Self {
        Self {
            secret: Some(secret.to_string()),
            zone: Some(zone.to_string()),
            ip_family: Some(ip_family),
            ..Default::default()
        }
    }
}

/// A record before the store has assigned it an id.
#[derive(Debug, Clone)]
pub struct NewAddressRecord {
    pub secret: String,
    pub zone: String,
    pub ip_family: IpFamily,
    pub address: String,
    pub pool_id: i64,
    pub services: Vec<ServiceBinding>,
}

/// Single-document operations. Writes carry the revision they were computed
/// from and report `false` when the record moved on in the meantime.
#[async_trait]
pub trait AddressStore: Send + Sync {
    async fn find_one(&self, filter: AddressFilter) -> Result<Option<AddressRecord>>;

    async fn find_many(&self, filter: AddressFilter) -> Result<Vec<AddressRecord>>;

    /// `None` when the address is already recorded in that zone.
    async fn insert_one(&self, record: NewAddressRecord) -> Result<Option<AddressRecord>>;

    async fn replace_services(
        &self,
        id: i64,
        expected_revision: i64,
        services: Vec<ServiceBinding>,
    ) -> Result<bool>;

    async fn replace_secret_and_services(
        &self,
        id: i64,
        expected_revision: i64,
        secret: String,
        services: Vec<ServiceBinding>,
    ) -> Result<bool>;

    /// Drop every expired, cleanup-eligible binding across all records.
    /// Returns the number of bindings removed.
    async fn pull_expired_services(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Records left without any binding.
    async fn find_orphans(&self) -> Result<Vec<AddressRecord>>;

    /// Delete a record only while it is still bindingless and at
    /// `expected_revision`. `false` means it was renewed or is gone.
    async fn delete_one(&self, id: i64, expected_revision: i64) -> Result<bool>;

    /// Records whose allocator object has not been stamped with their id.
    async fn find_unstamped(&self) -> Result<Vec<AddressRecord>>;

    async fn mark_stamped(&self, id: i64) -> Result<()>;
}
