//! Upstream address allocator (Netbox-compatible IPAM).

pub mod dto;
pub mod netbox;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use shared::types::PoolContainer;
use thiserror::Error;

pub use netbox::NetboxClient;

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned {status}: {body}")]
    Status { path: String, status: u16, body: String },

    #[error("failed to decode response from {path}: {message}")]
    Decode { path: String, message: String },

    /// Container has no room left for another reservation.
    #[error("container {0} has no free space")]
    Exhausted(i64),

    #[error("unexpected allocator response: {0}")]
    Unexpected(String),
}

/// A reservation held at the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedAddress {
    /// Allocator object id
    pub id: i64,
    /// Reserved prefix, e.g. "10.0.0.5/32"
    pub prefix: String,
}

#[async_trait]
pub trait Allocator: Send + Sync {
    /// Names of all zones the allocator knows about.
    async fn list_zones(&self) -> Result<Vec<String>, AllocatorError>;

    /// Container prefixes tagged for `zone`, both families.
    async fn list_containers(&self, zone: &str) -> Result<Vec<PoolContainer>, AllocatorError>;

    /// Whether the container still has unreserved space.
    async fn check_available(&self, container_id: i64) -> Result<bool, AllocatorError>;

    /// Whether `address` is not reserved yet, within `vrf_id` when given.
    async fn address_free(
        &self,
        address: &str,
        vrf_id: Option<i64>,
    ) -> Result<bool, AllocatorError>;

    /// Reserve the next free prefix of `prefix_length` inside `container`.
    async fn reserve_next_available(
        &self,
        container: &PoolContainer,
        prefix_length: u8,
    ) -> Result<AllocatedAddress, AllocatorError>;

    /// Reserve exactly `address`, inheriting routing metadata from `container`.
    async fn create_specific(
        &self,
        address: &str,
        container: &PoolContainer,
    ) -> Result<AllocatedAddress, AllocatorError>;

    /// Write the store record id onto the reservation.
    async fn update_metadata(
        &self,
        allocated: &AllocatedAddress,
        record_id: i64,
    ) -> Result<(), AllocatorError>;

    async fn release(&self, allocated_id: i64) -> Result<(), AllocatorError>;
}
