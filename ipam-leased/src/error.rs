use thiserror::Error;
use crate::allocator::AllocatorError;
use crate::cipher::CipherError;

/// Errors surfaced by the lease engine.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// No cached container for the zone and family has a free address.
    #[error("no free address available for {key}")]
    NoCapacity { key: String },

    /// Explicit address lies outside every container of the zone.
    #[error("address {address} is not valid for zone {zone}")]
    InvalidZoneForAddress { address: String, zone: String },

    #[error("no address registered for the given secret, zone and address")]
    NotFound,

    #[error("service {0} is not registered on this address")]
    ServiceNotFound(String),

    /// Secret rotation on a shared address or by a foreign service.
    #[error("secret change rejected: {0}")]
    SecretChangeRejected(String),

    /// Revision kept moving under us; the caller may retry.
    #[error("address record was modified concurrently")]
    ConcurrentModification,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("allocator unavailable: {0}")]
    Allocator(#[from] AllocatorError),

    #[error("store unavailable: {0}")]
    Store(String),

    #[error("cipher failure: {0}")]
    Cipher(#[from] CipherError),
}

impl LeaseError {
    pub fn store(err: anyhow::Error) -> Self {
        LeaseError::Store(format!("{:#}", err))
    }

    /// True for failures caused by the request rather than by an upstream.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LeaseError::InvalidZoneForAddress { .. }
                | LeaseError::NotFound
                | LeaseError::ServiceNotFound(_)
                | LeaseError::SecretChangeRejected(_)
                | LeaseError::InvalidRequest(_)
        )
    }
}

pub type LeaseResult<T> = std::result::Result<T, LeaseError>;
