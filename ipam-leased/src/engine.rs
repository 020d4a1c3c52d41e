use std::sync::Arc;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use shared::types::{
    parse_address, zone_family_key, AddressRecord, IpFamily, LeaseRequest, LeaseResponse,
    PoolContainer, ServiceBinding,
};
use crate::allocator::{AllocatedAddress, Allocator, AllocatorError};
use crate::bindings;
use crate::cipher::SecretCipher;
use crate::error::{LeaseError, LeaseResult};
use crate::prefix_cache::PrefixCache;
use crate::store::{AddressFilter, AddressStore, NewAddressRecord};

/// Read-modify-write cycles before giving up on a contended record
pub const MAX_WRITE_ATTEMPTS: usize = 3;

const MSG_REGISTERED: &str = "Address registered successfully";
const MSG_UPDATED: &str = "Address updated successfully";
const MSG_EXPIRATION_SET: &str = "Service expiration set successfully";

/// A write computed from the record as last read.
enum Write {
    Services(Vec<ServiceBinding>),
    SecretAndServices(String, Vec<ServiceBinding>),
}

/// Coordinates the allocator, the store and the prefix cache for every
/// lease mutation. Holds no locks of its own; concurrent writers are
/// serialized by the store's revision check.
#[derive(Clone)]
pub struct LeaseEngine {
    allocator: Arc<dyn Allocator>,
    store: Arc<dyn AddressStore>,
    cache: Arc<PrefixCache>,
    cipher: Arc<dyn SecretCipher>,
}

impl LeaseEngine {
    pub fn new(
        allocator: Arc<dyn Allocator>,
        store: Arc<dyn AddressStore>,
        cache: Arc<PrefixCache>,
        cipher: Arc<dyn SecretCipher>,
    ) -> Self {
        Self {
            allocator,
            store,
            cache,
            cipher,
        }
    }

    /// Register a service on an address. Without an explicit address the
    /// caller's existing binding is refreshed, or a new address allocated.
    /// With one, the address is claimed if free and joined otherwise.
    pub async fn register(&self, req: &LeaseRequest) -> LeaseResult<LeaseResponse> {
        let secret = self.cipher.encrypt(&req.secret)?;

        let Some(raw) = req.requested_address() else {
            return match self.find_bound(&secret, req).await? {
                Some(record) => self.update(&secret, &record.address, req).await,
                None => {
                    reject_new_secret(req)?;
                    self.register_next_available(&secret, req).await
                }
            };
        };

        let address = normalize_address(raw, req.ip_family)?;
        let containers = self.cache.get(&zone_family_key(&req.zone, req.ip_family));
        let vrf_id = find_container(&containers, &address).and_then(|c| c.vrf_id);

        let normalized = address.to_string();
        if self.allocator.address_free(&normalized, vrf_id).await? {
            reject_new_secret(req)?;
            self.register_specific(&secret, &address, req).await
        } else {
            self.update(&secret, &normalized, req).await
        }
    }

    /// Mark the request's service for removal after its retention period.
    pub async fn set_service_expiration(&self, req: &LeaseRequest) -> LeaseResult<LeaseResponse> {
        self.set_service_expiration_at(req, Utc::now()).await
    }

    pub(crate) async fn set_service_expiration_at(
        &self,
        req: &LeaseRequest,
        now: DateTime<Utc>,
    ) -> LeaseResult<LeaseResponse> {
        let raw = req
            .requested_address()
            .ok_or_else(|| LeaseError::InvalidRequest("address is required".to_string()))?;
        let address = normalize_address(raw, req.ip_family)?.to_string();
        let secret = self.cipher.encrypt(&req.secret)?;
        let key = req.service.key();

        let filter = AddressFilter::owned(&secret, &req.zone, req.ip_family, &address);
        self.write_with_retry(filter, |record| {
            bindings::expire(&record.services, &key, now).map(Write::Services)
        })
        .await?;

        tracing::info!("Service {} on {} expires in {} days", key, address, req.service.retention_period_days);
        Ok(LeaseResponse {
            message: MSG_EXPIRATION_SET.to_string(),
            address,
        })
    }

    /// The caller's record in this zone and family already carrying its service.
    async fn find_bound(&self, secret: &str, req: &LeaseRequest) -> LeaseResult<Option<AddressRecord>> {
        let key = req.service.key();
        let records = self
            .store
            .find_many(AddressFilter::owner(secret, &req.zone, req.ip_family))
            .await
            .map_err(LeaseError::store)?;

        Ok(records.into_iter().find(|r| r.binding(&key).is_some()))
    }

    async fn register_next_available(&self, secret: &str, req: &LeaseRequest) -> LeaseResult<LeaseResponse> {
        let key = zone_family_key(&req.zone, req.ip_family);
        let prefix_length = req.ip_family.host_prefix_len();

        let mut allocated = None;
        for container in self.cache.get(&key) {
            if !self.allocator.check_available(container.id).await? {
                continue;
            }
            match self.allocator.reserve_next_available(&container, prefix_length).await {
                Ok(address) => {
                    allocated = Some(address);
                    break;
                }
                Err(AllocatorError::Exhausted(id)) => {
                    tracing::debug!("Container {} filled up before reservation", id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let allocated = allocated.ok_or(LeaseError::NoCapacity { key })?;
        self.commit(secret, allocated, req).await
    }

    async fn register_specific(&self, secret: &str, address: &IpNet, req: &LeaseRequest) -> LeaseResult<LeaseResponse> {
        let containers = self.cache.get(&zone_family_key(&req.zone, req.ip_family));
        let container = find_container(&containers, address).ok_or_else(|| LeaseError::InvalidZoneForAddress {
            address: address.to_string(),
            zone: req.zone.clone(),
        })?;

        let allocated = self.allocator.create_specific(&address.to_string(), container).await?;
        self.commit(secret, allocated, req).await
    }

    /// Persist a fresh reservation, then stamp the allocator object with the
    /// record id. A failed insert gives the reservation back; a failed stamp
    /// is left for the cleanup worker.
    async fn commit(&self, secret: &str, allocated: AllocatedAddress, req: &LeaseRequest) -> LeaseResult<LeaseResponse> {
        let record = NewAddressRecord {
            secret: secret.to_string(),
            zone: req.zone.clone(),
            ip_family: req.ip_family,
            address: allocated.prefix.clone(),
            pool_id: allocated.id,
            services: vec![req.service.to_binding(None)],
        };

        let inserted = match self.store.insert_one(record).await {
            Ok(Some(inserted)) => inserted,
            Ok(None) => {
                self.release_reservation(&allocated).await;
                return Err(LeaseError::Store(format!(
                    "address {} is already recorded in zone {}",
                    allocated.prefix, req.zone
                )));
            }
            Err(e) => {
                self.release_reservation(&allocated).await;
                return Err(LeaseError::store(e));
            }
        };

        match self.allocator.update_metadata(&allocated, inserted.id).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_stamped(inserted.id).await {
                    tracing::warn!("Failed to mark record {} stamped: {:#}", inserted.id, e);
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Partial commit: record {} stored but {} not stamped: {}",
                    inserted.id,
                    allocated.prefix,
                    e
                );
            }
        }

        tracing::info!(
            "Registered {} for {} in {}",
            allocated.prefix,
            req.service.key(),
            zone_family_key(&req.zone, req.ip_family)
        );
        Ok(LeaseResponse {
            message: MSG_REGISTERED.to_string(),
            address: allocated.prefix,
        })
    }

    async fn release_reservation(&self, allocated: &AllocatedAddress) {
        if let Err(e) = self.allocator.release(allocated.id).await {
            tracing::error!(
                "Partial commit: reservation {} ({}) could not be released: {}",
                allocated.id,
                allocated.prefix,
                e
            );
        }
    }

    /// Add or refresh the caller's binding on an address it owns, rotating
    /// the secret when asked to.
    async fn update(&self, secret: &str, address: &str, req: &LeaseRequest) -> LeaseResult<LeaseResponse> {
        let new_secret = match req.new_secret.as_deref() {
            Some(plain) => Some(self.cipher.encrypt(plain)?),
            None => None,
        };

        let filter = AddressFilter::owned(secret, &req.zone, req.ip_family, address);
        self.write_with_retry(filter, |record| {
            let binding = req.service.to_binding(None);
            match &new_secret {
                Some(secret) => bindings::rotate(&record.services, binding)
                    .map(|services| Write::SecretAndServices(secret.clone(), services)),
                None => Ok(Write::Services(bindings::upsert(&record.services, binding))),
            }
        })
        .await?;

        if new_secret.is_some() {
            tracing::info!("Rotated secret on {} for {}", address, req.service.key());
        } else {
            tracing::debug!("Bound {} to {}", req.service.key(), address);
        }
        Ok(LeaseResponse {
            message: MSG_UPDATED.to_string(),
            address: address.to_string(),
        })
    }

    /// Read the record matching `filter`, compute the write, and apply it
    /// only if nobody else wrote in between.
    async fn write_with_retry<F>(&self, filter: AddressFilter, compute: F) -> LeaseResult<()>
    where
        F: Fn(&AddressRecord) -> LeaseResult<Write> + Send + Sync,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let record = self
                .store
                .find_one(filter.clone())
                .await
                .map_err(LeaseError::store)?
                .ok_or(LeaseError::NotFound)?;

            let applied = match compute(&record)? {
                Write::Services(services) => self
                    .store
                    .replace_services(record.id, record.revision, services)
                    .await,
                Write::SecretAndServices(secret, services) => self
                    .store
                    .replace_secret_and_services(record.id, record.revision, secret, services)
                    .await,
            }
            .map_err(LeaseError::store)?;

            if applied {
                return Ok(());
            }
            tracing::debug!(
                "Record {} changed at revision {} (attempt {}/{})",
                record.id,
                record.revision,
                attempt,
                MAX_WRITE_ATTEMPTS
            );
        }

        Err(LeaseError::ConcurrentModification)
    }
}

/// Parse a caller-supplied address. It must be a single host of the
/// requested family.
pub(crate) fn normalize_address(raw: &str, family: IpFamily) -> LeaseResult<IpNet> {
    let address = parse_address(raw)
        .ok_or_else(|| LeaseError::InvalidRequest(format!("'{}' is not a valid address", raw)))?;

    if IpFamily::of(&address.addr()) != family {
        return Err(LeaseError::InvalidRequest(format!(
            "invalid ip family for the provided address {}",
            raw
        )));
    }
    if address.prefix_len() != family.host_prefix_len() {
        return Err(LeaseError::InvalidRequest(format!(
            "address {} must be a single host (/{})",
            raw,
            family.host_prefix_len()
        )));
    }
    Ok(address)
}

/// Secrets are only rotated on records that already exist.
fn reject_new_secret(req: &LeaseRequest) -> LeaseResult<()> {
    if req.new_secret.is_some() {
        return Err(LeaseError::InvalidRequest(
            "new_secret can only be used on an address the caller already holds".to_string(),
        ));
    }
    Ok(())
}

fn find_container<'a>(containers: &'a [PoolContainer], address: &IpNet) -> Option<&'a PoolContainer> {
    containers.iter().find(|c| c.contains(&address.addr()))
}
