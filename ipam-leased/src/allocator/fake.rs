//! In-memory allocator used by the engine, cache and cleanup tests.

use std::collections::{BTreeMap, HashMap};
use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use shared::types::PoolContainer;
use super::{AllocatedAddress, Allocator, AllocatorError};

#[derive(Debug, Clone)]
pub struct Reservation {
    pub prefix: String,
    pub record_id: Option<i64>,
}

#[derive(Default)]
struct State {
    zones: Vec<String>,
    containers: HashMap<String, Vec<PoolContainer>>,
    reserved: BTreeMap<i64, Reservation>,
    released: Vec<i64>,
    next_id: i64,
    failing_zone: Option<String>,
    fail_stamp: bool,
    fail_release: bool,
}

#[derive(Default)]
pub struct FakeAllocator {
    state: Mutex<State>,
}

impl FakeAllocator {
    pub fn new() -> Self {
        let allocator = Self::default();
        allocator.state.lock().next_id = 1000;
        allocator
    }

    pub fn with_container(self, zone: &str, id: i64, prefix: &str) -> Self {
        {
            let mut state = self.state.lock();
            if !state.zones.iter().any(|z| z == zone) {
                state.zones.push(zone.to_string());
            }
            state.containers.entry(zone.to_string()).or_default().push(container(zone, id, prefix));
        }
        self
    }

    pub fn set_containers(&self, zone: &str, containers: Vec<PoolContainer>) {
        let mut state = self.state.lock();
        if !state.zones.iter().any(|z| z == zone) {
            state.zones.push(zone.to_string());
        }
        state.containers.insert(zone.to_string(), containers);
    }

    pub fn set_failing_zone(&self, zone: Option<&str>) {
        self.state.lock().failing_zone = zone.map(str::to_string);
    }

    pub fn set_fail_stamp(&self, fail: bool) {
        self.state.lock().fail_stamp = fail;
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.state.lock().fail_release = fail;
    }

    /// Reserve an address behind the engine's back.
    pub fn reserve_out_of_band(&self, prefix: &str) -> i64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.reserved.insert(id, Reservation { prefix: prefix.to_string(), record_id: None });
        id
    }

    pub fn reservation(&self, id: i64) -> Option<Reservation> {
        self.state.lock().reserved.get(&id).cloned()
    }

    pub fn reservation_count(&self) -> usize {
        self.state.lock().reserved.len()
    }

    pub fn released(&self) -> Vec<i64> {
        self.state.lock().released.clone()
    }
}

pub fn container(zone: &str, id: i64, prefix: &str) -> PoolContainer {
    PoolContainer {
        id,
        prefix: prefix.parse().unwrap(),
        zone: zone.to_string(),
        vrf_id: Some(1),
        tenant_id: None,
    }
}

fn find_container(state: &State, id: i64) -> Option<PoolContainer> {
    state.containers.values().flatten().find(|c| c.id == id).cloned()
}

fn is_reserved(state: &State, prefix: &str) -> bool {
    state.reserved.values().any(|r| r.prefix == prefix)
}

fn first_free(state: &State, net: &IpNet, prefix_length: u8) -> Option<String> {
    net.hosts()
        .map(|ip| format!("{}/{}", ip, prefix_length))
        .find(|candidate| !is_reserved(state, candidate))
}

fn server_error(path: &str) -> AllocatorError {
    AllocatorError::Status {
        path: path.to_string(),
        status: 500,
        body: "injected failure".to_string(),
    }
}

#[async_trait]
impl Allocator for FakeAllocator {
    async fn list_zones(&self) -> Result<Vec<String>, AllocatorError> {
        Ok(self.state.lock().zones.clone())
    }

    async fn list_containers(&self, zone: &str) -> Result<Vec<PoolContainer>, AllocatorError> {
        let state = self.state.lock();
        if state.failing_zone.as_deref() == Some(zone) {
            return Err(server_error("containers"));
        }
        Ok(state.containers.get(zone).cloned().unwrap_or_default())
    }

    async fn check_available(&self, container_id: i64) -> Result<bool, AllocatorError> {
        let state = self.state.lock();
        let container = find_container(&state, container_id)
            .ok_or_else(|| AllocatorError::Unexpected(format!("no container {}", container_id)))?;
        let len = container.family().host_prefix_len();
        Ok(first_free(&state, &container.prefix, len).is_some())
    }

    async fn address_free(&self, address: &str, _vrf_id: Option<i64>) -> Result<bool, AllocatorError> {
        Ok(!is_reserved(&self.state.lock(), address))
    }

    async fn reserve_next_available(
        &self,
        container: &PoolContainer,
        prefix_length: u8,
    ) -> Result<AllocatedAddress, AllocatorError> {
        let mut state = self.state.lock();
        let prefix = first_free(&state, &container.prefix, prefix_length)
            .ok_or(AllocatorError::Exhausted(container.id))?;

        state.next_id += 1;
        let id = state.next_id;
        state.reserved.insert(id, Reservation { prefix: prefix.clone(), record_id: None });
        Ok(AllocatedAddress { id, prefix })
    }

    async fn create_specific(
        &self,
        address: &str,
        _container: &PoolContainer,
    ) -> Result<AllocatedAddress, AllocatorError> {
        let mut state = self.state.lock();
        if is_reserved(&state, address) {
            return Err(AllocatorError::Status {
                path: "prefixes".to_string(),
                status: 400,
                body: "duplicate prefix".to_string(),
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state.reserved.insert(id, Reservation { prefix: address.to_string(), record_id: None });
        Ok(AllocatedAddress { id, prefix: address.to_string() })
    }

    async fn update_metadata(&self, allocated: &AllocatedAddress, record_id: i64) -> Result<(), AllocatorError> {
        let mut state = self.state.lock();
        if state.fail_stamp {
            return Err(server_error("stamp"));
        }
        match state.reserved.get_mut(&allocated.id) {
            Some(reservation) => {
                reservation.record_id = Some(record_id);
                Ok(())
            }
            None => Err(AllocatorError::Status {
                path: "stamp".to_string(),
                status: 404,
                body: "not found".to_string(),
            }),
        }
    }

    async fn release(&self, allocated_id: i64) -> Result<(), AllocatorError> {
        let mut state = self.state.lock();
        if state.fail_release {
            return Err(server_error("release"));
        }
        state.reserved.remove(&allocated_id);
        state.released.push(allocated_id);
        Ok(())
    }
}
