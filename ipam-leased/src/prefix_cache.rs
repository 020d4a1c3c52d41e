use std::collections::HashMap;
use std::sync::Arc;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use shared::types::{zone_family_key, IpFamily, PoolContainer};
use crate::allocator::Allocator;

pub type PrefixMap = HashMap<String, Vec<PoolContainer>>;

/// Zone × family → pool containers, served from memory.
///
/// Readers clone an `Arc` to the current map; `refresh` builds a complete
/// replacement off-lock and swaps it in, so no reader ever sees a map that
/// mixes two refreshes.
#[derive(Default)]
pub struct PrefixCache {
    prefixes: RwLock<Arc<PrefixMap>>,
}

impl PrefixCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the cache from the allocator. Any failing zone aborts the
    /// refresh and keeps the previous snapshot.
    pub async fn refresh(&self, allocator: &dyn Allocator) -> Result<()> {
        let zones = allocator
            .list_zones()
            .await
            .context("Failed to fetch zones from allocator")?;

        let mut next = PrefixMap::new();
        for zone in &zones {
            let containers = allocator
                .list_containers(zone)
                .await
                .with_context(|| format!("Failed to fetch containers for zone {}", zone))?;

            let (v4, v6): (Vec<_>, Vec<_>) = containers
                .into_iter()
                .partition(|c| c.family() == IpFamily::V4);

            next.insert(zone_family_key(zone, IpFamily::V4), v4);
            next.insert(zone_family_key(zone, IpFamily::V6), v6);
        }

        let containers: usize = next.values().map(Vec::len).sum();
        *self.prefixes.write() = Arc::new(next);

        tracing::info!(
            "Prefix cache refreshed: {} zones, {} containers",
            zones.len(),
            containers
        );
        Ok(())
    }

    /// Containers for a key such as "inet_v4"; empty if unknown.
    pub fn get(&self, key: &str) -> Vec<PoolContainer> {
        self.snapshot().get(key).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> Arc<PrefixMap> {
        Arc::clone(&self.prefixes.read())
    }

    /// Zone names present in the current snapshot, sorted.
    pub fn zones(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut zones: Vec<String> = snapshot
            .keys()
            .filter_map(|key| key.rsplit_once('_').map(|(zone, _)| zone.to_string()))
            .collect();
        zones.sort();
        zones.dedup();
        zones
    }
}
