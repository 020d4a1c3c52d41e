use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use crate::allocator::{AllocatedAddress, Allocator};
use crate::store::AddressStore;

/// Counts from one sweep, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: u64,
    pub reaped: usize,
    pub restamped: usize,
}

/// Periodic reconciliation between the store and the allocator.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn AddressStore>,
    allocator: Arc<dyn Allocator>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn AddressStore>, allocator: Arc<dyn Allocator>) -> Self {
        Self { store, allocator }
    }

    /// One pass: drop expired bindings, reap records left without any,
    /// then stamp records whose allocator object never got their id.
    /// Each step's failures are logged and left for the next sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.store.pull_expired_services(now).await {
            Ok(count) => report.expired = count,
            Err(e) => tracing::error!("Failed to remove expired services: {:#}", e),
        }

        report.reaped = self.reap().await;
        report.restamped = self.restamp().await;
        report
    }

    async fn reap(&self) -> usize {
        let orphans = match self.store.find_orphans().await {
            Ok(orphans) => orphans,
            Err(e) => {
                tracing::error!("Failed to list orphaned addresses: {:#}", e);
                return 0;
            }
        };

        let mut reaped = 0;
        for record in orphans {
            match self.store.delete_one(record.id, record.revision).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("Record {} was renewed or removed, skipping", record.id);
                    continue;
                }
                Err(e) => {
                    tracing::error!("Failed to delete record {}: {:#}", record.id, e);
                    continue;
                }
            }

            // The record is gone either way; a failed release leaks the address
            if let Err(e) = self.allocator.release(record.pool_id).await {
                tracing::warn!(
                    "Partial commit: record {} deleted but {} (pool id {}) not released: {}",
                    record.id,
                    record.address,
                    record.pool_id,
                    e
                );
            }

            tracing::info!("Reaped {} in zone {}", record.address, record.zone);
            reaped += 1;
        }
        reaped
    }

    async fn restamp(&self) -> usize {
        let unstamped = match self.store.find_unstamped().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Failed to list unstamped addresses: {:#}", e);
                return 0;
            }
        };

        let mut restamped = 0;
        for record in unstamped {
            let allocated = AllocatedAddress {
                id: record.pool_id,
                prefix: record.address.clone(),
            };
            if let Err(e) = self.allocator.update_metadata(&allocated, record.id).await {
                tracing::warn!("Failed to stamp {} with record {}: {}", record.address, record.id, e);
                continue;
            }
            match self.store.mark_stamped(record.id).await {
                Ok(()) => restamped += 1,
                Err(e) => tracing::error!("Failed to mark record {} stamped: {:#}", record.id, e),
            }
        }
        restamped
    }
}

/// Cleanup worker loop. Sweeps run one at a time; a slow sweep delays the
/// next tick rather than stacking up.
pub async fn run(reconciler: Reconciler, interval: Duration, cancel: CancellationToken) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = reconciler.sweep(Utc::now()).await;
                tracing::debug!(
                    "Sweep done: {} expired, {} reaped, {} restamped",
                    report.expired,
                    report.reaped,
                    report.restamped
                );
            }
            _ = cancel.cancelled() => {
                tracing::info!("Cleanup worker shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use crate::allocator::fake::FakeAllocator;
    use crate::engine::tests::{request, Harness};

    fn zone_a() -> FakeAllocator {
        FakeAllocator::new().with_container("zoneA", 1, "10.0.0.0/24")
    }

    fn reconciler(h: &Harness) -> Reconciler {
        Reconciler::new(h.store.clone(), h.allocator.clone())
    }

    #[tokio::test]
    async fn test_lease_lifecycle() {
        let h = Harness::new(zone_a()).await;
        for i in 1..=4 {
            h.allocator.reserve_out_of_band(&format!("10.0.0.{}/32", i));
        }

        let address = h.engine.register(&request("api", None)).await.unwrap().address;
        assert_eq!(address, "10.0.0.5/32");
        let pool_id = h.records().await[0].pool_id;

        let now = Utc::now();
        h.engine
            .set_service_expiration_at(&request("api", Some(&address)), now)
            .await
            .unwrap();
        assert_eq!(
            h.records().await[0].services[0].expires_at,
            Some(now + ChronoDuration::days(7))
        );

        // Not yet due
        let early = reconciler(&h).sweep(now + ChronoDuration::days(6)).await;
        assert_eq!(early.reaped, 0);
        assert_eq!(h.records().await.len(), 1);

        let report = reconciler(&h).sweep(now + ChronoDuration::days(7) + ChronoDuration::seconds(1)).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.reaped, 1);
        assert!(h.records().await.is_empty());
        assert_eq!(h.allocator.released(), vec![pool_id]);
        assert!(h.allocator.reservation(pool_id).is_none());
    }

    #[tokio::test]
    async fn test_shared_address_survives_partial_expiry() {
        let h = Harness::new(zone_a()).await;
        let address = h.engine.register(&request("api", None)).await.unwrap().address;
        h.engine.register(&request("web", Some(&address))).await.unwrap();

        let now = Utc::now();
        h.engine
            .set_service_expiration_at(&request("api", Some(&address)), now)
            .await
            .unwrap();

        let report = reconciler(&h).sweep(now + ChronoDuration::days(8)).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.reaped, 0);

        let records = h.records().await;
        assert_eq!(records[0].services.len(), 1);
        assert_eq!(records[0].services[0].service_name, "web");
        assert!(h.allocator.released().is_empty());
    }

    #[tokio::test]
    async fn test_deny_external_cleanup_is_kept() {
        let h = Harness::new(zone_a()).await;
        let mut req = request("api", None);
        req.service.deny_external_cleanup = true;
        let address = h.engine.register(&req).await.unwrap().address;

        let now = Utc::now();
        req.address = Some(address);
        h.engine.set_service_expiration_at(&req, now).await.unwrap();

        let report = reconciler(&h).sweep(now + ChronoDuration::days(30)).await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(h.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_release_failure_still_deletes() {
        let h = Harness::new(zone_a()).await;
        let address = h.engine.register(&request("api", None)).await.unwrap().address;

        let now = Utc::now();
        h.engine
            .set_service_expiration_at(&request("api", Some(&address)), now)
            .await
            .unwrap();
        h.allocator.set_fail_release(true);

        let report = reconciler(&h).sweep(now + ChronoDuration::days(8)).await;
        assert_eq!(report.reaped, 1);
        assert!(h.records().await.is_empty());
        // Leaked at the allocator
        assert_eq!(h.allocator.reservation_count(), 1);
    }

    #[tokio::test]
    async fn test_renewed_orphan_is_kept() {
        let h = Harness::new(zone_a()).await;
        let address = h.engine.register(&request("api", None)).await.unwrap().address;

        let now = Utc::now();
        h.engine
            .set_service_expiration_at(&request("api", Some(&address)), now)
            .await
            .unwrap();

        // A client re-registers between the orphan listing and the delete
        h.store.renew_after_listing(request("api", None).service.to_binding(None));

        let report = reconciler(&h).sweep(now + ChronoDuration::days(8)).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.reaped, 0);

        let records = h.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].services.len(), 1);
        assert!(h.allocator.released().is_empty());
        assert!(h.allocator.reservation(records[0].pool_id).is_some());

        // Nothing left to reap on the next pass either
        assert_eq!(reconciler(&h).sweep(now + ChronoDuration::days(8)).await.reaped, 0);
    }

    #[tokio::test]
    async fn test_restamps_unstamped_records() {
        let h = Harness::new(zone_a()).await;
        h.allocator.set_fail_stamp(true);
        h.engine.register(&request("api", None)).await.unwrap();

        // Allocator still failing: nothing changes
        let report = reconciler(&h).sweep(Utc::now()).await;
        assert_eq!(report.restamped, 0);
        assert!(!h.records().await[0].stamped);

        h.allocator.set_fail_stamp(false);
        let report = reconciler(&h).sweep(Utc::now()).await;
        assert_eq!(report.restamped, 1);

        let record = &h.records().await[0];
        assert!(record.stamped);
        assert_eq!(h.allocator.reservation(record.pool_id).unwrap().record_id, Some(record.id));

        // Idempotent
        assert_eq!(reconciler(&h).sweep(Utc::now()).await.restamped, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = Harness::new(zone_a()).await;
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run(reconciler(&h), Duration::from_millis(10), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker did not stop")
            .unwrap()
            .unwrap();
    }
}
