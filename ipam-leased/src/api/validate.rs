use shared::protocol::{SECRET_MAX_LEN, SECRET_MIN_LEN};
use shared::types::{zone_family_key, LeaseRequest};
use crate::engine::normalize_address;
use crate::error::{LeaseError, LeaseResult};
use crate::prefix_cache::PrefixCache;

/// Reject requests the engine should never see.
pub fn validate(req: &LeaseRequest, cache: &PrefixCache, max_retention_days: u32) -> LeaseResult<()> {
    check_secret("secret", &req.secret)?;
    if let Some(new_secret) = &req.new_secret {
        check_secret("new_secret", new_secret)?;
    }

    for (field, value) in [
        ("zone", &req.zone),
        ("service.service_name", &req.service.service_name),
        ("service.namespace_id", &req.service.namespace_id),
        ("service.cluster_id", &req.service.cluster_id),
    ] {
        if value.trim().is_empty() {
            return Err(invalid(format!("'{}' is required", field)));
        }
    }

    if req.service.retention_period_days > max_retention_days {
        return Err(invalid(format!(
            "retention period cannot be more than {} days",
            max_retention_days
        )));
    }

    let zones = cache.zones();
    if !zones.contains(&req.zone) {
        return Err(invalid(format!(
            "invalid zone '{}', must be one of: '{}'",
            req.zone,
            zones.join("', '")
        )));
    }

    if let Some(raw) = req.requested_address() {
        normalize_address(raw, req.ip_family)?;
    }

    if cache.get(&zone_family_key(&req.zone, req.ip_family)).is_empty() {
        return Err(invalid(format!(
            "no prefixes found for zone {} with IP family {}",
            req.zone, req.ip_family
        )));
    }

    Ok(())
}

fn check_secret(field: &str, secret: &str) -> LeaseResult<()> {
    let len = secret.chars().count();
    if !(SECRET_MIN_LEN..=SECRET_MAX_LEN).contains(&len) {
        return Err(invalid(format!(
            "'{}' must be between {} and {} characters",
            field, SECRET_MIN_LEN, SECRET_MAX_LEN
        )));
    }
    Ok(())
}

fn invalid(message: String) -> LeaseError {
    LeaseError::InvalidRequest(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::IpFamily;
    use crate::allocator::fake::FakeAllocator;
    use crate::engine::tests::request;

    async fn cache() -> PrefixCache {
        let allocator = FakeAllocator::new()
            .with_container("zoneA", 1, "10.0.0.0/24")
            .with_container("zoneB", 2, "fd00::/64");
        let cache = PrefixCache::new();
        cache.refresh(&allocator).await.unwrap();
        cache
    }

    fn rejected(result: LeaseResult<()>, needle: &str) -> bool {
        matches!(result, Err(LeaseError::InvalidRequest(message)) if message.contains(needle))
    }

    #[tokio::test]
    async fn test_accepts_valid_request() {
        let cache = cache().await;
        assert!(validate(&request("api", None), &cache, 30).is_ok());
        assert!(validate(&request("api", Some("10.0.0.9")), &cache, 30).is_ok());
    }

    #[tokio::test]
    async fn test_secret_bounds() {
        let cache = cache().await;

        let mut req = request("api", None);
        req.secret = "short".to_string();
        assert!(rejected(validate(&req, &cache, 30), "'secret'"));

        req.secret = "x".repeat(65);
        assert!(rejected(validate(&req, &cache, 30), "'secret'"));

        req.secret = "x".repeat(64);
        req.new_secret = Some("tiny".to_string());
        assert!(rejected(validate(&req, &cache, 30), "'new_secret'"));
    }

    #[tokio::test]
    async fn test_retention_limit() {
        let cache = cache().await;
        let mut req = request("api", None);
        req.service.retention_period_days = 31;
        assert!(rejected(validate(&req, &cache, 30), "retention"));

        req.service.retention_period_days = 5;
        assert!(rejected(validate(&req, &cache, 3), "retention"));
    }

    #[tokio::test]
    async fn test_unknown_zone() {
        let cache = cache().await;
        let mut req = request("api", None);
        req.zone = "zoneZ".to_string();
        assert!(rejected(validate(&req, &cache, 30), "must be one of: 'zoneA', 'zoneB'"));
    }

    #[tokio::test]
    async fn test_address_family_mismatch() {
        let cache = cache().await;
        assert!(rejected(validate(&request("api", Some("fd00::5")), &cache, 30), "ip family"));
        assert!(rejected(validate(&request("api", Some("10.0.0.300")), &cache, 30), "not a valid address"));
    }

    #[tokio::test]
    async fn test_address_must_be_single_host() {
        let cache = cache().await;
        assert!(rejected(validate(&request("api", Some("10.0.0.128/25")), &cache, 30), "single host"));
        assert!(validate(&request("api", Some("10.0.0.9/32")), &cache, 30).is_ok());
        assert!(validate(&request("api", Some("")), &cache, 30).is_ok());
    }

    #[tokio::test]
    async fn test_zone_without_family_space() {
        let cache = cache().await;
        let mut req = request("api", None);
        req.zone = "zoneB".to_string();
        assert!(rejected(validate(&req, &cache, 30), "no prefixes found"));

        req.ip_family = IpFamily::V6;
        assert!(validate(&req, &cache, 30).is_ok());
    }

    #[tokio::test]
    async fn test_missing_service_fields() {
        let cache = cache().await;
        let mut req = request("api", None);
        req.service.cluster_id = " ".to_string();
        assert!(rejected(validate(&req, &cache, 30), "service.cluster_id"));
    }
}
