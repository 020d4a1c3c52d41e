//! Pure transformations of a record's service array. Every store write is
//! `current services -> new services` computed here, then applied with a
//! revision check.

use chrono::{DateTime, Duration, Utc};
use shared::types::{ServiceBinding, ServiceKey};
use crate::error::LeaseError;

/// Fresh registration: drop any binding with the same key, append the new
/// one. Registration always clears expiration.
pub fn upsert(current: &[ServiceBinding], mut binding: ServiceBinding) -> Vec<ServiceBinding> {
    binding.expires_at = None;
    let key = binding.key();

    let mut services: Vec<ServiceBinding> = current
        .iter()
        .filter(|s| !s.has_key(&key))
        .cloned()
        .collect();
    services.push(binding);
    services
}

/// Secret rotation collapses the record to the caller's single binding.
/// Only allowed when the caller already is the sole binding.
pub fn rotate(current: &[ServiceBinding], mut binding: ServiceBinding) -> Result<Vec<ServiceBinding>, LeaseError> {
    let key = binding.key();

    match current {
        [only] if only.has_key(&key) => {
            binding.expires_at = None;
            Ok(vec![binding])
        }
        [_] => Err(LeaseError::SecretChangeRejected(format!(
            "address is bound to a different service than {}",
            key
        ))),
        _ => Err(LeaseError::SecretChangeRejected(format!(
            "address has {} services bound, secret can only change with exactly one",
            current.len()
        ))),
    }
}

/// Schedule removal of `key`'s binding `retention_period_days` after `now`.
pub fn expire(
    current: &[ServiceBinding],
    key: &ServiceKey,
    now: DateTime<Utc>,
) -> Result<Vec<ServiceBinding>, LeaseError> {
    let mut binding = current
        .iter()
        .find(|s| s.has_key(key))
        .cloned()
        .ok_or_else(|| LeaseError::ServiceNotFound(key.to_string()))?;

    binding.expires_at = Some(now + Duration::days(i64::from(binding.retention_period_days)));

    let mut services: Vec<ServiceBinding> = current
        .iter()
        .filter(|s| !s.has_key(key))
        .cloned()
        .collect();
    services.push(binding);
    Ok(services)
}

/// Whether the cleanup sweep may drop this binding at `now`.
pub fn is_expired(binding: &ServiceBinding, now: DateTime<Utc>) -> bool {
    !binding.deny_external_cleanup && binding.expires_at.is_some_and(|at| at <= now)
}

/// Returns the surviving bindings and how many were removed.
pub fn without_expired(current: &[ServiceBinding], now: DateTime<Utc>) -> (Vec<ServiceBinding>, usize) {
    let kept: Vec<ServiceBinding> = current
        .iter()
        .filter(|s| !is_expired(s, now))
        .cloned()
        .collect();
    let removed = current.len() - kept.len();
    (kept, removed)
}
