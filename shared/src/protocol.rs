pub const ADDRESSES_PATH: &str = "/v1/addresses";
pub const ZONES_PATH: &str = "/v1/zones";
pub const HEALTH_PATH: &str = "/v1/health";

/// Accepted length of the caller's shared secret
pub const SECRET_MIN_LEN: usize = 8;
pub const SECRET_MAX_LEN: usize = 64;

/// Upper bound on a binding's retention period
pub const MAX_RETENTION_DAYS: u32 = 30;

/// Allocator custom field that carries the store record id
pub const CF_RECORD_ID: &str = "k8s_uuid";

/// Value written into mandatory allocator custom fields we do not use
pub const CF_PLACEHOLDER: &str = "na";
