use std::path::Path;
use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use chrono::{DateTime, Utc};
use shared::types::{AddressRecord, IpFamily, ServiceBinding};
use crate::bindings;
use super::{AddressFilter, NewAddressRecord};

const COLUMNS: &str =
    "id, secret, zone, ip_family, address, pool_id, services, revision, stamped, created_at";

pub struct AddressDb {
    conn: Connection,
}

impl AddressDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        // One address may only be leased once per zone
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS addresses (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                secret     TEXT NOT NULL,
                zone       TEXT NOT NULL,
                ip_family  TEXT NOT NULL,
                address    TEXT NOT NULL,
                pool_id    INTEGER NOT NULL,
                services   TEXT NOT NULL,
                revision   INTEGER NOT NULL DEFAULT 0,
                stamped    INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_zone_address ON addresses(zone, address);
            CREATE INDEX IF NOT EXISTS idx_owner ON addresses(secret, zone, ip_family);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Insert a new record. Returns None if the address is already leased
    /// in that zone.
    pub fn insert(&self, record: &NewAddressRecord) -> Result<Option<AddressRecord>> {
        let services_json = serde_json::to_string(&record.services)
            .context("Failed to serialize services")?;

        let result = self.conn.execute(
            r#"
            INSERT INTO addresses (secret, zone, ip_family, address, pool_id, services, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                &record.secret,
                &record.zone,
                record.ip_family.as_str(),
                &record.address,
                record.pool_id,
                &services_json,
                Utc::now().to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to insert address"),
        }

        let id = self.conn.last_insert_rowid();
        self.find_one(&AddressFilter::by_id(id))
    }

    pub fn find_one(&self, filter: &AddressFilter) -> Result<Option<AddressRecord>> {
        let (clause, values) = where_clause(filter);
        let sql = format!("SELECT {} FROM addresses{} ORDER BY id LIMIT 1", COLUMNS, clause);

        let record = self
            .conn
            .query_row(&sql, params_from_iter(values.iter()), |row| Self::row_to_record(row))
            .optional()
            .context("Failed to query address")?;

        Ok(record)
    }

    pub fn find_many(&self, filter: &AddressFilter) -> Result<Vec<AddressRecord>> {
        let (clause, values) = where_clause(filter);
        let sql = format!("SELECT {} FROM addresses{} ORDER BY id", COLUMNS, clause);
        self.query(&sql, &values)
    }

    /// Compare-and-swap on the services array. Returns false if the record
    /// is gone or its revision moved.
    pub fn replace_services(
        &self,
        id: i64,
        expected_revision: i64,
        services: &[ServiceBinding],
    ) -> Result<bool> {
        let services_json = serde_json::to_string(services)
            .context("Failed to serialize services")?;

        let count = self.conn.execute(
            "UPDATE addresses SET services = ?1, revision = revision + 1
             WHERE id = ?2 AND revision = ?3",
            params![services_json, id, expected_revision],
        )
        .context("Failed to update services")?;

        Ok(count == 1)
    }

    pub fn replace_secret_and_services(
        &self,
        id: i64,
        expected_revision: i64,
        secret: &str,
        services: &[ServiceBinding],
    ) -> Result<bool> {
        let services_json = serde_json::to_string(services)
            .context("Failed to serialize services")?;

        let count = self.conn.execute(
            "UPDATE addresses SET secret = ?1, services = ?2, revision = revision + 1
             WHERE id = ?3 AND revision = ?4",
            params![secret, services_json, id, expected_revision],
        )
        .context("Failed to update secret and services")?;

        Ok(count == 1)
    }

    /// Remove every expired binding from every record in one transaction.
    pub fn pull_expired_services(&self, now: DateTime<Utc>) -> Result<u64> {
        let tx = self.conn.unchecked_transaction()
            .context("Failed to begin transaction")?;

        let candidates = {
            let mut stmt = tx
                .prepare("SELECT id, services FROM addresses WHERE services != '[]'")
                .context("Failed to prepare query")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
                .context("Failed to query services")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect services")?;
            rows
        };

        let mut removed_total = 0u64;
        for (id, services_json) in candidates {
            let services: Vec<ServiceBinding> = match serde_json::from_str(&services_json) {
                Ok(services) => services,
                Err(e) => {
                    tracing::warn!("Skipping address {} with corrupt services: {}", id, e);
                    continue;
                }
            };

            let (kept, removed) = bindings::without_expired(&services, now);
            if removed == 0 {
                continue;
            }

            let kept_json = serde_json::to_string(&kept)
                .context("Failed to serialize services")?;
            tx.execute(
                "UPDATE addresses SET services = ?1, revision = revision + 1 WHERE id = ?2",
                params![kept_json, id],
            )
            .context("Failed to pull expired services")?;

            removed_total += removed as u64;
        }

        tx.commit().context("Failed to commit expired services")?;
        Ok(removed_total)
    }

    pub fn find_orphans(&self) -> Result<Vec<AddressRecord>> {
        let sql = format!("SELECT {} FROM addresses WHERE services = '[]' ORDER BY id", COLUMNS);
        self.query(&sql, &[])
    }

    /// Delete an orphan, unless it gained a binding or changed since it
    /// was read at `expected_revision`.
    pub fn delete_orphan(&self, id: i64, expected_revision: i64) -> Result<bool> {
        let count = self.conn.execute(
            "DELETE FROM addresses WHERE id = ?1 AND revision = ?2 AND services = '[]'",
            params![id, expected_revision],
        )
        .context("Failed to delete address")?;
        Ok(count == 1)
    }

    pub fn find_unstamped(&self) -> Result<Vec<AddressRecord>> {
        let sql = format!("SELECT {} FROM addresses WHERE stamped = 0 ORDER BY id", COLUMNS);
        self.query(&sql, &[])
    }

    pub fn mark_stamped(&self, id: i64) -> Result<()> {
        self.conn.execute("UPDATE addresses SET stamped = 1 WHERE id = ?1", params![id])
            .context("Failed to mark address as stamped")?;
        Ok(())
    }

    fn query(&self, sql: &str, values: &[Value]) -> Result<Vec<AddressRecord>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare query")?;

        let records = stmt
            .query_map(params_from_iter(values.iter()), |row| Self::row_to_record(row))
            .context("Failed to query addresses")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect addresses")?;

        Ok(records)
    }

    /// Helper to convert a database row to AddressRecord
    fn row_to_record(row: &rusqlite::Row) -> Result<AddressRecord, rusqlite::Error> {
        let family_str: String = row.get(3)?;
        let services_json: String = row.get(6)?;
        let stamped_int: i32 = row.get(8)?;
        let created_at_str: String = row.get(9)?;

        let ip_family = match family_str.as_str() {
            "ipv4" => IpFamily::V4,
            "ipv6" => IpFamily::V6,
            other => {
                return Err(rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    format!("unknown ip family {}", other).into(),
                ))
            }
        };

        let services = serde_json::from_str(&services_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?;

        let created_at = DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?
            .with_timezone(&Utc);

        Ok(AddressRecord {
            id: row.get(0)?,
            secret: row.get(1)?,
            zone: row.get(2)?,
            ip_family,
            address: row.get(4)?,
            pool_id: row.get(5)?,
            services,
            revision: row.get(7)?,
            stamped: stamped_int != 0,
            created_at,
        })
    }
}

/// Builds " WHERE a = ?1 AND b = ?2" for the set fields of a filter.
fn where_clause(filter: &AddressFilter) -> (String, Vec<Value>) {
    let mut terms = Vec::new();
    let mut values = Vec::new();

    let mut push = |column: &str, value: Value| {
        values.push(value);
        terms.push(format!("{} = ?{}", column, values.len()));
    };

    if let Some(id) = filter.id {
        push("id", Value::Integer(id));
    }
    if let Some(secret) = &filter.secret {
        push("secret", Value::Text(secret.clone()));
    }
    if let Some(zone) = &filter.zone {
        push("zone", Value::Text(zone.clone()));
    }
    if let Some(family) = filter.ip_family {
        push("ip_family", Value::Text(family.as_str().to_string()));
    }
    if let Some(address) = &filter.address {
        push("address", Value::Text(address.clone()));
    }

    if terms.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", terms.join(" AND ")), values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn binding(name: &str) -> ServiceBinding {
        ServiceBinding {
            service_name: name.to_string(),
            namespace_id: "team1".to_string(),
            cluster_id: "c1".to_string(),
            retention_period_days: 7,
            expires_at: None,
            deny_external_cleanup: false,
        }
    }

    fn new_record(address: &str, services: Vec<ServiceBinding>) -> NewAddressRecord {
        NewAddressRecord {
            secret: "cipher".to_string(),
            zone: "zoneA".to_string(),
            ip_family: IpFamily::V4,
            address: address.to_string(),
            pool_id: 1001,
            services,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = AddressDb::open(":memory:").unwrap();

        let inserted = db.insert(&new_record("10.0.0.5/32", vec![binding("api")])).unwrap().unwrap();
        assert_eq!(inserted.revision, 0);
        assert!(!inserted.stamped);

        let found = db
            .find_one(&AddressFilter::owned("cipher", "zoneA", IpFamily::V4, "10.0.0.5/32"))
            .unwrap()
            .unwrap();
        assert_eq!(found, inserted);

        let wrong_secret = AddressFilter::owned("other", "zoneA", IpFamily::V4, "10.0.0.5/32");
        assert!(db.find_one(&wrong_secret).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let db = AddressDb::open(":memory:").unwrap();

        assert!(db.insert(&new_record("10.0.0.5/32", vec![binding("api")])).unwrap().is_some());
        assert!(db.insert(&new_record("10.0.0.5/32", vec![binding("web")])).unwrap().is_none());
        assert_eq!(db.find_many(&AddressFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_replace_services_checks_revision() {
        let db = AddressDb::open(":memory:").unwrap();
        let record = db.insert(&new_record("10.0.0.5/32", vec![binding("api")])).unwrap().unwrap();

        let services = vec![binding("api"), binding("web")];
        assert!(db.replace_services(record.id, record.revision, &services).unwrap());

        // Stale revision loses
        assert!(!db.replace_services(record.id, record.revision, &[binding("db")]).unwrap());

        let current = db.find_one(&AddressFilter::by_id(record.id)).unwrap().unwrap();
        assert_eq!(current.revision, 1);
        assert_eq!(current.services, services);
    }

    #[test]
    fn test_replace_secret() {
        let db = AddressDb::open(":memory:").unwrap();
        let record = db.insert(&new_record("10.0.0.5/32", vec![binding("api")])).unwrap().unwrap();

        assert!(db.replace_secret_and_services(record.id, 0, "rotated", &[binding("api")]).unwrap());

        let rotated = db.find_one(&AddressFilter::by_id(record.id)).unwrap().unwrap();
        assert_eq!(rotated.secret, "rotated");
        assert_eq!(rotated.revision, 1);
    }

    #[test]
    fn test_pull_expired_and_orphans() {
        let db = AddressDb::open(":memory:").unwrap();
        let now = Utc::now();

        let mut expired = binding("api");
        expired.expires_at = Some(now - Duration::seconds(1));
        let mut protected = binding("web");
        protected.expires_at = Some(now - Duration::seconds(1));
        protected.deny_external_cleanup = true;

        let lone = db.insert(&new_record("10.0.0.5/32", vec![expired.clone()])).unwrap().unwrap();
        let mixed = db.insert(&new_record("10.0.0.6/32", vec![expired, binding("db")])).unwrap().unwrap();
        let kept = db.insert(&new_record("10.0.0.7/32", vec![protected])).unwrap().unwrap();

        assert_eq!(db.pull_expired_services(now).unwrap(), 2);
        // Idempotent
        assert_eq!(db.pull_expired_services(now).unwrap(), 0);

        let orphans = db.find_orphans().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, lone.id);

        let mixed = db.find_one(&AddressFilter::by_id(mixed.id)).unwrap().unwrap();
        assert_eq!(mixed.services, vec![binding("db")]);
        assert_eq!(mixed.revision, 1);

        let kept = db.find_one(&AddressFilter::by_id(kept.id)).unwrap().unwrap();
        assert_eq!(kept.services.len(), 1);

        assert!(db.delete_orphan(lone.id, orphans[0].revision).unwrap());
        assert!(!db.delete_orphan(lone.id, orphans[0].revision).unwrap());
        assert!(db.find_orphans().unwrap().is_empty());
    }

    #[test]
    fn test_renewed_orphan_not_deleted() {
        let db = AddressDb::open(":memory:").unwrap();
        let record = db.insert(&new_record("10.0.0.5/32", vec![])).unwrap().unwrap();
        let orphan = &db.find_orphans().unwrap()[0];
        assert_eq!(orphan.revision, 0);

        assert!(db.replace_services(record.id, 0, &[binding("api")]).unwrap());

        // Stale revision, then current revision but no longer bindingless
        assert!(!db.delete_orphan(record.id, orphan.revision).unwrap());
        assert!(!db.delete_orphan(record.id, 1).unwrap());
        assert!(db.find_one(&AddressFilter::by_id(record.id)).unwrap().is_some());
    }

    #[test]
    fn test_corrupt_services_row_is_skipped() {
        let db = AddressDb::open(":memory:").unwrap();
        let now = Utc::now();

        let mut expired = binding("api");
        expired.expires_at = Some(now - Duration::seconds(1));
        let broken = db.insert(&new_record("10.0.0.5/32", vec![binding("web")])).unwrap().unwrap();
        let good = db.insert(&new_record("10.0.0.6/32", vec![expired])).unwrap().unwrap();

        db.conn
            .execute("UPDATE addresses SET services = 'not json' WHERE id = ?1", params![broken.id])
            .unwrap();

        assert_eq!(db.pull_expired_services(now).unwrap(), 1);

        let orphans = db.find_orphans().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, good.id);
    }

    #[test]
    fn test_stamping() {
        let db = AddressDb::open(":memory:").unwrap();
        let a = db.insert(&new_record("10.0.0.5/32", vec![binding("api")])).unwrap().unwrap();
        let b = db.insert(&new_record("10.0.0.6/32", vec![binding("api")])).unwrap().unwrap();

        db.mark_stamped(a.id).unwrap();

        let unstamped = db.find_unstamped().unwrap();
        assert_eq!(unstamped.len(), 1);
        assert_eq!(unstamped[0].id, b.id);
    }

    #[test]
    fn test_find_many_by_owner() {
        let db = AddressDb::open(":memory:").unwrap();
        db.insert(&new_record("10.0.0.5/32", vec![binding("api")])).unwrap();
        db.insert(&new_record("10.0.0.6/32", vec![binding("web")])).unwrap();

        let mut v6 = new_record("fd00::5/128", vec![binding("api")]);
        v6.ip_family = IpFamily::V6;
        db.insert(&v6).unwrap();

        let owned = db.find_many(&AddressFilter::owner("cipher", "zoneA", IpFamily::V4)).unwrap();
        assert_eq!(owned.len(), 2);
    }
}
