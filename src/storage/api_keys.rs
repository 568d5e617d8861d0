//! API key issuance, validation, and the authentication audit trail.
//!
//! Only the SHA-256 digest of a key is ever stored; the raw material is
//! returned exactly once at creation time.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use super::{from_ts, ts, WarehouseDb};

/// A stored key record. Never carries key material.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub request_count: i64,
}

/// Returned once from `create_api_key`; the raw key is not recoverable later.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedApiKey {
    pub id: String,
    pub name: String,
    pub key_material: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    pub key_id: Option<String>,
    pub endpoint: String,
    pub outcome: String,
    pub remote_ip: Option<String>,
    pub at: DateTime<Utc>,
}

pub fn digest(key_material: &str) -> String {
    hex::encode(Sha256::digest(key_material.as_bytes()))
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        active: row.get::<_, i64>(2)? != 0,
        created_at: from_ts(row.get(3)?),
        request_count: row.get(4)?,
    })
}

impl WarehouseDb {
    /// Issue a key. 32 random bytes, hex-encoded, with a recognisable prefix.
    pub fn create_api_key(&self, name: &str) -> Result<CreatedApiKey> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let key_material = format!("mdw_{}", hex::encode(raw));
        let id = Uuid::new_v4().to_string();

        self.conn().execute(
            "INSERT INTO api_keys (id, name, hash, active, created_at, request_count)
             VALUES (?1, ?2, ?3, 1, ?4, 0)",
            params![id, name, digest(&key_material), ts(Utc::now())],
        )?;

        info!(key_id = %id, name, "api key created");
        Ok(CreatedApiKey {
            id,
            name: name.to_string(),
            key_material,
        })
    }

    /// Look a key up by digest. A hit on an active key bumps its request
    /// counter and returns the key id.
    pub fn validate_api_key(&self, key_material: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM api_keys WHERE hash = ?1 AND active = 1",
                params![digest(key_material)],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(id) = &id {
            conn.execute(
                "UPDATE api_keys SET request_count = request_count + 1 WHERE id = ?1",
                params![id],
            )?;
        }
        Ok(id)
    }

    pub fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, active, created_at, request_count
             FROM api_keys ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], key_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn revoke_api_key(&self, id: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE api_keys SET active = 0 WHERE id = ?1",
            params![id],
        )?;
        if changed > 0 {
            info!(key_id = id, "api key revoked");
        }
        Ok(changed > 0)
    }

    /// Append one authentication attempt to the audit trail.
    pub fn audit_api_key_attempt(
        &self,
        key_id: Option<&str>,
        endpoint: &str,
        outcome: &str,
        remote_ip: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO api_key_audit (key_id, endpoint, outcome, remote_ip, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key_id, endpoint, outcome, remote_ip, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn list_api_key_audit(&self, limit: usize) -> Result<Vec<AuditRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key_id, endpoint, outcome, remote_ip, at
             FROM api_key_audit ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AuditRow {
                    key_id: row.get(0)?,
                    endpoint: row.get(1)?,
                    outcome: row.get(2)?,
                    remote_ip: row.get(3)?,
                    at: from_ts(row.get(4)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
