//! Per-identity durable record store.
//!
//! Each identity owns a small keyspace of records (`profile`, `conversation`).
//! The store treats a record as an opaque serialized blob tagged with a
//! schema version: callers read it, mutate it in memory, and write it back
//! whole. Bounded growth is the record's own business, not the store's.

use platewise_protocol::now_millis;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::db::{Db, StoreError};

/// A record kind persisted in the identity store.
pub trait Record: Serialize + DeserializeOwned + Send + 'static {
    /// Storage key within the identity's keyspace.
    const KEY: &'static str;
    /// Version written by this build. Older bodies go through [`Record::upgrade`].
    const SCHEMA_VERSION: u32;

    /// A fresh record for an identity seen for the first time.
    fn create() -> Self;

    /// Rewrite a body stored at `from_version` into the current shape.
    /// Fields missing after the upgrade fall back to serde defaults.
    fn upgrade(_from_version: u32, value: Value) -> Value {
        value
    }
}

/// Raw row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub schema_version: u32,
    pub body: String,
    pub updated_at: u64,
}

/// Record store scoped to one identity. Cheap to clone.
#[derive(Clone)]
pub struct IdentityStateStore {
    db: Db,
    identity: String,
}

impl IdentityStateStore {
    pub fn new(db: Db, identity: impl Into<String>) -> Self {
        Self {
            db,
            identity: identity.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn get(&self, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        let identity = self.identity.clone();
        let key = key.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT key, schema_version, body, updated_at FROM identity_records
                     WHERE identity = ?1 AND key = ?2",
                    params![identity, key],
                    |row| {
                        Ok(StoredRecord {
                            key: row.get(0)?,
                            schema_version: row.get(1)?,
                            body: row.get(2)?,
                            updated_at: row.get::<_, i64>(3)? as u64,
                        })
                    },
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await
    }

    pub async fn save(&self, key: &str, schema_version: u32, body: String) -> Result<(), StoreError> {
        let identity = self.identity.clone();
        let key = key.to_string();
        let now = now_millis() as i64;
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identity_records (identity, key, schema_version, body, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(identity, key) DO UPDATE SET
                       schema_version = excluded.schema_version,
                       body = excluded.body,
                       updated_at = excluded.updated_at",
                    params![identity, key, schema_version, body, now],
                )?;
                Ok::<_, StoreError>(())
            })
            .await
    }

    /// Remove a record. Returns whether anything was deleted.
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let identity = self.identity.clone();
        let key = key.to_string();
        self.db
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM identity_records WHERE identity = ?1 AND key = ?2",
                    params![identity, key],
                )?;
                Ok::<_, StoreError>(removed > 0)
            })
            .await
    }

    /// Keys starting with `prefix`, in key order, at most `limit` of them.
    pub async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let identity = self.identity.clone();
        let prefix = prefix.to_string();
        let limit = limit.min(i64::MAX as usize) as i64;
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key FROM identity_records
                     WHERE identity = ?1 AND substr(key, 1, length(?2)) = ?2
                     ORDER BY key LIMIT ?3",
                )?;
                let keys = stmt
                    .query_map(params![identity, prefix, limit], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok::<_, StoreError>(keys)
            })
            .await
    }

    /// Load and decode a typed record, upgrading older schema versions.
    pub async fn load<R: Record>(&self) -> Result<Option<R>, StoreError> {
        match self.get(R::KEY).await? {
            Some(stored) => decode::<R>(stored.schema_version, &stored.body).map(Some),
            None => Ok(None),
        }
    }

    pub async fn store<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;
        self.save(R::KEY, R::SCHEMA_VERSION, body).await
    }

    /// Load a record, creating and persisting a default one if absent.
    pub async fn load_or_create<R: Record>(&self) -> Result<R, StoreError> {
        if let Some(record) = self.load::<R>().await? {
            return Ok(record);
        }

        let record = R::create();
        self.store(&record).await?;
        debug!(
            component = "identity_store",
            event = "record.created",
            identity = %self.identity,
            key = R::KEY,
            "Created default record"
        );
        Ok(record)
    }
}

fn decode<R: Record>(schema_version: u32, body: &str) -> Result<R, StoreError> {
    if schema_version > R::SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            kind: R::KEY,
            found: schema_version,
            supported: R::SCHEMA_VERSION,
        });
    }

    let mut value: Value = serde_json::from_str(body)?;
    for version in schema_version..R::SCHEMA_VERSION {
        value = R::upgrade(version, value);
    }
    Ok(serde_json::from_value(value)?)
}
