//! SQLite persistence for identity embeddings.
//!
//! One row per identity. Re-enrolling overwrites the previous vector.

use chrono::{DateTime, Utc};
use rollcall_core::codec::{self, CodecError};
use rollcall_core::{IdentityEmbedding, IdentityId};
use rusqlite::OptionalExtension;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS faces (
    identity      TEXT PRIMARY KEY NOT NULL,
    dim           INTEGER NOT NULL,
    embedding     BLOB NOT NULL,
    model_version TEXT,
    enrolled_at   TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("cannot create data directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored embedding for {identity} is corrupt: {source}")]
    Corrupt { identity: IdentityId, source: CodecError },
    #[error("stored timestamp for {identity} is invalid: {value}")]
    BadTimestamp { identity: IdentityId, value: String },
}

/// Listing entry; the vector itself is never exposed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrolledFace {
    pub identity: IdentityId,
    pub dim: usize,
    pub model_version: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

struct FaceRow {
    identity: IdentityId,
    blob: Vec<u8>,
    model_version: Option<String>,
    enrolled_at: String,
}

impl FaceRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(FaceRow {
            identity: row.get(0)?,
            blob: row.get(1)?,
            model_version: row.get(2)?,
            enrolled_at: row.get(3)?,
        })
    }

    fn decode(self) -> Result<IdentityEmbedding, StoreError> {
        let mut embedding = codec::decode(&self.blob).map_err(|source| StoreError::Corrupt {
            identity: self.identity.clone(),
            source,
        })?;
        embedding.model_version = self.model_version;
        let enrolled_at = parse_timestamp(&self.identity, &self.enrolled_at)?;
        Ok(IdentityEmbedding {
            identity: self.identity,
            embedding,
            enrolled_at,
        })
    }
}

fn parse_timestamp(identity: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::BadTimestamp {
            identity: identity.to_string(),
            value: value.to_string(),
        })
}

pub struct FaceStore {
    connection: Connection,
}

impl FaceStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "face store opened");
        Self::init(connection).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(connection: Connection) -> Result<Self, StoreError> {
        connection
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(Self { connection })
    }

    /// Insert or overwrite the vector for `face.identity`.
    pub async fn upsert(&self, face: &IdentityEmbedding) -> Result<(), StoreError> {
        let identity = face.identity.clone();
        let dim = face.embedding.dim() as i64;
        let blob = codec::encode(&face.embedding);
        let model_version = face.embedding.model_version.clone();
        let enrolled_at = face.enrolled_at.to_rfc3339();
        let replaced = self
            .connection
            .call(move |conn| {
                let existed = conn
                    .query_row("SELECT 1 FROM faces WHERE identity = ?1", [&identity], |_| Ok(()))
                    .optional()?
                    .is_some();
                conn.execute(
                    "INSERT INTO faces (identity, dim, embedding, model_version, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(identity) DO UPDATE SET
                        dim = excluded.dim,
                        embedding = excluded.embedding,
                        model_version = excluded.model_version,
                        enrolled_at = excluded.enrolled_at",
                    rusqlite::params![identity, dim, blob, model_version, enrolled_at],
                )?;
                Ok(existed)
            })
            .await?;
        tracing::info!(identity = %face.identity, dim, replaced, "identity embedding stored");
        Ok(())
    }

    /// Load the stored vectors for the given identities. Identities with no
    /// row are skipped.
    pub async fn load(
        &self,
        identities: &[IdentityId],
    ) -> Result<Vec<IdentityEmbedding>, StoreError> {
        let identities = identities.to_vec();
        let rows = self
            .connection
            .call(move |conn| {
                let mut query = conn.prepare_cached(
                    "SELECT identity, embedding, model_version, enrolled_at
                     FROM faces WHERE identity = ?1",
                )?;
                let mut rows = Vec::with_capacity(identities.len());
                for identity in &identities {
                    if let Some(row) = query.query_row([identity], FaceRow::from_row).optional()? {
                        rows.push(row);
                    }
                }
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(FaceRow::decode).collect()
    }

    pub async fn list(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        let rows = self
            .connection
            .call(|conn| {
                let mut query = conn.prepare(
                    "SELECT identity, dim, model_version, enrolled_at FROM faces ORDER BY identity",
                )?;
                let rows = query
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|(identity, dim, model_version, enrolled_at)| {
                let enrolled_at = parse_timestamp(&identity, &enrolled_at)?;
                Ok(EnrolledFace {
                    identity,
                    dim: dim as usize,
                    model_version,
                    enrolled_at,
                })
            })
            .collect()
    }

    /// Delete an identity. Returns whether a row existed.
    pub async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let id = identity.to_string();
        let deleted = self
            .connection
            .call(move |conn| Ok(conn.execute("DELETE FROM faces WHERE identity = ?1", [&id])?))
            .await?;
        tracing::info!(identity, deleted, "identity removed");
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::Embedding;

    fn face(identity: &str, values: Vec<f32>) -> IdentityEmbedding {
        IdentityEmbedding {
            identity: identity.to_string(),
            embedding: Embedding::new(values).normalized().unwrap(),
            enrolled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_load_roster() {
        let store = FaceStore::open_in_memory().await.unwrap();
        store.upsert(&face("alice", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&face("bob", vec![0.0, 1.0])).await.unwrap();

        let loaded = store
            .load(&["bob".to_string(), "carol".to_string()])
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].identity, "bob");
        assert_eq!(loaded[0].embedding.values, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_reenroll_overwrites() {
        let store = FaceStore::open_in_memory().await.unwrap();
        store.upsert(&face("alice", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&face("alice", vec![0.6, 0.8])).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        let loaded = store.load(&["alice".to_string()]).await.unwrap();
        assert!((loaded[0].embedding.values[1] - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_model_version_survives() {
        let store = FaceStore::open_in_memory().await.unwrap();
        let mut f = face("alice", vec![1.0, 0.0]);
        f.embedding.model_version = Some("facenet-128".into());
        store.upsert(&f).await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].model_version.as_deref(), Some("facenet-128"));
        assert_eq!(listed[0].dim, 2);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = FaceStore::open_in_memory().await.unwrap();
        store.upsert(&face("alice", vec![1.0, 0.0])).await.unwrap();
        assert!(store.remove("alice").await.unwrap());
        assert!(!store.remove("alice").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }
}
