//! SQLite-backed identity store and verification log.
//!
//! Uniqueness of email, remote face id and correlation id is enforced by
//! the schema; constraint failures surface as `StoreError::Conflict`.

use crate::verification_log::{VerificationLog, VerificationRecord};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use facegate_core::{Embedding, FaceIdentity, IdentityId, IdentityStore, StoreError};
use rusqlite::types::Type;
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    email           TEXT NOT NULL UNIQUE COLLATE NOCASE,
    embedding       TEXT NOT NULL,
    remote_face_id  TEXT UNIQUE,
    correlation_id  TEXT UNIQUE,
    image_url       TEXT,
    image_key       TEXT,
    department      TEXT,
    position        TEXT,
    active          INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS verification_logs (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id     TEXT,
    provider        TEXT NOT NULL,
    authorized      INTEGER NOT NULL,
    confidence      REAL NOT NULL,
    emotion         TEXT,
    is_live         INTEGER NOT NULL,
    timestamp       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS verification_logs_identity
    ON verification_logs (identity_id, timestamp);
";

const COLUMNS: &str = "id, name, email, embedding, remote_face_id, correlation_id, image_url, image_key, \
                       department, position, active, created_at, updated_at";

pub struct SqliteIdentityStore {
    conn: Connection,
}

impl SqliteIdentityStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(path).await.map_err(backend)?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(backend)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.execute_batch("PRAGMA journal_mode = WAL;")?;
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(backend)?;
        Ok(Self { conn })
    }

    async fn find_one(&self, column: &'static str, value: String) -> Result<Option<FaceIdentity>, StoreError> {
        self.conn
            .call(move |c| {
                let sql = format!("SELECT {COLUMNS} FROM identities WHERE {column} = ?1");
                Ok(c.query_row(&sql, params![value], read_row).optional()?)
            })
            .await
            .map_err(map_error)
    }
}

fn backend(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn map_error(e: tokio_rusqlite::Error) -> StoreError {
    if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(failure, Some(message))) = &e {
        if failure.code == ErrorCode::ConstraintViolation {
            let field = ["email", "remote_face_id", "correlation_id"]
                .into_iter()
                .find(|f| message.contains(&format!("identities.{f}")))
                .unwrap_or("id");
            return StoreError::Conflict {
                field,
                value: message.clone(),
            };
        }
    }
    backend(e)
}

fn parse_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<FaceIdentity> {
    let embedding: String = row.get(3)?;
    let embedding: Embedding = serde_json::from_str(&embedding)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(FaceIdentity {
        id: IdentityId::from(row.get::<_, String>(0)?),
        name: row.get(1)?,
        email: row.get(2)?,
        embedding,
        remote_face_id: row.get(4)?,
        correlation_id: row.get(5)?,
        image_url: row.get(6)?,
        image_key: row.get(7)?,
        department: row.get(8)?,
        position: row.get(9)?,
        active: row.get(10)?,
        created_at: parse_time(11, row.get(11)?)?,
        updated_at: parse_time(12, row.get(12)?)?,
    })
}

fn read_log_row(row: &Row<'_>) -> rusqlite::Result<VerificationRecord> {
    Ok(VerificationRecord {
        identity_id: row.get::<_, Option<String>>(0)?.map(IdentityId::from),
        provider: row.get(1)?,
        authorized: row.get(2)?,
        confidence: row.get::<_, f64>(3)? as f32,
        emotion: row.get(4)?,
        is_live: row.get(5)?,
        timestamp: parse_time(6, row.get(6)?)?,
    })
}

fn embedding_json(embedding: &Embedding) -> Result<String, StoreError> {
    serde_json::to_string(embedding).map_err(|e| StoreError::Backend(e.to_string()))
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn find_by_id(&self, id: &IdentityId) -> Result<Option<FaceIdentity>, StoreError> {
        self.find_one("id", id.to_string()).await
    }

    async fn find_all(&self) -> Result<Vec<FaceIdentity>, StoreError> {
        self.conn
            .call(|c| {
                let mut stmt = c.prepare(&format!("SELECT {COLUMNS} FROM identities ORDER BY created_at, id"))?;
                let rows = stmt.query_map([], read_row)?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_error)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<FaceIdentity>, StoreError> {
        self.find_one("email", email.to_string()).await
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<FaceIdentity>, StoreError> {
        self.find_one("correlation_id", correlation_id.to_string()).await
    }

    async fn find_by_remote_face_id(&self, face_id: &str) -> Result<Option<FaceIdentity>, StoreError> {
        self.find_one("remote_face_id", face_id.to_string()).await
    }

    async fn save(&self, identity: &FaceIdentity) -> Result<(), StoreError> {
        let identity = identity.clone();
        let embedding = embedding_json(&identity.embedding)?;
        self.conn
            .call(move |c| {
                c.execute(
                    &format!(
                        "INSERT INTO identities ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                         ON CONFLICT(id) DO UPDATE SET
                            name = excluded.name, email = excluded.email, embedding = excluded.embedding,
                            remote_face_id = excluded.remote_face_id, correlation_id = excluded.correlation_id,
                            image_url = excluded.image_url, image_key = excluded.image_key,
                            department = excluded.department, position = excluded.position,
                            active = excluded.active, updated_at = excluded.updated_at"
                    ),
                    params![
                        identity.id.as_str(),
                        identity.name,
                        identity.email,
                        embedding,
                        identity.remote_face_id,
                        identity.correlation_id,
                        identity.image_url,
                        identity.image_key,
                        identity.department,
                        identity.position,
                        identity.active,
                        identity.created_at.to_rfc3339(),
                        identity.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_error)
    }

    async fn delete(&self, id: &IdentityId) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |c| Ok(c.execute("DELETE FROM identities WHERE id = ?1", params![id])? > 0))
            .await
            .map_err(map_error)
    }

    async fn update_embedding(&self, id: &IdentityId, embedding: &Embedding) -> Result<(), StoreError> {
        let key = id.to_string();
        let json = embedding_json(embedding)?;
        let changed = self
            .conn
            .call(move |c| {
                Ok(c.execute(
                    "UPDATE identities SET embedding = ?2, updated_at = ?3 WHERE id = ?1",
                    params![key, json, Utc::now().to_rfc3339()],
                )?)
            })
            .await
            .map_err(map_error)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn update_remote_face_id(&self, id: &IdentityId, face_id: Option<&str>) -> Result<(), StoreError> {
        let key = id.to_string();
        let face_id = face_id.map(str::to_string);
        let changed = self
            .conn
            .call(move |c| {
                Ok(c.execute(
                    "UPDATE identities SET remote_face_id = ?2, updated_at = ?3 WHERE id = ?1",
                    params![key, face_id, Utc::now().to_rfc3339()],
                )?)
            })
            .await
            .map_err(map_error)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.conn
            .call(|c| Ok(c.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get::<_, i64>(0))?))
            .await
            .map(|n| n.max(0) as usize)
            .map_err(map_error)
    }
}

#[async_trait]
impl VerificationLog for SqliteIdentityStore {
    async fn append(&self, record: &VerificationRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO verification_logs
                        (identity_id, provider, authorized, confidence, emotion, is_live, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.identity_id.as_ref().map(|id| id.to_string()),
                        record.provider,
                        record.authorized,
                        f64::from(record.confidence),
                        record.emotion,
                        record.is_live,
                        record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    async fn recent_for(&self, id: &IdentityId, limit: usize) -> Result<Vec<VerificationRecord>, StoreError> {
        let id = id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT identity_id, provider, authorized, confidence, emotion, is_live, timestamp
                     FROM verification_logs WHERE identity_id = ?1
                     ORDER BY timestamp DESC, seq DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![id, limit], read_log_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> FaceIdentity {
        let mut identity = FaceIdentity::new(
            IdentityId::from(id),
            id,
            format!("{id}@example.com"),
            Embedding::new(vec![0.6, 0.8], "test"),
        );
        identity.correlation_id = Some(id.to_string());
        identity
    }

    #[tokio::test]
    async fn test_roundtrip_and_lookups() {
        let store = SqliteIdentityStore::open_in_memory().await.unwrap();
        let mut alice = identity("alice");
        alice.remote_face_id = Some("face-1".into());
        alice.department = Some("ops".into());
        store.save(&alice).await.unwrap();
        store.save(&identity("bob")).await.unwrap();

        let loaded = store.find_by_id(&"alice".into()).await.unwrap().unwrap();
        assert_eq!(loaded.embedding.values, vec![0.6, 0.8]);
        assert_eq!(loaded.embedding.model_version.as_deref(), Some("test"));
        assert_eq!(loaded.department.as_deref(), Some("ops"));
        assert_eq!(loaded.created_at.timestamp(), alice.created_at.timestamp());

        assert!(store.exists_by_email("ALICE@example.com").await.unwrap());
        assert_eq!(
            store.find_by_remote_face_id("face-1").await.unwrap().unwrap().id.as_str(),
            "alice"
        );
        assert_eq!(
            store.find_by_correlation_id("bob").await.unwrap().unwrap().id.as_str(),
            "bob"
        );
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.find_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unique_constraints_map_to_conflict() {
        let store = SqliteIdentityStore::open_in_memory().await.unwrap();
        let mut alice = identity("alice");
        alice.remote_face_id = Some("face-1".into());
        store.save(&alice).await.unwrap();

        let mut clash = identity("bob");
        clash.email = "Alice@Example.com".into();
        assert!(matches!(
            store.save(&clash).await,
            Err(StoreError::Conflict { field: "email", .. })
        ));

        store.save(&identity("bob")).await.unwrap();
        assert!(matches!(
            store.update_remote_face_id(&"bob".into(), Some("face-1")).await,
            Err(StoreError::Conflict { field: "remote_face_id", .. })
        ));
    }

    #[tokio::test]
    async fn test_single_row_updates() {
        let store = SqliteIdentityStore::open_in_memory().await.unwrap();
        store.save(&identity("alice")).await.unwrap();

        store
            .update_embedding(&"alice".into(), &Embedding::new(vec![1.0, 0.0], "v2"))
            .await
            .unwrap();
        store.update_remote_face_id(&"alice".into(), Some("face-9")).await.unwrap();
        let row = store.find_by_id(&"alice".into()).await.unwrap().unwrap();
        assert_eq!(row.embedding.values, vec![1.0, 0.0]);
        assert_eq!(row.remote_face_id.as_deref(), Some("face-9"));

        store.update_remote_face_id(&"alice".into(), None).await.unwrap();
        assert!(store.find_by_id(&"alice".into()).await.unwrap().unwrap().remote_face_id.is_none());

        assert!(matches!(
            store.update_embedding(&"ghost".into(), &Embedding::new(vec![1.0], "v2")).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.delete(&"alice".into()).await.unwrap());
        assert!(!store.delete(&"alice".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db/faces.db");
        {
            let store = SqliteIdentityStore::open(&path).await.unwrap();
            store.save(&identity("alice")).await.unwrap();
        }
        let store = SqliteIdentityStore::open(&path).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    fn record(identity: Option<&str>, authorized: bool, at: DateTime<Utc>) -> VerificationRecord {
        VerificationRecord {
            identity_id: identity.map(IdentityId::from),
            provider: "local".into(),
            authorized,
            confidence: 0.9,
            emotion: Some("neutral".into()),
            is_live: true,
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_verification_log_newest_first_per_identity() {
        let store = SqliteIdentityStore::open_in_memory().await.unwrap();
        let t0 = Utc::now();
        store.append(&record(Some("alice"), true, t0)).await.unwrap();
        store
            .append(&record(Some("alice"), true, t0 + chrono::Duration::seconds(5)))
            .await
            .unwrap();
        store
            .append(&record(Some("bob"), true, t0 + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        store.append(&record(None, false, t0)).await.unwrap();

        let alice = store.recent_for(&"alice".into(), 10).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice[0].timestamp > alice[1].timestamp);
        assert_eq!(alice[0].timestamp.timestamp(), (t0 + chrono::Duration::seconds(5)).timestamp());
        assert_eq!(alice[0].emotion.as_deref(), Some("neutral"));
        assert!(alice.iter().all(|r| r.identity_id == Some(IdentityId::from("alice"))));

        assert_eq!(store.recent_for(&"alice".into(), 1).await.unwrap().len(), 1);
        assert!(store.recent_for(&"carol".into(), 10).await.unwrap().is_empty());
    }
}
