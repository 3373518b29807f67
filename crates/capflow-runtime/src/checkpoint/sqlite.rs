//! SQLite checkpoint store

use super::{Checkpoint, CheckpointError, CheckpointKey, CheckpointStore, Cursor};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    capture TEXT NOT NULL,
    stream TEXT NOT NULL,
    namespace TEXT NOT NULL DEFAULT '',
    backfill INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    cursor TEXT,
    records INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (capture, stream, namespace, backfill)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_capture ON checkpoints(capture);
"#;

/// Initialize the checkpoint schema
fn init_schema(conn: &Connection) -> Result<(), CheckpointError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Checkpoint store backed by a local SQLite database
pub struct SqliteCheckpointStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CheckpointError::store(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        // WAL with FULL sync: a persisted checkpoint survives a crash
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        init_schema(&conn)?;
        debug!(path = %path.display(), "Opened checkpoint database");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store
    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CheckpointError> {
        self.db
            .lock()
            .map_err(|e| CheckpointError::store(format!("Failed to acquire database lock: {}", e)))
    }
}

fn namespace_column(key: &CheckpointKey) -> &str {
    key.namespace.as_deref().unwrap_or("")
}

fn conversion_error(column: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

/// Decode `state, cursor, records, updated_at` starting at `offset`
fn read_checkpoint(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Checkpoint> {
    let state: String = row.get(offset)?;
    let state = serde_json::from_str(&state).map_err(|e| conversion_error(offset, e))?;

    let cursor = match row.get::<_, Option<String>>(offset + 1)? {
        Some(text) => Some(
            serde_json::from_str::<Cursor>(&text).map_err(|e| conversion_error(offset + 1, e))?,
        ),
        None => None,
    };

    let records: i64 = row.get(offset + 2)?;

    let updated_at: String = row.get(offset + 3)?;
    let updated_at = chrono::DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| conversion_error(offset + 3, e))?
        .with_timezone(&chrono::Utc);

    Ok(Checkpoint {
        state,
        cursor,
        records: records.max(0) as u64,
        updated_at,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointError> {
        let conn = self.conn()?;
        let checkpoint = conn
            .query_row(
                r#"
                SELECT state, cursor, records, updated_at
                FROM checkpoints
                WHERE capture = ?1 AND stream = ?2 AND namespace = ?3 AND backfill = ?4
                "#,
                params![key.capture, key.stream, namespace_column(key), key.backfill],
                |row| read_checkpoint(row, 0),
            )
            .optional()?;
        Ok(checkpoint)
    }

    async fn persist(
        &self,
        key: &CheckpointKey,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        let state = serde_json::to_string(&checkpoint.state)?;
        let cursor = checkpoint
            .cursor
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO checkpoints
                (capture, stream, namespace, backfill, state, cursor, records, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (capture, stream, namespace, backfill) DO UPDATE SET
                state = excluded.state,
                cursor = excluded.cursor,
                records = excluded.records,
                updated_at = excluded.updated_at
            "#,
            params![
                key.capture,
                key.stream,
                namespace_column(key),
                key.backfill,
                state,
                cursor,
                checkpoint.records as i64,
                checkpoint.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn clear(&self, key: &CheckpointKey) -> Result<bool, CheckpointError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM checkpoints
             WHERE capture = ?1 AND stream = ?2 AND namespace = ?3 AND backfill = ?4",
            params![key.capture, key.stream, namespace_column(key), key.backfill],
        )?;
        Ok(removed > 0)
    }

    async fn list(
        &self,
        capture: Option<&str>,
    ) -> Result<Vec<(CheckpointKey, Checkpoint)>, CheckpointError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT capture, stream, namespace, backfill, state, cursor, records, updated_at
            FROM checkpoints
            WHERE ?1 IS NULL OR capture = ?1
            ORDER BY capture, namespace, stream, backfill
            "#,
        )?;

        let rows = stmt.query_map(params![capture], |row| {
            let namespace: String = row.get(2)?;
            let key = CheckpointKey {
                capture: row.get(0)?,
                stream: row.get(1)?,
                namespace: if namespace.is_empty() { None } else { Some(namespace) },
                backfill: row.get(3)?,
            };
            Ok((key, read_checkpoint(row, 4)?))
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let key = CheckpointKey::new("acmeCo/source-airtable", "clients");
        let cp = Checkpoint::new(
            json!({"offset": "itrXyz", "pages": [1, 2]}),
            Some(Cursor::Text("2024-02-01T00:00:00Z".to_string())),
            120,
        );

        store.persist(&key, &cp).await.unwrap();
        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.state, cp.state);
        assert_eq!(loaded.cursor, cp.cursor);
        assert_eq!(loaded.records, 120);
        assert_eq!(loaded.updated_at.timestamp(), cp.updated_at.timestamp());
    }

    #[tokio::test]
    async fn test_upsert_replaces_previous() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let key = CheckpointKey::new("acmeCo/source-x", "orders");

        store
            .persist(&key, &Checkpoint::new(json!({"n": 1}), Some(Cursor::Int(1)), 1))
            .await
            .unwrap();
        store
            .persist(&key, &Checkpoint::new(json!({"n": 2}), Some(Cursor::Int(2)), 2))
            .await
            .unwrap();

        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.state, json!({"n": 2}));
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_namespaces_are_distinct_keys() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let plain = CheckpointKey::new("acmeCo/source-pg", "users");
        let scoped = plain.clone().with_namespace(Some("public".to_string()));

        store
            .persist(&plain, &Checkpoint::new(json!({"lsn": 1}), None, 0))
            .await
            .unwrap();
        store
            .persist(&scoped, &Checkpoint::new(json!({"lsn": 2}), None, 0))
            .await
            .unwrap();

        assert_eq!(store.load(&plain).await.unwrap().unwrap().state, json!({"lsn": 1}));
        assert_eq!(store.load(&scoped).await.unwrap().unwrap().state, json!({"lsn": 2}));

        let listed = store.list(Some("acmeCo/source-pg")).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|(k, _)| k.namespace.as_deref() == Some("public")));
        assert!(store.list(Some("acmeCo/other")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backfills_are_distinct_keys() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let first = CheckpointKey::new("acmeCo/source-x", "clients");
        let bumped = first.clone().with_backfill(1);

        store
            .persist(&first, &Checkpoint::new(json!({"page": 9}), Some(Cursor::Int(9)), 9))
            .await
            .unwrap();
        assert!(store.load(&bumped).await.unwrap().is_none());

        store
            .persist(&bumped, &Checkpoint::new(json!({"page": 1}), Some(Cursor::Int(1)), 1))
            .await
            .unwrap();
        let keys: Vec<CheckpointKey> =
            store.list(None).await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![first.clone(), bumped.clone()]);

        assert!(store.clear(&first).await.unwrap());
        assert_eq!(store.load(&bumped).await.unwrap().unwrap().state, json!({"page": 1}));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("checkpoints.db");
        let key = CheckpointKey::new("acmeCo/source-x", "clients");

        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store
                .persist(&key, &Checkpoint::new(json!({"page": 7}), Some(Cursor::Int(70)), 70))
                .await
                .unwrap();
        }

        let store = SqliteCheckpointStore::open(&path).unwrap();
        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.cursor, Some(Cursor::Int(70)));
        assert!(store.clear(&key).await.unwrap());
        assert!(store.load(&key).await.unwrap().is_none());
    }
}
