//! Room persistence: the store contract and its SQLite implementation.
//!
//! Rooms are stored whole as JSON payloads with indexed columns for the
//! fields queries filter on. Commits are transactional and guarded by a
//! version check so a write is all-or-nothing at this interface.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use contracts::{RoomRecord, SubmitResponse};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    /// The committed version no longer matches the caller's expectation.
    VersionConflict {
        room_id: String,
        expected: u64,
    },
    Poisoned,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Serde(err) => write!(f, "serde error: {err}"),
            Self::VersionConflict { room_id, expected } => {
                write!(f, "version conflict on {room_id}: expected {expected}")
            }
            Self::Poisoned => write!(f, "store mutex poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    SourceDocument,
    ConvertedDocument,
    ValidatorProgram,
}

impl ArtifactKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::SourceDocument => "source",
            Self::ConvertedDocument => "document",
            Self::ValidatorProgram => "validator",
        }
    }
}

/// Authoritative persistence for rooms, artifacts, and the accepted-action
/// journal.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError>;

    /// Inserts or replaces a room unconditionally (creation and conversion
    /// bookkeeping).
    async fn put_room(&self, room: &RoomRecord) -> Result<(), StoreError>;

    /// Atomic multi-field commit: writes the record only when the stored
    /// version still equals `expected_version`.
    async fn commit_room(
        &self,
        room: &RoomRecord,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    async fn list_rooms(&self, kind_filter: Option<&str>) -> Result<Vec<RoomRecord>, StoreError>;

    /// Content-addressed artifact publication. The returned reference is
    /// `{kind}:{salt}:{hash}`; republishing identical content yields the
    /// same reference.
    async fn publish_artifact(
        &self,
        kind: ArtifactKind,
        salt: &str,
        content: &str,
    ) -> Result<String, StoreError>;

    async fn fetch_artifact(&self, reference: &str) -> Result<Option<String>, StoreError>;

    /// Journals a completed submit. `client_seq` rows are unique per
    /// (room, player); replays are ignored.
    async fn record_action(
        &self,
        room_id: &str,
        player_id: &str,
        client_seq: Option<u64>,
        action_json: &str,
        response: &SubmitResponse,
    ) -> Result<(), StoreError>;

    /// Returns the journaled outcome for an idempotency key, if any.
    async fn find_action(
        &self,
        room_id: &str,
        player_id: &str,
        client_seq: u64,
    ) -> Result<Option<SubmitResponse>, StoreError>;

    /// Garbage-collects ended rooms whose last activity predates the cutoff.
    async fn delete_ended_before(&self, cutoff_ms: u64) -> Result<usize, StoreError>;
}

/// Stable content hash for artifact addressing; not cryptographic, and
/// deterministic across processes.
pub fn content_hash(text: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        hash = hash.rotate_left(7) ^ hash.rotate_right(31);
    }
    hash
}

#[derive(Debug)]
pub struct SqliteRoomStore {
    conn: Mutex<Connection>,
}

impl SqliteRoomStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn configure(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rooms (
                room_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                version INTEGER NOT NULL,
                phase TEXT NOT NULL,
                conversion_status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                reference TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id TEXT NOT NULL,
                player_id TEXT NOT NULL,
                client_seq INTEGER,
                action_json TEXT NOT NULL,
                response_json TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (room_id, player_id, client_seq)
            );

            CREATE INDEX IF NOT EXISTS idx_rooms_kind ON rooms(kind);
            CREATE INDEX IF NOT EXISTS idx_rooms_phase_updated ON rooms(phase, updated_at);
            CREATE INDEX IF NOT EXISTS idx_actions_room_version ON actions(room_id, version);
            ",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at)
             VALUES(1, 'initial_v1', 'v1')",
            [],
        )?;
        Ok(())
    }
}

fn write_room(conn: &Connection, room: &RoomRecord) -> Result<(), StoreError> {
    let payload_json = serde_json::to_string(room)?;
    conn.execute(
        "INSERT INTO rooms (
            room_id, kind, payload_json, version, phase, conversion_status,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(room_id) DO UPDATE SET
            kind = excluded.kind,
            payload_json = excluded.payload_json,
            version = excluded.version,
            phase = excluded.phase,
            conversion_status = excluded.conversion_status,
            updated_at = excluded.updated_at",
        params![
            room.room_id.as_str(),
            room.kind.as_str(),
            payload_json,
            i64::try_from(room.version).unwrap_or(i64::MAX),
            room.phase.to_string(),
            room.conversion_status.to_string(),
            i64::try_from(room.created_at).unwrap_or(i64::MAX),
            i64::try_from(room.updated_at).unwrap_or(i64::MAX),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl RoomStore for SqliteRoomStore {
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let conn = self.lock()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM rooms WHERE room_id = ?1",
                params![room_id],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str::<RoomRecord>(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        write_room(&conn, room)
    }

    async fn commit_room(
        &self,
        room: &RoomRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let stored: Option<i64> = tx
            .query_row(
                "SELECT version FROM rooms WHERE room_id = ?1",
                params![room.room_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let matches = match stored {
            Some(version) => version == i64::try_from(expected_version).unwrap_or(i64::MAX),
            None => expected_version == 0,
        };
        if !matches {
            return Err(StoreError::VersionConflict {
                room_id: room.room_id.clone(),
                expected: expected_version,
            });
        }
        write_room(&tx, room)?;
        tx.commit()?;
        Ok(())
    }

    async fn list_rooms(&self, kind_filter: Option<&str>) -> Result<Vec<RoomRecord>, StoreError> {
        let conn = self.lock()?;
        let mut rooms = Vec::new();
        match kind_filter {
            Some(kind) => {
                let mut stmt = conn.prepare(
                    "SELECT payload_json FROM rooms WHERE kind = ?1 ORDER BY created_at ASC",
                )?;
                let rows = stmt.query_map(params![kind], |row| row.get::<_, String>(0))?;
                for row in rows {
                    rooms.push(serde_json::from_str::<RoomRecord>(&row?)?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT payload_json FROM rooms ORDER BY created_at ASC")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                for row in rows {
                    rooms.push(serde_json::from_str::<RoomRecord>(&row?)?);
                }
            }
        }
        Ok(rooms)
    }

    async fn publish_artifact(
        &self,
        kind: ArtifactKind,
        salt: &str,
        content: &str,
    ) -> Result<String, StoreError> {
        let reference = format!("{}:{}:{:016x}", kind.as_str(), salt, content_hash(content));
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO artifacts (reference, kind, content, created_at)
             VALUES (?1, ?2, ?3, 0)",
            params![reference.as_str(), kind.as_str(), content],
        )?;
        Ok(reference)
    }

    async fn fetch_artifact(&self, reference: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let content: Option<String> = conn
            .query_row(
                "SELECT content FROM artifacts WHERE reference = ?1",
                params![reference],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }

    async fn record_action(
        &self,
        room_id: &str,
        player_id: &str,
        client_seq: Option<u64>,
        action_json: &str,
        response: &SubmitResponse,
    ) -> Result<(), StoreError> {
        let response_json = serde_json::to_string(response)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO actions (
                room_id, player_id, client_seq, action_json, response_json,
                version, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                room_id,
                player_id,
                client_seq.map(|seq| i64::try_from(seq).unwrap_or(i64::MAX)),
                action_json,
                response_json,
                i64::try_from(response.state_version.unwrap_or(0)).unwrap_or(i64::MAX),
                i64::try_from(response.timestamp).unwrap_or(i64::MAX),
            ],
        )?;
        Ok(())
    }

    async fn find_action(
        &self,
        room_id: &str,
        player_id: &str,
        client_seq: u64,
    ) -> Result<Option<SubmitResponse>, StoreError> {
        let conn = self.lock()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT response_json FROM actions
                 WHERE room_id = ?1 AND player_id = ?2 AND client_seq = ?3",
                params![
                    room_id,
                    player_id,
                    i64::try_from(client_seq).unwrap_or(i64::MAX)
                ],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str::<SubmitResponse>(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete_ended_before(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM rooms WHERE phase = 'ended' AND updated_at < ?1",
            params![i64::try_from(cutoff_ms).unwrap_or(i64::MAX)],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{ConversionStatus, RoomPhase};
    use serde_json::json;

    fn store() -> SqliteRoomStore {
        SqliteRoomStore::open_in_memory().expect("in-memory store opens")
    }

    fn room(room_id: &str) -> RoomRecord {
        let mut room = RoomRecord::new(room_id, "counter-turn-based", 10);
        room.state = json!({"counter": 0});
        room
    }

    #[tokio::test]
    async fn room_round_trips_through_the_store() {
        let store = store();
        let record = room("room_a");
        store.put_room(&record).await.expect("put");
        let loaded = store
            .get_room("room_a")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded, record);
        assert!(store.get_room("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn commit_enforces_the_expected_version() {
        let store = store();
        let mut record = room("room_b");
        store.put_room(&record).await.expect("put");

        record.version = 1;
        record.state = json!({"counter": 1});
        store.commit_room(&record, 0).await.expect("first commit");

        // A stale expectation must not overwrite.
        record.version = 2;
        let err = store.commit_room(&record, 0).await.expect_err("conflict");
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let loaded = store
            .get_room("room_b")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn list_rooms_filters_by_kind() {
        let store = store();
        store.put_room(&room("room_a")).await.expect("put");
        let mut other = room("room_c");
        other.kind = "canvas-realtime".to_string();
        store.put_room(&other).await.expect("put");

        let all = store.list_rooms(None).await.expect("list");
        assert_eq!(all.len(), 2);
        let filtered = store
            .list_rooms(Some("canvas-realtime"))
            .await
            .expect("list");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].room_id, "room_c");
    }

    #[tokio::test]
    async fn artifacts_are_content_addressed_and_stable() {
        let store = store();
        let first = store
            .publish_artifact(ArtifactKind::ConvertedDocument, "room_a", "<html></html>")
            .await
            .expect("publish");
        let second = store
            .publish_artifact(ArtifactKind::ConvertedDocument, "room_a", "<html></html>")
            .await
            .expect("publish");
        assert_eq!(first, second);
        assert!(first.starts_with("document:room_a:"));

        let different = store
            .publish_artifact(ArtifactKind::ConvertedDocument, "room_a", "<html>2</html>")
            .await
            .expect("publish");
        assert_ne!(first, different);

        let content = store
            .fetch_artifact(&first)
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(content, "<html></html>");
    }

    #[tokio::test]
    async fn action_journal_is_idempotent_per_client_seq() {
        let store = store();
        let response = SubmitResponse::rejected(
            contracts::ApiError::new(contracts::ErrorCode::NotYourTurn, "not your turn", None),
            99,
        );
        store
            .record_action("room_a", "p1", Some(7), "{}", &response)
            .await
            .expect("record");

        // A second outcome under the same key is ignored.
        let other = SubmitResponse::rejected(
            contracts::ApiError::new(contracts::ErrorCode::GameFull, "full", None),
            100,
        );
        store
            .record_action("room_a", "p1", Some(7), "{}", &other)
            .await
            .expect("record");

        let found = store
            .find_action("room_a", "p1", 7)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(
            found.error.expect("error").error_code,
            contracts::ErrorCode::NotYourTurn
        );
        assert!(store
            .find_action("room_a", "p1", 8)
            .await
            .expect("find")
            .is_none());
    }

    #[tokio::test]
    async fn ended_rooms_are_garbage_collected_by_cutoff() {
        let store = store();
        let mut ended = room("room_old");
        ended.phase = RoomPhase::Ended;
        ended.updated_at = 50;
        store.put_room(&ended).await.expect("put");

        let mut live = room("room_live");
        live.phase = RoomPhase::Active;
        live.conversion_status = ConversionStatus::Complete;
        live.updated_at = 50;
        store.put_room(&live).await.expect("put");

        let deleted = store.delete_ended_before(100).await.expect("gc");
        assert_eq!(deleted, 1);
        assert!(store.get_room("room_old").await.expect("get").is_none());
        assert!(store.get_room("room_live").await.expect("get").is_some());
    }

    #[test]
    fn content_hash_is_stable_and_discriminating() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }
}
