use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use super::{GroupRoster, HistoryEntry, HistoryStore, LotteryRepository, RosterProvider};
use crate::error::AppError;
use crate::lottery::LotteryInstance;
use crate::utils::now_millis;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS group_history (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        group_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_group_history_group ON group_history(group_id, seq);

    CREATE TABLE IF NOT EXISTS lotteries (
        id TEXT PRIMARY KEY,
        group_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_lotteries_group ON lotteries(group_id, created_at);

    CREATE TABLE IF NOT EXISTS group_rosters (
        group_id TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );
"#;

/// SQLite-backed store; rows carry the serialized model as JSON.
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|c| {
            c.execute_batch(
                r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA foreign_keys=ON;
                    "#,
            )
        });
        let pool = Pool::builder().max_size(8).build(manager)?;
        Self::from_pool(pool)
    }

    /// Single-connection in-memory database; every pooled connection would
    /// otherwise see its own empty database.
    pub fn open_in_memory() -> Result<Self, AppError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::from_pool(pool)
    }

    pub fn from_pool(pool: DbPool) -> Result<Self, AppError> {
        let store = Self { pool };
        store.connection()?.execute_batch(SCHEMA)?;
        tracing::debug!(target: "storage", "sqlite schema ready");
        Ok(store)
    }

    fn connection(&self) -> Result<DbConnection, AppError> {
        Ok(self.pool.get()?)
    }

    pub fn put_roster(&self, roster: &GroupRoster) -> Result<(), AppError> {
        let payload = serde_json::to_string(roster)?;
        self.connection()?.execute(
            "INSERT INTO group_rosters (group_id, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![roster.group_id, payload, now_millis() as i64],
        )?;
        Ok(())
    }
}

impl HistoryStore for SqliteStore {
    fn append_turn_history(&self, group_id: &str, entry: &HistoryEntry) -> Result<(), AppError> {
        let payload = serde_json::to_string(entry)?;
        self.connection()?.execute(
            "INSERT INTO group_history (id, group_id, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![entry.id, group_id, payload, entry.created_at as i64],
        )?;
        Ok(())
    }

    fn read_recent_history(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, AppError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM group_history WHERE group_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![group_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(serde_json::from_str::<HistoryEntry>(&row?)?);
        }
        entries.reverse();
        Ok(entries)
    }
}

impl LotteryRepository for SqliteStore {
    fn load_lotteries(&self, group_id: &str) -> Result<Vec<LotteryInstance>, AppError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM lotteries WHERE group_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![group_id], |row| row.get::<_, String>(0))?;

        let mut lotteries = Vec::new();
        for row in rows {
            lotteries.push(serde_json::from_str::<LotteryInstance>(&row?)?);
        }
        Ok(lotteries)
    }

    fn save_lottery_instance(&self, instance: &LotteryInstance) -> Result<(), AppError> {
        let payload = serde_json::to_string(instance)?;
        self.connection()?.execute(
            "INSERT INTO lotteries (id, group_id, payload, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![
                instance.id,
                instance.group_id,
                payload,
                instance.created_at as i64,
                now_millis() as i64
            ],
        )?;
        Ok(())
    }
}

impl RosterProvider for SqliteStore {
    fn get_roster(&self, group_id: &str) -> Result<GroupRoster, AppError> {
        let conn = self.connection()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM group_rosters WHERE group_id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(AppError::NotFound(format!("roster for group {}", group_id))),
        }
    }
}
