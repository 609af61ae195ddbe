//! SQLite record store.

use async_trait::async_trait;
use poster_sync_client::{RecordStore, StoreError};
use poster_sync_types::{Request, RequestId, RequestRecord, RequestState, Timestamp};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// SQLite-backed request store.
///
/// Uses WAL mode; every `put` is a single upsert statement.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options: SqliteConnectOptions = ":memory:".parse().map_err(db)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id BLOB PRIMARY KEY,
                label TEXT NOT NULL,
                state TEXT NOT NULL,
                submitted_at INTEGER NOT NULL,
                fulfilled_at INTEGER,
                synced INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_requests_state_synced ON requests(state, synced)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(())
    }

    async fn select(
        &self,
        filter: &str,
        state: Option<RequestState>,
    ) -> Result<Vec<Request>, StoreError> {
        let sql = format!(
            "SELECT id, label, state, submitted_at, fulfilled_at, synced FROM requests \
             {filter} ORDER BY submitted_at ASC, id ASC"
        );
        let mut query = sqlx::query_as::<_, RequestRow>(&sql);
        if let Some(state) = state {
            query = query.bind(state.as_str());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db)?;
        rows.into_iter().map(Request::try_from).collect()
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        let row = sqlx::query_as::<_, RequestRow>(
            r#"
            SELECT id, label, state, submitted_at, fulfilled_at, synced
            FROM requests
            WHERE id = ?1
            "#,
        )
        .bind(id.as_bytes())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        row.map(Request::try_from).transpose()
    }

    async fn put(&self, request: &Request) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO requests (id, label, state, submitted_at, fulfilled_at, synced)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                label = excluded.label,
                state = excluded.state,
                submitted_at = excluded.submitted_at,
                fulfilled_at = excluded.fulfilled_at,
                synced = excluded.synced
            "#,
        )
        .bind(request.id().as_bytes())
        .bind(request.label())
        .bind(request.state().as_str())
        .bind(request.submitted_at().as_millis() as i64)
        .bind(request.fulfilled_at().map(|t| t.as_millis() as i64))
        .bind(request.is_synced())
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(())
    }

    async fn all(&self) -> Result<Vec<Request>, StoreError> {
        self.select("", None).await
    }

    async fn all_with_state(&self, state: RequestState) -> Result<Vec<Request>, StoreError> {
        self.select("WHERE state = ?1", Some(state)).await
    }

    async fn all_unsynced(&self, state: RequestState) -> Result<Vec<Request>, StoreError> {
        self.select("WHERE state = ?1 AND synced = 0", Some(state))
            .await
    }

    async fn unsynced_count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE synced = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        Ok(count as usize)
    }
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Vec<u8>,
    label: String,
    state: String,
    submitted_at: i64,
    fulfilled_at: Option<i64>,
    synced: bool,
}

impl TryFrom<RequestRow> for Request {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: format!("{:02x?}", row.id),
            reason,
        };
        let id = RequestId::from_bytes(&row.id).ok_or_else(|| corrupt("invalid id".into()))?;
        let state = RequestState::parse(&row.state)
            .ok_or_else(|| corrupt(format!("unknown state {:?}", row.state)))?;
        let record = RequestRecord {
            id,
            label: row.label.clone(),
            state,
            submitted_at: Timestamp::from_millis(row.submitted_at as u64),
            fulfilled_at: row.fulfilled_at.map(|t| Timestamp::from_millis(t as u64)),
        };
        Request::from_record(record, row.synced).map_err(|e| corrupt(e.to_string()))
    }
}
