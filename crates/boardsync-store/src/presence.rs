use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use boardsync_core::{BoardId, PresenceEntry, PresenceError, PresenceStore, UserId};

use crate::database::Database;
use crate::error::StoreError;

/// Share of the presence timeout after which a user counts as nearing it.
const NEARING_TIMEOUT_FRACTION: f64 = 0.7;

/// Synchronous repository over the `presence` table.
#[derive(Clone)]
pub struct PresenceRepo {
    db: Database,
    presence_timeout: Duration,
}

impl PresenceRepo {
    pub fn new(db: Database, presence_timeout: Duration) -> Self {
        Self {
            db,
            presence_timeout,
        }
    }

    pub fn touch(
        &self,
        user_id: &UserId,
        board_id: &BoardId,
        activity: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        self.touch_at(user_id, board_id, activity, Utc::now().timestamp_millis())
    }

    #[instrument(skip(self, activity), fields(user_id = %user_id, board_id = %board_id))]
    pub fn touch_at(
        &self,
        user_id: &UserId,
        board_id: &BoardId,
        activity: Option<&serde_json::Value>,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let activity = activity.map(serde_json::to_string).transpose()?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO presence (user_id, board_id, last_seen_ms, current_activity)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (user_id, board_id)
                 DO UPDATE SET last_seen_ms = excluded.last_seen_ms,
                               current_activity = excluded.current_activity",
                rusqlite::params![user_id.as_str(), board_id.as_str(), now_ms, activity],
            )?;
            Ok(())
        })
    }

    /// Every presence row for the board, most recent first.
    #[instrument(skip(self), fields(board_id = %board_id))]
    pub fn board_presence(&self, board_id: &BoardId) -> Result<Vec<PresenceEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, last_seen_ms, current_activity FROM presence
                 WHERE board_id = ?1 ORDER BY last_seen_ms DESC, user_id",
            )?;
            let rows = stmt.query_map([board_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (user_id, last_seen, activity) = row?;
                let current_activity = activity
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?;
                entries.push(PresenceEntry {
                    user_id: UserId::from_raw(user_id),
                    board_id: board_id.clone(),
                    last_seen,
                    current_activity,
                });
            }
            Ok(entries)
        })
    }

    pub fn users_nearing_timeout(&self, board_id: &BoardId) -> Result<Vec<UserId>, StoreError> {
        self.users_nearing_timeout_at(board_id, Utc::now().timestamp_millis())
    }

    #[instrument(skip(self), fields(board_id = %board_id))]
    pub fn users_nearing_timeout_at(
        &self,
        board_id: &BoardId,
        now_ms: i64,
    ) -> Result<Vec<UserId>, StoreError> {
        let window = (self.presence_timeout.as_millis() as f64 * NEARING_TIMEOUT_FRACTION) as i64;
        let threshold = now_ms - window;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM presence
                 WHERE board_id = ?1 AND last_seen_ms < ?2 ORDER BY user_id",
            )?;
            let rows = stmt.query_map(rusqlite::params![board_id.as_str(), threshold], |row| {
                row.get::<_, String>(0)
            })?;
            let mut users = Vec::new();
            for row in rows {
                users.push(UserId::from_raw(row?));
            }
            Ok(users)
        })
    }

    #[instrument(skip(self), fields(user_id = %user_id, board_id = %board_id))]
    pub fn remove(&self, user_id: &UserId, board_id: &BoardId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM presence WHERE user_id = ?1 AND board_id = ?2",
                rusqlite::params![user_id.as_str(), board_id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// Delete rows not touched within `max_age`. Returns the number deleted.
    pub fn cleanup_stale(&self, max_age: Duration) -> Result<usize, StoreError> {
        self.cleanup_stale_at(max_age, Utc::now().timestamp_millis())
    }

    pub fn cleanup_stale_at(&self, max_age: Duration, now_ms: i64) -> Result<usize, StoreError> {
        let threshold = now_ms - max_age.as_millis() as i64;
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM presence WHERE last_seen_ms < ?1",
                [threshold],
            )?)
        })
    }
}

/// [`PresenceStore`] backed by SQLite. Queries run on the blocking pool so
/// the connection mutex never parks a runtime worker.
#[derive(Clone)]
pub struct SqlitePresenceStore {
    repo: PresenceRepo,
}

impl SqlitePresenceStore {
    pub fn new(db: Database, presence_timeout: Duration) -> Self {
        Self {
            repo: PresenceRepo::new(db, presence_timeout),
        }
    }

    pub fn repo(&self) -> &PresenceRepo {
        &self.repo
    }

    async fn run<T, F>(&self, f: F) -> Result<T, PresenceError>
    where
        T: Send + 'static,
        F: FnOnce(&PresenceRepo) -> Result<T, StoreError> + Send + 'static,
    {
        let repo = self.repo.clone();
        tokio::task::spawn_blocking(move || f(&repo))
            .await
            .map_err(|e| PresenceError::Unavailable(format!("presence task: {e}")))?
            .map_err(PresenceError::from)
    }

    /// Periodically delete rows older than `max_age` until `cancel` fires.
    pub fn spawn_cleanup(
        &self,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.run(move |repo| repo.cleanup_stale(max_age)).await {
                            Ok(0) => {}
                            Ok(removed) => debug!(removed, "cleaned up stale presence"),
                            Err(e) => warn!(error = %e, "presence cleanup failed"),
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl PresenceStore for SqlitePresenceStore {
    async fn touch(
        &self,
        user_id: &UserId,
        board_id: &BoardId,
        activity: Option<serde_json::Value>,
    ) -> Result<(), PresenceError> {
        let (user_id, board_id) = (user_id.clone(), board_id.clone());
        self.run(move |repo| repo.touch(&user_id, &board_id, activity.as_ref()))
            .await
    }

    async fn board_presence(&self, board_id: &BoardId) -> Result<Vec<PresenceEntry>, PresenceError> {
        let board_id = board_id.clone();
        self.run(move |repo| repo.board_presence(&board_id)).await
    }

    async fn users_nearing_timeout(&self, board_id: &BoardId) -> Result<Vec<UserId>, PresenceError> {
        let board_id = board_id.clone();
        self.run(move |repo| repo.users_nearing_timeout(&board_id)).await
    }

    async fn remove(&self, user_id: &UserId, board_id: &BoardId) -> Result<(), PresenceError> {
        let (user_id, board_id) = (user_id.clone(), board_id.clone());
        self.run(move |repo| repo.remove(&user_id, &board_id).map(|_| ()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn repo() -> PresenceRepo {
        PresenceRepo::new(Database::in_memory().unwrap(), TIMEOUT)
    }

    fn ids(user: &str, board: &str) -> (UserId, BoardId) {
        (UserId::from_raw(user), BoardId::from_raw(board))
    }

    #[test]
    fn touch_upserts_single_row() {
        let repo = repo();
        let (u, b) = ids("u1", "b1");
        repo.touch_at(&u, &b, None, 1_000).unwrap();
        repo.touch_at(&u, &b, Some(&json!({"typing": true})), 2_000).unwrap();

        let entries = repo.board_presence(&b).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].last_seen, 2_000);
        assert_eq!(entries[0].current_activity, Some(json!({"typing": true})));
    }

    #[test]
    fn board_presence_is_scoped_to_board() {
        let repo = repo();
        repo.touch_at(&UserId::from_raw("u1"), &BoardId::from_raw("b1"), None, 10).unwrap();
        repo.touch_at(&UserId::from_raw("u2"), &BoardId::from_raw("b2"), None, 10).unwrap();
        let entries = repo.board_presence(&BoardId::from_raw("b1")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id.as_str(), "u1");
    }

    #[test]
    fn nearing_timeout_uses_seventy_percent_window() {
        let repo = repo();
        let b = BoardId::from_raw("b1");
        let now = 100_000;
        // 21s threshold: 25s ago is nearing, 10s ago is fresh.
        repo.touch_at(&UserId::from_raw("old"), &b, None, now - 25_000).unwrap();
        repo.touch_at(&UserId::from_raw("fresh"), &b, None, now - 10_000).unwrap();

        let users = repo.users_nearing_timeout_at(&b, now).unwrap();
        assert_eq!(users, vec![UserId::from_raw("old")]);
    }

    #[test]
    fn remove_reports_whether_row_existed() {
        let repo = repo();
        let (u, b) = ids("u1", "b1");
        repo.touch_at(&u, &b, None, 1).unwrap();
        assert!(repo.remove(&u, &b).unwrap());
        assert!(!repo.remove(&u, &b).unwrap());
        assert!(repo.board_presence(&b).unwrap().is_empty());
    }

    #[test]
    fn cleanup_stale_deletes_old_rows_only() {
        let repo = repo();
        let b = BoardId::from_raw("b1");
        repo.touch_at(&UserId::from_raw("gone"), &b, None, 0).unwrap();
        repo.touch_at(&UserId::from_raw("here"), &b, None, 90_000).unwrap();
        let removed = repo
            .cleanup_stale_at(Duration::from_secs(60), 100_000)
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.board_presence(&b).unwrap()[0].user_id.as_str(), "here");
    }

    #[tokio::test]
    async fn async_store_round_trips_through_trait() {
        let store = SqlitePresenceStore::new(Database::in_memory().unwrap(), TIMEOUT);
        let (u, b) = ids("u1", "b1");
        store.touch(&u, &b, Some(json!("editing"))).await.unwrap();
        let entries = store.board_presence(&b).await.unwrap();
        assert_eq!(entries[0].current_activity, Some(json!("editing")));
        assert!(store.users_nearing_timeout(&b).await.unwrap().is_empty());
        store.remove(&u, &b).await.unwrap();
        assert!(store.board_presence(&b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_task_stops_on_cancel() {
        let store = SqlitePresenceStore::new(Database::in_memory().unwrap(), TIMEOUT);
        let cancel = CancellationToken::new();
        let handle = store.spawn_cleanup(Duration::from_millis(10), Duration::from_secs(60), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
