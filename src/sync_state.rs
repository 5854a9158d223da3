//! Per-user sync cursors and polling state
//!
//! The store is the single source of truth for where a user's ingestion
//! resumes. The tracker keeps a cache of what it last wrote, and that cache
//! only moves after the store has accepted the write.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{PollingConfig, SyncConfig};
use crate::error::{Result, TriageError};
use crate::polling::{strategy_from_config, PollingStrategy};

/// Last fully processed message for a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub message_id: String,
    /// Gmail's internal date of that message
    pub message_date: DateTime<Utc>,
}

/// Stored state for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub user_id: String,
    /// Incremented on every write; 0 means never stored
    pub version: u64,
    pub last_synced_message_id: Option<String>,
    pub last_message_date: Option<DateTime<Utc>>,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Messages fetched per recent cycle, oldest first
    pub recent_counts: VecDeque<u64>,
    pub current_polling_interval_secs: u64,
    pub total_messages_synced: u64,
    pub last_cycle_id: Option<Uuid>,
}

impl SyncState {
    pub fn new(user_id: &str, initial_interval: Duration) -> Self {
        Self {
            user_id: user_id.to_string(),
            version: 0,
            last_synced_message_id: None,
            last_message_date: None,
            last_sync_timestamp: None,
            recent_counts: VecDeque::new(),
            current_polling_interval_secs: initial_interval.as_secs(),
            total_messages_synced: 0,
            last_cycle_id: None,
        }
    }

    pub fn current_polling_interval(&self) -> Duration {
        Duration::from_secs(self.current_polling_interval_secs)
    }

    pub fn cursor(&self) -> Option<SyncCursor> {
        match (&self.last_synced_message_id, self.last_message_date) {
            (Some(message_id), Some(message_date)) => Some(SyncCursor {
                message_id: message_id.clone(),
                message_date,
            }),
            _ => None,
        }
    }

    /// State after one more completed cycle
    ///
    /// A `None` cursor keeps the previous one (nothing new was processed).
    fn advanced(
        &self,
        messages_fetched: u64,
        cursor: Option<SyncCursor>,
        window_size: usize,
        strategy: &dyn PollingStrategy,
        cycle_id: Option<Uuid>,
    ) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;

        next.recent_counts.push_back(messages_fetched);
        while next.recent_counts.len() > window_size {
            next.recent_counts.pop_front();
        }

        let counts: Vec<u64> = next.recent_counts.iter().copied().collect();
        next.current_polling_interval_secs = strategy
            .next_interval(self.current_polling_interval(), &counts)
            .as_secs();

        if let Some(cursor) = cursor {
            next.last_synced_message_id = Some(cursor.message_id);
            next.last_message_date = Some(cursor.message_date);
        }
        next.last_sync_timestamp = Some(Utc::now());
        next.total_messages_synced += messages_fetched;
        next.last_cycle_id = cycle_id.or(self.last_cycle_id);
        next
    }
}

/// Key-value boundary for sync state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Stored state for `user_id`, or `None` if nothing was written yet
    ///
    /// # Errors
    /// `StatePersistence` when the stored document cannot be read back.
    async fn load(&self, user_id: &str) -> Result<Option<SyncState>>;

    /// Store `next` only if the stored version equals `expected_version`
    ///
    /// # Arguments
    /// * `user_id` - Owner of the state
    /// * `expected_version` - Version the caller read, 0 when nothing is stored yet
    /// * `next` - Replacement state, normally at `expected_version + 1`
    ///
    /// # Errors
    /// `StateConflict` when another writer got there first, or
    /// `StatePersistence` when the write itself fails.
    async fn compare_and_set(
        &self,
        user_id: &str,
        expected_version: u64,
        next: &SyncState,
    ) -> Result<()>;
}

/// In-process store, shared by cloning an `Arc`
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, SyncState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, user_id: &str) -> Result<Option<SyncState>> {
        Ok(self.states.lock().await.get(user_id).cloned())
    }

    async fn compare_and_set(
        &self,
        user_id: &str,
        expected_version: u64,
        next: &SyncState,
    ) -> Result<()> {
        let mut states = self.states.lock().await;
        let found = states.get(user_id).map_or(0, |s| s.version);
        if found != expected_version {
            return Err(TriageError::StateConflict {
                user_id: user_id.to_string(),
                expected: expected_version,
                found,
            });
        }
        states.insert(user_id.to_string(), next.clone());
        Ok(())
    }
}

/// One JSON document per user under a directory
///
/// Writes go to a temporary file that is then renamed over the old one, so
/// a crash leaves either the previous or the new state on disk.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for `user_id`; bytes outside `[A-Za-z0-9._@-]` are written as
    /// `%XX`, so distinct ids never share a file
    fn path_for(&self, user_id: &str) -> PathBuf {
        let mut file_name = String::with_capacity(user_id.len());
        for byte in user_id.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-' | b'_' | b'@') {
                file_name.push(char::from(byte));
            } else {
                file_name.push_str(&format!("%{:02X}", byte));
            }
        }
        self.dir.join(format!("{}.json", file_name))
    }

    async fn read(&self, user_id: &str) -> Result<Option<SyncState>> {
        let path = self.path_for(user_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, user_id: &str) -> Result<Option<SyncState>> {
        let state = self.read(user_id).await?;
        if let Some(state) = &state {
            if state.user_id != user_id {
                return Err(TriageError::StatePersistence {
                    user_id: user_id.to_string(),
                    message: format!(
                        "state file {:?} belongs to {}",
                        self.path_for(user_id),
                        state.user_id
                    ),
                });
            }
            debug!(
                "Loaded sync state for {}: version={}, cursor={:?}",
                user_id, state.version, state.last_synced_message_id
            );
        }
        Ok(state)
    }

    async fn compare_and_set(
        &self,
        user_id: &str,
        expected_version: u64,
        next: &SyncState,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let found = self.read(user_id).await?.map_or(0, |s| s.version);
        if found != expected_version {
            return Err(TriageError::StateConflict {
                user_id: user_id.to_string(),
                expected: expected_version,
                found,
            });
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(next)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        // flushed to disk before the rename makes it visible
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Saved sync state for {} to {:?}", user_id, path);
        Ok(())
    }
}

/// Tracks cursors and polling intervals for every user
pub struct SyncStateTracker {
    store: Arc<dyn StateStore>,
    strategy: Arc<dyn PollingStrategy>,
    window_size: usize,
    persist_max_elapsed: Duration,
    cache: RwLock<HashMap<String, SyncState>>,
}

impl SyncStateTracker {
    pub fn new(
        store: Arc<dyn StateStore>,
        strategy: Arc<dyn PollingStrategy>,
        window_size: usize,
    ) -> Self {
        Self {
            store,
            strategy,
            window_size: window_size.max(1),
            persist_max_elapsed: Duration::from_secs(60),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(store: Arc<dyn StateStore>, polling: &PollingConfig, sync: &SyncConfig) -> Self {
        let mut tracker = Self::new(store, strategy_from_config(polling), polling.window_size);
        tracker.persist_max_elapsed = Duration::from_secs(sync.persist_max_elapsed_secs);
        tracker
    }

    /// Durable state for a user, or a fresh one if nothing is stored
    ///
    /// Cached after the first load; the cache only ever holds states that
    /// were committed to the store.
    pub async fn state(&self, user_id: &str) -> Result<SyncState> {
        if let Some(state) = self.cache.read().await.get(user_id) {
            return Ok(state.clone());
        }

        let stored = self
            .store
            .load(user_id)
            .await
            .map_err(|e| persistence_error(user_id, e))?;

        let state = match stored {
            Some(state) => {
                info!(
                    "Resuming {} from cursor {:?} (version {})",
                    user_id, state.last_synced_message_id, state.version
                );
                state
            }
            None => {
                info!("No sync state for {}, starting fresh", user_id);
                SyncState::new(user_id, self.strategy.initial_interval())
            }
        };

        self.cache
            .write()
            .await
            .insert(user_id.to_string(), state.clone());
        Ok(state)
    }

    pub async fn cursor(&self, user_id: &str) -> Result<Option<SyncCursor>> {
        Ok(self.state(user_id).await?.cursor())
    }

    /// Interval to wait before the next cycle for `user_id`
    ///
    /// # Returns
    /// The interval chosen after the last recorded cycle, or the strategy's
    /// initial interval for a user with no history
    pub async fn get_next_poll_interval(&self, user_id: &str) -> Result<Duration> {
        Ok(self.state(user_id).await?.current_polling_interval())
    }

    /// Record a finished cycle and persist the new cursor
    ///
    /// # Arguments
    /// * `user_id` - User the cycle ran for
    /// * `messages_fetched` - New messages the cycle listed
    /// * `cursor` - Last handled message, or `None` to keep the current cursor
    ///
    /// # Returns
    /// The committed state, with the next polling interval already chosen
    ///
    /// # Errors
    /// `StateConflict` or `StatePersistence` from the store. On failure
    /// nothing in memory moves; the caller retries and the next attempt
    /// starts from the last durable state.
    pub async fn record_sync_result(
        &self,
        user_id: &str,
        messages_fetched: u64,
        cursor: Option<SyncCursor>,
    ) -> Result<SyncState> {
        self.record_cycle(user_id, messages_fetched, cursor, None).await
    }

    /// Like [`record_sync_result`](Self::record_sync_result), tagging the
    /// state with the id of the cycle that produced it
    pub async fn record_cycle(
        &self,
        user_id: &str,
        messages_fetched: u64,
        cursor: Option<SyncCursor>,
        cycle_id: Option<Uuid>,
    ) -> Result<SyncState> {
        let current = self.state(user_id).await?;
        let next = current.advanced(
            messages_fetched,
            cursor,
            self.window_size,
            self.strategy.as_ref(),
            cycle_id,
        );

        match self
            .store
            .compare_and_set(user_id, current.version, &next)
            .await
        {
            Ok(()) => {
                debug!(
                    "Recorded sync for {}: fetched={}, next interval={}s, version={}",
                    user_id, messages_fetched, next.current_polling_interval_secs, next.version
                );
                self.cache
                    .write()
                    .await
                    .insert(user_id.to_string(), next.clone());
                Ok(next)
            }
            Err(e @ TriageError::StateConflict { .. }) => {
                // someone else wrote; reload before the next attempt
                self.cache.write().await.remove(user_id);
                Err(e)
            }
            Err(e) => Err(persistence_error(user_id, e)),
        }
    }

    /// Record a cycle, retrying transient store failures with exponential backoff
    ///
    /// A conflict reloads the stored state before the next attempt. Errors
    /// that are not transient are returned at once.
    pub async fn record_sync_result_with_retry(
        &self,
        user_id: &str,
        messages_fetched: u64,
        cursor: Option<SyncCursor>,
        cycle_id: Option<Uuid>,
    ) -> Result<SyncState> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_interval(Duration::from_secs(10))
            .with_max_elapsed_time(Some(self.persist_max_elapsed))
            .build();

        let operation = || {
            let cursor = cursor.clone();
            async move {
                self.record_cycle(user_id, messages_fetched, cursor, cycle_id)
                    .await
                    .map_err(|e| {
                        if e.is_transient() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
            }
        };

        backoff::future::retry_notify(policy, operation, |e: TriageError, wait: Duration| {
            warn!(
                "Failed to record sync state for {}: {}. Retrying in {:?}",
                user_id, e, wait
            );
        })
        .await
    }

    pub fn strategy(&self) -> &dyn PollingStrategy {
        self.strategy.as_ref()
    }
}

fn persistence_error(user_id: &str, error: TriageError) -> TriageError {
    match error {
        e @ (TriageError::StatePersistence { .. } | TriageError::StateConflict { .. }) => e,
        other => TriageError::StatePersistence {
            user_id: user_id.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polling::VolumeBasedPolling;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn tracker(store: Arc<dyn StateStore>) -> SyncStateTracker {
        let config = PollingConfig::default();
        SyncStateTracker::new(
            store,
            Arc::new(VolumeBasedPolling::new(config.clone())),
            config.window_size,
        )
    }

    fn cursor(id: &str, minute: u32) -> Option<SyncCursor> {
        Some(SyncCursor {
            message_id: id.to_string(),
            message_date: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
        })
    }

    #[tokio::test]
    async fn test_fresh_user_gets_default_interval() {
        let tracker = tracker(Arc::new(MemoryStateStore::new()));
        assert_eq!(
            tracker.get_next_poll_interval("alice").await.unwrap(),
            Duration::from_secs(300)
        );
        assert!(tracker.cursor("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interval_shrinks_then_grows() {
        let tracker = tracker(Arc::new(MemoryStateStore::new()));

        tracker
            .record_sync_result("alice", 50, cursor("a", 1))
            .await
            .unwrap();
        let after_busy = tracker.get_next_poll_interval("alice").await.unwrap();
        assert_eq!(after_busy, Duration::from_secs(150));

        tracker
            .record_sync_result("alice", 5, cursor("b", 2))
            .await
            .unwrap();
        let after_quiet = tracker.get_next_poll_interval("alice").await.unwrap();
        assert!(after_quiet > after_busy);
    }

    #[tokio::test]
    async fn test_recent_counts_window_is_bounded() {
        let tracker = tracker(Arc::new(MemoryStateStore::new()));
        for n in 1..=5 {
            tracker.record_sync_result("bob", n, None).await.unwrap();
        }

        let state = tracker.state("bob").await.unwrap();
        assert_eq!(state.recent_counts, VecDeque::from(vec![3, 4, 5]));
        assert_eq!(state.total_messages_synced, 15);
        assert_eq!(state.version, 5);
    }

    #[tokio::test]
    async fn test_empty_cycle_keeps_cursor() {
        let tracker = tracker(Arc::new(MemoryStateStore::new()));
        tracker
            .record_sync_result("carol", 3, cursor("m3", 3))
            .await
            .unwrap();
        tracker.record_sync_result("carol", 0, None).await.unwrap();

        assert_eq!(tracker.cursor("carol").await.unwrap(), cursor("m3", 3));
    }

    #[tokio::test]
    async fn test_restart_resumes_from_store() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());

        let first = tracker(Arc::clone(&store));
        first
            .record_sync_result("dave", 10, cursor("m10", 10))
            .await
            .unwrap();
        drop(first);

        let second = tracker(store);
        assert_eq!(second.cursor("dave").await.unwrap(), cursor("m10", 10));
        assert_eq!(second.state("dave").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writer_causes_conflict() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let a = tracker(Arc::clone(&store));
        let b = tracker(Arc::clone(&store));

        a.state("erin").await.unwrap();
        b.record_sync_result("erin", 1, cursor("b1", 1)).await.unwrap();

        let err = a
            .record_sync_result("erin", 1, cursor("a1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TriageError::StateConflict { .. }));

        // the next attempt reloads and succeeds on top of the other write
        let state = a
            .record_sync_result("erin", 1, cursor("a1", 2))
            .await
            .unwrap();
        assert_eq!(state.version, 2);
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_conflict() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("state"));

        let mut state = SyncState::new("user@example.com", Duration::from_secs(300));
        state.version = 1;
        state.last_synced_message_id = Some("m1".to_string());
        store
            .compare_and_set("user@example.com", 0, &state)
            .await
            .unwrap();

        let loaded = store.load("user@example.com").await.unwrap().unwrap();
        assert_eq!(loaded, state);

        let err = store
            .compare_and_set("user@example.com", 0, &state)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TriageError::StateConflict { expected: 0, found: 1, .. }
        ));

        assert!(store.load("nobody").await.unwrap().is_none());
        assert!(!dir
            .path()
            .join("state")
            .join("user@example.com.json.tmp")
            .exists());
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_user_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        let state = SyncState::new("../escape", Duration::from_secs(300));
        store.compare_and_set("../escape", 0, &state).await.unwrap();

        assert!(dir.path().join("..%2Fescape.json").exists());
    }

    #[tokio::test]
    async fn test_file_store_keeps_similar_user_ids_apart() {
        let dir = TempDir::new().unwrap();

        let first = tracker(Arc::new(FileStateStore::new(dir.path())));
        first
            .record_sync_result(
                "alice+work@x.com",
                1,
                Some(SyncCursor {
                    message_id: "alice-msg".to_string(),
                    message_date: Utc::now(),
                }),
            )
            .await
            .unwrap();

        // fresh process, different user whose id differs only in '+' vs '_'
        let second = tracker(Arc::new(FileStateStore::new(dir.path())));
        let state = second.state("alice_work@x.com").await.unwrap();
        assert_eq!(state.user_id, "alice_work@x.com");
        assert_eq!(state.version, 0);
        assert!(state.cursor().is_none());

        assert!(dir.path().join("alice%2Bwork@x.com.json").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_state_of_another_user() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        let state = SyncState::new("bob@x.com", Duration::from_secs(300));
        let json = serde_json::to_string(&state).unwrap();
        tokio::fs::write(dir.path().join("carol@x.com.json"), json)
            .await
            .unwrap();

        let err = store.load("carol@x.com").await.unwrap_err();
        assert!(matches!(err, TriageError::StatePersistence { .. }));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_document_is_persistence_error() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("frank.json"), "{not json")
            .await
            .unwrap();

        let tracker = tracker(Arc::new(FileStateStore::new(dir.path())));
        let err = tracker.state("frank").await.unwrap_err();
        assert!(matches!(err, TriageError::StatePersistence { .. }));
    }
}
