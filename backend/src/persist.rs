// Session persistence: an ordered list of storage tiers behind one gateway,
// and a debounced writer task in front of it.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use draw_core::{RecordError, SessionRecord};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SESSION_KEY: &str = "current";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// One failed tier, as reported by [`PersistError::StorageExhausted`].
#[derive(Debug)]
pub struct TierFailure {
    pub tier: String,
    pub error: StorageError,
}

impl fmt::Display for TierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tier, self.error)
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("every storage tier failed ({})", join_failures(.0))]
    StorageExhausted(Vec<TierFailure>),
    #[error("stored session could not be read ({})", join_failures(.0))]
    Unreadable(Vec<TierFailure>),
    #[error("save queue is closed")]
    QueueClosed,
}

fn join_failures(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn write(&self, record: &SessionRecord) -> Result<(), StorageError>;
    async fn read(&self) -> Result<Option<SessionRecord>, StorageError>;
}

// ---------------------------------------------------------------------------
// SQLite tier
// ---------------------------------------------------------------------------

/// Primary tier: the record as one JSON value in a key/value table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Pass `":memory:"` for an ephemeral database.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;

             CREATE TABLE IF NOT EXISTS session_state (
                 key        TEXT PRIMARY KEY,
                 value      TEXT NOT NULL,
                 updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("sqlite connection poisoned".to_string()))
    }
}

#[async_trait]
impl StorageBackend for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn write(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let json = String::from_utf8_lossy(&record.to_json()?).into_owned();
        self.conn()?.execute(
            "INSERT OR REPLACE INTO session_state (key, value, updated_at)
             VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
            params![SESSION_KEY, json],
        )?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<SessionRecord>, StorageError> {
        let json: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value FROM session_state WHERE key = ?1",
                params![SESSION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(SessionRecord::from_json(json.as_bytes())?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON file tier
// ---------------------------------------------------------------------------

/// Secondary tier: the record as a pretty-printed JSON file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StorageBackend for JsonFileStore {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn write(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let json = record.to_json()?;
        // Write beside the target and rename so a crash never leaves half a file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<SessionRecord>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(SessionRecord::from_json(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Tries each tier in order.
pub struct TieredStore {
    tiers: Vec<Box<dyn StorageBackend>>,
}

impl TieredStore {
    pub fn new(tiers: Vec<Box<dyn StorageBackend>>) -> Self {
        Self { tiers }
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Stops at the first tier that accepts the write.
    pub async fn save(&self, record: &SessionRecord) -> Result<(), PersistError> {
        let mut failures = Vec::new();
        for tier in &self.tiers {
            match tier.write(record).await {
                Ok(()) => {
                    if !failures.is_empty() {
                        warn!(tier = tier.name(), "session saved to fallback tier");
                    } else {
                        debug!(tier = tier.name(), "session saved");
                    }
                    return Ok(());
                }
                Err(error) => {
                    warn!(tier = tier.name(), "session write failed: {error}");
                    failures.push(TierFailure {
                        tier: tier.name().to_string(),
                        error,
                    });
                }
            }
        }
        error!("session could not be saved to any storage tier");
        Err(PersistError::StorageExhausted(failures))
    }

    /// Reads every tier and returns the newest record. Ties go to the earlier
    /// tier. Tiers that fail to read are skipped, but if no tier produced a
    /// record the failures are returned: something is stored that must not be
    /// replaced by a fresh session.
    pub async fn load(&self) -> Result<Option<SessionRecord>, PersistError> {
        let mut best: Option<(SessionRecord, &str)> = None;
        let mut failures = Vec::new();
        for tier in &self.tiers {
            match tier.read().await {
                Ok(Some(record)) => {
                    let newer = best
                        .as_ref()
                        .map_or(true, |(current, _)| record.saved_at > current.saved_at);
                    if newer {
                        best = Some((record, tier.name()));
                    }
                }
                Ok(None) => debug!(tier = tier.name(), "no stored session"),
                Err(error) => {
                    warn!(tier = tier.name(), "failed to read stored session: {error}");
                    failures.push(TierFailure {
                        tier: tier.name().to_string(),
                        error,
                    });
                }
            }
        }

        match best {
            Some((record, tier)) => {
                info!(tier, saved_at = record.saved_at, "stored session found");
                Ok(Some(record))
            }
            None if failures.is_empty() => Ok(None),
            None => {
                error!("a stored session exists but no tier could read it");
                Err(PersistError::Unreadable(failures))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Debounced writer
// ---------------------------------------------------------------------------

/// Outcome of the most recent write attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageStatus {
    #[default]
    Healthy,
    Exhausted(String),
}

enum SaveCommand {
    Save(SessionRecord),
    Flush(oneshot::Sender<Result<(), PersistError>>),
}

/// Front of the gateway for the engine. Rapid saves inside the debounce
/// window collapse into one write of the latest record.
#[derive(Clone)]
pub struct SaveQueue {
    tx: mpsc::UnboundedSender<SaveCommand>,
    status: watch::Receiver<StorageStatus>,
}

impl SaveQueue {
    pub fn spawn(store: Arc<TieredStore>, window: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(StorageStatus::Healthy);
        let handle = tokio::spawn(run_save_queue(store, window, rx, status_tx));
        (Self { tx, status }, handle)
    }

    /// Fire-and-forget from the caller's point of view.
    pub fn schedule(&self, record: SessionRecord) {
        if self.tx.send(SaveCommand::Save(record)).is_err() {
            warn!("save queue closed; session change not persisted");
        }
    }

    /// Writes the pending (or last failed) record now and waits for the outcome.
    pub async fn flush(&self) -> Result<(), PersistError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SaveCommand::Flush(reply_tx))
            .map_err(|_| PersistError::QueueClosed)?;
        reply_rx.await.map_err(|_| PersistError::QueueClosed)?
    }

    pub fn status(&self) -> StorageStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StorageStatus> {
        self.status.clone()
    }
}

async fn run_save_queue(
    store: Arc<TieredStore>,
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<SaveCommand>,
    status: watch::Sender<StorageStatus>,
) {
    // `pending` waits for the debounce window; `unsaved` is the last record no
    // tier accepted, retried on flush unless a newer save supersedes it.
    let mut pending: Option<SessionRecord> = None;
    let mut unsaved: Option<SessionRecord> = None;
    loop {
        let command = if pending.is_some() {
            tokio::select! {
                command = rx.recv() => command,
                _ = tokio::time::sleep(window) => {
                    if let Some(record) = pending.take() {
                        if write_and_report(&store, &record, &status).await.is_err() {
                            unsaved = Some(record);
                        }
                    }
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match command {
            Some(SaveCommand::Save(record)) => {
                pending = Some(record);
                unsaved = None;
            }
            Some(SaveCommand::Flush(reply)) => {
                let result = match pending.take().or_else(|| unsaved.take()) {
                    Some(record) => {
                        let result = write_and_report(&store, &record, &status).await;
                        if result.is_err() {
                            unsaved = Some(record);
                        }
                        result
                    }
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            None => {
                // Every sender is gone: land the last record before exiting.
                if let Some(record) = pending.take().or_else(|| unsaved.take()) {
                    write_and_report(&store, &record, &status).await.ok();
                }
                debug!("save queue stopped");
                break;
            }
        }
    }
}

async fn write_and_report(
    store: &TieredStore,
    record: &SessionRecord,
    status: &watch::Sender<StorageStatus>,
) -> Result<(), PersistError> {
    let result = store.save(record).await;
    let next = match &result {
        Ok(()) => StorageStatus::Healthy,
        Err(e) => StorageStatus::Exhausted(e.to_string()),
    };
    status.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
    result
}
