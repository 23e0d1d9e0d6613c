//! Remote tabular store access for the Trackside status log.
//!
//! The backing store is a shared remote table service with no transactions
//! and no atomic counters; multiple client sessions write to it with no
//! coordination. This crate owns everything that touches it:
//!
//! - the [`TabularStore`] seam (HTTP gateway, plus an in-process
//!   [`memory::MemoryStore`] for demos and integration tests),
//! - the per-table read cache with explicit expiry and forced refresh,
//! - the append writer with its best-effort sequence counter,
//! - the advisory roster lock and the check-in queue operations.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use trackside_core::{
    columns, last_status_across_events, next_queue_number, now_utc, queue_state_of, status_of,
    CurrentStatus, EntityRef, LogEntry, LogEntryDraft, QueueSlot, RawRow, RosterEntry, StatusKey,
    TaskConfig, TracksideError,
};
use ulid::Ulid;

/// The logical tables the core reads and writes. Each caches
/// independently because each tolerates different staleness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogicalTable {
    Log,
    Roster,
    TaskConfig,
}

impl LogicalTable {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Roster => "roster",
            Self::TaskConfig => "task_config",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "log" => Some(Self::Log),
            "roster" => Some(Self::Roster),
            "task_config" => Some(Self::TaskConfig),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote store rate-limited the request")]
    RateLimited,
    #[error("remote store returned http status {status}")]
    Http { status: u16 },
    #[error("failed to decode remote payload: {0}")]
    Decode(String),
    #[error("failed to load table '{}' and no cached value exists", .table.as_str())]
    LoadFailed {
        table: LogicalTable,
        #[source]
        source: Box<StoreError>,
    },
    #[error("row '{row_id}' not found in table '{}'", .table.as_str())]
    RowNotFound {
        table: LogicalTable,
        row_id: String,
    },
    #[error(transparent)]
    Core(#[from] TracksideError),
}

impl StoreError {
    /// Whether a retry without any other change could plausibly succeed.
    /// Callers surface transient failures as retry-capable notices.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited => true,
            Self::Http { status } => *status == 408 || *status >= 500,
            Self::LoadFailed { source, .. } => source.is_transient(),
            Self::Decode(_) | Self::RowNotFound { .. } | Self::Core(_) => false,
        }
    }
}

/// The seam to the remote table service. Every call is a blocking network
/// round-trip that can fail or rate-limit; nothing behind it offers
/// transactions, so callers get exactly three primitives: read a whole
/// table, append one row, and overwrite one cell (the advisory lock
/// column is the only cell the core ever overwrites).
pub trait TabularStore {
    /// Fetches all rows of `table` in the store's append order.
    ///
    /// # Errors
    /// Returns a [`StoreError`] on transport, rate-limit, or decode
    /// failure.
    fn fetch_rows(&self, table: LogicalTable) -> Result<Vec<RawRow>, StoreError>;

    /// Appends one row to `table`.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the write did not happen; a failed
    /// append is never reported as success.
    fn append_row(&self, table: LogicalTable, row: &RawRow) -> Result<(), StoreError>;

    /// Overwrites a single cell of the row whose `row_id` column matches.
    ///
    /// # Errors
    /// Returns [`StoreError::RowNotFound`] for an unknown row, or a
    /// transport-level [`StoreError`].
    fn update_cell(
        &self,
        table: LogicalTable,
        row_id: &str,
        column: &str,
        value: &str,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// HTTP gateway

#[derive(Debug, Deserialize)]
struct TablePayload {
    rows: Vec<RawRow>,
}

/// Blocking HTTP client for the tabular gateway:
/// `GET  {base}/tables/{table}` returns `{"rows": [{column: text}]}`,
/// `POST {base}/tables/{table}/rows` appends,
/// `POST {base}/tables/{table}/rows/{row_id}/cells` overwrites one cell.
pub struct HttpStore {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    #[must_use]
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let mut req = self
            .agent
            .request(method, url)
            .set("accept", "application/json");
        if let Some(token) = &self.token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }
        req
    }
}

fn map_ureq_error(err: ureq::Error) -> StoreError {
    match err {
        ureq::Error::Status(429, _) => StoreError::RateLimited,
        ureq::Error::Status(status, _) => StoreError::Http { status },
        ureq::Error::Transport(transport) => StoreError::Transport(transport.to_string()),
    }
}

impl TabularStore for HttpStore {
    fn fetch_rows(&self, table: LogicalTable) -> Result<Vec<RawRow>, StoreError> {
        let url = format!("{}/tables/{}", self.base_url, table.as_str());
        let response = self.request("GET", &url).call().map_err(map_ureq_error)?;
        let payload: TablePayload = response
            .into_json()
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        Ok(payload.rows)
    }

    fn append_row(&self, table: LogicalTable, row: &RawRow) -> Result<(), StoreError> {
        let url = format!("{}/tables/{}/rows", self.base_url, table.as_str());
        self.request("POST", &url)
            .send_json(row)
            .map_err(map_ureq_error)?;
        Ok(())
    }

    fn update_cell(
        &self,
        table: LogicalTable,
        row_id: &str,
        column: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}/tables/{}/rows/{row_id}/cells",
            self.base_url,
            table.as_str()
        );
        let outcome = self
            .request("POST", &url)
            .send_json(serde_json::json!({ "column": column, "value": value }));
        match outcome {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Err(StoreError::RowNotFound {
                table,
                row_id: row_id.to_string(),
            }),
            Err(err) => Err(map_ureq_error(err)),
        }
    }
}

pub mod memory {
    //! In-process [`TabularStore`] used by demos and integration tests,
    //! with switchable failure injection for the cache and writer paths.

    use super::{LogicalTable, StoreError, TabularStore};
    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use trackside_core::{columns, RawRow};

    #[derive(Debug, Default)]
    struct Inner {
        tables: HashMap<LogicalTable, Vec<RawRow>>,
        fail_reads: bool,
        fail_appends: bool,
    }

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    impl MemoryStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn seed(&self, table: LogicalTable, rows: Vec<RawRow>) {
            self.lock().tables.insert(table, rows);
        }

        /// Makes subsequent reads fail with a transport error.
        pub fn set_fail_reads(&self, fail: bool) {
            self.lock().fail_reads = fail;
        }

        /// Makes subsequent appends fail with a transport error.
        pub fn set_fail_appends(&self, fail: bool) {
            self.lock().fail_appends = fail;
        }

        #[must_use]
        pub fn rows(&self, table: LogicalTable) -> Vec<RawRow> {
            self.lock().tables.get(&table).cloned().unwrap_or_default()
        }
    }

    impl TabularStore for MemoryStore {
        fn fetch_rows(&self, table: LogicalTable) -> Result<Vec<RawRow>, StoreError> {
            let inner = self.lock();
            if inner.fail_reads {
                return Err(StoreError::Transport("injected read failure".to_string()));
            }
            Ok(inner.tables.get(&table).cloned().unwrap_or_default())
        }

        fn append_row(&self, table: LogicalTable, row: &RawRow) -> Result<(), StoreError> {
            let mut inner = self.lock();
            if inner.fail_appends {
                return Err(StoreError::Transport("injected append failure".to_string()));
            }
            inner.tables.entry(table).or_default().push(row.clone());
            Ok(())
        }

        fn update_cell(
            &self,
            table: LogicalTable,
            row_id: &str,
            column: &str,
            value: &str,
        ) -> Result<(), StoreError> {
            let mut inner = self.lock();
            if inner.fail_reads {
                return Err(StoreError::Transport("injected update failure".to_string()));
            }
            let rows = inner.tables.entry(table).or_default();
            for row in rows.iter_mut() {
                if row.get(columns::ROSTER_ROW_ID).map(String::as_str) == Some(row_id) {
                    row.insert(column.to_string(), value.to_string());
                    return Ok(());
                }
            }
            Err(StoreError::RowNotFound {
                table,
                row_id: row_id.to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Cache

/// Per-table staleness tolerance. The log turns over fastest; the roster
/// and the task vocabulary barely change during an event.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub log_ttl: Duration,
    pub roster_ttl: Duration,
    pub config_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            log_ttl: Duration::from_secs(90),
            roster_ttl: Duration::from_secs(300),
            config_ttl: Duration::from_secs(600),
        }
    }
}

impl CachePolicy {
    #[must_use]
    pub fn ttl_for(&self, table: LogicalTable) -> Duration {
        match table {
            LogicalTable::Log => self.log_ttl,
            LogicalTable::Roster => self.roster_ttl,
            LogicalTable::TaskConfig => self.config_ttl,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedTable {
    rows: Vec<RawRow>,
    fetched_at: Instant,
}

/// Outcome of an advisory lock operation. The lock is a plain column
/// value: any writer can overwrite it and two sessions can both believe
/// they hold it. Contention is a warning for the UI, never a failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOutcome {
    pub row_id: String,
    /// Who held the field before this operation, if anyone.
    pub holder_before: Option<String>,
    /// False when another session's token was present.
    pub uncontended: bool,
}

/// A `waiting -> queued` transition: the appended row's sequence and the
/// queue number it was assigned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueTicket {
    pub sequence: i64,
    pub queue_number: u32,
}

#[must_use]
pub fn new_session_token() -> String {
    Ulid::new().to_string()
}

/// The reading and writing front of the core: owns the per-table cache
/// and layers materialization, the append writer, the advisory lock, and
/// the queue sequencer over a [`TabularStore`].
pub struct LogClient<S: TabularStore> {
    store: S,
    policy: CachePolicy,
    cache: Mutex<HashMap<LogicalTable, CachedTable>>,
}

impl<S: TabularStore> LogClient<S> {
    #[must_use]
    pub fn new(store: S, policy: CachePolicy) -> Self {
        Self {
            store,
            policy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<LogicalTable, CachedTable>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads a table through the cache. Within the TTL the cached rows are
    /// served as-is; past it a remote fetch refreshes them. When the fetch
    /// fails and a last good value exists, that value is served stale —
    /// "no data" and "load failed" stay distinct states.
    ///
    /// # Errors
    /// Returns [`StoreError::LoadFailed`] when the remote fetch fails and
    /// nothing was ever cached.
    pub fn load_table(&self, table: LogicalTable) -> Result<Vec<RawRow>, StoreError> {
        {
            let cache = self.lock_cache();
            if let Some(cached) = cache.get(&table) {
                if cached.fetched_at.elapsed() <= self.policy.ttl_for(table) {
                    return Ok(cached.rows.clone());
                }
            }
        }

        match self.store.fetch_rows(table) {
            Ok(rows) => {
                self.lock_cache().insert(
                    table,
                    CachedTable {
                        rows: rows.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(rows)
            }
            Err(err) => {
                // Serve the last good value; an expired entry beats an error.
                if let Some(cached) = self.lock_cache().get(&table) {
                    return Ok(cached.rows.clone());
                }
                Err(StoreError::LoadFailed {
                    table,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Manual invalidation: refetches now and replaces the cached value on
    /// success. A failed refresh leaves the previous cache state intact.
    ///
    /// # Errors
    /// Returns the fetch failure unchanged.
    pub fn force_refresh(&self, table: LogicalTable) -> Result<Vec<RawRow>, StoreError> {
        let rows = self.store.fetch_rows(table)?;
        self.lock_cache().insert(
            table,
            CachedTable {
                rows: rows.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(rows)
    }

    fn invalidate(&self, table: LogicalTable) {
        self.lock_cache().remove(&table);
    }

    /// # Errors
    /// Propagates [`Self::load_table`] failures.
    pub fn load_log(&self) -> Result<Vec<LogEntry>, StoreError> {
        Ok(adapt_log(&self.load_table(LogicalTable::Log)?))
    }

    /// # Errors
    /// Propagates [`Self::load_table`] failures.
    pub fn load_roster(&self) -> Result<Vec<RosterEntry>, StoreError> {
        let rows = self.load_table(LogicalTable::Roster)?;
        Ok(rows
            .iter()
            .enumerate()
            .map(|(index, row)| RosterEntry::from_row(row, index + 1))
            .collect())
    }

    /// # Errors
    /// Propagates [`Self::load_table`] failures.
    pub fn load_task_config(&self) -> Result<TaskConfig, StoreError> {
        let rows = self.load_table(LogicalTable::TaskConfig)?;
        Ok(TaskConfig::from_rows(&rows))
    }

    /// # Errors
    /// Propagates [`Self::load_table`] failures.
    pub fn status_of(
        &self,
        entity: EntityRef<'_>,
        task: &str,
        event: &str,
    ) -> Result<CurrentStatus, StoreError> {
        Ok(status_of(&self.load_log()?, entity, task, event))
    }

    /// # Errors
    /// Propagates [`Self::load_table`] failures.
    pub fn last_status_across_events(
        &self,
        entity: EntityRef<'_>,
        task: &str,
        status_filter: &[StatusKey],
        exclude_event: &str,
        fallback_any_event: bool,
    ) -> Result<Option<CurrentStatus>, StoreError> {
        Ok(last_status_across_events(
            &self.load_log()?,
            entity,
            task,
            status_filter,
            exclude_event,
            fallback_any_event,
        ))
    }

    /// Appends one entry. The sequence is `fresh row count + 1`, read
    /// immediately before the write — the store has no atomic counter, so
    /// concurrent writers can race to the same number. Materialization
    /// orders by timestamp first precisely so that race stays mostly
    /// harmless; the sequence is only a tie-break.
    ///
    /// # Errors
    /// Returns validation errors from the draft and transport errors from
    /// the read or the write. A failed append is never reported as a
    /// sequence.
    pub fn append(&self, draft: &LogEntryDraft) -> Result<i64, StoreError> {
        draft.validate()?;
        let existing = self.store.fetch_rows(LogicalTable::Log)?;
        self.append_after(draft, &existing)
    }

    fn append_after(&self, draft: &LogEntryDraft, existing: &[RawRow]) -> Result<i64, StoreError> {
        let sequence = i64::try_from(existing.len()).unwrap_or(i64::MAX - 1) + 1;
        let recorded_at = draft.recorded_at.unwrap_or_else(now_utc);
        let row = draft.to_row(sequence, recorded_at)?;
        self.store.append_row(LogicalTable::Log, &row)?;
        self.invalidate(LogicalTable::Log);
        Ok(sequence)
    }

    /// Moves an entity `waiting -> queued` for `task`: assigns the next
    /// queue number over the freshly read log and appends the transition
    /// in the same breath.
    ///
    /// # Errors
    /// Same failure modes as [`Self::append`].
    pub fn queue_enter(&self, draft: &QueueDraft) -> Result<QueueTicket, StoreError> {
        let existing = self.store.fetch_rows(LogicalTable::Log)?;
        let queue_number = next_queue_number(&adapt_log(&existing), &draft.task);
        let sequence = self.append_after(
            &draft.to_log_draft("queued", Some(queue_number)),
            &existing,
        )?;
        Ok(QueueTicket {
            sequence,
            queue_number,
        })
    }

    /// Moves an entity `queued -> waiting`. The old number is abandoned; a
    /// later re-entry assigns a fresh one.
    ///
    /// # Errors
    /// Same failure modes as [`Self::append`].
    pub fn queue_remove(&self, draft: &QueueDraft) -> Result<i64, StoreError> {
        self.append(&draft.to_log_draft("pending", None))
    }

    /// Moves an entity `queued -> finished`.
    ///
    /// # Errors
    /// Same failure modes as [`Self::append`].
    pub fn queue_finish(&self, draft: &QueueDraft) -> Result<i64, StoreError> {
        self.append(&draft.to_log_draft("done", None))
    }

    /// # Errors
    /// Propagates [`Self::load_table`] failures.
    pub fn queue_state_of(&self, task: &str) -> Result<Vec<QueueSlot>, StoreError> {
        Ok(queue_state_of(&self.load_log()?, task))
    }

    /// Marks a roster row as being edited by `token`. Overwrites whatever
    /// was there — the outcome reports the previous holder so the UI can
    /// warn, but contention never fails.
    ///
    /// # Errors
    /// Returns [`StoreError::RowNotFound`] for an unknown roster row, or a
    /// transport failure.
    pub fn acquire_lock(&self, row_id: &str, token: &str) -> Result<LockOutcome, StoreError> {
        let holder_before = self.lock_holder(row_id)?;
        self.store
            .update_cell(LogicalTable::Roster, row_id, columns::ROSTER_LOCKED_BY, token)?;
        self.invalidate(LogicalTable::Roster);
        let uncontended = holder_before
            .as_deref()
            .map_or(true, |holder| holder == token);
        Ok(LockOutcome {
            row_id: row_id.to_string(),
            holder_before,
            uncontended,
        })
    }

    /// Clears the advisory lock field. A token mismatch is reported, not
    /// rejected — by the time anyone looks, the field may have been
    /// overwritten anyway.
    ///
    /// # Errors
    /// Returns [`StoreError::RowNotFound`] for an unknown roster row, or a
    /// transport failure.
    pub fn release_lock(&self, row_id: &str, token: &str) -> Result<LockOutcome, StoreError> {
        let holder_before = self.lock_holder(row_id)?;
        self.store
            .update_cell(LogicalTable::Roster, row_id, columns::ROSTER_LOCKED_BY, "")?;
        self.invalidate(LogicalTable::Roster);
        let uncontended = holder_before
            .as_deref()
            .map_or(true, |holder| holder == token);
        Ok(LockOutcome {
            row_id: row_id.to_string(),
            holder_before,
            uncontended,
        })
    }

    fn lock_holder(&self, row_id: &str) -> Result<Option<String>, StoreError> {
        let rows = self.store.fetch_rows(LogicalTable::Roster)?;
        let entry = rows
            .iter()
            .enumerate()
            .map(|(index, row)| RosterEntry::from_row(row, index + 1))
            .find(|entry| entry.row_id == row_id)
            .ok_or_else(|| StoreError::RowNotFound {
                table: LogicalTable::Roster,
                row_id: row_id.to_string(),
            })?;
        Ok(entry.locked_by)
    }
}

fn adapt_log(rows: &[RawRow]) -> Vec<LogEntry> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| LogEntry::from_row(row, index + 1))
        .collect()
}

/// Identity and attribution for one queue transition; the status label and
/// queue number are supplied by the transition methods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueDraft {
    pub task: String,
    pub event: String,
    pub athlete_id: Option<String>,
    pub athlete: String,
    pub actor: String,
    pub notes: String,
}

impl QueueDraft {
    fn to_log_draft(&self, status: &str, queue_number: Option<u32>) -> LogEntryDraft {
        LogEntryDraft {
            event: self.event.clone(),
            athlete_id: self.athlete_id.clone(),
            athlete: self.athlete.clone(),
            task: self.task.clone(),
            status: status.to_string(),
            actor: self.actor.clone(),
            recorded_at: None,
            queue_number,
            notes: self.notes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use trackside_core::QueuePhase;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn log_row(seq: &str, athlete: &str, task: &str, status: &str, recorded_at: &str) -> RawRow {
        let mut row = RawRow::new();
        row.insert(columns::SEQUENCE.to_string(), seq.to_string());
        row.insert(columns::EVENT.to_string(), "E1".to_string());
        row.insert(columns::ATHLETE.to_string(), athlete.to_string());
        row.insert(columns::TASK.to_string(), task.to_string());
        row.insert(columns::STATUS.to_string(), status.to_string());
        row.insert(columns::ACTOR.to_string(), "ops".to_string());
        row.insert(columns::RECORDED_AT.to_string(), recorded_at.to_string());
        row
    }

    fn roster_row(row_id: &str, name: &str, locked_by: &str) -> RawRow {
        let mut row = RawRow::new();
        row.insert(columns::ROSTER_ROW_ID.to_string(), row_id.to_string());
        row.insert(columns::ATHLETE.to_string(), name.to_string());
        row.insert(columns::EVENT.to_string(), "E1".to_string());
        row.insert(columns::ROSTER_LOCKED_BY.to_string(), locked_by.to_string());
        row
    }

    fn client_with(rows: Vec<RawRow>) -> LogClient<MemoryStore> {
        let store = MemoryStore::new();
        store.seed(LogicalTable::Log, rows);
        LogClient::new(store, CachePolicy::default())
    }

    fn doe() -> EntityRef<'static> {
        EntityRef {
            id: None,
            name: "John Doe",
        }
    }

    fn draft(status: &str) -> LogEntryDraft {
        LogEntryDraft {
            event: "E1".to_string(),
            athlete_id: None,
            athlete: "John Doe".to_string(),
            task: "Blood Test".to_string(),
            status: status.to_string(),
            actor: "ops".to_string(),
            recorded_at: None,
            queue_number: None,
            notes: String::new(),
        }
    }

    fn queue_draft(name: &str) -> QueueDraft {
        QueueDraft {
            task: "Check-In".to_string(),
            event: "E1".to_string(),
            athlete_id: None,
            athlete: name.to_string(),
            actor: "ops".to_string(),
            notes: String::new(),
        }
    }

    #[test]
    fn fresh_cache_serves_without_refetch() {
        let client = client_with(vec![log_row(
            "1",
            "John Doe",
            "Blood Test",
            "Requested",
            "01/01/2024 10:00",
        )]);
        let first = must_ok(client.status_of(doe(), "Blood Test", "E1"));
        assert_eq!(first.status, StatusKey::Requested);

        // A new row lands remotely; within the TTL the cache still answers.
        client.store.seed(
            LogicalTable::Log,
            vec![
                log_row("1", "John Doe", "Blood Test", "Requested", "01/01/2024 10:00"),
                log_row("2", "John Doe", "Blood Test", "Done", "01/01/2024 11:00"),
            ],
        );
        let cached = must_ok(client.status_of(doe(), "Blood Test", "E1"));
        assert_eq!(cached.status, StatusKey::Requested);

        must_ok(client.force_refresh(LogicalTable::Log));
        let refreshed = must_ok(client.status_of(doe(), "Blood Test", "E1"));
        assert_eq!(refreshed.status, StatusKey::Done);
    }

    #[test]
    fn expired_cache_serves_stale_on_remote_failure() {
        let store = MemoryStore::new();
        store.seed(
            LogicalTable::Log,
            vec![log_row("1", "John Doe", "Blood Test", "Done", "")],
        );
        let policy = CachePolicy {
            log_ttl: Duration::ZERO,
            ..CachePolicy::default()
        };
        let client = LogClient::new(store, policy);

        let first = must_ok(client.load_log());
        assert_eq!(first.len(), 1);

        client.store.set_fail_reads(true);
        let stale = must_ok(client.load_log());
        assert_eq!(stale.len(), 1);
    }

    #[test]
    fn load_failure_without_cache_is_fatal_and_transient() {
        let store = MemoryStore::new();
        store.set_fail_reads(true);
        let client = LogClient::new(store, CachePolicy::default());
        let err = match client.load_log() {
            Ok(_) => panic!("expected load failure"),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::LoadFailed { table: LogicalTable::Log, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn failed_refresh_keeps_previous_cache_state() {
        let client = client_with(vec![log_row("1", "John Doe", "Blood Test", "Done", "")]);
        must_ok(client.load_log());
        client.store.set_fail_reads(true);
        assert!(client.force_refresh(LogicalTable::Log).is_err());
        client.store.set_fail_reads(false);
        assert_eq!(must_ok(client.load_log()).len(), 1);
    }

    #[test]
    fn append_assigns_count_plus_one_from_fresh_read() {
        let client = client_with(vec![
            log_row("1", "Ana", "Blood Test", "Done", ""),
            log_row("2", "Bea", "Blood Test", "Done", ""),
        ]);
        // Warm the cache, then grow the table behind it; the writer must
        // count the fresh rows, not the cached ones.
        must_ok(client.load_log());
        let mut rows = client.store.rows(LogicalTable::Log);
        rows.push(log_row("3", "Caio", "Blood Test", "Done", ""));
        client.store.seed(LogicalTable::Log, rows);

        let sequence = must_ok(client.append(&draft("Requested")));
        assert_eq!(sequence, 4);
        assert_eq!(client.store.rows(LogicalTable::Log).len(), 4);

        // The append invalidated the log cache.
        let current = must_ok(client.status_of(doe(), "Blood Test", "E1"));
        assert_eq!(current.status, StatusKey::Requested);
    }

    #[test]
    fn failed_append_is_never_reported_as_success() {
        let client = client_with(Vec::new());
        client.store.set_fail_appends(true);
        let err = match client.append(&draft("Requested")) {
            Ok(_) => panic!("append must not succeed"),
            Err(err) => err,
        };
        assert!(err.is_transient());
        assert!(client.store.rows(LogicalTable::Log).is_empty());
    }

    #[test]
    fn invalid_draft_is_rejected_before_any_network_call() {
        let client = client_with(Vec::new());
        let mut bad = draft("Requested");
        bad.actor = String::new();
        assert!(matches!(
            client.append(&bad),
            Err(StoreError::Core(TracksideError::Validation(_)))
        ));
    }

    #[test]
    fn queue_flow_assigns_fresh_numbers_and_phases() {
        let client = client_with(Vec::new());

        let ana = must_ok(client.queue_enter(&queue_draft("Ana")));
        let bea = must_ok(client.queue_enter(&queue_draft("Bea")));
        assert_eq!(ana.queue_number, 1);
        assert_eq!(bea.queue_number, 2);

        must_ok(client.queue_remove(&queue_draft("Ana")));
        let requeued = must_ok(client.queue_enter(&queue_draft("Ana")));
        assert_eq!(requeued.queue_number, 3);

        must_ok(client.queue_finish(&queue_draft("Bea")));
        let slots = must_ok(client.queue_state_of("Check-In"));
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].athlete, "Ana");
        assert_eq!(slots[0].phase, QueuePhase::Queued);
        assert_eq!(slots[0].queue_number, Some(3));
        assert_eq!(slots[1].athlete, "Bea");
        assert_eq!(slots[1].phase, QueuePhase::Finished);
    }

    #[test]
    fn advisory_lock_reports_contention_without_failing() {
        let store = MemoryStore::new();
        store.seed(LogicalTable::Roster, vec![roster_row("7", "John Doe", "")]);
        let client = LogClient::new(store, CachePolicy::default());

        let session_a = new_session_token();
        let session_b = new_session_token();

        let first = must_ok(client.acquire_lock("7", &session_a));
        assert!(first.uncontended);
        assert!(first.holder_before.is_none());

        let second = must_ok(client.acquire_lock("7", &session_b));
        assert!(!second.uncontended);
        assert_eq!(must_some(second.holder_before), session_a);

        // Session B now holds the field even though A thinks it does.
        let release = must_ok(client.release_lock("7", &session_b));
        assert!(release.uncontended);
        let roster = must_ok(client.load_roster());
        assert!(roster[0].locked_by.is_none());
    }

    #[test]
    fn lock_on_unknown_row_is_row_not_found() {
        let store = MemoryStore::new();
        store.seed(LogicalTable::Roster, vec![roster_row("7", "John Doe", "")]);
        let client = LogClient::new(store, CachePolicy::default());
        assert!(matches!(
            client.acquire_lock("99", "tok"),
            Err(StoreError::RowNotFound { .. })
        ));
    }

    #[test]
    fn logical_table_round_trips_names() {
        for table in [LogicalTable::Log, LogicalTable::Roster, LogicalTable::TaskConfig] {
            assert_eq!(LogicalTable::parse(table.as_str()), Some(table));
        }
        assert_eq!(LogicalTable::parse("unknown"), None);
    }
}
