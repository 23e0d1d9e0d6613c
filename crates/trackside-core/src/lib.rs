//! Core projection logic for the Trackside status log.
//!
//! The shared operations log is an append-only remote table with drifted
//! schemas: two timestamp columns, two identity schemes, free-text task and
//! status labels in mixed casing and two languages. This crate owns the
//! pure parts of making that log queryable:
//!
//! - identity and status-label normalization,
//! - timestamp resolution across the legacy column/format variants,
//! - materialization of "current status per (entity, task, event)",
//! - check-in queue numbering derived from the same log.
//!
//! Nothing here performs I/O; `trackside-store` feeds rows in and appends
//! rows out.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TracksideError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// A raw row as the remote tabular store hands it over: column name to
/// cell text, with absent cells simply missing from the map.
pub type RawRow = BTreeMap<String, String>;

pub mod columns {
    //! Column names of the shared log and roster tables.

    pub const SEQUENCE: &str = "seq";
    pub const EVENT: &str = "event";
    pub const ATHLETE_ID: &str = "athlete_id";
    pub const ATHLETE: &str = "athlete";
    pub const TASK: &str = "task";
    pub const STATUS: &str = "status";
    pub const ACTOR: &str = "actor";
    /// Newer producers write the instant here, RFC3339 or `d/m/y h:m:s`.
    pub const RECORDED_AT: &str = "recorded_at";
    /// Legacy producers wrote a local `d/m/y [h:m]` string here.
    pub const DATE: &str = "date";
    pub const QUEUE: &str = "queue";
    pub const NOTES: &str = "notes";

    pub const ROSTER_ROW_ID: &str = "row_id";
    pub const ROSTER_LOCKED_BY: &str = "locked_by";
}

// ---------------------------------------------------------------------------
// Identity normalizer

/// Canonicalizes a free-text identity field: lower-cased, trimmed,
/// internal whitespace collapsed, Latin diacritics stripped. Total and
/// idempotent; empty input stays `""`.
#[must_use]
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        for ch in word.chars().flat_map(char::to_lowercase) {
            out.push(fold_diacritic(ch));
        }
    }
    out
}

fn fold_diacritic(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

/// Canonical status vocabulary after synonym folding.
///
/// The log's producers never agreed on labels, so a closed set of known
/// synonyms folds into the five shared keys and everything else passes
/// through case-folded as [`StatusKey::Other`]. `Requested` is its own
/// key; folding it into pending-like buckets is a presentation decision.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "String", into = "String")]
pub enum StatusKey {
    Pending,
    Requested,
    Done,
    NotApplicable,
    Canceled,
    Other(String),
}

impl StatusKey {
    #[must_use]
    pub fn canonical(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Requested => "requested",
            Self::Done => "done",
            Self::NotApplicable => "not-applicable",
            Self::Canceled => "canceled",
            Self::Other(label) => label,
        }
    }

    /// Statuses treated as the absence of an explicit status.
    #[must_use]
    pub fn is_pending_equivalent(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl From<String> for StatusKey {
    fn from(value: String) -> Self {
        normalize_status(&value)
    }
}

impl From<StatusKey> for String {
    fn from(value: StatusKey) -> Self {
        value.canonical().to_string()
    }
}

/// Folds a raw status label into its canonical key.
///
/// Unknown labels are data, not errors: they pass through normalized so
/// that vocabulary introduced by other producers keeps working.
#[must_use]
pub fn normalize_status(label: &str) -> StatusKey {
    match normalize(label).as_str() {
        "" | "pending" | "not requested" | "not registered" | "nao solicitado"
        | "nao registrado" | "aguardando" => StatusKey::Pending,
        "requested" | "solicitado" => StatusKey::Requested,
        "done" | "completed" | "concluido" | "ok" => StatusKey::Done,
        "---" | "n/a" | "na" | "not applicable" | "nao se aplica" => StatusKey::NotApplicable,
        "canceled" | "cancelled" | "cancelado" => StatusKey::Canceled,
        "queued" | "in queue" | "na fila" => StatusKey::Other("queued".to_string()),
        other => StatusKey::Other(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Timestamp resolver

const DMY_HMS: &[BorrowedFormatItem<'static>] =
    format_description!("[day]/[month]/[year] [hour]:[minute]:[second]");
const DMY_HM: &[BorrowedFormatItem<'static>] =
    format_description!("[day]/[month]/[year] [hour]:[minute]");
const DMY: &[BorrowedFormatItem<'static>] = format_description!("[day]/[month]/[year]");
const YMD_HMS: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Timestamp columns in priority order, most recently introduced first.
const TIMESTAMP_COLUMNS: [&str; 2] = [columns::RECORDED_AT, columns::DATE];

/// Resolves a row's best-effort instant from whichever legacy column it
/// carries. Absent or unparsable values yield `None` — ordering then falls
/// back to the sequence number, never to an error.
#[must_use]
pub fn resolve_timestamp(row: &RawRow) -> Option<OffsetDateTime> {
    let raw = TIMESTAMP_COLUMNS
        .iter()
        .filter_map(|column| row.get(*column))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())?;
    parse_instant(raw)
}

/// Parses one raw timestamp string against the known formats in order.
/// Day-first formats come before the ISO fallbacks because the log's
/// oldest producers wrote `01/02/2024`-style local dates.
#[must_use]
pub fn parse_instant(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if let Ok(parsed) = PrimitiveDateTime::parse(raw, DMY_HMS) {
        return Some(parsed.assume_utc());
    }
    if let Ok(parsed) = PrimitiveDateTime::parse(raw, DMY_HM) {
        return Some(parsed.assume_utc());
    }
    if let Ok(parsed) = Date::parse(raw, DMY) {
        return Some(parsed.midnight().assume_utc());
    }
    if let Ok(parsed) = PrimitiveDateTime::parse(raw, YMD_HMS) {
        return Some(parsed.assume_utc());
    }
    OffsetDateTime::parse(raw, &Rfc3339)
        .ok()
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
}

/// Formats an instant as RFC3339 in UTC, the form new appends write.
///
/// # Errors
/// Returns [`TracksideError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TracksideError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| TracksideError::Validation(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

// ---------------------------------------------------------------------------
// Log entries

/// One immutable row of the shared log, normalized out of a [`RawRow`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// Writer-assigned sequence. Best effort: concurrent writers can race,
    /// so this is only the ordering tie-break, never the primary order.
    pub sequence: i64,
    pub event: String,
    pub athlete_id: Option<String>,
    pub athlete: String,
    pub task: String,
    pub status: String,
    pub status_key: StatusKey,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub recorded_at: Option<OffsetDateTime>,
    pub queue_number: Option<u32>,
    pub notes: String,
}

impl LogEntry {
    /// Adapts a raw store row. `position` is the 1-based row order as the
    /// store returned it and stands in for a missing or unparsable
    /// sequence cell, so insertion order still breaks ties.
    #[must_use]
    pub fn from_row(row: &RawRow, position: usize) -> Self {
        let sequence = cell(row, columns::SEQUENCE)
            .parse::<i64>()
            .ok()
            .unwrap_or_else(|| position_as_sequence(position));
        let status = cell(row, columns::STATUS);
        Self {
            sequence,
            event: cell(row, columns::EVENT),
            athlete_id: non_empty(cell(row, columns::ATHLETE_ID)),
            athlete: cell(row, columns::ATHLETE),
            task: cell(row, columns::TASK),
            status_key: normalize_status(&status),
            status,
            actor: cell(row, columns::ACTOR),
            recorded_at: resolve_timestamp(row),
            queue_number: cell(row, columns::QUEUE).parse::<u32>().ok(),
            notes: cell(row, columns::NOTES),
        }
    }
}

fn position_as_sequence(position: usize) -> i64 {
    i64::try_from(position).unwrap_or(i64::MAX)
}

fn cell(row: &RawRow, column: &str) -> String {
    row.get(column).map(|value| value.trim().to_string()).unwrap_or_default()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// A new row to append. The writer stamps `sequence` and `recorded_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntryDraft {
    pub event: String,
    pub athlete_id: Option<String>,
    pub athlete: String,
    pub task: String,
    pub status: String,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub recorded_at: Option<OffsetDateTime>,
    pub queue_number: Option<u32>,
    pub notes: String,
}

impl LogEntryDraft {
    /// Validates a draft before append.
    ///
    /// # Errors
    /// Returns [`TracksideError::Validation`] when a required field is
    /// missing. The event may be empty — `""` is the no-event group.
    pub fn validate(&self) -> Result<(), TracksideError> {
        if self.athlete.trim().is_empty() {
            return Err(TracksideError::Validation(
                "athlete name MUST be provided".to_string(),
            ));
        }
        if self.task.trim().is_empty() {
            return Err(TracksideError::Validation(
                "task MUST be provided".to_string(),
            ));
        }
        if self.status.trim().is_empty() {
            return Err(TracksideError::Validation(
                "status MUST be provided".to_string(),
            ));
        }
        if self.actor.trim().is_empty() {
            return Err(TracksideError::Validation(
                "actor MUST be provided for every write".to_string(),
            ));
        }
        Ok(())
    }

    /// Renders the draft as a store row under the current producer schema
    /// (instant in [`columns::RECORDED_AT`], RFC3339).
    ///
    /// # Errors
    /// Returns [`TracksideError::Validation`] when the draft is invalid or
    /// the instant cannot be formatted.
    pub fn to_row(
        &self,
        sequence: i64,
        recorded_at: OffsetDateTime,
    ) -> Result<RawRow, TracksideError> {
        self.validate()?;
        let mut row = RawRow::new();
        row.insert(columns::SEQUENCE.to_string(), sequence.to_string());
        row.insert(columns::EVENT.to_string(), self.event.trim().to_string());
        row.insert(
            columns::ATHLETE_ID.to_string(),
            self.athlete_id.clone().unwrap_or_default(),
        );
        row.insert(columns::ATHLETE.to_string(), self.athlete.trim().to_string());
        row.insert(columns::TASK.to_string(), self.task.trim().to_string());
        row.insert(columns::STATUS.to_string(), self.status.trim().to_string());
        row.insert(columns::ACTOR.to_string(), self.actor.trim().to_string());
        row.insert(
            columns::RECORDED_AT.to_string(),
            format_rfc3339(recorded_at)?,
        );
        row.insert(
            columns::QUEUE.to_string(),
            self.queue_number.map(|n| n.to_string()).unwrap_or_default(),
        );
        row.insert(columns::NOTES.to_string(), self.notes.clone());
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Roster and task config (read-only reference data)

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    pub row_id: String,
    pub athlete_id: Option<String>,
    pub name: String,
    pub event: String,
    /// Advisory only: any writer can overwrite this, and two sessions can
    /// both believe they hold it. UI guidance, never correctness.
    pub locked_by: Option<String>,
}

impl RosterEntry {
    #[must_use]
    pub fn from_row(row: &RawRow, position: usize) -> Self {
        let row_id = non_empty(cell(row, columns::ROSTER_ROW_ID))
            .unwrap_or_else(|| position.to_string());
        Self {
            row_id,
            athlete_id: non_empty(cell(row, columns::ATHLETE_ID)),
            name: cell(row, columns::ATHLETE),
            event: cell(row, columns::EVENT),
            locked_by: non_empty(cell(row, columns::ROSTER_LOCKED_BY)),
        }
    }
}

/// Display vocabulary. An empty config is tolerated everywhere in the
/// core; callers that cannot render without it decide how fatal that is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskConfig {
    pub tasks: Vec<String>,
    pub statuses: Vec<String>,
}

impl TaskConfig {
    #[must_use]
    pub fn from_rows(rows: &[RawRow]) -> Self {
        let mut config = Self::default();
        for row in rows {
            push_unique(&mut config.tasks, cell(row, columns::TASK));
            push_unique(&mut config.statuses, cell(row, columns::STATUS));
        }
        config
    }

    /// Falls back to the labels actually observed in the log when the
    /// config table is empty or stale.
    #[must_use]
    pub fn with_log_fallback(mut self, log: &[LogEntry]) -> Self {
        for entry in log {
            push_unique(&mut self.tasks, entry.task.clone());
            push_unique(&mut self.statuses, entry.status.clone());
        }
        self
    }
}

fn push_unique(values: &mut Vec<String>, value: String) {
    let value = value.trim().to_string();
    if value.is_empty() {
        return;
    }
    if !values.iter().any(|existing| normalize(existing) == normalize(&value)) {
        values.push(value);
    }
}

// ---------------------------------------------------------------------------
// Status materializer

/// Query-side identity. Rows that carry an identifier match by identifier;
/// rows without one match by normalized name (scoped to the event for the
/// event-scoped lookup).
#[derive(Debug, Clone, Copy)]
pub struct EntityRef<'a> {
    pub id: Option<&'a str>,
    pub name: &'a str,
}

impl EntityRef<'_> {
    fn matches(&self, entry: &LogEntry) -> bool {
        match (self.id, entry.athlete_id.as_deref()) {
            (Some(query_id), Some(row_id)) => query_id == row_id,
            _ => normalize(self.name) == normalize(&entry.athlete),
        }
    }
}

/// The materialized answer for one `(entity, task, event)` key. Derived on
/// every read; it has no lifecycle of its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentStatus {
    pub status: StatusKey,
    /// The label as its producer wrote it, for display.
    pub label: String,
    pub actor: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub recorded_at: Option<OffsetDateTime>,
    pub event: Option<String>,
    pub sequence: Option<i64>,
}

impl CurrentStatus {
    /// The answer for a key with no matching rows: canonically pending,
    /// nobody did anything yet.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: StatusKey::Pending,
            label: String::new(),
            actor: None,
            recorded_at: None,
            event: None,
            sequence: None,
        }
    }

    fn from_entry(entry: &LogEntry) -> Self {
        Self {
            status: entry.status_key.clone(),
            label: entry.status.clone(),
            actor: non_empty(entry.actor.clone()),
            recorded_at: entry.recorded_at,
            event: non_empty(entry.event.clone()),
            sequence: Some(entry.sequence),
        }
    }
}

/// Recency order used everywhere a "latest row wins" decision is made:
/// resolved instants first (rows without one sort below all rows with
/// one), sequence as the final tie-break. Total for distinct sequences,
/// which makes materialization independent of presentation order.
#[must_use]
pub fn cmp_recency(a: &LogEntry, b: &LogEntry) -> Ordering {
    match (a.recorded_at, b.recorded_at) {
        (Some(at), Some(bt)) => at.cmp(&bt).then(a.sequence.cmp(&b.sequence)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.sequence.cmp(&b.sequence),
    }
}

fn latest<'a, I>(entries: I) -> Option<&'a LogEntry>
where
    I: Iterator<Item = &'a LogEntry>,
{
    entries.max_by(|a, b| cmp_recency(a, b))
}

/// Materializes the current status of `task` for `entity` within `event`.
///
/// No matching rows is not an error: the answer is the canonical pending
/// status. Rows whose identity has no roster match still count here.
#[must_use]
pub fn status_of(log: &[LogEntry], entity: EntityRef<'_>, task: &str, event: &str) -> CurrentStatus {
    let task = normalize(task);
    let event = normalize(event);
    let winner = latest(log.iter().filter(|entry| {
        normalize(&entry.task) == task
            && normalize(&entry.event) == event
            && entity.matches(entry)
    }));
    winner.map_or_else(CurrentStatus::pending, CurrentStatus::from_entry)
}

/// Most recent entry for `entity`/`task` in any event *other* than
/// `exclude_event`, optionally falling back to any event at all. Used for
/// carry-over checks ("when was this athlete's last completed test, in a
/// previous event?").
#[must_use]
pub fn last_status_across_events(
    log: &[LogEntry],
    entity: EntityRef<'_>,
    task: &str,
    status_filter: &[StatusKey],
    exclude_event: &str,
    fallback_any_event: bool,
) -> Option<CurrentStatus> {
    let task = normalize(task);
    let exclude = normalize(exclude_event);
    let matching: Vec<&LogEntry> = log
        .iter()
        .filter(|entry| {
            normalize(&entry.task) == task
                && entity.matches(entry)
                && (status_filter.is_empty() || status_filter.contains(&entry.status_key))
        })
        .collect();

    let other_events = latest(
        matching
            .iter()
            .copied()
            .filter(|entry| normalize(&entry.event) != exclude),
    );
    match other_events {
        Some(entry) => Some(CurrentStatus::from_entry(entry)),
        None if fallback_any_event => {
            latest(matching.into_iter()).map(CurrentStatus::from_entry)
        }
        None => None,
    }
}

// ---------------------------------------------------------------------------
// Check-in queue sequencer

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueuePhase {
    Waiting,
    Queued,
    Finished,
}

impl QueuePhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Queued => "queued",
            Self::Finished => "finished",
        }
    }

    /// Maps a materialized status onto the check-in state machine:
    /// `queued` is in queue, `done` is through, everything else (pending,
    /// requested, a requeue reset, unknown labels) is waiting.
    #[must_use]
    pub fn from_status(status: &StatusKey) -> Self {
        match status {
            StatusKey::Done => Self::Finished,
            StatusKey::Other(label) if label == "queued" => Self::Queued,
            _ => Self::Waiting,
        }
    }
}

/// One entity's place in a task's check-in queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSlot {
    pub athlete_id: Option<String>,
    pub athlete: String,
    pub queue_number: Option<u32>,
    pub phase: QueuePhase,
}

/// The number the next `waiting -> queued` transition gets: one past the
/// highest number ever recorded for the task. The log being append-only
/// is what makes "ever recorded" the no-reuse rule — abandoned numbers
/// from requeued entities stay visible and are never handed out again.
#[must_use]
pub fn next_queue_number(log: &[LogEntry], task: &str) -> u32 {
    let task = normalize(task);
    log.iter()
        .filter(|entry| normalize(&entry.task) == task)
        .filter_map(|entry| entry.queue_number)
        .max()
        .unwrap_or(0)
        + 1
}

/// Derives the queue board for one task: current phase per entity plus the
/// number from its latest numbered row, ordered queued-first by number.
#[must_use]
pub fn queue_state_of(log: &[LogEntry], task: &str) -> Vec<QueueSlot> {
    let task = normalize(task);
    let mut by_entity: BTreeMap<String, Vec<&LogEntry>> = BTreeMap::new();
    for entry in log.iter().filter(|entry| normalize(&entry.task) == task) {
        let key = entry.athlete_id.as_ref().map_or_else(
            || format!("name:{}", normalize(&entry.athlete)),
            |id| format!("id:{id}"),
        );
        by_entity.entry(key).or_default().push(entry);
    }

    let mut slots: Vec<QueueSlot> = by_entity
        .values()
        .filter_map(|entries| {
            let current = latest(entries.iter().copied())?;
            let phase = QueuePhase::from_status(&current.status_key);
            let queue_number = match phase {
                // A reset back to waiting abandons the old number.
                QueuePhase::Waiting => None,
                _ => latest(
                    entries
                        .iter()
                        .copied()
                        .filter(|entry| entry.queue_number.is_some()),
                )
                .and_then(|entry| entry.queue_number),
            };
            Some(QueueSlot {
                athlete_id: current.athlete_id.clone(),
                athlete: current.athlete.clone(),
                queue_number,
                phase,
            })
        })
        .collect();

    slots.sort_by(|a, b| {
        phase_rank(a.phase)
            .cmp(&phase_rank(b.phase))
            .then(a.queue_number.unwrap_or(u32::MAX).cmp(&b.queue_number.unwrap_or(u32::MAX)))
            .then(a.athlete.cmp(&b.athlete))
    });
    slots
}

fn phase_rank(phase: QueuePhase) -> u8 {
    match phase {
        QueuePhase::Queued => 0,
        QueuePhase::Waiting => 1,
        QueuePhase::Finished => 2,
    }
}
