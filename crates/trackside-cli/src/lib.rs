//! Command surface for the Trackside status log.
//!
//! Every subcommand resolves through the same [`LogClient`] the screens
//! use: reads go through the table cache and the status materializer,
//! writes go through the append writer. Output is pretty-printed JSON on
//! stdout; [`execute`] returns the payload so embedders and tests can run
//! commands against any [`TabularStore`].

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use trackside_core::{normalize_status, EntityRef, LogEntryDraft, StatusKey};
use trackside_store::{
    new_session_token, CachePolicy, HttpStore, LogClient, LogicalTable, QueueDraft, TabularStore,
};

const BASE_URL_ENV: &str = "TRACKSIDE_BASE_URL";
const TOKEN_ENV: &str = "TRACKSIDE_TOKEN";
const ACTOR_ENV: &str = "TRACKSIDE_ACTOR";

#[derive(Debug, Parser)]
#[command(name = "trk")]
#[command(about = "Trackside status log CLI")]
pub struct Cli {
    /// Base URL of the tabular gateway; falls back to TRACKSIDE_BASE_URL.
    #[arg(long)]
    pub base_url: Option<String>,

    /// Bearer token for the gateway; falls back to TRACKSIDE_TOKEN.
    #[arg(long)]
    pub token: Option<String>,

    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Status {
        #[command(subcommand)]
        command: StatusCommand,
    },
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
    Refresh(RefreshArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Roster {
        #[command(subcommand)]
        command: RosterCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum StatusCommand {
    /// Current status of one task for one athlete within one event.
    Show(StatusShowArgs),
    /// Most recent matching entry in any other event (carry-over check).
    Last(StatusLastArgs),
}

#[derive(Debug, Args)]
pub struct StatusShowArgs {
    #[arg(long)]
    pub athlete: String,
    #[arg(long)]
    pub athlete_id: Option<String>,
    #[arg(long)]
    pub task: String,
    #[arg(long, default_value = "")]
    pub event: String,
}

#[derive(Debug, Args)]
pub struct StatusLastArgs {
    #[arg(long)]
    pub athlete: String,
    #[arg(long)]
    pub athlete_id: Option<String>,
    #[arg(long)]
    pub task: String,
    /// Status labels to match; repeatable. Empty means any status.
    #[arg(long = "status")]
    pub statuses: Vec<String>,
    #[arg(long)]
    pub exclude_event: String,
    /// Fall back to the excluded event when no other event matches.
    #[arg(long)]
    pub any_event: bool,
}

#[derive(Debug, Subcommand)]
pub enum LogCommand {
    Add(LogAddArgs),
}

#[derive(Debug, Args)]
pub struct LogAddArgs {
    #[arg(long, default_value = "")]
    pub event: String,
    #[arg(long)]
    pub athlete: String,
    #[arg(long)]
    pub athlete_id: Option<String>,
    #[arg(long)]
    pub task: String,
    #[arg(long)]
    pub status: String,
    /// Recording user; falls back to TRACKSIDE_ACTOR.
    #[arg(long)]
    pub actor: Option<String>,
    #[arg(long, default_value = "")]
    pub notes: String,
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// The queue board for a task: phases and numbers per athlete.
    Show(QueueShowArgs),
    /// waiting -> queued; assigns the next queue number.
    Enter(QueueTransitionArgs),
    /// queued -> waiting; the old number is abandoned.
    Remove(QueueTransitionArgs),
    /// queued -> finished.
    Finish(QueueTransitionArgs),
}

#[derive(Debug, Args)]
pub struct QueueShowArgs {
    #[arg(long)]
    pub task: String,
}

#[derive(Debug, Args)]
pub struct QueueTransitionArgs {
    #[arg(long)]
    pub task: String,
    #[arg(long, default_value = "")]
    pub event: String,
    #[arg(long)]
    pub athlete: String,
    #[arg(long)]
    pub athlete_id: Option<String>,
    #[arg(long)]
    pub actor: Option<String>,
    #[arg(long, default_value = "")]
    pub notes: String,
}

#[derive(Debug, Subcommand)]
pub enum LockCommand {
    /// Mark a roster row as being edited by this session (advisory only).
    Acquire(LockAcquireArgs),
    Release(LockReleaseArgs),
}

#[derive(Debug, Args)]
pub struct LockAcquireArgs {
    #[arg(long)]
    pub row_id: String,
    /// Session token; generated when omitted and echoed in the output.
    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Debug, Args)]
pub struct LockReleaseArgs {
    #[arg(long)]
    pub row_id: String,
    #[arg(long)]
    pub session: String,
}

#[derive(Debug, Args)]
pub struct RefreshArgs {
    /// Table to refresh; all three when omitted.
    #[arg(long)]
    pub table: Option<TableArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TableArg {
    Log,
    Roster,
    TaskConfig,
}

impl TableArg {
    fn to_table(self) -> LogicalTable {
        match self {
            Self::Log => LogicalTable::Log,
            Self::Roster => LogicalTable::Roster,
            Self::TaskConfig => LogicalTable::TaskConfig,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
}

#[derive(Debug, Subcommand)]
pub enum RosterCommand {
    Show,
}

/// Executes the parsed top-level CLI against the remote gateway.
///
/// # Errors
/// Returns an error when the gateway location is missing, a command
/// fails, or output serialization fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let base_url = resolve(cli.base_url, BASE_URL_ENV)
        .ok_or_else(|| anyhow!("--base-url or {BASE_URL_ENV} is required"))?;
    let token = resolve(cli.token, TOKEN_ENV);
    let store = HttpStore::new(&base_url, token, Duration::from_millis(cli.timeout_ms));
    let client = LogClient::new(store, CachePolicy::default());
    let payload = execute(&client, cli.command)?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn resolve(flag: Option<String>, env_name: &str) -> Option<String> {
    flag.or_else(|| std::env::var(env_name).ok()).filter(|value| !value.is_empty())
}

fn resolve_actor(flag: Option<String>) -> Result<String> {
    resolve(flag, ACTOR_ENV).ok_or_else(|| anyhow!("--actor or {ACTOR_ENV} is required"))
}

/// Executes one parsed command against an existing client and returns the
/// JSON payload that `run_cli` would print.
///
/// # Errors
/// Returns an error when a load, append, or lock operation fails.
pub fn execute<S: TabularStore>(client: &LogClient<S>, command: Command) -> Result<Value> {
    match command {
        Command::Status { command } => run_status(client, command),
        Command::Log { command } => run_log(client, command),
        Command::Queue { command } => run_queue(client, command),
        Command::Lock { command } => run_lock(client, command),
        Command::Refresh(args) => run_refresh(client, args),
        Command::Config { command } => run_config(client, command),
        Command::Roster { command } => run_roster(client, command),
    }
}

fn run_status<S: TabularStore>(client: &LogClient<S>, command: StatusCommand) -> Result<Value> {
    match command {
        StatusCommand::Show(args) => {
            let entity = EntityRef {
                id: args.athlete_id.as_deref(),
                name: &args.athlete,
            };
            let current = client
                .status_of(entity, &args.task, &args.event)
                .context("failed to materialize status")?;
            Ok(json!({
                "athlete": args.athlete,
                "athlete_id": args.athlete_id,
                "task": args.task,
                "event": args.event,
                "current": current,
            }))
        }
        StatusCommand::Last(args) => {
            let entity = EntityRef {
                id: args.athlete_id.as_deref(),
                name: &args.athlete,
            };
            let filter: Vec<StatusKey> = args
                .statuses
                .iter()
                .map(|label| normalize_status(label))
                .collect();
            let found = client
                .last_status_across_events(
                    entity,
                    &args.task,
                    &filter,
                    &args.exclude_event,
                    args.any_event,
                )
                .context("failed to materialize cross-event status")?;
            Ok(json!({
                "athlete": args.athlete,
                "task": args.task,
                "exclude_event": args.exclude_event,
                "found": found,
            }))
        }
    }
}

fn run_log<S: TabularStore>(client: &LogClient<S>, command: LogCommand) -> Result<Value> {
    match command {
        LogCommand::Add(args) => {
            let draft = LogEntryDraft {
                event: args.event,
                athlete_id: args.athlete_id,
                athlete: args.athlete,
                task: args.task,
                status: args.status,
                actor: resolve_actor(args.actor)?,
                recorded_at: None,
                queue_number: None,
                notes: args.notes,
            };
            let sequence = client.append(&draft).context("failed to append log entry")?;
            Ok(json!({ "sequence": sequence }))
        }
    }
}

fn run_queue<S: TabularStore>(client: &LogClient<S>, command: QueueCommand) -> Result<Value> {
    match command {
        QueueCommand::Show(args) => {
            let slots = client
                .queue_state_of(&args.task)
                .context("failed to derive queue state")?;
            Ok(json!({ "task": args.task, "slots": slots }))
        }
        QueueCommand::Enter(args) => {
            let draft = queue_draft(args)?;
            let ticket = client.queue_enter(&draft).context("failed to enter queue")?;
            Ok(json!({
                "athlete": draft.athlete,
                "task": draft.task,
                "queue_number": ticket.queue_number,
                "sequence": ticket.sequence,
            }))
        }
        QueueCommand::Remove(args) => {
            let draft = queue_draft(args)?;
            let sequence = client
                .queue_remove(&draft)
                .context("failed to remove from queue")?;
            Ok(json!({ "athlete": draft.athlete, "task": draft.task, "sequence": sequence }))
        }
        QueueCommand::Finish(args) => {
            let draft = queue_draft(args)?;
            let sequence = client
                .queue_finish(&draft)
                .context("failed to finish queue entry")?;
            Ok(json!({ "athlete": draft.athlete, "task": draft.task, "sequence": sequence }))
        }
    }
}

fn queue_draft(args: QueueTransitionArgs) -> Result<QueueDraft> {
    Ok(QueueDraft {
        task: args.task,
        event: args.event,
        athlete_id: args.athlete_id,
        athlete: args.athlete,
        actor: resolve_actor(args.actor)?,
        notes: args.notes,
    })
}

fn run_lock<S: TabularStore>(client: &LogClient<S>, command: LockCommand) -> Result<Value> {
    match command {
        LockCommand::Acquire(args) => {
            let session = args.session.unwrap_or_else(new_session_token);
            let outcome = client
                .acquire_lock(&args.row_id, &session)
                .context("failed to write advisory lock")?;
            let warning = if outcome.uncontended {
                None
            } else {
                outcome
                    .holder_before
                    .clone()
                    .map(|holder| format!("row was being edited by {holder}"))
            };
            Ok(json!({
                "session": session,
                "outcome": outcome,
                "warning": warning,
            }))
        }
        LockCommand::Release(args) => {
            let outcome = client
                .release_lock(&args.row_id, &args.session)
                .context("failed to clear advisory lock")?;
            Ok(json!({ "session": args.session, "outcome": outcome }))
        }
    }
}

fn run_refresh<S: TabularStore>(client: &LogClient<S>, args: RefreshArgs) -> Result<Value> {
    let tables = match args.table {
        Some(table) => vec![table.to_table()],
        None => vec![
            LogicalTable::Log,
            LogicalTable::Roster,
            LogicalTable::TaskConfig,
        ],
    };
    let mut refreshed = Vec::new();
    for table in tables {
        let rows = client
            .force_refresh(table)
            .with_context(|| format!("failed to refresh table '{}'", table.as_str()))?;
        refreshed.push(json!({ "table": table.as_str(), "rows": rows.len() }));
    }
    Ok(json!({ "refreshed": refreshed }))
}

fn run_config<S: TabularStore>(client: &LogClient<S>, command: ConfigCommand) -> Result<Value> {
    match command {
        ConfigCommand::Show => {
            let config = client
                .load_task_config()
                .context("failed to load task config")?;
            let log = client.load_log().context("failed to load log")?;
            let merged = config.with_log_fallback(&log);
            if merged.tasks.is_empty() {
                // Without any task vocabulary no screen can resolve anything.
                return Err(anyhow!(
                    "no tasks known: task config is empty and the log has no entries"
                ));
            }
            Ok(json!(merged))
        }
    }
}

fn run_roster<S: TabularStore>(client: &LogClient<S>, command: RosterCommand) -> Result<Value> {
    match command {
        RosterCommand::Show => {
            let roster = client.load_roster().context("failed to load roster")?;
            Ok(json!({ "entries": roster }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses_a_status_show_invocation() {
        let cli = match Cli::try_parse_from([
            "trk",
            "--base-url",
            "http://gateway.local",
            "status",
            "show",
            "--athlete",
            "John Doe",
            "--task",
            "Blood Test",
            "--event",
            "E1",
        ]) {
            Ok(cli) => cli,
            Err(err) => panic!("parse failed: {err}"),
        };
        assert_eq!(cli.base_url.as_deref(), Some("http://gateway.local"));
        assert!(matches!(
            cli.command,
            Command::Status {
                command: StatusCommand::Show(_)
            }
        ));
    }

    #[test]
    fn table_arg_maps_onto_logical_tables() {
        assert_eq!(TableArg::Log.to_table(), LogicalTable::Log);
        assert_eq!(TableArg::TaskConfig.to_table(), LogicalTable::TaskConfig);
    }
}
