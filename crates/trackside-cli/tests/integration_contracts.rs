//! End-to-end command contracts against an in-process tabular store.

use serde_json::Value;
use trackside_cli::{
    execute, Command, ConfigCommand, LockAcquireArgs, LockCommand, LockReleaseArgs, LogAddArgs,
    LogCommand, QueueCommand, QueueShowArgs, QueueTransitionArgs, StatusCommand, StatusLastArgs,
    StatusShowArgs,
};
use trackside_core::{columns, RawRow};
use trackside_store::memory::MemoryStore;
use trackside_store::{CachePolicy, LogClient, LogicalTable};

fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn log_row(seq: &str, event: &str, athlete: &str, task: &str, status: &str, at: &str) -> RawRow {
    let mut row = RawRow::new();
    row.insert(columns::SEQUENCE.to_string(), seq.to_string());
    row.insert(columns::EVENT.to_string(), event.to_string());
    row.insert(columns::ATHLETE.to_string(), athlete.to_string());
    row.insert(columns::TASK.to_string(), task.to_string());
    row.insert(columns::STATUS.to_string(), status.to_string());
    row.insert(columns::ACTOR.to_string(), "ops".to_string());
    row.insert(columns::DATE.to_string(), at.to_string());
    row
}

fn seeded_client() -> LogClient<MemoryStore> {
    let store = MemoryStore::new();
    store.seed(
        LogicalTable::Log,
        vec![
            log_row("1", "E1", "John Doe", "Blood Test", "Requested", "01/01/2024 10:00"),
            log_row("2", "E1", "john doe", "blood test", "Done", "01/01/2024 11:00"),
            log_row("3", "E0", "José Silva", "Blood Test", "Done", "10/11/2023 09:00"),
        ],
    );
    let mut roster = RawRow::new();
    roster.insert(columns::ROSTER_ROW_ID.to_string(), "7".to_string());
    roster.insert(columns::ATHLETE.to_string(), "John Doe".to_string());
    roster.insert(columns::EVENT.to_string(), "E1".to_string());
    store.seed(LogicalTable::Roster, vec![roster]);
    LogClient::new(store, CachePolicy::default())
}

fn status_show(athlete: &str, task: &str, event: &str) -> Command {
    Command::Status {
        command: StatusCommand::Show(StatusShowArgs {
            athlete: athlete.to_string(),
            athlete_id: None,
            task: task.to_string(),
            event: event.to_string(),
        }),
    }
}

#[test]
fn status_show_resolves_the_worked_example() {
    let client = seeded_client();
    let payload = must_ok(execute(&client, status_show("John Doe", "Blood Test", "E1")));
    assert_eq!(payload["current"]["status"], Value::from("done"));
    assert_eq!(payload["current"]["label"], Value::from("Done"));
}

#[test]
fn status_show_defaults_to_pending_for_unseen_keys() {
    let client = seeded_client();
    let payload = must_ok(execute(&client, status_show("John Doe", "Photoshoot", "E1")));
    assert_eq!(payload["current"]["status"], Value::from("pending"));
    assert_eq!(payload["current"]["actor"], Value::Null);
}

#[test]
fn status_last_finds_the_other_event_entry_with_accent_variance() {
    let client = seeded_client();
    let payload = must_ok(execute(
        &client,
        Command::Status {
            command: StatusCommand::Last(StatusLastArgs {
                athlete: "Jose Silva".to_string(),
                athlete_id: None,
                task: "Blood Test".to_string(),
                statuses: vec!["Done".to_string()],
                exclude_event: "E1".to_string(),
                any_event: false,
            }),
        },
    ));
    assert_eq!(payload["found"]["event"], Value::from("E0"));
    assert_eq!(payload["found"]["status"], Value::from("done"));
}

#[test]
fn log_add_appends_with_the_next_sequence() {
    let client = seeded_client();
    let payload = must_ok(execute(
        &client,
        Command::Log {
            command: LogCommand::Add(LogAddArgs {
                event: "E1".to_string(),
                athlete: "John Doe".to_string(),
                athlete_id: None,
                task: "Photoshoot".to_string(),
                status: "Requested".to_string(),
                actor: Some("reporter".to_string()),
                notes: String::new(),
            }),
        },
    ));
    assert_eq!(payload["sequence"], Value::from(4));

    let shown = must_ok(execute(&client, status_show("John Doe", "Photoshoot", "E1")));
    assert_eq!(shown["current"]["status"], Value::from("requested"));
    assert_eq!(shown["current"]["actor"], Value::from("reporter"));
}

fn queue_transition(athlete: &str) -> QueueTransitionArgs {
    QueueTransitionArgs {
        task: "Check-In".to_string(),
        event: "E1".to_string(),
        athlete: athlete.to_string(),
        athlete_id: None,
        actor: Some("ops".to_string()),
        notes: String::new(),
    }
}

#[test]
fn queue_commands_walk_the_state_machine() {
    let client = seeded_client();

    let ana = must_ok(execute(
        &client,
        Command::Queue {
            command: QueueCommand::Enter(queue_transition("Ana")),
        },
    ));
    assert_eq!(ana["queue_number"], Value::from(1));

    let bea = must_ok(execute(
        &client,
        Command::Queue {
            command: QueueCommand::Enter(queue_transition("Bea")),
        },
    ));
    assert_eq!(bea["queue_number"], Value::from(2));

    must_ok(execute(
        &client,
        Command::Queue {
            command: QueueCommand::Remove(queue_transition("Ana")),
        },
    ));
    must_ok(execute(
        &client,
        Command::Queue {
            command: QueueCommand::Finish(queue_transition("Bea")),
        },
    ));

    let board = must_ok(execute(
        &client,
        Command::Queue {
            command: QueueCommand::Show(QueueShowArgs {
                task: "check-in".to_string(),
            }),
        },
    ));
    let slots = match board["slots"].as_array() {
        Some(slots) => slots,
        None => panic!("expected slots array, got {board}"),
    };
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0]["athlete"], Value::from("Ana"));
    assert_eq!(slots[0]["phase"], Value::from("waiting"));
    assert_eq!(slots[1]["athlete"], Value::from("Bea"));
    assert_eq!(slots[1]["phase"], Value::from("finished"));
}

#[test]
fn lock_round_trip_warns_on_contention() {
    let client = seeded_client();

    let first = must_ok(execute(
        &client,
        Command::Lock {
            command: LockCommand::Acquire(LockAcquireArgs {
                row_id: "7".to_string(),
                session: Some("session-a".to_string()),
            }),
        },
    ));
    assert_eq!(first["warning"], Value::Null);

    let second = must_ok(execute(
        &client,
        Command::Lock {
            command: LockCommand::Acquire(LockAcquireArgs {
                row_id: "7".to_string(),
                session: None,
            }),
        },
    ));
    assert_eq!(
        second["warning"],
        Value::from("row was being edited by session-a")
    );
    let generated = match second["session"].as_str() {
        Some(session) => session.to_string(),
        None => panic!("expected generated session token"),
    };

    let released = must_ok(execute(
        &client,
        Command::Lock {
            command: LockCommand::Release(LockReleaseArgs {
                row_id: "7".to_string(),
                session: generated,
            }),
        },
    ));
    assert_eq!(released["outcome"]["uncontended"], Value::from(true));
}

#[test]
fn config_show_falls_back_to_log_vocabulary() {
    let client = seeded_client();
    let payload = must_ok(execute(
        &client,
        Command::Config {
            command: ConfigCommand::Show,
        },
    ));
    let tasks = match payload["tasks"].as_array() {
        Some(tasks) => tasks.clone(),
        None => panic!("expected tasks array, got {payload}"),
    };
    assert!(tasks.contains(&Value::from("Blood Test")));
}

#[test]
fn config_show_with_no_vocabulary_is_fatal() {
    let client = LogClient::new(MemoryStore::new(), CachePolicy::default());
    assert!(execute(
        &client,
        Command::Config {
            command: ConfigCommand::Show,
        },
    )
    .is_err());
}
