//! End-to-end scenarios driven through the registered `absurd_*` SQL
//! functions, against the compiled extension loaded into a real SQLite
//! connection.

use rusqlite::Connection;
use std::path::PathBuf;

fn extension_path() -> PathBuf {
    let mut dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    dir.push("target");
    dir.push(if cfg!(debug_assertions) { "debug" } else { "release" });
    let file_name = if cfg!(target_os = "windows") {
        "absurd_engine.dll"
    } else if cfg!(target_os = "macos") {
        "libabsurd_engine.dylib"
    } else {
        "libabsurd_engine.so"
    };
    dir.push(file_name);
    dir
}

fn open_with_extension() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    unsafe {
        conn.load_extension_enable().expect("enable extension loading");
        conn.load_extension(extension_path(), None)
            .expect("load absurd_engine extension");
        conn.load_extension_disable().expect("disable extension loading");
    }
    conn
}

fn open_with_extension_at(path: &std::path::Path) -> Connection {
    let conn = Connection::open(path).expect("open file-backed db");
    unsafe {
        conn.load_extension_enable().expect("enable extension loading");
        conn.load_extension(extension_path(), None)
            .expect("load absurd_engine extension");
        conn.load_extension_disable().expect("disable extension loading");
    }
    conn
}

fn set_fake_now(conn: &Connection, ms: i64) {
    conn.execute("select absurd_set_fake_now(?1)", [ms]).unwrap();
}

fn create_queue(conn: &Connection, name: &str) {
    conn.execute("select absurd_create_queue(?1)", [name]).unwrap();
}

#[test]
fn spawn_claim_complete() {
    let conn = open_with_extension();
    set_fake_now(&conn, 1_000);
    create_queue(&conn, "q");

    let (task_id, run_id, attempt, created): (String, String, i64, i64) = conn
        .query_row(
            "select task_id, run_id, attempt, created from absurd_spawn_task('q', 'hello', '{\"n\":1}', null)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap();
    assert_eq!(attempt, 1);
    assert_eq!(created, 1);

    let claimed_task_id: String = conn
        .query_row(
            "select task_id from absurd_claim_task('q', 'w1', 60, 1)",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(claimed_task_id, task_id);

    conn.execute(
        "select absurd_complete_run('q', ?1, '{\"ok\":true}')",
        [&run_id],
    )
    .unwrap();

    let (state, payload): (String, String) = conn
        .query_row(
            "select state, json(completed_payload) from absurd_tasks where task_id = ?1",
            [&task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(state, "completed");
    assert_eq!(payload, r#"{"ok":true}"#);
}

#[test]
fn checkpoint_cache_survives_retry() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let (task_id, run_id): (String, String) = conn
        .query_row(
            "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', '{\"max_attempts\":2}')",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();

    conn.execute("select absurd_claim_task('q', 'w1', 60, 1)", []).unwrap();
    conn.execute(
        "select absurd_set_task_checkpoint_state('q', ?1, 'step1', '7', ?2, null)",
        rusqlite::params![task_id, run_id],
    )
    .unwrap();
    conn.execute("select absurd_fail_run('q', ?1, '\"boom\"', null)", [&run_id]).unwrap();

    let state: String = conn
        .query_row("select state from absurd_tasks where task_id = ?1", [&task_id], |row| row.get(0))
        .unwrap();
    assert_eq!(state, "pending");

    let cached: String = conn
        .query_row(
            "select json(state) from absurd_get_task_checkpoint_states('q', ?1, ?2) where checkpoint_name = 'step1'",
            [&task_id, &run_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(cached, "7");
}

#[test]
fn event_cached_before_await() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    conn.execute("select absurd_emit_event('q', 'ready', '{\"v\":42}')", []).unwrap();

    let (task_id, run_id): (String, String) = conn
        .query_row(
            "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', null)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();

    let (should_suspend, payload): (i64, String) = conn
        .query_row(
            "select should_suspend, json(payload) from absurd_await_event('q', ?1, ?2, 'wait1', 'ready', null)",
            [&task_id, &run_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(should_suspend, 0);
    assert_eq!(payload, r#"{"v":42}"#);

    let remaining: i64 = conn
        .query_row("select count(*) from absurd_events where event_name = 'ready'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(remaining, 0);
}

#[test]
fn broadcast_to_three_waiters() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let (task_id, run_id): (String, String) = conn
            .query_row(
                "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', null)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        let should_suspend: i64 = conn
            .query_row(
                "select should_suspend from absurd_await_event('q', ?1, ?2, 'w', 'go', null)",
                [&task_id, &run_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(should_suspend, 1);
        tasks.push(task_id);
    }

    let waits: i64 = conn.query_row("select count(*) from absurd_waits", [], |row| row.get(0)).unwrap();
    assert_eq!(waits, 3);

    conn.execute("select absurd_emit_event('q', 'go', '{\"x\":1}')", []).unwrap();

    let waits_after: i64 = conn.query_row("select count(*) from absurd_waits", [], |row| row.get(0)).unwrap();
    assert_eq!(waits_after, 0);

    for task_id in tasks {
        let state: String = conn
            .query_row("select state from absurd_tasks where task_id = ?1", [&task_id], |row| row.get(0))
            .unwrap();
        assert_eq!(state, "pending");
    }
}

#[test]
fn timeout_resumes_with_null_payload() {
    let conn = open_with_extension();
    set_fake_now(&conn, 1_000);
    create_queue(&conn, "q");

    let (task_id, run_id): (String, String) = conn
        .query_row(
            "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', null)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();

    conn.execute(
        "select absurd_await_event('q', ?1, ?2, 'w', 'never', 10)",
        [&task_id, &run_id],
    )
    .unwrap();

    set_fake_now(&conn, 12_000);
    let (wake_event, event_payload_is_null): (String, i64) = conn
        .query_row(
            "select wake_event, event_payload is null from absurd_claim_task('q', 'w1', 60, 1)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(wake_event, "never");
    assert_eq!(event_payload_is_null, 1);
}

#[test]
fn lease_theft_increments_attempt() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    conn.execute("select absurd_spawn_task('q', 'job', '{}', null)", []).unwrap();
    conn.execute("select absurd_claim_task('q', 'w1', 60, 1)", []).unwrap();

    set_fake_now(&conn, 61_000);
    let (attempt, claimed_by): (i64, String) = conn
        .query_row(
            "select attempt, 'w2' from absurd_claim_task('q', 'w2', 60, 1)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(attempt, 2);
    assert_eq!(claimed_by, "w2");

    let task_attempts: i64 = conn
        .query_row("select attempts from absurd_tasks", [], |row| row.get(0))
        .unwrap();
    assert_eq!(task_attempts, 2);
}

#[test]
fn cancellation_fences_writes() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let (task_id, run_id): (String, String) = conn
        .query_row(
            "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', null)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    conn.execute("select absurd_claim_task('q', 'w1', 60, 1)", []).unwrap();
    conn.execute("select absurd_cancel_task('q', ?1)", [&task_id]).unwrap();

    let err = conn
        .execute(
            "select absurd_set_task_checkpoint_state('q', ?1, 'x', '1', ?2, null)",
            rusqlite::params![task_id, run_id],
        )
        .unwrap_err();
    assert!(err.to_string().contains("CancelledError"));

    let err = conn
        .execute("select absurd_extend_claim('q', ?1, 30)", [&run_id])
        .unwrap_err();
    assert!(err.to_string().contains("CancelledError"));

    let (state, cancelled_at_is_null): (String, i64) = conn
        .query_row(
            "select state, cancelled_at is null from absurd_tasks where task_id = ?1",
            [&task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(state, "cancelled");
    assert_eq!(cancelled_at_is_null, 0);
}

#[test]
fn exponential_backoff_honors_max() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let options = r#"{"max_attempts":5,"retry_strategy":{"kind":"exponential","base_seconds":10,"factor":2,"max_seconds":30}}"#;
    let run_id: String = conn
        .query_row(
            "select run_id from absurd_spawn_task('q', 'job', '{}', ?1)",
            [options],
            |row| row.get(0),
        )
        .unwrap();

    let mut current_run = run_id;
    let expected_delays = [10_000, 20_000, 30_000, 30_000];
    let mut now = 0i64;
    for delay in expected_delays {
        conn.execute("select absurd_claim_task('q', 'w1', 60, 1)", []).unwrap();
        conn.execute("select absurd_fail_run('q', ?1, '\"nope\"', null)", [&current_run]).unwrap();

        now += delay;
        set_fake_now(&conn, now);
        let (next_run, available_at): (String, i64) = conn
            .query_row(
                "select run_id, available_at from absurd_runs
                  where queue_name = 'q' and state in ('pending','sleeping')
                  order by created_at desc limit 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(available_at <= now);
        current_run = next_run;
    }
}

#[test]
fn idempotency_key_short_circuits_second_spawn() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let options = r#"{"idempotency_key":"order-1"}"#;
    let (task_id_1, run_id_1): (String, String) = conn
        .query_row(
            "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', ?1)",
            [options],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();

    let (task_id_2, run_id_2, created): (String, String, i64) = conn
        .query_row(
            "select task_id, run_id, created from absurd_spawn_task('q', 'job', '{\"different\":true}', ?1)",
            [options],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();

    assert_eq!(task_id_1, task_id_2);
    assert_eq!(run_id_1, run_id_2);
    assert_eq!(created, 0);

    let task_count: i64 = conn
        .query_row("select count(*) from absurd_tasks where queue_name = 'q'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(task_count, 1);
}

#[test]
fn max_attempts_one_fails_without_retry() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let run_id: String = conn
        .query_row(
            "select run_id from absurd_spawn_task('q', 'job', '{}', '{\"max_attempts\":1}')",
            [],
            |row| row.get(0),
        )
        .unwrap();

    conn.execute("select absurd_claim_task('q', 'w1', 60, 1)", []).unwrap();
    conn.execute("select absurd_fail_run('q', ?1, '\"boom\"', null)", [&run_id]).unwrap();

    let (state, run_count): (String, i64) = conn
        .query_row(
            "select
                (select state from absurd_tasks where queue_name = 'q'),
                (select count(*) from absurd_runs where queue_name = 'q')",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(state, "failed");
    assert_eq!(run_count, 1);
}

#[test]
fn immediate_timeout_when_timeout_is_zero() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let (task_id, run_id): (String, String) = conn
        .query_row(
            "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', null)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();

    let (should_suspend, payload_is_null): (i64, i64) = conn
        .query_row(
            "select should_suspend, payload is null from absurd_await_event('q', ?1, ?2, 'w', 'never', 0)",
            [&task_id, &run_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(should_suspend, 0);
    assert_eq!(payload_is_null, 1);

    let wait_count: i64 = conn.query_row("select count(*) from absurd_waits", [], |row| row.get(0)).unwrap();
    assert_eq!(wait_count, 0);
}

#[test]
fn queue_registry_create_list_drop() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "a");
    create_queue(&conn, "b");
    // idempotent: creating the same queue twice does not error or duplicate.
    create_queue(&conn, "a");

    let names: Vec<String> = conn
        .prepare("select queue_name from absurd_list_queues order by created_at")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

    let (task_id,): (String,) = conn
        .query_row("select task_id from absurd_spawn_task('a', 'job', '{}', null)", [], |row| Ok((row.get(0)?,)))
        .unwrap();

    conn.execute("select absurd_drop_queue('a')", []).unwrap();

    let remaining_task: i64 = conn
        .query_row("select count(*) from absurd_tasks where task_id = ?1", [&task_id], |row| row.get(0))
        .unwrap();
    assert_eq!(remaining_task, 0);

    let names_after: Vec<String> = conn
        .prepare("select queue_name from absurd_list_queues order by created_at")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(names_after, vec!["b".to_string()]);
}

#[test]
fn cleanup_removes_terminal_tasks_past_ttl() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let (task_id, run_id): (String, String) = conn
        .query_row(
            "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', null)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    conn.execute("select absurd_claim_task('q', 'w1', 60, 1)", []).unwrap();
    conn.execute("select absurd_complete_run('q', ?1, 'null')", [&run_id]).unwrap();

    set_fake_now(&conn, 3_600_000);
    let deleted: i64 = conn
        .query_row("select absurd_cleanup_tasks('q', 60, 100)", [], |row| row.get(0))
        .unwrap();
    assert_eq!(deleted, 1);

    let remaining: i64 = conn
        .query_row("select count(*) from absurd_tasks where task_id = ?1", [&task_id], |row| row.get(0))
        .unwrap();
    assert_eq!(remaining, 0);
}

#[test]
fn schedule_run_cancels_when_wake_exceeds_max_duration() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let options = r#"{"cancellation":{"max_duration_s":10}}"#;
    let (task_id, run_id): (String, String) = conn
        .query_row(
            "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', ?1)",
            [options],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();

    conn.execute("select absurd_schedule_run('q', ?1, 20000)", [&run_id]).unwrap();

    let state: String = conn
        .query_row("select state from absurd_tasks where task_id = ?1", [&task_id], |row| row.get(0))
        .unwrap();
    assert_eq!(state, "cancelled");
}

#[test]
fn checkpoint_conflict_when_owner_is_not_terminal() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let (task_id, run_id): (String, String) = conn
        .query_row(
            "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', null)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    conn.execute("select absurd_claim_task('q', 'w1', 60, 1)", []).unwrap();
    conn.execute(
        "select absurd_set_task_checkpoint_state('q', ?1, 'step1', '1', ?2, null)",
        rusqlite::params![task_id, run_id],
    )
    .unwrap();

    // A checkpoint owned by `run_id` (still live) cannot be overwritten by a
    // run id that doesn't correspond to a terminal run.
    let err = conn
        .execute(
            "select absurd_set_task_checkpoint_state('q', ?1, 'step1', '2', 'some-other-run', null)",
            [&task_id],
        )
        .unwrap_err();
    assert!(err.to_string().contains("CheckpointConflict"));

    // The original run may still overwrite its own checkpoint.
    conn.execute(
        "select absurd_set_task_checkpoint_state('q', ?1, 'step1', '3', ?2, null)",
        rusqlite::params![task_id, run_id],
    )
    .unwrap();
    let value: String = conn
        .query_row(
            "select json(state) from absurd_get_task_checkpoint_state('q', ?1, 'step1')",
            [&task_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(value, "3");
}

#[test]
fn await_event_reentry_on_live_wait_suspends_again() {
    let conn = open_with_extension();
    set_fake_now(&conn, 1_000);
    create_queue(&conn, "q");

    let (task_id, run_id): (String, String) = conn
        .query_row(
            "select task_id, run_id from absurd_spawn_task('q', 'job', '{}', null)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();

    let should_suspend: i64 = conn
        .query_row(
            "select should_suspend from absurd_await_event('q', ?1, ?2, 'w', 'never', null)",
            [&task_id, &run_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(should_suspend, 1);

    // Re-entry on the same unmatched step: still suspended, no second wait row.
    let should_suspend_again: i64 = conn
        .query_row(
            "select should_suspend from absurd_await_event('q', ?1, ?2, 'w', 'never', null)",
            [&task_id, &run_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(should_suspend_again, 1);

    let wait_count: i64 = conn
        .query_row(
            "select count(*) from absurd_waits where queue_name = 'q' and task_id = ?1 and step_name = 'w'",
            [&task_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(wait_count, 1);
}

#[test]
fn cancel_is_idempotent_and_preserves_cancelled_at() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let task_id: String = conn
        .query_row(
            "select task_id from absurd_spawn_task('q', 'job', '{}', null)",
            [],
            |row| row.get(0),
        )
        .unwrap();

    conn.execute("select absurd_cancel_task('q', ?1)", [&task_id]).unwrap();
    let first_cancelled_at: i64 = conn
        .query_row("select cancelled_at from absurd_tasks where task_id = ?1", [&task_id], |row| row.get(0))
        .unwrap();

    set_fake_now(&conn, 50_000);
    conn.execute("select absurd_cancel_task('q', ?1)", [&task_id]).unwrap();
    let (state, second_cancelled_at): (String, i64) = conn
        .query_row(
            "select state, cancelled_at from absurd_tasks where task_id = ?1",
            [&task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(state, "cancelled");
    assert_eq!(second_cancelled_at, first_cancelled_at);
}

#[test]
fn max_delay_s_cancels_task_still_pending() {
    let conn = open_with_extension();
    set_fake_now(&conn, 0);
    create_queue(&conn, "q");

    let options = r#"{"cancellation":{"max_delay_s":10}}"#;
    let task_id: String = conn
        .query_row(
            "select task_id from absurd_spawn_task('q', 'job', '{}', ?1)",
            [options],
            |row| row.get(0),
        )
        .unwrap();

    set_fake_now(&conn, 11_000);
    // No candidates are claimable (the task never became available past the
    // delay cutoff at fake_now=0), but `claim_task` still runs the
    // cancellation sweep ahead of candidate selection.
    let _: Vec<String> = conn
        .prepare("select task_id from absurd_claim_task('q', 'w1', 60, 1)")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();

    let state: String = conn
        .query_row("select state from absurd_tasks where task_id = ?1", [&task_id], |row| row.get(0))
        .unwrap();
    assert_eq!(state, "cancelled");
}

#[test]
fn state_survives_reconnect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("absurd.db");

    let task_id = {
        let conn = Connection::open(&db_path).expect("open file-backed db");
        unsafe {
            conn.load_extension_enable().expect("enable extension loading");
            conn.load_extension(extension_path(), None).expect("load extension");
            conn.load_extension_disable().expect("disable extension loading");
        }
        set_fake_now(&conn, 500);
        create_queue(&conn, "q");
        let task_id: String = conn
            .query_row(
                "select task_id from absurd_spawn_task('q', 'job', '{}', null)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        task_id
    };

    let conn = open_with_extension_at(&db_path);
    let (state, queue_name): (String, String) = conn
        .query_row(
            "select state, queue_name from absurd_tasks where task_id = ?1",
            [&task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(state, "pending");
    assert_eq!(queue_name, "q");

    let claimed: String = conn
        .query_row(
            "select task_id from absurd_claim_task('q', 'w1', 60, 1)",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(claimed, task_id);
}
