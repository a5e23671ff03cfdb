//! Schema & migrations: a versioned, idempotent set of DDL steps applied to
//! whatever database the extension is loaded into.
//!
//! One `execute_batch`-style string per step, each idempotent on its own
//! (`CREATE TABLE IF NOT EXISTS`), with an `absurd_migrations` ledger so
//! `apply_migrations()` is safe to call on every connection open and is a
//! no-op once up to date.

use sqlite3ext_sys::sqlite3;
use sqlite_loadable::{exec::Statement, Error, Result};

struct Migration {
    id: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "core_tables",
        sql: "
            create table if not exists absurd_migrations (
                id integer primary key,
                introduced_version text not null,
                applied_at integer not null
            );

            create table if not exists absurd_settings (
                id integer primary key check (id = 0),
                fake_now integer
            );
            insert or ignore into absurd_settings (id, fake_now) values (0, null);

            create table if not exists absurd_queues (
                queue_name text primary key,
                created_at integer not null
            );

            create table if not exists absurd_tasks (
                queue_name text not null,
                task_id text not null,
                task_name text not null,
                params blob not null,
                headers blob,
                retry_strategy blob,
                max_attempts integer,
                cancellation blob,
                idempotency_key text,
                enqueue_at integer not null,
                first_started_at integer,
                state text not null,
                attempts integer not null default 0,
                last_attempt_run text,
                completed_payload blob,
                cancelled_at integer,
                primary key (queue_name, task_id)
            );
            create unique index if not exists absurd_tasks_idempotency
                on absurd_tasks (queue_name, idempotency_key)
                where idempotency_key is not null;
            create index if not exists absurd_tasks_state
                on absurd_tasks (queue_name, state);

            create table if not exists absurd_runs (
                queue_name text not null,
                run_id text not null,
                task_id text not null,
                attempt integer not null,
                state text not null,
                claimed_by text,
                claim_expires_at integer,
                available_at integer not null,
                wake_event text,
                event_payload blob,
                started_at integer,
                completed_at integer,
                failed_at integer,
                result blob,
                failure_reason blob,
                created_at integer not null,
                primary key (queue_name, run_id)
            );
            create index if not exists absurd_runs_task
                on absurd_runs (queue_name, task_id);
            create index if not exists absurd_runs_claimable
                on absurd_runs (queue_name, state, available_at, run_id);

            create table if not exists absurd_checkpoints (
                queue_name text not null,
                task_id text not null,
                checkpoint_name text not null,
                state blob,
                owner_run_id text not null,
                status text not null default 'ok',
                updated_at integer not null,
                primary key (queue_name, task_id, checkpoint_name)
            );

            create table if not exists absurd_waits (
                queue_name text not null,
                task_id text not null,
                run_id text not null,
                step_name text not null,
                event_name text not null,
                expires_at integer,
                created_at integer not null,
                primary key (queue_name, task_id, step_name)
            );
            create index if not exists absurd_waits_event
                on absurd_waits (queue_name, event_name, created_at);

            create table if not exists absurd_events (
                queue_name text not null,
                event_id text not null,
                event_name text not null,
                payload blob,
                created_at integer not null,
                primary key (queue_name, event_id)
            );
            create index if not exists absurd_events_name
                on absurd_events (queue_name, event_name, created_at);
        ",
    },
];

/// Applies every migration not yet recorded in `absurd_migrations`. Returns
/// the number of steps newly applied (`0` when the schema is already current).
pub fn apply_migrations(db: *mut sqlite3) -> Result<i64> {
    ensure_ledger(db)?;
    let applied = applied_ids(db)?;

    let mut count = 0i64;
    for migration in MIGRATIONS {
        if applied.contains(&migration.id) {
            continue;
        }
        exec_batch(db, migration.sql)?;
        record_applied(db, migration)?;
        count += 1;
    }
    Ok(count)
}

fn ensure_ledger(db: *mut sqlite3) -> Result<()> {
    exec_batch(
        db,
        "create table if not exists absurd_migrations (
            id integer primary key,
            introduced_version text not null,
            applied_at integer not null
        )",
    )
}

fn applied_ids(db: *mut sqlite3) -> Result<Vec<i64>> {
    let mut stmt = Statement::prepare(db, "select id from absurd_migrations")
        .map_err(|err| Error::new_message(format!("failed to query migrations: {err:?}")))?;
    let mut ids = Vec::new();
    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("failed to read migration row: {err:?}")))?;
        ids.push(row.get::<i64>(0).map_err(|err| Error::new_message(format!("failed to read id: {err:?}")))?);
    }
    Ok(ids)
}

fn record_applied(db: *mut sqlite3, migration: &Migration) -> Result<()> {
    let now = crate::sql::now_ms_from_db(db);
    crate::sql::exec_with_bind_text(
        db,
        "insert into absurd_migrations (id, introduced_version, applied_at)
         values (cast(?1 as integer), ?2, cast(?3 as integer))",
        &[&migration.id.to_string(), migration.name, &now.to_string()],
    )
}

fn exec_batch(db: *mut sqlite3, sql: &str) -> Result<()> {
    for statement in sql.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        crate::sql::exec_with_bind_text(db, statement, &[])?;
    }
    Ok(())
}
