//! A durable task execution engine embedded inside a SQLite database.
//!
//! Clients enqueue named tasks with JSON parameters; workers in separate
//! processes claim, execute, and checkpoint them against runs recorded in
//! the `absurd_*` tables. The engine never owns a connection — every
//! function here runs inside whatever connection called it, exposed either
//! as a SQLite loadable extension (`sqlite3_absurdengine_init`) or, linked
//! directly, via [`register_functions`].
//!
//! See `DESIGN.md` for the grounding of each module.

mod cancel;
mod checkpoint;
mod claim;
mod cleanup;
mod clock;
mod completion;
mod config;
mod error;
mod ids;
mod migrations;
mod queue;
mod retry;
mod spawn;
mod sql;
mod validate;
mod wait;

pub use config::EngineOptions;
pub use error::{EngineError, EngineResult};

use sqlite3ext_sys::sqlite3;
use sqlite_loadable::prelude::*;
use sqlite_loadable::{define_scalar_function, define_table_function, FunctionFlags, Result};

/// Registers every `absurd_*` scalar and table-valued function on `db` using
/// [`EngineOptions::default()`]. See [`register_functions_with_options`] for
/// embedders that need to override the process-wide defaults.
pub fn register_functions(db: *mut sqlite3) -> Result<()> {
    register_functions_with_options(db, EngineOptions::default())
}

/// Registers every `absurd_*` scalar and table-valued function on `db`,
/// applying pending migrations first so a freshly opened database is ready
/// to use immediately after the extension loads, and installing `options`
/// as the process-wide defaults read by `claim_task`/`spawn_task` when a
/// caller omits `lease_seconds`/`max_attempts`.
///
/// `options` only takes effect on the first call in a process — the engine
/// holds no per-connection state (see `lib.rs` module docs), so a second
/// connection loading the same `cdylib` shares the first connection's
/// installed defaults.
pub fn register_functions_with_options(db: *mut sqlite3, options: EngineOptions) -> Result<()> {
    let busy_timeout_ms = options.busy_timeout_ms;
    config::install(options);

    sql::exec_with_bind_text(db, &format!("pragma busy_timeout = {busy_timeout_ms}"), &[])?;

    migrations::apply_migrations(db)?;

    let flags = FunctionFlags::UTF8;

    define_scalar_function(db, "absurd_apply_migrations", 0, apply_migrations_fn, flags)?;
    define_scalar_function(db, "absurd_set_fake_now", clock::SET_FAKE_NOW_ARGS, clock::set_fake_now, flags)?;

    define_scalar_function(db, "absurd_create_queue", 1, queue::create_queue, flags)?;
    define_scalar_function(db, "absurd_drop_queue", 1, queue::drop_queue, flags)?;
    define_table_function::<queue::ListQueuesTable>(db, "absurd_list_queues", None)?;

    define_table_function::<spawn::SpawnTaskTable>(db, "absurd_spawn_task", None)?;
    define_table_function::<claim::ClaimTaskTable>(db, "absurd_claim_task", None)?;
    define_scalar_function(db, "absurd_extend_claim", 3, claim::extend_claim, flags)?;

    define_scalar_function(db, "absurd_set_task_checkpoint_state", -1, checkpoint::set_task_checkpoint_state, flags)?;
    define_table_function::<checkpoint::GetCheckpointStateTable>(db, "absurd_get_task_checkpoint_state", None)?;
    define_table_function::<checkpoint::GetCheckpointStatesTable>(db, "absurd_get_task_checkpoint_states", None)?;

    define_table_function::<wait::AwaitEventTable>(db, "absurd_await_event", None)?;
    define_scalar_function(db, "absurd_emit_event", 3, wait::emit_event, flags)?;

    define_scalar_function(db, "absurd_complete_run", 3, completion::complete_run, flags)?;
    define_scalar_function(db, "absurd_fail_run", -1, completion::fail_run, flags)?;
    define_scalar_function(db, "absurd_schedule_run", 3, completion::schedule_run, flags)?;

    define_scalar_function(db, "absurd_cancel_task", 2, cancel::cancel_task, flags)?;

    define_scalar_function(db, "absurd_cleanup_tasks", 3, cleanup::cleanup_tasks, flags)?;
    define_scalar_function(db, "absurd_cleanup_events", 3, cleanup::cleanup_events, flags)?;

    Ok(())
}

fn apply_migrations_fn(context: *mut sqlite3_context, _values: &[*mut sqlite3_value]) -> Result<()> {
    let db = sqlite_loadable::api::context_db_handle(context);
    let applied = migrations::apply_migrations(db)?;
    sqlite_loadable::api::result_int64(context, applied);
    Ok(())
}

#[sqlite_entrypoint]
pub fn sqlite3_absurdengine_init(db: *mut sqlite3) -> Result<()> {
    register_functions(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_options_default_is_reasonable() {
        let opts = EngineOptions::default();
        assert!(opts.default_lease_seconds > 0);
        assert!(opts.busy_timeout_ms > 0);
    }
}
