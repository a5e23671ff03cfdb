//! Checkpoint store: named, per-task memoization that survives retries.
//! `owner_run_id` fencing: a new run inherits read access to every prior
//! checkpoint, but may only overwrite one whose owning run has gone terminal.

use crate::claim::task_is_cancelled_for_run;
use crate::error::EngineError;
use crate::validate;
use sqlite3ext_sys::sqlite3;
use sqlite_loadable::prelude::*;
use sqlite_loadable::{
    api,
    table::{BestIndexError, ConstraintOperator, IndexInfo, VTab, VTabArguments, VTabCursor},
    Error, Result,
};
use std::os::raw::c_int;

struct CheckpointRow {
    checkpoint_name: String,
    state: String,
    owner_run_id: String,
    updated_at: i64,
}

fn task_exists(db: *mut sqlite3, queue_name: &str, task_id: &str) -> Result<bool> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select 1 from absurd_tasks where queue_name = ?1 and task_id = ?2",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare task lookup: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, task_id).map_err(|err| Error::new_message(format!("{err:?}")))?;
    for row in stmt.execute() {
        row.map_err(|err| Error::new_message(format!("{err:?}")))?;
        return Ok(true);
    }
    Ok(false)
}

fn task_is_cancelled(db: *mut sqlite3, queue_name: &str, task_id: &str) -> Result<bool> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select 1 from absurd_tasks where queue_name = ?1 and task_id = ?2 and state = 'cancelled'",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare cancellation lookup: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, task_id).map_err(|err| Error::new_message(format!("{err:?}")))?;
    for row in stmt.execute() {
        row.map_err(|err| Error::new_message(format!("{err:?}")))?;
        return Ok(true);
    }
    Ok(false)
}

/// Whether `candidate_owner_run_id` is allowed to overwrite an existing
/// checkpoint owned by `existing_owner_run_id`: same run, or the existing
/// owner's run has gone terminal.
fn existing_owner_is_writable(db: *mut sqlite3, queue_name: &str, existing_owner_run_id: &str, candidate_owner_run_id: &str) -> Result<bool> {
    if existing_owner_run_id == candidate_owner_run_id {
        return Ok(true);
    }
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select 1 from absurd_runs
          where queue_name = ?1 and run_id = ?2
            and state in ('completed','failed','cancelled')",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare owner lookup: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, existing_owner_run_id).map_err(|err| Error::new_message(format!("{err:?}")))?;
    for row in stmt.execute() {
        row.map_err(|err| Error::new_message(format!("{err:?}")))?;
        return Ok(true);
    }
    Ok(false)
}

/// `absurd_set_task_checkpoint_state(queue, task_id, checkpoint_name, state_json, owner_run_id, extend_claim_by_seconds?)`.
pub fn set_task_checkpoint_state(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let task_id = api::value_text_notnull(values.get(1).ok_or_else(|| Error::new_message("task_id is required"))?)?.to_string();
    let checkpoint_name = api::value_text_notnull(values.get(2).ok_or_else(|| Error::new_message("checkpoint_name is required"))?)?.to_string();
    validate::checkpoint_name(&checkpoint_name).map_err(EngineError::into)?;
    let state_json = values
        .get(3)
        .filter(|value| !api::value_is_null(value))
        .map(|value| api::value_text(value).map(|s| s.to_string()))
        .transpose()?
        .unwrap_or_else(|| "null".to_string());
    let owner_run_id = api::value_text_notnull(values.get(4).ok_or_else(|| Error::new_message("owner_run_id is required"))?)?.to_string();
    let extend_claim_by_seconds = values.get(5).filter(|v| !api::value_is_null(v)).map(api::value_int64);

    sql::in_transaction(db, || {
        if !task_exists(db, &queue_name, &task_id)? {
            return Err(EngineError::NotFound(format!("task {task_id}")).into());
        }
        if task_is_cancelled(db, &queue_name, &task_id)? {
            return Err(EngineError::Cancelled.into());
        }

        if let Some(existing_owner) = current_owner(db, &queue_name, &task_id, &checkpoint_name)? {
            if !existing_owner_is_writable(db, &queue_name, &existing_owner, &owner_run_id)? {
                return Err(EngineError::CheckpointConflict.into());
            }
        }

        let now = sql::now_ms_from_db(db);
        sql::exec_with_bind_text(
            db,
            "insert into absurd_checkpoints (queue_name, task_id, checkpoint_name, state, owner_run_id, status, updated_at)
             values (?1, ?2, ?3, jsonb(?4), ?5, 'ok', cast(?6 as integer))
             on conflict (queue_name, task_id, checkpoint_name)
             do update set state = excluded.state, owner_run_id = excluded.owner_run_id, updated_at = excluded.updated_at",
            &[&queue_name, &task_id, &checkpoint_name, &state_json, &owner_run_id, &now.to_string()],
        )?;

        if let Some(extend_seconds) = extend_claim_by_seconds {
            if task_is_cancelled_for_run(db, &queue_name, &owner_run_id)? {
                return Err(EngineError::Cancelled.into());
            }
            let new_expiry = now + extend_seconds.max(0).saturating_mul(1000);
            sql::exec_with_bind_text(
                db,
                "update absurd_runs set claim_expires_at = cast(?1 as integer) where queue_name = ?2 and run_id = ?3",
                &[&new_expiry.to_string(), &queue_name, &owner_run_id],
            )?;
        }

        tracing::trace!(task_id = %task_id, checkpoint = %checkpoint_name, "absurd_set_task_checkpoint_state");
        Ok(())
    })?;

    api::result_null(context);
    Ok(())
}

/// Writes a checkpoint without cancellation/conflict checks. Used internally
/// by the wait/event matcher, which has already decided the write is safe
/// (a matched wait's run cannot race a concurrent checkpoint write because
/// both happen inside the same `begin immediate` transaction).
pub(crate) fn upsert_checkpoint(
    db: *mut sqlite3,
    queue_name: &str,
    task_id: &str,
    checkpoint_name: &str,
    state_json: &str,
    owner_run_id: &str,
) -> Result<()> {
    let now = sql::now_ms_from_db(db);
    sql::exec_with_bind_text(
        db,
        "insert into absurd_checkpoints (queue_name, task_id, checkpoint_name, state, owner_run_id, status, updated_at)
         values (?1, ?2, ?3, jsonb(?4), ?5, 'ok', cast(?6 as integer))
         on conflict (queue_name, task_id, checkpoint_name)
         do update set state = excluded.state, owner_run_id = excluded.owner_run_id, updated_at = excluded.updated_at",
        &[queue_name, task_id, checkpoint_name, state_json, owner_run_id, &now.to_string()],
    )
}

fn current_owner(db: *mut sqlite3, queue_name: &str, task_id: &str, checkpoint_name: &str) -> Result<Option<String>> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select owner_run_id from absurd_checkpoints where queue_name = ?1 and task_id = ?2 and checkpoint_name = ?3",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare owner lookup: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, task_id).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(3, checkpoint_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("{err:?}")))?;
        return Ok(Some(row.get::<String>(0).map_err(|err| Error::new_message(format!("{err:?}")))?));
    }
    Ok(None)
}

fn fetch_rows(db: *mut sqlite3, sql: &str, queue_name: &str, task_id: &str, extra: Option<&str>) -> Result<Vec<CheckpointRow>> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(db, sql)
        .map_err(|err| Error::new_message(format!("failed to prepare checkpoint query: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, task_id).map_err(|err| Error::new_message(format!("{err:?}")))?;
    if let Some(value) = extra {
        stmt.bind_text(3, value).map_err(|err| Error::new_message(format!("{err:?}")))?;
    }
    let mut rows = Vec::new();
    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("failed to read checkpoint row: {err:?}")))?;
        rows.push(CheckpointRow {
            checkpoint_name: row.get::<String>(0).map_err(|e| Error::new_message(format!("{e:?}")))?,
            state: row.get::<String>(1).map_err(|e| Error::new_message(format!("{e:?}")))?,
            owner_run_id: row.get::<String>(2).map_err(|e| Error::new_message(format!("{e:?}")))?,
            updated_at: row.get::<i64>(3).map_err(|e| Error::new_message(format!("{e:?}")))?,
        });
    }
    Ok(rows)
}

fn all_checkpoints(db: *mut sqlite3, queue_name: &str, task_id: &str) -> Result<Vec<CheckpointRow>> {
    fetch_rows(
        db,
        "select checkpoint_name, json(state), owner_run_id, updated_at
           from absurd_checkpoints
          where queue_name = ?1 and task_id = ?2
          order by checkpoint_name",
        queue_name,
        task_id,
        None,
    )
}

fn one_checkpoint(db: *mut sqlite3, queue_name: &str, task_id: &str, checkpoint_name: &str) -> Result<Vec<CheckpointRow>> {
    fetch_rows(
        db,
        "select checkpoint_name, json(state), owner_run_id, updated_at
           from absurd_checkpoints
          where queue_name = ?1 and task_id = ?2 and checkpoint_name = ?3",
        queue_name,
        task_id,
        Some(checkpoint_name),
    )
}

macro_rules! checkpoint_vtab {
    ($table:ident, $cursor:ident, $create_sql:expr, $hidden_count:expr, $fetch:expr) => {
        #[repr(C)]
        pub struct $table {
            base: sqlite3_vtab,
            db: *mut sqlite3,
        }

        impl<'vtab> VTab<'vtab> for $table {
            type Aux = ();
            type Cursor = $cursor;

            fn connect(db: *mut sqlite3, _aux: Option<&Self::Aux>, _args: VTabArguments) -> Result<(String, $table)> {
                let base: sqlite3_vtab = unsafe { std::mem::zeroed() };
                Ok(($create_sql.to_owned(), $table { base, db }))
            }

            fn destroy(&self) -> Result<()> {
                Ok(())
            }

            fn best_index(&self, mut info: IndexInfo) -> core::result::Result<(), BestIndexError> {
                let mut has_queue = false;
                for mut constraint in info.constraints() {
                    let base_idx = 4i32;
                    if constraint.column_idx() < base_idx || constraint.column_idx() >= base_idx + $hidden_count {
                        continue;
                    }
                    let argv_index = constraint.column_idx() - base_idx + 1;
                    if constraint.usable() && constraint.op() == Some(ConstraintOperator::EQ) {
                        constraint.set_omit(true);
                        constraint.set_argv_index(argv_index);
                        if argv_index == 1 {
                            has_queue = true;
                        }
                    } else {
                        return Err(BestIndexError::Constraint);
                    }
                }
                if !has_queue {
                    return Err(BestIndexError::Error);
                }
                info.set_estimated_cost(5.0);
                info.set_estimated_rows(4);
                Ok(())
            }

            fn open(&mut self) -> Result<$cursor> {
                Ok($cursor { base: unsafe { std::mem::zeroed() }, db: self.db, rowid: 0, rows: Vec::new() })
            }
        }

        #[repr(C)]
        pub struct $cursor {
            base: sqlite3_vtab_cursor,
            db: *mut sqlite3,
            rowid: i64,
            rows: Vec<CheckpointRow>,
        }

        impl VTabCursor for $cursor {
            fn filter(&mut self, _idx_num: c_int, _idx_str: Option<&str>, values: &[*mut sqlite3_value]) -> Result<()> {
                self.rows = $fetch(self.db, values)?;
                self.rowid = 0;
                Ok(())
            }

            fn next(&mut self) -> Result<()> {
                self.rowid += 1;
                Ok(())
            }

            fn eof(&self) -> bool {
                self.rowid as usize >= self.rows.len()
            }

            fn column(&self, context: *mut sqlite3_context, i: c_int) -> Result<()> {
                let Some(row) = self.rows.get(self.rowid as usize) else {
                    api::result_null(context);
                    return Ok(());
                };
                match i {
                    0 => api::result_text(context, &row.checkpoint_name)?,
                    1 => sql::result_json_value(self.db, context, &row.state)?,
                    2 => api::result_text(context, &row.owner_run_id)?,
                    3 => api::result_int64(context, row.updated_at),
                    _ => api::result_null(context),
                }
                Ok(())
            }

            fn rowid(&self) -> Result<i64> {
                Ok(self.rowid)
            }
        }
    };
}

use crate::sql;

fn fetch_states(db: *mut sqlite3, values: &[*mut sqlite3_value]) -> Result<Vec<CheckpointRow>> {
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let task_id = api::value_text_notnull(values.get(1).ok_or_else(|| Error::new_message("task_id is required"))?)?.to_string();
    // run_id (values[2]) is accepted for symmetry with the per-run cache
    // warm-up call but does not filter the result: every checkpoint for the
    // task is returned regardless of which run is asking.
    all_checkpoints(db, &queue_name, &task_id)
}

fn fetch_state(db: *mut sqlite3, values: &[*mut sqlite3_value]) -> Result<Vec<CheckpointRow>> {
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let task_id = api::value_text_notnull(values.get(1).ok_or_else(|| Error::new_message("task_id is required"))?)?.to_string();
    let checkpoint_name = api::value_text_notnull(values.get(2).ok_or_else(|| Error::new_message("checkpoint_name is required"))?)?.to_string();
    one_checkpoint(db, &queue_name, &task_id, &checkpoint_name)
}

checkpoint_vtab!(
    GetCheckpointStatesTable,
    GetCheckpointStatesCursor,
    "CREATE TABLE x(checkpoint_name TEXT, state BLOB, owner_run_id TEXT, updated_at INTEGER, queue_name TEXT hidden, task_id TEXT hidden, run_id TEXT hidden)",
    3,
    fetch_states
);

checkpoint_vtab!(
    GetCheckpointStateTable,
    GetCheckpointStateCursor,
    "CREATE TABLE x(checkpoint_name TEXT, state BLOB, owner_run_id TEXT, updated_at INTEGER, queue_name TEXT hidden, task_id TEXT hidden, checkpoint_name_arg TEXT hidden)",
    3,
    fetch_state
);
