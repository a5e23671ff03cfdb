//! `absurd_cancel_task` — idempotent terminal transition that fences future
//! writes for a task.

use crate::error::EngineError;
use crate::sql;
use crate::validate;
use sqlite3ext_sys::sqlite3;
use sqlite_loadable::prelude::*;
use sqlite_loadable::{api, Error, Result};

fn is_terminal(state: &str) -> bool {
    matches!(state, "completed" | "failed" | "cancelled")
}

fn task_state(db: *mut sqlite3, queue_name: &str, task_id: &str) -> Result<Option<String>> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select state from absurd_tasks where queue_name = ?1 and task_id = ?2",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare task lookup: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, task_id).map_err(|err| Error::new_message(format!("{err:?}")))?;
    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("{err:?}")))?;
        return Ok(Some(row.get::<String>(0).map_err(|err| Error::new_message(format!("{err:?}")))?));
    }
    Ok(None)
}

/// `absurd_cancel_task(queue, task_id)`.
pub fn cancel_task(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let task_id = api::value_text_notnull(values.get(1).ok_or_else(|| Error::new_message("task_id is required"))?)?.to_string();

    sql::in_transaction(db, || {
        let Some(state) = task_state(db, &queue_name, &task_id)? else {
            return Err(EngineError::NotFound(format!("task {task_id}")).into());
        };
        if is_terminal(&state) {
            return Ok(());
        }

        let now = sql::now_ms_from_db(db);
        sql::exec_with_bind_text(
            db,
            "update absurd_tasks set state = 'cancelled', cancelled_at = cast(?1 as integer)
              where queue_name = ?2 and task_id = ?3",
            &[&now.to_string(), &queue_name, &task_id],
        )?;
        sql::exec_with_bind_text(
            db,
            "update absurd_runs
                set state = 'cancelled', claimed_by = null, claim_expires_at = null, wake_event = null
              where queue_name = ?1 and task_id = ?2 and state not in ('completed','failed','cancelled')",
            &[&queue_name, &task_id],
        )?;
        sql::exec_with_bind_text(
            db,
            "delete from absurd_waits where queue_name = ?1 and task_id = ?2",
            &[&queue_name, &task_id],
        )?;
        tracing::info!(queue = %queue_name, task_id = %task_id, "absurd_cancel_task");
        Ok(())
    })?;

    api::result_null(context);
    Ok(())
}
