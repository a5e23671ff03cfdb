//! TTL cleanup: `absurd_cleanup_tasks` and `absurd_cleanup_events`.
//! Both are bounded, `limit`-capped deletions returning the count actually
//! removed.

use crate::sql;
use crate::validate;
use crate::error::EngineError;
use sqlite3ext_sys::sqlite3;
use sqlite_loadable::prelude::*;
use sqlite_loadable::{api, Error, Result};

fn collect_ids(db: *mut sqlite3, sql_text: &str, queue_name: &str, cutoff: i64, limit: i64) -> Result<Vec<String>> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(db, sql_text)
        .map_err(|err| Error::new_message(format!("failed to prepare cleanup scan: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, &cutoff.to_string()).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(3, &limit.to_string()).map_err(|err| Error::new_message(format!("{err:?}")))?;

    let mut ids = Vec::new();
    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("failed to read cleanup row: {err:?}")))?;
        ids.push(row.get::<String>(0).map_err(|err| Error::new_message(format!("{err:?}")))?);
    }
    Ok(ids)
}

/// `absurd_cleanup_tasks(queue, ttl_s, limit) -> deleted_count`.
pub fn cleanup_tasks(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let ttl_seconds = api::value_int64(values.get(1).ok_or_else(|| Error::new_message("ttl_s is required"))?).max(0);
    let limit = api::value_int64(values.get(2).ok_or_else(|| Error::new_message("limit is required"))?).max(0);

    let deleted = sql::in_transaction(db, || {
        let now = sql::now_ms_from_db(db);
        let cutoff = now - ttl_seconds.saturating_mul(1000);

        let task_ids = collect_ids(
            db,
            "select task_id from absurd_tasks
              where queue_name = ?1
                and state in ('completed','failed','cancelled')
                and max(coalesce(completed_at, 0), coalesce(failed_at, 0), coalesce(cancelled_at, 0)) <= cast(?2 as integer)
              order by task_id
              limit cast(?3 as integer)",
            &queue_name,
            cutoff,
            limit,
        )?;

        for task_id in &task_ids {
            for table in ["absurd_checkpoints", "absurd_waits", "absurd_runs"] {
                sql::exec_with_bind_text(
                    db,
                    &format!("delete from {table} where queue_name = ?1 and task_id = ?2"),
                    &[&queue_name, task_id],
                )?;
            }
            sql::exec_with_bind_text(
                db,
                "delete from absurd_tasks where queue_name = ?1 and task_id = ?2",
                &[&queue_name, task_id],
            )?;
        }
        tracing::info!(queue = %queue_name, deleted = task_ids.len(), "absurd_cleanup_tasks");
        Ok(task_ids.len() as i64)
    })?;

    api::result_int64(context, deleted);
    Ok(())
}

/// `absurd_cleanup_events(queue, ttl_s, limit) -> deleted_count`.
pub fn cleanup_events(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let ttl_seconds = api::value_int64(values.get(1).ok_or_else(|| Error::new_message("ttl_s is required"))?).max(0);
    let limit = api::value_int64(values.get(2).ok_or_else(|| Error::new_message("limit is required"))?).max(0);

    let deleted = sql::in_transaction(db, || {
        let now = sql::now_ms_from_db(db);
        let cutoff = now - ttl_seconds.saturating_mul(1000);

        let event_ids = collect_ids(
            db,
            "select event_id from absurd_events
              where queue_name = ?1 and created_at <= cast(?2 as integer)
              order by event_id
              limit cast(?3 as integer)",
            &queue_name,
            cutoff,
            limit,
        )?;

        for event_id in &event_ids {
            sql::exec_with_bind_text(
                db,
                "delete from absurd_events where queue_name = ?1 and event_id = ?2",
                &[&queue_name, event_id],
            )?;
        }
        tracing::debug!(queue = %queue_name, deleted = event_ids.len(), "absurd_cleanup_events");
        Ok(event_ids.len() as i64)
    })?;

    api::result_int64(context, deleted);
    Ok(())
}
