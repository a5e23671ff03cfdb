//! Run termination and rescheduling: `absurd_complete_run`,
//! `absurd_fail_run`, `absurd_schedule_run`.

use crate::error::EngineError;
use crate::retry;
use crate::sql;
use crate::validate;
use sqlite3ext_sys::sqlite3;
use sqlite_loadable::prelude::*;
use sqlite_loadable::{api, Error, Result};
use uuid::Uuid;

struct RunContext {
    task_id: String,
    task_state: String,
    attempt: i64,
    max_attempts: i64,
    retry_strategy: String,
    cancellation: String,
    enqueue_at: i64,
}

fn load_run_context(db: *mut sqlite3, queue_name: &str, run_id: &str) -> Result<RunContext> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select t.task_id, t.state, r.attempt,
                coalesce(t.max_attempts, 0), coalesce(json(t.retry_strategy), ''),
                coalesce(json(t.cancellation), ''), t.enqueue_at
           from absurd_runs r
           join absurd_tasks t on t.queue_name = r.queue_name and t.task_id = r.task_id
          where r.queue_name = ?1 and r.run_id = ?2",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare run lookup: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, run_id).map_err(|err| Error::new_message(format!("{err:?}")))?;

    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("{err:?}")))?;
        return Ok(RunContext {
            task_id: row.get::<String>(0).map_err(|e| Error::new_message(format!("{e:?}")))?,
            task_state: row.get::<String>(1).map_err(|e| Error::new_message(format!("{e:?}")))?,
            attempt: row.get::<i64>(2).map_err(|e| Error::new_message(format!("{e:?}")))?,
            max_attempts: row.get::<i64>(3).map_err(|e| Error::new_message(format!("{e:?}")))?,
            retry_strategy: row.get::<String>(4).map_err(|e| Error::new_message(format!("{e:?}")))?,
            cancellation: row.get::<String>(5).map_err(|e| Error::new_message(format!("{e:?}")))?,
            enqueue_at: row.get::<i64>(6).map_err(|e| Error::new_message(format!("{e:?}")))?,
        });
    }
    Err(EngineError::NotFound(format!("run {run_id}")).into())
}

fn is_terminal(state: &str) -> bool {
    matches!(state, "completed" | "failed" | "cancelled")
}

/// `absurd_complete_run(queue, run_id, result_json)`.
pub fn complete_run(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let run_id = api::value_text_notnull(values.get(1).ok_or_else(|| Error::new_message("run_id is required"))?)?.to_string();
    let result_json = values
        .get(2)
        .filter(|v| !api::value_is_null(v))
        .map(|v| api::value_text(v).map(|s| s.to_string()))
        .transpose()?
        .unwrap_or_else(|| "null".to_string());

    sql::in_transaction(db, || {
        let run = load_run_context(db, &queue_name, &run_id)?;
        if is_terminal(&run.task_state) {
            return Err(EngineError::Cancelled.into());
        }

        let now = sql::now_ms_from_db(db);
        sql::exec_with_bind_text(
            db,
            "update absurd_runs
                set state = 'completed', completed_at = cast(?1 as integer), result = jsonb(?2), claimed_by = null
              where queue_name = ?3 and run_id = ?4",
            &[&now.to_string(), &result_json, &queue_name, &run_id],
        )?;
        sql::exec_with_bind_text(
            db,
            "update absurd_tasks set state = 'completed', completed_payload = jsonb(?1) where queue_name = ?2 and task_id = ?3",
            &[&result_json, &queue_name, &run.task_id],
        )?;
        sql::exec_with_bind_text(
            db,
            "delete from absurd_waits where queue_name = ?1 and task_id = ?2",
            &[&queue_name, &run.task_id],
        )?;
        tracing::debug!(task_id = %run.task_id, run_id = %run_id, "absurd_complete_run");
        Ok(())
    })?;

    api::result_null(context);
    Ok(())
}

/// `absurd_fail_run(queue, run_id, reason_json, retry_after_seconds?)`.
pub fn fail_run(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let run_id = api::value_text_notnull(values.get(1).ok_or_else(|| Error::new_message("run_id is required"))?)?.to_string();
    let reason_json = values
        .get(2)
        .filter(|v| !api::value_is_null(v))
        .map(|v| api::value_text(v).map(|s| s.to_string()))
        .transpose()?
        .unwrap_or_else(|| "null".to_string());
    let retry_after_seconds = values.get(3).filter(|v| !api::value_is_null(v)).map(api::value_int64);

    sql::in_transaction(db, || {
        let run = load_run_context(db, &queue_name, &run_id)?;
        let now = sql::now_ms_from_db(db);

        if is_terminal(&run.task_state) {
            if run.task_state == "cancelled" {
                sql::exec_with_bind_text(
                    db,
                    "update absurd_runs set state = 'cancelled', claimed_by = null where queue_name = ?1 and run_id = ?2",
                    &[&queue_name, &run_id],
                )?;
            }
            // Already completed or failed: the task is terminal and monotonic
            // (§3) — don't resurrect it with a retry run.
            return Ok(());
        }

        sql::exec_with_bind_text(
            db,
            "update absurd_runs
                set state = 'failed', failed_at = cast(?1 as integer), failure_reason = jsonb(?2), claimed_by = null
              where queue_name = ?3 and run_id = ?4",
            &[&now.to_string(), &reason_json, &queue_name, &run_id],
        )?;

        let max_attempts_opt = (run.max_attempts != 0).then_some(run.max_attempts);
        if max_attempts_opt.map_or(false, |max| run.attempt >= max) {
            sql::exec_with_bind_text(
                db,
                "update absurd_tasks set state = 'failed' where queue_name = ?1 and task_id = ?2",
                &[&queue_name, &run.task_id],
            )?;
            tracing::info!(task_id = %run.task_id, attempts = run.attempt, "task failed, max_attempts reached");
            return Ok(());
        }

        let delay_ms = match retry_after_seconds {
            Some(secs) => secs.max(0).saturating_mul(1000),
            None => retry::parse_retry_strategy(&run.retry_strategy, run.attempt)?,
        };
        let next_available = (now + delay_ms).max(now);

        let max_duration_ms = retry::parse_cancellation_max_duration(&run.cancellation)?;
        let cancel_task = max_duration_ms
            .map(|max| (next_available - run.enqueue_at) >= max)
            .unwrap_or(false);

        if cancel_task {
            sql::exec_with_bind_text(
                db,
                "update absurd_tasks set state = 'cancelled', cancelled_at = coalesce(cancelled_at, cast(?1 as integer))
                  where queue_name = ?2 and task_id = ?3",
                &[&now.to_string(), &queue_name, &run.task_id],
            )?;
            tracing::info!(task_id = %run.task_id, "cancelled: retry would exceed max_duration_s");
            return Ok(());
        }

        let next_attempt = run.attempt + 1;
        let new_run_id = Uuid::now_v7().to_string();
        let run_state = if next_available > now { "sleeping" } else { "pending" };
        sql::exec_with_bind_text(
            db,
            "insert into absurd_runs (queue_name, run_id, task_id, attempt, state, available_at, created_at)
             values (?1, ?2, ?3, cast(?4 as integer), ?5, cast(?6 as integer), cast(?7 as integer))",
            &[
                &queue_name,
                &new_run_id,
                &run.task_id,
                &next_attempt.to_string(),
                run_state,
                &next_available.to_string(),
                &now.to_string(),
            ],
        )?;
        sql::exec_with_bind_text(
            db,
            "update absurd_tasks set state = ?1, last_attempt_run = ?2 where queue_name = ?3 and task_id = ?4",
            &[run_state, &new_run_id, &queue_name, &run.task_id],
        )?;
        tracing::debug!(task_id = %run.task_id, next_attempt, delay_ms, "absurd_fail_run scheduled retry");
        Ok(())
    })?;

    api::result_null(context);
    Ok(())
}

/// `absurd_schedule_run(queue, run_id, wake_at_ms)`. Does not consume an attempt.
pub fn schedule_run(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let run_id = api::value_text_notnull(values.get(1).ok_or_else(|| Error::new_message("run_id is required"))?)?.to_string();
    let wake_at = api::value_int64(values.get(2).ok_or_else(|| Error::new_message("wake_at_ms is required"))?);

    sql::in_transaction(db, || {
        let run = load_run_context(db, &queue_name, &run_id)?;
        if is_terminal(&run.task_state) {
            return Err(EngineError::Cancelled.into());
        }

        let now = sql::now_ms_from_db(db);
        let max_duration_ms = retry::parse_cancellation_max_duration(&run.cancellation)?;
        let cancel_task = max_duration_ms.map(|max| (wake_at - run.enqueue_at) >= max).unwrap_or(false);

        if cancel_task {
            sql::exec_with_bind_text(
                db,
                "update absurd_tasks set state = 'cancelled', cancelled_at = coalesce(cancelled_at, cast(?1 as integer))
                  where queue_name = ?2 and task_id = ?3",
                &[&now.to_string(), &queue_name, &run.task_id],
            )?;
            sql::exec_with_bind_text(
                db,
                "update absurd_runs set state = 'cancelled', claimed_by = null where queue_name = ?1 and run_id = ?2",
                &[&queue_name, &run_id],
            )?;
            tracing::info!(task_id = %run.task_id, "cancelled: scheduled wake would exceed max_duration_s");
            return Ok(());
        }

        sql::exec_with_bind_text(
            db,
            "update absurd_runs set state = 'sleeping', available_at = cast(?1 as integer), claimed_by = null
              where queue_name = ?2 and run_id = ?3",
            &[&wake_at.to_string(), &queue_name, &run_id],
        )?;
        sql::exec_with_bind_text(
            db,
            "update absurd_tasks set state = 'sleeping' where queue_name = ?1 and task_id = ?2",
            &[&queue_name, &run.task_id],
        )?;
        tracing::trace!(task_id = %run.task_id, run_id = %run_id, wake_at, "absurd_schedule_run");
        Ok(())
    })?;

    api::result_null(context);
    Ok(())
}
