//! Wait/event matcher: `absurd_await_event` (table-valued, one row) and
//! `absurd_emit_event` (scalar). An event emitted before any await is
//! cached; an event emitted while waiters exist fans out to every one of
//! them and is never cached.

use crate::checkpoint::upsert_checkpoint;
use crate::error::EngineError;
use crate::ids;
use crate::sql;
use crate::validate;
use sqlite3ext_sys::sqlite3;
use sqlite_loadable::prelude::*;
use sqlite_loadable::{
    api,
    table::{BestIndexError, ConstraintOperator, IndexInfo, VTab, VTabArguments, VTabCursor},
    Error, Result,
};
use std::os::raw::c_int;

/// Sentinel "never" timestamp: 9999-12-31T00:00:00Z.
const FAR_FUTURE_MS: i64 = 253_402_214_400_000;

struct AwaitArgs {
    queue_name: String,
    task_id: String,
    run_id: String,
    step_name: String,
    event_name: String,
    timeout_seconds: Option<i64>,
}

struct AwaitResult {
    should_suspend: bool,
    payload: Option<String>,
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

fn is_terminal(state: &str) -> bool {
    matches!(state, "completed" | "failed" | "cancelled")
}

fn wait_exists(db: *mut sqlite3, queue_name: &str, task_id: &str, step_name: &str) -> Result<bool> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select 1 from absurd_waits where queue_name = ?1 and task_id = ?2 and step_name = ?3",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare wait lookup: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, task_id).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(3, step_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    for row in stmt.execute() {
        row.map_err(|err| Error::new_message(format!("{err:?}")))?;
        return Ok(true);
    }
    Ok(false)
}

fn oldest_event(db: *mut sqlite3, queue_name: &str, event_name: &str) -> Result<Option<(String, String)>> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select event_id, json(payload) from absurd_events
          where queue_name = ?1 and event_name = ?2
          order by created_at, event_id
          limit 1",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare event lookup: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, event_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("{err:?}")))?;
        return Ok(Some((
            row.get::<String>(0).map_err(|e| Error::new_message(format!("{e:?}")))?,
            row.get::<String>(1).map_err(|e| Error::new_message(format!("{e:?}")))?,
        )));
    }
    Ok(None)
}

fn await_event_impl(db: *mut sqlite3, args: AwaitArgs) -> Result<AwaitResult> {
    sql::in_transaction(db, || {
        let state = task_state(db, &args.queue_name, &args.task_id)?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", args.task_id)))?;
        if is_terminal(&state) {
            return Err(EngineError::Cancelled.into());
        }

        if wait_exists(db, &args.queue_name, &args.task_id, &args.step_name)? {
            // Re-entry: a live unmatched wait already covers this step.
            return Ok(AwaitResult { should_suspend: true, payload: None });
        }

        if let Some((event_id, payload)) = oldest_event(db, &args.queue_name, &args.event_name)? {
            sql::exec_with_bind_text(
                db,
                "delete from absurd_events where queue_name = ?1 and event_id = ?2",
                &[&args.queue_name, &event_id],
            )?;
            upsert_checkpoint(db, &args.queue_name, &args.task_id, &args.step_name, &payload, &args.run_id)?;
            return Ok(AwaitResult { should_suspend: false, payload: Some(payload) });
        }

        match args.timeout_seconds {
            Some(0) => {
                upsert_checkpoint(db, &args.queue_name, &args.task_id, &args.step_name, "null", &args.run_id)?;
                Ok(AwaitResult { should_suspend: false, payload: None })
            }
            timeout => {
                let now = sql::now_ms_from_db(db);
                let expires_at = timeout.map(|secs| now + secs.max(0).saturating_mul(1000));
                let available_at = expires_at.unwrap_or(FAR_FUTURE_MS);

                sql::exec_with_bind_text(
                    db,
                    "insert into absurd_waits (queue_name, task_id, run_id, step_name, event_name, expires_at, created_at)
                     values (?1, ?2, ?3, ?4, ?5, nullif(?6, ''), cast(?7 as integer))",
                    &[
                        &args.queue_name,
                        &args.task_id,
                        &args.run_id,
                        &args.step_name,
                        &args.event_name,
                        &expires_at.map(|v| v.to_string()).unwrap_or_default(),
                        &now.to_string(),
                    ],
                )?;

                sql::exec_with_bind_text(
                    db,
                    "update absurd_runs
                        set state = 'sleeping', wake_event = ?1, available_at = cast(?2 as integer), claimed_by = null
                      where queue_name = ?3 and run_id = ?4",
                    &[&args.event_name, &available_at.to_string(), &args.queue_name, &args.run_id],
                )?;
                sql::exec_with_bind_text(
                    db,
                    "update absurd_tasks set state = 'sleeping' where queue_name = ?1 and task_id = ?2",
                    &[&args.queue_name, &args.task_id],
                )?;

                Ok(AwaitResult { should_suspend: true, payload: None })
            }
        }
    })
}

/// `absurd_emit_event(queue, event_name, payload_json)`.
pub fn emit_event(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let event_name = api::value_text_notnull(values.get(1).ok_or_else(|| Error::new_message("event_name is required"))?)?.to_string();
    validate::event_name(&event_name).map_err(EngineError::into)?;
    let payload = values
        .get(2)
        .filter(|value| !api::value_is_null(value))
        .map(|value| api::value_text(value).map(|s| s.to_string()))
        .transpose()?
        .unwrap_or_else(|| "null".to_string());

    sql::in_transaction(db, || emit_event_impl(db, &queue_name, &event_name, &payload))?;
    api::result_null(context);
    Ok(())
}

fn emit_event_impl(db: *mut sqlite3, queue_name: &str, event_name: &str, payload: &str) -> Result<()> {
    struct Waiter {
        task_id: String,
        run_id: String,
        step_name: String,
    }

    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select task_id, run_id, step_name from absurd_waits
          where queue_name = ?1 and event_name = ?2
          order by created_at, task_id",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare waiter scan: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, event_name).map_err(|err| Error::new_message(format!("{err:?}")))?;

    let mut waiters = Vec::new();
    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("failed to read waiter row: {err:?}")))?;
        waiters.push(Waiter {
            task_id: row.get::<String>(0).map_err(|e| Error::new_message(format!("{e:?}")))?,
            run_id: row.get::<String>(1).map_err(|e| Error::new_message(format!("{e:?}")))?,
            step_name: row.get::<String>(2).map_err(|e| Error::new_message(format!("{e:?}")))?,
        });
    }

    if waiters.is_empty() {
        let now = sql::now_ms_from_db(db);
        let event_id = ids::new_id();
        sql::exec_with_bind_text(
            db,
            "insert into absurd_events (queue_name, event_id, event_name, payload, created_at)
             values (?1, ?2, ?3, jsonb(?4), cast(?5 as integer))",
            &[queue_name, &event_id, event_name, payload, &now.to_string()],
        )?;
        tracing::debug!(queue = %queue_name, event = %event_name, "event cached, no waiters");
        return Ok(());
    }

    let now = sql::now_ms_from_db(db);
    for waiter in &waiters {
        sql::exec_with_bind_text(
            db,
            "delete from absurd_waits where queue_name = ?1 and task_id = ?2 and step_name = ?3",
            &[queue_name, &waiter.task_id, &waiter.step_name],
        )?;
        upsert_checkpoint(db, queue_name, &waiter.task_id, &waiter.step_name, payload, &waiter.run_id)?;
        sql::exec_with_bind_text(
            db,
            "update absurd_runs
                set state = 'pending', claimed_by = null, claim_expires_at = null,
                    available_at = cast(?1 as integer), wake_event = ?2, event_payload = jsonb(?3)
              where queue_name = ?4 and run_id = ?5",
            &[&now.to_string(), event_name, payload, queue_name, &waiter.run_id],
        )?;
        sql::exec_with_bind_text(
            db,
            "update absurd_tasks set state = 'pending' where queue_name = ?1 and task_id = ?2",
            &[queue_name, &waiter.task_id],
        )?;
    }
    tracing::info!(queue = %queue_name, event = %event_name, waiters = waiters.len(), "event delivered to waiters");

    Ok(())
}

fn parse_await_args(values: &[*mut sqlite3_value]) -> Result<AwaitArgs> {
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let task_id = api::value_text_notnull(values.get(1).ok_or_else(|| Error::new_message("task_id is required"))?)?.to_string();
    let run_id = api::value_text_notnull(values.get(2).ok_or_else(|| Error::new_message("run_id is required"))?)?.to_string();
    let step_name = api::value_text_notnull(values.get(3).ok_or_else(|| Error::new_message("step_name is required"))?)?.to_string();
    validate::step_name(&step_name).map_err(EngineError::into)?;
    let event_name = api::value_text_notnull(values.get(4).ok_or_else(|| Error::new_message("event_name is required"))?)?.to_string();
    validate::event_name(&event_name).map_err(EngineError::into)?;
    let timeout_seconds = values.get(5).filter(|v| !api::value_is_null(v)).map(api::value_int64);

    Ok(AwaitArgs { queue_name, task_id, run_id, step_name, event_name, timeout_seconds })
}

static AWAIT_CREATE_SQL: &str = "CREATE TABLE x(should_suspend INTEGER, payload BLOB, queue_name TEXT hidden, task_id TEXT hidden, run_id TEXT hidden, step_name TEXT hidden, event_name TEXT hidden, timeout_seconds INTEGER hidden)";

#[repr(C)]
pub struct AwaitEventTable {
    base: sqlite3_vtab,
    db: *mut sqlite3,
}

impl<'vtab> VTab<'vtab> for AwaitEventTable {
    type Aux = ();
    type Cursor = AwaitEventCursor;

    fn connect(db: *mut sqlite3, _aux: Option<&Self::Aux>, _args: VTabArguments) -> Result<(String, AwaitEventTable)> {
        let base: sqlite3_vtab = unsafe { std::mem::zeroed() };
        Ok((AWAIT_CREATE_SQL.to_owned(), AwaitEventTable { base, db }))
    }

    fn destroy(&self) -> Result<()> {
        Ok(())
    }

    fn best_index(&self, mut info: IndexInfo) -> core::result::Result<(), BestIndexError> {
        let mut has_queue = false;
        for mut constraint in info.constraints() {
            let argv_index = match constraint.column_idx() {
                2 => 1,
                3 => 2,
                4 => 3,
                5 => 4,
                6 => 5,
                7 => 6,
                _ => continue,
            };
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
        info.set_estimated_rows(1);
        Ok(())
    }

    fn open(&mut self) -> Result<AwaitEventCursor> {
        Ok(AwaitEventCursor { base: unsafe { std::mem::zeroed() }, db: self.db, rowid: 0, result: None })
    }
}

#[repr(C)]
pub struct AwaitEventCursor {
    base: sqlite3_vtab_cursor,
    db: *mut sqlite3,
    rowid: i64,
    result: Option<AwaitResult>,
}

impl VTabCursor for AwaitEventCursor {
    fn filter(&mut self, _idx_num: c_int, _idx_str: Option<&str>, values: &[*mut sqlite3_value]) -> Result<()> {
        let args = parse_await_args(values)?;
        self.result = Some(await_event_impl(self.db, args)?);
        self.rowid = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.rowid += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.rowid > 0 || self.result.is_none()
    }

    fn column(&self, context: *mut sqlite3_context, i: c_int) -> Result<()> {
        let Some(result) = &self.result else {
            api::result_null(context);
            return Ok(());
        };
        match i {
            0 => api::result_int64(context, if result.should_suspend { 1 } else { 0 }),
            1 => match &result.payload {
                Some(value) => sql::result_json_value(self.db, context, value)?,
                None => api::result_null(context),
            },
            _ => api::result_null(context),
        }
        Ok(())
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.rowid)
    }
}
