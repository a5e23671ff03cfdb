//! `absurd_spawn_task` — inserts a task and its first run, or returns the
//! existing task when an idempotency key collides.

use crate::error::EngineError;
use crate::ids;
use crate::validate;
use serde::Deserialize;
use sqlite3ext_sys::sqlite3;
use sqlite_loadable::prelude::*;
use sqlite_loadable::{
    api,
    table::{BestIndexError, ConstraintOperator, IndexInfo, VTab, VTabArguments, VTabCursor},
    Error, Result,
};
use std::os::raw::c_int;

#[derive(Debug, Default, Deserialize)]
struct SpawnOptions {
    max_attempts: Option<i64>,
    retry_strategy: Option<serde_json::Value>,
    headers: Option<serde_json::Value>,
    cancellation: Option<serde_json::Value>,
    idempotency_key: Option<String>,
    #[serde(alias = "initial_delay_s")]
    initial_delay: Option<f64>,
}

struct SpawnArgs {
    queue_name: String,
    task_name: String,
    params: String,
    options: SpawnOptions,
}

struct SpawnResult {
    task_id: String,
    run_id: String,
    attempt: i64,
    created: bool,
}

fn parse_args(values: &[*mut sqlite3_value]) -> Result<SpawnArgs> {
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| {
        Error::new_message("queue_name is required")
    })?)?
    .to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;

    let task_name = api::value_text_notnull(values.get(1).ok_or_else(|| {
        Error::new_message("task_name is required")
    })?)?
    .to_string();
    validate::task_name(&task_name).map_err(EngineError::into)?;

    let params = values
        .get(2)
        .filter(|value| !api::value_is_null(value))
        .map(|value| api::value_text(value).map(|s| s.to_string()))
        .transpose()?
        .unwrap_or_else(|| "null".to_string());
    validate::optional_json(Some(&params), "params").map_err(EngineError::into)?;

    let options_text = values
        .get(3)
        .filter(|value| !api::value_is_null(value))
        .map(|value| api::value_text(value).map(|s| s.to_string()))
        .transpose()?;
    validate::optional_json(options_text.as_deref(), "options").map_err(EngineError::into)?;
    let options: SpawnOptions = match &options_text {
        Some(text) => serde_json::from_str(text).map_err(EngineError::from)?,
        None => SpawnOptions::default(),
    };

    Ok(SpawnArgs { queue_name, task_name, params, options })
}

fn existing_by_idempotency_key(
    db: *mut sqlite3,
    queue_name: &str,
    key: &str,
) -> Result<Option<SpawnResult>> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select t.task_id, r.run_id, r.attempt
           from absurd_tasks t
           join absurd_runs r
             on r.queue_name = t.queue_name and r.run_id = t.last_attempt_run
          where t.queue_name = ?1
            and t.idempotency_key = ?2",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare idempotency lookup: {err:?}")))?;
    stmt.bind_text(1, queue_name)
        .map_err(|err| Error::new_message(format!("failed to bind queue_name: {err:?}")))?;
    stmt.bind_text(2, key)
        .map_err(|err| Error::new_message(format!("failed to bind idempotency_key: {err:?}")))?;

    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("failed to read row: {err:?}")))?;
        return Ok(Some(SpawnResult {
            task_id: row.get::<String>(0).map_err(|err| Error::new_message(format!("{err:?}")))?,
            run_id: row.get::<String>(1).map_err(|err| Error::new_message(format!("{err:?}")))?,
            attempt: row.get::<i64>(2).map_err(|err| Error::new_message(format!("{err:?}")))?,
            created: false,
        }));
    }
    Ok(None)
}

fn queue_exists(db: *mut sqlite3, queue_name: &str) -> Result<bool> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select 1 from absurd_queues where queue_name = ?1",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare queue lookup: {err:?}")))?;
    stmt.bind_text(1, queue_name)
        .map_err(|err| Error::new_message(format!("failed to bind queue_name: {err:?}")))?;
    for row in stmt.execute() {
        row.map_err(|err| Error::new_message(format!("failed to read row: {err:?}")))?;
        return Ok(true);
    }
    Ok(false)
}

fn spawn_impl(db: *mut sqlite3, args: SpawnArgs) -> Result<SpawnResult> {
    crate::sql::in_transaction(db, || {
        if !queue_exists(db, &args.queue_name)? {
            return Err(EngineError::NotFound(format!("queue {}", args.queue_name)).into());
        }

        if let Some(key) = &args.options.idempotency_key {
            if let Some(existing) = existing_by_idempotency_key(db, &args.queue_name, key)? {
                return Ok(existing);
            }
        }

        let now = crate::sql::now_ms_from_db(db);
        let task_id = ids::new_id();
        let run_id = ids::new_id();
        let delay_ms = args
            .options
            .initial_delay
            .map(|secs| (secs.max(0.0) * 1000.0).round() as i64)
            .unwrap_or(0);
        let available_at = now + delay_ms;

        // `max_attempts` defaults to the process-wide `EngineOptions` value
        // (5 unless a host overrides it via `register_functions_with_options`).
        let max_attempts = args
            .options
            .max_attempts
            .unwrap_or(crate::config::current().default_max_attempts);
        let retry_strategy = args.options.retry_strategy.map(|v| v.to_string());
        let headers = args.options.headers.map(|v| v.to_string());
        let cancellation = args.options.cancellation.map(|v| v.to_string());
        let idempotency_key = args.options.idempotency_key.clone();

        crate::sql::exec_with_bind_text(
            db,
            "insert into absurd_tasks (
                queue_name, task_id, task_name, params, headers, retry_strategy,
                max_attempts, cancellation, idempotency_key, enqueue_at, state,
                attempts, last_attempt_run
             )
             values (
                ?1, ?2, ?3, jsonb(?4),
                jsonb(nullif(?5, '')),
                jsonb(nullif(?6, '')),
                cast(?7 as integer),
                jsonb(nullif(?8, '')),
                nullif(?9, ''),
                cast(?10 as integer),
                'pending', 0, ?11
             )",
            &[
                &args.queue_name,
                &task_id,
                &args.task_name,
                &args.params,
                headers.as_deref().unwrap_or(""),
                retry_strategy.as_deref().unwrap_or(""),
                &max_attempts.to_string(),
                cancellation.as_deref().unwrap_or(""),
                idempotency_key.as_deref().unwrap_or(""),
                &now.to_string(),
                &run_id,
            ],
        )?;

        crate::sql::exec_with_bind_text(
            db,
            "insert into absurd_runs (
                queue_name, run_id, task_id, attempt, state, available_at, created_at
             )
             values (?1, ?2, ?3, 1, 'pending', cast(?4 as integer), cast(?5 as integer))",
            &[&args.queue_name, &run_id, &task_id, &available_at.to_string(), &now.to_string()],
        )?;

        tracing::debug!(queue = %args.queue_name, task_id = %task_id, "absurd_spawn_task");
        Ok(SpawnResult { task_id, run_id, attempt: 1, created: true })
    })
}

static SPAWN_CREATE_SQL: &str = "CREATE TABLE x(task_id TEXT, run_id TEXT, attempt INTEGER, created INTEGER, queue_name TEXT hidden, task_name TEXT hidden, params TEXT hidden, options TEXT hidden)";

#[repr(C)]
pub struct SpawnTaskTable {
    base: sqlite3_vtab,
    db: *mut sqlite3,
}

impl<'vtab> VTab<'vtab> for SpawnTaskTable {
    type Aux = ();
    type Cursor = SpawnTaskCursor;

    fn connect(
        db: *mut sqlite3,
        _aux: Option<&Self::Aux>,
        _args: VTabArguments,
    ) -> Result<(String, SpawnTaskTable)> {
        let base: sqlite3_vtab = unsafe { std::mem::zeroed() };
        Ok((SPAWN_CREATE_SQL.to_owned(), SpawnTaskTable { base, db }))
    }

    fn destroy(&self) -> Result<()> {
        Ok(())
    }

    fn best_index(&self, mut info: IndexInfo) -> core::result::Result<(), BestIndexError> {
        let mut has_queue = false;
        for mut constraint in info.constraints() {
            let argv_index = match constraint.column_idx() {
                4 => 1,
                5 => 2,
                6 => 3,
                7 => 4,
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
        info.set_estimated_cost(1.0);
        info.set_estimated_rows(1);
        Ok(())
    }

    fn open(&mut self) -> Result<SpawnTaskCursor> {
        Ok(SpawnTaskCursor::new(self.db))
    }
}

#[repr(C)]
pub struct SpawnTaskCursor {
    base: sqlite3_vtab_cursor,
    db: *mut sqlite3,
    rowid: i64,
    result: Option<SpawnResult>,
}

impl SpawnTaskCursor {
    fn new(db: *mut sqlite3) -> SpawnTaskCursor {
        let base: sqlite3_vtab_cursor = unsafe { std::mem::zeroed() };
        SpawnTaskCursor { base, db, rowid: 0, result: None }
    }
}

impl VTabCursor for SpawnTaskCursor {
    fn filter(
        &mut self,
        _idx_num: c_int,
        _idx_str: Option<&str>,
        values: &[*mut sqlite3_value],
    ) -> Result<()> {
        let args = parse_args(values)?;
        self.result = Some(spawn_impl(self.db, args)?);
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
            0 => api::result_text(context, &result.task_id)?,
            1 => api::result_text(context, &result.run_id)?,
            2 => api::result_int64(context, result.attempt),
            3 => api::result_int64(context, if result.created { 1 } else { 0 }),
            _ => api::result_null(context),
        }
        Ok(())
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.rowid)
    }
}
