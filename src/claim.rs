//! `absurd_claim_task` (table-valued) and `absurd_extend_claim` (scalar):
//! atomic selection of runnable runs, lease expiry, lease theft, and the
//! cancellation sweeps that run ahead of every claim.
//!
//! A `begin immediate` transaction applies cancellation policy, expires
//! stale claims (recreating a retry run or cancelling outright), then
//! selects and claims up to `count` candidates — all before the virtual
//! table yields its first row.

use crate::error::EngineError;
use crate::retry;
use crate::sql;
use crate::validate;
use serde_json::Value as JsonValue;
use sqlite3ext_sys::sqlite3;
use sqlite_loadable::prelude::*;
use sqlite_loadable::{
    api,
    table::{BestIndexError, ConstraintOperator, IndexInfo, VTab, VTabArguments, VTabCursor},
    Error, Result,
};
use std::os::raw::c_int;
use uuid::Uuid;

struct ClaimArgs {
    queue_name: String,
    worker_id: String,
    lease_seconds: i64,
    qty: i64,
}

struct ClaimResult {
    run_id: String,
    task_id: String,
    attempt: i64,
    task_name: String,
    params: String,
    retry_strategy: Option<String>,
    max_attempts: Option<i64>,
    headers: Option<String>,
    wake_event: Option<String>,
    event_payload: Option<String>,
}

fn parse_claim_args(values: &[*mut sqlite3_value]) -> Result<ClaimArgs> {
    let queue_name =
        api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?
            .to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;

    let worker_id = values
        .get(1)
        .filter(|value| !api::value_is_null(value))
        .map(|value| api::value_text(value).map(|s| s.trim().to_string()))
        .transpose()?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "worker".to_string());

    let lease_seconds = values
        .get(2)
        .filter(|value| !api::value_is_null(value))
        .map(api::value_int64)
        .unwrap_or_else(|| crate::config::current().default_lease_seconds)
        .max(0);

    let qty = values
        .get(3)
        .filter(|value| !api::value_is_null(value))
        .map(api::value_int64)
        .unwrap_or(1)
        .max(1);

    Ok(ClaimArgs { queue_name, worker_id, lease_seconds, qty })
}

fn apply_cancellation_rules(db: *mut sqlite3, queue_name: &str, now: i64) -> Result<()> {
    let now_value = now.to_string();
    sql::exec_with_bind_text(
        db,
        "with limits as (
            select task_id,
                   cast(jsonb_extract(cancellation, '$.max_delay_s') as real) as max_delay_s,
                   cast(jsonb_extract(cancellation, '$.max_duration_s') as real) as max_duration_s,
                   enqueue_at,
                   first_started_at
              from absurd_tasks
             where queue_name = ?1
               and state in ('pending','sleeping','running')
         ),
         to_cancel as (
            select task_id
              from limits
             where
               (
                 max_delay_s is not null
                 and first_started_at is null
                 and (?2 - enqueue_at) >= max_delay_s * 1000
               )
               or
               (
                 max_duration_s is not null
                 and (?2 - enqueue_at) >= max_duration_s * 1000
               )
         )
         update absurd_tasks
            set state = 'cancelled',
                cancelled_at = coalesce(cancelled_at, cast(?2 as integer))
          where queue_name = ?1
            and task_id in (select task_id from to_cancel)",
        &[queue_name, &now_value],
    )?;

    sql::exec_with_bind_text(
        db,
        "update absurd_runs
            set state = 'cancelled',
                claimed_by = null,
                claim_expires_at = null,
                wake_event = null
          where queue_name = ?1
            and task_id in (select task_id from absurd_tasks where queue_name = ?1 and state = 'cancelled')
            and state <> 'cancelled'",
        &[queue_name, &now_value],
    )?;

    sql::exec_with_bind_text(
        db,
        "delete from absurd_waits
          where queue_name = ?1
            and task_id in (select task_id from absurd_tasks where queue_name = ?1 and state = 'cancelled')",
        &[queue_name],
    )?;

    Ok(())
}

fn expire_claims(db: *mut sqlite3, queue_name: &str, now: i64) -> Result<()> {
    let now_value = now.to_string();
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select r.run_id,
                r.task_id,
                r.attempt,
                coalesce(r.claimed_by, '') as claimed_by,
                coalesce(r.claim_expires_at, 0) as claim_expires_at,
                coalesce(json(t.retry_strategy), '') as retry_strategy,
                coalesce(t.max_attempts, 0) as max_attempts,
                coalesce(json(t.cancellation), '') as cancellation,
                t.enqueue_at
           from absurd_runs r
           join absurd_tasks t
             on t.queue_name = r.queue_name
            and t.task_id = r.task_id
          where r.queue_name = ?1
            and r.state = 'running'
            and r.claim_expires_at is not null
            and r.claim_expires_at <= cast(?2 as integer)",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare expired claim query: {err:?}")))?;
    stmt.bind_text(1, queue_name)
        .map_err(|err| Error::new_message(format!("failed to bind queue_name: {err:?}")))?;
    stmt.bind_text(2, &now_value)
        .map_err(|err| Error::new_message(format!("failed to bind now: {err:?}")))?;

    struct Expired {
        run_id: String,
        task_id: String,
        attempt: i64,
        claimed_by: String,
        claim_expires_at: i64,
        retry_strategy: String,
        max_attempts: i64,
        cancellation: String,
        enqueue_at: i64,
    }

    let mut expired = Vec::new();
    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("failed to read expired claim row: {err:?}")))?;
        expired.push(Expired {
            run_id: row.get::<String>(0).map_err(|e| Error::new_message(format!("{e:?}")))?,
            task_id: row.get::<String>(1).map_err(|e| Error::new_message(format!("{e:?}")))?,
            attempt: row.get::<i64>(2).map_err(|e| Error::new_message(format!("{e:?}")))?,
            claimed_by: row.get::<String>(3).map_err(|e| Error::new_message(format!("{e:?}")))?,
            claim_expires_at: row.get::<i64>(4).map_err(|e| Error::new_message(format!("{e:?}")))?,
            retry_strategy: row.get::<String>(5).map_err(|e| Error::new_message(format!("{e:?}")))?,
            max_attempts: row.get::<i64>(6).map_err(|e| Error::new_message(format!("{e:?}")))?,
            cancellation: row.get::<String>(7).map_err(|e| Error::new_message(format!("{e:?}")))?,
            enqueue_at: row.get::<i64>(8).map_err(|e| Error::new_message(format!("{e:?}")))?,
        });
    }

    for claim in expired {
        tracing::info!(run_id = %claim.run_id, worker = %claim.claimed_by, "lease expired");

        let failure_reason = serde_json::json!({
            "name": "$ClaimTimeout",
            "message": "worker did not finish task within claim interval",
            "workerId": if claim.claimed_by.is_empty() { JsonValue::Null } else { JsonValue::String(claim.claimed_by.clone()) },
            "claimExpiredAt": if claim.claim_expires_at == 0 { JsonValue::Null } else { JsonValue::from(claim.claim_expires_at) },
            "attempt": claim.attempt,
        })
        .to_string();

        sql::exec_with_bind_text(
            db,
            "update absurd_runs
                set state = 'failed',
                    wake_event = null,
                    failed_at = cast(?1 as integer),
                    failure_reason = jsonb(?2),
                    claimed_by = null,
                    claim_expires_at = null
              where queue_name = ?3
                and run_id = ?4",
            &[&now_value, &failure_reason, queue_name, &claim.run_id],
        )?;

        sql::exec_with_bind_text(
            db,
            "delete from absurd_waits where queue_name = ?1 and run_id = ?2",
            &[queue_name, &claim.run_id],
        )?;

        let next_attempt = claim.attempt + 1;
        let max_attempts_opt = if claim.max_attempts == 0 { None } else { Some(claim.max_attempts) };
        let allow_retry = max_attempts_opt.map_or(true, |max| next_attempt <= max);

        let mut task_state = "failed".to_string();
        let mut last_attempt_run = claim.run_id.clone();
        let mut cancelled_at = String::new();
        let mut recorded_attempt = claim.attempt;

        if allow_retry {
            let delay_ms = retry::parse_retry_strategy(&claim.retry_strategy, claim.attempt)?;
            let next_available = (now + delay_ms).max(now);

            let max_duration_ms = retry::parse_cancellation_max_duration(&claim.cancellation)?;
            let cancel_task = max_duration_ms
                .map(|max| (next_available - claim.enqueue_at) >= max)
                .unwrap_or(false);

            if cancel_task {
                task_state = "cancelled".to_string();
                cancelled_at = now_value.clone();
            } else {
                let new_run_id = Uuid::now_v7().to_string();
                let run_state = if next_available > now { "sleeping" } else { "pending" };
                sql::exec_with_bind_text(
                    db,
                    "insert into absurd_runs (
                        queue_name, run_id, task_id, attempt, state, available_at, created_at
                     )
                     values (?1, ?2, ?3, cast(?4 as integer), ?5, cast(?6 as integer), cast(?7 as integer))",
                    &[
                        queue_name,
                        &new_run_id,
                        &claim.task_id,
                        &next_attempt.to_string(),
                        run_state,
                        &next_available.to_string(),
                        &now_value,
                    ],
                )?;
                task_state = run_state.to_string();
                last_attempt_run = new_run_id;
                recorded_attempt = next_attempt;
            }
        }

        sql::exec_with_bind_text(
            db,
            "update absurd_tasks
                set state = ?1,
                    attempts = case when attempts < cast(?2 as integer) then cast(?2 as integer) else attempts end,
                    last_attempt_run = ?3,
                    cancelled_at = case when ?4 = '' then cancelled_at else cast(?4 as integer) end
              where queue_name = ?5
                and task_id = ?6",
            &[&task_state, &recorded_attempt.to_string(), &last_attempt_run, &cancelled_at, queue_name, &claim.task_id],
        )?;
    }

    Ok(())
}

fn select_candidates(db: *mut sqlite3, queue_name: &str, now: i64, qty: i64) -> Result<Vec<ClaimResult>> {
    let now_value = now.to_string();
    let qty_value = qty.to_string();
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select r.run_id,
                r.task_id,
                r.attempt,
                t.task_name,
                json(t.params) as params,
                coalesce(json(t.retry_strategy), '') as retry_strategy,
                coalesce(t.max_attempts, 0) as max_attempts,
                coalesce(json(t.headers), '') as headers,
                coalesce(r.wake_event, '') as wake_event,
                coalesce(json(r.event_payload), '') as event_payload
           from absurd_runs r
           join absurd_tasks t
             on t.queue_name = r.queue_name
            and t.task_id = r.task_id
          where r.queue_name = ?1
            and r.state in ('pending','sleeping')
            and t.state in ('pending','sleeping','running')
            and r.available_at <= cast(?2 as integer)
          order by r.available_at, r.run_id
          limit cast(?3 as integer)",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare claim query: {err:?}")))?;

    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, &now_value).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(3, &qty_value).map_err(|err| Error::new_message(format!("{err:?}")))?;

    let mut results = Vec::new();
    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("failed to read row: {err:?}")))?;
        let max_attempts_raw = row.get::<i64>(6).map_err(|e| Error::new_message(format!("{e:?}")))?;
        let attempt = row.get::<i64>(2).map_err(|e| Error::new_message(format!("{e:?}")))?;
        if max_attempts_raw != 0 && attempt > max_attempts_raw {
            // Belt-and-braces: a prior terminator should already have failed
            // this task; skip rather than hand out an over-limit attempt.
            continue;
        }
        let retry_strategy_raw = row.get::<String>(5).map_err(|e| Error::new_message(format!("{e:?}")))?;
        let headers_raw = row.get::<String>(7).map_err(|e| Error::new_message(format!("{e:?}")))?;
        let wake_event_raw = row.get::<String>(8).map_err(|e| Error::new_message(format!("{e:?}")))?;
        let event_payload_raw = row.get::<String>(9).map_err(|e| Error::new_message(format!("{e:?}")))?;

        results.push(ClaimResult {
            run_id: row.get::<String>(0).map_err(|e| Error::new_message(format!("{e:?}")))?,
            task_id: row.get::<String>(1).map_err(|e| Error::new_message(format!("{e:?}")))?,
            attempt,
            task_name: row.get::<String>(3).map_err(|e| Error::new_message(format!("{e:?}")))?,
            params: row.get::<String>(4).map_err(|e| Error::new_message(format!("{e:?}")))?,
            retry_strategy: (!retry_strategy_raw.is_empty()).then_some(retry_strategy_raw),
            max_attempts: (max_attempts_raw != 0).then_some(max_attempts_raw),
            headers: (!headers_raw.is_empty()).then_some(headers_raw),
            wake_event: (!wake_event_raw.is_empty()).then_some(wake_event_raw),
            event_payload: (!event_payload_raw.is_empty()).then_some(event_payload_raw),
        });
    }

    Ok(results)
}

fn claim_task_impl(db: *mut sqlite3, args: ClaimArgs) -> Result<Vec<ClaimResult>> {
    let now = sql::now_ms_from_db(db);
    let claim_expires_at = now + args.lease_seconds.saturating_mul(1000);
    let claim_expires_value = claim_expires_at.to_string();
    let now_value = now.to_string();

    sql::in_transaction(db, || {
        apply_cancellation_rules(db, &args.queue_name, now)?;
        expire_claims(db, &args.queue_name, now)?;

        let candidates = select_candidates(db, &args.queue_name, now, args.qty)?;
        for candidate in &candidates {
            sql::exec_with_bind_text(
                db,
                "update absurd_runs
                    set state = 'running',
                        claimed_by = ?1,
                        claim_expires_at = cast(?2 as integer),
                        started_at = coalesce(started_at, cast(?3 as integer)),
                        wake_event = null,
                        event_payload = null
                  where queue_name = ?4
                    and run_id = ?5",
                &[
                    &args.worker_id,
                    &claim_expires_value,
                    &now_value,
                    &args.queue_name,
                    &candidate.run_id,
                ],
            )?;

            sql::exec_with_bind_text(
                db,
                "update absurd_tasks
                    set state = 'running',
                        attempts = case when attempts < cast(?1 as integer) then cast(?1 as integer) else attempts end,
                        first_started_at = coalesce(first_started_at, cast(?2 as integer)),
                        last_attempt_run = ?3
                  where queue_name = ?4
                    and task_id = ?5",
                &[&candidate.attempt.to_string(), &now_value, &candidate.run_id, &args.queue_name, &candidate.task_id],
            )?;

            sql::exec_with_bind_text(
                db,
                "delete from absurd_waits
                  where queue_name = ?1
                    and run_id = ?2
                    and expires_at is not null
                    and expires_at <= cast(?3 as integer)",
                &[&args.queue_name, &candidate.run_id, &now_value],
            )?;
        }

        tracing::debug!(queue = %args.queue_name, worker = %args.worker_id, claimed = candidates.len(), "absurd_claim_task");
        Ok(candidates)
    })
}

/// `absurd_extend_claim(queue, run_id, extend_seconds)`.
pub fn extend_claim(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let queue_name = api::value_text_notnull(values.get(0).ok_or_else(|| Error::new_message("queue_name is required"))?)?.to_string();
    validate::queue_name(&queue_name).map_err(EngineError::into)?;
    let run_id = api::value_text_notnull(values.get(1).ok_or_else(|| Error::new_message("run_id is required"))?)?.to_string();
    let extend_seconds = values.get(2).map(api::value_int64).unwrap_or(0).max(0);

    sql::in_transaction(db, || {
        let now = sql::now_ms_from_db(db);
        if task_is_cancelled_for_run(db, &queue_name, &run_id)? {
            return Err(EngineError::Cancelled.into());
        }
        let new_expiry = now + extend_seconds.saturating_mul(1000);
        sql::exec_with_bind_text(
            db,
            "update absurd_runs set claim_expires_at = cast(?1 as integer)
              where queue_name = ?2 and run_id = ?3",
            &[&new_expiry.to_string(), &queue_name, &run_id],
        )
    })?;
    tracing::trace!(run_id = %run_id, "absurd_extend_claim");
    api::result_null(context);
    Ok(())
}

pub(crate) fn task_is_cancelled_for_run(db: *mut sqlite3, queue_name: &str, run_id: &str) -> Result<bool> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select 1
           from absurd_runs r
           join absurd_tasks t on t.queue_name = r.queue_name and t.task_id = r.task_id
          where r.queue_name = ?1 and r.run_id = ?2 and t.state = 'cancelled'",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare cancellation check: {err:?}")))?;
    stmt.bind_text(1, queue_name).map_err(|err| Error::new_message(format!("{err:?}")))?;
    stmt.bind_text(2, run_id).map_err(|err| Error::new_message(format!("{err:?}")))?;
    for row in stmt.execute() {
        row.map_err(|err| Error::new_message(format!("{err:?}")))?;
        return Ok(true);
    }
    Ok(false)
}

static CLAIM_CREATE_SQL: &str = "CREATE TABLE x(run_id TEXT, task_id TEXT, attempt INTEGER, task_name TEXT, params BLOB, retry_strategy BLOB, max_attempts INTEGER, headers BLOB, wake_event TEXT, event_payload BLOB, queue_name TEXT hidden, worker_id TEXT hidden, lease_seconds INTEGER hidden, qty INTEGER hidden)";

enum ClaimColumns {
    RunId,
    TaskId,
    Attempt,
    TaskName,
    Params,
    RetryStrategy,
    MaxAttempts,
    Headers,
    WakeEvent,
    EventPayload,
}

fn claim_column(index: i32) -> Option<ClaimColumns> {
    match index {
        0 => Some(ClaimColumns::RunId),
        1 => Some(ClaimColumns::TaskId),
        2 => Some(ClaimColumns::Attempt),
        3 => Some(ClaimColumns::TaskName),
        4 => Some(ClaimColumns::Params),
        5 => Some(ClaimColumns::RetryStrategy),
        6 => Some(ClaimColumns::MaxAttempts),
        7 => Some(ClaimColumns::Headers),
        8 => Some(ClaimColumns::WakeEvent),
        9 => Some(ClaimColumns::EventPayload),
        _ => None,
    }
}

#[repr(C)]
pub struct ClaimTaskTable {
    base: sqlite3_vtab,
    db: *mut sqlite3,
}

impl<'vtab> VTab<'vtab> for ClaimTaskTable {
    type Aux = ();
    type Cursor = ClaimTaskCursor;

    fn connect(db: *mut sqlite3, _aux: Option<&Self::Aux>, _args: VTabArguments) -> Result<(String, ClaimTaskTable)> {
        let base: sqlite3_vtab = unsafe { std::mem::zeroed() };
        Ok((CLAIM_CREATE_SQL.to_owned(), ClaimTaskTable { base, db }))
    }

    fn destroy(&self) -> Result<()> {
        Ok(())
    }

    fn best_index(&self, mut info: IndexInfo) -> core::result::Result<(), BestIndexError> {
        let mut has_queue = false;
        for mut constraint in info.constraints() {
            let argv_index = match constraint.column_idx() {
                10 => 1,
                11 => 2,
                12 => 3,
                13 => 4,
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
        info.set_estimated_cost(10.0);
        info.set_estimated_rows(10);
        Ok(())
    }

    fn open(&mut self) -> Result<ClaimTaskCursor> {
        Ok(ClaimTaskCursor::new(self.db))
    }
}

#[repr(C)]
pub struct ClaimTaskCursor {
    base: sqlite3_vtab_cursor,
    db: *mut sqlite3,
    rowid: i64,
    results: Vec<ClaimResult>,
}

impl ClaimTaskCursor {
    fn new(db: *mut sqlite3) -> ClaimTaskCursor {
        let base: sqlite3_vtab_cursor = unsafe { std::mem::zeroed() };
        ClaimTaskCursor { base, db, rowid: 0, results: Vec::new() }
    }
}

impl VTabCursor for ClaimTaskCursor {
    fn filter(&mut self, _idx_num: c_int, _idx_str: Option<&str>, values: &[*mut sqlite3_value]) -> Result<()> {
        let args = parse_claim_args(values)?;
        self.results = claim_task_impl(self.db, args)?;
        self.rowid = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.rowid += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.rowid as usize >= self.results.len()
    }

    fn column(&self, context: *mut sqlite3_context, i: c_int) -> Result<()> {
        let Some(result) = self.results.get(self.rowid as usize) else {
            api::result_null(context);
            return Ok(());
        };
        match claim_column(i) {
            Some(ClaimColumns::RunId) => api::result_text(context, &result.run_id)?,
            Some(ClaimColumns::TaskId) => api::result_text(context, &result.task_id)?,
            Some(ClaimColumns::Attempt) => api::result_int64(context, result.attempt),
            Some(ClaimColumns::TaskName) => api::result_text(context, &result.task_name)?,
            Some(ClaimColumns::Params) => sql::result_json_value(self.db, context, &result.params)?,
            Some(ClaimColumns::RetryStrategy) => match &result.retry_strategy {
                Some(value) => sql::result_json_value(self.db, context, value)?,
                None => api::result_null(context),
            },
            Some(ClaimColumns::MaxAttempts) => match result.max_attempts {
                Some(value) => api::result_int64(context, value),
                None => api::result_null(context),
            },
            Some(ClaimColumns::Headers) => match &result.headers {
                Some(value) => sql::result_json_value(self.db, context, value)?,
                None => api::result_null(context),
            },
            Some(ClaimColumns::WakeEvent) => match &result.wake_event {
                Some(value) => api::result_text(context, value)?,
                None => api::result_null(context),
            },
            Some(ClaimColumns::EventPayload) => match &result.event_payload {
                Some(value) => sql::result_json_value(self.db, context, value)?,
                None => api::result_null(context),
            },
            None => api::result_null(context),
        }
        Ok(())
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.rowid)
    }
}
