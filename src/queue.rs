//! Queue registry: `absurd_create_queue`, `absurd_drop_queue` (scalar) and
//! `absurd_list_queues` (table-valued, no arguments — every row in every
//! engine table is scoped by `queue_name` so dropping a queue cascades by
//! filtering every dependent table on it).

use crate::error::EngineError;
use crate::validate;
use sqlite3ext_sys::sqlite3;
use sqlite_loadable::prelude::*;
use sqlite_loadable::{
    api,
    table::{IndexInfo, VTab, VTabArguments, VTabCursor},
    BestIndexError, Error, Result,
};
use std::os::raw::c_int;

pub fn create_queue(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let name = arg_text(values, 0, "queue_name")?;
    validate::queue_name(&name).map_err(EngineError::into)?;

    let now = crate::sql::now_ms_from_db(db);
    crate::sql::in_transaction(db, || {
        crate::sql::exec_with_bind_text(
            db,
            "insert into absurd_queues (queue_name, created_at)
             values (?1, cast(?2 as integer))
             on conflict (queue_name) do nothing",
            &[&name, &now.to_string()],
        )
    })?;
    tracing::debug!(queue = %name, "absurd_create_queue");
    api::result_null(context);
    Ok(())
}

pub fn drop_queue(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let name = arg_text(values, 0, "queue_name")?;
    validate::queue_name(&name).map_err(EngineError::into)?;

    crate::sql::in_transaction(db, || {
        for table in [
            "absurd_checkpoints",
            "absurd_waits",
            "absurd_runs",
            "absurd_tasks",
            "absurd_events",
        ] {
            crate::sql::exec_with_bind_text(
                db,
                &format!("delete from {table} where queue_name = ?1"),
                &[&name],
            )?;
        }
        crate::sql::exec_with_bind_text(
            db,
            "delete from absurd_queues where queue_name = ?1",
            &[&name],
        )
    })?;
    tracing::info!(queue = %name, "absurd_drop_queue");
    api::result_null(context);
    Ok(())
}

fn arg_text(values: &[*mut sqlite3_value], idx: usize, what: &str) -> Result<String> {
    let value = values
        .get(idx)
        .ok_or_else(|| Error::new_message(format!("{what} is required")))?;
    Ok(api::value_text_notnull(value)?.to_string())
}

struct QueueRow {
    queue_name: String,
    created_at: i64,
}

fn list_all(db: *mut sqlite3) -> Result<Vec<QueueRow>> {
    let mut stmt = sqlite_loadable::exec::Statement::prepare(
        db,
        "select queue_name, created_at from absurd_queues order by created_at, queue_name",
    )
    .map_err(|err| Error::new_message(format!("failed to prepare list_queues: {err:?}")))?;

    let mut rows = Vec::new();
    for row in stmt.execute() {
        let row = row.map_err(|err| Error::new_message(format!("failed to read queue row: {err:?}")))?;
        rows.push(QueueRow {
            queue_name: row
                .get::<String>(0)
                .map_err(|err| Error::new_message(format!("failed to read queue_name: {err:?}")))?,
            created_at: row
                .get::<i64>(1)
                .map_err(|err| Error::new_message(format!("failed to read created_at: {err:?}")))?,
        });
    }
    Ok(rows)
}

static LIST_QUEUES_CREATE_SQL: &str = "CREATE TABLE x(queue_name TEXT, created_at INTEGER)";

#[repr(C)]
pub struct ListQueuesTable {
    base: sqlite3_vtab,
    db: *mut sqlite3,
}

impl<'vtab> VTab<'vtab> for ListQueuesTable {
    type Aux = ();
    type Cursor = ListQueuesCursor;

    fn connect(
        db: *mut sqlite3,
        _aux: Option<&Self::Aux>,
        _args: VTabArguments,
    ) -> Result<(String, ListQueuesTable)> {
        let base: sqlite3_vtab = unsafe { std::mem::zeroed() };
        Ok((LIST_QUEUES_CREATE_SQL.to_owned(), ListQueuesTable { base, db }))
    }

    fn destroy(&self) -> Result<()> {
        Ok(())
    }

    fn best_index(&self, mut info: IndexInfo) -> core::result::Result<(), BestIndexError> {
        info.set_estimated_cost(1.0);
        info.set_estimated_rows(8);
        Ok(())
    }

    fn open(&mut self) -> Result<ListQueuesCursor> {
        Ok(ListQueuesCursor::new(self.db))
    }
}

#[repr(C)]
pub struct ListQueuesCursor {
    base: sqlite3_vtab_cursor,
    db: *mut sqlite3,
    rowid: i64,
    rows: Vec<QueueRow>,
}

impl ListQueuesCursor {
    fn new(db: *mut sqlite3) -> ListQueuesCursor {
        let base: sqlite3_vtab_cursor = unsafe { std::mem::zeroed() };
        ListQueuesCursor { base, db, rowid: 0, rows: Vec::new() }
    }
}

impl VTabCursor for ListQueuesCursor {
    fn filter(
        &mut self,
        _idx_num: c_int,
        _idx_str: Option<&str>,
        _values: &[*mut sqlite3_value],
    ) -> Result<()> {
        self.rows = list_all(self.db)?;
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
            0 => api::result_text(context, &row.queue_name)?,
            1 => api::result_int64(context, row.created_at),
            _ => api::result_null(context),
        }
        Ok(())
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.rowid)
    }
}
