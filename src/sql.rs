//! Low-level helpers shared by every engine module: binding text parameters,
//! executing batches inside the caller's connection, and reading the clock.
//!
//! Every mutating statement in this crate binds its parameters as text and
//! leans on `cast(?n as integer)` / `jsonb(?n)` inside the SQL itself rather
//! than on typed bind helpers — this keeps every module's SQL self-describing
//! about the types it expects.

use sqlite3ext_sys::sqlite3;
use sqlite_loadable::{exec::Statement, Error, Result};

/// Executes `sql` against `db`, binding `params[i]` to `?{i+1}` as text.
pub fn exec_with_bind_text(db: *mut sqlite3, sql: &str, params: &[&str]) -> Result<()> {
    let mut stmt = Statement::prepare(db, sql)
        .map_err(|err| Error::new_message(format!("failed to prepare statement: {err:?}")))?;
    for (i, value) in params.iter().enumerate() {
        stmt.bind_text((i + 1) as i32, value)
            .map_err(|err| Error::new_message(format!("failed to bind parameter {i}: {err:?}")))?;
    }
    for row in stmt.execute() {
        row.map_err(|err| Error::new_message(format!("failed to execute statement: {err:?}")))?;
    }
    Ok(())
}

/// Wraps `f` in `begin immediate` / `commit`, rolling back on any error.
pub fn in_transaction<T>(
    db: *mut sqlite3,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    exec_with_bind_text(db, "begin immediate", &[])?;
    match f() {
        Ok(value) => {
            exec_with_bind_text(db, "commit", &[])?;
            Ok(value)
        }
        Err(err) => {
            let _ = exec_with_bind_text(db, "rollback", &[]);
            Err(err)
        }
    }
}

/// Current engine time: the `fake_now` override in `absurd_settings` if set,
/// otherwise wall-clock time. Every component reads time through here; none
/// call `SystemTime::now()` directly (see `absurd_set_fake_now`).
pub fn now_ms_from_db(db: *mut sqlite3) -> i64 {
    let mut stmt = match Statement::prepare(
        db,
        "select fake_now from absurd_settings where id = 0 and fake_now is not null",
    ) {
        Ok(stmt) => stmt,
        Err(_) => return wall_clock_ms(),
    };
    for row in stmt.execute() {
        if let Ok(row) = row {
            if let Ok(fake_now) = row.get::<i64>(0) {
                return fake_now;
            }
        }
    }
    wall_clock_ms()
}

fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Sets a JSON text result on `context`. The text is expected to already be
/// normalized JSON (produced via SQLite's `json()`/`jsonb()` functions
/// upstream) so no re-encoding happens at this boundary.
pub fn result_json_value(_db: *mut sqlite3, context: *mut sqlite_loadable::prelude::sqlite3_context, value: &str) -> Result<()> {
    sqlite_loadable::api::result_text(context, value)
}
