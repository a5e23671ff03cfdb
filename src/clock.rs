//! `absurd_set_fake_now` — the clock override every other component reads
//! through (`sql::now_ms_from_db`). Writing `NULL` clears the override and
//! reverts to wall-clock time.

use sqlite_loadable::prelude::*;
use sqlite_loadable::{api, Result};
use std::os::raw::c_int;

pub fn set_fake_now(context: *mut sqlite3_context, values: &[*mut sqlite3_value]) -> Result<()> {
    let db = api::context_db_handle(context);
    let fake_now = values.first().and_then(|value| {
        if api::value_is_null(value) {
            None
        } else {
            Some(api::value_int64(value))
        }
    });

    match fake_now {
        Some(ms) => {
            crate::sql::exec_with_bind_text(
                db,
                "update absurd_settings set fake_now = cast(?1 as integer) where id = 0",
                &[&ms.to_string()],
            )?;
            tracing::debug!(fake_now = ms, "absurd_set_fake_now");
        }
        None => {
            crate::sql::exec_with_bind_text(
                db,
                "update absurd_settings set fake_now = null where id = 0",
                &[],
            )?;
            tracing::debug!("absurd_set_fake_now cleared");
        }
    }

    api::result_null(context);
    Ok(())
}

pub const SET_FAKE_NOW_ARGS: c_int = 1;
