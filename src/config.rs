//! Process-wide defaults. These are not per-call SQL arguments — they're
//! compiled-in defaults a host can override before calling
//! [`crate::register_functions`].
//!
//! SQL scalar/table functions only carry a raw `sqlite3*` across the FFI
//! boundary, so there's no call-site slot to thread an `EngineOptions`
//! through to `claim.rs`/`spawn.rs`. Instead `register_functions_with_options`
//! installs the chosen options into a process-wide [`OnceLock`], mirroring a
//! memoized single-instance factory, as `tasks/src/lib.rs`'s
//! `get_task_manager()` does with a `OnceCell`, rather than passing config
//! through every call.

use std::sync::OnceLock;

static ENGINE_OPTIONS: OnceLock<EngineOptions> = OnceLock::new();

/// Installs the process-wide defaults. Only the first call takes effect —
/// later calls (e.g. a second `register_functions` on another connection in
/// the same process) are no-ops, matching the once-per-process nature of a
/// loaded `cdylib`.
pub fn install(options: EngineOptions) {
    let _ = ENGINE_OPTIONS.set(options);
}

/// The installed options, or compiled-in defaults if `install` was never
/// called (e.g. a unit test that exercises a module directly).
pub fn current() -> EngineOptions {
    ENGINE_OPTIONS.get().cloned().unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Lease length used by `absurd_claim_task` when the caller passes
    /// `lease_seconds = 0` or omits it.
    pub default_lease_seconds: i64,
    /// `max_attempts` recorded on a spawned task when `options.max_attempts`
    /// is absent.
    pub default_max_attempts: i64,
    /// Busy timeout, in milliseconds, the extension requests on the
    /// connection it is loaded into via `PRAGMA busy_timeout`.
    pub busy_timeout_ms: i64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            default_lease_seconds: 30,
            default_max_attempts: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = EngineOptions::default();
        assert_eq!(opts.default_max_attempts, 5);
        assert_eq!(opts.default_lease_seconds, 30);
    }

    #[test]
    fn current_falls_back_to_default_before_install() {
        // This test's process may or may not have called `install` already
        // depending on test execution order within the binary; either way
        // `current()` must return a valid, non-empty configuration.
        let opts = current();
        assert!(opts.default_lease_seconds > 0);
    }
}
