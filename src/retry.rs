//! Retry delay and cancellation-policy math: pure functions of
//! `(retry_strategy, attempt)` / `(cancellation, timestamps)`, with no
//! database access, so they're covered directly by unit tests.

use crate::error::EngineError;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum RetryKind {
    #[default]
    None,
    Fixed,
    Exponential,
}

#[derive(Debug, Deserialize, Default)]
struct RetryStrategy {
    #[serde(default)]
    kind: RetryKind,
    #[serde(default)]
    base_seconds: f64,
    #[serde(default)]
    factor: f64,
    max_seconds: Option<f64>,
}

/// Computes the retry delay in milliseconds for the attempt that just failed.
/// `json_text` is the task's `retry_strategy` column, already normalized to
/// plain JSON text (or empty, meaning "no strategy" / `none`).
pub fn parse_retry_strategy(json_text: &str, attempt: i64) -> Result<i64, EngineError> {
    if json_text.trim().is_empty() || json_text.trim() == "null" {
        return Ok(0);
    }
    let strategy: RetryStrategy = serde_json::from_str(json_text)?;
    let seconds = match strategy.kind {
        RetryKind::None => 0.0,
        RetryKind::Fixed => strategy.base_seconds,
        RetryKind::Exponential => {
            let exponent = (attempt - 1).max(0) as i32;
            let raw = strategy.base_seconds * strategy.factor.powi(exponent);
            match strategy.max_seconds {
                Some(max) => raw.min(max),
                None => raw,
            }
        }
    };
    Ok((seconds.max(0.0) * 1000.0).round() as i64)
}

#[derive(Debug, Deserialize, Default)]
struct CancellationPolicy {
    max_duration_s: Option<f64>,
}

/// `cancellation.max_duration_s` in milliseconds, measured from
/// `enqueue_at`, or `None` when unset.
///
/// `cancellation.max_delay_s` has no equivalent Rust-side parser: it's only
/// ever evaluated inside the bulk cancellation sweep in `claim.rs`, which
/// cancels every overdue task in a queue with a single `UPDATE ... WHERE`
/// rather than looping over rows in Rust, so it reads `max_delay_s` directly
/// via `jsonb_extract` in that query instead of through a per-row helper
/// here.
pub fn parse_cancellation_max_duration(json_text: &str) -> Result<Option<i64>, EngineError> {
    cancellation_field(json_text, |policy| policy.max_duration_s)
}

fn cancellation_field(
    json_text: &str,
    pick: impl Fn(&CancellationPolicy) -> Option<f64>,
) -> Result<Option<i64>, EngineError> {
    if json_text.trim().is_empty() || json_text.trim() == "null" {
        return Ok(None);
    }
    let policy: CancellationPolicy = serde_json::from_str(json_text)?;
    Ok(pick(&policy).map(|seconds| (seconds * 1000.0).round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_strategy_has_no_delay() {
        assert_eq!(parse_retry_strategy("", 3).unwrap(), 0);
        assert_eq!(
            parse_retry_strategy(r#"{"kind":"none"}"#, 3).unwrap(),
            0
        );
    }

    #[test]
    fn fixed_strategy_is_constant() {
        let strategy = r#"{"kind":"fixed","base_seconds":5}"#;
        assert_eq!(parse_retry_strategy(strategy, 1).unwrap(), 5000);
        assert_eq!(parse_retry_strategy(strategy, 9).unwrap(), 5000);
    }

    #[test]
    fn exponential_strategy_clamps_to_max() {
        let strategy = r#"{"kind":"exponential","base_seconds":40,"factor":2,"max_seconds":400}"#;
        assert_eq!(parse_retry_strategy(strategy, 1).unwrap(), 40_000);
        assert_eq!(parse_retry_strategy(strategy, 2).unwrap(), 80_000);
        assert_eq!(parse_retry_strategy(strategy, 3).unwrap(), 160_000);
        assert_eq!(parse_retry_strategy(strategy, 4).unwrap(), 320_000);
        assert_eq!(parse_retry_strategy(strategy, 5).unwrap(), 400_000);
    }

    #[test]
    fn exponential_strategy_honors_small_max() {
        let strategy = r#"{"kind":"exponential","base_seconds":10,"factor":2,"max_seconds":30}"#;
        assert_eq!(parse_retry_strategy(strategy, 1).unwrap(), 10_000);
        assert_eq!(parse_retry_strategy(strategy, 2).unwrap(), 20_000);
        assert_eq!(parse_retry_strategy(strategy, 3).unwrap(), 30_000);
        assert_eq!(parse_retry_strategy(strategy, 4).unwrap(), 30_000);
    }

    #[test]
    fn cancellation_max_duration_defaults_to_none() {
        assert_eq!(parse_cancellation_max_duration("").unwrap(), None);
        assert_eq!(parse_cancellation_max_duration("null").unwrap(), None);
    }

    #[test]
    fn cancellation_max_duration_converts_to_millis() {
        let json = r#"{"max_duration_s":60}"#;
        assert_eq!(parse_cancellation_max_duration(json).unwrap(), Some(60_000));
    }
}
