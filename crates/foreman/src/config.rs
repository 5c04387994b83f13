//! Operator configuration, snapshotted at construction.

use std::time::Duration;

use crate::error::OperateError;

/// Tuning knobs for the reconciliation engine.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Soft deadline for a single `operate` call.
    pub max_operation_time: Duration,
    /// Grace window before a missing pod fails its node.
    pub recently_started_pod_duration: Duration,
    /// Whether entry-template errors mark the whole workflow Error.
    pub bubble_entry_template_err: bool,
    /// Whether successful updates are written back into the informer store.
    pub informer_write_back: bool,
    /// Bounded fan-out for pod assessment.
    pub pod_assessment_concurrency: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_operation_time: Duration::from_secs(30),
            recently_started_pod_duration: Duration::from_secs(10),
            bubble_entry_template_err: true,
            informer_write_back: true,
            pod_assessment_concurrency: 500,
        }
    }
}

impl OperatorConfig {
    /// Reads the environment entry points, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_operation_time: env_duration("MAX_OPERATION_TIME")
                .unwrap_or(defaults.max_operation_time),
            recently_started_pod_duration: env_duration("RECENTLY_STARTED_POD_DURATION")
                .unwrap_or(defaults.recently_started_pod_duration),
            bubble_entry_template_err: env_bool("BUBBLE_ENTRY_TEMPLATE_ERR")
                .unwrap_or(defaults.bubble_entry_template_err),
            informer_write_back: env_bool("INFORMER_WRITE_BACK")
                .unwrap_or(defaults.informer_write_back),
            pod_assessment_concurrency: defaults.pod_assessment_concurrency,
        }
    }
}

fn env_duration(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    parse_duration(&raw).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Parses duration strings of the `90s` / `5m` / `1h30m` / `250ms` form.
pub fn parse_duration(raw: &str) -> Result<Duration, OperateError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(OperateError::Validation("empty duration".to_string()));
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| OperateError::Validation(format!("duration {raw:?} missing unit")))?;
        if digits_end == 0 {
            return Err(OperateError::Validation(format!(
                "duration {raw:?} has a unit with no value"
            )));
        }
        let value: u64 = rest[..digits_end]
            .parse()
            .map_err(|_| OperateError::Validation(format!("invalid duration {raw:?}")))?;
        let unit_end = digits_end
            + rest[digits_end..]
                .find(|c: char| c.is_ascii_digit())
                .unwrap_or(rest.len() - digits_end);
        let unit = &rest[digits_end..unit_end];
        let component = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            other => {
                return Err(OperateError::Validation(format!(
                    "unknown duration unit {other:?} in {raw:?}"
                )))
            }
        };
        total += component;
        rest = &rest[unit_end..];
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_compound_forms() {
        assert_eq!(parse_duration("30s").expect("30s"), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").expect("5m"), Duration::from_secs(300));
        assert_eq!(
            parse_duration("1h30m").expect("1h30m"),
            Duration::from_secs(5400)
        );
        assert_eq!(
            parse_duration("250ms").expect("250ms"),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn parse_duration_rejects_bare_numbers_and_unknown_units() {
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
    }
}
