//! Schedule evaluation for workflow sessions.
//!
//! Provides:
//! - Human-readable schedule normalization ("every 5 minutes" -> cron)
//! - Validation of a workflow's schedule block into a `ScheduleSpec`
//! - Deterministic next-session computation in the schedule's time zone
//!
//! Nothing here reads the clock; every computation takes its reference time
//! as an argument.

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use kairos_types::workflow::{ScheduleConfig, ScheduleSpec, ScheduleTime};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while evaluating schedules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid cron expression or schedule string.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Unknown IANA time zone name.
    #[error("unknown time zone '{0}'")]
    InvalidTimeZone(String),

    /// The cron expression has no occurrence after the reference time.
    #[error("schedule '{0}' has no further occurrences")]
    Exhausted(String),
}

impl SchedulerError {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::InvalidSchedule(_) | SchedulerError::InvalidTimeZone(_) => {
                "invalid_schedule"
            }
            SchedulerError::Exhausted(_) => "schedule_exhausted",
        }
    }
}

// ---------------------------------------------------------------------------
// Human-readable schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a human-readable schedule string to a 6-field cron expression.
///
/// Supported patterns (case-insensitive):
/// - "every N seconds"     -> "*/N * * * * *"
/// - "every N minutes"     -> "0 */N * * * *"
/// - "every N hours"       -> "0 0 */N * * *"
/// - "every minute"        -> "0 * * * * *"
/// - "every hour"          -> "0 0 * * * *"
/// - "every day"           -> "0 0 0 * * *"
/// - "every day at HH:MM"  -> "0 MM HH * * *"
/// - "hourly"              -> "0 0 * * * *"
/// - "daily"               -> "0 0 0 * * *"
/// - "weekly"              -> "0 0 0 * * SUN"
/// - "monthly"             -> "0 0 0 1 * *"
///
/// 5-field cron gets a leading `0` seconds field; 6-field cron passes through.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 5 {
        return Ok(format!("0 {}", parts.join(" ")));
    }
    if parts.len() == 6 {
        return Ok(parts.join(" "));
    }

    let lower = trimmed.to_lowercase();

    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        "weekly" => return Ok("0 0 0 * * SUN".to_string()),
        "monthly" => return Ok("0 0 0 1 * *".to_string()),
        _ => {}
    }

    if let Some(rest) = lower.strip_prefix("every ") {
        if let Some(at_part) = rest.strip_prefix("day at ") {
            let time_parts: Vec<&str> = at_part.split(':').collect();
            if time_parts.len() == 2 {
                let hour: u32 = time_parts[0]
                    .trim()
                    .parse()
                    .map_err(|_| SchedulerError::InvalidSchedule(input.to_string()))?;
                let minute: u32 = time_parts[1]
                    .trim()
                    .parse()
                    .map_err(|_| SchedulerError::InvalidSchedule(input.to_string()))?;
                if hour < 24 && minute < 60 {
                    return Ok(format!("0 {minute} {hour} * * *"));
                }
            }
            return Err(SchedulerError::InvalidSchedule(input.to_string()));
        }

        let words: Vec<&str> = rest.split_whitespace().collect();
        if words.len() == 2 {
            let n: u32 = words[0]
                .parse()
                .map_err(|_| SchedulerError::InvalidSchedule(input.to_string()))?;
            if n == 0 {
                return Err(SchedulerError::InvalidSchedule(
                    "interval must be > 0".to_string(),
                ));
            }
            let unit = words[1].trim_end_matches('s');
            return match unit {
                "second" => Ok(format!("*/{n} * * * * *")),
                "minute" => Ok(format!("0 */{n} * * * *")),
                "hour" => Ok(format!("0 0 */{n} * * *")),
                _ => Err(SchedulerError::InvalidSchedule(input.to_string())),
            };
        }
    }

    Err(SchedulerError::InvalidSchedule(format!(
        "unrecognized schedule format: '{trimmed}'"
    )))
}

// ---------------------------------------------------------------------------
// Spec construction
// ---------------------------------------------------------------------------

/// Longest accepted `delay_secs`: one leap year.
pub const MAX_DELAY_SECS: i64 = 366 * 24 * 60 * 60;

pub fn parse_time_zone(name: &str) -> Result<Tz, SchedulerError> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimeZone(name.to_string()))
}

fn parse_cron(expr: &str) -> Result<croner::Cron, SchedulerError> {
    expr.parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(format!("'{expr}': {e}")))
}

/// Validate a workflow's schedule block.
///
/// The schedule's own `timezone` wins; otherwise `workflow_time_zone`
/// (already resolved from the workflow or the archive default) applies.
pub fn schedule_spec(
    config: &ScheduleConfig,
    workflow_time_zone: &str,
) -> Result<ScheduleSpec, SchedulerError> {
    let cron = normalize_schedule(&config.cron)?;
    parse_cron(&cron)?;

    let time_zone = config
        .timezone
        .clone()
        .unwrap_or_else(|| workflow_time_zone.to_string());
    parse_time_zone(&time_zone)?;

    if config.delay_secs < 0 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "delay_secs must not be negative, got {}",
            config.delay_secs
        )));
    }
    if config.delay_secs > MAX_DELAY_SECS {
        return Err(SchedulerError::InvalidSchedule(format!(
            "delay_secs must be at most {MAX_DELAY_SECS}, got {}",
            config.delay_secs
        )));
    }

    Ok(ScheduleSpec {
        cron,
        time_zone,
        delay_secs: config.delay_secs,
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// The first session strictly after `reference`.
///
/// Cron fields are interpreted in the schedule's time zone. The run becomes due
/// `delay_secs` after the session time.
pub fn next_schedule_time(
    spec: &ScheduleSpec,
    reference: DateTime<Utc>,
) -> Result<ScheduleTime, SchedulerError> {
    occurrence(spec, reference, false)
}

/// The first session at or after `reference`.
///
/// Used when a schedule is first stored: a publish exactly on a boundary
/// still schedules that boundary.
pub fn first_schedule_time(
    spec: &ScheduleSpec,
    reference: DateTime<Utc>,
) -> Result<ScheduleTime, SchedulerError> {
    occurrence(spec, reference, true)
}

fn occurrence(
    spec: &ScheduleSpec,
    reference: DateTime<Utc>,
    inclusive: bool,
) -> Result<ScheduleTime, SchedulerError> {
    let cron = parse_cron(&spec.cron)?;
    let tz = parse_time_zone(&spec.time_zone)?;

    let local_reference = reference.with_timezone(&tz);
    let next = cron
        .find_next_occurrence(&local_reference, inclusive)
        .map_err(|_| SchedulerError::Exhausted(spec.cron.clone()))?;

    let session_time = next.with_timezone(&Utc);
    let run_time = TimeDelta::try_seconds(spec.delay_secs)
        .and_then(|delay| session_time.checked_add_signed(delay))
        .ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!(
                "delay_secs {} is out of range",
                spec.delay_secs
            ))
        })?;
    Ok(ScheduleTime {
        session_time,
        run_time,
    })
}

/// Whether a computed schedule time is due at `now`.
pub fn is_due(time: &ScheduleTime, now: DateTime<Utc>) -> bool {
    time.run_time <= now
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
