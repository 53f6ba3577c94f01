/// Reconstruction of timestamps for samples pulled off a device ring buffer
///
/// Loggers store bare values at a fixed cadence. Timestamps are rebuilt from
/// the wall clock and the logging interval, using the most recently saved log
/// as the de-duplication boundary.
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::models::{RawSample, Sensor, TemperatureLog};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("Log interval must be positive, got {0}s")]
    InvalidInterval(i64),
    #[error("Timestamp out of range while reconstructing logs")]
    TimestampOverflow,
}

/// Timestamp at which the next log can be due, given the newest saved one
///
/// Without a saved log every sample on the device may be new, so the epoch is used.
pub fn next_possible_log_time(
    most_recent_saved: Option<OffsetDateTime>,
    log_interval: i64,
) -> Result<OffsetDateTime, ReconcileError> {
    match most_recent_saved {
        Some(saved) => saved
            .checked_add(Duration::seconds(log_interval))
            .ok_or(ReconcileError::TimestampOverflow),
        None => Ok(OffsetDateTime::UNIX_EPOCH),
    }
}

/// Number of trailing device samples that have not been saved yet
///
/// The sample due exactly at `next_possible_log_time` counts, so
/// `now == next_possible_log_time` gives 1.
pub fn count_new_logs(
    log_interval: i64,
    next_possible_log_time: OffsetDateTime,
    now: OffsetDateTime,
) -> Result<usize, ReconcileError> {
    if log_interval <= 0 {
        return Err(ReconcileError::InvalidInterval(log_interval));
    }
    if next_possible_log_time > now {
        return Ok(0);
    }

    let elapsed = (now - next_possible_log_time).whole_seconds();
    Ok((elapsed / log_interval) as usize + 1)
}

/// Turn the newest `count_to_save` samples into timestamped logs
///
/// With no saved log the newest sample is anchored at `now` and earlier ones
/// step backwards. The same applies when more logs are due than the buffer
/// holds: the ring buffer has wrapped since the watermark, so every sample in
/// it is new and the newest one was taken at `now`. Otherwise the first new
/// sample lands one interval after the saved watermark and later ones step
/// forwards.
pub fn reconstruct_timestamps(
    raw_samples: &[RawSample],
    sensor: &Sensor,
    count_to_save: usize,
    most_recent_saved: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Result<Vec<TemperatureLog>, ReconcileError> {
    if sensor.log_interval <= 0 {
        return Err(ReconcileError::InvalidInterval(sensor.log_interval));
    }

    let wrapped = count_to_save > raw_samples.len();
    let count = count_to_save.min(raw_samples.len());
    let new_samples = &raw_samples[raw_samples.len() - count..];
    let interval = Duration::seconds(sensor.log_interval);

    let first_timestamp = match most_recent_saved {
        Some(saved) if !wrapped => saved.checked_add(interval),
        _ => steps(interval, count.saturating_sub(1)).and_then(|back| now.checked_sub(back)),
    }
    .ok_or(ReconcileError::TimestampOverflow)?;

    new_samples
        .iter()
        .enumerate()
        .map(|(i, sample)| {
            let timestamp = steps(interval, i)
                .and_then(|offset| first_timestamp.checked_add(offset))
                .ok_or(ReconcileError::TimestampOverflow)?;
            Ok(TemperatureLog {
                id: Uuid::new_v4(),
                sensor_id: sensor.id,
                timestamp,
                temperature: sample.temperature,
                log_interval: sensor.log_interval,
                breach_reconciled: false,
            })
        })
        .collect()
}

/// `interval * n` without wrapping or panicking
fn steps(interval: Duration, n: usize) -> Option<Duration> {
    i32::try_from(n).ok().and_then(|n| interval.checked_mul(n))
}
