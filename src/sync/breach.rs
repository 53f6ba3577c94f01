/// Detection of sustained temperature excursions
///
/// Each breach config on a sensor's location is evaluated independently. The
/// open breach for (sensor, type) is the only state carried between sync
/// sessions; an in-progress run below the duration threshold is rebuilt by
/// replaying a short window of already-evaluated logs.
use std::collections::VecDeque;

use log::{debug, info};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::database::{SensorStore, StoreError};
use crate::models::{BreachConfig, Sensor, TemperatureBreach, TemperatureLog};

/// How far before the first unevaluated log the context replay must reach
pub fn lookback_secs(config: &BreachConfig, sensor_interval: i64) -> i64 {
    if config.breach_type.is_cumulative() {
        config.cumulative_window()
    } else {
        config
            .duration_threshold
            .saturating_add(sensor_interval.max(0))
    }
}

/// Earliest timestamp the context replay reads, clamped to the epoch
fn lookback_start(first: OffsetDateTime, lookback_secs: i64) -> OffsetDateTime {
    first
        .checked_sub(Duration::seconds(lookback_secs))
        .map_or(OffsetDateTime::UNIX_EPOCH, |from| from.max(OffsetDateTime::UNIX_EPOCH))
}

/// Unbroken run of qualifying logs
#[derive(Debug, Clone)]
struct Run {
    start: OffsetDateTime,
    last: OffsetDateTime,
    last_interval: i64,
    min: f64,
    max: f64,
}

impl Run {
    fn duration(&self) -> i64 {
        (self.last - self.start)
            .whole_seconds()
            .saturating_add(self.last_interval)
    }
}

#[derive(Debug, Clone, Copy)]
struct Qualifying {
    timestamp: OffsetDateTime,
    interval: i64,
    temperature: f64,
}

#[derive(Debug)]
enum Tracker {
    Consecutive(Option<Run>),
    Cumulative {
        window: Duration,
        samples: VecDeque<Qualifying>,
    },
}

/// State machine for one (sensor, config) pair over an ordered log sequence
struct BreachScan<'a> {
    sensor_id: Uuid,
    config: &'a BreachConfig,
    tracker: Tracker,
    current: Option<TemperatureBreach>,
    last_closed: Option<OffsetDateTime>,
    written: Vec<TemperatureBreach>,
}

impl<'a> BreachScan<'a> {
    fn new(
        sensor_id: Uuid,
        config: &'a BreachConfig,
        open: Option<TemperatureBreach>,
        last_closed: Option<OffsetDateTime>,
    ) -> Self {
        let tracker = if config.breach_type.is_cumulative() {
            Tracker::Cumulative {
                window: Duration::seconds(config.cumulative_window()),
                samples: VecDeque::new(),
            }
        } else {
            Tracker::Consecutive(None)
        };

        Self {
            sensor_id,
            config,
            tracker,
            current: open,
            last_closed,
            written: Vec::new(),
        }
    }

    fn open_breach(&mut self, start: OffsetDateTime, min: f64, max: f64) {
        let start = match self.last_closed {
            Some(end) if end > start => end,
            _ => start,
        };
        debug!(
            "Opening {} breach for sensor {} at {}",
            self.config.breach_type, self.sensor_id, start
        );
        self.current = Some(TemperatureBreach {
            id: Uuid::new_v4(),
            sensor_id: self.sensor_id,
            breach_type: self.config.breach_type,
            start_timestamp: start,
            end_timestamp: None,
            minimum_temperature: min,
            maximum_temperature: max,
        });
    }

    fn close_breach(&mut self, at: OffsetDateTime) {
        if let Some(mut breach) = self.current.take() {
            breach.end_timestamp = Some(at);
            self.last_closed = Some(at);
            self.written.push(breach);
        }
    }

    /// Feed one log. With `emit` false only the run/accumulation state moves.
    fn step(&mut self, log: &TemperatureLog, emit: bool) {
        let qualifies = self.config.qualifies(log.temperature);

        match &mut self.tracker {
            Tracker::Consecutive(run) => {
                if !qualifies {
                    *run = None;
                    if emit {
                        self.close_breach(log.timestamp);
                    }
                    return;
                }

                let run = run.get_or_insert(Run {
                    start: log.timestamp,
                    last: log.timestamp,
                    last_interval: log.log_interval,
                    min: log.temperature,
                    max: log.temperature,
                });
                run.last = log.timestamp;
                run.last_interval = log.log_interval;
                run.min = run.min.min(log.temperature);
                run.max = run.max.max(log.temperature);
                let reached = run.duration() >= self.config.duration_threshold;
                let (start, min, max) = (run.start, run.min, run.max);

                if !emit {
                    return;
                }
                match self.current.as_mut() {
                    Some(breach) => breach.record(log.temperature),
                    None if reached => self.open_breach(start, min, max),
                    None => {}
                }
            }
            Tracker::Cumulative { window, samples } => {
                if qualifies {
                    samples.push_back(Qualifying {
                        timestamp: log.timestamp,
                        interval: log.log_interval,
                        temperature: log.temperature,
                    });
                }
                if let Some(horizon) = log.timestamp.checked_sub(*window) {
                    while samples.front().map_or(false, |s| s.timestamp <= horizon) {
                        samples.pop_front();
                    }
                }
                let accumulated = samples
                    .iter()
                    .fold(0i64, |sum, s| sum.saturating_add(s.interval));
                let reached = accumulated >= self.config.duration_threshold;

                if !emit {
                    return;
                }
                match self.current.as_mut() {
                    Some(breach) => {
                        if qualifies {
                            breach.record(log.temperature);
                        }
                        if !reached {
                            self.close_breach(log.timestamp);
                        }
                    }
                    None if reached => {
                        let start = samples
                            .front()
                            .map_or(log.timestamp, |s| s.timestamp);
                        let min = samples
                            .iter()
                            .map(|s| s.temperature)
                            .fold(f64::INFINITY, f64::min);
                        let max = samples
                            .iter()
                            .map(|s| s.temperature)
                            .fold(f64::NEG_INFINITY, f64::max);
                        self.open_breach(start, min, max);
                    }
                    None => {}
                }
            }
        }
    }

    fn finish(mut self, touched_open: bool) -> Vec<TemperatureBreach> {
        if touched_open {
            if let Some(breach) = self.current.take() {
                self.written.push(breach);
            }
        }
        self.written
    }
}

/// Evaluate one config over new logs, returning the breach records to upsert
///
/// `context` holds already-evaluated logs directly preceding `logs`; they only
/// restore an in-progress run and never produce records themselves. A new
/// breach never starts before `last_closed`, the end of the previous breach of
/// this type. Records are returned in write order: a closed breach always
/// precedes the one that replaces it.
pub fn evaluate_breaches(
    sensor_id: Uuid,
    config: &BreachConfig,
    open: Option<TemperatureBreach>,
    last_closed: Option<OffsetDateTime>,
    context: &[TemperatureLog],
    logs: &[TemperatureLog],
) -> Vec<TemperatureBreach> {
    let mut scan = BreachScan::new(sensor_id, config, open, last_closed);

    for log in context {
        scan.step(log, false);
    }
    for log in logs {
        scan.step(log, true);
    }

    scan.finish(!logs.is_empty())
}

/// Store-backed breach evaluation for one sensor
pub struct BreachDetector<'a, S: SensorStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: SensorStore + ?Sized> BreachDetector<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Evaluate all unevaluated logs of `sensor` and persist the outcome
    ///
    /// Breach records and the reconciled flags are written as one unit, so a
    /// failure leaves the logs to be evaluated again on the next sync.
    pub async fn detect_and_persist(
        &self,
        sensor: &Sensor,
    ) -> Result<Vec<TemperatureBreach>, StoreError> {
        let logs = self.store.query_unreconciled_logs(sensor.id).await?;
        let Some(first) = logs.first() else {
            return Ok(Vec::new());
        };
        let first_timestamp = first.timestamp;

        let configs = match sensor.location_id {
            Some(location_id) => self.store.query_breach_configs(location_id).await?,
            None => Vec::new(),
        };

        let lookback = configs
            .iter()
            .map(|c| lookback_secs(c, sensor.log_interval))
            .max()
            .unwrap_or(0);
        let context = if lookback > 0 {
            self.store
                .query_logs_between(
                    sensor.id,
                    lookback_start(first_timestamp, lookback),
                    first_timestamp,
                )
                .await?
        } else {
            Vec::new()
        };

        let mut breaches = Vec::new();
        for config in &configs {
            let open = self
                .store
                .query_open_breach(sensor.id, config.breach_type)
                .await?;
            let last_closed = self
                .store
                .query_last_breach_end(sensor.id, config.breach_type)
                .await?;
            let horizon = lookback_start(first_timestamp, lookback_secs(config, sensor.log_interval));
            let skip = context.partition_point(|l| l.timestamp < horizon);

            breaches.extend(evaluate_breaches(
                sensor.id,
                config,
                open,
                last_closed,
                &context[skip..],
                &logs,
            ));
        }

        let reconciled: Vec<Uuid> = logs.iter().map(|l| l.id).collect();
        self.store.upsert_breaches(&breaches, &reconciled).await?;

        let opened = breaches.iter().filter(|b| b.is_open()).count();
        info!(
            "Evaluated {} logs for sensor {}: {} breach records written, {} open",
            logs.len(),
            sensor.name,
            breaches.len(),
            opened
        );

        Ok(breaches)
    }
}
