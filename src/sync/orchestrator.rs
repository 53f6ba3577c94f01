/// Sequential download, reconciliation and breach detection for all sensors
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::breach::BreachDetector;
use super::reconciler::{
    count_new_logs, next_possible_log_time, reconstruct_timestamps, ReconcileError,
};
use crate::bluetooth::{DeviceError, SensorDevice};
use crate::config::RetryPolicy;
use crate::database::{SensorStore, StoreError};
use crate::models::{Sensor, TemperatureBreach};
use crate::retry::with_retry;
use crate::utils::is_valid_mac;

/// Per-sensor failure classification shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncErrorKind {
    InvalidMacFormat,
    CantConnect,
    CantSave,
    Unknown,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::InvalidMacFormat => "INVALID_MAC_FORMAT",
            SyncErrorKind::CantConnect => "CANT_CONNECT",
            SyncErrorKind::CantSave => "CANT_SAVE",
            SyncErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditions that stop a whole batch before any sensor is touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchError {
    NoEligibleSensors,
    AlreadySyncing,
}

impl BatchError {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchError::NoEligibleSensors => "NO_ELIGIBLE_SENSORS",
            BatchError::AlreadySyncing => "ALREADY_SYNCING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Paused,
    LogDelay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorOutcome {
    Synced {
        new_logs: usize,
        breaches_written: usize,
        /// Battery level read this session, `None` if the info read failed
        battery_level: Option<i32>,
    },
    Skipped(SkipReason),
    Failed(SyncErrorKind),
}

/// Result of the log path for one sensor, before the info read
enum LogStage {
    Skipped(SkipReason),
    Saved {
        new_logs: usize,
        breaches_written: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub outcomes: HashMap<Uuid, SensorOutcome>,
    pub batch_error: Option<BatchError>,
}

impl SyncReport {
    fn halted(error: BatchError) -> Self {
        Self {
            outcomes: HashMap::new(),
            batch_error: Some(error),
        }
    }

    pub fn synced_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, SensorOutcome::Synced { .. }))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Uuid, SyncErrorKind)> {
        self.outcomes.iter().filter_map(|(id, o)| match o {
            SensorOutcome::Failed(kind) => Some((id, *kind)),
            _ => None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SensorSyncError {
    #[error("Invalid MAC address '{0}'")]
    InvalidMac(String),
    #[error("Could not download logs: {0}")]
    Connect(#[source] DeviceError),
    #[error("Could not reconstruct logs: {0}")]
    Reconcile(#[source] ReconcileError),
    #[error("Could not save: {0}")]
    Save(#[source] StoreError),
    #[error("Could not read sync watermark: {0}")]
    Watermark(#[source] StoreError),
    #[error("Sensor misconfigured: {0}")]
    Misconfigured(String),
}

impl SensorSyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SensorSyncError::InvalidMac(_) => SyncErrorKind::InvalidMacFormat,
            SensorSyncError::Connect(_) => SyncErrorKind::CantConnect,
            SensorSyncError::Reconcile(_) | SensorSyncError::Save(_) => SyncErrorKind::CantSave,
            SensorSyncError::Watermark(_) | SensorSyncError::Misconfigured(_) => {
                SyncErrorKind::Unknown
            }
        }
    }
}

type Clock = Box<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Drives one batch at a time over every active, assigned sensor
///
/// The device handle sits behind a mutex held for the whole batch. The radio
/// supports a single session, so sensors are processed one after another and
/// a second batch is refused while one is running.
pub struct SyncOrchestrator<D: SensorDevice, S: SensorStore> {
    device: Mutex<D>,
    store: Arc<S>,
    retry: RetryPolicy,
    clock: Clock,
}

impl<D: SensorDevice, S: SensorStore> SyncOrchestrator<D, S> {
    pub fn new(device: D, store: Arc<S>, retry: RetryPolicy) -> Self {
        Self {
            device: Mutex::new(device),
            store,
            retry,
            clock: Box::new(OffsetDateTime::now_utc),
        }
    }

    /// Replace the wall clock, used to pin `now` in tests
    pub fn with_clock(mut self, clock: impl Fn() -> OffsetDateTime + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Open breaches for a sensor, for display
    pub async fn get_open_breaches(
        &self,
        sensor_id: Uuid,
    ) -> Result<Vec<TemperatureBreach>, StoreError> {
        self.store.query_open_breaches(sensor_id).await
    }

    /// Sync every eligible sensor, one at a time
    ///
    /// Per-sensor failures are recorded in the report and never stop the
    /// batch. Only a failure to list sensors is returned as an error.
    pub async fn sync_all(&self) -> Result<SyncReport, StoreError> {
        let Ok(device) = self.device.try_lock() else {
            warn!("Sync requested while another sync is running");
            return Ok(SyncReport::halted(BatchError::AlreadySyncing));
        };

        let sensors: Vec<Sensor> = self
            .store
            .query_active_assigned_sensors()
            .await?
            .into_iter()
            .filter(|s| s.is_active && s.location_id.is_some())
            .collect();

        if sensors.is_empty() {
            warn!("No active sensors with an assigned location");
            return Ok(SyncReport::halted(BatchError::NoEligibleSensors));
        }

        info!("Syncing {} sensors", sensors.len());
        let mut report = SyncReport::default();

        for sensor in &sensors {
            let outcome = match self.sync_sensor(&*device, sensor).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Sensor {} ({}) failed: {}", sensor.name, sensor.id, e);
                    SensorOutcome::Failed(e.kind())
                }
            };
            self.record_outcome(sensor, &outcome).await;
            report.outcomes.insert(sensor.id, outcome);
        }

        Ok(report)
    }

    async fn sync_sensor(
        &self,
        device: &D,
        sensor: &Sensor,
    ) -> Result<SensorOutcome, SensorSyncError> {
        if !is_valid_mac(&sensor.mac_address) {
            return Err(SensorSyncError::InvalidMac(sensor.mac_address.clone()));
        }

        // The info read is its own device session, independent of how the log stage ended
        let logs = self.sync_logs(device, sensor).await;
        let battery_level = self.refresh_battery(device, sensor).await;

        Ok(match logs? {
            LogStage::Skipped(reason) => SensorOutcome::Skipped(reason),
            LogStage::Saved {
                new_logs,
                breaches_written,
            } => SensorOutcome::Synced {
                new_logs,
                breaches_written,
                battery_level,
            },
        })
    }

    /// Download, reconcile and save logs, then evaluate breaches
    async fn sync_logs(&self, device: &D, sensor: &Sensor) -> Result<LogStage, SensorSyncError> {
        if (self.clock)() < sensor.log_delay {
            debug!("Sensor {} still inside its log delay", sensor.name);
            return Ok(LogStage::Skipped(SkipReason::LogDelay));
        }
        if sensor.is_paused {
            debug!("Sensor {} is paused", sensor.name);
            return Ok(LogStage::Skipped(SkipReason::Paused));
        }
        if sensor.log_interval <= 0 {
            return Err(SensorSyncError::Misconfigured(format!(
                "log interval {}s",
                sensor.log_interval
            )));
        }

        let label = format!("Log download from {}", sensor.mac_address);
        let raw_samples = with_retry(self.retry, &label, || {
            device.download_logs(&sensor.mac_address)
        })
        .await
        .map_err(SensorSyncError::Connect)?;

        let most_recent = self
            .store
            .query_most_recent_log(sensor.id)
            .await
            .map_err(SensorSyncError::Watermark)?
            .map(|log| log.timestamp);

        let now = (self.clock)();
        let next = next_possible_log_time(most_recent, sensor.log_interval)
            .map_err(SensorSyncError::Reconcile)?;
        let count = count_new_logs(sensor.log_interval, next, now)
            .map_err(SensorSyncError::Reconcile)?;
        let logs = reconstruct_timestamps(&raw_samples, sensor, count, most_recent, now)
            .map_err(SensorSyncError::Reconcile)?;

        self.store
            .save_logs(&logs)
            .await
            .map_err(SensorSyncError::Save)?;
        info!(
            "Saved {} new logs for sensor {} ({} on device)",
            logs.len(),
            sensor.name,
            raw_samples.len()
        );

        // Logs are durable before breach evaluation looks at them
        let breaches = BreachDetector::new(self.store.as_ref())
            .detect_and_persist(sensor)
            .await
            .map_err(SensorSyncError::Save)?;

        Ok(LogStage::Saved {
            new_logs: logs.len(),
            breaches_written: breaches.len(),
        })
    }

    /// Read and store the battery level; failures are logged, not propagated
    async fn refresh_battery(&self, device: &D, sensor: &Sensor) -> Option<i32> {
        let label = format!("Info read from {}", sensor.mac_address);
        let info = match with_retry(self.retry, &label, || {
            device.read_device_info(&sensor.mac_address)
        })
        .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!("Battery level for {} not updated: {}", sensor.name, e);
                return None;
            }
        };

        match self
            .store
            .update_sensor_battery(sensor.id, info.battery_level)
            .await
        {
            Ok(()) => Some(info.battery_level),
            Err(e) => {
                warn!("Failed to store battery level for {}: {}", sensor.name, e);
                None
            }
        }
    }

    async fn record_outcome(&self, sensor: &Sensor, outcome: &SensorOutcome) {
        let error = match outcome {
            SensorOutcome::Failed(kind) => Some(kind.as_str()),
            SensorOutcome::Synced { .. } => None,
            SensorOutcome::Skipped(_) => return,
        };
        if sensor.last_sync_error.as_deref() == error {
            return;
        }
        if let Err(e) = self.store.record_sync_error(sensor.id, error).await {
            warn!("Failed to record sync status for {}: {}", sensor.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;
    use crate::models::{BreachConfig, BreachType, DeviceInfo, RawSample};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeState {
        buffers: HashMap<String, Vec<RawSample>>,
        download_failures: HashMap<String, usize>,
        info_fails: bool,
        battery: i32,
        calls: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct FakeDevice {
        state: Arc<std::sync::Mutex<FakeState>>,
    }

    impl FakeDevice {
        fn push(&self, mac: &str, temps: &[f64]) {
            let mut state = self.state.lock().unwrap();
            let buffer = state.buffers.entry(mac.to_string()).or_default();
            buffer.extend(temps.iter().map(|&temperature| RawSample { temperature }));
        }

        fn fail_downloads(&self, mac: &str, times: usize) {
            self.state
                .lock()
                .unwrap()
                .download_failures
                .insert(mac.to_string(), times);
        }

        fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }
    }

    #[async_trait]
    impl SensorDevice for FakeDevice {
        async fn download_logs(&self, mac_address: &str) -> Result<Vec<RawSample>, DeviceError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("logs {}", mac_address));
            if let Some(left) = state.download_failures.get_mut(mac_address) {
                if *left > 0 {
                    *left -= 1;
                    return Err(DeviceError::Timeout);
                }
            }
            Ok(state.buffers.get(mac_address).cloned().unwrap_or_default())
        }

        async fn read_device_info(&self, mac_address: &str) -> Result<DeviceInfo, DeviceError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("info {}", mac_address));
            if state.info_fails {
                return Err(DeviceError::Timeout);
            }
            Ok(DeviceInfo {
                battery_level: state.battery,
            })
        }
    }

    const MAC_A: &str = "AA:BB:CC:DD:EE:01";
    const MAC_B: &str = "AA:BB:CC:DD:EE:02";

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    fn sensor(mac: &str, location_id: Uuid) -> Sensor {
        Sensor {
            id: Uuid::new_v4(),
            name: format!("Sensor {}", mac),
            mac_address: mac.to_string(),
            log_interval: 300,
            log_delay: at(0),
            is_paused: false,
            is_active: true,
            battery_level: None,
            location_id: Some(location_id),
            last_sync_error: None,
        }
    }

    struct Harness {
        device: FakeDevice,
        store: Arc<MemoryStore>,
        clock: Arc<AtomicI64>,
        orchestrator: SyncOrchestrator<FakeDevice, MemoryStore>,
        location: Uuid,
    }

    fn harness() -> Harness {
        let device = FakeDevice::default();
        device.state.lock().unwrap().battery = 80;
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(AtomicI64::new(0));
        let shared = clock.clone();
        let retry = RetryPolicy {
            max_attempts: 3,
            wait: Duration::ZERO,
        };
        let orchestrator = SyncOrchestrator::new(device.clone(), store.clone(), retry)
            .with_clock(move || at(shared.load(Ordering::SeqCst)));
        Harness {
            device,
            store,
            clock,
            orchestrator,
            location: Uuid::new_v4(),
        }
    }

    impl Harness {
        fn add_sensor(&self, mac: &str) -> Sensor {
            let sensor = sensor(mac, self.location);
            self.store.insert_sensor(sensor.clone()).unwrap();
            sensor
        }

        fn set_now(&self, secs: i64) {
            self.clock.store(secs, Ordering::SeqCst);
        }

        fn log_times(&self, sensor_id: Uuid) -> Vec<i64> {
            self.store
                .logs(sensor_id)
                .unwrap()
                .iter()
                .map(|l| l.timestamp.unix_timestamp())
                .collect()
        }
    }

    #[tokio::test]
    async fn first_and_follow_up_sync_reconstruct_timestamps() {
        let h = harness();
        let sensor = h.add_sensor(MAC_A);
        h.device.push(MAC_A, &[4.0, 4.5, 5.0]);
        h.set_now(600);

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(report.batch_error, None);
        assert_eq!(
            report.outcomes[&sensor.id],
            SensorOutcome::Synced {
                new_logs: 3,
                breaches_written: 0,
                battery_level: Some(80)
            }
        );
        assert_eq!(h.log_times(sensor.id), vec![0, 300, 600]);

        h.device.push(MAC_A, &[5.5]);
        h.set_now(900);
        let report = h.orchestrator.sync_all().await.unwrap();
        assert!(matches!(
            report.outcomes[&sensor.id],
            SensorOutcome::Synced { new_logs: 1, .. }
        ));
        assert_eq!(h.log_times(sensor.id), vec![0, 300, 600, 900]);
        assert_eq!(h.store.logs(sensor.id).unwrap()[3].temperature, 5.5);
    }

    #[tokio::test]
    async fn repeated_sync_without_new_samples_adds_nothing() {
        let h = harness();
        let sensor = h.add_sensor(MAC_A);
        h.device.push(MAC_A, &[4.0, 4.5]);
        h.set_now(1_000);
        h.orchestrator.sync_all().await.unwrap();
        let before = h.store.logs(sensor.id).unwrap().len();

        h.set_now(1_100);
        let report = h.orchestrator.sync_all().await.unwrap();
        assert!(matches!(
            report.outcomes[&sensor.id],
            SensorOutcome::Synced { new_logs: 0, .. }
        ));
        assert_eq!(h.store.logs(sensor.id).unwrap().len(), before);
    }

    #[tokio::test]
    async fn sync_after_offline_gap_does_not_duplicate_samples() {
        let h = harness();
        let sensor = h.add_sensor(MAC_A);
        h.device.push(MAC_A, &[4.0]);
        h.set_now(600);
        h.orchestrator.sync_all().await.unwrap();
        assert_eq!(h.log_times(sensor.id), vec![600]);

        // Far more intervals pass than the buffer holds
        h.device.push(MAC_A, &[4.5, 5.0]);
        h.set_now(30_000);
        h.orchestrator.sync_all().await.unwrap();
        let after_gap = h.log_times(sensor.id);
        assert_eq!(after_gap, vec![600, 29_400, 29_700, 30_000]);

        let report = h.orchestrator.sync_all().await.unwrap();
        assert!(matches!(
            report.outcomes[&sensor.id],
            SensorOutcome::Synced { new_logs: 0, .. }
        ));
        assert_eq!(h.log_times(sensor.id), after_gap);
    }

    #[tokio::test]
    async fn invalid_mac_is_reported_without_device_contact() {
        let h = harness();
        let bad = h.add_sensor("not-a-mac");
        let good = h.add_sensor(MAC_B);
        h.device.push(MAC_B, &[4.0]);
        h.set_now(600);

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(
            report.outcomes[&bad.id],
            SensorOutcome::Failed(SyncErrorKind::InvalidMacFormat)
        );
        assert!(matches!(report.outcomes[&good.id], SensorOutcome::Synced { .. }));
        assert!(h.device.calls().iter().all(|c| !c.contains("not-a-mac")));
        assert_eq!(
            h.store.sensor(bad.id).unwrap().unwrap().last_sync_error.as_deref(),
            Some("INVALID_MAC_FORMAT")
        );
        assert_eq!(report.failures().count(), 1);
    }

    #[tokio::test]
    async fn no_eligible_sensors_halts_batch() {
        let h = harness();
        let mut inactive = sensor(MAC_A, h.location);
        inactive.is_active = false;
        h.store.insert_sensor(inactive).unwrap();
        let mut unassigned = sensor(MAC_B, h.location);
        unassigned.location_id = None;
        h.store.insert_sensor(unassigned).unwrap();

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(report.batch_error, Some(BatchError::NoEligibleSensors));
        assert!(report.outcomes.is_empty());
        assert!(h.device.calls().is_empty());
    }

    #[tokio::test]
    async fn paused_and_delayed_sensors_are_skipped() {
        let h = harness();
        let mut paused = sensor(MAC_A, h.location);
        paused.is_paused = true;
        h.store.insert_sensor(paused.clone()).unwrap();
        let mut delayed = sensor(MAC_B, h.location);
        delayed.log_delay = at(10_000);
        h.store.insert_sensor(delayed.clone()).unwrap();
        h.set_now(600);

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(
            report.outcomes[&paused.id],
            SensorOutcome::Skipped(SkipReason::Paused)
        );
        assert_eq!(
            report.outcomes[&delayed.id],
            SensorOutcome::Skipped(SkipReason::LogDelay)
        );
        assert!(h.device.calls().iter().all(|c| !c.starts_with("logs")));
        // Battery is still read for skipped sensors
        for id in [paused.id, delayed.id] {
            assert_eq!(h.store.sensor(id).unwrap().unwrap().battery_level, Some(80));
        }
        assert_eq!(report.synced_count(), 0);
        assert_eq!(report.batch_error, None);
    }

    #[tokio::test]
    async fn exhausted_retries_are_cant_connect_and_batch_continues() {
        let h = harness();
        let flaky = h.add_sensor(MAC_A);
        let healthy = h.add_sensor(MAC_B);
        h.device.fail_downloads(MAC_A, 10);
        h.device.push(MAC_B, &[4.0]);
        h.set_now(600);

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(
            report.outcomes[&flaky.id],
            SensorOutcome::Failed(SyncErrorKind::CantConnect)
        );
        assert!(matches!(report.outcomes[&healthy.id], SensorOutcome::Synced { .. }));
        let attempts = h
            .device
            .calls()
            .iter()
            .filter(|c| *c == &format!("logs {}", MAC_A))
            .count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn battery_is_read_after_failed_download() {
        let h = harness();
        let sensor = h.add_sensor(MAC_A);
        h.device.fail_downloads(MAC_A, 10);
        h.set_now(600);

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(
            report.outcomes[&sensor.id],
            SensorOutcome::Failed(SyncErrorKind::CantConnect)
        );
        assert!(h.device.calls().contains(&format!("info {}", MAC_A)));
        assert_eq!(h.store.sensor(sensor.id).unwrap().unwrap().battery_level, Some(80));
    }

    #[tokio::test]
    async fn transient_download_failure_is_retried() {
        let h = harness();
        let sensor = h.add_sensor(MAC_A);
        h.device.fail_downloads(MAC_A, 2);
        h.device.push(MAC_A, &[4.0]);
        h.set_now(600);

        let report = h.orchestrator.sync_all().await.unwrap();
        assert!(matches!(
            report.outcomes[&sensor.id],
            SensorOutcome::Synced { new_logs: 1, .. }
        ));
    }

    #[tokio::test]
    async fn store_failure_is_cant_save() {
        let h = harness();
        let sensor = h.add_sensor(MAC_A);
        h.device.push(MAC_A, &[4.0, 4.5]);
        h.set_now(600);
        h.store.set_fail_writes(true).unwrap();

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(
            report.outcomes[&sensor.id],
            SensorOutcome::Failed(SyncErrorKind::CantSave)
        );
        assert!(h.store.logs(sensor.id).unwrap().is_empty());
        // The status write goes through the same failing store
        assert_eq!(h.store.sensor(sensor.id).unwrap().unwrap().last_sync_error, None);
    }

    #[tokio::test]
    async fn failed_breach_write_keeps_logs_for_next_sync() {
        let h = harness();
        let sensor = h.add_sensor(MAC_A);
        h.store
            .insert_config(BreachConfig {
                id: Uuid::new_v4(),
                location_id: h.location,
                breach_type: BreachType::ColdConsecutive,
                temperature_threshold: 2.0,
                duration_threshold: 600,
                window: None,
            })
            .unwrap();
        h.device.push(MAC_A, &[1.5, 1.5, 1.5]);
        h.set_now(600);
        h.store.set_fail_breach_writes(true).unwrap();

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(
            report.outcomes[&sensor.id],
            SensorOutcome::Failed(SyncErrorKind::CantSave)
        );
        assert_eq!(h.log_times(sensor.id), vec![0, 300, 600]);
        assert_eq!(h.store.query_unreconciled_logs(sensor.id).await.unwrap().len(), 3);
        assert!(h.store.breaches(sensor.id).unwrap().is_empty());
        assert_eq!(
            h.store.sensor(sensor.id).unwrap().unwrap().last_sync_error.as_deref(),
            Some("CANT_SAVE")
        );

        h.store.set_fail_breach_writes(false).unwrap();
        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(
            report.outcomes[&sensor.id],
            SensorOutcome::Synced {
                new_logs: 0,
                breaches_written: 1,
                battery_level: Some(80)
            }
        );
        assert!(h.store.query_unreconciled_logs(sensor.id).await.unwrap().is_empty());
        let open = h.orchestrator.get_open_breaches(sensor.id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].start_timestamp, at(0));
    }

    #[tokio::test]
    async fn bad_interval_is_unknown() {
        let h = harness();
        let mut broken = sensor(MAC_A, h.location);
        broken.log_interval = 0;
        h.store.insert_sensor(broken.clone()).unwrap();
        h.set_now(600);

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(
            report.outcomes[&broken.id],
            SensorOutcome::Failed(SyncErrorKind::Unknown)
        );
    }

    #[tokio::test]
    async fn battery_failure_does_not_fail_sensor() {
        let h = harness();
        let sensor = h.add_sensor(MAC_A);
        h.device.push(MAC_A, &[4.0]);
        h.device.state.lock().unwrap().info_fails = true;
        h.set_now(600);

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(
            report.outcomes[&sensor.id],
            SensorOutcome::Synced {
                new_logs: 1,
                breaches_written: 0,
                battery_level: None
            }
        );
        assert_eq!(h.store.sensor(sensor.id).unwrap().unwrap().battery_level, None);
        assert_eq!(h.store.logs(sensor.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn battery_level_is_stored() {
        let h = harness();
        let sensor = h.add_sensor(MAC_A);
        h.set_now(600);
        h.orchestrator.sync_all().await.unwrap();
        assert_eq!(
            h.store.sensor(sensor.id).unwrap().unwrap().battery_level,
            Some(80)
        );
    }

    #[tokio::test]
    async fn concurrent_batch_is_refused() {
        let h = harness();
        h.add_sensor(MAC_A);
        let _session = h.orchestrator.device.try_lock().unwrap();

        let report = h.orchestrator.sync_all().await.unwrap();
        assert_eq!(report.batch_error, Some(BatchError::AlreadySyncing));
        assert!(h.device.calls().is_empty());
    }

    #[tokio::test]
    async fn cold_excursion_opens_and_closes_breach() {
        let h = harness();
        let sensor = h.add_sensor(MAC_A);
        h.store
            .insert_config(BreachConfig {
                id: Uuid::new_v4(),
                location_id: h.location,
                breach_type: BreachType::ColdConsecutive,
                temperature_threshold: 2.0,
                duration_threshold: 600,
                window: None,
            })
            .unwrap();

        h.device.push(MAC_A, &[1.5, 1.5, 1.5]);
        h.set_now(600);
        h.orchestrator.sync_all().await.unwrap();
        let open = h.orchestrator.get_open_breaches(sensor.id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].minimum_temperature, 1.5);
        assert_eq!(open[0].start_timestamp, at(0));

        h.device.push(MAC_A, &[3.0]);
        h.set_now(900);
        h.orchestrator.sync_all().await.unwrap();
        assert!(h.orchestrator.get_open_breaches(sensor.id).await.unwrap().is_empty());
        let breaches = h.store.breaches(sensor.id).unwrap();
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].end_timestamp, Some(at(900)));
    }

    #[tokio::test]
    async fn successful_sync_clears_previous_error() {
        let h = harness();
        let mut sensor = sensor(MAC_A, h.location);
        sensor.last_sync_error = Some("CANT_CONNECT".into());
        h.store.insert_sensor(sensor.clone()).unwrap();
        h.set_now(600);

        h.orchestrator.sync_all().await.unwrap();
        assert_eq!(h.store.sensor(sensor.id).unwrap().unwrap().last_sync_error, None);
    }
}
