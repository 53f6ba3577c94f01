/// In-process store used by tests and dry runs
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{SensorStore, StoreError};
use crate::models::{BreachConfig, BreachType, Sensor, TemperatureBreach, TemperatureLog};

#[derive(Debug, Default)]
struct Tables {
    sensors: Vec<Sensor>,
    configs: Vec<BreachConfig>,
    logs: Vec<TemperatureLog>,
    breaches: Vec<TemperatureBreach>,
    fail_writes: bool,
    fail_breach_writes: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn writable(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        let tables = self.tables()?;
        if tables.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(tables)
    }

    pub fn insert_sensor(&self, sensor: Sensor) -> Result<(), StoreError> {
        self.tables()?.sensors.push(sensor);
        Ok(())
    }

    pub fn insert_config(&self, config: BreachConfig) -> Result<(), StoreError> {
        self.tables()?.configs.push(config);
        Ok(())
    }

    /// Make every subsequent write fail, reads keep working
    pub fn set_fail_writes(&self, fail: bool) -> Result<(), StoreError> {
        self.tables()?.fail_writes = fail;
        Ok(())
    }

    /// Make only breach writes fail, so log saves still go through
    pub fn set_fail_breach_writes(&self, fail: bool) -> Result<(), StoreError> {
        self.tables()?.fail_breach_writes = fail;
        Ok(())
    }

    pub fn sensor(&self, id: Uuid) -> Result<Option<Sensor>, StoreError> {
        Ok(self.tables()?.sensors.iter().find(|s| s.id == id).cloned())
    }

    pub fn logs(&self, sensor_id: Uuid) -> Result<Vec<TemperatureLog>, StoreError> {
        let mut logs: Vec<_> = self
            .tables()?
            .logs
            .iter()
            .filter(|l| l.sensor_id == sensor_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.timestamp);
        Ok(logs)
    }

    pub fn breaches(&self, sensor_id: Uuid) -> Result<Vec<TemperatureBreach>, StoreError> {
        let mut breaches: Vec<_> = self
            .tables()?
            .breaches
            .iter()
            .filter(|b| b.sensor_id == sensor_id)
            .cloned()
            .collect();
        breaches.sort_by_key(|b| b.start_timestamp);
        Ok(breaches)
    }
}

#[async_trait]
impl SensorStore for MemoryStore {
    async fn query_active_assigned_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        Ok(self
            .tables()?
            .sensors
            .iter()
            .filter(|s| s.is_active && s.location_id.is_some())
            .cloned()
            .collect())
    }

    async fn query_most_recent_log(
        &self,
        sensor_id: Uuid,
    ) -> Result<Option<TemperatureLog>, StoreError> {
        Ok(self.logs(sensor_id)?.pop())
    }

    async fn query_unreconciled_logs(
        &self,
        sensor_id: Uuid,
    ) -> Result<Vec<TemperatureLog>, StoreError> {
        Ok(self
            .logs(sensor_id)?
            .into_iter()
            .filter(|l| !l.breach_reconciled)
            .collect())
    }

    async fn query_logs_between(
        &self,
        sensor_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<TemperatureLog>, StoreError> {
        Ok(self
            .logs(sensor_id)?
            .into_iter()
            .filter(|l| l.timestamp >= from && l.timestamp < to)
            .collect())
    }

    async fn query_open_breach(
        &self,
        sensor_id: Uuid,
        breach_type: BreachType,
    ) -> Result<Option<TemperatureBreach>, StoreError> {
        Ok(self
            .tables()?
            .breaches
            .iter()
            .find(|b| b.sensor_id == sensor_id && b.breach_type == breach_type && b.is_open())
            .cloned())
    }

    async fn query_last_breach_end(
        &self,
        sensor_id: Uuid,
        breach_type: BreachType,
    ) -> Result<Option<OffsetDateTime>, StoreError> {
        Ok(self
            .tables()?
            .breaches
            .iter()
            .filter(|b| b.sensor_id == sensor_id && b.breach_type == breach_type)
            .filter_map(|b| b.end_timestamp)
            .max())
    }

    async fn query_open_breaches(
        &self,
        sensor_id: Uuid,
    ) -> Result<Vec<TemperatureBreach>, StoreError> {
        Ok(self
            .breaches(sensor_id)?
            .into_iter()
            .filter(TemperatureBreach::is_open)
            .collect())
    }

    async fn query_breach_configs(
        &self,
        location_id: Uuid,
    ) -> Result<Vec<BreachConfig>, StoreError> {
        Ok(self
            .tables()?
            .configs
            .iter()
            .filter(|c| c.location_id == location_id)
            .cloned()
            .collect())
    }

    async fn save_logs(&self, logs: &[TemperatureLog]) -> Result<(), StoreError> {
        let mut tables = self.writable()?;
        for log in logs {
            if !tables.logs.iter().any(|l| l.id == log.id) {
                tables.logs.push(log.clone());
            }
        }
        Ok(())
    }

    async fn upsert_breaches(
        &self,
        breaches: &[TemperatureBreach],
        reconciled_log_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut tables = self.writable()?;
        if tables.fail_breach_writes {
            return Err(StoreError::Unavailable("breach writes disabled".into()));
        }

        // Apply to a copy so a rejected batch leaves nothing behind
        let mut staged = tables.breaches.clone();
        for breach in breaches {
            match staged.iter_mut().find(|b| b.id == breach.id) {
                Some(existing) => *existing = breach.clone(),
                None => staged.push(breach.clone()),
            }
            let open = staged
                .iter()
                .filter(|b| {
                    b.sensor_id == breach.sensor_id
                        && b.breach_type == breach.breach_type
                        && b.is_open()
                })
                .count();
            if open > 1 {
                return Err(StoreError::Corrupt(format!(
                    "second open {} breach for sensor {}",
                    breach.breach_type, breach.sensor_id
                )));
            }
        }
        tables.breaches = staged;

        for log in tables.logs.iter_mut() {
            if reconciled_log_ids.contains(&log.id) {
                log.breach_reconciled = true;
            }
        }
        Ok(())
    }

    async fn update_sensor_battery(&self, sensor_id: Uuid, level: i32) -> Result<(), StoreError> {
        let mut tables = self.writable()?;
        if let Some(sensor) = tables.sensors.iter_mut().find(|s| s.id == sensor_id) {
            sensor.battery_level = Some(level);
        }
        Ok(())
    }

    async fn record_sync_error(
        &self,
        sensor_id: Uuid,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tables = self.writable()?;
        if let Some(sensor) = tables.sensors.iter_mut().find(|s| s.id == sensor_id) {
            sensor.last_sync_error = error.map(str::to_string);
        }
        Ok(())
    }
}
