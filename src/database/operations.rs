/// PostgreSQL-backed store for sensors, logs and breaches
use async_trait::async_trait;
use log::{debug, info};
use time::OffsetDateTime;
use tokio_postgres::{Client, Row};
use uuid::Uuid;

use super::connection::connect_with_retry;
use super::{SensorStore, StoreError};
use crate::config::RetryPolicy;
use crate::models::{BreachConfig, BreachType, Sensor, TemperatureBreach, TemperatureLog};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sensor (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    mac_address TEXT NOT NULL,
    log_interval BIGINT NOT NULL,
    log_delay TIMESTAMPTZ NOT NULL,
    is_paused BOOLEAN NOT NULL DEFAULT FALSE,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    battery_level INTEGER,
    location_id UUID,
    last_sync_error TEXT
);
CREATE TABLE IF NOT EXISTS breach_config (
    id UUID PRIMARY KEY,
    location_id UUID NOT NULL,
    breach_type TEXT NOT NULL,
    temperature_threshold DOUBLE PRECISION NOT NULL,
    duration_threshold BIGINT NOT NULL,
    cumulative_window BIGINT
);
CREATE TABLE IF NOT EXISTS temperature_log (
    id UUID PRIMARY KEY,
    sensor_id UUID NOT NULL REFERENCES sensor(id),
    timestamp TIMESTAMPTZ NOT NULL,
    temperature DOUBLE PRECISION NOT NULL,
    log_interval BIGINT NOT NULL,
    breach_reconciled BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS temperature_log_sensor_time
    ON temperature_log(sensor_id, timestamp);
CREATE TABLE IF NOT EXISTS temperature_breach (
    id UUID PRIMARY KEY,
    sensor_id UUID NOT NULL REFERENCES sensor(id),
    breach_type TEXT NOT NULL,
    start_timestamp TIMESTAMPTZ NOT NULL,
    end_timestamp TIMESTAMPTZ,
    minimum_temperature DOUBLE PRECISION NOT NULL,
    maximum_temperature DOUBLE PRECISION NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS temperature_breach_one_open
    ON temperature_breach(sensor_id, breach_type) WHERE end_timestamp IS NULL;
";

const LOG_COLUMNS: &str = "id, sensor_id, timestamp, temperature, log_interval, breach_reconciled";
const BREACH_COLUMNS: &str = "id, sensor_id, breach_type, start_timestamp, end_timestamp, \
                              minimum_temperature, maximum_temperature";

/// Store that opens a connection per operation, retrying transient failures
#[derive(Debug, Clone)]
pub struct PostgresStore {
    database_url: String,
    retry: RetryPolicy,
}

impl PostgresStore {
    pub fn new(database_url: &str, retry: RetryPolicy) -> Self {
        Self {
            database_url: database_url.to_string(),
            retry,
        }
    }

    async fn client(&self) -> Result<Client, StoreError> {
        connect_with_retry(&self.database_url, self.retry).await
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.client().await?.batch_execute(SCHEMA).await?;
        info!("Database schema ready");
        Ok(())
    }
}

fn sensor_from_row(row: &Row) -> Result<Sensor, StoreError> {
    Ok(Sensor {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        mac_address: row.try_get("mac_address")?,
        log_interval: row.try_get("log_interval")?,
        log_delay: row.try_get("log_delay")?,
        is_paused: row.try_get("is_paused")?,
        is_active: row.try_get("is_active")?,
        battery_level: row.try_get("battery_level")?,
        location_id: row.try_get("location_id")?,
        last_sync_error: row.try_get("last_sync_error")?,
    })
}

fn log_from_row(row: &Row) -> Result<TemperatureLog, StoreError> {
    Ok(TemperatureLog {
        id: row.try_get("id")?,
        sensor_id: row.try_get("sensor_id")?,
        timestamp: row.try_get("timestamp")?,
        temperature: row.try_get("temperature")?,
        log_interval: row.try_get("log_interval")?,
        breach_reconciled: row.try_get("breach_reconciled")?,
    })
}

fn breach_type_from_row(row: &Row) -> Result<BreachType, StoreError> {
    let raw: String = row.try_get("breach_type")?;
    raw.parse().map_err(StoreError::Corrupt)
}

fn breach_from_row(row: &Row) -> Result<TemperatureBreach, StoreError> {
    Ok(TemperatureBreach {
        id: row.try_get("id")?,
        sensor_id: row.try_get("sensor_id")?,
        breach_type: breach_type_from_row(row)?,
        start_timestamp: row.try_get("start_timestamp")?,
        end_timestamp: row.try_get("end_timestamp")?,
        minimum_temperature: row.try_get("minimum_temperature")?,
        maximum_temperature: row.try_get("maximum_temperature")?,
    })
}

fn config_from_row(row: &Row) -> Result<BreachConfig, StoreError> {
    Ok(BreachConfig {
        id: row.try_get("id")?,
        location_id: row.try_get("location_id")?,
        breach_type: breach_type_from_row(row)?,
        temperature_threshold: row.try_get("temperature_threshold")?,
        duration_threshold: row.try_get("duration_threshold")?,
        window: row.try_get("cumulative_window")?,
    })
}

#[async_trait]
impl SensorStore for PostgresStore {
    async fn query_active_assigned_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        let rows = self
            .client()
            .await?
            .query(
                "SELECT id, name, mac_address, log_interval, log_delay, is_paused, is_active,
                        battery_level, location_id, last_sync_error
                 FROM sensor WHERE is_active AND location_id IS NOT NULL",
                &[],
            )
            .await?;
        rows.iter().map(sensor_from_row).collect()
    }

    async fn query_most_recent_log(
        &self,
        sensor_id: Uuid,
    ) -> Result<Option<TemperatureLog>, StoreError> {
        let query = format!(
            "SELECT {} FROM temperature_log WHERE sensor_id = $1 ORDER BY timestamp DESC LIMIT 1",
            LOG_COLUMNS
        );
        let row = self.client().await?.query_opt(query.as_str(), &[&sensor_id]).await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn query_unreconciled_logs(
        &self,
        sensor_id: Uuid,
    ) -> Result<Vec<TemperatureLog>, StoreError> {
        let query = format!(
            "SELECT {} FROM temperature_log
             WHERE sensor_id = $1 AND NOT breach_reconciled ORDER BY timestamp",
            LOG_COLUMNS
        );
        let rows = self.client().await?.query(query.as_str(), &[&sensor_id]).await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn query_logs_between(
        &self,
        sensor_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<TemperatureLog>, StoreError> {
        let query = format!(
            "SELECT {} FROM temperature_log
             WHERE sensor_id = $1 AND timestamp >= $2 AND timestamp < $3 ORDER BY timestamp",
            LOG_COLUMNS
        );
        let rows = self
            .client()
            .await?
            .query(query.as_str(), &[&sensor_id, &from, &to])
            .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn query_open_breach(
        &self,
        sensor_id: Uuid,
        breach_type: BreachType,
    ) -> Result<Option<TemperatureBreach>, StoreError> {
        let query = format!(
            "SELECT {} FROM temperature_breach
             WHERE sensor_id = $1 AND breach_type = $2 AND end_timestamp IS NULL",
            BREACH_COLUMNS
        );
        let row = self
            .client()
            .await?
            .query_opt(query.as_str(), &[&sensor_id, &breach_type.as_str()])
            .await?;
        row.as_ref().map(breach_from_row).transpose()
    }

    async fn query_last_breach_end(
        &self,
        sensor_id: Uuid,
        breach_type: BreachType,
    ) -> Result<Option<OffsetDateTime>, StoreError> {
        let row = self
            .client()
            .await?
            .query_one(
                "SELECT MAX(end_timestamp) AS last_end FROM temperature_breach
                 WHERE sensor_id = $1 AND breach_type = $2",
                &[&sensor_id, &breach_type.as_str()],
            )
            .await?;
        Ok(row.try_get("last_end")?)
    }

    async fn query_open_breaches(
        &self,
        sensor_id: Uuid,
    ) -> Result<Vec<TemperatureBreach>, StoreError> {
        let query = format!(
            "SELECT {} FROM temperature_breach
             WHERE sensor_id = $1 AND end_timestamp IS NULL ORDER BY start_timestamp",
            BREACH_COLUMNS
        );
        let rows = self.client().await?.query(query.as_str(), &[&sensor_id]).await?;
        rows.iter().map(breach_from_row).collect()
    }

    async fn query_breach_configs(
        &self,
        location_id: Uuid,
    ) -> Result<Vec<BreachConfig>, StoreError> {
        let rows = self
            .client()
            .await?
            .query(
                "SELECT id, location_id, breach_type, temperature_threshold,
                        duration_threshold, cumulative_window
                 FROM breach_config WHERE location_id = $1",
                &[&location_id],
            )
            .await?;
        rows.iter().map(config_from_row).collect()
    }

    async fn save_logs(&self, logs: &[TemperatureLog]) -> Result<(), StoreError> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let insert = tx
            .prepare(
                "INSERT INTO temperature_log(id, sensor_id, timestamp, temperature, log_interval, breach_reconciled)
                 VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (id) DO NOTHING",
            )
            .await?;

        for log in logs {
            tx.execute(
                &insert,
                &[
                    &log.id,
                    &log.sensor_id,
                    &log.timestamp,
                    &log.temperature,
                    &log.log_interval,
                    &log.breach_reconciled,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        debug!("Saved {} logs", logs.len());
        Ok(())
    }

    async fn upsert_breaches(
        &self,
        breaches: &[TemperatureBreach],
        reconciled_log_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let upsert = tx
            .prepare(
                "INSERT INTO temperature_breach(id, sensor_id, breach_type, start_timestamp,
                     end_timestamp, minimum_temperature, maximum_temperature)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO UPDATE SET
                     end_timestamp = EXCLUDED.end_timestamp,
                     minimum_temperature = EXCLUDED.minimum_temperature,
                     maximum_temperature = EXCLUDED.maximum_temperature",
            )
            .await?;

        // Order matters: a closed breach must be written before its successor opens
        for breach in breaches {
            tx.execute(
                &upsert,
                &[
                    &breach.id,
                    &breach.sensor_id,
                    &breach.breach_type.as_str(),
                    &breach.start_timestamp,
                    &breach.end_timestamp,
                    &breach.minimum_temperature,
                    &breach.maximum_temperature,
                ],
            )
            .await?;
        }

        if !reconciled_log_ids.is_empty() {
            tx.execute(
                "UPDATE temperature_log SET breach_reconciled = TRUE WHERE id = ANY($1)",
                &[&reconciled_log_ids],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_sensor_battery(&self, sensor_id: Uuid, level: i32) -> Result<(), StoreError> {
        self.client()
            .await?
            .execute(
                "UPDATE sensor SET battery_level = $2 WHERE id = $1",
                &[&sensor_id, &level],
            )
            .await?;
        Ok(())
    }

    async fn record_sync_error(
        &self,
        sensor_id: Uuid,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.client()
            .await?
            .execute(
                "UPDATE sensor SET last_sync_error = $2 WHERE id = $1",
                &[&sensor_id, &error],
            )
            .await?;
        Ok(())
    }
}
