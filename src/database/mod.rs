pub mod connection;
pub mod memory;
pub mod operations;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{BreachConfig, BreachType, Sensor, TemperatureBreach, TemperatureLog};

pub use connection::create_ssl_connector;
pub use memory::MemoryStore;
pub use operations::PostgresStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(#[from] tokio_postgres::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persistent store for sensors, logs and breaches
///
/// Every write method is one durable unit: it either applies fully or not at all.
#[async_trait]
pub trait SensorStore: Send + Sync {
    /// Sensors with `is_active` set and a location assigned
    async fn query_active_assigned_sensors(&self) -> Result<Vec<Sensor>, StoreError>;

    async fn query_most_recent_log(
        &self,
        sensor_id: Uuid,
    ) -> Result<Option<TemperatureLog>, StoreError>;

    /// Logs not yet evaluated against breach rules, ordered by timestamp
    async fn query_unreconciled_logs(
        &self,
        sensor_id: Uuid,
    ) -> Result<Vec<TemperatureLog>, StoreError>;

    /// Logs with `from <= timestamp < to`, ordered by timestamp
    async fn query_logs_between(
        &self,
        sensor_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<TemperatureLog>, StoreError>;

    async fn query_open_breach(
        &self,
        sensor_id: Uuid,
        breach_type: BreachType,
    ) -> Result<Option<TemperatureBreach>, StoreError>;

    /// End of the latest closed breach of this type, used to keep windows disjoint
    async fn query_last_breach_end(
        &self,
        sensor_id: Uuid,
        breach_type: BreachType,
    ) -> Result<Option<OffsetDateTime>, StoreError>;

    async fn query_open_breaches(
        &self,
        sensor_id: Uuid,
    ) -> Result<Vec<TemperatureBreach>, StoreError>;

    async fn query_breach_configs(
        &self,
        location_id: Uuid,
    ) -> Result<Vec<BreachConfig>, StoreError>;

    async fn save_logs(&self, logs: &[TemperatureLog]) -> Result<(), StoreError>;

    /// Upsert breaches in order and flag the consumed logs as reconciled
    async fn upsert_breaches(
        &self,
        breaches: &[TemperatureBreach],
        reconciled_log_ids: &[Uuid],
    ) -> Result<(), StoreError>;

    async fn update_sensor_battery(&self, sensor_id: Uuid, level: i32) -> Result<(), StoreError>;

    /// Store the latest sync error code for a sensor, `None` clears it
    async fn record_sync_error(
        &self,
        sensor_id: Uuid,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
}
