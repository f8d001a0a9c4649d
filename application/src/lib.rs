use async_trait::async_trait;
use domain::{
    DomainError, ErrorCode, FieldError, RecordKind, Sensor, SensorReading, SensorReadingSearch,
    SensorSearch, SensorType, SensorTypeSearch,
};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod paging;
pub mod query;
mod service;

pub use paging::{Cursor, Direction, Page, SortKey};
pub use query::{KeyWindow, Keyed, RecordFilter, SortOrder};
pub use service::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, SensorsService};

// --- Application Errors ---
#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("Validation failed: {0}")]
    DomainError(#[from] DomainError), // Propagate domain errors cleanly
    #[error("Unknown {field} '{id}'")]
    UnknownReference { field: &'static str, id: String },
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: RecordKind, key: String },
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
}

impl ApplicationError {
    /// The stable error code surfaced to callers.
    pub fn code(&self) -> ErrorCode {
        match self {
            ApplicationError::DomainError(err) => err.code(),
            ApplicationError::UnknownReference { .. } => ErrorCode::BadId,
            ApplicationError::AlreadyExists { .. } => ErrorCode::Exists,
            ApplicationError::DatabaseError(_) => ErrorCode::Db,
            ApplicationError::InvalidCursor(_) => ErrorCode::BadVal,
        }
    }

    /// The error payload: one entry per offending field.
    pub fn errors(&self) -> Vec<FieldError> {
        match self {
            ApplicationError::DomainError(err) => err.errors().to_vec(),
            ApplicationError::UnknownReference { field, .. } => {
                vec![FieldError::for_widget(ErrorCode::BadId, field, self.to_string())]
            }
            ApplicationError::AlreadyExists { .. } => {
                vec![FieldError::new(ErrorCode::Exists, self.to_string())]
            }
            ApplicationError::DatabaseError(_) => {
                vec![FieldError::new(ErrorCode::Db, self.to_string())]
            }
            ApplicationError::InvalidCursor(_) => {
                vec![FieldError::for_widget(ErrorCode::BadVal, "cursor", self.to_string())]
            }
        }
    }
}

// --- Conflict Policy ---

/// What an add does when a record with the same key is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Upsert: the new record replaces the stored one.
    #[default]
    Replace,
    /// Insert-only: the add fails with `EXISTS`.
    Reject,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictPolicy::Replace => "replace",
            ConflictPolicy::Reject => "reject",
        })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown conflict policy '{0}', expected 'replace' or 'reject'")]
pub struct UnknownConflictPolicy(pub String);

impl FromStr for ConflictPolicy {
    type Err = UnknownConflictPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" | "upsert" => Ok(ConflictPolicy::Replace),
            "reject" | "insert-only" => Ok(ConflictPolicy::Reject),
            _ => Err(UnknownConflictPolicy(s.to_string())),
        }
    }
}

// --- Infrastructure Interfaces (Traits) ---

/// Storage for sensor-types, sensors and readings.
///
/// Implementations apply the conflict policy they are handed on each save and
/// return find results filtered and ordered exactly as [`query::select`] does.
#[async_trait]
pub trait SensorRepository: Send + Sync {
    async fn get_sensor_type(&self, id: &str) -> Result<Option<SensorType>, ApplicationError>;
    async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, ApplicationError>;
    async fn get_sensor_reading(
        &self,
        sensor_id: &str,
        timestamp: i64,
    ) -> Result<Option<SensorReading>, ApplicationError>;

    /// Stores a sensor-type. With [`ConflictPolicy::Reject`] an existing id is `AlreadyExists`.
    async fn save_sensor_type(
        &self,
        sensor_type: &SensorType,
        policy: ConflictPolicy,
    ) -> Result<(), ApplicationError>;
    async fn save_sensor(
        &self,
        sensor: &Sensor,
        policy: ConflictPolicy,
    ) -> Result<(), ApplicationError>;
    async fn save_sensor_reading(
        &self,
        reading: &SensorReading,
        policy: ConflictPolicy,
    ) -> Result<(), ApplicationError>;

    async fn find_sensor_types(
        &self,
        search: &SensorTypeSearch,
        window: &KeyWindow<String>,
    ) -> Result<Vec<SensorType>, ApplicationError>;
    async fn find_sensors(
        &self,
        search: &SensorSearch,
        window: &KeyWindow<String>,
    ) -> Result<Vec<Sensor>, ApplicationError>;
    async fn find_sensor_readings(
        &self,
        search: &SensorReadingSearch,
        window: &KeyWindow<i64>,
    ) -> Result<Vec<SensorReading>, ApplicationError>;

    /// Removes every record of every kind.
    async fn clear(&self) -> Result<(), ApplicationError>;

    /// Releases the resources held by the repository.
    async fn close(&self) -> Result<(), ApplicationError> {
        Ok(())
    }
}
