use serde::{Deserialize, Serialize}; // For record (de)serialization
use std::collections::HashMap;
use std::fmt;
use thiserror::Error; // For domain-specific errors

mod schema;
mod search;
mod validate;

pub use schema::{
    EntitySchema, FieldDefinition, FieldRole, FieldType, SENSOR_READING_SCHEMA, SENSOR_SCHEMA,
    SENSOR_TYPE_SCHEMA,
};
pub use search::{Filters, SensorReadingSearch, SensorSearch, SensorTypeSearch};
pub use validate::{make_sensor, make_sensor_reading, make_sensor_type, validate_find_command};

/// A flat request: field name -> raw text value, as decoded from a form or a JSON object.
pub type FlatReq = HashMap<String, String>;

// --- Error Taxonomy ---

/// Stable error codes shared by every store flavor.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A mandatory field is missing or empty.
    Required,
    /// A field expected to be numeric did not parse (or is not acceptable).
    BadVal,
    /// A min/max pair is inverted, or a range falls outside its bound.
    BadRange,
    /// A reference to another record does not resolve.
    BadId,
    /// An insert collided with an existing key.
    Exists,
    /// The storage backend failed.
    Db,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Required => "REQUIRED",
            ErrorCode::BadVal => "BAD_VAL",
            ErrorCode::BadRange => "BAD_RANGE",
            ErrorCode::BadId => "BAD_ID",
            ErrorCode::Exists => "EXISTS",
            ErrorCode::Db => "DB",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of an error payload. `widget` names the offending field, when there is one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub message: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<String>,
}

impl FieldError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            widget: None,
        }
    }

    pub fn for_widget(code: ErrorCode, widget: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            widget: Some(widget.to_string()),
        }
    }
}

// --- Domain Errors ---
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Field-attributed validation failures; all entries share the first failing code.
    #[error("{}", describe(.0))]
    Invalid(Vec<FieldError>),
}

impl DomainError {
    pub fn errors(&self) -> &[FieldError] {
        match self {
            DomainError::Invalid(errors) => errors,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.errors()
            .first()
            .map_or(ErrorCode::BadVal, |err| err.code)
    }
}

fn describe(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|err| err.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

// --- Record Kinds ---

/// The three kinds of records a sensors store keeps.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    SensorType,
    Sensor,
    SensorReading,
}

impl RecordKind {
    /// Name of the find command searching this kind of record.
    pub fn find_command(&self) -> &'static str {
        match self {
            RecordKind::SensorType => "findSensorTypes",
            RecordKind::Sensor => "findSensors",
            RecordKind::SensorReading => "findSensorReadings",
        }
    }

    pub fn schema(&self) -> &'static EntitySchema {
        match self {
            RecordKind::SensorType => &SENSOR_TYPE_SCHEMA,
            RecordKind::Sensor => &SENSOR_SCHEMA,
            RecordKind::SensorReading => &SENSOR_READING_SCHEMA,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::SensorType => "sensor-type",
            RecordKind::Sensor => "sensor",
            RecordKind::SensorReading => "sensor reading",
        })
    }
}

// --- Records ---

/// An inclusive numeric range with `min < max`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    /// True when `inner` lies entirely within this range.
    pub fn encloses(&self, inner: &Range) -> bool {
        inner.min >= self.min && inner.max <= self.max
    }
}

/// A model of sensor: what it measures, in which unit, within which limits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorType {
    pub id: String,
    pub manufacturer: String,
    pub model_number: String,
    pub quantity: String,
    pub unit: String,
    pub limits: Range,
}

/// A deployed instance of a [`SensorType`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: String,
    pub sensor_type_id: String,
    /// Sampling interval, always positive.
    pub period: f64,
    pub expected: Range,
}

impl Sensor {
    /// Checks that the expected range of this sensor lies within the limits of its type.
    pub fn check_within(&self, limits: &Range) -> Result<(), DomainError> {
        if limits.encloses(&self.expected) {
            return Ok(());
        }
        let mut errors = Vec::new();
        if self.expected.min < limits.min {
            errors.push(FieldError::for_widget(
                ErrorCode::BadRange,
                "min",
                format!(
                    "expected min {} of sensor '{}' is below the sensor-type limit {}",
                    self.expected.min, self.id, limits.min
                ),
            ));
        }
        if self.expected.max > limits.max {
            errors.push(FieldError::for_widget(
                ErrorCode::BadRange,
                "max",
                format!(
                    "expected max {} of sensor '{}' is above the sensor-type limit {}",
                    self.expected.max, self.id, limits.max
                ),
            ));
        }
        Err(DomainError::Invalid(errors))
    }
}

/// One observation of a sensor. `(sensor_id, timestamp)` identifies it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub sensor_id: String,
    pub timestamp: i64,
    pub value: f64,
}
