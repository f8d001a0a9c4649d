use std::collections::BTreeMap;

use crate::{FlatReq, RecordKind};

/// Filter fields of a find request that passed [`crate::validate_find_command`].
///
/// Only recognized, non-empty (trimmed) fields are kept, and numeric fields are
/// known to parse. Ordered so that the same filters always encode the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filters {
    kind: RecordKind,
    fields: BTreeMap<String, String>,
}

impl Filters {
    pub(crate) fn new(kind: RecordKind, fields: BTreeMap<String, String>) -> Self {
        Self { kind, fields }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The filters as a flat request, suitable for re-validation.
    pub fn to_request(&self) -> FlatReq {
        self.fields
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    fn text(&self, name: &str) -> Option<String> {
        self.fields.get(name).cloned()
    }

    fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|value| value.parse().ok())
    }
}

/// Equality filters over sensor-type fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorTypeSearch {
    pub id: Option<String>,
    pub manufacturer: Option<String>,
    pub model_number: Option<String>,
    pub quantity: Option<String>,
    pub unit: Option<String>,
    /// Exact value of `limits.min`.
    pub min: Option<f64>,
    /// Exact value of `limits.max`.
    pub max: Option<f64>,
}

impl SensorTypeSearch {
    pub fn from_filters(filters: &Filters) -> Self {
        Self {
            id: filters.text("id"),
            manufacturer: filters.text("manufacturer"),
            model_number: filters.text("modelNumber"),
            quantity: filters.text("quantity"),
            unit: filters.text("unit"),
            min: filters.number("min"),
            max: filters.number("max"),
        }
    }
}

/// Equality filters over sensor fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSearch {
    pub id: Option<String>,
    pub sensor_type_id: Option<String>,
    pub period: Option<f64>,
    /// Exact value of `expected.min`.
    pub min: Option<f64>,
    /// Exact value of `expected.max`.
    pub max: Option<f64>,
}

impl SensorSearch {
    pub fn from_filters(filters: &Filters) -> Self {
        Self {
            id: filters.text("id"),
            sensor_type_id: filters.text("sensorTypeId"),
            period: filters.number("period"),
            min: filters.number("min"),
            max: filters.number("max"),
        }
    }
}

/// Readings of one sensor, optionally bounded (inclusively) by timestamp and value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReadingSearch {
    pub sensor_id: String,
    pub min_timestamp: Option<f64>,
    pub max_timestamp: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl SensorReadingSearch {
    pub fn for_sensor(sensor_id: impl Into<String>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            ..Self::default()
        }
    }

    pub fn from_filters(filters: &Filters) -> Self {
        Self {
            // validate_find_command guarantees sensorId for reading searches
            sensor_id: filters.text("sensorId").unwrap_or_default(),
            min_timestamp: filters.number("minTimestamp"),
            max_timestamp: filters.number("maxTimestamp"),
            min_value: filters.number("minValue"),
            max_value: filters.number("maxValue"),
        }
    }
}
