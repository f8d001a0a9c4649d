//! Filtering and ordering of stored records.
//!
//! The in-memory store runs [`select`] directly over its maps; the SQLite store
//! translates the same searches into SQL and must agree with it.

use domain::{
    Sensor, SensorReading, SensorReadingSearch, SensorSearch, SensorType, SensorTypeSearch,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::paging::SortKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// A slice of a result set along its canonical key.
///
/// `after` and `before` are exclusive bounds; `limit` applies after ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWindow<K> {
    pub after: Option<K>,
    pub before: Option<K>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl<K> Default for KeyWindow<K> {
    fn default() -> Self {
        Self {
            after: None,
            before: None,
            order: SortOrder::Asc,
            limit: None,
        }
    }
}

impl<K: Ord> KeyWindow<K> {
    /// The whole result set in ascending order.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.after.as_ref().is_none_or(|after| key > after)
            && self.before.as_ref().is_none_or(|before| key < before)
    }
}

/// Records with a canonical sort key.
pub trait Keyed {
    type Key: Ord + Clone;

    fn key(&self) -> Self::Key;
    fn to_sort_key(key: Self::Key) -> SortKey;
    fn from_sort_key(key: SortKey) -> Option<Self::Key>;
}

impl Keyed for SensorType {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn to_sort_key(key: String) -> SortKey {
        SortKey::Id(key)
    }

    fn from_sort_key(key: SortKey) -> Option<String> {
        match key {
            SortKey::Id(id) => Some(id),
            SortKey::Timestamp(_) => None,
        }
    }
}

impl Keyed for Sensor {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn to_sort_key(key: String) -> SortKey {
        SortKey::Id(key)
    }

    fn from_sort_key(key: SortKey) -> Option<String> {
        match key {
            SortKey::Id(id) => Some(id),
            SortKey::Timestamp(_) => None,
        }
    }
}

impl Keyed for SensorReading {
    type Key = i64;

    fn key(&self) -> i64 {
        self.timestamp
    }

    fn to_sort_key(key: i64) -> SortKey {
        SortKey::Timestamp(key)
    }

    fn from_sort_key(key: SortKey) -> Option<i64> {
        match key {
            SortKey::Timestamp(timestamp) => Some(timestamp),
            SortKey::Id(_) => None,
        }
    }
}

/// A predicate over records of type `T`.
pub trait RecordFilter<T> {
    fn matches(&self, record: &T) -> bool;
}

fn equals<T: PartialEq + ?Sized>(filter: Option<&T>, value: &T) -> bool {
    filter.is_none_or(|wanted| wanted == value)
}

fn within(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
    min.is_none_or(|min| value >= min) && max.is_none_or(|max| value <= max)
}

impl RecordFilter<SensorType> for SensorTypeSearch {
    fn matches(&self, record: &SensorType) -> bool {
        equals(self.id.as_deref(), record.id.as_str())
            && equals(self.manufacturer.as_deref(), record.manufacturer.as_str())
            && equals(self.model_number.as_deref(), record.model_number.as_str())
            && equals(self.quantity.as_deref(), record.quantity.as_str())
            && equals(self.unit.as_deref(), record.unit.as_str())
            && equals(self.min.as_ref(), &record.limits.min)
            && equals(self.max.as_ref(), &record.limits.max)
    }
}

impl RecordFilter<Sensor> for SensorSearch {
    fn matches(&self, record: &Sensor) -> bool {
        equals(self.id.as_deref(), record.id.as_str())
            && equals(self.sensor_type_id.as_deref(), record.sensor_type_id.as_str())
            && equals(self.period.as_ref(), &record.period)
            && equals(self.min.as_ref(), &record.expected.min)
            && equals(self.max.as_ref(), &record.expected.max)
    }
}

impl RecordFilter<SensorReading> for SensorReadingSearch {
    fn matches(&self, record: &SensorReading) -> bool {
        record.sensor_id == self.sensor_id
            && within(
                record.timestamp as f64,
                self.min_timestamp,
                self.max_timestamp,
            )
            && within(record.value, self.min_value, self.max_value)
    }
}

/// Filters `records`, restricts them to `window` and orders them by key.
pub fn select<T, F>(
    records: impl IntoIterator<Item = T>,
    filter: &F,
    window: &KeyWindow<T::Key>,
) -> Vec<T>
where
    T: Keyed,
    F: RecordFilter<T>,
{
    let mut hits: Vec<T> = records
        .into_iter()
        .filter(|record| filter.matches(record) && window.contains(&record.key()))
        .collect();
    hits.sort_by_cached_key(|record| record.key());
    if window.order == SortOrder::Desc {
        hits.reverse();
    }
    if let Some(limit) = window.limit {
        hits.truncate(limit);
    }
    trace!(count = hits.len(), "Records selected");
    hits
}
