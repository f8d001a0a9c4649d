// ./infrastructure/src/persistence/in_memory_repository.rs
use application::query::{self, KeyWindow};
use application::{ApplicationError, ConflictPolicy, SensorRepository};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use domain::{
    RecordKind, Sensor, SensorReading, SensorReadingSearch, SensorSearch, SensorType,
    SensorTypeSearch,
};
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Stores `value` under `key`, or refuses when `policy` is `Reject` and the key is taken.
fn put<V>(
    map: &DashMap<String, Arc<V>>,
    key: &str,
    value: &V,
    policy: ConflictPolicy,
    kind: RecordKind,
) -> Result<(), ApplicationError>
where
    V: Clone,
{
    match map.entry(key.to_string()) {
        Entry::Occupied(_) if policy == ConflictPolicy::Reject => {
            Err(ApplicationError::AlreadyExists {
                kind,
                key: key.to_string(),
            })
        }
        Entry::Occupied(mut occupied) => {
            occupied.insert(Arc::new(value.clone()));
            Ok(())
        }
        Entry::Vacant(vacant) => {
            vacant.insert(Arc::new(value.clone()));
            Ok(())
        }
    }
}

// --- Sensor Repository Implementation ---

/// Process-local sensor storage. Cloning shares the underlying maps.
#[derive(Debug, Clone, Default)]
pub struct InMemorySensorRepository {
    // Sensor-type id -> Sensor-type
    sensor_types: Arc<DashMap<String, Arc<SensorType>>>,
    // Sensor id -> Sensor
    sensors: Arc<DashMap<String, Arc<Sensor>>>,
    // Sensor id -> (Timestamp -> Reading)
    readings: Arc<DashMap<String, BTreeMap<i64, SensorReading>>>,
}

impl InMemorySensorRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SensorRepository for InMemorySensorRepository {
    #[instrument(skip(self))]
    async fn get_sensor_type(&self, id: &str) -> Result<Option<SensorType>, ApplicationError> {
        debug!(sensor_type_id = %id, "Getting sensor-type from in-memory store");
        Ok(self.sensor_types.get(id).map(|entry| (**entry).clone()))
    }

    #[instrument(skip(self))]
    async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, ApplicationError> {
        debug!(sensor_id = %id, "Getting sensor from in-memory store");
        Ok(self.sensors.get(id).map(|entry| (**entry).clone()))
    }

    #[instrument(skip(self))]
    async fn get_sensor_reading(
        &self,
        sensor_id: &str,
        timestamp: i64,
    ) -> Result<Option<SensorReading>, ApplicationError> {
        let reading = self
            .readings
            .get(sensor_id)
            .and_then(|series| series.get(&timestamp).cloned());
        Ok(reading)
    }

    #[instrument(skip(self, sensor_type))]
    async fn save_sensor_type(
        &self,
        sensor_type: &SensorType,
        policy: ConflictPolicy,
    ) -> Result<(), ApplicationError> {
        debug!(sensor_type_id = %sensor_type.id, %policy, "Saving sensor-type to in-memory store");
        put(
            &self.sensor_types,
            &sensor_type.id,
            sensor_type,
            policy,
            RecordKind::SensorType,
        )
    }

    #[instrument(skip(self, sensor))]
    async fn save_sensor(
        &self,
        sensor: &Sensor,
        policy: ConflictPolicy,
    ) -> Result<(), ApplicationError> {
        debug!(sensor_id = %sensor.id, %policy, "Saving sensor to in-memory store");
        put(&self.sensors, &sensor.id, sensor, policy, RecordKind::Sensor)
    }

    #[instrument(skip(self, reading))]
    async fn save_sensor_reading(
        &self,
        reading: &SensorReading,
        policy: ConflictPolicy,
    ) -> Result<(), ApplicationError> {
        // Get or create the series for the sensor
        let mut series = self
            .readings
            .entry(reading.sensor_id.clone())
            .or_default();
        match series.entry(reading.timestamp) {
            btree_map::Entry::Occupied(_) if policy == ConflictPolicy::Reject => {
                Err(ApplicationError::AlreadyExists {
                    kind: RecordKind::SensorReading,
                    key: format!("{}@{}", reading.sensor_id, reading.timestamp),
                })
            }
            btree_map::Entry::Occupied(mut occupied) => {
                occupied.insert(reading.clone());
                Ok(())
            }
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(reading.clone());
                Ok(())
            }
        }
    }

    #[instrument(skip(self))]
    async fn find_sensor_types(
        &self,
        search: &SensorTypeSearch,
        window: &KeyWindow<String>,
    ) -> Result<Vec<SensorType>, ApplicationError> {
        let candidates: Vec<SensorType> = match &search.id {
            // Exact id lookups skip the scan
            Some(id) => self
                .sensor_types
                .get(id)
                .map(|entry| (**entry).clone())
                .into_iter()
                .collect(),
            None => self
                .sensor_types
                .iter()
                .map(|entry| (**entry.value()).clone())
                .collect(),
        };
        let hits = query::select(candidates, search, window);
        debug!(count = hits.len(), "Found sensor-types in in-memory store");
        Ok(hits)
    }

    #[instrument(skip(self))]
    async fn find_sensors(
        &self,
        search: &SensorSearch,
        window: &KeyWindow<String>,
    ) -> Result<Vec<Sensor>, ApplicationError> {
        let candidates: Vec<Sensor> = match &search.id {
            Some(id) => self
                .sensors
                .get(id)
                .map(|entry| (**entry).clone())
                .into_iter()
                .collect(),
            None => self
                .sensors
                .iter()
                .map(|entry| (**entry.value()).clone())
                .collect(),
        };
        let hits = query::select(candidates, search, window);
        debug!(count = hits.len(), "Found sensors in in-memory store");
        Ok(hits)
    }

    #[instrument(skip(self))]
    async fn find_sensor_readings(
        &self,
        search: &SensorReadingSearch,
        window: &KeyWindow<i64>,
    ) -> Result<Vec<SensorReading>, ApplicationError> {
        let candidates: Vec<SensorReading> = self
            .readings
            .get(&search.sensor_id)
            .map(|series| series.values().cloned().collect())
            .unwrap_or_default();
        let hits = query::select(candidates, search, window);
        debug!(
            sensor_id = %search.sensor_id,
            count = hits.len(),
            "Found readings in in-memory store"
        );
        Ok(hits)
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<(), ApplicationError> {
        debug!("Clearing in-memory store");
        self.readings.clear();
        self.sensors.clear();
        self.sensor_types.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Range;

    fn sensor_type(id: &str) -> SensorType {
        SensorType {
            id: id.to_string(),
            manufacturer: "Acme".to_string(),
            model_number: "X1".to_string(),
            quantity: "temperature".to_string(),
            unit: "C".to_string(),
            limits: Range {
                min: -10.0,
                max: 100.0,
            },
        }
    }

    fn reading(sensor_id: &str, timestamp: i64, value: f64) -> SensorReading {
        SensorReading {
            sensor_id: sensor_id.to_string(),
            timestamp,
            value,
        }
    }

    #[tokio::test]
    async fn replace_overwrites_and_reject_refuses() {
        let repo = InMemorySensorRepository::new();
        repo.save_sensor_type(&sensor_type("t1"), ConflictPolicy::Replace)
            .await
            .unwrap();

        let mut changed = sensor_type("t1");
        changed.unit = "F".to_string();
        repo.save_sensor_type(&changed, ConflictPolicy::Replace)
            .await
            .unwrap();
        assert_eq!(repo.get_sensor_type("t1").await.unwrap(), Some(changed));

        let err = repo
            .save_sensor_type(&sensor_type("t1"), ConflictPolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::AlreadyExists { .. }));
        assert_eq!(
            repo.get_sensor_type("t1").await.unwrap().unwrap().unit,
            "F"
        );
    }

    #[tokio::test]
    async fn readings_are_keyed_by_sensor_and_timestamp() {
        let repo = InMemorySensorRepository::new();
        repo.save_sensor_reading(&reading("s1", 10, 1.0), ConflictPolicy::Replace)
            .await
            .unwrap();
        repo.save_sensor_reading(&reading("s1", 10, 2.0), ConflictPolicy::Replace)
            .await
            .unwrap();
        repo.save_sensor_reading(&reading("s2", 10, 3.0), ConflictPolicy::Replace)
            .await
            .unwrap();

        let err = repo
            .save_sensor_reading(&reading("s2", 10, 4.0), ConflictPolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::AlreadyExists { .. }));

        let found = repo
            .find_sensor_readings(&SensorReadingSearch::for_sensor("s1"), &KeyWindow::all())
            .await
            .unwrap();
        assert_eq!(found, vec![reading("s1", 10, 2.0)]);
        assert_eq!(
            repo.get_sensor_reading("s2", 10).await.unwrap(),
            Some(reading("s2", 10, 3.0))
        );
    }

    #[tokio::test]
    async fn find_by_id_and_window() {
        let repo = InMemorySensorRepository::new();
        for id in ["t3", "t1", "t2"] {
            repo.save_sensor_type(&sensor_type(id), ConflictPolicy::Replace)
                .await
                .unwrap();
        }
        let by_id = SensorTypeSearch {
            id: Some("t2".to_string()),
            ..SensorTypeSearch::default()
        };
        let found = repo
            .find_sensor_types(&by_id, &KeyWindow::all())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "t2");

        let window = KeyWindow {
            after: Some("t1".to_string()),
            limit: Some(1),
            ..KeyWindow::default()
        };
        let found = repo
            .find_sensor_types(&SensorTypeSearch::default(), &window)
            .await
            .unwrap();
        assert_eq!(found[0].id, "t2");
    }

    #[tokio::test]
    async fn clear_empties_every_map() {
        let repo = InMemorySensorRepository::new();
        repo.save_sensor_type(&sensor_type("t1"), ConflictPolicy::Replace)
            .await
            .unwrap();
        repo.save_sensor_reading(&reading("s1", 1, 1.0), ConflictPolicy::Replace)
            .await
            .unwrap();
        repo.clear().await.unwrap();
        assert!(repo.get_sensor_type("t1").await.unwrap().is_none());
        assert!(repo.get_sensor_reading("s1", 1).await.unwrap().is_none());
    }
}
