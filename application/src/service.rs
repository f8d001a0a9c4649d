use domain::{
    Filters, FlatReq, RecordKind, Sensor, SensorReading, SensorReadingSearch, SensorSearch,
    SensorType, SensorTypeSearch, make_sensor, make_sensor_reading, make_sensor_type,
    validate_find_command,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::paging::{self, Anchor, Cursor, Page};
use crate::query::KeyWindow;
use crate::{ApplicationError, ConflictPolicy, SensorRepository};

/// Page size used when a caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 5;
// Sensible maximum page size to prevent abuse
pub const MAX_PAGE_SIZE: usize = 1000;

fn clamp_page_size(page_size: usize) -> usize {
    page_size.clamp(1, MAX_PAGE_SIZE)
}

fn log_rejection<T>(result: Result<T, ApplicationError>) -> Result<T, ApplicationError> {
    result.inspect_err(|e| warn!(code = %e.code(), "Request rejected: {}", e))
}

fn find_filters(kind: RecordKind, req: &FlatReq) -> Result<Filters, ApplicationError> {
    log_rejection(validate_find_command(kind, req).map_err(Into::into))
}

/// Adds and finds sensors info over a [`SensorRepository`].
///
/// Every add validates its request, checks references to other records and
/// then stores according to the configured [`ConflictPolicy`]. Nothing is
/// written when any of these checks fail.
pub struct SensorsService {
    repo: Arc<dyn SensorRepository>,
    policy: ConflictPolicy,
}

impl SensorsService {
    pub fn new(repo: Arc<dyn SensorRepository>, policy: ConflictPolicy) -> Self {
        Self { repo, policy }
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Adds the sensor-type described by `req`.
    ///
    /// Error codes: `REQUIRED`, `BAD_VAL`, `BAD_RANGE`, and with
    /// [`ConflictPolicy::Reject`] `EXISTS`.
    #[instrument(skip(self, req))]
    pub async fn add_sensor_type(&self, req: &FlatReq) -> Result<SensorType, ApplicationError> {
        log_rejection(self.try_add_sensor_type(req).await)
    }

    async fn try_add_sensor_type(&self, req: &FlatReq) -> Result<SensorType, ApplicationError> {
        let sensor_type = make_sensor_type(req)?;
        if self.policy == ConflictPolicy::Reject
            && self.repo.get_sensor_type(&sensor_type.id).await?.is_some()
        {
            return Err(ApplicationError::AlreadyExists {
                kind: RecordKind::SensorType,
                key: sensor_type.id,
            });
        }
        self.repo.save_sensor_type(&sensor_type, self.policy).await?;
        info!(sensor_type_id = %sensor_type.id, "Sensor-type added");
        Ok(sensor_type)
    }

    /// Adds the sensor described by `req`.
    ///
    /// Error codes: `REQUIRED`, `BAD_VAL`, `BAD_RANGE` (also when the expected
    /// range leaves the limits of its type), `BAD_ID` for an unknown
    /// `sensorTypeId`, and with [`ConflictPolicy::Reject`] `EXISTS`.
    #[instrument(skip(self, req))]
    pub async fn add_sensor(&self, req: &FlatReq) -> Result<Sensor, ApplicationError> {
        log_rejection(self.try_add_sensor(req).await)
    }

    async fn try_add_sensor(&self, req: &FlatReq) -> Result<Sensor, ApplicationError> {
        let sensor = make_sensor(req)?;
        let sensor_type = self
            .repo
            .get_sensor_type(&sensor.sensor_type_id)
            .await?
            .ok_or_else(|| ApplicationError::UnknownReference {
                field: "sensorTypeId",
                id: sensor.sensor_type_id.clone(),
            })?;
        sensor.check_within(&sensor_type.limits)?;
        if self.policy == ConflictPolicy::Reject
            && self.repo.get_sensor(&sensor.id).await?.is_some()
        {
            return Err(ApplicationError::AlreadyExists {
                kind: RecordKind::Sensor,
                key: sensor.id,
            });
        }
        self.repo.save_sensor(&sensor, self.policy).await?;
        info!(sensor_id = %sensor.id, sensor_type_id = %sensor.sensor_type_id, "Sensor added");
        Ok(sensor)
    }

    /// Adds the reading described by `req`.
    ///
    /// Error codes: `REQUIRED`, `BAD_VAL`, `BAD_ID` for an unknown `sensorId`,
    /// and with [`ConflictPolicy::Reject`] `EXISTS` for a repeated
    /// `(sensorId, timestamp)`.
    #[instrument(skip(self, req))]
    pub async fn add_sensor_reading(
        &self,
        req: &FlatReq,
    ) -> Result<SensorReading, ApplicationError> {
        log_rejection(self.try_add_sensor_reading(req).await)
    }

    async fn try_add_sensor_reading(
        &self,
        req: &FlatReq,
    ) -> Result<SensorReading, ApplicationError> {
        let reading = make_sensor_reading(req)?;
        if self.repo.get_sensor(&reading.sensor_id).await?.is_none() {
            return Err(ApplicationError::UnknownReference {
                field: "sensorId",
                id: reading.sensor_id,
            });
        }
        if self.policy == ConflictPolicy::Reject
            && self
                .repo
                .get_sensor_reading(&reading.sensor_id, reading.timestamp)
                .await?
                .is_some()
        {
            return Err(ApplicationError::AlreadyExists {
                kind: RecordKind::SensorReading,
                key: format!("{}@{}", reading.sensor_id, reading.timestamp),
            });
        }
        self.repo.save_sensor_reading(&reading, self.policy).await?;
        debug!(
            sensor_id = %reading.sensor_id,
            timestamp = reading.timestamp,
            "Sensor reading added"
        );
        Ok(reading)
    }

    // --- Finds ---

    /// Sensor-types matching `req`, sorted by id.
    #[instrument(skip(self, req))]
    pub async fn find_sensor_types(
        &self,
        req: &FlatReq,
    ) -> Result<Vec<SensorType>, ApplicationError> {
        let filters = find_filters(RecordKind::SensorType, req)?;
        let search = SensorTypeSearch::from_filters(&filters);
        self.repo.find_sensor_types(&search, &KeyWindow::all()).await
    }

    /// Sensors matching `req`, sorted by id.
    #[instrument(skip(self, req))]
    pub async fn find_sensors(&self, req: &FlatReq) -> Result<Vec<Sensor>, ApplicationError> {
        let filters = find_filters(RecordKind::Sensor, req)?;
        let search = SensorSearch::from_filters(&filters);
        self.repo.find_sensors(&search, &KeyWindow::all()).await
    }

    /// Readings of the sensor named by `req.sensorId`, sorted by timestamp.
    ///
    /// A sensor without readings (or an unknown sensor) yields an empty list.
    #[instrument(skip(self, req))]
    pub async fn find_sensor_readings(
        &self,
        req: &FlatReq,
    ) -> Result<Vec<SensorReading>, ApplicationError> {
        let filters = find_filters(RecordKind::SensorReading, req)?;
        let search = SensorReadingSearch::from_filters(&filters);
        self.repo.find_sensor_readings(&search, &KeyWindow::all()).await
    }

    // --- Paged finds ---

    /// First page of [`Self::find_sensor_types`].
    #[instrument(skip(self, req))]
    pub async fn find_sensor_types_page(
        &self,
        req: &FlatReq,
        page_size: usize,
    ) -> Result<Page<SensorType>, ApplicationError> {
        let filters = find_filters(RecordKind::SensorType, req)?;
        self.sensor_types_page(&filters, None, page_size).await
    }

    /// The sensor-types page a cursor token points at.
    #[instrument(skip(self, token))]
    pub async fn find_sensor_types_at(
        &self,
        token: &str,
    ) -> Result<Page<SensorType>, ApplicationError> {
        let (filters, anchor, page_size) = log_rejection(
            Cursor::decode(token).and_then(|c| c.resume::<SensorType>(RecordKind::SensorType)),
        )?;
        self.sensor_types_page(&filters, Some(anchor), page_size).await
    }

    async fn sensor_types_page(
        &self,
        filters: &Filters,
        anchor: Option<Anchor<String>>,
        page_size: usize,
    ) -> Result<Page<SensorType>, ApplicationError> {
        let page_size = clamp_page_size(page_size);
        let search = SensorTypeSearch::from_filters(filters);
        let window = paging::window_for(anchor.as_ref(), page_size);
        let rows = self.repo.find_sensor_types(&search, &window).await?;
        Ok(paging::assemble(rows, filters, anchor.map(|a| a.direction), page_size))
    }

    /// First page of [`Self::find_sensors`].
    #[instrument(skip(self, req))]
    pub async fn find_sensors_page(
        &self,
        req: &FlatReq,
        page_size: usize,
    ) -> Result<Page<Sensor>, ApplicationError> {
        let filters = find_filters(RecordKind::Sensor, req)?;
        self.sensors_page(&filters, None, page_size).await
    }

    /// The sensors page a cursor token points at.
    #[instrument(skip(self, token))]
    pub async fn find_sensors_at(&self, token: &str) -> Result<Page<Sensor>, ApplicationError> {
        let (filters, anchor, page_size) = log_rejection(
            Cursor::decode(token).and_then(|c| c.resume::<Sensor>(RecordKind::Sensor)),
        )?;
        self.sensors_page(&filters, Some(anchor), page_size).await
    }

    async fn sensors_page(
        &self,
        filters: &Filters,
        anchor: Option<Anchor<String>>,
        page_size: usize,
    ) -> Result<Page<Sensor>, ApplicationError> {
        let page_size = clamp_page_size(page_size);
        let search = SensorSearch::from_filters(filters);
        let window = paging::window_for(anchor.as_ref(), page_size);
        let rows = self.repo.find_sensors(&search, &window).await?;
        Ok(paging::assemble(rows, filters, anchor.map(|a| a.direction), page_size))
    }

    /// First page of [`Self::find_sensor_readings`].
    #[instrument(skip(self, req))]
    pub async fn find_sensor_readings_page(
        &self,
        req: &FlatReq,
        page_size: usize,
    ) -> Result<Page<SensorReading>, ApplicationError> {
        let filters = find_filters(RecordKind::SensorReading, req)?;
        self.sensor_readings_page(&filters, None, page_size).await
    }

    /// The readings page a cursor token points at.
    #[instrument(skip(self, token))]
    pub async fn find_sensor_readings_at(
        &self,
        token: &str,
    ) -> Result<Page<SensorReading>, ApplicationError> {
        let (filters, anchor, page_size) = log_rejection(
            Cursor::decode(token)
                .and_then(|c| c.resume::<SensorReading>(RecordKind::SensorReading)),
        )?;
        self.sensor_readings_page(&filters, Some(anchor), page_size).await
    }

    async fn sensor_readings_page(
        &self,
        filters: &Filters,
        anchor: Option<Anchor<i64>>,
        page_size: usize,
    ) -> Result<Page<SensorReading>, ApplicationError> {
        let page_size = clamp_page_size(page_size);
        let search = SensorReadingSearch::from_filters(filters);
        let window = paging::window_for(anchor.as_ref(), page_size);
        let rows = self.repo.find_sensor_readings(&search, &window).await?;
        Ok(paging::assemble(rows, filters, anchor.map(|a| a.direction), page_size))
    }

    // --- Maintenance ---

    /// Removes all sensor-types, sensors and readings.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<(), ApplicationError> {
        self.repo.clear().await?;
        info!("Sensors info cleared");
        Ok(())
    }

    /// Releases the underlying repository. The service is unusable afterwards.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), ApplicationError> {
        self.repo.close().await?;
        info!("Sensors repository closed");
        Ok(())
    }

    /// Adds sensor-types, then sensors, then readings, in order.
    ///
    /// Stops at the first failure and returns it. Records added before the
    /// failure stay in place: the load is not transactional.
    #[instrument(
        skip_all,
        fields(
            sensor_types = sensor_types.len(),
            sensors = sensors.len(),
            readings = readings.len()
        )
    )]
    pub async fn add_sensors_info(
        &self,
        sensor_types: &[FlatReq],
        sensors: &[FlatReq],
        readings: &[FlatReq],
    ) -> Result<(), ApplicationError> {
        for req in sensor_types {
            self.add_sensor_type(req).await?;
        }
        for req in sensors {
            self.add_sensor(req).await?;
        }
        for req in readings {
            self.add_sensor_reading(req).await?;
        }
        info!("Sensors info loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use domain::ErrorCode;

    /// A repository whose storage is always unavailable.
    struct Unavailable;

    fn down<T>() -> Result<T, ApplicationError> {
        Err(ApplicationError::DatabaseError("unavailable".to_string()))
    }

    #[async_trait]
    impl SensorRepository for Unavailable {
        async fn get_sensor_type(&self, _: &str) -> Result<Option<SensorType>, ApplicationError> {
            down()
        }
        async fn get_sensor(&self, _: &str) -> Result<Option<Sensor>, ApplicationError> {
            down()
        }
        async fn get_sensor_reading(
            &self,
            _: &str,
            _: i64,
        ) -> Result<Option<SensorReading>, ApplicationError> {
            down()
        }
        async fn save_sensor_type(
            &self,
            _: &SensorType,
            _: ConflictPolicy,
        ) -> Result<(), ApplicationError> {
            down()
        }
        async fn save_sensor(&self, _: &Sensor, _: ConflictPolicy) -> Result<(), ApplicationError> {
            down()
        }
        async fn save_sensor_reading(
            &self,
            _: &SensorReading,
            _: ConflictPolicy,
        ) -> Result<(), ApplicationError> {
            down()
        }
        async fn find_sensor_types(
            &self,
            _: &SensorTypeSearch,
            _: &KeyWindow<String>,
        ) -> Result<Vec<SensorType>, ApplicationError> {
            down()
        }
        async fn find_sensors(
            &self,
            _: &SensorSearch,
            _: &KeyWindow<String>,
        ) -> Result<Vec<Sensor>, ApplicationError> {
            down()
        }
        async fn find_sensor_readings(
            &self,
            _: &SensorReadingSearch,
            _: &KeyWindow<i64>,
        ) -> Result<Vec<SensorReading>, ApplicationError> {
            down()
        }
        async fn clear(&self) -> Result<(), ApplicationError> {
            down()
        }
    }

    fn service() -> SensorsService {
        SensorsService::new(Arc::new(Unavailable), ConflictPolicy::Reject)
    }

    fn req(fields: &[(&str, &str)]) -> FlatReq {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(clamp_page_size(0), 1);
        assert_eq!(clamp_page_size(DEFAULT_PAGE_SIZE), DEFAULT_PAGE_SIZE);
        assert_eq!(clamp_page_size(usize::MAX), MAX_PAGE_SIZE);
    }

    #[tokio::test]
    async fn validation_runs_before_storage() {
        let err = service()
            .add_sensor_type(&req(&[("id", "t1")]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Required);

        let err = service().find_sensor_readings(&FlatReq::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Required);
    }

    #[tokio::test]
    async fn storage_failures_surface_as_db() {
        let sensor = req(&[
            ("id", "s1"),
            ("sensorTypeId", "t1"),
            ("period", "10"),
            ("min", "0"),
            ("max", "1"),
        ]);
        let err = service().add_sensor(&sensor).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Db);

        let err = service().find_sensors(&FlatReq::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Db);

        let err = service().clear().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Db);
    }

    #[tokio::test]
    async fn default_close_is_a_no_op() {
        assert!(service().close().await.is_ok());
        assert_eq!(service().conflict_policy(), ConflictPolicy::Reject);
    }
}
