// ./infrastructure/src/persistence/sqlite_repository.rs
use application::query::{KeyWindow, SortOrder};
use application::{ApplicationError, ConflictPolicy, SensorRepository};
use async_trait::async_trait;
use domain::{
    Range, RecordKind, Sensor, SensorReading, SensorReadingSearch, SensorSearch, SensorType,
    SensorTypeSearch,
};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params, params_from_iter};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sensor_types (
        id TEXT PRIMARY KEY NOT NULL,
        manufacturer TEXT NOT NULL,
        model_number TEXT NOT NULL,
        quantity TEXT NOT NULL,
        unit TEXT NOT NULL,
        limit_min REAL NOT NULL,
        limit_max REAL NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sensors (
        id TEXT PRIMARY KEY NOT NULL,
        sensor_type_id TEXT NOT NULL,
        period REAL NOT NULL,
        expected_min REAL NOT NULL,
        expected_max REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS sensors_by_type ON sensors (sensor_type_id);
    CREATE TABLE IF NOT EXISTS sensor_readings (
        sensor_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        value REAL NOT NULL,
        PRIMARY KEY (sensor_id, timestamp)
    );
";

const SENSOR_TYPE_COLUMNS: &str =
    "id, manufacturer, model_number, quantity, unit, limit_min, limit_max";
const SENSOR_COLUMNS: &str = "id, sensor_type_id, period, expected_min, expected_max";
const READING_COLUMNS: &str = "sensor_id, timestamp, value";

fn db_error(err: rusqlite::Error) -> ApplicationError {
    error!(error = %err, "SQLite operation failed");
    ApplicationError::DatabaseError(err.to_string())
}

/// Maps a uniqueness violation on insert to `AlreadyExists`.
fn insert_error(err: rusqlite::Error, kind: RecordKind, key: String) -> ApplicationError {
    match err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            ApplicationError::AlreadyExists { kind, key }
        }
        other => db_error(other),
    }
}

fn insert_verb(policy: ConflictPolicy) -> &'static str {
    match policy {
        ConflictPolicy::Replace => "INSERT OR REPLACE INTO",
        ConflictPolicy::Reject => "INSERT INTO",
    }
}

fn sensor_type_from_row(row: &Row<'_>) -> rusqlite::Result<SensorType> {
    Ok(SensorType {
        id: row.get(0)?,
        manufacturer: row.get(1)?,
        model_number: row.get(2)?,
        quantity: row.get(3)?,
        unit: row.get(4)?,
        limits: Range {
            min: row.get(5)?,
            max: row.get(6)?,
        },
    })
}

fn sensor_from_row(row: &Row<'_>) -> rusqlite::Result<Sensor> {
    Ok(Sensor {
        id: row.get(0)?,
        sensor_type_id: row.get(1)?,
        period: row.get(2)?,
        expected: Range {
            min: row.get(3)?,
            max: row.get(4)?,
        },
    })
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<SensorReading> {
    Ok(SensorReading {
        sensor_id: row.get(0)?,
        timestamp: row.get(1)?,
        value: row.get(2)?,
    })
}

// --- Query Building ---

/// A `SELECT` assembled from optional conditions, always with positional parameters.
#[derive(Debug)]
struct Select {
    sql: String,
    conditions: Vec<String>,
    params: Vec<Value>,
}

impl Select {
    fn new(columns: &str, table: &str) -> Self {
        Self {
            sql: format!("SELECT {} FROM {}", columns, table),
            conditions: Vec::new(),
            params: Vec::new(),
        }
    }

    fn when<V: Into<Value>>(mut self, column: &str, op: &str, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.params.push(value.into());
            self.conditions
                .push(format!("{} {} ?{}", column, op, self.params.len()));
        }
        self
    }

    fn eq<V: Into<Value>>(self, column: &str, value: Option<V>) -> Self {
        self.when(column, "=", value)
    }

    /// Restricts to the window on `key_column`, then orders and limits.
    fn finish<K: Clone + Into<Value>>(
        self,
        key_column: &str,
        window: &KeyWindow<K>,
    ) -> (String, Vec<Value>) {
        let Select {
            mut sql,
            conditions,
            params,
        } = self
            .when(key_column, ">", window.after.clone())
            .when(key_column, "<", window.before.clone());
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        let order = match window.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        sql.push_str(&format!(" ORDER BY {} {}", key_column, order));
        if let Some(limit) = window.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        (sql, params)
    }
}

fn run_select<T>(
    conn: &Connection,
    sql: &str,
    params: Vec<Value>,
    from_row: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, ApplicationError> {
    debug!(%sql, "Running SQLite query");
    let mut stmt = conn.prepare_cached(sql).map_err(db_error)?;
    let rows = stmt
        .query_map(params_from_iter(params), from_row)
        .map_err(db_error)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
}

// --- Sensor Repository Implementation ---

/// Sensor storage in a single SQLite database.
///
/// All statements run on the blocking thread pool behind one connection.
/// After [`SensorRepository::close`] every operation fails with a database error.
#[derive(Debug, Clone)]
pub struct SqliteSensorRepository {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteSensorRepository {
    /// Opens (creating if needed) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ApplicationError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(db_error)?;
        info!(path = %path.display(), "Opened SQLite sensor store");
        Self::with_schema(conn)
    }

    /// A private database that disappears with the repository.
    pub fn open_in_memory() -> Result<Self, ApplicationError> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::with_schema(conn)
    }

    fn with_schema(conn: Connection) -> Result<Self, ApplicationError> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_error)?;
        conn.execute_batch(SCHEMA).map_err(db_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Runs `op` against the open connection on the blocking pool.
    async fn with_connection<T, F>(&self, op: F) -> Result<T, ApplicationError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, ApplicationError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                ApplicationError::DatabaseError("connection lock poisoned".to_string())
            })?;
            let conn = guard
                .as_mut()
                .ok_or_else(|| ApplicationError::DatabaseError("store is closed".to_string()))?;
            op(conn)
        })
        .await
        .map_err(|e| ApplicationError::DatabaseError(format!("database task failed: {}", e)))?
    }
}

#[async_trait]
impl SensorRepository for SqliteSensorRepository {
    #[instrument(skip(self))]
    async fn get_sensor_type(&self, id: &str) -> Result<Option<SensorType>, ApplicationError> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            let sql = format!("SELECT {} FROM sensor_types WHERE id = ?1", SENSOR_TYPE_COLUMNS);
            conn.query_row(&sql, params![id], sensor_type_from_row)
                .optional()
                .map_err(db_error)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, ApplicationError> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            let sql = format!("SELECT {} FROM sensors WHERE id = ?1", SENSOR_COLUMNS);
            conn.query_row(&sql, params![id], sensor_from_row)
                .optional()
                .map_err(db_error)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_sensor_reading(
        &self,
        sensor_id: &str,
        timestamp: i64,
    ) -> Result<Option<SensorReading>, ApplicationError> {
        let sensor_id = sensor_id.to_string();
        self.with_connection(move |conn| {
            let sql = format!(
                "SELECT {} FROM sensor_readings WHERE sensor_id = ?1 AND timestamp = ?2",
                READING_COLUMNS
            );
            conn.query_row(&sql, params![sensor_id, timestamp], reading_from_row)
                .optional()
                .map_err(db_error)
        })
        .await
    }

    #[instrument(skip(self, sensor_type))]
    async fn save_sensor_type(
        &self,
        sensor_type: &SensorType,
        policy: ConflictPolicy,
    ) -> Result<(), ApplicationError> {
        debug!(sensor_type_id = %sensor_type.id, %policy, "Saving sensor-type to SQLite store");
        let t = sensor_type.clone();
        self.with_connection(move |conn| {
            let sql = format!(
                "{} sensor_types ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                insert_verb(policy),
                SENSOR_TYPE_COLUMNS
            );
            conn.execute(
                &sql,
                params![
                    t.id,
                    t.manufacturer,
                    t.model_number,
                    t.quantity,
                    t.unit,
                    t.limits.min,
                    t.limits.max
                ],
            )
            .map_err(|e| insert_error(e, RecordKind::SensorType, t.id.clone()))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, sensor))]
    async fn save_sensor(
        &self,
        sensor: &Sensor,
        policy: ConflictPolicy,
    ) -> Result<(), ApplicationError> {
        debug!(sensor_id = %sensor.id, %policy, "Saving sensor to SQLite store");
        let s = sensor.clone();
        self.with_connection(move |conn| {
            let sql = format!(
                "{} sensors ({}) VALUES (?1, ?2, ?3, ?4, ?5)",
                insert_verb(policy),
                SENSOR_COLUMNS
            );
            conn.execute(
                &sql,
                params![s.id, s.sensor_type_id, s.period, s.expected.min, s.expected.max],
            )
            .map_err(|e| insert_error(e, RecordKind::Sensor, s.id.clone()))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, reading))]
    async fn save_sensor_reading(
        &self,
        reading: &SensorReading,
        policy: ConflictPolicy,
    ) -> Result<(), ApplicationError> {
        let r = reading.clone();
        self.with_connection(move |conn| {
            let sql = format!(
                "{} sensor_readings ({}) VALUES (?1, ?2, ?3)",
                insert_verb(policy),
                READING_COLUMNS
            );
            conn.execute(&sql, params![r.sensor_id, r.timestamp, r.value])
                .map_err(|e| {
                    insert_error(
                        e,
                        RecordKind::SensorReading,
                        format!("{}@{}", r.sensor_id, r.timestamp),
                    )
                })?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn find_sensor_types(
        &self,
        search: &SensorTypeSearch,
        window: &KeyWindow<String>,
    ) -> Result<Vec<SensorType>, ApplicationError> {
        let search = search.clone();
        let window = window.clone();
        self.with_connection(move |conn| {
            let select = Select::new(SENSOR_TYPE_COLUMNS, "sensor_types")
                .eq("id", search.id)
                .eq("manufacturer", search.manufacturer)
                .eq("model_number", search.model_number)
                .eq("quantity", search.quantity)
                .eq("unit", search.unit)
                .eq("limit_min", search.min)
                .eq("limit_max", search.max);
            let (sql, params) = select.finish("id", &window);
            run_select(conn, &sql, params, sensor_type_from_row)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn find_sensors(
        &self,
        search: &SensorSearch,
        window: &KeyWindow<String>,
    ) -> Result<Vec<Sensor>, ApplicationError> {
        let search = search.clone();
        let window = window.clone();
        self.with_connection(move |conn| {
            let select = Select::new(SENSOR_COLUMNS, "sensors")
                .eq("id", search.id)
                .eq("sensor_type_id", search.sensor_type_id)
                .eq("period", search.period)
                .eq("expected_min", search.min)
                .eq("expected_max", search.max);
            let (sql, params) = select.finish("id", &window);
            run_select(conn, &sql, params, sensor_from_row)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn find_sensor_readings(
        &self,
        search: &SensorReadingSearch,
        window: &KeyWindow<i64>,
    ) -> Result<Vec<SensorReading>, ApplicationError> {
        let search = search.clone();
        let window = window.clone();
        self.with_connection(move |conn| {
            let select = Select::new(READING_COLUMNS, "sensor_readings")
                .eq("sensor_id", Some(search.sensor_id))
                .when("timestamp", ">=", search.min_timestamp)
                .when("timestamp", "<=", search.max_timestamp)
                .when("value", ">=", search.min_value)
                .when("value", "<=", search.max_value);
            let (sql, params) = select.finish("timestamp", &window);
            run_select(conn, &sql, params, reading_from_row)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<(), ApplicationError> {
        self.with_connection(|conn| {
            let tx = conn.transaction().map_err(db_error)?;
            tx.execute_batch(
                "DELETE FROM sensor_readings; DELETE FROM sensors; DELETE FROM sensor_types;",
            )
            .map_err(db_error)?;
            tx.commit().map_err(db_error)?;
            debug!("Cleared SQLite store");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn close(&self) -> Result<(), ApplicationError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                ApplicationError::DatabaseError("connection lock poisoned".to_string())
            })?;
            match guard.take() {
                Some(conn) => conn.close().map_err(|(_, e)| db_error(e)),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| ApplicationError::DatabaseError(format!("database task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(id: &str, sensor_type_id: &str) -> Sensor {
        Sensor {
            id: id.to_string(),
            sensor_type_id: sensor_type_id.to_string(),
            period: 10.0,
            expected: Range {
                min: 0.0,
                max: 50.0,
            },
        }
    }

    fn reading(timestamp: i64, value: f64) -> SensorReading {
        SensorReading {
            sensor_id: "s1".to_string(),
            timestamp,
            value,
        }
    }

    #[tokio::test]
    async fn reject_maps_constraint_violation_to_exists() {
        let repo = SqliteSensorRepository::open_in_memory().unwrap();
        repo.save_sensor(&sensor("s1", "t1"), ConflictPolicy::Reject)
            .await
            .unwrap();
        let err = repo
            .save_sensor(&sensor("s1", "t2"), ConflictPolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::AlreadyExists {
                kind: RecordKind::Sensor,
                ..
            }
        ));

        repo.save_sensor(&sensor("s1", "t2"), ConflictPolicy::Replace)
            .await
            .unwrap();
        let stored = repo.get_sensor("s1").await.unwrap().unwrap();
        assert_eq!(stored.sensor_type_id, "t2");
    }

    #[tokio::test]
    async fn readings_filter_inclusively_and_window_descending() {
        let repo = SqliteSensorRepository::open_in_memory().unwrap();
        for (timestamp, value) in [(10, 1.0), (20, 2.0), (30, 3.0), (40, 4.0)] {
            repo.save_sensor_reading(&reading(timestamp, value), ConflictPolicy::Replace)
                .await
                .unwrap();
        }
        let search = SensorReadingSearch {
            min_timestamp: Some(20.0),
            max_value: Some(4.0),
            ..SensorReadingSearch::for_sensor("s1")
        };
        let window = KeyWindow {
            before: Some(40),
            order: SortOrder::Desc,
            limit: Some(5),
            ..KeyWindow::default()
        };
        let found = repo.find_sensor_readings(&search, &window).await.unwrap();
        let timestamps: Vec<_> = found.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, [30, 20]);
    }

    #[tokio::test]
    async fn sensors_filter_by_type_sorted_by_id() {
        let repo = SqliteSensorRepository::open_in_memory().unwrap();
        for (id, type_id) in [("s3", "t1"), ("s1", "t1"), ("s2", "t2")] {
            repo.save_sensor(&sensor(id, type_id), ConflictPolicy::Replace)
                .await
                .unwrap();
        }
        let search = SensorSearch {
            sensor_type_id: Some("t1".to_string()),
            ..SensorSearch::default()
        };
        let found = repo.find_sensors(&search, &KeyWindow::all()).await.unwrap();
        let ids: Vec<_> = found.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["s1", "s3"]);
    }

    #[tokio::test]
    async fn closed_store_reports_database_errors() {
        let repo = SqliteSensorRepository::open_in_memory().unwrap();
        repo.close().await.unwrap();
        repo.close().await.unwrap();
        let err = repo.get_sensor("s1").await.unwrap_err();
        assert!(matches!(err, ApplicationError::DatabaseError(_)));
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensors.db");

        let repo = SqliteSensorRepository::open(&path).unwrap();
        repo.save_sensor(&sensor("s1", "t1"), ConflictPolicy::Replace)
            .await
            .unwrap();
        repo.close().await.unwrap();

        let reopened = SqliteSensorRepository::open(&path).unwrap();
        assert_eq!(
            reopened.get_sensor("s1").await.unwrap(),
            Some(sensor("s1", "t1"))
        );
        reopened.clear().await.unwrap();
        assert!(reopened.get_sensor("s1").await.unwrap().is_none());
    }
}
