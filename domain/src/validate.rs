use std::collections::{BTreeMap, HashMap};

use crate::schema::{EntitySchema, FieldDefinition, FieldType};
use crate::{
    DomainError, ErrorCode, FieldError, Filters, FlatReq, Range, RecordKind, SENSOR_READING_SCHEMA,
    SENSOR_SCHEMA, SENSOR_TYPE_SCHEMA, Sensor, SensorReading, SensorType,
};

/// Whether a field map describes a record to add or a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Add,
    Find,
}

/// A parsed field value.
#[derive(Debug, Clone, PartialEq)]
enum FieldValue<'a> {
    Text(&'a str),
    Number(f64),
    Integer(i64),
}

/// Field values of one request after checking against an entity schema.
#[derive(Debug, Default)]
struct CheckedFields<'a> {
    values: HashMap<&'static str, FieldValue<'a>>,
}

impl<'a> CheckedFields<'a> {
    fn text(&self, name: &str) -> String {
        match self.values.get(name) {
            Some(FieldValue::Text(text)) => (*text).to_string(),
            _ => String::new(),
        }
    }

    fn number(&self, name: &str) -> f64 {
        match self.values.get(name) {
            Some(FieldValue::Number(number)) => *number,
            Some(FieldValue::Integer(integer)) => *integer as f64,
            _ => 0.0,
        }
    }

    fn integer(&self, name: &str) -> i64 {
        match self.values.get(name) {
            Some(FieldValue::Integer(integer)) => *integer,
            _ => 0,
        }
    }
}

/// Trimmed, non-empty value of `name` in `req`.
fn supplied<'a>(req: &'a FlatReq, name: &str) -> Option<&'a str> {
    req.get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// Largest magnitude an `f64` holds exactly as an integer.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

fn parse_value<'a>(
    field: &FieldDefinition,
    raw: &'a str,
    purpose: Purpose,
) -> Result<FieldValue<'a>, FieldError> {
    let bad_value = |reason: &str| {
        FieldError::for_widget(
            ErrorCode::BadVal,
            field.name,
            format!("bad value \"{}\" for field \"{}\": {}", raw, field.name, reason),
        )
    };
    if field.field_type == FieldType::Text {
        return Ok(FieldValue::Text(raw));
    }
    // Integers that parse directly keep every digit.
    if let (FieldType::Integer, Ok(integer)) = (field.field_type, raw.parse::<i64>()) {
        if purpose == Purpose::Add && field.positive && integer <= 0 {
            return Err(bad_value("must be positive"));
        }
        return Ok(FieldValue::Integer(integer));
    }
    let number: f64 = raw
        .parse()
        .ok()
        .filter(|number: &f64| number.is_finite())
        .ok_or_else(|| bad_value("not a number"))?;
    if purpose == Purpose::Add && field.positive && number <= 0.0 {
        return Err(bad_value("must be positive"));
    }
    match field.field_type {
        FieldType::Integer => {
            if number.fract() != 0.0 || number.abs() > MAX_EXACT_INTEGER {
                return Err(bad_value("not an integer"));
            }
            Ok(FieldValue::Integer(number as i64))
        }
        _ => Ok(FieldValue::Number(number)),
    }
}

/// Checks `req` against `schema`.
///
/// Checks run by category: REQUIRED first, then BAD_VAL, then BAD_RANGE. The
/// first category with failures produces the error, carrying one entry per
/// offending field.
fn check_fields<'a>(
    schema: &EntitySchema,
    req: &'a FlatReq,
    purpose: Purpose,
) -> Result<CheckedFields<'a>, DomainError> {
    let missing: Vec<FieldError> = schema
        .record_fields()
        .filter(|field| purpose == Purpose::Add && field.required)
        .filter(|field| supplied(req, field.name).is_none())
        .map(|field| {
            FieldError::for_widget(
                ErrorCode::Required,
                field.name,
                format!("missing value for required field \"{}\"", field.name),
            )
        })
        .collect();
    if !missing.is_empty() {
        return Err(DomainError::Invalid(missing));
    }

    let mut checked = CheckedFields::default();
    let mut bad_values = Vec::new();
    if purpose == Purpose::Find {
        let mut unknown: Vec<&String> = req
            .iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(name, _)| name)
            .filter(|name| schema.field(name).is_none_or(|field| !field.is_filter()))
            .collect();
        unknown.sort();
        bad_values.extend(unknown.into_iter().map(|name| {
            FieldError::for_widget(
                ErrorCode::BadVal,
                name,
                format!("unknown {} search field \"{}\"", schema.name, name),
            )
        }));
    }
    for field in schema.fields {
        let recognized = match purpose {
            Purpose::Add => field.is_record_field(),
            Purpose::Find => field.is_filter(),
        };
        let Some(raw) = supplied(req, field.name).filter(|_| recognized) else {
            continue;
        };
        match parse_value(field, raw, purpose) {
            Ok(value) => {
                checked.values.insert(field.name, value);
            }
            Err(err) => bad_values.push(err),
        }
    }
    if !bad_values.is_empty() {
        return Err(DomainError::Invalid(bad_values));
    }

    if purpose == Purpose::Add {
        if let Some((min, max)) = schema.range_pair() {
            let (lo, hi) = (checked.number(min.name), checked.number(max.name));
            if lo >= hi {
                return Err(DomainError::Invalid(vec![FieldError::for_widget(
                    ErrorCode::BadRange,
                    min.name,
                    format!(
                        "{} \"{}\" ({}) must be less than \"{}\" ({})",
                        schema.name, min.name, lo, max.name, hi
                    ),
                )]));
            }
        }
    }
    Ok(checked)
}

/// Builds a sensor-type from a flat request.
///
/// Error codes: `REQUIRED`, `BAD_VAL`, `BAD_RANGE` (min >= max).
pub fn make_sensor_type(req: &FlatReq) -> Result<SensorType, DomainError> {
    let fields = check_fields(&SENSOR_TYPE_SCHEMA, req, Purpose::Add)?;
    Ok(SensorType {
        id: fields.text("id"),
        manufacturer: fields.text("manufacturer"),
        model_number: fields.text("modelNumber"),
        quantity: fields.text("quantity"),
        unit: fields.text("unit"),
        limits: Range {
            min: fields.number("min"),
            max: fields.number("max"),
        },
    })
}

/// Builds a sensor from a flat request. Does not look at its sensor-type.
///
/// Error codes: `REQUIRED`, `BAD_VAL` (including a non-positive period), `BAD_RANGE`.
pub fn make_sensor(req: &FlatReq) -> Result<Sensor, DomainError> {
    let fields = check_fields(&SENSOR_SCHEMA, req, Purpose::Add)?;
    Ok(Sensor {
        id: fields.text("id"),
        sensor_type_id: fields.text("sensorTypeId"),
        period: fields.number("period"),
        expected: Range {
            min: fields.number("min"),
            max: fields.number("max"),
        },
    })
}

/// Builds a sensor reading from a flat request.
///
/// Error codes: `REQUIRED`, `BAD_VAL` (including a non-integral timestamp).
pub fn make_sensor_reading(req: &FlatReq) -> Result<SensorReading, DomainError> {
    let fields = check_fields(&SENSOR_READING_SCHEMA, req, Purpose::Add)?;
    Ok(SensorReading {
        sensor_id: fields.text("sensorId"),
        timestamp: fields.integer("timestamp"),
        value: fields.number("value"),
    })
}

/// Validates the filters of a find command for `kind`.
///
/// Every field is optional except `sensorId` for reading searches. Supplied
/// fields must be filters of `kind` and numeric ones must parse. Empty values
/// count as absent.
pub fn validate_find_command(kind: RecordKind, req: &FlatReq) -> Result<Filters, DomainError> {
    let schema = kind.schema();
    if kind == RecordKind::SensorReading && supplied(req, "sensorId").is_none() {
        return Err(DomainError::Invalid(vec![FieldError::for_widget(
            ErrorCode::Required,
            "sensorId",
            format!("{} requires \"sensorId\"", kind.find_command()),
        )]));
    }
    check_fields(schema, req, Purpose::Find)?;
    let fields: BTreeMap<String, String> = schema
        .filter_fields()
        .filter_map(|field| {
            supplied(req, field.name).map(|value| (field.name.to_string(), value.to_string()))
        })
        .collect();
    Ok(Filters::new(kind, fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(pairs: &[(&str, &str)]) -> FlatReq {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sensor_type_req() -> FlatReq {
        req(&[
            ("id", "t1"),
            ("manufacturer", "Acme"),
            ("modelNumber", "X1"),
            ("quantity", "temperature"),
            ("unit", "C"),
            ("min", "-10"),
            ("max", "50"),
        ])
    }

    fn codes(err: &DomainError) -> Vec<(ErrorCode, Option<&str>)> {
        err.errors()
            .iter()
            .map(|e| (e.code, e.widget.as_deref()))
            .collect()
    }

    #[test]
    fn make_sensor_type_success_coerces_numbers() {
        let sensor_type = make_sensor_type(&sensor_type_req()).expect("valid sensor-type");
        assert_eq!(sensor_type.id, "t1");
        assert_eq!(sensor_type.model_number, "X1");
        assert_eq!(
            sensor_type.limits,
            Range {
                min: -10.0,
                max: 50.0
            }
        );
    }

    #[test]
    fn make_sensor_type_trims_text() {
        let mut fields = sensor_type_req();
        fields.insert("manufacturer".to_string(), "  Acme Corp ".to_string());
        fields.insert("max".to_string(), " 50 ".to_string());
        let sensor_type = make_sensor_type(&fields).unwrap();
        assert_eq!(sensor_type.manufacturer, "Acme Corp");
        assert_eq!(sensor_type.limits.max, 50.0);
    }

    #[test]
    fn missing_fields_fail_required_one_entry_each() {
        let mut fields = sensor_type_req();
        fields.remove("unit");
        fields.insert("manufacturer".to_string(), "   ".to_string());
        let err = make_sensor_type(&fields).unwrap_err();
        assert_eq!(
            codes(&err),
            [
                (ErrorCode::Required, Some("manufacturer")),
                (ErrorCode::Required, Some("unit")),
            ]
        );
    }

    #[test]
    fn required_wins_over_bad_value() {
        let mut fields = sensor_type_req();
        fields.remove("id");
        fields.insert("min".to_string(), "cold".to_string());
        let err = make_sensor_type(&fields).unwrap_err();
        assert_eq!(codes(&err), [(ErrorCode::Required, Some("id"))]);
    }

    #[test]
    fn non_numeric_fields_fail_bad_val() {
        let mut fields = sensor_type_req();
        fields.insert("min".to_string(), "cold".to_string());
        fields.insert("max".to_string(), "NaN".to_string());
        let err = make_sensor_type(&fields).unwrap_err();
        assert_eq!(
            codes(&err),
            [
                (ErrorCode::BadVal, Some("min")),
                (ErrorCode::BadVal, Some("max")),
            ]
        );
    }

    #[test]
    fn bad_value_wins_over_bad_range() {
        let fields = req(&[
            ("id", "s1"),
            ("sensorTypeId", "t1"),
            ("period", "x"),
            ("min", "40"),
            ("max", "0"),
        ]);
        let err = make_sensor(&fields).unwrap_err();
        assert_eq!(codes(&err), [(ErrorCode::BadVal, Some("period"))]);
    }

    #[test]
    fn equal_or_inverted_limits_fail_bad_range() {
        for (min, max) in [("50", "50"), ("60", "50")] {
            let mut fields = sensor_type_req();
            fields.insert("min".to_string(), min.to_string());
            fields.insert("max".to_string(), max.to_string());
            let err = make_sensor_type(&fields).unwrap_err();
            assert_eq!(err.code(), ErrorCode::BadRange);
        }
    }

    #[test]
    fn make_sensor_requires_positive_period() {
        let mut fields = req(&[
            ("id", "s1"),
            ("sensorTypeId", "t1"),
            ("period", "5"),
            ("min", "0"),
            ("max", "40"),
        ]);
        let sensor = make_sensor(&fields).unwrap();
        assert_eq!(sensor.period, 5.0);
        assert_eq!(sensor.expected, Range { min: 0.0, max: 40.0 });

        fields.insert("period".to_string(), "0".to_string());
        let err = make_sensor(&fields).unwrap_err();
        assert_eq!(codes(&err), [(ErrorCode::BadVal, Some("period"))]);
    }

    #[test]
    fn make_sensor_reading_parses_integral_timestamp() {
        let reading = make_sensor_reading(&req(&[
            ("sensorId", "s1"),
            ("timestamp", "1700000000"),
            ("value", "21.5"),
        ]))
        .unwrap();
        assert_eq!(reading.timestamp, 1_700_000_000);
        assert_eq!(reading.value, 21.5);

        let err = make_sensor_reading(&req(&[
            ("sensorId", "s1"),
            ("timestamp", "10.5"),
            ("value", "1"),
        ]))
        .unwrap_err();
        assert_eq!(codes(&err), [(ErrorCode::BadVal, Some("timestamp"))]);
    }

    #[test]
    fn large_timestamps_keep_every_digit() {
        let reading = |timestamp: &str| {
            make_sensor_reading(&req(&[
                ("sensorId", "s1"),
                ("timestamp", timestamp),
                ("value", "1"),
            ]))
        };
        assert_eq!(reading("9007199254740993").unwrap().timestamp, 9_007_199_254_740_993);
        assert_eq!(reading("9007199254740992").unwrap().timestamp, 9_007_199_254_740_992);
        assert_eq!(reading("-9007199254740993").unwrap().timestamp, -9_007_199_254_740_993);
        assert_eq!(reading("1e3").unwrap().timestamp, 1000);

        // beyond i64 and only expressible as a float: no longer exact
        let err = reading("1e19").unwrap_err();
        assert_eq!(codes(&err), [(ErrorCode::BadVal, Some("timestamp"))]);
    }

    #[test]
    fn add_requests_ignore_unrecognized_fields() {
        let mut fields = sensor_type_req();
        fields.insert("color".to_string(), "blue".to_string());
        assert!(make_sensor_type(&fields).is_ok());
    }

    #[test]
    fn find_command_accepts_empty_request() {
        let filters = validate_find_command(RecordKind::SensorType, &FlatReq::new()).unwrap();
        assert!(filters.is_empty());
        assert_eq!(filters.kind(), RecordKind::SensorType);
    }

    #[test]
    fn find_command_keeps_trimmed_filters_and_drops_empty_ones() {
        let filters = validate_find_command(
            RecordKind::Sensor,
            &req(&[("sensorTypeId", " t1 "), ("id", ""), ("min", "0")]),
        )
        .unwrap();
        let fields: Vec<_> = filters
            .fields()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(fields, [("min", "0"), ("sensorTypeId", "t1")]);
    }

    #[test]
    fn find_command_rejects_unknown_fields() {
        let err = validate_find_command(RecordKind::SensorType, &req(&[("color", "blue")]))
            .unwrap_err();
        assert_eq!(codes(&err), [(ErrorCode::BadVal, Some("color"))]);

        // readings are searched by bounds, not by exact timestamp
        let err = validate_find_command(
            RecordKind::SensorReading,
            &req(&[("sensorId", "s1"), ("timestamp", "10")]),
        )
        .unwrap_err();
        assert_eq!(codes(&err), [(ErrorCode::BadVal, Some("timestamp"))]);
    }

    #[test]
    fn find_command_accepts_non_positive_period() {
        for period in ["0", "-1"] {
            let filters =
                validate_find_command(RecordKind::Sensor, &req(&[("period", period)])).unwrap();
            let search = crate::SensorSearch::from_filters(&filters);
            assert_eq!(search.period, Some(period.parse::<f64>().unwrap()));
        }
    }

    #[test]
    fn find_command_rejects_non_numeric_bounds() {
        let err = validate_find_command(
            RecordKind::SensorReading,
            &req(&[("sensorId", "s1"), ("minValue", "low")]),
        )
        .unwrap_err();
        assert_eq!(codes(&err), [(ErrorCode::BadVal, Some("minValue"))]);
    }

    #[test]
    fn find_readings_requires_sensor_id() {
        let err = validate_find_command(
            RecordKind::SensorReading,
            &req(&[("minTimestamp", "10")]),
        )
        .unwrap_err();
        assert_eq!(codes(&err), [(ErrorCode::Required, Some("sensorId"))]);
    }

    #[test]
    fn find_filters_feed_typed_searches() {
        let filters = validate_find_command(
            RecordKind::SensorReading,
            &req(&[("sensorId", "s1"), ("minTimestamp", "10"), ("maxValue", "3.5")]),
        )
        .unwrap();
        let search = crate::SensorReadingSearch::from_filters(&filters);
        assert_eq!(search.sensor_id, "s1");
        assert_eq!(search.min_timestamp, Some(10.0));
        assert_eq!(search.max_timestamp, None);
        assert_eq!(search.max_value, Some(3.5));

        let filters =
            validate_find_command(RecordKind::SensorType, &req(&[("min", "20")])).unwrap();
        let search = crate::SensorTypeSearch::from_filters(&filters);
        assert_eq!(search.min, Some(20.0));
        assert_eq!(search.id, None);
    }
}
