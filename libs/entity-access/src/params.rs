//! Decoding of loosely typed wire arguments into typed filter and function
//! parameters.
//!
//! Clients send numbers as JSON numbers or numeric strings, dates as text
//! and coordinates in several shapes; [`FromParameter`] normalises all of
//! them.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::AccessError;
use crate::geometry::{DEFAULT_SRID, Geometry};
use crate::value::Value;

const NAIVE_DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// One positional argument of a function call or filter.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter(Json);

impl QueryParameter {
    #[must_use]
    pub fn new(value: Json) -> Self {
        Self(value)
    }

    /// Splits a JSON argument array into positional parameters; `null`
    /// means no arguments.
    ///
    /// # Errors
    /// Returns [`AccessError::InvalidParameter`] when `args` is neither an
    /// array nor `null`.
    pub fn from_args(args: &Json) -> Result<Vec<Self>, AccessError> {
        match args {
            Json::Null => Ok(Vec::new()),
            Json::Array(items) => Ok(items.iter().cloned().map(Self).collect()),
            other => Err(invalid("an argument array", other)),
        }
    }

    #[must_use]
    pub fn value(&self) -> &Json {
        &self.0
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Converts to `T`.
    ///
    /// # Errors
    /// Returns [`AccessError::InvalidParameter`] when the value does not
    /// decode as `T`.
    pub fn get<T: FromParameter>(&self) -> Result<T, AccessError> {
        T::from_parameter(&self.0)
    }

    /// Scalar elements of an array parameter: strings, integers and booleans.
    /// Anything else is skipped, and so is a non-array parameter.
    #[must_use]
    pub fn items(&self) -> Vec<Value> {
        let Json::Array(items) = &self.0 else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match item {
                Json::String(s) => Some(Value::Text(s.clone())),
                Json::Number(n) => n.as_i64().map(Value::Int),
                Json::Bool(b) => Some(Value::Bool(*b)),
                _ => None,
            })
            .collect()
    }
}

impl From<Json> for QueryParameter {
    fn from(value: Json) -> Self {
        Self(value)
    }
}

/// Types a [`QueryParameter`] can be decoded into.
pub trait FromParameter: Sized {
    /// # Errors
    /// Returns [`AccessError::InvalidParameter`] on a shape or format mismatch.
    fn from_parameter(value: &Json) -> Result<Self, AccessError>;
}

fn invalid(expected: &str, value: &Json) -> AccessError {
    AccessError::InvalidParameter(format!("expected {expected}, got {value}"))
}

fn text<'a>(expected: &str, value: &'a Json) -> Result<&'a str, AccessError> {
    value.as_str().map(str::trim).ok_or_else(|| invalid(expected, value))
}

impl FromParameter for i64 {
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        match value {
            Json::Number(n) => n.as_i64().ok_or_else(|| invalid("an integer", value)),
            Json::String(s) => s.trim().parse().map_err(|_| invalid("an integer", value)),
            _ => Err(invalid("an integer", value)),
        }
    }
}

impl FromParameter for i32 {
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        i64::from_parameter(value)
            .and_then(|v| i32::try_from(v).map_err(|_| invalid("a 32-bit integer", value)))
    }
}

impl FromParameter for f64 {
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        match value {
            Json::Number(n) => n.as_f64().ok_or_else(|| invalid("a number", value)),
            Json::String(s) => s.trim().parse().map_err(|_| invalid("a number", value)),
            _ => Err(invalid("a number", value)),
        }
    }
}

impl FromParameter for f32 {
    #[allow(clippy::cast_possible_truncation)]
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        f64::from_parameter(value).map(|v| v as f32)
    }
}

impl FromParameter for Decimal {
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        match value {
            Json::Number(n) => n
                .as_i64()
                .map(Decimal::from)
                .or_else(|| n.to_string().parse().ok())
                .or_else(|| n.as_f64().and_then(Decimal::from_f64))
                .ok_or_else(|| invalid("a decimal", value)),
            Json::String(s) => s.trim().parse().map_err(|_| invalid("a decimal", value)),
            _ => Err(invalid("a decimal", value)),
        }
    }
}

impl FromParameter for bool {
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        match value {
            Json::Bool(b) => Ok(*b),
            Json::String(s) if s.trim().eq_ignore_ascii_case("true") => Ok(true),
            Json::String(s) if s.trim().eq_ignore_ascii_case("false") => Ok(false),
            _ => Err(invalid("a boolean", value)),
        }
    }
}

impl FromParameter for String {
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        match value {
            Json::String(s) => Ok(s.clone()),
            Json::Number(n) => Ok(n.to_string()),
            Json::Bool(b) => Ok(b.to_string()),
            _ => Err(invalid("a string", value)),
        }
    }
}

impl FromParameter for DateTime<Utc> {
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        let s = text("a date", value)?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Some(naive) = NAIVE_DATE_TIME_FORMATS
            .iter()
            .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        {
            return Ok(naive.and_utc());
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .ok_or_else(|| invalid("a date", value))
    }
}

impl FromParameter for Uuid {
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        text("a uuid", value)?
            .parse()
            .map_err(|_| invalid("a uuid", value))
    }
}

impl FromParameter for Geometry {
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        let coordinate = |v: Option<&Json>| v.and_then(Json::as_f64).ok_or_else(|| invalid("a point", value));
        match value {
            Json::String(s) => s.parse(),
            Json::Array(items) => Ok(Geometry::point(
                coordinate(items.first())?,
                coordinate(items.get(1))?,
            )),
            Json::Object(map) => {
                let srid = map
                    .get("srid")
                    .and_then(Json::as_i64)
                    .and_then(|s| i32::try_from(s).ok())
                    .unwrap_or(DEFAULT_SRID);
                let point = if map.contains_key("x") {
                    Geometry::point(coordinate(map.get("x"))?, coordinate(map.get("y"))?)
                } else {
                    Geometry::point(
                        coordinate(map.get("longitude"))?,
                        coordinate(map.get("latitude"))?,
                    )
                };
                Ok(point.with_srid(srid))
            }
            _ => Err(invalid("a point", value)),
        }
    }
}

impl<T: FromParameter> FromParameter for Option<T> {
    fn from_parameter(value: &Json) -> Result<Self, AccessError> {
        match value {
            Json::Null => Ok(None),
            other => T::from_parameter(other).map(Some),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn p(value: Json) -> QueryParameter {
        QueryParameter::new(value)
    }

    #[test]
    fn test_from_args_shapes() {
        assert_eq!(QueryParameter::from_args(&json!([1, "a"])).unwrap().len(), 2);
        assert!(QueryParameter::from_args(&json!(5)).is_err());
        assert!(QueryParameter::from_args(&Json::Null).unwrap().is_empty());
    }

    #[test]
    fn test_numbers_accept_numeric_strings() {
        assert_eq!(p(json!("42")).get::<i64>().unwrap(), 42);
        assert_eq!(p(json!(7)).get::<i32>().unwrap(), 7);
        assert!((p(json!("2.5")).get::<f64>().unwrap() - 2.5).abs() < f64::EPSILON);
        assert_eq!(p(json!("19.99")).get::<Decimal>().unwrap(), Decimal::new(1999, 2));
        assert!(p(json!("abc")).get::<i64>().is_err());
        assert!(p(json!(i64::MAX)).get::<i32>().is_err());
    }

    #[test]
    fn test_optional_null() {
        assert_eq!(p(Json::Null).get::<Option<i64>>().unwrap(), None);
        assert_eq!(p(json!(3)).get::<Option<i64>>().unwrap(), Some(3));
        assert!(p(Json::Null).get::<i64>().is_err());
    }

    #[test]
    fn test_dates_normalise_to_utc() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(
            p(json!("2024-03-01T12:00:00+02:00")).get::<DateTime<Utc>>().unwrap(),
            expected
        );
        assert_eq!(
            p(json!("2024-03-01T10:00:00")).get::<DateTime<Utc>>().unwrap(),
            expected
        );
        assert_eq!(
            p(json!("2024-03-01")).get::<DateTime<Utc>>().unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
        assert!(p(json!("yesterday")).get::<DateTime<Utc>>().is_err());
    }

    #[test]
    fn test_geometry_shapes() {
        assert_eq!(
            p(json!("POINT (1 2)")).get::<Geometry>().unwrap(),
            Geometry::point(1.0, 2.0)
        );
        assert_eq!(
            p(json!([3.0, 4.0])).get::<Geometry>().unwrap(),
            Geometry::point(3.0, 4.0)
        );
        assert_eq!(
            p(json!({"x": 5, "y": 6, "srid": 3857})).get::<Geometry>().unwrap(),
            Geometry::point(5.0, 6.0).with_srid(3857)
        );
        let g = p(json!({"longitude": 7.5, "latitude": 8.5})).get::<Geometry>().unwrap();
        assert_eq!(g, Geometry::point(7.5, 8.5));
        assert_eq!(g.srid(), DEFAULT_SRID);
        assert!(p(json!({"x": 1})).get::<Geometry>().is_err());
    }

    #[test]
    fn test_items_skip_non_scalars() {
        let items = p(json!(["a", 1, true, null, {"k": 1}, [2]])).items();
        assert_eq!(items, vec![Value::from("a"), Value::Int(1), Value::Bool(true)]);
        assert!(p(json!("a")).items().is_empty());
    }

    #[test]
    fn test_bool_and_uuid() {
        assert!(p(json!("TRUE")).get::<bool>().unwrap());
        let id = Uuid::nil();
        assert_eq!(p(json!(id.to_string())).get::<Uuid>().unwrap(), id);
    }
}
