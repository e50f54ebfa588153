//! Minimal spatial value with a canonical well-known-text form.

use std::fmt;
use std::str::FromStr;

use crate::error::AccessError;

/// Spatial reference used when none is supplied (WGS 84).
pub const DEFAULT_SRID: i32 = 4326;

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point { x: f64, y: f64, srid: i32 },
}

impl Geometry {
    #[must_use]
    pub fn point(x: f64, y: f64) -> Self {
        Self::Point {
            x,
            y,
            srid: DEFAULT_SRID,
        }
    }

    #[must_use]
    pub fn with_srid(self, srid: i32) -> Self {
        match self {
            Self::Point { x, y, .. } => Self::Point { x, y, srid },
        }
    }

    #[must_use]
    pub fn srid(&self) -> i32 {
        match self {
            Self::Point { srid, .. } => *srid,
        }
    }
}

/// Writes the WKT form, e.g. `POINT (12.5 41.9)`. The SRID is not part of the text.
impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Point { x, y, .. } => write!(f, "POINT ({x} {y})"),
        }
    }
}

/// Parses `POINT (x y)` with an optional `SRID=n;` prefix.
impl FromStr for Geometry {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AccessError::InvalidParameter(format!("invalid geometry '{s}'"));

        let text = s.trim();
        let (srid, text) = match text.split_once(';') {
            Some((prefix, rest)) => {
                let srid = prefix
                    .trim()
                    .strip_prefix("SRID=")
                    .and_then(|n| n.trim().parse::<i32>().ok())
                    .ok_or_else(invalid)?;
                (srid, rest.trim())
            }
            None => (DEFAULT_SRID, text),
        };

        let body = text
            .get(..5)
            .filter(|head| head.eq_ignore_ascii_case("POINT"))
            .map(|_| text[5..].trim())
            .ok_or_else(invalid)?;
        let coords = body
            .strip_prefix('(')
            .and_then(|b| b.strip_suffix(')'))
            .ok_or_else(invalid)?;

        let mut parts = coords.split_whitespace().map(str::parse::<f64>);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(x)), Some(Ok(y)), None) => Ok(Self::Point { x, y, srid }),
            _ => Err(invalid()),
        }
    }
}
