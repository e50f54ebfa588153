//! Reference-tracking object graph serializer.
//!
//! Every object gets a sequential `$id` (a decimal string, starting at `"0"`
//! in first-visit order) and a `$type`. A second visit of the same allocation
//! writes only `{"$id": ..}`, so shared references are written once and
//! cycles terminate. Sequences and maps never get ids.
//!
//! The identity map lives in a [`GraphSerializer`], which is consumed by
//! [`GraphSerializer::write`]; ids never leak between calls.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use heck::{ToLowerCamelCase, ToSnakeCase};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as Json};

use crate::config::EntityAccessConfig;
use crate::error::AccessError;
use crate::rules::ObjectMapper;
use crate::shape::{IgnoreCondition, PropertyShape, ShapeCache};
use crate::value::{ObjectRef, Value};

/// Reserved key carrying an object's id.
pub const ID_KEY: &str = "$id";
/// Reserved key carrying an object's type name.
pub const TYPE_KEY: &str = "$type";

/// Casing applied to property names and map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingPolicy {
    #[default]
    CamelCase,
    SnakeCase,
    AsDeclared,
}

impl NamingPolicy {
    /// Applies the policy to an arbitrary key.
    #[must_use]
    pub fn apply(self, key: &str) -> String {
        match self {
            Self::CamelCase => key.to_lower_camel_case(),
            Self::SnakeCase => key.to_snake_case(),
            Self::AsDeclared => key.to_owned(),
        }
    }

    fn property_key(self, property: &PropertyShape) -> String {
        if let Some(renamed) = property.renamed() {
            return renamed.to_owned();
        }
        match self {
            Self::CamelCase => property.camel_name().to_owned(),
            Self::SnakeCase | Self::AsDeclared => self.apply(property.name()),
        }
    }
}

/// Source of the `$type` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeNames {
    /// Declared entity name, e.g. `Order`.
    #[default]
    Declared,
    /// Full Rust type path, e.g. `shop::model::Order`.
    Qualified,
}

/// Immutable serializer settings, shared by every call.
#[derive(Clone)]
pub struct SerializerSettings {
    naming: NamingPolicy,
    type_names: TypeNames,
    shapes: Arc<ShapeCache>,
    mapper: Option<Arc<dyn ObjectMapper>>,
}

impl fmt::Debug for SerializerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializerSettings")
            .field("naming", &self.naming)
            .field("type_names", &self.type_names)
            .field("shapes", &self.shapes.len())
            .field("mapper", &self.mapper.is_some())
            .finish()
    }
}

impl Default for SerializerSettings {
    fn default() -> Self {
        Self::new(Arc::new(ShapeCache::new()))
    }
}

impl SerializerSettings {
    #[must_use]
    pub fn new(shapes: Arc<ShapeCache>) -> Self {
        Self {
            naming: NamingPolicy::default(),
            type_names: TypeNames::default(),
            shapes,
            mapper: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &EntityAccessConfig, shapes: Arc<ShapeCache>) -> Self {
        Self::new(shapes)
            .with_naming(config.naming_policy)
            .with_type_names(config.type_names)
    }

    #[must_use]
    pub fn with_naming(mut self, naming: NamingPolicy) -> Self {
        self.naming = naming;
        self
    }

    #[must_use]
    pub fn with_type_names(mut self, type_names: TypeNames) -> Self {
        self.type_names = type_names;
        self
    }

    /// Objects are passed through `mapper` once per call before being written.
    #[must_use]
    pub fn with_mapper(mut self, mapper: Arc<dyn ObjectMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    #[must_use]
    pub fn naming(&self) -> NamingPolicy {
        self.naming
    }

    #[must_use]
    pub fn type_names(&self) -> TypeNames {
        self.type_names
    }
}

/// One top-level serialization.
///
/// The walk keeps its pending containers on a heap-allocated stack, so the
/// nesting depth of the graph is bounded by memory, not by the thread stack.
pub struct GraphSerializer<'a> {
    settings: &'a SerializerSettings,
    // Values hold the object so its address cannot be reused mid-call.
    ids: HashMap<usize, (usize, ObjectRef)>,
    mapped: HashMap<usize, (ObjectRef, Value)>,
}

/// Result of visiting one value: either written, or a container whose
/// children are still pending.
enum Step<'v> {
    Done(Json),
    Open(Frame<'v>),
}

/// A container being written. Children borrowed from the root are never
/// cloned; children read from records are owned.
enum Frame<'v> {
    Array {
        items: Vec<Json>,
        pending: std::vec::IntoIter<Cow<'v, Value>>,
    },
    Object {
        fields: Map<String, Json>,
        pending: std::vec::IntoIter<(String, Cow<'v, Value>)>,
        key: String,
    },
}

impl<'v> Frame<'v> {
    fn array(pending: Vec<Cow<'v, Value>>) -> Self {
        Self::Array {
            items: Vec::with_capacity(pending.len()),
            pending: pending.into_iter(),
        }
    }

    fn object(fields: Map<String, Json>, pending: Vec<(String, Cow<'v, Value>)>) -> Self {
        Self::Object {
            fields,
            pending: pending.into_iter(),
            key: String::new(),
        }
    }

    fn next_child(&mut self) -> Option<Cow<'v, Value>> {
        match self {
            Self::Array { pending, .. } => pending.next(),
            Self::Object { pending, key, .. } => pending.next().map(|(k, v)| {
                *key = k;
                v
            }),
        }
    }

    fn accept(&mut self, json: Json) {
        match self {
            Self::Array { items, .. } => items.push(json),
            Self::Object { fields, key, .. } => {
                fields.insert(std::mem::take(key), json);
            }
        }
    }

    fn finish(self) -> Json {
        match self {
            Self::Array { items, .. } => Json::Array(items),
            Self::Object { fields, .. } => Json::Object(fields),
        }
    }
}

impl<'a> GraphSerializer<'a> {
    #[must_use]
    pub fn new(settings: &'a SerializerSettings) -> Self {
        Self {
            settings,
            ids: HashMap::new(),
            mapped: HashMap::new(),
        }
    }

    /// Writes `root` and everything reachable from it.
    #[must_use]
    pub fn write(mut self, root: &Value) -> Json {
        let mut stack: Vec<Frame<'_>> = Vec::new();
        let mut step = self.visit(Cow::Borrowed(root));
        loop {
            match step {
                Step::Open(frame) => stack.push(frame),
                Step::Done(json) => match stack.last_mut() {
                    Some(parent) => parent.accept(json),
                    None => {
                        tracing::trace!(objects = self.ids.len(), "serialized object graph");
                        return json;
                    }
                },
            }
            step = match stack.last_mut().and_then(Frame::next_child) {
                Some(child) => self.visit(child),
                None => Step::Done(stack.pop().map_or(Json::Null, Frame::finish)),
            };
        }
    }

    fn visit<'v>(&mut self, value: Cow<'v, Value>) -> Step<'v> {
        let naming = self.settings.naming;
        match value {
            Cow::Borrowed(Value::List(items)) => {
                Step::Open(Frame::array(items.iter().map(Cow::Borrowed).collect()))
            }
            Cow::Owned(Value::List(items)) => {
                Step::Open(Frame::array(items.into_iter().map(Cow::Owned).collect()))
            }
            Cow::Borrowed(Value::Map(entries)) => {
                let pending = entries
                    .iter()
                    .filter_map(|(key, v)| key.as_deref().map(|key| (naming.apply(key), Cow::Borrowed(v))))
                    .collect();
                Step::Open(Frame::object(Map::new(), pending))
            }
            Cow::Owned(Value::Map(entries)) => {
                let pending = entries
                    .into_iter()
                    .filter_map(|(key, v)| key.map(|key| (naming.apply(&key), Cow::Owned(v))))
                    .collect();
                Step::Open(Frame::object(Map::new(), pending))
            }
            Cow::Borrowed(Value::Object(object)) => self.visit_object(object, true),
            Cow::Owned(Value::Object(object)) => self.visit_object(&object, true),
            scalar => Step::Done(scalar_to_json(&scalar)),
        }
    }

    fn mapped_value(&mut self, object: &ObjectRef) -> Option<Value> {
        if let Some((_, value)) = self.mapped.get(&object.addr()) {
            return Some(value.clone());
        }
        let value = self.settings.mapper.as_ref()?.map_object(object)?;
        self.mapped
            .insert(object.addr(), (object.clone(), value.clone()));
        Some(value)
    }

    fn visit_object<'v>(&mut self, object: &ObjectRef, map: bool) -> Step<'v> {
        if let Some((id, _)) = self.ids.get(&object.addr()) {
            let mut stub = Map::new();
            stub.insert(ID_KEY.to_owned(), Json::String(id.to_string()));
            return Step::Done(Json::Object(stub));
        }
        if map && let Some(mapped) = self.mapped_value(object) {
            return match mapped {
                Value::Object(replacement) => self.visit_object(&replacement, false),
                other => self.visit(Cow::Owned(other)),
            };
        }

        let id = self.ids.len();
        self.ids.insert(object.addr(), (id, object.clone()));

        let record = object.record();
        let type_name = match self.settings.type_names {
            TypeNames::Declared => record.type_name(),
            TypeNames::Qualified => record.qualified_type_name(),
        };
        let mut fields = Map::new();
        fields.insert(ID_KEY.to_owned(), Json::String(id.to_string()));
        fields.insert(TYPE_KEY.to_owned(), Json::String(type_name.to_owned()));

        let shape = record.shape(&self.settings.shapes);
        let mut pending = Vec::with_capacity(shape.properties().len());
        for property in shape.properties() {
            let ignore = property.ignore_condition();
            if ignore == IgnoreCondition::Always {
                continue;
            }
            let value = record.get(property.name()).unwrap_or_default();
            if value.is_null() && ignore == IgnoreCondition::WhenWritingNull {
                continue;
            }
            pending.push((self.settings.naming.property_key(property), Cow::Owned(value)));
        }
        Step::Open(Frame::object(fields, pending))
    }
}

/// Writes a leaf value. Containers are opened by the walk and never reach here.
fn scalar_to_json(value: &Value) -> Json {
    match value {
        Value::Null | Value::List(_) | Value::Map(_) | Value::Object(_) => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::UInt(u) => Json::from(*u),
        Value::Float(f) => Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Value::Decimal(d) => decimal_to_json(*d),
        Value::Char(c) => Json::String(c.to_string()),
        Value::Text(s) => Json::String(s.clone()),
        Value::Enum(name) => Json::String((*name).to_owned()),
        Value::DateTime(dt) => Json::String(format_wire_datetime(dt)),
        Value::Uuid(id) => Json::String(id.to_string()),
        Value::Geometry(g) => Json::String(g.to_string()),
        Value::Json(raw) => raw.clone(),
    }
}

/// Earliest instant the wire format can express.
pub const WIRE_MIN_DATETIME: &str = "0001-01-01T00:00:00.0000000Z";
/// Latest instant the wire format can express.
pub const WIRE_MAX_DATETIME: &str = "9999-12-31T23:59:59.9999999Z";

/// Formats `dt` as `yyyy-MM-ddTHH:mm:ss.fffffffZ`.
///
/// Instants before year 1 or after year 9999 are clamped to
/// [`WIRE_MIN_DATETIME`] and [`WIRE_MAX_DATETIME`].
#[must_use]
pub fn format_wire_datetime(dt: &DateTime<Utc>) -> String {
    match dt.year() {
        ..=0 => WIRE_MIN_DATETIME.to_owned(),
        10_000.. => WIRE_MAX_DATETIME.to_owned(),
        _ => {
            let ticks = dt.timestamp_subsec_nanos().min(999_999_999).div_euclid(100);
            format!("{}.{ticks:07}Z", dt.format("%Y-%m-%dT%H:%M:%S"))
        }
    }
}

/// Parses a wire date-time back into UTC.
///
/// # Errors
/// Returns [`AccessError::InvalidParameter`] when `s` is not an RFC 3339 timestamp.
pub fn parse_wire_datetime(s: &str) -> Result<DateTime<Utc>, AccessError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AccessError::InvalidParameter(format!("invalid date-time '{s}': {e}")))
}

/// Writes a decimal as a JSON number when `f64` represents it exactly,
/// otherwise as its exact decimal text.
fn decimal_to_json(d: Decimal) -> Json {
    d.to_f64()
        .filter(|f| Decimal::from_f64(*f).is_some_and(|back| back.normalize() == d.normalize()))
        .and_then(Number::from_f64)
        .map_or_else(|| Json::String(d.to_string()), Json::Number)
}
