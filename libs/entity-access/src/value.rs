//! Dynamic values and the object-safe view of entity instances.
//!
//! Entity structs are statically typed, but rules, the rewriter and the
//! serializer operate on types unknown at compile time. [`Record`] is the
//! narrow dynamic surface they use; `#[derive(Entity)]` implements it.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, Weak};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use uuid::Uuid;

use crate::geometry::Geometry;
use crate::shape::{PropertyKind, ScalarKind, ShapeCache, TypeShape};

/// Runtime descriptor of an entity type. Equality and hashing use the `TypeId`.
#[derive(Clone, Copy)]
pub struct EntityType {
    id: TypeId,
    name: &'static str,
    qualified_name: &'static str,
    describe: fn() -> TypeShape,
}

impl EntityType {
    #[must_use]
    pub fn of<T: Entity>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: T::NAME,
            qualified_name: std::any::type_name::<T>(),
            describe: T::describe,
        }
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// Declared entity name, used for `$type` and error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fully qualified Rust path of the entity struct.
    #[must_use]
    pub fn qualified_name(&self) -> &'static str {
        self.qualified_name
    }

    pub(crate) fn describe(&self) -> TypeShape {
        (self.describe)()
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EntityType {}

impl Hash for EntityType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Object-safe dynamic view of a record: an entity instance, a projected
/// shape or a provider-materialized view of an entity.
pub trait Record: Any + Send + Sync {
    /// Declared name written as `$type`.
    fn type_name(&self) -> &'static str;

    fn qualified_type_name(&self) -> &'static str {
        self.type_name()
    }

    /// Entity type backing this record, `None` for ad-hoc projections.
    fn entity_type(&self) -> Option<EntityType>;

    /// Property layout in stable declaration order.
    fn shape(&self, cache: &ShapeCache) -> Arc<TypeShape>;

    /// Reads a property by its declared name.
    fn get(&self, property: &str) -> Option<Value>;

    fn as_any(&self) -> &dyn Any;
}

/// A statically known entity type.
///
/// Implemented by `#[derive(Entity)]`.
pub trait Entity: Record + Sized {
    const NAME: &'static str;

    /// Builds the shape of this type. Called once per process by [`ShapeCache`].
    fn describe() -> TypeShape;
}

/// Shared handle to a record. Identity is the allocation address.
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn Record>);

impl ObjectRef {
    #[must_use]
    pub fn new(record: Arc<dyn Record>) -> Self {
        Self(record)
    }

    #[must_use]
    pub fn from_entity<T: Entity>(entity: Arc<T>) -> Self {
        Self(entity)
    }

    /// Allocation identity used by identity maps.
    #[must_use]
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>().addr()
    }

    #[must_use]
    pub fn record(&self) -> &dyn Record {
        self.0.as_ref()
    }

    #[must_use]
    pub fn get(&self, property: &str) -> Option<Value> {
        self.0.get(property)
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    #[must_use]
    pub fn entity_type(&self) -> Option<EntityType> {
        self.0.entity_type()
    }

    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.type_name(), self.addr())
    }
}

/// Dynamically typed value flowing through filters, providers and the serializer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(Decimal),
    Char(char),
    Text(String),
    /// Enum variant, carried by name.
    Enum(&'static str),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
    Geometry(Geometry),
    /// Pre-built JSON payload written through untouched.
    Json(serde_json::Value),
    List(Vec<Value>),
    /// Keyed map in insertion order. `None` keys are never written.
    Map(Vec<(Option<String>, Value)>),
    Object(ObjectRef),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            Self::Enum(s) => Some(*s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Reads `property` when this value is an object.
    #[must_use]
    pub fn field(&self, property: &str) -> Option<Value> {
        self.as_object().and_then(|o| o.get(property))
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => i.to_f64(),
            Self::UInt(u) => u.to_f64(),
            Self::Float(f) => Some(*f),
            Self::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    /// Orders two values of compatible kinds. Numbers compare across
    /// representations; `Null` sorts before everything else.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Null, _) => Some(Ordering::Less),
            (_, Self::Null) => Some(Ordering::Greater),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::UInt(a), Self::UInt(b)) => Some(a.cmp(b)),
            (Self::Decimal(a), Self::Decimal(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::UInt(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (Self::UInt(a), Self::Int(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Char(a), Self::Char(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Enum(a), Self::Enum(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Enum(b)) => Some(a.as_str().cmp(*b)),
            (Self::Enum(a), Self::Text(b)) => Some((*a).cmp(b.as_str())),
            (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
            (Self::Uuid(a), Self::Uuid(b)) => Some(a.cmp(b)),
            (Self::Object(a), Self::Object(b)) if a.ptr_eq(b) => Some(Ordering::Equal),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    /// Equality used by query predicates: numeric kinds compare by value,
    /// text compares with enum names, objects by identity.
    #[must_use]
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            (Self::List(_) | Self::Map(_) | Self::Json(_) | Self::Geometry(_), _) => self == other,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Self::$variant(v)
            }
        })*
    };
}

value_from! {
    bool => Bool,
    i64 => Int,
    u64 => UInt,
    f64 => Float,
    Decimal => Decimal,
    char => Char,
    String => Text,
    DateTime<Utc> => DateTime,
    Uuid => Uuid,
    Geometry => Geometry,
    serde_json::Value => Json,
    ObjectRef => Object,
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// Conversion of entity field types into [`Value`], together with the
/// property kind recorded in the type's shape.
pub trait ToValue {
    fn kind() -> PropertyKind;

    fn to_value(&self) -> Value;
}

macro_rules! scalar_to_value {
    ($($ty:ty => $kind:ident, |$v:ident| $conv:expr;)*) => {
        $(impl ToValue for $ty {
            fn kind() -> PropertyKind {
                PropertyKind::Scalar(ScalarKind::$kind)
            }

            fn to_value(&self) -> Value {
                let $v = self;
                $conv
            }
        })*
    };
}

scalar_to_value! {
    bool => Bool, |v| Value::Bool(*v);
    i8 => Int, |v| Value::Int(i64::from(*v));
    i16 => Int, |v| Value::Int(i64::from(*v));
    i32 => Int, |v| Value::Int(i64::from(*v));
    i64 => Int, |v| Value::Int(*v);
    isize => Int, |v| i64::try_from(*v).map_or(Value::Null, Value::Int);
    u8 => UInt, |v| Value::UInt(u64::from(*v));
    u16 => UInt, |v| Value::UInt(u64::from(*v));
    u32 => UInt, |v| Value::UInt(u64::from(*v));
    u64 => UInt, |v| Value::UInt(*v);
    usize => UInt, |v| u64::try_from(*v).map_or(Value::Null, Value::UInt);
    f32 => Float, |v| Value::Float(f64::from(*v));
    f64 => Float, |v| Value::Float(*v);
    Decimal => Decimal, |v| Value::Decimal(*v);
    char => Char, |v| Value::Char(*v);
    String => Text, |v| Value::Text(v.clone());
    DateTime<Utc> => DateTime, |v| Value::DateTime(*v);
    Uuid => Uuid, |v| Value::Uuid(*v);
    Geometry => Geometry, |v| Value::Geometry(v.clone());
    serde_json::Value => Json, |v| Value::Json(v.clone());
}

impl<T: ToValue> ToValue for Option<T> {
    fn kind() -> PropertyKind {
        T::kind()
    }

    fn to_value(&self) -> Value {
        self.as_ref().map_or(Value::Null, ToValue::to_value)
    }
}

impl<T: ToValue> ToValue for Vec<T> {
    fn kind() -> PropertyKind {
        match T::kind() {
            PropertyKind::Reference(target) => PropertyKind::Collection(target),
            _ => PropertyKind::List,
        }
    }

    fn to_value(&self) -> Value {
        Value::List(self.iter().map(ToValue::to_value).collect())
    }
}

impl<T: ToValue, S: std::hash::BuildHasher> ToValue for HashMap<String, T, S> {
    fn kind() -> PropertyKind {
        PropertyKind::Map
    }

    fn to_value(&self) -> Value {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Some(k.clone()), v.to_value()))
                .collect(),
        )
    }
}

impl<T: ToValue> ToValue for BTreeMap<String, T> {
    fn kind() -> PropertyKind {
        PropertyKind::Map
    }

    fn to_value(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (Some(k.clone()), v.to_value()))
                .collect(),
        )
    }
}

impl<T: ToValue> ToValue for BTreeMap<Option<String>, T> {
    fn kind() -> PropertyKind {
        PropertyKind::Map
    }

    fn to_value(&self) -> Value {
        Value::Map(self.iter().map(|(k, v)| (k.clone(), v.to_value())).collect())
    }
}

impl<T: Entity> ToValue for Arc<T> {
    fn kind() -> PropertyKind {
        PropertyKind::Reference(EntityType::of::<T>())
    }

    fn to_value(&self) -> Value {
        Value::Object(ObjectRef::from_entity(Arc::clone(self)))
    }
}

impl<T: Entity> ToValue for Weak<T> {
    fn kind() -> PropertyKind {
        PropertyKind::Reference(EntityType::of::<T>())
    }

    fn to_value(&self) -> Value {
        self.upgrade()
            .map_or(Value::Null, |e| Value::Object(ObjectRef::from_entity(e)))
    }
}

impl<T: ToValue> ToValue for parking_lot::RwLock<T> {
    fn kind() -> PropertyKind {
        T::kind()
    }

    fn to_value(&self) -> Value {
        self.read().to_value()
    }
}

impl<T: ToValue> ToValue for OnceLock<T> {
    fn kind() -> PropertyKind {
        T::kind()
    }

    fn to_value(&self) -> Value {
        self.get().map_or(Value::Null, ToValue::to_value)
    }
}
