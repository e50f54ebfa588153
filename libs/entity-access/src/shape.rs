//! Precomputed type shapes and navigation metadata.
//!
//! A shape is built once per entity type (on first reference) and shared for
//! the lifetime of the owning [`ShapeCache`]. Nothing here re-inspects a type
//! on the request path.

use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;
use heck::ToLowerCamelCase;
use serde::{Deserialize, Serialize};

use crate::error::AccessError;
use crate::value::EntityType;

/// When a property is left out of serialized output and navigation rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreCondition {
    #[default]
    Never,
    WhenWritingNull,
    /// Never serialized; navigations with this policy are replaced by `null` in queries.
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    Int,
    UInt,
    Float,
    Decimal,
    Char,
    Text,
    Enum,
    DateTime,
    Uuid,
    Geometry,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Scalar(ScalarKind),
    /// Single-valued navigation to another entity.
    Reference(EntityType),
    /// Collection-valued navigation to another entity.
    Collection(EntityType),
    List,
    Map,
    Object,
}

impl PropertyKind {
    #[must_use]
    pub fn navigation_target(&self) -> Option<(EntityType, bool)> {
        match self {
            Self::Reference(t) => Some((*t, false)),
            Self::Collection(t) => Some((*t, true)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyShape {
    name: &'static str,
    camel_name: String,
    rename: Option<&'static str>,
    kind: PropertyKind,
    ignore: IgnoreCondition,
    writable: bool,
    key: bool,
}

impl PropertyShape {
    #[must_use]
    pub fn new(name: &'static str, kind: PropertyKind) -> Self {
        Self {
            name,
            camel_name: name.to_lower_camel_case(),
            rename: None,
            kind,
            ignore: IgnoreCondition::Never,
            writable: true,
            key: false,
        }
    }

    #[must_use]
    pub fn ignore(mut self, condition: IgnoreCondition) -> Self {
        self.ignore = condition;
        self
    }

    /// Fixes the wire name, bypassing the naming policy.
    #[must_use]
    pub fn rename(mut self, wire_name: &'static str) -> Self {
        self.rename = Some(wire_name);
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Marks the property as part of the entity key.
    #[must_use]
    pub fn key(mut self) -> Self {
        self.key = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn camel_name(&self) -> &str {
        &self.camel_name
    }

    #[must_use]
    pub fn renamed(&self) -> Option<&'static str> {
        self.rename
    }

    #[must_use]
    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    #[must_use]
    pub fn ignore_condition(&self) -> IgnoreCondition {
        self.ignore
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[must_use]
    pub fn is_key(&self) -> bool {
        self.key
    }
}

/// Ordered property layout of one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeShape {
    name: &'static str,
    properties: Vec<PropertyShape>,
}

impl TypeShape {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn property(mut self, property: PropertyShape) -> Self {
        self.properties.push(property);
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn properties(&self) -> &[PropertyShape] {
        &self.properties
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&PropertyShape> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Exact match first, then ASCII case-insensitive on the declared or camel name.
    #[must_use]
    pub fn find_ignore_case(&self, name: &str) -> Option<&PropertyShape> {
        self.find(name).or_else(|| {
            self.properties.iter().find(|p| {
                p.name.eq_ignore_ascii_case(name) || p.camel_name.eq_ignore_ascii_case(name)
            })
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &PropertyShape> {
        self.properties.iter().filter(|p| p.key)
    }
}

/// Process-lifetime cache of entity shapes keyed by `TypeId`.
#[derive(Debug, Default)]
pub struct ShapeCache {
    shapes: DashMap<TypeId, Arc<TypeShape>>,
}

impl ShapeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shape of `ty`, describing it on first use.
    #[must_use]
    pub fn shape_of(&self, ty: EntityType) -> Arc<TypeShape> {
        if let Some(shape) = self.shapes.get(&ty.type_id()) {
            return Arc::clone(shape.value());
        }
        self.shapes
            .entry(ty.type_id())
            .or_insert_with(|| Arc::new(ty.describe()))
            .value()
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationDescriptor {
    pub owner: EntityType,
    pub property: &'static str,
    pub target: EntityType,
    pub is_collection: bool,
}

/// Entity model metadata: shapes plus the navigations derived from them.
#[derive(Debug, Default)]
pub struct EntityModel {
    shapes: Arc<ShapeCache>,
    navigations: DashMap<TypeId, Arc<[NavigationDescriptor]>>,
}

impl EntityModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shapes(&self) -> &Arc<ShapeCache> {
        &self.shapes
    }

    #[must_use]
    pub fn shape_of(&self, ty: EntityType) -> Arc<TypeShape> {
        self.shapes.shape_of(ty)
    }

    /// Resolves a property of `owner` by name, ignoring ASCII case.
    ///
    /// # Errors
    /// Returns [`AccessError::UnknownProperty`] when `owner` has no such property.
    pub fn property(&self, owner: EntityType, name: &str) -> Result<PropertyShape, AccessError> {
        self.shape_of(owner)
            .find_ignore_case(name)
            .cloned()
            .ok_or_else(|| AccessError::UnknownProperty {
                entity: owner.name(),
                property: name.to_owned(),
            })
    }

    /// All navigations declared on `owner`.
    #[must_use]
    pub fn navigations_of(&self, owner: EntityType) -> Arc<[NavigationDescriptor]> {
        if let Some(navs) = self.navigations.get(&owner.type_id()) {
            return Arc::clone(navs.value());
        }
        let shape = self.shape_of(owner);
        self.navigations
            .entry(owner.type_id())
            .or_insert_with(|| {
                shape
                    .properties()
                    .iter()
                    .filter_map(|p| {
                        p.kind().navigation_target().map(|(target, is_collection)| {
                            NavigationDescriptor {
                                owner,
                                property: p.name(),
                                target,
                                is_collection,
                            }
                        })
                    })
                    .collect()
            })
            .value()
            .clone()
    }

    /// Navigation metadata for `property`, or `None` when it is not a navigation.
    #[must_use]
    pub fn navigation(&self, owner: EntityType, property: &str) -> Option<NavigationDescriptor> {
        self.navigations_of(owner)
            .iter()
            .find(|n| n.property == property)
            .copied()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_camel_name_is_precomputed() {
        let p = PropertyShape::new("created_at", PropertyKind::Scalar(ScalarKind::DateTime));
        assert_eq!(p.camel_name(), "createdAt");
        assert!(p.is_writable());
        assert!(!p.read_only().is_writable());
    }

    #[test]
    fn test_find_ignore_case() {
        let shape = TypeShape::new("Order")
            .property(PropertyShape::new("customer_id", PropertyKind::Scalar(ScalarKind::Int)))
            .property(PropertyShape::new("total", PropertyKind::Scalar(ScalarKind::Decimal)));
        assert_eq!(shape.find_ignore_case("Total").map(PropertyShape::name), Some("total"));
        assert_eq!(
            shape.find_ignore_case("customerId").map(PropertyShape::name),
            Some("customer_id")
        );
        assert!(shape.find_ignore_case("missing").is_none());
    }
}
