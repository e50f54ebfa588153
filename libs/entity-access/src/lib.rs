#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Row-level access control over object-relational query providers.
//!
//! Every query starts from the rows of an entity type visible to the current
//! principal. Navigations reached through includes and projections are
//! rewritten so the target type's select rule applies at every hop, and
//! mutations are authorized against their rule before they reach the
//! provider. Results serialize as a reference graph with `$id`/`$type`
//! markers, so shared and cyclic references survive the trip to the client.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use entity_access::{Entity, MemoryProvider, SecureDb, SecurityRules, unauthorized};
//!
//! #[derive(Entity)]
//! struct Customer {
//!     #[entity(key)]
//!     id: i64,
//!     region: String,
//! }
//!
//! let rules = SecurityRules::<Principal>::builder()
//!     .select::<Customer, _>(|q, p| Ok(q.filter(|c| c.member("region").equals(p.region.clone()))))
//!     .insert::<Customer, _>(unauthorized)
//!     .build();
//!
//! let db = SecureDb::new(Arc::new(MemoryProvider::new()), Arc::new(rules), principal);
//! let rows = db.query::<Customer>()?.to_list(&cancel).await?;
//! let json = db.to_wire_rows(rows);
//! ```

extern crate self as entity_access;

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod expr;
pub mod functions;
pub mod geometry;
pub mod memory;
pub mod params;
pub mod provider;
pub mod query;
mod rewrite;
pub mod rules;
pub mod serializer;
pub mod shape;
pub mod value;

pub use config::EntityAccessConfig;
pub use db::{SecureDb, SecureDbBuilder};
pub use dispatch::{DispatchCache, DispatchKey};
pub use error::{AccessError, MethodAccessReason};
pub use expr::{BinaryOp, Expr, ExprType, Lambda, Parameter, UnaryOp};
pub use functions::{Functions, FunctionsBuilder};
pub use geometry::{DEFAULT_SRID, Geometry};
pub use memory::{MaterializedEntity, MemoryProvider, ProjectedRecord};
pub use params::{FromParameter, QueryParameter};
pub use provider::{Change, EntityEvents, QueryProvider};
pub use query::{
    Composable, ERROR_KEY, ErrorSink, IncludableQueryContext, Included, Ordered,
    OrderedQueryContext, Projected, QueryContext,
};
pub use rules::{
    DefaultPolicy, Filters, ObjectMapper, Operation, SecurityRules, SecurityRulesBuilder, allow,
    unauthorized,
};
pub use serializer::{
    GraphSerializer, ID_KEY, NamingPolicy, SerializerSettings, TYPE_KEY, TypeNames,
    WIRE_MAX_DATETIME, WIRE_MIN_DATETIME, format_wire_datetime, parse_wire_datetime,
};
pub use shape::{
    EntityModel, IgnoreCondition, NavigationDescriptor, PropertyKind, PropertyShape, ScalarKind,
    ShapeCache, TypeShape,
};
pub use value::{Entity, EntityType, ObjectRef, Record, ToValue, Value};

pub use entity_access_macros::{Entity, EntityEnum};
