#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! # entity-access-macros
//!
//! Procedural macros for the `entity-access` layer.
//!
//! ## `#[derive(Entity)]`
//!
//! Implements `Record` and `Entity` for a struct with named fields. The type
//! shape lists the fields in declaration order; the kind of every field comes
//! from its `ToValue` implementation, so `Arc<T>`, `Weak<T>` and
//! `OnceLock<Arc<T>>` fields become reference navigations and `Vec<Arc<T>>`
//! fields collection navigations.
//!
//! ### Example
//!
//! ```ignore
//! use entity_access::Entity;
//!
//! #[derive(Entity)]
//! #[entity(name = "Order")]
//! pub struct OrderRow {
//!     #[entity(key)]
//!     pub id: i64,
//!     pub customer: Weak<Customer>,
//!     pub lines: RwLock<Vec<Arc<OrderLine>>>,
//!     #[entity(ignore)]
//!     pub internal_note: String,
//! }
//! ```
//!
//! ### Attributes
//!
//! On the struct:
//! - `name = "..."`: entity name written as `$type` (defaults to the struct name)
//!
//! On fields:
//! - `ignore`: never serialized
//! - `skip_null`: omitted from output when null
//! - `skip`: not part of the entity at all
//! - `rename = "..."`: wire name, bypassing the naming policy
//! - `read_only`: not writable by clients
//! - `key`: part of the entity key used by providers to locate rows
//!
//! ## `#[derive(EntityEnum)]`
//!
//! Implements `ToValue` for a fieldless enum, carrying the variant name
//! (or its `#[entity(rename = "...")]`) on the wire.

use proc_macro::TokenStream;
use proc_macro_error2::proc_macro_error;
use syn::{DeriveInput, parse_macro_input};

mod entity;

/// Derive macro for implementing `Record` and `Entity`.
///
/// # Attributes
///
/// - `#[entity(name = "...")]` on the struct
/// - `#[entity(ignore)]`, `#[entity(skip_null)]`, `#[entity(skip)]`,
///   `#[entity(rename = "...")]`, `#[entity(read_only)]`, `#[entity(key)]` on fields
///
/// `ignore` and `skip_null` are mutually exclusive; `skip` cannot be combined
/// with anything else.
#[proc_macro_derive(Entity, attributes(entity))]
#[proc_macro_error]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    entity::expand_derive_entity(input).into()
}

/// Derive macro for enums stored in entity fields.
#[proc_macro_derive(EntityEnum, attributes(entity))]
#[proc_macro_error]
pub fn derive_entity_enum(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    entity::expand_derive_entity_enum(input).into()
}
