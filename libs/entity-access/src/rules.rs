//! Security rule registry and its dispatch.
//!
//! Rules are registered per entity type and operation on a
//! [`SecurityRulesBuilder`] at startup. [`SecurityRulesBuilder::build`]
//! freezes them into [`SecurityRules`], which has no mutators and is shared
//! read-only by every request.
//!
//! # Resolution
//!
//! | Operation | Lookup order |
//! |-----------|--------------|
//! | select | select rule, then the configured default (`allow` or `deny`) |
//! | insert | insert rule, then deny |
//! | update / delete | specific rule, then the `modify` rule, then deny |
//!
//! A denied select composes `WHERE false` (silent denial); a denied mutation
//! fails with [`AccessError::UnauthorizedAccess`].

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EntityAccessConfig;
use crate::dispatch::{DispatchCache, DispatchKey};
use crate::error::AccessError;
use crate::query::{QueryContext, QueryState};
use crate::value::{Entity, EntityType, ObjectRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    /// Fallback for update and delete.
    Modify,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Modify => "modify",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour of select when no rule is registered for an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    #[default]
    Allow,
    Deny,
}

pub(crate) type FilterFn<P> =
    Arc<dyn Fn(QueryState, &P) -> Result<QueryState, AccessError> + Send + Sync>;

type MapperFn = Arc<dyn Fn(&ObjectRef) -> Value + Send + Sync>;

pub(crate) enum Rule<P> {
    Filter(FilterFn<P>),
    Allow,
    Deny,
}

impl<P> Clone for Rule<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Filter(f) => Self::Filter(Arc::clone(f)),
            Self::Allow => Self::Allow,
            Self::Deny => Self::Deny,
        }
    }
}

fn erase<T, P, F>(filter: F) -> FilterFn<P>
where
    T: Entity,
    P: Send + Sync + 'static,
    F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
{
    Arc::new(move |state: QueryState, principal: &P| {
        filter(QueryContext::from_state(state), principal).map(QueryContext::into_state)
    })
}

/// Identity filter: grants the operation without narrowing the query.
///
/// # Errors
/// Never fails.
pub fn allow<T, P>(query: QueryContext<T>, _principal: &P) -> Result<QueryContext<T>, AccessError> {
    Ok(query)
}

/// Filter that always denies with [`AccessError::UnauthorizedAccess`].
///
/// # Errors
/// Always fails.
#[allow(clippy::needless_pass_by_value)]
pub fn unauthorized<T: Entity, P>(
    query: QueryContext<T>,
    _principal: &P,
) -> Result<QueryContext<T>, AccessError> {
    Err(AccessError::unauthorized(T::NAME, query.operation()))
}

/// Optional per-operation filters for one entity type, applied together by
/// [`SecurityRulesBuilder::set_filters`].
pub struct Filters<T, P> {
    select: Option<FilterFn<P>>,
    insert: Option<FilterFn<P>>,
    update: Option<FilterFn<P>>,
    delete: Option<FilterFn<P>>,
    _entity: std::marker::PhantomData<fn() -> T>,
}

impl<T, P> Default for Filters<T, P> {
    fn default() -> Self {
        Self {
            select: None,
            insert: None,
            update: None,
            delete: None,
            _entity: std::marker::PhantomData,
        }
    }
}

impl<T: Entity, P: Send + Sync + 'static> Filters<T, P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn select<F>(mut self, filter: F) -> Self
    where
        F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
    {
        self.select = Some(erase(filter));
        self
    }

    #[must_use]
    pub fn insert<F>(mut self, filter: F) -> Self
    where
        F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
    {
        self.insert = Some(erase(filter));
        self
    }

    #[must_use]
    pub fn update<F>(mut self, filter: F) -> Self
    where
        F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
    {
        self.update = Some(erase(filter));
        self
    }

    #[must_use]
    pub fn delete<F>(mut self, filter: F) -> Self
    where
        F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
    {
        self.delete = Some(erase(filter));
        self
    }
}

/// Startup-time registry of security rules.
///
/// # Example
/// ```rust,ignore
/// let rules = SecurityRules::<Principal>::builder()
///     .select::<Customer, _>(|q, p| Ok(q.filter(|c| c.member("region").equals(p.region.clone()))))
///     .insert::<Order, _>(unauthorized)
///     .build();
/// ```
#[must_use]
pub struct SecurityRulesBuilder<P> {
    rules: HashMap<(TypeId, Operation), Rule<P>>,
    mappers: HashMap<TypeId, MapperFn>,
    default_select: DefaultPolicy,
}

impl<P: Send + Sync + 'static> Default for SecurityRulesBuilder<P> {
    fn default() -> Self {
        Self {
            rules: HashMap::new(),
            mappers: HashMap::new(),
            default_select: DefaultPolicy::Allow,
        }
    }
}

impl<P: Send + Sync + 'static> SecurityRulesBuilder<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the select default from configuration.
    pub fn with_config(mut self, config: &EntityAccessConfig) -> Self {
        self.default_select = config.default_select;
        self
    }

    pub fn default_select(mut self, policy: DefaultPolicy) -> Self {
        self.default_select = policy;
        self
    }

    fn register<T: Entity>(mut self, operation: Operation, rule: Rule<P>) -> Self {
        if self
            .rules
            .insert((TypeId::of::<T>(), operation), rule)
            .is_some()
        {
            tracing::debug!(entity = T::NAME, %operation, "replaced security rule");
        }
        self
    }

    pub fn select<T, F>(self, filter: F) -> Self
    where
        T: Entity,
        F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
    {
        self.register::<T>(Operation::Select, Rule::Filter(erase(filter)))
    }

    pub fn insert<T, F>(self, filter: F) -> Self
    where
        T: Entity,
        F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
    {
        self.register::<T>(Operation::Insert, Rule::Filter(erase(filter)))
    }

    pub fn update<T, F>(self, filter: F) -> Self
    where
        T: Entity,
        F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
    {
        self.register::<T>(Operation::Update, Rule::Filter(erase(filter)))
    }

    pub fn delete<T, F>(self, filter: F) -> Self
    where
        T: Entity,
        F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
    {
        self.register::<T>(Operation::Delete, Rule::Filter(erase(filter)))
    }

    /// Shared rule for update and delete when no specific one is registered.
    pub fn modify<T, F>(self, filter: F) -> Self
    where
        T: Entity,
        F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
    {
        self.register::<T>(Operation::Modify, Rule::Filter(erase(filter)))
    }

    /// Registers whichever of the given filters are present.
    pub fn set_filters<T: Entity>(mut self, filters: Filters<T, P>) -> Self {
        let pairs = [
            (Operation::Select, filters.select),
            (Operation::Insert, filters.insert),
            (Operation::Update, filters.update),
            (Operation::Delete, filters.delete),
        ];
        for (operation, filter) in pairs
            .into_iter()
            .filter_map(|(operation, filter)| filter.map(|f| (operation, f)))
        {
            self = self.register::<T>(operation, Rule::Filter(filter));
        }
        self
    }

    /// Uses one filter for select, insert, update and delete.
    pub fn set_all_filters<T, F>(self, filter: F) -> Self
    where
        T: Entity,
        F: Fn(QueryContext<T>, &P) -> Result<QueryContext<T>, AccessError> + Send + Sync + 'static,
    {
        let filter = erase(filter);
        [
            Operation::Select,
            Operation::Insert,
            Operation::Update,
            Operation::Delete,
        ]
        .into_iter()
        .fold(self, |builder, operation| {
            builder.register::<T>(operation, Rule::Filter(Arc::clone(&filter)))
        })
    }

    pub fn allow<T: Entity>(self, operation: Operation) -> Self {
        self.register::<T>(operation, Rule::Allow)
    }

    pub fn deny<T: Entity>(self, operation: Operation) -> Self {
        self.register::<T>(operation, Rule::Deny)
    }

    /// Transforms objects of type `T` right before they are serialized.
    pub fn map<T, F>(mut self, mapper: F) -> Self
    where
        T: Entity,
        F: Fn(&ObjectRef) -> Value + Send + Sync + 'static,
    {
        self.mappers.insert(TypeId::of::<T>(), Arc::new(mapper));
        self
    }

    #[must_use]
    pub fn build(self) -> SecurityRules<P> {
        SecurityRules {
            rules: self.rules,
            mappers: self.mappers,
            default_select: self.default_select,
            cache: DispatchCache::new(),
        }
    }
}

/// Frozen rule table with a dispatch cache of resolved rules.
pub struct SecurityRules<P> {
    rules: HashMap<(TypeId, Operation), Rule<P>>,
    mappers: HashMap<TypeId, MapperFn>,
    default_select: DefaultPolicy,
    cache: DispatchCache<Rule<P>>,
}

impl<P> fmt::Debug for SecurityRules<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityRules")
            .field("rules", &self.rules.len())
            .field("mappers", &self.mappers.len())
            .field("default_select", &self.default_select)
            .field("resolved", &self.cache.len())
            .finish()
    }
}

impl<P: Send + Sync + 'static> SecurityRules<P> {
    pub fn builder() -> SecurityRulesBuilder<P> {
        SecurityRulesBuilder::new()
    }

    #[must_use]
    pub fn default_select(&self) -> DefaultPolicy {
        self.default_select
    }

    /// Number of (entity, operation) pairs resolved so far.
    #[must_use]
    pub fn resolved_count(&self) -> u64 {
        self.cache.compiled_count()
    }

    /// Whether an explicit rule (filter, allow or deny) exists for the pair.
    #[must_use]
    pub fn has_rule(&self, entity: EntityType, operation: Operation) -> bool {
        self.rules.contains_key(&(entity.type_id(), operation))
    }

    fn lookup(&self, ty: TypeId, operation: Operation) -> Option<Rule<P>> {
        self.rules.get(&(ty, operation)).cloned()
    }

    fn compile(&self, entity: EntityType, operation: Operation) -> Rule<P> {
        let ty = entity.type_id();
        match operation {
            Operation::Select => self.lookup(ty, operation).unwrap_or(match self.default_select {
                DefaultPolicy::Allow => Rule::Allow,
                DefaultPolicy::Deny => Rule::Deny,
            }),
            Operation::Insert | Operation::Modify => {
                self.lookup(ty, operation).unwrap_or(Rule::Deny)
            }
            Operation::Update | Operation::Delete => self
                .lookup(ty, operation)
                .or_else(|| self.lookup(ty, Operation::Modify))
                .unwrap_or(Rule::Deny),
        }
    }

    pub(crate) fn resolve(&self, entity: EntityType, operation: Operation) -> Rule<P> {
        let key = DispatchKey::new(operation.as_str(), entity.type_id());
        self.cache
            .get_or_compile(&key, |_| self.compile(entity, operation))
    }

    /// Applies the rule for `(entity, operation)` to `state`.
    pub(crate) fn apply(
        &self,
        entity: EntityType,
        operation: Operation,
        state: QueryState,
        principal: &P,
    ) -> Result<QueryState, AccessError> {
        let state = state.for_operation(operation);
        match self.resolve(entity, operation) {
            Rule::Filter(filter) => filter(state, principal),
            Rule::Allow => Ok(state),
            Rule::Deny if operation == Operation::Select => Ok(state.deny_all()),
            Rule::Deny => Err(AccessError::unauthorized(entity.name(), operation)),
        }
    }
}

/// Replaces objects right before serialization.
pub trait ObjectMapper: Send + Sync {
    /// Returns the replacement for `object`, or `None` to keep it.
    fn map_object(&self, object: &ObjectRef) -> Option<Value>;
}

impl<P: Send + Sync + 'static> ObjectMapper for SecurityRules<P> {
    fn map_object(&self, object: &ObjectRef) -> Option<Value> {
        let entity = object.entity_type()?;
        self.mappers
            .get(&entity.type_id())
            .map(|mapper| mapper(object))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::Entity;

    #[derive(Entity)]
    struct Ticket {
        #[entity(key)]
        id: i64,
    }

    fn ticket() -> EntityType {
        EntityType::of::<Ticket>()
    }

    #[test]
    fn test_update_and_delete_fall_back_to_modify() {
        let rules = SecurityRules::<()>::builder()
            .modify::<Ticket, _>(allow)
            .deny::<Ticket>(Operation::Delete)
            .build();

        assert!(matches!(rules.resolve(ticket(), Operation::Update), Rule::Filter(_)));
        assert!(matches!(rules.resolve(ticket(), Operation::Delete), Rule::Deny));
        assert!(matches!(rules.resolve(ticket(), Operation::Insert), Rule::Deny));
        assert!(!rules.has_rule(ticket(), Operation::Update));
    }

    #[test]
    fn test_select_default_follows_policy() {
        let open = SecurityRules::<()>::builder().build();
        assert!(matches!(open.resolve(ticket(), Operation::Select), Rule::Allow));

        let closed = SecurityRules::<()>::builder()
            .default_select(DefaultPolicy::Deny)
            .build();
        assert!(matches!(closed.resolve(ticket(), Operation::Select), Rule::Deny));
        assert_eq!(closed.default_select(), DefaultPolicy::Deny);
    }

    #[test]
    fn test_config_sets_default_select() {
        let config = EntityAccessConfig {
            default_select: DefaultPolicy::Deny,
            ..EntityAccessConfig::default()
        };
        let rules = SecurityRules::<()>::builder().with_config(&config).build();
        assert_eq!(rules.default_select(), DefaultPolicy::Deny);
    }

    #[test]
    fn test_resolution_is_cached_per_pair() {
        let rules = SecurityRules::<()>::builder()
            .set_all_filters::<Ticket, _>(allow)
            .build();
        for _ in 0..3 {
            rules.resolve(ticket(), Operation::Select);
            rules.resolve(ticket(), Operation::Insert);
        }
        assert_eq!(rules.resolved_count(), 2);
        assert!(rules.has_rule(ticket(), Operation::Delete));
        assert!(!rules.has_rule(ticket(), Operation::Modify));
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::Modify.to_string(), "modify");
        assert_eq!(Operation::Select.as_str(), "select");
    }
}
