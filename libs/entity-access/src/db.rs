//! Secure database facade binding a provider, a rule table and a principal.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::AccessError;
use crate::expr::Expr;
use crate::functions::Functions;
use crate::params::QueryParameter;
use crate::provider::{Change, EntityEvents, QueryProvider};
use crate::query::{ErrorSink, QueryContext, QueryState, SecureSource};
use crate::rules::{Operation, SecurityRules};
use crate::serializer::{GraphSerializer, SerializerSettings};
use crate::shape::EntityModel;
use crate::value::{Entity, EntityType, ObjectRef, Value};

struct DbInner<P> {
    provider: Arc<dyn QueryProvider>,
    rules: Arc<SecurityRules<P>>,
    principal: P,
    functions: Option<Arc<Functions<P>>>,
    settings: SerializerSettings,
}

impl<P: Send + Sync + 'static> SecureSource for DbInner<P> {
    fn provider(&self) -> &dyn QueryProvider {
        self.provider.as_ref()
    }

    fn model(&self) -> &EntityModel {
        self.provider.model()
    }

    fn apply_rule(
        &self,
        entity: EntityType,
        operation: Operation,
        state: QueryState,
    ) -> Result<QueryState, AccessError> {
        self.rules.apply(entity, operation, state, &self.principal)
    }
}

/// Builder for [`SecureDb`].
#[must_use]
pub struct SecureDbBuilder<P> {
    provider: Arc<dyn QueryProvider>,
    rules: Arc<SecurityRules<P>>,
    principal: P,
    functions: Option<Arc<Functions<P>>>,
    settings: Option<SerializerSettings>,
}

impl<P: Send + Sync + 'static> SecureDbBuilder<P> {
    pub fn functions(mut self, functions: Arc<Functions<P>>) -> Self {
        self.functions = Some(functions);
        self
    }

    pub fn serializer(mut self, settings: SerializerSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn build(self) -> SecureDb<P> {
        let shapes = Arc::clone(self.provider.model().shapes());
        let rules = Arc::clone(&self.rules);
        let settings = self
            .settings
            .unwrap_or_else(|| SerializerSettings::new(shapes))
            .with_mapper(rules);
        SecureDb {
            inner: Arc::new(DbInner {
                provider: self.provider,
                rules: self.rules,
                principal: self.principal,
                functions: self.functions,
                settings,
            }),
        }
    }
}

/// Entry point for secured queries and mutations on behalf of one principal.
///
/// Cheap to clone; every clone shares the provider and the rule table.
pub struct SecureDb<P> {
    inner: Arc<DbInner<P>>,
}

impl<P> Clone for SecureDb<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Send + Sync + 'static> SecureDb<P> {
    pub fn builder(
        provider: Arc<dyn QueryProvider>,
        rules: Arc<SecurityRules<P>>,
        principal: P,
    ) -> SecureDbBuilder<P> {
        SecureDbBuilder {
            provider,
            rules,
            principal,
            functions: None,
            settings: None,
        }
    }

    #[must_use]
    pub fn new(provider: Arc<dyn QueryProvider>, rules: Arc<SecurityRules<P>>, principal: P) -> Self {
        Self::builder(provider, rules, principal).build()
    }

    fn source(&self) -> Arc<dyn SecureSource> {
        self.inner.clone()
    }

    #[must_use]
    pub fn principal(&self) -> &P {
        &self.inner.principal
    }

    #[must_use]
    pub fn model(&self) -> &Arc<EntityModel> {
        self.inner.provider.model()
    }

    #[must_use]
    pub fn rules(&self) -> &Arc<SecurityRules<P>> {
        &self.inner.rules
    }

    #[must_use]
    pub fn serializer_settings(&self) -> &SerializerSettings {
        &self.inner.settings
    }

    /// All rows of `T` visible to the principal.
    ///
    /// # Errors
    /// Propagates failures of the select rule of `T`.
    pub fn query<T: Entity>(&self) -> Result<QueryContext<T>, AccessError> {
        QueryState::root(self.source(), EntityType::of::<T>(), ErrorSink::new())
            .map(QueryContext::from_state)
    }

    /// Checks that the principal may perform `operation` on `entity`.
    ///
    /// The operation's rule is applied to a query over the single entity;
    /// the entity must survive the filter.
    ///
    /// # Errors
    /// Returns [`AccessError::UnauthorizedAccess`] when the rule denies or
    /// filters the entity out.
    pub async fn authorize<T: Entity>(
        &self,
        operation: Operation,
        entity: &Arc<T>,
        cancel: &CancellationToken,
    ) -> Result<(), AccessError> {
        let object = ObjectRef::from_entity(Arc::clone(entity));
        self.authorize_object(T::NAME, EntityType::of::<T>(), operation, object, cancel)
            .await
    }

    async fn authorize_object(
        &self,
        name: &'static str,
        entity: EntityType,
        operation: Operation,
        object: ObjectRef,
        cancel: &CancellationToken,
    ) -> Result<(), AccessError> {
        let state = QueryState {
            source: self.source(),
            expr: Expr::Constant(Value::Object(object)),
            errors: ErrorSink::new(),
            operation,
        };
        let filtered = match self.inner.rules.apply(entity, operation, state, &self.inner.principal) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(entity = name, %operation, error = %e, "mutation denied by rule");
                return Err(e);
            }
        };
        let rows = self.inner.provider.execute(&filtered.expr, cancel).await?;
        if rows.iter().any(|r| !r.is_null()) {
            tracing::debug!(entity = name, %operation, "mutation authorized");
            Ok(())
        } else {
            tracing::warn!(entity = name, %operation, "entity filtered out by rule");
            Err(AccessError::unauthorized(name, operation))
        }
    }

    fn events(&self, entity: EntityType) -> Option<Arc<dyn EntityEvents>> {
        self.inner.provider.entity_events(entity)
    }

    /// Authorizes and inserts `entity`, running the entity's lifecycle hooks.
    ///
    /// # Errors
    /// Returns [`AccessError::UnauthorizedAccess`] when denied, hook errors
    /// and provider failures.
    pub async fn insert<T: Entity>(&self, entity: Arc<T>, cancel: &CancellationToken) -> Result<(), AccessError> {
        self.mutate(Operation::Insert, entity, cancel).await
    }

    /// Authorizes and updates `entity`, running the entity's lifecycle hooks.
    ///
    /// # Errors
    /// Returns [`AccessError::UnauthorizedAccess`] when denied, hook errors
    /// and provider failures.
    pub async fn update<T: Entity>(&self, entity: Arc<T>, cancel: &CancellationToken) -> Result<(), AccessError> {
        self.mutate(Operation::Update, entity, cancel).await
    }

    /// Authorizes and deletes `entity`, running the entity's lifecycle hooks.
    ///
    /// # Errors
    /// Returns [`AccessError::UnauthorizedAccess`] when denied, hook errors
    /// and provider failures.
    pub async fn delete<T: Entity>(&self, entity: Arc<T>, cancel: &CancellationToken) -> Result<(), AccessError> {
        self.mutate(Operation::Delete, entity, cancel).await
    }

    async fn mutate<T: Entity>(
        &self,
        operation: Operation,
        entity: Arc<T>,
        cancel: &CancellationToken,
    ) -> Result<(), AccessError> {
        let ty = EntityType::of::<T>();
        let object = ObjectRef::from_entity(entity);
        self.authorize_object(T::NAME, ty, operation, object.clone(), cancel)
            .await?;

        let events = self.events(ty);
        if let Some(events) = &events {
            match operation {
                Operation::Insert => events.inserting(&object).await?,
                Operation::Update => events.updating(&object).await?,
                _ => events.deleting(&object).await?,
            }
        }

        let change = match operation {
            Operation::Insert => Change::Insert(object.clone()),
            Operation::Update => Change::Update(object.clone()),
            _ => Change::Delete(object.clone()),
        };
        self.inner.provider.save(change, cancel).await?;

        if let Some(events) = &events {
            match operation {
                Operation::Insert => events.inserted(&object).await?,
                Operation::Update => events.updated(&object).await?,
                _ => events.deleted(&object).await?,
            }
        }
        Ok(())
    }

    /// Invokes the named query function of `T` with JSON arguments.
    ///
    /// The function starts from the principal's visible rows of `T`, so the
    /// select rule still applies to its result.
    ///
    /// # Errors
    /// Returns [`AccessError::MethodAccess`] when the function is missing or
    /// not external, and [`AccessError::InvalidParameter`] for bad arguments.
    pub fn call_function<T: Entity>(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<QueryContext<T>, AccessError> {
        let params = QueryParameter::from_args(args)?;
        let function = match &self.inner.functions {
            Some(functions) => functions.resolve::<T>(name)?,
            None => return Err(Functions::<P>::missing::<T>(name)),
        };
        let base = self.query::<T>()?;
        function(base.into_state(), params.as_slice(), &self.inner.principal).map(QueryContext::from_state)
    }

    /// Serializes `value` in a single top-level write.
    #[must_use]
    pub fn to_wire(&self, value: &Value) -> serde_json::Value {
        GraphSerializer::new(&self.inner.settings).write(value)
    }

    /// Serializes result rows as one array sharing one identity map.
    #[must_use]
    pub fn to_wire_rows(&self, rows: Vec<Value>) -> serde_json::Value {
        self.to_wire(&Value::List(rows))
    }
}
