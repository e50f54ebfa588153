//! Named query functions callable by clients.
//!
//! A function receives the principal's visible rows of its entity type plus
//! decoded arguments and returns a narrowed query. Only functions registered
//! with [`FunctionsBuilder::external`] may be invoked through
//! [`SecureDb::call_function`](crate::db::SecureDb::call_function).

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::dispatch::{DispatchCache, DispatchKey};
use crate::error::{AccessError, MethodAccessReason};
use crate::params::QueryParameter;
use crate::query::{QueryContext, QueryState};
use crate::value::Entity;

pub(crate) type FunctionFn<P> =
    Arc<dyn Fn(QueryState, &[QueryParameter], &P) -> Result<QueryState, AccessError> + Send + Sync>;

struct Registered<P> {
    function: FunctionFn<P>,
    external: bool,
}

/// Startup-time registry of query functions.
#[must_use]
pub struct FunctionsBuilder<P> {
    entries: HashMap<TypeId, HashMap<String, Registered<P>>>,
}

impl<P> Default for FunctionsBuilder<P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<P: Send + Sync + 'static> FunctionsBuilder<P> {
    pub fn new() -> Self {
        Self::default()
    }

    fn register<T, F>(mut self, name: &str, external: bool, function: F) -> Self
    where
        T: Entity,
        F: Fn(QueryContext<T>, &[QueryParameter], &P) -> Result<QueryContext<T>, AccessError>
            + Send
            + Sync
            + 'static,
    {
        let function: FunctionFn<P> =
            Arc::new(move |state: QueryState, params: &[QueryParameter], principal: &P| {
                function(QueryContext::from_state(state), params, principal)
                    .map(QueryContext::into_state)
            });
        let previous = self
            .entries
            .entry(TypeId::of::<T>())
            .or_default()
            .insert(name.to_owned(), Registered { function, external });
        if previous.is_some() {
            tracing::debug!(entity = T::NAME, function = name, "replaced query function");
        }
        self
    }

    /// Registers a function clients may call.
    pub fn external<T, F>(self, name: &str, function: F) -> Self
    where
        T: Entity,
        F: Fn(QueryContext<T>, &[QueryParameter], &P) -> Result<QueryContext<T>, AccessError>
            + Send
            + Sync
            + 'static,
    {
        self.register::<T, F>(name, true, function)
    }

    /// Registers a function for server-side use only; calling it from a
    /// client fails with [`MethodAccessReason::NotExternal`].
    pub fn internal<T, F>(self, name: &str, function: F) -> Self
    where
        T: Entity,
        F: Fn(QueryContext<T>, &[QueryParameter], &P) -> Result<QueryContext<T>, AccessError>
            + Send
            + Sync
            + 'static,
    {
        self.register::<T, F>(name, false, function)
    }

    pub fn build(self) -> Functions<P> {
        Functions {
            entries: self.entries,
            cache: DispatchCache::new(),
        }
    }
}

/// Frozen function registry.
pub struct Functions<P> {
    entries: HashMap<TypeId, HashMap<String, Registered<P>>>,
    cache: DispatchCache<Result<FunctionFn<P>, MethodAccessReason>>,
}

impl<P> fmt::Debug for Functions<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Functions")
            .field("types", &self.entries.len())
            .field("resolved", &self.cache.len())
            .finish()
    }
}

impl<P: Send + Sync + 'static> Functions<P> {
    pub fn builder() -> FunctionsBuilder<P> {
        FunctionsBuilder::new()
    }

    /// Number of distinct `(entity, function)` pairs resolved so far.
    #[must_use]
    pub fn resolved_count(&self) -> u64 {
        self.cache.compiled_count()
    }

    pub(crate) fn missing<T: Entity>(name: &str) -> AccessError {
        AccessError::MethodAccess {
            entity: T::NAME,
            method: name.to_owned(),
            reason: MethodAccessReason::Missing,
        }
    }

    /// Resolves a client-callable function of `T`. Unknown names never
    /// reach the dispatch cache.
    pub(crate) fn resolve<T: Entity>(&self, name: &str) -> Result<FunctionFn<P>, AccessError> {
        let Some(registered) = self
            .entries
            .get(&TypeId::of::<T>())
            .and_then(|functions| functions.get(name))
        else {
            tracing::debug!(entity = T::NAME, function = name, "unknown query function");
            return Err(Self::missing::<T>(name));
        };
        let key = DispatchKey::named("function", TypeId::of::<T>(), name);
        self.cache
            .get_or_compile(&key, |_| {
                if registered.external {
                    Ok(Arc::clone(&registered.function))
                } else {
                    Err(MethodAccessReason::NotExternal)
                }
            })
            .map_err(|reason| AccessError::MethodAccess {
                entity: T::NAME,
                method: name.to_owned(),
                reason,
            })
    }
}
