//! Narrow contract consumed from the underlying query provider.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AccessError;
use crate::expr::Expr;
use crate::shape::EntityModel;
use crate::value::{EntityType, ObjectRef, Value};

/// A pending change handed to [`QueryProvider::save`].
#[derive(Debug, Clone)]
pub enum Change {
    Insert(ObjectRef),
    Update(ObjectRef),
    Delete(ObjectRef),
}

impl Change {
    #[must_use]
    pub fn entity(&self) -> &ObjectRef {
        match self {
            Self::Insert(e) | Self::Update(e) | Self::Delete(e) => e,
        }
    }
}

/// Executes rewritten query expressions against a backing store.
///
/// Implementations own translation, change tracking and transactions. They
/// are responsible for honouring the cancellation token; this crate never
/// cancels on its own.
#[async_trait]
pub trait QueryProvider: Send + Sync {
    /// Entity model metadata (shapes and navigations) the provider was built for.
    fn model(&self) -> &Arc<EntityModel>;

    /// Runs `query` and returns its rows. A single-valued result yields at most one row.
    async fn execute(
        &self,
        query: &Expr,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, AccessError>;

    async fn count(&self, query: &Expr, cancel: &CancellationToken) -> Result<u64, AccessError>;

    /// Provider-specific rendering of `query`, for diagnostics.
    fn to_query_string(&self, query: &Expr) -> String {
        query.to_string()
    }

    async fn save(&self, change: Change, cancel: &CancellationToken) -> Result<(), AccessError>;

    /// Lifecycle hooks registered for `entity`, if any.
    fn entity_events(&self, entity: EntityType) -> Option<Arc<dyn EntityEvents>> {
        let _ = entity;
        None
    }
}

/// Pre/post hooks around entity mutations. Every hook defaults to a no-op;
/// returning an error from a pre-hook aborts the mutation.
#[async_trait]
pub trait EntityEvents: Send + Sync {
    async fn inserting(&self, entity: &ObjectRef) -> Result<(), AccessError> {
        let _ = entity;
        Ok(())
    }

    async fn inserted(&self, entity: &ObjectRef) -> Result<(), AccessError> {
        let _ = entity;
        Ok(())
    }

    async fn updating(&self, entity: &ObjectRef) -> Result<(), AccessError> {
        let _ = entity;
        Ok(())
    }

    async fn updated(&self, entity: &ObjectRef) -> Result<(), AccessError> {
        let _ = entity;
        Ok(())
    }

    async fn deleting(&self, entity: &ObjectRef) -> Result<(), AccessError> {
        let _ = entity;
        Ok(())
    }

    async fn deleted(&self, entity: &ObjectRef) -> Result<(), AccessError> {
        let _ = entity;
        Ok(())
    }
}
