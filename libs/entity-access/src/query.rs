//! Immutable, composable query values.
//!
//! Every operation on a [`QueryContext`] consumes it and returns a new one;
//! nothing is ever mutated in place. Navigation traversals introduced through
//! `include`, `then_include` and `select` are routed through the expression
//! rewriter so the target type's select rule is injected at every hop.
//!
//! The stage parameter is a typestate: `then_by` exists only after an
//! ordering, `then_include` only after an include.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::AccessError;
use crate::expr::{Expr, ExprType, Lambda, navigation_member};
use crate::provider::QueryProvider;
use crate::rewrite::ExpressionRewriter;
use crate::rules::Operation;
use crate::shape::EntityModel;
use crate::value::{Entity, EntityType, Value};

/// Key under which `requires` records its messages.
pub const ERROR_KEY: &str = "Error";

/// Shared, append-only list of `(key, message)` diagnostics recorded during
/// composition. Clones share the same list.
///
/// One sink is created per root query; every query derived from it, including
/// the sub-queries built for navigation rules and `set`, appends to that sink.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink(Arc<Mutex<Vec<(String, String)>>>);

impl ErrorSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, key: impl Into<String>, message: impl Into<String>) {
        self.0.lock().push((key.into(), message.into()));
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(String, String)> {
        self.0.lock().clone()
    }

    /// Messages recorded under `key`, in order.
    #[must_use]
    pub fn messages(&self, key: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, m)| m.clone())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Everything a query needs besides its expression: the provider, metadata
/// and the rule table bound to the current principal.
pub(crate) trait SecureSource: Send + Sync {
    fn provider(&self) -> &dyn QueryProvider;

    fn model(&self) -> &EntityModel;

    fn apply_rule(
        &self,
        entity: EntityType,
        operation: Operation,
        state: QueryState,
    ) -> Result<QueryState, AccessError>;
}

/// Untyped query value shared by every [`QueryContext`] stage.
#[derive(Clone)]
pub(crate) struct QueryState {
    pub(crate) source: Arc<dyn SecureSource>,
    pub(crate) expr: Expr,
    pub(crate) errors: ErrorSink,
    pub(crate) operation: Operation,
}

impl QueryState {
    /// Root query over all rows of `entity`, narrowed by its select rule.
    pub(crate) fn root(
        source: Arc<dyn SecureSource>,
        entity: EntityType,
        errors: ErrorSink,
    ) -> Result<Self, AccessError> {
        let state = Self {
            source: Arc::clone(&source),
            expr: Expr::Set(entity),
            errors,
            operation: Operation::Select,
        };
        source.apply_rule(entity, Operation::Select, state)
    }

    pub(crate) fn ty(&self) -> ExprType {
        self.expr.type_of(self.source.model())
    }

    pub(crate) fn with_expr(self, expr: Expr) -> Self {
        Self { expr, ..self }
    }

    pub(crate) fn for_operation(self, operation: Operation) -> Self {
        Self { operation, ..self }
    }

    /// Composes `WHERE false`.
    pub(crate) fn deny_all(self) -> Self {
        let item = self.ty().item();
        let predicate = Lambda::new(item, |_| Expr::constant(false));
        let source = Box::new(self.expr.clone());
        self.with_expr(Expr::Where { source, predicate })
    }

    fn filter(self, predicate: impl FnOnce(Expr) -> Expr) -> Self {
        let predicate = Lambda::new(self.ty().item(), predicate);
        let source = Box::new(self.expr.clone());
        self.with_expr(Expr::Where { source, predicate })
    }
}

/// Stage of a freshly composed query.
#[derive(Debug, Clone, Copy, Default)]
pub struct Composable;

/// Stage after `order_by`; enables `then_by`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ordered;

/// Stage after `include`; remembers the type of the last included navigation.
#[derive(Debug, Clone)]
pub struct Included {
    previous: ExprType,
}

/// Element marker for queries whose rows are ad-hoc projected records.
#[derive(Debug, Clone, Copy)]
pub enum Projected {}

pub type OrderedQueryContext<T> = QueryContext<T, Ordered>;
pub type IncludableQueryContext<T> = QueryContext<T, Included>;

/// Typed, immutable query over rows of `T`.
#[must_use]
pub struct QueryContext<T, S = Composable> {
    state: QueryState,
    stage: S,
    _rows: PhantomData<fn() -> T>,
}

impl<T, S: Clone> Clone for QueryContext<T, S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            stage: self.stage.clone(),
            _rows: PhantomData,
        }
    }
}

impl<T> QueryContext<T> {
    pub(crate) fn from_state(state: QueryState) -> Self {
        Self {
            state,
            stage: Composable,
            _rows: PhantomData,
        }
    }
}

impl<T, S> QueryContext<T, S> {
    pub(crate) fn into_state(self) -> QueryState {
        self.state
    }

    fn next<U, S2>(state: QueryState, stage: S2) -> QueryContext<U, S2> {
        QueryContext {
            state,
            stage,
            _rows: PhantomData,
        }
    }

    fn compose(self, expr: Expr) -> QueryContext<T> {
        QueryContext::from_state(self.state.with_expr(expr))
    }

    fn rewriter(&self) -> ExpressionRewriter<'_> {
        ExpressionRewriter::new(&self.state)
    }

    /// The wrapped expression.
    #[must_use]
    pub fn expression(&self) -> &Expr {
        &self.state.expr
    }

    /// Diagnostics recorded by [`requires`](Self::requires) anywhere in this
    /// query, navigation rules included.
    #[must_use]
    pub fn errors(&self) -> &ErrorSink {
        &self.state.errors
    }

    /// Operation this query is being filtered for.
    #[must_use]
    pub fn operation(&self) -> Operation {
        self.state.operation
    }

    /// Provider rendering of the current expression.
    #[must_use]
    pub fn to_query_string(&self) -> String {
        self.state.source.provider().to_query_string(&self.state.expr)
    }

    pub fn filter(self, predicate: impl FnOnce(Expr) -> Expr) -> QueryContext<T> {
        QueryContext::from_state(self.state.filter(predicate))
    }

    /// Adds `predicate` as a constraint and records `message` in the error sink.
    ///
    /// Composition never fails here: the caller decides after materialization
    /// whether an empty result combined with recorded messages is a validation
    /// failure.
    pub fn requires(
        self,
        predicate: impl FnOnce(Expr) -> Expr,
        message: impl Into<String>,
    ) -> QueryContext<T> {
        self.state.errors.push(ERROR_KEY, message);
        QueryContext::from_state(self.state.filter(predicate))
    }

    pub fn skip(self, count: usize) -> QueryContext<T> {
        let source = Box::new(self.state.expr.clone());
        self.compose(Expr::Skip { source, count })
    }

    pub fn take(self, count: usize) -> QueryContext<T> {
        let source = Box::new(self.state.expr.clone());
        self.compose(Expr::Take { source, count })
    }

    pub fn as_split_query(self) -> QueryContext<T> {
        let source = Box::new(self.state.expr.clone());
        self.compose(Expr::SplitQuery(source))
    }

    fn ordered(self, key: impl FnOnce(Expr) -> Expr, descending: bool, then: bool) -> QueryContext<T, Ordered> {
        let key = Lambda::new(self.state.ty().item(), key);
        let source = Box::new(self.state.expr.clone());
        let state = self.state.with_expr(Expr::OrderBy {
            source,
            key,
            descending,
            then,
        });
        Self::next(state, Ordered)
    }

    pub fn order_by(self, key: impl FnOnce(Expr) -> Expr) -> QueryContext<T, Ordered> {
        self.ordered(key, false, false)
    }

    pub fn order_by_descending(self, key: impl FnOnce(Expr) -> Expr) -> QueryContext<T, Ordered> {
        self.ordered(key, true, false)
    }

    /// Rows of a related entity type, narrowed by that type's select rule.
    ///
    /// # Errors
    /// Propagates failures of the select rule of `U`.
    pub fn set<U: Entity>(&self) -> Result<QueryContext<U>, AccessError> {
        QueryState::root(
            Arc::clone(&self.state.source),
            EntityType::of::<U>(),
            self.state.errors.clone(),
        )
        .map(QueryContext::from_state)
    }

    /// Keeps only rows whose runtime type is `U`.
    pub fn of_type<U: Entity>(self) -> QueryContext<U> {
        let source = Box::new(self.state.expr.clone());
        let state = self.state.with_expr(Expr::OfType {
            source,
            target: EntityType::of::<U>(),
        });
        Self::next(state, Composable)
    }

    /// Projects every row through `projection`.
    ///
    /// Navigation members referenced by the projection (directly or as record
    /// members) are rewritten so the target type's select rule applies, and
    /// collection members are materialized.
    ///
    /// # Errors
    /// Fails when the projection names an unknown property or a navigation
    /// rule fails.
    pub fn select(self, projection: impl FnOnce(Expr) -> Expr) -> Result<QueryContext<Projected>, AccessError> {
        let lambda = Lambda::new(self.state.ty().item(), projection);
        let body = self.rewriter().rewrite_projection(lambda.body())?;
        let source = Box::new(self.state.expr.clone());
        let state = self.state.with_expr(Expr::Select {
            source,
            projection: lambda.with_body(body),
        });
        Ok(Self::next(state, Composable))
    }

    /// Includes a dotted navigation path, e.g. `"customer.orders.lines"`.
    ///
    /// Segments resolve case-insensitively; the first is an include and every
    /// following one a then-include on the previous segment.
    ///
    /// # Errors
    /// Returns [`AccessError::InvalidPath`] when a segment does not resolve.
    pub fn include(self, path: &str) -> Result<QueryContext<T, Included>, AccessError> {
        let mut segments = path.split('.').map(str::trim);
        let owner = self.state.ty().item();
        let first = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid_path(path, "empty path"))?;
        let mut query = self.include_segment(path, first, &owner, false)?;
        for segment in segments {
            let previous = query.stage.previous.item();
            query = query.include_segment(path, segment, &previous, true)?;
        }
        Ok(query)
    }

    /// Includes the navigation selected by `navigation`, e.g.
    /// `|o| o.member("lines").filter(|l| l.member("qty").greater_than(0))`.
    ///
    /// # Errors
    /// Returns [`AccessError::InvalidPath`] when the body reaches through more
    /// than one navigation, and fails when it names an unknown property or a
    /// navigation rule fails.
    pub fn include_with(
        self,
        navigation: impl FnOnce(Expr) -> Expr,
    ) -> Result<QueryContext<T, Included>, AccessError> {
        let owner = self.state.ty().item();
        self.include_lambda(Lambda::new(owner, navigation), None, false)
    }

    fn include_segment(
        self,
        path: &str,
        segment: &str,
        owner: &ExprType,
        then: bool,
    ) -> Result<QueryContext<T, Included>, AccessError> {
        let Some(entity) = owner.element_entity() else {
            return Err(invalid_path(path, &format!("'{segment}' does not follow an entity")));
        };
        if segment.is_empty() {
            return Err(invalid_path(path, "empty segment"));
        }
        let property = self
            .state
            .source
            .model()
            .property(entity, segment)
            .map_err(|e| invalid_path(path, &e.to_string()))?;
        tracing::trace!(entity = entity.name(), segment, then, "resolved include segment");
        let lambda = Lambda::new(ExprType::Entity(entity), |x| x.member(property.name()));
        let expected = match ExprType::of_kind(property.kind()) {
            ExprType::List(item) => Some(ExprType::Sequence(item)),
            _ => None,
        };
        self.include_lambda(lambda, expected, then)
    }

    /// `expected` is the type the include accepts for the navigation; `None`
    /// keeps the navigation's declared type.
    ///
    /// The body must read exactly one navigation of the lambda's parameter;
    /// deeper navigations are reached with `then_include`.
    fn include_lambda(
        self,
        lambda: Lambda,
        expected: Option<ExprType>,
        then: bool,
    ) -> Result<QueryContext<T, Included>, AccessError> {
        match navigation_member(lambda.body()) {
            Some((Expr::Parameter(_), _)) => {}
            Some((_, name)) => {
                return Err(invalid_path(
                    &lambda.body().to_string(),
                    &format!("'{name}' is not a navigation of the included entity; reach it with then_include"),
                ));
            }
            None => {
                return Err(invalid_path(
                    &lambda.body().to_string(),
                    "an include must read a navigation property",
                ));
            }
        }
        let previous = lambda.body().type_of(self.state.source.model());
        let body = self.rewriter().replace(lambda.body(), false, expected)?;
        let source = Box::new(self.state.expr.clone());
        let state = self.state.with_expr(Expr::Include {
            source,
            navigation: lambda.with_body(body),
            then,
        });
        Ok(Self::next(state, Included { previous }))
    }

    /// Executes the query and returns its rows.
    ///
    /// # Errors
    /// Returns provider failures and [`AccessError::Cancelled`].
    pub async fn to_list(self, cancel: &CancellationToken) -> Result<Vec<Value>, AccessError> {
        self.state
            .source
            .provider()
            .execute(&self.state.expr, cancel)
            .await
    }

    /// Counts the rows of the query.
    ///
    /// # Errors
    /// Returns provider failures and [`AccessError::Cancelled`].
    pub async fn count(self, cancel: &CancellationToken) -> Result<u64, AccessError> {
        self.state
            .source
            .provider()
            .count(&self.state.expr, cancel)
            .await
    }
}

impl<T> QueryContext<T, Ordered> {
    fn then(self, key: impl FnOnce(Expr) -> Expr, descending: bool) -> Self {
        let key = Lambda::new(self.state.ty().item(), key);
        let source = Box::new(self.state.expr.clone());
        let state = self.state.with_expr(Expr::OrderBy {
            source,
            key,
            descending,
            then: true,
        });
        Self::next(state, Ordered)
    }

    pub fn then_by(self, key: impl FnOnce(Expr) -> Expr) -> Self {
        self.then(key, false)
    }

    pub fn then_by_descending(self, key: impl FnOnce(Expr) -> Expr) -> Self {
        self.then(key, true)
    }
}

impl<T> QueryContext<T, Included> {
    /// Includes `property` of the previously included navigation.
    ///
    /// # Errors
    /// Returns [`AccessError::InvalidPath`] when the property does not resolve.
    pub fn then_include(self, property: &str) -> Result<Self, AccessError> {
        let previous = self.stage.previous.item();
        self.include_segment(property, property, &previous, true)
    }

    /// Includes the navigation selected by `navigation` on the previously
    /// included entity.
    ///
    /// # Errors
    /// Fails when the body names an unknown property or a navigation rule fails.
    pub fn then_include_with(self, navigation: impl FnOnce(Expr) -> Expr) -> Result<Self, AccessError> {
        let previous = self.stage.previous.item();
        self.include_lambda(Lambda::new(previous, navigation), None, true)
    }
}

fn invalid_path(path: &str, reason: &str) -> AccessError {
    AccessError::InvalidPath {
        path: path.to_owned(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{DefaultPolicy, MemoryProvider, SecureDb, SecurityRules, SecurityRulesBuilder};

    #[derive(crate::Entity)]
    struct Item {
        #[entity(key)]
        id: i64,
        tags: Vec<Arc<Tag>>,
    }

    #[derive(crate::Entity)]
    struct Tag {
        label: String,
    }

    fn db(rules: SecurityRulesBuilder<()>) -> SecureDb<()> {
        SecureDb::new(
            Arc::new(MemoryProvider::new()) as Arc<dyn QueryProvider>,
            Arc::new(rules.build()),
            (),
        )
    }

    #[test]
    fn test_composition_returns_new_values() {
        let db = db(SecurityRules::builder());
        let query = db.query::<Item>().unwrap();
        let before = query.expression().clone();

        let filtered = query.clone().filter(|i| i.member("id").greater_than(1)).take(5);

        assert_eq!(*query.expression(), before);
        assert_ne!(*filtered.expression(), before);
        assert!(matches!(filtered.expression(), Expr::Take { count: 5, .. }));
    }

    #[test]
    fn test_query_string_renders_expression() {
        let db = db(SecurityRules::builder());
        let text = db
            .query::<Item>()
            .unwrap()
            .filter(|i| i.member("id").equals(3))
            .to_query_string();
        assert!(text.starts_with("Set<Item>.Where("), "{text}");
        assert!(text.contains("== 3"), "{text}");
    }

    #[test]
    fn test_set_applies_target_rule() {
        let rules = SecurityRules::<()>::builder()
            .select::<Tag, _>(|q, _| Ok(q.filter(|t| t.member("label").not_equals("secret"))));
        let db = db(rules);

        let tags = db.query::<Item>().unwrap().set::<Tag>().unwrap();
        let Expr::Where { source, .. } = tags.expression() else {
            panic!("expected the tag rule");
        };
        assert_eq!(**source, Expr::Set(EntityType::of::<Tag>()));
    }

    #[test]
    fn test_default_deny_composes_false_filter() {
        let db = db(SecurityRules::builder().default_select(DefaultPolicy::Deny));
        let query = db.query::<Item>().unwrap();
        let Expr::Where { predicate, .. } = query.expression() else {
            panic!("expected a deny-all filter");
        };
        assert_eq!(*predicate.body(), Expr::constant(false));
    }

    #[test]
    fn test_requires_appends_to_one_sink() {
        let db = db(SecurityRules::builder());
        let query = db
            .query::<Item>()
            .unwrap()
            .requires(|i| i.member("id").greater_than(0), "id must be positive")
            .order_by(|i| i.member("id"))
            .then_by_descending(|i| i.member("id"))
            .requires(|i| i.member("id").less_than(10), "id must be small");

        let sink = query.errors();
        assert_eq!(
            sink.messages(ERROR_KEY),
            vec!["id must be positive".to_owned(), "id must be small".to_owned()]
        );
        assert_eq!(sink.entries().len(), 2);
    }

    #[test]
    fn test_branches_share_the_root_sink() {
        let db = db(SecurityRules::builder());
        let root = db.query::<Item>().unwrap();
        assert!(root.errors().is_empty());

        let branch = root.clone().requires(|i| i.member("id").greater_than(0), "from branch");
        let tags = root.set::<Tag>().unwrap().requires(|t| t.member("label").equals("x"), "from set");

        let expected = vec!["from branch".to_owned(), "from set".to_owned()];
        assert_eq!(root.errors().messages(ERROR_KEY), expected);
        assert_eq!(branch.errors().messages(ERROR_KEY), expected);
        assert_eq!(tags.errors().messages(ERROR_KEY), expected);

        let other = db.query::<Item>().unwrap();
        assert!(other.errors().is_empty(), "each root query owns its sink");
    }

    #[test]
    fn test_of_type_and_split_query() {
        let db = db(SecurityRules::builder());
        let query = db.query::<Item>().unwrap().as_split_query();
        assert!(matches!(query.expression(), Expr::SplitQuery(_)));

        let tags = query.of_type::<Tag>();
        assert!(matches!(
            tags.expression(),
            Expr::OfType { target, .. } if *target == EntityType::of::<Tag>()
        ));
    }

    #[test]
    fn test_then_include_follows_previous_navigation() {
        let db = db(SecurityRules::builder());
        let result = db.query::<Item>().unwrap().include("tags").unwrap().then_include("label");
        assert!(result.is_ok(), "scalar members may be included");

        let result = db
            .query::<Item>()
            .unwrap()
            .include("tags")
            .unwrap()
            .then_include("id");
        assert!(matches!(result, Err(AccessError::InvalidPath { .. })));
    }
}
