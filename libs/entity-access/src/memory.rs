//! In-memory reference [`QueryProvider`].
//!
//! Evaluates the expression IR directly over in-process tables. Results follow
//! the loading rules of an object-relational provider: returned entities are
//! views whose navigations are unloaded (`null` references, empty
//! collections) unless included, and included navigations hold exactly the
//! rows their rewritten, filtered include expression produced. Every entity
//! appears once per execution, so shared and cyclic references resolve to the
//! same view.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::AccessError;
use crate::expr::{BinaryOp, Expr, ExprType, Lambda, UnaryOp, navigation_name};
use crate::provider::{Change, EntityEvents, QueryProvider};
use crate::shape::{EntityModel, PropertyKind, PropertyShape, ScalarKind, ShapeCache, TypeShape};
use crate::value::{Entity, EntityType, ObjectRef, Record, Value};

/// Provider over in-process tables of entities.
pub struct MemoryProvider {
    model: Arc<EntityModel>,
    tables: RwLock<HashMap<TypeId, Vec<ObjectRef>>>,
    events: RwLock<HashMap<TypeId, Arc<dyn EntityEvents>>>,
}

impl fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("model", &self.model)
            .field("tables", &self.tables.read().len())
            .field("events", &self.events.read().len())
            .finish()
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::with_model(Arc::new(EntityModel::new()))
    }
}

impl MemoryProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_model(model: Arc<EntityModel>) -> Self {
        Self {
            model,
            tables: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
        }
    }

    pub fn add<T: Entity>(&self, row: Arc<T>) {
        self.tables
            .write()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(ObjectRef::from_entity(row));
    }

    pub fn seed<T: Entity>(&self, rows: impl IntoIterator<Item = Arc<T>>) {
        let mut tables = self.tables.write();
        let table = tables.entry(TypeId::of::<T>()).or_default();
        table.extend(rows.into_iter().map(ObjectRef::from_entity));
    }

    /// Registers lifecycle hooks for `T`, replacing any previous ones.
    pub fn register_events<T: Entity>(&self, events: Arc<dyn EntityEvents>) {
        self.events.write().insert(TypeId::of::<T>(), events);
    }

    /// Snapshot of the stored rows of `entity`.
    #[must_use]
    pub fn rows_of(&self, entity: EntityType) -> Vec<ObjectRef> {
        self.tables
            .read()
            .get(&entity.type_id())
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len_of<T: Entity>(&self) -> usize {
        self.tables.read().get(&TypeId::of::<T>()).map_or(0, Vec::len)
    }
}

#[async_trait]
impl QueryProvider for MemoryProvider {
    fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    async fn execute(
        &self,
        query: &Expr,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, AccessError> {
        let mut evaluator = Evaluator::new(self, cancel);
        let rows = match evaluator.eval(query)? {
            Value::List(rows) => rows,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        let rows = evaluator.materialize(query, &rows)?;
        tracing::trace!(rows = rows.len(), "executed in-memory query");
        Ok(rows)
    }

    async fn count(&self, query: &Expr, cancel: &CancellationToken) -> Result<u64, AccessError> {
        let count = match Evaluator::new(self, cancel).eval(query)? {
            Value::List(rows) => rows.len(),
            Value::Null => 0,
            _ => 1,
        };
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn save(&self, change: Change, cancel: &CancellationToken) -> Result<(), AccessError> {
        if cancel.is_cancelled() {
            return Err(AccessError::Cancelled);
        }
        let object = change.entity().clone();
        let entity = object
            .entity_type()
            .ok_or_else(|| evaluation(format!("cannot save a {}", object.type_name())))?;
        let shape = self.model.shape_of(entity);

        let mut tables = self.tables.write();
        let table = tables.entry(entity.type_id()).or_default();
        let (kind, position) = match &change {
            Change::Insert(_) => ("insert", None),
            Change::Update(_) => ("update", Some(find_row(table, &object, &shape)?)),
            Change::Delete(_) => ("delete", Some(find_row(table, &object, &shape)?)),
        };
        match (change, position) {
            (Change::Update(_), Some(i)) => {
                if let Some(slot) = table.get_mut(i) {
                    *slot = object;
                }
            }
            (Change::Delete(_), Some(i)) => {
                table.remove(i);
            }
            _ => table.push(object),
        }
        tracing::debug!(entity = entity.name(), change = kind, "saved change");
        Ok(())
    }

    fn entity_events(&self, entity: EntityType) -> Option<Arc<dyn EntityEvents>> {
        self.events.read().get(&entity.type_id()).cloned()
    }
}

/// Locates `object` by its key properties, or by identity when the type
/// declares no key.
fn find_row(table: &[ObjectRef], object: &ObjectRef, shape: &TypeShape) -> Result<usize, AccessError> {
    let keys: Vec<&PropertyShape> = shape.keys().collect();
    table
        .iter()
        .position(|row| {
            if keys.is_empty() {
                return row.ptr_eq(object);
            }
            keys.iter().all(|k| {
                let stored = row.get(k.name()).unwrap_or_default();
                stored.loose_eq(&object.get(k.name()).unwrap_or_default())
            })
        })
        .ok_or_else(|| evaluation(format!("{} row not found", shape.name())))
}

fn evaluation(message: impl Into<String>) -> AccessError {
    AccessError::Evaluation(message.into())
}

fn truthy(value: &Value) -> Result<bool, AccessError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(evaluation(format!(
            "expected a boolean, got {}",
            ExprType::of_value(other)
        ))),
    }
}

/// SQL-style ordering test: comparisons involving `null` are false.
fn ordered(lhs: &Value, rhs: &Value, test: fn(Ordering) -> bool) -> bool {
    !lhs.is_null() && !rhs.is_null() && lhs.compare(rhs).is_some_and(test)
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, AccessError> {
    match (haystack, needle) {
        (Value::List(items), _) => Ok(items.iter().any(|item| item.loose_eq(needle))),
        (Value::Text(text), Value::Text(part)) => Ok(text.contains(part.as_str())),
        (Value::Null, _) | (_, Value::Null) => Ok(false),
        _ => Err(evaluation("contains expects a list or text")),
    }
}

fn conforms(value: &Value, target: &ExprType) -> bool {
    match (target, value) {
        (ExprType::Entity(entity), Value::Object(o)) => o.entity_type() == Some(*entity),
        (ExprType::Record, Value::Object(o)) => o.entity_type().is_none(),
        (ExprType::Scalar, v) => !matches!(v, Value::Object(_) | Value::List(_) | Value::Map(_)),
        (_, Value::Null)
        | (ExprType::Unknown, _)
        | (ExprType::Sequence(_) | ExprType::List(_), Value::List(_))
        | (ExprType::Object, Value::Object(_))
        | (ExprType::Map, Value::Map(_)) => true,
        _ => false,
    }
}

struct Evaluator<'a> {
    provider: &'a MemoryProvider,
    cancel: &'a CancellationToken,
    scope: Vec<(Arc<str>, Value)>,
}

impl<'a> Evaluator<'a> {
    fn new(provider: &'a MemoryProvider, cancel: &'a CancellationToken) -> Self {
        Self {
            provider,
            cancel,
            scope: Vec::new(),
        }
    }

    fn call(&mut self, lambda: &Lambda, argument: Value) -> Result<Value, AccessError> {
        self.scope
            .push((Arc::clone(lambda.parameter().name()), argument));
        let result = self.eval(lambda.body());
        self.scope.pop();
        result
    }

    fn test(&mut self, lambda: &Lambda, argument: Value) -> Result<bool, AccessError> {
        self.call(lambda, argument).and_then(|v| truthy(&v))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, AccessError> {
        if self.cancel.is_cancelled() {
            return Err(AccessError::Cancelled);
        }
        match expr {
            Expr::Parameter(p) => self
                .scope
                .iter()
                .rev()
                .find(|(name, _)| name == p.name())
                .map(|(_, v)| v.clone())
                .ok_or_else(|| evaluation(format!("unbound parameter {}", p.name()))),
            Expr::Set(entity) => Ok(Value::List(
                self.provider
                    .rows_of(*entity)
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
            )),
            Expr::Constant(v) => Ok(v.clone()),
            Expr::Null(_) => Ok(Value::Null),
            Expr::Member { target, property } => {
                let target = self.eval(target)?;
                self.read(&target, property)
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                Ok(Value::Bool(match op {
                    UnaryOp::Not => !truthy(&v)?,
                    UnaryOp::IsNull => v.is_null(),
                }))
            }
            Expr::Binary { op, left, right } => self.binary(*op, left, right).map(Value::Bool),
            Expr::Where { source, predicate } => {
                let source = self.eval(source)?;
                self.filter(source, predicate)
            }
            Expr::OrderBy { .. } => self.order(expr),
            Expr::Include { source, .. }
            | Expr::SplitQuery(source)
            | Expr::ToList(source) => self.eval(source),
            Expr::TypeAs { operand, target } => {
                let v = self.eval(operand)?;
                Ok(if conforms(&v, target) { v } else { Value::Null })
            }
            Expr::New { type_name, members } => {
                let mut values = Vec::with_capacity(members.len());
                for (name, member) in members {
                    values.push((*name, self.eval(member)?));
                }
                Ok(Value::Object(ObjectRef::new(Arc::new(ProjectedRecord::new(
                    *type_name, values,
                )))))
            }
            _ => self.sequence(expr),
        }
    }

    /// Sequence operators over a source evaluated to rows.
    fn sequence(&mut self, expr: &Expr) -> Result<Value, AccessError> {
        match expr {
            Expr::Skip { source, count } => {
                Ok(Value::List(self.rows(source)?.into_iter().skip(*count).collect()))
            }
            Expr::Take { source, count } => {
                Ok(Value::List(self.rows(source)?.into_iter().take(*count).collect()))
            }
            Expr::Select { source, projection } => match self.eval(source)? {
                Value::Null => Ok(Value::Null),
                Value::List(rows) => rows
                    .into_iter()
                    .map(|row| self.call(projection, row))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List),
                single => self.call(projection, single),
            },
            Expr::OfType { source, target } => Ok(Value::List(
                self.rows(source)?
                    .into_iter()
                    .filter(|row| row.as_object().and_then(ObjectRef::entity_type) == Some(*target))
                    .collect(),
            )),
            Expr::Any { source, predicate } => {
                let rows = self.rows(source)?;
                let Some(predicate) = predicate else {
                    return Ok(Value::Bool(!rows.is_empty()));
                };
                for row in rows {
                    if self.test(predicate, row)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Count(source) => {
                let count = self.rows(source)?.len();
                Ok(Value::UInt(u64::try_from(count).unwrap_or(u64::MAX)))
            }
            other => Err(evaluation(format!("unsupported expression {other}"))),
        }
    }

    /// Evaluates `source` as rows: `null` is empty, a single value one row.
    fn rows(&mut self, source: &Expr) -> Result<Vec<Value>, AccessError> {
        Ok(match self.eval(source)? {
            Value::List(rows) => rows,
            Value::Null => Vec::new(),
            single => vec![single],
        })
    }

    fn read(&self, target: &Value, property: &str) -> Result<Value, AccessError> {
        match target {
            Value::Null => Ok(Value::Null),
            Value::Object(object) => {
                let Some(entity) = object.entity_type() else {
                    return Ok(object.get(property).unwrap_or_default());
                };
                let shape = self.provider.model.shape_of(entity);
                let declared = shape.find_ignore_case(property).ok_or_else(|| {
                    AccessError::UnknownProperty {
                        entity: entity.name(),
                        property: property.to_owned(),
                    }
                })?;
                Ok(object.get(declared.name()).unwrap_or_default())
            }
            Value::Map(entries) => Ok(entries
                .iter()
                .find(|(key, _)| key.as_deref() == Some(property))
                .map(|(_, v)| v.clone())
                .unwrap_or_default()),
            other => Err(evaluation(format!(
                "cannot read '{property}' of {}",
                ExprType::of_value(other)
            ))),
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<bool, AccessError> {
        let lhs = self.eval(left)?;
        Ok(match op {
            BinaryOp::And => truthy(&lhs)? && self.eval(right).and_then(|rhs| truthy(&rhs))?,
            BinaryOp::Or => truthy(&lhs)? || self.eval(right).and_then(|rhs| truthy(&rhs))?,
            BinaryOp::Eq => lhs.loose_eq(&self.eval(right)?),
            BinaryOp::Ne => !lhs.loose_eq(&self.eval(right)?),
            BinaryOp::Lt => ordered(&lhs, &self.eval(right)?, Ordering::is_lt),
            BinaryOp::Le => ordered(&lhs, &self.eval(right)?, Ordering::is_le),
            BinaryOp::Gt => ordered(&lhs, &self.eval(right)?, Ordering::is_gt),
            BinaryOp::Ge => ordered(&lhs, &self.eval(right)?, Ordering::is_ge),
            BinaryOp::Contains => contains(&lhs, &self.eval(right)?)?,
        })
    }

    /// `Where` over rows keeps matching rows; over a single value it yields
    /// the value or `null`.
    fn filter(&mut self, source: Value, predicate: &Lambda) -> Result<Value, AccessError> {
        match source {
            Value::Null => Ok(Value::Null),
            Value::List(rows) => {
                let mut kept = Vec::new();
                for row in rows {
                    if self.test(predicate, row.clone())? {
                        kept.push(row);
                    }
                }
                Ok(Value::List(kept))
            }
            single => Ok(if self.test(predicate, single.clone())? {
                single
            } else {
                Value::Null
            }),
        }
    }

    /// Sorts by an `OrderBy` and its chained `ThenBy` keys, stably.
    fn order(&mut self, expr: &Expr) -> Result<Value, AccessError> {
        let mut keys: Vec<(&Lambda, bool)> = Vec::new();
        let mut current = expr;
        while let Expr::OrderBy {
            source,
            key,
            descending,
            then,
        } = current
        {
            keys.push((key, *descending));
            current = source.as_ref();
            if !*then {
                break;
            }
        }
        keys.reverse();

        let mut keyed = Vec::new();
        for row in self.rows(current)? {
            let mut values = Vec::with_capacity(keys.len());
            for (key, _) in &keys {
                values.push(self.call(key, row.clone())?);
            }
            keyed.push((values, row));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            a.iter()
                .zip(b)
                .zip(&keys)
                .map(|((x, y), (_, descending))| {
                    let ord = x.compare(y).unwrap_or(Ordering::Equal);
                    if *descending { ord.reverse() } else { ord }
                })
                .find(|ord| ord.is_ne())
                .unwrap_or(Ordering::Equal)
        });
        Ok(Value::List(keyed.into_iter().map(|(_, row)| row).collect()))
    }

    /// Turns raw result rows into entity views and loads the included
    /// navigations of the root entities.
    fn materialize(&mut self, query: &Expr, rows: &[Value]) -> Result<Vec<Value>, AccessError> {
        let provider = self.provider;
        let model = provider.model.as_ref();
        let mut graph = GraphBuilder::default();
        for row in rows {
            graph.collect(row, model);
        }
        let roots: Vec<ObjectRef> = rows
            .iter()
            .filter_map(Value::as_object)
            .filter(|o| o.entity_type().is_some())
            .cloned()
            .collect();
        for chain in include_chains(query) {
            self.load(&mut graph, model, &roots, &chain)?;
        }

        let GraphBuilder { nodes, index } = graph;
        let graph = Arc::new(Graph {
            handles: Mutex::new(nodes.iter().map(|_| Weak::new()).collect()),
            nodes,
        });
        Ok(rows.iter().map(|row| export(row, &graph, &index)).collect())
    }

    /// Loads one include chain: every step evaluates the rewritten include
    /// body on each parent and records the surviving children.
    fn load(
        &mut self,
        graph: &mut GraphBuilder,
        model: &EntityModel,
        roots: &[ObjectRef],
        chain: &[&Lambda],
    ) -> Result<(), AccessError> {
        let mut parents = roots.to_vec();
        for lambda in chain {
            // Suppressed navigations rewrite to a null constant and stay unloaded.
            let Some(name) = navigation_name(lambda.body()) else {
                return Ok(());
            };
            let mut children = Vec::new();
            for parent in &parents {
                let Some(index) = graph.node(parent, model) else {
                    continue;
                };
                let Some(property) = graph.property(index, name) else {
                    return Err(AccessError::UnknownProperty {
                        entity: parent.type_name(),
                        property: name.to_owned(),
                    });
                };
                let loaded = match self.call(lambda, Value::Object(parent.clone()))? {
                    Value::Object(child) => {
                        let loaded = graph.node(&child, model).map_or(Loaded::Null, Loaded::One);
                        children.push(child);
                        loaded
                    }
                    Value::List(items) => Loaded::Many(
                        items
                            .iter()
                            .filter_map(Value::as_object)
                            .filter_map(|child| {
                                children.push(child.clone());
                                graph.node(child, model)
                            })
                            .collect(),
                    ),
                    _ => Loaded::Null,
                };
                graph.set(index, property, loaded);
            }
            parents = children;
        }
        Ok(())
    }
}

/// Include chains in composition order; a `ThenInclude` extends the chain of
/// the include before it. Includes below a projection do not apply.
fn include_chains(query: &Expr) -> Vec<Vec<&Lambda>> {
    let mut includes = Vec::new();
    let mut current = query;
    loop {
        match current {
            Expr::Include {
                source,
                navigation,
                then,
            } => {
                includes.push((navigation, *then));
                current = source.as_ref();
            }
            Expr::Where { source, .. }
            | Expr::OrderBy { source, .. }
            | Expr::Skip { source, .. }
            | Expr::Take { source, .. }
            | Expr::OfType { source, .. }
            | Expr::SplitQuery(source)
            | Expr::ToList(source) => current = source.as_ref(),
            _ => break,
        }
    }
    includes.reverse();

    let mut chains: Vec<Vec<&Lambda>> = Vec::new();
    for (navigation, then) in includes {
        match chains.last_mut() {
            Some(chain) if then => chain.push(navigation),
            _ => chains.push(vec![navigation]),
        }
    }
    chains
}

enum Loaded {
    Null,
    One(usize),
    Many(Vec<usize>),
}

struct Node {
    source: ObjectRef,
    shape: Arc<TypeShape>,
    loaded: HashMap<&'static str, Loaded>,
}

#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<Node>,
    /// Source address to node index.
    index: HashMap<usize, usize>,
}

impl GraphBuilder {
    fn node(&mut self, object: &ObjectRef, model: &EntityModel) -> Option<usize> {
        let entity = object.entity_type()?;
        if let Some(index) = self.index.get(&object.addr()) {
            return Some(*index);
        }
        let index = self.nodes.len();
        self.nodes.push(Node {
            source: object.clone(),
            shape: model.shape_of(entity),
            loaded: HashMap::new(),
        });
        self.index.insert(object.addr(), index);
        Some(index)
    }

    fn collect(&mut self, value: &Value, model: &EntityModel) {
        match value {
            Value::Object(object) => match object.downcast_ref::<ProjectedRecord>() {
                Some(record) => {
                    for v in &record.values {
                        self.collect(v, model);
                    }
                }
                None => {
                    self.node(object, model);
                }
            },
            Value::List(items) => {
                for item in items {
                    self.collect(item, model);
                }
            }
            Value::Map(entries) => {
                for (_, v) in entries {
                    self.collect(v, model);
                }
            }
            _ => {}
        }
    }

    fn property(&self, index: usize, name: &str) -> Option<&'static str> {
        self.nodes
            .get(index)?
            .shape
            .find_ignore_case(name)
            .map(PropertyShape::name)
    }

    fn set(&mut self, index: usize, property: &'static str, loaded: Loaded) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.loaded.insert(property, loaded);
        }
    }
}

/// Frozen result graph of one execution. Views are created on demand and
/// tracked weakly, so a view is unique while anything holds it.
struct Graph {
    nodes: Vec<Node>,
    handles: Mutex<Vec<Weak<MaterializedEntity>>>,
}

fn view(graph: &Arc<Graph>, index: usize) -> ObjectRef {
    let mut handles = graph.handles.lock();
    if let Some(live) = handles.get(index).and_then(Weak::upgrade) {
        return ObjectRef::new(live);
    }
    let view = Arc::new(MaterializedEntity {
        graph: Arc::clone(graph),
        index,
    });
    if let Some(slot) = handles.get_mut(index) {
        *slot = Arc::downgrade(&view);
    }
    ObjectRef::new(view)
}

fn export(value: &Value, graph: &Arc<Graph>, index: &HashMap<usize, usize>) -> Value {
    match value {
        Value::Object(object) => {
            if let Some(i) = index.get(&object.addr()) {
                return Value::Object(view(graph, *i));
            }
            object
                .downcast_ref::<ProjectedRecord>()
                .map_or_else(
                    || value.clone(),
                    |record| {
                        let values = record
                            .values
                            .iter()
                            .map(|v| export(v, graph, index))
                            .collect();
                        Value::Object(ObjectRef::new(Arc::new(ProjectedRecord {
                            shape: Arc::clone(&record.shape),
                            values,
                        })))
                    },
                )
        }
        Value::List(items) => Value::List(items.iter().map(|v| export(v, graph, index)).collect()),
        Value::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), export(v, graph, index)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// An entity as returned by [`MemoryProvider`]: scalar properties read
/// through to the stored entity, navigations hold only what was included.
pub struct MaterializedEntity {
    graph: Arc<Graph>,
    index: usize,
}

impl MaterializedEntity {
    fn node(&self) -> Option<&Node> {
        self.graph.nodes.get(self.index)
    }

    /// The stored entity behind this view.
    #[must_use]
    pub fn source(&self) -> Option<&ObjectRef> {
        self.node().map(|n| &n.source)
    }

    fn navigation(&self, property: &'static str, is_collection: bool) -> Value {
        match self.node().and_then(|n| n.loaded.get(property)) {
            Some(Loaded::One(i)) => Value::Object(view(&self.graph, *i)),
            Some(Loaded::Many(items)) => Value::List(
                items
                    .iter()
                    .map(|i| Value::Object(view(&self.graph, *i)))
                    .collect(),
            ),
            None if is_collection => Value::List(Vec::new()),
            Some(Loaded::Null) | None => Value::Null,
        }
    }
}

impl Record for MaterializedEntity {
    fn type_name(&self) -> &'static str {
        self.node().map_or("?", |n| n.source.type_name())
    }

    fn qualified_type_name(&self) -> &'static str {
        self.node()
            .map_or("?", |n| n.source.record().qualified_type_name())
    }

    fn entity_type(&self) -> Option<EntityType> {
        self.node().and_then(|n| n.source.entity_type())
    }

    fn shape(&self, cache: &ShapeCache) -> Arc<TypeShape> {
        match self.node() {
            Some(node) => node.source.record().shape(cache),
            None => Arc::new(TypeShape::new("?")),
        }
    }

    fn get(&self, property: &str) -> Option<Value> {
        let node = self.node()?;
        let declared = node.shape.find(property)?;
        match declared.kind().navigation_target() {
            Some((_, is_collection)) => Some(self.navigation(declared.name(), is_collection)),
            None => node.source.get(property),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Row of a projection (`new { ... }`).
pub struct ProjectedRecord {
    shape: Arc<TypeShape>,
    values: Vec<Value>,
}

impl ProjectedRecord {
    fn new(type_name: &'static str, members: Vec<(&'static str, Value)>) -> Self {
        let shape = members.iter().fold(TypeShape::new(type_name), |shape, (name, value)| {
            shape.property(PropertyShape::new(*name, kind_of(value)))
        });
        Self {
            shape: Arc::new(shape),
            values: members.into_iter().map(|(_, v)| v).collect(),
        }
    }
}

fn kind_of(value: &Value) -> PropertyKind {
    let scalar = match value {
        Value::Bool(_) => ScalarKind::Bool,
        Value::Int(_) => ScalarKind::Int,
        Value::UInt(_) => ScalarKind::UInt,
        Value::Float(_) => ScalarKind::Float,
        Value::Decimal(_) => ScalarKind::Decimal,
        Value::Char(_) => ScalarKind::Char,
        Value::Text(_) => ScalarKind::Text,
        Value::Enum(_) => ScalarKind::Enum,
        Value::DateTime(_) => ScalarKind::DateTime,
        Value::Uuid(_) => ScalarKind::Uuid,
        Value::Geometry(_) => ScalarKind::Geometry,
        Value::Json(_) => ScalarKind::Json,
        Value::List(_) => return PropertyKind::List,
        Value::Map(_) => return PropertyKind::Map,
        Value::Object(o) => return o.entity_type().map_or(PropertyKind::Object, PropertyKind::Reference),
        Value::Null => return PropertyKind::Object,
    };
    PropertyKind::Scalar(scalar)
}

impl Record for ProjectedRecord {
    fn type_name(&self) -> &'static str {
        self.shape.name()
    }

    fn entity_type(&self) -> Option<EntityType> {
        None
    }

    fn shape(&self, _cache: &ShapeCache) -> Arc<TypeShape> {
        Arc::clone(&self.shape)
    }

    fn get(&self, property: &str) -> Option<Value> {
        self.shape
            .properties()
            .iter()
            .position(|p| p.name() == property)
            .and_then(|i| self.values.get(i))
            .cloned()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
