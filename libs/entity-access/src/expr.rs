//! Provider-neutral query expression tree.
//!
//! Query contexts build [`Expr`] values; the rewriter rebuilds them with
//! filtered navigations; providers translate or evaluate them. Nodes are
//! immutable values and every rewrite produces a new tree.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::geometry::Geometry;
use crate::shape::{EntityModel, PropertyKind};
use crate::value::{EntityType, Value};

static NEXT_PARAMETER: AtomicU64 = AtomicU64::new(1);

/// Static type of an expression, as far as the rewriter needs to know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprType {
    /// Accepts anything; used where the caller has no expectation.
    Unknown,
    Scalar,
    Entity(EntityType),
    /// Lazily filtered sequence (the result of `Where`, `OrderBy`, ...).
    Sequence(Box<ExprType>),
    /// Materialized list, the declared type of collection navigations.
    List(Box<ExprType>),
    /// Ad-hoc projected record.
    Record,
    Map,
    Object,
}

impl ExprType {
    #[must_use]
    pub fn sequence_of(entity: EntityType) -> Self {
        Self::Sequence(Box::new(Self::Entity(entity)))
    }

    #[must_use]
    pub fn list_of(entity: EntityType) -> Self {
        Self::List(Box::new(Self::Entity(entity)))
    }

    #[must_use]
    pub fn entity(&self) -> Option<EntityType> {
        match self {
            Self::Entity(e) => Some(*e),
            _ => None,
        }
    }

    #[must_use]
    pub fn element(&self) -> Option<&ExprType> {
        match self {
            Self::Sequence(e) | Self::List(e) => Some(e),
            _ => None,
        }
    }

    /// The entity a lambda over this type receives: the type itself or its element.
    #[must_use]
    pub fn element_entity(&self) -> Option<EntityType> {
        self.entity()
            .or_else(|| self.element().and_then(ExprType::entity))
    }

    /// Element type for a lambda parameter over this type.
    #[must_use]
    pub fn item(&self) -> ExprType {
        self.element().cloned().unwrap_or_else(|| self.clone())
    }

    /// Whether a value of type `other` can stand where `self` is expected.
    #[must_use]
    pub fn is_assignable_from(&self, other: &ExprType) -> bool {
        match (self, other) {
            (Self::Unknown, _) => true,
            (Self::Sequence(a), Self::Sequence(b) | Self::List(b)) | (Self::List(a), Self::List(b)) => {
                a.is_assignable_from(b)
            }
            (Self::Object, Self::Entity(_) | Self::Record | Self::Object) => true,
            (a, b) => a == b,
        }
    }

    pub(crate) fn of_kind(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::Scalar(_) => Self::Scalar,
            PropertyKind::Reference(t) => Self::Entity(t),
            PropertyKind::Collection(t) => Self::list_of(t),
            PropertyKind::List => Self::List(Box::new(Self::Unknown)),
            PropertyKind::Map => Self::Map,
            PropertyKind::Object => Self::Object,
        }
    }

    pub(crate) fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Unknown,
            Value::Object(o) => o.entity_type().map_or(Self::Record, Self::Entity),
            Value::List(_) => Self::List(Box::new(Self::Unknown)),
            Value::Map(_) => Self::Map,
            _ => Self::Scalar,
        }
    }
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("?"),
            Self::Scalar => f.write_str("scalar"),
            Self::Entity(e) => f.write_str(e.name()),
            Self::Sequence(e) => write!(f, "Seq<{e}>"),
            Self::List(e) => write!(f, "List<{e}>"),
            Self::Record => f.write_str("record"),
            Self::Map => f.write_str("map"),
            Self::Object => f.write_str("object"),
        }
    }
}

/// Lambda parameter. Names are unique per process, so equality is by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    name: Arc<str>,
    ty: ExprType,
}

impl Parameter {
    #[must_use]
    pub fn new(ty: ExprType) -> Self {
        let n = NEXT_PARAMETER.fetch_add(1, Ordering::Relaxed);
        let prefix = ty
            .element_entity()
            .and_then(|e| e.name().chars().next())
            .map_or('x', |c| c.to_ascii_lowercase());
        Self {
            name: Arc::from(format!("{prefix}{n}")),
            ty,
        }
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[must_use]
    pub fn ty(&self) -> &ExprType {
        &self.ty
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    parameter: Parameter,
    body: Box<Expr>,
}

impl Lambda {
    /// Creates a parameter of type `ty` and builds the body from it.
    pub fn new(ty: ExprType, build: impl FnOnce(Expr) -> Expr) -> Self {
        let parameter = Parameter::new(ty);
        let body = build(Expr::Parameter(parameter.clone()));
        Self {
            parameter,
            body: Box::new(body),
        }
    }

    #[must_use]
    pub fn parameter(&self) -> &Parameter {
        &self.parameter
    }

    #[must_use]
    pub fn body(&self) -> &Expr {
        &self.body
    }

    #[must_use]
    pub(crate) fn with_body(&self, body: Expr) -> Self {
        Self {
            parameter: self.parameter.clone(),
            body: Box::new(body),
        }
    }
}

impl fmt::Display for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.parameter.name, self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    IsNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    /// Text containment or list membership.
    Contains,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
            Self::Contains => "contains",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Parameter(Parameter),
    /// Root set of all rows of an entity type.
    Set(EntityType),
    Constant(Value),
    /// Typed `null`, produced when a navigation is suppressed.
    Null(ExprType),
    Member {
        target: Box<Expr>,
        property: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Where {
        source: Box<Expr>,
        predicate: Lambda,
    },
    OrderBy {
        source: Box<Expr>,
        key: Lambda,
        descending: bool,
        /// Secondary key (`ThenBy`) rather than a new ordering.
        then: bool,
    },
    Skip {
        source: Box<Expr>,
        count: usize,
    },
    Take {
        source: Box<Expr>,
        count: usize,
    },
    Select {
        source: Box<Expr>,
        projection: Lambda,
    },
    Include {
        source: Box<Expr>,
        navigation: Lambda,
        /// `ThenInclude` continuing the previous include chain.
        then: bool,
    },
    OfType {
        source: Box<Expr>,
        target: EntityType,
    },
    SplitQuery(Box<Expr>),
    Any {
        source: Box<Expr>,
        predicate: Option<Lambda>,
    },
    Count(Box<Expr>),
    /// Construction of an ad-hoc record from named members.
    New {
        type_name: &'static str,
        members: Vec<(&'static str, Expr)>,
    },
    /// Checked cast; yields `null` when the operand does not have the target type.
    TypeAs {
        operand: Box<Expr>,
        target: ExprType,
    },
    /// Materializes a sequence into a list.
    ToList(Box<Expr>),
}

impl Expr {
    #[must_use]
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    #[must_use]
    pub fn member(&self, property: &str) -> Expr {
        Expr::Member {
            target: Box::new(self.clone()),
            property: property.to_owned(),
        }
    }

    fn binary(self, op: BinaryOp, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }

    #[must_use]
    pub fn equals(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Eq, rhs.into())
    }

    #[must_use]
    pub fn not_equals(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Ne, rhs.into())
    }

    #[must_use]
    pub fn less_than(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Lt, rhs.into())
    }

    #[must_use]
    pub fn less_or_equal(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Le, rhs.into())
    }

    #[must_use]
    pub fn greater_than(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Gt, rhs.into())
    }

    #[must_use]
    pub fn greater_or_equal(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Ge, rhs.into())
    }

    #[must_use]
    pub fn and(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::And, rhs)
    }

    #[must_use]
    pub fn or(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Or, rhs)
    }

    #[must_use]
    pub fn contains(self, item: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Contains, item.into())
    }

    #[must_use]
    pub fn is_null(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::IsNull,
            operand: Box::new(self),
        }
    }

    /// `Where` over a collection-valued expression.
    #[must_use]
    pub fn filter(self, predicate: impl FnOnce(Expr) -> Expr) -> Expr {
        Expr::Where {
            source: Box::new(self),
            predicate: Lambda::new(ExprType::Unknown, predicate),
        }
    }

    #[must_use]
    pub fn any(self, predicate: impl FnOnce(Expr) -> Expr) -> Expr {
        Expr::Any {
            source: Box::new(self),
            predicate: Some(Lambda::new(ExprType::Unknown, predicate)),
        }
    }

    #[must_use]
    pub fn exists(self) -> Expr {
        Expr::Any {
            source: Box::new(self),
            predicate: None,
        }
    }

    #[must_use]
    pub fn count(self) -> Expr {
        Expr::Count(Box::new(self))
    }

    #[must_use]
    pub fn to_list(self) -> Expr {
        Expr::ToList(Box::new(self))
    }

    /// Ad-hoc record construction, the projection counterpart of `new { ... }`.
    #[must_use]
    pub fn record(
        type_name: &'static str,
        members: impl IntoIterator<Item = (&'static str, Expr)>,
    ) -> Expr {
        Expr::New {
            type_name,
            members: members.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn is_null_constant(&self) -> bool {
        matches!(self, Expr::Null(_) | Expr::Constant(Value::Null))
    }

    /// Static type of this expression against `model`.
    #[must_use]
    pub fn type_of(&self, model: &EntityModel) -> ExprType {
        match self {
            Expr::Parameter(p) => p.ty.clone(),
            Expr::Set(e) => ExprType::sequence_of(*e),
            Expr::Constant(v) => ExprType::of_value(v),
            Expr::Null(ty) | Expr::TypeAs { target: ty, .. } => ty.clone(),
            Expr::Member { target, property } => target
                .type_of(model)
                .entity()
                .and_then(|owner| {
                    model
                        .shape_of(owner)
                        .find_ignore_case(property)
                        .map(|p| ExprType::of_kind(p.kind()))
                })
                .unwrap_or(ExprType::Unknown),
            Expr::Unary { .. } | Expr::Binary { .. } | Expr::Any { .. } | Expr::Count(_) => {
                ExprType::Scalar
            }
            Expr::Where { source, .. } => match source.type_of(model) {
                ExprType::Sequence(e) | ExprType::List(e) => ExprType::Sequence(e),
                other => other,
            },
            Expr::OrderBy { source, .. } | Expr::Skip { source, .. } | Expr::Take { source, .. } => {
                match source.type_of(model) {
                    ExprType::Sequence(e) | ExprType::List(e) => ExprType::Sequence(e),
                    other => ExprType::Sequence(Box::new(other)),
                }
            }
            Expr::Select { projection, .. } => {
                ExprType::Sequence(Box::new(projection.body.type_of(model)))
            }
            Expr::Include { source, .. } | Expr::SplitQuery(source) => source.type_of(model),
            Expr::OfType { target, .. } => ExprType::sequence_of(*target),
            Expr::New { .. } => ExprType::Record,
            Expr::ToList(source) => match source.type_of(model) {
                ExprType::Sequence(e) | ExprType::List(e) => ExprType::List(e),
                other => ExprType::List(Box::new(other)),
            },
        }
    }
}

/// Member access an include body ultimately reads, as `(target, property)`.
pub(crate) fn navigation_member(expr: &Expr) -> Option<(&Expr, &str)> {
    match expr {
        Expr::Member { target, property } => Some((target, property.as_str())),
        Expr::Where { source, .. }
        | Expr::OrderBy { source, .. }
        | Expr::Skip { source, .. }
        | Expr::Take { source, .. }
        | Expr::SplitQuery(source)
        | Expr::ToList(source)
        | Expr::TypeAs {
            operand: source, ..
        } => navigation_member(source),
        _ => None,
    }
}

/// Name of the navigation property an include body ultimately reads.
pub(crate) fn navigation_name(expr: &Expr) -> Option<&str> {
    navigation_member(expr).map(|(_, name)| name)
}

macro_rules! expr_from {
    ($($ty:ty),* $(,)?) => {
        $(impl From<$ty> for Expr {
            fn from(v: $ty) -> Self {
                Expr::Constant(Value::from(v))
            }
        })*
    };
}

expr_from!(
    bool,
    i32,
    i64,
    u64,
    f64,
    &str,
    String,
    Decimal,
    Uuid,
    DateTime<Utc>,
    Geometry,
    Value
);

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(self),
        }
    }
}

struct ConstantDisplay<'a>(&'a Value);

impl fmt::Display for ConstantDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::UInt(u) => write!(f, "{u}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Char(c) => write!(f, "'{c}'"),
            Value::Text(s) => write!(f, "\"{s}\""),
            Value::Enum(name) => f.write_str(name),
            Value::DateTime(dt) => write!(f, "\"{}\"", dt.to_rfc3339()),
            Value::Uuid(u) => write!(f, "\"{u}\""),
            Value::Geometry(g) => write!(f, "\"{g}\""),
            Value::Json(j) => write!(f, "{j}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", ConstantDisplay(item))?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => write!(f, "{{{} entries}}", entries.len()),
            Value::Object(o) => write!(f, "{{{}}}", o.type_name()),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Parameter(p) => f.write_str(&p.name),
            Expr::Set(e) => write!(f, "Set<{}>", e.name()),
            Expr::Constant(v) => write!(f, "{}", ConstantDisplay(v)),
            Expr::Null(_) => f.write_str("null"),
            Expr::Member { target, property } => write!(f, "{target}.{property}"),
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
            } => write!(f, "!({operand})"),
            Expr::Unary {
                op: UnaryOp::IsNull,
                operand,
            } => write!(f, "({operand} == null)"),
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Where { source, predicate } => write!(f, "{source}.Where({predicate})"),
            Expr::OrderBy {
                source,
                key,
                descending,
                then,
            } => {
                let name = match (then, descending) {
                    (false, false) => "OrderBy",
                    (false, true) => "OrderByDescending",
                    (true, false) => "ThenBy",
                    (true, true) => "ThenByDescending",
                };
                write!(f, "{source}.{name}({key})")
            }
            Expr::Skip { source, count } => write!(f, "{source}.Skip({count})"),
            Expr::Take { source, count } => write!(f, "{source}.Take({count})"),
            Expr::Select { source, projection } => write!(f, "{source}.Select({projection})"),
            Expr::Include {
                source,
                navigation,
                then,
            } => {
                let name = if *then { "ThenInclude" } else { "Include" };
                write!(f, "{source}.{name}({navigation})")
            }
            Expr::OfType { source, target } => write!(f, "{source}.OfType<{}>()", target.name()),
            Expr::SplitQuery(source) => write!(f, "{source}.AsSplitQuery()"),
            Expr::Any { source, predicate } => match predicate {
                Some(p) => write!(f, "{source}.Any({p})"),
                None => write!(f, "{source}.Any()"),
            },
            Expr::Count(source) => write!(f, "{source}.Count()"),
            Expr::New { type_name, members } => {
                write!(f, "new {type_name} {{ ")?;
                for (i, (name, e)) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name} = {e}")?;
                }
                f.write_str(" }")
            }
            Expr::TypeAs { operand, target } => write!(f, "({operand} as {target})"),
            Expr::ToList(source) => write!(f, "{source}.ToList()"),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_accepts_list_but_not_reverse() {
        let seq = ExprType::Sequence(Box::new(ExprType::Scalar));
        let list = ExprType::List(Box::new(ExprType::Scalar));
        assert!(seq.is_assignable_from(&list));
        assert!(!list.is_assignable_from(&seq));
        assert!(ExprType::Unknown.is_assignable_from(&seq));
    }

    #[test]
    fn test_parameters_are_unique() {
        let a = Parameter::new(ExprType::Scalar);
        let b = Parameter::new(ExprType::Scalar);
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_of_predicate() {
        let lambda = Lambda::new(ExprType::Unknown, |x| {
            x.member("region").equals("US").and(!x.member("archived").equals(true))
        });
        let name = lambda.parameter().name().to_string();
        assert_eq!(
            lambda.to_string(),
            format!("{name} => (({name}.region == \"US\") && !(({name}.archived == true)))")
        );
    }

    #[test]
    fn test_navigation_name_peels_wrappers() {
        let x = Expr::Parameter(Parameter::new(ExprType::Unknown));
        let body = x.member("lines").filter(|l| l.member("qty").greater_than(0)).to_list();
        assert_eq!(navigation_name(&body), Some("lines"));
        assert_eq!(navigation_name(&Expr::Null(ExprType::Unknown)), None);

        let chained = x.member("customer").member("orders").filter(|o| o.member("id").equals(1));
        let Some((target, name)) = navigation_member(&chained) else {
            panic!("expected a member access");
        };
        assert_eq!(name, "orders");
        assert!(matches!(target, Expr::Member { property, .. } if property == "customer"));
    }
}
