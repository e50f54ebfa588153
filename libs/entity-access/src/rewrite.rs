//! Filtered navigation rewriting.
//!
//! Given a member access that traverses a navigation, the rewriter builds a
//! query over the navigation's target type, applies that type's select rule
//! for the current principal and splices the filtered expression back in
//! place of the raw member access:
//!
//! * if the filtered expression is assignable to the expected type it is
//!   spliced directly;
//! * otherwise it is wrapped in `ToList` when materialization was requested,
//!   or in a `TypeAs` cast back to the member's declared type.
//!
//! Member chains are rewritten inner-first, so every hop of `a.b.c.d` that
//! has a rule is filtered. Navigations with ignore policy `Always` become a
//! typed `null`, and so does anything reached through one.

use crate::error::AccessError;
use crate::expr::{Expr, ExprType};
use crate::query::QueryState;
use crate::rules::Operation;
use crate::shape::{EntityModel, IgnoreCondition};
use crate::value::EntityType;

pub struct ExpressionRewriter<'a> {
    state: &'a QueryState,
}

impl<'a> ExpressionRewriter<'a> {
    pub fn new(state: &'a QueryState) -> Self {
        Self { state }
    }

    fn model(&self) -> &EntityModel {
        self.state.source.model()
    }

    /// Rewrites a projection body. Record members are rewritten one by one
    /// with materialization requested.
    pub fn rewrite_projection(&self, body: &Expr) -> Result<Expr, AccessError> {
        self.replace(body, true, None)
    }

    /// Rewrites `original`, expecting a result assignable to `expected`
    /// (the original's own type when `None`).
    pub fn replace(
        &self,
        original: &Expr,
        to_list: bool,
        expected: Option<ExprType>,
    ) -> Result<Expr, AccessError> {
        let Expr::Member { target, property } = original else {
            return self.rewrite_children(original);
        };

        let model = self.model();
        let original_ty = original.type_of(model);
        let expected = expected.unwrap_or_else(|| original_ty.clone());

        let target = if matches!(**target, Expr::Parameter(_)) {
            (**target).clone()
        } else {
            let replaced = self.replace(target, false, None)?;
            if replaced.is_null_constant() {
                return Ok(Expr::Null(original_ty));
            }
            replaced
        };

        let Some(owner) = target.type_of(model).entity() else {
            return Ok(Expr::Member {
                target: Box::new(target),
                property: property.clone(),
            });
        };

        let shape = model.property(owner, property)?;
        if shape.ignore_condition() == IgnoreCondition::Always {
            tracing::trace!(entity = owner.name(), property = shape.name(), "navigation ignored");
            return Ok(Expr::Null(original_ty));
        }

        let member = Expr::Member {
            target: Box::new(target),
            property: shape.name().to_owned(),
        };
        match shape.kind().navigation_target() {
            Some((entity, _)) => self.apply(member, entity, to_list, &expected, original_ty),
            None => Ok(member),
        }
    }

    /// Injects the select rule of `entity` over `member`.
    fn apply(
        &self,
        member: Expr,
        entity: EntityType,
        to_list: bool,
        expected: &ExprType,
        original_ty: ExprType,
    ) -> Result<Expr, AccessError> {
        let sub = QueryState {
            source: self.state.source.clone(),
            expr: member.clone(),
            errors: self.state.errors.clone(),
            operation: Operation::Select,
        };
        let filtered = self
            .state
            .source
            .apply_rule(entity, Operation::Select, sub)?
            .expr;
        if filtered == member {
            return Ok(member);
        }

        let filtered_ty = filtered.type_of(self.model());
        tracing::debug!(
            entity = entity.name(),
            expected = %expected,
            actual = %filtered_ty,
            "injected navigation filter"
        );
        if expected.is_assignable_from(&filtered_ty) {
            Ok(filtered)
        } else if to_list {
            Ok(Expr::ToList(Box::new(filtered)))
        } else {
            Ok(Expr::TypeAs {
                operand: Box::new(filtered),
                target: original_ty,
            })
        }
    }

    fn source(&self, source: &Expr) -> Result<Box<Expr>, AccessError> {
        self.replace(source, false, Some(ExprType::Unknown))
            .map(Box::new)
    }

    /// Rewrites the sources of sequence operators and every member of a
    /// record construction. Lambda bodies of predicates are left untouched.
    fn rewrite_children(&self, expr: &Expr) -> Result<Expr, AccessError> {
        Ok(match expr {
            Expr::Where { source, predicate } => Expr::Where {
                source: self.source(source)?,
                predicate: predicate.clone(),
            },
            Expr::OrderBy {
                source,
                key,
                descending,
                then,
            } => Expr::OrderBy {
                source: self.source(source)?,
                key: key.clone(),
                descending: *descending,
                then: *then,
            },
            Expr::Skip { source, count } => Expr::Skip {
                source: self.source(source)?,
                count: *count,
            },
            Expr::Take { source, count } => Expr::Take {
                source: self.source(source)?,
                count: *count,
            },
            Expr::Any { source, predicate } => Expr::Any {
                source: self.source(source)?,
                predicate: predicate.clone(),
            },
            Expr::Count(source) => Expr::Count(self.source(source)?),
            Expr::ToList(source) => Expr::ToList(self.source(source)?),
            Expr::TypeAs { operand, target } => Expr::TypeAs {
                operand: self.source(operand)?,
                target: target.clone(),
            },
            Expr::New { type_name, members } => Expr::New {
                type_name: *type_name,
                members: members
                    .iter()
                    .map(|(name, e)| Ok((*name, self.replace(e, true, None)?)))
                    .collect::<Result<_, AccessError>>()?,
            },
            other => other.clone(),
        })
    }
}
