//! Compiled boolean expressions over comparison, transition, and
//! sub-expression terms.
//!
//! An [`Expression`] is homogeneous: every term it holds is the same kind
//! (comparison, transition, or sub-expression), combined with a single
//! [`Logic`] operator. Terms live in per-chunk arenas so an expression is
//! just a `(chunk, begin, end)` slice into the arena matching its kind —
//! removing a chunk drops its expressions and their terms together.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use crate::reservoir::Reservoir;
use crate::status_value::{Comparison, Evaluation, StatusValue};
use crate::{ChunkKey, ExpressionKey, StatusKey};

/// How an expression's terms combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Logic {
    /// True iff every term is true.
    And,
    /// True iff any term is true.
    Or,
}

/// The right-hand side of a comparison term: either a literal or another
/// status's current value.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub enum Rhs {
    /// A fixed value baked in at registration time.
    Literal(StatusValue),
    /// Another status's current value, re-read on every evaluation.
    Status(StatusKey),
}

/// `key op rhs`, evaluated against the reservoir's current value at `key`.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ComparisonTerm {
    /// The status being compared.
    pub key: StatusKey,
    /// The comparison operator.
    pub op: Comparison,
    /// What `key`'s value is compared against.
    pub rhs: Rhs,
}

/// True iff `key`'s transition flag is set this tick.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct TransitionTerm {
    /// The status being watched.
    pub key: StatusKey,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct SubExpressionTerm {
    /// The expression this term recurses into.
    pub key: ExpressionKey,
    /// The truth value the referenced expression is expected to hold for
    /// this term to read as `True`.
    pub expect: bool,
}

/// Which term arena an expression's `[begin, end)` range indexes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Terms are `StatusComparison`s.
    Comparison,
    /// Terms are `StatusTransition`s.
    Transition,
    /// Terms are `SubExpression`s.
    SubExpression,
}

#[derive(Debug, Clone, Copy)]
struct Expression {
    chunk: ChunkKey,
    logic: Logic,
    kind: Kind,
    begin: usize,
    end: usize,
}

#[derive(Default)]
struct ChunkTerms {
    comparisons: Vec<ComparisonTerm>,
    transitions: Vec<TransitionTerm>,
    sub_expressions: Vec<SubExpressionTerm>,
}

/// Errors from registering an expression.
#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    /// An expression was registered twice under the same key.
    #[error("expression key {0:?} is already registered")]
    AlreadyRegistered(ExpressionKey),
    /// `register_*` was called with an empty term list.
    #[error("expression has no terms")]
    Empty,
    /// A `SubExpression` term named an expression key that does not exist
    /// yet; expressions may only reference already-registered expressions.
    #[error("sub-expression term references unregistered expression {0:?}")]
    UnregisteredDependency(ExpressionKey),
}

/// Registry of compiled expressions, evaluated lazily and on demand.
#[derive(Default)]
pub struct Evaluator {
    chunks: HashMap<ChunkKey, ChunkTerms>,
    expressions: HashMap<ExpressionKey, Expression>,
}

impl Evaluator {
    /// A registry with no expressions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a comparison expression.
    pub fn register_comparison(
        &mut self,
        chunk: ChunkKey,
        key: ExpressionKey,
        logic: Logic,
        terms: Vec<ComparisonTerm>,
    ) -> Result<(), EvaluatorError> {
        if terms.is_empty() {
            return Err(EvaluatorError::Empty);
        }
        self.check_new(key)?;
        let arena = &mut self.chunks.entry(chunk).or_default().comparisons;
        let begin = arena.len();
        arena.extend(terms);
        let end = arena.len();
        self.expressions
            .insert(key, Expression { chunk, logic, kind: Kind::Comparison, begin, end });
        Ok(())
    }

    /// Register a transition expression.
    pub fn register_transition(
        &mut self,
        chunk: ChunkKey,
        key: ExpressionKey,
        logic: Logic,
        terms: Vec<TransitionTerm>,
    ) -> Result<(), EvaluatorError> {
        if terms.is_empty() {
            return Err(EvaluatorError::Empty);
        }
        self.check_new(key)?;
        let arena = &mut self.chunks.entry(chunk).or_default().transitions;
        let begin = arena.len();
        arena.extend(terms);
        let end = arena.len();
        self.expressions
            .insert(key, Expression { chunk, logic, kind: Kind::Transition, begin, end });
        Ok(())
    }

    /// Register a sub-expression (compound) expression. Every referenced key
    /// must already be registered — this is what prevents reference cycles:
    /// an expression can only depend on expressions that exist before it.
    pub fn register_sub_expression(
        &mut self,
        chunk: ChunkKey,
        key: ExpressionKey,
        logic: Logic,
        terms: Vec<SubExpressionTerm>,
    ) -> Result<(), EvaluatorError> {
        if terms.is_empty() {
            return Err(EvaluatorError::Empty);
        }
        self.check_new(key)?;
        for term in &terms {
            if !self.expressions.contains_key(&term.key) {
                return Err(EvaluatorError::UnregisteredDependency(term.key));
            }
        }
        let arena = &mut self.chunks.entry(chunk).or_default().sub_expressions;
        let begin = arena.len();
        arena.extend(terms);
        let end = arena.len();
        self.expressions
            .insert(key, Expression { chunk, logic, kind: Kind::SubExpression, begin, end });
        Ok(())
    }

    fn check_new(&self, key: ExpressionKey) -> Result<(), EvaluatorError> {
        if self.expressions.contains_key(&key) {
            Err(EvaluatorError::AlreadyRegistered(key))
        } else {
            Ok(())
        }
    }

    /// Is `key` a registered expression?
    pub fn contains(&self, key: ExpressionKey) -> bool {
        self.expressions.contains_key(&key)
    }

    pub(crate) fn chunk_of(&self, key: ExpressionKey) -> Option<ChunkKey> {
        self.expressions.get(&key).map(|e| e.chunk)
    }

    pub(crate) fn kind_of(&self, key: ExpressionKey) -> Option<Kind> {
        self.expressions.get(&key).map(|e| e.kind)
    }

    pub(crate) fn comparison_terms(&self, key: ExpressionKey) -> &[ComparisonTerm] {
        let e = &self.expressions[&key];
        &self.chunks[&e.chunk].comparisons[e.begin..e.end]
    }

    pub(crate) fn transition_terms(&self, key: ExpressionKey) -> &[TransitionTerm] {
        let e = &self.expressions[&key];
        &self.chunks[&e.chunk].transitions[e.begin..e.end]
    }

    pub(crate) fn sub_expression_terms(&self, key: ExpressionKey) -> &[SubExpressionTerm] {
        let e = &self.expressions[&key];
        &self.chunks[&e.chunk].sub_expressions[e.begin..e.end]
    }

    /// Evaluate an expression's current truth value against `reservoir`.
    /// Returns `Unknown` for an unregistered key.
    pub fn evaluate(&self, key: ExpressionKey, reservoir: &Reservoir) -> Evaluation {
        let Some(expr) = self.expressions.get(&key) else {
            return Evaluation::Unknown;
        };
        match expr.kind {
            Kind::Comparison => combine(expr.logic, self.comparison_terms(key).iter().map(|t| {
                let rhs = match t.rhs {
                    Rhs::Literal(v) => v,
                    Rhs::Status(rk) => reservoir.find_status(rk),
                };
                reservoir.compare_status(t.key, t.op, &rhs)
            })),
            Kind::Transition => combine(
                expr.logic,
                self.transition_terms(key)
                    .iter()
                    .map(|t| reservoir.find_transition(t.key).map(Evaluation::from_bool).unwrap_or(Evaluation::Unknown)),
            ),
            Kind::SubExpression => combine(
                expr.logic,
                self.sub_expression_terms(key).iter().map(|t| {
                    match self.evaluate(t.key, reservoir) {
                        Evaluation::Unknown => Evaluation::Unknown,
                        Evaluation::True => Evaluation::from_bool(t.expect),
                        Evaluation::False => Evaluation::from_bool(!t.expect),
                    }
                }),
            ),
        }
    }

    /// Drop every expression (and its terms) registered in `chunk`.
    pub fn remove_chunk(&mut self, chunk: ChunkKey) {
        self.chunks.remove(&chunk);
        self.expressions.retain(|_, e| e.chunk != chunk);
    }
}

/// Tri-state fold with short-circuit: `And` stops at the first `False`,
/// `Or` stops at the first `True`. An empty iterator never occurs because
/// registration rejects empty term lists.
fn combine(logic: Logic, terms: impl Iterator<Item = Evaluation>) -> Evaluation {
    let mut acc = match logic {
        Logic::And => Evaluation::True,
        Logic::Or => Evaluation::False,
    };
    for term in terms {
        acc = match logic {
            Logic::And => acc.and(term),
            Logic::Or => acc.or(term),
        };
        match (logic, acc) {
            (Logic::And, Evaluation::False) => return acc,
            (Logic::Or, Evaluation::True) => return acc,
            _ => {}
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_value::Assignment;
    use crate::ChunkKey;

    fn setup() -> (Reservoir, Evaluator, StatusKey, StatusKey) {
        let mut r = Reservoir::new();
        let a = StatusKey(1);
        let b = StatusKey(2);
        r.register_status(ChunkKey(0), a, StatusValue::Unsigned { value: 1, width: 8 }).unwrap();
        r.register_status(ChunkKey(0), b, StatusValue::Unsigned { value: 2, width: 8 }).unwrap();
        (r, Evaluator::new(), a, b)
    }

    #[test]
    fn and_short_circuits_on_false() {
        let (r, mut ev, a, b) = setup();
        ev.register_comparison(
            ChunkKey(0),
            ExpressionKey(1),
            Logic::And,
            vec![
                ComparisonTerm { key: a, op: Comparison::Equal, rhs: Rhs::Literal(StatusValue::Unsigned { value: 99, width: 8 }) },
                ComparisonTerm { key: b, op: Comparison::Equal, rhs: Rhs::Literal(StatusValue::Unsigned { value: 2, width: 8 }) },
            ],
        )
        .unwrap();
        assert_eq!(ev.evaluate(ExpressionKey(1), &r), Evaluation::False);
    }

    #[test]
    fn comparison_against_another_status() {
        let (r, mut ev, a, b) = setup();
        ev.register_comparison(
            ChunkKey(0),
            ExpressionKey(1),
            Logic::And,
            vec![ComparisonTerm { key: b, op: Comparison::Greater, rhs: Rhs::Status(a) }],
        )
        .unwrap();
        assert_eq!(ev.evaluate(ExpressionKey(1), &r), Evaluation::True);
    }

    #[test]
    fn sub_expression_requires_dependency_already_registered() {
        let (_r, mut ev, _a, _b) = setup();
        let err = ev
            .register_sub_expression(
                ChunkKey(0),
                ExpressionKey(2),
                Logic::Or,
                vec![SubExpressionTerm { key: ExpressionKey(999), expect: true }],
            )
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::UnregisteredDependency(ExpressionKey(999))));
    }

    #[test]
    fn sub_expression_combines_children() {
        let (mut r, mut ev, a, b) = setup();
        ev.register_comparison(
            ChunkKey(0),
            ExpressionKey(1),
            Logic::And,
            vec![ComparisonTerm { key: a, op: Comparison::Equal, rhs: Rhs::Literal(StatusValue::Unsigned { value: 1, width: 8 }) }],
        )
        .unwrap();
        ev.register_comparison(
            ChunkKey(0),
            ExpressionKey(2),
            Logic::And,
            vec![ComparisonTerm { key: b, op: Comparison::Equal, rhs: Rhs::Literal(StatusValue::Unsigned { value: 2, width: 8 }) }],
        )
        .unwrap();
        ev.register_sub_expression(
            ChunkKey(0),
            ExpressionKey(3),
            Logic::And,
            vec![SubExpressionTerm { key: ExpressionKey(1), expect: true }, SubExpressionTerm { key: ExpressionKey(2), expect: true }],
        )
        .unwrap();
        assert_eq!(ev.evaluate(ExpressionKey(3), &r), Evaluation::True);

        r.assign_status(a, Assignment::Copy, StatusValue::Unsigned { value: 0, width: 8 }).unwrap();
        assert_eq!(ev.evaluate(ExpressionKey(3), &r), Evaluation::False);
    }

    #[test]
    fn remove_chunk_drops_expressions() {
        let (r, mut ev, a, _b) = setup();
        ev.register_comparison(
            ChunkKey(0),
            ExpressionKey(1),
            Logic::And,
            vec![ComparisonTerm { key: a, op: Comparison::Equal, rhs: Rhs::Literal(StatusValue::Unsigned { value: 1, width: 8 }) }],
        )
        .unwrap();
        ev.remove_chunk(ChunkKey(0));
        assert!(!ev.contains(ExpressionKey(1)));
        assert_eq!(ev.evaluate(ExpressionKey(1), &r), Evaluation::Unknown);
    }
}
