//! The façade composing [`Reservoir`], [`Accumulator`], [`Evaluator`], and
//! [`Dispatcher`] into the single type a host actually drives.
//!
//! `Engine` owns the strong [`Rc`] side of every handler closure; the
//! dispatcher only ever sees a [`Weak`] reference, so a handler stops firing
//! the moment its owning chunk is removed here, with no separate cleanup
//! step required on the dispatcher's part.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::accumulator::Accumulator;
use crate::config::EngineConfig;
use crate::dispatcher::{Condition, Dispatcher, DispatcherError};
use crate::evaluator::{ComparisonTerm, Evaluator, EvaluatorError, Logic, SubExpressionTerm, TransitionTerm};
use crate::reservoir::{Reservoir, ReservoirError};
use crate::status_value::{Assignment, Evaluation, StatusValue};
use crate::{ChunkKey, ExpressionKey, StatusKey};

/// A status to register, as an external builder would hand it to
/// [`Engine::extend_chunk`].
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct StatusRecord {
    /// The key the status will be registered under.
    pub key: StatusKey,
    /// Its initial value (and, implicitly, its storage width/kind).
    pub init: StatusValue,
}

/// The term list for one [`ExpressionRecord`], tagged by the same three
/// kinds [`crate::evaluator::Kind`] distinguishes internally.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ExpressionTerms {
    /// See [`crate::evaluator::Evaluator::register_comparison`].
    Comparison(Vec<ComparisonTerm>),
    /// See [`crate::evaluator::Evaluator::register_transition`].
    Transition(Vec<TransitionTerm>),
    /// See [`crate::evaluator::Evaluator::register_sub_expression`].
    SubExpression(Vec<SubExpressionTerm>),
}

/// An expression to register, as an external builder would hand it to
/// [`Engine::extend_chunk`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExpressionRecord {
    /// The key the expression will be registered under.
    pub key: ExpressionKey,
    /// How its terms combine.
    pub logic: Logic,
    /// The terms themselves.
    pub terms: ExpressionTerms,
}

/// A handler registration to apply in [`Engine::extend_chunk`], paired with
/// the closure to invoke. The closure itself is never serialized — only the
/// condition/priority metadata is, matching spec's "no wire protocol"
/// stance: a host reconstitutes the function side out-of-band and pairs it
/// with the deserialized record before calling `extend_chunk`.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct HandlerRecord {
    /// The expression this handler watches.
    pub expr: ExpressionKey,
    /// The transition bitmask this handler fires on.
    pub condition: Condition,
    /// Dispatch order among handlers on the same expression (ascending).
    pub priority: i32,
}

/// Errors surfaced while registering a chunk's contents.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A status registration failed.
    #[error(transparent)]
    Status(#[from] ReservoirError),
    /// An expression registration failed.
    #[error(transparent)]
    Expression(#[from] EvaluatorError),
    /// A handler registration named an unknown expression.
    #[error(transparent)]
    Handler(#[from] DispatcherError),
}

/// The reactive if-then rules engine: reservoir + accumulator + evaluator +
/// dispatcher, composed behind one owning type.
pub struct Engine {
    reservoir: Reservoir,
    accumulator: Accumulator,
    evaluator: Evaluator,
    dispatcher: Dispatcher,
    /// Strong handler ownership, keyed by the chunk it was registered
    /// through. The dispatcher holds only `Weak` references into these.
    handlers: HashMap<ChunkKey, Vec<Rc<dyn Fn(ExpressionKey, Evaluation, Evaluation)>>>,
}

impl Engine {
    /// A fresh engine with no chunks registered.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            reservoir: Reservoir::with_epsilon_scale(config.epsilon_scale),
            accumulator: Accumulator::new(),
            evaluator: Evaluator::new(),
            dispatcher: Dispatcher::new(),
            handlers: HashMap::with_capacity(config.chunk_cap),
        }
    }

    /// Register a chunk's statuses, expressions, and handlers in one call.
    /// Expressions may only reference statuses and expressions already
    /// passed in `statuses`/earlier in `expressions` (or registered by a
    /// prior call) — this is what makes sub-expression cycles impossible to
    /// construct.
    pub fn extend_chunk(
        &mut self,
        chunk: ChunkKey,
        statuses: impl IntoIterator<Item = StatusRecord>,
        expressions: impl IntoIterator<Item = ExpressionRecord>,
        handlers: impl IntoIterator<Item = (HandlerRecord, Rc<dyn Fn(ExpressionKey, Evaluation, Evaluation)>)>,
    ) -> Result<(), EngineError> {
        for s in statuses {
            self.reservoir.register_status(chunk, s.key, s.init)?;
        }
        for e in expressions {
            match e.terms {
                ExpressionTerms::Comparison(terms) => {
                    self.evaluator.register_comparison(chunk, e.key, e.logic, terms)?
                }
                ExpressionTerms::Transition(terms) => {
                    self.evaluator.register_transition(chunk, e.key, e.logic, terms)?
                }
                ExpressionTerms::SubExpression(terms) => {
                    self.evaluator.register_sub_expression(chunk, e.key, e.logic, terms)?
                }
            }
        }
        for (record, function) in handlers {
            if !self.register_handler(chunk, record.expr, record.condition, function, record.priority) {
                return Err(EngineError::Handler(DispatcherError::UnknownExpression(record.expr)));
            }
        }
        tracing::debug!(chunk = chunk.as_u64(), "chunk registered");
        Ok(())
    }

    /// Drop every status, expression, and handler registered under `chunk`.
    pub fn remove_chunk(&mut self, chunk: ChunkKey) {
        self.reservoir.remove_chunk(chunk);
        self.evaluator.remove_chunk(chunk);
        self.dispatcher.remove_chunk(chunk);
        self.handlers.remove(&chunk);
        tracing::debug!(chunk = chunk.as_u64(), "chunk removed");
    }

    /// Register a single status, optionally overriding the bit width `init`
    /// would otherwise imply (ignored for `Bool`/`Float`/`Empty`). Returns
    /// whether registration succeeded.
    pub fn register_status(&mut self, chunk: ChunkKey, key: StatusKey, init: StatusValue, width: Option<u8>) -> bool {
        let init = match (init, width) {
            (StatusValue::Unsigned { value, .. }, Some(width)) => StatusValue::Unsigned { value, width },
            (StatusValue::Signed { value, .. }, Some(width)) => StatusValue::Signed { value, width },
            (other, _) => other,
        };
        self.reservoir.register_status(chunk, key, init).is_ok()
    }

    /// Apply an assignment in place. Returns whether the stored value
    /// changed; `false` both when it didn't and when `key` is unregistered
    /// or the operand kinds mismatch.
    pub fn assign_status(&mut self, key: StatusKey, op: Assignment, rhs: StatusValue) -> bool {
        self.reservoir.assign_status(key, op, rhs).unwrap_or(false)
    }

    /// Look up a status's current value (`Empty` if unregistered).
    pub fn find_status(&self, key: StatusKey) -> StatusValue {
        self.reservoir.find_status(key)
    }

    /// Mutable access to the pending-change queue.
    pub fn accumulator_mut(&mut self) -> &mut Accumulator {
        &mut self.accumulator
    }

    /// Register a handler closure against `expr`. The engine keeps the
    /// closure alive (reference-counted, scoped to `chunk`); the dispatcher
    /// only ever sees a weak reference. Returns whether registration
    /// succeeded (fails only if `expr` is unregistered in the evaluator).
    pub fn register_handler(
        &mut self,
        chunk: ChunkKey,
        expr: ExpressionKey,
        condition: Condition,
        function: Rc<dyn Fn(ExpressionKey, Evaluation, Evaluation)>,
        priority: i32,
    ) -> bool {
        let weak = Rc::downgrade(&function);
        match self.dispatcher.register_handler(&self.evaluator, expr, condition, weak, priority) {
            Ok(()) => {
                self.handlers.entry(chunk).or_default().push(function);
                true
            }
            Err(_) => false,
        }
    }

    /// Remove a single handler registration by pointer identity, across
    /// both the dispatcher's index and this engine's strong ownership.
    pub fn unregister_handler(
        &mut self,
        expr: ExpressionKey,
        function: &Weak<dyn Fn(ExpressionKey, Evaluation, Evaluation)>,
    ) -> bool {
        let removed = self.dispatcher.unregister_handler(expr, function);
        if removed {
            for owned in self.handlers.values_mut() {
                owned.retain(|h| !Weak::ptr_eq(&Rc::downgrade(h), function));
            }
        }
        removed
    }

    /// Run one tick: flush the accumulator's pending changes into the
    /// reservoir, then evaluate and dispatch on whatever changed.
    pub fn tick(&mut self) {
        tracing::trace!("tick start");
        self.accumulator.flush(&mut self.reservoir);
        self.dispatcher.tick(&self.evaluator, &mut self.reservoir);
        tracing::trace!("tick end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{make_condition_from_units, UNIT_ANY, UNIT_TRUE};
    use crate::evaluator::Rhs;
    use crate::status_value::Comparison;
    use crate::accumulator::Delay;
    use std::cell::RefCell;

    #[test]
    fn extend_chunk_wires_status_expression_and_handler() {
        let mut engine = Engine::new(EngineConfig::new());
        let chunk = ChunkKey(0);
        let key = StatusKey(1);
        let expr = ExpressionKey(1);
        let log: Rc<RefCell<Vec<Evaluation>>> = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let f: Rc<dyn Fn(ExpressionKey, Evaluation, Evaluation)> = Rc::new(move |_, now, _| log2.borrow_mut().push(now));

        engine
            .extend_chunk(
                chunk,
                [StatusRecord { key, init: StatusValue::Unsigned { value: 0, width: 8 } }],
                [ExpressionRecord {
                    key: expr,
                    logic: Logic::And,
                    terms: ExpressionTerms::Comparison(vec![ComparisonTerm {
                        key,
                        op: Comparison::Equal,
                        rhs: Rhs::Literal(StatusValue::Unsigned { value: 5, width: 8 }),
                    }]),
                }],
                [(
                    HandlerRecord {
                        expr,
                        condition: make_condition_from_units(UNIT_TRUE, UNIT_ANY).unwrap(),
                        priority: 0,
                    },
                    f.clone(),
                )],
            )
            .unwrap();

        engine.assign_status(key, Assignment::Copy, StatusValue::Unsigned { value: 5, width: 8 });
        engine.tick();

        assert_eq!(*log.borrow(), vec![Evaluation::True]);
    }

    #[test]
    fn remove_chunk_silences_its_handlers() {
        let mut engine = Engine::new(EngineConfig::new());
        let chunk = ChunkKey(0);
        let key = StatusKey(1);
        let expr = ExpressionKey(1);
        let calls = Rc::new(RefCell::new(0usize));
        let calls2 = calls.clone();
        let f: Rc<dyn Fn(ExpressionKey, Evaluation, Evaluation)> = Rc::new(move |_, _, _| *calls2.borrow_mut() += 1);

        engine
            .extend_chunk(
                chunk,
                [StatusRecord { key, init: StatusValue::Bool(false) }],
                [ExpressionRecord {
                    key: expr,
                    logic: Logic::And,
                    terms: ExpressionTerms::Comparison(vec![ComparisonTerm {
                        key,
                        op: Comparison::Equal,
                        rhs: Rhs::Literal(StatusValue::Bool(true)),
                    }]),
                }],
                [(
                    HandlerRecord {
                        expr,
                        condition: make_condition_from_units(UNIT_TRUE, UNIT_ANY).unwrap(),
                        priority: 0,
                    },
                    f,
                )],
            )
            .unwrap();

        engine.remove_chunk(chunk);
        // Re-registering under the same keys must succeed: teardown was total.
        engine
            .extend_chunk(
                chunk,
                [StatusRecord { key, init: StatusValue::Bool(false) }],
                [ExpressionRecord {
                    key: expr,
                    logic: Logic::And,
                    terms: ExpressionTerms::Comparison(vec![ComparisonTerm {
                        key,
                        op: Comparison::Equal,
                        rhs: Rhs::Literal(StatusValue::Bool(true)),
                    }]),
                }],
                [],
            )
            .unwrap();

        engine.assign_status(key, Assignment::Copy, StatusValue::Bool(true));
        engine.tick();
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn accumulator_flush_runs_before_dispatch() {
        let mut engine = Engine::new(EngineConfig::new());
        let chunk = ChunkKey(0);
        let key = StatusKey(1);
        let expr = ExpressionKey(1);
        let log: Rc<RefCell<Vec<Evaluation>>> = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let f: Rc<dyn Fn(ExpressionKey, Evaluation, Evaluation)> = Rc::new(move |_, now, _| log2.borrow_mut().push(now));

        engine
            .extend_chunk(
                chunk,
                [StatusRecord { key, init: StatusValue::Unsigned { value: 0, width: 8 } }],
                [ExpressionRecord {
                    key: expr,
                    logic: Logic::And,
                    terms: ExpressionTerms::Comparison(vec![ComparisonTerm {
                        key,
                        op: Comparison::Equal,
                        rhs: Rhs::Literal(StatusValue::Unsigned { value: 7, width: 8 }),
                    }]),
                }],
                [(
                    HandlerRecord {
                        expr,
                        condition: make_condition_from_units(UNIT_TRUE, UNIT_ANY).unwrap(),
                        priority: 0,
                    },
                    f,
                )],
            )
            .unwrap();

        engine.accumulator_mut().enqueue(key, Assignment::Copy, StatusValue::Unsigned { value: 7, width: 8 }, Delay::Yield);
        engine.tick();

        assert_eq!(*log.borrow(), vec![Evaluation::True]);
    }
}
