//! Status/expression monitors, transition detection, and handler dispatch.
//!
//! The dispatcher owns two inverted indexes — which expressions watch a
//! status, and which handlers watch an expression — and drives the tick
//! loop: find statuses that changed, re-evaluate only the expressions that
//! could be affected, and invoke the handlers whose registered condition
//! matches the expression's `(last, now)` truth-value transition, in
//! ascending priority order.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::rc::Weak;

use crate::evaluator::{Evaluator, Kind};
use crate::reservoir::Reservoir;
use crate::status_value::Evaluation;
use crate::{ChunkKey, ExpressionKey, StatusKey};

/// A handler's registered condition: `now` unit bits in the low 3 bits,
/// `last` unit bits shifted into the high 3 bits.
pub type Condition = u8;

/// Evaluation failed.
pub const UNIT_NULL: Condition = 1;
/// Evaluation was false.
pub const UNIT_FALSE: Condition = 2;
/// Evaluation was true.
pub const UNIT_TRUE: Condition = 4;
/// Evaluation did not fail.
pub const UNIT_NOT_NULL: Condition = UNIT_FALSE | UNIT_TRUE;
/// Evaluation was not false.
pub const UNIT_NOT_FALSE: Condition = UNIT_NULL | UNIT_TRUE;
/// Evaluation was not true.
pub const UNIT_NOT_TRUE: Condition = UNIT_FALSE | UNIT_NULL;
/// Any evaluation.
pub const UNIT_ANY: Condition = UNIT_NULL | UNIT_FALSE | UNIT_TRUE;

const UNIT_BITS: u32 = 3;

fn unit_of(eval: Evaluation) -> Condition {
    match eval {
        Evaluation::True => UNIT_TRUE,
        Evaluation::False => UNIT_FALSE,
        Evaluation::Unknown => UNIT_NULL,
    }
}

/// Build a handler condition from the expression's most recent and previous
/// evaluation. Returns `None` when `now == last` — a handler can never be
/// asked to fire on a transition that did not happen, since the dispatcher
/// skips re-caching an expression whose evaluation hasn't changed.
pub fn make_condition(now: Evaluation, last: Evaluation) -> Option<Condition> {
    let now_u = unit_of(now);
    let last_u = unit_of(last);
    if now_u == last_u {
        None
    } else {
        Some(now_u | (last_u << UNIT_BITS))
    }
}

/// Build a handler condition directly from two unit-condition bitmasks
/// (e.g. [`UNIT_NOT_NULL`]). Rejects the "stationary" case where both sides
/// name the exact same single evaluation outcome, since that can never
/// correspond to an actual transition; a repeated *combined* mask (more than
/// one bit set) is allowed since it still spans a real transition.
pub fn make_condition_from_units(now: Condition, last: Condition) -> Option<Condition> {
    if now == 0 || last == 0 {
        return None;
    }
    let is_single_bit = now & (now - 1) == 0;
    if now != last || !is_single_bit {
        Some(now | (last << UNIT_BITS))
    } else {
        None
    }
}

struct Handler {
    condition: Condition,
    function: Weak<dyn Fn(ExpressionKey, Evaluation, Evaluation)>,
    priority: i32,
}

impl Handler {
    fn is_matched(&self, transition: Condition) -> bool {
        transition == (transition & self.condition)
    }
}

/// Condition and priority a handler was registered with, returned by
/// [`Dispatcher::find_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerInfo {
    /// The handler's registered condition mask.
    pub condition: Condition,
    /// The handler's registered priority.
    pub priority: i32,
}

struct ExpressionMonitor {
    chunk: ChunkKey,
    /// True if evaluating this expression should never reuse a memoized
    /// last-evaluation (it is, or transitively contains, a transition term).
    flush_condition: bool,
    last_evaluation: Evaluation,
    handlers: Vec<Handler>,
}

/// Errors from dispatcher registration calls.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    /// `register_handler` named an expression the `Evaluator` doesn't know.
    #[error("expression {0:?} is not registered in the evaluator")]
    UnknownExpression(ExpressionKey),
}

/// Inverted status/expression indexes plus the tick-driven dispatch loop.
#[derive(Default)]
pub struct Dispatcher {
    status_monitors: HashMap<StatusKey, Vec<ExpressionKey>>,
    /// Whether a status still existed in the reservoir as of the last tick,
    /// so a status that vanishes (its chunk was removed) can be told apart
    /// from one that merely holds steady.
    status_existed: HashMap<StatusKey, bool>,
    expression_monitors: HashMap<ExpressionKey, ExpressionMonitor>,
    dispatching: bool,
}

impl Dispatcher {
    /// A dispatcher with no monitors or handlers registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler function for `expr`'s evaluation transitions.
    /// The first registration against a given expression walks its
    /// dependency tree (recursing into sub-expressions) to populate the
    /// status monitor index; later registrations reuse it.
    pub fn register_handler(
        &mut self,
        evaluator: &Evaluator,
        expr: ExpressionKey,
        condition: Condition,
        function: Weak<dyn Fn(ExpressionKey, Evaluation, Evaluation)>,
        priority: i32,
    ) -> Result<(), DispatcherError> {
        self.ensure_monitored(evaluator, expr)?;
        let monitor = self.expression_monitors.get_mut(&expr).expect("just ensured");
        monitor.handlers.push(Handler { condition, function, priority });
        Ok(())
    }

    fn ensure_monitored(
        &mut self,
        evaluator: &Evaluator,
        expr: ExpressionKey,
    ) -> Result<(), DispatcherError> {
        if self.expression_monitors.contains_key(&expr) {
            return Ok(());
        }
        let chunk = evaluator.chunk_of(expr).ok_or(DispatcherError::UnknownExpression(expr))?;
        let sign = register_expression_deps(evaluator, &mut self.status_monitors, expr, expr);
        self.expression_monitors.insert(
            expr,
            ExpressionMonitor {
                chunk,
                flush_condition: sign < 0,
                last_evaluation: Evaluation::Unknown,
                handlers: Vec::new(),
            },
        );
        Ok(())
    }

    /// Remove a single handler registration matching `function` by pointer
    /// identity. Returns whether one was found and removed.
    pub fn unregister_handler(
        &mut self,
        expr: ExpressionKey,
        function: &Weak<dyn Fn(ExpressionKey, Evaluation, Evaluation)>,
    ) -> bool {
        let Some(monitor) = self.expression_monitors.get_mut(&expr) else { return false };
        let before = monitor.handlers.len();
        monitor.handlers.retain(|h| !Weak::ptr_eq(&h.function, function));
        monitor.handlers.len() != before
    }

    /// Remove every handler registration matching `function`, across all
    /// expressions. Returns the number removed.
    pub fn unregister_handlers(
        &mut self,
        function: &Weak<dyn Fn(ExpressionKey, Evaluation, Evaluation)>,
    ) -> usize {
        let mut removed = 0;
        for monitor in self.expression_monitors.values_mut() {
            let before = monitor.handlers.len();
            monitor.handlers.retain(|h| !Weak::ptr_eq(&h.function, function));
            removed += before - monitor.handlers.len();
        }
        removed
    }

    /// Look up the live handler registered on `expr` under `function`'s
    /// identity, if any.
    pub fn find_handler(
        &self,
        expr: ExpressionKey,
        function: &Weak<dyn Fn(ExpressionKey, Evaluation, Evaluation)>,
    ) -> Option<HandlerInfo> {
        let monitor = self.expression_monitors.get(&expr)?;
        monitor
            .handlers
            .iter()
            .find(|h| h.function.strong_count() > 0 && Weak::ptr_eq(&h.function, function))
            .map(|h| HandlerInfo { condition: h.condition, priority: h.priority })
    }

    /// Drop every monitor (and its handlers) belonging to `chunk`.
    pub fn remove_chunk(&mut self, chunk: ChunkKey) {
        let dead: Vec<ExpressionKey> = self
            .expression_monitors
            .iter()
            .filter(|(_, m)| m.chunk == chunk)
            .map(|(k, _)| *k)
            .collect();
        for key in &dead {
            self.expression_monitors.remove(key);
        }
        for watchers in self.status_monitors.values_mut() {
            watchers.retain(|k| !dead.contains(k));
        }
    }

    /// Compact the dispatcher: drop handlers whose function has been
    /// dropped, drop expression monitors left with no handlers, drop status
    /// monitor entries left with no watching expressions, and re-hash the
    /// backing maps to the given bucket-count hints. Observable dispatch
    /// behavior (which handlers still fire, and on what) is unchanged.
    pub fn rebuild(&mut self, new_status_buckets: usize, new_expression_buckets: usize) {
        for monitor in self.expression_monitors.values_mut() {
            monitor.handlers.retain(|h| h.function.strong_count() > 0);
            monitor.handlers.shrink_to_fit();
        }
        self.expression_monitors.retain(|_, m| !m.handlers.is_empty());

        let live_exprs: HashSet<ExpressionKey> = self.expression_monitors.keys().copied().collect();
        for watchers in self.status_monitors.values_mut() {
            watchers.retain(|e| live_exprs.contains(e));
        }
        self.status_monitors.retain(|_, watchers| !watchers.is_empty());

        let live_statuses: HashSet<StatusKey> = self.status_monitors.keys().copied().collect();
        self.status_existed.retain(|s, _| live_statuses.contains(s));

        let mut fresh_status_monitors = HashMap::with_capacity(new_status_buckets.max(self.status_monitors.len()));
        fresh_status_monitors.extend(self.status_monitors.drain());
        self.status_monitors = fresh_status_monitors;

        let mut fresh_status_existed = HashMap::with_capacity(new_status_buckets.max(self.status_existed.len()));
        fresh_status_existed.extend(self.status_existed.drain());
        self.status_existed = fresh_status_existed;

        let mut fresh_expression_monitors =
            HashMap::with_capacity(new_expression_buckets.max(self.expression_monitors.len()));
        fresh_expression_monitors.extend(self.expression_monitors.drain());
        self.expression_monitors = fresh_expression_monitors;
    }

    /// Run one dispatch tick: find expressions touched by statuses that
    /// changed (or appeared/vanished) since the last tick, evaluate each
    /// exactly once, reset every status's transition flag, then invoke
    /// matching handlers in ascending priority order. Reentrant calls (a
    /// handler calling `tick` again) are a documented no-op.
    pub fn tick(&mut self, evaluator: &Evaluator, reservoir: &mut Reservoir) {
        if self.dispatching {
            debug_assert!(false, "Dispatcher::tick called reentrantly");
            return;
        }
        self.dispatching = true;

        // Walk every monitored status and compare its current existence
        // against what it was last tick. A status that changed, or that
        // just came into existence, makes its watchers valid to
        // re-evaluate; one that just vanished forces them to `Unknown`.
        let mut dirty: Vec<ExpressionKey> = Vec::new();
        let mut invalidated: Vec<ExpressionKey> = Vec::new();
        let monitored: Vec<StatusKey> = self.status_monitors.keys().copied().collect();
        for status in monitored {
            let existed_before = *self.status_existed.get(&status).unwrap_or(&false);
            match reservoir.find_transition(status) {
                Some(changed) => {
                    if changed || !existed_before {
                        for &expr in &self.status_monitors[&status] {
                            if !dirty.contains(&expr) {
                                dirty.push(expr);
                            }
                        }
                    }
                    self.status_existed.insert(status, true);
                }
                None => {
                    if existed_before {
                        for &expr in &self.status_monitors[&status] {
                            if !dirty.contains(&expr) {
                                dirty.push(expr);
                            }
                            if !invalidated.contains(&expr) {
                                invalidated.push(expr);
                            }
                        }
                    }
                    self.status_existed.insert(status, false);
                }
            }
        }

        struct Call {
            priority: i32,
            expr: ExpressionKey,
            now: Evaluation,
            last: Evaluation,
            function: Weak<dyn Fn(ExpressionKey, Evaluation, Evaluation)>,
        }
        let mut calls: Vec<Call> = Vec::new();

        for expr in dirty {
            let Some(monitor) = self.expression_monitors.get_mut(&expr) else { continue };
            let last = if monitor.flush_condition { Evaluation::Unknown } else { monitor.last_evaluation };
            let now = if invalidated.contains(&expr) {
                Evaluation::Unknown
            } else {
                evaluator.evaluate(expr, reservoir)
            };
            if now == last {
                continue;
            }
            monitor.last_evaluation = now;
            let Some(transition) = make_condition(now, last) else { continue };
            monitor.handlers.retain(|h| h.function.strong_count() > 0);
            for handler in &monitor.handlers {
                if handler.is_matched(transition) {
                    let at = calls.partition_point(|c| c.priority <= handler.priority);
                    calls.insert(
                        at,
                        Call { priority: handler.priority, expr, now, last, function: handler.function.clone() },
                    );
                }
            }
        }

        reservoir.reset_transitions();

        for call in calls {
            if let Some(f) = call.function.upgrade() {
                f(call.expr, call.now, call.last);
            }
        }

        self.dispatching = false;
    }
}

/// Recursively thread `register_key` (the root expression being registered,
/// unchanged across the recursion) into `status_monitors` for every status
/// `scan_key` transitively depends on. Returns `1` if `scan_key` is (or only
/// contains) comparison terms, `-1` if it is, or transitively reaches, a
/// transition term, or `0` if `scan_key` is not a registered expression.
fn register_expression_deps(
    evaluator: &Evaluator,
    status_monitors: &mut HashMap<StatusKey, Vec<ExpressionKey>>,
    register_key: ExpressionKey,
    scan_key: ExpressionKey,
) -> i8 {
    let Some(kind) = evaluator.kind_of(scan_key) else { return 0 };
    match kind {
        Kind::Transition => {
            for term in evaluator.transition_terms(scan_key) {
                insert_monitor(status_monitors, term.key, register_key);
            }
            -1
        }
        Kind::Comparison => {
            for term in evaluator.comparison_terms(scan_key) {
                insert_monitor(status_monitors, term.key, register_key);
            }
            1
        }
        Kind::SubExpression => {
            let mut result = 1i8;
            for term in evaluator.sub_expression_terms(scan_key) {
                let r = register_expression_deps(evaluator, status_monitors, register_key, term.key);
                if r == 0 {
                    return 0;
                }
                if r < 0 {
                    result = -1;
                }
            }
            result
        }
    }
}

fn insert_monitor(
    status_monitors: &mut HashMap<StatusKey, Vec<ExpressionKey>>,
    status: StatusKey,
    expr: ExpressionKey,
) {
    let watchers = status_monitors.entry(status).or_default();
    let at = watchers.partition_point(|k| *k < expr);
    if watchers.get(at) != Some(&expr) {
        watchers.insert(at, expr);
    }
}
