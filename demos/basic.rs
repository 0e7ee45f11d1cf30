//! Minimal CLI demo: register a couple of statuses and an expression, queue
//! a change through the accumulator, and tick the engine to see a handler
//! fire.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::rc::Rc;

use rules_engine::accumulator::Delay;
use rules_engine::dispatcher::{make_condition_from_units, UNIT_ANY, UNIT_TRUE};
use rules_engine::engine::{ExpressionRecord, ExpressionTerms, HandlerRecord, StatusRecord};
use rules_engine::evaluator::{ComparisonTerm, Logic, Rhs};
use rules_engine::status_value::{Assignment, Comparison, Evaluation, StatusValue};
use rules_engine::{ChunkKey, Engine, EngineConfig, ExpressionKey, StatusKey};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "basic_demo=info".into()))
        .with_target(false)
        .compact()
        .init();

    let mut engine = Engine::new(EngineConfig::new());

    let chunk = ChunkKey(0);
    let health = StatusKey(1);
    let is_dead = ExpressionKey(1);

    let log = Rc::new(RefCell::new(Vec::new()));
    let log2 = log.clone();
    let on_death: Rc<dyn Fn(ExpressionKey, Evaluation, Evaluation)> =
        Rc::new(move |expr, now, last| log2.borrow_mut().push((expr, now, last)));

    engine.extend_chunk(
        chunk,
        [StatusRecord { key: health, init: StatusValue::Unsigned { value: 100, width: 16 } }],
        [ExpressionRecord {
            key: is_dead,
            logic: Logic::And,
            terms: ExpressionTerms::Comparison(vec![ComparisonTerm {
                key: health,
                op: Comparison::Equal,
                rhs: Rhs::Literal(StatusValue::Unsigned { value: 0, width: 16 }),
            }]),
        }],
        [(
            HandlerRecord {
                expr: is_dead,
                condition: make_condition_from_units(UNIT_TRUE, UNIT_ANY).unwrap(),
                priority: 0,
            },
            on_death,
        )],
    )?;

    engine.accumulator_mut().enqueue(
        health,
        Assignment::Copy,
        StatusValue::Unsigned { value: 0, width: 16 },
        Delay::Yield,
    );
    engine.tick();

    for (expr, now, last) in log.borrow().iter() {
        tracing::info!(?expr, ?now, ?last, "handler fired");
    }

    Ok(())
}
