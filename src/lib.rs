//! Crate root: public surface, key newtypes, and crate-wide invariants.
//!
//! This module is the **single canonical entry-point** for downstream users
//! of the library. It centralizes the opaque key newtypes shared by every
//! component and re-exports the [`Engine`] façade that composes them.
//!
//! ## Invariants
//!
//! - **Single-threaded, synchronous.** One [`Engine`] is driven by one
//!   thread at a time; `tick()` is atomic from the caller's point of view,
//!   and a re-entrant call (a handler calling `tick()` again) is a
//!   documented no-op rather than undefined behavior. We **forbid unsafe**
//!   throughout the crate.
//! - **No wire protocol.** Keys are opaque `u64`s the host derives however
//!   it likes (typically by hashing a name); this crate never parses a
//!   name, a table, or a file format. See [`engine::StatusRecord`] and
//!   friends for the plain record shapes a host-side builder is expected to
//!   produce and feed in.
//! - **Chunk-atomic teardown.** `Engine::remove_chunk` deletes every status,
//!   expression, and handler registered under a chunk key together, across
//!   all three owning components.
//!
//! These invariants are enforced by design across the submodules. If any is
//! violated at runtime, the failure mode is a **precise error** (`Result`,
//! `bool`, or `Option`), never UB.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use std::fmt;

/// Tagged value and its comparison/assignment semantics.
pub mod status_value;
/// Bit-packed columnar status storage.
pub mod reservoir;
/// Batched, ordered status-change queue.
pub mod accumulator;
/// Compiled boolean expressions over status terms.
pub mod evaluator;
/// Status/expression monitors and the tick-driven dispatch loop.
pub mod dispatcher;
/// Engine-wide tunables.
pub mod config;
/// The façade composing the four components above.
pub mod engine;

pub use crate::config::EngineConfig;
pub use crate::engine::{Engine, EngineError, ExpressionRecord, ExpressionTerms, HandlerRecord, StatusRecord};

// ============================================================================
// Opaque key newtypes, shared by every component.
// ============================================================================

macro_rules! key_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            /// The raw integer key.
            #[inline]
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self(v)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

key_newtype!(
    /// Groups statuses, expressions, and handlers that are registered and
    /// torn down together (see `Engine::remove_chunk`).
    ChunkKey
);
key_newtype!(
    /// Identifies one registered status value.
    StatusKey
);
key_newtype!(
    /// Identifies one registered (possibly compound) expression.
    ExpressionKey
);
