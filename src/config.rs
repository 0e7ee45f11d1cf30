//! Engine-wide tunables.
//!
//! Mirrors the teacher crate's builder-style parameter structs (e.g.
//! `ProveParams`/`VerifyParams` in `lib.rs`): a small, `Clone`-able struct
//! with sane defaults that callers override field-by-field rather than
//! threading a dozen constructor arguments through `Engine::new`.

#![forbid(unsafe_code)]

use crate::status_value::DEFAULT_EPSILON_SCALE;

/// Capacity hints and tunables for a new [`crate::engine::Engine`].
///
/// The capacities are advisory: they size the initial `HashMap` allocations
/// the way `Engine::new(chunk_cap, status_cap, expr_cap, cache_cap)` does in
/// the source this crate is built from, but nothing here enforces a hard
/// ceiling — the maps still grow past the hint if the host registers more.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Expected number of distinct chunks.
    pub chunk_cap: usize,
    /// Expected number of distinct status keys.
    pub status_cap: usize,
    /// Expected number of distinct expression keys.
    pub expr_cap: usize,
    /// Expected number of handler invocations cached per tick.
    pub cache_cap: usize,
    /// Multiple of `f64::EPSILON` two floats may differ by and still
    /// compare equal (spec default: 4).
    pub epsilon_scale: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { chunk_cap: 0, status_cap: 0, expr_cap: 0, cache_cap: 0, epsilon_scale: DEFAULT_EPSILON_SCALE }
    }
}

impl EngineConfig {
    /// Defaults with every capacity hint at zero and the default epsilon
    /// scale.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the expected chunk count.
    pub fn with_chunk_cap(mut self, chunk_cap: usize) -> Self {
        self.chunk_cap = chunk_cap;
        self
    }

    /// Set the expected status count.
    pub fn with_status_cap(mut self, status_cap: usize) -> Self {
        self.status_cap = status_cap;
        self
    }

    /// Set the expected expression count.
    pub fn with_expr_cap(mut self, expr_cap: usize) -> Self {
        self.expr_cap = expr_cap;
        self
    }

    /// Set the expected per-tick handler cache size.
    pub fn with_cache_cap(mut self, cache_cap: usize) -> Self {
        self.cache_cap = cache_cap;
        self
    }

    /// Set the float comparison epsilon scale.
    pub fn with_epsilon_scale(mut self, epsilon_scale: f64) -> Self {
        self.epsilon_scale = epsilon_scale;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.epsilon_scale, 4.0);
        assert_eq!(cfg.chunk_cap, 0);
    }

    #[test]
    fn builder_overrides_fields() {
        let cfg = EngineConfig::new().with_chunk_cap(8).with_status_cap(64).with_epsilon_scale(2.0);
        assert_eq!(cfg.chunk_cap, 8);
        assert_eq!(cfg.status_cap, 64);
        assert_eq!(cfg.epsilon_scale, 2.0);
    }
}
