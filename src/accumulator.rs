//! Batched, ordered status-change queue.
//!
//! Callers never assign a status directly; they accumulate a change and it
//! is applied in a later `flush`. Changes queued with the same
//! [`Delay::Follow`] chain form a *series* that is applied (or delayed) as a
//! unit. [`Delay::Yield`], [`Delay::Block`], and [`Delay::Nonblock`] each
//! start a new series and differ only in what happens when `flush` finds
//! that some status in the series already changed earlier in the same pass.

#![forbid(unsafe_code)]

use crate::reservoir::Reservoir;
use crate::status_value::{Assignment, StatusValue};
use crate::StatusKey;

/// How a queued change joins (or breaks from) the previous reservation series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Stay in the current series; applied alongside it.
    Follow,
    /// Start a new series. If any status in it already changed this flush,
    /// the whole series is deferred to the next flush.
    Yield,
    /// Start a new series. Same deferral as `Yield`, but deferring also
    /// pushes every *remaining* queued change (not just this series) to the
    /// next flush — repeated `Block` reservations can accumulate without
    /// bound if the blocking condition persists.
    Block,
    /// Start a new series that is applied unconditionally, even if a status
    /// in it already changed this flush (earlier queued changes to that
    /// status are effectively superseded).
    Nonblock,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    key: StatusKey,
    op: Assignment,
    rhs: StatusValue,
}

/// Queue of pending status changes, applied in bulk by [`Accumulator::flush`].
#[derive(Default)]
pub struct Accumulator {
    accumulated: Vec<(Record, Delay)>,
    delayed: Vec<(Record, Delay)>,
}

impl Accumulator {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of changes currently queued (not yet flushed).
    pub fn len(&self) -> usize {
        self.accumulated.len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.accumulated.is_empty()
    }

    /// Queue a single change.
    pub fn enqueue(&mut self, key: StatusKey, op: Assignment, rhs: StatusValue, delay: Delay) {
        self.accumulated.push((Record { key, op, rhs }, delay));
    }

    /// Queue a batch of changes as one series: the first uses `delay`, every
    /// subsequent change in the batch follows it (`Delay::Follow`).
    pub fn enqueue_series(
        &mut self,
        changes: impl IntoIterator<Item = (StatusKey, Assignment, StatusValue)>,
        delay: Delay,
    ) {
        let mut next_delay = delay;
        for (key, op, rhs) in changes {
            self.enqueue(key, op, rhs, next_delay);
            next_delay = Delay::Follow;
        }
    }

    /// Apply every queued series to `reservoir`, in series order, leaving
    /// deferred series queued for the next call.
    pub fn flush(&mut self, reservoir: &mut Reservoir) {
        let end = self.accumulated.len();
        let mut i = 0usize;
        while i < end {
            let nonblock = self.accumulated[i].1 == Delay::Nonblock;
            let mut should_flush = !nonblock;
            let mut j = i;
            loop {
                if should_flush {
                    let key = self.accumulated[j].0.key;
                    if reservoir.find_transition(key) == Some(true) {
                        should_flush = false;
                    }
                }
                j += 1;
                if j == end || self.accumulated[j].1 != Delay::Follow {
                    break;
                }
            }

            if nonblock || should_flush {
                let mut k = i;
                while k < j {
                    let rec = self.accumulated[k].0;
                    if reservoir.assign_status(rec.key, rec.op, rec.rhs).is_err() {
                        // This series' remaining changes are abandoned, not
                        // retried: a failed assignment means they no longer
                        // apply meaningfully (e.g. wrong operand kind).
                        break;
                    }
                    k += 1;
                }
                i = j;
            } else {
                let delay_end = if self.accumulated[i].1 == Delay::Block { end } else { j };
                self.delayed.extend(self.accumulated[i..delay_end].iter().copied());
                i = delay_end;
            }
        }
        self.accumulated.clear();
        std::mem::swap(&mut self.accumulated, &mut self.delayed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_value::StatusValue;
    use crate::ChunkKey;

    fn fresh_reservoir() -> (Reservoir, StatusKey, StatusKey) {
        let mut r = Reservoir::new();
        let a = StatusKey(1);
        let b = StatusKey(2);
        r.register_status(ChunkKey(0), a, StatusValue::Unsigned { value: 0, width: 16 }).unwrap();
        r.register_status(ChunkKey(0), b, StatusValue::Unsigned { value: 0, width: 16 }).unwrap();
        r.reset_transitions();
        (r, a, b)
    }

    #[test]
    fn follow_series_applies_together() {
        let (mut r, a, b) = fresh_reservoir();
        let mut acc = Accumulator::new();
        acc.enqueue_series(
            [
                (a, Assignment::Copy, StatusValue::Unsigned { value: 1, width: 16 }),
                (b, Assignment::Copy, StatusValue::Unsigned { value: 2, width: 16 }),
            ],
            Delay::Yield,
        );
        acc.flush(&mut r);
        assert_eq!(r.find_status(a), StatusValue::Unsigned { value: 1, width: 16 });
        assert_eq!(r.find_status(b), StatusValue::Unsigned { value: 2, width: 16 });
        assert!(acc.is_empty());
    }

    #[test]
    fn yield_defers_whole_series_if_any_member_already_changed() {
        let (mut r, a, b) = fresh_reservoir();
        // `a` already transitioned this tick (e.g. assigned directly earlier).
        r.assign_status(a, Assignment::Copy, StatusValue::Unsigned { value: 9, width: 16 }).unwrap();

        let mut acc = Accumulator::new();
        // Series head is `b` (not yet changed) but a later Follow member is `a`
        // (already changed) — "any in series" must defer the whole series.
        acc.enqueue_series(
            [
                (b, Assignment::Copy, StatusValue::Unsigned { value: 2, width: 16 }),
                (a, Assignment::Copy, StatusValue::Unsigned { value: 3, width: 16 }),
            ],
            Delay::Yield,
        );
        acc.flush(&mut r);

        // Neither change applied this flush...
        assert_eq!(r.find_status(b), StatusValue::Unsigned { value: 0, width: 16 });
        assert_eq!(r.find_status(a), StatusValue::Unsigned { value: 9, width: 16 });
        assert_eq!(acc.len(), 2);

        // ...but the next flush (once `a`'s transition flag clears) applies it.
        r.reset_transitions();
        acc.flush(&mut r);
        assert_eq!(r.find_status(b), StatusValue::Unsigned { value: 2, width: 16 });
        assert_eq!(r.find_status(a), StatusValue::Unsigned { value: 3, width: 16 });
    }

    #[test]
    fn nonblock_applies_even_if_already_changed() {
        let (mut r, a, _b) = fresh_reservoir();
        r.assign_status(a, Assignment::Copy, StatusValue::Unsigned { value: 9, width: 16 }).unwrap();

        let mut acc = Accumulator::new();
        acc.enqueue(a, Assignment::Copy, StatusValue::Unsigned { value: 3, width: 16 }, Delay::Nonblock);
        acc.flush(&mut r);
        assert_eq!(r.find_status(a), StatusValue::Unsigned { value: 3, width: 16 });
    }

    #[test]
    fn block_defers_every_subsequent_series_too() {
        let (mut r, a, b) = fresh_reservoir();
        r.assign_status(a, Assignment::Copy, StatusValue::Unsigned { value: 9, width: 16 }).unwrap();

        let mut acc = Accumulator::new();
        // First series (head=a, Block) must defer; because it's Block, the
        // second series (head=b, Yield) is swept into the same deferral even
        // though `b` itself hasn't changed.
        acc.enqueue(a, Assignment::Copy, StatusValue::Unsigned { value: 1, width: 16 }, Delay::Block);
        acc.enqueue(b, Assignment::Copy, StatusValue::Unsigned { value: 2, width: 16 }, Delay::Yield);
        acc.flush(&mut r);

        assert_eq!(r.find_status(b), StatusValue::Unsigned { value: 0, width: 16 });
        assert_eq!(acc.len(), 2);
    }
}
