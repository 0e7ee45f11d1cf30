//! Tagged status values: tri-state comparison and fallible assignment.
//!
//! A `StatusValue` is the unit the whole engine reacts to. It carries its own
//! width so the reservoir can pack it bit-exactly, and every mutating or
//! comparing operation reports failure rather than silently truncating or
//! coercing — a handler must never fire on a value nobody actually computed.

#![forbid(unsafe_code)]

use std::cmp::Ordering;

/// Bit width of an integer-backed `StatusValue`. Must fit in a single
/// reservoir block (`1..=64`).
pub type Width = u8;

/// Default multiple of `f64::EPSILON` treated as equal for float comparison,
/// used when no engine-specific scale is configured.
pub const DEFAULT_EPSILON_SCALE: f64 = 4.0;

/// A typed, width-tagged status value.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum StatusValue {
    /// No value registered at this key.
    Empty,
    /// A single packed bit.
    Bool(bool),
    /// An unsigned integer packed into `width` bits (`1..=64`).
    Unsigned { value: u64, width: Width },
    /// A signed (two's complement) integer packed into `width` bits (`2..=64`).
    Signed { value: i64, width: Width },
    /// An IEEE-754 double. Always occupies 64 bits.
    Float(f64),
}

/// Comparison operator applied by `StatusComparison` terms and `compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Comparison {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    Less,
    /// `<=`
    LessEqual,
    /// `>`
    Greater,
    /// `>=`
    GreaterEqual,
}

/// Assignment operator applied by accumulator records and `assign`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Assignment {
    /// Replace the value outright.
    Copy,
    /// `+=` (integers and floats).
    Add,
    /// `-=` (integers and floats).
    Sub,
    /// `*=` (integers and floats).
    Mul,
    /// `/=` (floats and integers; fails on zero divisor).
    Div,
    /// `%=` (integers only; fails on zero divisor).
    Mod,
    /// Bitwise/boolean `|=`.
    Or,
    /// Bitwise/boolean `^=`.
    Xor,
    /// Bitwise/boolean `&=`.
    And,
}

/// Tri-state evaluation result: a comparison or expression can be `Unknown`
/// when one of its operands is `Empty` or of an incompatible kind, rather
/// than defaulting to either boolean extreme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Indeterminate: a comparison operand was missing or incompatible.
    Unknown,
    /// Determinately false.
    False,
    /// Determinately true.
    True,
}

impl Evaluation {
    /// `True` iff the value is non-`Unknown` and truthy.
    #[inline]
    pub fn is_true(self) -> bool {
        matches!(self, Evaluation::True)
    }

    /// Lift a plain bool into the determinate `True`/`False` cases.
    #[inline]
    pub fn from_bool(b: bool) -> Self {
        if b { Evaluation::True } else { Evaluation::False }
    }

    /// Logical AND with short-circuit-friendly tri-state rules: `Unknown`
    /// propagates unless the other side is already known `False`.
    #[inline]
    pub fn and(self, other: Evaluation) -> Evaluation {
        match (self, other) {
            (Evaluation::False, _) | (_, Evaluation::False) => Evaluation::False,
            (Evaluation::Unknown, _) | (_, Evaluation::Unknown) => Evaluation::Unknown,
            (Evaluation::True, Evaluation::True) => Evaluation::True,
        }
    }

    /// Logical OR with short-circuit-friendly tri-state rules: `Unknown`
    /// propagates unless the other side is already known `True`.
    #[inline]
    pub fn or(self, other: Evaluation) -> Evaluation {
        match (self, other) {
            (Evaluation::True, _) | (_, Evaluation::True) => Evaluation::True,
            (Evaluation::Unknown, _) | (_, Evaluation::Unknown) => Evaluation::Unknown,
            (Evaluation::False, Evaluation::False) => Evaluation::False,
        }
    }
}

/// Errors returned by `StatusValue::assign`.
#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    /// `op` is not defined between the receiver's kind and the operand's kind.
    #[error("operator {op:?} is not defined between {lhs_kind} and {rhs_kind}")]
    KindMismatch {
        /// The operator that was rejected.
        op: Assignment,
        /// Kind name of the value being assigned into.
        lhs_kind: &'static str,
        /// Kind name of the operand.
        rhs_kind: &'static str,
    },
    /// `Div`/`Mod` with a zero right-hand side.
    #[error("division by zero")]
    DivByZero,
    /// The computed result does not fit in the receiver's declared width.
    #[error("result does not round-trip through {width}-bit storage")]
    Overflow {
        /// The receiver's declared bit width.
        width: Width,
    },
    /// The operand's numeric value does not convert exactly into the
    /// receiver's kind (e.g. a fractional float into an integer, or a
    /// negative integer into an unsigned one).
    #[error("{rhs_kind} operand does not round-trip exactly into {lhs_kind}")]
    NotRepresentable {
        /// Kind name of the value being assigned into.
        lhs_kind: &'static str,
        /// Kind name of the operand.
        rhs_kind: &'static str,
    },
    /// Attempted to assign into a `StatusValue::Empty` receiver.
    #[error("cannot assign into an empty status value")]
    IntoEmpty,
}

impl StatusValue {
    /// Name used in error messages and logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            StatusValue::Empty => "empty",
            StatusValue::Bool(_) => "bool",
            StatusValue::Unsigned { .. } => "unsigned",
            StatusValue::Signed { .. } => "signed",
            StatusValue::Float(_) => "float",
        }
    }

    /// Bit width this value occupies in a reservoir block.
    pub fn bit_width(&self) -> Width {
        match self {
            StatusValue::Empty => 0,
            StatusValue::Bool(_) => 1,
            StatusValue::Unsigned { width, .. } => *width,
            StatusValue::Signed { width, .. } => *width,
            StatusValue::Float(_) => 64,
        }
    }

    /// Tri-state comparison against `rhs` using `op` and the default float
    /// epsilon scale ([`DEFAULT_EPSILON_SCALE`]). Returns `Unknown` when
    /// either side is `Empty` or the two sides are not comparable kinds.
    pub fn compare(&self, op: Comparison, rhs: &StatusValue) -> Evaluation {
        self.compare_scaled(op, rhs, DEFAULT_EPSILON_SCALE)
    }

    /// As [`Self::compare`], but floats within `epsilon_scale * f64::EPSILON`
    /// of each other compare as equal rather than using raw `partial_cmp`.
    pub fn compare_scaled(&self, op: Comparison, rhs: &StatusValue, epsilon_scale: f64) -> Evaluation {
        let ordering = match (self, rhs) {
            (StatusValue::Bool(a), StatusValue::Bool(b)) => a.cmp(b),
            (StatusValue::Unsigned { value: a, .. }, StatusValue::Unsigned { value: b, .. }) => {
                a.cmp(b)
            }
            (StatusValue::Signed { value: a, .. }, StatusValue::Signed { value: b, .. }) => {
                a.cmp(b)
            }
            (StatusValue::Unsigned { value: a, .. }, StatusValue::Signed { value: b, .. }) => {
                if *b < 0 {
                    Ordering::Greater
                } else {
                    a.cmp(&(*b as u64))
                }
            }
            (StatusValue::Signed { value: a, .. }, StatusValue::Unsigned { value: b, .. }) => {
                if *a < 0 {
                    Ordering::Less
                } else {
                    (*a as u64).cmp(b)
                }
            }
            (StatusValue::Float(a), StatusValue::Float(b)) => {
                if a.is_nan() || b.is_nan() {
                    return Evaluation::Unknown;
                }
                let epsilon = f64::EPSILON * epsilon_scale;
                if (a - b).abs() <= epsilon {
                    Ordering::Equal
                } else if a < b {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            _ => return Evaluation::Unknown,
        };
        let truth = match op {
            Comparison::Equal => ordering == Ordering::Equal,
            Comparison::NotEqual => ordering != Ordering::Equal,
            Comparison::Less => ordering == Ordering::Less,
            Comparison::LessEqual => ordering != Ordering::Greater,
            Comparison::Greater => ordering == Ordering::Greater,
            Comparison::GreaterEqual => ordering != Ordering::Less,
        };
        Evaluation::from_bool(truth)
    }

    /// Apply `op` with `rhs` as the right-hand operand, returning whether the
    /// stored value actually changed. `self`'s kind and width are preserved;
    /// the result is range-checked against them.
    pub fn assign(&mut self, op: Assignment, rhs: &StatusValue) -> Result<bool, AssignError> {
        match self {
            StatusValue::Empty => Err(AssignError::IntoEmpty),
            StatusValue::Bool(lhs) => {
                let rhs_b = match rhs {
                    StatusValue::Bool(b) => *b,
                    _ => {
                        return Err(AssignError::KindMismatch {
                            op,
                            lhs_kind: "bool",
                            rhs_kind: rhs.kind_name(),
                        })
                    }
                };
                let new_val = match op {
                    Assignment::Copy => rhs_b,
                    Assignment::Or => *lhs || rhs_b,
                    Assignment::Xor => *lhs != rhs_b,
                    Assignment::And => *lhs && rhs_b,
                    _ => {
                        return Err(AssignError::KindMismatch {
                            op,
                            lhs_kind: "bool",
                            rhs_kind: rhs.kind_name(),
                        })
                    }
                };
                let changed = new_val != *lhs;
                *lhs = new_val;
                Ok(changed)
            }
            StatusValue::Unsigned { value, width } => {
                let rhs_v = match rhs {
                    StatusValue::Unsigned { value, .. } => *value,
                    StatusValue::Signed { value, .. } if *value >= 0 => *value as u64,
                    StatusValue::Float(f) => f64_to_u64_exact(*f).ok_or(AssignError::NotRepresentable {
                        lhs_kind: "unsigned",
                        rhs_kind: "float",
                    })?,
                    _ => {
                        return Err(AssignError::KindMismatch {
                            op,
                            lhs_kind: "unsigned",
                            rhs_kind: rhs.kind_name(),
                        })
                    }
                };
                let new_val = apply_unsigned(op, *value, rhs_v)?;
                check_unsigned_width(new_val, *width)?;
                let changed = new_val != *value;
                *value = new_val;
                Ok(changed)
            }
            StatusValue::Signed { value, width } => {
                let rhs_v = match rhs {
                    StatusValue::Signed { value, .. } => *value,
                    StatusValue::Unsigned { value, .. } if *value <= i64::MAX as u64 => *value as i64,
                    StatusValue::Float(f) => f64_to_i64_exact(*f).ok_or(AssignError::NotRepresentable {
                        lhs_kind: "signed",
                        rhs_kind: "float",
                    })?,
                    _ => {
                        return Err(AssignError::KindMismatch {
                            op,
                            lhs_kind: "signed",
                            rhs_kind: rhs.kind_name(),
                        })
                    }
                };
                let new_val = apply_signed(op, *value, rhs_v)?;
                check_signed_width(new_val, *width)?;
                let changed = new_val != *value;
                *value = new_val;
                Ok(changed)
            }
            StatusValue::Float(value) => {
                let rhs_v = match rhs {
                    StatusValue::Float(f) => *f,
                    StatusValue::Unsigned { value, .. } => {
                        u64_to_f64_exact(*value).ok_or(AssignError::NotRepresentable {
                            lhs_kind: "float",
                            rhs_kind: "unsigned",
                        })?
                    }
                    StatusValue::Signed { value, .. } => {
                        i64_to_f64_exact(*value).ok_or(AssignError::NotRepresentable {
                            lhs_kind: "float",
                            rhs_kind: "signed",
                        })?
                    }
                    _ => {
                        return Err(AssignError::KindMismatch {
                            op,
                            lhs_kind: "float",
                            rhs_kind: rhs.kind_name(),
                        })
                    }
                };
                let new_val = match op {
                    Assignment::Copy => rhs_v,
                    Assignment::Add => *value + rhs_v,
                    Assignment::Sub => *value - rhs_v,
                    Assignment::Mul => *value * rhs_v,
                    Assignment::Div => {
                        if rhs_v == 0.0 {
                            return Err(AssignError::DivByZero);
                        }
                        *value / rhs_v
                    }
                    _ => {
                        return Err(AssignError::KindMismatch {
                            op,
                            lhs_kind: "float",
                            rhs_kind: rhs.kind_name(),
                        })
                    }
                };
                let changed = new_val != *value;
                *value = new_val;
                Ok(changed)
            }
        }
    }
}

/// Converts `value` to `f64`, accepting the result only if casting it back
/// recovers `value` exactly.
fn u64_to_f64_exact(value: u64) -> Option<f64> {
    let as_f = value as f64;
    if as_f as u64 == value {
        Some(as_f)
    } else {
        None
    }
}

/// As [`u64_to_f64_exact`], for the signed side.
fn i64_to_f64_exact(value: i64) -> Option<f64> {
    let as_f = value as f64;
    if as_f as i64 == value {
        Some(as_f)
    } else {
        None
    }
}

/// Converts `value` to `u64`, accepting the result only if it has no
/// fractional part and casting it back recovers `value` exactly.
fn f64_to_u64_exact(value: f64) -> Option<u64> {
    if !value.is_finite() || value.fract() != 0.0 || value < 0.0 {
        return None;
    }
    let as_u = value as u64;
    if as_u as f64 == value {
        Some(as_u)
    } else {
        None
    }
}

/// As [`f64_to_u64_exact`], for the signed side.
fn f64_to_i64_exact(value: f64) -> Option<i64> {
    if !value.is_finite() || value.fract() != 0.0 {
        return None;
    }
    let as_i = value as i64;
    if as_i as f64 == value {
        Some(as_i)
    } else {
        None
    }
}

fn apply_unsigned(op: Assignment, lhs: u64, rhs: u64) -> Result<u64, AssignError> {
    match op {
        Assignment::Copy => Ok(rhs),
        Assignment::Add => Ok(lhs.wrapping_add(rhs)),
        Assignment::Sub => Ok(lhs.wrapping_sub(rhs)),
        Assignment::Mul => Ok(lhs.wrapping_mul(rhs)),
        Assignment::Div => {
            if rhs == 0 {
                Err(AssignError::DivByZero)
            } else {
                Ok(lhs / rhs)
            }
        }
        Assignment::Mod => {
            if rhs == 0 {
                Err(AssignError::DivByZero)
            } else {
                Ok(lhs % rhs)
            }
        }
        Assignment::Or => Ok(lhs | rhs),
        Assignment::Xor => Ok(lhs ^ rhs),
        Assignment::And => Ok(lhs & rhs),
    }
}

fn apply_signed(op: Assignment, lhs: i64, rhs: i64) -> Result<i64, AssignError> {
    match op {
        Assignment::Copy => Ok(rhs),
        Assignment::Add => Ok(lhs.wrapping_add(rhs)),
        Assignment::Sub => Ok(lhs.wrapping_sub(rhs)),
        Assignment::Mul => Ok(lhs.wrapping_mul(rhs)),
        Assignment::Div => {
            if rhs == 0 {
                Err(AssignError::DivByZero)
            } else {
                Ok(lhs / rhs)
            }
        }
        Assignment::Mod => {
            if rhs == 0 {
                Err(AssignError::DivByZero)
            } else {
                Ok(lhs % rhs)
            }
        }
        Assignment::Or => Ok(lhs | rhs),
        Assignment::Xor => Ok(lhs ^ rhs),
        Assignment::And => Ok(lhs & rhs),
    }
}

fn check_unsigned_width(value: u64, width: Width) -> Result<(), AssignError> {
    if width >= 64 {
        return Ok(());
    }
    let max = (1u64 << width) - 1;
    if value > max {
        Err(AssignError::Overflow { width })
    } else {
        Ok(())
    }
}

fn check_signed_width(value: i64, width: Width) -> Result<(), AssignError> {
    if width >= 64 {
        return Ok(());
    }
    let min = -(1i64 << (width - 1));
    let max = (1i64 << (width - 1)) - 1;
    if value < min || value > max {
        Err(AssignError::Overflow { width })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_cross_signedness() {
        let a = StatusValue::Unsigned { value: 5, width: 8 };
        let b = StatusValue::Signed { value: -1, width: 8 };
        assert_eq!(a.compare(Comparison::Greater, &b), Evaluation::True);
        assert_eq!(b.compare(Comparison::Less, &a), Evaluation::True);
    }

    #[test]
    fn compare_empty_is_unknown() {
        let a = StatusValue::Empty;
        let b = StatusValue::Bool(true);
        assert_eq!(a.compare(Comparison::Equal, &b), Evaluation::Unknown);
    }

    #[test]
    fn assign_overflow_rejected() {
        let mut v = StatusValue::Unsigned { value: 250, width: 8 };
        let rhs = StatusValue::Unsigned { value: 10, width: 8 };
        let err = v.assign(Assignment::Add, &rhs).unwrap_err();
        assert!(matches!(err, AssignError::Overflow { width: 8 }));
    }

    #[test]
    fn assign_div_by_zero() {
        let mut v = StatusValue::Signed { value: 4, width: 16 };
        let rhs = StatusValue::Signed { value: 0, width: 16 };
        assert!(matches!(v.assign(Assignment::Div, &rhs), Err(AssignError::DivByZero)));
    }

    #[test]
    fn assign_reports_no_change() {
        let mut v = StatusValue::Bool(true);
        let rhs = StatusValue::Bool(true);
        assert_eq!(v.assign(Assignment::Or, &rhs).unwrap(), false);
    }

    #[test]
    fn float_equality_is_epsilon_scaled() {
        let a = StatusValue::Float(1.0);
        let b = StatusValue::Float(1.0 + f64::EPSILON);
        assert_eq!(a.compare(Comparison::Equal, &b), Evaluation::True);

        let c = StatusValue::Float(1.0 + 100.0 * f64::EPSILON);
        assert_eq!(a.compare(Comparison::Equal, &c), Evaluation::False);
        assert_eq!(a.compare(Comparison::Less, &c), Evaluation::True);
    }

    #[test]
    fn assign_converts_across_kinds_when_exact() {
        let mut v = StatusValue::Float(0.0);
        let rhs = StatusValue::Unsigned { value: 3, width: 8 };
        assert_eq!(v.assign(Assignment::Copy, &rhs).unwrap(), true);
        assert_eq!(v, StatusValue::Float(3.0));

        let mut v = StatusValue::Unsigned { value: 0, width: 8 };
        let rhs = StatusValue::Float(5.0);
        assert_eq!(v.assign(Assignment::Copy, &rhs).unwrap(), true);
        assert_eq!(v, StatusValue::Unsigned { value: 5, width: 8 });
    }

    #[test]
    fn assign_rejects_non_round_tripping_conversion() {
        let mut v = StatusValue::Unsigned { value: 0, width: 8 };
        let rhs = StatusValue::Float(0.5);
        let err = v.assign(Assignment::Copy, &rhs).unwrap_err();
        assert!(matches!(err, AssignError::NotRepresentable { lhs_kind: "unsigned", rhs_kind: "float" }));

        let mut v = StatusValue::Unsigned { value: 0, width: 8 };
        let rhs = StatusValue::Signed { value: -1, width: 8 };
        assert!(matches!(v.assign(Assignment::Copy, &rhs), Err(AssignError::KindMismatch { .. })));
    }

    #[test]
    fn tri_state_and_or() {
        assert_eq!(Evaluation::False.and(Evaluation::Unknown), Evaluation::False);
        assert_eq!(Evaluation::True.and(Evaluation::Unknown), Evaluation::Unknown);
        assert_eq!(Evaluation::True.or(Evaluation::Unknown), Evaluation::True);
        assert_eq!(Evaluation::False.or(Evaluation::Unknown), Evaluation::Unknown);
    }
}
