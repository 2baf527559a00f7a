//! Checked smi arithmetic.
//!
//! Every operation either produces a value guaranteed to be a valid smi, or
//! bails out so the caller can take its slow path (heap-number arithmetic,
//! handled elsewhere). Operands are taken by value, so on a bail-out the
//! caller's own copies are untouched; the slow path sees the original tagged
//! operands.
//!
//! Division and modulo additionally bail on any result that would have to be
//! a negative zero: smis cannot represent `-0`, and the language's numeric
//! semantics distinguish `+0` from `-0`.

use crate::value::{Smi, TaggedValue};

/// Outcome of a checked smi operation.
///
/// Callers pattern-match and route `Bail` to a named slow path. `Bail`
/// carries no payload: the operands the slow path needs are the caller's
/// unmodified inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOutcome {
    /// The result is a valid smi.
    Success(Smi),
    /// The result is not representable as a smi.
    Bail,
}

impl ArithOutcome {
    fn from_i32(value: i32) -> ArithOutcome {
        match Smi::new(value) {
            Some(smi) => ArithOutcome::Success(smi),
            None => ArithOutcome::Bail,
        }
    }

    /// Returns the result, or `None` on a bail-out.
    pub fn success(self) -> Option<Smi> {
        match self {
            ArithOutcome::Success(smi) => Some(smi),
            ArithOutcome::Bail => None,
        }
    }

    /// Returns whether the operation bailed out.
    pub fn is_bail(self) -> bool {
        self == ArithOutcome::Bail
    }
}

/// Checked addition: bails iff the mathematical sum is outside the smi range.
pub fn checked_add(lhs: Smi, rhs: Smi) -> ArithOutcome {
    // Two smis never overflow an i32; the range check is the whole test.
    ArithOutcome::from_i32(lhs.value() + rhs.value())
}

/// Checked subtraction: bails iff the difference is outside the smi range.
pub fn checked_sub(lhs: Smi, rhs: Smi) -> ArithOutcome {
    ArithOutcome::from_i32(lhs.value() - rhs.value())
}

/// Checked negation.
///
/// Bails on zero (the result would be `-0`) and on the minimum smi (the
/// positive counterpart is out of range).
pub fn negate(operand: Smi) -> ArithOutcome {
    if operand.value() == 0 {
        return ArithOutcome::Bail;
    }
    ArithOutcome::from_i32(operand.value().wrapping_neg())
}

/// Checked multiplication.
///
/// Bails on overflow, and on a zero product when exactly one operand was
/// negative (the mathematical result is `-0`).
pub fn checked_mul(lhs: Smi, rhs: Smi) -> ArithOutcome {
    let product = i64::from(lhs.value()) * i64::from(rhs.value());
    if product == 0 && (lhs.value() < 0) != (rhs.value() < 0) {
        return ArithOutcome::Bail;
    }
    if product < i64::from(Smi::MIN_VALUE) || product > i64::from(Smi::MAX_VALUE) {
        return ArithOutcome::Bail;
    }
    ArithOutcome::Success(Smi::new(product as i32).expect("range checked above"))
}

/// Checked division. The quotient must be exact.
///
/// Bails on a zero divisor, on a zero dividend with a negative divisor
/// (`0 / -n` is `-0`), on quotient overflow, and on a non-zero remainder.
pub fn checked_div(dividend: Smi, divisor: Smi) -> ArithOutcome {
    if divisor.value() == 0 {
        return ArithOutcome::Bail;
    }
    if dividend.value() == 0 && divisor.value() < 0 {
        return ArithOutcome::Bail;
    }
    let quotient = i64::from(dividend.value()) / i64::from(divisor.value());
    let remainder = i64::from(dividend.value()) % i64::from(divisor.value());
    if remainder != 0 {
        return ArithOutcome::Bail;
    }
    if quotient < i64::from(Smi::MIN_VALUE) || quotient > i64::from(Smi::MAX_VALUE) {
        return ArithOutcome::Bail;
    }
    ArithOutcome::Success(Smi::new(quotient as i32).expect("range checked above"))
}

/// Checked modulo.
///
/// Bails on a zero divisor and on a zero remainder with a negative dividend
/// (the mathematical result is `-0`).
pub fn checked_mod(dividend: Smi, divisor: Smi) -> ArithOutcome {
    if divisor.value() == 0 {
        return ArithOutcome::Bail;
    }
    let remainder = i64::from(dividend.value()) % i64::from(divisor.value());
    if remainder == 0 && dividend.value() < 0 {
        return ArithOutcome::Bail;
    }
    ArithOutcome::from_i32(remainder as i32)
}

/// Bitwise NOT. Closed over the smi range, never bails.
pub fn bit_not(operand: Smi) -> Smi {
    Smi::new(!operand.value()).expect("NOT is closed over the smi range")
}

/// Bitwise AND. Closed over the smi range.
pub fn bit_and(lhs: Smi, rhs: Smi) -> Smi {
    Smi::new(lhs.value() & rhs.value()).expect("AND is closed over the smi range")
}

/// Bitwise OR. Closed over the smi range.
pub fn bit_or(lhs: Smi, rhs: Smi) -> Smi {
    Smi::new(lhs.value() | rhs.value()).expect("OR is closed over the smi range")
}

/// Bitwise XOR. Closed over the smi range.
pub fn bit_xor(lhs: Smi, rhs: Smi) -> Smi {
    Smi::new(lhs.value() ^ rhs.value()).expect("XOR is closed over the smi range")
}

/// Shift left on the untagged 32-bit interpretation.
///
/// The shift count is masked to five bits. The 32-bit result may have lost
/// high bits; it must be re-validated against the smi range.
pub fn shift_left(operand: Smi, count: Smi) -> ArithOutcome {
    let shift = (count.value() as u32) & 0x1f;
    ArithOutcome::from_i32(operand.value().wrapping_shl(shift))
}

/// Logical (unsigned) shift right on the untagged 32-bit interpretation.
///
/// The result is treated as unsigned, so any result with either of the two
/// top bits set is outside the non-negative smi range and bails. That can
/// only happen for shift counts of zero or one applied to a negative value.
pub fn shift_logical_right(operand: Smi, count: Smi) -> ArithOutcome {
    let shift = (count.value() as u32) & 0x1f;
    let result = (operand.value() as u32) >> shift;
    if result & 0xC000_0000 != 0 {
        return ArithOutcome::Bail;
    }
    ArithOutcome::Success(Smi::new(result as i32).expect("top bits checked above"))
}

/// Arithmetic (sign-preserving) shift right. Never bails.
pub fn shift_arithmetic_right(operand: Smi, count: Smi) -> Smi {
    let shift = (count.value() as u32) & 0x1f;
    Smi::new(operand.value() >> shift).expect("arithmetic shift shrinks magnitude")
}

/// Checked addition of a compile-time constant.
pub fn add_constant(operand: Smi, constant: i32) -> ArithOutcome {
    debug_assert!(Smi::is_valid(constant));
    match operand.value().checked_add(constant) {
        Some(sum) => ArithOutcome::from_i32(sum),
        None => ArithOutcome::Bail,
    }
}

/// Checked subtraction of a compile-time constant.
pub fn sub_constant(operand: Smi, constant: i32) -> ArithOutcome {
    debug_assert!(Smi::is_valid(constant));
    match operand.value().checked_sub(constant) {
        Some(difference) => ArithOutcome::from_i32(difference),
        None => ArithOutcome::Bail,
    }
}

/// Adds a constant to a word that is not known to be a smi.
///
/// Bails if the word is a heap reference or if the sum leaves the smi range;
/// used by trampolines for index arithmetic on values read back from stack
/// slots.
pub fn try_add_constant(operand: TaggedValue, constant: i32) -> ArithOutcome {
    if !operand.is_smi() {
        return ArithOutcome::Bail;
    }
    add_constant(operand.to_smi(), constant)
}
