//! Core Value type for Ember
//!
//! `Value` is the tagged union every part of the engine traffics in. It is
//! `Copy`: heap objects are referred to through an [`ObjRef`] handle into the
//! runtime's object arena, never through a pointer, so a value can be freely
//! duplicated onto stacks, into tables and across fibers.
//!
//! Numbers carry a sub-tag. Arithmetic between two `Fixed` numbers stays
//! `Fixed`; anything involving a `Float` widens to `Float`. Equality between
//! numbers is numeric, so `Fixed(2) == Float(2.0)`.

use std::fmt;

/// Handle to an object living in the runtime heap
///
/// The index addresses an arena slot; the generation distinguishes the
/// current occupant of that slot from earlier, already-swept ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

impl ObjRef {
    pub const fn new(index: u32, generation: u32) -> Self {
        ObjRef { index, generation }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// A number with its representation sub-tag
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Fixed(i64),
    Float(f64),
}

impl Number {
    #[inline]
    pub fn is_fixed(self) -> bool {
        matches!(self, Number::Fixed(_))
    }

    /// Numeric value as a float, widening fixed numbers
    #[inline]
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Fixed(n) => n as f64,
            Number::Float(f) => f,
        }
    }

    /// Numeric value as an integer, truncating floats
    #[inline]
    pub fn as_i64(self) -> i64 {
        match self {
            Number::Fixed(n) => n,
            Number::Float(f) => f as i64,
        }
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        match self {
            Number::Fixed(n) => n == 0,
            Number::Float(f) => f == 0.0,
        }
    }

    pub fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Fixed(a), Number::Fixed(b)) => Number::Fixed(a.wrapping_add(b)),
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }

    pub fn sub(self, other: Number) -> Number {
        match (self, other) {
            (Number::Fixed(a), Number::Fixed(b)) => Number::Fixed(a.wrapping_sub(b)),
            (a, b) => Number::Float(a.as_f64() - b.as_f64()),
        }
    }

    pub fn mul(self, other: Number) -> Number {
        match (self, other) {
            (Number::Fixed(a), Number::Fixed(b)) => Number::Fixed(a.wrapping_mul(b)),
            (a, b) => Number::Float(a.as_f64() * b.as_f64()),
        }
    }

    /// Division; a fixed division by zero yields the float result (inf or NaN)
    pub fn div(self, other: Number) -> Number {
        match (self, other) {
            (Number::Fixed(_), Number::Fixed(0)) => Number::Float(self.as_f64() / 0.0),
            (Number::Fixed(a), Number::Fixed(b)) => Number::Fixed(a.wrapping_div(b)),
            (a, b) => Number::Float(a.as_f64() / b.as_f64()),
        }
    }

    /// Remainder. Mixed operands take the integer remainder of the
    /// truncated values and widen the result.
    pub fn rem(self, other: Number) -> Number {
        match (self, other) {
            (Number::Fixed(_), Number::Fixed(0)) => Number::Float(f64::NAN),
            (Number::Fixed(a), Number::Fixed(b)) => Number::Fixed(a.wrapping_rem(b)),
            (Number::Float(a), Number::Float(b)) => Number::Float(a % b),
            (a, b) => match b.as_i64() {
                0 => Number::Float(f64::NAN),
                d => Number::Float(a.as_i64().wrapping_rem(d) as f64),
            },
        }
    }

    /// Exponentiation always produces a float
    pub fn pow(self, other: Number) -> Number {
        Number::Float(self.as_f64().powf(other.as_f64()))
    }

    /// Floor division always produces a float
    pub fn floor_div(self, other: Number) -> Number {
        Number::Float((self.as_f64() / other.as_f64()).floor())
    }

    pub fn bit_and(self, other: Number) -> Number {
        Number::Fixed(self.as_i64() & other.as_i64())
    }

    pub fn bit_or(self, other: Number) -> Number {
        Number::Fixed(self.as_i64() | other.as_i64())
    }

    pub fn bit_xor(self, other: Number) -> Number {
        Number::Fixed(self.as_i64() ^ other.as_i64())
    }

    /// Shifts operate on the 32-bit truncation of both operands
    pub fn shl(self, other: Number) -> Number {
        let left = self.as_i64() as i32;
        let right = other.as_i64() as u32;
        Number::Fixed(left.wrapping_shl(right) as i64)
    }

    pub fn shr(self, other: Number) -> Number {
        let left = self.as_i64() as i32;
        let right = other.as_i64() as u32;
        Number::Fixed(left.wrapping_shr(right) as i64)
    }

    pub fn neg(self) -> Number {
        match self {
            Number::Fixed(n) => Number::Fixed(n.wrapping_neg()),
            Number::Float(f) => Number::Float(-f),
        }
    }

    pub fn bit_not(self) -> Number {
        Number::Fixed(!(self.as_i64() as i32) as i64)
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Number) -> bool {
        match (*self, *other) {
            (Number::Fixed(a), Number::Fixed(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Number) -> Option<std::cmp::Ordering> {
        match (*self, *other) {
            (Number::Fixed(a), Number::Fixed(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

impl From<i64> for Number {
    fn from(n: i64) -> Self {
        Number::Fixed(n)
    }
}

impl From<f64> for Number {
    fn from(f: f64) -> Self {
        Number::Float(f)
    }
}

/// Value: what Ember programs talk about
///
/// Host-side `PartialEq` compares objects by handle identity. The
/// language-level `==` lives in the runtime, which routes objects through
/// their class before deciding.
#[derive(Debug, Clone, Copy, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    Object(ObjRef),
}

impl Value {
    #[inline]
    pub const fn fixed(n: i64) -> Value {
        Value::Number(Number::Fixed(n))
    }

    #[inline]
    pub const fn float(f: f64) -> Value {
        Value::Number(Number::Float(f))
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// `false`, `null` and numeric zero are falsey; everything else is truthy
    pub fn is_falsey(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Number(n) => n.is_zero(),
            Value::Object(_) => false,
        }
    }

    #[inline]
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            Value::Object(r) => Some(*r),
            _ => None,
        }
    }

    /// Name of a primitive kind; objects are named by the runtime
    pub fn primitive_type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Object(_) => "object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::fixed(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::float(f)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Value::Object(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_plus_fixed_stays_fixed() {
        let sum = Number::Fixed(2).add(Number::Fixed(3));
        assert!(matches!(sum, Number::Fixed(5)));
    }

    #[test]
    fn test_fixed_plus_float_widens() {
        let sum = Number::Fixed(2).add(Number::Float(3.5));
        assert!(matches!(sum, Number::Float(f) if f == 5.5));
    }

    #[test]
    fn test_numeric_equality_ignores_subtag() {
        assert_eq!(Value::fixed(2), Value::float(2.0));
        assert_ne!(Value::fixed(2), Value::float(2.5));
    }

    #[test]
    fn test_fixed_division_by_zero_yields_float() {
        match Number::Fixed(1).div(Number::Fixed(0)) {
            Number::Float(f) => assert!(f.is_infinite()),
            other => panic!("Expected Float, got {:?}", other),
        }
        match Number::Fixed(1).rem(Number::Fixed(0)) {
            Number::Float(f) => assert!(f.is_nan()),
            other => panic!("Expected Float, got {:?}", other),
        }
    }

    #[test]
    fn test_mixed_remainder_truncates() {
        assert!(matches!(
            Number::Float(7.9).rem(Number::Fixed(3)),
            Number::Float(f) if f == 1.0
        ));
    }

    #[test]
    fn test_power_and_floor_div_are_float() {
        assert!(matches!(Number::Fixed(2).pow(Number::Fixed(3)), Number::Float(f) if f == 8.0));
        assert!(matches!(
            Number::Fixed(7).floor_div(Number::Fixed(2)),
            Number::Float(f) if f == 3.0
        ));
    }

    #[test]
    fn test_shifts_use_32_bits() {
        assert!(matches!(Number::Fixed(1).shl(Number::Fixed(4)), Number::Fixed(16)));
        assert!(matches!(Number::Fixed(-16).shr(Number::Fixed(2)), Number::Fixed(-4)));
        assert!(matches!(Number::Fixed(1).shl(Number::Fixed(31)), Number::Fixed(n) if n == i32::MIN as i64));
    }

    #[test]
    fn test_bit_not_and_neg() {
        assert!(matches!(Number::Fixed(0).bit_not(), Number::Fixed(-1)));
        assert!(matches!(Number::Fixed(5).neg(), Number::Fixed(-5)));
        assert!(matches!(Number::Float(1.5).neg(), Number::Float(f) if f == -1.5));
    }

    #[test]
    fn test_falsey() {
        assert!(Value::Null.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(Value::fixed(0).is_falsey());
        assert!(Value::float(0.0).is_falsey());
        assert!(!Value::fixed(1).is_falsey());
        assert!(!Value::Object(ObjRef::new(0, 0)).is_falsey());
    }

    #[test]
    fn test_objects_compare_by_handle() {
        let a = ObjRef::new(1, 0);
        let b = ObjRef::new(1, 1);
        assert_eq!(Value::Object(a), Value::Object(a));
        assert_ne!(Value::Object(a), Value::Object(b));
    }
}
