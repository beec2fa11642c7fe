//! Sequence Number Handling
//!
//! RIST data packets carry a 32-bit sequence number per flow that wraps
//! around at 2^32. Ordering is decided by the signed distance between two
//! numbers, so comparisons stay correct across the wrap boundary as long as
//! the two values are less than half the sequence space apart.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Largest sequence number before wrapping back to zero
pub const MAX_SEQ_NUMBER: u32 = u32::MAX;

/// Sequence number with 32-bit wraparound semantics
///
/// Deliberately not `Ord`: a total order over raw values would sort wrapped
/// numbers incorrectly. Use [`SeqNumber::distance_to`] or the comparison
/// helpers instead.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SeqNumber(u32);

impl SeqNumber {
    /// Create a new sequence number
    #[inline]
    pub const fn new(value: u32) -> Self {
        SeqNumber(value)
    }

    /// Create a sequence number from the 64-bit value carried in data blocks
    ///
    /// Only the low 32 bits travel on the wire.
    #[inline]
    pub fn from_u64(value: u64) -> Self {
        SeqNumber(value as u32)
    }

    /// Get the raw sequence number value
    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Increment the sequence number by 1
    #[inline]
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Get the next sequence number
    #[inline]
    pub fn next(self) -> Self {
        SeqNumber(self.0.wrapping_add(1))
    }

    /// Calculate the distance from this sequence number to another
    ///
    /// Positive values mean `other` is ahead of `self`, negative means
    /// `other` is behind.
    #[inline]
    pub fn distance_to(self, other: SeqNumber) -> i32 {
        other.0.wrapping_sub(self.0) as i32
    }

    /// Check if this sequence number is before another
    #[inline]
    pub fn lt(self, other: SeqNumber) -> bool {
        self.distance_to(other) > 0
    }

    /// Check if this sequence number is before or equal to another
    #[inline]
    pub fn le(self, other: SeqNumber) -> bool {
        self == other || self.lt(other)
    }

    /// Check if this sequence number is after another
    #[inline]
    pub fn gt(self, other: SeqNumber) -> bool {
        self.distance_to(other) < 0
    }

    /// Check if this sequence number is after or equal to another
    #[inline]
    pub fn ge(self, other: SeqNumber) -> bool {
        self == other || self.gt(other)
    }
}

impl fmt::Debug for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNumber({})", self.0)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeqNumber {
    fn from(value: u32) -> Self {
        SeqNumber(value)
    }
}

impl From<SeqNumber> for u32 {
    fn from(seq: SeqNumber) -> u32 {
        seq.0
    }
}

impl Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u32> for SeqNumber {
    fn sub_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

impl Sub for SeqNumber {
    type Output = i32;

    /// Signed distance between two sequence numbers
    fn sub(self, rhs: SeqNumber) -> i32 {
        rhs.distance_to(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let seq = SeqNumber::new(100);
        assert_eq!(seq.as_raw(), 100);
    }

    #[test]
    fn test_from_u64_truncates() {
        let seq = SeqNumber::from_u64((1u64 << 32) + 7);
        assert_eq!(seq.as_raw(), 7);
    }

    #[test]
    fn test_increment_wraparound() {
        let mut seq = SeqNumber::new(MAX_SEQ_NUMBER);
        seq.increment();
        assert_eq!(seq.as_raw(), 0);
        assert_eq!(SeqNumber::new(MAX_SEQ_NUMBER).next().as_raw(), 0);
    }

    #[test]
    fn test_distance_simple() {
        let a = SeqNumber::new(100);
        let b = SeqNumber::new(200);
        assert_eq!(a.distance_to(b), 100);
        assert_eq!(b.distance_to(a), -100);
    }

    #[test]
    fn test_distance_wraparound() {
        let a = SeqNumber::new(MAX_SEQ_NUMBER - 10);
        let b = SeqNumber::new(10);
        assert_eq!(a.distance_to(b), 21);
        assert_eq!(b.distance_to(a), -21);
    }

    #[test]
    fn test_comparison() {
        let a = SeqNumber::new(100);
        let b = SeqNumber::new(200);

        assert!(a.lt(b));
        assert!(a.le(b));
        assert!(b.gt(a));
        assert!(b.ge(a));
        assert!(a.le(a));
        assert!(a.ge(a));
    }

    #[test]
    fn test_comparison_wraparound() {
        let a = SeqNumber::new(MAX_SEQ_NUMBER - 10);
        let b = SeqNumber::new(10);

        assert!(a.lt(b));
        assert!(b.gt(a));
    }

    #[test]
    fn test_add_sub_wraparound() {
        assert_eq!((SeqNumber::new(MAX_SEQ_NUMBER - 10) + 20).as_raw(), 9);
        assert_eq!((SeqNumber::new(10) - 20).as_raw(), MAX_SEQ_NUMBER - 9);

        let mut seq = SeqNumber::new(5);
        seq += 3;
        seq -= 1;
        assert_eq!(seq.as_raw(), 7);
    }

    #[test]
    fn test_sub_seqnumbers() {
        let a = SeqNumber::new(200);
        let b = SeqNumber::new(100);
        assert_eq!(a - b, 100);
        assert_eq!(b - a, -100);
    }
}
