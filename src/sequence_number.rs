use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, Sub};

/// A 27-bit packet sequence number, wrapping modulo 2^27.
///
/// There is no total order on sequence numbers: comparisons use *forward arithmetic*,
///  i.e. `a` precedes `b` iff the modular distance from `a` to `b` is less than half
///  the number space. [SequenceNumber::is_before] makes that relation explicit instead
///  of an `Ord` impl that would silently violate transitivity at the wrap-around.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    /// The number space is 2^27; all raw values are reduced into it.
    pub const MODULUS: u32 = 1 << 27;
    const HALF: u32 = 1 << 26;
    pub const MAX: SequenceNumber = SequenceNumber(Self::MODULUS - 1);

    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u32) -> SequenceNumber {
        SequenceNumber(value & (Self::MODULUS - 1))
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// A randomized initial sequence number. Randomizing the starting point lets a peer
    ///  distinguish a fresh connection from a stale one after a reset.
    pub fn random() -> SequenceNumber {
        use rand::Rng;
        SequenceNumber(rand::thread_rng().gen_range(0..Self::MODULUS))
    }

    pub fn next(self) -> SequenceNumber {
        self + 1
    }

    /// Forward-arithmetic strict ordering: true iff `other` is ahead of `self` by less
    ///  than half the number space. Equal numbers and the exact halfway point are not
    ///  'before'.
    pub fn is_before(self, other: SequenceNumber) -> bool {
        let distance = self.forward_distance(other);
        distance > 0 && distance < Self::HALF
    }

    /// The number of increments needed to get from `self` to `to`, in `[0, 2^27)`.
    pub fn forward_distance(self, to: SequenceNumber) -> u32 {
        to.0.wrapping_sub(self.0) & (Self::MODULUS - 1)
    }

    /// Iterate from `self` (inclusive) forward to `end` (exclusive).
    pub fn to(self, end: SequenceNumber) -> impl Iterator<Item = SequenceNumber> {
        let distance = self.forward_distance(end);
        (0..distance).map(move |offset| self + offset)
    }
}

impl Add<u32> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u32) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(rhs) & (Self::MODULUS - 1))
    }
}

impl Sub<u32> for SequenceNumber {
    type Output = SequenceNumber;

    fn sub(self, rhs: u32) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(rhs) & (Self::MODULUS - 1))
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
