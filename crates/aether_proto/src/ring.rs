//! Wrapping 16-bit byte offsets used by the safe stream.

use {
    core::{convert::Infallible, fmt},
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Offset of a byte in a safe stream, wrapping around at `u16::MAX`.
///
/// Offsets only make sense relative to each other. All arithmetic is modulo
/// 2<sup>16</sup>, and comparisons go through [`RingIndex::distance`] rather
/// than the raw value.
///
/// ```text
///     65534  65535    0      1      2
/// ... --|------|------|------|------|-- ...
///       ^             ^             ^
///       |             +-------------+ 0.distance(2) = 2
///       +---------------------------+ 65534.distance(2) = 4
///                                     2.distance(0) = 65534
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RingIndex(pub u16);

impl RingIndex {
    /// Forward distance from `self` to `rhs`, always in `[0, 65536)`.
    ///
    /// # Example
    ///
    /// ```
    /// # use aether_proto::ring::RingIndex;
    /// assert_eq!(RingIndex(0).distance(RingIndex(0)), 0);
    /// assert_eq!(RingIndex(3).distance(RingIndex(5)), 2);
    /// assert_eq!(RingIndex(u16::MAX).distance(RingIndex(0)), 1);
    /// assert_eq!(RingIndex(5).distance(RingIndex(3)), u16::MAX - 1);
    /// ```
    #[must_use]
    pub const fn distance(self, rhs: Self) -> u16 {
        rhs.0.wrapping_sub(self.0)
    }

    /// Signed shortest path from `self` to `rhs`.
    ///
    /// # Example
    ///
    /// ```
    /// # use aether_proto::ring::RingIndex;
    /// assert_eq!(RingIndex(1).dist_to(RingIndex(0)), -1);
    /// assert_eq!(RingIndex(u16::MAX).dist_to(RingIndex(2)), 3);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        #[expect(clippy::cast_possible_wrap, reason = "we want wrap behavior")]
        (rhs.0.wrapping_sub(self.0) as i16)
    }

    /// Moves forward by `n`.
    #[must_use]
    pub const fn clockwise(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Moves backward by `n`.
    #[must_use]
    pub const fn counter_clockwise(self, n: u16) -> Self {
        Self(self.0.wrapping_sub(n))
    }

    /// Moves forward by a byte count, which must fit in the ring.
    ///
    /// # Panics
    ///
    /// Panics if `n` is larger than `u16::MAX`.
    #[must_use]
    pub fn advance(self, n: usize) -> Self {
        let n = u16::try_from(n).expect("advance must be smaller than the ring size");
        self.clockwise(n)
    }
}

impl fmt::Debug for RingIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RingIndex").field(&self.0).finish()
    }
}

impl fmt::Display for RingIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FixedEncodeLen for RingIndex {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for RingIndex {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for RingIndex {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

/// Where an offset lies relative to an [`OffsetRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangePosition {
    /// The offset comes before the range begins.
    Before,
    /// The offset is inside the range.
    InRange,
    /// The offset comes after the range ends.
    After,
}

/// Half-open range of stream offsets `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct OffsetRange {
    /// First offset in the range.
    pub begin: RingIndex,
    /// First offset after the range.
    pub end: RingIndex,
}

impl OffsetRange {
    /// Creates the range covering `len` bytes starting at `begin`.
    #[must_use]
    pub fn from_len(begin: RingIndex, len: usize) -> Self {
        Self {
            begin,
            end: begin.advance(len),
        }
    }

    /// Number of offsets covered.
    #[must_use]
    pub const fn len(&self) -> u16 {
        self.begin.distance(self.end)
    }

    /// Returns `true` if this range covers no offsets.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.begin.0 == self.end.0
    }

    /// Classifies `offset` against this range, treating offsets up to half
    /// the ring behind `begin` as [`RangePosition::Before`].
    ///
    /// # Example
    ///
    /// ```
    /// # use aether_proto::ring::{OffsetRange, RangePosition, RingIndex};
    /// let range = OffsetRange { begin: RingIndex(10), end: RingIndex(20) };
    /// assert_eq!(range.position(RingIndex(5)), RangePosition::Before);
    /// assert_eq!(range.position(RingIndex(10)), RangePosition::InRange);
    /// assert_eq!(range.position(RingIndex(19)), RangePosition::InRange);
    /// assert_eq!(range.position(RingIndex(20)), RangePosition::After);
    /// ```
    #[must_use]
    pub const fn position(&self, offset: RingIndex) -> RangePosition {
        let rel = self.begin.dist_to(offset);
        if rel < 0 {
            RangePosition::Before
        } else if self.begin.distance(offset) < self.len() {
            RangePosition::InRange
        } else {
            RangePosition::After
        }
    }

    /// Returns `true` if `offset` lies inside this range.
    #[must_use]
    pub const fn contains(&self, offset: RingIndex) -> bool {
        matches!(self.position(offset), RangePosition::InRange)
    }

    /// Returns `true` if the two ranges share at least one offset.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let (begin, end) = self.relative(other);
        begin < i32::from(self.len()) && end > 0
    }

    /// Gets `other`'s bounds relative to `self.begin`, as signed offsets.
    #[must_use]
    pub fn relative(&self, other: &Self) -> (i32, i32) {
        let begin = i32::from(self.begin.dist_to(other.begin));
        (begin, begin + i32::from(other.len()))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, octs::test::*, proptest::prelude::*};

    #[test]
    fn encode_decode() {
        round_trip(&RingIndex(0));
        round_trip(&RingIndex(1234));
        round_trip(&RingIndex(u16::MAX));
    }

    #[test]
    fn wraps_around() {
        assert_eq!(RingIndex(u16::MAX).clockwise(1), RingIndex(0));
        assert_eq!(RingIndex(0).counter_clockwise(1), RingIndex(u16::MAX));
        assert_eq!(RingIndex(u16::MAX).distance(RingIndex(0)), 1);
    }

    #[test]
    fn ranges_across_wrap() {
        let a = OffsetRange::from_len(RingIndex(u16::MAX - 4), 10);
        assert_eq!(a.end, RingIndex(5));
        assert_eq!(a.len(), 10);
        assert!(a.contains(RingIndex(0)));
        assert!(a.contains(RingIndex(4)));
        assert!(!a.contains(RingIndex(5)));

        let b = OffsetRange::from_len(RingIndex(3), 10);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));

        let c = OffsetRange::from_len(RingIndex(5), 10);
        assert!(!a.overlaps(&c));
    }

    proptest! {
        #[test]
        fn distance_to_self_is_zero(a: u16, n: u16) {
            let a = RingIndex(a);
            prop_assert_eq!(a.distance(a), 0);
            prop_assert_eq!(a.clockwise(n).distance(a.clockwise(n)), 0);
        }

        #[test]
        fn clockwise_then_distance(a: u16, n: u16) {
            let a = RingIndex(a);
            prop_assert_eq!(a.distance(a.clockwise(n)), n);
            prop_assert_eq!(a.clockwise(n).counter_clockwise(n), a);
        }

        #[test]
        fn distances_sum_to_ring(a: u16, b: u16) {
            let (a, b) = (RingIndex(a), RingIndex(b));
            let sum = u32::from(a.distance(b)) + u32::from(b.distance(a));
            prop_assert!(sum == 0 || sum == 1 << 16);
        }
    }
}
