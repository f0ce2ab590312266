//! Nonce-space arithmetic for the 96-bit counter fragment.
//!
//! Per `(chain, sponsor)` the allocator hands out the smallest free
//! `(high, low)` pair, reusing gaps left by sponsor-chosen nonces before
//! growing past the maximum. `low` is capped at 2^31 − 1 to fit the signed
//! 32-bit storage column; the successor rolls into the next `high` word at
//! that point.

/// Largest value the `low` word may take.
pub const LOW_MAX: u32 = i32::MAX as u32;

/// The 96-bit counter fragment of a nonce, ordered by `high · 2^32 + low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NonceSegment {
    pub high: u64,
    pub low: u32,
}

impl NonceSegment {
    pub const ZERO: NonceSegment = NonceSegment { high: 0, low: 0 };

    pub fn new(high: u64, low: u32) -> Self {
        Self { high, low }
    }

    /// The next segment in combined order, rolling `low` over at 2^31 − 1.
    pub fn successor(self) -> Self {
        if self.low < LOW_MAX {
            Self {
                high: self.high,
                low: self.low + 1,
            }
        } else {
            Self {
                high: self.high + 1,
                low: 0,
            }
        }
    }
}

/// Returns the smallest segment absent from `used`, which must be sorted
/// ascending in combined order and duplicate-free (the ledger's primary key
/// guarantees both).
///
/// Walking the used set while tracking the next expected segment covers all
/// three cases of the search: an empty set yields zero, the first hole inside
/// the set yields its lower bound, and a dense set yields the successor of
/// its maximum.
pub fn first_free(used: impl IntoIterator<Item = NonceSegment>) -> NonceSegment {
    let mut expected = NonceSegment::ZERO;
    for segment in used {
        if segment != expected {
            return expected;
        }
        expected = segment.successor();
    }
    expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ledger_yields_zero() {
        assert_eq!(first_free([]), NonceSegment::ZERO);
    }

    #[test]
    fn dense_prefix_yields_successor_of_max() {
        let used = [NonceSegment::new(0, 0), NonceSegment::new(0, 1)];
        assert_eq!(first_free(used), NonceSegment::new(0, 2));
    }

    #[test]
    fn zero_only_yields_zero_one() {
        assert_eq!(
            first_free([NonceSegment::ZERO]),
            NonceSegment::new(0, 1)
        );
    }

    #[test]
    fn leading_gap_yields_zero() {
        let used = [NonceSegment::new(0, 2), NonceSegment::new(0, 3)];
        assert_eq!(first_free(used), NonceSegment::ZERO);
    }

    #[test]
    fn internal_gap_is_reused() {
        let used = [NonceSegment::new(0, 0), NonceSegment::new(0, 2)];
        assert_eq!(first_free(used), NonceSegment::new(0, 1));
    }

    #[test]
    fn gap_across_high_words() {
        let used = [
            NonceSegment::new(0, 0),
            NonceSegment::new(0, 1),
            NonceSegment::new(1, 0),
        ];
        assert_eq!(first_free(used), NonceSegment::new(0, 2));
    }

    #[test]
    fn low_saturation_rolls_to_next_high() {
        let max = NonceSegment::new(0, LOW_MAX);
        assert_eq!(max.successor(), NonceSegment::new(1, 0));

        let used = [max];
        // (0, LOW_MAX) used but (0,0) free: gap search still prefers the low end
        assert_eq!(first_free(used), NonceSegment::ZERO);
    }

    #[test]
    fn dense_up_to_saturation_rolls_over() {
        // a contiguous run ending exactly at the low cap
        let used = (0..3).map(|low| NonceSegment::new(0, LOW_MAX - 2 + low));
        // leading gap wins first
        assert_eq!(first_free(used), NonceSegment::ZERO);

        // with the full prefix marker removed, simulate the roll directly
        assert_eq!(
            NonceSegment::new(7, LOW_MAX).successor(),
            NonceSegment::new(8, 0)
        );
    }

    #[test]
    fn ordering_is_numeric() {
        // (1, 0) sorts after (0, 9) even though "10" < "9" lexicographically
        assert!(NonceSegment::new(1, 0) > NonceSegment::new(0, 9));
        assert!(NonceSegment::new(0, 10) > NonceSegment::new(0, 9));
    }
}
