//! Contiguous work decomposition across devices.
//!
//! A [`WorkSplit`] describes one device's share of a 1-D array. Splits are
//! produced once, cover `[0, total)` exactly, and never overlap.

use crate::error::{Result, RuntimeError};
use std::ops::Range;

/// One device's contiguous share of a 1-D array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkSplit {
    /// Start index in the full host array.
    pub offset: usize,
    /// Element count.
    pub len: usize,
}

impl WorkSplit {
    /// Split `total` elements into `parts` contiguous, non-overlapping
    /// shares that exactly cover `[0, total)`.
    ///
    /// Every part except the last receives `total / parts` elements; the
    /// last part absorbs the remainder. A part may be empty when `total`
    /// is smaller than `parts`.
    pub fn partition(total: usize, parts: usize) -> Result<Vec<WorkSplit>> {
        if parts == 0 {
            return Err(RuntimeError::invalid_config(
                "parts",
                "must be at least 1",
            ));
        }

        let base = total / parts;
        let mut splits = Vec::with_capacity(parts);
        let mut offset = 0;
        for i in 0..parts {
            let len = if i == parts - 1 { total - offset } else { base };
            splits.push(WorkSplit { offset, len });
            offset += len;
        }
        Ok(splits)
    }

    /// Two-way split: `[total / 2, total - total / 2]`.
    pub fn halves(total: usize) -> [WorkSplit; 2] {
        let first = total / 2;
        [
            WorkSplit {
                offset: 0,
                len: first,
            },
            WorkSplit {
                offset: first,
                len: total - first,
            },
        ]
    }

    /// Index one past the last element of this share.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Whether this share holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The index range covered by this share.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_halves_match_partition() {
        for total in [0, 1, 2, 99, 100, 101] {
            let halves = WorkSplit::halves(total);
            let parts = WorkSplit::partition(total, 2).unwrap();
            assert_eq!(&halves[..], &parts[..]);
        }
    }

    #[test]
    fn test_halves_of_odd_total() {
        let [first, second] = WorkSplit::halves(101);
        assert_eq!(first, WorkSplit { offset: 0, len: 50 });
        assert_eq!(second, WorkSplit { offset: 50, len: 51 });
        assert_eq!(second.offset, first.len);
    }

    #[test]
    fn test_single_element_total() {
        let [first, second] = WorkSplit::halves(1);
        assert!(first.is_empty());
        assert_eq!(second.range(), 0..1);
    }

    #[test]
    fn test_zero_parts_rejected() {
        assert!(matches!(
            WorkSplit::partition(10, 0),
            Err(RuntimeError::InvalidConfig { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_partition_covers_exactly(total in 0usize..1_000_000, parts in 1usize..32) {
            let splits = WorkSplit::partition(total, parts).unwrap();
            prop_assert_eq!(splits.len(), parts);

            // Contiguous and non-overlapping: each share starts where the
            // previous one ended.
            let mut expected_offset = 0;
            for split in &splits {
                prop_assert_eq!(split.offset, expected_offset);
                expected_offset = split.end();
            }
            prop_assert_eq!(expected_offset, total);

            let total_len: usize = splits.iter().map(|s| s.len).sum();
            prop_assert_eq!(total_len, total);
        }
    }
}
