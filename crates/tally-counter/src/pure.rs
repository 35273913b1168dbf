//! Pure arithmetic for shard value distribution.
//!
//! All functions are total and deterministic; the conservation property
//! (parts always sum to the whole) is what keeps the counter total intact
//! across create, split and merge.

/// Divide `total` into `shards` parts as evenly as possible.
///
/// Integer division; the remainder is absorbed into the last part so nothing
/// is lost to rounding. Returns an empty vector for `shards == 0`.
///
/// Conservation: the returned parts always sum to `total`.
pub fn split_evenly(total: i64, shards: u32) -> Vec<i64> {
    if shards == 0 {
        return Vec::new();
    }
    let n = i64::from(shards);
    let base = total / n;
    let mut parts = vec![base; shards as usize];
    // Last part absorbs the remainder.
    parts[shards as usize - 1] = total - base * (n - 1);
    parts
}

/// Split a shard's value in half for a split operation.
///
/// Returns `(kept, moved)`: the value the original shard keeps and the value
/// the new sibling receives. `kept + moved == value` always.
pub fn halve(value: i64) -> (i64, i64) {
    let kept = value / 2;
    (kept, value - kept)
}

/// Whether a shard's observed value is low enough to trigger the merge
/// maintenance routine.
pub fn needs_low_value_merge(value: i64, threshold: i64) -> bool {
    value < threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_evenly_exact() {
        assert_eq!(split_evenly(90, 3), vec![30, 30, 30]);
    }

    #[test]
    fn split_evenly_remainder_in_last() {
        assert_eq!(split_evenly(100, 3), vec![33, 33, 34]);
        assert_eq!(split_evenly(7, 4), vec![1, 1, 1, 4]);
    }

    #[test]
    fn split_evenly_single_shard() {
        assert_eq!(split_evenly(100, 1), vec![100]);
    }

    #[test]
    fn split_evenly_zero_shards() {
        assert!(split_evenly(100, 0).is_empty());
    }

    #[test]
    fn split_evenly_value_smaller_than_shard_count() {
        assert_eq!(split_evenly(2, 3), vec![0, 0, 2]);
    }

    #[test]
    fn halve_even_and_odd() {
        assert_eq!(halve(100), (50, 50));
        assert_eq!(halve(33), (16, 17));
        assert_eq!(halve(1), (0, 1));
        assert_eq!(halve(0), (0, 0));
    }

    #[test]
    fn low_value_threshold_boundary() {
        assert!(needs_low_value_merge(14, 15));
        assert!(!needs_low_value_merge(15, 15));
        assert!(!needs_low_value_merge(16, 15));
    }

    #[test]
    fn prop_split_evenly_conserves_total() {
        for total in 0..200i64 {
            for shards in 1..12u32 {
                let parts = split_evenly(total, shards);
                assert_eq!(parts.len(), shards as usize);
                assert_eq!(parts.iter().sum::<i64>(), total, "total={total} shards={shards}");
            }
        }
    }

    #[test]
    fn prop_halve_conserves_value() {
        for value in 0..1000i64 {
            let (kept, moved) = halve(value);
            assert_eq!(kept + moved, value);
            assert!(kept >= 0 && moved >= 0);
        }
    }
}
