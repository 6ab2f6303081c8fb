//! Leverage common functionality across DPoR primitives.

mod array;
pub use array::{Error as ArrayError, FixedBytes};

/// Lowercase hexadecimal encoding of `bytes` (no prefix).
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Largest `f` such that a committee of `n` validators satisfies `n >= 3f + 1`.
///
/// Returns `None` if `n` cannot tolerate a single fault.
pub fn max_faults(n: u32) -> Option<u32> {
    match n.saturating_sub(1) / 3 {
        0 => None,
        f => Some(f),
    }
}

/// Number of matching signatures (`2f + 1`) required when tolerating `f` faults.
///
/// Returns `None` if the result does not fit in a `u32`.
pub fn quorum_of(f: u32) -> Option<u32> {
    f.checked_mul(2)?.checked_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[]), "");
        assert_eq!(hex(&[0x00, 0x0a, 0xff]), "000aff");
    }

    #[test]
    fn test_max_faults() {
        assert_eq!(max_faults(0), None);
        assert_eq!(max_faults(3), None);
        assert_eq!(max_faults(4), Some(1));
        assert_eq!(max_faults(6), Some(1));
        assert_eq!(max_faults(7), Some(2));
        assert_eq!(max_faults(u32::MAX), Some(1_431_655_764));
    }

    #[test]
    fn test_quorum_of() {
        assert_eq!(quorum_of(0), Some(1));
        assert_eq!(quorum_of(1), Some(3));
        assert_eq!(quorum_of(u32::MAX / 2), Some(u32::MAX));
        assert_eq!(quorum_of(u32::MAX / 2 + 1), None);
    }

    #[test]
    fn test_quorum_fits_committee() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..1_000 {
            let n = rng.gen_range(4..10_000);
            let f = max_faults(n).unwrap();
            let q = quorum_of(f).unwrap();
            assert!(3 * f < n);
            assert!(q <= n);
        }
    }
}
