//! Wrapping arithmetic for sequence and message numbers.
//!
//! Sequence numbers are octet positions modulo 2^32; message numbers live
//! modulo 2^31. Everything here wraps, nothing saturates.

use crate::constants::MAX_MSG_NO;

/// `seq + n` modulo 2^32.
#[inline]
pub fn seq_add(seq: u32, n: u32) -> u32 {
    seq.wrapping_add(n)
}

/// Octets from `from` forward to `to`, modulo 2^32.
#[inline]
pub fn seq_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

/// True when the `size` octets starting at `seq` stay inside the window
/// that starts at `base` and spans `window` octets.
#[inline]
pub fn seq_fits(base: u32, window: u32, seq: u32, size: u32) -> bool {
    let start = seq_distance(base, seq) as u64;
    start + size as u64 <= window as u64
}

/// Next message number, modulo 2^31.
#[inline]
pub fn msgno_next(msgno: u32) -> u32 {
    msgno.wrapping_add(1) & MAX_MSG_NO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_wraps() {
        assert_eq!(seq_add(u32::MAX, 1), 0);
        assert_eq!(seq_add(u32::MAX - 1, 5), 3);
        assert_eq!(seq_distance(u32::MAX - 1, 3), 5);
    }

    #[test]
    fn test_msgno_wraps_at_2_31() {
        assert_eq!(msgno_next(0), 1);
        assert_eq!(msgno_next(MAX_MSG_NO), 0);
    }

    #[test]
    fn test_seq_fits_across_wrap() {
        let base = u32::MAX - 10;
        assert!(seq_fits(base, 4096, base, 4096));
        assert!(!seq_fits(base, 4096, base, 4097));
        assert!(seq_fits(base, 4096, seq_add(base, 100), 3996));
        assert!(!seq_fits(base, 4096, seq_add(base, 100), 3997));
    }
}
