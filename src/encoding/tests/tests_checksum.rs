#[cfg(test)]
mod tests {
    use crate::encoding::rolling_sum;

    #[test]
    fn test_empty_input_is_seed() {
        assert_eq!(rolling_sum(&[], [0, 0]), [0, 0]);
        assert_eq!(rolling_sum(&[], [7, 11]), [7, 11]);
    }

    #[test]
    fn test_deterministic() {
        let data = b"the quick brown fox jumps over the lazy dog";
        assert_eq!(rolling_sum(data, [0, 0]), rolling_sum(data, [0, 0]));
    }

    #[test]
    fn test_sensitive_to_any_byte() {
        let base = vec![0xABu8; 64];
        let reference = rolling_sum(&base, [0, 0]);
        for i in 0..base.len() {
            let mut flipped = base.clone();
            flipped[i] ^= 0x01;
            assert_ne!(rolling_sum(&flipped, [0, 0]), reference, "byte {i}");
        }
    }

    #[test]
    fn test_seed_chaining_differs_from_concatenation_seeded_wrong() {
        let a = b"first-frame-payload";
        let b = b"second-frame-payload";
        let chained = rolling_sum(b, rolling_sum(a, [0, 0]));
        let unchained = rolling_sum(b, [0, 0]);
        assert_ne!(chained, unchained);
    }

    #[test]
    fn test_tail_padding_differs_from_explicit_zeros() {
        // "ab" is padded with six zero bytes internally; the sum must
        // still distinguish it from longer inputs that share a prefix.
        let short = rolling_sum(b"ab", [0, 0]);
        let longer = rolling_sum(b"ab\0\0\0\0\0\0\0", [0, 0]);
        assert_ne!(short, longer);
    }
}
