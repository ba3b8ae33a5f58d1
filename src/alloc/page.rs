//! Page and word alignment helpers.

/// Granularity of arena mappings.
pub const PAGE_SIZE: usize = 4096;

/// Alignment of every object carved out of a persistent pool.
pub const WORD_SIZE: usize = 8;

/// Rounds `value` up to the next multiple of `align`, which must be a power
/// of two. An `align` of zero leaves `value` unchanged.
pub const fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        value
    } else {
        (value + (align - 1)) & !(align - 1)
    }
}

/// `u64` flavour of [`align_up`] for file offsets. Returns `None` on overflow.
pub const fn align_up_u64(value: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return Some(value);
    }
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_word() {
        let alignments = [(1..9, 8), (9..17, 16), (17..25, 24)];
        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align_up(size, WORD_SIZE));
            }
        }
        assert_eq!(0, align_up(0, WORD_SIZE));
    }

    #[test]
    fn align_to_page() {
        assert_eq!(PAGE_SIZE, align_up(1, PAGE_SIZE));
        assert_eq!(2 * PAGE_SIZE, align_up(PAGE_SIZE + 1, PAGE_SIZE));
        assert_eq!(Some(4096), align_up_u64(4000, 4096));
        assert_eq!(None, align_up_u64(u64::MAX, 8));
    }
}
