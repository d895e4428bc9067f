macro_rules! has_bits {
    ($a:expr, $b:expr) => ($a & $b == $b)
}
pub(crate) use has_bits;

#[inline(always)]
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value
    }
    if align.is_power_of_two() {
        (value + align - 1) & !(align - 1)
    } else {
        value.div_ceil(align) * align
    }
}

#[inline(always)]
pub(crate) fn align_down(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value
    }
    value - value % align
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn align_handles_power_of_two_and_odd() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(10, 12), 12);
        assert_eq!(align_up(7, 0), 7);
        assert_eq!(align_down(300, 256), 256);
        assert_eq!(align_down(25, 12), 24);
    }
}
