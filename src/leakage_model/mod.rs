use num_traits::PrimInt;

/// Hamming weight of `value`.
pub fn hw<T: PrimInt>(value: T) -> u32 {
    value.count_ones()
}

/// Unsigned fixed-width register arithmetic.
///
/// Values are carried in `u64` and reduced modulo `2^bits` after every operation, so a 32-bit
/// accumulator wraps exactly like the target's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    mask: u64,
}

impl Register {
    /// # Panics
    /// Panic in debug if `bits` is not in `1..=64`.
    pub fn new(bits: u32) -> Self {
        debug_assert!((1..=64).contains(&bits));

        let mask = if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };

        Self { mask }
    }

    pub fn wrap(&self, value: u64) -> u64 {
        value & self.mask
    }

    pub fn mul(&self, a: u64, b: u64) -> u64 {
        self.wrap(a.wrapping_mul(b))
    }

    /// Multiply-accumulate: `acc + a * b` in register width.
    pub fn mac(&self, acc: u64, a: u64, b: u64) -> u64 {
        self.wrap(acc.wrapping_add(a.wrapping_mul(b)))
    }
}

#[cfg(test)]
mod tests {
    use super::{Register, hw};

    #[test]
    fn test_hw() {
        assert_eq!(hw(0u32), 0);
        assert_eq!(hw(36u32), 2);
        assert_eq!(hw(0xffu8), 8);
        assert_eq!(hw(u64::MAX), 64);
    }

    #[test]
    fn test_register_wraps() {
        let register = Register::new(8);
        assert_eq!(register.wrap(0x1ff), 0xff);
        assert_eq!(register.mac(250, 2, 3), 0);

        let register = Register::new(32);
        assert_eq!(register.mac(u32::MAX as u64, 1, 1), 0);
        assert_eq!(register.mul(1 << 20, 1 << 12), 0);

        let register = Register::new(64);
        assert_eq!(register.mac(u64::MAX, 1, 1), 0);
    }
}
