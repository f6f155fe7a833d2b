// Magic division tests — the multiply/shift pair against hardware division
//
// Small divisors are checked over every dividend below a bound plus the
// top of the range; large divisors and dividends are sampled.

use proptest::prelude::*;
use shrew_cuda::{synthesize_division_magic, MagicDivisor, MAX_DIVISOR};

const NMAX: u32 = 0x7FFF_FFFF;

fn check(d: u64, n: u32) {
    let m = MagicDivisor::new(d);
    assert_eq!(u64::from(m.divide(n)), u64::from(n) / d, "{} / {} via {}", n, d, m);
}

#[test]
fn test_small_divisors_exhaustive() {
    for d in 1..=64u64 {
        for n in 0..=4096u32 {
            check(d, n);
        }
        for n in (NMAX - 4096)..=NMAX {
            check(d, n);
        }
    }
}

#[test]
fn test_divisor_three_special_case() {
    let (magic, shift) = synthesize_division_magic(3);
    assert_eq!((magic, shift), (0xAAAA_AAAB, 1));
    for n in (u32::MAX - 4096)..=u32::MAX {
        check(3, n);
    }
}

#[test]
fn test_magic_fits_32_bits() {
    for d in (1..=10_000u64).chain([MAX_DIVISOR - 1, 715_827_883, 1_000_000_007]) {
        let (magic, _) = synthesize_division_magic(d);
        assert!(magic <= u64::from(u32::MAX), "magic {:#x} for {}", magic, d);
    }
}

#[test]
fn test_largest_divisor() {
    let m = MagicDivisor::new(MAX_DIVISOR);
    assert_eq!((m.magic(), m.shift()), (1, 31));
    check(MAX_DIVISOR, NMAX);
    check(MAX_DIVISOR - 1, NMAX);
}

proptest! {
    #[test]
    fn prop_division_matches(d in 1u64..=MAX_DIVISOR, n in 0u32..=NMAX) {
        let m = MagicDivisor::new(d);
        prop_assert_eq!(u64::from(m.divide(n)), u64::from(n) / d);
    }

    #[test]
    fn prop_division_near_multiples(d in 2u64..=65_536, k in 0u64..32_768) {
        let m = MagicDivisor::new(d);
        let base = k * d;
        for n in [base.saturating_sub(1), base, base + 1] {
            if n <= u64::from(NMAX) {
                prop_assert_eq!(u64::from(m.divide(n as u32)), n / d);
            }
        }
    }
}
