// Magic-number division — replace `n / d` by a multiply-high and a shift
//
// Generated kernels index tensors with divisors known only at compile time
// of the kernel, not of this crate. Integer division is slow on the device,
// so the emitter passes a (magic, shift) pair instead and the kernel computes
//
//   magic != 1:  q = umulhi(n, magic) >> shift     (umulhi: high 32 bits)
//   magic == 1:  q = n >> shift                    (d is a power of two)
//
// The pair is exact for every dividend in [0, 2^31), and for every u32
// dividend when d == 3. Constants follow the Granlund-Montgomery search
// (Hacker's Delight, "magicgu").

use std::fmt;

/// Bit position of each power of two under the De Bruijn multiply below.
const DE_BRUIJN_POSITION: [u32; 32] = [
    0, 9, 1, 10, 13, 21, 2, 29, 11, 14, 16, 18, 22, 25, 3, 30, 8, 12, 20, 28, 15, 17, 24, 7, 19,
    27, 23, 6, 26, 5, 4, 31,
];

/// Largest divisor with a valid pair.
pub const MAX_DIVISOR: u64 = 1 << 31;

/// Index of the highest set bit of a non-zero `v`.
fn msb_u32(mut v: u32) -> u32 {
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    DE_BRUIJN_POSITION[(v.wrapping_mul(0x07C4_ACDD) >> 27) as usize]
}

fn msb_u64(v: u64) -> u32 {
    if v > 0xFFFF_FFFF {
        32 + msb_u32((v >> 32) as u32)
    } else {
        msb_u32(v as u32)
    }
}

/// Smallest `(m, p)` with `floor(n * m / 2^p) == n / d` for all `n <= nmax`.
///
/// # Panics
/// When no `p` up to `2 * nbits` works, which only happens for a divisor
/// outside `1..=nmax + 1`.
fn magic_u32(nmax: u64, d: u64) -> (u64, u64) {
    assert!(d > 0 && d <= nmax + 1, "divisor {} out of range for nmax {:#x}", d, nmax);
    let nmax = u128::from(nmax);
    let d = u128::from(d);
    let nc = ((nmax + 1) / d) * d - 1;
    let nbits = u64::from(msb_u64(nmax as u64)) + 1;
    for p in 0..2 * nbits + 1 {
        let pow2 = 1u128 << p;
        let rem = (pow2 - 1) % d;
        if pow2 > nc * (d - 1 - rem) {
            let m = (pow2 + d - 1 - rem) / d;
            return (m as u64, p);
        }
    }
    panic!("no magic number exists for unsigned division by {}", d);
}

/// Magic pair for dividing by `divisor`, in the form the device kernels
/// consume: the shift is relative to the high 32 bits of the product.
///
/// # Panics
/// If `divisor` is 0 or greater than [`MAX_DIVISOR`].
pub fn synthesize_division_magic(divisor: u64) -> (u64, u64) {
    assert!(
        (1..=MAX_DIVISOR).contains(&divisor),
        "divisor {} outside 1..=2^31",
        divisor
    );
    // 3 needs the full u32 range to keep its magic within 32 bits.
    let nmax = if divisor == 3 { 0xFFFF_FFFF } else { 0x7FFF_FFFF };
    let (magic, shift) = magic_u32(nmax, divisor);
    if magic == 1 {
        return (magic, shift);
    }
    if shift < 32 {
        // Pre-shift so the high word already holds the quotient.
        return (magic << (32 - shift), 0);
    }
    (magic, shift - 32)
}

/// A divisor ready for device-side division.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MagicDivisor {
    divisor: u64,
    magic: u64,
    shift: u64,
}

impl MagicDivisor {
    /// # Panics
    /// If `divisor` is 0 or greater than [`MAX_DIVISOR`].
    pub fn new(divisor: u64) -> Self {
        let (magic, shift) = synthesize_division_magic(divisor);
        log::trace!(
            "magic divisor {}: magic {:#x}, shift {}",
            divisor,
            magic,
            shift
        );
        MagicDivisor {
            divisor,
            magic,
            shift,
        }
    }

    pub fn divisor(&self) -> u64 {
        self.divisor
    }

    pub fn magic(&self) -> u64 {
        self.magic
    }

    pub fn shift(&self) -> u64 {
        self.shift
    }

    /// Largest dividend the pair is exact for.
    pub fn max_dividend(&self) -> u32 {
        if self.divisor == 3 {
            u32::MAX
        } else {
            0x7FFF_FFFF
        }
    }

    /// `n / divisor`, computed the way a kernel does it.
    pub fn divide(&self, n: u32) -> u32 {
        if self.magic == 1 {
            return (u64::from(n) >> self.shift) as u32;
        }
        let hi = (u128::from(n) * u128::from(self.magic)) >> 32;
        (hi >> self.shift) as u32
    }
}

impl fmt::Display for MagicDivisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{} = umulhi(n, {:#x}) >> {}",
            self.divisor, self.magic, self.shift
        )
    }
}
