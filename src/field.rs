//! Modular arithmetic for the prime fields the share engine computes in.
//!
//! The engine runs over the Mersenne prime $p = 2^{31} - 1$, chosen so that
//! field elements and their products fit comfortably in `u64` and so that the
//! Fermat exponent used by the zero test stays small. All functions take the
//! modulus explicitly; [MERSENNE_31] is what the protocols pass.
//!
//! Every input is normalized into `[0, p)` before use and every output is
//! normalized likewise.

use crate::error::ProtocolError;
use rand::Rng;

/// The engine's working prime, $2^{31} - 1$.
pub const MERSENNE_31: u64 = (1 << 31) - 1;

/// Number of bits of [MERSENNE_31]. Also the number of bit shares the
/// bootstrap distributes for the comparison mask.
pub const MERSENNE_31_BITS: usize = 31;

/// Normalize `x` into `[0, p)`.
#[inline]
pub fn reduce(x: u64, p: u64) -> u64 {
    if x < p {
        x
    } else {
        x % p
    }
}

/// `(a + b) mod p`.
#[inline]
pub fn add(a: u64, b: u64, p: u64) -> u64 {
    let sum = reduce(a, p) + reduce(b, p);
    if sum >= p {
        sum - p
    } else {
        sum
    }
}

/// `(a - b) mod p`.
#[inline]
pub fn sub(a: u64, b: u64, p: u64) -> u64 {
    add(a, neg(b, p), p)
}

/// `-a mod p`.
#[inline]
pub fn neg(a: u64, p: u64) -> u64 {
    let a = reduce(a, p);
    if a == 0 {
        0
    } else {
        p - a
    }
}

/// `(a * b) mod p`.
///
/// For operands below $2^{31}$ the product fits in 62 bits and a plain
/// widening multiply is exact. Wider operands (primes beyond 31 bits) fall
/// back to double-and-add so no intermediate ever overflows.
pub fn mul(a: u64, b: u64, p: u64) -> u64 {
    let a = reduce(a, p);
    let b = reduce(b, p);
    if a < (1 << 31) && b < (1 << 31) {
        return (a * b) % p;
    }

    let mut acc = 0u64;
    let mut shifted = a;
    let mut rest = b;
    while rest > 0 {
        if rest & 1 == 1 {
            acc = add(acc, shifted, p);
        }
        shifted = add(shifted, shifted, p);
        rest >>= 1;
    }
    acc
}

/// `(base ^ exp) mod p` by square-and-multiply.
pub fn pow(base: u64, mut exp: u64, p: u64) -> u64 {
    let mut base = reduce(base, p);
    let mut acc = 1u64;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul(acc, base, p);
        }
        base = mul(base, base, p);
        exp >>= 1;
    }
    acc
}

/// `a^{-1} mod p` by the extended Euclidean algorithm.
///
/// Fails when no inverse exists, i.e. when `gcd(a, p) != 1` (for a prime
/// modulus, exactly when `a == 0`).
pub fn inverse(a: u64, p: u64) -> Result<u64, ProtocolError> {
    let a = reduce(a, p);
    let mut r = p as i128;
    let mut new_r = a as i128;
    let mut k: i128 = 0;
    let mut new_k: i128 = 1;

    while new_r != 0 {
        let q = r / new_r;
        (k, new_k) = (new_k, k - q * new_k);
        (r, new_r) = (new_r, r - q * new_r);
    }

    if r != 1 {
        return Err(ProtocolError::NoInverse {
            value: a,
            modulus: p,
        });
    }

    if k < 0 {
        k += p as i128;
    }
    Ok(k as u64)
}

/// Draw a uniform element of `[0, p)`.
pub fn random_element<R: Rng + ?Sized>(rng: &mut R, p: u64) -> u64 {
    rng.gen_range(0..p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_add_sub_neg() {
        let p = MERSENNE_31;
        assert_eq!(add(p - 1, 1, p), 0);
        assert_eq!(add(p - 1, 2, p), 1);
        assert_eq!(sub(0, 1, p), p - 1);
        assert_eq!(neg(0, p), 0);
        assert_eq!(neg(5, p), p - 5);
        assert_eq!(add(neg(5, p), 5, p), 0);
    }

    #[test]
    fn test_mul_near_modulus() {
        let p = MERSENNE_31;
        // (p - 1)^2 = p^2 - 2p + 1 = 1 (mod p); the product is 62 bits wide.
        assert_eq!(mul(p - 1, p - 1, p), 1);
        assert_eq!(mul(p - 1, 2, p), p - 2);
        assert_eq!(mul(0, p - 1, p), 0);
    }

    #[test]
    fn test_mul_wide_prime_matches_u128() {
        // A prime above 2^31 forces the double-and-add path.
        let p = 2_305_843_009_213_693_951; // 2^61 - 1
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let a = rng.gen_range(0..p);
            let b = rng.gen_range(0..p);
            let expected = ((a as u128 * b as u128) % p as u128) as u64;
            assert_eq!(mul(a, b, p), expected);
        }
    }

    #[test]
    fn test_pow() {
        let p = MERSENNE_31;
        assert_eq!(pow(2, 31, p), 1); // 2^31 = p + 1
        assert_eq!(pow(5, 0, p), 1);
        assert_eq!(pow(0, 5, p), 0);
    }

    #[test]
    fn test_fermat() {
        let p = MERSENNE_31;
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let x = rng.gen_range(1..p);
            assert_eq!(pow(x, p - 1, p), 1);
        }
        assert_eq!(pow(0, p - 1, p), 0);
    }

    #[test]
    fn test_inverse() {
        let p = MERSENNE_31;
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..100 {
            let x = rng.gen_range(1..p);
            let inv = inverse(x, p).unwrap();
            assert_eq!(mul(x, inv, p), 1);
        }
        assert!(inverse(0, p).is_err());
    }

    #[test]
    fn test_reduce_unnormalized_inputs() {
        let p = MERSENNE_31;
        assert_eq!(add(p + 3, p + 4, p), 7);
        assert_eq!(mul(p + 2, p + 3, p), 6);
    }
}
