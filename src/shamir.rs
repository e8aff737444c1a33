//! Shamir share generation and reconstruction.
//!
//! A secret `s` is hidden as the constant term of a random polynomial
//! `P(x) = s + a_1 x + ... + a_{t-1} x^{t-1}` with coefficients uniform in
//! `[0, p)`. The share for index `k` is `P(k)`; any `t` distinct shares
//! recover `s` by Lagrange interpolation at `x = 0`, and fewer than `t`
//! reveal nothing.

use crate::error::ProtocolError;
use crate::field;
use crate::share::Share;
use rand::Rng;

/// Generate one share per entry of `indices` for `secret`, reconstructible
/// from any `threshold` of them.
///
/// Indices must be distinct and `>= 1`. The polynomial is evaluated with
/// Horner's method.
pub fn generate_shares<R: Rng + ?Sized>(
    secret: u64,
    indices: &[u64],
    threshold: usize,
    prime: u64,
    rng: &mut R,
) -> Result<Vec<Share>, ProtocolError> {
    if threshold == 0 {
        return Err(ProtocolError::Config(
            "share threshold must be at least 1".into(),
        ));
    }
    if indices.is_empty() {
        return Err(ProtocolError::Config(
            "cannot generate shares for zero participants".into(),
        ));
    }

    let secret = field::reduce(secret, prime);
    // coefficients[i] is the coefficient of x^{i+1}
    let coefficients: Vec<u64> = (0..threshold - 1)
        .map(|_| field::random_element(rng, prime))
        .collect();

    let shares = indices
        .iter()
        .map(|&x| {
            debug_assert!(x >= 1);
            let mut value = 0u64;
            for &c in coefficients.iter().rev() {
                value = field::mul(field::add(value, c, prime), x, prime);
            }
            value = field::add(value, secret, prime);
            Share::new(x, value, secret)
        })
        .collect();

    Ok(shares)
}

/// Recover the secret from `shares` by Lagrange interpolation at `x = 0`.
///
/// The caller must supply at least as many shares as the generation
/// threshold (the engine always hands over every participant's share, which
/// also covers the degree-doubled products that multiplication reconstructs).
/// Duplicate indices make a basis denominator vanish and fail the inversion.
pub fn reconstruct(shares: &[Share], prime: u64) -> Result<u64, ProtocolError> {
    if shares.is_empty() {
        return Err(ProtocolError::Reconstruction(
            "no shares supplied".into(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for s in shares {
        if !seen.insert(s.index) {
            return Err(ProtocolError::Reconstruction(format!(
                "duplicate share index {}",
                s.index
            )));
        }
    }

    let mut secret = 0u64;
    for (i, si) in shares.iter().enumerate() {
        // L_i(0) = prod_{j != i} x_j / (x_j - x_i)
        let mut num = 1u64;
        let mut den = 1u64;
        for (j, sj) in shares.iter().enumerate() {
            if i == j {
                continue;
            }
            num = field::mul(num, sj.index, prime);
            den = field::mul(den, field::sub(sj.index, si.index, prime), prime);
        }
        let basis = field::mul(num, field::inverse(den, prime)?, prime);
        secret = field::add(secret, field::mul(si.value, basis, prime), prime);
    }

    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::MERSENNE_31;
    use itertools::Itertools;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_three_of_five_every_subset() {
        // 3-of-5 over p = 15485863, secret 12345: any 3 of the 5 shares
        // recover the secret exactly.
        let p = 15_485_863;
        let mut rng = StdRng::seed_from_u64(42);
        let indices: Vec<u64> = (1..=5).collect();
        let shares = generate_shares(12_345, &indices, 3, p, &mut rng).unwrap();

        for subset in shares.iter().copied().combinations(3) {
            assert_eq!(reconstruct(&subset, p).unwrap(), 12_345);
        }
    }

    #[test]
    fn test_roundtrip_random_secrets() {
        let p = MERSENNE_31;
        let mut rng = StdRng::seed_from_u64(1);
        let indices: Vec<u64> = (1..=7).collect();
        for _ in 0..50 {
            let secret = rng.gen_range(0..p);
            let t = rng.gen_range(1..=7);
            let shares = generate_shares(secret, &indices, t, p, &mut rng).unwrap();
            // any t distinct shares suffice
            for subset in shares.iter().copied().combinations(t).take(5) {
                assert_eq!(reconstruct(&subset, p).unwrap(), secret);
            }
        }
    }

    #[test]
    fn test_share_arithmetic_soundness() {
        let p = MERSENNE_31;
        let mut rng = StdRng::seed_from_u64(3);
        let indices: Vec<u64> = (1..=5).collect();
        let a = 1_000_000u64;
        let b = 123_456u64;
        let sa = generate_shares(a, &indices, 2, p, &mut rng).unwrap();
        let sb = generate_shares(b, &indices, 2, p, &mut rng).unwrap();

        let sums: Vec<_> = sa
            .iter()
            .zip(sb.iter())
            .map(|(x, y)| x.add(y, p))
            .collect();
        assert_eq!(reconstruct(&sums, p).unwrap(), a + b);

        let diffs: Vec<_> = sa
            .iter()
            .zip(sb.iter())
            .map(|(x, y)| x.sub(y, p))
            .collect();
        assert_eq!(reconstruct(&diffs, p).unwrap(), a - b);

        let scaled: Vec<_> = sa.iter().map(|x| x.scalar_mul(3, p)).collect();
        assert_eq!(reconstruct(&scaled, p).unwrap(), 3 * a);

        let inverted: Vec<_> = sa.iter().map(|x| x.one_minus(p)).collect();
        assert_eq!(
            reconstruct(&inverted, p).unwrap(),
            crate::field::sub(1, a, p)
        );
    }

    #[test]
    fn test_degree_doubled_product_reconstructs() {
        // Multiplying shares pointwise doubles the polynomial degree; with
        // all participants' shares the product still interpolates exactly.
        let p = MERSENNE_31;
        let mut rng = StdRng::seed_from_u64(4);
        let indices: Vec<u64> = (1..=5).collect();
        let sa = generate_shares(7, &indices, 2, p, &mut rng).unwrap();
        let sb = generate_shares(11, &indices, 2, p, &mut rng).unwrap();
        let products: Vec<_> = sa
            .iter()
            .zip(sb.iter())
            .map(|(x, y)| Share::new(x.index, crate::field::mul(x.value, y.value, p), 77))
            .collect();
        assert_eq!(reconstruct(&products, p).unwrap(), 77);
    }

    #[test]
    fn test_reconstruct_errors() {
        let p = MERSENNE_31;
        assert!(reconstruct(&[], p).is_err());
        let dup = [Share::new(1, 5, 0), Share::new(1, 9, 0)];
        assert!(reconstruct(&dup, p).is_err());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let p = MERSENNE_31;
        let mut rng = StdRng::seed_from_u64(5);
        assert!(generate_shares(1, &[1, 2], 0, p, &mut rng).is_err());
        assert!(generate_shares(1, &[], 1, p, &mut rng).is_err());
    }
}
