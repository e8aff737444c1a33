//! Paillier cryptosystem for the PMAXSUM variant.
//!
//! Additively homomorphic: the product of two ciphertexts decrypts to the
//! sum of the plaintexts. Every operation takes the key whose modulus it
//! must use — a ciphertext is only meaningful under the `n^2` of the key
//! that produced it, and mixing moduli silently corrupts sums. Accumulators
//! must start from an encryption of 0, never from the literal 1 (which is a
//! valid ciphertext of an unknown plaintext, not of 0).
//!
//! The process-wide [KeyManager] maps agent-scoped key names to keypairs so
//! function nodes can look up the key a ciphertext was created under;
//! agents only ever insert their own entries.

use crate::error::ProtocolError;
use crate::runtime::AgentId;
use num_bigint::{BigInt, BigUint, RandBigInt};
use num_traits::{One, ToPrimitive, Zero};
use rand::Rng;
use std::collections::HashMap;

/// Public half of a Paillier keypair.
#[derive(Clone, Debug)]
pub struct PaillierPublicKey {
    /// The modulus `n = p * q`.
    pub n: BigUint,
    /// `n^2`, the ciphertext modulus.
    pub n_squared: BigUint,
}

/// A Paillier keypair with `g = n + 1`.
#[derive(Clone, Debug)]
pub struct PaillierKeyPair {
    /// The public key.
    pub public: PaillierPublicKey,
    lambda: BigUint,
    mu: BigUint,
}

/// Generate a keypair with an `n` of roughly `bits` bits.
pub fn generate_keypair<R: Rng + ?Sized>(
    bits: u64,
    rng: &mut R,
) -> Result<PaillierKeyPair, ProtocolError> {
    if bits < 16 {
        return Err(ProtocolError::Config(format!(
            "paillier modulus of {bits} bits is too small"
        )));
    }
    let p = generate_prime(bits / 2, rng);
    let q = loop {
        let q = generate_prime(bits / 2, rng);
        if q != p {
            break q;
        }
    };

    let n = &p * &q;
    let n_squared = &n * &n;
    let one = BigUint::one();
    let lambda = lcm(&(&p - &one), &(&q - &one));
    // with g = n + 1, L(g^lambda mod n^2) = lambda mod n
    let mu = mod_inverse(&(&lambda % &n), &n).ok_or_else(|| {
        ProtocolError::Config("degenerate paillier modulus, lambda not invertible".into())
    })?;

    Ok(PaillierKeyPair {
        public: PaillierPublicKey { n, n_squared },
        lambda,
        mu,
    })
}

/// Encrypt `m` under `pk`.
pub fn encrypt<R: Rng + ?Sized>(pk: &PaillierPublicKey, m: &BigUint, rng: &mut R) -> BigUint {
    let r = loop {
        let r = rng.gen_biguint_below(&pk.n);
        if !r.is_zero() && gcd(&r, &pk.n).is_one() {
            break r;
        }
    };
    // g^m = (1 + n)^m = 1 + m*n (mod n^2)
    let gm = (BigUint::one() + m * &pk.n) % &pk.n_squared;
    gm * r.modpow(&pk.n, &pk.n_squared) % &pk.n_squared
}

/// Encrypt a `u64` plaintext.
pub fn encrypt_u64<R: Rng + ?Sized>(pk: &PaillierPublicKey, m: u64, rng: &mut R) -> BigUint {
    encrypt(pk, &BigUint::from(m), rng)
}

/// A fresh encryption of 0: the correct homomorphic-accumulator seed.
pub fn encrypt_zero<R: Rng + ?Sized>(pk: &PaillierPublicKey, rng: &mut R) -> BigUint {
    encrypt(pk, &BigUint::zero(), rng)
}

/// Decrypt `c` with `kp`. The ciphertext must have been created under this
/// key; `n^2` of any other key yields garbage.
pub fn decrypt(kp: &PaillierKeyPair, c: &BigUint) -> BigUint {
    let u = c.modpow(&kp.lambda, &kp.public.n_squared);
    let l = (&u - BigUint::one()) / &kp.public.n;
    l * &kp.mu % &kp.public.n
}

/// Decrypt to a `u64`, failing when the plaintext does not fit.
pub fn decrypt_u64(kp: &PaillierKeyPair, c: &BigUint) -> Result<u64, ProtocolError> {
    decrypt(kp, c).to_u64().ok_or_else(|| {
        ProtocolError::Reconstruction("paillier plaintext exceeds 64 bits".into())
    })
}

/// Homomorphic addition: multiply ciphertexts modulo the `n^2` of the key
/// both were created under.
pub fn homomorphic_add(pk: &PaillierPublicKey, c1: &BigUint, c2: &BigUint) -> BigUint {
    c1 * c2 % &pk.n_squared
}

/// Name of agent `a`'s E-key in the [KeyManager].
pub fn e_key_name(agent: AgentId) -> String {
    format!("E-{agent}")
}

/// Name of agent `a`'s F-key in the [KeyManager].
pub fn f_key_name(agent: AgentId) -> String {
    format!("F-{agent}")
}

/// Process-wide keypair registry, indexed by agent-scoped key names.
#[derive(Default)]
pub struct KeyManager {
    keys: HashMap<String, PaillierKeyPair>,
}

impl KeyManager {
    /// Register a keypair. Agents only insert their own entries.
    pub fn insert(&mut self, name: &str, keypair: PaillierKeyPair) {
        self.keys.insert(name.to_string(), keypair);
    }

    /// Public key registered under `name`.
    pub fn public(&self, name: &str) -> Result<PaillierPublicKey, ProtocolError> {
        self.keys
            .get(name)
            .map(|kp| kp.public.clone())
            .ok_or_else(|| ProtocolError::Config(format!("no paillier key named '{name}'")))
    }

    /// Full keypair registered under `name` (decryption).
    pub fn keypair(&self, name: &str) -> Result<&PaillierKeyPair, ProtocolError> {
        self.keys
            .get(name)
            .ok_or_else(|| ProtocolError::Config(format!("no paillier key named '{name}'")))
    }
}

fn gcd(a: &BigUint, b: &BigUint) -> BigUint {
    let mut a = a.clone();
    let mut b = b.clone();
    while !b.is_zero() {
        let r = &a % &b;
        a = b;
        b = r;
    }
    a
}

fn lcm(a: &BigUint, b: &BigUint) -> BigUint {
    a / gcd(a, b) * b
}

fn mod_inverse(a: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    let a = BigInt::from(a.clone());
    let m = BigInt::from(modulus.clone());
    let (mut r, mut new_r) = (m.clone(), a);
    let (mut t, mut new_t) = (BigInt::zero(), BigInt::one());
    while !new_r.is_zero() {
        let q = &r / &new_r;
        (t, new_t) = (new_t.clone(), t - &q * new_t);
        (r, new_r) = (new_r.clone(), r - q * new_r);
    }
    if !r.is_one() {
        return None;
    }
    if t < BigInt::zero() {
        t += m;
    }
    t.to_biguint()
}

/// Draw a random prime of exactly `bits` bits.
fn generate_prime<R: Rng + ?Sized>(bits: u64, rng: &mut R) -> BigUint {
    loop {
        let mut candidate = rng.gen_biguint(bits);
        candidate.set_bit(bits - 1, true);
        candidate.set_bit(0, true);
        if is_probable_prime(&candidate, 25, rng) {
            return candidate;
        }
    }
}

const SMALL_PRIMES: [u32; 12] = [3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41];

/// Miller–Rabin with `rounds` random bases.
fn is_probable_prime<R: Rng + ?Sized>(n: &BigUint, rounds: usize, rng: &mut R) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u32);
    if n < &two {
        return false;
    }
    if n == &two {
        return true;
    }
    if !n.bit(0) {
        return false;
    }
    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if n == &p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }

    // n - 1 = 2^s * d
    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 0..s.saturating_sub(1) {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_roundtrip() {
        let mut rng = StdRng::seed_from_u64(1);
        let kp = generate_keypair(128, &mut rng).unwrap();
        for m in [0u64, 1, 42, 1_000_000, u32::MAX as u64] {
            let c = encrypt_u64(&kp.public, m, &mut rng);
            assert_eq!(decrypt_u64(&kp, &c).unwrap(), m);
        }
    }

    #[test]
    fn test_homomorphic_add() {
        let mut rng = StdRng::seed_from_u64(2);
        let kp = generate_keypair(128, &mut rng).unwrap();
        let c1 = encrypt_u64(&kp.public, 1234, &mut rng);
        let c2 = encrypt_u64(&kp.public, 5678, &mut rng);
        let sum = homomorphic_add(&kp.public, &c1, &c2);
        assert_eq!(decrypt_u64(&kp, &sum).unwrap(), 6912);
    }

    #[test]
    fn test_zero_seed_is_not_the_integer_one() {
        // seeding an accumulator with the literal 1 decrypts to garbage;
        // the proper seed is a fresh encryption of 0
        let mut rng = StdRng::seed_from_u64(3);
        let kp = generate_keypair(128, &mut rng).unwrap();

        let proper = encrypt_zero(&kp.public, &mut rng);
        let c = encrypt_u64(&kp.public, 999, &mut rng);
        let acc = homomorphic_add(&kp.public, &proper, &c);
        assert_eq!(decrypt_u64(&kp, &acc).unwrap(), 999);
        assert_ne!(proper, BigUint::one());
    }

    #[test]
    fn test_accumulating_many() {
        let mut rng = StdRng::seed_from_u64(4);
        let kp = generate_keypair(128, &mut rng).unwrap();
        let mut acc = encrypt_zero(&kp.public, &mut rng);
        let mut expected = 0u64;
        for m in [5u64, 17, 0, 400, 123_456] {
            acc = homomorphic_add(&kp.public, &acc, &encrypt_u64(&kp.public, m, &mut rng));
            expected += m;
        }
        assert_eq!(decrypt_u64(&kp, &acc).unwrap(), expected);
    }

    #[test]
    fn test_key_manager() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut km = KeyManager::default();
        km.insert(&e_key_name(3), generate_keypair(128, &mut rng).unwrap());
        assert!(km.public(&e_key_name(3)).is_ok());
        assert!(km.keypair(&e_key_name(3)).is_ok());
        assert!(km.public(&f_key_name(3)).is_err());
    }

    #[test]
    fn test_prime_generation() {
        let mut rng = StdRng::seed_from_u64(6);
        let p = generate_prime(64, &mut rng);
        assert_eq!(p.bits(), 64);
        assert!(is_probable_prime(&p, 25, &mut rng));
        assert!(!is_probable_prime(&(p * 2u32), 25, &mut rng));
    }
}
