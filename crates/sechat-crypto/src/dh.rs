//! Diffie-Hellman exchange over a 2048-bit safe prime.
//!
//! Both the initial chat handshake and every forward-secrecy rekey run the same
//! exchange:
//!
//! 1. Validate the group: `p` is a 2048-bit safe prime (`p` and `(p-1)/2` prime)
//!    and `g` in `2..=7` generates the subgroup of order `(p-1)/2`.
//! 2. Pick a random 2048-bit exponent `a` and publish `g_a = g^a mod p`.
//! 3. Check the peer's value lies strictly between `2^(2048-64)` and `p - 2^(2048-64)`.
//! 4. The shared key is `g_b^a mod p`, left-padded to 256 bytes.
//!
//! Prime validation is expensive, so verdicts are remembered in a [`PrimeCache`]
//! shared by every chat of the process.

use crate::auth_key::{AuthKey, AUTH_KEY_SIZE};
use crate::{Error, Result};
use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, ToPrimitive, Zero};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashSet;
use std::sync::Mutex;
use zeroize::Zeroizing;

/// Required size of the prime in bits.
pub const DH_PRIME_BITS: u64 = 2048;

/// Required size of the prime in bytes.
pub const DH_PRIME_SIZE: usize = 256;

/// Public values must stay this many bits away from both ends of the group.
pub const DH_PUBLIC_MARGIN_BITS: u64 = 64;

/// Witnesses tried per Miller-Rabin test.
const MILLER_RABIN_ROUNDS: usize = 12;

/// Attempts at drawing a private exponent with an in-range public value.
const MAX_KEYGEN_ATTEMPTS: usize = 16;

const SMALL_PRIMES: [u32; 25] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

/// RFC 3526 group 14 prime.
const MODP_2048_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// Group parameters handed out by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DhConfig {
    /// Server-side version of the parameters.
    pub version: i32,
    /// Generator.
    pub g: i32,
    /// Big-endian prime.
    pub prime: Vec<u8>,
}

impl DhConfig {
    /// Creates a config from raw parameters.
    pub fn new(version: i32, g: i32, prime: Vec<u8>) -> Self {
        Self { version, g, prime }
    }

    /// The RFC 3526 2048-bit MODP group with generator 2.
    pub fn modp_2048() -> Self {
        let prime = BigUint::parse_bytes(MODP_2048_PRIME.as_bytes(), 16)
            .map(|p| p.to_bytes_be())
            .unwrap_or_default();
        Self::new(1, 2, prime)
    }

    /// Whether no parameters are known yet.
    pub fn is_empty(&self) -> bool {
        self.prime.is_empty()
    }
}

/// Process-wide memory of validated primes.
#[derive(Debug, Default)]
pub struct PrimeCache {
    good: Mutex<HashSet<Vec<u8>>>,
    bad: Mutex<HashSet<Vec<u8>>>,
}

impl PrimeCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Previous verdict for `prime`, if any.
    pub fn is_good_prime(&self, prime: &[u8]) -> Option<bool> {
        if let Ok(good) = self.good.lock() {
            if good.contains(prime) {
                return Some(true);
            }
        }
        if let Ok(bad) = self.bad.lock() {
            if bad.contains(prime) {
                return Some(false);
            }
        }
        None
    }

    /// Marks `prime` as a verified safe prime.
    pub fn add_good_prime(&self, prime: &[u8]) {
        if let Ok(mut good) = self.good.lock() {
            good.insert(prime.to_vec());
        }
    }

    /// Marks `prime` as rejected.
    pub fn add_bad_prime(&self, prime: &[u8]) {
        if let Ok(mut bad) = self.bad.lock() {
            bad.insert(prime.to_vec());
        }
    }
}

/// Validates group parameters.
///
/// # Errors
/// Returns `Error::InvalidDhConfig` if the prime is not exactly 2048 bits, the
/// generator is outside `2..=7` or does not match the prime's residue class, or
/// the prime is not a safe prime.
pub fn check_config(g: i32, prime: &[u8], cache: &PrimeCache) -> Result<()> {
    if prime.len() != DH_PRIME_SIZE || prime[0] & 0x80 == 0 {
        return Err(Error::InvalidDhConfig("prime is not 2048 bits".into()));
    }
    let p = BigUint::from_bytes_be(prime);
    check_generator(g, &p)?;

    match cache.is_good_prime(prime) {
        Some(true) => return Ok(()),
        Some(false) => return Err(Error::InvalidDhConfig("prime is not a safe prime".into())),
        None => {}
    }

    let q = (&p - BigUint::one()) >> 1usize;
    if is_probable_prime(&p) && is_probable_prime(&q) {
        cache.add_good_prime(prime);
        Ok(())
    } else {
        cache.add_bad_prime(prime);
        Err(Error::InvalidDhConfig("prime is not a safe prime".into()))
    }
}

fn check_generator(g: i32, p: &BigUint) -> Result<()> {
    let generates_subgroup = match g {
        2 => mod_small(p, 8) == 7,
        3 => mod_small(p, 3) == 2,
        4 => true,
        5 => matches!(mod_small(p, 5), 1 | 4),
        6 => matches!(mod_small(p, 24), 19 | 23),
        7 => matches!(mod_small(p, 7), 3 | 5 | 6),
        _ => {
            return Err(Error::InvalidDhConfig(format!("unsupported generator {}", g)));
        }
    };
    if !generates_subgroup {
        return Err(Error::InvalidDhConfig(format!(
            "generator {} does not match the prime",
            g
        )));
    }
    Ok(())
}

fn mod_small(n: &BigUint, m: u32) -> u32 {
    (n % BigUint::from(m)).to_u32().unwrap_or(0)
}

fn is_probable_prime(n: &BigUint) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u32);
    if n < &two {
        return false;
    }
    for &small in SMALL_PRIMES.iter() {
        let small = BigUint::from(small);
        if n == &small {
            return true;
        }
        if (n % &small).is_zero() {
            return false;
        }
    }

    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    let mut rng = OsRng;
    'witness: for _ in 0..MILLER_RABIN_ROUNDS {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = (&x * &x) % n;
            if x == n_minus_one {
                continue 'witness;
            }
            if x == one {
                return false;
            }
        }
        return false;
    }
    true
}

/// Checks a public value against the group bounds.
///
/// The value must lie strictly between `2^(2048-64)` and `prime - 2^(2048-64)`.
pub fn check_public_value(value: &[u8], prime: &[u8]) -> Result<()> {
    let x = BigUint::from_bytes_be(value);
    let p = BigUint::from_bytes_be(prime);
    let margin = BigUint::one() << (DH_PRIME_BITS - DH_PUBLIC_MARGIN_BITS);

    if p <= (&margin << 1usize) {
        return Err(Error::InvalidDhConfig("prime is too small".into()));
    }
    if x <= margin {
        return Err(Error::InvalidPublicValue("value is too small".into()));
    }
    if x >= &p - &margin {
        return Err(Error::InvalidPublicValue("value is too large".into()));
    }
    Ok(())
}

/// Computes `peer_public^private mod prime`, padded to 256 bytes.
///
/// # Errors
/// Returns `Error::InvalidPublicValue` if the peer value is out of range.
pub fn compute_shared_secret(
    private: &[u8],
    peer_public: &[u8],
    prime: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    check_public_value(peer_public, prime)?;

    let p = BigUint::from_bytes_be(prime);
    let a = BigUint::from_bytes_be(private);
    let shared = BigUint::from_bytes_be(peer_public).modpow(&a, &p);

    Ok(Zeroizing::new(left_pad(shared.to_bytes_be())))
}

fn left_pad(bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() >= AUTH_KEY_SIZE {
        return bytes;
    }
    let mut padded = vec![0u8; AUTH_KEY_SIZE - bytes.len()];
    padded.extend_from_slice(&bytes);
    padded
}

/// Serializable image of a [`DhExchange`].
#[derive(Clone)]
pub struct DhSnapshot {
    /// Generator.
    pub g: i32,
    /// Big-endian prime.
    pub prime: Vec<u8>,
    /// Private exponent.
    pub private: Zeroizing<Vec<u8>>,
    /// Our public value `g^a mod p`.
    pub own_public: Vec<u8>,
    /// The peer's public value, empty until received.
    pub peer_public: Vec<u8>,
}

/// One side of a Diffie-Hellman exchange.
#[derive(Clone)]
pub struct DhExchange {
    g: i32,
    prime: Vec<u8>,
    private: Zeroizing<Vec<u8>>,
    own_public: Vec<u8>,
    peer_public: Vec<u8>,
}

impl DhExchange {
    /// Creates an exchange without parameters.
    pub fn new() -> Self {
        Self {
            g: 0,
            prime: Vec::new(),
            private: Zeroizing::new(Vec::new()),
            own_public: Vec::new(),
            peer_public: Vec::new(),
        }
    }

    /// Sets the group and draws a fresh private exponent.
    ///
    /// # Errors
    /// Returns `Error::KeyExchange` if no in-range public value could be drawn.
    pub fn set_config(&mut self, config: &DhConfig) -> Result<()> {
        let g = u32::try_from(config.g)
            .map_err(|_| Error::InvalidDhConfig(format!("invalid generator {}", config.g)))?;
        let p = BigUint::from_bytes_be(&config.prime);
        let g = BigUint::from(g);

        for _ in 0..MAX_KEYGEN_ATTEMPTS {
            let mut private = Zeroizing::new(vec![0u8; DH_PRIME_SIZE]);
            OsRng.fill_bytes(&mut private);

            let public = left_pad(g.modpow(&BigUint::from_bytes_be(&private), &p).to_bytes_be());
            if check_public_value(&public, &config.prime).is_ok() {
                self.g = config.g;
                self.prime = config.prime.clone();
                self.private = private;
                self.own_public = public;
                return Ok(());
            }
        }
        Err(Error::KeyExchange(
            "failed to draw an exponent with an in-range public value".into(),
        ))
    }

    /// Whether group parameters are set.
    pub fn has_config(&self) -> bool {
        !self.prime.is_empty()
    }

    /// Records the peer's public value.
    pub fn set_peer_public(&mut self, value: &[u8]) {
        self.peer_public = value.to_vec();
    }

    /// Whether the peer's public value is known.
    pub fn has_peer_public(&self) -> bool {
        !self.peer_public.is_empty()
    }

    /// Our public value (256 bytes, big-endian).
    pub fn own_public(&self) -> &[u8] {
        &self.own_public
    }

    /// The peer's public value.
    pub fn peer_public(&self) -> &[u8] {
        &self.peer_public
    }

    /// Validates parameters and both public values.
    ///
    /// # Errors
    /// Returns an error if the exchange is incomplete or any check fails.
    pub fn run_checks(&self, cache: &PrimeCache) -> Result<()> {
        if !self.has_config() {
            return Err(Error::KeyExchange("DH config is not set".into()));
        }
        if !self.has_peer_public() {
            return Err(Error::KeyExchange("peer public value is not set".into()));
        }
        check_config(self.g, &self.prime, cache)?;
        check_public_value(&self.peer_public, &self.prime)?;
        check_public_value(&self.own_public, &self.prime)
    }

    /// Derives the shared auth key.
    pub fn gen_key(&self) -> Result<AuthKey> {
        if !self.has_config() || !self.has_peer_public() {
            return Err(Error::KeyExchange("exchange is incomplete".into()));
        }
        let secret = compute_shared_secret(&self.private, &self.peer_public, &self.prime)?;
        Ok(AuthKey::new(secret.to_vec()))
    }

    /// Copies the exchange into a serializable snapshot.
    pub fn snapshot(&self) -> DhSnapshot {
        DhSnapshot {
            g: self.g,
            prime: self.prime.clone(),
            private: self.private.clone(),
            own_public: self.own_public.clone(),
            peer_public: self.peer_public.clone(),
        }
    }

    /// Rebuilds an exchange from a snapshot.
    pub fn from_snapshot(snapshot: DhSnapshot) -> Self {
        Self {
            g: snapshot.g,
            prime: snapshot.prime,
            private: snapshot.private,
            own_public: snapshot.own_public,
            peer_public: snapshot.peer_public,
        }
    }
}

impl Default for DhExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for DhExchange {
    fn eq(&self, other: &Self) -> bool {
        self.g == other.g
            && self.prime == other.prime
            && self.private[..] == other.private[..]
            && self.own_public == other.own_public
            && self.peer_public == other.peer_public
    }
}

impl Eq for DhExchange {}

impl core::fmt::Debug for DhExchange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DhExchange")
            .field("g", &self.g)
            .field("has_config", &self.has_config())
            .field("has_peer_public", &self.has_peer_public())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted_cache(config: &DhConfig) -> PrimeCache {
        let cache = PrimeCache::new();
        cache.add_good_prime(&config.prime);
        cache
    }

    #[test]
    fn test_modp_2048_is_safe_prime() {
        let config = DhConfig::modp_2048();
        assert_eq!(config.prime.len(), DH_PRIME_SIZE);

        let cache = PrimeCache::new();
        check_config(config.g, &config.prime, &cache).unwrap();
        assert_eq!(cache.is_good_prime(&config.prime), Some(true));
    }

    #[test]
    fn test_rejects_short_prime() {
        let config = DhConfig::modp_2048();
        let cache = PrimeCache::new();

        let result = check_config(config.g, &config.prime[1..], &cache);
        assert!(matches!(result, Err(Error::InvalidDhConfig(_))));
    }

    #[test]
    fn test_rejects_unsupported_generator() {
        let config = DhConfig::modp_2048();
        let cache = trusted_cache(&config);

        assert!(check_config(9, &config.prime, &cache).is_err());
        assert!(check_config(1, &config.prime, &cache).is_err());
    }

    #[test]
    fn test_rejects_composite_and_caches_verdict() {
        let mut prime = DhConfig::modp_2048().prime;
        prime[DH_PRIME_SIZE - 1] = 0xFE;
        let cache = PrimeCache::new();

        assert!(check_config(4, &prime, &cache).is_err());
        assert_eq!(cache.is_good_prime(&prime), Some(false));
        assert!(check_config(4, &prime, &cache).is_err());
    }

    #[test]
    fn test_public_value_bounds_are_strict() {
        let prime = DhConfig::modp_2048().prime;
        let p = BigUint::from_bytes_be(&prime);
        let margin = BigUint::one() << (DH_PRIME_BITS - DH_PUBLIC_MARGIN_BITS);

        assert!(check_public_value(&[1], &prime).is_err());
        assert!(check_public_value(&margin.to_bytes_be(), &prime).is_err());
        assert!(check_public_value(&(&margin + 1u32).to_bytes_be(), &prime).is_ok());
        assert!(check_public_value(&(&p - &margin).to_bytes_be(), &prime).is_err());
        assert!(check_public_value(&(&p - &margin - 1u32).to_bytes_be(), &prime).is_ok());
    }

    #[test]
    fn test_exchange_agrees_on_key() {
        let config = DhConfig::modp_2048();
        let cache = trusted_cache(&config);

        let mut alice = DhExchange::new();
        let mut bob = DhExchange::new();
        alice.set_config(&config).unwrap();
        bob.set_config(&config).unwrap();
        alice.set_peer_public(bob.own_public());
        bob.set_peer_public(alice.own_public());

        alice.run_checks(&cache).unwrap();
        bob.run_checks(&cache).unwrap();

        let alice_key = alice.gen_key().unwrap();
        let bob_key = bob.gen_key().unwrap();
        assert_eq!(alice_key.key().len(), AUTH_KEY_SIZE);
        assert_eq!(alice_key.id(), bob_key.id());
        assert_eq!(alice_key, bob_key);
    }

    #[test]
    fn test_incomplete_exchange_fails() {
        let config = DhConfig::modp_2048();
        let cache = trusted_cache(&config);

        let mut dh = DhExchange::new();
        assert!(dh.run_checks(&cache).is_err());
        dh.set_config(&config).unwrap();
        assert!(dh.run_checks(&cache).is_err());
        assert!(dh.gen_key().is_err());
    }

    #[test]
    fn test_snapshot_restores_exchange() {
        let mut dh = DhExchange::new();
        dh.set_config(&DhConfig::modp_2048()).unwrap();
        dh.set_peer_public(&[0x42; DH_PRIME_SIZE]);

        let restored = DhExchange::from_snapshot(dh.snapshot());
        assert_eq!(restored, dh);
    }
}
