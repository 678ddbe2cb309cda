//! CKKS parameter profiles
//!
//! A profile fixes the ring degree, slot count, modulus chain, default
//! encoding scale, and bootstrap budget for every ciphertext an engine
//! touches. Two reference profiles are provided:
//!
//! - **Profile A**: no bootstrapping, a long plain modulus chain.
//!   Enough depth for masked sums, bin counts, and the packed
//!   contingency products.
//! - **Profile B**: bootstrapping enabled. Required by the Newton
//!   inverse, the equality and sign approximations, and percentiles,
//!   all of which consume unbounded depth.
//!
//! Tests build reduced profiles through [`Profile::custom`], the same
//! way production parameters are declared.
//!
//! # Example
//!
//! ```
//! use cipherstat::params::Profile;
//!
//! let profile = Profile::profile_b();
//! assert!(profile.validate().is_ok());
//! assert_eq!(profile.slots, 1 << 15);
//! assert!(profile.bootstrap_enabled);
//! ```

use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

use crate::error::{Result, StatError};

/// Identifies one of the shipped parameter profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileKind {
    /// No bootstrapping, limited depth.
    A,
    /// Bootstrapping enabled, unbounded-depth circuits.
    B,
    /// Caller-supplied parameters (tests, experiments).
    Custom,
}

/// A selected CKKS parameter set plus the values derived from it.
///
/// Invariants checked by [`validate`](Self::validate):
/// - `slots == 2^(log_n - 1)` (one slot per ring coefficient pair)
/// - the modulus chain has a base prime plus at least one rescaling prime
/// - bootstrapping reserves `bootstrap_depth` levels of the chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub kind: ProfileKind,

    /// Ring degree exponent; N = 2^log_n.
    pub log_n: usize,

    /// Slot count, N/2.
    pub slots: usize,

    /// Default encoding scale exponent; fresh ciphertexts carry scale
    /// 2^log_scale.
    pub log_scale: u32,

    /// Bit sizes of the ciphertext modulus chain, base prime first.
    /// A ciphertext at level `l` has `l` rescaling primes left above
    /// the base; `max_level = log_q.len() - 1`.
    pub log_q: Vec<u32>,

    /// Bit sizes of the key-switching auxiliary primes.
    pub log_p: Vec<u32>,

    pub bootstrap_enabled: bool,

    /// Levels consumed by the bootstrap circuit itself; a refreshed
    /// ciphertext comes back at `max_level - bootstrap_depth`.
    pub bootstrap_depth: usize,

    /// Bootstrap trigger threshold: a ciphertext at or below this level
    /// needs refreshing (also the minimum input level the bootstrapper
    /// accepts).
    pub min_level: usize,
}

impl Profile {
    /// No-bootstrap profile: LogN 14, 8192 slots, 2^40 scale, 40
    /// rescaling levels. Suited to the shallow operators.
    pub fn profile_a() -> Self {
        let mut log_q = vec![60];
        log_q.extend(std::iter::repeat(40).take(40));
        Self {
            kind: ProfileKind::A,
            log_n: 14,
            slots: 1 << 13,
            log_scale: 40,
            log_q,
            log_p: vec![60, 60],
            bootstrap_enabled: false,
            bootstrap_depth: 0,
            min_level: 2,
        }
    }

    /// Bootstrapping profile: LogN 16, 32768 slots, 2^45 scale, 16
    /// rescaling levels with 4 reserved for the bootstrap circuit.
    pub fn profile_b() -> Self {
        let mut log_q = vec![60];
        log_q.extend(std::iter::repeat(45).take(16));
        Self {
            kind: ProfileKind::B,
            log_n: 16,
            slots: 1 << 15,
            log_scale: 45,
            log_q,
            log_p: vec![61, 61, 61, 61],
            bootstrap_enabled: true,
            bootstrap_depth: 4,
            min_level: 3,
        }
    }

    /// Builds a validated custom profile.
    ///
    /// `levels` is the number of rescaling primes (each `log_scale`
    /// bits) stacked on a 60-bit base prime.
    ///
    /// # Example
    ///
    /// ```
    /// use cipherstat::params::Profile;
    ///
    /// // 256 slots, 20 levels, bootstrapping on: a fast test profile.
    /// let p = Profile::custom(9, 20, 45, true).unwrap();
    /// assert_eq!(p.slots, 256);
    /// assert_eq!(p.max_level(), 20);
    /// ```
    pub fn custom(
        log_n: usize,
        levels: usize,
        log_scale: u32,
        bootstrap_enabled: bool,
    ) -> Result<Self> {
        let mut log_q = vec![60];
        log_q.extend(std::iter::repeat(log_scale).take(levels));
        let profile = Self {
            kind: ProfileKind::Custom,
            log_n,
            slots: 1usize << (log_n.saturating_sub(1)),
            log_scale,
            log_q,
            log_p: vec![60, 60],
            bootstrap_enabled,
            bootstrap_depth: if bootstrap_enabled { 4 } else { 0 },
            min_level: if bootstrap_enabled { 3 } else { 2 },
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Maximum ciphertext level (number of rescaling primes).
    pub fn max_level(&self) -> usize {
        self.log_q.len() - 1
    }

    /// Level a ciphertext holds right after bootstrapping.
    pub fn refreshed_level(&self) -> usize {
        self.max_level() - self.bootstrap_depth
    }

    /// Rotation steps the evaluation keys must cover for slot
    /// reductions: the powers of two below the slot count.
    pub fn rotation_steps(&self) -> Vec<usize> {
        let mut steps = Vec::new();
        let mut r = 1;
        while r < self.slots {
            steps.push(r);
            r *= 2;
        }
        steps
    }

    /// Number of blocks a column of `rows` rows occupies.
    pub fn blocks_for_rows(&self, rows: usize) -> usize {
        rows.div_ceil(self.slots)
    }

    /// Checks the profile invariants.
    pub fn validate(&self) -> Result<()> {
        if self.log_n < 4 || self.log_n > 17 {
            return Err(StatError::InvalidConfiguration {
                reason: format!("log_n must be in 4..=17, got {}", self.log_n),
            });
        }
        if self.slots != 1 << (self.log_n - 1) {
            return Err(StatError::InvalidConfiguration {
                reason: format!(
                    "slot count {} does not match ring degree 2^{}",
                    self.slots, self.log_n
                ),
            });
        }
        if self.log_q.len() < 2 {
            return Err(StatError::InvalidConfiguration {
                reason: "modulus chain needs a base prime and at least one level".into(),
            });
        }
        if self.bootstrap_enabled && self.max_level() <= self.bootstrap_depth + self.min_level {
            return Err(StatError::InvalidConfiguration {
                reason: format!(
                    "modulus chain too short for bootstrapping: {} levels, {} reserved",
                    self.max_level(),
                    self.bootstrap_depth
                ),
            });
        }
        Ok(())
    }

    /// Stable Keccak-256 digest of the parameter configuration, hex
    /// encoded. Recorded in table metadata so an engine can refuse
    /// blocks produced under different parameters.
    pub fn params_hash(&self) -> String {
        let mut hasher = Keccak::v256();
        hasher.update(&(self.log_n as u64).to_le_bytes());
        hasher.update(&(self.log_scale as u64).to_le_bytes());
        for &bits in &self.log_q {
            hasher.update(&(bits as u64).to_le_bytes());
        }
        for &bits in &self.log_p {
            hasher.update(&(bits as u64).to_le_bytes());
        }
        hasher.update(&[self.bootstrap_enabled as u8]);
        let mut digest = [0u8; 32];
        hasher.finalize(&mut digest);
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}
