//! Evaluator façade
//!
//! Wraps the backend primitives with operation counters, elapsed-time
//! tracking, and the centralized bootstrap policy. All level and scale
//! decisions the operators rely on flow through here: `rescale` after
//! every product, `maybe_bootstrap` at the points an operator marks,
//! slot reductions and powers built from the counted primitives.
//!
//! The counters are atomics because block workers on the rayon pool
//! bump them concurrently; everything else in the façade is read-only
//! shared state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Ciphertext, CkksBackend, Plaintext};
use crate::error::{Result, StatError};
use crate::params::Profile;

#[derive(Default)]
struct Counter {
    count: AtomicU64,
    nanos: AtomicU64,
}

impl Counter {
    fn record(&self, start: Instant) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.nanos.store(0, Ordering::Relaxed);
    }
}

/// Shared operation counters. Multiplications of all three operand
/// kinds are counted together, as are additions and subtractions.
#[derive(Default)]
pub struct OpCounters {
    mul: Counter,
    add: Counter,
    rotate: Counter,
    rescale: Counter,
    bootstrap: Counter,
}

impl OpCounters {
    pub fn reset(&self) {
        self.mul.reset();
        self.add.reset();
        self.rotate.reset();
        self.rescale.reset();
        self.bootstrap.reset();
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            mul_count: self.mul.count.load(Ordering::Relaxed),
            add_count: self.add.count.load(Ordering::Relaxed),
            rotate_count: self.rotate.count.load(Ordering::Relaxed),
            rescale_count: self.rescale.count.load(Ordering::Relaxed),
            bootstrap_count: self.bootstrap.count.load(Ordering::Relaxed),
            mul_nanos: self.mul.nanos.load(Ordering::Relaxed),
            add_nanos: self.add.nanos.load(Ordering::Relaxed),
            rotate_nanos: self.rotate.nanos.load(Ordering::Relaxed),
            rescale_nanos: self.rescale.nanos.load(Ordering::Relaxed),
            bootstrap_nanos: self.bootstrap.nanos.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, recorded in result sidecars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub mul_count: u64,
    pub add_count: u64,
    pub rotate_count: u64,
    pub rescale_count: u64,
    pub bootstrap_count: u64,
    pub mul_nanos: u64,
    pub add_nanos: u64,
    pub rotate_nanos: u64,
    pub rescale_nanos: u64,
    pub bootstrap_nanos: u64,
}

/// The evaluator façade. One instance per job; shared read-only across
/// the block workers of that job.
pub struct Evaluator {
    backend: CkksBackend,
    counters: OpCounters,
}

impl Evaluator {
    pub fn new(profile: Profile) -> Result<Self> {
        Ok(Self {
            backend: CkksBackend::new(profile)?,
            counters: OpCounters::default(),
        })
    }

    pub fn backend(&self) -> &CkksBackend {
        &self.backend
    }

    pub fn profile(&self) -> &Profile {
        self.backend.profile()
    }

    pub fn slots(&self) -> usize {
        self.backend.slots()
    }

    pub fn counters(&self) -> &OpCounters {
        &self.counters
    }

    pub fn encode(&self, values: &[f64]) -> Plaintext {
        self.backend.encode(values)
    }

    pub fn encode_constant(&self, value: f64) -> Plaintext {
        self.backend.encode_constant(value)
    }

    pub fn decode(&self, pt: &Plaintext) -> Vec<f64> {
        pt.values().to_vec()
    }

    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        let start = Instant::now();
        let out = self.backend.add(a, b)?;
        self.counters.add.record(start);
        Ok(out)
    }

    pub fn sub(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        let start = Instant::now();
        let out = self.backend.sub(a, b)?;
        self.counters.add.record(start);
        Ok(out)
    }

    pub fn mul(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        let start = Instant::now();
        let out = self.backend.mul(a, b)?;
        self.counters.mul.record(start);
        Ok(out)
    }

    pub fn mul_plain(&self, ct: &Ciphertext, pt: &Plaintext) -> Result<Ciphertext> {
        let start = Instant::now();
        let out = self.backend.mul_plain(ct, pt)?;
        self.counters.mul.record(start);
        Ok(out)
    }

    pub fn mul_const(&self, ct: &Ciphertext, c: f64) -> Ciphertext {
        let start = Instant::now();
        let out = self.backend.mul_const(ct, c);
        self.counters.mul.record(start);
        out
    }

    pub fn add_const(&self, ct: &Ciphertext, c: f64) -> Ciphertext {
        let start = Instant::now();
        let out = self.backend.add_const(ct, c);
        self.counters.add.record(start);
        out
    }

    pub fn rescale(&self, ct: &Ciphertext) -> Result<Ciphertext> {
        let start = Instant::now();
        let out = self.backend.rescale(ct)?;
        self.counters.rescale.record(start);
        Ok(out)
    }

    /// Product followed by the mandatory rescale.
    pub fn mul_rescale(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        let prod = self.mul(a, b)?;
        self.rescale(&prod)
    }

    pub fn rotate(&self, ct: &Ciphertext, k: usize) -> Ciphertext {
        let start = Instant::now();
        let out = self.backend.rotate(ct, k);
        self.counters.rotate.record(start);
        out
    }

    /// Constant ciphertext at the level of `like`, every slot `value`.
    pub fn constant_like(&self, like: &Ciphertext, value: f64) -> Ciphertext {
        let zero = self.backend.mul_const(like, 0.0);
        self.backend.add_const(&zero, value)
    }

    /// True when the ciphertext has fallen to the bootstrap threshold.
    pub fn needs_bootstrap(&self, ct: &Ciphertext) -> bool {
        ct.level() <= self.profile().min_level
    }

    pub fn can_bootstrap(&self) -> bool {
        self.backend.can_bootstrap()
    }

    pub fn bootstrap(&self, ct: &Ciphertext) -> Result<Ciphertext> {
        let start = Instant::now();
        let out = self.backend.bootstrap(ct)?;
        self.counters.bootstrap.record(start);
        debug!(
            from = ct.level(),
            to = out.level(),
            "bootstrapped ciphertext"
        );
        Ok(out)
    }

    /// Bootstraps when needed and possible. When refreshing is needed
    /// but unavailable the ciphertext is returned unchanged, so the
    /// operator fails later on an explicit insufficient-level error
    /// rather than silently corrupting the result.
    pub fn maybe_bootstrap(&self, ct: Ciphertext) -> Result<Ciphertext> {
        if self.needs_bootstrap(&ct) && self.can_bootstrap() {
            return self.bootstrap(&ct);
        }
        Ok(ct)
    }

    /// Reduces all slots into slot 0 by rotation doubling: after
    /// adding rotations by 1, 2, 4, ..., S/2, slot 0 holds the sum of
    /// every initial slot.
    pub fn sum_slots(&self, ct: &Ciphertext) -> Result<Ciphertext> {
        let mut result = ct.clone();
        let mut r = 1;
        while r < self.slots() {
            let rotated = self.rotate(&result, r);
            result = self.add(&result, &rotated)?;
            r *= 2;
        }
        Ok(result)
    }

    /// Binary exponentiation, rescaling after every squaring and
    /// combination, with a bootstrap check between steps.
    pub fn power(&self, ct: &Ciphertext, n: u32) -> Result<Ciphertext> {
        if n == 0 {
            return Err(StatError::InvalidConfiguration {
                reason: "power exponent must be positive".into(),
            });
        }
        if n == 1 {
            return Ok(ct.clone());
        }

        let mut result: Option<Ciphertext> = None;
        let mut base = ct.clone();
        let mut exp = n;
        while exp > 0 {
            if exp & 1 == 1 {
                result = Some(match result {
                    None => base.clone(),
                    Some(acc) => {
                        let combined = self.mul_rescale(&acc, &base)?;
                        self.maybe_bootstrap(combined)?
                    }
                });
            }
            exp >>= 1;
            if exp > 0 {
                let squared = self.mul_rescale(&base, &base)?;
                base = self.maybe_bootstrap(squared)?;
            }
        }
        Ok(result.expect("n >= 1 sets at least one bit"))
    }
}
