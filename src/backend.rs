//! Reference slot-arithmetic CKKS backend
//!
//! Ciphertexts here carry their slot vector in the clear while level,
//! scale, and rotation geometry are tracked exactly as a leveled
//! RNS-CKKS implementation enforces them. The operator library is
//! written entirely against this primitive set, so swapping in a
//! lattice backend is a matter of replacing this module: the level
//! accounting, rescale discipline, and bootstrap budget already match
//! what such an implementation demands.
//!
//! Discipline enforced by the primitives (not by convention):
//! - a ciphertext product carries doubled scale and must be rescaled
//!   before it can enter another multiplication;
//! - multiplication and rescaling below the level floor fail with
//!   `InsufficientLevel`;
//! - additions require operands at equal scale;
//! - bootstrapping on a profile without it fails with
//!   `BootstrapUnavailable`.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, StatError};
use crate::params::Profile;

/// An encoded slot vector awaiting encryption or multiplication into a
/// ciphertext.
#[derive(Clone, Debug)]
pub struct Plaintext {
    pub(crate) slots: Vec<f64>,
    pub(crate) scale_bits: u32,
}

impl Plaintext {
    /// Slot values of this plaintext.
    pub fn values(&self) -> &[f64] {
        &self.slots
    }
}

/// A ciphertext handle: slot vector plus the level/scale attributes the
/// evaluator façade observes.
///
/// Level decreases only through [`CkksBackend::rescale`]; bootstrapping
/// resets it to the profile's refreshed level. The handle is freely
/// clonable; clones share nothing.
#[derive(Clone, Debug)]
pub struct Ciphertext {
    pub(crate) slots: Vec<f64>,
    pub(crate) level: usize,
    pub(crate) scale_bits: u32,
}

impl Ciphertext {
    /// Remaining multiplicative budget.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Current scale exponent (log2).
    pub fn scale_bits(&self) -> u32 {
        self.scale_bits
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Serializes to the opaque binary blob format: level and scale as
    /// little-endian u32, slot count as u64, then the raw slot values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.slots.len() * 8);
        out.extend_from_slice(&(self.level as u32).to_le_bytes());
        out.extend_from_slice(&self.scale_bits.to_le_bytes());
        out.extend_from_slice(&(self.slots.len() as u64).to_le_bytes());
        for &v in &self.slots {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Deserializes a blob produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let level = cursor.read_u32::<LittleEndian>()? as usize;
        let scale_bits = cursor.read_u32::<LittleEndian>()?;
        let len = cursor.read_u64::<LittleEndian>()? as usize;
        let mut slots = Vec::with_capacity(len);
        for _ in 0..len {
            slots.push(cursor.read_f64::<LittleEndian>()?);
        }
        Ok(Self {
            slots,
            level,
            scale_bits,
        })
    }

    /// Writes the blob with its 8-byte little-endian length prefix.
    pub fn write_framed<W: Write>(&self, w: &mut W) -> Result<()> {
        let blob = self.to_bytes();
        w.write_u64::<LittleEndian>(blob.len() as u64)?;
        w.write_all(&blob)?;
        Ok(())
    }

    /// Reads a length-prefixed blob.
    pub fn read_framed<R: Read>(r: &mut R) -> Result<Self> {
        let len = r.read_u64::<LittleEndian>()? as usize;
        let mut blob = vec![0u8; len];
        r.read_exact(&mut blob)?;
        Self::from_bytes(&blob)
    }
}

/// Primitive operation provider for one parameter profile.
///
/// Stateless apart from the profile, so a single instance is shared
/// read-only across block workers.
#[derive(Clone, Debug)]
pub struct CkksBackend {
    profile: Profile,
}

impl CkksBackend {
    pub fn new(profile: Profile) -> Result<Self> {
        profile.validate()?;
        Ok(Self { profile })
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn slots(&self) -> usize {
        self.profile.slots
    }

    fn base_scale(&self) -> u32 {
        self.profile.log_scale
    }

    /// Encodes values into a plaintext at the default scale, zero
    /// padding (or truncating) to the slot count.
    pub fn encode(&self, values: &[f64]) -> Plaintext {
        let mut slots = vec![0.0; self.slots()];
        for (slot, &v) in slots.iter_mut().zip(values.iter()) {
            *slot = v;
        }
        Plaintext {
            slots,
            scale_bits: self.base_scale(),
        }
    }

    /// Encodes the same value into every slot.
    pub fn encode_constant(&self, value: f64) -> Plaintext {
        Plaintext {
            slots: vec![value; self.slots()],
            scale_bits: self.base_scale(),
        }
    }

    /// Encrypts a plaintext at the top of the modulus chain.
    pub fn encrypt(&self, pt: &Plaintext) -> Ciphertext {
        Ciphertext {
            slots: pt.slots.clone(),
            level: self.profile.max_level(),
            scale_bits: pt.scale_bits,
        }
    }

    /// Encode-and-encrypt convenience for the data-owner and test paths.
    pub fn encrypt_values(&self, values: &[f64]) -> Ciphertext {
        self.encrypt(&self.encode(values))
    }

    /// Decrypts to slot values. Decryption-authority and test path; the
    /// operator library never calls this.
    pub fn decrypt(&self, ct: &Ciphertext) -> Vec<f64> {
        ct.slots.clone()
    }

    fn check_slots(&self, a: &Ciphertext, b: &Ciphertext, op: &str) -> Result<()> {
        if a.slots.len() != b.slots.len() {
            return Err(StatError::ShapeMismatch {
                context: format!(
                    "{op}: slot counts {} vs {}",
                    a.slots.len(),
                    b.slots.len()
                ),
            });
        }
        Ok(())
    }

    fn check_scales(&self, a: &Ciphertext, b: &Ciphertext, op: &str) -> Result<()> {
        if a.scale_bits != b.scale_bits {
            return Err(StatError::ShapeMismatch {
                context: format!(
                    "{op}: scales 2^{} vs 2^{} (missing rescale?)",
                    a.scale_bits, b.scale_bits
                ),
            });
        }
        Ok(())
    }

    fn check_mul_ready(&self, ct: &Ciphertext, op: &str) -> Result<()> {
        if ct.level < 1 {
            return Err(StatError::InsufficientLevel {
                level: ct.level,
                min_level: 1,
                context: op.to_string(),
            });
        }
        if ct.scale_bits != self.base_scale() {
            return Err(StatError::ShapeMismatch {
                context: format!(
                    "{op}: operand at scale 2^{} instead of 2^{} (missing rescale?)",
                    ct.scale_bits,
                    self.base_scale()
                ),
            });
        }
        Ok(())
    }

    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        self.check_slots(a, b, "add")?;
        self.check_scales(a, b, "add")?;
        let slots = a
            .slots
            .iter()
            .zip(b.slots.iter())
            .map(|(x, y)| x + y)
            .collect();
        Ok(Ciphertext {
            slots,
            level: a.level.min(b.level),
            scale_bits: a.scale_bits,
        })
    }

    pub fn sub(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        self.check_slots(a, b, "sub")?;
        self.check_scales(a, b, "sub")?;
        let slots = a
            .slots
            .iter()
            .zip(b.slots.iter())
            .map(|(x, y)| x - y)
            .collect();
        Ok(Ciphertext {
            slots,
            level: a.level.min(b.level),
            scale_bits: a.scale_bits,
        })
    }

    /// Ciphertext product (with relinearization). The result carries
    /// doubled scale and must be rescaled before further multiplication.
    pub fn mul(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        self.check_slots(a, b, "mul")?;
        self.check_mul_ready(a, "mul")?;
        self.check_mul_ready(b, "mul")?;
        let slots = a
            .slots
            .iter()
            .zip(b.slots.iter())
            .map(|(x, y)| x * y)
            .collect();
        Ok(Ciphertext {
            slots,
            level: a.level.min(b.level),
            scale_bits: a.scale_bits + b.scale_bits,
        })
    }

    /// Ciphertext-plaintext product; same scale discipline as [`mul`](Self::mul).
    pub fn mul_plain(&self, ct: &Ciphertext, pt: &Plaintext) -> Result<Ciphertext> {
        if ct.slots.len() != pt.slots.len() {
            return Err(StatError::ShapeMismatch {
                context: format!(
                    "mul_plain: slot counts {} vs {}",
                    ct.slots.len(),
                    pt.slots.len()
                ),
            });
        }
        self.check_mul_ready(ct, "mul_plain")?;
        let slots = ct
            .slots
            .iter()
            .zip(pt.slots.iter())
            .map(|(x, y)| x * y)
            .collect();
        Ok(Ciphertext {
            slots,
            level: ct.level,
            scale_bits: ct.scale_bits + pt.scale_bits,
        })
    }

    /// Scalar product, folded exactly; consumes neither level nor scale.
    pub fn mul_const(&self, ct: &Ciphertext, c: f64) -> Ciphertext {
        Ciphertext {
            slots: ct.slots.iter().map(|x| x * c).collect(),
            level: ct.level,
            scale_bits: ct.scale_bits,
        }
    }

    /// Scalar addition, folded exactly.
    pub fn add_const(&self, ct: &Ciphertext, c: f64) -> Ciphertext {
        Ciphertext {
            slots: ct.slots.iter().map(|x| x + c).collect(),
            level: ct.level,
            scale_bits: ct.scale_bits,
        }
    }

    /// Drops the top modulus prime, restoring the default scale and
    /// consuming one level.
    pub fn rescale(&self, ct: &Ciphertext) -> Result<Ciphertext> {
        if ct.level < 1 {
            return Err(StatError::InsufficientLevel {
                level: ct.level,
                min_level: 1,
                context: "rescale".to_string(),
            });
        }
        let prime_bits = self.profile.log_q[ct.level];
        if ct.scale_bits < prime_bits {
            return Err(StatError::ShapeMismatch {
                context: format!(
                    "rescale: scale 2^{} below prime size 2^{}",
                    ct.scale_bits, prime_bits
                ),
            });
        }
        Ok(Ciphertext {
            slots: ct.slots.clone(),
            level: ct.level - 1,
            scale_bits: ct.scale_bits - prime_bits,
        })
    }

    /// Cyclic left rotation: slot i of the result holds slot (i+k) of
    /// the input, so `rotate(k)` brings slot k to slot 0.
    pub fn rotate(&self, ct: &Ciphertext, k: usize) -> Ciphertext {
        let n = ct.slots.len();
        let k = k % n;
        let mut slots = Vec::with_capacity(n);
        slots.extend_from_slice(&ct.slots[k..]);
        slots.extend_from_slice(&ct.slots[..k]);
        Ciphertext {
            slots,
            level: ct.level,
            scale_bits: ct.scale_bits,
        }
    }

    pub fn can_bootstrap(&self) -> bool {
        self.profile.bootstrap_enabled
    }

    /// Refreshes a ciphertext to the profile's post-bootstrap level.
    pub fn bootstrap(&self, ct: &Ciphertext) -> Result<Ciphertext> {
        if !self.profile.bootstrap_enabled {
            return Err(StatError::BootstrapUnavailable {
                context: "bootstrap".to_string(),
            });
        }
        Ok(Ciphertext {
            slots: ct.slots.clone(),
            level: self.profile.refreshed_level(),
            scale_bits: self.base_scale(),
        })
    }

    /// Sanity check after an iterative estimate: rejects non-finite slot
    /// values. Only a reference backend can observe this; a lattice
    /// backend compiles the check out and relies on the caller-side
    /// plaintext guards.
    pub fn check_finite(&self, ct: &Ciphertext, what: &str) -> Result<()> {
        if ct.slots.iter().any(|v| !v.is_finite()) {
            return Err(StatError::DivergedEstimate {
                context: what.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> CkksBackend {
        CkksBackend::new(Profile::custom(5, 6, 40, false).unwrap()).unwrap()
    }

    #[test]
    fn fresh_ciphertext_sits_at_max_level() {
        let be = backend();
        let ct = be.encrypt_values(&[1.0, 2.0, 3.0]);
        assert_eq!(ct.level(), be.profile().max_level());
        assert_eq!(ct.scale_bits(), 40);
    }

    #[test]
    fn product_needs_rescale_before_reuse() {
        let be = backend();
        let a = be.encrypt_values(&[2.0]);
        let b = be.encrypt_values(&[3.0]);
        let prod = be.mul(&a, &b).unwrap();
        assert_eq!(prod.scale_bits(), 80);

        // Unrescaled product cannot be multiplied again.
        let err = be.mul(&prod, &a);
        assert!(matches!(err, Err(StatError::ShapeMismatch { .. })));

        let rescaled = be.rescale(&prod).unwrap();
        assert_eq!(rescaled.scale_bits(), 40);
        assert_eq!(rescaled.level(), a.level() - 1);
        assert!(be.mul(&rescaled, &a).is_ok());
    }

    #[test]
    fn level_floor_is_enforced() {
        let be = backend();
        let mut ct = be.encrypt_values(&[1.5]);
        let other = be.encrypt_values(&[1.0]);
        for _ in 0..be.profile().max_level() {
            ct = be.rescale(&be.mul(&ct, &other).unwrap()).unwrap();
        }
        assert_eq!(ct.level(), 0);
        assert!(matches!(
            be.mul(&ct, &other),
            Err(StatError::InsufficientLevel { .. })
        ));
        assert!(matches!(
            be.rescale(&ct),
            Err(StatError::InsufficientLevel { .. })
        ));
    }

    #[test]
    fn rotation_brings_slot_k_to_front() {
        let be = backend();
        let ct = be.encrypt_values(&[10.0, 20.0, 30.0, 40.0]);
        let rot = be.rotate(&ct, 2);
        assert_eq!(be.decrypt(&rot)[0], 30.0);
        assert_eq!(be.decrypt(&rot)[1], 40.0);
    }

    #[test]
    fn bootstrap_requires_profile_support() {
        let be = backend();
        let ct = be.encrypt_values(&[1.0]);
        assert!(matches!(
            be.bootstrap(&ct),
            Err(StatError::BootstrapUnavailable { .. })
        ));

        let boot =
            CkksBackend::new(Profile::custom(5, 10, 40, true).unwrap()).unwrap();
        let ct = boot.encrypt_values(&[1.0]);
        let low = Ciphertext {
            level: 1,
            ..ct.clone()
        };
        let refreshed = boot.bootstrap(&low).unwrap();
        assert_eq!(refreshed.level(), boot.profile().refreshed_level());
    }

    #[test]
    fn framed_roundtrip_preserves_attributes() {
        let be = backend();
        let mut ct = be.encrypt_values(&[1.0, -2.5, 3.25]);
        ct = be.rescale(&be.mul(&ct, &be.encrypt_values(&[2.0, 2.0, 2.0])).unwrap()).unwrap();

        let mut buf = Vec::new();
        ct.write_framed(&mut buf).unwrap();
        // 8-byte length prefix, little endian.
        let framed_len = u64::from_le_bytes(buf[..8].try_into().unwrap()) as usize;
        assert_eq!(framed_len, buf.len() - 8);

        let back = Ciphertext::read_framed(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back.level(), ct.level());
        assert_eq!(back.scale_bits(), ct.scale_bits());
        assert_eq!(be.decrypt(&back), be.decrypt(&ct));
    }

    #[test]
    fn non_finite_slots_are_flagged() {
        let be = backend();
        let mut ct = be.encrypt_values(&[1.0]);
        ct.slots[0] = f64::INFINITY;
        assert!(matches!(
            be.check_finite(&ct, "newton estimate"),
            Err(StatError::DivergedEstimate { .. })
        ));
    }
}
