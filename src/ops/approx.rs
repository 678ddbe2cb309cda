//! Polynomial approximations: equality-to-zero, sign, comparison
//!
//! Two approximation families power the categorical lookup and the
//! percentile search:
//!
//! - **Equality-to-zero** over integer-coded inputs: normalize into
//!   the Chebyshev interval, evaluate a degree-16 fit of
//!   sinc(t) = sin(πt)/(πt), raise the response to the K-th power to
//!   sharpen the central peak, then push the residuals to {0, 1} with
//!   a cubic filter. The power goes through binary exponentiation, so
//!   even large K costs only log₂ K multiplicative depth.
//! - **Sign** via the cubic Newton step `s ← 0.5·s·(3 − s²)`. The
//!   iteration contracts toward ±1 for |s| < √3 and diverges beyond;
//!   inputs are expected in [−1, 1] and callers pre-scale.
//!
//! Chebyshev coefficients are computed in plain arithmetic at
//! configuration time, converted to the monomial basis, and evaluated
//! through a power cache so multiplicative depth stays logarithmic in
//! the degree.

use std::collections::HashMap;

use crate::backend::Ciphertext;
use crate::error::{Result, StatError};
use crate::eval::Evaluator;

/// ⌈log₂ n⌉ for n ≥ 1.
fn log2_ceil(n: usize) -> usize {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }
}

/// Chebyshev interpolation of sinc on [−1, 1] at the usual cosine
/// nodes. Coefficient k of the T_k expansion.
pub fn sinc_chebyshev(degree: usize) -> Vec<f64> {
    let n = degree + 1;
    let mut coeffs = vec![0.0; n];
    for (k, c) in coeffs.iter_mut().enumerate() {
        let mut sum = 0.0;
        for j in 0..n {
            let x = (std::f64::consts::PI * (j as f64 + 0.5) / n as f64).cos();
            let fx = if x.abs() < 1e-10 {
                1.0
            } else {
                (std::f64::consts::PI * x).sin() / (std::f64::consts::PI * x)
            };
            let tk = (k as f64 * x.acos()).cos();
            sum += fx * tk;
        }
        *c = 2.0 * sum / n as f64;
        if k == 0 {
            *c /= 2.0;
        }
    }
    coeffs
}

/// Converts T_k coefficients to monomial coefficients using the
/// recurrence T_k = 2x·T_{k−1} − T_{k−2}.
pub fn chebyshev_to_monomial(cheb: &[f64]) -> Vec<f64> {
    let n = cheb.len();
    if n == 0 {
        return Vec::new();
    }

    // t[k][j]: coefficient of x^j in T_k.
    let mut t = vec![vec![0.0; n]; n];
    t[0][0] = 1.0;
    if n > 1 {
        t[1][1] = 1.0;
    }
    for k in 2..n {
        for j in 0..n {
            let mut v = -t[k - 2][j];
            if j > 0 {
                v += 2.0 * t[k - 1][j - 1];
            }
            t[k][j] = v;
        }
    }

    let mut monomial = vec![0.0; n];
    for k in 0..n {
        for j in 0..n {
            monomial[j] += cheb[k] * t[k][j];
        }
    }
    monomial
}

/// Memoized monomial powers of one ciphertext. Exponent k is built
/// from k/2 (even) or k−1 (odd), so the multiplication chain for any
/// k stays O(log k) deep.
pub struct PowerCache<'a> {
    eval: &'a Evaluator,
    base: Ciphertext,
    powers: HashMap<u32, Ciphertext>,
}

impl<'a> PowerCache<'a> {
    pub fn new(eval: &'a Evaluator, base: Ciphertext) -> Self {
        Self {
            eval,
            base,
            powers: HashMap::new(),
        }
    }

    pub fn get(&mut self, k: u32) -> Result<Ciphertext> {
        if k == 0 {
            return Err(StatError::InvalidConfiguration {
                reason: "power cache exponent must be positive".into(),
            });
        }
        if k == 1 {
            return Ok(self.base.clone());
        }
        if let Some(p) = self.powers.get(&k) {
            return Ok(p.clone());
        }
        let product = if k % 2 == 0 {
            let half = self.get(k / 2)?;
            self.eval.mul_rescale(&half, &half)?
        } else {
            let lower = self.get(k - 1)?;
            self.eval.mul_rescale(&lower, &self.base)?
        };
        let product = self.eval.maybe_bootstrap(product)?;
        self.powers.insert(k, product.clone());
        Ok(product)
    }
}

/// Evaluates a monomial-basis polynomial on a ciphertext through a
/// power cache. Coefficients below 1e-9 are dropped: the odd terms of
/// an even fit survive basis conversion only as ~1e-13 float residue,
/// far under the smallest genuine term.
pub fn evaluate_monomial(eval: &Evaluator, x: &Ciphertext, coeffs: &[f64]) -> Result<Ciphertext> {
    if coeffs.is_empty() {
        return Err(StatError::InvalidConfiguration {
            reason: "polynomial needs at least one coefficient".into(),
        });
    }

    let mut cache = PowerCache::new(eval, x.clone());
    let mut acc: Option<Ciphertext> = None;
    for (k, &c) in coeffs.iter().enumerate().skip(1) {
        if c.abs() < 1e-9 {
            continue;
        }
        let term = eval.mul_const(&cache.get(k as u32)?, c);
        acc = Some(match acc {
            None => term,
            Some(sum) => eval.add(&sum, &term)?,
        });
    }
    Ok(match acc {
        None => eval.constant_like(x, coeffs[0]),
        Some(sum) => eval.add_const(&sum, coeffs[0]),
    })
}

/// Equality-to-zero parameters.
#[derive(Debug, Clone, Copy)]
pub struct DezConfig {
    /// Category count S_f; integer inputs live in
    /// {−(S_f−1), ..., S_f−1}.
    pub categories: usize,
    /// Sharpening exponent K: the sinc response is raised to the K-th
    /// power before filtering. Exposed so accuracy sweeps can trade
    /// depth against false-positive rate.
    pub sharpen_power: u32,
    /// Degree of the sinc interpolation.
    pub chebyshev_degree: usize,
}

/// Smallest sharpening exponent that brings the nearest nonzero
/// integer's response into the filter's capture range.
fn min_sharpen_power(categories: usize) -> u32 {
    let d = log2_ceil(categories) as u32;
    1u32 << (2 * d).min(31)
}

impl DezConfig {
    /// Defaults for a given category count: sharpening exponent
    /// 2·4^⌈log₂ S_f⌉ and degree 16.
    ///
    /// The exponent looks steep but costs only its log₂ in depth, and
    /// it is the smallest power of two that pushes every nonzero
    /// integer's filtered response below 10⁻²: the nearest nonzero
    /// input sits at sinc(2^-d) ≈ 1 − 1.64·4^-d, so an exponent
    /// proportional to 4^d is what moves it away from 1 at all.
    pub fn for_categories(categories: usize) -> Self {
        let d = log2_ceil(categories) as u32;
        Self {
            categories,
            sharpen_power: 1u32 << (2 * d + 1).min(31),
            chebyshev_degree: 16,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.categories < 2 {
            return Err(StatError::InvalidConfiguration {
                reason: format!(
                    "equality indicator needs at least 2 categories, got {}",
                    self.categories
                ),
            });
        }
        let min_power = min_sharpen_power(self.categories);
        if self.sharpen_power < min_power {
            return Err(StatError::ApproximationBrittle {
                parameter: "sharpen_power",
                minimum: min_power as usize,
                actual: self.sharpen_power as usize,
            });
        }
        Ok(())
    }
}

/// Cubic filter s³·(4 − 3s): pushes near-zero values toward 0 and
/// near-one values toward 1, fixing both endpoints.
fn cubic_filter(eval: &Evaluator, s: &Ciphertext) -> Result<Ciphertext> {
    let s = eval.maybe_bootstrap(s.clone())?;
    let s2 = eval.mul_rescale(&s, &s)?;
    let s3 = eval.mul_rescale(&s2, &s)?;
    let tail = eval.add_const(&eval.mul_const(&s, -3.0), 4.0);
    eval.mul_rescale(&s3, &tail)
}

/// Indicator of "this slot's integer value is zero": ≈1 at 0, ≈0 at
/// every other integer in {−(S_f−1), ..., S_f−1}.
pub fn discrete_equal_zero(
    eval: &Evaluator,
    x: &Ciphertext,
    config: &DezConfig,
) -> Result<Ciphertext> {
    config.validate()?;

    // Normalize so every admissible integer lands strictly inside the
    // interpolation interval; only v = 0 stays at the sinc peak.
    let d = log2_ceil(config.categories);
    let normalized = eval.mul_const(x, (-(d as f64)).exp2());
    let normalized = eval.maybe_bootstrap(normalized)?;

    let monomial = chebyshev_to_monomial(&sinc_chebyshev(config.chebyshev_degree));
    let s = evaluate_monomial(eval, &normalized, &monomial)?;

    // Raise to the K-th power to sharpen the peak at zero, then apply
    // the cubic filter once.
    let sharpened = eval.power(&s, config.sharpen_power)?;
    cubic_filter(eval, &sharpened)
}

/// Sign approximation parameters.
#[derive(Debug, Clone, Copy)]
pub struct SignConfig {
    /// Newton refinement iterations of `s ← 0.5·s·(3 − s²)`.
    pub iterations: usize,
}

impl Default for SignConfig {
    fn default() -> Self {
        Self { iterations: 3 }
    }
}

impl SignConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(StatError::ApproximationBrittle {
                parameter: "sign iterations",
                minimum: 1,
                actual: 0,
            });
        }
        Ok(())
    }
}

/// Approximates sign(x) on [−1, 1]: ≈−1 below zero, ≈+1 above, 0 at 0.
///
/// At the default 3 iterations the output is within 1e-2 of the true
/// sign for |x| ≥ 0.6 and bounded by 1 in magnitude everywhere on the
/// valid interval. More iterations sharpen the transition; the
/// percentile engine runs 24.
pub fn approx_sign(eval: &Evaluator, x: &Ciphertext, config: &SignConfig) -> Result<Ciphertext> {
    config.validate()?;
    let mut s = x.clone();
    for _ in 0..config.iterations {
        let s2 = eval.mul_rescale(&s, &s)?;
        let three_minus = eval.add_const(&eval.mul_const(&s2, -1.0), 3.0);
        let stepped = eval.mul_rescale(&s, &three_minus)?;
        let halved = eval.mul_const(&stepped, 0.5);
        s = eval.maybe_bootstrap(halved)?;
    }
    Ok(s)
}

/// Comparison 0.5·(sign(a − b) + 1): ≈1 when a > b, ≈0 when a < b,
/// ½ at equality.
pub fn compare(
    eval: &Evaluator,
    a: &Ciphertext,
    b: &Ciphertext,
    config: &SignConfig,
) -> Result<Ciphertext> {
    let diff = eval.sub(a, b)?;
    let sign = approx_sign(eval, &diff, config)?;
    Ok(eval.mul_const(&eval.add_const(&sign, 1.0), 0.5))
}

/// Selects rows of `target_blocks` whose categorical slot equals
/// `value`: each output block is target · [cat = value], built from the
/// equality indicator on the shifted column.
pub fn select_equal(
    eval: &Evaluator,
    cat_blocks: &[Ciphertext],
    value: i64,
    target_blocks: &[Ciphertext],
    config: &DezConfig,
) -> Result<Vec<Ciphertext>> {
    if cat_blocks.len() != target_blocks.len() {
        return Err(StatError::ShapeMismatch {
            context: format!(
                "lookup: {} categorical vs {} target blocks",
                cat_blocks.len(),
                target_blocks.len()
            ),
        });
    }

    let mut out = Vec::with_capacity(cat_blocks.len());
    for (b, (cat, target)) in cat_blocks.iter().zip(target_blocks).enumerate() {
        let shifted = eval.add_const(cat, -(value as f64));
        let indicator = discrete_equal_zero(eval, &shifted, config)
            .map_err(|e| e.in_context(&format!("lookup block {b}")))?;
        let selected = eval
            .mul_rescale(&indicator, target)
            .map_err(|e| e.in_context(&format!("lookup block {b}")))?;
        out.push(selected);
    }
    Ok(out)
}
