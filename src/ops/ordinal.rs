//! Ordinal k-percentile
//!
//! Builds the per-value frequency vector from bit-mask blocks, forms
//! the cumulative histogram, and searches, still in ciphertext space,
//! for the first bucket whose cumulative share reaches K/100. The
//! search compares each cumulative ratio against the threshold with
//! the sign approximation, collapses the sign to a {0,1} indicator
//! with the flip mapping
//!
//! ```text
//! f(s) = −0.5·(s − 0.5)² + 1.125 = −0.5s² + 0.5s + 1
//! ```
//!
//! (±1 map to exactly 0/1, and the quadratic keeps the error smallest
//! right at the noisy bucket transition), and counts the buckets still
//! below threshold: `bucket = 1 + Σ_v (1 − indicator[v])`, left in
//! slot 0.
//!
//! Ratios are quantized at 1/R, so the engine runs a much sharper sign
//! iteration than the generic default, and it subtracts a small
//! tie-break from the threshold so a bucket landing exactly on K/100
//! resolves to "not yet reached", matching the ⌊R·K/100⌋ convention
//! of the plaintext reference.

use crate::backend::Ciphertext;
use crate::error::{Result, StatError};
use crate::eval::Evaluator;
use crate::ops::approx::{approx_sign, SignConfig};
use crate::ops::categorical::MaskSource;
use crate::ops::inverse::{inv_nth_root_bounded, InverseConfig};

/// Sign iterations below this cannot resolve adjacent buckets on any
/// realistically sized table.
const MIN_SIGN_ITERATIONS: usize = 8;

/// Percentile search parameters.
#[derive(Debug, Clone, Copy)]
pub struct PercentileConfig {
    /// Target percentile, in (0, 100].
    pub k: f64,
    /// Number of ordinal categories S_f.
    pub categories: usize,
    /// Sign sharpening for the threshold comparisons.
    pub sign: SignConfig,
    /// Subtracted from K/100 before the comparison so an exact tie
    /// counts as "below".
    pub tie_break: f64,
}

impl PercentileConfig {
    pub fn new(k: f64, categories: usize) -> Self {
        Self {
            k,
            categories,
            sign: SignConfig { iterations: 24 },
            tie_break: (-10f64).exp2(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.k > 0.0 && self.k <= 100.0) {
            return Err(StatError::InvalidConfiguration {
                reason: format!("percentile k must be in (0, 100], got {}", self.k),
            });
        }
        if self.categories < 1 {
            return Err(StatError::InvalidConfiguration {
                reason: "percentile needs at least one category".into(),
            });
        }
        if self.sign.iterations < MIN_SIGN_ITERATIONS {
            return Err(StatError::ApproximationBrittle {
                parameter: "percentile sign iterations",
                minimum: MIN_SIGN_ITERATIONS,
                actual: self.sign.iterations,
            });
        }
        Ok(())
    }
}

/// Computes the K-percentile bucket index (1..=S_f) of an ordinal
/// column, in slot 0 of the result.
///
/// The cumulative total must be positive: an empty table makes the
/// inverse total meaningless.
pub fn percentile<S: MaskSource>(
    eval: &Evaluator,
    column: &str,
    validity_blocks: &[Ciphertext],
    source: &S,
    config: &PercentileConfig,
) -> Result<Ciphertext> {
    config.validate()?;

    let blocks = source.block_count();
    if validity_blocks.len() != blocks || blocks == 0 {
        return Err(StatError::ShapeMismatch {
            context: format!(
                "percentile on {column}: {} validity blocks vs {} mask blocks",
                validity_blocks.len(),
                blocks
            ),
        });
    }

    // Per-value frequencies: Σ_b bmv[v][b]·validity[b], reduced to slot 0.
    let mut freqs = Vec::with_capacity(config.categories);
    for value in 1..=config.categories as u32 {
        let mut sum: Option<Ciphertext> = None;
        for b in 0..blocks {
            let ctx = format!("column {column} value {value} block {b}");
            let bmv = source
                .mask(column, value, b)
                .map_err(|e| e.in_context(&ctx))?;
            let masked = eval
                .mul_rescale(&bmv, &validity_blocks[b])
                .map_err(|e| e.in_context(&ctx))?;
            sum = Some(match sum {
                None => masked,
                Some(acc) => eval.add(&acc, &masked)?,
            });
        }
        let total = sum.expect("blocks checked non-empty");
        freqs.push(eval.sum_slots(&total)?);
    }

    // Cumulative histogram; the last entry is the total count R.
    let mut cumulative = Vec::with_capacity(config.categories);
    cumulative.push(freqs[0].clone());
    for freq in freqs.iter().skip(1) {
        let prev = cumulative.last().expect("nonempty");
        cumulative.push(eval.add(prev, freq)?);
    }

    let capacity = (blocks * eval.slots()) as f64;
    let inv_total = inv_nth_root_bounded(
        eval,
        cumulative.last().expect("nonempty"),
        capacity,
        &InverseConfig::reciprocal(),
    )?;

    // Tie-broken threshold, clamped below 1 so K = 100 still resolves
    // to the top bucket (the full-population ratio is exactly 1).
    let threshold = (config.k / 100.0 + config.tie_break).min(1.0 - config.tie_break);

    // Count buckets whose cumulative share is still below threshold.
    let mut below: Option<Ciphertext> = None;
    for cumul in &cumulative {
        let ratio = eval.mul_rescale(cumul, &inv_total)?;
        let diff = eval.add_const(&ratio, -threshold);
        let sign = approx_sign(eval, &diff, &config.sign)?;
        let indicator = flip_mapping(eval, &sign)?;

        let not_reached = eval.add_const(&eval.mul_const(&indicator, -1.0), 1.0);
        below = Some(match below {
            None => not_reached,
            Some(acc) => {
                // Indicator levels drift apart as the sign iterations
                // bootstrap at different points; additions only need
                // matching scales.
                eval.add(&acc, &not_reached)?
            }
        });
    }

    Ok(eval.add_const(&below.expect("categories checked nonzero"), 1.0))
}

/// Flip mapping −0.5s² + 0.5s + 1: sends sign = −1 to 0 and sign = +1
/// to 1.
fn flip_mapping(eval: &Evaluator, sign: &Ciphertext) -> Result<Ciphertext> {
    let sign = eval.maybe_bootstrap(sign.clone())?;
    let squared = eval.mul_rescale(&sign, &sign)?;
    let quad = eval.mul_const(&squared, -0.5);
    let linear = eval.mul_const(&sign, 0.5);
    let combined = eval.add(&quad, &linear)?;
    Ok(eval.add_const(&combined, 1.0))
}

/// Plaintext percentile for validation: the value at index
/// ⌊R·K/100⌋ of the sorted valid values.
pub fn plaintext_percentile(values: &[u32], valid: &[bool], k: f64) -> u32 {
    let mut kept: Vec<u32> = values
        .iter()
        .zip(valid)
        .filter(|(_, &ok)| ok)
        .map(|(&v, _)| v)
        .collect();
    if kept.is_empty() {
        return 0;
    }
    kept.sort_unstable();
    let idx = ((kept.len() as f64 * k / 100.0) as usize).min(kept.len() - 1);
    kept[idx]
}

/// Plaintext cumulative histogram for validation.
pub fn plaintext_cumulative(values: &[u32], valid: &[bool], categories: usize) -> Vec<usize> {
    let mut freq = vec![0usize; categories];
    for (&v, &ok) in values.iter().zip(valid) {
        if ok && v >= 1 && v as usize <= categories {
            freq[v as usize - 1] += 1;
        }
    }
    for i in 1..categories {
        freq[i] += freq[i - 1];
    }
    freq
}
