//! Large bin-count: packed contingency tables
//!
//! One pass over the blocks produces a single ciphertext whose slots
//! carry bit-field-packed cell contributions for every primary
//! category at once. The primary column is encoded as a PBMV, slot
//! value `2^(δ + Δ·(v−1))` for category v, so distinct categories
//! occupy disjoint mantissa bit ranges. Each secondary column
//! contributes a BBMV (`2^Λ` on match, 0 otherwise) that lifts
//! matching rows above the CKKS noise floor and zeroes the rest.
//!
//! The decryptor rounds each slot, bit-decomposes it with the plan the
//! engine reports, and increments one cell per contributing row;
//! [`aggregate_slots`] implements that contract. When the row count
//! exceeds the per-field capacity `S · 2^Δ` the plan sets
//! `requires_aggregation` and only the aggregated table may be
//! released, never the raw decrypted chunks.
//!
//! The whole construction works only while every packed exponent stays
//! inside the 52-bit double mantissa; [`LbcConfig::validate_budget`]
//! rejects configurations that overflow it at planning time, before
//! any ciphertext work.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::backend::Ciphertext;
use crate::error::{Result, StatError};
use crate::eval::Evaluator;

/// Usable mantissa width of an IEEE-754 double at decryption.
pub const MANTISSA_BITS: u32 = 52;

/// Bit-field geometry for the packed encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbcConfig {
    /// δ: offset of the first primary bit-field.
    pub bit_offset: u32,
    /// Δ: per-category bit spacing (also the per-field counter width).
    pub bit_spacing: u32,
    /// Λ: scale shift applied by each secondary match.
    pub scale_shift: u32,
}

impl Default for LbcConfig {
    fn default() -> Self {
        Self {
            bit_offset: 10,
            bit_spacing: 10,
            scale_shift: 30,
        }
    }
}

impl LbcConfig {
    /// Chooses a geometry that fills the mantissa budget for the given
    /// table shape: fixed δ = 4 and Λ = 30, with the widest per-field
    /// counter the remaining bits allow. Fails when nothing fits.
    pub fn fitted(categories: usize, secondaries: usize, slots: usize) -> Result<Self> {
        let bit_offset = 4u32;
        let scale_shift = 30u32;
        let slot_bits = slots.next_power_of_two().trailing_zeros();
        let fixed = bit_offset + scale_shift * secondaries as u32 + slot_bits;
        let spread = categories.saturating_sub(1).max(1) as u32;
        if fixed + spread > MANTISSA_BITS {
            return Err(StatError::InvalidConfiguration {
                reason: format!(
                    "no packed geometry fits {categories} categories and {secondaries} \
                     secondaries in {slots} slots"
                ),
            });
        }
        let config = Self {
            bit_offset,
            bit_spacing: (MANTISSA_BITS - fixed) / spread,
            scale_shift,
        };
        config.validate_budget(categories, secondaries, slots)?;
        Ok(config)
    }

    /// Highest exponent a packed slot can reach after summing across
    /// `slots` positions.
    fn max_exponent(&self, categories: usize, secondaries: usize, slots: usize) -> u32 {
        self.bit_offset
            + self.bit_spacing * (categories as u32 - 1)
            + self.scale_shift * secondaries as u32
            + slots.next_power_of_two().trailing_zeros()
    }

    /// Rejects geometries whose packed values cannot survive the
    /// double mantissa.
    pub fn validate_budget(
        &self,
        categories: usize,
        secondaries: usize,
        slots: usize,
    ) -> Result<()> {
        if categories < 1 {
            return Err(StatError::InvalidConfiguration {
                reason: "packed bin count needs at least one primary category".into(),
            });
        }
        if self.bit_spacing == 0 {
            return Err(StatError::InvalidConfiguration {
                reason: "bit spacing must be positive".into(),
            });
        }
        let max_exp = self.max_exponent(categories, secondaries, slots);
        if max_exp > MANTISSA_BITS {
            return Err(StatError::InvalidConfiguration {
                reason: format!(
                    "packed exponent budget exceeded: δ={} + Δ={}·({}−1) + Λ={}·{} + ⌈log₂ {}⌉ = {} > {}",
                    self.bit_offset,
                    self.bit_spacing,
                    categories,
                    self.scale_shift,
                    secondaries,
                    slots,
                    max_exp,
                    MANTISSA_BITS
                ),
            });
        }
        Ok(())
    }
}

/// True when per-slot field counters can overflow their Δ-bit width,
/// forcing chunked decryption with aggregation-only release.
pub fn needs_post_aggregation(rows: usize, slots: usize, bit_spacing: u32) -> bool {
    rows > slots.saturating_mul(1usize << bit_spacing.min(63))
}

/// Everything the decryptor needs to decompose the packed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbcPlan {
    pub config: LbcConfig,
    pub categories: usize,
    pub secondaries: usize,
    pub slots: usize,
    pub rows: usize,
    pub requires_aggregation: bool,
}

/// Packed result of one engine pass.
#[derive(Debug, Clone)]
pub struct LbcResult {
    pub packed: Ciphertext,
    pub plan: LbcPlan,
}

/// Provider of PBMV blocks (primary column), keyed by column and block.
pub trait PackedMaskSource: Sync {
    fn packed_mask(&self, column: &str, block: usize) -> Result<Ciphertext>;
    fn block_count(&self) -> usize;
}

/// Provider of BBMV blocks (secondary columns, target value baked in at
/// encryption), keyed by column and block.
pub trait ScaledMaskSource: Sync {
    fn scaled_mask(&self, column: &str, block: usize) -> Result<Ciphertext>;
    fn block_count(&self) -> usize;
}

/// PBMV slot values for a primary column: `2^(δ + Δ·(v−1))` per valid
/// category value, 0 for anything out of range. Data-owner side of the
/// encoding contract.
pub fn encode_pbmv(values: &[u32], categories: usize, config: &LbcConfig) -> Vec<f64> {
    values
        .iter()
        .map(|&v| {
            if v >= 1 && v as usize <= categories {
                let exp = config.bit_offset + config.bit_spacing * (v - 1);
                (2.0f64).powi(exp as i32)
            } else {
                0.0
            }
        })
        .collect()
}

/// BBMV slot values for a secondary column: `2^Λ` where the row carries
/// the target value, 0 otherwise.
pub fn encode_bbmv(values: &[u32], target: u32, config: &LbcConfig) -> Vec<f64> {
    let scale = (2.0f64).powi(config.scale_shift as i32);
    values
        .iter()
        .map(|&v| if v == target { scale } else { 0.0 })
        .collect()
}

/// Runs the packed contingency pass: per block,
/// `r_b = pbmv_b · validity_b · ∏_c bbmv_c_b`, then the blocks are
/// summed into one ciphertext. There is no slot reduction; accumulation
/// across slots is the decryptor's job.
pub fn large_bin_count<P, S>(
    eval: &Evaluator,
    primary: &str,
    secondary_columns: &[String],
    pbmv_source: &P,
    bbmv_source: &S,
    validity_blocks: &[Ciphertext],
    categories: usize,
    rows: usize,
    config: &LbcConfig,
) -> Result<LbcResult>
where
    P: PackedMaskSource,
    S: ScaledMaskSource,
{
    let slots = eval.slots();
    config.validate_budget(categories, secondary_columns.len(), slots)?;

    let blocks = pbmv_source.block_count();
    if blocks == 0 || validity_blocks.len() != blocks || bbmv_source.block_count() != blocks {
        return Err(StatError::ShapeMismatch {
            context: format!(
                "packed bin count on {primary}: {} pbmv / {} validity / {} bbmv blocks",
                blocks,
                validity_blocks.len(),
                bbmv_source.block_count()
            ),
        });
    }
    if rows > blocks * slots {
        return Err(StatError::ShapeMismatch {
            context: format!(
                "packed bin count on {primary}: {rows} rows exceed {} block slots",
                blocks * slots
            ),
        });
    }

    let products: Vec<Ciphertext> = validity_blocks
        .par_iter()
        .enumerate()
        .map(|(b, validity)| {
            let ctx = format!("column {primary} block {b}");
            let pbmv = pbmv_source
                .packed_mask(primary, b)
                .map_err(|e| e.in_context(&ctx))?;
            let mut product = eval
                .mul_rescale(&pbmv, validity)
                .map_err(|e| e.in_context(&ctx))?;
            for column in secondary_columns {
                let ctx = format!("column {column} block {b}");
                let bbmv = bbmv_source
                    .scaled_mask(column, b)
                    .map_err(|e| e.in_context(&ctx))?;
                product = eval
                    .mul_rescale(&product, &bbmv)
                    .map_err(|e| e.in_context(&ctx))?;
            }
            Ok(product)
        })
        .collect::<Result<_>>()?;

    let mut iter = products.into_iter();
    let first = iter.next().expect("block count checked nonzero");
    let packed = iter.try_fold(first, |acc, ct| eval.add(&acc, &ct))?;

    Ok(LbcResult {
        packed,
        plan: LbcPlan {
            config: *config,
            categories,
            secondaries: secondary_columns.len(),
            slots,
            rows,
            requires_aggregation: needs_post_aggregation(rows, slots, config.bit_spacing),
        },
    })
}

/// Post-decryption aggregation: rounds each slot, peels the per-category
/// bit-fields, and returns the cell counts for the run's secondary
/// target combination, indexed by primary value − 1.
///
/// Only aggregated cells leave this function, which is what the
/// `requires_aggregation` contract demands of the decryptor.
pub fn aggregate_slots(plan: &LbcPlan, slots: &[f64]) -> Result<Vec<u64>> {
    let shift = plan.config.bit_offset + plan.config.scale_shift * plan.secondaries as u32;
    let field_mask = (1u128 << plan.config.bit_spacing) - 1;

    let mut cells = vec![0u64; plan.categories];
    for &slot in slots {
        let rounded = slot.round();
        if rounded < 0.5 {
            continue;
        }
        if rounded >= (2.0f64).powi(63) {
            return Err(StatError::InvalidConfiguration {
                reason: format!("decrypted slot value {rounded} exceeds the decomposable range"),
            });
        }
        let fields = (rounded as u128) >> shift;
        for (v, cell) in cells.iter_mut().enumerate() {
            *cell += ((fields >> (plan.config.bit_spacing as usize * v)) & field_mask) as u64;
        }
    }
    Ok(cells)
}
