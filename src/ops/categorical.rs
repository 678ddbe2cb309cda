//! Categorical masking: bin-count, bin-average, bin-variance
//!
//! A condition list `(column = value, ...)` combines per-value
//! bit-mask vectors with the validity block into one {0,1}-valued mask
//! per block:
//!
//! ```text
//! m_b = v_b · ∏_j bmv[column_j][value_j][b]
//! ```
//!
//! Bin-count sums the mask, bin-average and bin-variance hand the mask
//! to the numeric aggregator as the validity input. Depth is one
//! multiplication per condition.

use rayon::prelude::*;

use crate::backend::Ciphertext;
use crate::error::{Result, StatError};
use crate::eval::Evaluator;
use crate::ops::numeric::NumericOps;

/// A single equality filter on a categorical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub column: String,
    pub value: u32,
}

/// Bit-mask slot values for one category value: 1 where the row
/// carries `value`, 0 elsewhere. Data-owner side of the mask contract;
/// one such vector per (column, value, block).
pub fn encode_bmv(values: &[u32], value: u32) -> Vec<f64> {
    values
        .iter()
        .map(|&v| if v == value { 1.0 } else { 0.0 })
        .collect()
}

/// Validity slot values: 1 for valid rows, 0 for missing or invalid
/// ones. Slots past the row count stay 0 through block padding.
pub fn encode_validity(valid: &[bool]) -> Vec<f64> {
    valid.iter().map(|&ok| if ok { 1.0 } else { 0.0 }).collect()
}

/// Provider of per-value bit-mask vector blocks, keyed by column,
/// category value, and block index. Implemented by the table store and
/// by in-memory fixtures.
pub trait MaskSource: Sync {
    fn mask(&self, column: &str, value: u32, block: usize) -> Result<Ciphertext>;
    fn block_count(&self) -> usize;
}

/// Categorical operators bound to one evaluator.
pub struct CategoricalOps<'a> {
    eval: &'a Evaluator,
    numeric: NumericOps<'a>,
}

impl<'a> CategoricalOps<'a> {
    pub fn new(eval: &'a Evaluator) -> Self {
        Self {
            eval,
            numeric: NumericOps::new(eval),
        }
    }

    /// Builds the combined mask for every block. Blocks are processed
    /// on the worker pool; each block's conditions multiply in listed
    /// order.
    pub fn build_mask<S: MaskSource>(
        &self,
        validity_blocks: &[Ciphertext],
        conditions: &[Condition],
        source: &S,
    ) -> Result<Vec<Ciphertext>> {
        if validity_blocks.is_empty() {
            return Err(StatError::ShapeMismatch {
                context: "mask build: no validity blocks".into(),
            });
        }
        if validity_blocks.len() != source.block_count() {
            return Err(StatError::ShapeMismatch {
                context: format!(
                    "mask build: {} validity blocks vs {} mask blocks",
                    validity_blocks.len(),
                    source.block_count()
                ),
            });
        }

        validity_blocks
            .par_iter()
            .enumerate()
            .map(|(b, validity)| {
                let mut mask = validity.clone();
                for cond in conditions {
                    let ctx = format!("column {} block {b}", cond.column);
                    let bmv = source
                        .mask(&cond.column, cond.value, b)
                        .map_err(|e| e.in_context(&ctx))?;
                    mask = self
                        .eval
                        .mul_rescale(&mask, &bmv)
                        .map_err(|e| e.in_context(&ctx))?;
                }
                Ok(mask)
            })
            .collect()
    }

    /// Count of rows matching every condition; an integer in slot 0,
    /// exact up to numeric noise.
    pub fn bin_count<S: MaskSource>(
        &self,
        validity_blocks: &[Ciphertext],
        conditions: &[Condition],
        source: &S,
    ) -> Result<Ciphertext> {
        let masks = self.build_mask(validity_blocks, conditions, source)?;
        self.numeric.count(&masks)
    }

    /// Mean of the target column over rows matching every condition.
    pub fn bin_average<S: MaskSource>(
        &self,
        target_blocks: &[Ciphertext],
        validity_blocks: &[Ciphertext],
        conditions: &[Condition],
        source: &S,
    ) -> Result<Ciphertext> {
        let masks = self.build_mask(validity_blocks, conditions, source)?;
        self.numeric.mean(target_blocks, &masks)
    }

    /// Variance of the target column over rows matching every condition.
    pub fn bin_variance<S: MaskSource>(
        &self,
        target_blocks: &[Ciphertext],
        validity_blocks: &[Ciphertext],
        conditions: &[Condition],
        source: &S,
    ) -> Result<Ciphertext> {
        let masks = self.build_mask(validity_blocks, conditions, source)?;
        self.numeric.variance(target_blocks, &masks)
    }
}

/// Plaintext bin-count for validation: `columns[j][i]` is row i of
/// condition j's column.
pub fn plaintext_bin_count(columns: &[Vec<u32>], wanted: &[u32], valid: &[bool]) -> usize {
    let mut count = 0;
    for i in 0..valid.len() {
        if valid[i] && columns.iter().zip(wanted).all(|(col, &w)| col[i] == w) {
            count += 1;
        }
    }
    count
}

/// Plaintext bin-average for validation.
pub fn plaintext_bin_average(
    target: &[f64],
    columns: &[Vec<u32>],
    wanted: &[u32],
    valid: &[bool],
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for i in 0..valid.len() {
        if valid[i] && columns.iter().zip(wanted).all(|(col, &w)| col[i] == w) {
            sum += target[i];
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Profile;
    use std::collections::HashMap;

    /// In-memory mask provider for tests: one block, masks keyed by
    /// (column, value).
    struct MemoryMasks {
        backend: crate::backend::CkksBackend,
        masks: HashMap<(String, u32), Vec<f64>>,
    }

    impl MemoryMasks {
        fn from_columns(eval: &Evaluator, columns: &[(&str, Vec<u32>, u32)]) -> Self {
            // (name, values, category count)
            let mut masks = HashMap::new();
            for (name, values, categories) in columns {
                for value in 1..=*categories {
                    masks.insert((name.to_string(), value), encode_bmv(values, value));
                }
            }
            Self {
                backend: eval.backend().clone(),
                masks,
            }
        }
    }

    impl MaskSource for MemoryMasks {
        fn mask(&self, column: &str, value: u32, _block: usize) -> Result<Ciphertext> {
            let slots = self.masks.get(&(column.to_string(), value)).ok_or_else(|| {
                StatError::ShapeMismatch {
                    context: format!("no mask for {column}={value}"),
                }
            })?;
            Ok(self.backend.encrypt_values(slots))
        }

        fn block_count(&self) -> usize {
            1
        }
    }

    fn evaluator() -> Evaluator {
        Evaluator::new(Profile::custom(8, 20, 45, true).unwrap()).unwrap()
    }

    #[test]
    fn bin_count_matches_the_survey_example() {
        let eval = evaluator();
        let ops = CategoricalOps::new(&eval);

        let gender = vec![1u32, 2, 1, 2, 1, 2];
        let region = vec![1u32, 2, 3, 2, 1, 2];
        let source = MemoryMasks::from_columns(&eval, &[
            ("gender", gender.clone(), 2),
            ("region", region.clone(), 3),
        ]);

        let validity = eval.backend().encrypt_values(&[1.0; 6]);
        let conditions = vec![
            Condition {
                column: "gender".into(),
                value: 2,
            },
            Condition {
                column: "region".into(),
                value: 2,
            },
        ];

        let count = ops.bin_count(&[validity], &conditions, &source).unwrap();
        let got = eval.backend().decrypt(&count)[0];
        let expected =
            plaintext_bin_count(&[gender, region], &[2, 2], &[true; 6]) as f64;
        assert_eq!(expected, 3.0);
        assert!((got - expected).abs() < 1e-6, "bin count {got}");
    }

    #[test]
    fn bin_average_matches_the_masked_subpopulation() {
        let eval = evaluator();
        let ops = CategoricalOps::new(&eval);

        let income = [100.0, 200.0, 300.0, 400.0, 500.0];
        let gender = vec![1u32, 2, 1, 2, 1];
        let source = MemoryMasks::from_columns(&eval, &[("gender", gender.clone(), 2)]);

        let target = eval.backend().encrypt_values(&income);
        let validity = eval.backend().encrypt_values(&[1.0; 5]);
        let conditions = vec![Condition {
            column: "gender".into(),
            value: 1,
        }];

        let ba = ops
            .bin_average(&[target], &[validity], &conditions, &source)
            .unwrap();
        let got = eval.backend().decrypt(&ba)[0];
        let expected =
            plaintext_bin_average(&income, &[gender], &[1], &[true; 5]);
        assert_eq!(expected, 300.0);
        assert!((got - expected).abs() < 1.0, "bin average {got}");
    }

    #[test]
    fn bin_variance_matches_the_masked_subpopulation() {
        let eval = evaluator();
        let ops = CategoricalOps::new(&eval);

        let income = [100.0, 200.0, 300.0, 400.0, 500.0];
        let gender = vec![1u32, 2, 1, 2, 1];
        let source = MemoryMasks::from_columns(&eval, &[("gender", gender.clone(), 2)]);

        let target = eval.backend().encrypt_values(&income);
        let validity = eval.backend().encrypt_values(&[1.0; 5]);
        let conditions = vec![Condition {
            column: "gender".into(),
            value: 1,
        }];

        let bv = ops
            .bin_variance(&[target], &[validity], &conditions, &source)
            .unwrap();
        let got = eval.backend().decrypt(&bv)[0];
        // Subpopulation {100, 300, 500}: variance 80000/3.
        let expected = crate::ops::numeric::plaintext_variance(
            &[100.0, 300.0, 500.0],
            &[true; 3],
        );
        assert!(
            (got - expected).abs() / expected < 1e-3,
            "bin variance {got} vs {expected}"
        );
    }

    #[test]
    fn encoders_mark_matching_rows() {
        assert_eq!(encode_bmv(&[1, 2, 1, 3], 1), vec![1.0, 0.0, 1.0, 0.0]);
        assert_eq!(
            encode_validity(&[true, false, true]),
            vec![1.0, 0.0, 1.0]
        );
    }

    #[test]
    fn block_count_mismatch_is_rejected() {
        let eval = evaluator();
        let ops = CategoricalOps::new(&eval);
        let source = MemoryMasks::from_columns(&eval, &[("gender", vec![1, 2], 2)]);
        let validity = eval.backend().encrypt_values(&[1.0; 2]);
        let err = ops.bin_count(&[validity.clone(), validity], &[], &source);
        assert!(matches!(err, Err(StatError::ShapeMismatch { .. })));
    }
}
