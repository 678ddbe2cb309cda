//! Numeric aggregates over masked column blocks
//!
//! Mean, variance, standard deviation, and Pearson correlation over
//! aligned `(data, validity)` block pairs. All results land in slot 0
//! of a single ciphertext; the remaining slots are byproducts of the
//! rotation reduction and must be ignored.
//!
//! Per-block products fan out on the rayon pool; accumulation is a
//! sequential fold in block order so repeated runs of the same job
//! produce bit-identical sums.

use rayon::prelude::*;

use crate::backend::Ciphertext;
use crate::error::{Result, StatError};
use crate::eval::Evaluator;
use crate::ops::inverse::{inv_nth_root_bounded, InverseConfig};

/// Numeric aggregation operators bound to one evaluator.
pub struct NumericOps<'a> {
    eval: &'a Evaluator,
}

impl<'a> NumericOps<'a> {
    pub fn new(eval: &'a Evaluator) -> Self {
        Self { eval }
    }

    fn check_aligned(&self, lens: &[usize], what: &str) -> Result<()> {
        if lens.is_empty() || lens[0] == 0 {
            return Err(StatError::ShapeMismatch {
                context: format!("{what}: no blocks provided"),
            });
        }
        if lens.iter().any(|&l| l != lens[0]) {
            return Err(StatError::ShapeMismatch {
                context: format!("{what}: block counts {lens:?} disagree"),
            });
        }
        Ok(())
    }

    /// Folds per-block ciphertexts in block order.
    fn accumulate(&self, blocks: Vec<Ciphertext>) -> Result<Ciphertext> {
        let mut iter = blocks.into_iter();
        let first = iter.next().expect("accumulate called with blocks");
        iter.try_fold(first, |acc, ct| self.eval.add(&acc, &ct))
    }

    /// Σ xᵢ·vᵢ reduced into slot 0. One multiplication deep.
    pub fn masked_sum(&self, x_blocks: &[Ciphertext], v_blocks: &[Ciphertext]) -> Result<Ciphertext> {
        self.check_aligned(&[x_blocks.len(), v_blocks.len()], "masked sum")?;

        let masked: Vec<Ciphertext> = x_blocks
            .par_iter()
            .zip(v_blocks.par_iter())
            .enumerate()
            .map(|(b, (x, v))| {
                self.eval
                    .mul_rescale(x, v)
                    .map_err(|e| e.in_context(&format!("masked sum block {b}")))
            })
            .collect::<Result<_>>()?;

        let total = self.accumulate(masked)?;
        self.eval.sum_slots(&total)
    }

    /// Σ vᵢ reduced into slot 0. Zero multiplicative depth.
    pub fn count(&self, v_blocks: &[Ciphertext]) -> Result<Ciphertext> {
        self.check_aligned(&[v_blocks.len()], "count")?;
        let total = self.accumulate(v_blocks.to_vec())?;
        self.eval.sum_slots(&total)
    }

    /// Σ xᵢ²·vᵢ reduced into slot 0. Two multiplications deep.
    pub fn masked_sum_of_squares(
        &self,
        x_blocks: &[Ciphertext],
        v_blocks: &[Ciphertext],
    ) -> Result<Ciphertext> {
        self.check_aligned(&[x_blocks.len(), v_blocks.len()], "masked sum of squares")?;

        let masked: Vec<Ciphertext> = x_blocks
            .par_iter()
            .zip(v_blocks.par_iter())
            .enumerate()
            .map(|(b, (x, v))| {
                let ctx = format!("masked sum of squares block {b}");
                let squared = self.eval.mul_rescale(x, x).map_err(|e| e.in_context(&ctx))?;
                self.eval
                    .mul_rescale(&squared, v)
                    .map_err(|e| e.in_context(&ctx))
            })
            .collect::<Result<_>>()?;

        let total = self.accumulate(masked)?;
        self.eval.sum_slots(&total)
    }

    /// Σ xᵢ·yᵢ·vᵢ reduced into slot 0.
    pub fn masked_cross_sum(
        &self,
        x_blocks: &[Ciphertext],
        y_blocks: &[Ciphertext],
        v_blocks: &[Ciphertext],
    ) -> Result<Ciphertext> {
        self.check_aligned(
            &[x_blocks.len(), y_blocks.len(), v_blocks.len()],
            "masked cross sum",
        )?;

        let masked: Vec<Ciphertext> = x_blocks
            .par_iter()
            .zip(y_blocks.par_iter())
            .zip(v_blocks.par_iter())
            .enumerate()
            .map(|(b, ((x, y), v))| {
                let ctx = format!("masked cross sum block {b}");
                let xy = self.eval.mul_rescale(x, y).map_err(|e| e.in_context(&ctx))?;
                self.eval
                    .mul_rescale(&xy, v)
                    .map_err(|e| e.in_context(&ctx))
            })
            .collect::<Result<_>>()?;

        let total = self.accumulate(masked)?;
        self.eval.sum_slots(&total)
    }

    /// 1 / Σ vᵢ. The prescale bound is the slot capacity of the block
    /// set, which any actual count is below.
    fn inverse_count(&self, count: &Ciphertext, blocks: usize) -> Result<Ciphertext> {
        let capacity = (blocks * self.eval.slots()) as f64;
        inv_nth_root_bounded(self.eval, count, capacity, &InverseConfig::reciprocal())
    }

    /// Mean of `x` under the validity mask `v`: Σxv / Σv.
    ///
    /// The count must be positive (at least one valid row), otherwise
    /// the reciprocal is meaningless.
    pub fn mean(&self, x_blocks: &[Ciphertext], v_blocks: &[Ciphertext]) -> Result<Ciphertext> {
        let sum = self.masked_sum(x_blocks, v_blocks)?;
        let count = self.count(v_blocks)?;
        let inv_count = self.inverse_count(&count, v_blocks.len())?;
        self.eval.mul_rescale(&sum, &inv_count)
    }

    /// Variance of `x` under `v`: E[X²] − E[X]².
    pub fn variance(&self, x_blocks: &[Ciphertext], v_blocks: &[Ciphertext]) -> Result<Ciphertext> {
        let mean = self.mean(x_blocks, v_blocks)?;

        let sum_sq = self.masked_sum_of_squares(x_blocks, v_blocks)?;
        let count = self.count(v_blocks)?;
        let inv_count = self.inverse_count(&count, v_blocks.len())?;

        let e_x2 = self.eval.mul_rescale(&sum_sq, &inv_count)?;
        let mean_sq = self.eval.mul_rescale(&mean, &mean)?;
        self.eval.sub(&e_x2, &mean_sq)
    }

    /// Standard deviation of `x` under `v`.
    ///
    /// `value_bound` is the column's declared magnitude bound (from the
    /// table schema); it caps the variance at `value_bound²` for the
    /// reciprocal-square-root prescale. √var is produced as
    /// var · var^(-1/2), one multiplication past the variance.
    pub fn stdev(
        &self,
        x_blocks: &[Ciphertext],
        v_blocks: &[Ciphertext],
        value_bound: f64,
    ) -> Result<Ciphertext> {
        let variance = self.variance(x_blocks, v_blocks)?;
        let inv_sqrt = inv_nth_root_bounded(
            self.eval,
            &variance,
            value_bound * value_bound,
            &InverseConfig::reciprocal_sqrt(),
        )?;
        self.eval.mul_rescale(&variance, &inv_sqrt)
    }

    /// Pearson correlation of `x` and `y` under the shared mask `v`:
    /// (E[XY] − E[X]E[Y]) · varX^(-1/2) · varY^(-1/2).
    pub fn correlation(
        &self,
        x_blocks: &[Ciphertext],
        y_blocks: &[Ciphertext],
        v_blocks: &[Ciphertext],
        x_bound: f64,
        y_bound: f64,
    ) -> Result<Ciphertext> {
        let mean_x = self.mean(x_blocks, v_blocks)?;
        let mean_y = self.mean(y_blocks, v_blocks)?;

        let sum_xy = self.masked_cross_sum(x_blocks, y_blocks, v_blocks)?;
        let count = self.count(v_blocks)?;
        let inv_count = self.inverse_count(&count, v_blocks.len())?;
        let e_xy = self.eval.mul_rescale(&sum_xy, &inv_count)?;

        let ex_ey = self.eval.mul_rescale(&mean_x, &mean_y)?;
        let cov = self.eval.sub(&e_xy, &ex_ey)?;

        let var_x = self.variance(x_blocks, v_blocks)?;
        let var_y = self.variance(y_blocks, v_blocks)?;
        let inv_sx = inv_nth_root_bounded(
            self.eval,
            &var_x,
            x_bound * x_bound,
            &InverseConfig::reciprocal_sqrt(),
        )?;
        let inv_sy = inv_nth_root_bounded(
            self.eval,
            &var_y,
            y_bound * y_bound,
            &InverseConfig::reciprocal_sqrt(),
        )?;

        let partial = self.eval.mul_rescale(&cov, &inv_sx)?;
        let partial = self.eval.maybe_bootstrap(partial)?;
        self.eval.mul_rescale(&partial, &inv_sy)
    }
}

/// Plaintext mean for validation.
pub fn plaintext_mean(values: &[f64], valid: &[bool]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (v, &ok) in values.iter().zip(valid) {
        if ok {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Plaintext population variance for validation.
pub fn plaintext_variance(values: &[f64], valid: &[bool]) -> f64 {
    let mean = plaintext_mean(values, valid);
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for (v, &ok) in values.iter().zip(valid) {
        if ok {
            let d = v - mean;
            sum_sq += d * d;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum_sq / count as f64
    }
}

/// Plaintext standard deviation for validation.
pub fn plaintext_stdev(values: &[f64], valid: &[bool]) -> f64 {
    plaintext_variance(values, valid).sqrt()
}

/// Plaintext Pearson correlation for validation.
pub fn plaintext_correlation(x: &[f64], y: &[f64], valid: &[bool]) -> f64 {
    let mean_x = plaintext_mean(x, valid);
    let mean_y = plaintext_mean(y, valid);
    let mut sum_xy = 0.0;
    let mut sum_x2 = 0.0;
    let mut sum_y2 = 0.0;
    for ((&a, &b), &ok) in x.iter().zip(y).zip(valid) {
        if ok {
            let dx = a - mean_x;
            let dy = b - mean_y;
            sum_xy += dx * dy;
            sum_x2 += dx * dx;
            sum_y2 += dy * dy;
        }
    }
    if sum_x2 == 0.0 || sum_y2 == 0.0 {
        0.0
    } else {
        sum_xy / (sum_x2.sqrt() * sum_y2.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Profile;

    fn evaluator() -> Evaluator {
        Evaluator::new(Profile::custom(8, 20, 45, true).unwrap()).unwrap()
    }

    fn encrypt_column(eval: &Evaluator, values: &[f64]) -> Ciphertext {
        eval.backend().encrypt_values(values)
    }

    fn validity(eval: &Evaluator, n: usize) -> Ciphertext {
        encrypt_column(eval, &vec![1.0; n])
    }

    #[test]
    fn count_is_exact_for_a_prefix_mask() {
        let eval = evaluator();
        let ops = NumericOps::new(&eval);
        let v = validity(&eval, 37);
        let count = ops.count(&[v]).unwrap();
        let got = eval.backend().decrypt(&count)[0];
        assert!((got - 37.0).abs() < 1e-9);
    }

    #[test]
    fn masked_sum_skips_invalid_rows() {
        let eval = evaluator();
        let ops = NumericOps::new(&eval);
        let x = encrypt_column(&eval, &[10.0, 20.0, 30.0]);
        let v = encrypt_column(&eval, &[1.0, 0.0, 1.0]);
        let sum = ops.masked_sum(&[x], &[v]).unwrap();
        assert!((eval.backend().decrypt(&sum)[0] - 40.0).abs() < 1e-9);
    }

    #[test]
    fn mean_of_income_column() {
        let eval = evaluator();
        let ops = NumericOps::new(&eval);
        let x = encrypt_column(&eval, &[100.0, 200.0, 300.0, 400.0, 500.0]);
        let v = validity(&eval, 5);
        let mean = ops.mean(&[x], &[v]).unwrap();
        let got = eval.backend().decrypt(&mean)[0];
        assert!((got - 300.0).abs() < 0.01, "mean came out as {got}");
    }

    #[test]
    fn mean_is_linear() {
        let eval = evaluator();
        let ops = NumericOps::new(&eval);
        let xs = [3.0, 5.0, 7.0, 11.0];
        let ys = [2.0, 4.0, 8.0, 16.0];
        let (alpha, beta) = (2.5, -1.5);

        let combined: Vec<f64> = xs.iter().zip(&ys).map(|(x, y)| alpha * x + beta * y).collect();
        let v = validity(&eval, 4);

        let lhs = ops
            .mean(&[encrypt_column(&eval, &combined)], &[v.clone()])
            .unwrap();
        let mean_x = ops.mean(&[encrypt_column(&eval, &xs)], &[v.clone()]).unwrap();
        let mean_y = ops.mean(&[encrypt_column(&eval, &ys)], &[v]).unwrap();

        let lhs_val = eval.backend().decrypt(&lhs)[0];
        let rhs_val = alpha * eval.backend().decrypt(&mean_x)[0]
            + beta * eval.backend().decrypt(&mean_y)[0];
        assert!((lhs_val - rhs_val).abs() < 1e-6);
    }

    #[test]
    fn variance_matches_plaintext_and_is_nonnegative() {
        let eval = evaluator();
        let ops = NumericOps::new(&eval);
        let values = [1.0, 4.0, 2.0, 8.0, 5.0, 7.0];
        let valid = [true; 6];
        let x = encrypt_column(&eval, &values);
        let v = validity(&eval, 6);
        let var = ops.variance(&[x], &[v]).unwrap();
        let got = eval.backend().decrypt(&var)[0];
        let expected = plaintext_variance(&values, &valid);
        assert!((got - expected).abs() < 1e-4, "{got} vs {expected}");
        assert!(got >= -1e-6);
    }

    #[test]
    fn variance_of_a_constant_column_is_zero() {
        let eval = evaluator();
        let ops = NumericOps::new(&eval);
        let x = encrypt_column(&eval, &[42.0; 8]);
        let v = validity(&eval, 8);
        let var = ops.variance(&[x], &[v]).unwrap();
        assert!(eval.backend().decrypt(&var)[0].abs() < 1e-4);
    }

    #[test]
    fn stdev_matches_plaintext() {
        let eval = evaluator();
        let ops = NumericOps::new(&eval);
        let values = [100.0, 200.0, 300.0, 400.0, 500.0];
        let x = encrypt_column(&eval, &values);
        let v = validity(&eval, 5);
        let sd = ops.stdev(&[x], &[v], 1000.0).unwrap();
        let got = eval.backend().decrypt(&sd)[0];
        let expected = plaintext_stdev(&values, &[true; 5]);
        assert!((got - expected).abs() / expected < 1e-3, "{got} vs {expected}");
    }

    #[test]
    fn correlation_of_proportional_columns_is_one() {
        let eval = evaluator();
        let ops = NumericOps::new(&eval);
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let ys = [2.0, 4.0, 6.0, 8.0, 10.0, 12.0];
        let x = encrypt_column(&eval, &xs);
        let y = encrypt_column(&eval, &ys);
        let v = validity(&eval, 6);
        let corr = ops.correlation(&[x], &[y], &[v], 8.0, 16.0).unwrap();
        let got = eval.backend().decrypt(&corr)[0];
        assert!((got - 1.0).abs() < 0.01, "corr came out as {got}");
    }

    #[test]
    fn correlation_is_bounded_and_symmetric_in_self() {
        let eval = evaluator();
        let ops = NumericOps::new(&eval);
        let xs = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
        let x = encrypt_column(&eval, &xs);
        let v = validity(&eval, 8);
        let corr = ops
            .correlation(&[x.clone()], &[x], &[v], 16.0, 16.0)
            .unwrap();
        let got = eval.backend().decrypt(&corr)[0];
        assert!(got.abs() <= 1.0 + 1e-3);
        assert!((got - 1.0).abs() < 0.01);
    }

    #[test]
    fn block_count_mismatch_is_rejected() {
        let eval = evaluator();
        let ops = NumericOps::new(&eval);
        let x = encrypt_column(&eval, &[1.0]);
        let err = ops.masked_sum(&[x], &[]);
        assert!(matches!(err, Err(StatError::ShapeMismatch { .. })));
    }
}
