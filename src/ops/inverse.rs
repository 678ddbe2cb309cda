//! Newton-iterated inverse n-th root
//!
//! Computes y ≈ x^(-1/n) for n ∈ {1, 2} with the recurrence
//! `y ← y · ((n+1) − x · yⁿ) / n`, entirely in ciphertext space.
//!
//! The recurrence converges only when the input is scaled into the
//! region around the initial guess: with y₀ = 0.5, the reciprocal
//! needs x ∈ (0, 4) and the reciprocal square root x ∈ (0, 3/y₀²).
//! Callers therefore fold a power-of-two bound before the loop, which
//! [`inv_nth_root_bounded`] does for them: scale by 2^-m, iterate,
//! unscale by 2^(-m/n). The aggregators derive m from the slot
//! capacity (counts) or the column's declared value bound (variances).
//!
//! A zero anywhere in the input makes the reciprocal meaningless for
//! that slot; callers guarantee nonzero denominators (counts are only
//! inverted when the job implies a populated table).

use crate::backend::Ciphertext;
use crate::error::{Result, StatError};
use crate::eval::Evaluator;

/// Newton iteration parameters.
#[derive(Debug, Clone, Copy)]
pub struct InverseConfig {
    /// Root power: 1 for the reciprocal, 2 for the reciprocal square root.
    pub n: u32,
    /// Newton iterations.
    pub iterations: usize,
    /// Bootstrap cadence: refresh the estimate every this many
    /// iterations when it has dropped to the threshold. 0 disables the
    /// cadence check (the per-step checks still run).
    pub bootstrap_every: usize,
    /// Initial estimate y₀, broadcast to every slot.
    pub initial_guess: f64,
}

impl InverseConfig {
    /// Reciprocal defaults: n=1, 25 iterations, refresh cadence 5, y₀ = 0.5.
    pub fn reciprocal() -> Self {
        Self {
            n: 1,
            iterations: 25,
            bootstrap_every: 5,
            initial_guess: 0.5,
        }
    }

    /// Reciprocal square root defaults: n=2, 21 iterations, cadence 5, y₀ = 0.5.
    pub fn reciprocal_sqrt() -> Self {
        Self {
            n: 2,
            iterations: 21,
            bootstrap_every: 5,
            initial_guess: 0.5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n < 1 {
            return Err(StatError::InvalidConfiguration {
                reason: "inverse root power must be positive".into(),
            });
        }
        if self.iterations == 0 {
            return Err(StatError::InvalidConfiguration {
                reason: "inverse iteration count must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Runs the raw Newton loop. The caller is responsible for having
/// scaled `x` into the convergence region (see the module docs);
/// prefer [`inv_nth_root_bounded`] unless the input is already there.
pub fn inv_nth_root(eval: &Evaluator, x: &Ciphertext, config: &InverseConfig) -> Result<Ciphertext> {
    config.validate()?;

    // One refresh up front so the first squarings have room.
    let x = eval.maybe_bootstrap(x.clone())?;

    let n_plus_one = (config.n + 1) as f64;
    let inv_n = 1.0 / config.n as f64;

    let mut y = eval.constant_like(&x, config.initial_guess);

    for iter in 0..config.iterations {
        if config.bootstrap_every > 0
            && iter > 0
            && iter % config.bootstrap_every == 0
            && eval.needs_bootstrap(&y)
        {
            if !eval.can_bootstrap() {
                return Err(StatError::BootstrapUnavailable {
                    context: format!("newton iteration {iter}"),
                });
            }
            y = eval.bootstrap(&y)?;
        }

        let y_n = if config.n == 1 {
            y.clone()
        } else {
            eval.power(&y, config.n)?
        };

        let t = eval.mul_rescale(&x, &y_n)?;
        let t = eval.maybe_bootstrap(t)?;

        // (n+1) - x*y^n, realized as -((x*y^n) - (n+1)).
        let u = eval.mul_const(&eval.add_const(&t, -n_plus_one), -1.0);

        let y_next = eval.mul_rescale(&y, &u)?;
        let y_next = eval.maybe_bootstrap(y_next)?;

        y = eval.mul_const(&y_next, inv_n);
    }

    eval.backend()
        .check_finite(&y, "inverse n-th root estimate")?;
    Ok(y)
}

/// Scales `x` by 2^-m (m = ⌈log₂ bound⌉) so the Newton loop converges
/// for any input in (0, bound], then unscales the estimate by
/// 2^(-m/n).
pub fn inv_nth_root_bounded(
    eval: &Evaluator,
    x: &Ciphertext,
    bound: f64,
    config: &InverseConfig,
) -> Result<Ciphertext> {
    config.validate()?;
    if !(bound > 0.0) || !bound.is_finite() {
        return Err(StatError::InvalidConfiguration {
            reason: format!("inverse input bound must be positive and finite, got {bound}"),
        });
    }

    let m = bound.log2().ceil().max(0.0);
    let scaled = eval.mul_const(x, (-m).exp2());
    let y = inv_nth_root(eval, &scaled, config)?;
    Ok(eval.mul_const(&y, (-m / config.n as f64).exp2()))
}
