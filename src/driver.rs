//! Job execution
//!
//! The single entry point tying the pieces together: validate the
//! request against the table schema, load the encrypted blocks the
//! operation needs, invoke exactly one core operator, and hand back
//! the result ciphertext with a counters snapshot for the sidecar.
//! All ciphertext loading happens before the operator runs; the
//! operators themselves never touch I/O.

use tracing::info;

use crate::backend::Ciphertext;
use crate::error::{Result, StatError};
use crate::eval::{CounterSnapshot, Evaluator};
use crate::jobs::{JobSpec, Operation};
use crate::ops::approx::{select_equal, DezConfig};
use crate::ops::categorical::{CategoricalOps, Condition};
use crate::ops::lbc::{large_bin_count, LbcPlan};
use crate::ops::numeric::NumericOps;
use crate::ops::ordinal::{percentile, PercentileConfig};
use crate::schema::{Column, ColumnKind};
use crate::storage::TableStore;

/// What one job run produces.
pub struct JobOutcome {
    /// Slot 0 carries the scalar result; for packed bin counts the
    /// slots carry the bit-field contributions instead.
    pub result: Ciphertext,
    pub counters: CounterSnapshot,
    /// Decomposition plan for packed bin counts, recorded for the
    /// decryptor.
    pub lbc_plan: Option<LbcPlan>,
}

fn require_numerical<'a>(store: &'a TableStore, name: &str) -> Result<&'a Column> {
    let column = store.meta().schema.require_column(name)?;
    if column.kind != ColumnKind::Numerical {
        return Err(StatError::InvalidConfiguration {
            reason: format!("column {name} is not numerical"),
        });
    }
    Ok(column)
}

fn require_masked<'a>(store: &'a TableStore, name: &str, kind: ColumnKind) -> Result<&'a Column> {
    let column = store.meta().schema.require_column(name)?;
    if column.kind != kind {
        return Err(StatError::InvalidConfiguration {
            reason: format!("column {name} is not {kind:?}"),
        });
    }
    Ok(column)
}

fn check_conditions(store: &TableStore, job: &JobSpec) -> Result<Vec<Condition>> {
    job.conditions
        .iter()
        .map(|c| {
            let column = require_masked(store, &c.column, ColumnKind::Categorical)?;
            if c.value < 1 || c.value as usize > column.categories {
                return Err(StatError::InvalidConfiguration {
                    reason: format!(
                        "condition {}={} outside 1..={}",
                        c.column, c.value, column.categories
                    ),
                });
            }
            Ok(Condition {
                column: c.column.clone(),
                value: c.value,
            })
        })
        .collect()
}

/// Validates a job against the table and runs its operator.
pub fn run_job(eval: &Evaluator, store: &TableStore, job: &JobSpec) -> Result<JobOutcome> {
    job.validate()?;

    let meta = store.meta();
    if meta.schema.name != job.table {
        return Err(StatError::InvalidConfiguration {
            reason: format!(
                "job {} addresses table {}, store holds {}",
                job.id, job.table, meta.schema.name
            ),
        });
    }
    if meta.params_hash != eval.profile().params_hash() {
        return Err(StatError::InvalidConfiguration {
            reason: format!(
                "table {} was encrypted under parameter set {}, evaluator runs {}",
                job.table,
                &meta.params_hash[..16],
                &eval.profile().params_hash()[..16]
            ),
        });
    }

    info!(job = %job.id, op = job.op.as_str(), table = %job.table, "running job");

    let mut lbc_plan = None;
    let result = match job.op {
        Operation::Mean | Operation::Variance | Operation::Stdev => {
            let name = &job.input_columns[0];
            let column = require_numerical(store, name)?;
            let bound = column.value_bound;
            let x = store.load_column(name)?;
            let v = store.load_column_validity(name)?;
            let ops = NumericOps::new(eval);
            match job.op {
                Operation::Mean => ops.mean(&x, &v)?,
                Operation::Variance => ops.variance(&x, &v)?,
                _ => ops.stdev(&x, &v, bound)?,
            }
        }

        Operation::Corr => {
            let (x_name, y_name) = (&job.input_columns[0], &job.input_columns[1]);
            let x_bound = require_numerical(store, x_name)?.value_bound;
            let y_bound = require_numerical(store, y_name)?.value_bound;
            let x = store.load_column(x_name)?;
            let y = store.load_column(y_name)?;
            // Shared validity from the first column: rows missing either
            // column must be marked invalid there by the data owner.
            let v = store.load_column_validity(x_name)?;
            NumericOps::new(eval).correlation(&x, &y, &v, x_bound, y_bound)?
        }

        Operation::Bc | Operation::Ba | Operation::Bv => {
            let conditions = check_conditions(store, job)?;
            let validity_column = job
                .target_column
                .as_deref()
                .unwrap_or(&job.conditions[0].column);
            let v = store.load_column_validity(validity_column)?;
            let ops = CategoricalOps::new(eval);
            match job.op {
                Operation::Bc => ops.bin_count(&v, &conditions, store)?,
                _ => {
                    let target_name = job.target_column.as_deref().expect("validated");
                    require_numerical(store, target_name)?;
                    let target = store.load_column(target_name)?;
                    if job.op == Operation::Ba {
                        ops.bin_average(&target, &v, &conditions, store)?
                    } else {
                        ops.bin_variance(&target, &v, &conditions, store)?
                    }
                }
            }
        }

        Operation::Lbc => {
            let primary = &job.input_columns[0];
            let secondaries = job.input_columns[1..].to_vec();
            let column = require_masked(store, primary, ColumnKind::Categorical)?;
            // The bit-field geometry is agreed at encryption time and
            // travels with the table.
            let config = meta.lbc.ok_or_else(|| StatError::InvalidConfiguration {
                reason: format!("table {} carries no packed mask encodings", job.table),
            })?;
            let v = store.load_column_validity(primary)?;
            let outcome = large_bin_count(
                eval,
                primary,
                &secondaries,
                store,
                store,
                &v,
                column.categories,
                meta.rows,
                &config,
            )?;
            lbc_plan = Some(outcome.plan);
            outcome.packed
        }

        Operation::Percentile => {
            let name = &job.input_columns[0];
            let column = require_masked(store, name, ColumnKind::Ordinal)?;
            let v = store.load_column_validity(name)?;
            let config = PercentileConfig::new(job.k.expect("validated"), column.categories);
            percentile(eval, name, &v, store, &config)?
        }

        Operation::Lookup => {
            let name = &job.input_columns[0];
            let column = require_masked(store, name, ColumnKind::Categorical)?;
            let target_name = job.target_column.as_deref().expect("validated");
            require_numerical(store, target_name)?;

            let cat = store.load_column(name)?;
            let target = store.load_column(target_name)?;
            let config = DezConfig::for_categories(column.categories);
            let selected = select_equal(
                eval,
                &cat,
                job.lookup_value.expect("validated"),
                &target,
                &config,
            )?;

            // Reduce the selection to one scalar: the sum of the target
            // over matching rows, in slot 0.
            let mut iter = selected.into_iter();
            let first = iter.next().expect("at least one block");
            let total = iter.try_fold(first, |acc, ct| eval.add(&acc, &ct))?;
            eval.sum_slots(&total)?
        }
    };

    let counters = eval.counters().snapshot();
    info!(
        job = %job.id,
        muls = counters.mul_count,
        bootstraps = counters.bootstrap_count,
        level = result.level(),
        "job complete"
    );

    Ok(JobOutcome {
        result,
        counters,
        lbc_plan,
    })
}
