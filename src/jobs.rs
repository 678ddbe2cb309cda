//! Job requests, validation, and planning
//!
//! A job names one statistical operation over columns of one encrypted
//! table. Requests arrive as JSON from the external parser; everything
//! (per-operation arity, percentile bounds, condition lists) is
//! validated here before any block is loaded.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StatError};

/// The statistical operation a job requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Mean,
    #[serde(rename = "var")]
    Variance,
    Stdev,
    Corr,
    Bc,
    Ba,
    Bv,
    Lbc,
    Percentile,
    Lookup,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Mean => "mean",
            Operation::Variance => "var",
            Operation::Stdev => "stdev",
            Operation::Corr => "corr",
            Operation::Bc => "bc",
            Operation::Ba => "ba",
            Operation::Bv => "bv",
            Operation::Lbc => "lbc",
            Operation::Percentile => "percentile",
            Operation::Lookup => "lookup",
        }
    }
}

/// A categorical filter `column = value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCondition {
    pub column: String,
    pub value: u32,
}

/// One statistical computation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub op: Operation,
    pub table: String,
    #[serde(default)]
    pub input_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
    /// Percentile target, in (0, 100].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<f64>,
    /// Category value for lookup jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_value: Option<i64>,
}

impl JobSpec {
    fn invalid(&self, reason: String) -> StatError {
        StatError::InvalidConfiguration {
            reason: format!("job {}: {reason}", self.id),
        }
    }

    /// Checks the request is well-formed for its operation.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(StatError::InvalidConfiguration {
                reason: "job id is required".into(),
            });
        }
        if self.table.is_empty() {
            return Err(self.invalid("table name is required".into()));
        }

        match self.op {
            Operation::Mean | Operation::Variance | Operation::Stdev => {
                if self.input_columns.len() != 1 {
                    return Err(self.invalid(format!(
                        "{} requires exactly one input column",
                        self.op.as_str()
                    )));
                }
            }
            Operation::Corr => {
                if self.input_columns.len() != 2 {
                    return Err(self.invalid("corr requires exactly two input columns".into()));
                }
            }
            Operation::Bc => {
                if self.conditions.is_empty() {
                    return Err(self.invalid("bc requires at least one condition".into()));
                }
                if self.target_column.is_some() {
                    return Err(self.invalid("bc takes no target column".into()));
                }
            }
            Operation::Ba | Operation::Bv => {
                if self.conditions.is_empty() {
                    return Err(self.invalid(format!(
                        "{} requires at least one condition",
                        self.op.as_str()
                    )));
                }
                if self.target_column.is_none() {
                    return Err(self.invalid(format!(
                        "{} requires a target column",
                        self.op.as_str()
                    )));
                }
            }
            Operation::Lbc => {
                if self.input_columns.len() < 2 {
                    return Err(self.invalid(
                        "lbc requires a primary and at least one secondary column".into(),
                    ));
                }
            }
            Operation::Percentile => {
                if self.input_columns.len() != 1 {
                    return Err(
                        self.invalid("percentile requires exactly one ordinal column".into())
                    );
                }
                match self.k {
                    Some(k) if k > 0.0 && k <= 100.0 => {}
                    Some(k) => {
                        return Err(self.invalid(format!("k must be in (0, 100], got {k}")));
                    }
                    None => return Err(self.invalid("percentile requires k".into())),
                }
            }
            Operation::Lookup => {
                if self.input_columns.len() != 1 {
                    return Err(
                        self.invalid("lookup requires exactly one categorical column".into())
                    );
                }
                if self.target_column.is_none() {
                    return Err(self.invalid("lookup requires a target column".into()));
                }
                if self.lookup_value.is_none() {
                    return Err(self.invalid("lookup requires a lookup_value".into()));
                }
            }
        }
        Ok(())
    }
}

/// Parses and validates a job from JSON.
pub fn parse_job<R: Read>(reader: R) -> Result<JobSpec> {
    let job: JobSpec = serde_json::from_reader(reader)?;
    job.validate()?;
    Ok(job)
}

/// Loads a job specification file.
pub fn load_job(path: &Path) -> Result<JobSpec> {
    parse_job(BufReader::new(File::open(path)?))
}

/// Saves a job specification as pretty JSON.
pub fn save_job(path: &Path, job: &JobSpec) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, job)?;
    writer.flush()?;
    Ok(())
}

/// A batch of jobs, validated together before any runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub jobs: Vec<JobSpec>,
}

/// Loads a batch file, validating every entry up front.
pub fn load_batch(path: &Path) -> Result<BatchJob> {
    let batch: BatchJob = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    for (i, job) in batch.jobs.iter().enumerate() {
        job.validate()
            .map_err(|e| e.in_context(&format!("batch entry {i}")))?;
    }
    Ok(batch)
}

/// One step in a human-readable execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub name: &'static str,
    pub description: &'static str,
}

/// Execution plan for a validated job.
#[derive(Debug, Clone, Serialize)]
pub struct JobPlan {
    pub job_id: String,
    pub steps: Vec<PlanStep>,
}

fn step(name: &'static str, description: &'static str) -> PlanStep {
    PlanStep { name, description }
}

/// Builds the step plan for a job.
pub fn plan_job(job: &JobSpec) -> Result<JobPlan> {
    job.validate()?;
    let steps = match job.op {
        Operation::Mean => vec![
            step("load", "load data and validity blocks"),
            step("masked_sum", "sum x·v across blocks and slots"),
            step("count", "sum v across blocks and slots"),
            step("inverse", "Newton reciprocal of the count"),
            step("combine", "mean = sum · 1/count"),
        ],
        Operation::Variance => vec![
            step("load", "load data and validity blocks"),
            step("mean", "compute the mean"),
            step("sum_squares", "sum x²·v across blocks and slots"),
            step("inverse", "Newton reciprocal of the count"),
            step("combine", "variance = E[X²] − E[X]²"),
        ],
        Operation::Stdev => vec![
            step("load", "load data and validity blocks"),
            step("variance", "compute the variance"),
            step("inverse_sqrt", "Newton reciprocal square root"),
            step("combine", "stdev = var · var^(-1/2)"),
        ],
        Operation::Corr => vec![
            step("load", "load both columns and the shared validity"),
            step("means", "compute both means"),
            step("covariance", "E[XY] − E[X]E[Y]"),
            step("variances", "compute both variances"),
            step("normalize", "cov · varX^(-1/2) · varY^(-1/2)"),
        ],
        Operation::Bc => vec![
            step("load", "load validity and condition mask blocks"),
            step("mask", "multiply masks into one filter"),
            step("count", "sum the filter across blocks and slots"),
        ],
        Operation::Ba => vec![
            step("load", "load target, validity, and mask blocks"),
            step("mask", "multiply masks into one filter"),
            step("mean", "mean of the target under the filter"),
        ],
        Operation::Bv => vec![
            step("load", "load target, validity, and mask blocks"),
            step("mask", "multiply masks into one filter"),
            step("variance", "variance of the target under the filter"),
        ],
        Operation::Lbc => vec![
            step("plan", "check the packed exponent budget"),
            step("load", "load packed and scaled mask blocks"),
            step("multiply", "per-block packed products"),
            step("pack", "sum blocks into one packed ciphertext"),
        ],
        Operation::Percentile => vec![
            step("load", "load ordinal mask and validity blocks"),
            step("frequencies", "per-value masked counts"),
            step("cumulative", "build the cumulative histogram"),
            step("inverse", "Newton reciprocal of the total"),
            step("search", "sign-compare ratios against K/100"),
        ],
        Operation::Lookup => vec![
            step("load", "load categorical and target blocks"),
            step("equality", "equality-to-zero on the shifted column"),
            step("select", "multiply the indicator into the target"),
            step("reduce", "sum the selection into slot 0"),
        ],
    };
    Ok(JobPlan {
        job_id: job.id.clone(),
        steps,
    })
}
