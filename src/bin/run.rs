//! cipherstat-run: execute one statistical job over an encrypted table
//!
//! Loads a job specification, opens the table store it addresses, runs
//! the operator, and writes the result ciphertext with its metadata
//! sidecar. Decryption is someone else's key and someone else's
//! machine; nothing here can see the data.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use eyre::{eyre, Context, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cipherstat::driver::run_job;
use cipherstat::eval::Evaluator;
use cipherstat::jobs::{load_job, plan_job};
use cipherstat::params::Profile;
use cipherstat::storage::{write_result, TableStore};

#[derive(Parser)]
#[command(name = "cipherstat-run")]
#[command(about = "Run a statistical job over an encrypted table")]
#[command(version)]
struct Args {
    /// Path to the job specification JSON
    #[arg(long)]
    job: PathBuf,

    /// Path to the encrypted table directory
    #[arg(long)]
    table: PathBuf,

    /// Parameter profile: "a" (no bootstrap) or "b" (bootstrapped)
    #[arg(long, default_value = "b")]
    profile: String,

    /// Output directory for the result ciphertext and sidecar
    #[arg(long, default_value = "result")]
    output: PathBuf,

    /// Print the execution plan and exit without running
    #[arg(long)]
    plan_only: bool,
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let started = Instant::now();

    let job = load_job(&args.job)
        .with_context(|| format!("loading job from {}", args.job.display()))?;

    if args.plan_only {
        let plan = plan_job(&job)?;
        for step in &plan.steps {
            println!("{:12} {}", step.name, step.description);
        }
        return Ok(());
    }

    let profile = match args.profile.as_str() {
        "a" | "A" => Profile::profile_a(),
        "b" | "B" => Profile::profile_b(),
        other => return Err(eyre!("unknown profile {other}, expected \"a\" or \"b\"")),
    };

    let store = TableStore::open(&args.table)
        .with_context(|| format!("opening table at {}", args.table.display()))?;
    let eval = Evaluator::new(profile)?;

    let outcome = run_job(&eval, &store, &job)?;

    let result_path = write_result(
        &args.output,
        &job.id,
        job.op.as_str(),
        &outcome.result,
        outcome.counters,
    )?;

    if let Some(plan) = &outcome.lbc_plan {
        let plan_path = args.output.join("lbc_plan.json");
        std::fs::write(&plan_path, serde_json::to_vec_pretty(plan)?)?;
        info!(path = %plan_path.display(), "wrote decomposition plan");
    }

    info!(
        path = %result_path.display(),
        elapsed = ?started.elapsed(),
        muls = outcome.counters.mul_count,
        adds = outcome.counters.add_count,
        rotations = outcome.counters.rotate_count,
        rescales = outcome.counters.rescale_count,
        bootstraps = outcome.counters.bootstrap_count,
        "result written"
    );
    Ok(())
}
