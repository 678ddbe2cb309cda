//! cipherstat: statistical aggregates over CKKS-encrypted tables
//!
//! Computes mean, variance, standard deviation, Pearson correlation,
//! categorical bin statistics, packed contingency tables, and ordinal
//! percentiles over tabular data that is never decrypted during the
//! computation. Columns arrive packed into ciphertext slots (one row
//! per slot, ⌈R/S⌉ blocks per column) together with {0,1} validity
//! vectors and per-value bit-masks; every operator returns a single
//! ciphertext whose slot 0 carries the result.
//!
//! Key components:
//! - An evaluator façade with explicit level/scale tracking, operation
//!   counters, and centralized on-demand bootstrapping
//! - Newton-iterated reciprocal and reciprocal square root driving the
//!   division-free aggregates
//! - Polynomial approximations of the integer equality indicator and
//!   the sign function, powering lookups and percentile search
//! - Bit-field-packed contingency encodings whose aggregation finishes
//!   after decryption
//!
//! Ingestion, key management, and decryption belong to the data-owner
//! and decryption-authority tooling; this crate consumes their stored
//! blocks and produces result ciphertexts for them.

pub mod backend;
pub mod driver;
pub mod error;
pub mod eval;
pub mod jobs;
pub mod ops;
pub mod params;
pub mod schema;
pub mod storage;

pub use backend::{Ciphertext, CkksBackend, Plaintext};
pub use error::{Result, StatError};
pub use eval::{CounterSnapshot, Evaluator, OpCounters};
pub use params::{Profile, ProfileKind};

pub use ops::approx::{approx_sign, compare, discrete_equal_zero, DezConfig, SignConfig};
pub use ops::categorical::{
    encode_bmv, encode_validity, CategoricalOps, Condition, MaskSource,
};
pub use ops::inverse::{inv_nth_root, inv_nth_root_bounded, InverseConfig};
pub use ops::lbc::{
    aggregate_slots, encode_bbmv, encode_pbmv, large_bin_count, LbcConfig, LbcPlan, LbcResult,
};
pub use ops::numeric::NumericOps;
pub use ops::ordinal::{percentile, PercentileConfig};
