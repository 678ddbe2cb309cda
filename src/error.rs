//! Error kinds for encrypted statistics
//!
//! Every operator failure carries a named kind plus enough context to
//! identify the offending column and block. Backend primitive failures
//! are wrapped, never swallowed; configuration problems are reported
//! before any ciphertext work starts.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StatError>;

/// Failure kinds reported by the operator library.
#[derive(Debug)]
pub enum StatError {
    /// Block counts, slot counts, or category counts disagree between inputs.
    ShapeMismatch { context: String },

    /// A multiplication or rescale was requested on a ciphertext below the
    /// minimum viable level and bootstrapping cannot recover it.
    InsufficientLevel {
        level: usize,
        min_level: usize,
        context: String,
    },

    /// An operator step requires bootstrapping on a profile that has it
    /// disabled.
    BootstrapUnavailable { context: String },

    /// A configuration was rejected at planning time (exponent budget,
    /// percentile bounds, missing target column, ...).
    InvalidConfiguration { reason: String },

    /// A Newton iteration produced a non-finite slot value.
    DivergedEstimate { context: String },

    /// An approximation iteration count is below the configured minimum
    /// for the given category count.
    ApproximationBrittle {
        parameter: &'static str,
        minimum: usize,
        actual: usize,
    },

    /// Storage or serialization failure.
    Io(std::io::Error),
}

impl StatError {
    /// Prepends caller context (column, block index) to the error's
    /// contextual message, leaving the kind untouched.
    pub fn in_context(mut self, extra: &str) -> Self {
        match &mut self {
            StatError::ShapeMismatch { context }
            | StatError::InsufficientLevel { context, .. }
            | StatError::BootstrapUnavailable { context }
            | StatError::DivergedEstimate { context } => {
                *context = if context.is_empty() {
                    extra.to_string()
                } else {
                    format!("{extra}: {context}")
                };
            }
            StatError::InvalidConfiguration { reason } => {
                *reason = format!("{extra}: {reason}");
            }
            StatError::Io(err) => {
                *err = std::io::Error::new(err.kind(), format!("{extra}: {err}"));
            }
            StatError::ApproximationBrittle { .. } => {}
        }
        self
    }
}

impl fmt::Display for StatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatError::ShapeMismatch { context } => {
                write!(f, "shape mismatch: {context}")
            }
            StatError::InsufficientLevel {
                level,
                min_level,
                context,
            } => write!(
                f,
                "insufficient level ({level} <= minimum {min_level}): {context}"
            ),
            StatError::BootstrapUnavailable { context } => {
                write!(f, "bootstrapping unavailable on this profile: {context}")
            }
            StatError::InvalidConfiguration { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
            StatError::DivergedEstimate { context } => {
                write!(f, "diverged estimate (non-finite slot value): {context}")
            }
            StatError::ApproximationBrittle {
                parameter,
                minimum,
                actual,
            } => write!(
                f,
                "approximation too brittle: {parameter} = {actual}, raise it to at least {minimum}"
            ),
            StatError::Io(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for StatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StatError {
    fn from(err: std::io::Error) -> Self {
        StatError::Io(err)
    }
}

impl From<serde_json::Error> for StatError {
    fn from(err: serde_json::Error) -> Self {
        StatError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}
