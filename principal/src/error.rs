use thiserror::Error;

/// The error taxonomy the core surfaces to its caller.
///
/// `Mismatch` deliberately has no variant here: per the design, a normal
/// resource mismatch is the "no operation" path and is represented as
/// `Ok(None)`, not an `Err`, so callers never have to special-case it out of
/// a `match` over real errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("run spec {run_spec_id} is neither an app nor a pod")]
    UnsupportedRunSpec { run_spec_id: String },

    #[error("run spec {run_spec_id} has no unreserved-eligible accepted role: {reason}")]
    ConfigurationUnmatchable { run_spec_id: String, reason: String },

    #[error("task builder failed for run spec {run_spec_id}: {reason}")]
    BuilderFailure { run_spec_id: String, reason: String },

    #[error("invariant violated: {description}")]
    Invariant { description: String },
}
