use thiserror::Error;

/// Failures surfaced by the simulation core.
///
/// Step formulas and the error estimator propagate `Evaluation` unchanged;
/// the grid simulator wraps anything raised mid-run in `StepFailed` so the
/// failing interval can be reported without re-running.
#[derive(Error, Debug)]
pub enum Error {
    #[error("variable name \"{name}\" is already registered")]
    DuplicateName { name: String },

    #[error("unknown variable name \"{name}\"")]
    UnknownName { name: String },

    #[error("model is locked; variables cannot be added after the first evaluation")]
    Locked,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("time grid decreases at index {index}: {t_prev} -> {t_next}")]
    InvalidGrid {
        index: usize,
        t_prev: f64,
        t_next: f64,
    },

    #[error("model evaluation failed: {0}")]
    Evaluation(String),

    #[error("integration failed on grid interval {interval}")]
    StepFailed {
        interval: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("optimizer failed to converge: {status}")]
    SolverDiverged { status: String },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
