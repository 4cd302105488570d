use thiserror::Error;

/// Fatal simulator-core errors.
///
/// Numerical faults discovered during residual evaluation (NaN/Inf
/// residuals, overly large residuals) are not represented here; they are
/// reported through the convergence report so the outer Newton loop can
/// cut the step. Everything below ends the run.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("influence table needs at least {required} samples for order {order}, got {actual}")]
    InsufficientSamples {
        required: usize,
        actual: usize,
        order: usize,
    },

    #[error("influence table samples must be strictly increasing in tD (violated at index {index})")]
    NonIncreasingSamples { index: usize },

    #[error("least-squares fit is singular; samples do not determine the coefficients")]
    SingularFit,

    #[error("invalid face tag {0}, expected 0..=5")]
    InvalidFaceTag(usize),

    #[error("aquifer {aquifer}: influence-function denominator is nonpositive ({value}); the fit is invalid at this time")]
    InfluenceDenominator { aquifer: usize, value: f64 },

    #[error("aquifer {aquifer}: no connected boundary faces")]
    NoConnections { aquifer: usize },

    #[error("well group tree: unknown node '{0}'")]
    UnknownNode(String),

    #[error("well group tree: duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("well group tree must have exactly one root, found {0}")]
    RootCount(usize),

    #[error("group '{group}': aggregate guide rate is zero with nonzero target {target}")]
    ZeroGuideRate { group: String, target: f64 },

    #[error("'{node}': control mode {mode} cannot be applied as a group target")]
    UnhandledMode { node: String, mode: String },

    #[error("segment {segment}: {reason}")]
    InvalidSegment { segment: usize, reason: String },

    #[error("{0}")]
    Validation(String),
}
