use crate::interval::Interval;
use thiserror::Error;

/// Failure taxonomy of the integration engine.
///
/// Every public operation either returns a valid enclosing result or one of
/// these errors; a silently non-enclosing result is never produced.
#[derive(Debug, Clone, Error)]
pub enum SolverError {
    /// The vector field reported a singularity or domain violation for the
    /// enclosure it was evaluated on. Fatal for the current step.
    #[error("vector field evaluation failed: {reason}")]
    FieldEvaluation { reason: String },

    /// The step controller could not certify any step above the admissible
    /// minimum. Recoverable: the caller may raise the order or widen the
    /// tolerance and retry.
    #[error("no admissible step at t = {time} (last trial step {step:e})")]
    StepTooSmall { time: f64, step: f64 },

    /// An enclosure width crossed the configured sanity cap; the rigorous
    /// bound has degenerated and further results would be meaningless.
    #[error("enclosure width {width:e} exceeds the blow-up cap {cap:e} at t = {time}")]
    EnclosureBlowup { time: f64, width: f64, cap: f64 },

    /// The time map stalled before the target time. Carries the time that
    /// was reached and the enclosure of the state there.
    #[error("integration reached t = {reached} of requested {target}")]
    NonConvergence {
        reached: f64,
        target: f64,
        partial: Vec<Interval>,
    },

    /// Input dimensions do not match the vector field.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}
