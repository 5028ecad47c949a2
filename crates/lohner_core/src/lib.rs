pub mod doubleton;
pub mod enclosure;
pub mod equation;
pub mod errors;
pub mod field;
pub mod interval;
pub mod linalg;
pub mod solver;
pub mod step_control;
pub mod timemap;
/// The `lohner_core` crate provides rigorous (interval-enclosure) Taylor
/// integration of ODEs and their first-order variational equations, for use
/// in computer-assisted proofs about dynamical systems.
///
/// Key components:
/// - **Interval**: closed f64 intervals with outward-rounded arithmetic.
/// - **Equation engine**: vector fields compiled from a textual
///   specification into a Taylor-jet register program, giving the
///   coefficient recurrence by automatic differentiation.
/// - **Solvers**: a non-rigorous `PointSolver` over any scalar, and the
///   rigorous `OdeSolver` producing enclosures of the image, the flow
///   derivative and the truncation remainder per step.
/// - **Doubleton sets**: `x + C·r0 + B·r` affine representations that
///   absorb local error directionally, keeping the wrapping effect
///   sub-exponential over long integrations.
/// - **TimeMap**: drives a solver to an arbitrary target time with exact
///   landing and partial-progress error reporting.
pub mod traits;
