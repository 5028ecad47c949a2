use crate::errors::SolverError;
use crate::traits::Scalar;
use nalgebra::{DMatrix, DVector};

/// Capability contract the solvers require from a vector field evaluator.
///
/// An implementation must be deterministic and either total over the sets
/// the solver presents to it or fail explicitly with
/// [`SolverError::FieldEvaluation`]; it must never return an unrelated
/// value. The Taylor coefficient methods realize the recurrence
/// `a_{k+1} = L_k / (k+1)` by automatic differentiation through the field
/// expression, and for the variational case the matrix recurrence for
/// `Phi' = Df(x) Phi` along the same expansion.
pub trait VectorField<T: Scalar> {
    /// Dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates `f(t, x)` into `out`.
    fn eval(&mut self, t: T, x: &DVector<T>, out: &mut DVector<T>) -> Result<(), SolverError>;

    /// Evaluates the Jacobian `Df(t, x)`.
    fn jacobian(&mut self, t: T, x: &DVector<T>) -> Result<DMatrix<T>, SolverError>;

    /// Fills `coeffs[1..=order]` with the Taylor coefficients of the
    /// solution through `(t, coeffs[0])`.
    fn ode_coefficients(
        &mut self,
        t: T,
        coeffs: &mut [DVector<T>],
        order: usize,
    ) -> Result<(), SolverError>;

    /// As [`Self::ode_coefficients`], additionally filling
    /// `mat_coeffs[1..=order]` with the coefficients of the variational
    /// matrix seeded by `mat_coeffs[0]`.
    fn ode_coefficients_variational(
        &mut self,
        t: T,
        coeffs: &mut [DVector<T>],
        mat_coeffs: &mut [DMatrix<T>],
        order: usize,
    ) -> Result<(), SolverError>;
}

impl<T: Scalar, F: VectorField<T>> VectorField<T> for &mut F {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn eval(&mut self, t: T, x: &DVector<T>, out: &mut DVector<T>) -> Result<(), SolverError> {
        (**self).eval(t, x, out)
    }

    fn jacobian(&mut self, t: T, x: &DVector<T>) -> Result<DMatrix<T>, SolverError> {
        (**self).jacobian(t, x)
    }

    fn ode_coefficients(
        &mut self,
        t: T,
        coeffs: &mut [DVector<T>],
        order: usize,
    ) -> Result<(), SolverError> {
        (**self).ode_coefficients(t, coeffs, order)
    }

    fn ode_coefficients_variational(
        &mut self,
        t: T,
        coeffs: &mut [DVector<T>],
        mat_coeffs: &mut [DMatrix<T>],
        order: usize,
    ) -> Result<(), SolverError> {
        (**self).ode_coefficients_variational(t, coeffs, mat_coeffs, order)
    }
}
