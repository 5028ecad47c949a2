//! One-step Taylor solvers.
//!
//! [`PointSolver`] sums the truncated Taylor series of the solution for any
//! scalar type and makes no claim about the truncation error; it is the
//! fast non-rigorous companion. [`OdeSolver`] works over
//! [`Interval`] scalars and returns, for every step, an enclosure of the
//! image, of the flow derivative over the whole input set, and of the
//! Lagrange remainder, which is what the doubleton set consumes.
//!
//! Both solvers own their coefficient tables and reuse them across steps;
//! one instance must not be shared between concurrent integrations.

use crate::enclosure;
use crate::errors::SolverError;
use crate::field::VectorField;
use crate::interval::Interval;
use crate::step_control;
use crate::traits::Scalar;
use log::warn;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Configuration of the integration engine. Constructed explicitly and
/// injected; there is no global configuration state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Order of the truncated Taylor expansion.
    pub order: usize,
    /// Absolute floor of the per-step error tolerance.
    pub abs_tol: f64,
    /// Error tolerance relative to the state magnitude.
    pub rel_tol: f64,
    /// Smallest admissible step; falling below it raises
    /// [`SolverError::StepTooSmall`].
    pub min_step: f64,
    /// Largest admissible step.
    pub max_step: f64,
    /// Enclosure widths beyond this cap abort with
    /// [`SolverError::EnclosureBlowup`].
    pub blowup_cap: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            order: 20,
            abs_tol: 1e-17,
            rel_tol: 1e-17,
            min_step: 1.0 / 1_048_576.0,
            max_step: 1.0,
            blowup_cap: 1e5,
        }
    }
}

fn horner_vector<T: Scalar>(coeffs: &[DVector<T>], order: usize, h: T) -> DVector<T> {
    let mut acc = coeffs[order].clone();
    for k in (0..order).rev() {
        acc = acc.map(|v| v * h);
        acc += &coeffs[k];
    }
    acc
}

fn horner_matrix<T: Scalar>(coeffs: &[DMatrix<T>], order: usize, h: T) -> DMatrix<T> {
    let mut acc = coeffs[order].clone();
    for k in (0..order).rev() {
        acc = acc.map(|v| v * h);
        acc += &coeffs[k];
    }
    acc
}

fn table_vector<T: Scalar>(len: usize, dim: usize) -> Vec<DVector<T>> {
    (0..len).map(|_| DVector::from_element(dim, T::zero())).collect()
}

fn table_matrix<T: Scalar>(len: usize, dim: usize) -> Vec<DMatrix<T>> {
    (0..len)
        .map(|_| DMatrix::from_element(dim, dim, T::zero()))
        .collect()
}

// ---------------------------------------------------------------------------

/// Non-rigorous Taylor solver over an arbitrary scalar type.
pub struct PointSolver<F, T: Scalar> {
    field: F,
    settings: SolverSettings,
    fixed_step: Option<f64>,
    max_step_bound: f64,
    coeffs: Vec<DVector<T>>,
    mat_coeffs: Vec<DMatrix<T>>,
    last_step: f64,
}

impl<T: Scalar, F: VectorField<T>> PointSolver<F, T> {
    pub fn new(field: F, settings: SolverSettings) -> Self {
        let dim = field.dimension();
        let len = settings.order + 2;
        Self {
            field,
            settings,
            fixed_step: None,
            max_step_bound: settings.max_step,
            coeffs: table_vector(len, dim),
            mat_coeffs: table_matrix(len, dim),
            last_step: 0.0,
        }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn dimension(&self) -> usize {
        self.field.dimension()
    }

    /// Switches to a user-supplied fixed step, bypassing step selection.
    pub fn set_fixed_step(&mut self, step: Option<f64>) {
        self.fixed_step = step;
    }

    /// Clips the next step; used by the time map to land on the target.
    pub fn set_max_step(&mut self, bound: f64) {
        self.max_step_bound = bound.min(self.settings.max_step);
    }

    pub fn last_step(&self) -> f64 {
        self.last_step
    }

    fn choose_step(&self, with_matrix: bool, state_norm: f64) -> f64 {
        if let Some(h) = self.fixed_step {
            return h.min(self.max_step_bound);
        }
        let order = self.settings.order;
        let coeffs = &self.coeffs;
        let mats = &self.mat_coeffs;
        let norm = |i: usize| {
            let mut n = coeffs[i].iter().map(|v| v.mag()).fold(0.0, f64::max);
            if with_matrix {
                n = mats[i].iter().map(|v| v.mag()).fold(n, f64::max);
            }
            n
        };
        let tol = step_control::effective_tolerance(
            self.settings.abs_tol,
            self.settings.rel_tol,
            state_norm,
        );
        step_control::next_step(
            norm,
            order,
            2,
            tol,
            self.settings.min_step,
            self.max_step_bound,
        )
    }

    /// Advances `x` by one controlled step from time `t`; returns the new
    /// state and the step taken.
    pub fn step(&mut self, t: T, x: &DVector<T>) -> Result<(DVector<T>, f64), SolverError> {
        let order = self.settings.order;
        self.coeffs[0].copy_from(x);
        self.field
            .ode_coefficients(t, &mut self.coeffs[..=order], order)?;
        let h = self.choose_step(false, x.iter().map(|v| v.mag()).fold(0.0, f64::max));
        let out = horner_vector(&self.coeffs, order, T::from_f64(h));
        self.last_step = h;
        Ok((out, h))
    }

    /// Advances `x` together with the derivative of the flow seeded by `m`.
    pub fn step_with_transport(
        &mut self,
        t: T,
        x: &DVector<T>,
        m: &DMatrix<T>,
    ) -> Result<(DVector<T>, DMatrix<T>, f64), SolverError> {
        let order = self.settings.order;
        self.coeffs[0].copy_from(x);
        self.mat_coeffs[0].copy_from(m);
        self.field.ode_coefficients_variational(
            t,
            &mut self.coeffs[..=order],
            &mut self.mat_coeffs[..=order],
            order,
        )?;
        let h = self.choose_step(true, x.iter().map(|v| v.mag()).fold(0.0, f64::max));
        let out = horner_vector(&self.coeffs, order, T::from_f64(h));
        let out_m = horner_matrix(&self.mat_coeffs, order, T::from_f64(h));
        self.last_step = h;
        Ok((out, out_m, h))
    }
}

// ---------------------------------------------------------------------------

/// Everything one rigorous step produces for the plain enclosure case.
#[derive(Debug)]
pub struct C0Step {
    /// Taylor sum of the center series plus nothing else; the image of the
    /// center point up to the remainder.
    pub phi: DVector<Interval>,
    /// Derivative of the step map over the whole input set.
    pub jac_phi: DMatrix<Interval>,
    /// Lagrange remainder of the truncated series over the step enclosure.
    pub rem: DVector<Interval>,
    /// Enclosure of every trajectory over `[0, h]`.
    pub enc: DVector<Interval>,
    /// The step actually taken. Degenerate unless the step was clipped to
    /// land on a target time.
    pub step: Interval,
}

/// A rigorous step with the variational data alongside.
pub struct C1Step {
    pub c0: C0Step,
    pub jac_rem: DMatrix<Interval>,
    pub jac_enc: DMatrix<Interval>,
}

/// Rigorous one-step Taylor solver with interval coefficients.
pub struct OdeSolver<F> {
    field: F,
    settings: SolverSettings,
    fixed_step: Option<f64>,
    max_step_bound: f64,
    clip: Option<Interval>,
    last_step_clipped: bool,
    center_coeffs: Vec<DVector<Interval>>,
    coeffs: Vec<DVector<Interval>>,
    mat_coeffs: Vec<DMatrix<Interval>>,
    rem_coeffs: Vec<DVector<Interval>>,
    rem_mat_coeffs: Vec<DMatrix<Interval>>,
}

impl<F: VectorField<Interval>> OdeSolver<F> {
    pub fn new(field: F, settings: SolverSettings) -> Self {
        let dim = field.dimension();
        let len = settings.order + 2;
        Self {
            field,
            settings,
            fixed_step: None,
            max_step_bound: settings.max_step,
            clip: None,
            last_step_clipped: false,
            center_coeffs: table_vector(len, dim),
            coeffs: table_vector(len, dim),
            mat_coeffs: table_matrix(len, dim),
            rem_coeffs: table_vector(len, dim),
            rem_mat_coeffs: table_matrix(len, dim),
        }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn dimension(&self) -> usize {
        self.field.dimension()
    }

    pub fn set_fixed_step(&mut self, step: Option<f64>) {
        self.fixed_step = step;
    }

    /// Sets the exact remaining time to the target; when the controller
    /// proposes at least this much the step is clipped onto it.
    pub(crate) fn set_clip(&mut self, clip: Option<Interval>) {
        self.clip = clip;
    }

    pub(crate) fn last_step_clipped(&self) -> bool {
        self.last_step_clipped
    }

    fn coeff_norm(&self, i: usize, with_matrix: bool) -> f64 {
        let mut n = self.coeffs[i].iter().map(|v| v.mag()).fold(0.0, f64::max);
        n = self.center_coeffs[i]
            .iter()
            .map(|v| v.mag())
            .fold(n, f64::max);
        if with_matrix {
            n = self.mat_coeffs[i].iter().map(|v| v.mag()).fold(n, f64::max);
        }
        n
    }

    fn propose_step(&self, with_matrix: bool, state_norm: f64) -> f64 {
        let bound = self.max_step_bound.min(self.settings.max_step);
        if let Some(h) = self.fixed_step {
            return h.min(bound);
        }
        let tol = step_control::effective_tolerance(
            self.settings.abs_tol,
            self.settings.rel_tol,
            state_norm,
        );
        step_control::next_step(
            |i| self.coeff_norm(i, with_matrix),
            self.settings.order,
            2,
            tol,
            self.settings.min_step,
            bound,
        )
    }

    /// Computes the Taylor coefficients of the solution through the center
    /// point and, with the identity seed, through the whole set.
    fn compute_coefficients(
        &mut self,
        t: Interval,
        x_center: &DVector<Interval>,
        x_set: &DVector<Interval>,
    ) -> Result<(), SolverError> {
        let order = self.settings.order;
        self.center_coeffs[0].copy_from(x_center);
        self.field
            .ode_coefficients(t, &mut self.center_coeffs[..=order], order)?;
        self.coeffs[0].copy_from(x_set);
        self.mat_coeffs[0] = DMatrix::from_fn(x_set.len(), x_set.len(), |i, j| {
            if i == j {
                Interval::point(1.0)
            } else {
                Interval::point(0.0)
            }
        });
        self.field.ode_coefficients_variational(
            t,
            &mut self.coeffs[..=order],
            &mut self.mat_coeffs[..=order],
            order,
        )?;
        Ok(())
    }

    /// Tolerance bound the remainder enclosure has to satisfy; a few bits
    /// above the step-selection tolerance so the two criteria do not fight.
    fn remainder_tolerance(&self, state_norm: f64) -> f64 {
        64.0 * step_control::effective_tolerance(
            self.settings.abs_tol,
            self.settings.rel_tol,
            state_norm,
        )
    }

    /// One controlled rigorous step for a plain (C0) set.
    ///
    /// Walks the step states in order: coefficients are computed, the
    /// remainder is bounded over an a-priori enclosure, the step is
    /// validated (and shrunk when validation fails), and the series sums
    /// are produced for the selected step.
    pub fn enclose_c0_map(
        &mut self,
        t: Interval,
        x_center: &DVector<Interval>,
        x_set: &DVector<Interval>,
    ) -> Result<C0Step, SolverError> {
        self.compute_coefficients(t, x_center, x_set)?;
        let state_norm = x_set.iter().map(|v| v.mag()).fold(0.0, f64::max);
        let mut h = self.propose_step(false, state_norm);
        let order = self.settings.order;
        let rem_tol = self.remainder_tolerance(state_norm);

        loop {
            let attempt = self.try_remainder(t, x_set, h, rem_tol, false);
            match attempt {
                Ok((enc, rem, _, _)) => {
                    let (step, clipped) = self.resolve_step(h);
                    self.last_step_clipped = clipped;
                    let phi = horner_vector(&self.center_coeffs, order, step);
                    let jac_phi = horner_matrix(&self.mat_coeffs, order, step);
                    return Ok(C0Step {
                        phi,
                        jac_phi,
                        rem,
                        enc,
                        step,
                    });
                }
                Err(next_h) => h = self.shrink_step(t, h, next_h)?,
            }
        }
    }

    /// One controlled rigorous step carrying the variational matrix.
    pub fn enclose_c1_map(
        &mut self,
        t: Interval,
        x_center: &DVector<Interval>,
        x_set: &DVector<Interval>,
    ) -> Result<C1Step, SolverError> {
        self.compute_coefficients(t, x_center, x_set)?;
        let state_norm = x_set.iter().map(|v| v.mag()).fold(0.0, f64::max);
        let mut h = self.propose_step(true, state_norm);
        let order = self.settings.order;
        let rem_tol = self.remainder_tolerance(state_norm);

        loop {
            let attempt = self.try_remainder(t, x_set, h, rem_tol, true);
            match attempt {
                Ok((enc, rem, jac_enc, jac_rem)) => {
                    let (step, clipped) = self.resolve_step(h);
                    self.last_step_clipped = clipped;
                    let phi = horner_vector(&self.center_coeffs, order, step);
                    let jac_phi = horner_matrix(&self.mat_coeffs, order, step);
                    return Ok(C1Step {
                        c0: C0Step {
                            phi,
                            jac_phi,
                            rem,
                            enc,
                            step,
                        },
                        jac_rem: jac_rem.expect("variational remainder requested"),
                        jac_enc: jac_enc.expect("variational enclosure requested"),
                    });
                }
                Err(next_h) => h = self.shrink_step(t, h, next_h)?,
            }
        }
    }

    /// Attempts to certify the remainder for step `h`. On failure returns
    /// the next step candidate to try.
    #[allow(clippy::type_complexity)]
    fn try_remainder(
        &mut self,
        t: Interval,
        x_set: &DVector<Interval>,
        h: f64,
        rem_tol: f64,
        variational: bool,
    ) -> Result<
        (
            DVector<Interval>,
            DVector<Interval>,
            Option<DMatrix<Interval>>,
            Option<DMatrix<Interval>>,
        ),
        f64,
    > {
        let order = self.settings.order;
        let enc = match enclosure::enclosure(&mut self.field, t, x_set, h) {
            Ok(enc) => enc,
            Err(_) => return Err(h * 0.5),
        };
        let h_range = Interval::new(0.0, h);
        let h_pow = h_range.powi(order as i32 + 1);

        self.rem_coeffs[0].copy_from(&enc);
        let (jac_enc, jac_rem) = if variational {
            let jac_enc = match enclosure::jac_enclosure(&mut self.field, t, h, &enc) {
                Ok(m) => m,
                Err(_) => return Err(h * 0.5),
            };
            self.rem_mat_coeffs[0].copy_from(&jac_enc);
            if self
                .field
                .ode_coefficients_variational(
                    t + h_range,
                    &mut self.rem_coeffs[..=order + 1],
                    &mut self.rem_mat_coeffs[..=order + 1],
                    order + 1,
                )
                .is_err()
            {
                return Err(h * 0.5);
            }
            let jac_rem = self.rem_mat_coeffs[order + 1].map(|v| v * h_pow);
            (Some(jac_enc), Some(jac_rem))
        } else {
            if self
                .field
                .ode_coefficients(t + h_range, &mut self.rem_coeffs[..=order + 1], order + 1)
                .is_err()
            {
                return Err(h * 0.5);
            }
            (None, None)
        };
        let rem = self.rem_coeffs[order + 1].map(|v| v * h_pow);

        // a user-fixed step bypasses the tolerance search; it only needs a
        // valid enclosure
        if self.fixed_step.is_none() {
            let rem_width = rem.iter().map(|v| v.width()).fold(0.0, f64::max);
            if rem_width > rem_tol {
                // the h^(order+1) scaling makes a modest reduction decisive
                return Err(h * 0.7);
            }
        }
        Ok((enc, rem, jac_enc, jac_rem))
    }

    fn shrink_step(&self, t: Interval, h: f64, next_h: f64) -> Result<f64, SolverError> {
        if self.fixed_step.is_some() || next_h < self.settings.min_step {
            return Err(SolverError::StepTooSmall {
                time: t.mid(),
                step: h,
            });
        }
        warn!("remainder validation rejected h = {h:e}, retrying with {next_h:e}");
        Ok(step_control::clear_mantissa_bits(next_h).max(self.settings.min_step))
    }

    /// Replaces a proposed step covering the whole remaining time by the
    /// exact (interval) remaining time, so the final step lands on target.
    fn resolve_step(&self, h: f64) -> (Interval, bool) {
        if let Some(clip) = self.clip {
            if h >= clip.sup() {
                // the true remaining duration is nonnegative and at most h
                let step = clip
                    .intersection(Interval::new(0.0, h))
                    .unwrap_or_else(|| Interval::point(clip.sup().max(0.0)));
                return (step, true);
            }
        }
        (Interval::point(h), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::EquationField;
    use approx::assert_relative_eq;

    fn exponential_point_solver() -> PointSolver<EquationField<f64>, f64> {
        let field: EquationField<f64> = EquationField::parse("var:x;fun:x;").unwrap();
        PointSolver::new(field, SolverSettings::default())
    }

    #[test]
    fn point_step_tracks_exponential() {
        let mut solver = exponential_point_solver();
        solver.set_fixed_step(Some(0.5));
        let x = DVector::from_element(1, 1.0);
        let (y, h) = solver.step(0.0, &x).unwrap();
        assert_eq!(h, 0.5);
        assert_relative_eq!(y[0], 0.5f64.exp(), epsilon = 1e-12);
    }

    #[test]
    fn point_transport_matches_flow_derivative() {
        // for x' = x the flow derivative over h equals e^h times the seed
        let mut solver = exponential_point_solver();
        solver.set_fixed_step(Some(0.25));
        let x = DVector::from_element(1, 2.0);
        let seed = DMatrix::from_element(1, 1, 3.0);
        let (y, m, h) = solver.step_with_transport(0.0, &x, &seed).unwrap();
        assert_relative_eq!(y[0], 2.0 * 0.25f64.exp(), epsilon = 1e-12);
        assert_relative_eq!(m[(0, 0)], 3.0 * 0.25f64.exp(), epsilon = 1e-12);
        assert_eq!(h, 0.25);
    }

    #[test]
    fn controlled_step_respects_clip() {
        let mut solver = exponential_point_solver();
        solver.set_max_step(0.125);
        let x = DVector::from_element(1, 1.0);
        let (_, h) = solver.step(0.0, &x).unwrap();
        assert!(h <= 0.125);
    }

    fn exponential_rigorous_solver() -> OdeSolver<EquationField<Interval>> {
        let field: EquationField<Interval> = EquationField::parse("var:x;fun:x;").unwrap();
        OdeSolver::new(field, SolverSettings::default())
    }

    #[test]
    fn rigorous_step_encloses_exponential() {
        let mut solver = exponential_rigorous_solver();
        let x = DVector::from_element(1, Interval::point(1.0));
        let step = solver
            .enclose_c0_map(Interval::point(0.0), &x, &x)
            .unwrap();
        let h = step.step.sup();
        assert!(h > 0.0);
        let image = step.phi[0] + step.rem[0];
        assert!(
            image.contains(f64::exp(h)) || image.contains(f64::exp(h).next_down()),
            "e^{h} not in {image}"
        );
        assert!(image.width() < 1e-12);
        // the flow derivative of x' = x is e^h as well
        let jac = step.jac_phi[(0, 0)];
        assert!(jac.contains(f64::exp(h)) || jac.contains(f64::exp(h).next_down()));
    }

    #[test]
    fn rigorous_remainder_shrinks_with_order() {
        let field: EquationField<Interval> = EquationField::parse("var:x;fun:x;").unwrap();
        let mut low = OdeSolver::new(
            field,
            SolverSettings {
                order: 6,
                ..SolverSettings::default()
            },
        );
        low.set_fixed_step(Some(0.25));
        let x = DVector::from_element(1, Interval::point(1.0));
        let step_low = low.enclose_c0_map(Interval::point(0.0), &x, &x).unwrap();

        let field: EquationField<Interval> = EquationField::parse("var:x;fun:x;").unwrap();
        let mut high = OdeSolver::new(
            field,
            SolverSettings {
                order: 12,
                ..SolverSettings::default()
            },
        );
        high.set_fixed_step(Some(0.25));
        let step_high = high.enclose_c0_map(Interval::point(0.0), &x, &x).unwrap();

        let w_low = step_low.rem[0].width();
        let w_high = step_high.rem[0].width();
        assert!(w_high < w_low, "remainder {w_high:e} !< {w_low:e}");
    }

    #[test]
    fn fixed_step_failure_is_step_too_small() {
        // a fixed step far beyond the radius of convergence of the scheme
        let field: EquationField<Interval> = EquationField::parse("var:x;fun:x*x;").unwrap();
        let mut solver = OdeSolver::new(
            field,
            SolverSettings {
                max_step: 100.0,
                ..SolverSettings::default()
            },
        );
        solver.set_fixed_step(Some(50.0));
        let x = DVector::from_element(1, Interval::point(1.0));
        let err = solver
            .enclose_c0_map(Interval::point(0.0), &x, &x)
            .unwrap_err();
        assert!(matches!(err, SolverError::StepTooSmall { .. }));
    }
}
