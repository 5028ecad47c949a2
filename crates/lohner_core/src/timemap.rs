//! Transport to an arbitrary target time by repeated controlled steps.
//!
//! The map never oversteps: every proposed step is bounded by the time
//! remaining, and a step that would cover the rest of the distance is
//! replaced by the exact remaining time, so the integration lands on the
//! target rather than near it.

use crate::doubleton::{Doubleton, VariationalDoubleton};
use crate::errors::SolverError;
use crate::field::VectorField;
use crate::interval::Interval;
use crate::linalg;
use crate::solver::{OdeSolver, PointSolver};
use crate::traits::Scalar;
use log::debug;
use nalgebra::{DMatrix, DVector};

/// Drives a borrowed one-step solver from an initial time to a target
/// time. Carries no state of its own between calls.
pub struct TimeMap<'a, S> {
    solver: &'a mut S,
}

impl<'a, S> TimeMap<'a, S> {
    pub fn new(solver: &'a mut S) -> Self {
        Self { solver }
    }
}

impl<'a, T: Scalar, F: VectorField<T>> TimeMap<'a, PointSolver<F, T>> {
    /// Maps a point forward to `target`, starting at time `t0`.
    pub fn map(
        &mut self,
        target: f64,
        x: &DVector<T>,
        t0: f64,
    ) -> Result<DVector<T>, SolverError> {
        let (x, _) = self.map_point(target, x, None, t0)?;
        Ok(x)
    }

    /// Maps a point forward together with the derivative of the flow
    /// seeded by `seed`.
    pub fn map_with_derivative(
        &mut self,
        target: f64,
        x: &DVector<T>,
        seed: &DMatrix<T>,
        t0: f64,
    ) -> Result<(DVector<T>, DMatrix<T>), SolverError> {
        let (x, m) = self.map_point(target, x, Some(seed), t0)?;
        Ok((x, m.expect("derivative was requested")))
    }

    fn map_point(
        &mut self,
        target: f64,
        x: &DVector<T>,
        seed: Option<&DMatrix<T>>,
        t0: f64,
    ) -> Result<(DVector<T>, Option<DMatrix<T>>), SolverError> {
        assert!(
            target >= t0,
            "time map integrates forward: target {target} precedes initial time {t0}"
        );
        let mut t = t0;
        let mut x = x.clone();
        let mut m = seed.cloned();
        let mut steps = 0usize;
        while t < target {
            let remaining = target - t;
            self.solver.set_max_step(remaining);
            let h = match &mut m {
                Some(mat) => {
                    let (nx, nm, h) = self.solver.step_with_transport(T::from_f64(t), &x, mat)?;
                    x = nx;
                    *mat = nm;
                    h
                }
                None => {
                    let (nx, h) = self.solver.step(T::from_f64(t), &x)?;
                    x = nx;
                    h
                }
            };
            steps += 1;
            if h >= remaining {
                t = target;
            } else {
                t += h;
            }
        }
        self.solver.set_max_step(f64::MAX);
        debug!("time map reached t = {target} in {steps} steps");
        Ok((x, m))
    }
}

impl<'a, F: VectorField<Interval>> TimeMap<'a, OdeSolver<F>> {
    /// Transports a doubleton set to `target`, landing on it exactly.
    pub fn map(&mut self, target: f64, set: &mut Doubleton) -> Result<(), SolverError> {
        assert!(
            target >= set.time().inf(),
            "time map integrates forward: target {target} precedes the set time"
        );
        loop {
            let remaining = Interval::point(target) - set.time();
            if remaining.sup() <= 0.0 {
                break;
            }
            self.solver.set_clip(Some(remaining));
            if let Err(e) = set.advance(self.solver) {
                self.solver.set_clip(None);
                return Err(self.stall(e, target, set.time(), set.hull()));
            }
            if let Err(e) = self.check_blowup(set.time(), &set.hull()) {
                self.solver.set_clip(None);
                return Err(e);
            }
            if self.solver.last_step_clipped() {
                set.set_time(Interval::point(target));
                break;
            }
        }
        self.solver.set_clip(None);
        Ok(())
    }

    /// Transports a set together with the enclosure of the flow Jacobian.
    pub fn map_variational(
        &mut self,
        target: f64,
        set: &mut VariationalDoubleton,
    ) -> Result<(), SolverError> {
        assert!(
            target >= set.time().inf(),
            "time map integrates forward: target {target} precedes the set time"
        );
        loop {
            let remaining = Interval::point(target) - set.time();
            if remaining.sup() <= 0.0 {
                break;
            }
            self.solver.set_clip(Some(remaining));
            if let Err(e) = set.advance(self.solver) {
                self.solver.set_clip(None);
                return Err(self.stall(e, target, set.time(), set.hull()));
            }
            if let Err(e) = self.check_blowup(set.time(), &set.hull()) {
                self.solver.set_clip(None);
                return Err(e);
            }
            if self.solver.last_step_clipped() {
                set.set_time(Interval::point(target));
                break;
            }
        }
        self.solver.set_clip(None);
        Ok(())
    }

    /// Converts a step failure into the non-convergence report carrying
    /// the partial result; other failures pass through.
    fn stall(
        &self,
        e: SolverError,
        target: f64,
        reached: Interval,
        hull: DVector<Interval>,
    ) -> SolverError {
        match e {
            SolverError::StepTooSmall { .. } => SolverError::NonConvergence {
                reached: reached.mid(),
                target,
                partial: hull.iter().copied().collect(),
            },
            other => other,
        }
    }

    fn check_blowup(&self, time: Interval, hull: &DVector<Interval>) -> Result<(), SolverError> {
        let width = linalg::max_width_vector(hull);
        let cap = self.solver.settings().blowup_cap;
        if width > cap {
            return Err(SolverError::EnclosureBlowup {
                time: time.mid(),
                width,
                cap,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::EquationField;
    use crate::solver::SolverSettings;
    use approx::assert_abs_diff_eq;

    const PENDULUM: &str = "time:t;par:omega;var:x,dx;fun:dx,sin(omega*t)-sin(x);";

    fn pendulum_point_solver() -> PointSolver<EquationField<f64>, f64> {
        let mut field: EquationField<f64> = EquationField::parse(PENDULUM).unwrap();
        field.set_param("omega", 1.0).unwrap();
        PointSolver::new(field, SolverSettings::default())
    }

    fn pendulum_rigorous_solver() -> OdeSolver<EquationField<Interval>> {
        let mut field: EquationField<Interval> = EquationField::parse(PENDULUM).unwrap();
        field.set_param("omega", Interval::point(1.0)).unwrap();
        OdeSolver::new(field, SolverSettings::default())
    }

    #[test]
    fn pendulum_point_scenario() {
        let mut solver = pendulum_point_solver();
        let mut tm = TimeMap::new(&mut solver);
        let x = DVector::from_vec(vec![1.0, 2.0]);
        let y = tm.map(8.0, &x, 4.0).unwrap();
        assert_abs_diff_eq!(y[0], -1.329739, epsilon = 1e-5);
        assert_abs_diff_eq!(y[1], 0.056758, epsilon = 1e-5);
    }

    #[test]
    fn pendulum_point_scenario_with_sensitivity() {
        let mut solver = pendulum_point_solver();
        let mut tm = TimeMap::new(&mut solver);
        let x = DVector::from_vec(vec![1.0, 2.0]);
        let seed = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 3.0, 4.0]);
        let (y, m) = tm.map_with_derivative(8.0, &x, &seed, 4.0).unwrap();
        assert_abs_diff_eq!(y[0], -1.329739, epsilon = 1e-5);
        assert_abs_diff_eq!(y[1], 0.056758, epsilon = 1e-5);
        assert_abs_diff_eq!(m[(0, 0)], 4.389353, epsilon = 1e-5);
        assert_abs_diff_eq!(m[(0, 1)], 5.768016, epsilon = 1e-5);
        assert_abs_diff_eq!(m[(1, 0)], -7.130663, epsilon = 1e-5);
        assert_abs_diff_eq!(m[(1, 1)], -9.142525, epsilon = 1e-5);
    }

    #[test]
    fn point_map_never_oversteps() {
        let mut solver = pendulum_point_solver();
        solver.set_fixed_step(Some(0.3));
        let target = 5.0;
        let mut t = 4.0;
        let x = DVector::from_vec(vec![1.0, 2.0]);
        let mut state = x.clone();
        while t < target {
            solver.set_max_step(target - t);
            let (nx, h) = solver.step(t, &state).unwrap();
            state = nx;
            assert!(t + h <= target + 1e-12, "overshoot: {} past {target}", t + h);
            if h >= target - t {
                t = target;
            } else {
                t += h;
            }
        }
        assert_eq!(t, target);
    }

    #[test]
    fn pendulum_rigorous_scenario() {
        let mut solver = pendulum_rigorous_solver();
        let mut tm = TimeMap::new(&mut solver);
        let x0 = DVector::from_vec(vec![Interval::point(1.0), Interval::point(2.0)]);
        let mut set = Doubleton::from_box(x0, 4.0);
        tm.map(8.0, &mut set).unwrap();

        // lands exactly on the target
        assert_eq!(set.time(), Interval::point(8.0));

        let hull = set.hull();
        let pad = 1e-9;
        let expected_x = Interval::new(-1.3297388770241241 - pad, -1.3297388770240786 + pad);
        let expected_y = Interval::new(0.056757688397800897 - pad, 0.05675768839784965 + pad);
        assert!(
            hull[0].subset(expected_x),
            "x enclosure {} escapes {expected_x}",
            hull[0]
        );
        assert!(
            hull[1].subset(expected_y),
            "y enclosure {} escapes {expected_y}",
            hull[1]
        );
        assert!(hull[0].width() < 1e-9);
        assert!(hull[1].width() < 1e-9);
    }

    #[test]
    fn pendulum_rigorous_monodromy_contains_sensitivities() {
        let mut solver = pendulum_rigorous_solver();
        let mut tm = TimeMap::new(&mut solver);
        let x0 = DVector::from_vec(vec![Interval::point(1.0), Interval::point(2.0)]);
        let seed = DMatrix::from_row_slice(
            2,
            2,
            &[
                Interval::point(1.0),
                Interval::point(1.0),
                Interval::point(3.0),
                Interval::point(4.0),
            ],
        );
        let mut set = VariationalDoubleton::with_seed(x0, 4.0, seed);
        tm.map_variational(8.0, &mut set).unwrap();

        let m = set.matrix_hull();
        let expected = [
            (0, 0, 4.389353),
            (0, 1, 5.768016),
            (1, 0, -7.130663),
            (1, 1, -9.142525),
        ];
        for (i, j, v) in expected {
            assert_abs_diff_eq!(m[(i, j)].mid(), v, epsilon = 1e-5);
            assert!(m[(i, j)].width() < 1e-7, "entry ({i},{j}) = {}", m[(i, j)]);
        }
        let hull = set.hull();
        assert_abs_diff_eq!(hull[0].mid(), -1.329739, epsilon = 1e-5);
        assert_abs_diff_eq!(hull[1].mid(), 0.056758, epsilon = 1e-5);
    }

    #[test]
    fn splitting_the_journey_loosens_but_keeps_enclosure() {
        let mut solver = pendulum_rigorous_solver();
        let mut tm = TimeMap::new(&mut solver);
        let x0 = DVector::from_vec(vec![Interval::point(1.0), Interval::point(2.0)]);
        let mut direct = Doubleton::from_box(x0.clone(), 4.0);
        tm.map(8.0, &mut direct).unwrap();

        let mut solver2 = pendulum_rigorous_solver();
        let mut tm2 = TimeMap::new(&mut solver2);
        let mut split = Doubleton::from_box(x0, 4.0);
        tm2.map(6.0, &mut split).unwrap();
        tm2.map(8.0, &mut split).unwrap();

        let d = direct.hull();
        let s = split.hull();
        let slack = 1e-10;
        for i in 0..2 {
            assert!(
                s[i].inf() <= d[i].inf() + slack && s[i].sup() >= d[i].sup() - slack,
                "split result {} does not cover direct result {}",
                s[i],
                d[i]
            );
            assert!(s[i].intersection(d[i]).is_some());
        }
    }

    #[test]
    fn quadratic_blowup_reports_nonconvergence() {
        // x' = x^2 from x(0) = 1 blows up at t = 1; the map must stall with
        // a partial result rather than return an answer
        let field: EquationField<Interval> = EquationField::parse("var:x;fun:x*x;").unwrap();
        let mut solver = OdeSolver::new(field, SolverSettings::default());
        let mut tm = TimeMap::new(&mut solver);
        let mut set = Doubleton::from_box(DVector::from_element(1, Interval::point(1.0)), 0.0);
        let err = tm.map(2.0, &mut set).unwrap_err();
        match err {
            SolverError::NonConvergence {
                reached,
                target,
                partial,
            } => {
                assert_eq!(target, 2.0);
                assert!(reached < 1.1, "reported progress past the blow-up: {reached}");
                assert!(reached > 0.5);
                assert_eq!(partial.len(), 1);
            }
            SolverError::EnclosureBlowup { time, .. } => {
                assert!(time < 1.1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn width_cap_triggers_enclosure_blowup() {
        let mut field: EquationField<Interval> = EquationField::parse(PENDULUM).unwrap();
        field.set_param("omega", Interval::point(1.0)).unwrap();
        let mut solver = OdeSolver::new(
            field,
            SolverSettings {
                blowup_cap: 1e-6,
                ..SolverSettings::default()
            },
        );
        let mut tm = TimeMap::new(&mut solver);
        let x0 = DVector::from_vec(vec![Interval::new(0.9, 1.1), Interval::new(1.9, 2.1)]);
        let mut set = Doubleton::from_box(x0, 4.0);
        let err = tm.map(8.0, &mut set).unwrap_err();
        assert!(matches!(err, SolverError::EnclosureBlowup { .. }));
    }

    #[test]
    fn mapping_to_the_initial_time_is_identity() {
        let mut solver = pendulum_rigorous_solver();
        let mut tm = TimeMap::new(&mut solver);
        let x0 = DVector::from_vec(vec![Interval::point(1.0), Interval::point(2.0)]);
        let mut set = Doubleton::from_box(x0, 4.0);
        tm.map(4.0, &mut set).unwrap();
        let hull = set.hull();
        assert!(hull[0].contains(1.0) && hull[1].contains(2.0));
        assert_eq!(set.time(), Interval::point(4.0));
    }
}
