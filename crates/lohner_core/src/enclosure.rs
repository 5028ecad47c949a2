//! A-priori enclosures of the solution over one time step.
//!
//! Before the truncation remainder of a Taylor step can be bounded, a box
//! containing every trajectory on `[0, h]` is needed. The state enclosure
//! comes from a Picard-type inflation iteration; the enclosure of the
//! variational matrix from a logarithmic-norm bound on the fundamental
//! matrix ("C^1-Lohner algorithm", Zgliczynski).

use crate::errors::SolverError;
use crate::field::VectorField;
use crate::interval::Interval;
use log::warn;
use nalgebra::{DMatrix, DVector};

/// Finds a box `z` with `x + [0,h]·f(t + [0,h], z)` inside `z`, which by
/// the Picard operator encloses `phi([0,h], x)`. Fails with
/// [`SolverError::StepTooSmall`] when the inflation loop does not close,
/// signalling the caller to retry with a smaller step.
pub fn enclosure<F: VectorField<Interval>>(
    field: &mut F,
    t: Interval,
    x: &DVector<Interval>,
    step: f64,
) -> Result<DVector<Interval>, SolverError> {
    let dim = x.len();
    let h = Interval::new(0.0, step);
    let time_range = t + h;
    let trial = Interval::new(-0.2, 1.2) * Interval::point(step);
    let slack = Interval::new(-f64::EPSILON, f64::EPSILON);

    let mut val = DVector::from_element(dim, Interval::point(0.0));
    field.eval(time_range, x, &mut val)?;
    let mut z = x.clone();
    for i in 0..dim {
        z[i] = x[i] + trial * val[i] + slack;
    }

    let limit = 10 + 2 * dim;
    let mut y = z.clone();
    for _ in 0..limit {
        field.eval(time_range, &z, &mut val)?;
        let mut found = true;
        for i in 0..dim {
            y[i] = x[i] + h * val[i];
            if !y[i].subset_interior(z[i]) {
                found = false;
                // inflate the failing coordinate around the midpoint
                let (mid, delta) = y[i].split();
                z[i] = mid + delta * Interval::point(1.5);
            }
        }
        if found {
            return Ok(y);
        }
    }

    warn!("enclosure inflation failed to close for step {step:e}");
    Err(SolverError::StepTooSmall {
        time: t.mid(),
        step,
    })
}

/// Encloses the fundamental matrix of the variational equation over
/// `[0, h]` seeded with the identity: every entry of `Phi(s)` is bounded by
/// `e^{h ||Df||}`, then tightened by one Picard application
/// `I + [0,h]·Df·W`.
pub fn jac_enclosure<F: VectorField<Interval>>(
    field: &mut F,
    t: Interval,
    step: f64,
    enc: &DVector<Interval>,
) -> Result<DMatrix<Interval>, SolverError> {
    let dim = enc.len();
    let h = Interval::new(0.0, step);
    let der = field.jacobian(t + h, enc)?;

    // infinity operator norm upper bound of Df over the enclosure
    let mut norm = 0.0f64;
    for i in 0..dim {
        let mut row = 0.0;
        for j in 0..dim {
            row += der[(i, j)].mag();
        }
        norm = norm.max(row);
    }
    let growth = (Interval::point(step) * Interval::point(norm)).exp();
    let w = Interval::new(-growth.sup(), growth.sup());

    let mut result = DMatrix::from_element(dim, dim, Interval::point(0.0));
    for i in 0..dim {
        for j in 0..dim {
            let mut acc = if i == j {
                Interval::point(1.0)
            } else {
                Interval::point(0.0)
            };
            for k in 0..dim {
                acc += h * der[(i, k)] * w;
            }
            result[(i, j)] = acc.intersection(w).unwrap_or(w);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::EquationField;

    #[test]
    fn enclosure_contains_exponential_trajectory() {
        let mut field: EquationField<Interval> = EquationField::parse("var:x;fun:x;").unwrap();
        let x = DVector::from_element(1, Interval::point(1.0));
        let h = 0.25;
        let enc = enclosure(&mut field, Interval::point(0.0), &x, h).unwrap();
        for s in [0.0, 0.1, 0.25] {
            assert!(
                enc[0].contains(f64::exp(s)),
                "e^{s} not inside {}",
                enc[0]
            );
        }
    }

    #[test]
    fn enclosure_contains_pendulum_flow_samples() {
        let mut field: EquationField<Interval> =
            EquationField::parse("time:t;par:omega;var:x,dx;fun:dx,sin(omega*t)-sin(x);").unwrap();
        field.set_param("omega", Interval::point(1.0)).unwrap();
        let x = DVector::from_vec(vec![Interval::point(1.0), Interval::point(2.0)]);
        let enc = enclosure(&mut field, Interval::point(4.0), &x, 0.125).unwrap();
        // the initial point itself must be inside, and so is a forward Euler
        // probe which approximates the short trajectory well
        assert!(enc[0].contains(1.0) && enc[1].contains(2.0));
        let f0 = (1.0f64, 4.0f64.sin() - 1.0f64.sin());
        assert!(enc[0].contains(1.0 + 0.1 * 2.0));
        assert!(enc[1].contains(2.0 + 0.1 * f0.1));
    }

    #[test]
    fn jac_enclosure_contains_fundamental_matrix() {
        // x' = x: Phi(s) = e^s over [0, 0.25]
        let mut field: EquationField<Interval> = EquationField::parse("var:x;fun:x;").unwrap();
        let enc = DVector::from_element(1, Interval::new(0.9, 1.4));
        let jac = jac_enclosure(&mut field, Interval::point(0.0), 0.25, &enc).unwrap();
        for s in [0.0, 0.1, 0.25] {
            assert!(jac[(0, 0)].contains(f64::exp(s)));
        }
    }
}
