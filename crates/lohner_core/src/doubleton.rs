//! Doubleton set representations and the Lohner move algorithm.
//!
//! A doubleton stores a set as `x + C·r0 + B·r`: a near-point center, the
//! image of the initial box under the accumulated flow derivative, and a
//! small absorbed-error box in a frame `B` that is re-orthonormalized every
//! step. Folding each step's local error into the rotated frame instead of
//! re-boxing it axis-aligned is what keeps the wrapping effect from growing
//! exponentially.

use crate::errors::SolverError;
use crate::field::VectorField;
use crate::interval::Interval;
use crate::linalg;
use crate::solver::{C0Step, OdeSolver};
use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// When and how the `(C, r0)` and `(B, r)` pairs are merged back into one.
///
/// The default reorganizes when the absorbed error outgrows the transported
/// initial box; a fixed step cadence can be layered on top.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReorganizePolicy {
    /// Reorganize when `width(r) > factor * width(r0)`.
    pub factor: Option<f64>,
    /// Reorganize unconditionally every this many steps.
    pub every_steps: Option<usize>,
}

impl Default for ReorganizePolicy {
    fn default() -> Self {
        Self {
            factor: Some(1.0),
            every_steps: None,
        }
    }
}

impl ReorganizePolicy {
    fn due(&self, steps_since: usize, r_width: f64, r0_width: f64) -> bool {
        if let Some(k) = self.every_steps {
            if k > 0 && steps_since >= k {
                return true;
            }
        }
        if let Some(f) = self.factor {
            if r_width > f * r0_width {
                return true;
            }
        }
        false
    }
}

fn identity(dim: usize) -> DMatrix<Interval> {
    DMatrix::from_fn(dim, dim, |i, j| {
        if i == j {
            Interval::point(1.0)
        } else {
            Interval::point(0.0)
        }
    })
}

fn zero_vector(dim: usize) -> DVector<Interval> {
    DVector::from_element(dim, Interval::point(0.0))
}

fn zero_matrix(rows: usize, cols: usize) -> DMatrix<Interval> {
    DMatrix::from_element(rows, cols, Interval::point(0.0))
}

/// Orthonormalized frame and a rigorous enclosure of its inverse. Falls
/// back to the identity frame when the factorization or the inversion
/// degenerates, which is always sound and merely loosens the wrapping
/// control for this step.
fn frame_and_inverse(raw: &DMatrix<Interval>) -> (DMatrix<Interval>, DMatrix<Interval>) {
    if let Some(q) = linalg::orthonormalize_mid(raw) {
        let b = linalg::promote_matrix(&q);
        if let Some(inv) = linalg::gauss_inverse(&b) {
            return (b, inv);
        }
    }
    debug!("frame orthonormalization degenerated, falling back to identity");
    let dim = raw.nrows();
    (identity(dim), identity(dim))
}

/// An enclosure of a C0 state, evolved one step at a time by a rigorous
/// solver. The represented set always contains the true reachable set of
/// the initial condition.
pub struct Doubleton {
    x: DVector<Interval>,
    c: DMatrix<Interval>,
    r0: DVector<Interval>,
    b: DMatrix<Interval>,
    b_inv: DMatrix<Interval>,
    r: DVector<Interval>,
    /// Tightest known enclosure of the represented set, kept alongside the
    /// affine representation.
    current: DVector<Interval>,
    time: Interval,
    policy: ReorganizePolicy,
    steps_since_reorganize: usize,
}

impl Doubleton {
    /// Builds the representation of an initial box at time `t`: the center
    /// is the midpoint, `C` the identity, `r0` the centered box.
    pub fn from_box(x: DVector<Interval>, t: f64) -> Self {
        let dim = x.len();
        let (mid, r0) = linalg::split_vector(&x);
        Self {
            x: mid,
            c: identity(dim),
            r0,
            b: identity(dim),
            b_inv: identity(dim),
            r: zero_vector(dim),
            current: x,
            time: Interval::point(t),
            policy: ReorganizePolicy::default(),
            steps_since_reorganize: 0,
        }
    }

    pub fn with_policy(mut self, policy: ReorganizePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dimension(&self) -> usize {
        self.x.len()
    }

    pub fn time(&self) -> Interval {
        self.time
    }

    pub(crate) fn set_time(&mut self, t: Interval) {
        self.time = t;
    }

    /// Box enclosure of the represented set.
    pub fn hull(&self) -> DVector<Interval> {
        self.current.clone()
    }

    fn representation_hull(&self) -> DVector<Interval> {
        &self.x + &self.c * &self.r0 + &self.b * &self.r
    }

    fn split_center(&self) -> (DVector<Interval>, DVector<Interval>) {
        if linalg::vector_subset(&self.x, &self.current) {
            (self.x.clone(), &self.current - &self.x)
        } else {
            linalg::split_vector(&self.current)
        }
    }

    /// Advances the set by one controlled step of `solver`.
    pub fn advance<F: VectorField<Interval>>(
        &mut self,
        solver: &mut OdeSolver<F>,
    ) -> Result<(), SolverError> {
        let (x_split, delta_x) = self.split_center();
        let data = solver.enclose_c0_map(self.time, &x_split, &self.current)?;
        self.apply_c0(&data, &x_split, &delta_x);
        self.time += data.step;
        self.steps_since_reorganize += 1;
        self.maybe_reorganize();
        Ok(())
    }

    /// Folds one step's image and remainder into the representation; the
    /// Lohner update with re-anchored center and re-orthonormalized frame.
    pub(crate) fn apply_c0(
        &mut self,
        data: &C0Step,
        x_split: &DVector<Interval>,
        delta_x: &DVector<Interval>,
    ) {
        let delta_y = &self.x - x_split;
        let mut new_x = &data.phi + &data.rem;
        // direct interval image of the whole set
        let bound = &new_x + &data.jac_phi * delta_x;
        new_x += &data.jac_phi * &delta_y;
        let new_c = &data.jac_phi * &self.c;
        let raw_b = &data.jac_phi * &self.b;

        // the representation gives a second enclosure of the same image
        let repr = &new_x + &new_c * &self.r0 + &raw_b * &self.r;
        let bound = linalg::intersect_vector(&bound, &repr).unwrap_or(bound);

        // re-anchor the center at its midpoint and push the residues into r
        let (c_mid, c_delta) = linalg::split_matrix(&new_c);
        let (x_mid, mut y_err) = linalg::split_vector(&new_x);
        y_err += &c_delta * &self.r0;

        let (b_new, b_inv) = frame_and_inverse(&raw_b);
        self.r = &(&b_inv * &raw_b) * &self.r + &b_inv * &y_err;
        self.x = x_mid;
        self.c = c_mid;
        self.b = b_new;
        self.b_inv = b_inv;
        self.current = bound;
    }

    fn maybe_reorganize(&mut self) {
        let r_width = linalg::max_width_vector(&self.r);
        let r0_width = linalg::max_width_vector(&self.r0);
        if self
            .policy
            .due(self.steps_since_reorganize, r_width, r0_width)
        {
            self.reorganize();
        }
    }

    /// Merges `(B, r)` into `(C, r0)`:
    /// `x + C r0 + B r  ⊆  x + B (B⁻¹ C r0 + r)`.
    fn reorganize(&mut self) {
        debug!("doubleton reorganization at t = {}", self.time);
        self.r0 = &self.r + &(&self.b_inv * &self.c) * &self.r0;
        self.c = self.b.clone();
        let dim = self.dimension();
        self.b = identity(dim);
        self.b_inv = identity(dim);
        self.r = zero_vector(dim);
        self.steps_since_reorganize = 0;
    }
}

/// A doubleton state together with a doubleton representation of the
/// accumulated variational (monodromy) matrix; both evolve jointly since
/// the matrix ODE runs along the state trajectory.
pub struct VariationalDoubleton {
    set: Doubleton,
    d: DMatrix<Interval>,
    cjac: DMatrix<Interval>,
    r0m: DMatrix<Interval>,
    bjac: DMatrix<Interval>,
    bjac_inv: DMatrix<Interval>,
    rm: DMatrix<Interval>,
    current_matrix: DMatrix<Interval>,
}

impl VariationalDoubleton {
    /// Initial box with the identity as the variational seed.
    pub fn from_box(x: DVector<Interval>, t: f64) -> Self {
        let dim = x.len();
        Self::with_seed(x, t, identity(dim))
    }

    /// Initial box with an arbitrary matrix seeding the variational flow.
    pub fn with_seed(x: DVector<Interval>, t: f64, seed: DMatrix<Interval>) -> Self {
        let dim = x.len();
        Self {
            set: Doubleton::from_box(x, t),
            d: seed.clone(),
            cjac: identity(dim),
            r0m: zero_matrix(dim, dim),
            bjac: identity(dim),
            bjac_inv: identity(dim),
            rm: zero_matrix(dim, dim),
            current_matrix: seed,
        }
    }

    pub fn with_policy(mut self, policy: ReorganizePolicy) -> Self {
        self.set.policy = policy;
        self
    }

    pub fn dimension(&self) -> usize {
        self.set.dimension()
    }

    pub fn time(&self) -> Interval {
        self.set.time()
    }

    pub(crate) fn set_time(&mut self, t: Interval) {
        self.set.set_time(t);
    }

    pub fn hull(&self) -> DVector<Interval> {
        self.set.hull()
    }

    /// Box enclosure of the variational matrix.
    pub fn matrix_hull(&self) -> DMatrix<Interval> {
        self.current_matrix.clone()
    }

    /// Advances state and variational matrix by one controlled step.
    pub fn advance<F: VectorField<Interval>>(
        &mut self,
        solver: &mut OdeSolver<F>,
    ) -> Result<(), SolverError> {
        let (x_split, delta_x) = self.set.split_center();
        let data = solver.enclose_c1_map(self.set.time, &x_split, &self.set.current)?;
        self.set.apply_c0(&data.c0, &x_split, &delta_x);

        // rigorous one-step derivative: truncated series plus its remainder
        let jac_full = &data.c0.jac_phi + &data.jac_rem;
        let bound = &jac_full * &self.current_matrix;

        let new_d = &jac_full * &self.d;
        let new_cjac = &jac_full * &self.cjac;
        let raw_bjac = &jac_full * &self.bjac;
        let repr = &new_d + &new_cjac * &self.r0m + &raw_bjac * &self.rm;
        let bound = linalg::intersect_matrix(&bound, &repr).unwrap_or(bound);

        let (d_mid, d_delta) = linalg::split_matrix(&new_d);
        let (cjac_mid, cjac_delta) = linalg::split_matrix(&new_cjac);
        let mut m_err = d_delta;
        m_err += &cjac_delta * &self.r0m;

        let (bjac_new, bjac_inv) = frame_and_inverse(&raw_bjac);
        self.rm = &(&bjac_inv * &raw_bjac) * &self.rm + &bjac_inv * &m_err;
        self.d = d_mid;
        self.cjac = cjac_mid;
        self.bjac = bjac_new;
        self.bjac_inv = bjac_inv;
        self.current_matrix = bound;

        self.set.time += data.c0.step;
        self.set.steps_since_reorganize += 1;
        if self.set.policy.due(
            self.set.steps_since_reorganize,
            linalg::max_width_vector(&self.set.r)
                .max(linalg::max_width_matrix(&self.rm)),
            linalg::max_width_vector(&self.set.r0)
                .max(linalg::max_width_matrix(&self.r0m)),
        ) {
            self.set.reorganize();
            self.reorganize_matrix();
        }
        Ok(())
    }

    fn reorganize_matrix(&mut self) {
        self.r0m = &self.rm + &(&self.bjac_inv * &self.cjac) * &self.r0m;
        self.cjac = self.bjac.clone();
        let dim = self.dimension();
        self.bjac = identity(dim);
        self.bjac_inv = identity(dim);
        self.rm = zero_matrix(dim, dim);
    }
}
