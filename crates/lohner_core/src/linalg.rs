//! Interval vector and matrix helpers shared by the doubleton set and the
//! rigorous solver: midpoint/remainder splitting, componentwise
//! intersection, a rigorous Gauss-Jordan inverse and QR orthonormalization
//! of midpoint frames.

use crate::interval::Interval;
use nalgebra::{DMatrix, DVector};

/// Splits every component into its midpoint and a zero-centered remainder;
/// `mid + delta` contains the input componentwise.
pub fn split_vector(v: &DVector<Interval>) -> (DVector<Interval>, DVector<Interval>) {
    let mut mid = v.clone();
    let mut delta = v.clone();
    for i in 0..v.len() {
        let (m, d) = v[i].split();
        mid[i] = m;
        delta[i] = d;
    }
    (mid, delta)
}

pub fn split_matrix(m: &DMatrix<Interval>) -> (DMatrix<Interval>, DMatrix<Interval>) {
    let mut mid = m.clone();
    let mut delta = m.clone();
    for v in 0..m.len() {
        let (a, d) = m[v].split();
        mid[v] = a;
        delta[v] = d;
    }
    (mid, delta)
}

/// Componentwise intersection; `None` if any component pair is disjoint.
pub fn intersect_vector(a: &DVector<Interval>, b: &DVector<Interval>) -> Option<DVector<Interval>> {
    let mut out = a.clone();
    for i in 0..a.len() {
        out[i] = a[i].intersection(b[i])?;
    }
    Some(out)
}

pub fn intersect_matrix(a: &DMatrix<Interval>, b: &DMatrix<Interval>) -> Option<DMatrix<Interval>> {
    let mut out = a.clone();
    for i in 0..a.len() {
        out[i] = a[i].intersection(b[i])?;
    }
    Some(out)
}

pub fn mid_matrix(m: &DMatrix<Interval>) -> DMatrix<f64> {
    m.map(|x| x.mid())
}

pub fn promote_matrix(m: &DMatrix<f64>) -> DMatrix<Interval> {
    m.map(Interval::point)
}

/// True componentwise subset test.
pub fn vector_subset(inner: &DVector<Interval>, outer: &DVector<Interval>) -> bool {
    (0..inner.len()).all(|i| inner[i].subset(outer[i]))
}

/// Largest componentwise width.
pub fn max_width_vector(v: &DVector<Interval>) -> f64 {
    v.iter().map(|x| x.width()).fold(0.0, f64::max)
}

pub fn max_width_matrix(m: &DMatrix<Interval>) -> f64 {
    m.iter().map(|x| x.width()).fold(0.0, f64::max)
}

/// Rigorous inverse of an interval matrix by Gauss-Jordan elimination with
/// mignitude pivoting. Returns `None` when no pivot with a sign-definite
/// interval can be found, i.e. the matrix may be singular.
pub fn gauss_inverse(m: &DMatrix<Interval>) -> Option<DMatrix<Interval>> {
    let n = m.nrows();
    assert_eq!(n, m.ncols());
    let mut a = m.clone();
    let mut inv = DMatrix::<Interval>::identity(n, n);

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&i, &j| {
            a[(i, col)]
                .mig()
                .partial_cmp(&a[(j, col)].mig())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[(pivot_row, col)].mig() == 0.0 {
            return None;
        }
        if pivot_row != col {
            a.swap_rows(pivot_row, col);
            inv.swap_rows(pivot_row, col);
        }
        let pivot = a[(col, col)];
        for j in 0..n {
            a[(col, j)] = a[(col, j)] / pivot;
            inv[(col, j)] = inv[(col, j)] / pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[(row, col)];
            for j in 0..n {
                let aj = a[(col, j)] * factor;
                a[(row, j)] -= aj;
                let ij = inv[(col, j)] * factor;
                inv[(row, j)] -= ij;
            }
        }
    }
    Some(inv)
}

/// Orthonormalizes the midpoint of an interval matrix via QR. Returns the
/// floating-point `Q` factor, or `None` when the factorization degenerates.
pub fn orthonormalize_mid(m: &DMatrix<Interval>) -> Option<DMatrix<f64>> {
    let mid = mid_matrix(m);
    if mid.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let q = mid.qr().q();
    if q.iter().any(|x| !x.is_finite()) {
        return None;
    }
    // guard against rank deficiency collapsing a column
    for col in 0..q.ncols() {
        let norm = q.column(col).norm();
        if !(0.5..=1.5).contains(&norm) {
            return None;
        }
    }
    Some(q)
}
