//! Closed floating-point intervals with outward-rounded arithmetic.
//!
//! Every operation returns an interval containing the exact mathematical
//! image of its operands; this containment is the property the whole
//! rigorous integration engine rests on. Addition, subtraction,
//! multiplication, division and square root use error-free transformations
//! (two-sum / FMA residuals) to round outward by at most one ulp per
//! endpoint; the elementary transcendental functions pad the platform libm
//! result by two ulps per endpoint.

use crate::traits::Scalar;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::fmt;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

// ---------------------------------------------------------------------------
// directed rounding primitives

fn two_sum(a: f64, b: f64) -> (f64, f64) {
    let s = a + b;
    let bb = s - a;
    let err = (a - (s - bb)) + (b - bb);
    (s, err)
}

fn add_down(a: f64, b: f64) -> f64 {
    let (s, e) = two_sum(a, b);
    if !s.is_finite() {
        return s;
    }
    if e < 0.0 {
        s.next_down()
    } else {
        s
    }
}

fn add_up(a: f64, b: f64) -> f64 {
    let (s, e) = two_sum(a, b);
    if !s.is_finite() {
        return s;
    }
    if e > 0.0 {
        s.next_up()
    } else {
        s
    }
}

fn sub_down(a: f64, b: f64) -> f64 {
    add_down(a, -b)
}

fn sub_up(a: f64, b: f64) -> f64 {
    add_up(a, -b)
}

fn mul_down(a: f64, b: f64) -> f64 {
    let p = a * b;
    if !p.is_finite() {
        return p;
    }
    let e = a.mul_add(b, -p);
    if e < 0.0 {
        p.next_down()
    } else {
        p
    }
}

fn mul_up(a: f64, b: f64) -> f64 {
    let p = a * b;
    if !p.is_finite() {
        return p;
    }
    let e = a.mul_add(b, -p);
    if e > 0.0 {
        p.next_up()
    } else {
        p
    }
}

fn div_down(a: f64, b: f64) -> f64 {
    let q = a / b;
    if !q.is_finite() {
        return q;
    }
    // residual a - q*b has the sign of the rounding error times b
    let r = q.mul_add(-b, a);
    if r != 0.0 && (r > 0.0) != (b > 0.0) {
        q.next_down()
    } else {
        q
    }
}

fn div_up(a: f64, b: f64) -> f64 {
    let q = a / b;
    if !q.is_finite() {
        return q;
    }
    let r = q.mul_add(-b, a);
    if r != 0.0 && (r > 0.0) == (b > 0.0) {
        q.next_up()
    } else {
        q
    }
}

fn sqrt_down(x: f64) -> f64 {
    let s = x.sqrt();
    if s.mul_add(s, -x) > 0.0 {
        s.next_down()
    } else {
        s
    }
}

fn sqrt_up(x: f64) -> f64 {
    let s = x.sqrt();
    if s.mul_add(s, -x) < 0.0 {
        s.next_up()
    } else {
        s
    }
}

// libm results are not correctly rounded; two ulps of slack covers every
// platform we target.
fn pad_down(x: f64) -> f64 {
    x.next_down().next_down()
}

fn pad_up(x: f64) -> f64 {
    x.next_up().next_up()
}

// ---------------------------------------------------------------------------

/// A closed interval `[inf, sup]` of `f64` endpoints, `inf <= sup`.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    inf: f64,
    sup: f64,
}

impl Interval {
    /// Enclosure of pi, used by the trigonometric range reductions.
    const PI: Interval = Interval {
        inf: 3.141592653589793,
        sup: 3.1415926535897936,
    };

    pub fn new(inf: f64, sup: f64) -> Self {
        assert!(inf <= sup, "invalid interval endpoints [{inf}, {sup}]");
        Self { inf, sup }
    }

    pub fn point(v: f64) -> Self {
        Self::new(v, v)
    }

    pub fn inf(self) -> f64 {
        self.inf
    }

    pub fn sup(self) -> f64 {
        self.sup
    }

    /// Upper bound of the diameter `sup - inf`.
    pub fn width(self) -> f64 {
        sub_up(self.sup, self.inf)
    }

    /// A point of the interval close to its center.
    pub fn mid(self) -> f64 {
        let m = 0.5 * self.inf + 0.5 * self.sup;
        m.clamp(self.inf, self.sup)
    }

    /// Magnitude: `max(|inf|, |sup|)`.
    pub fn mag(self) -> f64 {
        self.inf.abs().max(self.sup.abs())
    }

    /// Mignitude: the smallest absolute value of the interval.
    pub fn mig(self) -> f64 {
        if self.contains_zero() {
            0.0
        } else {
            self.inf.abs().min(self.sup.abs())
        }
    }

    pub fn contains(self, v: f64) -> bool {
        self.inf <= v && v <= self.sup
    }

    pub fn contains_zero(self) -> bool {
        self.inf <= 0.0 && 0.0 <= self.sup
    }

    /// True if `self` is a subset of `other`.
    pub fn subset(self, other: Interval) -> bool {
        other.inf <= self.inf && self.sup <= other.sup
    }

    /// True if `self` lies in the interior of `other`.
    pub fn subset_interior(self, other: Interval) -> bool {
        other.inf < self.inf && self.sup < other.sup
    }

    pub fn intersection(self, other: Interval) -> Option<Interval> {
        let inf = self.inf.max(other.inf);
        let sup = self.sup.min(other.sup);
        if inf <= sup {
            Some(Interval::new(inf, sup))
        } else {
            None
        }
    }

    /// Smallest interval containing both arguments.
    pub fn hull(self, other: Interval) -> Interval {
        Interval::new(self.inf.min(other.inf), self.sup.max(other.sup))
    }

    /// Splits into a degenerate midpoint interval and a centered remainder,
    /// with `mid + delta` containing `self`.
    pub fn split(self) -> (Interval, Interval) {
        let m = self.mid();
        let delta = Interval::new(sub_down(self.inf, m), sub_up(self.sup, m));
        (Interval::point(m), delta)
    }

    /// Integer power with the sign-aware tightening for even exponents.
    pub fn powi(self, n: i32) -> Interval {
        if n == 0 {
            return Interval::point(1.0);
        }
        if n < 0 {
            return Interval::point(1.0) / self.powi(-n);
        }
        if n % 2 == 0 && self.contains_zero() {
            let m = self.mag();
            let mut hi = 1.0f64;
            for _ in 0..n {
                hi = mul_up(hi, m);
            }
            return Interval::new(0.0, hi);
        }
        let mut r = self;
        for _ in 1..n {
            r = r * self;
        }
        r
    }

    pub fn exp(self) -> Interval {
        Interval::new(pad_down(self.inf.exp()).max(0.0), pad_up(self.sup.exp()))
    }

    /// Natural logarithm; the interval must be strictly positive.
    pub fn ln(self) -> Interval {
        assert!(self.inf > 0.0, "ln of non-positive interval {self}");
        Interval::new(pad_down(self.inf.ln()), pad_up(self.sup.ln()))
    }

    /// Square root; the interval must be non-negative.
    pub fn sqrt(self) -> Interval {
        assert!(self.inf >= 0.0, "sqrt of negative interval {self}");
        Interval::new(sqrt_down(self.inf), sqrt_up(self.sup))
    }

    pub fn sin(self) -> Interval {
        if !self.inf.is_finite() || !self.sup.is_finite() || self.width() >= TAU {
            return Interval::new(-1.0, 1.0);
        }
        let s_inf = self.inf.sin();
        let s_sup = self.sup.sin();
        let mut lo = pad_down(s_inf.min(s_sup)).max(-1.0);
        let mut hi = pad_up(s_inf.max(s_sup)).min(1.0);
        let two_pi = Interval::PI * Interval::point(2.0);
        let half_pi = Interval::PI * Interval::point(0.5);
        // maxima at pi/2 + 2k*pi, minima at -pi/2 + 2k*pi; the quotient is an
        // over-approximation, so a spurious hit only widens the bound
        if contains_integer((self - half_pi) / two_pi) {
            hi = 1.0;
        }
        if contains_integer((self + half_pi) / two_pi) {
            lo = -1.0;
        }
        Interval::new(lo, hi)
    }

    pub fn cos(self) -> Interval {
        if !self.inf.is_finite() || !self.sup.is_finite() || self.width() >= TAU {
            return Interval::new(-1.0, 1.0);
        }
        let c_inf = self.inf.cos();
        let c_sup = self.sup.cos();
        let mut lo = pad_down(c_inf.min(c_sup)).max(-1.0);
        let mut hi = pad_up(c_inf.max(c_sup)).min(1.0);
        let two_pi = Interval::PI * Interval::point(2.0);
        if contains_integer(self / two_pi) {
            hi = 1.0;
        }
        if contains_integer((self - Interval::PI) / two_pi) {
            lo = -1.0;
        }
        Interval::new(lo, hi)
    }
}

fn contains_integer(t: Interval) -> bool {
    t.sup.floor() >= t.inf.ceil()
}

// ---------------------------------------------------------------------------
// arithmetic

impl Add for Interval {
    type Output = Interval;
    fn add(self, rhs: Interval) -> Interval {
        Interval::new(add_down(self.inf, rhs.inf), add_up(self.sup, rhs.sup))
    }
}

impl Sub for Interval {
    type Output = Interval;
    fn sub(self, rhs: Interval) -> Interval {
        Interval::new(sub_down(self.inf, rhs.sup), sub_up(self.sup, rhs.inf))
    }
}

impl Mul for Interval {
    type Output = Interval;
    fn mul(self, rhs: Interval) -> Interval {
        let (a, b, c, d) = (self.inf, self.sup, rhs.inf, rhs.sup);
        let inf = mul_down(a, c)
            .min(mul_down(a, d))
            .min(mul_down(b, c))
            .min(mul_down(b, d));
        let sup = mul_up(a, c)
            .max(mul_up(a, d))
            .max(mul_up(b, c))
            .max(mul_up(b, d));
        Interval::new(inf, sup)
    }
}

impl Div for Interval {
    type Output = Interval;
    fn div(self, rhs: Interval) -> Interval {
        assert!(
            !rhs.contains_zero(),
            "interval division by zero-containing divisor {rhs}"
        );
        let (a, b, c, d) = (self.inf, self.sup, rhs.inf, rhs.sup);
        let inf = div_down(a, c)
            .min(div_down(a, d))
            .min(div_down(b, c))
            .min(div_down(b, d));
        let sup = div_up(a, c)
            .max(div_up(a, d))
            .max(div_up(b, c))
            .max(div_up(b, d));
        Interval::new(inf, sup)
    }
}

impl Neg for Interval {
    type Output = Interval;
    fn neg(self) -> Interval {
        Interval::new(-self.sup, -self.inf)
    }
}

impl AddAssign for Interval {
    fn add_assign(&mut self, rhs: Interval) {
        *self = *self + rhs;
    }
}
impl SubAssign for Interval {
    fn sub_assign(&mut self, rhs: Interval) {
        *self = *self - rhs;
    }
}
impl MulAssign for Interval {
    fn mul_assign(&mut self, rhs: Interval) {
        *self = *self * rhs;
    }
}
impl DivAssign for Interval {
    fn div_assign(&mut self, rhs: Interval) {
        *self = *self / rhs;
    }
}

impl Zero for Interval {
    fn zero() -> Self {
        Interval::point(0.0)
    }
    fn is_zero(&self) -> bool {
        self.inf == 0.0 && self.sup == 0.0
    }
}

impl One for Interval {
    fn one() -> Self {
        Interval::point(1.0)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:e}, {:e}]", self.inf, self.sup)
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?}]", self.inf, self.sup)
    }
}

impl Scalar for Interval {
    fn from_f64(v: f64) -> Self {
        Interval::point(v)
    }

    fn sin(self) -> Self {
        Interval::sin(self)
    }
    fn cos(self) -> Self {
        Interval::cos(self)
    }
    fn exp(self) -> Self {
        Interval::exp(self)
    }
    fn ln(self) -> Self {
        Interval::ln(self)
    }
    fn sqrt(self) -> Self {
        Interval::sqrt(self)
    }
    fn powi(self, n: i32) -> Self {
        Interval::powi(self, n)
    }

    fn mag(self) -> f64 {
        Interval::mag(self)
    }
    fn mid(self) -> f64 {
        Interval::mid(self)
    }
    fn width(self) -> f64 {
        Interval::width(self)
    }
    fn contains_zero(self) -> bool {
        Interval::contains_zero(self)
    }
    fn strictly_positive(self) -> bool {
        self.inf > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_encloses_exact_sum() {
        let x = Interval::point(0.1) + Interval::point(0.2);
        // 0.1 + 0.2 is inexact in binary; the true sum of the two stored
        // doubles must lie strictly inside the outward-rounded result
        assert!(x.inf <= 0.1f64 + 0.2f64);
        assert!(x.sup >= 0.1f64 + 0.2f64);
        assert!(x.width() < 1e-15);
    }

    #[test]
    fn division_widens_inexact_quotients() {
        let third = Interval::point(1.0) / Interval::point(3.0);
        assert!(third.inf < third.sup);
        assert!(third.contains(1.0 / 3.0));
        assert!(third.inf > 0.333_333);
        assert!(third.sup < 0.333_334);
    }

    #[test]
    #[should_panic]
    fn division_by_zero_containing_interval_panics() {
        let _ = Interval::point(1.0) / Interval::new(-1.0, 1.0);
    }

    #[test]
    fn multiplication_handles_sign_cases() {
        let x = Interval::new(-2.0, 3.0) * Interval::new(-1.0, 4.0);
        assert!(x.contains(-8.0) && x.contains(12.0));
        assert!(x.inf <= -8.0 && x.sup >= 12.0);
        assert!(x.width() < 20.0 + 1e-12);
    }

    #[test]
    fn even_power_of_straddling_interval_is_nonnegative() {
        let x = Interval::new(-2.0, 1.0).powi(2);
        assert_eq!(x.inf, 0.0);
        assert!(x.contains(4.0) && x.sup < 4.0 + 1e-12);
    }

    #[test]
    fn sin_on_quarter_period_is_monotone() {
        let x = Interval::new(0.1, 1.0).sin();
        assert!(x.inf <= 0.1f64.sin() && x.sup >= 1.0f64.sin());
        assert!(x.sup < 1.0);
        assert!(x.width() < 0.76);
    }

    #[test]
    fn sin_detects_interior_maximum() {
        let x = Interval::new(1.0, 2.0).sin();
        assert_eq!(x.sup, 1.0);
        assert!(x.inf <= 1.0f64.sin());
    }

    #[test]
    fn cos_detects_interior_minimum() {
        let x = Interval::new(3.0, 3.3).cos();
        assert_eq!(x.inf, -1.0);
    }

    #[test]
    fn split_reassembles_to_superset() {
        let x = Interval::new(1.0, 2.0);
        let (mid, delta) = x.split();
        let back = mid + delta;
        assert!(x.subset(back));
        assert!(delta.contains_zero());
    }

    #[test]
    fn sqrt_brackets_exact_root() {
        let x = Interval::point(2.0).sqrt();
        assert!(x.contains(std::f64::consts::SQRT_2));
        assert!(x.width() < 1e-15);
        let sq = x.powi(2);
        assert!(sq.contains(2.0));
    }

    #[test]
    fn exp_ln_roundtrip_contains_identity() {
        let x = Interval::new(0.5, 1.5);
        let y = x.exp().ln();
        assert!(x.subset(y));
        assert!(y.width() < x.width() + 1e-12);
    }

    #[test]
    fn intersection_and_hull() {
        let a = Interval::new(0.0, 2.0);
        let b = Interval::new(1.0, 3.0);
        assert_eq!(a.intersection(b).unwrap(), Interval::new(1.0, 2.0));
        assert_eq!(a.hull(b), Interval::new(0.0, 3.0));
        assert!(a.intersection(Interval::new(2.5, 3.0)).is_none());
    }
}
