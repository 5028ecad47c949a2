//! Time step selection from the decay of the Taylor coefficients.
//!
//! The predicted one-step error of a truncated series with coefficient norm
//! `|a_i|` at order `i` is `|a_i| h^i`; solving `|a_i| h^i = tol` for the
//! last computed orders and taking the most pessimistic answer gives the
//! proposed step. The enclosure validation may still shrink it afterwards.

use log::debug;

/// Tolerance actually applied at the current state: the absolute floor or
/// the relative tolerance scaled by the state magnitude, whichever is
/// larger.
pub fn effective_tolerance(abs_tol: f64, rel_tol: f64, state_norm: f64) -> f64 {
    abs_tol.max(rel_tol * state_norm)
}

/// Zeroes the low mantissa bits of a step candidate, keeping five. Short
/// mantissas keep the accumulated time representable and stop the step
/// sequence from drifting on the last bits.
pub fn clear_mantissa_bits(step: f64) -> f64 {
    if step == 0.0 || !step.is_finite() {
        return step;
    }
    f64::from_bits(step.to_bits() & !((1u64 << 47) - 1))
}

/// Proposes a step from the norms of the highest `terms` computed
/// coefficients, clamped to `[min_step, max_step]`.
///
/// `coeff_norm(i)` must return an upper bound for the magnitude of the
/// order-`i` coefficient (including the variational block when one is being
/// transported).
pub fn next_step(
    coeff_norm: impl Fn(usize) -> f64,
    order: usize,
    terms: usize,
    tol: f64,
    min_step: f64,
    max_step: f64,
) -> f64 {
    let mut opt = 1.5 * max_step;
    let lowest = order.saturating_sub(terms.saturating_sub(1));
    for i in (lowest..=order).rev() {
        if i == 0 {
            break;
        }
        let norm = coeff_norm(i);
        if norm == 0.0 || !norm.is_finite() {
            continue;
        }
        let step = (tol / norm).powf(1.0 / i as f64);
        opt = opt.min(step);
    }
    let step = clear_mantissa_bits(opt.max(min_step)).min(max_step);
    debug!("step control proposed h = {step:e}");
    step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mantissa_clearing_shrinks_by_at_most_one_part_in_32() {
        for &h in &[0.3, 1.7, 0.001, 123.456] {
            let c = clear_mantissa_bits(h);
            assert!(c <= h);
            assert!(c >= h * (1.0 - 1.0 / 32.0));
        }
    }

    #[test]
    fn smaller_tolerance_gives_smaller_step() {
        let norms = |i: usize| 0.5f64.powi(i as i32);
        let loose = next_step(norms, 10, 2, 1e-6, 1e-10, 10.0);
        let tight = next_step(norms, 10, 2, 1e-12, 1e-10, 10.0);
        assert!(tight < loose);
        assert!(tight >= 1e-10);
    }

    #[test]
    fn step_is_clamped_to_admissible_range() {
        // vanishing coefficients would allow an arbitrarily large step
        let h = next_step(|_| 0.0, 10, 2, 1e-10, 1e-6, 0.25);
        assert!(h <= 0.25);
        // enormous coefficients force the minimum
        let h = next_step(|_| 1e300, 10, 2, 1e-10, 1e-6, 0.25);
        assert!(h >= clear_mantissa_bits(1e-6) && h <= 1e-6 * 1.001);
    }

    #[test]
    fn decaying_series_admits_order_of_magnitude_estimate() {
        // |a_i| = 4^-i at tolerance 1e-12: h around (1e-12 * 4^i)^(1/i) -> ~1
        let h = next_step(|i| 4.0f64.powi(-(i as i32)), 20, 2, 1e-12, 1e-10, 100.0);
        assert!(h > 0.5 && h < 4.0);
    }
}
