// Statistical helpers over statrs

use statrs::distribution::{ChiSquared, Continuous, ContinuousCDF};

pub use statrs::function::gamma::ln_gamma;

fn chi2(ndof: f64) -> Option<ChiSquared> {
    ChiSquared::new(ndof).ok()
}

/// χ² cumulative distribution at x (x < 0 gives 0).
pub fn chi2_cdf(x: f64, ndof: f64) -> Option<f64> {
    let dist = chi2(ndof)?;
    Some(if x <= 0.0 { 0.0 } else { dist.cdf(x) })
}

/// χ² probability density at x.
pub fn chi2_pdf(x: f64, ndof: f64) -> Option<f64> {
    let dist = chi2(ndof)?;
    Some(if x < 0.0 { 0.0 } else { dist.pdf(x) })
}

/// ln(Σ exp(xᵢ)) without overflow. Empty input gives -∞.
pub fn logsumexp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

/// ln C(n, k)
pub fn ln_choose(n: u64, k: u64) -> f64 {
    ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)
}

/// Index and value of the maximum, ignoring NaN.
pub fn argmax(xs: &[f64]) -> Option<(usize, f64)> {
    xs.iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best, (i, v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
}

/// Minimum value, ignoring NaN.
pub fn min_value(xs: &[f64]) -> Option<f64> {
    xs.iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(None, |m, v| Some(m.map_or(v, |m: f64| m.min(v))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_chi2_two_dof_closed_form() {
        assert_eq!(chi2_cdf(0.0, 2.0), Some(0.0));
        for &x in &[0.5, 2.0, 9.21] {
            assert_relative_eq!(chi2_cdf(x, 2.0).unwrap(), 1.0 - (-x / 2.0f64).exp(), epsilon = 1e-10);
            assert_relative_eq!(chi2_pdf(x, 2.0).unwrap(), 0.5 * (-x / 2.0f64).exp(), epsilon = 1e-10);
        }
        assert!(chi2_cdf(1.0, 0.0).is_none());
    }

    #[test]
    fn test_logsumexp() {
        assert_relative_eq!(logsumexp(&[1000.0, 1000.0]), 1000.0 + 2f64.ln(), epsilon = 1e-9);
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_ln_choose() {
        assert_relative_eq!(ln_choose(5, 2), 10f64.ln(), epsilon = 1e-10);
        assert_relative_eq!(ln_choose(4, 0), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_argmax_and_min() {
        assert_eq!(argmax(&[1.0, f64::NAN, 3.0, 3.0, 2.0]), Some((2, 3.0)));
        assert_eq!(argmax(&[]), None);
        assert_eq!(min_value(&[2.0, -1.0, 5.0]), Some(-1.0));
    }
}
