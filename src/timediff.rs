// Burst-time difference estimators for a pair of detectors
//
// Every estimator takes two event series A and B and returns dt = t_A − t_B
// together with the times it was referenced to. Uncertainty fields are filled
// only by estimators that model them.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::constants::NS_PER_S_F;
use crate::stats::{argmax, ln_choose, ln_gamma, logsumexp};
use crate::time::Timestamp;
use crate::tseries::TimeSeries;

/// Outcome of a pair estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct LagResult {
    /// t_A − t_B as a signed (s, ns) duration
    pub dt: Timestamp,
    pub t1: Timestamp,
    pub t2: Timestamp,
    /// Seconds, observed − true
    pub bias: Option<f64>,
    /// Seconds²
    pub var: Option<f64>,
    /// Signed per-detector contributions to the dt uncertainty, seconds
    pub dsig1: Option<f64>,
    pub dsig2: Option<f64>,
    /// (lag, statistic) scan for likelihood and correlation estimators
    pub profile: Option<(Vec<f64>, Vec<f64>)>,
}

impl LagResult {
    fn new(dt: Timestamp, t1: Timestamp, t2: Timestamp) -> Self {
        LagResult {
            dt,
            t1,
            t2,
            bias: None,
            var: None,
            dsig1: None,
            dsig2: None,
            profile: None,
        }
    }

    pub fn dt_secs(&self) -> f64 {
        self.dt.as_secs_f64()
    }
}

fn secs_to_duration(secs: f64) -> Timestamp {
    Timestamp::from_ns((secs * NS_PER_S_F).round() as i128)
}

fn sorted_secs(ts: &TimeSeries, base: &Timestamp) -> Vec<f64> {
    let mut v = ts.secs_from(base);
    v.sort_by(f64::total_cmp);
    v
}

/// Weighted mean and variance of sorted times with weights exp(−rate·i),
/// i = 1..n. Weights are shifted by one term, which cancels in the ratio.
fn expected_first(sorted: &[f64], rate: f64) -> (f64, f64) {
    let weights: Vec<f64> = (0..sorted.len()).map(|i| (-rate * i as f64).exp()).collect();
    let norm: f64 = weights.iter().sum();
    let mean = weights.iter().zip(sorted).map(|(w, s)| w * s).sum::<f64>() / norm;
    let var = weights
        .iter()
        .zip(sorted)
        .map(|(w, s)| w * (s - mean) * (s - mean))
        .sum::<f64>()
        / norm;
    (mean, var)
}

/// First-event difference corrected for unequal detector yields.
///
/// The raw difference of the earliest events is biased towards the larger
/// detector. The expected first-event time of A is compared with what A would
/// show at B's yield (α = |B|/|A|), and that shift is removed.
pub fn first_event_diff(a: &TimeSeries, b: &TimeSeries, fudge: f64) -> Option<LagResult> {
    let t_a = a.earliest()?;
    let t_b = b.earliest()?;
    let base = t_a.min(t_b);
    let ts1 = sorted_secs(a, &base);
    let ts2 = sorted_secs(b, &base);

    let dtf = (t_a - t_b).as_secs_f64();
    let alpha = ts2.len() as f64 / ts1.len() as f64;
    let (e1, v1) = expected_first(&ts1, 1.0);
    let (e1a, v1a) = expected_first(&ts1, alpha);
    let (_, v2) = expected_first(&ts2, 1.0);

    let dev = dtf - (e1 - e1a);
    let mut result = LagResult::new(secs_to_duration(dev), t_a, t_b);
    result.var = Some(fudge * fudge * (v1 + v1a.max(v2)));
    result.dsig1 = Some(v1.sqrt() * fudge);
    result.dsig2 = Some(-v2.sqrt() * fudge);
    Some(result)
}

/// Earliest offset (ns) at which two consecutive sorted events fall within
/// `window_ns` of each other.
pub fn first_pair_time(ts: &TimeSeries, window_ns: i64) -> Option<Timestamp> {
    let sorted = ts.sorted_offsets();
    sorted
        .windows(2)
        .find(|w| w[1] - w[0] <= window_ns)
        .map(|w| ts.reference.add_ns(w[0]))
}

/// n-th smallest time (1-based) of each series and their difference.
pub fn nth_time_diff(a: &TimeSeries, b: &TimeSeries, n: usize) -> Option<LagResult> {
    if n == 0 {
        return None;
    }
    let ta = a.reference.add_ns(*a.sorted_offsets().get(n - 1)?);
    let tb = b.reference.add_ns(*b.sorted_offsets().get(n - 1)?);
    Some(LagResult::new(ta - tb, ta, tb))
}

/// Which series stays fixed while the other is shifted across the lag grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    First,
    Second,
    /// Whichever series has more events; ties pick the first.
    Largest,
}

/// Per-bin statistic maximised by a lag scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LagStatistic {
    /// Σ[lnΓ(n₁+n₂+1) − lnΓ(n₂+1)]
    NLog,
    /// Poisson signal + background in both detectors, signal marginalised.
    /// Background rates in events/s for the first and second series; `ratio`
    /// is the second/first signal ratio, estimated from counts when `None`.
    NegBinomial {
        bg_first: f64,
        bg_second: f64,
        ratio: Option<f64>,
    },
    /// Σ h₁·h₂
    XCov,
}

/// Lag grid and histogram window shared by all scans.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagScan {
    pub lag_min: f64,
    pub lag_max: f64,
    pub lag_step: f64,
    /// Histogram window width in seconds
    pub twidth: f64,
    pub tnbins: usize,
    /// Window starts this long before the reference's first event
    pub t_lead: f64,
}

impl LagScan {
    fn lags(&self) -> Vec<f64> {
        if !(self.lag_step > 0.0) || self.lag_max < self.lag_min {
            return Vec::new();
        }
        let n = ((self.lag_max - self.lag_min) / self.lag_step + 0.5).floor() as usize + 1;
        (0..n).map(|i| self.lag_min + i as f64 * self.lag_step).collect()
    }
}

/// Histogram event times (seconds) into `nbins` bins over [lo, lo + width).
fn bin_counts(times: &[f64], shift: f64, lo: f64, width: f64, nbins: usize) -> Vec<f64> {
    let mut bins = vec![0.0; nbins];
    let w = width / nbins as f64;
    for &t in times {
        let x = t + shift - lo;
        if x >= 0.0 && x < width {
            let i = ((x / w) as usize).min(nbins - 1);
            bins[i] += 1.0;
        }
    }
    bins
}

fn nb_bin(n1: u64, n2: u64, b1: f64, b2: f64, ratio: f64) -> f64 {
    let mut terms = Vec::with_capacity(((n1 + 1) * (n2 + 1)) as usize);
    for j in 0..=n1 {
        if b1 <= 0.0 && j < n1 {
            continue;
        }
        let bg1 = if n1 > j { (n1 - j) as f64 * b1.ln() } else { 0.0 };
        for l in 0..=n2 {
            if b2 <= 0.0 && l < n2 {
                continue;
            }
            let bg2 = if n2 > l { (n2 - l) as f64 * b2.ln() } else { 0.0 };
            let m = (j + l) as f64;
            terms.push(
                ln_choose(n1, j) + bg1 + ln_choose(n2, l) + bg2 + l as f64 * ratio.ln()
                    + ln_gamma(m + 1.0)
                    - (m + 1.0) * (1.0 + ratio).ln(),
            );
        }
    }
    -b1 - b2 - ln_gamma(n1 as f64 + 1.0) - ln_gamma(n2 as f64 + 1.0) + logsumexp(&terms)
}

/// Statistic with the background and ratio already oriented so that h1 is
/// the fixed series.
enum Oriented {
    NLog,
    NegBinomial { b1: f64, b2: f64, ratio: f64 },
    XCov,
}

fn scan_statistic(h1: &[f64], h2: &[f64], stat: &Oriented) -> f64 {
    match stat {
        Oriented::NLog => h1
            .iter()
            .zip(h2)
            .map(|(&n1, &n2)| ln_gamma(n1 + n2 + 1.0) - ln_gamma(n2 + 1.0))
            .sum(),
        Oriented::NegBinomial { b1, b2, ratio } => h1
            .iter()
            .zip(h2)
            .map(|(&n1, &n2)| nb_bin(n1 as u64, n2 as u64, *b1, *b2, *ratio))
            .sum(),
        Oriented::XCov => h1.iter().zip(h2).map(|(a, b)| a * b).sum(),
    }
}

/// Scan lags and return the one maximising the statistic, with the profile.
pub fn scan_lag(
    a: &TimeSeries,
    b: &TimeSeries,
    scan: &LagScan,
    stat: &LagStatistic,
    reference: Reference,
) -> Option<LagResult> {
    let t_a = a.earliest()?;
    let t_b = b.earliest()?;
    if scan.tnbins == 0 || !(scan.twidth > 0.0) {
        return None;
    }
    let ref_is_a = match reference {
        Reference::First => true,
        Reference::Second => false,
        Reference::Largest => a.len() >= b.len(),
    };
    let (fixed, moving, t_fixed) = if ref_is_a { (a, b, t_a) } else { (b, a, t_b) };

    let base = t_fixed;
    let fixed_secs = fixed.secs_from(&base);
    let moving_secs = moving.secs_from(&base);
    let lo = -scan.t_lead;
    let h1 = bin_counts(&fixed_secs, 0.0, lo, scan.twidth, scan.tnbins);
    let bin_width = scan.twidth / scan.tnbins as f64;
    let oriented = match *stat {
        LagStatistic::NLog => Oriented::NLog,
        LagStatistic::XCov => Oriented::XCov,
        LagStatistic::NegBinomial { bg_first, bg_second, ratio } => {
            let ratio = match ratio {
                Some(r) if ref_is_a => r,
                Some(r) => 1.0 / r,
                None => moving.len() as f64 / fixed.len() as f64,
            };
            let (bg_fixed, bg_moving) = if ref_is_a { (bg_first, bg_second) } else { (bg_second, bg_first) };
            Oriented::NegBinomial {
                b1: bg_fixed * bin_width,
                b2: bg_moving * bin_width,
                ratio: ratio.max(f64::MIN_POSITIVE),
            }
        }
    };

    let lags = scan.lags();
    let values: Vec<f64> = lags
        .iter()
        .map(|&lag| {
            let h2 = bin_counts(&moving_secs, lag, lo, scan.twidth, scan.tnbins);
            scan_statistic(&h1, &h2, &oriented)
        })
        .collect();
    let (best, _) = argmax(&values)?;

    // fixed ≈ moving + lag, so dt = lag when A is fixed and −lag otherwise
    let sign = if ref_is_a { 1.0 } else { -1.0 };
    let dts: Vec<f64> = lags.iter().map(|l| sign * l).collect();
    let mut result = LagResult::new(secs_to_duration(dts[best]), t_a, t_b);
    result.profile = Some((dts, values));
    Some(result)
}

/// Histogram two series on a common window and return FT(A)·conj(FT(B)) for
/// the non-negative frequencies, as (re, im).
pub fn cross_spectrum(
    a: &TimeSeries,
    b: &TimeSeries,
    tnbins: usize,
    twidth: f64,
    t_lead: f64,
) -> Option<(Vec<f64>, Vec<f64>)> {
    let full = full_cross_spectrum(a, b, tnbins, twidth, t_lead)?;
    let keep = tnbins / 2 + 1;
    Some((
        full.iter().take(keep).map(|c| c.re).collect(),
        full.iter().take(keep).map(|c| c.im).collect(),
    ))
}

fn full_cross_spectrum(
    a: &TimeSeries,
    b: &TimeSeries,
    tnbins: usize,
    twidth: f64,
    t_lead: f64,
) -> Option<Vec<Complex<f64>>> {
    if tnbins == 0 || !(twidth > 0.0) {
        return None;
    }
    let base = a.earliest()?.min(b.earliest()?);
    let lo = -t_lead;
    let to_complex = |v: Vec<f64>| -> Vec<Complex<f64>> { v.into_iter().map(|x| Complex::new(x, 0.0)).collect() };
    let mut f1 = to_complex(bin_counts(&a.secs_from(&base), 0.0, lo, twidth, tnbins));
    let mut f2 = to_complex(bin_counts(&b.secs_from(&base), 0.0, lo, twidth, tnbins));

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(tnbins);
    fft.process(&mut f1);
    fft.process(&mut f2);
    Some(f1.iter().zip(&f2).map(|(x, y)| x * y.conj()).collect())
}

/// dt recovered from the peak of the circular cross-correlation.
pub fn xfft_lag(a: &TimeSeries, b: &TimeSeries, tnbins: usize, twidth: f64, t_lead: f64) -> Option<LagResult> {
    let mut spectrum = full_cross_spectrum(a, b, tnbins, twidth, t_lead)?;
    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_inverse(tnbins).process(&mut spectrum);
    let corr: Vec<f64> = spectrum.iter().map(|c| c.re).collect();
    let (m, _) = argmax(&corr)?;
    let shift = if m > tnbins / 2 { m as i64 - tnbins as i64 } else { m as i64 };
    let dt = shift as f64 * twidth / tnbins as f64;
    Some(LagResult::new(secs_to_duration(dt), a.earliest()?, b.earliest()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn series(times: &[f64]) -> TimeSeries {
        TimeSeries::from_secs(Timestamp::default(), times)
    }

    /// Deterministic burst-like profile: dense early, sparse later.
    fn burst(offset: f64, n: usize) -> TimeSeries {
        let times: Vec<f64> = (0..n)
            .map(|i| offset + 0.002 * (i as f64).powf(1.3) + 0.0001 * ((i * 7919) % 13) as f64)
            .collect();
        series(&times)
    }

    #[test]
    fn test_nth_time_diff() {
        let a = series(&[-0.1, 0.1, 0.2, 0.5]);
        let b = series(&[-0.5, 0.3, 0.6, 1.0]);
        let r = nth_time_diff(&a, &b, 1).unwrap();
        assert_relative_eq!(r.dt_secs(), 0.4, epsilon = 1e-9);
        let r = nth_time_diff(&a, &b, 2).unwrap();
        assert_relative_eq!(r.dt_secs(), -0.2, epsilon = 1e-9);
        assert!(nth_time_diff(&a, &b, 5).is_none());
        assert!(nth_time_diff(&a, &b, 0).is_none());
    }

    #[test]
    fn test_first_pair_time() {
        let ts = series(&[0.9, 0.1, 0.5, 0.52, 0.53]);
        let t = first_pair_time(&ts, 30_000_000).unwrap();
        assert_eq!(t, Timestamp::new(0, 500_000_000));
        assert!(first_pair_time(&ts, 5_000_000).is_none());
    }

    #[test]
    fn test_first_event_equal_yields_is_unbiased() {
        let a = burst(0.010, 50);
        let b = burst(0.0, 50);
        let r = first_event_diff(&a, &b, 1.0).unwrap();
        // alpha = 1: no correction, dt equals the raw first-event difference
        assert_relative_eq!(r.dt_secs(), 0.010, epsilon = 1e-9);
        assert!(r.var.unwrap() >= 0.0);
        assert!(r.dsig1.unwrap() >= 0.0);
        assert!(r.dsig2.unwrap() <= 0.0);
    }

    #[test]
    fn test_first_event_fudge_scales_uncertainty() {
        let a = burst(0.0, 40);
        let b = burst(0.0, 80);
        let r1 = first_event_diff(&a, &b, 1.0).unwrap();
        let r2 = first_event_diff(&a, &b, 2.0).unwrap();
        assert_relative_eq!(r2.var.unwrap(), 4.0 * r1.var.unwrap(), max_relative = 1e-12);
        assert_relative_eq!(r2.dsig1.unwrap(), 2.0 * r1.dsig1.unwrap(), max_relative = 1e-12);
        assert_eq!(r1.dt, r2.dt);
    }

    fn scan() -> LagScan {
        LagScan {
            lag_min: -0.05,
            lag_max: 0.05,
            lag_step: 0.001,
            twidth: 0.5,
            tnbins: 100,
            t_lead: 0.06,
        }
    }

    #[test]
    fn test_xcov_recovers_shift() {
        let a = burst(0.020, 200);
        let b = burst(0.0, 200);
        let r = scan_lag(&a, &b, &scan(), &LagStatistic::XCov, Reference::First).unwrap();
        assert!((r.dt_secs() - 0.020).abs() <= 0.0076, "dt {}", r.dt_secs());
        let (x, y) = r.profile.unwrap();
        assert_eq!(x.len(), 101);
        assert_eq!(y.len(), 101);
    }

    #[test]
    fn test_reference_choice_keeps_sign() {
        let a = burst(0.020, 200);
        let b = burst(0.0, 200);
        let r1 = scan_lag(&a, &b, &scan(), &LagStatistic::XCov, Reference::First).unwrap();
        let r2 = scan_lag(&a, &b, &scan(), &LagStatistic::XCov, Reference::Second).unwrap();
        assert!((r1.dt_secs() - r2.dt_secs()).abs() <= 0.0076);
        assert!(r2.dt_secs() > 0.0);
    }

    #[test]
    fn test_nlog_and_nb_find_positive_shift() {
        let a = burst(0.015, 150);
        let b = burst(0.0, 150);
        let r = scan_lag(&a, &b, &scan(), &LagStatistic::NLog, Reference::Largest).unwrap();
        assert!(r.dt_secs() > 0.0);
        let nb = LagStatistic::NegBinomial {
            bg_first: 10.0,
            bg_second: 10.0,
            ratio: None,
        };
        let r = scan_lag(&a, &b, &scan(), &nb, Reference::First).unwrap();
        assert!((r.dt_secs() - 0.015).abs() <= 0.0076, "dt {}", r.dt_secs());
    }

    #[test]
    fn test_nb_bin_without_background_matches_closed_form() {
        // b = 0, ratio = 1: lnΓ(n1+n2+1) − (n1+n2+1)ln2 − lnΓ(n1+1) − lnΓ(n2+1)
        let (n1, n2) = (3u64, 5u64);
        let expected = ln_gamma(9.0) - 9.0 * 2f64.ln() - ln_gamma(4.0) - ln_gamma(6.0);
        assert_relative_eq!(nb_bin(n1, n2, 0.0, 0.0, 1.0), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_xfft_lag() {
        let a = burst(0.040, 300);
        let b = burst(0.0, 300);
        let r = xfft_lag(&a, &b, 256, 1.024, 0.0).unwrap();
        assert!((r.dt_secs() - 0.040).abs() <= 0.0081, "dt {}", r.dt_secs());

        let (re, im) = cross_spectrum(&a, &b, 256, 1.024, 0.0).unwrap();
        assert_eq!(re.len(), 129);
        assert_eq!(im.len(), 129);
        // DC term is the product of the totals and purely real
        assert!(im[0].abs() < 1e-9);
    }
}
