// Pointing: χ² skymaps over HEALPix pixels
//
// Two estimators share this module:
// - a weighted least-squares fit of pairwise burst-time differences, with the
//   covariance of pairs that share a detector
// - a top-down fit of full time profiles, shifting each detector's events to
//   the geocentre for every candidate direction
//
// All pair quantities are in milliseconds; positions are in meters.

use nalgebra as na;
use na::{DMatrix, DVector};

use crate::constants::{C_LIGHT, MS_PER_S, NS_PER_S_F};
use crate::error::NodeError;
use crate::geodesy::dot;
use crate::stats::min_value;
use crate::time::Timestamp;
use crate::tseries::TimeSeries;

/// One detector pair, all times in ms. Bias is observed − true.
#[derive(Debug, Clone, PartialEq)]
pub struct PairRow {
    pub det1: String,
    pub det2: String,
    pub dt: f64,
    pub t1: Timestamp,
    pub t2: Timestamp,
    pub bias: f64,
    pub var: f64,
    /// Signed timing contributions of det1 and det2; the covariance of two
    /// pairs sharing a detector is the product of the matching entries.
    pub dsig1: f64,
    pub dsig2: f64,
}

impl PairRow {
    /// Same pair seen as (det2, det1).
    pub fn reversed(&self) -> PairRow {
        PairRow {
            det1: self.det2.clone(),
            det2: self.det1.clone(),
            dt: -self.dt,
            t1: self.t2,
            t2: self.t1,
            bias: -self.bias,
            var: self.var,
            dsig1: -self.dsig2,
            dsig2: -self.dsig1,
        }
    }
}

/// Covariance of the pair dt measurements.
pub fn pair_covariance(rows: &[PairRow]) -> DMatrix<f64> {
    let n = rows.len();
    DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            return rows[i].var;
        }
        let (a, b) = (&rows[i], &rows[j]);
        let mut c = 0.0;
        if a.det1 == b.det1 {
            c += a.dsig1 * b.dsig1;
        }
        if a.det1 == b.det2 {
            c += a.dsig1 * b.dsig2;
        }
        if a.det2 == b.det1 {
            c += a.dsig2 * b.dsig1;
        }
        if a.det2 == b.det2 {
            c += a.dsig2 * b.dsig2;
        }
        c
    })
}

/// χ² map from pairwise time differences.
///
/// `baselines[k]` is (p₁ − p₂) of pair k in meters, evaluated at the event
/// times. For a source direction r, the residual of pair k is
/// (dt − bias) + (p₁ − p₂)·r / c, which vanishes at the true direction.
/// The returned map has its minimum subtracted.
pub fn diff_skymap(
    rows: &[PairRow],
    baselines: &[[f64; 3]],
    pixels: &[[f64; 3]],
) -> Result<Vec<f64>, NodeError> {
    if rows.is_empty() || rows.len() != baselines.len() {
        return Err(NodeError::domain(format!(
            "{} pairs but {} baselines",
            rows.len(),
            baselines.len()
        )));
    }
    let cov = pair_covariance(rows);
    let precision = cov
        .try_inverse()
        .filter(|m| m.iter().all(|v| v.is_finite()))
        .ok_or_else(|| NodeError::numerical("pair covariance matrix is singular"))?;

    // light travel time in ms per unit direction
    let dp: Vec<[f64; 3]> = baselines
        .iter()
        .map(|b| {
            let k = MS_PER_S / C_LIGHT;
            [b[0] * k, b[1] * k, b[2] * k]
        })
        .collect();
    let observed: Vec<f64> = rows.iter().map(|r| r.dt - r.bias).collect();

    let mut d = DVector::zeros(rows.len());
    let mut map = Vec::with_capacity(pixels.len());
    for r in pixels {
        for (k, p) in dp.iter().enumerate() {
            d[k] = observed[k] + dot(*p, *r);
        }
        map.push((d.transpose() * &precision * &d)[(0, 0)]);
    }
    subtract_min(&mut map);
    Ok(map)
}

pub fn subtract_min(map: &mut [f64]) {
    if let Some(min) = min_value(map) {
        map.iter_mut().for_each(|v| *v -= min);
    }
}

/// Histogram window and background options for top-down fits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopDownParams {
    pub tnbins: usize,
    /// Window width in seconds
    pub twidth: f64,
    /// Window start relative to the common reference time, seconds
    pub t_start: f64,
    /// Background estimated from this many seconds before the window, if set
    pub lead: Option<f64>,
}

/// One detector's contribution to a top-down fit.
pub struct DetectorSeries<'a> {
    pub series: &'a TimeSeries,
    /// Geocentric position in meters
    pub position: [f64; 3],
}

/// −2 ln λ map from full time profiles, minimum subtracted.
///
/// For each direction r every event time t is moved to the geocentre as
/// t + p·r/c, the shifted series are binned on a window starting `t_start`
/// seconds after `base` and summed into a unit-area reference profile. Each
/// detector is fitted as its own count times that profile (plus background
/// when `lead` is set), and λ is the Poisson likelihood of that fit over the
/// likelihood of the observed counts themselves. The ratio keeps pixels
/// comparable when the shift moves events across the window edges.
pub fn top_down_skymap(
    inputs: &[DetectorSeries<'_>],
    base: &Timestamp,
    pixels: &[[f64; 3]],
    params: &TopDownParams,
) -> Result<Vec<f64>, NodeError> {
    if inputs.is_empty() {
        return Err(NodeError::domain("no detector series"));
    }
    if params.tnbins == 0 || !(params.twidth > 0.0) {
        return Err(NodeError::schema("tnbins and twidth must be positive"));
    }
    if inputs.iter().all(|d| d.series.is_empty()) {
        return Err(NodeError::domain("all detector series are empty"));
    }

    let times: Vec<Vec<f64>> = inputs.iter().map(|d| d.series.secs_from(base)).collect();
    let lo = params.t_start;
    let w = params.twidth / params.tnbins as f64;

    // background counts per bin, from unshifted events in the lead window
    let backgrounds: Vec<f64> = match params.lead {
        Some(lead) if lead > 0.0 => times
            .iter()
            .map(|ts| {
                let n = ts.iter().filter(|&&t| t >= lo - lead && t < lo).count();
                n as f64 * w / lead
            })
            .collect(),
        _ => vec![0.0; inputs.len()],
    };

    let mut counts = vec![vec![0.0; params.tnbins]; inputs.len()];
    let mut map = Vec::with_capacity(pixels.len());
    for r in pixels {
        for (i, d) in inputs.iter().enumerate() {
            let shift = dot(d.position, *r) / C_LIGHT;
            let bins = &mut counts[i];
            bins.iter_mut().for_each(|b| *b = 0.0);
            for &t in &times[i] {
                let x = t + shift - lo;
                if x >= 0.0 && x < params.twidth {
                    bins[((x / w) as usize).min(params.tnbins - 1)] += 1.0;
                }
            }
        }
        map.push(poisson_deviance(&counts, &backgrounds));
    }
    subtract_min(&mut map);
    Ok(map)
}

/// Baker-Cousins χ²: 2 Σ [μ − n + n ln(n/μ)] over detectors and bins.
fn poisson_deviance(counts: &[Vec<f64>], backgrounds: &[f64]) -> f64 {
    let nbins = counts.first().map_or(0, Vec::len);
    let mut reference = vec![0.0; nbins];
    for (bins, bg) in counts.iter().zip(backgrounds) {
        for (r, n) in reference.iter_mut().zip(bins) {
            *r += (n - bg).max(0.0);
        }
    }
    let area: f64 = reference.iter().sum();
    if area > 0.0 {
        reference.iter_mut().for_each(|r| *r /= area);
    }

    let mut total = 0.0;
    for (bins, &bg) in counts.iter().zip(backgrounds) {
        let signal = (bins.iter().sum::<f64>() - bg * nbins as f64).max(0.0);
        for (&n, r) in bins.iter().zip(&reference) {
            let mu = signal * r + bg;
            if mu <= 0.0 {
                // n must be 0 here, contributing nothing
                continue;
            }
            total += mu - n;
            if n > 0.0 {
                total += n * (n / mu).ln();
            }
        }
    }
    2.0 * total
}

/// Pair baseline in meters from detector positions.
pub fn baseline(p1: [f64; 3], p2: [f64; 3]) -> [f64; 3] {
    [p1[0] - p2[0], p1[1] - p2[1], p1[2] - p2[2]]
}

/// Predicted dt (s) between two detectors for a source direction.
pub fn predicted_dt(p1: [f64; 3], p2: [f64; 3], direction: [f64; 3]) -> f64 {
    -dot(baseline(p1, p2), direction) / C_LIGHT
}

/// Convert a duration to ms.
pub fn to_ms(t: &Timestamp) -> f64 {
    t.total_ns() as f64 / NS_PER_S_F * MS_PER_S
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::{llh2ecef, radec_to_unit};
    use crate::healpix;

    fn row(d1: &str, d2: &str, dt_ms: f64, s1: f64, s2: f64) -> PairRow {
        PairRow {
            det1: d1.into(),
            det2: d2.into(),
            dt: dt_ms,
            t1: Timestamp::default(),
            t2: Timestamp::default(),
            bias: 0.0,
            var: s1 * s1 + s2 * s2,
            dsig1: s1,
            dsig2: -s2,
        }
    }

    #[test]
    fn test_covariance_shared_detectors() {
        let rows = vec![row("A", "B", 0.0, 1.0, 2.0), row("A", "C", 0.0, 1.0, 3.0), row("B", "C", 0.0, 2.0, 3.0)];
        let c = pair_covariance(&rows);
        assert_eq!(c[(0, 0)], 5.0);
        assert_eq!(c[(0, 1)], 1.0); // shared A
        assert_eq!(c[(0, 2)], -4.0); // B second in one, first in the other
        assert_eq!(c[(1, 2)], 9.0); // shared C in second position
        assert_eq!(c, c.transpose());
    }

    #[test]
    fn test_reversed_row() {
        let r = row("A", "B", 3.0, 1.0, 2.0).reversed();
        assert_eq!(r.det1, "B");
        assert_eq!(r.dt, -3.0);
        assert_eq!(r.dsig1, 2.0);
        assert_eq!(r.dsig2, -1.0);
    }

    #[test]
    fn test_diff_skymap_minimum_at_truth() {
        let positions = [
            llh2ecef(-89.99, -63.45, 0.0),
            llh2ecef(36.43, 137.31, 370.0),
            llh2ecef(42.42, 13.51, 0.0),
            llh2ecef(22.12, 112.52, 0.0),
        ];
        let truth = radec_to_unit(100.0, 20.0);
        let pairs = [(0usize, 1usize), (0, 2), (0, 3)];
        let mut rows = Vec::new();
        let mut baselines = Vec::new();
        for &(i, j) in &pairs {
            let dt = predicted_dt(positions[i], positions[j], truth) * MS_PER_S;
            rows.push(row(&i.to_string(), &j.to_string(), dt, 1.0, 1.0));
            baselines.push(baseline(positions[i], positions[j]));
        }
        let nside = 16;
        let pixels: Vec<[f64; 3]> = (0..healpix::nside2npix(nside)).map(|p| healpix::pix2vec(nside, p)).collect();
        let map = diff_skymap(&rows, &baselines, &pixels).unwrap();
        assert_eq!(map.len(), healpix::nside2npix(nside));
        assert_eq!(min_value(&map), Some(0.0));
        let best = crate::stats::argmax(&map.iter().map(|v| -v).collect::<Vec<_>>()).unwrap().0;
        let angle = crate::geodesy::angle_between(pixels[best], truth);
        assert!(angle < 5.0, "best pixel {} deg from truth", angle);
    }

    #[test]
    fn test_singular_covariance_is_numerical_error() {
        let rows = vec![row("A", "B", 0.0, 0.0, 0.0)];
        let err = diff_skymap(&rows, &[[1.0, 0.0, 0.0]], &[[0.0, 0.0, 1.0]]).unwrap_err();
        assert!(matches!(err, NodeError::Numerical(_)));
    }

    #[test]
    fn test_top_down_prefers_truth() {
        let positions = [llh2ecef(36.43, 137.31, 370.0), llh2ecef(42.42, 13.51, 0.0), llh2ecef(-89.99, -63.45, 0.0)];
        let truth = radec_to_unit(250.0, -30.0);
        let antipode = [-truth[0], -truth[1], -truth[2]];
        let profile: Vec<f64> = (0..400).map(|i| 0.0005 * (i as f64).powf(1.4)).collect();
        let series: Vec<TimeSeries> = positions
            .iter()
            .map(|p| {
                // arrival at detector = geocentre time − p·r/c
                let shift = -dot(*p, truth) / C_LIGHT;
                let times: Vec<f64> = profile.iter().map(|t| 1.0 + t + shift).collect();
                TimeSeries::from_secs(Timestamp::default(), &times)
            })
            .collect();
        let inputs: Vec<DetectorSeries<'_>> = series
            .iter()
            .zip(positions)
            .map(|(s, p)| DetectorSeries { series: s, position: p })
            .collect();
        let nside = 8;
        let mut pixels: Vec<[f64; 3]> = (0..healpix::nside2npix(nside)).map(|p| healpix::pix2vec(nside, p)).collect();
        pixels.push(truth);
        pixels.push(antipode);
        // 5 ms bins, edges clear of every event
        let params = TopDownParams {
            tnbins: 40,
            twidth: 0.2,
            t_start: -0.0502,
            lead: None,
        };
        let map = top_down_skymap(&inputs, &Timestamp::from_secs_f64(1.0), &pixels, &params).unwrap();
        assert_eq!(map.len(), pixels.len());
        assert_eq!(min_value(&map), Some(0.0));
        let n = pixels.len();
        assert!(map[n - 2] < 1e-9, "truth scores {}", map[n - 2]);
        assert!(map[n - 1] > 1.0, "antipode scores {}", map[n - 1]);

        let truth_pix = healpix::vec2pix(nside, truth);
        let far_pix = healpix::vec2pix(nside, antipode);
        assert!(map[truth_pix] < map[far_pix]);
    }

    #[test]
    fn test_poisson_deviance_zero_for_matching_profiles() {
        let counts = vec![vec![0.0, 3.0, 1.0], vec![0.0, 6.0, 2.0]];
        assert!(poisson_deviance(&counts, &[0.0, 0.0]).abs() < 1e-12);
        let shifted = vec![vec![0.0, 3.0, 1.0], vec![6.0, 2.0, 0.0]];
        assert!(poisson_deviance(&shifted, &[0.0, 0.0]) > 1.0);
    }
}
