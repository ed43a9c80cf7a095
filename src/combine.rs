// Map combination and conversions
//
// Skymaps are nested-order HEALPix arrays. χ² maps add (with their degrees
// of freedom); confidence-level maps multiply. Maps at different resolutions
// are brought to the finest one before combining.

use std::rc::Rc;

use crate::error::NodeError;
use crate::healpix;
use crate::pointing::subtract_min;
use crate::stats::{chi2_cdf, chi2_pdf};

/// One source's map as stored by a combiner.
#[derive(Debug, Clone, PartialEq)]
pub enum SkyMap {
    Chi2 { map: Rc<Vec<f64>>, ndof: f64 },
    Cl(Rc<Vec<f64>>),
}

impl SkyMap {
    pub fn len(&self) -> usize {
        match self {
            SkyMap::Chi2 { map, .. } => map.len(),
            SkyMap::Cl(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_chi2(&self) -> bool {
        matches!(self, SkyMap::Chi2 { .. })
    }

    /// The map as confidence levels.
    fn to_cl(&self) -> Result<Vec<f64>, NodeError> {
        match self {
            SkyMap::Chi2 { map, ndof } => chi2_to_cl(map, *ndof),
            SkyMap::Cl(map) => Ok(map.as_ref().clone()),
        }
    }
}

/// Bring a map to `nside`; maps already there are returned as is.
pub fn reconcile(map: Vec<f64>, nside: u32) -> Result<Vec<f64>, NodeError> {
    if map.len() == healpix::nside2npix(nside) {
        return Ok(map);
    }
    healpix::upgrade(&map, nside)
        .ok_or_else(|| NodeError::domain(format!("cannot upgrade a map of {} pixels to nside {}", map.len(), nside)))
}

/// Combine maps: χ² sum when every map is χ² and `force_cl` is off,
/// otherwise the product of confidence levels. Empty input is an error.
pub fn combine(maps: &[&SkyMap], force_cl: bool) -> Result<SkyMap, NodeError> {
    let npix = maps
        .iter()
        .map(|m| m.len())
        .max()
        .ok_or_else(|| NodeError::domain("no maps to combine"))?;
    let nside = healpix::npix2nside(npix)
        .ok_or_else(|| NodeError::domain(format!("{} is not a HEALPix pixel count", npix)))?;
    for m in maps {
        if healpix::npix2nside(m.len()).is_none() {
            return Err(NodeError::domain(format!("{} is not a HEALPix pixel count", m.len())));
        }
    }

    if !force_cl && maps.iter().all(|m| m.is_chi2()) {
        let mut sum = vec![0.0; npix];
        let mut total_ndof = 0.0;
        for m in maps {
            if let SkyMap::Chi2 { map, ndof } = m {
                let map = reconcile(map.as_ref().clone(), nside)?;
                sum.iter_mut().zip(&map).for_each(|(s, v)| *s += v);
                total_ndof += ndof;
            }
        }
        return Ok(SkyMap::Chi2 {
            map: Rc::new(sum),
            ndof: total_ndof,
        });
    }

    let mut product = vec![1.0; npix];
    for m in maps {
        let cl = reconcile(m.to_cl()?, nside)?;
        product.iter_mut().zip(&cl).for_each(|(p, v)| *p *= v);
    }
    Ok(SkyMap::Cl(Rc::new(product)))
}

/// 1 − χ²-CDF(map − min, ndof). The best pixel maps to 1.
pub fn chi2_to_cl(map: &[f64], ndof: f64) -> Result<Vec<f64>, NodeError> {
    let mut shifted = map.to_vec();
    subtract_min(&mut shifted);
    shifted
        .iter()
        .map(|&x| chi2_cdf(x, ndof).map(|v| 1.0 - v))
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| NodeError::domain(format!("invalid degrees of freedom {}", ndof)))
}

/// χ²-PDF(map − min, ndof), normalised to unit sum.
pub fn chi2_to_prob(map: &[f64], ndof: f64) -> Result<Vec<f64>, NodeError> {
    let mut shifted = map.to_vec();
    subtract_min(&mut shifted);
    let pdf = shifted
        .iter()
        .map(|&x| chi2_pdf(x, ndof))
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| NodeError::domain(format!("invalid degrees of freedom {}", ndof)))?;
    normalise(pdf)
}

fn normalise(mut v: Vec<f64>) -> Result<Vec<f64>, NodeError> {
    let total: f64 = v.iter().filter(|x| x.is_finite()).sum();
    if !(total > 0.0) {
        return Err(NodeError::numerical("probability map has no mass"));
    }
    v.iter_mut().for_each(|x| *x /= total);
    Ok(v)
}

/// Credible levels of a probability map, reported as 1 − level so that the
/// most probable pixel gets 1.
///
/// Pixels are ranked by probability; each gets 1 minus the cumulative
/// probability of every strictly more probable pixel. The pixels with
/// output > 1 − X are then the smallest set holding at least X of the mass,
/// so the 90% credible region is {output > 0.1}.
pub fn prob_to_cl(map: &[f64]) -> Result<Vec<f64>, NodeError> {
    let prob = normalise(map.to_vec())?;
    let mut order: Vec<usize> = (0..prob.len()).collect();
    order.sort_by(|&a, &b| prob[b].total_cmp(&prob[a]));
    let mut out = vec![0.0; prob.len()];
    let mut above: f64 = 0.0;
    for i in order {
        out[i] = (1.0 - above).clamp(0.0, 1.0);
        above += prob[i];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(n: usize, step: f64) -> Rc<Vec<f64>> {
        Rc::new((0..n).map(|i| i as f64 * step).collect())
    }

    #[test]
    fn test_chi2_sum_keeps_finest_resolution() {
        let a = SkyMap::Chi2 { map: ramp(48, 1.0), ndof: 2.0 };
        let b = SkyMap::Chi2 { map: ramp(192, 0.5), ndof: 2.0 };
        let out = combine(&[&a, &b], false).unwrap();
        match out {
            SkyMap::Chi2 { map, ndof } => {
                assert_eq!(map.len(), 192);
                assert_eq!(ndof, 4.0);
                // fine pixel 5 has coarse parent 1
                assert_relative_eq!(map[5], 1.0 + 2.5);
                assert_eq!(healpix::npix2nside(map.len()), Some(4));
            }
            other => panic!("expected chi2, got {:?}", other),
        }
    }

    #[test]
    fn test_mixed_inputs_multiply_cl() {
        let cl: Vec<f64> = (0..48).map(|i| (i % 4) as f64 * 0.25).collect();
        let a = SkyMap::Cl(Rc::new(cl.clone()));
        let b = SkyMap::Chi2 { map: ramp(48, 2.0 / 48.0), ndof: 2.0 };
        let out = combine(&[&a, &b], false).unwrap();
        let SkyMap::Cl(map) = out else { panic!("expected CL") };
        for i in 0..48 {
            let x = i as f64 * 2.0 / 48.0;
            let expected = cl[i] * (-x / 2.0).exp();
            assert_relative_eq!(map[i], expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_force_cl() {
        let a = SkyMap::Chi2 { map: ramp(12, 1.0), ndof: 2.0 };
        assert!(!combine(&[&a], true).unwrap().is_chi2());
        assert!(combine(&[], false).is_err());
    }

    #[test]
    fn test_cl_upsample_then_multiply() {
        let a = SkyMap::Cl(Rc::new((0..48).map(|i| i as f64 / 48.0).collect()));
        let b = SkyMap::Cl(Rc::new(vec![0.5; 192]));
        let SkyMap::Cl(map) = combine(&[&a, &b], false).unwrap() else { panic!() };
        assert_eq!(map.len(), 192);
        assert_relative_eq!(map[4 * 10 + 3], 0.5 * 10.0 / 48.0);
    }

    #[test]
    fn test_invalid_pixel_count() {
        let a = SkyMap::Cl(Rc::new(vec![1.0; 50]));
        assert!(matches!(combine(&[&a], false), Err(NodeError::Domain(_))));
    }

    #[test]
    fn test_chi2_to_cl_best_pixel_is_one() {
        let map = vec![5.0, 3.0, 7.0, 10.0];
        let cl = chi2_to_cl(&map, 2.0).unwrap();
        assert_relative_eq!(cl[1], 1.0);
        assert_relative_eq!(cl[0], (-1.0f64).exp(), epsilon = 1e-12);
        assert!(cl.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_chi2_to_prob_normalised() {
        let p = chi2_to_prob(&[1.0, 2.0, 3.0, 1.0], 2.0).unwrap();
        assert_relative_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(p[0], p[3]);
        assert!(p[0] > p[1] && p[1] > p[2]);
    }

    fn region_mass(prob: &[f64], cl: &[f64], level: f64) -> f64 {
        prob.iter().zip(cl).filter(|(_, c)| **c > 1.0 - level + 1e-12).map(|(p, _)| p).sum()
    }

    #[test]
    fn test_prob_to_cl_region() {
        let prob = vec![0.05, 0.5, 0.3, 0.1, 0.05];
        let cl = prob_to_cl(&prob).unwrap();
        assert_relative_eq!(cl[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(cl[2], 0.5, epsilon = 1e-12);
        assert_relative_eq!(cl[3], 0.2, epsilon = 1e-12);
        assert!(cl[0] < 0.1 + 1e-12 && cl[4] < 0.1 + 1e-12);
        assert!(cl.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_relative_eq!(region_mass(&prob, &cl, 0.9), 0.9, epsilon = 1e-12);
        assert!(prob_to_cl(&[0.0, 0.0]).is_err());
    }

    #[test]
    fn test_prob_to_cl_region_holds_its_mass() {
        // a peaked map where the top pixel alone falls short of 90%
        let prob = vec![0.6, 0.35, 0.05];
        let cl = prob_to_cl(&prob).unwrap();
        assert_relative_eq!(cl[0], 1.0);
        assert!(region_mass(&prob, &cl, 0.9) >= 0.9);

        // broad unnormalised map over 48 pixels
        let raw: Vec<f64> = (0..48).map(|i| (-((i as f64 - 20.0) / 6.0).powi(2)).exp()).collect();
        let total: f64 = raw.iter().sum();
        let prob: Vec<f64> = raw.iter().map(|x| x / total).collect();
        let cl = prob_to_cl(&raw).unwrap();
        for level in [0.5, 0.9, 0.99] {
            let mass = region_mass(&prob, &cl, level);
            assert!(mass >= level - 1e-12, "level {} holds {}", level, mass);
        }
        let best = (0..48).max_by(|&a, &b| cl[a].total_cmp(&cl[b])).unwrap();
        assert_eq!(best, 20);
    }
}
