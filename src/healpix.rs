// HEALPix pixelisation, NESTED ordering only
//
// Pixel p at resolution nside (a power of two) decomposes into a base face
// and (ix, iy) coordinates whose bits are interleaved in p. Each pixel at
// nside maps to four contiguous pixels at 2*nside.

use std::f64::consts::{FRAC_PI_2, PI};

const JRLL: [i64; 12] = [2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4];
const JPLL: [i64; 12] = [1, 3, 5, 7, 0, 2, 4, 6, 1, 3, 5, 7];

pub fn is_valid_nside(nside: u32) -> bool {
    nside > 0 && nside.is_power_of_two() && nside <= (1 << 29)
}

pub fn nside2npix(nside: u32) -> usize {
    12 * nside as usize * nside as usize
}

/// Inverse of `nside2npix`; `None` unless npix is 12·nside² with nside a
/// power of two.
pub fn npix2nside(npix: usize) -> Option<u32> {
    if npix == 0 || npix % 12 != 0 {
        return None;
    }
    let nside = ((npix / 12) as f64).sqrt().round() as u32;
    if nside2npix(nside) == npix && is_valid_nside(nside) {
        Some(nside)
    } else {
        None
    }
}

fn order(nside: u32) -> u32 {
    nside.trailing_zeros()
}

/// Spread the low 32 bits of v into the even bit positions.
fn spread_bits(v: u64) -> u64 {
    let mut x = v & 0xffff_ffff;
    x = (x | (x << 16)) & 0x0000_ffff_0000_ffff;
    x = (x | (x << 8)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    (x | (x << 1)) & 0x5555_5555_5555_5555
}

/// Gather the even bit positions of v into the low bits.
fn compress_bits(v: u64) -> u64 {
    let mut x = v & 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x >> 4)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x >> 8)) & 0x0000_ffff_0000_ffff;
    (x | (x >> 16)) & 0x0000_0000_ffff_ffff
}

fn nest2xyf(nside: u32, pix: u64) -> (i64, i64, usize) {
    let npface = nside as u64 * nside as u64;
    let face = (pix >> (2 * order(nside))) as usize;
    let p = pix & (npface - 1);
    (compress_bits(p) as i64, compress_bits(p >> 1) as i64, face)
}

fn xyf2nest(nside: u32, ix: i64, iy: i64, face: usize) -> u64 {
    ((face as u64) << (2 * order(nside))) + spread_bits(ix as u64) + (spread_bits(iy as u64) << 1)
}

/// (z = cos θ, φ) of a pixel centre.
pub fn pix2zphi(nside: u32, pix: usize) -> (f64, f64) {
    let (ix, iy, face) = nest2xyf(nside, pix as u64);
    let ns = nside as i64;
    let nl4 = 4 * ns;
    let fact2 = 4.0 / nside2npix(nside) as f64;
    let fact1 = (ns << 1) as f64 * fact2;

    let jr = JRLL[face] * ns - ix - iy - 1;
    let (nr, z, kshift) = if jr < ns {
        let nr = jr;
        (nr, 1.0 - (nr * nr) as f64 * fact2, 0)
    } else if jr > 3 * ns {
        let nr = nl4 - jr;
        (nr, (nr * nr) as f64 * fact2 - 1.0, 0)
    } else {
        (ns, (2 * ns - jr) as f64 * fact1, (jr - ns) & 1)
    };

    let mut jp = (JPLL[face] * nr + ix - iy + 1 + kshift) / 2;
    if jp > nl4 {
        jp -= nl4;
    }
    if jp < 1 {
        jp += nl4;
    }
    let phi = (jp as f64 - (kshift + 1) as f64 * 0.5) * (FRAC_PI_2 / nr as f64);
    (z, phi)
}

/// Unit vector of a pixel centre.
pub fn pix2vec(nside: u32, pix: usize) -> [f64; 3] {
    let (z, phi) = pix2zphi(nside, pix);
    let st = (1.0 - z * z).max(0.0).sqrt();
    [st * phi.cos(), st * phi.sin(), z]
}

/// Pixel containing (z = cos θ, φ).
pub fn zphi2pix(nside: u32, z: f64, phi: f64) -> usize {
    let ns = nside as i64;
    let za = z.abs();
    let tt = (phi * 2.0 / PI).rem_euclid(4.0);

    let (ix, iy, face) = if za <= 2.0 / 3.0 {
        let temp1 = nside as f64 * (0.5 + tt);
        let temp2 = nside as f64 * (z * 0.75);
        let jp = (temp1 - temp2) as i64;
        let jm = (temp1 + temp2) as i64;
        let ifp = jp >> order(nside);
        let ifm = jm >> order(nside);
        let face = if ifp == ifm {
            ifp | 4
        } else if ifp < ifm {
            ifp
        } else {
            ifm + 8
        };
        (jm & (ns - 1), ns - (jp & (ns - 1)) - 1, face as usize)
    } else {
        let ntt = (tt as i64).min(3);
        let tp = tt - ntt as f64;
        let tmp = nside as f64 * (3.0 * (1.0 - za)).sqrt();
        let jp = ((tp * tmp) as i64).min(ns - 1);
        let jm = (((1.0 - tp) * tmp) as i64).min(ns - 1);
        if z >= 0.0 {
            (ns - jm - 1, ns - jp - 1, ntt as usize)
        } else {
            (jp, jm, (ntt + 8) as usize)
        }
    };
    xyf2nest(nside, ix, iy, face) as usize
}

/// Pixel containing the direction of `v` (need not be normalised).
pub fn vec2pix(nside: u32, v: [f64; 3]) -> usize {
    let r = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    zphi2pix(nside, v[2] / r, v[1].atan2(v[0]))
}

/// Upsample a nested map to `nside_out` by copying each coarse value into
/// its children. Returns `None` if either resolution is invalid or the
/// target is coarser.
pub fn upgrade(map: &[f64], nside_out: u32) -> Option<Vec<f64>> {
    let nside_in = npix2nside(map.len())?;
    if !is_valid_nside(nside_out) || nside_out < nside_in {
        return None;
    }
    let ratio = (nside_out / nside_in) as usize;
    let children = ratio * ratio;
    let mut out = Vec::with_capacity(map.len() * children);
    for &v in map {
        out.extend(std::iter::repeat(v).take(children));
    }
    Some(out)
}

/// Downsample by averaging children.
pub fn degrade(map: &[f64], nside_out: u32) -> Option<Vec<f64>> {
    let nside_in = npix2nside(map.len())?;
    if !is_valid_nside(nside_out) || nside_out > nside_in {
        return None;
    }
    let ratio = (nside_in / nside_out) as usize;
    let children = ratio * ratio;
    Some(
        map.chunks(children)
            .map(|c| c.iter().sum::<f64>() / children as f64)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npix_roundtrip() {
        for k in 0..8 {
            let nside = 1u32 << k;
            assert_eq!(npix2nside(nside2npix(nside)), Some(nside));
        }
        assert_eq!(npix2nside(0), None);
        assert_eq!(npix2nside(12 * 9), None); // nside 3 is not a power of two
        assert_eq!(npix2nside(100), None);
    }

    #[test]
    fn test_base_pixels() {
        // nside=1 pixel centres: 4 north at z=2/3, 4 equatorial, 4 south
        let (z0, phi0) = pix2zphi(1, 0);
        assert!((z0 - 2.0 / 3.0).abs() < 1e-12);
        assert!((phi0 - PI / 4.0).abs() < 1e-12);
        let (z4, phi4) = pix2zphi(1, 4);
        assert!(z4.abs() < 1e-12);
        assert!(phi4.abs() < 1e-12);
        let (z8, _) = pix2zphi(1, 8);
        assert!((z8 + 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_pix_vec_roundtrip() {
        for &nside in &[1u32, 2, 4, 16] {
            for pix in 0..nside2npix(nside) {
                let v = pix2vec(nside, pix);
                let n = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
                assert!((n - 1.0).abs() < 1e-12);
                assert_eq!(vec2pix(nside, v), pix, "nside {} pix {}", nside, pix);
            }
        }
    }

    #[test]
    fn test_children_are_contiguous() {
        // The parent of fine pixel p is p / 4 in nested order.
        let nside = 8;
        for pix in 0..nside2npix(nside) {
            let v = pix2vec(nside, pix);
            assert_eq!(vec2pix(nside / 2, v), pix / 4);
        }
    }

    #[test]
    fn test_upgrade_and_degrade() {
        let coarse: Vec<f64> = (0..48).map(|i| i as f64).collect();
        let fine = upgrade(&coarse, 4).unwrap();
        assert_eq!(fine.len(), 192);
        assert_eq!(&fine[4..8], &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(degrade(&fine, 2).unwrap(), coarse);
        assert!(upgrade(&coarse, 1).is_none());
        assert!(upgrade(&coarse[..47], 4).is_none());
    }
}
