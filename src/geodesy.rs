// Geodesy - detector positions and sky directions
//
// Provides conversions between:
// - LLH (Latitude/Longitude/Height) in degrees and meters
// - ECEF (Earth-Centered Earth-Fixed) in meters
// - an Earth-centred celestial frame, reached from ECEF by the Earth rotation angle
// - equatorial RA/Dec in degrees and unit vectors
//
// Uses WGS84 ellipsoid model for Earth

use std::f64::consts::PI;

use crate::constants::J2000_UNIX;

/// Degrees to radians conversion factor
const DTOR: f64 = PI / 180.0;

/// Radians to degrees conversion factor
const RTOD: f64 = 180.0 / PI;

/// WGS84 ellipsoid semi-major axis (equatorial radius) in meters
const WGS84_A: f64 = 6378137.0;

/// WGS84 ellipsoid flattening factor
const WGS84_F: f64 = 1.0 / 298.257223563;

/// WGS84 ellipsoid semi-minor axis (polar radius) in meters
const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);

/// WGS84 ellipsoid eccentricity squared
const WGS84_ECC_SQ: f64 = 1.0 - (WGS84_B * WGS84_B) / (WGS84_A * WGS84_A);

/// Converts from WGS84 lat/lon/height to ellipsoid-earth ECEF coordinates
///
/// # Arguments
/// * `lat` - Latitude in degrees
/// * `lon` - Longitude in degrees
/// * `alt` - Altitude in meters above WGS84 ellipsoid
///
/// # Returns
/// ECEF coordinates [x, y, z] in meters
pub fn llh2ecef(lat: f64, lon: f64, alt: f64) -> [f64; 3] {
    let lat_rad = lat * DTOR;
    let lon_rad = lon * DTOR;

    let slat = lat_rad.sin();
    let slon = lon_rad.sin();
    let clat = lat_rad.cos();
    let clon = lon_rad.cos();

    // Radius of curvature in prime vertical
    let d = (1.0 - (slat * slat * WGS84_ECC_SQ)).sqrt();
    let rn = WGS84_A / d;

    [
        (rn + alt) * clat * clon,
        (rn + alt) * clat * slon,
        (rn * (1.0 - WGS84_ECC_SQ) + alt) * slat,
    ]
}

/// Earth rotation angle (radians, in [0, 2π)) at a Unix time.
///
/// IERS 2003 definition, using UTC as a stand-in for UT1.
pub fn earth_rotation_angle(unix_seconds: f64) -> f64 {
    let du = (unix_seconds - J2000_UNIX) / 86400.0;
    let turns = 0.7790572732640 + 1.00273781191135448 * du;
    (turns.rem_euclid(1.0)) * 2.0 * PI
}

/// Rotate a vector about the z axis by `angle` radians.
pub fn rotate_z(v: [f64; 3], angle: f64) -> [f64; 3] {
    let (s, c) = angle.sin_cos();
    [c * v[0] - s * v[1], s * v[0] + c * v[1], v[2]]
}

/// ECEF position to the Earth-centred celestial frame at a Unix time.
///
/// Ignores precession, nutation and polar motion; good to a few arcminutes
/// over a decade, which is far below pointing resolution.
pub fn ecef_to_celestial(p: [f64; 3], unix_seconds: f64) -> [f64; 3] {
    rotate_z(p, earth_rotation_angle(unix_seconds))
}

/// RA/Dec in degrees to a unit vector.
pub fn radec_to_unit(ra: f64, dec: f64) -> [f64; 3] {
    let ra_rad = ra * DTOR;
    let dec_rad = dec * DTOR;
    [
        dec_rad.cos() * ra_rad.cos(),
        dec_rad.cos() * ra_rad.sin(),
        dec_rad.sin(),
    ]
}

/// Unit vector to RA/Dec in degrees, RA in [0, 360).
pub fn unit_to_radec(v: [f64; 3]) -> (f64, f64) {
    let r = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    let dec = (v[2] / r).asin() * RTOD;
    let ra = v[1].atan2(v[0]).rem_euclid(2.0 * PI) * RTOD;
    (ra, dec)
}

#[inline]
pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Angle between two vectors in degrees.
pub fn angle_between(a: [f64; 3], b: [f64; 3]) -> f64 {
    let na = dot(a, a).sqrt();
    let nb = dot(b, b).sqrt();
    (dot(a, b) / (na * nb)).clamp(-1.0, 1.0).acos() * RTOD
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-6; // Tolerance for floating point comparisons

    #[test]
    fn test_llh2ecef_equator() {
        let p = llh2ecef(0.0, 0.0, 0.0);

        // Should be approximately (WGS84_A, 0, 0)
        assert!((p[0] - WGS84_A).abs() < EPSILON);
        assert!(p[1].abs() < EPSILON);
        assert!(p[2].abs() < EPSILON);
    }

    #[test]
    fn test_llh2ecef_north_pole() {
        let p = llh2ecef(90.0, 0.0, 0.0);

        assert!(p[0].abs() < EPSILON);
        assert!(p[1].abs() < EPSILON);
        assert!((p[2] - WGS84_B).abs() < 1.0);
    }

    #[test]
    fn test_earth_rotation_angle_at_j2000() {
        let era = earth_rotation_angle(J2000_UNIX);
        assert!((era - 0.7790572732640 * 2.0 * PI).abs() < 1e-12);

        // One sidereal day later the angle repeats
        let sidereal_day = 86400.0 / 1.00273781191135448;
        let era2 = earth_rotation_angle(J2000_UNIX + sidereal_day);
        assert!((era - era2).abs() < 1e-6);
    }

    #[test]
    fn test_rotation_preserves_length() {
        let p = llh2ecef(36.2, 137.3, 350.0);
        let q = ecef_to_celestial(p, 1.7e9);
        assert!((dot(p, p).sqrt() - dot(q, q).sqrt()).abs() < 1e-6);
        assert!((p[2] - q[2]).abs() < EPSILON);
    }

    #[test]
    fn test_radec_roundtrip() {
        for &(ra, dec) in &[(0.0, 0.0), (83.6, 22.0), (266.4, -29.0), (359.0, 89.0)] {
            let (ra2, dec2) = unit_to_radec(radec_to_unit(ra, dec));
            assert!((ra - ra2).abs() < 1e-9, "ra {} vs {}", ra, ra2);
            assert!((dec - dec2).abs() < 1e-9, "dec {} vs {}", dec, dec2);
        }
    }

    #[test]
    fn test_angle_between() {
        let a = radec_to_unit(0.0, 0.0);
        let b = radec_to_unit(90.0, 0.0);
        assert!((angle_between(a, b) - 90.0).abs() < 1e-9);
    }
}
