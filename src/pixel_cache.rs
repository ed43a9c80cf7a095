// Celestial pixel cache
//
// Unit vectors of every HEALPix pixel centre, transformed from the celestial
// (ICRS) frame into the Earth-centred frame used for detector positions.
// Maps are memoised per (nside, whole Unix second) and shared immutably.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::healpix;
use crate::time::Timestamp;

/// Transforms a celestial unit vector into the frame of detector positions.
pub trait SkyFrame {
    fn to_detector_frame(&self, v: [f64; 3], unix_second: i64) -> [f64; 3];
}

/// ICRS taken as GCRS. Aberration and frame bias are below a few tens of
/// arcseconds, far inside any pointing error region.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcrsAsGcrs;

impl SkyFrame for IcrsAsGcrs {
    fn to_detector_frame(&self, v: [f64; 3], _unix_second: i64) -> [f64; 3] {
        v
    }
}

pub type PixelVectors = Rc<Vec<[f64; 3]>>;

pub struct PixelCache {
    frame: Box<dyn SkyFrame>,
    maps: HashMap<(u32, i64), PixelVectors>,
}

impl Default for PixelCache {
    fn default() -> Self {
        PixelCache::new(Box::new(IcrsAsGcrs))
    }
}

impl PixelCache {
    pub fn new(frame: Box<dyn SkyFrame>) -> Self {
        PixelCache {
            frame,
            maps: HashMap::new(),
        }
    }

    /// Pixel unit vectors at `nside` for the second containing `time`.
    /// Returns `None` for an invalid nside.
    pub fn get(&mut self, nside: u32, time: &Timestamp) -> Option<PixelVectors> {
        if !healpix::is_valid_nside(nside) {
            return None;
        }
        let key = (nside, time.unix_second());
        if let Some(v) = self.maps.get(&key) {
            return Some(Rc::clone(v));
        }
        debug!(nside, second = key.1, "computing pixel vectors");
        let vectors: Vec<[f64; 3]> = (0..healpix::nside2npix(nside))
            .map(|p| self.frame.to_detector_frame(healpix::pix2vec(nside, p), key.1))
            .collect();
        let vectors = Rc::new(vectors);
        self.maps.insert(key, Rc::clone(&vectors));
        Some(vectors)
    }

    /// Drop a cached entry.
    pub fn remove(&mut self, nside: u32, unix_second: i64) -> bool {
        self.maps.remove(&(nside, unix_second)).is_some()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memoised_per_second() {
        let mut cache = PixelCache::default();
        let a = cache.get(2, &Timestamp::new(100, 1)).unwrap();
        let b = cache.get(2, &Timestamp::new(100, 999_999_999)).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.len(), 48);

        cache.get(2, &Timestamp::new(101, 0)).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.remove(2, 100));
        assert!(!cache.remove(2, 100));
    }

    #[test]
    fn test_invalid_nside() {
        let mut cache = PixelCache::default();
        assert!(cache.get(3, &Timestamp::default()).is_none());
    }
}
