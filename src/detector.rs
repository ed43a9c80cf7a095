// Detector registry
//
// Detectors are read from CSV rows of (name, lon°, lat°, height m, σ s, bias s).
// Bias follows the observed − true convention. Positions as a function of time
// come from a `PositionOracle`, so an exact astronomy backend can replace the
// built-in Earth-rotation approximation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{csv_line, csv_reader};
use crate::error::DetectorError;
use crate::geodesy;
use crate::time::Timestamp;

/// Geodetic and timing parameters of one detector.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectorRecord {
    pub name: String,
    /// Longitude in degrees
    pub lon: f64,
    /// Latitude in degrees
    pub lat: f64,
    /// Height above the WGS84 ellipsoid in meters
    pub height: f64,
    /// Expected timing resolution in seconds
    pub sigma: f64,
    /// Timing bias (observed − true) in seconds
    pub bias: f64,
}

impl DetectorRecord {
    pub fn ecef(&self) -> [f64; 3] {
        geodesy::llh2ecef(self.lat, self.lon, self.height)
    }
}

/// Maps a detector and a time to a geocentric position in meters.
pub trait PositionOracle {
    fn position(&self, detector: &DetectorRecord, time: &Timestamp) -> [f64; 3];
}

/// ECEF position rotated by the Earth rotation angle.
#[derive(Debug, Default, Clone, Copy)]
pub struct EarthRotationOracle;

impl PositionOracle for EarthRotationOracle {
    fn position(&self, detector: &DetectorRecord, time: &Timestamp) -> [f64; 3] {
        geodesy::ecef_to_celestial(detector.ecef(), time.as_secs_f64())
    }
}

/// Registry of detectors keyed by name.
#[derive(Debug, Default)]
pub struct DetectorRegistry {
    detectors: HashMap<String, DetectorRecord>,
    /// Canonical paths already read; re-reading one is a no-op.
    loaded: HashSet<PathBuf>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        DetectorRegistry::default()
    }

    pub fn insert(&mut self, record: DetectorRecord) {
        self.detectors.insert(record.name.clone(), record);
    }

    pub fn get(&self, name: &str) -> Result<&DetectorRecord, DetectorError> {
        self.detectors
            .get(name)
            .ok_or_else(|| DetectorError::Unknown(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.detectors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.detectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Read a detector CSV. Returns the number of detectors added, or 0 if
    /// this file was already read.
    pub fn read_csv(&mut self, path: &Path) -> Result<usize, DetectorError> {
        let shown = path.display().to_string();
        let canonical = path.canonicalize().map_err(|e| DetectorError::Io {
            path: shown.clone(),
            source: e,
        })?;
        if self.loaded.contains(&canonical) {
            debug!("detector file {} already loaded", shown);
            return Ok(0);
        }
        let text = std::fs::read_to_string(&canonical).map_err(|e| DetectorError::Io {
            path: shown.clone(),
            source: e,
        })?;
        let records = parse_csv(&text, &shown)?;
        let n = records.len();
        for record in records {
            self.insert(record);
        }
        self.loaded.insert(canonical);
        info!("loaded {} detectors from {}", n, shown);
        Ok(n)
    }
}

/// Parse detector rows. Blank lines, `#` comments and rows with an empty
/// name are skipped.
pub fn parse_csv(text: &str, path: &str) -> Result<Vec<DetectorRecord>, DetectorError> {
    let mut out = Vec::new();
    for row in csv_reader(text.as_bytes()).deserialize::<DetectorRecord>() {
        let record = row.map_err(|e| DetectorError::MalformedRow {
            path: path.to_string(),
            line: csv_line(&e),
            reason: e.to_string(),
        })?;
        if record.name.is_empty() {
            continue;
        }
        out.push(record);
    }
    Ok(out)
}
