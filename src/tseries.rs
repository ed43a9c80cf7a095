// Event time series
//
// Times are kept as signed ns offsets from a reference time. Offsets are not
// sorted on insertion; estimators sort their own copies.

use serde::Serialize;

use crate::constants::NS_PER_S_F;
use crate::hist::TimeHist;
use crate::time::Timestamp;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeries {
    pub reference: Timestamp,
    /// Optional acceptance window [start, stop) in ns relative to reference.
    pub start_ns: Option<i64>,
    pub stop_ns: Option<i64>,
    pub offsets: Vec<i64>,
}

impl TimeSeries {
    pub fn new(reference: Timestamp) -> Self {
        TimeSeries {
            reference,
            start_ns: None,
            stop_ns: None,
            offsets: Vec::new(),
        }
    }

    pub fn with_window(reference: Timestamp, start_ns: i64, stop_ns: i64) -> Self {
        TimeSeries {
            reference,
            start_ns: Some(start_ns),
            stop_ns: Some(stop_ns),
            offsets: Vec::new(),
        }
    }

    /// Convenience constructor from float seconds relative to `reference`.
    pub fn from_secs(reference: Timestamp, times: &[f64]) -> Self {
        let mut ts = TimeSeries::new(reference);
        ts.add_offsets(times.iter().map(|t| (t * NS_PER_S_F).round() as i64));
        ts
    }

    fn in_window(&self, off: i64) -> bool {
        self.start_ns.map_or(true, |s| off >= s) && self.stop_ns.map_or(true, |s| off < s)
    }

    /// Add ns offsets; offsets outside the window are dropped.
    pub fn add_offsets<I: IntoIterator<Item = i64>>(&mut self, offsets: I) {
        for off in offsets {
            if self.in_window(off) {
                self.offsets.push(off);
            }
        }
    }

    pub fn add_times(&mut self, times: &[Timestamp]) {
        let offsets: Vec<i64> = times.iter().map(|t| t.offset_from(&self.reference)).collect();
        self.add_offsets(offsets);
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Absolute time of the i-th stored event (insertion order).
    pub fn event(&self, i: usize) -> Option<Timestamp> {
        self.offsets.get(i).map(|&off| self.reference.add_ns(off))
    }

    pub fn sorted_offsets(&self) -> Vec<i64> {
        let mut v = self.offsets.clone();
        v.sort_unstable();
        v
    }

    /// Offsets of every event relative to another base time, in seconds.
    pub fn secs_from(&self, base: &Timestamp) -> Vec<f64> {
        let shift = self.reference.offset_from(base);
        self.offsets
            .iter()
            .map(|&off| (off + shift) as f64 / NS_PER_S_F)
            .collect()
    }

    pub fn earliest(&self) -> Option<Timestamp> {
        self.offsets.iter().min().map(|&off| self.reference.add_ns(off))
    }

    /// Histogram over [start_ns, stop_ns) relative to the reference.
    pub fn histogram(&self, nbins: usize, start_ns: i64, stop_ns: i64) -> Option<TimeHist> {
        let mut th = TimeHist::new(self.reference, start_ns, stop_ns, nbins)?;
        th.add_offsets(&self.offsets);
        Some(th)
    }

    /// Number of events in [start_ns, stop_ns).
    pub fn integral(&self, start_ns: i64, stop_ns: i64) -> usize {
        self.offsets
            .iter()
            .filter(|&&off| off >= start_ns && off < stop_ns)
            .count()
    }
}
