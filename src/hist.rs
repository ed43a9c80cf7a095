// Fixed-width 1-D histograms
//
// Bin i covers [xlow + i*w, xlow + (i+1)*w) with w = (xhigh - xlow)/nbins.
// A fill at exactly xhigh goes to overflow; a fill at exactly xlow to bin 0.

use serde::Serialize;

use crate::constants::NS_PER_S_F;
use crate::time::Timestamp;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hist1D {
    pub nbins: usize,
    pub xlow: f64,
    pub xhigh: f64,
    pub bins: Vec<f64>,
    pub underflow: f64,
    pub overflow: f64,
    /// Sum of in-range fill values.
    pub sum: f64,
    /// Sum of squares of in-range fill values.
    pub sum2: f64,
    /// Number of in-range fills.
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<f64>>,
}

impl Hist1D {
    /// Returns `None` unless `nbins > 0` and `xlow < xhigh`.
    pub fn new(nbins: usize, xlow: f64, xhigh: f64) -> Option<Self> {
        if nbins == 0 || !(xlow < xhigh) {
            return None;
        }
        Some(Hist1D {
            nbins,
            xlow,
            xhigh,
            bins: vec![0.0; nbins],
            underflow: 0.0,
            overflow: 0.0,
            sum: 0.0,
            sum2: 0.0,
            count: 0,
            errors: None,
        })
    }

    pub fn bin_width(&self) -> f64 {
        (self.xhigh - self.xlow) / self.nbins as f64
    }

    pub fn edge(&self, i: usize) -> f64 {
        self.xlow + i as f64 * self.bin_width()
    }

    pub fn center(&self, i: usize) -> f64 {
        self.xlow + (i as f64 + 0.5) * self.bin_width()
    }

    /// Bin index for `x`, or `None` when it falls outside [xlow, xhigh).
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if x < self.xlow || x >= self.xhigh || x.is_nan() {
            return None;
        }
        let i = ((x - self.xlow) / self.bin_width()).floor() as usize;
        // rounding can push values just below xhigh into nbins
        Some(i.min(self.nbins - 1))
    }

    pub fn fill(&mut self, x: f64) {
        self.fill_weighted(x, 1.0);
    }

    pub fn fill_weighted(&mut self, x: f64, weight: f64) {
        if x < self.xlow {
            self.underflow += weight;
            return;
        }
        match self.find_bin(x) {
            Some(i) => {
                self.bins[i] += weight;
                self.sum += x * weight;
                self.sum2 += x * x * weight;
                self.count += 1;
            }
            None => self.overflow += weight,
        }
    }

    pub fn fill_all(&mut self, xs: &[f64]) {
        for &x in xs {
            self.fill(x);
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    /// Population variance of in-range fills, clamped at zero.
    pub fn variance(&self) -> Option<f64> {
        let mean = self.mean()?;
        Some((self.sum2 / self.count as f64 - mean * mean).max(0.0))
    }

    pub fn stddev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    pub fn total(&self) -> f64 {
        self.bins.iter().sum()
    }

    pub fn is_compatible(&self, other: &Hist1D) -> bool {
        self.nbins == other.nbins && self.xlow == other.xlow && self.xhigh == other.xhigh
    }

    /// Add another compatible histogram into this one.
    pub fn add(&mut self, other: &Hist1D) -> bool {
        if !self.is_compatible(other) {
            return false;
        }
        for (a, b) in self.bins.iter_mut().zip(&other.bins) {
            *a += b;
        }
        self.underflow += other.underflow;
        self.overflow += other.overflow;
        self.sum += other.sum;
        self.sum2 += other.sum2;
        self.count += other.count;
        self.errors = match (self.errors.take(), &other.errors) {
            (Some(e1), Some(e2)) => Some(
                e1.iter()
                    .zip(e2)
                    .map(|(a, b)| (a * a + b * b).sqrt())
                    .collect(),
            ),
            _ => None,
        };
        true
    }

    pub fn set_errors(&mut self, errors: Vec<f64>) -> bool {
        if errors.len() != self.nbins {
            return false;
        }
        self.errors = Some(errors);
        true
    }

    pub fn clear(&mut self) {
        self.bins.iter_mut().for_each(|b| *b = 0.0);
        self.underflow = 0.0;
        self.overflow = 0.0;
        self.sum = 0.0;
        self.sum2 = 0.0;
        self.count = 0;
        self.errors = None;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.underflow == 0.0 && self.overflow == 0.0
    }
}

/// Histogram of times. The x axis is seconds relative to `reference`,
/// spanning [start_ns, stop_ns).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeHist {
    pub reference: Timestamp,
    pub start_ns: i64,
    pub stop_ns: i64,
    pub hist: Hist1D,
}

impl TimeHist {
    pub fn new(reference: Timestamp, start_ns: i64, stop_ns: i64, nbins: usize) -> Option<Self> {
        let hist = Hist1D::new(
            nbins,
            start_ns as f64 / NS_PER_S_F,
            stop_ns as f64 / NS_PER_S_F,
        )?;
        Some(TimeHist {
            reference,
            start_ns,
            stop_ns,
            hist,
        })
    }

    pub fn nbins(&self) -> usize {
        self.hist.nbins
    }

    pub fn bins(&self) -> &[f64] {
        &self.hist.bins
    }

    /// Fill with offsets (ns) from the reference time.
    pub fn add_offsets(&mut self, offsets: &[i64]) {
        for &off in offsets {
            self.hist.fill(off as f64 / NS_PER_S_F);
        }
    }

    /// Fill with absolute times.
    pub fn add_times(&mut self, times: &[Timestamp]) {
        for t in times {
            let off = t.offset_from(&self.reference);
            self.hist.fill(off as f64 / NS_PER_S_F);
        }
    }

    /// Merge groups of `factor` adjacent bins. `nbins` must divide evenly.
    pub fn histogram(&self, factor: usize) -> Option<TimeHist> {
        if factor == 0 || self.hist.nbins % factor != 0 {
            return None;
        }
        let mut out = self.clone();
        out.hist.nbins = self.hist.nbins / factor;
        out.hist.bins = self
            .hist
            .bins
            .chunks(factor)
            .map(|c| c.iter().sum())
            .collect();
        out.hist.errors = None;
        Some(out)
    }

    /// Sum of bins whose centres lie in [start_ns, stop_ns).
    pub fn integral(&self, start_ns: i64, stop_ns: i64) -> f64 {
        let lo = start_ns as f64 / NS_PER_S_F;
        let hi = stop_ns as f64 / NS_PER_S_F;
        (0..self.hist.nbins)
            .filter(|&i| {
                let c = self.hist.center(i);
                c >= lo && c < hi
            })
            .map(|i| self.hist.bins[i])
            .sum()
    }
}
