// Accumulators for Monte-Carlo summaries
//
// These nodes absorb alerts and emit on report. A report is forwarded only
// when something was added since the previous report. Revokes are ignored.
// A reset clears the contents; with `clear_on_reset: false` the contents
// survive resets, so a trial driver can reset the pipeline between bursts.

use std::f64::consts::PI;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

use crate::constants::DEFAULT_NSIDE;
use crate::error::{ConfigError, NodeError};
use crate::geodesy::radec_to_unit;
use crate::healpix;
use crate::hist::Hist1D;
use crate::node::{Context, HandlerResult, Node, Outcome};
use crate::payload::{Payload, Value};
use crate::plugins::{bad_kwargs, kwargs};

fn on_reset(clear_on_reset: bool, had_contents: bool) -> Outcome {
    if clear_on_reset && had_contents {
        Outcome::Forward
    } else {
        Outcome::Consumed
    }
}

/// Summary map for a histogram; `stats` adds sum, sum2, mean and std.
fn summary(h: &Hist1D, stats: bool) -> Value {
    let mut m = IndexMap::new();
    m.insert("nbins".to_string(), Value::Int(h.nbins as i64));
    m.insert("xlow".to_string(), Value::Float(h.xlow));
    m.insert("xhigh".to_string(), Value::Float(h.xhigh));
    m.insert("bins".to_string(), Value::vector(h.bins.clone()));
    m.insert("underflow".to_string(), Value::Float(h.underflow));
    m.insert("overflow".to_string(), Value::Float(h.overflow));
    m.insert("count".to_string(), Value::Int(h.count as i64));
    if stats {
        m.insert("sum".to_string(), Value::Float(h.sum));
        m.insert("sum2".to_string(), Value::Float(h.sum2));
        if let (Some(mean), Some(std)) = (h.mean(), h.stddev()) {
            m.insert("mean".to_string(), Value::Float(mean));
            m.insert("std".to_string(), Value::Float(std));
        }
    }
    Value::Map(m)
}

fn new_hist(name: &str, nbins: usize, xlow: f64, xhigh: f64) -> Result<Hist1D, ConfigError> {
    Hist1D::new(nbins, xlow, xhigh)
        .ok_or_else(|| bad_kwargs(name, format!("bad binning {} [{}, {})", nbins, xlow, xhigh)))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Histogram1DConfig {
    /// Key path of the scalar to fill, e.g. `dts/0/dt`
    pub field: String,
    pub nbins: usize,
    pub xlow: f64,
    pub xhigh: f64,
    pub out_field: String,
    pub clear_on_reset: bool,
}

impl Default for Histogram1DConfig {
    fn default() -> Self {
        Histogram1DConfig {
            field: "value".to_string(),
            nbins: 100,
            xlow: 0.0,
            xhigh: 1.0,
            out_field: "histogram".to_string(),
            clear_on_reset: true,
        }
    }
}

/// Histogram of one scalar per alert.
pub struct Histogram1D {
    field: String,
    out_field: String,
    clear_on_reset: bool,
    hist: Hist1D,
    changed: bool,
}

impl Histogram1D {
    pub fn create(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: Histogram1DConfig = kwargs(name, args)?;
        Ok(Box::new(Histogram1D {
            hist: new_hist(name, cfg.nbins, cfg.xlow, cfg.xhigh)?,
            field: cfg.field,
            out_field: cfg.out_field,
            clear_on_reset: cfg.clear_on_reset,
            changed: false,
        }))
    }
}

impl Node for Histogram1D {
    fn alert(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let x = payload
            .get_f64(&self.field)
            .ok_or_else(|| NodeError::schema(format!("'{}' is not a number", self.field)))?;
        self.hist.fill(x);
        self.changed = true;
        Ok(Outcome::Consumed)
    }

    fn revoke(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(Outcome::Consumed)
    }

    fn reset(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let had = !self.hist.is_empty();
        if self.clear_on_reset {
            self.hist.clear();
            self.changed = false;
        }
        Ok(on_reset(self.clear_on_reset, had))
    }

    fn report(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        if !std::mem::replace(&mut self.changed, false) {
            return Ok(Outcome::Consumed);
        }
        debug!(count = self.hist.count, "histogram report");
        payload.set(&self.out_field, summary(&self.hist, true));
        Ok(Outcome::Forward)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BinnedConfig {
    /// Key path of a numeric array; every element is filled
    pub field: String,
    pub nbins: usize,
    pub xlow: f64,
    pub xhigh: f64,
    /// Values below `xlow` go into the first bin instead of underflow
    pub clamp_underflow: bool,
    /// Values at or above `xhigh` go into the last bin instead of overflow
    pub clamp_overflow: bool,
    pub stats: bool,
    pub out_field: String,
    pub clear_on_reset: bool,
}

impl Default for BinnedConfig {
    fn default() -> Self {
        BinnedConfig {
            field: "values".to_string(),
            nbins: 100,
            xlow: 0.0,
            xhigh: 1.0,
            clamp_underflow: false,
            clamp_overflow: false,
            stats: false,
            out_field: "histogram".to_string(),
            clear_on_reset: true,
        }
    }
}

/// Histogram filled from an array of values per alert.
pub struct BinnedAccumulator {
    cfg: BinnedConfig,
    hist: Hist1D,
    changed: bool,
}

impl BinnedAccumulator {
    pub fn create(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: BinnedConfig = kwargs(name, args)?;
        let hist = new_hist(name, cfg.nbins, cfg.xlow, cfg.xhigh)?;
        Ok(Box::new(BinnedAccumulator {
            cfg,
            hist,
            changed: false,
        }))
    }

    fn fill(&mut self, x: f64) {
        let h = &mut self.hist;
        if self.cfg.clamp_underflow && x < h.xlow {
            h.fill(h.center(0));
        } else if self.cfg.clamp_overflow && x >= h.xhigh {
            h.fill(h.center(h.nbins - 1));
        } else {
            h.fill(x);
        }
    }
}

impl Node for BinnedAccumulator {
    fn alert(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let values = payload
            .get(&self.cfg.field)
            .and_then(Value::to_f64_vec)
            .ok_or_else(|| NodeError::schema(format!("'{}' is not a numeric array", self.cfg.field)))?;
        for x in values {
            self.fill(x);
        }
        self.changed = true;
        Ok(Outcome::Consumed)
    }

    fn revoke(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(Outcome::Consumed)
    }

    fn reset(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let had = !self.hist.is_empty();
        if self.cfg.clear_on_reset {
            self.hist.clear();
            self.changed = false;
        }
        Ok(on_reset(self.cfg.clear_on_reset, had))
    }

    fn report(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        if !std::mem::replace(&mut self.changed, false) {
            return Ok(Outcome::Consumed);
        }
        payload.set(&self.cfg.out_field, summary(&self.hist, self.cfg.stats));
        Ok(Outcome::Forward)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccConfig {
    /// Numeric array, or a histogram summary map whose `bins` are summed
    pub field: String,
    pub out_field: String,
    pub clear_on_reset: bool,
}

impl Default for AccConfig {
    fn default() -> Self {
        AccConfig {
            field: "histogram".to_string(),
            out_field: "histogram".to_string(),
            clear_on_reset: true,
        }
    }
}

/// Pointwise sum of equal-length histograms.
pub struct AccHistogram {
    cfg: AccConfig,
    sum: Option<Vec<f64>>,
    count: u64,
    changed: bool,
}

impl AccHistogram {
    pub fn create(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        Ok(Box::new(AccHistogram {
            cfg: kwargs(name, args)?,
            sum: None,
            count: 0,
            changed: false,
        }))
    }

    fn read_bins(&self, payload: &Payload) -> Option<Vec<f64>> {
        let value = payload.get(&self.cfg.field)?;
        match value {
            Value::Hist(h) => Some(h.bins.clone()),
            Value::Map(m) => m.get("bins")?.to_f64_vec(),
            other => other.to_f64_vec(),
        }
    }
}

impl Node for AccHistogram {
    fn alert(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let bins = self
            .read_bins(payload)
            .ok_or_else(|| NodeError::schema(format!("'{}' is not a histogram", self.cfg.field)))?;
        if let Some(acc) = &mut self.sum {
            if acc.len() != bins.len() {
                return Err(NodeError::domain(format!(
                    "histogram length {} does not match accumulated {}",
                    bins.len(),
                    acc.len()
                )));
            }
            acc.iter_mut().zip(&bins).for_each(|(a, b)| *a += b);
        } else {
            self.sum = Some(bins);
        }
        self.count += 1;
        self.changed = true;
        Ok(Outcome::Consumed)
    }

    fn revoke(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(Outcome::Consumed)
    }

    fn reset(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let had = self.sum.is_some();
        if self.cfg.clear_on_reset {
            self.sum = None;
            self.count = 0;
            self.changed = false;
        }
        Ok(on_reset(self.cfg.clear_on_reset, had))
    }

    fn report(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        if !std::mem::replace(&mut self.changed, false) {
            return Ok(Outcome::Consumed);
        }
        let Some(sum) = &self.sum else {
            return Ok(Outcome::Consumed);
        };
        let mut m = IndexMap::new();
        m.insert("bins".to_string(), Value::vector(sum.clone()));
        m.insert("count".to_string(), Value::Int(self.count as i64));
        payload.set(&self.cfg.out_field, Value::Map(m));
        Ok(Outcome::Forward)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    None,
    /// Largest pixel scaled to 1
    Max,
    /// Density per steradian, integrating to 1 over the sky
    Area,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SkymapConfig {
    pub nside: u32,
    /// Key path of a pixel index; when absent `ra_field`/`dec_field` are used
    pub pixel_field: Option<String>,
    pub ra_field: String,
    pub dec_field: String,
    pub normalization: Normalization,
    pub out_field: String,
    pub clear_on_reset: bool,
}

impl Default for SkymapConfig {
    fn default() -> Self {
        SkymapConfig {
            nside: DEFAULT_NSIDE,
            pixel_field: None,
            ra_field: "ra".to_string(),
            dec_field: "dec".to_string(),
            normalization: Normalization::None,
            out_field: "map".to_string(),
            clear_on_reset: true,
        }
    }
}

/// Counts of directions per HEALPix pixel. The report carries the scaled
/// map in `out_field` and √counts with the same scale in `stddev`.
pub struct HistogramSkymap {
    cfg: SkymapConfig,
    counts: Vec<f64>,
    changed: bool,
}

impl HistogramSkymap {
    pub fn create(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: SkymapConfig = kwargs(name, args)?;
        if !healpix::is_valid_nside(cfg.nside) {
            return Err(bad_kwargs(name, format!("nside {} is not a power of two", cfg.nside)));
        }
        Ok(Box::new(HistogramSkymap {
            counts: vec![0.0; healpix::nside2npix(cfg.nside)],
            cfg,
            changed: false,
        }))
    }

    fn pixel(&self, payload: &Payload) -> Result<usize, NodeError> {
        if let Some(field) = &self.cfg.pixel_field {
            let pix = payload
                .get(field)
                .and_then(Value::as_i64)
                .ok_or_else(|| NodeError::schema(format!("'{}' is not an integer", field)))?;
            return usize::try_from(pix)
                .ok()
                .filter(|&p| p < self.counts.len())
                .ok_or_else(|| NodeError::domain(format!("pixel {} out of range", pix)));
        }
        match (payload.get_f64(&self.cfg.ra_field), payload.get_f64(&self.cfg.dec_field)) {
            (Some(ra), Some(dec)) => Ok(healpix::vec2pix(self.cfg.nside, radec_to_unit(ra, dec))),
            _ => Err(NodeError::schema(format!(
                "'{}'/'{}' are not numbers",
                self.cfg.ra_field, self.cfg.dec_field
            ))),
        }
    }

    fn factor(&self) -> f64 {
        match self.cfg.normalization {
            Normalization::None => 1.0,
            Normalization::Max => {
                let max = self.counts.iter().cloned().fold(0.0, f64::max);
                if max > 0.0 {
                    1.0 / max
                } else {
                    1.0
                }
            }
            Normalization::Area => {
                let total: f64 = self.counts.iter().sum();
                let pixel_area = 4.0 * PI / self.counts.len() as f64;
                if total > 0.0 {
                    1.0 / (total * pixel_area)
                } else {
                    1.0
                }
            }
        }
    }
}

impl Node for HistogramSkymap {
    fn alert(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let pix = self.pixel(payload)?;
        self.counts[pix] += 1.0;
        self.changed = true;
        Ok(Outcome::Consumed)
    }

    fn revoke(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(Outcome::Consumed)
    }

    fn reset(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let had = self.counts.iter().any(|&c| c > 0.0);
        if self.cfg.clear_on_reset {
            self.counts.iter_mut().for_each(|c| *c = 0.0);
            self.changed = false;
        }
        Ok(on_reset(self.cfg.clear_on_reset, had))
    }

    fn report(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        if !std::mem::replace(&mut self.changed, false) {
            return Ok(Outcome::Consumed);
        }
        let factor = self.factor();
        let map = self.counts.iter().map(|c| c * factor).collect();
        let stddev = self.counts.iter().map(|c| c.sqrt() * factor).collect();
        payload.set(&self.cfg.out_field, Value::vector(map));
        payload.set("stddev", Value::vector(stddev));
        Ok(Outcome::Forward)
    }
}
