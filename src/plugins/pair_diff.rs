// Two-input time-difference nodes
//
// Each node observes two detector lines carrying event series and, once both
// are valid, emits a single `dts` row (det1, det2, dt, t1, t2 and whatever
// uncertainty the estimator models). det1 is the first observed source.

use std::rc::Rc;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ConfigError, NodeError};
use crate::node::{Context, HandlerResult, Node, Outcome};
use crate::payload::{Action, Payload, Value};
use crate::plugins::{bad_kwargs, detector_of, kwargs, series_field, source_of, FanIn};
use crate::timediff::{self, LagResult, LagScan, LagStatistic, Reference};
use crate::tseries::TimeSeries;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PairConfig {
    /// Input series field
    pub field: String,
    /// Output rows field
    pub out_field: String,
}

impl Default for PairConfig {
    fn default() -> Self {
        PairConfig {
            field: "times".to_string(),
            out_field: "dts".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NthConfig {
    #[serde(flatten)]
    pub pair: PairConfig,
    /// 1-based rank of the event compared in each series
    pub n: usize,
}

impl Default for NthConfig {
    fn default() -> Self {
        NthConfig {
            pair: PairConfig::default(),
            n: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirstEventConfig {
    #[serde(flatten)]
    pub pair: PairConfig,
    pub fudge: f64,
}

impl Default for FirstEventConfig {
    fn default() -> Self {
        FirstEventConfig {
            pair: PairConfig::default(),
            fudge: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    #[serde(flatten)]
    pub pair: PairConfig,
    pub lag_min: f64,
    pub lag_max: f64,
    pub lag_step: f64,
    pub twidth: f64,
    pub tnbins: usize,
    pub t_lead: f64,
    /// Source held fixed during the scan; the larger series when unset
    pub reference: Option<String>,
    /// Background rates (events/s) of the first and second source
    pub bg1: f64,
    pub bg2: f64,
    /// Second/first signal ratio; estimated from counts when unset
    pub ratio: Option<f64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            pair: PairConfig::default(),
            lag_min: -0.05,
            lag_max: 0.05,
            lag_step: 0.001,
            twidth: 0.5,
            tnbins: 500,
            t_lead: 0.1,
            reference: None,
            bg1: 0.0,
            bg2: 0.0,
            ratio: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XfftConfig {
    #[serde(flatten)]
    pub pair: PairConfig,
    pub tnbins: usize,
    pub twidth: f64,
    pub t_lead: f64,
}

impl Default for XfftConfig {
    fn default() -> Self {
        XfftConfig {
            pair: PairConfig::default(),
            tnbins: 1024,
            twidth: 1.024,
            t_lead: 0.0,
        }
    }
}

enum Estimator {
    Nth(usize),
    FirstEvent(f64),
    Scan {
        scan: LagScan,
        stat: LagStatistic,
        reference: Option<String>,
    },
    Xfft {
        tnbins: usize,
        twidth: f64,
        t_lead: f64,
    },
}

struct Line {
    series: Rc<TimeSeries>,
    detector: String,
}

pub struct PairDiff {
    field: String,
    out_field: String,
    estimator: Estimator,
    inputs: FanIn<Line>,
    /// An alert has gone out and not been withdrawn
    emitted: bool,
}

impl PairDiff {
    fn boxed(pair: PairConfig, estimator: Estimator) -> Result<Box<dyn Node>, ConfigError> {
        Ok(Box::new(PairDiff {
            field: pair.field,
            out_field: pair.out_field,
            estimator,
            inputs: FanIn::new(),
            emitted: false,
        }))
    }

    pub fn nth(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: NthConfig = kwargs(name, args)?;
        if cfg.n == 0 {
            return Err(bad_kwargs(name, "n is 1-based"));
        }
        Self::boxed(cfg.pair, Estimator::Nth(cfg.n))
    }

    pub fn first_event(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: FirstEventConfig = kwargs(name, args)?;
        Self::boxed(cfg.pair, Estimator::FirstEvent(cfg.fudge))
    }

    fn scan(name: &str, args: &serde_json::Value, stat: fn(&ScanConfig) -> LagStatistic) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: ScanConfig = kwargs(name, args)?;
        if !(cfg.lag_step > 0.0) || cfg.lag_max < cfg.lag_min {
            return Err(bad_kwargs(name, "need lag_step > 0 and lag_min <= lag_max"));
        }
        if cfg.tnbins == 0 || !(cfg.twidth > 0.0) {
            return Err(bad_kwargs(name, "tnbins and twidth must be positive"));
        }
        let estimator = Estimator::Scan {
            scan: LagScan {
                lag_min: cfg.lag_min,
                lag_max: cfg.lag_max,
                lag_step: cfg.lag_step,
                twidth: cfg.twidth,
                tnbins: cfg.tnbins,
                t_lead: cfg.t_lead,
            },
            stat: stat(&cfg),
            reference: cfg.reference.clone(),
        };
        Self::boxed(cfg.pair, estimator)
    }

    pub fn nlog(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        Self::scan(name, args, |_| LagStatistic::NLog)
    }

    pub fn nb(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        Self::scan(name, args, |cfg| LagStatistic::NegBinomial {
            bg_first: cfg.bg1,
            bg_second: cfg.bg2,
            ratio: cfg.ratio,
        })
    }

    pub fn xcov(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        Self::scan(name, args, |_| LagStatistic::XCov)
    }

    pub fn xfft(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: XfftConfig = kwargs(name, args)?;
        if cfg.tnbins == 0 || !(cfg.twidth > 0.0) {
            return Err(bad_kwargs(name, "tnbins and twidth must be positive"));
        }
        Self::boxed(
            cfg.pair,
            Estimator::Xfft {
                tnbins: cfg.tnbins,
                twidth: cfg.twidth,
                t_lead: cfg.t_lead,
            },
        )
    }

    fn estimate(&self, first: (&str, &TimeSeries), second: (&str, &TimeSeries)) -> Result<Option<(LagResult, Option<Value>)>, NodeError> {
        let (a, b) = (first.1, second.1);
        let result = match &self.estimator {
            Estimator::Nth(n) => timediff::nth_time_diff(a, b, *n).map(|r| (r, None)),
            Estimator::FirstEvent(fudge) => timediff::first_event_diff(a, b, *fudge).map(|r| (r, None)),
            Estimator::Scan { scan, stat, reference } => {
                let reference = match reference.as_deref() {
                    None => Reference::Largest,
                    Some(r) if r == first.0 => Reference::First,
                    Some(r) if r == second.0 => Reference::Second,
                    Some(r) => return Err(NodeError::domain(format!("reference '{}' is not an input", r))),
                };
                timediff::scan_lag(a, b, scan, stat, reference).map(|r| (r, None))
            }
            Estimator::Xfft { tnbins, twidth, t_lead } => {
                let spectrum = timediff::cross_spectrum(a, b, *tnbins, *twidth, *t_lead);
                timediff::xfft_lag(a, b, *tnbins, *twidth, *t_lead).map(|r| {
                    let extra = spectrum.map(|(re, im)| {
                        let mut m = IndexMap::new();
                        m.insert("re".to_string(), Value::vector(re));
                        m.insert("im".to_string(), Value::vector(im));
                        Value::Map(m)
                    });
                    (r, extra)
                })
            }
        };
        Ok(result)
    }

    fn evaluate(&mut self) -> HandlerResult {
        let valid = self.inputs.valid();
        match valid.len() {
            0 | 1 => return Ok(Outcome::Consumed),
            2 => {}
            n => return Err(NodeError::domain(format!("expected two inputs, have {}", n))),
        }
        let (s1, l1, _) = valid[0];
        let (s2, l2, _) = valid[1];
        let (det1, det2) = (l1.detector.clone(), l2.detector.clone());
        let estimate = self.estimate((s1, l1.series.as_ref()), (s2, l2.series.as_ref()))?;
        let history = self.inputs.history();

        match estimate {
            Some((result, extra)) => {
                debug!(det1 = %det1, det2 = %det2, dt = result.dt_secs(), "pair dt");
                let mut out = Payload::new(Action::Alert);
                out.history = history;
                out.set(&self.out_field, Value::Array(vec![lag_row(&result, &det1, &det2)]));
                if let Some(extra) = extra {
                    out.set("spectrum", extra);
                }
                self.emitted = true;
                Ok(Outcome::Replace(out))
            }
            None if std::mem::replace(&mut self.emitted, false) => {
                let mut out = Payload::new(Action::Revoke);
                out.history = history;
                Ok(Outcome::Replace(out))
            }
            None => Ok(Outcome::Consumed),
        }
    }
}

/// A `dts` row for one pair.
pub fn lag_row(result: &LagResult, det1: &str, det2: &str) -> Value {
    let mut row = IndexMap::new();
    row.insert("det1".to_string(), Value::from(det1));
    row.insert("det2".to_string(), Value::from(det2));
    row.insert("dt".to_string(), Value::time(result.dt));
    row.insert("t1".to_string(), Value::time(result.t1));
    row.insert("t2".to_string(), Value::time(result.t2));
    let optional = [
        ("bias", result.bias),
        ("var", result.var),
        ("dsig1", result.dsig1),
        ("dsig2", result.dsig2),
    ];
    for (key, v) in optional {
        if let Some(v) = v {
            row.insert(key.to_string(), Value::Float(v));
        }
    }
    if let Some((x, y)) = &result.profile {
        let mut profile = IndexMap::new();
        profile.insert("x".to_string(), Value::vector(x.clone()));
        profile.insert("y".to_string(), Value::vector(y.clone()));
        row.insert("profile".to_string(), Value::Map(profile));
    }
    Value::Map(row)
}

impl Node for PairDiff {
    fn observing(&mut self, sources: &[String]) {
        self.inputs.set_order(sources);
    }

    fn alert(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let source = source_of(payload)?;
        let series = series_field(payload, &self.field)?;
        let detector = detector_of(payload, &source);
        self.inputs.store(&source, Line { series, detector }, payload.history.clone())?;
        self.evaluate()
    }

    fn revoke(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let source = source_of(payload)?;
        if self.inputs.invalidate(&source) && std::mem::replace(&mut self.emitted, false) {
            Ok(Outcome::Forward)
        } else {
            Ok(Outcome::Consumed)
        }
    }

    fn reset(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let had = self.inputs.clear();
        self.emitted = false;
        Ok(if had { Outcome::Forward } else { Outcome::Consumed })
    }
}
