// Pointing from full time profiles
//
// Joins one event series per detector line. With at least `min_inputs` valid
// lines the node emits a Poisson χ² map; EvalMap also subtracts a background
// estimated from a lead window before the fit window.

use std::rc::Rc;

use serde::Deserialize;
use tracing::debug;

use crate::constants::{DEFAULT_NSIDE, POINTING_NDOF};
use crate::error::{ConfigError, NodeError};
use crate::healpix;
use crate::node::{Context, HandlerResult, Node, Outcome};
use crate::payload::{Action, Payload, Value};
use crate::plugins::{bad_kwargs, detector_of, kwargs, series_field, source_of, FanIn};
use crate::pointing::{top_down_skymap, DetectorSeries, TopDownParams};
use crate::tseries::TimeSeries;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopDownConfig {
    pub nside: u32,
    pub tnbins: usize,
    pub twidth: f64,
    /// Fit window start relative to the earliest series reference time
    pub t_start: f64,
    /// Background window length before the fit window (EvalMap only)
    pub lead: f64,
    pub min_inputs: usize,
    pub field: String,
    pub out_field: String,
}

impl Default for TopDownConfig {
    fn default() -> Self {
        TopDownConfig {
            nside: DEFAULT_NSIDE,
            tnbins: 200,
            twidth: 0.2,
            t_start: -0.05,
            lead: 0.5,
            min_inputs: 2,
            field: "times".to_string(),
            out_field: "map".to_string(),
        }
    }
}

struct Line {
    series: Rc<TimeSeries>,
    detector: String,
}

pub struct TopDown {
    nside: u32,
    params: TopDownParams,
    min_inputs: usize,
    field: String,
    out_field: String,
    inputs: FanIn<Line>,
    emitted: bool,
}

impl TopDown {
    fn create(name: &str, args: &serde_json::Value, background: bool) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: TopDownConfig = kwargs(name, args)?;
        if !healpix::is_valid_nside(cfg.nside) {
            return Err(bad_kwargs(name, format!("nside {} is not a power of two", cfg.nside)));
        }
        if cfg.tnbins == 0 || !(cfg.twidth > 0.0) {
            return Err(bad_kwargs(name, "tnbins and twidth must be positive"));
        }
        if background && !(cfg.lead > 0.0) {
            return Err(bad_kwargs(name, "lead must be positive"));
        }
        Ok(Box::new(TopDown {
            nside: cfg.nside,
            params: TopDownParams {
                tnbins: cfg.tnbins,
                twidth: cfg.twidth,
                t_start: cfg.t_start,
                lead: background.then_some(cfg.lead),
            },
            min_inputs: cfg.min_inputs.max(1),
            field: cfg.field,
            out_field: cfg.out_field,
            inputs: FanIn::new(),
            emitted: false,
        }))
    }

    pub fn series(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        Self::create(name, args, false)
    }

    pub fn eval_map(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        Self::create(name, args, true)
    }

    fn evaluate(&mut self, ctx: &mut Context) -> HandlerResult {
        let valid = self.inputs.valid();
        if valid.len() < self.min_inputs {
            return Ok(if std::mem::replace(&mut self.emitted, false) {
                let mut out = Payload::new(Action::Revoke);
                out.history = self.inputs.history();
                Outcome::Replace(out)
            } else {
                Outcome::Consumed
            });
        }

        let base = valid
            .iter()
            .map(|(_, line, _)| line.series.reference)
            .min()
            .ok_or_else(|| NodeError::domain("no inputs"))?;
        let pixels = ctx
            .pixels
            .get(self.nside, &base)
            .ok_or_else(|| NodeError::domain(format!("invalid nside {}", self.nside)))?;
        let mut inputs = Vec::with_capacity(valid.len());
        for (_, line, _) in &valid {
            let when = line.series.earliest().unwrap_or(base);
            inputs.push(DetectorSeries {
                series: line.series.as_ref(),
                position: ctx.position(&line.detector, &when)?,
            });
        }
        let map = top_down_skymap(&inputs, &base, &pixels, &self.params)?;
        debug!(detectors = inputs.len(), npix = map.len(), "top-down map");

        let mut out = Payload::new(Action::Alert);
        out.history = self.inputs.history();
        out.set(&self.out_field, Value::vector(map));
        out.set("ndof", Value::Int(POINTING_NDOF as i64));
        self.emitted = true;
        Ok(Outcome::Replace(out))
    }
}

impl Node for TopDown {
    fn observing(&mut self, sources: &[String]) {
        self.inputs.set_order(sources);
    }

    fn alert(&mut self, payload: &mut Payload, ctx: &mut Context) -> HandlerResult {
        let source = source_of(payload)?;
        let series = series_field(payload, &self.field)?;
        let detector = detector_of(payload, &source);
        if !ctx.detectors.contains(&detector) {
            return Err(NodeError::domain(format!("unknown detector '{}'", detector)));
        }
        self.inputs.store(&source, Line { series, detector }, payload.history.clone())?;
        self.evaluate(ctx)
    }

    fn revoke(&mut self, payload: &mut Payload, ctx: &mut Context) -> HandlerResult {
        let source = source_of(payload)?;
        if !self.inputs.invalidate(&source) {
            return Ok(Outcome::Consumed);
        }
        self.evaluate(ctx)
    }

    fn reset(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let had = self.inputs.clear();
        self.emitted = false;
        Ok(if had { Outcome::Forward } else { Outcome::Consumed })
    }
}
