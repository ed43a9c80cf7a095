// Pointing from pairwise time differences
//
// Pair rows accumulate in a cache keyed by (det1, det2). Whenever the cache
// holds at least `min_dts` pairs after an alert or revoke, a fresh χ² map is
// emitted; a revoke goes out only when the cache has just dropped below that.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_MIN_DTS, DEFAULT_NSIDE, MS_PER_S, POINTING_NDOF};
use crate::error::{ConfigError, NodeError};
use crate::healpix;
use crate::node::{Context, HandlerResult, Node, Outcome};
use crate::payload::{Action, Payload, Value};
use crate::plugins::{bad_kwargs, kwargs};
use crate::pointing::{baseline, diff_skymap, to_ms, PairRow};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiffPointingConfig {
    pub nside: u32,
    pub min_dts: usize,
    pub in_field: String,
    pub out_field: String,
}

impl Default for DiffPointingConfig {
    fn default() -> Self {
        DiffPointingConfig {
            nside: DEFAULT_NSIDE,
            min_dts: DEFAULT_MIN_DTS,
            in_field: "dts".to_string(),
            out_field: "map".to_string(),
        }
    }
}

type PairKey = (String, String);

pub struct DiffPointing {
    nside: u32,
    min_dts: usize,
    in_field: String,
    out_field: String,
    cache: IndexMap<PairKey, PairRow>,
    /// Keys stored on behalf of each source line
    contributed: HashMap<String, Vec<PairKey>>,
}

impl DiffPointing {
    pub fn create(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: DiffPointingConfig = kwargs(name, args)?;
        if !healpix::is_valid_nside(cfg.nside) {
            return Err(bad_kwargs(name, format!("nside {} is not a power of two", cfg.nside)));
        }
        if cfg.min_dts == 0 {
            return Err(bad_kwargs(name, "min_dts must be at least 1"));
        }
        Ok(Box::new(DiffPointing {
            nside: cfg.nside,
            min_dts: cfg.min_dts,
            in_field: cfg.in_field,
            out_field: cfg.out_field,
            cache: IndexMap::new(),
            contributed: HashMap::new(),
        }))
    }

    /// Store a row, reusing the reversed key when that pair is cached.
    fn insert(&mut self, row: PairRow) -> PairKey {
        let reversed = (row.det2.clone(), row.det1.clone());
        if self.cache.contains_key(&reversed) {
            self.cache.insert(reversed.clone(), row.reversed());
            return reversed;
        }
        let key = (row.det1.clone(), row.det2.clone());
        self.cache.insert(key.clone(), row);
        key
    }

    fn remove(&mut self, d1: &str, d2: &str) -> bool {
        let forward = (d1.to_string(), d2.to_string());
        let reversed = (d2.to_string(), d1.to_string());
        self.cache.shift_remove(&forward).is_some() || self.cache.shift_remove(&reversed).is_some()
    }

    fn skymap(&self, ctx: &mut Context) -> Result<Vec<f64>, NodeError> {
        let rows: Vec<PairRow> = self.cache.values().cloned().collect();
        let first = rows.first().ok_or_else(|| NodeError::domain("no pairs cached"))?;
        let pixels = ctx
            .pixels
            .get(self.nside, &first.t1)
            .ok_or_else(|| NodeError::domain(format!("invalid nside {}", self.nside)))?;
        let baselines = rows
            .iter()
            .map(|r| -> Result<[f64; 3], NodeError> {
                Ok(baseline(ctx.position(&r.det1, &r.t1)?, ctx.position(&r.det2, &r.t2)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        diff_skymap(&rows, &baselines, &pixels)
    }

    /// Replace the payload with a fresh map alert.
    fn emit(&self, payload: &mut Payload, ctx: &mut Context) -> HandlerResult {
        let map = self.skymap(ctx)?;
        debug!(pairs = self.cache.len(), npix = map.len(), "pointing map");
        let mut out = std::mem::take(payload);
        out.action = Some(Action::Alert);
        out.set(&self.out_field, Value::vector(map));
        out.set("ndof", Value::Int(POINTING_NDOF as i64));
        Ok(Outcome::Replace(out))
    }
}

/// Parse one `dts` row into ms units, filling missing uncertainties from
/// the detector registry.
pub fn parse_row(row: &Value, ctx: &Context) -> Result<PairRow, NodeError> {
    let m = row.as_map().ok_or_else(|| NodeError::schema("pair row is not a map"))?;
    let text = |k: &str| {
        m.get(k)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| NodeError::domain(format!("pair row lacks '{}'", k)))
    };
    let time = |k: &str| {
        m.get(k)
            .and_then(Value::as_time)
            .ok_or_else(|| NodeError::domain(format!("pair row lacks '{}'", k)))
    };
    let number = |k: &str| m.get(k).and_then(Value::as_f64);

    let det1 = text("det1")?;
    let det2 = text("det2")?;
    let dt = time("dt")?;
    let t1 = time("t1")?;
    let t2 = time("t2")?;
    let r1 = ctx.detectors.get(&det1)?;
    let r2 = ctx.detectors.get(&det2)?;

    let bias = number("bias").unwrap_or(r1.bias - r2.bias);
    let var = number("var").unwrap_or(r1.sigma * r1.sigma + r2.sigma * r2.sigma);
    let dsig1 = number("dsig1").unwrap_or(r1.sigma);
    let dsig2 = number("dsig2").unwrap_or(-r2.sigma);

    Ok(PairRow {
        det1,
        det2,
        dt: to_ms(&dt),
        t1,
        t2,
        bias: bias * MS_PER_S,
        var: var * MS_PER_S * MS_PER_S,
        dsig1: dsig1 * MS_PER_S,
        dsig2: dsig2 * MS_PER_S,
    })
}

fn rows_of<'a>(payload: &'a Payload, field: &str) -> Option<&'a [Value]> {
    payload.get(field).and_then(Value::as_array)
}

fn source_key(payload: &Payload) -> String {
    payload.history.last().unwrap_or_default().to_string()
}

impl Node for DiffPointing {
    fn alert(&mut self, payload: &mut Payload, ctx: &mut Context) -> HandlerResult {
        let rows = rows_of(payload, &self.in_field)
            .ok_or_else(|| NodeError::schema(format!("missing '{}' list", self.in_field)))?;
        let mut parsed = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_row(row, ctx) {
                Ok(r) => parsed.push(r),
                Err(e) => warn!("skipping pair row: {}", e),
            }
        }

        let source = source_key(payload);
        for row in parsed {
            let key = self.insert(row);
            let keys = self.contributed.entry(source.clone()).or_default();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        if self.cache.len() < self.min_dts {
            debug!(pairs = self.cache.len(), min = self.min_dts, "waiting for pairs");
            return Ok(Outcome::Consumed);
        }
        self.emit(payload, ctx)
    }

    fn revoke(&mut self, payload: &mut Payload, ctx: &mut Context) -> HandlerResult {
        let before = self.cache.len();
        let source = source_key(payload);
        let listed: Option<Vec<PairKey>> = rows_of(payload, &self.in_field).map(|rows| {
            rows.iter()
                .filter_map(|r| {
                    let m = r.as_map()?;
                    Some((m.get("det1")?.as_str()?.to_string(), m.get("det2")?.as_str()?.to_string()))
                })
                .collect()
        });
        let keys = match listed {
            Some(keys) => keys,
            None => self.contributed.remove(&source).unwrap_or_default(),
        };
        for (d1, d2) in &keys {
            self.remove(d1, d2);
        }
        let cache = &self.cache;
        self.contributed.retain(|_, keys| {
            keys.retain(|k| cache.contains_key(k));
            !keys.is_empty()
        });
        if self.cache.len() == before {
            return Ok(Outcome::Consumed);
        }

        if self.cache.len() >= self.min_dts {
            self.emit(payload, ctx)
        } else if before >= self.min_dts {
            Ok(Outcome::Forward)
        } else {
            Ok(Outcome::Consumed)
        }
    }

    fn reset(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let had = !self.cache.is_empty();
        self.cache.clear();
        self.contributed.clear();
        Ok(if had { Outcome::Forward } else { Outcome::Consumed })
    }
}
