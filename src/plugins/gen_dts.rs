// Monte-Carlo generator of detector-pair time differences
//
// For a fixed source direction and time, each configured pair gets the
// geometric delay plus its bias and Gaussian noise. The generator is seeded
// per burst, so a trial driver reproduces the same sequence for a seed.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{csv_line, csv_reader};
use crate::constants::{C_LIGHT, DEFAULT_SEED, NS_PER_S_F};
use crate::error::{ConfigError, NodeError};
use crate::geodesy::{dot, radec_to_unit};
use crate::node::{Context, HandlerResult, Node, Outcome};
use crate::payload::{Payload, Value};
use crate::plugins::{bad_kwargs, kwargs};
use crate::pointing::predicted_dt;
use crate::time::Timestamp;

/// One detector pair with its timing resolution and bias, in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PairSpec {
    pub det1: String,
    pub det2: String,
    pub dtsig: f64,
    #[serde(default)]
    pub dtbias: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenConfig {
    /// CSV of (det1, det2, dtsig, dtbias)
    pub pairs_file: Option<PathBuf>,
    pub pairs: Vec<PairSpec>,
    /// Source direction in degrees
    pub ra: f64,
    pub dec: f64,
    /// Arrival time at the geocenter; overridden by the payload's `time`
    pub time: Option<serde_json::Value>,
    pub seed: Option<u64>,
    pub out_field: Option<String>,
}

/// Parse pair rows. Blank lines and `#` comments are skipped; the bias
/// column may be left out.
pub fn parse_pairs_csv(text: &str, path: &str) -> Result<Vec<PairSpec>, ConfigError> {
    csv_reader(text.as_bytes())
        .deserialize::<PairSpec>()
        .map(|row| {
            row.map_err(|e| ConfigError::Parse {
                path: path.to_string(),
                reason: format!("line {}: {}", csv_line(&e), e),
            })
        })
        .collect()
}

fn read_pairs(path: &Path) -> Result<Vec<PairSpec>, ConfigError> {
    let shown = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: shown.clone(),
        source: e,
    })?;
    let pairs = parse_pairs_csv(&text, &shown)?;
    info!("loaded {} detector pairs from {}", pairs.len(), shown);
    Ok(pairs)
}

pub struct GenPointDts {
    pairs: Vec<(PairSpec, Normal<f64>)>,
    direction: [f64; 3],
    ra: f64,
    dec: f64,
    time: Option<Timestamp>,
    seed: u64,
    out_field: String,
}

impl GenPointDts {
    pub fn create(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: GenConfig = kwargs(name, args)?;
        let mut specs = cfg.pairs;
        if let Some(path) = &cfg.pairs_file {
            specs.extend(read_pairs(path)?);
        }
        if specs.is_empty() {
            return Err(bad_kwargs(name, "no detector pairs configured"));
        }
        let mut pairs = Vec::with_capacity(specs.len());
        for spec in specs {
            if !(spec.dtsig.is_finite() && spec.dtsig >= 0.0) || !spec.dtbias.is_finite() {
                return Err(bad_kwargs(
                    name,
                    format!("pair {}-{}: dtsig must be finite and >= 0", spec.det1, spec.det2),
                ));
            }
            let noise = Normal::new(0.0, spec.dtsig).map_err(|e| {
                bad_kwargs(name, format!("pair {}-{}: {}", spec.det1, spec.det2, e))
            })?;
            pairs.push((spec, noise));
        }
        let time = match &cfg.time {
            None => None,
            Some(v) => Some(
                Value::from_json(v)
                    .as_time()
                    .ok_or_else(|| bad_kwargs(name, "time is not a timestamp"))?,
            ),
        };
        Ok(Box::new(GenPointDts {
            pairs,
            direction: radec_to_unit(cfg.ra, cfg.dec),
            ra: cfg.ra,
            dec: cfg.dec,
            time,
            seed: cfg.seed.unwrap_or(DEFAULT_SEED),
            out_field: cfg.out_field.unwrap_or_else(|| "dts".to_string()),
        }))
    }

    fn rng(&self, burst_id: i64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ (burst_id as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
    }
}

impl Node for GenPointDts {
    fn alert(&mut self, payload: &mut Payload, ctx: &mut Context) -> HandlerResult {
        let time = payload
            .get_time("time")
            .or(self.time)
            .ok_or_else(|| NodeError::schema("no 'time' in payload or configuration"))?;
        let burst_id = payload.get("burst_id").and_then(Value::as_i64).unwrap_or(0);
        let mut rng = self.rng(burst_id);

        let mut rows = Vec::with_capacity(self.pairs.len());
        for (spec, noise) in &self.pairs {
            let p1 = ctx.position(&spec.det1, &time)?;
            let p2 = ctx.position(&spec.det2, &time)?;
            let dt = predicted_dt(p1, p2, self.direction) + spec.dtbias + noise.sample(&mut rng);
            let t1 = time.add_ns((-dot(p1, self.direction) / C_LIGHT * NS_PER_S_F).round() as i64);
            let dt_ts = Timestamp::from_secs_f64(dt);

            let mut row = IndexMap::new();
            row.insert("det1".to_string(), Value::from(spec.det1.as_str()));
            row.insert("det2".to_string(), Value::from(spec.det2.as_str()));
            row.insert("dt".to_string(), Value::time(dt_ts));
            row.insert("t1".to_string(), Value::time(t1));
            row.insert("t2".to_string(), Value::time(t1 - dt_ts));
            row.insert("bias".to_string(), Value::Float(spec.dtbias));
            if spec.dtsig > 0.0 {
                row.insert("var".to_string(), Value::Float(spec.dtsig * spec.dtsig));
            }
            rows.push(Value::Map(row));
        }
        debug!(burst_id, pairs = rows.len(), "generated pair dts");

        let mut truth = IndexMap::new();
        truth.insert("ra".to_string(), Value::Float(self.ra));
        truth.insert("dec".to_string(), Value::Float(self.dec));
        payload.set(&self.out_field, Value::Array(rows));
        payload.set("truth", Value::Map(truth));
        Ok(Outcome::Forward)
    }
}
