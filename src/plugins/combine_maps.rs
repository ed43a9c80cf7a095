// Skymap combiner
//
// Keeps the latest map from each source line. Every alert or revoke that
// changes the valid set recombines them; when no valid source remains the
// node withdraws its output.

use std::rc::Rc;

use serde::Deserialize;
use tracing::debug;

use crate::combine::{combine, SkyMap};
use crate::constants::POINTING_NDOF;
use crate::error::{ConfigError, NodeError};
use crate::healpix;
use crate::node::{Context, HandlerResult, Node, Outcome};
use crate::payload::{Action, Payload, Value};
use crate::plugins::{kwargs, source_of, FanIn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CombineConfig {
    /// Combine as confidence levels even when every input is χ²
    pub force_cl: bool,
    pub chi2_field: String,
    pub cl_field: String,
}

impl Default for CombineConfig {
    fn default() -> Self {
        CombineConfig {
            force_cl: false,
            chi2_field: "map".to_string(),
            cl_field: "cl".to_string(),
        }
    }
}

pub struct CombineMaps {
    force_cl: bool,
    chi2_field: String,
    cl_field: String,
    inputs: FanIn<SkyMap>,
}

impl CombineMaps {
    pub fn create(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: CombineConfig = kwargs(name, args)?;
        Ok(Box::new(CombineMaps {
            force_cl: cfg.force_cl,
            chi2_field: cfg.chi2_field,
            cl_field: cfg.cl_field,
            inputs: FanIn::new(),
        }))
    }

    fn read_map(&self, payload: &Payload) -> Result<SkyMap, NodeError> {
        let shared = |field: &str| -> Result<Rc<Vec<f64>>, NodeError> {
            let map = payload
                .get(field)
                .and_then(Value::to_shared_vec)
                .ok_or_else(|| NodeError::schema(format!("'{}' is not a numeric array", field)))?;
            if healpix::npix2nside(map.len()).is_none() {
                return Err(NodeError::domain(format!(
                    "'{}' has {} pixels, not a HEALPix map",
                    field,
                    map.len()
                )));
            }
            Ok(map)
        };
        match (payload.contains(&self.chi2_field), payload.contains(&self.cl_field)) {
            (true, true) => Err(NodeError::schema(format!(
                "payload carries both '{}' and '{}'",
                self.chi2_field, self.cl_field
            ))),
            (true, false) => {
                let ndof = payload.get_f64("ndof").unwrap_or(POINTING_NDOF as f64);
                if !(ndof.is_finite() && ndof > 0.0) {
                    return Err(NodeError::domain(format!("invalid degrees of freedom {}", ndof)));
                }
                Ok(SkyMap::Chi2 {
                    map: shared(&self.chi2_field)?,
                    ndof,
                })
            }
            (false, true) => Ok(SkyMap::Cl(shared(&self.cl_field)?)),
            (false, false) => Err(NodeError::schema(format!(
                "payload has neither '{}' nor '{}'",
                self.chi2_field, self.cl_field
            ))),
        }
    }

    fn recombine(&self, incoming: &Payload) -> HandlerResult {
        let valid = self.inputs.valid();
        if valid.is_empty() {
            let mut out = Payload::new(Action::Revoke);
            out.history = incoming.history.clone();
            return Ok(Outcome::Replace(out));
        }
        let maps: Vec<&SkyMap> = valid.iter().map(|(_, m, _)| *m).collect();
        let combined = combine(&maps, self.force_cl)?;
        debug!(sources = maps.len(), chi2 = combined.is_chi2(), "combined maps");

        let mut out = Payload::new(Action::Alert);
        out.history = self.inputs.history();
        if let Some(burst_id) = incoming.get("burst_id") {
            out.set("burst_id", burst_id.clone());
        }
        match combined {
            SkyMap::Chi2 { map, ndof } => {
                out.set(&self.chi2_field, Value::Vector(map));
                out.set("ndof", Value::Float(ndof));
            }
            SkyMap::Cl(map) => out.set(&self.cl_field, Value::Vector(map)),
        }
        Ok(Outcome::Replace(out))
    }
}

impl Node for CombineMaps {
    fn observing(&mut self, sources: &[String]) {
        self.inputs.set_order(sources);
    }

    fn alert(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let source = source_of(payload)?;
        let map = self.read_map(payload)?;
        self.inputs.store(&source, map, payload.history.clone())?;
        self.recombine(payload)
    }

    fn revoke(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let source = source_of(payload)?;
        if !self.inputs.invalidate(&source) {
            return Ok(Outcome::Consumed);
        }
        self.recombine(payload)
    }

    fn reset(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(if self.inputs.clear() {
            Outcome::Forward
        } else {
            Outcome::Consumed
        })
    }
}
