// Skymap conversions: χ² to confidence level or probability, and
// probability to credible level

use serde::Deserialize;

use crate::combine::{chi2_to_cl, chi2_to_prob, prob_to_cl};
use crate::constants::POINTING_NDOF;
use crate::error::{ConfigError, NodeError};
use crate::node::{Context, HandlerResult, Node, Outcome};
use crate::payload::{Payload, Value};
use crate::plugins::kwargs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Chi2Cl,
    Chi2Prob,
    ProbCl,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub in_field: Option<String>,
    pub out_field: Option<String>,
    /// Degrees of freedom; taken from the payload's `ndof`, then 2, if unset
    pub ndof: Option<f64>,
}

/// Writes a converted copy of one map field into another.
pub struct MapConversion {
    kind: Conversion,
    in_field: String,
    out_field: String,
    ndof: Option<f64>,
}

impl MapConversion {
    fn create(name: &str, args: &serde_json::Value, kind: Conversion) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: ConversionConfig = kwargs(name, args)?;
        let (default_in, default_out) = match kind {
            Conversion::Chi2Cl => ("map", "cl"),
            Conversion::Chi2Prob => ("map", "prob"),
            Conversion::ProbCl => ("prob", "cl"),
        };
        Ok(Box::new(MapConversion {
            kind,
            in_field: cfg.in_field.unwrap_or_else(|| default_in.to_string()),
            out_field: cfg.out_field.unwrap_or_else(|| default_out.to_string()),
            ndof: cfg.ndof,
        }))
    }

    pub fn chi2_cl(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        Self::create(name, args, Conversion::Chi2Cl)
    }

    pub fn chi2_prob(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        Self::create(name, args, Conversion::Chi2Prob)
    }

    pub fn prob_cl(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        Self::create(name, args, Conversion::ProbCl)
    }
}

impl Node for MapConversion {
    fn alert(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let map = payload
            .get(&self.in_field)
            .and_then(Value::to_f64_vec)
            .ok_or_else(|| NodeError::schema(format!("'{}' is not a numeric array", self.in_field)))?;
        let ndof = self
            .ndof
            .or_else(|| payload.get_f64("ndof"))
            .unwrap_or(POINTING_NDOF as f64);
        let out = match self.kind {
            Conversion::Chi2Cl => chi2_to_cl(&map, ndof)?,
            Conversion::Chi2Prob => chi2_to_prob(&map, ndof)?,
            Conversion::ProbCl => prob_to_cl(&map)?,
        };
        payload.set(&self.out_field, Value::vector(out));
        Ok(Outcome::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Action;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn run(ctor: fn(&str, &serde_json::Value, &mut Context) -> Result<Box<dyn Node>, ConfigError>, args: serde_json::Value, payload: Payload) -> Payload {
        let mut ctx = Context::default();
        let mut node = ctor("conv", &args, &mut ctx).unwrap();
        let mut p = payload;
        assert_eq!(node.alert(&mut p, &mut ctx).unwrap(), Outcome::Forward);
        p
    }

    #[test]
    fn test_chi2_cl() {
        let map = vec![4.0, 2.0, 8.0, 2.5];
        let p = run(MapConversion::chi2_cl, json!({}), Payload::new(Action::Alert).with("map", map.clone()));
        let cl = p.get("cl").unwrap().to_f64_vec().unwrap();
        assert_relative_eq!(cl[1], 1.0);
        for (c, m) in cl.iter().zip(&map) {
            assert_relative_eq!(*c, (-(m - 2.0) / 2.0).exp(), epsilon = 1e-12);
            assert!((0.0..=1.0).contains(c));
        }
        // the input field is left in place
        assert!(p.contains("map"));
    }

    #[test]
    fn test_chi2_prob_uses_payload_ndof() {
        let payload = Payload::new(Action::Alert).with("map", vec![0.0, 1.0, 2.0]).with("ndof", 4i64);
        let p = run(MapConversion::chi2_prob, json!({}), payload);
        let prob = p.get("prob").unwrap().to_f64_vec().unwrap();
        assert_relative_eq!(prob.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        // with 4 dof the density peaks away from zero
        assert!(prob[2] > prob[0]);
    }

    #[test]
    fn test_prob_cl() {
        let payload = Payload::new(Action::Alert).with("p", vec![1.0, 6.0, 3.0]);
        let p = run(MapConversion::prob_cl, json!({"in_field": "p", "out_field": "level"}), payload);
        let level = p.get("level").unwrap().to_f64_vec().unwrap();
        assert_relative_eq!(level[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(level[2], 0.4, epsilon = 1e-12);
        assert_relative_eq!(level[0], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_field() {
        let mut ctx = Context::default();
        let mut node = MapConversion::chi2_cl("c", &json!({}), &mut ctx).unwrap();
        let mut p = Payload::new(Action::Alert);
        assert!(matches!(node.alert(&mut p, &mut ctx), Err(NodeError::Schema(_))));
    }
}
