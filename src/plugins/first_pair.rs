// First coincident pair in a single series

use serde::Deserialize;

use crate::constants::NS_PER_S_F;
use crate::error::ConfigError;
use crate::node::{Context, HandlerResult, Node, Outcome};
use crate::payload::{Action, Payload, Value};
use crate::plugins::{bad_kwargs, kwargs, series_field};
use crate::timediff::first_pair_time;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirstPairConfig {
    pub field: String,
    pub out_field: String,
    /// Coincidence window in seconds
    pub window: f64,
}

impl Default for FirstPairConfig {
    fn default() -> Self {
        FirstPairConfig {
            field: "times".to_string(),
            out_field: "first_pair_time".to_string(),
            window: 0.001,
        }
    }
}

/// Writes the time of the first two events closer than `window` into
/// `out_field`. A series without such a pair withdraws an earlier result.
pub struct FirstPairTime {
    field: String,
    out_field: String,
    window_ns: i64,
    emitted: bool,
}

impl FirstPairTime {
    pub fn create(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: FirstPairConfig = kwargs(name, args)?;
        if !(cfg.window >= 0.0) {
            return Err(bad_kwargs(name, "window must be non-negative"));
        }
        Ok(Box::new(FirstPairTime {
            field: cfg.field,
            out_field: cfg.out_field,
            window_ns: (cfg.window * NS_PER_S_F).round() as i64,
            emitted: false,
        }))
    }
}

impl Node for FirstPairTime {
    fn alert(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        let series = series_field(payload, &self.field)?;
        match first_pair_time(&series, self.window_ns) {
            Some(t) => {
                payload.set(&self.out_field, Value::time(t));
                self.emitted = true;
                Ok(Outcome::Forward)
            }
            None if std::mem::replace(&mut self.emitted, false) => {
                let mut revoke = Payload::new(Action::Revoke);
                revoke.history = payload.history.clone();
                Ok(Outcome::Replace(revoke))
            }
            None => Ok(Outcome::Consumed),
        }
    }

    fn revoke(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(if std::mem::replace(&mut self.emitted, false) {
            Outcome::Forward
        } else {
            Outcome::Consumed
        })
    }

    fn reset(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(if std::mem::replace(&mut self.emitted, false) {
            Outcome::Forward
        } else {
            Outcome::Consumed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;
    use serde_json::json;

    fn node(window: f64) -> Box<dyn Node> {
        FirstPairTime::create("F", &json!({"window": window}), &mut Context::default()).unwrap()
    }

    fn alert(times: Vec<f64>) -> Payload {
        Payload::new(Action::Alert).with("times", times)
    }

    #[test]
    fn test_first_pair_written() {
        let mut n = node(0.03);
        let mut ctx = Context::default();
        let mut p = alert(vec![0.9, 0.1, 0.5, 0.52]);
        assert_eq!(n.alert(&mut p, &mut ctx).unwrap(), Outcome::Forward);
        assert_eq!(p.get_time("first_pair_time"), Some(Timestamp::new(0, 500_000_000)));
    }

    #[test]
    fn test_no_pair_revokes_only_after_emit() {
        let mut n = node(0.001);
        let mut ctx = Context::default();
        let mut lonely = alert(vec![0.0, 0.5]);
        assert_eq!(n.alert(&mut lonely, &mut ctx).unwrap(), Outcome::Consumed);

        let mut pair = alert(vec![0.0, 0.0005]);
        assert_eq!(n.alert(&mut pair, &mut ctx).unwrap(), Outcome::Forward);
        match n.alert(&mut lonely, &mut ctx).unwrap() {
            Outcome::Replace(p) => assert_eq!(p.action, Some(Action::Revoke)),
            other => panic!("expected revoke, got {:?}", other),
        }
        let mut revoke = Payload::new(Action::Revoke);
        assert_eq!(n.revoke(&mut revoke, &mut ctx).unwrap(), Outcome::Consumed);
    }
}
