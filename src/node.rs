// Node protocol
//
// A node reacts to the four actions. Each handler gets the incoming payload
// (owned by this dispatch, so it may be mutated freely) and the shared
// services, and says whether and what to forward.

use crate::detector::{DetectorRegistry, EarthRotationOracle, PositionOracle};
use crate::error::{DetectorError, NodeError};
use crate::payload::{Action, Payload};
use crate::pixel_cache::PixelCache;
use crate::time::Timestamp;

/// What the engine does after a handler returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Stop here; observers see nothing.
    Consumed,
    /// Forward the (possibly mutated) incoming payload.
    Forward,
    /// Forward this payload instead. A replacement without an action keeps
    /// the incoming one; one with an empty history inherits the incoming
    /// history.
    Replace(Payload),
}

pub type HandlerResult = Result<Outcome, NodeError>;

/// Services shared by every node of a DAG.
pub struct Context {
    pub detectors: DetectorRegistry,
    pub pixels: PixelCache,
    pub positions: Box<dyn PositionOracle>,
}

impl Default for Context {
    fn default() -> Self {
        Context::new(DetectorRegistry::new())
    }
}

impl Context {
    pub fn new(detectors: DetectorRegistry) -> Self {
        Context {
            detectors,
            pixels: PixelCache::default(),
            positions: Box::new(EarthRotationOracle),
        }
    }

    /// Geocentric position of a detector at `time`, meters.
    pub fn position(&self, detector: &str, time: &Timestamp) -> Result<[f64; 3], DetectorError> {
        let record = self.detectors.get(detector)?;
        Ok(self.positions.position(record, time))
    }
}

/// A processing node. Every handler defaults to forwarding unchanged.
///
/// Errors returned from a handler are logged by the engine and the action is
/// consumed; they never reach the driver.
pub trait Node {
    /// Called once by the builder with the names this node observes, in
    /// declaration order. Fan-in nodes use it to order their inputs.
    fn observing(&mut self, _sources: &[String]) {}

    fn alert(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(Outcome::Forward)
    }

    fn revoke(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(Outcome::Forward)
    }

    fn reset(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(Outcome::Forward)
    }

    fn report(&mut self, _payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        Ok(Outcome::Forward)
    }
}

/// Route a payload to the handler for `action`.
pub fn dispatch(node: &mut dyn Node, action: Action, payload: &mut Payload, ctx: &mut Context) -> HandlerResult {
    match action {
        Action::Alert => node.alert(payload, ctx),
        Action::Revoke => node.revoke(payload, ctx),
        Action::Reset => node.reset(payload, ctx),
        Action::Report => node.report(payload, ctx),
    }
}
