// Pass-through node

use crate::error::ConfigError;
use crate::node::{Context, Node};

/// Forwards every action unchanged. Useful as a named entry point for a
/// detector line.
pub struct Pass;

impl Pass {
    pub fn create(_name: &str, _kwargs: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        Ok(Box::new(Pass))
    }
}

impl Node for Pass {}
