// Root-message injection and the Monte-Carlo trial driver

use tracing::{debug, info};

use crate::dag::Dag;
use crate::error::ConfigError;
use crate::payload::{Action, Payload, Value};

/// Deliver root messages in order. A message naming no node, or one that is
/// not in the graph, is a lookup error and stops the run.
pub fn inject(dag: &mut Dag, messages: &[Payload]) -> Result<usize, ConfigError> {
    for (i, message) in messages.iter().enumerate() {
        let mut payload = message.clone();
        let name = payload
            .name
            .take()
            .ok_or_else(|| ConfigError::UnknownNode(format!("<message #{} has no name>", i)))?;
        debug!(node = %name, action = ?payload.action, "inject");
        dag.update(&name, payload)?;
    }
    info!("injected {} messages", messages.len());
    Ok(messages.len())
}

/// Replay the input once per burst with `burst_id` set, then send a report
/// to every root. Bursts are numbered from `first_burst`.
pub fn run_trials(dag: &mut Dag, messages: &[Payload], trials: u64, first_burst: u64) -> Result<(), ConfigError> {
    info!("running {} trials from burst {}", trials, first_burst);
    for k in 0..trials {
        let burst_id = first_burst.saturating_add(k) as i64;
        let tagged: Vec<Payload> = messages
            .iter()
            .filter(|m| m.action != Some(Action::Report))
            .map(|m| {
                let mut m = m.clone();
                m.set("burst_id", Value::Int(burst_id));
                m
            })
            .collect();
        inject(dag, &tagged)?;
    }
    let roots: Vec<String> = dag.roots().into_iter().map(str::to_string).collect();
    for root in &roots {
        dag.update(root, Payload::new(Action::Report))?;
    }
    info!("trials done, reported to {} roots", roots.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{messages_from_json, NodeSpec};
    use crate::dag::{build, tests::sink_registry};
    use crate::node::Context;
    use serde_json::json;

    #[test]
    fn test_inject_routes_by_name() {
        let (registry, seen) = sink_registry();
        let specs = vec![
            NodeSpec::new("Pass", "A"),
            NodeSpec::new("Pass", "B"),
            NodeSpec::new("Sink", "P").observe(&["A", "B"]),
        ];
        let mut dag = build(&specs, &registry, Context::default()).unwrap();
        let messages = messages_from_json(
            &json!([
                {"name": "B", "action": "alert", "x": 1},
                {"name": "A", "action": "reset"},
            ]),
            "mem",
        )
        .unwrap();
        assert_eq!(inject(&mut dag, &messages).unwrap(), 2);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].history.to_string(), "(B,)");
        assert_eq!(seen[0].get("x").and_then(Value::as_i64), Some(1));
        assert!(seen[0].name.is_none());
        assert_eq!(seen[1].action, Some(Action::Reset));
    }

    #[test]
    fn test_unknown_destination() {
        let (registry, _) = sink_registry();
        let mut dag = build(&[NodeSpec::new("Pass", "A")], &registry, Context::default()).unwrap();
        let messages = vec![Payload::for_node("Z", Action::Alert)];
        assert!(matches!(inject(&mut dag, &messages), Err(ConfigError::UnknownNode(_))));
    }

    #[test]
    fn test_trials_tag_bursts_and_report() {
        let (registry, seen) = sink_registry();
        let specs = vec![
            NodeSpec::new("Pass", "In"),
            NodeSpec::new("Histogram1D", "H")
                .kwargs(json!({"field": "burst_id", "nbins": 10, "xlow": 0.0, "xhigh": 10.0, "clear_on_reset": false}))
                .observe(&["In"]),
            NodeSpec::new("Sink", "P").observe(&["H"]),
        ];
        let mut dag = build(&specs, &registry, Context::default()).unwrap();
        let messages = vec![
            Payload::for_node("In", Action::Alert),
            Payload::for_node("In", Action::Reset),
            Payload::for_node("In", Action::Report),
        ];
        run_trials(&mut dag, &messages, 4, 2).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        let h = seen[0].get("histogram").and_then(Value::as_map).unwrap();
        assert_eq!(h["count"].as_i64(), Some(4));
        assert_eq!(h["bins"].to_f64_vec().unwrap()[2..6], [1.0, 1.0, 1.0, 1.0]);
    }
}
