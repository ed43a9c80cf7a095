// Dataflow engine
//
// Nodes live in an arena indexed by `NodeId`. Each slot records whom the node
// notifies and whom it watches; the two lists are kept mirror images of each
// other. Dispatch is a depth-first worklist: a node's handler finishes before
// any observer runs, and observers are visited in attach order.

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::config::NodeSpec;
use crate::error::ConfigError;
use crate::node::{dispatch, Context, Node, Outcome};
use crate::payload::Payload;
use crate::plugins::PluginRegistry;

pub type NodeId = usize;

struct Slot {
    name: String,
    node: Box<dyn Node>,
    observers: Vec<NodeId>,
    watching: Vec<NodeId>,
    /// Last payload this node forwarded
    last: Option<Payload>,
}

pub struct Dag {
    slots: Vec<Slot>,
    index: IndexMap<String, NodeId>,
    ctx: Context,
}

impl Dag {
    pub fn new(ctx: Context) -> Self {
        Dag {
            slots: Vec::new(),
            index: IndexMap::new(),
            ctx,
        }
    }

    /// Add an unattached node.
    pub fn add(&mut self, name: &str, node: Box<dyn Node>) -> Result<NodeId, ConfigError> {
        if self.index.contains_key(name) {
            return Err(ConfigError::DuplicateName(name.to_string()));
        }
        let id = self.slots.len();
        self.slots.push(Slot {
            name: name.to_string(),
            node,
            observers: Vec::new(),
            watching: Vec::new(),
            last: None,
        });
        self.index.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn id(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    fn require(&self, name: &str) -> Result<NodeId, ConfigError> {
        self.id(name).ok_or_else(|| ConfigError::UnknownNode(name.to_string()))
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.slots[id].name
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Node names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Nodes that watch nothing.
    pub fn roots(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| s.watching.is_empty())
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn observers(&self, name: &str) -> Vec<&str> {
        self.id(name)
            .map(|id| self.slots[id].observers.iter().map(|&o| self.name(o)).collect())
            .unwrap_or_default()
    }

    pub fn watch_list(&self, name: &str) -> Vec<&str> {
        self.id(name)
            .map(|id| self.slots[id].watching.iter().map(|&w| self.name(w)).collect())
            .unwrap_or_default()
    }

    /// True if `to` can be reached from `from` along observer edges.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.slots.len()];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !std::mem::replace(&mut seen[id], true) {
                stack.extend(self.slots[id].observers.iter().copied());
            }
        }
        false
    }

    /// Make `observer` receive what `upstream` forwards. Attaching twice is a
    /// no-op; an edge that closes a cycle is rejected.
    pub fn attach(&mut self, upstream: &str, observer: &str) -> Result<(), ConfigError> {
        let up = self.require(upstream)?;
        let obs = self.require(observer)?;
        if up == obs {
            return Err(ConfigError::SelfObservation(observer.to_string()));
        }
        if self.slots[up].observers.contains(&obs) {
            return Ok(());
        }
        if self.reaches(obs, up) {
            return Err(ConfigError::Cycle {
                upstream: upstream.to_string(),
                observer: observer.to_string(),
            });
        }
        self.slots[up].observers.push(obs);
        self.slots[obs].watching.push(up);
        Ok(())
    }

    /// Inverse of `attach`. Returns whether an edge was removed.
    pub fn detach(&mut self, upstream: &str, observer: &str) -> bool {
        let (Some(up), Some(obs)) = (self.id(upstream), self.id(observer)) else {
            return false;
        };
        let before = self.slots[up].observers.len();
        self.slots[up].observers.retain(|&o| o != obs);
        self.slots[obs].watching.retain(|&w| w != up);
        self.slots[up].observers.len() != before
    }

    /// Last payload forwarded by a node.
    pub fn last(&self, name: &str) -> Option<&Payload> {
        self.slots[self.id(name)?].last.as_ref()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// Deliver a payload to the named node and run the graph until quiet.
    pub fn update(&mut self, name: &str, payload: Payload) -> Result<(), ConfigError> {
        let id = self.require(name)?;
        self.run(id, payload);
        Ok(())
    }

    fn run(&mut self, start: NodeId, payload: Payload) {
        let mut work = vec![(start, payload)];
        while let Some((id, mut payload)) = work.pop() {
            let slot = &mut self.slots[id];
            let Some(action) = payload.action else {
                warn!(node = %slot.name, "payload has no action, dropped");
                continue;
            };
            debug!(node = %slot.name, %action, "dispatch");

            let outcome = match dispatch(slot.node.as_mut(), action, &mut payload, &mut self.ctx) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(node = %slot.name, %action, "{}", e);
                    Outcome::Consumed
                }
            };
            let mut out = match outcome {
                Outcome::Consumed => continue,
                Outcome::Forward => payload,
                Outcome::Replace(mut replacement) => {
                    if replacement.action.is_none() {
                        replacement.action = Some(action);
                    }
                    if replacement.history.is_empty() {
                        replacement.history = payload.history;
                    }
                    replacement
                }
            };
            out.history.append(&slot.name);
            slot.last = Some(out.clone());

            // reversed so that the first observer is popped first
            for &obs in slot.observers.iter().rev() {
                work.push((obs, out.clone()));
            }
        }
    }
}

/// Build a wired DAG from node specifications.
///
/// Specs are processed in order; every observed name must already be
/// declared, so the result is acyclic by construction.
pub fn build(specs: &[NodeSpec], registry: &PluginRegistry, ctx: Context) -> Result<Dag, ConfigError> {
    let mut dag = Dag::new(ctx);
    for (index, spec) in specs.iter().enumerate() {
        let class = spec.class.as_deref().ok_or(ConfigError::MissingClass { index })?;
        let name = spec.name.as_deref().ok_or(ConfigError::MissingName { index })?;
        if dag.id(name).is_some() {
            return Err(ConfigError::DuplicateName(name.to_string()));
        }
        for upstream in &spec.observe {
            if upstream == name {
                return Err(ConfigError::SelfObservation(name.to_string()));
            }
            if dag.id(upstream).is_none() {
                return Err(ConfigError::UnknownSource {
                    node: name.to_string(),
                    upstream: upstream.clone(),
                });
            }
        }

        let mut node = registry.create(class, name, &spec.kwargs, &mut dag.ctx)?;
        node.observing(&spec.observe);
        dag.add(name, node)?;
        for upstream in &spec.observe {
            dag.attach(upstream, name)?;
        }
        debug!(node = name, class, observes = ?spec.observe, "node created");
    }
    Ok(dag)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::node::HandlerResult;
    use crate::payload::{Action, Value};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records every payload it receives, then forwards.
    pub(crate) struct Sink {
        pub seen: Rc<RefCell<Vec<Payload>>>,
    }

    impl Sink {
        fn record(&mut self, payload: &mut Payload) -> HandlerResult {
            self.seen.borrow_mut().push(payload.clone());
            Ok(Outcome::Forward)
        }
    }

    impl Node for Sink {
        fn alert(&mut self, p: &mut Payload, _: &mut Context) -> HandlerResult {
            self.record(p)
        }
        fn revoke(&mut self, p: &mut Payload, _: &mut Context) -> HandlerResult {
            self.record(p)
        }
        fn reset(&mut self, p: &mut Payload, _: &mut Context) -> HandlerResult {
            self.record(p)
        }
        fn report(&mut self, p: &mut Payload, _: &mut Context) -> HandlerResult {
            self.record(p)
        }
    }

    /// Registry with the built-in classes plus `Sink`, whose instances all
    /// record into the returned log.
    pub(crate) fn sink_registry() -> (PluginRegistry, Rc<RefCell<Vec<Payload>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut registry = PluginRegistry::with_builtins();
        let log = Rc::clone(&seen);
        registry.register("Sink", move |_, _, _| {
            Ok(Box::new(Sink { seen: Rc::clone(&log) }) as Box<dyn Node>)
        });
        (registry, seen)
    }

    struct Tagger(&'static str);

    impl Node for Tagger {
        fn alert(&mut self, p: &mut Payload, _: &mut Context) -> HandlerResult {
            let mut order = p.get("order").and_then(Value::as_str).unwrap_or("").to_string();
            order.push_str(self.0);
            p.set("order", Value::Str(order));
            Ok(Outcome::Forward)
        }
        fn report(&mut self, _: &mut Payload, _: &mut Context) -> HandlerResult {
            Ok(Outcome::Consumed)
        }
    }

    fn chain(names: &[&str]) -> Dag {
        let mut dag = Dag::new(Context::default());
        for n in names {
            dag.add(n, Box::new(Tagger("x"))).unwrap();
        }
        dag
    }

    #[test]
    fn test_attach_detach_mirror() {
        let mut dag = chain(&["A", "B", "C"]);
        dag.attach("A", "B").unwrap();
        dag.attach("A", "C").unwrap();
        dag.attach("A", "B").unwrap();
        assert_eq!(dag.observers("A"), vec!["B", "C"]);
        assert_eq!(dag.watch_list("B"), vec!["A"]);

        assert!(dag.detach("A", "B"));
        assert!(!dag.detach("A", "B"));
        assert_eq!(dag.observers("A"), vec!["C"]);
        assert!(dag.watch_list("B").is_empty());
        assert_eq!(dag.roots(), vec!["A", "B"]);
    }

    #[test]
    fn test_cycle_and_self_rejected() {
        let mut dag = chain(&["A", "B", "C"]);
        dag.attach("A", "B").unwrap();
        dag.attach("B", "C").unwrap();
        assert!(matches!(dag.attach("C", "A"), Err(ConfigError::Cycle { .. })));
        assert!(matches!(dag.attach("A", "A"), Err(ConfigError::SelfObservation(_))));
        assert!(matches!(dag.attach("A", "Z"), Err(ConfigError::UnknownNode(_))));
    }

    #[test]
    fn test_depth_first_attach_order() {
        // A -> B -> D, A -> C; B's subtree finishes before C runs
        let mut dag = Dag::new(Context::default());
        for (n, tag) in [("A", "a"), ("B", "b"), ("C", "c"), ("D", "d")] {
            dag.add(n, Box::new(Tagger(tag))).unwrap();
        }
        dag.attach("A", "B").unwrap();
        dag.attach("A", "C").unwrap();
        dag.attach("B", "D").unwrap();
        dag.update("A", Payload::new(Action::Alert)).unwrap();
        assert_eq!(dag.last("D").unwrap().get_str("order"), Some("abd"));
        assert_eq!(dag.last("C").unwrap().get_str("order"), Some("ac"));
        assert_eq!(dag.last("D").unwrap().history.to_string(), "(A, B, D)");
    }

    #[test]
    fn test_consumed_stops_propagation() {
        let mut dag = chain(&["A", "B"]);
        dag.attach("A", "B").unwrap();
        dag.update("A", Payload::new(Action::Report)).unwrap();
        assert!(dag.last("A").is_none());
        assert!(dag.last("B").is_none());
    }

    #[test]
    fn test_missing_action_dropped() {
        let mut dag = chain(&["A"]);
        dag.update("A", Payload::default()).unwrap();
        assert!(dag.last("A").is_none());
        assert!(matches!(dag.update("Q", Payload::default()), Err(ConfigError::UnknownNode(_))));
    }

    #[test]
    fn test_build_validations() {
        let (registry, _) = sink_registry();
        let build_err = |specs: Vec<NodeSpec>| build(&specs, &registry, Context::default()).err();

        let missing_class = NodeSpec {
            name: Some("A".into()),
            ..NodeSpec::default()
        };
        assert!(matches!(build_err(vec![missing_class]), Some(ConfigError::MissingClass { index: 0 })));
        let missing_name = NodeSpec {
            class: Some("Pass".into()),
            ..NodeSpec::default()
        };
        assert!(matches!(build_err(vec![missing_name]), Some(ConfigError::MissingName { index: 0 })));
        assert!(matches!(
            build_err(vec![NodeSpec::new("Pass", "A"), NodeSpec::new("Pass", "A")]),
            Some(ConfigError::DuplicateName(_))
        ));
        assert!(matches!(
            build_err(vec![NodeSpec::new("Pass", "B").observe(&["A"]), NodeSpec::new("Pass", "A")]),
            Some(ConfigError::UnknownSource { .. })
        ));
        assert!(matches!(
            build_err(vec![NodeSpec::new("Pass", "A").observe(&["A"])]),
            Some(ConfigError::SelfObservation(_))
        ));
        assert!(matches!(
            build_err(vec![NodeSpec::new("NoSuchNode", "A")]),
            Some(ConfigError::UnknownClass { .. })
        ));
    }

    #[test]
    fn test_pass_chain_keeps_fields() {
        let (registry, seen) = sink_registry();
        let specs = vec![
            NodeSpec::new("Pass", "A"),
            NodeSpec::new("Pass", "B").observe(&["A"]),
            NodeSpec::new("Pass", "C").observe(&["B"]),
            NodeSpec::new("Sink", "P").observe(&["C"]),
        ];
        let mut dag = build(&specs, &registry, Context::default()).unwrap();
        let input = Payload::new(Action::Alert).with("x", 3.5).with("m/k", "v");
        dag.update("A", input.clone()).unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].fields, input.fields);
        assert_eq!(seen[0].history.to_string(), "(A, B, C)");
    }
}
