// Node classes and the registry that builds them by name

pub mod cl_maps;
pub mod combine_maps;
pub mod diff_pointing;
pub mod first_pair;
pub mod gen_dts;
pub mod histogram;
pub mod json_output;
pub mod pair_diff;
pub mod pass;
pub mod top_down;

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;

use crate::error::{ConfigError, NodeError};
use crate::history::History;
use crate::node::{Context, Node};
use crate::payload::Payload;
use crate::tseries::TimeSeries;

pub type Constructor = Box<dyn Fn(&str, &serde_json::Value, &mut Context) -> Result<Box<dyn Node>, ConfigError>>;

/// Maps a class name to a node constructor.
#[derive(Default)]
pub struct PluginRegistry {
    classes: HashMap<String, Constructor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    /// Registry with every built-in class.
    pub fn with_builtins() -> Self {
        let mut r = PluginRegistry::new();
        r.register("Pass", pass::Pass::create);
        r.register("NthTimeDiff", pair_diff::PairDiff::nth);
        r.register("FirstEventDiff", pair_diff::PairDiff::first_event);
        r.register("NLogLag", pair_diff::PairDiff::nlog);
        r.register("NBLag", pair_diff::PairDiff::nb);
        r.register("XCovLag", pair_diff::PairDiff::xcov);
        r.register("XFFT", pair_diff::PairDiff::xfft);
        r.register("FirstPairTime", first_pair::FirstPairTime::create);
        r.register("DiffPointing", diff_pointing::DiffPointing::create);
        r.register("TopDownSeries", top_down::TopDown::series);
        r.register("EvalMap", top_down::TopDown::eval_map);
        r.register("CombineMaps", combine_maps::CombineMaps::create);
        r.register("Chi2CL", cl_maps::MapConversion::chi2_cl);
        r.register("Chi2Prob", cl_maps::MapConversion::chi2_prob);
        r.register("ProbCL", cl_maps::MapConversion::prob_cl);
        r.register("Histogram1D", histogram::Histogram1D::create);
        r.register("BinnedAccumulator", histogram::BinnedAccumulator::create);
        r.register("AccHistogram", histogram::AccHistogram::create);
        r.register("HistogramSkymap", histogram::HistogramSkymap::create);
        r.register("GenPointDts", gen_dts::GenPointDts::create);
        r.register("JsonOutput", json_output::JsonOutput::create);
        r
    }

    pub fn register<F>(&mut self, class: &str, ctor: F)
    where
        F: Fn(&str, &serde_json::Value, &mut Context) -> Result<Box<dyn Node>, ConfigError> + 'static,
    {
        self.classes.insert(class.to_string(), Box::new(ctor));
    }

    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    pub fn create(
        &self,
        class: &str,
        name: &str,
        kwargs: &serde_json::Value,
        ctx: &mut Context,
    ) -> Result<Box<dyn Node>, ConfigError> {
        let ctor = self.classes.get(class).ok_or_else(|| ConfigError::UnknownClass {
            class: class.to_string(),
            name: name.to_string(),
        })?;
        ctor(name, kwargs, ctx)
    }
}

/// Deserialize node kwargs; a missing kwargs entry gives the defaults.
pub fn kwargs<T: DeserializeOwned + Default>(name: &str, kwargs: &serde_json::Value) -> Result<T, ConfigError> {
    if kwargs.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(kwargs.clone()).map_err(|e| ConfigError::BadKwargs {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

pub fn bad_kwargs(name: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::BadKwargs {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Name of the node that delivered a payload.
pub fn source_of(payload: &Payload) -> Result<String, NodeError> {
    payload
        .history
        .last()
        .map(str::to_string)
        .ok_or_else(|| NodeError::schema("cannot identify the source of a payload without history"))
}

/// A time series field of a payload.
pub fn series_field(payload: &Payload, field: &str) -> Result<Rc<TimeSeries>, NodeError> {
    payload
        .get(field)
        .ok_or_else(|| NodeError::schema(format!("missing '{}'", field)))?
        .to_series()
        .ok_or_else(|| NodeError::schema(format!("'{}' is not a time series", field)))
}

/// Detector a source stands for: its `detector` field, or the source name.
pub fn detector_of(payload: &Payload, source: &str) -> String {
    payload.get_str("detector").unwrap_or(source).to_string()
}

struct Input<T> {
    value: T,
    history: History,
    valid: bool,
}

/// Latest input per source with a validity flag, for nodes that join
/// several upstream lines.
pub struct FanIn<T> {
    /// Observed sources in declaration order
    order: Vec<String>,
    inputs: IndexMap<String, Input<T>>,
}

impl<T> Default for FanIn<T> {
    fn default() -> Self {
        FanIn {
            order: Vec::new(),
            inputs: IndexMap::new(),
        }
    }
}

impl<T> FanIn<T> {
    pub fn new() -> Self {
        FanIn::default()
    }

    pub fn set_order(&mut self, sources: &[String]) {
        self.order = sources.to_vec();
    }

    pub fn sources(&self) -> &[String] {
        &self.order
    }

    /// Store a valid input. Returns an error for a source that is not
    /// observed (when the observed set is known).
    pub fn store(&mut self, source: &str, value: T, history: History) -> Result<(), NodeError> {
        if !self.order.is_empty() && !self.order.iter().any(|s| s == source) {
            return Err(NodeError::domain(format!("'{}' is not an observed source", source)));
        }
        self.inputs.insert(
            source.to_string(),
            Input {
                value,
                history,
                valid: true,
            },
        );
        Ok(())
    }

    /// Mark a source invalid. Returns true if it was valid.
    pub fn invalidate(&mut self, source: &str) -> bool {
        match self.inputs.get_mut(source) {
            Some(input) => std::mem::replace(&mut input.valid, false),
            None => false,
        }
    }

    /// Drop everything. Returns true if anything was held.
    pub fn clear(&mut self) -> bool {
        let had = !self.inputs.is_empty();
        self.inputs.clear();
        had
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn get(&self, source: &str) -> Option<&T> {
        self.inputs.get(source).filter(|i| i.valid).map(|i| &i.value)
    }

    /// Valid inputs: observed sources in declaration order, then any others
    /// in arrival order.
    pub fn valid(&self) -> Vec<(&str, &T, &History)> {
        let ranked = self
            .order
            .iter()
            .filter_map(|s| self.inputs.get_key_value(s.as_str()))
            .chain(
                self.inputs
                    .iter()
                    .filter(|(k, _)| !self.order.iter().any(|s| s == *k)),
            );
        ranked
            .filter(|(_, i)| i.valid)
            .map(|(k, i)| (k.as_str(), &i.value, &i.history))
            .collect()
    }

    pub fn valid_count(&self) -> usize {
        self.inputs.values().filter(|i| i.valid).count()
    }

    /// Combined history of the valid inputs.
    pub fn history(&self) -> History {
        let histories: Vec<History> = self.valid().into_iter().map(|(_, _, h)| h.clone()).collect();
        History::combine(&histories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Action;

    #[test]
    fn test_fan_in_ordering_and_validity() {
        let mut f: FanIn<i32> = FanIn::new();
        f.set_order(&["A".to_string(), "B".to_string()]);
        f.store("B", 2, History::from_names(&["B"])).unwrap();
        f.store("A", 1, History::from_names(&["A"])).unwrap();
        assert!(f.store("C", 3, History::new()).is_err());
        let names: Vec<&str> = f.valid().iter().map(|(n, _, _)| *n).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(f.history().to_string(), "(((A,), (B,)),)");

        assert!(f.invalidate("A"));
        assert!(!f.invalidate("A"));
        assert_eq!(f.valid_count(), 1);
        assert_eq!(f.get("A"), None);
        assert_eq!(f.get("B"), Some(&2));
        assert!(f.clear());
        assert!(!f.clear());
    }

    #[test]
    fn test_source_of() {
        let mut p = Payload::new(Action::Alert);
        assert!(source_of(&p).is_err());
        p.history.append("X");
        assert_eq!(source_of(&p).unwrap(), "X");
        assert_eq!(detector_of(&p, "X"), "X");
        let p = p.with("detector", "SK");
        assert_eq!(detector_of(&p, "X"), "SK");
    }

    #[test]
    fn test_registry_unknown_class() {
        let r = PluginRegistry::with_builtins();
        assert!(r.contains("DiffPointing"));
        let err = r.create("Nope", "n", &serde_json::Value::Null, &mut Context::default()).err();
        assert!(matches!(err, Some(ConfigError::UnknownClass { .. })));
    }

    #[derive(serde::Deserialize, Default, Debug, PartialEq)]
    #[serde(default)]
    struct Opts {
        n: usize,
    }

    #[test]
    fn test_kwargs() {
        assert_eq!(kwargs::<Opts>("x", &serde_json::Value::Null).unwrap(), Opts { n: 0 });
        assert_eq!(kwargs::<Opts>("x", &serde_json::json!({"n": 3})).unwrap(), Opts { n: 3 });
        assert!(matches!(
            kwargs::<Opts>("x", &serde_json::json!({"n": "three"})),
            Err(ConfigError::BadKwargs { .. })
        ));
    }
}
