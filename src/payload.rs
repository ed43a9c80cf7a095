// Payloads exchanged between DAG nodes
//
// A payload is an insertion-ordered dictionary of typed values, tagged with an
// action and carrying the history of nodes it passed through. Nested values
// are addressed with slash-separated key paths ("a/b/c").

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::hist::{Hist1D, TimeHist};
use crate::history::History;
use crate::time::Timestamp;
use crate::tseries::TimeSeries;

/// What a message asks a node to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Alert,
    Revoke,
    Reset,
    Report,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Alert => "alert",
            Action::Revoke => "revoke",
            Action::Reset => "reset",
            Action::Report => "report",
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alert" => Ok(Action::Alert),
            "revoke" => Ok(Action::Revoke),
            "reset" => Ok(Action::Reset),
            "report" => Ok(Action::Report),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload field. Large numeric products are shared behind `Rc` so that
/// forwarding a payload to several observers does not copy them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(IndexMap<String, Value>),
    /// Dense float array: skymaps, histogram bins, profiles.
    Vector(Rc<Vec<f64>>),
    Series(Rc<TimeSeries>),
    Hist(Rc<Hist1D>),
    TimeHist(Rc<TimeHist>),
}

impl Value {
    pub fn vector(v: Vec<f64>) -> Value {
        Value::Vector(Rc::new(v))
    }

    pub fn time(t: Timestamp) -> Value {
        Value::Array(vec![Value::Int(t.s), Value::Int(t.ns)])
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Numeric array, from either a dense vector or a list of numbers.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            Value::Vector(v) => Some(v.as_ref().clone()),
            Value::Array(a) => a.iter().map(Value::as_f64).collect(),
            _ => None,
        }
    }

    /// Shared dense vector; lists are converted.
    pub fn to_shared_vec(&self) -> Option<Rc<Vec<f64>>> {
        match self {
            Value::Vector(v) => Some(Rc::clone(v)),
            other => other.to_f64_vec().map(Rc::new),
        }
    }

    /// A time given as `[s, ns]`, float seconds, or an RFC 3339 string.
    pub fn as_time(&self) -> Option<Timestamp> {
        match self {
            Value::Array(a) if a.len() == 2 => {
                let s = a[0].as_i64()?;
                let ns = a[1].as_i64()?;
                Some(Timestamp::new(s, ns))
            }
            Value::Int(i) => Some(Timestamp::new(*i, 0)),
            Value::Float(f) => Some(Timestamp::from_secs_f64(*f)),
            Value::Str(s) => Timestamp::parse_rfc3339(s),
            _ => None,
        }
    }

    /// A series given as a `TimeSeries`, a list of seconds relative to t=0,
    /// or a map `{t0, times, start?, stop?}` with times in seconds from t0.
    pub fn to_series(&self) -> Option<Rc<TimeSeries>> {
        match self {
            Value::Series(ts) => Some(Rc::clone(ts)),
            Value::Array(_) | Value::Vector(_) => {
                let times = self.to_f64_vec()?;
                Some(Rc::new(TimeSeries::from_secs(Timestamp::default(), &times)))
            }
            Value::Map(m) => {
                let t0 = match m.get("t0") {
                    Some(v) => v.as_time()?,
                    None => Timestamp::default(),
                };
                let times = m.get("times")?.to_f64_vec()?;
                let to_ns = |v: &Value| v.as_f64().map(|s| (s * 1e9).round() as i64);
                let mut ts = match (m.get("start").and_then(to_ns), m.get("stop").and_then(to_ns)) {
                    (Some(start), Some(stop)) => TimeSeries::with_window(t0, start, stop),
                    _ => TimeSeries::new(t0),
                };
                ts.add_offsets(times.iter().map(|t| (t * 1e9).round() as i64));
                Some(Rc::new(ts))
            }
            _ => None,
        }
    }

    /// Element `i` of an array-like value, as a float.
    fn index_f64(&self, i: usize) -> Option<f64> {
        match self {
            Value::Vector(v) => v.get(i).copied(),
            Value::Array(a) => a.get(i)?.as_f64(),
            _ => None,
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(a) => Value::Array(a.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(o) => Value::Map(
                o.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::vector(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => {
                let mut seq = serializer.serialize_seq(Some(b.len()))?;
                for byte in b {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
            Value::Array(a) => {
                let mut seq = serializer.serialize_seq(Some(a.len()))?;
                for v in a {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Value::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Vector(v) => v.as_ref().serialize(serializer),
            Value::Series(ts) => ts.as_ref().serialize(serializer),
            Value::Hist(h) => h.as_ref().serialize(serializer),
            Value::TimeHist(h) => h.as_ref().serialize(serializer),
        }
    }
}

/// Payload routed through the DAG.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub action: Option<Action>,
    /// Destination node, for root messages injected by the driver.
    pub name: Option<String>,
    pub history: History,
    pub fields: IndexMap<String, Value>,
}

impl Payload {
    pub fn new(action: Action) -> Self {
        Payload {
            action: Some(action),
            ..Payload::default()
        }
    }

    pub fn for_node(name: &str, action: Action) -> Self {
        Payload {
            action: Some(action),
            name: Some(name.to_string()),
            ..Payload::default()
        }
    }

    /// Builder-style field insert at a key path.
    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set(path, value.into());
        self
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut keys = path.split('/');
        let mut cur = self.fields.get(keys.next()?)?;
        for key in keys {
            cur = match cur {
                Value::Map(m) => m.get(key)?,
                Value::Array(a) => a.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Float at a key path; a trailing numeric segment may index into a
    /// dense vector.
    pub fn get_f64(&self, path: &str) -> Option<f64> {
        if let Some(v) = self.get(path) {
            return v.as_f64();
        }
        let (parent, idx) = path.rsplit_once('/')?;
        let i = idx.parse::<usize>().ok()?;
        self.get(parent)?.index_f64(i)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)?.as_str()
    }

    pub fn get_time(&self, path: &str) -> Option<Timestamp> {
        self.get(path)?.as_time()
    }

    /// Set a value, creating intermediate maps as needed. Non-map
    /// intermediates are replaced.
    pub fn set(&mut self, path: &str, value: Value) {
        let keys: Vec<&str> = path.split('/').collect();
        set_in(&mut self.fields, &keys, value);
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let (parents, last) = match path.rsplit_once('/') {
            Some((p, l)) => (Some(p), l),
            None => (None, path),
        };
        let map = match parents {
            None => &mut self.fields,
            Some(p) => {
                let mut map = &mut self.fields;
                for key in p.split('/') {
                    map = match map.get_mut(key)? {
                        Value::Map(m) => m,
                        _ => return None,
                    };
                }
                map
            }
        };
        map.shift_remove(last)
    }

    /// Build a root message from a JSON object. `name` and `action` are taken
    /// out of the field map; `history` is ignored and starts empty.
    pub fn from_json(json: &serde_json::Value) -> Option<Payload> {
        let obj = json.as_object()?;
        let mut payload = Payload::default();
        for (k, v) in obj {
            match k.as_str() {
                "name" => payload.name = v.as_str().map(str::to_string),
                "action" => payload.action = v.as_str().and_then(|s| s.parse().ok()),
                "history" => {}
                _ => {
                    payload.fields.insert(k.clone(), Value::from_json(v));
                }
            }
        }
        Some(payload)
    }
}

fn set_in(map: &mut IndexMap<String, Value>, keys: &[&str], value: Value) {
    match keys {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [key, rest @ ..] => {
            let entry = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Map(IndexMap::new()));
            match entry {
                Value::Map(inner) => set_in(inner, rest, value),
                other => {
                    let mut inner = IndexMap::new();
                    set_in(&mut inner, rest, value);
                    *other = Value::Map(inner);
                }
            }
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(action) = self.action {
            map.serialize_entry("action", action.as_str())?;
        }
        if let Some(name) = &self.name {
            map.serialize_entry("name", name)?;
        }
        map.serialize_entry("history", &self.history)?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}
