// Message history
//
// A history records the path a payload took through the DAG. Fan-in nodes
// fold the histories of their inputs into a single combine element, so the
// full trace is a tree whose leaves are source names.

use std::fmt;
use std::rc::Rc;

use serde::ser::{Serialize, SerializeSeq, Serializer};

#[derive(Debug, Clone, PartialEq)]
enum Element {
    Name(Rc<str>),
    Combine(Rc<[History]>),
}

/// Append-only trace of node names. Cloning shares the combine subtrees.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct History {
    elements: Vec<Element>,
}

/// Emitted form of a history: nested tuples of names.
#[derive(Debug, Clone, PartialEq)]
pub enum Trace {
    Name(String),
    Tuple(Vec<Trace>),
}

impl History {
    pub fn new() -> Self {
        History::default()
    }

    pub fn from_names(names: &[&str]) -> Self {
        let mut h = History::new();
        for name in names {
            h.append(name);
        }
        h
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }

    pub fn append(&mut self, name: &str) {
        self.elements.push(Element::Name(Rc::from(name)));
    }

    /// Collapse the given histories into one combine element.
    pub fn combine(histories: &[History]) -> History {
        History {
            elements: vec![Element::Combine(histories.iter().cloned().collect())],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Rightmost element, if it is a node name.
    pub fn last(&self) -> Option<&str> {
        match self.elements.last()? {
            Element::Name(n) => Some(n),
            Element::Combine(_) => None,
        }
    }

    /// True if `name` appears anywhere in the trace.
    pub fn contains(&self, name: &str) -> bool {
        self.elements.iter().any(|e| match e {
            Element::Name(n) => &**n == name,
            Element::Combine(hs) => hs.iter().any(|h| h.contains(name)),
        })
    }

    pub fn emit(&self) -> Trace {
        Trace::Tuple(
            self.elements
                .iter()
                .map(|e| match e {
                    Element::Name(n) => Trace::Name(n.to_string()),
                    Element::Combine(hs) => Trace::Tuple(hs.iter().map(History::emit).collect()),
                })
                .collect(),
        )
    }
}

impl Trace {
    pub fn name(n: &str) -> Trace {
        Trace::Name(n.to_string())
    }

    pub fn tuple(items: Vec<Trace>) -> Trace {
        Trace::Tuple(items)
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trace::Name(n) => write!(f, "{}", n),
            Trace::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.emit().fmt(f)
    }
}

impl Serialize for Trace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Trace::Name(n) => serializer.serialize_str(n),
            Trace::Tuple(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl Serialize for History {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.emit().serialize(serializer)
    }
}
