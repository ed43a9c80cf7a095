use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::payload::Payload;

/// SNEWS pointing and timing pipeline
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// JSON list of node specifications
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// JSON list of root messages to inject
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Detector CSV (name, lon, lat, height, sigma, bias). May be repeated.
    #[arg(long, value_name = "CSV")]
    pub detectors: Vec<PathBuf>,

    /// Repeat the input as this many Monte-Carlo bursts, then report
    #[arg(long, value_name = "N")]
    pub trials: Option<u64>,

    /// First burst_id in trial mode
    #[arg(long, value_name = "ID", default_value_t = 0)]
    pub first_burst: u64,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

/// One entry of the node configuration list. `class` and `name` are
/// optional here so that their absence is reported with the entry index.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub class: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub kwargs: serde_json::Value,
    #[serde(default)]
    pub observe: Vec<String>,
}

impl NodeSpec {
    pub fn new(class: &str, name: &str) -> Self {
        NodeSpec {
            class: Some(class.to_string()),
            name: Some(name.to_string()),
            ..NodeSpec::default()
        }
    }

    pub fn kwargs(mut self, kwargs: serde_json::Value) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn observe(mut self, sources: &[&str]) -> Self {
        self.observe = sources.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// CSV reader shared by the detector and pair tables: no header row, `#`
/// comments, trimmed cells, rows may carry optional trailing columns.
pub fn csv_reader<R: std::io::Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input)
}

/// Source line of a CSV error, 0 if unknown.
pub fn csv_line(err: &csv::Error) -> usize {
    err.position().map_or(0, |p| p.line() as usize)
}

fn read_json(path: &Path) -> Result<serde_json::Value, ConfigError> {
    let shown = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: shown.clone(),
        source: e,
    })?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
        path: shown,
        reason: e.to_string(),
    })
}

/// Parse node specifications from JSON text.
pub fn parse_node_specs(text: &str, path: &str) -> Result<Vec<NodeSpec>, ConfigError> {
    serde_json::from_str(text).map_err(|e| ConfigError::Parse {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

pub fn load_node_specs(path: &Path) -> Result<Vec<NodeSpec>, ConfigError> {
    let shown = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: shown.clone(),
        source: e,
    })?;
    parse_node_specs(&text, &shown)
}

/// Load root messages. Each must be an object naming its destination node
/// and carrying a known action.
pub fn load_messages(path: &Path) -> Result<Vec<Payload>, ConfigError> {
    let shown = path.display().to_string();
    let json = read_json(path)?;
    messages_from_json(&json, &shown)
}

pub fn messages_from_json(json: &serde_json::Value, path: &str) -> Result<Vec<Payload>, ConfigError> {
    let list = json.as_array().ok_or_else(|| ConfigError::Parse {
        path: path.to_string(),
        reason: "expected a list of messages".to_string(),
    })?;
    list.iter()
        .enumerate()
        .map(|(i, m)| {
            let payload = Payload::from_json(m).ok_or_else(|| ConfigError::Parse {
                path: path.to_string(),
                reason: format!("message #{} is not an object", i),
            })?;
            if payload.name.is_none() || payload.action.is_none() {
                return Err(ConfigError::Parse {
                    path: path.to_string(),
                    reason: format!("message #{} needs 'name' and a valid 'action'", i),
                });
            }
            Ok(payload)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Action;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_node_specs() {
        let specs = parse_node_specs(
            r#"[{"class": "Pass", "name": "A"},
                {"class": "NthTimeDiff", "name": "D", "kwargs": {"n": 1}, "observe": ["A"]},
                {"name": "X"}]"#,
            "cfg",
        )
        .unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[1].observe, vec!["A".to_string()]);
        assert_eq!(specs[1].kwargs["n"], 1);
        assert!(specs[2].class.is_none());
        assert!(specs[0].kwargs.is_null());
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        assert!(matches!(parse_node_specs("[{", "cfg"), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_messages() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "A", "action": "alert", "times": [0.1]}}, {{"name": "A", "action": "report"}}]"#).unwrap();
        let msgs = load_messages(file.path()).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].action, Some(Action::Report));
    }

    #[test]
    fn test_message_without_action_rejected() {
        let err = messages_from_json(&json!([{"name": "A"}]), "in").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(matches!(
            load_messages(Path::new("/nonexistent/input.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_cli() {
        let config = Config::try_parse_from(["snewpdag", "cfg.json", "in.json", "--detectors", "a.csv", "--detectors", "b.csv", "-v"]).unwrap();
        assert_eq!(config.detectors.len(), 2);
        assert!(config.verbose);
        assert_eq!(config.trials, None);
        assert_eq!(config.first_burst, 0);

        let config = Config::try_parse_from(["snewpdag", "cfg.json", "in.json", "--trials", "5", "--first-burst", "100"]).unwrap();
        assert_eq!(config.trials, Some(5));
        assert_eq!(config.first_burst, 100);
        assert!(Config::try_parse_from(["snewpdag", "cfg.json", "in.json", "--seed", "1"]).is_err());
    }
}
