// JSON-lines dump of selected payload fields

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, NodeError};
use crate::node::{Context, HandlerResult, Node, Outcome};
use crate::payload::{Action, Payload};
use crate::plugins::{bad_kwargs, kwargs};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JsonOutputConfig {
    /// Output path; `{name}` and `{burst_id}` are substituted
    pub filename: String,
    /// Key paths to write; empty writes every field
    pub fields: Vec<String>,
    /// Actions that produce a line: "alert" and/or "report"
    pub on: Vec<String>,
}

impl Default for JsonOutputConfig {
    fn default() -> Self {
        JsonOutputConfig {
            filename: "{name}.jsonl".to_string(),
            fields: Vec::new(),
            on: vec!["alert".to_string(), "report".to_string()],
        }
    }
}

pub struct JsonOutput {
    name: String,
    filename: String,
    fields: Vec<String>,
    on: Vec<Action>,
}

impl JsonOutput {
    pub fn create(name: &str, args: &serde_json::Value, _ctx: &mut Context) -> Result<Box<dyn Node>, ConfigError> {
        let cfg: JsonOutputConfig = kwargs(name, args)?;
        if cfg.filename.is_empty() {
            return Err(bad_kwargs(name, "filename is empty"));
        }
        let mut on = Vec::with_capacity(cfg.on.len());
        for text in &cfg.on {
            match text.parse::<Action>() {
                Ok(a @ (Action::Alert | Action::Report)) => on.push(a),
                _ => return Err(bad_kwargs(name, format!("cannot write on '{}'", text))),
            }
        }
        Ok(Box::new(JsonOutput {
            name: name.to_string(),
            filename: cfg.filename,
            fields: cfg.fields,
            on,
        }))
    }

    fn path(&self, payload: &Payload) -> PathBuf {
        let burst = match payload.get("burst_id").and_then(|v| v.as_i64()) {
            Some(id) => id.to_string(),
            None => "none".to_string(),
        };
        PathBuf::from(
            self.filename
                .replace("{name}", &self.name)
                .replace("{burst_id}", &burst),
        )
    }

    fn record(&self, payload: &Payload) -> Result<serde_json::Value, NodeError> {
        let mut out = serde_json::Map::new();
        if let Some(action) = payload.action {
            out.insert("action".to_string(), action.as_str().into());
        }
        out.insert("history".to_string(), to_json(&payload.history)?);
        if let Some(burst_id) = payload.get("burst_id") {
            out.insert("burst_id".to_string(), to_json(burst_id)?);
        }
        if self.fields.is_empty() {
            for (k, v) in &payload.fields {
                out.insert(k.clone(), to_json(v)?);
            }
        } else {
            for field in &self.fields {
                if let Some(v) = payload.get(field) {
                    out.insert(field.clone(), to_json(v)?);
                }
            }
        }
        Ok(serde_json::Value::Object(out))
    }

    fn write(&self, payload: &Payload) -> HandlerResult {
        let action = payload.action.ok_or_else(|| NodeError::schema("payload has no action"))?;
        if !self.on.contains(&action) {
            return Ok(Outcome::Forward);
        }
        let record = self.record(payload)?;
        let path = self.path(payload);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", record)?;
        debug!(path = %path.display(), "wrote json record");
        Ok(Outcome::Forward)
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<serde_json::Value, NodeError> {
    serde_json::to_value(value).map_err(|e| NodeError::schema(format!("cannot serialize: {}", e)))
}

impl Node for JsonOutput {
    fn alert(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        self.write(payload)
    }

    fn report(&mut self, payload: &mut Payload, _ctx: &mut Context) -> HandlerResult {
        self.write(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSpec;
    use crate::dag::{build, tests::sink_registry};
    use serde_json::json;

    fn lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_selected_fields_per_burst() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("{name}-{burst_id}.jsonl");
        let (registry, seen) = sink_registry();
        let specs = vec![
            NodeSpec::new("Pass", "In"),
            NodeSpec::new("JsonOutput", "Out")
                .kwargs(json!({"filename": pattern.to_str().unwrap(), "fields": ["dt", "map"]}))
                .observe(&["In"]),
            NodeSpec::new("Sink", "P").observe(&["Out"]),
        ];
        let mut dag = build(&specs, &registry, Context::default()).unwrap();
        for burst in [0i64, 0, 1] {
            let p = Payload::new(Action::Alert)
                .with("burst_id", burst)
                .with("dt", 0.25)
                .with("map", vec![1.0, 2.0])
                .with("ignored", "x");
            dag.update("In", p).unwrap();
        }
        dag.update("In", Payload::new(Action::Revoke).with("burst_id", 1i64)).unwrap();
        assert_eq!(seen.borrow().len(), 4);

        let first = lines(&dir.path().join("Out-0.jsonl"));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0]["action"], "alert");
        assert_eq!(first[0]["burst_id"], 0);
        assert_eq!(first[0]["dt"], 0.25);
        assert_eq!(first[0]["map"], json!([1.0, 2.0]));
        assert!(first[0].get("ignored").is_none());
        assert_eq!(first[0]["history"], json!(["In"]));

        // revokes are not written
        assert_eq!(lines(&dir.path().join("Out-1.jsonl")).len(), 1);
    }

    #[test]
    fn test_report_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut ctx = Context::default();
        let args = json!({"filename": path.to_str().unwrap(), "on": ["report"]});
        let mut node = JsonOutput::create("J", &args, &mut ctx).unwrap();
        let mut alert = Payload::new(Action::Alert).with("x", 1i64);
        assert_eq!(node.alert(&mut alert, &mut ctx).unwrap(), Outcome::Forward);
        assert!(!path.exists());
        let mut report = Payload::new(Action::Report).with("x", 2i64);
        node.report(&mut report, &mut ctx).unwrap();
        let got = lines(&path);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["x"], 2);
    }

    #[test]
    fn test_unwritable_path_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.jsonl");
        let mut ctx = Context::default();
        let mut node = JsonOutput::create("J", &json!({"filename": path.to_str().unwrap()}), &mut ctx).unwrap();
        let mut p = Payload::new(Action::Alert);
        assert!(matches!(node.alert(&mut p, &mut ctx), Err(NodeError::Io(_))));
        assert!(JsonOutput::create("J", &json!({"on": ["revoke"]}), &mut ctx).is_err());
    }
}
