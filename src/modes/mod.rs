//! Mode profiles
//!
//! A mode restricts the observation vocabulary (types and concepts) and
//! carries the prompt templates the agent sends to its provider. Profiles
//! are JSON files under `<data_dir>/modes/`; a built-in default is compiled
//! in so a bare install works without any files.
//!
//! Single-level inheritance: a mode id of the form `parent--override`
//! loads `parent.json`, then deep-merges `parent--override.json` over it
//! (objects merge recursively, any other value replaces).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Prompt templates used by the agent loop. `{placeholders}` are filled by
/// `agent::prompts`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModePrompts {
    #[serde(default)]
    pub init: String,
    #[serde(default)]
    pub observation: String,
    #[serde(default)]
    pub summary: String,
}

/// One allowed observation type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationType {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub work_emoji: String,
}

/// One allowed concept tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationConcept {
    pub id: String,
    pub label: String,
}

/// A resolved mode profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mode {
    pub name: String,
    #[serde(default)]
    pub prompts: ModePrompts,
    #[serde(default)]
    pub observation_types: Vec<ObservationType>,
    #[serde(default)]
    pub observation_concepts: Vec<ObservationConcept>,
}

/// Built-in profile used when no file overrides it.
const DEFAULT_MODE_JSON: &str = r#"{
  "name": "default",
  "prompts": {
    "init": "You are a memory agent observing a developer-assistant session in project {project}. Distill each tool event into observations.",
    "observation": "Tool: {tool_name}\nInput: {tool_input}\nResult: {tool_response}\n\nEmit zero or more <observation> blocks describing what was learned.",
    "summary": "The session is wrapping up. Last assistant message:\n{last_assistant_message}\n\nEmit one <summary> block covering request, investigated, learned, completed and next steps."
  },
  "observation_types": [
    { "id": "discovery", "label": "Discovery", "emoji": "🔍", "work_emoji": "📖" },
    { "id": "decision", "label": "Decision", "emoji": "🧭", "work_emoji": "⚖️" },
    { "id": "bugfix", "label": "Bugfix", "emoji": "🐛", "work_emoji": "🔧" },
    { "id": "feature", "label": "Feature", "emoji": "✨", "work_emoji": "🛠️" },
    { "id": "refactor", "label": "Refactor", "emoji": "♻️", "work_emoji": "🧹" },
    { "id": "change", "label": "Change", "emoji": "📝", "work_emoji": "✏️" }
  ],
  "observation_concepts": [
    { "id": "architecture", "label": "Architecture" },
    { "id": "testing", "label": "Testing" },
    { "id": "performance", "label": "Performance" },
    { "id": "security", "label": "Security" },
    { "id": "tooling", "label": "Tooling" },
    { "id": "data-model", "label": "Data model" },
    { "id": "workflow", "label": "Workflow" }
  ]
}"#;

impl Mode {
    /// Load a mode by id. `parent--override` performs the single-level
    /// merge; a plain id loads one file or the built-in default.
    pub fn load(modes_dir: &Path, mode_id: &str) -> anyhow::Result<Self> {
        let value = match mode_id.split_once("--") {
            Some((parent, _)) => {
                let base = load_value(modes_dir, parent)?;
                let overlay = load_value(modes_dir, mode_id)?;
                deep_merge(base, overlay)
            }
            None => load_value(modes_dir, mode_id)?,
        };
        let mode: Mode = serde_json::from_value(value)
            .map_err(|e| anyhow::anyhow!("invalid mode profile {:?}: {}", mode_id, e))?;
        if mode.observation_types.is_empty() {
            anyhow::bail!("mode {:?} defines no observation types", mode_id);
        }
        Ok(mode)
    }

    /// The built-in default profile.
    pub fn builtin() -> Self {
        serde_json::from_str(DEFAULT_MODE_JSON).expect("built-in mode profile parses")
    }

    pub fn type_ids(&self) -> Vec<String> {
        self.observation_types.iter().map(|t| t.id.clone()).collect()
    }

    pub fn concept_ids(&self) -> Vec<String> {
        self.observation_concepts.iter().map(|c| c.id.clone()).collect()
    }

    /// The type unknown provider output maps to.
    pub fn default_type(&self) -> &str {
        self.observation_types
            .first()
            .map(|t| t.id.as_str())
            .unwrap_or("discovery")
    }

    /// Validate a provider-reported type against the vocabulary, mapping
    /// unknowns to the default.
    pub fn resolve_type<'a>(&'a self, raw: &'a str) -> &'a str {
        if self.observation_types.iter().any(|t| t.id == raw) {
            raw
        } else {
            self.default_type()
        }
    }

    /// Emoji pair for a type, used by the composer's legend.
    pub fn type_display(&self, type_id: &str) -> Option<&ObservationType> {
        self.observation_types.iter().find(|t| t.id == type_id)
    }
}

/// Load one profile file, or the built-in JSON for the `default` id.
fn load_value(modes_dir: &Path, mode_id: &str) -> anyhow::Result<Value> {
    let path = modes_dir.join(format!("{mode_id}.json"));
    if path.exists() {
        let contents = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("invalid JSON in {}: {}", path.display(), e))?)
    } else if mode_id == "default" {
        Ok(serde_json::from_str(DEFAULT_MODE_JSON).expect("built-in mode"))
    } else {
        anyhow::bail!("mode profile not found: {}", path.display())
    }
}

/// Recursive object merge; non-object overlay values replace base values.
fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}
