//! Chat prompt formatting with GPT4All style templates.
//!
//! Templates use `%1` for the user text and `%2` for the assistant reply.

use serde_json::{Map, Value};
use std::path::Path;

use crate::catalog::ModelEntry;

pub const DEFAULT_PROMPT_TEMPLATE: &str = "### Human:\n%1\n\n### Assistant:\n";

const USER_SLOT: &str = "%1";
const REPLY_SLOT: &str = "%2";

/// Everything known about a loaded model: the catalogue entry (if any) plus
/// the prompt settings in effect.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub name: String,
    pub filename: String,
    pub model_type: String,
    pub system_prompt: String,
    pub prompt_template: String,
    entry: Map<String, Value>,
}

impl ModelConfig {
    pub fn new(model_path: &Path, entry: Option<&ModelEntry>) -> Self {
        let filename = model_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_path.display().to_string());

        let mut map = entry.map(|e| e.0.clone()).unwrap_or_default();
        let name = entry
            .and_then(ModelEntry::name)
            .unwrap_or(&filename)
            .to_string();
        let model_type = entry
            .and_then(ModelEntry::model_type)
            .unwrap_or("gguf")
            .to_string();
        let system_prompt = entry
            .and_then(ModelEntry::system_prompt)
            .unwrap_or_default()
            .to_string();
        let prompt_template = entry
            .and_then(ModelEntry::prompt_template)
            .unwrap_or(DEFAULT_PROMPT_TEMPLATE)
            .to_string();

        map.insert("name".into(), Value::String(name.clone()));
        map.insert("filename".into(), Value::String(filename.clone()));
        map.insert("type".into(), Value::String(model_type.clone()));
        map.insert("systemPrompt".into(), Value::String(system_prompt.clone()));
        map.insert("promptTemplate".into(), Value::String(prompt_template.clone()));
        map.insert(
            "path".into(),
            Value::String(model_path.display().to_string()),
        );

        Self {
            name,
            filename,
            model_type,
            system_prompt,
            prompt_template,
            entry: map,
        }
    }

    /// All config keys in sorted order with their values.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entry.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// `<type> - <name> (<filename>)`
    pub fn summary(&self) -> String {
        format!("{} - {} ({})", self.model_type, self.name, self.filename)
    }
}

/// One completed question/answer pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

fn render_turn(template: &str, user: &str, reply: Option<&str>) -> String {
    // split before filling so a `%2` typed by the user stays text
    let (head, tail) = match template.split_once(REPLY_SLOT) {
        Some((head, tail)) => (head, Some(tail)),
        None => (template, None),
    };
    let mut out = head.replace(USER_SLOT, user);
    match (reply, tail) {
        (None, _) => {}
        (Some(reply), Some(tail)) => {
            out.push_str(reply);
            out.push_str(tail);
        }
        (Some(reply), None) => {
            out.push_str(reply);
            out.push('\n');
        }
    }
    out
}

/// Render system prompt, past exchanges and the new user turn, ready to be
/// continued by the model.
pub fn render_conversation(config: &ModelConfig, history: &[Exchange], prompt: &str) -> String {
    let mut out = config.system_prompt.clone();
    for exchange in history {
        out.push_str(&render_turn(
            &config.prompt_template,
            &exchange.user,
            Some(&exchange.assistant),
        ));
    }
    out.push_str(&render_turn(&config.prompt_template, prompt, None));
    out
}
