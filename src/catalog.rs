use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::table::Table;

pub const DEFAULT_CATALOG_URL: &str = "https://gpt4all.io/models/models3.json";

/// Keys not shown in the model list.
const SKIP_KEYS: &[&str] = &["order", "url", "md5sum", "name"];

/// One model of the GPT4All catalogue.
///
/// The catalogue schema changes over time, so all fields are kept and only the
/// ones this tool needs get accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelEntry(pub Map<String, Value>);

impl ModelEntry {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    pub fn filename(&self) -> Option<&str> {
        self.get_str("filename")
    }

    pub fn url(&self) -> Option<&str> {
        self.get_str("url")
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.get_str("systemPrompt")
    }

    pub fn prompt_template(&self) -> Option<&str> {
        self.get_str("promptTemplate")
    }

    pub fn model_type(&self) -> Option<&str> {
        self.get_str("type")
    }

    /// Value rendered for a table cell: strings as-is, everything else as JSON.
    pub fn display_value(&self, key: &str) -> String {
        match self.0.get(key) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

pub fn parse_catalog(json: &str) -> Result<Vec<ModelEntry>> {
    serde_json::from_str(json).context("Failed to parse model catalogue")
}

/// Download and parse the model catalogue.
pub async fn fetch_catalog(url: &str) -> Result<Vec<ModelEntry>> {
    tracing::info!(url, "fetching model catalogue");
    let response = reqwest::get(url)
        .await
        .context("Failed to request model catalogue")?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to fetch model catalogue: HTTP {}", response.status());
    }

    let body = response
        .text()
        .await
        .context("Failed to read model catalogue")?;
    let entries = parse_catalog(&body)?;
    tracing::debug!(count = entries.len(), "model catalogue loaded");
    Ok(entries)
}

/// Fetch the catalogue, or an empty one when downloads are off or the fetch fails.
pub async fn fetch_catalog_or_empty(url: &str, allow_download: bool) -> Vec<ModelEntry> {
    if !allow_download {
        return Vec::new();
    }
    match fetch_catalog(url).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!("model catalogue unavailable, using defaults: {err:#}");
            Vec::new()
        }
    }
}

pub fn find<'a>(entries: &'a [ModelEntry], filename: &str) -> Option<&'a ModelEntry> {
    entries.iter().find(|e| e.filename() == Some(filename))
}

/// Build the "GPT4All Models" table. Columns come from the first entry.
pub fn models_table(entries: &[ModelEntry]) -> Table {
    let mut table = Table::new("GPT4All Models");
    let Some(first) = entries.first() else {
        return table;
    };

    let keys: BTreeSet<&str> = first
        .0
        .keys()
        .map(String::as_str)
        .filter(|k| !SKIP_KEYS.contains(k))
        .collect();

    for key in &keys {
        table.add_column(*key);
    }
    for entry in entries {
        table.add_row(keys.iter().map(|k| entry.display_value(k)));
    }
    table
}

/// `list-models`: fetch behind a spinner, then print the table.
pub async fn list_models(url: &str) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.set_message("Fetch...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let entries = fetch_catalog(url).await;
    spinner.finish_and_clear();

    println!("{}", models_table(&entries?));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
      {
        "order": "a",
        "md5sum": "f692417a22405d80573ac10cb0cd6c6a",
        "name": "Mistral OpenOrca",
        "filename": "mistral-7b-openorca.Q4_0.gguf",
        "filesize": "4108928128",
        "requires": "2.5.0",
        "ramrequired": "8",
        "parameters": "7 billion",
        "quant": "q4_0",
        "type": "Mistral",
        "systemPrompt": "<|im_start|>system\nYou are MistralOrca.<|im_end|>\n",
        "promptTemplate": "<|im_start|>user\n%1<|im_end|>\n<|im_start|>assistant\n%2<|im_end|>\n",
        "url": "https://gpt4all.io/models/gguf/mistral-7b-openorca.Q4_0.gguf"
      },
      {
        "order": "b",
        "name": "Mini Orca (Small)",
        "filename": "orca-mini-3b-gguf2-q4_0.gguf",
        "filesize": 1979946720,
        "ramrequired": "4",
        "parameters": "3 billion",
        "quant": "q4_0",
        "type": "OpenLLaMa"
      }
    ]"#;

    #[test]
    fn accessors() {
        let entries = parse_catalog(SAMPLE).unwrap();
        assert_eq!(entries.len(), 2);
        let mistral = find(&entries, "mistral-7b-openorca.Q4_0.gguf").unwrap();
        assert_eq!(mistral.name(), Some("Mistral OpenOrca"));
        assert_eq!(mistral.model_type(), Some("Mistral"));
        assert!(mistral.prompt_template().unwrap().contains("%1"));
        assert!(mistral.url().unwrap().ends_with(".gguf"));
        assert!(find(&entries, "nope.gguf").is_none());
        assert_eq!(entries[1].system_prompt(), None);
    }

    #[test]
    fn table_columns_are_sorted_and_skip_internal_keys() {
        let entries = parse_catalog(SAMPLE).unwrap();
        let table = models_table(&entries);
        assert_eq!(
            table.columns(),
            [
                "filename",
                "filesize",
                "parameters",
                "promptTemplate",
                "quant",
                "ramrequired",
                "requires",
                "systemPrompt",
                "type"
            ]
        );
        assert_eq!(table.rows().len(), 2);

        let second = &table.rows()[1];
        assert_eq!(second[0], "orca-mini-3b-gguf2-q4_0.gguf");
        // numbers are shown as JSON, missing keys stay empty
        assert_eq!(second[1], "1979946720");
        assert_eq!(second[6], "");
    }

    #[test]
    fn empty_catalogue_has_no_columns() {
        let table = models_table(&[]);
        assert!(table.columns().is_empty());
        assert_eq!(table.to_string(), "GPT4All Models\n");
    }

    #[test]
    fn rejects_non_array() {
        assert!(parse_catalog(r#"{"name": "x"}"#).is_err());
    }
}
