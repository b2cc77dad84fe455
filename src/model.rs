use anyhow::{Context, Result};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::cmp::min;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::catalog::{self, ModelEntry};
use crate::cli::ModelSource;
use crate::llm;
use crate::prompt::ModelConfig;
use crate::session::{ChatSession, DynChatSession};

const DOWNLOAD_BASE_URL: &str = "https://gpt4all.io/models/gguf/";

/// Turns a model name into a ready chat session.
#[derive(Debug, Clone)]
pub struct ModelLoader {
    pub source: ModelSource,
    pub context_size: u32,
    pub threads: u32,
}

impl ModelLoader {
    pub async fn load(&self, model_name: &str) -> Result<DynChatSession> {
        let entries =
            catalog::fetch_catalog_or_empty(&self.source.catalog_url, self.source.allow_download())
                .await;
        let model_path = resolve_model(
            model_name,
            &self.source.model_dir,
            &entries,
            self.source.allow_download(),
        )
        .await?;

        let file_name = model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let config = ModelConfig::new(&model_path, catalog::find(&entries, &file_name));

        // Loading weights is blocking work
        let (context_size, threads) = (self.context_size, self.threads);
        let generator = tokio::task::spawn_blocking(move || {
            llm::load_generator(&model_path, context_size, threads)
        })
        .await
        .context("Model loading task failed")??;

        Ok(ChatSession::new(generator, config))
    }
}

/// Resolves the model path and ensures it exists
///
/// `model_name` may be a path to a GGUF file or a file name from the
/// catalogue. Known names are looked up in `model_dir` and downloaded there
/// when missing (unless `allow_download` is off).
pub async fn resolve_model(
    model_name: &str,
    model_dir: &Path,
    catalog: &[ModelEntry],
    allow_download: bool,
) -> Result<PathBuf> {
    let direct = PathBuf::from(model_name);
    if direct.is_file() {
        tracing::info!("using local model {}", direct.display());
        return Ok(direct);
    }

    let model_path = model_dir.join(model_name);
    if model_path.is_file() {
        tracing::info!("model found at {}", model_path.display());
        return Ok(model_path);
    }

    if !allow_download {
        anyhow::bail!(
            "Model file not found: {} (downloads are disabled)",
            model_path.display()
        );
    }

    let url = download_url(model_name, catalog);
    println!("Model not found locally");
    println!("Downloading from: {}", url);

    std::fs::create_dir_all(model_dir)
        .with_context(|| format!("Failed to create directory: {}", model_dir.display()))?;

    download_model(&url, &model_path).await?;
    Ok(model_path)
}

/// Catalogue URL for the model, or the default GPT4All download location.
pub fn download_url(model_name: &str, catalog: &[ModelEntry]) -> String {
    catalog::find(catalog, model_name)
        .and_then(ModelEntry::url)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{DOWNLOAD_BASE_URL}{model_name}"))
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Downloads a model from a URL with progress bar
async fn download_model(url: &str, destination: &Path) -> Result<()> {
    let client = reqwest::Client::new();

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to download model: HTTP {}", response.status());
    }

    let total_size = response.content_length().unwrap_or(0);
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );
    pb.set_message(format!("Downloading {file_name}"));

    // Partial downloads never shadow a complete model file
    let part = partial_path(destination);
    let mut file = File::create(&part)
        .with_context(|| format!("Failed to create file: {}", part.display()))?;

    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Failed to read chunk")?;
        file.write_all(&chunk).context("Failed to write to file")?;

        downloaded += chunk.len() as u64;
        pb.set_position(if total_size > 0 { min(downloaded, total_size) } else { downloaded });
    }
    file.flush().context("Failed to write to file")?;
    drop(file);

    std::fs::rename(&part, destination)
        .with_context(|| format!("Failed to move download to {}", destination.display()))?;

    pb.finish_with_message(format!("Downloaded {file_name}"));
    tracing::info!(bytes = downloaded, "model downloaded to {}", destination.display());

    Ok(())
}
