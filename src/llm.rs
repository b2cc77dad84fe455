use anyhow::{Context, Result};
use encoding_rs::CoderResult;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::session::{GenerateParams, TokenGenerator, TokenSink};

/// llama.cpp can only be initialised once per process; every room shares it.
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend> {
    BACKEND
        .get_or_try_init(LlamaBackend::init)
        .context("Failed to initialize llama.cpp backend")
}

/// Loaded model weights. Contexts are created per generation so the model can
/// be shared without self-referential structs.
pub struct LLMSetup {
    backend: &'static LlamaBackend,
    model: LlamaModel,
}

impl LLMSetup {
    /// Initialize the LLM backend and load the model
    pub fn new(model_path: &Path) -> Result<Self> {
        let backend = backend()?;

        // CPU only, mmap is enabled by default in llama.cpp
        let model_params = LlamaModelParams::default()
            .with_n_gpu_layers(0)
            .with_use_mlock(false);

        tracing::info!("loading model from {}", model_path.display());
        let model = LlamaModel::load_from_file(backend, model_path, &model_params)
            .with_context(|| format!("Failed to load model: {}", model_path.display()))?;
        tracing::info!("model loaded");

        Ok(Self { backend, model })
    }

    /// Tokenize text into tokens
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<LlamaToken>> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        self.model
            .str_to_token(text, add_bos)
            .context("Failed to tokenize text")
    }
}

/// Streams completions from a loaded model.
pub struct LlamaGenerator {
    setup: Arc<LLMSetup>,
    context_size: u32,
    threads: u32,
}

impl LlamaGenerator {
    pub fn new(setup: Arc<LLMSetup>, context_size: u32, threads: u32) -> Self {
        Self {
            setup,
            context_size,
            threads,
        }
    }
}

impl TokenGenerator for LlamaGenerator {
    fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(self.setup.tokenize(text, true)?.len())
    }

    fn context_size(&self) -> usize {
        self.context_size as usize
    }

    fn thread_count(&self) -> usize {
        self.threads as usize
    }

    fn complete(
        &mut self,
        prompt: &str,
        params: &GenerateParams,
        on_token: &mut TokenSink<'_>,
    ) -> Result<String> {
        let model = &self.setup.model;
        let n_ctx = NonZeroU32::new(self.context_size).context("Context size must be non-zero")?;
        let threads = self.threads as i32;
        let context_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let mut context = model
            .new_context(self.setup.backend, context_params)
            .context("Failed to create context")?;

        let prompt_tokens = self.setup.tokenize(prompt, true)?;
        if prompt_tokens.is_empty() {
            return Ok(String::new());
        }

        let mut batch = LlamaBatch::new(prompt_tokens.len().max(1), 1);
        let last_index = prompt_tokens.len() as i32 - 1;
        for (i, token) in (0_i32..).zip(prompt_tokens.iter()) {
            // Only compute logits for the last token
            batch.add(*token, i, &[0], i == last_index)?;
        }
        context
            .decode(&mut batch)
            .context("Failed to decode prompt")?;

        let mut sampler = build_sampler(params);
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut output = String::new();
        let mut n_cur = batch.n_tokens();

        for _ in 0..params.max_tokens {
            let token = sampler.sample(&context, batch.n_tokens() - 1);
            sampler.accept(token);

            if model.is_eog_token(token) {
                break;
            }

            let bytes = model
                .token_to_bytes(token, Special::Tokenize)
                .context("Failed to decode token")?;
            let capacity = decoder.max_utf8_buffer_length(bytes.len()).unwrap_or(32);
            let mut piece = String::with_capacity(capacity);
            let (result, _, _) = decoder.decode_to_string(&bytes, &mut piece, false);
            debug_assert_eq!(result, CoderResult::InputEmpty);

            if !piece.is_empty() {
                if on_token(&piece).is_break() {
                    tracing::debug!("generation stopped by caller");
                    break;
                }
                output.push_str(&piece);
            }

            batch.clear();
            batch.add(token, n_cur, &[0], true)?;
            n_cur += 1;
            context.decode(&mut batch).context("Failed to decode token")?;
        }

        Ok(output)
    }
}

fn build_sampler(params: &GenerateParams) -> LlamaSampler {
    if params.temperature <= 0.0 {
        return LlamaSampler::greedy();
    }
    LlamaSampler::chain_simple([
        LlamaSampler::temp(params.temperature),
        LlamaSampler::dist(time_seed()),
    ])
}

fn time_seed() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_nanos() & 0xFFFF_FFFF) as u32
}

/// Load a model and wrap it as a boxed generator.
pub fn load_generator(
    model_path: &Path,
    context_size: u32,
    threads: u32,
) -> Result<Box<dyn TokenGenerator>> {
    let setup = Arc::new(LLMSetup::new(model_path)?);
    Ok(Box::new(LlamaGenerator::new(setup, context_size, threads)))
}
