use anyhow::Result;
use std::ops::ControlFlow;

use crate::prompt::{Exchange, ModelConfig, render_conversation};

/// Per-request generation settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GenerateParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerateParams {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Called for every generated text piece. `Break` stops generation and the
/// piece is not part of the reply.
pub type TokenSink<'a> = dyn FnMut(&str) -> ControlFlow<()> + 'a;

/// The seam to the inference runtime.
pub trait TokenGenerator: Send {
    fn count_tokens(&self, text: &str) -> Result<usize>;

    fn context_size(&self) -> usize;

    fn thread_count(&self) -> usize;

    /// Continue `prompt`, streaming pieces to `on_token`; returns the full text.
    fn complete(
        &mut self,
        prompt: &str,
        params: &GenerateParams,
        on_token: &mut TokenSink<'_>,
    ) -> Result<String>;
}

impl<G: TokenGenerator + ?Sized> TokenGenerator for Box<G> {
    fn count_tokens(&self, text: &str) -> Result<usize> {
        (**self).count_tokens(text)
    }

    fn context_size(&self) -> usize {
        (**self).context_size()
    }

    fn thread_count(&self) -> usize {
        (**self).thread_count()
    }

    fn complete(
        &mut self,
        prompt: &str,
        params: &GenerateParams,
        on_token: &mut TokenSink<'_>,
    ) -> Result<String> {
        (**self).complete(prompt, params, on_token)
    }
}

/// A conversation with one model. The history is re-rendered with the model's
/// prompt template on every turn; the oldest exchanges are dropped once the
/// context window would overflow.
pub struct ChatSession<G> {
    generator: G,
    config: ModelConfig,
    history: Vec<Exchange>,
}

pub type DynChatSession = ChatSession<Box<dyn TokenGenerator>>;

impl<G: TokenGenerator> ChatSession<G> {
    pub fn new(generator: G, config: ModelConfig) -> Self {
        Self {
            generator,
            config,
            history: Vec::new(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn thread_count(&self) -> usize {
        self.generator.thread_count()
    }

    pub fn history(&self) -> &[Exchange] {
        &self.history
    }

    pub fn generate(
        &mut self,
        prompt: &str,
        params: &GenerateParams,
        on_token: &mut TokenSink<'_>,
    ) -> Result<String> {
        let rendered = self.fit_to_context(prompt, params)?;
        let reply = self.generator.complete(&rendered, params, on_token)?;

        self.history.push(Exchange {
            user: prompt.to_string(),
            assistant: reply.clone(),
        });
        Ok(reply)
    }

    fn fit_to_context(&mut self, prompt: &str, params: &GenerateParams) -> Result<String> {
        let budget = self.generator.context_size();
        loop {
            let rendered = render_conversation(&self.config, &self.history, prompt);
            let needed = self.generator.count_tokens(&rendered)? + params.max_tokens as usize;
            if needed <= budget {
                return Ok(rendered);
            }
            if self.history.is_empty() {
                anyhow::bail!(
                    "Prompt needs {} tokens including the answer, but the context window holds {}. Use a shorter prompt or increase --context-size.",
                    needed,
                    budget
                );
            }
            tracing::debug!(needed, budget, "dropping oldest exchange from chat history");
            self.history.remove(0);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Generator that answers with scripted words, one token per word.
    pub struct ScriptedGenerator {
        pub replies: Vec<String>,
        pub context_size: usize,
        pub prompts: Arc<Mutex<Vec<String>>>,
        /// Stream the reply, then fail like a broken decode.
        pub fail: bool,
    }

    impl ScriptedGenerator {
        pub fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_string()).collect(),
                context_size: 4096,
                prompts: Arc::default(),
                fail: false,
            }
        }
    }

    impl TokenGenerator for ScriptedGenerator {
        fn count_tokens(&self, text: &str) -> Result<usize> {
            Ok(text.split_whitespace().count())
        }

        fn context_size(&self) -> usize {
            self.context_size
        }

        fn thread_count(&self) -> usize {
            2
        }

        fn complete(
            &mut self,
            prompt: &str,
            params: &GenerateParams,
            on_token: &mut TokenSink<'_>,
        ) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let reply = if self.replies.is_empty() {
                String::new()
            } else {
                self.replies.remove(0)
            };

            let mut out = String::new();
            for (i, word) in reply.split_inclusive(' ').enumerate() {
                if i >= params.max_tokens as usize {
                    break;
                }
                if on_token(word).is_break() {
                    break;
                }
                out.push_str(word);
            }
            if self.fail {
                anyhow::bail!("Failed to decode token");
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedGenerator;
    use super::*;
    use std::path::PathBuf;

    fn config() -> ModelConfig {
        ModelConfig::new(&PathBuf::from("test.gguf"), None)
    }

    #[test]
    fn streams_and_records_history() {
        let mut session = ChatSession::new(ScriptedGenerator::new(&["Hello there friend"]), config());
        let mut seen = Vec::new();
        let reply = session
            .generate("Hi", &GenerateParams::new(100), &mut |t| {
                seen.push(t.to_string());
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(reply, "Hello there friend");
        assert_eq!(seen, ["Hello ", "there ", "friend"]);
        assert_eq!(
            session.history(),
            [Exchange {
                user: "Hi".into(),
                assistant: "Hello there friend".into()
            }]
        );
    }

    #[test]
    fn later_turns_include_history() {
        let generator = ScriptedGenerator::new(&["first", "second"]);
        let prompts = generator.prompts.clone();
        let mut session = ChatSession::new(generator, config());
        let params = GenerateParams::new(10);
        session.generate("one", &params, &mut |_| ControlFlow::Continue(())).unwrap();
        session.generate("two", &params, &mut |_| ControlFlow::Continue(())).unwrap();

        let prompts = prompts.lock().unwrap();
        assert!(prompts[1].starts_with("### Human:\none\n\n### Assistant:\nfirst\n"));
        assert!(prompts[1].ends_with("### Human:\ntwo\n\n### Assistant:\n"));
    }

    #[test]
    fn stopping_early_keeps_partial_reply() {
        let mut session = ChatSession::new(ScriptedGenerator::new(&["a b c d"]), config());
        let mut count = 0;
        let reply = session
            .generate("go", &GenerateParams::new(10), &mut |_| {
                count += 1;
                if count == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(reply, "a ");
        assert_eq!(session.history()[0].assistant, "a ");
    }

    #[test]
    fn oldest_exchanges_are_dropped_when_context_is_full() {
        let mut generator = ScriptedGenerator::new(&["w w w w w", "x", "y"]);
        // a rendered turn is the four template words plus its text
        generator.context_size = 19;
        let mut session = ChatSession::new(generator, config());
        let params = GenerateParams::new(5);
        session.generate("a", &params, &mut |_| ControlFlow::Continue(())).unwrap();
        session.generate("b", &params, &mut |_| ControlFlow::Continue(())).unwrap();
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.history()[0].user, "b");
    }

    #[test]
    fn prompt_larger_than_context_fails() {
        let mut generator = ScriptedGenerator::new(&["never"]);
        generator.context_size = 8;
        let mut session = ChatSession::new(generator, config());
        let err = session
            .generate("far too many words here", &GenerateParams::new(5), &mut |_| {
                ControlFlow::Continue(())
            })
            .unwrap_err();
        assert!(err.to_string().contains("context window"));
        assert!(session.history().is_empty());
    }
}
