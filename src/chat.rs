use anyhow::{Context, Result};
use std::io::BufRead;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::cli::ChatArgs;
use crate::model::ModelLoader;
use crate::output::Console;
use crate::session::{ChatSession, GenerateParams, TokenGenerator};
use crate::table::Table;

/// Ctrl-C handling: stops a running generation, exits when idle.
#[derive(Default)]
pub struct Interrupt {
    generating: AtomicBool,
    stop: AtomicBool,
}

impl Interrupt {
    /// Listen for Ctrl-C on the tokio runtime.
    pub fn install() -> Arc<Self> {
        let interrupt = Arc::new(Self::default());
        let listener = interrupt.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if listener.generating.load(Ordering::SeqCst) {
                    listener.stop.store(true, Ordering::SeqCst);
                } else {
                    println!("\nBye!\n");
                    std::process::exit(130);
                }
            }
        });
        interrupt
    }

    fn begin(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.generating.store(true, Ordering::SeqCst);
    }

    fn end(&self) {
        self.generating.store(false, Ordering::SeqCst);
    }

    fn requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn trigger(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Interactive terminal chat.
pub struct GptChat<G> {
    console: Console,
    session: ChatSession<G>,
    params: GenerateParams,
    interrupt: Arc<Interrupt>,
}

impl<G: TokenGenerator> GptChat<G> {
    /// Prints the thread count and the info table.
    pub fn new(
        session: ChatSession<G>,
        params: GenerateParams,
        mut console: Console,
        interrupt: Arc<Interrupt>,
    ) -> Result<Self> {
        let thread_count = session.thread_count();
        console.print(&format!("Using {thread_count} threads..."))?;

        let config = session.config();
        let mut table = Table::new("GPT4All info");
        table.add_column("Parameter");
        table.add_column("Value");
        table.add_row(["model".to_string(), config.filename.clone()]);
        table.add_row(["Thread count".to_string(), thread_count.to_string()]);
        table.add_row(["Temperature".to_string(), params.temperature.to_string()]);
        table.add_row(["Max tokens".to_string(), params.max_tokens.to_string()]);
        table.add_row(["System prompt".to_string(), format!("{:?}", config.system_prompt)]);
        table.add_row(["Prompt template".to_string(), format!("{:?}", config.prompt_template)]);
        console.print_table(&table)?;

        Ok(Self {
            console,
            session,
            params,
            interrupt,
        })
    }

    /// Read prompts until an empty line or end of input.
    pub fn run_loop(&mut self, input: &mut impl BufRead) -> Result<()> {
        let mut line = String::new();
        loop {
            self.console.prompt("You: ")?;
            line.clear();
            let read = input.read_line(&mut line).context("Failed to read input")?;
            let prompt = line.trim();
            if read == 0 || prompt.is_empty() {
                self.console.print("\nBye!\n")?;
                return Ok(());
            }
            let prompt = prompt.to_string();
            self.ask(&prompt)?;
        }
    }

    pub fn ask(&mut self, prompt: &str) -> Result<()> {
        self.console.rule(prompt)?;
        let start = Instant::now();

        let console = &mut self.console;
        let interrupt = &self.interrupt;
        let mut write_error = None;

        interrupt.begin();
        let result = self.session.generate(prompt, &self.params, &mut |token| {
            if interrupt.requested() {
                return ControlFlow::Break(());
            }
            if let Err(err) = console.write_token(token) {
                write_error = Some(err);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        interrupt.end();

        if let Some(err) = write_error {
            return Err(err);
        }
        if let Err(err) = result {
            tracing::error!("generation failed: {err:#}");
            self.console.print(&format!("\nError: {err:#}"))?;
        } else if self.interrupt.requested() {
            self.console.write_token("...")?;
        }

        self.console.print("")?;
        self.console
            .rule(&format!("Duration: {}", human_duration(start.elapsed())))?;
        self.console.print("")?;
        Ok(())
    }
}

/// `0.4 sec`, `2.5 min`, `1.2 hours`, `3.0 days`
pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        format!("{secs:.1} sec")
    } else if secs < 60.0 * 60.0 {
        format!("{:.1} min", secs / 60.0)
    } else if secs < 24.0 * 60.0 * 60.0 {
        format!("{:.1} hours", secs / 3600.0)
    } else {
        format!("{:.1} days", secs / 86400.0)
    }
}

/// `chat` command.
pub async fn run(args: ChatArgs) -> Result<()> {
    println!();
    println!("Use model_name={:?}...", args.model);

    let loader = ModelLoader {
        source: args.source.clone(),
        context_size: args.context_size,
        threads: args.cpu_count,
    };
    let session = loader.load(&args.model).await?;

    let params = GenerateParams::new(args.max_tokens).with_temperature(args.temperature);
    let initial_prompt = args.initial_prompt();
    let interrupt = Interrupt::install();

    // Inference and stdin are blocking
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut chat = GptChat::new(session, params, Console::stdout(), interrupt)?;
        if !initial_prompt.trim().is_empty() {
            chat.ask(initial_prompt.trim())?;
        }
        chat.run_loop(&mut std::io::stdin().lock())
    })
    .await
    .context("Chat task failed")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::testing::TestBuffer;
    use crate::prompt::ModelConfig;
    use crate::session::testing::ScriptedGenerator;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn chat(replies: &[&str]) -> (GptChat<ScriptedGenerator>, TestBuffer) {
        let buffer = TestBuffer::default();
        let session = ChatSession::new(
            ScriptedGenerator::new(replies),
            ModelConfig::new(&PathBuf::from("orca-mini-3b-gguf2-q4_0.gguf"), None),
        );
        let chat = GptChat::new(
            session,
            GenerateParams::new(100),
            Console::new(Box::new(buffer.clone()), 40),
            Arc::new(Interrupt::default()),
        )
        .unwrap();
        (chat, buffer)
    }

    #[test]
    fn prints_info_table() {
        let (_chat, buffer) = chat(&[]);
        let out = buffer.contents();
        assert!(out.starts_with("Using 2 threads...\n"));
        assert!(out.contains("GPT4All info"));
        assert!(out.contains("│ model           │ orca-mini-3b-gguf2-q4_0.gguf"));
        assert!(out.contains("Max tokens"));
        assert!(out.contains(r####""### Human:\n%1\n\n### Assistant:\n""####));
    }

    #[test]
    fn loop_answers_until_empty_line() {
        let (mut chat, buffer) = chat(&["Hi there", "Sure"]);
        let mut input = Cursor::new("Hello\nHelp?\n\nnever asked\n");
        chat.run_loop(&mut input).unwrap();

        let out = buffer.contents();
        assert!(out.contains(" Hello "));
        assert!(out.contains("Hi there\n"));
        assert!(out.contains("Sure\n"));
        assert!(out.contains("Duration: "));
        assert!(out.trim_end().ends_with("Bye!"));
        assert!(!out.contains("never asked"));
    }

    #[test]
    fn end_of_input_says_bye() {
        let (mut chat, buffer) = chat(&[]);
        chat.run_loop(&mut Cursor::new("")).unwrap();
        assert!(buffer.contents().ends_with("You: \nBye!\n\n"));
    }

    /// Presses Ctrl-C right after the first token.
    struct InterruptAfterFirst {
        inner: ScriptedGenerator,
        interrupt: Arc<Interrupt>,
    }

    impl TokenGenerator for InterruptAfterFirst {
        fn count_tokens(&self, text: &str) -> Result<usize> {
            self.inner.count_tokens(text)
        }

        fn context_size(&self) -> usize {
            self.inner.context_size()
        }

        fn thread_count(&self) -> usize {
            self.inner.thread_count()
        }

        fn complete(
            &mut self,
            prompt: &str,
            params: &GenerateParams,
            on_token: &mut crate::session::TokenSink<'_>,
        ) -> Result<String> {
            let interrupt = self.interrupt.clone();
            self.inner.complete(prompt, params, &mut |t| {
                let flow = on_token(t);
                interrupt.trigger();
                flow
            })
        }
    }

    #[test]
    fn interrupted_generation_prints_ellipsis() {
        let buffer = TestBuffer::default();
        let interrupt = Arc::new(Interrupt::default());
        let generator = InterruptAfterFirst {
            inner: ScriptedGenerator::new(&["one two three"]),
            interrupt: interrupt.clone(),
        };
        let session = ChatSession::new(
            generator,
            ModelConfig::new(&PathBuf::from("m.gguf"), None),
        );
        let mut chat = GptChat::new(
            session,
            GenerateParams::new(100),
            Console::new(Box::new(buffer.clone()), 40),
            interrupt,
        )
        .unwrap();

        chat.ask("count").unwrap();
        let out = buffer.contents();
        assert!(out.contains("one ...\n"));
        assert!(!out.contains("two"));
        // the history holds what was shown
        assert_eq!(chat.session.history()[0].assistant, "one ");
    }

    #[test]
    fn human_durations() {
        assert_eq!(human_duration(Duration::from_millis(400)), "0.4 sec");
        assert_eq!(human_duration(Duration::from_secs(150)), "2.5 min");
        assert_eq!(human_duration(Duration::from_secs(4320)), "1.2 hours");
        assert_eq!(human_duration(Duration::from_secs(3 * 86400)), "3.0 days");
    }
}
