use anyhow::Result;
use std::io::{self, Write};

use crate::table::{Table, console_width, rule};

/// Where the chat writes to. Boxed so tests can capture the output.
pub struct Console {
    out: Box<dyn Write + Send>,
    width: usize,
}

impl Console {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()), console_width())
    }

    pub fn new(out: Box<dyn Write + Send>, width: usize) -> Self {
        Self { out, width }
    }

    /// Write a generated token as-is and flush so it shows immediately.
    pub fn write_token(&mut self, text: &str) -> Result<()> {
        write!(self.out, "{}", text)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn print(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "{}", text)?;
        Ok(())
    }

    pub fn print_table(&mut self, table: &Table) -> Result<()> {
        write!(self.out, "{}", table)?;
        Ok(())
    }

    pub fn rule(&mut self, title: &str) -> Result<()> {
        writeln!(self.out, "{}", rule(title, self.width))?;
        Ok(())
    }

    /// Print the prompt text and flush, leaving the cursor on the same line.
    pub fn prompt(&mut self, text: &str) -> Result<()> {
        write!(self.out, "{}", text)?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// Shared in-memory writer.
    #[derive(Clone, Default)]
    pub struct TestBuffer(Arc<Mutex<Vec<u8>>>);

    impl TestBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for TestBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestBuffer;
    use super::*;

    #[test]
    fn tokens_are_written_without_newlines() {
        let buffer = TestBuffer::default();
        let mut console = Console::new(Box::new(buffer.clone()), 20);
        console.write_token("Hel").unwrap();
        console.write_token("lo").unwrap();
        console.print("").unwrap();
        console.rule("x").unwrap();
        assert_eq!(buffer.contents(), format!("Hello\n{}\n", rule("x", 20)));
    }
}
