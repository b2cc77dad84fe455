use std::fmt;

/// A titled, box-drawn console table.
#[derive(Debug, Clone, Default)]
pub struct Table {
    title: Option<String>,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn add_column(&mut self, name: impl Into<String>) {
        self.columns.push(name.into());
    }

    /// Missing cells are rendered empty, extra cells are dropped.
    pub fn add_row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut row: Vec<String> = cells
            .into_iter()
            .map(|c| flatten(&c.into()))
            .take(self.columns.len())
            .collect();
        row.resize(self.columns.len(), String::new());
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    fn widths(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                self.rows
                    .iter()
                    .map(|row| width(&row[i]))
                    .chain(std::iter::once(width(name)))
                    .max()
                    .unwrap_or(0)
            })
            .collect()
    }
}

fn width(s: &str) -> usize {
    s.chars().count()
}

fn flatten(s: &str) -> String {
    s.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

fn pad(s: &str, w: usize) -> String {
    format!("{s}{}", " ".repeat(w.saturating_sub(width(s))))
}

fn border(f: &mut fmt::Formatter<'_>, widths: &[usize], l: char, m: char, r: char) -> fmt::Result {
    let parts: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
    writeln!(f, "{l}{}{r}", parts.join(&m.to_string()))
}

fn line(f: &mut fmt::Formatter<'_>, widths: &[usize], cells: &[String]) -> fmt::Result {
    let parts: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(c, w)| format!(" {} ", pad(c, *w)))
        .collect();
    writeln!(f, "│{}│", parts.join("│"))
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.columns.is_empty() {
            if let Some(title) = &self.title {
                writeln!(f, "{title}")?;
            }
            return Ok(());
        }

        let widths = self.widths();
        if let Some(title) = &self.title {
            let total: usize = widths.iter().map(|w| w + 3).sum::<usize>() + 1;
            let indent = total.saturating_sub(width(title)) / 2;
            writeln!(f, "{}{title}", " ".repeat(indent))?;
        }

        border(f, &widths, '┌', '┬', '┐')?;
        line(f, &widths, &self.columns)?;
        border(f, &widths, '├', '┼', '┤')?;
        for row in &self.rows {
            line(f, &widths, row)?;
        }
        border(f, &widths, '└', '┴', '┘')
    }
}

/// A horizontal rule with a centred title, like `──── title ────`.
pub fn rule(title: &str, total_width: usize) -> String {
    let title = flatten(title);
    if title.is_empty() {
        return "─".repeat(total_width);
    }
    let label = format!(" {title} ");
    let rest = total_width.saturating_sub(width(&label));
    let left = rest / 2;
    format!("{}{label}{}", "─".repeat(left), "─".repeat(rest - left))
}

/// Console width from `COLUMNS`, falling back to 80.
pub fn console_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|c| c.parse().ok())
        .filter(|&c: &usize| c > 0)
        .unwrap_or(80)
}
