//! Terminal rendering for matches and elaborations
//!
//! Rendering is split from printing so the layouts can be tested without a
//! terminal. Colour is used only on a TTY, without `NO_COLOR`, and when the
//! caller did not ask for plain output.

use anyhow::Result;
use crossterm::tty::IsTty;
use owo_colors::OwoColorize;
use std::io::{self, Write};

use crate::models::{split_chars, Match};

pub struct OutputFormatter {
    /// Whether to use colors and formatting
    pub use_colors: bool,
}

impl OutputFormatter {
    /// Formatter with automatic TTY and `NO_COLOR` detection
    pub fn new(plain: bool) -> Self {
        let is_tty = io::stdout().is_tty();
        let no_color = std::env::var_os("NO_COLOR").is_some();
        Self {
            use_colors: !plain && !no_color && is_tty,
        }
    }

    pub fn plain() -> Self {
        Self { use_colors: false }
    }

    /// Print matches grouped by file, followed by a summary line
    pub fn print_matches(&self, matches: &[Match]) -> Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(self.render_matches(matches).as_bytes())?;
        stdout.flush()?;
        Ok(())
    }

    pub fn render_matches(&self, matches: &[Match]) -> String {
        if matches.is_empty() {
            return "No matches found.\n".to_string();
        }

        let groups = group_by_file(matches);
        let mut out = String::new();
        for (idx, (file, group)) in groups.iter().enumerate() {
            out.push_str(&self.file_header(file, group.len()));
            for (i, m) in group.iter().enumerate() {
                out.push_str(&self.render_match(m, i + 1 == group.len()));
            }
            if idx + 1 < groups.len() {
                out.push('\n');
            }
        }

        let summary = format!("Found {} match(es) in total.", matches.len());
        out.push('\n');
        if self.use_colors {
            out.push_str(&summary.bold().to_string());
        } else {
            out.push_str(&summary);
        }
        out.push('\n');
        out
    }

    fn file_header(&self, file: &str, count: usize) -> String {
        let noun = if count == 1 { "match" } else { "matches" };
        if self.use_colors {
            format!(
                "{} {}\n",
                file.bright_cyan().bold(),
                format!("({} {})", count, noun).dimmed()
            )
        } else {
            format!("{} ({} {})\n", file, count, noun)
        }
    }

    fn render_match(&self, m: &Match, is_last: bool) -> String {
        let connector = if is_last { "└─" } else { "├─" };
        let rail = if is_last { "  " } else { "│ " };

        let mut out = if self.use_colors {
            format!(
                "  {} {}\n",
                connector.dimmed(),
                format!("line {}", m.line_number).yellow()
            )
        } else {
            format!("  {} line {}\n", connector, m.line_number)
        };

        for line in &m.snippet {
            let number = format!("{:>4}", line.line_number);
            let text = if line.line_number == m.line_number {
                self.highlight(&line.text, m.char_start, m.char_end)
            } else {
                line.text.clone()
            };

            if self.use_colors {
                let number = if line.line_number == m.line_number {
                    number.yellow().to_string()
                } else {
                    number.dimmed().to_string()
                };
                out.push_str(&format!("  {}   {} {} {}\n", rail.dimmed(), number, "│".dimmed(), text));
            } else {
                out.push_str(&format!("  {}   {} | {}\n", rail, number, text));
            }
        }
        out
    }

    /// Mark the matched span: colour on a terminal, `>>> <<<` otherwise
    fn highlight(&self, text: &str, start: usize, end: usize) -> String {
        let (before, matched, after) = split_chars(text, start, end);
        if self.use_colors {
            format!("{}{}{}", before, matched.black().on_yellow(), after)
        } else {
            format!("{}>>> {} <<<{}", before, matched, after)
        }
    }

    /// Print one elaboration under its finding's location
    pub fn print_elaboration(&self, target: &str, text: &str) {
        println!("{}", self.render_elaboration(target, text));
    }

    pub fn render_elaboration(&self, target: &str, text: &str) -> String {
        let options = textwrap::Options::new(100)
            .initial_indent("    ")
            .subsequent_indent("    ");
        let body = textwrap::fill(text.trim(), options);
        if self.use_colors {
            format!("{} {}\n{}", "Elaboration".magenta().bold(), target.bright_cyan(), body)
        } else {
            format!("Elaboration {}\n{}", target, body)
        }
    }
}

/// Matches grouped by file, in the order they arrive
fn group_by_file(matches: &[Match]) -> Vec<(&str, Vec<&Match>)> {
    let mut groups: Vec<(&str, Vec<&Match>)> = Vec::new();
    for m in matches {
        match groups.last_mut() {
            Some((file, group)) if *file == m.file_path => group.push(m),
            _ => groups.push((m.file_path.as_str(), vec![m])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SnippetLine;

    fn m(file: &str, line: usize, text: &str, start: usize, end: usize) -> Match {
        Match {
            file_path: file.into(),
            line_number: line,
            match_text: text.chars().skip(start).take(end - start).collect(),
            snippet: vec![SnippetLine { line_number: line, text: text.into() }],
            char_start: start,
            char_end: end,
        }
    }

    #[test]
    fn test_empty_result() {
        assert_eq!(OutputFormatter::plain().render_matches(&[]), "No matches found.\n");
    }

    #[test]
    fn test_plain_groups_by_file_and_marks_span() {
        let matches = vec![
            m("/a.rs", 1, "let x = needle;", 8, 14),
            m("/a.rs", 5, "needle()", 0, 6),
            m("/b.rs", 2, "no needle", 3, 9),
        ];
        let out = OutputFormatter::plain().render_matches(&matches);

        assert!(out.contains("/a.rs (2 matches)\n"));
        assert!(out.contains("/b.rs (1 match)\n"));
        assert!(out.contains("  ├─ line 1\n"));
        assert!(out.contains("   1 | let x = >>> needle <<<;\n"));
        assert!(out.contains("  └─ line 5\n"));
        assert!(out.ends_with("Found 3 match(es) in total.\n"));
    }

    #[test]
    fn test_elaboration_wraps() {
        let text = "word ".repeat(40);
        let out = OutputFormatter::plain().render_elaboration("/a.rs:3", &text);
        assert!(out.starts_with("Elaboration /a.rs:3\n"));
        assert!(out.lines().skip(1).all(|l| l.chars().count() <= 100));
        assert!(out.lines().count() > 2);
    }
}
