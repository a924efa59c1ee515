//! Wider source context around a finding

use std::path::Path;

use crate::engine::decode_text;

/// `window` lines either side of `line_number`, the match line marked with `>>`.
///
/// Returns `None` when the line is outside the text.
pub fn format_window(text: &str, line_number: usize, window: usize) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    if line_number == 0 || line_number > lines.len() {
        return None;
    }

    let idx = line_number - 1;
    let first = idx.saturating_sub(window);
    let last = idx.saturating_add(window).min(lines.len() - 1);

    let rendered = (first..=last)
        .map(|i| {
            let marker = if i == idx { ">> " } else { "  " };
            format!("{}{:>4}: {}", marker, i + 1, lines[i])
        })
        .collect::<Vec<_>>()
        .join("\n");
    Some(rendered)
}

/// Read `path` and format the window around `line_number`. Failures are logged, not returned.
pub fn wider_context(path: &Path, line_number: usize, window: usize) -> Option<String> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!(
                "Could not read {} for wider context, using the snippet only: {}",
                path.display(),
                e
            );
            return None;
        }
    };

    let context = format_window(&decode_text(bytes), line_number, window);
    if context.is_none() {
        log::warn!("Line {} is past the end of {}, using the snippet only", line_number, path.display());
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_window_marks_match_line() {
        let text = "a\nb\nc\nd\ne";
        let window = format_window(text, 3, 1).unwrap();
        assert_eq!(window, "     2: b\n>>    3: c\n     4: d");
    }

    #[test]
    fn test_window_clamps_to_file() {
        let window = format_window("only\nlines", 1, 10).unwrap();
        assert_eq!(window, ">>    1: only\n     2: lines");
    }

    #[test]
    fn test_huge_window_is_clamped() {
        let window = format_window("a\nb\nc", 2, usize::MAX).unwrap();
        assert_eq!(window, "     1: a\n>>    2: b\n     3: c");
    }

    #[test]
    fn test_out_of_range_line() {
        assert!(format_window("a\nb", 3, 2).is_none());
        assert!(format_window("a", 0, 2).is_none());
    }

    #[test]
    fn test_unreadable_file_yields_none() {
        let temp = TempDir::new().unwrap();
        assert!(wider_context(&temp.path().join("gone.rs"), 1, 5).is_none());

        let path = temp.path().join("here.rs");
        std::fs::write(&path, "fn main() {}\n").unwrap();
        assert_eq!(wider_context(&path, 1, 5).unwrap(), ">>    1: fn main() {}");
    }
}
