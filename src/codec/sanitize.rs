//! Cleanup of captured pane text
//!
//! Pane captures carry color codes, cursor movement, OSC titles and carriage
//! returns. Marker matching works on plain lines, so those are removed here.

use regex::Regex;
use std::sync::LazyLock;

/// CSI sequences, OSC sequences (BEL or ST terminated) and two-byte escapes
static ANSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("valid regex")
});

/// Strip escape sequences and control characters, normalize line endings and
/// trailing whitespace.
pub fn sanitize(raw: &str) -> String {
    let stripped = ANSI.replace_all(raw, "");
    let normalized = stripped.replace("\r\n", "\n").replace('\r', "\n");
    normalized
        .lines()
        .map(|line| {
            line.chars()
                .filter(|c| *c == '\t' || !c.is_control())
                .collect::<String>()
                .trim_end()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_color_codes() {
        assert_eq!(sanitize("\x1b[1;32mDONE:ab\x1b[0m"), "DONE:ab");
    }

    #[test]
    fn test_strips_osc_title() {
        assert_eq!(sanitize("\x1b]0;codex\x07hello"), "hello");
    }

    #[test]
    fn test_normalizes_line_endings() {
        assert_eq!(sanitize("a\r\nb\rc  \n"), "a\nb\nc");
    }

    #[test]
    fn test_drops_control_chars() {
        assert_eq!(sanitize("a\x08b\x00c\td"), "abc\td");
    }
}
