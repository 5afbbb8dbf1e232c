//! Request/completion markers over captured pane text
//!
//! An outbound message is wrapped with a request id and an instruction to
//! reply between a `BEGIN:<id>` line and a `DONE:<id>` line. Completion is
//! detected and the reply extracted from whatever the pane shows, which may
//! include the echoed prompt, earlier replies and harness trailers such as
//! `CCB_DONE: 1f2e`.
//!
//! Everything here is a pure function over `&str`.

mod ids;
mod sanitize;

pub use ids::{hex_encode, new_request_id, new_token};
pub use sanitize::sanitize;

use regex::Regex;
use std::sync::LazyLock;

/// `DONE`, `DONE:<hex>`, `FOO_DONE`, `FOO_BAR_DONE:<hex>` (whitespace removed)
static DONE_SHAPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:[a-z0-9]+_)*DONE(?::[0-9a-f]*)?$").expect("valid regex"));

fn squash(line: &str) -> String {
    line.chars().filter(|c| !c.is_whitespace()).collect()
}

fn is_marker_line(line: &str, tag: &str, id: &str) -> bool {
    let squashed = squash(line);
    let Some((head, tail)) = squashed.split_once(':') else {
        return false;
    };
    head.eq_ignore_ascii_case(tag) && tail.eq_ignore_ascii_case(id.trim())
}

/// True if `line` is exactly `DONE:<id>` (whitespace and case insensitive)
pub fn is_done_line(line: &str, id: &str) -> bool {
    is_marker_line(line, "DONE", id)
}

/// True if `line` is exactly `BEGIN:<id>` (whitespace and case insensitive)
pub fn is_begin_line(line: &str, id: &str) -> bool {
    is_marker_line(line, "BEGIN", id)
}

/// True for any completion-shaped line, whatever its id
pub fn is_done_shaped(line: &str) -> bool {
    DONE_SHAPED.is_match(&squash(line))
}

/// Lines that never count towards completion: blanks and foreign trailers
fn is_noise(line: &str, id: &str) -> bool {
    line.trim().is_empty() || (is_done_shaped(line) && !is_done_line(line, id))
}

/// Wrap `message` so the agent replies between `BEGIN:<id>` and `DONE:<id>`.
///
/// The markers only appear inline here, never alone on a line, so an echoed
/// prompt cannot be mistaken for a reply boundary.
pub fn wrap(message: &str, id: &str) -> String {
    format!(
        "[askd request {id}]\n\
         {message}\n\
         \n\
         Reply format: your reply must start with the line BEGIN:{id} and end with the line DONE:{id} (each marker alone on its own line, nothing after DONE).",
        id = id,
        message = message.trim_end(),
    )
}

/// True iff a `DONE:<id>` line exists once noise lines are discarded
pub fn is_complete(text: &str, id: &str) -> bool {
    text.lines()
        .filter(|line| !is_noise(line, id))
        .any(|line| is_done_line(line, id))
}

/// Extract the reply for `id` from captured text.
///
/// Preference order:
/// 1. between the nearest `BEGIN:<id>` and the last `DONE:<id>`;
/// 2. between the nearest earlier DONE-shaped line and the last `DONE:<id>`;
/// 3. everything after the last line mentioning `id` (no DONE yet).
pub fn extract_reply(text: &str, id: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();

    let segment = match lines.iter().rposition(|line| is_done_line(line, id)) {
        Some(done_idx) => {
            let before = &lines[..done_idx];
            let start = before
                .iter()
                .rposition(|line| is_begin_line(line, id))
                .or_else(|| before.iter().rposition(|line| is_done_shaped(line)))
                .map(|idx| idx + 1)
                .unwrap_or(0);
            &lines[start..done_idx]
        }
        None => {
            let needle = id.trim().to_lowercase();
            let start = lines
                .iter()
                .rposition(|line| !needle.is_empty() && line.to_lowercase().contains(&needle))
                .map(|idx| idx + 1)
                .unwrap_or(0);
            &lines[start..]
        }
    };

    trim_blank_lines(segment).join("\n")
}

/// True if some line of `text` carries `id`
pub fn mentions_id(text: &str, id: &str) -> bool {
    let needle = id.trim().to_lowercase();
    !needle.is_empty() && text.lines().any(|line| line.to_lowercase().contains(&needle))
}

/// True if anything that could be a reply is visible after the prompt.
///
/// Without the prompt header or a marker for `id` on screen, whatever is
/// visible predates this request and never counts.
pub fn has_candidate_reply(text: &str, id: &str) -> bool {
    if !mentions_id(text, id) {
        return false;
    }
    let reply = extract_reply(text, id);
    reply.lines().any(|line| !is_noise(line, id))
}

fn trim_blank_lines<'a>(lines: &'a [&'a str]) -> &'a [&'a str] {
    let start = lines.iter().position(|l| !l.trim().is_empty()).unwrap_or(lines.len());
    let end = lines.iter().rposition(|l| !l.trim().is_empty()).map(|i| i + 1).unwrap_or(start);
    &lines[start..end]
}
