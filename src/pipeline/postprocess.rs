//! Deterministic cleanup of VLM-generated Markdown.
//!
//! Even well-prompted models wrap replies in ```` ```markdown ```` fences,
//! emit CRLF line endings, or pad pages with runs of blank lines and
//! zero-width characters. These rules fix the quirks without touching content.
//! Order matters: fences come off before line endings are normalised so the
//! fence pattern sees the raw reply.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```(?:markdown|md)?[ \t]*\r?\n(.*?)\r?\n```\s*$").expect("valid regex")
});

static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

const INVISIBLE: [char; 5] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'];

/// Clean one page of model output. The result ends with exactly one newline.
pub fn clean_markdown(raw: &str) -> String {
    let trimmed = raw.trim();
    let unfenced = match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    };

    let body: String = unfenced
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !INVISIBLE.contains(c))
        .collect();

    let body = body
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");

    let body = RE_BLANK_RUNS.replace_all(body.trim(), "\n\n");
    format!("{body}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_outer_fences() {
        assert_eq!(clean_markdown("```markdown\n# Title\n```"), "# Title\n");
        assert_eq!(clean_markdown("```\nplain\n```\n"), "plain\n");
    }

    #[test]
    fn keeps_inner_code_blocks() {
        let md = "# Code\n\n```rust\nfn main() {}\n```\n\ntext";
        assert_eq!(clean_markdown(md), format!("{md}\n"));
    }

    #[test]
    fn normalises_whitespace() {
        let md = "a  \r\nb\r\n\r\n\r\n\r\nc\u{200B}";
        assert_eq!(clean_markdown(md), "a\nb\n\nc\n");
    }

    #[test]
    fn empty_reply_is_single_newline() {
        assert_eq!(clean_markdown("  \n\n"), "\n");
    }
}
