//! System prompt for the bundled VLM backend.
//!
//! Override per deployment with [`crate::config::VlmConfig::system_prompt`].

/// Default instruction sent with every page image.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You convert one rendered PDF page into clean Markdown.

Rules:
1. Transcribe all text in natural reading order. Do not summarise or invent.
2. Use # / ## / ### for headings that are visually headings, - and 1. for lists.
3. Convert tables to GFM pipe tables; fall back to HTML only when cells span.
4. Render formulas as LaTeX: $inline$ and $$display$$.
5. Wrap code in fenced blocks with a language tag when it is evident.
6. Skip page numbers, running headers/footers and decorative rules.
7. Output only the Markdown. No surrounding ``` fences, no commentary."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_forbids_outer_fences() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("No surrounding ``` fences"));
    }
}
