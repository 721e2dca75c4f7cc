//! Post-processing: deterministic cleanup of model-generated analysis text.
//!
//! Even well-prompted models wrap answers in code fences, open with a
//! conversational preamble, or (reasoning models) leak their `<think>` block.
//! These rules fix such quirks without touching content.
//!
//! ## Rule Order
//!
//! Reasoning blocks go first because they may contain fences of their own;
//! line endings are normalised before any line-based rule runs.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to a raw model answer.
///
/// Rules (applied in order):
/// 1. Drop `<think>…</think>` reasoning blocks
/// 2. Strip outer code fences (any language tag)
/// 3. Normalise line endings (CRLF → LF)
/// 4. Drop a conversational opener ("Sure, here is …:")
/// 5. Trim trailing whitespace per line
/// 6. Collapse 3+ consecutive newlines to one blank line
/// 7. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 8. Trim the whole answer
///
/// An answer that is empty after cleanup is treated by the caller as an
/// invalid response.
pub fn clean_model_text(input: &str) -> String {
    let s = strip_think_blocks(input);
    let s = strip_outer_fences(&s);
    let s = normalise_line_endings(&s);
    let s = strip_preamble(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    s.trim().to_string()
}

// ── Rule 1: Reasoning blocks ────────────────────────────────────────────────

static RE_THINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());

fn strip_think_blocks(input: &str) -> String {
    RE_THINK.replace_all(input, "").to_string()
}

// ── Rule 2: Outer fences ────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*\r?\n(.*)\r?\n```\s*$").unwrap());

fn strip_outer_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 3: Line endings ────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 4: Conversational opener ───────────────────────────────────────────

static RE_PREAMBLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(sure|certainly|of course|okay|ok|here is|here's)[^\n]*:\s*\n").unwrap()
});

fn strip_preamble(input: &str) -> String {
    RE_PREAMBLE.replace(input, "").to_string()
}

// ── Rule 5: Trailing whitespace ─────────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 6: Blank lines ─────────────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 7: Invisible characters ────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences_with_lang() {
        let input = "```text\nA bracket.\n```";
        assert_eq!(strip_outer_fences(input), "A bracket.");
    }

    #[test]
    fn test_no_fences_passthrough() {
        assert_eq!(strip_outer_fences("A bracket."), "A bracket.");
    }

    #[test]
    fn test_think_block_removed() {
        let input = "<think>\nlet me see ```x```\n</think>\nFloor plan.";
        assert_eq!(clean_model_text(input), "Floor plan.");
    }

    #[test]
    fn test_preamble_removed() {
        let input = "Sure! Here is the analysis:\n- Type: gear";
        assert_eq!(clean_model_text(input), "- Type: gear");
    }

    #[test]
    fn test_preamble_kept_when_content() {
        // A first line that is real content is not an opener.
        let input = "Type: gear\n- teeth: 24";
        assert_eq!(clean_model_text(input), input);
    }

    #[test]
    fn test_collapse_blank_lines() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn test_remove_invisible() {
        let input = "Ø20\u{200B}H7\u{FEFF}";
        assert_eq!(remove_invisible_chars(input), "Ø20H7");
    }

    #[test]
    fn test_empty_after_cleanup() {
        assert_eq!(clean_model_text("```\n\n```"), "");
        assert_eq!(clean_model_text("<think>only thoughts</think>  \n"), "");
    }

    #[test]
    fn test_full_pipeline() {
        let input = "```markdown\r\nOverview   \r\n\r\n\r\n\r\n- part A\r\n```";
        assert_eq!(clean_model_text(input), "Overview\n\n- part A");
    }
}
