//! Error-signature normalization.
//!
//! Two failures share a signature when they differ only in volatile details:
//! line/column numbers, addresses, ids, timestamps, temp paths, colour codes
//! or whitespace.

use std::sync::LazyLock;

use regex::Regex;

const MAX_LINES: usize = 8;
const MAX_LEN: usize = 512;

static ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("static regex"));
static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
        .expect("static regex")
});
static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(\.\d+)?(z|[+-]\d{2}:?\d{2})?")
        .expect("static regex")
});
static HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-f]+\b|\b[0-9a-f]{12,}\b").expect("static regex"));
static TEMP_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(/tmp|/var/folders|/private/var)/[^\s:'\x22]+").expect("static regex")
});
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("static regex"));
static SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Normalize raw error output into a stable signature.
pub fn error_signature(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let text = ANSI.replace_all(&lowered, "");
    let text = UUID.replace_all(&text, "<uuid>");
    let text = TIMESTAMP.replace_all(&text, "<ts>");
    let text = TEMP_PATH.replace_all(&text, "<tmp>");
    let text = HEX.replace_all(&text, "<hex>");
    let text = DIGITS.replace_all(&text, "#");

    let mut out = text
        .lines()
        .map(|l| SPACE.replace_all(l.trim(), " ").to_string())
        .filter(|l| !l.is_empty())
        .take(MAX_LINES)
        .collect::<Vec<_>>()
        .join("\n");

    if out.len() > MAX_LEN {
        let mut cut = MAX_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}
