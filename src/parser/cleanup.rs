use std::sync::LazyLock;

use regex::Regex;

use super::image::BlockType;

static BLANK_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

// Labels may be split by soft hyphens (U+00AD) or whitespace at syllable
// boundaries, e.g. "Ре\u{AD}ше\u{AD}ние".
static SOLUTION_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[Рр]е[\u{AD}\s]*[шщ]е[\u{AD}\s]*ни[\u{AD}\s]*е\b[.:\s]*").unwrap()
});
static EXPLANATION_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[Пп]о[\u{AD}\s]*я[\u{AD}\s]*с[\u{AD}\s]*не[\u{AD}\s]*ни[\u{AD}\s]*е\b[.:\s]*")
        .unwrap()
});

static ANSWER_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:Ответ|Answer)[: ]").unwrap());

const LEFTOVER_BOILERPLATE: &[&str] = &["rule_info.", "rule_body"];

/// Normalize joined block text. Condition blocks get whitespace cleanup
/// only; solution blocks additionally lose their label and answer tail.
pub fn normalize(raw: &str, block_type: BlockType) -> String {
    let text = collapse_blank_lines(raw.trim());
    match block_type {
        BlockType::Condition => text,
        BlockType::Solution => normalize_solution(&text),
    }
}

pub fn collapse_blank_lines(text: &str) -> String {
    BLANK_RUN_RE.replace_all(text, "\n\n").into_owned()
}

fn normalize_solution(text: &str) -> String {
    let mut text = text.to_string();
    for marker in LEFTOVER_BOILERPLATE {
        text = text.replace(marker, "");
    }
    let text = strip_solution_label(text.trim());
    truncate_at_answer(&text)
}

/// Drop a leading "Решение"/"Пояснение" label and any `.`, `:` or
/// whitespace that follows it.
pub fn strip_solution_label(text: &str) -> String {
    let text = text.trim_start();
    let text = SOLUTION_LABEL_RE.replace(text, "");
    let text = EXPLANATION_LABEL_RE.replace(&text, "");
    text.trim_start_matches(|c: char| c == '.' || c == ':' || c.is_whitespace())
        .to_string()
}

/// Cut the text at the first answer marker that is not at the very start.
/// The answer is stored in its own field.
pub fn truncate_at_answer(text: &str) -> String {
    match ANSWER_MARKER_RE.find_iter(text).find(|m| m.start() > 0) {
        Some(m) => text[..m.start()].trim_end().to_string(),
        None => text.to_string(),
    }
}
