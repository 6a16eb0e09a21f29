//! Builds the prompt that folds every candidate into one answer.

use crate::truncation::truncate_output;

pub const DEFAULT_SYNTHESIS_INSTRUCTIONS: &str = "You are given several independent candidate answers to the same task. \
Compare them, keep what is correct, resolve disagreements, and reply with the single best combined answer. \
Do not mention the candidates themselves in your reply.";

/// Renders the synthesis prompt.
///
/// `instructions` replaces the default instructional text only; the original
/// task and the numbered candidate list are always appended. Each candidate
/// gets its own `token_limit` budget.
pub fn build_synthesis_prompt(
    prompt: &str,
    instructions: Option<&str>,
    candidates: &[String],
    token_limit: usize,
) -> String {
    let instructions = instructions
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(DEFAULT_SYNTHESIS_INSTRUCTIONS);

    let mut out = String::new();
    out.push_str(instructions);
    out.push_str("\n\nOriginal task:\n");
    out.push_str(prompt.trim());
    out.push('\n');

    for (index, candidate) in candidates.iter().enumerate() {
        let (text, _) = truncate_output(candidate.trim(), token_limit);
        out.push_str(&format!("\nCandidate {}:\n{text}\n", index + 1));
    }
    out
}
