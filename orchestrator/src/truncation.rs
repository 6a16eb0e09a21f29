//! Keeps candidate outputs inside a token budget before synthesis.

fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Cuts `content` to roughly `limit` estimated tokens (~4 chars each),
/// keeping whole lines where possible. Returns the kept text and whether
/// anything was dropped.
pub fn truncate_output(content: &str, limit: usize) -> (String, bool) {
    if estimate_tokens(content) <= limit {
        return (content.to_string(), false);
    }

    let max_chars = limit * 4;
    let mut truncated = String::new();
    for line in content.lines() {
        let needed = line.len() + usize::from(!truncated.is_empty());
        if truncated.len() + needed > max_chars {
            break;
        }
        if !truncated.is_empty() {
            truncated.push('\n');
        }
        truncated.push_str(line);
    }

    // A single oversized first line still keeps its head.
    if truncated.is_empty() {
        let mut cut = max_chars.min(content.len());
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        truncated.push_str(&content[..cut]);
    }

    truncated.push_str(&format!("\n\n[output truncated at {limit} estimated tokens]"));
    (truncated, true)
}
