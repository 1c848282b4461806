//! Shared text utility functions.
//!
//! The token estimator is a relative cost signal for window budgeting, not
//! a real tokenizer: Latin letters weigh roughly a quarter token, other
//! ASCII half a token, and everything else a token and a half. Callers
//! must treat the result as an approximation.

/// Approximate the token cost of a text blob. Deterministic, O(len).
pub fn estimate_token_length(input: &str) -> usize {
    // Accumulate in quarter-token units to stay integral.
    let mut quarters: usize = 0;
    for ch in input.chars() {
        let code = ch as u32;
        if code < 128 {
            if (65..=122).contains(&code) {
                quarters += 1;
            } else {
                quarters += 2;
            }
        } else {
            quarters += 6;
        }
    }
    quarters.div_ceil(4)
}

/// Clean up a model-derived topic label: drop wrapping quotes and any
/// trailing punctuation.
pub fn trim_topic(topic: &str) -> String {
    const QUOTES: &[char] = &['"', '\u{201c}', '\u{201d}'];
    const TRAILING: &[char] = &[
        '，', '。', '！', '？', '、', ',', '.', '!', '?', '"', '\u{201c}', '\u{201d}',
    ];
    topic
        .trim()
        .trim_matches(QUOTES)
        .trim_end_matches(TRAILING)
        .to_string()
}

/// Find the largest byte index <= `index` that is a valid char boundary.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
