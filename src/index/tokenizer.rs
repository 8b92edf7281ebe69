//! Tokenizer abstraction.
//!
//! Tokenizers are named pure functions from text to token sequences, and the
//! name is part of the persisted index's identity: a snapshot built with one
//! tokenizer is stale under any other. Because of that, a tokenizer's
//! behavior must never change under an existing name — behavioral changes
//! ship under a new name, which breaks snapshot compatibility safely.

use std::sync::Arc;

use unicode_normalization::UnicodeNormalization;

/// A named pure tokenization function.
pub trait Tokenizer: Send + Sync {
    /// Stable name recorded in index metadata.
    fn name(&self) -> &'static str;

    /// Tokenize text. Must be deterministic.
    fn tokenize(&self, text: &str) -> Vec<String> {
        self.tokenize_with_offsets(text)
            .into_iter()
            .map(|t| t.text)
            .collect()
    }

    /// Tokenize text, reporting each token's half-open byte range in the
    /// input. Offsets drive highlight extraction.
    fn tokenize_with_offsets(&self, text: &str) -> Vec<Token>;
}

/// A token with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Resolve a tokenizer by name.
pub fn resolve(name: &str) -> Option<Arc<dyn Tokenizer>> {
    match name {
        "unicode-v1" => Some(Arc::new(UnicodeTokenizer)),
        _ => None,
    }
}

/// Names accepted by [`resolve`], for error messages.
pub fn available_names() -> Vec<&'static str> {
    vec!["unicode-v1"]
}

/// Default tokenizer, `unicode-v1`:
///
/// - NFC-normalizes each token
/// - lowercases
/// - splits on a Unicode letter-or-digit class, keeping hyphens and
///   apostrophes that sit between two letter-or-digit characters (so
///   contractions and hyphenated compounds stay intact)
/// - drops tokens shorter than two characters
pub struct UnicodeTokenizer;

impl Tokenizer for UnicodeTokenizer {
    fn name(&self) -> &'static str {
        "unicode-v1"
    }

    fn tokenize_with_offsets(&self, text: &str) -> Vec<Token> {
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        let mut tokens = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            if !chars[i].1.is_alphanumeric() {
                i += 1;
                continue;
            }

            let start_char = i;
            let mut end_char = i + 1;
            while end_char < chars.len() {
                let c = chars[end_char].1;
                if c.is_alphanumeric() {
                    end_char += 1;
                } else if (c == '-' || c == '\'')
                    && end_char + 1 < chars.len()
                    && chars[end_char + 1].1.is_alphanumeric()
                {
                    // Interior joiner: consume it together with the
                    // following run.
                    end_char += 2;
                } else {
                    break;
                }
            }

            let start = chars[start_char].0;
            let end = match chars.get(end_char) {
                Some((offset, _)) => *offset,
                None => text.len(),
            };

            let raw = &text[start..end];
            if raw.chars().count() >= 2 {
                let normalized: String = raw.nfc().collect::<String>().to_lowercase();
                tokens.push(Token {
                    text: normalized,
                    start,
                    end,
                });
            }
            i = end_char;
        }

        tokens
    }
}
