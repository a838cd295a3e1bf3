//! Prompt tokenization seam and context-window padding.

use crate::{EngineError, error::Result};

pub const START_TOKEN: u32 = 49406;
pub const END_TOKEN: u32 = 49407;
pub const PAD_TOKEN: u32 = 0;
pub const CONTEXT_LENGTH: usize = 77;

/// Marker ids framing every prompt. They must lie inside the encoder's vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpecialTokens {
    pub start: u32,
    pub end: u32,
    pub pad: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            start: START_TOKEN,
            end: END_TOKEN,
            pad: PAD_TOKEN,
        }
    }
}

/// Turns a prompt into token ids, without start or end markers.
pub trait Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}

/// Accepts prompts that already are token ids: `"320, 1125, 539"`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenIdTokenizer;

impl Tokenizer for TokenIdTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| EngineError::InvalidArgument(format!("'{part}' is not a token id")))
            })
            .collect()
    }
}

/// Frame `ids` with start and end markers and pad to `length`; overlong input is truncated
/// so the end marker always fits.
pub fn pad_tokens(ids: &[u32], length: usize, special: SpecialTokens) -> Vec<u32> {
    let body = length.saturating_sub(2);
    let mut tokens = Vec::with_capacity(length);
    tokens.push(special.start);
    tokens.extend(ids.iter().take(body));
    tokens.push(special.end);
    tokens.resize(length, special.pad);
    tokens.truncate(length);
    tokens
}

#[cfg(test)]
mod tokenizer_test {
    use super::*;

    #[test]
    fn test_token_ids_parse() {
        assert_eq!(TokenIdTokenizer.encode("320, 1125 539").unwrap(), vec![320, 1125, 539]);
        assert!(TokenIdTokenizer.encode("").unwrap().is_empty());
        assert!(TokenIdTokenizer.encode("a photo").is_err());
    }

    #[test]
    fn test_padding() {
        let tokens = pad_tokens(&[320, 1125], CONTEXT_LENGTH, SpecialTokens::default());
        assert_eq!(tokens.len(), 77);
        assert_eq!(&tokens[..4], &[START_TOKEN, 320, 1125, END_TOKEN]);
        assert!(tokens[4..].iter().all(|t| *t == PAD_TOKEN));

        let long: Vec<u32> = (1..=100).collect();
        let tokens = pad_tokens(&long, CONTEXT_LENGTH, SpecialTokens::default());
        assert_eq!(tokens.len(), 77);
        assert_eq!((tokens[75], tokens[76]), (75, END_TOKEN));
    }

    #[test]
    fn test_padding_uses_configured_markers() {
        let special = SpecialTokens { start: 62, end: 63, pad: 1 };
        assert_eq!(pad_tokens(&[12, 7], 6, special), vec![62, 12, 7, 63, 1, 1]);
        assert_eq!(pad_tokens(&[12, 7, 33, 40, 41], 4, special), vec![62, 12, 7, 63]);
    }
}
