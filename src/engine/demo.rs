//! Deterministic in-process engine
//!
//! Echoes the visible words of the last user turn of each prompt, dropping
//! chat-template markup, then applies `max_tokens` (one token per word) and
//! the stop sequences.
//! Output depends only on the prompt and the sampling configuration.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{InferenceEngine, SamplingConfig};
use crate::error::Result;

/// Echo engine used by `serve --demo` and tests
#[derive(Debug, Default)]
pub struct DemoEngine {
    calls: AtomicU64,
}

impl DemoEngine {
    /// Create a demo engine
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `generate` calls served
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn complete(prompt: &str, sampling: &SamplingConfig) -> String {
        let visible = strip_markup(last_user_turn(prompt));
        let mut text = visible
            .split_whitespace()
            .take(sampling.max_tokens)
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(cut) = sampling
            .stop
            .iter()
            .filter(|stop| !stop.is_empty())
            .filter_map(|stop| text.find(stop.as_str()))
            .min()
        {
            text.truncate(cut);
        }
        text
    }
}

impl InferenceEngine for DemoEngine {
    fn name(&self) -> &str {
        "demo"
    }

    fn generate(&self, prompts: &[String], sampling: &SamplingConfig) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(prompts
            .iter()
            .map(|prompt| Self::complete(prompt, sampling))
            .collect())
    }

    fn supports_concurrent_calls(&self) -> bool {
        true
    }
}

/// Content of the last ChatML user turn, or the whole prompt
fn last_user_turn(prompt: &str) -> &str {
    const USER_TURN: &str = "<|im_start|>user\n";
    match prompt.rfind(USER_TURN) {
        Some(start) => {
            let turn = &prompt[start + USER_TURN.len()..];
            turn.find("<|im_end|>").map_or(turn, |end| &turn[..end])
        },
        None => prompt,
    }
}

/// Remove `<|...|>` special tokens and `<think>` tags
fn strip_markup(prompt: &str) -> String {
    let mut out = String::with_capacity(prompt.len());
    let mut rest = prompt;
    while let Some(start) = rest.find("<|") {
        out.push_str(&rest[..start]);
        match rest[start..].find("|>") {
            Some(end) => rest = &rest[start + end + 2..],
            None => {
                rest = "";
            },
        }
    }
    out.push_str(rest);
    out.replace("<think>", " ").replace("</think>", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_markup() {
        let prompt = "<|im_start|>user\n2+2=<|im_end|>\n<|im_start|>assistant\n<think>\n\n</think>\n\n";
        let visible = strip_markup(last_user_turn(prompt));
        assert!(!visible.contains("<|"));
        assert!(!visible.contains("think>"));
        assert!(visible.contains("2+2="));
    }

    #[test]
    fn test_unterminated_marker_is_dropped() {
        assert_eq!(strip_markup("hello <|broken"), "hello ");
    }

    #[test]
    fn test_complete_is_deterministic() {
        let engine = DemoEngine::new();
        let sampling = SamplingConfig::default();
        let prompts = vec!["<|im_start|>user\n2+2=<|im_end|>".to_string()];
        let first = engine.generate(&prompts, &sampling).expect("generate");
        let second = engine.generate(&prompts, &sampling).expect("generate");
        assert_eq!(first, second);
        assert_eq!(first[0], "2+2=");
        assert_eq!(engine.calls(), 2);
    }

    #[test]
    fn test_last_user_turn() {
        let prompt = "<|im_start|>system\nBe brief.<|im_end|>\n<|im_start|>user\nhi there<|im_end|>\n<|im_start|>assistant\n";
        assert_eq!(last_user_turn(prompt), "hi there");
        assert_eq!(last_user_turn("plain text"), "plain text");
    }

    #[test]
    fn test_max_tokens_limits_words() {
        let sampling = SamplingConfig::default().with_max_tokens(2);
        assert_eq!(DemoEngine::complete("one two three four", &sampling), "one two");
    }

    #[test]
    fn test_stop_sequence_truncates() {
        let sampling = SamplingConfig::default().with_stop(vec!["STOP".to_string()]);
        assert_eq!(
            DemoEngine::complete("keep this STOP drop that", &sampling),
            "keep this "
        );
    }
}
