//! Deterministic prompt assembly.
//!
//! A prompt is built from four sections, in this order:
//!
//! 1. a preamble chosen by [`PromptStyle`],
//! 2. the retrieved context, highest score first,
//! 3. the session history, oldest turn first,
//! 4. the user's question.
//!
//! Identical inputs always produce byte-identical output, which is what
//! lets the response cache key on the prompt text.
//!
//! # Token budget
//!
//! Token counts are estimated at 4 characters per token. When the
//! estimate exceeds the budget, the lowest-scoring context entry is dropped
//! first, then the oldest history turn, one at a time, until the prompt fits
//! or nothing optional is left. The question is never trimmed.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{ConversationTurn, RetrievalResult};

const CHARS_PER_TOKEN: usize = 4;

const DEFAULT_PREAMBLE: &str = "You are a helpful assistant that answers questions using the context documents below.

Instructions:
- Base your answer only on the provided context
- Say so plainly when the context does not contain the answer
- Mention the document names you relied on
- Keep the answer focused and complete";

const CONCISE_PREAMBLE: &str = "You are a helpful assistant. Answer from the context documents below.

Rules:
- Use only the context
- Be brief and direct
- Cite document names when relevant
- Reply \"I don't have that information\" when the context lacks it";

const DETAILED_PREAMBLE: &str = "You are an expert assistant for document analysis and question answering.

Guidelines:
1. Use only information found in the context documents
2. Attribute every claim to the document it came from
3. Address every part of the question
4. State explicitly what the context does not cover
5. Organize the answer with clear structure

If the context is insufficient, describe what is missing instead of guessing.";

const NO_CONTEXT: &str = "No relevant context found.";

const RETRIEVAL_UNAVAILABLE: &str = "Document retrieval is currently unavailable, so no context documents could be consulted. Answer from the conversation alone and tell the user that their documents were not searched.";

/// Preamble flavor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    #[default]
    Default,
    Concise,
    Detailed,
}

impl PromptStyle {
    pub fn preamble(&self) -> &'static str {
        match self {
            PromptStyle::Default => DEFAULT_PREAMBLE,
            PromptStyle::Concise => CONCISE_PREAMBLE,
            PromptStyle::Detailed => DETAILED_PREAMBLE,
        }
    }
}

impl FromStr for PromptStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(PromptStyle::Default),
            "concise" => Ok(PromptStyle::Concise),
            "detailed" => Ok(PromptStyle::Detailed),
            other => Err(Error::Validation(format!(
                "unknown prompt style '{}' (expected default, concise or detailed)",
                other
            ))),
        }
    }
}

/// Everything that goes into a prompt.
#[derive(Debug, Clone)]
pub struct PromptInput<'a> {
    pub style: PromptStyle,
    pub query: &'a str,
    pub context: &'a [RetrievalResult],
    /// Oldest first.
    pub history: &'a [ConversationTurn],
    /// Retrieval failed; the prompt says so instead of listing context.
    pub retrieval_unavailable: bool,
}

/// An assembled prompt and what survived trimming.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub text: String,
    pub context_used: usize,
    pub history_used: usize,
    pub estimated_tokens: usize,
}

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Assemble a prompt that fits `budget_tokens` where possible.
pub fn assemble(input: &PromptInput<'_>, budget_tokens: usize) -> AssembledPrompt {
    let mut context: Vec<&RetrievalResult> = input.context.iter().collect();
    context.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.segment_id.cmp(&b.segment_id))
    });

    let mut ctx_len = context.len();
    let mut hist_start = 0;

    loop {
        let text = render(
            input,
            &context[..ctx_len],
            &input.history[hist_start..],
        );
        let estimated_tokens = estimate_tokens(&text);
        let trimmable = ctx_len > 0 || hist_start < input.history.len();
        if estimated_tokens <= budget_tokens || !trimmable {
            return AssembledPrompt {
                text,
                context_used: ctx_len,
                history_used: input.history.len() - hist_start,
                estimated_tokens,
            };
        }
        if ctx_len > 0 {
            ctx_len -= 1;
        } else {
            hist_start += 1;
        }
    }
}

fn render(
    input: &PromptInput<'_>,
    context: &[&RetrievalResult],
    history: &[ConversationTurn],
) -> String {
    let mut parts: Vec<String> = vec![input.style.preamble().to_string()];

    if input.retrieval_unavailable {
        parts.push(format!("## Context Documents:\n\n{}", RETRIEVAL_UNAVAILABLE));
    } else if context.is_empty() {
        parts.push(format!("## Context Documents:\n\n{}", NO_CONTEXT));
    } else {
        let mut section = String::from("## Context Documents:\n");
        for (i, r) in context.iter().enumerate() {
            section.push_str(&format!(
                "\n### Document {}: {} (Relevance: {:.2})\n{}\n",
                i + 1,
                r.document_filename,
                r.score,
                r.text
            ));
        }
        parts.push(section);
    }

    if !history.is_empty() {
        let mut section = String::from("## Previous Conversation:\n");
        for turn in history {
            section.push_str(&format!(
                "\nUser: {}\nAssistant: {}",
                turn.user_message, turn.assistant_message
            ));
        }
        parts.push(section);
    }

    parts.push(format!("## User Question:\n{}", input.query));
    parts.push("## Your Response:".to_string());
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ctx(id: &str, file: &str, score: f32, text: &str) -> RetrievalResult {
        RetrievalResult {
            segment_id: id.to_string(),
            document_id: file.to_string(),
            document_filename: file.to_string(),
            score,
            text: text.to_string(),
            preview: text.to_string(),
        }
    }

    fn turn(seq: u64, q: &str, a: &str) -> ConversationTurn {
        ConversationTurn {
            session_id: "s".to_string(),
            sequence: seq,
            user_message: q.to_string(),
            assistant_message: a.to_string(),
            timestamp: Utc::now(),
            memory_snapshot: None,
        }
    }

    fn input<'a>(
        context: &'a [RetrievalResult],
        history: &'a [ConversationTurn],
    ) -> PromptInput<'a> {
        PromptInput {
            style: PromptStyle::Default,
            query: "What is the refund window?",
            context,
            history,
            retrieval_unavailable: false,
        }
    }

    #[test]
    fn test_sections_in_order() {
        let context = vec![
            ctx("b_0", "low.txt", 0.6, "LOW"),
            ctx("a_0", "high.txt", 0.9, "HIGH"),
        ];
        let history = vec![turn(0, "first q", "first a"), turn(1, "second q", "second a")];
        let p = assemble(&input(&context, &history), 10_000);

        let t = &p.text;
        let pos = |s: &str| t.find(s).unwrap_or_else(|| panic!("missing {}", s));
        assert!(t.starts_with(DEFAULT_PREAMBLE));
        assert!(pos("HIGH") < pos("LOW"));
        assert!(pos("LOW") < pos("first q"));
        assert!(pos("first q") < pos("second q"));
        assert!(pos("second q") < pos("What is the refund window?"));
        assert!(t.contains("### Document 1: high.txt (Relevance: 0.90)"));
        assert_eq!(p.context_used, 2);
        assert_eq!(p.history_used, 2);
    }

    #[test]
    fn test_deterministic() {
        let context = vec![ctx("a_0", "a.txt", 0.7, "alpha")];
        let a = assemble(&input(&context, &[]), 10_000);
        let b = assemble(&input(&context, &[]), 10_000);
        assert_eq!(a, b);
    }

    #[test]
    fn test_no_context_notice() {
        let p = assemble(&input(&[], &[]), 10_000);
        assert!(p.text.contains(NO_CONTEXT));
        assert!(!p.text.contains("## Previous Conversation"));
    }

    #[test]
    fn test_retrieval_unavailable_notice() {
        let mut i = input(&[], &[]);
        i.retrieval_unavailable = true;
        let p = assemble(&i, 10_000);
        assert!(p.text.contains("retrieval is currently unavailable"));
        assert!(!p.text.contains(NO_CONTEXT));
    }

    #[test]
    fn test_trims_context_before_history() {
        let big = "x".repeat(400);
        let context = vec![
            ctx("a_0", "a.txt", 0.9, &big),
            ctx("b_0", "b.txt", 0.5, &big),
        ];
        let history = vec![turn(0, "old question", "old answer")];
        let full = assemble(&input(&context, &history), 10_000);
        let one_less = full.estimated_tokens - estimate_tokens(&big);

        let p = assemble(&input(&context, &history), one_less);
        assert_eq!(p.context_used, 1);
        assert_eq!(p.history_used, 1);
        assert!(p.text.contains("a.txt"));
        assert!(!p.text.contains("b.txt"));
    }

    #[test]
    fn test_trims_oldest_history_after_context() {
        let context = vec![ctx("a_0", "a.txt", 0.9, &"y".repeat(200))];
        let history = vec![
            turn(0, &"o".repeat(200), "old"),
            turn(1, "newest question", "newest answer"),
        ];
        let without_ctx = assemble(&input(&[], &history), 10_000);
        let budget = without_ctx.estimated_tokens - 10;

        let p = assemble(&input(&context, &history), budget);
        assert_eq!(p.context_used, 0);
        assert_eq!(p.history_used, 1);
        assert!(p.text.contains("newest question"));
        assert!(p.estimated_tokens <= budget);
    }

    #[test]
    fn test_query_never_trimmed() {
        let query = "q".repeat(1000);
        let mut i = input(&[], &[]);
        i.query = &query;
        let p = assemble(&i, 1);
        assert!(p.text.contains(&query));
        assert!(p.estimated_tokens > 1);
    }

    #[test]
    fn test_style_parsing() {
        assert_eq!("Concise".parse::<PromptStyle>().unwrap(), PromptStyle::Concise);
        assert!("verbose".parse::<PromptStyle>().is_err());
    }
}
