//! Instructions for the two model invocations of a chat turn, and output
//! normalization for the generated answer.

use crate::models::ScoredChunk;

/// Instruction for the reformulation step. The model must rewrite the
/// question only when it depends on earlier turns and must never answer it.
pub const CONTEXTUALIZE_SYSTEM_PROMPT: &str = "Given a chat history and the latest user question \
which might reference context in the chat history, formulate a standalone question which can be \
understood without the chat history. Do NOT answer the question, just reformulate it if needed \
and otherwise return it as is.";

/// Instruction for the generation step; the retrieved context is appended.
pub const ANSWER_SYSTEM_PROMPT: &str = "You are a professional assistant. Provide concise, \
professional answers based strictly on the provided context. Format responses clearly with:\n\
- Bullet points for lists\n\
- Bold text for emphasis\n\
- No unnecessary metadata\n\
If information isn't available, say so politely.\n\
Always maintain a professional but, good friend tone.";

/// Canonical bullet character of generated answers.
pub const BULLET: char = '•';

/// Provider-specific bullet glyphs rewritten to [`BULLET`].
const BULLET_GLYPHS: &[char] = &['▪', '◦', '●', '■', '\u{f0b7}'];

/// Build the generation instruction with retrieved passages as context.
///
/// Passages are separated by blank lines; chunk metadata is deliberately
/// not included so the model does not echo it.
pub fn answer_system_prompt(context: &[ScoredChunk]) -> String {
    let joined = context
        .iter()
        .map(|c| c.chunk.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{}\n\nContext:\n{}", ANSWER_SYSTEM_PROMPT, joined)
}

/// Replace provider-specific bullet glyphs with [`BULLET`].
pub fn normalize_answer(text: &str) -> String {
    text.chars()
        .map(|c| if BULLET_GLYPHS.contains(&c) { BULLET } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentChunk;

    fn scored(text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: DocumentChunk {
                id: "c".into(),
                source: "s.md".into(),
                sequence_hint: Some(0),
                offset: 0,
                text: text.into(),
                hash: "h".into(),
            },
            score: 1.0,
        }
    }

    #[test]
    fn test_normalize_answer_bullets() {
        assert_eq!(normalize_answer("▪ one\n● two\n• three"), "• one\n• two\n• three");
        assert_eq!(normalize_answer("plain"), "plain");
    }

    #[test]
    fn test_answer_prompt_includes_context_only() {
        let prompt = answer_system_prompt(&[scored(" Alpha facts "), scored("Beta facts")]);
        assert!(prompt.starts_with(ANSWER_SYSTEM_PROMPT));
        assert!(prompt.ends_with("Context:\nAlpha facts\n\nBeta facts"));
        assert!(!prompt.contains("s.md"));
    }

    #[test]
    fn test_answer_prompt_empty_context() {
        let prompt = answer_system_prompt(&[]);
        assert!(prompt.ends_with("Context:\n"));
    }
}
