//! System-prompt assembly for one chat turn.
//!
//! With retrieved passages the model is told to ground its answer in them;
//! with none it answers as a plain general assistant. Which variant ran is
//! observable through the completion backend's recorded input.

use std::fmt::Write;

use retrieval_pipeline::RetrievedChunk;

pub const GROUNDED_HEADER: &str =
    "Ground your answer in the numbered reference passages below.";
pub const GENERAL_HEADER: &str = "No reference passages are available for this question.";

#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub system_prompt: String,
    pub grounded: bool,
}

pub fn assemble_system_prompt(persona: &str, chunks: &[RetrievedChunk]) -> AssembledPrompt {
    if chunks.is_empty() {
        let system_prompt = format!(
            "{persona}\n\n{GENERAL_HEADER} Answer from your general knowledge as a helpful assistant, and say so when you are not certain."
        );
        return AssembledPrompt {
            system_prompt,
            grounded: false,
        };
    }

    let mut passages = String::new();
    for (index, retrieved) in chunks.iter().enumerate() {
        let chunk = &retrieved.chunk;
        let _ = write!(passages, "[{}] {}", index + 1, chunk.source_title);
        if let Some(page) = chunk.page {
            let _ = write!(passages, ", page {page}");
        }
        if let Some(section) = &chunk.section {
            let _ = write!(passages, ", section {section}");
        }
        let _ = writeln!(passages, "\n{}\n", chunk.text);
    }

    let system_prompt = format!(
        "{persona}\n\n{GROUNDED_HEADER} Quote or paraphrase them where they answer the question. \
         If the passages are insufficient, you may fall back to general knowledge, and say that \
         you are doing so.\n\n{passages}"
    );

    AssembledPrompt {
        system_prompt,
        grounded: true,
    }
}
