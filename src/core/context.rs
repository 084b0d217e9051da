//! Sliding context window over previously translated chunks

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::models::TranslatedChunk;

/// Why a context window came out smaller than requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradedReason {
    /// The next candidate would push the window over budget
    OverBudget { chunk_index: u32 },
    /// A predecessor has not been translated yet
    MissingPredecessor { chunk_index: u32 },
    /// The store could not be read
    Unavailable,
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedReason::OverBudget { chunk_index } => {
                write!(f, "chunk {} does not fit the token budget", chunk_index)
            }
            DegradedReason::MissingPredecessor { chunk_index } => {
                write!(f, "chunk {} is not translated", chunk_index)
            }
            DegradedReason::Unavailable => write!(f, "context store unavailable"),
        }
    }
}

/// Preceding translated chunks, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslationContext {
    pub chunks: Vec<TranslatedChunk>,
    /// Context tokens plus the current chunk's tokens
    pub total_tokens: u32,
    pub degraded: Option<DegradedReason>,
}

impl TranslationContext {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn context_tokens(&self) -> u32 {
        self.chunks.iter().map(|c| c.token_count).sum()
    }

    /// Context passages joined for the prompt
    pub fn text(&self) -> Option<String> {
        if self.chunks.is_empty() {
            return None;
        }
        Some(
            self.chunks
                .iter()
                .map(|c| c.translated_text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }

    pub fn indices(&self) -> Vec<u32> {
        self.chunks.iter().map(|c| c.chunk_index).collect()
    }
}

/// Select the longest run of translated chunks immediately before
/// `chunk_index` that fits `max_budget_tokens` together with the current
/// chunk.
///
/// Candidates are visited nearest first, at most `max_chunks` of them. The
/// first candidate that is missing or too large ends the window, so the
/// result is always contiguous and ends at `chunk_index - 1`.
pub fn assemble_context<F>(
    chunk_index: u32,
    current_tokens: u32,
    max_budget_tokens: u32,
    max_chunks: usize,
    mut translated: F,
) -> TranslationContext
where
    F: FnMut(u32) -> Option<TranslatedChunk>,
{
    let mut total = current_tokens;
    let mut selected: Vec<TranslatedChunk> = Vec::new();
    let mut degraded = None;

    let lowest = chunk_index.saturating_sub(max_chunks as u32);
    for index in (lowest..chunk_index).rev() {
        let Some(candidate) = translated(index) else {
            degraded = Some(DegradedReason::MissingPredecessor { chunk_index: index });
            break;
        };
        if candidate.chunk_index != index {
            degraded = Some(DegradedReason::MissingPredecessor { chunk_index: index });
            break;
        }

        let with_candidate = total.saturating_add(candidate.token_count);
        if with_candidate > max_budget_tokens {
            degraded = Some(DegradedReason::OverBudget { chunk_index: index });
            break;
        }

        total = with_candidate;
        selected.push(candidate);
    }

    selected.reverse();
    TranslationContext {
        chunks: selected,
        total_tokens: total,
        degraded,
    }
}
