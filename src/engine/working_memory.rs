//! Working-memory assembly
//!
//! Traverses the active path from a tip back to the root and produces the
//! token-accounted context snapshot handed to downstream processing. The
//! snapshot is immutable: every rebuild replaces the conversation's singleton
//! wholesale, never patches it in place.

use chrono::Utc;
use rusqlite::Connection;

use crate::error::{BraidError, Result};
use crate::storage::queries;
use crate::tokens::TokenCounter;
use crate::types::*;

/// Window boundaries carried by a compression-needed signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionWindow {
    /// Sequence of the oldest turn in the immediate window
    pub window_start: i64,
    /// Sequence of the newest turn in the immediate window
    pub window_end: i64,
}

/// Rebuild the conversation's working-memory snapshot from the given tip.
/// Must run inside a transaction.
///
/// The tip alternative must currently be active on its turn; building memory
/// from a non-active ("preview") tip is a caller error. Returns the stored
/// snapshot plus a compression window when the total exceeds the configured
/// fraction of the token budget - emitting the signal is the caller's job,
/// no action is taken here beyond reporting it.
pub fn rebuild_working_memory(
    conn: &Connection,
    config: &EngineConfig,
    counter: &TokenCounter,
    conversation_id: ConversationId,
    tip_turn_id: TurnId,
    tip_alternative_id: AlternativeId,
) -> Result<(WorkingMemory, Option<CompressionWindow>)> {
    let tip_turn = queries::get_turn(conn, tip_turn_id)?;
    let tip_alternative = queries::get_alternative(conn, tip_alternative_id)?;

    if tip_turn.conversation_id != conversation_id {
        return Err(BraidError::Validation(format!(
            "Turn {} belongs to a different conversation",
            tip_turn_id
        )));
    }
    if tip_alternative.turn_id != tip_turn.id {
        return Err(BraidError::not_found("Alternative", tip_alternative_id));
    }
    if !tip_alternative.is_active {
        return Err(BraidError::Validation(format!(
            "Alternative {} is not active on turn {}; preview tips are not supported",
            tip_alternative_id, tip_turn_id
        )));
    }

    // Walk upward to the root along the recorded parent references.
    let mut walked: Vec<(Turn, Alternative)> = Vec::new();
    let mut turn = tip_turn;
    let mut alternative = tip_alternative;

    loop {
        walked.push((turn.clone(), alternative.clone()));

        let Some(parent_turn_id) = turn.parent_turn_id else {
            break;
        };
        let Some(parent_ref) = alternative.parent_alternative_ref else {
            return Err(BraidError::Integrity(format!(
                "Non-root alternative {} has no parent reference",
                alternative.id
            )));
        };

        let parent_turn = queries::get_turn(conn, parent_turn_id).map_err(|_| {
            BraidError::Integrity(format!(
                "Turn {} references missing parent turn {}",
                turn.id, parent_turn_id
            ))
        })?;
        let parent_alternative = queries::get_alternative(conn, parent_ref).map_err(|_| {
            BraidError::Integrity(format!(
                "Active path references missing alternative {}",
                parent_ref
            ))
        })?;
        if parent_alternative.turn_id != parent_turn.id {
            return Err(BraidError::Integrity(format!(
                "Alternative {} does not belong to parent turn {}",
                parent_ref, parent_turn_id
            )));
        }

        turn = parent_turn;
        alternative = parent_alternative;
    }

    // Root-to-tip order
    walked.reverse();

    // Carry collaborator-owned refs across rebuilds; the path and totals are
    // what this function recomputes.
    let previous = queries::load_working_memory(conn, conversation_id)?;
    let (summary_refs, entity_refs, persona_context_refs) = match previous {
        Some(prev) => (prev.summary_refs, prev.entity_refs, prev.persona_context_refs),
        None => (Vec::new(), Vec::new(), Vec::new()),
    };

    // Turns already covered by an included summary fall out of the window.
    let covered_through = summary_refs
        .iter()
        .filter(|s| s.include)
        .map(|s| s.covered_end)
        .max()
        .unwrap_or(0);

    let mut windowed: Vec<&(Turn, Alternative)> = walked
        .iter()
        .filter(|(t, _)| t.sequence > covered_through)
        .collect();
    if windowed.len() > config.window_size {
        windowed.drain(..windowed.len() - config.window_size);
    }
    if windowed.is_empty() {
        // The tip itself always stays in view
        windowed = walked.iter().rev().take(1).collect();
    }

    let path_tokens: i64 = windowed.iter().map(|(t, _)| counter.count(&t.content)).sum();
    let summary_tokens: i64 = summary_refs
        .iter()
        .filter(|s| s.include)
        .map(|s| s.token_count)
        .sum();
    let entity_tokens: i64 = entity_refs
        .iter()
        .filter(|e| e.include_summary)
        .map(|e| e.token_count)
        .sum();
    let persona_tokens: i64 = persona_context_refs.iter().map(|p| p.token_count).sum();
    let total_tokens = path_tokens + summary_tokens + entity_tokens + persona_tokens;

    let window_start = windowed.first().map(|(t, _)| t.sequence).unwrap_or(0);
    let window_end = windowed.last().map(|(t, _)| t.sequence).unwrap_or(0);

    let immediate_path = windowed
        .iter()
        .map(|(t, a)| PathEntry {
            turn_id: t.id,
            alternative_id: a.id,
            content_ref: a.content_ref.clone(),
        })
        .collect();

    let memory = WorkingMemory {
        conversation_id,
        current_turn_id: tip_turn_id,
        current_alternative_id: tip_alternative_id,
        immediate_path,
        summary_refs,
        entity_refs,
        persona_context_refs,
        total_tokens,
        last_updated: Utc::now(),
    };
    queries::replace_working_memory(conn, &memory)?;

    let threshold = (config.token_budget as f64 * config.compression_trigger) as i64;
    let compression = if total_tokens > threshold {
        tracing::debug!(
            conversation_id = %conversation_id,
            total_tokens,
            threshold,
            "working memory over compression threshold"
        );
        Some(CompressionWindow {
            window_start,
            window_end,
        })
    } else {
        None
    };

    Ok((memory, compression))
}

/// Recompute the token total of a snapshot independently of the stored value.
/// Used by tests and diagnostics to verify the accounting invariant.
pub fn recompute_total_tokens(
    conn: &Connection,
    counter: &TokenCounter,
    memory: &WorkingMemory,
) -> Result<i64> {
    let mut total = 0;
    for entry in &memory.immediate_path {
        let turn = queries::get_turn(conn, entry.turn_id)?;
        total += counter.count(&turn.content);
    }
    total += memory
        .summary_refs
        .iter()
        .filter(|s| s.include)
        .map(|s| s.token_count)
        .sum::<i64>();
    total += memory
        .entity_refs
        .iter()
        .filter(|e| e.include_summary)
        .map(|e| e.token_count)
        .sum::<i64>();
    total += memory
        .persona_context_refs
        .iter()
        .map(|p| p.token_count)
        .sum::<i64>();
    Ok(total)
}
