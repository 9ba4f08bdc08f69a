//! Activation cascade
//!
//! Restores a single coherent active path after an alternative selection.
//! Three phases run as one atomic unit inside the caller's transaction:
//!
//! 1. Local activation: the target alternative becomes active, its siblings
//!    inactive.
//! 2. Ancestor cascade: walk the recorded parent references up to the root,
//!    re-activating the exact chain the target was produced from. A stale
//!    ancestor choice is reverted even if the user picked it more recently;
//!    the descendant's content only exists relative to that ancestor state.
//! 3. Descendant invalidation: recompute derived cache status across the
//!    affected subtree. Active flags below the target are never touched.

use std::collections::VecDeque;

use rusqlite::Connection;

use crate::engine::cache_status::derive_cache_status;
use crate::error::{BraidError, Result};
use crate::storage::queries;
use crate::types::{AlternativeId, TurnId};

/// Outcome of a cascade, used by the caller to refresh working memory
#[derive(Debug, Clone, Copy)]
pub struct CascadeOutcome {
    /// The turn/alternative the selection targeted
    pub turn_id: TurnId,
    pub alternative_id: AlternativeId,
    /// Number of ancestor turns whose selection was reverted
    pub ancestors_reverted: usize,
}

/// Make the given alternative the active one on its turn and restore path
/// coherence across the whole tree. Must run inside a transaction.
pub fn run_cascade(
    conn: &Connection,
    turn_id: TurnId,
    alternative_id: AlternativeId,
) -> Result<CascadeOutcome> {
    let turn = queries::get_turn(conn, turn_id)?;
    let alternative = queries::get_alternative(conn, alternative_id)?;

    if alternative.turn_id != turn.id {
        return Err(BraidError::not_found("Alternative", alternative_id));
    }

    // Phase 1: local activation
    queries::set_active(conn, turn.id, alternative.id)?;

    // Phase 2: ancestor cascade, upward to the root. Tracks the topmost turn
    // whose selection actually changed so phase 3 can start from there.
    let mut ancestors_reverted = 0;
    let mut invalidation_root = turn.id;
    let mut current_turn = turn.clone();
    let mut required = alternative.parent_alternative_ref;

    loop {
        let Some(parent_turn_id) = current_turn.parent_turn_id else {
            break;
        };
        let Some(required_id) = required else {
            return Err(integrity(format!(
                "Active alternative on non-root turn {} has no parent reference",
                current_turn.id
            )));
        };

        let parent_turn = queries::get_turn(conn, parent_turn_id).map_err(|_| {
            integrity(format!(
                "Turn {} references missing parent turn {}",
                current_turn.id, parent_turn_id
            ))
        })?;

        let required_alt = queries::get_alternative(conn, required_id).map_err(|_| {
            integrity(format!(
                "Active path requires missing alternative {} on turn {}",
                required_id, parent_turn_id
            ))
        })?;

        if required_alt.turn_id != parent_turn.id {
            return Err(integrity(format!(
                "Alternative {} does not belong to parent turn {}",
                required_id, parent_turn_id
            )));
        }

        let previously_active = queries::active_alternative_of(conn, parent_turn.id)?;
        if previously_active.id != required_alt.id {
            queries::set_active(conn, parent_turn.id, required_alt.id)?;
            ancestors_reverted += 1;
            invalidation_root = parent_turn.id;
        }

        required = required_alt.parent_alternative_ref;
        current_turn = parent_turn;
    }

    // Phase 3: descendant invalidation, downward from the topmost turn the
    // cascade touched. Derived status only; is_active is left alone.
    refresh_subtree_status(conn, invalidation_root)?;

    tracing::debug!(
        turn_id = %turn_id,
        alternative_id = %alternative_id,
        ancestors_reverted,
        "activation cascade applied"
    );

    Ok(CascadeOutcome {
        turn_id,
        alternative_id,
        ancestors_reverted,
    })
}

/// Recompute derived cache status for every alternative strictly below
/// `from_turn`, comparing each against its own structural parent's current
/// selection. Iterative breadth-first walk; bounded by subtree size.
pub fn refresh_subtree_status(conn: &Connection, from_turn: TurnId) -> Result<()> {
    let mut queue = VecDeque::from([from_turn]);

    while let Some(current_id) = queue.pop_front() {
        let current_active = queries::active_alternative_of(conn, current_id)?;

        for child in queries::child_turns(conn, current_id)? {
            for alt in queries::alternatives_of(conn, child.id)? {
                let status = derive_cache_status(&child, &alt, Some(&current_active));
                if status != alt.cache_status {
                    queries::set_cache_status(conn, alt.id, status)?;
                }
            }
            queue.push_back(child.id);
        }
    }

    Ok(())
}

fn integrity(message: String) -> BraidError {
    // A broken chain cannot arise through this engine's own API; it means
    // corrupted stored data. Alert, then abort the operation wholesale.
    tracing::error!(error = %message, "conversation graph integrity violation");
    BraidError::Integrity(message)
}
