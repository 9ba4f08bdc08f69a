//! Content binding state machine
//!
//! An alternative's content reference moves through exactly two states:
//! pending (`content_ref = None`) and bound (terminal). Binding arrives
//! asynchronously from the external ingestion collaborator; an alternative
//! may stay pending indefinitely. That is a steady, observable state, never
//! auto-failed or rolled back - the turn's display content is available
//! independent of binding.

use rusqlite::Connection;

use crate::engine::cache_status::derive_cache_status;
use crate::error::{BraidError, Result};
use crate::storage::queries;
use crate::types::{Alternative, AlternativeId};

/// Result of a binding attempt
#[derive(Debug, Clone)]
pub struct BindOutcome {
    pub alternative: Alternative,
    /// False for an idempotent same-ref retry
    pub newly_bound: bool,
}

/// Bind a content reference to an alternative. Must run inside a transaction.
///
/// - pending: the reference is assigned (one-time, then immutable) and the
///   alternative's derived cache status moves out of generating.
/// - already bound with the same ref: no-op success (idempotent retry).
/// - already bound with a different ref: conflict; the original binding is
///   retained.
pub fn bind_content(
    conn: &Connection,
    alternative_id: AlternativeId,
    content_ref: &str,
) -> Result<BindOutcome> {
    let alternative = queries::get_alternative(conn, alternative_id)?;

    match alternative.content_ref.as_deref() {
        None => {
            queries::bind_content_ref(conn, alternative_id, content_ref)?;

            // Binding moves the alternative out of `generating`; re-derive
            // against the parent turn's current selection.
            let bound = queries::get_alternative(conn, alternative_id)?;
            let turn = queries::get_turn(conn, bound.turn_id)?;
            let parent_active = match turn.parent_turn_id {
                Some(parent_turn_id) => {
                    Some(queries::active_alternative_of(conn, parent_turn_id)?)
                }
                None => None,
            };
            let status = derive_cache_status(&turn, &bound, parent_active.as_ref());
            queries::set_cache_status(conn, alternative_id, status)?;

            let alternative = queries::get_alternative(conn, alternative_id)?;
            tracing::debug!(
                alternative_id = %alternative_id,
                content_ref,
                cache_status = %alternative.cache_status,
                "content bound"
            );
            Ok(BindOutcome {
                alternative,
                newly_bound: true,
            })
        }
        Some(existing) if existing == content_ref => Ok(BindOutcome {
            alternative,
            newly_bound: false,
        }),
        Some(existing) => Err(BraidError::Conflict {
            alternative_id,
            existing: existing.to_string(),
            attempted: content_ref.to_string(),
        }),
    }
}
