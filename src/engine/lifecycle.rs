//! Alternative lifecycle: creation of turns and alternatives
//!
//! User edits and agent regenerations go through the same entry point; the
//! only difference is `producer_ref` (None for user-authored content).

use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

use crate::engine::cache_status::derive_cache_status;
use crate::engine::cascade::{run_cascade, CascadeOutcome};
use crate::error::{BraidError, Result};
use crate::storage::queries;
use crate::types::*;

/// Parameters for creating a turn plus its first alternative
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub conversation_id: ConversationId,
    /// None for the conversation's root turn
    pub parent_turn_id: Option<TurnId>,
    pub speaker: Speaker,
    pub turn_type: TurnType,
    pub content: String,
    /// Required for non-root turns: the alternative on the parent turn this
    /// turn was produced under
    pub initial_parent_alternative_ref: Option<AlternativeId>,
    /// Producer of the first alternative; None for user-authored turns
    pub producer_ref: Option<String>,
}

/// Create a new alternative on an existing turn. Must run inside a
/// transaction.
///
/// The alternative starts unbound (`content_ref = None`) and inactive, with
/// its cache status derived up front; when `make_active` is set the
/// activation cascade runs as a single atomic follow-on step.
pub fn create_alternative(
    conn: &Connection,
    turn_id: TurnId,
    producer_ref: Option<String>,
    parent_alternative_ref: Option<AlternativeId>,
    make_active: bool,
) -> Result<(Alternative, Option<CascadeOutcome>)> {
    let turn = queries::get_turn(conn, turn_id)?;

    validate_parentage(conn, &turn, parent_alternative_ref)?;

    let mut alternative = Alternative {
        id: Uuid::new_v4(),
        turn_id: turn.id,
        content_ref: None,
        producer_ref,
        parent_alternative_ref,
        is_active: false,
        cache_status: CacheStatus::Generating,
        created_at: Utc::now(),
    };
    // Unbound content derives without consulting the parent selection
    alternative.cache_status = derive_cache_status(&turn, &alternative, None);
    queries::insert_alternative(conn, &alternative)?;

    let outcome = if make_active {
        Some(run_cascade(conn, turn.id, alternative.id)?)
    } else {
        None
    };

    let alternative = queries::get_alternative(conn, alternative.id)?;
    Ok((alternative, outcome))
}

/// Create a turn plus its first alternative. Must run inside a transaction.
///
/// The first alternative is always activated; a brand-new turn's selection is
/// coherent by construction.
pub fn create_turn(conn: &Connection, params: NewTurn) -> Result<(Turn, Alternative, CascadeOutcome)> {
    queries::get_conversation(conn, params.conversation_id)?;

    if !params.speaker.allows(params.turn_type) {
        return Err(BraidError::Validation(format!(
            "Speaker '{}' cannot produce turn type '{}'",
            params.speaker, params.turn_type
        )));
    }

    let sequence = match params.parent_turn_id {
        Some(parent_id) => {
            let parent = queries::get_turn(conn, parent_id)?;
            if parent.conversation_id != params.conversation_id {
                return Err(BraidError::Validation(format!(
                    "Parent turn {} belongs to a different conversation",
                    parent_id
                )));
            }
            parent.sequence + 1
        }
        None => {
            if queries::root_turn(conn, params.conversation_id)?.is_some() {
                return Err(BraidError::Validation(format!(
                    "Conversation {} already has a root turn",
                    params.conversation_id
                )));
            }
            1
        }
    };

    let turn = Turn {
        id: Uuid::new_v4(),
        conversation_id: params.conversation_id,
        parent_turn_id: params.parent_turn_id,
        sequence,
        speaker: params.speaker,
        turn_type: params.turn_type,
        content: params.content,
        created_at: Utc::now(),
    };
    queries::insert_turn(conn, &turn)?;

    let (alternative, outcome) = create_alternative(
        conn,
        turn.id,
        params.producer_ref,
        params.initial_parent_alternative_ref,
        true,
    )?;

    let outcome = outcome.ok_or_else(|| {
        BraidError::Internal("activation cascade missing for new turn".to_string())
    })?;
    Ok((turn, alternative, outcome))
}

/// Root-turn alternatives must have no parent reference; alternatives on any
/// other turn must reference an existing alternative on that specific parent
/// turn.
fn validate_parentage(
    conn: &Connection,
    turn: &Turn,
    parent_alternative_ref: Option<AlternativeId>,
) -> Result<()> {
    match (turn.parent_turn_id, parent_alternative_ref) {
        (None, None) => Ok(()),
        (None, Some(parent_ref)) => Err(BraidError::Validation(format!(
            "Alternative on root turn {} must not reference parent alternative {}",
            turn.id, parent_ref
        ))),
        (Some(parent_turn_id), None) => Err(BraidError::Validation(format!(
            "Alternative on turn {} requires a parent alternative on turn {}",
            turn.id, parent_turn_id
        ))),
        (Some(parent_turn_id), Some(parent_ref)) => {
            let parent_alt = queries::get_alternative(conn, parent_ref).map_err(|_| {
                BraidError::Validation(format!(
                    "Parent alternative {} does not exist",
                    parent_ref
                ))
            })?;
            if parent_alt.turn_id != parent_turn_id {
                return Err(BraidError::Validation(format!(
                    "Parent alternative {} belongs to turn {}, not to parent turn {}",
                    parent_ref, parent_alt.turn_id, parent_turn_id
                )));
            }
            Ok(())
        }
    }
}
