//! Cache-status derivation
//!
//! Pure rule computing an alternative's validity relative to its structural
//! parent's current selection. Callers resolve the parent turn's active
//! alternative so the function itself touches no storage; it is re-evaluated
//! by every operation that changes which alternative is active on a turn.

use crate::types::{Alternative, CacheStatus, Speaker, Turn};

/// Derive the cache status of `alternative` on `turn`.
///
/// `parent_active` is the active alternative of the turn's structural parent,
/// or None when the turn is the conversation root.
///
/// - User turns are never stale relative to themselves.
/// - Unbound content is still generating.
/// - Root turns have nothing upstream to be stale against.
/// - Otherwise the recorded parent reference must match the parent turn's
///   current selection.
pub fn derive_cache_status(
    turn: &Turn,
    alternative: &Alternative,
    parent_active: Option<&Alternative>,
) -> CacheStatus {
    if turn.speaker == Speaker::User {
        return CacheStatus::Valid;
    }

    if alternative.content_ref.is_none() {
        return CacheStatus::Generating;
    }

    if turn.parent_turn_id.is_none() {
        return CacheStatus::Valid;
    }

    match parent_active {
        Some(parent) if alternative.parent_alternative_ref == Some(parent.id) => CacheStatus::Valid,
        _ => CacheStatus::Stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TurnType;
    use chrono::Utc;
    use uuid::Uuid;

    fn turn(speaker: Speaker, parent: Option<Uuid>) -> Turn {
        Turn {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            parent_turn_id: parent,
            sequence: if parent.is_some() { 2 } else { 1 },
            speaker,
            turn_type: TurnType::Message,
            content: "content".to_string(),
            created_at: Utc::now(),
        }
    }

    fn alternative(turn_id: Uuid, content_ref: Option<&str>, parent_ref: Option<Uuid>) -> Alternative {
        Alternative {
            id: Uuid::new_v4(),
            turn_id,
            content_ref: content_ref.map(|s| s.to_string()),
            producer_ref: Some("producer-1".to_string()),
            parent_alternative_ref: parent_ref,
            is_active: false,
            cache_status: CacheStatus::Generating,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn user_turns_are_always_valid() {
        let t = turn(Speaker::User, Some(Uuid::new_v4()));
        let a = alternative(t.id, None, Some(Uuid::new_v4()));
        assert_eq!(derive_cache_status(&t, &a, None), CacheStatus::Valid);
    }

    #[test]
    fn unbound_content_is_generating() {
        let t = turn(Speaker::Agent, Some(Uuid::new_v4()));
        let a = alternative(t.id, None, Some(Uuid::new_v4()));
        assert_eq!(derive_cache_status(&t, &a, None), CacheStatus::Generating);
    }

    #[test]
    fn root_turn_is_valid_once_bound() {
        let t = turn(Speaker::Agent, None);
        let a = alternative(t.id, Some("ep-1"), None);
        assert_eq!(derive_cache_status(&t, &a, None), CacheStatus::Valid);
    }

    #[test]
    fn matching_parent_selection_is_valid() {
        let parent_turn = turn(Speaker::User, None);
        let parent_active = alternative(parent_turn.id, None, None);
        let t = turn(Speaker::Agent, Some(parent_turn.id));
        let a = alternative(t.id, Some("ep-1"), Some(parent_active.id));
        assert_eq!(
            derive_cache_status(&t, &a, Some(&parent_active)),
            CacheStatus::Valid
        );
    }

    #[test]
    fn mismatched_parent_selection_is_stale() {
        let parent_turn = turn(Speaker::User, None);
        let parent_active = alternative(parent_turn.id, None, None);
        let t = turn(Speaker::Agent, Some(parent_turn.id));
        let a = alternative(t.id, Some("ep-1"), Some(Uuid::new_v4()));
        assert_eq!(
            derive_cache_status(&t, &a, Some(&parent_active)),
            CacheStatus::Stale
        );
    }
}
