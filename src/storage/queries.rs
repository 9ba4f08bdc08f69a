//! Database queries for the conversation graph
//!
//! All functions operate on a borrowed connection so composite operations can
//! run under one transaction owned by the caller.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::error::{BraidError, Result};
use crate::types::*;

fn parse_uuid(idx: usize, s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_uuid(idx: usize, s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    s.map(|s| parse_uuid(idx, s)).transpose()
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// Parse a conversation from a database row
pub fn conversation_from_row(row: &Row) -> rusqlite::Result<Conversation> {
    let id: String = row.get("id")?;
    let status_str: String = row.get("status")?;
    let parent: Option<String> = row.get("parent_conversation_id")?;
    let origin_turn: Option<String> = row.get("fork_origin_turn_id")?;
    let origin_alt: Option<String> = row.get("fork_origin_alternative_id")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Conversation {
        id: parse_uuid(0, id)?,
        owner_id: row.get("owner_id")?,
        title: row.get("title")?,
        status: status_str.parse().unwrap_or_default(),
        process_hint: row.get("process_hint")?,
        parent_conversation_id: parse_opt_uuid(5, parent)?,
        fork_origin_turn_id: parse_opt_uuid(6, origin_turn)?,
        fork_origin_alternative_id: parse_opt_uuid(7, origin_alt)?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const CONVERSATION_COLS: &str = "id, owner_id, title, status, process_hint, \
     parent_conversation_id, fork_origin_turn_id, fork_origin_alternative_id, \
     created_at, updated_at";

/// Insert a conversation record
pub fn insert_conversation(conn: &Connection, conversation: &Conversation) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (id, owner_id, title, status, process_hint,
            parent_conversation_id, fork_origin_turn_id, fork_origin_alternative_id,
            created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            conversation.id.to_string(),
            conversation.owner_id,
            conversation.title,
            conversation.status.as_str(),
            conversation.process_hint,
            conversation.parent_conversation_id.map(|id| id.to_string()),
            conversation.fork_origin_turn_id.map(|id| id.to_string()),
            conversation
                .fork_origin_alternative_id
                .map(|id| id.to_string()),
            conversation.created_at.to_rfc3339(),
            conversation.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Fetch a conversation by id
pub fn get_conversation(conn: &Connection, id: ConversationId) -> Result<Conversation> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM conversations WHERE id = ?",
        CONVERSATION_COLS
    ))?;

    stmt.query_row(params![id.to_string()], conversation_from_row)
        .map_err(|_| BraidError::not_found("Conversation", id))
}

/// List all conversations, newest first
pub fn list_conversations(conn: &Connection) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM conversations ORDER BY created_at DESC",
        CONVERSATION_COLS
    ))?;

    let rows = stmt.query_map([], conversation_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Update the mutable status flag
pub fn set_conversation_status(
    conn: &Connection,
    id: ConversationId,
    status: ConversationStatus,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE conversations SET status = ?, updated_at = ? WHERE id = ?",
        params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
    )?;
    if updated == 0 {
        return Err(BraidError::not_found("Conversation", id));
    }
    Ok(())
}

/// Update the mutable title
pub fn set_conversation_title(conn: &Connection, id: ConversationId, title: &str) -> Result<()> {
    let updated = conn.execute(
        "UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?",
        params![title, Utc::now().to_rfc3339(), id.to_string()],
    )?;
    if updated == 0 {
        return Err(BraidError::not_found("Conversation", id));
    }
    Ok(())
}

/// Update the advisory process hint
pub fn set_process_hint(
    conn: &Connection,
    id: ConversationId,
    hint: Option<&str>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE conversations SET process_hint = ?, updated_at = ? WHERE id = ?",
        params![hint, Utc::now().to_rfc3339(), id.to_string()],
    )?;
    if updated == 0 {
        return Err(BraidError::not_found("Conversation", id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

/// Parse a turn from a database row
pub fn turn_from_row(row: &Row) -> rusqlite::Result<Turn> {
    let id: String = row.get("id")?;
    let conversation_id: String = row.get("conversation_id")?;
    let parent_turn_id: Option<String> = row.get("parent_turn_id")?;
    let speaker_str: String = row.get("speaker")?;
    let turn_type_str: String = row.get("turn_type")?;
    let created_at: String = row.get("created_at")?;

    Ok(Turn {
        id: parse_uuid(0, id)?,
        conversation_id: parse_uuid(1, conversation_id)?,
        parent_turn_id: parse_opt_uuid(2, parent_turn_id)?,
        sequence: row.get("sequence")?,
        speaker: speaker_str.parse().unwrap_or(Speaker::System),
        turn_type: turn_type_str.parse().unwrap_or_default(),
        content: row.get("content")?,
        created_at: parse_datetime(&created_at),
    })
}

const TURN_COLS: &str =
    "id, conversation_id, parent_turn_id, sequence, speaker, turn_type, content, created_at";

/// Insert a turn record
pub fn insert_turn(conn: &Connection, turn: &Turn) -> Result<()> {
    conn.execute(
        "INSERT INTO turns (id, conversation_id, parent_turn_id, sequence,
            speaker, turn_type, content, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            turn.id.to_string(),
            turn.conversation_id.to_string(),
            turn.parent_turn_id.map(|id| id.to_string()),
            turn.sequence,
            turn.speaker.as_str(),
            turn.turn_type.as_str(),
            turn.content,
            turn.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Fetch a turn by id
pub fn get_turn(conn: &Connection, id: TurnId) -> Result<Turn> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {} FROM turns WHERE id = ?", TURN_COLS))?;

    stmt.query_row(params![id.to_string()], turn_from_row)
        .map_err(|_| BraidError::not_found("Turn", id))
}

/// Structural children of a turn (turns whose parent_turn_id equals this id)
pub fn child_turns(conn: &Connection, turn_id: TurnId) -> Result<Vec<Turn>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM turns WHERE parent_turn_id = ? ORDER BY created_at",
        TURN_COLS
    ))?;

    let rows = stmt.query_map(params![turn_id.to_string()], turn_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// All turns of a conversation, shallowest first
pub fn turns_of_conversation(
    conn: &Connection,
    conversation_id: ConversationId,
) -> Result<Vec<Turn>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM turns WHERE conversation_id = ? ORDER BY sequence, created_at",
        TURN_COLS
    ))?;

    let rows = stmt.query_map(params![conversation_id.to_string()], turn_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// The conversation's root turn, if one exists yet
pub fn root_turn(conn: &Connection, conversation_id: ConversationId) -> Result<Option<Turn>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM turns WHERE conversation_id = ? AND parent_turn_id IS NULL",
        TURN_COLS
    ))?;

    let mut rows = stmt.query_map(params![conversation_id.to_string()], turn_from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Alternatives
// ---------------------------------------------------------------------------

/// Parse an alternative from a database row
pub fn alternative_from_row(row: &Row) -> rusqlite::Result<Alternative> {
    let id: String = row.get("id")?;
    let turn_id: String = row.get("turn_id")?;
    let parent_ref: Option<String> = row.get("parent_alternative_ref")?;
    let is_active: i32 = row.get("is_active")?;
    let cache_status_str: String = row.get("cache_status")?;
    let created_at: String = row.get("created_at")?;

    Ok(Alternative {
        id: parse_uuid(0, id)?,
        turn_id: parse_uuid(1, turn_id)?,
        content_ref: row.get("content_ref")?,
        producer_ref: row.get("producer_ref")?,
        parent_alternative_ref: parse_opt_uuid(4, parent_ref)?,
        is_active: is_active != 0,
        cache_status: cache_status_str.parse().unwrap_or_default(),
        created_at: parse_datetime(&created_at),
    })
}

const ALTERNATIVE_COLS: &str = "id, turn_id, content_ref, producer_ref, \
     parent_alternative_ref, is_active, cache_status, created_at";

/// Insert an alternative record
pub fn insert_alternative(conn: &Connection, alternative: &Alternative) -> Result<()> {
    conn.execute(
        "INSERT INTO alternatives (id, turn_id, content_ref, producer_ref,
            parent_alternative_ref, is_active, cache_status, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            alternative.id.to_string(),
            alternative.turn_id.to_string(),
            alternative.content_ref,
            alternative.producer_ref,
            alternative.parent_alternative_ref.map(|id| id.to_string()),
            alternative.is_active as i32,
            alternative.cache_status.as_str(),
            alternative.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Fetch an alternative by id
pub fn get_alternative(conn: &Connection, id: AlternativeId) -> Result<Alternative> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM alternatives WHERE id = ?",
        ALTERNATIVE_COLS
    ))?;

    stmt.query_row(params![id.to_string()], alternative_from_row)
        .map_err(|_| BraidError::not_found("Alternative", id))
}

/// All alternatives of a turn, in creation (append) order
pub fn alternatives_of(conn: &Connection, turn_id: TurnId) -> Result<Vec<Alternative>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM alternatives WHERE turn_id = ? ORDER BY created_at, id",
        ALTERNATIVE_COLS
    ))?;

    let rows = stmt.query_map(params![turn_id.to_string()], alternative_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// The single active alternative of a turn
///
/// Every turn has exactly one active alternative; a turn without one is
/// corrupted stored data, reported as an integrity error.
pub fn active_alternative_of(conn: &Connection, turn_id: TurnId) -> Result<Alternative> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM alternatives WHERE turn_id = ? AND is_active = 1",
        ALTERNATIVE_COLS
    ))?;

    stmt.query_row(params![turn_id.to_string()], alternative_from_row)
        .map_err(|_| {
            BraidError::Integrity(format!("Turn {} has no active alternative", turn_id))
        })
}

/// Activate one alternative on a turn, deactivating all of its siblings
pub fn set_active(conn: &Connection, turn_id: TurnId, alternative_id: AlternativeId) -> Result<()> {
    conn.execute(
        "UPDATE alternatives SET is_active = 0 WHERE turn_id = ? AND id != ?",
        params![turn_id.to_string(), alternative_id.to_string()],
    )?;
    let updated = conn.execute(
        "UPDATE alternatives SET is_active = 1 WHERE turn_id = ? AND id = ?",
        params![turn_id.to_string(), alternative_id.to_string()],
    )?;
    if updated == 0 {
        return Err(BraidError::not_found("Alternative", alternative_id));
    }
    Ok(())
}

/// Store the derived cache status for an alternative
pub fn set_cache_status(
    conn: &Connection,
    alternative_id: AlternativeId,
    status: CacheStatus,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE alternatives SET cache_status = ? WHERE id = ?",
        params![status.as_str(), alternative_id.to_string()],
    )?;
    if updated == 0 {
        return Err(BraidError::not_found("Alternative", alternative_id));
    }
    Ok(())
}

/// One-time content binding write; caller enforces the state machine
pub fn bind_content_ref(
    conn: &Connection,
    alternative_id: AlternativeId,
    content_ref: &str,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE alternatives SET content_ref = ? WHERE id = ? AND content_ref IS NULL",
        params![content_ref, alternative_id.to_string()],
    )?;
    if updated == 0 {
        return Err(BraidError::not_found("Alternative", alternative_id));
    }
    Ok(())
}

/// Whether any alternative references this one as its parent
pub fn alternative_has_children(conn: &Connection, alternative_id: AlternativeId) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT EXISTS(SELECT 1 FROM alternatives WHERE parent_alternative_ref = ?)",
    )?;
    let exists: i32 = stmt.query_row(params![alternative_id.to_string()], |row| row.get(0))?;
    Ok(exists != 0)
}

// ---------------------------------------------------------------------------
// Working memory
// ---------------------------------------------------------------------------

/// Parse a working-memory snapshot from a database row
pub fn working_memory_from_row(row: &Row) -> rusqlite::Result<WorkingMemory> {
    let conversation_id: String = row.get("conversation_id")?;
    let current_turn_id: String = row.get("current_turn_id")?;
    let current_alternative_id: String = row.get("current_alternative_id")?;
    let immediate_path: String = row.get("immediate_path")?;
    let summary_refs: String = row.get("summary_refs")?;
    let entity_refs: String = row.get("entity_refs")?;
    let persona_refs: String = row.get("persona_context_refs")?;
    let last_updated: String = row.get("last_updated")?;

    Ok(WorkingMemory {
        conversation_id: parse_uuid(0, conversation_id)?,
        current_turn_id: parse_uuid(1, current_turn_id)?,
        current_alternative_id: parse_uuid(2, current_alternative_id)?,
        immediate_path: serde_json::from_str(&immediate_path).unwrap_or_default(),
        summary_refs: serde_json::from_str(&summary_refs).unwrap_or_default(),
        entity_refs: serde_json::from_str(&entity_refs).unwrap_or_default(),
        persona_context_refs: serde_json::from_str(&persona_refs).unwrap_or_default(),
        total_tokens: row.get("total_tokens")?,
        last_updated: parse_datetime(&last_updated),
    })
}

/// Load the conversation's snapshot, if one has been built
pub fn load_working_memory(
    conn: &Connection,
    conversation_id: ConversationId,
) -> Result<Option<WorkingMemory>> {
    let mut stmt = conn.prepare_cached(
        "SELECT conversation_id, current_turn_id, current_alternative_id,
                immediate_path, summary_refs, entity_refs, persona_context_refs,
                total_tokens, last_updated
         FROM working_memory WHERE conversation_id = ?",
    )?;

    let mut rows = stmt.query_map(params![conversation_id.to_string()], working_memory_from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

/// Replace the conversation's snapshot wholesale
pub fn replace_working_memory(conn: &Connection, memory: &WorkingMemory) -> Result<()> {
    conn.execute(
        "INSERT INTO working_memory (conversation_id, current_turn_id,
            current_alternative_id, immediate_path, summary_refs, entity_refs,
            persona_context_refs, total_tokens, last_updated)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(conversation_id) DO UPDATE SET
            current_turn_id = excluded.current_turn_id,
            current_alternative_id = excluded.current_alternative_id,
            immediate_path = excluded.immediate_path,
            summary_refs = excluded.summary_refs,
            entity_refs = excluded.entity_refs,
            persona_context_refs = excluded.persona_context_refs,
            total_tokens = excluded.total_tokens,
            last_updated = excluded.last_updated",
        params![
            memory.conversation_id.to_string(),
            memory.current_turn_id.to_string(),
            memory.current_alternative_id.to_string(),
            serde_json::to_string(&memory.immediate_path)?,
            serde_json::to_string(&memory.summary_refs)?,
            serde_json::to_string(&memory.entity_refs)?,
            serde_json::to_string(&memory.persona_context_refs)?,
            memory.total_tokens,
            memory.last_updated.to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Aggregate counts for a conversation
pub fn conversation_stats(
    conn: &Connection,
    conversation_id: ConversationId,
) -> Result<ConversationStats> {
    let id = conversation_id.to_string();

    let (turn_count, max_depth): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(MAX(sequence), 0) FROM turns WHERE conversation_id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let (alternative_count, pending_bindings): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN a.content_ref IS NULL THEN 1 ELSE 0 END), 0)
         FROM alternatives a JOIN turns t ON a.turn_id = t.id
         WHERE t.conversation_id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(ConversationStats {
        conversation_id,
        turn_count,
        alternative_count,
        pending_bindings,
        max_depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn test_conversation() -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            owner_id: "owner-1".to_string(),
            title: "Test".to_string(),
            status: ConversationStatus::Active,
            process_hint: None,
            parent_conversation_id: None,
            fork_origin_turn_id: None,
            fork_origin_alternative_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_conversation_roundtrip() {
        let storage = Storage::open_in_memory().unwrap();
        let conversation = test_conversation();

        storage
            .with_connection(|conn| {
                insert_conversation(conn, &conversation)?;
                let loaded = get_conversation(conn, conversation.id)?;
                assert_eq!(loaded.owner_id, "owner-1");
                assert_eq!(loaded.status, ConversationStatus::Active);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_get_missing_conversation() {
        let storage = Storage::open_in_memory().unwrap();
        let result =
            storage.with_connection(|conn| get_conversation(conn, Uuid::new_v4()));
        assert!(matches!(
            result,
            Err(BraidError::NotFound {
                entity: "Conversation",
                ..
            })
        ));
    }

    #[test]
    fn test_set_active_flips_siblings() {
        let storage = Storage::open_in_memory().unwrap();
        let conversation = test_conversation();

        storage
            .with_connection(|conn| {
                insert_conversation(conn, &conversation)?;

                let turn = Turn {
                    id: Uuid::new_v4(),
                    conversation_id: conversation.id,
                    parent_turn_id: None,
                    sequence: 1,
                    speaker: Speaker::User,
                    turn_type: TurnType::Message,
                    content: "hi".to_string(),
                    created_at: Utc::now(),
                };
                insert_turn(conn, &turn)?;

                let a = Alternative {
                    id: Uuid::new_v4(),
                    turn_id: turn.id,
                    content_ref: None,
                    producer_ref: None,
                    parent_alternative_ref: None,
                    is_active: true,
                    cache_status: CacheStatus::Valid,
                    created_at: Utc::now(),
                };
                let b = Alternative {
                    id: Uuid::new_v4(),
                    is_active: false,
                    ..a.clone()
                };
                insert_alternative(conn, &a)?;
                insert_alternative(conn, &b)?;

                set_active(conn, turn.id, b.id)?;

                let active = active_alternative_of(conn, turn.id)?;
                assert_eq!(active.id, b.id);

                let all = alternatives_of(conn, turn.id)?;
                assert_eq!(all.iter().filter(|alt| alt.is_active).count(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_bind_content_ref_only_when_null() {
        let storage = Storage::open_in_memory().unwrap();
        let conversation = test_conversation();

        storage
            .with_connection(|conn| {
                insert_conversation(conn, &conversation)?;
                let turn = Turn {
                    id: Uuid::new_v4(),
                    conversation_id: conversation.id,
                    parent_turn_id: None,
                    sequence: 1,
                    speaker: Speaker::User,
                    turn_type: TurnType::Message,
                    content: "hi".to_string(),
                    created_at: Utc::now(),
                };
                insert_turn(conn, &turn)?;

                let alt = Alternative {
                    id: Uuid::new_v4(),
                    turn_id: turn.id,
                    content_ref: None,
                    producer_ref: None,
                    parent_alternative_ref: None,
                    is_active: true,
                    cache_status: CacheStatus::Generating,
                    created_at: Utc::now(),
                };
                insert_alternative(conn, &alt)?;

                bind_content_ref(conn, alt.id, "ep-1")?;
                let bound = get_alternative(conn, alt.id)?;
                assert_eq!(bound.content_ref.as_deref(), Some("ep-1"));

                // Guarded write refuses a second binding
                assert!(bind_content_ref(conn, alt.id, "ep-2").is_err());
                let still = get_alternative(conn, alt.id)?;
                assert_eq!(still.content_ref.as_deref(), Some("ep-1"));
                Ok(())
            })
            .unwrap();
    }
}
