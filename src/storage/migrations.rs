//! Database migrations for Braid

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < SCHEMA_VERSION {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Initial schema (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Conversations: roots of turn/alternative trees. Archival is a
        -- status flag, never deletion.
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            process_hint TEXT,
            parent_conversation_id TEXT REFERENCES conversations(id),
            fork_origin_turn_id TEXT,
            fork_origin_alternative_id TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Turns: structural positions. parent_turn_id is NULL only for the
        -- conversation root; sequence is depth, shared by sibling turns.
        CREATE TABLE IF NOT EXISTS turns (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            parent_turn_id TEXT REFERENCES turns(id),
            sequence INTEGER NOT NULL,
            speaker TEXT NOT NULL,
            turn_type TEXT NOT NULL DEFAULT 'message',
            content TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Alternatives: competing attempts at filling a turn. Append-only;
        -- only is_active, cache_status, and the one-time content_ref binding
        -- ever change.
        CREATE TABLE IF NOT EXISTS alternatives (
            id TEXT PRIMARY KEY,
            turn_id TEXT NOT NULL REFERENCES turns(id),
            content_ref TEXT,
            producer_ref TEXT,
            parent_alternative_ref TEXT REFERENCES alternatives(id),
            is_active INTEGER NOT NULL DEFAULT 0,
            cache_status TEXT NOT NULL DEFAULT 'generating',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Working-memory snapshots, one per conversation, replaced wholesale.
        -- Ref collections are stored as JSON arrays.
        CREATE TABLE IF NOT EXISTS working_memory (
            conversation_id TEXT PRIMARY KEY REFERENCES conversations(id),
            current_turn_id TEXT NOT NULL,
            current_alternative_id TEXT NOT NULL,
            immediate_path TEXT NOT NULL DEFAULT '[]',
            summary_refs TEXT NOT NULL DEFAULT '[]',
            entity_refs TEXT NOT NULL DEFAULT '[]',
            persona_context_refs TEXT NOT NULL DEFAULT '[]',
            total_tokens INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_turns_parent ON turns(parent_turn_id);
        CREATE INDEX IF NOT EXISTS idx_alternatives_turn ON alternatives(turn_id);
        CREATE INDEX IF NOT EXISTS idx_alternatives_parent_ref ON alternatives(parent_alternative_ref);

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}
