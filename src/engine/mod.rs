//! Conversation engine
//!
//! The facade over the graph store: alternative lifecycle, activation
//! cascades, content binding, and working-memory assembly, with one logical
//! writer per conversation. Mutations on the same conversation are serialized
//! behind a keyed async lock; different conversations proceed fully in
//! parallel (no cross-conversation references exist).

pub mod binding;
pub mod cache_status;
pub mod cascade;
pub mod lifecycle;
pub mod working_memory;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::error::{BraidError, Result};
use crate::realtime::{EngineEvent, EventBus};
use crate::storage::{queries, Storage};
use crate::tokens::TokenCounter;
use crate::types::*;

pub use binding::BindOutcome;
pub use cascade::CascadeOutcome;
pub use lifecycle::NewTurn;
pub use working_memory::CompressionWindow;

/// Fork provenance for a new conversation, recorded immutably at creation
#[derive(Debug, Clone, Copy)]
pub struct ForkOrigin {
    pub parent_conversation_id: ConversationId,
    pub origin_turn_id: TurnId,
    pub origin_alternative_id: AlternativeId,
}

/// Compression result delivered by the external compression collaborator
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub summary_ref: String,
    /// Covered turn range, by sequence (inclusive)
    pub covered_start: i64,
    pub covered_end: i64,
    pub token_count: i64,
}

/// The conversation engine facade
pub struct ConversationEngine {
    storage: Storage,
    config: EngineConfig,
    counter: TokenCounter,
    events: EventBus,
    writer_locks: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl ConversationEngine {
    /// Create an engine over the given storage
    pub fn new(storage: Storage, config: EngineConfig) -> Result<Self> {
        let counter = TokenCounter::new(&config.token_model, config.token_encoding.as_deref())?;

        Ok(Self {
            storage,
            config,
            counter,
            events: EventBus::default(),
            writer_locks: DashMap::new(),
        })
    }

    /// Subscribe to engine events (selections, bindings, compression signals)
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The single-writer lock for one conversation
    fn writer_lock(&self, conversation_id: ConversationId) -> Arc<Mutex<()>> {
        self.writer_locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn signal_compression(
        &self,
        conversation_id: ConversationId,
        window: Option<CompressionWindow>,
    ) {
        if let Some(window) = window {
            self.events.publish(EngineEvent::compression_needed(
                conversation_id,
                window.window_start,
                window.window_end,
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Conversation lifecycle
    // -----------------------------------------------------------------------

    /// Create a conversation, optionally recording fork provenance
    pub async fn create_conversation(
        &self,
        owner_id: &str,
        title: &str,
        fork: Option<ForkOrigin>,
    ) -> Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            status: ConversationStatus::Active,
            process_hint: None,
            parent_conversation_id: fork.map(|f| f.parent_conversation_id),
            fork_origin_turn_id: fork.map(|f| f.origin_turn_id),
            fork_origin_alternative_id: fork.map(|f| f.origin_alternative_id),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        self.storage.with_transaction(|conn| {
            if let Some(fork) = fork {
                queries::get_conversation(conn, fork.parent_conversation_id)?;
                let origin_turn = queries::get_turn(conn, fork.origin_turn_id)?;
                if origin_turn.conversation_id != fork.parent_conversation_id {
                    return Err(BraidError::Validation(format!(
                        "Fork origin turn {} is not part of conversation {}",
                        fork.origin_turn_id, fork.parent_conversation_id
                    )));
                }
                let origin_alt = queries::get_alternative(conn, fork.origin_alternative_id)?;
                if origin_alt.turn_id != fork.origin_turn_id {
                    return Err(BraidError::Validation(format!(
                        "Fork origin alternative {} is not on turn {}",
                        fork.origin_alternative_id, fork.origin_turn_id
                    )));
                }
            }
            queries::insert_conversation(conn, &conversation)
        })?;

        tracing::info!(conversation_id = %conversation.id, owner_id, "conversation created");
        Ok(conversation)
    }

    /// Fetch a conversation by id
    pub fn get_conversation(&self, conversation_id: ConversationId) -> Result<Conversation> {
        self.storage
            .with_connection(|conn| queries::get_conversation(conn, conversation_id))
    }

    /// List all conversations, newest first
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.storage.with_connection(queries::list_conversations)
    }

    /// Flip the reversible archival flag
    pub async fn set_status(
        &self,
        conversation_id: ConversationId,
        status: ConversationStatus,
    ) -> Result<()> {
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;
        self.storage
            .with_transaction(|conn| queries::set_conversation_status(conn, conversation_id, status))
    }

    /// Update the mutable title
    pub async fn set_title(&self, conversation_id: ConversationId, title: &str) -> Result<()> {
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;
        self.storage
            .with_transaction(|conn| queries::set_conversation_title(conn, conversation_id, title))
    }

    /// Update the advisory process hint (never read for execution)
    pub async fn set_process_hint(
        &self,
        conversation_id: ConversationId,
        hint: Option<&str>,
    ) -> Result<()> {
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;
        self.storage
            .with_transaction(|conn| queries::set_process_hint(conn, conversation_id, hint))
    }

    // -----------------------------------------------------------------------
    // Turn / alternative mutations
    // -----------------------------------------------------------------------

    /// Create a turn plus its first (active) alternative
    pub async fn create_turn(&self, params: NewTurn) -> Result<(Turn, Alternative)> {
        let conversation_id = params.conversation_id;
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;

        let (turn, alternative, compression) = self.storage.with_transaction(|conn| {
            let (turn, alternative, _outcome) = lifecycle::create_turn(conn, params)?;
            let (_, compression) = working_memory::rebuild_working_memory(
                conn,
                &self.config,
                &self.counter,
                conversation_id,
                turn.id,
                alternative.id,
            )?;
            Ok((turn, alternative, compression))
        })?;

        self.events
            .publish(EngineEvent::turn_created(conversation_id, turn.id));
        self.signal_compression(conversation_id, compression);
        Ok((turn, alternative))
    }

    /// Create a new alternative on an existing turn; user edits pass
    /// `producer_ref = None`, agent variants an opaque producer id
    pub async fn create_alternative(
        &self,
        turn_id: TurnId,
        producer_ref: Option<String>,
        parent_alternative_ref: Option<AlternativeId>,
        make_active: bool,
    ) -> Result<Alternative> {
        // conversation_id on a turn is immutable, safe to read outside the lock
        let conversation_id = self
            .storage
            .with_connection(|conn| Ok(queries::get_turn(conn, turn_id)?.conversation_id))?;
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;

        let (alternative, compression) = self.storage.with_transaction(|conn| {
            let (alternative, outcome) = lifecycle::create_alternative(
                conn,
                turn_id,
                producer_ref,
                parent_alternative_ref,
                make_active,
            )?;

            let compression = match outcome {
                Some(outcome) => {
                    let (_, compression) = working_memory::rebuild_working_memory(
                        conn,
                        &self.config,
                        &self.counter,
                        conversation_id,
                        outcome.turn_id,
                        outcome.alternative_id,
                    )?;
                    compression
                }
                None => None,
            };
            Ok((alternative, compression))
        })?;

        self.events.publish(EngineEvent::alternative_created(
            conversation_id,
            turn_id,
            alternative.id,
        ));
        self.signal_compression(conversation_id, compression);
        Ok(alternative)
    }

    /// Make an alternative the active one on its turn, restoring path
    /// coherence across the whole tree
    pub async fn select_alternative(
        &self,
        turn_id: TurnId,
        alternative_id: AlternativeId,
    ) -> Result<()> {
        let conversation_id = self
            .storage
            .with_connection(|conn| Ok(queries::get_turn(conn, turn_id)?.conversation_id))?;
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;

        let (outcome, compression) = self.storage.with_transaction(|conn| {
            let outcome = cascade::run_cascade(conn, turn_id, alternative_id)?;
            let (_, compression) = working_memory::rebuild_working_memory(
                conn,
                &self.config,
                &self.counter,
                conversation_id,
                turn_id,
                alternative_id,
            )?;
            Ok((outcome, compression))
        })?;

        self.events.publish(EngineEvent::alternative_selected(
            conversation_id,
            turn_id,
            alternative_id,
            outcome.ancestors_reverted,
        ));
        self.signal_compression(conversation_id, compression);
        Ok(())
    }

    /// Bind a content reference delivered by the ingestion collaborator
    pub async fn bind_content(
        &self,
        alternative_id: AlternativeId,
        content_ref: &str,
    ) -> Result<Alternative> {
        let conversation_id = self.storage.with_connection(|conn| {
            let alternative = queries::get_alternative(conn, alternative_id)?;
            Ok(queries::get_turn(conn, alternative.turn_id)?.conversation_id)
        })?;
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;

        let (outcome, compression) = self.storage.with_transaction(|conn| {
            let outcome = binding::bind_content(conn, alternative_id, content_ref)?;

            // A fresh binding on the active path changes the snapshot's
            // pending-content picture; rebuild at the stored tip. Binding
            // never moves the view.
            let mut compression = None;
            if outcome.newly_bound && outcome.alternative.is_active {
                if let Some(previous) = queries::load_working_memory(conn, conversation_id)? {
                    let tip = queries::get_alternative(conn, previous.current_alternative_id)?;
                    if tip.is_active {
                        let (_, c) = working_memory::rebuild_working_memory(
                            conn,
                            &self.config,
                            &self.counter,
                            conversation_id,
                            previous.current_turn_id,
                            previous.current_alternative_id,
                        )?;
                        compression = c;
                    }
                }
            }
            Ok((outcome, compression))
        })?;

        if outcome.newly_bound {
            self.events.publish(EngineEvent::content_bound(
                conversation_id,
                alternative_id,
                content_ref,
            ));
        }
        self.signal_compression(conversation_id, compression);
        Ok(outcome.alternative)
    }

    /// Record a producer failure for an alternative created in generating
    /// state. There is no failed binding state: the alternative stays pending
    /// indefinitely and the failure is surfaced to observers only.
    pub fn handle_producer_failure(&self, alternative_id: AlternativeId, reason: &str) {
        tracing::warn!(
            alternative_id = %alternative_id,
            reason,
            "producer failed; alternative remains pending"
        );
        self.events
            .publish(EngineEvent::producer_failed(alternative_id, reason));
    }

    // -----------------------------------------------------------------------
    // Working memory
    // -----------------------------------------------------------------------

    /// The conversation's current snapshot, if one has been built
    pub fn working_memory(&self, conversation_id: ConversationId) -> Result<Option<WorkingMemory>> {
        self.storage
            .with_connection(|conn| queries::load_working_memory(conn, conversation_id))
    }

    /// Rebuild the snapshot at its stored tip
    pub async fn refresh_working_memory(
        &self,
        conversation_id: ConversationId,
    ) -> Result<WorkingMemory> {
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;

        let (memory, compression) = self.storage.with_transaction(|conn| {
            let previous = queries::load_working_memory(conn, conversation_id)?.ok_or_else(|| {
                BraidError::Validation(format!(
                    "Conversation {} has no working memory to refresh",
                    conversation_id
                ))
            })?;
            working_memory::rebuild_working_memory(
                conn,
                &self.config,
                &self.counter,
                conversation_id,
                previous.current_turn_id,
                previous.current_alternative_id,
            )
        })?;

        self.signal_compression(conversation_id, compression);
        Ok(memory)
    }

    /// Apply a compression result from the external collaborator: the summary
    /// joins the snapshot's refs and the covered turns leave the immediate
    /// window
    pub async fn apply_compression_result(
        &self,
        conversation_id: ConversationId,
        result: CompressionResult,
    ) -> Result<WorkingMemory> {
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;

        let (memory, compression) = self.storage.with_transaction(|conn| {
            let mut previous =
                queries::load_working_memory(conn, conversation_id)?.ok_or_else(|| {
                    BraidError::Validation(format!(
                        "Conversation {} has no working memory to compress",
                        conversation_id
                    ))
                })?;

            previous.summary_refs.push(SummaryRef {
                summary_ref: result.summary_ref.clone(),
                covered_start: result.covered_start,
                covered_end: result.covered_end,
                token_count: result.token_count,
                include: true,
            });
            queries::replace_working_memory(conn, &previous)?;

            working_memory::rebuild_working_memory(
                conn,
                &self.config,
                &self.counter,
                conversation_id,
                previous.current_turn_id,
                previous.current_alternative_id,
            )
        })?;

        self.signal_compression(conversation_id, compression);
        Ok(memory)
    }

    /// Insert or update an entity reference attached by the extraction
    /// collaborator, keyed by its ref string
    pub async fn upsert_entity_ref(
        &self,
        conversation_id: ConversationId,
        entity: EntityRef,
    ) -> Result<WorkingMemory> {
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;

        let (memory, compression) = self.storage.with_transaction(|conn| {
            let mut previous =
                queries::load_working_memory(conn, conversation_id)?.ok_or_else(|| {
                    BraidError::Validation(format!(
                        "Conversation {} has no working memory",
                        conversation_id
                    ))
                })?;

            match previous
                .entity_refs
                .iter_mut()
                .find(|e| e.entity_ref == entity.entity_ref)
            {
                Some(existing) => *existing = entity,
                None => previous.entity_refs.push(entity),
            }
            queries::replace_working_memory(conn, &previous)?;

            working_memory::rebuild_working_memory(
                conn,
                &self.config,
                &self.counter,
                conversation_id,
                previous.current_turn_id,
                previous.current_alternative_id,
            )
        })?;

        self.signal_compression(conversation_id, compression);
        Ok(memory)
    }

    /// Replace the persona context references wholesale
    pub async fn set_persona_context(
        &self,
        conversation_id: ConversationId,
        refs: Vec<PersonaContextRef>,
    ) -> Result<WorkingMemory> {
        let lock = self.writer_lock(conversation_id);
        let _guard = lock.lock().await;

        let (memory, compression) = self.storage.with_transaction(|conn| {
            let mut previous =
                queries::load_working_memory(conn, conversation_id)?.ok_or_else(|| {
                    BraidError::Validation(format!(
                        "Conversation {} has no working memory",
                        conversation_id
                    ))
                })?;

            previous.persona_context_refs = refs;
            queries::replace_working_memory(conn, &previous)?;

            working_memory::rebuild_working_memory(
                conn,
                &self.config,
                &self.counter,
                conversation_id,
                previous.current_turn_id,
                previous.current_alternative_id,
            )
        })?;

        self.signal_compression(conversation_id, compression);
        Ok(memory)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Full tree listing: every turn with its alternatives, active flags,
    /// cache status, and derived child linkage
    pub fn tree(&self, conversation_id: ConversationId) -> Result<ConversationTree> {
        self.storage.with_connection(|conn| {
            let conversation = queries::get_conversation(conn, conversation_id)?;
            let turns = queries::turns_of_conversation(conn, conversation_id)?;

            let mut nodes = Vec::with_capacity(turns.len());
            for turn in turns {
                let mut alternatives = Vec::new();
                for alternative in queries::alternatives_of(conn, turn.id)? {
                    let has_children = queries::alternative_has_children(conn, alternative.id)?;
                    alternatives.push(AlternativeNode {
                        alternative,
                        has_children,
                    });
                }
                nodes.push(TurnNode { turn, alternatives });
            }

            Ok(ConversationTree {
                conversation,
                turns: nodes,
            })
        })
    }

    /// Aggregate counts for a conversation
    pub fn stats(&self, conversation_id: ConversationId) -> Result<ConversationStats> {
        self.storage.with_connection(|conn| {
            queries::get_conversation(conn, conversation_id)?;
            queries::conversation_stats(conn, conversation_id)
        })
    }
}
