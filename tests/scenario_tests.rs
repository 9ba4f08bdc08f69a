//! End-to-end scenarios over the conversation engine
//!
//! Each test drives the public facade the way a hosting agent runtime would:
//! turns arrive, producers bind content asynchronously, users edit and
//! regenerate, and working memory tracks the active path throughout.
//!
//! Run with: cargo test --test scenario_tests

use braid::engine::{CompressionResult, NewTurn};
use braid::realtime::EventType;
use braid::tokens::TokenCounter;
use braid::types::*;
use braid::{ConversationEngine, Storage};

fn engine_with(config: EngineConfig) -> ConversationEngine {
    let storage = Storage::open_in_memory().unwrap();
    ConversationEngine::new(storage, config).unwrap()
}

fn engine() -> ConversationEngine {
    engine_with(EngineConfig::default())
}

async fn add_user_turn(
    engine: &ConversationEngine,
    conversation: ConversationId,
    parent: Option<(TurnId, AlternativeId)>,
    content: &str,
) -> (Turn, Alternative) {
    engine
        .create_turn(NewTurn {
            conversation_id: conversation,
            parent_turn_id: parent.map(|(t, _)| t),
            speaker: Speaker::User,
            turn_type: TurnType::Message,
            content: content.to_string(),
            initial_parent_alternative_ref: parent.map(|(_, a)| a),
            producer_ref: None,
        })
        .await
        .unwrap()
}

async fn add_agent_turn(
    engine: &ConversationEngine,
    conversation: ConversationId,
    parent: (TurnId, AlternativeId),
    content: &str,
) -> (Turn, Alternative) {
    engine
        .create_turn(NewTurn {
            conversation_id: conversation,
            parent_turn_id: Some(parent.0),
            speaker: Speaker::Agent,
            turn_type: TurnType::Message,
            content: content.to_string(),
            initial_parent_alternative_ref: Some(parent.1),
            producer_ref: Some("workflow-main".to_string()),
        })
        .await
        .unwrap()
}

fn active_of(tree: &ConversationTree, turn_id: TurnId) -> Alternative {
    let node = tree.turns.iter().find(|t| t.turn.id == turn_id).unwrap();
    let active: Vec<_> = node
        .alternatives
        .iter()
        .filter(|a| a.alternative.is_active)
        .collect();
    assert_eq!(active.len(), 1, "turn {} must have one active", turn_id);
    active[0].alternative.clone()
}

#[tokio::test]
async fn test_linear_conversation_respects_window() {
    let engine = engine();
    let conversation = engine
        .create_conversation("owner-1", "Linear", None)
        .await
        .unwrap();

    let mut tip = None;
    let mut contents = Vec::new();
    for i in 0..14 {
        let content = format!("turn number {} of the linear conversation", i);
        let (turn, alt) = add_user_turn(&engine, conversation.id, tip, &content).await;
        tip = Some((turn.id, alt.id));
        contents.push(content);
    }

    let memory = engine.working_memory(conversation.id).unwrap().unwrap();
    assert_eq!(memory.immediate_path.len(), 10);
    assert_eq!(memory.current_turn_id, tip.unwrap().0);
    assert_eq!(
        memory.immediate_path.last().unwrap().alternative_id,
        tip.unwrap().1
    );

    // Totals come from the windowed content, nothing else
    let counter = TokenCounter::new("gpt-4", None).unwrap();
    let expected: i64 = contents[4..].iter().map(|c| counter.count(c)).sum();
    assert_eq!(memory.total_tokens, expected);
}

#[tokio::test]
async fn test_regeneration_leaves_one_active() {
    let engine = engine();
    let conversation = engine
        .create_conversation("owner-1", "Regen", None)
        .await
        .unwrap();

    let (root, root_alt) = add_user_turn(&engine, conversation.id, None, "question").await;
    let (reply, first) =
        add_agent_turn(&engine, conversation.id, (root.id, root_alt.id), "answer").await;
    engine.bind_content(first.id, "ep-1").await.unwrap();

    // Regenerate: a second producer alternative, activated on creation
    let second = engine
        .create_alternative(
            reply.id,
            Some("workflow-retry".to_string()),
            Some(root_alt.id),
            true,
        )
        .await
        .unwrap();

    let tree = engine.tree(conversation.id).unwrap();
    let active = active_of(&tree, reply.id);
    assert_eq!(active.id, second.id);

    // Selecting the original flips it back, still exactly one active
    engine.select_alternative(reply.id, first.id).await.unwrap();
    let tree = engine.tree(conversation.id).unwrap();
    assert_eq!(active_of(&tree, reply.id).id, first.id);
}

#[tokio::test]
async fn test_root_edit_then_deep_selection_restores_path() {
    let engine = engine();
    let conversation = engine
        .create_conversation("owner-1", "Deep", None)
        .await
        .unwrap();

    let (root, a1) = add_user_turn(&engine, conversation.id, None, "first question").await;
    let (reply, b1) =
        add_agent_turn(&engine, conversation.id, (root.id, a1.id), "first answer").await;
    engine.bind_content(b1.id, "ep-b1").await.unwrap();
    let (follow, c1) =
        add_user_turn(&engine, conversation.id, Some((reply.id, b1.id)), "follow-up").await;

    // Editing the root invalidates everything downstream of the old wording
    let a2 = engine
        .create_alternative(root.id, None, None, true)
        .await
        .unwrap();
    let tree = engine.tree(conversation.id).unwrap();
    assert_eq!(active_of(&tree, root.id).id, a2.id);
    let b1_now = tree
        .turns
        .iter()
        .find(|t| t.turn.id == reply.id)
        .unwrap()
        .alternatives
        .iter()
        .find(|a| a.alternative.id == b1.id)
        .unwrap();
    assert_eq!(b1_now.alternative.cache_status, CacheStatus::Stale);

    // Jumping back to the deep follow-up reverts the whole ancestor chain
    engine.select_alternative(follow.id, c1.id).await.unwrap();
    let tree = engine.tree(conversation.id).unwrap();
    assert_eq!(active_of(&tree, root.id).id, a1.id);
    assert_eq!(active_of(&tree, reply.id).id, b1.id);
    assert_eq!(active_of(&tree, follow.id).id, c1.id);

    // The restored chain is coherent again
    let b1_now = active_of(&tree, reply.id);
    assert_eq!(b1_now.cache_status, CacheStatus::Valid);

    // Working memory follows the restored path
    let memory = engine.working_memory(conversation.id).unwrap().unwrap();
    assert_eq!(memory.current_turn_id, follow.id);
    let path_turns: Vec<_> = memory.immediate_path.iter().map(|e| e.turn_id).collect();
    assert_eq!(path_turns, vec![root.id, reply.id, follow.id]);
}

#[tokio::test]
async fn test_unbound_alternative_stays_generating_through_invalidation() {
    let engine = engine();
    let conversation = engine
        .create_conversation("owner-1", "Pending", None)
        .await
        .unwrap();

    let (root, a1) = add_user_turn(&engine, conversation.id, None, "question").await;
    let (reply, b1) =
        add_agent_turn(&engine, conversation.id, (root.id, a1.id), "answer").await;

    // Unbound producer output reads as generating
    let tree = engine.tree(conversation.id).unwrap();
    assert_eq!(active_of(&tree, reply.id).cache_status, CacheStatus::Generating);

    // Invalidation cannot demote it to stale while unbound
    engine
        .create_alternative(root.id, None, None, true)
        .await
        .unwrap();
    let tree = engine.tree(conversation.id).unwrap();
    assert_eq!(active_of(&tree, reply.id).cache_status, CacheStatus::Generating);

    // Binding resolves it against the current (mismatched) selection
    engine.bind_content(b1.id, "ep-b1").await.unwrap();
    let tree = engine.tree(conversation.id).unwrap();
    assert_eq!(active_of(&tree, reply.id).cache_status, CacheStatus::Stale);
}

#[tokio::test]
async fn test_user_authored_alternative_is_always_valid() {
    let engine = engine();
    let conversation = engine
        .create_conversation("owner-1", "UserValid", None)
        .await
        .unwrap();

    let (root, _) = add_user_turn(&engine, conversation.id, None, "hello").await;

    // No producer ref, no binding, still valid
    let tree = engine.tree(conversation.id).unwrap();
    let alt = active_of(&tree, root.id);
    assert!(alt.producer_ref.is_none());
    assert_eq!(alt.binding_state(), BindingState::Pending);
    assert_eq!(alt.cache_status, CacheStatus::Valid);
}

#[tokio::test]
async fn test_compression_cycle() {
    let engine = engine_with(EngineConfig {
        token_budget: 30,
        compression_trigger: 0.5,
        window_size: 10,
        ..Default::default()
    });
    let mut rx = engine.subscribe();

    let conversation = engine
        .create_conversation("owner-1", "Compress", None)
        .await
        .unwrap();

    let mut tip = None;
    for i in 0..6 {
        let (turn, alt) = add_user_turn(
            &engine,
            conversation.id,
            tip,
            &format!("message {} with enough words to add up", i),
        )
        .await;
        tip = Some((turn.id, alt.id));
    }

    // The engine asked for compression at some point
    let mut window = None;
    while let Ok(event) = rx.try_recv() {
        if event.event_type == EventType::CompressionNeeded {
            let data = event.data.clone().unwrap();
            window = Some((
                data["window_start"].as_i64().unwrap(),
                data["window_end"].as_i64().unwrap(),
            ));
        }
    }
    let (start, end) = window.expect("compression signal expected");
    assert!(start >= 1 && end >= start);

    // The collaborator summarizes everything but the newest turn
    let memory = engine
        .apply_compression_result(
            conversation.id,
            CompressionResult {
                summary_ref: "summary-1".to_string(),
                covered_start: start,
                covered_end: end - 1,
                token_count: 5,
            },
        )
        .await
        .unwrap();

    assert_eq!(memory.summary_refs.len(), 1);
    // Covered turns left the window; only sequences past the summary remain
    assert_eq!(memory.immediate_path.len(), 1);

    // Summary tokens are part of the total
    let counter = TokenCounter::new("gpt-4", None).unwrap();
    let tip_tokens = counter.count("message 5 with enough words to add up");
    assert_eq!(memory.total_tokens, tip_tokens + 5);
}

#[tokio::test]
async fn test_entity_and_persona_refs_count_toward_total() {
    let engine = engine();
    let conversation = engine
        .create_conversation("owner-1", "Refs", None)
        .await
        .unwrap();
    add_user_turn(&engine, conversation.id, None, "hello").await;

    let base = engine
        .working_memory(conversation.id)
        .unwrap()
        .unwrap()
        .total_tokens;

    let memory = engine
        .upsert_entity_ref(
            conversation.id,
            EntityRef {
                entity_ref: "entity-42".to_string(),
                relevance: 0.9,
                include_summary: true,
                token_count: 17,
            },
        )
        .await
        .unwrap();
    assert_eq!(memory.total_tokens, base + 17);

    // Excluded entities keep their ref but drop out of the accounting
    let memory = engine
        .upsert_entity_ref(
            conversation.id,
            EntityRef {
                entity_ref: "entity-42".to_string(),
                relevance: 0.9,
                include_summary: false,
                token_count: 17,
            },
        )
        .await
        .unwrap();
    assert_eq!(memory.entity_refs.len(), 1);
    assert_eq!(memory.total_tokens, base);

    let memory = engine
        .set_persona_context(
            conversation.id,
            vec![PersonaContextRef {
                persona_ref: "persona-1".to_string(),
                token_count: 9,
            }],
        )
        .await
        .unwrap();
    assert_eq!(memory.total_tokens, base + 9);
}

#[tokio::test]
async fn test_bind_retry_and_conflict_through_facade() {
    let engine = engine();
    let conversation = engine
        .create_conversation("owner-1", "Bind", None)
        .await
        .unwrap();
    let (root, a1) = add_user_turn(&engine, conversation.id, None, "question").await;
    let (_, b1) = add_agent_turn(&engine, conversation.id, (root.id, a1.id), "answer").await;

    let bound = engine.bind_content(b1.id, "ep-1").await.unwrap();
    assert_eq!(bound.content_ref.as_deref(), Some("ep-1"));

    // Redelivery of the same ref is a quiet success
    let retry = engine.bind_content(b1.id, "ep-1").await.unwrap();
    assert_eq!(retry.content_ref.as_deref(), Some("ep-1"));

    // A different ref is rejected and the original survives
    let conflict = engine.bind_content(b1.id, "ep-2").await;
    assert!(matches!(
        conflict,
        Err(braid::BraidError::Conflict { .. })
    ));
    let tree = engine.tree(conversation.id).unwrap();
    assert_eq!(
        active_of(&tree, bound.turn_id).content_ref.as_deref(),
        Some("ep-1")
    );
}

#[tokio::test]
async fn test_state_survives_reopen() {
    use pretty_assertions::assert_eq;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("braid.db");
    let db_path = db_path.to_str().unwrap();

    let (conversation_id, reply_id, first_id) = {
        let storage = Storage::open(db_path).unwrap();
        let engine = ConversationEngine::new(storage, EngineConfig::default()).unwrap();

        let conversation = engine
            .create_conversation("owner-1", "Durable", None)
            .await
            .unwrap();
        let (root, a1) = add_user_turn(&engine, conversation.id, None, "question").await;
        let (reply, b1) =
            add_agent_turn(&engine, conversation.id, (root.id, a1.id), "answer").await;
        engine.bind_content(b1.id, "ep-1").await.unwrap();
        (conversation.id, reply.id, b1.id)
    };

    let storage = Storage::open(db_path).unwrap();
    let engine = ConversationEngine::new(storage, EngineConfig::default()).unwrap();

    let tree = engine.tree(conversation_id).unwrap();
    let active = active_of(&tree, reply_id);
    assert_eq!(active.id, first_id);
    assert_eq!(active.content_ref.as_deref(), Some("ep-1"));
    assert_eq!(active.cache_status, CacheStatus::Valid);

    let memory = engine.working_memory(conversation_id).unwrap().unwrap();
    assert_eq!(memory.immediate_path.len(), 2);
}

#[tokio::test]
async fn test_second_root_turn_rejected() {
    let engine = engine();
    let conversation = engine
        .create_conversation("owner-1", "OneRoot", None)
        .await
        .unwrap();
    add_user_turn(&engine, conversation.id, None, "first root").await;

    let result = engine
        .create_turn(NewTurn {
            conversation_id: conversation.id,
            parent_turn_id: None,
            speaker: Speaker::User,
            turn_type: TurnType::Message,
            content: "second root".to_string(),
            initial_parent_alternative_ref: None,
            producer_ref: None,
        })
        .await;
    assert!(matches!(result, Err(braid::BraidError::Validation(_))));
}

#[tokio::test]
async fn test_speaker_turn_type_pairing_enforced() {
    let engine = engine();
    let conversation = engine
        .create_conversation("owner-1", "Pairing", None)
        .await
        .unwrap();

    let result = engine
        .create_turn(NewTurn {
            conversation_id: conversation.id,
            parent_turn_id: None,
            speaker: Speaker::User,
            turn_type: TurnType::ToolResult,
            content: "not a thing a user sends".to_string(),
            initial_parent_alternative_ref: None,
            producer_ref: None,
        })
        .await;
    assert!(matches!(result, Err(braid::BraidError::Validation(_))));
}
