//! Performance benchmarks for activation cascades and working-memory builds

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rusqlite::Connection;
use uuid::Uuid;

use braid::engine::{cascade, lifecycle, working_memory};
use braid::storage::{queries, Storage};
use braid::tokens::TokenCounter;
use braid::types::*;

fn seed_conversation(conn: &Connection) -> ConversationId {
    let conversation = Conversation {
        id: Uuid::new_v4(),
        owner_id: "bench-owner".to_string(),
        title: "Bench".to_string(),
        status: ConversationStatus::Active,
        process_hint: None,
        parent_conversation_id: None,
        fork_origin_turn_id: None,
        fork_origin_alternative_id: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    queries::insert_conversation(conn, &conversation).unwrap();
    conversation.id
}

/// Build a linear chain of `depth` turns, alternating user and agent, with a
/// second alternative on every turn. Returns the tip turn and its two
/// alternatives.
fn build_chain(
    conn: &Connection,
    conversation_id: ConversationId,
    depth: usize,
) -> (TurnId, AlternativeId, AlternativeId) {
    let mut parent: Option<(TurnId, AlternativeId)> = None;
    let mut tip = None;

    for i in 0..depth {
        let (speaker, producer) = if i % 2 == 0 {
            (Speaker::User, None)
        } else {
            (Speaker::Agent, Some("workflow-bench".to_string()))
        };
        let (turn, alt, _) = lifecycle::create_turn(
            conn,
            lifecycle::NewTurn {
                conversation_id,
                parent_turn_id: parent.map(|(t, _)| t),
                speaker,
                turn_type: TurnType::Message,
                content: format!("benchmark turn {} with a few words of content", i),
                initial_parent_alternative_ref: parent.map(|(_, a)| a),
                producer_ref: producer,
            },
        )
        .unwrap();

        let parent_ref = parent.map(|(_, a)| a);
        let (variant, _) = lifecycle::create_alternative(
            conn,
            turn.id,
            Some("workflow-bench".to_string()),
            parent_ref,
            false,
        )
        .unwrap();

        tip = Some((turn.id, alt.id, variant.id));
        parent = Some((turn.id, alt.id));
    }

    let (turn, active, variant) = tip.unwrap();
    (turn, active, variant)
}

fn bench_cascade(c: &mut Criterion) {
    let mut group = c.benchmark_group("cascade");
    group.throughput(Throughput::Elements(1));

    for depth in [10usize, 50, 200] {
        let storage = Storage::open_in_memory().unwrap();
        let (tip_turn, active, variant) = storage
            .with_transaction(|conn| {
                let conversation_id = seed_conversation(conn);
                Ok(build_chain(conn, conversation_id, depth))
            })
            .unwrap();

        group.bench_with_input(BenchmarkId::new("select_tip", depth), &depth, |b, _| {
            let mut flip = false;
            b.iter(|| {
                // Alternate the selection so every run does real work
                let target = if flip { variant } else { active };
                flip = !flip;
                storage
                    .with_transaction(|conn| {
                        cascade::run_cascade(conn, black_box(tip_turn), black_box(target))
                    })
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_working_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("working_memory");
    group.throughput(Throughput::Elements(1));

    let config = EngineConfig::default();
    let counter = TokenCounter::new(&config.token_model, None).unwrap();

    for depth in [10usize, 50, 200] {
        let storage = Storage::open_in_memory().unwrap();
        let (conversation_id, tip_turn, active) = storage
            .with_transaction(|conn| {
                let conversation_id = seed_conversation(conn);
                let (tip_turn, active, _) = build_chain(conn, conversation_id, depth);
                Ok((conversation_id, tip_turn, active))
            })
            .unwrap();

        group.bench_with_input(BenchmarkId::new("rebuild", depth), &depth, |b, _| {
            b.iter(|| {
                storage
                    .with_transaction(|conn| {
                        working_memory::rebuild_working_memory(
                            conn,
                            &config,
                            &counter,
                            conversation_id,
                            black_box(tip_turn),
                            black_box(active),
                        )
                    })
                    .unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cascade, bench_working_memory);
criterion_main!(benches);
