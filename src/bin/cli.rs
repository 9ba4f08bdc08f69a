//! Braid CLI
//!
//! Command-line interface for conversation tree management.

use clap::{Parser, Subcommand};
use uuid::Uuid;

use braid::engine::{CompressionResult, ForkOrigin, NewTurn};
use braid::error::{BraidError, Result};
use braid::types::*;
use braid::{ConversationEngine, Storage};

#[derive(Parser)]
#[command(name = "braid")]
#[command(about = "Conversation Memory Infrastructure CLI")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(
        long,
        env = "BRAID_DB_PATH",
        default_value = "~/.local/share/braid/conversations.db"
    )]
    db_path: String,

    /// Working-memory window size (turns)
    #[arg(long, env = "BRAID_WINDOW_SIZE", default_value = "10")]
    window_size: usize,

    /// Working-memory token budget
    #[arg(long, env = "BRAID_TOKEN_BUDGET", default_value = "8000")]
    token_budget: usize,

    /// Fraction of the budget that triggers a compression signal
    #[arg(long, env = "BRAID_COMPRESSION_TRIGGER", default_value = "0.8")]
    compression_trigger: f64,

    /// Model used for token counting
    #[arg(long, env = "BRAID_TOKEN_MODEL", default_value = "gpt-4")]
    token_model: String,

    /// Token encoding override (cl100k_base, o200k_base)
    #[arg(long, env = "BRAID_TOKEN_ENCODING")]
    token_encoding: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new conversation
    Create {
        /// Owner identifier
        #[arg(short, long)]
        owner: String,
        /// Conversation title
        title: String,
        /// Fork from this conversation
        #[arg(long, requires_all = ["fork_turn", "fork_alternative"])]
        fork_from: Option<Uuid>,
        /// Fork origin turn
        #[arg(long)]
        fork_turn: Option<Uuid>,
        /// Fork origin alternative
        #[arg(long)]
        fork_alternative: Option<Uuid>,
    },
    /// List conversations
    List,
    /// Show a conversation
    Show {
        /// Conversation ID
        id: Uuid,
    },
    /// Archive a conversation (reversible)
    Archive {
        /// Conversation ID
        id: Uuid,
    },
    /// Unarchive a conversation
    Unarchive {
        /// Conversation ID
        id: Uuid,
    },
    /// Rename a conversation
    Rename {
        /// Conversation ID
        id: Uuid,
        /// New title
        title: String,
    },
    /// Append a turn (with its first alternative)
    AddTurn {
        /// Conversation ID
        #[arg(short, long)]
        conversation: Uuid,
        /// Parent turn (omit for the root turn)
        #[arg(short, long)]
        parent: Option<Uuid>,
        /// Alternative on the parent turn this turn extends
        #[arg(long)]
        parent_alternative: Option<Uuid>,
        /// Speaker (user, agent, system)
        #[arg(short, long, default_value = "user")]
        speaker: String,
        /// Turn type (message, tool_result, summary)
        #[arg(short, long, default_value = "message")]
        r#type: String,
        /// Display content
        content: String,
        /// Producer workflow reference
        #[arg(long)]
        producer: Option<String>,
    },
    /// Add an alternative to an existing turn
    AddAlternative {
        /// Turn ID
        turn: Uuid,
        /// Alternative on the parent turn this alternative extends
        #[arg(long)]
        parent_alternative: Option<Uuid>,
        /// Producer workflow reference (omit for a user edit)
        #[arg(long)]
        producer: Option<String>,
        /// Create without activating
        #[arg(long)]
        inactive: bool,
    },
    /// Select an alternative as active on its turn
    Select {
        /// Turn ID
        turn: Uuid,
        /// Alternative ID
        alternative: Uuid,
    },
    /// Bind a content reference to a pending alternative
    Bind {
        /// Alternative ID
        alternative: Uuid,
        /// Content reference
        content_ref: String,
    },
    /// Show the working-memory snapshot
    Memory {
        /// Conversation ID
        id: Uuid,
    },
    /// Rebuild the working-memory snapshot at its stored tip
    Refresh {
        /// Conversation ID
        id: Uuid,
    },
    /// Record a compression result
    Compress {
        /// Conversation ID
        #[arg(short, long)]
        conversation: Uuid,
        /// Summary content reference
        summary_ref: String,
        /// First covered turn sequence
        #[arg(long)]
        start: i64,
        /// Last covered turn sequence
        #[arg(long)]
        end: i64,
        /// Summary token count
        #[arg(long)]
        tokens: i64,
    },
    /// Print the conversation tree
    Tree {
        /// Conversation ID
        id: Uuid,
    },
    /// Show conversation statistics
    Stats {
        /// Conversation ID
        id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Expand ~ in path
    let db_path = shellexpand::tilde(&cli.db_path).to_string();
    if let Some(dir) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(dir)?;
    }

    let config = EngineConfig {
        window_size: cli.window_size,
        token_budget: cli.token_budget,
        compression_trigger: cli.compression_trigger,
        token_model: cli.token_model.clone(),
        token_encoding: cli.token_encoding.clone(),
    };

    let storage = Storage::open(&db_path)?;
    let engine = ConversationEngine::new(storage, config)?;

    match cli.command {
        Commands::Create {
            owner,
            title,
            fork_from,
            fork_turn,
            fork_alternative,
        } => {
            let fork = match (fork_from, fork_turn, fork_alternative) {
                (Some(parent), Some(turn), Some(alternative)) => Some(ForkOrigin {
                    parent_conversation_id: parent,
                    origin_turn_id: turn,
                    origin_alternative_id: alternative,
                }),
                _ => None,
            };
            let conversation = engine.create_conversation(&owner, &title, fork).await?;
            println!("Created conversation {}", conversation.id);
            println!("{}", serde_json::to_string_pretty(&conversation)?);
        }

        Commands::List => {
            for conversation in engine.list_conversations()? {
                println!(
                    "{} [{}] {} ({})",
                    conversation.id,
                    conversation.status.as_str(),
                    conversation.title,
                    conversation.owner_id
                );
            }
        }

        Commands::Show { id } => {
            let conversation = engine.get_conversation(id)?;
            println!("{}", serde_json::to_string_pretty(&conversation)?);
        }

        Commands::Archive { id } => {
            engine.set_status(id, ConversationStatus::Archived).await?;
            println!("Archived {}", id);
        }

        Commands::Unarchive { id } => {
            engine.set_status(id, ConversationStatus::Active).await?;
            println!("Unarchived {}", id);
        }

        Commands::Rename { id, title } => {
            engine.set_title(id, &title).await?;
            println!("Renamed {}", id);
        }

        Commands::AddTurn {
            conversation,
            parent,
            parent_alternative,
            speaker,
            r#type,
            content,
            producer,
        } => {
            let speaker: Speaker = speaker.parse().map_err(BraidError::Validation)?;
            let turn_type: TurnType = r#type.parse().map_err(BraidError::Validation)?;

            let (turn, alternative) = engine
                .create_turn(NewTurn {
                    conversation_id: conversation,
                    parent_turn_id: parent,
                    speaker,
                    turn_type,
                    content,
                    initial_parent_alternative_ref: parent_alternative,
                    producer_ref: producer,
                })
                .await?;
            println!("Created turn {} (alternative {})", turn.id, alternative.id);
        }

        Commands::AddAlternative {
            turn,
            parent_alternative,
            producer,
            inactive,
        } => {
            let alternative = engine
                .create_alternative(turn, producer, parent_alternative, !inactive)
                .await?;
            println!(
                "Created alternative {} ({})",
                alternative.id,
                if alternative.is_active {
                    "active"
                } else {
                    "inactive"
                }
            );
        }

        Commands::Select { turn, alternative } => {
            engine.select_alternative(turn, alternative).await?;
            println!("Selected {} on turn {}", alternative, turn);
        }

        Commands::Bind {
            alternative,
            content_ref,
        } => {
            let bound = engine.bind_content(alternative, &content_ref).await?;
            println!(
                "Bound {} -> {} (cache: {})",
                bound.id, content_ref, bound.cache_status
            );
        }

        Commands::Memory { id } => match engine.working_memory(id)? {
            Some(memory) => println!("{}", serde_json::to_string_pretty(&memory)?),
            None => println!("No working memory for {}", id),
        },

        Commands::Refresh { id } => {
            let memory = engine.refresh_working_memory(id).await?;
            println!("{}", serde_json::to_string_pretty(&memory)?);
        }

        Commands::Compress {
            conversation,
            summary_ref,
            start,
            end,
            tokens,
        } => {
            let memory = engine
                .apply_compression_result(
                    conversation,
                    CompressionResult {
                        summary_ref,
                        covered_start: start,
                        covered_end: end,
                        token_count: tokens,
                    },
                )
                .await?;
            println!(
                "Applied compression; window now {} turns, {} tokens",
                memory.immediate_path.len(),
                memory.total_tokens
            );
        }

        Commands::Tree { id } => {
            let tree = engine.tree(id)?;
            println!("{} - {}", tree.conversation.id, tree.conversation.title);
            for node in &tree.turns {
                println!(
                    "  turn {} seq={} {} [{}]",
                    node.turn.id,
                    node.turn.sequence,
                    node.turn.speaker.as_str(),
                    node.turn.turn_type.as_str()
                );
                for alt in &node.alternatives {
                    println!(
                        "    alt {} {}{} cache={} binding={}{}",
                        alt.alternative.id,
                        if alt.alternative.is_active { "*" } else { " " },
                        if alt.has_children { "+" } else { " " },
                        alt.alternative.cache_status.as_str(),
                        alt.alternative.binding_state().as_str(),
                        alt.alternative
                            .producer_ref
                            .as_deref()
                            .map(|p| format!(" producer={}", p))
                            .unwrap_or_default()
                    );
                }
            }
        }

        Commands::Stats { id } => {
            let stats = engine.stats(id)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
