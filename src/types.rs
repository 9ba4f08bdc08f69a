//! Core types for Braid

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation
pub type ConversationId = Uuid;
/// Unique identifier for a turn
pub type TurnId = Uuid;
/// Unique identifier for an alternative
pub type AlternativeId = Uuid;

/// Conversation status (reversible archival flag, never deletion)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            _ => Err(format!("Unknown conversation status: {}", s)),
        }
    }
}

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
    System,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Agent => "agent",
            Speaker::System => "system",
        }
    }

    /// Speaker/turn-type pairing is a closed table. Summaries come from the
    /// compression collaborator (system), tool results from the agent loop.
    pub fn allows(&self, turn_type: TurnType) -> bool {
        matches!(
            (self, turn_type),
            (Speaker::User, TurnType::Message)
                | (Speaker::Agent, TurnType::Message)
                | (Speaker::Agent, TurnType::ToolResult)
                | (Speaker::System, TurnType::Message)
                | (Speaker::System, TurnType::Summary)
        )
    }
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Speaker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Speaker::User),
            "agent" => Ok(Speaker::Agent),
            "system" => Ok(Speaker::System),
            _ => Err(format!("Unknown speaker: {}", s)),
        }
    }
}

/// Structural kind of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnType {
    #[default]
    Message,
    ToolResult,
    Summary,
}

impl TurnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnType::Message => "message",
            TurnType::ToolResult => "tool_result",
            TurnType::Summary => "summary",
        }
    }
}

impl std::fmt::Display for TurnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TurnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "message" => Ok(TurnType::Message),
            "tool_result" => Ok(TurnType::ToolResult),
            "summary" => Ok(TurnType::Summary),
            _ => Err(format!("Unknown turn type: {}", s)),
        }
    }
}

/// Derived validity of an alternative relative to its structural parent's
/// current selection. Non-authoritative: recomputed whenever the active
/// selection upstream changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Valid,
    Stale,
    /// Content not yet bound (content_ref is null)
    #[default]
    Generating,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Valid => "valid",
            CacheStatus::Stale => "stale",
            CacheStatus::Generating => "generating",
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CacheStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "valid" => Ok(CacheStatus::Valid),
            "stale" => Ok(CacheStatus::Stale),
            "generating" => Ok(CacheStatus::Generating),
            _ => Err(format!("Unknown cache status: {}", s)),
        }
    }
}

/// Content binding state, derived from `content_ref`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    /// Awaiting the external ingestion collaborator; may persist indefinitely
    Pending,
    /// Content reference assigned, terminal
    Bound,
}

impl BindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingState::Pending => "pending",
            BindingState::Bound => "bound",
        }
    }
}

impl std::fmt::Display for BindingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A conversation: the root of one turn/alternative tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Owner, fixed at creation
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub status: ConversationStatus,
    /// Advisory processing hint; never read for execution
    pub process_hint: Option<String>,
    /// Fork provenance, set only at creation
    pub parent_conversation_id: Option<ConversationId>,
    pub fork_origin_turn_id: Option<TurnId>,
    pub fork_origin_alternative_id: Option<AlternativeId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A structural position in the conversation tree. Turns never move between
/// conversations and are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub conversation_id: ConversationId,
    /// None only for the conversation's root turn
    pub parent_turn_id: Option<TurnId>,
    /// Depth in the tree: root = 1, otherwise parent.sequence + 1.
    /// Sibling turns share a sequence value.
    pub sequence: i64,
    pub speaker: Speaker,
    pub turn_type: TurnType,
    /// Immutable display text
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn is_root(&self) -> bool {
        self.parent_turn_id.is_none()
    }
}

/// One concrete attempt at filling a turn: a user edit or an agent-produced
/// variant. Created once, never deleted; only `is_active` and the one-time
/// null-to-value transition of `content_ref` ever change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub id: AlternativeId,
    pub turn_id: TurnId,
    /// External episode reference; None until bound, then immutable
    pub content_ref: Option<String>,
    /// None for user-authored alternatives, otherwise an opaque producer id
    pub producer_ref: Option<String>,
    /// For root-turn alternatives this is None; otherwise it references an
    /// alternative on the structural parent turn
    pub parent_alternative_ref: Option<AlternativeId>,
    /// Exactly one true per turn at all times
    pub is_active: bool,
    /// Derived, non-authoritative
    #[serde(default)]
    pub cache_status: CacheStatus,
    pub created_at: DateTime<Utc>,
}

impl Alternative {
    pub fn binding_state(&self) -> BindingState {
        if self.content_ref.is_some() {
            BindingState::Bound
        } else {
            BindingState::Pending
        }
    }
}

/// One step of the active path, root to tip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub turn_id: TurnId,
    pub alternative_id: AlternativeId,
    pub content_ref: Option<String>,
}

/// Summary produced by the external compression collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRef {
    pub summary_ref: String,
    /// Covered turn range, by sequence (inclusive)
    pub covered_start: i64,
    pub covered_end: i64,
    pub token_count: i64,
    #[serde(default = "default_include")]
    pub include: bool,
}

/// Entity reference attached by the external extraction collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_ref: String,
    /// Cached relevance score
    pub relevance: f32,
    #[serde(default)]
    pub include_summary: bool,
    pub token_count: i64,
}

/// Persona context reference, always included in token accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaContextRef {
    pub persona_ref: String,
    pub token_count: i64,
}

fn default_include() -> bool {
    true
}

/// Token-accounted context snapshot assembled from the active path.
/// Singleton per conversation; replaced wholesale on every rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub conversation_id: ConversationId,
    pub current_turn_id: TurnId,
    pub current_alternative_id: AlternativeId,
    /// Root-to-tip active path, windowed to the most recent N turns
    pub immediate_path: Vec<PathEntry>,
    #[serde(default)]
    pub summary_refs: Vec<SummaryRef>,
    #[serde(default)]
    pub entity_refs: Vec<EntityRef>,
    #[serde(default)]
    pub persona_context_refs: Vec<PersonaContextRef>,
    pub total_tokens: i64,
    pub last_updated: DateTime<Utc>,
}

/// One alternative in a tree view, with derived child linkage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativeNode {
    #[serde(flatten)]
    pub alternative: Alternative,
    /// Whether any alternative elsewhere references this one as parent
    pub has_children: bool,
}

/// One turn in a tree view with all of its alternatives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnNode {
    #[serde(flatten)]
    pub turn: Turn,
    pub alternatives: Vec<AlternativeNode>,
}

/// Whole-conversation tree listing for inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTree {
    pub conversation: Conversation,
    pub turns: Vec<TurnNode>,
}

/// Aggregate counts for a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStats {
    pub conversation_id: ConversationId,
    pub turn_count: i64,
    pub alternative_count: i64,
    /// Alternatives still awaiting content binding
    pub pending_bindings: i64,
    pub max_depth: i64,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Most recent N turns retained in the immediate path window
    pub window_size: usize,
    /// Conversation token budget
    pub token_budget: usize,
    /// Fraction of the budget at which a compression-needed signal is emitted
    pub compression_trigger: f64,
    /// Model used for token counting
    pub token_model: String,
    /// Optional encoding override (cl100k_base, o200k_base)
    pub token_encoding: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            token_budget: 8000,
            compression_trigger: 0.8,
            token_model: "gpt-4".to_string(),
            token_encoding: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [ConversationStatus::Active, ConversationStatus::Archived] {
            let parsed: ConversationStatus = status.as_str().parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_cache_status_roundtrip() {
        for status in [
            CacheStatus::Valid,
            CacheStatus::Stale,
            CacheStatus::Generating,
        ] {
            let parsed: CacheStatus = status.as_str().parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_speaker_pairing() {
        assert!(Speaker::User.allows(TurnType::Message));
        assert!(!Speaker::User.allows(TurnType::ToolResult));
        assert!(!Speaker::User.allows(TurnType::Summary));
        assert!(Speaker::Agent.allows(TurnType::ToolResult));
        assert!(!Speaker::Agent.allows(TurnType::Summary));
        assert!(Speaker::System.allows(TurnType::Summary));
        assert!(!Speaker::System.allows(TurnType::ToolResult));
    }

    #[test]
    fn test_binding_state_text() {
        assert_eq!(BindingState::Pending.as_str(), "pending");
        assert_eq!(BindingState::Bound.as_str(), "bound");
        assert_eq!(BindingState::Bound.to_string(), "bound");
    }

    #[test]
    fn test_binding_state() {
        let mut alt = Alternative {
            id: Uuid::new_v4(),
            turn_id: Uuid::new_v4(),
            content_ref: None,
            producer_ref: None,
            parent_alternative_ref: None,
            is_active: true,
            cache_status: CacheStatus::Generating,
            created_at: Utc::now(),
        };
        assert_eq!(alt.binding_state(), BindingState::Pending);
        alt.content_ref = Some("ep-1".to_string());
        assert_eq!(alt.binding_state(), BindingState::Bound);
    }
}
