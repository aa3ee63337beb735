use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two participants of a game session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Supervisor,
    Learner,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Supervisor => Role::Learner,
            Role::Learner => Role::Supervisor,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supervisor => write!(f, "supervisor"),
            Self::Learner => write!(f, "learner"),
        }
    }
}

/// All possible game states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameStatus {
    Uninitialized,
    Waiting,
    Active,
    Paused,
    Completed,
}

impl std::fmt::Display for GameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

// ─── Close codes ──────────────────────────────────────────────────

/// WebSocket close codes used for policy rejections. Clients must treat
/// these as terminal for the connection attempt: only abnormal closures
/// are retried.
pub mod close {
    pub const INVALID_SESSION: u16 = 4001;
    pub const INVALID_ROLE: u16 = 4002;
    pub const CREDENTIAL_REJECTED: u16 = 4003;
    pub const OWNERSHIP_MISMATCH: u16 = 4004;
    pub const SUPERSEDED: u16 = 4005;
    pub const INTERNAL: u16 = 4010;

    pub fn is_policy(code: u16) -> bool {
        (4000..5000).contains(&code)
    }
}

// ─── Client → server ──────────────────────────────────────────────

/// Messages sent from clients to the server via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMsg {
    #[serde(rename_all = "camelCase")]
    JoinGame {
        therapy_session_id: String,
        role: Role,
    },

    // Learner / turn-owner moves
    #[serde(rename_all = "camelCase")]
    SelectOption { option_id: String },
    #[serde(rename_all = "camelCase")]
    FlipCard { card_id: String },
    #[serde(rename_all = "camelCase")]
    CheckMatch { card1_id: String, card2_id: String },
    EndTurn,

    // Supervisor-only control
    NextPrompt,
    PauseGame,
    ResumeGame,
    EndGame,
}

/// The wire envelope for client messages. The `player` field is present
/// only in this direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(flatten)]
    pub msg: ClientMsg,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<Role>,
}

impl ClientEnvelope {
    pub fn new(msg: ClientMsg, player: Role) -> Self {
        Self {
            msg,
            timestamp: Utc::now(),
            player: Some(player),
        }
    }
}

// ─── Server → client ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceKind {
    Word,
    Picture,
}

/// One side of a matchable pair as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardFace {
    pub kind: FaceKind,
    pub value: String,
}

/// Client-visible card: the face is revealed only while flipped or matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardView {
    pub id: String,
    pub flipped: bool,
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face: Option<CardFace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionView {
    pub id: String,
    pub label: String,
}

/// A prompt as shown to clients. Never carries the solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptView {
    pub id: String,
    pub text: String,
    pub options: Vec<OptionView>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleScores {
    pub supervisor: u32,
    pub learner: u32,
}

/// Variant-specific slice of the full-state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "game", rename_all = "kebab-case")]
pub enum VariantView {
    #[serde(rename_all = "camelCase")]
    Choice {
        prompt: Option<PromptView>,
        prompt_index: usize,
        total_prompts: usize,
    },
    #[serde(rename_all = "camelCase")]
    Match {
        cards: Vec<CardView>,
        matched_pairs: usize,
        total_pairs: usize,
        scores: RoleScores,
    },
}

/// Full game snapshot, broadcast on join, after every accepted mutation,
/// and as the sole resync mechanism after reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub status: GameStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_player: Option<Role>,
    pub attempts: u32,
    pub correct_attempts: u32,
    #[serde(flatten)]
    pub view: VariantView,
}

/// Terminal aggregate of a completed game. Broadcast once in
/// `game-completed` and persisted through the outcome sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub therapy_session_id: String,
    pub attempts: u32,
    pub correct_attempts: u32,
    pub scores: RoleScores,
    pub duration_seconds: i64,
    pub completed_at: DateTime<Utc>,
    pub events: Vec<String>,
}

/// Messages sent from the server to clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMsg {
    GameState(GameSnapshot),
    #[serde(rename_all = "camelCase")]
    AnswerResult {
        option_id: String,
        correct: bool,
        attempts: u32,
        correct_attempts: u32,
    },
    #[serde(rename_all = "camelCase")]
    MatchResult {
        card1_id: String,
        card2_id: String,
        correct: bool,
    },
    #[serde(rename_all = "camelCase")]
    CardFlipped { card_id: String, face: CardFace },
    #[serde(rename_all = "camelCase")]
    TurnChanged {
        current_player: Role,
        reason: String,
    },
    NewPrompt { prompt: PromptView },
    GamePaused,
    GameResumed,
    GameCompleted { summary: GameSummary },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMsg {
    /// Wire name of the message type, used for subscription dispatch.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::GameState(_) => "game-state",
            Self::AnswerResult { .. } => "answer-result",
            Self::MatchResult { .. } => "match-result",
            Self::CardFlipped { .. } => "card-flipped",
            Self::TurnChanged { .. } => "turn-changed",
            Self::NewPrompt { .. } => "new-prompt",
            Self::GamePaused => "game-paused",
            Self::GameResumed => "game-resumed",
            Self::GameCompleted { .. } => "game-completed",
            Self::Error { .. } => "error",
        }
    }
}

/// The wire envelope for server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(flatten)]
    pub msg: ServerMsg,
    pub timestamp: DateTime<Utc>,
}

impl ServerEnvelope {
    pub fn new(msg: ServerMsg) -> Self {
        Self {
            msg,
            timestamp: Utc::now(),
        }
    }
}
