pub mod choice;
pub mod matching;

use crate::protocol::{ClientMsg, Role, RoleScores, ServerMsg, VariantView};

pub use choice::{ChoiceGame, Prompt, PromptOption};
pub use matching::{CardPair, MatchGame};

/// Rejection reasons for gameplay messages. Every rejection is replied to
/// the sender only and leaves game state untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("game is not active")]
    NotActive,
    #[error("it is not your turn")]
    NotYourTurn,
    #[error("the {0} role may not perform this action")]
    WrongRole(Role),
    #[error("this prompt has already been answered")]
    AlreadyAnswered,
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("unknown card: {0}")]
    UnknownCard(String),
    #[error("card {0} is already matched")]
    AlreadyMatched(String),
    #[error("card {0} is already flipped")]
    AlreadyFlipped(String),
    #[error("two cards are already face up")]
    TooManyFlipped,
    #[error("two flipped cards are required for a match check")]
    NotEnoughFlipped,
    #[error("the check does not reference the flipped cards")]
    StaleCheck,
    #[error("cannot end the turn with cards face up")]
    FlipsPending,
    #[error("this message does not apply to the current game")]
    UnsupportedMove,
}

impl GameError {
    /// Stable wire code carried in `error` replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotActive => "not-active",
            Self::NotYourTurn => "not-your-turn",
            Self::WrongRole(_) => "wrong-role",
            Self::AlreadyAnswered => "already-answered",
            Self::UnknownOption(_) => "unknown-option",
            Self::UnknownCard(_) => "unknown-card",
            Self::AlreadyMatched(_) => "already-matched",
            Self::AlreadyFlipped(_) => "already-flipped",
            Self::TooManyFlipped => "too-many-flipped",
            Self::NotEnoughFlipped => "not-enough-flipped",
            Self::StaleCheck => "stale-check",
            Self::FlipsPending => "flips-pending",
            Self::UnsupportedMove => "unsupported-move",
        }
    }
}

/// A scored attempt produced by an accepted move. The room turns this into
/// a trial record with its own session-wide sequence number.
#[derive(Debug, Clone)]
pub struct Scored {
    pub correct: bool,
    pub note: String,
}

/// Result of an accepted move: outcome notifications to broadcast, an
/// optional scored attempt, and labels for the summary's event log.
#[derive(Debug, Default)]
pub struct MoveOutcome {
    pub events: Vec<ServerMsg>,
    pub scored: Option<Scored>,
    pub log: Vec<String>,
}

/// Capability interface the room uses to drive a mini-game. Implementations
/// validate first and mutate only on acceptance.
pub trait GameRules: Send + 'static {
    /// Apply one gameplay message for the given role.
    fn apply(&mut self, role: Role, msg: &ClientMsg) -> Result<MoveOutcome, GameError>;

    /// Whether all prompts/cards are exhausted.
    fn is_complete(&self) -> bool;

    /// Who may act next, if the game is turn-based.
    fn current_player(&self) -> Option<Role>;

    fn attempts(&self) -> u32;

    fn correct_attempts(&self) -> u32;

    /// Per-role score breakdown for the summary.
    fn scores(&self) -> RoleScores;

    /// Variant-specific slice of the full-state snapshot.
    fn view(&self) -> VariantView;
}
