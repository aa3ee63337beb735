use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::protocol::GameSummary;

/// Errors surfaced by the outcome store. Never forwarded to clients; the
/// room logs them and keeps its in-memory state authoritative.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// One immutable scored-attempt fact. Sequence numbers are strictly
/// increasing per session with no gaps, across reconnect cycles.
#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub therapy_session_id: String,
    pub seq: u32,
    pub correct: bool,
    pub note: String,
    pub at: DateTime<Utc>,
}

/// Narrow port to the relational store. The store itself is an external
/// collaborator; rooms call this fire-and-forget after broadcasting.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn record_trial(&self, trial: TrialRecord) -> Result<(), PersistError>;
    async fn record_summary(&self, summary: GameSummary) -> Result<(), PersistError>;
}

/// Default sink: emits structured log records for downstream ingestion.
pub struct TracingSink;

#[async_trait]
impl OutcomeSink for TracingSink {
    async fn record_trial(&self, trial: TrialRecord) -> Result<(), PersistError> {
        tracing::info!(
            session = %trial.therapy_session_id,
            seq = trial.seq,
            correct = trial.correct,
            note = %trial.note,
            "trial recorded"
        );
        Ok(())
    }

    async fn record_summary(&self, summary: GameSummary) -> Result<(), PersistError> {
        tracing::info!(
            session = %summary.therapy_session_id,
            attempts = summary.attempts,
            correct = summary.correct_attempts,
            duration = summary.duration_seconds,
            "game summary recorded"
        );
        Ok(())
    }
}

/// In-memory sink for tests and local development.
#[derive(Default)]
pub struct MemorySink {
    pub trials: std::sync::Mutex<Vec<TrialRecord>>,
    pub summaries: std::sync::Mutex<Vec<GameSummary>>,
}

#[async_trait]
impl OutcomeSink for MemorySink {
    async fn record_trial(&self, trial: TrialRecord) -> Result<(), PersistError> {
        self.trials.lock().unwrap().push(trial);
        Ok(())
    }

    async fn record_summary(&self, summary: GameSummary) -> Result<(), PersistError> {
        self.summaries.lock().unwrap().push(summary);
        Ok(())
    }
}
