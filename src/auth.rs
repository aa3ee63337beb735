use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::{GameContent, SessionEntry};

/// What the gateway needs to know about a session before attaching anyone.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub supervisor_id: String,
    pub game: GameContent,
}

/// Resolves participant credentials. The supervising adult carries a
/// durable session cookie; the learner carries a link token and never
/// needs an account.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a supervisor identity from a session-cookie value.
    async fn resolve_supervisor(&self, cookie: &str) -> Option<String>;

    /// Validate a learner link token against a session. The token is bound
    /// to exactly that one session.
    async fn admit_learner(&self, session_id: &str, token: &str) -> bool;
}

/// Looks up session records for ownership checks and game selection.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn lookup(&self, session_id: &str) -> Option<SessionInfo>;
}

struct SessionRecord {
    entry: SessionEntry,
    spec: GameContent,
}

/// Config-file-backed resolver and directory. Stands in for the relational
/// store behind the real deployment.
pub struct ConfigAuth {
    sessions: HashMap<String, SessionRecord>,
}

impl ConfigAuth {
    /// Join session entries with their content. Entries pointing at missing
    /// content are logged and skipped.
    pub fn new(entries: Vec<SessionEntry>, content: HashMap<String, GameContent>) -> Self {
        let mut sessions = HashMap::new();
        for entry in entries {
            match content.get(&entry.content) {
                Some(spec) => {
                    sessions.insert(
                        entry.id.clone(),
                        SessionRecord {
                            spec: spec.clone(),
                            entry,
                        },
                    );
                }
                None => {
                    tracing::error!(
                        session = %entry.id,
                        content = %entry.content,
                        "session references unknown content, skipping"
                    );
                }
            }
        }
        Self { sessions }
    }
}

#[async_trait]
impl IdentityResolver for ConfigAuth {
    async fn resolve_supervisor(&self, cookie: &str) -> Option<String> {
        self.sessions
            .values()
            .find(|record| record.entry.supervisor_cookie == cookie)
            .map(|record| record.entry.supervisor_id.clone())
    }

    async fn admit_learner(&self, session_id: &str, token: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|record| record.entry.learner_token == token)
    }
}

#[async_trait]
impl SessionDirectory for ConfigAuth {
    async fn lookup(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|record| SessionInfo {
            supervisor_id: record.entry.supervisor_id.clone(),
            game: record.spec.clone(),
        })
    }
}
