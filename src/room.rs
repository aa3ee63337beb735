use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::persist::{OutcomeSink, TrialRecord};
use crate::protocol::{
    ClientMsg, GameSnapshot, GameStatus, GameSummary, Role, ServerEnvelope, ServerMsg, close,
};
use crate::rules::{GameError, GameRules};

/// Frames pushed to a connection's forwarding task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Msg(ServerEnvelope),
    Close { code: u16, reason: &'static str },
}

/// One live connection bound to a role. At most one per role, ever.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

/// Commands the gateway sends to a room task.
#[derive(Debug)]
pub enum RoomCommand {
    Attach { role: Role, conn: Connection },
    Detach { role: Role, conn_id: String },
    Handle { role: Role, msg: ClientMsg },
}

#[derive(Clone)]
pub struct RoomHandle {
    pub session_id: String,
    pub cmd_tx: mpsc::Sender<RoomCommand>,
}

/// Process-wide map from therapy-session id to its live room.
pub struct Registry {
    rooms: DashMap<String, RoomHandle>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
        })
    }

    /// Idempotent lookup-or-spawn keyed by session id. The rules factory
    /// runs only when the room does not exist yet.
    pub fn get_or_create(
        self: &Arc<Self>,
        session_id: &str,
        rules: impl FnOnce() -> Box<dyn GameRules>,
        sink: Arc<dyn OutcomeSink>,
    ) -> RoomHandle {
        self.rooms
            .entry(session_id.to_string())
            .or_insert_with(|| spawn_room(self.clone(), session_id.to_string(), rules(), sink))
            .clone()
    }

    pub fn remove(&self, session_id: &str) {
        self.rooms.remove(session_id);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.rooms.contains_key(session_id)
    }
}

/// The authoritative state of one game session. Mutated only inside the
/// room task's command loop, one command at a time.
struct GameRoom {
    session_id: String,
    status: GameStatus,
    rules: Box<dyn GameRules>,
    conns: HashMap<Role, Connection>,
    seq: u32,
    events: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    last_activity: Instant,
    sink: Arc<dyn OutcomeSink>,
}

fn spawn_room(
    registry: Arc<Registry>,
    session_id: String,
    rules: Box<dyn GameRules>,
    sink: Arc<dyn OutcomeSink>,
) -> RoomHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let room = GameRoom {
        session_id: session_id.clone(),
        status: GameStatus::Uninitialized,
        rules,
        conns: HashMap::new(),
        seq: 0,
        events: Vec::new(),
        started_at: None,
        last_activity: Instant::now(),
        sink,
    };
    tokio::spawn(room_task(room, cmd_rx, registry));
    tracing::info!(session = %session_id, "room created");
    RoomHandle { session_id, cmd_tx }
}

async fn room_task(
    mut room: GameRoom,
    mut cmd_rx: mpsc::Receiver<RoomCommand>,
    registry: Arc<Registry>,
) {
    // The rule variant was bound at creation; accept participants.
    room.status = GameStatus::Waiting;

    while let Some(cmd) = cmd_rx.recv().await {
        room.last_activity = Instant::now();
        match cmd {
            RoomCommand::Attach { role, conn } => room.attach(role, conn),
            RoomCommand::Detach { role, conn_id } => {
                room.detach(role, &conn_id);
                if room.conns.is_empty() {
                    break;
                }
            }
            RoomCommand::Handle { role, msg } => room.handle(role, msg),
        }
    }

    registry.remove(&room.session_id);
    tracing::info!(
        session = %room.session_id,
        idle_ms = room.last_activity.elapsed().as_millis() as u64,
        "room destroyed"
    );
}

impl GameRoom {
    fn attach(&mut self, role: Role, conn: Connection) {
        if let Some(old) = self.conns.insert(role, conn) {
            let _ = old.tx.send(Outbound::Close {
                code: close::SUPERSEDED,
                reason: "superseded",
            });
            tracing::info!(session = %self.session_id, %role, "connection superseded");
        }
        tracing::info!(session = %self.session_id, %role, "participant attached");

        if self.status == GameStatus::Waiting && self.conns.len() == 2 {
            self.status = GameStatus::Active;
            self.started_at = Some(Utc::now());
            self.events.push("both participants present, game activated".to_string());
            self.broadcast_snapshot();
        } else {
            self.send_snapshot(role);
        }
    }

    fn detach(&mut self, role: Role, conn_id: &str) {
        // A superseded connection's late detach must not evict its successor.
        match self.conns.get(&role) {
            Some(conn) if conn.id == conn_id => {
                self.conns.remove(&role);
                tracing::info!(session = %self.session_id, %role, "participant detached");
            }
            _ => {}
        }
    }

    fn handle(&mut self, role: Role, msg: ClientMsg) {
        let result = match msg {
            ClientMsg::JoinGame { .. } => {
                // The join doubles as the resync request after a reconnect.
                self.send_snapshot(role);
                Ok(())
            }
            ClientMsg::PauseGame => self.pause(role),
            ClientMsg::ResumeGame => self.resume(role),
            ClientMsg::EndGame => self.end(role),
            other => self.play(role, other),
        };
        if let Err(err) = result {
            self.send_error(role, err);
        }
    }

    fn require_supervisor(role: Role) -> Result<(), GameError> {
        if role == Role::Supervisor {
            Ok(())
        } else {
            Err(GameError::WrongRole(role))
        }
    }

    fn pause(&mut self, role: Role) -> Result<(), GameError> {
        Self::require_supervisor(role)?;
        if self.status != GameStatus::Active {
            return Err(GameError::NotActive);
        }
        self.status = GameStatus::Paused;
        self.events.push("game paused".to_string());
        self.broadcast(ServerMsg::GamePaused);
        self.broadcast_snapshot();
        Ok(())
    }

    fn resume(&mut self, role: Role) -> Result<(), GameError> {
        Self::require_supervisor(role)?;
        if self.status != GameStatus::Paused {
            return Err(GameError::NotActive);
        }
        self.status = GameStatus::Active;
        self.events.push("game resumed".to_string());
        self.broadcast(ServerMsg::GameResumed);
        self.broadcast_snapshot();
        Ok(())
    }

    fn end(&mut self, role: Role) -> Result<(), GameError> {
        Self::require_supervisor(role)?;
        match self.status {
            // Duplicate end after completion is a no-op, not an error.
            GameStatus::Completed => Ok(()),
            GameStatus::Active | GameStatus::Paused => {
                self.complete("ended by supervisor");
                Ok(())
            }
            _ => Err(GameError::NotActive),
        }
    }

    fn play(&mut self, role: Role, msg: ClientMsg) -> Result<(), GameError> {
        if self.status != GameStatus::Active {
            return Err(GameError::NotActive);
        }
        let outcome = self.rules.apply(role, &msg)?;

        self.events.extend(outcome.log);
        if let Some(scored) = outcome.scored {
            self.seq += 1;
            self.persist_trial(TrialRecord {
                therapy_session_id: self.session_id.clone(),
                seq: self.seq,
                correct: scored.correct,
                note: scored.note,
                at: Utc::now(),
            });
        }
        for event in outcome.events {
            self.broadcast(event);
        }
        if self.rules.is_complete() {
            self.complete("all objectives exhausted");
        } else {
            self.broadcast_snapshot();
        }
        Ok(())
    }

    fn complete(&mut self, reason: &str) {
        if self.status == GameStatus::Completed {
            return;
        }
        self.status = GameStatus::Completed;
        self.events.push(format!("completed: {reason}"));
        let summary = self.summary();
        self.broadcast(ServerMsg::GameCompleted {
            summary: summary.clone(),
        });
        self.broadcast_snapshot();
        self.persist_summary(summary);
        tracing::info!(session = %self.session_id, reason, "game completed");
    }

    fn summary(&self) -> GameSummary {
        let completed_at = Utc::now();
        GameSummary {
            therapy_session_id: self.session_id.clone(),
            attempts: self.rules.attempts(),
            correct_attempts: self.rules.correct_attempts(),
            scores: self.rules.scores(),
            duration_seconds: self
                .started_at
                .map(|started| (completed_at - started).num_seconds())
                .unwrap_or(0),
            completed_at,
            events: self.events.clone(),
        }
    }

    fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            status: self.status,
            current_player: if self.status == GameStatus::Completed {
                None
            } else {
                self.rules.current_player()
            },
            attempts: self.rules.attempts(),
            correct_attempts: self.rules.correct_attempts(),
            view: self.rules.view(),
        }
    }

    /// Only currently attached roles receive anything; nothing is queued
    /// for an absent role.
    fn broadcast(&self, msg: ServerMsg) {
        let env = ServerEnvelope::new(msg);
        for conn in self.conns.values() {
            let _ = conn.tx.send(Outbound::Msg(env.clone()));
        }
    }

    fn broadcast_snapshot(&self) {
        self.broadcast(ServerMsg::GameState(self.snapshot()));
    }

    fn send_to(&self, role: Role, msg: ServerMsg) {
        if let Some(conn) = self.conns.get(&role) {
            let _ = conn.tx.send(Outbound::Msg(ServerEnvelope::new(msg)));
        }
    }

    fn send_snapshot(&self, role: Role) {
        self.send_to(role, ServerMsg::GameState(self.snapshot()));
    }

    fn send_error(&self, role: Role, err: GameError) {
        tracing::debug!(session = %self.session_id, %role, code = err.code(), "message rejected");
        self.send_to(
            role,
            ServerMsg::Error {
                message: err.to_string(),
                code: Some(err.code().to_string()),
            },
        );
    }

    /// Fire-and-forget: the in-memory state already advanced and was
    /// broadcast; a store failure is logged, never replayed to clients.
    fn persist_trial(&self, trial: TrialRecord) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.record_trial(trial).await {
                tracing::error!("failed to record trial: {err}");
            }
        });
    }

    fn persist_summary(&self, summary: GameSummary) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.record_summary(summary).await {
                tracing::error!("failed to record game summary: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemorySink;
    use crate::rules::choice::tests::three_prompts;
    use crate::rules::matching::tests::four_pairs;
    use crate::rules::{ChoiceGame, MatchGame};
    use std::time::Duration;

    struct TestConn {
        conn: Connection,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn test_conn() -> TestConn {
        let (tx, rx) = mpsc::unbounded_channel();
        TestConn {
            conn: Connection {
                id: uuid::Uuid::new_v4().to_string(),
                tx,
            },
            rx,
        }
    }

    async fn attach(handle: &RoomHandle, role: Role, conn: &TestConn) {
        handle
            .cmd_tx
            .send(RoomCommand::Attach {
                role,
                conn: conn.conn.clone(),
            })
            .await
            .unwrap();
    }

    async fn send(handle: &RoomHandle, role: Role, msg: ClientMsg) {
        handle
            .cmd_tx
            .send(RoomCommand::Handle { role, msg })
            .await
            .unwrap();
    }

    async fn recv(conn: &mut TestConn) -> Outbound {
        tokio::time::timeout(Duration::from_secs(2), conn.rx.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("connection channel closed")
    }

    async fn recv_msg(conn: &mut TestConn) -> ServerMsg {
        match recv(conn).await {
            Outbound::Msg(env) => env.msg,
            Outbound::Close { code, .. } => panic!("unexpected close: {code}"),
        }
    }

    /// Skip forward to the next message of the given wire type.
    async fn recv_type(conn: &mut TestConn, type_name: &str) -> ServerMsg {
        for _ in 0..16 {
            let msg = recv_msg(conn).await;
            if msg.type_name() == type_name {
                return msg;
            }
        }
        panic!("no {type_name} message arrived");
    }

    fn choice_room(registry: &Arc<Registry>, sink: Arc<MemorySink>, id: &str) -> RoomHandle {
        registry.get_or_create(id, || Box::new(ChoiceGame::new(three_prompts())), sink)
    }

    fn match_room(registry: &Arc<Registry>, sink: Arc<MemorySink>, id: &str) -> RoomHandle {
        registry.get_or_create(id, || Box::new(MatchGame::new(four_pairs())), sink)
    }

    async fn active_pair(handle: &RoomHandle) -> (TestConn, TestConn) {
        let mut sup = test_conn();
        let mut learner = test_conn();
        attach(handle, Role::Supervisor, &sup).await;
        match recv_msg(&mut sup).await {
            ServerMsg::GameState(snap) => assert_eq!(snap.status, GameStatus::Waiting),
            other => panic!("expected waiting snapshot, got {other:?}"),
        }
        attach(handle, Role::Learner, &learner).await;
        for conn in [&mut sup, &mut learner] {
            match recv_type(conn, "game-state").await {
                ServerMsg::GameState(snap) => assert_eq!(snap.status, GameStatus::Active),
                other => panic!("expected active snapshot, got {other:?}"),
            }
        }
        (sup, learner)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = Registry::new();
        let sink = Arc::new(MemorySink::default());
        let a = choice_room(&registry, sink.clone(), "s-1");
        let b = choice_room(&registry, sink, "s-1");
        assert!(a.cmd_tx.same_channel(&b.cmd_tx));
    }

    #[tokio::test]
    async fn room_is_removed_when_last_participant_detaches() {
        let registry = Registry::new();
        let sink = Arc::new(MemorySink::default());
        let handle = choice_room(&registry, sink, "s-gone");
        let mut sup = test_conn();
        attach(&handle, Role::Supervisor, &sup).await;
        recv_msg(&mut sup).await;

        handle
            .cmd_tx
            .send(RoomCommand::Detach {
                role: Role::Supervisor,
                conn_id: sup.conn.id.clone(),
            })
            .await
            .unwrap();

        for _ in 0..50 {
            if !registry.contains("s-gone") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room was not removed from the registry");
    }

    #[tokio::test]
    async fn second_attach_for_a_role_supersedes_the_first() {
        let registry = Registry::new();
        let sink = Arc::new(MemorySink::default());
        let handle = choice_room(&registry, sink, "s-super");

        let mut first = test_conn();
        let second = test_conn();
        attach(&handle, Role::Learner, &first).await;
        recv_msg(&mut first).await;

        attach(&handle, Role::Learner, &second).await;
        match recv(&mut first).await {
            Outbound::Close { code, reason } => {
                assert_eq!(code, close::SUPERSEDED);
                assert_eq!(reason, "superseded");
            }
            other => panic!("expected close frame, got {other:?}"),
        }

        // The old connection's late detach must not evict the new one:
        // the room must stay registered.
        handle
            .cmd_tx
            .send(RoomCommand::Detach {
                role: Role::Learner,
                conn_id: first.conn.id.clone(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.contains("s-super"));
    }

    #[tokio::test]
    async fn off_turn_move_is_rejected_without_state_change() {
        let registry = Registry::new();
        let sink = Arc::new(MemorySink::default());
        let handle = match_room(&registry, sink, "s-turn");
        let (mut sup, mut learner) = active_pair(&handle).await;

        send(
            &handle,
            Role::Learner,
            ClientMsg::JoinGame {
                therapy_session_id: "s-turn".into(),
                role: Role::Learner,
            },
        )
        .await;
        let before = recv_type(&mut learner, "game-state").await;

        // Learner owns the first turn, so a supervisor flip must bounce.
        send(
            &handle,
            Role::Supervisor,
            ClientMsg::FlipCard {
                card_id: "fox-w".into(),
            },
        )
        .await;
        match recv_type(&mut sup, "error").await {
            ServerMsg::Error { code, .. } => assert_eq!(code.as_deref(), Some("not-your-turn")),
            other => panic!("expected error, got {other:?}"),
        }

        send(
            &handle,
            Role::Learner,
            ClientMsg::JoinGame {
                therapy_session_id: "s-turn".into(),
                role: Role::Learner,
            },
        )
        .await;
        let after = recv_type(&mut learner, "game-state").await;
        assert_eq!(
            serde_json::to_value(&before).unwrap(),
            serde_json::to_value(&after).unwrap()
        );
    }

    #[tokio::test]
    async fn pause_and_resume_are_supervisor_only() {
        let registry = Registry::new();
        let sink = Arc::new(MemorySink::default());
        let handle = choice_room(&registry, sink, "s-pause");
        let (mut sup, mut learner) = active_pair(&handle).await;

        send(&handle, Role::Learner, ClientMsg::PauseGame).await;
        match recv_type(&mut learner, "error").await {
            ServerMsg::Error { code, .. } => assert_eq!(code.as_deref(), Some("wrong-role")),
            other => panic!("expected error, got {other:?}"),
        }

        send(&handle, Role::Supervisor, ClientMsg::PauseGame).await;
        recv_type(&mut sup, "game-paused").await;
        match recv_type(&mut sup, "game-state").await {
            ServerMsg::GameState(snap) => assert_eq!(snap.status, GameStatus::Paused),
            other => panic!("expected paused snapshot, got {other:?}"),
        }

        // Moves bounce while paused.
        send(
            &handle,
            Role::Learner,
            ClientMsg::SelectOption {
                option_id: "b".into(),
            },
        )
        .await;
        match recv_type(&mut learner, "error").await {
            ServerMsg::Error { code, .. } => assert_eq!(code.as_deref(), Some("not-active")),
            other => panic!("expected error, got {other:?}"),
        }

        send(&handle, Role::Supervisor, ClientMsg::ResumeGame).await;
        recv_type(&mut sup, "game-resumed").await;
    }

    #[tokio::test]
    async fn trial_sequence_survives_reconnects_without_gaps() {
        let registry = Registry::new();
        let sink = Arc::new(MemorySink::default());
        let handle = choice_room(&registry, sink.clone(), "s-seq");
        let (mut sup, mut learner) = active_pair(&handle).await;

        send(
            &handle,
            Role::Learner,
            ClientMsg::SelectOption {
                option_id: "b".into(),
            },
        )
        .await;
        recv_type(&mut learner, "answer-result").await;

        // Learner drops and returns on a fresh connection.
        handle
            .cmd_tx
            .send(RoomCommand::Detach {
                role: Role::Learner,
                conn_id: learner.conn.id.clone(),
            })
            .await
            .unwrap();
        let mut rejoined = test_conn();
        attach(&handle, Role::Learner, &rejoined).await;
        recv_type(&mut rejoined, "game-state").await;

        send(&handle, Role::Supervisor, ClientMsg::NextPrompt).await;
        recv_type(&mut sup, "new-prompt").await;
        send(
            &handle,
            Role::Learner,
            ClientMsg::SelectOption {
                option_id: "a".into(),
            },
        )
        .await;
        recv_type(&mut rejoined, "answer-result").await;

        for _ in 0..50 {
            if sink.trials.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let trials = sink.trials.lock().unwrap();
        let seqs: Vec<u32> = trials.iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn exhausting_the_prompts_completes_the_game() {
        let registry = Registry::new();
        let sink = Arc::new(MemorySink::default());
        let handle = choice_room(&registry, sink.clone(), "s-done");
        let (mut sup, mut learner) = active_pair(&handle).await;

        // Walk the supervisor past all three prompts.
        for _ in 0..3 {
            send(&handle, Role::Supervisor, ClientMsg::NextPrompt).await;
        }
        recv_type(&mut sup, "game-completed").await;

        // Completion is terminal: further moves bounce.
        send(
            &handle,
            Role::Learner,
            ClientMsg::SelectOption {
                option_id: "b".into(),
            },
        )
        .await;
        match recv_type(&mut learner, "error").await {
            ServerMsg::Error { code, .. } => assert_eq!(code.as_deref(), Some("not-active")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_end_game_is_a_quiet_no_op() {
        let registry = Registry::new();
        let sink = Arc::new(MemorySink::default());
        let handle = choice_room(&registry, sink.clone(), "s-end");
        let (mut sup, _learner) = active_pair(&handle).await;

        send(&handle, Role::Supervisor, ClientMsg::EndGame).await;
        recv_type(&mut sup, "game-completed").await;
        match recv_type(&mut sup, "game-state").await {
            ServerMsg::GameState(snap) => assert_eq!(snap.status, GameStatus::Completed),
            other => panic!("expected completed snapshot, got {other:?}"),
        }

        send(&handle, Role::Supervisor, ClientMsg::EndGame).await;
        send(
            &handle,
            Role::Supervisor,
            ClientMsg::JoinGame {
                therapy_session_id: "s-end".into(),
                role: Role::Supervisor,
            },
        )
        .await;
        // The duplicate produced neither an error nor a second completion.
        let next = recv_msg(&mut sup).await;
        assert_eq!(next.type_name(), "game-state");

        for _ in 0..50 {
            if !sink.summaries.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.summaries.lock().unwrap().len(), 1);
    }
}
