use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::rules::{CardPair, ChoiceGame, GameRules, MatchGame, Prompt};

/// Which mini-game a session runs, together with its content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GameContent {
    Choice { prompts: Vec<Prompt> },
    Match { pairs: Vec<CardPair> },
}

impl GameContent {
    /// Initialize fresh rule-variant state for a room.
    pub fn build(&self) -> Box<dyn GameRules> {
        match self {
            Self::Choice { prompts } => Box::new(ChoiceGame::new(prompts.clone())),
            Self::Match { pairs } => Box::new(MatchGame::new(pairs.clone())),
        }
    }
}

/// One session directory entry: who owns the session, which credentials
/// admit each participant, and which content file the game runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub id: String,
    pub supervisor_id: String,
    pub supervisor_cookie: String,
    pub learner_token: String,
    pub content: String,
}

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Initialize config directory with defaults if missing.
pub fn init() {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base).expect("Failed to create config directory");
    }

    let sessions_path = config_path("sessions.json");
    if !sessions_path.exists() {
        let defaults = serde_json::json!([
            {
                "id": "demo-choice",
                "supervisorId": "sup-1",
                "supervisorCookie": "dev-supervisor-cookie",
                "learnerToken": "dev-learner-token",
                "content": "cvc-words"
            },
            {
                "id": "demo-match",
                "supervisorId": "sup-1",
                "supervisorCookie": "dev-supervisor-cookie",
                "learnerToken": "dev-learner-token",
                "content": "animal-pairs"
            }
        ]);
        fs::write(
            &sessions_path,
            serde_json::to_string_pretty(&defaults).unwrap(),
        )
        .expect("Failed to write default sessions.json");
    }

    let content_dir = config_path("content");
    if !content_dir.exists() {
        fs::create_dir_all(&content_dir).expect("Failed to create content directory");

        let prompts = serde_json::json!({
            "kind": "choice",
            "prompts": [
                {
                    "id": "cvc-1",
                    "text": "Which word names the animal in the picture?",
                    "options": [
                        {"id": "cat", "label": "cat"},
                        {"id": "cot", "label": "cot"},
                        {"id": "cut", "label": "cut"}
                    ],
                    "solution": "cat"
                },
                {
                    "id": "cvc-2",
                    "text": "Which word rhymes with 'log'?",
                    "options": [
                        {"id": "dog", "label": "dog"},
                        {"id": "dig", "label": "dig"},
                        {"id": "dug", "label": "dug"}
                    ],
                    "solution": "dog"
                }
            ]
        });
        fs::write(
            content_dir.join("cvc-words.json"),
            serde_json::to_string_pretty(&prompts).unwrap(),
        )
        .expect("Failed to write example prompt set");

        let pairs = serde_json::json!({
            "kind": "match",
            "pairs": [
                {"id": "fox", "word": "fox", "picture": "fox.png"},
                {"id": "owl", "word": "owl", "picture": "owl.png"},
                {"id": "bear", "word": "bear", "picture": "bear.png"},
                {"id": "crab", "word": "crab", "picture": "crab.png"}
            ]
        });
        fs::write(
            content_dir.join("animal-pairs.json"),
            serde_json::to_string_pretty(&pairs).unwrap(),
        )
        .expect("Failed to write example deck");
    }
}

/// Load the session directory.
pub fn load_sessions() -> Vec<SessionEntry> {
    let path = config_path("sessions.json");
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(err) => {
            tracing::error!("Failed to read sessions.json: {}", err);
            return vec![];
        }
    };
    match serde_json::from_str(&data) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::error!("Failed to parse sessions.json: {}", err);
            vec![]
        }
    }
}

/// Load all game content files from the content directory, keyed by file
/// stem. Malformed files are logged and skipped.
pub fn load_content() -> HashMap<String, GameContent> {
    let content_dir = config_path("content");
    let mut content = HashMap::new();

    let entries = match fs::read_dir(&content_dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::error!("Failed to read content directory: {}", err);
            return content;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let key = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<GameContent>(&data) {
                Ok(spec) => {
                    content.insert(key, spec);
                }
                Err(err) => {
                    tracing::error!("Failed to parse content {}: {}", path.display(), err)
                }
            },
            Err(err) => tracing::error!("Failed to read content {}: {}", path.display(), err),
        }
    }

    content
}
