use serde::{Deserialize, Serialize};

use crate::protocol::{ClientMsg, OptionView, PromptView, Role, RoleScores, ServerMsg, VariantView};

use super::{GameError, GameRules, MoveOutcome, Scored};

/// One selectable answer of a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptOption {
    pub id: String,
    pub label: String,
}

/// A single prompt loaded from content config. `solution` names the one
/// correct option id and is never sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub text: String,
    pub options: Vec<PromptOption>,
    pub solution: String,
}

impl Prompt {
    fn view(&self) -> PromptView {
        PromptView {
            id: self.id.clone(),
            text: self.text.clone(),
            options: self
                .options
                .iter()
                .map(|o| OptionView {
                    id: o.id.clone(),
                    label: o.label.clone(),
                })
                .collect(),
        }
    }
}

/// Single-answer variant: the learner selects, every selection is scored
/// immediately, and only the supervisor advances the prompt sequence.
pub struct ChoiceGame {
    prompts: Vec<Prompt>,
    current: usize,
    answered: bool,
    exhausted: bool,
    attempts: u32,
    correct: u32,
}

impl ChoiceGame {
    pub fn new(prompts: Vec<Prompt>) -> Self {
        Self {
            prompts,
            current: 0,
            answered: false,
            exhausted: false,
            attempts: 0,
            correct: 0,
        }
    }

    fn select(&mut self, role: Role, option_id: &str) -> Result<MoveOutcome, GameError> {
        if role != Role::Learner {
            return Err(GameError::WrongRole(role));
        }
        if self.exhausted {
            return Err(GameError::NotActive);
        }
        if self.answered {
            return Err(GameError::AlreadyAnswered);
        }
        let prompt = &self.prompts[self.current];
        if !prompt.options.iter().any(|o| o.id == option_id) {
            return Err(GameError::UnknownOption(option_id.to_string()));
        }

        let correct = prompt.solution == option_id;
        self.attempts += 1;
        if correct {
            self.correct += 1;
            self.answered = true;
        }

        Ok(MoveOutcome {
            events: vec![ServerMsg::AnswerResult {
                option_id: option_id.to_string(),
                correct,
                attempts: self.attempts,
                correct_attempts: self.correct,
            }],
            scored: Some(Scored {
                correct,
                note: format!("prompt {}: selected {}", prompt.id, option_id),
            }),
            log: vec![format!(
                "learner answered prompt {} {}",
                prompt.id,
                if correct { "correctly" } else { "incorrectly" }
            )],
        })
    }

    fn next_prompt(&mut self, role: Role) -> Result<MoveOutcome, GameError> {
        if role != Role::Supervisor {
            return Err(GameError::WrongRole(role));
        }
        if self.exhausted {
            return Err(GameError::NotActive);
        }
        if self.current + 1 < self.prompts.len() {
            self.current += 1;
            self.answered = false;
            let prompt = self.prompts[self.current].view();
            Ok(MoveOutcome {
                events: vec![ServerMsg::NewPrompt {
                    prompt: prompt.clone(),
                }],
                scored: None,
                log: vec![format!("advanced to prompt {}", prompt.id)],
            })
        } else {
            self.exhausted = true;
            Ok(MoveOutcome {
                log: vec!["prompt sequence exhausted".to_string()],
                ..Default::default()
            })
        }
    }
}

impl GameRules for ChoiceGame {
    fn apply(&mut self, role: Role, msg: &ClientMsg) -> Result<MoveOutcome, GameError> {
        match msg {
            ClientMsg::SelectOption { option_id } => self.select(role, option_id),
            ClientMsg::NextPrompt => self.next_prompt(role),
            _ => Err(GameError::UnsupportedMove),
        }
    }

    fn is_complete(&self) -> bool {
        self.exhausted
    }

    fn current_player(&self) -> Option<Role> {
        Some(Role::Learner)
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn correct_attempts(&self) -> u32 {
        self.correct
    }

    fn scores(&self) -> RoleScores {
        RoleScores {
            supervisor: 0,
            learner: self.correct,
        }
    }

    fn view(&self) -> VariantView {
        VariantView::Choice {
            prompt: if self.exhausted {
                None
            } else {
                Some(self.prompts[self.current].view())
            },
            prompt_index: self.current + 1,
            total_prompts: self.prompts.len(),
        }
    }
}
