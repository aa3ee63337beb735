use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::protocol::{
    CardFace, CardView, ClientMsg, FaceKind, Role, RoleScores, ServerMsg, VariantView,
};

use super::{GameError, GameRules, MoveOutcome, Scored};

/// One word/picture pair loaded from content config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardPair {
    pub id: String,
    pub word: String,
    pub picture: String,
}

struct Card {
    id: String,
    pair_id: String,
    face: CardFace,
    flipped: bool,
    matched: bool,
}

/// Pair-matching variant: either role acts on its turn, a matched pair
/// retains the turn, a mismatch passes it.
pub struct MatchGame {
    cards: Vec<Card>,
    flipped: Vec<String>,
    turn: Role,
    attempts: u32,
    scores: RoleScores,
}

impl MatchGame {
    pub fn new(pairs: Vec<CardPair>) -> Self {
        Self::with_rng(pairs, &mut rand::rng())
    }

    pub fn with_rng(pairs: Vec<CardPair>, rng: &mut impl rand::Rng) -> Self {
        let mut cards: Vec<Card> = pairs
            .iter()
            .flat_map(|pair| {
                [
                    Card {
                        id: format!("{}-w", pair.id),
                        pair_id: pair.id.clone(),
                        face: CardFace {
                            kind: FaceKind::Word,
                            value: pair.word.clone(),
                        },
                        flipped: false,
                        matched: false,
                    },
                    Card {
                        id: format!("{}-p", pair.id),
                        pair_id: pair.id.clone(),
                        face: CardFace {
                            kind: FaceKind::Picture,
                            value: pair.picture.clone(),
                        },
                        flipped: false,
                        matched: false,
                    },
                ]
            })
            .collect();
        cards.shuffle(rng);
        Self {
            cards,
            flipped: Vec::new(),
            // The learner opens play; the therapy flow warms up on them.
            turn: Role::Learner,
            attempts: 0,
            scores: RoleScores::default(),
        }
    }

    fn card(&self, id: &str) -> Result<&Card, GameError> {
        self.cards
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| GameError::UnknownCard(id.to_string()))
    }

    fn card_mut(&mut self, id: &str) -> &mut Card {
        self.cards
            .iter_mut()
            .find(|c| c.id == id)
            .expect("card id validated before mutation")
    }

    fn flip(&mut self, role: Role, card_id: &str) -> Result<MoveOutcome, GameError> {
        if role != self.turn {
            return Err(GameError::NotYourTurn);
        }
        if self.flipped.len() >= 2 {
            return Err(GameError::TooManyFlipped);
        }
        let card = self.card(card_id)?;
        if card.matched {
            return Err(GameError::AlreadyMatched(card_id.to_string()));
        }
        if card.flipped {
            return Err(GameError::AlreadyFlipped(card_id.to_string()));
        }

        let face = card.face.clone();
        self.card_mut(card_id).flipped = true;
        self.flipped.push(card_id.to_string());

        Ok(MoveOutcome {
            events: vec![ServerMsg::CardFlipped {
                card_id: card_id.to_string(),
                face,
            }],
            ..Default::default()
        })
    }

    fn check(&mut self, role: Role, card1: &str, card2: &str) -> Result<MoveOutcome, GameError> {
        if role != self.turn {
            return Err(GameError::NotYourTurn);
        }
        if self.flipped.len() != 2 {
            return Err(GameError::NotEnoughFlipped);
        }
        let named = [card1.to_string(), card2.to_string()];
        if !named.iter().all(|id| self.flipped.contains(id)) || card1 == card2 {
            return Err(GameError::StaleCheck);
        }

        let correct = self.card(card1)?.pair_id == self.card(card2)?.pair_id;
        self.attempts += 1;

        let mut events = vec![ServerMsg::MatchResult {
            card1_id: card1.to_string(),
            card2_id: card2.to_string(),
            correct,
        }];
        let log;
        if correct {
            let pair = self.card(card1)?.pair_id.clone();
            for id in &named {
                self.card_mut(id).matched = true;
                self.card_mut(id).flipped = false;
            }
            match role {
                Role::Supervisor => self.scores.supervisor += 1,
                Role::Learner => self.scores.learner += 1,
            }
            log = format!("{role} matched pair {pair}");
        } else {
            for id in &named {
                self.card_mut(id).flipped = false;
            }
            self.turn = role.other();
            events.push(ServerMsg::TurnChanged {
                current_player: self.turn,
                reason: "incorrect-match".to_string(),
            });
            log = format!("{role} missed a match, turn passes");
        }
        self.flipped.clear();

        Ok(MoveOutcome {
            events,
            scored: Some(Scored {
                correct,
                note: format!("checked {card1} against {card2}"),
            }),
            log: vec![log],
        })
    }

    fn end_turn(&mut self, role: Role) -> Result<MoveOutcome, GameError> {
        if role != self.turn {
            return Err(GameError::NotYourTurn);
        }
        if !self.flipped.is_empty() {
            return Err(GameError::FlipsPending);
        }
        self.turn = role.other();
        Ok(MoveOutcome {
            events: vec![ServerMsg::TurnChanged {
                current_player: self.turn,
                reason: "turn-ended".to_string(),
            }],
            scored: None,
            log: vec![format!("{role} passed the turn")],
        })
    }
}

impl GameRules for MatchGame {
    fn apply(&mut self, role: Role, msg: &ClientMsg) -> Result<MoveOutcome, GameError> {
        match msg {
            ClientMsg::FlipCard { card_id } => self.flip(role, card_id),
            ClientMsg::CheckMatch { card1_id, card2_id } => self.check(role, card1_id, card2_id),
            ClientMsg::EndTurn => self.end_turn(role),
            _ => Err(GameError::UnsupportedMove),
        }
    }

    fn is_complete(&self) -> bool {
        self.cards.iter().all(|c| c.matched)
    }

    fn current_player(&self) -> Option<Role> {
        Some(self.turn)
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn correct_attempts(&self) -> u32 {
        self.scores.supervisor + self.scores.learner
    }

    fn scores(&self) -> RoleScores {
        self.scores
    }

    fn view(&self) -> VariantView {
        let total_pairs = self.cards.len() / 2;
        VariantView::Match {
            cards: self
                .cards
                .iter()
                .map(|c| CardView {
                    id: c.id.clone(),
                    flipped: c.flipped,
                    matched: c.matched,
                    face: (c.flipped || c.matched).then(|| c.face.clone()),
                })
                .collect(),
            matched_pairs: self.cards.iter().filter(|c| c.matched).count() / 2,
            total_pairs,
            scores: self.scores,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn four_pairs() -> Vec<CardPair> {
        ["fox", "owl", "bear", "crab"]
            .iter()
            .map(|name| CardPair {
                id: (*name).to_string(),
                word: name.to_uppercase(),
                picture: format!("{name}.png"),
            })
            .collect()
    }

    fn game() -> MatchGame {
        MatchGame::new(four_pairs())
    }

    fn flip(g: &mut MatchGame, role: Role, id: &str) -> Result<MoveOutcome, GameError> {
        g.apply(
            role,
            &ClientMsg::FlipCard {
                card_id: id.into(),
            },
        )
    }

    fn check(g: &mut MatchGame, role: Role, a: &str, b: &str) -> Result<MoveOutcome, GameError> {
        g.apply(
            role,
            &ClientMsg::CheckMatch {
                card1_id: a.into(),
                card2_id: b.into(),
            },
        )
    }

    fn flipped_count(g: &MatchGame) -> usize {
        g.cards.iter().filter(|c| c.flipped).count()
    }

    #[test]
    fn off_turn_flip_is_rejected_without_mutation() {
        let mut g = game();
        let err = flip(&mut g, Role::Supervisor, "fox-w").unwrap_err();
        assert_eq!(err, GameError::NotYourTurn);
        assert_eq!(flipped_count(&g), 0);
    }

    #[test]
    fn never_more_than_two_cards_face_up() {
        let mut g = game();
        flip(&mut g, Role::Learner, "fox-w").unwrap();
        flip(&mut g, Role::Learner, "owl-w").unwrap();
        let err = flip(&mut g, Role::Learner, "bear-w").unwrap_err();
        assert_eq!(err, GameError::TooManyFlipped);
        assert_eq!(flipped_count(&g), 2);
    }

    #[test]
    fn flipping_a_flipped_or_matched_card_is_rejected() {
        let mut g = game();
        flip(&mut g, Role::Learner, "fox-w").unwrap();
        assert_eq!(
            flip(&mut g, Role::Learner, "fox-w").unwrap_err(),
            GameError::AlreadyFlipped("fox-w".into())
        );

        flip(&mut g, Role::Learner, "fox-p").unwrap();
        check(&mut g, Role::Learner, "fox-w", "fox-p").unwrap();
        assert_eq!(
            flip(&mut g, Role::Learner, "fox-w").unwrap_err(),
            GameError::AlreadyMatched("fox-w".into())
        );
    }

    #[test]
    fn match_retains_turn_and_scores_the_acting_role() {
        let mut g = game();
        flip(&mut g, Role::Learner, "fox-w").unwrap();
        flip(&mut g, Role::Learner, "fox-p").unwrap();
        let out = check(&mut g, Role::Learner, "fox-w", "fox-p").unwrap();

        assert!(out.scored.as_ref().unwrap().correct);
        assert!(
            !out.events
                .iter()
                .any(|e| matches!(e, ServerMsg::TurnChanged { .. }))
        );
        assert_eq!(g.current_player(), Some(Role::Learner));
        assert_eq!(g.scores().learner, 1);
        assert_eq!(g.scores().supervisor, 0);
    }

    #[test]
    fn mismatch_flips_back_and_passes_the_turn() {
        let mut g = game();
        flip(&mut g, Role::Learner, "fox-w").unwrap();
        flip(&mut g, Role::Learner, "owl-w").unwrap();
        let out = check(&mut g, Role::Learner, "fox-w", "owl-w").unwrap();

        assert!(!out.scored.as_ref().unwrap().correct);
        match out.events.last() {
            Some(ServerMsg::TurnChanged {
                current_player,
                reason,
            }) => {
                assert_eq!(*current_player, Role::Supervisor);
                assert_eq!(reason, "incorrect-match");
            }
            other => panic!("expected turn change, got {other:?}"),
        }
        assert_eq!(flipped_count(&g), 0);
        assert_eq!(g.current_player(), Some(Role::Supervisor));
    }

    #[test]
    fn check_requires_the_two_flipped_cards() {
        let mut g = game();
        assert_eq!(
            check(&mut g, Role::Learner, "fox-w", "fox-p").unwrap_err(),
            GameError::NotEnoughFlipped
        );

        flip(&mut g, Role::Learner, "fox-w").unwrap();
        flip(&mut g, Role::Learner, "owl-w").unwrap();
        assert_eq!(
            check(&mut g, Role::Learner, "fox-w", "bear-w").unwrap_err(),
            GameError::StaleCheck
        );
        assert_eq!(g.attempts(), 0);
    }

    #[test]
    fn end_turn_passes_unless_cards_are_pending() {
        let mut g = game();
        flip(&mut g, Role::Learner, "fox-w").unwrap();
        assert_eq!(
            g.apply(Role::Learner, &ClientMsg::EndTurn).unwrap_err(),
            GameError::FlipsPending
        );

        flip(&mut g, Role::Learner, "fox-p").unwrap();
        check(&mut g, Role::Learner, "fox-w", "fox-p").unwrap();
        g.apply(Role::Learner, &ClientMsg::EndTurn).unwrap();
        assert_eq!(g.current_player(), Some(Role::Supervisor));
    }

    #[test]
    fn completes_when_all_cards_are_matched() {
        let mut g = game();
        for pair in ["fox", "owl", "bear", "crab"] {
            flip(&mut g, Role::Learner, &format!("{pair}-w")).unwrap();
            flip(&mut g, Role::Learner, &format!("{pair}-p")).unwrap();
            check(
                &mut g,
                Role::Learner,
                &format!("{pair}-w"),
                &format!("{pair}-p"),
            )
            .unwrap();
        }
        assert!(g.is_complete());
        assert_eq!(g.correct_attempts(), 4);
        assert_eq!(g.attempts(), 4);
    }

    #[test]
    fn snapshot_hides_face_down_cards() {
        let mut g = game();
        flip(&mut g, Role::Learner, "fox-w").unwrap();
        match g.view() {
            VariantView::Match { cards, .. } => {
                for card in cards {
                    assert_eq!(card.face.is_some(), card.id == "fox-w");
                }
            }
            other => panic!("unexpected view: {other:?}"),
        }
    }
}
