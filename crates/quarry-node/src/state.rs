//! Game State Store.
//!
//! Two independently locked maps, `locations` and `scores`. Anything that
//! needs both takes `locations` first, then `scores`, inside one call.
//! The store is only ever merged into, never replaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use quarry_protocol::{is_prey, Coordinate, GameSnapshot, PeerId, PREY_ID};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::GameError;
use crate::render::GameRenderState;

#[derive(Debug, Default)]
pub struct GameState {
    locations: RwLock<HashMap<PeerId, Coordinate>>,
    scores: RwLock<HashMap<PeerId, i64>>,
    has_initial_state: AtomicBool,
}

impl GameState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn location(&self, id: &str) -> Option<Coordinate> {
        self.locations.read().await.get(id).copied()
    }

    pub async fn prey_location(&self) -> Option<Coordinate> {
        self.location(PREY_ID).await
    }

    pub async fn set_location(&self, id: &str, coord: Coordinate) {
        self.locations.write().await.insert(id.to_string(), coord);
    }

    pub async fn score(&self, id: &str) -> Option<i64> {
        self.scores.read().await.get(id).copied()
    }

    /// Drop a departed peer's location and score.
    pub async fn remove_peer(&self, id: &str) {
        let mut locations = self.locations.write().await;
        let mut scores = self.scores.write().await;
        locations.remove(id);
        scores.remove(id);
    }

    pub async fn snapshot(&self) -> GameSnapshot {
        let locations = self.locations.read().await;
        let scores = self.scores.read().await;
        GameSnapshot {
            locations: locations.clone(),
            scores: scores.clone(),
        }
    }

    pub fn has_initial_state(&self) -> bool {
        self.has_initial_state.load(Ordering::Acquire)
    }

    /// Nothing to reconcile with (no peers at join).
    pub fn mark_initial_state(&self) {
        self.has_initial_state.store(true, Ordering::Release);
    }

    /// Merge the first full snapshot received after join.
    ///
    /// Key-by-key: our own entries stay as they are, the prey never gains a
    /// score. Returns false, changing nothing, once initial state exists.
    pub async fn merge_incoming(&self, self_id: &str, incoming: GameSnapshot) -> bool {
        let mut locations = self.locations.write().await;
        let mut scores = self.scores.write().await;
        if self.has_initial_state() {
            return false;
        }

        for (id, coord) in incoming.locations {
            if id != self_id {
                locations.insert(id, coord);
            }
        }
        for (id, score) in incoming.scores {
            if id != self_id && !is_prey(&id) && locations.contains_key(&id) {
                scores.insert(id, score);
            }
        }

        self.mark_initial_state();
        info!(
            players = locations.len(),
            scored = scores.len(),
            "merged initial game state"
        );
        true
    }

    /// Accept a claimed score only if it is exactly one catch above the last one.
    pub async fn check_and_update_score(
        &self,
        id: &str,
        claimed: i64,
        catch_worth: i64,
    ) -> Result<(), GameError> {
        let locations = self.locations.read().await;
        let mut scores = self.scores.write().await;

        let previous = scores.get(id).copied();
        let expected = previous.unwrap_or(0) + catch_worth;
        if is_prey(id) || claimed != expected {
            return Err(GameError::InvalidScoreUpdate {
                player: id.to_string(),
                claimed,
                expected,
            });
        }
        if !locations.contains_key(id) {
            return Err(GameError::UnknownPlayer(id.to_string()));
        }

        scores.insert(id.to_string(), claimed);
        debug!(player = id, score = claimed, "score updated");
        Ok(())
    }

    /// Award one catch to `id` and return the new score.
    pub async fn award_catch(&self, id: &str, catch_worth: i64) -> Result<i64, GameError> {
        let claimed = self.score(id).await.unwrap_or(0) + catch_worth;
        self.check_and_update_score(id, claimed, catch_worth).await?;
        Ok(claimed)
    }

    /// A capture is only valid on the prey's current cell.
    pub async fn validate_capture(&self, claimed: Coordinate) -> Result<(), GameError> {
        let prey = self.prey_location().await;
        if prey == Some(claimed) {
            Ok(())
        } else {
            Err(GameError::InvalidPreyCapture { claimed, prey })
        }
    }

    pub async fn render_state(&self, self_id: &str) -> GameRenderState {
        let locations = self.locations.read().await;
        let scores = self.scores.read().await;
        let others = locations
            .iter()
            .filter(|(id, _)| id.as_str() != self_id && !is_prey(id))
            .map(|(id, coord)| (id.clone(), *coord))
            .collect();
        GameRenderState {
            player_id: self_id.to_string(),
            player: locations.get(self_id).copied(),
            others,
            prey: locations.get(PREY_ID).copied(),
            score: scores.get(self_id).copied().unwrap_or(0),
            scores: scores.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn score_must_step_by_one_catch() {
        let state = GameState::new();
        state.set_location("p1", Coordinate::new(0, 0)).await;

        state.check_and_update_score("p1", 1, 1).await.unwrap();
        assert_eq!(state.score("p1").await, Some(1));

        let err = state.check_and_update_score("p1", 1, 1).await.unwrap_err();
        assert_eq!(
            err,
            GameError::InvalidScoreUpdate {
                player: "p1".into(),
                claimed: 1,
                expected: 2
            }
        );
        assert_eq!(state.score("p1").await, Some(1));

        state.check_and_update_score("p1", 2, 1).await.unwrap();
        assert_eq!(state.score("p1").await, Some(2));
    }

    #[tokio::test]
    async fn new_scorer_needs_exactly_one_catch() {
        let state = GameState::new();
        state.set_location("p1", Coordinate::new(0, 0)).await;
        assert!(state.check_and_update_score("p1", 2, 1).await.is_err());
        assert!(state.check_and_update_score("p1", 0, 1).await.is_err());
        assert_eq!(state.score("p1").await, None);
        assert!(state.check_and_update_score("p1", 5, 5).await.is_ok());
    }

    #[tokio::test]
    async fn prey_and_strangers_never_score() {
        let state = GameState::new();
        state.set_location(PREY_ID, Coordinate::new(3, 3)).await;
        assert!(state.check_and_update_score(PREY_ID, 1, 1).await.is_err());
        assert_eq!(
            state.check_and_update_score("ghost", 1, 1).await,
            Err(GameError::UnknownPlayer("ghost".into()))
        );
        assert!(state.snapshot().await.scores.is_empty());
    }

    #[tokio::test]
    async fn award_catch_increments() {
        let state = GameState::new();
        state.set_location("p1", Coordinate::new(0, 0)).await;
        assert_eq!(state.award_catch("p1", 2).await, Ok(2));
        assert_eq!(state.award_catch("p1", 2).await, Ok(4));
    }

    #[tokio::test]
    async fn capture_must_be_on_the_prey() {
        let state = GameState::new();
        assert!(state.validate_capture(Coordinate::new(1, 1)).await.is_err());
        state.set_location(PREY_ID, Coordinate::new(1, 1)).await;
        assert!(state.validate_capture(Coordinate::new(1, 1)).await.is_ok());
        assert_eq!(
            state.validate_capture(Coordinate::new(1, 2)).await,
            Err(GameError::InvalidPreyCapture {
                claimed: Coordinate::new(1, 2),
                prey: Some(Coordinate::new(1, 1))
            })
        );
    }

    #[tokio::test]
    async fn merge_applies_once_and_keeps_own_entries() {
        let state = GameState::new();
        state.set_location("me", Coordinate::new(1, 1)).await;

        let mut first = GameSnapshot::default();
        first.locations.insert("me".into(), Coordinate::new(9, 9));
        first.locations.insert("p2".into(), Coordinate::new(4, 4));
        first.locations.insert(PREY_ID.into(), Coordinate::new(5, 5));
        first.scores.insert("p2".into(), 3);
        first.scores.insert(PREY_ID.into(), 7);

        assert!(state.merge_incoming("me", first).await);
        assert!(state.has_initial_state());
        assert_eq!(state.location("me").await, Some(Coordinate::new(1, 1)));
        assert_eq!(state.location("p2").await, Some(Coordinate::new(4, 4)));
        assert_eq!(state.score("p2").await, Some(3));
        assert_eq!(state.score(PREY_ID).await, None);

        let mut second = GameSnapshot::default();
        second.locations.insert("p3".into(), Coordinate::new(0, 0));
        assert!(!state.merge_incoming("me", second).await);
        assert_eq!(state.location("p3").await, None);
    }

    #[tokio::test]
    async fn merge_is_not_a_replace() {
        let state = GameState::new();
        state.set_location("me", Coordinate::new(1, 1)).await;
        state.set_location("p9", Coordinate::new(2, 2)).await;

        let mut incoming = GameSnapshot::default();
        incoming.locations.insert("p2".into(), Coordinate::new(4, 4));
        state.merge_incoming("me", incoming).await;

        assert_eq!(state.location("p9").await, Some(Coordinate::new(2, 2)));
        assert_eq!(state.location("p2").await, Some(Coordinate::new(4, 4)));
    }

    #[tokio::test]
    async fn remove_peer_clears_both_maps() {
        let state = GameState::new();
        state.set_location("p2", Coordinate::new(0, 1)).await;
        state.check_and_update_score("p2", 1, 1).await.unwrap();
        state.remove_peer("p2").await;
        assert_eq!(state.location("p2").await, None);
        assert_eq!(state.score("p2").await, None);
    }

    #[tokio::test]
    async fn render_state_splits_self_others_and_prey() {
        let state = GameState::new();
        state.set_location("me", Coordinate::new(1, 1)).await;
        state.set_location("p2", Coordinate::new(2, 2)).await;
        state.set_location(PREY_ID, Coordinate::new(3, 3)).await;
        state.check_and_update_score("me", 1, 1).await.unwrap();

        let view = state.render_state("me").await;
        assert_eq!(view.player, Some(Coordinate::new(1, 1)));
        assert_eq!(view.prey, Some(Coordinate::new(3, 3)));
        assert_eq!(view.others.len(), 1);
        assert_eq!(view.score, 1);
    }
}
