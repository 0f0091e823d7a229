//! Render-state push to the rendering client.
//!
//! Handlers that change the board poke a [`RenderNotifier`]; a single push
//! task coalesces those pokes, builds a fresh [`GameRenderState`] and
//! publishes it on a `watch` channel the client reads from.

use std::collections::HashMap;
use std::sync::Arc;

use quarry_protocol::{Coordinate, PeerId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::state::GameState;

/// Snapshot the rendering client draws from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRenderState {
    pub player_id: PeerId,
    pub player: Option<Coordinate>,
    pub others: HashMap<PeerId, Coordinate>,
    pub prey: Option<Coordinate>,
    pub score: i64,
    pub scores: HashMap<PeerId, i64>,
}

impl GameRenderState {
    /// JSON form handed to out-of-process rendering clients.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Cheap, non-blocking "state changed" signal.
#[derive(Debug, Clone)]
pub struct RenderNotifier {
    tx: mpsc::Sender<()>,
}

impl RenderNotifier {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// A pending poke already covers this one, so a full queue is fine.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Game-state push loop. Ends when every notifier or the client is gone.
pub async fn run_render_loop(
    self_id: PeerId,
    state: Arc<GameState>,
    mut pokes: mpsc::Receiver<()>,
    view: watch::Sender<GameRenderState>,
) {
    while pokes.recv().await.is_some() {
        let snapshot = state.render_state(&self_id).await;
        if view.send(snapshot).is_err() {
            debug!("render client gone, stopping push loop");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pokes_coalesce_into_fresh_snapshots() {
        let state = Arc::new(GameState::new());
        let (notifier, pokes) = RenderNotifier::channel();
        let (view_tx, mut view) = watch::channel(GameRenderState::default());
        let task = tokio::spawn(run_render_loop("me".into(), state.clone(), pokes, view_tx));

        state.set_location("me", Coordinate::new(3, 4)).await;
        notifier.notify();
        notifier.notify();
        notifier.notify();

        tokio_test::assert_ok!(view.changed().await);
        assert_eq!(view.borrow().player, Some(Coordinate::new(3, 4)));
        assert_eq!(view.borrow().player_id, "me");

        drop(notifier);
        tokio_test::assert_ok!(task.await);
    }

    #[test]
    fn json_view_uses_snake_case_fields() {
        let view = GameRenderState {
            player_id: "player1".into(),
            player: Some(Coordinate::new(1, 2)),
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::from_str(&view.to_json().unwrap()).unwrap();
        assert_eq!(json["player_id"], "player1");
        assert_eq!(json["player"]["x"], 1);
        assert!(json["prey"].is_null());
    }

    #[tokio::test]
    async fn loop_ends_when_the_client_goes_away() {
        let (notifier, pokes) = RenderNotifier::channel();
        let (view_tx, view) = watch::channel(GameRenderState::default());
        let task = tokio::spawn(run_render_loop(
            "me".into(),
            Arc::new(GameState::new()),
            pokes,
            view_tx,
        ));
        drop(view);
        notifier.notify();
        tokio_test::assert_ok!(task.await);
    }
}
