//! Change relay for the kittyparty server
//!
//! Bridges user change events from the persistence layer to the WebSocket
//! rooms: every committed coin balance update is pushed to the room named
//! after the user.
//!
//! State machine: `Idle -> Watching -> Filtering -> Dispatching -> Watching`,
//! with `Stopped` once retries are exhausted or shutdown is requested.

mod retry;

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

pub use retry::{Backoff, RetryConfig};

use crate::error::{AppError, RelayError};
use crate::feed::{ChangeEvent, ChangeFeed, ChangeStream};
use crate::websocket::{RoomRegistry, ServerMessage};
use crate::Result;

/// Field whose change triggers a broadcast
pub const BALANCE_FIELD: &str = "Coins";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Idle,
    Watching,
    Filtering,
    Dispatching,
    Stopped,
}

impl RelayState {
    /// True while a subscription is open.
    pub fn is_watching(&self) -> bool {
        matches!(
            self,
            RelayState::Watching | RelayState::Filtering | RelayState::Dispatching
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinUpdate {
    pub user_id: String,
    pub coins: u64,
}

/// Extracts the balance update carried by `event`, if any.
///
/// Only `update` events qualify. The full document must carry a balance and,
/// when the feed reports which fields changed, the balance must be one of them.
pub fn coin_update_for(event: &ChangeEvent) -> Option<CoinUpdate> {
    let ChangeEvent::Update {
        full_document,
        update_description,
    } = event
    else {
        return None;
    };

    let document = full_document.as_ref()?;
    let coins = document.coins?;

    if let Some(description) = update_description {
        if !description.touches(BALANCE_FIELD) {
            return None;
        }
    }

    Some(CoinUpdate {
        user_id: document.id.clone(),
        coins,
    })
}

pub struct Relay {
    feed: Arc<dyn ChangeFeed>,
    registry: RoomRegistry,
    retry: RetryConfig,
    state: watch::Sender<RelayState>,
    shutdown: Notify,
}

impl Relay {
    pub fn new(feed: Arc<dyn ChangeFeed>, registry: RoomRegistry, retry: RetryConfig) -> Self {
        let (state, _) = watch::channel(RelayState::Idle);
        Self {
            feed,
            registry,
            retry,
            state,
            shutdown: Notify::new(),
        }
    }

    /// Readiness signal for health endpoints and monitoring.
    pub fn status(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Asks a running (or not yet started) relay to stop.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    fn set_state(&self, state: RelayState) {
        self.state.send_replace(state);
    }

    /// Watches the feed until shutdown, resubscribing with backoff when the
    /// subscription fails or closes.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = Backoff::new(self.retry.clone());

        loop {
            let subscription = tokio::select! {
                biased;
                _ = self.shutdown.notified() => return self.finish(),
                subscription = self.feed.subscribe() => subscription,
            };

            match subscription {
                Ok(stream) => {
                    backoff.reset();
                    self.set_state(RelayState::Watching);
                    info!("Relay watching for coin updates");

                    match self.watch(stream).await {
                        Ok(()) => return self.finish(),
                        Err(e) => warn!("Change feed subscription lost: {}", e),
                    }
                }
                Err(e) => error!("Failed to subscribe to change feed: {}", e),
            }

            self.set_state(RelayState::Idle);

            let Some(delay) = backoff.next_delay() else {
                self.set_state(RelayState::Stopped);
                error!(
                    "Relay stopped after {} consecutive subscription failures; real-time coin updates are offline",
                    backoff.max_retries()
                );
                return Err(RelayError::RetriesExhausted(backoff.max_retries()).into());
            };

            warn!(
                "Resubscribing to change feed in {:?} (attempt {}/{})",
                delay,
                backoff.attempt(),
                backoff.max_retries()
            );

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => return self.finish(),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish(&self) -> Result<()> {
        self.set_state(RelayState::Stopped);
        info!("Relay stopped");
        Ok(())
    }

    /// Returns `Ok` on shutdown and `Err` when the subscription breaks.
    async fn watch(&self, mut stream: ChangeStream) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => return Ok(()),
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        self.handle_event(event).await;
                    }
                    Some(Err(AppError::RelayError(RelayError::MalformedEvent(reason)))) => {
                        warn!("Skipping malformed change event: {}", reason);
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(RelayError::SubscriptionClosed.into()),
                },
            }
        }
    }

    /// Filters one event and dispatches it. Returns the number of connections
    /// that received a coin update.
    ///
    /// The relay state is restored afterwards, so an idle or stopped relay
    /// never reports itself as watching.
    pub async fn handle_event(&self, event: ChangeEvent) -> usize {
        let previous = self.state();
        self.set_state(RelayState::Filtering);

        let delivered = match coin_update_for(&event) {
            Some(update) => {
                self.set_state(RelayState::Dispatching);
                let msg = ServerMessage::CoinUpdate { coins: update.coins };

                match self.registry.broadcast_json(&update.user_id, &msg).await {
                    Ok(delivered) => {
                        info!(
                            "Coins updated for user {}: {} (delivered to {} connection(s))",
                            update.user_id, update.coins, delivered
                        );
                        delivered
                    }
                    Err(e) => {
                        error!("Failed to dispatch coin update for user {}: {}", update.user_id, e);
                        0
                    }
                }
            }
            None => {
                debug!("Ignoring {} event", event.kind());
                0
            }
        };

        self.set_state(previous);
        delivered
    }
}
