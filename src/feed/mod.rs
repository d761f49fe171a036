//! Change feed module for the kittyparty server
//!
//! A change feed yields one typed event per committed mutation of the users
//! collection, each carrying the full post-change document.

mod channel;
mod event;
mod postgres;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use channel::ChannelChangeFeed;
pub use event::{ChangeEvent, DocumentKey, UpdateDescription, UserDocument};
pub use postgres::{PgChangeFeed, USER_CHANGES_CHANNEL};

use crate::Result;

/// Items are `Err(RelayError::MalformedEvent)` for payloads that could not be
/// parsed; any other error means the subscription itself is broken.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a single long-lived subscription.
    async fn subscribe(&self) -> Result<ChangeStream>;
}
