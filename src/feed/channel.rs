use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};

use super::{ChangeEvent, ChangeFeed, ChangeStream};
use crate::error::RelayError;
use crate::Result;

/// In-process change feed fed through an mpsc channel.
///
/// The receiver is handed out on the first `subscribe`; later subscriptions
/// fail, just as a closed upstream would.
pub struct ChannelChangeFeed {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<ChangeEvent>>>>,
}

impl ChannelChangeFeed {
    pub fn new() -> (mpsc::UnboundedSender<Result<ChangeEvent>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Self {
            receiver: Mutex::new(Some(rx)),
        };
        (tx, feed)
    }
}

#[async_trait]
impl ChangeFeed for ChannelChangeFeed {
    async fn subscribe(&self) -> Result<ChangeStream> {
        let rx = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayError::SubscriptionFailed("channel feed already consumed".into()))?;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(stream.boxed())
    }
}
