use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, info};

use super::{ChangeEvent, ChangeFeed, ChangeStream};
use crate::error::{AppError, RelayError};
use crate::Result;

/// NOTIFY channel the `users_change_feed` trigger publishes on
pub const USER_CHANGES_CHANNEL: &str = "user_changes";

/// Change feed backed by Postgres `LISTEN`/`NOTIFY`.
///
/// The `users_change_feed` trigger publishes one JSON payload per row change.
pub struct PgChangeFeed {
    pool: PgPool,
}

impl PgChangeFeed {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self) -> Result<ChangeStream> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| RelayError::SubscriptionFailed(e.to_string()))?;

        listener
            .listen(USER_CHANGES_CHANNEL)
            .await
            .map_err(|e| RelayError::SubscriptionFailed(e.to_string()))?;

        info!("Listening for user changes on channel '{}'", USER_CHANGES_CHANNEL);

        let stream = listener.into_stream().map(|notification| match notification {
            Ok(notification) => {
                debug!(
                    "Notification on '{}' ({} bytes)",
                    notification.channel(),
                    notification.payload().len()
                );
                ChangeEvent::from_payload(notification.payload()).map_err(AppError::from)
            }
            Err(e) => Err(RelayError::SubscriptionFailed(e.to_string()).into()),
        });

        Ok(stream.boxed())
    }
}
