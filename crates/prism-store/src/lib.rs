//! Redis-backed shared state for the render farm: the content-addressed
//! resource cache, session metadata, and the work/ack/command queues.
//!
//! Ordinary commands go through a [`redis::aio::ConnectionManager`].
//! Optimistic `WATCH`/`MULTI`/`EXEC` transactions and blocking pops each
//! get a dedicated connection so their connection-scoped state never
//! leaks into the shared pipeline.

mod cache;
mod queue;
mod retry;
mod session;

pub use cache::{content_hash, ReleaseAction};
pub use queue::{QueueConsumer, WorkerInput};
pub use retry::{attempt, RetryPolicy};
pub use session::{BoundResource, SessionSnapshot};

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("optimistic lock conflict")]
    Conflict,
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid image envelope: {0}")]
    Envelope(#[from] base64::DecodeError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct Store {
    manager: ConnectionManager,
    client: Client,
}

impl Store {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { manager, client })
    }

    /// Handle to the shared multiplexed connection.
    pub(crate) fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// A fresh connection whose WATCH state belongs to one transaction
    /// attempt (or one blocking consumer) alone.
    pub(crate) async fn dedicated(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}
