//! Seam to whatever actually hosts player sessions (game server, proxy, or
//! nothing). Picked once at startup and handed to the engine.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{operation} is not supported by the {adapter} adapter")]
    Unsupported {
        adapter: &'static str,
        operation: &'static str,
    },

    #[error("player {0} has no session on this process")]
    NoSession(Uuid),

    #[error("platform call failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this process holds the player's live session.
    fn hosts(&self, uuid: Uuid) -> bool;

    /// Force the player off the network with a message.
    async fn disconnect(&self, uuid: Uuid, message: &str) -> Result<(), AdapterError>;

    /// Move the player to another server.
    async fn transfer(&self, uuid: Uuid, server: &str) -> Result<(), AdapterError>;
}

/// Used when the process hosts no sessions (HTTP-only node).
#[derive(Debug, Default, Clone, Copy)]
pub struct StandaloneAdapter;

#[async_trait]
impl PlatformAdapter for StandaloneAdapter {
    fn name(&self) -> &'static str {
        "standalone"
    }

    fn hosts(&self, _uuid: Uuid) -> bool {
        false
    }

    async fn disconnect(&self, uuid: Uuid, _message: &str) -> Result<(), AdapterError> {
        Err(AdapterError::NoSession(uuid))
    }

    async fn transfer(&self, _uuid: Uuid, _server: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            adapter: self.name(),
            operation: "transfer",
        })
    }
}
