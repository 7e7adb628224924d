//! [`CommandSink`] – the narrow seam between policy code and the serial
//! layer.

use std::time::Duration;

use async_trait::async_trait;
use mdroid_types::{AckCondition, Entry, Message};

use crate::error::LinkError;
use crate::manager::LinkManager;

/// Anything that can carry a command to the vehicle.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Queue `message` for transmission without waiting for it.
    fn route(&self, message: Message) -> Result<(), LinkError>;

    /// Queue `message` and wait until `ack` shows up in the state store.
    async fn await_ack(
        &self,
        message: Message,
        ack: AckCondition,
        timeout: Duration,
    ) -> Result<Entry, LinkError>;
}

#[async_trait]
impl CommandSink for LinkManager {
    fn route(&self, message: Message) -> Result<(), LinkError> {
        LinkManager::route(self, message)
    }

    async fn await_ack(
        &self,
        message: Message,
        ack: AckCondition,
        timeout: Duration,
    ) -> Result<Entry, LinkError> {
        LinkManager::await_ack(self, message, ack, timeout).await
    }
}
