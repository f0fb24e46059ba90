pub mod in_process;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::event::{Channel, Envelope, Event};

pub use in_process::InProcessBus;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BusError {
    #[error("publish to {channel} failed: {message}")]
    Publish { channel: String, message: String },

    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Unavailable(_))
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: Channel, event: &Event) -> Result<Envelope, BusError>;

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Envelope>;
}
