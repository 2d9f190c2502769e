//! Command channel: broker capability, command vocabulary and the worker
//! that keeps the node subscribed and answering.

mod mqtt;
mod vocabulary;
mod worker;

pub use mqtt::MqttBroker;
pub use vocabulary::{Command, CommandHandler, StatusMessage};
pub use worker::{ChannelSession, ChannelState, CommandChannel, CommandStats, CommandStatsSnapshot};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("broker refused session: {0}")]
    Refused(String),

    #[error("broker request failed: {0}")]
    Request(String),

    #[error("not connected to broker")]
    NotConnected,
}

/// One message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as trimmed text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).trim().to_string()
    }
}

/// Publish/subscribe broker capability.
///
/// Owned exclusively by the command worker. Inbound traffic is pumped with
/// [`BrokerClient::poll`], which must never wait for a message.
#[async_trait]
pub trait BrokerClient: Send {
    async fn connect(&mut self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Next queued inbound message, if any.
    async fn poll(&mut self) -> Result<Option<InboundMessage>, BrokerError>;

    async fn disconnect(&mut self);
}
