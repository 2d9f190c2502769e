//! MQTT broker adapter over `rumqttc`.
//!
//! A background task drives the event loop and forwards publishes into a
//! queue that [`BrokerClient::poll`] drains without waiting. When the event
//! loop reports an error the task ends and the client reads as disconnected;
//! the command worker decides when to connect again.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrokerClient, BrokerError, InboundMessage};
use crate::config::BrokerConfig;

const INBOX_CAPACITY: usize = 32;
const REQUEST_CAPACITY: usize = 16;

pub struct MqttBroker {
    host: String,
    port: u16,
    client_id: String,
    keep_alive: Duration,
    session: Option<MqttSession>,
}

struct MqttSession {
    client: AsyncClient,
    inbox: mpsc::Receiver<InboundMessage>,
    connected: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl MqttBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            keep_alive: config.keep_alive(),
            session: None,
        }
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.driver.abort();
        }
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.close_session();
    }
}

async fn drive(
    mut eventloop: EventLoop,
    inbox: mpsc::Sender<InboundMessage>,
    connected: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), BrokerError>>,
) {
    let mut ready = Some(ready);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let result = if ack.code == ConnectReturnCode::Success {
                    connected.store(true, Ordering::Release);
                    Ok(())
                } else {
                    Err(BrokerError::Refused(format!("{:?}", ack.code)))
                };
                let refused = result.is_err();
                if let Some(ready) = ready.take() {
                    let _ = ready.send(result);
                }
                if refused {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(publish.topic, publish.payload);
                if inbox.try_send(message).is_err() {
                    warn!("MQTT inbox full, dropping message");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                debug!("Broker closed the session");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(BrokerError::Connect(e.to_string())));
                    }
                    None => warn!(error = %e, "MQTT connection lost"),
                }
                break;
            }
        }
    }

    connected.store(false, Ordering::Release);
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.close_session();

        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let connected = Arc::new(AtomicBool::new(false));

        let driver = tokio::spawn(drive(eventloop, inbox_tx, Arc::clone(&connected), ready_tx));
        self.session = Some(MqttSession {
            client,
            inbox: inbox_rx,
            connected,
            driver,
        });

        let outcome = match tokio::time::timeout(self.keep_alive, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Connect("event loop ended".to_string())),
            Err(_) => Err(BrokerError::Connect("timed out waiting for CONNACK".to_string())),
        };

        match outcome {
            Ok(()) => {
                info!(
                    broker = %format!("{}:{}", self.host, self.port),
                    client_id = %self.client_id,
                    "Connected to MQTT broker"
                );
                Ok(())
            }
            Err(e) => {
                self.close_session();
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.connected.load(Ordering::Acquire))
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let session = self.session.as_ref().ok_or(BrokerError::NotConnected)?;
        session
            .client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let session = self.session.as_ref().ok_or(BrokerError::NotConnected)?;
        session
            .client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        let Some(session) = self.session.as_mut() else {
            return Err(BrokerError::NotConnected);
        };
        match session.inbox.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(BrokerError::NotConnected),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.as_ref() {
            let _ = session.client.disconnect().await;
        }
        self.close_session();
    }
}
