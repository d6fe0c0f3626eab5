use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::codec::AudioCodec;
use super::credential::EphemeralCredential;
use super::events::{ClientEvent, SessionSetup, TransportEvent};
use super::{Transport, TransportFactory};

/// Command observed by the peer of a `ChannelTransport`
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    Connect { credential: String, setup: SessionSetup },
    Event(Value),
    Interrupt,
    Close,
}

/// In-process transport backed by tokio channels.
///
/// The engine side holds the matching `ChannelTransportHandle`: it injects
/// events and reads the commands the session sends.
pub struct ChannelTransport {
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    commands_tx: mpsc::UnboundedSender<TransportCommand>,
    closed: AtomicBool,
}

/// Engine side of a `ChannelTransport`
pub struct ChannelTransportHandle {
    events_tx: mpsc::Sender<TransportEvent>,
    commands_rx: mpsc::UnboundedReceiver<TransportCommand>,
}

impl ChannelTransport {
    pub fn pair(capacity: usize) -> (Self, ChannelTransportHandle) {
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let transport = Self {
            events_rx: Mutex::new(Some(events_rx)),
            commands_tx,
            closed: AtomicBool::new(false),
        };
        let handle = ChannelTransportHandle {
            events_tx,
            commands_rx,
        };

        (transport, handle)
    }

    fn command(&self, command: TransportCommand) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("Transport is closed");
        }
        self.commands_tx
            .send(command)
            .map_err(|_| anyhow::anyhow!("Transport peer has gone away"))
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn connect(
        &self,
        credential: &EphemeralCredential,
        setup: &SessionSetup,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut events_rx = self
            .events_rx
            .lock()
            .map_err(|_| anyhow::anyhow!("Transport state poisoned"))?
            .take()
            .context("Transport already connected")?;

        self.command(TransportCommand::Connect {
            credential: credential.value.clone(),
            setup: setup.clone(),
        })?;

        match events_rx.recv().await {
            Some(TransportEvent::SessionCreated { session_id }) => {
                info!(
                    "In-process transport acknowledged session {}",
                    session_id.as_deref().unwrap_or(&setup.session_id)
                );
                Ok(events_rx)
            }
            Some(TransportEvent::Error { message, .. }) => {
                bail!("Handshake rejected: {}", message)
            }
            Some(other) => bail!(
                "Expected session.created during handshake, got {}",
                other.event_type()
            ),
            None => bail!("Transport peer closed during handshake"),
        }
    }

    async fn send_event(&self, event: &ClientEvent) -> Result<()> {
        let value = event.to_value().context("Failed to serialize client event")?;
        self.command(TransportCommand::Event(value))
    }

    async fn interrupt(&self) -> Result<()> {
        self.command(TransportCommand::Interrupt)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Peer may already be gone
        let _ = self.commands_tx.send(TransportCommand::Close);
        debug!("In-process transport closed");
        Ok(())
    }

    fn name(&self) -> &str {
        "in-process"
    }
}

impl ChannelTransportHandle {
    /// Deliver an event to the session
    pub async fn emit(&self, event: TransportEvent) -> Result<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("Session stopped listening"))
    }

    /// Acknowledge the handshake
    pub async fn ack(&self) -> Result<()> {
        self.emit(TransportEvent::SessionCreated { session_id: None }).await
    }

    pub async fn next_command(&mut self) -> Option<TransportCommand> {
        self.commands_rx.recv().await
    }

    pub fn try_next_command(&mut self) -> Option<TransportCommand> {
        self.commands_rx.try_recv().ok()
    }
}

/// Creates `ChannelTransport`s and hands each engine-side handle to the
/// receiver returned by `new`.
pub struct ChannelTransportFactory {
    handles_tx: mpsc::UnboundedSender<ChannelTransportHandle>,
    auto_ack: bool,
    created: Arc<AtomicUsize>,
}

impl ChannelTransportFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelTransportHandle>) {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        (
            Self {
                handles_tx,
                auto_ack: false,
                created: Arc::new(AtomicUsize::new(0)),
            },
            handles_rx,
        )
    }

    /// Queue `session.created` on every new transport so the handshake
    /// completes without the peer's involvement
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Number of transports created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn created_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.created)
    }
}

impl TransportFactory for ChannelTransportFactory {
    fn create(&self, session_id: &str, _codec: AudioCodec) -> Result<Box<dyn Transport>> {
        let (transport, handle) = ChannelTransport::pair(256);

        if self.auto_ack {
            handle
                .events_tx
                .try_send(TransportEvent::SessionCreated {
                    session_id: Some(session_id.to_string()),
                })
                .map_err(|_| anyhow::anyhow!("Failed to queue handshake ack"))?;
        }

        self.handles_tx
            .send(handle)
            .map_err(|_| anyhow::anyhow!("Transport handle receiver dropped"))?;
        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(transport))
    }
}
