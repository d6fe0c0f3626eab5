//! Realtime transport abstraction
//!
//! The transport carries session commands out and raw events in. It is a
//! black box to the session: anything that can perform a handshake and hand
//! back an ordered event stream qualifies.
//! - `ChannelTransport`: in-process peer over tokio channels
//! - `NatsTransport`: events and commands over NATS subjects

mod channel;
mod codec;
mod credential;
mod events;
mod nats;

pub use channel::{
    ChannelTransport, ChannelTransportFactory, ChannelTransportHandle, TransportCommand,
};
pub use codec::AudioCodec;
pub use credential::{
    CredentialProvider, EphemeralCredential, HttpCredentialProvider, StaticCredential,
};
pub use events::{
    ClientEvent, ContentPart, ConversationItem, HistoryItem, HistoryItemType, SessionSetup,
    TransportEvent,
};
pub use nats::{NatsTransport, NatsTransportFactory};

use anyhow::Result;
use tokio::sync::mpsc;

/// Realtime transport trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Perform the handshake.
    ///
    /// Resolves once the remote side acknowledged the session. The returned
    /// receiver carries every subsequent event in delivery order and closes
    /// when the transport goes away.
    async fn connect(
        &self,
        credential: &EphemeralCredential,
        setup: &SessionSetup,
    ) -> Result<mpsc::Receiver<TransportEvent>>;

    async fn send_event(&self, event: &ClientEvent) -> Result<()>;

    /// Cancel in-flight agent speech generation
    async fn interrupt(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Transport name for logging
    fn name(&self) -> &str;
}

/// Builds a fresh transport for each session
pub trait TransportFactory: Send + Sync {
    fn create(&self, session_id: &str, codec: AudioCodec) -> Result<Box<dyn Transport>>;
}
