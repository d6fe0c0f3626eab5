use anyhow::{bail, Context, Result};
use async_nats::Client;
use futures::stream::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::codec::AudioCodec;
use super::credential::EphemeralCredential;
use super::events::{ClientEvent, SessionSetup, TransportEvent};
use super::{Transport, TransportFactory};

/// Transport that exchanges JSON events with the agent engine over NATS.
///
/// Events arrive on `<prefix>.events.<session_id>`; commands are published to
/// `<prefix>.commands.<session_id>`.
pub struct NatsTransport {
    url: String,
    session_id: String,
    events_subject: String,
    commands_subject: String,
    client: Mutex<Option<Client>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl NatsTransport {
    pub fn new(url: &str, subject_prefix: &str, session_id: &str) -> Self {
        Self {
            url: url.to_string(),
            session_id: session_id.to_string(),
            events_subject: format!("{}.events.{}", subject_prefix, session_id),
            commands_subject: format!("{}.commands.{}", subject_prefix, session_id),
            client: Mutex::new(None),
            forward_task: Mutex::new(None),
        }
    }

    async fn publish(&self, client: &Client, event: &ClientEvent) -> Result<()> {
        let payload = serde_json::to_vec(&event.to_value()?)?;

        client
            .publish(self.commands_subject.clone(), payload.into())
            .await
            .context("Failed to publish client event")?;

        debug!(
            "Published {} to {}",
            event.event_type(),
            self.commands_subject
        );

        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    async fn connect(
        &self,
        credential: &EphemeralCredential,
        setup: &SessionSetup,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        info!("Connecting to NATS at {} for session {}", self.url, self.session_id);

        let client = async_nats::ConnectOptions::with_token(credential.value.clone())
            .connect(self.url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        // Subscribe before announcing the session so the ack cannot be missed
        let mut subscriber = client
            .subscribe(self.events_subject.clone())
            .await
            .context("Failed to subscribe to session events")?;

        self.publish(
            &client,
            &ClientEvent::SessionUpdate {
                session: setup.clone(),
            },
        )
        .await?;

        loop {
            let Some(message) = subscriber.next().await else {
                bail!("Event subscription closed before session.created");
            };
            match TransportEvent::from_json(&message.payload) {
                TransportEvent::SessionCreated { .. } => break,
                TransportEvent::Error { message, .. } => bail!("Handshake rejected: {}", message),
                other => debug!("Ignoring {} before handshake ack", other.event_type()),
            }
        }

        info!("Session {} acknowledged on {}", self.session_id, self.events_subject);

        let (events_tx, events_rx) = mpsc::channel(256);
        let subject = self.events_subject.clone();

        let forward_task = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let event = TransportEvent::from_json(&message.payload);
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
            info!("Event forwarding stopped for {}", subject);
        });

        *self.client.lock().await = Some(client);
        *self.forward_task.lock().await = Some(forward_task);

        Ok(events_rx)
    }

    async fn send_event(&self, event: &ClientEvent) -> Result<()> {
        let client = self.client.lock().await;
        let client = client.as_ref().context("NATS transport is not connected")?;
        self.publish(client, event).await
    }

    async fn interrupt(&self) -> Result<()> {
        self.send_event(&ClientEvent::ResponseCancel).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.forward_task.lock().await.take() {
            task.abort();
        }

        if let Some(client) = self.client.lock().await.take() {
            info!("Closing NATS connection for session {}", self.session_id);
            if let Err(e) = client.flush().await {
                error!("Failed to flush NATS connection: {}", e);
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}

impl Drop for NatsTransport {
    fn drop(&mut self) {
        if let Some(task) = self.forward_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Builds one `NatsTransport` per session
pub struct NatsTransportFactory {
    url: String,
    subject_prefix: String,
}

impl NatsTransportFactory {
    pub fn new(url: impl Into<String>, subject_prefix: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subject_prefix: subject_prefix.into(),
        }
    }
}

impl TransportFactory for NatsTransportFactory {
    fn create(&self, session_id: &str, codec: AudioCodec) -> Result<Box<dyn Transport>> {
        debug!("Creating NATS transport ({:?}) for session {}", codec, session_id);
        Ok(Box::new(NatsTransport::new(
            &self.url,
            &self.subject_prefix,
            session_id,
        )))
    }
}
