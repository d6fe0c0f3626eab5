use base64::Engine;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::config::{AgentConfig, SessionConfig};
use super::context::SessionContext;
use super::events::{SessionEvent, SessionStatus};
use super::session::{Session, Subscription};
use super::stats::SessionStats;
use crate::audio::{AudioFrame, AudioStreamSource};
use crate::error::ConnectionError;
use crate::guardrail::{GuardrailPipeline, GuardrailVerdict, LanguageLock};
use crate::transcript::{Reconciled, TranscriptItem, TranscriptStore};
use crate::transport::{
    AudioCodec, ClientEvent, CredentialProvider, SessionSetup, Transport, TransportEvent,
    TransportFactory,
};

/// State shared between the controller and its event pump
struct Shared {
    status_tx: watch::Sender<SessionStatus>,
    events_tx: broadcast::Sender<SessionEvent>,
    /// The one live session
    slot: Mutex<Option<Session>>,
    transcript: RwLock<TranscriptStore>,
    /// Bumped by every connect attempt and every teardown. Work started under
    /// an older generation must not touch the slot or the status.
    generation: AtomicU64,
    guardrail_trips: AtomicUsize,
    active_agent: RwLock<Option<String>>,
}

impl Shared {
    fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    /// `Disconnected -> Connecting`, atomically. False if already underway.
    fn begin_connecting(&self) -> bool {
        let started = self.status_tx.send_if_modified(|status| {
            if *status == SessionStatus::Disconnected {
                *status = SessionStatus::Connecting;
                true
            } else {
                false
            }
        });

        if started {
            info!(
                "Session status: {:?} -> {:?}",
                SessionStatus::Disconnected,
                SessionStatus::Connecting
            );
            self.emit(SessionEvent::StatusChanged {
                status: SessionStatus::Connecting,
            });
        }
        started
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            info!("Session status: {:?} -> {:?}", previous, status);
            self.emit(SessionEvent::StatusChanged { status });
        }
    }

    /// Take the session's transcript, leaving the store empty
    async fn end_transcript(&self) -> Vec<TranscriptItem> {
        let items = {
            let mut transcript = self.transcript.write().await;
            let items = transcript.snapshot();
            transcript.clear();
            items
        };
        *self.active_agent.write().await = None;
        items
    }

    /// Transport of the live session, only while `Connected`
    async fn connected_transport(&self) -> Option<Arc<dyn Transport>> {
        let slot = self.slot.lock().await;
        if self.status() != SessionStatus::Connected {
            return None;
        }
        slot.as_ref().map(|session| Arc::clone(&session.transport))
    }
}

/// Single authority over the realtime voice connection.
///
/// At most one live session exists at a time. All transcript mutation
/// happens on the session's event pump; callers only read snapshots.
pub struct SessionController {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(config: SessionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Disconnected);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        info!("Session controller created (codec: {:?})", config.codec);

        Self {
            config,
            factory,
            shared: Arc::new(Shared {
                status_tx,
                events_tx,
                slot: Mutex::new(None),
                transcript: RwLock::new(TranscriptStore::new()),
                generation: AtomicU64::new(0),
                guardrail_trips: AtomicUsize::new(0),
                active_agent: RwLock::new(None),
            }),
        }
    }

    /// Stand up a session.
    ///
    /// Returns `Ok(())` without doing anything if a session is already
    /// connecting or connected. On error the controller is back in
    /// `Disconnected` and the call may be retried.
    pub async fn connect(
        &self,
        credentials: &dyn CredentialProvider,
        agents: Vec<AgentConfig>,
        guardrails: GuardrailPipeline,
    ) -> Result<(), ConnectionError> {
        if !self.shared.begin_connecting() {
            info!("connect() ignored: session is already {:?}", self.status());
            return Ok(());
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match self.establish(generation, credentials, agents, guardrails).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.shared.is_current(generation) {
                    self.shared.set_status(SessionStatus::Disconnected);
                }
                warn!("Connection attempt failed: {}", e);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        generation: u64,
        credentials: &dyn CredentialProvider,
        agents: Vec<AgentConfig>,
        guardrails: GuardrailPipeline,
    ) -> Result<(), ConnectionError> {
        let credential = credentials
            .fetch()
            .await
            .map_err(ConnectionError::Credential)?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let codec = self.config.codec;

        let transport: Arc<dyn Transport> = Arc::from(
            self.factory
                .create(&session_id, codec)
                .map_err(ConnectionError::Handshake)?,
        );

        let setup = SessionSetup {
            session_id: session_id.clone(),
            codec,
            input_audio_format: codec.audio_format().to_string(),
            agents: agents.clone(),
            output_guardrails: guardrails.names(),
        };

        info!("Connecting session {} over {} transport", session_id, transport.name());

        let events = match transport.connect(&credential, &setup).await {
            Ok(events) => events,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!("Failed to close transport after handshake failure: {:#}", close_err);
                }
                return Err(ConnectionError::Handshake(e));
            }
        };

        let context = SessionContext::new(session_id, codec);
        let (audio_tx, audio_rx) = mpsc::channel(self.config.remote_audio_capacity.max(1));

        let mut slot = self.shared.slot.lock().await;
        if !self.shared.is_current(generation) || self.status() != SessionStatus::Connecting {
            drop(slot);
            info!("Connection attempt superseded by disconnect()");
            if let Err(e) = transport.close().await {
                debug!("Failed to close aborted transport: {:#}", e);
            }
            return Err(ConnectionError::Aborted);
        }

        *self.shared.active_agent.write().await = agents.first().map(|a| a.name.clone());

        let pump = EventPump {
            shared: Arc::clone(&self.shared),
            generation,
            context: context.clone(),
            transport: Arc::clone(&transport),
            guardrails,
            audio_tx,
            audio_position_ms: 0,
        };
        let pump = Subscription::new(tokio::spawn(pump.run(events)));

        *slot = Some(Session {
            generation,
            context,
            transport,
            pump,
            remote_audio: Some(audio_rx),
            started_at: Utc::now(),
        });

        // Listeners are registered; only now announce the connection
        self.shared.set_status(SessionStatus::Connected);
        Ok(())
    }

    /// Tear down the live session, if any. Idempotent.
    ///
    /// The transcript lives only as long as the session: it is cleared here
    /// and the final items are returned. Empty when nothing was live.
    pub async fn disconnect(&self) -> Vec<TranscriptItem> {
        let session = {
            let mut slot = self.shared.slot.lock().await;
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };

        if let Some(session) = session {
            debug!("Disconnecting session generation {}", session.generation);
            session.shutdown().await;
        }
        let transcript = self.shared.end_transcript().await;
        self.shared.set_status(SessionStatus::Disconnected);
        transcript
    }

    /// Forward an event to the transport. Dropped with a warning unless connected.
    pub async fn send_event(&self, event: ClientEvent) {
        let Some(transport) = self.shared.connected_transport().await else {
            warn!(
                "Dropping {} event: session is {:?}",
                event.event_type(),
                self.status()
            );
            return;
        };

        if let Err(e) = transport.send_event(&event).await {
            warn!("Failed to send {} event: {:#}", event.event_type(), e);
        }
    }

    /// Cancel in-flight agent speech. Guardrail checks already running for
    /// earlier output are not affected.
    pub async fn interrupt(&self) {
        let Some(transport) = self.shared.connected_transport().await else {
            debug!("interrupt() ignored: session is {:?}", self.status());
            return;
        };

        if let Err(e) = transport.interrupt().await {
            warn!("Failed to interrupt agent: {:#}", e);
        }
    }

    /// Send a user text turn: interrupt, create the item, request a response
    pub async fn send_user_text(&self, text: &str) {
        self.interrupt().await;
        self.send_event(ClientEvent::user_text(text)).await;
        self.send_event(ClientEvent::ResponseCreate).await;
    }

    /// Take the live remote audio stream, once per session
    pub async fn remote_audio(&self) -> Option<mpsc::Receiver<AudioFrame>> {
        let mut slot = self.shared.slot.lock().await;
        slot.as_mut().and_then(|session| session.remote_audio.take())
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn codec(&self) -> AudioCodec {
        self.config.codec
    }

    /// Snapshot of the transcript, ordered by creation time
    pub async fn transcript(&self) -> Vec<TranscriptItem> {
        self.shared.transcript.read().await.snapshot()
    }

    pub async fn active_agent(&self) -> Option<String> {
        self.shared.active_agent.read().await.clone()
    }

    /// The live session's language lock, once established
    pub async fn language_lock(&self) -> Option<LanguageLock> {
        let slot = self.shared.slot.lock().await;
        slot.as_ref()
            .and_then(|session| session.context.language_lock.get().cloned())
    }

    pub async fn stats(&self) -> SessionStats {
        let (session_id, started_at) = {
            let slot = self.shared.slot.lock().await;
            match slot.as_ref() {
                Some(session) => (
                    Some(session.context.session_id.clone()),
                    Some(session.started_at),
                ),
                None => (None, None),
            }
        };

        let duration_secs = started_at
            .map(|t| Utc::now().signed_duration_since(t).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        SessionStats {
            status: self.status(),
            session_id,
            started_at,
            duration_secs,
            transcript_items: self.shared.transcript.read().await.len(),
            guardrail_trips: self.shared.guardrail_trips.load(Ordering::SeqCst),
            active_agent: self.active_agent().await,
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let session = match self.shared.slot.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };

        if let Some(session) = session {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(session.shutdown());
                }
                // Aborts the pump; the transport goes with it
                Err(_) => drop(session),
            }
        }
    }
}

/// Drives one session: applies transport events in delivery order and
/// releases guardrail verdicts as they resolve.
struct EventPump {
    shared: Arc<Shared>,
    generation: u64,
    context: SessionContext,
    transport: Arc<dyn Transport>,
    guardrails: GuardrailPipeline,
    audio_tx: mpsc::Sender<AudioFrame>,
    audio_position_ms: u64,
}

type CheckedOutput = (String, String, GuardrailVerdict);

impl EventPump {
    async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) {
        info!("Event pump started for session {}", self.context.session_id);

        let mut checks: JoinSet<CheckedOutput> = JoinSet::new();

        let reason = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.handle(event, &mut checks).await {
                            break reason;
                        }
                    }
                    None => break "transport event stream closed".to_string(),
                },

                Some(joined) = checks.join_next(), if !checks.is_empty() => match joined {
                    Ok((item_id, text, verdict)) => self.release(item_id, text, verdict).await,
                    Err(e) => error!("Guardrail task failed: {}", e),
                },
            }
        };

        self.terminate(reason).await;
    }

    /// Returns a reason when the session must end
    async fn handle(
        &mut self,
        event: TransportEvent,
        checks: &mut JoinSet<CheckedOutput>,
    ) -> Option<String> {
        match event {
            TransportEvent::AgentOutput { item_id, text } => {
                self.review(item_id, text, checks).await;
            }
            TransportEvent::OutputAudioDelta {
                audio,
                sample_rate,
                channels,
            } => self.forward_audio(&audio, sample_rate, channels),
            TransportEvent::Error { message, fatal } => {
                self.shared.emit(SessionEvent::TransportError {
                    message: message.clone(),
                    fatal,
                });
                if fatal {
                    error!("Fatal transport error: {}", message);
                    return Some(message);
                }
                warn!("Transport error: {}", message);
            }
            TransportEvent::SessionCreated { .. } => {
                debug!("Ignoring repeated session.created");
            }
            other => self.reconcile(&other).await,
        }
        None
    }

    async fn reconcile(&self, event: &TransportEvent) {
        let outcome = self.shared.transcript.write().await.apply(event);

        match outcome {
            Reconciled::Item(item_id) => self.shared.emit(SessionEvent::TranscriptUpdated {
                item_id: Some(item_id),
            }),
            Reconciled::Bulk => self
                .shared
                .emit(SessionEvent::TranscriptUpdated { item_id: None }),
            Reconciled::Handoff(agent) => {
                *self.shared.active_agent.write().await = Some(agent.clone());
                self.shared.emit(SessionEvent::AgentHandoff { agent });
            }
            Reconciled::Unchanged | Reconciled::NotTranscript => {}
        }
    }

    /// Record candidate agent text and start the guardrail run for it
    async fn review(&self, item_id: String, text: String, checks: &mut JoinSet<CheckedOutput>) {
        if self.guardrails.is_empty() {
            self.shared
                .transcript
                .write()
                .await
                .record_agent_output(&item_id, &text);
            self.release(item_id, text, GuardrailVerdict::empty()).await;
            return;
        }

        let history = {
            let mut transcript = self.shared.transcript.write().await;
            transcript.record_agent_output(&item_id, &text);
            transcript.hold_for_review(&item_id);
            transcript.snapshot()
        };
        self.shared.emit(SessionEvent::TranscriptUpdated {
            item_id: Some(item_id.clone()),
        });

        let context = self.context.guardrail_context(history);
        let pipeline = self.guardrails.clone();
        debug!("Running {} guardrails for {}", pipeline.names().len(), item_id);

        checks.spawn(async move {
            let verdict = pipeline.run(&text, &context).await;
            (item_id, text, verdict)
        });
    }

    async fn release(&self, item_id: String, text: String, verdict: GuardrailVerdict) {
        self.shared
            .transcript
            .write()
            .await
            .set_guardrail_verdict(&item_id, verdict.clone());
        self.shared.emit(SessionEvent::TranscriptUpdated {
            item_id: Some(item_id.clone()),
        });

        if !verdict.tripwire_triggered {
            self.shared.emit(SessionEvent::AgentUtterance {
                item_id,
                text,
                verdict,
            });
            return;
        }

        self.shared.guardrail_trips.fetch_add(1, Ordering::SeqCst);
        warn!(
            "Guardrail tripped for {}: {}",
            item_id,
            verdict.reason.as_deref().unwrap_or("unspecified")
        );
        if let Err(e) = self.transport.interrupt().await {
            warn!("Failed to interrupt agent after guardrail trip: {:#}", e);
        }
        self.shared
            .emit(SessionEvent::GuardrailTripped { item_id, verdict });
    }

    fn forward_audio(&mut self, audio: &str, sample_rate: u32, channels: u16) {
        let bytes = match base64::engine::general_purpose::STANDARD.decode(audio) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping undecodable output audio: {}", e);
                return;
            }
        };

        let frame = AudioFrame::from_pcm16_le(
            &bytes,
            sample_rate,
            channels,
            self.audio_position_ms,
            AudioStreamSource::Remote,
        );
        self.audio_position_ms += frame.duration_ms();

        match self.audio_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Remote audio consumer lagging, dropping frame"),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// End the session from inside: the transport failed or went away
    async fn terminate(self, reason: String) {
        let session = {
            let mut slot = self.shared.slot.lock().await;
            if !self.shared.is_current(self.generation) {
                return;
            }
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };

        let Some(mut session) = session else {
            return;
        };

        warn!("Session {} ended: {}", session.context.session_id, reason);
        // This task is the pump; it must not abort itself
        session.pump.detach();
        session.shutdown().await;

        let transcript = self.shared.end_transcript().await;
        self.shared.set_status(SessionStatus::Disconnected);
        self.shared
            .emit(SessionEvent::Disconnected { reason, transcript });
    }
}
