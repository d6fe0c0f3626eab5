// Integration tests for the session controller
//
// Sessions run against the in-process ChannelTransport: the test plays the
// agent engine through the ChannelTransportHandle.

use anyhow::Result;
use base64::Engine;
use loqa_voice::audio::{
    AudioFrame, AudioRecorder, AudioStreamSource, MicrophoneSource, RecorderConfig,
};
use loqa_voice::error::{AudioError, ClassifierError, ConnectionError};
use loqa_voice::guardrail::{
    Classifier, ClassifierRequest, GuardrailPipeline, LanguageLockGuardrail, LanguagePolicy,
};
use loqa_voice::session::{
    AgentConfig, SessionConfig, SessionController, SessionEvent, SessionStatus,
};
use loqa_voice::transcript::Role;
use loqa_voice::transport::{
    ChannelTransportFactory, ChannelTransportHandle, CredentialProvider, EphemeralCredential,
    HistoryItem, StaticCredential, TransportCommand, TransportEvent,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn agents() -> Vec<AgentConfig> {
    vec![AgentConfig::new("support", "Help with connectivity issues").with_handoff("billing")]
}

fn credential() -> StaticCredential {
    StaticCredential("ek_test".to_string())
}

fn controller(auto_ack: bool) -> (Arc<SessionController>, Arc<AtomicUsize>, Handles) {
    let (factory, handles) = ChannelTransportFactory::new();
    let factory = factory.auto_ack(auto_ack);
    let created = factory.created_counter();
    let controller = SessionController::new(SessionConfig::default(), Arc::new(factory));
    (Arc::new(controller), created, handles)
}

type Handles = mpsc::UnboundedReceiver<ChannelTransportHandle>;

/// Connected controller, the engine side of its transport, and the receiver
/// for transports created later
async fn connected() -> Result<(Arc<SessionController>, ChannelTransportHandle, Handles)> {
    let (controller, _, mut handles) = controller(true);
    controller
        .connect(&credential(), agents(), GuardrailPipeline::default())
        .await?;
    let mut handle = handles.recv().await.expect("transport created");

    // Handshake command
    match handle.next_command().await {
        Some(TransportCommand::Connect { credential, setup }) => {
            assert_eq!(credential, "ek_test");
            assert_eq!(setup.agents[0].name, "support");
        }
        other => panic!("expected connect command, got {:?}", other),
    }
    Ok((controller, handle, handles))
}

async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn wait_for_status(controller: &SessionController, status: SessionStatus) {
    let mut watch = controller.status_watch();
    timeout(WAIT, watch.wait_for(|s| *s == status))
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed");
}

struct FailingCredential;

#[async_trait::async_trait]
impl CredentialProvider for FailingCredential {
    async fn fetch(&self) -> Result<EphemeralCredential> {
        anyhow::bail!("credential endpoint returned 500")
    }
}

#[tokio::test]
async fn test_connect_reaches_connected() -> Result<()> {
    let (controller, _handle, _handles) = connected().await?;

    assert_eq!(controller.status(), SessionStatus::Connected);
    assert_eq!(controller.active_agent().await.as_deref(), Some("support"));

    let stats = controller.stats().await;
    assert_eq!(stats.status, SessionStatus::Connected);
    assert!(stats.session_id.is_some());
    Ok(())
}

#[tokio::test]
async fn test_connect_twice_yields_one_transport() -> Result<()> {
    let (controller, created, _handles) = controller(true);

    controller
        .connect(&credential(), agents(), GuardrailPipeline::default())
        .await?;
    controller
        .connect(&credential(), agents(), GuardrailPipeline::default())
        .await?;

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(controller.status(), SessionStatus::Connected);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_connects_yield_one_transport() -> Result<()> {
    let (controller, created, _handles) = controller(true);
    let cred = credential();

    let (a, b) = tokio::join!(
        controller.connect(&cred, agents(), GuardrailPipeline::default()),
        controller.connect(&cred, agents(), GuardrailPipeline::default()),
    );
    a?;
    b?;

    assert_eq!(created.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_credential_failure_reverts_to_disconnected() -> Result<()> {
    let (controller, created, _handles) = controller(true);
    let mut events = controller.subscribe();

    let result = controller
        .connect(&FailingCredential, agents(), GuardrailPipeline::default())
        .await;

    assert!(matches!(result, Err(ConnectionError::Credential(_))));
    assert_eq!(controller.status(), SessionStatus::Disconnected);
    assert_eq!(created.load(Ordering::SeqCst), 0);

    // Connecting, then back to Disconnected
    next_event(&mut events, |e| {
        *e == SessionEvent::StatusChanged {
            status: SessionStatus::Connecting,
        }
    })
    .await;
    next_event(&mut events, |e| {
        *e == SessionEvent::StatusChanged {
            status: SessionStatus::Disconnected,
        }
    })
    .await;

    // A retry works
    controller
        .connect(&credential(), agents(), GuardrailPipeline::default())
        .await?;
    assert_eq!(controller.status(), SessionStatus::Connected);
    Ok(())
}

#[tokio::test]
async fn test_handshake_rejection_reverts_to_disconnected() -> Result<()> {
    let (controller, _, mut handles) = controller(false);

    let engine = tokio::spawn(async move {
        let handle = handles.recv().await.expect("transport created");
        handle
            .emit(TransportEvent::Error {
                message: "invalid credential".to_string(),
                fatal: true,
            })
            .await
            .expect("session listening");
        handle
    });

    let result = controller
        .connect(&credential(), agents(), GuardrailPipeline::default())
        .await;

    assert!(matches!(result, Err(ConnectionError::Handshake(_))));
    assert_eq!(controller.status(), SessionStatus::Disconnected);

    let mut handle = engine.await?;
    let mut saw_close = false;
    while let Some(command) = handle.try_next_command() {
        saw_close |= command == TransportCommand::Close;
    }
    assert!(saw_close, "failed transport must be closed");
    Ok(())
}

#[tokio::test]
async fn test_disconnect_during_connect_leaves_no_zombie() -> Result<()> {
    let (controller, _, mut handles) = controller(false);

    let connecting = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller
                .connect(&credential(), agents(), GuardrailPipeline::default())
                .await
        })
    };

    let mut handle = timeout(WAIT, handles.recv()).await?.expect("transport created");
    assert_eq!(controller.status(), SessionStatus::Connecting);

    controller.disconnect().await;
    assert_eq!(controller.status(), SessionStatus::Disconnected);

    // The engine acknowledges too late
    handle.ack().await?;
    let result = connecting.await?;

    assert!(matches!(result, Err(ConnectionError::Aborted)));
    assert_eq!(controller.status(), SessionStatus::Disconnected);
    assert!(controller.stats().await.session_id.is_none());

    let mut saw_close = false;
    while let Some(command) = timeout(WAIT, handle.next_command()).await? {
        if command == TransportCommand::Close {
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);
    Ok(())
}

#[tokio::test]
async fn test_send_event_dropped_unless_connected() -> Result<()> {
    let (controller, _, _handles) = controller(true);

    // Not connected: silently dropped
    controller.send_user_text("hello").await;
    assert_eq!(controller.status(), SessionStatus::Disconnected);

    let (controller, mut handle, _handles) = connected().await?;
    controller.send_user_text("Is there an outage?").await;

    let interrupt = timeout(WAIT, handle.next_command()).await?;
    assert_eq!(interrupt, Some(TransportCommand::Interrupt));

    match timeout(WAIT, handle.next_command()).await? {
        Some(TransportCommand::Event(value)) => {
            assert_eq!(value["type"], "conversation.item.create");
            assert_eq!(value["item"]["content"][0]["text"], "Is there an outage?");
        }
        other => panic!("expected user item, got {:?}", other),
    }
    match timeout(WAIT, handle.next_command()).await? {
        Some(TransportCommand::Event(value)) => assert_eq!(value["type"], "response.create"),
        other => panic!("expected response.create, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_disconnect_is_idempotent() -> Result<()> {
    let (controller, mut handle, _handles) = connected().await?;

    controller.disconnect().await;
    controller.disconnect().await;

    assert_eq!(controller.status(), SessionStatus::Disconnected);
    assert_eq!(timeout(WAIT, handle.next_command()).await?, Some(TransportCommand::Close));

    // Sending after disconnect goes nowhere
    controller.send_event(loqa_voice::transport::ClientEvent::ResponseCreate).await;
    assert!(handle.try_next_command().is_none());
    Ok(())
}

#[tokio::test]
async fn test_fatal_transport_error_disconnects() -> Result<()> {
    let (controller, handle, _handles) = connected().await?;
    let mut events = controller.subscribe();

    handle
        .emit(TransportEvent::HistoryAdded {
            item: HistoryItem::message("u1", Role::User, "Hello?").at(10),
        })
        .await?;
    handle
        .emit(TransportEvent::Error {
            message: "socket reset".to_string(),
            fatal: true,
        })
        .await?;

    wait_for_status(&controller, SessionStatus::Disconnected).await;
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    match event {
        SessionEvent::Disconnected { reason, transcript } => {
            assert_eq!(reason, "socket reset");
            assert_eq!(transcript.len(), 1);
            assert_eq!(transcript[0].content, "Hello?");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(controller.transcript().await.is_empty());

    // A fresh session can be started afterwards
    controller
        .connect(&credential(), agents(), GuardrailPipeline::default())
        .await?;
    assert_eq!(controller.status(), SessionStatus::Connected);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_clears_transcript() -> Result<()> {
    let (controller, handle, _handles) = connected().await?;
    let mut events = controller.subscribe();

    handle
        .emit(TransportEvent::HistoryAdded {
            item: HistoryItem::message("u1", Role::User, "My router is blinking red").at(10),
        })
        .await?;
    next_event(&mut events, |e| matches!(e, SessionEvent::TranscriptUpdated { .. })).await;
    assert_eq!(controller.transcript().await.len(), 1);

    let last = controller.disconnect().await;
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].item_id, "u1");

    assert!(controller.transcript().await.is_empty());
    assert!(controller.active_agent().await.is_none());
    let stats = controller.stats().await;
    assert_eq!(stats.status, SessionStatus::Disconnected);
    assert_eq!(stats.transcript_items, 0);

    // Nothing live: nothing to hand back
    assert!(controller.disconnect().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_non_fatal_error_keeps_session() -> Result<()> {
    let (controller, handle, _handles) = connected().await?;
    let mut events = controller.subscribe();

    handle
        .emit(TransportEvent::Error {
            message: "rate limited".to_string(),
            fatal: false,
        })
        .await?;

    next_event(&mut events, |e| {
        matches!(e, SessionEvent::TransportError { fatal: false, .. })
    })
    .await;
    assert_eq!(controller.status(), SessionStatus::Connected);
    Ok(())
}

#[tokio::test]
async fn test_transport_close_disconnects() -> Result<()> {
    let (controller, handle, _handles) = connected().await?;

    drop(handle);

    wait_for_status(&controller, SessionStatus::Disconnected).await;
    Ok(())
}

#[tokio::test]
async fn test_events_reconcile_into_transcript() -> Result<()> {
    let (controller, handle, _handles) = connected().await?;
    let mut events = controller.subscribe();

    handle
        .emit(TransportEvent::HistoryAdded {
            item: HistoryItem::message("u1", Role::User, "").at(10),
        })
        .await?;
    for part in ["Is there ", "an outage?"] {
        handle
            .emit(TransportEvent::TranscriptionDelta {
                item_id: "u1".to_string(),
                delta: part.to_string(),
                role: Some(Role::User),
            })
            .await?;
    }
    handle
        .emit(TransportEvent::TranscriptionCompleted {
            item_id: "u1".to_string(),
            transcript: None,
            role: Some(Role::User),
        })
        .await?;
    handle
        .emit(TransportEvent::from_json(br#"{"type":"some.future.event"}"#))
        .await?;
    handle
        .emit(TransportEvent::AgentOutput {
            item_id: "a1".to_string(),
            text: "No outage reported.".to_string(),
        })
        .await?;

    let utterance =
        next_event(&mut events, |e| matches!(e, SessionEvent::AgentUtterance { .. })).await;
    match utterance {
        SessionEvent::AgentUtterance { item_id, text, verdict } => {
            assert_eq!(item_id, "a1");
            assert_eq!(text, "No outage reported.");
            assert!(!verdict.tripwire_triggered);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let transcript = controller.transcript().await;
    let user = transcript.iter().find(|i| i.item_id == "u1").unwrap();
    assert_eq!(user.content, "Is there an outage?");
    assert!(user.is_done());
    assert_eq!(transcript[0].item_id, "u1");
    assert_eq!(controller.status(), SessionStatus::Connected);
    Ok(())
}

#[tokio::test]
async fn test_handoff_updates_active_agent() -> Result<()> {
    let (controller, handle, _handles) = connected().await?;
    let mut events = controller.subscribe();

    handle
        .emit(TransportEvent::AgentHandoff {
            history: vec![HistoryItem::function_call("f1", "transfer_to_billing")],
        })
        .await?;

    let event = next_event(&mut events, |e| matches!(e, SessionEvent::AgentHandoff { .. })).await;
    assert_eq!(
        event,
        SessionEvent::AgentHandoff {
            agent: "billing".to_string()
        }
    );
    assert_eq!(controller.active_agent().await.as_deref(), Some("billing"));
    Ok(())
}

#[tokio::test]
async fn test_output_audio_reaches_remote_stream() -> Result<()> {
    let (controller, handle, _handles) = connected().await?;
    let mut remote = controller.remote_audio().await.expect("remote audio available");
    assert!(controller.remote_audio().await.is_none(), "taken once per session");

    // 16384 and -16384 as 16-bit little-endian
    let pcm = [0x00u8, 0x40, 0x00, 0xC0];
    handle
        .emit(TransportEvent::OutputAudioDelta {
            audio: base64::engine::general_purpose::STANDARD.encode(pcm),
            sample_rate: 24000,
            channels: 1,
        })
        .await?;

    let frame = timeout(WAIT, remote.recv()).await?.expect("frame forwarded");
    assert_eq!(frame.samples, vec![0.5, -0.5]);
    assert_eq!(frame.sample_rate, 24000);
    Ok(())
}

/// Hindi for user speech, English for everything else
struct LanguageScript;

#[async_trait::async_trait]
impl Classifier for LanguageScript {
    async fn classify(&self, request: ClassifierRequest) -> Result<Value, ClassifierError> {
        let is_devanagari = request
            .text
            .chars()
            .any(|c| ('\u{0900}'..='\u{097F}').contains(&c));

        Ok(if is_devanagari {
            json!({ "language": "Hindi", "iso_code": "hi", "confidence": 0.97 })
        } else {
            json!({ "language": "English", "iso_code": "en", "confidence": 0.9 })
        })
    }
}

#[tokio::test]
async fn test_language_lock_withholds_mismatched_reply() -> Result<()> {
    let (controller, _, mut handles) = controller(true);
    let pipeline = GuardrailPipeline::new(vec![Arc::new(LanguageLockGuardrail::new(
        Arc::new(LanguageScript),
        LanguagePolicy::default(),
    ))]);

    controller.connect(&credential(), agents(), pipeline).await?;
    let mut handle = handles.recv().await.expect("transport created");
    let mut events = controller.subscribe();

    handle
        .emit(TransportEvent::HistoryAdded {
            item: HistoryItem::message("u1", Role::User, "मेरा इंटरनेट काम नहीं कर रहा है").at(10),
        })
        .await?;
    handle
        .emit(TransportEvent::AgentOutput {
            item_id: "a1".to_string(),
            text: "Please restart your router.".to_string(),
        })
        .await?;

    let event =
        next_event(&mut events, |e| matches!(e, SessionEvent::GuardrailTripped { .. })).await;
    match event {
        SessionEvent::GuardrailTripped { item_id, verdict } => {
            assert_eq!(item_id, "a1");
            assert_eq!(verdict.reason.as_deref(), Some("language_mismatch"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let transcript = controller.transcript().await;
    let reply = transcript.iter().find(|i| i.item_id == "a1").unwrap();
    assert!(reply.is_withheld());
    assert_eq!(reply.display_text(), "[response withheld by guardrail]");
    assert_eq!(reply.content, "Please restart your router.");

    let lock = controller.language_lock().await.expect("lock established");
    assert_eq!(lock.iso_code.as_deref(), Some("hi"));
    assert_eq!(controller.stats().await.guardrail_trips, 1);

    // The agent was interrupted after the trip
    let mut interrupted = false;
    while let Ok(Some(command)) = timeout(Duration::from_millis(500), handle.next_command()).await {
        if command == TransportCommand::Interrupt {
            interrupted = true;
            break;
        }
    }
    assert!(interrupted);
    Ok(())
}

/// Microphone whose frames the test pushes by hand
struct HandFedMicrophone {
    frames: std::sync::Mutex<Option<mpsc::Receiver<AudioFrame>>>,
}

#[async_trait::async_trait]
impl MicrophoneSource for HandFedMicrophone {
    async fn acquire(&self) -> Result<mpsc::Receiver<AudioFrame>, AudioError> {
        self.frames
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AudioError::Device("already acquired".to_string()))
    }

    fn name(&self) -> &str {
        "hand-fed"
    }
}

fn mic_frame(frames: usize) -> AudioFrame {
    AudioFrame {
        samples: vec![0.25; frames],
        sample_rate: 48000,
        channels: 1,
        timestamp_ms: 0,
        source: AudioStreamSource::Local,
    }
}

#[tokio::test]
async fn test_disconnect_finishes_recording() -> Result<()> {
    let (controller, handle, _handles) = connected().await?;
    let remote = controller.remote_audio().await.expect("remote audio available");

    let (mic_tx, mic_rx) = mpsc::channel(16);
    let microphone = HandFedMicrophone {
        frames: std::sync::Mutex::new(Some(mic_rx)),
    };
    let mut recorder = AudioRecorder::new(RecorderConfig::default(), Arc::new(microphone));
    recorder.start(remote).await;
    assert!(!recorder.is_local_silent());

    // 10ms of agent speech at 48kHz mono and 10ms of caller speech
    let pcm: Vec<u8> = std::iter::repeat([0x00u8, 0x20]).take(480).flatten().collect();
    handle
        .emit(TransportEvent::OutputAudioDelta {
            audio: base64::engine::general_purpose::STANDARD.encode(&pcm),
            sample_rate: 48000,
            channels: 1,
        })
        .await?;
    mic_tx.send(mic_frame(480)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    controller.disconnect().await;

    timeout(WAIT, async {
        while recorder.is_recording() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    // The capture is gone: later microphone audio has nowhere to land
    assert!(mic_tx.send(mic_frame(480)).await.is_err());

    let recording = recorder.export().await?.expect("call audio kept");
    assert_eq!(recording.sample_count, 480);
    // 0.25 agent + 0.25 caller
    assert_eq!(i16::from_le_bytes([recording.bytes[44], recording.bytes[45]]), 16383);

    recorder.stop().await;
    Ok(())
}
