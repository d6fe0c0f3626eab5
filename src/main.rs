use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_voice::audio::{
    AudioRecorder, DeniedMicrophone, FileMicrophone, MicrophoneSource, RecorderConfig,
};
use loqa_voice::guardrail::{GuardrailPipeline, HttpClassifier};
use loqa_voice::session::{AgentConfig, SessionConfig, SessionController, SessionEvent};
use loqa_voice::transcript::TranscriptStore;
use loqa_voice::transport::{HttpCredentialProvider, NatsTransportFactory, TransportEvent};
use loqa_voice::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "loqa-voice")]
#[command(about = "Realtime voice session orchestrator")]
struct Cli {
    /// Config file (extension optional)
    #[arg(short, long, global = true, default_value = "config/loqa-voice")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, record the call, and export it on Ctrl+C
    Run {
        /// Name of the initial agent
        #[arg(short, long, default_value = "assistant")]
        agent: String,

        /// Stream this WAV file as the microphone instead of a live device
        #[arg(long)]
        mic_file: Option<PathBuf>,
    },

    /// Reconcile a captured JSONL event log and print the transcript
    Replay {
        /// One transport event per line
        events: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { agent, mic_file } => {
            let cfg = Config::load(&cli.config)?;
            run(cfg, agent, mic_file).await
        }
        Command::Replay { events } => replay(events),
    }
}

async fn run(cfg: Config, agent: String, mic_file: Option<PathBuf>) -> Result<()> {
    info!("Loqa Voice v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    let factory = Arc::new(NatsTransportFactory::new(
        cfg.transport.nats_url.clone(),
        cfg.transport.subject_prefix.clone(),
    ));
    let controller = SessionController::new(SessionConfig::from_transport(&cfg.transport), factory);

    let classifier = Arc::new(HttpClassifier::new(
        cfg.guardrails.classifier_url.clone(),
        cfg.guardrails.classifier_api_key.clone(),
    ));
    let guardrails = GuardrailPipeline::from_config(&cfg.guardrails, classifier);
    let credentials = HttpCredentialProvider::new(cfg.credentials.endpoint.clone());

    let mut events = controller.subscribe();
    controller
        .connect(&credentials, vec![AgentConfig::new(agent, "")], guardrails)
        .await?;

    let microphone: Arc<dyn MicrophoneSource> = match mic_file {
        Some(path) => Arc::new(FileMicrophone::new(path)),
        None => {
            warn!("No microphone source configured; recording agent audio only");
            Arc::new(DeniedMicrophone)
        }
    };
    let mut recorder = AudioRecorder::new(RecorderConfig::from(&cfg.recording), microphone);
    if let Some(remote) = controller.remote_audio().await {
        recorder.start(remote).await;
    }

    info!("Session live! Press Ctrl+C to stop");

    let mut dropped_transcript = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping...");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::AgentUtterance { text, .. }) => info!("Agent: {}", text),
                Ok(SessionEvent::GuardrailTripped { verdict, .. }) => {
                    warn!("Agent output withheld: {}", verdict.reason.unwrap_or_default())
                }
                Ok(SessionEvent::AgentHandoff { agent }) => info!("Handed off to {}", agent),
                Ok(SessionEvent::Disconnected { reason, transcript }) => {
                    warn!("Session dropped: {}", reason);
                    dropped_transcript = Some(transcript);
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} session events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    recorder.stop().await;
    match recorder.export().await? {
        Some(recording) => {
            recording.save_to(&cfg.recording.output_dir)?;
        }
        None => info!("Nothing recorded"),
    }

    let stats = controller.stats().await;
    let transcript = match dropped_transcript {
        Some(transcript) => transcript,
        None => controller.disconnect().await,
    };

    info!(
        "Session complete: {} transcript items, {} guardrail trips",
        transcript.len(),
        stats.guardrail_trips
    );
    Ok(())
}

fn replay(path: PathBuf) -> Result<()> {
    let log = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read event log: {}", path.display()))?;

    let mut store =
        TranscriptStore::new().with_handoff_handler(|agent| info!("Handoff to {}", agent));
    let mut applied = 0;
    for line in log.lines().filter(|l| !l.trim().is_empty()) {
        let event = TransportEvent::from_json(line.as_bytes());
        if let TransportEvent::AgentOutput { item_id, text } = &event {
            store.record_agent_output(item_id, text);
        } else {
            store.apply(&event);
        }
        applied += 1;
    }

    info!("Replayed {} events into {} transcript items", applied, store.len());
    println!("{}", serde_json::to_string_pretty(store.items())?);
    Ok(())
}
