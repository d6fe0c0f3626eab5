//! Voice session management
//!
//! `SessionController` owns the connection state machine and the one live
//! `Session`:
//! - Credential fetch and transport handshake
//! - Event pump feeding the `TranscriptStore`
//! - Guardrail review of agent output before release
//! - Remote audio hand-off to the recorder

mod config;
mod context;
mod controller;
mod events;
mod session;
mod stats;

pub use config::{AgentConfig, SessionConfig};
pub use context::SessionContext;
pub use controller::SessionController;
pub use events::{SessionEvent, SessionStatus};
pub use stats::SessionStats;
