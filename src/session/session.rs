use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::context::SessionContext;
use crate::audio::AudioFrame;
use crate::transport::Transport;

/// Listener task bound to a session. Dropping it detaches the listener.
pub(crate) struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Let the task run to completion on its own. Used when the task is
    /// tearing down its own session.
    pub(crate) fn detach(&mut self) {
        self.handle.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// The one live session, owned by the controller's slot.
///
/// Created by `connect()`, destroyed by `disconnect()` or a fatal transport
/// error.
pub(crate) struct Session {
    pub(crate) generation: u64,
    pub(crate) context: SessionContext,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pump: Subscription,
    pub(crate) remote_audio: Option<mpsc::Receiver<AudioFrame>>,
    pub(crate) started_at: DateTime<Utc>,
}

impl Session {
    /// Detach listeners and close the transport
    pub(crate) async fn shutdown(self) {
        let Session {
            context,
            transport,
            pump,
            ..
        } = self;

        drop(pump);
        if let Err(e) = transport.close().await {
            warn!("Failed to close {} transport: {:#}", transport.name(), e);
        }
        info!("Session {} torn down", context.session_id);
    }
}
