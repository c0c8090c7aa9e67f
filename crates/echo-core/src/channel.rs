use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{BackendCommand, BackendEvent};

/// Commands a frontend may queue before the runtime applies backpressure.
pub const DEFAULT_COMMAND_BUFFER: usize = 128;
/// Events retained for slow subscribers before they observe `Lagged`.
pub const DEFAULT_EVENT_BUFFER: usize = 512;

/// Receiving half of the runtime event fan-out.
pub type EventStream = broadcast::Receiver<BackendEvent>;

#[derive(Debug, Error)]
pub enum BackendChannelError {
    #[error("runtime is no longer accepting commands")]
    CommandChannelClosed,
}

/// Frontend-facing half of the runtime protocol.
///
/// Commands are delivered in order to a single runtime task; events fan out
/// to every subscriber present at emit time.
#[derive(Clone, Debug)]
pub struct BackendChannels {
    commands: mpsc::Sender<BackendCommand>,
    events: broadcast::Sender<BackendEvent>,
}

impl BackendChannels {
    /// Channel set with explicit buffer sizes (each at least 1), plus the
    /// receiver the runtime drains.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<BackendCommand>) {
        let (commands, command_rx) = mpsc::channel(command_buffer.max(1));
        let (events, _) = broadcast::channel(event_buffer.max(1));
        (Self { commands, events }, command_rx)
    }

    pub fn with_default_buffers() -> (Self, mpsc::Receiver<BackendCommand>) {
        Self::new(DEFAULT_COMMAND_BUFFER, DEFAULT_EVENT_BUFFER)
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub async fn send_command(&self, command: BackendCommand) -> Result<(), BackendChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BackendChannelError::CommandChannelClosed)
    }

    /// Best-effort emit; having no subscriber is not an error.
    pub fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    /// Emit `events` in order.
    pub fn emit_all(&self, events: impl IntoIterator<Item = BackendEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}
