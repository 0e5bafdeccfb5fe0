use std::fmt;
use tokio::sync::mpsc;

/// Notification produced by a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of standard output, without its terminator
    Stdout(String),
    /// One line of standard error, without its terminator
    Stderr(String),
    /// The process exited with the given code (terminal)
    Exit(i32),
    /// The process could not be started or waited on (terminal)
    Error(String),
}

impl ProcessEvent {
    pub fn action(&self) -> &'static str {
        match self {
            ProcessEvent::Stdout(_) => "stdout",
            ProcessEvent::Stderr(_) => "stderr",
            ProcessEvent::Exit(_) => "exit",
            ProcessEvent::Error(_) => "error",
        }
    }

    pub fn data(&self) -> String {
        match self {
            ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => line.clone(),
            ProcessEvent::Exit(code) => code.to_string(),
            ProcessEvent::Error(message) => message.clone(),
        }
    }

    /// Terminal events end the event sequence of a process id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessEvent::Exit(_) | ProcessEvent::Error(_))
    }
}

impl fmt::Display for ProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action(), self.data())
    }
}

/// The consumer behind a sink is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Registered consumer of process events.
///
/// Implementations must be cheap and non-blocking: deliveries happen on the
/// relay workers while the per-process delivery lock is held.
pub trait EventSink: Send + Sync {
    fn deliver(&self, id: &str, event: ProcessEvent) -> Result<(), SinkClosed>;
}

impl<F> EventSink for F
where
    F: Fn(&str, ProcessEvent) -> Result<(), SinkClosed> + Send + Sync,
{
    fn deliver(&self, id: &str, event: ProcessEvent) -> Result<(), SinkClosed> {
        self(id, event)
    }
}

pub type IdentifiedEvent = (String, ProcessEvent);

/// Sink forwarding every event into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<IdentifiedEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IdentifiedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<IdentifiedEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, id: &str, event: ProcessEvent) -> Result<(), SinkClosed> {
        self.tx.send((id.to_string(), event)).map_err(|_| SinkClosed)
    }
}
