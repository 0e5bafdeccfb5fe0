use procrelay_core::{EventSink, ProcessEvent};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Outcome of handing an event to an [`EventGate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The gate was already closed; the event was dropped
    Closed,
    /// The sink rejected the event; the gate is now closed
    SinkGone,
}

/// Serialises event delivery for one process id.
///
/// Once a terminal event has passed, or the gate was closed by a stop, every
/// later event is dropped. This is what makes the terminal event unique and
/// final even though the relays and the exit-wait run concurrently.
pub struct EventGate {
    id: String,
    sink: Arc<dyn EventSink>,
    closed: Mutex<bool>,
}

impl EventGate {
    pub fn new(id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id: id.into(),
            sink,
            closed: Mutex::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deliver a non-terminal event.
    pub fn deliver(&self, event: ProcessEvent) -> Delivery {
        self.send(event, false)
    }

    /// Deliver a terminal event and close the gate behind it.
    pub fn finish(&self, event: ProcessEvent) -> Delivery {
        self.send(event, true)
    }

    /// Close the gate without a terminal event. Returns false if it was
    /// already closed.
    pub fn close(&self) -> bool {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        !std::mem::replace(&mut *closed, true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, event: ProcessEvent, terminal: bool) -> Delivery {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Delivery::Closed;
        }

        match self.sink.deliver(&self.id, event) {
            Ok(()) => {
                *closed = terminal;
                Delivery::Delivered
            }
            Err(e) => {
                warn!("Dropping client of process {}: {}", self.id, e);
                *closed = true;
                Delivery::SinkGone
            }
        }
    }
}
