use super::protocol::Reply;
use procrelay_core::{EventSink, ProcessEvent, SinkClosed};
use tokio::sync::mpsc;

/// Reply channel of one client, captured when its request arrives
#[derive(Debug, Clone)]
pub struct ClientAddress {
    tx: mpsc::UnboundedSender<Reply>,
}

impl ClientAddress {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, reply: Reply) -> Result<(), SinkClosed> {
        self.tx.send(reply).map_err(|_| SinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Routes the events of a started process to the client that started it
#[derive(Debug, Clone)]
pub struct ClientSink {
    address: ClientAddress,
}

impl ClientSink {
    pub fn new(address: ClientAddress) -> Self {
        Self { address }
    }
}

impl EventSink for ClientSink {
    fn deliver(&self, id: &str, event: ProcessEvent) -> Result<(), SinkClosed> {
        for reply in Reply::from_event(id, &event) {
            self.address.send(reply)?;
        }
        Ok(())
    }
}
