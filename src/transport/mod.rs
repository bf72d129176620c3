use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::NotifyError,
    protocol::{frame, Decoded, Frame},
};

// Message types for the transport actor
#[derive(Debug)]
pub enum TransportCommand {
    SendFrame(Frame),
    SendHeartbeat,
    Close,
}

#[derive(Debug)]
pub enum TransportEvent {
    Frame(Frame),
    Heartbeat,
    Error(NotifyError),
    Closed,
}

// Transport trait
#[async_trait]
pub trait Transport: Send + 'static {
    /// Start the transport and return channels for communication
    async fn start(&mut self) -> Result<TransportChannels, NotifyError>;
}

/// Creates a fresh transport for every connection attempt.
pub trait Connector: Send + Sync + 'static {
    fn transport(&self, endpoint: &str) -> Result<Box<dyn Transport>, NotifyError>;
}

// Channels for communicating with the transport
#[derive(Debug)]
pub struct TransportChannels {
    /// Send commands to the transport
    pub cmd_tx: mpsc::Sender<TransportCommand>,
    /// Receive events from the transport
    pub event_rx: mpsc::Receiver<TransportEvent>,
}

/// Turn one raw transport message into events. Frames ahead of a malformed
/// one are kept; the malformed remainder becomes a single decode error event.
pub(crate) fn decode_events(data: &[u8]) -> Vec<TransportEvent> {
    let (decoded, error) = frame::decode_partial(data);
    let mut events: Vec<TransportEvent> = decoded
        .into_iter()
        .map(|d| match d {
            Decoded::Frame(frame) => TransportEvent::Frame(frame),
            Decoded::Heartbeat => TransportEvent::Heartbeat,
        })
        .collect();
    if let Some(e) = error {
        events.push(TransportEvent::Error(e.into()));
    }
    events
}

// In-memory Transport Implementation
pub mod memory;

// WebSocket Transport Implementation
pub mod ws;

pub use memory::{MemoryConnector, MemoryPeer, MemoryTransport};
pub use ws::{WebSocketConnector, WebSocketTransport};

#[cfg(test)]
mod tests {
    use crate::{
        error::NotifyError,
        protocol::{Command, Frame},
        transport::{
            memory::MemoryTransport, Transport, TransportChannels, TransportCommand,
            TransportEvent,
        },
    };

    #[tokio::test]
    async fn test_transport() -> Result<(), NotifyError> {
        // Create and start transport
        let (mut transport, mut peer) = MemoryTransport::pair("memory://doge", 8);
        let TransportChannels {
            cmd_tx,
            mut event_rx,
        } = transport.start().await?;

        // Send a frame
        cmd_tx
            .send(TransportCommand::SendFrame(Frame::new(Command::Disconnect)))
            .await
            .unwrap();

        match peer.next_command().await {
            Some(TransportCommand::SendFrame(frame)) => {
                assert_eq!(frame.command, Command::Disconnect)
            }
            other => panic!("Expected a frame, got {:?}", other),
        }

        // Deliver an event
        peer.send_frame(Frame::new(Command::Receipt).header("receipt-id", "1"))
            .await;
        match event_rx.recv().await {
            Some(TransportEvent::Frame(frame)) => assert_eq!(frame.get("receipt-id"), Some("1")),
            other => panic!("Expected a frame, got {:?}", other),
        }

        Ok(())
    }
}
