use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    decode_events, Connector, Transport, TransportChannels, TransportCommand, TransportEvent,
};
use crate::{
    error::NotifyError,
    protocol::{Command, Frame},
};

/// Transport backed by in-process channels. The other end is a [`MemoryPeer`]
/// that plays the broker.
pub struct MemoryTransport {
    channels: Option<TransportChannels>,
}

impl MemoryTransport {
    pub fn pair(endpoint: impl Into<String>, buffer_size: usize) -> (Self, MemoryPeer) {
        let (cmd_tx, cmd_rx) = mpsc::channel(buffer_size);
        let (event_tx, event_rx) = mpsc::channel(buffer_size);

        let transport = Self {
            channels: Some(TransportChannels { cmd_tx, event_rx }),
        };
        let peer = MemoryPeer {
            endpoint: endpoint.into(),
            cmd_rx,
            event_tx,
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&mut self) -> Result<TransportChannels, NotifyError> {
        self.channels.take().ok_or_else(|| {
            NotifyError::ConnectionFailure("memory transport already started".to_string())
        })
    }
}

/// Broker side of a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryPeer {
    endpoint: String,
    cmd_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl MemoryPeer {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn next_command(&mut self) -> Option<TransportCommand> {
        self.cmd_rx.recv().await
    }

    /// Next frame sent by the client, skipping heart-beats. `None` once the
    /// client closed the transport.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.cmd_rx.recv().await? {
                TransportCommand::SendFrame(frame) => return Some(frame),
                TransportCommand::SendHeartbeat => continue,
                TransportCommand::Close => return None,
            }
        }
    }

    pub async fn send_event(&self, event: TransportEvent) -> bool {
        self.event_tx.send(event).await.is_ok()
    }

    pub async fn send_frame(&self, frame: Frame) -> bool {
        self.send_event(TransportEvent::Frame(frame)).await
    }

    /// Deliver raw wire bytes through the frame decoder, as a network transport would.
    pub async fn send_raw(&self, data: &[u8]) -> bool {
        for event in decode_events(data) {
            if !self.send_event(event).await {
                return false;
            }
        }
        true
    }

    /// Answer the client's CONNECT and return its SUBSCRIBE frame.
    pub async fn accept(&mut self) -> Option<Frame> {
        let connect = self.next_frame().await?;
        if connect.command != Command::Connect && connect.command != Command::Stomp {
            return None;
        }
        self.send_frame(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", "0,0"),
        )
        .await;

        let subscribe = self.next_frame().await?;
        (subscribe.command == Command::Subscribe).then_some(subscribe)
    }

    /// Publish a JSON body on the subscription described by `subscribe`.
    pub async fn publish(&self, subscribe: &Frame, message_id: &str, body: &str) -> bool {
        let frame = Frame::new(Command::Message)
            .header("subscription", subscribe.get("id").unwrap_or_default())
            .header("destination", subscribe.get("destination").unwrap_or_default())
            .header("message-id", message_id)
            .header("content-type", "application/json;charset=UTF-8")
            .with_body(body);
        self.send_frame(frame).await
    }

    /// Report a transport failure and close, like a refused connection.
    pub async fn fail(&self, reason: &str) {
        self.send_event(TransportEvent::Error(NotifyError::ConnectionFailure(
            reason.to_string(),
        )))
        .await;
        self.send_event(TransportEvent::Closed).await;
    }

    pub async fn close(&self) {
        self.send_event(TransportEvent::Closed).await;
    }
}

/// Hands out a new [`MemoryTransport`] per connection attempt and the matching
/// peer through the receiver returned by [`MemoryConnector::new`].
pub struct MemoryConnector {
    buffer_size: usize,
    attempts: AtomicUsize,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new(buffer_size: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            buffer_size,
            attempts: AtomicUsize::new(0),
            peers,
        });
        (connector, peer_rx)
    }

    /// Number of transports created so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    fn transport(&self, endpoint: &str) -> Result<Box<dyn Transport>, NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (transport, peer) = MemoryTransport::pair(endpoint, self.buffer_size);
        self.peers.send(peer).map_err(|_| {
            NotifyError::ConnectionFailure(format!("nothing is listening on {}", endpoint))
        })?;
        Ok(Box::new(transport))
    }
}
