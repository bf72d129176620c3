use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use tokio::{
    sync::mpsc,
    time::{interval_at, Instant, Interval},
};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::{ConnectionState, Inner};
use crate::{
    error::NotifyError,
    protocol::{frame::parse_heartbeat, Command, Frame},
    transport::{TransportChannels, TransportCommand, TransportEvent},
};

enum SessionEnd {
    Cancelled,
    Failed(NotifyError),
}

/// Drives one `connect` call: handshake, subscription, frame loop and, when
/// the policy allows it, retries.
pub(crate) struct Session {
    inner: Arc<Inner>,
    generation: u64,
    token: CancellationToken,
    endpoint: String,
    topic: String,
}

impl Session {
    pub(crate) fn new(
        inner: Arc<Inner>,
        generation: u64,
        token: CancellationToken,
        endpoint: String,
        topic: String,
    ) -> Self {
        Self {
            inner,
            generation,
            token,
            endpoint,
            topic,
        }
    }

    pub(crate) async fn run(self) {
        let policy = self.inner.config.reconnect.clone();
        let mut failures = 0u32;

        loop {
            let error = match self.run_once(&mut failures).await {
                SessionEnd::Cancelled => return,
                SessionEnd::Failed(error) => error,
            };

            let retry = policy.delay_for(failures);
            if self.inner.is_current(self.generation) {
                self.inner
                    .retry_pending
                    .store(retry.is_some(), Ordering::SeqCst);
            }
            if !self
                .inner
                .transition(self.generation, ConnectionState::Error)
            {
                return;
            }
            tracing::error!("Session to {} failed: {}", self.endpoint, error);
            self.inner.report_if_current(self.generation, error);

            let Some(delay) = retry else {
                return;
            };
            failures += 1;
            tracing::info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                self.endpoint,
                delay,
                failures,
                policy.max_attempts
            );

            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self
                .inner
                .transition(self.generation, ConnectionState::Connecting)
            {
                return;
            }
        }
    }

    async fn run_once(&self, failures: &mut u32) -> SessionEnd {
        let mut transport = match self.inner.connector.transport(&self.endpoint) {
            Ok(transport) => transport,
            Err(e) => return SessionEnd::Failed(e),
        };
        let TransportChannels {
            cmd_tx,
            mut event_rx,
        } = match transport.start().await {
            Ok(channels) => channels,
            Err(e) => return SessionEnd::Failed(e),
        };

        let handshake = self.handshake(&cmd_tx, &mut event_rx);
        let connected = match self.inner.config.connect_timeout() {
            Some(limit) => tokio::select! {
                _ = self.token.cancelled() => return shutdown(&cmd_tx, None).await,
                result = tokio::time::timeout(limit, handshake) => match result {
                    Ok(result) => result,
                    Err(_) => Err(NotifyError::ConnectionFailure(format!(
                        "no CONNECTED frame from {} within {:?}",
                        self.endpoint, limit
                    ))),
                },
            },
            None => tokio::select! {
                _ = self.token.cancelled() => return shutdown(&cmd_tx, None).await,
                result = handshake => result,
            },
        };

        let connected = match connected {
            Ok(frame) => frame,
            Err(e) => return fail(&cmd_tx, e),
        };
        self.inner.recent_ids().clear();

        let subscription_id = format!("sub-{}", Uuid::new_v4());
        if cmd_tx
            .send(TransportCommand::SendFrame(Frame::subscribe(
                &subscription_id,
                &self.topic,
            )))
            .await
            .is_err()
        {
            return SessionEnd::Failed(NotifyError::ProtocolError(format!(
                "transport closed before subscribing to {}",
                self.topic
            )));
        }

        if !self
            .inner
            .transition(self.generation, ConnectionState::Connected)
        {
            return shutdown(&cmd_tx, Some(&subscription_id)).await;
        }
        *failures = 0;
        tracing::info!(
            "Subscribed to {} on {} as {}",
            self.topic,
            self.endpoint,
            subscription_id
        );

        let mut heartbeat = outgoing_heartbeat(self.inner.config.heartbeat_outgoing_ms, &connected);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    return shutdown(&cmd_tx, Some(&subscription_id)).await;
                }
                event = event_rx.recv() => match event {
                    Some(TransportEvent::Frame(frame)) => match frame.command {
                        Command::Message => {
                            match frame.get("subscription") {
                                Some(id) if id != subscription_id => {
                                    tracing::debug!("Ignoring MESSAGE for subscription {}", id);
                                }
                                _ => self.inner.handle_message(self.generation, &frame),
                            }
                        }
                        Command::Error => {
                            return fail(&cmd_tx, NotifyError::ProtocolError(describe_error(&frame)));
                        }
                        Command::Receipt => {
                            tracing::debug!("Receipt {:?}", frame.get("receipt-id"));
                        }
                        other => {
                            tracing::debug!("Ignoring unexpected {} frame", other);
                        }
                    },
                    Some(TransportEvent::Heartbeat) => {
                        tracing::trace!("Heart-beat from {}", self.endpoint);
                    }
                    Some(TransportEvent::Error(e)) if e.is_fatal() => {
                        return fail(&cmd_tx, e);
                    }
                    Some(TransportEvent::Error(e)) => {
                        self.inner.report_if_current(self.generation, e);
                    }
                    Some(TransportEvent::Closed) | None => {
                        return SessionEnd::Failed(NotifyError::ConnectionFailure(format!(
                            "connection to {} closed",
                            self.endpoint
                        )));
                    }
                },
                _ = tick(&mut heartbeat) => {
                    if cmd_tx.send(TransportCommand::SendHeartbeat).await.is_err() {
                        return SessionEnd::Failed(NotifyError::ConnectionFailure(format!(
                            "connection to {} closed",
                            self.endpoint
                        )));
                    }
                }
            }
        }
    }

    /// Send CONNECT and wait for CONNECTED.
    async fn handshake(
        &self,
        cmd_tx: &mpsc::Sender<TransportCommand>,
        event_rx: &mut mpsc::Receiver<TransportEvent>,
    ) -> Result<Frame, NotifyError> {
        let host = Url::parse(&self.endpoint)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());

        tracing::debug!("Sending CONNECT to {}", self.endpoint);
        cmd_tx
            .send(TransportCommand::SendFrame(Frame::connect(
                &host,
                self.inner.config.heartbeat(),
            )))
            .await
            .map_err(|_| {
                NotifyError::ConnectionFailure(format!(
                    "transport to {} closed before CONNECT",
                    self.endpoint
                ))
            })?;

        loop {
            match event_rx.recv().await {
                Some(TransportEvent::Frame(frame)) => match frame.command {
                    Command::Connected => {
                        tracing::debug!(
                            "Connected to {} (STOMP {})",
                            self.endpoint,
                            frame.get("version").unwrap_or("1.0")
                        );
                        return Ok(frame);
                    }
                    Command::Error => {
                        return Err(NotifyError::ProtocolError(describe_error(&frame)));
                    }
                    other => tracing::debug!("Ignoring {} frame before CONNECTED", other),
                },
                Some(TransportEvent::Heartbeat) => continue,
                Some(TransportEvent::Error(e)) if e.is_fatal() => return Err(e),
                Some(TransportEvent::Error(e)) => {
                    self.inner.report_if_current(self.generation, e);
                }
                Some(TransportEvent::Closed) | None => {
                    return Err(NotifyError::ConnectionFailure(format!(
                        "connection to {} closed before CONNECTED",
                        self.endpoint
                    )));
                }
            }
        }
    }
}

async fn shutdown(
    cmd_tx: &mpsc::Sender<TransportCommand>,
    subscription_id: Option<&str>,
) -> SessionEnd {
    if let Some(id) = subscription_id {
        let _ = cmd_tx
            .send(TransportCommand::SendFrame(Frame::unsubscribe(id)))
            .await;
        let receipt = format!("disconnect-{}", Uuid::new_v4());
        let _ = cmd_tx
            .send(TransportCommand::SendFrame(Frame::disconnect(&receipt)))
            .await;
    }
    let _ = cmd_tx.send(TransportCommand::Close).await;
    tracing::debug!("Session cancelled");
    SessionEnd::Cancelled
}

fn fail(cmd_tx: &mpsc::Sender<TransportCommand>, error: NotifyError) -> SessionEnd {
    let _ = cmd_tx.try_send(TransportCommand::Close);
    SessionEnd::Failed(error)
}

fn describe_error(frame: &Frame) -> String {
    let message = frame.get("message").unwrap_or("ERROR frame");
    match frame.body_str() {
        Ok(body) if !body.trim().is_empty() => format!("{}: {}", message, body.trim()),
        _ => message.to_string(),
    }
}

/// Outgoing heart-beat interval: the larger of what we offer and what the
/// broker wants, or none when either side opted out.
fn outgoing_heartbeat(client_out_ms: u64, connected: &Frame) -> Option<Interval> {
    let (_, server_in_ms) = connected
        .get("heart-beat")
        .and_then(parse_heartbeat)
        .unwrap_or((0, 0));
    if client_out_ms == 0 || server_in_ms == 0 {
        return None;
    }
    let period = Duration::from_millis(client_out_ms.max(server_in_ms));
    Some(interval_at(Instant::now() + period, period))
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_error_frame() {
        let frame = Frame::new(Command::Error)
            .header("message", "Access denied")
            .with_body("no such destination\n");
        assert_eq!(describe_error(&frame), "Access denied: no such destination");
        assert_eq!(describe_error(&Frame::new(Command::Error)), "ERROR frame");
    }

    #[tokio::test]
    async fn test_heartbeat_negotiation() {
        let connected = Frame::new(Command::Connected).header("heart-beat", "0,5000");
        let interval = outgoing_heartbeat(10_000, &connected).unwrap();
        assert_eq!(interval.period(), Duration::from_millis(10_000));

        let connected = Frame::new(Command::Connected).header("heart-beat", "0,20000");
        let interval = outgoing_heartbeat(10_000, &connected).unwrap();
        assert_eq!(interval.period(), Duration::from_millis(20_000));

        assert!(outgoing_heartbeat(0, &connected).is_none());
        assert!(outgoing_heartbeat(10_000, &Frame::new(Command::Connected)).is_none());
    }
}
