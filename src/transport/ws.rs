use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        error::Error as TungsteniteError, protocol::CloseFrame, Message as TungsteniteMessage,
    },
};
use url::Url;

use super::{
    decode_events, Connector, Transport, TransportChannels, TransportCommand, TransportEvent,
};
use crate::error::NotifyError;

/// Path segment SockJS servers expose for plain WebSocket clients.
const SOCKJS_WEBSOCKET_SUFFIX: &str = "websocket";

/// Map an endpoint such as `http://host/doge` to the WebSocket URL to dial.
pub fn websocket_url(endpoint: &str, sockjs: bool) -> Result<Url, NotifyError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| NotifyError::ConnectionFailure(format!("invalid endpoint {}: {}", endpoint, e)))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(NotifyError::ConnectionFailure(format!(
                "unsupported endpoint scheme {:?}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| NotifyError::ConnectionFailure(format!("cannot use scheme {}", scheme)))?;

    if sockjs {
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}/{}", path, SOCKJS_WEBSOCKET_SUFFIX));
    }

    Ok(url)
}

pub struct WebSocketTransport {
    url: String,
    buffer_size: usize,
}

impl WebSocketTransport {
    pub fn new_client_with_url(url: String, buffer_size: usize) -> Self {
        Self { url, buffer_size }
    }

    async fn run_client(
        url: String,
        mut cmd_rx: mpsc::Receiver<TransportCommand>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) {
        tracing::debug!("Connecting to WebSocket endpoint: {}", url);

        // Connect to the WebSocket server
        let ws_stream = match connect_async(url.as_str()).await {
            Ok((stream, response)) => {
                tracing::debug!("Connected to WebSocket server: {:?}", response.status());
                stream
            }
            Err(e) => {
                tracing::error!("Failed to connect to WebSocket server: {:?}", e);
                let _ = event_tx
                    .send(TransportEvent::Error(NotifyError::ConnectionFailure(
                        format!("failed to connect to {}: {}", url, e),
                    )))
                    .await;
                return;
            }
        };

        let (ws_write, ws_read) = ws_stream.split();
        let ws_write = Arc::new(tokio::sync::Mutex::new(ws_write));
        let ws_write_clone = Arc::clone(&ws_write);

        // Create separate sender instances for each task
        let event_tx_receive = event_tx.clone();
        let event_tx_send = event_tx.clone();

        // Receive task - handles frames from the broker
        let receive_task = tokio::spawn(async move {
            let mut stream = ws_read;

            while let Some(msg_result) = stream.next().await {
                let events = match msg_result {
                    Ok(TungsteniteMessage::Text(text)) => decode_events(text.as_str().as_bytes()),
                    Ok(TungsteniteMessage::Binary(data)) => decode_events(&data),
                    // Pong is automatically handled by the library
                    Ok(TungsteniteMessage::Ping(_)) | Ok(TungsteniteMessage::Pong(_)) => continue,
                    Ok(TungsteniteMessage::Frame(_)) => continue,
                    Ok(TungsteniteMessage::Close(frame)) => {
                        tracing::debug!("Received close frame from server: {:?}", frame);
                        let _ = event_tx_receive.send(TransportEvent::Closed).await;
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {:?}", e);

                        let is_connection_closed = matches!(
                            e,
                            TungsteniteError::ConnectionClosed | TungsteniteError::AlreadyClosed
                        );

                        let event = if is_connection_closed {
                            TransportEvent::Closed
                        } else {
                            TransportEvent::Error(NotifyError::ConnectionFailure(e.to_string()))
                        };
                        let _ = event_tx_receive.send(event).await;
                        break;
                    }
                };

                for event in events {
                    if let Err(e) = event_tx_receive.send(event).await {
                        tracing::error!("Failed to forward event: {:?}", e);
                        return;
                    }
                }
            }
        });

        // Ping task - keeps the connection alive
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));

            loop {
                interval.tick().await;
                let mut writer = ws_write_clone.lock().await;

                if let Err(e) = writer.send(TungsteniteMessage::Ping(vec![].into())).await {
                    tracing::debug!("Failed to send ping: {:?}", e);
                    break;
                }
            }
        });

        // Send task - handles frames to be sent to the broker
        loop {
            let message = match cmd_rx.recv().await {
                Some(TransportCommand::SendFrame(frame)) => {
                    tracing::debug!("Sending {} frame", frame.command);
                    match String::from_utf8(frame.encode()) {
                        Ok(text) => TungsteniteMessage::Text(text.into()),
                        Err(e) => TungsteniteMessage::Binary(e.into_bytes().into()),
                    }
                }
                Some(TransportCommand::SendHeartbeat) => {
                    TungsteniteMessage::Text("\n".to_string().into())
                }
                Some(TransportCommand::Close) => {
                    tracing::debug!("Closing WebSocket client connection");

                    let mut writer = ws_write.lock().await;
                    let _ = writer
                        .send(TungsteniteMessage::Close(Some(CloseFrame {
                            code: 1000.into(),
                            reason: "Client initiated close".into(),
                        })))
                        .await;

                    break;
                }
                None => {
                    tracing::debug!("Command channel closed");
                    break;
                }
            };

            let mut writer = ws_write.lock().await;
            if let Err(e) = writer.send(message).await {
                tracing::error!("Failed to send message: {:?}", e);
                let _ = event_tx_send
                    .send(TransportEvent::Error(NotifyError::ConnectionFailure(
                        e.to_string(),
                    )))
                    .await;
                break;
            }
        }

        // Clean up tasks
        ping_task.abort();
        receive_task.abort();

        let _ = event_tx_send.send(TransportEvent::Closed).await;
        tracing::debug!("WebSocket client connection closed");
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(&mut self) -> Result<TransportChannels, NotifyError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(self.buffer_size);
        let (event_tx, event_rx) = mpsc::channel(self.buffer_size);

        tokio::spawn(Self::run_client(self.url.clone(), cmd_rx, event_tx));

        Ok(TransportChannels { cmd_tx, event_rx })
    }
}

/// Dials every connection attempt over a fresh WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    sockjs: bool,
    buffer_size: usize,
}

impl WebSocketConnector {
    pub fn new(sockjs: bool, buffer_size: usize) -> Self {
        Self {
            sockjs,
            buffer_size,
        }
    }
}

impl Connector for WebSocketConnector {
    fn transport(&self, endpoint: &str) -> Result<Box<dyn Transport>, NotifyError> {
        let url = websocket_url(endpoint, self.sockjs)?;
        Ok(Box::new(WebSocketTransport::new_client_with_url(
            url.to_string(),
            self.buffer_size,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Frame};
    use std::{net::SocketAddr, time::Duration};
    use tokio::time::timeout;
    use warp::{ws::Message as WarpMessage, Filter};

    #[test]
    fn test_websocket_url_mapping() {
        assert_eq!(
            websocket_url("http://localhost:8080/doge", true)
                .unwrap()
                .as_str(),
            "ws://localhost:8080/doge/websocket"
        );
        assert_eq!(
            websocket_url("wss://doge.example.com/doge/", true)
                .unwrap()
                .as_str(),
            "wss://doge.example.com/doge/websocket"
        );
        assert_eq!(
            websocket_url("https://doge.example.com/doge", false)
                .unwrap()
                .as_str(),
            "wss://doge.example.com/doge"
        );
        assert!(websocket_url("ftp://x/doge", false).is_err());
        assert!(websocket_url("/doge", false).is_err());
    }

    #[tokio::test]
    async fn test_websocket_transport_client() -> Result<(), NotifyError> {
        let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();

        // Channel to observe what the stub server receives
        let (server_tx, mut server_rx) = mpsc::channel::<String>(32);

        // Echo every text message back to the client
        let ws_route = warp::path("ws")
            .and(warp::ws())
            .map(move |ws: warp::ws::Ws| {
                let server_tx = server_tx.clone();
                ws.on_upgrade(move |websocket| async move {
                    let (mut tx, mut rx) = websocket.split();
                    while let Some(Ok(msg)) = rx.next().await {
                        if let Ok(text) = msg.to_str() {
                            let _ = tx.send(WarpMessage::text(text)).await;
                            let _ = server_tx.send(text.to_string()).await;
                        }
                    }
                })
            });

        let (addr, server): (SocketAddr, _) =
            warp::serve(ws_route).bind_ephemeral(([127, 0, 0, 1], 0));
        let server_handle = tokio::spawn(server);

        let mut transport =
            WebSocketTransport::new_client_with_url(format!("ws://{}/ws", addr), 32);
        let TransportChannels {
            cmd_tx,
            mut event_rx,
        } = transport.start().await?;

        let frame = Frame::subscribe("sub-0", "/topic/alarms");
        cmd_tx
            .send(TransportCommand::SendFrame(frame.clone()))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(5), server_rx.recv())
            .await
            .expect("server did not receive a frame")
            .unwrap();
        assert_eq!(received.as_bytes(), frame.encode().as_slice());

        match timeout(Duration::from_secs(5), event_rx.recv()).await {
            Ok(Some(TransportEvent::Frame(echo))) => {
                assert_eq!(echo.command, Command::Subscribe);
                assert_eq!(echo.get("destination"), Some("/topic/alarms"));
            }
            other => panic!("Expected echoed frame, got {:?}", other),
        }

        cmd_tx.send(TransportCommand::SendHeartbeat).await.unwrap();
        match timeout(Duration::from_secs(5), event_rx.recv()).await {
            Ok(Some(TransportEvent::Heartbeat)) => {}
            other => panic!("Expected heartbeat echo, got {:?}", other),
        }

        cmd_tx.send(TransportCommand::Close).await.unwrap();
        server_handle.abort();

        Ok(())
    }

    #[tokio::test]
    async fn test_connection_refused_reports_failure() {
        // Bind then drop a listener to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport =
            WebSocketTransport::new_client_with_url(format!("ws://{}/doge", addr), 4);
        let mut channels = transport.start().await.unwrap();

        match timeout(Duration::from_secs(5), channels.event_rx.recv()).await {
            Ok(Some(TransportEvent::Error(NotifyError::ConnectionFailure(msg)))) => {
                assert!(msg.contains("failed to connect"))
            }
            other => panic!("Expected connection failure, got {:?}", other),
        }
    }
}
