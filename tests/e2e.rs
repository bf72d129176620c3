use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use doge_notify::{
    protocol::{frame::decode_all, Command, Decoded, DogePhotoPayload, Frame},
    transport::WebSocketConnector,
    ClientConfig, ConnectionState, ErrorKind, Notification, NotificationClient,
};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, time::timeout};
use warp::{ws::Message, Filter};

const WAIT: Duration = Duration::from_secs(5);

fn text(frame: &Frame) -> Message {
    Message::text(String::from_utf8(frame.encode()).unwrap())
}

/// Minimal Spring-style broker: answers CONNECT, then posts two alarms on the
/// subscription, one of them without a photo URI.
fn spawn_broker() -> (SocketAddr, mpsc::UnboundedReceiver<Frame>) {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    let route = warp::path!("doge" / "websocket")
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let seen_tx = seen_tx.clone();
            ws.on_upgrade(move |socket| async move {
                let (mut tx, mut rx) = socket.split();
                while let Some(Ok(msg)) = rx.next().await {
                    let Ok(data) = msg.to_str() else { continue };
                    let Ok(decoded) = decode_all(data.as_bytes()) else { continue };
                    for item in decoded {
                        let Decoded::Frame(frame) = item else { continue };
                        match frame.command {
                            Command::Connect => {
                                let connected = Frame::new(Command::Connected)
                                    .header("version", "1.2")
                                    .header("heart-beat", "0,0");
                                let _ = tx.send(text(&connected)).await;
                            }
                            Command::Subscribe => {
                                let id = frame.get("id").unwrap_or_default().to_string();
                                let photo = serde_json::to_string(&DogePhotoPayload {
                                    doge_photo_uri: "/users/1/doge/2".to_string(),
                                })
                                .unwrap();
                                for (message_id, body) in [("m-1", photo), ("m-2", "{}".to_string())] {
                                    let message = Frame::new(Command::Message)
                                        .header("destination", "/topic/alarms")
                                        .header("subscription", id.as_str())
                                        .header("message-id", message_id)
                                        .header("content-type", "application/json;charset=UTF-8")
                                        .with_body(body);
                                    let _ = tx.send(text(&message)).await;
                                }
                            }
                            _ => {}
                        }
                        let _ = seen_tx.send(frame);
                    }
                }
            })
        });

    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, seen_rx)
}

#[tokio::test]
async fn test_e2e_websocket_broker() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
    let (addr, mut seen) = spawn_broker();

    let config = ClientConfig {
        endpoint: format!("http://{}/doge", addr),
        ..ClientConfig::default()
    };
    config.validate().unwrap();

    let client = NotificationClient::builder()
        .connector(Arc::new(WebSocketConnector::new(config.sockjs, config.buffer_size)))
        .config(config)
        .build();

    let photos = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&photos);
    client.subscribe(move |n: &Notification| {
        sink.lock().unwrap().push(n.image_uri().to_string());
        Ok(())
    });
    let errors = Arc::new(Mutex::new(Vec::new()));
    let error_sink = Arc::clone(&errors);
    client.on_error(move |e| error_sink.lock().unwrap().push(e.kind()));

    client.start();

    let connect = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(connect.command, Command::Connect);
    assert_eq!(connect.get("host"), Some("127.0.0.1"));
    let subscribe = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(subscribe.command, Command::Subscribe);
    assert_eq!(subscribe.get("destination"), Some("/topic/alarms"));

    timeout(WAIT, async {
        while errors.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("broker messages were not processed");

    assert_eq!(*photos.lock().unwrap(), vec!["/users/1/doge/2"]);
    assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::DecodeError]);
    assert_eq!(client.state(), ConnectionState::Connected);

    client.disconnect();
    let unsubscribe = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(unsubscribe.command, Command::Unsubscribe);
    assert_eq!(unsubscribe.get("id"), subscribe.get("id"));
    let disconnect = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(disconnect.command, Command::Disconnect);
}

#[tokio::test]
async fn test_e2e_unreachable_broker() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ClientConfig {
        endpoint: format!("ws://{}/doge", addr),
        ..ClientConfig::default()
    };
    let client = NotificationClient::websocket(config);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client.on_error(move |e| sink.lock().unwrap().push(e.kind()));

    let mut state = client.watch_state();
    client.start();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Error))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::ConnectionFailure]);
}
