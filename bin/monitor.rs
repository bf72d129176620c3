use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use doge_notify::{
    client::ReconnectPolicy, logging, ClientConfig, ConnectionState, NotificationClient,
    NotifyError,
};

/// Prints every doge photo posted to the server
#[derive(Parser, Debug)]
#[command(name = "monitor")]
#[command(about = "Watch a doge server for newly uploaded photos", long_about = None)]
struct Args {
    /// Config file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Endpoint of the STOMP broker, e.g. http://localhost:8080/doge
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Topic to subscribe to
    #[arg(short, long)]
    topic: Option<String>,

    /// Dial the endpoint directly instead of its SockJS WebSocket path
    #[arg(long)]
    no_sockjs: bool,

    /// Reconnect up to this many times after a failure
    #[arg(long)]
    reconnect: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(topic) = args.topic {
        config.topic = topic;
    }
    if args.no_sockjs {
        config.sockjs = false;
    }
    if let Some(attempts) = args.reconnect {
        config.reconnect = ReconnectPolicy {
            max_attempts: attempts,
            ..config.reconnect
        };
    }
    config.validate()?;

    logging::init(&config.log_level);

    let base = config.http_base()?;
    let client = NotificationClient::builder()
        .connector(Arc::new(doge_notify::transport::WebSocketConnector::new(
            config.sockjs,
            config.buffer_size,
        )))
        .config(config)
        .renderer(Arc::new(move |uri: &str| {
            let location = base
                .join(uri)
                .map(|url| url.to_string())
                .unwrap_or_else(|_| uri.to_string());
            println!("A new doge-ified image has been posted! {}", location);
        }))
        .error_sink(Arc::new(|error: &NotifyError| {
            tracing::error!("{}", error);
        }))
        .build();

    let mut state = client.watch_state();
    client.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                tracing::info!("Connection state: {}", current);
                if current == ConnectionState::Error && !client.retry_pending() {
                    break;
                }
            }
        }
    }

    client.disconnect();
    Ok(())
}
