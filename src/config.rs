use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{client::ReconnectPolicy, error::NotifyError, protocol::DecodeStrategy};

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/doge";
pub const DEFAULT_TOPIC: &str = "/topic/alarms";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: String,
    pub topic: String,
    /// Endpoint is a SockJS endpoint; the raw WebSocket lives at `<endpoint>/websocket`.
    pub sockjs: bool,
    pub decode: DecodeStrategy,
    pub heartbeat_outgoing_ms: u64,
    pub heartbeat_incoming_ms: u64,
    pub connect_timeout_ms: Option<u64>,
    pub buffer_size: usize,
    /// Recent `message-id`s remembered to drop redeliveries, reset on every
    /// new broker session. 0 disables de-duplication.
    pub dedup_window: usize,
    pub reconnect: ReconnectPolicy,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            sockjs: true,
            decode: DecodeStrategy::default(),
            heartbeat_outgoing_ms: 10_000,
            heartbeat_incoming_ms: 10_000,
            connect_timeout_ms: None,
            buffer_size: 64,
            dedup_window: 64,
            reconnect: ReconnectPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults, then the optional file, then `DOGE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, NotifyError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("DOGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ClientConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.topic.trim().is_empty() {
            return Err(NotifyError::Config("topic must not be empty".to_string()));
        }

        let endpoint = Url::parse(&self.endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(NotifyError::Config(format!(
                "unsupported endpoint scheme {:?}",
                endpoint.scheme()
            )));
        }

        if self.buffer_size == 0 {
            return Err(NotifyError::Config(
                "buffer_size must be greater than 0".to_string(),
            ));
        }

        if let DecodeStrategy::Json { field } = &self.decode {
            if field.is_empty() {
                return Err(NotifyError::Config(
                    "decode.field must not be empty".to_string(),
                ));
            }
        }

        if self.reconnect.max_attempts > 0 && self.reconnect.initial_backoff_ms == 0 {
            return Err(NotifyError::Config(
                "reconnect.initial_backoff_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn heartbeat(&self) -> (u64, u64) {
        (self.heartbeat_outgoing_ms, self.heartbeat_incoming_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// HTTP origin of the endpoint, used to resolve relative image URIs.
    pub fn http_base(&self) -> Result<Url, NotifyError> {
        let mut url = Url::parse(&self.endpoint)?;
        let scheme = match url.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => {
                return Err(NotifyError::Config(format!(
                    "unsupported endpoint scheme {:?}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| NotifyError::Config(format!("cannot use scheme {}", scheme)))?;
        url.set_path("/");
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_doge_server() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint, "ws://localhost:8080/doge");
        assert_eq!(config.topic, "/topic/alarms");
        assert!(config.sockjs);
        assert_eq!(config.reconnect.max_attempts, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = ClientConfig::default();
        config.topic = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.endpoint = "ftp://localhost/doge".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.endpoint = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.decode = DecodeStrategy::Json {
            field: String::new(),
        };
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.reconnect.max_attempts = 3;
        config.reconnect.initial_backoff_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
endpoint = "wss://doge.example.com/doge"
topic = "/topic/photos"
sockjs = false
connect_timeout_ms = 2500

[decode]
strategy = "plain_text"

[reconnect]
max_attempts = 3
"#
        )
        .unwrap();

        let config = ClientConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.endpoint, "wss://doge.example.com/doge");
        assert_eq!(config.topic, "/topic/photos");
        assert!(!config.sockjs);
        assert_eq!(config.decode, DecodeStrategy::PlainText);
        assert_eq!(config.connect_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(
            config.reconnect.initial_backoff_ms,
            ReconnectPolicy::default().initial_backoff_ms
        );
        assert_eq!(config.buffer_size, 64);
    }

    #[test]
    fn test_http_base() {
        let mut config = ClientConfig::default();
        assert_eq!(config.http_base().unwrap().as_str(), "http://localhost:8080/");

        config.endpoint = "wss://doge.example.com/app/doge?x=1".to_string();
        assert_eq!(
            config.http_base().unwrap().as_str(),
            "https://doge.example.com/"
        );
    }
}
