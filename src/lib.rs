pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use client::{ConnectionState, NotificationClient, ObserverHandle};
pub use config::ClientConfig;
pub use error::{ErrorKind, NotifyError};
pub use protocol::Notification;
