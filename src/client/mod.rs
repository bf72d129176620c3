//! The notification client: one logical topic subscription, fanned out to
//! observers.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    config::ClientConfig,
    error::NotifyError,
    protocol::{Frame, Notification},
    transport::{Connector, WebSocketConnector},
};

pub mod dispatch;
pub mod reconnect;
pub mod registry;
mod session;
pub mod state;

pub use dispatch::{ErrorObserver, Observer, ObserverResult, Render};
pub use reconnect::ReconnectPolicy;
pub use registry::{ObserverHandle, ObserverRegistry};
pub use state::ConnectionState;

use dispatch::{RecentIds, RenderObserver};
use session::Session;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Lifecycle {
    generation: u64,
    token: Option<CancellationToken>,
}

pub(crate) struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    observers: Mutex<ObserverRegistry<dyn Observer>>,
    error_observers: Mutex<ObserverRegistry<dyn ErrorObserver>>,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<ConnectionState>,
    recent_ids: Mutex<RecentIds>,
    retry_pending: AtomicBool,
}

impl Inner {
    fn recent_ids(&self) -> MutexGuard<'_, RecentIds> {
        lock(&self.recent_ids)
    }

    fn is_current(&self, generation: u64) -> bool {
        let lifecycle = lock(&self.lifecycle);
        lifecycle.generation == generation
            && lifecycle
                .token
                .as_ref()
                .is_some_and(|token| !token.is_cancelled())
    }

    /// Apply `next` if the session `generation` still owns the client.
    fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        let lifecycle = lock(&self.lifecycle);
        if lifecycle.generation != generation {
            return false;
        }

        let current = *self.state_tx.borrow();
        if !current.can_transition_to(next) {
            tracing::warn!("Refusing state transition {} -> {}", current, next);
            return false;
        }
        self.state_tx.send_replace(next);
        tracing::debug!("Connection state {} -> {}", current, next);
        true
    }

    fn report(&self, error: NotifyError) {
        let observers = lock(&self.error_observers).snapshot();
        dispatch::notify_error(&error, &observers);
    }

    fn report_if_current(&self, generation: u64, error: NotifyError) {
        if self.is_current(generation) {
            self.report(error);
        } else {
            tracing::debug!("Dropping error from stale session: {}", error);
        }
    }

    /// Decode a MESSAGE frame and hand the notification to every observer.
    fn handle_message(&self, generation: u64, frame: &Frame) {
        if !self.is_current(generation) {
            tracing::debug!("Dropping MESSAGE that arrived after disconnect");
            return;
        }

        if let Some(id) = frame.get("message-id") {
            if !self.recent_ids().insert(id) {
                tracing::debug!("Dropping duplicate message {}", id);
                return;
            }
        }

        let notification = match self.config.decode.decode(&frame.body) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::warn!("Dropping undecodable frame: {}", e);
                self.report(e);
                return;
            }
        };

        tracing::debug!("New doge photo: {}", notification.image_uri());
        let observers = lock(&self.observers).snapshot();
        dispatch::deliver(
            &notification,
            &observers,
            |handle| self.is_current(generation) && lock(&self.observers).contains(handle),
            |error| self.report(error),
        );
    }
}

/// Collaborators for [`NotificationClient`], assembled with a typed builder.
#[derive(TypedBuilder)]
#[builder(build_method(into = NotificationClient))]
pub struct ClientParts {
    #[builder(default)]
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    #[builder(default, setter(strip_option))]
    renderer: Option<Arc<dyn Render>>,
    #[builder(default, setter(strip_option))]
    error_sink: Option<Arc<dyn ErrorObserver>>,
}

impl From<ClientParts> for NotificationClient {
    fn from(parts: ClientParts) -> Self {
        let client = NotificationClient::new(parts.config, parts.connector);
        if let Some(renderer) = parts.renderer {
            client.subscribe_observer(Arc::new(RenderObserver(renderer)));
        }
        if let Some(sink) = parts.error_sink {
            client.on_error_observer(sink);
        }
        client
    }
}

/// Subscribes to a STOMP topic and delivers each new photo URI to observers.
///
/// Errors never surface from these methods; register an error observer with
/// [`NotificationClient::on_error`] to see them. Dropping the client
/// disconnects it and releases every observer.
pub struct NotificationClient {
    inner: Arc<Inner>,
}

impl NotificationClient {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let recent_ids = RecentIds::new(config.dedup_window);

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                observers: Mutex::new(ObserverRegistry::new()),
                error_observers: Mutex::new(ObserverRegistry::new()),
                lifecycle: Mutex::new(Lifecycle {
                    generation: 0,
                    token: None,
                }),
                state_tx,
                recent_ids: Mutex::new(recent_ids),
                retry_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Client over WebSocket, configured from `config`.
    pub fn websocket(config: ClientConfig) -> Self {
        let connector = WebSocketConnector::new(config.sockjs, config.buffer_size);
        Self::new(config, Arc::new(connector))
    }

    pub fn builder() -> ClientPartsBuilder {
        ClientParts::builder()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether the client will reconnect on its own after the last failure.
    /// Only meaningful while the state is [`ConnectionState::Error`].
    pub fn retry_pending(&self) -> bool {
        self.inner.retry_pending.load(Ordering::SeqCst)
    }

    /// Connect to the configured endpoint and topic.
    pub fn start(&self) {
        let ClientConfig {
            endpoint, topic, ..
        } = &self.inner.config;
        self.connect(endpoint, topic);
    }

    /// Start a session against `endpoint` and subscribe to `topic` once
    /// connected. A no-op while already connecting or connected.
    ///
    /// Must be called from within a Tokio runtime; otherwise the attempt fails
    /// with a connection failure reported to error observers.
    pub fn connect(&self, endpoint: &str, topic: &str) {
        let runtime = tokio::runtime::Handle::try_current();

        let (generation, token) = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            let current = *self.inner.state_tx.borrow();
            if current.is_active() {
                tracing::debug!("connect ignored, client is {}", current);
                return;
            }

            lifecycle.generation += 1;
            if let Some(previous) = lifecycle.token.take() {
                previous.cancel();
            }
            self.inner.retry_pending.store(false, Ordering::SeqCst);
            let token = CancellationToken::new();
            lifecycle.token = Some(token.clone());
            self.inner.state_tx.send_replace(ConnectionState::Connecting);
            (lifecycle.generation, token)
        };

        let runtime = match runtime {
            Ok(runtime) => runtime,
            Err(e) => {
                self.inner.transition(generation, ConnectionState::Error);
                self.inner.report(NotifyError::ConnectionFailure(format!(
                    "no async runtime to connect to {}: {}",
                    endpoint, e
                )));
                return;
            }
        };

        tracing::info!("Connecting to {} for topic {}", endpoint, topic);
        let session = Session::new(
            Arc::clone(&self.inner),
            generation,
            token,
            endpoint.to_string(),
            topic.to_string(),
        );
        runtime.spawn(session.run());
    }

    /// Register a notification callback. It runs for every notification
    /// delivered after this call, including ones from later connections.
    pub fn subscribe<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&Notification) -> ObserverResult + Send + Sync + 'static,
    {
        self.subscribe_observer(Arc::new(callback))
    }

    pub fn subscribe_observer(&self, observer: Arc<dyn Observer>) -> ObserverHandle {
        lock(&self.inner.observers).insert(observer)
    }

    /// Remove a notification or error observer. Unknown handles are ignored.
    pub fn unsubscribe(&self, handle: ObserverHandle) {
        if !lock(&self.inner.observers).remove(handle) {
            lock(&self.inner.error_observers).remove(handle);
        }
    }

    pub fn on_error<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&NotifyError) + Send + Sync + 'static,
    {
        self.on_error_observer(Arc::new(callback))
    }

    pub fn on_error_observer(&self, observer: Arc<dyn ErrorObserver>) -> ObserverHandle {
        lock(&self.inner.error_observers).insert(observer)
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }

    /// Tear down the session, if any. Frames still in flight are dropped.
    /// Observers stay registered for the next `connect`.
    pub fn disconnect(&self) {
        let previous = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.generation += 1;
            if let Some(token) = lifecycle.token.take() {
                token.cancel();
            }
            self.inner
                .state_tx
                .send_replace(ConnectionState::Disconnected)
        };

        if previous != ConnectionState::Disconnected {
            tracing::info!("Disconnected (was {})", previous);
        }
    }
}

impl Drop for NotificationClient {
    fn drop(&mut self) {
        self.disconnect();
        lock(&self.inner.observers).clear();
        lock(&self.inner.error_observers).clear();
    }
}
