//! Fan-out of decoded notifications and errors to registered callbacks.
//!
//! Nothing here knows about transports: a frame body goes in, observers are
//! called in registration order, failures come back out as [`NotifyError`]s.

use std::{
    any::Any,
    collections::{HashSet, VecDeque},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use super::registry::ObserverHandle;
use crate::{error::NotifyError, protocol::Notification};

pub type ObserverResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub trait Observer: Send + Sync {
    fn on_notification(&self, notification: &Notification) -> ObserverResult;
}

impl<F> Observer for F
where
    F: Fn(&Notification) -> ObserverResult + Send + Sync,
{
    fn on_notification(&self, notification: &Notification) -> ObserverResult {
        self(notification)
    }
}

pub trait ErrorObserver: Send + Sync {
    fn on_error(&self, error: &NotifyError);
}

impl<F> ErrorObserver for F
where
    F: Fn(&NotifyError) + Send + Sync,
{
    fn on_error(&self, error: &NotifyError) {
        self(error)
    }
}

/// The view layer. Receives the image URI of each new photo.
pub trait Render: Send + Sync {
    fn render(&self, image_uri: &str);
}

impl<F> Render for F
where
    F: Fn(&str) + Send + Sync,
{
    fn render(&self, image_uri: &str) {
        self(image_uri)
    }
}

pub(crate) struct RenderObserver(pub(crate) Arc<dyn Render>);

impl Observer for RenderObserver {
    fn on_notification(&self, notification: &Notification) -> ObserverResult {
        self.0.render(notification.image_uri());
        Ok(())
    }
}

/// Invoke every live observer once, in order. An observer that returns an
/// error or panics is reported through `report` and the rest still run.
///
/// Returns how many observers completed successfully.
pub fn deliver<L, R>(
    notification: &Notification,
    observers: &[(ObserverHandle, Arc<dyn Observer>)],
    mut is_live: L,
    mut report: R,
) -> usize
where
    L: FnMut(ObserverHandle) -> bool,
    R: FnMut(NotifyError),
{
    let mut delivered = 0;

    for (handle, observer) in observers {
        if !is_live(*handle) {
            continue;
        }

        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| observer.on_notification(notification)));
        let reason = match outcome {
            Ok(Ok(())) => {
                delivered += 1;
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        tracing::warn!("Observer {} failed: {}", handle, reason);
        report(NotifyError::ObserverFailure {
            handle: *handle,
            reason,
        });
    }

    delivered
}

/// Hand `error` to every error observer. With none registered the error is
/// only logged.
pub fn notify_error(error: &NotifyError, observers: &[(ObserverHandle, Arc<dyn ErrorObserver>)]) {
    if observers.is_empty() {
        tracing::warn!("Unhandled notification client error: {}", error);
        return;
    }

    for (handle, observer) in observers {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer.on_error(error))) {
            tracing::error!(
                "Error observer {} panicked: {}",
                handle,
                panic_message(payload.as_ref())
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Last `capacity` STOMP message ids seen.
#[derive(Debug, Default)]
pub(crate) struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record `id`; `false` when it was already among the recent ids.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    /// Forget every id. Message ids are only unique within one broker session.
    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
