//! The subscription registry: [`Subscriptions`].
//!
//! Owns every local [`Subscription`], turns create/remove into subscribe and
//! unsubscribe commands, and fans server events out to the matching handles.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

use crate::Error;
use crate::channel::Channel;
use crate::protocol::Command;
use crate::subscription::{Subscription, SubscriptionStatus};

/// Where subscription commands are written. Implemented by
/// [`Connection`](crate::Connection).
pub trait CommandSink: Send + Sync {
    fn is_open(&self) -> bool;

    /// Queue a text frame. Returns `false` if the frame was not accepted.
    ///
    /// Called while the registry is locked: must not block on I/O or call
    /// back into [`Subscriptions`].
    fn send(&self, text: &str) -> bool;

    fn send_command(&self, command: &Command) -> bool {
        match command.to_json() {
            Ok(text) => self.send(&text),
            Err(e) => {
                tracing::warn!(identifier = command.identifier(), "Failed to encode command: {e}");
                false
            }
        }
    }
}

/// Registry of subscriptions in creation order.
pub struct Subscriptions {
    sink: Weak<dyn CommandSink>,
    registry: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Subscriptions {
    pub fn new<S: CommandSink + 'static>(sink: &Arc<S>) -> Self {
        let weak: Weak<S> = Arc::downgrade(sink);
        Self {
            sink: weak,
            registry: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscription to `channel`.
    ///
    /// The subscribe command goes out immediately if the connection is open,
    /// otherwise on the next [`reload`](Self::reload).
    pub fn create(&self, channel: &Channel) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription::new(id, channel.identifier(), self.sink.clone());

        // Commands are queued under the registry lock so the wire order
        // matches the registry order.
        let mut registry = self.registry();
        registry.push(subscription.clone());
        tracing::debug!(identifier = subscription.identifier(), "Subscription created");
        if self.sink.upgrade().is_some_and(|sink| sink.is_open()) {
            self.send(&Command::subscribe(subscription.identifier()));
        }
        drop(registry);
        subscription
    }

    /// Drop `subscription`. Unsubscribes on the server only if no other handle
    /// shares its identifier.
    pub fn remove(&self, subscription: &Subscription) {
        let mut registry = self.registry();
        let Some(pos) = registry.iter().position(|s| s == subscription) else {
            return;
        };
        registry.remove(pos);
        let last_for_identifier = !registry
            .iter()
            .any(|s| s.identifier() == subscription.identifier());

        tracing::debug!(
            identifier = subscription.identifier(),
            last_for_identifier,
            "Subscription removed"
        );
        if last_for_identifier {
            self.send(&Command::unsubscribe(subscription.identifier()));
        }
    }

    pub fn remove_all(&self) {
        for subscription in self.snapshot() {
            self.remove(&subscription);
        }
    }

    /// Re-send subscribe for every live handle. Called when a fresh session opens.
    pub fn reload(&self) {
        let registry = self.registry();
        for subscription in registry.iter() {
            match subscription.status() {
                SubscriptionStatus::Pending | SubscriptionStatus::Connected => {
                    subscription.set_status(SubscriptionStatus::Pending);
                    self.send(&Command::subscribe(subscription.identifier()));
                }
                SubscriptionStatus::Rejected => {}
            }
        }
    }

    pub fn contains(&self, subscription: &Subscription) -> bool {
        self.registry().iter().any(|s| s == subscription)
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }

    pub fn notify_connected(&self, identifier: &str) {
        for subscription in self.matching(identifier) {
            if !subscription.confirm() {
                continue;
            }
            if let Some(cb) = subscription.connected_callback() {
                dispatch(&subscription, "connected", || cb());
            }
        }
    }

    /// The server refused `identifier`: notify and forget every matching handle.
    pub fn reject(&self, identifier: &str) {
        let rejected = self.matching(identifier);
        for subscription in &rejected {
            subscription.set_status(SubscriptionStatus::Rejected);
            if let Some(cb) = subscription.rejected_callback() {
                dispatch(subscription, "rejected", || cb());
            }
        }
        // The server holds no subscription for this identifier, so no unsubscribe.
        self.registry().retain(|s| !rejected.contains(s));
    }

    pub fn notify_received(&self, identifier: &str, payload: &Value) {
        for subscription in self.matching(identifier) {
            if let Some(cb) = subscription.received_callback() {
                dispatch(&subscription, "received", || cb(payload));
            }
        }
    }

    pub fn notify_disconnected(&self) {
        for subscription in self.snapshot() {
            if let Some(cb) = subscription.disconnected_callback() {
                dispatch(&subscription, "disconnected", || cb());
            }
        }
    }

    pub fn notify_failed(&self, error: &Error) {
        for subscription in self.snapshot() {
            if let Some(cb) = subscription.failed_callback() {
                dispatch(&subscription, "failed", || cb(error));
            }
        }
    }

    fn send(&self, command: &Command) -> bool {
        let sent = self
            .sink
            .upgrade()
            .is_some_and(|sink| sink.send_command(command));
        if !sent {
            tracing::debug!(
                command = command.command(),
                identifier = command.identifier(),
                "Command not sent, connection is not open"
            );
        }
        sent
    }

    fn snapshot(&self) -> Vec<Subscription> {
        self.registry().clone()
    }

    fn matching(&self, identifier: &str) -> Vec<Subscription> {
        self.registry()
            .iter()
            .filter(|s| s.identifier() == identifier)
            .cloned()
            .collect()
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run one subscription callback, containing any panic so the rest of the
/// dispatch still happens.
fn dispatch(subscription: &Subscription, event: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(
            identifier = subscription.identifier(),
            event,
            "Subscription callback panicked"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
