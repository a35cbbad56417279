//! A single local interest in a channel: [`Subscription`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::{Map, Value};

use crate::Error;
use crate::protocol::Command;
use crate::subscriptions::CommandSink;

pub(crate) type Callback = Arc<dyn Fn() + Send + Sync>;
pub(crate) type ReceivedCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub(crate) type FailedCallback = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionStatus {
    /// Subscribe sent (or waiting for the connection), no confirmation yet.
    Pending = 0,
    Connected = 1,
    Rejected = 2,
}

impl SubscriptionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connected,
            2 => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connected: Option<Callback>,
    disconnected: Option<Callback>,
    rejected: Option<Callback>,
    received: Option<ReceivedCallback>,
    failed: Option<FailedCallback>,
}

struct Inner {
    id: u64,
    identifier: String,
    status: AtomicU8,
    callbacks: Mutex<Callbacks>,
    sink: Weak<dyn CommandSink>,
}

/// Handle returned by [`Subscriptions::create`](crate::Subscriptions::create).
///
/// Clones refer to the same subscription. Two handles created for the same
/// channel share an identifier but are still distinct subscriptions.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    pub(crate) fn new(id: u64, identifier: String, sink: Weak<dyn CommandSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                identifier,
                status: AtomicU8::new(SubscriptionStatus::Pending as u8),
                callbacks: Mutex::new(Callbacks::default()),
                sink,
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Called when the server confirms the subscription.
    pub fn on_connected(&self, f: impl Fn() + Send + Sync + 'static) -> &Self {
        self.callbacks().connected = Some(Arc::new(f));
        self
    }

    /// Called when the connection goes away. The subscription is re-sent on reconnect.
    pub fn on_disconnected(&self, f: impl Fn() + Send + Sync + 'static) -> &Self {
        self.callbacks().disconnected = Some(Arc::new(f));
        self
    }

    /// Called when the server refuses the subscription. The handle is removed afterwards.
    pub fn on_rejected(&self, f: impl Fn() + Send + Sync + 'static) -> &Self {
        self.callbacks().rejected = Some(Arc::new(f));
        self
    }

    /// Called with the payload of every broadcast on this channel.
    pub fn on_received(&self, f: impl Fn(&Value) + Send + Sync + 'static) -> &Self {
        self.callbacks().received = Some(Arc::new(f));
        self
    }

    /// Called on transport failures.
    pub fn on_failed(&self, f: impl Fn(&Error) + Send + Sync + 'static) -> &Self {
        self.callbacks().failed = Some(Arc::new(f));
        self
    }

    /// Invoke `action` on the server-side channel with `params`.
    ///
    /// Returns `false` if the frame could not be queued (connection not open).
    pub fn perform(&self, action: &str, mut params: Map<String, Value>) -> bool {
        params.insert("action".to_string(), Value::from(action));
        let command = Command::message(self.identifier(), &Value::Object(params));
        match self.inner.sink.upgrade() {
            Some(sink) => sink.send_command(&command),
            None => false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn set_status(&self, status: SubscriptionStatus) {
        self.inner.status.store(status as u8, Ordering::Release);
    }

    /// Move Pending → Connected. Returns false if the handle was not pending.
    pub(crate) fn confirm(&self) -> bool {
        self.inner
            .status
            .compare_exchange(
                SubscriptionStatus::Pending as u8,
                SubscriptionStatus::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn connected_callback(&self) -> Option<Callback> {
        self.callbacks().connected.clone()
    }

    pub(crate) fn disconnected_callback(&self) -> Option<Callback> {
        self.callbacks().disconnected.clone()
    }

    pub(crate) fn rejected_callback(&self) -> Option<Callback> {
        self.callbacks().rejected.clone()
    }

    pub(crate) fn received_callback(&self) -> Option<ReceivedCallback> {
        self.callbacks().received.clone()
    }

    pub(crate) fn failed_callback(&self) -> Option<FailedCallback> {
        self.callbacks().failed.clone()
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, Callbacks> {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Subscription {}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("identifier", &self.identifier())
            .field("status", &self.status())
            .finish()
    }
}
