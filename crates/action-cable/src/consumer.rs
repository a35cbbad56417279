//! Public entry point: [`Consumer`].

use std::sync::Arc;

use crate::connection::{Connection, ConnectionListener};
use crate::monitor::{ConnectionMonitor, MonitorConfig};
use crate::protocol::Message;
use crate::subscriptions::Subscriptions;
use crate::types::{ConsumerConfig, Error};

/// One cable connection with its monitor and subscription registry.
///
/// Create subscriptions through [`subscriptions`](Consumer::subscriptions),
/// then [`connect`](Consumer::connect). Subscriptions created before the
/// connection opens are sent once the server welcomes the session, and again
/// after every reconnect.
///
/// Dropping the consumer closes the connection.
pub struct Consumer {
    connection: Arc<Connection>,
    monitor: ConnectionMonitor,
    subscriptions: Arc<Subscriptions>,
}

impl Consumer {
    /// Build a consumer. Fails on an invalid URL, scheme or header; does not
    /// touch the network.
    pub fn new(config: ConsumerConfig) -> Result<Self, Error> {
        let connection = Arc::new(Connection::new(&config)?);
        let monitor = ConnectionMonitor::new(&connection, MonitorConfig::from(&config));
        let subscriptions = Arc::new(Subscriptions::new(&connection));

        connection.set_listener(Arc::new(ConsumerListener {
            subscriptions: Arc::clone(&subscriptions),
            monitor: monitor.clone(),
        }));

        Ok(Self {
            connection,
            monitor,
            subscriptions,
        })
    }

    /// Open the connection and start health monitoring. Must be called from
    /// within a Tokio runtime.
    pub fn connect(&self) {
        tracing::info!(url = %self.connection.url(), "Connecting");
        self.connection.open();
        self.monitor.start();
    }

    /// Stop reconnecting and close the connection. Subscriptions are kept and
    /// re-sent by the next [`connect`](Consumer::connect).
    pub async fn disconnect(&self) {
        self.monitor.stop().await;
        self.connection.close();
    }

    /// Notify every subscription, unsubscribe all of them, then disconnect.
    pub async fn unsubscribe_and_disconnect(&self) {
        self.subscriptions.notify_disconnected();
        self.subscriptions.remove_all();
        self.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub fn subscriptions(&self) -> &Arc<Subscriptions> {
        &self.subscriptions
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.monitor.cancel();
        self.connection.close();
    }
}

/// Routes connection events to the monitor and the registry.
struct ConsumerListener {
    subscriptions: Arc<Subscriptions>,
    monitor: ConnectionMonitor,
}

impl ConnectionListener for ConsumerListener {
    fn on_open(&self) {
        self.monitor.record_connect();
        self.subscriptions.reload();
    }

    fn on_message(&self, text: &str) {
        let message = match Message::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping frame: {e}");
                return;
            }
        };
        match message {
            // Consumed by the connection.
            Message::Welcome => {}
            Message::Ping { .. } => self.monitor.record_ping(),
            Message::Confirmation { identifier } => {
                tracing::debug!(%identifier, "Subscription confirmed");
                self.subscriptions.notify_connected(&identifier);
            }
            Message::Rejection { identifier } => {
                tracing::warn!(%identifier, "Subscription rejected");
                self.subscriptions.reject(&identifier);
            }
            Message::Data {
                identifier,
                payload,
            } => self.subscriptions.notify_received(&identifier, &payload),
            Message::Disconnect { reason, reconnect } => {
                tracing::info!(?reason, reconnect, "Server requested disconnect");
                if !reconnect {
                    self.monitor.cancel();
                }
            }
        }
    }

    fn on_failure(&self, error: &Error) {
        self.subscriptions.notify_failed(error);
    }

    fn on_closing(&self) {
        self.subscriptions.notify_disconnected();
        self.monitor.record_disconnect();
    }

    fn on_closed(&self) {
        tracing::debug!("Connection closed");
    }
}
