//! Action Cable client over WebSocket.
//!
//! Speaks the JSON text protocol used by Rails' Action Cable: one persistent
//! WebSocket multiplexes any number of channel subscriptions.
//!
//! # Features
//! - Subscriptions created before the connection opens are sent on welcome
//! - Every subscription is re-sent after a reconnect
//! - Ping-based staleness detection with exponential reconnect backoff
//! - Extra headers and query parameters on the upgrade request for cookie or
//!   token auth
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), action_cable::Error> {
//! use action_cable::{Channel, Consumer, ConsumerConfig};
//!
//! let consumer = Consumer::new(ConsumerConfig::new("ws://localhost:3000/cable"))?;
//! let subscription = consumer
//!     .subscriptions()
//!     .create(&Channel::new("ChatChannel").with_param("room", "lobby"));
//! subscription
//!     .on_connected(|| println!("subscribed"))
//!     .on_received(|payload| println!("got: {payload}"));
//!
//! consumer.connect();
//! tokio::signal::ctrl_c().await.ok();
//! consumer.unsubscribe_and_disconnect().await;
//! # Ok(())
//! # }
//! ```

mod channel;
mod connection;
mod consumer;
mod monitor;
pub mod protocol;
mod subscription;
mod subscriptions;
mod types;

pub use channel::Channel;
pub use connection::{Connection, ConnectionListener};
pub use consumer::Consumer;
pub use monitor::{ConnectionMonitor, MonitorConfig, MonitorState, Reopen};
pub use protocol::{Command, Message};
pub use subscription::{Subscription, SubscriptionStatus};
pub use subscriptions::{CommandSink, Subscriptions};
pub use types::{ConsumerConfig, Error, TimingConfig};
