//! Transport session ownership: [`Connection`].
//!
//! Each `open` spawns a session task that owns the WebSocket. The task reports
//! back through a [`ConnectionListener`]. Sessions carry a generation number;
//! once a session is torn down its late events are discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

use crate::monitor::Reopen;
use crate::protocol::Message;
use crate::subscriptions::CommandSink;
use crate::types::{ConsumerConfig, Error};

/// Receives connection lifecycle events.
///
/// Methods are called from the session task (or from the thread calling
/// `close`/`reopen`), never while the connection holds a lock.
pub trait ConnectionListener: Send + Sync {
    /// The server sent its welcome frame.
    fn on_open(&self);
    /// A text frame other than the welcome.
    fn on_message(&self, text: &str);
    fn on_failure(&self, error: &Error);
    /// The open session is going away. Only sent for sessions that saw a welcome.
    fn on_closing(&self);
    /// The session finished tearing down. Sent once for every session,
    /// including one closed or failed before its welcome arrived.
    fn on_closed(&self);
}

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Endpoint {
    url: url::Url,
    headers: Vec<(HeaderName, HeaderValue)>,
    connect_timeout: Duration,
    close_timeout: Duration,
}

impl Endpoint {
    fn from_config(config: &ConsumerConfig) -> Result<Self, Error> {
        let mut url = url::Url::parse(&config.url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        }
        if !config.query.is_empty() {
            let mut q = url.query_pairs_mut();
            for (key, value) in &config.query {
                q.append_pair(key, value);
            }
        }

        let headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let invalid = |reason: String| Error::InvalidHeader {
                    name: name.clone(),
                    reason,
                };
                let header_name =
                    HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
                let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
                Ok((header_name, header_value))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let timing = config.timing();
        Ok(Self {
            url,
            headers,
            connect_timeout: timing.connect_timeout,
            close_timeout: timing.close_timeout,
        })
    }
}

async fn connect(endpoint: &Endpoint) -> Result<WsStream, Error> {
    let mut request = endpoint.url.as_str().into_client_request()?;
    for (name, value) in &endpoint.headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }
    let (ws, _resp) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

enum Outbound {
    Text(String),
    Close,
}

struct Session {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SessionState {
    session: Option<Session>,
    open: bool,
    generation: u64,
}

impl SessionState {
    /// Detach the current session, invalidating its generation.
    fn detach(&mut self) -> Option<(Session, bool)> {
        let session = self.session.take()?;
        let was_open = std::mem::replace(&mut self.open, false);
        self.generation += 1;
        Some((session, was_open))
    }
}

struct Shared {
    endpoint: Endpoint,
    state: Mutex<SessionState>,
    listener: Mutex<Option<Arc<dyn ConnectionListener>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, f: impl FnOnce(&dyn ConnectionListener)) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            f(listener.as_ref());
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state().generation == generation
    }

    fn handle_text(&self, generation: u64, text: &str) {
        if matches!(Message::parse(text), Ok(Message::Welcome)) {
            {
                let mut state = self.state();
                if state.generation != generation {
                    return;
                }
                if state.open {
                    tracing::debug!("Duplicate welcome ignored");
                    return;
                }
                state.open = true;
            }
            tracing::info!(url = %self.endpoint.url, "Connection opened");
            self.emit(|l| l.on_open());
            return;
        }
        if self.is_current(generation) {
            self.emit(|l| l.on_message(text));
        }
    }

    /// The session task is exiting on its own (server close, I/O error,
    /// connect failure).
    fn session_ended(&self, generation: u64, error: Option<Error>) {
        let was_open = {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.session = None;
            std::mem::replace(&mut state.open, false)
        };
        if let Some(error) = error {
            tracing::warn!("Connection failed: {error}");
            self.emit(|l| l.on_failure(&error));
        }
        if was_open {
            tracing::info!("Connection closed by server");
            self.emit(|l| l.on_closing());
        }
        self.emit(|l| l.on_closed());
    }

    /// Finish tearing down a session already detached from the state.
    fn shut_down(self: &Arc<Self>, session: Session, was_open: bool) {
        let _ = session.outbound.send(Outbound::Close);
        if was_open {
            self.emit(|l| l.on_closing());
        }

        let mut task = session.task;
        let Ok(runtime) = Handle::try_current() else {
            task.abort();
            self.emit(|l| l.on_closed());
            return;
        };
        let shared = Arc::clone(self);
        runtime.spawn(async move {
            if tokio::time::timeout(shared.endpoint.close_timeout, &mut task)
                .await
                .is_err()
            {
                tracing::warn!("Session did not close in time, aborting");
                task.abort();
            }
            shared.emit(|l| l.on_closed());
        });
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One logical cable connection, backed by at most one WebSocket at a time.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(config: &ConsumerConfig) -> Result<Self, Error> {
        Ok(Self {
            shared: Arc::new(Shared {
                endpoint: Endpoint::from_config(config)?,
                state: Mutex::new(SessionState::default()),
                listener: Mutex::new(None),
            }),
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Start a session unless one is already open or connecting.
    ///
    /// Must be called from within a Tokio runtime; otherwise the listener
    /// receives [`Error::NoRuntime`].
    pub fn open(&self) {
        let mut state = self.shared.state();
        if state.session.is_some() {
            tracing::debug!(open = state.open, "Connection already active");
            return;
        }
        let started = self.start_session(&mut state);
        drop(state);
        if let Err(e) = started {
            self.shared.emit(|l| l.on_failure(&e));
        }
    }

    /// Tear down the current session, if any, and start a new one.
    pub fn reopen(&self) {
        let (previous, started) = {
            let mut state = self.shared.state();
            let previous = state.detach();
            (previous, self.start_session(&mut state))
        };
        tracing::info!(had_session = previous.is_some(), "Reopening connection");
        if let Some((session, was_open)) = previous {
            self.shared.shut_down(session, was_open);
        }
        if let Err(e) = started {
            self.shared.emit(|l| l.on_failure(&e));
        }
    }

    /// Close the current session. Does not wait for the socket to drain.
    pub fn close(&self) {
        let previous = self.shared.state().detach();
        if let Some((session, was_open)) = previous {
            tracing::info!(was_open, "Closing connection");
            self.shared.shut_down(session, was_open);
        }
    }

    /// Queue a text frame. Returns `false` if the connection is not open.
    pub fn send(&self, text: &str) -> bool {
        let state = self.shared.state();
        match &state.session {
            Some(session) if state.open => session
                .outbound
                .send(Outbound::Text(text.to_string()))
                .is_ok(),
            _ => false,
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.shared.state();
        state.open && state.session.is_some()
    }

    pub fn url(&self) -> &url::Url {
        &self.shared.endpoint.url
    }

    fn start_session(&self, state: &mut SessionState) -> Result<(), Error> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.generation += 1;
        state.open = false;
        let task = runtime.spawn(run_session(
            Arc::clone(&self.shared),
            state.generation,
            rx,
        ));
        state.session = Some(Session { outbound: tx, task });
        tracing::debug!(url = %self.shared.endpoint.url, generation = state.generation, "Session started");
        Ok(())
    }
}

impl CommandSink for Connection {
    fn is_open(&self) -> bool {
        Connection::is_open(self)
    }

    fn send(&self, text: &str) -> bool {
        Connection::send(self, text)
    }
}

impl Reopen for Connection {
    fn reopen(&self) {
        Connection::reopen(self);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

async fn run_session(
    shared: Arc<Shared>,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let endpoint = shared.endpoint.clone();
    let ws = tokio::select! {
        result = tokio::time::timeout(endpoint.connect_timeout, connect(&endpoint)) => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                shared.session_ended(generation, Some(e));
                return;
            }
            Err(_) => {
                shared.session_ended(generation, Some(Error::Timeout(endpoint.connect_timeout)));
                return;
            }
        },
        _ = outbound.recv() => {
            tracing::debug!("Close requested before the transport was established");
            return;
        }
    };
    tracing::debug!(url = %endpoint.url, "Transport established, waiting for welcome");

    let (mut ws_write, mut ws_read) = ws.split();
    let error = loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        shared.handle_text(generation, text.as_str());
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        tracing::debug!(?frame, "Server sent close frame");
                    }
                    Some(Ok(_)) => {
                        // Ignore binary, ping, pong frames
                    }
                    Some(Err(e)) => break Some(Error::from(e)),
                    None => break None,
                }
            }

            command = outbound.recv() => {
                match command {
                    Some(Outbound::Text(text)) => {
                        tracing::trace!(frame = %text, "Sending frame");
                        if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                            break Some(Error::from(e));
                        }
                    }
                    Some(Outbound::Close) | None => {
                        close_gracefully(&mut ws_write, &mut ws_read).await;
                        return;
                    }
                }
            }
        }
    };
    shared.session_ended(generation, error);
}

/// Send a close frame and drain until the server finishes the handshake.
/// Bounded by the caller's close timeout.
async fn close_gracefully(ws_write: &mut WsWrite, ws_read: &mut WsRead) {
    if let Err(e) = ws_write.send(tungstenite::Message::Close(None)).await {
        tracing::debug!("Failed to send close frame: {e}");
        return;
    }
    while let Some(frame) = ws_read.next().await {
        if frame.is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
