use crate::config::SessionConfig;
use crate::error::{Result, TesiraError};
use crate::protocol::{Command, Reply};
use crate::subscription::SubscriptionRouter;
use crate::sync::lock;
use crate::transport::{read_line, BoxedTransport, Connector};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    /// Transport lost; reconnection in progress
    Degraded,
    /// Connection could not be (re)established
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The single request currently on the wire
struct PendingRequest {
    id: u64,
    line: String,
    reply_tx: oneshot::Sender<Result<Reply>>,
}

/// One live transport with its reader and writer tasks
struct Link {
    generation: u64,
    outgoing: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    /// Stop reading and let the writer flush and shut the stream down
    fn close(self) -> JoinHandle<()> {
        self.reader.abort();
        drop(self.outgoing);
        self.writer
    }
}

struct Shared {
    connector: Box<dyn Connector>,
    config: SessionConfig,
    router: Arc<SubscriptionRouter>,
    state_tx: watch::Sender<SessionState>,
    /// Fair mutex: waiters acquire in FIFO order, one request on the wire at a time
    wire: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingRequest>>,
    link: Mutex<Option<Link>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    next_request: AtomicU64,
    next_generation: AtomicU64,
}

/// TTP session over a single persistent transport
///
/// Commands are serialized: exactly one is in flight and its reply is the
/// next `+OK`/`-ERR` line from the device. Publishes arriving in between
/// are handed to the subscription router.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Create a session; nothing is opened until `connect`
    pub fn new(
        connector: impl Connector,
        router: Arc<SubscriptionRouter>,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector: Box::new(connector),
                config,
                router,
                state_tx,
                wire: tokio::sync::Mutex::new(()),
                pending: Mutex::new(None),
                link: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                next_request: AtomicU64::new(1),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Open the transport and run the handshake
    ///
    /// Retries up to `connect_retries` times with backoff before failing.
    /// Subscriptions already registered with the router are re-issued.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        match shared.state() {
            SessionState::Ready => return Ok(()),
            state @ (SessionState::Connecting | SessionState::Degraded) => {
                return Err(TesiraError::NotConnected { state })
            }
            SessionState::Disconnected | SessionState::Failed => {}
        }

        shared.set_state(SessionState::Connecting);
        let attempts = shared.config.connect_retries + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = shared.config.reconnect.backoff(attempt - 1);
                tracing::info!("Retrying connection in {:?}", delay);
                tokio::time::sleep(delay).await;
            }

            match shared.establish().await {
                Ok(()) => {
                    shared.set_state(SessionState::Ready);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt = attempt + 1, "Connection attempt failed");
                    shared.drop_link();
                    last_error = Some(e);
                }
            }
        }

        shared.set_state(SessionState::Failed);
        Err(TesiraError::ConnectFailed {
            attempts,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Send a command and wait for its reply using the configured timeout
    pub async fn send(&self, command: &Command) -> Result<Value> {
        self.send_with_timeout(command, self.shared.config.request_timeout)
            .await
    }

    /// Send a command and wait at most `wait` for its reply
    ///
    /// A timed-out request is discarded; a late reply to it is not expected.
    pub async fn send_with_timeout(&self, command: &Command, wait: Duration) -> Result<Value> {
        self.shared.request(command.encode(), wait, false).await
    }

    /// Send a raw protocol line and wait for its reply
    pub async fn send_line(&self, line: &str) -> Result<Value> {
        self.shared
            .request(line.trim().to_string(), self.shared.config.request_timeout, false)
            .await
    }

    /// Re-issue every registered subscription on the current connection
    pub async fn resubscribe(&self) -> Result<()> {
        self.shared.admit(false)?;
        self.shared.restore_subscriptions(false).await
    }

    /// Cancel the in-flight request, stop reconnecting and close the transport
    pub async fn disconnect(&self) {
        if let Some(writer) = self.shared.shutdown() {
            let _ = timeout(WRITER_DRAIN_TIMEOUT, writer).await;
        }
        tracing::info!("Session disconnected");
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn router(&self) -> &Arc<SubscriptionRouter> {
        &self.shared.router
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shared.shutdown();
    }
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!("Session state: {} -> {}", previous, state);
        }
    }

    /// Move from `from` to `to`, or do nothing if the state is anything else
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let moved = self.state_tx.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        });
        if moved {
            tracing::info!("Session state: {} -> {}", from, to);
        }
        moved
    }

    /// Check whether a request may be issued in the current state
    fn admit(&self, during_connect: bool) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Connecting if during_connect => Ok(()),
            state => Err(TesiraError::NotConnected { state }),
        }
    }

    /// Open a transport, run the handshake, restore subscriptions
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let stream = self.connector.connect().await?;
        self.open_link(stream)?;

        for line in &self.config.handshake {
            self.request(line.clone(), self.config.request_timeout, true)
                .await?;
        }
        self.restore_subscriptions(true).await
    }

    fn open_link(self: &Arc<Self>, stream: BoxedTransport) -> Result<()> {
        let mut link = lock(&self.link);
        if self.state() == SessionState::Disconnected {
            return Err(TesiraError::Cancelled);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            Arc::clone(self),
            write_half,
            outgoing_rx,
            generation,
        ));
        let reader = tokio::spawn(read_loop(Arc::clone(self), read_half, generation));

        let previous = link.replace(Link {
            generation,
            outgoing,
            reader,
            writer,
        });
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(())
    }

    fn drop_link(&self) {
        let link = lock(&self.link).take();
        if let Some(link) = link {
            link.close();
        }
    }

    async fn restore_subscriptions(&self, during_connect: bool) -> Result<()> {
        let commands = self.router.subscribe_commands();
        if commands.is_empty() {
            return Ok(());
        }

        tracing::info!("Issuing {} subscription(s)", commands.len());
        for command in commands {
            match self
                .request(command.encode(), self.config.request_timeout, during_connect)
                .await
            {
                Ok(_) => {}
                Err(e @ TesiraError::Device { .. }) => {
                    tracing::warn!(command = %command, error = %e, "Subscription rejected by device");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send one line and wait for the matching reply
    async fn request(&self, line: String, wait: Duration, during_connect: bool) -> Result<Value> {
        self.admit(during_connect)?;
        let _wire = self.wire.lock().await;
        self.admit(during_connect)?;

        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let link = lock(&self.link);
            let Some(link) = link.as_ref() else {
                return Err(TesiraError::ConnectionClosed);
            };

            *lock(&self.pending) = Some(PendingRequest {
                id,
                line: line.clone(),
                reply_tx,
            });

            tracing::debug!("Sending: {}", line);
            if link.outgoing.send(line.clone()).is_err() {
                lock(&self.pending).take();
                return Err(TesiraError::ConnectionClosed);
            }
        }

        // Clears the slot on timeout or if the caller gives up waiting
        let _guard = PendingGuard { shared: self, id };

        let reply = match timeout(wait, reply_rx).await {
            Ok(Ok(reply)) => reply?,
            Ok(Err(_)) => return Err(TesiraError::ConnectionClosed),
            Err(_) => {
                tracing::warn!("Request timed out: {}", line);
                return Err(TesiraError::Timeout { command: line });
            }
        };

        match reply {
            Reply::Success(value) => Ok(value),
            Reply::Error { code, message } => Err(TesiraError::Device { code, message }),
            Reply::Publish { .. } => Err(TesiraError::protocol("publish delivered as a reply")),
        }
    }

    /// Route one decoded line: reply to the pending request, publish to the router
    fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }

        match Reply::decode(line) {
            Ok(Reply::Publish { token, value }) => {
                tracing::trace!("Publish: {}", line);
                self.router.route(&token, value);
            }
            Ok(reply) => {
                let pending = lock(&self.pending).take();
                match pending {
                    Some(pending) => {
                        tracing::debug!("Received: {}", line);
                        let _ = pending.reply_tx.send(Ok(reply));
                    }
                    None => tracing::warn!("Dropping reply with no pending request: {}", line),
                }
            }
            Err(e) => {
                let echoed = lock(&self.pending)
                    .as_ref()
                    .is_some_and(|pending| pending.line == line);
                if echoed {
                    tracing::trace!("Skipping command echo: {}", line);
                } else {
                    tracing::warn!("Dropping line: {}", e);
                }
            }
        }
    }

    fn fail_pending(&self, error: TesiraError) {
        let pending = lock(&self.pending).take();
        if let Some(pending) = pending {
            let _ = pending.reply_tx.send(Err(error));
        }
    }

    /// Called by the reader or writer of `generation` when the transport fails
    fn on_link_lost(self: &Arc<Self>, generation: u64) {
        let link = {
            let mut link = lock(&self.link);
            match link.as_ref() {
                Some(current) if current.generation == generation => link.take(),
                _ => return,
            }
        };
        if let Some(link) = link {
            link.close();
        }
        self.fail_pending(TesiraError::ConnectionClosed);

        // Losses while connecting are reported by the failing request
        if !self.transition(SessionState::Ready, SessionState::Degraded) {
            return;
        }
        if !self.config.reconnect.enabled {
            tracing::error!("Transport lost and reconnection is disabled");
            self.transition(SessionState::Degraded, SessionState::Failed);
            return;
        }

        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move { shared.reconnect_loop().await });
        if let Some(previous) = lock(&self.reconnect_task).replace(handle) {
            previous.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let reconnect = self.config.reconnect.clone();

        for attempt in 0..reconnect.max_retries {
            let delay = reconnect.backoff(attempt);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempt + 1,
                "Waiting before reconnect"
            );
            tokio::time::sleep(delay).await;

            // A disconnect while sleeping leaves nothing to reconnect
            if !self.transition(SessionState::Degraded, SessionState::Connecting) {
                tracing::debug!(state = %self.state(), "Reconnect abandoned");
                return;
            }
            match self.establish().await {
                Ok(()) if self.transition(SessionState::Connecting, SessionState::Ready) => {
                    tracing::info!("Reconnected");
                    return;
                }
                Ok(()) => {
                    self.drop_link();
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt = attempt + 1, "Reconnect failed");
                    self.drop_link();
                    if !self.transition(SessionState::Connecting, SessionState::Degraded) {
                        return;
                    }
                }
            }
        }

        tracing::error!(
            max_retries = reconnect.max_retries,
            "Reconnection limit reached, giving up"
        );
        self.transition(SessionState::Degraded, SessionState::Failed);
    }

    /// Tear everything down; returns the writer task so callers may wait for it
    fn shutdown(&self) -> Option<JoinHandle<()>> {
        self.set_state(SessionState::Disconnected);
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
        let link = lock(&self.link).take();
        self.fail_pending(TesiraError::Cancelled);
        link.map(Link::close)
    }
}

struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = lock(&self.shared.pending);
        if pending.as_ref().is_some_and(|p| p.id == self.id) {
            pending.take();
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut write: WriteHalf<BoxedTransport>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    generation: u64,
) {
    while let Some(line) = outgoing.recv().await {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        let result = async {
            write.write_all(&bytes).await?;
            write.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!("Failed to send command: {}", e);
            shared.on_link_lost(generation);
            return;
        }
    }
    let _ = write.shutdown().await;
}

async fn read_loop(shared: Arc<Shared>, read: ReadHalf<BoxedTransport>, generation: u64) {
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();
    loop {
        match read_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => shared.handle_line(&line),
            Ok(None) => {
                tracing::info!("Transport closed by device");
                break;
            }
            Err(e) => {
                tracing::error!("Transport read error: {}", e);
                break;
            }
        }
    }
    shared.on_link_lost(generation);
}
