//! # Backend Connector
//!
//! Maintains exactly one authenticated SSH session to the backend with a
//! pinned server host key, runs the `bastio-agent` subsystem on a session
//! channel, and relays netstring-framed protocol messages between that
//! channel and every registered endpoint.
//!
//! Inbound messages fan out to all endpoint ingress queues. Outbound
//! messages fan in from endpoint egress queues into one TX channel; a
//! message pulled from an endpoint is either written to the backend or held
//! in the retry queue for the next connection — it is never dropped. Failed
//! sends go back to the *front* of the retry queue, so egress order survives
//! reconnects.
//!
//! Connection failures back off exponentially with full jitter up to a cap.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{FutureExt, SinkExt, StreamExt};
use rand::Rng;
use russh::client::{self, Handle};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bastio_proto::{FramingError, NetstringCodec, ProtocolMessage};

use crate::error::{AgentError, AgentResult};
use crate::pool::{Pool, Task, TaskHandle};

/// The subsystem the backend serves for agents.
pub const SUBSYSTEM: &str = "bastio-agent";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_TIMEOUT: Duration = Duration::from_secs(15);
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Connector lifecycle states, observable through [`BackendConnector::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// The connector side of an endpoint: a sender the connector fans inbound
/// messages into, and a receiver it drains for outbound messages.
pub struct EndpointHandle {
    pub ingress: mpsc::UnboundedSender<ProtocolMessage>,
    pub egress: mpsc::UnboundedReceiver<ProtocolMessage>,
}

/// Connection parameters for the backend.
#[derive(Clone)]
pub struct ConnectorConfig {
    pub host: String,
    pub port: u16,
    /// The account API key doubles as the SSH username.
    pub username: String,
    pub key: Arc<PrivateKey>,
    pub backend_hostkey: PublicKey,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl ConnectorConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        key: Arc<PrivateKey>,
        backend_hostkey: PublicKey,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            key,
            backend_hostkey,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

/// Host-key pinning: the server key must equal the enrolled backend key.
struct ClientHandler {
    expected: PublicKey,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let matches = server_public_key == &self.expected;
        if !matches {
            warn!("backend host key does not match the pinned key");
        }
        Ok(matches)
    }
}

type Transport = Framed<russh::ChannelStream<client::Msg>, NetstringCodec>;

struct Connection {
    /// Held for the channel's lifetime; dropping it tears the session down.
    #[allow(dead_code)]
    session: Handle<ClientHandler>,
    transport: Transport,
}

struct ConnState {
    connection: Option<Connection>,
    attempts: u32,
}

enum LoopEvent {
    Stopped,
    Inbound(Option<Result<BytesMut, FramingError>>),
    Outbound(Option<ProtocolMessage>),
}

struct ConnectorInner {
    config: ConnectorConfig,
    ingress: Mutex<Vec<mpsc::UnboundedSender<ProtocolMessage>>>,
    tx_tx: mpsc::UnboundedSender<ProtocolMessage>,
    tx_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ProtocolMessage>>,
    retry: Mutex<VecDeque<ProtocolMessage>>,
    state_tx: watch::Sender<ConnectorState>,
    conn: tokio::sync::Mutex<ConnState>,
}

/// Maintains the secure channel to the backend and relays messages for its
/// registered endpoints.
pub struct BackendConnector {
    inner: Arc<ConnectorInner>,
    handle: Mutex<Option<TaskHandle>>,
}

impl BackendConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        let (tx_tx, tx_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectorState::Disconnected);
        Self {
            inner: Arc::new(ConnectorInner {
                config,
                ingress: Mutex::new(Vec::new()),
                tx_tx,
                tx_rx: tokio::sync::Mutex::new(tx_rx),
                retry: Mutex::new(VecDeque::new()),
                state_tx,
                conn: tokio::sync::Mutex::new(ConnState {
                    connection: None,
                    attempts: 0,
                }),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Register an endpoint. Inbound messages are delivered to endpoints
    /// registered at the time of delivery; there is no replay for late
    /// registrations. Must be called from within a tokio runtime.
    pub fn register(&self, endpoint: EndpointHandle) {
        self.inner
            .ingress
            .lock()
            .expect("ingress registry")
            .push(endpoint.ingress);

        // Fan this endpoint's egress into the shared TX channel.
        let tx = self.inner.tx_tx.clone();
        let mut egress = endpoint.egress;
        tokio::spawn(async move {
            while let Some(message) = egress.recv().await {
                if tx.send(message).is_err() {
                    break;
                }
            }
        });
    }

    /// Submit the connection-handler task to the pool. Idempotent.
    pub fn start(&self, pool: &Pool) {
        let mut guard = self.handle.lock().expect("connector handle");
        if guard.is_some() {
            return;
        }
        info!("backend connection handler started");
        let inner = self.inner.clone();
        let task = Task::new(move |token| {
            let inner = inner.clone();
            async move { inner.run_once(token).await }.boxed()
        })
        .infinite()
        .on_failure(|failure| {
            error!(
                task_id = %failure.task_id,
                error = %failure.error,
                "unexpected error occurred in the connection handler"
            );
        });
        *guard = Some(pool.run(task));
    }

    /// Stop the connection handler and close the channel.
    pub fn stop(&self) {
        if let Some(handle) = &*self.handle.lock().expect("connector handle") {
            self.inner.state_tx.send_replace(ConnectorState::Closing);
            handle.stop();
        }
    }

    /// Observe connector state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectorState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow() == ConnectorState::Connected
    }
}

impl ConnectorInner {
    /// One pass of the connection handler: establish the session if needed,
    /// then relay a single inbound or outbound message.
    async fn run_once(&self, token: CancellationToken) -> AgentResult<()> {
        let mut st = self.conn.lock().await;

        if token.is_cancelled() {
            self.shut_down(&mut st);
            return Ok(());
        }

        if st.connection.is_none() {
            self.state_tx.send_replace(ConnectorState::Connecting);
            match self.connect().await {
                Ok(connection) => {
                    st.connection = Some(connection);
                    st.attempts = 0;
                    self.state_tx.send_replace(ConnectorState::Connected);
                    info!(
                        host = %self.config.host,
                        port = self.config.port,
                        "connection established with the backend"
                    );
                }
                Err(error) => {
                    self.state_tx.send_replace(ConnectorState::Disconnected);
                    st.attempts = st.attempts.saturating_add(1);
                    let delay = backoff_with_jitter(
                        self.config.backoff_base,
                        self.config.backoff_cap,
                        st.attempts,
                    );
                    error!(
                        error = %error,
                        attempt = st.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "connecting to the backend failed"
                    );
                    drop(st);
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    return Ok(());
                }
            }
        }

        let event = {
            let connection = st.connection.as_mut().expect("connection present");
            // Scheduling preference, not a correctness requirement: check
            // the stop token first, then favor draining retries and egress
            // over reading the next inbound frame.
            tokio::select! {
                biased;
                _ = token.cancelled() => LoopEvent::Stopped,
                outbound = self.next_outgoing() => LoopEvent::Outbound(outbound),
                inbound = connection.transport.next() => LoopEvent::Inbound(inbound),
            }
        };

        match event {
            LoopEvent::Stopped => self.shut_down(&mut st),
            LoopEvent::Inbound(Some(Ok(frame))) => match ProtocolMessage::from_json(&frame) {
                Ok(message) => self.fan_out(message),
                Err(error) => {
                    error!(error = %error, "error parsing a protocol message");
                    self.close(&mut st);
                }
            },
            LoopEvent::Inbound(Some(Err(FramingError::Eof))) | LoopEvent::Inbound(None) => {
                error!("received EOF on channel");
                self.close(&mut st);
            }
            LoopEvent::Inbound(Some(Err(error))) => {
                error!(error = %error, "error parsing a netstring message");
                self.close(&mut st);
            }
            LoopEvent::Outbound(Some(message)) => {
                let payload = Bytes::from(message.to_json());
                let connection = st.connection.as_mut().expect("connection present");
                if let Err(error) = connection.transport.send(payload).await {
                    error!(error = %error, "sending a message to the backend failed");
                    // Retain the message for the next connection.
                    self.retry
                        .lock()
                        .expect("retry queue")
                        .push_front(message);
                    self.close(&mut st);
                }
            }
            LoopEvent::Outbound(None) => {}
        }
        Ok(())
    }

    /// Take the next outbound message: retried messages first, then the
    /// shared TX channel. Pending until something is available.
    async fn next_outgoing(&self) -> Option<ProtocolMessage> {
        if let Some(message) = self.retry.lock().expect("retry queue").pop_front() {
            return Some(message);
        }
        let mut rx = self.tx_rx.lock().await;
        rx.recv().await
    }

    fn fan_out(&self, message: ProtocolMessage) {
        let mut senders = self.ingress.lock().expect("ingress registry");
        senders.retain(|tx| tx.send(message.clone()).is_ok());
    }

    fn close(&self, st: &mut ConnState) {
        if st.connection.take().is_some() {
            error!("connection lost with the backend");
        }
        self.state_tx.send_replace(ConnectorState::Disconnected);
    }

    fn shut_down(&self, st: &mut ConnState) {
        if st.connection.take().is_some() {
            info!("closing connection to the backend");
        }
        self.state_tx.send_replace(ConnectorState::Disconnected);
    }

    /// Dial, verify the pinned host key, authenticate with the agent key,
    /// and invoke the subsystem.
    async fn connect(&self) -> AgentResult<Connection> {
        let config = Arc::new(client::Config {
            client_id: russh::SshId::Standard(format!("bastio-{}", env!("CARGO_PKG_VERSION"))),
            ..Default::default()
        });
        let handler = ClientHandler {
            expected: self.config.backend_hostkey.clone(),
        };

        let mut session = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, (self.config.host.as_str(), self.config.port), handler),
        )
        .await
        .map_err(|_| AgentError::backend("timed out connecting to the backend"))?
        .map_err(|e| match e {
            russh::Error::UnknownKey => AgentError::backend("backend host key does not match"),
            other => AgentError::backend(format!("connecting to the backend failed: {other}")),
        })?;

        let auth = async {
            let hash = session.best_supported_rsa_hash().await?.flatten();
            let key = PrivateKeyWithHashAlg::new(self.config.key.clone(), hash);
            session
                .authenticate_publickey(self.config.username.clone(), key)
                .await
        };
        let outcome = tokio::time::timeout(AUTH_TIMEOUT, auth)
            .await
            .map_err(|_| AgentError::backend("timed out authenticating with the backend"))?
            .map_err(|e| AgentError::backend(format!("authentication with backend failed: {e}")))?;
        if !outcome.success() {
            return Err(AgentError::backend("authentication with backend failed"));
        }

        let mut channel = tokio::time::timeout(CHANNEL_TIMEOUT, session.channel_open_session())
            .await
            .map_err(|_| AgentError::backend("timed out opening a session with the backend"))?
            .map_err(|e| {
                AgentError::backend(format!("opening a session with the backend failed: {e}"))
            })?;
        tokio::time::timeout(CHANNEL_TIMEOUT, channel.request_subsystem(true, SUBSYSTEM))
            .await
            .map_err(|_| AgentError::backend("timed out invoking the agent subsystem"))?
            .map_err(|e| {
                AgentError::backend(format!("invoking the {SUBSYSTEM} subsystem failed: {e}"))
            })?;

        let transport = Framed::new(channel.into_stream(), NetstringCodec::default());
        Ok(Connection { session, transport })
    }
}

/// Full-jitter exponential backoff: uniform over (0, min(cap, base·2^(n-1))].
fn backoff_with_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(cap.as_millis() as u64).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(1..=capped))
}
