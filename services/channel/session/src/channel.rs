//! Channel: registry of sessions over TCP.
//!
//! The channel owns every [`SessionMap`] and the index from connection ids to
//! session ids. It opens outbound connections, accepts inbound ones, revives
//! self-initiated sessions on new connections so their ids survive a
//! reconnect, and routes received Requests and Datagrams to the application's
//! [`MessageHandler`].

use crate::config::ChannelConfig;
use crate::connection::Connection;
use crate::error::{ChannelError, Result};
use crate::ids::{ConnectionId, SessionId};
use crate::message::{Message, MessageType};
use crate::session_map::{SessionInfo, SessionMap, SessionObserver};
use crate::sink::SinkSet;
use crate::transport::{listen_tcp, Connector, IoStream, TcpConnector};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reply text for Requests that arrive with no handler installed
pub const NO_HANDLER_ERROR: &str = "no message handler registered";

/// Session-level notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A session gained or lost its connection
    SessionStateChange {
        /// Session concerned
        session_id: SessionId,
        /// Whether the session is now connected
        connected: bool,
    },
}

/// Application callback for received Requests and Datagrams
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message.
    ///
    /// For a Request the returned message becomes the Response; the channel
    /// sets its type and correlation id. `Ok(None)` answers with an empty
    /// Response and `Err` with an error Response. Return values for other
    /// message types are ignored.
    async fn on_message(
        &self,
        session_id: &SessionId,
        message: Message,
    ) -> anyhow::Result<Option<Message>>;
}

/// Operations of an RPC channel
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Connect to the configured remote endpoint
    async fn connect(&self) -> Result<SessionId>;

    /// Connect to `endpoint`, reusing a live session to it when allowed
    async fn connect_to(&self, endpoint: SocketAddr) -> Result<SessionId>;

    /// Drop a session for good; returns whether it existed
    async fn disconnect(&self, session_id: &SessionId) -> bool;

    /// Send on a session, reconnecting a dead reconnectable one first
    async fn send_message(
        &self,
        session_id: &SessionId,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>>;

    /// Accept inbound connections; returns the bound address
    async fn start_listening(&self) -> Result<SocketAddr>;

    /// Stop accepting inbound connections
    async fn stop_listening(&self);

    /// Snapshot of a session
    async fn session_info(&self, session_id: &SessionId) -> Option<SessionInfo>;

    /// Whether a session has a live connection
    async fn is_connected(&self, session_id: &SessionId) -> bool;
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<SessionMap>>,
    connections: HashMap<ConnectionId, SessionId>,
}

struct Listener {
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct ChannelInner {
    config: Arc<ChannelConfig>,
    sinks: SinkSet,
    connector: Arc<dyn Connector>,
    registry: Mutex<Registry>,
    events: broadcast::Sender<ChannelEvent>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    listener: Mutex<Option<Listener>>,
    me: Weak<ChannelInner>,
}

/// RPC channel over TCP
#[derive(Clone)]
pub struct TcpChannel {
    inner: Arc<ChannelInner>,
}

impl TcpChannel {
    /// Create a channel with the default sinks and plain TCP, validating `config`
    pub fn new(config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_parts(
            config,
            SinkSet::default(),
            Arc::new(TcpConnector),
        ))
    }

    /// Create a channel from explicit parts; `config` is taken as valid
    pub fn with_parts(config: ChannelConfig, sinks: SinkSet, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Arc::new_cyclic(|me| ChannelInner {
            config: Arc::new(config),
            sinks,
            connector,
            registry: Mutex::new(Registry::default()),
            events,
            handler: RwLock::new(None),
            listener: Mutex::new(None),
            me: me.clone(),
        });
        Self { inner }
    }

    /// Channel configuration
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Install the handler for received Requests and Datagrams
    pub async fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.inner.handler.write().await = Some(handler);
    }

    /// Subscribe to session state changes
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Ids of every registered session
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.inner
            .registry
            .lock()
            .await
            .sessions
            .keys()
            .cloned()
            .collect()
    }

    /// Address bound by [`RpcChannel::start_listening`], if listening
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .lock()
            .await
            .as_ref()
            .map(|l| l.local_addr)
    }

    /// Stop listening and disconnect every session
    pub async fn shutdown(&self) {
        self.inner.stop_listening().await;
        for session_id in self.session_ids().await {
            self.inner.disconnect(&session_id).await;
        }
        info!("Channel shut down");
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("listen_addr", &self.inner.config.listen_addr)
            .field("connector", &self.inner.connector)
            .finish()
    }
}

#[async_trait]
impl RpcChannel for TcpChannel {
    async fn connect(&self) -> Result<SessionId> {
        let endpoint = self
            .inner
            .config
            .remote_endpoint
            .ok_or_else(|| ChannelError::Config("no remote endpoint configured".to_string()))?;
        self.inner.connect_to(endpoint).await
    }

    async fn connect_to(&self, endpoint: SocketAddr) -> Result<SessionId> {
        self.inner.connect_to(endpoint).await
    }

    async fn disconnect(&self, session_id: &SessionId) -> bool {
        self.inner.disconnect(session_id).await
    }

    async fn send_message(
        &self,
        session_id: &SessionId,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>> {
        self.inner.send_message(session_id, message, timeout).await
    }

    async fn start_listening(&self) -> Result<SocketAddr> {
        self.inner.start_listening().await
    }

    async fn stop_listening(&self) {
        self.inner.stop_listening().await
    }

    async fn session_info(&self, session_id: &SessionId) -> Option<SessionInfo> {
        match self.inner.session(session_id).await {
            Some(session) => Some(session.info().await),
            None => None,
        }
    }

    async fn is_connected(&self, session_id: &SessionId) -> bool {
        match self.inner.session(session_id).await {
            Some(session) => session.is_connected().await,
            None => false,
        }
    }
}

impl ChannelInner {
    async fn session(&self, session_id: &SessionId) -> Option<Arc<SessionMap>> {
        self.registry.lock().await.sessions.get(session_id).cloned()
    }

    fn emit(&self, session_id: &SessionId, connected: bool) {
        let event = ChannelEvent::SessionStateChange {
            session_id: session_id.clone(),
            connected,
        };
        if self.events.send(event).is_err() {
            debug!("No subscribers for state change of session {}", session_id);
        }
    }

    async fn connect_to(&self, endpoint: SocketAddr) -> Result<SessionId> {
        if self.config.session_reusable {
            let registry = self.registry.lock().await;
            for session in registry.sessions.values() {
                if session.is_reconnectable()
                    && session.is_connected().await
                    && session.remote_addr().await == endpoint
                {
                    debug!("Reusing session {} to {}", session.id(), endpoint);
                    return Ok(session.id().clone());
                }
            }
        }

        let stream = self.connector.connect(endpoint).await?;
        self.establish(stream, true, None).await
    }

    /// Register a new connection, reviving a matching session when possible
    async fn establish(
        &self,
        stream: IoStream,
        reconnectable: bool,
        revive: Option<&SessionId>,
    ) -> Result<SessionId> {
        let conn = Connection::new(stream, self.config.max_receive_message_size)?;
        let mut registry = self.registry.lock().await;

        let revived = match (reconnectable, revive) {
            (false, _) => None,
            (true, Some(session_id)) => {
                let Some(session) = registry.sessions.get(session_id).cloned() else {
                    conn.close();
                    return Err(ChannelError::ConnectionNotFound(session_id.clone()));
                };
                if session.is_connected().await {
                    debug!(
                        "Session {} already reconnected, dropping {}",
                        session_id,
                        conn.id()
                    );
                    conn.close();
                    return Ok(session_id.clone());
                }
                Some(session)
            }
            (true, None) => Self::find_revivable(&registry, &conn).await,
        };

        let session = match revived {
            Some(session) => {
                session.attach(conn.clone()).await;
                info!(
                    "Revived session {} on {} to {}",
                    session.id(),
                    conn.id(),
                    conn.remote_addr()
                );
                session
            }
            None => {
                let observer: Weak<dyn SessionObserver> = self.me.clone();
                let session = SessionMap::new(
                    SessionId::new(),
                    self.config.clone(),
                    self.sinks.clone(),
                    reconnectable,
                    observer,
                    conn.clone(),
                );
                registry
                    .sessions
                    .insert(session.id().clone(), session.clone());
                info!(
                    "New {} session {} on {} to {}",
                    if reconnectable { "outbound" } else { "inbound" },
                    session.id(),
                    conn.id(),
                    conn.remote_addr()
                );
                session
            }
        };
        registry
            .connections
            .insert(conn.id(), session.id().clone());
        drop(registry);

        session.start().await;
        self.emit(session.id(), true);
        Ok(session.id().clone())
    }

    /// Disconnected reconnectable session last seen on the same remote endpoint and local host
    async fn find_revivable(registry: &Registry, conn: &Connection) -> Option<Arc<SessionMap>> {
        for session in registry.sessions.values() {
            if !session.is_reconnectable() || session.is_connected().await {
                continue;
            }
            if session.remote_addr().await == conn.remote_addr()
                && session.local_addr().await.ip() == conn.local_addr().ip()
            {
                return Some(session.clone());
            }
        }
        None
    }

    async fn disconnect(&self, session_id: &SessionId) -> bool {
        let session = self.registry.lock().await.sessions.remove(session_id);
        match session {
            Some(session) => {
                session.set_reconnectable(false);
                session.close().await;
                info!("Disconnected session {}", session_id);
                true
            }
            None => false,
        }
    }

    async fn send_message(
        &self,
        session_id: &SessionId,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>> {
        let session = self
            .session(session_id)
            .await
            .ok_or_else(|| ChannelError::ConnectionNotFound(session_id.clone()))?;

        if !session.is_connected().await {
            if !session.is_reconnectable() {
                return Err(ChannelError::ConnectionNotFound(session_id.clone()));
            }
            self.reconnect(&session).await?;
        }

        let timeout = timeout.unwrap_or(self.config.default_timeout);
        session.send(message, timeout, false).await
    }

    async fn reconnect(&self, session: &Arc<SessionMap>) -> Result<()> {
        let _guard = session.reconnect_guard().lock().await;
        if session.is_connected().await {
            return Ok(());
        }

        let remote = session.remote_addr().await;
        info!("Reconnecting session {} to {}", session.id(), remote);
        let stream = self.connector.connect(remote).await?;
        let revived = self.establish(stream, true, Some(session.id())).await?;
        if &revived != session.id() {
            return Err(ChannelError::ConnectionNotFound(session.id().clone()));
        }
        Ok(())
    }

    async fn start_listening(&self) -> Result<SocketAddr> {
        let mut slot = self.listener.lock().await;
        if let Some(listener) = slot.as_ref() {
            return Ok(listener.local_addr);
        }

        let listener = listen_tcp(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(self.me.clone(), listener));
        *slot = Some(Listener { task, local_addr });

        info!("Listening on {}", local_addr);
        Ok(local_addr)
    }

    async fn stop_listening(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.task.abort();
            info!("Stopped listening on {}", listener.local_addr);
        }
    }

    async fn reply(&self, session_id: &SessionId, reply: Message, timeout: Duration) {
        let correlation_id = reply.correlation_id.clone();
        let Some(session) = self.session(session_id).await else {
            warn!(
                "Session {} gone before reply {} could be sent",
                session_id, correlation_id
            );
            return;
        };
        if let Err(e) = session.send(reply, timeout, false).await {
            warn!(
                "Failed to send reply {} on session {}: {}",
                correlation_id, session_id, e
            );
        }
    }
}

#[async_trait]
impl SessionObserver for ChannelInner {
    async fn connection_ended(&self, session_id: &SessionId, connection_id: ConnectionId) {
        let mut registry = self.registry.lock().await;
        registry.connections.remove(&connection_id);

        let notify = match registry.sessions.get(session_id).cloned() {
            Some(session) => {
                let replaced = session
                    .connection()
                    .await
                    .is_some_and(|c| c.id() != connection_id && c.is_alive());
                if !replaced && !session.is_reconnectable() {
                    registry.sessions.remove(session_id);
                    info!("Removed session {} after {} ended", session_id, connection_id);
                }
                !replaced
            }
            None => true,
        };
        drop(registry);

        if notify {
            self.emit(session_id, false);
        }
    }

    async fn message_received(&self, session_id: SessionId, message: Message) {
        let handler = self.handler.read().await.clone();
        let request = (message.message_type == MessageType::Request)
            .then(|| Message::response_to(&message));

        let Some(handler) = handler else {
            match request {
                Some(reply) => {
                    let reply = Message {
                        error: Some(NO_HANDLER_ERROR.to_string()),
                        ..reply
                    };
                    self.reply(&session_id, reply, self.config.error_response_timeout)
                        .await;
                }
                None => warn!(
                    "No message handler, dropping {} {} from session {}",
                    message.message_type, message.correlation_id, session_id
                ),
            }
            return;
        };

        let message_type = message.message_type;
        let correlation_id = message.correlation_id.clone();
        let outcome = handler.on_message(&session_id, message).await;

        let Some(empty) = request else {
            match outcome {
                Ok(Some(_)) => debug!(
                    "Ignoring reply to {} {} on session {}",
                    message_type, correlation_id, session_id
                ),
                Ok(None) => {}
                Err(e) => error!(
                    "Handler failed on {} {} from session {}: {:#}",
                    message_type, correlation_id, session_id, e
                ),
            }
            return;
        };

        let (reply, timeout) = match outcome {
            Ok(Some(mut reply)) => {
                reply.message_type = MessageType::Response;
                reply.correlation_id = correlation_id;
                (reply, self.config.default_timeout)
            }
            Ok(None) => (empty, self.config.default_timeout),
            Err(e) => {
                warn!(
                    "Handler failed on request {} from session {}: {:#}",
                    correlation_id, session_id, e
                );
                let reply = Message {
                    error: Some(format!("{:#}", e)),
                    ..empty
                };
                (reply, self.config.error_response_timeout)
            }
        };
        self.reply(&session_id, reply, timeout).await;
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.task.abort();
        }
    }
}

async fn accept_loop(channel: Weak<ChannelInner>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let Some(inner) = channel.upgrade() else {
            break;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set nodelay for {}: {}", peer, e);
        }
        debug!("Accepted connection from {}", peer);
        if let Err(e) = inner
            .establish(IoStream::Plain(stream), false, None)
            .await
        {
            warn!("Failed to set up session for {}: {}", peer, e);
        }
    }
}
