//! Endpoint: the per-datagram pipeline and outbound calls.
//!
//! One endpoint both serves and calls. Every inbound datagram is processed
//! on its own task:
//!
//! ```text
//! decode -> resolve/create session -> ack?    -> resolve pending call
//!                                  -> handler -> reply with ack
//! ```
//!
//! Decode failures, unknown sessions, unknown identifiers and spurious
//! acknowledgments are dropped without a reply.

use crate::config::{EndpointBuilder, EndpointConfig};
use crate::error::{Error, Result};
use crate::protocol::{Message, NO_SEQUENCE, SessionId, codec};
use crate::reaper;
use crate::router::Router;
use crate::session::{SessionTable, await_response};
use crate::transport::DatagramSocket;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

struct Inner<S> {
    socket: S,
    config: EndpointConfig,
    sessions: Arc<SessionTable>,
    router: Router,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// A datagram RPC endpoint.
pub struct Endpoint<S = UdpSocket> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Endpoint<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Endpoint<UdpSocket> {
    /// Create a new endpoint builder.
    #[must_use]
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    /// Bind `0.0.0.0:{port}` and create an endpoint on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the socket cannot be bound.
    pub async fn bind(config: EndpointConfig) -> Result<Self> {
        let addr = config.listen_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;

        info!("UDP endpoint bound to {}", addr);

        Ok(Self::with_socket(socket, config))
    }
}

impl<S: DatagramSocket> Endpoint<S> {
    /// Create an endpoint over an existing socket.
    pub fn with_socket(socket: S, config: EndpointConfig) -> Self {
        let sessions = Arc::new(SessionTable::new(
            config.session_id_len,
            config.max_session_id_attempts,
        ));

        Self {
            inner: Arc::new(Inner {
                socket,
                config,
                sessions,
                router: Router::new(),
                shutdown_token: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
            }),
        }
    }

    /// The handler registry consulted for inbound messages.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// The endpoint's configuration.
    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Address the underlying socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot report its address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Spawn the receive loop and the idle reaper.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if called more than once.
    pub fn start(&self) -> Result<()> {
        if self.inner.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        self.inner.task_tracker.spawn(reaper::run(
            Arc::clone(&self.inner.sessions),
            self.inner.config.max_idle_lifetime,
            self.inner.shutdown_token.clone(),
        ));

        let endpoint = self.clone();
        self.inner
            .task_tracker
            .spawn(async move { endpoint.receive_loop().await });

        self.inner.task_tracker.close();

        info!("UDP endpoint started");

        Ok(())
    }

    /// Stop background tasks and wait for in-flight datagrams to finish.
    pub async fn shutdown(&self) {
        info!("UDP endpoint shutting down...");

        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;

        info!("UDP endpoint shutdown");
    }

    /// Number of active sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether `session` is active.
    #[must_use]
    pub fn contains_session(&self, session: &SessionId) -> bool {
        self.inner.sessions.contains(session)
    }

    /// Address `session` is bound to.
    #[must_use]
    pub fn remote_addr(&self, session: &SessionId) -> Option<SocketAddr> {
        self.inner.sessions.get(session).map(|s| s.remote_addr)
    }

    /// Number of calls on `session` still waiting for an acknowledgment.
    #[must_use]
    pub fn pending_calls(&self, session: &SessionId) -> Option<usize> {
        self.inner.sessions.pending_calls(session)
    }

    /// Drop a session now. Calls waiting on it fail with a timeout.
    pub fn evict(&self, session: &SessionId) -> bool {
        self.inner.sessions.evict(session)
    }

    /// Send a message that expects no reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContentOverflow`] if the message is too large,
    /// [`Error::UnknownSession`] if the session is not active, or an I/O
    /// error if the send fails.
    #[instrument(skip(self, body))]
    pub async fn tell(&self, session: &SessionId, identifier: &str, body: &str) -> Result<()> {
        let message = Message::new(session.clone(), identifier, NO_SEQUENCE, body);
        self.send(session, &message, Instant::now()).await
    }

    /// Send a request and wait for its acknowledgment using the default
    /// timeout.
    ///
    /// # Errors
    ///
    /// See [`Self::promise_with_timeout`].
    pub async fn promise(
        &self,
        session: &SessionId,
        identifier: &str,
        body: &str,
    ) -> Result<String> {
        self.promise_with_timeout(session, identifier, body, self.inner.config.default_timeout)
            .await
    }

    /// Send a request and wait for its acknowledgment.
    ///
    /// Returns the acknowledgment's body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContentOverflow`] if the request is too large (nothing
    /// is sent), [`Error::Timeout`] if no acknowledgment arrives in time,
    /// [`Error::UnknownSession`] if the session is not active, or an I/O
    /// error if the send fails.
    #[instrument(skip(self, body))]
    pub async fn promise_with_timeout(
        &self,
        session: &SessionId,
        identifier: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<String> {
        let sessions = &self.inner.sessions;

        let sequence = sessions.next_sequence(session)?;
        let request = Message::new(session.clone(), identifier, sequence, body);
        let datagram = self.encode_checked(&request)?;

        let slot = sessions.register_wait(session, sequence)?;
        debug!("Registered pending call {} on session {}", sequence, session);

        if let Err(e) = self.transmit(session, &datagram, Instant::now()).await {
            sessions.abandon(session, sequence);
            return Err(e);
        }

        match await_response(slot, timeout).await {
            Ok(response) => Ok(response.body),
            Err(e) => {
                sessions.abandon(session, sequence);
                debug!("Call {} on session {} timed out", sequence, session);
                Err(e)
            }
        }
    }

    /// Open a session with a peer using the default timeout.
    ///
    /// # Errors
    ///
    /// See [`Self::connect_with_timeout`].
    pub async fn connect(
        &self,
        remote: SocketAddr,
        identifier: &str,
        body: &str,
    ) -> Result<(SessionId, String)> {
        self.connect_with_timeout(remote, identifier, body, self.inner.config.default_timeout)
            .await
    }

    /// Open a session with a peer.
    ///
    /// Sends a session-establishing request and adopts the session id the
    /// peer assigns in its acknowledgment. Returns that id and the
    /// acknowledgment's body. The peer's handler must produce a non-empty
    /// response or the call times out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContentOverflow`] if the request is too large,
    /// [`Error::Timeout`] if the peer does not answer in time, or an I/O
    /// error if the send fails.
    #[instrument(skip(self, body))]
    pub async fn connect_with_timeout(
        &self,
        remote: SocketAddr,
        identifier: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<(SessionId, String)> {
        let sessions = &self.inner.sessions;

        let sequence = sessions.next_establish_sequence();
        let request = Message::new(SessionId::empty(), identifier, sequence, body);
        let datagram = self.encode_checked(&request)?;

        let slot = sessions.register_establish(sequence);

        if let Err(e) = self.inner.socket.send_to(&datagram, remote).await {
            sessions.abandon_establish(sequence);
            return Err(e.into());
        }

        match await_response(slot, timeout).await {
            Ok(response) => {
                info!("Established session {} via {}", response.session, remote);
                Ok((response.session, response.body))
            }
            Err(e) => {
                sessions.abandon_establish(sequence);
                Err(e)
            }
        }
    }

    async fn receive_loop(self) {
        let mut buf = vec![0u8; self.inner.config.max_transmit_size];

        loop {
            let (len, addr) = tokio::select! {
                () = self.inner.shutdown_token.cancelled() => break,
                received = self.inner.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Failed to receive datagram: {}", e);
                        continue;
                    }
                },
            };

            if len == 0 {
                continue;
            }

            let datagram = Bytes::copy_from_slice(&buf[..len]);
            let endpoint = self.clone();
            self.inner
                .task_tracker
                .spawn(async move { endpoint.process(addr, datagram).await });
        }

        debug!("Receive loop stopped");
    }

    /// Run one inbound datagram through the pipeline.
    pub(crate) async fn process(&self, addr: SocketAddr, datagram: Bytes) {
        let message = match codec::decode(&datagram) {
            Ok(message) => message,
            Err(e) => {
                trace!(%addr, "Dropping undecodable datagram: {}", e);
                return;
            }
        };

        let now = Instant::now();
        let sessions = &self.inner.sessions;

        let active = match sessions.resolve_or_create(&message.session, addr, now) {
            Ok(Some(active)) => active,
            Ok(None) => {
                if message.is_ack() && sessions.adopt(addr, now, message) {
                    return;
                }
                trace!(%addr, "Dropping message for unknown session");
                return;
            }
            Err(e) => {
                warn!(%addr, "Failed to create session: {}", e);
                return;
            }
        };

        if message.is_ack() {
            let sequence = message.sequence;
            if !sessions.resolve(&active, sequence, message) {
                trace!(session = %active, sequence, "Ignoring spurious acknowledgment");
            }
            return;
        }

        let Some(handler) = self.inner.router.lookup(&message.identifier) else {
            trace!(identifier = %message.identifier, "Dropping message with no handler");
            return;
        };

        let mut message = message;
        message.session = active.clone();

        let body = handler.handle(&message);
        if body.is_empty() {
            return;
        }

        if !message.expects_reply() {
            trace!(
                session = %active,
                identifier = %message.identifier,
                "Replying to fire-and-forget request"
            );
        }

        let reply = Message::ack(active.clone(), message.sequence, body);
        if let Err(e) = self.send(&active, &reply, now).await {
            debug!(session = %active, "Failed to send reply: {}", e);
        }
    }

    async fn send(&self, session: &SessionId, message: &Message, now: Instant) -> Result<()> {
        let datagram = self.encode_checked(message)?;
        self.transmit(session, &datagram, now).await
    }

    async fn transmit(&self, session: &SessionId, datagram: &[u8], now: Instant) -> Result<()> {
        let addr = self.inner.sessions.route(session, now)?;
        self.inner.socket.send_to(datagram, addr).await?;
        Ok(())
    }

    fn encode_checked(&self, message: &Message) -> Result<Bytes> {
        let datagram = codec::encode(message)?;
        let max = self.inner.config.max_transmit_size;
        if datagram.len() > max {
            return Err(Error::ContentOverflow {
                size: datagram.len(),
                max,
            });
        }
        Ok(datagram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ACK_IDENTIFIER;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records sends instead of transmitting; never receives.
    #[derive(Default)]
    struct RecordingSocket {
        sent: Mutex<Vec<(Bytes, SocketAddr)>>,
        sends: AtomicUsize,
    }

    impl RecordingSocket {
        fn count(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }

        fn last(&self) -> Option<(Message, SocketAddr)> {
            let sent = self.sent.lock();
            sent.last()
                .map(|(bytes, addr)| (codec::decode(bytes).unwrap(), *addr))
        }
    }

    #[async_trait]
    impl DatagramSocket for Arc<RecordingSocket> {
        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().push((Bytes::copy_from_slice(buf), target));
            Ok(buf.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            std::future::pending().await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 7000)))
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7001))
    }

    fn endpoint() -> (Endpoint<Arc<RecordingSocket>>, Arc<RecordingSocket>) {
        let socket = Arc::new(RecordingSocket::default());
        let config = EndpointConfig {
            max_transmit_size: 128,
            ..EndpointConfig::default()
        };
        (Endpoint::with_socket(Arc::clone(&socket), config), socket)
    }

    fn datagram(message: &Message) -> Bytes {
        codec::encode(message).unwrap()
    }

    #[tokio::test]
    async fn test_establishing_message_creates_session_and_replies() {
        let (endpoint, socket) = endpoint();
        endpoint
            .router()
            .register("ping", |_: &Message| "pong".to_string());

        let request = Message::new(SessionId::empty(), "ping", 4, "");
        endpoint.process(peer(), datagram(&request)).await;

        let (reply, to) = socket.last().unwrap();
        assert_eq!(to, peer());
        assert_eq!(reply.identifier, ACK_IDENTIFIER);
        assert_eq!(reply.sequence, 4);
        assert_eq!(reply.body, "pong");
        assert!(endpoint.contains_session(&reply.session));
        assert_eq!(endpoint.remote_addr(&reply.session), Some(peer()));
    }

    #[tokio::test]
    async fn test_handler_sees_active_session() {
        let (endpoint, socket) = endpoint();
        endpoint
            .router()
            .register("whoami", |m: &Message| m.session.to_string());

        let request = Message::new(SessionId::empty(), "whoami", 0, "");
        endpoint.process(peer(), datagram(&request)).await;

        let (reply, _) = socket.last().unwrap();
        assert_eq!(reply.body, reply.session.as_str());
    }

    #[tokio::test]
    async fn test_zero_session_id_len_still_accepts_peers() {
        let socket = Arc::new(RecordingSocket::default());
        let config = EndpointConfig {
            session_id_len: 0,
            ..EndpointConfig::default()
        };
        let endpoint = Endpoint::with_socket(Arc::clone(&socket), config);
        endpoint
            .router()
            .register("ping", |_: &Message| "pong".to_string());

        let request = Message::new(SessionId::empty(), "ping", 0, "");
        endpoint.process(peer(), datagram(&request)).await;

        let (reply, _) = socket.last().unwrap();
        assert_eq!(reply.body, "pong");
        assert_eq!(reply.session.as_str().len(), crate::config::MIN_SESSION_ID_LEN);
        assert_eq!(endpoint.session_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_adopts_reply_from_other_address() {
        let (endpoint, socket) = endpoint();
        let target = SocketAddr::from(([0, 0, 0, 0], 7001));

        let caller = endpoint.clone();
        let call = tokio::spawn(async move {
            caller
                .connect_with_timeout(target, "ping", "", Duration::from_secs(30))
                .await
        });

        while socket.count() == 0 {
            tokio::task::yield_now().await;
        }
        let (request, to) = socket.last().unwrap();
        assert_eq!(to, target);
        assert!(request.session.is_empty());

        let peer_session = SessionId::from("assigned-by-peer");
        let ack = Message::ack(peer_session.clone(), request.sequence, "pong");
        endpoint.process(peer(), datagram(&ack)).await;

        let (session, body) = call.await.unwrap().unwrap();
        assert_eq!(session, peer_session);
        assert_eq!(body, "pong");
        assert_eq!(endpoint.remote_addr(&session), Some(peer()));
    }

    #[tokio::test]
    async fn test_fire_and_forget_reply_keeps_sentinel() {
        let (endpoint, socket) = endpoint();
        endpoint
            .router()
            .register("ping", |_: &Message| "pong".to_string());

        let request = Message::new(SessionId::empty(), "ping", NO_SEQUENCE, "");
        assert!(!request.expects_reply());
        endpoint.process(peer(), datagram(&request)).await;

        let (reply, _) = socket.last().unwrap();
        assert!(reply.is_ack());
        assert_eq!(reply.sequence, NO_SEQUENCE);
    }

    #[tokio::test]
    async fn test_empty_response_suppresses_reply() {
        let (endpoint, socket) = endpoint();
        endpoint.router().register("quiet", |_: &Message| String::new());

        let request = Message::new(SessionId::empty(), "quiet", 0, "");
        endpoint.process(peer(), datagram(&request)).await;

        assert_eq!(socket.count(), 0);
        assert_eq!(endpoint.session_count(), 1);
    }

    #[tokio::test]
    async fn test_inbound_drops() {
        let (endpoint, socket) = endpoint();
        endpoint
            .router()
            .register("ping", |_: &Message| "pong".to_string());

        // Garbage
        endpoint.process(peer(), Bytes::from_static(b"\x00\x01")).await;
        endpoint.process(peer(), Bytes::from_static(b"not a datagram")).await;

        // Unknown session
        let stale = Message::new(SessionId::from("stale"), "ping", 0, "");
        endpoint.process(peer(), datagram(&stale)).await;

        // Unknown identifier creates the session but gets no reply
        let unknown = Message::new(SessionId::empty(), "nope", 0, "");
        endpoint.process(peer(), datagram(&unknown)).await;

        assert_eq!(socket.count(), 0);
        assert_eq!(endpoint.session_count(), 1);
        assert!(!endpoint.contains_session(&SessionId::from("stale")));
    }

    #[tokio::test]
    async fn test_control_messages_never_dispatch() {
        let (endpoint, socket) = endpoint();
        let session = endpoint.inner.sessions.create(peer(), Instant::now()).unwrap();

        let spurious = Message::ack(session.clone(), 9, "unexpected");
        endpoint.process(peer(), datagram(&spurious)).await;
        endpoint.process(peer(), datagram(&spurious)).await;

        assert_eq!(socket.count(), 0);
        assert_eq!(endpoint.pending_calls(&session), Some(0));
    }

    #[tokio::test]
    async fn test_tell_uses_sentinel_sequence() {
        let (endpoint, socket) = endpoint();
        let session = endpoint.inner.sessions.create(peer(), Instant::now()).unwrap();

        endpoint.tell(&session, "notice", "hi").await.unwrap();

        let (message, to) = socket.last().unwrap();
        assert_eq!(to, peer());
        assert_eq!(message.sequence, NO_SEQUENCE);
        assert_eq!(message.identifier, "notice");
        assert_eq!(message.session, session);
    }

    #[tokio::test]
    async fn test_overflow_sends_nothing() {
        let (endpoint, socket) = endpoint();
        let session = endpoint.inner.sessions.create(peer(), Instant::now()).unwrap();
        let body = "x".repeat(512);

        let told = endpoint.tell(&session, "big", &body).await;
        let promised = endpoint
            .promise_with_timeout(&session, "big", &body, Duration::from_secs(1))
            .await;
        let connected = endpoint
            .connect_with_timeout(peer(), "big", &body, Duration::from_secs(1))
            .await;

        assert!(matches!(told, Err(Error::ContentOverflow { max: 128, .. })));
        assert!(matches!(promised, Err(Error::ContentOverflow { .. })));
        assert!(matches!(connected, Err(Error::ContentOverflow { .. })));
        assert_eq!(socket.count(), 0);
        assert_eq!(endpoint.pending_calls(&session), Some(0));
    }

    #[tokio::test]
    async fn test_calls_on_unknown_session() {
        let (endpoint, socket) = endpoint();
        let missing = SessionId::from("missing");

        let told = endpoint.tell(&missing, "x", "").await;
        let promised = endpoint.promise(&missing, "x", "").await;

        assert!(matches!(told, Err(Error::UnknownSession(_))));
        assert!(matches!(promised, Err(Error::UnknownSession(_))));
        assert_eq!(socket.count(), 0);
    }

    #[tokio::test]
    async fn test_promise_resolved_by_ack() {
        let (endpoint, socket) = endpoint();
        let session = endpoint.inner.sessions.create(peer(), Instant::now()).unwrap();

        let caller = endpoint.clone();
        let call_session = session.clone();
        let call = tokio::spawn(async move {
            caller
                .promise_with_timeout(&call_session, "ping", "", Duration::from_secs(5))
                .await
        });

        while socket.count() == 0 {
            tokio::task::yield_now().await;
        }
        let (request, _) = socket.last().unwrap();
        assert_eq!(request.sequence, 0);

        let ack = Message::ack(session.clone(), request.sequence, "pong");
        endpoint.process(peer(), datagram(&ack)).await;

        assert_eq!(call.await.unwrap().unwrap(), "pong");
        assert_eq!(endpoint.pending_calls(&session), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_promise_timeout_leaves_no_pending() {
        let (endpoint, _socket) = endpoint();
        let session = endpoint.inner.sessions.create(peer(), Instant::now()).unwrap();

        let result = endpoint
            .promise_with_timeout(&session, "ping", "", Duration::from_millis(300))
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(endpoint.pending_calls(&session), Some(0));

        // A late acknowledgment is a no-op
        let late = Message::ack(session.clone(), 0, "pong");
        endpoint.process(peer(), datagram(&late)).await;
        assert_eq!(endpoint.pending_calls(&session), Some(0));
    }

    #[tokio::test]
    async fn test_evict_fails_pending_promise() {
        let (endpoint, socket) = endpoint();
        let session = endpoint.inner.sessions.create(peer(), Instant::now()).unwrap();

        let caller = endpoint.clone();
        let call_session = session.clone();
        let call = tokio::spawn(async move {
            caller
                .promise_with_timeout(&call_session, "ping", "", Duration::from_secs(30))
                .await
        });

        while socket.count() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(endpoint.evict(&session));

        assert!(matches!(call.await.unwrap(), Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (endpoint, _socket) = endpoint();

        endpoint.start().unwrap();
        assert!(matches!(endpoint.start(), Err(Error::AlreadyStarted)));

        endpoint.shutdown().await;
    }
}
