//! Session table and per-session correlation state.
//!
//! All membership changes, sequence increments and pending-call mutations
//! go through one table-wide lock. Response slots are `oneshot` channels:
//! the sender lives in the table, the receiver is handed to the caller.
//!
//! ```text
//! promise:  next_sequence -> register_wait -> send -> await_response
//!                                                   |
//! inbound ack:                  resolve(session, seq) -> slot fires
//! ```
//!
//! A slot is removed from the table before its sender fires, so a second
//! resolve for the same pair finds nothing and does nothing. Dropping a
//! sender (eviction) wakes the waiter, which reports a timeout.

use crate::config::MIN_SESSION_ID_LEN;
use crate::error::{Error, Result};
use crate::protocol::{Message, SessionId};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout};
use tracing::debug;

/// Produces a random token of the requested length.
pub type IdGenerator = Box<dyn Fn(usize) -> String + Send + Sync>;

/// Receiving half of a single-use response slot.
pub type ResponseSlot = oneshot::Receiver<Message>;

type ResponseSender = oneshot::Sender<Message>;

/// Draw `len` random alphanumeric characters.
#[must_use]
pub fn random_token(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Wait on a response slot until it fires or `limit` elapses.
///
/// A slot whose sender was dropped (its session was evicted) counts as a
/// timeout.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if no response was delivered in time.
pub async fn await_response(slot: ResponseSlot, limit: Duration) -> Result<Message> {
    match timeout(limit, slot).await {
        Ok(Ok(message)) => Ok(message),
        Ok(Err(_)) | Err(_) => Err(Error::Timeout(limit)),
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Address the session is bound to.
    pub remote_addr: SocketAddr,
    /// Last time the session saw traffic.
    pub last_activity: Instant,
    /// Sequence the next call will use.
    pub next_sequence: i64,
    /// Number of calls awaiting an acknowledgment.
    pub pending: usize,
}

struct Session {
    remote_addr: SocketAddr,
    last_activity: Instant,
    sequence: i64,
    pending: HashMap<i64, ResponseSender>,
}

impl Session {
    fn new(remote_addr: SocketAddr, now: Instant) -> Self {
        Self {
            remote_addr,
            last_activity: now,
            sequence: 0,
            pending: HashMap::new(),
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            remote_addr: self.remote_addr,
            last_activity: self.last_activity,
            next_sequence: self.sequence,
            pending: self.pending.len(),
        }
    }
}

#[derive(Default)]
struct TableState {
    sessions: HashMap<SessionId, Session>,
    /// Establishment waits keyed by the request's endpoint-wide sequence.
    establishing: HashMap<i64, ResponseSender>,
    next_establish: i64,
}

/// The set of active sessions.
pub struct SessionTable {
    state: Mutex<TableState>,
    id_len: usize,
    max_attempts: usize,
    generator: IdGenerator,
}

impl SessionTable {
    /// Create a table drawing `id_len` random characters per identifier.
    ///
    /// Lengths below [`MIN_SESSION_ID_LEN`] are raised to it.
    #[must_use]
    pub fn new(id_len: usize, max_attempts: usize) -> Self {
        Self::with_generator(
            id_len.max(MIN_SESSION_ID_LEN),
            max_attempts,
            Box::new(random_token),
        )
    }

    /// Create a table with a custom identifier source.
    #[must_use]
    pub fn with_generator(id_len: usize, max_attempts: usize, generator: IdGenerator) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            id_len,
            max_attempts: max_attempts.max(1),
            generator,
        }
    }

    /// Create a session bound to `remote_addr` under a fresh identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionIdExhausted`] if every drawn identifier
    /// collided with a live session.
    pub fn create(&self, remote_addr: SocketAddr, now: Instant) -> Result<SessionId> {
        let mut state = self.state.lock();

        for _ in 0..self.max_attempts {
            let id = SessionId::from((self.generator)(self.id_len));
            if id.is_empty() || state.sessions.contains_key(&id) {
                continue;
            }

            state
                .sessions
                .insert(id.clone(), Session::new(remote_addr, now));
            debug!(session = %id, %remote_addr, "Created session");
            return Ok(id);
        }

        Err(Error::SessionIdExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Resolve the session a message belongs to.
    ///
    /// An empty id creates a new session. A known id is touched and
    /// returned. An unknown id yields `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if a new identifier could not be generated.
    pub fn resolve_or_create(
        &self,
        session: &SessionId,
        remote_addr: SocketAddr,
        now: Instant,
    ) -> Result<Option<SessionId>> {
        if session.is_empty() {
            return self.create(remote_addr, now).map(Some);
        }

        Ok(self.touch(session, now).then(|| session.clone()))
    }

    /// Refresh a session's last-activity time. Returns `false` if unknown.
    pub fn touch(&self, session: &SessionId, now: Instant) -> bool {
        self.state.lock().sessions.get_mut(session).is_some_and(|s| {
            s.last_activity = now;
            true
        })
    }

    /// Snapshot a session.
    #[must_use]
    pub fn get(&self, session: &SessionId) -> Option<SessionInfo> {
        self.state.lock().sessions.get(session).map(Session::info)
    }

    /// Whether the session is in the table.
    #[must_use]
    pub fn contains(&self, session: &SessionId) -> bool {
        self.state.lock().sessions.contains_key(session)
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Whether the table holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Touch a session and return the address to send to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSession`] if the session is not in the table.
    pub fn route(&self, session: &SessionId, now: Instant) -> Result<SocketAddr> {
        let mut state = self.state.lock();
        let entry = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| Error::UnknownSession(session.clone()))?;
        entry.last_activity = now;
        Ok(entry.remote_addr)
    }

    /// Remove a session. Its pending calls are released as timeouts.
    pub fn evict(&self, session: &SessionId) -> bool {
        let removed = self.state.lock().sessions.remove(session);
        removed.is_some_and(|s| {
            debug!(%session, pending = s.pending.len(), "Evicted session");
            true
        })
    }

    /// Take the session's next sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSession`] if the session is not in the table.
    pub fn next_sequence(&self, session: &SessionId) -> Result<i64> {
        let mut state = self.state.lock();
        let entry = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| Error::UnknownSession(session.clone()))?;
        let sequence = entry.sequence;
        entry.sequence += 1;
        Ok(sequence)
    }

    /// Store a response slot for `(session, sequence)`.
    ///
    /// Must happen before the request is transmitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSession`] if the session is not in the table.
    pub fn register_wait(&self, session: &SessionId, sequence: i64) -> Result<ResponseSlot> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state
            .sessions
            .get_mut(session)
            .ok_or_else(|| Error::UnknownSession(session.clone()))?
            .pending
            .insert(sequence, tx);
        Ok(rx)
    }

    /// Deliver `message` to the call waiting on `(session, sequence)`.
    ///
    /// Returns `true` only if a live waiter received it. Unknown pairs and
    /// waiters that already gave up are ignored.
    pub fn resolve(&self, session: &SessionId, sequence: i64, message: Message) -> bool {
        let sender = self
            .state
            .lock()
            .sessions
            .get_mut(session)
            .and_then(|s| s.pending.remove(&sequence));

        sender.is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Drop the wait on `(session, sequence)` without delivering.
    pub fn abandon(&self, session: &SessionId, sequence: i64) {
        if let Some(entry) = self.state.lock().sessions.get_mut(session) {
            entry.pending.remove(&sequence);
        }
    }

    /// Number of calls awaiting an acknowledgment on a session.
    #[must_use]
    pub fn pending_calls(&self, session: &SessionId) -> Option<usize> {
        self.state
            .lock()
            .sessions
            .get(session)
            .map(|s| s.pending.len())
    }

    /// Take a sequence for a session-establishing request.
    pub fn next_establish_sequence(&self) -> i64 {
        let mut state = self.state.lock();
        let sequence = state.next_establish;
        state.next_establish += 1;
        sequence
    }

    /// Store a response slot for the establishing request with `sequence`.
    pub fn register_establish(&self, sequence: i64) -> ResponseSlot {
        let (tx, rx) = oneshot::channel();
        self.state.lock().establishing.insert(sequence, tx);
        rx
    }

    /// Drop an establishment wait without delivering.
    pub fn abandon_establish(&self, sequence: i64) {
        self.state.lock().establishing.remove(&sequence);
    }

    /// Adopt the session chosen by a peer that acknowledged our
    /// establishing request.
    ///
    /// The session is bound to `remote_addr`, the acknowledgment's source,
    /// which may differ from the address the request was sent to.
    /// Returns `false` if no establishment wait matches, in which case the
    /// table is left untouched.
    pub fn adopt(&self, remote_addr: SocketAddr, now: Instant, message: Message) -> bool {
        let sender = {
            let mut state = self.state.lock();
            let Some(sender) = state.establishing.remove(&message.sequence) else {
                return false;
            };
            state
                .sessions
                .entry(message.session.clone())
                .or_insert_with(|| Session::new(remote_addr, now))
                .last_activity = now;
            sender
        };

        debug!(session = %message.session, %remote_addr, "Adopted session");
        let _ = sender.send(message);
        true
    }

    /// Evict every session idle for at least `max_lifetime`.
    ///
    /// Returns the number of sessions removed.
    pub fn sweep(&self, now: Instant, max_lifetime: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, s| now.saturating_duration_since(s.last_activity) < max_lifetime);
        before - state.sessions.len()
    }
}
