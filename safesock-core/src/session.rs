//! Session orchestration: roles and lifecycle, the blocking send
//! protocol, the heartbeat cycle, and the exactly-once breakdown path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};

use crate::filter::{DefaultFilter, Filter};
use crate::integrity;
use crate::observer::{BreakdownObserver, MessageObserver, ObserverDispatch};
use crate::protocol;
use crate::reader::{FrameReader, LineSink};
use crate::timer::DeadlineTimer;

/// Which end of the connection a session is.
///
/// The acceptor drives the heartbeat cycle and expects heartbeat acks;
/// the initiator echoes heartbeats and watches for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Acceptor,
    Initiator,
}

/// Construction parameters for a session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Time between two consecutive heartbeats.
    pub period: Duration,
    /// Maximum wait from emitting a frame or heartbeat until its ack,
    /// before the connection is considered dead. Also bounds the
    /// initiator's connect attempt. Usually chosen below `period`;
    /// larger values merely allow several heartbeats in flight at once.
    pub timeout: Duration,
    /// Notified for every payload message the peer delivers.
    pub message_observers: Vec<Arc<dyn MessageObserver>>,
    /// Notified exactly once when the session dies.
    pub breakdown_observers: Vec<Arc<dyn BreakdownObserver>>,
    /// Applied to every inbound line before classification.
    pub inbound_filter: Arc<dyn Filter>,
    /// Applied to every outbound line before transmission.
    pub outbound_filter: Arc<dyn Filter>,
}

impl SessionOptions {
    /// Options with the given heartbeat period and ack timeout, no
    /// observers, and identity filters.
    pub fn new(period: Duration, timeout: Duration) -> Self {
        Self {
            period,
            timeout,
            message_observers: Vec::new(),
            breakdown_observers: Vec::new(),
            inbound_filter: Arc::new(DefaultFilter),
            outbound_filter: Arc::new(DefaultFilter),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(3))
    }
}

/// Failure to establish a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection attempt timed out")]
    ConnectTimeout,
}

/// Misuse detected while sending. Ordinary network failure never shows
/// up here; it surfaces as `Ok(false)` plus the breakdown observers.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("sending of empty or blank messages is not allowed")]
    BlankMessage,
    #[error("message line collides with a reserved protocol prefix: {0}")]
    ReservedPrefix(String),
}

/// Reliable, failure-detecting messaging session over one TCP
/// connection.
///
/// [`Session::send`] blocks its caller until the peer acknowledged the
/// message or a deadline declared the connection dead, so a sender
/// always learns whether a message certainly arrived. Heartbeats detect
/// a silently broken transport even when no application traffic flows.
pub struct Session {
    role: Role,
    period: Duration,
    timeout: Duration,
    peer_addr: SocketAddr,
    alive: AtomicBool,
    state: Mutex<SessionState>,
    dispatch: ObserverDispatch,
    shutdown: watch::Sender<bool>,
    weak_self: Weak<Session>,
}

/// Mutable session state. Every mutation happens under the one lock;
/// the alive flag only transitions inside that critical section.
struct SessionState {
    /// Per-send counter disambiguating identical payload content.
    salt: u64,
    /// Pending obligations: correlation id to its live deadline timer.
    deadlines: HashMap<String, DeadlineTimer>,
    /// Blocked senders: correlation id to the waiter resolved on ack.
    waiters: HashMap<String, oneshot::Sender<()>>,
    /// Frame channel into the writer task; taken on teardown so the
    /// writer drains and closes the transport.
    outbound: Option<mpsc::UnboundedSender<Vec<String>>>,
}

impl Session {
    /// Wait for one inbound connection on `listener` and run a session
    /// over it. This end becomes the acceptor and drives the heartbeat
    /// cycle.
    pub async fn accept(
        listener: &TcpListener,
        options: SessionOptions,
    ) -> Result<Arc<Self>, SessionError> {
        let (stream, peer_addr) = listener.accept().await?;
        Ok(Self::establish(stream, peer_addr, Role::Acceptor, options))
    }

    /// Connect to an accepting peer, bounded by the options' timeout.
    /// This end becomes the initiator: it echoes heartbeats and watches
    /// for the next one.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        options: SessionOptions,
    ) -> Result<Arc<Self>, SessionError> {
        let stream = tokio::time::timeout(options.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::ConnectTimeout)??;
        let peer_addr = stream.peer_addr()?;
        Ok(Self::establish(stream, peer_addr, Role::Initiator, options))
    }

    fn establish(
        stream: TcpStream,
        peer_addr: SocketAddr,
        role: Role,
        options: SessionOptions,
    ) -> Arc<Self> {
        let SessionOptions {
            period,
            timeout,
            message_observers,
            breakdown_observers,
            inbound_filter,
            outbound_filter,
        } = options;
        let (read_half, write_half) = stream.into_split();
        let (outbound, frames) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatch = ObserverDispatch::spawn(message_observers, breakdown_observers);

        let session = Arc::new_cyclic(|weak_self: &Weak<Session>| Session {
            role,
            period,
            timeout,
            peer_addr,
            alive: AtomicBool::new(true),
            state: Mutex::new(SessionState {
                salt: 0,
                deadlines: HashMap::new(),
                waiters: HashMap::new(),
                outbound: Some(outbound),
            }),
            dispatch,
            shutdown,
            weak_self: weak_self.clone(),
        });

        if role == Role::Initiator {
            // Expect the acceptor's first beat within 1.5 periods. Armed
            // before the reader starts, so an early beat cannot arrive
            // ahead of its own liveness timer.
            let mut state = session.lock();
            session.arm_deadline(
                &mut state,
                protocol::heartbeat_line(0),
                period.mul_f64(1.5),
            );
        }

        tokio::spawn(write_loop(
            write_half,
            frames,
            outbound_filter,
            session.weak_self.clone(),
        ));
        tokio::spawn(
            FrameReader::new(
                read_half,
                inbound_filter,
                session.weak_self.clone(),
                shutdown_rx,
            )
            .run(),
        );
        if role == Role::Acceptor {
            tokio::spawn(heartbeat_loop(session.weak_self.clone(), period, timeout));
        }

        tracing::info!(?role, %peer_addr, "session established");
        session
    }

    /// Send a message and learn whether it certainly reached the peer.
    ///
    /// Blocks the calling task until the matching ack arrives or a
    /// deadline declares the connection dead. `Ok(false)` means no proof
    /// of delivery: the session was (or just became) dead. The message
    /// may still have arrived if only the ack was lost. On a dead
    /// session the call returns immediately.
    ///
    /// This blocking is the backpressure mechanism of the protocol; do
    /// not sidestep it by firing sends from contexts that must stay
    /// responsive.
    pub async fn send(&self, message: &str) -> Result<bool, SendError> {
        if !self.is_alive() {
            return Ok(false);
        }
        if message.trim().is_empty() {
            return Err(SendError::BlankMessage);
        }
        for line in message.split('\n') {
            if protocol::is_reserved(line) {
                // Injection of internal vocabulary. The decision to shut
                // down is local, so the peer sees a friendly close.
                self.close();
                return Err(SendError::ReservedPrefix(line.to_owned()));
            }
        }

        let waiter = {
            let mut state = self.lock();
            if !self.is_alive() {
                return Ok(false);
            }
            state.salt += 1;
            let delimiter = protocol::delimiter_line(state.salt);
            let wrapped = format!("{message}\n{delimiter}");
            let ack_id = protocol::message_ack_line(&integrity::fingerprint(&wrapped));

            let (resolve, waiter) = oneshot::channel();
            state.waiters.insert(ack_id.clone(), resolve);
            self.arm_deadline(&mut state, ack_id, self.timeout);

            let mut frame: Vec<String> = message.split('\n').map(str::to_owned).collect();
            frame.push(delimiter);
            Self::enqueue(&state, frame);
            waiter
        };

        // Resolved by the ack handler or by teardown, whichever wins.
        let _ = waiter.await;
        Ok(self.is_alive())
    }

    /// Friendly local close: announce the disconnect to the peer, then
    /// tear down. Calling this on a dead session is a no-op.
    pub fn close(&self) {
        if !self.is_alive() {
            return;
        }
        {
            let state = self.lock();
            Self::enqueue(&state, vec![protocol::DISCONNECT.to_owned()]);
        }
        self.disconnect(true);
    }

    /// Whether the connection is still alive. Register a breakdown
    /// observer to learn about the transition synchronously.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Whether the peer sits on the loopback interface. Useful to detect
    /// dummy local connections.
    pub fn is_loopback(&self) -> bool {
        self.peer_addr.ip().is_loopback()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(state: &SessionState, frame: Vec<String>) {
        if let Some(outbound) = &state.outbound {
            let _ = outbound.send(frame);
        }
    }

    /// Arm the deadline for one obligation. The callback path is the
    /// unintended teardown. Replacing an id defuses the stale timer so
    /// it can never fire for an already-superseded obligation.
    fn arm_deadline(&self, state: &mut SessionState, id: String, duration: Duration) {
        let session = self.weak_self.clone();
        let timer = DeadlineTimer::arm(duration, id.clone(), move |_label| {
            if let Some(session) = session.upgrade() {
                session.disconnect(false);
            }
        });
        if let Some(stale) = state.deadlines.insert(id, timer) {
            stale.defuse();
        }
    }

    /// One-way alive-to-dead transition. The first trigger past the
    /// alive check wins: its `intended` flag reaches the breakdown
    /// observers, and every later trigger is a no-op. Unblocks all
    /// pending senders, which then observe the dead session.
    fn disconnect(&self, intended: bool) {
        let (deadlines, waiters) = {
            let mut state = self.lock();
            if !self.alive.swap(false, Ordering::AcqRel) {
                return;
            }
            // Dropping the sender lets the writer drain queued frames
            // (including a just-enqueued disconnect line) and then close
            // the transport; the watch unblocks the reader.
            state.outbound.take();
            let _ = self.shutdown.send(true);
            (
                std::mem::take(&mut state.deadlines),
                std::mem::take(&mut state.waiters),
            )
        };
        for timer in deadlines.into_values() {
            timer.defuse();
        }
        for waiter in waiters.into_values() {
            let _ = waiter.send(());
        }
        tracing::info!(intended, "session torn down");
        self.dispatch.notify_breakdown(intended);
    }
}

impl LineSink for Session {
    fn handle_internal_line(&self, line: &str) {
        if !self.is_alive() {
            return;
        }
        if line.starts_with(protocol::MESSAGE_ACK) || line.starts_with(protocol::HEART_BEAT_ACK) {
            let mut state = self.lock();
            match state.deadlines.remove(line) {
                Some(timer) => timer.defuse(),
                // An ack nobody waits for is a protocol defect.
                None => tracing::error!(line = %line, "ack without a pending obligation"),
            }
            if line.starts_with(protocol::MESSAGE_ACK) {
                if let Some(waiter) = state.waiters.remove(line) {
                    let _ = waiter.send(());
                }
            }
        } else if let Some(seq) = protocol::parse_heartbeat(line) {
            let mut state = self.lock();
            Self::enqueue(&state, vec![protocol::heartbeat_ack_line(seq)]);
            match self.role {
                Role::Initiator => {
                    if let Some(timer) = state.deadlines.remove(line) {
                        timer.defuse();
                    } else {
                        tracing::warn!(seq, "heartbeat outside the expected sequence");
                    }
                    // The liveness detector: the next beat must arrive
                    // within 1.5 periods.
                    self.arm_deadline(
                        &mut state,
                        protocol::heartbeat_line(seq + 1),
                        self.period.mul_f64(1.5),
                    );
                }
                Role::Acceptor => {
                    tracing::warn!(seq, "acceptor received a heartbeat");
                }
            }
        } else {
            tracing::error!(line = %line, "unrecognized internal line");
        }
    }

    fn handle_user_message(&self, payload: String, salt: u64) {
        // Ack the frame under the same fingerprint the sender computed.
        let wrapped = format!("{payload}\n{}", protocol::delimiter_line(salt));
        let ack = protocol::message_ack_line(&integrity::fingerprint(&wrapped));
        self.dispatch.notify_message(payload);
        let state = self.lock();
        Self::enqueue(&state, vec![ack]);
    }

    fn teardown(&self, intended: bool) {
        self.disconnect(intended);
    }
}

/// Owns the write half. Frames arrive whole and leave whole, so
/// concurrent senders never interleave lines on the wire.
async fn write_loop(
    mut transport: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<String>>,
    outbound: Arc<dyn Filter>,
    session: Weak<Session>,
) {
    while let Some(frame) = frames.recv().await {
        for line in frame {
            let line = outbound.filter(&line);
            if line == protocol::MESSAGE_DISCARDED {
                continue;
            }
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            if let Err(error) = transport.write_all(&bytes).await {
                tracing::debug!(%error, "transport write failed");
                if let Some(session) = session.upgrade() {
                    session.disconnect(false);
                }
                return;
            }
        }
        if let Err(error) = transport.flush().await {
            tracing::debug!(%error, "transport flush failed");
            if let Some(session) = session.upgrade() {
                session.disconnect(false);
            }
            return;
        }
    }
    // Channel closed during teardown; announce end of stream to the peer.
    if let Err(error) = transport.shutdown().await {
        tracing::debug!(%error, "transport close failed");
    }
}

/// Acceptor-side heartbeat cycle: arm the ack deadline, emit the beat,
/// sleep one period, repeat while the session lives.
async fn heartbeat_loop(session: Weak<Session>, period: Duration, timeout: Duration) {
    let mut seq: u64 = 0;
    loop {
        let Some(session) = session.upgrade() else {
            return;
        };
        {
            let mut state = session.lock();
            if !session.is_alive() {
                return;
            }
            session.arm_deadline(&mut state, protocol::heartbeat_ack_line(seq), timeout);
            Session::enqueue(&state, vec![protocol::heartbeat_line(seq)]);
        }
        drop(session);
        tokio::time::sleep(period).await;
        seq += 1;
    }
}
