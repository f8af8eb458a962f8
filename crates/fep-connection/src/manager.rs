//! The dual-channel FISC connection manager
//!
//! All outbound requests flow through the send socket under a write lock;
//! one reader task drains the receive socket and dispatches responses by
//! (STAN, terminal). A heartbeat task echoes MTI 0800/"301"; three
//! consecutive misses force a reconnect. Socket loss is handled per the
//! configured failure strategy, and auto-reconnect runs the retry policy
//! with exponential backoff and jitter.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use fep_codec::{Message, MessageAssembler, MessageParser, MessageSchema};
use fep_types::{ChannelMode, ConnectionConfig, FailureStrategy, FepError, Result};

use crate::framing;
use crate::pending::{CorrelationKey, PendingStore};
use crate::socket::{connect_socket, SocketRole};
use crate::state::ConnectionState;

/// Network-management information codes (field 70)
pub mod netmgmt {
    pub const SIGN_ON: &str = "001";
    pub const SIGN_OFF: &str = "002";
    pub const KEY_EXCHANGE: &str = "101";
    pub const ECHO_TEST: &str = "301";
}

const HEARTBEAT_MISS_LIMIT: u32 = 3;

#[derive(Debug)]
enum LinkEvent {
    Down {
        role: SocketRole,
        generation: u64,
        reason: String,
    },
    HeartbeatDead,
}

struct Inner {
    config: ConnectionConfig,
    schema: Arc<MessageSchema>,
    state_tx: watch::Sender<ConnectionState>,
    pending: PendingStore,
    /// Active writer: the send socket, or the surviving socket under
    /// FALLBACK_TO_SINGLE
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Unused halves kept for FALLBACK_TO_SINGLE
    spare_send_reader: StdMutex<Option<OwnedReadHalf>>,
    spare_receive_writer: StdMutex<Option<OwnedWriteHalf>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    /// Readers from a previous socket generation are ignored
    generation: AtomicU64,
    heartbeat_misses: AtomicU32,
    last_echo_rtt_ms: AtomicU64,
    stan_seq: AtomicU32,
    tasks_started: AtomicBool,
}

/// One logical FISC link
pub struct FiscConnection {
    inner: Arc<Inner>,
}

impl FiscConnection {
    pub fn new(config: ConnectionConfig, schema: Arc<MessageSchema>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                schema,
                state_tx,
                pending: PendingStore::new(),
                writer: Mutex::new(None),
                spare_send_reader: StdMutex::new(None),
                spare_receive_writer: StdMutex::new(None),
                events_tx,
                events_rx: StdMutex::new(Some(events_rx)),
                generation: AtomicU64::new(0),
                heartbeat_misses: AtomicU32::new(0),
                last_echo_rtt_ms: AtomicU64::new(0),
                stan_seq: AtomicU32::new(0),
                tasks_started: AtomicBool::new(false),
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch for state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Round-trip time of the last successful echo test
    pub fn last_echo_rtt_ms(&self) -> u64 {
        self.inner.last_echo_rtt_ms.load(Ordering::Relaxed)
    }

    /// Number of requests currently awaiting correlation
    pub fn inflight(&self) -> usize {
        self.inner.pending.len()
    }

    /// Establish both sockets (or the single socket), then sign on when
    /// configured. Spawns the reader, heartbeat and supervisor tasks.
    pub async fn connect(&self) -> Result<()> {
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        ) {
            return Err(FepError::connection(format!(
                "connect called in state {}",
                state
            )));
        }
        self.inner.set_state(ConnectionState::Connecting);
        if let Err(e) = Inner::establish(&self.inner).await {
            self.inner.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        if !self.inner.tasks_started.swap(true, Ordering::SeqCst) {
            let supervisor = Arc::clone(&self.inner);
            tokio::spawn(async move { Inner::run_supervisor(supervisor).await });
            let heartbeat = Arc::clone(&self.inner);
            tokio::spawn(async move { Inner::run_heartbeat(heartbeat).await });
        }

        if self.inner.config.auto_sign_on {
            self.sign_on().await?;
        }
        Ok(())
    }

    /// Exchange the MTI 0800 sign-on; SIGNED_ON on a "00" response
    pub async fn sign_on(&self) -> Result<()> {
        let request = self.inner.network_message(netmgmt::SIGN_ON)?;
        let deadline = Duration::from_millis(self.inner.config.send.read_timeout_ms);
        let response = self.send(&request, deadline).await?;
        match response.get_text(39) {
            Some("00") => {
                self.inner.set_state(ConnectionState::SignedOn);
                info!(institution = %self.inner.config.institution_id, "signed on");
                Ok(())
            }
            other => Err(FepError::connection(format!(
                "sign-on declined with {:?}",
                other
            ))),
        }
    }

    /// MTI 0800 echo test; returns the round-trip time
    pub async fn echo_test(&self) -> Result<u64> {
        let request = self.inner.network_message(netmgmt::ECHO_TEST)?;
        let deadline = Duration::from_millis(self.inner.config.send.read_timeout_ms);
        let started = Instant::now();
        let response = self.send(&request, deadline).await?;
        if response.get_text(39) != Some("00") {
            return Err(FepError::connection("echo test declined"));
        }
        let rtt = started.elapsed().as_millis() as u64;
        self.inner.last_echo_rtt_ms.store(rtt, Ordering::Relaxed);
        Ok(rtt)
    }

    /// MTI 0800 key exchange; the response carries the new key material
    /// under the zone master
    pub async fn key_exchange(&self) -> Result<Message> {
        let request = self.inner.network_message(netmgmt::KEY_EXCHANGE)?;
        let deadline = Duration::from_millis(self.inner.config.send.read_timeout_ms);
        self.send(&request, deadline).await
    }

    /// Serialize, register the pending entry, write to the send socket and
    /// park until the correlated response, the deadline, or link failure.
    pub async fn send(&self, message: &Message, deadline: Duration) -> Result<Message> {
        let started = Instant::now();
        self.wait_send_ready(deadline).await?;

        let key = self.inner.correlation_key_of(message).ok_or_else(|| {
            FepError::system("outbound message without STAN (field 11)")
        })?;
        let receiver = self.inner.pending.register(key.clone())?;

        let bytes = MessageAssembler::new(&self.inner.schema).assemble(message)?;
        if let Err(e) = self.inner.write_bytes(&bytes).await {
            self.inner.pending.cancel(&key);
            return Err(e);
        }
        debug!(stan = %key.0, terminal = %key.1, bytes = bytes.len(), "request dispatched");

        let remaining = deadline.saturating_sub(started.elapsed());
        match timeout(remaining, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FepError::connection("link reset while waiting")),
            Err(_) => {
                self.inner.pending.cancel(&key);
                Err(FepError::Timeout {
                    after_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    /// Wait until the state machine accepts sends, bounded by the deadline
    async fn wait_send_ready(&self, deadline: Duration) -> Result<()> {
        let mode = self.inner.config.mode;
        let strategy = self.inner.config.failure_strategy;
        let mut rx = self.inner.state_tx.subscribe();
        let wait = rx.wait_for(|state| state.accepts_sends(mode, strategy) || state.is_terminal());
        let result = match timeout(deadline, wait).await {
            Ok(Ok(state)) if state.accepts_sends(mode, strategy) => Ok(()),
            Ok(Ok(state)) => Err(FepError::connection(format!("link {}", *state))),
            Ok(Err(_)) => Err(FepError::connection("connection dropped")),
            Err(_) => Err(FepError::Timeout {
                after_ms: deadline.as_millis() as u64,
            }),
        };
        result
    }

    /// Graceful close: stop accepting sends, wait for inflight completions
    /// up to the grace period, sign off best-effort, release the sockets.
    pub async fn close(&self) -> Result<()> {
        let was_signed_on = self.state().is_signed_on();
        self.inner.set_state(ConnectionState::Closing);

        let grace = Duration::from_millis(self.inner.config.graceful_shutdown_timeout_ms);
        let drain_deadline = Instant::now() + grace;
        while !self.inner.pending.is_empty() && Instant::now() < drain_deadline {
            sleep(Duration::from_millis(50)).await;
        }
        if !self.inner.pending.is_empty() {
            warn!(inflight = self.inner.pending.len(), "grace period expired");
            self.inner.pending.fail_all("ND");
        }

        if was_signed_on {
            if let Ok(sign_off) = self.inner.network_message(netmgmt::SIGN_OFF) {
                if let Ok(bytes) = MessageAssembler::new(&self.inner.schema).assemble(&sign_off) {
                    let _ = self.inner.write_bytes(&bytes).await;
                }
            }
        }

        *self.inner.writer.lock().await = None;
        *self.inner.spare_send_reader.lock().expect("poisoned") = None;
        *self.inner.spare_receive_writer.lock().expect("poisoned") = None;
        // Invalidate any reader still parked on a socket
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Closed);
        info!("connection closed");
        Ok(())
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "connection state");
            *current = state;
            true
        });
    }

    fn next_stan(&self) -> String {
        let seq = self.stan_seq.fetch_add(1, Ordering::Relaxed) % 999_999 + 1;
        format!("{:06}", seq)
    }

    /// Terminal id carried in network-management traffic
    fn network_terminal(&self) -> String {
        format!("{:<8.8}", self.config.institution_id)
    }

    /// Build an MTI 0800 message with the given network-info code
    fn network_message(&self, code: &str) -> Result<Message> {
        let mut message = Message::new("0800").map_err(FepError::from)?;
        message.set(7, Utc::now().format("%m%d%H%M%S").to_string())?;
        message.set(11, self.next_stan())?;
        message.set(41, self.network_terminal())?;
        message.set(70, code)?;
        Ok(message)
    }

    fn correlation_key_of(&self, message: &Message) -> Option<CorrelationKey> {
        let stan = message.get_text(11)?.to_string();
        let terminal = message
            .get_text(41)
            .map(|t| t.to_string())
            .unwrap_or_else(|| self.network_terminal());
        Some((stan, terminal))
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| FepError::connection("send socket unavailable"))?;
        match framing::write_frame(writer, bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *guard = None;
                drop(guard);
                let _ = self.events_tx.send(LinkEvent::Down {
                    role: SocketRole::Send,
                    generation: self.generation.load(Ordering::SeqCst),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Connect the socket(s) for the configured mode and install the
    /// halves. Leaves the link in BOTH_CONNECTED.
    async fn establish(inner: &Arc<Self>) -> Result<()> {
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match inner.config.mode {
            ChannelMode::Single => {
                let stream = connect_socket(SocketRole::Send, &inner.config.send).await?;
                let (read_half, write_half) = stream.into_split();
                *inner.writer.lock().await = Some(write_half);
                Self::spawn_reader(inner, read_half, generation, SocketRole::Send);
            }
            ChannelMode::Dual => {
                let send = connect_socket(SocketRole::Send, &inner.config.send).await?;
                inner.set_state(ConnectionState::SendOnlyConnected);
                let receive =
                    connect_socket(SocketRole::Receive, &inner.config.receive).await?;

                let (send_read, send_write) = send.into_split();
                let (receive_read, receive_write) = receive.into_split();
                *inner.writer.lock().await = Some(send_write);
                *inner.spare_send_reader.lock().expect("poisoned") = Some(send_read);
                *inner.spare_receive_writer.lock().expect("poisoned") = Some(receive_write);
                Self::spawn_reader(inner, receive_read, generation, SocketRole::Receive);
            }
        }
        inner.set_state(ConnectionState::BothConnected);
        Ok(())
    }

    fn spawn_reader(
        inner: &Arc<Self>,
        read_half: OwnedReadHalf,
        generation: u64,
        role: SocketRole,
    ) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            Self::run_reader(inner, read_half, generation, role).await;
        });
    }

    /// Drain one socket, dispatching correlated responses until the socket
    /// fails or the generation is superseded
    async fn run_reader(
        inner: Arc<Self>,
        mut read_half: OwnedReadHalf,
        generation: u64,
        role: SocketRole,
    ) {
        loop {
            match framing::read_frame(&mut read_half).await {
                Ok(frame) => {
                    if inner.generation.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    let parsed = MessageParser::new(&inner.schema).parse(&frame);
                    match parsed {
                        Ok(message) => match inner.correlation_key_of(&message) {
                            Some(key) => {
                                if !inner.pending.complete(&key, message) {
                                    warn!(
                                        stan = %key.0,
                                        terminal = %key.1,
                                        "uncorrelated response dropped"
                                    );
                                }
                            }
                            None => warn!("response without STAN dropped"),
                        },
                        Err(e) => warn!(error = %e, "undecodable frame dropped"),
                    }
                }
                Err(e) => {
                    if inner.generation.load(Ordering::SeqCst) == generation {
                        let _ = inner.events_tx.send(LinkEvent::Down {
                            role,
                            generation,
                            reason: e.to_string(),
                        });
                    }
                    return;
                }
            }
        }
    }

    /// Periodic MTI 0800/"301" on the send socket. Three consecutive
    /// misses report the link dead.
    async fn run_heartbeat(inner: Arc<Self>) {
        let interval = Duration::from_millis(inner.config.heartbeat_interval_ms);
        let echo_deadline = Duration::from_millis(inner.config.send.read_timeout_ms);
        loop {
            sleep(interval).await;
            let state = *inner.state_tx.borrow();
            if !state.is_signed_on() {
                continue;
            }
            let request = match inner.network_message(netmgmt::ECHO_TEST) {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, "echo build failed");
                    continue;
                }
            };
            let started = Instant::now();
            let outcome = Self::send_on(&inner, &request, echo_deadline).await;
            match outcome {
                Ok(response) if response.get_text(39) == Some("00") => {
                    inner.heartbeat_misses.store(0, Ordering::Relaxed);
                    inner
                        .last_echo_rtt_ms
                        .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                }
                _ => {
                    let misses = inner.heartbeat_misses.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(misses, "heartbeat missed");
                    if misses >= HEARTBEAT_MISS_LIMIT {
                        inner.heartbeat_misses.store(0, Ordering::Relaxed);
                        let _ = inner.events_tx.send(LinkEvent::HeartbeatDead);
                    }
                }
            }
        }
    }

    /// Internal send without the public state gate, used by the heartbeat
    async fn send_on(inner: &Arc<Self>, message: &Message, deadline: Duration) -> Result<Message> {
        let key = inner
            .correlation_key_of(message)
            .ok_or_else(|| FepError::system("message without STAN"))?;
        let receiver = inner.pending.register(key.clone())?;
        let bytes = MessageAssembler::new(&inner.schema).assemble(message)?;
        if let Err(e) = inner.write_bytes(&bytes).await {
            inner.pending.cancel(&key);
            return Err(e);
        }
        match timeout(deadline, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FepError::connection("link reset while waiting")),
            Err(_) => {
                inner.pending.cancel(&key);
                Err(FepError::Timeout {
                    after_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    /// Apply the failure strategy to socket-loss and heartbeat events
    async fn run_supervisor(inner: Arc<Self>) {
        let mut events = inner
            .events_rx
            .lock()
            .expect("poisoned")
            .take()
            .expect("supervisor started twice");
        while let Some(event) = events.recv().await {
            let state = *inner.state_tx.borrow();
            if state.is_terminal() || state == ConnectionState::Closing {
                continue;
            }
            match event {
                LinkEvent::Down {
                    role,
                    generation,
                    reason,
                } => {
                    if generation != inner.generation.load(Ordering::SeqCst) {
                        continue; // stale socket
                    }
                    warn!(%role, %reason, "socket down");
                    Self::handle_socket_down(&inner, role).await;
                }
                LinkEvent::HeartbeatDead => {
                    warn!("heartbeat limit reached, reconnecting");
                    inner.pending.fail_all("ND");
                    Self::full_reconnect(&inner).await;
                }
            }
        }
    }

    async fn handle_socket_down(inner: &Arc<Self>, role: SocketRole) {
        if inner.config.mode == ChannelMode::Single {
            inner.pending.fail_all("ND");
            Self::full_reconnect(inner).await;
            return;
        }
        match inner.config.failure_strategy {
            FailureStrategy::FailWhenAnyDown => {
                inner.pending.fail_all("ND");
                Self::full_reconnect(inner).await;
            }
            FailureStrategy::FailWhenBothDown => {
                let degraded = match role {
                    SocketRole::Receive => ConnectionState::SendOnlyConnected,
                    SocketRole::Send => ConnectionState::ReceiveOnlyConnected,
                };
                inner.set_state(degraded);
                if !Self::reconnect_one(inner, role).await {
                    inner.pending.fail_all("ND");
                    Self::full_reconnect(inner).await;
                } else {
                    inner.set_state(ConnectionState::SignedOn);
                }
            }
            FailureStrategy::FallbackToSingle => {
                warn!(%role, "falling back to single-socket operation (non-standard)");
                match role {
                    SocketRole::Receive => {
                        // Drain responses from the send socket while the
                        // receive socket reconnects
                        let spare = inner.spare_send_reader.lock().expect("poisoned").take();
                        if let Some(read_half) = spare {
                            let generation = inner.generation.load(Ordering::SeqCst);
                            Self::spawn_reader(inner, read_half, generation, SocketRole::Send);
                        }
                    }
                    SocketRole::Send => {
                        // Write through the receive socket
                        let spare = inner.spare_receive_writer.lock().expect("poisoned").take();
                        if let Some(write_half) = spare {
                            *inner.writer.lock().await = Some(write_half);
                        }
                    }
                }
                if !Self::reconnect_one(inner, role).await {
                    inner.pending.fail_all("ND");
                    Self::full_reconnect(inner).await;
                }
            }
        }
    }

    /// Re-establish a single socket of the dual link under the retry
    /// policy. Returns false when exhausted.
    async fn reconnect_one(inner: &Arc<Self>, role: SocketRole) -> bool {
        let retry = &inner.config.retry;
        for attempt in 1..=retry.max_attempts {
            sleep(jittered(retry.delay_for_attempt(attempt), retry.jitter_factor)).await;
            let socket_config = match role {
                SocketRole::Send => &inner.config.send,
                SocketRole::Receive => &inner.config.receive,
            };
            match connect_socket(role, socket_config).await {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    let generation = inner.generation.load(Ordering::SeqCst);
                    match role {
                        SocketRole::Send => {
                            *inner.writer.lock().await = Some(write_half);
                            *inner.spare_send_reader.lock().expect("poisoned") =
                                Some(read_half);
                        }
                        SocketRole::Receive => {
                            *inner.spare_receive_writer.lock().expect("poisoned") =
                                Some(write_half);
                            Self::spawn_reader(inner, read_half, generation, SocketRole::Receive);
                        }
                    }
                    info!(%role, attempt, "socket restored");
                    return true;
                }
                Err(e) => warn!(%role, attempt, error = %e, "socket reconnect failed"),
            }
        }
        false
    }

    /// Tear down and re-establish the whole link under the retry policy
    async fn full_reconnect(inner: &Arc<Self>) {
        if !inner.config.auto_reconnect {
            inner.set_state(ConnectionState::Failed);
            return;
        }
        inner.set_state(ConnectionState::Reconnecting);
        *inner.writer.lock().await = None;
        *inner.spare_send_reader.lock().expect("poisoned") = None;
        *inner.spare_receive_writer.lock().expect("poisoned") = None;

        let retry = inner.config.retry.clone();
        for attempt in 1..=retry.max_attempts {
            sleep(jittered(retry.delay_for_attempt(attempt), retry.jitter_factor)).await;
            match Self::establish(inner).await {
                Ok(()) => {
                    if inner.config.auto_sign_on {
                        match Self::sign_on_internal(inner).await {
                            Ok(()) => {
                                info!(attempt, "link re-established");
                                return;
                            }
                            Err(e) => {
                                warn!(attempt, error = %e, "re-sign-on failed");
                                continue;
                            }
                        }
                    }
                    info!(attempt, "link re-established (sign-on pending)");
                    return;
                }
                Err(e) => {
                    inner.set_state(ConnectionState::Reconnecting);
                    warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        error!("retry policy exhausted");
        inner.pending.fail_all("ND");
        inner.set_state(ConnectionState::Failed);
    }

    async fn sign_on_internal(inner: &Arc<Self>) -> Result<()> {
        let request = inner.network_message(netmgmt::SIGN_ON)?;
        let deadline = Duration::from_millis(inner.config.send.read_timeout_ms);
        let response = Self::send_on(inner, &request, deadline).await?;
        match response.get_text(39) {
            Some("00") => {
                inner.set_state(ConnectionState::SignedOn);
                Ok(())
            }
            other => Err(FepError::connection(format!(
                "sign-on declined with {:?}",
                other
            ))),
        }
    }
}

/// Apply ±jitter to a delay
fn jittered(delay_ms: u64, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return Duration::from_millis(delay_ms);
    }
    let spread = delay_ms as f64 * jitter_factor;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((delay_ms as f64 + offset).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fep_codec::registry::fisc_schema;
    use fep_types::{EndpointConfig, RetryConfig, SocketConfig};
    use tokio::net::TcpListener;

    /// Build the upstream's answer to one decoded request
    fn respond_to(request: &Message) -> Option<Message> {
        let mti = request.mti();
        let response_mti = match mti {
            "0100" => "0110",
            "0200" => "0210",
            "0400" => "0410",
            "0800" => "0810",
            _ => return None,
        };
        let mut response = Message::new(response_mti).unwrap();
        for field in [2u16, 3, 4, 11, 37, 41, 70] {
            if let Some(value) = request.get_text(field) {
                response.set(field, value.to_string()).unwrap();
            }
        }
        response.set(39, "00").unwrap();
        if mti == "0200" {
            response.set(38, "A00001").unwrap();
        }
        Some(response)
    }

    /// Dual-channel mock switch: first accepted socket is SEND (requests
    /// in), second is RECEIVE (responses out). `silent_mtis` lists request
    /// MTIs to swallow without answering.
    async fn mock_dual_upstream(silent_mtis: &'static [&'static str]) -> EndpointConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut send_conn, _) = listener.accept().await.unwrap();
            let (mut receive_conn, _) = listener.accept().await.unwrap();
            let schema = fisc_schema();
            loop {
                let frame = match framing::read_frame(&mut send_conn).await {
                    Ok(f) => f,
                    Err(_) => return,
                };
                let request = MessageParser::new(&schema).parse(&frame).unwrap();
                if silent_mtis.contains(&request.mti()) {
                    continue;
                }
                if let Some(response) = respond_to(&request) {
                    let bytes = MessageAssembler::new(&schema).assemble(&response).unwrap();
                    if framing::write_frame(&mut receive_conn, &bytes).await.is_err() {
                        return;
                    }
                }
            }
        });
        EndpointConfig::new("127.0.0.1", port)
    }

    /// Single-socket mock switch answering on the same connection
    async fn mock_single_upstream() -> EndpointConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = conn.into_split();
            let schema = fisc_schema();
            loop {
                let frame = match framing::read_frame(&mut read_half).await {
                    Ok(f) => f,
                    Err(_) => return,
                };
                let request = MessageParser::new(&schema).parse(&frame).unwrap();
                if let Some(response) = respond_to(&request) {
                    let bytes = MessageAssembler::new(&schema).assemble(&response).unwrap();
                    if framing::write_frame(&mut write_half, &bytes).await.is_err() {
                        return;
                    }
                }
            }
        });
        EndpointConfig::new("127.0.0.1", port)
    }

    fn dual_config(endpoint: EndpointConfig) -> ConnectionConfig {
        let mut config = ConnectionConfig::dual(
            "8220000",
            SocketConfig::for_endpoint(endpoint.clone()),
            SocketConfig::for_endpoint(endpoint),
        );
        config.heartbeat_interval_ms = 60_000;
        config.retry = RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };
        config
    }

    fn financial_request(stan: &str) -> Message {
        let mut message = Message::new("0200").unwrap();
        message.set(2, "4111111111111111").unwrap();
        message.set(3, "012000").unwrap();
        message.set(4, "000000100000").unwrap();
        message.set(11, stan).unwrap();
        message.set(37, "000000000001").unwrap();
        message.set(41, "ATM00001").unwrap();
        message
    }

    #[tokio::test]
    async fn dual_channel_sign_on_and_financial_round_trip() {
        let endpoint = mock_dual_upstream(&[]).await;
        let connection = FiscConnection::new(dual_config(endpoint), Arc::new(fisc_schema()));
        connection.connect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::SignedOn);

        let response = connection
            .send(&financial_request("000001"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.mti(), "0210");
        assert_eq!(response.get_text(39), Some("00"));
        assert_eq!(response.get_text(38), Some("A00001"));
        assert_eq!(connection.inflight(), 0);
        connection.close().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn single_channel_round_trip() {
        let endpoint = mock_single_upstream().await;
        let mut config =
            ConnectionConfig::single("8220000", SocketConfig::for_endpoint(endpoint));
        config.heartbeat_interval_ms = 60_000;
        let connection = FiscConnection::new(config, Arc::new(fisc_schema()));
        connection.connect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::SignedOn);

        let response = connection
            .send(&financial_request("000002"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.get_text(39), Some("00"));
    }

    #[tokio::test]
    async fn silent_upstream_times_out_and_clears_pending() {
        let endpoint = mock_dual_upstream(&["0200"]).await;
        let connection = FiscConnection::new(dual_config(endpoint), Arc::new(fisc_schema()));
        connection.connect().await.unwrap();

        let err = connection
            .send(&financial_request("000003"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, FepError::Timeout { .. }));
        assert_eq!(connection.inflight(), 0);
    }

    #[tokio::test]
    async fn duplicate_stan_rejected_while_inflight() {
        let endpoint = mock_dual_upstream(&["0200"]).await;
        let connection =
            Arc::new(FiscConnection::new(dual_config(endpoint), Arc::new(fisc_schema())));
        connection.connect().await.unwrap();

        let first = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .send(&financial_request("000004"), Duration::from_millis(500))
                    .await
            })
        };
        // Give the first dispatch time to register its key
        sleep(Duration::from_millis(50)).await;
        let second = connection
            .send(&financial_request("000004"), Duration::from_millis(200))
            .await;
        assert!(second.is_err());
        assert!(matches!(first.await.unwrap(), Err(FepError::Timeout { .. })));
    }

    #[tokio::test]
    async fn echo_test_records_rtt() {
        let endpoint = mock_dual_upstream(&[]).await;
        let connection = FiscConnection::new(dual_config(endpoint), Arc::new(fisc_schema()));
        connection.connect().await.unwrap();
        let rtt = connection.echo_test().await.unwrap();
        assert_eq!(connection.last_echo_rtt_ms(), rtt);
    }

    #[tokio::test]
    async fn connect_refused_when_upstream_absent() {
        let mut config = dual_config(EndpointConfig::new("127.0.0.1", 1));
        config.send.connect_timeout_ms = 300;
        config.receive.connect_timeout_ms = 300;
        let connection = FiscConnection::new(config, Arc::new(fisc_schema()));
        assert!(connection.connect().await.is_err());
    }
}
