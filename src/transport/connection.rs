//! Connection Manager: lifecycle of the duplex link.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──Opened──▶ Connected
//!      ▲                          │                      │
//!      └──── Failed ──────────────┘                      │
//!      └──── Closed (server close / I/O error) ──────────┘
//!
//! on Failed/Closed: schedule ONE reconnect after the policy delay
//! close(): terminal Disconnected, timer cancelled, attempt aborted
//! ```
//!
//! The manager never awaits.  Each attempt runs in a spawned link task that
//! reports back through the coordinator queue tagged with its attempt id;
//! events from superseded attempts are ignored.
//!
//! Delivery is best effort.  The outbound queue holds at most
//! [`LINK_QUEUE_CAPACITY`] chunks; when the peer stops draining it, new
//! chunks are dropped instead of piling up, and a write that stalls for
//! [`WRITE_TIMEOUT`] ends the link so the reconnect loop takes over.  The
//! link task reads and writes concurrently, so a server close is noticed
//! even while a write is stuck.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ConnectionError, Connector, FrameSink, FrameSource, Inbound};
use crate::audio::Chunk;
use crate::config::{BackoffMode, ConnectionConfig};
use crate::stream::{Event, EventSender};

/// Chunks that may wait for the socket (800 ms of audio at 100 ms chunks).
pub const LINK_QUEUE_CAPACITY: usize = 8;

/// A single frame write taking longer than this means the peer is gone.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// ConnectionState / ConnectionEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Continuations posted back by link tasks and the reconnect timer.
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened {
        attempt: u64,
        outbound: mpsc::Sender<Vec<u8>>,
    },
    Failed {
        attempt: u64,
        error: ConnectionError,
    },
    Closed {
        attempt: u64,
        reason: Option<String>,
    },
    Message {
        attempt: u64,
        text: String,
    },
    ReconnectDue,
}

// ---------------------------------------------------------------------------
// ReconnectPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    /// `base * 2^(failures - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl ReconnectPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        let base = Duration::from_millis(config.reconnect_delay_ms);
        match config.backoff {
            BackoffMode::Fixed => ReconnectPolicy::Fixed(base),
            BackoffMode::Exponential => ReconnectPolicy::Exponential {
                base,
                max: Duration::from_millis(config.max_reconnect_delay_ms.max(config.reconnect_delay_ms)),
            },
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Exponential { base, max } => {
                let exp = failures.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exp).min(max)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LinkStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub attempts: u64,
    /// Chunks the sink accepted, across all links.
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    /// Chunks dropped because no link was up or its queue was full.
    pub chunks_dropped: u64,
}

/// Written-frame counters shared with every link task.
#[derive(Debug, Default)]
struct WriteCounters {
    chunks: AtomicU64,
    bytes: AtomicU64,
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    url: String,
    policy: ReconnectPolicy,
    events: EventSender,

    state: ConnectionState,
    attempt: u64,
    link: Option<mpsc::Sender<Vec<u8>>>,
    link_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    closed: bool,
    consecutive_failures: u32,
    stats: LinkStats,
    written: Arc<WriteCounters>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: &ConnectionConfig, events: EventSender) -> Self {
        Self {
            connector,
            url: config.url.clone(),
            policy: ReconnectPolicy::from_config(config),
            events,
            state: ConnectionState::Disconnected,
            attempt: 0,
            link: None,
            link_task: None,
            reconnect_timer: None,
            closed: false,
            consecutive_failures: 0,
            stats: LinkStats::default(),
            written: Arc::new(WriteCounters::default()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            chunks_sent: self.written.chunks.load(Ordering::Relaxed),
            bytes_sent: self.written.bytes.load(Ordering::Relaxed),
            ..self.stats
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Start an attempt.  No-op while connecting/connected or after `close()`.
    pub fn connect(&mut self) {
        if self.closed || self.state != ConnectionState::Disconnected {
            return;
        }
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }

        self.attempt += 1;
        self.stats.attempts += 1;
        self.state = ConnectionState::Connecting;
        log::info!("connection: connecting to {} (attempt {})", self.url, self.attempt);

        self.link_task = Some(tokio::spawn(run_link(
            self.attempt,
            Arc::clone(&self.connector),
            self.url.clone(),
            self.events.clone(),
            Arc::clone(&self.written),
        )));
    }

    /// Queue a chunk on the link.  Returns `false` when it was dropped: no
    /// link, or the link's queue is full because the peer is not keeping up.
    pub fn send(&mut self, chunk: Chunk) -> bool {
        let link = match (self.state, self.link.as_ref()) {
            (ConnectionState::Connected, Some(link)) => link,
            _ => {
                self.stats.chunks_dropped += 1;
                log::debug!(
                    "connection: dropping chunk {} ({} bytes), not connected",
                    chunk.seq,
                    chunk.len()
                );
                return false;
            }
        };

        let seq = chunk.seq;
        match link.try_send(chunk.data) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.chunks_dropped += 1;
                log::debug!("connection: link backlog full, dropping chunk {seq}");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Link task already gone; its Closed event is on the way.
                self.stats.chunks_dropped += 1;
                false
            }
        }
    }

    /// Terminal shutdown.  Cancels the reconnect timer and any in-flight
    /// attempt; an open link is closed gracefully by its task.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.link = None;
        if self.state == ConnectionState::Connecting {
            if let Some(task) = self.link_task.take() {
                task.abort();
            }
        }
        self.state = ConnectionState::Disconnected;

        let s = self.stats();
        log::info!(
            "connection: closed ({} attempts, {} chunks / {} bytes sent, {} dropped)",
            s.attempts,
            s.chunks_sent,
            s.bytes_sent,
            s.chunks_dropped
        );
    }

    /// Give the link task up to `grace` to finish its close handshake.
    pub async fn wait_closed(&mut self, grace: Duration) {
        if let Some(mut task) = self.link_task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                log::warn!("connection: link did not close within {grace:?}, aborting");
                task.abort();
            }
        }
    }

    /// Apply a continuation.  Returns the error when the link failed or
    /// was lost; a reconnect has been scheduled by then.
    pub fn on_event(&mut self, event: ConnectionEvent) -> Result<(), ConnectionError> {
        match event {
            ConnectionEvent::Opened { attempt, outbound } => {
                if self.is_stale(attempt) {
                    // Dropping `outbound` makes the task close the link.
                    return Ok(());
                }
                self.state = ConnectionState::Connected;
                self.link = Some(outbound);
                self.consecutive_failures = 0;
                log::info!("connection: connected to {}", self.url);
                Ok(())
            }

            ConnectionEvent::Failed { attempt, error } => {
                if self.is_stale(attempt) {
                    return Ok(());
                }
                log::warn!("connection: attempt {attempt} failed: {error}");
                self.on_link_down();
                Err(error)
            }

            ConnectionEvent::Closed { attempt, reason } => {
                if self.is_stale(attempt) {
                    return Ok(());
                }
                let reason = reason.unwrap_or_else(|| "closed".into());
                log::warn!("connection: link lost: {reason}");
                self.on_link_down();
                Err(ConnectionError::Lost(reason))
            }

            ConnectionEvent::Message { attempt, text } => {
                if !self.is_stale(attempt) {
                    log::info!("connection: server: {text}");
                }
                Ok(())
            }

            ConnectionEvent::ReconnectDue => {
                self.reconnect_timer = None;
                if !self.closed {
                    self.connect();
                }
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn is_stale(&self, attempt: u64) -> bool {
        self.closed || attempt != self.attempt
    }

    fn on_link_down(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.link = None;
        self.link_task = None;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.closed || self.reconnect_timer.is_some() {
            return;
        }
        let delay = self.policy.delay(self.consecutive_failures);
        log::info!("connection: reconnecting in {} ms", delay.as_millis());

        let deadline = tokio::time::Instant::now() + delay;
        let events = self.events.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = events.send(Event::Connection(ConnectionEvent::ReconnectDue));
        }));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.url)
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .field("closed", &self.closed)
            .field("stats", &self.stats)
            .finish()
    }
}

/// One connection attempt: open, report, then pump frames until either side
/// ends the link.
async fn run_link(
    attempt: u64,
    connector: Arc<dyn Connector>,
    url: String,
    events: EventSender,
    written: Arc<WriteCounters>,
) {
    let (mut sink, mut source) = match connector.connect(&url).await {
        Ok(parts) => parts,
        Err(error) => {
            let _ = events.send(Event::Connection(ConnectionEvent::Failed { attempt, error }));
            return;
        }
    };

    let (outbound_tx, mut outbound) = mpsc::channel::<Vec<u8>>(LINK_QUEUE_CAPACITY);
    let opened = ConnectionEvent::Opened {
        attempt,
        outbound: outbound_tx,
    };
    if events.send(Event::Connection(opened)).is_err() {
        sink.close().await;
        return;
    }

    let reason = tokio::select! {
        reason = write_frames(sink.as_mut(), &mut outbound, &written) => reason,
        reason = read_frames(attempt, source.as_mut(), &events) => Some(reason),
    };

    let _ = events.send(Event::Connection(ConnectionEvent::Closed { attempt, reason }));
}

/// Drain the outbound queue into the sink.  Returns `None` after a graceful
/// close (the manager let go of the link), otherwise why writing stopped.
async fn write_frames(
    sink: &mut dyn FrameSink,
    outbound: &mut mpsc::Receiver<Vec<u8>>,
    written: &WriteCounters,
) -> Option<String> {
    while let Some(data) = outbound.recv().await {
        let len = data.len() as u64;
        match tokio::time::timeout(WRITE_TIMEOUT, sink.send(data)).await {
            Ok(Ok(())) => {
                written.chunks.fetch_add(1, Ordering::Relaxed);
                written.bytes.fetch_add(len, Ordering::Relaxed);
            }
            Ok(Err(e)) => return Some(e.to_string()),
            Err(_) => return Some(format!("write stalled for {WRITE_TIMEOUT:?}")),
        }
    }
    sink.close().await;
    None
}

/// Surface server text until the stream ends; returns the close reason.
async fn read_frames(attempt: u64, source: &mut dyn FrameSource, events: &EventSender) -> String {
    loop {
        match source.next_frame().await {
            Some(Ok(Inbound::Text(text))) => {
                let _ = events.send(Event::Connection(ConnectionEvent::Message { attempt, text }));
            }
            Some(Ok(Inbound::Close(reason))) => {
                return reason.unwrap_or_else(|| "closed by server".into());
            }
            Some(Err(e)) => return e.to_string(),
            None => return "stream ended".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockConnector;
    use tokio::time::Instant;

    fn manager(mock: &MockConnector) -> (ConnectionManager, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(Arc::new(mock.clone()), &ConnectionConfig::default(), tx);
        (manager, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> ConnectionEvent {
        match rx.recv().await {
            Some(Event::Connection(event)) => event,
            other => panic!("expected a connection event, got {other:?}"),
        }
    }

    /// Let spawned tasks run without moving the paused clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn chunk(seq: u64, data: &[u8]) -> Chunk {
        Chunk {
            seq,
            timestamp_ms: seq * 100,
            data: data.to_vec(),
        }
    }

    async fn connected(mock: &MockConnector) -> (ConnectionManager, mpsc::UnboundedReceiver<Event>) {
        let (mut m, mut rx) = manager(mock);
        m.connect();
        let event = next_event(&mut rx).await;
        m.on_event(event).expect("opened");
        assert!(m.is_connected());
        (m, rx)
    }

    // ---- ReconnectPolicy ---------------------------------------------------

    #[test]
    fn default_policy_is_fixed_three_seconds() {
        let policy = ReconnectPolicy::from_config(&ConnectionConfig::default());
        assert_eq!(policy.delay(1), Duration::from_secs(3));
        assert_eq!(policy.delay(7), Duration::from_secs(3));
    }

    #[test]
    fn exponential_policy_doubles_up_to_max() {
        let config = ConnectionConfig {
            backoff: BackoffMode::Exponential,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 5_000,
            ..ConnectionConfig::default()
        };
        let policy = ReconnectPolicy::from_config(&config);
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
    }

    // ---- connect -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let mock = MockConnector::new();
        let (mut m, mut rx) = manager(&mock);

        m.connect();
        m.connect();
        assert_eq!(m.state(), ConnectionState::Connecting);

        let event = next_event(&mut rx).await;
        m.on_event(event).unwrap();
        m.connect();

        settle().await;
        assert!(m.is_connected());
        assert_eq!(mock.attempts(), 1);
        assert_eq!(m.stats().attempts, 1);
    }

    // ---- send --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn chunks_are_dropped_while_disconnected() {
        let mock = MockConnector::new();
        let (mut m, _rx) = manager(&mock);

        assert!(!m.send(chunk(0, &[1, 2])));
        m.connect();
        assert!(!m.send(chunk(1, &[3, 4])), "still connecting");

        settle().await;
        assert!(mock.sent().is_empty());
        assert_eq!(m.stats().chunks_dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_are_written_in_order_while_connected() {
        let mock = MockConnector::new();
        let (mut m, _rx) = connected(&mock).await;

        assert!(m.send(chunk(0, &[1, 1])));
        assert!(m.send(chunk(1, &[2, 2, 2])));
        settle().await;

        assert_eq!(mock.sent(), vec![vec![1, 1], vec![2, 2, 2]]);
        let stats = m.stats();
        assert_eq!((stats.chunks_sent, stats.bytes_sent), (2, 5));
    }

    // ---- reconnect ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn server_close_schedules_one_reconnect_after_delay() {
        let mock = MockConnector::new();
        let (mut m, mut rx) = connected(&mock).await;

        mock.server_close();
        let event = next_event(&mut rx).await;
        assert!(matches!(m.on_event(event), Err(ConnectionError::Lost(_))));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.reconnect_pending());

        let lost_at = Instant::now();
        let due = next_event(&mut rx).await;
        let waited = lost_at.elapsed();
        assert!(matches!(due, ConnectionEvent::ReconnectDue));
        assert!(waited >= Duration::from_millis(3_000), "fired after {waited:?}");
        assert!(waited < Duration::from_millis(3_100), "fired after {waited:?}");

        m.on_event(due).unwrap();
        assert_eq!(m.state(), ConnectionState::Connecting);
        let opened = next_event(&mut rx).await;
        m.on_event(opened).unwrap();
        assert!(m.is_connected());
        assert_eq!(mock.attempts(), 2);

        // Nothing else was scheduled.
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_does_not_fire_early() {
        let mock = MockConnector::new();
        mock.set_failing(true);
        let (mut m, mut rx) = manager(&mock);

        m.connect();
        let failed = next_event(&mut rx).await;
        assert!(m.on_event(failed).is_err());

        tokio::time::advance(Duration::from_millis(2_999)).await;
        settle().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(matches!(next_event(&mut rx).await, ConnectionEvent::ReconnectDue));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnects_keep_retrying_one_at_a_time() {
        let mock = MockConnector::new();
        mock.set_failing(true);
        let (mut m, mut rx) = manager(&mock);

        m.connect();
        for _ in 0..3 {
            let failed = next_event(&mut rx).await;
            assert!(m.on_event(failed).is_err());
            let due = next_event(&mut rx).await;
            m.on_event(due).unwrap();
        }
        settle().await;
        assert_eq!(mock.attempts(), 4);
    }

    // ---- backpressure ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn stuck_peer_drops_chunks_instead_of_queueing() {
        let mock = MockConnector::new();
        mock.set_stalled_writes(true);
        let (mut m, mut rx) = connected(&mock).await;

        let accepted = (0..20u64).filter(|&seq| m.send(chunk(seq, &[0; 4]))).count();
        assert_eq!(accepted, LINK_QUEUE_CAPACITY);
        settle().await;

        let stats = m.stats();
        assert_eq!(stats.chunks_sent, 0, "nothing reached the socket");
        assert_eq!(stats.chunks_dropped, 20 - LINK_QUEUE_CAPACITY as u64);

        // Reading goes on while the write is stuck.
        mock.server_close();
        match next_event(&mut rx).await {
            ConnectionEvent::Closed { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("1001 going away"));
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_ends_the_link() {
        let mock = MockConnector::new();
        mock.set_stalled_writes(true);
        let (mut m, mut rx) = connected(&mock).await;

        assert!(m.send(chunk(0, &[1])));
        let started = Instant::now();
        let event = next_event(&mut rx).await;
        assert!(started.elapsed() >= WRITE_TIMEOUT);
        assert!(matches!(m.on_event(event), Err(ConnectionError::Lost(_))));
        assert!(m.reconnect_pending());
        assert_eq!(m.stats().chunks_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let mock = MockConnector::new();
        mock.set_failing(true);
        let (mut m, mut rx) = manager(&mock);

        m.connect();
        let failed = next_event(&mut rx).await;
        let _ = m.on_event(failed);
        assert!(m.reconnect_pending());

        m.close();
        assert!(!m.reconnect_pending());
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(rx.try_recv().is_err());

        m.connect();
        assert_eq!(m.state(), ConnectionState::Disconnected, "closed is terminal");
        assert_eq!(mock.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_connecting_aborts_the_attempt() {
        let mock = MockConnector::new();
        mock.set_hanging(true);
        let (mut m, mut rx) = manager(&mock);

        m.connect();
        settle().await;
        m.close();
        m.wait_closed(Duration::from_secs(1)).await;

        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_shuts_an_open_link_gracefully() {
        let mock = MockConnector::new();
        let (mut m, mut rx) = connected(&mock).await;

        m.close();
        m.wait_closed(Duration::from_secs(1)).await;
        assert_eq!(mock.closes(), 1);

        // The task's Closed event is ignored after close().
        let event = next_event(&mut rx).await;
        assert!(m.on_event(event).is_ok());
        assert!(!m.reconnect_pending());
        assert!(!m.send(chunk(0, &[0])));
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_superseded_attempts_are_ignored() {
        let mock = MockConnector::new();
        let (mut m, mut rx) = connected(&mock).await;

        let stale = ConnectionEvent::Closed {
            attempt: 99,
            reason: Some("old".into()),
        };
        assert!(m.on_event(stale).is_ok());
        assert!(m.is_connected());
        assert!(!m.reconnect_pending());

        mock.server_text("Processed 8820 bytes");
        let message = next_event(&mut rx).await;
        assert!(matches!(message, ConnectionEvent::Message { .. }));
        assert!(m.on_event(message).is_ok());
        assert!(m.is_connected());
    }
}
