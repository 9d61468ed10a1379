//! Self-healing client for one upstream push socket.
//!
//! A [`Connection`] owns at most one live socket at a time and converts
//! every failure mode into a scheduled reconnect: close and error events
//! feed host-suggested restart delays, and a stall detector force-restarts
//! sockets that go quiet without ever firing close or error. Socket-level
//! failures never surface as errors to the host; only misuse does.

use crate::queue::Queue;
use crate::timer::TimerHandle;
use crate::transport::{SocketEvent, SocketSink, SocketStream, Transport, TransportError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reconnect delay after a close with no host-suggested override.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
/// Reconnect delay when the stall detector forces a restart.
pub const STALL_RESTART_DELAY: Duration = Duration::from_millis(100);
/// How often the stall detector runs.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Close code used when this side closes a socket to restart it.
pub const RESTART_CLOSE_CODE: u16 = 4000;

const OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Restarting,
    /// Absorbing: every later start/restart/send is rejected or ignored.
    Terminated,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection is terminated")]
    Terminated,
}

/// Host-supplied, slot-indexed feed callbacks. The close and error hooks
/// may return a restart-delay override; an error-suggested delay takes
/// precedence over the one suggested by the close event that follows it.
pub trait FeedEvents: Send + Sync + 'static {
    fn on_open(&self, _slot: usize) {}
    fn on_message(&self, _slot: usize, _raw: &str) {}
    fn on_close(&self, _slot: usize, _code: u16, _reason: &str) -> Option<Duration> {
        None
    }
    fn on_error(&self, _slot: usize, _error: &TransportError) -> Option<Duration> {
        None
    }
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub slot: usize,
    /// A nominally open socket that delivers neither messages nor pongs
    /// for this long is considered dead and force-restarted.
    pub stall_threshold: Duration,
}

enum Outbound {
    Text(String),
    Ping,
    Close(u16, String),
}

#[derive(Debug, Clone)]
struct CloseRecord {
    at: Instant,
    code: u16,
}

struct State {
    phase: ConnectionState,
    /// Incremented per socket attempt; events from superseded sockets are
    /// dropped on the floor.
    epoch: u64,
    created_at: Option<Instant>,
    opened_at: Option<Instant>,
    last_message_at: Option<Instant>,
    last_pong_at: Option<Instant>,
    last_close: Option<CloseRecord>,
    last_error_at: Option<Instant>,
    error_delay_hint: Option<Duration>,
    /// Outbound messages buffered while the socket is not open.
    outbox: Queue<String>,
    writer: Option<mpsc::UnboundedSender<Outbound>>,
    driver: Option<JoinHandle<()>>,
    restart_timer: Option<TimerHandle>,
    health_timer: Option<TimerHandle>,
    keepalive_timer: Option<TimerHandle>,
}

impl State {
    /// Most recent sign of life, pongs included. Drives stall detection.
    fn last_receive(&self) -> Option<Instant> {
        [
            self.created_at,
            self.opened_at,
            self.last_message_at,
            self.last_pong_at,
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// Most recent activity as the fleet sees it: pongs deliberately do
    /// not count, so a socket kept alive only by keepalives still lags.
    fn latest_activity(&self) -> Option<Instant> {
        [self.created_at, self.opened_at, self.last_message_at]
            .into_iter()
            .flatten()
            .max()
    }
}

struct Shared {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    events: Arc<dyn FeedEvents>,
    state: Mutex<State>,
}

/// Auto-reconnecting client for one socket. Created per fleet slot and
/// replaced, never reused, on fleet-level restarts; its own socket-level
/// restarts happen in place.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Must be called from within a tokio runtime: the stall detector and
    /// keepalive timers are scheduled immediately.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        events: Arc<dyn FeedEvents>,
    ) -> Self {
        let keepalive_period = config.stall_threshold / 3;
        let shared = Arc::new(Shared {
            config,
            transport,
            events,
            state: Mutex::new(State {
                phase: ConnectionState::Connecting,
                epoch: 0,
                created_at: None,
                opened_at: None,
                last_message_at: None,
                last_pong_at: None,
                last_close: None,
                last_error_at: None,
                error_delay_hint: None,
                outbox: Queue::new(OUTBOX_CAPACITY),
                writer: None,
                driver: None,
                restart_timer: None,
                health_timer: None,
                keepalive_timer: None,
            }),
        });

        let weak = Arc::downgrade(&shared);
        let health = TimerHandle::repeating(HEALTH_CHECK_INTERVAL, move || {
            if let Some(shared) = weak.upgrade() {
                Self::health_check(&shared);
            }
        });
        let weak = Arc::downgrade(&shared);
        let keepalive = TimerHandle::repeating(keepalive_period, move || {
            if let Some(shared) = weak.upgrade() {
                let st = shared.state.lock().unwrap();
                if st.phase == ConnectionState::Open {
                    if let Some(w) = &st.writer {
                        let _ = w.send(Outbound::Ping);
                    }
                }
            }
        });
        {
            let mut st = shared.state.lock().unwrap();
            st.health_timer = Some(health);
            st.keepalive_timer = Some(keepalive);
        }

        Self { shared }
    }

    /// Opens a socket. No-op if terminated or one is already live.
    pub fn start(&self) {
        Self::start_socket(&self.shared);
    }

    /// Closes or aborts the current socket and opens a fresh one after
    /// `delay`. No-op if a restart is already scheduled or terminated.
    pub fn restart(&self, delay: Duration) {
        Self::schedule_restart(&self.shared, delay);
    }

    /// One-way transition: cancels all timers, tears down any live socket,
    /// and turns every subsequent start/restart into a no-op.
    pub fn terminate(&self) {
        let mut st = self.shared.state.lock().unwrap();
        if st.phase == ConnectionState::Terminated {
            return;
        }
        st.phase = ConnectionState::Terminated;
        st.restart_timer = None;
        st.health_timer = None;
        st.keepalive_timer = None;
        Self::teardown_socket(&mut st, 1001, "terminated");
        debug!(slot = self.shared.config.slot, "connection terminated");
    }

    /// Sends immediately when open; otherwise buffers FIFO for the next
    /// open. Fails only once terminated.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        let text = text.into();
        let mut st = self.shared.state.lock().unwrap();
        match st.phase {
            ConnectionState::Terminated => Err(SendError::Terminated),
            ConnectionState::Open => {
                if let Some(w) = &st.writer {
                    match w.send(Outbound::Text(text)) {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            // Writer raced a teardown; fall back to the buffer.
                            if let Outbound::Text(text) = e.0 {
                                Self::buffer_outbound(&mut st, text, self.shared.config.slot);
                            }
                        }
                    }
                } else {
                    Self::buffer_outbound(&mut st, text, self.shared.config.slot);
                }
                Ok(())
            }
            _ => {
                Self::buffer_outbound(&mut st, text, self.shared.config.slot);
                Ok(())
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().unwrap().phase
    }

    /// Most recent sign of life including pongs.
    pub fn last_receive(&self) -> Option<Instant> {
        self.shared.state.lock().unwrap().last_receive()
    }

    /// Most recent activity excluding pongs (the fleet's lag measure).
    pub fn latest_activity(&self) -> Option<Instant> {
        self.shared.state.lock().unwrap().latest_activity()
    }

    pub fn last_message_at(&self) -> Option<Instant> {
        self.shared.state.lock().unwrap().last_message_at
    }

    fn buffer_outbound(st: &mut MutexGuard<'_, State>, text: String, slot: usize) {
        if st.outbox.is_full() {
            warn!(slot, "outbound buffer full, dropping oldest message");
            st.outbox.poll();
        }
        let _ = st.outbox.offer(text);
    }

    fn start_socket(shared: &Arc<Shared>) {
        let mut st = shared.state.lock().unwrap();
        if st.phase == ConnectionState::Terminated || st.driver.is_some() {
            return;
        }
        st.phase = ConnectionState::Connecting;
        st.epoch += 1;
        st.created_at = Some(Instant::now());
        st.error_delay_hint = None;
        let epoch = st.epoch;
        st.driver = Some(tokio::spawn(Self::drive(shared.clone(), epoch)));
        debug!(
            slot = shared.config.slot,
            url = %shared.config.url,
            epoch,
            "connecting"
        );
    }

    fn schedule_restart(shared: &Arc<Shared>, delay: Duration) {
        let mut st = shared.state.lock().unwrap();
        if st.phase == ConnectionState::Terminated || st.restart_timer.is_some() {
            return;
        }
        st.phase = ConnectionState::Restarting;
        let weak = Arc::downgrade(shared);
        st.restart_timer = Some(TimerHandle::once(delay, move || {
            if let Some(shared) = weak.upgrade() {
                shared.state.lock().unwrap().restart_timer = None;
                Self::start_socket(&shared);
            }
        }));
        Self::teardown_socket(&mut st, RESTART_CLOSE_CODE, "restarting");
    }

    /// Closes an open socket with a distinguishing code, or aborts a
    /// connecting one. Must run after any restart timer is in place so an
    /// in-driver caller aborting itself has already scheduled its revival.
    fn teardown_socket(st: &mut MutexGuard<'_, State>, code: u16, reason: &str) {
        if let Some(w) = st.writer.take() {
            let _ = w.send(Outbound::Close(code, reason.to_string()));
            st.driver.take();
        } else if let Some(driver) = st.driver.take() {
            driver.abort();
        }
    }

    fn health_check(shared: &Arc<Shared>) {
        let stalled = {
            let st = shared.state.lock().unwrap();
            st.phase != ConnectionState::Terminated
                && st.restart_timer.is_none()
                && st
                    .last_receive()
                    .is_some_and(|t| Instant::now().duration_since(t) > shared.config.stall_threshold)
        };
        if stalled {
            warn!(
                slot = shared.config.slot,
                "no traffic within stall threshold, forcing restart"
            );
            Self::schedule_restart(shared, STALL_RESTART_DELAY);
        }
    }

    async fn drive(shared: Arc<Shared>, epoch: u64) {
        let url = shared.config.url.clone();
        let slot = shared.config.slot;

        let (mut sink, mut stream) = match shared.transport.connect(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(slot, url = %url, error = %e, "connect failed");
                Self::on_transport_error(&shared, epoch, &e);
                Self::on_socket_closed(&shared, epoch, 1006, "connect failed");
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let backlog = {
            let mut st = shared.state.lock().unwrap();
            if st.epoch != epoch || st.phase == ConnectionState::Terminated {
                return;
            }
            st.phase = ConnectionState::Open;
            st.opened_at = Some(Instant::now());
            st.writer = Some(tx);
            let mut backlog = Vec::new();
            while let Some(text) = st.outbox.poll() {
                backlog.push(text);
            }
            backlog
        };
        info!(slot, url = %url, "connection open");
        shared.events.on_open(slot);

        for text in backlog {
            if let Err(e) = sink.send(text).await {
                Self::on_transport_error(&shared, epoch, &e);
            }
        }

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(text).await {
                            Self::on_transport_error(&shared, epoch, &e);
                        }
                    }
                    Some(Outbound::Ping) => {
                        if let Err(e) = sink.ping().await {
                            Self::on_transport_error(&shared, epoch, &e);
                        }
                    }
                    Some(Outbound::Close(code, reason)) => {
                        let _ = sink.close(code, &reason).await;
                        return;
                    }
                    None => return,
                },
                ev = stream.next_event() => match ev {
                    Some(SocketEvent::Message(text)) => {
                        {
                            let mut st = shared.state.lock().unwrap();
                            if st.epoch != epoch {
                                continue;
                            }
                            st.last_message_at = Some(Instant::now());
                        }
                        shared.events.on_message(slot, &text);
                    }
                    Some(SocketEvent::Pong) => {
                        let mut st = shared.state.lock().unwrap();
                        if st.epoch == epoch {
                            st.last_pong_at = Some(Instant::now());
                        }
                    }
                    Some(SocketEvent::Error(e)) => {
                        Self::on_transport_error(&shared, epoch, &e);
                    }
                    Some(SocketEvent::Closed { code, reason }) => {
                        Self::on_socket_closed(&shared, epoch, code, &reason);
                        return;
                    }
                    None => {
                        Self::on_socket_closed(&shared, epoch, 1006, "stream ended");
                        return;
                    }
                }
            }
        }
    }

    fn on_transport_error(shared: &Arc<Shared>, epoch: u64, error: &TransportError) {
        {
            let mut st = shared.state.lock().unwrap();
            if st.epoch != epoch || st.phase == ConnectionState::Terminated {
                return;
            }
            st.last_error_at = Some(Instant::now());
        }
        warn!(slot = shared.config.slot, error = %error, "socket error");
        let hint = shared.events.on_error(shared.config.slot, error);
        if let Some(delay) = hint {
            let mut st = shared.state.lock().unwrap();
            if st.epoch == epoch && st.phase != ConnectionState::Terminated {
                st.error_delay_hint = Some(delay);
            }
        }
    }

    fn on_socket_closed(shared: &Arc<Shared>, epoch: u64, code: u16, reason: &str) {
        {
            let mut st = shared.state.lock().unwrap();
            if st.epoch != epoch || st.phase == ConnectionState::Terminated {
                return;
            }
            st.last_close = Some(CloseRecord {
                at: Instant::now(),
                code,
            });
            st.writer = None;
        }
        info!(slot = shared.config.slot, code, reason, "socket closed");
        let hint = shared.events.on_close(shared.config.slot, code, reason);
        let delay = {
            let mut st = shared.state.lock().unwrap();
            if st.epoch != epoch || st.phase == ConnectionState::Terminated {
                return;
            }
            st.error_delay_hint
                .take()
                .or(hint)
                .unwrap_or(DEFAULT_RESTART_DELAY)
        };
        Self::schedule_restart(shared, delay);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    const URL: &str = "wss://feed.example/updates";

    #[derive(Default)]
    struct Recorder {
        opens: AtomicUsize,
        messages: Mutex<Vec<String>>,
        closes: Mutex<Vec<u16>>,
        close_hint: Option<Duration>,
        error_hint: Option<Duration>,
    }

    impl FeedEvents for Recorder {
        fn on_open(&self, _slot: usize) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }
        fn on_message(&self, _slot: usize, raw: &str) {
            self.messages.lock().unwrap().push(raw.to_string());
        }
        fn on_close(&self, _slot: usize, code: u16, _reason: &str) -> Option<Duration> {
            self.closes.lock().unwrap().push(code);
            self.close_hint
        }
        fn on_error(&self, _slot: usize, _error: &TransportError) -> Option<Duration> {
            self.error_hint
        }
    }

    fn make_connection(
        transport: Arc<MockTransport>,
        events: Arc<Recorder>,
        stall: Duration,
    ) -> Connection {
        Connection::new(
            ConnectionConfig {
                url: URL.to_string(),
                slot: 0,
                stall_threshold: stall,
            },
            transport,
            events,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_while_connecting_flush_in_order_on_open() {
        let transport = MockTransport::new();
        transport.hold_connects();
        let events = Arc::new(Recorder::default());
        let conn = make_connection(transport.clone(), events.clone(), Duration::from_secs(30));

        conn.start();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.send("first").unwrap();
        conn.send("second").unwrap();
        assert!(transport.sent_texts(URL).is_empty());

        transport.release_connects(1);
        sleep(Duration::from_millis(1)).await;

        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(events.opens.load(Ordering::SeqCst), 1);
        assert_eq!(transport.sent_texts(URL), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_send_goes_straight_through() {
        let transport = MockTransport::new();
        let events = Arc::new(Recorder::default());
        let conn = make_connection(transport.clone(), events, Duration::from_secs(30));

        conn.start();
        sleep(Duration::from_millis(1)).await;
        conn.send("live").unwrap();
        sleep(Duration::from_millis(1)).await;

        assert_eq!(transport.sent_texts(URL), vec!["live"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_invoke_callback_and_update_activity() {
        let transport = MockTransport::new();
        let events = Arc::new(Recorder::default());
        let conn = make_connection(transport.clone(), events.clone(), Duration::from_secs(30));

        conn.start();
        sleep(Duration::from_millis(1)).await;
        let before = conn.last_receive().unwrap();

        sleep(Duration::from_millis(500)).await;
        assert!(transport.emit_message(URL, "update-1"));
        sleep(Duration::from_millis(1)).await;

        assert_eq!(events.messages.lock().unwrap().clone(), vec!["update-1"]);
        assert!(conn.last_receive().unwrap() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_is_absorbing() {
        let transport = MockTransport::new();
        let events = Arc::new(Recorder::default());
        let conn = make_connection(transport.clone(), events, Duration::from_secs(30));

        conn.start();
        sleep(Duration::from_millis(1)).await;
        conn.terminate();

        assert_eq!(conn.state(), ConnectionState::Terminated);
        assert_eq!(conn.send("late"), Err(SendError::Terminated));

        conn.restart(Duration::from_millis(10));
        conn.start();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(conn.state(), ConnectionState::Terminated);
        assert_eq!(transport.connect_count(URL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_force_restarted() {
        let transport = MockTransport::new();
        // No pong replies: the socket is completely silent after open.
        transport.set_auto_pong(false);
        let events = Arc::new(Recorder::default());
        let conn = make_connection(transport.clone(), events, Duration::from_secs(5));

        conn.start();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.connect_count(URL), 1);

        sleep(Duration::from_millis(6500)).await;
        assert_eq!(transport.connect_count(URL), 2);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_a_quiet_connection_alive() {
        let transport = MockTransport::new();
        let events = Arc::new(Recorder::default());
        let conn = make_connection(transport.clone(), events, Duration::from_secs(5));

        conn.start();
        // Keepalive pings every stall/3 are answered with pongs by the mock,
        // so the stall detector never trips despite zero data messages.
        sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.connect_count(URL), 1);
        assert!(transport.ping_count() >= 10);
        let _ = conn;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_schedules_restart_with_host_hint() {
        let transport = MockTransport::new();
        let events = Arc::new(Recorder {
            close_hint: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        let conn = make_connection(transport.clone(), events.clone(), Duration::from_secs(30));

        conn.start();
        sleep(Duration::from_millis(1)).await;
        transport.emit(
            URL,
            SocketEvent::Closed {
                code: 1011,
                reason: "server going away".to_string(),
            },
        );
        sleep(Duration::from_millis(1)).await;
        assert_eq!(conn.state(), ConnectionState::Restarting);
        assert_eq!(events.closes.lock().unwrap().clone(), vec![1011]);

        sleep(Duration::from_millis(1900)).await;
        assert_eq!(transport.connect_count(URL), 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.connect_count(URL), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_hint_beats_close_hint() {
        let transport = MockTransport::new();
        let events = Arc::new(Recorder {
            close_hint: Some(Duration::from_secs(10)),
            error_hint: Some(Duration::from_secs(3)),
            ..Default::default()
        });
        let conn = make_connection(transport.clone(), events, Duration::from_secs(30));

        conn.start();
        sleep(Duration::from_millis(1)).await;
        transport.emit(
            URL,
            SocketEvent::Error(TransportError::Socket("reset".to_string())),
        );
        transport.emit(
            URL,
            SocketEvent::Closed {
                code: 1006,
                reason: String::new(),
            },
        );

        sleep(Duration::from_millis(2900)).await;
        assert_eq!(transport.connect_count(URL), 1);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.connect_count(URL), 2);
        let _ = conn;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_is_idempotent_while_pending() {
        let transport = MockTransport::new();
        let events = Arc::new(Recorder::default());
        let conn = make_connection(transport.clone(), events, Duration::from_secs(30));

        conn.start();
        sleep(Duration::from_millis(1)).await;

        conn.restart(Duration::from_secs(2));
        conn.restart(Duration::from_millis(10));
        assert_eq!(conn.state(), ConnectionState::Restarting);

        // The second call must not shorten the pending restart.
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(transport.connect_count(URL), 1);
        sleep(Duration::from_millis(600)).await;
        assert_eq!(transport.connect_count(URL), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_of_open_socket_uses_distinguishing_close_code() {
        let transport = MockTransport::new();
        let events = Arc::new(Recorder::default());
        let conn = make_connection(transport.clone(), events, Duration::from_secs(30));

        conn.start();
        sleep(Duration::from_millis(1)).await;
        conn.restart(Duration::from_millis(100));
        sleep(Duration::from_millis(1)).await;

        let closes = transport.closes();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].1, RESTART_CLOSE_CODE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_retries_with_default_delay() {
        let transport = MockTransport::new();
        transport.fail_next_connects(URL, 1);
        let events = Arc::new(Recorder::default());
        let conn = make_connection(transport.clone(), events, Duration::from_secs(30));

        conn.start();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.connect_count(URL), 1);
        assert_ne!(conn.state(), ConnectionState::Open);

        sleep(DEFAULT_RESTART_DELAY + Duration::from_millis(50)).await;
        assert_eq!(transport.connect_count(URL), 2);
        assert_eq!(conn.state(), ConnectionState::Open);
    }
}
