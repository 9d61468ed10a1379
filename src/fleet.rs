//! Multi-connection orchestration for one logical feed.
//!
//! A [`Fleet`] runs N redundant [`Connection`]s against the same feed,
//! staggers their socket creation so upstream never sees a thundering
//! herd, and uses the healthy majority as ground truth to spot and replace
//! the slot that has fallen behind. Redundancy buys lower missed-update
//! latency at the cost of duplicates and cross-slot reordering; consumers
//! reconcile by payload timestamp.

use crate::connection::{Connection, ConnectionConfig, ConnectionState, FeedEvents};
use crate::timer::TimerHandle;
use crate::transport::{Transport, TransportError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often the fleet-level health check runs.
pub const FLEET_HEALTH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("concurrent_connections must be greater than zero")]
    NoConnections,
}

/// Where each slot connects: one shared URL, or a function of slot index
/// (some gateways shard by path or query parameter).
#[derive(Clone)]
pub enum UrlProvider {
    Fixed(String),
    PerSlot(Arc<dyn Fn(usize) -> String + Send + Sync>),
}

impl UrlProvider {
    fn url_for(&self, slot: usize) -> String {
        match self {
            UrlProvider::Fixed(url) => url.clone(),
            UrlProvider::PerSlot(f) => f(slot),
        }
    }
}

impl From<&str> for UrlProvider {
    fn from(url: &str) -> Self {
        UrlProvider::Fixed(url.to_string())
    }
}

impl From<String> for UrlProvider {
    fn from(url: String) -> Self {
        UrlProvider::Fixed(url)
    }
}

#[derive(Clone)]
pub struct FleetConfig {
    pub concurrent_connections: usize,
    pub url: UrlProvider,
    /// Passed through to each slot's connection-level stall detector.
    pub stall_threshold: Duration,
    /// A slot whose activity trails the fleet's freshest message by more
    /// than this is assumed faulted even while nominally open.
    pub lag_threshold: Duration,
    /// If the whole fleet has been silent this long, restart the laggard
    /// unconditionally (total-outage recovery).
    pub all_connections_silent_threshold: Duration,
    /// Minimum spacing between any two socket creations, fleet-wide.
    pub start_delay_between_connections: Duration,
}

/// Aggregate readiness across slots: OPEN wins, then CONNECTING, then
/// RESTARTING. Terminated fleets report [`FleetStatus::Terminated`]
/// regardless of slot states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetStatus {
    Open,
    Connecting,
    Restarting,
    Unknown,
    Terminated,
}

struct PendingRestart {
    at: Instant,
    _timer: TimerHandle,
}

struct FleetState {
    terminated: bool,
    slots: Vec<Option<Connection>>,
    pending: Vec<Option<PendingRestart>>,
    last_create: Option<Instant>,
    health_timer: Option<TimerHandle>,
}

struct FleetShared {
    config: FleetConfig,
    transport: Arc<dyn Transport>,
    events: Arc<CountingEvents>,
    state: Mutex<FleetState>,
}

/// Wraps the host's callbacks to maintain per-slot consecutive-error
/// counters. The counters only tune backoff; this layer never gives up.
struct CountingEvents {
    host: Arc<dyn FeedEvents>,
    errors: Mutex<Vec<u32>>,
}

impl FeedEvents for CountingEvents {
    fn on_open(&self, slot: usize) {
        self.errors.lock().unwrap()[slot] = 0;
        self.host.on_open(slot);
    }

    fn on_message(&self, slot: usize, raw: &str) {
        self.errors.lock().unwrap()[slot] = 0;
        self.host.on_message(slot, raw);
    }

    fn on_close(&self, slot: usize, code: u16, reason: &str) -> Option<Duration> {
        self.host.on_close(slot, code, reason)
    }

    fn on_error(&self, slot: usize, error: &TransportError) -> Option<Duration> {
        self.errors.lock().unwrap()[slot] += 1;
        self.host.on_error(slot, error)
    }
}

/// Orchestrator for N redundant connections to one logical feed.
pub struct Fleet {
    shared: Arc<FleetShared>,
}

impl Fleet {
    /// Starts all slots, globally throttled by
    /// `start_delay_between_connections`. Must be called from within a
    /// tokio runtime.
    pub fn new(
        config: FleetConfig,
        transport: Arc<dyn Transport>,
        events: Arc<dyn FeedEvents>,
    ) -> Result<Self, ConfigError> {
        let n = config.concurrent_connections;
        if n == 0 {
            return Err(ConfigError::NoConnections);
        }

        let shared = Arc::new(FleetShared {
            config,
            transport,
            events: Arc::new(CountingEvents {
                host: events,
                errors: Mutex::new(vec![0; n]),
            }),
            state: Mutex::new(FleetState {
                terminated: false,
                slots: (0..n).map(|_| None).collect(),
                pending: (0..n).map(|_| None).collect(),
                last_create: None,
                health_timer: None,
            }),
        });

        let weak = Arc::downgrade(&shared);
        let health = TimerHandle::repeating(FLEET_HEALTH_INTERVAL, move || {
            if let Some(shared) = weak.upgrade() {
                Self::health_check(&shared);
            }
        });
        shared.state.lock().unwrap().health_timer = Some(health);

        info!(connections = n, "starting feed fleet");
        for slot in 0..n {
            Self::restart_slot(&shared, slot, Duration::ZERO);
        }

        Ok(Self { shared })
    }

    /// Replaces slot `slot`'s connection with a fresh one after `delay`,
    /// further deferred so that socket creations fleet-wide stay at least
    /// `start_delay_between_connections` apart. No-op if a restart for the
    /// slot is already pending or the fleet is terminated.
    pub fn restart(&self, slot: usize, delay: Duration) {
        Self::restart_slot(&self.shared, slot, delay);
    }

    pub fn status(&self) -> FleetStatus {
        let st = self.shared.state.lock().unwrap();
        if st.terminated {
            return FleetStatus::Terminated;
        }
        let states: Vec<ConnectionState> = st
            .slots
            .iter()
            .flatten()
            .map(Connection::state)
            .collect();
        if states.contains(&ConnectionState::Open) {
            FleetStatus::Open
        } else if states.contains(&ConnectionState::Connecting) {
            FleetStatus::Connecting
        } else if states.contains(&ConnectionState::Restarting) || st.pending.iter().any(Option::is_some)
        {
            FleetStatus::Restarting
        } else {
            FleetStatus::Unknown
        }
    }

    /// Most recent receive across all slots.
    pub fn last_receive(&self) -> Option<Instant> {
        let st = self.shared.state.lock().unwrap();
        st.slots
            .iter()
            .flatten()
            .filter_map(Connection::last_receive)
            .max()
    }

    pub fn consecutive_errors(&self, slot: usize) -> u32 {
        self.shared
            .events
            .errors
            .lock()
            .unwrap()
            .get(slot)
            .copied()
            .unwrap_or(0)
    }

    pub fn slot_count(&self) -> usize {
        self.shared.config.concurrent_connections
    }

    pub fn slot_state(&self, slot: usize) -> Option<ConnectionState> {
        let st = self.shared.state.lock().unwrap();
        st.slots
            .get(slot)
            .and_then(Option::as_ref)
            .map(Connection::state)
    }

    pub fn slot_latest_activity(&self, slot: usize) -> Option<Instant> {
        let st = self.shared.state.lock().unwrap();
        st.slots
            .get(slot)
            .and_then(Option::as_ref)
            .and_then(Connection::latest_activity)
    }

    /// Cancels every timer and terminates every slot. Permanent.
    pub fn terminate(&self) {
        let mut st = self.shared.state.lock().unwrap();
        if st.terminated {
            return;
        }
        st.terminated = true;
        st.health_timer = None;
        for pending in st.pending.iter_mut() {
            *pending = None;
        }
        for slot in st.slots.iter_mut() {
            if let Some(conn) = slot.take() {
                conn.terminate();
            }
        }
        info!("fleet terminated");
    }

    fn restart_slot(shared: &Arc<FleetShared>, slot: usize, delay: Duration) {
        let mut st = shared.state.lock().unwrap();
        if st.terminated || st.pending[slot].is_some() {
            return;
        }
        let now = Instant::now();
        let gap = shared.config.start_delay_between_connections;

        // Effective start time: the requested delay, pushed out so that no
        // two socket creations (past or already scheduled) fall within one
        // gap of each other.
        let mut at = now + delay;
        if let Some(last) = st.last_create {
            at = at.max(last + gap);
        }
        for pending in st.pending.iter().flatten() {
            at = at.max(pending.at + gap);
        }

        if at <= now {
            Self::start_slot(shared, &mut st, slot);
        } else {
            debug!(slot, defer_ms = (at - now).as_millis() as u64, "deferring slot start");
            let weak = Arc::downgrade(shared);
            let timer = TimerHandle::once(at - now, move || {
                if let Some(shared) = weak.upgrade() {
                    let mut st = shared.state.lock().unwrap();
                    st.pending[slot] = None;
                    if !st.terminated {
                        Self::start_slot(&shared, &mut st, slot);
                    }
                }
            });
            st.pending[slot] = Some(PendingRestart { at, _timer: timer });
        }
    }

    fn start_slot(
        shared: &Arc<FleetShared>,
        st: &mut FleetState,
        slot: usize,
    ) {
        // Slots are replaced, never reused.
        if let Some(old) = st.slots[slot].take() {
            old.terminate();
        }
        let url = shared.config.url.url_for(slot);
        debug!(slot, url = %url, "creating slot connection");
        let conn = Connection::new(
            ConnectionConfig {
                url,
                slot,
                stall_threshold: shared.config.stall_threshold,
            },
            shared.transport.clone(),
            shared.events.clone() as Arc<dyn FeedEvents>,
        );
        conn.start();
        st.last_create = Some(Instant::now());
        st.slots[slot] = Some(conn);
    }

    fn health_check(shared: &Arc<FleetShared>) {
        let restart_target = {
            let st = shared.state.lock().unwrap();
            if st.terminated {
                return;
            }
            // Never overlap restarts: if anything is already on its way
            // back, give it time before judging the rest.
            if st.pending.iter().any(Option::is_some) {
                return;
            }
            let conns: Vec<(usize, &Connection)> = st
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.as_ref().map(|c| (i, c)))
                .collect();
            if conns
                .iter()
                .any(|(_, c)| c.state() == ConnectionState::Restarting)
            {
                return;
            }

            // The silent rule reads receives (pongs included); the lag rule
            // reads data messages only, so a replaced slot's fresh
            // created/opened timestamps never make its peers look lagging.
            let fleet_last_receive = conns.iter().filter_map(|(_, c)| c.last_receive()).max();
            let fleet_last_message = conns.iter().filter_map(|(_, c)| c.last_message_at()).max();
            // Laggard: the open slot with the least-recent activity. Slots
            // that are connecting or restarting are not candidates.
            let laggard = conns
                .iter()
                .filter(|(_, c)| c.state() == ConnectionState::Open)
                .filter_map(|(i, c)| c.latest_activity().map(|t| (*i, t)))
                .min_by_key(|&(_, t)| t);

            match laggard {
                Some((slot, activity)) => {
                    let now = Instant::now();
                    let silent = shared.config.all_connections_silent_threshold;
                    match (fleet_last_receive, fleet_last_message) {
                        (Some(received), _) if now.duration_since(received) > silent => {
                            warn!(
                                slot,
                                silent_ms = now.duration_since(received).as_millis() as u64,
                                "entire fleet silent, restarting least-recent slot"
                            );
                            Some(slot)
                        }
                        (_, Some(message))
                            if message.saturating_duration_since(activity)
                                > shared.config.lag_threshold =>
                        {
                            warn!(
                                slot,
                                lag_ms =
                                    message.saturating_duration_since(activity).as_millis() as u64,
                                "slot trails the fleet's freshest message, restarting it"
                            );
                            Some(slot)
                        }
                        _ => None,
                    }
                }
                None => None,
            }
        };

        if let Some(slot) = restart_target {
            Self::restart_slot(shared, slot, Duration::ZERO);
        }
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.terminate();
    }
}
