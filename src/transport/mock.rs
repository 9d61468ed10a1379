//! Scripted in-memory transport for unit tests.
//!
//! Tests drive sockets by emitting [`SocketEvent`]s into the most recent
//! connection for a URL, and can gate or fail connect attempts. Pings are
//! answered with pongs by default so keepalive traffic holds off the
//! per-connection stall detector unless a test turns that off.

use super::{BoxedSocket, SocketEvent, SocketSink, SocketStream, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;

#[derive(Default)]
struct MockInner {
    connects: Vec<(String, Instant)>,
    taps: HashMap<String, Vec<mpsc::UnboundedSender<SocketEvent>>>,
    sent: HashMap<String, Vec<String>>,
    closes: Vec<(String, u16, String)>,
    ping_count: usize,
    fail_connects: HashMap<String, usize>,
    auto_pong: bool,
    gated: bool,
}

pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
    gate: Semaphore,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(MockInner {
                auto_pong: true,
                ..Default::default()
            })),
            gate: Semaphore::new(0),
        })
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.lock().unwrap().auto_pong = enabled;
    }

    /// Makes subsequent connect attempts block until released.
    pub fn hold_connects(&self) {
        self.inner.lock().unwrap().gated = true;
    }

    pub fn release_connects(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Fails the next `n` connect attempts for `url`.
    pub fn fail_next_connects(&self, url: &str, n: usize) {
        self.inner
            .lock()
            .unwrap()
            .fail_connects
            .insert(url.to_string(), n);
    }

    pub fn connect_count(&self, url: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .connects
            .iter()
            .filter(|(u, _)| u == url)
            .count()
    }

    pub fn connect_times(&self, url: &str) -> Vec<Instant> {
        self.inner
            .lock()
            .unwrap()
            .connects
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, t)| *t)
            .collect()
    }

    /// Delivers `event` to the most recent live socket for `url`.
    pub fn emit(&self, url: &str, event: SocketEvent) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .taps
            .get(url)
            .and_then(|taps| taps.last())
            .is_some_and(|tap| tap.send(event).is_ok())
    }

    pub fn emit_message(&self, url: &str, text: &str) -> bool {
        self.emit(url, SocketEvent::Message(text.to_string()))
    }

    pub fn sent_texts(&self, url: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    pub fn closes(&self) -> Vec<(String, u16, String)> {
        self.inner.lock().unwrap().closes.clone()
    }

    pub fn ping_count(&self) -> usize {
        self.inner.lock().unwrap().ping_count
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<BoxedSocket, TransportError> {
        let gated = self.inner.lock().unwrap().gated;
        if gated {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| TransportError::Connect("gate closed".to_string()))?;
            permit.forget();
        }

        let mut inner = self.inner.lock().unwrap();
        inner.connects.push((url.to_string(), Instant::now()));
        if let Some(n) = inner.fail_connects.get_mut(url) {
            if *n > 0 {
                *n -= 1;
                return Err(TransportError::Connect("scripted failure".to_string()));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.taps.entry(url.to_string()).or_default().push(tx.clone());
        Ok((
            Box::new(MockSink {
                url: url.to_string(),
                shared: self.inner.clone(),
                events: tx,
            }),
            Box::new(MockStream { rx }),
        ))
    }
}

struct MockSink {
    url: String,
    shared: Arc<Mutex<MockInner>>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

#[async_trait]
impl SocketSink for MockSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.shared
            .lock()
            .unwrap()
            .sent
            .entry(self.url.clone())
            .or_default()
            .push(text);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        let auto_pong = {
            let mut inner = self.shared.lock().unwrap();
            inner.ping_count += 1;
            inner.auto_pong
        };
        if auto_pong {
            let _ = self.events.send(SocketEvent::Pong);
        }
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.shared
            .lock()
            .unwrap()
            .closes
            .push((self.url.clone(), code, reason.to_string()));
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
impl SocketStream for MockStream {
    async fn next_event(&mut self) -> Option<SocketEvent> {
        self.rx.recv().await
    }
}
