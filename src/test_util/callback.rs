use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::time::{self, Instant};
use uuid::Uuid;
use crate::callback::SessionCallback;
use crate::session::Session;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CallbackEvent {
    Incoming {
        remote_addr: SocketAddr,
        local_port: u16,
        payload: Vec<u8>,
    },
    Timeout(SocketAddr),
    Shutdown(SocketAddr),
}

impl CallbackEvent {
    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            CallbackEvent::Incoming { remote_addr, .. } => *remote_addr,
            CallbackEvent::Timeout(remote_addr) => *remote_addr,
            CallbackEvent::Shutdown(remote_addr) => *remote_addr,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallbackEvent::Incoming { .. })
    }
}

/// A [SessionCallback] that records every invocation for later assertions.
///
/// It also tracks how many invocations are running concurrently for each session, so tests
///  can check that callbacks for a session never overlap. Optionally it replies to every
///  datagram, and it can be slowed down to make overlapping invocations likely.
#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<CallbackEvent>>,
    reply: Option<Vec<u8>>,
    incoming_delay: Option<Duration>,
    in_flight: Mutex<FxHashMap<Uuid, usize>>,
    max_concurrency: AtomicUsize,
}

impl RecordingCallback {
    pub fn new() -> RecordingCallback {
        Default::default()
    }

    /// send `reply` back through the session for every incoming datagram
    pub fn with_reply(mut self, reply: impl Into<Vec<u8>>) -> RecordingCallback {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_incoming_delay(mut self, delay: Duration) -> RecordingCallback {
        self.incoming_delay = Some(delay);
        self
    }

    fn locked_events(&self) -> MutexGuard<'_, Vec<CallbackEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.locked_events().clone()
    }

    pub fn incoming_payloads_from(&self, remote_addr: SocketAddr) -> Vec<Vec<u8>> {
        self.locked_events().iter()
            .filter_map(|e| match e {
                CallbackEvent::Incoming { remote_addr: addr, payload, .. } if *addr == remote_addr => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn terminal_events(&self) -> Vec<CallbackEvent> {
        self.locked_events().iter()
            .filter(|e| e.is_terminal())
            .cloned()
            .collect()
    }

    pub fn terminal_events_for(&self, remote_addr: SocketAddr) -> Vec<CallbackEvent> {
        self.locked_events().iter()
            .filter(|e| e.is_terminal() && e.remote_addr() == remote_addr)
            .cloned()
            .collect()
    }

    /// the highest number of overlapping callback invocations seen for any single session
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.load(Ordering::Acquire)
    }

    /// Waits until the recorded events satisfy `condition`, returning false if they did not
    ///  within `timeout`.
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&[CallbackEvent]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(&self.locked_events()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn enter(&self, session: &Session) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let count = in_flight.entry(session.id()).or_default();
        *count += 1;
        self.max_concurrency.fetch_max(*count, Ordering::AcqRel);
    }

    fn leave(&self, session: &Session) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = in_flight.get_mut(&session.id()) {
            *count -= 1;
        }
    }

    fn record(&self, event: CallbackEvent) {
        self.locked_events().push(event);
    }
}

#[async_trait]
impl SessionCallback for RecordingCallback {
    async fn incoming(&self, session: &Arc<Session>, payload: &[u8]) -> anyhow::Result<()> {
        self.enter(session);
        if let Some(delay) = self.incoming_delay {
            time::sleep(delay).await;
        }
        self.record(CallbackEvent::Incoming {
            remote_addr: session.remote_addr(),
            local_port: session.local_port(),
            payload: payload.to_vec(),
        });
        self.leave(session);

        if let Some(reply) = &self.reply {
            session.send(reply).await?;
        }
        Ok(())
    }

    async fn timeout(&self, session: &Arc<Session>) {
        self.enter(session);
        self.record(CallbackEvent::Timeout(session.remote_addr()));
        self.leave(session);
    }

    async fn shutdown(&self, session: &Arc<Session>) {
        self.enter(session);
        self.record(CallbackEvent::Shutdown(session.remote_addr()));
        self.leave(session);
    }
}
