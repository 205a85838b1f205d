use std::any::{type_name, Any};
use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::MutexGuard as AsyncMutexGuard;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;
use crate::endpoint::LocalEndpoint;
use crate::error::{Result, SessionError};

struct SessionState {
    idle_timeout: Duration,
    deadline: Instant,
    active: bool,
    /// true until the first datagram refreshes the deadline - fresh sessions never time out
    fresh: bool,
    escaped: bool,
    attributes: Option<FxHashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl SessionState {
    /// An escaped session counts as overdue no matter its deadline, but the exemption for
    ///  fresh sessions still applies.
    fn is_timed_out(&self, now: Instant) -> bool {
        !self.fresh && (self.escaped || now > self.deadline)
    }
}

/// A remote peer as seen from one of the local endpoints.
///
/// Sessions are created by the session registry (or upfront, for clients) and live there until
///  the sweep evicts them, either because they timed out or because of a shutdown. Eviction is
///  the only transition from 'active' to 'inactive', and it is never reversed.
///
/// There are two locks per session:
/// * the *exclusive* lock is held for the whole duration of every callback invocation for this
///    session (`incoming`, `timeout` and `shutdown`), serializing them per peer
/// * the state lock protects deadline, flags and attributes. It is held only briefly and
///    never across an `.await`, so callbacks can use the session they are handed
pub struct Session {
    id: Uuid,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    endpoint: Weak<LocalEndpoint>,
    exclusive: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(remote_addr: SocketAddr, endpoint: &Arc<LocalEndpoint>, idle_timeout: Duration) -> Session {
        Session {
            id: Uuid::new_v4(),
            remote_addr,
            local_addr: endpoint.local_addr(),
            endpoint: Arc::downgrade(endpoint),
            exclusive: tokio::sync::Mutex::new(()),
            state: Mutex::new(SessionState {
                idle_timeout,
                deadline: Instant::now() + idle_timeout,
                active: true,
                fresh: true,
                escaped: false,
                attributes: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // user code never runs while this lock is held, so poisoning cannot leave the state
        //  half-updated
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// the address of the local endpoint this session belongs to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    pub fn is_escaped(&self) -> bool {
        self.state().escaped
    }

    pub fn is_fresh(&self) -> bool {
        self.state().fresh
    }

    pub fn is_timed_out(&self) -> bool {
        self.state().is_timed_out(Instant::now())
    }

    pub fn idle_timeout(&self) -> Duration {
        self.state().idle_timeout
    }

    /// Takes effect with the next deadline refresh, i.e. the next incoming datagram.
    pub fn set_idle_timeout(&self, idle_timeout: Duration) {
        self.state().idle_timeout = idle_timeout;
    }

    /// Marks the session for eviction by the next sweep. Sending fails from now on, but the
    ///  session stays active until the sweep's `timeout` callback.
    ///
    /// NB: A session that never received a datagram is exempt from timeouts, and escaping
    ///      does not change that - it is evicted only after the next datagram from its peer.
    pub fn escape(&self) {
        let mut state = self.state();
        if !state.escaped {
            debug!("escaping session {}", self);
            state.escaped = true;
        }
    }

    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        {
            let state = self.state();
            if state.escaped {
                return Err(SessionError::SessionEscaped);
            }
            if !state.active {
                return Err(SessionError::SessionInactive);
            }
        }

        let endpoint = self.endpoint.upgrade()
            .ok_or(SessionError::EndpointClosed)?;
        trace!("sending {} bytes to {:?} from {:?}", payload.len(), self.remote_addr, self.local_addr);
        endpoint.send_to(self.remote_addr, payload).await
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.state().attributes
            .get_or_insert_with(FxHashMap::default)
            .insert(key.into(), Box::new(value));
    }

    /// Returns a copy of the attribute stored under `key`. Reading an attribute as a different
    ///  type than it was stored with is an error rather than an empty result.
    pub fn get_attribute<T: Any + Clone>(&self, key: &str) -> Result<Option<T>> {
        let state = self.state();
        let Some(value) = state.attributes.as_ref().and_then(|attributes| attributes.get(key)) else {
            return Ok(None);
        };

        value.downcast_ref::<T>()
            .map(|v| Some(v.clone()))
            .ok_or_else(|| SessionError::AttributeType {
                key: key.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// returns true if there was an attribute with the given key
    pub fn clear_attribute(&self, key: &str) -> bool {
        self.state().attributes
            .as_mut()
            .map(|attributes| attributes.remove(key).is_some())
            .unwrap_or(false)
    }

    pub(crate) async fn lock_exclusive(&self) -> AsyncMutexGuard<'_, ()> {
        self.exclusive.lock().await
    }

    /// Refreshes the deadline for an incoming datagram. Returns false if the datagram must be
    ///  dropped because the session is inactive or already overdue.
    pub(crate) fn refresh_if_live(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state();
        if !state.active || state.is_timed_out(now) {
            return false;
        }
        state.deadline = now + state.idle_timeout;
        state.fresh = false;
        true
    }

    /// Deactivates the session if it is active and timed out, returning true if it did.
    pub(crate) fn expire_if_timed_out(&self) -> bool {
        let mut state = self.state();
        if state.active && state.is_timed_out(Instant::now()) {
            state.active = false;
            true
        }
        else {
            false
        }
    }

    /// Deactivates the session unconditionally, returning true if it was active before.
    pub(crate) fn deactivate(&self) -> bool {
        let mut state = self.state();
        let was_active = state.active;
        state.active = false;
        was_active
    }
}

impl Display for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?} via local port {})", self.id, self.remote_addr, self.local_port())
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("active", &state.active)
            .field("fresh", &state.fresh)
            .field("escaped", &state.escaped)
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Session {}
