use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use crate::callback::SessionCallback;
use crate::config::ClientConfig;
use crate::endpoint::LocalEndpoint;
use crate::error::{Result, SessionError};
use crate::event_loop::{EventLoop, LoopSettings, SessionLookup};
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::shutdown::ShutdownCoordinator;

/// A UDP client talking to a fixed set of peers from a single local port.
///
/// There is one session per peer, created upfront. Datagrams from any other address are
///  dropped rather than creating sessions. Evicted sessions are not replaced: once a peer's
///  session timed out, the client ignores that peer.
pub struct Client {
    event_loop: EventLoop,
    registry: Arc<SessionRegistry>,
    coordinator: Arc<ShutdownCoordinator>,
    local_addr: SocketAddr,
    sessions: Vec<Arc<Session>>,
}

impl Client {
    pub async fn new(config: ClientConfig, callback: Arc<dyn SessionCallback>) -> Result<Client> {
        let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown_grace_period));
        Self::with_coordinator(config, callback, coordinator).await
    }

    pub async fn with_coordinator(config: ClientConfig, callback: Arc<dyn SessionCallback>, coordinator: Arc<ShutdownCoordinator>) -> Result<Client> {
        config.validate()?;

        let endpoint = LocalEndpoint::bind(config.self_addr, false).await?;
        let registry = Arc::new(SessionRegistry::new(1, config.idle_timeout, callback.clone()));

        let mut sessions = Vec::with_capacity(config.peer_addrs.len());
        for &peer_addr in &config.peer_addrs {
            let session = Arc::new(Session::new(peer_addr, &endpoint, config.idle_timeout));
            if registry.register(session.clone()).await {
                sessions.push(session);
            }
            else {
                warn!("peer {:?} is configured more than once - ignoring duplicate", peer_addr);
            }
        }

        let local_addr = endpoint.local_addr();
        let event_loop = EventLoop::new("client", vec![endpoint], registry.clone(), callback, coordinator.clone(), SessionLookup::PreRegisteredOnly, LoopSettings {
            read_buffer_size: config.read_buffer_size,
            sweep_tick: config.sweep_tick(),
            worker_pool_size: config.worker_pool_size,
            worker_queue_capacity: config.worker_queue_capacity,
        });
        debug!("created client on {:?} for peers {:?}", local_addr, config.peer_addrs);

        Ok(Client {
            event_loop,
            registry,
            coordinator,
            local_addr,
            sessions,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.event_loop.start().await
    }

    pub async fn shutdown(&self) {
        self.event_loop.shutdown().await
    }

    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The session for a configured peer. It stays available after eviction, but sending
    ///  through it fails from then on.
    pub fn session(&self, peer_addr: &SocketAddr) -> Option<&Arc<Session>> {
        self.sessions.iter()
            .find(|s| &s.remote_addr() == peer_addr)
    }

    /// all sessions, in the order the peers were configured
    pub fn sessions(&self) -> &[Arc<Session>] {
        &self.sessions
    }

    pub async fn send_to(&self, peer_addr: &SocketAddr, payload: &[u8]) -> Result<()> {
        self.session(peer_addr)
            .ok_or(SessionError::UnknownPeer(*peer_addr))?
            .send(payload).await
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    pub fn set_drain_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.coordinator.set_drain_hook(hook)
    }
}
