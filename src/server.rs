use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;
use crate::callback::SessionCallback;
use crate::config::ServerConfig;
use crate::endpoint::LocalEndpoint;
use crate::error::Result;
use crate::event_loop::{EventLoop, LoopSettings, SessionLookup};
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::shutdown::ShutdownCoordinator;

/// A UDP server listening on one or more local ports. Every remote address sending to any
///  of them gets a session of its own, created with the first datagram.
pub struct Server {
    event_loop: EventLoop,
    registry: Arc<SessionRegistry>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl Server {
    /// Binds all configured ports. Nothing is received before [Server::start] is called.
    pub async fn new(config: ServerConfig, callback: Arc<dyn SessionCallback>) -> Result<Server> {
        let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown_grace_period));
        Self::with_coordinator(config, callback, coordinator).await
    }

    /// Like [Server::new], but sharing a shutdown coordinator with other servers or clients
    pub async fn with_coordinator(config: ServerConfig, callback: Arc<dyn SessionCallback>, coordinator: Arc<ShutdownCoordinator>) -> Result<Server> {
        config.validate()?;

        let mut endpoints = Vec::with_capacity(config.bind_addrs.len());
        for &addr in &config.bind_addrs {
            endpoints.push(LocalEndpoint::bind(addr, config.separate_send_socket).await?);
        }

        let registry = Arc::new(SessionRegistry::new(config.num_shards, config.idle_timeout, callback.clone()));
        let event_loop = EventLoop::new("server", endpoints, registry.clone(), callback, coordinator.clone(), SessionLookup::CreateOnDemand, LoopSettings {
            read_buffer_size: config.read_buffer_size,
            sweep_tick: config.sweep_tick(),
            worker_pool_size: config.worker_pool_size,
            worker_queue_capacity: config.worker_queue_capacity,
        });
        debug!("created server for {:?}", event_loop.local_addrs());

        Ok(Server {
            event_loop,
            registry,
            coordinator,
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

    pub async fn session(&self, remote_addr: &SocketAddr) -> Option<Arc<Session>> {
        self.registry.get(remote_addr).await
    }

    /// the actual bound addresses, in configuration order
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.event_loop.local_addrs()
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    /// Registers a hook to run once after shutdown was signalled and the grace period passed
    pub fn set_drain_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.coordinator.set_drain_hook(hook)
    }
}
