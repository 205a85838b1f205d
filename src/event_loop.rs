use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use bytes::Bytes;
use tokio::io::ReadBuf;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};
use crate::callback::SessionCallback;
use crate::endpoint::LocalEndpoint;
use crate::error::{Result, SessionError};
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::shutdown::ShutdownCoordinator;
use crate::worker_pool::WorkerPool;

/// How the receive loop maps a sender address to a session
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SessionLookup {
    /// servers: the first datagram from a new address creates its session
    CreateOnDemand,
    /// clients: datagrams from peers that were not registered upfront are dropped
    PreRegisteredOnly,
}

pub(crate) struct LoopSettings {
    pub read_buffer_size: usize,
    pub sweep_tick: Duration,
    pub worker_pool_size: usize,
    pub worker_queue_capacity: usize,
}

enum Lifecycle {
    Created,
    Running {
        stop: watch::Sender<bool>,
        receive_loop: JoinHandle<()>,
        worker_pool: Arc<WorkerPool>,
    },
    Stopped,
}

/// Everything the receive loop task needs, shared with the owning [EventLoop]
struct Dispatcher {
    name: &'static str,
    endpoints: Vec<Arc<LocalEndpoint>>,
    registry: Arc<SessionRegistry>,
    callback: Arc<dyn SessionCallback>,
    coordinator: Arc<ShutdownCoordinator>,
    lookup: SessionLookup,
}

/// The receive side shared by servers and clients: a single task waiting for datagrams on
///  all local endpoints, handing them to a worker pool for dispatch, plus the registry's
///  sweep task.
pub(crate) struct EventLoop {
    dispatcher: Arc<Dispatcher>,
    settings: LoopSettings,
    lifecycle: Mutex<Lifecycle>,
}

impl EventLoop {
    pub fn new(
        name: &'static str,
        endpoints: Vec<Arc<LocalEndpoint>>,
        registry: Arc<SessionRegistry>,
        callback: Arc<dyn SessionCallback>,
        coordinator: Arc<ShutdownCoordinator>,
        lookup: SessionLookup,
        settings: LoopSettings,
    ) -> EventLoop {
        EventLoop {
            dispatcher: Arc::new(Dispatcher {
                name,
                endpoints,
                registry,
                callback,
                coordinator,
                lookup,
            }),
            settings,
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    /// Starts the receive loop, the sweep and the worker pool. Starting a running loop has no
    ///  effect, restarting a loop after shutdown is an error.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Running { .. } => {
                debug!("{} is already running", self.dispatcher.name);
                return Ok(());
            }
            Lifecycle::Stopped => {
                return Err(SessionError::Multiplexer(format!("{} was shut down and cannot be restarted", self.dispatcher.name)));
            }
            Lifecycle::Created => {}
        }

        if let Some(endpoint) = self.dispatcher.endpoints.iter().find(|e| e.is_closed()) {
            return Err(SessionError::Multiplexer(format!("endpoint {:?} is closed", endpoint.local_addr())));
        }

        let worker_pool = Arc::new(WorkerPool::new(self.dispatcher.name, self.settings.worker_pool_size, self.settings.worker_queue_capacity));
        self.dispatcher.registry.start_sweep(self.settings.sweep_tick, self.dispatcher.coordinator.clone());

        let (stop, stop_receiver) = watch::channel(false);
        let receive_loop = tokio::spawn(self.dispatcher.clone()
            .do_receive_loop(worker_pool.clone(), self.settings.read_buffer_size, stop_receiver)
        );

        info!("{} started on {:?}", self.dispatcher.name, self.local_addrs());
        *lifecycle = Lifecycle::Running { stop, receive_loop, worker_pool };
        Ok(())
    }

    /// Stops datagram intake, drains all sessions with a `shutdown` callback each, waits for
    ///  the worker pool to finish and closes the endpoints. Callbacks that are already running
    ///  are not interrupted. Shutting down a loop that is not running has no effect.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let (stop, receive_loop, worker_pool) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { stop, receive_loop, worker_pool } => (stop, receive_loop, worker_pool),
            Lifecycle::Created => {
                debug!("{} was never started - nothing to shut down", self.dispatcher.name);
                *lifecycle = Lifecycle::Created;
                return;
            }
            Lifecycle::Stopped => {
                debug!("{} is already shut down", self.dispatcher.name);
                return;
            }
        };

        info!("shutting down {}", self.dispatcher.name);
        if stop.send(true).is_err() {
            debug!("{} receive loop terminated before shutdown", self.dispatcher.name);
        }
        if let Err(e) = receive_loop.await {
            error!("{} receive loop terminated abnormally: {}", self.dispatcher.name, e);
        }

        self.dispatcher.registry.shutdown().await;
        worker_pool.shutdown().await;

        for endpoint in &self.dispatcher.endpoints {
            endpoint.close();
        }
        info!("{} shut down", self.dispatcher.name);
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.dispatcher.endpoints.iter()
            .map(|e| e.local_addr())
            .collect()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Lifecycle::Running { receive_loop, .. } = self.lifecycle.get_mut() {
            receive_loop.abort();
        }
    }
}

impl Dispatcher {
    async fn do_receive_loop(self: Arc<Self>, worker_pool: Arc<WorkerPool>, read_buffer_size: usize, mut stop: watch::Receiver<bool>) {
        let mut buf = vec![0u8; read_buffer_size];
        let mut next_endpoint = 0;

        loop {
            let (endpoint_index, received) = select! {
                r = poll_fn(|cx| self.poll_receive(cx, &mut buf, &mut next_endpoint)) => r,
                _ = stop.changed() => break,
            };

            let endpoint = &self.endpoints[endpoint_index];
            match received {
                Ok((from, len)) => {
                    trace!("received {} bytes from {:?} on {:?}", len, from, endpoint.local_addr());
                    self.on_datagram(&worker_pool, endpoint, from, Bytes::copy_from_slice(&buf[..len])).await;
                }
                Err(e) => {
                    // e.g. ICMP 'port unreachable' reported for an earlier send on some platforms
                    warn!(error = ?e, "error receiving on {:?} - ignoring", endpoint.local_addr());
                }
            }
        }
        trace!("{} receive loop terminated", self.name);
    }

    /// Polls the endpoints for a datagram, starting after the one that was served last so a
    ///  busy endpoint can not starve the others
    fn poll_receive(&self, cx: &mut Context<'_>, buf: &mut [u8], next_endpoint: &mut usize) -> Poll<(usize, io::Result<(SocketAddr, usize)>)> {
        let num_endpoints = self.endpoints.len();
        for offset in 0..num_endpoints {
            let endpoint_index = (*next_endpoint + offset) % num_endpoints;
            let mut read_buf = ReadBuf::new(buf);

            if let Poll::Ready(result) = self.endpoints[endpoint_index].poll_recv_from(cx, &mut read_buf) {
                *next_endpoint = (endpoint_index + 1) % num_endpoints;
                let len = read_buf.filled().len();
                return Poll::Ready((endpoint_index, result.map(|from| (from, len))));
            }
        }
        Poll::Pending
    }

    async fn on_datagram(&self, worker_pool: &WorkerPool, endpoint: &Arc<LocalEndpoint>, from: SocketAddr, payload: Bytes) {
        let session = match self.lookup {
            SessionLookup::CreateOnDemand => self.registry.resolve(from, endpoint).await,
            SessionLookup::PreRegisteredOnly => match self.registry.get(&from).await {
                Some(session) => session,
                None => {
                    debug!("datagram from unknown peer {:?} - dropping", from);
                    return;
                }
            },
        };

        let span = debug_span!("dispatch", session = %session.id());
        let job = dispatch_incoming(session, payload, self.callback.clone(), self.coordinator.clone());
        if !worker_pool.submit(job.instrument(span)) {
            warn!("dropped datagram from {:?}", from);
        }
    }
}

/// Runs `incoming` for a datagram under the session's exclusive lock. The datagram is dropped
///  if shutdown is in progress, or if the session was evicted or is overdue for eviction.
pub(crate) async fn dispatch_incoming(session: Arc<Session>, payload: Bytes, callback: Arc<dyn SessionCallback>, coordinator: Arc<ShutdownCoordinator>) {
    let _exclusive = session.lock_exclusive().await;

    if coordinator.is_shutdown() {
        debug!("shutdown in progress - dropping datagram for {}", session);
        return;
    }
    if !session.refresh_if_live() {
        debug!("session {} is inactive or overdue - dropping datagram", session);
        return;
    }

    trace!("dispatching {} bytes", payload.len());
    if let Err(e) = callback.incoming(&session, &payload).await {
        error!("error handling datagram for session {}: {:#}", session, e);
    }
}
