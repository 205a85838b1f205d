use std::future::Future;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use rustc_hash::{FxHashMap, FxHasher};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio::select;
use tracing::{debug, error, trace, warn};
use crate::callback::SessionCallback;
use crate::endpoint::LocalEndpoint;
use crate::session::Session;
use crate::shutdown::ShutdownCoordinator;

type Shard = RwLock<FxHashMap<SocketAddr, Arc<Session>>>;

/// The sweep task, and the means to stop it between two ticks
struct SweepHandle {
    stop: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

/// Sessions by remote address, partitioned into independently locked shards.
///
/// The receive loop inserts sessions, and only the sweep removes them. Both take the shard's
///  write lock for that. Eviction callbacks run under the session's exclusive lock, but never
///  while a shard lock is held: the session is deactivated first, so a datagram arriving while
///  it is still in the map is dropped by the dispatch path.
///
/// Sweeping visits one shard per tick in round-robin order, bounding the time a timed-out
///  session lingers to `num_shards` ticks. While shutdown is signalled, every tick sweeps all
///  shards and evicts every session regardless of its deadline.
pub struct SessionRegistry {
    shards: Vec<Shard>,
    sweep_cursor: AtomicUsize,
    live_count: AtomicUsize,
    idle_timeout: Duration,
    callback: Arc<dyn SessionCallback>,
    sweep: Mutex<Option<SweepHandle>>,
    is_shut_down: AtomicBool,
}

impl SessionRegistry {
    /// `num_shards` must be positive, which server and client configs validate upfront
    pub(crate) fn new(num_shards: usize, idle_timeout: Duration, callback: Arc<dyn SessionCallback>) -> SessionRegistry {
        assert!(num_shards > 0, "a session registry needs at least one shard");

        SessionRegistry {
            shards: (0..num_shards).map(|_| Default::default()).collect(),
            sweep_cursor: AtomicUsize::new(0),
            live_count: AtomicUsize::new(0),
            idle_timeout,
            callback,
            sweep: Mutex::new(None),
            is_shut_down: AtomicBool::new(false),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Shards are chosen by the address' value, so equal addresses always end up in the same
    ///  shard
    pub fn shard_index(&self, addr: &SocketAddr) -> usize {
        let mut hasher = FxHasher::default();
        addr.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Returns the session for a remote address, creating it if there is none.
    pub async fn resolve(&self, remote_addr: SocketAddr, endpoint: &Arc<LocalEndpoint>) -> Arc<Session> {
        let shard = &self.shards[self.shard_index(&remote_addr)];
        {
            // trying with a read lock first is an optimization for the common case
            if let Some(session) = shard.read().await.get(&remote_addr) {
                return session.clone();
            }
        }

        let mut sessions = shard.write().await;
        // we need to check again now that we have the exclusive lock to avoid racy initialization
        if let Some(session) = sessions.get(&remote_addr) {
            return session.clone();
        }

        let session = Arc::new(Session::new(remote_addr, endpoint, self.idle_timeout));
        sessions.insert(remote_addr, session.clone());
        self.live_count.fetch_add(1, Ordering::AcqRel);
        debug!("created session {}", session);
        session
    }

    /// Adds a session that was created upfront. Returns false if there is a session for the
    ///  same remote address already, leaving the registry unchanged.
    pub async fn register(&self, session: Arc<Session>) -> bool {
        let remote_addr = session.remote_addr();
        let mut sessions = self.shards[self.shard_index(&remote_addr)].write().await;
        if sessions.contains_key(&remote_addr) {
            warn!("there is a session for {:?} already - not registering {}", remote_addr, session);
            return false;
        }

        debug!("registered session {}", session);
        sessions.insert(remote_addr, session);
        self.live_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub async fn get(&self, remote_addr: &SocketAddr) -> Option<Arc<Session>> {
        self.shards[self.shard_index(remote_addr)].read().await
            .get(remote_addr)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.live_count.load(Ordering::Acquire)
    }

    /// Spawns the sweep task, ticking `tick` apart. Calling this more than once, or after
    ///  shutdown, has no effect.
    pub fn start_sweep(self: &Arc<Self>, tick: Duration, coordinator: Arc<ShutdownCoordinator>) {
        let mut sweep = self.sweep.lock().unwrap_or_else(PoisonError::into_inner);
        if sweep.is_some() || self.is_shut_down.load(Ordering::Acquire) {
            debug!("sweep is already running or shut down - not starting it");
            return;
        }

        let (stop, stop_receiver) = watch::channel(false);
        let join_handle = tokio::spawn(Self::do_sweep_loop(Arc::downgrade(self), tick, coordinator, stop_receiver));
        *sweep = Some(SweepHandle { stop, join_handle });
    }

    async fn do_sweep_loop(registry: Weak<SessionRegistry>, tick: Duration, coordinator: Arc<ShutdownCoordinator>, mut stop: watch::Receiver<bool>) {
        let mut ticks = time::interval_at(Instant::now() + tick, tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => {}
                _ = stop.changed() => break,
            }

            // a tick is never interrupted once it started
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.sweep_tick(&coordinator).await;
        }
        trace!("sweep loop terminated");
    }

    /// one tick of the sweep service
    pub(crate) async fn sweep_tick(&self, coordinator: &ShutdownCoordinator) {
        if coordinator.is_shutdown() {
            self.drain_all("shutdown signal").await;
        }
        else {
            let shard_index = self.next_shard_index();
            self.sweep_shard(shard_index).await;
        }
    }

    fn next_shard_index(&self) -> usize {
        let num_shards = self.shards.len();
        self.sweep_cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| Some((cursor + 1) % num_shards))
            .unwrap_or_else(|cursor| cursor)
    }

    /// Evicts all timed-out sessions from one shard
    async fn sweep_shard(&self, shard_index: usize) {
        let shard = &self.shards[shard_index];
        let candidates = shard.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut evicted = Vec::new();
        for session in candidates {
            let is_expired = {
                let _exclusive = session.lock_exclusive().await;
                let is_expired = session.expire_if_timed_out();
                if is_expired {
                    let callback = self.callback.clone();
                    let s = session.clone();
                    run_isolated("timeout", &session, async move { callback.timeout(&s).await }).await;
                }
                is_expired
            };
            if is_expired {
                evicted.push(session);
            }
        }

        if evicted.is_empty() {
            return;
        }

        let mut sessions = shard.write().await;
        for session in evicted {
            // a concurrent drain may have removed it already
            if sessions.get(&session.remote_addr()).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                sessions.remove(&session.remote_addr());
                self.live_count.fetch_sub(1, Ordering::AcqRel);
                debug!("by timeout, removed session {}", session);
            }
        }
    }

    /// Evicts every session from every shard, calling `shutdown` for those that are active
    async fn drain_all(&self, reason: &str) {
        for shard in &self.shards {
            let drained = {
                let mut sessions = shard.write().await;
                let drained = sessions.drain()
                    .map(|(_, session)| session)
                    .collect::<Vec<_>>();
                self.live_count.fetch_sub(drained.len(), Ordering::AcqRel);
                drained
            };

            for session in drained {
                let _exclusive = session.lock_exclusive().await;
                if session.deactivate() {
                    let callback = self.callback.clone();
                    let s = session.clone();
                    run_isolated("shutdown", &session, async move { callback.shutdown(&s).await }).await;
                }
                debug!("by {}, removed session {}", reason, session);
            }
        }
    }

    /// Drains all remaining sessions and stops the sweep task. Every session that is still
    ///  registered gets exactly one `shutdown` callback. Only the first call has an effect.
    pub async fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.drain_all("normal shutdown").await;

        let sweep = self.sweep.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sweep) = sweep {
            let _ = sweep.stop.send(true);
            if let Err(e) = sweep.join_handle.await {
                warn!("sweep task terminated abnormally: {}", e);
            }
        }
        debug!("session registry shut down");
    }
}

/// Runs a terminal callback in a task of its own, so a panicking callback is logged and
///  neither kills the sweep nor leaves the session behind in the registry
async fn run_isolated(callback_name: &str, session: &Session, callback: impl Future<Output = ()> + Send + 'static) {
    if let Err(e) = tokio::spawn(callback).await {
        error!("{} callback for session {} failed: {}", callback_name, session, e);
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(sweep) = self.sweep.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            sweep.join_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::MockSessionCallback;
    use crate::endpoint::MockDatagramSender;
    use crate::test_util::{CallbackEvent, RecordingCallback};
    use async_trait::async_trait;
    use rstest::rstest;

    const IDLE: Duration = Duration::from_millis(100);

    fn peer(n: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, (n >> 8) as u8, n as u8], 4000 + n))
    }

    async fn endpoint() -> Arc<LocalEndpoint> {
        LocalEndpoint::with_sender(Arc::new(MockDatagramSender::new())).await
    }

    #[rstest]
    #[case::one(1)]
    #[case::few(3)]
    #[case::default(10)]
    #[case::many(64)]
    fn test_shard_index_is_value_based(#[case] num_shards: usize) {
        let registry = SessionRegistry::new(num_shards, IDLE, Arc::new(RecordingCallback::new()));
        for n in 0..200 {
            let a = peer(n);
            let b: SocketAddr = a.to_string().parse().unwrap();
            assert_eq!(registry.shard_index(&a), registry.shard_index(&b));
            assert!(registry.shard_index(&a) < num_shards);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_creates_one_session() {
        let registry = Arc::new(SessionRegistry::new(10, IDLE, Arc::new(RecordingCallback::new())));
        let endpoint = endpoint().await;

        let handles = (0..32)
            .map(|_| {
                let registry = registry.clone();
                let endpoint = endpoint.clone();
                tokio::spawn(async move { registry.resolve(peer(1), &endpoint).await })
            })
            .collect::<Vec<_>>();

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        assert_eq!(registry.count(), 1);
        assert!(sessions.iter().all(|s| s.id() == sessions[0].id()));
    }

    #[tokio::test]
    async fn test_resolve_distinct_addresses() {
        let registry = SessionRegistry::new(3, IDLE, Arc::new(RecordingCallback::new()));
        let endpoint = endpoint().await;

        for n in 0..20 {
            let session = registry.resolve(peer(n), &endpoint).await;
            assert_eq!(session.remote_addr(), peer(n));
        }
        assert_eq!(registry.count(), 20);

        let again = registry.resolve(peer(5), &endpoint).await;
        assert_eq!(registry.get(&peer(5)).await.unwrap().id(), again.id());
        assert_eq!(registry.count(), 20);
    }

    #[tokio::test]
    async fn test_register() {
        let registry = SessionRegistry::new(1, IDLE, Arc::new(RecordingCallback::new()));
        let endpoint = endpoint().await;

        let session = Arc::new(Session::new(peer(1), &endpoint, IDLE));
        assert!(registry.register(session.clone()).await);
        assert!(!registry.register(Arc::new(Session::new(peer(1), &endpoint, IDLE))).await);

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(&peer(1)).await.unwrap().id(), session.id());
        assert_eq!(registry.resolve(peer(1), &endpoint).await.id(), session.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_timed_out_session() {
        let mut callback = MockSessionCallback::new();
        callback.expect_timeout()
            .once()
            .withf(|s| s.remote_addr() == peer(1))
            .return_const(());
        callback.expect_shutdown().never();

        let registry = SessionRegistry::new(1, IDLE, Arc::new(callback));
        let coordinator = ShutdownCoordinator::default();
        let endpoint = endpoint().await;

        let idle = registry.resolve(peer(1), &endpoint).await;
        let busy = registry.resolve(peer(2), &endpoint).await;
        assert!(idle.refresh_if_live());
        assert!(busy.refresh_if_live());

        time::advance(Duration::from_millis(60)).await;
        assert!(busy.refresh_if_live());
        time::advance(Duration::from_millis(60)).await;

        registry.sweep_tick(&coordinator).await;

        assert!(!idle.is_active());
        assert!(busy.is_active());
        assert_eq!(registry.count(), 1);
        assert!(registry.get(&peer(1)).await.is_none());

        // evicted sessions are not reported again
        registry.sweep_tick(&coordinator).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_fresh_sessions() {
        let mut callback = MockSessionCallback::new();
        callback.expect_timeout().never();

        let registry = SessionRegistry::new(1, IDLE, Arc::new(callback));
        let coordinator = ShutdownCoordinator::default();
        let endpoint = endpoint().await;

        registry.resolve(peer(1), &endpoint).await;
        time::advance(IDLE * 10).await;
        registry.sweep_tick(&coordinator).await;

        assert_eq!(registry.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_is_round_robin() {
        let callback = Arc::new(RecordingCallback::new());
        let registry = SessionRegistry::new(4, IDLE, callback.clone());
        let coordinator = ShutdownCoordinator::default();
        let endpoint = endpoint().await;

        let sessions = {
            let mut sessions = Vec::new();
            for n in 0..40 {
                let session = registry.resolve(peer(n), &endpoint).await;
                session.refresh_if_live();
                sessions.push(session);
            }
            sessions
        };
        time::advance(IDLE * 2).await;

        for tick in 0..4 {
            registry.sweep_tick(&coordinator).await;
            let expected_remaining = sessions.iter()
                .filter(|s| registry.shard_index(&s.remote_addr()) > tick)
                .count();
            assert_eq!(registry.count(), expected_remaining);
        }
        assert_eq!(callback.terminal_events().len(), 40);
        assert!(callback.terminal_events().iter().all(|e| matches!(e, CallbackEvent::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_escaped_session_is_evicted_as_timeout() {
        let callback = Arc::new(RecordingCallback::new());
        let registry = SessionRegistry::new(1, Duration::from_secs(60), callback.clone());
        let coordinator = ShutdownCoordinator::default();
        let endpoint = endpoint().await;

        let session = registry.resolve(peer(1), &endpoint).await;
        session.refresh_if_live();
        session.escape();
        registry.sweep_tick(&coordinator).await;

        assert_eq!(registry.count(), 0);
        assert_eq!(callback.terminal_events_for(peer(1)), vec![CallbackEvent::Timeout(peer(1))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_drains_all_shards_every_tick() {
        let callback = Arc::new(RecordingCallback::new());
        let registry = SessionRegistry::new(10, IDLE, callback.clone());
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(10));
        let endpoint = endpoint().await;

        for n in 0..30 {
            registry.resolve(peer(n), &endpoint).await;
        }
        coordinator.signal().await;
        registry.sweep_tick(&coordinator).await;

        assert_eq!(registry.count(), 0);
        for n in 0..30 {
            assert_eq!(callback.terminal_events_for(peer(n)), vec![CallbackEvent::Shutdown(peer(n))]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_exactly_once() {
        let mut callback = MockSessionCallback::new();
        callback.expect_shutdown()
            .times(3)
            .return_const(());
        callback.expect_timeout().never();

        let registry = Arc::new(SessionRegistry::new(2, IDLE, Arc::new(callback)));
        let coordinator = Arc::new(ShutdownCoordinator::default());
        registry.start_sweep(Duration::from_millis(50), coordinator);
        let endpoint = endpoint().await;

        for n in 0..3 {
            registry.resolve(peer(n), &endpoint).await;
        }
        registry.shutdown().await;
        registry.shutdown().await;

        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_task_evicts_timed_out_sessions() {
        let callback = Arc::new(RecordingCallback::new());
        let registry = Arc::new(SessionRegistry::new(2, IDLE, callback.clone()));
        registry.start_sweep(Duration::from_millis(50), Arc::new(ShutdownCoordinator::default()));
        let endpoint = endpoint().await;

        let session = registry.resolve(peer(1), &endpoint).await;
        session.refresh_if_live();

        // deadline after 100ms, then at most two ticks of 50ms each until its shard is visited
        time::sleep(Duration::from_millis(250)).await;

        assert_eq!(registry.count(), 0);
        assert_eq!(callback.terminal_events_for(peer(1)), vec![CallbackEvent::Timeout(peer(1))]);

        registry.shutdown().await;
        assert_eq!(callback.terminal_events_for(peer(1)).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sweep_and_shutdown_fire_once() {
        let callback = Arc::new(RecordingCallback::new());
        let registry = Arc::new(SessionRegistry::new(4, Duration::from_millis(1), callback.clone()));
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_millis(1)));
        let endpoint = endpoint().await;

        for n in 0..200 {
            let session = registry.resolve(peer(n), &endpoint).await;
            if n % 2 == 0 {
                session.refresh_if_live();
            }
        }
        time::sleep(Duration::from_millis(5)).await;

        let sweepers = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    for _ in 0..8 {
                        registry.sweep_tick(&coordinator).await;
                    }
                })
            })
            .collect::<Vec<_>>();
        let signaller = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.signal().await })
        };
        registry.shutdown().await;
        for sweeper in sweepers {
            sweeper.await.unwrap();
        }
        signaller.await.unwrap();

        assert_eq!(registry.count(), 0);
        for n in 0..200 {
            let events = callback.terminal_events_for(peer(n));
            assert_eq!(events.len(), 1, "peer {:?} got {:?}", peer(n), events);
        }
    }

    /// panics in the first terminal callback it gets, and counts all terminal callbacks
    #[derive(Default)]
    struct PanicOnFirstTerminalCallback {
        terminal_calls: AtomicUsize,
    }

    impl PanicOnFirstTerminalCallback {
        fn on_terminal(&self) {
            if self.terminal_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("terminal callback failure");
            }
        }
    }

    #[async_trait]
    impl SessionCallback for PanicOnFirstTerminalCallback {
        async fn incoming(&self, _session: &Arc<Session>, _payload: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn timeout(&self, _session: &Arc<Session>) {
            self.on_terminal();
        }

        async fn shutdown(&self, _session: &Arc<Session>) {
            self.on_terminal();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_timeout_callback_does_not_stop_sweep() {
        let callback = Arc::new(PanicOnFirstTerminalCallback::default());
        let registry = Arc::new(SessionRegistry::new(1, IDLE, callback.clone()));
        registry.start_sweep(Duration::from_millis(50), Arc::new(ShutdownCoordinator::default()));
        let endpoint = endpoint().await;

        let first = registry.resolve(peer(1), &endpoint).await;
        first.refresh_if_live();
        time::sleep(Duration::from_millis(300)).await;

        assert!(!first.is_active());
        assert_eq!(registry.count(), 0);
        assert_eq!(callback.terminal_calls.load(Ordering::SeqCst), 1);

        let second = registry.resolve(peer(2), &endpoint).await;
        second.refresh_if_live();
        time::sleep(Duration::from_secs(2)).await;

        assert!(!second.is_active());
        assert_eq!(registry.count(), 0);
        assert_eq!(callback.terminal_calls.load(Ordering::SeqCst), 2);

        registry.shutdown().await;
        assert_eq!(callback.terminal_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_shutdown_callback_does_not_stop_drain() {
        let callback = Arc::new(PanicOnFirstTerminalCallback::default());
        let registry = SessionRegistry::new(2, IDLE, callback.clone());
        let endpoint = endpoint().await;

        let mut sessions = Vec::new();
        for n in 0..5 {
            sessions.push(registry.resolve(peer(n), &endpoint).await);
        }
        registry.shutdown().await;

        assert_eq!(registry.count(), 0);
        assert!(sessions.iter().all(|s| !s.is_active()));
        assert_eq!(callback.terminal_calls.load(Ordering::SeqCst), 5);
    }
}
