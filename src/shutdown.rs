use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};
use crate::config::DEFAULT_SHUTDOWN_GRACE_PERIOD;

type DrainHook = Box<dyn FnOnce() + Send>;

/// A shutdown flag shared by the sweep service and the dispatch path, plus an application hook
///  that runs once after the flag was set and the grace period passed.
///
/// While the flag is set, every sweep tick evicts *all* sessions with a `shutdown` callback,
///  and incoming datagrams are dropped. Nothing is installed implicitly: wiring OS signals is
///  up to the application, e.g. via [ShutdownCoordinator::signal_on_ctrl_c].
pub struct ShutdownCoordinator {
    in_shutdown: AtomicBool,
    grace_period: Duration,
    drain_hook: Mutex<Option<DrainHook>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        ShutdownCoordinator::new(DEFAULT_SHUTDOWN_GRACE_PERIOD)
    }
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> ShutdownCoordinator {
        ShutdownCoordinator {
            in_shutdown: AtomicBool::new(false),
            grace_period,
            drain_hook: Mutex::new(None),
        }
    }

    /// Replaces a previously set hook. Setting a hook after `signal` has run has no effect.
    pub fn set_drain_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let mut drain_hook = self.drain_hook.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_shutdown() {
            warn!("shutdown is already in progress - ignoring drain hook");
            return;
        }
        *drain_hook = Some(Box::new(hook));
    }

    pub fn is_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::Acquire)
    }

    /// Sets the shutdown flag, waits for the grace period so in-flight sweeps and dispatches
    ///  observe it, and then runs the drain hook. Only the first call does anything.
    pub async fn signal(&self) {
        let hook = {
            let mut drain_hook = self.drain_hook.lock().unwrap_or_else(PoisonError::into_inner);
            if self.in_shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            drain_hook.take()
        };
        info!("start shutdown handler");

        time::sleep(self.grace_period).await;

        if let Some(hook) = hook {
            hook();
        }
        info!("end shutdown handler");
    }

    /// Waits for Ctrl-C (SIGINT) and then signals shutdown
    pub async fn signal_on_ctrl_c(self: Arc<Self>) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl-C");
        self.signal().await;
        Ok(())
    }
}
