use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::debug;
use crate::session::Session;

/// Application hooks for session events. All invocations for a given session are mutually
///  exclusive, and a session gets at most one terminal callback (`timeout` or `shutdown`),
///  after which no further `incoming` is dispatched for it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionCallback: Send + Sync + 'static {
    /// A datagram arrived for the session. Errors are logged and affect only this datagram.
    async fn incoming(&self, session: &Arc<Session>, payload: &[u8]) -> anyhow::Result<()>;

    async fn timeout(&self, session: &Arc<Session>) {
        debug!("session timed out: {}", session);
    }

    async fn shutdown(&self, session: &Arc<Session>) {
        debug!("session evicted by shutdown: {}", session);
    }
}
