//! Connection-like sessions on top of UDP.
//!
//! Every remote peer is tracked as a [Session](session::Session) with an idle timeout. Callbacks
//!  for a session never run concurrently, and every session gets exactly one terminal callback
//!  (`timeout` or `shutdown`) when it is evicted. Payloads are opaque: there is no framing,
//!  retransmission or encryption.
//!
//! A [Server](server::Server) listens on one or more local ports and creates sessions for new
//!  peers on the fly, a [Client](client::Client) talks to a fixed set of peers from a single
//!  local port.

pub mod callback;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
mod event_loop;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod test_util;
mod worker_pool;
