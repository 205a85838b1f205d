//! Utilities for testing code built on sessions. They are used by this crate's own tests, but
//!  they are also exported for application testing, which is why they are part of the regular
//!  (non-#[cfg(test)]) code.

pub mod callback;

pub use callback::{CallbackEvent, RecordingCallback};
