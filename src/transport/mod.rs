//! Transports for the capability server.
//!
//! Both transports share one [`crate::dispatch::Dispatcher`] and therefore
//! produce identical dispatch semantics; they differ only in framing and
//! concurrency:
//!
//! - [`line`] — a single persistent connection over stdin/stdout, strictly
//!   sequential: one request is read, fully dispatched, and answered before
//!   the next is read.
//! - [`http`] — a concurrent endpoint accepting many connections, each able
//!   to issue overlapping requests, with read-only metrics and liveness
//!   routes on the same listener.

pub mod http;
pub mod line;

pub use http::ConcurrentEndpoint;
pub use line::{LineSession, LineTransport};
