//! The TCP transport: connection control blocks, the segment-arrives event
//! processor, wire encode/decode, the application socket API, and the
//! background timer thread. Everything here is reached through
//! [`crate::NetStack`] and [`api::Socket`]; nothing in this module touches
//! the device directly.

pub mod api;
pub mod cb;
pub mod segment;
pub mod timer;
pub mod types;

pub use api::Socket;
pub use types::{Dual, Quad, State};
