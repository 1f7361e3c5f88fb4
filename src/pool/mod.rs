//! Pool module - chunked integration workers.

mod chunks;

pub use chunks::*;
