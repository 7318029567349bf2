//! Networking: the byte-level plumbing underneath the broker's connection and queue
//! logic. `buffer` is a generic FIFO byte queue; `frame` is the wire codec; `connection`
//! is the per-socket protocol state machine; `server` owns the `mio` event loop.

pub mod buffer;
pub mod connection;
pub mod frame;
pub mod server;
