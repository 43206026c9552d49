//! Data model shared between stages.
//!
//! Stream descriptors, packets before and after normalization, decoded frames,
//! ports, the in-band events that precede data on a port, and per-leg counters.

pub mod event;
pub mod frame;
pub mod packet;
pub mod port;
pub mod stats;
pub mod stream;
