//! In-process diagnostics agent.
//!
//! Records (transactions, exceptions, host metrics) are pushed into a
//! fixed-capacity [`RingBuffer`](util::ring_buffer::RingBuffer) and drained
//! by [`flusher::flush_once`], which only removes what the sink accepted.

pub mod capture;
pub mod collectors;
pub mod config;
pub mod flusher;
pub mod models;
pub mod util;
