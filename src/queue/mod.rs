//! Single-process admission control.
//!
//! - [`bounded`]: [`BoundedQueue`] caps concurrent tasks, queues the rest FIFO
//!   with capacity and wait-timeout limits, reports position and ETA.

pub mod bounded;

pub use bounded::{Admission, BoundedQueue, Ticket};
