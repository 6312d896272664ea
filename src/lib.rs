//! Analysis Dispatch: bounded job queueing and dispatch across a pool of
//! single-job analysis workers.

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod queue;
pub mod workers;
