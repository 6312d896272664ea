//! Distributed dispatch across a pool of single-job worker replicas.
//!
//! - [`directory`] resolves the pool's addresses and keeps stable records.
//! - [`client`] talks to a worker over HTTP.
//! - [`dispatcher`] owns admission, the FIFO wait list and busy flags.
//! - [`health`] corrects busy flags from the workers' own reports.

pub mod client;
pub mod directory;
pub mod dispatcher;
pub mod health;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{HttpWorkerClient, WorkerClient, WorkerHealth};
pub use directory::{AddressResolver, DnsResolver, StaticResolver, WorkerDirectory, WorkerPool};
pub use dispatcher::{
    Dispatcher, HealthTransition, JobOutcome, JobReceipt, JobTicket, Placement,
    spawn_discovery_ticker,
};
pub use health::{HealthReconciler, ReconcileReport, spawn_health_reconciler};
