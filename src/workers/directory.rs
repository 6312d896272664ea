//! Worker discovery: resolve the pool's addresses and keep a stable,
//! renumbered list of worker records.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::DiscoveryError;
use crate::model::WorkerRecord;

/// Resolves a logical service name to worker addresses (`host:port`).
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Every address currently registered for `service`.
    async fn resolve_all(&self, service: &str) -> Result<Vec<String>, DiscoveryError>;

    /// A single address, used when `resolve_all` yields nothing.
    async fn resolve_one(&self, service: &str) -> Result<Option<String>, DiscoveryError>;
}

/// Host lookup through the system resolver (e.g. Docker's internal DNS).
pub struct DnsResolver {
    port: u16,
}

impl DnsResolver {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve_all(&self, service: &str) -> Result<Vec<String>, DiscoveryError> {
        let addrs = tokio::net::lookup_host((service, self.port))
            .await
            .map_err(|e| DiscoveryError::Resolve {
                service: service.to_string(),
                reason: e.to_string(),
            })?;

        Ok(addrs
            .filter(|addr| addr.is_ipv4())
            .map(|addr| addr.to_string())
            .collect())
    }

    async fn resolve_one(&self, service: &str) -> Result<Option<String>, DiscoveryError> {
        let mut addrs = tokio::net::lookup_host((service, self.port))
            .await
            .map_err(|e| DiscoveryError::Resolve {
                service: service.to_string(),
                reason: e.to_string(),
            })?;

        Ok(addrs.next().map(|addr| addr.to_string()))
    }
}

/// A fixed address list, for deployments without service DNS.
pub struct StaticResolver {
    addresses: Vec<String>,
}

impl StaticResolver {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve_all(&self, _service: &str) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.addresses.clone())
    }

    async fn resolve_one(&self, _service: &str) -> Result<Option<String>, DiscoveryError> {
        Ok(self.addresses.first().cloned())
    }
}

/// What changed in one discovery pass.
#[derive(Debug, Default)]
pub struct PoolChange {
    pub added: Vec<String>,
    /// Records dropped, with the busy state they had.
    pub removed: Vec<WorkerRecord>,
}

/// The currently known workers, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    records: Vec<WorkerRecord>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile with a fresh address set: keep known records (and their busy
    /// state) in place, append new ones idle, drop missing ones, then
    /// renumber 1..N.
    pub fn apply(&mut self, discovered: &[String]) -> PoolChange {
        let mut change = PoolChange::default();
        let present: HashSet<&str> = discovered.iter().map(String::as_str).collect();

        let mut kept = Vec::with_capacity(discovered.len());
        for record in self.records.drain(..) {
            if present.contains(record.address.as_str()) {
                kept.push(record);
            } else {
                change.removed.push(record);
            }
        }

        for address in discovered {
            if !kept.iter().any(|r| &r.address == address) {
                kept.push(WorkerRecord::idle(0, address.clone()));
                change.added.push(address.clone());
            }
        }

        for (i, record) in kept.iter_mut().enumerate() {
            record.id = i + 1;
        }
        self.records = kept;
        change
    }

    pub fn records(&self) -> &[WorkerRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn busy_count(&self) -> usize {
        self.records.iter().filter(|r| r.busy).count()
    }

    /// First idle worker in directory order.
    pub fn first_idle_mut(&mut self) -> Option<&mut WorkerRecord> {
        self.records.iter_mut().find(|r| !r.busy)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut WorkerRecord> {
        self.records.iter_mut().find(|r| r.address == address)
    }
}

/// Turns a service name into the pool's address list, tolerating failures.
pub struct WorkerDirectory {
    service_name: String,
    resolver: Arc<dyn AddressResolver>,
}

impl WorkerDirectory {
    pub fn new(service_name: impl Into<String>, resolver: Arc<dyn AddressResolver>) -> Self {
        Self {
            service_name: service_name.into(),
            resolver,
        }
    }

    /// Static list when `WORKER_ADDRESSES` is set, DNS otherwise.
    pub fn from_config(config: &DispatchConfig) -> Self {
        let resolver: Arc<dyn AddressResolver> = if config.static_addresses.is_empty() {
            Arc::new(DnsResolver::new(config.worker_port))
        } else {
            Arc::new(StaticResolver::new(config.static_addresses.clone()))
        };
        Self::new(config.service_name.clone(), resolver)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Resolve the pool. Falls back to a single lookup when the full lookup
    /// fails or is empty. `None` means both failed and the caller must keep
    /// its previous list.
    pub async fn discover(&self) -> Option<Vec<String>> {
        let all = match self.resolver.resolve_all(&self.service_name).await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(service = %self.service_name, error = %e, "Full worker lookup failed");
                Vec::new()
            }
        };

        if !all.is_empty() {
            let mut seen = HashSet::new();
            return Some(
                all.into_iter()
                    .filter(|addr| seen.insert(addr.clone()))
                    .collect(),
            );
        }

        match self.resolver.resolve_one(&self.service_name).await {
            Ok(Some(addr)) => Some(vec![addr]),
            Ok(None) => None,
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "Worker discovery failed");
                None
            }
        }
    }

    /// Apply a discovery result to `pool`, logging what changed. A failed
    /// discovery (`None`) leaves the pool untouched.
    pub fn apply(&self, pool: &mut WorkerPool, discovered: Option<Vec<String>>) -> PoolChange {
        let Some(addresses) = discovered else {
            return PoolChange::default();
        };

        let change = pool.apply(&addresses);
        for address in &change.added {
            info!(service = %self.service_name, address = %address, "Discovered worker");
        }
        for record in &change.removed {
            if record.busy {
                warn!(
                    address = %record.address,
                    job_id = record.current_job.as_ref().and_then(|j| j.job_id()).unwrap_or("-"),
                    "Busy worker removed, in-flight job abandoned"
                );
            } else {
                info!(address = %record.address, "Worker removed");
            }
        }
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::model::{AnalysisMode, AnalysisRequest, CurrentJob, Job};

    /// Resolver whose answers can be swapped between passes.
    struct FakeResolver {
        all: Mutex<Result<Vec<String>, String>>,
        one: Mutex<Result<Option<String>, String>>,
    }

    impl FakeResolver {
        fn new(all: Result<Vec<&str>, &str>, one: Result<Option<&str>, &str>) -> Self {
            Self {
                all: Mutex::new(
                    all.map(|v| v.into_iter().map(String::from).collect())
                        .map_err(String::from),
                ),
                one: Mutex::new(one.map(|o| o.map(String::from)).map_err(String::from)),
            }
        }
    }

    #[async_trait]
    impl AddressResolver for FakeResolver {
        async fn resolve_all(&self, service: &str) -> Result<Vec<String>, DiscoveryError> {
            self.all
                .lock()
                .unwrap()
                .clone()
                .map_err(|reason| DiscoveryError::Resolve {
                    service: service.to_string(),
                    reason,
                })
        }

        async fn resolve_one(&self, service: &str) -> Result<Option<String>, DiscoveryError> {
            self.one
                .lock()
                .unwrap()
                .clone()
                .map_err(|reason| DiscoveryError::Resolve {
                    service: service.to_string(),
                    reason,
                })
        }
    }

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn apply_appends_and_numbers_in_discovery_order() {
        let mut pool = WorkerPool::new();
        let change = pool.apply(&addrs(&["10.0.0.2:8080", "10.0.0.1:8080"]));

        assert_eq!(change.added.len(), 2);
        let ids: Vec<_> = pool.records().iter().map(|r| (r.id, r.address.as_str())).collect();
        assert_eq!(ids, vec![(1, "10.0.0.2:8080"), (2, "10.0.0.1:8080")]);
        assert!(pool.records().iter().all(|r| !r.busy));
    }

    #[test]
    fn apply_is_idempotent_and_preserves_busy_state() {
        let mut pool = WorkerPool::new();
        let set = addrs(&["a:1", "b:1", "c:1"]);
        pool.apply(&set);

        let job = Job::new(AnalysisRequest::new("https://example.com", AnalysisMode::Desktop));
        let worker = pool.get_mut("b:1").unwrap();
        worker.busy = true;
        worker.current_job = Some(CurrentJob::Dispatched(job.summary()));

        let before = pool.records().to_vec();
        let change = pool.apply(&set);

        assert!(change.added.is_empty());
        assert!(change.removed.is_empty());
        assert_eq!(pool.records(), before.as_slice());
    }

    #[test]
    fn apply_removes_missing_and_renumbers() {
        let mut pool = WorkerPool::new();
        pool.apply(&addrs(&["a:1", "b:1", "c:1"]));
        pool.get_mut("b:1").unwrap().busy = true;

        let change = pool.apply(&addrs(&["c:1", "a:1", "d:1"]));

        assert_eq!(change.removed.len(), 1);
        assert_eq!(change.removed[0].address, "b:1");
        assert!(change.removed[0].busy);
        assert_eq!(change.added, vec!["d:1".to_string()]);

        let ids: Vec<_> = pool.records().iter().map(|r| (r.id, r.address.as_str())).collect();
        assert_eq!(ids, vec![(1, "a:1"), (2, "c:1"), (3, "d:1")]);
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn discover_deduplicates() {
        let resolver = FakeResolver::new(Ok(vec!["a:1", "b:1", "a:1"]), Ok(None));
        let directory = WorkerDirectory::new("worker", Arc::new(resolver));
        assert_eq!(directory.discover().await, Some(addrs(&["a:1", "b:1"])));
    }

    #[tokio::test]
    async fn discover_falls_back_to_single_lookup() {
        let resolver = FakeResolver::new(Err("SERVFAIL"), Ok(Some("a:1")));
        let directory = WorkerDirectory::new("worker", Arc::new(resolver));
        assert_eq!(directory.discover().await, Some(addrs(&["a:1"])));
    }

    #[tokio::test]
    async fn failed_discovery_keeps_previous_pool() {
        let resolver = Arc::new(FakeResolver::new(Ok(vec!["a:1", "b:1"]), Ok(None)));
        let directory = WorkerDirectory::new("worker", resolver.clone());
        let mut pool = WorkerPool::new();

        let found = directory.discover().await;
        directory.apply(&mut pool, found);
        assert_eq!(pool.len(), 2);

        *resolver.all.lock().unwrap() = Err("timeout".to_string());
        *resolver.one.lock().unwrap() = Err("timeout".to_string());
        let found = directory.discover().await;
        assert!(found.is_none());

        let change = directory.apply(&mut pool, found);
        assert!(change.removed.is_empty());
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn static_resolver_returns_configured_list() {
        let config = DispatchConfig {
            static_addresses: addrs(&["w1:8080", "w2:8080"]),
            ..DispatchConfig::default()
        };
        let directory = WorkerDirectory::from_config(&config);
        assert_eq!(directory.discover().await, Some(addrs(&["w1:8080", "w2:8080"])));
    }

    #[tokio::test]
    async fn dns_resolver_handles_ip_literals() {
        let resolver = DnsResolver::new(9000);
        let all = resolver.resolve_all("127.0.0.1").await.unwrap();
        assert_eq!(all, vec!["127.0.0.1:9000".to_string()]);
        let one = resolver.resolve_one("127.0.0.1").await.unwrap();
        assert_eq!(one.as_deref(), Some("127.0.0.1:9000"));
    }
}
