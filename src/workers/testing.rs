//! In-process worker fakes shared by the dispatcher and reconciler tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use super::client::{WorkerClient, WorkerHealth};
use super::directory::{AddressResolver, StaticResolver, WorkerDirectory};
use super::dispatcher::Dispatcher;
use crate::config::DispatchConfig;
use crate::error::{DiscoveryError, WorkerCallError};
use crate::model::AnalysisRequest;

type CallResult = Result<Value, WorkerCallError>;
type HealthResult = Result<WorkerHealth, WorkerCallError>;

#[derive(Default)]
struct Inner {
    gates: HashMap<String, oneshot::Receiver<CallResult>>,
    health: HashMap<String, HealthResult>,
    health_gates: HashMap<String, (oneshot::Sender<()>, oneshot::Receiver<HealthResult>)>,
    calls: Vec<(String, String)>,
    in_flight: usize,
    peak: usize,
}

/// Scriptable [`WorkerClient`]. Calls for a gated target block until the gate
/// is fired; others answer after `delay` with `{"url": target}`.
#[derive(Clone, Default)]
pub struct FakeWorkers {
    inner: Arc<Mutex<Inner>>,
    delay: Duration,
}

impl FakeWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Hold the next call for `target` until the returned sender fires.
    /// Dropping the sender fails the call with a transport error.
    pub fn gate(&self, target: &str) -> oneshot::Sender<CallResult> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().gates.insert(target.to_string(), rx);
        tx
    }

    pub fn set_health(&self, address: &str, health: HealthResult) {
        self.inner
            .lock()
            .unwrap()
            .health
            .insert(address.to_string(), health);
    }

    /// Hold the next health probe of `address`. The first receiver fires once
    /// the probe is in flight; the probe answers with what the sender sends.
    pub fn gate_health(
        &self,
        address: &str,
    ) -> (oneshot::Receiver<()>, oneshot::Sender<HealthResult>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .lock()
            .unwrap()
            .health_gates
            .insert(address.to_string(), (started_tx, reply_rx));
        (started_rx, reply_tx)
    }

    /// `(address, target)` of every analyze call, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.inner.lock().unwrap().peak
    }
}

#[async_trait]
impl WorkerClient for FakeWorkers {
    async fn analyze(
        &self,
        address: &str,
        request: &AnalysisRequest,
        _timeout: Duration,
    ) -> Result<Value, WorkerCallError> {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .calls
                .push((address.to_string(), request.target.clone()));
            inner.in_flight += 1;
            inner.peak = inner.peak.max(inner.in_flight);
            inner.gates.remove(&request.target)
        };

        let result = match gate {
            Some(rx) => rx.await.unwrap_or_else(|_| {
                Err(WorkerCallError::Transport {
                    address: address.to_string(),
                    reason: "gate dropped".to_string(),
                })
            }),
            None => {
                tokio::time::sleep(self.delay).await;
                Ok(json!({ "url": request.target }))
            }
        };

        self.inner.lock().unwrap().in_flight -= 1;
        result
    }

    async fn health(
        &self,
        address: &str,
        _timeout: Duration,
    ) -> Result<WorkerHealth, WorkerCallError> {
        let gate = self.inner.lock().unwrap().health_gates.remove(address);
        if let Some((started, reply)) = gate {
            let _ = started.send(());
            return reply.await.unwrap_or_else(|_| {
                Err(WorkerCallError::Transport {
                    address: address.to_string(),
                    reason: "gate dropped".to_string(),
                })
            });
        }

        self.inner
            .lock()
            .unwrap()
            .health
            .get(address)
            .cloned()
            .unwrap_or_else(|| {
                Err(WorkerCallError::Transport {
                    address: address.to_string(),
                    reason: "connection refused".to_string(),
                })
            })
    }
}

/// Address list that tests can replace between discovery passes.
#[derive(Clone, Default)]
pub struct SwappableResolver {
    addresses: Arc<Mutex<Vec<String>>>,
}

impl SwappableResolver {
    pub fn new(addresses: &[&str]) -> Self {
        let resolver = Self::default();
        resolver.set(addresses);
        resolver
    }

    pub fn set(&self, addresses: &[&str]) {
        *self.addresses.lock().unwrap() = addresses.iter().map(|a| a.to_string()).collect();
    }
}

#[async_trait]
impl AddressResolver for SwappableResolver {
    async fn resolve_all(&self, _service: &str) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.addresses.lock().unwrap().clone())
    }

    async fn resolve_one(&self, _service: &str) -> Result<Option<String>, DiscoveryError> {
        Ok(self.addresses.lock().unwrap().first().cloned())
    }
}

/// A dispatcher over a fixed address list, backed by `client`.
pub fn dispatcher_with(
    config: DispatchConfig,
    addresses: &[&str],
    client: FakeWorkers,
) -> Arc<Dispatcher> {
    let resolver = StaticResolver::new(addresses.iter().map(|a| a.to_string()).collect());
    dispatcher_over(config, Arc::new(resolver), client)
}

/// A dispatcher whose pool comes from `resolver`, backed by `client`.
pub fn dispatcher_over(
    config: DispatchConfig,
    resolver: Arc<dyn AddressResolver>,
    client: FakeWorkers,
) -> Arc<Dispatcher> {
    let directory = WorkerDirectory::new("worker", resolver);
    Dispatcher::new(config, directory, Arc::new(client))
}
