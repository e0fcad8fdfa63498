//! Ephemeral port leasing for workers.
//!
//! Availability is probed with a transient loopback bind; leased ports are
//! tracked in memory so two workers never receive the same port even if
//! neither has bound it yet.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::config::PortsConfig;

/// Errors from port allocation.
#[derive(Debug, Error)]
pub enum PortError {
    #[error(
        "could not allocate {requested} ports; only {allocated} available in range {range_start}-{range_end}"
    )]
    Exhausted {
        requested: usize,
        allocated: usize,
        range_start: u16,
        range_end: u16,
    },
}

/// Allocates and tracks ephemeral ports within a configured range.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    allocated: Arc<Mutex<HashSet<u16>>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(&PortsConfig::default())
    }
}

impl PortAllocator {
    pub fn new(config: &PortsConfig) -> Self {
        Self {
            range_start: config.range_start,
            range_end: config.range_end,
            allocated: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether `port` can be leased: not already leased, and a transient
    /// loopback bind succeeds.
    pub fn is_available(&self, port: u16) -> bool {
        if self.allocated.lock().contains(&port) {
            return false;
        }
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Allocate `count` ports.
    ///
    /// Candidates are visited in shuffled order to avoid collisions between
    /// concurrent allocators; the search gives up after `10 * count`
    /// candidate probes.
    pub fn allocate(&self, count: usize) -> Result<Vec<u16>, PortError> {
        let mut allocated = Vec::with_capacity(count);
        let max_attempts = count.saturating_mul(10);

        let mut candidates: Vec<u16> = (self.range_start..=self.range_end).collect();
        candidates.shuffle(&mut rand::rng());

        for (attempts, port) in candidates.into_iter().enumerate() {
            if allocated.len() >= count {
                break;
            }
            if self.is_available(port) {
                self.allocated.lock().insert(port);
                allocated.push(port);
                tracing::debug!(port, "allocated port");
            }
            if attempts + 1 >= max_attempts {
                break;
            }
        }

        if allocated.len() < count {
            // Return leased candidates before failing.
            let mut leased = self.allocated.lock();
            for port in &allocated {
                leased.remove(port);
            }
            return Err(PortError::Exhausted {
                requested: count,
                allocated: allocated.len(),
                range_start: self.range_start,
                range_end: self.range_end,
            });
        }

        tracing::info!(count, ports = ?allocated, "allocated ports");
        Ok(allocated)
    }

    /// Allocate a single port.
    pub fn allocate_one(&self) -> Result<u16, PortError> {
        Ok(self.allocate(1)?[0])
    }

    /// Release a leased port. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        if self.allocated.lock().remove(&port) {
            tracing::debug!(port, "released port");
        }
    }

    /// Release every leased port.
    pub fn release_all(&self) {
        let mut leased = self.allocated.lock();
        let count = leased.len();
        leased.clear();
        tracing::info!(count, "released all ports");
    }

    /// Snapshot of currently leased ports.
    pub fn get_allocated(&self) -> HashSet<u16> {
        self.allocated.lock().clone()
    }

    /// Allocate `ports_per_worker` ports for a worker.
    pub fn allocate_for_worker(
        &self,
        worker_id: u32,
        ports_per_worker: usize,
    ) -> Result<Vec<u16>, PortError> {
        let ports = self.allocate(ports_per_worker)?;
        tracing::info!(worker_id, ports = ?ports, "worker ports allocated");
        Ok(ports)
    }

    /// Release a worker's ports.
    pub fn release_for_worker(&self, ports: &[u16], worker_id: u32) {
        for port in ports {
            self.release(*port);
        }
        tracing::info!(worker_id, ports = ?ports, "worker ports released");
    }

    /// Estimated number of ports still available.
    pub fn available_count(&self) -> usize {
        let total = usize::from(self.range_end - self.range_start) + 1;
        total - self.allocated.lock().len()
    }

    // --- Async variants: bind probes offloaded to blocking threads ---

    /// Async [`Self::allocate_one`].
    pub async fn allocate_one_async(&self) -> Result<u16, PortError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.allocate_one())
            .await
            .unwrap_or_else(|_| {
                Err(PortError::Exhausted {
                    requested: 1,
                    allocated: 0,
                    range_start: 0,
                    range_end: 0,
                })
            })
    }

    /// Allocate `count` ports concurrently via a parallel gather.
    pub async fn allocate_many_async(&self, count: usize) -> Result<Vec<u16>, PortError> {
        let probes = (0..count).map(|_| self.allocate_one_async());
        let results = futures::future::join_all(probes).await;
        let mut ports = Vec::with_capacity(count);
        for result in results {
            match result {
                Ok(port) => ports.push(port),
                Err(e) => {
                    self.release_for_worker(&ports, u32::MAX);
                    return Err(e);
                }
            }
        }
        Ok(ports)
    }

    /// Async [`Self::allocate_for_worker`].
    pub async fn allocate_for_worker_async(
        &self,
        worker_id: u32,
        ports_per_worker: usize,
    ) -> Result<Vec<u16>, PortError> {
        let ports = if ports_per_worker == 1 {
            vec![self.allocate_one_async().await?]
        } else {
            self.allocate_many_async(ports_per_worker).await?
        };
        tracing::info!(worker_id, ports = ?ports, "worker ports allocated (async)");
        Ok(ports)
    }
}
