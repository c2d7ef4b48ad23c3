use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
#[cfg(test)]
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::LeaseConfig;
use crate::error::LeaseError;
use crate::handle::{LeaseEvent, LeaseHandle};
use crate::memory::MemoryStore;
use crate::scheduler;
use crate::store::LeaseStore;
use crate::worker::{Command, Worker};

/// Names with an unreleased handle in this process.
#[derive(Default)]
struct Registry {
    /// lease name -> handle id
    active: HashMap<String, u64>,
    next_id: u64,
}

/// State reachable from both the manager and its handles.
pub(crate) struct Shared {
    owner_id: String,
    registry: Mutex<Registry>,
    queue: mpsc::UnboundedSender<Command>,
}

impl Shared {
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, command: Command) {
        if self.queue.send(command).is_err() {
            debug!("Lease work queue for {} is closed", self.owner_id);
        }
    }

    pub(crate) fn release(&self, name: &str, id: u64) {
        let mut registry = self.lock_registry();
        if registry.active.get(name) != Some(&id) {
            debug!("Lease {} already released", name);
            return;
        }
        registry.active.remove(name);
        // Sent under the lock so a later create() of the same name queues
        // its registration behind this release.
        self.send(Command::Release {
            name: name.to_string(),
            id,
        });
    }
}

enum Lifecycle {
    Idle(mpsc::UnboundedReceiver<Command>),
    Starting,
    Running {
        worker: JoinHandle<()>,
        scheduler: JoinHandle<()>,
    },
    Stopped,
}

struct Inner {
    shared: Arc<Shared>,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl Inner {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Running { worker, scheduler } = lifecycle {
            scheduler.abort();
            worker.abort();
        }
    }
}

/// Per-process coordinator of leases arbitrated by a shared [`LeaseStore`].
///
/// Every store mutation for this process runs on one work queue; a separate
/// scheduler task requests a maintenance cycle every half lease duration,
/// counted from the end of the previous cycle.
///
/// Cloning is cheap and yields a handle to the same manager.
#[derive(Clone)]
pub struct LeaseManager {
    inner: Arc<Inner>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaseConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a manager computing expirations from `clock`.
    ///
    /// With leases disabled in `config`, `store` is left untouched and every
    /// lease is granted through a private [`MemoryStore`].
    pub fn with_clock(
        store: Arc<dyn LeaseStore>,
        config: LeaseConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store: Arc<dyn LeaseStore> = if config.enabled {
            store
        } else {
            Arc::new(MemoryStore::new())
        };
        let (queue, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            owner_id: uuid::Uuid::new_v4().to_string(),
            registry: Mutex::new(Registry::default()),
            queue,
        });
        Self {
            inner: Arc::new(Inner {
                shared,
                store,
                clock,
                config,
                lifecycle: Mutex::new(Lifecycle::Idle(receiver)),
            }),
        }
    }

    /// Random id distinguishing this manager from every other participant.
    pub fn owner_id(&self) -> &str {
        &self.inner.shared.owner_id
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.inner.config
    }

    /// Verify the clock relationship with the store, then begin maintenance.
    ///
    /// Fails with [`LeaseError::ClockSkew`] when the local clock is more than
    /// a quarter lease duration away from the store clock; no maintenance
    /// cycle is scheduled in that case and `start` may be retried.
    pub async fn start(&self) -> Result<(), LeaseError> {
        self.inner.config.validate()?;

        let queue = {
            let mut lifecycle = self.inner.lock_lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Starting) {
                Lifecycle::Idle(queue) => queue,
                Lifecycle::Stopped => {
                    *lifecycle = Lifecycle::Stopped;
                    return Err(LeaseError::Stopped);
                }
                other => {
                    *lifecycle = other;
                    return Err(LeaseError::AlreadyStarted);
                }
            }
        };

        if let Err(err) = self.prepare_store().await {
            let mut lifecycle = self.inner.lock_lifecycle();
            if matches!(*lifecycle, Lifecycle::Starting) {
                *lifecycle = Lifecycle::Idle(queue);
            }
            return Err(err);
        }

        let worker = Worker::new(
            self.inner.store.clone(),
            self.inner.clock.clone(),
            self.inner.config.clone(),
            self.owner_id().to_string(),
        );

        let mut lifecycle = self.inner.lock_lifecycle();
        if !matches!(*lifecycle, Lifecycle::Starting) {
            // stop() won the race
            return Err(LeaseError::Stopped);
        }
        let worker = tokio::spawn(worker.run(queue));
        let scheduler = tokio::spawn(scheduler::run(
            self.inner.shared.queue.clone(),
            self.inner.config.maintenance_interval(),
        ));
        *lifecycle = Lifecycle::Running { worker, scheduler };

        info!(
            owner = %self.owner_id(),
            store = self.inner.store.name(),
            lease_duration_ms = self.inner.config.lease_duration_ms(),
            "Lease manager started"
        );
        Ok(())
    }

    async fn prepare_store(&self) -> Result<(), LeaseError> {
        if !self.inner.config.enabled {
            warn!(
                owner = %self.owner_id(),
                "Leases are disabled: every lease is granted locally without coordination"
            );
            return Ok(());
        }

        let store_now = self.inner.store.reference_time().await?;
        let local_now = self.inner.clock.now_millis();
        let skew_ms = (local_now - store_now).abs();
        let grace_ms = self.inner.config.grace_ms();
        if skew_ms > grace_ms {
            error!(
                skew_ms,
                grace_ms,
                store = self.inner.store.name(),
                "Local clock is not synchronized with the lease store"
            );
            return Err(LeaseError::ClockSkew { skew_ms, grace_ms });
        }
        debug!("Clock skew against {}: {}ms", self.inner.store.name(), skew_ms);

        self.inner.store.ensure_schema().await
    }

    /// Cancel the scheduler and interrupt the work queue.
    ///
    /// In-flight store statements are not rolled back. Idempotent.
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lock_lifecycle();
        if let Lifecycle::Running { worker, scheduler } =
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        {
            scheduler.abort();
            worker.abort();
            info!(owner = %self.owner_id(), "Lease manager stopped");
        }
    }

    /// Start tracking `name` and return its handle in the unacquired state.
    ///
    /// `callback` fires once per ownership transition. Fails with
    /// [`LeaseError::Conflict`] if this process already holds an unreleased
    /// handle for `name`.
    pub fn create<F>(&self, name: impl Into<String>, callback: F) -> Result<LeaseHandle, LeaseError>
    where
        F: FnMut(&LeaseEvent) + Send + 'static,
    {
        let name = name.into();
        let shared = &self.inner.shared;
        if shared.queue.is_closed() {
            return Err(LeaseError::Stopped);
        }

        let (state_tx, state_rx) = watch::channel(false);
        let id = {
            let mut registry = shared.lock_registry();
            if registry.active.contains_key(&name) {
                return Err(LeaseError::Conflict(name));
            }
            let id = registry.next_id;
            registry.next_id += 1;
            registry.active.insert(name.clone(), id);

            shared.send(Command::Register {
                name: name.clone(),
                id,
                callback: Box::new(callback),
                state: state_tx,
            });
            shared.send(Command::Maintain { done: None });
            id
        };

        debug!("Created lease handle {} for {}", id, name);
        Ok(LeaseHandle::new(name, id, state_rx, shared.clone()))
    }

    /// Same as [`LeaseHandle::release`].
    pub fn release(&self, handle: &LeaseHandle) {
        handle.release();
    }

    /// Snapshot of every row in the store: lease name -> owner id.
    ///
    /// Diagnostic only; ownership decisions go through the work queue.
    pub async fn all_leases(&self) -> Result<HashMap<String, String>, LeaseError> {
        Ok(self
            .inner
            .store
            .list_all()
            .await?
            .into_iter()
            .map(|record| (record.name, record.owner))
            .collect())
    }

    #[cfg(test)]
    pub(crate) fn stall(&self, duration: Duration) {
        self.inner.shared.send(Command::Stall(duration));
    }
}
