use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::LeaseConfig;
use crate::error::LeaseError;
use crate::handle::{LeaseEvent, LeaseState, TransitionCallback};
use crate::store::LeaseStore;

/// Unit of work for the serialized queue.
pub(crate) enum Command {
    Register {
        name: String,
        id: u64,
        callback: TransitionCallback,
        state: watch::Sender<bool>,
    },
    Release {
        name: String,
        id: u64,
    },
    /// Run one maintenance cycle, acknowledging completion if asked to.
    Maintain {
        done: Option<oneshot::Sender<()>>,
    },
    /// Block the queue, like a process that stopped being scheduled.
    #[cfg(test)]
    Stall(Duration),
}

/// Local state of one tracked handle.
struct Slot {
    id: u64,
    acquired: bool,
    callback: TransitionCallback,
    state: watch::Sender<bool>,
}

impl Slot {
    /// Edge-triggered: returns false and stays silent when nothing changes.
    fn transition(&mut self, name: &str, acquired: bool) -> bool {
        if self.acquired == acquired {
            return false;
        }
        self.acquired = acquired;
        self.state.send_replace(acquired);
        (self.callback)(&LeaseEvent {
            name: name.to_string(),
            state: LeaseState::from_acquired(acquired),
        });
        true
    }
}

/// Owner of every handle slot; the only code that talks to the store on
/// behalf of one manager.
pub(crate) struct Worker {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
    owner_id: String,
    slots: HashMap<String, Slot>,
    /// Expiration written by the last fully successful cycle
    confirmed_until: Option<i64>,
}

impl Worker {
    pub(crate) fn new(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
        owner_id: String,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            owner_id,
            slots: HashMap::new(),
            confirmed_until: None,
        }
    }

    pub(crate) async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = queue.recv().await {
            // Once a cycle is requested, everything already queued is applied
            // first and every pending request is answered by that one cycle.
            let mut acks = Vec::new();
            let mut maintain = false;
            let mut next = Some(command);
            while let Some(command) = next.take() {
                match command {
                    Command::Register {
                        name,
                        id,
                        callback,
                        state,
                    } => self.register(name, id, callback, state),
                    Command::Release { name, id } => self.release(&name, id).await,
                    Command::Maintain { done } => {
                        maintain = true;
                        acks.extend(done);
                    }
                    #[cfg(test)]
                    Command::Stall(duration) => tokio::time::sleep(duration).await,
                }
                if maintain {
                    next = queue.try_recv().ok();
                }
            }

            if maintain {
                self.run_cycle().await;
                for done in acks {
                    let _ = done.send(());
                }
            }
        }
        debug!("Lease work queue for {} closed", self.owner_id);
    }

    fn register(
        &mut self,
        name: String,
        id: u64,
        callback: TransitionCallback,
        state: watch::Sender<bool>,
    ) {
        let slot = Slot {
            id,
            acquired: false,
            callback,
            state,
        };
        if self.slots.insert(name.clone(), slot).is_some() {
            warn!("Replaced a stale slot for lease {}", name);
        }
    }

    async fn release(&mut self, name: &str, id: u64) {
        match self.slots.get(name) {
            Some(slot) if slot.id == id => {}
            _ => return,
        }
        let Some(mut slot) = self.slots.remove(name) else {
            return;
        };

        // Local observers learn about the release before the store does.
        slot.transition(name, false);

        let deadline = self.deadline();
        let outcome = timeout(deadline, self.store.delete_owned(name, &self.owner_id)).await;
        match outcome {
            Ok(Ok(true)) => info!(lease = %name, owner = %self.owner_id, "Released lease"),
            Ok(Ok(false)) => debug!("Lease {} was not held by {} at release", name, self.owner_id),
            Ok(Err(err)) => warn!(
                lease = %name,
                error = %err,
                "Failed to delete released lease; it will expire instead"
            ),
            Err(_) => {
                warn!(
                    lease = %name,
                    "Lease store did not answer the release within {:?}; it will expire instead",
                    deadline
                );
                self.drop_unconfirmed();
            }
        }
    }

    /// Longest a store call may take before held leases are at risk.
    ///
    /// While anything is held, that is the point where peers may start
    /// collecting our rows; otherwise one lease duration.
    fn deadline(&self) -> Duration {
        let holding = self.slots.values().any(|slot| slot.acquired);
        match self.confirmed_until {
            Some(confirmed_until) if holding => {
                let remaining = confirmed_until
                    .saturating_sub(self.config.grace_ms())
                    .saturating_sub(self.clock.now_millis());
                Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
            }
            _ => self.config.lease_duration,
        }
    }

    async fn run_cycle(&mut self) {
        let deadline = self.deadline();
        let result = match timeout(deadline, self.maintain()).await {
            Ok(result) => result,
            Err(_) => Err(LeaseError::Store(format!(
                "maintenance cycle did not finish within {:?}",
                deadline
            ))),
        };
        if let Err(err) = result {
            warn!(
                owner = %self.owner_id,
                store = self.store.name(),
                error = %err,
                "Lease maintenance cycle failed"
            );
            self.drop_unconfirmed();
        }
    }

    /// One maintenance cycle: collect expired rows, refresh ours, claim free
    /// names, then reconcile every slot against what the store says we own.
    async fn maintain(&mut self) -> Result<(), LeaseError> {
        let now = self.clock.now_millis();
        let expiration = now.saturating_add(self.config.lease_duration_ms());

        let expired = self.store.delete_expired(now).await?;
        if expired > 0 {
            debug!("Deleted {} expired leases", expired);
        }

        self.store.refresh_owned(&self.owner_id, expiration).await?;

        let wanted: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.acquired)
            .map(|(name, _)| name.clone())
            .collect();
        if !wanted.is_empty() {
            self.store
                .claim_absent(&wanted, &self.owner_id, expiration)
                .await?;
        }

        let owned: HashSet<String> = self
            .store
            .select_owned(&self.owner_id)
            .await?
            .into_iter()
            .collect();

        let mut orphans = Vec::new();
        for name in &owned {
            match self.slots.get_mut(name) {
                Some(slot) => {
                    if slot.transition(name, true) {
                        info!(lease = %name, owner = %self.owner_id, "Acquired lease");
                    }
                }
                None => orphans.push(name.clone()),
            }
        }

        for (name, slot) in self.slots.iter_mut() {
            if slot.acquired && !owned.contains(name) && slot.transition(name, false) {
                info!(lease = %name, owner = %self.owner_id, "Lost lease");
            }
        }
        self.confirmed_until = Some(expiration);

        // Rows we own without a local slot mean local and store state drifted.
        for name in orphans {
            warn!("Found a lease that we did not request. Deleting: {}", name);
            self.store.delete_owned(&name, &self.owner_id).await?;
        }
        Ok(())
    }

    /// After a failed cycle, give up leases whose rows may already have been
    /// collected by a peer.
    ///
    /// Start-up only bounds each clock against the store, so two peers may be
    /// up to two grace windows apart. Giving up one window early covers peers
    /// whose clock runs at most one window ahead of ours.
    fn drop_unconfirmed(&mut self) {
        let Some(confirmed_until) = self.confirmed_until else {
            return;
        };
        let now = self.clock.now_millis();
        if now < confirmed_until.saturating_sub(self.config.grace_ms()) {
            return;
        }
        for (name, slot) in self.slots.iter_mut() {
            if slot.transition(name, false) {
                warn!(
                    lease = %name,
                    owner = %self.owner_id,
                    "Lost lease: store unreachable past its expiration"
                );
            }
        }
    }
}
