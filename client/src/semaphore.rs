use ember_types::Address;
use ember_world::{Store, World};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Fixed-capacity counting semaphore gating concurrent action execution.
pub struct Slots {
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

/// Held slot; released on drop.
pub struct SlotPermit(#[allow(dead_code)] OwnedSemaphorePermit);

impl Slots {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    pub fn try_acquire(&self) -> Option<SlotPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(SlotPermit)
    }

    pub async fn acquire(&self) -> SlotPermit {
        match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => SlotPermit(permit),
            // The semaphore is never closed.
            Err(_) => std::future::pending().await,
        }
    }
}

/// Which live state a gate's capacity reads; revision bumps for the
/// dependency re-check waiters, not only releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateScope {
    Player(Address),
    Global,
}

pub type CapacityFn = Box<dyn Fn(&World) -> u64 + Send + Sync>;

/// A semaphore whose capacity is computed on demand from live world state,
/// so admission automatically tracks state changes.
pub struct ResourceGate {
    name: &'static str,
    scope: GateScope,
    capacity: CapacityFn,
    in_use: Mutex<u64>,
    changed: Notify,
}

/// A held reservation against a gate; released (and waiters re-checked) on
/// drop.
pub struct Reservation {
    gate: Arc<ResourceGate>,
    amount: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.gate.release(self.amount);
    }
}

impl ResourceGate {
    pub fn new(name: &'static str, scope: GateScope, capacity: CapacityFn) -> Arc<Self> {
        Arc::new(Self {
            name,
            scope,
            capacity,
            in_use: Mutex::new(0),
            changed: Notify::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn in_use(&self) -> u64 {
        *self.lock()
    }

    pub fn capacity(&self, store: &Store) -> u64 {
        store.read(|world| (self.capacity)(world))
    }

    /// Headroom left at this instant: live capacity minus reservations held
    /// by in-flight actions.
    pub fn available(&self, store: &Store) -> u64 {
        self.capacity(store).saturating_sub(self.in_use())
    }

    /// All-or-nothing synchronous reservation.
    pub fn try_reserve(self: &Arc<Self>, store: &Store, amount: u64) -> Option<Reservation> {
        let capacity = self.capacity(store);
        let mut in_use = self.lock();
        if capacity.saturating_sub(*in_use) < amount {
            return None;
        }
        *in_use += amount;
        trace!(gate = self.name, amount, in_use = *in_use, "reserved");
        Some(Reservation {
            gate: self.clone(),
            amount,
        })
    }

    /// Wait until the reservation fits. Waiting here is normal backpressure:
    /// it never times out on its own.
    pub async fn reserve(self: &Arc<Self>, store: &Store, amount: u64) -> Reservation {
        loop {
            let notified = self.changed.notified();
            if let Some(reservation) = self.try_reserve(store, amount) {
                return reservation;
            }
            notified.await;
        }
    }

    /// Re-check waiters after a change to this gate's dependency.
    pub fn poke(&self) {
        self.changed.notify_waiters();
    }

    pub fn depends_on(&self, address: &Address) -> bool {
        match self.scope {
            GateScope::Player(player) => player == *address,
            GateScope::Global => true,
        }
    }

    fn release(&self, amount: u64) {
        {
            let mut in_use = self.lock();
            *in_use = in_use.saturating_sub(amount);
        }
        self.changed.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        self.in_use
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
