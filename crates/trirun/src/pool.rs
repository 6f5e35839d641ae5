//! # Instance Pool
//!
//! Fixed-size collection of instance slots with per-slot health. Each slot is
//! an independent read-write lock holding an immutable record, so the
//! dispatcher snapshots slot state without blocking siblings and `replace`
//! swaps the record atomically with respect to concurrent reads.
//!
//! ## Invariants
//!
//! - `replace` is the only mutator of a slot's invoker; `mark_faulty` only
//!   changes health, retaining the stale invoker read-only until replacement
//! - A slot marked faulty is never handed out for invocation again
//! - Instances share no mutable state with each other

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::invoke::Invoker;

/// Health of one slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Rebuilding,
    Faulted,
}

struct Slot {
    invoker: Arc<dyn Invoker>,
    health: Health,
    created_at: Instant,
    generation: u64,
}

/// Owns R instance slots plus the hot-standby active index.
pub struct InstancePool {
    slots: Vec<RwLock<Slot>>,
    active: AtomicUsize,
}

impl InstancePool {
    pub(crate) fn new(invokers: Vec<Arc<dyn Invoker>>) -> Self {
        let now = Instant::now();
        let slots = invokers
            .into_iter()
            .map(|invoker| {
                RwLock::new(Slot {
                    invoker,
                    health: Health::Healthy,
                    created_at: now,
                    generation: 0,
                })
            })
            .collect();
        Self {
            slots,
            active: AtomicUsize::new(0),
        }
    }

    /// Configured replica count R.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub async fn health(&self, index: usize) -> Option<Health> {
        match self.slots.get(index) {
            Some(slot) => Some(slot.read().await.health),
            None => None,
        }
    }

    pub async fn health_all(&self) -> Vec<Health> {
        let mut healths = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            healths.push(slot.read().await.health);
        }
        healths
    }

    /// Snapshot of every healthy slot, in index order.
    pub async fn snapshot_active(&self) -> Vec<(usize, Arc<dyn Invoker>)> {
        let mut active = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.iter().enumerate() {
            let guard = slot.read().await;
            if guard.health == Health::Healthy {
                active.push((index, guard.invoker.clone()));
            }
        }
        active
    }

    /// Snapshot of the hot-standby active slot.
    ///
    /// Prefers the current active index; if that slot is unhealthy, promotes
    /// the first healthy sibling and returns it.
    pub async fn snapshot_hot(&self) -> Option<(usize, Arc<dyn Invoker>)> {
        let preferred = self.active.load(Ordering::Acquire);
        if let Some(slot) = self.slots.get(preferred) {
            let guard = slot.read().await;
            if guard.health == Health::Healthy {
                return Some((preferred, guard.invoker.clone()));
            }
        }
        match self.snapshot_active().await.into_iter().next() {
            Some((index, invoker)) => {
                self.active.store(index, Ordering::Release);
                Some((index, invoker))
            }
            None => None,
        }
    }

    /// Current hot-standby active index.
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Switches the active index away from `from` to a healthy sibling.
    pub async fn fail_over(&self, from: usize) -> Option<usize> {
        for (index, slot) in self.slots.iter().enumerate() {
            if index == from {
                continue;
            }
            if slot.read().await.health == Health::Healthy {
                self.active.store(index, Ordering::Release);
                return Some(index);
            }
        }
        None
    }

    /// Marks a slot faulty, keeping the stale invoker in place (read-only)
    /// so the slot is never empty. Returns false if the slot was already
    /// non-healthy or out of range.
    pub async fn mark_faulty(&self, index: usize) -> bool {
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        let mut guard = slot.write().await;
        if guard.health != Health::Healthy {
            return false;
        }
        guard.health = Health::Faulted;
        true
    }

    pub(crate) async fn set_health(&self, index: usize, health: Health) {
        if let Some(slot) = self.slots.get(index) {
            slot.write().await.health = health;
        }
    }

    /// Installs a freshly built invoker at `index`, discarding the old one.
    /// The sole mutator of a slot's instance reference.
    pub(crate) async fn replace(&self, index: usize, invoker: Arc<dyn Invoker>) {
        if let Some(slot) = self.slots.get(index) {
            let mut guard = slot.write().await;
            guard.invoker = invoker;
            guard.health = Health::Healthy;
            guard.created_at = Instant::now();
            guard.generation += 1;
        }
    }

    /// Rebuild count of one slot (0 for the original instance).
    pub async fn generation(&self, index: usize) -> Option<u64> {
        match self.slots.get(index) {
            Some(slot) => Some(slot.read().await.generation),
            None => None,
        }
    }

    /// Invoker for a healthy slot, for out-of-band probes like guest stats.
    pub(crate) async fn probe(&self, index: usize) -> Option<Arc<dyn Invoker>> {
        let slot = self.slots.get(index)?;
        let guard = slot.read().await;
        if guard.health == Health::Healthy {
            Some(guard.invoker.clone())
        } else {
            None
        }
    }

    /// Age of the instance currently installed at `index`.
    pub async fn created_at(&self, index: usize) -> Option<Instant> {
        match self.slots.get(index) {
            Some(slot) => Some(slot.read().await.created_at),
            None => None,
        }
    }
}
