//! Bounded per-class pool of live backend slots.
//!
//! Each slot owns one backend subprocess and its descriptor/option pair.
//! The index is guarded by a single mutex held only for bookkeeping, never
//! across a spawn or a proxy forward.  Loads for one name serialize on that
//! slot's load gate; readers of a Ready slot proceed in parallel.  When a
//! class partition is full the least-recently-used idle slot is drained,
//! stopped and unlinked before a new load starts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::catalog::ModelDescriptor;
use crate::config::ClassQuotas;
use crate::error::ServeError;
use crate::process::{BackendHandle, Launcher};
use crate::recipe::RecipeOptions;

const PORT_RANGE_START: u16 = 8001;
const PORT_RANGE_END: u16 = 8999;

/// How often capacity waiters re-check the index between notifications.
const WAIT_RECHECK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Starting,
    Ready,
    Busy,
    Draining,
    Dead,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Starting => "starting",
            SlotState::Ready => "ready",
            SlotState::Busy => "busy",
            SlotState::Draining => "draining",
            SlotState::Dead => "dead",
        };
        f.write_str(s)
    }
}

struct SlotInner {
    state: SlotState,
    backend: Option<Arc<dyn BackendHandle>>,
    port: u16,
    last_used: Instant,
}

pub struct Slot {
    pub descriptor: ModelDescriptor,
    pub options: RecipeOptions,
    in_flight: AtomicU32,
    load_gate: Arc<tokio::sync::Mutex<()>>,
    inner: StdMutex<SlotInner>,
}

impl Slot {
    fn new(descriptor: ModelDescriptor, options: RecipeOptions) -> Self {
        Self {
            descriptor,
            options,
            in_flight: AtomicU32::new(0),
            load_gate: Arc::new(tokio::sync::Mutex::new(())),
            inner: StdMutex::new(SlotInner {
                state: SlotState::Starting,
                backend: None,
                port: 0,
                last_used: Instant::now(),
            }),
        }
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().expect("slot lock").state
    }

    pub fn port(&self) -> u16 {
        self.inner.lock().expect("slot lock").port
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn backend(&self) -> Option<Arc<dyn BackendHandle>> {
        self.inner.lock().expect("slot lock").backend.clone()
    }
}

/// Point-in-time view of one slot, for `/api/ps` and stats.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub name: String,
    pub class: String,
    pub recipe: String,
    pub state: String,
    pub port: u16,
    pub in_flight: u32,
    pub idle_seconds: u64,
    pub size_bytes: u64,
}

/// A checked-out reference to a Ready slot.  Dropping the handle releases
/// the slot: `in_flight` decrements, the LRU clock advances, and pool
/// waiters are woken.
pub struct SlotHandle {
    slot: Arc<Slot>,
    pool: Arc<BackendSlotPool>,
}

impl SlotHandle {
    pub fn port(&self) -> u16 {
        self.slot.port()
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.slot.descriptor
    }

    pub fn backend(&self) -> Option<Arc<dyn BackendHandle>> {
        self.slot.backend()
    }

    /// Mark the slot's backend dead after a mid-request failure; the slot is
    /// unlinked so a later request triggers a fresh load.
    pub fn mark_dead(&self) {
        {
            let mut inner = self.slot.inner.lock().expect("slot lock");
            inner.state = SlotState::Dead;
        }
        self.pool.unlink_dead(&self.slot.descriptor.name);
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        let previous = self.slot.in_flight.fetch_sub(1, Ordering::SeqCst);
        {
            let mut inner = self.slot.inner.lock().expect("slot lock");
            inner.last_used = Instant::now();
            if previous == 1 && inner.state == SlotState::Busy {
                inner.state = SlotState::Ready;
            }
        }
        self.pool.changed.notify_waiters();
    }
}

enum Step {
    Use(Arc<Slot>),
    WaitGate(Arc<Slot>),
    WaitCapacity,
    Evict(Arc<Slot>),
    Load(Arc<Slot>, tokio::sync::OwnedMutexGuard<()>),
    Retry,
}

pub struct BackendSlotPool {
    launcher: Arc<dyn Launcher>,
    quotas: ClassQuotas,
    load_timeout: Duration,
    stop_grace: Duration,
    slots: StdMutex<BTreeMap<String, Arc<Slot>>>,
    changed: Notify,
    loads: AtomicU64,
    evictions: AtomicU64,
    loads_by_model: StdMutex<BTreeMap<String, u64>>,
}

impl BackendSlotPool {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        quotas: ClassQuotas,
        load_timeout: Duration,
        stop_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            quotas,
            load_timeout,
            stop_grace,
            slots: StdMutex::new(BTreeMap::new()),
            changed: Notify::new(),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            loads_by_model: StdMutex::new(BTreeMap::new()),
        })
    }

    /// Acquire a slot for `descriptor` with the given effective options,
    /// loading or evicting as needed, bounded by `deadline`.
    pub async fn acquire(
        self: &Arc<Self>,
        descriptor: &ModelDescriptor,
        options: &RecipeOptions,
        deadline: tokio::time::Instant,
    ) -> Result<SlotHandle, ServeError> {
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ServeError::Timeout);
            }

            let step = self.next_step(descriptor, options);
            match step {
                Step::Use(slot) => {
                    return Ok(SlotHandle {
                        slot,
                        pool: Arc::clone(self),
                    });
                }
                Step::Retry => continue,
                Step::WaitGate(slot) => {
                    // Another caller is loading this name; ride its gate.
                    let gate = slot.load_gate.clone();
                    let guard = tokio::time::timeout_at(deadline, gate.lock())
                        .await
                        .map_err(|_| ServeError::Timeout)?;
                    drop(guard);
                    // The loader failing leaves the slot Dead and unlinked;
                    // gate waiters surface that load's failure rather than
                    // spawning again on the same request.
                    if slot.state() == SlotState::Dead {
                        return Err(ServeError::LoadFailed {
                            model: descriptor.name.clone(),
                            reason: "concurrent load attempt failed".to_string(),
                        });
                    }
                }
                Step::WaitCapacity => {
                    let wait = WAIT_RECHECK
                        .min(deadline.saturating_duration_since(tokio::time::Instant::now()));
                    let _ = tokio::time::timeout(wait, self.changed.notified()).await;
                }
                Step::Evict(victim) => {
                    // Run the stop on its own task: if this request is
                    // cancelled mid-eviction the victim must still be
                    // stopped and unlinked, never left Draining forever.
                    let pool = Arc::clone(self);
                    let task = tokio::spawn(async move { pool.evict(&victim).await });
                    if tokio::time::timeout_at(deadline, task).await.is_err() {
                        return Err(ServeError::Timeout);
                    }
                }
                Step::Load(slot, gate) => {
                    // Same reasoning for loads: the spawn runs detached so a
                    // dropped request leaves a finished (or cleanly failed)
                    // slot behind, not an orphaned Starting entry.
                    let pool = Arc::clone(self);
                    let task = tokio::spawn(async move { pool.load(slot, gate).await });
                    return match tokio::time::timeout_at(deadline, task).await {
                        Err(_) => Err(ServeError::Timeout),
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => Err(ServeError::Internal(format!(
                            "load task panicked: {e}"
                        ))),
                    };
                }
            }
        }
    }

    /// One bookkeeping pass under the pool lock, deciding what to do next.
    fn next_step(&self, descriptor: &ModelDescriptor, options: &RecipeOptions) -> Step {
        let now = Instant::now();
        let mut slots = self.slots.lock().expect("pool lock");

        if let Some(slot) = slots.get(&descriptor.name).cloned() {
            let mut inner = slot.inner.lock().expect("slot lock");
            return match inner.state {
                SlotState::Ready | SlotState::Busy => {
                    if slot.options == *options {
                        slot.in_flight.fetch_add(1, Ordering::SeqCst);
                        inner.state = SlotState::Busy;
                        inner.last_used = now;
                        drop(inner);
                        Step::Use(slot)
                    } else if inner.state == SlotState::Ready && slot.in_flight() == 0 {
                        // Option mismatch forces a reload of this name.
                        inner.state = SlotState::Draining;
                        drop(inner);
                        Step::Evict(slot)
                    } else {
                        Step::WaitCapacity
                    }
                }
                SlotState::Starting => Step::WaitGate(Arc::clone(&slot)),
                SlotState::Draining => Step::WaitCapacity,
                SlotState::Dead => {
                    drop(inner);
                    slots.remove(&descriptor.name);
                    Step::Retry
                }
            };
        }

        let class = descriptor.class;
        let live = slots
            .values()
            .filter(|s| s.descriptor.class == class && s.state() != SlotState::Dead)
            .count();

        if live >= self.quotas.get(class) {
            // LRU victim among idle Ready slots of this class; BTreeMap
            // iteration order makes the tie-break the lexicographically
            // smallest name.
            let victim = slots
                .values()
                .filter(|s| {
                    s.descriptor.class == class
                        && s.state() == SlotState::Ready
                        && s.in_flight() == 0
                })
                .min_by_key(|s| s.inner.lock().expect("slot lock").last_used)
                .cloned();
            return match victim {
                Some(victim) => {
                    victim.inner.lock().expect("slot lock").state = SlotState::Draining;
                    Step::Evict(victim)
                }
                None => Step::WaitCapacity,
            };
        }

        // Room in the partition: insert a Starting slot and take its load
        // gate before anyone else can see it unlocked.
        let slot = Arc::new(Slot::new(descriptor.clone(), options.clone()));
        let gate = slot
            .load_gate
            .clone()
            .try_lock_owned()
            .expect("fresh load gate");
        slots.insert(descriptor.name.clone(), Arc::clone(&slot));
        Step::Load(slot, gate)
    }

    async fn load(
        self: &Arc<Self>,
        slot: Arc<Slot>,
        gate: tokio::sync::OwnedMutexGuard<()>,
    ) -> Result<SlotHandle, ServeError> {
        let name = slot.descriptor.name.clone();
        let result = async {
            let port = self.choose_free_port()?;
            let backend = self
                .launcher
                .launch(&slot.descriptor, &slot.options, port, self.load_timeout)
                .await?;
            Ok::<_, ServeError>(backend)
        }
        .await;

        match result {
            Ok(backend) => {
                {
                    let mut inner = slot.inner.lock().expect("slot lock");
                    inner.port = backend.port();
                    inner.backend = Some(backend);
                    inner.state = SlotState::Busy;
                    inner.last_used = Instant::now();
                }
                slot.in_flight.fetch_add(1, Ordering::SeqCst);
                self.loads.fetch_add(1, Ordering::SeqCst);
                *self
                    .loads_by_model
                    .lock()
                    .expect("pool lock")
                    .entry(name.clone())
                    .or_insert(0) += 1;
                drop(gate);
                self.changed.notify_waiters();
                info!(model = %name, "Slot loaded");
                Ok(SlotHandle {
                    slot,
                    pool: Arc::clone(self),
                })
            }
            Err(e) => {
                {
                    let mut inner = slot.inner.lock().expect("slot lock");
                    inner.state = SlotState::Dead;
                }
                self.unlink_dead(&name);
                drop(gate);
                warn!(model = %name, "Load failed: {e}");
                Err(e)
            }
        }
    }

    /// Stop a Draining victim and unlink it.  The pool lock is not held
    /// across the stop.
    async fn evict(&self, victim: &Arc<Slot>) {
        let name = victim.descriptor.name.clone();
        debug!(model = %name, "Evicting slot");
        if let Some(backend) = victim.backend() {
            backend.stop(self.stop_grace).await;
        }
        {
            let mut slots = self.slots.lock().expect("pool lock");
            if let Some(current) = slots.get(&name) {
                if Arc::ptr_eq(current, victim) {
                    slots.remove(&name);
                }
            }
        }
        self.evictions.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
        info!(model = %name, "Slot evicted");
    }

    fn unlink_dead(&self, name: &str) {
        let mut slots = self.slots.lock().expect("pool lock");
        if let Some(slot) = slots.get(name) {
            if slot.state() == SlotState::Dead {
                slots.remove(name);
            }
        }
        drop(slots);
        self.changed.notify_waiters();
    }

    /// Drain one model (or all) and stop its backend.  Waits up to the stop
    /// grace for in-flight requests, then stops regardless.
    pub async fn unload(&self, name: &str) {
        let slot = {
            let slots = self.slots.lock().expect("pool lock");
            slots.get(name).cloned()
        };
        let Some(slot) = slot else {
            return;
        };

        // A load in progress finishes (or fails) before the drain starts.
        if slot.state() == SlotState::Starting {
            let gate = slot.load_gate.clone();
            let _ = tokio::time::timeout(self.stop_grace, gate.lock()).await;
        }

        {
            let mut inner = slot.inner.lock().expect("slot lock");
            if inner.state == SlotState::Dead {
                return;
            }
            inner.state = SlotState::Draining;
        }

        let deadline = Instant::now() + self.stop_grace;
        while slot.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if slot.in_flight() > 0 {
            warn!(model = %name, "Unloading with requests still in flight");
        }

        if let Some(backend) = slot.backend() {
            backend.stop(self.stop_grace).await;
        }
        {
            let mut slots = self.slots.lock().expect("pool lock");
            if let Some(current) = slots.get(name) {
                if Arc::ptr_eq(current, &slot) {
                    slots.remove(name);
                }
            }
        }
        self.changed.notify_waiters();
        info!(model = %name, "Slot unloaded");
    }

    pub async fn unload_all(&self) {
        let names: Vec<String> = {
            let slots = self.slots.lock().expect("pool lock");
            slots.keys().cloned().collect()
        };
        for name in names {
            self.unload(&name).await;
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        let slots = self.slots.lock().expect("pool lock");
        slots
            .get(name)
            .map(|s| s.state() != SlotState::Dead)
            .unwrap_or(false)
    }

    /// Snapshot of all live slots, ordered by name.
    pub fn list(&self) -> Vec<SlotSnapshot> {
        let slots = self.slots.lock().expect("pool lock");
        slots
            .values()
            .map(|slot| {
                let inner = slot.inner.lock().expect("slot lock");
                SlotSnapshot {
                    name: slot.descriptor.name.clone(),
                    class: slot.descriptor.class.to_string(),
                    recipe: slot.descriptor.recipe.to_string(),
                    state: inner.state.to_string(),
                    port: inner.port,
                    in_flight: slot.in_flight(),
                    idle_seconds: inner.last_used.elapsed().as_secs(),
                    size_bytes: slot.descriptor.size_bytes,
                }
            })
            .collect()
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn loads_by_model(&self) -> BTreeMap<String, u64> {
        self.loads_by_model.lock().expect("pool lock").clone()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::SeqCst)
    }

    /// Probe the loopback port range for a bindable port, skipping ports
    /// already assigned to slots.
    fn choose_free_port(&self) -> Result<u16, ServeError> {
        let taken: Vec<u16> = {
            let slots = self.slots.lock().expect("pool lock");
            slots.values().map(|s| s.port()).collect()
        };
        for port in PORT_RANGE_START..=PORT_RANGE_END {
            if taken.contains(&port) {
                continue;
            }
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Ok(port);
            }
        }
        Err(ServeError::NoFreePort(PORT_RANGE_START, PORT_RANGE_END))
    }
}
