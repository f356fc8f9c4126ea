//! Lifecycle registry.
//!
//! Tracks which configurations own a live process and the last observed
//! [`RunState`] of every configuration. Both tables are sharded maps, so calls for
//! different config ids never contend; a start for one id takes its slot
//! atomically through [`Registry::reserve`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::ServiceError;
use crate::launch::LaunchStrategy;
use crate::models::RunState;

/// Capacity of the status broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Asks a supervision task to terminate its process.
#[derive(Debug)]
pub struct StopRequest {
    /// Receives the final state once the process is gone.
    pub reply: oneshot::Sender<RunState>,
}

/// Handle to a running supervision task.
#[derive(Debug, Clone)]
pub struct Supervision {
    pub run_id: u64,
    pub pid: Option<u32>,
    pub strategy: LaunchStrategy,
    pub started_at: DateTime<Utc>,
    pub control: mpsc::Sender<StopRequest>,
}

#[derive(Debug)]
enum Slot {
    /// Start in progress; nothing to stop yet.
    Starting { run_id: u64 },
    Running(Supervision),
}

impl Slot {
    fn run_id(&self) -> u64 {
        match self {
            Slot::Starting { run_id } => *run_id,
            Slot::Running(s) => s.run_id,
        }
    }
}

/// Shared lifecycle state.
#[derive(Debug)]
pub struct Registry {
    slots: DashMap<String, Slot>,
    status: DashMap<String, RunState>,
    updates: broadcast::Sender<RunState>,
    next_run: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            slots: DashMap::new(),
            status: DashMap::new(),
            updates,
            next_run: AtomicU64::new(1),
        }
    }

    /// Claim the slot for `config_id`. Fails if a process is starting or running.
    ///
    /// The claim is released when the returned guard drops, unless it was
    /// committed with a running supervision first.
    pub fn reserve(self: &Arc<Self>, config_id: &str) -> Result<Reservation, ServiceError> {
        match self.slots.entry(config_id.to_string()) {
            Entry::Occupied(_) => Err(ServiceError::AlreadyRunning(config_id.to_string())),
            Entry::Vacant(vacant) => {
                let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Slot::Starting { run_id });
                debug!("reserved {} (run {})", config_id, run_id);
                Ok(Reservation {
                    registry: Arc::clone(self),
                    config_id: config_id.to_string(),
                    run_id,
                    committed: false,
                })
            }
        }
    }

    /// Record and broadcast a new state.
    pub fn set_status(&self, state: RunState) {
        self.status.insert(state.config_id.clone(), state.clone());
        // No subscribers is fine.
        let _ = self.updates.send(state);
    }

    /// Record the final state of `run_id` and release its slot.
    ///
    /// A slot that already belongs to a newer run is left alone, as is its status.
    pub fn finish(&self, config_id: &str, run_id: u64, state: RunState) {
        let owned = self
            .slots
            .get(config_id)
            .is_some_and(|slot| slot.run_id() == run_id);
        if !owned {
            debug!(
                "run {} of {} finished after its slot was replaced",
                run_id, config_id
            );
            return;
        }
        // A free slot must never expose a non-terminal status.
        self.set_status(state);
        self.slots.remove_if(config_id, |_, slot| slot.run_id() == run_id);
    }

    /// Control channel of a running supervision.
    pub fn control(&self, config_id: &str) -> Option<mpsc::Sender<StopRequest>> {
        match self.slots.get(config_id)?.value() {
            Slot::Running(s) => Some(s.control.clone()),
            Slot::Starting { .. } => None,
        }
    }

    /// Whether a process is starting or running for `config_id`.
    pub fn is_active(&self, config_id: &str) -> bool {
        self.slots.contains_key(config_id)
    }

    /// Last known state, or a default STOPPED record.
    pub fn status(&self, config_id: &str) -> RunState {
        self.status
            .get(config_id)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| RunState::stopped(config_id))
    }

    /// States of every configuration with a live process.
    pub fn list_running(&self) -> Vec<RunState> {
        let mut running: Vec<RunState> = self
            .slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Running(s) => Some(RunState::running(
                    entry.key().clone(),
                    s.pid,
                    s.started_at,
                    s.strategy,
                )),
                Slot::Starting { .. } => None,
            })
            .collect();
        running.sort_by(|a, b| a.config_id.cmp(&b.config_id));
        running
    }

    /// Ids with a live supervision.
    pub fn running_ids(&self) -> Vec<String> {
        self.list_running()
            .into_iter()
            .map(|s| s.config_id)
            .collect()
    }

    /// Every recorded state.
    pub fn snapshot(&self) -> Vec<RunState> {
        let mut states: Vec<RunState> = self.status.iter().map(|e| e.value().clone()).collect();
        states.sort_by(|a, b| a.config_id.cmp(&b.config_id));
        states
    }

    /// Receive every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunState> {
        self.updates.subscribe()
    }
}

/// Exclusive claim on one config id while a start is in progress.
#[derive(Debug)]
pub struct Reservation {
    registry: Arc<Registry>,
    config_id: String,
    run_id: u64,
    committed: bool,
}

impl Reservation {
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Record a failed start, then release the claim.
    pub fn fail(self, state: RunState) {
        self.registry.set_status(state);
    }

    /// Turn the claim into a running entry.
    pub fn commit(mut self, supervision: Supervision) {
        if let Some(mut slot) = self.registry.slots.get_mut(&self.config_id)
            && slot.run_id() == self.run_id
        {
            *slot = Slot::Running(supervision);
            self.committed = true;
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let run_id = self.run_id;
        self.registry.slots.remove_if(&self.config_id, |_, slot| {
            matches!(slot, Slot::Starting { run_id: r } if *r == run_id)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Phase;

    fn supervision(run_id: u64) -> (Supervision, mpsc::Receiver<StopRequest>) {
        let (control, rx) = mpsc::channel(1);
        (
            Supervision {
                run_id,
                pid: Some(42),
                strategy: LaunchStrategy::Direct,
                started_at: Utc::now(),
                control,
            },
            rx,
        )
    }

    #[test]
    fn test_reserve_is_exclusive() {
        let registry = Arc::new(Registry::new());
        let first = registry.reserve("a").unwrap();
        assert_eq!(
            registry.reserve("a").unwrap_err(),
            ServiceError::AlreadyRunning("a".into())
        );
        // Different ids are independent.
        let _other = registry.reserve("b").unwrap();
        drop(first);
        assert!(registry.reserve("a").is_ok());
    }

    #[test]
    fn test_dropped_reservation_releases_slot() {
        let registry = Arc::new(Registry::new());
        {
            let _r = registry.reserve("a").unwrap();
            assert!(registry.is_active("a"));
        }
        assert!(!registry.is_active("a"));
    }

    #[test]
    fn test_commit_keeps_slot() {
        let registry = Arc::new(Registry::new());
        let reservation = registry.reserve("a").unwrap();
        let (sup, _rx) = supervision(reservation.run_id());
        reservation.commit(sup);

        assert!(registry.is_active("a"));
        assert!(registry.control("a").is_some());
        let running = registry.list_running();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].pid, Some(42));
        assert_eq!(running[0].phase, Phase::Running);
    }

    #[test]
    fn test_starting_slot_has_no_control() {
        let registry = Arc::new(Registry::new());
        let _r = registry.reserve("a").unwrap();
        assert!(registry.control("a").is_none());
        assert!(registry.list_running().is_empty());
    }

    #[test]
    fn test_stale_finish_does_not_evict_newer_run() {
        let registry = Arc::new(Registry::new());
        let old = registry.reserve("a").unwrap();
        let old_run = old.run_id();
        drop(old);

        let newer = registry.reserve("a").unwrap();
        let (sup, _rx) = supervision(newer.run_id());
        newer.commit(sup);

        registry.finish("a", old_run, RunState::stopped("a"));
        assert!(registry.is_active("a"));
        assert!(!registry.snapshot().iter().any(|s| s.config_id == "a"));
    }

    /// Watches `id` from another thread and returns the status seen at the
    /// moment its slot was first observed free.
    fn status_when_released(
        registry: &Arc<Registry>,
        id: &str,
    ) -> std::thread::JoinHandle<RunState> {
        let registry = Arc::clone(registry);
        let id = id.to_string();
        std::thread::spawn(move || {
            while registry.is_active(&id) {
                std::hint::spin_loop();
            }
            registry.status(&id)
        })
    }

    #[test]
    fn test_finish_publishes_before_release() {
        for _ in 0..200 {
            let registry = Arc::new(Registry::new());
            let reservation = registry.reserve("a").unwrap();
            let run_id = reservation.run_id();
            let (sup, _rx) = supervision(run_id);
            reservation.commit(sup);
            registry.set_status(RunState::starting("a"));

            let watcher = status_when_released(&registry, "a");
            registry.finish("a", run_id, RunState::error("a", "exit 3"));
            assert_eq!(watcher.join().unwrap().phase, Phase::Error);
        }
    }

    #[test]
    fn test_failed_reservation_publishes_before_release() {
        for _ in 0..200 {
            let registry = Arc::new(Registry::new());
            let reservation = registry.reserve("a").unwrap();
            registry.set_status(RunState::starting("a"));

            let watcher = status_when_released(&registry, "a");
            reservation.fail(RunState::error("a", "no binary"));
            assert_eq!(watcher.join().unwrap().phase, Phase::Error);
            assert!(!registry.is_active("a"));
        }
    }

    #[test]
    fn test_status_defaults_to_stopped() {
        let registry = Registry::new();
        let state = registry.status("never");
        assert_eq!(state.phase, Phase::Stopped);
        assert_eq!(state.config_id, "never");
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let registry = Registry::new();
        let mut rx = registry.subscribe();
        registry.set_status(RunState::starting("a"));
        registry.set_status(RunState::error("a", "boom"));

        assert_eq!(rx.recv().await.unwrap().phase, Phase::Starting);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.phase, Phase::Error);
        assert_eq!(registry.status("a"), last);
    }
}
