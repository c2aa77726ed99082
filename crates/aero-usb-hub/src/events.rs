//! The hub event queue and the deferred work timers that run on the dispatcher.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::activate::ActivateKind;
use crate::hub::Hub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    /// Staged hub activation (`Init2`, `Init3`).
    Activate(ActivateKind),
    /// Port indicator blink/cycle step.
    Leds,
    /// Drain the hub's TT clear list.
    TtClear,
}

struct Timer {
    due: Duration,
    hub: Arc<Hub>,
    work: Deferred,
}

#[derive(Default)]
struct QueueState {
    hubs: VecDeque<Arc<Hub>>,
    timers: Vec<Timer>,
    shutdown: bool,
}

#[derive(Default)]
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl EventQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends `hub` unless it is already queued. Returns whether it was added.
    pub(crate) fn push(&self, hub: &Arc<Hub>) -> bool {
        let mut state = self.lock();
        if state.hubs.iter().any(|h| Arc::ptr_eq(h, hub)) {
            return false;
        }
        hub.pending.fetch_add(1, Ordering::AcqRel);
        state.hubs.push_back(hub.clone());
        self.cond.notify_all();
        true
    }

    pub(crate) fn remove(&self, hub: &Arc<Hub>) {
        let mut state = self.lock();
        let before = state.hubs.len();
        state.hubs.retain(|h| !Arc::ptr_eq(h, hub));
        if state.hubs.len() != before {
            hub.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn pop(&self) -> Option<Arc<Hub>> {
        self.lock().hubs.pop_front()
    }

    /// Arms `work` for `hub` at `due`. Work that is already armed keeps its original deadline.
    pub(crate) fn schedule(&self, hub: &Arc<Hub>, work: Deferred, due: Duration) -> bool {
        let mut state = self.lock();
        if state
            .timers
            .iter()
            .any(|t| Arc::ptr_eq(&t.hub, hub) && t.work == work)
        {
            return false;
        }
        state.timers.push(Timer {
            due,
            hub: hub.clone(),
            work,
        });
        self.cond.notify_all();
        true
    }

    pub(crate) fn cancel(&self, hub: &Arc<Hub>, matches: impl Fn(Deferred) -> bool) {
        self.lock()
            .timers
            .retain(|t| !(Arc::ptr_eq(&t.hub, hub) && matches(t.work)));
    }

    /// Removes and returns the earliest timer due at or before `now`.
    pub(crate) fn take_due(&self, now: Duration) -> Option<(Arc<Hub>, Deferred)> {
        let mut state = self.lock();
        let idx = state
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= now)
            .min_by_key(|(_, t)| t.due)
            .map(|(i, _)| i)?;
        let timer = state.timers.remove(idx);
        Some((timer.hub, timer.work))
    }

    pub(crate) fn next_due(&self) -> Option<Duration> {
        self.lock().timers.iter().map(|t| t.due).min()
    }

    pub(crate) fn has_hubs(&self) -> bool {
        !self.lock().hubs.is_empty()
    }

    pub(crate) fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Blocks until a hub is queued, the queue shuts down, or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Option<Duration>) {
        let state = self.lock();
        if !state.hubs.is_empty() || state.shutdown {
            return;
        }
        match timeout {
            Some(timeout) => {
                let _ = self
                    .cond
                    .wait_timeout(state, timeout)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            None => {
                drop(
                    self.cond
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner()),
                );
            }
        }
    }
}
