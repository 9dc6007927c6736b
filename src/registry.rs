//! State shared between the listener, its sessions, and the controller.
//!
//! One mutex guards both the live-session list and the inbox because their
//! invariants are coupled: a completed read both appends a chunk and moves
//! its session to the front, and a close must drop the session from the list
//! before anyone can observe its socket as shut.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::session::Session;

#[derive(Default)]
struct State {
    /// Most recently active first.
    sessions: VecDeque<Arc<Session>>,
    /// Raw chunks in completion order across all sessions.
    received: VecDeque<Vec<u8>>,
}

/// Live sessions plus the inbox, with a notification on every change that
/// could satisfy a waiting receiver.
#[derive(Default)]
pub struct Registry {
    state: Mutex<State>,
    changed: Condvar,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Every mutation completes inside one critical section, so a poisoned
        // guard still holds consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly accepted session at the front.
    pub(crate) fn insert_front(&self, session: Arc<Session>) {
        let mut state = self.lock();
        state.sessions.push_front(session);
        trace!(live = state.sessions.len(), "registry:insert");
        self.changed.notify_all();
    }

    /// Record a completed read: queue the chunk and move `session` to the
    /// front, unless it has already been closed.
    pub(crate) fn record_chunk(&self, session: &Arc<Session>, chunk: Vec<u8>) {
        let mut state = self.lock();
        state.received.push_back(chunk);
        if !session.is_closed()
            && let Some(pos) = state.sessions.iter().position(|s| Arc::ptr_eq(s, session))
            && let Some(existing) = state.sessions.remove(pos)
        {
            state.sessions.push_front(existing);
        }
        self.changed.notify_all();
    }

    /// Drop `session` from the live list. Runs `mark_closed` under the lock
    /// so no reader can see the session listed once it reports closed.
    /// Returns false if it was already closed.
    pub(crate) fn remove_with<F>(&self, session: &Arc<Session>, mark_closed: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let mut state = self.lock();
        if !mark_closed() {
            return false;
        }
        state.sessions.retain(|s| !Arc::ptr_eq(s, session));
        trace!(live = state.sessions.len(), "registry:remove");
        true
    }

    /// Take every live session out of the list, leaving it empty.
    pub(crate) fn drain_sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.drain(..).collect()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// The most recently active session, if any.
    pub fn latest(&self) -> Option<Arc<Session>> {
        self.lock().sessions.front().cloned()
    }

    /// Snapshot of live sessions, most recently active first.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.iter().cloned().collect()
    }

    /// Pop the oldest received chunk.
    pub fn pop_received(&self) -> Option<Vec<u8>> {
        self.lock().received.pop_front()
    }

    pub fn received_len(&self) -> usize {
        self.lock().received.len()
    }

    /// True when nothing has been received and left unconsumed.
    pub fn is_quiet(&self) -> bool {
        self.lock().received.is_empty()
    }

    /// Wait until at least one session is live, up to `timeout`.
    pub fn wait_for_session(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| !state.sessions.is_empty())
    }

    /// Wait until a chunk is queued, then pop the oldest one. A chunk can only
    /// be queued by a registered session, so this also covers waiting for the
    /// first session. Gives up after `timeout`.
    pub fn wait_and_pop(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if !state.received.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        state.received.pop_front()
    }

    fn wait_until<F>(&self, timeout: Duration, mut ready: F) -> bool
    where
        F: FnMut(&State) -> bool,
    {
        let guard = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| !ready(state))
            .unwrap_or_else(PoisonError::into_inner);
        ready(&*state)
    }
}
