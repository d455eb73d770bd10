//! Time-bounded duplicate detection keyed by `(session, message id)`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::constants::{DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_WINDOW};

/// Ids seen on one session, oldest first.
#[derive(Debug, Default)]
struct SeenWindow {
    order: VecDeque<(i64, String)>,
    ids: HashSet<String>,
}

impl SeenWindow {
    fn evict_older_than(&mut self, cutoff: i64) {
        while let Some((seen_at, _)) = self.order.front() {
            if *seen_at >= cutoff {
                break;
            }
            if let Some((_, id)) = self.order.pop_front() {
                self.ids.remove(&id);
            }
        }
    }

    fn evict_to_capacity(&mut self, capacity: usize) {
        while self.order.len() > capacity {
            if let Some((_, id)) = self.order.pop_front() {
                self.ids.remove(&id);
            }
        }
    }
}

/// Replay filter shared by all sessions.
///
/// The outer map is read-locked on the hot path; each session has its own
/// inner lock, so filtering on one session never waits on another.
#[derive(Debug)]
pub struct ReplayFilter {
    window: Duration,
    capacity: usize,
    sessions: RwLock<HashMap<String, Arc<Mutex<SeenWindow>>>>,
}

impl Default for ReplayFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl ReplayFilter {
    pub fn new(window: Duration) -> Self {
        Self::with_capacity(window, DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_capacity(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn cutoff(&self, now: i64) -> i64 {
        now - self.window.as_secs() as i64
    }

    fn session(&self, session_id: &str) -> Arc<Mutex<SeenWindow>> {
        if let Some(w) = self.sessions.read().unwrap().get(session_id) {
            return Arc::clone(w);
        }
        let mut sessions = self.sessions.write().unwrap();
        Arc::clone(sessions.entry(session_id.to_string()).or_default())
    }

    /// Records `message_id` for `session_id` at `now`.
    ///
    /// Returns `true` when the id is fresh and the message should be
    /// processed, `false` when it was already seen within the window.
    pub fn seen(&self, session_id: &str, message_id: &str, now: i64) -> bool {
        let window = self.session(session_id);
        let mut window = window.lock().unwrap();
        window.evict_older_than(self.cutoff(now));

        if window.ids.contains(message_id) {
            return false;
        }
        window.ids.insert(message_id.to_string());
        window.order.push_back((now, message_id.to_string()));
        window.evict_to_capacity(self.capacity);
        true
    }

    /// Evicts expired ids everywhere and drops empty sessions.
    ///
    /// Returns the number of ids evicted.
    pub fn sweep(&self, now: i64) -> usize {
        let cutoff = self.cutoff(now);
        let mut evicted = 0;
        let mut sessions = self.sessions.write().unwrap();
        sessions.retain(|_, w| {
            let mut w = w.lock().unwrap();
            let before = w.order.len();
            w.evict_older_than(cutoff);
            evicted += before - w.order.len();
            !w.order.is_empty()
        });
        evicted
    }

    /// Number of ids currently remembered for `session_id`.
    pub fn len(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .unwrap()
            .get(session_id)
            .map(|w| w.lock().unwrap().order.len())
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}
