//! Outbound operation tracking.
//!
//! A task is created when a push is submitted and resolved exactly once.
//! A broadcast task waits on several targets: it succeeds when every
//! target confirmed and fails on the first target that failed.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use l4d2_bridge_protocol::ErrorCode;
use l4d2_bridge_protocol::ids::new_long_id;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::events::{BridgeEvent, EventSender, emit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    PushFile { file_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

/// Snapshot of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Zero on success, otherwise an [`ErrorCode`] or agent-defined code.
    pub code: u16,
    pub message: String,
    pub targets: Vec<String>,
}

#[derive(Debug)]
struct Entry {
    task: Task,
    waiting: HashSet<String>,
    deadline: Instant,
    finished_at: Option<Instant>,
    watch: watch::Sender<Task>,
}

/// Process-wide task table.
#[derive(Debug)]
pub struct TaskTracker {
    entries: Mutex<HashMap<String, Entry>>,
    events: EventSender,
    delivery_timeout: Duration,
    retention: Duration,
}

impl TaskTracker {
    pub fn new(events: EventSender, delivery_timeout: Duration, retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            delivery_timeout,
            retention,
        }
    }

    /// Registers a pending task awaiting `targets` and returns its id.
    pub fn submit(&self, kind: TaskKind, targets: Vec<String>) -> String {
        let task_id = new_long_id();
        let task = Task {
            task_id: task_id.clone(),
            kind,
            status: TaskStatus::Pending,
            code: 0,
            message: String::new(),
            targets: targets.clone(),
        };
        let (watch, _) = watch::channel(task.clone());
        let entry = Entry {
            task,
            waiting: targets.into_iter().collect(),
            deadline: Instant::now() + self.delivery_timeout,
            finished_at: None,
            watch,
        };
        self.entries.lock().unwrap().insert(task_id.clone(), entry);
        debug!(task_id = %task_id, "task submitted");
        task_id
    }

    /// Resolves the whole task regardless of outstanding targets.
    ///
    /// Returns `false` when the task is unknown or already terminal.
    pub fn resolve(&self, task_id: &str, success: bool, code: u16, message: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(task_id) else {
            return false;
        };
        if entry.task.status.is_terminal() {
            return false;
        }
        entry.waiting.clear();
        self.finish(entry, success, code, message);
        true
    }

    /// Records one target's outcome.
    ///
    /// Returns `false` when the task is unknown, already terminal, or not
    /// waiting on `server_id`; the caller then treats the result as a
    /// free-standing agent report.
    pub fn resolve_target(
        &self,
        task_id: &str,
        server_id: &str,
        success: bool,
        code: u16,
        message: &str,
    ) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(task_id) else {
            return false;
        };
        if entry.task.status.is_terminal() || !entry.waiting.remove(server_id) {
            return false;
        }
        if !success {
            entry.waiting.clear();
            self.finish(entry, false, code, message);
        } else if entry.waiting.is_empty() {
            self.finish(entry, true, code, message);
        }
        true
    }

    /// Fails every pending task still waiting on `server_id`.
    pub fn fail_server(&self, server_id: &str, code: ErrorCode, message: &str) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let mut failed = 0;
        for entry in entries.values_mut() {
            if !entry.task.status.is_terminal() && entry.waiting.remove(server_id) {
                entry.waiting.clear();
                self.finish(entry, false, code.as_u16(), message);
                failed += 1;
            }
        }
        failed
    }

    fn finish(&self, entry: &mut Entry, success: bool, code: u16, message: &str) {
        entry.task.status = if success {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        entry.task.code = if success { 0 } else { code };
        entry.task.message = message.to_string();
        entry.finished_at = Some(Instant::now());
        entry.watch.send_replace(entry.task.clone());
        info!(
            task_id = %entry.task.task_id,
            success,
            code = entry.task.code,
            "task resolved"
        );
        emit(
            &self.events,
            BridgeEvent::TaskResult {
                task_id: entry.task.task_id.clone(),
                success,
                code: entry.task.code,
                message: entry.task.message.clone(),
            },
        );
    }

    pub fn poll(&self, task_id: &str) -> Option<Task> {
        self.entries
            .lock()
            .unwrap()
            .get(task_id)
            .map(|e| e.task.clone())
    }

    /// Watch channel that observes the task's transitions.
    pub fn subscribe(&self, task_id: &str) -> Option<watch::Receiver<Task>> {
        self.entries
            .lock()
            .unwrap()
            .get(task_id)
            .map(|e| e.watch.subscribe())
    }

    /// Removes and returns a terminal task. Pending tasks stay.
    pub fn take(&self, task_id: &str) -> Option<Task> {
        let mut entries = self.entries.lock().unwrap();
        if entries
            .get(task_id)
            .is_some_and(|e| e.task.status.is_terminal())
        {
            return entries.remove(task_id).map(|e| e.task);
        }
        None
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| !e.task.status.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails pending tasks past their delivery deadline and forgets
    /// terminal ones past retention. Returns the number timed out.
    pub fn expire(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let mut timed_out = 0;
        for entry in entries.values_mut() {
            if !entry.task.status.is_terminal() && now >= entry.deadline {
                entry.waiting.clear();
                self.finish(
                    entry,
                    false,
                    ErrorCode::TransferTimeout.as_u16(),
                    "delivery timed out",
                );
                timed_out += 1;
            }
        }
        let retention = self.retention;
        entries.retain(|_, e| match e.finished_at {
            Some(done) => now.saturating_duration_since(done) < retention,
            None => true,
        });
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventReceiver;
    use tokio::sync::mpsc;

    fn tracker() -> (TaskTracker, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TaskTracker::new(tx, Duration::from_secs(600), Duration::from_secs(60)),
            rx,
        )
    }

    fn push(name: &str) -> TaskKind {
        TaskKind::PushFile {
            file_name: name.into(),
        }
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let (t, mut rx) = tracker();
        let id = t.submit(push("a.vpk"), vec!["s1".into()]);
        assert_eq!(t.poll(&id).unwrap().status, TaskStatus::Pending);

        assert!(t.resolve(&id, true, 0, "done"));
        assert!(!t.resolve(&id, false, 3004, "late"));
        assert_eq!(t.poll(&id).unwrap().status, TaskStatus::Succeeded);

        assert!(matches!(
            rx.try_recv(),
            Ok(BridgeEvent::TaskResult { success: true, .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_waits_for_every_target() {
        let (t, _rx) = tracker();
        let id = t.submit(push("a.vpk"), vec!["s1".into(), "s2".into()]);
        assert!(t.resolve_target(&id, "s1", true, 0, ""));
        assert_eq!(t.poll(&id).unwrap().status, TaskStatus::Pending);
        assert!(t.resolve_target(&id, "s2", true, 0, ""));
        assert_eq!(t.poll(&id).unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn broadcast_fails_on_first_failure() {
        let (t, _rx) = tracker();
        let id = t.submit(push("a.vpk"), vec!["s1".into(), "s2".into()]);
        assert!(t.resolve_target(&id, "s1", false, 3004, "bad digest"));
        let task = t.poll(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.code, 3004);
        assert!(!t.resolve_target(&id, "s2", true, 0, ""));
    }

    #[tokio::test]
    async fn unknown_target_is_not_handled() {
        let (t, _rx) = tracker();
        let id = t.submit(push("a.vpk"), vec!["s1".into()]);
        assert!(!t.resolve_target(&id, "other", true, 0, ""));
        assert!(!t.resolve_target("missing", "s1", true, 0, ""));
    }

    #[tokio::test]
    async fn fail_server_resolves_waiting_tasks() {
        let (t, _rx) = tracker();
        let a = t.submit(push("a.vpk"), vec!["s1".into()]);
        let b = t.submit(push("b.vpk"), vec!["s2".into()]);
        assert_eq!(t.fail_server("s1", ErrorCode::Superseded, "superseded"), 1);
        let task = t.poll(&a).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.code, ErrorCode::Superseded.as_u16());
        assert_eq!(t.poll(&b).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn subscribe_observes_resolution() {
        let (t, _rx) = tracker();
        let id = t.submit(push("a.vpk"), vec!["s1".into()]);
        let mut sub = t.subscribe(&id).unwrap();
        t.resolve_target(&id, "s1", true, 0, "ok");
        sub.changed().await.unwrap();
        assert_eq!(sub.borrow().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn take_only_returns_terminal_tasks() {
        let (t, _rx) = tracker();
        let id = t.submit(push("a.vpk"), vec!["s1".into()]);
        assert!(t.take(&id).is_none());
        t.resolve(&id, true, 0, "");
        assert_eq!(t.take(&id).unwrap().status, TaskStatus::Succeeded);
        assert!(t.poll(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_tasks_time_out() {
        let (t, mut rx) = tracker();
        let id = t.submit(push("a.vpk"), vec!["s1".into()]);
        tokio::time::advance(Duration::from_secs(599)).await;
        assert_eq!(t.expire(Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(t.expire(Instant::now()), 1);
        let task = t.poll(&id).unwrap();
        assert_eq!(task.code, ErrorCode::TransferTimeout.as_u16());
        assert!(matches!(
            rx.try_recv(),
            Ok(BridgeEvent::TaskResult { success: false, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_tasks_are_pruned_after_retention() {
        let (t, _rx) = tracker();
        let id = t.submit(push("a.vpk"), vec!["s1".into()]);
        t.resolve(&id, true, 0, "");
        tokio::time::advance(Duration::from_secs(59)).await;
        t.expire(Instant::now());
        assert!(t.poll(&id).is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        t.expire(Instant::now());
        assert!(t.poll(&id).is_none());
    }
}
