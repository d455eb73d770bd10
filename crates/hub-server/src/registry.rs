//! Routing table from server id to the live session.

use std::collections::HashMap;
use std::sync::Mutex;

use l4d2_bridge_protocol::ErrorCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::SessionCommand;

/// Handle used to reach a session worker from outside.
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub server_id: String,
    /// Distinguishes successive sessions of the same server id.
    pub conn_id: u64,
    pub commands: mpsc::Sender<SessionCommand>,
    /// Cancelled by the worker once teardown is complete.
    pub closed: CancellationToken,
}

impl SessionHandle {
    /// Asks the worker to close and waits for its teardown.
    pub async fn close(&self, code: ErrorCode, reason: &str) {
        let cmd = SessionCommand::Close {
            code,
            reason: reason.to_string(),
        };
        if self.commands.send(cmd).await.is_err() {
            // Worker already gone.
            return;
        }
        self.closed.cancelled().await;
    }
}

/// Process-wide session map.
///
/// Every operation holds the lock only for the map access itself.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `handle` unless a session for the same id exists, in which
    /// case that session's handle is returned.
    pub(crate) fn insert_if_absent(&self, handle: SessionHandle) -> Result<(), SessionHandle> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(&handle.server_id) {
            return Err(existing.clone());
        }
        sessions.insert(handle.server_id.clone(), handle);
        Ok(())
    }

    /// Removes the entry only if it still belongs to `conn_id`.
    pub(crate) fn remove_if(&self, server_id: &str, conn_id: u64) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.get(server_id).is_some_and(|h| h.conn_id == conn_id) {
            sessions.remove(server_id);
            return true;
        }
        false
    }

    pub(crate) fn get(&self, server_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().unwrap().get(server_id).cloned()
    }

    pub(crate) fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(server_id)
    }

    /// Connected server ids, sorted.
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
