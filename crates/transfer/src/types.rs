use std::time::Instant;

use l4d2_bridge_protocol::ErrorCode;

use crate::assembly::Assembly;

/// A slice of file data in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position in the chunk sequence.
    pub sequence: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    InProgress,
    Verifying,
    Complete,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed)
    }
}

/// What the sender claims about a file. Repeated on every chunk and
/// compared for consistency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDeclaration {
    pub file_name: String,
    pub total_size: u64,
    pub sha256: String,
}

impl TransferDeclaration {
    pub fn new(file_name: impl Into<String>, total_size: u64, sha256: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            total_size,
            sha256: sha256.into().to_ascii_lowercase(),
        }
    }

    /// Same file identity: size and digest.
    ///
    /// The file name is informational and not compared.
    pub fn matches(&self, other: &TransferDeclaration) -> bool {
        self.total_size == other.total_size && self.sha256.eq_ignore_ascii_case(&other.sha256)
    }
}

/// One file movement, owned by the [`TransferTable`] of its session.
///
/// [`TransferTable`]: crate::TransferTable
#[derive(Debug)]
pub struct Transfer {
    pub(crate) id: String,
    pub(crate) direction: Direction,
    pub(crate) declaration: TransferDeclaration,
    pub(crate) state: TransferState,
    pub(crate) channel: String,
    pub(crate) task_id: Option<String>,
    pub(crate) assembly: Option<Assembly>,
    pub(crate) transferred: u64,
    pub(crate) updated_at: Instant,
    pub(crate) finished_at: Option<Instant>,
    pub(crate) failure: Option<(ErrorCode, String)>,
}

impl Transfer {
    pub(crate) fn new(
        id: impl Into<String>,
        direction: Direction,
        declaration: TransferDeclaration,
        now: Instant,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            declaration,
            state: TransferState::Pending,
            channel: String::new(),
            task_id: None,
            assembly: None,
            transferred: 0,
            updated_at: now,
            finished_at: None,
            failure: None,
        }
    }

    pub(crate) fn start(&mut self, now: Instant) {
        self.state = TransferState::InProgress;
        self.updated_at = now;
    }

    pub(crate) fn add_progress(&mut self, bytes: u64, now: Instant) {
        self.transferred += bytes;
        self.updated_at = now;
    }

    pub(crate) fn complete(&mut self, now: Instant) {
        self.state = TransferState::Complete;
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// Marks the transfer failed and releases any partial buffer.
    pub(crate) fn fail(&mut self, code: ErrorCode, message: impl Into<String>, now: Instant) {
        self.state = TransferState::Failed;
        self.failure = Some((code, message.into()));
        self.updated_at = now;
        self.finished_at = Some(now);
        if let Some(assembly) = self.assembly.take() {
            assembly.discard();
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn declaration(&self) -> &TransferDeclaration {
        &self.declaration
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// Bytes received (inbound) or handed to the socket (outbound).
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn failure(&self) -> Option<&(ErrorCode, String)> {
        self.failure.as_ref()
    }
}
