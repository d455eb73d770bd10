use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use l4d2_bridge_protocol::constants::{DEFAULT_MAX_FILE_SIZE, DEFAULT_TRANSFER_IDLE_TIMEOUT};
use l4d2_bridge_protocol::ids::new_long_id;
use l4d2_bridge_protocol::{ErrorCode, FileChunk, FileComplete};
use tracing::{debug, info, warn};

use crate::assembly::{Assembled, Assembly, Placement};
use crate::chunked::calculate_file_checksum;
use crate::types::{Direction, Transfer, TransferDeclaration, TransferState};
use crate::validation::ExtensionPolicy;
use crate::TransferError;

/// Limits and storage settings shared by every transfer of a table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub policy: ExtensionPolicy,
    pub max_file_size: u64,
    pub idle_timeout: Duration,
    /// How long terminal transfers are remembered for idempotent replies.
    pub retention: Duration,
    /// Directory for spool files. `None` buffers in memory.
    pub staging_dir: Option<PathBuf>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            policy: ExtensionPolicy::default(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            idle_timeout: DEFAULT_TRANSFER_IDLE_TIMEOUT,
            retention: Duration::from_secs(60),
            staging_dir: None,
        }
    }
}

/// A verified inbound file.
#[derive(Debug)]
pub struct CompletedFile {
    pub transfer_id: String,
    pub file_name: String,
    pub size: u64,
    pub sha256: String,
    pub channel: String,
    pub task_id: Option<String>,
    /// Set when the envelope that completed the transfer also opened it.
    pub started: bool,
    pub content: Assembled,
}

/// A transfer that reached `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTransfer {
    pub transfer_id: String,
    pub file_name: String,
    pub direction: Direction,
    pub code: ErrorCode,
    pub message: String,
    pub task_id: Option<String>,
}

/// Result of feeding one envelope into the table.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Bytes were accepted; `started` is set on the first envelope of a
    /// transfer.
    Progress {
        received: u64,
        total: u64,
        started: bool,
    },
    /// All bytes arrived and the digest matched.
    Completed(CompletedFile),
    /// The transfer already completed; nothing new to report.
    AlreadyComplete,
    /// The transfer already failed and was reported; input is dropped.
    Ignored,
}

/// Every transfer of one session.
///
/// Owned by the session worker; not shared between tasks.
#[derive(Debug)]
pub struct TransferTable {
    config: TableConfig,
    transfers: HashMap<String, Transfer>,
}

impl TransferTable {
    pub fn new(config: TableConfig) -> Self {
        Self {
            config,
            transfers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn get(&self, transfer_id: &str) -> Option<&Transfer> {
        self.transfers.get(transfer_id)
    }

    /// Total transfers tracked, including retained terminal ones.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.transfers.values().filter(|t| t.is_active()).count()
    }

    /// Validates a declaration before any byte is buffered.
    pub fn check_declaration(&self, decl: &TransferDeclaration) -> Result<(), TransferError> {
        self.config.policy.check(&decl.file_name)?;
        if decl.total_size > self.config.max_file_size {
            return Err(TransferError::TooLarge {
                size: decl.total_size,
                limit: self.config.max_file_size,
            });
        }
        if decl.sha256.len() != 64 || !decl.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TransferError::InvalidDeclaration(format!(
                "sha256 must be 64 hex characters, got {:?}",
                decl.sha256
            )));
        }
        Ok(())
    }

    fn new_assembly(&self, transfer_id: &str, total: u64) -> Result<Assembly, TransferError> {
        match &self.config.staging_dir {
            Some(dir) => Assembly::spooled(total, spool_path(dir, transfer_id)),
            None => Ok(Assembly::in_memory(total)),
        }
    }

    /// Records a rejected declaration so later envelopes of the same
    /// transfer are dropped quietly.
    fn tombstone(
        &mut self,
        transfer_id: &str,
        decl: TransferDeclaration,
        err: &TransferError,
        now: Instant,
    ) {
        let mut t = Transfer::new(transfer_id, Direction::Inbound, decl, now);
        t.fail(err.code(), err.to_string(), now);
        self.transfers.insert(transfer_id.to_string(), t);
    }

    /// Opens an inbound transfer, or returns the outcome for a known one.
    ///
    /// `Ok(None)` means the transfer exists and is active.
    fn open_inbound(
        &mut self,
        transfer_id: &str,
        decl: TransferDeclaration,
        channel: &str,
        task_id: Option<&str>,
        now: Instant,
    ) -> Result<Option<ChunkOutcome>, TransferError> {
        if let Some(existing) = self.transfers.get_mut(transfer_id) {
            return match existing.state {
                TransferState::Complete => Ok(Some(ChunkOutcome::AlreadyComplete)),
                TransferState::Failed => Ok(Some(ChunkOutcome::Ignored)),
                _ if !existing.declaration.matches(&decl) => {
                    let err = TransferError::Inconsistent(format!(
                        "transfer {transfer_id} re-declared as {} bytes / {}",
                        decl.total_size, decl.sha256
                    ));
                    existing.fail(err.code(), err.to_string(), now);
                    Err(err)
                }
                _ => Ok(None),
            };
        }

        if let Err(err) = self.check_declaration(&decl) {
            warn!(transfer_id, file = %decl.file_name, "rejected transfer: {err}");
            self.tombstone(transfer_id, decl, &err, now);
            return Err(err);
        }

        let assembly = match self.new_assembly(transfer_id, decl.total_size) {
            Ok(a) => a,
            Err(err) => {
                self.tombstone(transfer_id, decl, &err, now);
                return Err(err);
            }
        };

        info!(
            transfer_id,
            file = %decl.file_name,
            size = decl.total_size,
            "inbound transfer started"
        );
        let mut t = Transfer::new(transfer_id, Direction::Inbound, decl, now);
        t.channel = channel.to_string();
        t.task_id = task_id.map(str::to_string);
        t.assembly = Some(assembly);
        t.start(now);
        self.transfers.insert(transfer_id.to_string(), t);
        Ok(None)
    }

    /// Places a chunk and, once every byte is present, verifies the digest.
    pub fn accept_chunk(
        &mut self,
        chunk: &FileChunk,
        channel: &str,
        now: Instant,
    ) -> Result<ChunkOutcome, TransferError> {
        let decl = TransferDeclaration::new(&chunk.file_name, chunk.total_size, &chunk.sha256);
        let started = !self.transfers.contains_key(&chunk.transfer_id);
        if let Some(outcome) = self.open_inbound(
            &chunk.transfer_id,
            decl,
            channel,
            chunk.task_id.as_deref(),
            now,
        )? {
            return Ok(outcome);
        }

        self.place(&chunk.transfer_id, chunk.offset, &chunk.data, now)?;
        debug!(
            transfer_id = %chunk.transfer_id,
            sequence = chunk.sequence,
            chunk_count = chunk.chunk_count,
            "chunk placed"
        );
        self.finish_if_complete(&chunk.transfer_id, started, now)
    }

    /// Handles the closing FILE_COMPLETE of a chunked transfer.
    ///
    /// A zero-byte file may consist of nothing but this envelope.
    pub fn accept_complete(
        &mut self,
        complete: &FileComplete,
        channel: &str,
        now: Instant,
    ) -> Result<ChunkOutcome, TransferError> {
        let decl = TransferDeclaration::new(
            &complete.file_name,
            complete.total_size,
            &complete.sha256,
        );
        let known = self.transfers.contains_key(&complete.transfer_id);
        if !known && complete.total_size > 0 {
            return Err(TransferError::NotFound(complete.transfer_id.clone()));
        }
        if let Some(outcome) = self.open_inbound(
            &complete.transfer_id,
            decl,
            channel,
            complete.task_id.as_deref(),
            now,
        )? {
            return Ok(outcome);
        }
        self.finish_if_complete(&complete.transfer_id, !known, now)
    }

    /// Runs inline FILE_NOTICE content through the same lifecycle.
    pub fn accept_inline(
        &mut self,
        transfer_id: &str,
        decl: TransferDeclaration,
        data: &[u8],
        channel: &str,
        task_id: Option<&str>,
        now: Instant,
    ) -> Result<ChunkOutcome, TransferError> {
        if data.len() as u64 != decl.total_size {
            let err = TransferError::Inconsistent(format!(
                "inline data is {} bytes, declared {}",
                data.len(),
                decl.total_size
            ));
            self.tombstone(transfer_id, decl, &err, now);
            return Err(err);
        }
        let started = !self.transfers.contains_key(transfer_id);
        if let Some(outcome) = self.open_inbound(transfer_id, decl, channel, task_id, now)? {
            return Ok(outcome);
        }
        self.place(transfer_id, 0, data, now)?;
        self.finish_if_complete(transfer_id, started, now)
    }

    /// Verifies a file that already sits on disk (object-store and
    /// downloaded content).
    pub fn accept_file(
        &mut self,
        transfer_id: &str,
        decl: TransferDeclaration,
        path: &Path,
        channel: &str,
        task_id: Option<&str>,
        now: Instant,
    ) -> Result<ChunkOutcome, TransferError> {
        if let Some(existing) = self.transfers.get(transfer_id) {
            return Ok(match existing.state {
                TransferState::Complete => ChunkOutcome::AlreadyComplete,
                _ => ChunkOutcome::Ignored,
            });
        }
        if let Err(err) = self.check_declaration(&decl) {
            self.tombstone(transfer_id, decl, &err, now);
            return Err(err);
        }

        let mut t = Transfer::new(transfer_id, Direction::Inbound, decl, now);
        t.channel = channel.to_string();
        t.task_id = task_id.map(str::to_string);
        t.start(now);
        t.state = TransferState::Verifying;

        let size = std::fs::metadata(path).map(|m| m.len());
        let result = match size {
            Ok(size) if size != t.declaration.total_size => Err(TransferError::Inconsistent(
                format!("file is {size} bytes, declared {}", t.declaration.total_size),
            )),
            Ok(_) => calculate_file_checksum(path).and_then(|actual| {
                if actual.eq_ignore_ascii_case(&t.declaration.sha256) {
                    Ok(actual)
                } else {
                    Err(TransferError::ChecksumMismatch {
                        expected: t.declaration.sha256.clone(),
                        actual,
                    })
                }
            }),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(sha256) => {
                t.add_progress(t.declaration.total_size, now);
                t.complete(now);
                let done = CompletedFile {
                    transfer_id: transfer_id.to_string(),
                    file_name: t.declaration.file_name.clone(),
                    size: t.declaration.total_size,
                    sha256,
                    channel: t.channel.clone(),
                    task_id: t.task_id.clone(),
                    started: true,
                    content: Assembled::File(path.to_path_buf()),
                };
                self.transfers.insert(transfer_id.to_string(), t);
                Ok(ChunkOutcome::Completed(done))
            }
            Err(err) => {
                t.fail(err.code(), err.to_string(), now);
                self.transfers.insert(transfer_id.to_string(), t);
                Err(err)
            }
        }
    }

    fn place(
        &mut self,
        transfer_id: &str,
        offset: u64,
        data: &[u8],
        now: Instant,
    ) -> Result<(), TransferError> {
        let t = self
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        let Some(assembly) = t.assembly.as_mut() else {
            return Err(TransferError::NotFound(transfer_id.to_string()));
        };
        match assembly.place(offset, data) {
            Ok(Placement::New(bytes)) => {
                t.add_progress(bytes, now);
                Ok(())
            }
            Ok(Placement::Duplicate) => Ok(()),
            Err(err) => {
                warn!(transfer_id, "chunk rejected: {err}");
                t.fail(err.code(), err.to_string(), now);
                Err(err)
            }
        }
    }

    fn finish_if_complete(
        &mut self,
        transfer_id: &str,
        started: bool,
        now: Instant,
    ) -> Result<ChunkOutcome, TransferError> {
        let t = self
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        let total = t.declaration.total_size;
        let complete = t.assembly.as_ref().is_some_and(Assembly::is_complete);
        if !complete {
            return Ok(ChunkOutcome::Progress {
                received: t.transferred,
                total,
                started,
            });
        }

        t.state = TransferState::Verifying;
        let Some(assembly) = t.assembly.take() else {
            return Err(TransferError::NotFound(transfer_id.to_string()));
        };
        let (content, actual) = match assembly.finish() {
            Ok(done) => done,
            Err(err) => {
                t.fail(err.code(), err.to_string(), now);
                return Err(err);
            }
        };

        if !actual.eq_ignore_ascii_case(&t.declaration.sha256) {
            content.discard();
            let err = TransferError::ChecksumMismatch {
                expected: t.declaration.sha256.clone(),
                actual,
            };
            warn!(transfer_id, "{err}");
            t.fail(err.code(), err.to_string(), now);
            return Err(err);
        }

        t.complete(now);
        info!(
            transfer_id,
            file = %t.declaration.file_name,
            size = total,
            "inbound transfer verified"
        );
        Ok(ChunkOutcome::Completed(CompletedFile {
            transfer_id: transfer_id.to_string(),
            file_name: t.declaration.file_name.clone(),
            size: total,
            sha256: actual,
            channel: t.channel.clone(),
            task_id: t.task_id.clone(),
            started,
            content,
        }))
    }

    // -----------------------------------------------------------------------
    // Outbound bookkeeping
    // -----------------------------------------------------------------------

    /// Registers an outbound transfer about to be streamed.
    pub fn begin_outbound(
        &mut self,
        transfer_id: &str,
        decl: TransferDeclaration,
        task_id: Option<&str>,
        now: Instant,
    ) {
        let mut t = Transfer::new(transfer_id, Direction::Outbound, decl, now);
        t.task_id = task_id.map(str::to_string);
        t.start(now);
        self.transfers.insert(transfer_id.to_string(), t);
    }

    pub fn outbound_progress(&mut self, transfer_id: &str, bytes: u64, now: Instant) {
        if let Some(t) = self.transfers.get_mut(transfer_id) {
            t.add_progress(bytes, now);
        }
    }

    pub fn finish_outbound(&mut self, transfer_id: &str, now: Instant) {
        if let Some(t) = self.transfers.get_mut(transfer_id) {
            if t.is_active() {
                t.complete(now);
            }
        }
    }

    /// Fails one active transfer.
    pub fn fail(
        &mut self,
        transfer_id: &str,
        code: ErrorCode,
        message: &str,
        now: Instant,
    ) -> Option<FailedTransfer> {
        let t = self.transfers.get_mut(transfer_id)?;
        if !t.is_active() {
            return None;
        }
        t.fail(code, message, now);
        Some(failed(t, code, message))
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Fails transfers idle past the timeout and forgets terminal transfers
    /// past retention.
    pub fn sweep(&mut self, now: Instant) -> Vec<FailedTransfer> {
        let idle = self.config.idle_timeout;
        let retention = self.config.retention;
        let mut timed_out = Vec::new();

        for t in self.transfers.values_mut() {
            if t.is_active() && now.saturating_duration_since(t.updated_at) >= idle {
                warn!(transfer_id = %t.id, file = %t.declaration.file_name, "transfer idle timeout");
                let err = TransferError::TimedOut;
                t.fail(err.code(), err.to_string(), now);
                timed_out.push(failed(t, err.code(), &err.to_string()));
            }
        }

        self.transfers.retain(|_, t| match t.finished_at {
            Some(done) if !t.is_active() => now.saturating_duration_since(done) < retention,
            _ => true,
        });
        timed_out
    }

    /// Fails every active transfer; used when the session goes away.
    pub fn abort_all(&mut self, code: ErrorCode, now: Instant) -> Vec<FailedTransfer> {
        let message = format!("aborted: {}", code.as_str());
        let aborted: Vec<FailedTransfer> = self
            .transfers
            .values_mut()
            .filter(|t| t.is_active())
            .map(|t| {
                t.fail(code, message.clone(), now);
                failed(t, code, &message)
            })
            .collect();
        if !aborted.is_empty() {
            info!(count = aborted.len(), code = %code, "aborted transfers");
        }
        aborted
    }
}

fn failed(t: &Transfer, code: ErrorCode, message: &str) -> FailedTransfer {
    FailedTransfer {
        transfer_id: t.id.clone(),
        file_name: t.declaration.file_name.clone(),
        direction: t.direction,
        code,
        message: message.to_string(),
        task_id: t.task_id.clone(),
    }
}

/// Spool file for one transfer. Ids are only unique within a session and
/// lose characters to sanitizing, so every spool gets a random suffix.
fn spool_path(dir: &Path, transfer_id: &str) -> PathBuf {
    let safe: String = transfer_id
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{safe}-{}.part", new_long_id()))
}
