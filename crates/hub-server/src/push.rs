//! Outbound file delivery.

use std::path::PathBuf;
use std::sync::Arc;

use l4d2_bridge_protocol::{Body, ErrorCode, FileChunk, FileComplete, FileNotice};
use l4d2_bridge_transfer::{
    ChunkReader, ExtensionPolicy, TransferError, calculate_file_checksum, checksum_bytes,
    chunk_count, safe_filename, split_bytes,
};
use tracing::debug;

use crate::connection::{Outbox, SendError};

/// Where the content of a push comes from.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// A file on the hub's disk.
    Path(PathBuf),
    /// Content already in memory, e.g. downloaded by the chat layer.
    Bytes { file_name: String, data: Vec<u8> },
    /// A link the agent downloads itself.
    Url { file_name: String, url: String },
}

impl FileSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        FileSource::Path(path.into())
    }

    pub fn bytes(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        FileSource::Bytes {
            file_name: file_name.into(),
            data,
        }
    }

    pub fn url(file_name: impl Into<String>, url: impl Into<String>) -> Self {
        FileSource::Url {
            file_name: file_name.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Content {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Url(String),
}

/// A validated push source with its digest computed.
#[derive(Debug)]
pub(crate) struct PreparedFile {
    pub file_name: String,
    pub size: u64,
    /// Empty for URL sources.
    pub sha256: String,
    pub content: Content,
}

/// How one push travels to its targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Inline,
    Chunked,
    Stored { file_id: String },
    Url,
}

/// One push to one session.
#[derive(Debug)]
pub(crate) struct PushJob {
    pub task_id: String,
    pub transfer_id: String,
    pub file: Arc<PreparedFile>,
    pub route: Route,
    pub caption: String,
    pub channel: String,
}

/// Validates the source and computes its size and digest.
pub(crate) async fn prepare(
    source: FileSource,
    policy: &ExtensionPolicy,
    max_file_size: u64,
) -> Result<PreparedFile, TransferError> {
    let check_size = |size: u64| {
        if size > max_file_size {
            Err(TransferError::TooLarge {
                size,
                limit: max_file_size,
            })
        } else {
            Ok(())
        }
    };

    match source {
        FileSource::Path(path) => {
            let raw = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let file_name = safe_filename(&raw);
            policy.check(&file_name)?;
            let size = tokio::fs::metadata(&path)
                .await
                .map_err(|_| TransferError::NotFound(path.display().to_string()))?
                .len();
            check_size(size)?;
            let hash_path = path.clone();
            let sha256 = tokio::task::spawn_blocking(move || calculate_file_checksum(&hash_path))
                .await
                .map_err(std::io::Error::other)??;
            Ok(PreparedFile {
                file_name,
                size,
                sha256,
                content: Content::Path(path),
            })
        }
        FileSource::Bytes { file_name, data } => {
            let file_name = safe_filename(&file_name);
            policy.check(&file_name)?;
            check_size(data.len() as u64)?;
            Ok(PreparedFile {
                file_name,
                size: data.len() as u64,
                sha256: checksum_bytes(&data),
                content: Content::Bytes(data),
            })
        }
        FileSource::Url { file_name, url } => {
            let file_name = safe_filename(&file_name);
            policy.check(&file_name)?;
            Ok(PreparedFile {
                file_name,
                size: 0,
                sha256: String::new(),
                content: Content::Url(url),
            })
        }
    }
}

fn send_failed(e: SendError) -> TransferError {
    match e {
        SendError::Closed => TransferError::Aborted(ErrorCode::Disconnected),
        SendError::Protocol(e) => TransferError::Io(std::io::Error::other(e)),
    }
}

fn notice(job: &PushJob) -> FileNotice {
    let mut n = FileNotice::named(&job.file.file_name, job.file.size, &job.file.sha256);
    n.transfer_id = Some(job.transfer_id.clone());
    n.caption = job.caption.clone();
    n.task_id = Some(job.task_id.clone());
    n
}

/// Sends one push. `progress` is called with the bytes of every chunk
/// handed to the socket.
pub(crate) async fn deliver(
    job: &PushJob,
    outbox: &Outbox,
    chunk_size: usize,
    progress: impl Fn(u64),
) -> Result<(), TransferError> {
    match (&job.route, &job.file.content) {
        (Route::Url, Content::Url(url)) => {
            let mut n = notice(job);
            n.url = Some(url.clone());
            outbox
                .send(&Body::FileNotice(n), &job.channel)
                .await
                .map_err(send_failed)?;
        }
        (Route::Stored { file_id }, _) => {
            let mut n = notice(job);
            n.file_id = Some(file_id.clone());
            outbox
                .send(&Body::FileNotice(n), &job.channel)
                .await
                .map_err(send_failed)?;
        }
        (Route::Inline, content) => {
            let data = match content {
                Content::Bytes(data) => data.clone(),
                Content::Path(path) => tokio::fs::read(path).await?,
                Content::Url(_) => {
                    return Err(TransferError::InvalidDeclaration(
                        "URL sources cannot be inlined".into(),
                    ));
                }
            };
            let size = data.len() as u64;
            let mut n = notice(job);
            n.data = Some(data);
            outbox
                .send(&Body::FileNotice(n), &job.channel)
                .await
                .map_err(send_failed)?;
            progress(size);
        }
        (Route::Chunked, Content::Bytes(data)) => {
            let count = chunk_count(data.len() as u64, chunk_size);
            for chunk in split_bytes(data, chunk_size) {
                let len = chunk.data.len() as u64;
                send_chunk(job, outbox, chunk, count).await?;
                progress(len);
            }
            send_complete(job, outbox).await?;
        }
        (Route::Chunked, Content::Path(path)) => {
            let mut reader = ChunkReader::new(path, chunk_size)?;
            let count = reader.chunk_count();
            loop {
                let (back, next) = tokio::task::spawn_blocking(move || {
                    let next = reader.next_chunk();
                    (reader, next)
                })
                .await
                .map_err(std::io::Error::other)?;
                reader = back;
                let Some(chunk) = next? else { break };
                let len = chunk.data.len() as u64;
                send_chunk(job, outbox, chunk, count).await?;
                progress(len);
            }
            send_complete(job, outbox).await?;
        }
        (route, _) => {
            return Err(TransferError::InvalidDeclaration(format!(
                "route {route:?} does not fit the source"
            )));
        }
    }
    debug!(transfer_id = %job.transfer_id, task_id = %job.task_id, "push handed to socket");
    Ok(())
}

async fn send_chunk(
    job: &PushJob,
    outbox: &Outbox,
    chunk: l4d2_bridge_transfer::Chunk,
    chunk_count: u32,
) -> Result<(), TransferError> {
    let body = Body::FileChunk(FileChunk {
        transfer_id: job.transfer_id.clone(),
        sequence: chunk.sequence,
        chunk_count,
        offset: chunk.offset,
        data: chunk.data,
        file_name: job.file.file_name.clone(),
        total_size: job.file.size,
        sha256: job.file.sha256.clone(),
        task_id: Some(job.task_id.clone()),
    });
    outbox.send(&body, &job.channel).await.map_err(send_failed)?;
    Ok(())
}

async fn send_complete(job: &PushJob, outbox: &Outbox) -> Result<(), TransferError> {
    let body = Body::FileComplete(FileComplete {
        transfer_id: job.transfer_id.clone(),
        file_name: job.file.file_name.clone(),
        total_size: job.file.size,
        sha256: job.file.sha256.clone(),
        task_id: Some(job.task_id.clone()),
    });
    outbox.send(&body, &job.channel).await.map_err(send_failed)?;
    Ok(())
}
