//! HTTP object channel for bulk file exchange.
//!
//! Files too large for the WebSocket envelope path are uploaded once over
//! plain HTTP, registered under a generated file id, and announced on the
//! WebSocket with a FILE_NOTICE that carries only the id. The receiving side
//! then downloads them with the same shared token.
//!
//! # Routes
//!
//! Mounted under a configurable base path (default `/v1/files`):
//!
//! - `POST {base}/upload` raw body, file name in `x-file-name`
//! - `GET {base}/download?file_id=` one-shot download
//! - `GET {base}/list`
//!
//! Every route accepts `Authorization: Bearer <token>` or `?token=`.

pub mod client;
pub mod error;
pub mod http;
pub mod store;
pub mod token;

pub use client::{DownloadedFile, ObjectClient};
pub use error::DataChannelError;
pub use http::router;
pub use store::{Download, FileMeta, FileStore, RemoveOnDrop, StoreConfig};
pub use token::{generate_file_id, is_valid_file_id, validate_token};

use std::time::Duration;

/// Maximum number of files kept in the registry.
pub const MAX_REGISTRY_ENTRIES: usize = 500;

/// How long a registered file stays downloadable.
pub const REGISTRY_TTL: Duration = Duration::from_secs(3600);

/// Request header carrying the file name on raw uploads.
pub const HEADER_FILE_NAME: &str = "x-file-name";

/// Response header carrying the SHA-256 of a download.
pub const HEADER_FILE_SHA256: &str = "x-file-sha256";

/// Timeout for establishing an HTTP connection.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
