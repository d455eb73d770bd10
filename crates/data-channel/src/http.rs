//! axum routes for the object channel.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use l4d2_bridge_transfer::TransferError;

use crate::error::DataChannelError;
use crate::store::{Download, FileMeta, FileStore};
use crate::token::{is_valid_file_id, validate_token};
use crate::{HEADER_FILE_NAME, HEADER_FILE_SHA256};

#[derive(Clone)]
struct HttpState {
    store: Arc<FileStore>,
    token: Arc<str>,
    base: Arc<str>,
}

#[derive(Serialize)]
struct UploadResponse<'a> {
    #[serde(flatten)]
    meta: &'a FileMeta,
    url: String,
}

#[derive(Serialize)]
struct ListResponse {
    files: Vec<FileMeta>,
}

/// Builds the object channel router mounted under `base`.
pub fn router(store: Arc<FileStore>, token: impl Into<String>, base: &str) -> Router {
    let base = base.trim_end_matches('/').to_string();
    let state = HttpState {
        store,
        token: Arc::from(token.into()),
        base: Arc::from(base.as_str()),
    };
    Router::new()
        .route(&format!("{base}/upload"), post(upload))
        .route(&format!("{base}/download"), get(download))
        .route(&format!("{base}/list"), get(list))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

fn authorize(
    state: &HttpState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), DataChannelError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let presented = bearer.or(query.get("token").map(String::as_str));
    match presented {
        Some(t) if validate_token(t, &state.token) => Ok(()),
        _ => Err(DataChannelError::Unauthorized),
    }
}

async fn upload(
    State(state): State<HttpState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, DataChannelError> {
    authorize(&state, &headers, &query)?;

    let file_name = query
        .get("file_name")
        .cloned()
        .or_else(|| {
            headers
                .get(HEADER_FILE_NAME)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| {
            DataChannelError::Rejected(TransferError::InvalidDeclaration(
                "missing file name".into(),
            ))
        })?;

    let meta = state
        .store
        .put_stream(&file_name, body.into_data_stream(), 1)
        .await?;
    info!(file_id = %meta.file_id, file = %meta.file_name, size = meta.size, "upload accepted");

    let url = format!("{}/download?file_id={}", state.base, meta.file_id);
    Ok((StatusCode::OK, axum::Json(UploadResponse { meta: &meta, url })).into_response())
}

async fn download(
    State(state): State<HttpState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, DataChannelError> {
    authorize(&state, &headers, &query)?;

    let file_id = query.get("file_id").map(String::as_str).unwrap_or_default();
    if !is_valid_file_id(file_id) {
        return Err(DataChannelError::InvalidFileId(file_id.to_string()));
    }

    let Download {
        meta,
        file,
        cleanup,
    } = state.store.open_download(file_id).await?;
    // The last permitted download deletes the file once the body is dropped.
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _ = &cleanup;
        chunk
    });
    let mut response = Body::from_stream(stream).into_response();
    let out = response.headers_mut();
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));
    if let Ok(v) = HeaderValue::from_str(&content_disposition(&meta.file_name)) {
        out.insert(header::CONTENT_DISPOSITION, v);
    }
    if let Ok(v) = HeaderValue::from_str(&meta.sha256) {
        out.insert(HEADER_FILE_SHA256, v);
    }
    Ok(response)
}

async fn list(
    State(state): State<HttpState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, DataChannelError> {
    authorize(&state, &headers, &query)?;
    let files = state.store.list();
    Ok(axum::Json(ListResponse { files }).into_response())
}

/// `attachment` disposition with an RFC 5987 encoded file name.
fn content_disposition(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_') {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    format!("attachment; filename*=UTF-8''{encoded}")
}

impl IntoResponse for DataChannelError {
    fn into_response(self) -> Response {
        let status = match &self {
            DataChannelError::Unauthorized => StatusCode::UNAUTHORIZED,
            DataChannelError::InvalidFileId(_) | DataChannelError::Empty => StatusCode::BAD_REQUEST,
            DataChannelError::NotFound(_) => StatusCode::NOT_FOUND,
            DataChannelError::Rejected(TransferError::ExtensionRejected(_)) => StatusCode::FORBIDDEN,
            DataChannelError::Rejected(TransferError::TooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            DataChannelError::Rejected(_) => StatusCode::BAD_REQUEST,
            DataChannelError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DataChannelError::Http(_) | DataChannelError::Status { .. } => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            warn!("object channel request failed: {self}");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ObjectClient;
    use crate::store::StoreConfig;
    use l4d2_bridge_transfer::checksum_bytes;
    use tempfile::TempDir;

    const TOKEN: &str = "test-token";
    const BASE: &str = "/v1/files";

    async fn serve(store: Arc<FileStore>) -> String {
        let app = router(store, TOKEN, BASE);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}{BASE}")
    }

    async fn setup() -> (TempDir, Arc<FileStore>, String) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(StoreConfig::new(dir.path().join("store"))));
        let url = serve(store.clone()).await;
        (dir, store, url)
    }

    #[test]
    fn disposition_encodes_unsafe_bytes() {
        assert_eq!(
            content_disposition("map 1.vpk"),
            "attachment; filename*=UTF-8''map%201.vpk"
        );
    }

    #[tokio::test]
    async fn upload_list_download_roundtrip() {
        let (dir, store, url) = setup().await;
        let src = dir.path().join("c5m1.vpk");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &content).unwrap();

        let client = ObjectClient::new(&url, TOKEN).unwrap();
        let meta = client.upload(&src, "c5m1.vpk").await.unwrap();
        assert_eq!(meta.size, content.len() as u64);
        assert_eq!(meta.sha256, checksum_bytes(&content));
        assert_eq!(store.len(), 1);

        let listed = client.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_id, meta.file_id);

        let dest = dir.path().join("out.vpk");
        let got = client.download(&meta.file_id, &dest).await.unwrap();
        assert_eq!(got.size, content.len() as u64);
        assert_eq!(got.sha256, meta.sha256);
        assert_eq!(std::fs::read(&dest).unwrap(), content);

        let again = client.download(&meta.file_id, &dir.path().join("again")).await;
        assert!(matches!(
            again,
            Err(DataChannelError::Status { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized() {
        let (_dir, _store, url) = setup().await;
        let client = ObjectClient::new(&url, "nope").unwrap();
        assert!(matches!(
            client.list().await,
            Err(DataChannelError::Status { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn query_token_is_accepted() {
        let (_dir, _store, url) = setup().await;
        let resp = reqwest::get(format!("{url}/list?token={TOKEN}")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let resp = reqwest::get(format!("{url}/list")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 401);
    }

    #[tokio::test]
    async fn rejected_extension_is_forbidden() {
        let (dir, store, url) = setup().await;
        let src = dir.path().join("evil.exe");
        std::fs::write(&src, b"MZ").unwrap();
        let client = ObjectClient::new(&url, TOKEN).unwrap();
        assert!(matches!(
            client.upload(&src, "evil.exe").await,
            Err(DataChannelError::Status { status: 403, .. })
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn oversized_upload_is_413() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(StoreConfig {
            max_file_size: 10,
            ..StoreConfig::new(dir.path().join("store"))
        }));
        let url = serve(store).await;
        let src = dir.path().join("big.vpk");
        std::fs::write(&src, vec![0u8; 64]).unwrap();
        let client = ObjectClient::new(&url, TOKEN).unwrap();
        assert!(matches!(
            client.upload(&src, "big.vpk").await,
            Err(DataChannelError::Status { status: 413, .. })
        ));
    }

    #[tokio::test]
    async fn malformed_file_id_is_400() {
        let (dir, _store, url) = setup().await;
        let client = ObjectClient::new(&url, TOKEN).unwrap();
        assert!(matches!(
            client.download("../../etc/passwd", &dir.path().join("x")).await,
            Err(DataChannelError::Status { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn download_carries_digest_header() {
        let (_dir, store, url) = setup().await;
        let meta = store.put_bytes("m.vpk", b"payload", 1).await.unwrap();
        let resp = reqwest::Client::new()
            .get(format!("{url}/download"))
            .query(&[("file_id", meta.file_id.as_str())])
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.headers().get(HEADER_FILE_SHA256).unwrap(),
            meta.sha256.as_str()
        );
        assert!(
            resp.headers()
                .get(header::CONTENT_DISPOSITION)
                .unwrap()
                .to_str()
                .unwrap()
                .contains("m.vpk")
        );
    }

    #[tokio::test]
    async fn large_download_streams_and_removes_the_file() {
        let (_dir, store, url) = setup().await;
        let content: Vec<u8> = (0..6 * 1024 * 1024u32).map(|i| (i % 241) as u8).collect();
        let meta = store.put_bytes("c8m5.vpk", &content, 1).await.unwrap();

        let resp = reqwest::Client::new()
            .get(format!("{url}/download"))
            .query(&[("file_id", meta.file_id.as_str())])
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.content_length(), Some(content.len() as u64));
        assert!(store.get(&meta.file_id).is_none());

        let mut received = 0usize;
        let mut body = resp.bytes_stream();
        let mut out = Vec::with_capacity(content.len());
        while let Some(piece) = body.next().await {
            let piece = piece.unwrap();
            received += 1;
            out.extend_from_slice(&piece);
        }
        assert!(received > 1, "body arrived as a single buffer");
        assert_eq!(out, content);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while meta.path.exists() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("served file should be removed");
    }
}
