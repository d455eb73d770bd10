use serde::{Deserialize, Serialize};

use crate::codes::ErrorCode;
use crate::constants::MessageType;

// ---------------------------------------------------------------------------
// Handshake payloads
// ---------------------------------------------------------------------------

/// First envelope an agent sends after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub server_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_version: String,
}

/// Hub reply to a successful AUTH.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthAck {
    /// The id the session was registered under, after sanitizing.
    pub accepted_server: String,
    pub heartbeat_interval: u64,
}

// ---------------------------------------------------------------------------
// File payloads
// ---------------------------------------------------------------------------

/// One slice of a chunked transfer.
///
/// Every chunk repeats the transfer declaration (name, size, digest) so the
/// receiver can create the transfer from whichever chunk arrives first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    pub transfer_id: String,
    pub sequence: u32,
    pub chunk_count: u32,
    pub offset: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub file_name: String,
    pub total_size: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Closes a chunked transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileComplete {
    pub transfer_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Announces a file in one message.
///
/// Exactly one content source is expected: inline `data`, an object-store
/// `file_id`, or a `url` the receiver downloads itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNotice {
    pub file_name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl FileNotice {
    /// A notice with no content source attached yet.
    pub fn named(file_name: impl Into<String>, size: u64, sha256: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            size,
            sha256: sha256.into(),
            transfer_id: None,
            data: None,
            file_id: None,
            url: None,
            caption: String::new(),
            task_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Result and control payloads
// ---------------------------------------------------------------------------

/// Outcome of an operation, reported by the agent.
///
/// Fields beyond the fixed set (download speed, extracted archive names, ...)
/// are kept in `extra` and passed through to the command layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    pub ok: bool,
    #[serde(default)]
    pub code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Acknowledges an envelope by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub ref_msg_id: String,
}

/// Error details sent back to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ref_msg_id: String,
}

// ---------------------------------------------------------------------------
// Tagged union
// ---------------------------------------------------------------------------

/// Parsed envelope payload, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Auth(AuthRequest),
    AuthAck(AuthAck),
    Heartbeat,
    HeartbeatAck,
    FileChunk(FileChunk),
    FileComplete(FileComplete),
    FileNotice(FileNotice),
    TaskResult(TaskResult),
    Ack(Ack),
    Error(ErrorPayload),
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::Auth(_) => MessageType::Auth,
            Body::AuthAck(_) => MessageType::AuthAck,
            Body::Heartbeat => MessageType::Heartbeat,
            Body::HeartbeatAck => MessageType::HeartbeatAck,
            Body::FileChunk(_) => MessageType::FileChunk,
            Body::FileComplete(_) => MessageType::FileComplete,
            Body::FileNotice(_) => MessageType::FileNotice,
            Body::TaskResult(_) => MessageType::TaskResult,
            Body::Ack(_) => MessageType::Ack,
            Body::Error(_) => MessageType::Error,
        }
    }

    /// Serializes the payload part, `None` for payload-less types.
    pub fn to_json(&self) -> Result<Option<String>, serde_json::Error> {
        let json = match self {
            Body::Auth(p) => serde_json::to_string(p)?,
            Body::AuthAck(p) => serde_json::to_string(p)?,
            Body::Heartbeat | Body::HeartbeatAck => return Ok(None),
            Body::FileChunk(p) => serde_json::to_string(p)?,
            Body::FileComplete(p) => serde_json::to_string(p)?,
            Body::FileNotice(p) => serde_json::to_string(p)?,
            Body::TaskResult(p) => serde_json::to_string(p)?,
            Body::Ack(p) => serde_json::to_string(p)?,
            Body::Error(p) => serde_json::to_string(p)?,
        };
        Ok(Some(json))
    }

    /// Builds an ERROR body.
    pub fn error(code: ErrorCode, message: impl Into<String>, ref_msg_id: impl Into<String>) -> Self {
        Body::Error(ErrorPayload {
            code,
            message: message.into(),
            ref_msg_id: ref_msg_id.into(),
        })
    }

    pub fn ack(ref_msg_id: impl Into<String>) -> Self {
        Body::Ack(Ack {
            ref_msg_id: ref_msg_id.into(),
        })
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        data: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        data.as_ref()
            .map(|d| STANDARD.encode(d))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD
                .decode(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_chunk_data_is_base64() {
        let chunk = FileChunk {
            transfer_id: "t1".into(),
            sequence: 0,
            chunk_count: 1,
            offset: 0,
            data: b"Hello".to_vec(),
            file_name: "map01.vpk".into(),
            total_size: 5,
            sha256: "abc".into(),
            task_id: None,
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains("\"data\":\"SGVsbG8=\""));
        assert!(!json.contains("task_id"));
        let parsed: FileChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn file_chunk_rejects_bad_base64() {
        let json = r#"{"transfer_id":"t","sequence":0,"chunk_count":1,"offset":0,
            "data":"!!!","file_name":"a.vpk","total_size":1,"sha256":""}"#;
        assert!(serde_json::from_str::<FileChunk>(json).is_err());
    }

    #[test]
    fn file_notice_minimal_fields() {
        let json = r#"{"file_name":"map.vpk","url":"https://example.com/map.vpk"}"#;
        let notice: FileNotice = serde_json::from_str(json).unwrap();
        assert_eq!(notice.size, 0);
        assert!(notice.data.is_none());
        assert_eq!(notice.url.as_deref(), Some("https://example.com/map.vpk"));
    }

    #[test]
    fn file_notice_inline_data() {
        let mut notice = FileNotice::named("a.vpk", 3, "");
        notice.data = Some(vec![1, 2, 3]);
        let json = serde_json::to_string(&notice).unwrap();
        assert!(json.contains("\"data\":\"AQID\""));
        assert!(!json.contains("file_id"));
        let parsed: FileNotice = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.data, Some(vec![1, 2, 3]));
    }

    #[test]
    fn task_result_keeps_extra_fields() {
        let json = r#"{"task_id":"t1","ok":true,"file_name":"c1.vpk","speed":"2.1MB/s"}"#;
        let result: TaskResult = serde_json::from_str(json).unwrap();
        assert!(result.ok);
        assert_eq!(result.code, 0);
        assert_eq!(result.extra["speed"], "2.1MB/s");
        let back = serde_json::to_value(&result).unwrap();
        assert_eq!(back["file_name"], "c1.vpk");
    }

    #[test]
    fn error_payload_code_is_numeric() {
        let body = Body::error(ErrorCode::FileTooLarge, "too big", "m1");
        let json = body.to_json().unwrap().unwrap();
        assert!(json.contains("\"code\":3001"));
    }

    #[test]
    fn heartbeat_has_no_payload() {
        assert_eq!(Body::Heartbeat.to_json().unwrap(), None);
        assert_eq!(Body::Heartbeat.message_type(), MessageType::Heartbeat);
    }
}
