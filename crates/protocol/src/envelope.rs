use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants::{MessageType, PROTOCOL_VERSION};
use crate::ids::{new_msg_id, new_nonce, unix_now};
use crate::messages::Body;
use crate::signing::{self, AuthError};
use crate::ProtocolError;

/// Signed unit of wire communication.
///
/// The `payload` field uses `serde_json::value::RawValue` so the exact bytes
/// received are the bytes verified: payload JSON is never re-serialized
/// between the wire and the signature check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub msg_id: String,
    pub server_id: String,
    pub ts: i64,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(default)]
    pub sig: String,
}

impl Envelope {
    /// Creates an unsigned envelope stamped with a fresh id, nonce and the
    /// current time.
    pub fn new(
        body: &Body,
        server_id: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let payload = match body.to_json()? {
            Some(json) => Some(RawValue::from_string(json)?),
            None => None,
        };
        Ok(Self {
            v: PROTOCOL_VERSION,
            msg_type: body.message_type(),
            msg_id: new_msg_id(),
            server_id: server_id.into(),
            ts: unix_now(),
            nonce: new_nonce(),
            channel: channel.into(),
            payload,
            sig: String::new(),
        })
    }

    /// Creates and signs an envelope in one step.
    pub fn signed(
        body: &Body,
        server_id: impl Into<String>,
        channel: impl Into<String>,
        secret: &[u8],
    ) -> Result<Self, ProtocolError> {
        let mut env = Self::new(body, server_id, channel)?;
        env.sign(secret)?;
        Ok(env)
    }

    /// Parses a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deterministic signing input:
    /// `v|type|msg_id|server_id|ts|nonce|channel|` followed by the payload
    /// bytes exactly as transmitted (empty when there is no payload).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let header = format!(
            "{}|{}|{}|{}|{}|{}|{}|",
            self.v,
            self.msg_type.as_str(),
            self.msg_id,
            self.server_id,
            self.ts,
            self.nonce,
            self.channel
        );
        let mut bytes = header.into_bytes();
        if let Some(raw) = &self.payload {
            bytes.extend_from_slice(raw.get().as_bytes());
        }
        bytes
    }

    pub fn sign(&mut self, secret: &[u8]) -> Result<(), AuthError> {
        self.sig = signing::sign(&self.canonical_bytes(), secret)?;
        Ok(())
    }

    /// Checks signature and timestamp against the receiver clock `now`.
    pub fn verify(&self, secret: &[u8], now: i64, window: Duration) -> Result<(), AuthError> {
        signing::verify(
            &self.canonical_bytes(),
            &self.sig,
            secret,
            self.ts,
            now,
            window,
        )
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    fn required<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        self.parse_payload()?
            .ok_or(ProtocolError::MissingPayload(self.msg_type))
    }

    /// Parses the payload into the variant matching `msg_type`.
    pub fn body(&self) -> Result<Body, ProtocolError> {
        Ok(match self.msg_type {
            MessageType::Auth => Body::Auth(self.required()?),
            MessageType::AuthAck => Body::AuthAck(self.required()?),
            MessageType::Heartbeat => Body::Heartbeat,
            MessageType::HeartbeatAck => Body::HeartbeatAck,
            MessageType::FileChunk => Body::FileChunk(self.required()?),
            MessageType::FileComplete => Body::FileComplete(self.required()?),
            MessageType::FileNotice => Body::FileNotice(self.required()?),
            MessageType::TaskResult => Body::TaskResult(self.required()?),
            MessageType::Ack => Body::Ack(self.required()?),
            MessageType::Error => Body::Error(self.required()?),
        })
    }
}
