//! Signed envelope client: request building, signing and transmission
//!
//! Every request to the relay is a JSON POST of
//! `{"sig": <base64>, "pub": <wire public key>, "data": <payload>}` where
//! the signature covers the canonical serialization of `data`. Request
//! payloads are a tagged enum here and become a JSON map only at the
//! envelope boundary.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::canonical::canonicalize;
use crate::error::RelayError;
use crate::identity::Identity;
use crate::types::ContactCursor;

/// Expected content type of a streaming response
const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// One request to the relay, one variant per wire `type` discriminator.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Deliver a message to a contact's queue
    SendMessage {
        /// Recipient uid
        to: String,
        /// RSA-sealed key blob; `None` on the legacy path
        key: Option<String>,
        /// Ciphertext, base64
        msg: String,
    },
    /// Open (or poll) a single-contact stream from a resume cursor
    PullContact { uid: String, since: i64 },
    /// Open a broadcast stream carrying every listed contact's messages
    PullBroadcast { contacts: Vec<ContactCursor> },
}

impl RequestBody {
    /// The wire `type` discriminator.
    pub fn type_tag(&self) -> &'static str {
        match self {
            RequestBody::SendMessage { .. } => "send",
            RequestBody::PullContact { .. } => "pull",
            RequestBody::PullBroadcast { .. } => "pull_all",
        }
    }

    /// Serialize into the payload map, injecting `type` and `ts`.
    pub fn to_payload(&self, ts: i64) -> Value {
        let mut payload = match self {
            RequestBody::SendMessage { to, key, msg } => {
                let mut p = json!({"to": to, "msg": msg});
                if let Some(key) = key {
                    p["key"] = json!(key);
                }
                p
            }
            RequestBody::PullContact { uid, since } => {
                json!({"uid": uid, "since": since.to_string()})
            }
            RequestBody::PullBroadcast { contacts } => json!({"contacts": contacts}),
        };
        payload["type"] = json!(self.type_tag());
        payload["ts"] = json!(ts.to_string());
        payload
    }
}

/// The signed wire envelope. Built fresh per request, never persisted.
#[derive(Debug, Serialize)]
pub struct SignedEnvelope {
    /// Base64 signature over the canonical form of `data`
    pub sig: String,
    /// Sender's wire-form public key
    #[serde(rename = "pub")]
    pub pub_key: String,
    /// The payload map
    pub data: Value,
}

/// Reply body of a request/response call.
///
/// `code == 0` is success. Send acknowledgments carry the
/// server-assigned authoritative timestamp in `ts`.
#[derive(Debug, Deserialize)]
pub struct ServerReply {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default, deserialize_with = "crate::types::opt_string_or_number")]
    pub ts: Option<String>,
    /// Queued items returned by a one-shot pull
    #[serde(default)]
    pub items: Vec<crate::types::StreamItem>,
}

/// HTTP client speaking the signed-envelope protocol.
///
/// Cheap to clone; clones share the connection pool and identity.
#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    identity: Arc<Identity>,
}

impl RelayClient {
    /// Create a client for the given relay base URL.
    pub fn new(
        base_url: impl Into<String>,
        identity: Arc<Identity>,
        connect_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RelayError::Transport(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity,
        })
    }

    /// Build and sign an envelope for a request body.
    pub fn envelope(&self, body: &RequestBody) -> Result<SignedEnvelope, RelayError> {
        self.envelope_at(body, chrono::Utc::now().timestamp())
    }

    /// Build and sign an envelope with an explicit timestamp.
    pub fn envelope_at(&self, body: &RequestBody, ts: i64) -> Result<SignedEnvelope, RelayError> {
        let data = body.to_payload(ts);
        let canonical = canonicalize(&data);
        let signature = self.identity.sign(canonical.as_bytes())?;

        Ok(SignedEnvelope {
            sig: BASE64.encode(signature),
            pub_key: self.identity.wire_pub().to_string(),
            data,
        })
    }

    /// Send a request/response envelope.
    ///
    /// Transport failures map to [`RelayError::Transport`]; a non-2xx
    /// status or a non-zero reply code maps to [`RelayError::Protocol`].
    pub async fn post(&self, body: &RequestBody) -> Result<ServerReply, RelayError> {
        self.post_at(body, chrono::Utc::now().timestamp()).await
    }

    /// Send a request/response envelope with an explicit payload timestamp.
    ///
    /// Used when the timestamp is also bound into the message's associated
    /// data and must match what was encrypted.
    pub async fn post_at(&self, body: &RequestBody, ts: i64) -> Result<ServerReply, RelayError> {
        let envelope = self.envelope_at(body, ts)?;
        debug!(request_type = body.type_tag(), "Posting envelope");

        let response = self
            .http
            .post(format!("{}/api", self.base_url))
            .json(&envelope)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Protocol(format!(
                "Server returned {}",
                status
            )));
        }

        let reply: ServerReply = response
            .json()
            .await
            .map_err(|e| RelayError::Protocol(format!("Malformed server reply: {}", e)))?;
        if reply.code != 0 {
            return Err(RelayError::Protocol(format!(
                "Server rejected request ({}): {}",
                reply.code, reply.msg
            )));
        }
        Ok(reply)
    }

    /// Open a streaming connection.
    ///
    /// The response is validated (2xx, `text/event-stream`) and returned
    /// for incremental consumption; the read itself has no timeout, since
    /// detection is the watchdog's job.
    pub async fn open_stream(&self, body: &RequestBody) -> Result<reqwest::Response, RelayError> {
        let envelope = self.envelope(body)?;
        debug!(request_type = body.type_tag(), "Opening stream");

        let response = self
            .http
            .post(format!("{}/stream", self.base_url))
            .json(&envelope)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Protocol(format!(
                "Stream request returned {}",
                status
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with(EVENT_STREAM_CONTENT_TYPE) {
            return Err(RelayError::Protocol(format!(
                "Unexpected stream content type: {}",
                content_type
            )));
        }

        Ok(response)
    }
}
