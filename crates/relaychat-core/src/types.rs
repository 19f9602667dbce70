//! Core data types: contacts, chat messages and stream payloads

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::identity::derive_uid;

/// Who produced a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// Sent by us
    #[serde(rename = "self")]
    Me,
    /// Sent by the contact
    Peer,
    /// Generated locally (placeholders, handshake failures)
    System,
}

/// One entry in a contact's chat history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message origin tag
    pub speaker: Speaker,
    /// Display text (decrypted, marker stripped)
    pub text: String,
}

impl ChatMessage {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

/// Per-contact history: decimal unix-seconds key to message.
///
/// Chronological order is defined by the parsed numeric value of the keys,
/// not their string order; see [`sorted_entries`].
pub type ChatHistory = HashMap<String, ChatMessage>;

/// Parse a history key as seconds since epoch.
///
/// Non-numeric or invalid keys sort as epoch 0.
pub fn parse_ts(key: &str) -> i64 {
    key.parse::<i64>().unwrap_or(0)
}

/// History entries in chronological order.
///
/// Ties (including multiple unparseable keys) break on the key string so
/// the order is still deterministic.
pub fn sorted_entries(history: &ChatHistory) -> Vec<(&String, &ChatMessage)> {
    let mut entries: Vec<(&String, &ChatMessage)> = history.iter().collect();
    entries.sort_by(|(a, _), (b, _)| parse_ts(a).cmp(&parse_ts(b)).then_with(|| a.cmp(b)));
    entries
}

/// A peer in the contact directory.
///
/// The uid is derived from the peer's own wire-form public key, so both
/// sides agree on it. Only `remark` and the flags change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Routing uid (MD5 of the wire public key)
    pub uid: String,
    /// Local display label
    pub remark: String,
    /// Peer public key, wire form (base64-wrapped PEM)
    #[serde(rename = "pub")]
    pub pub_key: String,
    /// Shared handshake password
    pub password: String,
    /// Keep syncing this contact in the background
    #[serde(default)]
    pub background: bool,
    /// Pinned to the top of the contact list
    #[serde(default)]
    pub pinned: bool,
}

impl Contact {
    /// Build a contact from a peer's wire public key, deriving the uid.
    pub fn from_wire_pub(pub_key: impl Into<String>, remark: impl Into<String>, password: impl Into<String>) -> Self {
        let pub_key = pub_key.into();
        Self {
            uid: derive_uid(&pub_key),
            remark: remark.into(),
            pub_key,
            password: password.into(),
            background: false,
            pinned: false,
        }
    }
}

/// Contact directory keyed by uid.
pub type ContactDirectory = HashMap<String, Contact>;

/// Last-known timestamp cursor for one contact, sent in broadcast pulls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactCursor {
    pub uid: String,
    pub ts: String,
}

/// A decoded stream event payload.
///
/// `key` is present only for hybrid-mode messages; legacy messages carry
/// the RSA ciphertext directly in `msg`. Some server builds use `text`
/// instead of `msg`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamItem {
    /// Origin uid; absent on single-contact streams (implied by scope)
    #[serde(default)]
    pub from: Option<String>,
    /// Server-assigned timestamp (decimal seconds)
    #[serde(deserialize_with = "string_or_number")]
    pub ts: String,
    /// RSA-sealed key blob, hybrid mode only
    #[serde(default)]
    pub key: Option<String>,
    /// Ciphertext, base64
    #[serde(default, alias = "text")]
    pub msg: Option<String>,
}

/// Accept both `"1700000000"` and `1700000000` for timestamp fields.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TsRepr {
        Str(String),
        Num(i64),
    }
    Ok(match TsRepr::deserialize(deserializer)? {
        TsRepr::Str(s) => s,
        TsRepr::Num(n) => n.to_string(),
    })
}

/// Optional variant of [`string_or_number`] for reply fields.
pub(crate) fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TsRepr {
        Str(String),
        Num(i64),
    }
    Ok(Option::<TsRepr>::deserialize(deserializer)?.map(|v| match v {
        TsRepr::Str(s) => s,
        TsRepr::Num(n) => n.to_string(),
    }))
}
