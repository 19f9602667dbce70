//! Relay Chat Core Library
//!
//! End-to-end encrypted two-party messaging over an untrusted relay that
//! only forwards opaque blobs.
//!
//! ## Overview
//!
//! Every request to the relay is a signed envelope: the payload is
//! serialized into one canonical byte string and signed with the sender's
//! RSA key. Message bodies are hybrid-encrypted (fresh AES-256-GCM key per
//! message, sealed with the recipient's RSA key) and bound to their
//! sender, recipient and timestamp through the AEAD's associated data. A
//! per-contact shared password rides inside the plaintext as a second
//! authenticity check.
//!
//! Incoming traffic arrives over a long-lived server-sent-event stream.
//! The sync engine keeps that stream alive across failures with
//! exponential backoff and an idle watchdog, and merges decrypted messages
//! into per-contact JSON history files.
//!
//! ## Quick Start
//!
//! ```ignore
//! use relaychat_core::{Contact, EngineConfig, SyncEngine, SyncMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::new("https://relay.example", "~/.relaychat");
//!     let engine = SyncEngine::new(config).await?;
//!
//!     // Add a contact from their wire-form public key
//!     let contact = Contact::from_wire_pub(peer_wire_pub, "Alice", "1234");
//!     engine.store().upsert_contact(contact.clone()).await?;
//!
//!     // Send a message and stream replies
//!     engine.send_message(&contact.uid, "hello").await?;
//!     engine.start(SyncMode::Contact(contact.uid.clone())).await?;
//!
//!     let mut events = engine.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod canonical;
pub mod client;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use client::{RelayClient, RequestBody, ServerReply, SignedEnvelope};
pub use error::{RelayError, RelayResult};
pub use identity::{derive_uid, Identity};
pub use storage::{DecryptOutcome, MergeOutcome, MessageStore};
pub use sync::{EngineConfig, SyncEngine, SyncEvent, SyncMode, SyncStatus};
pub use types::{ChatHistory, ChatMessage, Contact, ContactCursor, Speaker, StreamItem};
