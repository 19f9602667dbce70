//! Chat history files: read-merge-write operations per contact

use tracing::{debug, warn};

use super::MessageStore;
use crate::error::RelayError;
use crate::types::{ChatHistory, ChatMessage, Speaker, StreamItem};

/// Text of the System placeholder written on first access
const PLACEHOLDER_TEXT: &str = "conversation created";
/// Text stored for an item that failed to decrypt
const UNDECRYPTABLE_TEXT: &str = "[decryption failed]";

/// Result of decrypting and handshake-verifying one incoming item.
#[derive(Debug)]
pub enum DecryptOutcome {
    /// Decrypted and verified; ready to merge
    Message(ChatMessage),
    /// Decrypted but the embedded password did not match
    HandshakeFailed,
    /// Could not be decrypted at all; merged as a sentinel entry
    Undecryptable,
}

/// Result of merging a batch of incoming items.
#[derive(Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Batch merged; `added` counts newly inserted entries
    Merged { added: usize },
    /// At least one item failed handshake verification; nothing was merged
    HandshakeFailed,
}

impl MessageStore {
    /// Read a contact's history, creating a placeholder file on first
    /// access.
    ///
    /// An unparseable file is replaced by a fresh placeholder history
    /// rather than surfaced as an error.
    pub async fn read_history(&self, uid: &str) -> Result<ChatHistory, RelayError> {
        let lock = self.lock_for(uid);
        let _guard = lock.lock().await;
        self.load_history_locked(uid).await
    }

    /// Insert or overwrite a single entry.
    pub async fn upsert(
        &self,
        uid: &str,
        ts: &str,
        message: ChatMessage,
    ) -> Result<(), RelayError> {
        let lock = self.lock_for(uid);
        let _guard = lock.lock().await;

        let mut history = self.load_history_locked(uid).await?;
        history.insert(ts.to_string(), message);
        self.write_history_locked(uid, &history).await
    }

    /// Move an entry from a locally assigned timestamp to the server's
    /// authoritative one.
    ///
    /// Used after a queued outbound message is acknowledged.
    pub async fn replace_key(
        &self,
        uid: &str,
        old_ts: &str,
        new_ts: &str,
        message: ChatMessage,
    ) -> Result<(), RelayError> {
        let lock = self.lock_for(uid);
        let _guard = lock.lock().await;

        let mut history = self.load_history_locked(uid).await?;
        history.remove(old_ts);
        history.insert(new_ts.to_string(), message);
        self.write_history_locked(uid, &history).await
    }

    /// Merge a batch of incoming items, decrypting and handshake-verifying
    /// each through the supplied closure.
    ///
    /// The merge is all-or-nothing with respect to the handshake: a single
    /// [`DecryptOutcome::HandshakeFailed`] rejects the entire batch and no
    /// history entry is written, so a wrong shared secret never leaves a
    /// half-populated conversation. Undecryptable items do not abort the
    /// batch; they merge as sentinel entries.
    ///
    /// Entries whose timestamp already exists are skipped (a resumed stream
    /// replays from the last persisted timestamp).
    pub async fn merge_incoming(
        &self,
        uid: &str,
        items: &[StreamItem],
        decrypt: impl Fn(&StreamItem) -> DecryptOutcome,
    ) -> Result<MergeOutcome, RelayError> {
        let mut decrypted: Vec<(String, ChatMessage)> = Vec::with_capacity(items.len());
        for item in items {
            match decrypt(item) {
                DecryptOutcome::Message(message) => {
                    decrypted.push((item.ts.clone(), message));
                }
                DecryptOutcome::HandshakeFailed => {
                    warn!(uid, "Handshake verification failed, rejecting batch");
                    return Ok(MergeOutcome::HandshakeFailed);
                }
                DecryptOutcome::Undecryptable => {
                    decrypted.push((
                        item.ts.clone(),
                        ChatMessage::new(Speaker::Peer, UNDECRYPTABLE_TEXT),
                    ));
                }
            }
        }

        let lock = self.lock_for(uid);
        let _guard = lock.lock().await;

        let mut history = self.load_history_locked(uid).await?;
        let mut added = 0;
        for (ts, message) in decrypted {
            if !history.contains_key(&ts) {
                history.insert(ts, message);
                added += 1;
            }
        }
        if added > 0 {
            self.write_history_locked(uid, &history).await?;
        }
        debug!(uid, added, "Merged incoming batch");
        Ok(MergeOutcome::Merged { added })
    }

    /// Highest numeric timestamp currently persisted for a contact.
    ///
    /// Used as the resume cursor for stream requests. The placeholder entry
    /// at key `"0"` naturally yields 0 for a fresh conversation.
    pub async fn last_timestamp(&self, uid: &str) -> Result<i64, RelayError> {
        let history = self.read_history(uid).await?;
        Ok(history
            .keys()
            .map(|k| crate::types::parse_ts(k))
            .max()
            .unwrap_or(0))
    }

    async fn load_history_locked(&self, uid: &str) -> Result<ChatHistory, RelayError> {
        let path = self.history_path(uid);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<ChatHistory>(&bytes) {
                Ok(history) => Ok(history),
                Err(e) => {
                    warn!(uid, error = %e, "History file unparseable, recreating");
                    let history = placeholder_history();
                    self.write_history_locked(uid, &history).await?;
                    Ok(history)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let history = placeholder_history();
                self.write_history_locked(uid, &history).await?;
                Ok(history)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_history_locked(
        &self,
        uid: &str,
        history: &ChatHistory,
    ) -> Result<(), RelayError> {
        let json = serde_json::to_string_pretty(history)?;
        tokio::fs::write(self.history_path(uid), json).await?;
        Ok(())
    }
}

/// The initial history written on first access: a single System entry at
/// key `"0"`.
fn placeholder_history() -> ChatHistory {
    let mut history = ChatHistory::new();
    history.insert(
        "0".to_string(),
        ChatMessage::new(Speaker::System, PLACEHOLDER_TEXT),
    );
    history
}
