//! Persisted message history and contact directory
//!
//! One pretty-printed JSON file per contact under `chats/`, plus a single
//! `contacts.json` directory file. Every access follows the same
//! read-full / mutate / write-full discipline, and all read-modify-write
//! cycles for the same file are serialized through a per-key async lock so
//! concurrent merges cannot interleave.
//!
//! Files are tolerant of damage: a missing or unparseable file is recreated
//! rather than treated as fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::RelayError;

mod contacts;
mod history;

pub use history::{DecryptOutcome, MergeOutcome};

/// Lock key for the contact directory file
const CONTACTS_LOCK: &str = "\u{0}contacts";

/// File-backed store for chat histories and the contact directory.
///
/// Cheap to clone; clones share the per-file locks.
#[derive(Clone)]
pub struct MessageStore {
    chats_dir: PathBuf,
    contacts_path: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl MessageStore {
    /// Open (or initialize) a store rooted at the given data directory.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, RelayError> {
        let data_dir = data_dir.as_ref();
        let chats_dir = data_dir.join("chats");
        std::fs::create_dir_all(&chats_dir)?;

        Ok(Self {
            chats_dir,
            contacts_path: data_dir.join("contacts.json"),
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Path of a contact's history file.
    pub(crate) fn history_path(&self, uid: &str) -> PathBuf {
        self.chats_dir.join(format!("{}.json", uid))
    }

    pub(crate) fn contacts_path(&self) -> &Path {
        &self.contacts_path
    }

    /// The serialized-access lock owning a given file.
    ///
    /// Histories are keyed by uid; the contacts file has its own reserved
    /// key that cannot collide with a uid.
    pub(crate) fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub(crate) fn contacts_lock(&self) -> Arc<AsyncMutex<()>> {
        self.lock_for(CONTACTS_LOCK)
    }
}
