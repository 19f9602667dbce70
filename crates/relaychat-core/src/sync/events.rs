//! Sync modes, status and event types

use std::fmt;
use std::time::Duration;

/// How the engine synchronizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// No stream; history moves only via explicit one-shot pulls
    Manual,
    /// One stream scoped to a single contact's messages
    Contact(String),
    /// One multiplexed stream carrying events for every known contact
    Broadcast,
}

impl SyncMode {
    /// The contact a stream is scoped to, if any.
    pub fn target_uid(&self) -> Option<&str> {
        match self {
            SyncMode::Contact(uid) => Some(uid),
            _ => None,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Manual => write!(f, "manual"),
            SyncMode::Contact(uid) => write!(f, "contact:{}", uid),
            SyncMode::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Connection state of the sync loop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// No session active
    #[default]
    Stopped,
    /// Request sent, waiting for stream headers
    Connecting,
    /// Stream open, lines flowing
    Streaming,
    /// Waiting out a reconnect delay
    Backoff {
        /// The delay being waited
        delay: Duration,
    },
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Stopped => write!(f, "Stopped"),
            SyncStatus::Connecting => write!(f, "Connecting"),
            SyncStatus::Streaming => write!(f, "Streaming"),
            SyncStatus::Backoff { delay } => write!(f, "Backoff ({}ms)", delay.as_millis()),
        }
    }
}

/// Events published on the engine's broadcast channel.
///
/// This is the surface the (out-of-scope) UI layer listens on: history
/// updates drive re-renders and notifications, handshake failures surface
/// as a distinct system-visible alert.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// New entries were merged into a contact's history
    HistoryChanged {
        /// The contact whose history changed
        uid: String,
        /// Number of entries added
        added: usize,
    },
    /// A batch was rejected because the handshake password did not match
    HandshakeFailed {
        /// The contact the batch claimed to come from
        uid: String,
    },
    /// The connection state changed
    StatusChanged {
        /// The new status
        status: SyncStatus,
    },
    /// A non-fatal error occurred (the loop keeps retrying)
    SyncError {
        /// Human-readable description
        message: String,
    },
}
