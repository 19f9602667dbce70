//! Streaming synchronization engine
//!
//! The sync module keeps a long-lived server-sent-event stream open against
//! the relay and merges whatever arrives into the message store.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  SyncEngine                                                    │
//! │  ├── session: Mutex<Option<Session>>   (one stream at a time)  │
//! │  │   └── run loop task + CancellationToken                     │
//! │  ├── status: shared SyncStatus                                 │
//! │  └── event_tx: broadcast::Sender<SyncEvent>                    │
//! │                                                                │
//! │  Per connection cycle                                          │
//! │  ├── stream task: open, frame lines, decrypt, merge            │
//! │  └── watchdog task: cancels the cycle when the line flow stops │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection lifecycle
//!
//! `Stopped → Connecting → Streaming → Backoff → Connecting → …`
//!
//! The backoff delay doubles only across cycles that never reached
//! `Streaming`; any cycle that streamed resets the delay to the floor. The
//! watchdog is what turns a half-open connection (bytes stopped, transport
//! silent) into an ordinary reconnect.

mod backoff;
mod engine;
mod events;
mod stream;

pub use backoff::Backoff;
pub use engine::{EngineConfig, SyncEngine};
pub use events::{SyncEvent, SyncMode, SyncStatus};
pub use stream::{LineBuffer, SseFrame, SseParser};
