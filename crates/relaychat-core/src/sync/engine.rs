//! The sync engine: session state machine, stream loop and watchdog
//!
//! One engine owns one optional session at a time. `start`/`stop`/mode
//! switches serialize through a single async mutex so two stream setups can
//! never race. Each session is one cancellable run-loop task; each
//! connection cycle inside it additionally spawns a watchdog task that
//! shares the cycle's cancellation token; cancelling that token is the
//! only mechanism used to unblock a stuck read.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use parking_lot::Mutex as ParkingMutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::events::{SyncEvent, SyncMode, SyncStatus};
use super::stream::{LineBuffer, SseFrame, SseParser};
use crate::client::{RelayClient, RequestBody};
use crate::crypto::{self, KeyBlob};
use crate::error::RelayError;
use crate::handshake::{self, HandshakeOutcome};
use crate::identity::{self, Identity};
use crate::storage::{DecryptOutcome, MergeOutcome, MessageStore};
use crate::types::{parse_ts, ChatMessage, Contact, ContactCursor, Speaker, StreamItem};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine configuration.
///
/// The timing fields default to the deployed values; tests shrink them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Relay base URL
    pub server_url: String,
    /// Directory holding the identity, histories and contact directory
    pub data_dir: PathBuf,
    /// TCP/TLS connect timeout for every request
    pub connect_timeout: Duration,
    /// First reconnect delay
    pub backoff_floor: Duration,
    /// Largest reconnect delay
    pub backoff_cap: Duration,
    /// How often the watchdog checks for progress
    pub watchdog_interval: Duration,
    /// Idle time after which the watchdog cancels the stream
    pub idle_threshold: Duration,
}

impl EngineConfig {
    pub fn new(server_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            server_url: server_url.into(),
            data_dir: data_dir.into(),
            connect_timeout: Duration::from_secs(10),
            backoff_floor: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(35),
        }
    }
}

/// An active streaming session.
struct Session {
    mode: SyncMode,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// State shared between the engine handle and its background tasks.
struct EngineInner {
    config: EngineConfig,
    identity: Arc<Identity>,
    client: RelayClient,
    store: MessageStore,
    status: ParkingMutex<SyncStatus>,
    event_tx: broadcast::Sender<SyncEvent>,
}

/// Entry point for the synchronization core.
///
/// Owns the identity, the message store, the relay client and at most one
/// streaming session.
///
/// # Example
///
/// ```ignore
/// use relaychat_core::sync::{EngineConfig, SyncEngine, SyncMode};
///
/// let config = EngineConfig::new("https://relay.example", "~/.relaychat");
/// let engine = SyncEngine::new(config).await?;
///
/// let mut events = engine.subscribe();
/// engine.start(SyncMode::Broadcast).await?;
///
/// while let Ok(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// ```
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    session: AsyncMutex<Option<Session>>,
}

impl SyncEngine {
    /// Create an engine, loading (or generating) the identity and opening
    /// the store under the configured data directory.
    pub async fn new(config: EngineConfig) -> Result<Self, RelayError> {
        std::fs::create_dir_all(&config.data_dir)?;

        let identity = Arc::new(Identity::load_or_generate(&config.data_dir)?);
        info!(uid = identity.uid(), "Identity ready");

        let store = MessageStore::new(&config.data_dir)?;
        let client = RelayClient::new(&config.server_url, identity.clone(), config.connect_timeout)?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                identity,
                client,
                store,
                status: ParkingMutex::new(SyncStatus::Stopped),
                event_tx,
            }),
            session: AsyncMutex::new(None),
        })
    }

    /// Subscribe to sync events.
    ///
    /// Multiple subscribers can exist; events are broadcast to all.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Current connection status.
    pub fn status(&self) -> SyncStatus {
        self.inner.status.lock().clone()
    }

    /// Our own routing uid.
    pub fn uid(&self) -> &str {
        self.inner.identity.uid()
    }

    /// Our identity.
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// The underlying message store.
    pub fn store(&self) -> &MessageStore {
        &self.inner.store
    }

    /// Start (or switch) the sync session.
    ///
    /// Starting the mode that is already running is a no-op. Switching
    /// modes tears the current stream down and rebuilds it; only one
    /// stream is ever open. `SyncMode::Manual` just tears down.
    pub async fn start(&self, mode: SyncMode) -> Result<(), RelayError> {
        let mut session = self.session.lock().await;

        if let Some(existing) = session.as_ref() {
            if existing.mode == mode && !existing.task.is_finished() {
                debug!(%mode, "Session already active, start is a no-op");
                return Ok(());
            }
        }

        if let Some(existing) = session.take() {
            info!(from = %existing.mode, to = %mode, "Switching sync mode");
            existing.cancel.cancel();
            let _ = existing.task.await;
        }

        if mode == SyncMode::Manual {
            self.inner.set_status(SyncStatus::Stopped);
            return Ok(());
        }

        info!(%mode, "Starting sync session");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.inner.clone(), mode.clone(), cancel.clone()));
        *session = Some(Session { mode, cancel, task });
        Ok(())
    }

    /// Stop the sync session.
    ///
    /// Cancels the in-flight call and waits for the session task (and its
    /// watchdog) to fully terminate, so no orphaned readers remain.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.take() {
            info!("Stopping sync session");
            existing.cancel.cancel();
            let _ = existing.task.await;
        }
        self.inner.set_status(SyncStatus::Stopped);
    }

    /// Encrypt and send a message to a contact.
    ///
    /// The message is stored optimistically under a local timestamp; once
    /// the relay acknowledges with its authoritative timestamp the entry is
    /// re-keyed. Returns the final history key.
    pub async fn send_message(&self, uid: &str, text: &str) -> Result<String, RelayError> {
        let inner = &self.inner;
        let contact = inner.store.get_contact(uid).await?;
        let peer_key = identity::parse_wire_pub(&contact.pub_key)?;

        let ts = chrono::Utc::now().timestamp();
        let local_ts = ts.to_string();
        inner
            .store
            .upsert(uid, &local_ts, ChatMessage::new(Speaker::Me, text))
            .await?;

        let wire_text = handshake::embed(&contact.password, text);
        let aad = crypto::message_aad(inner.identity.uid(), uid, ts);
        let payload = crypto::encrypt(wire_text.as_bytes(), aad.as_bytes())?;
        let sealed = crypto::seal_key_blob(&peer_key, &KeyBlob::from_payload(&payload).to_json()?)?;

        let body = RequestBody::SendMessage {
            to: uid.to_string(),
            key: Some(sealed),
            msg: BASE64.encode(&payload.ciphertext),
        };
        let reply = inner.client.post_at(&body, ts).await?;

        let final_ts = reply.ts.unwrap_or_else(|| local_ts.clone());
        if final_ts != local_ts {
            debug!(uid, %local_ts, %final_ts, "Re-keying message to server timestamp");
            inner
                .store
                .replace_key(uid, &local_ts, &final_ts, ChatMessage::new(Speaker::Me, text))
                .await?;
        }

        let _ = inner.event_tx.send(SyncEvent::HistoryChanged {
            uid: uid.to_string(),
            added: 1,
        });
        Ok(final_ts)
    }

    /// One-shot pull for a contact (manual mode).
    ///
    /// Fetches everything queued past our last persisted timestamp and
    /// merges it with the same policy as the stream path.
    pub async fn fetch_once(&self, uid: &str) -> Result<MergeOutcome, RelayError> {
        let since = self.inner.store.last_timestamp(uid).await?;
        let body = RequestBody::PullContact {
            uid: uid.to_string(),
            since,
        };
        let reply = self.inner.client.post(&body).await?;
        self.inner.merge_items(uid, &reply.items).await
    }
}

impl EngineInner {
    /// Update the shared status, emitting an event on change.
    fn set_status(&self, status: SyncStatus) {
        let mut current = self.status.lock();
        if *current != status {
            let previous = current.clone();
            *current = status.clone();
            drop(current);
            debug!(from = %previous, to = %status, "Status change");
            let _ = self.event_tx.send(SyncEvent::StatusChanged { status });
        }
    }

    /// Build the pull body for the session's mode, with resume cursors
    /// from the last persisted timestamps.
    async fn build_pull_body(&self, mode: &SyncMode) -> Result<RequestBody, RelayError> {
        match mode {
            SyncMode::Contact(uid) => Ok(RequestBody::PullContact {
                uid: uid.clone(),
                since: self.store.last_timestamp(uid).await?,
            }),
            SyncMode::Broadcast => {
                let contacts = self.store.read_contacts().await?;
                let mut cursors = Vec::with_capacity(contacts.len());
                for uid in contacts.keys() {
                    cursors.push(ContactCursor {
                        uid: uid.clone(),
                        ts: self.store.last_timestamp(uid).await?.to_string(),
                    });
                }
                cursors.sort_by(|a, b| a.uid.cmp(&b.uid));
                Ok(RequestBody::PullBroadcast { contacts: cursors })
            }
            SyncMode::Manual => Err(RelayError::InvalidOperation(
                "Manual mode has no stream".to_string(),
            )),
        }
    }

    /// One connection cycle: open the stream, consume it until it ends or
    /// is cancelled. Returns whether the cycle reached `Streaming`.
    async fn stream_cycle(
        &self,
        mode: &SyncMode,
        cancel: &CancellationToken,
    ) -> Result<bool, RelayError> {
        let body = self.build_pull_body(mode).await?;

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            response = self.client.open_stream(&body) => response?,
        };

        self.set_status(SyncStatus::Streaming);
        info!(%mode, "Stream established");

        // The watchdog shares this token; cancelling it is how a stuck
        // read gets unblocked.
        let stream_cancel = cancel.child_token();
        let last_alive = Arc::new(ParkingMutex::new(tokio::time::Instant::now()));
        let watchdog = tokio::spawn(watchdog_task(
            stream_cancel.clone(),
            last_alive.clone(),
            self.config.watchdog_interval,
            self.config.idle_threshold,
        ));

        let mut byte_stream = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut parser = SseParser::new();

        loop {
            let chunk = tokio::select! {
                _ = stream_cancel.cancelled() => {
                    debug!("Stream cancelled");
                    break;
                }
                chunk = byte_stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for line in lines.push(&bytes) {
                        *last_alive.lock() = tokio::time::Instant::now();
                        if let Some(SseFrame::Event(data)) = parser.push_line(&line) {
                            self.handle_event(mode, &data).await;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = self.event_tx.send(SyncEvent::SyncError {
                        message: format!("Stream read failed: {}", e),
                    });
                    break;
                }
                None => {
                    debug!("Stream ended");
                    break;
                }
            }
        }

        stream_cancel.cancel();
        let _ = watchdog.await;
        Ok(true)
    }

    /// Decode one event payload and merge its items, grouped by origin.
    ///
    /// Failures here are isolated to the event: the stream keeps running.
    async fn handle_event(&self, mode: &SyncMode, data: &str) {
        let items = match parse_event_items(data) {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Undecodable stream event");
                let _ = self.event_tx.send(SyncEvent::SyncError {
                    message: format!("Undecodable stream event: {}", e),
                });
                return;
            }
        };

        let mut groups: HashMap<String, Vec<StreamItem>> = HashMap::new();
        for item in items {
            let uid = item
                .from
                .clone()
                .or_else(|| mode.target_uid().map(str::to_string));
            match uid {
                Some(uid) => groups.entry(uid).or_default().push(item),
                None => warn!("Dropping event item without an origin uid"),
            }
        }

        for (uid, items) in groups {
            if let Err(e) = self.merge_items(&uid, &items).await {
                let _ = self.event_tx.send(SyncEvent::SyncError {
                    message: format!("Merge failed for {}: {}", uid, e),
                });
            }
        }
    }

    /// Decrypt, handshake-verify and merge a batch for one contact,
    /// publishing the outcome.
    async fn merge_items(
        &self,
        uid: &str,
        items: &[StreamItem],
    ) -> Result<MergeOutcome, RelayError> {
        if items.is_empty() {
            return Ok(MergeOutcome::Merged { added: 0 });
        }
        let contact = self.store.get_contact(uid).await?;
        let identity = self.identity.clone();
        let my_uid = identity.uid().to_string();

        let outcome = self
            .store
            .merge_incoming(uid, items, |item| {
                decrypt_item(&identity, &my_uid, &contact, item)
            })
            .await?;

        match &outcome {
            MergeOutcome::Merged { added } if *added > 0 => {
                let _ = self.event_tx.send(SyncEvent::HistoryChanged {
                    uid: uid.to_string(),
                    added: *added,
                });
            }
            MergeOutcome::Merged { .. } => {}
            MergeOutcome::HandshakeFailed => {
                let _ = self.event_tx.send(SyncEvent::HandshakeFailed {
                    uid: uid.to_string(),
                });
            }
        }
        Ok(outcome)
    }
}

/// The session task: connect, stream, back off, repeat until cancelled.
async fn run_loop(inner: Arc<EngineInner>, mode: SyncMode, cancel: CancellationToken) {
    let mut backoff = Backoff::new(inner.config.backoff_floor, inner.config.backoff_cap);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        inner.set_status(SyncStatus::Connecting);
        let reached_streaming = match inner.stream_cycle(&mode, &cancel).await {
            Ok(streamed) => streamed,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                let _ = inner.event_tx.send(SyncEvent::SyncError {
                    message: e.to_string(),
                });
                false
            }
        };

        if cancel.is_cancelled() {
            break;
        }

        // Any cycle that actually streamed starts the next retry at the
        // floor; only failed connects accumulate growth.
        if reached_streaming {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        inner.set_status(SyncStatus::Backoff { delay });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.set_status(SyncStatus::Stopped);
}

/// Liveness timer for one connection cycle.
///
/// A blocking line read cannot observe a half-open connection, so this
/// independent task cancels the shared token once the line flow has been
/// idle past the threshold. That cancellation is a liveness action, not an
/// error.
async fn watchdog_task(
    cancel: CancellationToken,
    last_alive: Arc<ParkingMutex<tokio::time::Instant>>,
    interval: Duration,
    idle_threshold: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let idle = last_alive.lock().elapsed();
        if idle > idle_threshold {
            warn!(idle_ms = idle.as_millis() as u64, "Stream idle, forcing reconnect");
            cancel.cancel();
            return;
        }
    }
}

/// Parse an event payload: either a single item object or an array.
fn parse_event_items(data: &str) -> Result<Vec<StreamItem>, RelayError> {
    if data.trim_start().starts_with('[') {
        Ok(serde_json::from_str(data)?)
    } else {
        Ok(vec![serde_json::from_str(data)?])
    }
}

/// Decrypt and handshake-verify one incoming item.
///
/// Hybrid items (with a sealed key blob) are opened against the event's
/// sender/recipient/timestamp context; items without a blob take the
/// legacy whole-plaintext RSA path. Any crypto failure is an isolated
/// [`DecryptOutcome::Undecryptable`]; only a password mismatch escalates
/// to [`DecryptOutcome::HandshakeFailed`].
fn decrypt_item(
    identity: &Identity,
    my_uid: &str,
    contact: &Contact,
    item: &StreamItem,
) -> DecryptOutcome {
    let Some(msg) = item.msg.as_deref() else {
        return DecryptOutcome::Undecryptable;
    };

    let plaintext = match item.key.as_deref() {
        Some(sealed) => decrypt_hybrid(identity, my_uid, contact, item, sealed, msg),
        None => crypto::decrypt_legacy(identity.private_key(), msg),
    };

    let plaintext = match plaintext {
        Ok(bytes) => bytes,
        Err(_) => return DecryptOutcome::Undecryptable,
    };
    let text = match String::from_utf8(plaintext) {
        Ok(text) => text,
        Err(_) => return DecryptOutcome::Undecryptable,
    };

    match handshake::verify(&contact.password, &text) {
        HandshakeOutcome::Verified(text) => {
            DecryptOutcome::Message(ChatMessage::new(Speaker::Peer, text))
        }
        HandshakeOutcome::Failed => DecryptOutcome::HandshakeFailed,
    }
}

fn decrypt_hybrid(
    identity: &Identity,
    my_uid: &str,
    contact: &Contact,
    item: &StreamItem,
    sealed: &str,
    msg_b64: &str,
) -> Result<Vec<u8>, RelayError> {
    let blob = crypto::open_key_blob(identity.private_key(), sealed)?;
    let (key, iv, tag) = KeyBlob::decode(&blob)?;
    let ciphertext = BASE64
        .decode(msg_b64)
        .map_err(|e| RelayError::DecryptionFailed(format!("Bad base64 ciphertext: {}", e)))?;

    let aad = crypto::message_aad(&contact.uid, my_uid, parse_ts(&item.ts));
    crypto::decrypt(&key, &iv, &tag, &ciphertext, aad.as_bytes())
}
