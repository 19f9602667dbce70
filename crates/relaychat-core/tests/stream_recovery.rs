//! Stream lifecycle tests against a hand-rolled local relay
//!
//! Each test binds a TCP listener and speaks just enough HTTP to exercise
//! the engine: accept the signed POST, reply with `text/event-stream`
//! headers, then script the body (events, heartbeats, silence, or an
//! immediate close). This verifies the reconnect loop, the watchdog and the
//! merge path against a real socket rather than mocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use relaychat_core::canonical::canonicalize;
use relaychat_core::crypto::{self, KeyBlob};
use relaychat_core::handshake;
use relaychat_core::identity::{parse_wire_pub, verify_signature};
use relaychat_core::{
    Contact, EngineConfig, Identity, Speaker, SyncEngine, SyncEvent, SyncMode, SyncStatus,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

const SSE_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/event-stream\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
\r\n";

/// Engine timings shrunk for test speed; ratios match the deployed values.
fn fast_config(server_url: String, data_dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::new(server_url, data_dir);
    config.connect_timeout = Duration::from_secs(2);
    config.backoff_floor = Duration::from_millis(100);
    config.backoff_cap = Duration::from_millis(1000);
    config.watchdog_interval = Duration::from_millis(100);
    config.idle_threshold = Duration::from_millis(500);
    config
}

async fn engine_against(addr: std::net::SocketAddr) -> (SyncEngine, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = fast_config(format!("http://{}", addr), dir.path());
    let engine = SyncEngine::new(config).await.unwrap();
    (engine, dir)
}

/// Read one HTTP request (head plus Content-Length body) off the socket.
async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        let n = match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&tmp[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let mut content_length = 0usize;
            for line in head.lines() {
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
            }
            if buf.len() >= pos + 4 + content_length {
                return String::from_utf8_lossy(&buf).into_owned();
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn request_body(request: &str) -> Option<&str> {
    request.split("\r\n\r\n").nth(1)
}

/// Build the wire JSON for one hybrid-encrypted event item.
fn encrypted_event(
    sender: &Identity,
    recipient: &Identity,
    password: &str,
    text: &str,
    ts: i64,
) -> String {
    let wire_text = handshake::embed(password, text);
    let aad = crypto::message_aad(sender.uid(), recipient.uid(), ts);
    let payload = crypto::encrypt(wire_text.as_bytes(), aad.as_bytes()).unwrap();
    let sealed = crypto::seal_key_blob(
        recipient.public_key(),
        &KeyBlob::from_payload(&payload).to_json().unwrap(),
    )
    .unwrap();

    serde_json::json!({
        "from": sender.uid(),
        "ts": ts.to_string(),
        "key": sealed,
        "msg": BASE64.encode(&payload.ciphertext),
    })
    .to_string()
}

/// Wait for a specific event, discarding others.
async fn wait_for(
    events: &mut broadcast::Receiver<SyncEvent>,
    mut pred: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_stream_delivers_and_merges() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (engine, _dir) = engine_against(addr).await;

    let peer = Identity::generate().unwrap();
    let contact = Contact::from_wire_pub(peer.wire_pub(), "Alice", "1234");
    let uid = contact.uid.clone();
    engine.store().upsert_contact(contact).await.unwrap();

    let event_json = encrypted_event(&peer, engine.identity(), "1234", "hello", 1700000100);
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _request = read_request(&mut socket).await;
            socket.write_all(SSE_HEADERS).await.unwrap();
            socket
                .write_all(format!("data: {}\n\n", event_json).as_bytes())
                .await
                .unwrap();
            // Keep the stream alive with heartbeats so the watchdog stays
            // quiet while the test asserts
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if socket.write_all(b": keep-alive\n").await.is_err() {
                    break;
                }
            }
        }
    });

    let mut events = engine.subscribe();
    engine.start(SyncMode::Contact(uid.clone())).await.unwrap();

    let event = wait_for(&mut events, |e| {
        matches!(e, SyncEvent::HistoryChanged { .. })
    })
    .await;
    match event {
        SyncEvent::HistoryChanged { uid: changed, added } => {
            assert_eq!(changed, uid);
            assert_eq!(added, 1);
        }
        _ => unreachable!(),
    }

    let history = engine.store().read_history(&uid).await.unwrap();
    let message = &history["1700000100"];
    assert_eq!(message.speaker, Speaker::Peer);
    assert_eq!(message.text, "hello");

    engine.stop().await;
    assert_eq!(engine.status(), SyncStatus::Stopped);
}

#[tokio::test]
async fn test_handshake_failure_surfaces_and_blocks_merge() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (engine, _dir) = engine_against(addr).await;

    let peer = Identity::generate().unwrap();
    // Stored password differs from what the peer embeds
    let contact = Contact::from_wire_pub(peer.wire_pub(), "Alice", "0000");
    let uid = contact.uid.clone();
    engine.store().upsert_contact(contact).await.unwrap();

    let event_json = encrypted_event(&peer, engine.identity(), "1234", "hello", 1700000100);
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _request = read_request(&mut socket).await;
            socket.write_all(SSE_HEADERS).await.unwrap();
            socket
                .write_all(format!("data: {}\n\n", event_json).as_bytes())
                .await
                .unwrap();
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if socket.write_all(b": keep-alive\n").await.is_err() {
                    break;
                }
            }
        }
    });

    let mut events = engine.subscribe();
    engine.start(SyncMode::Contact(uid.clone())).await.unwrap();

    let event = wait_for(&mut events, |e| {
        matches!(e, SyncEvent::HandshakeFailed { .. })
    })
    .await;
    match event {
        SyncEvent::HandshakeFailed { uid: failed } => assert_eq!(failed, uid),
        _ => unreachable!(),
    }

    // History untouched beyond the placeholder
    let history = engine.store().read_history(&uid).await.unwrap();
    assert_eq!(history.len(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn test_reconnects_after_stream_drop_at_floor_delay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (engine, _dir) = engine_against(addr).await;

    let peer = Identity::generate().unwrap();
    let contact = Contact::from_wire_pub(peer.wire_pub(), "Alice", "1234");
    let uid = contact.uid.clone();
    engine.store().upsert_contact(contact).await.unwrap();

    let connections = Arc::new(AtomicUsize::new(0));
    let connections_srv = connections.clone();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            connections_srv.fetch_add(1, Ordering::SeqCst);
            let _request = read_request(&mut socket).await;
            // Headers then immediate close: the cycle reaches Streaming
            // and ends gracefully
            let _ = socket.write_all(SSE_HEADERS).await;
        }
    });

    let mut events = engine.subscribe();
    engine.start(SyncMode::Contact(uid)).await.unwrap();

    // Collect a few backoff periods; every cycle streamed, so each delay
    // must be back at the floor
    let mut floors = 0;
    while floors < 3 {
        let event = wait_for(&mut events, |e| {
            matches!(e, SyncEvent::StatusChanged { status: SyncStatus::Backoff { .. } })
        })
        .await;
        if let SyncEvent::StatusChanged {
            status: SyncStatus::Backoff { delay },
        } = event
        {
            assert_eq!(delay, Duration::from_millis(100));
            floors += 1;
        }
    }

    assert!(connections.load(Ordering::SeqCst) >= 3);
    engine.stop().await;
}

#[tokio::test]
async fn test_backoff_grows_while_connect_fails() {
    // Bind and drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (engine, _dir) = engine_against(addr).await;
    let peer = Identity::generate().unwrap();
    let contact = Contact::from_wire_pub(peer.wire_pub(), "Alice", "1234");
    let uid = contact.uid.clone();
    engine.store().upsert_contact(contact).await.unwrap();

    let mut events = engine.subscribe();
    engine.start(SyncMode::Contact(uid)).await.unwrap();

    let mut delays = Vec::new();
    while delays.len() < 3 {
        let event = wait_for(&mut events, |e| {
            matches!(e, SyncEvent::StatusChanged { status: SyncStatus::Backoff { .. } })
        })
        .await;
        if let SyncEvent::StatusChanged {
            status: SyncStatus::Backoff { delay },
        } = event
        {
            delays.push(delay.as_millis() as u64);
        }
    }

    // Consecutive connect failures double the delay
    assert_eq!(delays, vec![100, 200, 400]);
    engine.stop().await;
}

#[tokio::test]
async fn test_watchdog_reconnects_half_open_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (engine, _dir) = engine_against(addr).await;

    let peer = Identity::generate().unwrap();
    let contact = Contact::from_wire_pub(peer.wire_pub(), "Alice", "1234");
    let uid = contact.uid.clone();
    engine.store().upsert_contact(contact).await.unwrap();

    let connections = Arc::new(AtomicUsize::new(0));
    let connections_srv = connections.clone();
    tokio::spawn(async move {
        // Keep every accepted socket open but silent: no error, no bytes,
        // exactly the half-open shape the watchdog exists for
        let mut held = Vec::new();
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            connections_srv.fetch_add(1, Ordering::SeqCst);
            let _request = read_request(&mut socket).await;
            let _ = socket.write_all(SSE_HEADERS).await;
            held.push(socket);
        }
    });

    engine.start(SyncMode::Contact(uid)).await.unwrap();

    // Idle threshold is 500ms; the watchdog must cancel and the loop must
    // reconnect without any transport error
    timeout(Duration::from_secs(10), async {
        while connections.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("watchdog never forced a reconnect");

    engine.stop().await;
    assert_eq!(engine.status(), SyncStatus::Stopped);
}

#[tokio::test]
async fn test_stream_request_is_signed_and_carries_cursor() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (engine, _dir) = engine_against(addr).await;

    let peer = Identity::generate().unwrap();
    let contact = Contact::from_wire_pub(peer.wire_pub(), "Alice", "1234");
    let uid = contact.uid.clone();
    engine.store().upsert_contact(contact).await.unwrap();

    let (request_tx, mut request_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let _ = request_tx.send(request);
            let _ = socket.write_all(SSE_HEADERS).await;
        }
    });

    engine.start(SyncMode::Contact(uid.clone())).await.unwrap();

    let request = timeout(Duration::from_secs(10), request_rx.recv())
        .await
        .unwrap()
        .unwrap();
    engine.stop().await;

    assert!(request.starts_with("POST /stream"));
    let body = request_body(&request).expect("request had no body");
    let envelope: serde_json::Value = serde_json::from_str(body).unwrap();

    // The envelope carries sig/pub/data, data carries type, ts and cursor
    assert_eq!(envelope["data"]["type"], "pull");
    assert_eq!(envelope["data"]["uid"], uid.as_str());
    assert_eq!(envelope["data"]["since"], "0");
    assert!(envelope["data"]["ts"].is_string());

    // The signature verifies over the canonical form of data, with the
    // key the envelope itself presents
    let sender_key = parse_wire_pub(envelope["pub"].as_str().unwrap()).unwrap();
    let canonical = canonicalize(&envelope["data"]);
    let sig = BASE64.decode(envelope["sig"].as_str().unwrap()).unwrap();
    assert!(verify_signature(&sender_key, canonical.as_bytes(), &sig));
}

#[tokio::test]
async fn test_broadcast_stream_routes_by_origin() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (engine, _dir) = engine_against(addr).await;

    let alice = Identity::generate().unwrap();
    let bob = Identity::generate().unwrap();
    let alice_contact = Contact::from_wire_pub(alice.wire_pub(), "Alice", "aa");
    let bob_contact = Contact::from_wire_pub(bob.wire_pub(), "Bob", "bb");
    let alice_uid = alice_contact.uid.clone();
    let bob_uid = bob_contact.uid.clone();
    engine.store().upsert_contact(alice_contact).await.unwrap();
    engine.store().upsert_contact(bob_contact).await.unwrap();

    let from_alice = encrypted_event(&alice, engine.identity(), "aa", "hi from alice", 1700000201);
    let from_bob = encrypted_event(&bob, engine.identity(), "bb", "hi from bob", 1700000202);

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _request = read_request(&mut socket).await;
            socket.write_all(SSE_HEADERS).await.unwrap();
            socket
                .write_all(format!("data: {}\n\ndata: {}\n\n", from_alice, from_bob).as_bytes())
                .await
                .unwrap();
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if socket.write_all(b": keep-alive\n").await.is_err() {
                    break;
                }
            }
        }
    });

    let mut events = engine.subscribe();
    engine.start(SyncMode::Broadcast).await.unwrap();

    let mut changed = std::collections::HashSet::new();
    while changed.len() < 2 {
        let event = wait_for(&mut events, |e| {
            matches!(e, SyncEvent::HistoryChanged { .. })
        })
        .await;
        if let SyncEvent::HistoryChanged { uid, .. } = event {
            changed.insert(uid);
        }
    }
    assert!(changed.contains(&alice_uid));
    assert!(changed.contains(&bob_uid));

    let alice_history = engine.store().read_history(&alice_uid).await.unwrap();
    assert_eq!(alice_history["1700000201"].text, "hi from alice");
    let bob_history = engine.store().read_history(&bob_uid).await.unwrap();
    assert_eq!(bob_history["1700000202"].text, "hi from bob");

    engine.stop().await;
}

#[tokio::test]
async fn test_start_is_idempotent_for_active_mode() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (engine, _dir) = engine_against(addr).await;

    let peer = Identity::generate().unwrap();
    let contact = Contact::from_wire_pub(peer.wire_pub(), "Alice", "1234");
    let uid = contact.uid.clone();
    engine.store().upsert_contact(contact).await.unwrap();

    let connections = Arc::new(AtomicUsize::new(0));
    let connections_srv = connections.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            connections_srv.fetch_add(1, Ordering::SeqCst);
            let _request = read_request(&mut socket).await;
            let _ = socket.write_all(SSE_HEADERS).await;
            // Heartbeat forever so the session stays in Streaming
            let mut keepalive = socket;
            held.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if keepalive.write_all(b": keep-alive\n").await.is_err() {
                        break;
                    }
                }
            }));
        }
    });

    engine.start(SyncMode::Contact(uid.clone())).await.unwrap();

    // Wait until the first stream is up
    timeout(Duration::from_secs(10), async {
        while engine.status() != SyncStatus::Streaming {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // Same-mode start must not tear down and rebuild
    engine.start(SyncMode::Contact(uid)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert_eq!(engine.status(), SyncStatus::Streaming);

    engine.stop().await;
    assert_eq!(engine.status(), SyncStatus::Stopped);
}
