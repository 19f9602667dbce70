//! End-to-end message flow tests: encrypt on one side, decrypt, verify and
//! merge on the other, all through the public API.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use relaychat_core::crypto::{self, KeyBlob};
use relaychat_core::handshake::{self, HandshakeOutcome};
use relaychat_core::{
    Contact, DecryptOutcome, Identity, MergeOutcome, MessageStore, Speaker, StreamItem,
};
use tempfile::tempdir;

/// Build a hybrid-encrypted stream item exactly the way a sending client
/// does: embed the password, encrypt under a fresh key bound to
/// (from, to, ts), seal the key blob with the recipient's RSA key.
fn encrypted_item(
    sender: &Identity,
    recipient: &Identity,
    password: &str,
    text: &str,
    ts: i64,
) -> StreamItem {
    let wire_text = handshake::embed(password, text);
    let aad = crypto::message_aad(sender.uid(), recipient.uid(), ts);
    let payload = crypto::encrypt(wire_text.as_bytes(), aad.as_bytes()).unwrap();
    let sealed = crypto::seal_key_blob(
        recipient.public_key(),
        &KeyBlob::from_payload(&payload).to_json().unwrap(),
    )
    .unwrap();

    serde_json::from_value(serde_json::json!({
        "from": sender.uid(),
        "ts": ts.to_string(),
        "key": sealed,
        "msg": BASE64.encode(&payload.ciphertext),
    }))
    .unwrap()
}

/// The receive side: unseal the key blob, decrypt against the event
/// context, verify the embedded password against the stored contact.
fn receive(recipient: &Identity, contact: &Contact, item: &StreamItem) -> DecryptOutcome {
    let Some(msg) = item.msg.as_deref() else {
        return DecryptOutcome::Undecryptable;
    };
    let Some(sealed) = item.key.as_deref() else {
        return DecryptOutcome::Undecryptable;
    };

    let plaintext = (|| {
        let blob = crypto::open_key_blob(recipient.private_key(), sealed)?;
        let (key, iv, tag) = KeyBlob::decode(&blob)?;
        let ciphertext = BASE64
            .decode(msg)
            .map_err(|e| relaychat_core::RelayError::DecryptionFailed(e.to_string()))?;
        let aad = crypto::message_aad(
            &contact.uid,
            recipient.uid(),
            relaychat_core::types::parse_ts(&item.ts),
        );
        crypto::decrypt(&key, &iv, &tag, &ciphertext, aad.as_bytes())
    })();

    let Ok(plaintext) = plaintext else {
        return DecryptOutcome::Undecryptable;
    };
    let Ok(text) = String::from_utf8(plaintext) else {
        return DecryptOutcome::Undecryptable;
    };

    match handshake::verify(&contact.password, &text) {
        HandshakeOutcome::Verified(text) => {
            DecryptOutcome::Message(relaychat_core::ChatMessage::new(Speaker::Peer, text))
        }
        HandshakeOutcome::Failed => DecryptOutcome::HandshakeFailed,
    }
}

#[test]
fn test_wire_plaintext_format() {
    assert_eq!(handshake::embed("1234", "hello"), "[pass=1234]hello");
}

#[tokio::test]
async fn test_password_match_stores_exact_text() {
    let sender = Identity::generate().unwrap();
    let recipient = Identity::generate().unwrap();

    let contact = Contact::from_wire_pub(sender.wire_pub(), "Alice", "1234");
    let uid = contact.uid.clone();

    let dir = tempdir().unwrap();
    let store = MessageStore::new(dir.path()).unwrap();
    store.upsert_contact(contact.clone()).await.unwrap();

    let item = encrypted_item(&sender, &recipient, "1234", "hello", 1700000100);
    let outcome = store
        .merge_incoming(&uid, &[item], |i| receive(&recipient, &contact, i))
        .await
        .unwrap();

    assert_eq!(outcome, MergeOutcome::Merged { added: 1 });

    let history = store.read_history(&uid).await.unwrap();
    let stored = &history["1700000100"];
    assert_eq!(stored.speaker, Speaker::Peer);
    // Marker stripped: exactly the original text
    assert_eq!(stored.text, "hello");
}

#[tokio::test]
async fn test_password_mismatch_leaves_history_unchanged() {
    let sender = Identity::generate().unwrap();
    let recipient = Identity::generate().unwrap();

    // Sender embeds "1234" but we have "0000" on file
    let contact = Contact::from_wire_pub(sender.wire_pub(), "Alice", "0000");
    let uid = contact.uid.clone();

    let dir = tempdir().unwrap();
    let store = MessageStore::new(dir.path()).unwrap();
    store.upsert_contact(contact.clone()).await.unwrap();

    let item = encrypted_item(&sender, &recipient, "1234", "hello", 1700000100);
    let outcome = store
        .merge_incoming(&uid, &[item], |i| receive(&recipient, &contact, i))
        .await
        .unwrap();

    assert_eq!(outcome, MergeOutcome::HandshakeFailed);

    // No peer message added; only the placeholder exists
    let history = store.read_history(&uid).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history.contains_key("0"));
}

#[tokio::test]
async fn test_one_bad_item_rejects_whole_batch() {
    let sender = Identity::generate().unwrap();
    let recipient = Identity::generate().unwrap();

    let contact = Contact::from_wire_pub(sender.wire_pub(), "Alice", "1234");
    let uid = contact.uid.clone();

    let dir = tempdir().unwrap();
    let store = MessageStore::new(dir.path()).unwrap();
    store.upsert_contact(contact.clone()).await.unwrap();

    let items = vec![
        encrypted_item(&sender, &recipient, "1234", "first", 1700000101),
        // Embedded password does not match the stored one
        encrypted_item(&sender, &recipient, "9999", "evil", 1700000102),
        encrypted_item(&sender, &recipient, "1234", "third", 1700000103),
    ];

    let outcome = store
        .merge_incoming(&uid, &items, |i| receive(&recipient, &contact, i))
        .await
        .unwrap();

    assert_eq!(outcome, MergeOutcome::HandshakeFailed);

    // Even the individually valid siblings were discarded
    let history = store.read_history(&uid).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_tampered_item_is_isolated_not_batch_fatal() {
    let sender = Identity::generate().unwrap();
    let recipient = Identity::generate().unwrap();

    let contact = Contact::from_wire_pub(sender.wire_pub(), "Alice", "1234");
    let uid = contact.uid.clone();

    let dir = tempdir().unwrap();
    let store = MessageStore::new(dir.path()).unwrap();
    store.upsert_contact(contact.clone()).await.unwrap();

    let mut tampered = encrypted_item(&sender, &recipient, "1234", "garbled", 1700000201);
    tampered.msg = Some(BASE64.encode(b"not the real ciphertext"));
    let items = vec![
        tampered,
        encrypted_item(&sender, &recipient, "1234", "fine", 1700000202),
    ];

    let outcome = store
        .merge_incoming(&uid, &items, |i| receive(&recipient, &contact, i))
        .await
        .unwrap();

    // Crypto failure is per-message: the batch still lands
    assert_eq!(outcome, MergeOutcome::Merged { added: 2 });
    let history = store.read_history(&uid).await.unwrap();
    assert_eq!(history["1700000202"].text, "fine");
    assert_eq!(history["1700000201"].text, "[decryption failed]");
}

#[tokio::test]
async fn test_both_directions_share_uid_derivation() {
    let alice = Identity::generate().unwrap();
    let bob = Identity::generate().unwrap();

    // Each side derives the other's uid from the key alone
    let bob_seen_by_alice = Contact::from_wire_pub(bob.wire_pub(), "Bob", "pw");
    let alice_seen_by_bob = Contact::from_wire_pub(alice.wire_pub(), "Alice", "pw");

    assert_eq!(bob_seen_by_alice.uid, bob.uid());
    assert_eq!(alice_seen_by_bob.uid, alice.uid());
    assert_ne!(bob_seen_by_alice.uid, alice_seen_by_bob.uid);
}
