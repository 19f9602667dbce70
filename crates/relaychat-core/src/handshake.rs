//! Per-contact handshake password embedded in message plaintext
//!
//! The legacy protocol carries a shared secret inline: the sender prepends
//! `[pass=<password>]` to the text before encryption, and the receiver
//! checks it against the locally stored contact password after decryption.
//! This catches a message that decrypts fine but was produced against a
//! stale or substituted contact entry.

/// Marker prefix opening the embedded password
const MARKER_OPEN: &str = "[pass=";
/// Closing bracket must appear within this many bytes of the plaintext start
const MARKER_SCAN_LIMIT: usize = 256;

/// Result of checking a decrypted plaintext against the stored password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Password matched (or none was required); marker stripped
    Verified(String),
    /// Password mismatch, or marker missing while a password is required
    Failed,
}

/// Prepend the password marker to an outgoing plaintext.
///
/// An empty password still gets a marker so the peer can verify an empty
/// shared secret explicitly.
pub fn embed(password: &str, text: &str) -> String {
    format!("{}{}]{}", MARKER_OPEN, password, text)
}

/// Verify a decrypted plaintext against the stored contact password and
/// strip the marker.
///
/// The match is bounded: the marker must open the plaintext and close
/// within [`MARKER_SCAN_LIMIT`] bytes, so a hostile plaintext cannot make
/// the scan unbounded. A plaintext with no marker is accepted as bare text
/// only when no password is stored for the contact.
pub fn verify(stored_password: &str, plaintext: &str) -> HandshakeOutcome {
    let Some(rest) = plaintext.strip_prefix(MARKER_OPEN) else {
        // No marker at all
        if stored_password.is_empty() {
            return HandshakeOutcome::Verified(plaintext.to_string());
        }
        return HandshakeOutcome::Failed;
    };

    // Byte-wise scan: ']' is ASCII, so the found index is always a char
    // boundary even in non-ASCII plaintext
    let Some(close) = rest
        .as_bytes()
        .iter()
        .take(MARKER_SCAN_LIMIT)
        .position(|&b| b == b']')
    else {
        return HandshakeOutcome::Failed;
    };

    let embedded = &rest[..close];
    if embedded != stored_password {
        return HandshakeOutcome::Failed;
    }
    HandshakeOutcome::Verified(rest[close + 1..].to_string())
}
