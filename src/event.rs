//! Nostr event model, hashing and Schnorr signing.

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Kind used for every location and photo note (NIP-01 short text note).
pub const KIND_TEXT_NOTE: u32 = 1;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the rest carry data. This app writes
/// `["t", <topic>]` markers and a `["geohash", <token>]` spatial hint; any
/// other tag on inbound events is preserved verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a two-element tag such as `["t", "photo"]`.
    pub fn new(key: &str, value: impl Into<String>) -> Self {
        Tag(vec![key.to_string(), value.into()])
    }

    /// `["t", value]` topic marker.
    pub fn topic(value: impl Into<String>) -> Self {
        Self::new("t", value)
    }

    pub fn key(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as published to and received from relays.
///
/// ```json
/// {
///   "id": "4376c65d…",
///   "pubkey": "6e468422…",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "nostravel"], ["t", "location"], ["t", "fugen"]],
///   "content": "{\"type\":\"location\",…}",
///   "sig": "908a15e4…"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number.
    pub kind: u32,
    /// Unix timestamp of creation, in seconds.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    /// Event content body; for this app a JSON document.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Event fields prior to hashing and signing.
#[derive(Debug, Clone)]
pub struct UnsignedEvent {
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(kind: u32, tags: Vec<Tag>, content: String) -> Self {
        Self {
            kind,
            created_at: unix_now(),
            tags,
            content,
        }
    }

    /// Derive `pubkey`, `id` and `sig` from `keypair`. The result is immutable
    /// from the caller's point of view: changing any field breaks `verify`.
    pub fn sign(self, keypair: &Keypair) -> Result<Event> {
        let secp = Secp256k1::signing_only();
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        let hash = canonical_hash(&pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(hash), keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.serialize()),
        })
    }
}

impl Event {
    /// Recompute the NIP-01 hash from this event's fields.
    pub fn hash(&self) -> Result<[u8; 32]> {
        canonical_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Verify the event ID and Schnorr signature.
    pub fn verify(&self) -> Result<()> {
        let hash = self.hash()?;
        if hex::encode(hash) != self.id {
            return Err(Error::Signature("id mismatch".into()));
        }
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &Message::from_digest(hash), &pk)?;
        Ok(())
    }

    /// Values of all `t` tags in order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .filter(|t| t.key() == Some("t"))
            .filter_map(Tag::value)
    }

    /// First `geohash` tag value, if any.
    pub fn geohash(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key() == Some("geohash"))
            .and_then(Tag::value)
    }
}

/// SHA-256 over the canonical array `[0, pubkey, created_at, kind, tags, content]`.
fn canonical_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current Unix time in milliseconds, the unit used for capture timestamps.
pub fn unix_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
