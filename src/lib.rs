//! Sync core for sharing family locations and photos over Nostr relays.
//!
//! Local actions become signed, tagged kind-1 events; inbound events are
//! verified, filtered to this application's namespace and merged into a
//! deduplicated view of who is where and what was shared.

pub mod client;
pub mod codec;
pub mod config;
pub mod demo;
pub mod error;
pub mod event;
pub mod geohash;
pub mod identity;
pub mod relay;
pub mod sync;
pub mod tracker;

pub use client::{Client, ClientOptions, DataSource};
pub use error::{Error, Result};
pub use identity::{Identity, IdentityManager, Keys, Profile};
pub use sync::{LocationRecord, PhotoRecord, SyncStore};
