//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};

/// Public relays used when writing a fresh `.env`.
pub const DEFAULT_RELAYS: [&str; 4] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr-pub.wellorder.net",
];

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relay endpoints; at least one.
    pub relays: Vec<String>,
    /// File holding the persisted identity record.
    pub identity_path: PathBuf,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Upper bound for a single endpoint connection attempt.
    pub connect_timeout: Duration,
    /// Period of the location re-share timer.
    pub location_interval: Duration,
    /// Subscriptions ask for events newer than now minus this window.
    pub since_window: Duration,
    /// Delay before demo data is delivered while offline.
    pub demo_delay: Duration,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        if relays.is_empty() {
            bail!("RELAYS must list at least one relay URL");
        }
        let identity_path = PathBuf::from(env::var("IDENTITY_PATH").context("IDENTITY_PATH")?);
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        Ok(Self {
            relays,
            identity_path,
            tor_socks,
            connect_timeout: Duration::from_secs(env_u64("CONNECT_TIMEOUT_SECS", 10)),
            location_interval: Duration::from_secs(env_u64("LOCATION_INTERVAL_SECS", 30)),
            since_window: Duration::from_secs(env_u64("SINCE_WINDOW_SECS", 86_400)),
            demo_delay: Duration::from_millis(env_u64("DEMO_DELAY_MS", 2_000)),
        })
    }
}

/// Read a numeric variable, falling back to `default` when unset or invalid.
fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
