//! Key generation, NIP-19 encodings and the persisted identity record.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use bech32::{FromBase32, ToBase32, Variant};
use secp256k1::{Keypair, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const NSEC_HRP: &str = "nsec";
const NPUB_HRP: &str = "npub";

/// Label written into exported key backups.
pub const BACKUP_APP_LABEL: &str = "Nostravel - Fügen Winter Sports";

/// A secp256k1 keypair with its share (`npub`) and secret (`nsec`) forms.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
}

impl Keys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut secp256k1::rand::thread_rng());
        Self { keypair }
    }

    /// Decode an `nsec1…` string. Anything else, including a valid `npub`,
    /// is rejected with [`Error::InvalidKeyFormat`].
    pub fn from_nsec(secret: &str) -> Result<Self> {
        let (hrp, data, variant) = bech32::decode(secret.trim())
            .map_err(|e| Error::InvalidKeyFormat(e.to_string()))?;
        if hrp != NSEC_HRP {
            return Err(Error::InvalidKeyFormat(format!(
                "expected {NSEC_HRP} key, got {hrp}"
            )));
        }
        if variant != Variant::Bech32 {
            return Err(Error::InvalidKeyFormat("unexpected bech32m checksum".into()));
        }
        let bytes =
            Vec::<u8>::from_base32(&data).map_err(|e| Error::InvalidKeyFormat(e.to_string()))?;
        let sk = SecretKey::from_slice(&bytes).map_err(|e| Error::InvalidKeyFormat(e.to_string()))?;
        let secp = Secp256k1::new();
        Ok(Self {
            keypair: Keypair::from_secret_key(&secp, &sk),
        })
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Hex x-only public key, as carried in the event `pubkey` field.
    pub fn public_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    /// Share form.
    pub fn npub(&self) -> String {
        encode_bech32(NPUB_HRP, &self.keypair.x_only_public_key().0.serialize())
    }

    /// Secret form.
    pub fn nsec(&self) -> String {
        encode_bech32(NSEC_HRP, &self.keypair.secret_bytes())
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("npub", &self.npub())
            .finish_non_exhaustive()
    }
}

fn encode_bech32(hrp: &str, bytes: &[u8]) -> String {
    // hrp is a lowercase constant, so encoding cannot fail.
    bech32::encode(hrp, bytes.to_base32(), Variant::Bech32).unwrap_or_default()
}

/// User-facing profile attached to every originated event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub name: String,
}

impl Profile {
    /// Build a profile, rejecting blank names.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(Error::InvalidProfile("name must not be empty".into()));
        }
        Ok(Self { name })
    }
}

/// A fully bound identity: keys plus profile, never one without the other.
#[derive(Debug, Clone)]
pub struct Identity {
    pub keys: Keys,
    pub profile: Profile,
}

/// On-disk record under the identity storage key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    #[serde(rename = "secretKeyEncoded")]
    secret_key_encoded: String,
    profile: Profile,
}

/// Key backup document handed to the user after onboarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBackup {
    pub npub: String,
    pub nsec: String,
    /// RFC 3339 creation time.
    pub created: String,
    pub app: String,
}

/// Owns the local identity and its persisted record at `path`.
pub struct IdentityManager {
    path: PathBuf,
    current: Option<Identity>,
}

impl IdentityManager {
    /// Create a manager persisting to `path`. Nothing is read until
    /// [`restore`](Self::restore) is called.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fresh keypair; binds nothing until [`persist`](Self::persist).
    pub fn generate(&self) -> Keys {
        let keys = Keys::generate();
        debug!(npub = %keys.npub(), "generated keypair");
        keys
    }

    /// Decode a user-supplied `nsec`; binds nothing until persisted.
    pub fn import(&self, secret: &str) -> Result<Keys> {
        Keys::from_nsec(secret)
    }

    /// Write `{secretKeyEncoded, profile}` and bind the identity in memory.
    /// Overwrites any previous record.
    pub fn persist(&mut self, keys: Keys, profile: Profile) -> Result<()> {
        let record = StoredIdentity {
            secret_key_encoded: keys.nsec(),
            profile: profile.clone(),
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&record)?)?;
        info!(npub = %keys.npub(), name = %profile.name, "identity saved");
        self.current = Some(Identity { keys, profile });
        Ok(())
    }

    /// Load and bind the persisted identity.
    ///
    /// A missing record yields `None`. A record that does not decode is
    /// deleted and also yields `None`, so the host falls back to onboarding.
    /// A record that cannot be read at all is left in place.
    pub fn restore(&mut self) -> Option<&Identity> {
        match self.load() {
            Ok(identity) => {
                self.current = identity;
            }
            Err(Error::StorageCorruption(reason)) => {
                warn!(path = %self.path.display(), %reason, "discarding corrupted identity");
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(error = %e, "failed to remove corrupted identity");
                }
                self.current = None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "identity record unreadable");
                self.current = None;
            }
        }
        self.current.as_ref()
    }

    fn load(&self) -> Result<Option<Identity>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.path)?;
        let record: StoredIdentity =
            serde_json::from_str(&data).map_err(|e| Error::StorageCorruption(e.to_string()))?;
        let keys = Keys::from_nsec(&record.secret_key_encoded)
            .map_err(|e| Error::StorageCorruption(e.to_string()))?;
        let profile =
            Profile::new(record.profile.name).map_err(|e| Error::StorageCorruption(e.to_string()))?;
        Ok(Some(Identity { keys, profile }))
    }

    /// Remove the persisted record and forget the in-memory keys.
    pub fn clear(&mut self) -> Result<()> {
        self.current = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.is_some()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.current.as_ref()
    }

    /// Rename the bound profile and rewrite the record.
    pub fn set_profile(&mut self, name: &str) -> Result<()> {
        let profile = Profile::new(name)?;
        let keys = self
            .current
            .as_ref()
            .map(|id| id.keys.clone())
            .ok_or(Error::NotAuthenticated)?;
        self.persist(keys, profile)
    }

    /// Backup document for the bound identity.
    pub fn export_backup(&self) -> Option<KeyBackup> {
        self.current.as_ref().map(|id| KeyBackup {
            npub: id.keys.npub(),
            nsec: id.keys.nsec(),
            created: chrono::Utc::now().to_rfc3339(),
            app: BACKUP_APP_LABEL.to_string(),
        })
    }
}

/// Write `data` to `path` through a temp file in the same directory.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let tmp = tempfile::NamedTempFile::new_in(&parent)?;
    fs::write(tmp.path(), data)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
