//! Key/value parameter store shared with the rest of the stack.
//!
//! The supervisor uses it for three things: reading the companion
//! application's PID (readiness gate), publishing its own "ready" flag, and
//! seeding default configuration values at boot.
//!
//! Which keys are wiped at every supervisor start is data, not code: see
//! [`KEYS`].  Keys missing from that table are never cleared.
//!
//! # Backends
//!
//! | Type | Storage |
//! |---|---|
//! | [`FileParams`] | one file per key under a directory, written atomically |
//! | [`MemoryParams`] | in-process map, for tests and embedding |

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use keel_types::KeelError;

/// Lifetime of a parameter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Survives supervisor restarts.
    Persistent,
    /// Removed by [`ParamStore::clear_all_ephemeral`] at the start of a run.
    ClearOnStart,
}

/// PID of the trusted companion application, written by that application.
pub const COMPANION_PID: &str = "CompanionPid";
/// `"1"` while the supervisor is in `RUNNING`, `"0"` otherwise.
pub const SUPERVISOR_READY: &str = "SupervisorReady";
/// Version of the supervisor that last booted.
pub const KEEL_VERSION: &str = "KeelVersion";
/// Dashcam-only mode, seeded from the `PASSIVE` environment variable.
pub const PASSIVE: &str = "Passive";

/// Known keys and their lifetimes.
pub const KEYS: &[(&str, KeyKind)] = &[
    (COMPANION_PID, KeyKind::Persistent),
    (SUPERVISOR_READY, KeyKind::ClearOnStart),
    (KEEL_VERSION, KeyKind::Persistent),
    (PASSIVE, KeyKind::Persistent),
    ("DisengageOnAccelerator", KeyKind::Persistent),
    ("HasAcceptedTerms", KeyKind::Persistent),
    ("CompletedTrainingVersion", KeyKind::Persistent),
    ("EnabledToggle", KeyKind::Persistent),
    ("CarParams", KeyKind::ClearOnStart),
    ("ControlsReady", KeyKind::ClearOnStart),
    ("PandaSignatures", KeyKind::ClearOnStart),
];

/// Key/value store contract used by the supervisor.
///
/// Implementations overwrite on `put`; no multi-key transactions are offered.
pub trait ParamStore: Send + Sync {
    /// Raw value for `key`, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KeelError>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), KeelError>;

    /// Remove `key`.  Removing an absent key succeeds.
    fn delete(&self, key: &str) -> Result<(), KeelError>;

    /// Remove every [`KeyKind::ClearOnStart`] key.
    fn clear_all_ephemeral(&self) -> Result<(), KeelError> {
        for (key, kind) in KEYS {
            if *kind == KeyKind::ClearOnStart {
                self.delete(key)?;
            }
        }
        Ok(())
    }

    /// `true` only when the stored value is exactly `"1"`.
    fn get_bool(&self, key: &str) -> Result<bool, KeelError> {
        Ok(self.get(key)?.as_deref() == Some(b"1"))
    }

    fn put_bool(&self, key: &str, value: bool) -> Result<(), KeelError> {
        self.put(key, if value { b"1" } else { b"0" })
    }
}

/// Decode a stored PID.
///
/// Decimal ASCII is preferred; anything else of at most eight bytes is read as
/// a little-endian integer.
pub fn decode_pid(raw: &[u8]) -> Option<u32> {
    if let Ok(text) = std::str::from_utf8(raw)
        && let Ok(pid) = text.trim().parse::<u32>()
    {
        return Some(pid);
    }
    if raw.is_empty() || raw.len() > 8 {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes[..raw.len()].copy_from_slice(raw);
    u32::try_from(u64::from_le_bytes(bytes)).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// FileParams
// ─────────────────────────────────────────────────────────────────────────────

/// Directory-backed store: each key is a file named after the key.
#[derive(Debug, Clone)]
pub struct FileParams {
    root: PathBuf,
}

impl FileParams {
    /// Open (creating if necessary) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, KeelError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            KeelError::Params(format!("failed to create {}: {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, KeelError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(KeelError::Params(format!("invalid key {key:?}")));
        }
        Ok(self.root.join(key))
    }
}

impl ParamStore for FileParams {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KeelError> {
        let path = self.key_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeelError::Params(format!("failed to read {key}: {e}"))),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), KeelError> {
        let path = self.key_path(key)?;
        // Readers never observe a half-written value.
        let tmp = self.root.join(format!(".{key}.tmp"));
        fs::File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(value)?;
                f.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|e| KeelError::Params(format!("failed to write {key}: {e}")))
    }

    fn delete(&self, key: &str) -> Result<(), KeelError> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeelError::Params(format!("failed to delete {key}: {e}"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryParams
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryParams {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryParams {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, KeelError> {
        self.values
            .lock()
            .map_err(|_| KeelError::Params("parameter map poisoned".to_string()))
    }
}

impl ParamStore for MemoryParams {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KeelError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), KeelError> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KeelError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
