//! Revocation Index — fast in-memory rejection plus durable, restart-proof
//! persistence of revoked consent tokens.
//!
//! Tokens are never stored in plaintext in the durable record: only the
//! SHA-256 hex digest of the full wire-format token string is persisted,
//! mirroring the hashing discipline the source system's revocation tests
//! enforce. The in-memory index is keyed the same way so a single lookup
//! path serves both the hot path and the lazily-imported durable path.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;

/// One revoked token, as persisted durably and mirrored in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationRecord {
    /// SHA-256 hex digest of the token's full wire-format string. Never the
    /// plaintext token.
    pub token_hash: String,
    /// Principal the token was issued to.
    pub user_id: String,
    /// Scope string the token carried.
    pub scope_str: String,
    /// Milliseconds since epoch when the revocation was recorded.
    pub revoked_at: i64,
    /// Free-text reason (e.g. `"user requested logout"`, `"not active in ledger"`).
    pub reason: String,
}

fn hash_token(token_str: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token_str.as_bytes());
    hex::encode(hasher.finalize())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Durable backend for revocation records. The in-memory [`RevocationIndex`]
/// is always authoritative for the hot path; a `RevocationStore`
/// implementation exists so revocations survive process restart.
///
/// A `sqlx`-backed implementation is a straightforward drop-in later: the
/// trait's shape already mirrors the logical schema (`token_hash` unique
/// index, `user_id`/`scope_str`/`revoked_at`/`reason` columns). Database
/// driver choice is an external collaborator, so only the trait — not a SQL
/// implementation — is part of this core.
pub trait RevocationStore: Send + Sync {
    /// Persist a revocation record. Implementations should be idempotent on
    /// `token_hash`.
    fn persist(&self, record: &RevocationRecord) -> Result<()>;

    /// Load every durably recorded revocation, for an explicit "import on
    /// restart" path. Not called eagerly by [`RevocationIndex`] itself — the
    /// index imports lazily via [`TokenCodec::validate_with_ledger`]
    /// (see `src/token.rs`) — but offered here for operators who want an
    /// eager warm-start instead.
    ///
    /// [`TokenCodec::validate_with_ledger`]: crate::token::TokenCodec::validate_with_ledger
    fn load_all(&self) -> Result<Vec<RevocationRecord>>;
}

/// File-backed [`RevocationStore`]: a JSON array at a fixed path, rewritten
/// wholesale on every revocation. Adequate for the revocation volumes this
/// core expects (human-approval-gated writes, not a hot write path) and
/// avoids pulling in a database driver, which is kept external by design.
/// A simple load/save-to-`~/.app/*.json` pattern for small amounts of
/// durable state.
pub struct FileRevocationStore {
    path: PathBuf,
}

impl FileRevocationStore {
    /// Use `path` as the backing JSON file, creating its parent directory if
    /// needed.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location: `~/.hushh-consent-core/revocations.json`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hushh-consent-core")
            .join("revocations.json")
    }

    fn read(&self) -> Vec<RevocationRecord> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn write(&self, records: &[RevocationRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::ConsentError::Internal(format!("creating revocation dir: {e}"))
            })?;
        }
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| crate::error::ConsentError::Internal(format!("serializing revocations: {e}")))?;
        std::fs::write(&self.path, json)
            .map_err(|e| crate::error::ConsentError::Internal(format!("writing revocations: {e}")))
    }
}

impl RevocationStore for FileRevocationStore {
    fn persist(&self, record: &RevocationRecord) -> Result<()> {
        let mut records = self.read();
        if let Some(existing) = records.iter_mut().find(|r| r.token_hash == record.token_hash) {
            *existing = record.clone();
        } else {
            records.push(record.clone());
        }
        self.write(&records)
    }

    fn load_all(&self) -> Result<Vec<RevocationRecord>> {
        Ok(self.read())
    }
}

/// In-memory revocation set, concurrent-read-optimised via `DashMap`, with an
/// optional durable backend for cross-restart persistence.
///
/// Reads (`is_revoked`) never touch the durable backend — it exists purely
/// so a fresh process can be told about prior revocations, either via
/// [`RevocationStore::load_all`] at startup or via the lazy import path in
/// `TokenCodec::validate_with_ledger`.
pub struct RevocationIndex {
    revoked: DashMap<String, RevocationRecord>,
    store: Option<Box<dyn RevocationStore>>,
}

impl RevocationIndex {
    /// An index with no durable backend — revocations live only as long as
    /// the process does. Suitable for tests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            revoked: DashMap::new(),
            store: None,
        }
    }

    /// An index backed by `store` for durable persistence, with no eager
    /// warm-start: per spec, durable revocations are not loaded at startup —
    /// a process that hasn't yet seen a given token simply falls through to
    /// [`TokenCodec::validate_with_ledger`](crate::token::TokenCodec::validate_with_ledger),
    /// which lazily imports the revocation from the ledger's active
    /// projection the first time that token is presented. This is the
    /// constructor [`crate::main`] uses.
    #[must_use]
    pub fn new_with_store(store: Box<dyn RevocationStore>) -> Self {
        Self {
            revoked: DashMap::new(),
            store: Some(store),
        }
    }

    /// An index backed by `store`, eagerly warm-started from every record it
    /// currently holds. Not the default startup path (see
    /// [`new_with_store`](Self::new_with_store) and spec §4.3) — offered for
    /// operators who'd rather pay an eager-load cost at boot than have a
    /// cold process briefly accept a token it hasn't yet re-derived as
    /// revoked from the ledger.
    #[must_use]
    pub fn with_store(store: Box<dyn RevocationStore>) -> Self {
        let revoked = DashMap::new();
        match store.load_all() {
            Ok(records) => {
                for record in records {
                    revoked.insert(record.token_hash.clone(), record);
                }
            }
            Err(e) => warn!(error = %e, "failed to warm-start revocation index from durable store"),
        }
        Self {
            revoked,
            store: Some(store),
        }
    }

    /// Hot-path check: `O(1)`, never suspends, never consults the durable
    /// backend.
    #[must_use]
    pub fn is_revoked(&self, token_str: &str) -> bool {
        self.revoked.contains_key(&hash_token(token_str))
    }

    /// Record a revocation, both in memory and (if configured) durably.
    pub fn revoke(&self, token_str: &str, user_id: &str, scope_str: &str, reason: &str) {
        let record = RevocationRecord {
            token_hash: hash_token(token_str),
            user_id: user_id.to_string(),
            scope_str: scope_str.to_string(),
            revoked_at: now_ms(),
            reason: reason.to_string(),
        };

        if let Some(ref store) = self.store {
            if let Err(e) = store.persist(&record) {
                warn!(error = %e, "failed to durably persist revocation; in-memory index still updated");
            }
        }

        debug!(user_id = %user_id, scope = %scope_str, reason = %reason, "token revoked");
        self.revoked.insert(record.token_hash.clone(), record);
    }

    /// Number of revocation records currently held in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    /// Whether the index currently holds no revocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

impl Default for RevocationIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn revoke_then_is_revoked() {
        let index = RevocationIndex::new();
        assert!(!index.is_revoked("HCT:abc.def"));
        index.revoke("HCT:abc.def", "u1", "attr.food.*", "logout");
        assert!(index.is_revoked("HCT:abc.def"));
    }

    #[test]
    fn token_is_never_stored_in_plaintext() {
        let index = RevocationIndex::new();
        index.revoke("HCT:super-secret-token.sig", "u1", "attr.food.*", "logout");

        let record = index.revoked.get(&hash_token("HCT:super-secret-token.sig")).unwrap();
        assert_ne!(record.token_hash, "HCT:super-secret-token.sig");
        assert_eq!(record.token_hash.len(), 64);
        assert!(record.token_hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    // ── revocation stickiness across "process restart" (invariant 3) ──────

    #[test]
    fn revocation_survives_simulated_restart() {
        let dir = tempdir().unwrap();
        let path: PathBuf = dir.path().join("revocations.json");

        {
            let store = FileRevocationStore::new(&path);
            let index = RevocationIndex::with_store(Box::new(store));
            index.revoke("HCT:tok.sig", "u1", "attr.food.*", "user requested logout");
            assert!(index.is_revoked("HCT:tok.sig"));
        } // index dropped — simulates process exit

        // Fresh process: brand new in-memory index, warm-started from disk.
        let store = FileRevocationStore::new(&path);
        let fresh_index = RevocationIndex::with_store(Box::new(store));
        assert!(fresh_index.is_revoked("HCT:tok.sig"));
    }

    #[test]
    fn file_store_is_idempotent_on_token_hash() {
        let dir = tempdir().unwrap();
        let path: PathBuf = dir.path().join("revocations.json");
        let store = FileRevocationStore::new(&path);

        let record = RevocationRecord {
            token_hash: hash_token("HCT:tok.sig"),
            user_id: "u1".to_string(),
            scope_str: "attr.food.*".to_string(),
            revoked_at: 1_000,
            reason: "first".to_string(),
        };
        store.persist(&record).unwrap();

        let mut updated = record.clone();
        updated.reason = "second".to_string();
        store.persist(&updated).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reason, "second");
    }

    #[test]
    fn fresh_index_with_no_store_starts_empty() {
        let index = RevocationIndex::new();
        assert!(index.is_empty());
    }

    #[test]
    fn new_with_store_does_not_eagerly_warm_start() {
        let dir = tempdir().unwrap();
        let path: PathBuf = dir.path().join("revocations.json");

        {
            let store = FileRevocationStore::new(&path);
            let index = RevocationIndex::with_store(Box::new(store));
            index.revoke("HCT:tok.sig", "u1", "attr.food.*", "user requested logout");
        }

        // A process started with `new_with_store` does not see the prior
        // revocation until something (the lazy import path in
        // `validate_with_ledger`) tells it about it directly.
        let store = FileRevocationStore::new(&path);
        let lazy_index = RevocationIndex::new_with_store(Box::new(store));
        assert!(!lazy_index.is_revoked("HCT:tok.sig"));
    }
}
