//! Layered key/value storage backing session reconciliation.
//!
//! Two scopes, matching browser-equivalent storage semantics:
//! - **tab-scoped**: visible only to this client process, cleared when it
//!   ends but surviving reload — holds singleton pointers;
//! - **durable**: shared across tabs/processes and restarts — holds draft
//!   records, good-version checkpoints and offline strudel backups.
//!
//! Writes are last-write-wins; each tab mints its own draft id on first
//! local edit, so concurrent writes to the same draft id are not expected.
//! Records that fail to parse are treated as absent, never as errors.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

use reef_proto::Draft;

pub mod memory;

pub use memory::MemoryStore;

const KEY_SESSION_ID: &str = "reef.session_id";
const KEY_REDIRECT_AFTER_LOGIN: &str = "reef.redirect_after_login";
const KEY_CURRENT_DRAFT_ID: &str = "reef.current_draft_id";
const KEY_CURRENT_STRUDEL_ID: &str = "reef.current_strudel_id";
const KEY_REJOIN_TOKEN: &str = "reef.rejoin_token";
const DRAFT_PREFIX: &str = "reef.draft.";
const GOOD_VERSION_PREFIX: &str = "reef.good_version.";
const OFFLINE_STRUDEL_PREFIX: &str = "reef.offline_strudel.";

/// Synchronous string key/value store. The seam a real embedder binds to
/// sessionStorage/localStorage equivalents; tests and the CLI use
/// [`MemoryStore`].
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// Per-strudel checkpoint recorded only on explicit user save; never touched
/// by autosave, so "restore to last good save" stays trustworthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodVersion {
    pub code: String,
    pub timestamp: i64,
}

/// Code backed up locally for a saved strudel so it survives a future
/// offline or degraded session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineStrudel {
    pub code: String,
    pub updated_at: i64,
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Mint a globally unique, monotonic-ish draft id.
pub fn mint_draft_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("draft-{}-{}", now_millis(), &suffix[..8])
}

/// The storage model the decision engine reads from and writes to.
#[derive(Clone)]
pub struct LayeredStorage {
    tab: Arc<dyn KvStore>,
    durable: Arc<dyn KvStore>,
}

impl LayeredStorage {
    pub fn new(tab: Arc<dyn KvStore>, durable: Arc<dyn KvStore>) -> Self {
        Self { tab, durable }
    }

    /// Fresh in-memory storage, both scopes process-local.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    fn parse_record<T: for<'de> Deserialize<'de>>(key: &str, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, error = %e, "discarding corrupt storage record");
                None
            }
        }
    }

    // --- drafts (durable, one record per id) ---

    pub fn save_draft(&self, draft: &Draft) {
        let key = format!("{}{}", DRAFT_PREFIX, draft.id);
        match serde_json::to_string(draft) {
            Ok(raw) => self.durable.set(&key, &raw),
            Err(e) => warn!(draft_id = %draft.id, error = %e, "failed to encode draft"),
        }
    }

    /// Create or update a draft record with new code, preserving any
    /// existing conversation history and metadata.
    pub fn upsert_draft_code(&self, draft_id: &str, code: &str) {
        let draft = match self.get_draft(draft_id) {
            Some(mut existing) => {
                existing.code = code.to_string();
                existing.updated_at = now_millis();
                existing
            }
            None => Draft {
                id: draft_id.to_string(),
                code: code.to_string(),
                conversation_history: Vec::new(),
                updated_at: now_millis(),
                title: None,
                forked_from_id: None,
                parent_signal: None,
            },
        };
        self.save_draft(&draft);
    }

    pub fn get_draft(&self, draft_id: &str) -> Option<Draft> {
        let key = format!("{}{}", DRAFT_PREFIX, draft_id);
        let raw = self.durable.get(&key)?;
        Self::parse_record(&key, &raw)
    }

    pub fn delete_draft(&self, draft_id: &str) {
        self.durable.remove(&format!("{}{}", DRAFT_PREFIX, draft_id));
    }

    pub fn list_drafts(&self) -> Vec<Draft> {
        self.durable
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(DRAFT_PREFIX))
            .filter_map(|k| {
                let raw = self.durable.get(&k)?;
                Self::parse_record(&k, &raw)
            })
            .collect()
    }

    /// The draft with the maximum `updated_at` among all durable drafts,
    /// which may belong to another tab.
    pub fn latest_draft(&self) -> Option<Draft> {
        self.list_drafts()
            .into_iter()
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
    }

    // --- tab-scoped singleton pointers ---

    /// The draft this tab is editing, as opposed to the most recently
    /// updated draft anywhere.
    pub fn current_draft_id(&self) -> Option<String> {
        self.tab.get(KEY_CURRENT_DRAFT_ID)
    }

    pub fn set_current_draft_id(&self, draft_id: &str) {
        self.tab.set(KEY_CURRENT_DRAFT_ID, draft_id);
    }

    pub fn clear_current_draft_id(&self) {
        self.tab.remove(KEY_CURRENT_DRAFT_ID);
    }

    /// Resolve the tab-scoped pointer to a live record; dangling pointers
    /// resolve to `None`.
    pub fn current_draft(&self) -> Option<Draft> {
        self.current_draft_id().and_then(|id| self.get_draft(&id))
    }

    pub fn current_strudel_id(&self) -> Option<String> {
        self.tab.get(KEY_CURRENT_STRUDEL_ID)
    }

    pub fn set_current_strudel_id(&self, strudel_id: &str) {
        self.tab.set(KEY_CURRENT_STRUDEL_ID, strudel_id);
    }

    pub fn clear_current_strudel_id(&self) {
        self.tab.remove(KEY_CURRENT_STRUDEL_ID);
    }

    pub fn session_id(&self) -> Option<String> {
        self.tab.get(KEY_SESSION_ID)
    }

    pub fn set_session_id(&self, session_id: &str) {
        self.tab.set(KEY_SESSION_ID, session_id);
    }

    pub fn redirect_after_login(&self) -> Option<String> {
        self.tab.get(KEY_REDIRECT_AFTER_LOGIN)
    }

    pub fn set_redirect_after_login(&self, target: &str) {
        self.tab.set(KEY_REDIRECT_AFTER_LOGIN, target);
    }

    pub fn rejoin_token(&self) -> Option<String> {
        self.tab.get(KEY_REJOIN_TOKEN)
    }

    pub fn set_rejoin_token(&self, token: &str) {
        self.tab.set(KEY_REJOIN_TOKEN, token);
    }

    // --- good versions (durable, explicit save only) ---

    pub fn record_good_version(&self, strudel_id: &str, code: &str) {
        let record = GoodVersion {
            code: code.to_string(),
            timestamp: now_millis(),
        };
        let key = format!("{}{}", GOOD_VERSION_PREFIX, strudel_id);
        match serde_json::to_string(&record) {
            Ok(raw) => self.durable.set(&key, &raw),
            Err(e) => warn!(strudel_id, error = %e, "failed to encode good version"),
        }
    }

    pub fn good_version(&self, strudel_id: &str) -> Option<GoodVersion> {
        let key = format!("{}{}", GOOD_VERSION_PREFIX, strudel_id);
        let raw = self.durable.get(&key)?;
        Self::parse_record(&key, &raw)
    }

    // --- offline strudel backups (durable, keyed by strudel id) ---

    pub fn save_offline_strudel(&self, strudel_id: &str, code: &str) {
        let record = OfflineStrudel {
            code: code.to_string(),
            updated_at: now_millis(),
        };
        let key = format!("{}{}", OFFLINE_STRUDEL_PREFIX, strudel_id);
        match serde_json::to_string(&record) {
            Ok(raw) => self.durable.set(&key, &raw),
            Err(e) => warn!(strudel_id, error = %e, "failed to encode offline strudel"),
        }
    }

    pub fn offline_strudel(&self, strudel_id: &str) -> Option<OfflineStrudel> {
        let key = format!("{}{}", OFFLINE_STRUDEL_PREFIX, strudel_id);
        let raw = self.durable.get(&key)?;
        Self::parse_record(&key, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(id: &str, code: &str, updated_at: i64) -> Draft {
        Draft {
            id: id.to_string(),
            code: code.to_string(),
            conversation_history: Vec::new(),
            updated_at,
            title: None,
            forked_from_id: None,
            parent_signal: None,
        }
    }

    #[test]
    fn test_draft_crud() {
        let storage = LayeredStorage::in_memory();
        storage.save_draft(&draft("d1", "s(\"bd\")", 10));
        assert_eq!(storage.get_draft("d1").unwrap().code, "s(\"bd\")");

        storage.upsert_draft_code("d1", "s(\"bd sd\")");
        let updated = storage.get_draft("d1").unwrap();
        assert_eq!(updated.code, "s(\"bd sd\")");
        assert!(updated.updated_at >= 10);

        storage.delete_draft("d1");
        assert!(storage.get_draft("d1").is_none());
    }

    #[test]
    fn test_latest_draft_by_updated_at() {
        let storage = LayeredStorage::in_memory();
        storage.save_draft(&draft("d1", "a", 100));
        storage.save_draft(&draft("d2", "b", 300));
        storage.save_draft(&draft("d3", "c", 200));
        assert_eq!(storage.latest_draft().unwrap().id, "d2");
    }

    #[test]
    fn test_dangling_current_draft_pointer_resolves_to_none() {
        let storage = LayeredStorage::in_memory();
        storage.set_current_draft_id("gone");
        assert_eq!(storage.current_draft_id().as_deref(), Some("gone"));
        assert!(storage.current_draft().is_none());
    }

    #[test]
    fn test_corrupt_record_treated_as_absent() {
        let tab = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemoryStore::new());
        durable.set("reef.draft.bad", "{not json");
        let storage = LayeredStorage::new(tab, durable.clone());
        assert!(storage.get_draft("bad").is_none());

        // A corrupt record must not poison the latest-draft query either.
        storage.save_draft(&draft("ok", "a", 5));
        assert_eq!(storage.latest_draft().unwrap().id, "ok");
    }

    #[test]
    fn test_good_version_separate_from_offline_backup() {
        let storage = LayeredStorage::in_memory();
        storage.record_good_version("x1", "saved");
        storage.save_offline_strudel("x1", "backup");
        assert_eq!(storage.good_version("x1").unwrap().code, "saved");
        assert_eq!(storage.offline_strudel("x1").unwrap().code, "backup");

        // An autosave-path backup never moves the checkpoint.
        storage.save_offline_strudel("x1", "newer backup");
        assert_eq!(storage.good_version("x1").unwrap().code, "saved");
    }

    #[test]
    fn test_tab_pointers_are_independent_scopes() {
        let durable = Arc::new(MemoryStore::new());
        let tab_a = LayeredStorage::new(Arc::new(MemoryStore::new()), durable.clone());
        let tab_b = LayeredStorage::new(Arc::new(MemoryStore::new()), durable);

        tab_a.set_current_draft_id("d1");
        tab_a.save_draft(&draft("d1", "a", 1));

        // The other tab shares drafts but not the pointer.
        assert!(tab_b.current_draft_id().is_none());
        assert_eq!(tab_b.latest_draft().unwrap().id, "d1");
    }

    #[test]
    fn test_session_pointers_roundtrip() {
        let storage = LayeredStorage::in_memory();
        assert!(storage.session_id().is_none());
        storage.set_session_id("s1");
        assert_eq!(storage.session_id().as_deref(), Some("s1"));

        storage.set_redirect_after_login("/strudel/x1");
        assert_eq!(
            storage.redirect_after_login().as_deref(),
            Some("/strudel/x1")
        );

        storage.set_rejoin_token("tok");
        assert_eq!(storage.rejoin_token().as_deref(), Some("tok"));
    }

    #[test]
    fn test_mint_draft_id_unique() {
        let a = mint_draft_id();
        let b = mint_draft_id();
        assert_ne!(a, b);
        assert!(a.starts_with("draft-"));
    }
}
