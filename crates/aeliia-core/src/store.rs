//! Two-scope profile store: durable (Sled) and session (in-memory DashMap).
//!
//! Values are JSON. Reads are fail-soft: a value that no longer parses is logged,
//! removed, and reported as absent. Logout clears both scopes under one write gate so
//! no reader observes a half-logged-out state.

use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;

use crate::error::{CoreError, CoreResult};
use crate::shared::{Message, User, UserProfile, CHAT_HISTORY_KEY, COOKIE_CONSENT_KEY, PROFILE_KEY, USER_KEY};

const DEFAULT_STORE_DIR: &str = "./data/aeliia_store";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScope {
    /// Survives restarts.
    Durable,
    /// Lives as long as this store handle.
    Session,
}

struct Inner {
    db: Db,
    session: DashMap<String, Vec<u8>>,
    gate: RwLock<()>,
}

/// Cheap to clone; clones share the same scopes.
#[derive(Clone)]
pub struct ProfileStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore")
            .field("session_keys", &self.inner.session.len())
            .finish()
    }
}

impl ProfileStore {
    /// Opens or creates the durable store at `./data/aeliia_store`.
    pub fn new() -> CoreResult<Self> {
        Self::open_path(DEFAULT_STORE_DIR)
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self::from_db(db))
    }

    /// In-memory durable scope, discarded on drop.
    pub fn temporary() -> CoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: Db) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                session: DashMap::new(),
                gate: RwLock::new(()),
            }),
        }
    }

    fn read_gate(&self) -> CoreResult<RwLockReadGuard<'_, ()>> {
        self.inner
            .gate
            .read()
            .map_err(|_| CoreError::Persistence("store gate poisoned".into()))
    }

    fn write_gate(&self) -> CoreResult<RwLockWriteGuard<'_, ()>> {
        self.inner
            .gate
            .write()
            .map_err(|_| CoreError::Persistence("store gate poisoned".into()))
    }

    fn raw_get(&self, scope: StoreScope, key: &str) -> CoreResult<Option<Vec<u8>>> {
        match scope {
            StoreScope::Durable => Ok(self.inner.db.get(key.as_bytes())?.map(|v| v.to_vec())),
            StoreScope::Session => Ok(self.inner.session.get(key).map(|v| v.value().clone())),
        }
    }

    fn raw_remove(&self, scope: StoreScope, key: &str) -> CoreResult<()> {
        match scope {
            StoreScope::Durable => {
                self.inner.db.remove(key.as_bytes())?;
            }
            StoreScope::Session => {
                self.inner.session.remove(key);
            }
        }
        Ok(())
    }

    /// Remove `key` only if it still holds `seen`. A save that landed after the read wins.
    fn discard_if_unchanged(&self, scope: StoreScope, key: &str, seen: &[u8]) -> CoreResult<bool> {
        let _g = self.write_gate()?;
        if self.raw_get(scope, key)?.as_deref() != Some(seen) {
            return Ok(false);
        }
        self.raw_remove(scope, key)?;
        Ok(true)
    }

    /// Typed read. Absent, unreadable or malformed values all come back as `None`;
    /// a malformed value is removed so it does not fail again.
    pub fn load<T: DeserializeOwned>(&self, scope: StoreScope, key: &str) -> Option<T> {
        let raw = {
            let _g = self.read_gate().ok()?;
            match self.raw_get(scope, key) {
                Ok(v) => v?,
                Err(e) => {
                    tracing::warn!(key, error = %e, "store read failed");
                    return None;
                }
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, ?scope, error = %e, "discarding malformed stored value");
                if let Err(e) = self.discard_if_unchanged(scope, key, &raw) {
                    tracing::warn!(key, error = %e, "could not discard malformed value");
                }
                None
            }
        }
    }

    pub fn save<T: Serialize + ?Sized>(&self, scope: StoreScope, key: &str, value: &T) -> CoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        let _g = self.write_gate()?;
        match scope {
            StoreScope::Durable => {
                self.inner.db.insert(key.as_bytes(), bytes)?;
            }
            StoreScope::Session => {
                self.inner.session.insert(key.to_string(), bytes);
            }
        }
        Ok(())
    }

    /// Raw bytes write, bypassing serialization. Used to seed fixtures.
    pub fn save_raw(&self, scope: StoreScope, key: &str, bytes: &[u8]) -> CoreResult<()> {
        let _g = self.write_gate()?;
        match scope {
            StoreScope::Durable => {
                self.inner.db.insert(key.as_bytes(), bytes)?;
            }
            StoreScope::Session => {
                self.inner.session.insert(key.to_string(), bytes.to_vec());
            }
        }
        Ok(())
    }

    pub fn clear(&self, scope: StoreScope, key: &str) -> CoreResult<()> {
        let _g = self.write_gate()?;
        self.raw_remove(scope, key)
    }

    pub fn contains(&self, scope: StoreScope, key: &str) -> bool {
        self.read_gate()
            .ok()
            .and_then(|_g| self.raw_get(scope, key).ok().flatten())
            .is_some()
    }

    /// Remove the user, conversation history and profile in one step.
    pub fn logout(&self) -> CoreResult<()> {
        let _g = self.write_gate()?;
        let mut batch = sled::Batch::default();
        batch.remove(USER_KEY.as_bytes());
        batch.remove(CHAT_HISTORY_KEY.as_bytes());
        self.inner.db.apply_batch(batch)?;
        self.inner.session.remove(PROFILE_KEY);
        self.inner.db.flush()?;
        tracing::info!("session data cleared at logout");
        Ok(())
    }

    pub fn flush(&self) -> CoreResult<()> {
        self.inner.db.flush()?;
        Ok(())
    }

    // --- typed helpers ---

    pub fn user(&self) -> Option<User> {
        self.load(StoreScope::Durable, USER_KEY)
    }

    pub fn save_user(&self, user: &User) -> CoreResult<()> {
        self.save(StoreScope::Durable, USER_KEY, user)
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.load(StoreScope::Session, PROFILE_KEY)
    }

    pub fn save_profile(&self, profile: &UserProfile) -> CoreResult<()> {
        self.save(StoreScope::Session, PROFILE_KEY, profile)
    }

    /// Stored premium history; empty when absent or malformed.
    pub fn history(&self) -> Vec<Message> {
        self.load(StoreScope::Durable, CHAT_HISTORY_KEY).unwrap_or_default()
    }

    pub fn save_history(&self, messages: &[Message]) -> CoreResult<()> {
        self.save(StoreScope::Durable, CHAT_HISTORY_KEY, messages)
    }

    pub fn clear_history(&self) -> CoreResult<()> {
        self.clear(StoreScope::Durable, CHAT_HISTORY_KEY)
    }

    pub fn cookie_consent(&self) -> bool {
        self.load(StoreScope::Durable, COOKIE_CONSENT_KEY).unwrap_or(false)
    }

    pub fn record_cookie_consent(&self) -> CoreResult<()> {
        self.save(StoreScope::Durable, COOKIE_CONSENT_KEY, &true)
    }
}
