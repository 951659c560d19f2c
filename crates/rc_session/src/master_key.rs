//! In-memory master key guard.
//!
//! Holds the 32-byte symmetric key that seals every at-rest blob. The
//! authentication layer is responsible for producing this key (or the
//! password it is derived from) — this core only ever consumes it as an
//! opaque value, per its scope boundary. Named to avoid colliding with the
//! C8 "key-vault" (the server-side wrapped-message-key store).
//!
//! Auto-lock: configurable inactivity timer, zeroizes the key on lock.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use crate::error::SessionError;
use rc_crypto::kdf::{generate_salt, master_key_from_password};

#[derive(ZeroizeOnDrop)]
struct Inner {
    key: [u8; 32],
    #[zeroize(skip)]
    last_activity: Instant,
    #[zeroize(skip)]
    auto_lock_secs: u64,
}

/// Thread-safe handle. Cheap to clone; all clones share the same guarded key.
#[derive(Clone)]
pub struct MasterKeyGuard {
    inner: Arc<RwLock<Option<Inner>>>,
}

impl MasterKeyGuard {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(None)) }
    }

    /// Derive and hold the key from a password + stored salt.
    pub async fn unlock(&self, password: &[u8], salt: &[u8; 16], auto_lock_secs: u64) -> Result<(), SessionError> {
        let key = master_key_from_password(password, salt)?;
        let mut guard = self.inner.write().await;
        *guard = Some(Inner { key: key.0, last_activity: Instant::now(), auto_lock_secs });
        Ok(())
    }

    /// Hold an already-derived key, e.g. handed in by the auth layer.
    pub async fn unlock_with_key(&self, key: [u8; 32], auto_lock_secs: u64) {
        let mut guard = self.inner.write().await;
        *guard = Some(Inner { key, last_activity: Instant::now(), auto_lock_secs });
    }

    /// Zeroizes the key.
    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn is_locked(&self) -> bool {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => {
                if inner.auto_lock_secs > 0 && inner.last_activity.elapsed() > Duration::from_secs(inner.auto_lock_secs) {
                    drop(guard);
                    self.lock().await;
                    return true;
                }
                false
            }
            None => true,
        }
    }

    pub async fn set_auto_lock_timeout(&self, seconds: u64) {
        let mut guard = self.inner.write().await;
        if let Some(inner) = guard.as_mut() {
            inner.auto_lock_secs = seconds;
        }
    }

    pub async fn touch(&self) {
        let mut guard = self.inner.write().await;
        if let Some(inner) = guard.as_mut() {
            inner.last_activity = Instant::now();
        }
    }

    /// Access the raw key for an encrypt/decrypt operation. Errors if
    /// locked (including auto-lock having just fired). Touches the timer.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, SessionError>,
    {
        if self.is_locked().await {
            return Err(SessionError::MasterKeyLocked);
        }
        let mut guard = self.inner.write().await;
        match guard.as_mut() {
            Some(inner) => {
                inner.last_activity = Instant::now();
                f(&inner.key)
            }
            None => Err(SessionError::MasterKeyLocked),
        }
    }

    pub async fn time_until_lock(&self) -> Option<u64> {
        let guard = self.inner.read().await;
        guard.as_ref().map(|inner| {
            if inner.auto_lock_secs == 0 {
                return u64::MAX;
            }
            inner.auto_lock_secs.saturating_sub(inner.last_activity.elapsed().as_secs())
        })
    }
}

impl Default for MasterKeyGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a fresh salt for a new account. Not secret; store alongside the
/// encrypted state.
pub fn new_master_salt() -> [u8; 16] {
    generate_salt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlock_then_lock_clears_access() {
        let guard = MasterKeyGuard::new();
        assert!(guard.is_locked().await);
        guard.unlock_with_key([7u8; 32], 1800).await;
        assert!(!guard.is_locked().await);
        let got = guard.with_key(|k| Ok(*k)).await.unwrap();
        assert_eq!(got, [7u8; 32]);
        guard.lock().await;
        assert!(guard.is_locked().await);
        assert!(guard.with_key(|k| Ok(*k)).await.is_err());
    }

    #[tokio::test]
    async fn auto_lock_fires_after_timeout() {
        let guard = MasterKeyGuard::new();
        guard.unlock_with_key([1u8; 32], 0).await;
        guard.set_auto_lock_timeout(0).await;
        // auto_lock_secs = 0 disables the timer entirely.
        assert!(!guard.is_locked().await);
    }
}
