//! Cross-Request Cache: holds the reconstruction artifacts a later,
//! independent mesh-decoding request resumes from.
//!
//! One slot per [`SessionKey`], last writer wins. Clients that do not name a
//! session all share [`SessionKey::global`], which gives the single
//! process-wide slot. Entries are never invalidated on read.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime};

use arch_types::{GaussianCloud, StructuredLatent};
use log::{debug, warn};

const GLOBAL_SESSION: &str = "global";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn global() -> Self {
        Self(GLOBAL_SESSION.to_string())
    }

    /// Blank ids fall back to the global slot.
    pub fn from_client(id: Option<&str>) -> Self {
        match id.map(str::trim) {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self::global(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Co-produced reconstruction artifacts.
#[derive(Debug)]
pub struct CacheEntry {
    pub gaussians: GaussianCloud,
    pub latent: StructuredLatent,
    pub stored_at: SystemTime,
    created: Instant,
}

impl CacheEntry {
    pub fn age_seconds(&self) -> f64 {
        self.created.elapsed().as_secs_f64()
    }
}

#[derive(Default)]
pub struct ArtifactCache {
    entries: RwLock<HashMap<SessionKey, Arc<CacheEntry>>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the session's entry.
    pub fn store(&self, session: &SessionKey, gaussians: GaussianCloud, latent: StructuredLatent) {
        let entry = Arc::new(CacheEntry {
            gaussians,
            latent,
            stored_at: SystemTime::now(),
            created: Instant::now(),
        });
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| {
            warn!("[CACHE] Lock was poisoned, recovering...");
            poisoned.into_inner()
        });
        if entries.insert(session.clone(), entry).is_some() {
            debug!("[CACHE] Replaced reconstruction for session '{session}'");
        } else {
            debug!("[CACHE] Stored reconstruction for session '{session}'");
        }
    }

    pub fn read(&self, session: &SessionKey) -> Option<Arc<CacheEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session)
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arch_types::GaussianPoint;

    fn cloud(x: f32) -> GaussianCloud {
        GaussianCloud {
            points: vec![GaussianPoint {
                position: [x, 0.0, 0.0],
                color_dc: [0.0; 3],
                opacity: 0.0,
                scale: [0.0; 3],
                rotation: [1.0, 0.0, 0.0, 0.0],
            }],
        }
    }

    fn latent(resolution: u32) -> StructuredLatent {
        StructuredLatent {
            resolution,
            channels: 1,
            coords: vec![[1, 2, 3]],
            features: vec![0.5],
        }
    }

    #[test]
    fn test_empty_cache_reads_nothing() {
        let cache = ArtifactCache::new();
        assert!(cache.read(&SessionKey::global()).is_none());
        assert_eq!(cache.session_count(), 0);
    }

    #[test]
    fn test_store_then_read_returns_same_artifacts() {
        let cache = ArtifactCache::new();
        cache.store(&SessionKey::global(), cloud(1.0), latent(64));
        let entry = cache.read(&SessionKey::global()).unwrap();
        assert_eq!(entry.gaussians, cloud(1.0));
        assert_eq!(entry.latent, latent(64));
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = ArtifactCache::new();
        let key = SessionKey::global();
        cache.store(&key, cloud(1.0), latent(32));
        cache.store(&key, cloud(2.0), latent(64));
        let entry = cache.read(&key).unwrap();
        assert_eq!(entry.gaussians, cloud(2.0));
        assert_eq!(entry.latent.resolution, 64);
        assert_eq!(cache.session_count(), 1);
    }

    #[test]
    fn test_read_does_not_invalidate() {
        let cache = ArtifactCache::new();
        let key = SessionKey::global();
        cache.store(&key, cloud(1.0), latent(32));
        assert!(cache.read(&key).is_some());
        assert!(cache.read(&key).is_some());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let cache = ArtifactCache::new();
        let alice = SessionKey::from_client(Some("alice"));
        cache.store(&alice, cloud(1.0), latent(32));
        assert!(cache.read(&SessionKey::global()).is_none());
        assert!(cache.read(&alice).is_some());
    }

    #[test]
    fn test_blank_session_is_global() {
        assert_eq!(SessionKey::from_client(Some("  ")), SessionKey::global());
        assert_eq!(SessionKey::from_client(None), SessionKey::global());
        assert_eq!(SessionKey::from_client(Some("bob")).as_str(), "bob");
    }
}
