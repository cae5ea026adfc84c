//! Sliding-window attempt limiter.
//!
//! This is a courtesy throttle, not a security boundary: state lives in a
//! store the caller controls, and a client that owns its store (browser
//! local storage, a rotated IP) can reset it at will. Anything that needs
//! real protection must be enforced by the database or an upstream proxy.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Maximum attempts allowed within a window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max_attempts: u32,
    pub window_ms: u64,
}

/// Persistence for per-key attempt timestamps (milliseconds, oldest first).
pub trait RateLimitStore: Send + Sync {
    fn load(&self, key: &str) -> Vec<u64>;
    fn save(&self, key: &str, stamps: &[u64]);
    fn remove(&self, key: &str);
    /// Drop every key whose newest attempt is older than `cutoff_ms`.
    /// Returns the number of keys removed.
    fn evict_before(&self, cutoff_ms: u64) -> usize;

    /// Write pending changes to durable storage. May block.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: RateLimitStore + ?Sized> RateLimitStore for Box<T> {
    fn load(&self, key: &str) -> Vec<u64> {
        (**self).load(key)
    }

    fn save(&self, key: &str, stamps: &[u64]) {
        (**self).save(key, stamps)
    }

    fn remove(&self, key: &str) {
        (**self).remove(key)
    }

    fn evict_before(&self, cutoff_ms: u64) -> usize {
        (**self).evict_before(cutoff_ms)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

type Entries = HashMap<String, Vec<u64>>;

fn lock_entries(entries: &Mutex<Entries>) -> std::sync::MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

fn evict(entries: &mut Entries, cutoff_ms: u64) -> usize {
    let before = entries.len();
    entries.retain(|_, stamps| stamps.iter().any(|&t| t >= cutoff_ms));
    before - entries.len()
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RateLimitStore for MemoryStore {
    fn load(&self, key: &str) -> Vec<u64> {
        lock_entries(&self.entries).get(key).cloned().unwrap_or_default()
    }

    fn save(&self, key: &str, stamps: &[u64]) {
        lock_entries(&self.entries).insert(key.to_string(), stamps.to_vec());
    }

    fn remove(&self, key: &str) {
        lock_entries(&self.entries).remove(key);
    }

    fn evict_before(&self, cutoff_ms: u64) -> usize {
        evict(&mut lock_entries(&self.entries), cutoff_ms)
    }
}

/// JSON file holding every key. Changes are kept in memory and written by
/// [`RateLimitStore::flush`] (and on drop), so request handlers never touch
/// the disk. Survives restarts the way local storage survives page reloads.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Entries>,
    dirty: AtomicBool,
}

impl JsonFileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt rate limit file {}", path.display()))?,
            Ok(_) => HashMap::new(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl RateLimitStore for JsonFileStore {
    fn load(&self, key: &str) -> Vec<u64> {
        lock_entries(&self.entries).get(key).cloned().unwrap_or_default()
    }

    fn save(&self, key: &str, stamps: &[u64]) {
        lock_entries(&self.entries).insert(key.to_string(), stamps.to_vec());
        self.mark_dirty();
    }

    fn remove(&self, key: &str) {
        if lock_entries(&self.entries).remove(key).is_some() {
            self.mark_dirty();
        }
    }

    fn evict_before(&self, cutoff_ms: u64) -> usize {
        let evicted = evict(&mut lock_entries(&self.entries), cutoff_ms);
        if evicted > 0 {
            self.mark_dirty();
        }
        evicted
    }

    fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        // Serialise under the lock, write outside it.
        let raw = serde_json::to_string(&*lock_entries(&self.entries));
        let result = raw
            .map_err(anyhow::Error::from)
            .and_then(|raw| std::fs::write(&self.path, raw).map_err(anyhow::Error::from));
        if result.is_err() {
            self.mark_dirty();
        }
        result.with_context(|| format!("failed to persist {}", self.path.display()))
    }
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(?err, "failed to persist rate limit state");
        }
    }
}

pub struct RateLimiter<S: RateLimitStore> {
    store: S,
    // Serialises load-prune-save so two requests cannot both take the last slot.
    gate: Mutex<()>,
}

impl<S: RateLimitStore> RateLimiter<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            gate: Mutex::new(()),
        }
    }

    /// Record an attempt for `key` now. Returns false when the limit is hit.
    pub fn check(&self, key: &str, rule: RateLimitRule) -> bool {
        self.check_at(key, rule, now_ms())
    }

    pub fn check_at(&self, key: &str, rule: RateLimitRule, now_ms: u64) -> bool {
        let _gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let mut stamps = prune(self.store.load(key), rule, now_ms);
        if stamps.len() >= rule.max_attempts as usize {
            if stamps.is_empty() {
                self.store.remove(key);
            } else {
                self.store.save(key, &stamps);
            }
            return false;
        }
        stamps.push(now_ms);
        self.store.save(key, &stamps);
        true
    }

    /// Milliseconds until the oldest in-window attempt expires; zero when the
    /// key has no attempts in the window.
    pub fn remaining_time(&self, key: &str, rule: RateLimitRule) -> u64 {
        self.remaining_time_at(key, rule, now_ms())
    }

    pub fn remaining_time_at(&self, key: &str, rule: RateLimitRule, now_ms: u64) -> u64 {
        let stamps = prune(self.store.load(key), rule, now_ms);
        stamps
            .first()
            .map(|oldest| (oldest + rule.window_ms).saturating_sub(now_ms))
            .unwrap_or(0)
    }

    pub fn reset(&self, key: &str) {
        self.store.remove(key);
    }

    /// Forget keys with no attempt inside `longest_window_ms`. No rule can
    /// still count those attempts, so this never changes a decision.
    pub fn evict_stale(&self, longest_window_ms: u64) -> usize {
        self.evict_stale_at(longest_window_ms, now_ms())
    }

    pub fn evict_stale_at(&self, longest_window_ms: u64, now_ms: u64) -> usize {
        let _gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.store.evict_before(now_ms.saturating_sub(longest_window_ms))
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

fn prune(mut stamps: Vec<u64>, rule: RateLimitRule, now_ms: u64) -> Vec<u64> {
    stamps.retain(|&t| now_ms.saturating_sub(t) < rule.window_ms);
    stamps.sort_unstable();
    stamps
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
