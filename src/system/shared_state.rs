//! State shared between Tracking, LocalMapping and the Viewer.
//!
//! The map sits behind one coarse `RwLock`. It is only reachable through
//! [`SharedState::read_map`] and [`SharedState::write_map`], so no guard or
//! live container ever leaves the closure that borrowed it; anything a thread
//! keeps is a copy.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::SlamConfig;
use crate::map::{Map, MapSnapshot};

pub struct SharedState {
    map: RwLock<Map>,

    /// Session counter, bumped on every reset. Work stamped with an older
    /// epoch belongs to a discarded map and must not be applied.
    epoch: AtomicU64,

    /// Set by Tracking when a keyframe is queued so a running local BA stops early.
    abort_ba: AtomicBool,

    /// LocalMapping worker is alive.
    mapping_running: AtomicBool,
}

impl SharedState {
    pub fn new(map: Map) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(map),
            epoch: AtomicU64::new(0),
            abort_ba: AtomicBool::new(false),
            mapping_running: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &SlamConfig) -> Arc<Self> {
        Self::new(Map::from_config(config))
    }

    pub fn read_map<R>(&self, f: impl FnOnce(&Map) -> R) -> R {
        f(&self.map.read())
    }

    pub fn write_map<R>(&self, f: impl FnOnce(&mut Map) -> R) -> R {
        f(&mut self.map.write())
    }

    /// Run `f` under the write lock only if the session is still `epoch`.
    ///
    /// The epoch is checked while the lock is held, so a concurrent reset
    /// (which clears the map under the same lock) cannot interleave.
    pub fn write_map_in_epoch<R>(&self, epoch: u64, f: impl FnOnce(&mut Map) -> R) -> Option<R> {
        let mut map = self.map.write();
        if self.epoch() != epoch {
            return None;
        }
        Some(f(&mut map))
    }

    pub fn snapshot(&self) -> MapSnapshot {
        self.map.read().snapshot()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Start a new session: bump the epoch and clear the map atomically.
    pub fn reset_map(&self) -> u64 {
        let mut map = self.map.write();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        map.clear();
        epoch
    }

    pub fn should_abort_ba(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    pub fn request_abort_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }

    pub fn is_mapping_running(&self) -> bool {
        self.mapping_running.load(Ordering::SeqCst)
    }

    pub fn set_mapping_running(&self, running: bool) {
        self.mapping_running.store(running, Ordering::SeqCst);
    }
}
