//! Room registry: the only process-wide mutable state. Owns one handle per
//! live room; each handle carries the room's serialization lock and its
//! cache slot.

use std::collections::HashMap;
use std::sync::Arc;

use contracts::RoomRecord;
use tokio::sync::{Mutex, RwLock};

/// Cached copy of a room with the load time that bounds its freshness.
#[derive(Debug, Clone)]
pub struct CacheSlot {
    pub record: RoomRecord,
    pub loaded_at_ms: u64,
}

/// Guarded by the handle's lock: holding the guard is holding the room.
#[derive(Debug, Default)]
pub struct RoomSlot {
    pub cache: Option<CacheSlot>,
}

#[derive(Debug)]
pub struct RoomHandle {
    /// FIFO-fair exclusive lock; actions for the room are totally ordered
    /// by acquisition order.
    pub slot: Mutex<RoomSlot>,
}

impl RoomHandle {
    fn new() -> Self {
        Self {
            slot: Mutex::new(RoomSlot::default()),
        }
    }
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    handles: RwLock<HashMap<String, Arc<RoomHandle>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for a room, creating it on first touch. Handles
    /// are cheap; existence of a handle does not imply the room exists in
    /// the store.
    pub async fn handle(&self, room_id: &str) -> Arc<RoomHandle> {
        if let Some(handle) = self.handles.read().await.get(room_id) {
            return Arc::clone(handle);
        }
        let mut handles = self.handles.write().await;
        Arc::clone(
            handles
                .entry(room_id.to_string())
                .or_insert_with(|| Arc::new(RoomHandle::new())),
        )
    }

    /// Drops a room's handle (cache included). In-flight submits keep the
    /// Arc alive until they finish.
    pub async fn evict(&self, room_id: &str) {
        self.handles.write().await.remove(room_id);
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn shutdown(&self) {
        self.handles.write().await.clear();
    }
}

/// Reads the cache slot if it is still inside the freshness window.
pub fn fresh_cache(slot: &RoomSlot, now_ms: u64, freshness_ms: u64) -> Option<RoomRecord> {
    let cached = slot.cache.as_ref()?;
    if now_ms.saturating_sub(cached.loaded_at_ms) <= freshness_ms {
        Some(cached.record.clone())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handles_are_shared_per_room() {
        let registry = RoomRegistry::new();
        let first = registry.handle("room_a").await;
        let second = registry.handle("room_a").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);

        registry.evict("room_a").await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn cache_respects_the_freshness_window() {
        let registry = RoomRegistry::new();
        let handle = registry.handle("room_a").await;
        {
            let mut slot = handle.slot.lock().await;
            slot.cache = Some(CacheSlot {
                record: RoomRecord::new("room_a", "turn-based", 0),
                loaded_at_ms: 1_000,
            });
        }

        let slot = handle.slot.lock().await;
        assert!(fresh_cache(&slot, 5_500, 5_000).is_some());
        assert!(fresh_cache(&slot, 6_001, 5_000).is_none());
    }

    #[tokio::test]
    async fn lock_serializes_access() {
        let registry = RoomRegistry::new();
        let handle = registry.handle("room_a").await;
        let guard = handle.slot.lock().await;
        assert!(handle.slot.try_lock().is_err());
        drop(guard);
        assert!(handle.slot.try_lock().is_ok());
    }
}
