//! Time-bounded result cache keyed by message id.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::analysis::types::ProcessingResult;

struct Entry {
    result: ProcessingResult,
    inserted_at: Instant,
}

/// TTL + size bounded cache of processing results.
pub struct ResultCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl ResultCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh entry for `message_id`, if any.
    pub async fn get(&self, message_id: Uuid) -> Option<ProcessingResult> {
        let entries = self.entries.read().await;
        entries
            .get(&message_id)
            .filter(|e| e.inserted_at.elapsed() < self.ttl)
            .map(|e| e.result.clone())
    }

    /// Insert, evicting the oldest entry when full.
    pub async fn insert(&self, result: ProcessingResult) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries && !entries.contains_key(&result.message_id) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                entries.remove(&id);
            }
        }
        entries.insert(
            result.message_id,
            Entry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Newest fresh result for a conversation.
    pub async fn latest_for_conversation(&self, conversation_id: &str) -> Option<ProcessingResult> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|e| e.result.conversation_id == conversation_id)
            .filter(|e| e.inserted_at.elapsed() < self.ttl)
            .max_by_key(|e| (e.result.timestamp, e.inserted_at))
            .map(|e| e.result.clone())
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
