//! Bounded TTL cache for explorer list responses.

use crate::explorer::types::TransferEnvelope;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const MAX_ENTRIES: usize = 100;

pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    value: Vec<TransferEnvelope>,
    inserted_at: Instant,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<TransferEnvelope>> {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get(key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        entries.remove(key);
        None
    }

    pub fn put(&self, key: String, value: Vec<TransferEnvelope>) {
        let mut entries = self.lock_entries();
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );

        // evict by insertion time until back under the bound
        while entries.len() > MAX_ENTRIES {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(seed: char) -> Vec<TransferEnvelope> {
        vec![TransferEnvelope {
            hash: seed.to_string().repeat(64),
            timestamp: 1_700_000_000_000,
            confirmed: true,
            trc20: None,
            contract_data: None,
        }]
    }

    #[tokio::test(start_paused = true)]
    async fn hit_then_expire() {
        let cache = ResponseCache::new(Duration::from_secs(30));
        cache.put("a".to_string(), envelope('a'));
        assert!(cache.get("a").is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_entry_is_evicted_over_the_bound() {
        let cache = ResponseCache::new(Duration::from_secs(3600));
        for i in 0..=MAX_ENTRIES {
            cache.put(format!("key{i}"), envelope('b'));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert!(cache.get("key0").is_none(), "oldest entry must be evicted");
        assert!(cache.get(&format!("key{MAX_ENTRIES}")).is_some());
    }

    #[test]
    fn miss_on_unknown_key() {
        let cache = ResponseCache::new(Duration::from_secs(30));
        assert!(cache.get("nope").is_none());
    }
}
