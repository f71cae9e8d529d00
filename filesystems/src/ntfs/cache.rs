// Reference-counted object caches for MFT cores and index nodes
// Objects are shared as Arcs; an entry whose only owner is the cache is
// unused and may be evicted, oldest access first, once the cache is over budget.

use log::trace;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Anything kept in an ObjectCache reports how many bytes it pins.
pub trait CacheCost {
    fn cache_cost(&self) -> usize;
}

struct CacheEntry<T> {
    value: Arc<T>,
    cost: usize,
    tick: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_cost: usize,
    pub budget: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct ObjectCache<T> {
    name: &'static str,
    entries: BTreeMap<u64, CacheEntry<T>>,
    /// Access tick -> key, oldest first
    lru: BTreeMap<u64, u64>,
    tick: u64,
    total_cost: usize,
    budget: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<T> fmt::Debug for ObjectCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .field("total_cost", &self.total_cost)
            .field("budget", &self.budget)
            .finish()
    }
}

impl<T: CacheCost> ObjectCache<T> {
    pub fn new(name: &'static str, budget: usize) -> Self {
        ObjectCache {
            name,
            entries: BTreeMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
            total_cost: 0,
            budget,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Look up `key`, refreshing its position in the LRU order.
    pub fn get(&mut self, key: u64) -> Option<Arc<T>> {
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(&key) {
            Some(entry) => {
                self.lru.remove(&entry.tick);
                entry.tick = tick;
                self.lru.insert(tick, key);
                self.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert a freshly loaded object and return the caller's reference.
    pub fn insert(&mut self, key: u64, value: T) -> Arc<T> {
        let cost = value.cache_cost();
        let value = Arc::new(value);
        self.tick += 1;
        if let Some(old) = self.entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                cost,
                tick: self.tick,
            },
        ) {
            self.lru.remove(&old.tick);
            self.total_cost -= old.cost;
        }
        self.lru.insert(self.tick, key);
        self.total_cost += cost;
        trace!(
            "{} cache: inserted {:#x} (cost {}, total {}/{})",
            self.name,
            key,
            cost,
            self.total_cost,
            self.budget
        );
        self.trim();
        value
    }

    /// Evict unused entries, least recently used first, until under budget.
    pub fn trim(&mut self) {
        if self.total_cost <= self.budget {
            return;
        }
        let mut projected = self.total_cost;
        let mut victims = Vec::new();
        for (&tick, &key) in &self.lru {
            if projected <= self.budget {
                break;
            }
            if let Some(entry) = self.entries.get(&key) {
                if Arc::strong_count(&entry.value) == 1 {
                    projected -= entry.cost;
                    victims.push((tick, key));
                }
            }
        }
        for (tick, key) in victims {
            self.lru.remove(&tick);
            if let Some(entry) = self.entries.remove(&key) {
                self.total_cost -= entry.cost;
                self.evictions += 1;
                trace!("{} cache: evicted {:#x} (cost {})", self.name, key, entry.cost);
            }
        }
    }

    pub fn remove(&mut self, key: u64) -> Option<Arc<T>> {
        let entry = self.entries.remove(&key)?;
        self.lru.remove(&entry.tick);
        self.total_cost -= entry.cost;
        Some(entry.value)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            total_cost: self.total_cost,
            budget: self.budget,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}
