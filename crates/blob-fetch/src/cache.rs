//! Bounded in-memory LRU blob cache.
//!
//! Design
//! ------
//! The cache is an actor: a spawned task owns the entry map and processes
//! commands from an mpsc channel one at a time. Handles are cheap clones that
//! send a command and await a oneshot reply. Because the channel serializes
//! commands FIFO, every mutation fully completes before the next begins —
//! concurrent fetches can never race on size accounting or interleave a
//! partial eviction with an insert. This single-writer discipline is the fix
//! for an observed race and must be preserved.
//!
//! Policy
//! ------
//! - Pure LRU by access order: `get` refreshes an entry's position.
//! - Before inserting, evict oldest entries one at a time while
//!   `current + incoming > capacity` and the cache is non-empty.
//! - A blob larger than the whole capacity is never stored. That is an
//!   advisory condition (logged at debug), not an error; the caller still
//!   gets the bytes.
//!
//! The cache lives in process memory only and is lost on restart.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{FetchError, FetchResult};

/// Counters describing cache effectiveness and occupancy.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cached blobs.
    pub entry_count: usize,
    /// Sum of cached blob sizes in bytes.
    pub total_size_bytes: u64,
    /// Configured capacity in bytes.
    pub capacity_bytes: u64,
    /// Lookups that found an entry.
    pub hit_count: u64,
    /// Lookups that found nothing.
    pub miss_count: u64,
    /// Entries removed to make room for inserts.
    pub eviction_count: u64,
}

enum CacheCommand {
    Get {
        key: String,
        reply: oneshot::Sender<Option<Bytes>>,
    },
    Put {
        key: String,
        bytes: Bytes,
        reply: oneshot::Sender<bool>,
    },
    Contains {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
}

/// Handle to the blob cache actor.
///
/// All operations are async because each one round-trips through the actor's
/// command queue.
#[derive(Debug, Clone)]
pub struct BlobCache {
    tx: mpsc::Sender<CacheCommand>,
}

impl BlobCache {
    /// Create a cache with the given byte capacity and spawn its actor task.
    ///
    /// The task exits when the last handle is dropped. Must be called from
    /// within a tokio runtime.
    pub fn new(capacity_bytes: u64) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(cache_task(capacity_bytes, rx));
        Self { tx }
    }

    /// Look up a blob, refreshing its LRU position on a hit.
    pub async fn get(&self, key: &str) -> FetchResult<Option<Bytes>> {
        let (reply, rx) = oneshot::channel();
        self.send(CacheCommand::Get {
            key: key.to_string(),
            reply,
        })
        .await?;
        recv(rx).await
    }

    /// Insert a blob, evicting least-recently-used entries as needed.
    ///
    /// Returns `false` when the blob exceeds total capacity and was skipped.
    pub async fn put(&self, key: &str, bytes: Bytes) -> FetchResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(CacheCommand::Put {
            key: key.to_string(),
            bytes,
            reply,
        })
        .await?;
        recv(rx).await
    }

    /// Whether a blob is currently cached. Does not refresh LRU order.
    pub async fn is_cached(&self, key: &str) -> FetchResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(CacheCommand::Contains {
            key: key.to_string(),
            reply,
        })
        .await?;
        recv(rx).await
    }

    /// Remove a blob. Returns `true` when an entry existed.
    pub async fn remove(&self, key: &str) -> FetchResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(CacheCommand::Remove {
            key: key.to_string(),
            reply,
        })
        .await?;
        recv(rx).await
    }

    /// Drop every entry.
    pub async fn clear(&self) -> FetchResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(CacheCommand::Clear { reply }).await?;
        recv(rx).await
    }

    /// Snapshot of current cache statistics.
    pub async fn stats(&self) -> FetchResult<CacheStats> {
        let (reply, rx) = oneshot::channel();
        self.send(CacheCommand::Stats { reply }).await?;
        recv(rx).await
    }

    async fn send(&self, cmd: CacheCommand) -> FetchResult<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| FetchError::msg("blob cache task is no longer running"))
    }
}

async fn recv<T>(rx: oneshot::Receiver<T>) -> FetchResult<T> {
    rx.await
        .map_err(|_| FetchError::msg("blob cache task dropped a reply"))
}

struct CacheState {
    entries: HashMap<String, Bytes>,
    /// Access order, least recently used at the front.
    order: VecDeque<String>,
    total_size: u64,
    capacity: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

async fn cache_task(capacity: u64, mut rx: mpsc::Receiver<CacheCommand>) {
    let mut state = CacheState {
        entries: HashMap::new(),
        order: VecDeque::new(),
        total_size: 0,
        capacity,
        hits: 0,
        misses: 0,
        evictions: 0,
    };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            CacheCommand::Get { key, reply } => {
                let hit = state.entries.get(&key).cloned();
                match &hit {
                    Some(_) => {
                        state.hits += 1;
                        touch(&mut state.order, &key);
                    }
                    None => state.misses += 1,
                }
                let _ = reply.send(hit);
            }
            CacheCommand::Put { key, bytes, reply } => {
                let _ = reply.send(insert(&mut state, key, bytes));
            }
            CacheCommand::Contains { key, reply } => {
                let _ = reply.send(state.entries.contains_key(&key));
            }
            CacheCommand::Remove { key, reply } => {
                let existed = match state.entries.remove(&key) {
                    Some(bytes) => {
                        state.total_size -= bytes.len() as u64;
                        state.order.retain(|k| k != &key);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(existed);
            }
            CacheCommand::Clear { reply } => {
                state.entries.clear();
                state.order.clear();
                state.total_size = 0;
                let _ = reply.send(());
            }
            CacheCommand::Stats { reply } => {
                let _ = reply.send(CacheStats {
                    entry_count: state.entries.len(),
                    total_size_bytes: state.total_size,
                    capacity_bytes: state.capacity,
                    hit_count: state.hits,
                    miss_count: state.misses,
                    eviction_count: state.evictions,
                });
            }
        }
    }
}

fn touch(order: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        let key = order.remove(pos).expect("position came from iter");
        order.push_back(key);
    }
}

fn insert(state: &mut CacheState, key: String, bytes: Bytes) -> bool {
    let incoming = bytes.len() as u64;
    if incoming > state.capacity {
        debug!(
            key,
            size = incoming,
            capacity = state.capacity,
            "blob exceeds cache capacity, skipping cache write"
        );
        return false;
    }

    // Replacing an entry must not double-count its size.
    if let Some(previous) = state.entries.remove(&key) {
        state.total_size -= previous.len() as u64;
        state.order.retain(|k| k != &key);
    }

    while state.total_size + incoming > state.capacity && !state.entries.is_empty() {
        let Some(oldest) = state.order.pop_front() else {
            break;
        };
        if let Some(evicted) = state.entries.remove(&oldest) {
            state.total_size -= evicted.len() as u64;
            state.evictions += 1;
            trace!(key = oldest, "evicted LRU blob");
        }
    }

    state.total_size += incoming;
    state.entries.insert(key.clone(), bytes);
    state.order.push_back(key);
    true
}
