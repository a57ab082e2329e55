//! TTL-refreshed in-memory share cache.
//!
//! The cache publishes immutable snapshots: every fill scans the shares, builds a fresh
//! full-text index and swaps a single `Arc` under a write lock. Readers clone the `Arc`
//! and search without holding any lock, so they never wait on a scan, only on the swap.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Span};

use crate::browse;
use crate::error::Result;
use crate::fulltext::{FullTextIndex, TokenIndex};
use crate::model::{BrowseDirectory, SharedFile};
use crate::query::SearchQuery;
use crate::scan::{GenerationClock, ScanResult, Scanner};

const REFRESH_CHANNEL_CAPACITY: usize = 16;

/// Monotonic time source used for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Sent to subscribers after every fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshEvent {
    pub directories: usize,
    pub files: usize,
    pub generation: i64,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub directories: usize,
    pub files: usize,
    pub last_fill: Option<DateTime<Utc>>,
}

/// Files, directories and their index, always replaced together.
struct Snapshot<I> {
    files: HashMap<String, SharedFile>,
    directories: BTreeSet<String>,
    index: I,
    filled_at: Option<Instant>,
    filled_wall: Option<DateTime<Utc>>,
}

impl<I: FullTextIndex> Snapshot<I> {
    fn empty() -> Self {
        Self {
            files: HashMap::new(),
            directories: BTreeSet::new(),
            index: I::build(std::iter::empty()),
            filled_at: None,
            filled_wall: None,
        }
    }
}

pub struct ShareCache<I: FullTextIndex = TokenIndex> {
    scanner: Scanner,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    generations: GenerationClock,
    state: RwLock<Arc<Snapshot<I>>>,
    /// Serialises fills; stale readers queue here and reuse whatever the holder publishes.
    fill_lock: Mutex<()>,
    events: broadcast::Sender<RefreshEvent>,
    span: Span,
}

impl ShareCache {
    pub fn new(scanner: Scanner, ttl: Duration) -> Self {
        Self::create(scanner, ttl)
    }
}

impl<I: FullTextIndex> ShareCache<I> {
    /// Construct a cache backed by a specific index implementation.
    pub fn create(scanner: Scanner, ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(REFRESH_CHANNEL_CAPACITY);
        Self {
            scanner,
            ttl,
            clock: Arc::new(SystemClock),
            generations: GenerationClock::new(),
            state: RwLock::new(Arc::new(Snapshot::empty())),
            fill_lock: Mutex::new(()),
            events,
            span: info_span!("share_cache"),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Generations handed out by this cache start after `floor`.
    pub fn with_generation_floor(mut self, floor: i64) -> Self {
        self.generations = GenerationClock::starting_after(floor);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn separator(&self) -> char {
        self.scanner.separator()
    }

    /// Receive a [`RefreshEvent`] after every fill.
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events.subscribe()
    }

    /// Rescan the shares and replace the cache contents.
    pub fn fill(&self) -> Result<RefreshEvent> {
        self.rescan().map(|(event, _)| event)
    }

    /// Like [`fill`](Self::fill), also handing back the scan the snapshot was built from.
    pub fn rescan(&self) -> Result<(RefreshEvent, ScanResult)> {
        let _guard = self.fill_lock.lock();
        self.fill_locked()
    }

    fn fill_locked(&self) -> Result<(RefreshEvent, ScanResult)> {
        let scan = self.scanner.scan(self.generations.next())?;
        let event = self.publish(&scan);
        Ok((event, scan))
    }

    fn publish(&self, scan: &ScanResult) -> RefreshEvent {
        let mut keys: Vec<&str> = scan.files.keys().map(String::as_str).collect();
        keys.sort_unstable();
        let index = I::build(keys);

        let filled_wall = Utc::now();
        let snapshot = Snapshot {
            files: scan.files.clone(),
            directories: scan.directories.clone(),
            index,
            filled_at: Some(self.clock.now()),
            filled_wall: Some(filled_wall),
        };

        *self.state.write() = Arc::new(snapshot);

        let event = RefreshEvent {
            directories: scan.directories.len(),
            files: scan.files.len(),
            generation: scan.generation,
            filled_at: filled_wall,
        };
        info!(
            parent: &self.span,
            directories = event.directories,
            files = event.files,
            "Share cache refreshed"
        );
        // No subscribers is fine
        let _ = self.events.send(event.clone());
        event
    }

    fn snapshot(&self) -> Arc<Snapshot<I>> {
        self.state.read().clone()
    }

    fn is_stale(&self, snapshot: &Snapshot<I>) -> bool {
        match snapshot.filled_at {
            Some(filled_at) => self.clock.now() > filled_at + self.ttl,
            None => true,
        }
    }

    /// The current snapshot, refilled first if it has expired.
    fn current(&self) -> Result<Arc<Snapshot<I>>> {
        let snapshot = self.snapshot();
        if !self.is_stale(&snapshot) {
            return Ok(snapshot);
        }

        let _guard = self.fill_lock.lock();
        let snapshot = self.snapshot();
        if !self.is_stale(&snapshot) {
            debug!(parent: &self.span, "Reusing snapshot published while waiting");
            return Ok(snapshot);
        }

        match self.fill_locked() {
            Ok(_) => Ok(self.snapshot()),
            Err(e) if snapshot.filled_at.is_some() => {
                warn!(parent: &self.span, "Refresh failed, serving previous snapshot: {}", e);
                Ok(snapshot)
            }
            Err(e) => Err(e),
        }
    }

    /// Files matching `query`, in index order.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SharedFile>> {
        let snapshot = self.current()?;
        let expr = query.compile();

        match snapshot.index.search(&expr) {
            Ok(keys) => {
                let results: Vec<SharedFile> = keys
                    .into_iter()
                    .filter_map(|key| snapshot.files.get(key).cloned())
                    .collect();
                debug!(parent: &self.span, query = %expr, results = results.len(), "Searched share cache");
                Ok(results)
            }
            Err(e) => {
                warn!(parent: &self.span, query = %expr, "Search degraded to no results: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Every known directory with its files, empty directories included.
    pub fn browse(&self) -> Result<Vec<BrowseDirectory>> {
        let snapshot = self.current()?;
        Ok(browse::synthesize(
            snapshot.directories.iter().map(String::as_str),
            snapshot.files.values(),
            self.separator(),
        ))
    }

    /// Local path of a masked filename in the current snapshot. Never triggers a fill.
    pub fn find(&self, masked: &str) -> Option<String> {
        self.snapshot()
            .files
            .get(masked)
            .map(|file| file.original_filename.clone())
    }

    pub fn is_filled(&self) -> bool {
        self.snapshot().filled_at.is_some()
    }

    pub fn last_fill(&self) -> Option<DateTime<Utc>> {
        self.snapshot().filled_wall
    }

    pub fn stats(&self) -> CacheStats {
        let snapshot = self.snapshot();
        CacheStats {
            directories: snapshot.directories.len(),
            files: snapshot.files.len(),
            last_fill: snapshot.filled_wall,
        }
    }
}
