//! In-memory cache for decoded and derived bitmaps.
//!
//! Decoded pixel buffers are among the largest allocations the process
//! makes, so every derived image produced by the transform pipeline is
//! kept under a deterministic key and evicted least-recently-used
//! first. The cache is a single shared instance per process, injected
//! into the pipeline by the hosting application rather than reached
//! through a global.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use image::{DynamicImage, GenericImageView};
use lru::LruCache;

/// Upper bound on resident entries. Sized for a few dozen full-screen
/// bitmaps, which is what a mobile process can realistically keep
/// around; not tunable by callers.
pub const DEFAULT_CAPACITY: usize = 64;

/// A decoded pixel buffer together with its liveness state.
///
/// The cache is the long-lived owner of a bitmap once it is inserted;
/// blobs hold additional `Arc` handles. The platform may release the
/// pixel memory behind our back under memory pressure, which is
/// recorded here as the `invalidated` flag: holders must treat an
/// invalidated bitmap as absent and re-decode, never as a fatal error.
pub struct Bitmap {
    image: DynamicImage,
    invalidated: AtomicBool,
}

impl Bitmap {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image,
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Marks the pixel buffer as released by the platform.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }
}

/// The LRU bookkeeping itself; single-threaded, wrapped by
/// [`SharedBitmapCache`] for concurrent use.
struct BitmapCache {
    entries: LruCache<String, Arc<Bitmap>>,
}

impl BitmapCache {
    fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(
                NonZeroUsize::new(capacity).expect("Capacity can't be zero"),
            ),
        }
    }

    fn get(&mut self, label: &str, key: &str) -> Option<Arc<Bitmap>> {
        let live = self
            .entries
            .get(key)
            .map(|entry| (!entry.is_invalidated()).then(|| entry.clone()));
        match live {
            Some(Some(bitmap)) => Some(bitmap),
            Some(None) => {
                // Released by the platform since insertion; treat as
                // absent and drop the stale entry.
                log::warn!(
                    "cache/{}: entry for key {} was invalidated, removing",
                    label,
                    key
                );
                self.entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn put(&mut self, label: &str, key: String, bitmap: Arc<Bitmap>) {
        if self.entries.len() == self.entries.cap().get()
            && !self.entries.contains(&key)
        {
            if let Some((evicted, _)) = self.entries.pop_lru() {
                log::debug!(
                    "cache/{}: at capacity, evicting key {}",
                    label,
                    evicted
                );
            }
        }
        self.entries.put(key, bitmap);
    }
}

/// Process-wide bitmap cache handle.
///
/// All operations serialize on an internal mutex so that an eviction
/// and a lookup from two blobs never race the recency bookkeeping.
pub struct SharedBitmapCache {
    /// Label for logging
    label: String,
    inner: Mutex<BitmapCache>,
}

impl SharedBitmapCache {
    /// Creates a cache bounded by [`DEFAULT_CAPACITY`].
    ///
    /// # Arguments
    /// * `label` - Identifier used in logs
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        log::debug!(
            "cache/{}: initialized with capacity {}",
            label,
            DEFAULT_CAPACITY
        );
        Self {
            label,
            inner: Mutex::new(BitmapCache::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BitmapCache> {
        // A poisoned lock only means another holder panicked between
        // bookkeeping updates; the entries themselves stay usable.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Retrieves a live bitmap and promotes it to most recently used.
    /// Entries whose pixels were released by the platform are removed
    /// and reported as absent.
    pub fn get(&self, key: &str) -> Option<Arc<Bitmap>> {
        let hit = self.lock().get(&self.label, key);
        if hit.is_some() {
            log::debug!("cache/{}: hit for key {}", self.label, key);
        }
        hit
    }

    /// Stores a bitmap, evicting the least-recently-used entry when at
    /// capacity.
    pub fn put(&self, key: String, bitmap: Arc<Bitmap>) {
        log::debug!("cache/{}: storing key {}", self.label, key);
        self.lock().put(&self.label, key, bitmap);
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Bitmap>> {
        self.lock().entries.pop(key)
    }

    /// Drops every entry. Used as the memory-pressure response and
    /// automatically after any decode or transform allocation failure.
    pub fn evict_all(&self) {
        let mut inner = self.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        log::debug!("cache/{}: evicted all {} entries", self.label, dropped);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains(key)
    }
}
