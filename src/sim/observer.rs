//! Module handles cache observers,
//! which record the cache events that occur at a given block.
//!
//! There are three ways to observe a [`Cache`]:
//! - [`Cache::observer`]: a [`CacheObserver`] recording which events occurred at each block,
//!     read and cleared via its [`get_block_accesses`] and [`take_block_accesses`] methods.
//! - [`Cache::stats`]: running [`CacheStats`] counters.
//! - [`Cache::add_listener`]: a [`CacheListener`], notified synchronously during the access that triggers an event.
//!
//! [`Cache`]: crate::sim::cache::Cache
//! [`Cache::observer`]: crate::sim::cache::Cache::observer
//! [`Cache::stats`]: crate::sim::cache::Cache::stats
//! [`Cache::add_listener`]: crate::sim::cache::Cache::add_listener
//! [`get_block_accesses`]: CacheObserver::get_block_accesses
//! [`take_block_accesses`]: CacheObserver::take_block_accesses

use std::collections::BTreeMap;

use crossbeam_channel::Sender;

/// The set of cache events which have occurred at this block.
///
/// ## Example
///
/// ```
/// # use mips_ensemble::sim::observer::AccessSet;
///
/// let accesses = AccessSet::MISS | AccessSet::WRITTEN;
/// assert!(accesses.accessed());
/// assert!(accesses.missed());
/// assert!(!accesses.hit());
/// assert!(!accesses.evicted());
/// ```
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessSet(u8);
impl AccessSet {
    /// Set with only the hit flag enabled.
    pub const HIT: Self = Self(1 << 0);
    /// Set with only the miss flag enabled.
    pub const MISS: Self = Self(1 << 1);
    /// Set with only the write flag enabled.
    pub const WRITTEN: Self = Self(1 << 2);
    /// Set with only the eviction flag enabled.
    pub const EVICTED: Self = Self(1 << 3);
    /// Set with only the write-back flag enabled.
    pub const WRITTEN_BACK: Self = Self(1 << 4);

    /// True if any event has occurred.
    pub fn accessed(&self) -> bool {
        self.0 != 0
    }

    /// True if an access hit this block.
    pub fn hit(&self) -> bool {
        self.0 & Self::HIT.0 != 0
    }
    /// True if an access missed and loaded this block.
    pub fn missed(&self) -> bool {
        self.0 & Self::MISS.0 != 0
    }
    /// True if this block was written through the cache.
    pub fn written(&self) -> bool {
        self.0 & Self::WRITTEN.0 != 0
    }
    /// True if this block was evicted from the cache.
    pub fn evicted(&self) -> bool {
        self.0 & Self::EVICTED.0 != 0
    }
    /// True if this block was written back to the backing memory.
    pub fn written_back(&self) -> bool {
        self.0 & Self::WRITTEN_BACK.0 != 0
    }
}
impl std::ops::BitOr for AccessSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
impl std::ops::BitOrAssign for AccessSet {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}
impl std::fmt::Debug for AccessSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessSet")
            .field("hit", &self.hit())
            .field("missed", &self.missed())
            .field("written", &self.written())
            .field("evicted", &self.evicted())
            .field("written_back", &self.written_back())
            .finish()
    }
}

/// A struct that tracks cache events per block.
///
/// Blocks are keyed by their starting byte address.
#[derive(Debug, Default)]
pub struct CacheObserver {
    blocks: BTreeMap<u32, AccessSet>
}
impl CacheObserver {
    /// Creates a new cache observer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all events.
    pub fn clear(&mut self) {
        std::mem::take(self);
    }

    /// Gets the access set for the block starting at the given address.
    pub fn get_block_accesses(&self, block_addr: u32) -> AccessSet {
        self.blocks.get(&block_addr).copied().unwrap_or_default()
    }

    /// Adds new flags to the access set for the block starting at the given address.
    pub fn update_block_accesses(&mut self, block_addr: u32, set: AccessSet) {
        *self.blocks.entry(block_addr).or_default() |= set;
    }

    /// Takes all events which have occurred since last clear,
    /// as well as clearing them.
    ///
    /// This iterator is sorted in address order.
    pub fn take_block_accesses(&mut self) -> impl Iterator<Item=(u32, AccessSet)> {
        std::mem::take(&mut self.blocks).into_iter()
    }
}

/// Running counters of cache behavior.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Accesses served by a valid line.
    pub hits: u64,
    /// Accesses that had to load a block.
    pub misses: u64,
    /// Valid lines replaced to make room for another block.
    pub evictions: u64,
    /// Dirty lines written to the backing memory (on eviction or flush).
    pub write_backs: u64,
}
impl CacheStats {
    /// Total number of accesses.
    pub fn accesses(&self) -> u64 {
        self.hits + self.misses
    }

    /// Fraction of accesses that hit (0 if there were no accesses).
    pub fn hit_rate(&self) -> f64 {
        match self.accesses() {
            0 => 0.0,
            n => self.hits as f64 / n as f64,
        }
    }
}

/// The result of the most recent cache access.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessOutcome {
    /// Whether the access missed.
    pub missed: bool,
    /// The address of the block evicted to serve the access, if any.
    pub evicted: Option<u32>,
}

/// A cache notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEvent {
    /// An access to this address missed.
    Miss(u32),
    /// The block starting at this address was evicted.
    Evict(u32),
}

/// A subscriber to cache notifications.
///
/// Notifications fire synchronously during the access that triggers them.
pub trait CacheListener {
    /// Called when an access to `addr` misses, before the block is loaded.
    fn on_cache_miss(&mut self, addr: u32) {
        let _ = addr;
    }

    /// Called when the block starting at `block_addr` is evicted.
    fn on_cache_evict(&mut self, block_addr: u32) {
        let _ = block_addr;
    }
}
/// Forwards notifications into a channel.
///
/// Notifications are dropped if the receiving end has disconnected.
impl CacheListener for Sender<CacheEvent> {
    fn on_cache_miss(&mut self, addr: u32) {
        let _ = self.send(CacheEvent::Miss(addr));
    }

    fn on_cache_evict(&mut self, block_addr: u32) {
        let _ = self.send(CacheEvent::Evict(block_addr));
    }
}
