//! The cache layer.
//!
//! A [`Cache`] sits in front of another [`MemoryDevice`] and implements [`MemoryDevice`] itself,
//! so it can be substituted anywhere its backing memory is used.
//!
//! # Organization
//!
//! A cache holds [`CacheConfig::block_count`] lines of [`CacheConfig::block_size`] bytes each,
//! grouped into sets of [`CacheConfig::associativity`] lines.
//! - With associativity 1, the cache is direct-mapped (and the replacement policy is ignored).
//! - With associativity equal to the block count, the cache is fully associative (one set).
//!
//! The block address of a byte address is `addr / block_size`,
//! and the block lives in set `block_address % set_count`.
//!
//! On a miss, a free line in the set is always taken if there is one.
//! Otherwise, the [`ReplacementPolicy`] picks the victim.
//!
//! # Write policies
//!
//! - [`WritePolicy::WriteThrough`]: every write is also written to the backing memory immediately.
//! - [`WritePolicy::WriteBack`]: writes only mark the line dirty. Dirty lines are written
//!     back when they are evicted, on [`MemoryDevice::flush`], or on [`Cache::close`].
//!
//! Under write-back, the backing memory does not reflect writes until one of those occurs,
//! so [`Cache::close`] (or a flush) must be called before relying on the backing memory's contents.
//!
//! # Example
//!
//! ```
//! use mips_ensemble::sim::cache::{Cache, CacheConfig, WritePolicy};
//! use mips_ensemble::sim::mem::MemoryDevice;
//! use mips_ensemble::sim::mem::paged::{MemoryConfig, PagedMemory};
//!
//! let backing = PagedMemory::new(&MemoryConfig { size: 1 << 16, ..Default::default() }).unwrap();
//! let mut cache = Cache::new(backing, &CacheConfig {
//!     associativity: 1,
//!     block_count: 4,
//!     block_size: 4,
//!     write_policy: WritePolicy::WriteBack,
//!     ..Default::default()
//! }).unwrap();
//!
//! cache.write_byte(0, 0xAB).unwrap();
//! assert!(cache.last_outcome().missed);
//! cache.read_byte(1).unwrap();
//! assert!(!cache.last_outcome().missed);
//!
//! let mut backing = cache.close().unwrap();
//! assert_eq!(backing.read_byte(0).unwrap(), 0xAB);
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::mem::{Endianness, MemoryDevice};
use super::observer::{AccessOutcome, AccessSet, CacheListener, CacheObserver, CacheStats};
use super::SimErr;

/// When a cache write reaches the backing memory.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// Writes propagate to the backing memory immediately (write-allocate).
    WriteThrough,
    /// Writes propagate on eviction, flush, or close.
    #[default]
    WriteBack,
}

/// How a victim line is chosen when a set is full.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplacementPolicy {
    /// Evict the line loaded earliest.
    Fifo,
    /// Evict the line used least recently.
    #[default]
    Lru,
    /// Evict the line used least often (ties go to the line loaded earliest).
    Lfu,
    /// Evict a uniformly random line.
    Random,
    /// FIFO, except lines referenced since they were last considered are skipped once.
    SecondChance,
}

/// Parameters of a [`Cache`].
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Lines per set. Must divide `block_count`.
    pub associativity: usize,
    /// Total number of lines.
    pub block_count: usize,
    /// Bytes per line. Must be a power of two.
    pub block_size: u32,
    /// When writes reach the backing memory.
    pub write_policy: WritePolicy,
    /// How victims are chosen in a full set.
    pub replacement_policy: ReplacementPolicy,
    /// Seed for [`ReplacementPolicy::Random`].
    pub seed: u64,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            associativity: 1,
            block_count: 64,
            block_size: 16,
            write_policy: WritePolicy::WriteBack,
            replacement_policy: ReplacementPolicy::Lru,
            seed: 0,
        }
    }
}
impl CacheConfig {
    /// Checks that these parameters describe a valid cache.
    pub fn validate(&self) -> Result<(), SimErr> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(SimErr::InvalidConfig(format!("block size {} is not a power of two", self.block_size)));
        }
        if self.block_count == 0 || self.associativity == 0 {
            return Err(SimErr::InvalidConfig("cache must have at least one line per set".to_string()));
        }
        if self.block_count % self.associativity != 0 {
            return Err(SimErr::InvalidConfig(format!(
                "associativity {} does not divide block count {}", self.associativity, self.block_count
            )));
        }
        Ok(())
    }

    /// The number of sets.
    pub fn set_count(&self) -> usize {
        self.block_count / self.associativity
    }
}

#[derive(Debug, Clone)]
struct Line {
    block: u32,
    data: Box<[u8]>,
    valid: bool,
    dirty: bool,

    inserted: u64,
    last_used: u64,
    uses: u64,
    referenced: bool,
}
impl Line {
    fn empty(block_size: u32) -> Self {
        Self {
            block: 0,
            data: vec![0; block_size as usize].into_boxed_slice(),
            valid: false,
            dirty: false,
            inserted: 0,
            last_used: 0,
            uses: 0,
            referenced: false,
        }
    }
}

fn min_way<K: Ord>(lines: &[Line], key: impl Fn(&Line) -> K) -> usize {
    lines.iter()
        .enumerate()
        .min_by_key(|(_, l)| key(l))
        .map_or(0, |(i, _)| i)
}

/// A cache in front of a backing [`MemoryDevice`].
///
/// See the [module-level documentation](self) for details.
pub struct Cache<M> {
    backing: M,
    sets: Vec<Vec<Line>>,
    block_size: u32,
    write_policy: WritePolicy,
    replacement_policy: ReplacementPolicy,

    /// Access sequence number, used to order lines for FIFO/LRU.
    seq: u64,
    rng: StdRng,

    stats: CacheStats,
    last: AccessOutcome,
    listeners: Vec<Box<dyn CacheListener + Send>>,

    /// Per-block record of cache events.
    ///
    /// This is never cleared by the cache itself.
    pub observer: CacheObserver,
}
impl<M: MemoryDevice> Cache<M> {
    /// Creates a new (empty) cache in front of the given memory.
    pub fn new(backing: M, config: &CacheConfig) -> Result<Self, SimErr> {
        config.validate()?;
        let size = backing.size();
        let block_size = u64::from(config.block_size);
        if block_size > size || size % block_size != 0 {
            return Err(SimErr::InvalidConfig(format!(
                "block size {block_size} does not evenly divide memory size {size:#x}"
            )));
        }

        let sets = (0..config.set_count())
            .map(|_| (0..config.associativity).map(|_| Line::empty(config.block_size)).collect())
            .collect();

        Ok(Self {
            backing,
            sets,
            block_size: config.block_size,
            write_policy: config.write_policy,
            replacement_policy: config.replacement_policy,
            seq: 0,
            rng: StdRng::seed_from_u64(config.seed),
            stats: CacheStats::default(),
            last: AccessOutcome::default(),
            listeners: vec![],
            observer: CacheObserver::new(),
        })
    }

    /// Subscribes a listener to miss and eviction notifications.
    pub fn add_listener(&mut self, listener: impl CacheListener + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// The outcome of the most recent access.
    pub fn last_outcome(&self) -> AccessOutcome {
        self.last
    }
    /// Counters of cache behavior since creation.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
    /// Resets the counters.
    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
    }

    /// The memory behind this cache.
    ///
    /// Under write-back, this may not reflect writes made through the cache.
    pub fn backing(&self) -> &M {
        &self.backing
    }
    /// The memory behind this cache.
    ///
    /// Writes made directly to this memory bypass (and are not seen by) any line already holding the block.
    pub fn backing_mut(&mut self) -> &mut M {
        &mut self.backing
    }

    /// Whether the block holding this address is currently cached.
    pub fn is_cached(&self, addr: u32) -> bool {
        let block = addr / self.block_size;
        self.sets[self.set_of(block)].iter().any(|l| l.valid && l.block == block)
    }

    fn set_of(&self, block: u32) -> usize {
        block as usize % self.sets.len()
    }

    /// Finds (or loads) the line holding the address, returning its set and way.
    fn access(&mut self, addr: u32) -> Result<(usize, usize), SimErr> {
        let size = self.backing.size();
        if u64::from(addr) >= size {
            return Err(SimErr::AddressOutOfRange { addr: u64::from(addr), size });
        }

        self.seq += 1;
        let block = addr / self.block_size;
        let block_addr = block * self.block_size;
        let set = self.set_of(block);

        if let Some(way) = self.sets[set].iter().position(|l| l.valid && l.block == block) {
            let line = &mut self.sets[set][way];
            line.last_used = self.seq;
            line.uses += 1;
            line.referenced = true;

            self.stats.hits += 1;
            self.last = AccessOutcome { missed: false, evicted: None };
            self.observer.update_block_accesses(block_addr, AccessSet::HIT);
            return Ok((set, way));
        }

        log::debug!("cache miss at {addr:#010x}");
        self.stats.misses += 1;
        self.observer.update_block_accesses(block_addr, AccessSet::MISS);
        for l in &mut self.listeners {
            l.on_cache_miss(addr);
        }

        let way = self.choose_victim(set);
        let evicted = self.evict(set, way)?;
        self.fill(set, way, block)?;

        self.last = AccessOutcome { missed: true, evicted };
        Ok((set, way))
    }

    fn choose_victim(&mut self, set: usize) -> usize {
        let lines = &mut self.sets[set];
        if let Some(free) = lines.iter().position(|l| !l.valid) {
            return free;
        }
        if lines.len() == 1 {
            return 0;
        }

        match self.replacement_policy {
            ReplacementPolicy::Fifo => min_way(lines, |l| l.inserted),
            ReplacementPolicy::Lru  => min_way(lines, |l| l.last_used),
            ReplacementPolicy::Lfu  => min_way(lines, |l| (l.uses, l.inserted)),
            ReplacementPolicy::Random => self.rng.gen_range(0..lines.len()),
            ReplacementPolicy::SecondChance => loop {
                let way = min_way(lines, |l| l.inserted);
                let line = &mut lines[way];
                if !line.referenced {
                    break way;
                }
                // second chance: move to the back of the queue
                line.referenced = false;
                self.seq += 1;
                line.inserted = self.seq;
            },
        }
    }

    /// Writes back (if dirty) and invalidates a line, returning the victim block's address.
    fn evict(&mut self, set: usize, way: usize) -> Result<Option<u32>, SimErr> {
        let line = &mut self.sets[set][way];
        if !line.valid {
            return Ok(None);
        }

        let victim = line.block * self.block_size;
        let mut flags = AccessSet::EVICTED;
        if line.dirty {
            self.backing.write_bytes(victim, &line.data)?;
            line.dirty = false;
            self.stats.write_backs += 1;
            flags |= AccessSet::WRITTEN_BACK;
        }
        line.valid = false;

        log::debug!("cache evicted block at {victim:#010x}");
        self.stats.evictions += 1;
        self.observer.update_block_accesses(victim, flags);
        for l in &mut self.listeners {
            l.on_cache_evict(victim);
        }
        Ok(Some(victim))
    }

    fn fill(&mut self, set: usize, way: usize, block: u32) -> Result<(), SimErr> {
        // a second chance may have stamped a line with the current sequence number
        self.seq += 1;
        let line = &mut self.sets[set][way];
        self.backing.read_bytes(block * self.block_size, &mut line.data)?;

        line.block = block;
        line.valid = true;
        line.dirty = false;
        line.inserted = self.seq;
        line.last_used = self.seq;
        line.uses = 1;
        line.referenced = false;
        Ok(())
    }

    /// Writes back every dirty line and empties the cache.
    pub fn invalidate(&mut self) -> Result<(), SimErr> {
        self.flush()?;
        self.sets.iter_mut()
            .flatten()
            .for_each(|l| l.valid = false);
        Ok(())
    }

    /// Writes back every dirty line and returns the backing memory.
    ///
    /// After this call, every write made through the cache is visible in the returned memory.
    pub fn close(mut self) -> Result<M, SimErr> {
        self.flush()?;
        Ok(self.backing)
    }
}
impl<M: MemoryDevice> MemoryDevice for Cache<M> {
    fn read_byte(&mut self, addr: u32) -> Result<u8, SimErr> {
        let (set, way) = self.access(addr)?;
        Ok(self.sets[set][way].data[(addr % self.block_size) as usize])
    }

    fn write_byte(&mut self, addr: u32, data: u8) -> Result<(), SimErr> {
        let (set, way) = self.access(addr)?;
        let line = &mut self.sets[set][way];
        line.data[(addr % self.block_size) as usize] = data;

        match self.write_policy {
            WritePolicy::WriteThrough => self.backing.write_byte(addr, data)?,
            WritePolicy::WriteBack    => line.dirty = true,
        }
        self.observer.update_block_accesses(line.block * self.block_size, AccessSet::WRITTEN);
        Ok(())
    }

    fn endianness(&self) -> Endianness {
        self.backing.endianness()
    }

    fn size(&self) -> u64 {
        self.backing.size()
    }

    /// Writes back every dirty line to the backing memory.
    ///
    /// This does not flush the backing memory itself.
    fn flush(&mut self) -> Result<(), SimErr> {
        for line in self.sets.iter_mut().flatten().filter(|l| l.valid && l.dirty) {
            let block_addr = line.block * self.block_size;
            self.backing.write_bytes(block_addr, &line.data)?;
            line.dirty = false;

            self.stats.write_backs += 1;
            self.observer.update_block_accesses(block_addr, AccessSet::WRITTEN_BACK);
        }
        Ok(())
    }
}
impl<M: std::fmt::Debug> std::fmt::Debug for Cache<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("backing", &self.backing)
            .field("sets", &self.sets.len())
            .field("block_size", &self.block_size)
            .field("write_policy", &self.write_policy)
            .field("replacement_policy", &self.replacement_policy)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::Receiver;

    use crate::sim::mem::paged::{MemoryConfig, PagedMemory};
    use crate::sim::observer::CacheEvent;
    use crate::sim::SimErrKind;
    use super::*;

    fn backing() -> PagedMemory {
        PagedMemory::new(&MemoryConfig { size: 1 << 12, page_size: 64, ..Default::default() }).unwrap()
    }

    fn cache(
        associativity: usize,
        block_count: usize,
        block_size: u32,
        write_policy: WritePolicy,
        replacement_policy: ReplacementPolicy,
    ) -> (Cache<PagedMemory>, Receiver<CacheEvent>) {
        let config = CacheConfig { associativity, block_count, block_size, write_policy, replacement_policy, seed: 7 };
        let mut cache = Cache::new(backing(), &config).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        cache.add_listener(tx);
        (cache, rx)
    }

    fn count(rx: &Receiver<CacheEvent>) -> (usize, usize) {
        rx.try_iter().fold((0, 0), |(m, e), ev| match ev {
            CacheEvent::Miss(_)  => (m + 1, e),
            CacheEvent::Evict(_) => (m, e + 1),
        })
    }

    #[test]
    fn test_direct_mapped_conflicts() {
        // 4 one-byte lines, direct-mapped: 5 and 1 (and 6 and 2) fight over a set
        let (mut cache, rx) = cache(1, 4, 1, WritePolicy::WriteBack, ReplacementPolicy::Lru);
        for addr in [0, 1, 2, 3, 5, 1, 6, 2] {
            cache.read_byte(addr).unwrap();
        }
        assert_eq!(count(&rx), (8, 4));
        assert_eq!(cache.stats().misses, 8);
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_direct_mapped_distinct_blocks() {
        let (mut cache, rx) = cache(1, 4, 4, WritePolicy::WriteBack, ReplacementPolicy::Lru);
        for addr in [0, 4, 8, 12, 20, 4, 24, 8] {
            cache.read_byte(addr).unwrap();
        }
        assert_eq!(count(&rx), (8, 4));
    }

    #[test]
    fn test_same_block_hits() {
        let (mut cache, rx) = cache(1, 4, 4, WritePolicy::WriteBack, ReplacementPolicy::Lru);

        cache.read_byte(0).unwrap();
        assert_eq!(cache.last_outcome(), AccessOutcome { missed: true, evicted: None });
        cache.read_byte(1).unwrap();
        assert_eq!(cache.last_outcome(), AccessOutcome { missed: false, evicted: None });

        // evict block 0 via set conflict, then revisit
        cache.read_byte(16).unwrap();
        assert_eq!(cache.last_outcome(), AccessOutcome { missed: true, evicted: Some(0) });
        cache.read_byte(2).unwrap();
        assert!(cache.last_outcome().missed);

        assert_eq!(count(&rx), (3, 2));
    }

    #[test]
    fn test_write_back_visibility() {
        let (mut cache, _rx) = cache(1, 4, 1, WritePolicy::WriteBack, ReplacementPolicy::Lru);
        for addr in 0..=4 {
            cache.write_byte(addr, 0xA0 + addr as u8).unwrap();
        }

        // writing 4 evicted the dirty line holding 0
        let backing = cache.backing_mut();
        assert_eq!(backing.read_byte(0).unwrap(), 0xA0);
        for addr in 1..=4 {
            assert_eq!(backing.read_byte(addr).unwrap(), 0, "at {addr}");
        }

        let mut backing = cache.close().unwrap();
        for addr in 0..=4 {
            assert_eq!(backing.read_byte(addr).unwrap(), 0xA0 + addr as u8, "at {addr}");
        }
    }

    #[test]
    fn test_write_through_visibility() {
        let (mut cache, _rx) = cache(1, 4, 4, WritePolicy::WriteThrough, ReplacementPolicy::Lru);
        cache.write_word(8, 0x1234_5678).unwrap();
        assert_eq!(cache.backing_mut().read_word(8).unwrap(), 0x1234_5678);
        assert_eq!(cache.stats().write_backs, 0);
    }

    #[test]
    fn test_fifo_fully_associative() {
        let (mut cache, rx) = cache(4, 4, 1, WritePolicy::WriteBack, ReplacementPolicy::Fifo);
        for addr in [0, 1, 3, 2, 0, 5, 9, 5, 6, 3] {
            cache.read_byte(addr).unwrap();
        }
        assert_eq!(count(&rx), (8, 4));
        assert_eq!(cache.stats().evictions, 4);
    }

    #[test]
    fn test_lru_vs_fifo() {
        // 0 is refreshed before 4 is loaded: LRU keeps it, FIFO does not
        let pattern = [0, 1, 2, 3, 0, 4, 0];

        let (mut lru, lru_rx) = cache(4, 4, 1, WritePolicy::WriteBack, ReplacementPolicy::Lru);
        let (mut fifo, fifo_rx) = cache(4, 4, 1, WritePolicy::WriteBack, ReplacementPolicy::Fifo);
        for addr in pattern {
            lru.read_byte(addr).unwrap();
            fifo.read_byte(addr).unwrap();
        }
        assert_eq!(count(&lru_rx), (5, 1));
        assert_eq!(count(&fifo_rx), (6, 2));
        assert!(lru.is_cached(0) && !lru.is_cached(1));
    }

    #[test]
    fn test_lfu() {
        let (mut cache, _rx) = cache(4, 4, 1, WritePolicy::WriteBack, ReplacementPolicy::Lfu);
        for addr in [0, 0, 1, 1, 2, 3, 3, 4] {
            cache.read_byte(addr).unwrap();
        }
        // 2 was used least
        assert_eq!(cache.last_outcome().evicted, Some(2));
    }

    #[test]
    fn test_second_chance() {
        let (mut cache, _rx) = cache(4, 4, 1, WritePolicy::WriteBack, ReplacementPolicy::SecondChance);
        for addr in [0, 1, 2, 3, 0] {
            cache.read_byte(addr).unwrap();
        }
        // 0 is oldest but was referenced, so 1 goes
        cache.read_byte(4).unwrap();
        assert_eq!(cache.last_outcome().evicted, Some(1));
        // 0 had its chance and went to the back, so 2 goes next
        cache.read_byte(5).unwrap();
        assert_eq!(cache.last_outcome().evicted, Some(2));
    }

    #[test]
    fn test_second_chance_keeps_queue_order() {
        let (mut cache, _rx) = cache(4, 4, 1, WritePolicy::WriteBack, ReplacementPolicy::SecondChance);
        for addr in [0, 1, 2, 3, 5, 6, 7, 3] {
            cache.read_byte(addr).unwrap();
        }
        // 3 is referenced, so 8 replaces 5 and 3 is requeued ahead of 8
        let mut evicted = vec![];
        for addr in [8, 9, 10, 11] {
            cache.read_byte(addr).unwrap();
            evicted.push(cache.last_outcome().evicted);
        }
        assert_eq!(evicted, [Some(5), Some(6), Some(7), Some(3)]);
        assert!(cache.is_cached(8));
    }

    #[test]
    fn test_random_is_seeded() {
        let run = || {
            let (mut cache, _rx) = cache(4, 4, 1, WritePolicy::WriteBack, ReplacementPolicy::Random);
            (0..32).map(|a| {
                cache.read_byte(a % 9).unwrap();
                cache.last_outcome().evicted
            }).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_free_line_preferred() {
        for policy in [ReplacementPolicy::Fifo, ReplacementPolicy::Lru, ReplacementPolicy::Lfu, ReplacementPolicy::Random, ReplacementPolicy::SecondChance] {
            let (mut cache, rx) = cache(4, 4, 1, WritePolicy::WriteBack, policy);
            for addr in [0, 0, 1, 2, 3] {
                cache.read_byte(addr).unwrap();
            }
            assert_eq!(count(&rx), (4, 0), "{policy:?}");
        }
    }

    #[test]
    fn test_invalidate() {
        let (mut cache, _rx) = cache(2, 4, 4, WritePolicy::WriteBack, ReplacementPolicy::Lru);
        cache.write_byte(3, 9).unwrap();
        cache.invalidate().unwrap();
        assert!(!cache.is_cached(3));
        assert_eq!(cache.backing_mut().read_byte(3).unwrap(), 9);
        assert!(cache.observer.get_block_accesses(0).written_back());
    }

    #[test]
    fn test_out_of_range() {
        let (mut cache, _rx) = cache(1, 4, 4, WritePolicy::WriteBack, ReplacementPolicy::Lru);
        let err = cache.read_byte(1 << 12).unwrap_err();
        assert_eq!(err.kind(), SimErrKind::Address);
    }

    #[test]
    fn test_invalid_config() {
        let bad = [
            CacheConfig { block_size: 3, ..Default::default() },
            CacheConfig { associativity: 3, block_count: 4, ..Default::default() },
            CacheConfig { block_count: 0, ..Default::default() },
            CacheConfig { block_size: 1 << 13, ..Default::default() },
        ];
        for cfg in bad {
            let err = Cache::new(backing(), &cfg).unwrap_err();
            assert_eq!(err.kind(), SimErrKind::Config);
        }

        // a block larger than all of memory
        let tiny = PagedMemory::new(&MemoryConfig { size: 16, page_size: 16, ..Default::default() }).unwrap();
        let err = Cache::new(tiny, &CacheConfig { block_size: 64, ..Default::default() }).unwrap_err();
        assert_eq!(err.kind(), SimErrKind::Config);
    }
}
