//! The paged memory store.
//!
//! The address space is divided into fixed-size pages. Pages are created (zero-filled)
//! on first touch, or loaded from [cold storage](super::cold) if the store is file-backed.
//! At most [`MemoryConfig::max_loaded_pages`] pages are resident at once. When another page
//! is needed, the oldest-loaded page is evicted; if it was modified and the store is file-backed,
//! it is written to cold storage first.
//!
//! ```
//! use mips_ensemble::sim::mem::MemoryDevice;
//! use mips_ensemble::sim::mem::paged::{MemoryConfig, PagedMemory};
//!
//! let mut mem = PagedMemory::new(&MemoryConfig {
//!     size: 1 << 16,
//!     page_size: 256,
//!     max_loaded_pages: 2,
//!     ..Default::default()
//! }).unwrap();
//!
//! mem.write_word(0x1000, 0xCAFE_F00D).unwrap();
//! assert_eq!(mem.read_word(0x1000).unwrap(), 0xCAFE_F00D);
//! assert!(mem.resident_pages() <= 2);
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::sim::SimErr;
use super::cold::{ColdStorage, OptimizedFile, OriginalFile};
use super::{Endianness, MemoryDevice};

/// How evicted pages are kept.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageType {
    /// No cold storage. Evicted pages are lost and read back as zeros.
    #[default]
    Volatile,
    /// File-backed, with page *i* at offset *i · page size*.
    FileOriginal,
    /// File-backed, with a sparse slot file and an index.
    FileOptimized,
}

/// Parameters of a [`PagedMemory`].
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MemoryConfig {
    /// Number of addressable bytes. Must be a multiple of `page_size`, and at most 2<sup>32</sup>.
    pub size: u64,
    /// Size of one page in bytes. Must be a power of two.
    pub page_size: u32,
    /// The maximum number of pages resident at once. Must be at least 1.
    pub max_loaded_pages: usize,
    /// Byte order of halfword and word accesses.
    pub endianness: Endianness,
    /// How evicted pages are kept.
    pub storage: StorageType,
    /// The backing file for file-backed storage.
    pub path: Option<PathBuf>,
    /// Whether to keep the contents of an existing backing file, rather than truncating it.
    pub reuse_cold_storage: bool,
}
impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            size: 1 << 32,
            page_size: 4096,
            max_loaded_pages: 1024,
            endianness: Endianness::Little,
            storage: StorageType::Volatile,
            path: None,
            reuse_cold_storage: false,
        }
    }
}
impl MemoryConfig {
    /// Checks that these parameters describe a valid memory store.
    pub fn validate(&self) -> Result<(), SimErr> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(SimErr::InvalidConfig(format!("page size {} is not a power of two", self.page_size)));
        }
        if self.size == 0 || self.size > 1 << 32 {
            return Err(SimErr::InvalidConfig(format!("memory size {} is not between 1 and 2^32", self.size)));
        }
        if self.size % u64::from(self.page_size) != 0 {
            return Err(SimErr::InvalidConfig(format!("memory size {} is not a multiple of page size {}", self.size, self.page_size)));
        }
        if self.max_loaded_pages == 0 {
            return Err(SimErr::InvalidConfig("at least one page must be resident".to_string()));
        }
        if self.storage != StorageType::Volatile && self.path.is_none() {
            return Err(SimErr::InvalidConfig("file-backed storage requires a path".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Page {
    data: Box<[u8]>,
    dirty: bool,
}
impl Page {
    fn zeroed(page_size: usize) -> Self {
        Self { data: vec![0; page_size].into_boxed_slice(), dirty: false }
    }
}

/// A paged, optionally file-backed memory store.
#[derive(Debug)]
pub struct PagedMemory {
    pages: HashMap<u32, Page>,
    load_order: VecDeque<u32>,
    cold: Option<ColdStorage>,

    size: u64,
    page_size: u32,
    max_loaded_pages: usize,
    endianness: Endianness,
}
impl PagedMemory {
    /// Creates a new memory store, opening cold storage if it is file-backed.
    pub fn new(config: &MemoryConfig) -> Result<Self, SimErr> {
        config.validate()?;

        let page_size = config.page_size as usize;
        let reuse = config.reuse_cold_storage;
        let cold = match (config.storage, &config.path) {
            (StorageType::Volatile, _) => None,
            (StorageType::FileOriginal, Some(path)) => {
                let f = OriginalFile::open(path, page_size, reuse).map_err(SimErr::ColdStorage)?;
                Some(ColdStorage::Original(f))
            },
            (StorageType::FileOptimized, Some(path)) => {
                let f = OptimizedFile::open(path, page_size, reuse).map_err(SimErr::ColdStorage)?;
                Some(ColdStorage::Optimized(f))
            },
            (_, None) => return Err(SimErr::InvalidConfig("file-backed storage requires a path".to_string())),
        };

        Ok(Self {
            pages: HashMap::new(),
            load_order: VecDeque::new(),
            cold,
            size: config.size,
            page_size: config.page_size,
            max_loaded_pages: config.max_loaded_pages,
            endianness: config.endianness,
        })
    }

    /// The number of pages currently resident.
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }
    /// The maximum number of resident pages.
    pub fn max_loaded_pages(&self) -> usize {
        self.max_loaded_pages
    }
    /// The size of a page in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }
    /// Whether the page holding this address is resident.
    pub fn is_resident(&self, addr: u32) -> bool {
        self.pages.contains_key(&(addr / self.page_size))
    }

    fn split(&self, addr: u32) -> Result<(u32, usize), SimErr> {
        match u64::from(addr) < self.size {
            true  => Ok((addr / self.page_size, (addr % self.page_size) as usize)),
            false => Err(SimErr::AddressOutOfRange { addr: u64::from(addr), size: self.size }),
        }
    }

    fn evict_oldest(&mut self) -> Result<(), SimErr> {
        let Some(index) = self.load_order.pop_front() else { return Ok(()) };
        let Some(page) = self.pages.remove(&index) else { return Ok(()) };

        match &mut self.cold {
            Some(cold) if page.dirty => {
                log::debug!("evicting page {index:#x} to cold storage");
                cold.store_page(index, &page.data)?;
            },
            _ => log::debug!("evicting page {index:#x}"),
        }
        Ok(())
    }

    fn resident(&mut self, index: u32) -> Result<&mut Page, SimErr> {
        let page_size = self.page_size as usize;

        if !self.pages.contains_key(&index) {
            while self.pages.len() >= self.max_loaded_pages {
                self.evict_oldest()?;
            }

            let mut page = Page::zeroed(page_size);
            if let Some(cold) = &mut self.cold {
                cold.load_page(index, &mut page.data)?;
            }
            log::debug!("loaded page {index:#x}");

            self.pages.insert(index, page);
            self.load_order.push_back(index);
        }

        Ok(self.pages.entry(index).or_insert_with(|| Page::zeroed(page_size)))
    }

    /// Flushes and releases the store, reporting any cold storage failure.
    pub fn close(mut self) -> Result<(), SimErr> {
        self.flush()?;
        // already flushed, so Drop has nothing to do
        self.cold = None;
        Ok(())
    }
}
impl MemoryDevice for PagedMemory {
    fn read_byte(&mut self, addr: u32) -> Result<u8, SimErr> {
        let (index, offset) = self.split(addr)?;
        Ok(self.resident(index)?.data[offset])
    }

    fn write_byte(&mut self, addr: u32, data: u8) -> Result<(), SimErr> {
        let (index, offset) = self.split(addr)?;
        let page = self.resident(index)?;
        page.data[offset] = data;
        page.dirty = true;
        Ok(())
    }

    fn endianness(&self) -> Endianness {
        self.endianness
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&mut self) -> Result<(), SimErr> {
        let Some(cold) = &mut self.cold else { return Ok(()) };

        for (&index, page) in self.pages.iter_mut().filter(|(_, p)| p.dirty) {
            cold.store_page(index, &page.data)?;
            page.dirty = false;
        }
        cold.flush()
    }
}
impl Drop for PagedMemory {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("failed to flush memory to cold storage: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::SimErrKind;
    use super::*;

    fn config(storage: StorageType, path: Option<PathBuf>) -> MemoryConfig {
        MemoryConfig {
            size: 1 << 12,
            page_size: 16,
            max_loaded_pages: 2,
            storage,
            path,
            ..Default::default()
        }
    }

    #[test]
    fn test_residency_bound() {
        let mut mem = PagedMemory::new(&config(StorageType::Volatile, None)).unwrap();

        for addr in (0..1024).step_by(7) {
            mem.write_byte(addr, addr as u8).unwrap();
            assert!(mem.resident_pages() <= 2);
            mem.read_byte(addr).unwrap();
            assert!(mem.resident_pages() <= 2);
        }
    }

    #[test]
    fn test_fifo_eviction_order() {
        let mut mem = PagedMemory::new(&config(StorageType::Volatile, None)).unwrap();

        mem.read_byte(0x00).unwrap();
        mem.read_byte(0x10).unwrap();
        // touching page 0 again does not refresh it
        mem.read_byte(0x01).unwrap();
        mem.read_byte(0x20).unwrap();

        assert!(!mem.is_resident(0x00));
        assert!(mem.is_resident(0x10));
        assert!(mem.is_resident(0x20));
    }

    #[test]
    fn test_volatile_loses_evicted_pages() {
        let mut mem = PagedMemory::new(&config(StorageType::Volatile, None)).unwrap();

        mem.write_byte(0x05, 0xAA).unwrap();
        mem.read_byte(0x10).unwrap();
        mem.read_byte(0x20).unwrap();
        assert_eq!(mem.read_byte(0x05).unwrap(), 0);
    }

    #[test]
    fn test_file_backed_survives_eviction() {
        for storage in [StorageType::FileOriginal, StorageType::FileOptimized] {
            let dir = tempfile::tempdir().unwrap();
            let mut mem = PagedMemory::new(&config(storage, Some(dir.path().join("mem.bin")))).unwrap();

            for addr in (0..256).step_by(4) {
                mem.write_word(addr, addr * 3).unwrap();
            }
            for addr in (0..256).step_by(4) {
                assert_eq!(mem.read_word(addr).unwrap(), addr * 3, "{storage:?} at {addr}");
            }
            mem.close().unwrap();
        }
    }

    #[test]
    fn test_layouts_equivalent() {
        let dir = tempfile::tempdir().unwrap();
        let mut orig = PagedMemory::new(&config(StorageType::FileOriginal, Some(dir.path().join("a.bin")))).unwrap();
        let mut opt = PagedMemory::new(&config(StorageType::FileOptimized, Some(dir.path().join("b.bin")))).unwrap();

        let writes = [(0x3F0, 1u8), (0x002, 2), (0x7FF, 3), (0x3F0, 4), (0x100, 5), (0x002, 6)];
        for (addr, byte) in writes {
            orig.write_byte(addr, byte).unwrap();
            opt.write_byte(addr, byte).unwrap();
        }
        for addr in 0..0x800 {
            assert_eq!(orig.read_byte(addr).unwrap(), opt.read_byte(addr).unwrap(), "at {addr:#x}");
        }
    }

    #[test]
    fn test_reuse_cold_storage() {
        for storage in [StorageType::FileOriginal, StorageType::FileOptimized] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("mem.bin");

            let mut mem = PagedMemory::new(&config(storage, Some(path.clone()))).unwrap();
            mem.write_word(0x40, 0x1234_5678).unwrap();
            mem.close().unwrap();

            let mut cfg = config(storage, Some(path.clone()));
            cfg.reuse_cold_storage = true;
            let mut mem = PagedMemory::new(&cfg).unwrap();
            assert_eq!(mem.read_word(0x40).unwrap(), 0x1234_5678);
            drop(mem);

            let mut mem = PagedMemory::new(&config(storage, Some(path))).unwrap();
            assert_eq!(mem.read_word(0x40).unwrap(), 0);
        }
    }

    #[test]
    fn test_cold_storage_errors() {
        let dir = tempfile::tempdir().unwrap();
        for storage in [StorageType::FileOriginal, StorageType::FileOptimized] {
            let missing = dir.path().join("missing").join("mem.bin");
            let err = PagedMemory::new(&config(storage, Some(missing))).unwrap_err();
            assert!(matches!(err, SimErr::ColdStorage(_)), "{storage:?}");
            assert_eq!(err.kind(), SimErrKind::Io);
        }

        // index with a partial entry
        let path = dir.path().join("mem.bin");
        std::fs::write(&path, b"").unwrap();
        std::fs::write(OptimizedFile::index_path(&path), [0; 5]).unwrap();
        let mut cfg = config(StorageType::FileOptimized, Some(path));
        cfg.reuse_cold_storage = true;
        let err = PagedMemory::new(&cfg).unwrap_err();
        assert_eq!(err.kind(), SimErrKind::Io);
    }

    #[test]
    fn test_out_of_range() {
        let mut mem = PagedMemory::new(&config(StorageType::Volatile, None)).unwrap();
        let err = mem.read_byte(1 << 12).unwrap_err();
        assert_eq!(err.kind(), SimErrKind::Address);
        // word that runs off the end
        let err = mem.write_word((1 << 12) - 2, 0).unwrap_err();
        assert_eq!(err.kind(), SimErrKind::Address);
    }

    #[test]
    fn test_invalid_config() {
        let bad = [
            MemoryConfig { page_size: 24, ..Default::default() },
            MemoryConfig { size: 100, page_size: 64, ..Default::default() },
            MemoryConfig { max_loaded_pages: 0, ..Default::default() },
            MemoryConfig { storage: StorageType::FileOriginal, path: None, ..Default::default() },
        ];
        for cfg in bad {
            let err = PagedMemory::new(&cfg).unwrap_err();
            assert_eq!(err.kind(), SimErrKind::Config, "{cfg:?}");
        }
    }
}
