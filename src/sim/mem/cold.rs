//! Disk-backed cold storage for pages evicted from the paged memory store.
//!
//! Two on-disk layouts are available:
//! - [`OriginalFile`]: one file where page *i* lives at byte offset *i · page size*.
//!     Pages that were never written read back as zeros (including reads past the end of the file).
//! - [`OptimizedFile`]: a sparse data file holding only persisted pages, in the order they were first persisted,
//!     plus an index file (`<path>.idx`) mapping each page to its slot in the data file.
//!
//! Both layouts produce identical reads for identical write histories.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::sim::SimErr;

/// Reads into `buf` from the current position until it is full or EOF is hit,
/// zero-filling anything past EOF.
fn read_or_zero(file: &mut File, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    buf[filled..].fill(0);
    Ok(())
}

fn open_backing(path: &Path, reuse: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(!reuse)
        .open(path)
}

/// The cold storage attached to a paged memory store.
#[derive(Debug)]
pub enum ColdStorage {
    /// Direct-offset layout.
    Original(OriginalFile),
    /// Slot + index layout.
    Optimized(OptimizedFile),
}
impl ColdStorage {
    /// Loads a page into `buf` (which is one page long).
    /// Pages that were never persisted load as zeros.
    pub fn load_page(&mut self, page: u32, buf: &mut [u8]) -> Result<(), SimErr> {
        match self {
            ColdStorage::Original(f)  => f.load_page(page, buf),
            ColdStorage::Optimized(f) => f.load_page(page, buf),
        }.map_err(SimErr::ColdStorage)
    }

    /// Persists a page.
    pub fn store_page(&mut self, page: u32, data: &[u8]) -> Result<(), SimErr> {
        match self {
            ColdStorage::Original(f)  => f.store_page(page, data),
            ColdStorage::Optimized(f) => f.store_page(page, data),
        }.map_err(SimErr::ColdStorage)
    }

    /// Forces all persisted pages (and the index, if any) to disk.
    pub fn flush(&mut self) -> Result<(), SimErr> {
        match self {
            ColdStorage::Original(f)  => f.flush(),
            ColdStorage::Optimized(f) => f.flush(),
        }.map_err(SimErr::ColdStorage)
    }
}

/// Cold storage where page *i* is stored at byte offset *i · page size* of a single file.
#[derive(Debug)]
pub struct OriginalFile {
    file: File,
    page_size: usize,
}
impl OriginalFile {
    /// Opens (or creates) the backing file.
    ///
    /// If `reuse` is false, any existing contents are discarded.
    pub fn open(path: impl AsRef<Path>, page_size: usize, reuse: bool) -> io::Result<Self> {
        let file = open_backing(path.as_ref(), reuse)?;
        Ok(Self { file, page_size })
    }

    fn offset(&self, page: u32) -> u64 {
        u64::from(page) * self.page_size as u64
    }

    fn load_page(&mut self, page: u32, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.offset(page)))?;
        read_or_zero(&mut self.file, buf)
    }

    fn store_page(&mut self, page: u32, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.offset(page)))?;
        self.file.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

/// Cold storage with a sparse slot file and a page-to-slot index.
///
/// The index file lives next to the data file (`<path>.idx`) and holds
/// little-endian `(page: u32, slot: u32)` pairs. It is rewritten on every flush
/// in which a new page has been assigned a slot.
#[derive(Debug)]
pub struct OptimizedFile {
    data: File,
    index_path: PathBuf,
    slots: HashMap<u32, u32>,
    page_size: usize,
    index_dirty: bool,
}
impl OptimizedFile {
    /// The path of the index file for a given data file path.
    pub fn index_path(path: &Path) -> PathBuf {
        let mut p = OsString::from(path.as_os_str());
        p.push(".idx");
        PathBuf::from(p)
    }

    /// Opens (or creates) the data file and its index.
    ///
    /// If `reuse` is true and an index exists, the existing slot assignment is loaded.
    /// Otherwise, both files start out empty.
    pub fn open(path: impl AsRef<Path>, page_size: usize, reuse: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let data = open_backing(path, reuse)?;
        let index_path = Self::index_path(path);

        let mut slots = HashMap::new();
        if reuse && index_path.exists() {
            let mut raw = vec![];
            File::open(&index_path)?.read_to_end(&mut raw)?;
            if raw.len() % 8 != 0 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated page index"));
            }
            for pair in raw.chunks_exact(8) {
                let page = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
                let slot = u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
                slots.insert(page, slot);
            }
        }

        Ok(Self { data, index_path, slots, page_size, index_dirty: !reuse })
    }

    /// Number of pages that have a slot in the data file.
    pub fn persisted_pages(&self) -> usize {
        self.slots.len()
    }

    fn offset(&self, slot: u32) -> u64 {
        u64::from(slot) * self.page_size as u64
    }

    fn load_page(&mut self, page: u32, buf: &mut [u8]) -> io::Result<()> {
        match self.slots.get(&page) {
            Some(&slot) => {
                self.data.seek(SeekFrom::Start(self.offset(slot)))?;
                read_or_zero(&mut self.data, buf)
            },
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    fn store_page(&mut self, page: u32, data: &[u8]) -> io::Result<()> {
        let next_slot = self.slots.len() as u32;
        let slot = *self.slots.entry(page).or_insert_with(|| {
            self.index_dirty = true;
            next_slot
        });

        self.data.seek(SeekFrom::Start(self.offset(slot)))?;
        self.data.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.data.flush()?;
        self.data.sync_data()?;

        if self.index_dirty {
            let mut pairs: Vec<_> = self.slots.iter().map(|(&p, &s)| (p, s)).collect();
            pairs.sort_unstable();

            let mut raw = Vec::with_capacity(pairs.len() * 8);
            for (page, slot) in pairs {
                raw.extend_from_slice(&page.to_le_bytes());
                raw.extend_from_slice(&slot.to_le_bytes());
            }
            let mut index = File::create(&self.index_path)?;
            index.write_all(&raw)?;
            index.sync_data()?;
            self.index_dirty = false;
        }
        Ok(())
    }
}
