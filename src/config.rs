//! Machine configuration.
//!
//! A [`MachineConfig`] describes a whole machine: its memory, an optional cache in front of it,
//! and the flags of its execution core. Configurations are usually loaded from TOML.
//! Every field has a default, so any section or key can be left out.
//!
//! # Config File Format
//!
//! ```toml
//! [memory]
//! size = 16777216            # bytes, at most 2^32
//! page-size = 4096           # power of two
//! max-loaded-pages = 64      # hot pages kept in host memory
//! endianness = "little"      # little | big
//! storage = "file-optimized" # volatile | file-original | file-optimized
//! path = "machine.mem"
//! reuse-cold-storage = true
//!
//! [cache]
//! associativity = 4
//! block-count = 64
//! block-size = 16
//! write-policy = "write-back"    # write-through | write-back
//! replacement-policy = "lru"     # fifo | lru | lfu | random | second-chance
//! seed = 7
//!
//! [cpu]
//! branch-delay-slot = true
//! initial-sp = 0x7FFFEFFC
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::sim::cache::{Cache, CacheConfig};
use crate::sim::mem::paged::{MemoryConfig, PagedMemory};
use crate::sim::mem::Memory;
use crate::sim::{SimErr, SimFlags};

/// The configuration of a whole machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MachineConfig {
    /// The paged memory.
    pub memory: MemoryConfig,
    /// The cache in front of memory. If absent, the core accesses memory directly.
    pub cache: Option<CacheConfig>,
    /// The execution core's flags.
    pub cpu: SimFlags,
}

impl MachineConfig {
    /// Parses a configuration from TOML, validating it.
    pub fn from_toml_str(text: &str) -> Result<Self, SimErr> {
        let config: Self = toml::from_str(text).map_err(SimErr::ConfigParse)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a configuration from a TOML file, validating it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SimErr> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(SimErr::ConfigIo)?;
        let config = Self::from_toml_str(&text)?;
        log::info!("loaded machine configuration from {}", path.display());
        Ok(config)
    }

    /// Serializes this configuration to TOML.
    pub fn to_toml_string(&self) -> Result<String, SimErr> {
        toml::to_string(self).map_err(|e| SimErr::InvalidConfig(e.to_string()))
    }

    /// Checks every section for invalid values.
    pub fn validate(&self) -> Result<(), SimErr> {
        self.memory.validate()?;
        if let Some(cache) = &self.cache {
            cache.validate()?;
            let block_size = u64::from(cache.block_size);
            if block_size > self.memory.size || self.memory.size % block_size != 0 {
                return Err(SimErr::InvalidConfig(format!(
                    "cache block size {block_size} does not evenly divide memory size {:#x}", self.memory.size
                )));
            }
        }
        Ok(())
    }

    /// Creates the memory this configuration describes (with its cache, if any).
    pub fn build_memory(&self) -> Result<Memory, SimErr> {
        let paged = PagedMemory::new(&self.memory)?;
        match &self.cache {
            Some(cache) => Ok(Memory::Cached(Cache::new(paged, cache)?)),
            None => Ok(Memory::Paged(paged)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::cache::{ReplacementPolicy, WritePolicy};
    use crate::sim::mem::paged::StorageType;
    use crate::sim::mem::{Endianness, MemoryDevice};
    use crate::sim::SimErrKind;
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MachineConfig::from_toml_str("").unwrap();
        assert_eq!(config, MachineConfig::default());
        assert_eq!(config.memory.size, 1 << 32);
        assert_eq!(config.memory.page_size, 4096);
        assert!(config.cache.is_none());
        assert!(!config.cpu.branch_delay_slot);
    }

    #[test]
    fn test_parse_sections() {
        let config = MachineConfig::from_toml_str(r#"
            [memory]
            size = 65536
            page-size = 1024
            max-loaded-pages = 4
            endianness = "big"

            [cache]
            associativity = 2
            block-count = 8
            block-size = 4
            write-policy = "write-through"
            replacement-policy = "second-chance"

            [cpu]
            branch-delay-slot = true
            initial-sp = 0x8000
        "#).unwrap();

        assert_eq!(config.memory.size, 65536);
        assert_eq!(config.memory.page_size, 1024);
        assert_eq!(config.memory.max_loaded_pages, 4);
        assert_eq!(config.memory.endianness, Endianness::Big);
        assert_eq!(config.memory.storage, StorageType::Volatile);

        let cache = config.cache.as_ref().unwrap();
        assert_eq!(cache.associativity, 2);
        assert_eq!(cache.block_count, 8);
        assert_eq!(cache.write_policy, WritePolicy::WriteThrough);
        assert_eq!(cache.replacement_policy, ReplacementPolicy::SecondChance);

        assert!(config.cpu.branch_delay_slot);
        assert_eq!(config.cpu.initial_sp, Some(0x8000));

        let mem = config.build_memory().unwrap();
        assert!(mem.cache().is_some());
    }

    #[test]
    fn test_storage_names() {
        for (name, storage) in [
            ("volatile", StorageType::Volatile),
            ("file-original", StorageType::FileOriginal),
            ("file-optimized", StorageType::FileOptimized),
        ] {
            let text = format!("[memory]\nstorage = \"{name}\"\npath = \"mem.bin\"");
            let config = MachineConfig::from_toml_str(&text).unwrap();
            assert_eq!(config.memory.storage, storage);
        }
    }

    #[test]
    fn test_invalid() {
        let cases = [
            "[memory]\npage-size = 1000",
            "[memory]\nsize = 5000\npage-size = 4096",
            "[memory]\nmax-loaded-pages = 0",
            "[memory]\nstorage = \"file-original\"",
            "[cache]\nblock-size = 3",
            "[cache]\nassociativity = 3\nblock-count = 8",
            "[memory]\nsize = 256\npage-size = 256\n[cache]\nblock-size = 512",
        ];
        for text in cases {
            let err = MachineConfig::from_toml_str(text).unwrap_err();
            assert_eq!(err.kind(), SimErrKind::Config, "{text}");
        }

        let err = MachineConfig::from_toml_str("[cache]\nreplacement-policy = \"mru\"").unwrap_err();
        assert!(matches!(err, SimErr::ConfigParse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[memory]\nsize = 4096\npage-size = 256\n").unwrap();

        let config = MachineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.memory.size, 4096);

        let err = MachineConfig::from_file(file.path().with_extension("missing")).unwrap_err();
        assert_eq!(err.kind(), SimErrKind::Io);
    }

    #[test]
    fn test_write_back_reaches_cold_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MachineConfig {
            memory: MemoryConfig {
                size: 4096,
                page_size: 256,
                max_loaded_pages: 2,
                storage: StorageType::FileOptimized,
                path: Some(dir.path().join("machine.mem")),
                ..Default::default()
            },
            cache: Some(CacheConfig {
                associativity: 2,
                block_count: 8,
                block_size: 16,
                write_policy: WritePolicy::WriteBack,
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut mem = config.build_memory().unwrap();
        mem.write_word(0x40, 0xDEAD_BEEF).unwrap();
        mem.write_byte(0xF01, 0x5A).unwrap();
        // still only in the cache
        let paged = mem.cache_mut().unwrap().backing_mut();
        assert_eq!(paged.read_word(0x40).unwrap(), 0);
        mem.close().unwrap();

        config.memory.reuse_cold_storage = true;
        let mut mem = config.build_memory().unwrap();
        assert_eq!(mem.read_word(0x40).unwrap(), 0xDEAD_BEEF);
        assert_eq!(mem.read_byte(0xF01).unwrap(), 0x5A);
    }

    #[test]
    fn test_round_trip_text() {
        let config = MachineConfig {
            cache: Some(CacheConfig::default()),
            cpu: SimFlags { branch_delay_slot: true, initial_sp: None },
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(MachineConfig::from_toml_str(&text).unwrap(), config);
    }
}
