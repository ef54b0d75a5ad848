//! Flash layout of the key region.

use keyburn_core::{CoreError, MemoryMap};

/// Resolved addresses and sizes for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    /// Absolute address of the key region (and of the sentinel)
    pub key_address: u32,
    /// Address of the silicon UID
    pub uid_address: u32,
    /// Minimum erasable unit in bytes
    pub sector_size: u32,
    /// Marker bytes of a programmed key region
    pub sentinel: [u8; 2],
}

impl FlashLayout {
    pub fn from_memory_map(memory: &MemoryMap) -> Result<Self, CoreError> {
        if memory.sector_size == 0 {
            return Err(CoreError::Config("sector_size must be non-zero".to_string()));
        }
        Ok(Self {
            key_address: memory.key_address()?,
            uid_address: memory.uid_address,
            sector_size: memory.sector_size,
            sentinel: memory.sentinel_bytes()?,
        })
    }

    /// Erase size for a key blob of `blob_len` bytes.
    ///
    /// Always `ceil(blob_len / sector_size) * sector_size`. Erasing less than
    /// a whole sector can leave bytes of a previous key behind.
    pub fn erase_span(&self, blob_len: u64) -> Result<u32, CoreError> {
        let span = round_to_sector(blob_len, self.sector_size);
        let span = u32::try_from(span).map_err(|_| {
            CoreError::Config(format!("key blob of {} bytes exceeds address space", blob_len))
        })?;
        self.key_address.checked_add(span).ok_or_else(|| {
            CoreError::Config(format!(
                "erase of {:#x} bytes at {:#010x} overflows address space",
                span, self.key_address
            ))
        })?;
        Ok(span)
    }

    /// True if `marker` is the programmed-key sentinel.
    pub fn is_sentinel(&self, marker: &[u8]) -> bool {
        marker == self.sentinel
    }
}

/// Round `size` up to a whole number of sectors.
pub fn round_to_sector(size: u64, sector_size: u32) -> u64 {
    let sector = u64::from(sector_size.max(1));
    size.div_ceil(sector) * sector
}
