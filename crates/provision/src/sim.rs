//! Simulated debug probe backed by an in-memory NOR flash model.
//!
//! Erased bytes read `0xFF`, programming can only clear bits, and erases
//! work on whole sectors. Faults can be injected per operation and every
//! call is counted, so tests can assert exactly which probe operations a
//! session issued.

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use keyburn_core::{MemoryMap, Uid, UID_LEN};

use crate::probe::{DebugProbe, ProbeError, ProbeLink};

/// Default simulated flash size (128 KiB).
pub const DEFAULT_FLASH_SIZE: u32 = 0x2_0000;

const ERASED: u8 = 0xFF;

/// Operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub connects: u32,
    pub disconnects: u32,
    pub resets: u32,
    pub reads: u32,
    pub erases: u32,
    pub flashes: u32,
    pub verifies: u32,
}

impl SimStats {
    /// Erase, flash and verify calls combined.
    pub fn write_path_calls(&self) -> u32 {
        self.erases + self.flashes + self.verifies
    }
}

/// Injected failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimFaults {
    pub refuse_connect: bool,
    pub fail_reset: bool,
    pub fail_read: bool,
    pub fail_erase: bool,
    pub fail_flash: bool,
    /// Flash "succeeds" but programs inverted data
    pub corrupt_writes: bool,
    pub fail_verify: bool,
}

#[derive(Debug)]
struct SimState {
    uid: Uid,
    uid_address: u32,
    flash_base: u32,
    sector_size: u32,
    flash: Vec<u8>,
    faults: SimFaults,
    stats: SimStats,
}

impl SimState {
    /// Offset into `flash` for `[address, address + len)`.
    fn flash_range(&self, address: u32, len: usize, operation: &str) -> Result<usize, ProbeError> {
        let start = address
            .checked_sub(self.flash_base)
            .map(|o| o as usize)
            .filter(|o| o.checked_add(len).is_some_and(|end| end <= self.flash.len()));
        start.ok_or_else(|| ProbeError::Command {
            operation: operation.to_string(),
            message: format!("{:#010x}+{:#x} is outside simulated flash", address, len),
        })
    }
}

fn injected(operation: &str) -> ProbeError {
    ProbeError::Command {
        operation: operation.to_string(),
        message: "injected fault".to_string(),
    }
}

/// A simulated target. Clones share the same device.
#[derive(Debug, Clone)]
pub struct SimProbe {
    state: Rc<RefCell<SimState>>,
}

impl SimProbe {
    /// Blank device with the given UID and memory map.
    pub fn new(uid: Uid, memory: &MemoryMap) -> Self {
        Self::with_flash_size(uid, memory, DEFAULT_FLASH_SIZE)
    }

    pub fn with_flash_size(uid: Uid, memory: &MemoryMap, flash_size: u32) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                uid,
                uid_address: memory.uid_address,
                flash_base: memory.flash_base,
                sector_size: memory.sector_size.max(1),
                flash: vec![ERASED; flash_size as usize],
                faults: SimFaults::default(),
                stats: SimStats::default(),
            })),
        }
    }

    pub fn uid(&self) -> Uid {
        self.state.borrow().uid
    }

    pub fn stats(&self) -> SimStats {
        self.state.borrow().stats
    }

    pub fn reset_stats(&self) {
        self.state.borrow_mut().stats = SimStats::default();
    }

    pub fn set_faults(&self, faults: SimFaults) {
        self.state.borrow_mut().faults = faults;
    }

    pub fn clear_faults(&self) {
        self.set_faults(SimFaults::default());
    }

    /// Inspect flash contents without counting a probe read.
    pub fn peek(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.state.borrow();
        match state.flash_range(address, len, "peek") {
            Ok(start) => state.flash[start..start + len].to_vec(),
            Err(_) => Vec::new(),
        }
    }

    /// Overwrite flash contents directly, e.g. to stage a previous key.
    pub fn poke(&self, address: u32, bytes: &[u8]) {
        let mut state = self.state.borrow_mut();
        if let Ok(start) = state.flash_range(address, bytes.len(), "poke") {
            state.flash[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Full chip erase, as after a field return.
    pub fn mass_erase(&self) {
        self.state.borrow_mut().flash.fill(ERASED);
    }
}

impl DebugProbe for SimProbe {
    type Link = SimLink;

    fn connect(&mut self) -> Result<SimLink, ProbeError> {
        let mut state = self.state.borrow_mut();
        if state.faults.refuse_connect {
            return Err(ProbeError::Connect("simulated probe refused connection".to_string()));
        }
        state.stats.connects += 1;
        Ok(SimLink {
            state: Rc::clone(&self.state),
        })
    }
}

/// Link to a [`SimProbe`] device.
#[derive(Debug)]
pub struct SimLink {
    state: Rc<RefCell<SimState>>,
}

impl ProbeLink for SimLink {
    fn reset_halt(&mut self) -> Result<(), ProbeError> {
        let mut state = self.state.borrow_mut();
        state.stats.resets += 1;
        if state.faults.fail_reset {
            return Err(injected("reset halt"));
        }
        Ok(())
    }

    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, ProbeError> {
        let mut state = self.state.borrow_mut();
        state.stats.reads += 1;
        if state.faults.fail_read {
            return Err(injected("read_memory"));
        }
        if address == state.uid_address && len <= UID_LEN {
            return Ok(state.uid.as_bytes()[..len].to_vec());
        }
        let start = state.flash_range(address, len, "read_memory")?;
        Ok(state.flash[start..start + len].to_vec())
    }

    fn erase_region(&mut self, address: u32, size: u32) -> Result<(), ProbeError> {
        let mut state = self.state.borrow_mut();
        state.stats.erases += 1;
        if state.faults.fail_erase {
            return Err(injected("erase"));
        }
        let start = state.flash_range(address, size as usize, "erase")?;
        let sector = state.sector_size as usize;
        let first = start / sector * sector;
        let last = (start + size as usize).div_ceil(sector) * sector;
        let last = last.min(state.flash.len());
        state.flash[first..last].fill(ERASED);
        Ok(())
    }

    fn flash_file(&mut self, path: &Path, address: u32) -> Result<(), ProbeError> {
        let data = fs::read(path)?;
        let mut state = self.state.borrow_mut();
        state.stats.flashes += 1;
        if state.faults.fail_flash {
            return Err(injected("flash"));
        }
        let corrupt = state.faults.corrupt_writes;
        let start = state.flash_range(address, data.len(), "flash")?;
        for (cell, byte) in state.flash[start..start + data.len()].iter_mut().zip(&data) {
            let programmed = if corrupt { !byte } else { *byte };
            *cell &= programmed;
        }
        Ok(())
    }

    fn verify_file(&mut self, path: &Path, address: u32) -> Result<bool, ProbeError> {
        let data = fs::read(path)?;
        let mut state = self.state.borrow_mut();
        state.stats.verifies += 1;
        if state.faults.fail_verify {
            return Err(injected("verify"));
        }
        let start = state.flash_range(address, data.len(), "verify")?;
        Ok(state.flash[start..start + data.len()] == data[..])
    }

    fn disconnect(&mut self) -> Result<(), ProbeError> {
        self.state.borrow_mut().stats.disconnects += 1;
        Ok(())
    }
}
