//! Debug probe abstraction.
//!
//! The provisioning workflow only sees these traits. A [`DebugProbe`] hands
//! out a connected [`ProbeLink`]; the link is owned by a [`ProbeSession`]
//! which releases it on every exit path, including early returns and
//! unwinding. A session never interrupts a call in flight: it releases the
//! link only after the current operation has returned.
//!
//! All addresses are absolute target addresses.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error};

use keyburn_core::{Uid, UID_LEN};

/// Errors reported by a probe implementation.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("cannot connect to debug probe: {0}")]
    Connect(String),

    #[error("timed out during {operation}")]
    Timeout { operation: String },

    #[error("{operation} failed: {message}")]
    Command { operation: String, message: String },

    #[error("malformed response to {operation}: {response:?}")]
    Protocol { operation: String, response: String },

    #[error("probe I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected debug link to one target.
pub trait ProbeLink {
    /// Reset the target and keep the core halted.
    fn reset_halt(&mut self) -> Result<(), ProbeError>;

    /// Read `len` bytes starting at `address`.
    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, ProbeError>;

    /// Read the 12-byte silicon UID at `address`.
    fn read_uid(&mut self, address: u32) -> Result<Uid, ProbeError> {
        let bytes = self.read_memory(address, UID_LEN)?;
        Uid::from_slice(&bytes).map_err(|e| ProbeError::Protocol {
            operation: "read_uid".to_string(),
            response: e.to_string(),
        })
    }

    /// Erase every sector overlapping `[address, address + size)`.
    fn erase_region(&mut self, address: u32, size: u32) -> Result<(), ProbeError>;

    /// Program the contents of `path` at `address`.
    fn flash_file(&mut self, path: &Path, address: u32) -> Result<(), ProbeError>;

    /// Compare the contents of `path` against target memory at `address`.
    fn verify_file(&mut self, path: &Path, address: u32) -> Result<bool, ProbeError>;

    /// Release the link and whatever debug-tool resources back it.
    fn disconnect(&mut self) -> Result<(), ProbeError>;
}

/// Factory for probe links.
pub trait DebugProbe {
    type Link: ProbeLink;

    fn connect(&mut self) -> Result<Self::Link, ProbeError>;
}

/// Scoped ownership of a connected probe link.
///
/// Dereferences to the link. [`ProbeSession::close`] disconnects and reports
/// the result; dropping an unclosed session disconnects and logs failures.
pub struct ProbeSession<L: ProbeLink> {
    link: L,
    open: bool,
}

impl<L: ProbeLink> ProbeSession<L> {
    /// Connect through `probe` and take ownership of the link.
    pub fn open<P>(probe: &mut P) -> Result<Self, ProbeError>
    where
        P: DebugProbe<Link = L>,
    {
        let link = probe.connect()?;
        debug!("Probe session opened");
        Ok(Self { link, open: true })
    }

    /// Disconnect now. The link is considered released even if the
    /// disconnect itself reports an error.
    pub fn close(mut self) -> Result<(), ProbeError> {
        self.open = false;
        let result = self.link.disconnect();
        debug!(ok = result.is_ok(), "Probe session closed");
        result
    }
}

impl<L: ProbeLink> Deref for ProbeSession<L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.link
    }
}

impl<L: ProbeLink> DerefMut for ProbeSession<L> {
    fn deref_mut(&mut self) -> &mut L {
        &mut self.link
    }
}

impl<L: ProbeLink> Drop for ProbeSession<L> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self.link.disconnect() {
                error!(error = %e, "Probe disconnect failed while unwinding session");
            }
        }
    }
}
