//! OpenOCD TCL-RPC probe adapter.
//!
//! Talks to an already running OpenOCD server over its TCL-RPC port
//! (default 6666). Commands and responses are framed by a `0x1a` byte.
//! Every command that can fail on the target is wrapped in a TCL `catch`
//! so the reply is always `OK <result>` or `ERR <message>`.
//!
//! Socket reads and writes carry the configured timeout. An expired timeout
//! surfaces as [`ProbeError::Timeout`]; the provisioner decides whether that
//! is fatal or a failed programming attempt depending on where it happened.

use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use keyburn_core::ProbeConfig;

use crate::probe::{DebugProbe, ProbeError, ProbeLink};

/// TCL-RPC frame terminator.
const TERMINATOR: u8 = 0x1a;

/// Probe factory for an OpenOCD server.
#[derive(Debug, Clone)]
pub struct OpenOcdProbe {
    config: ProbeConfig,
}

impl OpenOcdProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms.max(1))
    }
}

impl DebugProbe for OpenOcdProbe {
    type Link = OpenOcdLink;

    fn connect(&mut self) -> Result<OpenOcdLink, ProbeError> {
        let endpoint = format!("{}:{}", self.config.host, self.config.port);
        let addrs = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| ProbeError::Connect(format!("cannot resolve {}: {}", endpoint, e)))?;

        let timeout = self.timeout();
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    let mut link = OpenOcdLink::new(stream, timeout, self.config.shutdown_on_disconnect)
                        .map_err(|e| ProbeError::Connect(format!("{}: {}", endpoint, e)))?;
                    let version = link
                        .raw("version", "version")
                        .map_err(|e| ProbeError::Connect(format!("{}: {}", endpoint, e)))?;
                    info!(endpoint = %endpoint, version = %version, "Connected to OpenOCD");
                    return Ok(link);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(ProbeError::Connect(match last_error {
            Some(e) => format!("{}: {}", endpoint, e),
            None => format!("{}: no addresses resolved", endpoint),
        }))
    }
}

/// Connected TCL-RPC session.
pub struct OpenOcdLink {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    shutdown_on_disconnect: bool,
    closed: bool,
}

impl OpenOcdLink {
    fn new(stream: TcpStream, timeout: Duration, shutdown_on_disconnect: bool) -> std::io::Result<Self> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: stream,
            reader,
            shutdown_on_disconnect,
            closed: false,
        })
    }

    /// Send one command and return the unframed reply.
    fn raw(&mut self, operation: &str, command: &str) -> Result<String, ProbeError> {
        if self.closed {
            return Err(ProbeError::Command {
                operation: operation.to_string(),
                message: "link already disconnected".to_string(),
            });
        }
        debug!(command = %command, "openocd <-");

        let mut frame = Vec::with_capacity(command.len() + 1);
        frame.extend_from_slice(command.as_bytes());
        frame.push(TERMINATOR);
        self.writer
            .write_all(&frame)
            .and_then(|_| self.writer.flush())
            .map_err(|e| classify(operation, e))?;

        let mut reply = Vec::new();
        self.reader
            .read_until(TERMINATOR, &mut reply)
            .map_err(|e| classify(operation, e))?;
        if reply.pop() != Some(TERMINATOR) {
            return Err(ProbeError::Command {
                operation: operation.to_string(),
                message: "debug server closed the connection".to_string(),
            });
        }

        let reply = String::from_utf8_lossy(&reply).trim().to_string();
        debug!(reply = %reply, "openocd ->");
        Ok(reply)
    }

    /// Run `command` inside a TCL `catch`.
    fn checked(&mut self, operation: &str, command: &str) -> Result<String, ProbeError> {
        let wrapped = format!(
            "if {{[catch {{{}}} msg]}} {{set r \"ERR $msg\"}} else {{set r \"OK $msg\"}}",
            command
        );
        let reply = self.raw(operation, &wrapped)?;
        parse_status(operation, &reply)
    }
}

impl ProbeLink for OpenOcdLink {
    fn reset_halt(&mut self) -> Result<(), ProbeError> {
        self.checked("reset halt", "reset halt").map(|_| ())
    }

    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, ProbeError> {
        let payload = self.checked("read_memory", &format!("read_memory {:#x} 8 {}", address, len))?;
        parse_bytes("read_memory", &payload, len)
    }

    fn erase_region(&mut self, address: u32, size: u32) -> Result<(), ProbeError> {
        self.checked(
            "erase",
            &format!("flash erase_address pad {:#x} {:#x}", address, size),
        )
        .map(|_| ())
    }

    fn flash_file(&mut self, path: &Path, address: u32) -> Result<(), ProbeError> {
        let path = tcl_path(path)?;
        self.checked(
            "flash",
            &format!("flash write_image {{{}}} {:#x} bin", path.display(), address),
        )
        .map(|_| ())
    }

    fn verify_file(&mut self, path: &Path, address: u32) -> Result<bool, ProbeError> {
        let path = tcl_path(path)?;
        match self.checked(
            "verify",
            &format!("verify_image {{{}}} {:#x} bin", path.display(), address),
        ) {
            Ok(_) => Ok(true),
            Err(ProbeError::Command { message, .. }) => {
                warn!(address = format_args!("{:#010x}", address), message = %message, "verify_image reported a mismatch");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn disconnect(&mut self) -> Result<(), ProbeError> {
        if self.closed {
            return Ok(());
        }
        if self.shutdown_on_disconnect {
            // The server drops the socket while handling this, so a missing
            // reply is expected.
            if let Err(e) = self.raw("shutdown", "shutdown") {
                debug!(error = %e, "No reply to shutdown");
            }
        }
        self.closed = true;
        match self.writer.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(ProbeError::Io(e)),
        }
    }
}

fn classify(operation: &str, error: std::io::Error) -> ProbeError {
    match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => ProbeError::Timeout {
            operation: operation.to_string(),
        },
        _ => ProbeError::Io(error),
    }
}

/// Absolute path safe to embed in a braced TCL word.
fn tcl_path(path: &Path) -> Result<PathBuf, ProbeError> {
    let absolute = fs::canonicalize(path)?;
    let text = absolute.to_string_lossy();
    if text.contains('{') || text.contains('}') {
        return Err(ProbeError::Command {
            operation: "path".to_string(),
            message: format!("{} cannot be quoted for OpenOCD", absolute.display()),
        });
    }
    Ok(absolute)
}

/// Split a wrapped reply into its result or error.
pub(crate) fn parse_status(operation: &str, reply: &str) -> Result<String, ProbeError> {
    if let Some(rest) = reply.strip_prefix("OK") {
        Ok(rest.trim().to_string())
    } else if let Some(rest) = reply.strip_prefix("ERR") {
        Err(ProbeError::Command {
            operation: operation.to_string(),
            message: rest.trim().to_string(),
        })
    } else {
        Err(ProbeError::Protocol {
            operation: operation.to_string(),
            response: reply.to_string(),
        })
    }
}

/// Parse a `read_memory` result such as `0xdc 0xdc`.
pub(crate) fn parse_bytes(operation: &str, payload: &str, expected: usize) -> Result<Vec<u8>, ProbeError> {
    let malformed = || ProbeError::Protocol {
        operation: operation.to_string(),
        response: payload.to_string(),
    };

    let bytes = payload
        .split_whitespace()
        .map(|token| {
            let digits = token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token);
            u8::from_str_radix(digits, 16)
        })
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| malformed())?;

    if bytes.len() != expected {
        return Err(malformed());
    }
    Ok(bytes)
}
