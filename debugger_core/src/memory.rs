//! Direct memory access through /proc/<pid>/mem
//!
//! The target must be stopped (or known to be idle at the address range)
//! while these run; callers are responsible for that.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use crate::error::{DebugError, Result};

/// Read up to `len` bytes at `addr`. Short reads at mapping boundaries
/// truncate the result rather than failing.
pub fn read(pid: u32, addr: u64, len: usize) -> Result<Vec<u8>> {
    let file = OpenOptions::new()
        .read(true)
        .open(format!("/proc/{}/mem", pid))
        .map_err(|_| DebugError::TargetLost(pid))?;

    let mut buf = vec![0u8; len];
    match file.read_at(&mut buf, addr) {
        Ok(n) => {
            buf.truncate(n);
            Ok(buf)
        }
        Err(e) => Err(DebugError::Io(e)),
    }
}

/// Write `data` at `addr`, returning the number of bytes written
pub fn write(pid: u32, addr: u64, data: &[u8]) -> Result<usize> {
    let file = OpenOptions::new()
        .write(true)
        .open(format!("/proc/{}/mem", pid))
        .map_err(|_| DebugError::TargetLost(pid))?;

    file.write_at(data, addr).map_err(DebugError::Io)
}

/// Fetch the 4-byte instruction at `addr`
pub fn read_instruction(pid: u32, addr: u64) -> Result<u32> {
    let bytes = read(pid, addr, 4)?;
    if bytes.len() < 4 {
        return Err(DebugError::Parse(format!(
            "cannot read instruction at {:#x}",
            addr
        )));
    }
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
