//! Sample ring handling for a set of live perf attachments

use std::io;
use std::sync::atomic::{fence, Ordering};

use crate::perf::{PerfEvent, PerfEventHeader, PerfEventMmapPage, PERF_RECORD_SAMPLE};
use crate::types::{ProbeEvent, UserRegs};

/// The set of attachments backing one probe installation.
/// Exactly one set is live between install and teardown.
#[derive(Default)]
pub struct ProbeSet {
    events: Vec<PerfEvent>,
}

impl ProbeSet {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn push(&mut self, event: PerfEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Arm every attachment. On failure the caller is expected to tear the
    /// whole set down, partial enables are not rolled back here.
    pub fn enable_all(&self) -> io::Result<()> {
        for event in &self.events {
            event.enable()?;
        }
        Ok(())
    }

    pub fn disable_all(&self) {
        for event in &self.events {
            event.disable();
        }
    }

    /// Detach everything, closing fds and unmapping rings
    pub fn detach_all(&mut self) {
        self.events.clear();
    }

    /// Block for up to `timeout_ms` waiting for any ring to become readable,
    /// then drain all pending samples
    pub fn poll(&mut self, timeout_ms: i32) -> io::Result<Vec<ProbeEvent>> {
        if self.events.is_empty() {
            // Running with no probes armed still needs to block the caller
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms.max(0) as u64));
            return Ok(Vec::new());
        }
        let mut fds: Vec<libc::pollfd> = self
            .events
            .iter()
            .map(|e| libc::pollfd {
                fd: e.fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        Ok(self.drain())
    }

    /// Read every pending sample without waiting. Also used after teardown to
    /// flush stale events that raced with the detach.
    pub fn drain(&mut self) -> Vec<ProbeEvent> {
        let mut out = Vec::new();
        for event in &mut self.events {
            drain_ring(event, &mut out);
        }
        out
    }
}

fn drain_ring(event: &mut PerfEvent, out: &mut Vec<ProbeEvent>) {
    let page = event.mmap as *mut PerfEventMmapPage;
    let (data_offset, data_size) = unsafe {
        let off = std::ptr::read_volatile(&(*page).data_offset);
        let size = std::ptr::read_volatile(&(*page).data_size);
        if size != 0 {
            (off as usize, size as usize)
        } else {
            // Pre-4.1 layout: data follows the first page
            let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            (page_size, event.mmap_len - page_size)
        }
    };
    let data = unsafe { (event.mmap as *const u8).add(data_offset) };

    let head = unsafe { std::ptr::read_volatile(&(*page).data_head) };
    fence(Ordering::Acquire);
    let mut tail = unsafe { std::ptr::read_volatile(&(*page).data_tail) };

    while tail < head {
        let mut header = PerfEventHeader {
            type_: 0,
            misc: 0,
            size: 0,
        };
        read_wrapped(data, data_size, tail, unsafe {
            std::slice::from_raw_parts_mut(
                &mut header as *mut PerfEventHeader as *mut u8,
                std::mem::size_of::<PerfEventHeader>(),
            )
        });
        if (header.size as usize) < std::mem::size_of::<PerfEventHeader>() {
            break;
        }
        if header.type_ == PERF_RECORD_SAMPLE {
            let body_len = header.size as usize - std::mem::size_of::<PerfEventHeader>();
            let mut body = vec![0u8; body_len];
            read_wrapped(
                data,
                data_size,
                tail + std::mem::size_of::<PerfEventHeader>() as u64,
                &mut body,
            );
            if let Some(sample) = parse_sample(&body, event) {
                out.push(sample);
            }
        }
        tail += header.size as u64;
    }

    fence(Ordering::Release);
    unsafe { std::ptr::write_volatile(&mut (*page).data_tail, tail) };
}

/// Copy `buf.len()` bytes starting at ring offset `offset`, handling wrap
fn read_wrapped(data: *const u8, data_size: usize, offset: u64, buf: &mut [u8]) {
    let start = (offset as usize) & (data_size - 1);
    let first = std::cmp::min(buf.len(), data_size - start);
    unsafe {
        std::ptr::copy_nonoverlapping(data.add(start), buf.as_mut_ptr(), first);
        if first < buf.len() {
            std::ptr::copy_nonoverlapping(data, buf.as_mut_ptr().add(first), buf.len() - first);
        }
    }
}

/// Decode a PERF_RECORD_SAMPLE body laid out as IP | TID | REGS_USER
fn parse_sample(body: &[u8], event: &PerfEvent) -> Option<ProbeEvent> {
    let mut cursor = 0usize;
    let _ip = take_u64(body, &mut cursor)?;
    let pid = take_u32(body, &mut cursor)?;
    let tid = take_u32(body, &mut cursor)?;
    let abi = take_u64(body, &mut cursor)?;

    let mut regs = UserRegs::default();
    let regs_valid = abi != 0;
    if regs_valid {
        for i in 0..31 {
            regs.regs[i] = take_u64(body, &mut cursor)?;
        }
        regs.sp = take_u64(body, &mut cursor)?;
        regs.pc = take_u64(body, &mut cursor)?;
    }

    Some(ProbeEvent {
        pid,
        tid,
        regs,
        key: event.key,
        kind: event.kind,
        regs_valid,
    })
}

fn take_u64(body: &[u8], cursor: &mut usize) -> Option<u64> {
    let bytes = body.get(*cursor..*cursor + 8)?;
    *cursor += 8;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

fn take_u32(body: &[u8], cursor: &mut usize) -> Option<u32> {
    let bytes = body.get(*cursor..*cursor + 4)?;
    *cursor += 4;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::{take_u32, take_u64};

    #[test]
    pub fn when_take_u64_past_end_then_none() {
        let body = [0u8; 4];
        let mut cursor = 0;
        assert!(take_u64(&body, &mut cursor).is_none());
    }

    #[test]
    pub fn when_take_values_then_cursor_advances() {
        let mut body = Vec::new();
        body.extend_from_slice(&0x1122334455667788u64.to_le_bytes());
        body.extend_from_slice(&0xdeadbeefu32.to_le_bytes());

        let mut cursor = 0;
        assert_eq!(take_u64(&body, &mut cursor), Some(0x1122334455667788));
        assert_eq!(take_u32(&body, &mut cursor), Some(0xdeadbeef));
        assert_eq!(cursor, 12);
    }
}
