//! Thin wrappers over the perf_event_open(2) interface
//!
//! The attr struct is translated by hand rather than taken from a binding
//! crate so that the dynamic-PMU fields (config1/config2) keep their uprobe
//! meaning (file path pointer and probe offset).

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::types::{HwBreakpointKind, ProbeKind};

pub const PERF_TYPE_BREAKPOINT: u32 = 5;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;

pub const PERF_RECORD_SAMPLE: u32 = 9;

pub const HW_BREAKPOINT_R: u32 = 1;
pub const HW_BREAKPOINT_W: u32 = 2;
pub const HW_BREAKPOINT_X: u32 = 4;
pub const HW_BREAKPOINT_LEN_4: u64 = 4;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

/// arm64 user sample register set: x0..x30, sp, pc
pub const PERF_REG_ARM64_COUNT: u32 = 33;
pub const PERF_REGS_MASK_ARM64: u64 = (1u64 << PERF_REG_ARM64_COUNT) - 1;

const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

const ATTR_FLAG_DISABLED: u64 = 1 << 0;
const ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;

/// Data pages in each sample ring, must be a power of two
const RING_DATA_PAGES: usize = 8;

/// Translated to rust from <linux/perf_event.h> perf_event_attr (ABI version 6)
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    /// bp_addr for breakpoint events, uprobe_path pointer for uprobe events
    pub config1: u64,
    /// bp_len for breakpoint events, probe_offset for uprobe events
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

/// Translated to rust from <linux/perf_event.h> perf_event_mmap_page,
/// up to and including the ring head/tail words at offset 1024
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 116 * 8],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

fn perf_event_open(
    attr: &PerfEventAttr,
    pid: i32,
    cpu: i32,
    group_fd: i32,
    flags: libc::c_ulong,
) -> io::Result<RawFd> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd as RawFd)
    }
}

/// What a probe observes: one thread, or everything on one cpu
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProbeScope {
    Thread(u32),
    Cpu(i32),
}

impl ProbeScope {
    fn pid_cpu(&self) -> (i32, i32) {
        match self {
            Self::Thread(tid) => (*tid as i32, -1),
            Self::Cpu(cpu) => (-1, *cpu),
        }
    }
}

/// A single live perf attachment together with its mmap'd sample ring
pub struct PerfEvent {
    pub(crate) fd: RawFd,
    pub(crate) mmap: *mut libc::c_void,
    pub(crate) mmap_len: usize,
    pub key: u64,
    pub kind: ProbeKind,
}

// The ring pointer is only touched from the owning ProbeSet
unsafe impl Send for PerfEvent {}

impl PerfEvent {
    fn from_fd(fd: RawFd, key: u64, kind: ProbeKind) -> io::Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mmap_len = (1 + RING_DATA_PAGES) * page_size;
        let mmap = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mmap == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self {
            fd,
            mmap,
            mmap_len,
            key,
            kind,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn enable(&self) -> io::Result<()> {
        if unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_ENABLE, 0) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn disable(&self) {
        unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_DISABLE, 0) };
    }
}

impl Drop for PerfEvent {
    fn drop(&mut self) {
        self.disable();
        unsafe {
            libc::munmap(self.mmap, self.mmap_len);
            libc::close(self.fd);
        }
    }
}

/// The dynamic PMU id of the uprobe event source, from sysfs
pub fn uprobe_pmu_type() -> io::Result<u32> {
    let text = std::fs::read_to_string("/sys/bus/event_source/devices/uprobe/type")?;
    text.trim().parse::<u32>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad uprobe pmu type: {}", e),
        )
    })
}

fn base_sample_attr() -> PerfEventAttr {
    PerfEventAttr {
        size: std::mem::size_of::<PerfEventAttr>() as u32,
        sample_period: 1,
        sample_type: PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_REGS_USER,
        sample_regs_user: PERF_REGS_MASK_ARM64,
        wakeup_events: 1,
        flags: ATTR_FLAG_DISABLED | ATTR_FLAG_EXCLUDE_KERNEL | ATTR_FLAG_EXCLUDE_HV,
        ..Default::default()
    }
}

/// Attach a uprobe at `offset` within the executable file at `path`.
/// The probe starts disabled.
pub fn attach_uprobe(
    path: &Path,
    offset: u64,
    scope: ProbeScope,
    key: u64,
) -> io::Result<PerfEvent> {
    let pmu = uprobe_pmu_type()?;
    let cpath = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut attr = base_sample_attr();
    attr.type_ = pmu;
    attr.config = 0;
    attr.config1 = cpath.as_ptr() as u64;
    attr.config2 = offset;

    let (pid, cpu) = scope.pid_cpu();
    let fd = perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)?;
    // cpath must outlive the syscall, the kernel copies the string
    drop(cpath);
    log::debug!(
        "uprobe attached: {}:{:#x} scope={:?} fd={}",
        path.display(),
        offset,
        scope,
        fd
    );
    PerfEvent::from_fd(fd, key, ProbeKind::Uprobe)
}

/// Attach a hardware breakpoint at `addr`, scoped to the thread `tid`.
/// The event starts disabled.
pub fn attach_hw_breakpoint(
    tid: u32,
    addr: u64,
    kind: HwBreakpointKind,
    len: u64,
    key: u64,
) -> io::Result<PerfEvent> {
    let mut attr = base_sample_attr();
    attr.type_ = PERF_TYPE_BREAKPOINT;
    attr.bp_type = kind.bp_type();
    attr.config1 = addr;
    // Execute breakpoints trap on the instruction itself, length is fixed
    attr.config2 = if kind == HwBreakpointKind::Execute {
        HW_BREAKPOINT_LEN_4
    } else {
        len
    };

    let fd = perf_event_open(&attr, tid as i32, -1, -1, PERF_FLAG_FD_CLOEXEC)?;
    log::debug!("hw breakpoint attached: {:#x} tid={} fd={}", addr, tid, fd);
    PerfEvent::from_fd(fd, key, ProbeKind::Hardware)
}
