//! User-space dynamic tracing without ptrace, based on the perf_event_open() API
//!
//! Two probe flavours are supported: uprobes registered through the kernel's
//! dynamic `uprobe` PMU, and hardware breakpoints backed by the CPU debug
//! registers. Both deliver samples carrying the interrupted thread's register
//! file through a per-event mmap ring.

pub mod perf;
pub mod ring;
pub mod types;

pub use perf::{attach_hw_breakpoint, attach_uprobe, PerfEvent, ProbeScope};
pub use ring::ProbeSet;
pub use types::{HwBreakpointKind, ProbeEvent, ProbeKind, UserRegs};

use std::io;

pub type ProbeResult<T> = io::Result<T>;
