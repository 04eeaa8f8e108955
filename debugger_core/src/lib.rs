//! Breakpoint engine for debugging ARM64 processes without ptrace
//!
//! The target is driven by combining kernel uprobes and hardware-breakpoint
//! perf events with /proc memory I/O and SIGSTOP/SIGCONT job control. Each
//! resume compiles the breakpoint table into a fresh kernel probe set;
//! stepping works by predicting the next program counter from the decoded
//! instruction and installing a one-shot breakpoint there.

pub mod address;
pub mod breakpoints;
pub mod error;
pub mod eval;
pub mod library;
pub mod memory;
pub mod predictor;
pub mod process;
pub mod registers;
pub mod session;

pub use address::{Address, ABSOLUTE_CUTOFF};
pub use breakpoints::{Breakpoint, BreakpointKind, BreakpointManager};
pub use error::{DebugError, Result};
pub use library::{Library, LibraryArena, LibraryId};
pub use process::{Process, Thread};
pub use registers::RegisterContext;
pub use session::{Session, StopInfo, ThreadFilter};

pub use uprobe::HwBreakpointKind;
