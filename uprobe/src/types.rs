/// Translated to rust from <arch/arm64/include/uapi/asm/ptrace.h> user_pt_regs
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct UserRegs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl UserRegs {
    /// The link register (x30)
    pub fn lr(&self) -> u64 {
        self.regs[30]
    }
}

/// How a probe is realised in the kernel
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProbeKind {
    /// Dynamic uprobe on an executable file offset
    Uprobe,
    /// CPU debug register breakpoint or watchpoint
    Hardware,
}

/// The trap kind of a hardware breakpoint
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HwBreakpointKind {
    Execute,
    Read,
    Write,
}

impl HwBreakpointKind {
    pub fn bp_type(&self) -> u32 {
        match self {
            Self::Read => crate::perf::HW_BREAKPOINT_R,
            Self::Write => crate::perf::HW_BREAKPOINT_W,
            Self::Execute => crate::perf::HW_BREAKPOINT_X,
        }
    }
}

/// A single probe firing, as read back from the sample ring
#[derive(Clone, Debug)]
pub struct ProbeEvent {
    pub pid: u32,
    pub tid: u32,
    pub regs: UserRegs,
    /// Caller-chosen identifier of the attachment that fired, typically the
    /// absolute address of the probed instruction
    pub key: u64,
    pub kind: ProbeKind,
    /// False when the kernel delivered the sample without a register set
    /// (PERF_SAMPLE_REGS_ABI_NONE)
    pub regs_valid: bool,
}
