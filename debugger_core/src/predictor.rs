//! Next-PC prediction by decoding the ARM64 instruction at the current PC
//!
//! The predictor never executes anything. It classifies the instruction and
//! computes where control can go from the captured register state. When the
//! outcome depends on condition flags that were not captured, it reports the
//! data-dependent sentinel and the caller arms both successors.

use crate::error::{DebugError, Result};
use crate::memory;
use crate::registers::RegisterContext;

/// Sentinel meaning "install breakpoints at both PC+4 and the branch target"
pub const DATA_DEPENDENT: u64 = 0xDEAD_BEEF;

/// Whether call-like instructions are descended into (`step`) or stepped
/// over (`next`)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StepMode {
    Into,
    Over,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum InsnClass {
    /// B
    Branch { target: u64 },
    /// BL
    BranchLink { target: u64 },
    /// B.cond
    CondBranch { target: u64, cond: u32 },
    /// CBZ / CBNZ
    CompareBranch { target: u64, rt: u32, is64: bool, on_zero: bool },
    /// TBZ / TBNZ
    TestBranch { target: u64, rt: u32, bit: u32, on_zero: bool },
    /// BR
    IndirectBranch { rn: u32 },
    /// BLR
    IndirectCall { rn: u32 },
    /// RET
    Return { rn: u32 },
    Other,
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn classify(insn: u32, pc: u64) -> InsnClass {
    if insn & 0xFC00_0000 == 0x1400_0000 {
        let imm = sign_extend((insn & 0x03FF_FFFF) as u64, 26) * 4;
        return InsnClass::Branch {
            target: pc.wrapping_add(imm as u64),
        };
    }
    if insn & 0xFC00_0000 == 0x9400_0000 {
        let imm = sign_extend((insn & 0x03FF_FFFF) as u64, 26) * 4;
        return InsnClass::BranchLink {
            target: pc.wrapping_add(imm as u64),
        };
    }
    if insn & 0xFF00_0010 == 0x5400_0000 {
        let imm = sign_extend(((insn >> 5) & 0x7_FFFF) as u64, 19) * 4;
        return InsnClass::CondBranch {
            target: pc.wrapping_add(imm as u64),
            cond: insn & 0xF,
        };
    }
    if insn & 0x7F00_0000 == 0x3400_0000 || insn & 0x7F00_0000 == 0x3500_0000 {
        let imm = sign_extend(((insn >> 5) & 0x7_FFFF) as u64, 19) * 4;
        return InsnClass::CompareBranch {
            target: pc.wrapping_add(imm as u64),
            rt: insn & 0x1F,
            is64: insn >> 31 == 1,
            on_zero: insn & 0x0100_0000 == 0,
        };
    }
    if insn & 0x7F00_0000 == 0x3600_0000 || insn & 0x7F00_0000 == 0x3700_0000 {
        let imm = sign_extend(((insn >> 5) & 0x3FFF) as u64, 14) * 4;
        return InsnClass::TestBranch {
            target: pc.wrapping_add(imm as u64),
            rt: insn & 0x1F,
            bit: ((insn >> 31) << 5) | ((insn >> 19) & 0x1F),
            on_zero: insn & 0x0100_0000 == 0,
        };
    }
    if insn & 0xFFFF_FC1F == 0xD61F_0000 {
        return InsnClass::IndirectBranch {
            rn: (insn >> 5) & 0x1F,
        };
    }
    if insn & 0xFFFF_FC1F == 0xD63F_0000 {
        return InsnClass::IndirectCall {
            rn: (insn >> 5) & 0x1F,
        };
    }
    if insn & 0xFFFF_FC1F == 0xD65F_0000 {
        return InsnClass::Return {
            rn: (insn >> 5) & 0x1F,
        };
    }
    InsnClass::Other
}

/// Evaluate an A64 condition code against the captured NZCV flags.
/// 0b1110 (AL) and 0b1111 behave as always-true for B.cond.
fn condition_holds(cond: u32, ctx: &RegisterContext) -> bool {
    let (n, z, c, v) = (ctx.flag_n(), ctx.flag_z(), ctx.flag_c(), ctx.flag_v());
    if cond >= 0b1110 {
        return true;
    }
    let base = match cond >> 1 {
        0b000 => z,
        0b001 => c,
        0b010 => n,
        0b011 => v,
        0b100 => c && !z,
        0b101 => n == v,
        0b110 => n == v && !z,
        _ => true,
    };
    if cond & 1 == 1 {
        !base
    } else {
        base
    }
}

/// Predict the next program counter from the instruction at the context's PC.
///
/// Returns `DATA_DEPENDENT` when the branch cannot be decided from the
/// captured state; `branch_target` then gives the other successor.
pub fn predict_next_pc(insn: u32, ctx: &RegisterContext, mode: StepMode) -> u64 {
    let pc = ctx.pc();
    let fallthrough = pc.wrapping_add(4);

    match classify(insn, pc) {
        InsnClass::Branch { target } => target,
        InsnClass::BranchLink { target } => match mode {
            StepMode::Into => target,
            StepMode::Over => fallthrough,
        },
        InsnClass::CondBranch { target, cond } => {
            if !ctx.pstate_valid {
                return DATA_DEPENDENT;
            }
            if condition_holds(cond, ctx) {
                target
            } else {
                fallthrough
            }
        }
        InsnClass::CompareBranch {
            target,
            rt,
            is64,
            on_zero,
        } => {
            let value = if is64 {
                ctx.x(rt as usize)
            } else {
                ctx.x(rt as usize) & 0xFFFF_FFFF
            };
            if (value == 0) == on_zero {
                target
            } else {
                fallthrough
            }
        }
        InsnClass::TestBranch {
            target,
            rt,
            bit,
            on_zero,
        } => {
            let bit_clear = ctx.x(rt as usize) & (1u64 << bit) == 0;
            if bit_clear == on_zero {
                target
            } else {
                fallthrough
            }
        }
        InsnClass::IndirectBranch { rn } => ctx.x(rn as usize),
        InsnClass::IndirectCall { rn } => match mode {
            StepMode::Into => ctx.x(rn as usize),
            StepMode::Over => fallthrough,
        },
        InsnClass::Return { rn } => ctx.x(rn as usize),
        InsnClass::Other => fallthrough,
    }
}

/// The immediate target of the branch at PC, for arming the second
/// breakpoint of a data-dependent pair
pub fn branch_target(insn: u32, ctx: &RegisterContext) -> Result<u64> {
    match classify(insn, ctx.pc()) {
        InsnClass::Branch { target }
        | InsnClass::BranchLink { target }
        | InsnClass::CondBranch { target, .. }
        | InsnClass::CompareBranch { target, .. }
        | InsnClass::TestBranch { target, .. } => Ok(target),
        InsnClass::IndirectBranch { rn }
        | InsnClass::IndirectCall { rn }
        | InsnClass::Return { rn } => Ok(ctx.x(rn as usize)),
        InsnClass::Other => Err(DebugError::Parse(format!(
            "instruction {:#010x} at {:#x} has no branch target",
            insn,
            ctx.pc()
        ))),
    }
}

/// True when the instruction's successor depends on register or flag state.
/// A hardware breakpoint must not be used on these for stepping, the
/// coordinator needs the register snapshot a uprobe delivers.
pub fn hw_unsafe(insn: u32) -> bool {
    !matches!(
        classify(insn, 0),
        InsnClass::Other | InsnClass::Branch { .. } | InsnClass::BranchLink { .. }
    )
}

/// Fetch and predict in one go, for a stopped target
pub fn predict(pid: u32, ctx: &RegisterContext, mode: StepMode) -> Result<u64> {
    let insn = memory::read_instruction(pid, ctx.pc())?;
    Ok(predict_next_pc(insn, ctx, mode))
}

/// Fetch and compute the branch target in one go
pub fn target(pid: u32, ctx: &RegisterContext) -> Result<u64> {
    let insn = memory::read_instruction(pid, ctx.pc())?;
    branch_target(insn, ctx)
}

#[cfg(test)]
mod tests;
