use super::{branch_target, hw_unsafe, predict_next_pc, StepMode, DATA_DEPENDENT};
use crate::registers::RegisterContext;

const PC: u64 = 0x7100001000;
const NOP: u32 = 0xD503201F;
const MOV_X0_X1: u32 = 0xAA0103E0;
const LDR_X0_X1: u32 = 0xF9400020;

const PSTATE_N: u64 = 1 << 31;
const PSTATE_Z: u64 = 1 << 30;
const PSTATE_V: u64 = 1 << 28;

fn context() -> RegisterContext {
    let mut ctx = RegisterContext::default();
    ctx.regs.pc = PC;
    ctx.regs_valid = true;
    ctx
}

fn context_with_flags(pstate: u64) -> RegisterContext {
    let mut ctx = context();
    ctx.regs.pstate = pstate;
    ctx.pstate_valid = true;
    ctx
}

#[test]
pub fn when_instruction_is_not_a_branch_then_next_pc_is_fallthrough() {
    let ctx = context();
    for insn in [NOP, MOV_X0_X1, LDR_X0_X1] {
        assert_eq!(predict_next_pc(insn, &ctx, StepMode::Into), PC + 4);
        assert_eq!(predict_next_pc(insn, &ctx, StepMode::Over), PC + 4);
    }
}

#[test]
pub fn when_unconditional_branch_then_both_modes_take_the_target() {
    let ctx = context();
    // b .+0x20
    let b_forward: u32 = 0x14000008;
    assert_eq!(predict_next_pc(b_forward, &ctx, StepMode::Into), PC + 0x20);
    assert_eq!(predict_next_pc(b_forward, &ctx, StepMode::Over), PC + 0x20);

    // b .-8
    let b_backward: u32 = 0x17FFFFFE;
    assert_eq!(predict_next_pc(b_backward, &ctx, StepMode::Into), PC - 8);
}

#[test]
pub fn when_branch_and_link_then_only_step_descends() {
    let ctx = context();
    // bl .+0x40
    let bl: u32 = 0x94000010;
    assert_eq!(predict_next_pc(bl, &ctx, StepMode::Into), PC + 0x40);
    assert_eq!(predict_next_pc(bl, &ctx, StepMode::Over), PC + 4);
}

#[test]
pub fn when_conditional_branch_with_known_flags_then_single_next_pc() {
    // b.eq .+0x10
    let b_eq: u32 = 0x54000080;
    // b.ne .+0x10
    let b_ne: u32 = 0x54000081;

    let zero_set = context_with_flags(PSTATE_Z);
    assert_eq!(predict_next_pc(b_eq, &zero_set, StepMode::Into), PC + 0x10);
    assert_eq!(predict_next_pc(b_ne, &zero_set, StepMode::Into), PC + 4);

    let zero_clear = context_with_flags(0);
    assert_eq!(predict_next_pc(b_eq, &zero_clear, StepMode::Into), PC + 4);
    assert_eq!(predict_next_pc(b_ne, &zero_clear, StepMode::Into), PC + 0x10);
}

#[test]
pub fn when_conditional_branch_with_signed_conditions_then_flags_combine() {
    // b.lt .+0x10 (N != V)
    let b_lt: u32 = 0x5400008B;
    assert_eq!(
        predict_next_pc(b_lt, &context_with_flags(PSTATE_N), StepMode::Into),
        PC + 0x10
    );
    assert_eq!(
        predict_next_pc(b_lt, &context_with_flags(PSTATE_N | PSTATE_V), StepMode::Into),
        PC + 4
    );

    // b.al is always taken
    let b_al: u32 = 0x5400008E;
    assert_eq!(
        predict_next_pc(b_al, &context_with_flags(0), StepMode::Into),
        PC + 0x10
    );
}

#[test]
pub fn when_conditional_branch_without_flags_then_data_dependent() {
    let ctx = context();
    assert!(!ctx.pstate_valid);
    // b.eq .+0x10
    let b_eq: u32 = 0x54000080;
    assert_eq!(predict_next_pc(b_eq, &ctx, StepMode::Into), DATA_DEPENDENT);
    // ...and the other successor is recoverable from the immediate
    assert_eq!(branch_target(b_eq, &ctx).unwrap(), PC + 0x10);
}

#[test]
pub fn when_compare_branch_then_register_value_decides() {
    // cbz x5, .+0x10
    let cbz_x5: u32 = 0xB4000085;
    let mut ctx = context();
    assert_eq!(predict_next_pc(cbz_x5, &ctx, StepMode::Into), PC + 0x10);
    ctx.regs.regs[5] = 1;
    assert_eq!(predict_next_pc(cbz_x5, &ctx, StepMode::Into), PC + 4);

    // cbnz x1, .+8
    let cbnz_x1: u32 = 0xB5000041;
    ctx.regs.regs[1] = 0;
    assert_eq!(predict_next_pc(cbnz_x1, &ctx, StepMode::Into), PC + 4);
    ctx.regs.regs[1] = 7;
    assert_eq!(predict_next_pc(cbnz_x1, &ctx, StepMode::Into), PC + 8);
}

#[test]
pub fn when_compare_branch_is_32_bit_then_upper_half_is_ignored() {
    // cbz w0, .+0x10
    let cbz_w0: u32 = 0x34000080;
    let mut ctx = context();
    ctx.regs.regs[0] = 0x1_0000_0000;
    assert_eq!(predict_next_pc(cbz_w0, &ctx, StepMode::Into), PC + 0x10);
    ctx.regs.regs[0] = 0x1_0000_0001;
    assert_eq!(predict_next_pc(cbz_w0, &ctx, StepMode::Into), PC + 4);
}

#[test]
pub fn when_test_branch_then_single_bit_decides() {
    // tbz x3, #33, .+0x20
    let tbz: u32 = 0xB6080103;
    let mut ctx = context();
    assert_eq!(predict_next_pc(tbz, &ctx, StepMode::Into), PC + 0x20);
    ctx.regs.regs[3] = 1 << 33;
    assert_eq!(predict_next_pc(tbz, &ctx, StepMode::Into), PC + 4);

    // tbnz w2, #3, .+8
    let tbnz: u32 = 0x37180042;
    ctx.regs.regs[2] = 0;
    assert_eq!(predict_next_pc(tbnz, &ctx, StepMode::Into), PC + 4);
    ctx.regs.regs[2] = 1 << 3;
    assert_eq!(predict_next_pc(tbnz, &ctx, StepMode::Into), PC + 8);
}

#[test]
pub fn when_indirect_branch_then_register_file_supplies_target() {
    let mut ctx = context();
    ctx.regs.regs[16] = 0x7200000000;
    ctx.regs.regs[8] = 0x7300000000;
    ctx.regs.regs[30] = 0x7100002000;

    // br x16
    assert_eq!(
        predict_next_pc(0xD61F0200, &ctx, StepMode::Into),
        0x7200000000
    );
    assert_eq!(
        predict_next_pc(0xD61F0200, &ctx, StepMode::Over),
        0x7200000000
    );

    // blr x8 descends only under step
    assert_eq!(
        predict_next_pc(0xD63F0100, &ctx, StepMode::Into),
        0x7300000000
    );
    assert_eq!(predict_next_pc(0xD63F0100, &ctx, StepMode::Over), PC + 4);

    // ret
    assert_eq!(
        predict_next_pc(0xD65F03C0, &ctx, StepMode::Into),
        0x7100002000
    );
}

#[test]
pub fn when_instruction_has_no_target_then_branch_target_errors() {
    let ctx = context();
    assert!(branch_target(NOP, &ctx).is_err());
    assert!(branch_target(0x14000008, &ctx).is_ok());
}

#[test]
pub fn when_checking_hw_safety_then_only_state_dependent_branches_flagged() {
    for insn in [NOP, MOV_X0_X1, 0x14000008u32, 0x94000010] {
        assert!(!hw_unsafe(insn));
    }
    for insn in [
        0x54000080u32, // b.eq
        0xB4000085,    // cbz x5
        0xB6080103,    // tbz x3, #33
        0xD61F0200,    // br x16
        0xD63F0100,    // blr x8
        0xD65F03C0,    // ret
    ] {
        assert!(hw_unsafe(insn));
    }
}
