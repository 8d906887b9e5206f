// This module describes the two x86-64 calling conventions generated code runs under: System V
// (Linux, macOS, BSDs) and Win64. It supplies CCInfo with the registers the allocator may hand
// out, the three registers carrying the entry arguments (thread context, compilation unit,
// resume label) and the fixed frame reserve below the saved registers, plus a CCAssigner per
// convention that places outgoing C call arguments. System V passes 6 integer and 8 float
// arguments in separate register sequences; Win64 passes 4 positional arguments where integer
// and float arguments share positions, and stack arguments start above the 32-byte shadow space.
// Every allocatable register is caller-saved under its convention, so a call clobbers them all.
// Generated code needs at most four outgoing stack slots, which the frame reserve accounts for.

//! x86-64 calling conventions.

use crate::core::register_file::AsmReg;
use crate::core::spill::RegClass;

pub const RAX: AsmReg = AsmReg::gp(0);
pub const RCX: AsmReg = AsmReg::gp(1);
pub const RDX: AsmReg = AsmReg::gp(2);
pub const RBX: AsmReg = AsmReg::gp(3);
pub const RSP: AsmReg = AsmReg::gp(4);
pub const RBP: AsmReg = AsmReg::gp(5);
pub const RSI: AsmReg = AsmReg::gp(6);
pub const RDI: AsmReg = AsmReg::gp(7);
pub const R8: AsmReg = AsmReg::gp(8);
pub const R9: AsmReg = AsmReg::gp(9);
pub const R10: AsmReg = AsmReg::gp(10);
pub const R11: AsmReg = AsmReg::gp(11);
pub const R12: AsmReg = AsmReg::gp(12);
pub const R13: AsmReg = AsmReg::gp(13);
pub const R14: AsmReg = AsmReg::gp(14);
pub const R15: AsmReg = AsmReg::gp(15);

/// Scratch register owned by individual tiles.
pub const SCRATCH: AsmReg = RAX;
/// Base of the interpreter work area (locals, then spill memory).
pub const WORK: AsmReg = RBX;
pub const FRAME: AsmReg = R12;
pub const CU: AsmReg = R13;
pub const TC: AsmReg = R14;

/// Registers pushed by the prologue after `rbp`, in push order.
pub const SAVED_REGS: [AsmReg; 5] = [RBX, R12, R13, R14, R15];

/// Outgoing stack argument slots available to a call.
pub const MAX_STACK_ARGS: usize = 4;

const fn xmm_regs<const N: usize>() -> [AsmReg; N] {
    let mut regs = [AsmReg::xmm(0); N];
    let mut i = 0;
    while i < N {
        regs[i] = AsmReg::xmm(i as u8);
        i += 1;
    }
    regs
}

/// Static facts about a calling convention.
#[derive(Debug, Clone, Copy)]
pub struct CCInfo {
    pub name: &'static str,
    pub allocatable_gp: &'static [AsmReg],
    pub allocatable_fp: &'static [AsmReg],
    /// Thread context, compilation unit and resume label, in order.
    pub entry_args: [AsmReg; 3],
    /// Bytes reserved below the saved registers for outgoing arguments.
    pub frame_reserve: i32,
    pub int_return: AsmReg,
    pub fp_return: AsmReg,
}

/// Where one outgoing argument goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCAssignment {
    pub class: RegClass,
    pub reg: Option<AsmReg>,
    /// Offset from `rsp` at the call.
    pub stack_off: Option<i32>,
}

impl CCAssignment {
    pub fn new(class: RegClass) -> Self {
        Self {
            class,
            reg: None,
            stack_off: None,
        }
    }
}

/// Places outgoing call arguments, one call at a time.
pub trait CCAssigner {
    fn get_ccinfo(&self) -> &CCInfo;

    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Start a new call.
    fn reset(&mut self);

    /// Number of stack slots used by the current call.
    fn stack_args(&self) -> usize;
}

const SYSV_GP_ARGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const SYSV_FP_ARGS: [AsmReg; 8] = xmm_regs::<8>();
const SYSV_ALLOCATABLE_GP: [AsmReg; 8] = [RCX, RDX, RSI, RDI, R8, R9, R10, R11];
const SYSV_ALLOCATABLE_FP: [AsmReg; 8] = xmm_regs::<8>();

pub const SYSV_INFO: CCInfo = CCInfo {
    name: "sysv",
    allocatable_gp: &SYSV_ALLOCATABLE_GP,
    allocatable_fp: &SYSV_ALLOCATABLE_FP,
    entry_args: [RDI, RSI, RDX],
    frame_reserve: 0x28,
    int_return: RAX,
    fp_return: AsmReg::xmm(0),
};

/// System V AMD64 argument placement.
#[derive(Debug, Default)]
pub struct SysVAssigner {
    gp_cnt: usize,
    fp_cnt: usize,
    stack_cnt: usize,
}

impl SysVAssigner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for SysVAssigner {
    fn get_ccinfo(&self) -> &CCInfo {
        &SYSV_INFO
    }

    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        let reg = match arg.class {
            RegClass::Num => SYSV_FP_ARGS.get(self.fp_cnt).inspect(|_| self.fp_cnt += 1),
            _ => SYSV_GP_ARGS.get(self.gp_cnt).inspect(|_| self.gp_cnt += 1),
        };
        match reg {
            Some(&reg) => arg.reg = Some(reg),
            None => {
                arg.stack_off = Some(8 * self.stack_cnt as i32);
                self.stack_cnt += 1;
            }
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn stack_args(&self) -> usize {
        self.stack_cnt
    }
}

const WIN64_GP_ARGS: [AsmReg; 4] = [RCX, RDX, R8, R9];
const WIN64_FP_ARGS: [AsmReg; 4] = xmm_regs::<4>();
const WIN64_ALLOCATABLE_GP: [AsmReg; 6] = [RCX, RDX, R8, R9, R10, R11];
const WIN64_ALLOCATABLE_FP: [AsmReg; 6] = xmm_regs::<6>();
const WIN64_SHADOW_SPACE: i32 = 32;

pub const WIN64_INFO: CCInfo = CCInfo {
    name: "win64",
    allocatable_gp: &WIN64_ALLOCATABLE_GP,
    allocatable_fp: &WIN64_ALLOCATABLE_FP,
    entry_args: [RCX, RDX, R8],
    frame_reserve: 0x48,
    int_return: RAX,
    fp_return: AsmReg::xmm(0),
};

/// Microsoft x64 argument placement.
#[derive(Debug, Default)]
pub struct Win64Assigner {
    position: usize,
    stack_cnt: usize,
}

impl Win64Assigner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for Win64Assigner {
    fn get_ccinfo(&self) -> &CCInfo {
        &WIN64_INFO
    }

    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        if self.position < WIN64_GP_ARGS.len() {
            arg.reg = Some(match arg.class {
                RegClass::Num => WIN64_FP_ARGS[self.position],
                _ => WIN64_GP_ARGS[self.position],
            });
        } else {
            arg.stack_off = Some(WIN64_SHADOW_SPACE + 8 * self.stack_cnt as i32);
            self.stack_cnt += 1;
        }
        self.position += 1;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn stack_args(&self) -> usize {
        self.stack_cnt
    }
}

/// Calling convention of a compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    SysV,
    Win64,
}

impl CallConv {
    /// The convention of the platform this crate is built for.
    pub fn host() -> Self {
        if cfg!(windows) {
            CallConv::Win64
        } else {
            CallConv::SysV
        }
    }

    pub fn info(self) -> &'static CCInfo {
        match self {
            CallConv::SysV => &SYSV_INFO,
            CallConv::Win64 => &WIN64_INFO,
        }
    }

    pub fn assigner(self) -> Box<dyn CCAssigner> {
        match self {
            CallConv::SysV => Box::new(SysVAssigner::new()),
            CallConv::Win64 => Box::new(Win64Assigner::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(assigner: &mut dyn CCAssigner, classes: &[RegClass]) -> Vec<CCAssignment> {
        assigner.reset();
        classes
            .iter()
            .map(|&class| {
                let mut arg = CCAssignment::new(class);
                assigner.assign_arg(&mut arg);
                arg
            })
            .collect()
    }

    #[test]
    fn test_sysv_separate_sequences() {
        let mut assigner = SysVAssigner::new();
        let args = place(
            &mut assigner,
            &[RegClass::Ptr, RegClass::Num, RegClass::Int, RegClass::Num],
        );
        assert_eq!(args[0].reg, Some(RDI));
        assert_eq!(args[1].reg, Some(AsmReg::xmm(0)));
        assert_eq!(args[2].reg, Some(RSI));
        assert_eq!(args[3].reg, Some(AsmReg::xmm(1)));
        assert_eq!(assigner.stack_args(), 0);
    }

    #[test]
    fn test_sysv_stack_overflow() {
        let mut assigner = SysVAssigner::new();
        let args = place(&mut assigner, &[RegClass::Int; 8]);
        assert_eq!(args[5].reg, Some(R9));
        assert_eq!(args[6].stack_off, Some(0));
        assert_eq!(args[7].stack_off, Some(8));
        assert_eq!(assigner.stack_args(), 2);
    }

    #[test]
    fn test_win64_shared_positions() {
        let mut assigner = Win64Assigner::new();
        let args = place(
            &mut assigner,
            &[RegClass::Int, RegClass::Num, RegClass::Int, RegClass::Int, RegClass::Num],
        );
        assert_eq!(args[0].reg, Some(RCX));
        assert_eq!(args[1].reg, Some(AsmReg::xmm(1)));
        assert_eq!(args[2].reg, Some(R8));
        assert_eq!(args[3].reg, Some(R9));
        assert_eq!(args[4].reg, None);
        assert_eq!(args[4].stack_off, Some(32));
    }

    #[test]
    fn test_frame_reserve_keeps_alignment() {
        // return address + rbp + five saved registers, then the reserve
        for info in [&SYSV_INFO, &WIN64_INFO] {
            let depth = 8 + 8 + 8 * SAVED_REGS.len() as i32 + info.frame_reserve;
            assert_eq!(depth % 16, 0, "{}", info.name);
        }
        assert!(SYSV_INFO.frame_reserve >= 8 * MAX_STACK_ARGS as i32);
        assert!(WIN64_INFO.frame_reserve >= WIN64_SHADOW_SPACE + 8 * MAX_STACK_ARGS as i32);
    }

    #[test]
    fn test_reserved_registers_not_allocatable() {
        for info in [&SYSV_INFO, &WIN64_INFO] {
            for reg in [SCRATCH, WORK, FRAME, CU, TC, RSP, RBP] {
                assert!(!info.allocatable_gp.contains(&reg));
            }
        }
    }
}
