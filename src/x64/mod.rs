//! x86-64 target: tile rules, calling conventions, the iced-x86 based
//! encoder and unwind info for generated functions.

pub mod calling_convention;
pub mod encoder;
pub mod tiles;
pub mod unwind;

use crate::core::register_file::AsmReg;

pub use calling_convention::{CCAssigner, CCAssignment, CCInfo, CallConv};
pub use encoder::{EncodingError, X64Emitter};

const GP_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15",
];

const XMM_NAMES: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10", "xmm11",
    "xmm12", "xmm13", "xmm14", "xmm15",
];

/// Assembler name of `reg`.
pub fn reg_name(reg: AsmReg) -> &'static str {
    let names = match reg.bank {
        0 => &GP_NAMES,
        1 => &XMM_NAMES,
        _ => return "?",
    };
    names.get(reg.id as usize).copied().unwrap_or("?")
}
