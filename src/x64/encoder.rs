// This module provides the x86-64 CodeEmitter built on the iced-x86 code assembler. X64Emitter
// maps AsmReg references onto iced register operands of the width each instruction needs,
// keeps one CodeLabel per tile-list label id, and emits one instruction sequence per tile
// operation. The generated function follows a fixed frame: the prologue saves rbp and the
// five registers the body keeps pinned (rbx work area, r12 frame, r13 compilation unit, r14
// thread context, r15 reserved), loads them from the entry arguments and the interpreter
// layout, then either falls into the body or jumps to the resume address passed as the third
// argument. rax is the scratch register of every tile. Assembly uses the block encoder with
// new-instruction offsets enabled so label offsets can be reported back to the linker.

//! x86-64 instruction encoding using iced-x86.

use hashbrown::{HashMap, HashSet};
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, Code, IcedError, Instruction, Register};

use super::calling_convention::{CCInfo, CU, FRAME, RSP, TC, WORK};
use crate::core::config::InterpLayout;
use crate::core::error::{JitError, JitResult};
use crate::core::register_file::AsmReg;
use crate::core::spill::RegClass;
use crate::emit::{CodeEmitter, EmittedCode};
use crate::tile::{Cond, Tile, TileOp};

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    InvalidRegister,
    /// Unsupported instruction or operand combination.
    UnsupportedInstruction(String),
    /// Assembly error from iced-x86.
    AssemblyError(String),
    /// Displacement or scale out of range.
    InvalidMemoryOperand,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister => write!(f, "Invalid register for operation"),
            EncodingError::UnsupportedInstruction(what) => {
                write!(f, "Unsupported instruction or operand combination: {what}")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::InvalidMemoryOperand => write!(f, "Invalid memory operand"),
        }
    }
}

impl std::error::Error for EncodingError {}

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];
const GP32_REGS: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];
const GP16_REGS: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];
const GP8_REGS: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];
const XMM_REGS: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14,
    xmm15,
];

fn gp64(reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }
    GP64_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn gp32(reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }
    GP32_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn gp16(reg: AsmReg) -> Result<AsmRegister16, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }
    GP16_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn gp8(reg: AsmReg) -> Result<AsmRegister8, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }
    GP8_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn xmm(reg: AsmReg) -> Result<AsmRegisterXmm, EncodingError> {
    if reg.bank != 1 {
        return Err(EncodingError::InvalidRegister);
    }
    XMM_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn disp(value: i64) -> Result<i32, EncodingError> {
    i32::try_from(value).map_err(|_| EncodingError::InvalidMemoryOperand)
}

fn scale(value: i64) -> Result<u32, EncodingError> {
    match value {
        1 | 2 | 4 | 8 => Ok(value as u32),
        _ => Err(EncodingError::InvalidMemoryOperand),
    }
}

fn value_reg(tile: &Tile, index: usize) -> Result<AsmReg, EncodingError> {
    tile.values
        .get(index)
        .and_then(|v| v.reg)
        .ok_or(EncodingError::InvalidRegister)
}

fn result_reg(tile: &Tile) -> Result<(AsmReg, RegClass), EncodingError> {
    tile.result
        .and_then(|r| r.reg.map(|reg| (reg, r.class)))
        .ok_or(EncodingError::InvalidRegister)
}

fn arg(tile: &Tile, index: usize) -> Result<i64, EncodingError> {
    tile.args.get(index).copied().ok_or_else(|| {
        EncodingError::UnsupportedInstruction(format!("{} is missing argument {}", tile.op, index))
    })
}

fn bad_size(tile: &Tile, size: i64) -> EncodingError {
    EncodingError::UnsupportedInstruction(format!("{} of size {}", tile.op, size))
}

/// x86-64 code emitter.
pub struct X64Emitter {
    asm: CodeAssembler,
    cc: &'static CCInfo,
    layout: InterpLayout,
    labels: HashMap<u32, CodeLabel>,
    placed: HashSet<u32>,
    referenced: HashSet<u32>,
    /// First instruction of the body.
    start: CodeLabel,
}

impl X64Emitter {
    pub fn new(cc: &'static CCInfo, layout: InterpLayout) -> Result<Self, EncodingError> {
        let mut asm = CodeAssembler::new(64).map_err(asm_err)?;
        let start = asm.create_label();
        Ok(Self {
            asm,
            cc,
            layout,
            labels: HashMap::new(),
            placed: HashSet::new(),
            referenced: HashSet::new(),
            start,
        })
    }

    fn label(&mut self, id: u32) -> CodeLabel {
        if let Some(&label) = self.labels.get(&id) {
            return label;
        }
        let label = self.asm.create_label();
        self.labels.insert(id, label);
        label
    }

    fn target(&mut self, tile: &Tile) -> Result<CodeLabel, EncodingError> {
        let id = tile
            .label
            .ok_or_else(|| EncodingError::UnsupportedInstruction(format!("{} without a label", tile.op)))?;
        self.referenced.insert(id);
        Ok(self.label(id))
    }

    fn mov_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        if dst != src {
            self.asm.mov(gp64(dst)?, gp64(src)?).map_err(asm_err)?;
        }
        Ok(())
    }

    fn mov_imm(&mut self, dst: AsmRegister64, value: i64) -> Result<(), EncodingError> {
        match i32::try_from(value) {
            Ok(small) => Instruction::with2(Code::Mov_rm64_imm32, Register::from(dst), small)
                .and_then(|instr| self.asm.add_instruction(instr)),
            Err(_) => self.asm.mov(dst, value),
        }
        .map_err(asm_err)
    }

    fn copy(&mut self, dst: AsmReg, src: AsmReg, class: RegClass) -> Result<(), EncodingError> {
        match class {
            RegClass::Num if dst != src => self.asm.movapd(xmm(dst)?, xmm(src)?).map_err(asm_err),
            RegClass::Num => Ok(()),
            _ => self.mov_rr(dst, src),
        }
    }

    /// Zero-extending load of `size` bytes.
    fn load_sized(&mut self, tile: &Tile, dst: AsmReg, mem: AsmMemoryOperand, size: i64) -> Result<(), EncodingError> {
        match size {
            1 => self.asm.movzx(gp32(dst)?, byte_ptr(mem)),
            2 => self.asm.movzx(gp32(dst)?, word_ptr(mem)),
            4 => self.asm.mov(gp32(dst)?, dword_ptr(mem)),
            8 => self.asm.mov(gp64(dst)?, qword_ptr(mem)),
            _ => return Err(bad_size(tile, size)),
        }
        .map_err(asm_err)
    }

    fn store_sized(&mut self, tile: &Tile, mem: AsmMemoryOperand, src: AsmReg, size: i64) -> Result<(), EncodingError> {
        match size {
            1 => self.asm.mov(byte_ptr(mem), gp8(src)?),
            2 => self.asm.mov(word_ptr(mem), gp16(src)?),
            4 => self.asm.mov(dword_ptr(mem), gp32(src)?),
            8 => self.asm.mov(qword_ptr(mem), gp64(src)?),
            _ => return Err(bad_size(tile, size)),
        }
        .map_err(asm_err)
    }

    fn test_sized(&mut self, tile: &Tile, mem: AsmMemoryOperand, size: i64) -> Result<(), EncodingError> {
        match size {
            1 => self.asm.cmp(byte_ptr(mem), 0),
            2 => self.asm.cmp(word_ptr(mem), 0),
            4 => self.asm.cmp(dword_ptr(mem), 0),
            8 => self.asm.cmp(qword_ptr(mem), 0),
            _ => return Err(bad_size(tile, size)),
        }
        .map_err(asm_err)
    }

    fn binary(&mut self, tile: &Tile, dst: AsmRegister64, src: AsmRegister64) -> Result<(), EncodingError> {
        match tile.op {
            TileOp::Add | TileOp::AddConst => self.asm.add(dst, src),
            TileOp::Sub | TileOp::SubConst => self.asm.sub(dst, src),
            TileOp::Mul | TileOp::MulConst => self.asm.imul_2(dst, src),
            TileOp::And | TileOp::AndConst => self.asm.and(dst, src),
            TileOp::Or | TileOp::OrConst => self.asm.or(dst, src),
            TileOp::Xor | TileOp::XorConst => self.asm.xor(dst, src),
            _ => return Err(EncodingError::UnsupportedInstruction(tile.op.name().into())),
        }
        .map_err(asm_err)
    }

    fn binary_imm(&mut self, tile: &Tile, dst: AsmRegister64, imm: i32) -> Result<(), EncodingError> {
        match tile.op {
            TileOp::AddConst => self.asm.add(dst, imm),
            TileOp::SubConst => self.asm.sub(dst, imm),
            TileOp::MulConst => self.asm.imul_3(dst, dst, imm),
            TileOp::AndConst => self.asm.and(dst, imm),
            TileOp::OrConst => self.asm.or(dst, imm),
            TileOp::XorConst => self.asm.xor(dst, imm),
            _ => return Err(EncodingError::UnsupportedInstruction(tile.op.name().into())),
        }
        .map_err(asm_err)
    }

    fn jcc(&mut self, cond: Cond, label: CodeLabel) -> Result<(), EncodingError> {
        match cond {
            Cond::Lt => self.asm.jl(label),
            Cond::Le => self.asm.jle(label),
            Cond::Eq | Cond::Zr => self.asm.je(label),
            Cond::Ne | Cond::Nz => self.asm.jne(label),
            Cond::Ge => self.asm.jge(label),
            Cond::Gt => self.asm.jg(label),
        }
        .map_err(asm_err)
    }

    fn setcc(&mut self, cond: Cond, dst: AsmRegister8) -> Result<(), EncodingError> {
        match cond {
            Cond::Lt => self.asm.setl(dst),
            Cond::Le => self.asm.setle(dst),
            Cond::Eq | Cond::Zr => self.asm.sete(dst),
            Cond::Ne | Cond::Nz => self.asm.setne(dst),
            Cond::Ge => self.asm.setge(dst),
            Cond::Gt => self.asm.setg(dst),
        }
        .map_err(asm_err)
    }

    fn place(&mut self, id: u32) -> Result<(), EncodingError> {
        if !self.placed.insert(id) {
            return Err(EncodingError::AssemblyError(format!("label {} placed twice", id)));
        }
        let mut label = self.label(id);
        self.asm.set_label(&mut label).map_err(asm_err)?;
        // CodeLabel is Copy; keep the copy that now carries the instruction index.
        self.labels.insert(id, label);
        self.asm.zero_bytes().map_err(asm_err)
    }

    fn encode(&mut self, tile: &Tile) -> Result<(), EncodingError> {
        let work = gp64(WORK)?;
        match tile.op {
            TileOp::Tc => self.mov_rr(result_reg(tile)?.0, TC)?,
            TileOp::Cu => self.mov_rr(result_reg(tile)?.0, CU)?,
            TileOp::Frame => self.mov_rr(result_reg(tile)?.0, FRAME)?,
            TileOp::Local => self.mov_rr(result_reg(tile)?.0, WORK)?,
            TileOp::Stack => self.mov_rr(result_reg(tile)?.0, RSP)?,
            TileOp::Const | TileOp::ConstLarge | TileOp::ConstPtr => {
                self.mov_imm(gp64(result_reg(tile)?.0)?, arg(tile, 0)?)?
            }
            TileOp::ConstNum => {
                self.asm.mov(rax, arg(tile, 0)?).map_err(asm_err)?;
                self.asm.movq(xmm(result_reg(tile)?.0)?, rax).map_err(asm_err)?;
            }
            TileOp::LabelAddr => {
                let label = self.target(tile)?;
                self.asm.lea(gp64(result_reg(tile)?.0)?, ptr(label)).map_err(asm_err)?;
            }
            TileOp::LoadReg => {
                let addr = gp64(value_reg(tile, 0)?)?;
                self.load_sized(tile, result_reg(tile)?.0, addr + 0, arg(tile, 0)?)?;
            }
            TileOp::LoadAddr => {
                let base = gp64(value_reg(tile, 0)?)?;
                let mem = base + disp(arg(tile, 0)?)?;
                self.load_sized(tile, result_reg(tile)?.0, mem, arg(tile, 1)?)?;
            }
            TileOp::LoadIdx => {
                let base = gp64(value_reg(tile, 0)?)?;
                let index = gp64(value_reg(tile, 1)?)?;
                let mem = base + index * scale(arg(tile, 0)?)?;
                self.load_sized(tile, result_reg(tile)?.0, mem, arg(tile, 1)?)?;
            }
            TileOp::LoadLocal => {
                let mem = work + disp(arg(tile, 0)?)?;
                self.load_sized(tile, result_reg(tile)?.0, mem, arg(tile, 1)?)?;
            }
            TileOp::LoadNum => {
                let base = gp64(value_reg(tile, 0)?)?;
                let offset = disp(tile.args.first().copied().unwrap_or(0))?;
                let dst = xmm(result_reg(tile)?.0)?;
                self.asm.movsd_2(dst, qword_ptr(base + offset)).map_err(asm_err)?;
            }
            TileOp::Store => {
                let addr = gp64(value_reg(tile, 0)?)?;
                self.store_sized(tile, addr + 0, value_reg(tile, 1)?, arg(tile, 0)?)?;
            }
            TileOp::StoreAddr => {
                let base = gp64(value_reg(tile, 0)?)?;
                let mem = base + disp(arg(tile, 0)?)?;
                self.store_sized(tile, mem, value_reg(tile, 1)?, arg(tile, 1)?)?;
            }
            TileOp::StoreIdx => {
                let base = gp64(value_reg(tile, 0)?)?;
                let index = gp64(value_reg(tile, 1)?)?;
                let mem = base + index * scale(arg(tile, 0)?)?;
                self.store_sized(tile, mem, value_reg(tile, 2)?, arg(tile, 1)?)?;
            }
            TileOp::StoreLocal => {
                let mem = work + disp(arg(tile, 0)?)?;
                self.store_sized(tile, mem, value_reg(tile, 0)?, arg(tile, 1)?)?;
            }
            TileOp::StoreNum => {
                let base = gp64(value_reg(tile, 0)?)?;
                let offset = disp(tile.args.first().copied().unwrap_or(0))?;
                let src = xmm(value_reg(tile, 1)?)?;
                self.asm.movsd_2(qword_ptr(base + offset), src).map_err(asm_err)?;
            }
            TileOp::Addr => {
                let base = gp64(value_reg(tile, 0)?)?;
                let mem = base + disp(arg(tile, 0)?)?;
                self.asm.lea(gp64(result_reg(tile)?.0)?, ptr(mem)).map_err(asm_err)?;
            }
            TileOp::Idx => {
                let base = gp64(value_reg(tile, 0)?)?;
                let index = gp64(value_reg(tile, 1)?)?;
                let mem = base + index * scale(arg(tile, 0)?)?;
                self.asm.lea(gp64(result_reg(tile)?.0)?, ptr(mem)).map_err(asm_err)?;
            }
            TileOp::Add | TileOp::Sub | TileOp::Mul | TileOp::And | TileOp::Or | TileOp::Xor => {
                let dst = result_reg(tile)?.0;
                self.mov_rr(dst, value_reg(tile, 0)?)?;
                self.binary(tile, gp64(dst)?, gp64(value_reg(tile, 1)?)?)?;
            }
            TileOp::AddConst
            | TileOp::SubConst
            | TileOp::MulConst
            | TileOp::AndConst
            | TileOp::OrConst
            | TileOp::XorConst => {
                let dst = result_reg(tile)?.0;
                self.mov_rr(dst, value_reg(tile, 0)?)?;
                let value = arg(tile, 0)?;
                match i32::try_from(value) {
                    Ok(imm) => self.binary_imm(tile, gp64(dst)?, imm)?,
                    Err(_) => {
                        self.asm.mov(rax, value).map_err(asm_err)?;
                        self.binary(tile, gp64(dst)?, rax)?;
                    }
                }
            }
            TileOp::Not => {
                let dst = result_reg(tile)?.0;
                self.mov_rr(dst, value_reg(tile, 0)?)?;
                self.asm.not(gp64(dst)?).map_err(asm_err)?;
            }
            TileOp::Copy | TileOp::Join => {
                let (dst, class) = result_reg(tile)?;
                self.copy(dst, value_reg(tile, 0)?, class)?;
            }
            TileOp::Scast => {
                let dst = gp64(result_reg(tile)?.0)?;
                let src = value_reg(tile, 0)?;
                match arg(tile, 1)? {
                    1 => self.asm.movsx(dst, gp8(src)?),
                    2 => self.asm.movsx(dst, gp16(src)?),
                    4 => self.asm.movsxd(dst, gp32(src)?),
                    8 => self.asm.mov(dst, gp64(src)?),
                    size => return Err(bad_size(tile, size)),
                }
                .map_err(asm_err)?;
            }
            TileOp::Ucast => {
                let dst = result_reg(tile)?.0;
                let src = value_reg(tile, 0)?;
                match arg(tile, 1)? {
                    1 => self.asm.movzx(gp32(dst)?, gp8(src)?),
                    2 => self.asm.movzx(gp32(dst)?, gp16(src)?),
                    4 => self.asm.mov(gp32(dst)?, gp32(src)?),
                    8 => self.asm.mov(gp64(dst)?, gp64(src)?),
                    size => return Err(bad_size(tile, size)),
                }
                .map_err(asm_err)?;
            }
            TileOp::Cmp => {
                let (lhs, rhs) = (value_reg(tile, 0)?, value_reg(tile, 1)?);
                match tile.args.first().copied().unwrap_or(8) {
                    1 => self.asm.cmp(gp8(lhs)?, gp8(rhs)?),
                    2 => self.asm.cmp(gp16(lhs)?, gp16(rhs)?),
                    4 => self.asm.cmp(gp32(lhs)?, gp32(rhs)?),
                    8 => self.asm.cmp(gp64(lhs)?, gp64(rhs)?),
                    size => return Err(bad_size(tile, size)),
                }
                .map_err(asm_err)?;
            }
            TileOp::CmpConst => {
                let lhs = value_reg(tile, 0)?;
                let value = arg(tile, 0)?;
                match tile.args.get(1).copied().unwrap_or(8) {
                    1 => self.asm.cmp(gp8(lhs)?, value as i8 as i32),
                    2 => self.asm.cmp(gp16(lhs)?, value as i16 as i32),
                    4 => self.asm.cmp(gp32(lhs)?, value as i32),
                    8 => match i32::try_from(value) {
                        Ok(imm) => self.asm.cmp(gp64(lhs)?, imm),
                        Err(_) => {
                            self.asm.mov(rax, value).map_err(asm_err)?;
                            self.asm.cmp(gp64(lhs)?, rax)
                        }
                    },
                    size => return Err(bad_size(tile, size)),
                }
                .map_err(asm_err)?;
            }
            TileOp::Nz | TileOp::Zr => {
                let value = gp64(value_reg(tile, 0)?)?;
                self.asm.test(value, value).map_err(asm_err)?;
            }
            TileOp::NzAnd => {
                let lhs = gp64(value_reg(tile, 0)?)?;
                self.asm.test(lhs, gp64(value_reg(tile, 1)?)?).map_err(asm_err)?;
            }
            TileOp::TestAddr => {
                let base = gp64(value_reg(tile, 0)?)?;
                let mem = base + disp(arg(tile, 0)?)?;
                self.test_sized(tile, mem, arg(tile, 1)?)?;
            }
            TileOp::Flagval => {
                let cond = tile
                    .cond
                    .ok_or_else(|| EncodingError::UnsupportedInstruction("flagval without condition".into()))?;
                self.setcc(cond, al)?;
                self.asm.movzx(gp32(result_reg(tile)?.0)?, al).map_err(asm_err)?;
            }
            TileOp::Branch | TileOp::Jump => {
                let label = self.target(tile)?;
                self.asm.jmp(label).map_err(asm_err)?;
            }
            TileOp::CondJump => {
                let cond = tile
                    .cond
                    .ok_or_else(|| EncodingError::UnsupportedInstruction("conditional jump without condition".into()))?;
                let label = self.target(tile)?;
                self.jcc(cond, label)?;
            }
            TileOp::Label | TileOp::Mark | TileOp::Guard => {
                let id = tile
                    .label
                    .ok_or_else(|| EncodingError::UnsupportedInstruction(format!("{} without a label", tile.op)))?;
                self.place(id)?;
            }
            TileOp::Discard => {}
            TileOp::Spill => {
                let mem = work + disp(arg(tile, 0)?)?;
                let src = tile.values.first().ok_or(EncodingError::InvalidRegister)?;
                let reg = src.reg.ok_or(EncodingError::InvalidRegister)?;
                match src.class {
                    RegClass::Num => self.asm.movsd_2(qword_ptr(mem), xmm(reg)?),
                    _ => self.asm.mov(qword_ptr(mem), gp64(reg)?),
                }
                .map_err(asm_err)?;
            }
            TileOp::Reload => {
                let mem = work + disp(arg(tile, 0)?)?;
                let (reg, class) = result_reg(tile)?;
                match class {
                    RegClass::Num => self.asm.movsd_2(xmm(reg)?, qword_ptr(mem)),
                    _ => self.asm.mov(gp64(reg)?, qword_ptr(mem)),
                }
                .map_err(asm_err)?;
            }
            TileOp::StackArg => {
                self.asm.mov(rax, qword_ptr(work + disp(arg(tile, 0)?)?)).map_err(asm_err)?;
                self.asm.mov(qword_ptr(rsp + disp(arg(tile, 1)?)?), rax).map_err(asm_err)?;
            }
            TileOp::Call | TileOp::CallVoid => self.call(tile)?,
        }
        Ok(())
    }

    fn call(&mut self, tile: &Tile) -> Result<(), EncodingError> {
        let indirect = tile.values.len() > tile.num_call_args;
        if indirect {
            let slot = tile.values[0].slot.ok_or(EncodingError::InvalidMemoryOperand)?;
            self.asm.mov(rax, qword_ptr(gp64(WORK)? + slot)).map_err(asm_err)?;
        } else {
            self.asm.mov(rax, arg(tile, 0)?).map_err(asm_err)?;
        }
        self.asm.call(rax).map_err(asm_err)?;
        if let Some(result) = tile.result {
            let reg = result.reg.ok_or(EncodingError::InvalidRegister)?;
            match result.class {
                RegClass::Num => self.copy(reg, self.cc.fp_return, RegClass::Num)?,
                _ => self.mov_rr(reg, self.cc.int_return)?,
            }
        }
        Ok(())
    }
}

impl CodeEmitter for X64Emitter {
    fn emit_prologue(&mut self) -> JitResult<()> {
        let [tc_arg, cu_arg, resume_arg] = self.cc.entry_args;
        let asm = &mut self.asm;
        asm.push(rbp).map_err(asm_err)?;
        asm.mov(rbp, rsp).map_err(asm_err)?;
        for reg in [rbx, r12, r13, r14, r15] {
            asm.push(reg).map_err(asm_err)?;
        }
        asm.sub(rsp, self.cc.frame_reserve).map_err(asm_err)?;
        asm.mov(r14, gp64(tc_arg)?).map_err(asm_err)?;
        asm.mov(r13, gp64(cu_arg)?).map_err(asm_err)?;
        asm.mov(r12, qword_ptr(r14 + self.layout.tc_cur_frame)).map_err(asm_err)?;
        asm.mov(rbx, qword_ptr(r12 + self.layout.frame_work)).map_err(asm_err)?;
        let resume = gp64(resume_arg)?;
        asm.test(resume, resume).map_err(asm_err)?;
        asm.je(self.start).map_err(asm_err)?;
        asm.jmp(resume).map_err(asm_err)?;
        asm.set_label(&mut self.start).map_err(asm_err)?;
        asm.zero_bytes().map_err(asm_err)?;
        Ok(())
    }

    fn emit_epilogue(&mut self) -> JitResult<()> {
        let asm = &mut self.asm;
        asm.lea(rsp, ptr(rbp - 40)).map_err(asm_err)?;
        for reg in [r15, r14, r13, r12, rbx] {
            asm.pop(reg).map_err(asm_err)?;
        }
        asm.pop(rbp).map_err(asm_err)?;
        asm.ret().map_err(asm_err)?;
        Ok(())
    }

    fn emit_tile(&mut self, tile: &Tile) -> JitResult<()> {
        log::trace!("encode {}", tile);
        Ok(self.encode(tile)?)
    }

    fn emit_label(&mut self, label: u32) -> JitResult<()> {
        Ok(self.place(label)?)
    }

    fn emit_call(&mut self, tile: &Tile) -> JitResult<()> {
        Ok(self.call(tile)?)
    }

    fn finish(&mut self, num_labels: u32) -> JitResult<EmittedCode> {
        let mut unplaced: Vec<_> = self.referenced.difference(&self.placed).copied().collect();
        if !unplaced.is_empty() {
            unplaced.sort_unstable();
            return Err(JitError::link(format!("labels {:?} are jumped to but never placed", unplaced)));
        }
        let result = self
            .asm
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(asm_err)?;
        let mut labels = vec![None; num_labels as usize];
        for (&id, label) in &self.labels {
            if !self.placed.contains(&id) {
                continue;
            }
            let offset = result.label_ip(label).map_err(asm_err)?;
            let slot = labels
                .get_mut(id as usize)
                .ok_or_else(|| JitError::link(format!("label {} beyond label count {}", id, num_labels)))?;
            *slot = Some(offset as u32);
        }
        Ok(EmittedCode {
            bytes: result.inner.code_buffer,
            labels,
        })
    }
}
