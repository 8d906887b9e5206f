//! DWARF call frame information for generated functions.
//!
//! Every function shares the same prologue, so one CIE plus one FDE with
//! a fixed instruction sequence describes any of them:
//!
//! ```text
//!   +0  push rbp          CFA = rsp+16, rbp at CFA-16
//!   +1  mov rbp, rsp      CFA = rbp+16
//!   +4  push rbx .. r15   rbx, r12..r15 at CFA-24 .. CFA-56
//!   +13
//! ```

const DW_CFA_ADVANCE_LOC: u8 = 0x40;
const DW_CFA_OFFSET: u8 = 0x80;
const DW_CFA_DEF_CFA: u8 = 0x0c;
const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
const DW_CFA_NOP: u8 = 0x00;
const DW_EH_PE_ABSPTR: u8 = 0x00;

const DWARF_RBX: u8 = 3;
const DWARF_RBP: u8 = 6;
const DWARF_RSP: u8 = 7;
const DWARF_RA: u8 = 16;

/// DWARF numbers of the registers pushed after rbp, in push order.
const DWARF_SAVED: [u8; 5] = [DWARF_RBX, 12, 13, 14, 15];

/// Byte length of `push rbp`, `mov rbp, rsp` and the callee-saved pushes.
const PUSH_RBP_LEN: u8 = 1;
const MOV_RBP_LEN: u8 = 3;
const SAVED_PUSHES_LEN: u8 = 1 + 2 * 4;

fn pad_record(buf: &mut Vec<u8>, start: usize) {
    // record length excludes its own 4-byte length field
    while (buf.len() - start) % 8 != 0 {
        buf.push(DW_CFA_NOP);
    }
    let len = (buf.len() - start - 4) as u32;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
}

/// Build an `.eh_frame` section describing one function at
/// `code_start..code_start + code_size`, terminated by a zero entry.
pub fn build_eh_frame(code_start: u64, code_size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(96);

    let cie = buf.len();
    buf.extend_from_slice(&[0; 4]);
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.push(1); // version
    buf.extend_from_slice(b"zR\0");
    buf.push(1); // code alignment
    buf.push(0x78); // data alignment -8
    buf.push(DWARF_RA);
    buf.push(1); // augmentation data length
    buf.push(DW_EH_PE_ABSPTR);
    buf.extend_from_slice(&[DW_CFA_DEF_CFA, DWARF_RSP, 8]);
    buf.extend_from_slice(&[DW_CFA_OFFSET | DWARF_RA, 1]);
    pad_record(&mut buf, cie);

    let fde = buf.len();
    buf.extend_from_slice(&[0; 4]);
    let cie_pointer = (buf.len() - cie) as u32;
    buf.extend_from_slice(&cie_pointer.to_le_bytes());
    buf.extend_from_slice(&code_start.to_le_bytes());
    buf.extend_from_slice(&code_size.to_le_bytes());
    buf.push(0); // augmentation data length
    buf.extend_from_slice(&[DW_CFA_ADVANCE_LOC | PUSH_RBP_LEN, DW_CFA_DEF_CFA_OFFSET, 16]);
    buf.extend_from_slice(&[DW_CFA_OFFSET | DWARF_RBP, 2]);
    buf.extend_from_slice(&[DW_CFA_ADVANCE_LOC | MOV_RBP_LEN, DW_CFA_DEF_CFA_REGISTER, DWARF_RBP]);
    buf.push(DW_CFA_ADVANCE_LOC | SAVED_PUSHES_LEN);
    for (i, reg) in DWARF_SAVED.iter().enumerate() {
        buf.extend_from_slice(&[DW_CFA_OFFSET | reg, 3 + i as u8]);
    }
    pad_record(&mut buf, fde);

    buf.extend_from_slice(&0u32.to_le_bytes());
    buf
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
extern "C" {
    fn __register_frame(begin: *const u8);
    fn __deregister_frame(begin: *const u8);
}

/// Frame information registered with the native unwinder for as long as
/// this value lives.
pub struct UnwindRegistration {
    eh_frame: Box<[u8]>,
}

impl UnwindRegistration {
    /// Register `eh_frame`. Returns `None` on targets without a
    /// `__register_frame` unwinder.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn register(eh_frame: Vec<u8>) -> Option<Self> {
        let eh_frame = eh_frame.into_boxed_slice();
        // SAFETY: the section is well formed, zero terminated and kept alive
        // until the matching deregistration in drop.
        unsafe { __register_frame(eh_frame.as_ptr()) };
        log::debug!("registered unwind info at {:p}", eh_frame.as_ptr());
        Some(Self { eh_frame })
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    pub fn register(eh_frame: Vec<u8>) -> Option<Self> {
        let _ = eh_frame;
        None
    }

    pub fn eh_frame(&self) -> &[u8] {
        &self.eh_frame
    }
}

impl Drop for UnwindRegistration {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn drop(&mut self) {
        // SAFETY: registered in `register` with this exact pointer.
        unsafe { __deregister_frame(self.eh_frame.as_ptr()) };
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn drop(&mut self) {}
}
