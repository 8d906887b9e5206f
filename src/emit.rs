// This module is the seam between the target-independent pipeline and a machine encoder. A
// CodeEmitter receives the finalized, register-allocated tile list one tile at a time between
// a fixed prologue and epilogue, places labels when asked, and finally reports the machine
// bytes together with the offset of every label it placed. emit_function drives an emitter
// over a tile list and performs the link check: every label referenced by a jump, branch or
// label address must have been placed, otherwise the compilation fails with a link error
// instead of producing partially linked code.

//! Target encoder interface.

use hashbrown::HashSet;

use crate::core::error::{JitError, JitResult};
use crate::core::session::CompilationSession;
use crate::tile::{Tile, TileList, TileOp};

/// Machine code produced for one tile list.
#[derive(Debug, Clone, Default)]
pub struct EmittedCode {
    pub bytes: Vec<u8>,
    /// Offset of each label id, if placed.
    pub labels: Vec<Option<u32>>,
}

impl EmittedCode {
    pub fn label_offset(&self, label: u32) -> Option<u32> {
        self.labels.get(label as usize).copied().flatten()
    }
}

/// A pluggable machine-code encoder.
pub trait CodeEmitter {
    fn emit_prologue(&mut self) -> JitResult<()>;

    fn emit_epilogue(&mut self) -> JitResult<()>;

    /// Emit one non-call, non-label tile with its operands already in place.
    fn emit_tile(&mut self, tile: &Tile) -> JitResult<()>;

    fn emit_label(&mut self, label: u32) -> JitResult<()>;

    /// Emit a call whose arguments were already moved into their registers
    /// and stack slots.
    fn emit_call(&mut self, tile: &Tile) -> JitResult<()>;

    /// Assemble everything emitted so far.
    fn finish(&mut self, num_labels: u32) -> JitResult<EmittedCode>;
}

/// Labels a tile jumps to or takes the address of.
fn referenced_label(tile: &Tile) -> Option<u32> {
    match tile.op {
        TileOp::Jump | TileOp::CondJump | TileOp::Branch | TileOp::LabelAddr => tile.label,
        _ => None,
    }
}

fn placed_label(tile: &Tile) -> Option<u32> {
    match tile.op {
        TileOp::Label | TileOp::Mark | TileOp::Guard => tile.label,
        _ => None,
    }
}

/// Drive `emitter` over a finalized tile list and link the result.
pub fn emit_function(
    emitter: &mut dyn CodeEmitter,
    list: &TileList<'_>,
    session: &CompilationSession<'_>,
) -> JitResult<EmittedCode> {
    let mut referenced = HashSet::new();
    emitter.emit_prologue()?;
    for tile in list.iter() {
        if let Some(label) = referenced_label(tile) {
            referenced.insert(label);
        }
        if let Some(label) = placed_label(tile) {
            emitter.emit_label(label)?;
        } else if tile.op.is_call() {
            emitter.emit_call(tile)?;
        } else {
            emitter.emit_tile(tile)?;
        }
        session.record_tile(tile.rule.unwrap_or(tile.op.name()));
    }
    emitter.emit_epilogue()?;

    let code = emitter.finish(list.num_labels)?;
    let mut missing: Vec<_> = referenced
        .into_iter()
        .filter(|&label| code.label_offset(label).is_none())
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(JitError::link(format!("unresolved labels {:?}", missing)));
    }
    if let Some((label, offset)) = code
        .labels
        .iter()
        .enumerate()
        .find_map(|(l, o)| o.filter(|&o| o as usize > code.bytes.len()).map(|o| (l, o)))
    {
        return Err(JitError::link(format!("label {} resolved outside the code at {}", label, offset)));
    }
    log::debug!("emitted {} bytes for {} tiles", code.bytes.len(), list.len());
    Ok(code)
}
