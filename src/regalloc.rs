// This module runs the register allocator over a built tile list. It walks the list once,
// driving the RegisterFile state machine: operands are reloaded and pinned, the result is
// allocated, pins are released and values die at their last use. Every control tile (label,
// jump, conditional jump, branch, mark, guard) first spills all ALLOCATED registers so each
// control-flow join finds live values in spill memory. Calls spill everything, place each
// argument in its convention register or outgoing stack slot, and start from an empty
// register file afterwards because every allocatable register is caller-saved. The moves the
// register file asks for become Spill, Reload and StackArg tiles spliced in through the tile
// list's deferred inserts.

//! Register allocation over tile lists.

use bumpalo::Bump;
use hashbrown::HashMap;

use crate::core::error::{structural, JitError, JitResult};
use crate::core::register_file::{AsmReg, MoveOp, RegAllocError, RegBitSet, RegisterFile, ValueId};
use crate::core::session::{CompilationSession, CompilerState};
use crate::core::spill::RegClass;
use crate::expr::NodeId;
use crate::tile::{Operand, Tile, TileList, TileOp};
use crate::x64::calling_convention::{CCAssigner, CCAssignment, MAX_STACK_ARGS};

/// What the allocator did to one tile list.
#[derive(Debug, Clone, Default)]
pub struct AllocSummary {
    pub spills: usize,
    pub reloads: usize,
    pub stack_args: usize,
    /// Registers written anywhere in the function.
    pub clobbered: RegBitSet,
}

fn map_err(err: RegAllocError) -> JitError {
    match err {
        RegAllocError::NoRegistersAvailable => JitError::exhausted(err.to_string()),
        _ => structural(err.to_string()),
    }
}

fn value_id(node: NodeId) -> ValueId {
    node.0
}

/// Index of the last tile reading each value. A value live into a loop
/// (defined before a mark that a later branch jumps back to) stays live
/// until that branch.
fn compute_last_uses(tiles: &[Tile]) -> HashMap<ValueId, usize> {
    let mut defs: HashMap<ValueId, usize> = HashMap::new();
    let mut last: HashMap<ValueId, usize> = HashMap::new();
    let mut marks: HashMap<u32, usize> = HashMap::new();
    let mut loops = Vec::new();

    for (i, tile) in tiles.iter().enumerate() {
        for value in &tile.values {
            last.insert(value_id(value.node), i);
        }
        if let Some(result) = &tile.result {
            defs.entry(value_id(result.node)).or_insert(i);
        }
        match (tile.op, tile.label) {
            (TileOp::Mark | TileOp::Label | TileOp::Guard, Some(label)) => {
                marks.insert(label, i);
            }
            (TileOp::Branch | TileOp::Jump | TileOp::CondJump, Some(label)) => {
                if let Some(&head) = marks.get(&label) {
                    loops.push((head, i));
                }
            }
            _ => {}
        }
    }

    let mut changed = !loops.is_empty();
    while changed {
        changed = false;
        for &(head, back) in &loops {
            for (value, end) in last.iter_mut() {
                let def = defs.get(value).copied().unwrap_or(0);
                if def < head && *end >= head && *end < back {
                    *end = back;
                    changed = true;
                }
            }
        }
    }
    last
}

struct Allocator<'c, 's> {
    regs: RegisterFile,
    assigner: &'c mut dyn CCAssigner,
    state: &'s mut CompilerState,
    last_use: HashMap<ValueId, usize>,
    order: u32,
    summary: AllocSummary,
}

impl Allocator<'_, '_> {
    /// Turn the register file's queued moves into tiles placed before `position`.
    fn flush_moves<'arena>(&mut self, list: &mut TileList<'arena>, position: usize) {
        for mv in self.regs.take_moves() {
            let tile = match mv {
                MoveOp::Spill { reg, slot, class } => {
                    self.summary.spills += 1;
                    let mut tile = Tile::new(TileOp::Spill);
                    tile.args.push(self.state.spill.offset(slot) as i64);
                    tile.values.push(Operand::in_reg(NodeId(u32::MAX), class, reg));
                    tile
                }
                MoveOp::Reload { reg, slot, class } => {
                    self.summary.reloads += 1;
                    let mut tile = Tile::new(TileOp::Reload);
                    tile.args.push(self.state.spill.offset(slot) as i64);
                    tile.result = Some(Operand::in_reg(NodeId(u32::MAX), class, reg));
                    tile
                }
            };
            self.insert(list, position, tile);
        }
    }

    fn insert(&mut self, list: &mut TileList<'_>, position: usize, tile: Tile) {
        list.insert(position, self.order, tile);
        self.order += 1;
    }

    fn slot_offset(&self, value: ValueId) -> JitResult<i32> {
        let slot = self
            .regs
            .value(value)
            .and_then(|loc| loc.slot)
            .ok_or_else(|| structural(format!("value {} is not in spill memory", value)))?;
        Ok(self.state.spill.offset(slot))
    }

    fn read_operands(&mut self, tile: &mut Tile) -> JitResult<Vec<AsmReg>> {
        let mut pinned = Vec::with_capacity(tile.values.len());
        for operand in tile.values.iter_mut() {
            let value = value_id(operand.node);
            let reg = self.regs.reload(&mut self.state.spill, value).map_err(map_err)?;
            self.regs.pin(reg).map_err(map_err)?;
            operand.reg = Some(reg);
            pinned.push(reg);
        }
        Ok(pinned)
    }

    fn define_result(&mut self, tile: &mut Tile) -> JitResult<Option<AsmReg>> {
        let Some(result) = tile.result.as_mut() else {
            return Ok(None);
        };
        let value = value_id(result.node);
        self.regs.define(value, result.class);
        let reg = self.regs.alloc(&mut self.state.spill, value).map_err(map_err)?;
        result.reg = Some(reg);
        Ok(Some(reg))
    }

    /// Drop values whose last reader is tile `index`.
    fn retire(&mut self, tile: &Tile, index: usize) {
        let dead = tile
            .values
            .iter()
            .map(|v| value_id(v.node))
            .chain(tile.result.iter().map(|r| value_id(r.node)))
            .filter(|v| self.last_use.get(v).map_or(true, |&last| last <= index));
        let dead: Vec<_> = dead.collect();
        for value in dead {
            if self.regs.value(value).is_some() {
                log::trace!("value {} dies at tile {}", value, index);
                self.regs.kill(&mut self.state.spill, value);
            }
        }
    }

    fn allocate_plain(&mut self, list: &mut TileList<'_>, index: usize) -> JitResult<()> {
        let mut tile = list.items[index].clone();
        let pinned = self.read_operands(&mut tile)?;
        let result = self.define_result(&mut tile)?;
        self.flush_moves(list, index);
        for reg in pinned.into_iter().chain(result) {
            self.regs.release(reg);
        }
        self.retire(&tile, index);
        list.items[index] = tile;
        Ok(())
    }

    fn allocate_call(&mut self, list: &mut TileList<'_>, index: usize) -> JitResult<()> {
        let mut tile = list.items[index].clone();
        self.regs.invalidate(&mut self.state.spill).map_err(map_err)?;
        self.flush_moves(list, index);

        let first_arg = tile.values.len() - tile.num_call_args;
        if first_arg > 0 {
            let func = value_id(tile.values[0].node);
            tile.values[0].slot = Some(self.slot_offset(func)?);
        }

        self.assigner.reset();
        let mut taken = Vec::new();
        let mut stack_args = Vec::new();
        for operand in tile.values[first_arg..].iter_mut() {
            let mut placement = CCAssignment::new(operand.class);
            self.assigner.assign_arg(&mut placement);
            let value = value_id(operand.node);
            match (placement.reg, placement.stack_off) {
                (Some(reg), _) => {
                    if self.regs.reg_of(value).is_some() {
                        // Already placed for an earlier argument; copy from memory.
                        let mut reload = Tile::new(TileOp::Reload);
                        reload.args.push(self.slot_offset(value)? as i64);
                        reload.result = Some(Operand::in_reg(operand.node, operand.class, reg));
                        stack_args.push(reload);
                        self.summary.reloads += 1;
                    } else {
                        self.regs.take(&mut self.state.spill, reg, value).map_err(map_err)?;
                        self.regs.load(value, reg).map_err(map_err)?;
                    }
                    operand.reg = Some(reg);
                    taken.push(reg);
                }
                (None, Some(stack_off)) => {
                    let mut copy = Tile::new(TileOp::StackArg);
                    copy.args.push(self.slot_offset(value)? as i64);
                    copy.args.push(stack_off as i64);
                    operand.slot = Some(stack_off);
                    stack_args.push(copy);
                    self.summary.stack_args += 1;
                }
                (None, None) => return Err(structural("argument left unplaced")),
            }
        }
        if self.assigner.stack_args() > MAX_STACK_ARGS {
            return Err(JitError::exhausted(format!(
                "call needs {} stack arguments, at most {} are supported",
                self.assigner.stack_args(),
                MAX_STACK_ARGS
            )));
        }
        self.flush_moves(list, index);
        for tile in stack_args {
            self.insert(list, index, tile);
        }

        // The callee clobbers every allocatable register.
        for reg in taken {
            self.regs.free(reg);
        }
        let result = self.define_result(&mut tile)?;
        if let Some(reg) = result {
            self.regs.release(reg);
        }
        self.retire(&tile, index);
        list.items[index] = tile;
        Ok(())
    }

    fn allocate_control(&mut self, list: &mut TileList<'_>, index: usize) -> JitResult<()> {
        self.regs.invalidate(&mut self.state.spill).map_err(map_err)?;
        self.flush_moves(list, index);
        Ok(())
    }
}

/// Assign registers to every operand and result in `list` and splice in the
/// moves this requires. Finalizes the list.
pub fn allocate_registers<'arena>(
    list: &mut TileList<'arena>,
    arena: &'arena Bump,
    assigner: &mut dyn CCAssigner,
    state: &mut CompilerState,
    session: &CompilationSession<'_>,
) -> JitResult<AllocSummary> {
    let info = *assigner.get_ccinfo();
    let last_use = compute_last_uses(&list.items);
    let mut alloc = Allocator {
        regs: RegisterFile::new(info.allocatable_gp, info.allocatable_fp),
        assigner,
        state,
        last_use,
        order: 0,
        summary: AllocSummary::default(),
    };

    for index in 0..list.len() {
        let op = list.items[index].op;
        if op.is_call() {
            alloc.allocate_call(list, index)?;
        } else if op.is_control() {
            alloc.allocate_control(list, index)?;
        } else {
            alloc.allocate_plain(list, index)?;
        }
    }
    // Nothing is live past the end, but queued moves still need a home.
    alloc.flush_moves(list, list.len());

    let mut summary = alloc.summary;
    summary.clobbered = alloc.regs.clobbered().clone();
    for _ in 0..summary.spills {
        session.record_spill();
    }
    for _ in 0..summary.reloads {
        session.record_reload();
    }
    list.finalize(arena);
    log::debug!(
        "register allocation ({}): {} spills, {} reloads, {} stack args, {} spill slots",
        info.name,
        summary.spills,
        summary.reloads,
        summary.stack_args,
        alloc.state.spill.slot_count()
    );
    Ok(summary)
}

/// Register class of a value that must live in `reg`.
pub fn class_of_reg(reg: AsmReg) -> RegClass {
    if reg.bank == RegClass::Num.bank() {
        RegClass::Num
    } else {
        RegClass::Int
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::with_test_context;
    use crate::expr::parse_expr;
    use crate::tile::{build_tile_list, Tiler};
    use crate::x64::calling_convention::{CallConv, SysVAssigner, Win64Assigner, RDI, RSI};
    use crate::x64::tiles;

    fn allocate<'a>(arena: &'a Bump, text: &str, assigner: &mut dyn CCAssigner) -> JitResult<(TileList<'a>, AllocSummary)> {
        let table = tiles::table()?;
        let (mut tree, roots) = parse_expr(text)?;
        let tiling = Tiler::new(table).tile(&mut tree, &roots)?;
        let mut state = CompilerState::new(0, 64);
        let mut list = build_tile_list(arena, table, &mut tree, &roots, &tiling, &mut state)?;
        let session = CompilationSession::new(arena);
        let summary = allocate_registers(&mut list, arena, assigner, &mut state, &session)?;
        Ok((list, summary))
    }

    #[test]
    fn test_operands_get_distinct_registers() {
        let list = with_test_context(|ctx| {
            ctx.allocated_tiles(
                "(store (addr (local) 16) (add (load (addr (local) 0) 8) (load (addr (local) 8) 8)) 8)",
                0,
                CallConv::SysV,
            )
        })
        .unwrap();
        let add = list.iter().find(|t| t.op == TileOp::Add).unwrap();
        let (a, b) = (add.values[0].reg.unwrap(), add.values[1].reg.unwrap());
        let out = add.result.unwrap().reg.unwrap();
        assert_ne!(a, b);
        assert_ne!(out, a);
        assert_ne!(out, b);
        let store = list.iter().find(|t| t.op == TileOp::StoreLocal).unwrap();
        assert_eq!(store.values[0].reg, Some(out));
        assert!(!list.iter().any(|t| matches!(t.op, TileOp::Spill | TileOp::Reload)));
    }

    #[test]
    fn test_value_live_across_label_is_spilled_and_reloaded() {
        let arena = Bump::new();
        let (list, summary) = allocate(
            &arena,
            "$v:(load (addr (local) 0) 8)
             (when (nz (load (addr (local) 8) 8)) (store (addr (local) 16) $v 8))
             (store (addr (local) 24) $v 8)",
            &mut SysVAssigner::new(),
        )
        .unwrap();
        assert!(summary.spills >= 1);
        assert!(summary.reloads >= 1);
        let spill = list.iter().position(|t| t.op == TileOp::Spill).unwrap();
        let jump = list.iter().position(|t| t.op == TileOp::CondJump).unwrap();
        assert!(spill < jump);
        assert_eq!(list.iter().find(|t| t.op == TileOp::Spill).unwrap().args, vec![64]);
    }

    #[test]
    fn test_call_arguments_in_convention_registers() {
        let arena = Bump::new();
        let (list, _) = allocate(
            &arena,
            "(callv (const_ptr 4096) (arglist (carg (tc) 1) (carg (load (addr (local) 0) 8) 0)))",
            &mut SysVAssigner::new(),
        )
        .unwrap();
        let call = list.iter().find(|t| t.op == TileOp::CallVoid).unwrap();
        assert_eq!(call.call_args()[0].reg, Some(RDI));
        assert_eq!(call.call_args()[1].reg, Some(RSI));
        let reloads = list.iter().filter(|t| t.op == TileOp::Reload).count();
        assert_eq!(reloads, 2);
    }

    #[test]
    fn test_win64_stack_arguments() {
        let arena = Bump::new();
        let (list, summary) = allocate(
            &arena,
            "(callv (const_ptr 4096) (arglist (carg (tc) 1) (carg (cu) 1) (carg (frame) 1)
                                             (carg (local) 1) (carg (const 5 8) 0) (carg (const 6 8) 0)))",
            &mut Win64Assigner::new(),
        )
        .unwrap();
        assert_eq!(summary.stack_args, 2);
        let offsets: Vec<_> = list
            .iter()
            .filter(|t| t.op == TileOp::StackArg)
            .map(|t| t.args[1])
            .collect();
        assert_eq!(offsets, vec![32, 40]);
    }

    #[test]
    fn test_too_many_stack_arguments() {
        let arena = Bump::new();
        let args: String = (0..11).map(|i| format!("(carg (const {} 8) 0)", i)).collect();
        let text = format!("(callv (const_ptr 4096) (arglist {}))", args);
        let err = allocate(&arena, &text, &mut SysVAssigner::new()).unwrap_err();
        assert!(matches!(err, JitError::Exhausted { .. }));
    }

    #[test]
    fn test_loop_keeps_value_alive() {
        let tiles_in = {
            let mut tiles = Vec::new();
            let mut def = Tile::new(TileOp::LoadLocal);
            def.result = Some(Operand::new(NodeId(1), RegClass::Int));
            tiles.push(def);
            let mut mark = Tile::new(TileOp::Mark);
            mark.label = Some(0);
            tiles.push(mark);
            let mut read = Tile::new(TileOp::StoreLocal);
            read.values.push(Operand::new(NodeId(1), RegClass::Int));
            tiles.push(read);
            let mut back = Tile::new(TileOp::Branch);
            back.label = Some(0);
            tiles.push(back);
            tiles
        };
        let last = compute_last_uses(&tiles_in);
        assert_eq!(last[&1], 3);
    }

    #[test]
    fn test_reg_class_of_bank() {
        assert_eq!(class_of_reg(AsmReg::xmm(3)), RegClass::Num);
        assert_eq!(class_of_reg(RDI), RegClass::Int);
    }
}
