// This module holds the instruction selection data structures: tiles (one concrete machine
// operation covering one or more tree nodes), the tile list that linearizes a tiled tree,
// and the deferred-insert side list through which later passes splice extra tiles (spills,
// reloads, stack arguments) into the list without shifting it repeatedly. The generic
// table generator lives in `table`, the bottom-up/top-down rule assignment in `tiler`, and
// the linearization with synthesized control flow in `list_builder`.

//! Tiles and tile lists.

pub mod list_builder;
pub mod table;
pub mod tiler;

use std::fmt;

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::core::register_file::AsmReg;
use crate::core::spill::RegClass;
use crate::expr::{ExprOp, NodeId};

pub use list_builder::build_tile_list;
pub use table::{Pat, RuleDef, RuleId, StateId, Sym, TileTable};
pub use tiler::{Tiler, Tiling};

/// Condition tested by a flag-consuming tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
    Nz,
    Zr,
}

impl Cond {
    pub fn from_op(op: ExprOp) -> Option<Cond> {
        Some(match op {
            ExprOp::Lt => Cond::Lt,
            ExprOp::Le => Cond::Le,
            ExprOp::Eq => Cond::Eq,
            ExprOp::Ne => Cond::Ne,
            ExprOp::Ge => Cond::Ge,
            ExprOp::Gt => Cond::Gt,
            ExprOp::Nz => Cond::Nz,
            ExprOp::Zr => Cond::Zr,
            _ => return None,
        })
    }

    pub fn negate(self) -> Cond {
        match self {
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Nz => Cond::Zr,
            Cond::Zr => Cond::Nz,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Cond::Lt => "lt",
            Cond::Le => "le",
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Ge => "ge",
            Cond::Gt => "gt",
            Cond::Nz => "nz",
            Cond::Zr => "zr",
        }
    }
}

macro_rules! tile_ops {
    ($( $(#[$doc:meta])* $variant:ident => $name:literal ),* $(,)?) => {
        /// Operation a tile performs. Argument and value layouts are listed
        /// per operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum TileOp {
            $( $(#[$doc])* $variant, )*
        }

        impl TileOp {
            pub fn name(self) -> &'static str {
                match self {
                    $( TileOp::$variant => $name, )*
                }
            }
        }
    };
}

tile_ops! {
    Tc => "tc",
    Cu => "cu",
    Frame => "frame",
    Local => "local",
    Stack => "stack",
    /// args `[value, size]`
    Const => "const",
    /// args `[value]`
    ConstLarge => "const_large",
    /// args `[pointer]`
    ConstPtr => "const_ptr",
    /// args `[bits]`
    ConstNum => "const_num",
    /// args `[label]`
    LabelAddr => "label_addr",
    /// values `[addr]`, args `[size]`
    LoadReg => "load_reg",
    /// values `[base]`, args `[offset, size]`
    LoadAddr => "load_addr",
    /// values `[base, index]`, args `[scale, size]`
    LoadIdx => "load_idx",
    /// args `[offset, size]`
    LoadLocal => "load_local",
    /// values `[addr]`, args `[offset]` or none
    LoadNum => "load_num",
    /// values `[addr, value]`, args `[size]`
    Store => "store",
    /// values `[base, value]`, args `[offset, size]`
    StoreAddr => "store_addr",
    /// values `[base, index, value]`, args `[scale, size]`
    StoreIdx => "store_idx",
    /// values `[value]`, args `[offset, size]`
    StoreLocal => "store_local",
    /// values `[addr, value]`, args `[offset]` or none
    StoreNum => "store_num",
    /// values `[base]`, args `[offset]`
    Addr => "addr",
    /// values `[base, index]`, args `[scale]`
    Idx => "idx",
    Add => "add",
    Sub => "sub",
    Mul => "mul",
    And => "and",
    Or => "or",
    Xor => "xor",
    /// values `[lhs]`, args `[value, size]`
    AddConst => "add_const",
    SubConst => "sub_const",
    MulConst => "mul_const",
    AndConst => "and_const",
    OrConst => "or_const",
    XorConst => "xor_const",
    Not => "not",
    Copy => "copy",
    /// values `[value]`, args `[to_size, from_size]`
    Scast => "scast",
    Ucast => "ucast",
    /// values `[lhs, rhs]`, args `[size]` (compared width)
    Cmp => "cmp",
    /// values `[lhs]`, args `[value, size]` (compared width)
    CmpConst => "cmp_const",
    /// values `[value]`
    Nz => "nz",
    Zr => "zr",
    /// values `[lhs, rhs]`
    NzAnd => "nz_and",
    /// values `[base]`, args `[offset, size]`
    TestAddr => "test_addr",
    /// Materialize the tile's condition as 0/1.
    Flagval => "flagval",
    /// args `[label]`
    Branch => "branch",
    /// args `[label]`
    Mark => "mark",
    /// Places the deopt resume point. args `[deopt_index, label]`
    Guard => "guard",
    /// values `[value]`
    Discard => "discard",
    /// values `[func?, call args...]`, args `[ret_kind]` plus `[pointer]` for direct calls
    Call => "call",
    CallVoid => "call_void",
    Jump => "jump",
    CondJump => "cond_jump",
    Label => "label",
    /// Copy a branch value into the merged IF value. values `[branch]`
    Join => "join",
    /// Store a register to a spill slot. args `[offset]`
    Spill => "spill",
    /// Load a spill slot into a register. args `[offset]`
    Reload => "reload",
    /// Copy a spill slot to an outgoing stack argument. args `[offset, stack_offset]`
    StackArg => "stack_arg",
}

impl TileOp {
    /// Tiles at which control flow may enter or leave.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            TileOp::Branch
                | TileOp::Mark
                | TileOp::Guard
                | TileOp::Jump
                | TileOp::CondJump
                | TileOp::Label
        )
    }

    pub fn is_call(self) -> bool {
        matches!(self, TileOp::Call | TileOp::CallVoid)
    }
}

impl fmt::Display for TileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A runtime value read or written by a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    /// Node producing the value.
    pub node: NodeId,
    pub class: RegClass,
    /// Register assigned by the allocator.
    pub reg: Option<AsmReg>,
    /// Work-area offset, for operands read straight from spill memory.
    pub slot: Option<i32>,
}

impl Operand {
    pub fn new(node: NodeId, class: RegClass) -> Self {
        Self {
            node,
            class,
            reg: None,
            slot: None,
        }
    }

    pub fn in_reg(node: NodeId, class: RegClass, reg: AsmReg) -> Self {
        Self {
            node,
            class,
            reg: Some(reg),
            slot: None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.node.0)?;
        if let Some(reg) = self.reg {
            write!(f, ":{}", crate::x64::reg_name(reg))?;
        }
        if let Some(slot) = self.slot {
            write!(f, ":[{}]", slot)?;
        }
        Ok(())
    }
}

/// One concrete instruction selection decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub op: TileOp,
    /// Node the tile was instantiated for; none for synthesized tiles.
    pub node: Option<NodeId>,
    pub rule: Option<&'static str>,
    pub args: Vec<i64>,
    pub values: Vec<Operand>,
    pub result: Option<Operand>,
    pub cond: Option<Cond>,
    pub label: Option<u32>,
    /// The last `num_call_args` values are call arguments.
    pub num_call_args: usize,
}

impl Tile {
    pub fn new(op: TileOp) -> Self {
        Self {
            op,
            node: None,
            rule: None,
            args: Vec::new(),
            values: Vec::new(),
            result: None,
            cond: None,
            label: None,
            num_call_args: 0,
        }
    }

    pub fn jump(label: u32) -> Self {
        Self {
            label: Some(label),
            ..Self::new(TileOp::Jump)
        }
    }

    pub fn cond_jump(cond: Cond, label: u32) -> Self {
        Self {
            label: Some(label),
            cond: Some(cond),
            ..Self::new(TileOp::CondJump)
        }
    }

    pub fn label(label: u32) -> Self {
        Self {
            label: Some(label),
            ..Self::new(TileOp::Label)
        }
    }

    pub fn call_args(&self) -> &[Operand] {
        &self.values[self.values.len() - self.num_call_args..]
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Some(node) => write!(f, "{} ", node)?,
            None => write!(f, "     ")?,
        }
        write!(f, "{}", self.op)?;
        if let Some(cond) = self.cond {
            write!(f, ".{}", cond.name())?;
        }
        if let Some(label) = self.label {
            write!(f, " L{}", label)?;
        }
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        for (i, value) in self.values.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { " (" } else { ", " }, value)?;
        }
        if !self.values.is_empty() {
            write!(f, ")")?;
        }
        if let Some(result) = &self.result {
            write!(f, " -> {}", result)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PendingInsert {
    position: usize,
    order: u32,
    tile: Tile,
}

/// Ordered tile sequence with deferred inserts.
#[derive(Debug)]
pub struct TileList<'arena> {
    pub items: BumpVec<'arena, Tile>,
    inserts: BumpVec<'arena, PendingInsert>,
    /// Total value references of all call argument lists.
    pub num_arglist_refs: usize,
    /// Number of labels, producer and internal.
    pub num_labels: u32,
}

impl<'arena> TileList<'arena> {
    pub fn new_in(arena: &'arena Bump) -> Self {
        Self {
            items: BumpVec::new_in(arena),
            inserts: BumpVec::new_in(arena),
            num_arglist_refs: 0,
            num_labels: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, tile: Tile) {
        self.items.push(tile);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tile> {
        self.items.iter()
    }

    /// Queue `tile` to be placed before the item currently at `position`
    /// (or at the end when `position == len`). Inserts at the same position
    /// are ordered by `order`, then by insertion.
    pub fn insert(&mut self, position: usize, order: u32, tile: Tile) {
        self.inserts.push(PendingInsert { position, order, tile });
    }

    pub fn pending_inserts(&self) -> usize {
        self.inserts.len()
    }

    /// Merge the queued inserts into the list.
    pub fn finalize(&mut self, arena: &'arena Bump) {
        if self.inserts.is_empty() {
            return;
        }
        let mut inserts = std::mem::replace(&mut self.inserts, BumpVec::new_in(arena));
        inserts.sort_by_key(|ins| (ins.position, ins.order));
        let capacity = self.items.len() + inserts.len();
        let old = std::mem::replace(
            &mut self.items,
            BumpVec::with_capacity_in(capacity, arena),
        );
        let mut pending = inserts.into_iter().peekable();
        for (position, tile) in old.into_iter().enumerate() {
            while let Some(ins) = pending.next_if(|ins| ins.position <= position) {
                self.items.push(ins.tile);
            }
            self.items.push(tile);
        }
        for ins in pending {
            self.items.push(ins.tile);
        }
    }
}

impl fmt::Display for TileList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tile) in self.items.iter().enumerate() {
            writeln!(f, "{:4}: {}", i, tile)?;
        }
        Ok(())
    }
}
