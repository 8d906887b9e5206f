// This module linearizes a tiled tree into a TileList. Plain tiles are appended in
// postorder; rules without an emitter (definitions, fused subpatterns, control combinators)
// produce nothing by themselves. Control combinators are expanded into jump, conditional
// jump and label tiles from the preorder, inorder and postorder hooks:
//
//   ALL   every child that fails jumps to the ALL label; a nested ALL shares the label,
//         a nested ANY falls through on failure (jump to the ALL label) and lands on its
//         own label on success.
//   ANY   symmetric: every child that succeeds jumps to the ANY label.
//   IF    the condition fails to the else label; left block, join, jump to end, else
//         label, right block, join, end label. IFV is the same without joins.
//   WHEN  like IF with a single label after the body.
//
// The label owned by an ALL or ANY is placed by whoever consumes the condition. Conditions
// whose outcome is known from constant operands produce no tiles; the consumer emits an
// unconditional jump or nothing and skips whatever can no longer execute.

//! Tile list construction.

use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};

use crate::core::error::{structural, JitError, JitResult};
use crate::core::session::CompilerState;
use crate::core::spill::RegClass;
use crate::expr::builder::{carg_class, RetKind};
use crate::expr::{traverse, ExprOp, ExprTree, NodeId, ResultKind, TreeVisitor, Walk};

use super::table::sym;
use super::{Cond, Operand, Pat, Tile, TileList, TileOp, TileTable, Tiling};

/// Build the tile list for a tiled tree. Internal labels are drawn from `state`.
pub fn build_tile_list<'arena>(
    arena: &'arena Bump,
    table: &TileTable,
    tree: &mut ExprTree,
    roots: &[NodeId],
    tiling: &Tiling,
    state: &mut CompilerState,
) -> JitResult<TileList<'arena>> {
    let mut builder = ListBuilder {
        table,
        tiling,
        state,
        list: TileList::new_in(arena),
        labels: HashMap::new(),
        known: HashMap::new(),
        conditions: HashSet::new(),
        stopped: HashSet::new(),
    };
    traverse(tree, roots, &mut builder)?;
    let mut list = builder.list;
    list.num_labels = builder.state.label_count();
    log::trace!("tile list:\n{}", list);
    Ok(list)
}

/// Outcome of a condition with constant operands.
fn known_condition(tree: &ExprTree, node: NodeId) -> Option<bool> {
    let kids = tree.children(node);
    let width = compare_width(tree, node);
    let constant = |id: NodeId| match tree.op(id) {
        ExprOp::Const => tree.args(id).first().map(|&v| sign_extend(v, width)),
        _ => None,
    };
    match tree.op(node) {
        ExprOp::Nz => constant(kids[0]).map(|v| v != 0),
        ExprOp::Zr => constant(kids[0]).map(|v| v == 0),
        op if op.is_comparison() => {
            let (a, b) = (constant(kids[0])?, constant(kids[1])?);
            Some(match op {
                ExprOp::Lt => a < b,
                ExprOp::Le => a <= b,
                ExprOp::Eq => a == b,
                ExprOp::Ne => a != b,
                ExprOp::Ge => a >= b,
                _ => a > b,
            })
        }
        _ => None,
    }
}

/// Width in bytes at which a comparison or zero test reads its operands.
fn compare_width(tree: &ExprTree, node: NodeId) -> u8 {
    let width = tree
        .children(node)
        .iter()
        .map(|&kid| tree.node(kid).size)
        .max()
        .unwrap_or(0);
    match width {
        1 | 2 | 4 => width,
        _ => 8,
    }
}

fn sign_extend(value: i64, size: u8) -> i64 {
    match size {
        1 => value as i8 as i64,
        2 => value as i16 as i64,
        4 => value as i32 as i64,
        _ => value,
    }
}

/// Register class of the value `node` produces.
pub fn value_class(tree: &ExprTree, node: NodeId) -> RegClass {
    let node = tree.value_node(node);
    match tree.result_kind(node) {
        ResultKind::Num => RegClass::Num,
        _ if tree.op(node) == ExprOp::Call => match RetKind::from_arg(tree.args(node)[0]) {
            Some(RetKind::Ptr) => RegClass::Ptr,
            _ => RegClass::Int,
        },
        _ if tree.op(node).yields_pointer() => RegClass::Ptr,
        _ => RegClass::Int,
    }
}

#[derive(Debug, Clone, Copy)]
struct CtrlLabels {
    /// ALL/ANY exit, IF else, WHEN end.
    first: u32,
    /// IF end.
    second: u32,
}

struct ListBuilder<'a, 'arena> {
    table: &'a TileTable,
    tiling: &'a Tiling,
    state: &'a mut CompilerState,
    list: TileList<'arena>,
    labels: HashMap<NodeId, CtrlLabels>,
    known: HashMap<NodeId, bool>,
    /// ALL/ANY nodes consumed as conditions.
    conditions: HashSet<NodeId>,
    /// Combinators whose remaining children were skipped.
    stopped: HashSet<NodeId>,
}

impl ListBuilder<'_, '_> {
    fn fresh(&mut self) -> u32 {
        self.state.next_label()
    }

    fn label_of(&self, node: NodeId) -> JitResult<CtrlLabels> {
        self.labels
            .get(&node)
            .copied()
            .ok_or_else(|| structural(format!("combinator {} has no label", node)))
    }

    /// Register `cond` as the condition child of a combinator. An ALL or
    /// ANY child may take over `inherit` as its own label; callers pass one
    /// only when it means the same thing for the child (failure target for
    /// ALL, success target for ANY).
    fn claim_condition(&mut self, tree: &ExprTree, cond: NodeId, inherit: Option<u32>) {
        match tree.op(cond) {
            ExprOp::All | ExprOp::Any => {
                self.conditions.insert(cond);
                if let Some(label) = inherit {
                    self.labels.entry(cond).or_insert(CtrlLabels {
                        first: label,
                        second: label,
                    });
                }
            }
            _ => {
                if let Some(value) = known_condition(tree, cond) {
                    self.known.insert(cond, value);
                }
            }
        }
    }

    fn flag_cond(&self, tree: &ExprTree, node: NodeId) -> JitResult<Cond> {
        Cond::from_op(tree.op(node))
            .ok_or_else(|| JitError::unsupported(format!("{} {} is not a simple condition", tree.op(node), node)))
    }

    /// Emit the control flow after condition child `child` of an ALL or ANY.
    /// Returns false when the remaining children cannot execute.
    fn after_junction_child(&mut self, tree: &ExprTree, node: NodeId, child: NodeId) -> JitResult<bool> {
        let is_all = tree.op(node) == ExprOp::All;
        let label = self.label_of(node)?.first;
        if let Some(&value) = self.known.get(&child) {
            // A false child decides an ALL, a true child decides an ANY.
            if value != is_all {
                self.list.push(Tile::jump(label));
                return Ok(false);
            }
            return Ok(true);
        }
        match tree.op(child) {
            op if op == tree.op(node) => {}
            ExprOp::All | ExprOp::Any => {
                let own = self.label_of(child)?.first;
                self.list.push(Tile::jump(label));
                self.list.push(Tile::label(own));
            }
            _ => {
                let cond = self.flag_cond(tree, child)?;
                let cond = if is_all { cond.negate() } else { cond };
                self.list.push(Tile::cond_jump(cond, label));
            }
        }
        Ok(true)
    }

    /// Emit the branch to `target` taken when condition `cond` fails.
    fn branch_unless(&mut self, tree: &ExprTree, cond: NodeId, target: u32) -> JitResult<()> {
        match tree.op(cond) {
            ExprOp::All => {}
            ExprOp::Any => {
                let own = self.label_of(cond)?.first;
                self.list.push(Tile::jump(target));
                self.list.push(Tile::label(own));
            }
            _ => {
                let flag = self.flag_cond(tree, cond)?;
                self.list.push(Tile::cond_jump(flag.negate(), target));
            }
        }
        Ok(())
    }

    fn join(&mut self, tree: &ExprTree, node: NodeId, branch: NodeId) {
        let class = value_class(tree, node);
        let mut tile = Tile::new(TileOp::Join);
        tile.node = Some(node);
        tile.values.push(Operand::new(tree.value_node(branch), class));
        tile.result = Some(Operand::new(node, class));
        self.list.push(tile);
    }

    fn extract(&mut self, tree: &ExprTree, node: NodeId, pat: &Pat, tile: &mut Tile) -> JitResult<()> {
        let Pat::Node(_, kids) = pat else {
            return Ok(());
        };
        for (slot, kid) in kids.iter().enumerate() {
            let child = tree.children(node)[slot];
            match kid {
                Pat::Node(..) => self.extract(tree, child, kid, tile)?,
                Pat::Sym(sym::REG) | Pat::Sym(sym::NUM) => {
                    tile.values
                        .push(Operand::new(tree.value_node(child), value_class(tree, child)));
                }
                Pat::Sym(sym::FLAG) => {
                    tile.cond = Some(self.flag_cond(tree, child)?);
                }
                Pat::Sym(sym::LABEL) => {
                    tile.label = tree.args(child).first().map(|&l| l as u32);
                }
                Pat::Sym(sym::ARGS) => {
                    for &carg in tree.children(child) {
                        let class = carg_class(tree.args(carg)[0]).ok_or_else(|| {
                            JitError::unsupported(format!("carg {} has an unknown kind", carg))
                        })?;
                        let value = tree.value_node(tree.children(carg)[0]);
                        tile.values.push(Operand::new(value, class));
                        tile.num_call_args += 1;
                    }
                    self.list.num_arglist_refs += tile.num_call_args;
                }
                Pat::Sym(_) => {}
            }
        }
        tile.args.extend_from_slice(tree.args(node));
        Ok(())
    }

    fn emit_rule_tile(&mut self, tree: &ExprTree, node: NodeId) -> JitResult<()> {
        let rule_id = self
            .tiling
            .rule(node)
            .ok_or_else(|| structural(format!("{} {} has no rule", tree.op(node), node)))?;
        let rule = self.table.rule(rule_id);
        let (Some(emit), Some(pattern)) = (rule.emit, rule.pattern.as_ref()) else {
            return Ok(());
        };
        let mut tile = Tile::new(emit);
        tile.node = Some(node);
        tile.rule = Some(rule.name);
        self.extract(tree, node, pattern, &mut tile)?;

        let op = tree.op(node);
        match emit {
            TileOp::Cmp => {
                tile.cond = Cond::from_op(op);
                tile.args.push(compare_width(tree, node) as i64);
            }
            TileOp::CmpConst => {
                tile.cond = Cond::from_op(op);
                let width = compare_width(tree, node) as i64;
                match tile.args.get_mut(1) {
                    Some(size) => *size = width,
                    None => return Err(structural(format!("cmp_const {} lost its constant", node))),
                }
            }
            TileOp::Nz | TileOp::Zr | TileOp::NzAnd | TileOp::TestAddr => {
                tile.cond = Cond::from_op(op);
            }
            TileOp::Mark | TileOp::LabelAddr => tile.label = tree.args(node).first().map(|&l| l as u32),
            TileOp::Guard => tile.label = tree.args(node).get(1).map(|&l| l as u32),
            _ => {}
        }
        if matches!(rule.sym, sym::REG | sym::NUM) && tree.result_kind(node) != ResultKind::Void {
            tile.result = Some(Operand::new(node, value_class(tree, node)));
        }
        log::trace!("tile {}", tile);
        self.list.push(tile);
        Ok(())
    }
}

impl TreeVisitor for ListBuilder<'_, '_> {
    fn preorder(&mut self, tree: &mut ExprTree, node: NodeId) -> JitResult<Walk> {
        if self.known.contains_key(&node) {
            return Ok(Walk::SkipRest);
        }
        let op = tree.op(node);
        match op {
            ExprOp::All | ExprOp::Any => {
                if !self.conditions.contains(&node) {
                    return Err(JitError::unsupported(format!("{} {} used outside a condition", op, node)));
                }
                if !self.labels.contains_key(&node) {
                    let label = self.fresh();
                    self.labels.insert(node, CtrlLabels { first: label, second: label });
                }
                let label = self.label_of(node)?.first;
                for &child in tree.children(node) {
                    let inherit = (tree.op(child) == op).then_some(label);
                    self.claim_condition(tree, child, inherit);
                }
            }
            ExprOp::If | ExprOp::Ifv => {
                let labels = CtrlLabels {
                    first: self.fresh(),
                    second: self.fresh(),
                };
                self.labels.insert(node, labels);
                let cond = tree.children(node)[0];
                let inherit = (tree.op(cond) == ExprOp::All).then_some(labels.first);
                self.claim_condition(tree, cond, inherit);
            }
            ExprOp::When => {
                let end = self.fresh();
                self.labels.insert(node, CtrlLabels { first: end, second: end });
                let cond = tree.children(node)[0];
                let inherit = (tree.op(cond) == ExprOp::All).then_some(end);
                self.claim_condition(tree, cond, inherit);
            }
            ExprOp::Flagval => {
                let child = tree.children(node)[0];
                if matches!(tree.op(child), ExprOp::All | ExprOp::Any) {
                    return Err(JitError::unsupported(format!(
                        "flagval {} of a short-circuit condition",
                        node
                    )));
                }
            }
            _ => {}
        }
        Ok(Walk::Continue)
    }

    fn inorder(&mut self, tree: &mut ExprTree, node: NodeId, index: usize) -> JitResult<Walk> {
        let op = tree.op(node);
        match op {
            ExprOp::All | ExprOp::Any => {
                let child = tree.children(node)[index];
                if !self.after_junction_child(tree, node, child)? {
                    self.stopped.insert(node);
                    return Ok(Walk::SkipRest);
                }
            }
            ExprOp::If | ExprOp::Ifv => {
                let cond = tree.children(node)[0];
                let labels = self.label_of(node)?;
                match (index, self.known.get(&cond).copied()) {
                    (0, Some(true)) => {}
                    (0, Some(false)) => return Ok(Walk::SkipNext),
                    (0, None) => self.branch_unless(tree, cond, labels.first)?,
                    (_, Some(true)) => {
                        if op == ExprOp::If {
                            self.join(tree, node, tree.children(node)[1]);
                        }
                        return Ok(Walk::SkipRest);
                    }
                    (_, _) => {
                        if op == ExprOp::If {
                            self.join(tree, node, tree.children(node)[1]);
                        }
                        self.list.push(Tile::jump(labels.second));
                        self.list.push(Tile::label(labels.first));
                    }
                }
            }
            ExprOp::When => {
                let cond = tree.children(node)[0];
                let end = self.label_of(node)?.first;
                match self.known.get(&cond).copied() {
                    Some(true) => {}
                    Some(false) => {
                        self.list.push(Tile::jump(end));
                        return Ok(Walk::SkipRest);
                    }
                    None => self.branch_unless(tree, cond, end)?,
                }
            }
            _ => {}
        }
        Ok(Walk::Continue)
    }

    fn postorder(&mut self, tree: &mut ExprTree, node: NodeId) -> JitResult<()> {
        if self.known.contains_key(&node) {
            return Ok(());
        }
        let op = tree.op(node);
        match op {
            ExprOp::All | ExprOp::Any => {
                if !self.stopped.contains(&node) {
                    if let Some(&last) = tree.children(node).last() {
                        self.after_junction_child(tree, node, last)?;
                    }
                }
            }
            ExprOp::If | ExprOp::Ifv => {
                let cond = tree.children(node)[0];
                let labels = self.label_of(node)?;
                match self.known.get(&cond).copied() {
                    Some(true) => {}
                    Some(false) => {
                        if op == ExprOp::If {
                            self.join(tree, node, tree.children(node)[2]);
                        }
                    }
                    None => {
                        if op == ExprOp::If {
                            self.join(tree, node, tree.children(node)[2]);
                        }
                        self.list.push(Tile::label(labels.second));
                    }
                }
            }
            ExprOp::When => {
                let end = self.label_of(node)?.first;
                self.list.push(Tile::label(end));
            }
            ExprOp::Do | ExprOp::Dov | ExprOp::Carg | ExprOp::Arglist => {}
            _ => self.emit_rule_tile(tree, node)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::with_test_context;
    use crate::expr::parse_expr;
    use crate::tile::Tiler;
    use crate::x64::tiles;

    fn build(text: &str) -> Vec<Tile> {
        with_test_context(|ctx| {
            let table = tiles::table().unwrap();
            let (mut tree, roots) = parse_expr(text).unwrap();
            let tiling = Tiler::new(table).tile(&mut tree, &roots).unwrap();
            let mut state = CompilerState::new(0, 0);
            let list = build_tile_list(ctx.arena(), table, &mut tree, &roots, &tiling, &mut state).unwrap();
            list.iter().cloned().collect()
        })
    }

    fn ops(tiles: &[Tile]) -> Vec<TileOp> {
        tiles.iter().map(|t| t.op).collect()
    }

    #[test]
    fn test_sum_of_locals() {
        let tiles = build(
            "(store (addr (local) 16)
                    (add (load (addr (local) 0) 8) (load (addr (local) 8) 8))
                    8)",
        );
        assert_eq!(
            ops(&tiles),
            vec![TileOp::LoadLocal, TileOp::LoadLocal, TileOp::Add, TileOp::StoreLocal]
        );
        assert_eq!(tiles[0].args, vec![0, 8]);
        assert_eq!(tiles[1].args, vec![8, 8]);
        assert_eq!(tiles[3].args, vec![16, 8]);
        assert_eq!(tiles[2].values.len(), 2);
        assert_eq!(tiles[3].values[0].node, tiles[2].result.unwrap().node);
    }

    #[test]
    fn test_when_with_comparison() {
        let tiles = build(
            "(when (lt (load (addr (local) 0) 8) (const 10 8))
                   (store (addr (local) 8) (const 1 8) 8))",
        );
        assert_eq!(
            ops(&tiles),
            vec![
                TileOp::LoadLocal,
                TileOp::CmpConst,
                TileOp::CondJump,
                TileOp::Const,
                TileOp::StoreLocal,
                TileOp::Label,
            ]
        );
        assert_eq!(tiles[2].cond, Some(Cond::Ge));
        assert_eq!(tiles[2].label, tiles[5].label);
    }

    #[test]
    fn test_compare_carries_operand_width() {
        let tiles = build(
            "(when (eq (load (addr (local) 0) 4) (const -1 4))
                   (store (addr (local) 8) (const 1 8) 8))
             (when (lt (load (addr (local) 0) 2) (load (addr (local) 8) 2))
                   (store (addr (local) 8) (const 1 8) 8))",
        );
        let cmps: Vec<_> = tiles
            .iter()
            .filter(|t| matches!(t.op, TileOp::Cmp | TileOp::CmpConst))
            .collect();
        assert_eq!(cmps[0].args, vec![-1, 4]);
        assert_eq!(cmps[1].args, vec![2]);
    }

    #[test]
    fn test_known_condition_respects_constant_size() {
        // 0xffffffff and -1 are the same 4-byte value
        let tiles = build(
            "(when (eq (const 4294967295 4) (const -1 4))
                   (store (addr (local) 8) (const 1 8) 8))",
        );
        assert!(!tiles.iter().any(|t| matches!(t.op, TileOp::Jump | TileOp::CondJump | TileOp::CmpConst)));
        assert!(tiles.iter().any(|t| t.op == TileOp::StoreLocal));

        let tiles = build("(when (nz (const 256 1)) (store (addr (local) 8) (const 1 8) 8))");
        let jumps: Vec<_> = tiles.iter().filter(|t| t.op == TileOp::Jump).collect();
        assert_eq!(jumps.len(), 1);
    }

    #[test]
    fn test_if_value_joins_both_branches() {
        let tiles = build(
            "(store (addr (local) 0)
                    (if (nz (load (addr (local) 8) 8)) (const 1 8) (const 2 8))
                    8)",
        );
        assert_eq!(
            ops(&tiles),
            vec![
                TileOp::LoadLocal,
                TileOp::Nz,
                TileOp::CondJump,
                TileOp::Const,
                TileOp::Join,
                TileOp::Jump,
                TileOp::Label,
                TileOp::Const,
                TileOp::Join,
                TileOp::Label,
                TileOp::StoreLocal,
            ]
        );
        let else_label = tiles[2].label;
        assert_eq!(tiles[2].cond, Some(Cond::Zr));
        assert_eq!(tiles[6].label, else_label);
        assert_eq!(tiles[5].label, tiles[9].label);
        assert_eq!(tiles[4].result, tiles[8].result);
    }

    #[test]
    fn test_nested_any_inside_all() {
        let tiles = build(
            "(when (all (nz (load (addr (local) 0) 8))
                        (any (zr (load (addr (local) 8) 8)) (nz (load (addr (local) 16) 8))))
                   (store (addr (local) 24) (const 1 8) 8))",
        );
        let kinds = ops(&tiles);
        let jumps: Vec<_> = tiles
            .iter()
            .filter(|t| matches!(t.op, TileOp::Jump | TileOp::CondJump))
            .collect();
        // nz fails -> end; zr succeeds -> any label; nz succeeds -> any label; any fails -> end
        assert_eq!(jumps.len(), 4);
        let end = tiles.last().unwrap().label;
        assert_eq!(jumps[0].label, end);
        assert_eq!(jumps[0].cond, Some(Cond::Zr));
        assert_eq!(jumps[1].cond, Some(Cond::Zr));
        assert_eq!(jumps[1].label, jumps[2].label);
        assert_eq!(jumps[3].op, TileOp::Jump);
        assert_eq!(jumps[3].label, end);
        assert_eq!(kinds.iter().filter(|&&k| k == TileOp::Label).count(), 2);
    }

    #[test]
    fn test_statically_false_all_child_skips_rest() {
        let tiles = build(
            "(when (all (nz (const 0 8)) (lt (load (addr (local) 0) 8) (load (addr (local) 8) 8)))
                   (store (addr (local) 16) (const 1 8) 8))",
        );
        let end = tiles.last().unwrap().label;
        let branches: Vec<_> = tiles
            .iter()
            .filter(|t| matches!(t.op, TileOp::Jump | TileOp::CondJump))
            .collect();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].op, TileOp::Jump);
        assert_eq!(branches[0].label, end);
        assert!(!tiles.iter().any(|t| matches!(t.op, TileOp::Cmp | TileOp::LoadLocal | TileOp::Nz)));
    }

    #[test]
    fn test_known_true_if_keeps_left_only() {
        let tiles = build("(store (addr (local) 0) (if (zr (const 0 8)) (const 1 8) (const 2 8)) 8)");
        assert_eq!(ops(&tiles), vec![TileOp::Const, TileOp::Join, TileOp::StoreLocal]);
        assert_eq!(tiles[0].args, vec![1, 8]);
    }

    #[test]
    fn test_direct_call_collects_arguments() {
        let tiles = build("(callv (const_ptr 4096) (arglist (carg (tc) 1) (carg (const 3 4) 0)))");
        assert_eq!(ops(&tiles), vec![TileOp::Tc, TileOp::Const, TileOp::CallVoid]);
        let call = &tiles[2];
        assert_eq!(call.num_call_args, 2);
        assert_eq!(call.args, vec![4096]);
        assert_eq!(call.call_args()[0].class, RegClass::Ptr);
        assert_eq!(call.call_args()[1].class, RegClass::Int);
    }

    #[test]
    fn test_all_outside_condition_rejected() {
        let arena = Bump::new();
        let table = tiles::table().unwrap();
        let (mut tree, roots) = parse_expr("(all (nz (tc)))").unwrap();
        let tiling = Tiler::new(table).tile(&mut tree, &roots).unwrap();
        let mut state = CompilerState::new(0, 0);
        assert!(build_tile_list(&arena, table, &mut tree, &roots, &tiling, &mut state).is_err());
    }
}
