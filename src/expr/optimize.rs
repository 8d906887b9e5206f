//! Tree rewrites applied before tiling.
//!
//! Nodes are visited in index order, so children are rewritten before
//! their parents. A rewritten node is replaced by a new or existing node
//! and every later reference is redirected to it.

use crate::core::error::JitResult;

use super::{ExprOp, ExprTree, NodeId, PTR_SIZE};

fn const_value(tree: &ExprTree, id: NodeId) -> Option<i64> {
    match tree.op(id) {
        ExprOp::Const => tree.args(id).first().copied(),
        _ => None,
    }
}

/// Rewrite `tree` in place, redirecting `roots`. Returns the number of
/// nodes replaced.
pub fn optimize(tree: &mut ExprTree, roots: &mut [NodeId]) -> JitResult<usize> {
    let original_len = tree.len();
    let mut replace: Vec<NodeId> = tree.ids().collect();
    let mut rewrites = 0;

    for index in 0..original_len {
        let id = NodeId(index as u32);
        for slot in 0..tree.children(id).len() {
            let child = tree.children(id)[slot];
            let target = replace[child.index()];
            if target != child {
                tree.set_child(id, slot, target);
            }
        }

        if let Some(new_id) = rewrite(tree, id)? {
            log::trace!("optimize: {} {} -> {} {}", tree.op(id), id, tree.op(new_id), new_id);
            replace[index] = new_id;
            rewrites += 1;
        }
    }

    for root in roots.iter_mut() {
        if let Some(&target) = replace.get(root.index()) {
            *root = target;
        }
    }
    Ok(rewrites)
}

fn rewrite(tree: &mut ExprTree, id: NodeId) -> JitResult<Option<NodeId>> {
    let node = tree.node(id).clone();
    let child = |i: usize| node.children[i];
    match node.op {
        ExprOp::Idx => {
            if let Some(index) = const_value(tree, child(1)) {
                let offset = index.wrapping_mul(node.args[0]);
                return Ok(Some(tree.push(ExprOp::Addr, &[child(0)], &[offset], PTR_SIZE)?));
            }
        }
        ExprOp::Add => {
            let (lhs, rhs) = match (const_value(tree, child(0)), const_value(tree, child(1))) {
                (_, Some(c)) => (child(0), c),
                (Some(c), _) => (child(1), c),
                _ => return Ok(None),
            };
            if rhs == 0 {
                return Ok(Some(lhs));
            }
            if node.size == PTR_SIZE && tree.op(lhs).yields_pointer() {
                return Ok(Some(tree.push(ExprOp::Addr, &[lhs], &[rhs], PTR_SIZE)?));
            }
        }
        ExprOp::Addr => {
            let inner = child(0);
            if tree.op(inner) == ExprOp::Addr {
                let offset = tree.args(inner)[0].wrapping_add(node.args[0]);
                let base = tree.children(inner)[0];
                return Ok(Some(tree.push(ExprOp::Addr, &[base], &[offset], PTR_SIZE)?));
            }
        }
        ExprOp::Copy => {
            if tree.op(child(0)) == ExprOp::Const {
                return Ok(Some(child(0)));
            }
        }
        _ => {}
    }
    Ok(None)
}
