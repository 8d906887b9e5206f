//! Depth-first tree walk with preorder, inorder and postorder hooks.
//!
//! Each node is visited once even when several parents share it. Hooks
//! receive the tree mutably: a preorder hook may append duplicates and
//! point child slots at them, and the walk follows the rewritten slots.

use crate::core::error::JitResult;

use super::{ExprTree, NodeId};

/// How the walk continues after a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Continue,
    /// Skip the child about to be visited.
    SkipNext,
    /// Skip all children not visited yet.
    SkipRest,
}

pub trait TreeVisitor {
    /// Called before the children are visited.
    fn preorder(&mut self, _tree: &mut ExprTree, _node: NodeId) -> JitResult<Walk> {
        Ok(Walk::Continue)
    }

    /// Called after child `index` and before the next one.
    fn inorder(&mut self, _tree: &mut ExprTree, _node: NodeId, _index: usize) -> JitResult<Walk> {
        Ok(Walk::Continue)
    }

    /// Called after all children.
    fn postorder(&mut self, _tree: &mut ExprTree, _node: NodeId) -> JitResult<()> {
        Ok(())
    }
}

/// Walk the subtrees of `roots` in order.
pub fn traverse<V: TreeVisitor>(tree: &mut ExprTree, roots: &[NodeId], visitor: &mut V) -> JitResult<()> {
    let mut visited = Vec::new();
    for &root in roots {
        walk(tree, root, visitor, &mut visited)?;
    }
    Ok(())
}

fn walk<V: TreeVisitor>(
    tree: &mut ExprTree,
    node: NodeId,
    visitor: &mut V,
    visited: &mut Vec<bool>,
) -> JitResult<()> {
    if visited.len() < tree.len() {
        visited.resize(tree.len(), false);
    }
    if std::mem::replace(&mut visited[node.index()], true) {
        return Ok(());
    }

    let mut control = visitor.preorder(tree, node)?;
    let count = tree.children(node).len();
    let mut index = 0;
    while index < count && control != Walk::SkipRest {
        if control == Walk::SkipNext {
            index += 1;
            control = Walk::Continue;
            continue;
        }
        let child = tree.children(node)[index];
        walk(tree, child, visitor, visited)?;
        if index + 1 < count {
            control = visitor.inorder(tree, node, index)?;
        }
        index += 1;
    }
    visitor.postorder(tree, node)
}
