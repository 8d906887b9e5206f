//! Rule assignment.
//!
//! The postorder pass labels every node with the automaton state reached
//! from its children's states. The preorder pass starts each root on its
//! cheapest rule and pushes the symbol every rule demands down to the
//! children. A child that already plays a different rule for another
//! parent is duplicated and only the demanding parent is pointed at the
//! copy.

use crate::core::error::{structural, JitError, JitResult};
use crate::expr::{traverse, ExprOp, ExprTree, NodeId, TreeVisitor, Walk};

use super::table::{table_arity, RuleId, StateId, Sym, TileTable};

/// Per-node tiling result, indexed by node.
#[derive(Debug, Clone, Default)]
pub struct Tiling {
    pub states: Vec<Option<StateId>>,
    pub rules: Vec<Option<RuleId>>,
    /// Nodes appended to resolve conflicting demands.
    pub duplicates: usize,
}

impl Tiling {
    pub fn rule(&self, node: NodeId) -> Option<RuleId> {
        self.rules.get(node.index()).copied().flatten()
    }

    pub fn state(&self, node: NodeId) -> Option<StateId> {
        self.states.get(node.index()).copied().flatten()
    }

    fn grow(&mut self, len: usize) {
        if self.states.len() < len {
            self.states.resize(len, None);
            self.rules.resize(len, None);
        }
    }
}

pub struct Tiler<'t> {
    table: &'t TileTable,
}

impl<'t> Tiler<'t> {
    pub fn new(table: &'t TileTable) -> Self {
        Self { table }
    }

    /// Assign a rule to every node reachable from `roots`. Appends
    /// duplicates to `tree` where demands conflict.
    pub fn tile(&self, tree: &mut ExprTree, roots: &[NodeId]) -> JitResult<Tiling> {
        let mut tiling = Tiling::default();
        tiling.grow(tree.len());

        let mut labeler = Labeler {
            table: self.table,
            tiling: &mut tiling,
        };
        traverse(tree, roots, &mut labeler)?;

        for &root in roots {
            if tiling.rule(root).is_none() {
                let state = tiling
                    .state(root)
                    .ok_or_else(|| structural(format!("root {} was not labeled", root)))?;
                let rule = self
                    .table
                    .best_rule(state)
                    .ok_or_else(|| structural(format!("state {} has no rule", state)))?;
                tiling.rules[root.index()] = Some(rule);
            }
        }

        let mut assigner = Assigner {
            table: self.table,
            tiling: &mut tiling,
        };
        traverse(tree, roots, &mut assigner)?;

        if tiling.duplicates > 0 {
            log::debug!("tiler duplicated {} nodes", tiling.duplicates);
        }
        Ok(tiling)
    }
}

struct Labeler<'a, 't> {
    table: &'t TileTable,
    tiling: &'a mut Tiling,
}

impl Labeler<'_, '_> {
    fn child_state(&self, tree: &ExprTree, child: NodeId) -> JitResult<StateId> {
        self.tiling
            .state(child)
            .ok_or_else(|| structural(format!("{} {} labeled before its children", tree.op(child), child)))
    }

    fn lookup(&self, tree: &ExprTree, node: NodeId, l: Option<StateId>, r: Option<StateId>) -> JitResult<StateId> {
        let op = tree.op(node);
        self.table.lookup(op, l, r).map(|(state, _)| state).ok_or_else(|| {
            let kids: Vec<_> = tree.children(node).iter().map(|&c| tree.op(c).name()).collect();
            JitError::unsupported(format!("no tile for {} {} over ({})", op, node, kids.join(", ")))
        })
    }

    /// State of an IF whose branches give `a` and `b`: the narrower of the
    /// two, provided it agrees with the other on every symbol it derives.
    fn join_branches(&self, tree: &ExprTree, node: NodeId, a: StateId, b: StateId) -> JitResult<StateId> {
        if a == b {
            return Ok(a);
        }
        let covers = |wide: StateId, narrow: StateId| {
            self.table
                .state_syms(narrow)
                .all(|sym| self.table.select(wide, sym) == self.table.select(narrow, sym))
        };
        if covers(a, b) {
            Ok(b)
        } else if covers(b, a) {
            Ok(a)
        } else {
            Err(JitError::unsupported(format!(
                "branches of {} {} reduce to different symbols",
                tree.op(node),
                node
            )))
        }
    }
}

impl TreeVisitor for Labeler<'_, '_> {
    fn postorder(&mut self, tree: &mut ExprTree, node: NodeId) -> JitResult<()> {
        let op = tree.op(node);
        let kids = tree.children(node).to_vec();
        let state = match op {
            ExprOp::All | ExprOp::Any | ExprOp::Arglist if kids.is_empty() => self.lookup(tree, node, None, None)?,
            ExprOp::All | ExprOp::Any | ExprOp::Arglist => {
                let mut folded = None;
                for &kid in &kids {
                    let kid_state = self.child_state(tree, kid)?;
                    folded = Some(match folded {
                        None => self.lookup(tree, node, Some(kid_state), None)?,
                        Some(list) => self.lookup(tree, node, Some(list), Some(kid_state))?,
                    });
                }
                folded.ok_or_else(|| structural("empty variadic fold"))?
            }
            ExprOp::Do | ExprOp::Dov => {
                let (Some(&first), Some(&last)) = (kids.first(), kids.last()) else {
                    return Err(JitError::unsupported(format!("{} {} has no children", op, node)));
                };
                let l = self.child_state(tree, first)?;
                let r = self.child_state(tree, last)?;
                self.lookup(tree, node, Some(l), Some(r))?
            }
            ExprOp::If | ExprOp::Ifv => {
                let cond = self.child_state(tree, kids[0])?;
                let left = self.child_state(tree, kids[1])?;
                let right = self.child_state(tree, kids[2])?;
                let a = self.lookup(tree, node, Some(cond), Some(left))?;
                let b = self.lookup(tree, node, Some(cond), Some(right))?;
                self.join_branches(tree, node, a, b)?
            }
            _ => match table_arity(op) {
                0 => self.lookup(tree, node, None, None)?,
                1 => {
                    let l = self.child_state(tree, kids[0])?;
                    self.lookup(tree, node, Some(l), None)?
                }
                _ => {
                    let l = self.child_state(tree, kids[0])?;
                    let r = self.child_state(tree, kids[1])?;
                    self.lookup(tree, node, Some(l), Some(r))?
                }
            },
        };
        log::trace!("label {} {} -> state {}", op, node, state);
        self.tiling.states[node.index()] = Some(state);
        Ok(())
    }
}

struct Assigner<'a, 't> {
    table: &'t TileTable,
    tiling: &'a mut Tiling,
}

impl Assigner<'_, '_> {
    /// Symbol each child slot of `node` is demanded as.
    fn demands(&self, tree: &ExprTree, node: NodeId, rule: RuleId) -> Vec<Sym> {
        let rule = self.table.rule(rule);
        let count = tree.children(node).len();
        let left = rule.left.unwrap_or_default();
        let right = rule.right.unwrap_or(left);
        match tree.op(node) {
            ExprOp::All | ExprOp::Any | ExprOp::Arglist => vec![left; count],
            ExprOp::Do | ExprOp::Dov => (0..count)
                .map(|i| if i + 1 == count { right } else { left })
                .collect(),
            ExprOp::If | ExprOp::Ifv => vec![left, right, right],
            _ => [left, right].into_iter().take(count).collect(),
        }
    }
}

impl TreeVisitor for Assigner<'_, '_> {
    fn preorder(&mut self, tree: &mut ExprTree, node: NodeId) -> JitResult<Walk> {
        let rule = self
            .tiling
            .rule(node)
            .ok_or_else(|| structural(format!("{} {} reached without a rule", tree.op(node), node)))?;
        let demands = self.demands(tree, node, rule);

        for (slot, sym) in demands.into_iter().enumerate() {
            let child = tree.children(node)[slot];
            let state = self
                .tiling
                .state(child)
                .ok_or_else(|| structural(format!("child {} of {} was not labeled", child, node)))?;
            let needed = self.table.select(state, sym).ok_or_else(|| {
                JitError::unsupported(format!(
                    "{} {} cannot be used as {} by {} {}",
                    tree.op(child),
                    child,
                    self.table.sym_name(sym),
                    tree.op(node),
                    node
                ))
            })?;
            match self.tiling.rule(child) {
                None => self.tiling.rules[child.index()] = Some(needed),
                Some(existing) if existing == needed => {}
                Some(existing) => {
                    let copy = tree.duplicate(child);
                    self.tiling.grow(tree.len());
                    self.tiling.states[copy.index()] = Some(state);
                    self.tiling.rules[copy.index()] = Some(needed);
                    tree.set_child(node, slot, copy);
                    self.tiling.duplicates += 1;
                    log::trace!(
                        "duplicate {} {} as {} ({} -> {})",
                        tree.op(child),
                        child,
                        copy,
                        self.table.rule(existing).name,
                        self.table.rule(needed).name
                    );
                }
            }
        }
        Ok(Walk::Continue)
    }
}
