//! Input to one compilation.
//!
//! A [`JitGraph`] bundles the expression tree and its roots with the
//! producer-side tables that end up in the code object: deoptimization
//! points, exception handler ranges and inlined-frame ranges. All of them
//! refer to producer labels `0..num_labels`.

use crate::core::error::{JitError, JitResult};
use crate::expr::{ExprBuilder, ExprOp, ExprTree, NodeId};

/// A deoptimization point: code at `label` resumes interpretation at
/// deopt table entry `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptEntry {
    pub index: u32,
    pub label: u32,
}

/// An exception handler covering code between two labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    pub start_label: u32,
    pub end_label: u32,
    pub goto_label: u32,
    pub handler: u32,
}

/// Code between two labels that belongs to an inlined frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineEntry {
    pub start_label: u32,
    pub end_label: u32,
    pub inline: u32,
}

#[derive(Debug, Clone, Default)]
pub struct JitGraph {
    pub name: String,
    pub tree: ExprTree,
    pub roots: Vec<NodeId>,
    pub num_labels: u32,
    pub deopts: Vec<DeoptEntry>,
    pub handlers: Vec<HandlerEntry>,
    pub inlines: Vec<InlineEntry>,
}

impl JitGraph {
    pub fn new(name: impl Into<String>, tree: ExprTree, roots: Vec<NodeId>, num_labels: u32) -> Self {
        Self {
            name: name.into(),
            tree,
            roots,
            num_labels,
            ..Default::default()
        }
    }

    /// Build a graph from a builder, registering a deopt entry for every
    /// `guard` node.
    pub fn from_builder(name: impl Into<String>, builder: ExprBuilder, num_labels: u32) -> JitResult<Self> {
        let (tree, roots) = builder.finish();
        let mut graph = Self::new(name, tree, roots, num_labels);
        graph.collect_guards()?;
        Ok(graph)
    }

    /// Register deopt entries for the `guard` nodes reachable from the roots.
    pub fn collect_guards(&mut self) -> JitResult<()> {
        let mut seen = vec![false; self.tree.len()];
        let mut stack = self.roots.clone();
        while let Some(id) = stack.pop() {
            if id.index() >= seen.len() || std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            if self.tree.op(id) == ExprOp::Guard {
                let args = self.tree.args(id);
                let entry = DeoptEntry {
                    index: args[0] as u32,
                    label: args[1] as u32,
                };
                if !self.deopts.contains(&entry) {
                    self.deopts.push(entry);
                }
            }
            stack.extend_from_slice(self.tree.children(id));
        }
        Ok(())
    }

    pub fn add_handler(&mut self, entry: HandlerEntry) {
        self.handlers.push(entry);
    }

    pub fn add_inline(&mut self, entry: InlineEntry) {
        self.inlines.push(entry);
    }

    /// Check that every label the tables and tree mention is a producer label.
    pub fn check_labels(&self) -> JitResult<()> {
        let check = |label: u32, what: &str| {
            if label < self.num_labels {
                Ok(())
            } else {
                Err(JitError::unsupported(format!(
                    "{} label {} out of range (graph has {})",
                    what, label, self.num_labels
                )))
            }
        };
        for d in &self.deopts {
            check(d.label, "deopt")?;
        }
        for h in &self.handlers {
            check(h.start_label, "handler start")?;
            check(h.end_label, "handler end")?;
            check(h.goto_label, "handler goto")?;
        }
        for i in &self.inlines {
            check(i.start_label, "inline start")?;
            check(i.end_label, "inline end")?;
        }
        for id in self.tree.ids() {
            let node = self.tree.node(id);
            let label = match node.op {
                ExprOp::Label | ExprOp::Mark => node.args[0],
                ExprOp::Guard => node.args[1],
                _ => continue,
            };
            if label < 0 {
                return Err(JitError::unsupported(format!("{} {} has negative label", node.op, id)));
            }
            check(label as u32, node.op.name())?;
        }
        Ok(())
    }
}
