// This module defines the expression tree that the JIT compiles: a closed set of operators
// (ExprOp) with a static shape table, and an append-only node arena (ExprTree) addressed by
// NodeId. Nodes are never mutated in place once other nodes refer to them; the tiler
// resolves conflicting demands by appending duplicates, which never invalidates existing
// indices. Submodules provide a builder with call-argument classification, an S-expression
// reader for the template notation, a traversal driver with pre/in/postorder hooks, the
// pre-tiling rewrites, and text/graphviz dumps used for debug logging.

//! Expression trees.

pub mod builder;
pub mod dump;
pub mod optimize;
pub mod parser;
pub mod traverse;

use std::fmt;

use crate::core::error::{JitError, JitResult};

pub use builder::{CallArg, ExprBuilder, RetKind};
pub use parser::parse_expr;
pub use traverse::{traverse, TreeVisitor, Walk};

/// Index of a node in an [`ExprTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Number of children an operator takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(u8),
    Variadic,
}

/// Kind of value an operator yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Void,
    Reg,
    Num,
    Flag,
}

/// Static shape of an operator.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub arity: Arity,
    pub nargs: u8,
    pub result: ResultKind,
}

macro_rules! expr_ops {
    ($( $variant:ident => ($name:literal, $arity:expr, $nargs:literal, $result:ident) ),* $(,)?) => {
        /// Expression operators.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum ExprOp {
            $( $variant, )*
        }

        impl ExprOp {
            pub const ALL_OPS: &'static [ExprOp] = &[ $( ExprOp::$variant, )* ];

            pub fn info(self) -> OpInfo {
                match self {
                    $( ExprOp::$variant => OpInfo {
                        name: $name,
                        arity: $arity,
                        nargs: $nargs,
                        result: ResultKind::$result,
                    }, )*
                }
            }
        }
    };
}

use Arity::{Fixed, Variadic};

expr_ops! {
    // leaves
    Const => ("const", Fixed(0), 2, Reg),
    ConstPtr => ("const_ptr", Fixed(0), 1, Reg),
    ConstLarge => ("const_large", Fixed(0), 1, Reg),
    ConstNum => ("const_num", Fixed(0), 1, Num),
    Tc => ("tc", Fixed(0), 0, Reg),
    Cu => ("cu", Fixed(0), 0, Reg),
    Frame => ("frame", Fixed(0), 0, Reg),
    Local => ("local", Fixed(0), 0, Reg),
    Stack => ("stack", Fixed(0), 0, Reg),
    Label => ("label", Fixed(0), 1, Reg),
    Mark => ("mark", Fixed(0), 1, Void),
    // memory
    Load => ("load", Fixed(1), 1, Reg),
    LoadNum => ("load_num", Fixed(1), 0, Num),
    Store => ("store", Fixed(2), 1, Void),
    StoreNum => ("store_num", Fixed(2), 0, Void),
    Addr => ("addr", Fixed(1), 1, Reg),
    Idx => ("idx", Fixed(2), 1, Reg),
    // arithmetic
    Add => ("add", Fixed(2), 0, Reg),
    Sub => ("sub", Fixed(2), 0, Reg),
    Mul => ("mul", Fixed(2), 0, Reg),
    And => ("and", Fixed(2), 0, Reg),
    Or => ("or", Fixed(2), 0, Reg),
    Xor => ("xor", Fixed(2), 0, Reg),
    Not => ("not", Fixed(1), 0, Reg),
    Copy => ("copy", Fixed(1), 0, Reg),
    Scast => ("scast", Fixed(1), 2, Reg),
    Ucast => ("ucast", Fixed(1), 2, Reg),
    // comparison
    Lt => ("lt", Fixed(2), 0, Flag),
    Le => ("le", Fixed(2), 0, Flag),
    Eq => ("eq", Fixed(2), 0, Flag),
    Ne => ("ne", Fixed(2), 0, Flag),
    Ge => ("ge", Fixed(2), 0, Flag),
    Gt => ("gt", Fixed(2), 0, Flag),
    Nz => ("nz", Fixed(1), 0, Flag),
    Zr => ("zr", Fixed(1), 0, Flag),
    Flagval => ("flagval", Fixed(1), 0, Reg),
    // control
    All => ("all", Variadic, 0, Flag),
    Any => ("any", Variadic, 0, Flag),
    Do => ("do", Variadic, 0, Reg),
    Dov => ("dov", Variadic, 0, Void),
    When => ("when", Fixed(2), 0, Void),
    If => ("if", Fixed(3), 0, Reg),
    Ifv => ("ifv", Fixed(3), 0, Void),
    Branch => ("branch", Fixed(1), 0, Void),
    Guard => ("guard", Fixed(1), 2, Void),
    Discard => ("discard", Fixed(1), 0, Void),
    // calls
    Call => ("call", Fixed(2), 1, Reg),
    Callv => ("callv", Fixed(2), 0, Void),
    Arglist => ("arglist", Variadic, 0, Void),
    Carg => ("carg", Fixed(1), 1, Void),
}

impl ExprOp {
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Look an operator up by its lower-case name.
    pub fn from_name(name: &str) -> Option<ExprOp> {
        ExprOp::ALL_OPS.iter().copied().find(|op| op.name() == name)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            ExprOp::Lt | ExprOp::Le | ExprOp::Eq | ExprOp::Ne | ExprOp::Ge | ExprOp::Gt | ExprOp::Nz | ExprOp::Zr
        )
    }

    /// The comparison testing the opposite condition.
    pub fn negate(self) -> Option<ExprOp> {
        Some(match self {
            ExprOp::Lt => ExprOp::Ge,
            ExprOp::Ge => ExprOp::Lt,
            ExprOp::Le => ExprOp::Gt,
            ExprOp::Gt => ExprOp::Le,
            ExprOp::Eq => ExprOp::Ne,
            ExprOp::Ne => ExprOp::Eq,
            ExprOp::Nz => ExprOp::Zr,
            ExprOp::Zr => ExprOp::Nz,
            _ => return None,
        })
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            ExprOp::Add | ExprOp::Mul | ExprOp::And | ExprOp::Or | ExprOp::Xor | ExprOp::Eq | ExprOp::Ne
        )
    }

    /// Operators whose result is an address rather than plain data.
    pub fn yields_pointer(self) -> bool {
        matches!(
            self,
            ExprOp::ConstPtr
                | ExprOp::Tc
                | ExprOp::Cu
                | ExprOp::Frame
                | ExprOp::Local
                | ExprOp::Stack
                | ExprOp::Label
                | ExprOp::Addr
                | ExprOp::Idx
        )
    }
}

impl fmt::Display for ExprOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Size in bytes of a pointer-sized value.
pub const PTR_SIZE: u8 = 8;

/// One node of the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    pub op: ExprOp,
    pub children: Vec<NodeId>,
    pub args: Vec<i64>,
    /// Byte size of the produced value, 0 for void.
    pub size: u8,
}

/// Append-only node arena.
#[derive(Debug, Clone, Default)]
pub struct ExprTree {
    nodes: Vec<ExprNode>,
}

impl ExprTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &ExprNode {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&ExprNode> {
        self.nodes.get(id.index())
    }

    pub fn op(&self, id: NodeId) -> ExprOp {
        self.nodes[id.index()].op
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    pub fn args(&self, id: NodeId) -> &[i64] {
        &self.nodes[id.index()].args
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Append a node, checking its shape.
    pub fn push(&mut self, op: ExprOp, children: &[NodeId], args: &[i64], size: u8) -> JitResult<NodeId> {
        let info = op.info();
        if let Arity::Fixed(n) = info.arity {
            if children.len() != n as usize {
                return Err(JitError::unsupported(format!(
                    "{} takes {} children, got {}",
                    info.name,
                    n,
                    children.len()
                )));
            }
        }
        if args.len() != info.nargs as usize {
            return Err(JitError::unsupported(format!(
                "{} takes {} arguments, got {}",
                info.name,
                info.nargs,
                args.len()
            )));
        }
        if let Some(bad) = children.iter().find(|c| c.index() >= self.nodes.len()) {
            return Err(JitError::unsupported(format!(
                "{} refers to undefined node {}",
                info.name, bad
            )));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(ExprNode {
            op,
            children: children.to_vec(),
            args: args.to_vec(),
            size,
        });
        Ok(id)
    }

    /// Append a copy of `id` and return the copy's index. Children are
    /// shared with the original.
    pub fn duplicate(&mut self, id: NodeId) -> NodeId {
        let copy = self.nodes[id.index()].clone();
        let new_id = NodeId(self.nodes.len() as u32);
        self.nodes.push(copy);
        new_id
    }

    /// Point child slot `slot` of `parent` at `child`.
    pub fn set_child(&mut self, parent: NodeId, slot: usize, child: NodeId) {
        self.nodes[parent.index()].children[slot] = child;
    }

    /// Kind of value `id` produces.
    pub fn result_kind(&self, id: NodeId) -> ResultKind {
        let node = self.node(id);
        match node.op {
            ExprOp::Call => match RetKind::from_arg(node.args[0]) {
                Some(RetKind::Num) => ResultKind::Num,
                Some(RetKind::Void) => ResultKind::Void,
                _ => ResultKind::Reg,
            },
            ExprOp::Do => node
                .children
                .last()
                .map_or(ResultKind::Void, |&last| self.result_kind(last)),
            ExprOp::If => self.result_kind(node.children[1]),
            op => op.info().result,
        }
    }

    /// The node whose tile actually produces the value of `id`.
    pub fn value_node(&self, id: NodeId) -> NodeId {
        let node = self.node(id);
        match node.op {
            ExprOp::Do => node.children.last().map_or(id, |&last| self.value_node(last)),
            ExprOp::Carg => self.value_node(node.children[0]),
            _ => id,
        }
    }

    /// Validate the subtrees reachable from `roots`.
    pub fn check(&self, roots: &[NodeId]) -> JitResult<()> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            let Some(node) = self.get(id) else {
                return Err(JitError::unsupported(format!("root {} out of range", id)));
            };
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            for (slot, &child) in node.children.iter().enumerate() {
                if child >= id {
                    return Err(JitError::unsupported(format!(
                        "{} {} refers forward to {}",
                        node.op, id, child
                    )));
                }
                self.check_child(id, slot, child)?;
                stack.push(child);
            }
        }
        Ok(())
    }

    fn check_child(&self, parent: NodeId, slot: usize, child: NodeId) -> JitResult<()> {
        let op = self.op(parent);
        let child_op = self.op(child);
        let kind = self.result_kind(child);
        let bad = |what: &str| {
            Err(JitError::unsupported(format!(
                "{} {} expects {} at child {}, found {}",
                op, parent, what, slot, child_op
            )))
        };
        match op {
            ExprOp::All | ExprOp::Any if kind != ResultKind::Flag => bad("a condition"),
            ExprOp::When | ExprOp::If | ExprOp::Ifv if slot == 0 && kind != ResultKind::Flag => {
                bad("a condition")
            }
            ExprOp::Arglist if child_op != ExprOp::Carg => bad("carg"),
            ExprOp::Call | ExprOp::Callv if slot == 1 && child_op != ExprOp::Arglist => bad("arglist"),
            ExprOp::Branch if child_op != ExprOp::Label => bad("label"),
            ExprOp::Flagval if kind != ResultKind::Flag => bad("a condition"),
            ExprOp::All | ExprOp::Any => Ok(()),
            _ if kind == ResultKind::Flag && !matches!(op, ExprOp::Flagval | ExprOp::When | ExprOp::If | ExprOp::Ifv) => {
                bad("a value")
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_table() {
        assert_eq!(ExprOp::from_name("load"), Some(ExprOp::Load));
        assert_eq!(ExprOp::from_name("const_ptr"), Some(ExprOp::ConstPtr));
        assert_eq!(ExprOp::from_name("bogus"), None);
        assert_eq!(ExprOp::If.info().arity, Arity::Fixed(3));
        assert_eq!(ExprOp::All.info().arity, Arity::Variadic);
        for op in ExprOp::ALL_OPS {
            assert_eq!(ExprOp::from_name(op.name()), Some(*op));
        }
    }

    #[test]
    fn test_negation_is_involution() {
        for op in ExprOp::ALL_OPS.iter().copied().filter(|op| op.is_comparison()) {
            let neg = op.negate().unwrap();
            assert_ne!(neg, op);
            assert_eq!(neg.negate(), Some(op));
        }
        assert_eq!(ExprOp::Add.negate(), None);
    }

    #[test]
    fn test_push_checks_shape() {
        let mut tree = ExprTree::new();
        let c = tree.push(ExprOp::Const, &[], &[1, 8], 8).unwrap();
        assert!(tree.push(ExprOp::Add, &[c], &[], 8).is_err());
        assert!(tree.push(ExprOp::Load, &[c], &[], 8).is_err());
        assert!(tree.push(ExprOp::Not, &[NodeId(7)], &[], 8).is_err());
        let all = tree.push(ExprOp::All, &[], &[], 0).unwrap();
        assert_eq!(tree.children(all).len(), 0);
    }

    #[test]
    fn test_duplicate_appends() {
        let mut tree = ExprTree::new();
        assert!(tree.push(ExprOp::Const, &[], &[5], 8).is_err());
        let c = tree.push(ExprOp::Const, &[], &[5, 8], 8).unwrap();
        let n = tree.push(ExprOp::Not, &[c], &[], 8).unwrap();
        let d = tree.duplicate(n);
        assert_eq!(d, NodeId(2));
        assert_eq!(tree.node(d), tree.node(n));
        assert_eq!(tree.children(d), &[c]);
    }

    #[test]
    fn test_check_rejects_bad_children() {
        let mut tree = ExprTree::new();
        let c = tree.push(ExprOp::Const, &[], &[1, 8], 8).unwrap();
        let all = tree.push(ExprOp::All, &[c], &[], 0).unwrap();
        assert!(tree.check(&[all]).is_err());

        let lt = tree.push(ExprOp::Lt, &[c, c], &[], 0).unwrap();
        let add = tree.push(ExprOp::Add, &[lt, c], &[], 8).unwrap();
        assert!(tree.check(&[add]).is_err());

        let all = tree.push(ExprOp::All, &[lt], &[], 0).unwrap();
        let mark = tree.push(ExprOp::Mark, &[], &[0], 0).unwrap();
        let when = tree.push(ExprOp::When, &[all, mark], &[], 0).unwrap();
        assert!(tree.check(&[when]).is_ok());
    }

    #[test]
    fn test_value_node_through_do() {
        let mut tree = ExprTree::new();
        let mark = tree.push(ExprOp::Mark, &[], &[0], 0).unwrap();
        let c = tree.push(ExprOp::Const, &[], &[1, 8], 8).unwrap();
        let d = tree.push(ExprOp::Do, &[mark, c], &[], 8).unwrap();
        assert_eq!(tree.value_node(d), c);
        assert_eq!(tree.result_kind(d), ResultKind::Reg);
    }
}
