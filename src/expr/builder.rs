//! Convenience constructors for expression trees.
//!
//! The builder infers node sizes, remembers roots and knows how to marshal
//! the interpreter's argument conventions into `carg` nodes for C calls.

use crate::core::error::{JitError, JitResult};
use crate::core::spill::RegClass;

use super::{ExprOp, ExprTree, NodeId, PTR_SIZE};

/// What a called function returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    Void,
    Int,
    Ptr,
    Num,
}

impl RetKind {
    pub fn to_arg(self) -> i64 {
        match self {
            RetKind::Void => 0,
            RetKind::Int => 1,
            RetKind::Ptr => 2,
            RetKind::Num => 3,
        }
    }

    pub fn from_arg(arg: i64) -> Option<RetKind> {
        Some(match arg {
            0 => RetKind::Void,
            1 => RetKind::Int,
            2 => RetKind::Ptr,
            3 => RetKind::Num,
            _ => return None,
        })
    }

    pub fn class(self) -> Option<RegClass> {
        match self {
            RetKind::Void => None,
            RetKind::Int => Some(RegClass::Int),
            RetKind::Ptr => Some(RegClass::Ptr),
            RetKind::Num => Some(RegClass::Num),
        }
    }
}

/// Encode a register class as a `carg` argument.
pub fn carg_kind(class: RegClass) -> i64 {
    class.index() as i64
}

/// Decode the register class of a `carg` argument.
pub fn carg_class(arg: i64) -> Option<RegClass> {
    Some(match arg {
        0 => RegClass::Int,
        1 => RegClass::Ptr,
        2 => RegClass::Num,
        _ => return None,
    })
}

/// One argument of a C call, in interpreter terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallArg {
    ThreadContext,
    Frame,
    CompUnit,
    /// Integer value of the local at a work-area offset.
    Local(i32),
    /// Address of the local at a work-area offset.
    LocalAddr(i32),
    /// Float value of the local at a work-area offset.
    LocalNum(i32),
    Literal(i32),
    Literal64(i64),
    LiteralNum(f64),
    /// Address into the native stack.
    Stack(i32),
    /// An already built value.
    Node(NodeId),
}

/// Incremental tree builder.
#[derive(Debug, Default)]
pub struct ExprBuilder {
    tree: ExprTree,
    roots: Vec<NodeId>,
}

impl ExprBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &ExprTree {
        &self.tree
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn root(&mut self, node: NodeId) {
        self.roots.push(node);
    }

    pub fn finish(self) -> (ExprTree, Vec<NodeId>) {
        (self.tree, self.roots)
    }

    /// Append a node; the size is taken from the operator and its children.
    pub fn node(&mut self, op: ExprOp, children: &[NodeId], args: &[i64]) -> JitResult<NodeId> {
        let size = self.infer_size(op, children, args);
        self.tree.push(op, children, args, size)
    }

    fn infer_size(&self, op: ExprOp, children: &[NodeId], args: &[i64]) -> u8 {
        let child_size = |i: usize| children.get(i).map_or(0, |&c| self.tree.node(c).size);
        match op {
            ExprOp::Const => args.get(1).map_or(PTR_SIZE, |&s| s as u8),
            ExprOp::Load | ExprOp::Scast | ExprOp::Ucast => args.first().map_or(PTR_SIZE, |&s| s as u8),
            ExprOp::ConstNum | ExprOp::LoadNum => 8,
            ExprOp::Add | ExprOp::Sub | ExprOp::Mul | ExprOp::And | ExprOp::Or | ExprOp::Xor => {
                child_size(0).max(child_size(1))
            }
            ExprOp::Not | ExprOp::Copy => child_size(0),
            ExprOp::Do => children.last().map_or(0, |&c| self.tree.node(c).size),
            ExprOp::If => child_size(1).max(child_size(2)),
            ExprOp::Flagval => 1,
            ExprOp::Call => match RetKind::from_arg(args.first().copied().unwrap_or(0)) {
                Some(RetKind::Void) | None => 0,
                Some(_) => PTR_SIZE,
            },
            op if op.yields_pointer() || op == ExprOp::ConstLarge => PTR_SIZE,
            _ => 0,
        }
    }

    pub fn constant(&mut self, value: i64, size: u8) -> JitResult<NodeId> {
        self.node(ExprOp::Const, &[], &[value, size as i64])
    }

    pub fn local(&mut self) -> JitResult<NodeId> {
        self.node(ExprOp::Local, &[], &[])
    }

    pub fn addr(&mut self, base: NodeId, offset: i64) -> JitResult<NodeId> {
        self.node(ExprOp::Addr, &[base], &[offset])
    }

    pub fn load(&mut self, address: NodeId, size: u8) -> JitResult<NodeId> {
        self.node(ExprOp::Load, &[address], &[size as i64])
    }

    pub fn store(&mut self, address: NodeId, value: NodeId, size: u8) -> JitResult<NodeId> {
        self.node(ExprOp::Store, &[address, value], &[size as i64])
    }

    /// Address of the local at `offset` in the work area.
    pub fn local_addr(&mut self, offset: i32) -> JitResult<NodeId> {
        let local = self.local()?;
        self.addr(local, offset as i64)
    }

    /// Integer value of the local at `offset`.
    pub fn load_local(&mut self, offset: i32) -> JitResult<NodeId> {
        let address = self.local_addr(offset)?;
        self.load(address, PTR_SIZE)
    }

    pub fn store_local(&mut self, offset: i32, value: NodeId) -> JitResult<NodeId> {
        let address = self.local_addr(offset)?;
        self.store(address, value, PTR_SIZE)
    }

    pub fn binary(&mut self, op: ExprOp, lhs: NodeId, rhs: NodeId) -> JitResult<NodeId> {
        self.node(op, &[lhs, rhs], &[])
    }

    /// Build the node computing one call argument.
    pub fn call_arg(&mut self, arg: CallArg) -> JitResult<(NodeId, RegClass)> {
        Ok(match arg {
            CallArg::ThreadContext => (self.node(ExprOp::Tc, &[], &[])?, RegClass::Ptr),
            CallArg::Frame => (self.node(ExprOp::Frame, &[], &[])?, RegClass::Ptr),
            CallArg::CompUnit => (self.node(ExprOp::Cu, &[], &[])?, RegClass::Ptr),
            CallArg::Local(offset) => (self.load_local(offset)?, RegClass::Int),
            CallArg::LocalAddr(offset) => (self.local_addr(offset)?, RegClass::Ptr),
            CallArg::LocalNum(offset) => {
                let address = self.local_addr(offset)?;
                (self.node(ExprOp::LoadNum, &[address], &[])?, RegClass::Num)
            }
            CallArg::Literal(value) => (self.constant(value as i64, 4)?, RegClass::Int),
            CallArg::Literal64(value) => (self.node(ExprOp::ConstLarge, &[], &[value])?, RegClass::Int),
            CallArg::LiteralNum(value) => (
                self.node(ExprOp::ConstNum, &[], &[value.to_bits() as i64])?,
                RegClass::Num,
            ),
            CallArg::Stack(offset) => {
                let stack = self.node(ExprOp::Stack, &[], &[])?;
                (self.addr(stack, offset as i64)?, RegClass::Ptr)
            }
            CallArg::Node(node) => {
                let class = match self.tree.result_kind(node) {
                    super::ResultKind::Num => RegClass::Num,
                    super::ResultKind::Reg if self.tree.op(node).yields_pointer() => RegClass::Ptr,
                    super::ResultKind::Reg => RegClass::Int,
                    kind => {
                        return Err(JitError::unsupported(format!(
                            "{} cannot be passed to a call ({:?})",
                            self.tree.op(node),
                            kind
                        )))
                    }
                };
                (node, class)
            }
        })
    }

    /// Build a call of the C function at `func` with interpreter-convention
    /// arguments. Returns the `call` or `callv` node.
    pub fn call_c(&mut self, func: usize, args: &[CallArg], ret: RetKind) -> JitResult<NodeId> {
        let target = self.node(ExprOp::ConstPtr, &[], &[func as i64])?;
        let mut cargs = Vec::with_capacity(args.len());
        for &arg in args {
            let (value, class) = self.call_arg(arg)?;
            cargs.push(self.node(ExprOp::Carg, &[value], &[carg_kind(class)])?);
        }
        let arglist = self.node(ExprOp::Arglist, &cargs, &[])?;
        match ret {
            RetKind::Void => self.node(ExprOp::Callv, &[target, arglist], &[]),
            _ => self.node(ExprOp::Call, &[target, arglist], &[ret.to_arg()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_inference() {
        let mut b = ExprBuilder::new();
        let a = b.load_local(0).unwrap();
        let c = b.constant(3, 4).unwrap();
        let sum = b.binary(ExprOp::Add, a, c).unwrap();
        assert_eq!(b.tree().node(a).size, 8);
        assert_eq!(b.tree().node(c).size, 4);
        assert_eq!(b.tree().node(sum).size, 8);
    }

    #[test]
    fn test_call_c_marshals_arguments() {
        let mut b = ExprBuilder::new();
        let call = b
            .call_c(
                0x1000,
                &[CallArg::ThreadContext, CallArg::Local(16), CallArg::LiteralNum(1.5)],
                RetKind::Int,
            )
            .unwrap();
        let tree = b.tree();
        assert_eq!(tree.op(call), ExprOp::Call);
        let arglist = tree.children(call)[1];
        let cargs = tree.children(arglist);
        assert_eq!(cargs.len(), 3);
        let classes: Vec<_> = cargs
            .iter()
            .map(|&c| carg_class(tree.args(c)[0]).unwrap())
            .collect();
        assert_eq!(classes, vec![RegClass::Ptr, RegClass::Int, RegClass::Num]);
        assert_eq!(tree.op(tree.children(cargs[2])[0]), ExprOp::ConstNum);
        assert!(tree.check(&[call]).is_ok());
    }

    #[test]
    fn test_void_call() {
        let mut b = ExprBuilder::new();
        let call = b.call_c(0x1000, &[CallArg::Frame], RetKind::Void).unwrap();
        assert_eq!(b.tree().op(call), ExprOp::Callv);
    }

    #[test]
    fn test_flag_cannot_be_call_argument() {
        let mut b = ExprBuilder::new();
        let x = b.load_local(0).unwrap();
        let flag = b.node(ExprOp::Nz, &[x], &[]).unwrap();
        assert!(b.call_c(0x1000, &[CallArg::Node(flag)], RetKind::Void).is_err());
    }
}
