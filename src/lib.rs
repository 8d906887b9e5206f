//! exprjit - expression tree JIT backend for a bytecode virtual machine.
//!
//! exprjit turns the expression trees a specializer produces for a hot
//! frame into x86-64 machine code plus the tables the interpreter needs to
//! enter, resume, deoptimize and unwind through it.
//!
//! # Primary Usage
//!
//! ```ignore
//! use exprjit::compiler::JitCompiler;
//! use exprjit::core::CompilationSession;
//! use exprjit::expr::parse_expr;
//! use exprjit::graph::JitGraph;
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let (tree, roots) = parse_expr("(store (addr (local) 16) (const 5 8) 8)")?;
//! let mut graph = JitGraph::new("frame", tree, roots, 0);
//! let code = JitCompiler::from_env().compile(&mut graph, &session);
//! ```
//!
//! # Architecture
//!
//! - [`expr`] - expression tree arena, builder, reader and rewrites
//! - [`graph`] - a tree with its labels, deopt points, handlers and inlines
//! - [`tile`] - tile table generation, tiler and tile list construction
//! - [`regalloc`] - register and spill allocation over a tile list
//! - [`emit`] / [`x64`] - the encoder interface and the x86-64 encoder
//! - [`code`] - executable code objects and their lookup tables
//! - [`compiler`] - the pipeline driver

pub mod code;
pub mod compiler;
pub mod core;
pub mod emit;
pub mod expr;
pub mod graph;
pub mod regalloc;
pub mod tile;
pub mod x64;

pub use crate::code::{CodeObject, FrameEntry};
pub use crate::compiler::JitCompiler;
pub use crate::core::{CompilationSession, JitConfig, JitError, JitResult};
pub use crate::graph::JitGraph;
