//! Compile expression trees and run the generated code against a fake
//! interpreter frame.

#![cfg(all(unix, target_arch = "x86_64"))]

use std::ffi::c_void;
use std::sync::Arc;

use bumpalo::Bump;
use exprjit::code::CodeObject;
use exprjit::compiler::JitCompiler;
use exprjit::core::{CompilationSession, CompilerState, InterpLayout, JitConfig};
use exprjit::expr::{parse_expr, CallArg, ExprBuilder, ExprOp, RetKind};
use exprjit::graph::JitGraph;
use exprjit::regalloc::allocate_registers;
use exprjit::tile::{build_tile_list, TileOp, Tiler};
use exprjit::x64::{tiles, CallConv};

const WORK_WORDS: usize = 64;
const LOCALS_SIZE: i32 = 64;

#[repr(C)]
struct Frame {
    padding: u64,
    work: *mut i64,
}

#[repr(C)]
struct ThreadContext {
    padding: [u64; 2],
    cur_frame: *mut Frame,
}

fn layout() -> InterpLayout {
    InterpLayout {
        tc_cur_frame: std::mem::offset_of!(ThreadContext, cur_frame) as i32,
        frame_work: std::mem::offset_of!(Frame, work) as i32,
        locals_size: LOCALS_SIZE,
    }
}

fn compiler() -> JitCompiler {
    JitCompiler::new(JitConfig {
        optimize: true,
        ..JitConfig::default()
    }
    .with_layout(layout()))
}

/// Run `code` with the given locals; returns the work area afterwards.
fn run(code: &Arc<CodeObject>, locals: &[i64]) -> Vec<i64> {
    let mut work = vec![0i64; WORK_WORDS];
    work[..locals.len()].copy_from_slice(locals);
    let mut frame = Frame {
        padding: 0,
        work: work.as_mut_ptr(),
    };
    let mut tc = ThreadContext {
        padding: [0; 2],
        cur_frame: &mut frame,
    };
    unsafe {
        code.invoke(&mut tc as *mut ThreadContext as *mut c_void, std::ptr::null_mut(), None)
            .unwrap();
    }
    assert_eq!(code.frame_count(), 0);
    work
}

fn compile_text(text: &str, num_labels: u32) -> Arc<CodeObject> {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let (tree, roots) = parse_expr(text).unwrap();
    let mut graph = JitGraph::new("test", tree, roots, num_labels);
    graph.collect_guards().unwrap();
    compiler().try_compile(&mut graph, &session).unwrap()
}

const SUM: &str = "(store (addr (local) 16)
                          (add (load (addr (local) 0) 8) (load (addr (local) 8) 8))
                          8)";

#[test]
fn test_add_two_locals() {
    let _ = env_logger::builder().is_test(true).try_init();

    let code = compile_text(SUM, 0);
    let work = run(&code, &[2, 3]);
    assert_eq!(work[2], 5);
    assert_eq!(&work[..2], &[2, 3]);
}

#[test]
fn test_sum_tiles_use_two_registers() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let table = tiles::table().unwrap();
    let (mut tree, roots) = parse_expr(SUM).unwrap();
    let tiling = Tiler::new(table).tile(&mut tree, &roots).unwrap();
    let mut state = CompilerState::new(0, LOCALS_SIZE);
    let mut list = build_tile_list(&arena, table, &mut tree, &roots, &tiling, &mut state).unwrap();
    let summary = allocate_registers(
        &mut list,
        &arena,
        CallConv::SysV.assigner().as_mut(),
        &mut state,
        &session,
    )
    .unwrap();

    let ops: Vec<_> = list.iter().map(|t| t.op).collect();
    assert_eq!(
        ops,
        vec![TileOp::LoadLocal, TileOp::LoadLocal, TileOp::Add, TileOp::StoreLocal]
    );
    let a = list.items[0].result.unwrap().reg.unwrap();
    let b = list.items[1].result.unwrap().reg.unwrap();
    assert_ne!(a, b);
    assert_eq!(summary.spills, 0);
}

#[test]
fn test_when_guards_store() {
    let _ = env_logger::builder().is_test(true).try_init();

    let code = compile_text(
        "(when (lt (load (addr (local) 0) 8) (const 10 8))
               (store (addr (local) 8) (const 1 8) 8))",
        0,
    );
    assert_eq!(run(&code, &[3])[1], 1);
    assert_eq!(run(&code, &[20])[1], 0);
}

#[test]
fn test_narrow_compare_matches_same_size_constant() {
    let _ = env_logger::builder().is_test(true).try_init();

    let code = compile_text(
        "(store (addr (local) 0) (const -1 4) 4)
         (when (eq (load (addr (local) 0) 4) (const -1 4))
               (store (addr (local) 8) (const 1 8) 8))
         (when (lt (load (addr (local) 0) 4) (const 0 4))
               (store (addr (local) 16) (const 1 8) 8))",
        0,
    );
    let work = run(&code, &[]);
    assert_eq!(work[0] as u64 & 0xffff_ffff, 0xffff_ffff);
    assert_eq!(work[1], 1);
    assert_eq!(work[2], 1);
}

#[test]
fn test_if_value_picks_branch() {
    let _ = env_logger::builder().is_test(true).try_init();

    let code = compile_text(
        "(store (addr (local) 16)
                (if (all (nz (load (addr (local) 0) 8)) (nz (load (addr (local) 8) 8)))
                    (const 100 8)
                    (const 200 8))
                8)",
        0,
    );
    assert_eq!(run(&code, &[1, 1])[2], 100);
    assert_eq!(run(&code, &[1, 0])[2], 200);
    assert_eq!(run(&code, &[0, 1])[2], 200);
}

extern "C" fn triple(value: i64) -> i64 {
    value * 3
}

extern "C" fn store_sum(dst: *mut i64, a: i64, b: i64) {
    unsafe { *dst = a + b };
}

#[test]
fn test_c_calls() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut builder = ExprBuilder::new();
    let call = builder
        .call_c(triple as usize, &[CallArg::Local(0)], RetKind::Int)
        .unwrap();
    let store = builder.store_local(8, call).unwrap();
    builder.root(store);
    let callv = builder
        .call_c(
            store_sum as usize,
            &[CallArg::LocalAddr(16), CallArg::Local(0), CallArg::Literal(40)],
            RetKind::Void,
        )
        .unwrap();
    builder.root(callv);
    let mut graph = JitGraph::from_builder("calls", builder, 0).unwrap();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let code = compiler().try_compile(&mut graph, &session).unwrap();
    let work = run(&code, &[7]);
    assert_eq!(work[1], 21);
    assert_eq!(work[2], 47);
}

#[test]
fn test_if_with_call_branch() {
    let _ = env_logger::builder().is_test(true).try_init();

    let code = compile_text(
        &format!(
            "(store (addr (local) 16)
                    (if (all (nz (load (addr (local) 0) 8)) (lt (load (addr (local) 8) 8) (const 10 8)))
                        (call (const_ptr {}) (arglist (carg (load (addr (local) 8) 8) 0)) 1)
                        (const -1 8))
                    8)",
            triple as usize
        ),
        0,
    );
    assert_eq!(run(&code, &[1, 4])[2], 12);
    assert_eq!(run(&code, &[1, 40])[2], -1);
    assert_eq!(run(&code, &[0, 4])[2], -1);
}

#[test]
fn test_resume_at_label() {
    let _ = env_logger::builder().is_test(true).try_init();

    let code = compile_text(
        "(store (addr (local) 0) (const 1 8) 8)
         (mark 0)
         (store (addr (local) 8) (const 2 8) 8)",
        1,
    );
    let mut work = vec![0i64; WORK_WORDS];
    let mut frame = Frame {
        padding: 0,
        work: work.as_mut_ptr(),
    };
    let mut tc = ThreadContext {
        padding: [0; 2],
        cur_frame: &mut frame,
    };
    unsafe {
        code.invoke(&mut tc as *mut ThreadContext as *mut c_void, std::ptr::null_mut(), Some(0))
            .unwrap();
    }
    assert_eq!(&work[..2], &[0, 2]);
}

#[test]
fn test_unsupported_tree_yields_no_code() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut builder = ExprBuilder::new();
    let local = builder.local().unwrap();
    let a = builder.node(ExprOp::Nz, &[local], &[]).unwrap();
    let b = builder.node(ExprOp::Zr, &[local], &[]).unwrap();
    let any = builder.node(ExprOp::Any, &[a, b], &[]).unwrap();
    let value = builder.node(ExprOp::Flagval, &[any], &[]).unwrap();
    let store = builder.store_local(0, value).unwrap();
    builder.root(store);
    let mut graph = JitGraph::from_builder("flagval-any", builder, 0).unwrap();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    assert!(compiler().compile(&mut graph, &session).is_none());
    assert_eq!(session.stats().trees_rejected, 1);
}
