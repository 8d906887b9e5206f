//! Trees that need more registers than the allocator has.

use bumpalo::Bump;
use exprjit::core::{CompilationSession, CompilerState, JitError};
use exprjit::expr::parse_expr;
use exprjit::regalloc::allocate_registers;
use exprjit::tile::{build_tile_list, TileOp, Tiler};
use exprjit::x64::{tiles, CallConv};

const LOCALS_SIZE: i32 = 128;

/// `(add l0 (add l1 (... (add l8 l9))))`: every load is live before the
/// first add executes.
fn deep_sum(count: usize) -> String {
    let load = |i: usize| format!("(load (addr (local) {}) 8)", i * 8);
    let mut text = load(count - 1);
    for i in (0..count - 1).rev() {
        text = format!("(add {} {})", load(i), text);
    }
    format!("(store (addr (local) {}) {} 8)", count * 8, text)
}

#[test]
fn test_pressure_spills_and_reloads() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let table = tiles::table().unwrap();
    let (mut tree, roots) = parse_expr(&deep_sum(12)).unwrap();
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

    assert!(summary.spills >= 1);
    assert!(summary.reloads >= 1);
    assert!(state.spill.size() >= 8);
    // Spill slots live after the locals.
    for tile in list.iter().filter(|t| matches!(t.op, TileOp::Spill | TileOp::Reload)) {
        assert!(tile.args[0] >= LOCALS_SIZE as i64);
    }
    // Every operand ended up in a register.
    for tile in list.iter() {
        assert!(tile.values.iter().all(|v| v.reg.is_some()), "{}", tile);
    }
    assert_eq!(session.stats().spills_generated, summary.spills);
}

#[test]
fn test_too_many_call_arguments() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let args: String = (0..12).map(|i| format!("(carg (const {} 8) 0)", i)).collect();
    let (mut tree, roots) = parse_expr(&format!("(callv (const_ptr 4096) (arglist {}))", args)).unwrap();
    let table = tiles::table().unwrap();
    let tiling = Tiler::new(table).tile(&mut tree, &roots).unwrap();
    let mut state = CompilerState::new(0, 0);
    let mut list = build_tile_list(&arena, table, &mut tree, &roots, &tiling, &mut state).unwrap();
    let err = allocate_registers(
        &mut list,
        &arena,
        CallConv::Win64.assigner().as_mut(),
        &mut state,
        &session,
    )
    .unwrap_err();
    assert!(matches!(err, JitError::Exhausted { .. }));
}

#[cfg(all(unix, target_arch = "x86_64"))]
#[test]
fn test_pressure_code_computes_sum() {
    use std::ffi::c_void;

    use exprjit::compiler::JitCompiler;
    use exprjit::core::{InterpLayout, JitConfig};
    use exprjit::graph::JitGraph;

    let _ = env_logger::builder().is_test(true).try_init();

    #[repr(C)]
    struct Frame {
        work: *mut i64,
    }

    let (tree, roots) = parse_expr(&deep_sum(12)).unwrap();
    let mut graph = JitGraph::new("pressure", tree, roots, 0);
    let config = JitConfig::default().with_layout(InterpLayout {
        tc_cur_frame: 0,
        frame_work: 0,
        locals_size: LOCALS_SIZE,
    });
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let code = JitCompiler::new(config).try_compile(&mut graph, &session).unwrap();

    let mut work: Vec<i64> = (1..=32).collect();
    let mut frame = Frame { work: work.as_mut_ptr() };
    let mut tc: *mut Frame = &mut frame;
    unsafe {
        code.invoke(&mut tc as *mut *mut Frame as *mut c_void, std::ptr::null_mut(), None)
            .unwrap();
    }
    assert_eq!(work[12], (1..=12).sum::<i64>());
    assert!(code.spill_size() >= 8);
}
