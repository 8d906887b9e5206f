//! Short-circuit conditions, checked both on the tile list and by running
//! the generated code.

use bumpalo::Bump;
use exprjit::core::CompilerState;
use exprjit::expr::parse_expr;
use exprjit::tile::{build_tile_list, Tile, TileOp, Tiler};
use exprjit::x64::tiles;

fn tile_ops(text: &str) -> Vec<Tile> {
    let arena = Bump::new();
    let table = tiles::table().unwrap();
    let (mut tree, roots) = parse_expr(text).unwrap();
    let tiling = Tiler::new(table).tile(&mut tree, &roots).unwrap();
    let mut state = CompilerState::new(0, 0);
    let list = build_tile_list(&arena, table, &mut tree, &roots, &tiling, &mut state).unwrap();
    list.iter().cloned().collect()
}

fn branches(tiles: &[Tile]) -> Vec<&Tile> {
    tiles
        .iter()
        .filter(|t| matches!(t.op, TileOp::Jump | TileOp::CondJump))
        .collect()
}

#[test]
fn test_statically_false_all_emits_single_exit_jump() {
    let _ = env_logger::builder().is_test(true).try_init();

    let tiles = tile_ops(
        "(when (all (zr (const 1 8)) (nz (load (addr (local) 0) 8)) (nz (load (addr (local) 8) 8)))
               (store (addr (local) 16) (const 1 8) 8))",
    );
    let jumps = branches(&tiles);
    assert_eq!(jumps.len(), 1);
    assert_eq!(jumps[0].op, TileOp::Jump);
    assert!(!tiles.iter().any(|t| t.op == TileOp::LoadLocal));
}

#[test]
fn test_all_branches_to_end_on_each_failure() {
    let _ = env_logger::builder().is_test(true).try_init();

    let tiles = tile_ops(
        "(when (all (nz (load (addr (local) 0) 8)) (lt (load (addr (local) 8) 8) (const 3 8)))
               (store (addr (local) 16) (const 1 8) 8))",
    );
    let jumps = branches(&tiles);
    assert_eq!(jumps.len(), 2);
    assert!(jumps.iter().all(|t| t.op == TileOp::CondJump));
    assert_eq!(jumps[0].label, jumps[1].label);
    assert_eq!(tiles.last().unwrap().op, TileOp::Label);
    assert_eq!(tiles.last().unwrap().label, jumps[0].label);
}

#[test]
fn test_any_jumps_to_body_on_success() {
    let _ = env_logger::builder().is_test(true).try_init();

    let tiles = tile_ops(
        "(when (any (nz (load (addr (local) 0) 8)) (nz (load (addr (local) 8) 8)))
               (store (addr (local) 16) (const 1 8) 8))",
    );
    let jumps = branches(&tiles);
    // each success -> body; falling out of the last child -> end
    assert_eq!(jumps.len(), 3);
    assert_eq!(jumps[0].op, TileOp::CondJump);
    assert_eq!(jumps[0].label, jumps[1].label);
    assert_eq!(jumps[2].op, TileOp::Jump);
    assert_eq!(jumps[2].label, tiles.last().unwrap().label);
    let body = tiles
        .iter()
        .position(|t| t.op == TileOp::Label && t.label == jumps[0].label)
        .unwrap();
    assert_eq!(tiles[body + 1].op, TileOp::Const);
}

#[cfg(all(unix, target_arch = "x86_64"))]
mod run {
    use std::ffi::c_void;

    use bumpalo::Bump;
    use exprjit::compiler::JitCompiler;
    use exprjit::core::{CompilationSession, InterpLayout, JitConfig};
    use exprjit::expr::parse_expr;
    use exprjit::graph::JitGraph;

    #[repr(C)]
    struct Frame {
        work: *mut i64,
    }

    #[repr(C)]
    struct ThreadContext {
        cur_frame: *mut Frame,
    }

    fn eval(text: &str, locals: &[i64]) -> i64 {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let (tree, roots) = parse_expr(text).unwrap();
        let mut graph = JitGraph::new("cond", tree, roots, 0);
        let config = JitConfig::default().with_layout(InterpLayout {
            tc_cur_frame: 0,
            frame_work: 0,
            locals_size: 64,
        });
        let code = JitCompiler::new(config).try_compile(&mut graph, &session).unwrap();

        let mut work = vec![0i64; 32];
        work[..locals.len()].copy_from_slice(locals);
        let mut frame = Frame { work: work.as_mut_ptr() };
        let mut tc = ThreadContext { cur_frame: &mut frame };
        unsafe {
            code.invoke(&mut tc as *mut ThreadContext as *mut c_void, std::ptr::null_mut(), None)
                .unwrap();
        }
        work[7]
    }

    const NESTED: &str = "(when (all (nz (load (addr (local) 0) 8))
                                    (any (zr (load (addr (local) 8) 8))
                                         (gt (load (addr (local) 16) 8) (const 10 8))))
                              (store (addr (local) 56) (const 1 8) 8))";

    #[test]
    fn test_nested_any_inside_all() {
        let _ = env_logger::builder().is_test(true).try_init();

        assert_eq!(eval(NESTED, &[1, 0, 0]), 1);
        assert_eq!(eval(NESTED, &[1, 5, 11]), 1);
        assert_eq!(eval(NESTED, &[1, 5, 10]), 0);
        assert_eq!(eval(NESTED, &[0, 0, 11]), 0);
    }

    #[test]
    fn test_any_runs_body_on_first_success() {
        let _ = env_logger::builder().is_test(true).try_init();

        let text = "(when (any (nz (load (addr (local) 0) 8)) (eq (load (addr (local) 8) 8) (const 4 8)))
                          (store (addr (local) 56) (const 1 8) 8))";
        assert_eq!(eval(text, &[1, 0]), 1);
        assert_eq!(eval(text, &[0, 4]), 1);
        assert_eq!(eval(text, &[0, 3]), 0);
    }

    #[test]
    fn test_flagval_of_comparison() {
        let _ = env_logger::builder().is_test(true).try_init();

        let text = "(store (addr (local) 56) (flagval (le (load (addr (local) 0) 8) (const -2 8))) 8)";
        assert_eq!(eval(text, &[-3]), 1);
        assert_eq!(eval(text, &[-2]), 1);
        assert_eq!(eval(text, &[5]), 0);
    }
}
