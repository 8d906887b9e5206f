//! x86-64 tiling rules.
//!
//! Fused rules are cheaper than the chain of plain rules they replace,
//! so the table prefers them whenever the subtree shape allows.

use std::sync::OnceLock;

use crate::core::error::{JitError, JitResult};
use crate::expr::ExprOp;
use crate::tile::table::sym::{ARGS, CARG, FLAG, LABEL, NUM, REG, VOID};
use crate::tile::{Pat, RuleDef, Sym, TileOp, TileTable};

fn s(sym: Sym) -> Pat {
    Pat::Sym(sym)
}

fn n(op: ExprOp, kids: Vec<Pat>) -> Pat {
    Pat::node(op, kids)
}

fn leaf(op: ExprOp) -> Pat {
    Pat::node(op, Vec::new())
}

fn rule(name: &'static str, sym: Sym, pat: Pat, cost: u32, emit: Option<TileOp>) -> RuleDef {
    RuleDef {
        name,
        sym,
        pat,
        cost,
        emit,
    }
}

fn local_addr() -> Pat {
    n(ExprOp::Addr, vec![leaf(ExprOp::Local)])
}

/// The full rule list.
pub fn rules() -> Vec<RuleDef> {
    use ExprOp as E;
    use TileOp as T;

    let mut rules = vec![
        rule("tc", REG, leaf(E::Tc), 1, Some(T::Tc)),
        rule("cu", REG, leaf(E::Cu), 1, Some(T::Cu)),
        rule("frame", REG, leaf(E::Frame), 1, Some(T::Frame)),
        rule("local", REG, leaf(E::Local), 1, Some(T::Local)),
        rule("stack", REG, leaf(E::Stack), 1, Some(T::Stack)),
        rule("const", REG, leaf(E::Const), 1, Some(T::Const)),
        rule("const_ptr", REG, leaf(E::ConstPtr), 1, Some(T::ConstPtr)),
        rule("const_large", REG, leaf(E::ConstLarge), 2, Some(T::ConstLarge)),
        rule("const_num", NUM, leaf(E::ConstNum), 2, Some(T::ConstNum)),
        rule("label_addr", REG, leaf(E::Label), 1, Some(T::LabelAddr)),
        rule("label", LABEL, leaf(E::Label), 0, None),
        rule("mark", VOID, leaf(E::Mark), 1, Some(T::Mark)),
        // memory
        rule("load_reg", REG, n(E::Load, vec![s(REG)]), 3, Some(T::LoadReg)),
        rule("load_addr", REG, n(E::Load, vec![n(E::Addr, vec![s(REG)])]), 2, Some(T::LoadAddr)),
        rule("load_idx", REG, n(E::Load, vec![n(E::Idx, vec![s(REG), s(REG)])]), 2, Some(T::LoadIdx)),
        rule("load_local", REG, n(E::Load, vec![local_addr()]), 1, Some(T::LoadLocal)),
        rule("load_num", NUM, n(E::LoadNum, vec![s(REG)]), 3, Some(T::LoadNum)),
        rule("load_num_addr", NUM, n(E::LoadNum, vec![n(E::Addr, vec![s(REG)])]), 2, Some(T::LoadNum)),
        rule("store", VOID, n(E::Store, vec![s(REG), s(REG)]), 3, Some(T::Store)),
        rule("store_addr", VOID, n(E::Store, vec![n(E::Addr, vec![s(REG)]), s(REG)]), 2, Some(T::StoreAddr)),
        rule(
            "store_idx",
            VOID,
            n(E::Store, vec![n(E::Idx, vec![s(REG), s(REG)]), s(REG)]),
            2,
            Some(T::StoreIdx),
        ),
        rule("store_local", VOID, n(E::Store, vec![local_addr(), s(REG)]), 1, Some(T::StoreLocal)),
        rule("store_num", VOID, n(E::StoreNum, vec![s(REG), s(NUM)]), 3, Some(T::StoreNum)),
        rule(
            "store_num_addr",
            VOID,
            n(E::StoreNum, vec![n(E::Addr, vec![s(REG)]), s(NUM)]),
            2,
            Some(T::StoreNum),
        ),
        rule("addr", REG, n(E::Addr, vec![s(REG)]), 1, Some(T::Addr)),
        rule("idx", REG, n(E::Idx, vec![s(REG), s(REG)]), 1, Some(T::Idx)),
        // arithmetic
        rule("not", REG, n(E::Not, vec![s(REG)]), 1, Some(T::Not)),
        rule("copy", REG, n(E::Copy, vec![s(REG)]), 1, Some(T::Copy)),
        rule("copy_num", NUM, n(E::Copy, vec![s(NUM)]), 1, Some(T::Copy)),
        rule("scast", REG, n(E::Scast, vec![s(REG)]), 1, Some(T::Scast)),
        rule("ucast", REG, n(E::Ucast, vec![s(REG)]), 1, Some(T::Ucast)),
        // flags
        rule("nz", FLAG, n(E::Nz, vec![s(REG)]), 1, Some(T::Nz)),
        rule("zr", FLAG, n(E::Zr, vec![s(REG)]), 1, Some(T::Zr)),
        rule("nz_and", FLAG, n(E::Nz, vec![n(E::And, vec![s(REG), s(REG)])]), 1, Some(T::NzAnd)),
        rule("zr_and", FLAG, n(E::Zr, vec![n(E::And, vec![s(REG), s(REG)])]), 1, Some(T::NzAnd)),
        rule(
            "nz_addr",
            FLAG,
            n(E::Nz, vec![n(E::Load, vec![n(E::Addr, vec![s(REG)])])]),
            1,
            Some(T::TestAddr),
        ),
        rule(
            "zr_addr",
            FLAG,
            n(E::Zr, vec![n(E::Load, vec![n(E::Addr, vec![s(REG)])])]),
            1,
            Some(T::TestAddr),
        ),
        rule("flagval", REG, n(E::Flagval, vec![s(FLAG)]), 2, Some(T::Flagval)),
        // control
        rule("all", FLAG, n(E::All, vec![s(FLAG)]), 0, None),
        rule("any", FLAG, n(E::Any, vec![s(FLAG)]), 0, None),
        rule("when", VOID, n(E::When, vec![s(FLAG), s(VOID)]), 0, None),
        rule("if", REG, n(E::If, vec![s(FLAG), s(REG), s(REG)]), 0, None),
        rule("if_num", NUM, n(E::If, vec![s(FLAG), s(NUM), s(NUM)]), 0, None),
        rule("ifv", VOID, n(E::Ifv, vec![s(FLAG), s(VOID), s(VOID)]), 0, None),
        rule("do", REG, n(E::Do, vec![s(VOID), s(REG)]), 0, None),
        rule("do_num", NUM, n(E::Do, vec![s(VOID), s(NUM)]), 0, None),
        rule("dov", VOID, n(E::Dov, vec![s(VOID), s(VOID)]), 0, None),
        rule("branch", VOID, n(E::Branch, vec![s(LABEL)]), 1, Some(T::Branch)),
        rule("guard", VOID, n(E::Guard, vec![s(VOID)]), 1, Some(T::Guard)),
        rule("discard", VOID, n(E::Discard, vec![s(REG)]), 0, Some(T::Discard)),
        rule("discard_num", VOID, n(E::Discard, vec![s(NUM)]), 0, Some(T::Discard)),
        // calls
        rule("carg", CARG, n(E::Carg, vec![s(REG)]), 0, None),
        rule("carg_num", CARG, n(E::Carg, vec![s(NUM)]), 0, None),
        rule("arglist", ARGS, n(E::Arglist, vec![s(CARG)]), 0, None),
        rule("arglist_empty", ARGS, n(E::Arglist, vec![]), 0, None),
        rule("call_func", REG, n(E::Call, vec![leaf(E::ConstPtr), s(ARGS)]), 1, Some(T::Call)),
        rule("call", REG, n(E::Call, vec![s(REG), s(ARGS)]), 2, Some(T::Call)),
        rule("call_func_num", NUM, n(E::Call, vec![leaf(E::ConstPtr), s(ARGS)]), 1, Some(T::Call)),
        rule("call_num", NUM, n(E::Call, vec![s(REG), s(ARGS)]), 2, Some(T::Call)),
        rule("callv_func", VOID, n(E::Callv, vec![leaf(E::ConstPtr), s(ARGS)]), 1, Some(T::CallVoid)),
        rule("callv", VOID, n(E::Callv, vec![s(REG), s(ARGS)]), 2, Some(T::CallVoid)),
    ];

    let binary: [(&'static str, &'static str, ExprOp, TileOp, TileOp); 6] = [
        ("add", "add_const", E::Add, T::Add, T::AddConst),
        ("sub", "sub_const", E::Sub, T::Sub, T::SubConst),
        ("mul", "mul_const", E::Mul, T::Mul, T::MulConst),
        ("and", "and_const", E::And, T::And, T::AndConst),
        ("or", "or_const", E::Or, T::Or, T::OrConst),
        ("xor", "xor_const", E::Xor, T::Xor, T::XorConst),
    ];
    for (name, const_name, op, tile, const_tile) in binary {
        rules.push(rule(name, REG, n(op, vec![s(REG), s(REG)]), 2, Some(tile)));
        rules.push(rule(const_name, REG, n(op, vec![s(REG), leaf(E::Const)]), 1, Some(const_tile)));
    }

    let compares: [(&'static str, &'static str, ExprOp); 6] = [
        ("lt", "lt_const", E::Lt),
        ("le", "le_const", E::Le),
        ("eq", "eq_const", E::Eq),
        ("ne", "ne_const", E::Ne),
        ("ge", "ge_const", E::Ge),
        ("gt", "gt_const", E::Gt),
    ];
    for (name, const_name, op) in compares {
        rules.push(rule(name, FLAG, n(op, vec![s(REG), s(REG)]), 2, Some(T::Cmp)));
        rules.push(rule(const_name, FLAG, n(op, vec![s(REG), leaf(E::Const)]), 1, Some(T::CmpConst)));
    }
    rules
}

static TABLE: OnceLock<Result<TileTable, String>> = OnceLock::new();

/// The generated table, built on first use.
pub fn table() -> JitResult<&'static TileTable> {
    TABLE
        .get_or_init(|| TileTable::generate(&rules()))
        .as_ref()
        .map_err(|reason| JitError::Structural {
            reason: format!("tile table generation failed: {}", reason),
        })
}
