// This module generates the bottom-up tiling automaton from a target's rule list. Rules
// are written as nested patterns over expression operators whose leaves are symbols
// (reg, num, flag, ...). Generation first flattens nested subpatterns into generated
// symbols, so every flattened rule matches one operator with at most two child symbols,
// then explores the reachable states to a fixpoint. A state is the set of symbols a node
// can be reduced to, each with the cheapest rule producing it. The result answers two
// questions: lookup(op, left state, right state) for the postorder pass, and
// select(state, symbol) for the preorder pass.

//! Tile table generation.

use hashbrown::HashMap;

use crate::expr::{Arity, ExprOp};

use super::TileOp;

/// Grammar symbol a node can be reduced to.
pub type Sym = u16;

/// Index of a rule in a [`TileTable`].
pub type RuleId = u16;

/// Index of an automaton state.
pub type StateId = u32;

/// Fixed symbols every target shares.
pub mod sym {
    use super::Sym;

    pub const VOID: Sym = 0;
    pub const REG: Sym = 1;
    pub const NUM: Sym = 2;
    pub const FLAG: Sym = 3;
    pub const CARG: Sym = 4;
    pub const ARGS: Sym = 5;
    pub const LABEL: Sym = 6;
    pub(super) const NAMES: [&str; 7] = ["void", "reg", "num", "flag", "carg", "args", "label"];
}

/// Rule pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pat {
    Sym(Sym),
    Node(ExprOp, Vec<Pat>),
}

impl Pat {
    pub fn node(op: ExprOp, kids: Vec<Pat>) -> Pat {
        Pat::Node(op, kids)
    }
}

/// A rule as written by the target.
#[derive(Debug, Clone)]
pub struct RuleDef {
    pub name: &'static str,
    pub sym: Sym,
    pub pat: Pat,
    pub cost: u32,
    pub emit: Option<TileOp>,
}

/// A flattened rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: &'static str,
    pub sym: Sym,
    pub op: ExprOp,
    pub left: Option<Sym>,
    pub right: Option<Sym>,
    pub cost: u32,
    pub emit: Option<TileOp>,
    /// Nested pattern, kept for operand extraction. None for generated rules.
    pub pattern: Option<Pat>,
}

impl Rule {
    pub fn is_generated(&self) -> bool {
        self.pattern.is_none()
    }
}

/// Number of child states an operator is looked up with.
pub fn table_arity(op: ExprOp) -> usize {
    use ExprOp::*;
    match op {
        Const | ConstPtr | ConstLarge | ConstNum | Tc | Cu | Frame | Local | Stack | Label | Mark => 0,
        Load | LoadNum | Addr | Not | Copy | Scast | Ucast | Nz | Zr | Flagval | All | Any | Arglist | Branch
        | Guard | Discard | Carg => 1,
        _ => 2,
    }
}

const NONE: StateId = StateId::MAX;

type State = Vec<(Sym, RuleId)>;

/// Generated tiling automaton.
#[derive(Debug)]
pub struct TileTable {
    rules: Vec<Rule>,
    sym_names: Vec<String>,
    states: Vec<State>,
    best: Vec<RuleId>,
    lookup: HashMap<(ExprOp, StateId, StateId), StateId>,
}

struct Generator {
    rules: Vec<Rule>,
    sym_names: Vec<String>,
    generated: HashMap<Pat, Sym>,
}

impl Generator {
    fn flatten_kid(&mut self, pat: &Pat) -> Result<Sym, String> {
        match pat {
            Pat::Sym(s) => Ok(*s),
            Pat::Node(..) => {
                if let Some(&s) = self.generated.get(pat) {
                    return Ok(s);
                }
                let s = self.sym_names.len() as Sym;
                self.sym_names.push(format!("g{}", s));
                self.generated.insert(pat.clone(), s);
                self.flatten(pat, s, "gen", 0, None, false)?;
                Ok(s)
            }
        }
    }

    fn flatten(
        &mut self,
        pat: &Pat,
        sym: Sym,
        name: &'static str,
        cost: u32,
        emit: Option<TileOp>,
        top: bool,
    ) -> Result<(), String> {
        let Pat::Node(op, kids) = pat else {
            return Err(format!("rule {} is a bare symbol", name));
        };
        let mut syms = Vec::with_capacity(kids.len());
        for kid in kids {
            syms.push(self.flatten_kid(kid)?);
        }
        let (left, right) = match (table_arity(*op), syms.as_slice()) {
            (0, []) => (None, None),
            // empty variadic list
            (1, []) if op.info().arity == Arity::Variadic => (None, None),
            (1, [l]) => (Some(*l), None),
            (2, [l, r]) => (Some(*l), Some(*r)),
            // if/ifv: condition, and both branches reduced alike
            (2, [c, a, b]) if a == b && matches!(op, ExprOp::If | ExprOp::Ifv) => (Some(*c), Some(*a)),
            _ => return Err(format!("rule {} has a malformed {} pattern", name, op)),
        };
        self.rules.push(Rule {
            name,
            sym,
            op: *op,
            left,
            right,
            cost,
            emit,
            pattern: top.then(|| pat.clone()),
        });
        Ok(())
    }
}

impl TileTable {
    /// Flatten `defs` and compute the automaton.
    pub fn generate(defs: &[RuleDef]) -> Result<TileTable, String> {
        let mut gen = Generator {
            rules: Vec::new(),
            sym_names: sym::NAMES.iter().map(|s| s.to_string()).collect(),
            generated: HashMap::new(),
        };
        for def in defs {
            gen.flatten(&def.pat, def.sym, def.name, def.cost, def.emit, true)?;
        }
        if gen.rules.len() >= RuleId::MAX as usize {
            return Err("too many rules".into());
        }

        let mut by_op: HashMap<ExprOp, Vec<RuleId>> = HashMap::new();
        for (id, rule) in gen.rules.iter().enumerate() {
            by_op.entry(rule.op).or_default().push(id as RuleId);
        }

        let mut table = TileTable {
            rules: gen.rules,
            sym_names: gen.sym_names,
            states: Vec::new(),
            best: Vec::new(),
            lookup: HashMap::new(),
        };
        let mut state_index: HashMap<State, StateId> = HashMap::new();
        let mut tried: hashbrown::HashSet<(ExprOp, StateId, StateId)> = hashbrown::HashSet::new();

        loop {
            let known = table.states.len() as StateId;
            for (&op, rules) in &by_op {
                let pairs: Vec<(StateId, StateId)> = match table_arity(op) {
                    0 => vec![(NONE, NONE)],
                    1 if op.info().arity == Arity::Variadic => std::iter::once((NONE, NONE))
                        .chain((0..known).map(|l| (l, NONE)))
                        // (list so far, next child)
                        .chain((0..known).flat_map(|l| (0..known).map(move |r| (l, r))))
                        .collect(),
                    1 => (0..known).map(|l| (l, NONE)).collect(),
                    _ => (0..known).flat_map(|l| (0..known).map(move |r| (l, r))).collect(),
                };
                for (l, r) in pairs {
                    if !tried.insert((op, l, r)) {
                        continue;
                    }
                    let Some(state) = table.derive(rules, l, r) else {
                        continue;
                    };
                    let id = match state_index.get(&state) {
                        Some(&id) => id,
                        None => {
                            let id = table.states.len() as StateId;
                            let best = table.pick_best(&state);
                            state_index.insert(state.clone(), id);
                            table.states.push(state);
                            table.best.push(best);
                            id
                        }
                    };
                    table.lookup.insert((op, l, r), id);
                }
            }
            if table.states.len() as StateId == known {
                break;
            }
        }
        log::debug!(
            "tile table: {} rules, {} symbols, {} states, {} transitions",
            table.rules.len(),
            table.sym_names.len(),
            table.states.len(),
            table.lookup.len()
        );
        Ok(table)
    }

    fn state_has(&self, state: StateId, sym: Sym) -> bool {
        self.select(state, sym).is_some()
    }

    /// Cheapest rule per symbol among the rules of one operator matching
    /// the given child states. For a variadic operator a pair of real states
    /// extends the list in state `l` by one child in state `r`.
    fn derive(&self, rules: &[RuleId], l: StateId, r: StateId) -> Option<State> {
        let mut per_sym: Vec<(Sym, RuleId)> = Vec::new();
        for &id in rules {
            let rule = &self.rules[id as usize];
            let matches = match (rule.left, rule.right) {
                (None, None) => l == NONE,
                (Some(ls), None) if r == NONE => l != NONE && self.state_has(l, ls),
                (Some(ls), None) => l != NONE && self.select(l, rule.sym) == Some(id) && self.state_has(r, ls),
                (Some(ls), Some(rs)) => l != NONE && r != NONE && self.state_has(l, ls) && self.state_has(r, rs),
                (None, Some(_)) => false,
            };
            if !matches {
                continue;
            }
            match per_sym.iter_mut().find(|(s, _)| *s == rule.sym) {
                Some(entry) => {
                    if rule.cost < self.rules[entry.1 as usize].cost {
                        entry.1 = id;
                    }
                }
                None => per_sym.push((rule.sym, id)),
            }
        }
        if per_sym.is_empty() {
            return None;
        }
        per_sym.sort_unstable();
        Some(per_sym)
    }

    /// Rule a node in this state adopts when nothing above it asks for a
    /// particular symbol.
    fn pick_best(&self, state: &State) -> RuleId {
        state
            .iter()
            .map(|&(_, id)| id)
            .min_by_key(|&id| {
                let rule = &self.rules[id as usize];
                (rule.is_generated(), rule.sym != sym::VOID, rule.cost, id)
            })
            .unwrap_or_default()
    }

    /// Transition for `op` with the given child states.
    pub fn lookup(&self, op: ExprOp, left: Option<StateId>, right: Option<StateId>) -> Option<(StateId, RuleId)> {
        let key = (op, left.unwrap_or(NONE), right.unwrap_or(NONE));
        self.lookup
            .get(&key)
            .map(|&state| (state, self.best[state as usize]))
    }

    /// Rule a root in `state` is started on.
    pub fn best_rule(&self, state: StateId) -> Option<RuleId> {
        self.best.get(state as usize).copied()
    }

    /// Rule reducing a node in `state` to `sym`.
    pub fn select(&self, state: StateId, sym: Sym) -> Option<RuleId> {
        let entries = self.states.get(state as usize)?;
        entries
            .binary_search_by_key(&sym, |&(s, _)| s)
            .ok()
            .map(|i| entries[i].1)
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id as usize]
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn sym_name(&self, sym: Sym) -> &str {
        self.sym_names.get(sym as usize).map_or("?", String::as_str)
    }

    /// Symbols derivable in `state`.
    pub fn state_syms(&self, state: StateId) -> impl Iterator<Item = Sym> + '_ {
        self.states
            .get(state as usize)
            .into_iter()
            .flat_map(|entries| entries.iter().map(|&(s, _)| s))
    }
}
