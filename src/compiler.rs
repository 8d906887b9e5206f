// This module drives one compilation from a JitGraph to a published CodeObject. The stages
// run strictly in order, each finishing before the next starts: label and tree validation,
// the optional tree rewrites, tiling (which may append duplicate nodes to the graph's tree),
// tile list construction, register allocation, encoding through the x86-64 emitter, table
// resolution against the emitted label offsets and finally mapping the code. Any failure
// abandons the compilation as a whole; JitCompiler::compile turns it into a "no code" result
// and a log line, while try_compile hands the error to callers that want it. A memory
// mapping failure flips a process-wide kill switch so later compilations are refused
// outright. Dumps and perf map lines are written after a successful compilation and only
// logged on failure.

//! Compilation driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::code::dump::append_perf_map;
use crate::code::{memory, CodeObject, CodeTables};
use crate::core::config::JitConfig;
use crate::core::error::{ErrorClass, JitError, JitResult};
use crate::core::session::{CompilationSession, CompilerState};
use crate::emit::emit_function;
use crate::expr::optimize::optimize;
use crate::graph::JitGraph;
use crate::regalloc::allocate_registers;
use crate::tile::{build_tile_list, Tiler};
use crate::x64::calling_convention::CallConv;
use crate::x64::encoder::X64Emitter;
use crate::x64::tiles;

static JIT_DISABLED: AtomicBool = AtomicBool::new(false);

/// Refuse every further compilation in this process.
pub fn disable_jit() {
    if !JIT_DISABLED.swap(true, Ordering::AcqRel) {
        log::error!("JIT compilation disabled for the rest of the process");
    }
}

pub fn jit_disabled() -> bool {
    JIT_DISABLED.load(Ordering::Acquire) || memory::mapping_failed()
}

pub struct JitCompiler {
    config: JitConfig,
    call_conv: CallConv,
}

impl JitCompiler {
    pub fn new(config: JitConfig) -> Self {
        Self {
            config,
            call_conv: CallConv::host(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(JitConfig::from_env())
    }

    /// Generate code for `call_conv` instead of the host convention.
    pub fn with_call_conv(mut self, call_conv: CallConv) -> Self {
        self.call_conv = call_conv;
        self
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.disabled && !jit_disabled()
    }

    /// Compile `graph`, or return `None` when no code can be produced.
    pub fn compile(&self, graph: &mut JitGraph, session: &CompilationSession<'_>) -> Option<Arc<CodeObject>> {
        match self.try_compile(graph, session) {
            Ok(code) => Some(code),
            Err(JitError::Disabled) => {
                log::debug!("JIT disabled, not compiling {}", graph.name);
                None
            }
            Err(err) => {
                session.record_rejected();
                match err.class() {
                    ErrorClass::Environment => {
                        log::error!("compiling {} failed: {}", graph.name, err);
                        disable_jit();
                    }
                    ErrorClass::Internal | ErrorClass::Recoverable => {
                        log::warn!("not compiling {}: {}", graph.name, err)
                    }
                }
                None
            }
        }
    }

    /// Compile `graph`, reporting why no code was produced.
    pub fn try_compile(&self, graph: &mut JitGraph, session: &CompilationSession<'_>) -> JitResult<Arc<CodeObject>> {
        if !self.is_enabled() {
            return Err(JitError::Disabled);
        }
        graph.check_labels()?;
        graph.tree.check(&graph.roots)?;
        if self.config.optimize {
            let rewrites = optimize(&mut graph.tree, &mut graph.roots)?;
            log::debug!("{}: {} tree rewrites", graph.name, rewrites);
        }
        if self.config.dump_trees {
            log::debug!("expression tree of {}:\n{}", graph.name, graph.tree.dump(&graph.roots));
        }

        let table = tiles::table()?;
        let tiling = Tiler::new(table).tile(&mut graph.tree, &graph.roots)?;
        session.record_duplicates(tiling.duplicates);

        let arena = session.arena();
        let mut state = CompilerState::new(graph.num_labels, self.config.layout.locals_size);
        let mut list = build_tile_list(arena, table, &mut graph.tree, &graph.roots, &tiling, &mut state)?;
        let mut assigner = self.call_conv.assigner();
        let summary = allocate_registers(&mut list, arena, assigner.as_mut(), &mut state, session)?;
        log::debug!(
            "{}: {} tiles, {} spills, {} reloads, {} stack arguments",
            graph.name,
            list.len(),
            summary.spills,
            summary.reloads,
            summary.stack_args
        );
        if self.config.dump_trees {
            log::debug!("tile list of {}:\n{}", graph.name, list);
        }

        let mut emitter = X64Emitter::new(self.call_conv.info(), self.config.layout)?;
        let code = emit_function(&mut emitter, &list, session)?;
        let tables = CodeTables::resolve(graph, &code)?;
        let object = CodeObject::new(
            graph.name.clone(),
            &code,
            tables,
            state.spill.size(),
            self.config.register_unwind,
        )?;
        session.record_compiled(&graph.name, object.size());

        if let Some(dir) = &self.config.dump_dir {
            if let Err(err) = object.dump_code(dir) {
                log::warn!("could not dump {}: {}", graph.name, err);
            }
        }
        if self.config.perf_map {
            if let Err(err) = append_perf_map(&object.perf_map_line()) {
                log::warn!("could not write perf map line for {}: {}", graph.name, err);
            }
        }
        Ok(Arc::new(object))
    }
}
