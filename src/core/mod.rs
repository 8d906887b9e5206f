// This module gathers the infrastructure every compilation stage shares. session holds the
// bumpalo-backed CompilationSession with its statistics and the per-compilation
// CompilerState (spill memory and the internal label counter). register_file is the
// FREE/ALLOCATED/USED register state machine and spill is the bucketed spill memory it
// evicts into. error defines the JitError taxonomy and config the environment-driven
// JitConfig together with the interpreter layout generated code depends on.

//! Core infrastructure shared by all compilation stages.

pub mod config;
pub mod error;
pub mod register_file;
pub mod session;
pub mod spill;
pub mod test_utils;

pub use config::{InterpLayout, JitConfig};
pub use error::{ErrorClass, JitError, JitResult};
pub use register_file::{AsmReg, RegAllocError, RegBitSet, RegState, RegisterFile};
pub use session::{CompilationSession, CompilerState, SessionStats};
pub use spill::{RegClass, SpillMemory};
