//! Runtime configuration for the JIT.
//!
//! Settings come from the environment so an embedding VM can toggle
//! dumps and profiler support without recompiling.

use std::env;
use std::path::PathBuf;

/// Offsets into the interpreter's own structures that generated code
/// needs to find its working memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpLayout {
    /// Offset of the current-frame pointer inside the thread context.
    pub tc_cur_frame: i32,
    /// Offset of the work-area pointer inside a frame.
    pub frame_work: i32,
    /// Bytes of local-variable storage at the start of the work area.
    /// Spill slots start right after it.
    pub locals_size: i32,
}

impl Default for InterpLayout {
    fn default() -> Self {
        Self {
            tc_cur_frame: 0,
            frame_work: 0,
            locals_size: 0,
        }
    }
}

/// JIT configuration.
#[derive(Debug, Clone, Default)]
pub struct JitConfig {
    /// Refuse every compilation.
    pub disabled: bool,
    /// Directory receiving raw code dumps.
    pub dump_dir: Option<PathBuf>,
    /// Append symbol lines to `/tmp/perf-<pid>.map`.
    pub perf_map: bool,
    /// Log expression trees and tile lists.
    pub dump_trees: bool,
    /// Register unwind info with the native unwinder.
    pub register_unwind: bool,
    /// Run the tree rewrites before tiling.
    pub optimize: bool,
    pub layout: InterpLayout,
}

fn flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => !v.is_empty() && v != "0",
        Err(_) => false,
    }
}

impl JitConfig {
    /// Read the configuration from `EXPRJIT_*` environment variables.
    pub fn from_env() -> Self {
        let dump_dir = env::var_os("EXPRJIT_DUMP_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let config = Self {
            disabled: flag("EXPRJIT_DISABLE"),
            dump_dir,
            perf_map: flag("EXPRJIT_PERF_MAP"),
            dump_trees: flag("EXPRJIT_DUMP_TREES"),
            register_unwind: flag("EXPRJIT_UNWIND"),
            optimize: true,
            layout: InterpLayout::default(),
        };
        log::debug!("JIT configuration from environment: {:?}", config);
        config
    }

    pub fn with_layout(mut self, layout: InterpLayout) -> Self {
        self.layout = layout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JitConfig::default();
        assert!(!config.disabled);
        assert!(config.dump_dir.is_none());
        assert_eq!(config.layout, InterpLayout::default());
    }

    #[test]
    fn test_with_layout() {
        let layout = InterpLayout {
            tc_cur_frame: 16,
            frame_work: 8,
            locals_size: 64,
        };
        let config = JitConfig::default().with_layout(layout);
        assert_eq!(config.layout.locals_size, 64);
    }
}
