// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns a reference to the arena every per-compilation scratch structure
// (tile lists, pending inserts) is allocated from, and collects SessionStats across the
// compilations run through it: trees compiled and rejected, nodes duplicated by the tiler,
// tiles emitted per rule, spills and reloads generated and total code size. CompilerState
// is the small mutable state one compilation owns exclusively: the spill memory with its
// per-class free lists and the counter handing out compiler-internal label ids. Both are
// dropped after code emission, whether the compilation succeeded or not.

//! Arena-based compilation session management.
//!
//! All per-compilation scratch data is allocated from the session arena and
//! shares its lifetime.

use bumpalo::Bump;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use super::spill::SpillMemory;

/// Mutable state of one compilation.
#[derive(Debug)]
pub struct CompilerState {
    pub spill: SpillMemory,
    next_label: u32,
}

impl CompilerState {
    /// Create state for a graph whose producer already uses labels
    /// `0..num_labels`; spill slots start at `spill_base`.
    pub fn new(num_labels: u32, spill_base: i32) -> Self {
        Self {
            spill: SpillMemory::new(spill_base),
            next_label: num_labels,
        }
    }

    /// Hand out a fresh compiler-internal label id.
    pub fn next_label(&mut self) -> u32 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    /// Total number of labels, producer and internal.
    pub fn label_count(&self) -> u32 {
        self.next_label
    }
}

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate an object in the session arena.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    pub fn record_compiled(&self, name: &str, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.trees_compiled += 1;
        stats.total_code_size += code_size;
        if stats.largest_code_size < code_size {
            stats.largest_code_size = code_size;
            stats.largest_name = name.to_string();
        }
    }

    pub fn record_rejected(&self) {
        self.stats.borrow_mut().trees_rejected += 1;
    }

    pub fn record_tile(&self, rule: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.tiles_emitted += 1;
        *stats.tile_counts.entry(rule.to_string()).or_insert(0) += 1;
    }

    pub fn record_duplicates(&self, count: usize) {
        self.stats.borrow_mut().nodes_duplicated += count;
    }

    pub fn record_spill(&self) {
        self.stats.borrow_mut().spills_generated += 1;
    }

    pub fn record_reload(&self) {
        self.stats.borrow_mut().reloads_generated += 1;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub trees_compiled: usize,
    pub trees_rejected: usize,
    pub total_code_size: usize,
    pub largest_code_size: usize,
    pub largest_name: String,
    pub tiles_emitted: usize,
    pub tile_counts: BTreeMap<String, usize>,
    pub nodes_duplicated: usize,
    pub spills_generated: usize,
    pub reloads_generated: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Trees compiled: {}", self.trees_compiled)?;
        writeln!(f, "  Trees rejected: {}", self.trees_rejected)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Tiles emitted: {}", self.tiles_emitted)?;
        writeln!(f, "  Nodes duplicated: {}", self.nodes_duplicated)?;
        writeln!(f, "  Spills generated: {}", self.spills_generated)?;
        writeln!(f, "  Reloads generated: {}", self.reloads_generated)?;

        if !self.largest_name.is_empty() {
            writeln!(
                f,
                "  Largest code object: {} ({} bytes)",
                self.largest_name, self.largest_code_size
            )?;
        }

        if !self.tile_counts.is_empty() {
            writeln!(f, "  Tile breakdown:")?;
            let mut sorted: Vec<_> = self.tile_counts.iter().collect();
            sorted.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
            for (rule, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", rule, count)?;
            }
        }

        Ok(())
    }
}
