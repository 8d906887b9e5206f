// This module holds the final artifact of a compilation. A CodeObject owns the executable
// mapping of one function together with everything the interpreter needs to work with it at
// runtime: the offset of every producer label, the deoptimization points sorted by address,
// the exception handler ranges and the inlined-frame ranges, all resolved to code offsets
// when the object is built so that a label the linker could not resolve never reaches a
// table. Published code objects are immutable and shared through Arc. Frames executing the
// code hold a FrameEntry guard that bumps an atomic frame count; destroy refuses to release
// the mapping while that count is nonzero. Optionally a DWARF unwind record is registered
// for the mapping, and debug dumps and perf map lines can be produced on request.

//! Code objects and their runtime lookup tables.

pub mod dump;
pub mod memory;

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::error::{JitError, JitResult};
use crate::emit::EmittedCode;
use crate::graph::JitGraph;
use crate::x64::unwind::{build_eh_frame, UnwindRegistration};

pub use memory::ExecutableMemory;

static NEXT_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// Entry contract of generated code: thread context, compilation unit and
/// an optional resume address.
pub type EntryFn = unsafe extern "C" fn(tc: *mut c_void, cu: *mut c_void, resume: *const u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptPoint {
    pub offset: u32,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRange {
    pub start: u32,
    pub end: u32,
    /// Where execution continues when the handler is taken.
    pub goto: u32,
    pub handler: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineRange {
    pub start: u32,
    pub end: u32,
    pub inline: u32,
}

/// Code tables resolved to offsets, before the code is mapped.
#[derive(Debug, Clone, Default)]
pub struct CodeTables {
    pub labels: Vec<Option<u32>>,
    pub deopts: Vec<DeoptPoint>,
    pub handlers: Vec<HandlerRange>,
    pub inlines: Vec<InlineRange>,
}

impl CodeTables {
    /// Resolve the graph's tables against emitted label offsets. Every label
    /// a table mentions must have been placed inside the code.
    pub fn resolve(graph: &JitGraph, code: &EmittedCode) -> JitResult<Self> {
        let size = code.bytes.len();
        let offset = |label: u32, what: &str| match code.label_offset(label) {
            Some(off) if (off as usize) < size => Ok(off),
            Some(off) => Err(JitError::link(format!(
                "{} label {} at {} lies outside the code ({} bytes)",
                what, label, off, size
            ))),
            None => Err(JitError::link(format!("{} label {} was never placed", what, label))),
        };

        let mut deopts = graph
            .deopts
            .iter()
            .map(|d| {
                Ok(DeoptPoint {
                    offset: offset(d.label, "deopt")?,
                    index: d.index,
                })
            })
            .collect::<JitResult<Vec<_>>>()?;
        deopts.sort_by_key(|d| (d.offset, d.index));

        let handlers = graph
            .handlers
            .iter()
            .map(|h| {
                Ok(HandlerRange {
                    start: offset(h.start_label, "handler start")?,
                    end: offset(h.end_label, "handler end")?,
                    goto: offset(h.goto_label, "handler goto")?,
                    handler: h.handler,
                })
            })
            .collect::<JitResult<Vec<_>>>()?;

        let inlines = graph
            .inlines
            .iter()
            .map(|i| {
                Ok(InlineRange {
                    start: offset(i.start_label, "inline start")?,
                    end: offset(i.end_label, "inline end")?,
                    inline: i.inline,
                })
            })
            .collect::<JitResult<Vec<_>>>()?;

        // producer labels only; compiler-internal ones are not exposed
        let labels = code.labels.iter().take(graph.num_labels as usize).copied().collect();
        Ok(Self {
            labels,
            deopts,
            handlers,
            inlines,
        })
    }
}

/// Executable code of one compiled graph.
pub struct CodeObject {
    memory: ExecutableMemory,
    name: String,
    seq: usize,
    tables: CodeTables,
    spill_size: usize,
    frames: AtomicUsize,
    unwind: Option<UnwindRegistration>,
}

impl CodeObject {
    /// Map `code` and attach the resolved tables.
    pub fn new(
        name: impl Into<String>,
        code: &EmittedCode,
        tables: CodeTables,
        spill_size: usize,
        register_unwind: bool,
    ) -> JitResult<Self> {
        let memory = ExecutableMemory::new(&code.bytes)?;
        let seq = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let unwind = if register_unwind {
            let eh_frame = build_eh_frame(memory.as_ptr() as u64, memory.len() as u64);
            let registration = UnwindRegistration::register(eh_frame);
            if registration.is_none() {
                log::warn!("native unwind registration is not available on this platform");
            }
            registration
        } else {
            None
        };
        let name = name.into();
        log::info!("code object {} ({}): {} bytes at {:p}", seq, name, memory.len(), memory.as_ptr());
        Ok(Self {
            memory,
            name,
            seq,
            tables,
            spill_size,
            frames: AtomicUsize::new(0),
            unwind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seq(&self) -> usize {
        self.seq
    }

    pub fn entry(&self) -> *const u8 {
        self.memory.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.memory.len()
    }

    pub fn bytes(&self) -> &[u8] {
        self.memory.bytes()
    }

    pub fn spill_size(&self) -> usize {
        self.spill_size
    }

    pub fn tables(&self) -> &CodeTables {
        &self.tables
    }

    pub fn has_unwind_info(&self) -> bool {
        self.unwind.is_some()
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        let start = self.entry() as usize;
        let addr = addr as usize;
        addr >= start && addr < start + self.size()
    }

    fn offset_of(&self, addr: *const u8) -> Option<u32> {
        if self.contains(addr) {
            Some((addr as usize - self.entry() as usize) as u32)
        } else {
            None
        }
    }

    pub fn label_offset(&self, label: u32) -> Option<u32> {
        self.tables.labels.get(label as usize).copied().flatten()
    }

    pub fn label_address(&self, label: u32) -> Option<*const u8> {
        let offset = self.label_offset(label)?;
        // SAFETY: resolved offsets lie inside the mapping.
        Some(unsafe { self.entry().add(offset as usize) })
    }

    /// Deopt index of the point exactly at `addr`.
    pub fn deopt_index_at(&self, addr: *const u8) -> Option<u32> {
        let offset = self.offset_of(addr)?;
        let deopts = &self.tables.deopts;
        let first = deopts.partition_point(|d| d.offset < offset);
        deopts.get(first).filter(|d| d.offset == offset).map(|d| d.index)
    }

    /// Handlers whose range covers `addr`, innermost first.
    pub fn active_handlers(&self, addr: *const u8) -> Vec<HandlerRange> {
        let Some(offset) = self.offset_of(addr) else {
            return Vec::new();
        };
        let mut active: Vec<_> = self
            .tables
            .handlers
            .iter()
            .filter(|h| h.start <= offset && offset <= h.end)
            .copied()
            .collect();
        // stable: equal ranges keep table order
        active.sort_by_key(|h| h.end - h.start);
        active
    }

    /// Inlined frames covering `addr`, in table order.
    pub fn active_inlines(&self, addr: *const u8) -> Vec<InlineRange> {
        let Some(offset) = self.offset_of(addr) else {
            return Vec::new();
        };
        self.tables
            .inlines
            .iter()
            .filter(|i| i.start <= offset && offset <= i.end)
            .copied()
            .collect()
    }

    /// Number of frames currently executing this code.
    pub fn frame_count(&self) -> usize {
        self.frames.load(Ordering::Acquire)
    }

    /// Register a frame running this code until the guard is dropped.
    pub fn enter(self: &Arc<Self>) -> FrameEntry {
        self.frames.fetch_add(1, Ordering::AcqRel);
        FrameEntry {
            code: Arc::clone(self),
        }
    }

    /// Release the code if no frame is executing it and no other owner
    /// holds it; otherwise hand the reference back.
    pub fn destroy(self: Arc<Self>) -> Result<(), Arc<Self>> {
        if self.frame_count() != 0 {
            log::debug!("refusing to destroy {} with {} active frames", self.name, self.frame_count());
            return Err(self);
        }
        match Arc::try_unwrap(self) {
            Ok(code) => {
                log::debug!("destroyed code object {} ({})", code.seq, code.name);
                Ok(())
            }
            Err(shared) => Err(shared),
        }
    }

    /// Run the code from the top, or from `resume` when given.
    ///
    /// # Safety
    /// `tc` and `cu` must point to the interpreter structures described by
    /// the layout the code was compiled with, and every pointer the code
    /// dereferences through them must be valid.
    pub unsafe fn invoke(self: &Arc<Self>, tc: *mut c_void, cu: *mut c_void, resume: Option<u32>) -> JitResult<()> {
        let resume = match resume {
            Some(label) => self
                .label_address(label)
                .ok_or_else(|| JitError::link(format!("resume label {} is not in {}", label, self.name)))?,
            None => std::ptr::null(),
        };
        let _frame = self.enter();
        let entry: EntryFn = std::mem::transmute(self.entry());
        entry(tc, cu, resume);
        Ok(())
    }

    /// Write the raw bytes, an ELF object and a map line into `dir`.
    pub fn dump_code(&self, dir: &Path) -> JitResult<PathBuf> {
        dump::write_dump(dir, self.seq, &self.name, self.bytes())
    }

    pub fn symbol_name(&self) -> String {
        if self.name.is_empty() {
            dump::dump_file_stem(self.seq)
        } else {
            self.name.clone()
        }
    }

    pub fn perf_map_line(&self) -> String {
        dump::perf_map_line(self.entry() as usize, self.size(), &self.symbol_name())
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeObject")
            .field("name", &self.name)
            .field("seq", &self.seq)
            .field("entry", &self.entry())
            .field("size", &self.size())
            .field("frames", &self.frame_count())
            .finish()
    }
}

/// A frame executing a code object.
#[derive(Debug)]
pub struct FrameEntry {
    code: Arc<CodeObject>,
}

impl FrameEntry {
    pub fn code(&self) -> &Arc<CodeObject> {
        &self.code
    }
}

impl Drop for FrameEntry {
    fn drop(&mut self) {
        self.code.frames.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::expr::ExprTree;
    use crate::graph::{DeoptEntry, HandlerEntry, InlineEntry};

    fn graph() -> JitGraph {
        let mut graph = JitGraph::new("tables", ExprTree::new(), Vec::new(), 4);
        graph.deopts = vec![DeoptEntry { index: 9, label: 2 }, DeoptEntry { index: 4, label: 1 }];
        graph.handlers = vec![
            HandlerEntry { start_label: 0, end_label: 3, goto_label: 3, handler: 0 },
            HandlerEntry { start_label: 1, end_label: 2, goto_label: 3, handler: 1 },
        ];
        graph.inlines = vec![InlineEntry { start_label: 1, end_label: 2, inline: 5 }];
        graph
    }

    fn emitted() -> EmittedCode {
        EmittedCode {
            bytes: vec![0x90; 15],
            labels: vec![Some(0), Some(4), Some(8), Some(12), Some(14)],
        }
    }

    fn object() -> Arc<CodeObject> {
        let code = emitted();
        let tables = CodeTables::resolve(&graph(), &code).unwrap();
        Arc::new(CodeObject::new("tables", &code, tables, 0, false).unwrap())
    }

    #[test]
    fn test_resolve_sorts_deopts_and_drops_internal_labels() {
        let tables = CodeTables::resolve(&graph(), &emitted()).unwrap();
        assert_eq!(tables.labels.len(), 4);
        assert_eq!(tables.deopts[0], DeoptPoint { offset: 4, index: 4 });
        assert_eq!(tables.deopts[1], DeoptPoint { offset: 8, index: 9 });
    }

    #[test]
    fn test_unplaced_table_label_fails_to_link() {
        let mut code = emitted();
        code.labels[2] = None;
        let err = CodeTables::resolve(&graph(), &code).unwrap_err();
        assert!(matches!(err, JitError::Link { .. }));
    }

    #[test]
    fn test_label_at_code_end_fails_to_link() {
        let mut code = emitted();
        code.labels[3] = Some(15);
        assert!(CodeTables::resolve(&graph(), &code).is_err());
    }

    #[test]
    fn test_lookups_by_address() {
        let code = object();
        let at = |off: usize| unsafe { code.entry().add(off) };
        assert_eq!(code.label_address(2), Some(at(8)));
        assert_eq!(code.deopt_index_at(at(4)), Some(4));
        assert_eq!(code.deopt_index_at(at(5)), None);

        let handlers = code.active_handlers(at(6));
        assert_eq!(handlers.iter().map(|h| h.handler).collect::<Vec<_>>(), vec![1, 0]);
        assert_eq!(code.active_handlers(at(10)).len(), 1);
        assert_eq!(code.active_inlines(at(8)).len(), 1);
        assert!(code.active_inlines(at(9)).is_empty());

        assert!(code.contains(at(14)));
        assert!(!code.contains(at(15)));
        assert!(code.active_handlers(at(15)).is_empty());
    }

    #[test]
    fn test_destroy_waits_for_frames() {
        let code = object();
        let first = code.enter();
        let second = code.enter();
        assert_eq!(code.frame_count(), 2);
        drop(first);
        assert_eq!(code.frame_count(), 1);
        let code = code.destroy().unwrap_err();
        drop(second);
        assert_eq!(code.frame_count(), 0);
        assert!(code.destroy().is_ok());
    }

    #[test]
    fn test_perf_line_names_function() {
        let code = object();
        let line = code.perf_map_line();
        assert!(line.ends_with(" f tables"), "{}", line);
        assert!(line.starts_with(&format!("{:x} ", code.entry() as usize)));
    }
}
