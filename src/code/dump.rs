//! Debug artifacts for generated code: raw bytes, a relocatable ELF
//! object wrapping them, a map from dump file to function name, and
//! symbol lines for `perf`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

use crate::core::error::{JitError, JitResult};

pub const MAP_FILE: &str = "jit-code.map";

pub fn dump_file_stem(seq: usize) -> String {
    format!("jit-code-{:04}", seq)
}

/// Wrap `code` in an ELF relocatable with one global function symbol.
pub fn elf_object(symbol: &str, code: &[u8]) -> JitResult<Vec<u8>> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, code, 16);
    obj.add_symbol(Symbol {
        name: symbol.as_bytes().to_vec(),
        value: offset,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    obj.write()
        .map_err(|e| JitError::Io(std::io::Error::other(format!("writing ELF object: {}", e))))
}

/// Write `<stem>.bin` and `<stem>.o` into `dir` and append the
/// `file<TAB>name` line to the map file. Returns the `.bin` path.
pub fn write_dump(dir: &Path, seq: usize, name: &str, code: &[u8]) -> JitResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let stem = dump_file_stem(seq);
    let bin = dir.join(format!("{}.bin", stem));
    fs::write(&bin, code)?;
    let symbol = if name.is_empty() { stem.as_str() } else { name };
    fs::write(dir.join(format!("{}.o", stem)), elf_object(symbol, code)?)?;

    let mut map = OpenOptions::new().create(true).append(true).open(dir.join(MAP_FILE))?;
    writeln!(map, "{}.bin\t{}", stem, name)?;
    log::debug!("dumped {} bytes of {} to {}", code.len(), name, bin.display());
    Ok(bin)
}

pub fn perf_map_line(address: usize, size: usize, name: &str) -> String {
    format!("{:x} {:x} {}", address, size, name)
}

pub fn perf_map_path() -> PathBuf {
    PathBuf::from(format!("/tmp/perf-{}.map", std::process::id()))
}

pub fn append_perf_map(line: &str) -> JitResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(perf_map_path())?;
    writeln!(file, "{}", line)?;
    Ok(())
}
