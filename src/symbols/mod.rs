//! Symbol files and the central registry that owns them.
//!
//! Mappings and frames refer to symbol files by registry index only; the
//! registry is the single owner and lives for the whole session.

pub mod elf;
pub mod kernel;

use std::ops::{Deref, Range};
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::Mmap;
use rustc_hash::FxHashMap;

/// Section bytes for the unwinder, either a range of the symbol file's
/// mapping or an owned copy (decompressed sections).
#[derive(Clone)]
pub enum SectionData {
    MmapRange(Arc<Mmap>, (usize, usize)),
    Vec(Arc<Vec<u8>>),
}

impl SectionData {
    pub fn new_mmap_range(mmap: Arc<Mmap>, start: u64, size: u64) -> Option<SectionData> {
        let start = usize::try_from(start).ok()?;
        let size = usize::try_from(size).ok()?;
        let end = start.checked_add(size)?;
        if end <= mmap.len() {
            Some(Self::MmapRange(mmap, (start, size)))
        } else {
            None
        }
    }
}

impl Deref for SectionData {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            SectionData::MmapRange(mmap, (start, size)) => &mmap[*start..][..*size],
            SectionData::Vec(vec) => &vec[..],
        }
    }
}

impl std::fmt::Debug for SectionData {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SectionData({} bytes)", self.len())
    }
}

/// Location of a section inside the on-disk file, as the unwind table
/// discovery needs it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionInfo {
    pub vaddr: u64,
    pub size: u64,
    pub file_offset: u64,
}

/// The sections framehop consumes, svma-relative.
#[derive(Debug, Clone, Default)]
pub struct ModuleSectionData {
    pub base_svma: u64,
    pub text_svma: Option<Range<u64>>,
    pub text: Option<SectionData>,
    pub eh_frame_svma: Option<Range<u64>>,
    pub eh_frame: Option<SectionData>,
    pub eh_frame_hdr_svma: Option<Range<u64>>,
    pub eh_frame_hdr: Option<SectionData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolsFileKind {
    Elf,
    Kernel,
    KernelModule,
    /// Anonymous JIT region; symbols are synthesized from the map name.
    JitRegion,
    Unknown,
}

impl SymbolsFileKind {
    pub fn as_u32(self) -> u32 {
        match self {
            SymbolsFileKind::Elf => 0,
            SymbolsFileKind::Kernel => 1,
            SymbolsFileKind::KernelModule => 2,
            SymbolsFileKind::JitRegion => 3,
            SymbolsFileKind::Unknown => 4,
        }
    }

    pub fn from_u32(value: u32) -> SymbolsFileKind {
        match value {
            0 => SymbolsFileKind::Elf,
            1 => SymbolsFileKind::Kernel,
            2 => SymbolsFileKind::KernelModule,
            3 => SymbolsFileKind::JitRegion,
            _ => SymbolsFileKind::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub vaddr: u64,
    pub size: u64,
    pub name: String,
    pub demangled: Option<String>,
}

impl Symbol {
    pub fn display_name(&self) -> &str {
        self.demangled.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug)]
pub struct SymbolsFile {
    pub kind: SymbolsFileKind,
    pub path: String,
    pub build_id: Option<Vec<u8>>,
    pub text_exec_vaddr: u64,
    pub text_exec_file_offset: u64,
    /// Sorted by vaddr ascending.
    pub symbols: Vec<Symbol>,
    pub eh_frame_hdr: Option<SectionInfo>,
    pub eh_frame: Option<SectionInfo>,
    pub arm_exidx: Option<SectionInfo>,
    pub module_sections: Option<ModuleSectionData>,
    /// Which symbols were actually resolved against, so the trace file
    /// carries only those.
    hits: Vec<bool>,
}

impl SymbolsFile {
    pub fn new(kind: SymbolsFileKind, path: String) -> SymbolsFile {
        SymbolsFile {
            kind,
            path,
            build_id: None,
            text_exec_vaddr: 0,
            text_exec_file_offset: 0,
            symbols: Vec::new(),
            eh_frame_hdr: None,
            eh_frame: None,
            arm_exidx: None,
            module_sections: None,
            hits: Vec::new(),
        }
    }

    /// Sort and finalize the symbol table; zero-size symbols get the gap
    /// to their successor as an effective size.
    pub fn finish_symbols(&mut self) {
        self.symbols.sort_by_key(|s| s.vaddr);
        self.symbols.dedup_by_key(|s| s.vaddr);
        for i in 0..self.symbols.len() {
            if self.symbols[i].size == 0 && i + 1 < self.symbols.len() {
                self.symbols[i].size = self.symbols[i + 1].vaddr - self.symbols[i].vaddr;
            }
        }
        self.hits = vec![false; self.symbols.len()];
    }

    /// Binary search for the symbol covering `vaddr`. Returns the index
    /// and whether the address falls inside the symbol's range; a miss
    /// returns the immediately-lesser symbol with `in_range == false`.
    pub fn find_symbol(&self, vaddr: u64) -> Option<(usize, bool)> {
        let upper = self.symbols.partition_point(|s| s.vaddr <= vaddr);
        let index = upper.checked_sub(1)?;
        let symbol = &self.symbols[index];
        let in_range = symbol.size == 0 || vaddr < symbol.vaddr + symbol.size;
        Some((index, in_range))
    }

    pub fn mark_hit(&mut self, symbol_index: usize) {
        if let Some(hit) = self.hits.get_mut(symbol_index) {
            *hit = true;
        }
    }

    pub fn hit_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols
            .iter()
            .zip(&self.hits)
            .filter(|(_, hit)| **hit)
            .map(|(symbol, _)| symbol)
    }

    pub fn any_hits(&self) -> bool {
        self.hits.iter().any(|hit| *hit)
    }
}

/// Map names the runtime treats as opaque JIT code regions rather than
/// on-disk modules. The naming is a heuristic shared with the Android/
/// OpenHarmony runtimes that create these mappings.
pub fn is_opaque_jit_region(map_name: &str) -> bool {
    map_name.starts_with("[anon:ArkTS Code")
        || map_name.starts_with("[anon:JSVM_JIT")
        || map_name.starts_with("[anon:v8")
        || map_name == "[shmm]"
}

pub struct SymbolRegistry {
    files: Vec<SymbolsFile>,
    by_path: FxHashMap<String, usize>,
    search_dirs: Vec<PathBuf>,
}

impl SymbolRegistry {
    pub fn new(search_dirs: Vec<PathBuf>) -> SymbolRegistry {
        SymbolRegistry {
            files: Vec::new(),
            by_path: FxHashMap::default(),
            search_dirs,
        }
    }

    pub fn get(&self, index: usize) -> &SymbolsFile {
        &self.files[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut SymbolsFile {
        &mut self.files[index]
    }

    pub fn files(&self) -> &[SymbolsFile] {
        &self.files
    }

    pub fn index_for_path(&self, path: &str) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    pub fn insert(&mut self, file: SymbolsFile) -> usize {
        let index = self.files.len();
        self.by_path.insert(file.path.clone(), index);
        self.files.push(file);
        index
    }

    /// Load the module at `path`, or return its index if already loaded.
    /// Returns None when the file cannot be found or parsed; the caller
    /// degrades to raw addresses.
    pub fn load_or_get(&mut self, path: &str, expected_build_id: Option<&[u8]>) -> Option<usize> {
        if let Some(index) = self.index_for_path(path) {
            return Some(index);
        }
        if is_opaque_jit_region(path) {
            let mut file = SymbolsFile::new(SymbolsFileKind::JitRegion, path.to_string());
            file.symbols.push(Symbol {
                vaddr: 0,
                size: u64::MAX,
                name: path.to_string(),
                demangled: None,
            });
            file.finish_symbols();
            return Some(self.insert(file));
        }

        let file = match elf::load_symbols_file(path, &self.search_dirs) {
            Ok(file) => file,
            Err(err) => {
                log::debug!("cannot load symbols for {path}: {err}");
                return None;
            }
        };
        if let (Some(expected), Some(actual)) = (expected_build_id, file.build_id.as_deref()) {
            if expected != actual {
                log::warn!(
                    "build id mismatch for {path}: expected {}, file has {}",
                    hex(expected),
                    hex(actual)
                );
                return None;
            }
        }
        Some(self.insert(file))
    }
}

pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with_symbols(symbols: &[(u64, u64, &str)]) -> SymbolsFile {
        let mut file = SymbolsFile::new(SymbolsFileKind::Elf, "/tmp/libtest.so".into());
        for (vaddr, size, name) in symbols {
            file.symbols.push(Symbol {
                vaddr: *vaddr,
                size: *size,
                name: name.to_string(),
                demangled: None,
            });
        }
        file.finish_symbols();
        file
    }

    #[test]
    fn symbols_are_sorted_after_finish() {
        let file = file_with_symbols(&[(0x300, 8, "c"), (0x100, 8, "a"), (0x200, 8, "b")]);
        let vaddrs: Vec<_> = file.symbols.iter().map(|s| s.vaddr).collect();
        assert_eq!(vaddrs, vec![0x100, 0x200, 0x300]);
    }

    #[test]
    fn zero_size_symbols_extend_to_successor() {
        let file = file_with_symbols(&[(0x100, 0, "a"), (0x180, 8, "b")]);
        assert_eq!(file.symbols[0].size, 0x80);
    }

    #[test]
    fn lookup_hits_and_misses() {
        let file = file_with_symbols(&[(0x100, 0x10, "a"), (0x200, 0x10, "b")]);

        let (index, in_range) = file.find_symbol(0x108).unwrap();
        assert_eq!(file.symbols[index].name, "a");
        assert!(in_range);

        // In the gap: immediately-lesser symbol, flagged out of range.
        let (index, in_range) = file.find_symbol(0x150).unwrap();
        assert_eq!(file.symbols[index].name, "a");
        assert!(!in_range);

        // Before the first symbol: no result at all.
        assert!(file.find_symbol(0x50).is_none());

        let (index, in_range) = file.find_symbol(0x20f).unwrap();
        assert_eq!(file.symbols[index].name, "b");
        assert!(in_range);
    }

    #[test]
    fn jit_regions_synthesize_an_echo_symbol() {
        let mut registry = SymbolRegistry::new(Vec::new());
        let index = registry
            .load_or_get("[anon:ArkTS Code:libark.so]", None)
            .unwrap();
        let file = registry.get(index);
        assert_eq!(file.kind, SymbolsFileKind::JitRegion);
        let (sym, in_range) = file.find_symbol(0x12345).unwrap();
        assert!(in_range);
        assert_eq!(file.symbols[sym].name, "[anon:ArkTS Code:libark.so]");
    }

    #[test]
    fn hex_round_trip() {
        let id = vec![0xde, 0xad, 0xbe, 0xef];
        assert_eq!(hex(&id), "deadbeef");
        assert_eq!(from_hex("deadbeef").unwrap(), id);
        assert!(from_hex("abc").is_none());
    }

    #[test]
    fn hit_tracking() {
        let mut file = file_with_symbols(&[(0x100, 0x10, "a"), (0x200, 0x10, "b")]);
        assert!(!file.any_hits());
        file.mark_hit(1);
        assert!(file.any_hits());
        let hits: Vec<_> = file.hit_symbols().map(|s| s.name.clone()).collect();
        assert_eq!(hits, vec!["b"]);
    }
}
