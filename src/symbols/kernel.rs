//! Kernel symbol space: /proc/kallsyms, /proc/modules, and the build id
//! from /sys/kernel/notes.

use object::elf;
use object::read::elf::NoteIterator;
use object::NativeEndian;

use super::{Symbol, SymbolsFile, SymbolsFileKind};
use crate::perf_event::tuning;

pub const KERNEL_MMAP_NAME: &str = "[kernel.kallsyms]";

/// One line of /proc/kallsyms: address, type letter, name, and the
/// owning module for loadable-module symbols.
struct KallsymsEntry<'a> {
    addr: u64,
    name: &'a str,
    module: Option<&'a str>,
}

fn parse_kallsyms_line(line: &str) -> Option<KallsymsEntry> {
    let mut parts = line.split_whitespace();
    let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
    let kind = parts.next()?;
    let name = parts.next()?;
    // Function symbols only; data and absolute symbols never back a pc.
    if !matches!(kind, "t" | "T" | "w" | "W") {
        return None;
    }
    let module = parts.next().map(|m| m.trim_matches(['[', ']']));
    Some(KallsymsEntry { addr, name, module })
}

pub struct KernelSpace {
    pub kernel: Option<KernelFile>,
    pub modules: Vec<KernelFile>,
}

pub struct KernelFile {
    pub start_addr: u64,
    pub end_addr: u64,
    pub symbols_file: SymbolsFile,
}

/// A loadable module from /proc/modules: name, size, load address.
fn parse_proc_modules(text: &str) -> Vec<(String, u64, u64)> {
    let mut out = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else { continue };
        let Some(size) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        // refcount, users, state precede the address.
        let addr = parts
            .rev()
            .find_map(|p| p.strip_prefix("0x").and_then(|h| u64::from_str_radix(h, 16).ok()))
            .unwrap_or(0);
        out.push((name.to_string(), size, addr));
    }
    out
}

pub fn kernel_build_id() -> Option<Vec<u8>> {
    let notes = std::fs::read("/sys/kernel/notes").ok()?;
    build_id_from_notes_section_data(&notes).map(|id| id.to_vec())
}

pub fn build_id_from_notes_section_data(section_data: &[u8]) -> Option<&[u8]> {
    let mut note_iter =
        NoteIterator::<elf::FileHeader64<NativeEndian>>::new(NativeEndian, 4, section_data)
            .ok()?;
    while let Ok(Some(note)) = note_iter.next() {
        if note.name() == elf::ELF_NOTE_GNU && note.n_type(NativeEndian) == elf::NT_GNU_BUILD_ID {
            return Some(note.desc());
        }
    }
    None
}

impl KernelSpace {
    /// Load the kernel's symbol space once per session. With
    /// kptr_restrict in force kallsyms reads as all zeroes and the
    /// kernel space stays empty; samples then degrade to raw addresses.
    pub fn load() -> KernelSpace {
        if !tuning::kernel_pointers_visible() && !tuning::is_root() {
            log::info!("kernel addresses are hidden (kptr_restrict), skipping kallsyms");
            return KernelSpace {
                kernel: None,
                modules: Vec::new(),
            };
        }
        let kallsyms = std::fs::read_to_string("/proc/kallsyms").unwrap_or_default();
        let proc_modules = std::fs::read_to_string("/proc/modules").unwrap_or_default();
        Self::parse(&kallsyms, &proc_modules)
    }

    pub fn parse(kallsyms: &str, proc_modules: &str) -> KernelSpace {
        let mut kernel_symbols: Vec<Symbol> = Vec::new();
        let mut module_symbols: Vec<(String, Vec<Symbol>)> = Vec::new();

        for entry in kallsyms.lines().filter_map(parse_kallsyms_line) {
            if entry.addr == 0 {
                // kptr_restrict zeroes the column; nothing to resolve.
                continue;
            }
            let symbol = Symbol {
                vaddr: entry.addr,
                size: 0,
                name: entry.name.to_string(),
                demangled: None,
            };
            match entry.module {
                Some(module) => {
                    match module_symbols.iter_mut().find(|(name, _)| name == module) {
                        Some((_, symbols)) => symbols.push(symbol),
                        None => module_symbols.push((module.to_string(), vec![symbol])),
                    }
                }
                None => kernel_symbols.push(symbol),
            }
        }

        let kernel = if kernel_symbols.is_empty() {
            None
        } else {
            let mut file = SymbolsFile::new(SymbolsFileKind::Kernel, KERNEL_MMAP_NAME.into());
            file.symbols = kernel_symbols;
            file.build_id = kernel_build_id();
            file.finish_symbols();
            let start_addr = file.symbols.first().map_or(0, |s| s.vaddr);
            let end_addr = file
                .symbols
                .last()
                .map_or(start_addr, |s| s.vaddr + s.size.max(1));
            // The symbolization transform is the identity for kernel
            // addresses: text vaddr == mapping start, file offset 0.
            file.text_exec_vaddr = start_addr;
            Some(KernelFile {
                start_addr,
                end_addr,
                symbols_file: file,
            })
        };

        let module_ranges = parse_proc_modules(proc_modules);
        let mut modules = Vec::new();
        for (name, symbols) in module_symbols {
            let mut file =
                SymbolsFile::new(SymbolsFileKind::KernelModule, format!("[{name}]"));
            file.symbols = symbols;
            file.finish_symbols();
            let (start_addr, end_addr) = match module_ranges
                .iter()
                .find(|(range_name, _, _)| *range_name == name)
            {
                Some((_, size, addr)) if *addr != 0 => (*addr, *addr + *size),
                _ => {
                    let start = file.symbols.first().map_or(0, |s| s.vaddr);
                    let end = file
                        .symbols
                        .last()
                        .map_or(start, |s| s.vaddr + s.size.max(1));
                    (start, end)
                }
            };
            file.text_exec_vaddr = start_addr;
            modules.push(KernelFile {
                start_addr,
                end_addr,
                symbols_file: file,
            });
        }

        KernelSpace { kernel, modules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KALLSYMS: &str = "\
ffff8000081e0000 T _text
ffff8000081f0000 t irq_handler_entry
ffff8000081f0060 T do_sys_open
ffff8000081f00e0 D some_data_symbol
ffff800001717000 t tls_get_info_size\t[tls]
ffff800001717020 t tls_update\t[tls]
";

    const MODULES: &str = "tls 20480 0 - Live 0xffff800001717000\n";

    #[test]
    fn splits_kernel_and_module_spaces() {
        let space = KernelSpace::parse(KALLSYMS, MODULES);
        let kernel = space.kernel.as_ref().unwrap();
        assert_eq!(kernel.start_addr, 0xffff8000081e0000);
        assert_eq!(kernel.symbols_file.symbols.len(), 3);

        assert_eq!(space.modules.len(), 1);
        let module = &space.modules[0];
        assert_eq!(module.symbols_file.path, "[tls]");
        assert_eq!(module.start_addr, 0xffff800001717000);
        assert_eq!(module.end_addr, 0xffff800001717000 + 20480);
    }

    #[test]
    fn data_symbols_are_skipped() {
        let space = KernelSpace::parse(KALLSYMS, "");
        let kernel = space.kernel.unwrap();
        assert!(kernel
            .symbols_file
            .symbols
            .iter()
            .all(|s| s.name != "some_data_symbol"));
    }

    #[test]
    fn kernel_symbol_lookup_is_identity_based() {
        let space = KernelSpace::parse(KALLSYMS, "");
        let kernel = space.kernel.unwrap();
        let (index, in_range) = kernel
            .symbols_file
            .find_symbol(0xffff8000081f0070)
            .unwrap();
        assert!(in_range);
        assert_eq!(kernel.symbols_file.symbols[index].name, "do_sys_open");
    }

    #[test]
    fn zeroed_kallsyms_yields_no_kernel() {
        let zeroed = "0000000000000000 T _text\n0000000000000000 T do_sys_open\n";
        let space = KernelSpace::parse(zeroed, "");
        assert!(space.kernel.is_none());
    }
}
