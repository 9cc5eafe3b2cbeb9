//! ELF symbol and unwind-section extraction via the `object` crate.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use object::read::{Object, ObjectSection, ObjectSymbol};
use object::{CompressedFileRange, CompressionFormat, SectionKind, SymbolKind};

use super::{
    ModuleSectionData, SectionData, SectionInfo, Symbol, SymbolsFile, SymbolsFileKind,
};

/// Open `path` directly, then retry the basename against each search
/// directory. The first hit wins.
pub fn open_with_fallback(path: &Path, search_dirs: &[PathBuf]) -> io::Result<(File, PathBuf)> {
    match File::open(path) {
        Ok(file) => return Ok((file, path.to_owned())),
        Err(e) if search_dirs.is_empty() => return Err(e),
        Err(_) => {}
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
    for dir in search_dirs {
        let candidate = dir.join(file_name);
        if let Ok(file) = File::open(&candidate) {
            return Ok((file, candidate));
        }
        // Also accept the full path re-rooted under the search dir, the
        // layout unstripped copies usually keep.
        let rerooted = dir.join(path.strip_prefix("/").unwrap_or(path));
        if let Ok(file) = File::open(&rerooted) {
            return Ok((file, rerooted));
        }
    }
    Err(io::Error::from(io::ErrorKind::NotFound))
}

fn section_info<'a>(section: &impl ObjectSection<'a>) -> Option<SectionInfo> {
    let (file_offset, size) = section.file_range()?;
    Some(SectionInfo {
        vaddr: section.address(),
        size,
        file_offset,
    })
}

fn section_data<'a>(section: &impl ObjectSection<'a>, mmap: &Arc<Mmap>) -> Option<SectionData> {
    let CompressedFileRange {
        format,
        offset,
        compressed_size: _,
        uncompressed_size,
    } = section.compressed_file_range().ok()?;
    match format {
        CompressionFormat::None => {
            SectionData::new_mmap_range(mmap.clone(), offset, uncompressed_size)
        }
        _ => Some(SectionData::Vec(Arc::new(
            section.uncompressed_data().ok()?.to_vec(),
        ))),
    }
}

fn svma_range<'a>(section: &impl ObjectSection<'a>) -> std::ops::Range<u64> {
    section.address()..section.address() + section.size()
}

pub fn demangle(name: &str) -> Option<String> {
    if name.starts_with("_R") {
        return Some(format!("{:#}", rustc_demangle::demangle(name)));
    }
    if !name.starts_with("_Z") && !name.starts_with("__Z") {
        return None;
    }
    // Legacy Rust symbols are a C++ mangling subset with a hash suffix;
    // try the Rust demangler first.
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return Some(format!("{demangled:#}"));
    }
    let symbol = cpp_demangle::Symbol::new(name).ok()?;
    let options = cpp_demangle::DemangleOptions::default().no_return_type();
    symbol.demangle_with_options(&options).ok()
}

/// Load one on-disk module: `.text` location, build id, the merged
/// dynsym/symtab function table, and the unwind sections.
pub fn load_symbols_file(path: &str, search_dirs: &[PathBuf]) -> io::Result<SymbolsFile> {
    let (file, resolved_path) = open_with_fallback(Path::new(path), search_dirs)?;
    let mmap = Arc::new(unsafe { Mmap::map(&file)? });
    let objfile = object::File::parse(&mmap[..])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    // The registry key stays the mapped path even when the bytes came
    // from a search directory.
    let mut out = SymbolsFile::new(SymbolsFileKind::Elf, path.to_string());
    if resolved_path != Path::new(path) {
        log::debug!(
            "symbols for {path} loaded from {}",
            resolved_path.display()
        );
    }

    if let Ok(Some(build_id)) = objfile.build_id() {
        out.build_id = Some(build_id.to_vec());
    }

    let text = objfile.section_by_name(".text").or_else(|| {
        objfile
            .sections()
            .find(|s| s.kind() == SectionKind::Text && s.size() > 0)
    });
    if let Some(text) = &text {
        if let Some(info) = section_info(text) {
            out.text_exec_vaddr = info.vaddr;
            out.text_exec_file_offset = info.file_offset;
        }
    }

    for symbol in objfile.dynamic_symbols().chain(objfile.symbols()) {
        if symbol.kind() != SymbolKind::Text || symbol.address() == 0 {
            continue;
        }
        let Ok(name) = symbol.name() else { continue };
        if name.is_empty() {
            continue;
        }
        out.symbols.push(Symbol {
            vaddr: symbol.address(),
            size: symbol.size(),
            name: name.to_string(),
            demangled: demangle(name),
        });
    }
    out.finish_symbols();

    let eh_frame = objfile.section_by_name(".eh_frame");
    let eh_frame_hdr = objfile.section_by_name(".eh_frame_hdr");
    let arm_exidx = objfile.section_by_name(".ARM.exidx");
    out.eh_frame = eh_frame.as_ref().and_then(section_info);
    out.eh_frame_hdr = eh_frame_hdr.as_ref().and_then(section_info);
    out.arm_exidx = arm_exidx.as_ref().and_then(section_info);

    out.module_sections = Some(ModuleSectionData {
        base_svma: objfile.relative_address_base(),
        text_svma: text.as_ref().map(svma_range),
        text: text.as_ref().and_then(|s| section_data(s, &mmap)),
        eh_frame_svma: eh_frame.as_ref().map(svma_range),
        eh_frame: eh_frame.as_ref().and_then(|s| section_data(s, &mmap)),
        eh_frame_hdr_svma: eh_frame_hdr.as_ref().map(svma_range),
        eh_frame_hdr: eh_frame_hdr.as_ref().and_then(|s| section_data(s, &mmap)),
    });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demangles_cpp_and_rust() {
        assert_eq!(demangle("_Z3fooi").as_deref(), Some("foo(int)"));
        let legacy = demangle("_ZN4core3ptr13drop_in_place17h1a2b3c4d5e6f7a8bE");
        assert_eq!(legacy.as_deref(), Some("core::ptr::drop_in_place"));
        assert_eq!(demangle("main"), None);
        assert_eq!(demangle("plain_c_function"), None);
    }

    #[test]
    fn loads_own_binary() {
        let exe = std::env::current_exe().unwrap();
        let file = load_symbols_file(exe.to_str().unwrap(), &[]).unwrap();
        assert_eq!(file.kind, SymbolsFileKind::Elf);
        assert!(!file.symbols.is_empty());
        assert!(file.text_exec_vaddr > 0);
        // Test binaries are linked with unwind tables on Linux.
        assert!(file.eh_frame.is_some());
        let windows = file.symbols.windows(2).all(|w| w[0].vaddr <= w[1].vaddr);
        assert!(windows, "symbol table must be sorted");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_symbols_file("/no/such/file.so", &[]).is_err());
    }
}
