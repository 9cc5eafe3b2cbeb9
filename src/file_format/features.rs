//! Feature section payload encodings.

use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{read_attr, write_attr, Feature};
use crate::perf_event::sys::{PerfEventAttr, PERF_ATTR_SIZE};
use crate::symbols::{SymbolsFile, SymbolsFileKind};

/// Strings are stored as `u32 len | bytes | NUL`, padded to four bytes;
/// `len` counts everything after the length field.
pub fn write_string(out: &mut Vec<u8>, text: &str) {
    let mut padded = text.len() + 1;
    padded = (padded + 3) & !3;
    out.write_u32::<LittleEndian>(padded as u32).unwrap();
    out.extend_from_slice(text.as_bytes());
    out.resize(out.len() + (padded - text.len()), 0);
}

pub fn read_string(data: &mut &[u8]) -> io::Result<String> {
    let len = data.read_u32::<LittleEndian>()? as usize;
    if len > data.len() {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    let raw = &data[..len];
    *data = &data[len..];
    let end = memchr::memchr(0, raw).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescEntry {
    pub attr: PerfEventAttr,
    pub name: String,
    pub ids: Vec<u64>,
}

pub fn write_event_desc(out: &mut Vec<u8>, entries: &[EventDescEntry]) {
    out.write_u32::<LittleEndian>(entries.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(PERF_ATTR_SIZE as u32).unwrap();
    for entry in entries {
        write_attr(&entry.attr, out);
        out.write_u32::<LittleEndian>(entry.ids.len() as u32)
            .unwrap();
        write_string(out, &entry.name);
        for id in &entry.ids {
            out.write_u64::<LittleEndian>(*id).unwrap();
        }
    }
}

pub fn read_event_desc(mut data: &[u8]) -> io::Result<Vec<EventDescEntry>> {
    let count = data.read_u32::<LittleEndian>()?;
    let attr_size = data.read_u32::<LittleEndian>()? as usize;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let attr = read_attr(&mut data, attr_size)?;
        let id_count = data.read_u32::<LittleEndian>()?;
        let name = read_string(&mut data)?;
        let mut ids = Vec::with_capacity(id_count as usize);
        for _ in 0..id_count {
            ids.push(data.read_u64::<LittleEndian>()?);
        }
        entries.push(EventDescEntry { attr, name, ids });
    }
    Ok(entries)
}

/// The per-module symbol table carried in the trace file, restricted to
/// the symbols samples actually hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolFileFeature {
    pub path: String,
    pub kind: u32,
    pub text_exec_vaddr: u64,
    pub text_exec_file_offset: u64,
    pub build_id: String,
    /// (vaddr, size, name)
    pub symbols: Vec<(u64, u32, String)>,
}

impl SymbolFileFeature {
    /// Capture a registry entry, keeping only the hit symbols.
    pub fn from_symbols_file(file: &SymbolsFile) -> SymbolFileFeature {
        SymbolFileFeature {
            path: file.path.clone(),
            kind: file.kind.as_u32(),
            text_exec_vaddr: file.text_exec_vaddr,
            text_exec_file_offset: file.text_exec_file_offset,
            build_id: file
                .build_id
                .as_deref()
                .map(crate::symbols::hex)
                .unwrap_or_default(),
            symbols: file
                .hit_symbols()
                .map(|s| (s.vaddr, s.size as u32, s.display_name().to_string()))
                .collect(),
        }
    }

    /// Rebuild a registry entry on the reading side.
    pub fn into_symbols_file(self) -> SymbolsFile {
        let mut file = SymbolsFile::new(SymbolsFileKind::from_u32(self.kind), self.path);
        file.text_exec_vaddr = self.text_exec_vaddr;
        file.text_exec_file_offset = self.text_exec_file_offset;
        file.build_id = crate::symbols::from_hex(&self.build_id);
        for (vaddr, size, name) in self.symbols {
            file.symbols.push(crate::symbols::Symbol {
                vaddr,
                size: size as u64,
                name,
                demangled: None,
            });
        }
        file.finish_symbols();
        file
    }
}

pub fn write_symbol_files(out: &mut Vec<u8>, files: &[SymbolFileFeature]) {
    out.write_u32::<LittleEndian>(files.len() as u32).unwrap();
    for file in files {
        write_string(out, &file.path);
        out.write_u32::<LittleEndian>(file.kind).unwrap();
        out.write_u64::<LittleEndian>(file.text_exec_vaddr).unwrap();
        out.write_u64::<LittleEndian>(file.text_exec_file_offset)
            .unwrap();
        write_string(out, &file.build_id);
        out.write_u32::<LittleEndian>(file.symbols.len() as u32)
            .unwrap();
        for (vaddr, size, name) in &file.symbols {
            out.write_u64::<LittleEndian>(*vaddr).unwrap();
            out.write_u32::<LittleEndian>(*size).unwrap();
            write_string(out, name);
        }
    }
}

pub fn read_symbol_files(mut data: &[u8]) -> io::Result<Vec<SymbolFileFeature>> {
    let count = data.read_u32::<LittleEndian>()?;
    let mut files = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let path = read_string(&mut data)?;
        let kind = data.read_u32::<LittleEndian>()?;
        let text_exec_vaddr = data.read_u64::<LittleEndian>()?;
        let text_exec_file_offset = data.read_u64::<LittleEndian>()?;
        let build_id = read_string(&mut data)?;
        let symbol_count = data.read_u32::<LittleEndian>()?;
        let mut symbols = Vec::with_capacity(symbol_count as usize);
        for _ in 0..symbol_count {
            let vaddr = data.read_u64::<LittleEndian>()?;
            let size = data.read_u32::<LittleEndian>()?;
            let name = read_string(&mut data)?;
            symbols.push((vaddr, size, name));
        }
        files.push(SymbolFileFeature {
            path,
            kind,
            text_exec_vaddr,
            text_exec_file_offset,
            build_id,
            symbols,
        });
    }
    Ok(files)
}

/// A parsed feature payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureContent {
    String(String),
    NrCpus { available: u32, online: u32 },
    TotalMem(u64),
    U64(u64),
    EventDesc(Vec<EventDescEntry>),
    SymbolFiles(Vec<SymbolFileFeature>),
    UniStackTable(Vec<u8>),
    Raw(Vec<u8>),
}

impl FeatureContent {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            FeatureContent::String(text) => write_string(out, text),
            FeatureContent::NrCpus { available, online } => {
                out.write_u32::<LittleEndian>(*available).unwrap();
                out.write_u32::<LittleEndian>(*online).unwrap();
            }
            FeatureContent::TotalMem(kb) => out.write_u64::<LittleEndian>(*kb).unwrap(),
            FeatureContent::U64(value) => out.write_u64::<LittleEndian>(*value).unwrap(),
            FeatureContent::EventDesc(entries) => write_event_desc(out, entries),
            FeatureContent::SymbolFiles(files) => write_symbol_files(out, files),
            FeatureContent::UniStackTable(bytes) | FeatureContent::Raw(bytes) => {
                out.extend_from_slice(bytes)
            }
        }
    }

    pub fn decode(feature: Feature, mut data: &[u8]) -> io::Result<FeatureContent> {
        Ok(match feature {
            f if f.is_string() => FeatureContent::String(read_string(&mut data)?),
            Feature::NrCpus => FeatureContent::NrCpus {
                available: data.read_u32::<LittleEndian>()?,
                online: data.read_u32::<LittleEndian>()?,
            },
            Feature::TotalMem => FeatureContent::TotalMem(data.read_u64::<LittleEndian>()?),
            Feature::CpuOff => FeatureContent::U64(data.read_u64::<LittleEndian>()?),
            Feature::EventDesc => FeatureContent::EventDesc(read_event_desc(data)?),
            Feature::FilesSymbol => FeatureContent::SymbolFiles(read_symbol_files(data)?),
            Feature::FilesUniStackTable => FeatureContent::UniStackTable(data.to_vec()),
            _ => FeatureContent::Raw(data.to_vec()),
        })
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            FeatureContent::String(text) => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_padding_and_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "abc");
        // 4-byte length + "abc\0" already aligned.
        assert_eq!(buf.len(), 8);

        let mut buf = Vec::new();
        write_string(&mut buf, "abcd");
        assert_eq!(buf.len(), 4 + 8);

        let mut cursor = &buf[..];
        assert_eq!(read_string(&mut cursor).unwrap(), "abcd");
        assert!(cursor.is_empty());
    }

    #[test]
    fn event_desc_round_trip() {
        let mut attr = PerfEventAttr::default();
        attr.kind = 0;
        attr.config = 0;
        attr.sample_type = 0x107;
        let entries = vec![EventDescEntry {
            attr,
            name: "hw-cpu-cycles".into(),
            ids: vec![11, 12, 13],
        }];
        let mut buf = Vec::new();
        write_event_desc(&mut buf, &entries);
        let back = read_event_desc(&buf).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn symbol_files_round_trip() {
        let files = vec![SymbolFileFeature {
            path: "/usr/lib/libc.so.6".into(),
            kind: 0,
            text_exec_vaddr: 0x28000,
            text_exec_file_offset: 0x28000,
            build_id: "f00dfeed".into(),
            symbols: vec![
                (0x28010, 0x40, "malloc".into()),
                (0x28050, 0x20, "free".into()),
            ],
        }];
        let mut buf = Vec::new();
        write_symbol_files(&mut buf, &files);
        let back = read_symbol_files(&buf).unwrap();
        assert_eq!(back, files);

        let rebuilt = back.into_iter().next().unwrap().into_symbols_file();
        assert_eq!(rebuilt.symbols.len(), 2);
        assert_eq!(rebuilt.build_id, Some(vec![0xf0, 0x0d, 0xfe, 0xed]));
        let (index, in_range) = rebuilt.find_symbol(0x28060).unwrap();
        assert!(in_range);
        assert_eq!(rebuilt.symbols[index].name, "free");
    }

    #[test]
    fn content_decode_by_feature() {
        let mut buf = Vec::new();
        FeatureContent::String("myhost".into()).encode(&mut buf);
        let back = FeatureContent::decode(Feature::Hostname, &buf).unwrap();
        assert_eq!(back.as_string(), Some("myhost"));

        let mut buf = Vec::new();
        FeatureContent::NrCpus {
            available: 8,
            online: 6,
        }
        .encode(&mut buf);
        let back = FeatureContent::decode(Feature::NrCpus, &buf).unwrap();
        assert_eq!(
            back,
            FeatureContent::NrCpus {
                available: 8,
                online: 6
            }
        );
    }
}
