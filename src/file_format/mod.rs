//! The on-disk trace format.
//!
//! ```text
//! +--------------------+
//! | file_header (96 B) |  magic "PERFILE2", sizes, attr/data sections,
//! |                    |  256-bit feature bitmap
//! +--------------------+
//! | attr entries       |  perf_event_attr + file_section(ids) each
//! +--------------------+
//! | id table           |  flat u64 array referenced by the attrs
//! +--------------------+
//! | data section       |  record stream
//! +--------------------+
//! | feature headers    |  one file_section per set feature bit
//! | feature payloads   |
//! +--------------------+
//! ```
//!
//! Everything is little-endian. The whole file may additionally be
//! gzip-compressed; readers sniff the gzip magic before the perf magic.

pub mod features;
pub mod reader;
pub mod writer;

use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::perf_event::sys::{PerfEventAttr, PERF_ATTR_SIZE};

pub const PERF_MAGIC: &[u8; 8] = b"PERFILE2";
pub const FILE_HEADER_SIZE: u64 = 96;
/// Size of one attr entry: the attr block plus its ids file section.
pub const ATTR_ENTRY_SIZE: u64 = PERF_ATTR_SIZE as u64 + FILE_SECTION_SIZE;
pub const FILE_SECTION_SIZE: u64 = 16;

pub const FEATURE_WORDS: usize = 4;
pub const FEATURE_MAX: u16 = 256;

/// Feature bits. The low range matches perf's header features; the
/// range from 192 carries our own sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Feature {
    Hostname,
    OsRelease,
    Version,
    Arch,
    NrCpus,
    CpuDesc,
    CpuId,
    TotalMem,
    Cmdline,
    EventDesc,
    CpuTopology,
    NumaTopology,
    FilesSymbol,
    RecordTime,
    CpuOff,
    FilesUniStackTable,
    HmDevhost,
    WorkloadCmd,
    Unknown(u8),
}

impl Feature {
    pub fn bit(self) -> u8 {
        match self {
            Feature::Hostname => 3,
            Feature::OsRelease => 4,
            Feature::Version => 5,
            Feature::Arch => 6,
            Feature::NrCpus => 7,
            Feature::CpuDesc => 8,
            Feature::CpuId => 9,
            Feature::TotalMem => 10,
            Feature::Cmdline => 11,
            Feature::EventDesc => 12,
            Feature::CpuTopology => 13,
            Feature::NumaTopology => 14,
            Feature::FilesSymbol => 192,
            Feature::RecordTime => 193,
            Feature::CpuOff => 194,
            Feature::FilesUniStackTable => 195,
            Feature::HmDevhost => 196,
            Feature::WorkloadCmd => 197,
            Feature::Unknown(bit) => bit,
        }
    }

    pub fn from_bit(bit: u8) -> Feature {
        match bit {
            3 => Feature::Hostname,
            4 => Feature::OsRelease,
            5 => Feature::Version,
            6 => Feature::Arch,
            7 => Feature::NrCpus,
            8 => Feature::CpuDesc,
            9 => Feature::CpuId,
            10 => Feature::TotalMem,
            11 => Feature::Cmdline,
            12 => Feature::EventDesc,
            13 => Feature::CpuTopology,
            14 => Feature::NumaTopology,
            192 => Feature::FilesSymbol,
            193 => Feature::RecordTime,
            194 => Feature::CpuOff,
            195 => Feature::FilesUniStackTable,
            196 => Feature::HmDevhost,
            197 => Feature::WorkloadCmd,
            other => Feature::Unknown(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::Hostname => "hostname",
            Feature::OsRelease => "osrelease",
            Feature::Version => "version",
            Feature::Arch => "arch",
            Feature::NrCpus => "nrcpus",
            Feature::CpuDesc => "cpudesc",
            Feature::CpuId => "cpuid",
            Feature::TotalMem => "total_mem",
            Feature::Cmdline => "cmdline",
            Feature::EventDesc => "event_desc",
            Feature::CpuTopology => "cpu_topology",
            Feature::NumaTopology => "numa_topology",
            Feature::FilesSymbol => "files_symbol",
            Feature::RecordTime => "record_time",
            Feature::CpuOff => "cpu_off",
            Feature::FilesUniStackTable => "unistack_table",
            Feature::HmDevhost => "hm_devhost",
            Feature::WorkloadCmd => "workload_cmd",
            Feature::Unknown(_) => "unknown",
        }
    }

    /// Features whose payload is a plain string.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            Feature::Hostname
                | Feature::OsRelease
                | Feature::Version
                | Feature::Arch
                | Feature::CpuDesc
                | Feature::CpuId
                | Feature::Cmdline
                | Feature::CpuTopology
                | Feature::NumaTopology
                | Feature::RecordTime
                | Feature::HmDevhost
                | Feature::WorkloadCmd
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSection {
    pub offset: u64,
    pub size: u64,
}

impl FileSection {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.write_u64::<LittleEndian>(self.offset).unwrap();
        out.write_u64::<LittleEndian>(self.size).unwrap();
    }

    pub fn read(data: &mut &[u8]) -> io::Result<FileSection> {
        Ok(FileSection {
            offset: data.read_u64::<LittleEndian>()?,
            size: data.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeader {
    pub attr_size: u64,
    pub attrs: FileSection,
    pub data: FileSection,
    pub features: [u64; FEATURE_WORDS],
}

impl FileHeader {
    pub fn set_feature(&mut self, feature: Feature) {
        let bit = feature.bit() as usize;
        self.features[bit / 64] |= 1 << (bit % 64);
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        let bit = feature.bit() as usize;
        self.features[bit / 64] & (1 << (bit % 64)) != 0
    }

    /// Set feature bits in ascending order; the on-disk section headers
    /// follow this order.
    pub fn feature_list(&self) -> Vec<Feature> {
        let mut features = Vec::new();
        for bit in 0..FEATURE_MAX {
            let word = self.features[bit as usize / 64];
            if word & (1 << (bit % 64)) != 0 {
                features.push(Feature::from_bit(bit as u8));
            }
        }
        features
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(PERF_MAGIC);
        out.write_u64::<LittleEndian>(FILE_HEADER_SIZE).unwrap();
        out.write_u64::<LittleEndian>(self.attr_size).unwrap();
        self.attrs.write(out);
        self.data.write(out);
        for word in self.features {
            out.write_u64::<LittleEndian>(word).unwrap();
        }
        out.write_u64::<LittleEndian>(0).unwrap(); // reserved
        debug_assert_eq!((out.len() - start) as u64, FILE_HEADER_SIZE);
    }

    pub fn read(mut data: &[u8]) -> io::Result<FileHeader> {
        let mut magic = [0u8; 8];
        std::io::Read::read_exact(&mut data, &mut magic)?;
        if &magic != PERF_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad magic, not a perf data file",
            ));
        }
        let header_size = data.read_u64::<LittleEndian>()?;
        if header_size != FILE_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected header size {header_size}"),
            ));
        }
        let attr_size = data.read_u64::<LittleEndian>()?;
        let attrs = FileSection::read(&mut data)?;
        let data_section = FileSection::read(&mut data)?;
        let mut features = [0u64; FEATURE_WORDS];
        for word in &mut features {
            *word = data.read_u64::<LittleEndian>()?;
        }
        Ok(FileHeader {
            attr_size,
            attrs,
            data: data_section,
            features,
        })
    }
}

/// Field-by-field little-endian attr encoding, independent of host
/// endianness.
pub fn write_attr(attr: &PerfEventAttr, out: &mut Vec<u8>) {
    out.write_u32::<LittleEndian>(attr.kind).unwrap();
    out.write_u32::<LittleEndian>(PERF_ATTR_SIZE as u32).unwrap();
    out.write_u64::<LittleEndian>(attr.config).unwrap();
    out.write_u64::<LittleEndian>(attr.sample_period_or_freq)
        .unwrap();
    out.write_u64::<LittleEndian>(attr.sample_type).unwrap();
    out.write_u64::<LittleEndian>(attr.read_format).unwrap();
    out.write_u64::<LittleEndian>(attr.flags).unwrap();
    out.write_u32::<LittleEndian>(attr.wakeup_events_or_watermark)
        .unwrap();
    out.write_u32::<LittleEndian>(attr.bp_type).unwrap();
    out.write_u64::<LittleEndian>(attr.bp_addr_or_config1).unwrap();
    out.write_u64::<LittleEndian>(attr.bp_len_or_config2).unwrap();
    out.write_u64::<LittleEndian>(attr.branch_sample_type).unwrap();
    out.write_u64::<LittleEndian>(attr.sample_regs_user).unwrap();
    out.write_u32::<LittleEndian>(attr.sample_stack_user).unwrap();
    out.write_i32::<LittleEndian>(attr.clock_id).unwrap();
    out.write_u64::<LittleEndian>(attr.sample_regs_intr).unwrap();
    out.write_u32::<LittleEndian>(attr.aux_watermark).unwrap();
    out.write_u16::<LittleEndian>(attr.sample_max_stack).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(attr.aux_sample_size).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
}

/// Reads an attr block of `declared_size` bytes; shorter (older) or
/// longer (newer) layouts than ours are tolerated, extra fields are
/// dropped and missing ones stay zero.
pub fn read_attr(data: &mut &[u8], declared_size: usize) -> io::Result<PerfEventAttr> {
    let mut block = vec![0u8; declared_size.max(PERF_ATTR_SIZE)];
    let take = declared_size.min(data.len());
    block[..take].copy_from_slice(&data[..take]);
    *data = &data[take..];

    let mut cursor = &block[..];
    let mut attr = PerfEventAttr::default();
    attr.kind = cursor.read_u32::<LittleEndian>()?;
    let _size = cursor.read_u32::<LittleEndian>()?;
    attr.config = cursor.read_u64::<LittleEndian>()?;
    attr.sample_period_or_freq = cursor.read_u64::<LittleEndian>()?;
    attr.sample_type = cursor.read_u64::<LittleEndian>()?;
    attr.read_format = cursor.read_u64::<LittleEndian>()?;
    attr.flags = cursor.read_u64::<LittleEndian>()?;
    attr.wakeup_events_or_watermark = cursor.read_u32::<LittleEndian>()?;
    attr.bp_type = cursor.read_u32::<LittleEndian>()?;
    attr.bp_addr_or_config1 = cursor.read_u64::<LittleEndian>()?;
    attr.bp_len_or_config2 = cursor.read_u64::<LittleEndian>()?;
    attr.branch_sample_type = cursor.read_u64::<LittleEndian>()?;
    attr.sample_regs_user = cursor.read_u64::<LittleEndian>()?;
    attr.sample_stack_user = cursor.read_u32::<LittleEndian>()?;
    attr.clock_id = cursor.read_i32::<LittleEndian>()?;
    attr.sample_regs_intr = cursor.read_u64::<LittleEndian>()?;
    attr.aux_watermark = cursor.read_u32::<LittleEndian>()?;
    attr.sample_max_stack = cursor.read_u16::<LittleEndian>()?;
    let _ = cursor.read_u16::<LittleEndian>()?;
    attr.aux_sample_size = cursor.read_u32::<LittleEndian>()?;
    attr.size = PERF_ATTR_SIZE as u32;
    Ok(attr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_96_bytes_and_round_trips() {
        let mut header = FileHeader {
            attr_size: ATTR_ENTRY_SIZE,
            attrs: FileSection {
                offset: 96,
                size: 136,
            },
            data: FileSection {
                offset: 300,
                size: 4096,
            },
            ..Default::default()
        };
        header.set_feature(Feature::Hostname);
        header.set_feature(Feature::FilesSymbol);

        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(buf.len() as u64, FILE_HEADER_SIZE);

        let back = FileHeader::read(&buf).unwrap();
        assert_eq!(back, header);
        assert!(back.has_feature(Feature::Hostname));
        assert!(back.has_feature(Feature::FilesSymbol));
        assert!(!back.has_feature(Feature::Cmdline));
        assert_eq!(
            back.feature_list(),
            vec![Feature::Hostname, Feature::FilesSymbol]
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 96];
        assert!(FileHeader::read(&buf).is_err());
    }

    #[test]
    fn attr_round_trip() {
        let mut attr = PerfEventAttr::default();
        attr.kind = 1;
        attr.config = 0x42;
        attr.sample_type = 0x10307;
        attr.flags = 0x3;
        attr.sample_regs_user = 0xff;
        attr.sample_stack_user = 8192;
        attr.clock_id = libc::CLOCK_MONOTONIC;

        let mut buf = Vec::new();
        write_attr(&attr, &mut buf);
        assert_eq!(buf.len(), PERF_ATTR_SIZE);

        let mut cursor = &buf[..];
        let back = read_attr(&mut cursor, PERF_ATTR_SIZE).unwrap();
        assert_eq!(back, attr);
    }

    #[test]
    fn attr_of_other_kernel_versions_is_tolerated() {
        let mut attr = PerfEventAttr::default();
        attr.kind = 1;
        attr.config = 9;
        let mut buf = Vec::new();
        write_attr(&attr, &mut buf);

        // An older 112-byte layout: truncate, then parse with the
        // declared size.
        let shorter = &buf[..112];
        let mut cursor = shorter;
        let back = read_attr(&mut cursor, 112).unwrap();
        assert_eq!(back.kind, 1);
        assert_eq!(back.config, 9);
    }
}
