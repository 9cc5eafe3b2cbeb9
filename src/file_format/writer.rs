//! Streaming trace-file writer.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use rustc_hash::FxHashMap;

use super::features::FeatureContent;
use super::{
    write_attr, Feature, FileHeader, FileSection, ATTR_ENTRY_SIZE, FILE_HEADER_SIZE,
    FILE_SECTION_SIZE,
};
use crate::error::{RecordError, Result};
use crate::perf_event::AttrWithIds;
use crate::record::{PerfRecord, SampleFormat, RECORD_SIZE_LIMIT, RECORD_SIZE_LIMIT_AUX};

pub struct RecordFileWriter {
    file: File,
    path: PathBuf,
    header: FileHeader,
    default_format: SampleFormat,
    format_by_id: FxHashMap<u64, SampleFormat>,
    data_offset: u64,
    data_size: u64,
    features: Vec<(Feature, Vec<u8>)>,
    compress: bool,
    scratch: Vec<u8>,
}

impl RecordFileWriter {
    /// Create the file and write the header, attr entries, and id table.
    /// The data section starts right behind them.
    pub fn new(path: &Path, attrs: &[AttrWithIds], compress: bool) -> Result<RecordFileWriter> {
        if attrs.is_empty() {
            return Err(RecordError::InvalidOption(
                "cannot write a trace file without event attributes".into(),
            ));
        }

        let attrs_offset = FILE_HEADER_SIZE;
        let attrs_size = attrs.len() as u64 * ATTR_ENTRY_SIZE;
        let ids_offset = attrs_offset + attrs_size;
        let ids_size: u64 = attrs.iter().map(|a| a.ids.len() as u64 * 8).sum();
        let data_offset = ids_offset + ids_size;

        let header = FileHeader {
            attr_size: ATTR_ENTRY_SIZE,
            attrs: FileSection {
                offset: attrs_offset,
                size: attrs_size,
            },
            data: FileSection {
                offset: data_offset,
                size: 0,
            },
            features: Default::default(),
        };

        let mut out = Vec::with_capacity(data_offset as usize);
        header.write(&mut out);

        let mut id_cursor = ids_offset;
        for entry in attrs {
            write_attr(&entry.attr, &mut out);
            let ids_section = FileSection {
                offset: id_cursor,
                size: entry.ids.len() as u64 * 8,
            };
            ids_section.write(&mut out);
            id_cursor += ids_section.size;
        }
        for entry in attrs {
            for id in &entry.ids {
                out.write_u64::<LittleEndian>(*id).unwrap();
            }
        }
        debug_assert_eq!(out.len() as u64, data_offset);

        let mut file = File::create(path)?;
        file.write_all(&out)?;

        let default_format = SampleFormat::from_attr(&attrs[0].attr);
        let mut format_by_id = FxHashMap::default();
        for entry in attrs {
            let format = SampleFormat::from_attr(&entry.attr);
            for id in &entry.ids {
                format_by_id.insert(*id, format);
            }
        }

        Ok(RecordFileWriter {
            file,
            path: path.to_owned(),
            header,
            default_format,
            format_by_id,
            data_offset,
            data_size: 0,
            features: Vec::new(),
            compress,
            scratch: Vec::new(),
        })
    }

    fn format_for(&self, record: &PerfRecord) -> SampleFormat {
        match record {
            PerfRecord::Sample(sample) => self
                .format_by_id
                .get(&sample.id)
                .copied()
                .unwrap_or(self.default_format),
            _ => self.default_format,
        }
    }

    pub fn write_record(&mut self, record: &PerfRecord) -> Result<()> {
        let format = self.format_for(record);
        self.scratch.clear();
        record.to_bytes(&format, &mut self.scratch);

        let limit = match record {
            PerfRecord::Auxtrace(_) => RECORD_SIZE_LIMIT_AUX,
            _ => RECORD_SIZE_LIMIT,
        };
        if self.scratch.len() > limit {
            return Err(RecordError::BadTraceFile(format!(
                "record of {} bytes exceeds the {limit} byte limit",
                self.scratch.len()
            )));
        }

        self.file.write_all(&self.scratch)?;
        self.data_size += self.scratch.len() as u64;
        Ok(())
    }

    /// Bytes of the data section so far, the `--data-limit` input.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn add_feature(&mut self, feature: Feature, content: &FeatureContent) {
        let mut payload = Vec::new();
        content.encode(&mut payload);
        self.features.push((feature, payload));
    }

    /// Write the feature sections, patch the header, and optionally
    /// gzip the finished file in place. Returns total bytes on disk
    /// before compression.
    pub fn finish(mut self) -> Result<u64> {
        self.features.sort_by_key(|(feature, _)| feature.bit());

        let feature_headers_offset = self.data_offset + self.data_size;
        let payload_base =
            feature_headers_offset + self.features.len() as u64 * FILE_SECTION_SIZE;

        let mut out = Vec::new();
        let mut payload_cursor = payload_base;
        for (_, payload) in &self.features {
            FileSection {
                offset: payload_cursor,
                size: payload.len() as u64,
            }
            .write(&mut out);
            payload_cursor += payload.len() as u64;
        }
        for (_, payload) in &self.features {
            out.extend_from_slice(payload);
        }
        self.file.write_all(&out)?;

        self.header.data.size = self.data_size;
        for (feature, _) in &self.features {
            self.header.set_feature(*feature);
        }
        let mut header_bytes = Vec::new();
        self.header.write(&mut header_bytes);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        self.file.flush()?;
        let total = payload_cursor;
        drop(self.file);

        if self.compress {
            compress_in_place(&self.path)?;
        }
        Ok(total)
    }
}

/// Gzip `path` over itself via a sibling temp file.
fn compress_in_place(path: &Path) -> Result<()> {
    let raw = std::fs::read(path)?;
    let tmp_path = path.with_extension("tmp.gz");
    {
        let tmp = File::create(&tmp_path)?;
        let mut encoder = flate2::write::GzEncoder::new(tmp, flate2::Compression::default());
        encoder.write_all(&raw)?;
        encoder.finish()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
