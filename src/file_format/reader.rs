//! Validating trace-file reader, used by `report`/`dump` and by the
//! delayed-unwind post-pass.

use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use rustc_hash::FxHashMap;

use super::features::FeatureContent;
use super::{read_attr, Feature, FileHeader, FileSection, FILE_HEADER_SIZE, FILE_SECTION_SIZE};
use crate::dedup::UniStackTable;
use crate::error::{RecordError, Result};
use crate::perf_event::sys::{PERF_EVENT_HEADER_SIZE, PERF_RECORD_AUXTRACE};
use crate::perf_event::AttrWithIds;
use crate::record::{PerfRecord, RawData, SampleFormat, RECORD_SIZE_LIMIT};

pub struct RecordFileReader {
    bytes: Vec<u8>,
    pub header: FileHeader,
    attrs: Vec<AttrWithIds>,
    id_to_attr: FxHashMap<u64, usize>,
    features: Vec<(Feature, FeatureContent)>,
    unistack: Option<UniStackTable>,
    was_compressed: bool,
}

impl RecordFileReader {
    pub fn open(path: &Path) -> Result<RecordFileReader> {
        let raw = std::fs::read(path)?;
        let (bytes, was_compressed) = if raw.starts_with(&[0x1f, 0x8b]) {
            let mut inflated = Vec::new();
            flate2::read::GzDecoder::new(&raw[..])
                .read_to_end(&mut inflated)
                .map_err(|e| RecordError::BadTraceFile(format!("gzip: {e}")))?;
            (inflated, true)
        } else {
            (raw, false)
        };

        if bytes.len() < FILE_HEADER_SIZE as usize {
            return Err(RecordError::BadTraceFile("file shorter than header".into()));
        }
        let header = FileHeader::read(&bytes)
            .map_err(|e| RecordError::BadTraceFile(e.to_string()))?;

        let mut reader = RecordFileReader {
            bytes,
            header,
            attrs: Vec::new(),
            id_to_attr: FxHashMap::default(),
            features: Vec::new(),
            unistack: None,
            was_compressed,
        };
        reader.read_attr_section()?;
        reader.read_feature_sections()?;
        Ok(reader)
    }

    fn section(&self, section: FileSection, what: &str) -> Result<&[u8]> {
        let start = section.offset as usize;
        let end = start
            .checked_add(section.size as usize)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                RecordError::BadTraceFile(format!("{what} section out of bounds"))
            })?;
        Ok(&self.bytes[start..end])
    }

    fn read_attr_section(&mut self) -> Result<()> {
        let attr_size = self.header.attr_size;
        if attr_size <= FILE_SECTION_SIZE || attr_size > 1000 {
            return Err(RecordError::BadTraceFile(format!(
                "implausible attr size {attr_size}"
            )));
        }
        let section = self.section(self.header.attrs, "attr")?;
        let count = section.len() / attr_size as usize;
        if count == 0 {
            return Err(RecordError::BadTraceFile("no attrs in file".into()));
        }

        let mut id_sections = Vec::with_capacity(count);
        for i in 0..count {
            let mut entry = &section[i * attr_size as usize..];
            let attr = read_attr(&mut entry, attr_size as usize - FILE_SECTION_SIZE as usize)
                .map_err(|e| RecordError::BadTraceFile(e.to_string()))?;
            let ids = FileSection::read(&mut entry)
                .map_err(|e| RecordError::BadTraceFile(e.to_string()))?;
            id_sections.push((attr, ids));
        }

        for (attr_index, (attr, ids_section)) in id_sections.into_iter().enumerate() {
            let ids_bytes = self.section(ids_section, "ids")?;
            let ids: Vec<u64> = ids_bytes
                .chunks_exact(8)
                .map(LittleEndian::read_u64)
                .collect();
            for id in &ids {
                // Every id names exactly one attr.
                if self.id_to_attr.insert(*id, attr_index).is_some() {
                    return Err(RecordError::BadTraceFile(format!(
                        "event id {id} is claimed by two attrs"
                    )));
                }
            }
            self.attrs.push(AttrWithIds {
                attr,
                name: String::new(),
                ids,
            });
        }

        // EVENT_DESC, read later, carries the attr names; they are
        // filled in by read_feature_sections.
        Ok(())
    }

    fn read_feature_sections(&mut self) -> Result<()> {
        let features = self.header.feature_list();
        let headers_offset = self.header.data.offset + self.header.data.size;
        for (index, feature) in features.iter().enumerate() {
            let header_section = FileSection {
                offset: headers_offset + index as u64 * FILE_SECTION_SIZE,
                size: FILE_SECTION_SIZE,
            };
            let mut header_bytes = self.section(header_section, "feature header")?;
            let payload_section = FileSection::read(&mut header_bytes)
                .map_err(|e| RecordError::BadTraceFile(e.to_string()))?;
            let payload = self.section(payload_section, feature.name())?;
            let content = FeatureContent::decode(*feature, payload)
                .map_err(|e| RecordError::BadTraceFile(format!("{}: {e}", feature.name())))?;
            self.features.push((*feature, content));
        }

        for (feature, content) in &self.features {
            match (feature, content) {
                (Feature::FilesUniStackTable, FeatureContent::UniStackTable(bytes)) => {
                    self.unistack = Some(
                        UniStackTable::read(bytes)
                            .map_err(|e| RecordError::BadTraceFile(e.to_string()))?,
                    );
                }
                (Feature::EventDesc, FeatureContent::EventDesc(entries)) => {
                    for entry in entries {
                        for attr in self.attrs.iter_mut() {
                            if attr.ids == entry.ids {
                                attr.name = entry.name.clone();
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn attrs(&self) -> &[AttrWithIds] {
        &self.attrs
    }

    pub fn features(&self) -> &[(Feature, FeatureContent)] {
        &self.features
    }

    pub fn feature(&self, wanted: Feature) -> Option<&FeatureContent> {
        self.features
            .iter()
            .find(|(feature, _)| *feature == wanted)
            .map(|(_, content)| content)
    }

    pub fn feature_string(&self, wanted: Feature) -> Option<&str> {
        self.feature(wanted).and_then(|content| content.as_string())
    }

    pub fn unistack_table(&self) -> Option<&UniStackTable> {
        self.unistack.as_ref()
    }

    pub fn was_compressed(&self) -> bool {
        self.was_compressed
    }

    pub fn attr_index_for_id(&self, id: u64) -> Option<usize> {
        self.id_to_attr.get(&id).copied()
    }

    fn format_for(&self, kind: u32, payload: &[u8]) -> SampleFormat {
        use crate::perf_event::sys::{PERF_RECORD_CALLCHAIN, PERF_RECORD_SAMPLE};
        let default = SampleFormat::from_attr(&self.attrs[0].attr);
        let is_sample = kind == PERF_RECORD_SAMPLE || kind == PERF_RECORD_CALLCHAIN;
        if !is_sample || payload.len() < 8 {
            return default;
        }
        // With PERF_SAMPLE_IDENTIFIER the sample's id leads the payload
        // and selects the right attr.
        if default.sample_type & crate::perf_event::sys::PERF_SAMPLE_IDENTIFIER == 0 {
            return default;
        }
        let id = LittleEndian::read_u64(&payload[..8]);
        match self.id_to_attr.get(&id) {
            Some(&attr_index) => SampleFormat::from_attr(&self.attrs[attr_index].attr),
            None => default,
        }
    }

    /// Iterate the data section. Samples deduplicated at record time are
    /// transparently restored from the unique-stack table.
    pub fn read_records(&self, mut consume: impl FnMut(PerfRecord)) -> Result<()> {
        let data = self.section(self.header.data, "data")?;
        let mut remaining = data;
        while remaining.len() >= PERF_EVENT_HEADER_SIZE {
            let kind = LittleEndian::read_u32(&remaining[0..4]);
            let misc = LittleEndian::read_u16(&remaining[4..6]);
            let size = LittleEndian::read_u16(&remaining[6..8]) as usize;
            if size < PERF_EVENT_HEADER_SIZE || size > RECORD_SIZE_LIMIT {
                return Err(RecordError::BadTraceFile(format!(
                    "record header claims size {size}"
                )));
            }
            if size > remaining.len() {
                return Err(RecordError::BadTraceFile(
                    "record extends past the data section".into(),
                ));
            }
            let payload = &remaining[PERF_EVENT_HEADER_SIZE..size];
            let format = self.format_for(kind, payload);
            let mut record = PerfRecord::parse(&format, kind, misc, RawData::Single(payload))
                .map_err(|e| RecordError::BadTraceFile(e.to_string()))?;
            remaining = &remaining[size..];

            // Auxtrace payloads ride behind the record.
            if let PerfRecord::Auxtrace(auxtrace) = &mut record {
                debug_assert_eq!(kind, PERF_RECORD_AUXTRACE);
                let aux_len = auxtrace.size as usize;
                if aux_len > remaining.len() {
                    return Err(RecordError::BadTraceFile(
                        "auxtrace data extends past the data section".into(),
                    ));
                }
                auxtrace.data = remaining[..aux_len].to_vec();
                remaining = &remaining[aux_len..];
            }

            if let PerfRecord::Sample(sample) = &mut record {
                if let (Some(stack_id), Some(table)) = (sample.stack_id, &self.unistack) {
                    if let Some(ips) = table.expand(stack_id) {
                        sample.recover_call_stack(ips);
                    }
                }
            }

            consume(record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_format::writer::RecordFileWriter;
    use crate::perf_event::sys::*;
    use crate::record::{CommRecord, LostRecord, SampleId, SampleRecord};

    fn test_attr() -> PerfEventAttr {
        let mut attr = PerfEventAttr::default();
        attr.kind = PERF_TYPE_SOFTWARE;
        attr.config = PERF_COUNT_SW_CPU_CLOCK;
        attr.sample_type = PERF_SAMPLE_IDENTIFIER
            | PERF_SAMPLE_IP
            | PERF_SAMPLE_TID
            | PERF_SAMPLE_TIME
            | PERF_SAMPLE_ID
            | PERF_SAMPLE_STREAM_ID
            | PERF_SAMPLE_CPU
            | PERF_SAMPLE_PERIOD
            | PERF_SAMPLE_CALLCHAIN;
        attr.flags = PERF_ATTR_FLAG_SAMPLE_ID_ALL;
        attr
    }

    fn attrs_with_ids() -> Vec<AttrWithIds> {
        vec![AttrWithIds {
            attr: test_attr(),
            name: "sw-cpu-clock".into(),
            ids: vec![100, 101],
        }]
    }

    fn sample(id: u64, time: u64, ips: Vec<u64>) -> PerfRecord {
        PerfRecord::Sample(SampleRecord {
            misc: PERF_RECORD_MISC_USER,
            id,
            ip: ips.first().copied().unwrap_or(0),
            pid: 7,
            tid: 7,
            time,
            stream_id: id,
            cpu: 0,
            period: 1,
            ips,
            ..Default::default()
        })
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("perfrec-test-{}-{name}", std::process::id()));
        path
    }

    #[test]
    fn writer_reader_round_trip() {
        let path = temp_path("round-trip.data");
        let attrs = attrs_with_ids();
        let mut writer = RecordFileWriter::new(&path, &attrs, false).unwrap();

        let records = vec![
            PerfRecord::Comm(CommRecord {
                misc: PERF_RECORD_MISC_USER,
                pid: 7,
                tid: 7,
                comm: b"worker".to_vec(),
                sample_id: Some(SampleId::default()),
            }),
            sample(100, 1000, vec![0x1000, 0x2000]),
            PerfRecord::Lost(LostRecord {
                misc: 0,
                id: 100,
                lost: 3,
                sample_id: Some(SampleId::default()),
            }),
        ];
        for record in &records {
            writer.write_record(record).unwrap();
        }
        writer.add_feature(
            Feature::Hostname,
            &FeatureContent::String("testhost".into()),
        );
        writer.add_feature(
            Feature::Cmdline,
            &FeatureContent::String("perfrec record -a".into()),
        );
        writer.finish().unwrap();

        let reader = RecordFileReader::open(&path).unwrap();
        assert_eq!(reader.attrs().len(), 1);
        assert_eq!(reader.attrs()[0].ids, vec![100, 101]);
        assert_eq!(reader.attr_index_for_id(101), Some(0));
        assert_eq!(reader.attr_index_for_id(42), None);
        assert_eq!(reader.feature_string(Feature::Hostname), Some("testhost"));
        assert!(reader.feature(Feature::Version).is_none());
        assert!(reader.header.has_feature(Feature::Cmdline));

        let mut seen = Vec::new();
        reader.read_records(|record| seen.push(record)).unwrap();
        assert_eq!(seen.len(), 3);
        match &seen[1] {
            PerfRecord::Sample(s) => {
                assert_eq!(s.id, 100);
                assert_eq!(s.time, 1000);
                assert_eq!(s.ips, vec![0x1000, 0x2000]);
            }
            other => panic!("wrong record {}", other.name()),
        }
        match &seen[2] {
            PerfRecord::Lost(l) => assert_eq!(l.lost, 3),
            other => panic!("wrong record {}", other.name()),
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn empty_stream_is_a_valid_file() {
        let path = temp_path("empty.data");
        let writer = RecordFileWriter::new(&path, &attrs_with_ids(), false).unwrap();
        writer.finish().unwrap();

        let reader = RecordFileReader::open(&path).unwrap();
        assert_eq!(reader.header.data.size, 0);
        let mut count = 0;
        reader.read_records(|_| count += 1).unwrap();
        assert_eq!(count, 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn gzip_round_trip() {
        let path = temp_path("compressed.data");
        let mut writer = RecordFileWriter::new(&path, &attrs_with_ids(), true).unwrap();
        writer.write_record(&sample(100, 5, vec![0xabc])).unwrap();
        writer.finish().unwrap();

        // The file on disk is gzip; the reader inflates transparently.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);

        let reader = RecordFileReader::open(&path).unwrap();
        assert!(reader.was_compressed());
        let mut times = Vec::new();
        reader
            .read_records(|record| times.push(record.time().unwrap()))
            .unwrap();
        assert_eq!(times, vec![5]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dedup_stacks_recover_through_the_table() {
        use crate::dedup::UniStackTable;

        let path = temp_path("dedup.data");
        let mut writer = RecordFileWriter::new(&path, &attrs_with_ids(), false).unwrap();

        let mut table = UniStackTable::new();
        let chain = vec![0x11, 0x22, 0x33];
        let mut deduped = match sample(100, 9, chain.clone()) {
            PerfRecord::Sample(s) => s,
            _ => unreachable!(),
        };
        let stack_id = table.intern(&deduped.ips);
        deduped.ips.clear();
        deduped.stack_id = Some(stack_id);
        writer.write_record(&PerfRecord::Sample(deduped)).unwrap();

        let mut payload = Vec::new();
        table.write(&mut payload);
        writer.add_feature(
            Feature::FilesUniStackTable,
            &FeatureContent::UniStackTable(payload),
        );
        writer.finish().unwrap();

        let reader = RecordFileReader::open(&path).unwrap();
        assert!(reader.unistack_table().is_some());
        let mut restored = Vec::new();
        reader
            .read_records(|record| {
                if let PerfRecord::Sample(s) = record {
                    restored = s.ips;
                }
            })
            .unwrap();
        assert_eq!(restored, chain);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn duplicate_event_ids_are_rejected() {
        let path = temp_path("dup-ids.data");
        let attrs = vec![
            AttrWithIds {
                attr: test_attr(),
                name: "a".into(),
                ids: vec![100],
            },
            AttrWithIds {
                attr: test_attr(),
                name: "b".into(),
                ids: vec![100],
            },
        ];
        let writer = RecordFileWriter::new(&path, &attrs, false).unwrap();
        writer.finish().unwrap();
        // id 100 is claimed by both attrs; the id -> attr mapping must
        // be injective.
        assert!(RecordFileReader::open(&path).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn truncated_file_is_rejected() {
        let path = temp_path("truncated.data");
        let mut writer = RecordFileWriter::new(&path, &attrs_with_ids(), false).unwrap();
        writer.write_record(&sample(100, 1, vec![1, 2, 3])).unwrap();
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() / 2);
        std::fs::write(&path, &bytes).unwrap();
        assert!(RecordFileReader::open(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
