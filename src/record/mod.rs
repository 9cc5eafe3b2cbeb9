//! Parsed perf event records.
//!
//! Every record is one tagged value; `PerfRecord::parse` is the single
//! entry point for bytes coming out of a ring buffer or a trace file, and
//! `PerfRecord::to_bytes` is the single serializer. Kernel-origin records
//! carry a trailing `SampleId` block (we always enable
//! PERF_ATTR_FLAG_SAMPLE_ID_ALL); synthesized records get one too so the
//! on-disk stream parses uniformly.

pub mod raw_data;
mod records;
mod sample;

use std::io;

use byteorder::LittleEndian;

pub use self::raw_data::RawData;
pub use self::records::*;
pub use self::sample::SampleRecord;
use crate::perf_event::sys::*;

/// Regular records are bounded by the u16 size field; auxtrace payloads
/// ride behind the record and may be larger.
pub const RECORD_SIZE_LIMIT: usize = 65535;
pub const RECORD_SIZE_LIMIT_AUX: usize = 524288;

/// What of the attr a record parser needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    pub sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_id_all: bool,
}

impl SampleFormat {
    pub fn from_attr(attr: &PerfEventAttr) -> Self {
        SampleFormat {
            sample_type: attr.sample_type,
            sample_regs_user: attr.sample_regs_user,
            sample_id_all: attr.flags & PERF_ATTR_FLAG_SAMPLE_ID_ALL != 0,
        }
    }

    /// Byte length of the sample_id trailer on non-sample records.
    pub fn sample_id_len(&self) -> usize {
        if !self.sample_id_all {
            return 0;
        }
        let mut len = 0;
        if self.sample_type & PERF_SAMPLE_TID != 0 {
            len += 8;
        }
        if self.sample_type & PERF_SAMPLE_TIME != 0 {
            len += 8;
        }
        if self.sample_type & PERF_SAMPLE_ID != 0 {
            len += 8;
        }
        if self.sample_type & PERF_SAMPLE_STREAM_ID != 0 {
            len += 8;
        }
        if self.sample_type & PERF_SAMPLE_CPU != 0 {
            len += 8;
        }
        if self.sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            len += 8;
        }
        len
    }
}

/// The trailing block shared by all non-sample kernel records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleId {
    pub pid: i32,
    pub tid: i32,
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
    pub cpu: u32,
}

impl SampleId {
    fn parse(format: &SampleFormat, data: &mut RawData) -> io::Result<SampleId> {
        let mut sid = SampleId::default();
        if format.sample_type & PERF_SAMPLE_TID != 0 {
            sid.pid = data.read_i32::<LittleEndian>()?;
            sid.tid = data.read_i32::<LittleEndian>()?;
        }
        if format.sample_type & PERF_SAMPLE_TIME != 0 {
            sid.time = data.read_u64::<LittleEndian>()?;
        }
        if format.sample_type & PERF_SAMPLE_ID != 0 {
            sid.id = data.read_u64::<LittleEndian>()?;
        }
        if format.sample_type & PERF_SAMPLE_STREAM_ID != 0 {
            sid.stream_id = data.read_u64::<LittleEndian>()?;
        }
        if format.sample_type & PERF_SAMPLE_CPU != 0 {
            sid.cpu = data.read_u32::<LittleEndian>()?;
            data.read_u32::<LittleEndian>()?;
        }
        if format.sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            sid.id = data.read_u64::<LittleEndian>()?;
        }
        Ok(sid)
    }

    fn write(&self, format: &SampleFormat, out: &mut Vec<u8>) {
        use byteorder::WriteBytesExt;
        if format.sample_type & PERF_SAMPLE_TID != 0 {
            out.write_i32::<LittleEndian>(self.pid).unwrap();
            out.write_i32::<LittleEndian>(self.tid).unwrap();
        }
        if format.sample_type & PERF_SAMPLE_TIME != 0 {
            out.write_u64::<LittleEndian>(self.time).unwrap();
        }
        if format.sample_type & PERF_SAMPLE_ID != 0 {
            out.write_u64::<LittleEndian>(self.id).unwrap();
        }
        if format.sample_type & PERF_SAMPLE_STREAM_ID != 0 {
            out.write_u64::<LittleEndian>(self.stream_id).unwrap();
        }
        if format.sample_type & PERF_SAMPLE_CPU != 0 {
            out.write_u32::<LittleEndian>(self.cpu).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
        }
        if format.sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            out.write_u64::<LittleEndian>(self.id).unwrap();
        }
    }
}

#[derive(Debug, Clone)]
pub enum PerfRecord {
    Sample(SampleRecord),
    Mmap(MmapRecord),
    Mmap2(Mmap2Record),
    Comm(CommRecord),
    Fork(TaskRecord),
    Exit(TaskRecord),
    Lost(LostRecord),
    LostSamples(LostSamplesRecord),
    Throttle(ThrottleRecord),
    Unthrottle(ThrottleRecord),
    Read(ReadRecord),
    Aux(AuxRecord),
    ItraceStart(ItraceStartRecord),
    Switch(SwitchRecord),
    SwitchCpuWide(SwitchCpuWideRecord),
    Auxtrace(AuxtraceRecord),
    TimeConv(TimeConvRecord),
    Opaque(OpaqueRecord),
}

impl PerfRecord {
    /// Parse one record. `data` is the payload after the 8-byte header.
    pub fn parse(
        format: &SampleFormat,
        kind: u32,
        misc: u16,
        mut data: RawData,
    ) -> io::Result<PerfRecord> {
        // Kernel-origin records end with the sample_id trailer; split it
        // off first so the per-kind parsers see only their payload.
        let sample_id = if kind != PERF_RECORD_SAMPLE && kind < 64 && format.sample_id_all {
            let trailer_len = format.sample_id_len();
            let payload_len = data
                .len()
                .checked_sub(trailer_len)
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            let mut trailer = data;
            trailer.skip(payload_len)?;
            let sid = SampleId::parse(format, &mut trailer)?;
            data.truncate(payload_len);
            Some(sid)
        } else {
            None
        };

        let record = match kind {
            PERF_RECORD_SAMPLE | PERF_RECORD_CALLCHAIN => {
                PerfRecord::Sample(SampleRecord::parse(format, misc, data)?)
            }
            PERF_RECORD_MMAP => PerfRecord::Mmap(MmapRecord::parse(misc, sample_id, data)?),
            PERF_RECORD_MMAP2 => {
                PerfRecord::Mmap2(Mmap2Record::parse(misc, sample_id, data)?)
            }
            PERF_RECORD_COMM => PerfRecord::Comm(CommRecord::parse(misc, sample_id, data)?),
            PERF_RECORD_FORK => PerfRecord::Fork(TaskRecord::parse(misc, sample_id, data)?),
            PERF_RECORD_EXIT => PerfRecord::Exit(TaskRecord::parse(misc, sample_id, data)?),
            PERF_RECORD_LOST => PerfRecord::Lost(LostRecord::parse(misc, sample_id, data)?),
            PERF_RECORD_LOST_SAMPLES => {
                PerfRecord::LostSamples(LostSamplesRecord::parse(misc, sample_id, data)?)
            }
            PERF_RECORD_THROTTLE => {
                PerfRecord::Throttle(ThrottleRecord::parse(misc, sample_id, data)?)
            }
            PERF_RECORD_UNTHROTTLE => {
                PerfRecord::Unthrottle(ThrottleRecord::parse(misc, sample_id, data)?)
            }
            PERF_RECORD_READ => PerfRecord::Read(ReadRecord::parse(misc, sample_id, data)?),
            PERF_RECORD_AUX => PerfRecord::Aux(AuxRecord::parse(misc, sample_id, data)?),
            PERF_RECORD_ITRACE_START => {
                PerfRecord::ItraceStart(ItraceStartRecord::parse(misc, sample_id, data)?)
            }
            PERF_RECORD_SWITCH => {
                PerfRecord::Switch(SwitchRecord::parse(misc, sample_id)?)
            }
            PERF_RECORD_SWITCH_CPU_WIDE => {
                PerfRecord::SwitchCpuWide(SwitchCpuWideRecord::parse(misc, sample_id, data)?)
            }
            PERF_RECORD_AUXTRACE => {
                PerfRecord::Auxtrace(AuxtraceRecord::parse(misc, data)?)
            }
            PERF_RECORD_TIME_CONV => {
                PerfRecord::TimeConv(TimeConvRecord::parse(misc, data)?)
            }
            other => PerfRecord::Opaque(OpaqueRecord {
                kind: other,
                misc,
                payload: data.to_vec(),
            }),
        };
        Ok(record)
    }

    pub fn record_type(&self) -> u32 {
        match self {
            PerfRecord::Sample(s) if s.stack_id.is_some() => PERF_RECORD_CALLCHAIN,
            PerfRecord::Sample(_) => PERF_RECORD_SAMPLE,
            PerfRecord::Mmap(_) => PERF_RECORD_MMAP,
            PerfRecord::Mmap2(_) => PERF_RECORD_MMAP2,
            PerfRecord::Comm(_) => PERF_RECORD_COMM,
            PerfRecord::Fork(_) => PERF_RECORD_FORK,
            PerfRecord::Exit(_) => PERF_RECORD_EXIT,
            PerfRecord::Lost(_) => PERF_RECORD_LOST,
            PerfRecord::LostSamples(_) => PERF_RECORD_LOST_SAMPLES,
            PerfRecord::Throttle(_) => PERF_RECORD_THROTTLE,
            PerfRecord::Unthrottle(_) => PERF_RECORD_UNTHROTTLE,
            PerfRecord::Read(_) => PERF_RECORD_READ,
            PerfRecord::Aux(_) => PERF_RECORD_AUX,
            PerfRecord::ItraceStart(_) => PERF_RECORD_ITRACE_START,
            PerfRecord::Switch(_) => PERF_RECORD_SWITCH,
            PerfRecord::SwitchCpuWide(_) => PERF_RECORD_SWITCH_CPU_WIDE,
            PerfRecord::Auxtrace(_) => PERF_RECORD_AUXTRACE,
            PerfRecord::TimeConv(_) => PERF_RECORD_TIME_CONV,
            PerfRecord::Opaque(r) => r.kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PerfRecord::Sample(_) => "sample",
            PerfRecord::Mmap(_) => "mmap",
            PerfRecord::Mmap2(_) => "mmap2",
            PerfRecord::Comm(_) => "comm",
            PerfRecord::Fork(_) => "fork",
            PerfRecord::Exit(_) => "exit",
            PerfRecord::Lost(_) => "lost",
            PerfRecord::LostSamples(_) => "lostSamples",
            PerfRecord::Throttle(_) => "throttle",
            PerfRecord::Unthrottle(_) => "unthrottle",
            PerfRecord::Read(_) => "read",
            PerfRecord::Aux(_) => "aux",
            PerfRecord::ItraceStart(_) => "itraceStart",
            PerfRecord::Switch(_) => "switch",
            PerfRecord::SwitchCpuWide(_) => "switchCpuWide",
            PerfRecord::Auxtrace(_) => "auxtrace",
            PerfRecord::TimeConv(_) => "timeconv",
            PerfRecord::Opaque(_) => "unknown",
        }
    }

    pub fn misc(&self) -> u16 {
        match self {
            PerfRecord::Sample(r) => r.misc,
            PerfRecord::Mmap(r) => r.misc,
            PerfRecord::Mmap2(r) => r.misc,
            PerfRecord::Comm(r) => r.misc,
            PerfRecord::Fork(r) | PerfRecord::Exit(r) => r.misc,
            PerfRecord::Lost(r) => r.misc,
            PerfRecord::LostSamples(r) => r.misc,
            PerfRecord::Throttle(r) | PerfRecord::Unthrottle(r) => r.misc,
            PerfRecord::Read(r) => r.misc,
            PerfRecord::Aux(r) => r.misc,
            PerfRecord::ItraceStart(r) => r.misc,
            PerfRecord::Switch(r) => r.misc,
            PerfRecord::SwitchCpuWide(r) => r.misc,
            PerfRecord::Auxtrace(r) => r.misc,
            PerfRecord::TimeConv(r) => r.misc,
            PerfRecord::Opaque(r) => r.misc,
        }
    }

    pub fn in_kernel(&self) -> bool {
        self.misc() & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL
    }

    /// Timestamp used for cross-buffer ordering; absent on records that
    /// carry no sample_id trailer.
    pub fn time(&self) -> Option<u64> {
        match self {
            PerfRecord::Sample(r) => Some(r.time),
            PerfRecord::Mmap(r) => r.sample_id.map(|s| s.time),
            PerfRecord::Mmap2(r) => r.sample_id.map(|s| s.time),
            PerfRecord::Comm(r) => r.sample_id.map(|s| s.time),
            PerfRecord::Fork(r) | PerfRecord::Exit(r) => Some(r.time),
            PerfRecord::Lost(r) => r.sample_id.map(|s| s.time),
            PerfRecord::LostSamples(r) => r.sample_id.map(|s| s.time),
            PerfRecord::Throttle(r) | PerfRecord::Unthrottle(r) => Some(r.time),
            PerfRecord::Read(r) => r.sample_id.map(|s| s.time),
            PerfRecord::Aux(r) => r.sample_id.map(|s| s.time),
            PerfRecord::ItraceStart(r) => r.sample_id.map(|s| s.time),
            PerfRecord::Switch(r) => r.sample_id.map(|s| s.time),
            PerfRecord::SwitchCpuWide(r) => r.sample_id.map(|s| s.time),
            _ => None,
        }
    }

    /// The pid a record belongs to, for `--exclude-hiperf` style filtering.
    pub fn pid(&self) -> Option<i32> {
        match self {
            PerfRecord::Sample(r) => Some(r.pid),
            PerfRecord::Mmap(r) => Some(r.pid as i32),
            PerfRecord::Mmap2(r) => Some(r.pid as i32),
            PerfRecord::Comm(r) => Some(r.pid as i32),
            PerfRecord::Fork(r) | PerfRecord::Exit(r) => Some(r.pid as i32),
            PerfRecord::ItraceStart(r) => Some(r.pid as i32),
            _ => None,
        }
    }

    /// Serialize header + payload (+ sample_id trailer) into `out`.
    /// Returns the number of bytes appended.
    pub fn to_bytes(&self, format: &SampleFormat, out: &mut Vec<u8>) -> usize {
        use byteorder::WriteBytesExt;

        let start = out.len();
        out.write_u32::<LittleEndian>(self.record_type()).unwrap();
        out.write_u16::<LittleEndian>(self.misc()).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap(); // size patched below

        // Trailer-eligible kinds always get one (zeroed if the producer
        // had nothing better), so the stream parses uniformly under
        // sample_id_all.
        let sample_id = match self {
            PerfRecord::Sample(r) => {
                r.write_payload(format, out);
                None
            }
            PerfRecord::Mmap(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::Mmap2(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::Comm(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::Fork(r) | PerfRecord::Exit(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::Lost(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::LostSamples(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::Throttle(r) | PerfRecord::Unthrottle(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::Read(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::Aux(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::ItraceStart(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::Switch(r) => Some(r.sample_id.unwrap_or_default()),
            PerfRecord::SwitchCpuWide(r) => {
                r.write_payload(out);
                Some(r.sample_id.unwrap_or_default())
            }
            PerfRecord::Auxtrace(r) => {
                r.write_payload(out);
                None
            }
            PerfRecord::TimeConv(r) => {
                r.write_payload(out);
                None
            }
            PerfRecord::Opaque(r) => {
                out.extend_from_slice(&r.payload);
                None
            }
        };

        if format.sample_id_all {
            if let Some(sid) = sample_id {
                sid.write(format, out);
            }
        }

        // Auxtrace data rides behind the record and is not part of
        // header.size.
        let trailing = match self {
            PerfRecord::Auxtrace(r) => r.data.len(),
            _ => 0,
        };

        let size = (out.len() - start - trailing) as u16;
        out[start + 6..start + 8].copy_from_slice(&size.to_le_bytes());
        out.len() - start
    }
}

impl RawData<'_> {
    /// Shrink the view to its first `len` bytes.
    fn truncate(&mut self, len: usize) {
        *self = match *self {
            RawData::Single(b) => RawData::Single(&b[..len]),
            RawData::Split(l, r) => {
                if len <= l.len() {
                    RawData::Single(&l[..len])
                } else {
                    RawData::Split(l, &r[..len - l.len()])
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> SampleFormat {
        SampleFormat {
            sample_type: PERF_SAMPLE_IP
                | PERF_SAMPLE_TID
                | PERF_SAMPLE_TIME
                | PERF_SAMPLE_ID
                | PERF_SAMPLE_STREAM_ID
                | PERF_SAMPLE_CPU
                | PERF_SAMPLE_PERIOD
                | PERF_SAMPLE_IDENTIFIER,
            sample_regs_user: 0,
            sample_id_all: true,
        }
    }

    #[test]
    fn sample_id_trailer_round_trip() {
        let format = format();
        let rec = PerfRecord::Comm(CommRecord {
            misc: PERF_RECORD_MISC_USER,
            pid: 10,
            tid: 11,
            comm: b"worker".to_vec(),
            sample_id: Some(SampleId {
                pid: 10,
                tid: 11,
                time: 1234,
                id: 7,
                stream_id: 7,
                cpu: 2,
            }),
        });
        let mut buf = Vec::new();
        rec.to_bytes(&format, &mut buf);

        let kind = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let misc = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        let size = u16::from_le_bytes(buf[6..8].try_into().unwrap()) as usize;
        assert_eq!(kind, PERF_RECORD_COMM);
        assert_eq!(size, buf.len());

        let parsed =
            PerfRecord::parse(&format, kind, misc, RawData::Single(&buf[8..size])).unwrap();
        match parsed {
            PerfRecord::Comm(c) => {
                assert_eq!(c.pid, 10);
                assert_eq!(c.comm, b"worker");
                assert_eq!(c.sample_id.unwrap().time, 1234);
                assert_eq!(c.sample_id.unwrap().cpu, 2);
            }
            other => panic!("wrong record: {}", other.name()),
        }
    }

    #[test]
    fn record_size_has_header_minimum() {
        let format = format();
        let rec = PerfRecord::Switch(SwitchRecord {
            misc: PERF_RECORD_MISC_SWITCH_OUT,
            sample_id: None,
        });
        let mut buf = Vec::new();
        let n = rec.to_bytes(&format, &mut buf);
        assert!(n >= PERF_EVENT_HEADER_SIZE);
        assert_eq!(n, buf.len());
    }

    #[test]
    fn fork_and_exit_share_layout() {
        let format = format();
        let rec = PerfRecord::Fork(TaskRecord {
            misc: 0,
            pid: 100,
            ppid: 1,
            tid: 100,
            ptid: 1,
            time: 55,
            sample_id: Some(SampleId::default()),
        });
        let mut buf = Vec::new();
        rec.to_bytes(&format, &mut buf);
        let size = u16::from_le_bytes(buf[6..8].try_into().unwrap()) as usize;
        let parsed = PerfRecord::parse(
            &format,
            PERF_RECORD_EXIT,
            0,
            RawData::Single(&buf[8..size]),
        )
        .unwrap();
        match parsed {
            PerfRecord::Exit(t) => {
                assert_eq!(t.pid, 100);
                assert_eq!(t.ppid, 1);
                assert_eq!(t.time, 55);
            }
            other => panic!("wrong record: {}", other.name()),
        }
    }
}
