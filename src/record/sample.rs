//! The SAMPLE record, including the in-line callstack replacement that
//! the unwinder and the dedup table perform on it.

use std::io;

use byteorder::{LittleEndian, WriteBytesExt};

use super::raw_data::RawData;
use super::SampleFormat;
use crate::perf_event::sys::*;

/// Marker value stored in the callchain `nr` field when the ips were
/// replaced by a dedup table id. Real chains are bounded far below this.
pub const STACK_ID_NR_MARKER: u64 = u64::MAX;

#[derive(Debug, Clone, Default)]
pub struct SampleRecord {
    pub misc: u16,
    pub id: u64,
    pub ip: u64,
    pub pid: i32,
    pub tid: i32,
    pub time: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub period: u64,
    /// Kernel-provided callchain (kernel frames first, context markers
    /// in-line). After in-line unwinding this also holds the user frames.
    pub ips: Vec<u64>,
    /// Raw tracepoint payload.
    pub raw: Vec<u8>,
    pub user_regs_abi: u64,
    pub user_regs: Vec<u64>,
    pub user_stack: Vec<u8>,
    pub dyn_stack_size: u64,
    /// Set when the chain was swapped for a unique-stack-table id.
    pub stack_id: Option<u32>,
}

impl SampleRecord {
    pub fn parse(format: &SampleFormat, misc: u16, mut data: RawData) -> io::Result<Self> {
        let st = format.sample_type;
        let mut sample = SampleRecord {
            misc,
            ..Default::default()
        };

        if st & PERF_SAMPLE_IDENTIFIER != 0 {
            sample.id = data.read_u64::<LittleEndian>()?;
        }
        if st & PERF_SAMPLE_IP != 0 {
            sample.ip = data.read_u64::<LittleEndian>()?;
        }
        if st & PERF_SAMPLE_TID != 0 {
            sample.pid = data.read_i32::<LittleEndian>()?;
            sample.tid = data.read_i32::<LittleEndian>()?;
        }
        if st & PERF_SAMPLE_TIME != 0 {
            sample.time = data.read_u64::<LittleEndian>()?;
        }
        if st & PERF_SAMPLE_ID != 0 {
            sample.id = data.read_u64::<LittleEndian>()?;
        }
        if st & PERF_SAMPLE_STREAM_ID != 0 {
            sample.stream_id = data.read_u64::<LittleEndian>()?;
        }
        if st & PERF_SAMPLE_CPU != 0 {
            sample.cpu = data.read_u32::<LittleEndian>()?;
            data.read_u32::<LittleEndian>()?;
        }
        if st & PERF_SAMPLE_PERIOD != 0 {
            sample.period = data.read_u64::<LittleEndian>()?;
        }
        if st & PERF_SAMPLE_CALLCHAIN != 0 {
            let nr = data.read_u64::<LittleEndian>()?;
            if nr == STACK_ID_NR_MARKER {
                sample.stack_id = Some(data.read_u64::<LittleEndian>()? as u32);
            } else {
                if nr as usize > RECORD_SIZE_LIMIT_CHAIN {
                    return Err(io::Error::from(io::ErrorKind::InvalidData));
                }
                let mut ips = Vec::with_capacity(nr as usize);
                for _ in 0..nr {
                    ips.push(data.read_u64::<LittleEndian>()?);
                }
                sample.ips = ips;
            }
        }
        if st & PERF_SAMPLE_RAW != 0 {
            let size = data.read_u32::<LittleEndian>()? as usize;
            sample.raw = data.read_vec(size)?;
        }
        if st & PERF_SAMPLE_REGS_USER != 0 {
            sample.user_regs_abi = data.read_u64::<LittleEndian>()?;
            if sample.user_regs_abi != PERF_SAMPLE_REGS_ABI_NONE {
                let count = format.sample_regs_user.count_ones() as usize;
                let mut regs = Vec::with_capacity(count);
                for _ in 0..count {
                    regs.push(data.read_u64::<LittleEndian>()?);
                }
                sample.user_regs = regs;
            }
        }
        if st & PERF_SAMPLE_STACK_USER != 0 {
            let size = data.read_u64::<LittleEndian>()? as usize;
            if size != 0 {
                sample.user_stack = data.read_vec(size)?;
                sample.dyn_stack_size = data.read_u64::<LittleEndian>()?;
            }
        }

        Ok(sample)
    }

    pub fn write_payload(&self, format: &SampleFormat, out: &mut Vec<u8>) {
        let st = format.sample_type;

        if st & PERF_SAMPLE_IDENTIFIER != 0 {
            out.write_u64::<LittleEndian>(self.id).unwrap();
        }
        if st & PERF_SAMPLE_IP != 0 {
            out.write_u64::<LittleEndian>(self.ip).unwrap();
        }
        if st & PERF_SAMPLE_TID != 0 {
            out.write_i32::<LittleEndian>(self.pid).unwrap();
            out.write_i32::<LittleEndian>(self.tid).unwrap();
        }
        if st & PERF_SAMPLE_TIME != 0 {
            out.write_u64::<LittleEndian>(self.time).unwrap();
        }
        if st & PERF_SAMPLE_ID != 0 {
            out.write_u64::<LittleEndian>(self.id).unwrap();
        }
        if st & PERF_SAMPLE_STREAM_ID != 0 {
            out.write_u64::<LittleEndian>(self.stream_id).unwrap();
        }
        if st & PERF_SAMPLE_CPU != 0 {
            out.write_u32::<LittleEndian>(self.cpu).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
        }
        if st & PERF_SAMPLE_PERIOD != 0 {
            out.write_u64::<LittleEndian>(self.period).unwrap();
        }
        if st & PERF_SAMPLE_CALLCHAIN != 0 {
            match self.stack_id {
                Some(id) => {
                    out.write_u64::<LittleEndian>(STACK_ID_NR_MARKER).unwrap();
                    out.write_u64::<LittleEndian>(id as u64).unwrap();
                }
                None => {
                    out.write_u64::<LittleEndian>(self.ips.len() as u64).unwrap();
                    for ip in &self.ips {
                        out.write_u64::<LittleEndian>(*ip).unwrap();
                    }
                }
            }
        }
        if st & PERF_SAMPLE_RAW != 0 {
            out.write_u32::<LittleEndian>(self.raw.len() as u32).unwrap();
            out.extend_from_slice(&self.raw);
        }
        if st & PERF_SAMPLE_REGS_USER != 0 {
            out.write_u64::<LittleEndian>(self.user_regs_abi).unwrap();
            if self.user_regs_abi != PERF_SAMPLE_REGS_ABI_NONE {
                for reg in &self.user_regs {
                    out.write_u64::<LittleEndian>(*reg).unwrap();
                }
            }
        }
        if st & PERF_SAMPLE_STACK_USER != 0 {
            out.write_u64::<LittleEndian>(self.user_stack.len() as u64)
                .unwrap();
            if !self.user_stack.is_empty() {
                out.extend_from_slice(&self.user_stack);
                out.write_u64::<LittleEndian>(self.dyn_stack_size).unwrap();
            }
        }
    }

    pub fn abi32(&self) -> bool {
        self.user_regs_abi == PERF_SAMPLE_REGS_ABI_32
    }

    /// The valid prefix of the stack snapshot. The kernel reports how many
    /// bytes were actually live in `dyn_stack_size`; everything past that
    /// is garbage from a previous sample in the ring.
    pub fn valid_stack(&self) -> &[u8] {
        let n = (self.dyn_stack_size as usize).min(self.user_stack.len());
        &self.user_stack[..n]
    }

    /// Kernel frames of the callchain, up to the first user context marker.
    pub fn kernel_ips(&self) -> &[u64] {
        let end = self
            .ips
            .iter()
            .position(|&ip| ip == PERF_CONTEXT_USER)
            .unwrap_or(self.ips.len());
        &self.ips[..end]
    }

    /// Splice the unwound user frames into the callchain and drop the
    /// register/stack snapshots, shrinking the record before it is
    /// written out.
    pub fn replace_with_call_stack(&mut self, user_pcs: impl IntoIterator<Item = u64>) {
        let kernel_len = self.kernel_ips().len();
        self.ips.truncate(kernel_len);
        self.ips.push(PERF_CONTEXT_USER);
        self.ips.extend(user_pcs);
        self.user_regs.clear();
        self.user_regs_abi = PERF_SAMPLE_REGS_ABI_NONE;
        self.user_stack.clear();
        self.dyn_stack_size = 0;
    }

    /// Undo of the dedup replacement, used by the reader once the
    /// unique-stack table has been loaded from the file tail.
    pub fn recover_call_stack(&mut self, ips: Vec<u64>) {
        self.stack_id = None;
        self.ips = ips;
    }
}

const RECORD_SIZE_LIMIT_CHAIN: usize = 8192;

#[cfg(test)]
mod tests {
    use super::*;

    fn dwarf_format() -> SampleFormat {
        SampleFormat {
            sample_type: PERF_SAMPLE_IDENTIFIER
                | PERF_SAMPLE_IP
                | PERF_SAMPLE_TID
                | PERF_SAMPLE_TIME
                | PERF_SAMPLE_ID
                | PERF_SAMPLE_STREAM_ID
                | PERF_SAMPLE_CPU
                | PERF_SAMPLE_PERIOD
                | PERF_SAMPLE_CALLCHAIN
                | PERF_SAMPLE_REGS_USER
                | PERF_SAMPLE_STACK_USER,
            sample_regs_user: 0b111,
            sample_id_all: true,
        }
    }

    fn sample() -> SampleRecord {
        SampleRecord {
            misc: PERF_RECORD_MISC_USER,
            id: 42,
            ip: 0x1000,
            pid: 7,
            tid: 8,
            time: 99,
            stream_id: 42,
            cpu: 1,
            period: 10007,
            ips: vec![PERF_CONTEXT_KERNEL, 0xffff_8000_0000_1234],
            user_regs_abi: PERF_SAMPLE_REGS_ABI_64,
            user_regs: vec![1, 2, 3],
            user_stack: vec![0xAA; 64],
            dyn_stack_size: 48,
            ..Default::default()
        }
    }

    fn round_trip(format: &SampleFormat, s: &SampleRecord) -> SampleRecord {
        let mut buf = Vec::new();
        s.write_payload(format, &mut buf);
        SampleRecord::parse(format, s.misc, RawData::Single(&buf)).unwrap()
    }

    #[test]
    fn dwarf_sample_round_trip() {
        let format = dwarf_format();
        let s = sample();
        let back = round_trip(&format, &s);
        assert_eq!(back.id, 42);
        assert_eq!(back.ip, 0x1000);
        assert_eq!((back.pid, back.tid), (7, 8));
        assert_eq!(back.ips, s.ips);
        assert_eq!(back.user_regs, s.user_regs);
        assert_eq!(back.user_stack, s.user_stack);
        assert_eq!(back.dyn_stack_size, 48);
    }

    #[test]
    fn valid_stack_is_the_dynamic_prefix() {
        let s = sample();
        assert_eq!(s.valid_stack().len(), 48);
    }

    #[test]
    fn replace_with_call_stack_drops_snapshots() {
        let mut s = sample();
        s.replace_with_call_stack([0x4000, 0x4100, 0x4200]);
        assert_eq!(
            s.ips,
            vec![
                PERF_CONTEXT_KERNEL,
                0xffff_8000_0000_1234,
                PERF_CONTEXT_USER,
                0x4000,
                0x4100,
                0x4200
            ]
        );
        assert!(s.user_regs.is_empty());
        assert!(s.user_stack.is_empty());
        assert_eq!(s.user_regs_abi, PERF_SAMPLE_REGS_ABI_NONE);

        // The shrunken record round-trips.
        let format = dwarf_format();
        let back = round_trip(&format, &s);
        assert_eq!(back.ips, s.ips);
        assert!(back.user_stack.is_empty());
    }

    #[test]
    fn stack_id_replacement_round_trips() {
        let format = dwarf_format();
        let mut s = sample();
        s.replace_with_call_stack([0x4000]);
        s.ips.clear();
        s.stack_id = Some(17);
        let back = round_trip(&format, &s);
        assert_eq!(back.stack_id, Some(17));
        assert!(back.ips.is_empty());
    }

    #[test]
    fn empty_callchain_falls_back_to_ip() {
        let format = dwarf_format();
        let mut s = sample();
        s.ips.clear();
        let back = round_trip(&format, &s);
        assert!(back.ips.is_empty());
        // The ip field still names the sampled instruction.
        assert_eq!(back.ip, 0x1000);
    }
}
