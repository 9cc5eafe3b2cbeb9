//! The non-sample record kinds.

use std::io;

use byteorder::{LittleEndian, WriteBytesExt};

use super::raw_data::RawData;
use super::SampleId;

fn write_path(out: &mut Vec<u8>, bytes: &[u8]) {
    // Kernel pads the filename with NULs to a u64 boundary.
    out.extend_from_slice(bytes);
    out.push(0);
    while (out.len()) % 8 != 0 {
        out.push(0);
    }
}

#[derive(Debug, Clone)]
pub struct MmapRecord {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub page_offset: u64,
    pub filename: Vec<u8>,
    pub sample_id: Option<SampleId>,
}

impl MmapRecord {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let pid = data.read_u32::<LittleEndian>()?;
        let tid = data.read_u32::<LittleEndian>()?;
        let addr = data.read_u64::<LittleEndian>()?;
        let len = data.read_u64::<LittleEndian>()?;
        let page_offset = data.read_u64::<LittleEndian>()?;
        let filename = data.read_string().unwrap_or_else(|_| data.to_vec());
        Ok(MmapRecord {
            misc,
            pid,
            tid,
            addr,
            len,
            page_offset,
            filename,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.pid).unwrap();
        out.write_u32::<LittleEndian>(self.tid).unwrap();
        out.write_u64::<LittleEndian>(self.addr).unwrap();
        out.write_u64::<LittleEndian>(self.len).unwrap();
        out.write_u64::<LittleEndian>(self.page_offset).unwrap();
        write_path(out, &self.filename);
    }
}

#[derive(Debug, Clone)]
pub struct Mmap2Record {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub page_offset: u64,
    pub major: u32,
    pub minor: u32,
    pub inode: u64,
    pub inode_generation: u64,
    pub protection: u32,
    pub flags: u32,
    pub filename: Vec<u8>,
    pub sample_id: Option<SampleId>,
}

impl Mmap2Record {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let pid = data.read_u32::<LittleEndian>()?;
        let tid = data.read_u32::<LittleEndian>()?;
        let addr = data.read_u64::<LittleEndian>()?;
        let len = data.read_u64::<LittleEndian>()?;
        let page_offset = data.read_u64::<LittleEndian>()?;
        let major = data.read_u32::<LittleEndian>()?;
        let minor = data.read_u32::<LittleEndian>()?;
        let inode = data.read_u64::<LittleEndian>()?;
        let inode_generation = data.read_u64::<LittleEndian>()?;
        let protection = data.read_u32::<LittleEndian>()?;
        let flags = data.read_u32::<LittleEndian>()?;
        let filename = data.read_string().unwrap_or_else(|_| data.to_vec());
        Ok(Mmap2Record {
            misc,
            pid,
            tid,
            addr,
            len,
            page_offset,
            major,
            minor,
            inode,
            inode_generation,
            protection,
            flags,
            filename,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.pid).unwrap();
        out.write_u32::<LittleEndian>(self.tid).unwrap();
        out.write_u64::<LittleEndian>(self.addr).unwrap();
        out.write_u64::<LittleEndian>(self.len).unwrap();
        out.write_u64::<LittleEndian>(self.page_offset).unwrap();
        out.write_u32::<LittleEndian>(self.major).unwrap();
        out.write_u32::<LittleEndian>(self.minor).unwrap();
        out.write_u64::<LittleEndian>(self.inode).unwrap();
        out.write_u64::<LittleEndian>(self.inode_generation).unwrap();
        out.write_u32::<LittleEndian>(self.protection).unwrap();
        out.write_u32::<LittleEndian>(self.flags).unwrap();
        write_path(out, &self.filename);
    }

    pub fn is_executable(&self) -> bool {
        self.protection & libc::PROT_EXEC as u32 != 0
    }
}

#[derive(Debug, Clone)]
pub struct CommRecord {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub comm: Vec<u8>,
    pub sample_id: Option<SampleId>,
}

impl CommRecord {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let pid = data.read_u32::<LittleEndian>()?;
        let tid = data.read_u32::<LittleEndian>()?;
        let comm = data.read_string().unwrap_or_else(|_| data.to_vec());
        Ok(CommRecord {
            misc,
            pid,
            tid,
            comm,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.pid).unwrap();
        out.write_u32::<LittleEndian>(self.tid).unwrap();
        write_path(out, &self.comm);
    }

    pub fn is_execve(&self) -> bool {
        self.misc & crate::perf_event::sys::PERF_RECORD_MISC_COMM_EXEC != 0
    }
}

/// FORK and EXIT share this layout.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub misc: u16,
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
    pub sample_id: Option<SampleId>,
}

impl TaskRecord {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let pid = data.read_u32::<LittleEndian>()?;
        let ppid = data.read_u32::<LittleEndian>()?;
        let tid = data.read_u32::<LittleEndian>()?;
        let ptid = data.read_u32::<LittleEndian>()?;
        let time = data.read_u64::<LittleEndian>()?;
        Ok(TaskRecord {
            misc,
            pid,
            ppid,
            tid,
            ptid,
            time,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.pid).unwrap();
        out.write_u32::<LittleEndian>(self.ppid).unwrap();
        out.write_u32::<LittleEndian>(self.tid).unwrap();
        out.write_u32::<LittleEndian>(self.ptid).unwrap();
        out.write_u64::<LittleEndian>(self.time).unwrap();
    }
}

#[derive(Debug, Clone)]
pub struct LostRecord {
    pub misc: u16,
    pub id: u64,
    pub lost: u64,
    pub sample_id: Option<SampleId>,
}

impl LostRecord {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let id = data.read_u64::<LittleEndian>()?;
        let lost = data.read_u64::<LittleEndian>()?;
        Ok(LostRecord {
            misc,
            id,
            lost,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u64::<LittleEndian>(self.id).unwrap();
        out.write_u64::<LittleEndian>(self.lost).unwrap();
    }
}

#[derive(Debug, Clone)]
pub struct LostSamplesRecord {
    pub misc: u16,
    pub lost: u64,
    pub sample_id: Option<SampleId>,
}

impl LostSamplesRecord {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let lost = data.read_u64::<LittleEndian>()?;
        Ok(LostSamplesRecord {
            misc,
            lost,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u64::<LittleEndian>(self.lost).unwrap();
    }
}

/// THROTTLE and UNTHROTTLE share this layout.
#[derive(Debug, Clone)]
pub struct ThrottleRecord {
    pub misc: u16,
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
    pub sample_id: Option<SampleId>,
}

impl ThrottleRecord {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let time = data.read_u64::<LittleEndian>()?;
        let id = data.read_u64::<LittleEndian>()?;
        let stream_id = data.read_u64::<LittleEndian>()?;
        Ok(ThrottleRecord {
            misc,
            time,
            id,
            stream_id,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u64::<LittleEndian>(self.time).unwrap();
        out.write_u64::<LittleEndian>(self.id).unwrap();
        out.write_u64::<LittleEndian>(self.stream_id).unwrap();
    }
}

/// The read_format-dependent value block is kept as raw bytes; nothing in
/// the pipeline consumes individual counter values.
#[derive(Debug, Clone)]
pub struct ReadRecord {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub values: Vec<u8>,
    pub sample_id: Option<SampleId>,
}

impl ReadRecord {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let pid = data.read_u32::<LittleEndian>()?;
        let tid = data.read_u32::<LittleEndian>()?;
        let values = data.to_vec();
        Ok(ReadRecord {
            misc,
            pid,
            tid,
            values,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.pid).unwrap();
        out.write_u32::<LittleEndian>(self.tid).unwrap();
        out.extend_from_slice(&self.values);
    }
}

#[derive(Debug, Clone)]
pub struct AuxRecord {
    pub misc: u16,
    pub aux_offset: u64,
    pub aux_size: u64,
    pub flags: u64,
    pub sample_id: Option<SampleId>,
}

impl AuxRecord {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let aux_offset = data.read_u64::<LittleEndian>()?;
        let aux_size = data.read_u64::<LittleEndian>()?;
        let flags = data.read_u64::<LittleEndian>()?;
        Ok(AuxRecord {
            misc,
            aux_offset,
            aux_size,
            flags,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u64::<LittleEndian>(self.aux_offset).unwrap();
        out.write_u64::<LittleEndian>(self.aux_size).unwrap();
        out.write_u64::<LittleEndian>(self.flags).unwrap();
    }
}

#[derive(Debug, Clone)]
pub struct ItraceStartRecord {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub sample_id: Option<SampleId>,
}

impl ItraceStartRecord {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let pid = data.read_u32::<LittleEndian>()?;
        let tid = data.read_u32::<LittleEndian>()?;
        Ok(ItraceStartRecord {
            misc,
            pid,
            tid,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.pid).unwrap();
        out.write_u32::<LittleEndian>(self.tid).unwrap();
    }
}

/// SWITCH has no payload; in/out is carried in misc.
#[derive(Debug, Clone)]
pub struct SwitchRecord {
    pub misc: u16,
    pub sample_id: Option<SampleId>,
}

impl SwitchRecord {
    pub fn parse(misc: u16, sample_id: Option<SampleId>) -> io::Result<Self> {
        Ok(SwitchRecord { misc, sample_id })
    }

    pub fn is_switch_out(&self) -> bool {
        self.misc & crate::perf_event::sys::PERF_RECORD_MISC_SWITCH_OUT != 0
    }
}

#[derive(Debug, Clone)]
pub struct SwitchCpuWideRecord {
    pub misc: u16,
    pub next_prev_pid: u32,
    pub next_prev_tid: u32,
    pub sample_id: Option<SampleId>,
}

impl SwitchCpuWideRecord {
    pub fn parse(
        misc: u16,
        sample_id: Option<SampleId>,
        mut data: RawData,
    ) -> io::Result<Self> {
        let next_prev_pid = data.read_u32::<LittleEndian>()?;
        let next_prev_tid = data.read_u32::<LittleEndian>()?;
        Ok(SwitchCpuWideRecord {
            misc,
            next_prev_pid,
            next_prev_tid,
            sample_id,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.next_prev_pid).unwrap();
        out.write_u32::<LittleEndian>(self.next_prev_tid).unwrap();
    }
}

/// The auxtrace payload follows the record in the stream and is not
/// counted in header.size.
#[derive(Debug, Clone)]
pub struct AuxtraceRecord {
    pub misc: u16,
    pub size: u64,
    pub offset: u64,
    pub reference: u64,
    pub idx: u32,
    pub tid: u32,
    pub cpu: u32,
    pub reserved: u32,
    pub data: Vec<u8>,
}

impl AuxtraceRecord {
    pub fn parse(misc: u16, mut data: RawData) -> io::Result<Self> {
        let size = data.read_u64::<LittleEndian>()?;
        let offset = data.read_u64::<LittleEndian>()?;
        let reference = data.read_u64::<LittleEndian>()?;
        let idx = data.read_u32::<LittleEndian>()?;
        let tid = data.read_u32::<LittleEndian>()?;
        let cpu = data.read_u32::<LittleEndian>()?;
        let reserved = data.read_u32::<LittleEndian>()?;
        Ok(AuxtraceRecord {
            misc,
            size,
            offset,
            reference,
            idx,
            tid,
            cpu,
            reserved,
            data: Vec::new(),
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u64::<LittleEndian>(self.size).unwrap();
        out.write_u64::<LittleEndian>(self.offset).unwrap();
        out.write_u64::<LittleEndian>(self.reference).unwrap();
        out.write_u32::<LittleEndian>(self.idx).unwrap();
        out.write_u32::<LittleEndian>(self.tid).unwrap();
        out.write_u32::<LittleEndian>(self.cpu).unwrap();
        out.write_u32::<LittleEndian>(self.reserved).unwrap();
        out.extend_from_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct TimeConvRecord {
    pub misc: u16,
    pub time_shift: u64,
    pub time_mult: u64,
    pub time_zero: u64,
}

impl TimeConvRecord {
    pub fn parse(misc: u16, mut data: RawData) -> io::Result<Self> {
        let time_shift = data.read_u64::<LittleEndian>()?;
        let time_mult = data.read_u64::<LittleEndian>()?;
        let time_zero = data.read_u64::<LittleEndian>()?;
        Ok(TimeConvRecord {
            misc,
            time_shift,
            time_mult,
            time_zero,
        })
    }

    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.write_u64::<LittleEndian>(self.time_shift).unwrap();
        out.write_u64::<LittleEndian>(self.time_mult).unwrap();
        out.write_u64::<LittleEndian>(self.time_zero).unwrap();
    }
}

/// Catch-all for record kinds we carry through without interpretation
/// (CPU_MAP, AUXTRACE_INFO, and anything future).
#[derive(Debug, Clone)]
pub struct OpaqueRecord {
    pub kind: u32,
    pub misc: u16,
    pub payload: Vec<u8>,
}
