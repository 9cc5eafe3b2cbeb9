//! The in-memory model of every observed process, fed by kernel records
//! and /proc walks, and the per-sample unwind/symbolize pipeline built
//! on top of it.

pub mod maps;
pub mod proc_maps;
pub mod process;
pub mod thread;

use rustc_hash::FxHashMap;

use maps::{MapSet, Mapping};
use process::VirtualProcess;

use crate::dedup::UniStackTable;
use crate::perf_event::sys::*;
use crate::record::{CommRecord, Mmap2Record, MmapRecord, PerfRecord, SampleRecord, TaskRecord};
use crate::symbols::kernel::{KernelSpace, KERNEL_MMAP_NAME};
use crate::symbols::SymbolRegistry;
use crate::unwind::expand::CallStackExpander;
use crate::unwind::{CallStack, MAX_CALL_FRAME_UNWIND_SIZE};

/// A resolved stack frame: where it was, and what symbol (if any) the
/// address landed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub pc: u64,
    pub sp: u64,
    pub in_kernel: bool,
    pub symbols_file_index: Option<usize>,
    pub symbol_index: Option<usize>,
    pub func_offset: u64,
}

impl Frame {
    fn unresolved(pc: u64, in_kernel: bool) -> Frame {
        Frame {
            pc,
            sp: 0,
            in_kernel,
            symbols_file_index: None,
            symbol_index: None,
            func_offset: 0,
        }
    }
}

pub struct VirtualRuntime {
    pub processes: FxHashMap<i32, VirtualProcess>,
    pub symbols: SymbolRegistry,
    pub callstack: CallStack,
    pub expander: CallStackExpander,
    kernel_maps: MapSet,
    kernel_start: u64,
    disable_unwind: bool,
    expand_limit: usize,
    max_frames: usize,
}

impl VirtualRuntime {
    /// `load_kernel` pulls in kallsyms and /proc/modules; the reading
    /// side leaves it off and models kernel space from the recorded
    /// mmap stream instead.
    pub fn new(search_dirs: Vec<std::path::PathBuf>, load_kernel: bool) -> VirtualRuntime {
        let mut runtime = VirtualRuntime {
            processes: FxHashMap::default(),
            symbols: SymbolRegistry::new(search_dirs),
            callstack: CallStack::new(),
            expander: CallStackExpander::new(),
            kernel_maps: MapSet::default(),
            kernel_start: u64::MAX,
            disable_unwind: false,
            expand_limit: 1,
            max_frames: MAX_CALL_FRAME_UNWIND_SIZE,
        };
        if load_kernel {
            runtime.load_kernel_space(KernelSpace::load());
        }
        runtime
    }

    pub fn set_disable_unwind(&mut self, disable: bool) {
        self.disable_unwind = disable;
    }

    pub fn process_mut(&mut self, pid: i32) -> &mut VirtualProcess {
        self.processes
            .entry(pid)
            .or_insert_with(|| VirtualProcess::new(pid))
    }

    fn load_kernel_space(&mut self, space: KernelSpace) {
        let mut files = Vec::new();
        if let Some(kernel) = space.kernel {
            self.kernel_start = kernel.start_addr;
            files.push(kernel);
        }
        files.extend(space.modules);
        for file in files {
            let name = file.symbols_file.path.clone();
            let index = self.symbols.insert(file.symbols_file);
            self.kernel_maps.insert(Mapping {
                begin: file.start_addr,
                end: file.end_addr,
                page_offset: 0,
                protection: (libc::PROT_READ | libc::PROT_EXEC) as u32,
                flags: 0,
                major: 0,
                minor: 0,
                inode: 0,
                name,
                symbols_index: Some(index),
            });
        }
    }

    /// Synthetic MMAP records describing kernel space, written at the
    /// head of the trace so readers can rebuild `kernel_maps`.
    pub fn kernel_space_records(&self) -> Vec<PerfRecord> {
        self.kernel_maps
            .iter()
            .map(|map| {
                PerfRecord::Mmap(MmapRecord {
                    misc: PERF_RECORD_MISC_KERNEL,
                    pid: u32::MAX,
                    tid: 0,
                    addr: map.begin,
                    len: map.end - map.begin,
                    page_offset: 0,
                    filename: map.name.clone().into_bytes(),
                    sample_id: None,
                })
            })
            .collect()
    }

    /// Feed one non-sample record into the model. Must happen before
    /// any later sample of the same stream is symbolized.
    pub fn update_from_record(&mut self, record: &PerfRecord) {
        match record {
            PerfRecord::Mmap(r) => self.handle_mmap(
                r.pid as i32,
                r.addr,
                r.len,
                r.page_offset,
                (libc::PROT_READ | libc::PROT_EXEC) as u32,
                0,
                &String::from_utf8_lossy(&r.filename),
                r.misc,
            ),
            PerfRecord::Mmap2(r) => self.handle_mmap(
                r.pid as i32,
                r.addr,
                r.len,
                r.page_offset,
                r.protection,
                r.flags,
                &String::from_utf8_lossy(&r.filename),
                r.misc,
            ),
            PerfRecord::Comm(r) => self.handle_comm(r),
            PerfRecord::Fork(r) => self.handle_fork(r),
            PerfRecord::Exit(r) => self.handle_exit(r),
            _ => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_mmap(
        &mut self,
        pid: i32,
        addr: u64,
        len: u64,
        page_offset: u64,
        protection: u32,
        flags: u32,
        name: &str,
        misc: u16,
    ) {
        let in_kernel = misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL;
        let symbols_index = if name.is_empty() {
            None
        } else {
            self.symbols
                .index_for_path(name)
                .or_else(|| self.symbols.load_or_get(name, None))
        };

        let mapping = Mapping {
            begin: addr,
            end: addr + len,
            page_offset,
            protection,
            flags,
            major: 0,
            minor: 0,
            inode: 0,
            name: name.to_string(),
            symbols_index,
        };

        if pid == -1 || in_kernel {
            if name == KERNEL_MMAP_NAME {
                self.kernel_start = self.kernel_start.min(addr);
            }
            self.kernel_maps.insert(mapping);
            return;
        }

        let process = self
            .processes
            .entry(pid)
            .or_insert_with(|| VirtualProcess::new(pid));
        if mapping.is_executable() {
            if let Some(index) = symbols_index {
                let file = self.symbols.get(index);
                process.register_module(addr, addr + len, page_offset, file);
            }
        }
        process.maps.insert(mapping);
    }

    fn handle_comm(&mut self, record: &CommRecord) {
        let name = String::from_utf8_lossy(&record.comm).into_owned();
        let pid = record.pid as i32;
        if record.is_execve() && record.pid == record.tid {
            // exec replaced the address space; the mmap records that
            // follow rebuild it.
            self.processes.remove(&pid);
        }
        let process = self.process_mut(pid);
        if record.pid == record.tid {
            process.name = name.clone();
        }
        process.thread_mut(record.tid as i32).name = name;
    }

    fn handle_fork(&mut self, record: &TaskRecord) {
        let pid = record.pid as i32;
        let ppid = record.ppid as i32;
        let tid = record.tid as i32;

        if pid != ppid {
            // New process: the child inherits the parent's mappings as
            // they are at fork time.
            if !self.processes.contains_key(&pid) {
                let child = match self.processes.get(&ppid) {
                    Some(parent) => VirtualProcess::fork_from(parent, pid),
                    None => VirtualProcess::new(pid),
                };
                self.processes.insert(pid, child);
                self.reregister_modules(pid);
            }
            self.process_mut(pid).thread_mut(tid);
        } else {
            // New thread in an existing process.
            let parent_name = self
                .processes
                .get(&pid)
                .and_then(|p| p.threads.get(&(record.ptid as i32)))
                .map(|t| t.name.clone());
            let thread = self.process_mut(pid).thread_mut(tid);
            if let Some(name) = parent_name {
                thread.name = name;
            }
        }
    }

    fn reregister_modules(&mut self, pid: i32) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        let mappings: Vec<(u64, u64, u64, usize)> = process
            .maps
            .iter()
            .filter(|m| m.is_executable())
            .filter_map(|m| m.symbols_index.map(|i| (m.begin, m.end, m.page_offset, i)))
            .collect();
        for (begin, end, page_offset, index) in mappings {
            let file = self.symbols.get(index);
            process.register_module(begin, end, page_offset, file);
        }
    }

    fn handle_exit(&mut self, record: &TaskRecord) {
        let pid = record.pid as i32;
        if record.pid == record.tid {
            self.processes.remove(&pid);
        } else if let Some(process) = self.processes.get_mut(&pid) {
            process.threads.remove(&(record.tid as i32));
        }
    }

    /// Walk /proc for a pre-existing target and synthesize the records
    /// the kernel would have sent had we watched it from the start. The
    /// records are also applied to the model.
    pub fn enumerate_process(&mut self, pid: i32) -> Vec<PerfRecord> {
        let mut records = Vec::new();

        let tids = match std::fs::read_dir(format!("/proc/{pid}/task")) {
            Ok(dir) => dir
                .flatten()
                .filter_map(|e| e.file_name().to_string_lossy().parse::<i32>().ok())
                .collect(),
            Err(err) => {
                log::warn!("cannot enumerate threads of pid {pid}: {err}");
                vec![pid]
            }
        };
        for tid in tids {
            let comm_path = format!("/proc/{pid}/task/{tid}/comm");
            let name = std::fs::read_to_string(comm_path).unwrap_or_default();
            let name = name.trim_end_matches('\n');
            records.push(PerfRecord::Comm(CommRecord {
                misc: PERF_RECORD_MISC_USER,
                pid: pid as u32,
                tid: tid as u32,
                comm: name.as_bytes().to_vec(),
                sample_id: None,
            }));
        }

        match proc_maps::read_process_maps(pid) {
            Ok(regions) => {
                for region in regions {
                    records.push(PerfRecord::Mmap2(Mmap2Record {
                        misc: PERF_RECORD_MISC_USER,
                        pid: pid as u32,
                        tid: pid as u32,
                        addr: region.start,
                        len: region.end - region.start,
                        page_offset: region.file_offset,
                        major: region.major,
                        minor: region.minor,
                        inode: region.inode,
                        inode_generation: 0,
                        protection: region.protection(),
                        flags: region.map_flags(),
                        filename: region.name.into_bytes(),
                        sample_id: None,
                    }));
                }
            }
            Err(err) => log::warn!("cannot read maps of pid {pid}: {err}"),
        }

        for record in &records {
            self.update_from_record(record);
        }
        records
    }

    /// System-wide pre-enumeration: every numeric /proc entry except
    /// the excluded pids.
    pub fn enumerate_all_processes(&mut self, exclude_pids: &[i32]) -> Vec<PerfRecord> {
        let mut records = Vec::new();
        let Ok(dir) = std::fs::read_dir("/proc") else {
            return records;
        };
        for entry in dir.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            if exclude_pids.contains(&pid) {
                continue;
            }
            records.extend(self.enumerate_process(pid));
        }
        records
    }

    /// Resolve one address against the model and mark the hit symbol.
    pub fn symbolize(&mut self, pid: i32, ip: u64, in_kernel: bool) -> Frame {
        let map = if in_kernel {
            self.kernel_maps.find(ip)
        } else {
            self.processes.get(&pid).and_then(|p| p.maps.find(ip))
        };
        let Some(map) = map else {
            return Frame::unresolved(ip, in_kernel);
        };
        let Some(file_index) = map.symbols_index else {
            return Frame::unresolved(ip, in_kernel);
        };

        let file = self.symbols.get(file_index);
        // Kernel pseudo files hold absolute addresses, so the transform
        // below is the identity there (vaddr == begin, offset == 0).
        // Wrapping: an ip below the file's text start must not trap, it
        // just falls outside every symbol.
        let vaddr_in_file = (ip - map.begin + map.page_offset)
            .wrapping_sub(file.text_exec_file_offset)
            .wrapping_add(file.text_exec_vaddr);

        match file.find_symbol(vaddr_in_file) {
            Some((symbol_index, true)) => {
                let func_vaddr = file.symbols[symbol_index].vaddr;
                self.symbols.get_mut(file_index).mark_hit(symbol_index);
                Frame {
                    pc: ip,
                    sp: 0,
                    in_kernel,
                    symbols_file_index: Some(file_index),
                    symbol_index: Some(symbol_index),
                    func_offset: vaddr_in_file - func_vaddr,
                }
            }
            _ => Frame {
                pc: ip,
                sp: 0,
                in_kernel,
                symbols_file_index: Some(file_index),
                symbol_index: None,
                func_offset: 0,
            },
        }
    }

    /// Whether the address sits in kernel space for this model.
    pub fn is_kernel_address(&self, ip: u64) -> bool {
        ip >= self.kernel_start
    }

    /// Unwind, expand, and symbolize one sample in place: the raw
    /// register/stack snapshot is replaced by the resolved callchain,
    /// and with a dedup table the chain collapses to a stack id.
    pub fn process_sample(
        &mut self,
        sample: &mut SampleRecord,
        dedup: Option<&mut UniStackTable>,
    ) {
        let has_snapshot = !sample.user_regs.is_empty() && !sample.user_stack.is_empty();
        if has_snapshot && !self.disable_unwind {
            let abi32 = sample.abi32();
            let pid = sample.pid;
            let regs = std::mem::take(&mut sample.user_regs);
            let stack = std::mem::take(&mut sample.user_stack);
            let valid_len = (sample.dyn_stack_size as usize).min(stack.len());

            let process = self
                .processes
                .entry(pid)
                .or_insert_with(|| VirtualProcess::new(pid));
            let frames = self.callstack.unwind_call_stack(
                process,
                &self.symbols,
                abi32,
                &regs,
                &stack[..valid_len],
                self.max_frames,
            );

            let mut user_pcs: Vec<u64> = frames.iter().map(|f| f.pc).collect();
            let expanded = self
                .expander
                .expand(sample.tid, &mut user_pcs, self.expand_limit);
            if expanded > 0 {
                log::debug!("expanded callstack of tid {} by {expanded}", sample.tid);
            }
            sample.replace_with_call_stack(user_pcs);
        }

        self.mark_sample_hits(sample);

        if let Some(table) = dedup {
            let id = table.intern(&sample.ips);
            sample.ips.clear();
            sample.stack_id = Some(id);
        }
    }

    /// Resolve every address of the chain so the needed symbols are
    /// flagged for the trace file's symbol section.
    fn mark_sample_hits(&mut self, sample: &SampleRecord) {
        let mut in_kernel =
            sample.misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL;
        let pid = sample.pid;
        let ips = sample.ips.clone();
        if ips.is_empty() {
            // Callchain-less sample: the ip field alone names the hit.
            let kernel = in_kernel || self.is_kernel_address(sample.ip);
            self.symbolize(pid, sample.ip, kernel);
            return;
        }
        for ip in ips {
            if ip >= PERF_CONTEXT_MAX {
                in_kernel = ip == PERF_CONTEXT_KERNEL;
                continue;
            }
            self.symbolize(pid, ip, in_kernel || self.is_kernel_address(ip));
        }
    }

    /// Resolve a full chain into frames, for reporting.
    pub fn resolve_frames(&mut self, pid: i32, ips: &[u64], misc: u16) -> Vec<Frame> {
        let mut in_kernel = misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL;
        let mut frames = Vec::new();
        for &ip in ips {
            if ip >= PERF_CONTEXT_MAX {
                in_kernel = ip == PERF_CONTEXT_KERNEL;
                continue;
            }
            let kernel = in_kernel || self.is_kernel_address(ip);
            frames.push(self.symbolize(pid, ip, kernel));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SampleId;

    fn mmap2(pid: u32, addr: u64, len: u64, pgoff: u64, name: &str, exec: bool) -> PerfRecord {
        PerfRecord::Mmap2(Mmap2Record {
            misc: PERF_RECORD_MISC_USER,
            pid,
            tid: pid,
            addr,
            len,
            page_offset: pgoff,
            major: 0,
            minor: 0,
            inode: 0,
            inode_generation: 0,
            protection: if exec {
                (libc::PROT_READ | libc::PROT_EXEC) as u32
            } else {
                libc::PROT_READ as u32
            },
            flags: libc::MAP_PRIVATE as u32,
            filename: name.as_bytes().to_vec(),
            sample_id: None,
        })
    }

    fn fork_record(pid: u32, ppid: u32, tid: u32, ptid: u32) -> PerfRecord {
        PerfRecord::Fork(TaskRecord {
            misc: 0,
            pid,
            ppid,
            tid,
            ptid,
            time: 0,
            sample_id: Some(SampleId::default()),
        })
    }

    fn runtime() -> VirtualRuntime {
        VirtualRuntime::new(Vec::new(), false)
    }

    #[test]
    fn mmap_builds_the_process_model() {
        let mut rt = runtime();
        rt.update_from_record(&mmap2(10, 0x1000, 0x1000, 0, "/no/such/lib.so", true));
        rt.update_from_record(&mmap2(10, 0x8000, 0x1000, 0, "[heap]", false));
        let process = &rt.processes[&10];
        assert_eq!(process.maps.len(), 2);
        assert_eq!(process.maps.find(0x1800).unwrap().name, "/no/such/lib.so");
        assert!(process.maps.is_disjoint_and_sorted());
    }

    #[test]
    fn fork_clones_parent_maps_and_later_maps_stay_private() {
        let mut rt = runtime();
        rt.update_from_record(&mmap2(10, 0x1000, 0x1000, 0, "/parent/lib.so", true));
        rt.update_from_record(&fork_record(20, 10, 20, 10));

        // Child sees the parent's mapping as of fork time.
        assert!(rt.processes[&20].maps.find(0x1800).is_some());

        // A later child mapping must not leak into the parent.
        rt.update_from_record(&mmap2(20, 0x5000, 0x1000, 0, "/child/only.so", true));
        assert!(rt.processes[&20].maps.find(0x5800).is_some());
        assert!(rt.processes[&10].maps.find(0x5800).is_none());
    }

    #[test]
    fn fork_same_pid_is_a_new_thread() {
        let mut rt = runtime();
        rt.update_from_record(&PerfRecord::Comm(CommRecord {
            misc: PERF_RECORD_MISC_USER,
            pid: 10,
            tid: 10,
            comm: b"main".to_vec(),
            sample_id: None,
        }));
        rt.update_from_record(&fork_record(10, 10, 11, 10));
        let process = &rt.processes[&10];
        assert_eq!(process.threads[&11].name, "main");
    }

    #[test]
    fn execve_resets_the_address_space() {
        let mut rt = runtime();
        rt.update_from_record(&mmap2(10, 0x1000, 0x1000, 0, "/old/binary", true));
        rt.update_from_record(&PerfRecord::Comm(CommRecord {
            misc: PERF_RECORD_MISC_USER | PERF_RECORD_MISC_COMM_EXEC,
            pid: 10,
            tid: 10,
            comm: b"newprog".to_vec(),
            sample_id: None,
        }));
        let process = &rt.processes[&10];
        assert_eq!(process.name, "newprog");
        assert!(process.maps.is_empty());
    }

    #[test]
    fn exit_removes_thread_then_process() {
        let mut rt = runtime();
        rt.update_from_record(&fork_record(10, 9, 10, 9));
        rt.update_from_record(&fork_record(10, 10, 11, 10));
        rt.update_from_record(&PerfRecord::Exit(TaskRecord {
            misc: 0,
            pid: 10,
            ppid: 10,
            tid: 11,
            ptid: 10,
            time: 0,
            sample_id: None,
        }));
        assert!(!rt.processes[&10].threads.contains_key(&11));
        rt.update_from_record(&PerfRecord::Exit(TaskRecord {
            misc: 0,
            pid: 10,
            ppid: 9,
            tid: 10,
            ptid: 9,
            time: 0,
            sample_id: None,
        }));
        assert!(!rt.processes.contains_key(&10));
    }

    #[test]
    fn symbolize_resolves_through_the_map() {
        use crate::symbols::{Symbol, SymbolsFile, SymbolsFileKind};

        let mut rt = runtime();
        let mut file = SymbolsFile::new(SymbolsFileKind::Elf, "/fake/lib.so".into());
        file.text_exec_vaddr = 0x10000;
        file.text_exec_file_offset = 0x1000;
        file.symbols.push(Symbol {
            vaddr: 0x10040,
            size: 0x20,
            name: "do_work".into(),
            demangled: None,
        });
        file.finish_symbols();
        let index = rt.symbols.insert(file);

        let process = rt.process_mut(42);
        process.maps.insert(Mapping {
            begin: 0x7f0000001000,
            end: 0x7f0000002000,
            page_offset: 0x1000,
            protection: (libc::PROT_READ | libc::PROT_EXEC) as u32,
            flags: 0,
            major: 0,
            minor: 0,
            inode: 0,
            name: "/fake/lib.so".into(),
            symbols_index: Some(index),
        });

        // ip -> file vaddr: ip - begin + pgoff - text_offset + text_vaddr
        let frame = rt.symbolize(42, 0x7f0000001048, false);
        assert_eq!(frame.symbols_file_index, Some(index));
        let symbol_index = frame.symbol_index.unwrap();
        assert_eq!(rt.symbols.get(index).symbols[symbol_index].name, "do_work");
        assert_eq!(frame.func_offset, 0x8);
        assert!(rt.symbols.get(index).any_hits());
    }

    #[test]
    fn unresolvable_frames_keep_the_raw_pc() {
        let mut rt = runtime();
        let frame = rt.symbolize(1, 0xdeadbeef, false);
        assert_eq!(frame.pc, 0xdeadbeef);
        assert!(frame.symbol_index.is_none());
        assert!(frame.symbols_file_index.is_none());
    }
}
