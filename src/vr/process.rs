//! One observed process: its threads, mappings, remote-memory access,
//! and the unwinder holding its registered modules.

use std::fs::File;
use std::os::unix::fs::FileExt;

use framehop::Unwinder;
use rustc_hash::{FxHashMap, FxHashSet};

use super::maps::MapSet;
use super::thread::VirtualThread;
use crate::symbols::SymbolsFile;

/// Read-only access to the live process's address space, used for
/// unwind probes that fall outside the captured stack window.
pub struct ProcessMemory {
    pub pid: i32,
    /// Some(None) records a failed open so we do not retry per probe.
    fd: Option<Option<File>>,
}

impl ProcessMemory {
    fn new(pid: i32) -> ProcessMemory {
        ProcessMemory { pid, fd: None }
    }

    fn file(&mut self) -> Option<&File> {
        if self.fd.is_none() {
            let file = File::open(format!("/proc/{}/mem", self.pid));
            if let Err(err) = &file {
                log::debug!("cannot open /proc/{}/mem: {err}", self.pid);
            }
            self.fd = Some(file.ok());
        }
        self.fd.as_ref().unwrap().as_ref()
    }

    pub fn read(&mut self, vaddr: u64, out: &mut [u8]) -> bool {
        let Some(file) = self.file() else { return false };
        file.read_exact_at(out, vaddr).is_ok()
    }

    pub fn read_word(&mut self, vaddr: u64) -> Option<u64> {
        if vaddr.checked_add(8).is_none() {
            return None;
        }
        let mut buf = [0u8; 8];
        self.read(vaddr, &mut buf).then(|| u64::from_le_bytes(buf))
    }
}

pub struct VirtualProcess {
    pub pid: i32,
    pub name: String,
    pub maps: MapSet,
    pub threads: FxHashMap<i32, VirtualThread>,
    pub memory: ProcessMemory,
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    pub unwinder: crate::unwind::NativeUnwinder,
    registered_modules: FxHashSet<(String, u64)>,
}

impl VirtualProcess {
    pub fn new(pid: i32) -> VirtualProcess {
        VirtualProcess {
            pid,
            name: String::new(),
            maps: MapSet::default(),
            threads: FxHashMap::default(),
            memory: ProcessMemory::new(pid),
            #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
            unwinder: Default::default(),
            registered_modules: FxHashSet::default(),
        }
    }

    /// A child starts as a copy of the parent's address space; modules
    /// are re-registered by the caller, which owns the symbol registry.
    pub fn fork_from(parent: &VirtualProcess, pid: i32) -> VirtualProcess {
        let mut child = VirtualProcess::new(pid);
        child.name = parent.name.clone();
        child.maps = parent.maps.clone();
        child
    }

    pub fn thread_mut(&mut self, tid: i32) -> &mut VirtualThread {
        let pid = self.pid;
        self.threads
            .entry(tid)
            .or_insert_with(|| VirtualThread::new(pid, tid))
    }

    /// Hand the module backing an executable mapping to the unwinder.
    /// Idempotent per (path, begin).
    pub fn register_module(
        &mut self,
        begin: u64,
        end: u64,
        page_offset: u64,
        file: &SymbolsFile,
    ) {
        if !self
            .registered_modules
            .insert((file.path.clone(), begin))
        {
            return;
        }

        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        {
            let Some(sections) = &file.module_sections else {
                return;
            };
            // avma of the text section under this mapping, then the bias
            // from svma space into this process's addresses.
            let text_avma = begin
                .wrapping_add(file.text_exec_file_offset)
                .wrapping_sub(page_offset);
            let bias = text_avma.wrapping_sub(file.text_exec_vaddr);
            let base_avma = sections.base_svma.wrapping_add(bias);

            let info = framehop::ExplicitModuleSectionInfo {
                base_svma: sections.base_svma,
                text_svma: sections.text_svma.clone(),
                text: sections.text.clone(),
                stubs_svma: None,
                stub_helper_svma: None,
                got_svma: None,
                unwind_info: None,
                eh_frame_svma: sections.eh_frame_svma.clone(),
                eh_frame: sections.eh_frame.clone(),
                eh_frame_hdr_svma: sections.eh_frame_hdr_svma.clone(),
                eh_frame_hdr: sections.eh_frame_hdr.clone(),
                debug_frame: None,
                text_segment_svma: None,
                text_segment: None,
            };
            let module = framehop::Module::new(file.path.clone(), begin..end, base_avma, info);
            self.unwinder.add_module(module);
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            let _ = (end, page_offset, file);
        }
    }
}
