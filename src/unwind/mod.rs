//! Remote DWARF unwinding over a sampled register/stack snapshot.
//!
//! The CFI stepping itself is framehop's; this module owns everything
//! around it: architecture selection and register remapping, the memory
//! access contract (captured stack window first, then the target
//! process's address space), and the per-(pid, module) unwind-table
//! discovery cache.

pub mod expand;

use rustc_hash::FxHashMap;

use crate::arch::{remap_regs_for_abi, ArchType, RegisterFrame, BUILD_ARCH_TYPE};
use crate::symbols::{SectionData, SymbolRegistry};
use crate::vr::process::VirtualProcess;

pub const MAX_CALL_FRAME_UNWIND_SIZE: usize = 256;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub type NativeUnwinder = framehop::UnwinderNative<SectionData, framehop::MayAllocateDuringUnwind>;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub type NativeCache = framehop::CacheNative<framehop::MayAllocateDuringUnwind>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindTableFormat {
    EhFrame,
    ArmExidx,
}

/// Where a module's unwind table sits in the sampled process's address
/// space. All addresses are avmas computed from the mapping that backs
/// the section's file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindTableInfo {
    pub format: UnwindTableFormat,
    pub start_pc: u64,
    pub end_pc: u64,
    /// avma of `.eh_frame_hdr` (EhFrame) or of the mapping base
    /// (ArmExidx).
    pub segbase: u64,
    /// avma of the fde binary-search table / exidx entries.
    pub table_vaddr: u64,
    /// Table length in bytes.
    pub table_len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwoundFrame {
    pub pc: u64,
    pub sp: u64,
}

pub struct CallStack {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    cache: NativeCache,
    /// (pid, module path) -> discovered table. A None entry records a
    /// module known to carry no unwind table, so we probe it only once.
    table_cache: FxHashMap<(i32, String), Option<UnwindTableInfo>>,
    /// One-word read cache; unwind steps re-probe the same slot often.
    last_read: Option<(i32, u64, u64)>,
}

impl CallStack {
    pub fn new() -> CallStack {
        CallStack {
            #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
            cache: NativeCache::new(),
            table_cache: FxHashMap::default(),
            last_read: None,
        }
    }

    /// Locate (and cache) the unwind table covering `pc` in `process`.
    pub fn find_unwind_table(
        &mut self,
        process: &VirtualProcess,
        registry: &SymbolRegistry,
        pc: u64,
    ) -> Option<UnwindTableInfo> {
        let map = process.maps.find(pc)?;
        let key = (process.pid, map.name.clone());
        if let Some(cached) = self.table_cache.get(&key) {
            return *cached;
        }
        let info = discover_unwind_table(process, registry, pc);
        self.table_cache.insert(key, info);
        if info.is_none() {
            log::debug!(
                "no unwind table for {} in pid {}",
                map.name,
                process.pid
            );
        }
        info
    }

    /// Unwind one sample. `regs` is the raw dump in the sampled ABI's
    /// layout, `stack` the valid prefix of the stack snapshot. Returns
    /// callee-first frames, at most `max_frames`, and never fails: any
    /// step error just ends the walk at the last good frame.
    pub fn unwind_call_stack(
        &mut self,
        process: &mut VirtualProcess,
        registry: &SymbolRegistry,
        abi32: bool,
        regs: &[u64],
        stack: &[u8],
        max_frames: usize,
    ) -> Vec<UnwoundFrame> {
        let mut frames = Vec::new();
        if regs.is_empty() {
            log::warn!("sample without registers, cannot unwind");
            return frames;
        }

        let sample_arch = ArchType::from_abi(abi32, BUILD_ARCH_TYPE);
        let frame: RegisterFrame = remap_regs_for_abi(sample_arch, regs);
        let (Some(ip), Some(sp)) = (frame.ip(), frame.sp()) else {
            log::warn!("sample registers carry no ip/sp, cannot unwind");
            return frames;
        };
        if ip == 0 {
            return frames;
        }

        // Prime the discovery cache for the sampled module; deeper
        // modules were primed when their own code was on top.
        self.find_unwind_table(process, registry, ip);

        self.step_with_unwinder(process, ip, sp, &frame, stack, max_frames, &mut frames);

        frames
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[allow(clippy::too_many_arguments)]
    fn step_with_unwinder(
        &mut self,
        process: &mut VirtualProcess,
        ip: u64,
        sp: u64,
        frame: &RegisterFrame,
        stack: &[u8],
        max_frames: usize,
        frames: &mut Vec<UnwoundFrame>,
    ) {
        use framehop::Unwinder;

        let Some(unwind_regs) = native_unwind_regs(frame) else {
            frames.push(UnwoundFrame { pc: ip, sp });
            return;
        };

        let VirtualProcess {
            unwinder, memory, ..
        } = process;
        let cache = &mut self.cache;
        let last_read = &mut self.last_read;

        let mut read_stack = |addr: u64| -> Result<u64, ()> {
            // The captured stack window is authoritative for everything
            // at or above the sampled sp.
            if let Some(offset) = addr.checked_sub(sp) {
                let offset = offset as usize;
                if offset + 8 <= stack.len() {
                    return Ok(u64::from_le_bytes(
                        stack[offset..offset + 8].try_into().unwrap(),
                    ));
                }
            }
            // Outside the snapshot: read the live process, with the
            // one-word cache in front.
            if let Some((pid, cached_addr, word)) = *last_read {
                if pid == memory.pid && cached_addr == addr {
                    return Ok(word);
                }
            }
            match memory.read_word(addr) {
                Some(word) => {
                    *last_read = Some((memory.pid, addr, word));
                    Ok(word)
                }
                None => {
                    *last_read = None;
                    Err(())
                }
            }
        };

        let mut iter = unwinder.iter_frames(ip, unwind_regs, cache, &mut read_stack);
        let mut first = true;
        while frames.len() < max_frames {
            match iter.next() {
                Ok(Some(address)) => {
                    let pc = match address {
                        framehop::FrameAddress::InstructionPointer(pc) => pc,
                        framehop::FrameAddress::ReturnAddress(pc) => pc.into(),
                    };
                    if pc == 0 {
                        break;
                    }
                    let frame_sp = if first { sp } else { 0 };
                    let unwound = UnwoundFrame { pc, sp: frame_sp };
                    if frames.last() == Some(&unwound) {
                        break;
                    }
                    frames.push(unwound);
                    first = false;
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    #[allow(clippy::too_many_arguments)]
    fn step_with_unwinder(
        &mut self,
        _process: &mut VirtualProcess,
        ip: u64,
        sp: u64,
        _frame: &RegisterFrame,
        _stack: &[u8],
        _max_frames: usize,
        frames: &mut Vec<UnwoundFrame>,
    ) {
        // No CFI stepper on this host architecture; report the sampled
        // location only.
        frames.push(UnwoundFrame { pc: ip, sp });
    }
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
fn native_unwind_regs(frame: &RegisterFrame) -> Option<framehop::x86_64::UnwindRegsX86_64> {
    use crate::perf_event::sys::PERF_REG_X86_BP;
    let ip = frame.ip()?;
    let sp = frame.sp()?;
    let bp = frame.get(PERF_REG_X86_BP)?;
    Some(framehop::x86_64::UnwindRegsX86_64::new(ip, sp, bp))
}

#[cfg(target_arch = "aarch64")]
fn native_unwind_regs(frame: &RegisterFrame) -> Option<framehop::aarch64::UnwindRegsAarch64> {
    use crate::perf_event::sys::{PERF_REG_ARM64_LR, PERF_REG_ARM64_X29};
    let lr = frame.get(PERF_REG_ARM64_LR)?;
    let sp = frame.sp()?;
    let fp = frame.get(PERF_REG_ARM64_X29)?;
    Some(framehop::aarch64::UnwindRegsAarch64::new(lr, sp, fp))
}

/// Compute the table location for the module containing `pc`.
///
/// avmas follow from the mapping that covers the section's file offset:
/// `avma = map.begin + file_offset − map.page_offset`.
fn discover_unwind_table(
    process: &VirtualProcess,
    registry: &SymbolRegistry,
    pc: u64,
) -> Option<UnwindTableInfo> {
    let map = process.maps.find(pc)?;
    let symbols_index = map.symbols_index?;
    let file = registry.get(symbols_index);

    if BUILD_ARCH_TYPE == ArchType::Arm {
        let exidx = file.arm_exidx?;
        let target = process
            .maps
            .find_by_file_offset(&map.name, exidx.file_offset)?;
        return Some(UnwindTableInfo {
            format: UnwindTableFormat::ArmExidx,
            start_pc: map.begin,
            end_pc: map.end,
            segbase: map.begin,
            table_vaddr: target.begin + exidx.file_offset - target.page_offset,
            table_len: exidx.size,
        });
    }

    let hdr = file.eh_frame_hdr?;
    let hdr_map = process
        .maps
        .find_by_file_offset(&map.name, hdr.file_offset)?;
    let segbase = hdr_map.begin + hdr.file_offset - hdr_map.page_offset;

    // .eh_frame_hdr layout: version, three encoding bytes, then the
    // encoded frame pointer, fde count, and the binary search table.
    // The common encodings put the count at offset 8 and the table at
    // offset 12, eight bytes per entry.
    let fde_count = file
        .module_sections
        .as_ref()
        .and_then(|s| s.eh_frame_hdr.as_ref())
        .and_then(|data| {
            let bytes: &[u8] = data;
            if bytes.len() >= 12 && bytes[0] == 1 {
                Some(u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as u64)
            } else {
                None
            }
        })
        .unwrap_or(0);

    Some(UnwindTableInfo {
        format: UnwindTableFormat::EhFrame,
        start_pc: map.begin,
        end_pc: map.end,
        segbase,
        table_vaddr: segbase + 12,
        table_len: fde_count * 8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{SymbolRegistry, SymbolsFile, SymbolsFileKind};
    use crate::vr::maps::Mapping;

    fn test_process_with_module(registry: &mut SymbolRegistry) -> VirtualProcess {
        let mut file = SymbolsFile::new(SymbolsFileKind::Elf, "/lib/libfake.so".into());
        file.eh_frame_hdr = Some(crate::symbols::SectionInfo {
            vaddr: 0x5000,
            size: 0x100,
            file_offset: 0x5000,
        });
        file.finish_symbols();
        let symbols_index = registry.insert(file);

        let mut process = VirtualProcess::new(1234);
        process.maps.insert(Mapping {
            begin: 0x7f00_0000_0000,
            end: 0x7f00_0001_0000,
            page_offset: 0,
            protection: (libc::PROT_READ | libc::PROT_EXEC) as u32,
            flags: 0,
            major: 0,
            minor: 0,
            inode: 0,
            name: "/lib/libfake.so".into(),
            symbols_index: Some(symbols_index),
        });
        process
    }

    #[test]
    fn unwind_table_discovery_and_caching() {
        let mut registry = SymbolRegistry::new(Vec::new());
        let process = test_process_with_module(&mut registry);
        let mut callstack = CallStack::new();

        let info = callstack
            .find_unwind_table(&process, &registry, 0x7f00_0000_1000)
            .unwrap();
        assert_eq!(info.format, UnwindTableFormat::EhFrame);
        assert_eq!(info.segbase, 0x7f00_0000_5000);
        assert_eq!(info.table_vaddr, 0x7f00_0000_5000 + 12);
        assert_eq!(info.start_pc, 0x7f00_0000_0000);

        // Second lookup is served from the cache.
        let again = callstack
            .find_unwind_table(&process, &registry, 0x7f00_0000_2000)
            .unwrap();
        assert_eq!(info, again);
        assert_eq!(callstack.table_cache.len(), 1);
    }

    #[test]
    fn unknown_pc_has_no_table() {
        let registry = SymbolRegistry::new(Vec::new());
        let process = VirtualProcess::new(1);
        let mut callstack = CallStack::new();
        assert!(callstack
            .find_unwind_table(&process, &registry, 0xdead_beef)
            .is_none());
    }

    #[test]
    fn unwind_without_regs_is_empty() {
        let registry = SymbolRegistry::new(Vec::new());
        let mut callstack = CallStack::new();
        let mut process = VirtualProcess::new(1);
        let frames = callstack.unwind_call_stack(&mut process, &registry, false, &[], &[], 256);
        assert!(frames.is_empty());
    }

    #[test]
    fn unwind_is_bounded_by_max_frames() {
        // With an empty module list every step fails immediately, so the
        // walk terminates after at most the initial frame.
        let registry = SymbolRegistry::new(Vec::new());
        let mut callstack = CallStack::new();
        let mut process = VirtualProcess::new(1);
        let mut regs = vec![0u64; crate::arch::BUILD_ARCH_TYPE.reg_count()];
        let ip_index = crate::arch::BUILD_ARCH_TYPE.ip_reg_index();
        let sp_index = crate::arch::BUILD_ARCH_TYPE.sp_reg_index();
        regs[ip_index] = 0x1234_5678;
        regs[sp_index] = 0x7ffd_0000;
        let frames =
            callstack.unwind_call_stack(&mut process, &registry, false, &regs, &[], 4);
        assert!(frames.len() <= 4);
        if let Some(first) = frames.first() {
            assert_eq!(first.pc, 0x1234_5678);
            assert_eq!(first.sp, 0x7ffd_0000);
        }
    }
}
