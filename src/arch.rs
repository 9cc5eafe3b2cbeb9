//! Architecture selection and the perf register model.
//!
//! A sample carries a register dump laid out by the *sampled* process's
//! ABI. On a 64-bit host profiling a 32-bit process the dump uses the
//! 32-bit indices, so before unwinding we remap it into the 64-bit layout
//! of the host architecture.

use crate::perf_event::sys::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchType {
    X86_64,
    Arm64,
    Arm,
    Unknown,
}

#[cfg(target_arch = "x86_64")]
pub const BUILD_ARCH_TYPE: ArchType = ArchType::X86_64;

#[cfg(target_arch = "aarch64")]
pub const BUILD_ARCH_TYPE: ArchType = ArchType::Arm64;

#[cfg(target_arch = "arm")]
pub const BUILD_ARCH_TYPE: ArchType = ArchType::Arm;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
pub const BUILD_ARCH_TYPE: ArchType = ArchType::Unknown;

impl ArchType {
    pub fn name(self) -> &'static str {
        match self {
            ArchType::X86_64 => "x86_64",
            ArchType::Arm64 => "arm64",
            ArchType::Arm => "arm",
            ArchType::Unknown => "unknown",
        }
    }

    pub fn from_uname_machine(machine: &str) -> ArchType {
        if machine.starts_with("arm") {
            ArchType::Arm
        } else if machine.starts_with("aarch64") {
            ArchType::Arm64
        } else if machine.starts_with("x86_64") {
            ArchType::X86_64
        } else {
            ArchType::Unknown
        }
    }

    /// The architecture the register dump of a sample should be read as.
    pub fn from_abi(abi32: bool, build_arch: ArchType) -> ArchType {
        if !abi32 {
            return build_arch;
        }
        match build_arch {
            ArchType::Arm64 => ArchType::Arm,
            // A 32-bit dump on x86_64 uses the compat x86 layout which
            // shares the index space with x86_64.
            other => other,
        }
    }

    pub fn sp_reg_index(self) -> usize {
        match self {
            ArchType::X86_64 => PERF_REG_X86_SP,
            ArchType::Arm64 => PERF_REG_ARM64_SP,
            ArchType::Arm => PERF_REG_ARM_SP,
            ArchType::Unknown => 0,
        }
    }

    pub fn ip_reg_index(self) -> usize {
        match self {
            ArchType::X86_64 => PERF_REG_X86_IP,
            ArchType::Arm64 => PERF_REG_ARM64_PC,
            ArchType::Arm => PERF_REG_ARM_PC,
            ArchType::Unknown => 0,
        }
    }

    pub fn reg_count(self) -> usize {
        match self {
            ArchType::X86_64 => PERF_REG_X86_64_MAX,
            ArchType::Arm64 => PERF_REG_ARM64_MAX,
            ArchType::Arm => PERF_REG_ARM_MAX,
            ArchType::Unknown => 0,
        }
    }

    /// Register mask requested with PERF_SAMPLE_REGS_USER: every register
    /// the architecture reports, so the dump is dense and indexable.
    pub fn supported_regs_mask(self) -> u64 {
        match self {
            ArchType::Unknown => 0,
            other => (1u64 << other.reg_count()) - 1,
        }
    }
}

/// A dense register dump, indexable by the PERF_REG_* constants of `arch`.
#[derive(Debug, Clone)]
pub struct RegisterFrame {
    pub arch: ArchType,
    pub regs: Vec<u64>,
}

impl RegisterFrame {
    pub fn get(&self, index: usize) -> Option<u64> {
        self.regs.get(index).copied()
    }

    pub fn sp(&self) -> Option<u64> {
        self.get(self.arch.sp_reg_index())
    }

    pub fn ip(&self) -> Option<u64> {
        self.get(self.arch.ip_reg_index())
    }
}

/// Remap a 32-bit register dump into the 64-bit layout of the build
/// architecture so the 64-bit unwinder can consume it.
///
/// Derived from the kernel ABI: a compat aarch32 task reports r0..r15 at
/// indices 0..15; r13/r14/r15 are the sp/lr/pc of the task and land in the
/// aarch64 sp/lr/pc slots, r0..r12 alias x0..x12. The compat x86 layout
/// already shares sp/ip/bp indices with x86_64, so only the dump length
/// changes there.
pub fn remap_regs_for_abi(sample_arch: ArchType, regs: &[u64]) -> RegisterFrame {
    match (BUILD_ARCH_TYPE, sample_arch) {
        (ArchType::Arm64, ArchType::Arm) => {
            let mut out = vec![0u64; PERF_REG_ARM64_MAX];
            let n = regs.len().min(PERF_REG_ARM_MAX);
            out[..n.min(PERF_REG_ARM_SP)].copy_from_slice(&regs[..n.min(PERF_REG_ARM_SP)]);
            if n > PERF_REG_ARM_SP {
                out[PERF_REG_ARM64_SP] = regs[PERF_REG_ARM_SP];
            }
            if n > PERF_REG_ARM_LR {
                out[PERF_REG_ARM64_LR] = regs[PERF_REG_ARM_LR];
            }
            if n > PERF_REG_ARM_PC {
                out[PERF_REG_ARM64_PC] = regs[PERF_REG_ARM_PC];
                // Frame-pointer walks on remapped aarch32 frames read x29.
                out[PERF_REG_ARM64_X29] = regs[PERF_REG_ARM_FP];
            }
            RegisterFrame {
                arch: ArchType::Arm64,
                regs: out,
            }
        }
        (ArchType::X86_64, ArchType::X86_64) if regs.len() <= PERF_REG_X86_32_MAX => {
            let mut out = vec![0u64; PERF_REG_X86_64_MAX];
            out[..regs.len()].copy_from_slice(regs);
            RegisterFrame {
                arch: ArchType::X86_64,
                regs: out,
            }
        }
        _ => RegisterFrame {
            arch: sample_arch,
            regs: regs.to_vec(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_selection() {
        assert_eq!(
            ArchType::from_abi(false, ArchType::Arm64),
            ArchType::Arm64
        );
        assert_eq!(ArchType::from_abi(true, ArchType::Arm64), ArchType::Arm);
        assert_eq!(
            ArchType::from_abi(true, ArchType::X86_64),
            ArchType::X86_64
        );
    }

    #[test]
    fn uname_machine() {
        assert_eq!(ArchType::from_uname_machine("aarch64"), ArchType::Arm64);
        assert_eq!(ArchType::from_uname_machine("armv7l"), ArchType::Arm);
        assert_eq!(ArchType::from_uname_machine("x86_64"), ArchType::X86_64);
        assert_eq!(ArchType::from_uname_machine("riscv64"), ArchType::Unknown);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn arm_regs_remap_into_arm64_slots() {
        let mut regs = vec![0u64; PERF_REG_ARM_MAX];
        regs[PERF_REG_ARM_SP] = 0x1000;
        regs[PERF_REG_ARM_LR] = 0x2000;
        regs[PERF_REG_ARM_PC] = 0x3000;
        regs[PERF_REG_ARM_FP] = 0x4000;
        let frame = remap_regs_for_abi(ArchType::Arm, &regs);
        assert_eq!(frame.arch, ArchType::Arm64);
        assert_eq!(frame.sp(), Some(0x1000));
        assert_eq!(frame.get(PERF_REG_ARM64_LR), Some(0x2000));
        assert_eq!(frame.ip(), Some(0x3000));
        assert_eq!(frame.get(PERF_REG_ARM64_X29), Some(0x4000));
    }

    #[test]
    fn register_frame_accessors() {
        let frame = RegisterFrame {
            arch: ArchType::X86_64,
            regs: {
                let mut v = vec![0u64; PERF_REG_X86_64_MAX];
                v[PERF_REG_X86_SP] = 0xdead;
                v[PERF_REG_X86_IP] = 0xbeef;
                v
            },
        };
        assert_eq!(frame.sp(), Some(0xdead));
        assert_eq!(frame.ip(), Some(0xbeef));
    }
}
