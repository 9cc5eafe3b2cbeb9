//! The static event-name catalog and tracepoint resolution.

use std::fmt;
use std::fs;

use super::sys::*;
use crate::error::{RecordError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypeAndConfig {
    pub kind: u32,
    pub config: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    pub name: String,
    pub kind: u32,
    pub config: u64,
    /// Restrict to user or kernel space, from a `:u` / `:k` suffix.
    pub exclude_user: bool,
    pub exclude_kernel: bool,
}

impl fmt::Display for EventSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub const HARDWARE_EVENTS: &[(&str, u64)] = &[
    ("hw-cpu-cycles", PERF_COUNT_HW_CPU_CYCLES),
    ("hw-instructions", PERF_COUNT_HW_INSTRUCTIONS),
    ("hw-cache-references", PERF_COUNT_HW_CACHE_REFERENCES),
    ("hw-cache-misses", PERF_COUNT_HW_CACHE_MISSES),
    ("hw-branch-instructions", PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    ("hw-branch-misses", PERF_COUNT_HW_BRANCH_MISSES),
    ("hw-bus-cycles", PERF_COUNT_HW_BUS_CYCLES),
    (
        "hw-stalled-cycles-frontend",
        PERF_COUNT_HW_STALLED_CYCLES_FRONTEND,
    ),
    (
        "hw-stalled-cycles-backend",
        PERF_COUNT_HW_STALLED_CYCLES_BACKEND,
    ),
    ("hw-ref-cpu-cycles", PERF_COUNT_HW_REF_CPU_CYCLES),
];

pub const SOFTWARE_EVENTS: &[(&str, u64)] = &[
    ("sw-cpu-clock", PERF_COUNT_SW_CPU_CLOCK),
    ("sw-task-clock", PERF_COUNT_SW_TASK_CLOCK),
    ("sw-page-faults", PERF_COUNT_SW_PAGE_FAULTS),
    ("sw-context-switches", PERF_COUNT_SW_CONTEXT_SWITCHES),
    ("sw-cpu-migrations", PERF_COUNT_SW_CPU_MIGRATIONS),
    ("sw-page-faults-min", PERF_COUNT_SW_PAGE_FAULTS_MIN),
    ("sw-page-faults-maj", PERF_COUNT_SW_PAGE_FAULTS_MAJ),
    ("sw-alignment-faults", PERF_COUNT_SW_ALIGNMENT_FAULTS),
    ("sw-emulation-faults", PERF_COUNT_SW_EMULATION_FAULTS),
];

const CACHE_LEVELS: &[(&str, u64)] = &[
    ("L1-dcache", PERF_COUNT_HW_CACHE_L1D),
    ("L1-icache", PERF_COUNT_HW_CACHE_L1I),
    ("LLC", PERF_COUNT_HW_CACHE_LL),
    ("dTLB", PERF_COUNT_HW_CACHE_DTLB),
    ("iTLB", PERF_COUNT_HW_CACHE_ITLB),
    ("branch", PERF_COUNT_HW_CACHE_BPU),
    ("node", PERF_COUNT_HW_CACHE_NODE),
];

const CACHE_OPS: &[(&str, u64)] = &[
    ("load", PERF_COUNT_HW_CACHE_OP_READ),
    ("store", PERF_COUNT_HW_CACHE_OP_WRITE),
    ("prefetch", PERF_COUNT_HW_CACHE_OP_PREFETCH),
];

const CACHE_RESULTS: &[(&str, u64)] = &[
    ("refs", PERF_COUNT_HW_CACHE_RESULT_ACCESS),
    ("misses", PERF_COUNT_HW_CACHE_RESULT_MISS),
];

const TRACING_DIRS: &[&str] = &[
    "/sys/kernel/tracing/events",
    "/sys/kernel/debug/tracing/events",
];

/// Aliases accepted in place of the canonical catalog names.
const ALIASES: &[(&str, &str)] = &[
    ("cpu-cycles", "hw-cpu-cycles"),
    ("cycles", "hw-cpu-cycles"),
    ("instructions", "hw-instructions"),
    ("branch-misses", "hw-branch-misses"),
    ("cpu-clock", "sw-cpu-clock"),
    ("task-clock", "sw-task-clock"),
    ("page-faults", "sw-page-faults"),
    ("context-switches", "sw-context-switches"),
];

fn lookup_static(name: &str) -> Option<EventTypeAndConfig> {
    let name = ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name);

    if let Some((_, config)) = HARDWARE_EVENTS.iter().find(|(n, _)| *n == name) {
        return Some(EventTypeAndConfig {
            kind: PERF_TYPE_HARDWARE,
            config: *config,
        });
    }
    if let Some((_, config)) = SOFTWARE_EVENTS.iter().find(|(n, _)| *n == name) {
        return Some(EventTypeAndConfig {
            kind: PERF_TYPE_SOFTWARE,
            config: *config,
        });
    }

    // Cache events: "<level>-<op>-<result>", e.g. "L1-dcache-load-misses".
    for (level_name, level) in CACHE_LEVELS {
        let Some(rest) = name
            .strip_prefix(level_name)
            .and_then(|r| r.strip_prefix('-'))
        else {
            continue;
        };
        for (op_name, op) in CACHE_OPS {
            let Some(result_part) = rest
                .strip_prefix(op_name)
                .and_then(|r| r.strip_prefix('-'))
            else {
                continue;
            };
            for (result_name, result) in CACHE_RESULTS {
                if result_part == *result_name {
                    return Some(EventTypeAndConfig {
                        kind: PERF_TYPE_HW_CACHE,
                        config: level | (op << 8) | (result << 16),
                    });
                }
            }
        }
    }

    // Raw PMU events: "rNNN" with a hex config.
    if let Some(hex) = name.strip_prefix('r') {
        if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            if let Ok(config) = u64::from_str_radix(hex, 16) {
                return Some(EventTypeAndConfig {
                    kind: PERF_TYPE_RAW,
                    config,
                });
            }
        }
    }

    None
}

/// Dynamic PMUs ("arm_spe_0", "cs_etm", ...) publish their type number
/// in sysfs; the event opens with config 0.
fn lookup_pmu(name: &str) -> Option<EventTypeAndConfig> {
    let type_path = format!("/sys/bus/event_source/devices/{name}/type");
    let kind = fs::read_to_string(type_path).ok()?.trim().parse().ok()?;
    Some(EventTypeAndConfig { kind, config: 0 })
}

/// Resolve a tracepoint "subsystem:name" through the tracefs id file.
fn lookup_tracepoint(name: &str) -> Option<EventTypeAndConfig> {
    let (subsystem, point) = name.split_once(':')?;
    if subsystem.is_empty() || point.is_empty() {
        return None;
    }
    for dir in TRACING_DIRS {
        let id_path = format!("{dir}/{subsystem}/{point}/id");
        if let Ok(text) = fs::read_to_string(&id_path) {
            if let Ok(id) = text.trim().parse::<u64>() {
                return Some(EventTypeAndConfig {
                    kind: PERF_TYPE_TRACEPOINT,
                    config: id,
                });
            }
        }
    }
    None
}

/// Resolve one `-e` argument. A `:u`/`:k` suffix restricts the space;
/// tracepoints keep their inner colon ("sched:sched_switch:k" works).
pub fn resolve_event(raw_name: &str) -> Result<EventSpec> {
    let (name, exclude_user, exclude_kernel) = match raw_name.rsplit_once(':') {
        Some((base, "u")) if !base.is_empty() => (base, false, true),
        Some((base, "k")) if !base.is_empty() => (base, true, false),
        _ => (raw_name, false, false),
    };

    let resolved = lookup_static(name)
        .or_else(|| lookup_tracepoint(name))
        .or_else(|| lookup_pmu(name));
    match resolved {
        Some(EventTypeAndConfig { kind, config }) => Ok(EventSpec {
            name: name.to_string(),
            kind,
            config,
            exclude_user,
            exclude_kernel,
        }),
        None => Err(RecordError::EventNotSupported(raw_name.to_string())),
    }
}

/// Whether `sched:sched_switch` is available, probed before `--offcpu`
/// turns it on.
pub fn sched_switch_available() -> bool {
    lookup_tracepoint("sched:sched_switch").is_some()
}

/// All catalog names, for `perfrec list`.
pub fn all_static_events() -> Vec<(String, EventTypeAndConfig)> {
    let mut out = Vec::new();
    for (name, config) in HARDWARE_EVENTS {
        out.push((
            name.to_string(),
            EventTypeAndConfig {
                kind: PERF_TYPE_HARDWARE,
                config: *config,
            },
        ));
    }
    for (name, config) in SOFTWARE_EVENTS {
        out.push((
            name.to_string(),
            EventTypeAndConfig {
                kind: PERF_TYPE_SOFTWARE,
                config: *config,
            },
        ));
    }
    for (level_name, level) in CACHE_LEVELS {
        for (op_name, op) in CACHE_OPS {
            for (result_name, result) in CACHE_RESULTS {
                out.push((
                    format!("{level_name}-{op_name}-{result_name}"),
                    EventTypeAndConfig {
                        kind: PERF_TYPE_HW_CACHE,
                        config: level | (op << 8) | (result << 16),
                    },
                ));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_hardware_and_aliases() {
        let spec = resolve_event("hw-cpu-cycles").unwrap();
        assert_eq!(spec.kind, PERF_TYPE_HARDWARE);
        assert_eq!(spec.config, PERF_COUNT_HW_CPU_CYCLES);
        assert_eq!(resolve_event("cycles").unwrap().config, spec.config);
    }

    #[test]
    fn resolves_cache_event_encoding() {
        let spec = resolve_event("L1-dcache-load-misses").unwrap();
        assert_eq!(spec.kind, PERF_TYPE_HW_CACHE);
        assert_eq!(
            spec.config,
            PERF_COUNT_HW_CACHE_L1D
                | (PERF_COUNT_HW_CACHE_OP_READ << 8)
                | (PERF_COUNT_HW_CACHE_RESULT_MISS << 16)
        );
    }

    #[test]
    fn resolves_raw_and_rejects_unknown() {
        let spec = resolve_event("r11").unwrap();
        assert_eq!(spec.kind, PERF_TYPE_RAW);
        assert_eq!(spec.config, 0x11);
        assert!(matches!(
            resolve_event("no-such-event"),
            Err(RecordError::EventNotSupported(_))
        ));
    }

    #[test]
    fn space_suffixes() {
        let spec = resolve_event("sw-cpu-clock:u").unwrap();
        assert!(spec.exclude_kernel);
        assert!(!spec.exclude_user);
        let spec = resolve_event("sw-cpu-clock:k").unwrap();
        assert!(spec.exclude_user);
    }
}
