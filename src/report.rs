//! The reading-side subcommands: `report`, `stat`, `list`, `dump`.

use std::collections::HashMap;
use std::time::Duration;

use crate::cli::{DumpArgs, ListArgs, ReportArgs, StatArgs};
use crate::error::{RecordError, Result};
use crate::file_format::features::FeatureContent;
use crate::file_format::reader::RecordFileReader;
use crate::file_format::Feature;
use crate::perf_event::ring_buffer::EventFd;
use crate::perf_event::sys::*;
use crate::perf_event::{catalog, Workload};
use crate::record::PerfRecord;
use crate::vr::VirtualRuntime;

/// Rebuild the runtime model from a trace file: symbol tables from the
/// symbol feature section, then the record stream for maps and threads.
fn runtime_from_file(reader: &RecordFileReader, args: &ReportArgs) -> VirtualRuntime {
    let mut vr = VirtualRuntime::new(args.symbol_dirs.clone(), false);
    if let Some(FeatureContent::SymbolFiles(files)) = reader.feature(Feature::FilesSymbol) {
        for file in files {
            vr.symbols.insert(file.clone().into_symbols_file());
        }
    }
    vr
}

pub fn cmd_report(args: ReportArgs) -> Result<()> {
    let reader = RecordFileReader::open(&args.input)?;
    let mut vr = runtime_from_file(&reader, &args);

    // symbol display name -> (sample count, event count)
    let mut by_symbol: HashMap<String, (u64, u64)> = HashMap::new();
    let mut total_samples: u64 = 0;
    let mut total_events: u64 = 0;
    let mut lost: u64 = 0;

    reader.read_records(|record| match record {
        PerfRecord::Sample(sample) => {
            total_samples += 1;
            total_events += sample.period;
            let ips: Vec<u64> = if sample.ips.is_empty() {
                vec![sample.ip]
            } else {
                sample.ips.clone()
            };
            let frames = vr.resolve_frames(sample.pid, &ips, sample.misc);
            // Attribute the sample to its innermost resolved frame.
            let name = frames
                .iter()
                .find_map(|frame| {
                    let file = vr.symbols.get(frame.symbols_file_index?);
                    match frame.symbol_index {
                        Some(index) => {
                            Some(file.symbols[index].display_name().to_string())
                        }
                        None => Some(format!("{}+0x{:x}", file.path, frame.pc)),
                    }
                })
                .unwrap_or_else(|| {
                    format!("[unknown] 0x{:x}", ips.first().copied().unwrap_or(0))
                });
            let entry = by_symbol.entry(name).or_default();
            entry.0 += 1;
            entry.1 += sample.period;
        }
        PerfRecord::Lost(record) => lost += record.lost,
        other => vr.update_from_record(&other),
    })?;

    if let Some(hostname) = reader.feature_string(Feature::Hostname) {
        println!("hostname: {hostname}");
    }
    if let Some(cmdline) = reader.feature_string(Feature::Cmdline) {
        println!("cmdline: {cmdline}");
    }
    for attr in reader.attrs() {
        println!(
            "event: {} ({} ids)",
            if attr.name.is_empty() {
                "unknown"
            } else {
                &attr.name
            },
            attr.ids.len()
        );
    }
    println!("samples: {total_samples}, lost: {lost}");
    println!();
    println!("{:>8} {:>9}  symbol", "count", "percent");

    let mut rows: Vec<(String, (u64, u64))> = by_symbol.into_iter().collect();
    rows.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.0.cmp(&b.0)));
    for (name, (count, _events)) in rows.into_iter().take(args.limit) {
        let percent = if total_samples > 0 {
            count as f64 * 100.0 / total_samples as f64
        } else {
            0.0
        };
        println!("{count:>8} {percent:>8.2}%  {name}");
    }
    let _ = total_events;
    Ok(())
}

pub fn cmd_stat(args: StatArgs) -> Result<()> {
    let mut specs = Vec::new();
    let names = if args.events.is_empty() {
        [
            "hw-cpu-cycles",
            "hw-instructions",
            "hw-branch-misses",
            "sw-task-clock",
            "sw-context-switches",
            "sw-page-faults",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    } else {
        args.events.clone()
    };
    for name in &names {
        specs.push(catalog::resolve_event(name)?);
    }

    let mut workload = None;
    let pids: Vec<i32> = if !args.command.is_empty() {
        let launched = Workload::launch_suspended(&args.command)?;
        let pid = launched.pid();
        workload = Some(launched);
        vec![pid]
    } else if args.system_wide {
        vec![-1]
    } else if !args.pids.is_empty() {
        args.pids.clone()
    } else {
        return Err(RecordError::InvalidTargets(
            "stat needs -a, -p, or a command".into(),
        ));
    };
    let cpus: Vec<i32> = if args.system_wide {
        (0..num_cpus::get() as i32).collect()
    } else {
        vec![-1]
    };

    // Counting mode: no sampling, just enabled counters we read at the
    // end.
    let mut counters: Vec<(String, Vec<EventFd>)> = Vec::new();
    for (index, spec) in specs.iter().enumerate() {
        let mut attr = PerfEventAttr::default();
        attr.kind = spec.kind;
        attr.config = spec.config;
        attr.flags = PERF_ATTR_FLAG_DISABLED;
        if spec.exclude_user {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_USER;
        }
        if spec.exclude_kernel {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        }
        let mut fds = Vec::new();
        for &pid in &pids {
            for &cpu in &cpus {
                if pid == -1 && cpu == -1 {
                    continue;
                }
                match EventFd::open(&attr, pid, cpu, -1, index) {
                    Ok(fd) => fds.push(fd),
                    Err(err) => {
                        log::debug!("stat open {}: {err}", spec.name);
                    }
                }
            }
        }
        if fds.is_empty() {
            println!("{:>20}: <not supported>", spec.name);
        }
        counters.push((spec.name.clone(), fds));
    }

    for (_, fds) in &counters {
        for fd in fds {
            let _ = fd.reset();
            let _ = fd.enable();
        }
    }
    if let Some(workload) = &workload {
        workload.start()?;
    }
    std::thread::sleep(Duration::from_secs_f64(args.duration));
    for (_, fds) in &counters {
        for fd in fds {
            let _ = fd.disable();
        }
    }

    println!("duration: {:.2}s", args.duration);
    for (name, fds) in &counters {
        if fds.is_empty() {
            continue;
        }
        let total: u64 = fds.iter().filter_map(|fd| fd.read_count().ok()).sum();
        println!("{name:>20}: {total}");
    }

    if let Some(mut workload) = workload {
        workload.try_wait_exited();
    }
    Ok(())
}

pub fn cmd_list(_args: ListArgs) -> Result<()> {
    println!("supported events:");
    let mut unsupported = Vec::new();
    for (name, event) in catalog::all_static_events() {
        let mut attr = PerfEventAttr::default();
        attr.kind = event.kind;
        attr.config = event.config;
        attr.flags = PERF_ATTR_FLAG_DISABLED | PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        match EventFd::open(&attr, 0, -1, -1, 0) {
            Ok(_) => println!("  {name}"),
            Err(_) => unsupported.push(name),
        }
    }
    if !unsupported.is_empty() {
        println!("unsupported events:");
        for name in unsupported {
            println!("  {name}");
        }
    }
    println!("tracepoint events: see /sys/kernel/tracing/events (subsystem:name)");
    Ok(())
}

pub fn cmd_dump(args: DumpArgs) -> Result<()> {
    let reader = RecordFileReader::open(&args.input)?;

    println!("magic: PERFILE2{}", if reader.was_compressed() { " (gzip)" } else { "" });
    println!(
        "data section: offset 0x{:x}, size 0x{:x}",
        reader.header.data.offset, reader.header.data.size
    );
    for (index, attr) in reader.attrs().iter().enumerate() {
        println!(
            "attr[{index}]: type {} config {} sample_type 0x{:x} ids {:?}",
            attr.attr.kind, attr.attr.config, attr.attr.sample_type, attr.ids
        );
    }
    for (feature, content) in reader.features() {
        match content {
            FeatureContent::String(text) => println!("feature {}: {text}", feature.name()),
            FeatureContent::NrCpus { available, online } => {
                println!("feature {}: {available} available, {online} online", feature.name())
            }
            FeatureContent::TotalMem(kb) => {
                println!("feature {}: {kb} kB", feature.name())
            }
            FeatureContent::U64(value) => println!("feature {}: {value}", feature.name()),
            FeatureContent::EventDesc(entries) => {
                println!("feature {}: {} events", feature.name(), entries.len());
                for entry in entries {
                    println!("  {} ids {:?}", entry.name, entry.ids);
                }
            }
            FeatureContent::SymbolFiles(files) => {
                println!("feature {}: {} files", feature.name(), files.len());
                for file in files {
                    println!(
                        "  {} build-id [{}] {} symbols",
                        file.path,
                        file.build_id,
                        file.symbols.len()
                    );
                }
            }
            FeatureContent::UniStackTable(bytes) => {
                println!("feature {}: {} bytes", feature.name(), bytes.len())
            }
            FeatureContent::Raw(bytes) => {
                println!("feature {}: {} bytes (raw)", feature.name(), bytes.len())
            }
        }
    }

    if args.head_only {
        return Ok(());
    }

    let mut index = 0u64;
    reader.read_records(|record| {
        let time = record.time().unwrap_or(0);
        match &record {
            PerfRecord::Sample(sample) => {
                println!(
                    "{index}: sample time {time} pid {} tid {} cpu {} ip 0x{:x} {} ips",
                    sample.pid,
                    sample.tid,
                    sample.cpu,
                    sample.ip,
                    sample.ips.len()
                );
                for ip in &sample.ips {
                    if *ip >= PERF_CONTEXT_MAX {
                        println!("    context 0x{ip:x}");
                    } else {
                        println!("    0x{ip:x}");
                    }
                }
            }
            PerfRecord::Mmap2(mmap) => {
                println!(
                    "{index}: mmap2 pid {} 0x{:x}+0x{:x} @0x{:x} {}",
                    mmap.pid,
                    mmap.addr,
                    mmap.len,
                    mmap.page_offset,
                    String::from_utf8_lossy(&mmap.filename)
                );
            }
            PerfRecord::Comm(comm) => {
                println!(
                    "{index}: comm pid {} tid {} \"{}\"",
                    comm.pid,
                    comm.tid,
                    String::from_utf8_lossy(&comm.comm)
                );
            }
            PerfRecord::Switch(switch) => {
                println!(
                    "{index}: switch {} time {time}",
                    if switch.is_switch_out() { "out" } else { "in" }
                );
            }
            other => {
                println!("{index}: {} time {time}", other.name());
            }
        }
        index += 1;
    })?;
    println!("{index} records total");
    Ok(())
}
