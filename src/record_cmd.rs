//! The `record` subcommand: wires acquisition, the virtual runtime, and
//! the file writer together, and carries the control-channel daemon.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::cli::{parse_branch_filter, parse_call_stack, parse_data_limit, RecordArgs};
use crate::control::{ControlClient, ControlRequest, ControlServer, REPLY_TIMEOUT};
use crate::dedup::UniStackTable;
use crate::error::{RecordError, Result};
use crate::file_format::features::{EventDescEntry, FeatureContent, SymbolFileFeature};
use crate::file_format::reader::RecordFileReader;
use crate::file_format::writer::RecordFileWriter;
use crate::file_format::Feature;
use crate::perf_event::tuning::PerfLimits;
use crate::perf_event::{
    catalog, ClockId, PerfEvents, SampleStackType, TargetSelection, TrackingHandle, Workload,
};
use crate::record::PerfRecord;
use crate::vr::VirtualRuntime;

pub const DEFAULT_DWARF_STACK_SIZE: u32 = 65528;
const APP_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

static STOP_HANDLE: OnceLock<TrackingHandle> = OnceLock::new();

extern "C" fn on_termination_signal(_: libc::c_int) {
    if let Some(handle) = STOP_HANDLE.get() {
        handle.stop();
    }
}

fn install_signal_handlers(handle: &TrackingHandle) {
    let _ = STOP_HANDLE.set(handle.clone());
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(
            libc::SIGINT,
            on_termination_signal as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            on_termination_signal as libc::sighandler_t,
        );
    }
}

pub fn run(args: RecordArgs) -> Result<()> {
    match args.control.as_deref() {
        None => run_record(args, false),
        Some("prepare") => run_prepare(args),
        Some(command @ ("start" | "pause" | "resume")) => {
            let request = match command {
                "start" => ControlRequest::Start,
                "pause" => ControlRequest::Pause,
                _ => ControlRequest::Resume,
            };
            let ok = ControlClient::send(request, REPLY_TIMEOUT)?;
            println!(
                "{command} sampling {}.",
                if ok { "success" } else { "failed" }
            );
            if ok {
                Ok(())
            } else {
                Err(RecordError::ControlProtocol(format!("{command} rejected")))
            }
        }
        Some("stop") => {
            let ok = ControlClient::stop()?;
            println!("stop sampling {}.", if ok { "success" } else { "failed" });
            Ok(())
        }
        Some(other) => Err(RecordError::InvalidOption(format!(
            "--control {other}: command should be prepare, start, pause, resume, or stop"
        ))),
    }
}

/// `--control prepare`: create the fifos and detach a daemon that
/// samples under fifo control; the parent waits for its ready reply.
fn run_prepare(args: RecordArgs) -> Result<()> {
    ControlServer::create_fifos()?;

    match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Child) => {
            // The daemon must not hold the terminal.
            unsafe {
                libc::close(libc::STDIN_FILENO);
            }
            let result = run_record(args, true);
            if let Err(err) = &result {
                log::error!("sampling daemon failed: {err}");
            }
            crate::control::remove_fifos();
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
        Ok(nix::unistd::ForkResult::Parent { child }) => {
            let prepared = ControlClient::wait_prepared(REPLY_TIMEOUT)?;
            if !prepared {
                let _ = nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGKILL);
                crate::control::remove_fifos();
                return Err(RecordError::ControlProtocol(
                    "sampling daemon did not come up".into(),
                ));
            }
            println!(
                "{} control sampling success.",
                if args.restart { "start" } else { "create" }
            );
            Ok(())
        }
        Err(errno) => {
            crate::control::remove_fifos();
            Err(RecordError::ControlProtocol(format!("fork failed: {errno}")))
        }
    }
}

fn resolve_app_pid(app: &str) -> Result<i32> {
    let deadline = std::time::Instant::now() + APP_WAIT_TIMEOUT;
    loop {
        if let Ok(dir) = std::fs::read_dir("/proc") {
            for entry in dir.flatten() {
                let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                    continue;
                };
                let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
                    continue;
                };
                let first = cmdline.split(|&b| b == 0).next().unwrap_or(&[]);
                let name = String::from_utf8_lossy(first);
                let base = name.rsplit('/').next().unwrap_or(&name);
                if base == app {
                    return Ok(pid);
                }
            }
        }
        if std::time::Instant::now() >= deadline {
            return Err(RecordError::InvalidTargets(format!(
                "application \"{app}\" did not appear within {}s",
                APP_WAIT_TIMEOUT.as_secs()
            )));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn configure_events(events: &mut PerfEvents, args: &RecordArgs) -> Result<()> {
    if !args.events.is_empty() {
        events.add_events(&args.events, false)?;
    }
    for group in &args.groups {
        let members: Vec<String> = group.split(',').map(str::to_string).collect();
        events.add_events(&members, true)?;
    }
    if args.offcpu {
        if !catalog::sched_switch_available() {
            return Err(RecordError::EventNotSupported(
                "sched:sched_switch (needed by --offcpu)".into(),
            ));
        }
        events.add_events(&["sched:sched_switch".to_string()], false)?;
    }

    if let Some(frequency) = args.frequency {
        events.set_sample_frequency(frequency)?;
    } else if let Some(period) = args.period {
        events.set_sample_period(period)?;
    }

    let stack = match args.call_stack.as_deref() {
        None => SampleStackType::None,
        Some(text) => parse_call_stack(text).ok_or_else(|| {
            RecordError::InvalidOption(format!(
                "-s {text}: expected fp or dwarf[,size]"
            ))
        })?,
    };
    events.set_stack(stack)?;

    if !args.branch_filter.is_empty() {
        let mask = parse_branch_filter(&args.branch_filter).ok_or_else(|| {
            RecordError::InvalidOption("unknown -j branch filter".into())
        })?;
        events.set_branch_sample(mask)?;
    }

    if let Some(clockid) = &args.clockid {
        let clock = ClockId::parse(clockid).ok_or_else(|| {
            RecordError::InvalidOption(format!("invalid --clockid value {clockid}"))
        })?;
        events.set_clock(clock);
    }

    if let Some(pages) = args.mmap_pages {
        events.set_mmap_pages(pages)?;
    }
    if let Some(chkms) = args.chkms {
        events.set_poll_interval(chkms)?;
    }
    if let Some(duration) = args.duration {
        if duration <= 0.0 {
            return Err(RecordError::InvalidOption(
                "-d duration must be positive".into(),
            ));
        }
        events.set_timeout(Duration::from_secs_f64(duration));
    }
    events.set_kernel_callchain(args.kernel_callchain);
    events.set_callchain_useronly(args.callchain_useronly);
    Ok(())
}

fn run_record(args: RecordArgs, fifo_server: bool) -> Result<()> {
    if let Some(limit) = &args.cpu_limit {
        if !(1..=100).contains(limit) {
            return Err(RecordError::InvalidOption(format!(
                "--cpu-limit {limit} out of range 1..100"
            )));
        }
    }
    let data_limit = match &args.data_limit {
        Some(text) => Some(parse_data_limit(text).ok_or_else(|| {
            RecordError::InvalidOption(format!("--data-limit {text} is not N[KMG]"))
        })?),
        None => None,
    };

    // Targets: explicit pids/tids, an app to wait for, a workload to
    // launch, or the whole system.
    let mut workload = None;
    let mut pids = args.pids.clone();
    if let Some(app) = &args.app {
        pids.push(resolve_app_pid(app)?);
    }
    if !args.command.is_empty() {
        if args.system_wide || !pids.is_empty() || !args.tids.is_empty() {
            return Err(RecordError::InvalidTargets(
                "a workload command cannot be combined with -a/-p/-t".into(),
            ));
        }
        let launched = Workload::launch_suspended(&args.command)?;
        pids.push(launched.pid());
        workload = Some(launched);
    }
    let targets = TargetSelection {
        system_wide: args.system_wide,
        cpus: if args.cpus.is_empty() {
            None
        } else {
            Some(args.cpus.clone())
        },
        pids: pids.clone(),
        tids: args.tids.clone(),
        exclude_pids: if args.exclude_self {
            vec![std::process::id() as i32]
        } else {
            Vec::new()
        },
    };

    let build_events = |default_event: &str| -> Result<PerfEvents> {
        let mut events = PerfEvents::new();
        if args.events.is_empty() && args.groups.is_empty() {
            events.add_events(&[default_event.to_string()], false)?;
        }
        configure_events(&mut events, &args)?;
        events.set_enable_on_exec(workload.is_some());
        events.set_targets(targets.clone())?;
        Ok(events)
    };

    let mut events = build_events("hw-cpu-cycles")?;

    // Kernel knobs before any descriptor opens.
    let mut limits = PerfLimits::apply(
        events.requested_frequency(),
        events.mmap_pages(),
        args.cpu_limit,
    );
    limits.bump_saved_cmdlines();
    if let Some(max_rate) = crate::perf_event::tuning::max_sample_rate() {
        if events.requested_frequency() > max_rate {
            log::warn!(
                "requested frequency {} exceeds perf_event_max_sample_rate {max_rate}; \
                 the kernel will throttle sampling",
                events.requested_frequency()
            );
        }
    }

    if let Err(err) = events.prepare_tracking() {
        let permission_denied = matches!(
            &err,
            RecordError::OpenFailed { source, .. }
                if source.kind() == std::io::ErrorKind::PermissionDenied
        );
        if permission_denied {
            if let Some(level) = crate::perf_event::tuning::paranoia_level() {
                if level > 1 && !crate::perf_event::tuning::is_root() {
                    eprintln!(
                        "/proc/sys/kernel/perf_event_paranoid is {level}; sampling as a \
                         non-root user needs it at 1 or lower."
                    );
                }
            }
            return Err(err);
        }
        if !(args.events.is_empty() && args.groups.is_empty()) {
            return Err(err);
        }
        // Hardware cycle counting is unavailable in some VMs; retry on
        // the software clock.
        log::warn!("hw-cpu-cycles could not be opened ({err}), trying sw-cpu-clock");
        events = build_events("sw-cpu-clock")?;
        events.prepare_tracking()?;
    }

    log::info!(
        "sampling on {} with {} events",
        crate::arch::BUILD_ARCH_TYPE.name(),
        events.attrs_with_ids().len(),
    );

    let mut vr = VirtualRuntime::new(args.symbol_dirs.clone(), true);
    vr.set_disable_unwind(args.disable_unwind || args.delay_unwind);

    // With delayed unwinding the first pass writes raw snapshots;
    // compression waits for the post-pass.
    let compress_now = args.compress && !args.delay_unwind;
    let mut writer = RecordFileWriter::new(&args.output, &events.attrs_with_ids(), compress_now)?;

    let handle = events.handle();
    install_signal_handlers(&handle);

    // Control daemon: acknowledge the prepare and serve commands from a
    // second thread; sampling stays paused until START arrives.
    let control_thread = if fifo_server {
        handle.pause();
        let mut server = ControlServer::connect()?;
        server.respond(true);
        let control_handle = handle.clone();
        let liveness_handle = handle.clone();
        Some(std::thread::spawn(move || {
            server.serve(
                move |request| match request {
                    ControlRequest::Start | ControlRequest::Resume => {
                        control_handle.resume();
                        true
                    }
                    ControlRequest::Pause => {
                        control_handle.pause();
                        true
                    }
                    ControlRequest::Stop => {
                        control_handle.stop();
                        true
                    }
                    ControlRequest::Check => {
                        control_handle.is_running() || !control_handle.stop_requested()
                    }
                },
                move || !liveness_handle.stop_requested(),
            );
        }))
    } else {
        None
    };

    // Model and record the world as it is before counters go live.
    let mut head_records = vr.kernel_space_records();
    if args.system_wide {
        head_records.extend(vr.enumerate_all_processes(&[std::process::id() as i32]));
    } else {
        for pid in &pids {
            head_records.extend(vr.enumerate_process(*pid));
        }
        for tid in &args.tids {
            head_records.extend(vr.enumerate_process(*tid));
        }
    }
    for record in &head_records {
        writer.write_record(record)?;
    }

    if let Some(workload) = &workload {
        workload.start()?;
    }

    let own_pid = std::process::id() as i32;
    let exclude_self = args.exclude_self;
    let mut dedup = args.dedup_stack.then(UniStackTable::new);
    let mut sample_count: u64 = 0;
    let mut other_count: u64 = 0;
    let mut write_error: Option<RecordError> = None;
    let mut data_limit_hit = false;

    events.start_tracking(|mut record| {
        if write_error.is_some() {
            return false;
        }
        if exclude_self && record.pid() == Some(own_pid) {
            return true;
        }

        match &mut record {
            PerfRecord::Sample(sample) => {
                sample_count += 1;
                vr.process_sample(sample, dedup.as_mut());
            }
            other => {
                other_count += 1;
                vr.update_from_record(other);
            }
        }

        if let Err(err) = writer.write_record(&record) {
            write_error = Some(err);
            return false;
        }
        if let Some(limit) = data_limit {
            if writer.data_size() >= limit {
                log::info!("data limit of {limit} bytes reached");
                data_limit_hit = true;
                return false;
            }
        }
        true
    })?;

    if let Some(err) = write_error {
        return Err(err);
    }

    // Post-processing runs synchronously after stop.
    add_ambient_features(&mut writer, &events, &args, dedup.as_ref(), &vr);
    let total_bytes = writer.finish()?;

    if args.delay_unwind {
        post_process_record_file(&args.output, &args.symbol_dirs, args.compress)?;
    }

    if let Some(mut workload) = workload {
        workload.try_wait_exited();
    }
    limits.restore();

    let (sample_lost, nonsample_lost) = events.get_lost_samples();
    println!(
        "Captured {sample_count} samples and {other_count} other records into {} ({total_bytes} bytes{})",
        args.output.display(),
        if data_limit_hit { ", data limit reached" } else { "" },
    );
    println!("Sample lost: {sample_lost}, non-sample lost: {nonsample_lost}");

    if let Some(thread) = control_thread {
        // The serve loop ends with the STOP command that ended sampling.
        let _ = thread.join();
    }
    Ok(())
}

fn add_ambient_features(
    writer: &mut RecordFileWriter,
    events: &PerfEvents,
    args: &RecordArgs,
    dedup: Option<&UniStackTable>,
    vr: &VirtualRuntime,
) {
    if let Ok(info) = uname::uname() {
        writer.add_feature(Feature::Hostname, &FeatureContent::String(info.nodename));
        writer.add_feature(Feature::OsRelease, &FeatureContent::String(info.release));
        writer.add_feature(Feature::Arch, &FeatureContent::String(info.machine));
    }
    writer.add_feature(
        Feature::Version,
        &FeatureContent::String(env!("CARGO_PKG_VERSION").to_string()),
    );
    writer.add_feature(
        Feature::NrCpus,
        &FeatureContent::NrCpus {
            available: unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) } as u32,
            online: unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } as u32,
        },
    );
    if let Some(model) = cpu_model_name() {
        writer.add_feature(Feature::CpuDesc, &FeatureContent::String(model));
    }
    if let Some(total_kb) = total_memory_kb() {
        writer.add_feature(Feature::TotalMem, &FeatureContent::TotalMem(total_kb));
    }
    if let Ok(online) = std::fs::read_to_string("/sys/devices/system/cpu/online") {
        writer.add_feature(
            Feature::CpuTopology,
            &FeatureContent::String(online.trim().to_string()),
        );
    }
    let cmdline: Vec<String> = std::env::args().collect();
    writer.add_feature(Feature::Cmdline, &FeatureContent::String(cmdline.join(" ")));
    writer.add_feature(
        Feature::EventDesc,
        &FeatureContent::EventDesc(
            events
                .attrs_with_ids()
                .into_iter()
                .map(|entry| EventDescEntry {
                    attr: entry.attr,
                    name: entry.name,
                    ids: entry.ids,
                })
                .collect(),
        ),
    );
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    writer.add_feature(
        Feature::RecordTime,
        &FeatureContent::String(now.to_string()),
    );
    if args.offcpu {
        writer.add_feature(Feature::CpuOff, &FeatureContent::U64(1));
    }
    if !args.command.is_empty() {
        writer.add_feature(
            Feature::WorkloadCmd,
            &FeatureContent::String(args.command.join(" ")),
        );
    }
    if let Some(table) = dedup {
        let mut payload = Vec::new();
        table.write(&mut payload);
        writer.add_feature(
            Feature::FilesUniStackTable,
            &FeatureContent::UniStackTable(payload),
        );
    }

    // Only modules whose symbols were actually hit go into the file.
    let symbol_files: Vec<SymbolFileFeature> = vr
        .symbols
        .files()
        .iter()
        .filter(|file| file.any_hits())
        .map(SymbolFileFeature::from_symbols_file)
        .collect();
    if !symbol_files.is_empty() {
        writer.add_feature(
            Feature::FilesSymbol,
            &FeatureContent::SymbolFiles(symbol_files),
        );
    }
}

fn cpu_model_name() -> Option<String> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("model name") {
            return Some(rest.trim_start_matches([' ', '\t', ':']).to_string());
        }
    }
    None
}

fn total_memory_kb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// `--delay-unwind` second pass: re-read the raw file, unwind every
/// sample against a model rebuilt from the recorded stream, and write
/// the final (optionally compressed) file over the original.
pub fn post_process_record_file(
    path: &Path,
    symbol_dirs: &[PathBuf],
    compress: bool,
) -> Result<()> {
    let reader = RecordFileReader::open(path)?;
    let attrs = reader.attrs().to_vec();
    let tmp_path = path.with_extension("unwound");
    let mut writer = RecordFileWriter::new(&tmp_path, &attrs, compress)?;

    let mut vr = VirtualRuntime::new(symbol_dirs.to_vec(), false);
    let mut write_error = None;
    reader.read_records(|mut record| {
        if write_error.is_some() {
            return;
        }
        match &mut record {
            PerfRecord::Sample(sample) => vr.process_sample(sample, None),
            other => vr.update_from_record(other),
        }
        if let Err(err) = writer.write_record(&record) {
            write_error = Some(err);
        }
    })?;
    if let Some(err) = write_error {
        return Err(err);
    }

    for (feature, content) in reader.features() {
        if *feature == Feature::FilesSymbol {
            continue;
        }
        writer.add_feature(*feature, content);
    }
    let symbol_files: Vec<SymbolFileFeature> = vr
        .symbols
        .files()
        .iter()
        .filter(|file| file.any_hits())
        .map(SymbolFileFeature::from_symbols_file)
        .collect();
    if !symbol_files.is_empty() {
        writer.add_feature(
            Feature::FilesSymbol,
            &FeatureContent::SymbolFiles(symbol_files),
        );
    }
    writer.finish()?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
