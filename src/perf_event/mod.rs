//! Perf event acquisition: descriptor ownership, the drain loop, and the
//! start/stop/pause/resume protocol.

pub mod catalog;
pub mod group;
pub mod ring_buffer;
pub mod sorter;
pub mod sys;
pub mod tuning;

use std::os::unix::process::CommandExt;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use catalog::EventSpec;
use group::EventGroups;
use ring_buffer::EventFd;
use sys::*;

use crate::arch::BUILD_ARCH_TYPE;
use crate::error::{RecordError, Result};
use crate::record::{PerfRecord, SampleFormat};

pub const MIN_SAMPLE_FREQUENCY: u64 = 1;
pub const MAX_SAMPLE_FREQUENCY: u64 = 100000;

pub const MIN_SAMPLE_STACK_SIZE: u32 = 8;
pub const MAX_SAMPLE_STACK_SIZE: u32 = 65528;

pub const MIN_PERF_MMAP_PAGES: u32 = 4;
pub const MAX_PERF_MMAP_PAGES: u32 = 1024;
pub const DEFAULT_MMAP_PAGES: u32 = 256;

pub const MIN_POLL_INTERVAL_MS: u32 = 1;
pub const MAX_POLL_INTERVAL_MS: u32 = 200;
pub const DEFAULT_POLL_INTERVAL_MS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStackType {
    None,
    Fp,
    Dwarf(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    Realtime,
    Boottime,
    Monotonic,
    MonotonicRaw,
    Tai,
}

impl ClockId {
    pub fn to_clockid(self) -> i32 {
        match self {
            ClockId::Realtime => libc::CLOCK_REALTIME,
            ClockId::Boottime => libc::CLOCK_BOOTTIME,
            ClockId::Monotonic => libc::CLOCK_MONOTONIC,
            ClockId::MonotonicRaw => libc::CLOCK_MONOTONIC_RAW,
            ClockId::Tai => libc::CLOCK_TAI,
        }
    }

    pub fn parse(name: &str) -> Option<ClockId> {
        match name {
            "realtime" => Some(ClockId::Realtime),
            "boottime" => Some(ClockId::Boottime),
            "monotonic" => Some(ClockId::Monotonic),
            "monotonic_raw" => Some(ClockId::MonotonicRaw),
            "clock_tai" => Some(ClockId::Tai),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TargetSelection {
    pub system_wide: bool,
    pub cpus: Option<Vec<u32>>,
    pub pids: Vec<i32>,
    pub tids: Vec<i32>,
    pub exclude_pids: Vec<i32>,
}

/// One event attribute block and the kernel ids attached to it, as the
/// file writer needs them.
#[derive(Debug, Clone)]
pub struct AttrWithIds {
    pub attr: PerfEventAttr,
    pub name: String,
    pub ids: Vec<u64>,
}

/// Cross-thread signal surface of a running session. The control thread
/// flips these flags; the drain thread observes them between poll wakes
/// and performs the actual ioctls.
#[derive(Clone)]
pub struct TrackingHandle(Arc<TrackingState>);

struct TrackingState {
    stop: AtomicBool,
    pause: AtomicBool,
    running: AtomicBool,
}

impl TrackingHandle {
    fn new() -> Self {
        TrackingHandle(Arc::new(TrackingState {
            stop: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }))
    }

    pub fn stop(&self) {
        self.0.stop.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.0.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.0.pause.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.0.stop.load(Ordering::SeqCst)
    }
}

struct GroupSpec {
    members: Vec<EventSpec>,
}

pub struct PerfEvents {
    group_specs: Vec<GroupSpec>,
    targets: TargetSelection,
    frequency: Option<u64>,
    period: Option<u64>,
    stack: SampleStackType,
    branch_sample_type: u64,
    clock_id: Option<ClockId>,
    mmap_pages: u32,
    poll_interval_ms: u32,
    timeout: Option<Duration>,
    kernel_callchain: bool,
    callchain_useronly: bool,
    inherit: bool,
    enable_on_exec: bool,

    attrs: Vec<PerfEventAttr>,
    attr_names: Vec<String>,
    attr_ids: Vec<Vec<u64>>,
    formats: Vec<SampleFormat>,
    groups: EventGroups,
    prepared: bool,

    handle: TrackingHandle,
    sample_lost: u64,
    nonsample_lost: u64,
}

impl PerfEvents {
    pub fn new() -> Self {
        PerfEvents {
            group_specs: Vec::new(),
            targets: TargetSelection::default(),
            frequency: None,
            period: None,
            stack: SampleStackType::None,
            branch_sample_type: 0,
            clock_id: None,
            mmap_pages: DEFAULT_MMAP_PAGES,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timeout: None,
            kernel_callchain: false,
            callchain_useronly: false,
            inherit: true,
            enable_on_exec: false,
            attrs: Vec::new(),
            attr_names: Vec::new(),
            attr_ids: Vec::new(),
            formats: Vec::new(),
            groups: EventGroups::new(),
            prepared: false,
            handle: TrackingHandle::new(),
            sample_lost: 0,
            nonsample_lost: 0,
        }
    }

    pub fn handle(&self) -> TrackingHandle {
        self.handle.clone()
    }

    /// Resolve event names against the catalog. With `grouped`, the whole
    /// list shares one group leader and is scheduled atomically.
    pub fn add_events(&mut self, names: &[String], grouped: bool) -> Result<()> {
        let mut members = Vec::new();
        for name in names {
            members.push(catalog::resolve_event(name)?);
        }
        if members.is_empty() {
            return Ok(());
        }
        if grouped {
            self.group_specs.push(GroupSpec { members });
        } else {
            for spec in members {
                self.group_specs.push(GroupSpec {
                    members: vec![spec],
                });
            }
        }
        Ok(())
    }

    pub fn set_targets(&mut self, targets: TargetSelection) -> Result<()> {
        if targets.system_wide && (!targets.pids.is_empty() || !targets.tids.is_empty()) {
            return Err(RecordError::InvalidTargets(
                "system-wide mode cannot be combined with a pid/tid list".into(),
            ));
        }
        if !targets.system_wide
            && targets.pids.is_empty()
            && targets.tids.is_empty()
            && targets.cpus.is_none()
        {
            return Err(RecordError::InvalidTargets(
                "no target processes, threads, or cpus selected".into(),
            ));
        }
        self.targets = targets;
        Ok(())
    }

    pub fn set_sample_frequency(&mut self, frequency: u64) -> Result<()> {
        if !(MIN_SAMPLE_FREQUENCY..=MAX_SAMPLE_FREQUENCY).contains(&frequency) {
            return Err(RecordError::InvalidOption(format!(
                "frequency {frequency} out of range {MIN_SAMPLE_FREQUENCY}..{MAX_SAMPLE_FREQUENCY}"
            )));
        }
        if self.period.is_some() {
            return Err(RecordError::InvalidOption(
                "frequency and period are mutually exclusive".into(),
            ));
        }
        self.frequency = Some(frequency);
        Ok(())
    }

    pub fn set_sample_period(&mut self, period: u64) -> Result<()> {
        if period == 0 {
            return Err(RecordError::InvalidOption(
                "period must be greater than 0".into(),
            ));
        }
        if self.frequency.is_some() {
            return Err(RecordError::InvalidOption(
                "frequency and period are mutually exclusive".into(),
            ));
        }
        self.period = Some(period);
        Ok(())
    }

    pub fn set_stack(&mut self, stack: SampleStackType) -> Result<()> {
        if let SampleStackType::Dwarf(size) = stack {
            if !(MIN_SAMPLE_STACK_SIZE..=MAX_SAMPLE_STACK_SIZE).contains(&size) || size % 8 != 0 {
                return Err(RecordError::InvalidOption(format!(
                    "dwarf stack size {size} must be a multiple of 8 in \
                     {MIN_SAMPLE_STACK_SIZE}..{MAX_SAMPLE_STACK_SIZE}"
                )));
            }
        }
        self.stack = stack;
        Ok(())
    }

    pub fn set_branch_sample(&mut self, mask: u64) -> Result<()> {
        const FILTER_BITS: u64 =
            PERF_SAMPLE_BRANCH_USER | PERF_SAMPLE_BRANCH_KERNEL | PERF_SAMPLE_BRANCH_HV;
        if mask != 0 && mask & !FILTER_BITS == 0 {
            return Err(RecordError::InvalidOption(
                "branch sampling needs at least one branch type besides u/k filters".into(),
            ));
        }
        self.branch_sample_type = mask;
        Ok(())
    }

    pub fn set_clock(&mut self, clock_id: ClockId) {
        self.clock_id = Some(clock_id);
    }

    pub fn set_mmap_pages(&mut self, pages: u32) -> Result<()> {
        if !pages.is_power_of_two() || !(MIN_PERF_MMAP_PAGES..=MAX_PERF_MMAP_PAGES).contains(&pages)
        {
            return Err(RecordError::InvalidOption(format!(
                "mmap pages {pages} must be a power of two in \
                 {MIN_PERF_MMAP_PAGES}..{MAX_PERF_MMAP_PAGES}"
            )));
        }
        self.mmap_pages = pages;
        Ok(())
    }

    pub fn set_poll_interval(&mut self, ms: u32) -> Result<()> {
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&ms) {
            return Err(RecordError::InvalidOption(format!(
                "poll interval {ms} out of range {MIN_POLL_INTERVAL_MS}..{MAX_POLL_INTERVAL_MS}"
            )));
        }
        self.poll_interval_ms = ms;
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn set_kernel_callchain(&mut self, enabled: bool) {
        self.kernel_callchain = enabled;
    }

    pub fn set_callchain_useronly(&mut self, enabled: bool) {
        self.callchain_useronly = enabled;
    }

    /// Arm the events on exec of the workload child instead of
    /// explicitly, so the child's early frames are sampled too.
    pub fn set_enable_on_exec(&mut self, enabled: bool) {
        self.enable_on_exec = enabled;
    }

    pub fn mmap_pages(&self) -> u32 {
        self.mmap_pages
    }

    pub fn requested_frequency(&self) -> u64 {
        self.frequency.unwrap_or(tuning::DEFAULT_SAMPLE_FREQUENCY)
    }

    fn build_attr(&self, spec: &EventSpec, is_leader: bool) -> PerfEventAttr {
        let mut attr = PerfEventAttr::default();
        attr.kind = spec.kind;
        attr.config = spec.config;

        attr.sample_type = PERF_SAMPLE_IDENTIFIER
            | PERF_SAMPLE_IP
            | PERF_SAMPLE_TID
            | PERF_SAMPLE_TIME
            | PERF_SAMPLE_ID
            | PERF_SAMPLE_STREAM_ID
            | PERF_SAMPLE_CPU
            | PERF_SAMPLE_PERIOD;

        if let Some(frequency) = self.frequency {
            attr.sample_period_or_freq = frequency;
            attr.flags |= PERF_ATTR_FLAG_FREQ;
        } else if let Some(period) = self.period {
            attr.sample_period_or_freq = period;
        } else {
            attr.sample_period_or_freq = tuning::DEFAULT_SAMPLE_FREQUENCY;
            attr.flags |= PERF_ATTR_FLAG_FREQ;
        }

        match self.stack {
            SampleStackType::None => {}
            SampleStackType::Fp => {
                attr.sample_type |= PERF_SAMPLE_CALLCHAIN;
            }
            SampleStackType::Dwarf(size) => {
                attr.sample_type |= PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
                attr.sample_regs_user = BUILD_ARCH_TYPE.supported_regs_mask();
                attr.sample_stack_user = size;
                if self.kernel_callchain {
                    // Kernel frames come from the in-kernel walker while
                    // the user stack is unwound from the snapshot.
                    attr.sample_type |= PERF_SAMPLE_CALLCHAIN;
                    attr.flags |= PERF_ATTR_FLAG_EXCLUDE_CALLCHAIN_USER;
                }
            }
        }

        if spec.kind == PERF_TYPE_TRACEPOINT {
            attr.sample_type |= PERF_SAMPLE_RAW;
        }

        if self.branch_sample_type != 0 {
            attr.sample_type |= PERF_SAMPLE_BRANCH_STACK;
            attr.branch_sample_type = self.branch_sample_type;
        }

        attr.flags |= PERF_ATTR_FLAG_MMAP
            | PERF_ATTR_FLAG_MMAP2
            | PERF_ATTR_FLAG_COMM
            | PERF_ATTR_FLAG_COMM_EXEC
            | PERF_ATTR_FLAG_TASK
            | PERF_ATTR_FLAG_SAMPLE_ID_ALL;

        if is_leader {
            attr.flags |= PERF_ATTR_FLAG_DISABLED;
        }
        if self.enable_on_exec {
            attr.flags |= PERF_ATTR_FLAG_ENABLE_ON_EXEC;
        }
        if self.inherit && !self.targets.system_wide {
            attr.flags |= PERF_ATTR_FLAG_INHERIT;
        }
        if let Some(clock_id) = self.clock_id {
            attr.flags |= PERF_ATTR_FLAG_USE_CLOCKID;
            attr.clock_id = clock_id.to_clockid();
        }
        if spec.exclude_user {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_USER;
        }
        if spec.exclude_kernel {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        }
        if self.callchain_useronly {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_CALLCHAIN_KERNEL;
        }

        attr.wakeup_events_or_watermark = 1;
        attr
    }

    fn online_cpus() -> Vec<u32> {
        (0..num_cpus::get() as u32).collect()
    }

    /// Perform every perf_event_open and ring-buffer mmap. Individual
    /// failures degrade to a warning; zero open descriptors is fatal.
    pub fn prepare_tracking(&mut self) -> Result<()> {
        if self.group_specs.is_empty() {
            self.add_events(&["hw-cpu-cycles".to_string()], false)
                .or_else(|_| self.add_events(&["sw-cpu-clock".to_string()], false))?;
        }

        let cpus = self.targets.cpus.clone().unwrap_or_else(Self::online_cpus);
        let pids: Vec<i32> = if self.targets.system_wide {
            vec![-1]
        } else {
            let mut pids = self.targets.pids.clone();
            pids.extend_from_slice(&self.targets.tids);
            pids.retain(|pid| !self.targets.exclude_pids.contains(pid));
            pids
        };

        let mut last_error: Option<RecordError> = None;

        let group_specs = std::mem::take(&mut self.group_specs);
        for group_spec in &group_specs {
            for (member_index, spec) in group_spec.members.iter().enumerate() {
                let attr = self.build_attr(spec, member_index == 0);
                self.formats.push(SampleFormat::from_attr(&attr));
                self.attrs.push(attr);
                self.attr_names.push(spec.name.clone());
                self.attr_ids.push(Vec::new());
            }
        }

        let mut attr_base = 0;
        for group_spec in &group_specs {
            for &pid in &pids {
                for &cpu in &cpus {
                    let mut leader_fd = -1;
                    for (member_index, _spec) in group_spec.members.iter().enumerate() {
                        let attr_index = attr_base + member_index;
                        let attr = &self.attrs[attr_index];
                        match EventFd::open(attr, pid, cpu as i32, leader_fd, attr_index) {
                            Ok(mut event) => {
                                if leader_fd == -1 {
                                    if let Err(err) = event.mmap_ring(self.mmap_pages) {
                                        log::warn!(
                                            "mmap of {} pages failed for fd {}: {err}",
                                            self.mmap_pages,
                                            event.fd()
                                        );
                                        // Without a ring there is nowhere
                                        // for this group's records to go.
                                        break;
                                    }
                                    leader_fd = event.fd();
                                } else if let Err(err) = event.redirect_output(leader_fd) {
                                    log::warn!("cannot share ring buffer: {err}");
                                }
                                match event.event_id() {
                                    Ok(id) => self.attr_ids[attr_index].push(id),
                                    Err(err) => log::warn!("cannot read event id: {err}"),
                                }
                                self.groups.add(event);
                            }
                            Err(source) => {
                                let event_name = self.attr_names[attr_index].clone();
                                log::warn!(
                                    "perf_event_open failed for \"{event_name}\" \
                                     pid {pid} cpu {cpu}: {source}"
                                );
                                last_error = Some(RecordError::OpenFailed {
                                    event: event_name,
                                    pid,
                                    cpu: cpu as i32,
                                    source,
                                });
                            }
                        }
                    }
                }
            }
            attr_base += group_spec.members.len();
        }
        self.group_specs = group_specs;

        if self.groups.is_empty() {
            return Err(last_error.unwrap_or(RecordError::NoTrackableTargets));
        }

        log::info!(
            "prepared {} descriptors over {} cpus",
            self.groups.descriptor_count(),
            cpus.len()
        );
        self.prepared = true;
        Ok(())
    }

    pub fn attrs_with_ids(&self) -> Vec<AttrWithIds> {
        self.attrs
            .iter()
            .zip(&self.attr_names)
            .zip(&self.attr_ids)
            .map(|((attr, name), ids)| AttrWithIds {
                attr: *attr,
                name: name.clone(),
                ids: ids.clone(),
            })
            .collect()
    }

    /// Run the drain loop until stopped, the deadline passes, the
    /// consumer declines further records, or every descriptor is gone
    /// (all target processes exited).
    ///
    /// The consumer returns `false` to halt acquisition (data limit).
    pub fn start_tracking(
        &mut self,
        mut consumer: impl FnMut(PerfRecord) -> bool,
    ) -> Result<()> {
        assert!(self.prepared, "prepare_tracking must succeed first");

        // A session prepared through the control channel starts paused
        // and is armed by the START command.
        let mut paused = self.handle.0.pause.load(Ordering::SeqCst);
        if !self.enable_on_exec && !paused {
            self.groups.enable_all()?;
        }
        self.handle.0.running.store(true, Ordering::SeqCst);

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut keep_going = true;

        while keep_going {
            if self.handle.0.stop.load(Ordering::SeqCst) {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    log::info!("deadline reached, stopping");
                    break;
                }
            }

            let want_pause = self.handle.0.pause.load(Ordering::SeqCst);
            if want_pause != paused {
                let result = if want_pause {
                    self.groups.disable_all()
                } else {
                    self.groups.enable_all()
                };
                if let Err(err) = result {
                    log::warn!("pause/resume ioctl failed: {err}");
                }
                paused = want_pause;
            }

            let sample_lost = &mut self.sample_lost;
            self.groups.consume(&self.formats, |record| {
                match &record {
                    PerfRecord::Lost(lost) => *sample_lost += lost.lost,
                    PerfRecord::LostSamples(lost) => *sample_lost += lost.lost,
                    _ => {}
                }
                if !consumer(record) {
                    keep_going = false;
                }
            });

            if self.groups.is_empty() {
                log::info!("all descriptors closed, stopping");
                break;
            }

            self.groups.wait(self.poll_interval_ms as i32);
        }

        let _ = self.groups.disable_all();

        // Final drain: everything still sitting in the rings or the
        // sorter is delivered before we report completion.
        let sample_lost = &mut self.sample_lost;
        self.groups.finish(&self.formats, |record| {
            match &record {
                PerfRecord::Lost(lost) => *sample_lost += lost.lost,
                PerfRecord::LostSamples(lost) => *sample_lost += lost.lost,
                _ => {}
            }
            consumer(record);
        });
        self.nonsample_lost += self.groups.read_errors;

        self.handle.0.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn get_lost_samples(&self) -> (u64, u64) {
        (self.sample_lost, self.nonsample_lost)
    }
}

impl Default for PerfEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// A workload child launched stopped, so descriptors with
/// `enable_on_exec` can attach before it runs.
pub struct Workload {
    child: Child,
}

impl Workload {
    pub fn launch_suspended(command: &[String]) -> Result<Workload> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| RecordError::Workload("empty command".into()))?;
        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        unsafe {
            cmd.pre_exec(|| {
                // Stop between fork and exec; the profiler resumes us
                // once its descriptors are attached.
                libc::raise(libc::SIGSTOP);
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .map_err(|e| RecordError::Workload(e.to_string()))?;
        Ok(Workload { child })
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    pub fn start(&self) -> Result<()> {
        let result = unsafe { libc::kill(self.child.id() as i32, libc::SIGCONT) };
        if result != 0 {
            return Err(RecordError::Workload(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(())
    }

    pub fn try_wait_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_conflicts_are_rejected() {
        let mut events = PerfEvents::new();
        let err = events.set_targets(TargetSelection {
            system_wide: true,
            pids: vec![1],
            ..Default::default()
        });
        assert!(matches!(err, Err(RecordError::InvalidTargets(_))));

        let err = events.set_targets(TargetSelection::default());
        assert!(matches!(err, Err(RecordError::InvalidTargets(_))));
    }

    #[test]
    fn sampling_options_validate() {
        let mut events = PerfEvents::new();
        assert!(events.set_sample_frequency(0).is_err());
        assert!(events.set_sample_frequency(1000).is_ok());
        assert!(events.set_sample_period(100).is_err()); // freq already set

        let mut events = PerfEvents::new();
        assert!(events.set_sample_period(0).is_err());
        assert!(events.set_sample_period(100000).is_ok());

        assert!(events.set_stack(SampleStackType::Dwarf(7)).is_err());
        assert!(events.set_stack(SampleStackType::Dwarf(65536)).is_err());
        assert!(events.set_stack(SampleStackType::Dwarf(32768)).is_ok());

        assert!(events.set_mmap_pages(3).is_err());
        assert!(events.set_mmap_pages(2048).is_err());
        assert!(events.set_mmap_pages(128).is_ok());

        // A branch mask with only space filters has nothing to sample.
        assert!(events
            .set_branch_sample(PERF_SAMPLE_BRANCH_USER)
            .is_err());
        assert!(events
            .set_branch_sample(PERF_SAMPLE_BRANCH_USER | PERF_SAMPLE_BRANCH_ANY_CALL)
            .is_ok());
    }

    #[test]
    fn dwarf_attr_requests_regs_and_stack() {
        let mut events = PerfEvents::new();
        events.set_stack(SampleStackType::Dwarf(16384)).unwrap();
        events.set_kernel_callchain(true);
        let spec = catalog::resolve_event("sw-cpu-clock").unwrap();
        let attr = events.build_attr(&spec, true);
        assert_ne!(attr.sample_type & PERF_SAMPLE_REGS_USER, 0);
        assert_ne!(attr.sample_type & PERF_SAMPLE_STACK_USER, 0);
        assert_ne!(attr.sample_type & PERF_SAMPLE_CALLCHAIN, 0);
        assert_ne!(attr.flags & PERF_ATTR_FLAG_EXCLUDE_CALLCHAIN_USER, 0);
        assert_eq!(attr.sample_stack_user, 16384);
        assert_ne!(attr.flags & PERF_ATTR_FLAG_DISABLED, 0);
    }
}
