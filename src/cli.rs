use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "perfrec",
    version,
    about = r#"
perfrec is a perf-event sampling profiler for Linux.

EXAMPLES:
    # Profile a freshly launched command with DWARF callstacks:
    perfrec record -s dwarf -- ./yourcommand yourargs

    # Profile an existing process at 4000 Hz for five seconds:
    perfrec record -p 12345 -f 4000 -d 5

    # Profile the whole system:
    perfrec record -a

    # Summarize a recording:
    perfrec report -i perf.data
"#
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,

    /// More logging; repeat for more detail.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Sample processes and write a trace file.
    Record(RecordArgs),

    /// Summarize a trace file by symbol.
    Report(ReportArgs),

    /// Count events over a workload or time window.
    Stat(StatArgs),

    /// List the events this kernel supports.
    List(ListArgs),

    /// Dump a trace file record by record.
    Dump(DumpArgs),
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// Profile every process on the selected cpus.
    #[arg(short = 'a', long = "all", conflicts_with_all = ["pids", "tids"])]
    pub system_wide: bool,

    /// Pids to profile.
    #[arg(short = 'p', long = "pid", value_delimiter = ',')]
    pub pids: Vec<i32>,

    /// Tids to profile.
    #[arg(short = 't', long = "tid", value_delimiter = ',')]
    pub tids: Vec<i32>,

    /// Profile the process of this application/package name.
    #[arg(long, conflicts_with_all = ["pids", "tids"])]
    pub app: Option<String>,

    /// Restrict to these cpus.
    #[arg(short = 'c', long = "cpu", value_delimiter = ',')]
    pub cpus: Vec<u32>,

    /// Events to sample, from `perfrec list`.
    #[arg(short = 'e', long = "event", value_delimiter = ',')]
    pub events: Vec<String>,

    /// An event group; members are comma-separated and scheduled
    /// together. May be given more than once.
    #[arg(short = 'g', long = "group", action = clap::ArgAction::Append)]
    pub groups: Vec<String>,

    /// Callstack mode: fp, or dwarf[,size].
    #[arg(short = 's', long = "call-stack")]
    pub call_stack: Option<String>,

    /// Sampling frequency in Hz.
    #[arg(short = 'f', long, conflicts_with = "period")]
    pub frequency: Option<u64>,

    /// Sample once every this many event counts instead of by frequency.
    #[arg(long)]
    pub period: Option<u64>,

    /// Stop after this many seconds.
    #[arg(short = 'd', long)]
    pub duration: Option<f64>,

    /// Ring buffer pages per descriptor (power of two).
    #[arg(short = 'm', long = "mmap-pages")]
    pub mmap_pages: Option<u32>,

    /// Output file.
    #[arg(short = 'o', long, default_value = "perf.data")]
    pub output: PathBuf,

    /// Out-of-band control of a detached sampling daemon:
    /// prepare, start, pause, resume, or stop.
    #[arg(long)]
    pub control: Option<String>,

    /// Stop once the data section reaches this size, e.g. 100M.
    #[arg(long = "data-limit")]
    pub data_limit: Option<String>,

    /// Also trace sched:sched_switch to attribute off-cpu time.
    #[arg(long)]
    pub offcpu: bool,

    /// Drop records caused by the profiler itself (system-wide only).
    #[arg(long = "exclude-self", requires = "system_wide")]
    pub exclude_self: bool,

    /// Replace repeated callstacks with table ids in the output.
    #[arg(long = "dedup_stack", conflicts_with = "system_wide")]
    pub dedup_stack: bool,

    /// Record raw stack snapshots and unwind after sampling ends.
    #[arg(long = "delay-unwind")]
    pub delay_unwind: bool,

    /// Record raw stack snapshots and never unwind them.
    #[arg(long = "disable-unwind")]
    pub disable_unwind: bool,

    /// Collect kernel frames via the in-kernel walker in dwarf mode.
    #[arg(long = "kernel-callchain")]
    pub kernel_callchain: bool,

    /// Drop kernel frames from callchains.
    #[arg(long = "callchain-useronly")]
    pub callchain_useronly: bool,

    /// Branch sampling filters: any, any_call, any_ret, ind_call,
    /// ind_jmp, cond, call, u, k.
    #[arg(short = 'j', long = "branch-filter", value_delimiter = ',')]
    pub branch_filter: Vec<String>,

    /// Sampling clock: realtime, boottime, monotonic, monotonic_raw,
    /// clock_tai.
    #[arg(long)]
    pub clockid: Option<String>,

    /// perf_cpu_time_max_percent to configure, 1..=100.
    #[arg(long = "cpu-limit")]
    pub cpu_limit: Option<u64>,

    /// Poll interval of the drain loop in milliseconds.
    #[arg(long)]
    pub chkms: Option<u32>,

    /// With --control prepare: re-arm an existing stopped daemon.
    #[arg(long)]
    pub restart: bool,

    /// gzip the output file.
    #[arg(short = 'z', long = "compress")]
    pub compress: bool,

    /// Extra directories to search for symbol files.
    #[arg(long = "symbol-dir")]
    pub symbol_dirs: Vec<PathBuf>,

    /// Profile the execution of this command.
    #[arg(allow_hyphen_values = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Trace file to summarize.
    #[arg(short = 'i', long, default_value = "perf.data")]
    pub input: PathBuf,

    /// Show at most this many symbols.
    #[arg(long, default_value = "50")]
    pub limit: usize,

    /// Extra directories to search for symbol files.
    #[arg(long = "symbol-dir")]
    pub symbol_dirs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct StatArgs {
    /// Events to count.
    #[arg(short = 'e', long = "event", value_delimiter = ',')]
    pub events: Vec<String>,

    /// Pids to count on.
    #[arg(short = 'p', long = "pid", value_delimiter = ',')]
    pub pids: Vec<i32>,

    /// Count on every process on all cpus.
    #[arg(short = 'a', long = "all", conflicts_with = "pids")]
    pub system_wide: bool,

    /// Seconds to count for.
    #[arg(short = 'd', long, default_value = "3")]
    pub duration: f64,

    /// Count the execution of this command.
    #[arg(allow_hyphen_values = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ListArgs {}

#[derive(Debug, Args)]
pub struct DumpArgs {
    /// Trace file to dump.
    #[arg(short = 'i', long, default_value = "perf.data")]
    pub input: PathBuf,

    /// Only print the header and feature sections.
    #[arg(long)]
    pub head_only: bool,
}

/// Parse "N", "NK", "NM", "NG" into bytes.
pub fn parse_data_limit(text: &str) -> Option<u64> {
    let text = text.trim();
    let (digits, factor) = match text.chars().last()? {
        'k' | 'K' => (&text[..text.len() - 1], 1u64 << 10),
        'm' | 'M' => (&text[..text.len() - 1], 1 << 20),
        'g' | 'G' => (&text[..text.len() - 1], 1 << 30),
        _ => (text, 1),
    };
    let value: u64 = digits.parse().ok()?;
    value.checked_mul(factor).filter(|&v| v > 0)
}

/// Parse "-s fp" / "-s dwarf[,size]".
pub fn parse_call_stack(
    text: &str,
) -> Option<crate::perf_event::SampleStackType> {
    use crate::perf_event::SampleStackType;
    match text {
        "fp" => Some(SampleStackType::Fp),
        "dwarf" => Some(SampleStackType::Dwarf(crate::record_cmd::DEFAULT_DWARF_STACK_SIZE)),
        _ => {
            let size = text.strip_prefix("dwarf,")?.parse().ok()?;
            Some(SampleStackType::Dwarf(size))
        }
    }
}

pub fn parse_branch_filter(names: &[String]) -> Option<u64> {
    use crate::perf_event::sys::*;
    let mut mask = 0;
    for name in names {
        mask |= match name.as_str() {
            "any" => PERF_SAMPLE_BRANCH_ANY,
            "any_call" => PERF_SAMPLE_BRANCH_ANY_CALL,
            "any_ret" => PERF_SAMPLE_BRANCH_ANY_RETURN,
            "ind_call" => PERF_SAMPLE_BRANCH_IND_CALL,
            "ind_jmp" => PERF_SAMPLE_BRANCH_IND_JUMP,
            "cond" => PERF_SAMPLE_BRANCH_COND,
            "call" => PERF_SAMPLE_BRANCH_CALL,
            "u" => PERF_SAMPLE_BRANCH_USER,
            "k" => PERF_SAMPLE_BRANCH_KERNEL,
            _ => return None,
        };
    }
    Some(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_limit_suffixes() {
        assert_eq!(parse_data_limit("100"), Some(100));
        assert_eq!(parse_data_limit("4K"), Some(4096));
        assert_eq!(parse_data_limit("10M"), Some(10 << 20));
        assert_eq!(parse_data_limit("2g"), Some(2 << 30));
        assert_eq!(parse_data_limit("0"), None);
        assert_eq!(parse_data_limit("x"), None);
    }

    #[test]
    fn call_stack_modes() {
        use crate::perf_event::SampleStackType;
        assert_eq!(parse_call_stack("fp"), Some(SampleStackType::Fp));
        assert_eq!(
            parse_call_stack("dwarf"),
            Some(SampleStackType::Dwarf(
                crate::record_cmd::DEFAULT_DWARF_STACK_SIZE
            ))
        );
        assert_eq!(
            parse_call_stack("dwarf,16384"),
            Some(SampleStackType::Dwarf(16384))
        );
        assert_eq!(parse_call_stack("lbr"), None);
    }

    #[test]
    fn branch_filters() {
        use crate::perf_event::sys::*;
        assert_eq!(
            parse_branch_filter(&["any_call".into(), "u".into()]),
            Some(PERF_SAMPLE_BRANCH_ANY_CALL | PERF_SAMPLE_BRANCH_USER)
        );
        assert_eq!(parse_branch_filter(&["bogus".into()]), None);
    }

    #[test]
    fn cli_parses_a_full_record_invocation() {
        use clap::Parser;
        let opt = Opt::parse_from([
            "perfrec", "record", "-f", "997", "-s", "dwarf,16384", "-d", "5", "-o",
            "/tmp/out.data", "--dedup_stack", "-p", "1,2,3", "--", "true",
        ]);
        match opt.action {
            Action::Record(args) => {
                assert_eq!(args.frequency, Some(997));
                assert_eq!(args.pids, vec![1, 2, 3]);
                assert!(args.dedup_stack);
                assert_eq!(args.command, vec!["true"]);
            }
            _ => panic!("expected record"),
        }
    }
}
