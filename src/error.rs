/// Errors that can stop a recording session.
///
/// Configuration problems surface before any descriptor is opened. Most
/// runtime problems (lost records, unresolvable symbols, failed unwind
/// steps) are not errors at all and merely degrade the output; the kinds
/// collected here are the ones that abort the current operation.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("event \"{0}\" is not supported by this kernel")]
    EventNotSupported(String),

    #[error("conflicting target selection: {0}")]
    InvalidTargets(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error(
        "perf_event_open failed for event \"{event}\" (pid {pid}, cpu {cpu}): {source}"
    )]
    OpenFailed {
        event: String,
        pid: i32,
        cpu: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("no perf event descriptor could be opened")]
    NoTrackableTargets,

    #[error("output file error: {0}")]
    Write(#[from] std::io::Error),

    #[error("trace file is malformed: {0}")]
    BadTraceFile(String),

    #[error("another sampling service is already running")]
    AlreadyRunning,

    #[error("control channel: {0}")]
    ControlProtocol(String),

    #[error("workload failed to launch: {0}")]
    Workload(String),
}

pub type Result<T> = std::result::Result<T, RecordError>;
