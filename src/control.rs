//! The named-pipe control channel between a detached sampling daemon
//! and later invocations delivering commands.
//!
//! Two fifos rendezvous the pair, one per direction. The protocol is a
//! single ASCII line per request and reply. Server states:
//! IDLE -> PREPARED -> RUNNING <-> PAUSED -> STOPPED.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::stat::Mode;

use crate::error::{RecordError, Result};

const FIFO_FILE_C2S: &str = ".perfrec_record_control_c2s";
const FIFO_FILE_S2C: &str = ".perfrec_record_control_s2c";

pub const REPLY_OK: &str = "OK\n";
pub const REPLY_FAIL: &str = "FAIL\n";
pub const REPLY_OK_CHECK: &str = "OK_CHECK\n";

pub const CMD_START: &str = "START\n";
pub const CMD_PAUSE: &str = "PAUSE\n";
pub const CMD_RESUME: &str = "RESUME\n";
pub const CMD_STOP: &str = "STOP\n";
pub const CMD_CHECK: &str = "CHECK\n";

pub const REPLY_TIMEOUT: Duration = Duration::from_millis(2000);
pub const CHECK_TIMEOUT: Duration = Duration::from_millis(1000);

/// The fifos live on the device-local tmp dir when it exists (the
/// device layout), otherwise under /tmp.
fn fifo_dir() -> PathBuf {
    let device_tmp = Path::new("/data/local/tmp");
    if device_tmp.is_dir() {
        device_tmp.to_owned()
    } else {
        PathBuf::from("/tmp")
    }
}

pub fn fifo_paths() -> (PathBuf, PathBuf) {
    let dir = fifo_dir();
    (dir.join(FIFO_FILE_C2S), dir.join(FIFO_FILE_S2C))
}

pub fn remove_fifos() {
    let (c2s, s2c) = fifo_paths();
    let _ = std::fs::remove_file(c2s);
    let _ = std::fs::remove_file(s2c);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Start,
    Pause,
    Resume,
    Stop,
    Check,
}

impl ControlRequest {
    pub fn parse(line: &str) -> Option<ControlRequest> {
        match line {
            CMD_START => Some(ControlRequest::Start),
            CMD_PAUSE => Some(ControlRequest::Pause),
            CMD_RESUME => Some(ControlRequest::Resume),
            CMD_STOP => Some(ControlRequest::Stop),
            CMD_CHECK => Some(ControlRequest::Check),
            _ => None,
        }
    }

    pub fn command(self) -> &'static str {
        match self {
            ControlRequest::Start => CMD_START,
            ControlRequest::Pause => CMD_PAUSE,
            ControlRequest::Resume => CMD_RESUME,
            ControlRequest::Stop => CMD_STOP,
            ControlRequest::Check => CMD_CHECK,
        }
    }
}

fn poll_readable(fd: i32, timeout: Duration) -> bool {
    let mut poll_fd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let result = unsafe { libc::poll(&mut poll_fd, 1, timeout.as_millis() as i32) };
    result > 0 && poll_fd.revents & libc::POLLIN != 0
}

/// Read one `\n`-terminated line from a non-blocking fd, waiting up to
/// `timeout` for the first byte.
fn read_line(file: &mut File, timeout: Duration) -> Option<String> {
    if !poll_readable(file.as_raw_fd(), timeout) {
        return None;
    }
    let mut line = String::new();
    let mut byte = [0u8; 1];
    loop {
        match file.read(&mut byte) {
            Ok(1) => {
                line.push(byte[0] as char);
                if byte[0] == b'\n' {
                    return Some(line);
                }
            }
            _ => return if line.is_empty() { None } else { Some(line) },
        }
    }
}

pub struct ControlServer {
    input: Option<File>,
    output: File,
    c2s_path: PathBuf,
}

impl ControlServer {
    /// Create both fifos; a pre-existing pair means another daemon owns
    /// them.
    pub fn create_fifos() -> Result<()> {
        let (c2s, s2c) = fifo_paths();
        let mode = Mode::from_bits_truncate(0o666);
        let make = |path: &Path| {
            nix::unistd::mkfifo(path, mode).map_err(|errno| {
                if errno == nix::errno::Errno::EEXIST {
                    RecordError::AlreadyRunning
                } else {
                    RecordError::ControlProtocol(format!(
                        "cannot create fifo {}: {errno}",
                        path.display()
                    ))
                }
            })
        };
        make(&c2s)?;
        if let Err(err) = make(&s2c) {
            if !matches!(err, RecordError::AlreadyRunning) {
                let _ = std::fs::remove_file(&c2s);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Server side of the rendezvous; blocks until the client opens its
    /// reading end.
    pub fn connect() -> Result<ControlServer> {
        let (c2s, s2c) = fifo_paths();
        let output = OpenOptions::new().write(true).open(&s2c).map_err(|e| {
            RecordError::ControlProtocol(format!("cannot open reply fifo: {e}"))
        })?;
        Ok(ControlServer {
            input: None,
            output,
            c2s_path: c2s,
        })
    }

    pub fn respond(&mut self, ok: bool) {
        let reply = if ok { REPLY_OK } else { REPLY_FAIL };
        self.respond_with(reply);
    }

    fn respond_with(&mut self, reply: &str) {
        if let Err(err) = self.output.write_all(reply.as_bytes()) {
            log::warn!("cannot write control reply: {err}");
        }
    }

    /// Serve requests until a STOP is handled or `keep_running` turns
    /// false (sampling ended some other way, e.g. a deadline). The
    /// handler returns whether the request succeeded; for CHECK it
    /// reports liveness. Runs on its own thread; no blocking I/O
    /// besides the poll.
    pub fn serve(
        mut self,
        mut handler: impl FnMut(ControlRequest) -> bool,
        keep_running: impl Fn() -> bool,
    ) {
        let mut need_reopen = true;
        loop {
            if !keep_running() {
                break;
            }
            if need_reopen {
                // A completed read leaves the fifo at EOF; reopening
                // arms the poll for the next client.
                self.input = OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&self.c2s_path)
                    .ok();
            }
            let Some(input) = self.input.as_mut() else {
                break;
            };
            let Some(line) = read_line(input, REPLY_TIMEOUT) else {
                need_reopen = false;
                continue;
            };
            need_reopen = true;

            match ControlRequest::parse(&line) {
                Some(ControlRequest::Check) => {
                    let alive = handler(ControlRequest::Check);
                    self.respond_with(if alive { REPLY_OK_CHECK } else { REPLY_FAIL });
                }
                Some(request) => {
                    let ok = handler(request);
                    self.respond(ok);
                    if request == ControlRequest::Stop && ok {
                        break;
                    }
                }
                None => {
                    log::warn!("malformed control command {line:?}");
                    self.respond(false);
                }
            }
        }
    }
}

pub struct ControlClient;

impl ControlClient {
    /// Deliver one command to a running daemon and wait for its reply.
    pub fn send(request: ControlRequest, timeout: Duration) -> Result<bool> {
        let (c2s, s2c) = fifo_paths();

        // Open the reply side first; the server may answer before we
        // would otherwise get around to reading.
        let mut reply_pipe = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&s2c)
            .map_err(|e| {
                RecordError::ControlProtocol(format!("no sampling service found: {e}"))
            })?;
        let mut command_pipe = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&c2s)
            .map_err(|e| {
                RecordError::ControlProtocol(format!("no sampling service found: {e}"))
            })?;
        command_pipe
            .write_all(request.command().as_bytes())
            .map_err(|e| RecordError::ControlProtocol(format!("cannot send command: {e}")))?;
        drop(command_pipe);

        let reply = read_line(&mut reply_pipe, timeout);
        Ok(matches!(reply.as_deref(), Some(REPLY_OK) | Some(REPLY_OK_CHECK)))
    }

    /// Wait for the forked daemon's prepare acknowledgement.
    pub fn wait_prepared(timeout: Duration) -> Result<bool> {
        let (_, s2c) = fifo_paths();
        let mut reply_pipe = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&s2c)
            .map_err(|e| RecordError::ControlProtocol(format!("cannot open fifo: {e}")))?;
        Ok(read_line(&mut reply_pipe, timeout).as_deref() == Some(REPLY_OK))
    }

    /// Stop the daemon: send STOP, then poll CHECK until it is gone,
    /// then clean the fifos up.
    pub fn stop() -> Result<bool> {
        let ok = Self::send(ControlRequest::Stop, REPLY_TIMEOUT)?;
        if ok {
            std::thread::sleep(Duration::from_millis(200));
            while let Ok(true) = Self::send(ControlRequest::Check, CHECK_TIMEOUT) {
                std::thread::sleep(Duration::from_millis(200));
            }
        }
        remove_fifos();
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parsing() {
        assert_eq!(ControlRequest::parse("START\n"), Some(ControlRequest::Start));
        assert_eq!(ControlRequest::parse("PAUSE\n"), Some(ControlRequest::Pause));
        assert_eq!(
            ControlRequest::parse("RESUME\n"),
            Some(ControlRequest::Resume)
        );
        assert_eq!(ControlRequest::parse("STOP\n"), Some(ControlRequest::Stop));
        assert_eq!(ControlRequest::parse("CHECK\n"), Some(ControlRequest::Check));
        assert_eq!(ControlRequest::parse("NOPE\n"), None);
        assert_eq!(ControlRequest::parse("START"), None);
    }

    #[test]
    fn round_trip_via_command_strings() {
        for request in [
            ControlRequest::Start,
            ControlRequest::Pause,
            ControlRequest::Resume,
            ControlRequest::Stop,
            ControlRequest::Check,
        ] {
            assert_eq!(ControlRequest::parse(request.command()), Some(request));
        }
    }
}
