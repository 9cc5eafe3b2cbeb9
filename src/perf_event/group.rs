//! The set of open event descriptors and the bulk drain across them.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;

use super::ring_buffer::EventFd;
use super::sorter::RecordSorter;
use crate::record::{PerfRecord, RawData, SampleFormat};

struct Member {
    event: EventFd,
    closed: bool,
}

/// All descriptors of a session, keyed by fd so iteration order is
/// stable for the sorter's round-robin rule.
pub struct EventGroups {
    members: BTreeMap<RawFd, Member>,
    poll_fds: Vec<libc::pollfd>,
    sorter: RecordSorter,
    /// Records dropped because the ring contained a torn header or a
    /// payload that failed to parse.
    pub read_errors: u64,
}

impl EventGroups {
    pub fn new() -> Self {
        EventGroups {
            members: BTreeMap::new(),
            poll_fds: Vec::new(),
            sorter: RecordSorter::new(),
            read_errors: 0,
        }
    }

    pub fn add(&mut self, event: EventFd) {
        self.members.insert(
            event.fd(),
            Member {
                event,
                closed: false,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn descriptor_count(&self) -> usize {
        self.members.len()
    }

    pub fn enable_all(&self) -> io::Result<()> {
        for member in self.members.values() {
            member.event.enable()?;
        }
        Ok(())
    }

    pub fn disable_all(&self) -> io::Result<()> {
        for member in self.members.values() {
            member.event.disable()?;
        }
        Ok(())
    }

    pub fn any_events_pending(&self) -> bool {
        self.members
            .values()
            .any(|member| member.event.are_events_pending())
    }

    /// Block until data is available on some ring, a descriptor is
    /// closed, or `timeout_ms` passes. Descriptors whose processes have
    /// exited report POLLHUP and are flagged for removal once drained.
    pub fn wait(&mut self, timeout_ms: i32) {
        // Records already buffered in the sorter are waiting on the next
        // drain round; do not sit in poll while they age.
        if self.sorter.has_more() || self.any_events_pending() {
            return;
        }

        self.poll_fds.clear();
        self.poll_fds.extend(
            self.members
                .values()
                .filter(|member| member.event.has_ring())
                .map(|member| libc::pollfd {
                    fd: member.event.fd(),
                    events: libc::POLLIN | libc::POLLHUP,
                    revents: 0,
                }),
        );
        if self.poll_fds.is_empty() {
            return;
        }

        let result = unsafe {
            libc::poll(
                self.poll_fds.as_mut_ptr(),
                self.poll_fds.len() as _,
                timeout_ms,
            )
        };
        if result == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                log::error!("poll failed: {err}");
            }
            return;
        }

        for poll_fd in &self.poll_fds {
            if poll_fd.revents & libc::POLLHUP != 0 {
                if let Some(member) = self.members.get_mut(&poll_fd.fd) {
                    member.closed = true;
                }
            }
        }
    }

    /// Drain every ring once and deliver all records whose cross-buffer
    /// ordering is final. `formats` is indexed by the attr index the
    /// descriptor was opened with.
    pub fn consume(&mut self, formats: &[SampleFormat], mut deliver: impl FnMut(PerfRecord)) {
        let mut dead_fds = Vec::new();
        for (fd, member) in self.members.iter_mut() {
            self.sorter.begin_buffer(*fd as usize);
            let format = formats[member.event.attr_index];
            let sorter = &mut self.sorter;
            let mut parse_failures = 0u64;
            self.read_errors += member.event.drain(|kind, misc, data: RawData| {
                match PerfRecord::parse(&format, kind, misc, data) {
                    Ok(record) => sorter.push(record),
                    Err(err) => {
                        log::warn!("cannot parse record type {kind}: {err}");
                        parse_failures += 1;
                    }
                }
            });
            self.read_errors += parse_failures;

            if member.closed && !member.event.are_events_pending() {
                dead_fds.push(*fd);
            }
        }
        self.sorter.advance_round();

        for fd in dead_fds {
            self.members.remove(&fd);
        }

        while let Some(record) = self.sorter.pop() {
            deliver(record);
        }
    }

    /// Final drain at stop time: everything left in the rings and the
    /// sorter is delivered.
    pub fn finish(&mut self, formats: &[SampleFormat], mut deliver: impl FnMut(PerfRecord)) {
        self.consume(formats, &mut deliver);
        for record in self.sorter.flush() {
            deliver(record);
        }
    }
}
