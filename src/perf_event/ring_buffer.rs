//! A single perf event descriptor and its memory-mapped ring buffer.
//!
//! The first page of the mapping is the control page; `data_head` is
//! written by the kernel and read with Acquire ordering, `data_tail` is
//! written back by us with Release ordering once a record has been
//! consumed. The data region holds `2^k` pages and records wrap around
//! its end.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, Ordering};

use libc::{self, c_void, pid_t};

use super::sys::*;
use crate::record::RawData;

const PAGE_SIZE: usize = 4096;

unsafe fn read_head(pointer: *const u8) -> u64 {
    let page = &*(pointer as *const PerfEventMmapPage);
    let head = ptr::read_volatile(&page.data_head);
    fence(Ordering::Acquire);
    head
}

unsafe fn read_tail(pointer: *const u8) -> u64 {
    // No fence required, the tail is only written by us.
    let page = &*(pointer as *const PerfEventMmapPage);
    ptr::read_volatile(&page.data_tail)
}

unsafe fn write_tail(pointer: *mut u8, value: u64) {
    let page = &mut *(pointer as *mut PerfEventMmapPage);
    fence(Ordering::AcqRel);
    ptr::write_volatile(&mut page.data_tail, value);
}

pub struct EventFd {
    fd: RawFd,
    /// Which attr this descriptor was opened with.
    pub attr_index: usize,
    pub cpu: i32,
    pub pid: i32,
    buffer: *mut u8,
    size: u64,
}

unsafe impl Send for EventFd {}

impl Drop for EventFd {
    fn drop(&mut self) {
        if !self.buffer.is_null() {
            unsafe {
                libc::munmap(self.buffer as *mut c_void, (self.size as usize) + PAGE_SIZE);
            }
        }
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl EventFd {
    pub fn open(
        attr: &PerfEventAttr,
        pid: pid_t,
        cpu: i32,
        group_fd: RawFd,
        attr_index: usize,
    ) -> io::Result<EventFd> {
        let fd = sys_perf_event_open(attr, pid, cpu, group_fd, PERF_FLAG_FD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(-fd));
        }
        Ok(EventFd {
            fd,
            attr_index,
            cpu,
            pid,
            buffer: ptr::null_mut(),
            size: 0,
        })
    }

    /// Map `1 + pages` pages; `pages` must be a power of two.
    pub fn mmap_ring(&mut self, pages: u32) -> io::Result<()> {
        debug_assert!(pages.is_power_of_two());
        let full_size = PAGE_SIZE * (pages as usize + 1);
        let buffer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                full_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };
        if buffer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        self.buffer = buffer as *mut u8;
        self.size = (PAGE_SIZE * pages as usize) as u64;
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn has_ring(&self) -> bool {
        !self.buffer.is_null()
    }

    fn ioctl(&self, request: libc::c_ulong) -> io::Result<()> {
        let result = unsafe { libc::ioctl(self.fd, request as _, 0) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn enable(&self) -> io::Result<()> {
        self.ioctl(PERF_EVENT_IOC_ENABLE)
    }

    pub fn disable(&self) -> io::Result<()> {
        self.ioctl(PERF_EVENT_IOC_DISABLE)
    }

    pub fn reset(&self) -> io::Result<()> {
        self.ioctl(PERF_EVENT_IOC_RESET)
    }

    /// Route this descriptor's records into another descriptor's ring
    /// buffer, used for non-leader group members.
    pub fn redirect_output(&self, leader_fd: RawFd) -> io::Result<()> {
        let result =
            unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_SET_OUTPUT as _, leader_fd) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Read the counter value, for counting (non-sampling) descriptors.
    pub fn read_count(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, 8) };
        if n != 8 {
            return Err(io::Error::last_os_error());
        }
        Ok(u64::from_ne_bytes(buf))
    }

    /// The kernel-assigned event id, the same value samples carry in
    /// their `id` field.
    pub fn event_id(&self) -> io::Result<u64> {
        let mut id: u64 = 0;
        let result = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_ID as _, &mut id) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(id)
    }

    #[inline]
    pub fn are_events_pending(&self) -> bool {
        if self.buffer.is_null() {
            return false;
        }
        let head = unsafe { read_head(self.buffer) };
        let tail = unsafe { read_tail(self.buffer) };
        head != tail
    }

    /// Drain every complete record currently in the buffer, advancing the
    /// tail after each callback so the kernel regains the space promptly.
    ///
    /// The callback receives the record type, misc flags, and the payload
    /// bytes after the header (possibly split across the ring wrap).
    /// Returns the number of records dropped due to torn headers.
    pub fn drain(&mut self, mut consume: impl FnMut(u32, u16, RawData)) -> u64 {
        if self.buffer.is_null() {
            return 0;
        }
        let mut dropped = 0;
        let size = self.size;
        let data = unsafe { slice::from_raw_parts(self.buffer.add(PAGE_SIZE), size as usize) };

        let head = unsafe { read_head(self.buffer) };
        let mut tail = unsafe { read_tail(self.buffer) };
        while tail < head {
            let offset = (tail % size) as usize;
            let header_end = offset + PERF_EVENT_HEADER_SIZE;
            // The kernel never splits the header across the wrap; records
            // are 8-byte aligned and the buffer size is a multiple of 8.
            let kind = u32::from_ne_bytes(data[offset..offset + 4].try_into().unwrap());
            let misc = u16::from_ne_bytes(data[offset + 4..offset + 6].try_into().unwrap());
            let record_size =
                u16::from_ne_bytes(data[offset + 6..offset + 8].try_into().unwrap()) as usize;
            if record_size < PERF_EVENT_HEADER_SIZE || tail + record_size as u64 > head {
                // Corrupt or torn record; drop everything up to head.
                log::warn!(
                    "bad record header (type {kind} size {record_size}) in ring buffer, skipping"
                );
                dropped += 1;
                tail = head;
                break;
            }

            let payload_len = record_size - PERF_EVENT_HEADER_SIZE;
            let payload_end = header_end + payload_len;
            let payload = if payload_end <= size as usize {
                RawData::Single(&data[header_end..payload_end])
            } else if header_end >= size as usize {
                let start = header_end - size as usize;
                RawData::Single(&data[start..start + payload_len])
            } else {
                RawData::Split(
                    &data[header_end..],
                    &data[..payload_end - size as usize],
                )
            };

            consume(kind, misc, payload);

            tail += record_size as u64;
            unsafe { write_tail(self.buffer, tail) };
        }
        if tail > unsafe { read_tail(self.buffer) } {
            unsafe { write_tail(self.buffer, tail) };
        }
        dropped
    }
}
