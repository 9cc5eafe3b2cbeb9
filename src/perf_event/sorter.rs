//! Time-ordering of records drained from multiple ring buffers.
//!
//! Each ring buffer is internally FIFO and timestamps within it are
//! non-decreasing, but a bulk drain across buffers interleaves the
//! streams arbitrarily. The sorter buffers records in a min-heap on
//! timestamp and only releases an entry once every other buffer has been
//! drained at least once after it was pushed: at that point nothing
//! earlier can still arrive. Reads must visit buffers round-robin in
//! ascending index order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::record::PerfRecord;

struct HeapItem {
    buffer_index: usize,
    round: usize,
    time: u64,
    record: PerfRecord,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
    }
}

impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.cmp(&other.time)
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct RecordSorter {
    heap: BinaryHeap<Reverse<HeapItem>>,
    round: usize,
    current_buffer: Option<usize>,
    /// Last timestamp seen per buffer, used for records that carry none.
    last_time: Vec<u64>,
}

impl RecordSorter {
    pub fn new() -> Self {
        RecordSorter {
            heap: BinaryHeap::new(),
            round: 0,
            current_buffer: None,
            last_time: Vec::new(),
        }
    }

    pub fn has_more(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Called when the drain wraps back to the first buffer.
    pub fn advance_round(&mut self) {
        self.round += 1;
        self.current_buffer = None;
    }

    /// Begin pushing records drained from `buffer_index`. Within a round,
    /// indices must be visited in ascending order.
    pub fn begin_buffer(&mut self, buffer_index: usize) {
        debug_assert!(Some(buffer_index) >= self.current_buffer);
        self.current_buffer = Some(buffer_index);
        if self.last_time.len() <= buffer_index {
            self.last_time.resize(buffer_index + 1, 0);
        }
    }

    pub fn push(&mut self, record: PerfRecord) {
        let buffer_index = self
            .current_buffer
            .expect("begin_buffer must be called before push");
        let time = match record.time() {
            Some(t) => {
                self.last_time[buffer_index] = t;
                t
            }
            // Timestamp-less records sort right after their predecessor
            // in the same buffer.
            None => self.last_time[buffer_index],
        };
        self.heap.push(Reverse(HeapItem {
            buffer_index,
            round: self.round,
            time,
            record,
        }));
    }

    /// Pop the next record whose ordering is final.
    pub fn pop(&mut self) -> Option<PerfRecord> {
        {
            let Reverse(item) = self.heap.peek()?;
            let released = (item.round + 1, Some(&item.buffer_index))
                <= (self.round, self.current_buffer.as_ref());
            if !released {
                return None;
            }
        }
        self.heap.pop().map(|Reverse(item)| item.record)
    }

    /// Drain everything regardless of rounds, in timestamp order. Used at
    /// shutdown after the final drain pass.
    pub fn flush(&mut self) -> Vec<PerfRecord> {
        let mut items: Vec<_> = std::mem::take(&mut self.heap).into_vec();
        items.sort_by_key(|Reverse(item)| item.time);
        items.into_iter().map(|Reverse(item)| item.record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{SampleRecord, SwitchRecord};

    fn sample(time: u64) -> PerfRecord {
        PerfRecord::Sample(SampleRecord {
            time,
            ..Default::default()
        })
    }

    #[test]
    fn releases_in_time_order_across_buffers() {
        let mut sorter = RecordSorter::new();

        sorter.begin_buffer(0);
        sorter.push(sample(10));
        sorter.push(sample(30));
        sorter.begin_buffer(1);
        sorter.push(sample(20));

        // Nothing from round 0 is final until round 1 revisits buffer 0.
        assert!(sorter.pop().is_none());

        sorter.advance_round();
        sorter.begin_buffer(0);
        assert_eq!(sorter.pop().unwrap().time(), Some(10));
        assert!(sorter.pop().is_none());
        sorter.begin_buffer(1);
        assert_eq!(sorter.pop().unwrap().time(), Some(20));
        assert_eq!(sorter.pop().unwrap().time(), Some(30));
        assert!(sorter.pop().is_none());
    }

    #[test]
    fn timestampless_records_follow_their_buffer_predecessor() {
        let mut sorter = RecordSorter::new();
        sorter.begin_buffer(0);
        sorter.push(sample(100));
        sorter.push(PerfRecord::Switch(SwitchRecord {
            misc: 0,
            sample_id: None,
        }));
        let records = sorter.flush();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].time(), Some(100));
        assert!(matches!(records[1], PerfRecord::Switch(_)));
    }

    #[test]
    fn flush_orders_by_time() {
        let mut sorter = RecordSorter::new();
        sorter.begin_buffer(0);
        sorter.push(sample(5));
        sorter.begin_buffer(1);
        sorter.push(sample(3));
        sorter.begin_buffer(2);
        sorter.push(sample(4));
        let times: Vec<_> = sorter.flush().iter().map(|r| r.time().unwrap()).collect();
        assert_eq!(times, vec![3, 4, 5]);
    }
}
