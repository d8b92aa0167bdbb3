// A minimal event queue for the few places where a peripheral needs to see
// the world one or more cycles later than the bus access that caused it.
// Events carry no closures; the bus dispatches on the Event enum when they
// come due, so the queue itself owns nothing but plain data.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    NdmaRequestCheck(usize),
    WifiChannelList,
}

struct Entry {
    deadline: u64,
    seq: u64,
    event: Event,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins,
        // with insertion order breaking ties.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

pub struct Scheduler {
    now: u64,
    seq: u64,
    queue: BinaryHeap<Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { now: 0, seq: 0, queue: BinaryHeap::new() }
    }

    pub fn reset(&mut self) {
        self.now = 0;
        self.seq = 0;
        self.queue.clear();
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn advance(&mut self, cycles: u64) {
        self.now += cycles;
    }

    pub fn add_event(&mut self, event: Event, delay: u64) {
        let entry = Entry { deadline: self.now + delay, seq: self.seq, event };
        self.seq += 1;
        self.queue.push(entry);
    }

    /// Pops the next event whose deadline has passed, if any.
    pub fn pop_due(&mut self) -> Option<Event> {
        if let Some(entry) = self.queue.peek() {
            if entry.deadline <= self.now {
                return self.queue.pop().map(|e| e.event);
            }
        }
        None
    }
}
