// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The shared buffer and its two-reader bookkeeping.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::sync::{recover, AtomicBool, Condvar, Mutex, MutexGuard, Ordering, RwLock};
use crate::SBufferError;

const READERS: usize = 2;

/// The two consumers draining the buffer. The set is fixed: every node carries
/// exactly one seen flag per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderId {
    Analytics = 0,
    Persistence = 1,
}

impl ReaderId {
    pub const ALL: [ReaderId; READERS] = [ReaderId::Analytics, ReaderId::Persistence];

    #[inline(always)]
    const fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ReaderId::Analytics => "analytics",
            ReaderId::Persistence => "persistence",
        }
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of [`SharedBuffer::read`].
#[derive(Debug, Clone, PartialEq)]
pub enum Read<T> {
    /// The oldest value this reader had not seen yet. `more` is true when
    /// another unseen value follows it.
    Item { value: T, more: bool },
    /// Nothing unseen for this reader.
    Empty,
    /// A blocking read gave up after the wait timeout.
    TimedOut,
}

impl<T> Read<T> {
    pub fn into_item(self) -> Option<T> {
        match self {
            Read::Item { value, .. } => Some(value),
            Read::Empty | Read::TimedOut => None,
        }
    }

    pub fn has_more(&self) -> bool {
        matches!(self, Read::Item { more: true, .. })
    }
}

struct Node<T> {
    value: T,
    seen: [AtomicBool; READERS],
}

impl<T> Node<T> {
    fn new(value: T) -> Self {
        Node {
            value,
            seen: [AtomicBool::new(false), AtomicBool::new(false)],
        }
    }

    #[inline(always)]
    fn seen(&self, reader: ReaderId) -> bool {
        self.seen[reader.index()].load(Ordering::Acquire)
    }

    #[inline(always)]
    fn mark(&self, reader: ReaderId) {
        self.seen[reader.index()].store(true, Ordering::Release);
    }

    fn consumed(&self) -> bool {
        ReaderId::ALL.iter().all(|reader| self.seen(*reader))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Idle,
    Inserted,
    Interrupted,
}

struct Slot {
    signal: Mutex<Signal>,
    wake: Condvar,
}

impl Slot {
    fn new() -> Self {
        Slot {
            signal: Mutex::new(Signal::Idle),
            wake: Condvar::new(),
        }
    }
}

/// Insertion-ordered buffer written by one producer and drained independently
/// by the two [`ReaderId`]s.
///
/// Each reader has its own lock and wake condition, so the readers never wait on
/// each other. The node sequence is only restructured (append, sweep) while both
/// reader locks are held, always taken in [`ReaderId::ALL`] order.
pub struct SharedBuffer<T> {
    nodes: RwLock<VecDeque<Node<T>>>,
    slots: [Slot; READERS],
    wait_timeout: Duration,
}

impl<T> SharedBuffer<T> {
    /// `wait_timeout` bounds how long a blocking [`read`](Self::read) waits.
    pub fn new(wait_timeout: Duration) -> Self {
        SharedBuffer {
            nodes: RwLock::new(VecDeque::new()),
            slots: [Slot::new(), Slot::new()],
            wait_timeout,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    fn lock_slot(&self, reader: ReaderId) -> MutexGuard<'_, Signal> {
        recover(self.slots[reader.index()].signal.lock())
    }

    /// Appends `value` at the tail, releases every node both readers have seen
    /// and wakes both readers.
    pub fn insert(&self, value: T) -> Result<(), SBufferError> {
        let mut analytics = self.lock_slot(ReaderId::Analytics);
        let mut persistence = self.lock_slot(ReaderId::Persistence);

        let removed = {
            let mut nodes = recover(self.nodes.write());
            nodes.try_reserve(1)?;
            nodes.push_back(Node::new(value));
            sweep(&mut nodes)
        };
        if removed > 0 {
            trace!(removed, "released consumed nodes on insert");
        }

        *analytics = Signal::Inserted;
        *persistence = Signal::Inserted;
        for slot in &self.slots {
            slot.wake.notify_all();
        }
        Ok(())
    }

    /// Releases every node both readers have seen. Meant for idle periods when
    /// no insert comes along to do it.
    pub fn remove_consumed(&self) -> usize {
        let _analytics = self.lock_slot(ReaderId::Analytics);
        let _persistence = self.lock_slot(ReaderId::Persistence);

        let removed = {
            let mut nodes = recover(self.nodes.write());
            sweep(&mut nodes)
        };
        if removed > 0 {
            trace!(removed, "released consumed nodes on sweep");
        }
        removed
    }

    /// Wakes blocked readers without publishing data. A woken reader rescans
    /// once and returns to its caller, which can then re-check its stop state.
    pub fn interrupt(&self) {
        for slot in &self.slots {
            let mut signal = recover(slot.signal.lock());
            if *signal == Signal::Idle {
                *signal = Signal::Interrupted;
            }
            slot.wake.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        recover(self.nodes.read()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of values `reader` has not seen yet.
    pub fn unread(&self, reader: ReaderId) -> usize {
        let nodes = recover(self.nodes.read());
        nodes.len() - first_unseen(&nodes, reader)
    }

    /// Drops every remaining node, seen or not, and returns how many had not
    /// been seen by both readers. Taking `self` means no reader can still be
    /// holding the buffer.
    pub fn destroy(self) -> usize {
        let mut nodes = recover(self.nodes.write());
        let pending = nodes.iter().filter(|node| !node.consumed()).count();
        nodes.clear();
        pending
    }
}

impl<T: Clone> SharedBuffer<T> {
    /// Copies out the oldest value `reader` has not seen and marks it seen.
    ///
    /// A blocking read that finds nothing waits on this reader's own condition
    /// for at most the wait timeout, then scans once more.
    pub fn read(&self, reader: ReaderId, blocking: bool) -> Read<T> {
        let slot = &self.slots[reader.index()];
        let mut signal = self.lock_slot(reader);
        if *signal == Signal::Inserted {
            *signal = Signal::Idle;
        }

        if let Some(read) = self.take_next(reader) {
            return read;
        }
        if !blocking {
            return Read::Empty;
        }

        let deadline = Instant::now() + self.wait_timeout;
        while *signal == Signal::Idle {
            let now = Instant::now();
            if now >= deadline {
                trace!(%reader, "blocking read timed out");
                return Read::TimedOut;
            }
            let (guard, _) = recover(slot.wake.wait_timeout(signal, deadline - now));
            signal = guard;
        }
        *signal = Signal::Idle;

        self.take_next(reader).unwrap_or(Read::Empty)
    }

    fn take_next(&self, reader: ReaderId) -> Option<Read<T>> {
        let nodes = recover(self.nodes.read());
        let next = first_unseen(&nodes, reader);
        let node = nodes.get(next)?;
        node.mark(reader);
        Some(Read::Item {
            value: node.value.clone(),
            more: next + 1 < nodes.len(),
        })
    }
}

impl<T> fmt::Debug for SharedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

// A reader marks nodes strictly in insertion order and sweeps only drop nodes
// seen by everyone, so the nodes seen by one reader are always a prefix.
fn first_unseen<T>(nodes: &VecDeque<Node<T>>, reader: ReaderId) -> usize {
    nodes.partition_point(|node| node.seen(reader))
}

// By the same prefix rule, fully consumed nodes sit at the front.
fn sweep<T>(nodes: &mut VecDeque<Node<T>>) -> usize {
    let mut removed = 0;
    while nodes.front().is_some_and(Node::consumed) {
        nodes.pop_front();
        removed += 1;
    }
    removed
}
