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

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A component hit a condition it cannot recover from.
    Fatal(String),
    /// The multiplexer saw no devices for too long.
    Idle,
    /// Requested from outside, e.g. ctrl+c.
    External,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Fatal(cause) => write!(f, "fatal: {}", cause),
            StopReason::Idle => f.write_str("no active connections"),
            StopReason::External => f.write_str("external request"),
        }
    }
}

type Waker = Box<dyn Fn() + Send + Sync>;

struct Status {
    state: State,
    reason: Option<StopReason>,
}

struct Inner {
    status: Mutex<Status>,
    changed: Condvar,
    wakers: Mutex<Vec<Waker>>,
}

/// Process-wide stop state shared by every component.
///
/// Any holder may request a stop; the first request wins and later ones are
/// no-ops. Components poll [`is_running`](Self::is_running) once per loop
/// iteration and release what they own before returning.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            inner: Arc::new(Inner {
                status: Mutex::new(Status {
                    state: State::Running,
                    reason: None,
                }),
                changed: Condvar::new(),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Moves from running to stopping. Returns false if a stop was already
    /// requested, in which case nothing changes.
    pub fn request(&self, reason: StopReason) -> bool {
        {
            let mut status = self.inner.status.lock();
            if status.state != State::Running {
                drop(status);
                debug!(%reason, "stop already requested");
                return false;
            }
            status.state = State::Stopping;
            status.reason = Some(reason.clone());
        }
        info!(%reason, "stopping gateway");

        self.inner.changed.notify_all();
        for waker in self.inner.wakers.lock().iter() {
            waker();
        }
        true
    }

    /// Registers a callback run once when a stop is requested, used to kick
    /// components out of their bounded waits early.
    pub fn register_waker<F>(&self, waker: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.wakers.lock().push(Box::new(waker));
    }

    pub fn is_running(&self) -> bool {
        self.inner.status.lock().state == State::Running
    }

    pub fn state(&self) -> State {
        self.inner.status.lock().state
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.inner.status.lock().reason.clone()
    }

    /// Sleeps for `duration` unless a stop is requested first. Returns true when
    /// the gateway is no longer running.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut status = self.inner.status.lock();
        while status.state == State::Running {
            if self
                .inner
                .changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }
        status.state != State::Running
    }

    /// Called by the owner once every component loop has returned.
    pub fn mark_stopped(&self) {
        let mut status = self.inner.status.lock();
        status.state = State::Stopped;
        if status.reason.is_none() {
            status.reason = Some(StopReason::External);
        }
        drop(status);
        self.inner.changed.notify_all();
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.inner.status.lock();
        f.debug_struct("Shutdown")
            .field("state", &status.state)
            .field("reason", &status.reason)
            .finish()
    }
}
