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

use protocol::Reading;
use sbuffer::{Read, ReaderId, SharedBuffer};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::PacingConfig;
use crate::shutdown::Shutdown;
use crate::storage::ReadingStore;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Wait on the buffer for the next reading.
    Blocking,
    /// Read up to the batch ceiling, then sleep.
    Batch,
}

/// How a drain cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    /// Stopped at the ceiling while the buffer still had data.
    Ceiling,
    /// The last reading taken was the newest one.
    Drained,
    /// Nothing to read, or the blocking wait timed out.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    pub reads: usize,
    pub end: CycleEnd,
}

/// Self-tuning batch size and sleep length for the persistence consumer.
#[derive(Debug, Clone)]
pub struct Pacer {
    config: PacingConfig,
    ceiling: usize,
    sleep: Duration,
    mode: Mode,
}

impl Pacer {
    pub fn new(config: &PacingConfig) -> Self {
        let ceiling = config
            .initial_batch
            .clamp(config.min_batch, config.max_batch.max(config.min_batch));
        let sleep_ms = config
            .initial_sleep_ms
            .clamp(config.min_sleep_ms, config.max_sleep_ms.max(config.min_sleep_ms));
        Pacer {
            config: config.clone(),
            ceiling,
            sleep: Duration::from_millis(sleep_ms),
            mode: Mode::Blocking,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn sleep(&self) -> Duration {
        self.sleep
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Adjusts batch ceiling, sleep length and mode from the outcome of the
    /// cycle just run.
    pub fn finish_cycle(&mut self, cycle: Cycle) {
        let step = Duration::from_millis(self.config.sleep_step_ms);
        let min_sleep = Duration::from_millis(self.config.min_sleep_ms);
        let max_sleep = Duration::from_millis(self.config.max_sleep_ms);

        match cycle.end {
            CycleEnd::Ceiling => {
                self.ceiling = (self.ceiling + 1).min(self.config.max_batch);
                self.sleep = self.sleep.saturating_sub(step).max(min_sleep);
                debug!(ceiling = self.ceiling, sleep = ?self.sleep, "speeding up storage");
            }
            CycleEnd::Drained if cycle.reads + self.config.slowdown_margin < self.ceiling => {
                self.ceiling = self.ceiling.saturating_sub(1).max(self.config.min_batch);
                self.sleep = (self.sleep + step).min(max_sleep);
                debug!(ceiling = self.ceiling, sleep = ?self.sleep, "slowing down storage");
            }
            CycleEnd::Drained | CycleEnd::Empty => {}
        }

        self.mode = if cycle.reads == 0 {
            Mode::Blocking
        } else {
            Mode::Batch
        };
    }
}

/// Runs one cycle: a single blocking read, or up to `ceiling` non-blocking
/// reads. Every reading taken is handed to the store; a failed insert is
/// logged and the reading is dropped.
pub fn drain_cycle<S: ReadingStore>(
    buffer: &SharedBuffer<Reading>,
    store: &mut S,
    mode: Mode,
    ceiling: usize,
) -> Cycle {
    let mut reads = 0;
    loop {
        let (reading, more) = match buffer.read(ReaderId::Persistence, mode == Mode::Blocking) {
            Read::Item { value, more } => (value, more),
            Read::Empty | Read::TimedOut => {
                return Cycle {
                    reads,
                    end: CycleEnd::Empty,
                }
            }
        };
        reads += 1;
        if let Err(e) = store.insert(&reading) {
            warn!(sensor_id = reading.sensor_id, error = %e, "storage lost connection to database");
        }

        if !more {
            return Cycle {
                reads,
                end: CycleEnd::Drained,
            };
        }
        if mode == Mode::Blocking || reads >= ceiling {
            return Cycle {
                reads,
                end: CycleEnd::Ceiling,
            };
        }
    }
}

/// Persistence consumer loop. After a stop is observed it runs one more
/// unbounded drain so nothing already buffered is lost, then closes the store.
pub fn run_persistence<S: ReadingStore>(
    buffer: &SharedBuffer<Reading>,
    mut store: S,
    pacer: &mut Pacer,
    shutdown: &Shutdown,
) -> Result<()> {
    loop {
        let cycle = drain_cycle(buffer, &mut store, pacer.mode(), pacer.ceiling());
        pacer.finish_cycle(cycle);

        if !shutdown.is_running() {
            let last = drain_cycle(buffer, &mut store, Mode::Batch, usize::MAX);
            info!(final_reads = last.reads, "exiting storage manager");
            break;
        }
        if pacer.mode() == Mode::Batch {
            shutdown.sleep(pacer.sleep());
        }
    }
    store.close()
}
