use protocol::{Reading, SensorId, SensorValue, Timestamp};
use sbuffer::{Read, ReaderId, SharedBuffer};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::AnalyticsConfig;
use crate::shutdown::Shutdown;
use crate::{GatewayError, Result};

pub type RoomId = u16;

const PLAUSIBLE_VALUES: RangeInclusive<SensorValue> = -70.0..=70.0;
const PLAUSIBLE_TIMESTAMPS: RangeInclusive<Timestamp> = 1_640_000_000..=10_000_000_000;

/// Fixed-size window over the most recent values of one sensor.
#[derive(Debug, Clone)]
pub struct RunningAverage {
    window: VecDeque<SensorValue>,
    length: usize,
}

impl RunningAverage {
    pub fn new(length: usize) -> Self {
        let length = length.max(1);
        RunningAverage {
            window: VecDeque::with_capacity(length),
            length,
        }
    }

    pub fn push(&mut self, value: SensorValue) {
        if self.window.len() == self.length {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    /// Only defined once the window has filled up.
    pub fn average(&self) -> Option<SensorValue> {
        if self.window.len() < self.length {
            return None;
        }
        Some(self.window.iter().sum::<SensorValue>() / self.length as SensorValue)
    }
}

#[derive(Debug, Clone)]
pub struct SensorEntry {
    pub room_id: RoomId,
    pub sensor_id: SensorId,
    pub last_modified: Option<Timestamp>,
    window: RunningAverage,
}

impl SensorEntry {
    pub fn average(&self) -> Option<SensorValue> {
        self.window.average()
    }
}

/// Sensors known to the gateway, kept sorted by sensor id.
#[derive(Debug, Clone, Default)]
pub struct SensorMap {
    entries: Vec<SensorEntry>,
}

impl SensorMap {
    pub fn load(path: impl AsRef<Path>, avg_length: usize) -> Result<Self> {
        let file = File::open(path)?;
        Self::parse(BufReader::new(file), avg_length)
    }

    /// Reads `<room id> <sensor id>` pairs, one per line. Blank lines are
    /// skipped; a repeated sensor id keeps its first room.
    pub fn parse<R: BufRead>(reader: R, avg_length: usize) -> Result<Self> {
        let mut entries: Vec<SensorEntry> = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let malformed = || GatewayError::SensorMap {
                line: index + 1,
                content: line.clone(),
            };
            let mut fields = trimmed.split_whitespace();
            let room_id = fields
                .next()
                .and_then(|f| f.parse::<RoomId>().ok())
                .ok_or_else(malformed)?;
            let sensor_id = fields
                .next()
                .and_then(|f| f.parse::<SensorId>().ok())
                .ok_or_else(malformed)?;
            if fields.next().is_some() {
                return Err(malformed());
            }

            entries.try_reserve(1)?;
            entries.push(SensorEntry {
                room_id,
                sensor_id,
                last_modified: None,
                window: RunningAverage::new(avg_length),
            });
        }

        entries.sort_by_key(|entry| entry.sensor_id);
        let before = entries.len();
        entries.dedup_by_key(|entry| entry.sensor_id);
        if entries.len() != before {
            warn!(dropped = before - entries.len(), "duplicate sensor ids in sensor map");
        }
        debug!(sensors = entries.len(), "sensor map loaded");
        Ok(SensorMap { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, sensor_id: SensorId) -> Option<&SensorEntry> {
        let index = self.index_of(sensor_id)?;
        self.entries.get(index)
    }

    pub fn room_of(&self, sensor_id: SensorId) -> Option<RoomId> {
        self.get(sensor_id).map(|entry| entry.room_id)
    }

    pub fn last_modified(&self, sensor_id: SensorId) -> Option<Timestamp> {
        self.get(sensor_id).and_then(|entry| entry.last_modified)
    }

    pub fn average(&self, sensor_id: SensorId) -> Option<SensorValue> {
        self.get(sensor_id).and_then(SensorEntry::average)
    }

    /// Records a reading for a mapped sensor; `None` if the id is unknown.
    pub fn record(&mut self, reading: &Reading) -> Option<&SensorEntry> {
        let index = self.index_of(reading.sensor_id)?;
        let entry = &mut self.entries[index];
        entry.window.push(reading.value);
        entry.last_modified = Some(reading.timestamp);
        Some(entry)
    }

    fn index_of(&self, sensor_id: SensorId) -> Option<usize> {
        self.entries
            .binary_search_by_key(&sensor_id, |entry| entry.sensor_id)
            .ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Outside the plausible value or time range.
    Implausible,
    UnknownSensor,
    /// Not enough readings yet for an average.
    Warming,
    Normal(SensorValue),
    TooHot(SensorValue),
    TooCold(SensorValue),
}

pub fn is_plausible(reading: &Reading) -> bool {
    PLAUSIBLE_VALUES.contains(&reading.value) && PLAUSIBLE_TIMESTAMPS.contains(&reading.timestamp)
}

/// Per-sensor running averages compared against the comfort band.
#[derive(Debug)]
pub struct Analytics {
    sensors: SensorMap,
    min_temp: SensorValue,
    max_temp: SensorValue,
}

impl Analytics {
    pub fn new(sensors: SensorMap, config: &AnalyticsConfig) -> Self {
        Analytics {
            sensors,
            min_temp: config.min_temp,
            max_temp: config.max_temp,
        }
    }

    pub fn sensors(&self) -> &SensorMap {
        &self.sensors
    }

    pub fn process(&mut self, reading: &Reading) -> Verdict {
        if !is_plausible(reading) {
            warn!(
                sensor_id = reading.sensor_id,
                value = reading.value,
                timestamp = reading.timestamp,
                "rejected sensor reading due to sanity check"
            );
            return Verdict::Implausible;
        }

        let Some(entry) = self.sensors.record(reading) else {
            warn!(
                "received data with missing sensor id {}, please check room sensor map file. data stored in the database",
                reading.sensor_id
            );
            return Verdict::UnknownSensor;
        };
        let Some(average) = entry.average() else {
            return Verdict::Warming;
        };

        let (sensor_id, room_id) = (entry.sensor_id, entry.room_id);
        if average > self.max_temp {
            warn!(
                "too hot temp (sensor id = {}, room = {}, average temp = {:.2})",
                sensor_id, room_id, average
            );
            println!(
                "Temperature is too high: sensor_id = {}, room = {}, average temperature = {:.2}",
                sensor_id, room_id, average
            );
            Verdict::TooHot(average)
        } else if average < self.min_temp {
            warn!(
                "too cold temp (sensor id = {}, room = {}, average temp = {:.2})",
                sensor_id, room_id, average
            );
            println!(
                "Temperature is too low: sensor_id = {}, room = {}, average temperature = {:.2}",
                sensor_id, room_id, average
            );
            Verdict::TooCold(average)
        } else {
            debug!(sensor_id, average, "average within range");
            Verdict::Normal(average)
        }
    }

    /// Analytics consumer loop: blocking reads until a stop is observed.
    pub fn run(&mut self, buffer: &SharedBuffer<Reading>, shutdown: &Shutdown) -> Result<()> {
        while shutdown.is_running() {
            match buffer.read(ReaderId::Analytics, true) {
                Read::Item { value, .. } => {
                    self.process(&value);
                }
                Read::Empty | Read::TimedOut => {}
            }
        }
        info!(sensors = self.sensors.len(), "exiting analytics");
        Ok(())
    }
}
