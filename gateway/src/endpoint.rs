use protocol::{FrameDecoder, Reading, SensorId};
use std::fmt;
use std::io::{self, Read};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::Result;

/// Result of draining one readiness notification from a device socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Bytes arrived; the count of frames they completed.
    Frames(usize),
    /// The peer closed its side.
    Closed,
}

/// One connected sensor node.
#[derive(Debug)]
pub struct DeviceEndpoint {
    token: u64,
    stream: TcpStream,
    last_active: Instant,
    sensor_id: Option<SensorId>,
    decoder: FrameDecoder,
    evict: bool,
}

impl DeviceEndpoint {
    fn new(token: u64, stream: TcpStream, now: Instant) -> Self {
        DeviceEndpoint {
            token,
            stream,
            last_active: now,
            sensor_id: None,
            decoder: FrameDecoder::new(),
            evict: false,
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Unknown until the first complete frame arrives.
    pub fn sensor_id(&self) -> Option<SensorId> {
        self.sensor_id
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn is_marked(&self) -> bool {
        self.evict
    }

    pub fn mark(&mut self) {
        self.evict = true;
    }

    /// Performs one read into `scratch` and hands every completed frame to
    /// `emit`. A partial frame is carried over to the next call.
    pub fn receive<F>(&mut self, scratch: &mut [u8], now: Instant, mut emit: F) -> io::Result<Received>
    where
        F: FnMut(Reading),
    {
        let n = self.stream.read(scratch)?;
        if n == 0 {
            let dropped = self.decoder.reset();
            if dropped > 0 {
                debug!(token = self.token, dropped, "discarding partial frame");
            }
            return Ok(Received::Closed);
        }
        self.last_active = now;

        let mut identified = self.sensor_id;
        let frames = self.decoder.decode(&scratch[..n], |reading| {
            identified.get_or_insert(reading.sensor_id);
            emit(reading);
        });
        if self.sensor_id.is_none() {
            if let Some(sensor_id) = identified {
                self.sensor_id = Some(sensor_id);
                info!(token = self.token, "sensor node connected with id {}", sensor_id);
            }
        }
        Ok(Received::Frames(frames))
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sensor_id {
            Some(id) => write!(f, "sensor node with id {}", id),
            None => write!(f, "unidentified sensor node (token {})", self.token),
        }
    }
}

/// Devices in connection order. Tokens grow monotonically and removal keeps
/// relative order, so the list stays sorted by token.
#[derive(Debug)]
pub struct EndpointList {
    endpoints: Vec<DeviceEndpoint>,
    capacity: usize,
    next_token: u64,
}

impl EndpointList {
    /// Token 0 is left for the listening socket.
    pub fn new(capacity: usize) -> Self {
        EndpointList {
            endpoints: Vec::new(),
            capacity,
            next_token: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.endpoints.len() >= self.capacity
    }

    /// Adds a freshly accepted device. Fails only when the list cannot grow.
    pub fn push(&mut self, stream: TcpStream, now: Instant) -> Result<&DeviceEndpoint> {
        self.endpoints.try_reserve(1)?;
        let token = self.next_token;
        self.next_token += 1;
        self.endpoints.push(DeviceEndpoint::new(token, stream, now));
        let index = self.endpoints.len() - 1;
        Ok(&self.endpoints[index])
    }

    pub fn get_mut(&mut self, token: u64) -> Option<&mut DeviceEndpoint> {
        let index = self
            .endpoints
            .binary_search_by_key(&token, |endpoint| endpoint.token)
            .ok()?;
        self.endpoints.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceEndpoint> {
        self.endpoints.iter()
    }

    /// Marks every device silent for longer than `timeout`.
    pub fn mark_idle(&mut self, now: Instant, timeout: Duration) -> usize {
        let mut marked = 0;
        for endpoint in self.endpoints.iter_mut().filter(|e| !e.evict) {
            if now.saturating_duration_since(endpoint.last_active) > timeout {
                info!(token = endpoint.token, "removing {} due to inactivity", endpoint);
                endpoint.evict = true;
                marked += 1;
            }
        }
        marked
    }

    /// Drops every marked device in one pass, calling `deregister` on each
    /// socket before it is closed.
    pub fn compact<F>(&mut self, mut deregister: F) -> usize
    where
        F: FnMut(&TcpStream),
    {
        let before = self.endpoints.len();
        self.endpoints.retain(|endpoint| {
            if endpoint.evict {
                deregister(&endpoint.stream);
            }
            !endpoint.evict
        });
        before - self.endpoints.len()
    }

    /// Closes every device, used when the multiplexer stops.
    pub fn close_all<F>(&mut self, deregister: F) -> usize
    where
        F: FnMut(&TcpStream),
    {
        for endpoint in &mut self.endpoints {
            endpoint.evict = true;
        }
        self.compact(deregister)
    }
}
