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

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use protocol::{Reading, FRAME_LEN};
use sbuffer::SharedBuffer;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::MultiplexerConfig;
use crate::endpoint::{EndpointList, Received};
use crate::shutdown::{Shutdown, StopReason};
use crate::Result;

const LISTENER_TOKEN: u64 = 0;
// Device tokens count up from 1 and never get here.
const WAKE_TOKEN: u64 = u64::MAX;
const SCRATCH_FRAMES: usize = 64;

/// Where the multiplexer delivers decoded readings.
pub trait ReadingSink {
    fn push(&self, reading: Reading) -> Result<()>;

    /// Called after a poll that returned no events. Returns how many
    /// entries were released.
    fn release(&self) -> usize {
        0
    }
}

impl ReadingSink for SharedBuffer<Reading> {
    fn push(&self, reading: Reading) -> Result<()> {
        Ok(self.insert(reading)?)
    }

    fn release(&self) -> usize {
        self.remove_consumed()
    }
}

/// Accepts sensor nodes and moves their readings into the shared buffer.
pub struct Multiplexer {
    listener: TcpListener,
    epoll: Epoll,
    wake: Arc<EventFd>,
    endpoints: EndpointList,
    config: MultiplexerConfig,
    scratch: Vec<u8>,
    frames: Vec<Reading>,
}

impl Multiplexer {
    pub fn bind(config: &MultiplexerConfig) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(config.bind_address, config.port))?;
        listener.set_nonblocking(true)?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(
            &listener,
            EpollEvent::new(EpollFlags::EPOLLIN, LISTENER_TOKEN),
        )?;
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        epoll.add(&wake, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))?;
        info!(address = %listener.local_addr()?, "listening for sensor nodes");

        Ok(Multiplexer {
            listener,
            epoll,
            wake: Arc::new(wake),
            endpoints: EndpointList::new(config.max_connections),
            config: config.clone(),
            scratch: vec![0u8; SCRATCH_FRAMES * FRAME_LEN],
            frames: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves devices until a stop is requested, or until nothing has been
    /// connected for `idle_poll_limit` consecutive quiet polls. Every device
    /// is closed before returning.
    ///
    /// A stop request interrupts the poll wait right away. An error from
    /// the sink or the poller is escalated into a fatal stop.
    pub fn run<S>(mut self, sink: &S, shutdown: &Shutdown) -> Result<()>
    where
        S: ReadingSink + ?Sized,
    {
        let wake = Arc::downgrade(&self.wake);
        shutdown.register_waker(move || {
            if let Some(wake) = wake.upgrade() {
                if let Err(e) = wake.write(1) {
                    warn!(error = ?e, "failed to wake connection manager");
                }
            }
        });

        let result = self.serve(sink, shutdown);
        if let Err(e) = &result {
            shutdown.request(StopReason::Fatal(format!("connection manager: {}", e)));
        }

        let epoll = &self.epoll;
        let closed = self.endpoints.close_all(|stream| {
            if let Err(e) = epoll.delete(stream) {
                debug!(error = ?e, "failed to deregister socket");
            }
        });
        info!(closed, "connection manager stopped");
        result
    }

    fn serve<S>(&mut self, sink: &S, shutdown: &Shutdown) -> Result<()>
    where
        S: ReadingSink + ?Sized,
    {
        let mut events = vec![EpollEvent::empty(); self.config.max_connections + 2];
        let timeout = poll_timeout(self.config.poll_interval());
        let mut idle_polls = 0u32;

        loop {
            if !shutdown.is_running() {
                debug!("connection manager observed stop request");
                return Ok(());
            }
            let limit = self.config.idle_poll_limit;
            if limit > 0 && idle_polls >= limit {
                info!(idle_polls, "no sensor nodes connected, stopping gateway");
                shutdown.request(StopReason::Idle);
                return Ok(());
            }

            let nfds = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => 0,
                Err(e) => return Err(e.into()),
            };
            let now = Instant::now();

            if nfds == 0 {
                let released = sink.release();
                if released > 0 {
                    debug!(released, "released consumed readings");
                }
                if self.endpoints.is_empty() {
                    idle_polls += 1;
                } else {
                    idle_polls = 0;
                }
            } else {
                idle_polls = 0;
            }

            for event in events.iter().take(nfds) {
                match event.data() {
                    LISTENER_TOKEN => self.accept(now)?,
                    WAKE_TOKEN => self.drain_wake()?,
                    token => self.receive(token, now, sink)?,
                }
            }

            self.endpoints.mark_idle(now, self.config.timeout());
            let epoll = &self.epoll;
            self.endpoints.compact(|stream| {
                if let Err(e) = epoll.delete(stream) {
                    warn!(error = ?e, "failed to deregister socket");
                }
            });
        }
    }

    fn accept(&mut self, now: Instant) -> Result<()> {
        let stream = match self.listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                stream
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                warn!(error = ?e, "error accepting connection");
                return Ok(());
            }
        };

        if self.endpoints.is_full() {
            warn!(
                max_connections = self.config.max_connections,
                "connection limit reached, refusing sensor node"
            );
            return Ok(());
        }
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(error = ?e, "failed to configure connection");
            return Ok(());
        }
        self.register(stream, now)
    }

    fn drain_wake(&self) -> Result<()> {
        match self.wake.read() {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn register(&mut self, stream: TcpStream, now: Instant) -> Result<()> {
        let endpoint = self.endpoints.push(stream, now)?;
        let token = endpoint.token();
        self.epoll
            .add(endpoint.stream(), EpollEvent::new(EpollFlags::EPOLLIN, token))?;
        debug!(token, connected = self.endpoints.len(), "sensor node registered");
        Ok(())
    }

    fn receive<S>(&mut self, token: u64, now: Instant, sink: &S) -> Result<()>
    where
        S: ReadingSink + ?Sized,
    {
        let Some(endpoint) = self.endpoints.get_mut(token) else {
            return Ok(());
        };

        let frames = &mut self.frames;
        frames.clear();
        match endpoint.receive(&mut self.scratch, now, |reading| frames.push(reading)) {
            Ok(Received::Frames(_)) => {}
            Ok(Received::Closed) => {
                info!(token, "{} disconnected", endpoint);
                endpoint.mark();
            }
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted) => {
                info!(token, error = %e, "{} dropped its connection", endpoint);
                endpoint.mark();
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => {
                warn!(token, error = ?e, "error reading from {}", endpoint);
            }
        }

        for reading in self.frames.drain(..) {
            sink.push(reading)?;
        }
        Ok(())
    }
}

fn poll_timeout(interval: Duration) -> EpollTimeout {
    let ms = u16::try_from(interval.as_millis()).unwrap_or(u16::MAX);
    EpollTimeout::from(ms)
}
