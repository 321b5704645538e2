use gateway::config::MultiplexerConfig;
use gateway::multiplexer::{Multiplexer, ReadingSink};
use gateway::{GatewayError, Shutdown, StopReason};
use protocol::{Reading, FRAME_LEN};
use rstest::{fixture, rstest};
use sbuffer::{ReaderId, SharedBuffer};
use serial_test::serial;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TS: i64 = 1_700_000_000;

struct Running {
    addr: SocketAddr,
    buffer: Arc<SharedBuffer<Reading>>,
    shutdown: Shutdown,
    handle: Option<JoinHandle<gateway::Result<()>>>,
}

impl Running {
    fn start(config: MultiplexerConfig) -> Self {
        let multiplexer = Multiplexer::bind(&config).unwrap();
        let addr = multiplexer.local_addr().unwrap();
        let buffer = Arc::new(SharedBuffer::new(Duration::from_millis(200)));
        let shutdown = Shutdown::new();

        let handle = {
            let buffer = buffer.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("connmgr".to_string())
                .spawn(move || multiplexer.run(&*buffer, &shutdown))
                .unwrap()
        };

        Running {
            addr,
            buffer,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn next(&self, reader: ReaderId) -> Option<Reading> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(reading) = self.buffer.read(reader, true).into_item() {
                return Some(reading);
            }
        }
        None
    }

    fn stop(mut self) -> gateway::Result<()> {
        self.shutdown.request(StopReason::External);
        self.handle.take().unwrap().join().unwrap()
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.shutdown.request(StopReason::External);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[fixture]
fn config() -> MultiplexerConfig {
    MultiplexerConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        port: 0,
        timeout_ms: 600,
        max_connections: 8,
        idle_poll_limit: 0,
    }
}

#[rstest]
#[serial]
fn test_single_frame_then_close(config: MultiplexerConfig) {
    let running = Running::start(config);
    let sent = Reading::new(15, 21.5, TS);

    let mut client = running.connect();
    client.write_all(&sent.encode()).unwrap();
    drop(client);

    assert_eq!(running.next(ReaderId::Analytics), Some(sent));
    assert_eq!(running.next(ReaderId::Persistence), Some(sent));
    assert!(running.buffer.read(ReaderId::Analytics, false).into_item().is_none());
    running.stop().unwrap();
}

#[rstest]
#[serial]
fn test_frame_split_across_writes(config: MultiplexerConfig) {
    let running = Running::start(config);
    let sent = Reading::new(21, -4.25, TS + 5);
    let bytes = sent.encode();

    let mut client = running.connect();
    client.write_all(&bytes[..7]).unwrap();
    client.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    client.write_all(&bytes[7..]).unwrap();

    assert_eq!(running.next(ReaderId::Analytics), Some(sent));
    running.stop().unwrap();
}

#[rstest]
#[serial]
fn test_partial_frame_dropped_on_close(config: MultiplexerConfig) {
    let running = Running::start(config);
    let first = Reading::new(37, 19.0, TS);

    let mut client = running.connect();
    let mut bytes = first.encode().to_vec();
    bytes.extend_from_slice(&Reading::new(37, 20.0, TS + 1).encode()[..FRAME_LEN - 1]);
    client.write_all(&bytes).unwrap();
    drop(client);

    assert_eq!(running.next(ReaderId::Persistence), Some(first));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(running.buffer.unread(ReaderId::Persistence), 0);
    running.stop().unwrap();
}

#[rstest]
#[serial]
fn test_readings_keep_arrival_order(config: MultiplexerConfig) {
    let running = Running::start(config);

    let mut client = running.connect();
    let sent: Vec<_> = (0..50)
        .map(|i| Reading::new(49, 15.0 + i as f64 / 10.0, TS + i))
        .collect();
    for reading in &sent {
        reading.write_to(&mut client).unwrap();
    }

    let received: Vec<_> = (0..sent.len())
        .map(|_| running.next(ReaderId::Persistence).unwrap())
        .collect();
    assert_eq!(received, sent);
    running.stop().unwrap();
}

#[rstest]
#[serial]
fn test_idle_device_evicted_without_disturbing_others(config: MultiplexerConfig) {
    let running = Running::start(config);

    let mut silent = running.connect();
    let mut active = running.connect();
    silent.write_all(&Reading::new(1, 20.0, TS).encode()).unwrap();

    let writer = thread::spawn(move || {
        for i in 0..15 {
            active
                .write_all(&Reading::new(2, 20.0, TS + i).encode())
                .unwrap();
            thread::sleep(Duration::from_millis(100));
        }
        active
    });

    let start = Instant::now();
    let mut byte = [0u8; 1];
    assert_eq!(silent.read(&mut byte).unwrap(), 0);
    assert!(start.elapsed() >= Duration::from_millis(500));

    let active = writer.join().unwrap();
    let mut from_active = 0;
    while let Some(reading) = running.buffer.read(ReaderId::Analytics, false).into_item() {
        if reading.sensor_id == 2 {
            from_active += 1;
        }
    }
    assert_eq!(from_active, 15);
    drop(active);
    running.stop().unwrap();
}

#[rstest]
#[serial]
fn test_connections_beyond_limit_are_refused(mut config: MultiplexerConfig) {
    config.max_connections = 1;
    let running = Running::start(config);

    let mut first = running.connect();
    first.write_all(&Reading::new(1, 20.0, TS).encode()).unwrap();
    assert!(running.next(ReaderId::Analytics).is_some());

    let mut second = running.connect();
    let mut byte = [0u8; 1];
    assert_eq!(second.read(&mut byte).unwrap(), 0);

    first.write_all(&Reading::new(1, 21.0, TS + 1).encode()).unwrap();
    assert_eq!(running.next(ReaderId::Analytics).map(|r| r.value), Some(21.0));
    running.stop().unwrap();
}

#[rstest]
#[serial]
fn test_stops_itself_when_idle(mut config: MultiplexerConfig) {
    config.timeout_ms = 150;
    config.idle_poll_limit = 3;
    let multiplexer = Multiplexer::bind(&config).unwrap();
    let buffer = SharedBuffer::new(Duration::from_millis(50));
    let shutdown = Shutdown::new();

    let start = Instant::now();
    multiplexer.run(&buffer, &shutdown).unwrap();

    assert_eq!(shutdown.reason(), Some(StopReason::Idle));
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[rstest]
#[serial]
fn test_stop_request_closes_devices(config: MultiplexerConfig) {
    let running = Running::start(config);
    let mut client = running.connect();
    client.write_all(&Reading::new(3, 20.0, TS).encode()).unwrap();
    assert!(running.next(ReaderId::Analytics).is_some());

    running.stop().unwrap();

    let mut byte = [0u8; 1];
    assert_eq!(client.read(&mut byte).unwrap(), 0);
}

#[rstest]
#[serial]
fn test_stop_request_interrupts_poll_wait() {
    let config = MultiplexerConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        port: 0,
        idle_poll_limit: 0,
        ..MultiplexerConfig::default()
    };
    let poll_interval = config.poll_interval();
    let running = Running::start(config);
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    running.stop().unwrap();

    assert!(start.elapsed() < poll_interval / 4);
}

struct RejectingSink;

impl ReadingSink for RejectingSink {
    fn push(&self, _reading: Reading) -> gateway::Result<()> {
        let err = Vec::<u8>::new().try_reserve(usize::MAX).unwrap_err();
        Err(GatewayError::Allocation(err))
    }
}

#[rstest]
#[serial]
fn test_sink_failure_is_fatal_and_closes_devices(config: MultiplexerConfig) {
    let multiplexer = Multiplexer::bind(&config).unwrap();
    let addr = multiplexer.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let handle = {
        let shutdown = shutdown.clone();
        thread::spawn(move || multiplexer.run(&RejectingSink, &shutdown))
    };

    let mut bystander = TcpStream::connect(addr).unwrap();
    bystander
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    let mut sender = TcpStream::connect(addr).unwrap();
    sender.write_all(&Reading::new(7, 20.0, TS).encode()).unwrap();

    let result = handle.join().unwrap();

    assert!(matches!(result, Err(GatewayError::Allocation(_))));
    match shutdown.reason() {
        Some(StopReason::Fatal(cause)) => assert!(cause.starts_with("connection manager")),
        other => panic!("unexpected stop reason {:?}", other),
    }
    let mut byte = [0u8; 1];
    assert_eq!(bystander.read(&mut byte).unwrap(), 0);
}
