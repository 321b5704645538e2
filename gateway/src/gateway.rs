use protocol::Reading;
use sbuffer::SharedBuffer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

use crate::analytics::{Analytics, SensorMap};
use crate::config::GatewayConfig;
use crate::multiplexer::Multiplexer;
use crate::pacing::{run_persistence, Pacer};
use crate::shutdown::{Shutdown, StopReason};
use crate::storage::SqliteStore;
use crate::{spawn_component, Result};

/// How a gateway run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub reason: StopReason,
    /// Readings still buffered when the buffer was torn down.
    pub leftover: usize,
}

/// Wires the multiplexer, analytics and storage components around one shared
/// buffer and supervises them until they all stop.
pub struct Gateway {
    config: GatewayConfig,
    multiplexer: Multiplexer,
    sensors: SensorMap,
    shutdown: Shutdown,
}

impl Gateway {
    /// Loads the sensor map and binds the listening socket. Either failing
    /// aborts startup.
    pub fn new(config: GatewayConfig, shutdown: Shutdown) -> Result<Self> {
        let sensors = SensorMap::load(&config.analytics.sensor_map, config.analytics.run_avg_length)
            .inspect_err(|e| {
                error!(path = %config.analytics.sensor_map.display(), error = %e, "sensor map not possible to open");
            })?;
        info!(sensors = sensors.len(), "sensor map loaded");
        let multiplexer = Multiplexer::bind(&config.multiplexer)?;

        Ok(Gateway {
            config,
            multiplexer,
            sensors,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.multiplexer.local_addr()
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Runs until a stop is requested from any component or from outside.
    pub fn run(self) -> Result<Summary> {
        let Gateway {
            config,
            multiplexer,
            sensors,
            shutdown,
        } = self;

        let buffer = Arc::new(SharedBuffer::<Reading>::new(config.buffer.wait_timeout()));
        let weak = Arc::downgrade(&buffer);
        shutdown.register_waker(move || {
            if let Some(buffer) = weak.upgrade() {
                buffer.interrupt();
            }
        });

        let mut handles = Vec::with_capacity(3);
        let spawned = spawn_all(&config, multiplexer, sensors, &buffer, &shutdown, &mut handles);
        if let Err(e) = &spawned {
            shutdown.request(StopReason::Fatal(format!("failed to start components: {}", e)));
        }

        for (name, handle) in handles {
            if handle.join().is_err() {
                error!(component = name, "component panicked");
                shutdown.request(StopReason::Fatal(format!("{} panicked", name)));
            }
        }
        shutdown.mark_stopped();
        spawned?;

        let leftover = match Arc::try_unwrap(buffer) {
            Ok(buffer) => buffer.destroy(),
            Err(buffer) => {
                warn!("shared buffer still referenced at teardown");
                buffer.len()
            }
        };
        let reason = shutdown.reason().unwrap_or(StopReason::External);
        info!(%reason, leftover, "all threads exited");

        Ok(Summary { reason, leftover })
    }
}

fn spawn_all(
    config: &GatewayConfig,
    multiplexer: Multiplexer,
    sensors: SensorMap,
    buffer: &Arc<SharedBuffer<Reading>>,
    shutdown: &Shutdown,
    handles: &mut Vec<(&'static str, JoinHandle<()>)>,
) -> Result<()> {
    {
        let buffer = buffer.clone();
        let shutdown_handle = shutdown.clone();
        handles.push((
            "connmgr",
            spawn_component("connmgr", shutdown, move || {
                multiplexer.run(&*buffer, &shutdown_handle)
            })?,
        ));
    }
    {
        let buffer = buffer.clone();
        let shutdown_handle = shutdown.clone();
        let mut analytics = Analytics::new(sensors, &config.analytics);
        handles.push((
            "datamgr",
            spawn_component("datamgr", shutdown, move || {
                analytics.run(&buffer, &shutdown_handle)
            })?,
        ));
    }
    {
        let buffer = buffer.clone();
        let shutdown_handle = shutdown.clone();
        let storage = config.storage.clone();
        let mut pacer = Pacer::new(&config.pacing);
        handles.push((
            "storagemgr",
            spawn_component("storagemgr", shutdown, move || {
                let store = SqliteStore::connect(&storage, &shutdown_handle)?;
                run_persistence(&buffer, store, &mut pacer, &shutdown_handle)
            })?,
        ));
    }
    Ok(())
}
