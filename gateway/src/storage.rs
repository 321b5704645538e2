use protocol::Reading;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::shutdown::Shutdown;
use crate::{GatewayError, Result};

/// Destination of the persistence consumer.
pub trait ReadingStore {
    fn insert(&mut self, reading: &Reading) -> Result<()>;

    fn close(self) -> Result<()>
    where
        Self: Sized;
}

pub struct SqliteStore {
    conn: Connection,
    table: String,
    insert_sql: String,
}

impl SqliteStore {
    /// Opens the database once and prepares the table. With `clear_on_start`
    /// any previous table is dropped first.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let conn = Connection::open(&config.db_path)?;
        let table = quote_identifier(&config.table);

        if config.clear_on_start {
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {table};
                 CREATE TABLE {table} (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     sensor_id INTEGER,
                     sensor_value DECIMAL(4,2),
                     timestamp TIMESTAMP
                 );"
            ))?;
            info!("connection to database established");
            info!(table = %config.table, "new table {} created", config.table);
        } else {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     sensor_id INTEGER,
                     sensor_value DECIMAL(4,2),
                     timestamp TIMESTAMP
                 );"
            ))?;
            info!("connection to database established");
        }

        let insert_sql = format!(
            "INSERT INTO {table} (sensor_id, sensor_value, timestamp) VALUES (?1, ?2, ?3)"
        );
        Ok(SqliteStore {
            conn,
            table,
            insert_sql,
        })
    }

    /// Opens the database, retrying `connect_attempts` times with a pause in
    /// between. The pause is cut short if the gateway is stopping.
    pub fn connect(config: &StorageConfig, shutdown: &Shutdown) -> Result<Self> {
        let limit = config.connect_attempts.max(1);
        let mut attempts = 0;
        while attempts < limit {
            attempts += 1;
            match Self::open(config) {
                Ok(store) => return Ok(store),
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "connection to database failed");
                    if attempts < limit && shutdown.sleep(config.retry_backoff()) {
                        break;
                    }
                }
            }
        }
        warn!(attempts, "database unreachable, stopping gateway");
        Err(GatewayError::StoreUnavailable(attempts))
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                    row.get(0)
                })?;
        Ok(count as usize)
    }

    /// Stored readings in insertion order.
    pub fn readings(&self) -> Result<Vec<Reading>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT sensor_id, sensor_value, timestamp FROM {} ORDER BY id",
            self.table
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(Reading::new(row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        let mut readings = Vec::new();
        for row in rows {
            readings.push(row?);
        }
        Ok(readings)
    }
}

impl ReadingStore for SqliteStore {
    fn insert(&mut self, reading: &Reading) -> Result<()> {
        self.conn.prepare_cached(&self.insert_sql)?.execute(params![
            reading.sensor_id,
            reading.value,
            reading.timestamp
        ])?;
        debug!(sensor_id = reading.sensor_id, "new reading inserted");
        Ok(())
    }

    fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| GatewayError::from(e))?;
        info!("database connection closed");
        Ok(())
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
