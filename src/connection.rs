use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::driver::{ConnectionInfo, ConnectionState, DriverError, SqlConnection, SqlDriver};

const CONNECTING_POLL: Duration = Duration::from_millis(5);

/// Manages the single database connection a worker owns.
///
/// The connection is opened lazily on first use and repaired whenever it is
/// found broken or closed. Before handing the connection out, the manager
/// translates the command's database through the configured map and switches
/// the connection's database when it differs.
pub struct ConnectionManager {
    driver: Arc<dyn SqlDriver>,
    info: ConnectionInfo,
    mimic_app_name: bool,
    database_map: BTreeMap<String, String>,
    connection: Option<Box<dyn SqlConnection>>,
}

impl ConnectionManager {
    pub fn new(
        driver: Arc<dyn SqlDriver>,
        info: ConnectionInfo,
        mimic_app_name: bool,
        database_map: BTreeMap<String, String>,
    ) -> Self {
        Self {
            driver,
            info,
            mimic_app_name,
            database_map,
            connection: None,
        }
    }

    fn resolve_app_name<'a>(&'a self, command_app_name: &'a str) -> &'a str {
        if self.mimic_app_name && !command_app_name.is_empty() {
            command_app_name
        } else {
            &self.info.default_app_name
        }
    }

    fn resolve_database<'a>(&'a self, database: &'a str) -> &'a str {
        self.database_map
            .get(database)
            .map(String::as_str)
            .unwrap_or(database)
    }

    /// Returns a live connection positioned on the command's database,
    /// opening or repairing the worker's connection as needed.
    pub async fn acquire(
        &mut self,
        command_app_name: &str,
        database: &str,
        cancel: &CancellationToken,
    ) -> Result<&mut Box<dyn SqlConnection>, DriverError> {
        if cancel.is_cancelled() {
            return Err(DriverError::Unavailable("worker stopped".to_string()));
        }
        let needs_discard = self
            .connection
            .as_ref()
            .is_some_and(|conn| {
                matches!(conn.state(), ConnectionState::Broken | ConnectionState::Closed)
            });
        if needs_discard {
            if let Some(mut broken) = self.connection.take() {
                broken.close().await;
            }
        }

        let target_db = self.resolve_database(database).to_string();

        if self.connection.is_none() {
            let app_name = self.resolve_app_name(command_app_name);
            let conn = self.driver.open(&self.info, app_name, &target_db).await?;
            self.connection = Some(conn);
        }

        let conn = self.connection.as_mut().expect("connection just ensured");
        while conn.state() == ConnectionState::Connecting {
            if cancel.is_cancelled() {
                return Err(DriverError::Unavailable(
                    "worker stopped while waiting for the connection to open".to_string(),
                ));
            }
            tokio::time::sleep(CONNECTING_POLL).await;
        }

        if conn.database() != target_db {
            conn.change_database(&target_db).await?;
        }
        Ok(conn)
    }

    /// Closes and re-opens the connection (pooled reset).
    pub async fn reset(
        &mut self,
        command_app_name: &str,
        database: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        self.close().await;
        self.acquire(command_app_name, database, cancel).await?;
        Ok(())
    }

    /// Purges the driver pool entry behind the current connection and drops
    /// it; the next command triggers a fresh open.
    pub async fn clear_pool(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.clear_pool().await;
        }
    }

    /// Closes and releases the connection, swallowing close errors.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close().await;
        }
    }
}
