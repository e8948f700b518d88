use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

use crate::driver::{ConnectionInfo, ConnectionState, DriverError, SqlConnection, SqlDriver};

/// Server-side function invoked for out-of-band trace events. Expected
/// signature: `replay_trace_generateevent(integer, varchar, bytea)`.
const TRACE_EVENT_SQL: &str = "select replay_trace_generateevent($1, $2, $3)";

/// Production driver backed by `tokio-postgres`.
///
/// Connections are pooled process-wide, keyed by connection string, database,
/// and application name, so that closing a worker's connection returns it for
/// reuse and `clear_pool` can purge exactly the entries backing it. The
/// target server cannot switch databases on a live connection, so
/// `change_database` reconnects and returns the previous client to the pool.
#[derive(Debug, Default)]
pub struct PgDriver;

type IdlePool = Mutex<HashMap<String, Vec<Client>>>;

fn pool() -> &'static IdlePool {
    static POOL: OnceLock<IdlePool> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

fn pool_key(connection_string: &str, app_name: &str, database: &str) -> String {
    format!("{connection_string}\u{1f}{app_name}\u{1f}{database}")
}

async fn connect(
    info: &ConnectionInfo,
    app_name: &str,
    database: &str,
) -> Result<Client, DriverError> {
    let mut config = info
        .connection_string
        .parse::<tokio_postgres::Config>()
        .map_err(|err| DriverError::Unavailable(format!("invalid connection string: {err}")))?;
    config.application_name(app_name);
    if !database.is_empty() {
        config.dbname(database);
    }

    let (client, connection) = config
        .connect(NoTls)
        .await
        .map_err(|err| DriverError::Unavailable(format!("connect: {err}")))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!("postgres connection task ended: {err}");
        }
    });
    Ok(client)
}

fn checkout_idle(key: &str) -> Option<Client> {
    let mut pool = pool().lock().expect("pg pool lock poisoned");
    let clients = pool.get_mut(key)?;
    while let Some(client) = clients.pop() {
        if !client.is_closed() {
            return Some(client);
        }
    }
    None
}

fn return_idle(key: &str, client: Client) {
    if client.is_closed() {
        return;
    }
    let mut pool = pool().lock().expect("pg pool lock poisoned");
    pool.entry(key.to_string()).or_default().push(client);
}

fn purge_pool_entry(key: &str) {
    let mut pool = pool().lock().expect("pg pool lock poisoned");
    pool.remove(key);
}

#[async_trait]
impl SqlDriver for PgDriver {
    async fn open(
        &self,
        info: &ConnectionInfo,
        app_name: &str,
        database: &str,
    ) -> Result<Box<dyn SqlConnection>, DriverError> {
        let key = pool_key(&info.connection_string, app_name, database);
        let client = match checkout_idle(&key) {
            Some(client) => client,
            None => connect(info, app_name, database).await?,
        };
        Ok(Box::new(PgConnection {
            client: Some(client),
            info: info.clone(),
            app_name: app_name.to_string(),
            database: database.to_string(),
            pool_key: key,
        }))
    }
}

struct PgConnection {
    client: Option<Client>,
    info: ConnectionInfo,
    app_name: String,
    database: String,
    pool_key: String,
}

impl PgConnection {
    fn client(&self) -> Result<&Client, DriverError> {
        self.client
            .as_ref()
            .ok_or_else(|| DriverError::Unavailable("connection is closed".to_string()))
    }

    async fn with_timeout<T, F>(&self, timeout: Duration, fut: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        if timeout.is_zero() {
            return fut.await.map_err(map_pg_error);
        }
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_pg_error(err)),
            Err(_) => {
                if let Some(client) = self.client.as_ref() {
                    let token = client.cancel_token();
                    tokio::spawn(async move {
                        let _ = token.cancel_query(NoTls).await;
                    });
                }
                Err(DriverError::timeout(format!(
                    "command exceeded timeout of {}s",
                    timeout.as_secs()
                )))
            }
        }
    }
}

#[async_trait]
impl SqlConnection for PgConnection {
    fn state(&self) -> ConnectionState {
        match self.client.as_ref() {
            None => ConnectionState::Closed,
            Some(client) if client.is_closed() => ConnectionState::Broken,
            Some(_) => ConnectionState::Open,
        }
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn change_database(&mut self, database: &str) -> Result<(), DriverError> {
        if database == self.database {
            return Ok(());
        }
        let fresh = connect(&self.info, &self.app_name, database).await?;
        if let Some(previous) = self.client.replace(fresh) {
            return_idle(&self.pool_key, previous);
        }
        self.pool_key = pool_key(&self.info.connection_string, &self.app_name, database);
        self.database = database.to_string();
        Ok(())
    }

    async fn execute_non_query(&mut self, sql: &str, timeout: Duration) -> Result<(), DriverError> {
        let client = self.client()?;
        self.with_timeout(timeout, client.batch_execute(sql)).await
    }

    async fn execute_scalar_int(
        &mut self,
        sql: &str,
        timeout: Duration,
    ) -> Result<Option<i64>, DriverError> {
        let client = self.client()?;
        let messages = self.with_timeout(timeout, client.simple_query(sql)).await?;
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                return Ok(row.get(0).and_then(|value| value.parse::<i64>().ok()));
            }
        }
        Ok(None)
    }

    async fn execute_drain(&mut self, sql: &str, timeout: Duration) -> Result<(), DriverError> {
        // simple_query materializes every result set; dropping the messages
        // discards the rows after the server has sent them all.
        let client = self.client()?;
        self.with_timeout(timeout, client.simple_query(sql))
            .await
            .map(|_| ())
    }

    async fn raise_trace_event(
        &mut self,
        event_id: i32,
        info: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let info: String = info.chars().take(128).collect();
        let client = self.client()?;
        self.with_timeout(
            timeout,
            client.execute(TRACE_EVENT_SQL, &[&event_id, &info, &payload]),
        )
        .await
        .map(|_| ())
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            return_idle(&self.pool_key, client);
        }
    }

    async fn clear_pool(&mut self) {
        purge_pool_entry(&self.pool_key);
        // Drop the client outright instead of returning it to the pool.
        self.client.take();
    }
}

fn map_pg_error(err: tokio_postgres::Error) -> DriverError {
    match err.as_db_error() {
        Some(db) => DriverError::Db {
            code: sqlstate_to_code(db.code().code()),
            message: db.message().to_string(),
        },
        None => DriverError::Unavailable(err.to_string()),
    }
}

/// Folds a five-character SQLSTATE into a numeric code, base-36 per
/// character, so distinct states surface as distinct numbers.
fn sqlstate_to_code(sqlstate: &str) -> i32 {
    sqlstate.bytes().fold(0i32, |acc, b| {
        let digit = match b {
            b'0'..=b'9' => i32::from(b - b'0'),
            b'A'..=b'Z' => i32::from(b - b'A') + 10,
            b'a'..=b'z' => i32::from(b - b'a') + 10,
            _ => 0,
        };
        acc.wrapping_mul(36).wrapping_add(digit)
    })
}
