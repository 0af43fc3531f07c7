//! Module for connecting to a postgres database and storing device logs and snapshots in it.
//!
//! The synchronous postgres client is shared behind a mutex and driven from the blocking thread
//! pool of the runtime, so writes on one store are executed one after the other.
use std::error::Error as StdError;
use std::sync::{Arc, Mutex};
use std::thread;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use postgres::{Client, Config, NoTls};
use postgres_openssl::MakeTlsConnector;
use serde::{Deserialize, Serialize};

use super::{latest_path, log_path, LatestUpdate, Store, StoreError};
use crate::log_key::{LogKey, LogKeyGenerator};
use crate::record::TelemetryRecord;

static SQL_CREATE_TABLES: &'static str = include_str!("sql/create_tables.sql");

static SQL_INSERT_LOG: &'static str = include_str!("sql/insert_log.sql");
static SQL_UPSERT_LATEST: &'static str = include_str!("sql/upsert_latest.sql");

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct modeling the parameters required for a database connection.
///
/// This includes SSL/TLS encryption.
pub struct DatabaseParameters
{
    /// The hostname of the database server.
    pub hostname: String,
    /// The port for the database server.
    pub port: u16,
    /// The username to connect as.
    pub username: String,
    /// The password to connect with.
    pub password: String,
    /// The database to open on the server.
    pub database: String,
    /// Flag to enable tls for the database server connection.
    pub tls_enable: bool,
    /// Parameters for the tls connection to the database server.
    pub tls_params: Option<DatabaseTlsParameters>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct for the parameters required for a tls connection to the database.
pub struct DatabaseTlsParameters {
    /// The path to the server certificate for TLS encryption.
    pub server_ca_path: String,
    /// The path to the client certificate for TLS encryption.
    pub client_cert_path: String,
    /// The path to the client key for TLS encryption.
    pub client_key_path: String,
}

impl DatabaseParameters {
    fn client_config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.hostname)
            .port(self.port)
            .user(&self.username)
            .password(&self.password)
            .dbname(&self.database)
            .application_name("telemetryd");
        config
    }
}

/// Builds the openssl connector for a tls database connection.
fn tls_connector(tls_params: &DatabaseTlsParameters) -> Result<MakeTlsConnector, StoreError> {
    let mut ssl_connection_builder = match SslConnector::builder(SslMethod::tls()) {
        Ok(builder) => builder,
        Err(err) => {
            log::error!(target: "telemetryd::store", "Could not create ssl connection builder: \'{}\'", err);
            return Err(StoreError::Unavailable(format!("ssl connector: {}", err)));
        }
    };

    ssl_connection_builder.set_verify(SslVerifyMode::PEER);

    if let Err(err) = ssl_connection_builder.set_ca_file(&tls_params.server_ca_path) {
        log::error!(target: "telemetryd::store", "Could not set ssl ca file: \'{}\'", err);
        return Err(StoreError::Unavailable(format!("ssl ca file: {}", err)));
    }

    if let Err(err) = ssl_connection_builder.set_certificate_file(&tls_params.client_cert_path, SslFiletype::PEM) {
        log::error!(target: "telemetryd::store", "Could not set ssl client cert file: \'{}\'", err);
        return Err(StoreError::Unavailable(format!("ssl client cert file: {}", err)));
    }

    if let Err(err) = ssl_connection_builder.set_private_key_file(&tls_params.client_key_path, SslFiletype::PEM) {
        log::error!(target: "telemetryd::store", "Could not set ssl client key file: \'{}\'", err);
        return Err(StoreError::Unavailable(format!("ssl client key file: {}", err)));
    }

    Ok(MakeTlsConnector::new(ssl_connection_builder.build()))
}

/// Opens a new database connection and makes sure the tables exist.
///
/// # Errors
///
/// Errors occur when one of the following conditions is met:
///
/// * TLS is enabled but no TLS parameters are given, or the files for it cannot be loaded.
///
/// * The connection cannot be established.
///
/// * The user is not authorized for the database or cannot create the tables.
///
fn connect(connection_parameters: &DatabaseParameters) -> Result<Client, StoreError> {
    let config = connection_parameters.client_config();

    let connect_result = match connection_parameters.tls_enable {
        true => {
            let tls_params = match &connection_parameters.tls_params {
                Some(tls_params) => tls_params,
                None => {
                    log::error!(target: "telemetryd::store", "TLS enabled but no TLS parameters specified!");
                    return Err(StoreError::Unavailable(String::from("tls enabled without tls parameters")));
                }
            };
            config.connect(tls_connector(tls_params)?)
        }
        false => config.connect(NoTls),
    };

    let mut client = match connect_result {
        Ok(client) => client,
        Err(err) => {
            let message = describe(&err);
            log::error!(target: "telemetryd::store", "Could not establish database connection: \'{}\'", message);
            return Err(StoreError::Unavailable(message));
        }
    };

    if let Err(err) = client.batch_execute(SQL_CREATE_TABLES) {
        let message = describe(&err);
        log::error!(target: "telemetryd::store", "Could not create the device tables: \'{}\'", message);
        drop_outside_runtime(client);
        return Err(StoreError::Unavailable(message));
    }

    log::info!(target: "telemetryd::store", "Database connection established!");
    Ok(client)
}

/// Joins the messages of an error and all of its sources.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Message of a postgres error including the SQL state and server message when there is one.
fn describe(err: &postgres::Error) -> String {
    match err.as_db_error() {
        Some(db_error) => {
            let mut message = format!("{} {}: {}", db_error.severity(), db_error.code().code(), db_error.message());
            if let Some(detail) = db_error.detail() {
                message.push_str(&format!(" ({})", detail));
            }
            message
        }
        None => error_chain(err),
    }
}

/// Decides if an error means the connection itself can no longer be used.
///
/// SQL state classes `08` (connection exception) and `57P` (operator intervention, e.g. server
/// shutdown) come from the server before it closes the session.
fn connection_lost(closed: bool, io_failure: bool, sql_state: Option<&str>) -> bool {
    if closed || io_failure {
        return true;
    }
    match sql_state {
        Some(code) => code.starts_with("08") || code.starts_with("57P"),
        None => false,
    }
}

/// Maps a postgres error onto the store error kinds.
fn classify(err: &postgres::Error) -> StoreError {
    let io_failure = err
        .source()
        .map_or(false, |source| source.downcast_ref::<std::io::Error>().is_some());
    let sql_state = err.code().map(|state| state.code());

    match connection_lost(err.is_closed(), io_failure, sql_state) {
        true => StoreError::Unavailable(describe(err)),
        false => StoreError::WriteFailed(describe(err)),
    }
}

/// Drops `value` on a fresh thread when called from within an async runtime.
///
/// The synchronous client blocks on its own runtime while closing, which panics on a thread that
/// already drives one.
fn drop_outside_runtime<T: Send + 'static>(value: T) {
    if tokio::runtime::Handle::try_current().is_err() {
        drop(value);
        return;
    }

    match thread::Builder::new().name("db-close".to_string()).spawn(move || drop(value)) {
        Ok(handle) => {
            if handle.join().is_err() {
                log::warn!(target: "telemetryd::store", "Closing the database connection panicked!");
            }
        }
        Err(err) => {
            log::error!(target: "telemetryd::store", "Could not start a thread to close the database connection: \'{}\'", err);
        }
    }
}

struct DatabaseConnection {
    parameters: DatabaseParameters,
    client: Option<Client>,
}

impl DatabaseConnection {
    /// Runs `operation` on the open client, connecting first if there is none.
    ///
    /// A client whose error shows the connection is unusable is dropped and replaced on the next call.
    fn run<T, F>(&mut self, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Client) -> Result<T, postgres::Error>,
    {
        let client = match self.client.take() {
            Some(client) if !client.is_closed() => client,
            stale => {
                if let Some(client) = stale {
                    drop_outside_runtime(client);
                }
                connect(&self.parameters)?
            }
        };
        let client = self.client.insert(client);

        match operation(client) {
            Ok(result) => Ok(result),
            Err(err) => {
                let store_err = classify(&err);
                if let StoreError::Unavailable(_) = store_err {
                    log::warn!(target: "telemetryd::store", "Dropping database connection: \'{}\'", store_err);
                    if let Some(client) = self.client.take() {
                        drop_outside_runtime(client);
                    }
                }
                Err(store_err)
            }
        }
    }
}

impl Drop for DatabaseConnection {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            drop_outside_runtime(client);
        }
    }
}

/// Store that writes device logs and snapshots to postgres.
pub struct PostgresStore {
    keys: LogKeyGenerator,
    connection: Arc<Mutex<DatabaseConnection>>,
}

impl PostgresStore {
    /// Connects to the database and creates the tables if needed.
    ///
    /// Must not be called from within the async runtime.
    pub fn connect(connection_parameters: DatabaseParameters) -> Result<PostgresStore, StoreError> {
        let client = connect(&connection_parameters)?;

        Ok(PostgresStore {
            keys: LogKeyGenerator::new(),
            connection: Arc::new(Mutex::new(DatabaseConnection {
                parameters: connection_parameters,
                client: Some(client),
            })),
        })
    }

    async fn run_blocking<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Client) -> Result<T, postgres::Error> + Send + 'static,
        T: Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        let join_result = tokio::task::spawn_blocking(move || {
            let mut connection = match connection.lock() {
                Ok(connection) => connection,
                Err(_) => return Err(StoreError::Unavailable(String::from("database connection lock poisoned"))),
            };
            connection.run(operation)
        })
        .await;

        match join_result {
            Ok(result) => result,
            Err(err) => Err(StoreError::Unavailable(format!("database task failed: {}", err))),
        }
    }
}

fn record_json(record: &TelemetryRecord) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(record).map_err(|err| StoreError::WriteFailed(format!("record serialization: {}", err)))
}

#[async_trait]
impl Store for PostgresStore {
    async fn append_log(&self, device_id: &str, record: &TelemetryRecord) -> Result<LogKey, StoreError> {
        let key = self.keys.next_key();
        let record = record_json(record)?;
        let device = device_id.to_string();
        let key_text = key.as_str().to_owned();
        let received_at: DateTime<Utc> = Utc::now();

        self.run_blocking(move |client| {
            client.execute(SQL_INSERT_LOG, &[&device, &key_text, &record, &received_at])
        })
        .await?;

        log::trace!(target: "telemetryd::store", "Inserted \'{}/{}\'", log_path(device_id), key);
        Ok(key)
    }

    async fn set_latest(&self, device_id: &str, log_key: &LogKey, record: &TelemetryRecord) -> Result<LatestUpdate, StoreError> {
        let record = record_json(record)?;
        let device = device_id.to_string();
        let key_text = log_key.to_string();
        let updated_at: DateTime<Utc> = Utc::now();

        let rows = self
            .run_blocking(move |client| {
                client.execute(SQL_UPSERT_LATEST, &[&device, &key_text, &record, &updated_at])
            })
            .await?;

        log::trace!(target: "telemetryd::store", "Upserted \'{}\' ({} rows)", latest_path(device_id), rows);
        match rows {
            0 => Ok(LatestUpdate::Superseded),
            _ => Ok(LatestUpdate::Replaced),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres::config::Host;

    fn parameters() -> DatabaseParameters {
        DatabaseParameters {
            hostname: String::from("db.local"),
            port: 6543,
            username: String::from("telemetryd"),
            password: String::from("with spaces and 'quotes'"),
            database: String::from("telemetry"),
            tls_enable: false,
            tls_params: None,
        }
    }

    #[test]
    fn client_config_carries_all_parameters() {
        let config = parameters().client_config();

        assert_eq!(config.get_hosts(), &[Host::Tcp(String::from("db.local"))]);
        assert_eq!(config.get_ports(), &[6543]);
        assert_eq!(config.get_user(), Some("telemetryd"));
        assert_eq!(config.get_password(), Some("with spaces and 'quotes'".as_bytes()));
        assert_eq!(config.get_dbname(), Some("telemetry"));
        assert_eq!(config.get_application_name(), Some("telemetryd"));
    }

    #[test]
    fn tls_without_parameters_is_rejected_before_connecting() {
        let mut params = parameters();
        params.tls_enable = true;

        match connect(&params) {
            Err(StoreError::Unavailable(msg)) => assert!(msg.contains("tls")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected without tls parameters"),
        }
    }

    #[test]
    fn tls_with_missing_files_is_rejected() {
        let tls_params = DatabaseTlsParameters {
            server_ca_path: String::from("/nonexistent/ca.pem"),
            client_cert_path: String::from("/nonexistent/client.pem"),
            client_key_path: String::from("/nonexistent/client.key"),
        };

        assert!(matches!(tls_connector(&tls_params), Err(StoreError::Unavailable(_))));
    }

    #[derive(Debug)]
    struct Wrapped(std::io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("error communicating with the server")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn error_chain_keeps_every_cause() {
        let err = Wrapped(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer"));

        assert_eq!(error_chain(&err), "error communicating with the server: connection reset by peer");
    }

    #[test]
    fn only_connection_failures_drop_the_client() {
        assert!(connection_lost(true, false, None));
        assert!(connection_lost(false, true, None));
        assert!(connection_lost(false, false, Some("08006")));
        assert!(connection_lost(false, false, Some("57P01")));

        // Client side conversion errors and rejected statements keep the connection.
        assert!(!connection_lost(false, false, None));
        assert!(!connection_lost(false, false, Some("22P05")));
        assert!(!connection_lost(false, false, Some("53100")));
        assert!(!connection_lost(false, false, Some("42501")));
    }

    struct RuntimeSensitive(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for RuntimeSensitive {
        fn drop(&mut self) {
            if tokio::runtime::Handle::try_current().is_ok() {
                panic!("dropped inside the runtime");
            }
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn connections_close_outside_the_runtime() {
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));

        drop_outside_runtime(RuntimeSensitive(Arc::clone(&dropped)));

        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn connections_close_in_place_without_a_runtime() {
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));

        drop_outside_runtime(RuntimeSensitive(Arc::clone(&dropped)));

        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropping_an_idle_connection_inside_the_runtime_is_fine() {
        let connection = DatabaseConnection {
            parameters: parameters(),
            client: None,
        };

        drop(connection);
    }

    #[test]
    fn statements_are_embedded() {
        assert!(SQL_CREATE_TABLES.contains("device_logs"));
        assert!(SQL_CREATE_TABLES.contains("device_latest"));
        assert!(SQL_UPSERT_LATEST.contains("device_latest.log_key < EXCLUDED.log_key"));
    }
}
