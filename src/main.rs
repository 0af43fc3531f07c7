extern crate chrono;
extern crate serde_json;
extern crate log;
extern crate log4rs;
extern crate ctrlc;
extern crate clap;

use std::fs::File;
use std::io::Read;
use std::process::exit;
use std::sync::Arc;

use clap::App;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

mod http;
mod ingest;
mod log_key;
mod record;
mod store;

use ingest::IngestionHandler;
use store::{MemoryStore, PostgresStore, Store, StoreParameters};

static DEFAULT_CONFIG_PATH: &'static str = "resources/telemetryd.yml";
static DEFAULT_LOG_CONFIG_PATH: &'static str = "resources/log.yml";

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Configuration {
    http_parameters: http::HttpParameters,
    store_parameters: StoreParameters,
}

/// Reads and deserializes the configuration file.
fn load_configuration(path: &str) -> Result<Configuration, String> {
    let mut configuration_file = match File::open(path) {
        Ok(file) => file,
        Err(err) => return Err(format!("Cannot open the configuration file \'{}\': \'{}\'", path, err)),
    };

    let mut configuration_string = String::new();
    if let Err(err) = configuration_file.read_to_string(&mut configuration_string) {
        return Err(format!("Cannot read the configuration from file: \'{}\'", err));
    }

    parse_configuration(configuration_string.as_str())
}

fn parse_configuration(configuration_string: &str) -> Result<Configuration, String> {
    match serde_yaml::from_str::<Configuration>(configuration_string) {
        Ok(configuration) => Ok(configuration),
        Err(err) => Err(format!("Cannot deserialize the configuration: \'{}\'", err)),
    }
}

/// Creates the one store handle shared by all requests.
fn open_store(params: StoreParameters) -> Result<Arc<dyn Store>, store::StoreError> {
    match params {
        StoreParameters::Memory => {
            log::warn!(target: "telemetryd", "Using the in-memory store, readings are lost on exit!");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreParameters::Postgres(database_parameters) => {
            Ok(Arc::new(PostgresStore::connect(database_parameters)?))
        }
    }
}

fn main() {
    let cli_yaml = clap::load_yaml!("cli.yml");
    let matches = App::from(cli_yaml).get_matches();
    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH);
    let log_config_path = matches.value_of("log-config").unwrap_or(DEFAULT_LOG_CONFIG_PATH);

    match log4rs::init_file(log_config_path, Default::default()) {
        Ok(_) => {},
        Err(err) => {
            eprintln!("Could not create logger from yaml configuration: {}", err);
            exit(100);
        }
    };

    let configuration = match load_configuration(config_path) {
        Ok(configuration) => configuration,
        Err(err) => {
            log::error!(target: "telemetryd", "{}", err);
            exit(101);
        }
    };

    // The synchronous postgres client has to connect outside of the async runtime.
    let store = match open_store(configuration.store_parameters.clone()) {
        Ok(store) => store,
        Err(err) => {
            log::error!(target: "telemetryd", "Cannot open the store: \'{}\'", err);
            exit(201);
        }
    };
    let handler = Arc::new(IngestionHandler::new(Arc::clone(&store)));

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!(target: "telemetryd", "Cannot start the async runtime: \'{}\'", err);
            exit(202);
        }
    };

    let terminate = Arc::new(Notify::new());
    let terminate_handler = Arc::clone(&terminate);
    if let Err(err) = ctrlc::set_handler(move || {
        log::info!(target: "telemetryd", "Termination signal received!");
        terminate_handler.notify_one();
    }) {
        log::error!(target: "telemetryd", "Cannot set the termination handler: \'{}\'", err);
        exit(203);
    }

    let shutdown = async move { terminate.notified().await };
    if let Err(err) = runtime.block_on(http::serve(configuration.http_parameters, handler, shutdown)) {
        log::error!(target: "telemetryd", "HTTP server failed: \'{}\'", err);
        exit(301);
    }

    // The last store handle is released once the runtime is gone.
    drop(runtime);
    drop(store);

    log::info!(target: "telemetryd", "Exiting");
    exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_configuration_parses() {
        let configuration = parse_configuration(include_str!("../resources/telemetryd.yml")).unwrap();

        assert_eq!(configuration.http_parameters.route, "/");
        assert!(matches!(configuration.store_parameters, StoreParameters::Memory));
    }

    #[test]
    fn postgres_configuration_parses() {
        let yaml = "
http_parameters:
  address: 0.0.0.0
  port: 8080
  route: /iotUpload
store_parameters:
  backend: postgres
  hostname: localhost
  port: 5432
  username: telemetryd
  password: secret
  database: telemetry
  tls_enable: true
  tls_params:
    server_ca_path: /etc/telemetryd/ca.pem
    client_cert_path: /etc/telemetryd/client.pem
    client_key_path: /etc/telemetryd/client.key
";
        let configuration = parse_configuration(yaml).unwrap();

        assert_eq!(configuration.http_parameters.route, "/iotUpload");
        match configuration.store_parameters {
            StoreParameters::Postgres(params) => {
                assert!(params.tls_enable);
                assert_eq!(params.tls_params.unwrap().client_key_path, "/etc/telemetryd/client.key");
            }
            other => panic!("unexpected backend: {:?}", other),
        }
    }

    #[test]
    fn missing_section_is_an_error() {
        let err = parse_configuration("http_parameters:\n  address: 0.0.0.0\n  port: 8080\n").unwrap_err();

        assert!(err.contains("store_parameters"));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_configuration("/nonexistent/telemetryd.yml").is_err());
    }

    #[tokio::test]
    async fn memory_store_accepts_readings() {
        let store = open_store(StoreParameters::Memory).unwrap();
        let handler = IngestionHandler::new(store);

        let request = ingest::IngestRequest {
            method: axum::http::Method::POST,
            body: axum::body::Bytes::from_static(br#"{"deviceId": "bus-1", "payload": {"x": 1}}"#),
        };
        assert!(handler.handle(request).await.is_ok());
    }
}
