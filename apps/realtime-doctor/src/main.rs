//! Command-line health check of a messaging backend.
//!
//! Exit status: 0 when the schema is healthy and the RPC surface is
//! available, 1 otherwise, 2 when configuration is invalid.

mod logging;

use std::{env, process::ExitCode, sync::Arc};

use realtime_client::{
    ClientConfig, ConfigError, DisconnectedTransport, HttpRpcBackend, RealtimeClient,
    config::optional_trimmed_env, format_report,
};
use realtime_core::DiagnosticsReport;
use tracing::error;
use url::Url;

const BACKEND_URL_KEY: &str = "CARPOOL_BACKEND_URL";
const BACKEND_KEY_KEY: &str = "CARPOOL_BACKEND_KEY";

#[derive(Debug, Clone, PartialEq, Eq)]
struct DoctorConfig {
    client: ClientConfig,
    backend_url: Url,
    backend_key: Option<String>,
    json: bool,
}

impl DoctorConfig {
    fn from_lookup<F, I>(mut lookup: F, args: I) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
        I: IntoIterator<Item = String>,
    {
        let client = ClientConfig::from_lookup(&mut lookup)?;

        let raw_url = optional_trimmed_env(BACKEND_URL_KEY, &mut lookup)
            .ok_or(ConfigError::Missing { key: BACKEND_URL_KEY })?;
        let backend_url = Url::parse(&raw_url).map_err(|err| ConfigError::InvalidValue {
            key: BACKEND_URL_KEY,
            value: raw_url.clone(),
            reason: err.to_string(),
        })?;
        let backend_key = optional_trimmed_env(BACKEND_KEY_KEY, &mut lookup);

        let mut json = false;
        for arg in args {
            match arg.as_str() {
                "--json" => json = true,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "argument",
                        value: other.to_owned(),
                        reason: "expected --json".to_owned(),
                    });
                }
            }
        }

        Ok(Self {
            client,
            backend_url,
            backend_key,
            json,
        })
    }
}

fn exit_code(report: &DiagnosticsReport) -> u8 {
    if report.schema_healthy && report.rpc_available {
        0
    } else {
        1
    }
}

fn render(report: &DiagnosticsReport, json: bool) -> String {
    if !json {
        return format_report(report);
    }
    match serde_json::to_string_pretty(report) {
        Ok(text) => text,
        Err(err) => format!("{{\"error\": \"failed to encode report: {err}\"}}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match DoctorConfig::from_lookup(|key| env::var(key).ok(), env::args().skip(1)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            return ExitCode::from(2);
        }
    };

    let backend = HttpRpcBackend::new(config.backend_url.clone(), config.backend_key.clone());
    let backend = match backend {
        Ok(backend) => backend,
        Err(err) => {
            error!(error = %err, "failed to build backend");
            eprintln!("Invalid configuration: {err}");
            return ExitCode::from(2);
        }
    };

    let client = RealtimeClient::new(
        config.client.clone(),
        Arc::new(backend),
        Arc::new(DisconnectedTransport),
    );
    let report = client.diagnostics().run().await;
    client.shutdown().await;

    println!("{}", render(&report, config.json));
    ExitCode::from(exit_code(&report))
}
