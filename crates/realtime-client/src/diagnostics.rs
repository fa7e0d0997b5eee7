use std::{
    collections::BTreeMap,
    fmt::Write as _,
    time::{SystemTime, UNIX_EPOCH},
};

use realtime_core::{CallError, CallResult, DiagnosticsReport};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::{
    registry::ChannelRegistry,
    safe_call::{CallOptions, SafeCaller},
};

pub const DEFAULT_SCHEMA_HEALTH_PROCEDURE: &str = "check_messaging_schema_health";
pub const DEFAULT_OVERVIEW_PROCEDURE: &str = "get_conversations_overview";

const SCHEMA_HEALTHY_FIELD: &str = "schema_healthy";

/// On-demand health check of the messaging backend.
#[derive(Clone)]
pub struct DiagnosticsProbe {
    caller: SafeCaller,
    registry: ChannelRegistry,
    health_procedure: String,
    overview_procedure: String,
}

impl DiagnosticsProbe {
    pub fn new(caller: SafeCaller, registry: ChannelRegistry) -> Self {
        Self {
            caller,
            registry,
            health_procedure: DEFAULT_SCHEMA_HEALTH_PROCEDURE.to_owned(),
            overview_procedure: DEFAULT_OVERVIEW_PROCEDURE.to_owned(),
        }
    }

    pub fn with_procedures(
        mut self,
        health_procedure: impl Into<String>,
        overview_procedure: impl Into<String>,
    ) -> Self {
        self.health_procedure = health_procedure.into();
        self.overview_procedure = overview_procedure.into();
        self
    }

    /// Probe schema health, RPC reachability and realtime connectivity.
    pub async fn run(&self) -> DiagnosticsReport {
        let mut last_error = None;
        let mut schema_healthy = false;
        let mut per_feature_flags = BTreeMap::new();

        let health: CallResult<Value> = self
            .caller
            .call(&self.health_procedure, json!({}), &CallOptions::default())
            .await;
        match health.into_result().and_then(|data| health_flags(&self.health_procedure, data)) {
            Ok(flags) => {
                for (name, enabled) in flags {
                    if name == SCHEMA_HEALTHY_FIELD {
                        schema_healthy = enabled;
                    } else {
                        per_feature_flags.insert(name, enabled);
                    }
                }
            }
            Err(err) => last_error = Some(err),
        }

        let overview: CallResult<Value> = self
            .caller
            .call(&self.overview_procedure, json!({}), &CallOptions::default())
            .await;
        let rpc_available = overview.succeeded || !overview.is_schema_error();
        if last_error.is_none() {
            last_error = overview.error;
        }

        let report = DiagnosticsReport {
            schema_healthy,
            per_feature_flags,
            rpc_available,
            realtime_connected: self.registry.any_connected(),
            last_error,
            checked_at_ms: now_ms(),
        };

        info!(
            schema_healthy = report.schema_healthy,
            rpc_available = report.rpc_available,
            realtime_connected = report.realtime_connected,
            "messaging diagnostics finished"
        );
        report
    }
}

/// Boolean fields of the schema-health payload.
///
/// Set-returning procedures answer with a one-row array; the first row is used.
fn health_flags(procedure: &str, data: Option<Value>) -> Result<Vec<(String, bool)>, CallError> {
    let object: Map<String, Value> = match data {
        Some(Value::Object(object)) => object,
        Some(Value::Array(rows)) => match rows.into_iter().next() {
            Some(Value::Object(object)) => object,
            _ => return Err(CallError::decode(procedure, "expected a row of health flags")),
        },
        _ => return Err(CallError::decode(procedure, "expected an object of health flags")),
    };

    Ok(object
        .into_iter()
        .filter_map(|(name, value)| value.as_bool().map(|enabled| (name, enabled)))
        .collect())
}

/// Render a report as deterministic plain text.
pub fn format_report(report: &DiagnosticsReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Messaging diagnostics");
    let _ = writeln!(out, "=====================");
    let _ = writeln!(out, "Checked at:         {} ms since epoch", report.checked_at_ms);
    let _ = writeln!(out, "Schema healthy:     {}", yes_no(report.schema_healthy));
    let _ = writeln!(out, "RPC available:      {}", yes_no(report.rpc_available));
    let _ = writeln!(out, "Realtime connected: {}", yes_no(report.realtime_connected));

    let _ = writeln!(out);
    let _ = writeln!(out, "Components:");
    if report.per_feature_flags.is_empty() {
        let _ = writeln!(out, "  (none reported)");
    }
    for (name, present) in &report.per_feature_flags {
        let status = if *present { "ok" } else { "MISSING" };
        let _ = writeln!(out, "  - {name}: {status}");
    }

    let _ = writeln!(out);
    match &report.last_error {
        Some(err) => {
            let _ = writeln!(out, "Last error: [{}] {}", err.code, err.message);
            if let Some(hint) = &err.hint {
                let _ = writeln!(out, "  hint: {hint}");
            }
        }
        None => {
            let _ = writeln!(out, "Last error: none");
        }
    }

    if !report.schema_healthy {
        let missing: Vec<_> = report
            .per_feature_flags
            .iter()
            .filter(|(_, present)| !**present)
            .map(|(name, _)| name.as_str())
            .collect();

        let _ = writeln!(out);
        let _ = writeln!(out, "Remediation:");
        if missing.is_empty() {
            let _ = writeln!(
                out,
                "  The schema-health check did not confirm the messaging schema."
            );
        } else {
            let _ = writeln!(out, "  The messaging schema is missing:");
            for name in missing {
                let _ = writeln!(out, "    - {name}");
            }
        }
        let _ = writeln!(
            out,
            "  Apply the pending messaging database migrations, then run diagnostics again."
        );
    }

    out
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}
