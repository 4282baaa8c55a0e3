use std::{env::var, time::Duration};

use thiserror::Error;

pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;
pub const DEFAULT_WEBHOOK_CERT_PATH: &str = "/etc/certs/tls.crt";
pub const DEFAULT_WEBHOOK_KEY_PATH: &str = "/etc/certs/tls.key";
pub const DEFAULT_WEBHOOK_LATENCY_SECS: u64 = 10;
pub const DEFAULT_REMOTE_DEADLINE_SECS: u64 = 30;
pub const DEFAULT_TEARDOWN_ALERT_THRESHOLD: u32 = 5;

#[derive(Debug, Error)]
pub enum FromError {
    #[error("Env var unavailable: {}", .0)]
    VarUnset(std::env::VarError),
    #[error("'{}' couldn't be parsed as a number!", .0)]
    InvalidNumber(String),
    #[error("'{}' couldn't be parsed as a boolean!", .0)]
    InvalidBool(String),
}

/// Operator configuration, sourced from the deployment's environment.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// base URL of the external compute service
    pub service_url: String,
    pub service_token: Option<String>,
    /// run against the in-process mock service instead of the real one
    pub mock: bool,
    /// caller-side deadline applied to every remote call
    pub remote_deadline: Duration,
    pub webhook_port: u16,
    pub webhook_cert_path: String,
    pub webhook_key_path: String,
    /// admit pods unmodified when mutation fails
    pub webhook_fail_open: bool,
    /// how long a single admission review may take before it gives up
    pub webhook_latency_budget: Duration,
    /// failed destroy() attempts after which an alert is logged
    pub teardown_alert_threshold: u32,
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, FromError> {
        Ok(Self {
            service_url: var("K8S_OFFLOAD_SERVICE_URL").map_err(FromError::VarUnset)?,
            service_token: var("K8S_OFFLOAD_SERVICE_TOKEN").ok(),
            mock: parse_bool_var("K8S_OFFLOAD_MOCK", false)?,
            remote_deadline: Duration::from_secs(parse_number_var(
                "K8S_OFFLOAD_REMOTE_DEADLINE_SECS",
                DEFAULT_REMOTE_DEADLINE_SECS,
            )?),
            webhook_port: parse_number_var("K8S_OFFLOAD_WEBHOOK_PORT", DEFAULT_WEBHOOK_PORT)?,
            webhook_cert_path: var("K8S_OFFLOAD_WEBHOOK_CERT_PATH")
                .unwrap_or_else(|_| DEFAULT_WEBHOOK_CERT_PATH.to_owned()),
            webhook_key_path: var("K8S_OFFLOAD_WEBHOOK_KEY_PATH")
                .unwrap_or_else(|_| DEFAULT_WEBHOOK_KEY_PATH.to_owned()),
            webhook_fail_open: parse_bool_var("K8S_OFFLOAD_WEBHOOK_FAIL_OPEN", true)?,
            webhook_latency_budget: Duration::from_secs(parse_number_var(
                "K8S_OFFLOAD_WEBHOOK_LATENCY_SECS",
                DEFAULT_WEBHOOK_LATENCY_SECS,
            )?),
            teardown_alert_threshold: parse_number_var(
                "K8S_OFFLOAD_TEARDOWN_ALERT_THRESHOLD",
                DEFAULT_TEARDOWN_ALERT_THRESHOLD,
            )?,
        })
    }
}

fn parse_number_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, FromError> {
    match var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| FromError::InvalidNumber(name.to_owned())),
        Err(_) => Ok(default),
    }
}

fn parse_bool_var(name: &str, default: bool) -> Result<bool, FromError> {
    match var(name) {
        Ok(value) => match value.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(FromError::InvalidBool(name.to_owned())),
        },
        Err(_) => Ok(default),
    }
}
