//! Configuration validation

use crate::{ConfigError, DaemonConfig, Result, TlsConfig};

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate the entire daemon configuration
pub fn validate_config(config: &DaemonConfig) -> Result<()> {
    let mut errors = Vec::new();

    if let Err(e) = validate_listen_addr(&config.rpc_listen) {
        errors.push(ValidationError::new("rpc_listen", e));
    }

    if config.rest_enabled() {
        if let Err(e) = validate_listen_addr(&config.rest_listen) {
            errors.push(ValidationError::new("rest_listen", e));
        }

        if config.rest_listen == config.rpc_listen {
            errors.push(ValidationError::new(
                "rest_listen",
                "must differ from rpc_listen",
            ));
        }
    }

    if config.cors_origin.chars().any(|c| c.is_control()) {
        errors.push(ValidationError::new(
            "cors_origin",
            "must not contain control characters",
        ));
    }

    if config.data_dir.as_os_str().is_empty() {
        errors.push(ValidationError::new("data_dir", "data directory is required"));
    }

    if let Some(tls) = &config.tls {
        errors.extend(validate_tls_config(tls));
    }

    if config.swap_server_host().is_none() {
        errors.push(ValidationError::new(
            "server.host",
            format!(
                "no swap server address specified for network {}",
                config.network
            ),
        ));
    }

    if config.backend.kind.is_empty() {
        errors.push(ValidationError::new("backend.kind", "backend kind is required"));
    }

    if config.subscriber_buffer == 0 {
        errors.push(ValidationError::new(
            "subscriber_buffer",
            "must be greater than 0",
        ));
    }

    if let Err(e) = validate_log_level(&config.logging.level) {
        errors.push(e);
    }

    if !errors.is_empty() {
        let error_msg = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ConfigError::ValidationError(error_msg));
    }

    Ok(())
}

/// Validate a `host:port` listen address
pub fn validate_listen_addr(addr: &str) -> std::result::Result<(), String> {
    if addr.trim().is_empty() {
        return Err("listen address cannot be empty".to_string());
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("listen address '{addr}' must be of the form host:port"))?;

    if host.is_empty() {
        return Err(format!("listen address '{addr}' is missing a host"));
    }

    if host.starts_with('[') != host.ends_with(']') {
        return Err(format!("listen address '{addr}' has an unbalanced IPv6 bracket"));
    }

    port.parse::<u16>()
        .map_err(|_| format!("invalid port '{port}' in listen address '{addr}'"))?;

    Ok(())
}

fn validate_tls_config(tls: &TlsConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if tls.cert_path.as_os_str().is_empty() {
        errors.push(ValidationError::new("tls.cert_path", "certificate path is required"));
    }

    if tls.key_path.as_os_str().is_empty() {
        errors.push(ValidationError::new("tls.key_path", "key path is required"));
    }

    errors
}

/// Validate log level
fn validate_log_level(level: &str) -> std::result::Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new(
            "logging.level",
            format!(
                "invalid log level '{level}', must be one of: trace, debug, info, warn, error"
            ),
        )),
    }
}
