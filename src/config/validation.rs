//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Reject combinations the node cannot run with
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Pure function: &NodeConfig → Result<(), Vec<ValidationError>>

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::NodeConfig;
use crate::store::StoreKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &NodeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Some(url) = &config.control_url {
        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => errors.push(ValidationError::new(
                "control_url",
                format!("scheme {:?} is not http or https", parsed.scheme()),
            )),
            Err(e) => errors.push(ValidationError::new("control_url", e.to_string())),
        }
    }

    if let Some(hostname) = &config.hostname {
        if !is_dns_label(hostname) {
            errors.push(ValidationError::new(
                "hostname",
                format!("{hostname:?} is not a valid DNS label"),
            ));
        }
    }

    if config.store.kind == StoreKind::Memory && !config.ephemeral {
        errors.push(ValidationError::new(
            "store.kind",
            "in-memory state store requires ephemeral = true",
        ));
    }

    if config.store.kind == StoreKind::Memory && config.store.path.is_some() {
        errors.push(ValidationError::new(
            "store.path",
            "path is only meaningful for the file store",
        ));
    }

    if config.listeners.handoff_grace_ms == 0 {
        errors.push(ValidationError::new("listeners.handoff_grace_ms", "must be greater than zero"));
    }

    let timeouts = [
        ("timeouts.close_flush_secs", config.timeouts.close_flush_secs),
        ("timeouts.auth_poll_secs", config.timeouts.auth_poll_secs),
        ("timeouts.link_poll_secs", config.timeouts.link_poll_secs),
        ("timeouts.sniff_secs", config.timeouts.sniff_secs),
    ];
    for (field, value) in timeouts {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// 1-63 ASCII letters, digits or hyphens, not starting or ending with a hyphen.
pub fn is_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&NodeConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_violation() {
        let mut config = NodeConfig::default();
        config.control_url = Some("ftp://control.example".into());
        config.hostname = Some("bad_name".into());
        config.store.kind = StoreKind::Memory;
        config.timeouts.sniff_secs = 0;
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = "nowhere".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "control_url",
                "hostname",
                "store.kind",
                "timeouts.sniff_secs",
                "observability.metrics_address",
            ]
        );
    }

    #[test]
    fn memory_store_is_fine_when_ephemeral() {
        let mut config = NodeConfig::default();
        config.store.kind = StoreKind::Memory;
        config.ephemeral = true;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn dns_labels() {
        assert!(is_dns_label("web-1"));
        assert!(!is_dns_label("-web"));
        assert!(!is_dns_label("web.example"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }
}
