//! Environment-derived settings.

use crate::config::schema::NodeConfig;

pub const AUTH_KEY_VAR: &str = "EMBEDNET_AUTHKEY";
pub const FORCE_LOGIN_VAR: &str = "EMBEDNET_FORCE_LOGIN";

/// The configured join key, or the one from the environment.
pub fn resolve_auth_key(config: &NodeConfig) -> Option<String> {
    config
        .auth_key
        .clone()
        .filter(|key| !key.is_empty())
        .or_else(|| std::env::var(AUTH_KEY_VAR).ok().filter(|key| !key.is_empty()))
}

/// Whether interactive login is forced at startup.
pub fn force_login() -> bool {
    std::env::var(FORCE_LOGIN_VAR)
        .map(|value| parse_flag(&value))
        .unwrap_or(false)
}

pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
