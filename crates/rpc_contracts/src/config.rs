#![forbid(unsafe_code)]

use std::env;

use crate::request_id::{MAX_REQUEST_ID_BYTES, MIN_REQUEST_ID_BYTES};

pub const ENV_ENABLED: &str = "RPC_CONTRACTS_ENABLED";
pub const ENV_REQUEST_ID_BYTES: &str = "RPC_CONTRACTS_REQUEST_ID_BYTES";
pub const ENV_PURGE_UNMATCHED: &str = "RPC_CONTRACTS_PURGE_UNMATCHED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractConfig {
    /// When off, inbound calls go straight to the handler: no identity, no
    /// conditions, no history.
    pub enabled: bool,
    pub request_id_bytes: usize,
    /// Purge call history at exit even when the inbound method has no contract.
    pub purge_unmatched: bool,
}

impl ContractConfig {
    pub fn mvp_v1() -> Self {
        Self {
            enabled: true,
            request_id_bytes: MIN_REQUEST_ID_BYTES,
            purge_unmatched: true,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::mvp_v1();
        Self {
            enabled: parse_flag_from_env(ENV_ENABLED, defaults.enabled),
            request_id_bytes: parse_request_id_bytes_from_env(defaults.request_id_bytes),
            purge_unmatched: parse_flag_from_env(ENV_PURGE_UNMATCHED, defaults.purge_unmatched),
        }
    }
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

fn parse_flag_from_env(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "0" | "false" | "off" | "no" => false,
            "1" | "true" | "on" | "yes" => true,
            _ => default,
        },
        Err(_) => default,
    }
}

fn parse_request_id_bytes_from_env(default: usize) -> usize {
    env::var(ENV_REQUEST_ID_BYTES)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| (MIN_REQUEST_ID_BYTES..=MAX_REQUEST_ID_BYTES).contains(v))
        .unwrap_or(default)
}
