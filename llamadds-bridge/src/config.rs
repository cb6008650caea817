//! Bridge configuration, loaded from environment variables at startup.

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};

/// Runtime configuration for the bridge server.
///
/// Every field has a default so the server works out-of-the-box; only the
/// DDS library paths depend on the deployment.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Master switch for the bridge (default: `true`).
    pub enable_dds: bool,

    /// DDS domain id; clients and server must match (default: `0`).
    pub dds_domain: u32,

    /// Per-request deadline in seconds for the engine to produce a final
    /// result (default: `60`).
    pub dds_timeout_secs: u64,

    /// Parallel slot capacity reported on the status topic as
    /// `slots_idle + slots_processing` (default: `1`).
    pub n_parallel: i32,

    /// Status heartbeat period in seconds (default: `5`).
    pub status_period_secs: u64,

    /// Identifier carried in every status sample.
    pub server_id: String,

    /// Model name the loopback engine reports.
    pub model_name: String,

    /// Path to the CycloneDDS core library (default: platform name of
    /// `ddsc`, resolved through the loader search path).
    pub dds_lib_path: String,

    /// Path to the shared library compiled from the `idlc` output of
    /// `idl/LlamaDDS.idl`; falls back to `dds_lib_path` when the descriptors
    /// were linked into the core library.
    pub dds_types_lib_path: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,llamadds=trace"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl BridgeConfig {
    /// Build [`BridgeConfig`] from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let dds_lib_path = env_or("LLAMADDS_LIB", &format!("{DLL_PREFIX}ddsc{DLL_SUFFIX}"));
        let dds_types_lib_path = env_or("LLAMADDS_TYPES_LIB", &dds_lib_path);
        Self {
            enable_dds: env_flag("LLAMADDS_ENABLE", true),
            dds_domain: parse_env("LLAMADDS_DOMAIN", 0),
            dds_timeout_secs: parse_env("LLAMADDS_TIMEOUT_SECS", 60),
            n_parallel: parse_env("LLAMADDS_N_PARALLEL", 1).max(1),
            status_period_secs: parse_env("LLAMADDS_STATUS_PERIOD_SECS", 5),
            server_id: env_or("LLAMADDS_SERVER_ID", "llama-dds-server"),
            model_name: env_or("LLAMADDS_MODEL_NAME", "loopback"),
            dds_lib_path,
            dds_types_lib_path,
            log_level: env_or("LLAMADDS_LOG", "info"),
            log_json: env_flag("LLAMADDS_LOG_JSON", false),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
