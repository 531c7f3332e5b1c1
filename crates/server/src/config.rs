use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// True when CONTEXT=DEV; enables the per-request token bypass for
    /// records and filters with source "test".
    pub dev_mode: bool,
    pub db_url: String,
    pub db_name: Option<String>,
    pub mount_path: Option<String>,
    /// Ordered generation tables, oldest first. The last entry is the only
    /// writable one.
    pub tables: Vec<String>,
    pub db_timeout_ms: u64,
    pub well_known_url: String,
    pub audiences: Vec<String>,
    pub shutdown_hour: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl ServerConfig {
    pub fn load() -> Result<Self, StartupError> {
        Self::from_kv(&std::env::vars().collect())
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("ARKIV_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            "ARKIV_BIND_ADDR",
        )?;

        let dev_mode = matches!(kv.get("CONTEXT").map(|s| s.trim()), Some("DEV"));

        let db_url = require_nonempty(kv, "DB_URL")?;

        let mount_path = optional(kv, "MOUNT_PATH");
        let db_name = optional(kv, "DB_NAME");
        if mount_path.is_some() && db_name.is_none() {
            return Err(StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "MOUNT_PATH is set but DB_NAME is missing".to_string(),
            });
        }

        let tables_raw = kv
            .get("ARKIV_TABLES")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("arkivv4,arkiv");
        let tables = tables_raw
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        if tables.is_empty() {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ARKIV_TABLES must name at least one table".to_string(),
            });
        }

        let db_timeout_ms = parse_u64(kv.get("ARKIV_DB_TIMEOUT_MS"), 5000, "ARKIV_DB_TIMEOUT_MS")?;

        let well_known_url = require_nonempty(kv, "AZURE_APP_WELL_KNOWN_URL")?;

        let audiences = require_nonempty(kv, "AZURE_APP_CLIENT_ID")?
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        if audiences.is_empty() {
            return Err(StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "AZURE_APP_CLIENT_ID must name at least one audience".to_string(),
            });
        }

        let shutdown_hour = parse_u32(kv.get("ARKIV_SHUTDOWN_HOUR"), 2, "ARKIV_SHUTDOWN_HOUR")?;
        if shutdown_hour > 23 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ARKIV_SHUTDOWN_HOUR must be between 0 and 23".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            dev_mode,
            db_url,
            db_name,
            mount_path,
            tables,
            db_timeout_ms,
            well_known_url,
            audiences,
            shutdown_hour,
        })
    }
}

fn optional(kv: &HashMap<String, String>, key: &'static str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    let Some(value) = kv.get(key) else {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    };

    let value = value.trim();
    if value.is_empty() {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    }

    Ok(value.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}
