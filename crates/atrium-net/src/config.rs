//! Server and client configuration.

use std::path::PathBuf;

use atrium_world::tick::TickConfig;
use atrium_world::WorldConfig;
use serde::{Deserialize, Serialize};

/// The knob table. Defaults match the protocol documentation; every knob
/// can be overridden through an `ATRIUM_*` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Fixed physics step rate, Hz.
    pub tick_rate: u32,
    /// Player pose broadcast rate, Hz.
    pub network_rate: f64,
    /// Persistence flush period, seconds.
    pub save_interval: f64,
    /// Keepalive period, seconds.
    pub ping_rate: f64,
    /// `/admin` grant secret. Unset disables the command.
    pub admin_code: Option<String>,
    /// Upload cap, megabytes.
    pub max_upload_mb: u64,
    /// World identifier.
    pub world: String,
    /// WebSocket listen address.
    pub listen_addr: String,
    /// Persistence file path.
    pub persist_path: PathBuf,
    /// Show the local player's nametag.
    pub show_local_nametag: bool,
    /// Show remote players' nametags.
    pub show_remote_nametags: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_rate: 50,
            network_rate: 8.0,
            save_interval: 60.0,
            ping_rate: 1.0,
            admin_code: None,
            max_upload_mb: 100,
            world: "world".to_owned(),
            listen_addr: "0.0.0.0:8020".to_owned(),
            persist_path: PathBuf::from("world.json"),
            show_local_nametag: false,
            show_remote_nametags: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `ATRIUM_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("ATRIUM_TICK_RATE") {
            config.tick_rate = v;
        }
        if let Some(v) = env_parse("ATRIUM_NETWORK_RATE") {
            config.network_rate = v;
        }
        if let Some(v) = env_parse("ATRIUM_SAVE_INTERVAL") {
            config.save_interval = v;
        }
        if let Some(v) = env_parse("ATRIUM_PING_RATE") {
            config.ping_rate = v;
        }
        if let Ok(v) = std::env::var("ATRIUM_ADMIN_CODE") {
            if !v.is_empty() {
                config.admin_code = Some(v);
            }
        }
        if let Some(v) = env_parse("ATRIUM_MAX_UPLOAD_MB") {
            config.max_upload_mb = v;
        }
        if let Ok(v) = std::env::var("ATRIUM_WORLD") {
            if !v.is_empty() {
                config.world = v;
            }
        }
        if let Ok(v) = std::env::var("ATRIUM_LISTEN_ADDR") {
            if !v.is_empty() {
                config.listen_addr = v;
            }
        }
        if let Ok(v) = std::env::var("ATRIUM_PERSIST_PATH") {
            if !v.is_empty() {
                config.persist_path = PathBuf::from(v);
            }
        }
        config
    }

    /// The world configuration for the authoritative server.
    pub fn server_world(&self) -> WorldConfig {
        WorldConfig {
            tick: TickConfig {
                tick_rate: self.tick_rate,
                ..TickConfig::default()
            },
            network_rate: self.network_rate,
            is_server: true,
            local_session: None,
            show_local_nametag: self.show_local_nametag,
            show_remote_nametags: self.show_remote_nametags,
            ..WorldConfig::default()
        }
    }

    /// The upload cap in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }

    /// Seconds after which a silent peer is dropped (missed pongs).
    pub fn pong_timeout(&self) -> f64 {
        self.ping_rate * 3.0
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = Config::default();
        assert_eq!(config.tick_rate, 50);
        assert_eq!(config.network_rate, 8.0);
        assert_eq!(config.save_interval, 60.0);
        assert_eq!(config.ping_rate, 1.0);
        assert_eq!(config.admin_code, None);
        assert_eq!(config.max_upload_mb, 100);
        assert_eq!(config.world, "world");
    }

    #[test]
    fn upload_cap_is_in_bytes() {
        let config = Config {
            max_upload_mb: 2,
            ..Config::default()
        };
        assert_eq!(config.max_upload_bytes(), 2 * 1024 * 1024);
    }

    #[test]
    fn pong_timeout_scales_with_ping_rate() {
        let config = Config {
            ping_rate: 2.0,
            ..Config::default()
        };
        assert_eq!(config.pong_timeout(), 6.0);
    }
}
