//! Layered configuration: defaults, overridden by an optional TOML file,
//! overridden by the four recognised environment variables.
//! Mirrors the `clap` + `serde` + `toml` `Config::load()` shape.

use std::fs::read_to_string;
use std::net::IpAddr;

use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Caster {
    #[serde(default = "Caster::host")]
    pub host: IpAddr,
    #[serde(default = "Caster::port")]
    pub port: u16,
    #[serde(default = "Caster::operator")]
    pub operator: String,
    #[serde(default = "Caster::country")]
    pub country: String,
    #[serde(default = "Caster::network")]
    pub network: String,
    #[serde(default)]
    pub centroid_lat: f64,
    #[serde(default)]
    pub centroid_lon: f64,
}

impl Caster {
    fn host() -> IpAddr {
        "0.0.0.0".parse().unwrap()
    }

    fn port() -> u16 {
        9001
    }

    fn operator() -> String {
        "NTRIP Relay Service".to_string()
    }

    fn country() -> String {
        "VNM".to_string()
    }

    fn network() -> String {
        "CORS".to_string()
    }
}

impl Default for Caster {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: Self::port(),
            operator: Self::operator(),
            country: Self::country(),
            network: Self::network(),
            centroid_lat: 0.0,
            centroid_lon: 0.0,
        }
    }
}

/// Options governing the Source Client side, such as the antenna
/// altitude reported in the synthetic keep-alive position.
#[derive(Deserialize, Debug)]
pub struct Source {
    #[serde(default = "Source::keepalive_altitude_m")]
    pub keepalive_altitude_m: f64,
}

impl Source {
    fn keepalive_altitude_m() -> f64 {
        100.0
    }
}

impl Default for Source {
    fn default() -> Self {
        Self { keepalive_altitude_m: Self::keepalive_altitude_m() }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub caster: Caster,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub log: Log,
}

impl Default for Config {
    fn default() -> Self {
        Self { caster: Caster::default(), source: Source::default(), log: Log::default() }
    }
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Parse CLI flags, load the TOML file they name (if any), then
    /// apply the named environment variable overrides last, so an
    /// operator can override a checked-in config file at deploy time
    /// without editing it.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let cfg_str = match cli.config {
            Some(path) => read_to_string(&path).map_err(|e| anyhow::anyhow!("reading config file {path}: {e}"))?,
            None => String::new(),
        };

        let mut config: Config = if cfg_str.trim().is_empty() {
            Config::default()
        } else {
            toml::from_str(&cfg_str).map_err(|e| anyhow::anyhow!("parsing config file: {e}"))?
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("NTRIP_CASTER_HOST") {
            if let Ok(parsed) = host.parse() {
                self.caster.host = parsed;
            }
        }
        if let Ok(port) = std::env::var("NTRIP_CASTER_PORT") {
            if let Ok(parsed) = port.parse() {
                self.caster.port = parsed;
            }
        }
        if let Ok(operator) = std::env::var("NTRIP_CASTER_OPERATOR") {
            self.caster.operator = operator;
        }
        if let Ok(level) = std::env::var("NTRIP_CASTER_LOG_LEVEL") {
            if let Some(parsed) = LogLevel::parse(&level) {
                self.log.level = parsed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.caster.port, 9001);
        assert_eq!(config.caster.operator, "NTRIP Relay Service");
        assert_eq!(config.caster.host.to_string(), "0.0.0.0");
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("NTRIP_CASTER_PORT", "9100");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.caster.port, 9100);
        std::env::remove_var("NTRIP_CASTER_PORT");
    }
}
