use clap::{ArgAction, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::ws::Liveness;

/// Command line flags. Only flags actually given on the command line are
/// layered over the TOML file and environment; unset flags leave those alone.
#[derive(Parser, Serialize, Clone, Debug)]
#[command(name = "devlink-server", version, about = "Device state sync server")]
pub struct Cli {
    /// HTTP API port [default: 3002]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Dedicated device WebSocket port (devices connect to ws://host:<ws_port>/), 0 disables it [default: 3001]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// JSON document holding users and devices [default: ./data.json]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_file: Option<String>,

    /// Seconds between keepalive pings to each device, 0 disables them [default: 30]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_interval_secs: Option<u64>,

    /// Seconds a device has to answer a ping [default: 10]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pong_timeout_secs: Option<u64>,

    /// Enable structured JSON logging
    #[arg(long, action = ArgAction::SetTrue)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Path to TOML config file
    #[arg(long, default_value = "./devlink.toml")]
    #[serde(skip)]
    pub config: String,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,
}

/// Effective server settings after layering.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub port: u16,
    pub ws_port: u16,
    pub bind_address: String,
    pub data_file: String,
    pub json_logs: bool,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3002,
            ws_port: 3001,
            bind_address: "0.0.0.0".to_string(),
            data_file: "./data.json".to_string(),
            json_logs: false,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (DEVLINK_*) < CLI args
    pub fn load(cli: &Cli) -> Result<Self, figment::Error> {
        Self::figment(cli).extract()
    }

    pub fn figment(cli: &Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("DEVLINK_"))
            .merge(Serialized::defaults(cli))
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::from_secs(self.ping_interval_secs, self.pong_timeout_secs)
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Device sync server configuration
# Place this file at ./devlink.toml or specify with --config <path>
# All settings can be overridden via environment variables (DEVLINK_PORT, etc.)
# or CLI flags (--port, etc.)

# HTTP API port (default: 3002)
# port = 3002

# Dedicated WebSocket port for devices (default: 3001, 0 disables it).
# Devices can also connect to /ws on the HTTP port.
# ws_port = 3001

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# JSON document with users and devices; created empty if missing
# data_file = "./data.json"

# Keepalive: ping every device this often, drop it if no pong within the timeout.
# ping_interval_secs = 0 disables the keepalive.
# ping_interval_secs = 30
# pong_timeout_secs = 10

# Enable structured JSON logging
# json_logs = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("devlink-server").chain(args.iter().copied())).unwrap()
    }

    fn write_toml(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("devlink.toml");
        std::fs::write(&path, body).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_defaults_without_file_or_flags() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let config = Config::figment(&cli(&["--config", missing.to_str().unwrap()]))
            .extract::<Config>()
            .unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.liveness(), Liveness::default());
    }

    #[test]
    fn test_toml_file_applies_when_no_flags_given() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            &dir,
            "port = 4000\ndata_file = \"/srv/x.json\"\nping_interval_secs = 5\n",
        );

        let config = Config::load(&cli(&["--config", &path])).unwrap();

        assert_eq!(config.port, 4000);
        assert_eq!(config.data_file, "/srv/x.json");
        assert_eq!(config.ping_interval_secs, 5);
        assert_eq!(config.ws_port, 3001);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_cli_flags_override_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(&dir, "port = 4000\njson_logs = true\nws_port = 4001\n");

        let config = Config::load(&cli(&["--config", &path, "--port", "5000", "--ws-port", "0"]))
            .unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.ws_port, 0);
        // Not given on the command line, so the file wins
        assert!(config.json_logs);
    }

    #[test]
    fn test_template_is_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(&dir, &generate_config_template());

        let config = Config::load(&cli(&["--config", &path])).unwrap();
        assert_eq!(config, Config::default());
    }
}
