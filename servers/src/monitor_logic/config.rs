use clap::Parser;
use lib_fleet::core::{SessionContext, SessionSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "floor_monitor.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Shop-floor fleet telemetry monitor", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FLEET_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FLEET_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FLEET_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "FLEET_SOCKET_URL", help = "Telemetry WebSocket URL.")]
    pub socket_url: Option<String>,

    #[clap(long, env = "FLEET_APIS_URL", help = "Base URL of the cloud API.")]
    pub apis_url: Option<String>,

    #[clap(long, env = "FLEET_EDGE_URL", help = "Base URL of the edge gateway.")]
    pub edge_url: Option<String>,

    #[clap(long, env = "FLEET_BARO_URL", help = "Base URL of the monitoring backend.")]
    pub baro_url: Option<String>,

    #[clap(long, env = "FLEET_TOKEN", help = "Session credential sent as X-Access-Token and in the socket handshake.")]
    pub token: Option<String>,

    #[clap(long, env = "FLEET_SENDER", help = "Sender identity attached to outbound requests.")]
    pub sender: Option<String>,

    #[clap(long, env = "FLEET_HARD_REFRESH_MS", help = "Session lifetime in milliseconds before an unconditional reload.")]
    pub hard_refresh_ms: Option<u64>,

    #[clap(long, env = "FLEET_COMPLETION_REFRESH_DELAY_MS", help = "Delay in milliseconds before re-reading a completion time.")]
    pub completion_refresh_delay_ms: Option<u64>,

    #[clap(long, env = "FLEET_REGISTRATION_SETTLE_MS", help = "Delay in milliseconds between listing and registering data sources.")]
    pub registration_settle_ms: Option<u64>,

    #[clap(long, env = "FLEET_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "FLEET_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "FLEET_PAGE_SIZE", help = "Machines shown per board page.")]
    pub page_size: Option<usize>,

    #[clap(long, env = "FLEET_PAGE_INTERVAL_MS", help = "Board page rotation interval in milliseconds.")]
    pub page_interval_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            socket_url: other.socket_url.or(self.socket_url),
            apis_url: other.apis_url.or(self.apis_url),
            edge_url: other.edge_url.or(self.edge_url),
            baro_url: other.baro_url.or(self.baro_url),
            token: other.token.or(self.token),
            sender: other.sender.or(self.sender),
            hard_refresh_ms: other.hard_refresh_ms.or(self.hard_refresh_ms),
            completion_refresh_delay_ms: other.completion_refresh_delay_ms.or(self.completion_refresh_delay_ms),
            registration_settle_ms: other.registration_settle_ms.or(self.registration_settle_ms),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            page_size: other.page_size.or(self.page_size),
            page_interval_ms: other.page_interval_ms.or(self.page_interval_ms),
        }
    }

    fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            socket_url: Some("ws://localhost:8080/socket".to_string()),
            apis_url: Some("http://localhost:8081".to_string()),
            edge_url: Some("http://localhost:8082".to_string()),
            baro_url: Some("http://localhost:8083".to_string()),
            hard_refresh_ms: Some(1_200_000),
            completion_refresh_delay_ms: Some(2_000),
            registration_settle_ms: Some(100),
            reconnect_base_delay_ms: Some(1_000),
            reconnect_max_delay_ms: Some(60_000),
            page_size: Some(13),
            page_interval_ms: Some(10_000),
            ..Default::default()
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext::new(self.token.clone(), self.sender.clone())
    }

    pub fn session_settings(&self) -> SessionSettings {
        let defaults = SessionSettings::default();
        SessionSettings {
            hard_refresh: self.hard_refresh_ms.map(Duration::from_millis).unwrap_or(defaults.hard_refresh),
            completion_refresh_delay: self
                .completion_refresh_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.completion_refresh_delay),
            registration_settle: self
                .registration_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.registration_settle),
        }
    }

    pub fn reconnect_delays(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.reconnect_base_delay_ms.unwrap_or(1_000)),
            Duration::from_millis(self.reconnect_max_delay_ms.unwrap_or(60_000)),
        )
    }

    pub fn page_size(&self) -> usize {
        self.page_size.filter(|size| *size > 0).unwrap_or(13)
    }

    pub fn page_interval(&self) -> Duration {
        Duration::from_millis(self.page_interval_ms.unwrap_or(10_000))
    }
}

/// Reads a JSON config file. `None` when the file is missing or unreadable.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    let Ok(config_str) = fs::read_to_string(path) else {
        log::warn!("Failed to read config file: {}. Falling back to other sources.", path.display());
        return None;
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(file_config) => Some(file_config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, then the config file, then CLI/env values.
pub fn resolve_config(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

pub fn load_config() -> Config {
    resolve_config(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floor_monitor.conf");
        let mut file = fs::File::create(&path).unwrap();
        write!(file, r#"{{ "pageSize": 20, "socketUrl": "ws://file/socket", "sender": "file" }}"#).unwrap();

        let cli = Config {
            config_path: Some(path.clone()),
            sender: Some("cli".to_string()),
            ..Default::default()
        };
        let config = resolve_config(cli);

        assert_eq!(config.page_size(), 20);
        assert_eq!(config.socket_url.as_deref(), Some("ws://file/socket"));
        assert_eq!(config.sender.as_deref(), Some("cli"));
        assert_eq!(config.hard_refresh_ms, Some(1_200_000));
        assert_eq!(config.config_path, Some(path));
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.conf");
        fs::write(&path, "not json").unwrap();

        let config = resolve_config(Config {
            config_path: Some(path),
            ..Default::default()
        });
        assert_eq!(config.page_interval(), Duration::from_secs(10));
        assert_eq!(config.session_settings(), SessionSettings::default());
    }

    #[test]
    fn cli_flags_parse() {
        let cli = Config::try_parse_from(["floor_monitor", "--token", "abc", "--page-size", "0"]).unwrap();
        assert_eq!(cli.session_context().credential.as_deref(), Some("abc"));
        // A zero page size would stall the board.
        assert_eq!(cli.page_size(), 13);
    }
}
