use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "ralph-monitor.yaml";
pub const DEFAULT_LOG_DIR: &str = ".ralph-monitor/logs";

#[derive(Parser, Debug)]
#[command(name = "ralph-monitor", about = "Live monitor for autonomous agent loops")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub config: String,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = 20)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 5)]
    pub write_timeout: u64,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub config_path: PathBuf,
    pub port_override: Option<u16>,
    pub debug: bool,
    pub log_dir: String,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
}

impl Settings {
    pub fn load() -> Self {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Self {
        Self {
            config_path: PathBuf::from(resolve_with_env(
                &args.config,
                "RMON_CONFIG",
                DEFAULT_CONFIG_PATH,
            )),
            port_override: args.port,
            debug: args.debug || env_true("RMON_DEBUG"),
            log_dir: resolve_with_env(&args.log_dir, "RMON_LOG_DIR", DEFAULT_LOG_DIR),
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        }
    }
}

fn resolve_with_env(flag: &str, key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_with_defaults() {
        let args = Args::parse_from(["ralph-monitor", "--port", "4000", "--config", "hosts.yaml"]);
        assert_eq!(args.port, Some(4000));
        let settings = Settings::from_args(args);
        assert_eq!(settings.config_path, PathBuf::from("hosts.yaml"));
        assert_eq!(settings.port_override, Some(4000));
        assert_eq!(settings.ping_interval, Duration::from_secs(20));
        assert_eq!(settings.write_timeout, Duration::from_secs(5));
    }

    #[test]
    fn explicit_flag_beats_env_and_default() {
        assert_eq!(
            resolve_with_env("flag", "RMON_TEST_UNSET_KEY", "fallback"),
            "flag"
        );
        assert_eq!(
            resolve_with_env("  ", "RMON_TEST_UNSET_KEY", "fallback"),
            "fallback"
        );
    }
}
