//! Configuration handling for the channel node.
//!
//! Settings come from the `channel:` section of a YAML file, then from
//! environment variables, then from command line flags applied by `main`.

use anyhow::{Context, Result};
use channel_session::ChannelConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Channel node configuration
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Settings handed to the channel
    pub channel: ChannelConfig,
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    channel: Option<ChannelSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelSection {
    listen_addr: Option<SocketAddr>,
    remote_endpoint: Option<SocketAddr>,
    max_send_message_size: Option<usize>,
    max_receive_message_size: Option<usize>,
    max_send_stream_size: Option<u64>,
    max_receive_stream_size: Option<u64>,
    temp_stream_folder: Option<PathBuf>,
    session_reusable: Option<bool>,
    default_timeout: Option<String>,
    error_response_timeout: Option<String>,
    dispatch_idle_timeout: Option<String>,
    dispatch_backlog_warning: Option<usize>,
    event_capacity: Option<usize>,
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {}", key, value))
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Self {
        let path = config_path.as_ref();
        let mut config = match Self::read_file(path) {
            Ok(config) => {
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) => {
                warn!("{:#}, using defaults", e);
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok());

        info!(
            "Final channel configuration: listen={}, remote={:?}, default_timeout={:?}, temp_folder={:?}",
            config.channel.listen_addr,
            config.channel.remote_endpoint,
            config.channel.default_timeout,
            config.channel.temp_stream_folder
        );
        config
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Config file {:?} not readable", path))?;
        let root: RootConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;

        let mut config = Self::default();
        if let Some(section) = root.channel {
            config
                .apply_section(section)
                .with_context(|| format!("Invalid channel section in {:?}", path))?;
        }
        Ok(config)
    }

    fn apply_section(&mut self, section: ChannelSection) -> Result<()> {
        let channel = &mut self.channel;

        if let Some(addr) = section.listen_addr {
            channel.listen_addr = addr;
        }
        if section.remote_endpoint.is_some() {
            channel.remote_endpoint = section.remote_endpoint;
        }
        if let Some(size) = section.max_send_message_size {
            channel.max_send_message_size = size;
        }
        if let Some(size) = section.max_receive_message_size {
            channel.max_receive_message_size = size;
        }
        if let Some(size) = section.max_send_stream_size {
            channel.max_send_stream_size = size;
        }
        if let Some(size) = section.max_receive_stream_size {
            channel.max_receive_stream_size = size;
        }
        if let Some(folder) = section.temp_stream_folder {
            channel.temp_stream_folder = folder;
        }
        if let Some(reusable) = section.session_reusable {
            channel.session_reusable = reusable;
        }
        if let Some(value) = section.default_timeout {
            channel.default_timeout = parse_duration("default_timeout", &value)?;
        }
        if let Some(value) = section.error_response_timeout {
            channel.error_response_timeout = parse_duration("error_response_timeout", &value)?;
        }
        if let Some(value) = section.dispatch_idle_timeout {
            channel.dispatch_idle_timeout = parse_duration("dispatch_idle_timeout", &value)?;
        }
        if let Some(backlog) = section.dispatch_backlog_warning {
            channel.dispatch_backlog_warning = backlog;
        }
        if let Some(capacity) = section.event_capacity {
            channel.event_capacity = capacity;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CHANNEL_LISTEN_ADDR") {
            match value.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.channel.listen_addr = addr;
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(e) => warn!("Ignoring CHANNEL_LISTEN_ADDR={}: {}", value, e),
            }
        }

        if let Some(value) = lookup("CHANNEL_REMOTE_ENDPOINT") {
            match value.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.channel.remote_endpoint = Some(addr);
                    info!("Remote endpoint overridden by environment: {}", addr);
                }
                Err(e) => warn!("Ignoring CHANNEL_REMOTE_ENDPOINT={}: {}", value, e),
            }
        }

        if let Some(value) = lookup("CHANNEL_DEFAULT_TIMEOUT") {
            match parse_duration("CHANNEL_DEFAULT_TIMEOUT", &value) {
                Ok(timeout) => {
                    self.channel.default_timeout = timeout;
                    info!("Default timeout overridden by environment: {:?}", timeout);
                }
                Err(e) => warn!("Ignoring {:#}", e),
            }
        }

        if let Some(value) = lookup("CHANNEL_TEMP_FOLDER") {
            self.channel.temp_stream_folder = PathBuf::from(&value);
            info!("Temp stream folder overridden by environment: {}", value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.channel.default_timeout, Duration::from_secs(30));
        assert!(config.channel.remote_endpoint.is_none());
    }

    #[test]
    fn test_read_channel_section() {
        let file = write_config(
            r#"
channel:
  listen_addr: 0.0.0.0:9100
  remote_endpoint: 10.0.0.5:9100
  max_receive_stream_size: 4096
  session_reusable: false
  default_timeout: 1m 30s
  error_response_timeout: 250ms
"#,
        );

        let config = NodeConfig::read_file(file.path()).unwrap();
        assert_eq!(config.channel.listen_addr, "0.0.0.0:9100".parse().unwrap());
        assert_eq!(
            config.channel.remote_endpoint,
            Some("10.0.0.5:9100".parse().unwrap())
        );
        assert_eq!(config.channel.max_receive_stream_size, 4096);
        assert!(!config.channel.session_reusable);
        assert_eq!(config.channel.default_timeout, Duration::from_secs(90));
        assert_eq!(
            config.channel.error_response_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.channel.max_send_message_size, ChannelConfig::default().max_send_message_size);
    }

    #[test]
    fn test_bad_duration_falls_back_to_defaults() {
        let file = write_config("channel:\n  default_timeout: soon\n");
        assert!(NodeConfig::read_file(file.path()).is_err());

        let config = NodeConfig::load_from_file(file.path());
        assert_eq!(config.channel.default_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = NodeConfig::load_from_file("/nonexistent/channel-config.yaml");
        assert_eq!(
            config.channel.max_send_stream_size,
            ChannelConfig::default().max_send_stream_size
        );
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("CHANNEL_LISTEN_ADDR", "127.0.0.1:7000"),
            ("CHANNEL_REMOTE_ENDPOINT", "not-an-address"),
            ("CHANNEL_DEFAULT_TIMEOUT", "2s"),
            ("CHANNEL_TEMP_FOLDER", "/var/tmp/streams"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_environment_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.channel.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert!(config.channel.remote_endpoint.is_none());
        assert_eq!(config.channel.default_timeout, Duration::from_secs(2));
        assert_eq!(
            config.channel.temp_stream_folder,
            PathBuf::from("/var/tmp/streams")
        );
    }
}
