//! Channel configuration.

use crate::error::{ChannelError, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Default frame cap in both directions (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default side-channel cap in both directions (1 GiB)
pub const DEFAULT_MAX_STREAM_SIZE: u64 = 1024 * 1024 * 1024;

/// Configuration for a channel and every session it owns
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Address `start_listening` binds
    pub listen_addr: SocketAddr,
    /// Target of `connect()`
    pub remote_endpoint: Option<SocketAddr>,
    /// Largest frame this side will send
    pub max_send_message_size: usize,
    /// Largest frame this side will accept
    pub max_receive_message_size: usize,
    /// Largest side-channel stream this side will send
    pub max_send_stream_size: u64,
    /// Largest side-channel stream this side will accept
    pub max_receive_stream_size: u64,
    /// Folder where received streams are materialized
    pub temp_stream_folder: PathBuf,
    /// Whether `connect_to` reuses a live session to the same endpoint
    pub session_reusable: bool,
    /// Per-call timeout when the caller gives none
    pub default_timeout: Duration,
    /// Timeout for error responses sent on behalf of a failed handler
    pub error_response_timeout: Duration,
    /// Idle time after which a session's ordered dispatch worker exits
    pub dispatch_idle_timeout: Duration,
    /// Queued-message count at which a session warns that its handler is falling behind
    pub dispatch_backlog_warning: usize,
    /// Buffer size of the session state broadcast
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            remote_endpoint: None,
            max_send_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_receive_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_send_stream_size: DEFAULT_MAX_STREAM_SIZE,
            max_receive_stream_size: DEFAULT_MAX_STREAM_SIZE,
            temp_stream_folder: std::env::temp_dir(),
            session_reusable: true,
            default_timeout: Duration::from_secs(30),
            error_response_timeout: Duration::from_secs(5),
            dispatch_idle_timeout: Duration::from_secs(30),
            dispatch_backlog_warning: 1024,
            event_capacity: 256,
        }
    }
}

impl ChannelConfig {
    /// Check limits and probe the temp stream folder.
    ///
    /// The folder is created if missing, then a probe file is written, read
    /// back and deleted.
    pub fn validate(&self) -> Result<()> {
        if self.max_send_message_size == 0 || self.max_receive_message_size == 0 {
            return Err(ChannelError::Config(
                "message size limits must be non-zero".to_string(),
            ));
        }
        if self.max_send_stream_size == 0 || self.max_receive_stream_size == 0 {
            return Err(ChannelError::Config(
                "stream size limits must be non-zero".to_string(),
            ));
        }
        if self.default_timeout.is_zero() || self.error_response_timeout.is_zero() {
            return Err(ChannelError::Config("timeouts must be non-zero".to_string()));
        }
        if self.dispatch_idle_timeout.is_zero() || self.dispatch_backlog_warning == 0 {
            return Err(ChannelError::Config(
                "dispatch idle timeout and backlog warning must be non-zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ChannelError::Config(
                "event capacity must be non-zero".to_string(),
            ));
        }

        self.probe_temp_folder()
    }

    fn probe_temp_folder(&self) -> Result<()> {
        let folder = &self.temp_stream_folder;
        let probe_err = |op: &str, e: std::io::Error| {
            ChannelError::Config(format!(
                "temp stream folder {} failed {} check: {}",
                folder.display(),
                op,
                e
            ))
        };

        std::fs::create_dir_all(folder).map_err(|e| probe_err("create", e))?;

        let probe = folder.join(format!(".rpc-probe-{}", uuid::Uuid::new_v4()));
        let content = b"probe";
        std::fs::write(&probe, content).map_err(|e| probe_err("write", e))?;

        let read_back = std::fs::read(&probe);
        let removed = std::fs::remove_file(&probe);
        let read_back = read_back.map_err(|e| probe_err("read", e))?;
        removed.map_err(|e| probe_err("delete", e))?;

        if read_back != content {
            return Err(ChannelError::Config(format!(
                "temp stream folder {} returned different probe content",
                folder.display()
            )));
        }

        debug!("Temp stream folder {} passed permission check", folder.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ChannelConfig::default();
        assert_eq!(config.max_send_message_size, 16 * 1024 * 1024);
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert!(config.session_reusable);
        config.validate().unwrap();
    }

    #[test]
    fn test_probe_creates_missing_folder_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("nested").join("streams");
        let config = ChannelConfig {
            temp_stream_folder: folder.clone(),
            ..ChannelConfig::default()
        };

        config.validate().unwrap();
        assert!(folder.is_dir());
        assert_eq!(std::fs::read_dir(&folder).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_zero_limits() {
        let config = ChannelConfig {
            max_send_stream_size: 0,
            ..ChannelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChannelError::Config(_))));

        let config = ChannelConfig {
            default_timeout: Duration::ZERO,
            ..ChannelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChannelError::Config(_))));
    }

    #[test]
    fn test_rejects_folder_that_is_a_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = ChannelConfig {
            temp_stream_folder: file.path().to_path_buf(),
            ..ChannelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChannelError::Config(_))));
    }
}
