use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BinderError, Result};
use crate::masking::{MaskingMode, TolerateFaultsMode};

/// How [`ReliableBinder::close`](crate::binder::ReliableBinder::close) shuts
/// the current channel down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseShape {
    /// Wait for pending operations, then close.
    #[default]
    Plain,
    /// Close the output session and drain inbound messages before closing.
    DuplexSession,
    /// Drain and close inbound requests before closing.
    ReplySession,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderConfig {
    /// Default masking mode for calls that do not pass one. Only `NONE` and
    /// `ALL` are accepted.
    pub masking_mode: MaskingMode,
    pub tolerate_faults: TolerateFaultsMode,
    pub close_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Leaders open the channel they obtain. Server binders are handed
    /// channels that are already open.
    pub must_open_channel: bool,
    /// Close shuts the current channel down instead of leaving it to its owner.
    pub must_close_channel: bool,
    /// Receives may lead a channel creation.
    pub can_get_channel_for_receive: bool,
    pub close_shape: CloseShape,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            masking_mode: MaskingMode::NONE,
            tolerate_faults: TolerateFaultsMode::Always,
            close_timeout_ms: 60_000,
            send_timeout_ms: 60_000,
            must_open_channel: true,
            must_close_channel: true,
            can_get_channel_for_receive: true,
            close_shape: CloseShape::Plain,
        }
    }
}

impl BinderConfig {
    /// Default close timeout.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Default send timeout.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Rejects partial masking modes as a binder default.
    pub fn validate(&self) -> Result<()> {
        if self.masking_mode != MaskingMode::NONE && self.masking_mode != MaskingMode::ALL {
            return Err(BinderError::invalid_state(
                "BinderConfig.masking_mode",
                self.masking_mode,
            ));
        }
        Ok(())
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(contents: &str) -> anyhow::Result<Self> {
        let config: BinderConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "json" => Self::from_json_str(&contents),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = BinderConfig::default();
        assert_eq!(config.masking_mode, MaskingMode::NONE);
        assert_eq!(config.tolerate_faults, TolerateFaultsMode::Always);
        assert_eq!(config.close_timeout(), Duration::from_secs(60));
        assert!(config.must_open_channel);
        assert!(config.must_close_channel);
        assert!(config.can_get_channel_for_receive);
        assert_eq!(config.close_shape, CloseShape::Plain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_partial_masks() {
        let config = BinderConfig {
            masking_mode: MaskingMode::HANDLED,
            ..BinderConfig::default()
        };
        assert!(config.validate().is_err());
        let config = BinderConfig {
            masking_mode: MaskingMode::ALL,
            ..BinderConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = BinderConfig::from_json_str(
            r#"{ "tolerate_faults": "never", "send_timeout_ms": 250, "close_shape": "duplex_session" }"#,
        )
        .unwrap();
        assert_eq!(config.tolerate_faults, TolerateFaultsMode::Never);
        assert_eq!(config.send_timeout(), Duration::from_millis(250));
        assert_eq!(config.close_shape, CloseShape::DuplexSession);
        assert_eq!(config.close_timeout_ms, 60_000);
    }

    #[test]
    fn test_from_json_str_rejects_invalid_mask() {
        assert!(BinderConfig::from_json_str(r#"{ "masking_mode": 2 }"#).is_err());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{ "masking_mode": 3, "must_open_channel": false, "close_timeout_ms": 1500 }}"#
        )
        .unwrap();
        let config = BinderConfig::from_file(file.path()).unwrap();
        assert_eq!(config.masking_mode, MaskingMode::ALL);
        assert!(!config.must_open_channel);
        assert_eq!(config.close_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(BinderConfig::from_file(file.path()).is_err());
    }
}
