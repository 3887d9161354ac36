//! Cache configuration. Invalid sizing, the reserved mode, and unknown
//! plugin names are all fatal at init and surface as [`ConfigError`].

use serde::Serialize;
use thiserror::Error;

/// Cache operating mode.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Mode {
    Standard,
    /// Every block present upstream is present here in a non-Invalid state.
    Inclusive,
    /// Reserved; rejected at init.
    Exclusive,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("num_ways must be > 0, got {0}")]
    InvalidWays(usize),
    #[error("num_rows must be a power of two > 0, got {0}")]
    InvalidRows(usize),
    #[error("blocksize must be a power of two > 0, got {0}")]
    InvalidBlockSize(usize),
    #[error("cache mode {0} is not implemented")]
    UnsupportedMode(Mode),
    #[error("unknown prefetcher module {0:?}")]
    UnknownPrefetcher(String),
    #[error("cache has no downstream path (downstream, directory or snoop link required)")]
    NoDownstreamPath,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Associativity.
    pub num_ways: usize,
    /// Number of sets; power of two.
    pub num_rows: usize,
    /// Bytes per block.
    pub blocksize: usize,
    pub mode: Mode,
    /// Access latency, in simulation ticks, for self-link scheduling.
    pub access_time: u64,
    /// Upstream links to configure. CPU, if present, is upstream link 0.
    pub num_upstream: usize,
    /// Symbolic name of the next level, or "NONE".
    pub next_level: String,
    /// Network address for the directory link; empty for none.
    pub net_addr: String,
    /// Listener plugin name; empty selects the null listener.
    pub prefetcher: String,
    /// Explicit role override. `None` keeps the default behavior of
    /// detecting L1 from the first CPU request, which is fragile under
    /// prefetcher-only traffic.
    pub is_l1: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_ways: 2,
            num_rows: 2,
            blocksize: 64,
            mode: Mode::Standard,
            access_time: 1,
            num_upstream: 1,
            next_level: "NONE".into(),
            net_addr: String::new(),
            prefetcher: String::new(),
            is_l1: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_ways == 0 {
            return Err(ConfigError::InvalidWays(self.num_ways));
        }
        if self.num_rows == 0 || !self.num_rows.is_power_of_two() {
            return Err(ConfigError::InvalidRows(self.num_rows));
        }
        if self.blocksize == 0 || !self.blocksize.is_power_of_two() {
            return Err(ConfigError::InvalidBlockSize(self.blocksize));
        }
        if self.mode == Mode::Exclusive {
            return Err(ConfigError::UnsupportedMode(self.mode));
        }
        Ok(())
    }

    /// The configured next-level name, with "NONE" mapped away.
    #[must_use]
    pub fn next_level_name(&self) -> Option<&str> {
        match self.next_level.as_str() {
            "" | "NONE" => None,
            name => Some(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn exclusive_mode_is_rejected() {
        let config = Config {
            mode: Mode::Exclusive,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedMode(Mode::Exclusive))
        ));
    }

    #[test]
    fn rows_must_be_power_of_two() {
        let config = Config {
            num_rows: 3,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRows(3))
        ));
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!(Mode::from_str("INCLUSIVE").unwrap(), Mode::Inclusive);
        assert_eq!(Mode::from_str("standard").unwrap(), Mode::Standard);
        assert!(Mode::from_str("bogus").is_err());
    }

    #[test]
    fn next_level_none_maps_away() {
        let mut config = Config::default();
        assert_eq!(config.next_level_name(), None);
        config.next_level = "l2".into();
        assert_eq!(config.next_level_name(), Some("l2"));
    }
}
