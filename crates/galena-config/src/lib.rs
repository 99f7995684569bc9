//! # galena-config: configuration consumed by the replication core
//!
//! The surrounding system injects configuration as a key→value string map;
//! this crate provides the typed accessors for the keys the core consumes.
//! Unknown keys are preserved untouched (the same map is shared with
//! collaborators), unknown *values* for known keys are errors.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// `socket.checksum`: frame checksum kind index (0 none, 1 CRC-32,
/// 2 CRC-32C).
pub const SOCKET_CHECKSUM: &str = "socket.checksum";
/// `socket.recv_buf_size`: receive buffer size in bytes, or `auto`.
pub const SOCKET_RECV_BUF_SIZE: &str = "socket.recv_buf_size";
/// `socket.send_buf_size`: send buffer size in bytes, or `auto`.
pub const SOCKET_SEND_BUF_SIZE: &str = "socket.send_buf_size";
/// `repl.key_format`: key set format name.
pub const REPL_KEY_FORMAT: &str = "repl.key_format";
/// `repl.max_ws_size`: write set size cap in bytes.
pub const REPL_MAX_WS_SIZE: &str = "repl.max_ws_size";
/// `repl.proto_max`: highest write set protocol version to negotiate.
pub const REPL_PROTO_MAX: &str = "repl.proto_max";

const DEFAULT_CHECKSUM: u8 = 2; // CRC-32C
const DEFAULT_MAX_WS_SIZE: usize = 0x7fff_ffff;
const MAX_PROTO: u8 = 5;

/// Result type for configuration access.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised by configuration parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{key} out of range: {value}")]
    OutOfRange { key: &'static str, value: String },
}

/// Socket buffer sizing: kernel default or an explicit byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufSize {
    Auto,
    Bytes(usize),
}

/// Key set wire format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    Flat8,
    Flat8A,
    Flat16,
    Flat16A,
}

impl fmt::Display for KeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyFormat::Flat8 => "FLAT8",
            KeyFormat::Flat8A => "FLAT8A",
            KeyFormat::Flat16 => "FLAT16",
            KeyFormat::Flat16A => "FLAT16A",
        };
        f.write_str(name)
    }
}

/// The injected key→value configuration map.
#[derive(Debug, Clone, Default)]
pub struct Config {
    map: BTreeMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Frame checksum kind index; defaults to CRC-32C.
    pub fn checksum_index(&self) -> ConfigResult<u8> {
        match self.get(SOCKET_CHECKSUM) {
            None => Ok(DEFAULT_CHECKSUM),
            Some(value) => match value.parse::<u8>() {
                Ok(index @ 0..=2) => Ok(index),
                Ok(_) => Err(ConfigError::OutOfRange {
                    key: SOCKET_CHECKSUM,
                    value: value.to_string(),
                }),
                Err(_) => Err(ConfigError::InvalidValue {
                    key: SOCKET_CHECKSUM,
                    value: value.to_string(),
                }),
            },
        }
    }

    pub fn recv_buf_size(&self) -> ConfigResult<BufSize> {
        self.buf_size(SOCKET_RECV_BUF_SIZE)
    }

    pub fn send_buf_size(&self) -> ConfigResult<BufSize> {
        self.buf_size(SOCKET_SEND_BUF_SIZE)
    }

    fn buf_size(&self, key: &'static str) -> ConfigResult<BufSize> {
        match self.get(key) {
            None => Ok(BufSize::Auto),
            Some(value) if value.eq_ignore_ascii_case("auto") => Ok(BufSize::Auto),
            Some(value) => value
                .parse::<usize>()
                .map(BufSize::Bytes)
                .map_err(|_| ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                }),
        }
    }

    /// Key set wire format; defaults to FLAT8A.
    pub fn key_format(&self) -> ConfigResult<KeyFormat> {
        match self.get(REPL_KEY_FORMAT) {
            None => Ok(KeyFormat::Flat8A),
            Some(value) => match value.to_ascii_uppercase().as_str() {
                "FLAT8" => Ok(KeyFormat::Flat8),
                "FLAT8A" => Ok(KeyFormat::Flat8A),
                "FLAT16" => Ok(KeyFormat::Flat16),
                "FLAT16A" => Ok(KeyFormat::Flat16A),
                _ => Err(ConfigError::InvalidValue {
                    key: REPL_KEY_FORMAT,
                    value: value.to_string(),
                }),
            },
        }
    }

    /// Write set size cap in bytes.
    pub fn max_ws_size(&self) -> ConfigResult<usize> {
        match self.get(REPL_MAX_WS_SIZE) {
            None => Ok(DEFAULT_MAX_WS_SIZE),
            Some(value) => match value.parse::<usize>() {
                Ok(size) if size > 0 && size <= DEFAULT_MAX_WS_SIZE => Ok(size),
                Ok(_) => Err(ConfigError::OutOfRange {
                    key: REPL_MAX_WS_SIZE,
                    value: value.to_string(),
                }),
                Err(_) => Err(ConfigError::InvalidValue {
                    key: REPL_MAX_WS_SIZE,
                    value: value.to_string(),
                }),
            },
        }
    }

    /// Protocol version ceiling for write sets.
    pub fn proto_max(&self) -> ConfigResult<u8> {
        match self.get(REPL_PROTO_MAX) {
            None => Ok(MAX_PROTO),
            Some(value) => match value.parse::<u8>() {
                Ok(proto @ 1..=MAX_PROTO) => Ok(proto),
                Ok(_) => Err(ConfigError::OutOfRange {
                    key: REPL_PROTO_MAX,
                    value: value.to_string(),
                }),
                Err(_) => Err(ConfigError::InvalidValue {
                    key: REPL_PROTO_MAX,
                    value: value.to_string(),
                }),
            },
        }
    }
}

impl FromIterator<(String, String)> for Config {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.checksum_index().unwrap(), 2);
        assert_eq!(config.recv_buf_size().unwrap(), BufSize::Auto);
        assert_eq!(config.send_buf_size().unwrap(), BufSize::Auto);
        assert_eq!(config.key_format().unwrap(), KeyFormat::Flat8A);
        assert_eq!(config.max_ws_size().unwrap(), DEFAULT_MAX_WS_SIZE);
        assert_eq!(config.proto_max().unwrap(), 5);
    }

    #[test]
    fn test_checksum_values() {
        let mut config = Config::new();
        for (value, expected) in [("0", 0u8), ("1", 1), ("2", 2)] {
            config.set(SOCKET_CHECKSUM, value);
            assert_eq!(config.checksum_index().unwrap(), expected);
        }

        config.set(SOCKET_CHECKSUM, "3");
        assert!(matches!(
            config.checksum_index(),
            Err(ConfigError::OutOfRange { .. })
        ));
        config.set(SOCKET_CHECKSUM, "crc");
        assert!(matches!(
            config.checksum_index(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_buf_sizes() {
        let mut config = Config::new();
        config.set(SOCKET_RECV_BUF_SIZE, "auto");
        config.set(SOCKET_SEND_BUF_SIZE, "262144");
        assert_eq!(config.recv_buf_size().unwrap(), BufSize::Auto);
        assert_eq!(config.send_buf_size().unwrap(), BufSize::Bytes(262_144));

        config.set(SOCKET_SEND_BUF_SIZE, "lots");
        assert!(config.send_buf_size().is_err());
    }

    #[test]
    fn test_key_format_case_insensitive() {
        let mut config = Config::new();
        for (value, expected) in [
            ("flat8", KeyFormat::Flat8),
            ("FLAT8A", KeyFormat::Flat8A),
            ("Flat16", KeyFormat::Flat16),
            ("flat16a", KeyFormat::Flat16A),
        ] {
            config.set(REPL_KEY_FORMAT, value);
            assert_eq!(config.key_format().unwrap(), expected);
        }

        config.set(REPL_KEY_FORMAT, "TREE8");
        assert!(config.key_format().is_err());
    }

    #[test]
    fn test_proto_max_ceiling() {
        let mut config = Config::new();
        config.set(REPL_PROTO_MAX, "4");
        assert_eq!(config.proto_max().unwrap(), 4);

        config.set(REPL_PROTO_MAX, "6");
        assert!(matches!(
            config.proto_max(),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_max_ws_size_bounds() {
        let mut config = Config::new();
        config.set(REPL_MAX_WS_SIZE, "1048576");
        assert_eq!(config.max_ws_size().unwrap(), 1 << 20);

        config.set(REPL_MAX_WS_SIZE, "0");
        assert!(config.max_ws_size().is_err());
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let mut config = Config::new();
        config.set("gcs.fc_limit", "64");
        assert_eq!(config.get("gcs.fc_limit"), Some("64"));
        assert_eq!(config.checksum_index().unwrap(), 2);
    }
}
