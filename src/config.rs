//! Process-wide settings, fixed at startup.
//!
//! A `Config` is built once (defaults, TOML file, command-line overrides),
//! validated, wrapped in an `Arc` and handed to every component. Nothing in the
//! crate mutates it afterwards.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{ConnId, CryptoTcpError, Result};

/// Configuration shared by the server, its connections and clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the server, dial address for clients
    pub addr: String,
    /// Upper bound on bytes consumed per raw socket read
    pub read_chunk_size: usize,
    /// RSA modulus size in bits
    pub rsa_bits: usize,
    /// Session key length in bytes (16, 24 or 32)
    pub session_key_len: usize,
    /// Number of client ids the server can hand out
    pub pool_capacity: usize,
    /// Well-known id of the server as a message endpoint
    pub server_id: ConnId,
    /// First client id; pool slot `n` maps to `start_conn_id + n`
    pub start_conn_id: ConnId,
    /// Completed frames buffered per connection before reads stall
    pub frame_queue_size: usize,
    /// Messages buffered between connection readers and the dispatcher
    pub msg_chan_size: usize,
    /// Closed connections buffered before the close task drains them
    pub exit_chan_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:7730".to_string(),
            read_chunk_size: 1024,
            rsa_bits: 2048,
            session_key_len: 16,
            pool_capacity: 1000,
            server_id: 1000,
            start_conn_id: 1001,
            frame_queue_size: 64,
            msg_chan_size: 64,
            exit_chan_size: 8,
        }
    }
}

impl Config {
    /// Load a config from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| CryptoTcpError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CryptoTcpError::InvalidConfig(e.to_string()))
    }

    /// Highest client id the pool can produce.
    pub fn last_conn_id(&self) -> u64 {
        self.start_conn_id as u64 + self.pool_capacity as u64 - 1
    }

    /// Whether `id` falls inside the client id range.
    pub fn is_client_id(&self, id: ConnId) -> bool {
        id >= self.start_conn_id && (id as u64) <= self.last_conn_id()
    }

    /// Reject settings the rest of the crate cannot work with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(CryptoTcpError::InvalidConfig(msg.to_string()));

        if self.read_chunk_size == 0 {
            return invalid("read_chunk_size must be at least 1");
        }
        if !matches!(self.session_key_len, 16 | 24 | 32) {
            return invalid("session_key_len must be 16, 24 or 32");
        }
        // PKCS#1 v1.5 needs 11 bytes of padding around the session key.
        if self.rsa_bits / 8 < self.session_key_len + 11 {
            return invalid("rsa_bits too small to carry the session key");
        }
        if self.pool_capacity == 0 {
            return invalid("pool_capacity must be at least 1");
        }
        if self.last_conn_id() > ConnId::MAX as u64 {
            return invalid("client id range overflows");
        }
        if self.is_client_id(self.server_id) {
            return invalid("server_id must lie outside the client id range");
        }
        if self.frame_queue_size == 0 || self.msg_chan_size == 0 || self.exit_chan_size == 0 {
            return invalid("channel sizes must be at least 1");
        }
        Ok(())
    }
}
